use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::last_known::{LastKnownCache, Proximity, haversine_km};
use crate::broker::message::PositionEvent;

fn event(bus_id: &str, latitude: f64, longitude: f64, observed_at: i64) -> PositionEvent {
    PositionEvent {
        bus_id: bus_id.to_string(),
        latitude,
        longitude,
        observed_at,
    }
}

#[test]
fn test_record_keeps_newest() {
    let cache = LastKnownCache::new();
    assert!(cache.record(&event("7", 1.0, 1.0, 100)));
    assert!(cache.record(&event("7", 2.0, 2.0, 200)));
    assert!(!cache.record(&event("7", 3.0, 3.0, 150)));

    assert_eq!(cache.get("7"), Some(event("7", 2.0, 2.0, 200)));
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_record_same_timestamp_overwrites() {
    let cache = LastKnownCache::new();
    cache.record(&event("7", 1.0, 1.0, 100));
    assert!(cache.record(&event("7", 1.5, 1.5, 100)));
    assert_eq!(cache.get("7").unwrap().latitude, 1.5);
}

#[test]
fn test_get_unknown_bus() {
    let cache = LastKnownCache::new();
    assert!(cache.is_empty());
    assert_eq!(cache.get("nope"), None);
}

#[test]
fn test_snapshot_sorted_and_filtered() {
    let cache = LastKnownCache::new();
    // Tunis centre, La Marsa (~18 km) and Sfax (~230 km).
    cache.record(&event("tunis", 36.8065, 10.1815, 1));
    cache.record(&event("sfax", 34.7406, 10.7603, 1));
    cache.record(&event("marsa", 36.8782, 10.3247, 1));

    let all: Vec<_> = cache.snapshot(None).into_iter().map(|e| e.bus_id).collect();
    assert_eq!(all, vec!["marsa", "sfax", "tunis"]);

    let near = Proximity {
        latitude: 36.8065,
        longitude: 10.1815,
        radius_km: 25.0,
    };
    let nearby: Vec<_> = cache
        .snapshot(Some(&near))
        .into_iter()
        .map(|e| e.bus_id)
        .collect();
    assert_eq!(nearby, vec!["marsa", "tunis"]);
}

#[test]
fn test_haversine_distance() {
    assert_eq!(haversine_km(10.0, 20.0, 10.0, 20.0), 0.0);

    let paris_london = haversine_km(48.8566, 2.3522, 51.5074, -0.1278);
    assert!((340.0..347.0).contains(&paris_london), "{paris_london}");

    let antipodal = haversine_km(0.0, 0.0, 0.0, 180.0);
    assert!((antipodal - std::f64::consts::PI * 6371.0088).abs() < 1e-6);
}

#[test]
fn test_proximity_validation() {
    let ok = Proximity {
        latitude: 0.0,
        longitude: 0.0,
        radius_km: 5.0,
    };
    assert!(ok.validate().is_ok());
    assert!(Proximity { radius_km: -1.0, ..ok }.validate().is_err());
    assert!(Proximity { radius_km: f64::NAN, ..ok }.validate().is_err());
    assert!(Proximity { latitude: 95.0, ..ok }.validate().is_err());
    assert!(Proximity { longitude: -181.0, ..ok }.validate().is_err());
}

#[test]
fn test_evict_stale_entries() {
    let cache = LastKnownCache::new();
    cache.record(&event("7", 1.0, 1.0, 1));
    cache.record(&event("8", 1.0, 1.0, 1));
    let now = Utc::now().timestamp_millis();

    assert_eq!(cache.evict_stale(now, Duration::from_secs(60)), 0);
    assert_eq!(cache.len(), 2);

    assert_eq!(cache.evict_stale(now + 120_000, Duration::from_secs(60)), 2);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_eviction_loop_runs_in_background() {
    let cache = Arc::new(LastKnownCache::new());
    cache.record(&event("7", 1.0, 1.0, 1));

    let task = tokio::spawn(LastKnownCache::start_eviction_loop(
        Arc::clone(&cache),
        Duration::from_millis(10),
        Duration::from_millis(5),
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    task.abort();
    assert!(cache.is_empty());
}
