//! Scan deadline enforcement under paused time

use std::sync::Arc;
use std::time::Duration;

use hrlink_core::mock::{MockRadio, RadioCall};
use hrlink_core::{HeartRateSession, PeripheralRecord, SessionConfig};

async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_scan_force_stops_after_deadline() {
    let radio = Arc::new(MockRadio::powered_on());
    radio.retain_streams(true);
    let session = HeartRateSession::new(SessionConfig::default(), radio.clone(), None).unwrap();
    session.start().await;

    session.scan_for_peripherals().await;
    assert!(radio.advertise(PeripheralRecord::new("A", None, -60)));
    settle().await;

    tokio::time::advance(Duration::from_secs(49)).await;
    settle().await;
    assert!(session.is_scanning());

    tokio::time::advance(Duration::from_secs(2)).await;
    settle().await;
    assert!(!session.is_scanning());
    assert_eq!(radio.count(|c| *c == RadioCall::StopScan), 1);

    // The radio still holds a sender, but the session let go of the stream
    assert!(!radio.advertise(PeripheralRecord::new("B", None, -60)));
    settle().await;
    let found = session.discovered_peripherals();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id.as_str(), "A");

    // Explicit stop after the deadline is harmless
    session.stop_scan().await;
    assert_eq!(radio.count(|c| *c == RadioCall::StopScan), 1);
}

#[tokio::test(start_paused = true)]
async fn test_restart_resets_deadline() {
    let radio = Arc::new(MockRadio::powered_on());
    let config = SessionConfig::default().with_scan_timeout(10).unwrap();
    let session = HeartRateSession::new(config, radio.clone(), None).unwrap();
    session.start().await;

    session.scan_for_peripherals().await;
    tokio::time::advance(Duration::from_secs(8)).await;
    settle().await;

    session.scan_for_peripherals().await;
    tokio::time::advance(Duration::from_secs(8)).await;
    settle().await;
    assert!(session.is_scanning());

    tokio::time::advance(Duration::from_secs(3)).await;
    settle().await;
    assert!(!session.is_scanning());
}
