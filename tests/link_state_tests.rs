use sensorhub::bus::{self, Event};
use sensorhub::config::BusConfig;
use sensorhub::link::*;
use std::time::Duration;

#[test]
fn test_link_starts_disconnected() {
    let link = LinkStateMachine::new(5);
    assert_eq!(link.current_state(), LinkState::Disconnected);
    assert_eq!(link.retries(), 0);
    assert!(!link.handle().is_connected());
}

#[test]
fn test_max_link_downs_while_connecting_fail_the_link() {
    let mut link = LinkStateMachine::new(5);
    link.start();

    for attempt in 1..5u8 {
        let t = link.link_down().unwrap();
        assert_eq!(t.to, LinkState::Connecting);
        assert_eq!(t.retries, attempt);
        assert_eq!(t.action, LinkAction::Connect);
    }

    let t = link.link_down().unwrap();
    assert_eq!(t.to, LinkState::Failed);
    assert_eq!(t.retries, 5);
    assert_eq!(t.action, LinkAction::None);
}

#[test]
fn test_failed_ignores_everything_but_reset() {
    let mut link = LinkStateMachine::new(1);
    link.start();
    link.link_down();
    assert_eq!(link.current_state(), LinkState::Failed);

    assert!(link.link_up().is_none());
    assert!(link.link_down().is_none());
    assert!(link.start().is_none());
    assert_eq!(link.current_state(), LinkState::Failed);

    let t = link.reset().unwrap();
    assert_eq!(t.to, LinkState::Disconnected);
    assert_eq!(link.retries(), 0);
    assert_eq!(link.start().unwrap().to, LinkState::Connecting);
}

#[test]
fn test_link_up_clears_retry_count() {
    let mut link = LinkStateMachine::new(5);
    link.start();
    link.link_down();
    link.link_down();
    assert_eq!(link.retries(), 2);

    let t = link.link_up().unwrap();
    assert_eq!(t.to, LinkState::Connected);
    assert_eq!(t.retries, 0);

    // A drop from a good connection gets the full budget again.
    let t = link.link_down().unwrap();
    assert_eq!(t.to, LinkState::Connecting);
    assert_eq!(t.retries, 0);
    assert_eq!(t.action, LinkAction::Connect);
}

#[test]
fn test_driver_may_report_up_before_start() {
    let mut link = LinkStateMachine::new(5);
    let t = link.link_up().unwrap();

    assert_eq!(t.from, LinkState::Disconnected);
    assert_eq!(t.to, LinkState::Connected);
    assert!(link.handle().is_connected());
}

#[test]
fn test_transitions_are_posted_to_bus() {
    let (tx, mut rx) = bus::channel(&BusConfig::default());
    let mut link = LinkStateMachine::new(2).with_notifier(tx);

    link.start();
    link.link_down();
    link.link_down();

    assert_eq!(
        rx.try_next(),
        Some(Event::LinkStateChanged {
            from: LinkState::Disconnected,
            to: LinkState::Connecting,
            retries: 0,
        })
    );
    assert_eq!(
        rx.try_next(),
        Some(Event::LinkStateChanged {
            from: LinkState::Connecting,
            to: LinkState::Connecting,
            retries: 1,
        })
    );
    assert_eq!(
        rx.try_next(),
        Some(Event::LinkStateChanged {
            from: LinkState::Connecting,
            to: LinkState::Failed,
            retries: 2,
        })
    );
    assert_eq!(rx.try_next(), None);
}

#[test]
fn test_recording_connectivity_counts_calls() {
    let mut driver = RecordingConnectivity::default();
    assert!(driver.connect().is_ok());
    driver.disconnect();

    driver.fail_connect = true;
    assert!(driver.connect().is_err());
    assert_eq!(driver.connect_calls, 2);
    assert_eq!(driver.disconnect_calls, 1);
}

#[tokio::test]
async fn test_wait_returns_when_connected() {
    let mut link = LinkStateMachine::new(5);
    let handle = link.handle();
    link.start();

    let driver = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        link.link_up();
        link
    });

    let outcome = handle.wait_until_connected(Duration::from_secs(5)).await;
    assert_eq!(outcome, WaitOutcome::Connected);
    assert_eq!(driver.await.unwrap().current_state(), LinkState::Connected);
}

#[tokio::test]
async fn test_wait_returns_immediately_when_already_connected() {
    let mut link = LinkStateMachine::new(5);
    link.link_up();

    let outcome = link.handle().wait_until_connected(Duration::ZERO).await;
    assert_eq!(outcome, WaitOutcome::Connected);
}

#[tokio::test]
async fn test_wait_reports_failure() {
    let mut link = LinkStateMachine::new(1);
    let handle = link.handle();
    link.start();
    link.link_down();

    let outcome = handle.wait_until_connected(Duration::from_secs(5)).await;
    assert_eq!(outcome, WaitOutcome::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_wait_times_out() {
    let mut link = LinkStateMachine::new(5);
    let handle = link.handle();
    link.start();

    let outcome = handle.wait_until_connected(Duration::from_secs(30)).await;
    assert_eq!(outcome, WaitOutcome::TimedOut);
    assert_eq!(link.current_state(), LinkState::Connecting);
}
