#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Integration tests use unwrap for brevity

//! End-to-end tests of the supervisor → hub pipeline with real `sh`
//! processes standing in for the simulation engine.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use simrelay_core::config::{EngineConfig, HubConfig};
use simrelay_core::{Channel, Event};
use simrelay_daemon::hub::{BroadcastHub, Subscription};
use simrelay_daemon::supervisor::{Supervisor, SupervisorError};

const RECV_TIMEOUT: Duration = Duration::from_secs(15);

/// Engine running `script` under `sh -c`; the target is `$1` and
/// parameters follow as `--key value`.
fn sh_engine(script: &str) -> EngineConfig {
    EngineConfig {
        program: PathBuf::from("sh"),
        args: vec!["-c".to_string(), script.to_string(), "sh".to_string()],
        flags: Vec::new(),
        terminate_timeout_secs: 5,
        ..EngineConfig::default()
    }
}

fn components(engine: EngineConfig) -> (Arc<BroadcastHub>, Supervisor) {
    let hub = Arc::new(BroadcastHub::new(HubConfig::default()));
    let supervisor = Supervisor::new(engine, hub.create_event_forwarder());
    (hub, supervisor)
}

async fn next_event(sub: &mut Subscription) -> Event {
    tokio::time::timeout(RECV_TIMEOUT, sub.recv())
        .await
        .expect("timed out waiting for event")
        .expect("subscription closed")
}

/// Collect events up to and including the first `SessionEnd`.
async fn until_session_end(sub: &mut Subscription) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        let event = next_event(sub).await;
        let done = matches!(event, Event::SessionEnd { .. });
        events.push(event);
        if done {
            return events;
        }
    }
}

#[tokio::test]
async fn run_is_broadcast_to_all_subscribers_and_restartable() {
    let (hub, supervisor) = components(sh_engine(r#"echo '{"v":1}'; exit 0"#));
    let mut first = hub.register().await;
    let mut second = hub.register().await;

    let ack = supervisor.start("X", BTreeMap::new()).await.unwrap();
    assert!(ack.message.contains('X'));

    let expected = vec![
        Event::Data(json!({"v": 1})),
        Event::session_end("X", Some(0)),
    ];
    assert_eq!(until_session_end(&mut first).await, expected);
    assert_eq!(until_session_end(&mut second).await, expected);
    assert!(!supervisor.is_running().await);

    supervisor.start("X", BTreeMap::new()).await.unwrap();
    assert_eq!(until_session_end(&mut first).await, expected);
}

#[tokio::test]
async fn nonzero_exit_ends_session_once() {
    let (hub, supervisor) = components(sh_engine("echo 'fatal: dataset missing' >&2; exit 3"));
    let mut sub = hub.register().await;

    supervisor.start("Bearing1_3", BTreeMap::new()).await.unwrap();

    assert_eq!(
        until_session_end(&mut sub).await,
        vec![
            Event::log(Channel::Stderr, "fatal: dataset missing"),
            Event::session_end("Bearing1_3", Some(3)),
        ]
    );
    assert!(!supervisor.is_running().await);

    // Nothing else arrives for this session.
    let extra = tokio::time::timeout(Duration::from_millis(200), sub.recv()).await;
    assert!(extra.is_err());
}

#[tokio::test]
async fn output_is_classified_per_stream() {
    let script = r#"
        echo 'Usando cálculo de FDT dinâmico...'
        echo '{"type":"rul","cycle":1}'
        echo '{"looks":"like json"}' >&2
        echo ''
    "#;
    let (hub, supervisor) = components(sh_engine(script));
    let mut sub = hub.register().await;

    supervisor.start("Bearing2_2", BTreeMap::new()).await.unwrap();
    let events = until_session_end(&mut sub).await;

    let stdout: Vec<&Event> = events
        .iter()
        .filter(|e| !matches!(e, Event::Log { channel: Channel::Stderr, .. }))
        .collect();
    assert_eq!(
        stdout,
        vec![
            &Event::log(Channel::Stdout, "Usando cálculo de FDT dinâmico..."),
            &Event::Data(json!({"type": "rul", "cycle": 1})),
            &Event::session_end("Bearing2_2", Some(0)),
        ]
    );
    assert!(events.contains(&Event::log(Channel::Stderr, r#"{"looks":"like json"}"#)));
}

#[tokio::test]
async fn stdout_order_is_preserved() {
    let script = r#"i=1; while [ $i -le 200 ]; do echo "{\"i\":$i}"; i=$((i+1)); done"#;
    let (hub, supervisor) = components(sh_engine(script));
    let mut sub = hub.register().await;

    supervisor.start("Bearing3_3", BTreeMap::new()).await.unwrap();
    let events = until_session_end(&mut sub).await;

    let expected: Vec<Event> = (1..=200)
        .map(|i| Event::Data(json!({"i": i})))
        .chain(std::iter::once(Event::session_end("Bearing3_3", Some(0))))
        .collect();
    assert_eq!(events, expected);
}

#[tokio::test]
async fn parameters_are_passed_as_flags() {
    let (hub, supervisor) = components(sh_engine(r#"echo "{\"target\":\"$1\",\"flag\":\"$2\",\"value\":\"$3\"}""#));
    let mut sub = hub.register().await;

    let parameters = BTreeMap::from([("base_path".to_string(), "/data/xjtu".to_string())]);
    supervisor.start("Bearing1_2", parameters).await.unwrap();

    assert_eq!(
        next_event(&mut sub).await,
        Event::Data(json!({"target": "Bearing1_2", "flag": "--base_path", "value": "/data/xjtu"}))
    );
}

#[tokio::test]
async fn start_while_running_conflicts_without_spawning() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("spawns");
    let script = format!("echo started >> '{}'; exec sleep 30", marker.display());
    let (hub, supervisor) = components(sh_engine(&script));
    let mut sub = hub.register().await;

    supervisor.start("Bearing1_2", BTreeMap::new()).await.unwrap();
    assert!(supervisor.is_running().await);

    let second = supervisor.start("Bearing2_1", BTreeMap::new()).await;
    assert!(matches!(second, Err(SupervisorError::Conflict { .. })));
    assert_eq!(
        supervisor.current_target().await.as_deref(),
        Some("Bearing1_2")
    );

    // Give the shell time to write its marker before counting.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let spawns = std::fs::read_to_string(&marker).unwrap();
    assert_eq!(spawns.lines().count(), 1);

    supervisor.stop().await;
    let events = until_session_end(&mut sub).await;
    assert_eq!(events.last(), Some(&Event::session_end("Bearing1_2", None)));
}

#[tokio::test]
async fn stop_interrupts_running_process() {
    let (hub, supervisor) = components(sh_engine("exec sleep 30"));
    let mut sub = hub.register().await;

    supervisor.start("Bearing3_4", BTreeMap::new()).await.unwrap();
    let ack = supervisor.stop().await;
    assert_eq!(ack.message, "Stop command sent.");

    // Killed by SIGINT: no exit code.
    assert_eq!(
        until_session_end(&mut sub).await,
        vec![Event::session_end("Bearing3_4", None)]
    );
    assert!(!supervisor.is_running().await);
}

#[tokio::test]
async fn stop_escalates_when_interrupt_is_ignored() {
    let engine = EngineConfig {
        terminate_timeout_secs: 1,
        ..sh_engine("trap '' INT; echo ready; exec sleep 30")
    };
    let (hub, supervisor) = components(engine);
    let mut sub = hub.register().await;

    supervisor.start("Bearing1_2", BTreeMap::new()).await.unwrap();
    assert_eq!(
        next_event(&mut sub).await,
        Event::log(Channel::Stdout, "ready")
    );

    supervisor.stop().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(supervisor.is_running().await, "SIGINT should be ignored");

    assert_eq!(
        until_session_end(&mut sub).await,
        vec![Event::session_end("Bearing1_2", None)]
    );
    assert!(!supervisor.is_running().await);
}

#[tokio::test]
async fn stop_after_exit_does_not_signal_while_output_drains() {
    // The background sleep keeps the pipes open after `sh` has exited.
    let (hub, supervisor) = components(sh_engine("sleep 5 & exit 0"));
    let mut sub = hub.register().await;

    supervisor.start("Bearing1_1", BTreeMap::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(supervisor.is_running().await, "session ends only after the drain bound");

    let ack = supervisor.stop().await;
    assert_eq!(ack.message, "Simulation already exited, finishing.");

    assert_eq!(
        until_session_end(&mut sub).await,
        vec![Event::session_end("Bearing1_1", Some(0))]
    );
    assert!(!supervisor.is_running().await);
}

#[tokio::test]
async fn shutdown_waits_for_session_end() {
    let (hub, supervisor) = components(sh_engine("exec sleep 30"));
    let mut sub = hub.register().await;

    supervisor.start("Bearing3_1", BTreeMap::new()).await.unwrap();
    assert!(supervisor.shutdown().await);
    assert!(!supervisor.is_running().await);

    assert_eq!(
        until_session_end(&mut sub).await,
        vec![Event::session_end("Bearing3_1", None)]
    );
}

#[tokio::test]
async fn shutdown_kills_process_ignoring_interrupt() {
    let engine = EngineConfig {
        terminate_timeout_secs: 1,
        ..sh_engine("trap '' INT; echo ready; exec sleep 30")
    };
    let (hub, supervisor) = components(engine);
    let mut sub = hub.register().await;

    supervisor.start("Bearing1_4", BTreeMap::new()).await.unwrap();
    assert_eq!(next_event(&mut sub).await, Event::log(Channel::Stdout, "ready"));

    assert!(supervisor.shutdown().await);
    assert_eq!(
        until_session_end(&mut sub).await,
        vec![Event::session_end("Bearing1_4", None)]
    );
}

#[tokio::test]
async fn spawn_failure_reports_system_error_and_stays_idle() {
    let engine = EngineConfig {
        program: PathBuf::from("/nonexistent/simrelay-engine"),
        ..EngineConfig::default()
    };
    let (hub, supervisor) = components(engine);
    let mut sub = hub.register().await;

    let ack = supervisor.start("Bearing1_2", BTreeMap::new()).await.unwrap();
    assert!(ack.message.contains("Bearing1_2"));

    match next_event(&mut sub).await {
        Event::SystemError { message } => {
            assert!(message.contains("/nonexistent/simrelay-engine"), "{message}");
        }
        other => panic!("expected system error, got {other:?}"),
    }
    assert!(!supervisor.is_running().await);

    // Idle again: a retry is accepted rather than rejected as a conflict.
    supervisor.start("Bearing1_2", BTreeMap::new()).await.unwrap();
    assert!(matches!(
        next_event(&mut sub).await,
        Event::SystemError { .. }
    ));

    let nothing = tokio::time::timeout(Duration::from_millis(200), sub.recv()).await;
    assert!(nothing.is_err(), "no session end after a failed spawn");
}

#[tokio::test]
async fn disconnecting_one_subscriber_does_not_affect_others() {
    let (hub, supervisor) = components(sh_engine(r#"echo '{"n":1}'; sleep 0.3; echo '{"n":2}'"#));
    let mut stays = hub.register().await;
    let mut leaves = hub.register().await;

    supervisor.start("Bearing2_1", BTreeMap::new()).await.unwrap();
    assert_eq!(next_event(&mut leaves).await, Event::Data(json!({"n": 1})));
    drop(leaves);

    assert_eq!(
        until_session_end(&mut stays).await,
        vec![
            Event::Data(json!({"n": 1})),
            Event::Data(json!({"n": 2})),
            Event::session_end("Bearing2_1", Some(0)),
        ]
    );
    assert_eq!(hub.subscriber_count().await, 1);
}
