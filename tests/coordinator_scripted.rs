//! Run the coordinator against a fake controller that always reports the
//! same status and records every command it receives.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use rubin_atdome_engine::{
    config::DomeConfig,
    coordinator::{ATDomeCoordinator, CommandOutcome},
    error::ATDomeError,
    status::{ControllerSettings, FullStatus, ShortStatus},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    time::{sleep, timeout},
};

const STD_TIMEOUT: Duration = Duration::from_secs(5);

type Received = Arc<Mutex<Vec<String>>>;

/// Serve `short` for "?" and "+" and acknowledge anything else.
async fn start_fixed_status_controller(short: ShortStatus) -> (u16, Received) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let received = Received::default();
    let log = received.clone();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = socket.into_split();
        writer.write_all(b"ACE Main Box\n>").await.unwrap();
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let command = line.trim().to_owned();
            let outputs = match command.as_str() {
                "?" => short.as_lines(),
                "+" => FullStatus {
                    short,
                    settings: ControllerSettings::default(),
                }
                .as_lines(),
                _ => Vec::new(),
            };
            log.lock().unwrap().push(command);
            let mut reply = String::new();
            for output in outputs {
                reply.push_str(&output);
                reply.push('\n');
            }
            reply.push('>');
            if writer.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
    });
    (port, received)
}

async fn make_coordinator(short: ShortStatus) -> (ATDomeCoordinator, Received) {
    let (port, received) = start_fixed_status_controller(short).await;
    let coordinator = ATDomeCoordinator::new(DomeConfig {
        port,
        connection_timeout: 1.0,
        read_timeout: 1.0,
        status_interval: 0.05,
        ..DomeConfig::default()
    })
    .unwrap();
    coordinator.connect().await.unwrap();
    let mut states = coordinator.subscribe_state();
    timeout(STD_TIMEOUT, states.wait_for(Option::is_some))
        .await
        .unwrap()
        .unwrap();
    (coordinator, received)
}

fn at_home() -> ShortStatus {
    ShortStatus {
        az_home_switch: true,
        az_pos: 10.0,
        ..ShortStatus::default()
    }
}

fn motion_commands(received: &Received) -> Vec<String> {
    received
        .lock()
        .unwrap()
        .iter()
        .filter(|command| !matches!(command.as_str(), "?" | "+"))
        .cloned()
        .collect()
}

#[tokio::test]
async fn test_home_completes_when_homing_never_reported() {
    let (coordinator, received) = make_coordinator(at_home()).await;

    let handle = coordinator.home_azimuth().await.unwrap();

    let outcome = timeout(STD_TIMEOUT, handle.wait()).await.unwrap();
    assert_eq!(outcome, CommandOutcome::Completed);
    let state = coordinator.state().unwrap();
    assert!(!state.homing);

    let handle = coordinator.move_azimuth(10.0).await.unwrap();
    let outcome = timeout(STD_TIMEOUT, handle.wait()).await.unwrap();
    assert_eq!(outcome, CommandOutcome::Completed);
    let handle = coordinator.home_azimuth().await.unwrap();
    drop(handle);
    assert_eq!(motion_commands(&received), vec!["HM", "10.000 MV", "HM"]);
}

#[tokio::test]
async fn test_out_of_range_azimuth_sends_nothing() {
    let (coordinator, received) = make_coordinator(at_home()).await;

    for azimuth in [-1.0, 360.5] {
        let result = coordinator.move_azimuth(azimuth).await;
        assert!(matches!(result, Err(ATDomeError::Rejected(_))), "{azimuth}");
    }
    sleep(Duration::from_millis(200)).await;
    assert!(motion_commands(&received).is_empty());

    coordinator.move_azimuth(360.0).await.unwrap();
    coordinator.move_azimuth(0.0).await.unwrap();
    assert_eq!(motion_commands(&received), vec!["360.000 MV", "0.000 MV"]);
}
