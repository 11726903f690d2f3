//! Run the coordinator against controllers that misbehave.

use std::{sync::Arc, time::Duration};

use rubin_atdome_engine::{
    config::DomeConfig,
    coordinator::{ATDomeCoordinator, ConnectionState, DomeEvent},
    error::{ATDomeError, ERROR_CODE_CONNECT, ERROR_CODE_READ},
    poll_scheduler::PollState,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    sync::broadcast::error::TryRecvError,
    time::{sleep, timeout},
};

/// Start a fake controller that sends the banner and then answers every
/// command with `reply`, or never answers if `reply` is None.
async fn start_fake_controller(reply: Option<&'static str>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = socket.into_split();
        writer.write_all(b"ACE Main Box\n>").await.unwrap();
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(_)) = lines.next_line().await {
            if let Some(reply) = reply {
                if writer.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
        }
    });
    port
}

fn make_config(port: u16) -> DomeConfig {
    DomeConfig {
        port,
        connection_timeout: 1.0,
        read_timeout: 0.3,
        status_interval: 0.05,
        ..DomeConfig::default()
    }
}

#[tokio::test]
async fn test_wrong_line_count_is_not_fatal() {
    let port = start_fake_controller(Some("MAIN CLOSED 000\nDROP CLOSED 000\n[OFF] 00\nPOSN 0.00\n>")).await;
    let coordinator = ATDomeCoordinator::new(make_config(port)).unwrap();
    let mut events = coordinator.subscribe_events();

    coordinator.connect().await.unwrap();
    sleep(Duration::from_millis(500)).await;

    assert!(coordinator.state().is_none());
    assert!(coordinator.is_connected());
    assert_eq!(coordinator.poll_state(), PollState::Polling);
    assert_eq!(events.try_recv().unwrap(), DomeEvent::Connected);
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));

    coordinator.disconnect().await;
    assert_eq!(coordinator.poll_state(), PollState::Stopped);
}

#[tokio::test]
async fn test_silent_controller_faults() {
    let port = start_fake_controller(None).await;
    let coordinator = ATDomeCoordinator::new(make_config(port)).unwrap();
    let mut events = coordinator.subscribe_events();

    coordinator.connect().await.unwrap();
    assert_eq!(events.recv().await.unwrap(), DomeEvent::Connected);

    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(
        matches!(event, DomeEvent::Fault { error_code, .. } if error_code == ERROR_CODE_READ),
        "{event:?}"
    );
    assert_eq!(events.recv().await.unwrap(), DomeEvent::Disconnected);
    assert_eq!(coordinator.connection_state(), ConnectionState::Disconnected);

    timeout(Duration::from_secs(1), async {
        while coordinator.poll_state() != PollState::Stopped {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(matches!(
        coordinator.open_shutter().await,
        Err(ATDomeError::NotConnected)
    ));
}

#[tokio::test]
async fn test_connection_refused_faults() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let coordinator = ATDomeCoordinator::new(make_config(port)).unwrap();
    let mut events = coordinator.subscribe_events();

    let result = coordinator.connect().await;

    assert!(matches!(result, Err(ATDomeError::Connect { .. })));
    assert_eq!(
        events.recv().await.unwrap(),
        DomeEvent::Fault {
            error_code: ERROR_CODE_CONNECT,
            report: result.unwrap_err().to_string(),
        }
    );
    assert_eq!(coordinator.connection_state(), ConnectionState::Disconnected);
    assert_eq!(coordinator.poll_state(), PollState::Idle);
}

#[tokio::test]
async fn test_disconnect_cancels_connect_in_progress() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = socket.into_split();
        sleep(Duration::from_millis(300)).await;
        writer.write_all(b"ACE Main Box\n>").await.unwrap();
        // Returns once the client hangs up.
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(_)) = lines.next_line().await {}
    });
    let config = DomeConfig {
        read_timeout: 1.0,
        ..make_config(port)
    };
    let coordinator = Arc::new(ATDomeCoordinator::new(config).unwrap());
    let mut events = coordinator.subscribe_events();

    let connecting = coordinator.clone();
    let connect_task = tokio::spawn(async move { connecting.connect().await });
    sleep(Duration::from_millis(100)).await;
    assert_eq!(coordinator.connection_state(), ConnectionState::Connecting);

    coordinator.disconnect().await;
    assert_eq!(coordinator.connection_state(), ConnectionState::Disconnected);

    let result = timeout(Duration::from_secs(2), connect_task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(ATDomeError::Rejected(_))));
    assert_eq!(coordinator.connection_state(), ConnectionState::Disconnected);
    assert_eq!(coordinator.poll_state(), PollState::Idle);
    assert!(!coordinator.is_connected());
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    timeout(Duration::from_secs(2), server).await.unwrap().unwrap();
}
