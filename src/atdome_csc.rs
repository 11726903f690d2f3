//! Implement the ATDome CSC.
//!
//! The CSC owns the summary state and translates incoming commands into
//! calls on the [`ATDomeCoordinator`]. It connects to the controller when
//! it enters Disabled or Enabled, disconnects when it leaves them, and goes
//! to Fault when the coordinator reports a transport fault.

use std::sync::Arc;

use apache_avro::{from_value, types::Value};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc, watch};

use crate::{
    config::DomeConfig,
    coordinator::{ATDomeCoordinator, CommandHandle, CommandOutcome, DomeEvent},
    error::{ATDomeError, ATDomeResult},
};

/// Error code of a failed command acknowledgement.
pub const ACK_FAILED_CODE: i64 = 1;

pub type CmdPayload = (CmdData, mpsc::Sender<CommandAck>);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Offline,
    #[default]
    Standby,
    Disabled,
    Enabled,
    Fault,
}

impl State {
    fn want_connection(&self) -> bool {
        matches!(self, State::Disabled | State::Enabled)
    }
}

#[derive(Debug, Clone)]
pub struct CmdData {
    pub name: String,
    pub data: Value,
}

impl CmdData {
    pub fn new(name: &str, data: Value) -> CmdData {
        CmdData {
            name: name.to_owned(),
            data,
        }
    }

    /// A command without parameters.
    pub fn empty(name: &str) -> CmdData {
        CmdData::new(name, Value::Record(Vec::new()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandAck {
    InProgress,
    Complete,
    Failed { code: i64, reason: String },
    Aborted(String),
}

impl CommandAck {
    fn make_failed(reason: &str) -> CommandAck {
        CommandAck::Failed {
            code: ACK_FAILED_CODE,
            reason: reason.to_owned(),
        }
    }
}

impl From<CommandOutcome> for CommandAck {
    fn from(outcome: CommandOutcome) -> Self {
        match outcome {
            CommandOutcome::Completed => CommandAck::Complete,
            CommandOutcome::Aborted(reason) => CommandAck::Aborted(reason),
            CommandOutcome::Failed(reason) => CommandAck::make_failed(&reason),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MoveAzimuth {
    azimuth: f64,
}

#[derive(Debug, Deserialize)]
struct MoveShutterDropoutDoor {
    open: bool,
}

#[derive(Debug, Deserialize)]
struct MoveShutterMainDoor {
    open: bool,
}

/// Result of handling one command.
enum Reply {
    Ack(CommandAck),
    /// The controller accepted a motion; the final ack comes from the handle.
    Started(CommandHandle),
}

pub struct ATDome {
    summary_state: State,
    coordinator: Arc<ATDomeCoordinator>,
    command_sender: mpsc::Sender<CmdPayload>,
    command_receiver: mpsc::Receiver<CmdPayload>,
    summary_state_sender: watch::Sender<State>,
    events: broadcast::Receiver<DomeEvent>,
}

impl ATDome {
    pub fn new(config: DomeConfig) -> ATDomeResult<ATDome> {
        let coordinator = Arc::new(ATDomeCoordinator::new(config)?);
        let events = coordinator.subscribe_events();
        let (command_sender, command_receiver) = mpsc::channel(32);
        let (summary_state_sender, _) = watch::channel(State::Standby);

        Ok(ATDome {
            summary_state: State::Standby,
            coordinator,
            command_sender,
            command_receiver,
            summary_state_sender,
            events,
        })
    }

    pub fn command_sender(&self) -> mpsc::Sender<CmdPayload> {
        self.command_sender.clone()
    }

    pub fn subscribe_summary_state(&self) -> watch::Receiver<State> {
        self.summary_state_sender.subscribe()
    }

    pub fn coordinator(&self) -> Arc<ATDomeCoordinator> {
        self.coordinator.clone()
    }

    pub fn get_current_state(&self) -> State {
        self.summary_state
    }

    /// This method runs the control loop of the CSC.
    ///
    /// Once awaited the CSC will start to respond to commands. Returns after
    /// a successful exitControl.
    pub async fn run(&mut self) -> ATDomeResult<()> {
        loop {
            tokio::select! {
                command = self.command_receiver.recv() => {
                    let Some((data, ack_channel)) = command else { break };
                    self.process_command(data, ack_channel).await;
                    if self.summary_state == State::Offline {
                        break;
                    }
                }
                event = self.events.recv() => match event {
                    Ok(DomeEvent::Fault { error_code, report }) => {
                        self.fault(error_code, &report).await;
                    }
                    Ok(event) => log::debug!("Coordinator event {event:?}."),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Missed {skipped} coordinator events.");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        self.coordinator.disconnect().await;
        Ok(())
    }

    async fn process_command(&mut self, data: CmdData, ack_channel: mpsc::Sender<CommandAck>) {
        log::info!("Received command {:?}.", data.name);
        let reply = match data.name.as_str() {
            "start" => self.do_start().await,
            "enable" => self.do_enable(),
            "disable" => self.do_disable(),
            "standby" => self.do_standby().await,
            "exitControl" => self.do_exit_control(),
            _ => self.do_motion(&data).await,
        };

        match reply {
            Ok(Reply::Ack(ack)) => {
                let _ = ack_channel.send(ack).await;
            }
            Ok(Reply::Started(handle)) => {
                let _ = ack_channel.send(CommandAck::InProgress).await;
                tokio::spawn(async move {
                    let name = handle.name();
                    let outcome = handle.wait().await;
                    log::debug!("Command {name} finished: {outcome:?}.");
                    let _ = ack_channel.send(outcome.into()).await;
                });
            }
            Err(err) => {
                log::warn!("Command {:?} failed: {err}", data.name);
                let _ = ack_channel
                    .send(CommandAck::make_failed(&err.to_string()))
                    .await;
            }
        }
    }

    fn check_transition(&self, allowed: &[State], target: State) -> ATDomeResult<()> {
        let current_state = self.get_current_state();
        if allowed.contains(&current_state) {
            Ok(())
        } else {
            Err(ATDomeError::rejected(format!(
                "Invalid state transition {current_state:?} -> {target:?}."
            )))
        }
    }

    /// Respond to the start command.
    ///
    /// This will transition the CSC from Standby to Disabled and connect to
    /// the controller.
    async fn do_start(&mut self) -> ATDomeResult<Reply> {
        self.check_transition(&[State::Standby], State::Disabled)?;
        self.set_summary_state(State::Disabled);
        if let Err(err) = self.handle_summary_state().await {
            self.set_summary_state(State::Fault);
            return Err(err);
        }
        Ok(Reply::Ack(CommandAck::Complete))
    }

    fn do_enable(&mut self) -> ATDomeResult<Reply> {
        self.check_transition(&[State::Disabled], State::Enabled)?;
        self.set_summary_state(State::Enabled);
        Ok(Reply::Ack(CommandAck::Complete))
    }

    /// Respond to the disable command.
    ///
    /// This command will transition the CSC from Enabled to Disabled.
    fn do_disable(&mut self) -> ATDomeResult<Reply> {
        self.check_transition(&[State::Enabled], State::Disabled)?;
        self.set_summary_state(State::Disabled);
        Ok(Reply::Ack(CommandAck::Complete))
    }

    /// Respond to the standby command.
    ///
    /// This command will transition the CSC from Fault or Disabled into
    /// Standby, closing the connection.
    async fn do_standby(&mut self) -> ATDomeResult<Reply> {
        self.check_transition(&[State::Fault, State::Disabled], State::Standby)?;
        self.set_summary_state(State::Standby);
        self.handle_summary_state().await?;
        Ok(Reply::Ack(CommandAck::Complete))
    }

    /// Respond to the exitControl command.
    ///
    /// If the CSC is in Standby, this will terminate the CSC execution.
    fn do_exit_control(&mut self) -> ATDomeResult<Reply> {
        self.check_transition(&[State::Standby], State::Offline)?;
        self.set_summary_state(State::Offline);
        Ok(Reply::Ack(CommandAck::Complete))
    }

    async fn do_motion(&mut self, data: &CmdData) -> ATDomeResult<Reply> {
        if self.summary_state != State::Enabled {
            return Err(ATDomeError::rejected(format!(
                "Command {:?} not allowed in state {:?}.",
                data.name, self.summary_state
            )));
        }
        let coordinator = &self.coordinator;
        let handle = match data.name.as_str() {
            "moveAzimuth" => {
                let move_azimuth = from_value::<MoveAzimuth>(&data.data)?;
                coordinator.move_azimuth(move_azimuth.azimuth).await?
            }
            "homeAzimuth" => coordinator.home_azimuth().await?,
            "openShutter" => coordinator.open_shutter().await?,
            "closeShutter" => coordinator.close_shutter().await?,
            "moveShutterDropoutDoor" => {
                let door = from_value::<MoveShutterDropoutDoor>(&data.data)?;
                coordinator.move_dropout_door(door.open).await?
            }
            "moveShutterMainDoor" => {
                let door = from_value::<MoveShutterMainDoor>(&data.data)?;
                coordinator.move_main_door(door.open).await?
            }
            "stopMotion" => coordinator.stop_motion().await?,
            name => return Err(ATDomeError::rejected(format!("Unknown command {name:?}."))),
        };
        Ok(Reply::Started(handle))
    }

    /// Connect or disconnect to match the summary state.
    async fn handle_summary_state(&mut self) -> ATDomeResult<()> {
        if self.summary_state.want_connection() {
            if !self.coordinator.is_connected() {
                self.coordinator.connect().await?;
            }
        } else {
            self.coordinator.disconnect().await;
        }
        Ok(())
    }

    /// Go to Fault after the coordinator reported a transport fault.
    async fn fault(&mut self, error_code: i64, report: &str) {
        if !self.summary_state.want_connection() {
            log::debug!(
                "Ignoring fault {error_code} in state {:?}: {report}",
                self.summary_state
            );
            return;
        }
        log::error!("Fault {error_code}: {report}");
        self.set_summary_state(State::Fault);
        self.coordinator.disconnect().await;
    }

    fn set_summary_state(&mut self, new_state: State) {
        log::info!("Summary state {:?} -> {new_state:?}.", self.summary_state);
        self.summary_state = new_state;
        self.summary_state_sender.send_replace(new_state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_controller::{MockConfig, MockDomeController};
    use std::time::Duration;
    use tokio::{task::JoinHandle, time::timeout};

    const STD_TIMEOUT: Duration = Duration::from_secs(5);

    struct Harness {
        commands: mpsc::Sender<CmdPayload>,
        summary_state: watch::Receiver<State>,
        coordinator: Arc<ATDomeCoordinator>,
        csc_task: JoinHandle<ATDomeResult<()>>,
    }

    impl Harness {
        fn start(port: u16) -> Harness {
            let config = DomeConfig {
                port,
                read_timeout: 2.0,
                connection_timeout: 2.0,
                status_interval: 0.05,
                ..DomeConfig::default()
            };
            let mut csc = ATDome::new(config).unwrap();
            Harness {
                commands: csc.command_sender(),
                summary_state: csc.subscribe_summary_state(),
                coordinator: csc.coordinator(),
                csc_task: tokio::spawn(async move { csc.run().await }),
            }
        }

        async fn command(&self, data: CmdData) -> mpsc::Receiver<CommandAck> {
            let (ack_sender, ack_receiver) = mpsc::channel(4);
            self.commands.send((data, ack_sender)).await.unwrap();
            ack_receiver
        }

        async fn ack(&self, data: CmdData) -> CommandAck {
            let mut acks = self.command(data).await;
            timeout(STD_TIMEOUT, acks.recv()).await.unwrap().unwrap()
        }

        async fn wait_for_state(&mut self, state: State) {
            timeout(STD_TIMEOUT, self.summary_state.wait_for(|s| *s == state))
                .await
                .unwrap()
                .unwrap();
        }
    }

    fn is_failed(ack: &CommandAck) -> bool {
        matches!(ack, CommandAck::Failed { .. })
    }

    #[tokio::test]
    async fn test_standard_state_transitions() {
        let mock = MockDomeController::start(0, MockConfig::default())
            .await
            .unwrap();
        let harness = Harness::start(mock.port());

        assert!(is_failed(&harness.ack(CmdData::empty("enable")).await));

        assert_eq!(harness.ack(CmdData::empty("start")).await, CommandAck::Complete);
        assert_eq!(*harness.summary_state.borrow(), State::Disabled);
        assert!(harness.coordinator.is_connected());

        assert_eq!(harness.ack(CmdData::empty("enable")).await, CommandAck::Complete);
        assert_eq!(harness.ack(CmdData::empty("disable")).await, CommandAck::Complete);
        assert!(harness.coordinator.is_connected());

        assert_eq!(harness.ack(CmdData::empty("standby")).await, CommandAck::Complete);
        assert!(!harness.coordinator.is_connected());

        assert_eq!(
            harness.ack(CmdData::empty("exitControl")).await,
            CommandAck::Complete
        );
        timeout(STD_TIMEOUT, harness.csc_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_motion_requires_enabled() {
        let mock = MockDomeController::start(0, MockConfig::default())
            .await
            .unwrap();
        let harness = Harness::start(mock.port());
        harness.ack(CmdData::empty("start")).await;

        let ack = harness.ack(CmdData::empty("openShutter")).await;

        assert!(is_failed(&ack));
        harness.ack(CmdData::empty("enable")).await;
        assert!(is_failed(&harness.ack(CmdData::empty("doSomething")).await));
    }

    #[tokio::test]
    async fn test_move_azimuth() {
        let mock = MockDomeController::start(0, MockConfig::default())
            .await
            .unwrap();
        let harness = Harness::start(mock.port());
        harness.ack(CmdData::empty("start")).await;
        harness.ack(CmdData::empty("enable")).await;

        let move_azimuth = Value::Record(vec![("azimuth".to_owned(), Value::Double(3.0))]);
        let mut acks = harness
            .command(CmdData::new("moveAzimuth", move_azimuth))
            .await;

        assert_eq!(acks.recv().await, Some(CommandAck::InProgress));
        assert_eq!(
            timeout(STD_TIMEOUT, acks.recv()).await.unwrap(),
            Some(CommandAck::Complete)
        );
        let state = harness.coordinator.state().unwrap();
        assert!(state.in_position_mask.contains(crate::move_code::AxisMask::AZIMUTH));
    }

    #[tokio::test]
    async fn test_bad_payload_fails() {
        let mock = MockDomeController::start(0, MockConfig::default())
            .await
            .unwrap();
        let harness = Harness::start(mock.port());
        harness.ack(CmdData::empty("start")).await;
        harness.ack(CmdData::empty("enable")).await;

        let ack = harness.ack(CmdData::empty("moveShutterMainDoor")).await;

        assert!(is_failed(&ack));
    }

    #[tokio::test]
    async fn test_start_without_controller_faults() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut harness = Harness::start(port);

        let ack = harness.ack(CmdData::empty("start")).await;

        assert!(is_failed(&ack));
        harness.wait_for_state(State::Fault).await;
        assert_eq!(harness.ack(CmdData::empty("standby")).await, CommandAck::Complete);
    }

    #[tokio::test]
    async fn test_lost_connection_faults() {
        let mock = MockDomeController::start(0, MockConfig::default())
            .await
            .unwrap();
        let mut harness = Harness::start(mock.port());
        harness.ack(CmdData::empty("start")).await;
        harness.ack(CmdData::empty("enable")).await;

        drop(mock);

        harness.wait_for_state(State::Fault).await;
        assert!(!harness.coordinator.is_connected());
    }
}
