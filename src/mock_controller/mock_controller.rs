//! ATDome mock controller.
//!
//! Speaks the controller's TCP/IP protocol and models the dome kinematics
//! well enough to exercise the engine: azimuth moves along the shortest path
//! at constant speed, homing overshoots and comes back slowly, and each door
//! takes a fixed time to travel from closed to open.
//!
//! Known limitations: encoder counts are bogus, doors move independently
//! (no door sequencing), and configuration commands are not supported.

use std::time::Duration;

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
    task::{JoinHandle, JoinSet},
    time::{interval, Instant, MissedTickBehavior},
};

use crate::{
    atdome_cmd_regex::ATDomeCmdRegex,
    atdome_model::ATDomeCmd,
    axis_state::angle_diff,
    error::ATDomeResult,
    move_code::MoveCode,
    status::{ControllerSettings, FullStatus, ShortStatus},
};

const BANNER: &[u8] = b"ACE Main Box\n>";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MockConfig {
    /// Time to fully open or close either door (sec).
    pub door_time: f64,
    /// Azimuth speed (deg/sec).
    pub az_vel: f64,
    pub home_az: f64,
    /// Distance to move CCW past the home position at full speed while
    /// homing, before coming back at `home_az_vel` (deg).
    pub home_az_overshoot: f64,
    pub home_az_vel: f64,
    /// Simulation time step.
    pub tick: Duration,
}

impl Default for MockConfig {
    fn default() -> Self {
        MockConfig {
            door_time: 1.0,
            az_vel: 6.0,
            home_az: 10.0,
            home_az_overshoot: 1.0,
            home_az_vel: 1.0,
            tick: Duration::from_millis(20),
        }
    }
}

#[derive(Debug)]
enum MockRequest {
    Command {
        atdome_cmd: ATDomeCmd,
        text: String,
        tx: oneshot::Sender<Vec<String>>,
    },
    SetEstop(bool),
    SetSensors { rain: bool, clouds: bool },
    SetAzimuth(f64),
    FailNext(String),
}

#[derive(Debug, Default, Clone, Copy)]
struct DoorActuator {
    position: f64,
    target: Option<f64>,
}

impl DoorActuator {
    fn closing(&self) -> bool {
        self.target.is_some_and(|target| target < self.position)
    }

    fn opening(&self) -> bool {
        self.target.is_some_and(|target| target > self.position)
    }

    fn advance(&mut self, step: f64) {
        if let Some(target) = self.target {
            let delta = target - self.position;
            if delta.abs() <= step {
                self.position = target;
                self.target = None;
            } else {
                self.position += step.copysign(delta);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum HomingPhase {
    Overshoot,
    Final,
}

#[derive(Debug)]
struct MockState {
    config: MockConfig,
    az_pos: f64,
    az_target: Option<f64>,
    az_speed: f64,
    last_rot_right: Option<bool>,
    last_azimuth_goto: f64,
    homing: Option<HomingPhase>,
    main_door: DoorActuator,
    dropout_door: DoorActuator,
    auto_shutdown_enabled: bool,
    rain_detected: bool,
    clouds_detected: bool,
    estop_active: bool,
    fail_command: Option<String>,
    settings: ControllerSettings,
}

impl MockState {
    fn new(config: MockConfig) -> MockState {
        MockState {
            config,
            az_pos: 0.0,
            az_target: None,
            az_speed: config.az_vel,
            last_rot_right: None,
            last_azimuth_goto: 0.0,
            homing: None,
            main_door: DoorActuator::default(),
            dropout_door: DoorActuator::default(),
            auto_shutdown_enabled: false,
            rain_detected: false,
            clouds_detected: false,
            estop_active: false,
            fail_command: None,
            settings: ControllerSettings {
                scb_link_ok: true,
                home_azimuth: config.home_az,
                high_speed: 5.0,
                coast: 0.5,
                tolerance: 1.0,
                encoder_counts_per_360: 4018143232,
                azimuth_move_timeout: 120.0,
                rain_sensor_enabled: true,
                cloud_sensor_enabled: true,
                watchdog_timer: 600.0,
                dropout_timer: 5.0,
                reversal_delay: 4.0,
                main_door_encoder_closed: 118449181478,
                main_door_encoder_opened: 8287616388,
                dropout_door_encoder_closed: 5669776578,
                dropout_door_encoder_opened: 5710996184,
                door_move_timeout: 360.0,
                ..ControllerSettings::default()
            },
        }
    }

    fn handle_command(&mut self, atdome_cmd: ATDomeCmd, text: &str) -> Vec<String> {
        if self.fail_command.as_deref() == Some(text) {
            self.fail_command = None;
            return vec![format!("Command {text} failed by request")];
        }
        match atdome_cmd {
            ATDomeCmd::GetShortStatus => return self.short_status().as_lines(),
            ATDomeCmd::GetFullStatus => return self.full_status().as_lines(),
            ATDomeCmd::MoveAz(az) => {
                if self.homing.is_some() {
                    log::warn!("Cannot set azimuth while homing.");
                } else if !(0.0..=360.0).contains(&az) {
                    log::warn!("Azimuth {az} out of range [0, 360].");
                } else {
                    self.set_cmd_az(az);
                }
            }
            ATDomeCmd::HomeAzimuth => {
                self.homing = Some(HomingPhase::Overshoot);
                self.az_speed = self.config.az_vel;
                self.set_cmd_az(self.config.home_az - self.config.home_az_overshoot);
            }
            ATDomeCmd::StopMotion => {
                self.az_target = None;
                self.homing = None;
                self.az_speed = self.config.az_vel;
                self.main_door.target = None;
                self.dropout_door.target = None;
            }
            ATDomeCmd::OpenShutter => {
                self.main_door.target = Some(100.0);
                self.dropout_door.target = Some(100.0);
            }
            ATDomeCmd::CloseShutter => {
                self.main_door.target = Some(0.0);
                self.dropout_door.target = Some(0.0);
            }
            ATDomeCmd::OpenShutterMainDoor => self.main_door.target = Some(100.0),
            ATDomeCmd::CloseShutterMainDoor => self.main_door.target = Some(0.0),
            ATDomeCmd::OpenShutterDropoutDoor => self.dropout_door.target = Some(100.0),
            ATDomeCmd::CloseShutterDropoutDoor => self.dropout_door.target = Some(0.0),
            ATDomeCmd::Unknown => log::warn!("Unsupported command {text:?}."),
        }
        Vec::new()
    }

    fn set_cmd_az(&mut self, az: f64) {
        let az = az.rem_euclid(360.0);
        self.last_azimuth_goto = az;
        self.last_rot_right = Some(angle_diff(az, self.az_pos) > 0.0);
        self.az_target = Some(az);
    }

    fn advance(&mut self, dt: f64) {
        if let Some(target) = self.az_target {
            let delta = angle_diff(target, self.az_pos);
            let step = self.az_speed * dt;
            if delta.abs() <= step {
                self.az_pos = target;
                self.az_target = None;
            } else {
                self.az_pos = (self.az_pos + step.copysign(delta)).rem_euclid(360.0);
            }
        }
        if self.az_target.is_none() {
            match self.homing {
                Some(HomingPhase::Overshoot) => {
                    self.homing = Some(HomingPhase::Final);
                    self.az_speed = self.config.home_az_vel;
                    self.set_cmd_az(self.config.home_az);
                }
                Some(HomingPhase::Final) => {
                    self.homing = None;
                    self.az_speed = self.config.az_vel;
                }
                None => {}
            }
        }

        let door_step = 100.0 * dt / self.config.door_time;
        self.main_door.advance(door_step);
        self.dropout_door.advance(door_step);
    }

    fn move_code(&self) -> MoveCode {
        let mut move_code = MoveCode::default();
        if self.az_target.is_some() {
            move_code = move_code.with(if self.last_rot_right == Some(true) {
                MoveCode::AZ_POSITIVE
            } else {
                MoveCode::AZ_NEGATIVE
            });
        }
        for (door, closing, opening) in [
            (
                &self.main_door,
                MoveCode::MAIN_DOOR_CLOSING,
                MoveCode::MAIN_DOOR_OPENING,
            ),
            (
                &self.dropout_door,
                MoveCode::DROPOUT_DOOR_CLOSING,
                MoveCode::DROPOUT_DOOR_OPENING,
            ),
        ] {
            if door.closing() {
                move_code = move_code.with(closing);
            } else if door.opening() {
                move_code = move_code.with(opening);
            }
        }
        if self.homing.is_some() {
            move_code = move_code.with(MoveCode::HOMING);
        }
        if self.estop_active {
            move_code = move_code.with(MoveCode::ESTOP);
        }
        move_code
    }

    fn short_status(&self) -> ShortStatus {
        ShortStatus {
            main_door_pct: self.main_door.position.round(),
            dropout_door_pct: self.dropout_door.position.round(),
            auto_shutdown_enabled: self.auto_shutdown_enabled,
            sensor_code: u8::from(self.rain_detected) | (u8::from(self.clouds_detected) << 1),
            az_home_switch: self.homing.is_none()
                && angle_diff(self.az_pos, self.config.home_az).abs() < 0.01,
            az_pos: self.az_pos,
            last_rot_right: self.last_rot_right,
            move_code: self.move_code(),
        }
    }

    fn full_status(&self) -> FullStatus {
        let counts_per_360 = self.settings.encoder_counts_per_360 as f64;
        FullStatus {
            short: self.short_status(),
            settings: ControllerSettings {
                estop_active: self.estop_active,
                last_azimuth_goto: self.last_azimuth_goto,
                encoder_counts: (self.az_pos * counts_per_360 / 360.0) as u64,
                ..self.settings
            },
        }
    }
}

async fn run_controller_loop(config: MockConfig, mut rx: mpsc::Receiver<MockRequest>) {
    let mut state = MockState::new(config);
    let mut ticker = interval(config.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_tick = Instant::now();

    loop {
        tokio::select! {
            request = rx.recv() => {
                let Some(request) = request else { break };
                match request {
                    MockRequest::Command { atdome_cmd, text, tx } => {
                        let _ = tx.send(state.handle_command(atdome_cmd, &text));
                    }
                    MockRequest::SetEstop(active) => state.estop_active = active,
                    MockRequest::SetSensors { rain, clouds } => {
                        state.rain_detected = rain;
                        state.clouds_detected = clouds;
                    }
                    MockRequest::SetAzimuth(az) => {
                        state.az_pos = az.rem_euclid(360.0);
                        state.az_target = None;
                    }
                    MockRequest::FailNext(text) => state.fail_command = Some(text),
                }
            }
            now = ticker.tick() => {
                state.advance((now - last_tick).as_secs_f64());
                last_tick = now;
            }
        }
    }
}

async fn handle_client(
    socket: TcpStream,
    tx: mpsc::Sender<MockRequest>,
    atdome_cmd_regex: &ATDomeCmdRegex,
) -> ATDomeResult<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer.write_all(BANNER).await?;

    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        log::debug!("Mock controller read {text:?}.");
        if !text.is_empty() {
            let (reply_tx, reply_rx) = oneshot::channel();
            let request = MockRequest::Command {
                atdome_cmd: atdome_cmd_regex.into_atdome_cmd(text),
                text: text.to_owned(),
                tx: reply_tx,
            };
            if tx.send(request).await.is_err() {
                log::error!("Mock controller loop is gone.");
                break;
            }
            let Ok(outputs) = reply_rx.await else {
                log::error!("Internal error when requesting response from controller loop.");
                break;
            };
            for output in outputs {
                writer.write_all(format!("{output}\n").as_bytes()).await?;
            }
        }
        writer.write_all(b">").await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn serve(listener: TcpListener, tx: mpsc::Sender<MockRequest>) -> ATDomeResult<()> {
    let mut clients = JoinSet::new();
    loop {
        let (socket, peer) = listener.accept().await?;
        log::info!("Mock controller accepted connection from {peer}.");
        let tx = tx.clone();
        clients.spawn(async move {
            let atdome_cmd_regex = match ATDomeCmdRegex::new() {
                Ok(atdome_cmd_regex) => atdome_cmd_regex,
                Err(err) => {
                    log::error!("{err}");
                    return;
                }
            };
            if let Err(err) = handle_client(socket, tx, &atdome_cmd_regex).await {
                log::warn!("Mock controller connection ended: {err}");
            }
        });
        while clients.try_join_next().is_some() {}
    }
}

/// Running mock controller; stops when dropped.
pub struct MockDomeController {
    port: u16,
    tx: mpsc::Sender<MockRequest>,
    server_task: JoinHandle<ATDomeResult<()>>,
    controller_task: JoinHandle<()>,
}

impl MockDomeController {
    /// Start serving on `port` of localhost; 0 picks a free port.
    pub async fn start(port: u16, config: MockConfig) -> ATDomeResult<MockDomeController> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let port = listener.local_addr()?.port();
        let (tx, rx) = mpsc::channel(100);

        let controller_task = tokio::spawn(run_controller_loop(config, rx));
        let server_task = tokio::spawn(serve(listener, tx.clone()));

        Ok(MockDomeController {
            port,
            tx,
            server_task,
            controller_task,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn set_estop(&self, active: bool) {
        let _ = self.tx.send(MockRequest::SetEstop(active)).await;
    }

    pub async fn set_sensors(&self, rain: bool, clouds: bool) {
        let _ = self.tx.send(MockRequest::SetSensors { rain, clouds }).await;
    }

    /// Teleport azimuth, cancelling any azimuth move.
    pub async fn set_azimuth(&self, az: f64) {
        let _ = self.tx.send(MockRequest::SetAzimuth(az)).await;
    }

    /// Report the next occurrence of command `text` (e.g. "SO") as failed.
    pub async fn fail_next(&self, text: &str) {
        let _ = self.tx.send(MockRequest::FailNext(text.to_owned())).await;
    }

    /// Serve until the listener fails.
    pub async fn wait(mut self) -> ATDomeResult<()> {
        match (&mut self.server_task).await {
            Ok(result) => result,
            Err(err) => Err(std::io::Error::other(err).into()),
        }
    }
}

impl Drop for MockDomeController {
    fn drop(&mut self) {
        self.server_task.abort();
        self.controller_task.abort();
    }
}

pub async fn run_mock_controller(port: u16) -> ATDomeResult<()> {
    let mock_controller = MockDomeController::start(port, MockConfig::default()).await?;
    log::info!("Mock controller listening on port {}.", mock_controller.port());
    mock_controller.wait().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status_parser::StatusParser;

    #[test]
    fn test_open_shutter_moves_both_doors() {
        let mut state = MockState::new(MockConfig::default());

        assert!(state.handle_command(ATDomeCmd::OpenShutter, "SO").is_empty());
        let move_code = state.move_code();
        assert!(move_code.main_door_opening());
        assert!(move_code.dropout_door_opening());

        state.advance(0.5);
        assert_eq!(state.main_door.position, 50.0);
        state.advance(0.6);
        assert_eq!(state.main_door.position, 100.0);
        assert_eq!(state.move_code(), MoveCode::default());
    }

    #[test]
    fn test_azimuth_takes_shortest_path() {
        let mut state = MockState::new(MockConfig::default());

        state.handle_command(ATDomeCmd::MoveAz(354.0), "354.000 MV");
        assert!(state.move_code().az_negative());
        assert_eq!(state.last_rot_right, Some(false));

        state.advance(0.5);
        assert!((state.az_pos - 357.0).abs() < 1e-9);
        state.advance(1.0);
        assert_eq!(state.az_pos, 354.0);
        assert!(state.move_code().az_halted());
    }

    #[test]
    fn test_homing_sequence() {
        let mut state = MockState::new(MockConfig::default());
        state.az_pos = 12.0;

        state.handle_command(ATDomeCmd::HomeAzimuth, "HM");
        assert!(state.move_code().homing());
        assert!(state.move_code().az_negative());

        // ignored while homing
        state.handle_command(ATDomeCmd::MoveAz(100.0), "100.000 MV");
        assert_eq!(state.az_target, Some(9.0));

        state.advance(0.5);
        assert_eq!(state.az_pos, 9.0);
        assert_eq!(state.homing, Some(HomingPhase::Final));
        assert!(state.move_code().az_positive());

        state.advance(1.5);
        assert_eq!(state.az_pos, 10.0);
        assert!(!state.move_code().homing());
        assert!(state.short_status().az_home_switch);
    }

    #[test]
    fn test_stop() {
        let mut state = MockState::new(MockConfig::default());
        state.handle_command(ATDomeCmd::OpenShutter, "SO");
        state.handle_command(ATDomeCmd::HomeAzimuth, "HM");

        state.handle_command(ATDomeCmd::StopMotion, "ST");

        assert_eq!(state.move_code(), MoveCode::default());
    }

    #[test]
    fn test_fail_command_once() {
        let mut state = MockState::new(MockConfig::default());
        state.fail_command = Some("SO".to_owned());

        let outputs = state.handle_command(ATDomeCmd::OpenShutter, "SO");
        assert_eq!(outputs, vec!["Command SO failed by request"]);
        assert!(!state.move_code().main_door_opening());

        assert!(state.handle_command(ATDomeCmd::OpenShutter, "SO").is_empty());
        assert!(state.move_code().main_door_opening());
    }

    #[test]
    fn test_status_is_parsable() {
        let mut state = MockState::new(MockConfig::default());
        state.rain_detected = true;
        state.estop_active = true;
        let parser = StatusParser::new().unwrap();

        let short = parser
            .decode_short(&state.handle_command(ATDomeCmd::GetShortStatus, "?"))
            .unwrap();
        let full = parser
            .decode_full(&state.handle_command(ATDomeCmd::GetFullStatus, "+"))
            .unwrap();

        assert_eq!(short.sensor_code, 1);
        assert!(short.move_code.estop());
        assert!(full.settings.estop_active);
        assert!(full.settings.scb_link_ok);
        assert_eq!(full.settings.home_azimuth, 10.0);
    }
}
