//! Coordinate commands and status polls on the single controller connection.
//!
//! [`ATDomeCoordinator`] is the entry point for everything that talks to the
//! dome. Status polls and motion commands share one lock around the
//! connection so that a command and its reply are never interleaved with
//! another exchange.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::{
    sync::{broadcast, oneshot, watch, Notify},
    task::JoinHandle,
    time::{sleep, timeout},
};

use crate::{
    atdome_model::{ATDomeCmd, ATDomeModel},
    axis_state::{
        AzimuthCommandedState, AzimuthState, CommandedState, DomeState, ShutterDoorCommandedState,
        ShutterDoorState,
    },
    config::DomeConfig,
    error::{ATDomeError, ATDomeResult},
    move_code::AxisMask,
    poll_scheduler::{run_status_loop, PollState},
    status::DomeSnapshot,
    status_parser::StatusParser,
};

const EVENT_CHANNEL_SIZE: usize = 32;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Events for the outside world that are not part of the dome state.
#[derive(Debug, Clone, PartialEq)]
pub enum DomeEvent {
    Connected,
    Disconnected,
    Fault { error_code: i64, report: String },
}

/// How a motion command ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Completed,
    Aborted(String),
    Failed(String),
}

/// Handle on an accepted command, resolved once the dome has finished the
/// motion or the command has been superseded.
#[derive(Debug)]
pub struct CommandHandle {
    name: &'static str,
    outcome: oneshot::Receiver<CommandOutcome>,
}

impl CommandHandle {
    fn resolved(name: &'static str, outcome: CommandOutcome) -> CommandHandle {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(outcome);
        CommandHandle {
            name,
            outcome: receiver,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn wait(self) -> CommandOutcome {
        self.outcome
            .await
            .unwrap_or_else(|_| CommandOutcome::Failed("engine dropped the command".to_owned()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    InPosition(AxisMask),
    /// Homing bit clear with azimuth halted, on a poll after `HM` was sent.
    Homed,
}

#[derive(Debug)]
struct PendingCommand {
    name: &'static str,
    axes: AxisMask,
    completion: Completion,
    done: oneshot::Sender<CommandOutcome>,
}

impl PendingCommand {
    /// True once the motion is finished.
    ///
    /// Only called with states polled after the command was acknowledged.
    fn settled(&self, state: &DomeState) -> bool {
        match self.completion {
            Completion::InPosition(axes) => state.in_position_mask.contains(axes),
            Completion::Homed => {
                !state.homing && state.azimuth_state == AzimuthState::NotInMotion
            }
        }
    }

    /// Is this command superseded by a new command moving `axes`?
    ///
    /// A single-door move leaves a pending shutter move in place.
    fn superseded_by(&self, axes: AxisMask) -> bool {
        let single_door = axes == AxisMask::MAIN_DOOR || axes == AxisMask::DROPOUT_DOOR;
        self.axes.intersects(axes) && !(single_door && self.axes.contains(AxisMask::DOORS))
    }
}

#[derive(Debug, Default)]
struct Inner {
    connection_state: ConnectionState,
    /// Bumped by every connect attempt and every disconnect.
    connect_attempt: u64,
    generation: u64,
    poll_state: PollState,
    commanded: CommandedState,
    snapshot: Option<DomeSnapshot>,
    state: Option<DomeState>,
    pending: Vec<PendingCommand>,
}

/// State shared by the coordinator and the status loop.
#[derive(Debug)]
pub(crate) struct EngineState {
    pub(crate) config: DomeConfig,
    parser: StatusParser,
    connection: tokio::sync::Mutex<Option<ATDomeModel>>,
    inner: Mutex<Inner>,
    state_sender: watch::Sender<Option<DomeState>>,
    event_sender: broadcast::Sender<DomeEvent>,
    wake_poll: Notify,
}

impl EngineState {
    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_connected(&self, generation: u64) -> bool {
        let inner = self.lock_inner();
        inner.connection_state == ConnectionState::Connected && inner.generation == generation
    }

    pub(crate) fn stop_polling(&self, generation: u64) {
        let mut inner = self.lock_inner();
        if inner.generation == generation {
            inner.poll_state = PollState::Stopped;
        }
    }

    /// Sleep for the status interval, or less if a command arrives.
    pub(crate) async fn sleep_interruptible(&self) {
        tokio::select! {
            _ = sleep(self.config.status_interval()) => {}
            _ = self.wake_poll.notified() => {
                log::trace!("Status sleep interrupted.");
            }
        }
    }

    /// Run one exchange with the lock held by the caller.
    ///
    /// A connection-fatal error drops the connection and reports a fault.
    async fn exchange_locked(
        &self,
        connection: &mut Option<ATDomeModel>,
        atdome_cmd: &ATDomeCmd,
    ) -> ATDomeResult<Vec<String>> {
        let model = connection.as_mut().ok_or(ATDomeError::NotConnected)?;
        match model.send_and_receive(atdome_cmd).await {
            Err(err) if err.is_connection_fatal() => {
                log::error!("TCP/IP read failed: {err}");
                if let Some(model) = connection.take() {
                    self.report_fault(&err);
                    self.mark_disconnected(&format!("connection lost: {err}"));
                    model.disconnect().await;
                }
                Err(err)
            }
            result => result,
        }
    }

    /// Request a status and publish it, both under the connection lock.
    ///
    /// A command accepted after this returns is never settled by the
    /// status read here. Decoding failures are logged, not returned.
    pub(crate) async fn poll_status(&self, atdome_cmd: &ATDomeCmd) -> ATDomeResult<()> {
        let mut connection = self.connection.lock().await;
        let lines = self.exchange_locked(&mut connection, atdome_cmd).await?;
        if let Err(err) = self.handle_status(atdome_cmd, &lines) {
            log::error!("Could not handle {atdome_cmd:?} status: {err}");
        }
        Ok(())
    }

    fn mark_disconnected(&self, reason: &str) {
        let pending = {
            let mut inner = self.lock_inner();
            inner.connection_state = ConnectionState::Disconnected;
            std::mem::take(&mut inner.pending)
        };
        for command in pending {
            let _ = command
                .done
                .send(CommandOutcome::Failed(reason.to_owned()));
        }
        self.wake_poll.notify_one();
        let _ = self.event_sender.send(DomeEvent::Disconnected);
    }

    fn report_fault(&self, err: &ATDomeError) {
        if let Some(error_code) = err.error_code() {
            let _ = self.event_sender.send(DomeEvent::Fault {
                error_code,
                report: err.to_string(),
            });
        }
    }

    /// Decode a status reply and publish the new dome state.
    fn handle_status(
        &self,
        atdome_cmd: &ATDomeCmd,
        lines: &[String],
    ) -> ATDomeResult<DomeState> {
        let mut inner = self.lock_inner();
        let snapshot = match atdome_cmd {
            ATDomeCmd::GetFullStatus => DomeSnapshot::from_full(&self.parser.decode_full(lines)?),
            _ => {
                let settings = inner.snapshot.and_then(|snapshot| snapshot.settings);
                DomeSnapshot::from_short(&self.parser.decode_short(lines)?, settings)
            }
        };
        let state = DomeState::derive(snapshot, inner.commanded, self.config.az_tolerance)?;

        report_sensor_changes(inner.snapshot.as_ref(), &snapshot);
        inner.snapshot = Some(snapshot);
        inner.state = Some(state);

        let (settled, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.pending)
            .into_iter()
            .map(|command| (command.settled(&state), command))
            .partition(|(settled, _)| *settled);
        inner.pending = pending.into_iter().map(|(_, command)| command).collect();
        for (_, command) in settled {
            log::debug!("{} done.", command.name);
            let _ = command.done.send(CommandOutcome::Completed);
        }

        self.state_sender.send_replace(Some(state));
        Ok(state)
    }
}

fn report_sensor_changes(old: Option<&DomeSnapshot>, new: &DomeSnapshot) {
    // Both states are logged at the same level so either both or neither
    // show up.
    if old.map(DomeSnapshot::rain_detected) != Some(new.rain_detected()) {
        log::warn!("rain_detected={}", new.rain_detected());
    }
    if old.map(DomeSnapshot::clouds_detected) != Some(new.clouds_detected()) {
        log::warn!("clouds_detected={}", new.clouds_detected());
    }
}

/// Commanded-state update and completion rule of one motion command.
struct Motion {
    name: &'static str,
    atdome_cmd: ATDomeCmd,
    axes: AxisMask,
    completion: Completion,
    update: fn(&mut CommandedState, &ATDomeCmd),
}

pub struct ATDomeCoordinator {
    engine: Arc<EngineState>,
    status_task: Mutex<Option<JoinHandle<()>>>,
}

impl ATDomeCoordinator {
    pub fn new(config: DomeConfig) -> ATDomeResult<ATDomeCoordinator> {
        config.validate()?;
        let (state_sender, _) = watch::channel(None);
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Ok(ATDomeCoordinator {
            engine: Arc::new(EngineState {
                config,
                parser: StatusParser::new()?,
                connection: tokio::sync::Mutex::new(None),
                inner: Mutex::new(Inner::default()),
                state_sender,
                event_sender,
                wake_poll: Notify::new(),
            }),
            status_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &DomeConfig {
        &self.engine.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.engine.lock_inner().connection_state
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn poll_state(&self) -> PollState {
        self.engine.lock_inner().poll_state
    }

    pub fn commanded_state(&self) -> CommandedState {
        self.engine.lock_inner().commanded
    }

    /// Latest published dome state, if any status has been read.
    pub fn state(&self) -> Option<DomeState> {
        *self.engine.state_sender.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<Option<DomeState>> {
        self.engine.state_sender.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DomeEvent> {
        self.engine.event_sender.subscribe()
    }

    /// Connect to the controller and start the status loop.
    ///
    /// A call while a connection attempt is in progress, or while already
    /// connected, does nothing. A `disconnect` while connecting cancels the
    /// attempt.
    pub async fn connect(&self) -> ATDomeResult<()> {
        let attempt = {
            let mut inner = self.engine.lock_inner();
            match inner.connection_state {
                ConnectionState::Connecting => {
                    log::warn!("Already connecting; ignoring connect request.");
                    return Ok(());
                }
                ConnectionState::Connected => {
                    log::warn!("Already connected; ignoring connect request.");
                    return Ok(());
                }
                ConnectionState::Disconnected => {
                    inner.connection_state = ConnectionState::Connecting;
                }
            }
            inner.connect_attempt += 1;
            inner.connect_attempt
        };

        let config = &self.engine.config;
        log::info!("Connecting to {}:{}.", config.host, config.port);
        let model = match ATDomeModel::connect(
            &config.host,
            config.port,
            config.connection_timeout(),
            config.read_timeout(),
        )
        .await
        {
            Ok(model) => model,
            Err(err) => {
                let mut inner = self.engine.lock_inner();
                if inner.connect_attempt == attempt {
                    log::error!("{err}");
                    inner.connection_state = ConnectionState::Disconnected;
                    drop(inner);
                    self.engine.report_fault(&err);
                } else {
                    log::debug!("Cancelled connection attempt failed: {err}");
                }
                return Err(err);
            }
        };

        let mut connection = self.engine.connection.lock().await;
        let generation = {
            let mut inner = self.engine.lock_inner();
            if inner.connect_attempt == attempt {
                inner.connection_state = ConnectionState::Connected;
                inner.generation += 1;
                inner.poll_state = PollState::Polling;
                Some(inner.generation)
            } else {
                None
            }
        };
        let Some(generation) = generation else {
            drop(connection);
            log::info!("Disconnect requested while connecting; closing new connection.");
            model.disconnect().await;
            return Err(ATDomeError::rejected("disconnected while connecting"));
        };
        *connection = Some(model);
        drop(connection);
        log::info!("Connected.");
        let _ = self.engine.event_sender.send(DomeEvent::Connected);

        let status_task = tokio::spawn(run_status_loop(self.engine.clone(), generation));
        let previous = self
            .status_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(status_task);
        if let Some(previous) = previous {
            if !previous.is_finished() {
                log::warn!("Previous status loop still running; detaching it.");
            }
        }
        Ok(())
    }

    /// Close the connection and wait for the status loop to notice.
    ///
    /// Safe to call when not connected.
    pub async fn disconnect(&self) {
        self.engine.lock_inner().connect_attempt += 1;
        let model = self.engine.connection.lock().await.take();
        if let Some(model) = model {
            log::info!("Disconnecting.");
            self.engine.mark_disconnected("disconnected");
            model.disconnect().await;
        } else {
            self.engine.lock_inner().connection_state = ConnectionState::Disconnected;
            self.engine.wake_poll.notify_one();
        }

        let status_task = self
            .status_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(status_task) = status_task {
            let limit = self.engine.config.read_timeout() * 2;
            if timeout(limit, status_task).await.is_err() {
                log::warn!("Status loop did not finish within {limit:?}.");
            }
        }
    }

    /// Move azimuth to `azimuth` degrees, in [0, 360].
    pub async fn move_azimuth(&self, azimuth: f64) -> ATDomeResult<CommandHandle> {
        if !(0.0..=360.0).contains(&azimuth) {
            return Err(ATDomeError::rejected(format!(
                "azimuth={azimuth} deg; must be in range [0, 360]"
            )));
        }
        self.dispatch(Motion {
            name: "moveAzimuth",
            atdome_cmd: ATDomeCmd::MoveAz(azimuth),
            axes: AxisMask::AZIMUTH,
            completion: Completion::InPosition(AxisMask::AZIMUTH),
            update: |commanded, atdome_cmd| {
                if let ATDomeCmd::MoveAz(azimuth) = atdome_cmd {
                    commanded.azimuth = AzimuthCommandedState::GoToPosition(*azimuth);
                }
            },
        })
        .await
    }

    pub async fn home_azimuth(&self) -> ATDomeResult<CommandHandle> {
        self.dispatch(Motion {
            name: "homeAzimuth",
            atdome_cmd: ATDomeCmd::HomeAzimuth,
            axes: AxisMask::AZIMUTH,
            completion: Completion::Homed,
            update: |commanded, _| commanded.azimuth = AzimuthCommandedState::Home,
        })
        .await
    }

    pub async fn open_shutter(&self) -> ATDomeResult<CommandHandle> {
        self.dispatch(Motion {
            name: "openShutter",
            atdome_cmd: ATDomeCmd::OpenShutter,
            axes: AxisMask::DOORS,
            completion: Completion::InPosition(AxisMask::DOORS),
            update: |commanded, _| {
                commanded.main_door = ShutterDoorCommandedState::Open;
                commanded.dropout_door = ShutterDoorCommandedState::Open;
            },
        })
        .await
    }

    pub async fn close_shutter(&self) -> ATDomeResult<CommandHandle> {
        self.dispatch(Motion {
            name: "closeShutter",
            atdome_cmd: ATDomeCmd::CloseShutter,
            axes: AxisMask::DOORS,
            completion: Completion::InPosition(AxisMask::DOORS),
            update: |commanded, _| {
                commanded.main_door = ShutterDoorCommandedState::Close;
                commanded.dropout_door = ShutterDoorCommandedState::Close;
            },
        })
        .await
    }

    /// Open or close the dropout door; the main door must be fully open.
    pub async fn move_dropout_door(&self, open: bool) -> ATDomeResult<CommandHandle> {
        let (atdome_cmd, name) = if open {
            (ATDomeCmd::OpenShutterDropoutDoor, "moveShutterDropoutDoor(open)")
        } else {
            (ATDomeCmd::CloseShutterDropoutDoor, "moveShutterDropoutDoor(close)")
        };
        self.dispatch(Motion {
            name,
            atdome_cmd,
            axes: AxisMask::DROPOUT_DOOR,
            completion: Completion::InPosition(AxisMask::DROPOUT_DOOR),
            update: |commanded, atdome_cmd| {
                commanded.dropout_door = if *atdome_cmd == ATDomeCmd::OpenShutterDropoutDoor {
                    ShutterDoorCommandedState::Open
                } else {
                    ShutterDoorCommandedState::Close
                };
            },
        })
        .await
    }

    /// Open or close the main door; closing requires the dropout door to be
    /// fully open or fully closed.
    pub async fn move_main_door(&self, open: bool) -> ATDomeResult<CommandHandle> {
        let (atdome_cmd, name) = if open {
            (ATDomeCmd::OpenShutterMainDoor, "moveShutterMainDoor(open)")
        } else {
            (ATDomeCmd::CloseShutterMainDoor, "moveShutterMainDoor(close)")
        };
        self.dispatch(Motion {
            name,
            atdome_cmd,
            axes: AxisMask::MAIN_DOOR,
            completion: Completion::InPosition(AxisMask::MAIN_DOOR),
            update: |commanded, atdome_cmd| {
                commanded.main_door = if *atdome_cmd == ATDomeCmd::OpenShutterMainDoor {
                    ShutterDoorCommandedState::Open
                } else {
                    ShutterDoorCommandedState::Close
                };
            },
        })
        .await
    }

    /// Stop all axes; every outstanding motion command is aborted.
    pub async fn stop_motion(&self) -> ATDomeResult<CommandHandle> {
        let mut connection = self.engine.connection.lock().await;
        if connection.is_none() {
            return Err(ATDomeError::NotConnected);
        }
        self.supersede(AxisMask::ALL, "stopMotion");
        let previous = self.commanded_state();
        self.update_commanded(|commanded| {
            *commanded = CommandedState {
                azimuth: AzimuthCommandedState::Stop,
                main_door: ShutterDoorCommandedState::Stop,
                dropout_door: ShutterDoorCommandedState::Stop,
            };
        });
        if let Err(err) = self
            .engine
            .exchange_locked(&mut connection, &ATDomeCmd::StopMotion)
            .await
        {
            self.update_commanded(|commanded| *commanded = previous);
            return Err(err);
        }
        drop(connection);
        self.engine.wake_poll.notify_one();
        Ok(CommandHandle::resolved(
            "stopMotion",
            CommandOutcome::Completed,
        ))
    }

    async fn dispatch(&self, motion: Motion) -> ATDomeResult<CommandHandle> {
        let mut connection = self.engine.connection.lock().await;
        if connection.is_none() {
            return Err(ATDomeError::NotConnected);
        }
        self.check_preconditions(&motion.atdome_cmd)?;

        // Superseded commands are aborted before the new one is sent, and
        // stay aborted if the controller then rejects it.
        self.supersede(motion.axes, motion.name);
        let previous = self.commanded_state();
        self.update_commanded(|commanded| (motion.update)(commanded, &motion.atdome_cmd));
        log::info!("{} accepted.", motion.name);
        if let Err(err) = self
            .engine
            .exchange_locked(&mut connection, &motion.atdome_cmd)
            .await
        {
            self.update_commanded(|commanded| *commanded = previous);
            return Err(err);
        }

        // Registered before the lock is released, so the next poll already
        // reflects the command.
        let (done, outcome) = oneshot::channel();
        self.engine.lock_inner().pending.push(PendingCommand {
            name: motion.name,
            axes: motion.axes,
            completion: motion.completion,
            done,
        });
        drop(connection);
        self.engine.wake_poll.notify_one();

        Ok(CommandHandle {
            name: motion.name,
            outcome,
        })
    }

    fn check_preconditions(&self, atdome_cmd: &ATDomeCmd) -> ATDomeResult<()> {
        let inner = self.engine.lock_inner();
        let state = inner.state.as_ref();
        let homing = state.is_some_and(|state| state.homing);

        match atdome_cmd {
            ATDomeCmd::MoveAz(_) | ATDomeCmd::HomeAzimuth if homing => {
                Err(ATDomeError::rejected("azimuth is homing"))
            }
            ATDomeCmd::OpenShutterDropoutDoor | ATDomeCmd::CloseShutterDropoutDoor => {
                match state.map(|state| state.main_door_state) {
                    Some(ShutterDoorState::Opened) => Ok(()),
                    main_door_state => Err(ATDomeError::rejected(format!(
                        "main door must be fully open to move the dropout door; \
                         main door state is {main_door_state:?}"
                    ))),
                }
            }
            ATDomeCmd::CloseShutterMainDoor => match state.map(|state| state.dropout_door_state) {
                Some(ShutterDoorState::Closed | ShutterDoorState::Opened) => Ok(()),
                dropout_door_state => Err(ATDomeError::rejected(format!(
                    "dropout door must be fully open or closed to close the main door; \
                     dropout door state is {dropout_door_state:?}"
                ))),
            },
            _ => Ok(()),
        }
    }

    /// Abort outstanding commands that move any of `axes`.
    fn supersede(&self, axes: AxisMask, by: &str) {
        let superseded: Vec<PendingCommand> = {
            let mut inner = self.engine.lock_inner();
            let (superseded, kept) = std::mem::take(&mut inner.pending)
                .into_iter()
                .partition(|command| command.superseded_by(axes));
            inner.pending = kept;
            superseded
        };
        for command in superseded {
            log::info!("{} superseded by {by}.", command.name);
            let _ = command
                .done
                .send(CommandOutcome::Aborted(format!("superseded by {by}")));
        }
    }

    /// Apply `update` and republish the state derived from the last snapshot.
    fn update_commanded(&self, update: impl FnOnce(&mut CommandedState)) {
        let mut inner = self.engine.lock_inner();
        update(&mut inner.commanded);
        let Some(snapshot) = inner.snapshot else {
            return;
        };
        match DomeState::derive(snapshot, inner.commanded, self.engine.config.az_tolerance) {
            Ok(state) => {
                inner.state = Some(state);
                self.engine.state_sender.send_replace(Some(state));
            }
            Err(err) => log::error!("Cannot derive state for new command: {err}"),
        }
    }
}

impl Drop for ATDomeCoordinator {
    fn drop(&mut self) {
        if let Some(status_task) = self
            .status_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            status_task.abort();
        }
    }
}
