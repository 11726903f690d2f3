//! Commanded and measured state of the dome axes.
//!
//! Everything here is a pure function of the latest [`DomeSnapshot`] and the
//! current [`CommandedState`]; nothing is accumulated between polls.

use crate::{
    error::{ATDomeError, ATDomeResult},
    move_code::{AxisMask, MoveCode},
    status::DomeSnapshot,
};

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub enum AzimuthCommandedState {
    #[default]
    Unknown,
    GoToPosition(f64),
    Home,
    Stop,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ShutterDoorCommandedState {
    #[default]
    Unknown,
    Open,
    Close,
    Stop,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CommandedState {
    pub azimuth: AzimuthCommandedState,
    pub main_door: ShutterDoorCommandedState,
    pub dropout_door: ShutterDoorCommandedState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AzimuthState {
    NotInMotion,
    MovingCW,
    MovingCCW,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutterDoorState {
    Closed,
    Opened,
    PartiallyOpened,
    Opening,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Door {
    Main,
    Dropout,
}

impl Door {
    pub fn axis(&self) -> AxisMask {
        match self {
            Door::Main => AxisMask::MAIN_DOOR,
            Door::Dropout => AxisMask::DROPOUT_DOOR,
        }
    }

    fn closing(&self, move_code: MoveCode) -> bool {
        match self {
            Door::Main => move_code.main_door_closing(),
            Door::Dropout => move_code.dropout_door_closing(),
        }
    }

    fn opening(&self, move_code: MoveCode) -> bool {
        match self {
            Door::Main => move_code.main_door_opening(),
            Door::Dropout => move_code.dropout_door_opening(),
        }
    }

    fn open_pct(&self, snapshot: &DomeSnapshot) -> f64 {
        match self {
            Door::Main => snapshot.main_door_pct,
            Door::Dropout => snapshot.dropout_door_pct,
        }
    }

    pub fn state(&self, snapshot: &DomeSnapshot) -> ATDomeResult<ShutterDoorState> {
        door_state(
            self.open_pct(snapshot),
            self.closing(snapshot.move_code),
            self.opening(snapshot.move_code),
        )
        .map_err(|_| {
            ATDomeError::InvalidMoveCode(format!(
                "{self:?} door both closing and opening in move_code={}",
                snapshot.move_code.bits()
            ))
        })
    }
}

/// Shortest signed difference `a - b`, in degrees, wrapped to [-180, 180).
pub fn angle_diff(a: f64, b: f64) -> f64 {
    (a - b + 180.0).rem_euclid(360.0) - 180.0
}

/// Azimuth motion from the move code.
///
/// AzPositive is reported as clockwise and AzNegative as counter-clockwise.
/// Consumers rely on this mapping; it has not been verified against the
/// real controller.
pub fn azimuth_state(move_code: MoveCode) -> AzimuthState {
    if move_code.az_positive() {
        AzimuthState::MovingCW
    } else if move_code.az_negative() {
        AzimuthState::MovingCCW
    } else {
        AzimuthState::NotInMotion
    }
}

pub fn door_state(open_pct: f64, closing: bool, opening: bool) -> ATDomeResult<ShutterDoorState> {
    match (closing, opening) {
        (false, false) if open_pct == 0.0 => Ok(ShutterDoorState::Closed),
        (false, false) if open_pct == 100.0 => Ok(ShutterDoorState::Opened),
        (false, false) => Ok(ShutterDoorState::PartiallyOpened),
        (true, false) => Ok(ShutterDoorState::Closing),
        (false, true) => Ok(ShutterDoorState::Opening),
        (true, true) => Err(ATDomeError::InvalidMoveCode(format!(
            "closing and opening both set at {open_pct}%"
        ))),
    }
}

fn door_in_position(
    open_pct: f64,
    halted: bool,
    commanded: ShutterDoorCommandedState,
) -> bool {
    let target = match commanded {
        ShutterDoorCommandedState::Open => 100.0,
        ShutterDoorCommandedState::Close => 0.0,
        ShutterDoorCommandedState::Unknown | ShutterDoorCommandedState::Stop => return false,
    };
    halted && open_pct == target
}

/// Mask of the axes that are halted at their commanded target.
pub fn in_position_mask(
    snapshot: &DomeSnapshot,
    commanded: &CommandedState,
    az_tolerance: f64,
) -> AxisMask {
    let move_code = snapshot.move_code;
    let mut mask = AxisMask::NONE;

    if let AzimuthCommandedState::GoToPosition(target) = commanded.azimuth {
        if move_code.az_halted() && angle_diff(snapshot.az_pos, target).abs() < az_tolerance {
            mask |= AxisMask::AZIMUTH;
        }
    }

    let main_halted = !move_code.main_door_closing() && !move_code.main_door_opening();
    if door_in_position(snapshot.main_door_pct, main_halted, commanded.main_door) {
        mask |= AxisMask::MAIN_DOOR;
    }

    let dropout_halted = !move_code.dropout_door_closing() && !move_code.dropout_door_opening();
    if door_in_position(snapshot.dropout_door_pct, dropout_halted, commanded.dropout_door) {
        mask |= AxisMask::DROPOUT_DOOR;
    }

    mask
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InPositionFlags {
    pub azimuth: bool,
    pub shutter: bool,
    pub all_axes: bool,
}

impl From<AxisMask> for InPositionFlags {
    fn from(mask: AxisMask) -> InPositionFlags {
        InPositionFlags {
            azimuth: mask.contains(AxisMask::AZIMUTH),
            shutter: mask.contains(AxisMask::DOORS),
            all_axes: mask.contains(AxisMask::ALL),
        }
    }
}

/// Immutable state published after every status poll or accepted command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DomeState {
    pub snapshot: DomeSnapshot,
    pub commanded: CommandedState,
    pub azimuth_state: AzimuthState,
    pub homing: bool,
    pub main_door_state: ShutterDoorState,
    pub dropout_door_state: ShutterDoorState,
    pub in_position_mask: AxisMask,
    pub in_position: InPositionFlags,
    pub estop_active: bool,
}

impl DomeState {
    pub fn derive(
        snapshot: DomeSnapshot,
        commanded: CommandedState,
        az_tolerance: f64,
    ) -> ATDomeResult<DomeState> {
        let in_position_mask = in_position_mask(&snapshot, &commanded, az_tolerance);
        Ok(DomeState {
            azimuth_state: azimuth_state(snapshot.move_code),
            homing: snapshot.move_code.homing(),
            main_door_state: Door::Main.state(&snapshot)?,
            dropout_door_state: Door::Dropout.state(&snapshot)?,
            in_position_mask,
            in_position: InPositionFlags::from(in_position_mask),
            estop_active: snapshot.estop_active(),
            snapshot,
            commanded,
        })
    }

    pub fn door_state(&self, door: Door) -> ShutterDoorState {
        match door {
            Door::Main => self.main_door_state,
            Door::Dropout => self.dropout_door_state,
        }
    }
}
