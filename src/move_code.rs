//! Define the MoveCode bit field.
//!
//! The move code is the integer in line 5 of the short status and contains
//! one bit for each motor activity of the dome, plus the emergency stop.

use std::ops::{BitOr, BitOrAssign};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MoveCode(u8);

impl MoveCode {
    pub const AZ_POSITIVE: u8 = 0x01;
    pub const AZ_NEGATIVE: u8 = 0x02;
    pub const MAIN_DOOR_CLOSING: u8 = 0x04;
    pub const MAIN_DOOR_OPENING: u8 = 0x08;
    pub const DROPOUT_DOOR_CLOSING: u8 = 0x10;
    pub const DROPOUT_DOOR_OPENING: u8 = 0x20;
    pub const HOMING: u8 = 0x40;
    pub const ESTOP: u8 = 0x80;

    pub const fn new(bits: u8) -> MoveCode {
        MoveCode(bits)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn contains(&self, mask: u8) -> bool {
        self.0 & mask != 0
    }

    pub fn with(self, mask: u8) -> MoveCode {
        MoveCode(self.0 | mask)
    }

    pub fn az_positive(&self) -> bool {
        self.contains(MoveCode::AZ_POSITIVE)
    }

    pub fn az_negative(&self) -> bool {
        self.contains(MoveCode::AZ_NEGATIVE)
    }

    pub fn az_halted(&self) -> bool {
        !self.contains(MoveCode::AZ_POSITIVE | MoveCode::AZ_NEGATIVE)
    }

    pub fn main_door_closing(&self) -> bool {
        self.contains(MoveCode::MAIN_DOOR_CLOSING)
    }

    pub fn main_door_opening(&self) -> bool {
        self.contains(MoveCode::MAIN_DOOR_OPENING)
    }

    pub fn dropout_door_closing(&self) -> bool {
        self.contains(MoveCode::DROPOUT_DOOR_CLOSING)
    }

    pub fn dropout_door_opening(&self) -> bool {
        self.contains(MoveCode::DROPOUT_DOOR_OPENING)
    }

    pub fn homing(&self) -> bool {
        self.contains(MoveCode::HOMING)
    }

    pub fn estop(&self) -> bool {
        self.contains(MoveCode::ESTOP)
    }
}

impl From<u8> for MoveCode {
    fn from(bits: u8) -> MoveCode {
        MoveCode(bits)
    }
}

/// Set of dome axes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AxisMask(u8);

impl AxisMask {
    pub const NONE: AxisMask = AxisMask(0);
    pub const AZIMUTH: AxisMask = AxisMask(0x01);
    pub const DROPOUT_DOOR: AxisMask = AxisMask(0x02);
    pub const MAIN_DOOR: AxisMask = AxisMask(0x04);
    pub const DOORS: AxisMask = AxisMask(0x06);
    pub const ALL: AxisMask = AxisMask(0x07);

    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// True if every axis in `other` is also in `self`.
    pub const fn contains(&self, other: AxisMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(&self, other: AxisMask) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for AxisMask {
    type Output = AxisMask;

    fn bitor(self, rhs: AxisMask) -> AxisMask {
        AxisMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for AxisMask {
    fn bitor_assign(&mut self, rhs: AxisMask) {
        self.0 |= rhs.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_code_predicates() {
        let move_code = MoveCode::new(MoveCode::AZ_NEGATIVE | MoveCode::DROPOUT_DOOR_OPENING);

        assert!(move_code.az_negative());
        assert!(!move_code.az_positive());
        assert!(!move_code.az_halted());
        assert!(move_code.dropout_door_opening());
        assert!(!move_code.main_door_opening());
        assert!(!move_code.homing());
        assert!(!move_code.estop());
        assert_eq!(move_code.bits(), 34);
    }

    #[test]
    fn test_move_code_estop_and_homing() {
        let move_code = MoveCode::from(192);

        assert!(move_code.estop());
        assert!(move_code.homing());
        assert!(move_code.az_halted());
    }

    #[test]
    fn test_axis_mask() {
        let mut mask = AxisMask::NONE;
        assert!(mask.is_empty());

        mask |= AxisMask::MAIN_DOOR;
        assert!(mask.intersects(AxisMask::DOORS));
        assert!(!AxisMask::DOORS.contains(AxisMask::ALL));
        assert!(AxisMask::ALL.contains(AxisMask::DOORS));
        assert_eq!(AxisMask::MAIN_DOOR | AxisMask::DROPOUT_DOOR, AxisMask::DOORS);
        assert!(!AxisMask::AZIMUTH.intersects(AxisMask::DOORS));
    }
}
