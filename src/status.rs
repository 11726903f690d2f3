//! Define the status structs, representing all information available from
//! the ATDome controller, and their text encoding.

use crate::move_code::MoveCode;

/// Number of lines in the reply to the short status command.
pub const SHORT_STATUS_LINES: usize = 5;
/// Number of lines in the reply to the full status command.
pub const FULL_STATUS_LINES: usize = 25;

/// Output of the short status command "?".
///
/// The first five lines of the full status have the same content.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ShortStatus {
    pub main_door_pct: f64,
    pub dropout_door_pct: f64,
    pub auto_shutdown_enabled: bool,
    /// Bit 0 is rain detected, bit 1 is clouds detected.
    pub sensor_code: u8,
    pub az_home_switch: bool,
    pub az_pos: f64,
    /// Direction of the last azimuth rotation, if any: `Some(true)` is right.
    pub last_rot_right: Option<bool>,
    pub move_code: MoveCode,
}

/// Lines 6 to 25 of the full status command "+".
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ControllerSettings {
    pub estop_active: bool,
    pub scb_link_ok: bool,
    pub home_azimuth: f64,
    pub high_speed: f64,
    pub coast: f64,
    pub tolerance: f64,
    pub encoder_counts_per_360: u64,
    pub encoder_counts: u64,
    pub last_azimuth_goto: f64,
    pub azimuth_move_timeout: f64,
    pub rain_sensor_enabled: bool,
    pub cloud_sensor_enabled: bool,
    pub watchdog_timer: f64,
    pub dropout_timer: f64,
    pub reversal_delay: f64,
    pub main_door_encoder_closed: u64,
    pub main_door_encoder_opened: u64,
    pub dropout_door_encoder_closed: u64,
    pub dropout_door_encoder_opened: u64,
    pub door_move_timeout: f64,
}

/// Output of the full status command "+".
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct FullStatus {
    pub short: ShortStatus,
    pub settings: ControllerSettings,
}

/// Everything known about the dome after one status poll.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct DomeSnapshot {
    pub az_pos: f64,
    pub az_home_switch: bool,
    pub main_door_pct: f64,
    pub dropout_door_pct: f64,
    pub move_code: MoveCode,
    pub auto_shutdown_enabled: bool,
    pub sensor_code: u8,
    /// Only known once a full status has been read.
    pub settings: Option<ControllerSettings>,
    /// True if `settings` were read in this poll rather than carried over.
    pub settings_current: bool,
}

impl DomeSnapshot {
    /// Build the snapshot for a short status, keeping the settings of the
    /// last full status.
    pub fn from_short(short: &ShortStatus, settings: Option<ControllerSettings>) -> DomeSnapshot {
        DomeSnapshot {
            az_pos: short.az_pos,
            az_home_switch: short.az_home_switch,
            main_door_pct: short.main_door_pct,
            dropout_door_pct: short.dropout_door_pct,
            move_code: short.move_code,
            auto_shutdown_enabled: short.auto_shutdown_enabled,
            sensor_code: short.sensor_code,
            settings,
            settings_current: false,
        }
    }

    pub fn from_full(full: &FullStatus) -> DomeSnapshot {
        DomeSnapshot {
            settings_current: true,
            ..DomeSnapshot::from_short(&full.short, Some(full.settings))
        }
    }

    pub fn rain_detected(&self) -> bool {
        self.sensor_code & 0x01 != 0
    }

    pub fn clouds_detected(&self) -> bool {
        self.sensor_code & 0x02 != 0
    }

    /// E-stop from the move code, or from the settings line if this poll
    /// read a full status.
    pub fn estop_active(&self) -> bool {
        self.move_code.estop()
            || (self.settings_current
                && self.settings.is_some_and(|settings| settings.estop_active))
    }
}

fn door_line(name: &str, pct: f64) -> String {
    let state = if pct <= 0.0 {
        "CLOSED"
    } else if pct >= 100.0 {
        "OPEN"
    } else {
        "AJAR"
    };
    format!("{name} {state} {pct:03.0}")
}

fn flag(value: bool) -> u8 {
    u8::from(value)
}

impl ShortStatus {
    pub fn as_lines(&self) -> Vec<String> {
        let auto_shutdown = if self.auto_shutdown_enabled { "ON" } else { "OFF" };
        let position = if self.az_home_switch { "HOME" } else { "POSN" };
        let rotation = match self.last_rot_right {
            None => "--",
            Some(true) => "RR",
            Some(false) => "RL",
        };
        vec![
            door_line("MAIN", self.main_door_pct),
            door_line("DROP", self.dropout_door_pct),
            format!("[{auto_shutdown}] {:02}", self.sensor_code),
            format!("{position} {:0.2}", self.az_pos),
            format!("{rotation} {:03}", self.move_code.bits()),
        ]
    }
}

impl FullStatus {
    pub fn as_lines(&self) -> Vec<String> {
        let settings = &self.settings;
        let mut lines = self.short.as_lines();
        lines.extend([
            format!("Emergency Stop Active: {}", flag(settings.estop_active)),
            format!("Top Comm Link OK:    {}", flag(settings.scb_link_ok)),
            format!("Home Azimuth: {:5.2}", settings.home_azimuth),
            format!("High Speed (degrees): {:5.2}", settings.high_speed),
            format!("Coast (degrees): {:0.2}", settings.coast),
            format!("Tolerance (degrees): {:0.2}", settings.tolerance),
            format!("Encoder Counts per 360: {}", settings.encoder_counts_per_360),
            format!("Encoder Counts:  {}", settings.encoder_counts),
            format!("Last Azimuth GoTo: {:05.2}", settings.last_azimuth_goto),
            format!(
                "Azimuth Move Timeout (secs): {}",
                settings.azimuth_move_timeout
            ),
            format!("Rain-Snow enabled:  {}", flag(settings.rain_sensor_enabled)),
            format!(
                "Cloud Sensor enabled: {}",
                flag(settings.cloud_sensor_enabled)
            ),
            format!("Watchdog Reset Time: {}", settings.watchdog_timer),
            format!("Dropout Timer: {}", settings.dropout_timer),
            format!("Reverse Delay: {}", settings.reversal_delay),
            format!(
                "Main Door Encoder Closed: {}",
                settings.main_door_encoder_closed
            ),
            format!(
                "Main Door Encoder Opened: {}",
                settings.main_door_encoder_opened
            ),
            format!(
                "Dropout Encoder Closed: {}",
                settings.dropout_door_encoder_closed
            ),
            format!(
                "Dropout Encoder Opened: {}",
                settings.dropout_door_encoder_opened
            ),
            format!("Door Move Timeout (secs): {}", settings.door_move_timeout),
        ]);
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_status_lines() {
        let status = ShortStatus {
            main_door_pct: 55.0,
            dropout_door_pct: 100.0,
            auto_shutdown_enabled: true,
            sensor_code: 3,
            az_home_switch: false,
            az_pos: 262.914,
            last_rot_right: Some(false),
            move_code: MoveCode::new(MoveCode::AZ_NEGATIVE),
        };

        assert_eq!(
            status.as_lines(),
            vec![
                "MAIN AJAR 055",
                "DROP OPEN 100",
                "[ON] 03",
                "POSN 262.91",
                "RL 002",
            ]
        );
    }

    #[test]
    fn test_full_status_has_25_lines() {
        let status = FullStatus::default();

        let lines = status.as_lines();

        assert_eq!(lines.len(), FULL_STATUS_LINES);
        assert_eq!(lines[0], "MAIN CLOSED 000");
        assert_eq!(lines[4], "-- 000");
        assert_eq!(lines[24], "Door Move Timeout (secs): 0");
    }

    #[test]
    fn test_snapshot_sensor_flags() {
        let mut short = ShortStatus::default();
        short.sensor_code = 2;
        short.move_code = MoveCode::new(MoveCode::ESTOP);

        let snapshot = DomeSnapshot::from_short(&short, None);

        assert!(!snapshot.rain_detected());
        assert!(snapshot.clouds_detected());
        assert!(snapshot.estop_active());
        assert!(snapshot.settings.is_none());
    }

    #[test]
    fn test_snapshot_estop_from_settings() {
        let full = FullStatus {
            short: ShortStatus::default(),
            settings: ControllerSettings {
                estop_active: true,
                ..ControllerSettings::default()
            },
        };

        let snapshot = DomeSnapshot::from_full(&full);

        assert!(snapshot.estop_active());
        assert!(snapshot.settings.is_some());
    }

    #[test]
    fn test_short_status_clears_stale_estop() {
        let settings = ControllerSettings {
            estop_active: true,
            ..ControllerSettings::default()
        };

        let snapshot = DomeSnapshot::from_short(&ShortStatus::default(), Some(settings));

        assert!(!snapshot.estop_active());
        assert!(snapshot.settings.is_some_and(|settings| settings.estop_active));
    }
}
