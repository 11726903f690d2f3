use std::str::FromStr;

use regex::Regex;

use crate::{
    error::{ATDomeError, ATDomeResult},
    move_code::MoveCode,
    status::{ControllerSettings, FullStatus, ShortStatus, FULL_STATUS_LINES, SHORT_STATUS_LINES},
};

const MAIN: &str = r"^MAIN +[A-Z]+ +(\d+)";
const DROP: &str = r"^DROP +[A-Z]+ +(\d+)";
const AUTO_SHUTDOWN: &str = r"^\[(ON|OFF)\] +(\d+)";
const AZ_POS_MATCH: &str = r"^(POSN|HOME) +(\d*\.?\d+)";
const MOVE_CODE: &str = r"^(RL|RR|--) +(\d+)";
const ESTOP_ACTIVE: &str = r"^Emergency Stop Active: +(\d)";
const SCB_LINK_OK: &str = r"^(?:Top Comm Link|SCB radio link) OK: +(\d)";
const HOME_AZIMUTH: &str = r"^Home Azimuth: +(\d*\.?\d+)";
const HIGH_SPEED: &str = r"^High Speed \(degrees\): +(\d*\.?\d+)";
const COAST: &str = r"^Coast \(degrees\): +(\d*\.?\d+)";
const TOLERANCE: &str = r"^Tolerance \(degrees\): +(\d*\.?\d+)";
const ENCODER_COUNTS_PER_360: &str = r"^Encoder Counts per 360: +(\d+)";
const ENCODER_COUNTS: &str = r"^Encoder Counts: +(\d+)";
const LAST_AZIMUTH_GOTO: &str = r"^Last Azimuth GoTo: +(\d*\.?\d+)";
const AZIMUTH_MOVE_TIMEOUT: &str = r"^Azimuth Move Timeout \(secs\): +(\d*\.?\d+)";
const RAIN_SENSOR_ENABLED: &str = r"^Rain-Snow enabled: +(\d)";
const CLOUD_SENSOR_ENABLED: &str = r"^Cloud Sensor enabled: +(\d)";
const WATCHDOG_TIMER: &str = r"^Watchdog Reset Time: +(\d*\.?\d+)";
const DROPOUT_TIMER: &str = r"^Dropout Timer: +(\d*\.?\d+)";
const REVERSAL_DELAY: &str = r"^Reverse Delay: +(\d*\.?\d+)";
const MAIN_DOOR_ENCODER_CLOSED: &str = r"^Main Door Encoder Closed: +(\d+)";
const MAIN_DOOR_ENCODER_OPENED: &str = r"^Main Door Encoder Opened: +(\d+)";
const DROPOUT_DOOR_ENCODER_CLOSED: &str = r"^Dropout Encoder Closed: +(\d+)";
const DROPOUT_DOOR_ENCODER_OPENED: &str = r"^Dropout Encoder Opened: +(\d+)";
const DOOR_MOVE_TIMEOUT: &str = r"^Door Move Timeout \(secs\): +(\d*\.?\d+)";

/// Decode the replies of the status commands.
///
/// Every line of the reply has a fixed position and format; a line that
/// does not match, or a field that does not parse as the expected numeric
/// type, is reported as `MalformedStatus`.
#[derive(Debug)]
pub struct StatusParser {
    main: Regex,
    drop: Regex,
    auto_shutdown: Regex,
    az_pos_match: Regex,
    move_code: Regex,
    estop_active: Regex,
    scb_link_ok: Regex,
    home_azimuth: Regex,
    high_speed: Regex,
    coast: Regex,
    tolerance: Regex,
    encoder_counts_per_360: Regex,
    encoder_counts: Regex,
    last_azimuth_goto: Regex,
    azimuth_move_timeout: Regex,
    rain_sensor_enabled: Regex,
    cloud_sensor_enabled: Regex,
    watchdog_timer: Regex,
    dropout_timer: Regex,
    reversal_delay: Regex,
    main_door_encoder_closed: Regex,
    main_door_encoder_opened: Regex,
    dropout_door_encoder_closed: Regex,
    dropout_door_encoder_opened: Regex,
    door_move_timeout: Regex,
}

impl StatusParser {
    pub fn new() -> ATDomeResult<StatusParser> {
        Ok(StatusParser {
            main: Regex::new(MAIN)?,
            drop: Regex::new(DROP)?,
            auto_shutdown: Regex::new(AUTO_SHUTDOWN)?,
            az_pos_match: Regex::new(AZ_POS_MATCH)?,
            move_code: Regex::new(MOVE_CODE)?,
            estop_active: Regex::new(ESTOP_ACTIVE)?,
            scb_link_ok: Regex::new(SCB_LINK_OK)?,
            home_azimuth: Regex::new(HOME_AZIMUTH)?,
            high_speed: Regex::new(HIGH_SPEED)?,
            coast: Regex::new(COAST)?,
            tolerance: Regex::new(TOLERANCE)?,
            encoder_counts_per_360: Regex::new(ENCODER_COUNTS_PER_360)?,
            encoder_counts: Regex::new(ENCODER_COUNTS)?,
            last_azimuth_goto: Regex::new(LAST_AZIMUTH_GOTO)?,
            azimuth_move_timeout: Regex::new(AZIMUTH_MOVE_TIMEOUT)?,
            rain_sensor_enabled: Regex::new(RAIN_SENSOR_ENABLED)?,
            cloud_sensor_enabled: Regex::new(CLOUD_SENSOR_ENABLED)?,
            watchdog_timer: Regex::new(WATCHDOG_TIMER)?,
            dropout_timer: Regex::new(DROPOUT_TIMER)?,
            reversal_delay: Regex::new(REVERSAL_DELAY)?,
            main_door_encoder_closed: Regex::new(MAIN_DOOR_ENCODER_CLOSED)?,
            main_door_encoder_opened: Regex::new(MAIN_DOOR_ENCODER_OPENED)?,
            dropout_door_encoder_closed: Regex::new(DROPOUT_DOOR_ENCODER_CLOSED)?,
            dropout_door_encoder_opened: Regex::new(DROPOUT_DOOR_ENCODER_OPENED)?,
            door_move_timeout: Regex::new(DOOR_MOVE_TIMEOUT)?,
        })
    }

    /// Decode the output of "?", or the first five lines of "+".
    pub fn decode_short<S: AsRef<str>>(&self, lines: &[S]) -> ATDomeResult<ShortStatus> {
        if lines.len() != SHORT_STATUS_LINES {
            return Err(ATDomeError::malformed(format!(
                "Got {} lines; need {SHORT_STATUS_LINES}.",
                lines.len()
            )));
        }
        let line = |index: usize| lines[index].as_ref();

        let main_door_pct: f64 = unwrap_capture(line(0), &self.main, 1)?;
        let dropout_door_pct: f64 = unwrap_capture(line(1), &self.drop, 1)?;
        let auto_shutdown: String = unwrap_capture(line(2), &self.auto_shutdown, 1)?;
        let sensor_code: u8 = unwrap_capture(line(2), &self.auto_shutdown, 2)?;
        let az_home_switch: String = unwrap_capture(line(3), &self.az_pos_match, 1)?;
        let az_pos: f64 = unwrap_capture(line(3), &self.az_pos_match, 2)?;
        let rotation: String = unwrap_capture(line(4), &self.move_code, 1)?;
        let move_code: u8 = unwrap_capture(line(4), &self.move_code, 2)?;

        Ok(ShortStatus {
            main_door_pct,
            dropout_door_pct,
            auto_shutdown_enabled: auto_shutdown == "ON",
            sensor_code,
            az_home_switch: az_home_switch == "HOME",
            az_pos,
            last_rot_right: match rotation.as_str() {
                "RR" => Some(true),
                "RL" => Some(false),
                _ => None,
            },
            move_code: MoveCode::new(move_code),
        })
    }

    /// Decode the output of "+".
    pub fn decode_full<S: AsRef<str>>(&self, lines: &[S]) -> ATDomeResult<FullStatus> {
        if lines.len() != FULL_STATUS_LINES {
            return Err(ATDomeError::malformed(format!(
                "Got {} lines; need {FULL_STATUS_LINES}.",
                lines.len()
            )));
        }
        let short = self.decode_short(&lines[..SHORT_STATUS_LINES])?;
        let line = |index: usize| lines[index].as_ref();

        let settings = ControllerSettings {
            estop_active: unwrap_flag(line(5), &self.estop_active)?,
            scb_link_ok: unwrap_flag(line(6), &self.scb_link_ok)?,
            home_azimuth: unwrap_capture(line(7), &self.home_azimuth, 1)?,
            high_speed: unwrap_capture(line(8), &self.high_speed, 1)?,
            coast: unwrap_capture(line(9), &self.coast, 1)?,
            tolerance: unwrap_capture(line(10), &self.tolerance, 1)?,
            encoder_counts_per_360: unwrap_capture(line(11), &self.encoder_counts_per_360, 1)?,
            encoder_counts: unwrap_capture(line(12), &self.encoder_counts, 1)?,
            last_azimuth_goto: unwrap_capture(line(13), &self.last_azimuth_goto, 1)?,
            azimuth_move_timeout: unwrap_capture(line(14), &self.azimuth_move_timeout, 1)?,
            rain_sensor_enabled: unwrap_flag(line(15), &self.rain_sensor_enabled)?,
            cloud_sensor_enabled: unwrap_flag(line(16), &self.cloud_sensor_enabled)?,
            watchdog_timer: unwrap_capture(line(17), &self.watchdog_timer, 1)?,
            dropout_timer: unwrap_capture(line(18), &self.dropout_timer, 1)?,
            reversal_delay: unwrap_capture(line(19), &self.reversal_delay, 1)?,
            main_door_encoder_closed: unwrap_capture(line(20), &self.main_door_encoder_closed, 1)?,
            main_door_encoder_opened: unwrap_capture(line(21), &self.main_door_encoder_opened, 1)?,
            dropout_door_encoder_closed: unwrap_capture(
                line(22),
                &self.dropout_door_encoder_closed,
                1,
            )?,
            dropout_door_encoder_opened: unwrap_capture(
                line(23),
                &self.dropout_door_encoder_opened,
                1,
            )?,
            door_move_timeout: unwrap_capture(line(24), &self.door_move_timeout, 1)?,
        };

        Ok(FullStatus { short, settings })
    }
}

fn unwrap_capture<T: FromStr>(line: &str, regex: &Regex, extract_group: usize) -> ATDomeResult<T> {
    let capture = regex
        .captures(line)
        .ok_or_else(|| ATDomeError::malformed(format!("Failed to match {line:?}")))?;
    let group = capture.get(extract_group).ok_or_else(|| {
        ATDomeError::malformed(format!(
            "Could not find group {extract_group} in {line:?}"
        ))
    })?;
    group.as_str().parse::<T>().map_err(|_| {
        ATDomeError::malformed(format!(
            "Cannot convert {:?} in {line:?} to the expected type",
            group.as_str()
        ))
    })
}

fn unwrap_flag(line: &str, regex: &Regex) -> ATDomeResult<bool> {
    Ok(unwrap_capture::<u8>(line, regex, 1)? > 0)
}
