use regex::{Regex, RegexSet};

use crate::{atdome_model::ATDomeCmd, error::ATDomeResult};

const MOVE_AZ_REGEX: &str = r"^(?P<az>-?[0-9]*\.?[0-9]+) +MV$";
const CLOSE_SHUTTER_REGEX: &str = r"^SC$";
const OPEN_SHUTTER_REGEX: &str = r"^SO$";
const STOP_MOTION_REGEX: &str = r"^ST$";
const HOME_AZIMUTH_REGEX: &str = r"^HM$";
const OPEN_DROPOUT_DOOR_REGEX: &str = r"^DN$";
const CLOSE_DROPOUT_DOOR_REGEX: &str = r"^UP$";
const OPEN_MAIN_DOOR_REGEX: &str = r"^OP$";
const CLOSE_MAIN_DOOR_REGEX: &str = r"^CL$";
const GET_SHORT_STATUS_REGEX: &str = r"^\?$";
const GET_FULL_STATUS_REGEX: &str = r"^\+$";

/// Parse the text of a controller command back into an [`ATDomeCmd`].
pub struct ATDomeCmdRegex {
    regex_set: RegexSet,
    move_az: Regex,
}

impl ATDomeCmdRegex {
    pub fn new() -> ATDomeResult<ATDomeCmdRegex> {
        let regex_set = RegexSet::new([
            MOVE_AZ_REGEX,
            CLOSE_SHUTTER_REGEX,
            OPEN_SHUTTER_REGEX,
            STOP_MOTION_REGEX,
            HOME_AZIMUTH_REGEX,
            OPEN_DROPOUT_DOOR_REGEX,
            CLOSE_DROPOUT_DOOR_REGEX,
            OPEN_MAIN_DOOR_REGEX,
            CLOSE_MAIN_DOOR_REGEX,
            GET_SHORT_STATUS_REGEX,
            GET_FULL_STATUS_REGEX,
        ])?;
        let move_az = Regex::new(MOVE_AZ_REGEX)?;

        Ok(ATDomeCmdRegex { regex_set, move_az })
    }

    fn get_match_index(&self, text: &str) -> Option<usize> {
        self.regex_set.matches(text).into_iter().next()
    }

    pub fn into_atdome_cmd(&self, text: &str) -> ATDomeCmd {
        let text = text.trim();
        match self.get_match_index(text) {
            Some(0) => self
                .move_az
                .captures(text)
                .and_then(|capture| capture["az"].parse().ok())
                .map_or(ATDomeCmd::Unknown, ATDomeCmd::MoveAz),
            Some(1) => ATDomeCmd::CloseShutter,
            Some(2) => ATDomeCmd::OpenShutter,
            Some(3) => ATDomeCmd::StopMotion,
            Some(4) => ATDomeCmd::HomeAzimuth,
            Some(5) => ATDomeCmd::OpenShutterDropoutDoor,
            Some(6) => ATDomeCmd::CloseShutterDropoutDoor,
            Some(7) => ATDomeCmd::OpenShutterMainDoor,
            Some(8) => ATDomeCmd::CloseShutterMainDoor,
            Some(9) => ATDomeCmd::GetShortStatus,
            Some(10) => ATDomeCmd::GetFullStatus,
            _ => ATDomeCmd::Unknown,
        }
    }
}
