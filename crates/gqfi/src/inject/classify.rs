//! Result classification (spec.md §4.3.3).

use serde::{Deserialize, Serialize};

use crate::driver::HitSymbol;
use crate::error::GqfiError;

/// Integer codes match the on-disk result format exactly
/// (`0=OK, 1=DETECTED, 2=SDC, 3=TIMEOUT, 4=ERROR, 5=TRAP`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Outcome {
    Ok,
    Detected,
    Sdc,
    Timeout,
    Error,
    Trap,
}

impl From<Outcome> for u8 {
    fn from(o: Outcome) -> u8 {
        match o {
            Outcome::Ok => 0,
            Outcome::Detected => 1,
            Outcome::Sdc => 2,
            Outcome::Timeout => 3,
            Outcome::Error => 4,
            Outcome::Trap => 5,
        }
    }
}

impl TryFrom<u8> for Outcome {
    type Error = GqfiError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Outcome::Ok),
            1 => Ok(Outcome::Detected),
            2 => Ok(Outcome::Sdc),
            3 => Ok(Outcome::Timeout),
            4 => Ok(Outcome::Error),
            5 => Ok(Outcome::Trap),
            other => Err(GqfiError::ResultStore(format!(
                "outcome code out of range 0..=5: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// Everything the classifier needs to decide one experiment's outcome, in
/// the priority order of spec.md §4.3.3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaltObservation {
    pub timed_out: bool,
    pub halt: HaltLocation,
    pub serial_matches_golden: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HaltLocation {
    Detected,
    Finished,
    Trap,
    Other,
    Disconnected,
}

impl From<&HitSymbol> for HaltLocation {
    fn from(h: &HitSymbol) -> Self {
        match h {
            HitSymbol::Disconnected => HaltLocation::Disconnected,
            HitSymbol::Symbol(_) => HaltLocation::Other,
        }
    }
}

pub fn classify(obs: &HaltObservation) -> Outcome {
    if obs.timed_out {
        return Outcome::Timeout;
    }
    match obs.halt {
        HaltLocation::Detected => Outcome::Detected,
        HaltLocation::Finished => match obs.serial_matches_golden {
            Some(true) => Outcome::Ok,
            Some(false) | None => Outcome::Sdc,
        },
        HaltLocation::Trap => Outcome::Trap,
        HaltLocation::Other | HaltLocation::Disconnected => Outcome::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(timed_out: bool, halt: HaltLocation, serial_matches: Option<bool>) -> HaltObservation {
        HaltObservation {
            timed_out,
            halt,
            serial_matches_golden: serial_matches,
        }
    }

    #[test]
    fn timeout_wins_over_everything() {
        assert_eq!(
            classify(&obs(true, HaltLocation::Detected, Some(true))),
            Outcome::Timeout
        );
    }

    #[test]
    fn detected_beats_finished() {
        assert_eq!(
            classify(&obs(false, HaltLocation::Detected, None)),
            Outcome::Detected
        );
    }

    #[test]
    fn finished_with_matching_serial_is_ok() {
        assert_eq!(
            classify(&obs(false, HaltLocation::Finished, Some(true))),
            Outcome::Ok
        );
    }

    #[test]
    fn finished_without_match_is_sdc() {
        assert_eq!(
            classify(&obs(false, HaltLocation::Finished, Some(false))),
            Outcome::Sdc
        );
    }

    #[test]
    fn finished_with_no_datagram_is_sdc() {
        assert_eq!(
            classify(&obs(false, HaltLocation::Finished, None)),
            Outcome::Sdc
        );
    }

    #[test]
    fn trap_halt_is_trap() {
        assert_eq!(classify(&obs(false, HaltLocation::Trap, None)), Outcome::Trap);
    }

    #[test]
    fn unexpected_halt_is_error() {
        assert_eq!(classify(&obs(false, HaltLocation::Other, None)), Outcome::Error);
        assert_eq!(
            classify(&obs(false, HaltLocation::Disconnected, None)),
            Outcome::Error
        );
    }
}
