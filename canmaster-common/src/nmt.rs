//! Definitions for the NMT protocol

use core::str::FromStr;

/// Possible NMT states for a node
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NmtState {
    /// Bootup
    ///
    /// A node never remains in this state, as all nodes should transition automatically into
    /// PreOperational
    Initialising = 0,
    /// Node has been stopped
    Stopped = 4,
    /// Normal operational state
    Operational = 5,
    /// Node is sleeping
    Sleep = 80,
    /// Node is in standby
    Standby = 96,
    /// Node is awaiting command to enter operation
    PreOperational = 127,
}

impl NmtState {
    /// The lower case name of the state
    pub fn name(&self) -> &'static str {
        match self {
            NmtState::Initialising => "initialising",
            NmtState::Stopped => "stopped",
            NmtState::Operational => "operational",
            NmtState::Sleep => "sleep",
            NmtState::Standby => "standby",
            NmtState::PreOperational => "pre-operational",
        }
    }

    /// Interpret the state byte of a heartbeat message
    ///
    /// The toggle bit (bit 7) is ignored. A bootup message (0) is reported as PreOperational,
    /// because a device which has just booted immediately enters that state.
    pub fn from_heartbeat(value: u8) -> Result<Self, InvalidNmtStateError> {
        match value & 0x7F {
            0 => Ok(NmtState::PreOperational),
            x => NmtState::try_from(x),
        }
    }
}

impl core::fmt::Display for NmtState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NmtState::Initialising => write!(f, "Initialising"),
            NmtState::Stopped => write!(f, "Stopped"),
            NmtState::Operational => write!(f, "Operational"),
            NmtState::Sleep => write!(f, "Sleep"),
            NmtState::Standby => write!(f, "Standby"),
            NmtState::PreOperational => write!(f, "PreOperational"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// An error for [`NmtState::try_from()`]
pub struct InvalidNmtStateError(pub u8);

impl core::fmt::Display for InvalidNmtStateError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Invalid NMT state {}", self.0)
    }
}

impl core::error::Error for InvalidNmtStateError {}

impl TryFrom<u8> for NmtState {
    type Error = InvalidNmtStateError;

    /// Attempt to convert a u8 to an NmtState enum
    ///
    /// Fails with InvalidNmtStateError if value is not a valid state
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use NmtState::*;
        match value {
            x if x == Initialising as u8 => Ok(Initialising),
            x if x == Stopped as u8 => Ok(Stopped),
            x if x == Operational as u8 => Ok(Operational),
            x if x == Sleep as u8 => Ok(Sleep),
            x if x == Standby as u8 => Ok(Standby),
            x if x == PreOperational as u8 => Ok(PreOperational),
            _ => Err(InvalidNmtStateError(value)),
        }
    }
}

/// NMT command specifiers, as sent in the first byte of an NMT command message
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtCommand {
    /// Enter the operational state
    Start = 1,
    /// Enter the stopped state
    Stop = 2,
    /// Enter the sleep state
    Sleep = 80,
    /// Enter the standby state
    Standby = 96,
    /// Enter the pre-operational state
    EnterPreOperational = 128,
    /// Reset the application (back through initialisation)
    ResetApp = 129,
    /// Reset the communication objects
    ResetComm = 130,
}

impl NmtCommand {
    /// The state a node is expected to report after receiving this command
    ///
    /// Resets return None, since the node passes through initialisation and reports its new
    /// state with a bootup message.
    pub fn target_state(&self) -> Option<NmtState> {
        match self {
            NmtCommand::Start => Some(NmtState::Operational),
            NmtCommand::Stop => Some(NmtState::Stopped),
            NmtCommand::Sleep => Some(NmtState::Sleep),
            NmtCommand::Standby => Some(NmtState::Standby),
            NmtCommand::EnterPreOperational => Some(NmtState::PreOperational),
            NmtCommand::ResetApp | NmtCommand::ResetComm => None,
        }
    }

    /// Build the two byte payload of an NMT command addressed to `node_id` (0 for broadcast)
    pub fn to_bytes(&self, node_id: u8) -> [u8; 2] {
        [*self as u8, node_id]
    }
}

/// Error returned when a target state name is not recognized
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidNmtCommandError(pub String);

impl core::fmt::Display for InvalidNmtCommandError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Invalid NMT state '{}'", self.0)
    }
}

impl core::error::Error for InvalidNmtCommandError {}

impl FromStr for NmtCommand {
    type Err = InvalidNmtCommandError;

    /// Parse a target state name, e.g. "OPERATIONAL" or "reset communication"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OPERATIONAL" => Ok(NmtCommand::Start),
            "STOPPED" => Ok(NmtCommand::Stop),
            "SLEEP" => Ok(NmtCommand::Sleep),
            "STANDBY" => Ok(NmtCommand::Standby),
            "PRE-OPERATIONAL" => Ok(NmtCommand::EnterPreOperational),
            "INITIALISING" | "RESET" => Ok(NmtCommand::ResetApp),
            "RESET COMMUNICATION" => Ok(NmtCommand::ResetComm),
            _ => Err(InvalidNmtCommandError(s.to_string())),
        }
    }
}

impl From<NmtState> for NmtCommand {
    fn from(value: NmtState) -> Self {
        match value {
            NmtState::Initialising => NmtCommand::ResetApp,
            NmtState::Stopped => NmtCommand::Stop,
            NmtState::Operational => NmtCommand::Start,
            NmtState::Sleep => NmtCommand::Sleep,
            NmtState::Standby => NmtCommand::Standby,
            NmtState::PreOperational => NmtCommand::EnterPreOperational,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_bootup_is_preoperational() {
        assert_eq!(Ok(NmtState::PreOperational), NmtState::from_heartbeat(0));
        assert_eq!(Ok(NmtState::Operational), NmtState::from_heartbeat(5));
        assert_eq!(Ok(NmtState::Operational), NmtState::from_heartbeat(0x85));
        assert_eq!(Err(InvalidNmtStateError(3)), NmtState::from_heartbeat(3));
    }

    #[test]
    fn test_parse_command_names() {
        assert_eq!(Ok(NmtCommand::Start), "OPERATIONAL".parse());
        assert_eq!(Ok(NmtCommand::EnterPreOperational), "pre-operational".parse());
        assert_eq!(Ok(NmtCommand::ResetComm), "RESET COMMUNICATION".parse());
        assert_eq!(Ok(NmtCommand::ResetApp), "RESET".parse());
        assert!("FLYING".parse::<NmtCommand>().is_err());
    }

    #[test]
    fn test_command_bytes() {
        assert_eq!([128, 3], NmtCommand::EnterPreOperational.to_bytes(3));
        assert_eq!([130, 0], NmtCommand::ResetComm.to_bytes(0));
    }
}
