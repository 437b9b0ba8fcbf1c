//! `candiag`: UDS (ISO 14229) tester and ECU engines over ISO-TP.
//!
//! Two peers share the wire protocol:
//! - [`client::UdsClient`] is the tester side: request encoding, the
//!   prepare/send/wait transaction funnel, negative-response handling
//!   (including `0x78` response-pending), a response registry keyed by
//!   response SID, and the heartbeat liveness monitor.
//! - [`server::UdsServer`] is the ECU side: session, security and
//!   comm-control state, the S3 session timer, and a priority-ordered event
//!   dispatcher that services plug into ([`services`]).
//!
//! Both engines are polling state machines behind the [`transport::Transport`]
//! binding; they never block and never spawn threads.

pub mod client;
pub mod error;
pub mod nrc;
pub mod server;
pub mod services;
pub mod transport;

pub use client::UdsClient;
pub use error::{UdsError, UdsResult};
pub use nrc::Nrc;
pub use server::{ServerState, UdsServer};

/// UDS service identifiers and PDU framing constants.
pub mod sid {
    /// DiagnosticSessionControl.
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    /// ECUReset.
    pub const ECU_RESET: u8 = 0x11;
    /// ReadDataByIdentifier.
    pub const READ_DATA_BY_IDENTIFIER: u8 = 0x22;
    /// SecurityAccess.
    pub const SECURITY_ACCESS: u8 = 0x27;
    /// CommunicationControl.
    pub const COMMUNICATION_CONTROL: u8 = 0x28;
    /// WriteDataByIdentifier.
    pub const WRITE_DATA_BY_IDENTIFIER: u8 = 0x2E;
    /// InputOutputControlByIdentifier.
    pub const IO_CONTROL_BY_IDENTIFIER: u8 = 0x2F;
    /// RoutineControl.
    pub const ROUTINE_CONTROL: u8 = 0x31;
    /// TransferData.
    pub const TRANSFER_DATA: u8 = 0x36;
    /// RequestTransferExit.
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    /// RequestFileTransfer.
    pub const REQUEST_FILE_TRANSFER: u8 = 0x38;
    /// TesterPresent.
    pub const TESTER_PRESENT: u8 = 0x3E;

    /// First byte of every negative response.
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
    /// Positive response SID = request SID + this offset.
    pub const POSITIVE_OFFSET: u8 = 0x40;
    /// Sub-function bit requesting positive-response suppression.
    pub const SUPPRESS_POS_RESP: u8 = 0x80;

    /// Positive response SID for a request SID.
    pub const fn positive(request_sid: u8) -> u8 {
        request_sid + POSITIVE_OFFSET
    }
}

/// Diagnostic session kinds (service 0x10 sub-functions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    Default,
    Programming,
    Extended,
    Other(u8),
}

impl From<u8> for SessionType {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::Default,
            0x02 => Self::Programming,
            0x03 => Self::Extended,
            other => Self::Other(other),
        }
    }
}

impl From<SessionType> for u8 {
    fn from(session: SessionType) -> Self {
        match session {
            SessionType::Default => 0x01,
            SessionType::Programming => 0x02,
            SessionType::Extended => 0x03,
            SessionType::Other(v) => v,
        }
    }
}

impl SessionType {
    /// Programming and extended sessions admit long transfers.
    pub fn is_privileged(self) -> bool {
        matches!(self, SessionType::Programming | SessionType::Extended)
    }
}

/// Modes of operation for RequestFileTransfer (0x38).
pub mod file_mode {
    /// Upload a new file to the server.
    pub const ADD_FILE: u8 = 0x01;
    /// Replace an existing file on the server.
    pub const REPLACE_FILE: u8 = 0x03;
    /// Download a file from the server.
    pub const READ_FILE: u8 = 0x04;
}

/// InputOutputControlByIdentifier actions (0x2F control parameters).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoAction {
    /// Return control of the signal to the application.
    ReturnControl,
    /// Set the signal to its default value.
    ResetToDefault,
    /// Freeze the signal at its current value.
    FreezeCurrent,
    /// Set the signal to the supplied value.
    ShortTermAdjustment,
}

impl IoAction {
    /// Decode a control parameter byte.
    pub fn from_param(param: u8) -> Option<Self> {
        match param {
            0x00 => Some(Self::ReturnControl),
            0x01 => Some(Self::ResetToDefault),
            0x02 => Some(Self::FreezeCurrent),
            0x03 => Some(Self::ShortTermAdjustment),
            _ => None,
        }
    }

    /// True for the actions that seize control of the hardware signal.
    pub fn takes_override(self) -> bool {
        matches!(self, Self::FreezeCurrent | Self::ShortTermAdjustment)
    }
}
