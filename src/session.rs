//! Diagnostic session handling
//!
//! The dispatch engine does not implement session transitions itself. Instead it
//! consumes a [DiagSessionManager], which is asked for the active session and
//! informed about accepted jobs and sent responses.

use automotive_diag::uds::UdsSessionTypeByte;
use bitflags::bitflags;

use crate::{DiagReturnCode, connection::IncomingDiagConnection, job::DiagJobNode};

bitflags! {
    /// Set of diagnostic sessions a job may be executed in
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct SessionMask: u8 {
        /// Default session (0x01)
        const DEFAULT = 0b0000_0001;
        /// Programming session (0x02)
        const PROGRAMMING = 0b0000_0010;
        /// Extended diagnostic session (0x03)
        const EXTENDED = 0b0000_0100;
        /// Safety system diagnostic session (0x04)
        const SAFETY_SYSTEM = 0b0000_1000;
        /// Any session
        const ALL = Self::DEFAULT.bits() | Self::PROGRAMMING.bits() | Self::EXTENDED.bits() | Self::SAFETY_SYSTEM.bits();
    }
}

impl SessionMask {
    /// Mask containing only the given session. Unknown (OEM specific) sessions
    /// map to the empty mask, they are only matched by jobs allowing [SessionMask::ALL]
    pub fn from_session(session: UdsSessionTypeByte) -> Self {
        match u8::from(session) {
            0x01 => Self::DEFAULT,
            0x02 => Self::PROGRAMMING,
            0x03 => Self::EXTENDED,
            0x04 => Self::SAFETY_SYSTEM,
            _ => Self::empty(),
        }
    }

    /// Returns true if a job with this mask may run in `session`
    pub fn matches(&self, session: UdsSessionTypeByte) -> bool {
        *self == Self::ALL || self.intersects(Self::from_session(session))
    }
}

impl Default for SessionMask {
    fn default() -> Self {
        Self::ALL
    }
}

/// Session manager consumed by the dispatch engine
pub trait DiagSessionManager: Send {
    /// Currently active diagnostic session
    fn active_session(&self) -> UdsSessionTypeByte;

    /// Called whenever a job accepted a request (both for OK and for negative verification results).
    ///
    /// ## Parameters
    /// * connection - Connection the request arrived on
    /// * job - Node of the job that accepted the request
    /// * request - Remaining request bytes after the job's identifiers
    fn accepted_job(
        &mut self,
        connection: &IncomingDiagConnection,
        job: &DiagJobNode,
        request: &[u8],
    ) -> DiagReturnCode;

    /// Called once a final (non pending) response is about to be sent
    ///
    /// ## Parameters
    /// * connection - Connection the response belongs to
    /// * code - [DiagReturnCode::Ok] for positive responses, otherwise the NRC
    /// * response - Positive response payload (without echoed identifiers). Empty for negative responses
    fn response_sent(&mut self, connection: &IncomingDiagConnection, code: DiagReturnCode, response: &[u8]);
}

/// Simple session manager which stays in a fixed session.
///
/// Keeps counters of the accepted jobs and sent responses
#[derive(Debug, Clone)]
pub struct DefaultSessionManager {
    session: UdsSessionTypeByte,
    /// Number of jobs accepted since creation
    pub accepted_jobs: u32,
    /// Codes of all responses reported as sent, in order
    pub sent_responses: Vec<DiagReturnCode>,
}

impl DefaultSessionManager {
    /// Creates a session manager that stays in `session`
    pub fn new(session: UdsSessionTypeByte) -> Self {
        Self {
            session,
            accepted_jobs: 0,
            sent_responses: Vec::new(),
        }
    }

    /// Switches the active session
    pub fn set_session(&mut self, session: UdsSessionTypeByte) {
        log::debug!("Switching diagnostic session to {session:02X?}");
        self.session = session;
    }
}

impl Default for DefaultSessionManager {
    fn default() -> Self {
        Self::new(UdsSessionTypeByte::from(0x01))
    }
}

impl DiagSessionManager for DefaultSessionManager {
    fn active_session(&self) -> UdsSessionTypeByte {
        self.session
    }

    fn accepted_job(&mut self, _connection: &IncomingDiagConnection, _job: &DiagJobNode, _request: &[u8]) -> DiagReturnCode {
        self.accepted_jobs += 1;
        DiagReturnCode::Ok
    }

    fn response_sent(&mut self, _connection: &IncomingDiagConnection, code: DiagReturnCode, _response: &[u8]) {
        self.sent_responses.push(code);
    }
}
