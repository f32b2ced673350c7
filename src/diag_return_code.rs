//! Diagnostic return codes used throughout the dispatch engine
//!
//! Every job outcome is one of these codes. Two of them are internal sentinels
//! which are never put on the wire:
//! * [DiagReturnCode::NotResponsible] - The job does not handle the request, routing continues with the next sibling
//! * [DiagReturnCode::Ok] - The job accepted the request
//!
//! All other values are ISO14229 negative response codes (NRCs)

use automotive_diag::uds::UdsErrorByte;
use strum_macros::{Display, EnumIter, FromRepr};

/// Service ID of a negative response frame
pub const NEGATIVE_RESPONSE_IDENTIFIER: u8 = 0x7F;
/// Offset added to the request SID to form the positive response SID
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;
/// Length of a negative response frame (`[0x7F, SID, NRC]`)
pub const NEGATIVE_RESPONSE_MESSAGE_LENGTH: usize = 3;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter, FromRepr)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
/// Outcome of verifying or processing a diagnostic job
pub enum DiagReturnCode {
    /// ECU rejected the request (No specific error)
    GeneralReject = 0x10,
    /// Service is not supported by the ECU
    ServiceNotSupported = 0x11,
    /// Sub function is not supported by the ECU
    SubfunctionNotSupported = 0x12,
    /// Request message was an invalid length, or the format of the
    /// request was incorrect
    InvalidFormat = 0x13,
    /// The response message is too long for the transport protocol
    ResponseTooLong = 0x14,
    /// The ECU is too busy to perform this request. Therefore, the request
    /// should be sent again
    BusyRepeatRequest = 0x21,
    /// The requested action could not be preformed due to the prerequisite
    /// conditions not being correct
    ConditionsNotCorrect = 0x22,
    /// The ECU cannot perform the request as the request has been sent in the
    /// incorrect order
    RequestSequenceError = 0x24,
    /// A sub-bus component did not respond in time
    NoResponseFromSubnetComponent = 0x25,
    /// A failure condition prevents the execution of the request
    FailurePreventsExecution = 0x26,
    /// The request message contains data outside of a valid range
    RequestOutOfRange = 0x31,
    /// The request was denied due to security access not being granted
    SecurityAccessDenied = 0x33,
    /// The request requires an authenticated tester
    AuthenticationRequired = 0x34,
    /// The key sent from the tester is invalid
    InvalidKey = 0x35,
    /// The client has tried to obtain security access too many times
    ExceededNumberOfAttempts = 0x36,
    /// The required time delay has not yet expired
    RequiredTimeDelayNotExpired = 0x37,
    /// The upload or download could not be started
    UploadDownloadNotAccepted = 0x70,
    /// The data transfer was halted due to a fault
    TransferDataSuspended = 0x71,
    /// Erasing or programming a memory location failed
    GeneralProgrammingFailure = 0x72,
    /// The block sequence counter of a transfer was incorrect
    WrongBlockSequenceCounter = 0x73,
    /// The request was received correctly, the response is still being computed
    ResponsePending = 0x78,
    /// The sub function is not supported in the active diagnostic session
    SubfunctionNotSupportedInActiveSession = 0x7E,
    /// The service is not supported in the active diagnostic session
    ServiceNotSupportedInActiveSession = 0x7F,
    /// The job is not responsible for the request, routing continues
    NotResponsible = 0xFE,
    /// The job accepted the request
    Ok = 0xFF,
}

impl DiagReturnCode {
    /// Raw byte value of the code
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Converts a raw byte back into a return code, if it is known
    pub fn from_byte(b: u8) -> Option<Self> {
        Self::from_repr(b)
    }

    /// Returns true if the code is an ISO negative response code
    pub const fn is_negative(self) -> bool {
        !matches!(self, Self::Ok | Self::NotResponsible)
    }

    /// Negative responses which are never sent back for a functionally addressed request
    pub const fn is_suppressed_for_functional_request(self) -> bool {
        matches!(
            self,
            Self::ServiceNotSupported
                | Self::SubfunctionNotSupported
                | Self::RequestOutOfRange
                | Self::SubfunctionNotSupportedInActiveSession
                | Self::ServiceNotSupportedInActiveSession
        )
    }

    /// ISO14229 description of the code, for logging
    pub fn describe(self) -> UdsErrorByte {
        UdsErrorByte::from(self.as_byte())
    }
}

impl From<DiagReturnCode> for u8 {
    fn from(code: DiagReturnCode) -> Self {
        code.as_byte()
    }
}
