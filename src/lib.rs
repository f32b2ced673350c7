#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    //unstable_features,
    //unused_imports,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! A crate which provides the request dispatch and response delivery engine of a UDS (ISO14229)
//! diagnostic server, as it runs inside an ECU.
//!
//! ## Request routing
//!
//! Diagnostic services are implemented as jobs ([DiagJob]), organised in a tree ([JobTree]).
//! Every job implements a request prefix, for example `[0x22]` for ReadDataByIdentifier and
//! `[0x22, 0xF1, 0x90]` for the VIN DID below it. An incoming request is offered to the root,
//! which forwards it to the first child that is responsible. Each job on the way
//! * verifies the request
//! * checks the active diagnostic session
//! * records the identifier bytes it consumed, which are echoed in the positive response
//!
//! ## Responses
//!
//! Jobs write their positive response into a bounded window ([PositiveResponse]) and ask their
//! [IncomingDiagConnection] to send it. Sending is always deferred to the dispatcher's
//! [ExecutionContext]. The connection assembles the frame (`[SID + 0x40, identifiers, payload]`
//! or `[0x7F, SID, NRC]`), hands it to the transport and tells the job once the transport is done.
//!
//! While a job takes its time, the connection keeps the tester alive with response pending
//! (`[0x7F, SID, 0x78]`) frames, and a global timeout aborts requests that never complete.
//!
//! ## Nested requests
//!
//! A [NestedDiagRequest] splits one request into a series of sub-requests which are answered
//! by individual jobs, and merges their responses into one. ReadDataByIdentifier with multiple
//! DIDs ([services::MultipleReadDataByIdentifier]) is built on it.
//!
//! ## Async jobs
//!
//! Jobs which can only handle one request at a time park concurrent requests in a shared pool
//! ([AsyncDiagHelper]) and process them in arrival order ([AsyncDiagJob], [AsyncDiagJobHelper]).
//! Other pools plug in through [AsyncRequestPool] and [DiagDispatcher::with_request_pool].
//!
//! ## Transport
//!
//! The engine does not frame or segment messages. It exchanges complete UDS payloads with a
//! [transport::TransportSender]. [transport::SimulationTransport] records all frames for testing.

pub mod async_helper;
pub mod connection;
pub mod context;
pub mod diag_return_code;
pub mod dispatcher;
pub mod job;
pub mod nested;
pub mod response;
pub mod services;
pub mod session;
pub mod transport;

pub use async_helper::{AsyncDiagHelper, AsyncDiagJobHelper, AsyncRequestPool, StoredRequest, StoredRequestId};
pub use connection::{ConnectionHandle, IncomingDiagConnection};
pub use context::{ContextHandle, ExecutionContext};
pub use diag_return_code::DiagReturnCode;
pub use dispatcher::{DiagDispatcher, DiagnosisConfiguration, TimeoutConfig};
pub use job::{
    AddJobResult, AsyncDiagJob, DiagJob, DiagJobNode, DiagJobRoot, JobContext, JobId, JobTree, ResponseSendResult,
};
pub use nested::{NestedDiagRequest, NestedRequestHooks, StoredNestedRequest};
pub use response::PositiveResponse;
pub use session::{DefaultSessionManager, DiagSessionManager, SessionMask};
pub use transport::TransportError;

/// Diagnostic server result
pub type DiagServerResult<T> = Result<T, DiagError>;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
/// Diagnostic server error
pub enum DiagError {
    /// The connection was already terminated
    #[error("Diagnostic connection is not open")]
    ConnectionNotOpen,
    /// The transport refused a frame
    #[error("Diagnostic server failed to send the response")]
    SendFailed,
    /// The connection has no request to answer
    #[error("Diagnostic connection has no transport message")]
    NoTransportMessage,
    /// A response of the connection is still being sent
    #[error("Diagnostic connection is busy sending a response")]
    ConnectionBusy,
    /// The dispatcher does not accept requests
    #[error("Diagnostic dispatcher is not enabled")]
    NotEnabled,
    /// The request was not addressed to this ECU
    #[error("Request for invalid target address 0x{0:04X}")]
    InvalidTarget(u16),
    /// The request was not sent by a tester
    #[error("Request from invalid source address 0x{0:04X}")]
    InvalidSource(u16),
    /// The request has no service ID
    #[error("Request is empty")]
    EmptyRequest,
    /// The request does not fit into the connection buffers
    #[error("Request of {len} bytes exceeds the maximum of {max} bytes")]
    RequestTooLong {
        /// Length of the request
        len: usize,
        /// Maximum request length
        max: usize,
    },
    /// All connections are in use, the request was answered with BusyRepeatRequest
    #[error("No incoming diagnostic connection available")]
    NoConnectionAvailable,
    /// The job could not be linked into the job tree
    #[error("Diag job 0x{0:X} could not be added to the job tree")]
    JobNotAdded(u32),
    /// Error of the underlying transport
    #[error("Diagnostic server transport error")]
    TransportError(
        #[from]
        #[source]
        TransportError,
    ),
}
