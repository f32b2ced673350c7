//! Transport boundary of the dispatch engine
//!
//! The engine does not frame or segment messages. It hands complete UDS payloads to a
//! [TransportSender] and expects the transport to report back once each frame has been
//! processed, through [crate::DiagDispatcher::transport_message_processed] or a
//! [crate::ContextHandle].

use std::sync::{Arc, Mutex};

use crate::{connection::ConnectionHandle, context::ContextHandle};

/// Transport result
pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// Error produced by a transport when refusing a frame
pub enum TransportError {
    /// The transmit queue of the transport is full
    QueueFull,
    /// The frame could not be sent
    SendFail,
    /// The transport is not connected to a bus
    NotConnected,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::QueueFull => write!(f, "transport transmit queue is full"),
            TransportError::SendFail => write!(f, "transport failed to send the frame"),
            TransportError::NotConnected => write!(f, "transport is not connected"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Which frame of a connection a completion refers to
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// The final (positive or negative) response
    Response,
    /// A `[0x7F, SID, 0x78]` response pending frame
    ResponsePending,
}

/// Outcome of sending a frame, reported by the transport
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ProcessingResult {
    /// The frame was sent
    NoError,
    /// Sending the frame failed
    Error,
}

/// A frame handed to the transport
#[derive(Debug, Clone, Copy)]
pub struct OutgoingFrame<'a> {
    /// Connection the frame belongs to. Must be echoed back on completion. Frames without a
    /// connection (busy responses) expect no completion
    pub connection: Option<ConnectionHandle>,
    /// Kind of the frame. Must be echoed back on completion
    pub kind: FrameKind,
    /// Source address (the ECU)
    pub source: u16,
    /// Target address (the tester)
    pub target: u16,
    /// UDS payload
    pub payload: &'a [u8],
}

/// Sender half of the transport layer
pub trait TransportSender: Send {
    /// Queues a frame for sending. On `Ok` the transport must later report completion
    /// of exactly this frame, on `Err` no completion is expected
    fn send(&mut self, frame: &OutgoingFrame<'_>) -> TransportResult<()>;

    /// Called once a connection is terminated and the request message it was opened
    /// for can be released
    fn request_processed(&mut self, _connection: ConnectionHandle) {}
}

/// A frame recorded by [SimulationTransport]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    /// Connection the frame belongs to
    pub connection: Option<ConnectionHandle>,
    /// Kind of the frame
    pub kind: FrameKind,
    /// Source address
    pub source: u16,
    /// Target address
    pub target: u16,
    /// Payload bytes
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct SimulationState {
    sent: Vec<SentFrame>,
    unacknowledged: Vec<(ConnectionHandle, FrameKind)>,
    released: Vec<ConnectionHandle>,
    fail_next: usize,
}

/// Simulated transport for testing diagnostic servers.
///
/// Records every frame. Frames are acknowledged immediately through the execution context when
/// auto-acknowledge is on, otherwise they stay pending until [SimulationTransport::acknowledge_all]
#[derive(Debug, Clone)]
pub struct SimulationTransport {
    state: Arc<Mutex<SimulationState>>,
    context: Option<ContextHandle>,
}

impl SimulationTransport {
    /// Creates a transport which keeps every frame pending
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimulationState::default())),
            context: None,
        }
    }

    /// Creates a transport which acknowledges every frame through `context` as soon as it is sent
    pub fn auto_acknowledge(context: ContextHandle) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimulationState::default())),
            context: Some(context),
        }
    }

    /// Makes the next `count` calls to `send` fail
    pub fn fail_next_sends(&self, count: usize) {
        self.lock().fail_next = count;
    }

    /// All frames sent so far
    pub fn sent_frames(&self) -> Vec<SentFrame> {
        self.lock().sent.clone()
    }

    /// Payloads of all frames sent so far
    pub fn sent_payloads(&self) -> Vec<Vec<u8>> {
        self.lock().sent.iter().map(|f| f.payload.clone()).collect()
    }

    /// Forgets all recorded frames
    pub fn clear(&self) {
        self.lock().sent.clear();
    }

    /// Connections whose request message was released
    pub fn released_requests(&self) -> Vec<ConnectionHandle> {
        self.lock().released.clone()
    }

    /// Acknowledges every pending frame through `context` with `result`
    pub fn acknowledge_all(&self, context: &ContextHandle, result: ProcessingResult) {
        let pending = std::mem::take(&mut self.lock().unacknowledged);
        for (connection, kind) in pending {
            context.transport_message_processed(connection, kind, result);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimulationState> {
        // A test panicking while holding the lock must not hide the recorded frames
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for SimulationTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportSender for SimulationTransport {
    fn send(&mut self, frame: &OutgoingFrame<'_>) -> TransportResult<()> {
        let mut state = self.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(TransportError::SendFail);
        }
        log::debug!(
            "SimulationTransport: 0x{:04X} --> 0x{:04X} {:02X?}",
            frame.source,
            frame.target,
            frame.payload
        );
        state.sent.push(SentFrame {
            connection: frame.connection,
            kind: frame.kind,
            source: frame.source,
            target: frame.target,
            payload: frame.payload.to_vec(),
        });
        if let Some(connection) = frame.connection {
            match &self.context {
                Some(ctx) => ctx.transport_message_processed(connection, frame.kind, ProcessingResult::NoError),
                None => state.unacknowledged.push((connection, frame.kind)),
            }
        }
        Ok(())
    }

    fn request_processed(&mut self, connection: ConnectionHandle) {
        self.lock().released.push(connection);
    }
}
