//! Incoming diagnostic connections
//!
//! An [IncomingDiagConnection] carries one request from its arrival until the final response
//! has been handed to the transport. It owns the request bytes, the identifiers collected while
//! routing, the response buffer and the timers which drive response pending (`0x78`) frames.
//!
//! Sending is always two-phased: jobs ask the connection to send, which posts an event on the
//! execution context. The event assembles the frame and hands it to the transport. Every frame
//! in flight is counted, and the connection only closes once all of them completed.

use crate::{
    DiagError, DiagReturnCode, DiagServerResult, PositiveResponse,
    context::{DiagEvent, ExecutionContext, TimerId},
    diag_return_code::{NEGATIVE_RESPONSE_IDENTIFIER, NEGATIVE_RESPONSE_MESSAGE_LENGTH, POSITIVE_RESPONSE_OFFSET},
    dispatcher::TimeoutConfig,
    job::{JobId, ResponseSendResult},
    nested::{NestedDiagRequest, NestedRequestHooks},
    session::DiagSessionManager,
    transport::{FrameKind, OutgoingFrame, ProcessingResult, TransportSender},
};

/// Maximum number of identifier bytes a connection collects for one request
pub const MAXIMUM_NUMBER_OF_IDENTIFIERS: usize = 6;

/// Handle of an incoming connection. Handles of recycled connections become stale, events
/// posted for them are ignored
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    index: usize,
    generation: u32,
}

impl ConnectionHandle {
    pub(crate) const fn new(index: usize, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Index of the connection in the dispatcher's pool
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of times the pooled connection was acquired
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Timers of a connection
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionTimer {
    /// Sends a response pending frame when it expires
    ResponsePending,
    /// Aborts the request when it expires
    Global,
}

/// Frames in flight, and whether the connection has to close once they completed
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
enum SendState {
    #[default]
    Idle,
    Sending(u8),
    TerminationPending(u8),
}

impl SendState {
    fn outstanding(self) -> u8 {
        match self {
            SendState::Idle => 0,
            SendState::Sending(n) | SendState::TerminationPending(n) => n,
        }
    }

    fn begin(&mut self) {
        *self = match *self {
            SendState::Idle => SendState::Sending(1),
            SendState::Sending(n) => SendState::Sending(n + 1),
            SendState::TerminationPending(n) => SendState::TerminationPending(n + 1),
        }
    }

    fn finish(&mut self) {
        *self = match *self {
            SendState::Idle => {
                log::error!("Completion of a frame which was never sent");
                SendState::Idle
            }
            SendState::Sending(1) => SendState::Idle,
            SendState::Sending(n) => SendState::Sending(n - 1),
            SendState::TerminationPending(n) => SendState::TerminationPending(n.saturating_sub(1)),
        }
    }

    fn termination_due(self) -> bool {
        self == SendState::TerminationPending(0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ResponseFrame {
    None,
    Positive(usize),
    Negative,
}

/// Job to notify about a sent response
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[must_use]
pub(crate) struct Notification {
    pub sender: JobId,
    pub result: ResponseSendResult,
}

impl Notification {
    fn new(sender: JobId, result: ResponseSendResult) -> Self {
        Self { sender, result }
    }
}

/// Outcome of a transport completion
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[must_use]
pub(crate) struct Completion {
    pub notify: Option<Notification>,
    pub settle: bool,
}

impl From<ProcessingResult> for ResponseSendResult {
    fn from(result: ProcessingResult) -> Self {
        match result {
            ProcessingResult::NoError => ResponseSendResult::Sent,
            ProcessingResult::Error => ResponseSendResult::SendFailed,
        }
    }
}

/// One incoming diagnostic request and its response
#[derive(Debug)]
pub struct IncomingDiagConnection {
    handle: ConnectionHandle,
    open: bool,
    source_id: u16,
    target_id: u16,
    diag_address: u16,
    functional: bool,
    service_id: u8,
    has_request: bool,
    request: Vec<u8>,
    identifiers: Vec<u8>,
    response: PositiveResponse,
    response_active: bool,
    frame: ResponseFrame,
    negative_frame: [u8; NEGATIVE_RESPONSE_MESSAGE_LENGTH],
    sender: Option<JobId>,
    response_posted: bool,
    nested: NestedDiagRequest,
    send_state: SendState,
    suppress_positive_response: bool,
    pending_activated: bool,
    response_pending_sent: bool,
    response_pending_being_sent: bool,
    response_pending_is_pending: bool,
    pending_timeout_ms: u32,
    timeouts: TimeoutConfig,
    pending_timer: Option<TimerId>,
    global_timer: Option<TimerId>,
}

impl IncomingDiagConnection {
    pub(crate) fn new(index: usize, max_payload_size: usize, diag_address: u16, timeouts: TimeoutConfig) -> Self {
        Self {
            handle: ConnectionHandle::new(index, 0),
            open: false,
            source_id: 0,
            target_id: 0,
            diag_address,
            functional: false,
            service_id: 0,
            has_request: false,
            request: Vec::with_capacity(max_payload_size),
            identifiers: Vec::with_capacity(MAXIMUM_NUMBER_OF_IDENTIFIERS),
            response: PositiveResponse::new(max_payload_size),
            response_active: false,
            frame: ResponseFrame::None,
            negative_frame: [NEGATIVE_RESPONSE_IDENTIFIER, 0, 0],
            sender: None,
            response_posted: false,
            nested: NestedDiagRequest::new(max_payload_size),
            send_state: SendState::Idle,
            suppress_positive_response: false,
            pending_activated: false,
            response_pending_sent: false,
            response_pending_being_sent: false,
            response_pending_is_pending: false,
            pending_timeout_ms: timeouts.pending_timeout_ms,
            timeouts,
            pending_timer: None,
            global_timer: None,
        }
    }

    /// Handle of the connection
    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    /// True between opening and termination
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Address of the tester which sent the request
    pub fn source_id(&self) -> u16 {
        self.source_id
    }

    /// Address the request was sent to
    pub fn target_id(&self) -> u16 {
        self.target_id
    }

    /// True if the request was functionally (broadcast) addressed
    pub fn is_functional(&self) -> bool {
        self.functional
    }

    /// Service ID of the request
    pub fn service_id(&self) -> u8 {
        self.service_id
    }

    /// Request bytes. Empty while a job operates on them
    pub fn request(&self) -> &[u8] {
        &self.request
    }

    /// True once a job asked to suppress the positive response
    pub fn is_positive_response_suppressed(&self) -> bool {
        self.suppress_positive_response
    }

    /// Current response pending period
    pub fn pending_timeout_ms(&self) -> u32 {
        self.pending_timeout_ms
    }

    /// Nested request state, if one is running
    pub fn nested_request(&self) -> Option<&NestedDiagRequest> {
        self.nested.is_active().then_some(&self.nested)
    }

    /// Response buffer
    pub fn response(&self) -> &PositiveResponse {
        &self.response
    }

    pub(crate) fn open(
        &mut self,
        handle: ConnectionHandle,
        source_id: u16,
        target_id: u16,
        functional: bool,
        request: &[u8],
        activate_pending: bool,
        executor: &mut ExecutionContext,
    ) {
        if self.open {
            log::error!("Opening connection {:?} which is already open", self.handle);
            return;
        }
        self.handle = handle;
        self.open = true;
        self.source_id = source_id;
        self.target_id = target_id;
        self.functional = functional;
        self.service_id = request.first().copied().unwrap_or_default();
        self.has_request = !request.is_empty();
        self.request.clear();
        self.request.extend_from_slice(request);
        self.identifiers.clear();
        self.response_active = false;
        self.frame = ResponseFrame::None;
        self.sender = None;
        self.response_posted = false;
        self.nested.finish();
        self.send_state = SendState::Idle;
        self.suppress_positive_response = false;
        self.pending_activated = activate_pending;
        self.response_pending_sent = false;
        self.response_pending_being_sent = false;
        self.response_pending_is_pending = false;
        self.cancel_timers(executor);
        self.change_resp_pending_timer(0);
        if activate_pending {
            self.pending_timer = Some(executor.schedule(
                self.timeouts.initial_pending_timeout_ms,
                DiagEvent::TimerExpired {
                    connection: handle,
                    timer: ConnectionTimer::ResponsePending,
                },
            ));
            self.global_timer = Some(executor.schedule(
                self.timeouts.global_pending_timeout_ms,
                DiagEvent::TimerExpired {
                    connection: handle,
                    timer: ConnectionTimer::Global,
                },
            ));
        }
    }

    /// Records an identifier byte of the request. Identifiers past
    /// [MAXIMUM_NUMBER_OF_IDENTIFIERS] are dropped.
    ///
    /// ## Panics
    /// If the response was already requested
    pub fn add_identifier(&mut self, identifier: u8) {
        assert!(!self.response_active, "identifiers added after the response was requested");
        if self.nested.is_active() {
            self.nested.add_identifier(identifier);
        } else if self.identifiers.len() < MAXIMUM_NUMBER_OF_IDENTIFIERS {
            self.identifiers.push(identifier);
        }
    }

    /// Identifier byte at `idx`
    pub fn identifier(&self, idx: usize) -> u8 {
        if self.nested.is_active() {
            return self.nested.identifier(idx);
        }
        match self.identifiers.get(idx) {
            Some(id) => *id,
            None => {
                log::error!("Identifier {idx} requested, only {} collected", self.identifiers.len());
                0
            }
        }
    }

    /// Number of identifiers collected for the current request
    pub fn num_identifiers(&self) -> usize {
        if self.nested.is_active() {
            self.nested.num_identifiers()
        } else {
            self.identifiers.len()
        }
    }

    /// Payload bytes a response may hold
    pub fn maximum_response_length(&self) -> usize {
        if self.nested.is_active() {
            self.nested.max_nested_response_length()
        } else {
            self.response.capacity().saturating_sub(self.header_length())
        }
    }

    /// Bytes in front of the positive payload. Positive responses always start with the
    /// response SID, even if no job collected identifiers
    fn header_length(&self) -> usize {
        self.identifiers.len().max(1)
    }

    /// Marks the request as consumed and binds the response window
    pub fn release_request_get_response(&mut self) -> &mut PositiveResponse {
        self.response_active = true;
        if self.nested.is_active() {
            let window = self.nested.response_buffer(self.response.storage_mut());
            self.response.init(window.start, window.len());
        } else {
            let header = self.header_length().min(self.response.capacity());
            let max = self.response.capacity() - header;
            self.response.init(header, max);
        }
        &mut self.response
    }

    pub(crate) fn suppress_positive_response(&mut self) {
        self.suppress_positive_response = true;
    }

    /// Adjusts the response pending period to the configured default plus `diff_ms`
    pub fn change_resp_pending_timer(&mut self, diff_ms: i32) {
        self.pending_timeout_ms = self.timeouts.pending_timeout_ms.saturating_add_signed(diff_ms);
    }

    pub(crate) fn disable_response_timeout(&mut self, executor: &mut ExecutionContext) {
        self.pending_activated = false;
        if let Some(timer) = self.pending_timer.take() {
            executor.cancel(timer);
        }
    }

    pub(crate) fn disable_global_timeout(&mut self, executor: &mut ExecutionContext) {
        if let Some(timer) = self.global_timer.take() {
            executor.cancel(timer);
        }
    }

    fn restart_pending_timeout(&mut self, executor: &mut ExecutionContext) {
        if let Some(timer) = self.pending_timer.take() {
            executor.cancel(timer);
        }
        if self.pending_activated {
            self.pending_timer = Some(executor.schedule(
                self.pending_timeout_ms,
                DiagEvent::TimerExpired {
                    connection: self.handle,
                    timer: ConnectionTimer::ResponsePending,
                },
            ));
        }
    }

    fn cancel_timers(&mut self, executor: &mut ExecutionContext) {
        for timer in [self.pending_timer.take(), self.global_timer.take()].into_iter().flatten() {
            executor.cancel(timer);
        }
    }

    pub(crate) fn send_positive_response(&mut self, sender: JobId, executor: &mut ExecutionContext) -> DiagServerResult<()> {
        if !self.response_active {
            self.release_request_get_response();
        }
        let length = self.response.length();
        self.send_positive_response_internal(length, sender, executor)
    }

    fn send_positive_response_internal(
        &mut self,
        length: usize,
        sender: JobId,
        executor: &mut ExecutionContext,
    ) -> DiagServerResult<()> {
        if !self.open {
            log::warn!(
                "Positive response of 0x{:04X} --> 0x{:04X}, service 0x{:02X} on closed connection",
                self.target_id,
                self.source_id,
                self.service_id
            );
            return Err(DiagError::ConnectionNotOpen);
        }
        if self.is_busy() {
            log::error!("Connection {:?} is busy sending a response", self.handle);
            return Err(DiagError::ConnectionBusy);
        }
        if !self.has_request {
            return Err(DiagError::NoTransportMessage);
        }
        self.response_posted = true;
        self.send_state.begin();
        executor.post(DiagEvent::SendPositiveResponse {
            connection: self.handle,
            length,
            sender,
        });
        Ok(())
    }

    pub(crate) fn send_negative_response(
        &mut self,
        code: DiagReturnCode,
        sender: JobId,
        executor: &mut ExecutionContext,
    ) -> DiagServerResult<()> {
        if !self.open {
            log::warn!(
                "Negative response 0x{:02X} of 0x{:04X} --> 0x{:04X}, service 0x{:02X} on closed connection",
                code.as_byte(),
                self.target_id,
                self.source_id,
                self.service_id
            );
            return Err(DiagError::ConnectionNotOpen);
        }
        if self.is_busy() {
            log::error!(
                "Connection {:?} is busy sending a response, negative response 0x{:02X} dropped",
                self.handle,
                code.as_byte()
            );
            return Err(DiagError::ConnectionBusy);
        }
        if !self.response_active {
            self.release_request_get_response();
        }
        if !self.has_request {
            return Err(DiagError::NoTransportMessage);
        }
        // Response pending frames may precede the final response
        if code != DiagReturnCode::ResponsePending {
            self.response_posted = true;
        }
        self.send_state.begin();
        executor.post(DiagEvent::SendNegativeResponse {
            connection: self.handle,
            code,
            sender,
        });
        Ok(())
    }

    /// True once the final response of the current request (or sub-request) was posted
    fn is_busy(&self) -> bool {
        self.response_posted || self.sender.is_some()
    }

    fn response_source(&self) -> u16 {
        if self.functional { self.diag_address } else { self.target_id }
    }

    /// Assembles the positive response frame and sends it
    pub(crate) fn async_send_positive_response(
        &mut self,
        length: usize,
        sender: JobId,
        transport: &mut dyn TransportSender,
        sessions: &mut dyn DiagSessionManager,
    ) -> Option<Notification> {
        let header = self.header_length().min(self.response.capacity());
        let total = (header + length).min(self.response.capacity());
        {
            let storage = self.response.storage_mut();
            let ids = self.identifiers.len().min(header);
            storage[..ids].copy_from_slice(&self.identifiers[..ids]);
            storage[0] = self.service_id.wrapping_add(POSITIVE_RESPONSE_OFFSET);
        }
        self.frame = ResponseFrame::Positive(total);
        self.sender = Some(sender);
        sessions.response_sent(self, DiagReturnCode::Ok, &self.response.storage()[header..total]);

        if !self.suppress_positive_response || self.response_pending_sent {
            if self.response_pending_being_sent {
                // Goes out once the response pending frame completed
                None
            } else {
                self.send_response(transport)
            }
        } else {
            log::debug!("Positive response of service 0x{:02X} suppressed", self.service_id);
            self.send_state.finish();
            self.sender.take().map(|s| Notification::new(s, ResponseSendResult::Sent))
        }
    }

    /// Assembles the negative response frame and sends it
    pub(crate) fn async_send_negative_response(
        &mut self,
        code: DiagReturnCode,
        sender: JobId,
        executor: &mut ExecutionContext,
        transport: &mut dyn TransportSender,
        sessions: &mut dyn DiagSessionManager,
    ) -> Option<Notification> {
        self.negative_frame = [NEGATIVE_RESPONSE_IDENTIFIER, self.service_id, code.as_byte()];
        self.frame = ResponseFrame::Negative;
        self.sender = Some(sender);
        if code != DiagReturnCode::ResponsePending {
            log::debug!("Service 0x{:02X} rejected with {:?}", self.service_id, code.describe());
            sessions.response_sent(self, code, &[]);
        }

        if self.functional && code.is_suppressed_for_functional_request() {
            log::debug!(
                "Negative response 0x{:02X} to functional request of service 0x{:02X} suppressed",
                code.as_byte(),
                self.service_id
            );
            self.send_state.finish();
            return self.sender.take().map(|s| Notification::new(s, ResponseSendResult::Sent));
        }
        if self.response_pending_being_sent {
            return None;
        }
        if code == DiagReturnCode::ResponsePending {
            self.restart_pending_timeout(executor);
        }
        self.send_response(transport)
    }

    /// Commits a sub-response of the nested request
    pub(crate) fn nested_send_positive_response(
        &mut self,
        length: usize,
        sender: JobId,
        hooks: &mut dyn NestedRequestHooks,
    ) -> Notification {
        self.send_state.finish();
        let overflow = self.response.is_overflow();
        self.nested.set_nested_response_length(length, hooks);
        if overflow {
            self.nested.handle_response_overflow(hooks);
        }
        Notification::new(sender, ResponseSendResult::Sent)
    }

    /// Handles a negative response to a sub-request of the nested request
    pub(crate) fn nested_send_negative_response(
        &mut self,
        code: DiagReturnCode,
        sender: JobId,
        hooks: &mut dyn NestedRequestHooks,
        executor: &mut ExecutionContext,
        transport: &mut dyn TransportSender,
    ) -> Option<Notification> {
        self.send_state.finish();
        if code != DiagReturnCode::ResponsePending {
            self.nested.handle_negative_response_code(code, hooks);
            return Some(Notification::new(sender, ResponseSendResult::Sent));
        }
        if self.nested.is_pending_sent() {
            return Some(Notification::new(sender, ResponseSendResult::Sent));
        }
        self.nested.set_pending_response_sender(sender);
        if self.send_state.outstanding() != 0 {
            self.response_pending_is_pending = true;
        } else {
            self.response_pending_is_pending = false;
            self.send_response_pending(transport);
        }
        self.restart_pending_timeout(executor);
        None
    }

    fn send_response(&mut self, transport: &mut dyn TransportSender) -> Option<Notification> {
        let payload: &[u8] = match self.frame {
            ResponseFrame::Positive(total) => &self.response.storage()[..total],
            ResponseFrame::Negative => &self.negative_frame,
            ResponseFrame::None => &[],
        };
        let frame = OutgoingFrame {
            connection: Some(self.handle),
            kind: FrameKind::Response,
            source: self.response_source(),
            target: self.source_id,
            payload,
        };
        match transport.send(&frame) {
            Ok(()) => None,
            Err(e) => {
                log::error!(
                    "Failed to send response of 0x{:04X} --> 0x{:04X}, service 0x{:02X}: {e}",
                    frame.source,
                    frame.target,
                    self.service_id
                );
                self.send_state.finish();
                self.sender.take().map(|s| Notification::new(s, ResponseSendResult::SendFailed))
            }
        }
    }

    fn send_response_pending(&mut self, transport: &mut dyn TransportSender) {
        if !self.open {
            return;
        }
        let payload = [
            NEGATIVE_RESPONSE_IDENTIFIER,
            self.service_id,
            DiagReturnCode::ResponsePending.as_byte(),
        ];
        self.send_state.begin();
        let was_sent = self.response_pending_sent;
        self.response_pending_sent = true;
        self.response_pending_being_sent = true;
        let frame = OutgoingFrame {
            connection: Some(self.handle),
            kind: FrameKind::ResponsePending,
            source: self.response_source(),
            target: self.source_id,
            payload: &payload,
        };
        if let Err(e) = transport.send(&frame) {
            log::error!(
                "Failed to send response pending of 0x{:04X} --> 0x{:04X}, service 0x{:02X}: {e}",
                frame.source,
                frame.target,
                self.service_id
            );
            self.send_state.finish();
            self.response_pending_sent = was_sent;
            self.response_pending_being_sent = false;
        }
    }

    /// The transport finished a frame of this connection
    pub(crate) fn transport_message_processed(
        &mut self,
        kind: FrameKind,
        result: ProcessingResult,
        transport: &mut dyn TransportSender,
    ) -> Completion {
        self.send_state.finish();
        if result == ProcessingResult::Error {
            log::error!(
                "Transport failed to send {kind:?} of 0x{:04X} --> 0x{:04X}, service 0x{:02X}",
                self.response_source(),
                self.source_id,
                self.service_id
            );
        }
        let notify = match kind {
            FrameKind::ResponsePending => {
                self.response_pending_being_sent = false;
                if self.nested.is_active() {
                    self.nested.set_pending_sent();
                    let notify = self
                        .nested
                        .take_pending_response_sender()
                        .map(|s| Notification::new(s, result.into()));
                    return Completion { notify, settle: false };
                }
                if self.sender.is_some() {
                    // A response was held back while the pending frame was in flight
                    self.send_response(transport)
                } else {
                    None
                }
            }
            FrameKind::Response => self.sender.take().map(|s| Notification::new(s, result.into())),
        };
        Completion { notify, settle: true }
    }

    /// Runs deferred work once no callbacks are outstanding anymore
    pub(crate) fn settle(&mut self, executor: &mut ExecutionContext, transport: &mut dyn TransportSender) {
        if self.send_state.outstanding() != 0 {
            return;
        }
        if self.send_state.termination_due() {
            self.terminate(executor);
        } else if self.response_pending_is_pending {
            self.response_pending_is_pending = false;
            self.send_response_pending(transport);
        }
    }

    /// A timer of this connection expired
    pub(crate) fn expired(
        &mut self,
        timer: ConnectionTimer,
        executor: &mut ExecutionContext,
        transport: &mut dyn TransportSender,
    ) {
        match timer {
            ConnectionTimer::ResponsePending => {
                self.pending_timer = None;
                if !self.open {
                    return;
                }
                if self.send_state.outstanding() != 0 {
                    self.response_pending_is_pending = true;
                } else {
                    self.response_pending_is_pending = false;
                    self.send_response_pending(transport);
                }
                self.restart_pending_timeout(executor);
            }
            ConnectionTimer::Global => {
                self.global_timer = None;
                log::warn!(
                    "Global timeout of 0x{:04X} --> 0x{:04X}, service 0x{:02X}",
                    self.source_id,
                    self.target_id,
                    self.service_id
                );
                if let Some(timer) = self.pending_timer.take() {
                    executor.cancel(timer);
                }
                self.pending_activated = false;
                // Sub-requests still waiting must not keep the request alive
                self.nested.finish();
                self.terminate(executor);
            }
        }
    }

    /// Ends the request. Inside a nested request the next sub-request is triggered instead.
    /// The connection closes once no frames are in flight anymore
    pub(crate) fn terminate(&mut self, executor: &mut ExecutionContext) {
        if self.nested.is_active() {
            if self.nested.response_code() == DiagReturnCode::Ok {
                executor.post(DiagEvent::TriggerNextNestedRequest { connection: self.handle });
            } else {
                self.end_nested_request(executor);
            }
            return;
        }
        if !self.open {
            return;
        }
        if self.send_state.outstanding() != 0 {
            log::debug!(
                "Termination of service 0x{:02X} deferred, {} frames in flight",
                self.service_id,
                self.send_state.outstanding()
            );
            self.send_state = SendState::TerminationPending(self.send_state.outstanding());
            return;
        }
        log::debug!(
            "Terminating 0x{:04X} --> 0x{:04X}, service 0x{:02X}",
            self.source_id,
            self.target_id,
            self.service_id
        );
        self.open = false;
        self.has_request = false;
        self.cancel_timers(executor);
        self.send_state = SendState::Idle;
        self.sender = None;
        self.response_posted = false;
        self.response_active = false;
        self.response_pending_is_pending = false;
        executor.post(DiagEvent::ConnectionTerminated { connection: self.handle });
    }

    /// Forces the connection closed without waiting for frames in flight
    pub(crate) fn close(&mut self, executor: &mut ExecutionContext) {
        self.nested.finish();
        self.send_state = SendState::Idle;
        self.terminate(executor);
    }

    pub(crate) fn is_nested_active(&self) -> bool {
        self.nested.is_active()
    }

    pub(crate) fn nested_sender(&self) -> Option<JobId> {
        self.nested.sender()
    }

    pub(crate) fn begin_nested_request(&mut self, sender: JobId, hooks: &dyn NestedRequestHooks, request: &[u8]) {
        assert!(!self.nested.is_active(), "nested request started while another one is running");
        self.release_request_get_response();
        let prefix = hooks.prefix_length().min(MAXIMUM_NUMBER_OF_IDENTIFIERS);
        self.identifiers.resize(prefix, 0);
        let start = self.identifiers.len();
        let end = self.response.capacity();
        self.nested
            .init(sender, self.response.storage_mut(), start..end, request, hooks);
    }

    pub(crate) fn prepare_next_nested_request(&mut self, hooks: &mut dyn NestedRequestHooks) -> bool {
        if !self.nested.is_active() {
            return false;
        }
        self.response_active = false;
        self.response_posted = false;
        if self.nested.prepare_next_request(self.response.storage(), hooks) {
            self.nested.begin_sub_request();
            true
        } else {
            false
        }
    }

    pub(crate) fn handle_nested_negative_response(&mut self, code: DiagReturnCode, hooks: &mut dyn NestedRequestHooks) {
        self.nested.handle_negative_response_code(code, hooks);
    }

    /// Ends the nested request and sends the combined response
    pub(crate) fn end_nested_request(&mut self, executor: &mut ExecutionContext) {
        if !self.nested.is_active() {
            return;
        }
        let Some(sender) = self.nested.sender() else {
            self.nested.finish();
            return;
        };
        let length = self.nested.response_length();
        let code = self.nested.response_code();
        self.nested.finish();
        self.response_active = true;
        self.response_posted = false;
        let result = if code == DiagReturnCode::Ok {
            self.send_positive_response_internal(length, sender, executor)
        } else {
            self.send_negative_response(code, sender, executor)
        };
        if let Err(e) = result {
            log::error!("Failed to send response of nested request: {e}");
        }
    }

    pub(crate) fn take_request(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.request)
    }

    pub(crate) fn restore_request(&mut self, request: Vec<u8>) {
        self.request = request;
    }

    pub(crate) fn take_nested_request(&mut self) -> Vec<u8> {
        self.nested.take_next_request()
    }

    pub(crate) fn restore_nested_request(&mut self, request: Vec<u8>) {
        self.nested.restore_next_request(request);
    }
}
