//! Nested requests
//!
//! A nested request splits one incoming request into a series of sub-requests which are
//! executed one after another on the same connection. The sub-responses are concatenated in
//! the response buffer of the connection. The not yet consumed part of the request is
//! kept at the tail of that very buffer, while the responses grow from its head:
//!
//! ```text
//! | identifiers | sub-response 1 | sub-response 2 | ... free ... | stored request |
//!               ^ window start                   ^ head         ^ tail           ^ end
//! ```
//!
//! A typical user is ReadDataByIdentifier with multiple DIDs, which answers each DID with its
//! own job and merges the results.

use std::ops::Range;

use crate::{DiagReturnCode, connection::MAXIMUM_NUMBER_OF_IDENTIFIERS, job::JobContext, job::JobId};

/// Customisation points of a nested request
pub trait NestedRequestHooks {
    /// Number of identifier bytes each sub-request shares with the request that started the
    /// nested request. These are sent only once, in front of all sub-responses
    fn prefix_length(&self) -> usize;

    /// Number of bytes of the starting request to keep for the following sub-requests
    fn stored_request_length(&self, request: &[u8]) -> usize {
        request.len()
    }

    /// Copies the part of `request` to keep into `dest`, which has
    /// [NestedRequestHooks::stored_request_length] bytes
    fn store_request(&self, request: &[u8], dest: &mut [u8]) {
        let n = dest.len().min(request.len());
        dest[..n].copy_from_slice(&request[..n]);
    }

    /// Builds the next sub-request from the stored request. Returning an empty request ends
    /// the nested request
    fn prepare_nested_request(&mut self, stored: &mut StoredNestedRequest<'_>) -> &[u8];

    /// Executes a sub-request. Returning anything but [DiagReturnCode::Ok] is treated as a
    /// negative response to the sub-request
    fn process_nested_request(&mut self, cx: &mut JobContext<'_>, request: &mut [u8]) -> DiagReturnCode;

    /// Called with the outcome of every sub-request. The default ends the nested request on the
    /// first negative response
    fn handle_nested_response_code(&mut self, nested: &mut NestedDiagRequest, code: DiagReturnCode) {
        nested.set_response_code(code);
    }

    /// Called if a sub-response did not fit into the response buffer
    fn handle_overflow(&mut self, nested: &mut NestedDiagRequest) {
        nested.set_response_code(DiagReturnCode::ResponseTooLong);
    }
}

/// Stored (not yet consumed) part of a nested request, handed to
/// [NestedRequestHooks::prepare_nested_request]
#[derive(Debug)]
pub struct StoredNestedRequest<'b> {
    buffer: &'b [u8],
    end: usize,
    stored_length: &'b mut usize,
    response_code: &'b mut DiagReturnCode,
}

impl<'b> StoredNestedRequest<'b> {
    /// Bytes of the stored request which were not consumed yet
    pub fn remaining(&self) -> &'b [u8] {
        &self.buffer[self.end - *self.stored_length..self.end]
    }

    /// Consumes the next `n` bytes of the stored request. Returns an empty slice if fewer than
    /// `n` bytes are left
    pub fn consume(&mut self, n: usize) -> &'b [u8] {
        if *self.stored_length < n {
            return &[];
        }
        let from = self.end - *self.stored_length;
        *self.stored_length -= n;
        &self.buffer[from..from + n]
    }

    /// Sets the final response code of the nested request
    pub fn set_response_code(&mut self, code: DiagReturnCode) {
        *self.response_code = code;
    }
}

/// State of a nested request of one connection
#[derive(Debug, Clone)]
pub struct NestedDiagRequest {
    active: bool,
    sender: Option<JobId>,
    pending_response_sender: Option<JobId>,
    head: usize,
    end: usize,
    stored_request_length: usize,
    response_length: usize,
    prefix_length: usize,
    identifiers: [u8; MAXIMUM_NUMBER_OF_IDENTIFIERS],
    num_identifiers: usize,
    num_prefix_identifiers: usize,
    is_pending_sent: bool,
    response_code: DiagReturnCode,
    next_request: Vec<u8>,
}

impl NestedDiagRequest {
    pub(crate) fn new(max_request_length: usize) -> Self {
        Self {
            active: false,
            sender: None,
            pending_response_sender: None,
            head: 0,
            end: 0,
            stored_request_length: 0,
            response_length: 0,
            prefix_length: 0,
            identifiers: [0; MAXIMUM_NUMBER_OF_IDENTIFIERS],
            num_identifiers: 0,
            num_prefix_identifiers: 0,
            is_pending_sent: false,
            response_code: DiagReturnCode::Ok,
            next_request: Vec::with_capacity(max_request_length),
        }
    }

    /// Starts a nested request on `window` of `buffer`. The part of `request` the hooks want to
    /// keep is copied to the end of the window
    pub(crate) fn init(
        &mut self,
        sender: JobId,
        buffer: &mut [u8],
        window: Range<usize>,
        request: &[u8],
        hooks: &dyn NestedRequestHooks,
    ) {
        let stored = hooks.stored_request_length(request);
        assert!(
            stored <= window.len(),
            "stored request of {stored} bytes exceeds nested window of {} bytes",
            window.len()
        );
        self.active = true;
        self.sender = Some(sender);
        self.pending_response_sender = None;
        self.head = window.start;
        self.end = window.end;
        self.stored_request_length = stored;
        self.response_length = 0;
        self.prefix_length = hooks.prefix_length();
        self.num_identifiers = 0;
        self.num_prefix_identifiers = 0;
        self.is_pending_sent = false;
        self.response_code = DiagReturnCode::Ok;
        self.next_request.clear();
        hooks.store_request(request, &mut buffer[self.tail()..self.end]);
    }

    pub(crate) fn finish(&mut self) {
        self.active = false;
        self.sender = None;
        self.pending_response_sender = None;
    }

    /// True while the nested request runs
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Job which started the nested request
    pub fn sender(&self) -> Option<JobId> {
        self.sender
    }

    /// Final response code. [DiagReturnCode::Ok] while sub-requests may still be issued
    pub fn response_code(&self) -> DiagReturnCode {
        self.response_code
    }

    /// Sets the final response code. Any code but [DiagReturnCode::Ok] ends the nested request
    pub fn set_response_code(&mut self, code: DiagReturnCode) {
        self.response_code = code;
    }

    /// Accumulated length of all sub-responses
    pub fn response_length(&self) -> usize {
        self.response_length
    }

    /// Number of shared identifier bytes
    pub fn prefix_length(&self) -> usize {
        self.prefix_length
    }

    /// Number of not yet consumed request bytes
    pub fn stored_request_length(&self) -> usize {
        self.stored_request_length
    }

    /// Current sub-request
    pub fn next_request(&self) -> &[u8] {
        &self.next_request
    }

    /// Number of identifiers collected for the current sub-request
    pub fn num_identifiers(&self) -> usize {
        self.num_identifiers
    }

    /// Identifier byte of the current sub-request
    pub fn identifier(&self, idx: usize) -> u8 {
        if idx < self.num_identifiers.min(MAXIMUM_NUMBER_OF_IDENTIFIERS) {
            self.identifiers[idx]
        } else {
            0
        }
    }

    /// True once a response pending frame was sent for the nested request
    pub fn is_pending_sent(&self) -> bool {
        self.is_pending_sent
    }

    pub(crate) fn set_pending_sent(&mut self) {
        self.is_pending_sent = true;
    }

    pub(crate) fn set_pending_response_sender(&mut self, sender: JobId) {
        self.pending_response_sender = Some(sender);
    }

    pub(crate) fn take_pending_response_sender(&mut self) -> Option<JobId> {
        self.pending_response_sender.take()
    }

    fn tail(&self) -> usize {
        self.end - self.stored_request_length
    }

    /// Lets the hooks build the next sub-request. Returns false if the nested request is done
    pub(crate) fn prepare_next_request(&mut self, buffer: &[u8], hooks: &mut dyn NestedRequestHooks) -> bool {
        if self.response_code == DiagReturnCode::Ok {
            let mut stored = StoredNestedRequest {
                buffer,
                end: self.end,
                stored_length: &mut self.stored_request_length,
                response_code: &mut self.response_code,
            };
            let next = hooks.prepare_nested_request(&mut stored);
            self.next_request.clear();
            self.next_request.extend_from_slice(next);
        }
        self.response_code == DiagReturnCode::Ok && !self.next_request.is_empty()
    }

    /// Resets the identifiers before a sub-request is executed
    pub(crate) fn begin_sub_request(&mut self) {
        self.num_identifiers = 0;
        self.num_prefix_identifiers = 0;
    }

    pub(crate) fn take_next_request(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.next_request)
    }

    pub(crate) fn restore_next_request(&mut self, request: Vec<u8>) {
        self.next_request = request;
    }

    pub(crate) fn add_identifier(&mut self, identifier: u8) {
        if self.num_identifiers < MAXIMUM_NUMBER_OF_IDENTIFIERS {
            self.identifiers[self.num_identifiers] = identifier;
        }
        self.num_identifiers += 1;
    }

    /// Response window of the current sub-request. The identifiers of the sub-request past the
    /// shared prefix are written in front of it, so calling this repeatedly yields the same window
    pub(crate) fn response_buffer(&mut self, buffer: &mut [u8]) -> Range<usize> {
        if self.num_identifiers >= self.prefix_length {
            let collected = self.num_identifiers.min(MAXIMUM_NUMBER_OF_IDENTIFIERS);
            let prefix = self.prefix_length.min(collected);
            self.num_prefix_identifiers = collected - prefix;
            buffer[self.head..self.head + self.num_prefix_identifiers]
                .copy_from_slice(&self.identifiers[prefix..collected]);
        }
        let start = self.head + self.num_prefix_identifiers;
        assert!(start <= self.tail(), "nested response overlaps the stored request");
        start..self.tail()
    }

    /// Payload bytes a sub-response may still use
    pub fn max_nested_response_length(&self) -> usize {
        (self.end - self.head).saturating_sub(self.stored_request_length + self.num_identifiers)
    }

    /// Commits a sub-response of `length` payload bytes
    pub(crate) fn set_nested_response_length(&mut self, length: usize, hooks: &mut dyn NestedRequestHooks) {
        let length = length + self.num_prefix_identifiers;
        self.head += length;
        assert!(self.head <= self.tail(), "nested response overlaps the stored request");
        self.response_length += length;
        hooks.handle_nested_response_code(self, DiagReturnCode::Ok);
    }

    pub(crate) fn handle_negative_response_code(&mut self, code: DiagReturnCode, hooks: &mut dyn NestedRequestHooks) {
        hooks.handle_nested_response_code(self, code);
    }

    pub(crate) fn handle_response_overflow(&mut self, hooks: &mut dyn NestedRequestHooks) {
        hooks.handle_overflow(self);
    }
}
