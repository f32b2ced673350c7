use automotive_diag::uds::UdsSessionTypeByte;

use crate::{
    AsyncRequestPool, DiagReturnCode, DiagServerResult, NestedRequestHooks, PositiveResponse,
    connection::{ConnectionHandle, IncomingDiagConnection},
    context::{DiagEvent, ExecutionContext},
    session::DiagSessionManager,
};

use super::{DiagJob, DiagJobNode, JobId, JobTree, RequestLocation, RequestOrigin};

/// Everything a job may touch while it runs.
///
/// A context is bound to one connection and to the job currently executing. It is handed to
/// every [DiagJob] callback and is the only way for jobs to answer a request.
pub struct JobContext<'a> {
    pub(crate) jobs: &'a mut JobTree,
    pub(crate) connection: &'a mut IncomingDiagConnection,
    pub(crate) sessions: &'a mut dyn DiagSessionManager,
    pub(crate) executor: &'a mut ExecutionContext,
    pub(crate) async_helper: &'a mut dyn AsyncRequestPool,
    job: JobId,
    origin: RequestOrigin,
    offset: usize,
}

impl<'a> JobContext<'a> {
    pub(crate) fn new(
        jobs: &'a mut JobTree,
        connection: &'a mut IncomingDiagConnection,
        sessions: &'a mut dyn DiagSessionManager,
        executor: &'a mut ExecutionContext,
        async_helper: &'a mut dyn AsyncRequestPool,
        job: JobId,
    ) -> Self {
        Self {
            jobs,
            connection,
            sessions,
            executor,
            async_helper,
            job,
            origin: RequestOrigin::Connection,
            offset: 0,
        }
    }

    /// Job this context currently runs
    pub fn job_id(&self) -> JobId {
        self.job
    }

    /// Node of the job this context currently runs
    pub fn node(&self) -> &DiagJobNode {
        self.jobs.node(self.job)
    }

    /// The job tree
    pub fn jobs(&self) -> &JobTree {
        self.jobs
    }

    /// Connection the request arrived on
    pub fn connection(&self) -> &IncomingDiagConnection {
        self.connection
    }

    /// Handle of the connection the request arrived on
    pub fn connection_handle(&self) -> ConnectionHandle {
        self.connection.handle()
    }

    /// Currently active diagnostic session
    pub fn active_session(&self) -> UdsSessionTypeByte {
        self.sessions.active_session()
    }

    /// Current time of the execution context
    pub fn now_ms(&self) -> u64 {
        self.executor.now_ms()
    }

    /// Runs `id` on `request`: verification, session and length checks, identifier
    /// bookkeeping and finally [DiagJob::process].
    ///
    /// `request` must be the slice handed to the calling job (or a sub-request of a nested request)
    pub fn execute(&mut self, id: JobId, request: &mut [u8]) -> DiagReturnCode {
        let Some(mut job) = self.jobs.take_job(id) else {
            log::error!("Diag job 0x{:X} is already executing", self.jobs.node(id).request_id());
            return DiagReturnCode::NotResponsible;
        };
        let result = self.execute_with(id, job.as_mut(), request);
        self.jobs.restore_job(id, job);
        result
    }

    /// Same as [JobContext::execute] for a job that is currently borrowed by the caller
    pub fn execute_with(&mut self, id: JobId, job: &mut dyn DiagJob, request: &mut [u8]) -> DiagReturnCode {
        let previous = std::mem::replace(&mut self.job, id);
        let result = self.run(job, request);
        self.job = previous;
        result
    }

    fn run(&mut self, job: &mut dyn DiagJob, request: &mut [u8]) -> DiagReturnCode {
        let id = self.job;
        match job.verify(self.jobs.node(id), request) {
            DiagReturnCode::Ok => {}
            DiagReturnCode::NotResponsible => return DiagReturnCode::NotResponsible,
            code => {
                self.sessions.accepted_job(self.connection, self.jobs.node(id), request);
                return code;
            }
        }

        let node = self.jobs.node(id);
        let consumed = node.consumed_length();
        let payload_length = node.payload_length();
        let response_length = node.response_length();
        let suppress_enabled = node.is_suppress_positive_response_enabled();

        if !node.allowed_sessions().matches(self.sessions.active_session()) {
            self.accept_job(request);
            return DiagReturnCode::RequestOutOfRange;
        }
        if request.len() < consumed {
            self.accept_job(request);
            return DiagReturnCode::InvalidFormat;
        }
        if payload_length.is_some_and(|p| request.len() - consumed != usize::from(p)) {
            self.accept_job(request);
            return DiagReturnCode::InvalidFormat;
        }
        for b in &request[..consumed] {
            self.connection.add_identifier(*b);
        }
        if response_length.is_some_and(|r| usize::from(r) > self.connection.maximum_response_length()) {
            self.accept_job(request);
            return DiagReturnCode::ResponseTooLong;
        }

        let rest = &mut request[consumed..];
        if suppress_enabled {
            if let Some(sub_function) = rest.first_mut() {
                if *sub_function & 0x80 != 0 {
                    *sub_function &= 0x7F;
                    self.connection.suppress_positive_response();
                }
            }
        }
        self.accept_job(rest);
        log::debug!("Process diag job 0x{:X}", self.jobs.node(id).request_id());

        self.offset += consumed;
        let result = job.process(self, rest);
        self.offset -= consumed;
        result
    }

    fn accept_job(&mut self, request: &[u8]) {
        let node = self.jobs.node(self.job);
        if node.request_length() > 0 {
            self.sessions.accepted_job(self.connection, node, request);
        }
    }

    /// Offers `request` to the children of the current job in registration order. Returns the
    /// first result which is not [DiagReturnCode::NotResponsible], or the job's default negative
    /// code if no child is responsible
    pub fn process_children(&mut self, request: &mut [u8]) -> DiagReturnCode {
        let first = self.jobs.first_child(self.job);
        match self.execute_siblings(first, request) {
            DiagReturnCode::NotResponsible => self.jobs.node(self.job).default_negative_code(),
            result => result,
        }
    }

    /// Offers `request` to `first` and its following siblings, until one is responsible
    pub fn execute_siblings(&mut self, first: Option<JobId>, request: &mut [u8]) -> DiagReturnCode {
        let mut result = DiagReturnCode::NotResponsible;
        let mut current = first;
        while result == DiagReturnCode::NotResponsible {
            let Some(id) = current else { break };
            result = self.execute(id, request);
            current = self.jobs.next_sibling(id);
        }
        result
    }

    /// Releases the request and binds the response window of the current request
    pub fn release_request_get_response(&mut self) -> &mut PositiveResponse {
        self.connection.release_request_get_response()
    }

    /// Number of identifiers collected for the current request
    pub fn num_identifiers(&self) -> usize {
        self.connection.num_identifiers()
    }

    /// Identifier byte at `idx`
    pub fn identifier(&self, idx: usize) -> u8 {
        self.connection.identifier(idx)
    }

    /// Payload bytes the current response window may hold
    pub fn maximum_response_length(&self) -> usize {
        self.connection.maximum_response_length()
    }

    /// Sends the response written through [JobContext::release_request_get_response] on behalf
    /// of the current job, which gets notified through [DiagJob::response_sent]
    pub fn send_positive_response(&mut self) -> DiagServerResult<()> {
        self.connection.send_positive_response(self.job, self.executor)
    }

    /// Sends a negative response on behalf of the current job
    pub fn send_negative_response(&mut self, code: DiagReturnCode) -> DiagServerResult<()> {
        self.connection.send_negative_response(code, self.job, self.executor)
    }

    /// Ends the request. Deferred while responses are in flight, and inside a nested request
    /// this continues with the next sub-request instead
    pub fn terminate(&mut self) {
        self.connection.terminate(self.executor);
    }

    /// Adjusts the response pending period to the default period plus `diff_ms`
    pub fn change_resp_pending_timer(&mut self, diff_ms: i32) {
        self.connection.change_resp_pending_timer(diff_ms);
    }

    /// Stops sending response pending frames for the current request
    pub fn disable_response_timeout(&mut self) {
        self.connection.disable_response_timeout(self.executor);
    }

    /// Stops the global timeout of the current request
    pub fn disable_global_timeout(&mut self) {
        self.connection.disable_global_timeout(self.executor);
    }

    /// Starts a nested request driven by `hooks` on behalf of the current job. `request` is
    /// stored in the tail of the response buffer and consumed by the hooks piece by piece
    pub fn start_nested_request(&mut self, hooks: &mut dyn NestedRequestHooks, request: &[u8]) -> DiagReturnCode {
        self.connection.begin_nested_request(self.job, hooks, request);
        self.trigger_next_nested_request(hooks);
        DiagReturnCode::Ok
    }

    /// Processes sub-requests until one of them answers asynchronously, or the nested request ends
    pub(crate) fn trigger_next_nested_request(&mut self, hooks: &mut dyn NestedRequestHooks) {
        while self.connection.prepare_next_nested_request(hooks) {
            let mut request = self.connection.take_nested_request();
            let saved = (self.origin, self.offset);
            self.origin = RequestOrigin::Nested;
            self.offset = 0;
            let result = hooks.process_nested_request(self, &mut request);
            (self.origin, self.offset) = saved;
            self.connection.restore_nested_request(request);
            if result == DiagReturnCode::Ok {
                return;
            }
            self.connection.handle_nested_negative_response(result, hooks);
        }
        self.connection.end_nested_request(self.executor);
    }

    /// Location of `request`, which must be the slice handed to the current job
    pub(crate) fn locate(&self, request: &[u8]) -> RequestLocation {
        RequestLocation {
            origin: self.origin,
            offset: self.offset,
            length: request.len(),
        }
    }

    /// Runs the deferred body of the current job with `request` on the execution context
    pub(crate) fn schedule_async_process(&mut self, request: &[u8]) {
        let event = DiagEvent::AsyncProcess {
            job: self.job,
            connection: self.connection.handle(),
            request: self.locate(request),
        };
        self.executor.post(event);
    }

    /// Runs `f` on the request bytes at `location`. Returns `None` if the location is not
    /// valid for the connection
    pub(crate) fn with_request<R>(
        &mut self,
        location: RequestLocation,
        f: impl FnOnce(&mut Self, &mut [u8]) -> R,
    ) -> Option<R> {
        let mut buffer = match location.origin {
            RequestOrigin::Connection => self.connection.take_request(),
            RequestOrigin::Nested => self.connection.take_nested_request(),
        };
        let saved = (self.origin, self.offset);
        self.origin = location.origin;
        self.offset = location.offset;
        let result = location
            .offset
            .checked_add(location.length)
            .and_then(|end| buffer.get_mut(location.offset..end))
            .map(|request| f(self, request));
        (self.origin, self.offset) = saved;
        match location.origin {
            RequestOrigin::Connection => self.connection.restore_request(buffer),
            RequestOrigin::Nested => self.connection.restore_nested_request(buffer),
        }
        result
    }
}

impl std::fmt::Debug for JobContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job", &self.job)
            .field("connection", &self.connection.handle())
            .field("origin", &self.origin)
            .field("offset", &self.offset)
            .finish()
    }
}
