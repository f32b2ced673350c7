//! Diagnostic dispatcher
//!
//! The [DiagDispatcher] is the entry point of the engine. It accepts requests from the
//! transport, assigns them to a pooled [IncomingDiagConnection], routes them through the job
//! tree and drives all deferred work on its [ExecutionContext].
//!
//! ## Example
//! ```
//! use ecu_uds_dispatch::{
//!     DefaultSessionManager, DiagDispatcher, DiagnosisConfiguration, ExecutionContext,
//!     services::{MultipleReadDataByIdentifier, ReadIdentifierFromSlice},
//!     transport::SimulationTransport,
//! };
//!
//! let context = ExecutionContext::new();
//! let transport = SimulationTransport::auto_acknowledge(context.handle());
//! let mut dispatcher = DiagDispatcher::new(
//!     DiagnosisConfiguration::default(),
//!     context,
//!     Box::new(DefaultSessionManager::default()),
//!     Box::new(transport.clone()),
//! );
//! dispatcher.add_job(MultipleReadDataByIdentifier::node(), MultipleReadDataByIdentifier::new()).unwrap();
//! dispatcher.add_job(ReadIdentifierFromSlice::node(0xF18B), ReadIdentifierFromSlice::new(&[0x10, 0x07, 0x01])).unwrap();
//!
//! dispatcher.receive_request(0xF1, 0x10, &[0x22, 0xF1, 0x8B]).unwrap();
//! dispatcher.run_until_idle();
//! assert_eq!(transport.sent_payloads(), vec![vec![0x62, 0xF1, 0x8B, 0x10, 0x07, 0x01]]);
//! ```

use crate::{
    AsyncDiagHelper, AsyncRequestPool, DiagError, DiagJob, DiagJobNode, DiagReturnCode, DiagServerResult, JobContext, JobId,
    JobTree,
    async_helper::process_and_release_request,
    connection::{ConnectionHandle, ConnectionTimer, IncomingDiagConnection, Notification},
    context::{ContextHandle, DiagEvent, ExecutionContext},
    diag_return_code::NEGATIVE_RESPONSE_IDENTIFIER,
    job::{AddJobResult, RequestLocation},
    session::DiagSessionManager,
    transport::{FrameKind, OutgoingFrame, ProcessingResult, TransportSender},
};

/// Timeouts of a connection
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimeoutConfig {
    /// Time after which the first response pending frame is sent
    pub initial_pending_timeout_ms: u32,
    /// Period of all following response pending frames
    pub pending_timeout_ms: u32,
    /// Time after which a request is aborted
    pub global_pending_timeout_ms: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            initial_pending_timeout_ms: 40,
            pending_timeout_ms: 4500,
            global_pending_timeout_ms: 190_000,
        }
    }
}

/// Configuration of a [DiagDispatcher]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiagnosisConfiguration {
    /// Physical address of the ECU
    pub diag_address: u16,
    /// Functional (broadcast) address the ECU listens to, if any
    pub broadcast_address: Option<u16>,
    /// Size of the request and response buffers of each connection
    pub max_response_payload_size: u16,
    /// Number of requests which can be processed in parallel
    pub incoming_connections: u8,
    /// Number of requests which can be parked while jobs are busy
    pub async_request_pool_size: u8,
    /// Send response pending frames automatically
    pub activate_outgoing_pending: bool,
    /// Accept requests from any source address
    pub accept_all_requests: bool,
    /// Inclusive range of tester source addresses
    pub tester_address_range: (u16, u16),
    /// Connection timeouts
    pub timeouts: TimeoutConfig,
}

impl Default for DiagnosisConfiguration {
    fn default() -> Self {
        Self {
            diag_address: 0x10,
            broadcast_address: Some(0xDF),
            max_response_payload_size: 4095,
            incoming_connections: 2,
            async_request_pool_size: 4,
            activate_outgoing_pending: true,
            accept_all_requests: false,
            tester_address_range: (0xF0, 0xFD),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl DiagnosisConfiguration {
    /// True if `address` is a tester address
    pub fn is_tester(&self, address: u16) -> bool {
        (self.tester_address_range.0..=self.tester_address_range.1).contains(&address)
    }
}

#[derive(Debug)]
struct ConnectionSlot {
    connection: IncomingDiagConnection,
    acquired: bool,
    generation: u32,
}

/// UDS server core: routes requests to jobs and delivers their responses
pub struct DiagDispatcher {
    config: DiagnosisConfiguration,
    jobs: JobTree,
    connections: Vec<ConnectionSlot>,
    sessions: Box<dyn DiagSessionManager>,
    transport: Box<dyn TransportSender>,
    executor: ExecutionContext,
    async_helper: Box<dyn AsyncRequestPool>,
    enabled: bool,
    shutdown_requested: bool,
}

impl std::fmt::Debug for DiagDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagDispatcher")
            .field("config", &self.config)
            .field("jobs", &self.jobs.len())
            .field("connections", &self.connections)
            .field("enabled", &self.enabled)
            .field("shutdown_requested", &self.shutdown_requested)
            .finish()
    }
}

impl DiagDispatcher {
    /// Creates a dispatcher. All buffers are allocated here
    pub fn new(
        config: DiagnosisConfiguration,
        executor: ExecutionContext,
        sessions: Box<dyn DiagSessionManager>,
        transport: Box<dyn TransportSender>,
    ) -> Self {
        let pool = AsyncDiagHelper::new(usize::from(config.async_request_pool_size));
        Self::with_request_pool(config, executor, sessions, transport, Box::new(pool))
    }

    /// Creates a dispatcher parking requests of busy jobs in `pool`.
    /// [DiagnosisConfiguration::async_request_pool_size] is not used
    pub fn with_request_pool(
        config: DiagnosisConfiguration,
        executor: ExecutionContext,
        sessions: Box<dyn DiagSessionManager>,
        transport: Box<dyn TransportSender>,
        pool: Box<dyn AsyncRequestPool>,
    ) -> Self {
        let connections = (0..usize::from(config.incoming_connections))
            .map(|index| ConnectionSlot {
                connection: IncomingDiagConnection::new(
                    index,
                    usize::from(config.max_response_payload_size),
                    config.diag_address,
                    config.timeouts,
                ),
                acquired: false,
                generation: 0,
            })
            .collect();
        Self {
            config,
            jobs: JobTree::new(),
            connections,
            sessions,
            transport,
            executor,
            async_helper: pool,
            enabled: true,
            shutdown_requested: false,
        }
    }

    /// Configuration of the dispatcher
    pub fn config(&self) -> &DiagnosisConfiguration {
        &self.config
    }

    /// The job tree
    pub fn jobs(&self) -> &JobTree {
        &self.jobs
    }

    /// The job tree, for building it
    pub fn jobs_mut(&mut self) -> &mut JobTree {
        &mut self.jobs
    }

    /// Stores `job` and links it into the tree
    pub fn add_job(&mut self, node: DiagJobNode, job: impl DiagJob + 'static) -> DiagServerResult<JobId> {
        let request_id = node.request_id();
        let id = self.jobs.insert(node, job);
        match self.jobs.add_job(id) {
            AddJobResult::Added => Ok(id),
            AddJobResult::NotAdded => Err(DiagError::JobNotAdded(request_id)),
        }
    }

    /// Handle for transports to report completions from other threads
    pub fn context_handle(&self) -> ContextHandle {
        self.executor.handle()
    }

    /// Current time of the execution context
    pub fn now_ms(&self) -> u64 {
        self.executor.now_ms()
    }

    /// Connection of `handle`, if the handle is still valid
    pub fn connection(&self, handle: ConnectionHandle) -> Option<&IncomingDiagConnection> {
        self.resolve(handle).map(|index| &self.connections[index].connection)
    }

    /// Number of connections currently in use
    pub fn active_connections(&self) -> usize {
        self.connections.iter().filter(|c| c.acquired).count()
    }

    /// Number of free slots of the request pool
    pub fn available_request_slots(&self) -> usize {
        self.async_helper.available()
    }

    /// Starts accepting requests
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Stops accepting requests. Requests being processed are not affected
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// True if requests are accepted
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Stops accepting requests and closes all connections. Connections still in use are
    /// forcibly closed
    pub fn shutdown(&mut self) {
        self.shutdown_requested = true;
        let open = self.active_connections();
        if open > 0 {
            log::error!("Shutdown with {open} connections in use, closing them");
            for slot in self.connections.iter_mut().filter(|c| c.acquired) {
                slot.connection.close(&mut self.executor);
            }
            self.run_until_idle();
        }
        log::debug!("Diagnostic dispatcher shut down");
    }

    /// Accepts a request of `source` to `target`. The request is routed right away, all
    /// further work runs in [DiagDispatcher::run_until_idle]
    pub fn receive_request(&mut self, source: u16, target: u16, payload: &[u8]) -> DiagServerResult<ConnectionHandle> {
        if !self.enabled || self.shutdown_requested {
            log::warn!("Request from 0x{source:04X} discarded, dispatcher disabled");
            return Err(DiagError::NotEnabled);
        }
        let Some(&service_id) = payload.first() else {
            return Err(DiagError::EmptyRequest);
        };
        let functional = self.config.broadcast_address == Some(target);
        if target != self.config.diag_address && !functional {
            log::error!("Request for invalid target 0x{target:04X} discarded");
            return Err(DiagError::InvalidTarget(target));
        }
        if !self.config.accept_all_requests && !self.config.is_tester(source) {
            log::warn!("Request from invalid source 0x{source:04X} discarded");
            return Err(DiagError::InvalidSource(source));
        }
        let max = usize::from(self.config.max_response_payload_size);
        if payload.len() > max {
            return Err(DiagError::RequestTooLong { len: payload.len(), max });
        }

        let Some(index) = self.connections.iter().position(|c| !c.acquired) else {
            log::warn!("No incoming connection available, request of service 0x{service_id:02X} discarded --> BUSY");
            self.send_busy_response(source, target, functional, service_id)?;
            return Err(DiagError::NoConnectionAvailable);
        };
        let slot = &mut self.connections[index];
        slot.acquired = true;
        slot.generation = slot.generation.wrapping_add(1);
        let handle = ConnectionHandle::new(index, slot.generation);
        log::debug!("Opening incoming connection 0x{source:04X} --> 0x{target:04X}, service 0x{service_id:02X}");
        slot.connection.open(
            handle,
            source,
            target,
            functional,
            payload,
            self.config.activate_outgoing_pending,
            &mut self.executor,
        );

        let root = self.jobs.root();
        let mut cx = JobContext::new(
            &mut self.jobs,
            &mut self.connections[index].connection,
            self.sessions.as_mut(),
            &mut self.executor,
            self.async_helper.as_mut(),
            root,
        );
        let result = cx
            .with_request(RequestLocation::in_connection(0, payload.len()), |cx, request| {
                cx.execute(root, request)
            })
            .unwrap_or(DiagReturnCode::GeneralReject);
        if result != DiagReturnCode::Ok {
            if let Err(e) = cx.send_negative_response(result) {
                log::error!("Failed to reject request of service 0x{service_id:02X}: {e}");
            }
            cx.terminate();
        }
        Ok(handle)
    }

    fn send_busy_response(&mut self, source: u16, target: u16, functional: bool, service_id: u8) -> DiagServerResult<()> {
        let payload = [
            NEGATIVE_RESPONSE_IDENTIFIER,
            service_id,
            DiagReturnCode::BusyRepeatRequest.as_byte(),
        ];
        let frame = OutgoingFrame {
            connection: None,
            kind: FrameKind::Response,
            source: if functional { self.config.diag_address } else { target },
            target: source,
            payload: &payload,
        };
        self.transport.send(&frame).map_err(|e| {
            log::error!("Failed to send busy response: {e}");
            DiagError::SendFailed
        })
    }

    /// Runs `f` on behalf of `job` for the request of `handle`. Jobs which leave a request
    /// unanswered in [DiagJob::process] complete it from here later on.
    ///
    /// Returns `None` if the connection was terminated in the meantime
    pub fn resume<R>(
        &mut self,
        handle: ConnectionHandle,
        job: JobId,
        f: impl FnOnce(&mut JobContext<'_>) -> R,
    ) -> Option<R> {
        let index = self.resolve_open(handle)?;
        let mut cx = self.context(index, job);
        Some(f(&mut cx))
    }

    /// Reports that the transport finished a frame. Equivalent to posting the completion through
    /// a [ContextHandle]
    pub fn transport_message_processed(&mut self, connection: ConnectionHandle, kind: FrameKind, result: ProcessingResult) {
        self.executor.post(DiagEvent::TransportMessageProcessed {
            connection,
            kind,
            result,
        });
    }

    /// Processes posted events until the queue is empty. Returns the number of events processed
    pub fn run_until_idle(&mut self) -> usize {
        let mut count = 0;
        while let Some(event) = self.executor.next_event() {
            self.handle_event(event);
            count += 1;
        }
        count
    }

    /// Moves the clock forward by `ms`, firing every timer that becomes due in deadline order and
    /// processing the resulting work
    pub fn advance_time(&mut self, ms: u64) {
        let target = self.executor.now_ms() + ms;
        self.run_until_idle();
        while let Some(deadline) = self.executor.next_deadline().filter(|d| *d <= target) {
            self.executor.advance_to(deadline);
            self.run_until_idle();
        }
        self.executor.advance_to(target);
        self.run_until_idle();
    }

    fn resolve(&self, handle: ConnectionHandle) -> Option<usize> {
        self.connections
            .get(handle.index())
            .filter(|slot| slot.acquired && slot.generation == handle.generation())
            .map(|_| handle.index())
    }

    /// Like [DiagDispatcher::resolve], for connections which were not closed forcibly
    fn resolve_open(&self, handle: ConnectionHandle) -> Option<usize> {
        self.resolve(handle)
            .filter(|index| self.connections[*index].connection.is_open())
    }

    fn handle_event(&mut self, event: DiagEvent) {
        match event {
            DiagEvent::SendPositiveResponse {
                connection,
                length,
                sender,
            } => self.on_send_positive_response(connection, length, sender),
            DiagEvent::SendNegativeResponse {
                connection,
                code,
                sender,
            } => self.on_send_negative_response(connection, code, sender),
            DiagEvent::TransportMessageProcessed {
                connection,
                kind,
                result,
            } => self.on_transport_message_processed(connection, kind, result),
            DiagEvent::TriggerNextNestedRequest { connection } => self.on_trigger_next_nested_request(connection),
            DiagEvent::AsyncProcess {
                job,
                connection,
                request,
            } => self.on_async_process(job, connection, request),
            DiagEvent::TriggerNextRequests { job } => self.trigger_next_requests(job),
            DiagEvent::TimerExpired { connection, timer } => self.on_timer_expired(connection, timer),
            DiagEvent::ConnectionTerminated { connection } => self.on_connection_terminated(connection),
        }
    }

    fn on_send_positive_response(&mut self, handle: ConnectionHandle, length: usize, sender: JobId) {
        let Some(index) = self.resolve_open(handle) else {
            log::debug!("Dropping positive response of stale connection {handle:?}");
            return;
        };
        let notify = if self.connections[index].connection.is_nested_active() {
            self.with_nested_hooks(index, |connection, hooks, _, _| {
                connection.nested_send_positive_response(length, sender, hooks)
            })
        } else {
            self.connections[index].connection.async_send_positive_response(
                length,
                sender,
                self.transport.as_mut(),
                self.sessions.as_mut(),
            )
        };
        self.complete(index, notify, true);
    }

    fn on_send_negative_response(&mut self, handle: ConnectionHandle, code: DiagReturnCode, sender: JobId) {
        let Some(index) = self.resolve_open(handle) else {
            log::debug!("Dropping negative response of stale connection {handle:?}");
            return;
        };
        let notify = if self.connections[index].connection.is_nested_active() {
            self.with_nested_hooks(index, |connection, hooks, executor, transport| {
                connection.nested_send_negative_response(code, sender, hooks, executor, transport)
            })
            .flatten()
        } else {
            self.connections[index].connection.async_send_negative_response(
                code,
                sender,
                &mut self.executor,
                self.transport.as_mut(),
                self.sessions.as_mut(),
            )
        };
        self.complete(index, notify, true);
    }

    fn on_transport_message_processed(&mut self, handle: ConnectionHandle, kind: FrameKind, result: ProcessingResult) {
        let Some(index) = self.resolve_open(handle) else {
            log::debug!("Completion of stale connection {handle:?}");
            return;
        };
        let completion =
            self.connections[index]
                .connection
                .transport_message_processed(kind, result, self.transport.as_mut());
        self.complete(index, completion.notify, completion.settle);
    }

    /// Runs `f` with the hooks of the job owning the nested request of connection `index`
    fn with_nested_hooks<R>(
        &mut self,
        index: usize,
        f: impl FnOnce(
            &mut IncomingDiagConnection,
            &mut dyn crate::NestedRequestHooks,
            &mut ExecutionContext,
            &mut dyn TransportSender,
        ) -> R,
    ) -> Option<R> {
        let owner = self.connections[index].connection.nested_sender()?;
        let Some(mut job) = self.jobs.take_job(owner) else {
            log::error!("Owner of nested request {owner:?} is busy");
            return None;
        };
        let result = match job.nested_hooks() {
            Some(hooks) => Some(f(
                &mut self.connections[index].connection,
                hooks,
                &mut self.executor,
                self.transport.as_mut(),
            )),
            None => {
                log::error!("Owner of nested request {owner:?} has no nested hooks");
                None
            }
        };
        self.jobs.restore_job(owner, job);
        result
    }

    /// Notifies the sender of a response, then runs the connection's deferred work
    fn complete(&mut self, index: usize, notify: Option<Notification>, settle: bool) {
        if let Some(Notification { sender, result }) = notify {
            match self.jobs.take_job(sender) {
                Some(mut job) => {
                    let mut cx = self.context(index, sender);
                    job.response_sent(&mut cx, result);
                    self.jobs.restore_job(sender, job);
                }
                None => log::error!("Sender {sender:?} of a response is busy"),
            }
        }
        if settle {
            self.connections[index]
                .connection
                .settle(&mut self.executor, self.transport.as_mut());
        }
    }

    fn context(&mut self, index: usize, job: JobId) -> JobContext<'_> {
        JobContext::new(
            &mut self.jobs,
            &mut self.connections[index].connection,
            self.sessions.as_mut(),
            &mut self.executor,
            self.async_helper.as_mut(),
            job,
        )
    }

    fn on_trigger_next_nested_request(&mut self, handle: ConnectionHandle) {
        let Some(index) = self.resolve(handle) else {
            return;
        };
        let Some(owner) = self.connections[index].connection.nested_sender() else {
            return;
        };
        let Some(mut job) = self.jobs.take_job(owner) else {
            log::error!("Owner of nested request {owner:?} is busy");
            return;
        };
        let mut cx = JobContext::new(
            &mut self.jobs,
            &mut self.connections[index].connection,
            self.sessions.as_mut(),
            &mut self.executor,
            self.async_helper.as_mut(),
            owner,
        );
        match job.nested_hooks() {
            Some(hooks) => cx.trigger_next_nested_request(hooks),
            None => {
                log::error!("Owner of nested request {owner:?} has no nested hooks");
                cx.connection.end_nested_request(cx.executor);
            }
        }
        self.jobs.restore_job(owner, job);
    }

    fn on_async_process(&mut self, id: JobId, handle: ConnectionHandle, request: RequestLocation) {
        let Some(mut job) = self.jobs.take_job(id) else {
            log::error!("Async job {id:?} is busy");
            return;
        };
        match self.resolve_open(handle) {
            Some(index) => {
                let mut cx = self.context(index, id);
                let processed = cx.with_request(request, |cx, request| job.process_deferred(cx, request));
                if processed.is_none() {
                    log::error!("Request {request:?} of async job {id:?} is out of bounds");
                    if let Err(e) = cx.send_negative_response(DiagReturnCode::GeneralReject) {
                        log::error!("Failed to reject request: {e}");
                    }
                    cx.terminate();
                }
            }
            None => {
                log::warn!("Connection {handle:?} of async job {id:?} is gone");
                if let Some(helper) = job.async_helper_mut() {
                    helper.finish(&mut self.executor, id);
                }
            }
        }
        self.jobs.restore_job(id, job);
    }

    /// Dispatches the queued requests of an async job until it is busy again
    fn trigger_next_requests(&mut self, id: JobId) {
        let Some(mut job) = self.jobs.take_job(id) else {
            log::error!("Async job {id:?} is busy");
            return;
        };
        while let Some(stored) = job.async_helper_mut().and_then(|h| h.next_request()) {
            let connection = self.async_helper.get(stored).map(|s| s.connection);
            match connection.and_then(|c| self.resolve_open(c)) {
                Some(index) => {
                    let mut cx = self.context(index, id);
                    process_and_release_request(&mut cx, job.as_mut(), stored);
                }
                None => {
                    log::warn!("Dropping queued request {stored:?} of closed connection");
                    self.async_helper.release_request(stored);
                }
            }
        }
        self.jobs.restore_job(id, job);
    }

    fn on_timer_expired(&mut self, handle: ConnectionHandle, timer: ConnectionTimer) {
        let Some(index) = self.resolve(handle) else {
            return;
        };
        self.connections[index]
            .connection
            .expired(timer, &mut self.executor, self.transport.as_mut());
    }

    fn on_connection_terminated(&mut self, handle: ConnectionHandle) {
        let Some(index) = self.resolve(handle) else {
            return;
        };
        self.connections[index].acquired = false;
        self.transport.request_processed(handle);
        log::debug!("Connection {handle:?} released");
        self.release_async_jobs(handle);
    }

    /// Frees async jobs still busy with a request of `handle`, which ended without a response
    fn release_async_jobs(&mut self, handle: ConnectionHandle) {
        for id in self.jobs.ids() {
            let Some(mut job) = self.jobs.take_job(id) else {
                continue;
            };
            if let Some(helper) = job.async_helper_mut().filter(|h| h.pending_connection() == Some(handle)) {
                log::warn!("Async job {id:?} lost its connection {handle:?}");
                helper.finish(&mut self.executor, id);
            }
            self.jobs.restore_job(id, job);
        }
    }
}
