//! Deferred processing of requests
//!
//! Jobs which take a while to answer handle one request at a time. Requests arriving while
//! such a job is busy are parked in a shared pool ([AsyncRequestPool], by default an
//! [AsyncDiagHelper]) and queued per job ([AsyncDiagJobHelper]). Once the job's response went out, the queued requests are dispatched
//! in arrival order.

use std::collections::VecDeque;

use crate::{
    DiagReturnCode,
    connection::ConnectionHandle,
    context::{DiagEvent, ExecutionContext},
    job::{DiagJob, JobContext, JobId, RequestLocation},
};

/// Slot of a parked request in an [AsyncRequestPool]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct StoredRequestId(usize);

impl StoredRequestId {
    /// Id of slot `index` of a pool
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Slot index
    pub fn index(&self) -> usize {
        self.0
    }
}

/// A parked request
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StoredRequest {
    /// Connection the request arrived on
    pub connection: ConnectionHandle,
    /// Where the request bytes are kept
    pub request: RequestLocation,
}

/// Storage for requests parked while their job is busy, shared by all jobs of a dispatcher
pub trait AsyncRequestPool: Send {
    /// Total number of slots
    fn capacity(&self) -> usize;

    /// Number of free slots
    fn available(&self) -> usize;

    /// Parks a request. Returns `None` if the pool is exhausted
    fn allocate_request(&mut self, connection: ConnectionHandle, request: RequestLocation) -> Option<StoredRequestId>;

    /// Parked request of a slot
    fn get(&self, id: StoredRequestId) -> Option<&StoredRequest>;

    /// Returns a slot to the pool
    fn release_request(&mut self, id: StoredRequestId);
}

/// Fixed-size pool of parked requests
#[derive(Debug, Clone)]
pub struct AsyncDiagHelper {
    slots: Vec<Option<StoredRequest>>,
}

impl AsyncDiagHelper {
    /// Creates a pool holding up to `capacity` requests
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }
}

impl AsyncRequestPool for AsyncDiagHelper {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn available(&self) -> usize {
        self.slots.iter().filter(|s| s.is_none()).count()
    }

    fn allocate_request(&mut self, connection: ConnectionHandle, request: RequestLocation) -> Option<StoredRequestId> {
        let index = self.slots.iter().position(Option::is_none)?;
        self.slots[index] = Some(StoredRequest { connection, request });
        Some(StoredRequestId(index))
    }

    fn get(&self, id: StoredRequestId) -> Option<&StoredRequest> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    fn release_request(&mut self, id: StoredRequestId) {
        match self.slots.get_mut(id.0) {
            Some(slot @ Some(_)) => *slot = None,
            _ => log::error!("Releasing stored request {id:?} which is not allocated"),
        }
    }
}

/// Hands a parked request to `job` and returns its slot to the pool. A negative result is sent
/// as response and ends the request
pub(crate) fn process_and_release_request(cx: &mut JobContext<'_>, job: &mut dyn DiagJob, id: StoredRequestId) {
    let Some(stored) = cx.async_helper.get(id).copied() else {
        log::error!("Stored request {id:?} vanished");
        return;
    };
    let result = cx.with_request(stored.request, |cx, request| job.process(cx, request));
    cx.async_helper.release_request(id);
    let code = result.unwrap_or_else(|| {
        log::error!("Stored request {:?} is out of bounds", stored.request);
        DiagReturnCode::GeneralReject
    });
    if code != DiagReturnCode::Ok {
        if let Err(e) = cx.send_negative_response(code) {
            log::error!("Failed to reject stored request: {e}");
        }
        cx.terminate();
    }
}

/// Per-job queue of requests waiting for the job to become idle
#[derive(Debug, Clone, Default)]
pub struct AsyncDiagJobHelper {
    pending: Option<ConnectionHandle>,
    queue: VecDeque<StoredRequestId>,
}

impl AsyncDiagJobHelper {
    /// Creates an idle helper
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a request is being processed
    pub fn has_pending_async_request(&self) -> bool {
        self.pending.is_some()
    }

    /// Connection of the request being processed
    pub fn pending_connection(&self) -> Option<ConnectionHandle> {
        self.pending
    }

    /// Number of queued requests
    pub fn queued_requests(&self) -> usize {
        self.queue.len()
    }

    /// Marks the job busy with a request of `connection`
    pub fn start_async_request(&mut self, connection: ConnectionHandle) {
        self.pending = Some(connection);
    }

    /// Marks the job idle and schedules the next queued request
    pub fn end_async_request(&mut self, cx: &mut JobContext<'_>) {
        let job = cx.job_id();
        self.finish(cx.executor, job);
    }

    pub(crate) fn finish(&mut self, executor: &mut ExecutionContext, job: JobId) {
        self.pending = None;
        executor.post(DiagEvent::TriggerNextRequests { job });
    }

    /// Parks `request` until the job is idle. Answers [DiagReturnCode::BusyRepeatRequest] if the
    /// pool is exhausted
    pub fn enqueue_request(&mut self, cx: &mut JobContext<'_>, request: &[u8]) -> DiagReturnCode {
        let location = cx.locate(request);
        let connection = cx.connection_handle();
        match cx.async_helper.allocate_request(connection, location) {
            Some(id) => {
                self.queue.push_back(id);
                DiagReturnCode::Ok
            }
            None => {
                log::warn!("Request pool exhausted, rejecting request of {connection:?}");
                DiagReturnCode::BusyRepeatRequest
            }
        }
    }

    /// Next request to dispatch, if the job is idle
    pub(crate) fn next_request(&mut self) -> Option<StoredRequestId> {
        if self.pending.is_some() {
            return None;
        }
        self.queue.pop_front()
    }
}
