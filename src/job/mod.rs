//! Diagnostic job tree
//!
//! Jobs are organised as a forest stored in an arena ([JobTree]). Every node carries
//! the request bytes it implements and links to its first child and next sibling.
//! A request is routed from the root downwards: each node verifies the request, consumes
//! its own identifier bytes and either answers or forwards the remainder to its children.

use crate::{DiagReturnCode, session::SessionMask};

mod async_job;
mod context;

pub use async_job::*;
pub use context::*;

/// Index of a job inside a [JobTree]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub(crate) usize);

impl JobId {
    /// Raw arena index
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Result of transmitting a response, passed to [DiagJob::response_sent]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ResponseSendResult {
    /// The response was handed off by the transport
    Sent,
    /// The response could not be sent
    SendFailed,
}

/// Result of adding a job to the tree
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AddJobResult {
    /// Job was linked into the tree
    Added,
    /// Job was not linked (already present, equal to an existing job, or no parent found)
    NotAdded,
}

/// Buffer a request slice lives in
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RequestOrigin {
    /// The request message of the connection
    Connection,
    /// The current sub-request of an active nested request
    Nested,
}

/// Position of a request slice, used to refer to requests across scheduled work
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RequestLocation {
    /// Buffer the request lives in
    pub origin: RequestOrigin,
    /// Offset of the first request byte
    pub offset: usize,
    /// Number of request bytes
    pub length: usize,
}

impl RequestLocation {
    /// Location inside the connection's request message
    pub const fn in_connection(offset: usize, length: usize) -> Self {
        Self {
            origin: RequestOrigin::Connection,
            offset,
            length,
        }
    }
}

/// Static description of a job: the request it implements and its constraints
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiagJobNode {
    implemented_request: Vec<u8>,
    request_length: u8,
    prefix_length: u8,
    payload_length: Option<u8>,
    response_length: Option<u8>,
    allowed_sessions: SessionMask,
    default_negative_code: DiagReturnCode,
    suppress_positive_response: bool,
}

impl DiagJobNode {
    /// Creates a node implementing `implemented_request`, of which the first `prefix_length`
    /// bytes are matched by the parent.
    ///
    /// ## Panics
    /// If the request is longer than 255 bytes, shorter than the prefix, or (unless empty) not
    /// longer than the prefix
    pub fn new(implemented_request: &[u8], prefix_length: u8) -> Self {
        assert!(
            implemented_request.len() <= usize::from(u8::MAX),
            "implemented request longer than 255 bytes"
        );
        assert!(
            usize::from(prefix_length) <= implemented_request.len(),
            "prefix length {prefix_length} exceeds implemented request of {} bytes",
            implemented_request.len()
        );
        let request_length = implemented_request.len() as u8;
        assert!(
            request_length == 0 || request_length > prefix_length,
            "request length {request_length} must exceed prefix length {prefix_length}"
        );
        Self {
            implemented_request: implemented_request.to_vec(),
            request_length,
            prefix_length,
            payload_length: None,
            response_length: None,
            allowed_sessions: SessionMask::ALL,
            default_negative_code: DiagReturnCode::GeneralReject,
            suppress_positive_response: false,
        }
    }

    /// Node of a tree root. Implements no request and answers unknown services with
    /// [DiagReturnCode::ServiceNotSupported]
    pub fn root() -> Self {
        Self::new(&[], 0).with_default_code(DiagReturnCode::ServiceNotSupported)
    }

    /// Requires exactly `length` payload bytes after the job's identifiers
    pub fn with_payload_length(mut self, length: u8) -> Self {
        self.payload_length = Some(length);
        self
    }

    /// Declares a fixed positive response length
    pub fn with_response_length(mut self, length: u8) -> Self {
        self.response_length = Some(length);
        self
    }

    /// Restricts the sessions the job is allowed in
    pub fn with_sessions(mut self, sessions: SessionMask) -> Self {
        self.allowed_sessions = sessions;
        self
    }

    /// Code returned when no child is responsible for a request
    pub fn with_default_code(mut self, code: DiagReturnCode) -> Self {
        self.default_negative_code = code;
        self
    }

    /// Honour the suppress positive response bit in the first byte after the identifiers
    pub fn with_suppress_positive_response(mut self, enabled: bool) -> Self {
        self.suppress_positive_response = enabled;
        self
    }

    /// Full request prefix this job implements
    pub fn implemented_request(&self) -> &[u8] {
        &self.implemented_request
    }

    /// Length of the implemented request
    pub fn request_length(&self) -> u8 {
        self.request_length
    }

    /// Number of leading bytes already matched by the parent
    pub fn prefix_length(&self) -> u8 {
        self.prefix_length
    }

    /// Required payload length, `None` if variable
    pub fn payload_length(&self) -> Option<u8> {
        self.payload_length
    }

    /// Fixed response length, `None` if variable
    pub fn response_length(&self) -> Option<u8> {
        self.response_length
    }

    /// Sessions the job may run in
    pub fn allowed_sessions(&self) -> SessionMask {
        self.allowed_sessions
    }

    /// Code returned when no child is responsible
    pub fn default_negative_code(&self) -> DiagReturnCode {
        self.default_negative_code
    }

    /// True if the suppress positive response bit is evaluated
    pub fn is_suppress_positive_response_enabled(&self) -> bool {
        self.suppress_positive_response
    }

    /// Number of identifier bytes the job consumes from a request
    pub fn consumed_length(&self) -> usize {
        usize::from(self.request_length.saturating_sub(self.prefix_length))
    }

    /// The first (up to) four bytes of the implemented request as a number. Used for logging
    pub fn request_id(&self) -> u32 {
        self.implemented_request
            .iter()
            .take(4)
            .fold(0u32, |id, b| (id << 8) | u32::from(*b))
    }

    /// True if a job implementing `prefix` is this job's direct parent
    pub fn is_child(&self, prefix: &[u8]) -> bool {
        prefix.len() == usize::from(self.prefix_length) && self.implemented_request.starts_with(prefix)
    }

    /// True if a job implementing `prefix` is an ancestor of this job
    pub fn is_family(&self, prefix: &[u8]) -> bool {
        prefix.len() <= usize::from(self.prefix_length) && self.implemented_request.starts_with(prefix)
    }

    /// Default verification: the request must start with the bytes this job implements
    /// after its prefix
    pub fn verify_request(&self, request: &[u8]) -> DiagReturnCode {
        if request.starts_with(&self.implemented_request[usize::from(self.prefix_length)..]) {
            DiagReturnCode::Ok
        } else {
            DiagReturnCode::NotResponsible
        }
    }

    /// Jobs implementing the same request. Nodes without an implemented request never match
    fn implements_same_request(&self, other: &DiagJobNode) -> bool {
        !self.implemented_request.is_empty()
            && self.request_length == other.request_length
            && self.prefix_length == other.prefix_length
            && self.implemented_request == other.implemented_request
    }
}

/// A diagnostic job
///
/// Leaf jobs implement [DiagJob::process]. Inner nodes usually keep the default, which routes the
/// request to their children.
pub trait DiagJob: Send {
    /// Checks whether the job is responsible for `request` (the bytes after the job's prefix).
    ///
    /// Returns [DiagReturnCode::Ok] to accept, [DiagReturnCode::NotResponsible] to let the
    /// next sibling try, or a negative response code
    fn verify(&self, node: &DiagJobNode, request: &[u8]) -> DiagReturnCode {
        node.verify_request(request)
    }

    /// Processes the request (the bytes after the job's identifiers).
    ///
    /// Returning [DiagReturnCode::Ok] means the job will send a response through the context,
    /// now or later. Any negative code is sent by the caller
    fn process(&mut self, cx: &mut JobContext<'_>, request: &mut [u8]) -> DiagReturnCode {
        cx.process_children(request)
    }

    /// Called once the response sent by this job left the transport
    fn response_sent(&mut self, cx: &mut JobContext<'_>, _result: ResponseSendResult) {
        cx.terminate();
    }

    /// Deferred body of an asynchronous job, run on the execution context
    fn process_deferred(&mut self, _cx: &mut JobContext<'_>, _request: &mut [u8]) {}

    /// Queue state of jobs processing requests asynchronously
    fn async_helper_mut(&mut self) -> Option<&mut crate::AsyncDiagJobHelper> {
        None
    }

    /// Hooks of jobs driving nested requests
    fn nested_hooks(&mut self) -> Option<&mut dyn crate::NestedRequestHooks> {
        None
    }
}

/// Root job of a tree. Accepts every request and routes it to the service jobs
#[derive(Debug, Default, Clone, Copy)]
pub struct DiagJobRoot;

impl DiagJob for DiagJobRoot {
    fn verify(&self, _node: &DiagJobNode, _request: &[u8]) -> DiagReturnCode {
        DiagReturnCode::Ok
    }
}

struct JobSlot {
    node: DiagJobNode,
    job: Option<Box<dyn DiagJob>>,
    first_child: Option<JobId>,
    next_sibling: Option<JobId>,
}

impl std::fmt::Debug for JobSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSlot")
            .field("node", &self.node)
            .field("executing", &self.job.is_none())
            .field("first_child", &self.first_child)
            .field("next_sibling", &self.next_sibling)
            .finish()
    }
}

/// Arena holding all jobs and their tree links
#[derive(Debug)]
pub struct JobTree {
    slots: Vec<JobSlot>,
}

impl JobTree {
    const ROOT: JobId = JobId(0);

    /// Creates a tree with a [DiagJobRoot]
    pub fn new() -> Self {
        Self::with_root(DiagJobNode::root(), DiagJobRoot)
    }

    /// Creates a tree with a custom root job
    pub fn with_root(node: DiagJobNode, job: impl DiagJob + 'static) -> Self {
        Self {
            slots: vec![JobSlot {
                node,
                job: Some(Box::new(job)),
                first_child: None,
                next_sibling: None,
            }],
        }
    }

    /// The root job
    pub fn root(&self) -> JobId {
        Self::ROOT
    }

    /// Number of jobs in the arena, linked or not
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if the arena only holds the root
    pub fn is_empty(&self) -> bool {
        self.slots.len() == 1
    }

    /// Stores a job in the arena without linking it. Use [JobTree::add_job] to link it
    pub fn insert(&mut self, node: DiagJobNode, job: impl DiagJob + 'static) -> JobId {
        let id = JobId(self.slots.len());
        self.slots.push(JobSlot {
            node,
            job: Some(Box::new(job)),
            first_child: None,
            next_sibling: None,
        });
        id
    }

    /// Links `job` below the deepest job of the tree whose request it extends
    pub fn add_job(&mut self, job: JobId) -> AddJobResult {
        self.add_child(Self::ROOT, job)
    }

    /// Links `job` into the subtree of `parent`. Adding a job twice, or a job equal to an
    /// existing one, is a no-op returning [AddJobResult::NotAdded]
    pub fn add_child(&mut self, parent: JobId, job: JobId) -> AddJobResult {
        if job == parent {
            return AddJobResult::NotAdded;
        }
        if self.slot(job).node.implements_same_request(&self.slot(parent).node) || self.slot(parent).first_child == Some(job) {
            log::debug!("Tried to add identical jobs 0x{:X}", self.slot(job).node.request_id());
            return AddJobResult::NotAdded;
        }
        let parent_node = &self.slot(parent).node;
        let prefix = &parent_node.implemented_request[..usize::from(parent_node.request_length)];
        if self.slot(job).node.is_child(prefix) {
            match self.slot(parent).first_child {
                None => self.slot_mut(parent).first_child = Some(job),
                Some(first) => {
                    let mut current = first;
                    loop {
                        if current == job || self.slot(current).node.implements_same_request(&self.slot(job).node) {
                            log::debug!("Tried to add identical jobs 0x{:X}", self.slot(job).node.request_id());
                            return AddJobResult::NotAdded;
                        }
                        match self.slot(current).next_sibling {
                            Some(next) => current = next,
                            None => break,
                        }
                    }
                    self.slot_mut(current).next_sibling = Some(job);
                }
            }
            self.slot_mut(job).next_sibling = None;
            return AddJobResult::Added;
        }
        if self.slot(job).node.is_family(prefix) {
            let mut child = self.slot(parent).first_child;
            while let Some(current) = child {
                if self.add_child(current, job) == AddJobResult::Added {
                    return AddJobResult::Added;
                }
                child = self.slot(current).next_sibling;
            }
        }
        AddJobResult::NotAdded
    }

    /// Unlinks `job` from the tree. Its own children stay linked to it
    pub fn remove_job(&mut self, job: JobId) {
        self.remove_child(Self::ROOT, job);
        self.slot_mut(job).next_sibling = None;
    }

    /// Unlinks `job` from the subtree starting at `current` (including its siblings)
    pub fn remove_child(&mut self, current: JobId, job: JobId) {
        if job == current {
            return;
        }
        if self.slot(current).first_child == Some(job) {
            self.slot_mut(current).first_child = self.slot(job).next_sibling;
            return;
        } else if let Some(first) = self.slot(current).first_child {
            self.remove_child(first, job);
        }
        if self.slot(current).next_sibling == Some(job) {
            self.slot_mut(current).next_sibling = self.slot(job).next_sibling;
        } else if let Some(next) = self.slot(current).next_sibling {
            self.remove_child(next, job);
        }
    }

    /// Node of a job
    pub fn node(&self, id: JobId) -> &DiagJobNode {
        &self.slot(id).node
    }

    /// First child of a job
    pub fn first_child(&self, id: JobId) -> Option<JobId> {
        self.slot(id).first_child
    }

    /// Next sibling of a job
    pub fn next_sibling(&self, id: JobId) -> Option<JobId> {
        self.slot(id).next_sibling
    }

    /// Direct children of a job in registration order
    pub fn children(&self, id: JobId) -> impl Iterator<Item = JobId> + '_ {
        std::iter::successors(self.first_child(id), move |c| self.next_sibling(*c))
    }

    /// Ids of all jobs in the arena, linked or not
    pub fn ids(&self) -> impl Iterator<Item = JobId> + use<> {
        (0..self.slots.len()).map(JobId)
    }

    pub(crate) fn take_job(&mut self, id: JobId) -> Option<Box<dyn DiagJob>> {
        self.slots.get_mut(id.0).and_then(|s| s.job.take())
    }

    pub(crate) fn restore_job(&mut self, id: JobId, job: Box<dyn DiagJob>) {
        self.slot_mut(id).job = Some(job);
    }

    fn slot(&self, id: JobId) -> &JobSlot {
        &self.slots[id.0]
    }

    fn slot_mut(&mut self, id: JobId) -> &mut JobSlot {
        &mut self.slots[id.0]
    }
}

impl Default for JobTree {
    fn default() -> Self {
        Self::new()
    }
}
