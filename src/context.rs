//! Execution context of the dispatch engine
//!
//! An [ExecutionContext] is a single consumer event queue. Scheduling work on the
//! context means posting a [DiagEvent] to its channel; the dispatcher drains the
//! queue and runs each event to completion, one at a time and in submission order.
//!
//! The context also keeps a millisecond clock with one-shot timers. The clock only
//! moves when the owner advances it, which keeps timeouts deterministic.

use std::sync::mpsc;

use crate::{
    DiagReturnCode,
    connection::{ConnectionHandle, ConnectionTimer},
    job::{JobId, RequestLocation},
    transport::{FrameKind, ProcessingResult},
};

/// Work items posted to the execution context
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DiagEvent {
    /// Assemble and send a positive response of `length` payload bytes
    SendPositiveResponse {
        connection: ConnectionHandle,
        length: usize,
        sender: JobId,
    },
    /// Assemble and send a negative response
    SendNegativeResponse {
        connection: ConnectionHandle,
        code: DiagReturnCode,
        sender: JobId,
    },
    /// The transport finished (or failed) sending a frame
    TransportMessageProcessed {
        connection: ConnectionHandle,
        kind: FrameKind,
        result: ProcessingResult,
    },
    /// Continue with the next sub-request of an active nested request
    TriggerNextNestedRequest { connection: ConnectionHandle },
    /// Run the body of an async job
    AsyncProcess {
        job: JobId,
        connection: ConnectionHandle,
        request: RequestLocation,
    },
    /// Dispatch queued requests of an async job
    TriggerNextRequests { job: JobId },
    /// A connection timer expired
    TimerExpired {
        connection: ConnectionHandle,
        timer: ConnectionTimer,
    },
    /// A connection closed and can be recycled
    ConnectionTerminated { connection: ConnectionHandle },
}

/// Identifier of a scheduled timer
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Debug)]
struct Timer {
    id: TimerId,
    deadline_ms: u64,
    event: DiagEvent,
}

/// Cloneable handle for posting transport completions from any thread
#[derive(Debug, Clone)]
pub struct ContextHandle {
    tx: mpsc::Sender<DiagEvent>,
}

impl ContextHandle {
    /// Reports that a frame handed to [crate::transport::TransportSender::send] was processed
    pub fn transport_message_processed(
        &self,
        connection: ConnectionHandle,
        kind: FrameKind,
        result: ProcessingResult,
    ) {
        if self
            .tx
            .send(DiagEvent::TransportMessageProcessed {
                connection,
                kind,
                result,
            })
            .is_err()
        {
            log::warn!("Execution context is gone, dropping completion for {connection:?}");
        }
    }
}

/// Event queue and timer wheel of one dispatcher
#[derive(Debug)]
pub struct ExecutionContext {
    tx: mpsc::Sender<DiagEvent>,
    rx: mpsc::Receiver<DiagEvent>,
    now_ms: u64,
    timers: Vec<Timer>,
    next_timer: u64,
}

impl ExecutionContext {
    /// Creates an empty context with its clock at 0
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx,
            now_ms: 0,
            timers: Vec::new(),
            next_timer: 0,
        }
    }

    /// Handle to post events from outside the dispatcher
    pub fn handle(&self) -> ContextHandle {
        ContextHandle { tx: self.tx.clone() }
    }

    /// Current time of the context clock
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Number of armed timers
    pub fn armed_timers(&self) -> usize {
        self.timers.len()
    }

    pub(crate) fn post(&mut self, event: DiagEvent) {
        // The receiver lives in self, sending cannot fail
        let _ = self.tx.send(event);
    }

    pub(crate) fn next_event(&mut self) -> Option<DiagEvent> {
        self.rx.try_recv().ok()
    }

    pub(crate) fn schedule(&mut self, delay_ms: u32, event: DiagEvent) -> TimerId {
        let id = TimerId(self.next_timer);
        self.next_timer += 1;
        self.timers.push(Timer {
            id,
            deadline_ms: self.now_ms + u64::from(delay_ms),
            event,
        });
        id
    }

    pub(crate) fn cancel(&mut self, id: TimerId) {
        self.timers.retain(|t| t.id != id);
    }

    /// Earliest deadline of all armed timers
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.iter().map(|t| t.deadline_ms).min()
    }

    /// Moves the clock to `now_ms` and posts the events of every timer that is due,
    /// earliest deadline first
    pub(crate) fn advance_to(&mut self, now_ms: u64) {
        self.now_ms = self.now_ms.max(now_ms);
        let mut due: Vec<Timer> = Vec::new();
        let mut i = 0;
        while i < self.timers.len() {
            if self.timers[i].deadline_ms <= self.now_ms {
                due.push(self.timers.swap_remove(i));
            } else {
                i += 1;
            }
        }
        due.sort_by_key(|t| (t.deadline_ms, t.id.0));
        for t in due {
            self.post(t.event);
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}
