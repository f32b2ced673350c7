use crate::{AsyncDiagJobHelper, DiagReturnCode, NestedRequestHooks};

use super::{DiagJob, DiagJobNode, JobContext, ResponseSendResult};

/// Runs a job's processing on the execution context instead of inline, one request at a time.
///
/// While a request is processed, further requests for the job are parked and dispatched in
/// arrival order once the response of the current one was sent.
#[derive(Debug)]
pub struct AsyncDiagJob<J> {
    job: J,
    helper: AsyncDiagJobHelper,
}

impl<J: DiagJob> AsyncDiagJob<J> {
    /// Wraps `job`
    pub fn new(job: J) -> Self {
        Self {
            job,
            helper: AsyncDiagJobHelper::new(),
        }
    }

    /// The wrapped job
    pub fn inner(&self) -> &J {
        &self.job
    }

    /// The wrapped job
    pub fn inner_mut(&mut self) -> &mut J {
        &mut self.job
    }
}

impl<J: DiagJob> DiagJob for AsyncDiagJob<J> {
    fn verify(&self, node: &DiagJobNode, request: &[u8]) -> DiagReturnCode {
        self.job.verify(node, request)
    }

    fn process(&mut self, cx: &mut JobContext<'_>, request: &mut [u8]) -> DiagReturnCode {
        if self.helper.has_pending_async_request() {
            return self.helper.enqueue_request(cx, request);
        }
        self.helper.start_async_request(cx.connection_handle());
        cx.schedule_async_process(request);
        DiagReturnCode::Ok
    }

    fn process_deferred(&mut self, cx: &mut JobContext<'_>, request: &mut [u8]) {
        let result = self.job.process(cx, request);
        if result != DiagReturnCode::Ok {
            if let Err(e) = cx.send_negative_response(result) {
                log::error!("Failed to send negative response 0x{:02X}: {e}", result.as_byte());
            }
            cx.terminate();
        }
    }

    fn response_sent(&mut self, cx: &mut JobContext<'_>, result: ResponseSendResult) {
        self.job.response_sent(cx, result);
        self.helper.end_async_request(cx);
    }

    fn async_helper_mut(&mut self) -> Option<&mut AsyncDiagJobHelper> {
        Some(&mut self.helper)
    }

    fn nested_hooks(&mut self) -> Option<&mut dyn NestedRequestHooks> {
        self.job.nested_hooks()
    }
}
