//! ReadDataByIdentifier (0x22) with any number of DIDs
//!
//! A request with a single DID is routed to the DID jobs directly. Requests with several DIDs
//! are answered as a nested request: each DID is executed as a sub-request `[0x22, DID]`, and
//! the positive sub-responses are concatenated. DIDs nobody answers are skipped; the request
//! only fails if none of the DIDs could be read, or a DID job reports an error.

use automotive_diag::uds::UdsCommand;

use crate::{
    AsyncDiagJobHelper, DiagJob, DiagJobNode, DiagReturnCode, JobContext, JobId, NestedDiagRequest,
    NestedRequestHooks, ResponseSendResult, StoredNestedRequest, connection::IncomingDiagConnection,
};

/// Returns the maximum number of DIDs of a request, 0 if unlimited
pub type GetDidLimit = fn(&IncomingDiagConnection) -> u8;

/// Checks the result of a single DID and combines it into the overall result. Returns true
/// if the remaining DIDs should be processed
pub type CheckResponse = fn(DiagReturnCode, &mut DiagReturnCode) -> bool;

const SERVICE_ID: u8 = UdsCommand::ReadDataByIdentifier as u8;

/// Default result policy: DIDs which are not supported are skipped, any other negative
/// response ends the request with that code
pub fn default_check_response(code: DiagReturnCode, combined: &mut DiagReturnCode) -> bool {
    match code {
        DiagReturnCode::NotResponsible | DiagReturnCode::RequestOutOfRange => true,
        _ => {
            *combined = code;
            code == DiagReturnCode::Ok
        }
    }
}

/// ReadDataByIdentifier service job. Should be added directly below the root
#[derive(Debug)]
pub struct MultipleReadDataByIdentifier {
    helper: AsyncDiagJobHelper,
    first_job: Option<JobId>,
    did_limit: Option<GetDidLimit>,
    check_response: CheckResponse,
    buffer: [u8; 3],
    combined_response_code: DiagReturnCode,
}

impl MultipleReadDataByIdentifier {
    /// Creates the service. DIDs of nested requests are offered to the service's own children
    pub fn new() -> Self {
        Self {
            helper: AsyncDiagJobHelper::new(),
            first_job: None,
            did_limit: None,
            check_response: default_check_response,
            buffer: [SERVICE_ID, 0, 0],
            combined_response_code: DiagReturnCode::RequestOutOfRange,
        }
    }

    /// Creates the service. DIDs of nested requests are offered to `first_job` and its siblings
    pub fn with_first_job(first_job: JobId) -> Self {
        Self {
            first_job: Some(first_job),
            ..Self::new()
        }
    }

    /// Node to register the service with
    pub fn node() -> DiagJobNode {
        DiagJobNode::new(&[SERVICE_ID], 0).with_default_code(DiagReturnCode::RequestOutOfRange)
    }

    /// Limits the number of DIDs per request
    pub fn set_did_limit(&mut self, did_limit: GetDidLimit) {
        self.did_limit = Some(did_limit);
    }

    /// Replaces the result policy. `None` restores [default_check_response]
    pub fn set_check_response(&mut self, check_response: Option<CheckResponse>) {
        self.check_response = check_response.unwrap_or(default_check_response);
    }
}

impl Default for MultipleReadDataByIdentifier {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagJob for MultipleReadDataByIdentifier {
    fn verify(&self, _node: &DiagJobNode, request: &[u8]) -> DiagReturnCode {
        if request.first() != Some(&SERVICE_ID) {
            return DiagReturnCode::NotResponsible;
        }
        if request.len() >= 3 && (request.len() - 1) % 2 == 0 {
            DiagReturnCode::Ok
        } else {
            DiagReturnCode::InvalidFormat
        }
    }

    fn process(&mut self, cx: &mut JobContext<'_>, request: &mut [u8]) -> DiagReturnCode {
        if request.len() == 2 {
            return cx.process_children(request);
        }
        if let Some(did_limit) = self.did_limit {
            let limit = did_limit(cx.connection());
            if limit > 0 && request.len() / 2 > usize::from(limit) {
                return DiagReturnCode::InvalidFormat;
            }
        }
        if self.helper.has_pending_async_request() {
            return self.helper.enqueue_request(cx, request);
        }
        self.combined_response_code = DiagReturnCode::RequestOutOfRange;
        self.helper.start_async_request(cx.connection_handle());
        cx.start_nested_request(self, request)
    }

    fn response_sent(&mut self, cx: &mut JobContext<'_>, _result: ResponseSendResult) {
        cx.terminate();
        self.helper.end_async_request(cx);
    }

    fn async_helper_mut(&mut self) -> Option<&mut AsyncDiagJobHelper> {
        Some(&mut self.helper)
    }

    fn nested_hooks(&mut self) -> Option<&mut dyn NestedRequestHooks> {
        Some(self)
    }
}

impl NestedRequestHooks for MultipleReadDataByIdentifier {
    fn prefix_length(&self) -> usize {
        1
    }

    fn prepare_nested_request(&mut self, stored: &mut StoredNestedRequest<'_>) -> &[u8] {
        if stored.remaining().len() >= 2 {
            let did = stored.consume(2);
            self.buffer[1..].copy_from_slice(did);
            &self.buffer
        } else {
            stored.set_response_code(self.combined_response_code);
            &[]
        }
    }

    fn process_nested_request(&mut self, cx: &mut JobContext<'_>, request: &mut [u8]) -> DiagReturnCode {
        let own = cx.job_id();
        let mut result = DiagReturnCode::NotResponsible;
        let mut current = Some(self.first_job.unwrap_or(own));
        while result == DiagReturnCode::NotResponsible {
            let Some(id) = current else { break };
            result = if id == own {
                cx.execute_with(own, self, request)
            } else {
                cx.execute(id, request)
            };
            current = cx.jobs().next_sibling(id);
        }
        result
    }

    fn handle_nested_response_code(&mut self, nested: &mut NestedDiagRequest, code: DiagReturnCode) {
        if !(self.check_response)(code, &mut self.combined_response_code) {
            nested.set_response_code(self.combined_response_code);
        }
    }
}
