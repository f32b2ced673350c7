use automotive_diag::uds::UdsCommand;

use crate::{DiagJob, DiagJobNode, DiagReturnCode, JobContext};

/// Answers a ReadDataByIdentifier DID with fixed data
#[derive(Debug, Clone, Default)]
pub struct ReadIdentifierFromSlice {
    data: Vec<u8>,
}

impl ReadIdentifierFromSlice {
    /// Creates a job answering with `data`
    pub fn new(data: &[u8]) -> Self {
        Self { data: data.to_vec() }
    }

    /// Node to register the job for `did` with
    pub fn node(did: u16) -> DiagJobNode {
        let [hi, lo] = did.to_be_bytes();
        DiagJobNode::new(&[UdsCommand::ReadDataByIdentifier as u8, hi, lo], 1).with_payload_length(0)
    }

    /// Data the DID is answered with
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Replaces the data the DID is answered with
    pub fn set_data(&mut self, data: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(data);
    }
}

impl DiagJob for ReadIdentifierFromSlice {
    fn process(&mut self, cx: &mut JobContext<'_>, _request: &mut [u8]) -> DiagReturnCode {
        let response = cx.release_request_get_response();
        if response.append_data(&self.data) < self.data.len() {
            return DiagReturnCode::ResponseTooLong;
        }
        if let Err(e) = cx.send_positive_response() {
            log::error!("Failed to answer DID: {e}");
        }
        DiagReturnCode::Ok
    }
}
