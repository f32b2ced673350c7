use std::sync::{Arc, Mutex};

use automotive_diag::uds::UdsSessionTypeByte;
use ecu_uds_dispatch::{
    AsyncDiagHelper, AsyncDiagJob, AsyncRequestPool, ConnectionHandle, DefaultSessionManager, DiagDispatcher, DiagError,
    DiagJob, DiagJobNode, DiagReturnCode, DiagServerResult, DiagnosisConfiguration, ExecutionContext, JobContext, JobId,
    ResponseSendResult, SessionMask, StoredRequest, StoredRequestId,
    job::RequestLocation,
    services::{MultipleReadDataByIdentifier, ReadIdentifierFromSlice},
    transport::{FrameKind, ProcessingResult, SimulationTransport},
};

const ECU: u16 = 0x10;
const BROADCAST: u16 = 0xDF;

/// A simulated ECU: dispatcher plus the transport recording its frames
pub struct SimEcu {
    dispatcher: DiagDispatcher,
    transport: SimulationTransport,
}

impl SimEcu {
    /// ECU whose transport acknowledges every frame right away
    pub fn new(config: DiagnosisConfiguration) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let context = ExecutionContext::new();
        let transport = SimulationTransport::auto_acknowledge(context.handle());
        Self::with_transport(config, context, transport)
    }

    /// ECU whose frames stay in flight until [SimulationTransport::acknowledge_all]
    pub fn manual(config: DiagnosisConfiguration) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self::with_transport(config, ExecutionContext::new(), SimulationTransport::new())
    }

    fn with_transport(config: DiagnosisConfiguration, context: ExecutionContext, transport: SimulationTransport) -> Self {
        let dispatcher = DiagDispatcher::new(
            config,
            context,
            Box::new(DefaultSessionManager::new(UdsSessionTypeByte::from(0x01))),
            Box::new(transport.clone()),
        );
        Self { dispatcher, transport }
    }

    pub fn request(&mut self, source: u16, payload: &[u8]) -> ConnectionHandle {
        let handle = self.dispatcher.receive_request(source, ECU, payload).unwrap();
        self.dispatcher.run_until_idle();
        handle
    }

    pub fn acknowledge(&mut self) {
        let context = self.dispatcher.context_handle();
        self.transport.acknowledge_all(&context, ProcessingResult::NoError);
        self.dispatcher.run_until_idle();
    }
}

/// ECU with ReadDataByIdentifier and the DIDs 0xF18B and 0xF190
fn rdbi_ecu(config: DiagnosisConfiguration) -> SimEcu {
    let mut ecu = SimEcu::new(config);
    add_rdbi(&mut ecu.dispatcher);
    ecu
}

fn add_rdbi(dispatcher: &mut DiagDispatcher) {
    dispatcher
        .add_job(MultipleReadDataByIdentifier::node(), MultipleReadDataByIdentifier::new())
        .unwrap();
    dispatcher
        .add_job(ReadIdentifierFromSlice::node(0xF18B), ReadIdentifierFromSlice::new(&[0x10, 0x07, 0x01]))
        .unwrap();
    dispatcher
        .add_job(ReadIdentifierFromSlice::node(0xF190), ReadIdentifierFromSlice::new(b"VIN"))
        .unwrap();
}

/// Answers with the request bytes following the service ID
#[derive(Debug, Default)]
struct Echo;

impl DiagJob for Echo {
    fn process(&mut self, cx: &mut JobContext<'_>, request: &mut [u8]) -> DiagReturnCode {
        let response = cx.release_request_get_response();
        if response.append_data(request) < request.len() {
            return DiagReturnCode::ResponseTooLong;
        }
        match cx.send_positive_response() {
            Ok(()) => DiagReturnCode::Ok,
            Err(_) => DiagReturnCode::GeneralReject,
        }
    }
}

/// Leaves every request unanswered
#[derive(Debug, Default)]
struct Silent;

impl DiagJob for Silent {
    fn process(&mut self, _cx: &mut JobContext<'_>, _request: &mut [u8]) -> DiagReturnCode {
        DiagReturnCode::Ok
    }
}

/// Answers a DID with a fixed negative response code
#[derive(Debug)]
struct Refuse(DiagReturnCode);

impl DiagJob for Refuse {
    fn process(&mut self, _cx: &mut JobContext<'_>, _request: &mut [u8]) -> DiagReturnCode {
        self.0
    }
}

/// Sends response pending itself and keeps the request open afterwards
#[derive(Debug, Default)]
struct ExplicitPending;

impl DiagJob for ExplicitPending {
    fn process(&mut self, cx: &mut JobContext<'_>, _request: &mut [u8]) -> DiagReturnCode {
        match cx.send_negative_response(DiagReturnCode::ResponsePending) {
            Ok(()) => DiagReturnCode::Ok,
            Err(_) => DiagReturnCode::GeneralReject,
        }
    }

    fn response_sent(&mut self, _cx: &mut JobContext<'_>, result: ResponseSendResult) {
        assert_eq!(result, ResponseSendResult::Sent);
    }
}

/// Answers with 0xAA and records how its responses went out
#[derive(Debug, Default)]
struct Recorder {
    results: Arc<Mutex<Vec<ResponseSendResult>>>,
}

impl DiagJob for Recorder {
    fn process(&mut self, cx: &mut JobContext<'_>, _request: &mut [u8]) -> DiagReturnCode {
        cx.release_request_get_response().append_u8(0xAA);
        match cx.send_positive_response() {
            Ok(()) => DiagReturnCode::Ok,
            Err(_) => DiagReturnCode::GeneralReject,
        }
    }

    fn response_sent(&mut self, cx: &mut JobContext<'_>, result: ResponseSendResult) {
        self.results.lock().unwrap().push(result);
        cx.terminate();
    }
}

/// Tries to answer twice
#[derive(Debug, Default)]
struct DoubleSend {
    sends: Arc<Mutex<Vec<DiagServerResult<()>>>>,
}

impl DiagJob for DoubleSend {
    fn process(&mut self, cx: &mut JobContext<'_>, _request: &mut [u8]) -> DiagReturnCode {
        cx.release_request_get_response().append_u8(0xAA);
        let first = cx.send_positive_response();
        let second = cx.send_positive_response();
        let third = cx.send_negative_response(DiagReturnCode::GeneralReject);
        self.sends.lock().unwrap().extend([first, second, third]);
        DiagReturnCode::Ok
    }
}

/// DID job which answers later, after announcing it with response pending
#[derive(Debug, Default)]
struct DeferredDid {
    results: Arc<Mutex<Vec<ResponseSendResult>>>,
}

impl DiagJob for DeferredDid {
    fn process(&mut self, cx: &mut JobContext<'_>, _request: &mut [u8]) -> DiagReturnCode {
        match cx.send_negative_response(DiagReturnCode::ResponsePending) {
            Ok(()) => DiagReturnCode::Ok,
            Err(_) => DiagReturnCode::GeneralReject,
        }
    }

    fn response_sent(&mut self, cx: &mut JobContext<'_>, result: ResponseSendResult) {
        let mut results = self.results.lock().unwrap();
        results.push(result);
        // The first notification is for the response pending frame
        if results.len() == 2 {
            cx.terminate();
        }
    }
}

/// DID job which sends whatever part of its data fits
#[derive(Debug)]
struct Truncating(Vec<u8>);

impl DiagJob for Truncating {
    fn process(&mut self, cx: &mut JobContext<'_>, _request: &mut [u8]) -> DiagReturnCode {
        cx.release_request_get_response().append_data(&self.0);
        match cx.send_positive_response() {
            Ok(()) => DiagReturnCode::Ok,
            Err(_) => DiagReturnCode::GeneralReject,
        }
    }
}

/// Request pool counting its allocations
#[derive(Debug)]
struct CountingPool {
    inner: AsyncDiagHelper,
    allocations: Arc<Mutex<usize>>,
}

impl AsyncRequestPool for CountingPool {
    fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    fn available(&self) -> usize {
        self.inner.available()
    }

    fn allocate_request(&mut self, connection: ConnectionHandle, request: RequestLocation) -> Option<StoredRequestId> {
        let id = self.inner.allocate_request(connection, request)?;
        *self.allocations.lock().unwrap() += 1;
        Some(id)
    }

    fn get(&self, id: StoredRequestId) -> Option<&StoredRequest> {
        self.inner.get(id)
    }

    fn release_request(&mut self, id: StoredRequestId) {
        self.inner.release_request(id);
    }
}

#[test]
fn read_single_did() {
    let mut ecu = rdbi_ecu(DiagnosisConfiguration::default());
    let handle = ecu.request(0xF1, &[0x22, 0xF1, 0x8B]);

    let frames = ecu.transport.sent_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].payload, vec![0x62, 0xF1, 0x8B, 0x10, 0x07, 0x01]);
    assert_eq!(frames[0].source, ECU);
    assert_eq!(frames[0].target, 0xF1);
    assert_eq!(frames[0].kind, FrameKind::Response);
    assert_eq!(ecu.transport.released_requests(), vec![handle]);
    assert_eq!(ecu.dispatcher.active_connections(), 0);
}

#[test]
fn read_multiple_dids() {
    let mut ecu = rdbi_ecu(DiagnosisConfiguration::default());
    ecu.request(0xF1, &[0x22, 0xF1, 0x8B, 0xF1, 0x90]);
    assert_eq!(
        ecu.transport.sent_payloads(),
        vec![vec![0x62, 0xF1, 0x8B, 0x10, 0x07, 0x01, 0xF1, 0x90, b'V', b'I', b'N']]
    );
    assert_eq!(ecu.dispatcher.available_request_slots(), 4);
}

#[test]
fn read_multiple_dids_skips_unknown_did() {
    let mut ecu = rdbi_ecu(DiagnosisConfiguration::default());
    ecu.request(0xF1, &[0x22, 0xF1, 0x8B, 0xA0, 0x7F]);
    assert_eq!(ecu.transport.sent_payloads(), vec![vec![0x62, 0xF1, 0x8B, 0x10, 0x07, 0x01]]);
}

#[test]
fn read_unknown_dids() {
    let mut ecu = rdbi_ecu(DiagnosisConfiguration::default());
    ecu.request(0xF1, &[0x22, 0xA0, 0x7F]);
    ecu.request(0xF1, &[0x22, 0xA0, 0x7F, 0xA0, 0x80]);
    assert_eq!(
        ecu.transport.sent_payloads(),
        vec![vec![0x7F, 0x22, 0x31], vec![0x7F, 0x22, 0x31]]
    );
    assert_eq!(ecu.dispatcher.active_connections(), 0);
}

#[test]
fn read_did_with_invalid_length() {
    let mut ecu = rdbi_ecu(DiagnosisConfiguration::default());
    ecu.request(0xF1, &[0x22, 0xF1, 0x8B, 0xF1]);
    ecu.request(0xF1, &[0x22, 0xF1]);
    assert_eq!(
        ecu.transport.sent_payloads(),
        vec![vec![0x7F, 0x22, 0x13], vec![0x7F, 0x22, 0x13]]
    );
}

#[test]
fn read_multiple_dids_stops_at_error() {
    let mut ecu = rdbi_ecu(DiagnosisConfiguration::default());
    ecu.dispatcher
        .add_job(ReadIdentifierFromSlice::node(0x0100), Refuse(DiagReturnCode::ConditionsNotCorrect))
        .unwrap();
    ecu.request(0xF1, &[0x22, 0xF1, 0x8B, 0x01, 0x00, 0xF1, 0x90]);
    assert_eq!(ecu.transport.sent_payloads(), vec![vec![0x7F, 0x22, 0x22]]);
    assert_eq!(ecu.dispatcher.active_connections(), 0);
}

#[test]
fn read_multiple_dids_one_request_at_a_time() {
    let mut ecu = rdbi_ecu(DiagnosisConfiguration::default());
    ecu.dispatcher
        .receive_request(0xF1, ECU, &[0x22, 0xF1, 0x8B, 0xF1, 0x90])
        .unwrap();
    ecu.dispatcher
        .receive_request(0xF2, ECU, &[0x22, 0xF1, 0x90, 0xF1, 0x8B])
        .unwrap();
    assert_eq!(ecu.dispatcher.available_request_slots(), 3);
    ecu.dispatcher.run_until_idle();

    let frames = ecu.transport.sent_frames();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].target, 0xF1);
    assert_eq!(
        frames[0].payload,
        vec![0x62, 0xF1, 0x8B, 0x10, 0x07, 0x01, 0xF1, 0x90, b'V', b'I', b'N']
    );
    assert_eq!(frames[1].target, 0xF2);
    assert_eq!(
        frames[1].payload,
        vec![0x62, 0xF1, 0x90, b'V', b'I', b'N', 0xF1, 0x8B, 0x10, 0x07, 0x01]
    );
    assert_eq!(ecu.dispatcher.available_request_slots(), 4);
    assert_eq!(ecu.dispatcher.active_connections(), 0);
}

#[test]
fn functional_request_suppresses_out_of_range() {
    let mut ecu = rdbi_ecu(DiagnosisConfiguration::default());
    ecu.dispatcher.receive_request(0xF1, BROADCAST, &[0x22, 0xA0, 0x7F]).unwrap();
    ecu.dispatcher.run_until_idle();
    assert!(ecu.transport.sent_frames().is_empty());

    ecu.dispatcher.receive_request(0xF1, BROADCAST, &[0x22, 0xF1, 0x8B]).unwrap();
    ecu.dispatcher.run_until_idle();
    let frames = ecu.transport.sent_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].source, ECU);
    assert_eq!(frames[0].payload, vec![0x62, 0xF1, 0x8B, 0x10, 0x07, 0x01]);
    assert_eq!(ecu.dispatcher.active_connections(), 0);
}

#[test]
fn suppress_positive_response_bit() {
    let mut ecu = SimEcu::new(DiagnosisConfiguration::default());
    ecu.dispatcher
        .add_job(
            DiagJobNode::new(&[0x3E], 0)
                .with_payload_length(1)
                .with_suppress_positive_response(true),
            Echo,
        )
        .unwrap();

    let handle = ecu.request(0xF1, &[0x3E, 0x80]);
    assert!(ecu.transport.sent_frames().is_empty());
    assert_eq!(ecu.transport.released_requests(), vec![handle]);

    ecu.request(0xF1, &[0x3E, 0x00]);
    assert_eq!(ecu.transport.sent_payloads(), vec![vec![0x7E, 0x00]]);

    ecu.request(0xF1, &[0x3E, 0x00, 0x00]);
    assert_eq!(ecu.transport.sent_payloads().last(), Some(&vec![0x7F, 0x3E, 0x13]));
}

#[test]
fn job_not_allowed_in_session() {
    let mut ecu = SimEcu::new(DiagnosisConfiguration::default());
    ecu.dispatcher
        .add_job(DiagJobNode::new(&[0x2E], 0).with_sessions(SessionMask::EXTENDED), Echo)
        .unwrap();
    ecu.request(0xF1, &[0x2E, 0xF1, 0x90, 0x01]);
    assert_eq!(ecu.transport.sent_payloads(), vec![vec![0x7F, 0x2E, 0x31]]);
}

#[test]
fn async_job_queues_requests_in_order() {
    let config = DiagnosisConfiguration {
        incoming_connections: 4,
        async_request_pool_size: 2,
        activate_outgoing_pending: false,
        ..Default::default()
    };
    let mut ecu = SimEcu::manual(config);
    ecu.dispatcher
        .add_job(DiagJobNode::new(&[0x31], 0), AsyncDiagJob::new(Echo))
        .unwrap();

    ecu.request(0xF1, &[0x31, 0x01, 0x02, 0x00]);
    ecu.request(0xF2, &[0x31, 0x02]);
    ecu.request(0xF3, &[0x31, 0x03]);
    assert_eq!(ecu.dispatcher.available_request_slots(), 0);
    // Pool exhausted
    ecu.request(0xF4, &[0x31, 0x04]);

    let frames = ecu.transport.sent_frames();
    assert_eq!(frames.len(), 2);
    assert_eq!((frames[0].target, frames[0].payload.clone()), (0xF1, vec![0x71, 0x01, 0x02, 0x00]));
    assert_eq!((frames[1].target, frames[1].payload.clone()), (0xF4, vec![0x7F, 0x31, 0x21]));

    ecu.acknowledge();
    ecu.acknowledge();
    ecu.acknowledge();

    let frames = ecu.transport.sent_frames();
    let answered: Vec<(u16, Vec<u8>)> = frames.into_iter().map(|f| (f.target, f.payload)).collect();
    assert_eq!(
        answered,
        vec![
            (0xF1, vec![0x71, 0x01, 0x02, 0x00]),
            (0xF4, vec![0x7F, 0x31, 0x21]),
            (0xF2, vec![0x71, 0x02]),
            (0xF3, vec![0x71, 0x03]),
        ]
    );
    assert_eq!(ecu.dispatcher.available_request_slots(), 2);
    assert_eq!(ecu.dispatcher.active_connections(), 0);
}

#[test]
fn busy_when_no_connection_is_free() {
    let config = DiagnosisConfiguration {
        incoming_connections: 1,
        activate_outgoing_pending: false,
        ..Default::default()
    };
    let mut ecu = SimEcu::new(config);
    ecu.dispatcher.add_job(DiagJobNode::new(&[0x31], 0), Silent).unwrap();

    let handle = ecu.request(0xF1, &[0x31, 0x01]);
    assert_eq!(
        ecu.dispatcher.receive_request(0xF2, ECU, &[0x22, 0xF1, 0x90]),
        Err(ecu_uds_dispatch::DiagError::NoConnectionAvailable)
    );
    assert_eq!(ecu.transport.sent_payloads(), vec![vec![0x7F, 0x22, 0x21]]);
    assert!(ecu.dispatcher.connection(handle).is_some());
}

#[test]
fn response_pending_until_answered() {
    let mut ecu = SimEcu::new(DiagnosisConfiguration::default());
    let job: JobId = ecu.dispatcher.add_job(DiagJobNode::new(&[0x31], 0), Silent).unwrap();
    let handle = ecu.request(0xF1, &[0x31, 0x01, 0x02, 0x00]);
    assert!(ecu.transport.sent_frames().is_empty());

    ecu.dispatcher.advance_time(39);
    assert!(ecu.transport.sent_frames().is_empty());
    ecu.dispatcher.advance_time(1);
    ecu.dispatcher.advance_time(4500);
    let frames = ecu.transport.sent_frames();
    assert_eq!(frames.len(), 2);
    for frame in &frames {
        assert_eq!(frame.kind, FrameKind::ResponsePending);
        assert_eq!(frame.payload, vec![0x7F, 0x31, 0x78]);
    }

    let sent = ecu.dispatcher.resume(handle, job, |cx| {
        cx.release_request_get_response().append_u8(0x01);
        cx.send_positive_response()
    });
    assert_eq!(sent, Some(Ok(())));
    ecu.dispatcher.run_until_idle();
    assert_eq!(ecu.dispatcher.active_connections(), 0);

    ecu.dispatcher.advance_time(10_000);
    let payloads = ecu.transport.sent_payloads();
    assert_eq!(payloads.len(), 3);
    assert_eq!(payloads[2], vec![0x71, 0x01]);
    assert_eq!(ecu.dispatcher.resume(handle, job, |_| ()), None);
}

#[test]
fn explicit_response_pending_keeps_request_open() {
    let mut ecu = SimEcu::new(DiagnosisConfiguration::default());
    let job = ecu
        .dispatcher
        .add_job(DiagJobNode::new(&[0x31], 0), ExplicitPending)
        .unwrap();
    let handle = ecu.request(0xF1, &[0x31, 0x01]);
    assert_eq!(ecu.transport.sent_payloads(), vec![vec![0x7F, 0x31, 0x78]]);
    assert!(ecu.dispatcher.connection(handle).is_some());

    // The pending period restarts with the explicit frame
    ecu.dispatcher.advance_time(4499);
    assert_eq!(ecu.transport.sent_payloads().len(), 1);
    ecu.dispatcher.advance_time(1);
    assert_eq!(ecu.transport.sent_payloads().len(), 2);

    ecu.dispatcher
        .resume(handle, job, |cx| cx.send_negative_response(DiagReturnCode::ConditionsNotCorrect))
        .unwrap()
        .unwrap();
    ecu.dispatcher.run_until_idle();
    assert_eq!(ecu.transport.sent_payloads().last(), Some(&vec![0x7F, 0x31, 0x22]));
    // The job keeps the request until it terminates it
    assert!(ecu.dispatcher.connection(handle).is_some());
    ecu.dispatcher.resume(handle, job, |cx| cx.terminate()).unwrap();
    ecu.dispatcher.run_until_idle();
    assert_eq!(ecu.dispatcher.active_connections(), 0);
}

#[test]
fn global_timeout_closes_connection() {
    let mut ecu = SimEcu::new(DiagnosisConfiguration::default());
    ecu.dispatcher.add_job(DiagJobNode::new(&[0x31], 0), Silent).unwrap();
    let handle = ecu.request(0xF1, &[0x31, 0x01]);

    ecu.dispatcher.advance_time(190_000);
    assert_eq!(ecu.dispatcher.active_connections(), 0);
    assert_eq!(ecu.transport.released_requests(), vec![handle]);

    // Pending frames at 40 ms and every 4500 ms after, no final response
    let payloads = ecu.transport.sent_payloads();
    assert_eq!(payloads.len(), 43);
    assert!(payloads.iter().all(|p| p == &vec![0x7F, 0x31, 0x78]));
}

#[test]
fn shutdown_closes_open_connections() {
    let mut ecu = SimEcu::new(DiagnosisConfiguration::default());
    ecu.dispatcher.add_job(DiagJobNode::new(&[0x31], 0), Silent).unwrap();
    ecu.request(0xF1, &[0x31, 0x01]);
    assert_eq!(ecu.dispatcher.active_connections(), 1);

    ecu.dispatcher.shutdown();
    assert_eq!(ecu.dispatcher.active_connections(), 0);
    assert_eq!(
        ecu.dispatcher.receive_request(0xF1, ECU, &[0x31, 0x01]),
        Err(ecu_uds_dispatch::DiagError::NotEnabled)
    );
}

#[test]
fn second_response_is_rejected() {
    let mut ecu = SimEcu::new(DiagnosisConfiguration::default());
    let job = DoubleSend::default();
    let sends = job.sends.clone();
    ecu.dispatcher.add_job(DiagJobNode::new(&[0x31], 0), job).unwrap();

    let handle = ecu.request(0xF1, &[0x31, 0x01]);
    assert_eq!(
        *sends.lock().unwrap(),
        vec![Ok(()), Err(DiagError::ConnectionBusy), Err(DiagError::ConnectionBusy)]
    );
    assert_eq!(ecu.transport.sent_payloads(), vec![vec![0x71, 0xAA]]);
    assert_eq!(ecu.transport.released_requests(), vec![handle]);
}

#[test]
fn send_failure_is_reported_to_job() {
    let mut ecu = SimEcu::new(DiagnosisConfiguration::default());
    let job = Recorder::default();
    let results = job.results.clone();
    ecu.dispatcher.add_job(DiagJobNode::new(&[0x31], 0), job).unwrap();

    ecu.transport.fail_next_sends(1);
    let handle = ecu.request(0xF1, &[0x31, 0x01]);
    assert!(ecu.transport.sent_frames().is_empty());
    assert_eq!(*results.lock().unwrap(), vec![ResponseSendResult::SendFailed]);
    assert_eq!(ecu.transport.released_requests(), vec![handle]);
    assert_eq!(ecu.dispatcher.active_connections(), 0);

    // The connection is usable again
    ecu.request(0xF1, &[0x31, 0x01]);
    assert_eq!(ecu.transport.sent_payloads(), vec![vec![0x71, 0xAA]]);
    assert_eq!(
        *results.lock().unwrap(),
        vec![ResponseSendResult::SendFailed, ResponseSendResult::Sent]
    );
}

#[test]
fn transport_error_is_reported_to_job() {
    let mut ecu = SimEcu::manual(DiagnosisConfiguration::default());
    let job = Recorder::default();
    let results = job.results.clone();
    ecu.dispatcher.add_job(DiagJobNode::new(&[0x31], 0), job).unwrap();

    let handle = ecu.request(0xF1, &[0x31, 0x01]);
    assert_eq!(ecu.transport.sent_payloads(), vec![vec![0x71, 0xAA]]);
    assert!(results.lock().unwrap().is_empty());

    let context = ecu.dispatcher.context_handle();
    ecu.transport.acknowledge_all(&context, ProcessingResult::Error);
    ecu.dispatcher.run_until_idle();
    assert_eq!(*results.lock().unwrap(), vec![ResponseSendResult::SendFailed]);
    assert_eq!(ecu.transport.released_requests(), vec![handle]);
}

#[test]
fn read_multiple_dids_with_deferred_did() {
    let mut ecu = rdbi_ecu(DiagnosisConfiguration::default());
    let did = DeferredDid::default();
    let results = did.results.clone();
    let did = ecu.dispatcher.add_job(ReadIdentifierFromSlice::node(0x0300), did).unwrap();

    let handle = ecu.request(0xF1, &[0x22, 0xF1, 0x8B, 0x03, 0x00]);
    let frames = ecu.transport.sent_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].kind, FrameKind::ResponsePending);
    assert_eq!(frames[0].payload, vec![0x7F, 0x22, 0x78]);
    assert_eq!(*results.lock().unwrap(), vec![ResponseSendResult::Sent]);

    // The pending period restarted with the frame of the DID job
    ecu.dispatcher.advance_time(1000);
    assert_eq!(ecu.transport.sent_frames().len(), 1);

    let sent = ecu.dispatcher.resume(handle, did, |cx| {
        cx.release_request_get_response().append_u8(0x55);
        cx.send_positive_response()
    });
    assert_eq!(sent, Some(Ok(())));
    ecu.dispatcher.run_until_idle();

    assert_eq!(
        ecu.transport.sent_payloads(),
        vec![
            vec![0x7F, 0x22, 0x78],
            vec![0x62, 0xF1, 0x8B, 0x10, 0x07, 0x01, 0x03, 0x00, 0x55]
        ]
    );
    assert_eq!(
        *results.lock().unwrap(),
        vec![ResponseSendResult::Sent, ResponseSendResult::Sent]
    );
    assert_eq!(ecu.dispatcher.active_connections(), 0);
}

#[test]
fn read_multiple_dids_response_too_long() {
    let config = DiagnosisConfiguration {
        max_response_payload_size: 8,
        ..Default::default()
    };
    let mut ecu = rdbi_ecu(config);
    ecu.dispatcher
        .add_job(ReadIdentifierFromSlice::node(0x0100), Truncating(vec![0xAB; 4]))
        .unwrap();

    // The DID job refuses data which does not fit
    ecu.request(0xF1, &[0x22, 0xF1, 0x8B, 0xF1, 0x90]);
    // A truncated sub-response ends the request as well
    ecu.request(0xF1, &[0x22, 0x01, 0x00, 0xF1, 0x8B]);
    // Single DIDs fit
    ecu.request(0xF1, &[0x22, 0xF1, 0x8B]);
    assert_eq!(
        ecu.transport.sent_payloads(),
        vec![
            vec![0x7F, 0x22, 0x14],
            vec![0x7F, 0x22, 0x14],
            vec![0x62, 0xF1, 0x8B, 0x10, 0x07, 0x01]
        ]
    );
    assert_eq!(ecu.dispatcher.active_connections(), 0);
}

#[test]
fn read_multiple_dids_limit() {
    let mut ecu = SimEcu::new(DiagnosisConfiguration::default());
    let mut rdbi = MultipleReadDataByIdentifier::new();
    rdbi.set_did_limit(|_| 2);
    ecu.dispatcher.add_job(MultipleReadDataByIdentifier::node(), rdbi).unwrap();
    ecu.dispatcher
        .add_job(ReadIdentifierFromSlice::node(0xF18B), ReadIdentifierFromSlice::new(&[0x10, 0x07, 0x01]))
        .unwrap();
    ecu.dispatcher
        .add_job(ReadIdentifierFromSlice::node(0xF190), ReadIdentifierFromSlice::new(b"VIN"))
        .unwrap();

    ecu.request(0xF1, &[0x22, 0xF1, 0x8B, 0xF1, 0x90, 0xF1, 0x8B]);
    ecu.request(0xF1, &[0x22, 0xF1, 0x90, 0xF1, 0x8B]);
    assert_eq!(
        ecu.transport.sent_payloads(),
        vec![
            vec![0x7F, 0x22, 0x13],
            vec![0x62, 0xF1, 0x90, b'V', b'I', b'N', 0xF1, 0x8B, 0x10, 0x07, 0x01]
        ]
    );
}

#[test]
fn global_timeout_ends_multiple_did_request() {
    let mut ecu = rdbi_ecu(DiagnosisConfiguration::default());
    ecu.dispatcher.add_job(ReadIdentifierFromSlice::node(0x0100), Silent).unwrap();
    ecu.dispatcher.add_job(ReadIdentifierFromSlice::node(0x0200), Silent).unwrap();

    let handle = ecu.request(0xF1, &[0x22, 0x01, 0x00, 0x02, 0x00, 0xF1, 0x8B]);
    ecu.dispatcher.advance_time(190_000);
    assert_eq!(ecu.dispatcher.active_connections(), 0);
    assert_eq!(ecu.transport.released_requests(), vec![handle]);
    let payloads = ecu.transport.sent_payloads();
    assert_eq!(payloads.len(), 43);
    assert!(payloads.iter().all(|p| p == &vec![0x7F, 0x22, 0x78]));

    // Nothing is left running, and the service takes new requests
    ecu.dispatcher.advance_time(10_000);
    assert_eq!(ecu.transport.sent_payloads().len(), 43);
    ecu.request(0xF1, &[0x22, 0xF1, 0x8B, 0xF1, 0x90]);
    assert_eq!(
        ecu.transport.sent_payloads().last(),
        Some(&vec![0x62, 0xF1, 0x8B, 0x10, 0x07, 0x01, 0xF1, 0x90, b'V', b'I', b'N'])
    );
    assert_eq!(ecu.dispatcher.available_request_slots(), 4);
}

#[test]
fn custom_request_pool() {
    let _ = env_logger::builder().is_test(true).try_init();
    let allocations = Arc::new(Mutex::new(0));
    let pool = CountingPool {
        inner: AsyncDiagHelper::new(1),
        allocations: allocations.clone(),
    };
    let config = DiagnosisConfiguration {
        incoming_connections: 3,
        activate_outgoing_pending: false,
        ..Default::default()
    };
    let transport = SimulationTransport::new();
    let mut ecu = SimEcu {
        dispatcher: DiagDispatcher::with_request_pool(
            config,
            ExecutionContext::new(),
            Box::new(DefaultSessionManager::default()),
            Box::new(transport.clone()),
            Box::new(pool),
        ),
        transport,
    };
    ecu.dispatcher
        .add_job(DiagJobNode::new(&[0x31], 0), AsyncDiagJob::new(Echo))
        .unwrap();
    assert_eq!(ecu.dispatcher.available_request_slots(), 1);

    ecu.request(0xF1, &[0x31, 0x01]);
    ecu.request(0xF2, &[0x31, 0x02]);
    ecu.request(0xF3, &[0x31, 0x03]);
    assert_eq!(*allocations.lock().unwrap(), 1);
    assert_eq!(ecu.dispatcher.available_request_slots(), 0);
    assert_eq!(
        ecu.transport.sent_payloads(),
        vec![vec![0x71, 0x01], vec![0x7F, 0x31, 0x21]]
    );

    ecu.acknowledge();
    ecu.acknowledge();
    assert_eq!(ecu.transport.sent_payloads().last(), Some(&vec![0x71, 0x02]));
    assert_eq!(ecu.dispatcher.available_request_slots(), 1);
    assert_eq!(ecu.dispatcher.active_connections(), 0);
}
