//! Two message pumps talking to each other over an in-memory stream.
use std::io::Read;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_net_dimse::dispatch::Dispatcher;
use dicom_net_dimse::message::DimseMessage;
use dicom_net_dimse::options::ServiceOptions;
use dicom_net_dimse::pump::{
    ConnectionEvent, IncomingRequest, Pump, PumpBuilder, RequestEvent, RequestHandler, Responder,
};
use dicom_net_dimse::server::{ServerNegotiator, ServerOptions};
use dicom_net_dimse::status::{code, Status};
use dicom_net_ul::association::syntax::{EXPLICIT_VR_LITTLE_ENDIAN, VERIFICATION};
use dicom_net_ul::association::{AeTitlePolicy, Association};
use dicom_net_ul::pdu::reader::read_pdu;
use dicom_net_ul::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, PDataValueType, Pdu, DEFAULT_MAX_PDU,
    LARGE_PDU_SIZE, PDV_HEADER_SIZE,
};
use dicom_object::InMemDicomObject;
use matches::matches;
use rstest::rstest;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
const STUDY_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";
const MODALITY_PERFORMED_PROCEDURE_STEP: &str = "1.2.840.10008.3.1.2.3.3";
const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";

/// Hands every incoming request over to the test, which decides when to respond.
struct Holding(mpsc::UnboundedSender<(IncomingRequest, Responder)>);

#[async_trait]
impl RequestHandler for Holding {
    async fn handle(&self, request: IncomingRequest, responder: Responder) {
        let _ = self.0.send((request, responder));
    }
}

/// Records every byte written through it.
struct Tap<S> {
    inner: S,
    written: Arc<Mutex<Vec<u8>>>,
}

impl<S: AsyncRead + Unpin> AsyncRead for Tap<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Tap<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.written.lock().unwrap().extend_from_slice(&buf[..n]);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

struct Pair {
    requester: Pump,
    acceptor: Pump,
    held: mpsc::UnboundedReceiver<(IncomingRequest, Responder)>,
    written: Arc<Mutex<Vec<u8>>>,
}

/// Associate a requester pump with an acceptor pump holding every request.
async fn associate(
    association: Association,
    requester_options: ServiceOptions,
    server_options: ServerOptions,
) -> Pair {
    let (client_end, server_end) = tokio::io::duplex(1 << 20);
    let (tx, held) = mpsc::unbounded_channel();
    let negotiator = ServerNegotiator::new(
        Arc::new(server_options),
        Arc::new(Dispatcher::default()),
    );
    let (acceptor, _acceptor_events) = PumpBuilder::new(ServiceOptions::default())
        .negotiator(Arc::new(negotiator))
        .handler(Arc::new(Holding(tx)))
        .spawn(server_end);

    let written = Arc::new(Mutex::new(Vec::new()));
    let tap = Tap {
        inner: client_end,
        written: written.clone(),
    };
    let (requester, mut events) = PumpBuilder::new(requester_options).spawn(tap);
    requester.request_association(association).await.unwrap();
    loop {
        match events.recv().await {
            Some(ConnectionEvent::AssociationAccepted(_)) => break,
            Some(ConnectionEvent::AssociationRequested(_)) => {}
            other => panic!("association not accepted: {:?}", other),
        }
    }

    Pair {
        requester,
        acceptor,
        held,
        written,
    }
}

fn verification_association() -> Association {
    let mut association = Association::new("SCU", "ANY-SCP", AeTitlePolicy::Reject).unwrap();
    association
        .presentation_contexts_mut()
        .add_for_service(VERIFICATION)
        .unwrap();
    association
}

fn find_association() -> Association {
    let mut association = Association::new("SCU", "ANY-SCP", AeTitlePolicy::Reject).unwrap();
    association
        .presentation_contexts_mut()
        .add_for_service(STUDY_ROOT_FIND)
        .unwrap();
    association
}

fn patient(name: &str) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([DataElement::new(
        tags::PATIENT_NAME,
        VR::PN,
        PrimitiveValue::from(name),
    )])
}

fn respond(request: &IncomingRequest, responder: &Responder, status: Status) {
    let response = DimseMessage::response_to(&request.message, status).unwrap();
    responder.send(response).unwrap();
}

#[tokio::test]
async fn window_limits_outstanding_requests() {
    let association = verification_association().with_async_ops_window(2, 1);
    let mut pair = associate(
        association,
        ServiceOptions::default(),
        ServerOptions::new().async_ops_window(0, 0),
    )
    .await;
    assert_eq!(
        pair.requester.association().unwrap().outbound_window(),
        2
    );

    let mut handles = Vec::new();
    for id in 1..=3 {
        handles.push(
            pair.requester
                .send_request(DimseMessage::c_echo_rq(id), CancellationToken::new())
                .unwrap(),
        );
    }

    let (first, first_responder) = pair.held.recv().await.unwrap();
    let (second, _second_responder) = pair.held.recv().await.unwrap();
    assert_eq!(first.message.message_id(), Some(1));
    assert_eq!(second.message.message_id(), Some(2));

    // the third request waits for a free slot
    assert!(tokio::time::timeout(Duration::from_millis(200), pair.held.recv())
        .await
        .is_err());
    assert_eq!(pair.requester.pending_count(), 2);
    assert_eq!(pair.requester.queued_count(), 1);

    respond(&first, &first_responder, Status::success());
    let (third, _) = pair.held.recv().await.unwrap();
    assert_eq!(third.message.message_id(), Some(3));

    let mut first_handle = handles.remove(0);
    match first_handle.next_event().await {
        Some(RequestEvent::Response(response)) => {
            assert_eq!(response.message_id_being_responded_to(), Some(1));
            assert!(response.status().unwrap().is_success());
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn large_data_sets_are_fragmented_and_reassembled() {
    let mut association = Association::new("SCU", "ANY-SCP", AeTitlePolicy::Reject).unwrap();
    association
        .presentation_contexts_mut()
        .add_for_store(CT_IMAGE_STORAGE, EXPLICIT_VR_LITTLE_ENDIAN, &[])
        .unwrap();
    let mut pair = associate(
        association,
        ServiceOptions::default(),
        ServerOptions::new().with_abstract_syntax(CT_IMAGE_STORAGE),
    )
    .await;
    assert_eq!(
        pair.requester.association().unwrap().peer_max_pdu_length(),
        DEFAULT_MAX_PDU
    );

    let pixels: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
    let dataset = InMemDicomObject::from_element_iter([
        DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(CT_IMAGE_STORAGE),
        ),
        DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from("2.25.1234"),
        ),
        DataElement::new(tags::PIXEL_DATA, VR::OB, PrimitiveValue::from(pixels)),
    ]);
    let request = DimseMessage::c_store_rq(7, dataset, EXPLICIT_VR_LITTLE_ENDIAN).unwrap();
    let expected = request
        .encode_dataset(EXPLICIT_VR_LITTLE_ENDIAN)
        .unwrap()
        .unwrap();
    assert!(expected.len() > DEFAULT_MAX_PDU as usize);

    let _handle = pair
        .requester
        .send_request(request, CancellationToken::new())
        .unwrap();
    let (received, _responder) = pair.held.recv().await.unwrap();
    let dataset = received.dataset.unwrap();
    assert_eq!(dataset.transfer_syntax(), EXPLICIT_VR_LITTLE_ENDIAN);
    let mut bytes = Vec::new();
    dataset.into_reader().unwrap().read_to_end(&mut bytes).unwrap();
    assert_eq!(bytes, expected);

    let written = pair.written.lock().unwrap().clone();
    let mut wire = written.as_slice();
    let mut data_fragments = 0;
    while !wire.is_empty() {
        if let Pdu::PData { data } = read_pdu(&mut wire, LARGE_PDU_SIZE, false).unwrap() {
            for pdv in data {
                assert!(pdv.data.len() as u32 <= DEFAULT_MAX_PDU - PDV_HEADER_SIZE);
                if pdv.value_type == PDataValueType::Data {
                    data_fragments += 1;
                }
            }
        }
    }
    assert!(data_fragments >= 2);
}

#[tokio::test(start_paused = true)]
async fn unanswered_requests_time_out() {
    let mut pair = associate(
        verification_association(),
        ServiceOptions::default().request_timeout(Some(Duration::from_secs(2))),
        ServerOptions::new(),
    )
    .await;

    let started = tokio::time::Instant::now();
    let mut handle = pair
        .requester
        .send_request(DimseMessage::c_echo_rq(1), CancellationToken::new())
        .unwrap();
    let (_ignored, _responder) = pair.held.recv().await.unwrap();
    assert!(matches!(
        handle.next_event().await,
        Some(RequestEvent::TimedOut)
    ));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(3));

    // the connection is still usable
    assert!(pair.requester.is_associated());
    assert_eq!(pair.requester.pending_count(), 0);
    let handle = pair
        .requester
        .send_request(DimseMessage::c_echo_rq(2), CancellationToken::new())
        .unwrap();
    let (request, responder) = pair.held.recv().await.unwrap();
    respond(&request, &responder, Status::success());
    let (responses, last) = handle.collect().await;
    assert_eq!(responses.len(), 1);
    assert!(last.is_none());
}

#[tokio::test]
async fn requests_without_accepted_context_are_refused_locally() {
    let mut pair = associate(
        verification_association(),
        ServiceOptions::default(),
        ServerOptions::new(),
    )
    .await;

    let handle = pair
        .requester
        .send_request(
            DimseMessage::c_find_rq(1, STUDY_ROOT_FIND, InMemDicomObject::new_empty()),
            CancellationToken::new(),
        )
        .unwrap();
    let (responses, _) = handle.collect().await;
    assert_eq!(responses.len(), 1);
    assert_eq!(
        responses[0].status().unwrap().code(),
        code::SOP_CLASS_NOT_SUPPORTED
    );
    assert!(pair.held.try_recv().is_err());
    assert!(!pair.acceptor.is_closed());
}

#[tokio::test]
async fn pending_requests_fail_when_the_peer_aborts() {
    let mut pair = associate(
        verification_association(),
        ServiceOptions::default(),
        ServerOptions::new(),
    )
    .await;
    let handle = pair
        .requester
        .send_request(DimseMessage::c_echo_rq(1), CancellationToken::new())
        .unwrap();
    let _held = pair.held.recv().await.unwrap();

    pair.acceptor.abort().await;
    let (responses, last) = handle.collect().await;
    assert!(responses.is_empty());
    assert!(matches!(last, Some(RequestEvent::ConnectionClosed)));
    pair.requester.closed().await;
}

#[tokio::test]
async fn unknown_pdus_are_aborted() {
    let (mut peer, pump_end) = tokio::io::duplex(4096);
    let negotiator = ServerNegotiator::new(
        Arc::new(ServerOptions::new()),
        Arc::new(Dispatcher::default()),
    );
    let (pump, mut events) = PumpBuilder::new(ServiceOptions::default())
        .negotiator(Arc::new(negotiator))
        .spawn(pump_end);

    // PDU type 0x0A, empty
    peer.write_all(&[0x0A, 0x00, 0x00, 0x00, 0x00, 0x00])
        .await
        .unwrap();

    let mut reply = [0u8; 10];
    peer.read_exact(&mut reply).await.unwrap();
    let pdu = read_pdu(&mut &reply[..], DEFAULT_MAX_PDU, true).unwrap();
    assert_eq!(
        pdu,
        Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnrecognizedPdu)
        }
    );

    pump.closed().await;
    let mut aborted = false;
    loop {
        match events.recv().await {
            Some(ConnectionEvent::Aborted(_)) => aborted = true,
            Some(ConnectionEvent::Closed) | None => break,
            Some(_) => {}
        }
    }
    assert!(aborted);
}

#[tokio::test]
async fn services_go_through_contexts_of_any_transfer_syntax() {
    let mut association = Association::new("SCU", "ANY-SCP", AeTitlePolicy::Reject).unwrap();
    let pc_id = association
        .presentation_contexts_mut()
        .add(MODALITY_PERFORMED_PROCEDURE_STEP, [JPEG_BASELINE])
        .unwrap();
    let mut pair = associate(
        association,
        ServiceOptions::default(),
        ServerOptions::new().with_abstract_syntax(MODALITY_PERFORMED_PROCEDURE_STEP),
    )
    .await;
    let accepted = pair.requester.association().unwrap();
    assert_eq!(
        accepted
            .presentation_contexts()
            .get(pc_id)
            .unwrap()
            .accepted_transfer_syntax(),
        Some(JPEG_BASELINE)
    );

    let handle = pair
        .requester
        .send_request(
            DimseMessage::n_get_rq(1, MODALITY_PERFORMED_PROCEDURE_STEP, "2.25.42"),
            CancellationToken::new(),
        )
        .unwrap();
    let (request, responder) = pair.held.recv().await.unwrap();
    assert_eq!(request.message.presentation_context_id(), Some(pc_id));
    respond(&request, &responder, Status::success());

    let (responses, last) = handle.collect().await;
    assert!(last.is_none());
    assert_eq!(responses.len(), 1);
    assert!(responses[0].status().unwrap().is_success());
}

#[tokio::test(start_paused = true)]
async fn pending_responses_keep_the_request_alive() {
    let mut pair = associate(
        find_association(),
        ServiceOptions::default().request_timeout(Some(Duration::from_secs(2))),
        ServerOptions::new().with_abstract_syntax(STUDY_ROOT_FIND),
    )
    .await;

    let mut handle = pair
        .requester
        .send_request(
            DimseMessage::c_find_rq(1, STUDY_ROOT_FIND, patient("DOE^*")),
            CancellationToken::new(),
        )
        .unwrap();
    let (request, responder) = pair.held.recv().await.unwrap();

    // each pending response comes in before the timeout,
    // though all of them together take longer than it
    for name in ["DOE^JOHN", "DOE^JANE"] {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let pending = DimseMessage::response_to(&request.message, Status::pending())
            .unwrap()
            .with_dataset(patient(name));
        responder.send(pending).unwrap();
        match handle.next_event().await {
            Some(RequestEvent::Response(response)) => {
                assert!(response.status().unwrap().is_pending());
                assert!(response.dataset().is_some());
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(pair.requester.pending_count(), 1);
    }

    tokio::time::sleep(Duration::from_millis(1500)).await;
    respond(&request, &responder, Status::success());
    match handle.next_event().await {
        Some(RequestEvent::Response(response)) => {
            assert!(response.status().unwrap().is_success())
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(pair.requester.pending_count(), 0);
    assert!(pair.requester.is_associated());
}

#[tokio::test]
async fn outstanding_message_ids_are_not_reused() {
    let association = verification_association().with_async_ops_window(2, 1);
    let mut pair = associate(
        association,
        ServiceOptions::default(),
        ServerOptions::new().async_ops_window(0, 0),
    )
    .await;

    let first = pair
        .requester
        .send_request(DimseMessage::c_echo_rq(7), CancellationToken::new())
        .unwrap();
    let second = pair
        .requester
        .send_request(DimseMessage::c_echo_rq(7), CancellationToken::new())
        .unwrap();
    let (request, responder) = pair.held.recv().await.unwrap();

    let (responses, last) = second.collect().await;
    assert!(last.is_none());
    assert_eq!(responses.len(), 1);
    assert_eq!(
        responses[0].status().unwrap().code(),
        code::DUPLICATE_INVOCATION
    );
    assert_eq!(pair.requester.pending_count(), 1);

    respond(&request, &responder, Status::success());
    let (responses, last) = first.collect().await;
    assert!(last.is_none());
    assert!(responses[0].status().unwrap().is_success());
    assert!(pair.held.try_recv().is_err());
}

#[rstest]
#[case(ServiceOptions::default().max_command_size(16), "DOE^JOHN".to_string())]
#[case(ServiceOptions::default().max_dataset_size(64), "DOE^".repeat(30))]
#[tokio::test]
async fn oversized_messages_abort_the_association(
    #[case] options: ServiceOptions,
    #[case] name: String,
) {
    let mut pair = associate(
        find_association(),
        options,
        ServerOptions::new().with_abstract_syntax(STUDY_ROOT_FIND),
    )
    .await;
    let handle = pair
        .requester
        .send_request(
            DimseMessage::c_find_rq(1, STUDY_ROOT_FIND, patient("DOE^*")),
            CancellationToken::new(),
        )
        .unwrap();
    let (request, responder) = pair.held.recv().await.unwrap();
    let pending = DimseMessage::response_to(&request.message, Status::pending())
        .unwrap()
        .with_dataset(patient(&name));
    responder.send(pending).unwrap();

    let (responses, last) = handle.collect().await;
    assert!(responses.is_empty());
    assert!(matches!(last, Some(RequestEvent::ConnectionClosed)));
    pair.requester.closed().await;
    pair.acceptor.closed().await;
}
