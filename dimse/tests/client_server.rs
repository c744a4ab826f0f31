//! A client sending requests to a server over loopback TCP.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dicom_net_dimse::client::{CancellationMode, Client, ClientOptions, ClientState, Error};
use dicom_net_dimse::dispatch::{CEchoProvider, Dispatcher};
use dicom_net_dimse::message::DimseMessage;
use dicom_net_dimse::pump::RequestEvent;
use dicom_net_dimse::server::{Server, ServerOptions};
use dicom_net_dimse::status::{code, Status};
use dicom_net_dimse::transport::{self, BoxedStream, Connector, TcpConnector};
use dicom_net_ul::pdu::{AssociationRJServiceUserReason, AssociationRJSource};
use dicom_object::InMemDicomObject;
use matches::matches;
use rstest::rstest;
use tokio::io::DuplexStream;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

const STUDY_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";
const MODALITY_PERFORMED_PROCEDURE_STEP: &str = "1.2.840.10008.3.1.2.3.3";

/// Counts connection attempts, delegating to plain TCP.
#[derive(Default)]
struct CountingConnector {
    attempts: AtomicUsize,
    tcp: TcpConnector,
}

#[async_trait]
impl Connector for CountingConnector {
    async fn connect(&self, host: &str, port: u16) -> transport::Result<BoxedStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.tcp.connect(host, port).await
    }
}

/// Connects to a peer which never says anything.
#[derive(Default)]
struct SilentConnector {
    attempts: AtomicUsize,
    peers: Mutex<Vec<DuplexStream>>,
}

#[async_trait]
impl Connector for SilentConnector {
    async fn connect(&self, _host: &str, _port: u16) -> transport::Result<BoxedStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let (stream, peer) = tokio::io::duplex(1 << 16);
        self.peers.lock().unwrap().push(peer);
        Ok(Box::new(stream))
    }
}

/// Connects to a server running in the same process,
/// except on the given attempts, where the peer stays silent.
struct LocalConnector {
    server: Server,
    silent_attempts: Vec<usize>,
    attempts: AtomicUsize,
    peers: Mutex<Vec<DuplexStream>>,
}

impl LocalConnector {
    fn new(server: Server) -> Self {
        LocalConnector {
            server,
            silent_attempts: Vec::new(),
            attempts: AtomicUsize::new(0),
            peers: Mutex::new(Vec::new()),
        }
    }

    fn silent_on(mut self, attempts: &[usize]) -> Self {
        self.silent_attempts = attempts.to_vec();
        self
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, _host: &str, _port: u16) -> transport::Result<BoxedStream> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let (stream, peer) = tokio::io::duplex(1 << 16);
        if self.silent_attempts.contains(&attempt) {
            self.peers.lock().unwrap().push(peer);
        } else {
            self.server.serve_stream(peer);
        }
        Ok(Box::new(stream))
    }
}

/// Answers C-ECHO requests once let through.
struct GatedEcho {
    arrived: mpsc::UnboundedSender<u16>,
    gate: Arc<Notify>,
}

#[async_trait]
impl CEchoProvider for GatedEcho {
    async fn on_c_echo(&self, request: &DimseMessage) -> Status {
        let _ = self.arrived.send(request.message_id().unwrap_or_default());
        self.gate.notified().await;
        Status::success()
    }
}

fn local_server(dispatcher: Dispatcher) -> Server {
    Server::new(ServerOptions::new(), Arc::new(dispatcher))
}

async fn start(options: ServerOptions, dispatcher: Dispatcher) -> (u16, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Server::new(options, Arc::new(dispatcher));
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move { server.serve(listener, token).await });
    (port, shutdown)
}

#[tokio::test]
async fn echo_round_trip() {
    let (port, shutdown) = start(
        ServerOptions::new().ae_title("ECHO-SCP"),
        Dispatcher::default(),
    )
    .await;
    let client = Client::new(
        "127.0.0.1",
        port,
        ClientOptions::new()
            .calling_ae_title("ECHO-SCU")
            .called_ae_title("ECHO-SCP"),
    );
    let mut states = client.subscribe();
    let echo = client
        .add_request(DimseMessage::c_echo_rq(client.next_message_id()))
        .unwrap();

    client
        .send(CancellationToken::new(), CancellationMode::Graceful)
        .await
        .unwrap();

    let (responses, last) = echo.collect().await;
    assert!(last.is_none());
    assert_eq!(responses.len(), 1);
    assert!(responses[0].status().unwrap().is_success());
    assert_eq!(client.state(), ClientState::Idle);
    assert!(states.has_changed().unwrap());
    assert_eq!(client.queued_count(), 0);
    shutdown.cancel();
}

#[tokio::test]
async fn requests_are_spread_over_associations() {
    let (port, shutdown) = start(ServerOptions::new(), Dispatcher::default()).await;
    let connector = Arc::new(CountingConnector::default());
    let client = Client::new(
        "127.0.0.1",
        port,
        ClientOptions::new().max_requests_per_association(2),
    )
    .with_connector(connector.clone());

    let handles: Vec<_> = (0..5)
        .map(|_| {
            client
                .add_request(DimseMessage::c_echo_rq(client.next_message_id()))
                .unwrap()
        })
        .collect();
    client
        .send(CancellationToken::new(), CancellationMode::Graceful)
        .await
        .unwrap();

    for handle in handles {
        let (responses, last) = handle.collect().await;
        assert!(last.is_none());
        assert!(responses[0].status().unwrap().is_success());
    }
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
    shutdown.cancel();
}

#[tokio::test]
async fn rejected_association_fails_the_requests() {
    let (port, shutdown) = start(
        ServerOptions::new()
            .ae_title("STORE-SCP")
            .accept_called_ae_title(),
        Dispatcher::default(),
    )
    .await;
    let client = Client::new(
        "127.0.0.1",
        port,
        ClientOptions::new().called_ae_title("SOMEONE-ELSE"),
    );
    let echo = client
        .add_request(DimseMessage::c_echo_rq(client.next_message_id()))
        .unwrap();

    let result = client
        .send(CancellationToken::new(), CancellationMode::Graceful)
        .await;
    match result {
        Err(Error::Rejected { rejection, .. }) => assert_eq!(
            rejection.source,
            AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized
            )
        ),
        other => panic!("unexpected outcome {:?}", other),
    }
    let (responses, last) = echo.collect().await;
    assert!(responses.is_empty());
    assert!(matches!(last, Some(RequestEvent::ConnectionClosed)));
    shutdown.cancel();
}

#[tokio::test]
async fn unsupported_services_get_failure_statuses() {
    let (port, shutdown) = start(
        ServerOptions::new().with_abstract_syntax(MODALITY_PERFORMED_PROCEDURE_STEP),
        Dispatcher::default(),
    )
    .await;
    let client = Client::new("127.0.0.1", port, ClientOptions::new());

    // accepted context, but nobody serves it
    let n_get = client
        .add_request(DimseMessage::n_get_rq(
            client.next_message_id(),
            MODALITY_PERFORMED_PROCEDURE_STEP,
            "2.25.42",
        ))
        .unwrap();
    // context rejected during negotiation
    let c_find = client
        .add_request(DimseMessage::c_find_rq(
            client.next_message_id(),
            STUDY_ROOT_FIND,
            InMemDicomObject::new_empty(),
        ))
        .unwrap();

    client
        .send(CancellationToken::new(), CancellationMode::Graceful)
        .await
        .unwrap();

    let (responses, _) = n_get.collect().await;
    assert_eq!(
        responses[0].status().unwrap().code(),
        code::UNRECOGNIZED_OPERATION
    );
    let (responses, _) = c_find.collect().await;
    assert_eq!(
        responses[0].status().unwrap().code(),
        code::SOP_CLASS_NOT_SUPPORTED
    );
    shutdown.cancel();
}

#[tokio::test]
async fn cancelling_before_sending_touches_no_network() {
    let connector = Arc::new(SilentConnector::default());
    let client = Client::new("pacs.invalid", 104, ClientOptions::new())
        .with_connector(connector.clone());
    client
        .add_request(DimseMessage::c_echo_rq(client.next_message_id()))
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    client
        .send(cancel, CancellationMode::Immediate)
        .await
        .unwrap();

    assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);
    assert!(connector.peers.lock().unwrap().is_empty());
    assert_eq!(client.queued_count(), 1);
    assert_eq!(client.state(), ClientState::Idle);
}

#[tokio::test(start_paused = true)]
async fn silent_peers_exhaust_association_attempts() {
    let connector = Arc::new(SilentConnector::default());
    let client = Client::new(
        "pacs.invalid",
        104,
        ClientOptions::new()
            .association_timeout(Duration::from_secs(1))
            .max_association_timeouts(2),
    )
    .with_connector(connector.clone());
    let echo = client
        .add_request(DimseMessage::c_echo_rq(client.next_message_id()))
        .unwrap();

    let result = client
        .send(CancellationToken::new(), CancellationMode::Graceful)
        .await;
    assert!(matches!(
        result,
        Err(Error::AssociationTimeout { attempts: 2, .. })
    ));
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);

    let (responses, last) = echo.collect().await;
    assert!(responses.is_empty());
    assert!(matches!(last, Some(RequestEvent::ConnectionClosed)));
}

#[tokio::test]
async fn sending_twice_at_once_is_refused() {
    let connector = Arc::new(SilentConnector::default());
    let client = Arc::new(
        Client::new(
            "pacs.invalid",
            104,
            ClientOptions::new().association_timeout(Duration::from_secs(30)),
        )
        .with_connector(connector.clone()),
    );
    client
        .add_request(DimseMessage::c_echo_rq(client.next_message_id()))
        .unwrap();

    let cancel = CancellationToken::new();
    let sending = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.send(cancel, CancellationMode::Immediate).await })
    };
    while client.state() != ClientState::AssociationRequesting {
        tokio::task::yield_now().await;
    }
    assert!(matches!(
        client
            .send(CancellationToken::new(), CancellationMode::Immediate)
            .await,
        Err(Error::AlreadySending { .. })
    ));

    cancel.cancel();
    sending.await.unwrap().unwrap();
    assert_eq!(client.state(), ClientState::Idle);
}

#[tokio::test]
async fn lingering_association_takes_late_requests() {
    let connector = Arc::new(LocalConnector::new(local_server(Dispatcher::default())));
    let client = Arc::new(
        Client::new(
            "pacs.local",
            104,
            ClientOptions::new().linger_timeout(Duration::from_secs(1)),
        )
        .with_connector(connector.clone()),
    );
    let mut states = client.subscribe();
    let early = client
        .add_request(DimseMessage::c_echo_rq(client.next_message_id()))
        .unwrap();

    let sending = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .send(CancellationToken::new(), CancellationMode::Graceful)
                .await
        })
    };
    states
        .wait_for(|state| *state == ClientState::Lingering)
        .await
        .unwrap();
    let late = client
        .add_request(DimseMessage::c_echo_rq(client.next_message_id()))
        .unwrap();
    sending.await.unwrap().unwrap();

    for handle in [early, late] {
        let (responses, last) = handle.collect().await;
        assert!(last.is_none());
        assert!(responses[0].status().unwrap().is_success());
    }
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
}

#[rstest]
#[case(CancellationMode::Graceful)]
#[case(CancellationMode::Immediate)]
#[tokio::test]
async fn cancelling_with_requests_in_flight(#[case] mode: CancellationMode) {
    let (arrived, mut arrivals) = mpsc::unbounded_channel();
    let gate = Arc::new(Notify::new());
    let dispatcher = Dispatcher::new().with_echo_provider(Arc::new(GatedEcho {
        arrived,
        gate: gate.clone(),
    }));
    let connector = Arc::new(LocalConnector::new(local_server(dispatcher)));
    let client = Arc::new(
        Client::new("pacs.local", 104, ClientOptions::new()).with_connector(connector.clone()),
    );
    let sent = client
        .add_request(DimseMessage::c_echo_rq(client.next_message_id()))
        .unwrap();
    let mut queued = client
        .add_request(DimseMessage::c_echo_rq(client.next_message_id()))
        .unwrap();

    let cancel = CancellationToken::new();
    let sending = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.send(cancel, mode).await })
    };
    // the first request is being served, the second one waits for its turn
    assert_eq!(arrivals.recv().await, Some(sent.message_id()));
    cancel.cancel();

    match mode {
        CancellationMode::Graceful => {
            assert!(matches!(
                queued.next_event().await,
                Some(RequestEvent::Cancelled)
            ));
            gate.notify_one();
            sending.await.unwrap().unwrap();

            let (responses, last) = sent.collect().await;
            assert!(last.is_none());
            assert_eq!(responses.len(), 1);
            assert!(responses[0].status().unwrap().is_success());
        }
        CancellationMode::Immediate => {
            sending.await.unwrap().unwrap();

            let (responses, last) = sent.collect().await;
            assert!(responses.is_empty());
            assert!(matches!(last, Some(RequestEvent::ConnectionClosed)));
            let (responses, last) = queued.collect().await;
            assert!(responses.is_empty());
            assert!(matches!(
                last,
                Some(RequestEvent::Cancelled) | Some(RequestEvent::ConnectionClosed)
            ));
        }
    }
    assert!(arrivals.try_recv().is_err());
    assert_eq!(client.state(), ClientState::Idle);
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn accepted_associations_reset_the_timeout_count() {
    // every other connection goes unanswered
    let connector = Arc::new(
        LocalConnector::new(local_server(Dispatcher::default())).silent_on(&[0, 2]),
    );
    let client = Client::new(
        "pacs.local",
        104,
        ClientOptions::new()
            .association_timeout(Duration::from_secs(1))
            .max_association_timeouts(2)
            .max_requests_per_association(1),
    )
    .with_connector(connector.clone());
    let handles: Vec<_> = (0..2)
        .map(|_| {
            client
                .add_request(DimseMessage::c_echo_rq(client.next_message_id()))
                .unwrap()
        })
        .collect();

    client
        .send(CancellationToken::new(), CancellationMode::Graceful)
        .await
        .unwrap();

    for handle in handles {
        let (responses, last) = handle.collect().await;
        assert!(last.is_none());
        assert!(responses[0].status().unwrap().is_success());
    }
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);
}
