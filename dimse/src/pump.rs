//! The message pump: one per connection, shared by both association roles.
//!
//! A [`Pump`] takes ownership of a transport stream.
//! A background task reads PDUs off the stream,
//! drives the association state,
//! reassembles DIMSE messages out of P-DATA fragments,
//! correlates responses with their requests
//! and hands incoming requests over to a [`RequestHandler`].
//! Outgoing messages are queued and sent one at a time,
//! with requests admitted only as long as
//! the negotiated asynchronous operations window allows it.
//!
//! Connection-level events are delivered through the
//! [`ConnectionEvent`] receiver returned on [`spawn`](PumpBuilder::spawn),
//! while the responses to each request arrive through
//! the [`RequestHandle`] returned when it was queued.
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dicom_net_ul::association::Association;
use dicom_net_ul::pdu::reader::{decode_pdu, PduHeader};
use dicom_net_ul::pdu::writer::encode_pdu;
use dicom_net_ul::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationRJ, AssociationRQ, PDataValue,
    PDataValueType, Pdu, PDU_HEADER_SIZE, PDV_HEADER_SIZE,
};
use dicom_object::InMemDicomObject;
use snafu::{Backtrace, ResultExt, Snafu};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::message::{self, decode_dataset, CommandField, DimseMessage};
use crate::options::ServiceOptions;
use crate::status::{code, Status};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// the connection is closed
    Closed { backtrace: Backtrace },

    #[snafu(display("an association was already requested on this connection"))]
    AlreadyAssociating { backtrace: Backtrace },

    #[snafu(display("no association is established"))]
    NotAssociated { backtrace: Backtrace },

    #[snafu(display("{:?} is not a request expecting a response", command_field))]
    NotARequest {
        command_field: CommandField,
        backtrace: Backtrace,
    },

    #[snafu(display("request has no message ID"))]
    MissingMessageId { backtrace: Backtrace },

    #[snafu(display("no request with message ID {} is pending", message_id))]
    UnknownRequest {
        message_id: u16,
        backtrace: Backtrace,
    },

    /// could not encode PDU
    EncodePdu {
        source: dicom_net_ul::pdu::writer::Error,
    },

    /// could not write PDU to the connection
    WritePdu {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not read PDU from the connection
    ReadPdu {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// received an invalid PDU
    DecodePdu {
        source: dicom_net_ul::pdu::reader::Error,
    },

    #[snafu(display(
        "unexpected P-DATA value for presentation context {}",
        presentation_context_id
    ))]
    UnexpectedFragment {
        presentation_context_id: u8,
        backtrace: Backtrace,
    },

    /// could not encode or decode DIMSE message
    Message { source: message::Error },

    /// could not spool incoming data set
    Spool {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// spooling task failed
    SpoolTask {
        source: tokio::task::JoinError,
        backtrace: Backtrace,
    },

    #[snafu(display("incoming {} exceeds the limit of {} bytes", what, limit))]
    TooLarge {
        what: &'static str,
        limit: u32,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An event on the connection as a whole.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// the peer requested an association
    AssociationRequested(AssociationRQ),
    /// the association was accepted, by this node or by the peer
    AssociationAccepted(Association),
    /// the association was rejected, by this node or by the peer
    AssociationRejected(AssociationRJ),
    /// the peer requested the association to be released
    ReleaseRequested,
    /// the association was released
    Released,
    /// the association was aborted, by this node or by the peer
    Aborted(AbortRQSource),
    /// the connection is closed, always the last event
    Closed,
}

/// An event regarding a single outgoing request.
#[derive(Debug)]
pub enum RequestEvent {
    /// a response was received,
    /// with more to follow if its status is pending
    Response(DimseMessage),
    /// no response was received in time
    TimedOut,
    /// the request was withdrawn before being sent
    Cancelled,
    /// the connection was closed before a final response
    ConnectionClosed,
}

/// The receiving end of the events of a queued request.
#[derive(Debug)]
pub struct RequestHandle {
    message_id: u16,
    events: mpsc::UnboundedReceiver<RequestEvent>,
}

impl RequestHandle {
    pub(crate) fn new(message_id: u16, events: mpsc::UnboundedReceiver<RequestEvent>) -> Self {
        RequestHandle { message_id, events }
    }

    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    /// Wait for the next event of this request.
    ///
    /// Returns `None` once the final event was received.
    pub async fn next_event(&mut self) -> Option<RequestEvent> {
        self.events.recv().await
    }

    /// Collect the responses up to the final one.
    ///
    /// Pending responses come first.
    /// The last event is returned separately
    /// if it was not a final response.
    pub async fn collect(mut self) -> (Vec<DimseMessage>, Option<RequestEvent>) {
        let mut responses = Vec::new();
        while let Some(event) = self.events.recv().await {
            match event {
                RequestEvent::Response(response) => {
                    let last = !response.status().map_or(false, |s| s.is_pending());
                    responses.push(response);
                    if last {
                        return (responses, None);
                    }
                }
                other => return (responses, Some(other)),
            }
        }
        (responses, Some(RequestEvent::ConnectionClosed))
    }

    pub fn into_receiver(self) -> mpsc::UnboundedReceiver<RequestEvent> {
        self.events
    }
}

/// Decides on incoming association requests.
pub trait Negotiator: Send + Sync {
    /// Accept the request with the returned association,
    /// or reject it.
    fn negotiate(&self, rq: &AssociationRQ) -> Result<Association, AssociationRJ>;
}

/// Handles incoming requests.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one request, sending the response(s) through the responder.
    async fn handle(&self, request: IncomingRequest, responder: Responder);
}

/// Destination of an incoming C-STORE data set,
/// written to as fragments arrive.
pub trait StoreSink: Write + Send {
    /// Finish writing and obtain a reader over the stored bytes.
    fn into_reader(self: Box<Self>) -> std::io::Result<Box<dyn Read + Send>>;
}

/// Creates a store sink for each incoming C-STORE request.
pub trait StoreSinkFactory: Send + Sync {
    fn create(&self) -> std::io::Result<Box<dyn StoreSink>>;
}

/// Spools data sets into anonymous temporary files.
#[derive(Debug, Default, Copy, Clone)]
pub struct TempFileSinkFactory;

impl StoreSinkFactory for TempFileSinkFactory {
    fn create(&self) -> std::io::Result<Box<dyn StoreSink>> {
        let file = tempfile::tempfile()?;
        Ok(Box::new(TempFileSink(BufWriter::new(file))))
    }
}

struct TempFileSink(BufWriter<File>);

impl Write for TempFileSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

impl StoreSink for TempFileSink {
    fn into_reader(self: Box<Self>) -> std::io::Result<Box<dyn Read + Send>> {
        let mut file = self.0.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(0))?;
        Ok(Box::new(BufReader::new(file)))
    }
}

enum DatasetSource {
    Memory(Vec<u8>),
    Spooled(Box<dyn StoreSink>),
}

/// The still encoded data set of an incoming request.
pub struct IncomingDataset {
    transfer_syntax: String,
    source: DatasetSource,
}

impl std::fmt::Debug for IncomingDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match &self.source {
            DatasetSource::Memory(bytes) => format!("{} bytes in memory", bytes.len()),
            DatasetSource::Spooled(_) => "spooled".to_string(),
        };
        f.debug_struct("IncomingDataset")
            .field("transfer_syntax", &self.transfer_syntax)
            .field("source", &source)
            .finish()
    }
}

impl IncomingDataset {
    pub fn from_bytes(bytes: Vec<u8>, transfer_syntax: impl Into<String>) -> Self {
        IncomingDataset {
            transfer_syntax: transfer_syntax.into(),
            source: DatasetSource::Memory(bytes),
        }
    }

    /// The transfer syntax of the presentation context it came through.
    pub fn transfer_syntax(&self) -> &str {
        &self.transfer_syntax
    }

    /// Obtain a reader over the encoded data set.
    pub fn into_reader(self) -> std::io::Result<Box<dyn Read + Send>> {
        match self.source {
            DatasetSource::Memory(bytes) => Ok(Box::new(std::io::Cursor::new(bytes))),
            DatasetSource::Spooled(sink) => sink.into_reader(),
        }
    }

    /// Decode the data set.
    pub fn read(self) -> message::Result<InMemDicomObject> {
        let transfer_syntax = self.transfer_syntax.clone();
        let reader = self.into_reader().context(message::SpoolDatasetSnafu)?;
        decode_dataset(reader, &transfer_syntax)
    }
}

/// A request received from the peer.
#[derive(Debug)]
pub struct IncomingRequest {
    pub message: DimseMessage,
    pub dataset: Option<IncomingDataset>,
}

/// Sends responses to one incoming request.
#[derive(Debug, Clone)]
pub struct Responder {
    pump: Pump,
    presentation_context_id: u8,
}

impl Responder {
    /// Queue a response.
    /// Its presentation context is the one of the request.
    pub fn send(&self, mut response: DimseMessage) -> Result<()> {
        response.set_presentation_context_id(self.presentation_context_id);
        self.pump.enqueue(Outgoing {
            message: response,
            events: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn presentation_context_id(&self) -> u8 {
        self.presentation_context_id
    }

    /// The pump the request came through,
    /// for issuing sub-operations on the same association.
    pub fn pump(&self) -> &Pump {
        &self.pump
    }
}

/// Builds and spawns a [`Pump`].
pub struct PumpBuilder {
    options: ServiceOptions,
    handler: Option<Arc<dyn RequestHandler>>,
    negotiator: Option<Arc<dyn Negotiator>>,
    store_sink: Arc<dyn StoreSinkFactory>,
}

impl PumpBuilder {
    pub fn new(options: ServiceOptions) -> Self {
        PumpBuilder {
            options,
            handler: None,
            negotiator: None,
            store_sink: Arc::new(TempFileSinkFactory),
        }
    }

    /// Handle incoming requests with the given handler.
    ///
    /// Without one, all requests are answered with an unrecognized operation status.
    pub fn handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Act as the association acceptor, using the given negotiator.
    pub fn negotiator(mut self, negotiator: Arc<dyn Negotiator>) -> Self {
        self.negotiator = Some(negotiator);
        self
    }

    pub fn store_sink(mut self, factory: Arc<dyn StoreSinkFactory>) -> Self {
        self.store_sink = factory;
        self
    }

    /// Take the stream and start reading from it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<S>(self, stream: S) -> (Pump, mpsc::UnboundedReceiver<ConnectionEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            options: self.options,
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            state: Mutex::new(State::default()),
            events,
            handler: self.handler,
            negotiator: self.negotiator,
            store_sink: self.store_sink,
            closed: CancellationToken::new(),
        });
        tokio::spawn(read_loop(shared.clone(), reader));
        (Pump { shared }, events_rx)
    }
}

/// A handle to the message pump of a connection.
///
/// Cloning the handle does not duplicate the pump.
#[derive(Clone)]
pub struct Pump {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Pump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state();
        f.debug_struct("Pump")
            .field("id", &self.shared.id)
            .field("phase", &state.phase)
            .field("queued", &state.queue.len())
            .field("pending", &state.pending.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl Pump {
    /// Send an association request.
    ///
    /// Requests queued before the association is accepted
    /// are sent once it is.
    pub async fn request_association(&self, association: Association) -> Result<()> {
        let rq = {
            let mut state = self.shared.state();
            snafu::ensure!(!state.closed, ClosedSnafu);
            snafu::ensure!(state.phase == Phase::Idle, AlreadyAssociatingSnafu);
            state.phase = Phase::Requested;
            let rq = association.to_association_rq();
            state.association = Some(association);
            rq
        };
        self.shared.write_pdu(&Pdu::AssociationRQ(rq)).await
    }

    /// Queue a request expecting a response.
    ///
    /// The request is bound to a presentation context when it is sent.
    /// Dropping the handle does not cancel the request,
    /// cancel the token instead.
    pub fn send_request(
        &self,
        message: DimseMessage,
        cancel: CancellationToken,
    ) -> Result<RequestHandle> {
        snafu::ensure!(
            message.command_field().expects_response(),
            NotARequestSnafu {
                command_field: message.command_field()
            }
        );
        let message_id = message.message_id().ok_or_else(|| MissingMessageIdSnafu.build())?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.enqueue(Outgoing {
            message,
            events: Some(tx),
            cancel,
        })?;
        Ok(RequestHandle {
            message_id,
            events: rx,
        })
    }

    /// Ask the peer to cancel a pending request.
    ///
    /// C-CANCEL requests are not subject to the operations window.
    pub fn send_cancel(&self, message_id: u16) -> Result<()> {
        let pc_id = {
            let state = self.shared.state();
            state
                .pending
                .get(&message_id)
                .map(|p| p.presentation_context_id)
                .ok_or_else(|| UnknownRequestSnafu { message_id }.build())?
        };
        let mut message = DimseMessage::c_cancel_rq(message_id);
        message.set_presentation_context_id(pc_id);
        self.enqueue(Outgoing {
            message,
            events: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Withdraw the requests not sent yet,
    /// each of them receiving [`RequestEvent::Cancelled`].
    ///
    /// Returns the number of withdrawn requests.
    pub fn withdraw_queued(&self) -> usize {
        let withdrawn: Vec<Outgoing> = {
            let mut state = self.shared.state();
            let (requests, others): (VecDeque<Outgoing>, VecDeque<Outgoing>) =
                std::mem::take(&mut state.queue)
                    .into_iter()
                    .partition(|o| o.is_windowed());
            state.queue = others;
            requests.into_iter().collect()
        };
        for outgoing in &withdrawn {
            if let Some(events) = &outgoing.events {
                let _ = events.send(RequestEvent::Cancelled);
            }
        }
        withdrawn.len()
    }

    /// Request a graceful release of the association.
    ///
    /// The connection closes once the peer replies.
    pub async fn release(&self) -> Result<()> {
        {
            let mut state = self.shared.state();
            snafu::ensure!(!state.closed, ClosedSnafu);
            snafu::ensure!(state.phase == Phase::Associated, NotAssociatedSnafu);
            state.phase = Phase::Releasing;
        }
        debug!("Releasing association");
        self.shared.write_pdu(&Pdu::ReleaseRQ).await
    }

    /// Abort the association and close the connection.
    pub async fn abort(&self) {
        self.shared.abort(AbortRQSource::ServiceUser).await;
    }

    /// A process-wide unique identifier of the connection.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Close the connection without any further PDU.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Wait until the connection is closed.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    pub fn is_associated(&self) -> bool {
        self.shared.state().phase == Phase::Associated
    }

    /// The association of this connection, once requested or accepted.
    pub fn association(&self) -> Option<Association> {
        self.shared.state().association.clone()
    }

    /// Number of requests sent and awaiting a final response.
    pub fn pending_count(&self) -> usize {
        self.shared.state().pending.len()
    }

    /// Number of messages waiting to be sent.
    pub fn queued_count(&self) -> usize {
        self.shared.state().queue.len()
    }

    fn enqueue(&self, outgoing: Outgoing) -> Result<()> {
        {
            let mut state = self.shared.state();
            snafu::ensure!(!state.closed, ClosedSnafu);
            state.queue.push_back(outgoing);
        }
        self.shared.schedule();
        Ok(())
    }
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
enum Phase {
    #[default]
    Idle,
    Requested,
    Associated,
    Releasing,
}

struct Outgoing {
    message: DimseMessage,
    events: Option<mpsc::UnboundedSender<RequestEvent>>,
    cancel: CancellationToken,
}

impl Outgoing {
    /// whether the message takes a slot of the operations window
    fn is_windowed(&self) -> bool {
        self.message.command_field().expects_response()
    }

    /// the message ID its pending entry will be kept under
    fn windowed_message_id(&self) -> Option<u16> {
        if self.is_windowed() && self.events.is_some() {
            self.message.message_id()
        } else {
            None
        }
    }
}

struct Pending {
    events: mpsc::UnboundedSender<RequestEvent>,
    presentation_context_id: u8,
    generation: u64,
    timer: Option<AbortHandle>,
}

#[derive(Default)]
struct State {
    phase: Phase,
    association: Option<Association>,
    queue: VecDeque<Outgoing>,
    pending: HashMap<u16, Pending>,
    sending: bool,
    closed: bool,
    timer_generation: u64,
}

impl State {
    fn window_open(&self) -> bool {
        let window = self
            .association
            .as_ref()
            .map_or(1, |a| a.outbound_window());
        window == 0 || self.pending.len() < usize::from(window)
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

struct Shared {
    id: u64,
    options: ServiceOptions,
    writer: tokio::sync::Mutex<BoxedWriter>,
    state: Mutex<State>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    handler: Option<Arc<dyn RequestHandler>>,
    negotiator: Option<Arc<dyn Negotiator>>,
    store_sink: Arc<dyn StoreSinkFactory>,
    closed: CancellationToken,
}

/// A message chosen to be sent next, bound to its presentation context.
struct Bound {
    outgoing: Outgoing,
    presentation_context_id: u8,
    transfer_syntax: String,
    max_pdu_length: u32,
}

enum SendError {
    /// cancelled before anything was written
    Withdrawn,
    /// cancelled after some fragments were written
    Interrupted,
    Encode(message::Error),
    Io(Error),
}

enum Flow {
    Continue,
    Close,
    Abort(AbortRQServiceProviderReason),
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    async fn write_pdu(&self, pdu: &Pdu) -> Result<()> {
        let mut buffer = Vec::new();
        encode_pdu(&mut buffer, pdu).context(EncodePduSnafu)?;
        trace!("-> {}", pdu.short_description());
        let mut writer = self.writer.lock().await;
        writer.write_all(&buffer).await.context(WritePduSnafu)?;
        writer.flush().await.context(WritePduSnafu)
    }

    async fn abort(self: &Arc<Self>, source: AbortRQSource) {
        if self.closed.is_cancelled() {
            return;
        }
        info!("Aborting association ({:?})", source);
        if let Err(e) = self.write_pdu(&Pdu::AbortRQ { source }).await {
            debug!("Could not send A-ABORT: {}", snafu::Report::from_error(e));
        }
        self.emit(ConnectionEvent::Aborted(source));
        self.close();
    }

    /// Close the connection once,
    /// failing every queued and pending request.
    fn close(self: &Arc<Self>) {
        let (pending, queue) = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.queue),
            )
        };
        self.closed.cancel();
        for (_, pending) in pending {
            if let Some(timer) = pending.timer {
                timer.abort();
            }
            let _ = pending.events.send(RequestEvent::ConnectionClosed);
        }
        for outgoing in queue {
            if let Some(events) = outgoing.events {
                let _ = events.send(RequestEvent::ConnectionClosed);
            }
        }
        debug!("Connection closed");
        self.emit(ConnectionEvent::Closed);

        let shared = self.clone();
        tokio::spawn(async move {
            let mut writer = shared.writer.lock().await;
            let _ = writer.shutdown().await;
        });
    }

    /// Pick the next message to send, if the sender is idle.
    fn schedule(self: &Arc<Self>) {
        let mut refused = Vec::new();
        let next = {
            let mut state = self.state();
            self.pick_next(&mut state, &mut refused)
        };
        for (outgoing, status) in refused {
            deliver_local_response(outgoing, status);
        }
        if let Some(bound) = next {
            let shared = self.clone();
            tokio::spawn(async move { shared.send(bound).await });
        }
    }

    fn pick_next(
        &self,
        state: &mut State,
        refused: &mut Vec<(Outgoing, Status)>,
    ) -> Option<Bound> {
        if state.closed || state.sending || state.phase != Phase::Associated {
            return None;
        }
        loop {
            let window_open = state.window_open();
            let index = state
                .queue
                .iter()
                .position(|o| !o.is_windowed() || window_open)?;
            let mut outgoing = state.queue.remove(index)?;
            if outgoing.cancel.is_cancelled() {
                debug!("Dropping cancelled message before sending");
                if let Some(events) = &outgoing.events {
                    let _ = events.send(RequestEvent::Cancelled);
                }
                continue;
            }
            if let Some(message_id) = outgoing.windowed_message_id() {
                if state.pending.contains_key(&message_id) {
                    warn!("Message ID {} is already outstanding", message_id);
                    let status = Status::new(code::DUPLICATE_INVOCATION)
                        .with_error_comment("message ID already outstanding");
                    refused.push((outgoing, status));
                    continue;
                }
            }
            let association = state.association.as_ref()?;
            let max_pdu_length = association.peer_max_pdu_length();

            let (pc_id, transfer_syntax) = match outgoing.message.presentation_context_id() {
                Some(id) => match association.presentation_contexts().get(id) {
                    Some(pc) => (
                        id,
                        pc.accepted_transfer_syntax()
                            .unwrap_or_else(|| outgoing.message.transfer_syntax())
                            .to_string(),
                    ),
                    None => {
                        warn!("Dropping message for unknown presentation context {}", id);
                        continue;
                    }
                },
                None => {
                    let abstract_syntax = outgoing.message.sop_class_uid().unwrap_or_default();
                    let selected = if outgoing.message.command_field() == CommandField::CStoreRq {
                        association.select_store_presentation_context(
                            &abstract_syntax,
                            outgoing.message.transfer_syntax(),
                        )
                    } else {
                        association.select_presentation_context(&abstract_syntax)
                    };
                    match selected {
                        Some(pc) => (
                            pc.id(),
                            pc.accepted_transfer_syntax()
                                .unwrap_or_default()
                                .to_string(),
                        ),
                        None => {
                            warn!(
                                "No accepted presentation context for {} in {}",
                                abstract_syntax,
                                outgoing.message.transfer_syntax()
                            );
                            let status = Status::new(code::SOP_CLASS_NOT_SUPPORTED)
                                .with_error_comment("no accepted presentation context");
                            refused.push((outgoing, status));
                            continue;
                        }
                    }
                }
            };
            outgoing.message.set_presentation_context_id(pc_id);

            if outgoing.is_windowed() {
                if let (Some(events), Some(message_id)) =
                    (&outgoing.events, outgoing.message.message_id())
                {
                    state.pending.insert(
                        message_id,
                        Pending {
                            events: events.clone(),
                            presentation_context_id: pc_id,
                            generation: 0,
                            timer: None,
                        },
                    );
                }
            }
            state.sending = true;
            return Some(Bound {
                outgoing,
                presentation_context_id: pc_id,
                transfer_syntax,
                max_pdu_length,
            });
        }
    }

    async fn send(self: Arc<Self>, bound: Bound) {
        let message_id = bound.outgoing.message.message_id();
        let windowed = bound.outgoing.is_windowed();
        match self.write_message(&bound).await {
            Ok(()) => {
                if windowed {
                    if let Some(id) = message_id {
                        self.start_timer(id);
                    }
                }
            }
            Err(SendError::Withdrawn) => {
                debug!("Message withdrawn before sending");
                self.forget(message_id, windowed);
                if let Some(events) = &bound.outgoing.events {
                    let _ = events.send(RequestEvent::Cancelled);
                }
            }
            Err(SendError::Interrupted) => {
                self.state().sending = false;
                self.abort(AbortRQSource::ServiceUser).await;
                return;
            }
            Err(SendError::Encode(e)) => {
                warn!("Could not encode message: {}", snafu::Report::from_error(&e));
                self.forget(message_id, windowed);
                deliver_local_response(
                    bound.outgoing,
                    Status::new(code::PROCESSING_FAILURE).with_error_comment(e.to_string()),
                );
            }
            Err(SendError::Io(e)) => {
                warn!("{}", snafu::Report::from_error(e));
                self.state().sending = false;
                self.close();
                return;
            }
        }
        self.state().sending = false;
        self.schedule();
    }

    fn forget(&self, message_id: Option<u16>, windowed: bool) {
        if !windowed {
            return;
        }
        if let Some(id) = message_id {
            self.state().pending.remove(&id);
        }
    }

    async fn write_message(&self, bound: &Bound) -> Result<(), SendError> {
        let message = &bound.outgoing.message;
        let command = message.encode_command().map_err(SendError::Encode)?;
        let dataset = message
            .encode_dataset(&bound.transfer_syntax)
            .map_err(SendError::Encode)?;

        let (command_max, data_max) = match bound.max_pdu_length {
            0 => (
                self.options.command_buffer_size,
                self.options.data_buffer_size,
            ),
            max => (max, max),
        };

        trace!(
            "Sending {:?} through presentation context {}",
            message.command_field(),
            bound.presentation_context_id
        );
        let mut written = false;
        self.write_fragments(
            bound,
            PDataValueType::Command,
            &command,
            command_max,
            &mut written,
        )
        .await?;
        if let Some(dataset) = dataset {
            self.write_fragments(bound, PDataValueType::Data, &dataset, data_max, &mut written)
                .await?;
        }
        Ok(())
    }

    async fn write_fragments(
        &self,
        bound: &Bound,
        value_type: PDataValueType,
        bytes: &[u8],
        max_pdu_length: u32,
        written: &mut bool,
    ) -> Result<(), SendError> {
        let size = fragment_size(max_pdu_length);
        let mut chunks: Vec<&[u8]> = bytes.chunks(size).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        let count = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            if bound.outgoing.cancel.is_cancelled() || self.closed.is_cancelled() {
                return Err(if *written {
                    SendError::Interrupted
                } else {
                    SendError::Withdrawn
                });
            }
            let pdu = Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id: bound.presentation_context_id,
                    value_type,
                    is_last: i + 1 == count,
                    data: chunk.to_vec(),
                }],
            };
            self.write_pdu(&pdu).await.map_err(SendError::Io)?;
            *written = true;
        }
        Ok(())
    }

    /// Start or restart the response timer of a pending request.
    fn start_timer(self: &Arc<Self>, message_id: u16) {
        let Some(timeout) = self.options.request_timeout else {
            return;
        };
        let mut state = self.state();
        state.timer_generation += 1;
        let generation = state.timer_generation;
        let Some(pending) = state.pending.get_mut(&message_id) else {
            return;
        };
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
        pending.generation = generation;
        let shared = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            shared.on_timeout(message_id, generation, timeout);
        });
        pending.timer = Some(handle.abort_handle());
    }

    fn on_timeout(self: &Arc<Self>, message_id: u16, generation: u64, timeout: Duration) {
        let expired = {
            let mut state = self.state();
            let current = state
                .pending
                .get(&message_id)
                .map_or(false, |p| p.generation == generation);
            if current {
                state.pending.remove(&message_id)
            } else {
                None
            }
        };
        if let Some(pending) = expired {
            warn!(
                "No response to message {} within {:?}",
                message_id, timeout
            );
            let _ = pending.events.send(RequestEvent::TimedOut);
            self.schedule();
        }
    }

    fn on_response(self: &Arc<Self>, response: DimseMessage) {
        let Some(message_id) = response.message_id_being_responded_to() else {
            warn!("Discarding response without a message ID being responded to");
            return;
        };
        let more = response.status().map_or(false, |s| s.is_pending());
        let events = {
            let mut state = self.state();
            if more {
                state.pending.get(&message_id).map(|p| p.events.clone())
            } else {
                state.pending.remove(&message_id).map(|p| {
                    if let Some(timer) = p.timer {
                        timer.abort();
                    }
                    p.events
                })
            }
        };
        match events {
            None => warn!("Discarding response to unknown message {}", message_id),
            Some(events) => {
                let _ = events.send(RequestEvent::Response(response));
                if more {
                    self.start_timer(message_id);
                } else {
                    self.schedule();
                }
            }
        }
    }

    fn on_request(self: &Arc<Self>, message: DimseMessage, dataset: Option<IncomingDataset>) {
        let presentation_context_id = message.presentation_context_id().unwrap_or_default();
        let responder = Responder {
            pump: Pump {
                shared: self.clone(),
            },
            presentation_context_id,
        };
        match &self.handler {
            Some(handler) => {
                let handler = handler.clone();
                let request = IncomingRequest { message, dataset };
                tokio::spawn(async move { handler.handle(request, responder).await });
            }
            None => {
                if let Some(response) =
                    DimseMessage::response_to(&message, Status::new(code::UNRECOGNIZED_OPERATION))
                {
                    let _ = responder.send(response);
                }
            }
        }
    }

    async fn handle_pdu(self: &Arc<Self>, pdu: Pdu, assembler: &mut Assembler) -> Flow {
        let phase = self.state().phase;
        match pdu {
            Pdu::AssociationRQ(rq) => {
                let Some(negotiator) = self.negotiator.clone() else {
                    return Flow::Abort(AbortRQServiceProviderReason::UnexpectedPdu);
                };
                if phase != Phase::Idle {
                    return Flow::Abort(AbortRQServiceProviderReason::UnexpectedPdu);
                }
                self.emit(ConnectionEvent::AssociationRequested(rq.clone()));
                match negotiator.negotiate(&rq) {
                    Ok(mut association) => {
                        let ac = association.to_association_ac();
                        {
                            let mut state = self.state();
                            state.phase = Phase::Associated;
                            state.association = Some(association.clone());
                        }
                        if let Err(e) = self.write_pdu(&Pdu::AssociationAC(ac)).await {
                            warn!("{}", snafu::Report::from_error(e));
                            return Flow::Close;
                        }
                        info!(
                            "Accepted association from {}",
                            association.calling_ae_title()
                        );
                        self.emit(ConnectionEvent::AssociationAccepted(association));
                        self.schedule();
                        Flow::Continue
                    }
                    Err(rj) => {
                        info!(
                            "Rejected association from {}: {:?}",
                            rq.calling_ae_title, rj.source
                        );
                        if let Err(e) = self.write_pdu(&Pdu::AssociationRJ(rj.clone())).await {
                            warn!("{}", snafu::Report::from_error(e));
                        }
                        self.emit(ConnectionEvent::AssociationRejected(rj));
                        Flow::Close
                    }
                }
            }
            Pdu::AssociationAC(ac) => {
                if phase != Phase::Requested {
                    return Flow::Abort(AbortRQServiceProviderReason::UnexpectedPdu);
                }
                let accepted = {
                    let mut state = self.state();
                    let Some(association) = state.association.as_mut() else {
                        return Flow::Abort(AbortRQServiceProviderReason::UnexpectedPdu);
                    };
                    if let Err(e) = association.apply_association_ac(&ac) {
                        warn!("Invalid association response: {}", snafu::Report::from_error(e));
                        return Flow::Abort(AbortRQServiceProviderReason::InvalidPduParameter);
                    }
                    state.phase = Phase::Associated;
                    state.association.clone()
                };
                if let Some(association) = accepted {
                    info!("Association accepted by {}", association.called_ae_title());
                    self.emit(ConnectionEvent::AssociationAccepted(association));
                }
                self.schedule();
                Flow::Continue
            }
            Pdu::AssociationRJ(rj) => {
                if phase != Phase::Requested {
                    return Flow::Abort(AbortRQServiceProviderReason::UnexpectedPdu);
                }
                info!("Association rejected: {:?} {:?}", rj.result, rj.source);
                self.emit(ConnectionEvent::AssociationRejected(rj));
                Flow::Close
            }
            Pdu::PData { data } => {
                if phase != Phase::Associated && phase != Phase::Releasing {
                    return Flow::Abort(AbortRQServiceProviderReason::UnexpectedPdu);
                }
                for pdv in data {
                    match assembler.push(self, pdv).await {
                        Ok(None) => {}
                        Ok(Some((message, dataset))) => self.on_message(message, dataset).await,
                        Err(e) => {
                            warn!("{}", snafu::Report::from_error(e));
                            return Flow::Abort(AbortRQServiceProviderReason::InvalidPduParameter);
                        }
                    }
                }
                Flow::Continue
            }
            Pdu::ReleaseRQ => {
                if phase != Phase::Associated && phase != Phase::Releasing {
                    return Flow::Abort(AbortRQServiceProviderReason::UnexpectedPdu);
                }
                debug!("Release requested by peer");
                self.emit(ConnectionEvent::ReleaseRequested);
                if let Err(e) = self.write_pdu(&Pdu::ReleaseRP).await {
                    warn!("{}", snafu::Report::from_error(e));
                }
                self.emit(ConnectionEvent::Released);
                Flow::Close
            }
            Pdu::ReleaseRP => {
                if phase != Phase::Releasing {
                    return Flow::Abort(AbortRQServiceProviderReason::UnexpectedPdu);
                }
                debug!("Association released");
                self.emit(ConnectionEvent::Released);
                Flow::Close
            }
            Pdu::AbortRQ { source } => {
                info!("Association aborted by peer ({:?})", source);
                self.emit(ConnectionEvent::Aborted(source));
                Flow::Close
            }
            Pdu::Unknown { pdu_type, .. } => {
                warn!("Unrecognized PDU type 0x{:02X}", pdu_type);
                Flow::Abort(AbortRQServiceProviderReason::UnrecognizedPdu)
            }
        }
    }

    async fn on_message(
        self: &Arc<Self>,
        mut message: DimseMessage,
        dataset: Option<IncomingDataset>,
    ) {
        let command_field = message.command_field();
        debug!("Received {:?}", command_field);
        if command_field.is_response() {
            if let Some(dataset) = dataset {
                let transfer_syntax = dataset.transfer_syntax().to_string();
                // decoded here so that responses keep their arrival order
                match tokio::task::spawn_blocking(move || dataset.read()).await {
                    Ok(Ok(obj)) => message.set_dataset(obj, transfer_syntax),
                    Ok(Err(e)) => warn!(
                        "Could not decode response data set: {}",
                        snafu::Report::from_error(e)
                    ),
                    Err(e) => warn!("Response data set decoding failed: {}", e),
                }
            }
            self.on_response(message);
        } else {
            self.on_request(message, dataset);
        }
    }
}

/// The largest even PDV payload fitting in a PDU of the given maximum length.
fn fragment_size(max_pdu_length: u32) -> usize {
    let size = max_pdu_length.saturating_sub(PDV_HEADER_SIZE) & !1;
    size.max(2) as usize
}

/// Answer a request locally, without it ever reaching the peer.
fn deliver_local_response(outgoing: Outgoing, status: Status) {
    let Some(events) = outgoing.events else {
        return;
    };
    match DimseMessage::response_to(&outgoing.message, status) {
        Some(response) => {
            let _ = events.send(RequestEvent::Response(response));
        }
        None => {
            let _ = events.send(RequestEvent::ConnectionClosed);
        }
    }
}

enum DataBuffer {
    Memory(Vec<u8>),
    Sink(Box<dyn StoreSink>),
}

struct Partial {
    message: DimseMessage,
    presentation_context_id: u8,
    transfer_syntax: String,
    data: DataBuffer,
}

/// Reassembles messages out of P-DATA values.
#[derive(Default)]
struct Assembler {
    command: Vec<u8>,
    command_pc: Option<u8>,
    partial: Option<Partial>,
}

impl Assembler {
    async fn push(
        &mut self,
        shared: &Shared,
        pdv: PDataValue,
    ) -> Result<Option<(DimseMessage, Option<IncomingDataset>)>> {
        let pc_id = pdv.presentation_context_id;
        match pdv.value_type {
            PDataValueType::Command => {
                if self.partial.is_some() || self.command_pc.map_or(false, |id| id != pc_id) {
                    return Err(unexpected_fragment(pc_id));
                }
                self.command_pc = Some(pc_id);
                let limit = shared.options.max_command_size;
                ensure_within(self.command.len(), pdv.data.len(), limit, "command set")?;
                self.command.extend_from_slice(&pdv.data);
                if !pdv.is_last {
                    return Ok(None);
                }
                let bytes = std::mem::take(&mut self.command);
                self.command_pc = None;
                let mut message = DimseMessage::decode_command(&bytes).context(MessageSnafu)?;
                message.set_presentation_context_id(pc_id);
                if !message.has_dataset() {
                    return Ok(Some((message, None)));
                }
                let transfer_syntax = {
                    let state = shared.state();
                    state
                        .association
                        .as_ref()
                        .and_then(|a| a.presentation_contexts().get(pc_id))
                        .and_then(|pc| pc.accepted_transfer_syntax())
                        .map(str::to_string)
                };
                let Some(transfer_syntax) = transfer_syntax else {
                    return Err(unexpected_fragment(pc_id));
                };
                let data = if message.command_field() == CommandField::CStoreRq {
                    let factory = shared.store_sink.clone();
                    let sink = tokio::task::spawn_blocking(move || factory.create())
                        .await
                        .context(SpoolTaskSnafu)?
                        .context(SpoolSnafu)?;
                    DataBuffer::Sink(sink)
                } else {
                    DataBuffer::Memory(Vec::new())
                };
                self.partial = Some(Partial {
                    message,
                    presentation_context_id: pc_id,
                    transfer_syntax,
                    data,
                });
                Ok(None)
            }
            PDataValueType::Data => {
                let Some(partial) = self.partial.as_mut() else {
                    return Err(unexpected_fragment(pc_id));
                };
                if partial.presentation_context_id != pc_id {
                    return Err(unexpected_fragment(pc_id));
                }
                let data = std::mem::replace(&mut partial.data, DataBuffer::Memory(Vec::new()));
                partial.data = match data {
                    DataBuffer::Memory(mut buffer) => {
                        let limit = shared.options.max_dataset_size;
                        ensure_within(buffer.len(), pdv.data.len(), limit, "data set")?;
                        buffer.extend_from_slice(&pdv.data);
                        DataBuffer::Memory(buffer)
                    }
                    DataBuffer::Sink(sink) => DataBuffer::Sink(spool(sink, pdv.data).await?),
                };
                if !pdv.is_last {
                    return Ok(None);
                }
                let Some(partial) = self.partial.take() else {
                    return Ok(None);
                };
                let source = match partial.data {
                    DataBuffer::Memory(bytes) => DatasetSource::Memory(bytes),
                    DataBuffer::Sink(sink) => DatasetSource::Spooled(sink),
                };
                Ok(Some((
                    partial.message,
                    Some(IncomingDataset {
                        transfer_syntax: partial.transfer_syntax,
                        source,
                    }),
                )))
            }
        }
    }
}

/// Fail if `incoming` more bytes would take a buffer of `current` bytes over `limit`.
fn ensure_within(current: usize, incoming: usize, limit: u32, what: &'static str) -> Result<()> {
    snafu::ensure!(
        current.saturating_add(incoming) <= limit as usize,
        TooLargeSnafu { what, limit }
    );
    Ok(())
}

/// Write a fragment into a store sink off the async runtime.
async fn spool(mut sink: Box<dyn StoreSink>, data: Vec<u8>) -> Result<Box<dyn StoreSink>> {
    tokio::task::spawn_blocking(move || sink.write_all(&data).map(|_| sink))
        .await
        .context(SpoolTaskSnafu)?
        .context(SpoolSnafu)
}

fn unexpected_fragment(presentation_context_id: u8) -> Error {
    UnexpectedFragmentSnafu {
        presentation_context_id,
    }
    .build()
}

async fn read_pdu_async<R>(reader: &mut R, max_pdu_length: u32, strict: bool) -> Result<Option<Pdu>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; PDU_HEADER_SIZE as usize];
    match reader.read_exact(&mut header[..1]).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context(ReadPduSnafu),
    }
    reader
        .read_exact(&mut header[1..])
        .await
        .context(ReadPduSnafu)?;
    let header = PduHeader::parse(header);
    header
        .check_length(max_pdu_length, strict)
        .context(DecodePduSnafu)?;
    let mut payload = vec![0; header.length as usize];
    reader.read_exact(&mut payload).await.context(ReadPduSnafu)?;
    decode_pdu(header.pdu_type, &payload)
        .context(DecodePduSnafu)
        .map(Some)
}

async fn read_loop<R>(shared: Arc<Shared>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut assembler = Assembler::default();
    let max_pdu_length = shared.options.max_pdu_length;
    let strict = shared.options.strict;
    loop {
        let result = tokio::select! {
            _ = shared.closed.cancelled() => break,
            result = read_pdu_async(&mut reader, max_pdu_length, strict) => result,
        };
        let pdu = match result {
            Ok(Some(pdu)) => pdu,
            Ok(None) => {
                debug!("Connection closed by peer");
                break;
            }
            Err(e @ Error::DecodePdu { .. }) => {
                warn!("{}", snafu::Report::from_error(e));
                shared
                    .abort(AbortRQSource::ServiceProvider(
                        AbortRQServiceProviderReason::InvalidPduParameter,
                    ))
                    .await;
                break;
            }
            Err(e) => {
                warn!("{}", snafu::Report::from_error(e));
                break;
            }
        };
        trace!("<- {}", pdu.short_description());
        match shared.handle_pdu(pdu, &mut assembler).await {
            Flow::Continue => {}
            Flow::Close => break,
            Flow::Abort(reason) => {
                shared
                    .abort(AbortRQSource::ServiceProvider(reason))
                    .await;
                break;
            }
        }
    }
    shared.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(16_384, 16_378)]
    #[case(16_385, 16_378)]
    #[case(1_048_576, 1_048_570)]
    #[case(4, 2)]
    fn fragments_are_even(#[case] max: u32, #[case] expected: usize) {
        assert_eq!(fragment_size(max), expected);
    }

    #[test]
    fn spooled_data_sets_are_read_back() {
        let mut sink = TempFileSinkFactory.create().unwrap();
        sink.write_all(b"\x08\x00\x16\x00").unwrap();
        sink.write_all(b"\x00\x00").unwrap();
        let mut reader = sink.into_reader().unwrap();
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, b"\x08\x00\x16\x00\x00\x00");
    }
}
