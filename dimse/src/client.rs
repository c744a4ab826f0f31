//! Association requester.
//!
//! A [`Client`] collects requests,
//! then sends them all on [`send`](Client::send),
//! opening as many associations as it takes:
//! connect, request an association proposing
//! the presentation contexts the requests need,
//! send the requests within the negotiated operations window,
//! linger for late requests, and release.
//!
//! # Example
//!
//! ```no_run
//! # use dicom_net_dimse::client::{CancellationMode, Client, ClientOptions};
//! # use dicom_net_dimse::message::DimseMessage;
//! # use tokio_util::sync::CancellationToken;
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(
//!     "192.168.0.5",
//!     104,
//!     ClientOptions::new().calling_ae_title("ECHO-SCU").called_ae_title("PACS"),
//! );
//! let echo = client.add_request(DimseMessage::c_echo_rq(client.next_message_id()))?;
//! client.send(CancellationToken::new(), CancellationMode::Graceful).await?;
//! let (responses, _) = echo.collect().await;
//! # Ok(())
//! # }
//! ```
use std::borrow::Cow;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dicom_net_ul::association::{AeTitlePolicy, Association, ExtendedNegotiation};
use dicom_net_ul::pdu::{AbortRQSource, AssociationRJ, UserIdentity};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::message::{CommandField, DimseMessage, MessageIdGenerator};
use crate::options::ServiceOptions;
use crate::pump::{ConnectionEvent, Pump, PumpBuilder, RequestEvent, RequestHandle, RequestHandler};
use crate::transport::{Connector, TcpConnector};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("the client is already sending"))]
    AlreadySending { backtrace: Backtrace },

    #[snafu(display("{:?} is not a request expecting a response", command_field))]
    InvalidRequest {
        command_field: CommandField,
        backtrace: Backtrace,
    },

    #[snafu(display("request has no message ID"))]
    MissingMessageId { backtrace: Backtrace },

    /// could not connect to the remote node
    Connect {
        source: crate::transport::Error,
    },

    /// could not prepare the association request
    Association {
        source: dicom_net_ul::association::Error,
    },

    /// message pump failure
    Pump { source: crate::pump::Error },

    #[snafu(display("association rejected: {:?}, {:?}", rejection.result, rejection.source))]
    Rejected {
        rejection: AssociationRJ,
        backtrace: Backtrace,
    },

    #[snafu(display("association aborted ({:?})", abort_source))]
    Aborted {
        abort_source: AbortRQSource,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "association request timed out {} consecutive times after {:?}",
        attempts,
        timeout
    ))]
    AssociationTimeout {
        attempts: u32,
        timeout: Duration,
        backtrace: Backtrace,
    },

    #[snafu(display("connection closed unexpectedly"))]
    ConnectionClosed { backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The state of a client while sending.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ClientState {
    Idle,
    Connecting,
    AssociationRequesting,
    Associated,
    SendingRequests,
    Lingering,
    ReleasingAssociation,
    Aborting,
    Rejected,
    Aborted,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// What to do with an open association when sending is cancelled.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CancellationMode {
    /// Stop sending new requests,
    /// wait for the pending ones up to the grace period,
    /// then release the association.
    #[default]
    Graceful,
    /// Abort the association right away,
    /// even in the middle of a message.
    Immediate,
}

/// Options of a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// the calling AE title
    calling_ae_title: Cow<'static, str>,
    /// the called AE title
    called_ae_title: Cow<'static, str>,
    ae_title_policy: AeTitlePolicy,
    /// how long to wait for the association to be accepted
    association_timeout: Duration,
    /// consecutive association request timeouts before giving up
    max_association_timeouts: u32,
    /// how long to keep an idle association open
    linger_timeout: Duration,
    /// how long to wait for the release reply
    release_timeout: Duration,
    /// how long to wait for pending responses on graceful cancellation
    grace_period: Duration,
    max_requests_per_association: Option<usize>,
    max_async_ops_invoked: u16,
    max_async_ops_performed: u16,
    /// presentation contexts proposed besides those the requests need
    presentation_contexts: Vec<(String, Vec<String>)>,
    /// SCU/SCP roles proposed per abstract syntax
    role_selections: Vec<(String, bool, bool)>,
    extended_negotiations: Vec<ExtendedNegotiation>,
    user_identity: Option<UserIdentity>,
    service: ServiceOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: "ANY-SCP".into(),
            ae_title_policy: AeTitlePolicy::default(),
            association_timeout: Duration::from_secs(5),
            max_association_timeouts: 3,
            linger_timeout: Duration::from_millis(50),
            release_timeout: Duration::from_secs(10),
            grace_period: Duration::from_secs(10),
            max_requests_per_association: None,
            max_async_ops_invoked: 1,
            max_async_ops_performed: 1,
            presentation_contexts: Vec::new(),
            role_selections: Vec::new(),
            extended_negotiations: Vec::new(),
            user_identity: None,
            service: ServiceOptions::default(),
        }
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title,
    /// which refers to this DICOM node.
    ///
    /// The default is `THIS-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title,
    /// which refers to the target DICOM node.
    ///
    /// The default is `ANY-SCP`.
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.called_ae_title = called_ae_title.into();
        self
    }

    /// What to do with AE titles longer than 16 characters.
    pub fn ae_title_policy(mut self, policy: AeTitlePolicy) -> Self {
        self.ae_title_policy = policy;
        self
    }

    /// The default is 5 seconds.
    pub fn association_timeout(mut self, timeout: Duration) -> Self {
        self.association_timeout = timeout;
        self
    }

    /// Give up after this many consecutive association request timeouts.
    ///
    /// The default is 3.
    pub fn max_association_timeouts(mut self, attempts: u32) -> Self {
        self.max_association_timeouts = attempts.max(1);
        self
    }

    /// Keep an idle association open for this long,
    /// in case more requests are added.
    /// Zero releases the association as soon as it is idle.
    ///
    /// The default is 50 milliseconds.
    pub fn linger_timeout(mut self, timeout: Duration) -> Self {
        self.linger_timeout = timeout;
        self
    }

    pub fn release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = timeout;
        self
    }

    /// How long graceful cancellation waits for pending responses.
    pub fn grace_period(mut self, period: Duration) -> Self {
        self.grace_period = period;
        self
    }

    /// Release and re-associate after this many requests.
    pub fn max_requests_per_association(mut self, max: usize) -> Self {
        self.max_requests_per_association = Some(max.max(1));
        self
    }

    /// The asynchronous operations window to propose,
    /// 0 meaning unlimited.
    pub fn async_ops_window(mut self, invoked: u16, performed: u16) -> Self {
        self.max_async_ops_invoked = invoked;
        self.max_async_ops_performed = performed;
        self
    }

    /// Always propose this presentation context.
    pub fn with_presentation_context<A, T>(mut self, abstract_syntax: A, transfer_syntaxes: Vec<T>) -> Self
    where
        A: Into<String>,
        T: Into<String>,
    {
        self.presentation_contexts.push((
            abstract_syntax.into(),
            transfer_syntaxes.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Propose the given roles for an abstract syntax,
    /// such as the SCP role for storage classes retrieved with C-GET.
    pub fn with_role_selection(mut self, abstract_syntax: impl Into<String>, scu: bool, scp: bool) -> Self {
        self.role_selections.push((abstract_syntax.into(), scu, scp));
        self
    }

    pub fn with_extended_negotiation(mut self, negotiation: ExtendedNegotiation) -> Self {
        self.extended_negotiations.push(negotiation);
        self
    }

    pub fn with_user_identity(mut self, identity: UserIdentity) -> Self {
        self.user_identity = Some(identity);
        self
    }

    pub fn service_options(mut self, options: ServiceOptions) -> Self {
        self.service = options;
        self
    }
}

struct Queued {
    message: DimseMessage,
    events: mpsc::UnboundedSender<RequestEvent>,
}

impl Queued {
    fn fail(self) {
        let _ = self.events.send(RequestEvent::ConnectionClosed);
    }
}

enum AssociationOutcome {
    Accepted,
    Rejected(AssociationRJ),
    Aborted(AbortRQSource),
    Closed,
}

/// A DICOM client, sending queued requests to one remote node.
pub struct Client {
    host: String,
    port: u16,
    options: ClientOptions,
    connector: Arc<dyn Connector>,
    handler: Option<Arc<dyn RequestHandler>>,
    message_ids: MessageIdGenerator,
    queue: Mutex<VecDeque<Queued>>,
    more_requests: Notify,
    state: watch::Sender<ClientState>,
    sending: AtomicBool,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("options", &self.options)
            .field("state", &self.state())
            .field("queued", &self.queued_count())
            .finish()
    }
}

/// Resets the sending flag, even if sending is dropped midway.
struct SendingGuard<'a>(&'a Client);

impl Drop for SendingGuard<'_> {
    fn drop(&mut self) {
        self.0.set_state(ClientState::Idle);
        self.0.sending.store(false, Ordering::Release);
    }
}

impl Client {
    /// A client connecting through plain TCP.
    pub fn new(host: impl Into<String>, port: u16, options: ClientOptions) -> Self {
        Client {
            host: host.into(),
            port,
            options,
            connector: Arc::new(TcpConnector::default()),
            handler: None,
            message_ids: MessageIdGenerator::new(),
            queue: Mutex::new(VecDeque::new()),
            more_requests: Notify::new(),
            state: watch::Sender::new(ClientState::Idle),
            sending: AtomicBool::new(false),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Handle requests issued by the remote node over the client's associations,
    /// such as the C-STORE sub-operations of a C-GET.
    pub fn with_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// A fresh message ID for the next request.
    pub fn next_message_id(&self) -> u16 {
        self.message_ids.next_id()
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    pub fn queued_count(&self) -> usize {
        self.queue().len()
    }

    /// Queue a request, to be sent on the next or current call to [`send`](Self::send).
    pub fn add_request(&self, message: DimseMessage) -> Result<RequestHandle> {
        let command_field = message.command_field();
        ensure!(
            command_field.expects_response(),
            InvalidRequestSnafu { command_field }
        );
        let message_id = message.message_id().context(MissingMessageIdSnafu)?;
        let (events, rx) = mpsc::unbounded_channel();
        self.queue().push_back(Queued { message, events });
        self.more_requests.notify_waiters();
        Ok(RequestHandle::new(message_id, rx))
    }

    /// Send all queued requests, including those added while sending.
    ///
    /// Returns once the queue is empty and the last association is closed,
    /// or as soon as `cancel` is cancelled and the association
    /// was dealt with according to `mode`.
    /// Cancelling before anything was sent performs no network activity.
    pub async fn send(&self, cancel: CancellationToken, mode: CancellationMode) -> Result<()> {
        ensure!(
            !self.sending.swap(true, Ordering::AcqRel),
            AlreadySendingSnafu
        );
        let _guard = SendingGuard(self);
        self.send_all(&cancel, mode).await
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Queued>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ClientState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Client state: {} -> {}", previous, state);
        }
    }

    fn max_requests(&self) -> usize {
        self.options.max_requests_per_association.unwrap_or(usize::MAX)
    }

    /// Take queued requests while the association has room for them.
    fn take_more(&self, batch: &mut Vec<Queued>, already_sent: usize) {
        let mut queue = self.queue();
        while already_sent + batch.len() < self.max_requests() {
            match queue.pop_front() {
                Some(queued) => batch.push(queued),
                None => break,
            }
        }
    }

    fn requeue(&self, batch: Vec<Queued>) {
        let mut queue = self.queue();
        for queued in batch.into_iter().rev() {
            queue.push_front(queued);
        }
    }

    fn build_association(&self, batch: &[Queued]) -> Result<Association> {
        let options = &self.options;
        let mut association = Association::new(
            &options.calling_ae_title,
            &options.called_ae_title,
            options.ae_title_policy,
        )
        .context(AssociationSnafu)?
        .with_max_pdu_length(options.service.max_pdu_length)
        .with_async_ops_window(options.max_async_ops_invoked, options.max_async_ops_performed);
        if let Some(identity) = &options.user_identity {
            association = association.with_user_identity(identity.clone());
        }
        for negotiation in &options.extended_negotiations {
            association = association.with_extended_negotiation(negotiation.clone());
        }

        let contexts = association.presentation_contexts_mut();
        for queued in batch {
            let message = &queued.message;
            let abstract_syntax = message.sop_class_uid().unwrap_or_default();
            if message.command_field() == CommandField::CStoreRq {
                contexts
                    .add_for_store(
                        &abstract_syntax,
                        message.transfer_syntax(),
                        message.additional_transfer_syntaxes(),
                    )
                    .context(AssociationSnafu)?;
            } else {
                contexts
                    .add_for_service(&abstract_syntax)
                    .context(AssociationSnafu)?;
            }
        }
        for (abstract_syntax, transfer_syntaxes) in &options.presentation_contexts {
            contexts
                .add(abstract_syntax.as_str(), transfer_syntaxes.iter().cloned())
                .context(AssociationSnafu)?;
        }
        for (abstract_syntax, scu, scp) in &options.role_selections {
            for pc in contexts.iter_mut() {
                if pc.abstract_syntax() == abstract_syntax {
                    pc.set_roles(*scu, *scp);
                }
            }
        }
        Ok(association)
    }

    async fn send_all(&self, cancel: &CancellationToken, mode: CancellationMode) -> Result<()> {
        let mut timeouts = 0;
        let mut retry: Vec<Queued> = Vec::new();

        loop {
            if cancel.is_cancelled() {
                info!("Sending cancelled");
                self.requeue(retry);
                return Ok(());
            }
            if retry.is_empty() && self.queue().is_empty() {
                return Ok(());
            }

            self.set_state(ClientState::Connecting);
            let connected = tokio::select! {
                _ = cancel.cancelled() => None,
                stream = self.connector.connect(&self.host, self.port) => Some(stream),
            };
            let stream = match connected {
                None => {
                    info!("Sending cancelled");
                    self.requeue(retry);
                    return Ok(());
                }
                Some(Err(e)) => {
                    self.requeue(retry);
                    return Err(e).context(ConnectSnafu);
                }
                Some(Ok(stream)) => stream,
            };

            let mut batch = std::mem::take(&mut retry);
            self.take_more(&mut batch, 0);
            let association = match self.build_association(&batch) {
                Ok(association) => association,
                Err(e) => {
                    batch.into_iter().for_each(Queued::fail);
                    return Err(e);
                }
            };

            let mut builder = PumpBuilder::new(self.options.service.clone());
            if let Some(handler) = &self.handler {
                builder = builder.handler(handler.clone());
            }
            let (pump, mut events) = builder.spawn(stream);

            self.set_state(ClientState::AssociationRequesting);
            debug!(
                "Requesting association {} -> {}",
                self.options.calling_ae_title, self.options.called_ae_title
            );
            if let Err(e) = pump.request_association(association).await {
                batch.into_iter().for_each(Queued::fail);
                return Err(e).context(PumpSnafu);
            }
            let outcome = tokio::select! {
                _ = cancel.cancelled() => None,
                outcome = tokio::time::timeout(
                    self.options.association_timeout,
                    wait_for_association(&mut events),
                ) => Some(outcome),
            };

            match outcome {
                None => {
                    info!("Sending cancelled while requesting association");
                    self.set_state(ClientState::Aborting);
                    pump.abort().await;
                    self.requeue(batch);
                    return Ok(());
                }
                Some(Err(_)) => {
                    timeouts += 1;
                    warn!(
                        "Association request timed out after {:?} ({} of {})",
                        self.options.association_timeout,
                        timeouts,
                        self.options.max_association_timeouts
                    );
                    pump.abort().await;
                    if timeouts >= self.options.max_association_timeouts {
                        batch.into_iter().for_each(Queued::fail);
                        return AssociationTimeoutSnafu {
                            attempts: timeouts,
                            timeout: self.options.association_timeout,
                        }
                        .fail();
                    }
                    retry = batch;
                    continue;
                }
                Some(Ok(AssociationOutcome::Accepted)) => {
                    timeouts = 0;
                }
                Some(Ok(AssociationOutcome::Rejected(rejection))) => {
                    self.set_state(ClientState::Rejected);
                    batch.into_iter().for_each(Queued::fail);
                    return RejectedSnafu { rejection }.fail();
                }
                Some(Ok(AssociationOutcome::Aborted(abort_source))) => {
                    self.set_state(ClientState::Aborted);
                    batch.into_iter().for_each(Queued::fail);
                    return AbortedSnafu { abort_source }.fail();
                }
                Some(Ok(AssociationOutcome::Closed)) => {
                    batch.into_iter().for_each(Queued::fail);
                    return ConnectionClosedSnafu.fail();
                }
            }

            self.set_state(ClientState::Associated);
            self.run_association(&pump, &mut events, batch, cancel, mode)
                .await?;
        }
    }

    async fn run_association(
        &self,
        pump: &Pump,
        events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
        mut batch: Vec<Queued>,
        cancel: &CancellationToken,
        mode: CancellationMode,
    ) -> Result<()> {
        let mut sent = 0;
        let mut in_flight = FuturesUnordered::new();

        loop {
            self.set_state(ClientState::SendingRequests);
            debug!("Queueing {} requests", batch.len());
            sent += batch.len();
            for queued in batch.drain(..) {
                let token = match mode {
                    CancellationMode::Immediate => cancel.child_token(),
                    CancellationMode::Graceful => CancellationToken::new(),
                };
                match pump.send_request(queued.message, token) {
                    Ok(handle) => in_flight.push(forward(handle, queued.events)),
                    Err(_) => {
                        let _ = queued.events.send(RequestEvent::ConnectionClosed);
                    }
                }
            }

            let settled = tokio::select! {
                _ = cancel.cancelled() => false,
                _ = drain(&mut in_flight) => true,
            };
            if !settled {
                return self
                    .cancel_association(pump, events, &mut in_flight, mode)
                    .await;
            }
            if pump.is_closed() {
                return Err(self.closed_reason(events));
            }

            self.take_more(&mut batch, sent);
            if !batch.is_empty() {
                continue;
            }

            let linger = self.options.linger_timeout;
            if sent < self.max_requests() && !linger.is_zero() {
                self.set_state(ClientState::Lingering);
                debug!("Lingering on open association for {:?}", linger);
                let notified = self.more_requests.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.queue().is_empty() {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return self
                                .cancel_association(pump, events, &mut in_flight, mode)
                                .await;
                        }
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(linger) => {}
                        _ = pump.closed() => {}
                    }
                }
                if pump.is_closed() {
                    return Err(self.closed_reason(events));
                }
                self.take_more(&mut batch, sent);
                if !batch.is_empty() {
                    continue;
                }
            }
            break;
        }

        self.release(pump, events, Some(cancel)).await
    }

    async fn cancel_association<F>(
        &self,
        pump: &Pump,
        events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
        in_flight: &mut FuturesUnordered<F>,
        mode: CancellationMode,
    ) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Sending cancelled ({:?})", mode);
        match mode {
            CancellationMode::Immediate => {
                self.set_state(ClientState::Aborting);
                pump.abort().await;
            }
            CancellationMode::Graceful => {
                let withdrawn = pump.withdraw_queued();
                debug!(
                    "Withdrew {} requests, waiting for {} pending",
                    withdrawn,
                    pump.pending_count()
                );
                let grace_period = self.options.grace_period;
                if tokio::time::timeout(grace_period, drain(in_flight))
                    .await
                    .is_err()
                {
                    warn!(
                        "{} requests still pending after {:?}",
                        pump.pending_count(),
                        grace_period
                    );
                }
                if !pump.is_closed() {
                    self.release(pump, events, None).await?;
                }
            }
        }
        drain(in_flight).await;
        Ok(())
    }

    /// Release the association, aborting it if the peer does not reply in time.
    async fn release(
        &self,
        pump: &Pump,
        events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        self.set_state(ClientState::ReleasingAssociation);
        if let Err(e) = pump.release().await {
            if pump.is_closed() {
                return Err(self.closed_reason(events));
            }
            debug!("Could not release association: {}", e);
            self.set_state(ClientState::Aborting);
            pump.abort().await;
            return Ok(());
        }

        let wait = tokio::time::timeout(self.options.release_timeout, wait_for_release(events));
        let cancelled = async {
            match cancel {
                Some(cancel) => cancel.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = cancelled => {
                info!("Sending cancelled while releasing association");
                self.set_state(ClientState::Aborting);
                pump.abort().await;
                Ok(())
            }
            released = wait => match released {
                Ok(result) => {
                    pump.closed().await;
                    result
                }
                Err(_) => {
                    warn!(
                        "No release reply within {:?}, aborting",
                        self.options.release_timeout
                    );
                    self.set_state(ClientState::Aborting);
                    pump.abort().await;
                    Ok(())
                }
            }
        }
    }

    /// Find out why the connection closed.
    fn closed_reason(&self, events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> Error {
        while let Ok(event) = events.try_recv() {
            if let ConnectionEvent::Aborted(abort_source) = event {
                self.set_state(ClientState::Aborted);
                return AbortedSnafu { abort_source }.build();
            }
        }
        ConnectionClosedSnafu.build()
    }
}

async fn wait_for_association(
    events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
) -> AssociationOutcome {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::AssociationAccepted(_) => return AssociationOutcome::Accepted,
            ConnectionEvent::AssociationRejected(rj) => return AssociationOutcome::Rejected(rj),
            ConnectionEvent::Aborted(source) => return AssociationOutcome::Aborted(source),
            ConnectionEvent::Closed => return AssociationOutcome::Closed,
            _ => {}
        }
    }
    AssociationOutcome::Closed
}

async fn wait_for_release(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Released => {
                debug!("Association released");
                return Ok(());
            }
            ConnectionEvent::Aborted(abort_source) => return AbortedSnafu { abort_source }.fail(),
            ConnectionEvent::Closed => return ConnectionClosedSnafu.fail(),
            _ => {}
        }
    }
    ConnectionClosedSnafu.fail()
}

/// Relay the events of a request up to its final one.
async fn forward(mut handle: RequestHandle, events: mpsc::UnboundedSender<RequestEvent>) {
    while let Some(event) = handle.next_event().await {
        let last = match &event {
            RequestEvent::Response(response) => !response.status().map_or(false, |s| s.is_pending()),
            _ => true,
        };
        let _ = events.send(event);
        if last {
            return;
        }
    }
    let _ = events.send(RequestEvent::ConnectionClosed);
}

async fn drain<F>(in_flight: &mut FuturesUnordered<F>)
where
    F: Future<Output = ()>,
{
    while in_flight.next().await.is_some() {}
}
