//! Association acceptor.
//!
//! A [`Server`] listens for TCP connections,
//! negotiates each incoming association
//! and hands the requests received over it to a [`Dispatcher`].
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use dicom_net_dimse::dispatch::Dispatcher;
//! # use dicom_net_dimse::server::{Server, ServerOptions};
//! # use tokio_util::sync::CancellationToken;
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Server::new(
//!     ServerOptions::new().ae_title("STORE-SCP").accept_called_ae_title(),
//!     Arc::new(Dispatcher::default()),
//! );
//! server.run("0.0.0.0:11111", CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dicom_net_ul::association::syntax::{is_supported, trim_uid, APPLICATION_CONTEXT_NAME};
use dicom_net_ul::association::{
    AcceptAny, AcceptCalledAeTitle, AccessControl, Association,
};
use dicom_net_ul::pdu::{
    AssociationRJ, AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource,
    AssociationRQ, UserVariableItem,
};
use snafu::{Backtrace, ResultExt, Snafu};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::options::ServiceOptions;
use crate::pump::{
    ConnectionEvent, Negotiator, Pump, PumpBuilder, StoreSinkFactory, TempFileSinkFactory,
};
use crate::transport::Stream;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not bind the listening socket
    Bind {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not obtain the listening address
    LocalAddress {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The only protocol version defined by the standard.
const PROTOCOL_VERSION: u16 = 1;

/// Options of a [`Server`].
#[derive(Clone)]
pub struct ServerOptions {
    /// the AE title of this node
    ae_title: Cow<'static, str>,
    access_control: Arc<dyn AccessControl>,
    /// abstract syntaxes accepted besides those the dispatcher serves
    abstract_syntaxes: Vec<Cow<'static, str>>,
    /// transfer syntaxes accepted, any supported one if empty
    transfer_syntaxes: Vec<Cow<'static, str>>,
    /// whether to accept any abstract syntax
    promiscuous: bool,
    max_connections: usize,
    /// how often to check for headroom while at capacity
    poll_interval: Duration,
    max_async_ops_invoked: u16,
    max_async_ops_performed: u16,
    service: ServiceOptions,
    store_sink: Arc<dyn StoreSinkFactory>,
    #[cfg(feature = "tls")]
    tls_config: Option<Arc<rustls::ServerConfig>>,
}

impl std::fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerOptions")
            .field("ae_title", &self.ae_title)
            .field("abstract_syntaxes", &self.abstract_syntaxes)
            .field("transfer_syntaxes", &self.transfer_syntaxes)
            .field("promiscuous", &self.promiscuous)
            .field("max_connections", &self.max_connections)
            .field("poll_interval", &self.poll_interval)
            .field("max_async_ops_invoked", &self.max_async_ops_invoked)
            .field("max_async_ops_performed", &self.max_async_ops_performed)
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            ae_title: "THIS-SCP".into(),
            access_control: Arc::new(AcceptAny),
            abstract_syntaxes: Vec::new(),
            transfer_syntaxes: Vec::new(),
            promiscuous: false,
            max_connections: 10,
            poll_interval: Duration::from_millis(10),
            max_async_ops_invoked: 1,
            max_async_ops_performed: 1,
            service: ServiceOptions::default(),
            store_sink: Arc::new(TempFileSinkFactory),
            #[cfg(feature = "tls")]
            tls_config: None,
        }
    }
}

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the application entity title referring to this DICOM node.
    ///
    /// The default is `THIS-SCP`.
    pub fn ae_title<T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.ae_title = ae_title.into();
        self
    }

    /// Accept any incoming association request, which is the default.
    pub fn accept_any(self) -> Self {
        self.access_control(AcceptAny)
    }

    /// Only accept association requests calling this node's AE title.
    pub fn accept_called_ae_title(self) -> Self {
        self.access_control(AcceptCalledAeTitle)
    }

    pub fn access_control<A>(mut self, access_control: A) -> Self
    where
        A: AccessControl + 'static,
    {
        self.access_control = Arc::new(access_control);
        self
    }

    /// Accept this abstract syntax,
    /// in addition to those served by the dispatcher.
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.abstract_syntaxes
            .push(trim_cow(abstract_syntax_uid.into()));
        self
    }

    /// Restrict accepted transfer syntaxes to the ones given.
    ///
    /// By default, any transfer syntax supported by the registry is accepted.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.transfer_syntaxes
            .push(trim_cow(transfer_syntax_uid.into()));
        self
    }

    /// Override promiscuous mode:
    /// whether to accept unknown abstract syntaxes.
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    /// The maximum number of simultaneous connections.
    /// Further connections wait in the listen backlog.
    ///
    /// The default is 10.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The asynchronous operations this node is willing to invoke and perform,
    /// 0 meaning unlimited.
    pub fn async_ops_window(mut self, invoked: u16, performed: u16) -> Self {
        self.max_async_ops_invoked = invoked;
        self.max_async_ops_performed = performed;
        self
    }

    pub fn service_options(mut self, options: ServiceOptions) -> Self {
        self.service = options;
        self
    }

    /// Where incoming C-STORE data sets are spooled.
    pub fn store_sink(mut self, factory: Arc<dyn StoreSinkFactory>) -> Self {
        self.store_sink = factory;
        self
    }

    /// Accept TLS connections only.
    #[cfg(feature = "tls")]
    pub fn tls_config(mut self, config: impl Into<Arc<rustls::ServerConfig>>) -> Self {
        self.tls_config = Some(config.into());
        self
    }
}

fn trim_cow(uid: Cow<'static, str>) -> Cow<'static, str> {
    match uid {
        Cow::Borrowed(uid) => Cow::Borrowed(trim_uid(uid)),
        Cow::Owned(uid) => Cow::Owned(trim_uid(&uid).to_string()),
    }
}

fn rejection(reason: AssociationRJServiceUserReason) -> AssociationRJ {
    AssociationRJ {
        result: AssociationRJResult::Permanent,
        source: AssociationRJSource::ServiceUser(reason),
    }
}

/// Negotiates incoming associations on behalf of a server.
#[derive(Debug)]
pub struct ServerNegotiator {
    options: Arc<ServerOptions>,
    dispatcher: Arc<Dispatcher>,
}

impl ServerNegotiator {
    pub fn new(options: Arc<ServerOptions>, dispatcher: Arc<Dispatcher>) -> Self {
        ServerNegotiator {
            options,
            dispatcher,
        }
    }

    fn abstract_syntax_supported(&self, abstract_syntax: &str) -> bool {
        self.options.promiscuous
            || self
                .options
                .abstract_syntaxes
                .iter()
                .any(|uid| uid == abstract_syntax)
            || self.dispatcher.supports(abstract_syntax)
    }

    fn transfer_syntax_supported(&self, transfer_syntax: &str) -> bool {
        let transfer_syntaxes = &self.options.transfer_syntaxes;
        is_supported(transfer_syntax)
            && (transfer_syntaxes.is_empty()
                || transfer_syntaxes.iter().any(|uid| uid == transfer_syntax))
    }
}

impl Negotiator for ServerNegotiator {
    fn negotiate(&self, rq: &AssociationRQ) -> Result<Association, AssociationRJ> {
        if rq.protocol_version != PROTOCOL_VERSION {
            warn!("Unsupported protocol version {}", rq.protocol_version);
            return Err(rejection(AssociationRJServiceUserReason::NoReasonGiven));
        }
        if trim_uid(&rq.application_context_name) != APPLICATION_CONTEXT_NAME {
            warn!(
                "Unsupported application context {}",
                rq.application_context_name
            );
            return Err(rejection(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            ));
        }

        let user_identity = rq.user_variables.iter().find_map(|item| match item {
            UserVariableItem::UserIdentityItem(identity) => Some(identity),
            _ => None,
        });
        self.options
            .access_control
            .check_access(
                &self.options.ae_title,
                &rq.calling_ae_title,
                &rq.called_ae_title,
                user_identity,
            )
            .map_err(|reason| {
                info!(
                    "Rejecting association from {} ({})",
                    rq.calling_ae_title, reason
                );
                rejection(reason)
            })?;

        let mut association =
            Association::from_association_rq(rq, self.options.service.get_max_pdu_length())
                .map_err(|e| {
                    warn!("{}", snafu::Report::from_error(e));
                    rejection(AssociationRJServiceUserReason::NoReasonGiven)
                })?;
        association.limit_async_ops(
            self.options.max_async_ops_invoked,
            self.options.max_async_ops_performed,
        );
        association.presentation_contexts_mut().negotiate(
            |abstract_syntax| self.abstract_syntax_supported(abstract_syntax),
            |transfer_syntax| self.transfer_syntax_supported(transfer_syntax),
        );
        for pc in association.presentation_contexts().iter() {
            debug!(
                "Presentation context {} ({}): {:?}",
                pc.id(),
                pc.abstract_syntax(),
                pc.result()
            );
        }
        Ok(association)
    }
}

/// The connections currently open on a server.
#[derive(Debug)]
pub struct ConnectionRegistry {
    max_connections: usize,
    poll_interval: Duration,
    active: Mutex<HashMap<u64, Pump>>,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize, poll_interval: Duration) -> Self {
        ConnectionRegistry {
            max_connections,
            poll_interval,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active().len()
    }

    pub fn has_headroom(&self) -> bool {
        self.active_count() < self.max_connections
    }

    /// Wait until there is room for one more connection.
    ///
    /// Returns `false` if `shutdown` was cancelled first.
    pub async fn wait_for_headroom(&self, shutdown: &CancellationToken) -> bool {
        let mut warned = false;
        loop {
            if shutdown.is_cancelled() {
                return false;
            }
            if self.has_headroom() {
                return true;
            }
            if !warned {
                debug!(
                    "Maximum of {} connections reached, waiting",
                    self.max_connections
                );
                warned = true;
            }
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    fn register(&self, pump: Pump) {
        self.active().insert(pump.id(), pump);
    }

    fn deregister(&self, id: u64) {
        self.active().remove(&id);
    }

    fn take_all(&self) -> Vec<Pump> {
        self.active().drain().map(|(_, pump)| pump).collect()
    }

    fn active(&self) -> MutexGuard<'_, HashMap<u64, Pump>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A DICOM server.
#[derive(Debug, Clone)]
pub struct Server {
    options: Arc<ServerOptions>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ConnectionRegistry>,
}

impl Server {
    pub fn new(options: ServerOptions, dispatcher: Arc<Dispatcher>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(
            options.max_connections,
            options.poll_interval,
        ));
        Server {
            options: Arc::new(options),
            dispatcher,
            registry,
        }
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Listen on the given address until `shutdown` is cancelled.
    pub async fn run<A>(&self, addr: A, shutdown: CancellationToken) -> Result<()>
    where
        A: ToSocketAddrs,
    {
        let listener = TcpListener::bind(addr).await.context(BindSnafu)?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections from the given listener until `shutdown` is cancelled.
    ///
    /// Open connections are aborted on shutdown.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local_addr = listener.local_addr().context(LocalAddressSnafu)?;
        info!(
            "{} listening on: tcp://{}",
            self.options.ae_title, local_addr
        );

        while self.registry.wait_for_headroom(&shutdown).await {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (socket, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Could not accept connection: {}", e);
                    continue;
                }
            };
            debug!("Accepted connection from {}", peer);
            if let Err(e) = socket.set_nodelay(true) {
                debug!("Could not set TCP_NODELAY: {}", e);
            }

            #[cfg(feature = "tls")]
            if let Some(config) = &self.options.tls_config {
                let server = self.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    match crate::transport::accept_tls(config, socket).await {
                        Ok(stream) => {
                            server.serve_stream(stream);
                        }
                        Err(e) => warn!("{}", snafu::Report::from_error(e)),
                    }
                });
                continue;
            }

            self.serve_stream(socket);
        }

        let open = self.registry.take_all();
        info!("Shutting down, aborting {} connections", open.len());
        for pump in open {
            pump.abort().await;
        }
        Ok(())
    }

    /// Serve one already established connection.
    pub fn serve_stream<S>(&self, stream: S) -> Pump
    where
        S: Stream + 'static,
    {
        let negotiator = ServerNegotiator::new(self.options.clone(), self.dispatcher.clone());
        let (pump, events) = PumpBuilder::new(self.options.service.clone())
            .negotiator(Arc::new(negotiator))
            .handler(self.dispatcher.clone())
            .store_sink(self.options.store_sink.clone())
            .spawn(stream);
        self.registry.register(pump.clone());
        tokio::spawn(watch_connection(
            pump.clone(),
            events,
            self.registry.clone(),
        ));
        pump
    }
}

/// Log the lifecycle of a connection, removing it from the registry once closed.
async fn watch_connection(
    pump: Pump,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    registry: Arc<ConnectionRegistry>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::AssociationRequested(rq) => debug!(
                "Association requested by {} (called {})",
                rq.calling_ae_title, rq.called_ae_title
            ),
            ConnectionEvent::AssociationAccepted(association) => info!(
                "New association from {}",
                association.calling_ae_title()
            ),
            ConnectionEvent::AssociationRejected(rj) => {
                info!("Association rejected: {:?}", rj.source)
            }
            ConnectionEvent::ReleaseRequested => debug!("Release requested"),
            ConnectionEvent::Released => info!("Released association"),
            ConnectionEvent::Aborted(source) => warn!("Association aborted ({:?})", source),
            ConnectionEvent::Closed => break,
        }
    }
    debug!("Connection {} closed", pump.id());
    registry.deregister(pump.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_net_ul::association::syntax::{EXPLICIT_VR_LITTLE_ENDIAN, VERIFICATION};
    use dicom_net_ul::association::{AeTitlePolicy, NegotiationResult};
    use dicom_net_ul::pdu::PresentationContextResultReason;
    use matches::matches;

    const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";

    fn request(called: &str, abstract_syntaxes: &[&str]) -> AssociationRQ {
        let mut association = Association::new("SCU", called, AeTitlePolicy::Reject).unwrap();
        for abstract_syntax in abstract_syntaxes {
            association
                .presentation_contexts_mut()
                .add(*abstract_syntax, [EXPLICIT_VR_LITTLE_ENDIAN])
                .unwrap();
        }
        association.to_association_rq()
    }

    fn negotiator(options: ServerOptions) -> ServerNegotiator {
        ServerNegotiator::new(Arc::new(options), Arc::new(Dispatcher::default()))
    }

    #[test]
    fn unserved_abstract_syntaxes_are_not_supported() {
        let negotiator = negotiator(ServerOptions::new());
        let association = negotiator
            .negotiate(&request("ANY-SCP", &[VERIFICATION, CT_IMAGE_STORAGE]))
            .unwrap();
        let contexts = association.presentation_contexts();
        assert!(contexts.get(1).unwrap().is_accepted());
        assert_eq!(
            contexts.get(3).unwrap().result(),
            NegotiationResult::Rejected(PresentationContextResultReason::AbstractSyntaxNotSupported)
        );
    }

    #[test]
    fn configured_abstract_syntaxes_are_accepted() {
        let negotiator = negotiator(ServerOptions::new().with_abstract_syntax(CT_IMAGE_STORAGE));
        let association = negotiator
            .negotiate(&request("ANY-SCP", &[CT_IMAGE_STORAGE]))
            .unwrap();
        assert_eq!(
            association
                .presentation_contexts()
                .get(1)
                .unwrap()
                .accepted_transfer_syntax(),
            Some(EXPLICIT_VR_LITTLE_ENDIAN)
        );
    }

    #[test]
    fn wrong_called_ae_title_is_rejected() {
        let negotiator = negotiator(
            ServerOptions::new()
                .ae_title("STORE-SCP")
                .accept_called_ae_title(),
        );
        let rejection = negotiator
            .negotiate(&request("OTHER-SCP", &[VERIFICATION]))
            .unwrap_err();
        assert!(matches!(
            rejection.source,
            AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized
            )
        ));
        assert!(negotiator
            .negotiate(&request("STORE-SCP", &[VERIFICATION]))
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn admission_waits_for_headroom() {
        let registry = Arc::new(ConnectionRegistry::new(1, Duration::from_millis(10)));
        let (stream, _peer) = tokio::io::duplex(1024);
        let (pump, _events) = PumpBuilder::new(ServiceOptions::default()).spawn(stream);
        registry.register(pump.clone());
        assert!(!registry.has_headroom());

        let shutdown = CancellationToken::new();
        let waiting = {
            let registry = registry.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { registry.wait_for_headroom(&shutdown).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        registry.deregister(pump.id());
        assert!(waiting.await.unwrap());

        registry.register(pump.clone());
        shutdown.cancel();
        assert!(!registry.wait_for_headroom(&shutdown).await);
    }
}
