//! Routing of incoming requests to service providers.
//!
//! A [`Dispatcher`] holds one provider per DIMSE service family,
//! each registered for the abstract syntaxes it serves,
//! and implements [`RequestHandler`] so that it can be plugged into a pump.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use dicom_net_ul::association::syntax::VERIFICATION;
use dicom_object::InMemDicomObject;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::message::{CommandField, DimseMessage, SubOperations};
use crate::pump::{IncomingDataset, IncomingRequest, Pump, RequestHandler, Responder};
use crate::status::{code, Status};

/// One response of a service provider.
#[derive(Debug, Clone)]
pub struct ServiceResponse {
    pub status: Status,
    pub dataset: Option<InMemDicomObject>,
    pub sub_operations: Option<SubOperations>,
}

impl ServiceResponse {
    pub fn new(status: Status) -> Self {
        ServiceResponse {
            status,
            dataset: None,
            sub_operations: None,
        }
    }

    /// A pending response carrying a matching identifier.
    pub fn pending(identifier: InMemDicomObject) -> Self {
        ServiceResponse::new(Status::pending()).with_dataset(identifier)
    }

    pub fn with_dataset(mut self, dataset: InMemDicomObject) -> Self {
        self.dataset = Some(dataset);
        self
    }

    pub fn with_sub_operations(mut self, sub_operations: SubOperations) -> Self {
        self.sub_operations = Some(sub_operations);
        self
    }
}

impl From<Status> for ServiceResponse {
    fn from(status: Status) -> Self {
        ServiceResponse::new(status)
    }
}

/// Responses to a C-FIND, C-GET or C-MOVE request:
/// any number of pending responses followed by one final response.
///
/// A stream ending on a pending response is completed with a success.
pub type ResponseStream = BoxStream<'static, ServiceResponse>;

/// What a provider is given besides the request.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    /// the pump the request came through,
    /// for C-GET sub-operations on the same association
    pub pump: Pump,
    /// cancelled when the peer sends a C-CANCEL for this request
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait CEchoProvider: Send + Sync {
    async fn on_c_echo(&self, request: &DimseMessage) -> Status;
}

#[async_trait]
pub trait CStoreProvider: Send + Sync {
    async fn on_c_store(&self, request: &DimseMessage, dataset: InMemDicomObject) -> Status;
}

pub trait CFindProvider: Send + Sync {
    fn on_c_find(
        &self,
        request: &DimseMessage,
        identifier: InMemDicomObject,
        context: ServiceContext,
    ) -> ResponseStream;
}

pub trait CGetProvider: Send + Sync {
    fn on_c_get(
        &self,
        request: &DimseMessage,
        identifier: InMemDicomObject,
        context: ServiceContext,
    ) -> ResponseStream;
}

pub trait CMoveProvider: Send + Sync {
    fn on_c_move(
        &self,
        request: &DimseMessage,
        identifier: InMemDicomObject,
        context: ServiceContext,
    ) -> ResponseStream;
}

/// Provider of the normalized services
/// (N-EVENT-REPORT, N-GET, N-SET, N-ACTION, N-CREATE, N-DELETE).
#[async_trait]
pub trait NServiceProvider: Send + Sync {
    async fn on_n_request(
        &self,
        request: &DimseMessage,
        dataset: Option<InMemDicomObject>,
    ) -> ServiceResponse;
}

/// Notified of C-CANCEL requests.
pub trait CancelListener: Send + Sync {
    fn on_c_cancel(&self, message_id_being_cancelled: u16);
}

/// The built-in verification provider, always answering with success.
#[derive(Debug, Default, Copy, Clone)]
pub struct EchoProvider;

#[async_trait]
impl CEchoProvider for EchoProvider {
    async fn on_c_echo(&self, _request: &DimseMessage) -> Status {
        Status::success()
    }
}

/// A provider along with the abstract syntaxes it serves,
/// no abstract syntaxes meaning any.
struct Registered<P: ?Sized> {
    abstract_syntaxes: Vec<String>,
    provider: Arc<P>,
}

impl<P: ?Sized> Registered<P> {
    fn new<I, T>(provider: Arc<P>, abstract_syntaxes: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Registered {
            abstract_syntaxes: abstract_syntaxes.into_iter().map(Into::into).collect(),
            provider,
        }
    }

    fn serves(&self, abstract_syntax: &str) -> bool {
        self.abstract_syntaxes.is_empty()
            || self.abstract_syntaxes.iter().any(|uid| uid == abstract_syntax)
    }
}

fn find<'a, P: ?Sized>(
    registered: &'a [Registered<P>],
    abstract_syntax: &str,
) -> Option<&'a Arc<P>> {
    registered
        .iter()
        .find(|r| r.serves(abstract_syntax))
        .map(|r| &r.provider)
}

/// Routes incoming requests to the registered providers.
pub struct Dispatcher {
    echo: Option<Arc<dyn CEchoProvider>>,
    store: Vec<Registered<dyn CStoreProvider>>,
    find: Vec<Registered<dyn CFindProvider>>,
    get: Vec<Registered<dyn CGetProvider>>,
    move_: Vec<Registered<dyn CMoveProvider>>,
    normalized: Vec<Registered<dyn NServiceProvider>>,
    cancel_listener: Option<Arc<dyn CancelListener>>,
    /// cancellation tokens of the requests being served,
    /// by connection and message ID
    in_flight: Mutex<HashMap<(u64, u16), CancellationToken>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher {
            echo: Some(Arc::new(EchoProvider)),
            store: Vec::new(),
            find: Vec::new(),
            get: Vec::new(),
            move_: Vec::new(),
            normalized: Vec::new(),
            cancel_listener: None,
            in_flight: Mutex::new(HashMap::new()),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("echo", &self.echo.is_some())
            .field("store", &self.store.len())
            .field("find", &self.find.len())
            .field("get", &self.get.len())
            .field("move", &self.move_.len())
            .field("normalized", &self.normalized.len())
            .finish()
    }
}

impl Dispatcher {
    /// A dispatcher answering C-ECHO requests and nothing else.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the built-in echo provider.
    pub fn with_echo(mut self, enabled: bool) -> Self {
        self.echo = if enabled {
            Some(Arc::new(EchoProvider))
        } else {
            None
        };
        self
    }

    pub fn with_echo_provider(mut self, provider: Arc<dyn CEchoProvider>) -> Self {
        self.echo = Some(provider);
        self
    }

    /// Register a storage provider for the given SOP classes,
    /// or for any SOP class if none are given.
    pub fn with_store<I, T>(mut self, provider: Arc<dyn CStoreProvider>, sop_classes: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.store.push(Registered::new(provider, sop_classes));
        self
    }

    pub fn with_find<I, T>(mut self, provider: Arc<dyn CFindProvider>, sop_classes: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.find.push(Registered::new(provider, sop_classes));
        self
    }

    pub fn with_get<I, T>(mut self, provider: Arc<dyn CGetProvider>, sop_classes: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.get.push(Registered::new(provider, sop_classes));
        self
    }

    pub fn with_move<I, T>(mut self, provider: Arc<dyn CMoveProvider>, sop_classes: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.move_.push(Registered::new(provider, sop_classes));
        self
    }

    pub fn with_normalized<I, T>(
        mut self,
        provider: Arc<dyn NServiceProvider>,
        sop_classes: I,
    ) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.normalized.push(Registered::new(provider, sop_classes));
        self
    }

    pub fn with_cancel_listener(mut self, listener: Arc<dyn CancelListener>) -> Self {
        self.cancel_listener = Some(listener);
        self
    }

    /// Whether some provider serves the given abstract syntax.
    pub fn supports(&self, abstract_syntax: &str) -> bool {
        (abstract_syntax == VERIFICATION && self.echo.is_some())
            || find(&self.store, abstract_syntax).is_some()
            || find(&self.find, abstract_syntax).is_some()
            || find(&self.get, abstract_syntax).is_some()
            || find(&self.move_, abstract_syntax).is_some()
            || find(&self.normalized, abstract_syntax).is_some()
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<(u64, u16), CancellationToken>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_cancel(&self, connection_id: u64, request: &DimseMessage) {
        let Some(message_id) = request.message_id_being_responded_to() else {
            debug!("Ignoring C-CANCEL without a message ID");
            return;
        };
        if let Some(token) = self.in_flight().get(&(connection_id, message_id)) {
            debug!("Cancelling request {}", message_id);
            token.cancel();
        }
        if let Some(listener) = &self.cancel_listener {
            listener.on_c_cancel(message_id);
        }
    }

    async fn single(&self, request: &DimseMessage, dataset: Option<IncomingDataset>) -> ServiceResponse {
        let sop_class_uid = request.sop_class_uid().unwrap_or_default();
        match request.command_field() {
            CommandField::CEchoRq => match &self.echo {
                Some(provider) => provider.on_c_echo(request).await.into(),
                None => unrecognized(),
            },
            CommandField::CStoreRq => {
                let Some(provider) = find(&self.store, &sop_class_uid) else {
                    return unrecognized();
                };
                let Some(dataset) = dataset else {
                    return Status::new(code::MISSING_ATTRIBUTE)
                        .with_error_comment("C-STORE request without a data set")
                        .into();
                };
                match read_dataset(dataset).await {
                    Ok(dataset) => provider.on_c_store(request, dataset).await.into(),
                    Err(comment) => {
                        warn!("Could not parse stored data set: {}", comment);
                        Status::new(code::CANNOT_UNDERSTAND)
                            .with_error_comment(comment)
                            .into()
                    }
                }
            }
            _ => {
                let Some(provider) = find(&self.normalized, &sop_class_uid) else {
                    return unrecognized();
                };
                let dataset = match dataset.map(IncomingDataset::read).transpose() {
                    Ok(dataset) => dataset,
                    Err(e) => {
                        return Status::new(code::CANNOT_UNDERSTAND)
                            .with_error_comment(e.to_string())
                            .into()
                    }
                };
                provider.on_n_request(request, dataset).await
            }
        }
    }

    fn stream(
        &self,
        request: &DimseMessage,
        identifier: InMemDicomObject,
        context: ServiceContext,
    ) -> Option<ResponseStream> {
        let sop_class_uid = request.sop_class_uid().unwrap_or_default();
        match request.command_field() {
            CommandField::CFindRq => find(&self.find, &sop_class_uid)
                .map(|p| p.on_c_find(request, identifier, context)),
            CommandField::CGetRq => find(&self.get, &sop_class_uid)
                .map(|p| p.on_c_get(request, identifier, context)),
            CommandField::CMoveRq => find(&self.move_, &sop_class_uid)
                .map(|p| p.on_c_move(request, identifier, context)),
            _ => None,
        }
    }

    async fn serve_stream(
        &self,
        request: &DimseMessage,
        dataset: Option<IncomingDataset>,
        responder: &Responder,
    ) {
        let identifier = match dataset.map(IncomingDataset::read).transpose() {
            Ok(identifier) => identifier.unwrap_or_else(InMemDicomObject::new_empty),
            Err(e) => {
                respond(
                    request,
                    responder,
                    Status::new(code::CANNOT_UNDERSTAND)
                        .with_error_comment(e.to_string())
                        .into(),
                );
                return;
            }
        };
        let connection_id = responder.pump().id();
        let message_id = request.message_id().unwrap_or_default();
        let cancel = CancellationToken::new();
        let context = ServiceContext {
            pump: responder.pump().clone(),
            cancel: cancel.clone(),
        };
        let Some(mut stream) = self.stream(request, identifier, context) else {
            respond(request, responder, unrecognized());
            return;
        };
        self.in_flight()
            .insert((connection_id, message_id), cancel.clone());

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    respond(request, responder, Status::new(code::CANCEL).into());
                    break;
                }
                next = stream.next() => next,
            };
            match next {
                Some(response) => {
                    let more = response.status.is_pending();
                    if !respond(request, responder, response) || !more {
                        break;
                    }
                }
                None => {
                    respond(request, responder, Status::success().into());
                    break;
                }
            }
        }

        self.in_flight().remove(&(connection_id, message_id));
    }
}

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle(&self, request: IncomingRequest, responder: Responder) {
        let IncomingRequest { message, dataset } = request;
        let command_field = message.command_field();

        if command_field == CommandField::CCancelRq {
            self.on_cancel(responder.pump().id(), &message);
            return;
        }
        if DimseMessage::response_to(&message, Status::success()).is_none() {
            warn!("Cannot respond to {:?}, aborting association", command_field);
            responder.pump().abort().await;
            return;
        }

        match command_field {
            CommandField::CFindRq | CommandField::CGetRq | CommandField::CMoveRq => {
                self.serve_stream(&message, dataset, &responder).await
            }
            _ => {
                let response = self.single(&message, dataset).await;
                respond(&message, &responder, response);
            }
        }
    }
}

fn unrecognized() -> ServiceResponse {
    Status::new(code::UNRECOGNIZED_OPERATION).into()
}

/// Send one response, returning whether the connection is still open.
fn respond(request: &DimseMessage, responder: &Responder, response: ServiceResponse) -> bool {
    let Some(mut message) = DimseMessage::response_to(request, response.status) else {
        return false;
    };
    if let Some(dataset) = response.dataset {
        message = message.with_dataset(dataset);
    }
    if let Some(sub_operations) = response.sub_operations {
        message = message.with_sub_operations(sub_operations);
    }
    responder.send(message).is_ok()
}

/// Parse a data set off the runtime threads,
/// as it may have been spooled to disk.
async fn read_dataset(dataset: IncomingDataset) -> Result<InMemDicomObject, String> {
    match tokio::task::spawn_blocking(move || dataset.read()).await {
        Ok(Ok(dataset)) => Ok(dataset),
        Ok(Err(e)) => Err(snafu::Report::from_error(e).to_string()),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_net_ul::association::syntax::EXPLICIT_VR_LITTLE_ENDIAN;

    struct NullStore;

    #[async_trait]
    impl CStoreProvider for NullStore {
        async fn on_c_store(&self, _: &DimseMessage, _: InMemDicomObject) -> Status {
            Status::success()
        }
    }

    const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";

    #[test]
    fn supported_abstract_syntaxes() {
        let dispatcher = Dispatcher::new().with_store(Arc::new(NullStore), [CT_IMAGE_STORAGE]);
        assert!(dispatcher.supports(VERIFICATION));
        assert!(dispatcher.supports(CT_IMAGE_STORAGE));
        assert!(!dispatcher.supports("1.2.840.10008.5.1.4.1.1.4"));

        let dispatcher = Dispatcher::new().with_echo(false);
        assert!(!dispatcher.supports(VERIFICATION));

        let any = Dispatcher::new().with_store(Arc::new(NullStore), Vec::<String>::new());
        assert!(any.supports("1.2.840.10008.5.1.4.1.1.4"));
    }

    #[tokio::test]
    async fn unparseable_store_data_set_cannot_be_understood() {
        let dispatcher = Dispatcher::new().with_store(Arc::new(NullStore), [CT_IMAGE_STORAGE]);
        let request = DimseMessage::c_store_rq(
            1,
            dataset_with_uids(),
            EXPLICIT_VR_LITTLE_ENDIAN,
        )
        .unwrap();
        // a truncated element header
        let garbage = IncomingDataset::from_bytes(vec![0x08, 0x00, 0x16], EXPLICIT_VR_LITTLE_ENDIAN);
        let response = dispatcher.single(&request, Some(garbage)).await;
        assert_eq!(response.status.code(), code::CANNOT_UNDERSTAND);
    }

    #[tokio::test]
    async fn missing_provider_is_unrecognized() {
        let dispatcher = Dispatcher::new();
        let request = DimseMessage::n_get_rq(3, "1.2.840.10008.5.1.1.1", "1.2.3.4");
        let response = dispatcher.single(&request, None).await;
        assert_eq!(response.status.code(), code::UNRECOGNIZED_OPERATION);
    }

    fn dataset_with_uids() -> InMemDicomObject {
        use dicom_core::{DataElement, PrimitiveValue, VR};
        use dicom_dictionary_std::tags;
        InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::SOP_CLASS_UID,
                VR::UI,
                PrimitiveValue::from(CT_IMAGE_STORAGE),
            ),
            DataElement::new(
                tags::SOP_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from("1.2.826.0.1.3680043.2.1125.1"),
            ),
        ])
    }
}
