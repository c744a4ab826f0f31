//! DICOM association module
//!
//! This module contains the model of an association
//! between two application entities
//! and the negotiation of its presentation contexts.
//!
//! An [`Association`] is built by the requester,
//! turned into an A-ASSOCIATE-RQ with [`Association::to_association_rq`],
//! and updated with the acceptor's decision
//! through [`Association::apply_association_ac`].
//! On the accepting side, [`Association::from_association_rq`]
//! records the proposal,
//! [`PresentationContextSet::negotiate`] settles each presentation context,
//! and [`Association::to_association_ac`] produces the reply.
//!
//! The actual exchange of these PDUs over a connection
//! is the responsibility of a higher level crate.
pub mod access;
pub mod ae_title;
pub mod presentation;
pub mod syntax;

use std::borrow::Cow;

use snafu::{Backtrace, ResultExt, Snafu};
use tracing::warn;

use crate::pdu::{
    AssociationAC, AssociationRQ, CommonExtendedNegotiation, RoleSelection, UserIdentity,
    UserVariableItem, DEFAULT_MAX_PDU,
};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

pub use access::{AcceptAny, AcceptCalledAeTitle, AcceptCallingAeTitles, AccessControl};
pub use ae_title::{validate_ae_title, AeTitlePolicy, MAX_AE_TITLE_LENGTH};
pub use presentation::{NegotiationResult, PresentationContext, PresentationContextSet};
use syntax::{is_native_encoding, APPLICATION_CONTEXT_NAME};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display(
        "AE title `{}` has {} characters, more than the maximum of 16",
        title,
        length
    ))]
    AeTitleTooLong {
        title: String,
        length: usize,
        backtrace: Backtrace,
    },

    /// AE title is empty
    AeTitleEmpty { backtrace: Backtrace },

    #[snafu(display("AE title `{}` contains invalid characters", title))]
    AeTitleInvalidCharacter { title: String, backtrace: Backtrace },

    #[snafu(display("invalid calling AE title"))]
    InvalidCallingAeTitle { source: Box<Error> },

    #[snafu(display("invalid called AE title"))]
    InvalidCalledAeTitle { source: Box<Error> },

    /// all 128 presentation context identifiers are in use
    PresentationContextIdsExhausted { backtrace: Backtrace },

    #[snafu(display("presentation context identifier {} is not odd", id))]
    InvalidPresentationContextId { id: u8, backtrace: Backtrace },

    #[snafu(display("presentation context identifier {} proposed twice", id))]
    DuplicatePresentationContextId { id: u8, backtrace: Backtrace },

    #[snafu(display("no presentation context with identifier {}", id))]
    UnknownPresentationContext { id: u8, backtrace: Backtrace },

    #[snafu(display("presentation context {} already has an accepted transfer syntax", id))]
    TransferSyntaxAlreadyAccepted { id: u8, backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Extended negotiation of a SOP class,
/// combining SOP class extended negotiation
/// and SOP class common extended negotiation sub-items.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct ExtendedNegotiation {
    /// the SOP class UID being negotiated
    pub sop_class_uid: String,
    /// service class application information, as requested
    pub application_info: Option<Vec<u8>>,
    /// service class application information, as accepted by the acceptor
    pub accepted_application_info: Option<Vec<u8>>,
    /// the service class UID,
    /// only present in common extended negotiation
    pub service_class_uid: Option<String>,
    /// related general SOP class UIDs
    pub related_general_sop_classes: Vec<String>,
}

impl ExtendedNegotiation {
    pub fn new(sop_class_uid: impl Into<String>) -> Self {
        ExtendedNegotiation {
            sop_class_uid: sop_class_uid.into(),
            ..Default::default()
        }
    }
}

/// Combine two asynchronous operation limits, where 0 means unlimited.
fn combine_async_limit(a: u16, b: u16) -> u16 {
    match (a, b) {
        (0, x) | (x, 0) => x,
        (a, b) => a.min(b),
    }
}

/// The negotiated properties of an association between two application entities.
///
/// The asynchronous operations window is kept from the requester's perspective,
/// as carried in the association negotiation.
#[derive(Debug, Clone, PartialEq)]
pub struct Association {
    calling_ae_title: String,
    called_ae_title: String,
    application_context_name: String,
    /// whether this side requested the association
    requester: bool,
    max_async_ops_invoked: u16,
    max_async_ops_performed: u16,
    /// the maximum PDU length this node is willing to receive
    max_pdu_length: u32,
    /// the maximum PDU length the peer is willing to receive
    peer_max_pdu_length: u32,
    implementation_class_uid: Cow<'static, str>,
    implementation_version_name: Cow<'static, str>,
    remote_implementation_class_uid: Option<String>,
    remote_implementation_version_name: Option<String>,
    presentation_contexts: PresentationContextSet,
    extended_negotiations: Vec<ExtendedNegotiation>,
    user_identity: Option<UserIdentity>,
    user_identity_response: Option<Vec<u8>>,
}

impl Association {
    /// Start an association proposal from the requester's side.
    ///
    /// Both AE titles are validated according to the given policy,
    /// and the validated values are the ones placed in the request.
    pub fn new(calling_ae_title: &str, called_ae_title: &str, policy: AeTitlePolicy) -> Result<Self> {
        let calling_ae_title = validate_ae_title(calling_ae_title, policy)
            .map_err(Box::new)
            .context(InvalidCallingAeTitleSnafu)?
            .into_owned();
        let called_ae_title = validate_ae_title(called_ae_title, policy)
            .map_err(Box::new)
            .context(InvalidCalledAeTitleSnafu)?
            .into_owned();

        Ok(Association {
            calling_ae_title,
            called_ae_title,
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            requester: true,
            max_async_ops_invoked: 1,
            max_async_ops_performed: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            peer_max_pdu_length: DEFAULT_MAX_PDU,
            implementation_class_uid: IMPLEMENTATION_CLASS_UID.into(),
            implementation_version_name: IMPLEMENTATION_VERSION_NAME.into(),
            remote_implementation_class_uid: None,
            remote_implementation_version_name: None,
            presentation_contexts: PresentationContextSet::new(),
            extended_negotiations: Vec::new(),
            user_identity: None,
            user_identity_response: None,
        })
    }

    /// Record an association request on the acceptor's side.
    ///
    /// `max_pdu_length` is the maximum PDU length this node will receive.
    pub fn from_association_rq(rq: &AssociationRQ, max_pdu_length: u32) -> Result<Self> {
        let mut association = Association {
            calling_ae_title: rq.calling_ae_title.clone(),
            called_ae_title: rq.called_ae_title.clone(),
            application_context_name: rq.application_context_name.clone(),
            requester: false,
            max_async_ops_invoked: 1,
            max_async_ops_performed: 1,
            max_pdu_length,
            peer_max_pdu_length: 0,
            implementation_class_uid: IMPLEMENTATION_CLASS_UID.into(),
            implementation_version_name: IMPLEMENTATION_VERSION_NAME.into(),
            remote_implementation_class_uid: None,
            remote_implementation_version_name: None,
            presentation_contexts: PresentationContextSet::new(),
            extended_negotiations: Vec::new(),
            user_identity: None,
            user_identity_response: None,
        };

        for pc in &rq.presentation_contexts {
            association.presentation_contexts.add_proposed(pc.clone())?;
        }

        let mut role_selections = Vec::new();
        for item in &rq.user_variables {
            match item {
                UserVariableItem::MaxLength(length) => association.peer_max_pdu_length = *length,
                UserVariableItem::ImplementationClassUID(uid) => {
                    association.remote_implementation_class_uid = Some(uid.clone())
                }
                UserVariableItem::ImplementationVersionName(name) => {
                    association.remote_implementation_version_name = Some(name.clone())
                }
                UserVariableItem::AsyncOperationsWindow(invoked, performed) => {
                    association.max_async_ops_invoked = *invoked;
                    association.max_async_ops_performed = *performed;
                }
                UserVariableItem::RoleSelection(role) => role_selections.push(role.clone()),
                UserVariableItem::SopClassExtendedNegotiationSubItem(uid, info) => {
                    association.extended_negotiation_mut(uid).application_info = Some(info.clone());
                }
                UserVariableItem::SopClassCommonExtendedNegotiationSubItem(common) => {
                    let negotiation = association.extended_negotiation_mut(&common.sop_class_uid);
                    negotiation.service_class_uid = Some(common.service_class_uid.clone());
                    negotiation.related_general_sop_classes =
                        common.related_general_sop_classes.clone();
                }
                UserVariableItem::UserIdentityItem(identity) => {
                    association.user_identity = Some(identity.clone())
                }
                UserVariableItem::UserIdentityServerResponse(_) => {
                    warn!("Ignoring user identity server response in association request");
                }
                UserVariableItem::Unknown(item_type, _) => {
                    warn!("Ignoring unknown user variable item 0x{:02X}", item_type);
                }
            }
        }
        association.apply_role_selections(&role_selections);

        Ok(association)
    }

    // --- getters ---

    pub fn calling_ae_title(&self) -> &str {
        &self.calling_ae_title
    }

    pub fn called_ae_title(&self) -> &str {
        &self.called_ae_title
    }

    pub fn application_context_name(&self) -> &str {
        &self.application_context_name
    }

    /// Whether this node is the association requester.
    pub fn is_requester(&self) -> bool {
        self.requester
    }

    /// The maximum number of outstanding operations
    /// the requester may invoke (0 for unlimited).
    pub fn max_async_ops_invoked(&self) -> u16 {
        self.max_async_ops_invoked
    }

    /// The maximum number of outstanding operations
    /// the requester may perform (0 for unlimited).
    pub fn max_async_ops_performed(&self) -> u16 {
        self.max_async_ops_performed
    }

    /// The maximum number of outstanding requests
    /// this node may have invoked on the peer (0 for unlimited).
    pub fn outbound_window(&self) -> u16 {
        if self.requester {
            self.max_async_ops_invoked
        } else {
            self.max_async_ops_performed
        }
    }

    /// The maximum PDU length this node accepts to receive.
    pub fn max_pdu_length(&self) -> u32 {
        self.max_pdu_length
    }

    /// The maximum PDU length the peer accepts to receive (0 for unlimited).
    pub fn peer_max_pdu_length(&self) -> u32 {
        self.peer_max_pdu_length
    }

    pub fn remote_implementation_class_uid(&self) -> Option<&str> {
        self.remote_implementation_class_uid.as_deref()
    }

    pub fn remote_implementation_version_name(&self) -> Option<&str> {
        self.remote_implementation_version_name.as_deref()
    }

    pub fn presentation_contexts(&self) -> &PresentationContextSet {
        &self.presentation_contexts
    }

    pub fn presentation_contexts_mut(&mut self) -> &mut PresentationContextSet {
        &mut self.presentation_contexts
    }

    pub fn extended_negotiations(&self) -> &[ExtendedNegotiation] {
        &self.extended_negotiations
    }

    pub fn user_identity(&self) -> Option<&UserIdentity> {
        self.user_identity.as_ref()
    }

    pub fn user_identity_response(&self) -> Option<&[u8]> {
        self.user_identity_response.as_deref()
    }

    /// The SCU/SCP role selections of all presentation contexts,
    /// one per abstract syntax.
    pub fn role_selections(&self) -> Vec<RoleSelection> {
        let mut out: Vec<RoleSelection> = Vec::new();
        for pc in self.presentation_contexts.iter() {
            if let Some((scu_role, scp_role)) = pc.roles() {
                if out.iter().all(|r| r.sop_class_uid != pc.abstract_syntax()) {
                    out.push(RoleSelection {
                        sop_class_uid: pc.abstract_syntax().to_string(),
                        scu_role,
                        scp_role,
                    });
                }
            }
        }
        out
    }

    // --- setters ---

    /// Set the maximum PDU length this node accepts to receive.
    pub fn with_max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Set the asynchronous operations window to propose.
    pub fn with_async_ops_window(mut self, invoked: u16, performed: u16) -> Self {
        self.max_async_ops_invoked = invoked;
        self.max_async_ops_performed = performed;
        self
    }

    /// Override the local implementation class UID and version name.
    pub fn with_implementation<U, N>(mut self, class_uid: U, version_name: N) -> Self
    where
        U: Into<Cow<'static, str>>,
        N: Into<Cow<'static, str>>,
    {
        self.implementation_class_uid = class_uid.into();
        self.implementation_version_name = version_name.into();
        self
    }

    pub fn with_user_identity(mut self, identity: UserIdentity) -> Self {
        self.user_identity = Some(identity);
        self
    }

    pub fn with_extended_negotiation(mut self, negotiation: ExtendedNegotiation) -> Self {
        self.extended_negotiations.push(negotiation);
        self
    }

    /// Set the server response to the user identity negotiation,
    /// only sent if the requester asked for a positive response.
    pub fn set_user_identity_response(&mut self, response: Vec<u8>) {
        self.user_identity_response = Some(response);
    }

    /// Restrict the asynchronous operations window on the acceptor's side
    /// to what this node is willing to invoke and perform.
    pub fn limit_async_ops(&mut self, local_invoked: u16, local_performed: u16) {
        self.max_async_ops_invoked = combine_async_limit(self.max_async_ops_invoked, local_performed);
        self.max_async_ops_performed =
            combine_async_limit(self.max_async_ops_performed, local_invoked);
    }

    fn extended_negotiation_mut(&mut self, sop_class_uid: &str) -> &mut ExtendedNegotiation {
        let position = self
            .extended_negotiations
            .iter()
            .position(|n| n.sop_class_uid == sop_class_uid);
        match position {
            Some(i) => &mut self.extended_negotiations[i],
            None => {
                self.extended_negotiations
                    .push(ExtendedNegotiation::new(sop_class_uid));
                let last = self.extended_negotiations.len() - 1;
                &mut self.extended_negotiations[last]
            }
        }
    }

    fn apply_role_selections(&mut self, roles: &[RoleSelection]) {
        for role in roles {
            for pc in self.presentation_contexts.iter_mut() {
                if pc.abstract_syntax() == role.sop_class_uid {
                    pc.set_roles(role.scu_role, role.scp_role);
                }
            }
        }
    }

    fn implementation_items(&self, out: &mut Vec<UserVariableItem>) {
        out.push(UserVariableItem::MaxLength(self.max_pdu_length));
        out.push(UserVariableItem::ImplementationClassUID(
            self.implementation_class_uid.to_string(),
        ));
        if self.max_async_ops_invoked != 1 || self.max_async_ops_performed != 1 {
            out.push(UserVariableItem::AsyncOperationsWindow(
                self.max_async_ops_invoked,
                self.max_async_ops_performed,
            ));
        }
        out.extend(self.role_selections().into_iter().map(UserVariableItem::RoleSelection));
        out.push(UserVariableItem::ImplementationVersionName(
            self.implementation_version_name.to_string(),
        ));
    }

    /// Produce the A-ASSOCIATE-RQ proposing this association.
    pub fn to_association_rq(&self) -> AssociationRQ {
        let mut user_variables = Vec::new();
        self.implementation_items(&mut user_variables);
        for negotiation in &self.extended_negotiations {
            if let Some(info) = &negotiation.application_info {
                user_variables.push(UserVariableItem::SopClassExtendedNegotiationSubItem(
                    negotiation.sop_class_uid.clone(),
                    info.clone(),
                ));
            }
        }
        for negotiation in &self.extended_negotiations {
            if let Some(service_class_uid) = &negotiation.service_class_uid {
                user_variables.push(UserVariableItem::SopClassCommonExtendedNegotiationSubItem(
                    CommonExtendedNegotiation {
                        sop_class_uid: negotiation.sop_class_uid.clone(),
                        service_class_uid: service_class_uid.clone(),
                        related_general_sop_classes: negotiation
                            .related_general_sop_classes
                            .clone(),
                    },
                ));
            }
        }
        if let Some(identity) = &self.user_identity {
            user_variables.push(UserVariableItem::UserIdentityItem(identity.clone()));
        }

        AssociationRQ {
            protocol_version: 1,
            calling_ae_title: self.calling_ae_title.clone(),
            called_ae_title: self.called_ae_title.clone(),
            application_context_name: self.application_context_name.clone(),
            presentation_contexts: self
                .presentation_contexts
                .iter()
                .map(PresentationContext::to_proposed)
                .collect(),
            user_variables,
            unknown_items: Vec::new(),
        }
    }

    /// Produce the A-ASSOCIATE-AC accepting this association.
    ///
    /// Presentation contexts still in the proposed state
    /// are rejected with no reason beforehand.
    pub fn to_association_ac(&mut self) -> AssociationAC {
        let rejected = self.presentation_contexts.reject_remaining();
        if rejected > 0 {
            warn!(
                "{} presentation context(s) left unanswered were rejected",
                rejected
            );
        }

        let mut user_variables = Vec::new();
        self.implementation_items(&mut user_variables);
        for negotiation in &self.extended_negotiations {
            if let Some(info) = &negotiation.accepted_application_info {
                user_variables.push(UserVariableItem::SopClassExtendedNegotiationSubItem(
                    negotiation.sop_class_uid.clone(),
                    info.clone(),
                ));
            }
        }
        let wants_response = self
            .user_identity
            .as_ref()
            .map(UserIdentity::positive_response_requested)
            .unwrap_or(false);
        if let (true, Some(response)) = (wants_response, &self.user_identity_response) {
            user_variables.push(UserVariableItem::UserIdentityServerResponse(
                response.clone(),
            ));
        }

        AssociationAC {
            protocol_version: 1,
            calling_ae_title: self.calling_ae_title.clone(),
            called_ae_title: self.called_ae_title.clone(),
            application_context_name: self.application_context_name.clone(),
            presentation_contexts: self
                .presentation_contexts
                .iter()
                .map(PresentationContext::to_result)
                .collect(),
            user_variables,
            unknown_items: Vec::new(),
        }
    }

    /// Update a proposed association with the acceptor's reply.
    pub fn apply_association_ac(&mut self, ac: &AssociationAC) -> Result<()> {
        for result in &ac.presentation_contexts {
            self.presentation_contexts.apply_result(result)?;
        }

        // window defaults to a single operation unless negotiated
        self.max_async_ops_invoked = 1;
        self.max_async_ops_performed = 1;
        self.peer_max_pdu_length = 0;

        let mut role_selections = Vec::new();
        for item in &ac.user_variables {
            match item {
                UserVariableItem::MaxLength(length) => self.peer_max_pdu_length = *length,
                UserVariableItem::ImplementationClassUID(uid) => {
                    self.remote_implementation_class_uid = Some(uid.clone())
                }
                UserVariableItem::ImplementationVersionName(name) => {
                    self.remote_implementation_version_name = Some(name.clone())
                }
                UserVariableItem::AsyncOperationsWindow(invoked, performed) => {
                    self.max_async_ops_invoked = *invoked;
                    self.max_async_ops_performed = *performed;
                }
                UserVariableItem::RoleSelection(role) => role_selections.push(role.clone()),
                UserVariableItem::SopClassExtendedNegotiationSubItem(uid, info) => {
                    self.extended_negotiation_mut(uid).accepted_application_info =
                        Some(info.clone());
                }
                UserVariableItem::UserIdentityServerResponse(response) => {
                    self.user_identity_response = Some(response.clone())
                }
                UserVariableItem::SopClassCommonExtendedNegotiationSubItem(_)
                | UserVariableItem::UserIdentityItem(_) => {
                    warn!("Ignoring request-only negotiation item in association acknowledgement");
                }
                UserVariableItem::Unknown(item_type, _) => {
                    warn!("Ignoring unknown user variable item 0x{:02X}", item_type);
                }
            }
        }
        self.apply_role_selections(&role_selections);
        Ok(())
    }

    /// Choose the presentation context to send a message
    /// other than a C-STORE request through:
    /// any accepted context of the same abstract syntax.
    pub fn select_presentation_context(&self, abstract_syntax: &str) -> Option<&PresentationContext> {
        self.presentation_contexts.find_accepted(abstract_syntax)
    }

    /// Choose the presentation context to send a C-STORE request through.
    ///
    /// A context accepted with the data set's own transfer syntax is preferred.
    /// A data set in one of the native encodings
    /// then goes through a context accepted with another native encoding.
    /// Failing both, any accepted context of the same abstract syntax is taken,
    /// in which case the data set is encoded anew
    /// in the context's transfer syntax.
    pub fn select_store_presentation_context(
        &self,
        abstract_syntax: &str,
        transfer_syntax: &str,
    ) -> Option<&PresentationContext> {
        self.presentation_contexts
            .find_accepted_with(abstract_syntax, transfer_syntax)
            .or_else(|| {
                if !is_native_encoding(transfer_syntax) {
                    return None;
                }
                self.presentation_contexts.iter().find(|pc| {
                    pc.is_accepted()
                        && pc.abstract_syntax() == abstract_syntax
                        && pc.accepted_transfer_syntax().map_or(false, is_native_encoding)
                })
            })
            .or_else(|| self.presentation_contexts.find_accepted(abstract_syntax))
    }
}
