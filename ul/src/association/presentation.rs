//! Presentation contexts and their negotiation.
//!
//! A [`PresentationContextSet`] holds the presentation contexts
//! of one association, ordered by identifier.
//! On the requesting side it allocates identifiers
//! and finds or creates a context for each outgoing message.
//! On the accepting side it records the proposals of the requester
//! and settles each one to a single transfer syntax or a rejection.
use std::collections::BTreeMap;

use snafu::{ensure, OptionExt};

use crate::pdu::{PresentationContextProposed, PresentationContextResult, PresentationContextResultReason};

use super::syntax::{EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN};
use super::{
    DuplicatePresentationContextIdSnafu, InvalidPresentationContextIdSnafu,
    PresentationContextIdsExhaustedSnafu, Result, TransferSyntaxAlreadyAcceptedSnafu,
    UnknownPresentationContextSnafu,
};

/// The negotiation state of a presentation context.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum NegotiationResult {
    /// Proposed and not yet settled
    Proposed,
    /// Accepted with a single transfer syntax
    Accepted,
    /// Rejected for the given reason,
    /// which is never [`PresentationContextResultReason::Acceptance`]
    Rejected(PresentationContextResultReason),
}

impl NegotiationResult {
    /// The result/reason code to place in an A-ASSOCIATE-AC.
    ///
    /// Contexts still proposed are reported as rejected with no reason.
    pub fn reason(self) -> PresentationContextResultReason {
        match self {
            NegotiationResult::Accepted => PresentationContextResultReason::Acceptance,
            NegotiationResult::Rejected(reason) => reason,
            NegotiationResult::Proposed => PresentationContextResultReason::NoReason,
        }
    }
}

impl From<PresentationContextResultReason> for NegotiationResult {
    fn from(reason: PresentationContextResultReason) -> Self {
        match reason {
            PresentationContextResultReason::Acceptance => NegotiationResult::Accepted,
            other => NegotiationResult::Rejected(other),
        }
    }
}

/// A presentation context:
/// an abstract syntax paired with its candidate transfer syntaxes.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PresentationContext {
    id: u8,
    abstract_syntax: String,
    transfer_syntaxes: Vec<String>,
    result: NegotiationResult,
    accepted_transfer_syntax: Option<String>,
    scu_role: Option<bool>,
    scp_role: Option<bool>,
}

impl PresentationContext {
    fn new(id: u8, abstract_syntax: String, transfer_syntaxes: Vec<String>) -> Self {
        PresentationContext {
            id,
            abstract_syntax,
            transfer_syntaxes,
            result: NegotiationResult::Proposed,
            accepted_transfer_syntax: None,
            scu_role: None,
            scp_role: None,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn abstract_syntax(&self) -> &str {
        &self.abstract_syntax
    }

    /// The proposed transfer syntaxes, in order of preference.
    pub fn transfer_syntaxes(&self) -> &[String] {
        &self.transfer_syntaxes
    }

    pub fn result(&self) -> NegotiationResult {
        self.result
    }

    pub fn is_accepted(&self) -> bool {
        self.result == NegotiationResult::Accepted
    }

    /// The transfer syntax settled by negotiation,
    /// only available once accepted.
    pub fn accepted_transfer_syntax(&self) -> Option<&str> {
        self.accepted_transfer_syntax.as_deref()
    }

    /// Whether the given transfer syntax is among the proposed ones.
    pub fn offers(&self, transfer_syntax: &str) -> bool {
        self.transfer_syntaxes.iter().any(|ts| ts == transfer_syntax)
    }

    /// The SCU/SCP role selection attached to this context, if any.
    pub fn roles(&self) -> Option<(bool, bool)> {
        match (self.scu_role, self.scp_role) {
            (None, None) => None,
            (scu, scp) => Some((scu.unwrap_or(false), scp.unwrap_or(false))),
        }
    }

    /// Attach an SCU/SCP role selection to this context.
    pub fn set_roles(&mut self, scu_role: bool, scp_role: bool) {
        self.scu_role = Some(scu_role);
        self.scp_role = Some(scp_role);
    }

    /// Accept this context with the given transfer syntax.
    ///
    /// The accepted transfer syntax can only be set once.
    pub fn accept(&mut self, transfer_syntax: impl Into<String>) -> Result<()> {
        ensure!(
            self.accepted_transfer_syntax.is_none(),
            TransferSyntaxAlreadyAcceptedSnafu { id: self.id }
        );
        self.accepted_transfer_syntax = Some(transfer_syntax.into());
        self.result = NegotiationResult::Accepted;
        Ok(())
    }

    /// Reject this context for the given reason.
    ///
    /// An `Acceptance` reason is treated as a rejection with no reason.
    pub fn reject(&mut self, reason: PresentationContextResultReason) {
        let reason = match reason {
            PresentationContextResultReason::Acceptance => PresentationContextResultReason::NoReason,
            other => other,
        };
        self.result = NegotiationResult::Rejected(reason);
        self.accepted_transfer_syntax = None;
    }

    /// Settle this context on the accepting side.
    ///
    /// The context is accepted with the first proposed transfer syntax
    /// which the acceptor supports,
    /// or rejected if the abstract syntax or all transfer syntaxes are
    /// unsupported.
    pub fn negotiate<F>(&mut self, abstract_syntax_supported: bool, transfer_syntax_supported: F)
    where
        F: Fn(&str) -> bool,
    {
        if self.result != NegotiationResult::Proposed {
            return;
        }
        if !abstract_syntax_supported {
            self.reject(PresentationContextResultReason::AbstractSyntaxNotSupported);
            return;
        }
        match self
            .transfer_syntaxes
            .iter()
            .find(|ts| transfer_syntax_supported(ts))
        {
            Some(ts) => {
                self.accepted_transfer_syntax = Some(ts.clone());
                self.result = NegotiationResult::Accepted;
            }
            None => self.reject(PresentationContextResultReason::TransferSyntaxesNotSupported),
        }
    }

    /// The representation of this context in an A-ASSOCIATE-RQ.
    pub fn to_proposed(&self) -> PresentationContextProposed {
        PresentationContextProposed {
            id: self.id,
            abstract_syntax: self.abstract_syntax.clone(),
            transfer_syntaxes: self.transfer_syntaxes.clone(),
        }
    }

    /// The representation of this context in an A-ASSOCIATE-AC.
    pub fn to_result(&self) -> PresentationContextResult {
        PresentationContextResult {
            id: self.id,
            reason: self.result.reason(),
            transfer_syntax: self
                .accepted_transfer_syntax
                .clone()
                .or_else(|| self.transfer_syntaxes.first().cloned())
                .unwrap_or_default(),
        }
    }
}

/// The presentation contexts of an association, ordered by identifier.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct PresentationContextSet {
    contexts: BTreeMap<u8, PresentationContext>,
}

impl PresentationContextSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn get(&self, id: u8) -> Option<&PresentationContext> {
        self.contexts.get(&id)
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut PresentationContext> {
        self.contexts.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PresentationContext> {
        self.contexts.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PresentationContext> {
        self.contexts.values_mut()
    }

    /// The identifier the next added context would receive.
    ///
    /// Identifiers are odd, starting at 1,
    /// and allocated as the current maximum plus 2.
    fn next_id(&self) -> Result<u8> {
        let next = match self.contexts.keys().next_back() {
            Some(max) => u16::from(*max) + 2,
            None => 1,
        };
        ensure!(next < 256, PresentationContextIdsExhaustedSnafu);
        Ok(next as u8)
    }

    /// Add a new presentation context with a freshly allocated identifier.
    ///
    /// Fails once all 128 identifiers are in use,
    /// which no caller can recover from within the same association.
    pub fn add<I, T>(&mut self, abstract_syntax: impl Into<String>, transfer_syntaxes: I) -> Result<u8>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let id = self.next_id()?;
        let mut unique: Vec<String> = Vec::new();
        for ts in transfer_syntaxes {
            let ts = ts.into();
            if !unique.contains(&ts) {
                unique.push(ts);
            }
        }
        self.contexts
            .insert(id, PresentationContext::new(id, abstract_syntax.into(), unique));
        Ok(id)
    }

    /// Record a context proposed by the requester, keeping its identifier.
    pub fn add_proposed(&mut self, proposed: PresentationContextProposed) -> Result<()> {
        let id = proposed.id;
        ensure!(id % 2 == 1, InvalidPresentationContextIdSnafu { id });
        ensure!(
            !self.contexts.contains_key(&id),
            DuplicatePresentationContextIdSnafu { id }
        );
        self.contexts.insert(
            id,
            PresentationContext::new(id, proposed.abstract_syntax, proposed.transfer_syntaxes),
        );
        Ok(())
    }

    /// Find or create a context for a storage request.
    ///
    /// An existing context is reused
    /// if it has the same abstract syntax and offers the native transfer syntax.
    /// Otherwise a new context proposes the native transfer syntax,
    /// the additional transfer syntaxes,
    /// then Explicit VR Little Endian and Implicit VR Little Endian.
    pub fn add_for_store(
        &mut self,
        sop_class_uid: &str,
        native_transfer_syntax: &str,
        additional_transfer_syntaxes: &[String],
    ) -> Result<u8> {
        if let Some(pc) = self
            .iter()
            .find(|pc| pc.abstract_syntax == sop_class_uid && pc.offers(native_transfer_syntax))
        {
            return Ok(pc.id);
        }

        let transfer_syntaxes = std::iter::once(native_transfer_syntax)
            .chain(additional_transfer_syntaxes.iter().map(String::as_str))
            .chain([EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN]);
        self.add(sop_class_uid, transfer_syntaxes)
    }

    /// Find or create a context for any other request.
    ///
    /// Any context with the same abstract syntax is reused.
    /// Otherwise a new context proposes
    /// Explicit VR Little Endian and Implicit VR Little Endian.
    pub fn add_for_service(&mut self, abstract_syntax: &str) -> Result<u8> {
        if let Some(pc) = self.iter().find(|pc| pc.abstract_syntax == abstract_syntax) {
            return Ok(pc.id);
        }
        self.add(
            abstract_syntax,
            [EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN],
        )
    }

    /// Settle every proposed context on the accepting side.
    pub fn negotiate<A, T>(&mut self, abstract_syntax_supported: A, transfer_syntax_supported: T)
    where
        A: Fn(&str) -> bool,
        T: Fn(&str) -> bool,
    {
        for pc in self.contexts.values_mut() {
            let supported = abstract_syntax_supported(&pc.abstract_syntax);
            pc.negotiate(supported, &transfer_syntax_supported);
        }
    }

    /// Reject with no reason every context still in the proposed state.
    ///
    /// Returns the number of contexts affected.
    pub fn reject_remaining(&mut self) -> usize {
        let mut count = 0;
        for pc in self.contexts.values_mut() {
            if pc.result == NegotiationResult::Proposed {
                pc.reject(PresentationContextResultReason::NoReason);
                count += 1;
            }
        }
        count
    }

    /// Record the outcome of a context, as received in an A-ASSOCIATE-AC.
    pub fn apply_result(&mut self, result: &PresentationContextResult) -> Result<()> {
        let pc = self
            .contexts
            .get_mut(&result.id)
            .context(UnknownPresentationContextSnafu { id: result.id })?;
        match result.reason {
            PresentationContextResultReason::Acceptance => pc.accept(result.transfer_syntax.clone()),
            reason => {
                pc.reject(reason);
                Ok(())
            }
        }
    }

    /// Find an accepted context for the given abstract syntax.
    pub fn find_accepted(&self, abstract_syntax: &str) -> Option<&PresentationContext> {
        self.iter()
            .find(|pc| pc.is_accepted() && pc.abstract_syntax == abstract_syntax)
    }

    /// Find an accepted context for the given abstract syntax
    /// whose accepted transfer syntax is the given one.
    pub fn find_accepted_with(
        &self,
        abstract_syntax: &str,
        transfer_syntax: &str,
    ) -> Option<&PresentationContext> {
        self.iter().find(|pc| {
            pc.is_accepted()
                && pc.abstract_syntax == abstract_syntax
                && pc.accepted_transfer_syntax() == Some(transfer_syntax)
        })
    }
}
