//! DIMSE message model.
//!
//! A [`DimseMessage`] is a command set,
//! always present and always encoded in Implicit VR Little Endian,
//! plus an optional data set
//! encoded with the transfer syntax of its presentation context.
//! Typed accessors read the well-known command elements.
use std::borrow::Cow;
use std::sync::atomic::{AtomicU16, Ordering};

use dicom_core::{dicom_value, DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_net_ul::association::syntax::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom_object::mem::InMemElement;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

use crate::status::Status;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("missing command element {}", name))]
    MissingElement {
        name: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("invalid value in command element {}", name))]
    InvalidElement {
        name: &'static str,
        source: dicom_core::value::ConvertValueError,
        backtrace: Backtrace,
    },

    #[snafu(display("unknown command field 0x{:04X}", command_field))]
    UnknownCommandField {
        command_field: u16,
        backtrace: Backtrace,
    },

    #[snafu(display("missing {} in data set", name))]
    MissingDatasetElement {
        name: &'static str,
        backtrace: Backtrace,
    },

    /// could not read command set
    ReadCommand {
        source: dicom_object::ReadError,
        backtrace: Backtrace,
    },

    /// could not write command set
    WriteCommand {
        source: dicom_object::WriteError,
        backtrace: Backtrace,
    },

    /// could not read data set
    ReadDataset {
        source: dicom_object::ReadError,
        backtrace: Backtrace,
    },

    /// could not write data set
    WriteDataset {
        source: dicom_object::WriteError,
        backtrace: Backtrace,
    },

    #[snafu(display("transfer syntax {} is not supported", uid))]
    UnsupportedTransferSyntax { uid: String, backtrace: Backtrace },

    /// could not read back spooled data set
    #[snafu(visibility(pub(crate)))]
    SpoolDataset {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The value of Command Data Set Type meaning that no data set follows
pub const NO_DATA_SET: u16 = 0x0101;

/// The kind of a DIMSE message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CommandField {
    CStoreRq,
    CStoreRsp,
    CGetRq,
    CGetRsp,
    CFindRq,
    CFindRsp,
    CMoveRq,
    CMoveRsp,
    CEchoRq,
    CEchoRsp,
    CCancelRq,
    NEventReportRq,
    NEventReportRsp,
    NGetRq,
    NGetRsp,
    NSetRq,
    NSetRsp,
    NActionRq,
    NActionRsp,
    NCreateRq,
    NCreateRsp,
    NDeleteRq,
    NDeleteRsp,
}

impl CommandField {
    pub fn from_code(code: u16) -> Option<Self> {
        use CommandField::*;
        Some(match code {
            0x0001 => CStoreRq,
            0x8001 => CStoreRsp,
            0x0010 => CGetRq,
            0x8010 => CGetRsp,
            0x0020 => CFindRq,
            0x8020 => CFindRsp,
            0x0021 => CMoveRq,
            0x8021 => CMoveRsp,
            0x0030 => CEchoRq,
            0x8030 => CEchoRsp,
            0x0FFF => CCancelRq,
            0x0100 => NEventReportRq,
            0x8100 => NEventReportRsp,
            0x0110 => NGetRq,
            0x8110 => NGetRsp,
            0x0120 => NSetRq,
            0x8120 => NSetRsp,
            0x0130 => NActionRq,
            0x8130 => NActionRsp,
            0x0140 => NCreateRq,
            0x8140 => NCreateRsp,
            0x0150 => NDeleteRq,
            0x8150 => NDeleteRsp,
            _ => return None,
        })
    }

    pub fn code(self) -> u16 {
        use CommandField::*;
        match self {
            CStoreRq => 0x0001,
            CStoreRsp => 0x8001,
            CGetRq => 0x0010,
            CGetRsp => 0x8010,
            CFindRq => 0x0020,
            CFindRsp => 0x8020,
            CMoveRq => 0x0021,
            CMoveRsp => 0x8021,
            CEchoRq => 0x0030,
            CEchoRsp => 0x8030,
            CCancelRq => 0x0FFF,
            NEventReportRq => 0x0100,
            NEventReportRsp => 0x8100,
            NGetRq => 0x0110,
            NGetRsp => 0x8110,
            NSetRq => 0x0120,
            NSetRsp => 0x8120,
            NActionRq => 0x0130,
            NActionRsp => 0x8130,
            NCreateRq => 0x0140,
            NCreateRsp => 0x8140,
            NDeleteRq => 0x0150,
            NDeleteRsp => 0x8150,
        }
    }

    pub fn is_request(self) -> bool {
        self.code() & 0x8000 == 0
    }

    pub fn is_response(self) -> bool {
        !self.is_request()
    }

    /// Whether a request of this kind waits for responses.
    /// Only C-CANCEL does not.
    pub fn expects_response(self) -> bool {
        self.is_request() && self != CommandField::CCancelRq
    }

    /// The response counterpart of a request.
    pub fn response(self) -> Option<Self> {
        if !self.expects_response() {
            return None;
        }
        Self::from_code(self.code() | 0x8000)
    }

    /// Whether this is one of the normalized (N-) services.
    pub fn is_normalized(self) -> bool {
        self.code() & 0x0F00 == 0x0100
    }
}

/// The priority of a composite request.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn code(self) -> u16 {
        match self {
            Priority::Low => 0x0002,
            Priority::Medium => 0x0000,
            Priority::High => 0x0001,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0002 => Some(Priority::Low),
            0x0000 => Some(Priority::Medium),
            0x0001 => Some(Priority::High),
            _ => None,
        }
    }
}

/// Sub-operation counters of C-GET and C-MOVE responses.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SubOperations {
    pub remaining: u16,
    pub completed: u16,
    pub failed: u16,
    pub warning: u16,
}

/// Allocates message identifiers for the requests of one client.
///
/// Identifiers start at 1 and wrap around from 65535 back to 1,
/// so 0 is never produced.
#[derive(Debug)]
pub struct MessageIdGenerator {
    next: AtomicU16,
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        MessageIdGenerator {
            next: AtomicU16::new(1),
        }
    }
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start at the given identifier, 0 being taken as 1.
    pub fn starting_at(first: u16) -> Self {
        MessageIdGenerator {
            next: AtomicU16::new(first.max(1)),
        }
    }

    pub fn next_id(&self) -> u16 {
        let previous = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                Some(if id == u16::MAX { 1 } else { id + 1 })
            });
        // the closure never returns None
        match previous {
            Ok(id) | Err(id) => id,
        }
    }
}

fn uid_element(tag: Tag, uid: &str) -> InMemElement {
    DataElement::new(tag, VR::UI, PrimitiveValue::from(uid))
}

fn us_element(tag: Tag, value: u16) -> InMemElement {
    DataElement::new(tag, VR::US, dicom_value!(U16, [value]))
}

/// A DIMSE message: a command set and an optional data set.
#[derive(Debug, Clone)]
pub struct DimseMessage {
    command_field: CommandField,
    command: InMemDicomObject,
    dataset: Option<InMemDicomObject>,
    /// the transfer syntax the data set is natively encoded in
    transfer_syntax: Cow<'static, str>,
    additional_transfer_syntaxes: Vec<String>,
    presentation_context_id: Option<u8>,
}

impl DimseMessage {
    /// Wrap a decoded command set.
    pub fn from_command(command: InMemDicomObject) -> Result<Self> {
        let code = command
            .element(tags::COMMAND_FIELD)
            .ok()
            .context(MissingElementSnafu {
                name: "Command Field",
            })?
            .to_int::<u16>()
            .context(InvalidElementSnafu {
                name: "Command Field",
            })?;
        let command_field = CommandField::from_code(code).context(UnknownCommandFieldSnafu {
            command_field: code,
        })?;
        Ok(DimseMessage {
            command_field,
            command,
            dataset: None,
            transfer_syntax: Cow::Borrowed(IMPLICIT_VR_LITTLE_ENDIAN),
            additional_transfer_syntaxes: Vec::new(),
            presentation_context_id: None,
        })
    }

    /// Decode a command set from its Implicit VR Little Endian encoding.
    pub fn decode_command(bytes: &[u8]) -> Result<Self> {
        let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let command = InMemDicomObject::read_dataset_with_ts(bytes, &ts).context(ReadCommandSnafu)?;
        Self::from_command(command)
    }

    fn new_request(command_field: CommandField, message_id: u16, sop_class_tag: Tag, sop_class_uid: &str) -> Self {
        let command = InMemDicomObject::command_from_element_iter([
            us_element(tags::COMMAND_FIELD, command_field.code()),
            us_element(tags::MESSAGE_ID, message_id),
            uid_element(sop_class_tag, sop_class_uid),
            us_element(tags::COMMAND_DATA_SET_TYPE, NO_DATA_SET),
        ]);
        DimseMessage {
            command_field,
            command,
            dataset: None,
            transfer_syntax: Cow::Borrowed(IMPLICIT_VR_LITTLE_ENDIAN),
            additional_transfer_syntaxes: Vec::new(),
            presentation_context_id: None,
        }
    }

    /// C-ECHO-RQ for the verification SOP class.
    pub fn c_echo_rq(message_id: u16) -> Self {
        Self::new_request(
            CommandField::CEchoRq,
            message_id,
            tags::AFFECTED_SOP_CLASS_UID,
            dicom_net_ul::association::syntax::VERIFICATION,
        )
    }

    /// C-STORE-RQ for a data set natively encoded in the given transfer syntax.
    ///
    /// The affected SOP class and instance are taken from the data set.
    pub fn c_store_rq(
        message_id: u16,
        dataset: InMemDicomObject,
        transfer_syntax: impl Into<Cow<'static, str>>,
    ) -> Result<Self> {
        let sop_class_uid = dataset_uid(&dataset, tags::SOP_CLASS_UID, "SOP Class UID")?;
        let sop_instance_uid = dataset_uid(&dataset, tags::SOP_INSTANCE_UID, "SOP Instance UID")?;
        let mut message = Self::new_request(
            CommandField::CStoreRq,
            message_id,
            tags::AFFECTED_SOP_CLASS_UID,
            &sop_class_uid,
        );
        message.put(uid_element(tags::AFFECTED_SOP_INSTANCE_UID, &sop_instance_uid));
        message.put(us_element(tags::PRIORITY, Priority::Medium.code()));
        message.transfer_syntax = transfer_syntax.into();
        message.dataset = Some(dataset);
        Ok(message)
    }

    /// C-FIND-RQ with the given query identifier.
    pub fn c_find_rq(message_id: u16, sop_class_uid: &str, identifier: InMemDicomObject) -> Self {
        let mut message = Self::new_request(
            CommandField::CFindRq,
            message_id,
            tags::AFFECTED_SOP_CLASS_UID,
            sop_class_uid,
        );
        message.put(us_element(tags::PRIORITY, Priority::Medium.code()));
        message.dataset = Some(identifier);
        message
    }

    /// C-GET-RQ with the given query identifier.
    pub fn c_get_rq(message_id: u16, sop_class_uid: &str, identifier: InMemDicomObject) -> Self {
        let mut message = Self::new_request(
            CommandField::CGetRq,
            message_id,
            tags::AFFECTED_SOP_CLASS_UID,
            sop_class_uid,
        );
        message.put(us_element(tags::PRIORITY, Priority::Medium.code()));
        message.dataset = Some(identifier);
        message
    }

    /// C-MOVE-RQ towards the given destination AE title.
    pub fn c_move_rq(
        message_id: u16,
        sop_class_uid: &str,
        move_destination: &str,
        identifier: InMemDicomObject,
    ) -> Self {
        let mut message = Self::new_request(
            CommandField::CMoveRq,
            message_id,
            tags::AFFECTED_SOP_CLASS_UID,
            sop_class_uid,
        );
        message.put(us_element(tags::PRIORITY, Priority::Medium.code()));
        message.put(DataElement::new(
            tags::MOVE_DESTINATION,
            VR::AE,
            PrimitiveValue::from(move_destination),
        ));
        message.dataset = Some(identifier);
        message
    }

    /// C-CANCEL-RQ for a previously sent request.
    ///
    /// It travels through the presentation context of the cancelled request.
    pub fn c_cancel_rq(message_id_being_responded_to: u16) -> Self {
        let command = InMemDicomObject::command_from_element_iter([
            us_element(tags::COMMAND_FIELD, CommandField::CCancelRq.code()),
            us_element(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                message_id_being_responded_to,
            ),
            us_element(tags::COMMAND_DATA_SET_TYPE, NO_DATA_SET),
        ]);
        DimseMessage {
            command_field: CommandField::CCancelRq,
            command,
            dataset: None,
            transfer_syntax: Cow::Borrowed(IMPLICIT_VR_LITTLE_ENDIAN),
            additional_transfer_syntaxes: Vec::new(),
            presentation_context_id: None,
        }
    }

    fn new_normalized(
        command_field: CommandField,
        message_id: u16,
        sop_class_tag: Tag,
        sop_class_uid: &str,
        sop_instance_tag: Tag,
        sop_instance_uid: &str,
    ) -> Self {
        let mut message = Self::new_request(command_field, message_id, sop_class_tag, sop_class_uid);
        message.put(uid_element(sop_instance_tag, sop_instance_uid));
        message
    }

    pub fn n_event_report_rq(
        message_id: u16,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        event_type_id: u16,
        event_information: Option<InMemDicomObject>,
    ) -> Self {
        let mut message = Self::new_normalized(
            CommandField::NEventReportRq,
            message_id,
            tags::AFFECTED_SOP_CLASS_UID,
            sop_class_uid,
            tags::AFFECTED_SOP_INSTANCE_UID,
            sop_instance_uid,
        );
        message.put(us_element(tags::EVENT_TYPE_ID, event_type_id));
        message.dataset = event_information;
        message
    }

    pub fn n_get_rq(message_id: u16, sop_class_uid: &str, sop_instance_uid: &str) -> Self {
        Self::new_normalized(
            CommandField::NGetRq,
            message_id,
            tags::REQUESTED_SOP_CLASS_UID,
            sop_class_uid,
            tags::REQUESTED_SOP_INSTANCE_UID,
            sop_instance_uid,
        )
    }

    pub fn n_set_rq(
        message_id: u16,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        modification_list: InMemDicomObject,
    ) -> Self {
        let mut message = Self::new_normalized(
            CommandField::NSetRq,
            message_id,
            tags::REQUESTED_SOP_CLASS_UID,
            sop_class_uid,
            tags::REQUESTED_SOP_INSTANCE_UID,
            sop_instance_uid,
        );
        message.dataset = Some(modification_list);
        message
    }

    pub fn n_action_rq(
        message_id: u16,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        action_type_id: u16,
        action_information: Option<InMemDicomObject>,
    ) -> Self {
        let mut message = Self::new_normalized(
            CommandField::NActionRq,
            message_id,
            tags::REQUESTED_SOP_CLASS_UID,
            sop_class_uid,
            tags::REQUESTED_SOP_INSTANCE_UID,
            sop_instance_uid,
        );
        message.put(us_element(tags::ACTION_TYPE_ID, action_type_id));
        message.dataset = action_information;
        message
    }

    /// N-CREATE-RQ, leaving the instance UID to the performer if not given.
    pub fn n_create_rq(
        message_id: u16,
        sop_class_uid: &str,
        sop_instance_uid: Option<&str>,
        attributes: Option<InMemDicomObject>,
    ) -> Self {
        let mut message = Self::new_request(
            CommandField::NCreateRq,
            message_id,
            tags::AFFECTED_SOP_CLASS_UID,
            sop_class_uid,
        );
        if let Some(uid) = sop_instance_uid {
            message.put(uid_element(tags::AFFECTED_SOP_INSTANCE_UID, uid));
        }
        message.dataset = attributes;
        message
    }

    pub fn n_delete_rq(message_id: u16, sop_class_uid: &str, sop_instance_uid: &str) -> Self {
        Self::new_normalized(
            CommandField::NDeleteRq,
            message_id,
            tags::REQUESTED_SOP_CLASS_UID,
            sop_class_uid,
            tags::REQUESTED_SOP_INSTANCE_UID,
            sop_instance_uid,
        )
    }

    /// Form a response to the given request.
    ///
    /// Returns `None` if the request is of a kind which has no response.
    pub fn response_to(request: &DimseMessage, status: Status) -> Option<Self> {
        let command_field = request.command_field.response()?;
        let message_id = request.message_id()?;

        let mut elements = vec![
            us_element(tags::COMMAND_FIELD, command_field.code()),
            us_element(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id),
            us_element(tags::COMMAND_DATA_SET_TYPE, NO_DATA_SET),
            us_element(tags::STATUS, status.code()),
        ];
        if let Some(uid) = request.sop_class_uid() {
            elements.push(uid_element(tags::AFFECTED_SOP_CLASS_UID, &uid));
        }
        if let Some(uid) = request.sop_instance_uid() {
            elements.push(uid_element(tags::AFFECTED_SOP_INSTANCE_UID, &uid));
        }
        if let Some(comment) = status.error_comment() {
            elements.push(DataElement::new(
                tags::ERROR_COMMENT,
                VR::LO,
                PrimitiveValue::from(comment),
            ));
        }
        if let Some(id) = request.action_type_id() {
            elements.push(us_element(tags::ACTION_TYPE_ID, id));
        }
        if let Some(id) = request.event_type_id() {
            elements.push(us_element(tags::EVENT_TYPE_ID, id));
        }

        Some(DimseMessage {
            command_field,
            command: InMemDicomObject::command_from_element_iter(elements),
            dataset: None,
            transfer_syntax: request.transfer_syntax.clone(),
            additional_transfer_syntaxes: Vec::new(),
            presentation_context_id: request.presentation_context_id,
        })
    }

    // --- builder methods ---

    pub fn with_dataset(mut self, dataset: InMemDicomObject) -> Self {
        self.dataset = Some(dataset);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.put(us_element(tags::PRIORITY, priority.code()));
        self
    }

    /// Set the transfer syntax the data set is natively encoded in.
    pub fn with_transfer_syntax(mut self, transfer_syntax: impl Into<Cow<'static, str>>) -> Self {
        self.transfer_syntax = transfer_syntax.into();
        self
    }

    /// Transfer syntaxes to propose besides the native one
    /// when a new presentation context is needed for this message.
    pub fn with_additional_transfer_syntaxes<I, T>(mut self, transfer_syntaxes: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.additional_transfer_syntaxes = transfer_syntaxes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_sub_operations(mut self, counters: SubOperations) -> Self {
        self.put(us_element(tags::NUMBER_OF_REMAINING_SUBOPERATIONS, counters.remaining));
        self.put(us_element(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, counters.completed));
        self.put(us_element(tags::NUMBER_OF_FAILED_SUBOPERATIONS, counters.failed));
        self.put(us_element(tags::NUMBER_OF_WARNING_SUBOPERATIONS, counters.warning));
        self
    }

    /// Identify the C-MOVE request on behalf of which a C-STORE is issued.
    pub fn with_move_originator(mut self, ae_title: &str, message_id: u16) -> Self {
        self.put(DataElement::new(
            tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
            VR::AE,
            PrimitiveValue::from(ae_title),
        ));
        self.put(us_element(tags::MOVE_ORIGINATOR_MESSAGE_ID, message_id));
        self
    }

    pub(crate) fn set_presentation_context_id(&mut self, id: u8) {
        self.presentation_context_id = Some(id);
    }

    pub(crate) fn set_dataset(&mut self, dataset: InMemDicomObject, transfer_syntax: String) {
        self.dataset = Some(dataset);
        self.transfer_syntax = Cow::Owned(transfer_syntax);
    }

    fn put(&mut self, element: InMemElement) {
        self.command.put(element);
    }

    // --- accessors ---

    pub fn command_field(&self) -> CommandField {
        self.command_field
    }

    pub fn command(&self) -> &InMemDicomObject {
        &self.command
    }

    pub fn dataset(&self) -> Option<&InMemDicomObject> {
        self.dataset.as_ref()
    }

    pub fn take_dataset(&mut self) -> Option<InMemDicomObject> {
        self.dataset.take()
    }

    pub fn transfer_syntax(&self) -> &str {
        &self.transfer_syntax
    }

    pub fn additional_transfer_syntaxes(&self) -> &[String] {
        &self.additional_transfer_syntaxes
    }

    /// The presentation context this message was received through,
    /// or is bound to be sent through.
    pub fn presentation_context_id(&self) -> Option<u8> {
        self.presentation_context_id
    }

    fn get_u16(&self, tag: Tag) -> Option<u16> {
        self.command.element(tag).ok()?.to_int::<u16>().ok()
    }

    fn get_uid(&self, tag: Tag) -> Option<String> {
        let value = self.command.element(tag).ok()?.to_str().ok()?;
        Some(value.trim_end_matches(|c| c == '\0' || c == ' ').to_string())
    }

    pub fn message_id(&self) -> Option<u16> {
        self.get_u16(tags::MESSAGE_ID)
    }

    pub fn message_id_being_responded_to(&self) -> Option<u16> {
        self.get_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO)
    }

    /// Whether the command announces a data set.
    pub fn has_dataset(&self) -> bool {
        self.get_u16(tags::COMMAND_DATA_SET_TYPE)
            .map_or(false, |t| t != NO_DATA_SET)
    }

    pub fn status(&self) -> Option<Status> {
        let code = self.get_u16(tags::STATUS)?;
        let status = Status::new(code);
        Some(match self.get_uid(tags::ERROR_COMMENT) {
            Some(comment) if !comment.is_empty() => status.with_error_comment(comment),
            _ => status,
        })
    }

    pub fn affected_sop_class_uid(&self) -> Option<String> {
        self.get_uid(tags::AFFECTED_SOP_CLASS_UID)
    }

    pub fn affected_sop_instance_uid(&self) -> Option<String> {
        self.get_uid(tags::AFFECTED_SOP_INSTANCE_UID)
    }

    pub fn requested_sop_class_uid(&self) -> Option<String> {
        self.get_uid(tags::REQUESTED_SOP_CLASS_UID)
    }

    pub fn requested_sop_instance_uid(&self) -> Option<String> {
        self.get_uid(tags::REQUESTED_SOP_INSTANCE_UID)
    }

    /// The affected SOP class UID, or the requested one.
    pub fn sop_class_uid(&self) -> Option<String> {
        self.affected_sop_class_uid()
            .or_else(|| self.requested_sop_class_uid())
    }

    /// The affected SOP instance UID, or the requested one.
    pub fn sop_instance_uid(&self) -> Option<String> {
        self.affected_sop_instance_uid()
            .or_else(|| self.requested_sop_instance_uid())
    }

    pub fn priority(&self) -> Option<Priority> {
        self.get_u16(tags::PRIORITY).and_then(Priority::from_code)
    }

    pub fn move_destination(&self) -> Option<String> {
        self.get_uid(tags::MOVE_DESTINATION)
    }

    pub fn action_type_id(&self) -> Option<u16> {
        self.get_u16(tags::ACTION_TYPE_ID)
    }

    pub fn event_type_id(&self) -> Option<u16> {
        self.get_u16(tags::EVENT_TYPE_ID)
    }

    pub fn sub_operations(&self) -> Option<SubOperations> {
        Some(SubOperations {
            remaining: self.get_u16(tags::NUMBER_OF_REMAINING_SUBOPERATIONS)?,
            completed: self.get_u16(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS)?,
            failed: self.get_u16(tags::NUMBER_OF_FAILED_SUBOPERATIONS)?,
            warning: self.get_u16(tags::NUMBER_OF_WARNING_SUBOPERATIONS)?,
        })
    }

    // --- encoding ---

    /// Encode the command set in Implicit VR Little Endian,
    /// with its group length and data set type brought up to date.
    pub fn encode_command(&self) -> Result<Vec<u8>> {
        let data_set_type = if self.dataset.is_some() { 0x0000 } else { NO_DATA_SET };
        let elements = self
            .command
            .clone()
            .into_iter()
            .filter(|e| {
                e.header().tag != tags::COMMAND_GROUP_LENGTH
                    && e.header().tag != tags::COMMAND_DATA_SET_TYPE
            })
            .chain(std::iter::once(us_element(
                tags::COMMAND_DATA_SET_TYPE,
                data_set_type,
            )));
        let command = InMemDicomObject::command_from_element_iter(elements);

        let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let mut bytes = Vec::new();
        command
            .write_dataset_with_ts(&mut bytes, &ts)
            .context(WriteCommandSnafu)?;
        Ok(bytes)
    }

    /// Encode the data set, if any, in the given transfer syntax.
    pub fn encode_dataset(&self, transfer_syntax: &str) -> Result<Option<Vec<u8>>> {
        let Some(dataset) = &self.dataset else {
            return Ok(None);
        };
        let ts = TransferSyntaxRegistry
            .get(transfer_syntax)
            .context(UnsupportedTransferSyntaxSnafu {
                uid: transfer_syntax,
            })?;
        let mut bytes = Vec::new();
        dataset
            .write_dataset_with_ts(&mut bytes, ts)
            .context(WriteDatasetSnafu)?;
        Ok(Some(bytes))
    }
}

/// Decode a data set received through a presentation context
/// with the given transfer syntax.
pub fn decode_dataset<R>(source: R, transfer_syntax: &str) -> Result<InMemDicomObject>
where
    R: std::io::Read,
{
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax)
        .context(UnsupportedTransferSyntaxSnafu {
            uid: transfer_syntax,
        })?;
    InMemDicomObject::read_dataset_with_ts(source, ts).context(ReadDatasetSnafu)
}

fn dataset_uid(dataset: &InMemDicomObject, tag: Tag, name: &'static str) -> Result<String> {
    let value = dataset
        .element(tag)
        .ok()
        .context(MissingDatasetElementSnafu { name })?
        .to_str()
        .context(InvalidElementSnafu { name })?;
    Ok(value.trim_end_matches(|c| c == '\0' || c == ' ').to_string())
}
