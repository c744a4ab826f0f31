//! DIMSE status codes and their classification.
use std::fmt;

/// Standard status codes.
pub mod code {
    pub const SUCCESS: u16 = 0x0000;
    pub const WARNING: u16 = 0x0001;
    pub const CANCEL: u16 = 0xFE00;
    pub const PENDING: u16 = 0xFF00;
    pub const PENDING_OPTIONAL_KEYS_NOT_SUPPORTED: u16 = 0xFF01;

    pub const INVALID_ATTRIBUTE_VALUE: u16 = 0x0106;
    pub const ATTRIBUTE_LIST_ERROR: u16 = 0x0107;
    pub const PROCESSING_FAILURE: u16 = 0x0110;
    pub const DUPLICATE_SOP_INSTANCE: u16 = 0x0111;
    pub const NO_SUCH_OBJECT_INSTANCE: u16 = 0x0112;
    pub const NO_SUCH_EVENT_TYPE: u16 = 0x0113;
    pub const NO_SUCH_ARGUMENT: u16 = 0x0114;
    pub const INVALID_ARGUMENT_VALUE: u16 = 0x0115;
    pub const ATTRIBUTE_VALUE_OUT_OF_RANGE: u16 = 0x0116;
    pub const INVALID_OBJECT_INSTANCE: u16 = 0x0117;
    pub const NO_SUCH_SOP_CLASS: u16 = 0x0118;
    pub const CLASS_INSTANCE_CONFLICT: u16 = 0x0119;
    pub const MISSING_ATTRIBUTE: u16 = 0x0120;
    pub const MISSING_ATTRIBUTE_VALUE: u16 = 0x0121;
    pub const SOP_CLASS_NOT_SUPPORTED: u16 = 0x0122;
    pub const NO_SUCH_ACTION_TYPE: u16 = 0x0123;
    pub const DUPLICATE_INVOCATION: u16 = 0x0210;
    pub const UNRECOGNIZED_OPERATION: u16 = 0x0211;
    pub const MISTYPED_ARGUMENT: u16 = 0x0212;
    pub const RESOURCE_LIMITATION: u16 = 0x0213;

    pub const OUT_OF_RESOURCES: u16 = 0xA700;
    pub const UNABLE_TO_CALCULATE_NUMBER_OF_MATCHES: u16 = 0xA701;
    pub const UNABLE_TO_PERFORM_SUB_OPERATIONS: u16 = 0xA702;
    pub const MOVE_DESTINATION_UNKNOWN: u16 = 0xA801;
    pub const DATA_SET_DOES_NOT_MATCH_SOP_CLASS: u16 = 0xA900;
    pub const COERCION_OF_DATA_ELEMENTS: u16 = 0xB000;
    pub const ELEMENTS_DISCARDED: u16 = 0xB006;
    pub const DATA_SET_DOES_NOT_MATCH_SOP_CLASS_WARNING: u16 = 0xB007;
    pub const CANNOT_UNDERSTAND: u16 = 0xC000;
}

/// The coarse state of a DIMSE status.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum StatusState {
    Success,
    Pending,
    Warning,
    Cancel,
    Failure,
}

impl StatusState {
    /// Classify a status code.
    pub fn of(code: u16) -> Self {
        match code {
            code::SUCCESS => StatusState::Success,
            code::PENDING | code::PENDING_OPTIONAL_KEYS_NOT_SUPPORTED => StatusState::Pending,
            code::CANCEL => StatusState::Cancel,
            code::WARNING | code::ATTRIBUTE_LIST_ERROR | code::ATTRIBUTE_VALUE_OUT_OF_RANGE => {
                StatusState::Warning
            }
            c if c & 0xF000 == 0xB000 => StatusState::Warning,
            _ => StatusState::Failure,
        }
    }
}

impl fmt::Display for StatusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StatusState::Success => "Success",
            StatusState::Pending => "Pending",
            StatusState::Warning => "Warning",
            StatusState::Cancel => "Cancel",
            StatusState::Failure => "Failure",
        })
    }
}

/// A DIMSE status: a code and an optional error comment.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Status {
    code: u16,
    error_comment: Option<String>,
}

impl Status {
    pub const fn new(code: u16) -> Self {
        Status {
            code,
            error_comment: None,
        }
    }

    pub const fn success() -> Self {
        Status::new(code::SUCCESS)
    }

    pub const fn pending() -> Self {
        Status::new(code::PENDING)
    }

    pub fn with_error_comment(mut self, comment: impl Into<String>) -> Self {
        self.error_comment = Some(comment.into());
        self
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn error_comment(&self) -> Option<&str> {
        self.error_comment.as_deref()
    }

    pub fn state(&self) -> StatusState {
        StatusState::of(self.code)
    }

    pub fn is_success(&self) -> bool {
        self.state() == StatusState::Success
    }

    /// Whether more responses to the same request are to follow.
    pub fn is_pending(&self) -> bool {
        self.state() == StatusState::Pending
    }

    pub fn is_failure(&self) -> bool {
        self.state() == StatusState::Failure
    }

    /// A human readable description of the code, if it is a known one.
    pub fn description(&self) -> Option<&'static str> {
        let desc = match self.code {
            code::SUCCESS => "Success",
            code::WARNING => "Warning",
            code::CANCEL => "Cancel",
            code::PENDING => "Pending",
            code::PENDING_OPTIONAL_KEYS_NOT_SUPPORTED => "Optional keys not supported",
            code::INVALID_ATTRIBUTE_VALUE => "Invalid attribute value",
            code::ATTRIBUTE_LIST_ERROR => "Attribute list error",
            code::PROCESSING_FAILURE => "Processing failure",
            code::DUPLICATE_SOP_INSTANCE => "Duplicate SOP instance",
            code::NO_SUCH_OBJECT_INSTANCE => "No such object instance",
            code::NO_SUCH_EVENT_TYPE => "No such event type",
            code::NO_SUCH_ARGUMENT => "No such argument",
            code::INVALID_ARGUMENT_VALUE => "Invalid argument value",
            code::ATTRIBUTE_VALUE_OUT_OF_RANGE => "Attribute value out of range",
            code::INVALID_OBJECT_INSTANCE => "Invalid object instance",
            code::NO_SUCH_SOP_CLASS => "No such SOP class",
            code::CLASS_INSTANCE_CONFLICT => "Class-instance conflict",
            code::MISSING_ATTRIBUTE => "Missing attribute",
            code::MISSING_ATTRIBUTE_VALUE => "Missing attribute value",
            code::SOP_CLASS_NOT_SUPPORTED => "Refused: SOP class not supported",
            code::NO_SUCH_ACTION_TYPE => "No such action type",
            code::DUPLICATE_INVOCATION => "Duplicate invocation",
            code::UNRECOGNIZED_OPERATION => "Unrecognized operation",
            code::MISTYPED_ARGUMENT => "Mistyped argument",
            code::RESOURCE_LIMITATION => "Resource limitation",
            code::OUT_OF_RESOURCES => "Out of resources",
            code::UNABLE_TO_CALCULATE_NUMBER_OF_MATCHES => "Unable to calculate number of matches",
            code::UNABLE_TO_PERFORM_SUB_OPERATIONS => "Unable to perform sub-operations",
            code::MOVE_DESTINATION_UNKNOWN => "Move destination unknown",
            code::DATA_SET_DOES_NOT_MATCH_SOP_CLASS => "Data set does not match SOP class",
            code::COERCION_OF_DATA_ELEMENTS => "Coercion of data elements",
            code::ELEMENTS_DISCARDED => "Elements discarded",
            code::DATA_SET_DOES_NOT_MATCH_SOP_CLASS_WARNING => {
                "Data set does not match SOP class (warning)"
            }
            c if c & 0xF000 == 0xC000 => "Cannot understand",
            c if c & 0xFF00 == 0xA700 => "Out of resources",
            _ => return None,
        };
        Some(desc)
    }
}

impl From<u16> for Status {
    fn from(code: u16) -> Self {
        Status::new(code)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.description() {
            Some(desc) => write!(f, "{} [0x{:04X}: {}]", self.state(), self.code, desc)?,
            None => write!(f, "{} [0x{:04X}]", self.state(), self.code)?,
        }
        if let Some(comment) = &self.error_comment {
            write!(f, " {}", comment)?;
        }
        Ok(())
    }
}
