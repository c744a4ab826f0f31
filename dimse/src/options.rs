//! Options shared by every connection.
use std::time::Duration;

use dicom_net_ul::pdu::DEFAULT_MAX_PDU;

/// Default size of outgoing command and data fragments
/// when the peer did not announce a maximum PDU length.
pub const DEFAULT_BUFFER_SIZE: u32 = 1024 * 1024;

/// Default limit on the size of an incoming command set.
pub const DEFAULT_MAX_COMMAND_SIZE: u32 = 64 * 1024;

/// Default limit on the size of an incoming data set kept in memory.
/// C-STORE data sets go to a store sink instead and are not limited.
pub const DEFAULT_MAX_DATASET_SIZE: u32 = 64 * 1024 * 1024;

/// Options of a message pump,
/// applying to both association requesters and acceptors.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceOptions {
    /// the maximum PDU length this node accepts to receive
    pub(crate) max_pdu_length: u32,
    /// whether to reject incoming PDUs longer than `max_pdu_length`
    pub(crate) strict: bool,
    /// how long to wait for each response to a request
    pub(crate) request_timeout: Option<Duration>,
    /// fragment size for command sets when the peer has no limit
    pub(crate) command_buffer_size: u32,
    /// fragment size for data sets when the peer has no limit
    pub(crate) data_buffer_size: u32,
    /// largest incoming command set, in bytes
    pub(crate) max_command_size: u32,
    /// largest incoming data set held in memory, in bytes
    pub(crate) max_dataset_size: u32,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        ServiceOptions {
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            request_timeout: Some(Duration::from_secs(30)),
            command_buffer_size: DEFAULT_BUFFER_SIZE,
            data_buffer_size: DEFAULT_BUFFER_SIZE,
            max_command_size: DEFAULT_MAX_COMMAND_SIZE,
            max_dataset_size: DEFAULT_MAX_DATASET_SIZE,
        }
    }
}

impl ServiceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the maximum PDU length this node accepts to receive.
    ///
    /// 0 means no limit other than the hard cap of the PDU reader.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override strict mode:
    /// whether incoming PDUs longer than the maximum PDU length are rejected.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Set how long to wait for each response to a request,
    /// `None` waiting indefinitely.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn command_buffer_size(mut self, size: u32) -> Self {
        self.command_buffer_size = size;
        self
    }

    pub fn data_buffer_size(mut self, size: u32) -> Self {
        self.data_buffer_size = size;
        self
    }

    /// Override the largest command set accepted from the peer.
    /// Going over it aborts the association.
    pub fn max_command_size(mut self, size: u32) -> Self {
        self.max_command_size = size;
        self
    }

    /// Override the largest data set accepted from the peer
    /// outside of C-STORE requests.
    /// Going over it aborts the association.
    pub fn max_dataset_size(mut self, size: u32) -> Self {
        self.max_dataset_size = size;
        self
    }

    pub fn get_max_pdu_length(&self) -> u32 {
        self.max_pdu_length
    }

    pub fn get_request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }
}
