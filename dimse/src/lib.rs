//! This crate exchanges DIMSE messages with other DICOM nodes
//! over the upper layer protocol,
//! building on the PDU codec and association model of `dicom-net-ul`.
//!
//! - The [`message`] module models DIMSE messages and their command sets,
//!   with [`status`] classifying the status codes of responses.
//! - The [`pump`] module drives a single connection:
//!   association negotiation, message fragmentation and reassembly,
//!   request/response correlation,
//!   the asynchronous operations window and response timeouts.
//! - The [`dispatch`] module routes incoming requests
//!   to service providers.
//! - The [`client`] module sends queued requests to a remote node,
//!   opening and releasing associations as needed.
//! - The [`server`] module accepts connections from remote nodes.
//! - The [`transport`] module abstracts over TCP and TLS streams.
//!
//! Both roles are configured with [`ServiceOptions`](options::ServiceOptions)
//! for what applies to any connection.
//!
//! This crate logs through `tracing` and installs no subscriber.

pub mod client;
pub mod dispatch;
pub mod message;
pub mod options;
pub mod pump;
pub mod server;
pub mod status;
pub mod transport;

// re-exports

pub use client::{CancellationMode, Client, ClientOptions, ClientState};
pub use dispatch::Dispatcher;
pub use message::{CommandField, DimseMessage, MessageIdGenerator};
pub use options::ServiceOptions;
pub use pump::{ConnectionEvent, Pump, PumpBuilder, RequestEvent, RequestHandle};
pub use server::{Server, ServerOptions};
pub use status::Status;
