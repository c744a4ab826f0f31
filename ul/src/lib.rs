//! This crate contains the types and methods needed to interact
//! with DICOM nodes through the upper layer protocol.
//!
//! It is the foundation of the `dicom-net-dimse` crate,
//! which drives actual connections,
//! but it does not perform any network I/O by itself.
//!
//! - The [`pdu`] module
//!   provides data structures representing _protocol data units_,
//!   along with a reader and a writer for their binary form.
//! - The [`association`] module
//!   comprises the model of an association between application entities
//!   and the negotiation of its presentation contexts,
//!   as well as AE title validation and access control policies.

pub mod association;
pub mod pdu;

/// The implementation class UID of this library.
///
/// Automatically generated as per the standard, part 5, section B.2.
///
/// This UID may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.305828488182831875890203105390285383139";

/// The implementation version name of this library.
///
/// This name may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DICOM-NET 0.1.0";

// re-exports

pub use association::{AeTitlePolicy, Association};
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
