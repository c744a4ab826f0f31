//! PDU writer module
//!
//! PDUs are first encoded into a byte buffer.
//! Length-prefixed structures are written by reserving room for the length,
//! writing the content, and then patching the length in place.
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, ResultExt, Snafu};
use std::io::Write;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Chunk of {} PDU structure is too long ({} bytes)", name, length))]
    ChunkTooLong {
        /// the name of the PDU structure
        name: &'static str,
        length: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not write field `{}`", field))]
    WriteField {
        field: &'static str,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("Could not write {} reserved bytes", bytes))]
    WriteReserved {
        bytes: u32,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("Could not encode field `{}`", field))]
    EncodeField {
        field: &'static str,
        source: dicom_encoding::text::EncodeTextError,
    },

    #[snafu(display("Could not write PDU to the output"))]
    WritePdu {
        backtrace: Backtrace,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Write a structure prefixed by its 32-bit big-endian length.
fn write_chunk_u32<F>(buffer: &mut Vec<u8>, name: &'static str, func: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let start = buffer.len();
    buffer.extend_from_slice(&[0; 4]);
    func(buffer)?;

    let length = buffer.len() - start - 4;
    ensure!(
        length <= u32::MAX as usize,
        ChunkTooLongSnafu { name, length }
    );
    buffer[start..start + 4].copy_from_slice(&(length as u32).to_be_bytes());
    Ok(())
}

/// Write a structure prefixed by its 16-bit big-endian length.
fn write_chunk_u16<F>(buffer: &mut Vec<u8>, name: &'static str, func: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let start = buffer.len();
    buffer.extend_from_slice(&[0; 2]);
    func(buffer)?;

    let length = buffer.len() - start - 2;
    ensure!(
        length <= u16::MAX as usize,
        ChunkTooLongSnafu { name, length }
    );
    buffer[start..start + 2].copy_from_slice(&(length as u16).to_be_bytes());
    Ok(())
}

/// Write an item header (type and reserved byte)
/// followed by the content with a 16-bit length.
fn write_item<F>(buffer: &mut Vec<u8>, item_type: u8, name: &'static str, func: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    buffer
        .write_u8(item_type)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    buffer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;
    write_chunk_u16(buffer, name, func)
}

fn write_text(buffer: &mut Vec<u8>, text: &str, field: &'static str) -> Result<()> {
    let bytes = DefaultCharacterSetCodec
        .encode(text)
        .context(EncodeFieldSnafu { field })?;
    buffer.write_all(&bytes).context(WriteFieldSnafu { field })
}

fn write_ae_title(buffer: &mut Vec<u8>, ae_title: &str, field: &'static str) -> Result<()> {
    let mut bytes = DefaultCharacterSetCodec
        .encode(ae_title)
        .context(EncodeFieldSnafu { field })?;
    bytes.resize(16, b' ');
    buffer.write_all(&bytes).context(WriteFieldSnafu { field })
}

/// Encode a PDU and write it to the given writer in a single call.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: ?Sized + Write,
{
    let mut buffer = Vec::new();
    encode_pdu(&mut buffer, pdu)?;
    writer.write_all(&buffer).context(WritePduSnafu)
}

/// Encode a PDU, header included, at the end of the given buffer.
pub fn encode_pdu(buffer: &mut Vec<u8>, pdu: &Pdu) -> Result<()> {
    // 1 - PDU-type
    buffer
        .write_u8(pdu.pdu_type())
        .context(WriteFieldSnafu { field: "PDU-type" })?;

    // 2 - Reserved
    buffer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    // 3-6 - PDU-length
    write_chunk_u32(buffer, "PDU", |buffer| match pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
            unknown_items,
        }) => {
            write_association_header(buffer, *protocol_version, called_ae_title, calling_ae_title)?;
            write_application_context_name(buffer, application_context_name)?;
            for presentation_context in presentation_contexts {
                write_presentation_context_proposed(buffer, presentation_context)?;
            }
            write_user_variables(buffer, user_variables)?;
            write_unknown_items(buffer, unknown_items)
        }
        Pdu::AssociationAC(AssociationAC {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
            unknown_items,
        }) => {
            // 11-42 echo the AE titles of the request
            write_association_header(buffer, *protocol_version, called_ae_title, calling_ae_title)?;
            write_application_context_name(buffer, application_context_name)?;
            for presentation_context in presentation_contexts {
                write_presentation_context_result(buffer, presentation_context)?;
            }
            write_user_variables(buffer, user_variables)?;
            write_unknown_items(buffer, unknown_items)
        }
        Pdu::AssociationRJ(AssociationRJ { result, source }) => {
            // 7 - Reserved
            buffer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            // 8 - Result
            buffer
                .write_u8(*result as u8)
                .context(WriteFieldSnafu { field: "Result" })?;

            // 9 - Source
            buffer
                .write_u8(source.source_code())
                .context(WriteFieldSnafu { field: "Source" })?;

            // 10 - Reason/Diag., only the lower nibble of the combined code
            buffer
                .write_u8(source.reason_code() & 0x0F)
                .context(WriteFieldSnafu {
                    field: "Reason/Diag.",
                })
        }
        Pdu::PData { data } => {
            for pdv in data {
                // 1-4 - Item-length
                write_chunk_u32(buffer, "Presentation-data-value Item", |buffer| {
                    // 5 - Presentation-context-ID
                    buffer
                        .write_u8(pdv.presentation_context_id)
                        .context(WriteFieldSnafu {
                            field: "Presentation-context-ID",
                        })?;

                    // 6 - Message control header
                    buffer
                        .write_u8(pdv.message_control_header())
                        .context(WriteFieldSnafu {
                            field: "Message Control Header",
                        })?;

                    buffer.write_all(&pdv.data).context(WriteFieldSnafu {
                        field: "Presentation-data-value",
                    })
                })?;
            }
            Ok(())
        }
        Pdu::ReleaseRQ | Pdu::ReleaseRP => {
            // 7-10 - Reserved
            buffer
                .write_all(&[0x00; 4])
                .context(WriteReservedSnafu { bytes: 4_u32 })
        }
        Pdu::AbortRQ { source } => {
            // 7-8 - Reserved
            buffer
                .write_all(&[0x00; 2])
                .context(WriteReservedSnafu { bytes: 2_u32 })?;

            // 9 - Source, 10 - Reason/Diag.
            buffer
                .write_all(&source.to_bytes())
                .context(WriteFieldSnafu {
                    field: "Source and Reason/Diag.",
                })
        }
        Pdu::Unknown { data, .. } => buffer
            .write_all(data)
            .context(WriteFieldSnafu { field: "Unknown" }),
    })
}

fn write_association_header(
    buffer: &mut Vec<u8>,
    protocol_version: u16,
    called_ae_title: &str,
    calling_ae_title: &str,
) -> Result<()> {
    // 7-8 - Protocol-version
    buffer
        .write_u16::<BigEndian>(protocol_version)
        .context(WriteFieldSnafu {
            field: "Protocol-version",
        })?;

    // 9-10 - Reserved
    buffer
        .write_u16::<BigEndian>(0x00)
        .context(WriteReservedSnafu { bytes: 2_u32 })?;

    // 11-26 - Called-AE-title, space padded to 16 characters
    write_ae_title(buffer, called_ae_title, "Called-AE-title")?;

    // 27-42 - Calling-AE-title
    write_ae_title(buffer, calling_ae_title, "Calling-AE-title")?;

    // 43-74 - Reserved
    buffer
        .write_all(&[0; 32])
        .context(WriteReservedSnafu { bytes: 32_u32 })
}

fn write_application_context_name(buffer: &mut Vec<u8>, name: &str) -> Result<()> {
    // Application Context Item, 10H
    write_item(buffer, 0x10, "Application Context Item", |buffer| {
        write_text(buffer, name, "Application-context-name")
    })
}

fn write_presentation_context_proposed(
    buffer: &mut Vec<u8>,
    presentation_context: &PresentationContextProposed,
) -> Result<()> {
    // Presentation Context Item (proposed), 20H
    write_item(buffer, 0x20, "Presentation Context Item", |buffer| {
        // 5 - Presentation-context-ID
        buffer
            .write_u8(presentation_context.id)
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;

        // 6-8 - Reserved
        buffer
            .write_all(&[0x00; 3])
            .context(WriteReservedSnafu { bytes: 3_u32 })?;

        // 9-xxx - Abstract Syntax Sub-Item, 30H
        write_item(buffer, 0x30, "Abstract Syntax Sub-Item", |buffer| {
            write_text(
                buffer,
                &presentation_context.abstract_syntax,
                "Abstract-syntax-name",
            )
        })?;

        // Transfer Syntax Sub-Items, 40H
        for transfer_syntax in &presentation_context.transfer_syntaxes {
            write_item(buffer, 0x40, "Transfer Syntax Sub-Item", |buffer| {
                write_text(buffer, transfer_syntax, "Transfer-syntax-name")
            })?;
        }
        Ok(())
    })
}

fn write_presentation_context_result(
    buffer: &mut Vec<u8>,
    presentation_context: &PresentationContextResult,
) -> Result<()> {
    // Presentation Context Item (result), 21H
    write_item(buffer, 0x21, "Presentation Context Item", |buffer| {
        // 5 - Presentation-context-ID
        buffer
            .write_u8(presentation_context.id)
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;

        // 6 - Reserved
        buffer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;

        // 7 - Result/Reason
        buffer
            .write_u8(presentation_context.reason as u8)
            .context(WriteFieldSnafu {
                field: "Result/Reason",
            })?;

        // 8 - Reserved
        buffer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;

        // 9-xxx - Transfer Syntax Sub-Item, 40H
        write_item(buffer, 0x40, "Transfer Syntax Sub-Item", |buffer| {
            write_text(
                buffer,
                &presentation_context.transfer_syntax,
                "Transfer-syntax-name",
            )
        })
    })
}

fn write_u16_prefixed_text(buffer: &mut Vec<u8>, text: &str, field: &'static str) -> Result<()> {
    write_chunk_u16(buffer, field, |buffer| write_text(buffer, text, field))
}

fn write_user_variables(buffer: &mut Vec<u8>, user_variables: &[UserVariableItem]) -> Result<()> {
    // User Information Item, 50H
    write_item(buffer, 0x50, "User Information Item", |buffer| {
        for user_variable in user_variables {
            write_user_variable(buffer, user_variable)?;
        }
        Ok(())
    })
}

fn write_unknown_items(buffer: &mut Vec<u8>, unknown_items: &[(u8, Vec<u8>)]) -> Result<()> {
    for (item_type, data) in unknown_items {
        write_item(buffer, *item_type, "Unknown Item", |buffer| {
            buffer
                .write_all(data)
                .context(WriteFieldSnafu { field: "Unknown-item" })
        })?;
    }
    Ok(())
}

fn write_user_variable(buffer: &mut Vec<u8>, user_variable: &UserVariableItem) -> Result<()> {
    match user_variable {
        UserVariableItem::MaxLength(max_length) => {
            // Maximum Length Sub-Item, 51H
            write_item(buffer, 0x51, "Maximum Length Sub-Item", |buffer| {
                buffer
                    .write_u32::<BigEndian>(*max_length)
                    .context(WriteFieldSnafu {
                        field: "Maximum-length-received",
                    })
            })
        }
        UserVariableItem::ImplementationClassUID(uid) => {
            // Implementation Class UID Sub-Item, 52H
            write_item(buffer, 0x52, "Implementation Class UID Sub-Item", |buffer| {
                write_text(buffer, uid, "Implementation-class-uid")
            })
        }
        UserVariableItem::AsyncOperationsWindow(invoked, performed) => {
            // Asynchronous Operations Window Sub-Item, 53H
            write_item(buffer, 0x53, "Asynchronous Operations Window Sub-Item", |buffer| {
                buffer
                    .write_u16::<BigEndian>(*invoked)
                    .context(WriteFieldSnafu {
                        field: "Maximum-number-operations-invoked",
                    })?;
                buffer
                    .write_u16::<BigEndian>(*performed)
                    .context(WriteFieldSnafu {
                        field: "Maximum-number-operations-performed",
                    })
            })
        }
        UserVariableItem::RoleSelection(role) => {
            // SCP/SCU Role Selection Sub-Item, 54H
            write_item(buffer, 0x54, "SCP/SCU Role Selection Sub-Item", |buffer| {
                write_u16_prefixed_text(buffer, &role.sop_class_uid, "SOP-class-uid")?;
                buffer
                    .write_u8(role.scu_role as u8)
                    .context(WriteFieldSnafu { field: "SCU-role" })?;
                buffer
                    .write_u8(role.scp_role as u8)
                    .context(WriteFieldSnafu { field: "SCP-role" })
            })
        }
        UserVariableItem::ImplementationVersionName(name) => {
            // Implementation Version Name Sub-Item, 55H
            write_item(buffer, 0x55, "Implementation Version Name Sub-Item", |buffer| {
                write_text(buffer, name, "Implementation-version-name")
            })
        }
        UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, data) => {
            // SOP Class Extended Negotiation Sub-Item, 56H
            write_item(buffer, 0x56, "SOP Class Extended Negotiation Sub-Item", |buffer| {
                write_u16_prefixed_text(buffer, sop_class_uid, "SOP-class-uid")?;
                buffer.write_all(data).context(WriteFieldSnafu {
                    field: "Service-class-application-information",
                })
            })
        }
        UserVariableItem::SopClassCommonExtendedNegotiationSubItem(negotiation) => {
            // SOP Class Common Extended Negotiation Sub-Item, 57H
            write_item(
                buffer,
                0x57,
                "SOP Class Common Extended Negotiation Sub-Item",
                |buffer| {
                    write_u16_prefixed_text(buffer, &negotiation.sop_class_uid, "SOP-class-uid")?;
                    write_u16_prefixed_text(
                        buffer,
                        &negotiation.service_class_uid,
                        "Service-class-uid",
                    )?;
                    write_chunk_u16(
                        buffer,
                        "Related-general-sop-class-identification",
                        |buffer| {
                            for uid in &negotiation.related_general_sop_classes {
                                write_u16_prefixed_text(
                                    buffer,
                                    uid,
                                    "Related-general-sop-class-uid",
                                )?;
                            }
                            Ok(())
                        },
                    )
                },
            )
        }
        UserVariableItem::UserIdentityItem(identity) => {
            // User Identity Sub-Item (request), 58H
            write_item(buffer, 0x58, "User Identity Sub-Item", |buffer| {
                buffer
                    .write_u8(identity.identity_type().to_u8())
                    .context(WriteFieldSnafu {
                        field: "User-Identity-type",
                    })?;
                buffer
                    .write_u8(identity.positive_response_requested() as u8)
                    .context(WriteFieldSnafu {
                        field: "User-Identity-positive-response-requested",
                    })?;
                write_chunk_u16(buffer, "User-Identity-primary-field", |buffer| {
                    buffer
                        .write_all(identity.primary_field())
                        .context(WriteFieldSnafu {
                            field: "User-Identity-primary-field",
                        })
                })?;
                write_chunk_u16(buffer, "User-Identity-secondary-field", |buffer| {
                    buffer
                        .write_all(identity.secondary_field())
                        .context(WriteFieldSnafu {
                            field: "User-Identity-secondary-field",
                        })
                })
            })
        }
        UserVariableItem::UserIdentityServerResponse(response) => {
            // User Identity Sub-Item (response), 59H
            write_item(buffer, 0x59, "User Identity Sub-Item", |buffer| {
                write_chunk_u16(buffer, "Server-response", |buffer| {
                    buffer.write_all(response).context(WriteFieldSnafu {
                        field: "Server-response",
                    })
                })
            })
        }
        UserVariableItem::Unknown(item_type, data) => {
            write_item(buffer, *item_type, "Unknown", |buffer| {
                buffer.write_all(data).context(WriteFieldSnafu {
                    field: "Unknown Data",
                })
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_write_chunks_with_preceding_u32_length() -> Result<()> {
        let mut bytes = vec![0u8; 0];
        write_chunk_u32(&mut bytes, "Chunk1", |buffer| {
            buffer
                .write_u8(0x02)
                .context(WriteFieldSnafu { field: "Field1" })?;
            write_chunk_u32(buffer, "Chunk2", |buffer| {
                buffer
                    .write_u8(0x03)
                    .context(WriteFieldSnafu { field: "Field2" })
            })
        })?;

        assert_eq!(bytes, &[0, 0, 0, 6, 2, 0, 0, 0, 1, 3]);
        Ok(())
    }

    #[test]
    fn can_write_chunks_with_preceding_u16_length() -> Result<()> {
        let mut bytes = vec![0xFFu8; 1];
        write_chunk_u16(&mut bytes, "Chunk1", |buffer| {
            buffer
                .write_u8(0x02)
                .context(WriteFieldSnafu { field: "Field1" })?;
            write_chunk_u16(buffer, "Chunk2", |buffer| {
                buffer
                    .write_u8(0x03)
                    .context(WriteFieldSnafu { field: "Field2" })
            })
        })?;

        // the length is patched in place, after the existing content
        assert_eq!(bytes, &[0xFF, 0, 4, 2, 0, 1, 3]);
        Ok(())
    }

    #[test]
    fn u16_chunk_overflow_is_an_error() {
        let mut bytes = vec![];
        let result = write_chunk_u16(&mut bytes, "Big", |buffer| {
            buffer.resize(buffer.len() + 70_000, 0);
            Ok(())
        });
        assert!(matches!(result, Err(Error::ChunkTooLong { name: "Big", .. })));
    }

    #[test]
    fn release_and_abort_layouts() -> Result<()> {
        let mut bytes = vec![];
        encode_pdu(&mut bytes, &Pdu::ReleaseRQ)?;
        assert_eq!(bytes, &[0x05, 0, 0, 0, 0, 4, 0, 0, 0, 0]);

        let mut bytes = vec![];
        encode_pdu(
            &mut bytes,
            &Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::UnexpectedPdu,
                ),
            },
        )?;
        assert_eq!(bytes, &[0x07, 0, 0, 0, 0, 4, 0, 0, 2, 2]);
        Ok(())
    }

    #[test]
    fn reject_reason_is_masked() -> Result<()> {
        let mut bytes = vec![];
        encode_pdu(
            &mut bytes,
            &Pdu::AssociationRJ(AssociationRJ {
                result: AssociationRJResult::Transient,
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized,
                ),
            }),
        )?;
        assert_eq!(bytes, &[0x03, 0, 0, 0, 0, 4, 0, 2, 1, 7]);
        Ok(())
    }

    #[test]
    fn pdv_item_length_includes_header() -> Result<()> {
        let mut bytes = vec![];
        encode_pdu(
            &mut bytes,
            &Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id: 3,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: vec![0xAB; 4],
                }],
            },
        )?;
        assert_eq!(
            bytes,
            &[0x04, 0, 0, 0, 0, 10, 0, 0, 0, 6, 3, 0x03, 0xAB, 0xAB, 0xAB, 0xAB]
        );
        Ok(())
    }
}
