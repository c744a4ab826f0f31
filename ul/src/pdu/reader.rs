//! PDU reader module
//!
//! Decoding happens in two steps,
//! so that asynchronous transports can read the fixed-size header first
//! and the declared payload afterwards:
//! [`PduHeader::parse`] followed by [`decode_pdu`].
//! [`read_pdu`] composes both over a blocking reader.
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, ReadBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{Cursor, ErrorKind, Read};
use tracing::warn;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Invalid max PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("No PDU available"))]
    NoPduAvailable { backtrace: Backtrace },

    #[snafu(display("Could not read PDU"))]
    ReadPdu {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read PDU item"))]
    ReadPduItem {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read PDU field `{}`", field))]
    ReadPduField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid item length {} (must be >=2)", length))]
    InvalidItemLength { length: u32, backtrace: Backtrace },

    #[snafu(display("Could not read {} reserved bytes", bytes))]
    ReadReserved {
        bytes: u32,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Incoming pdu was too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("PDU contained an unexpected variable item {:?}", var_item))]
    InvalidPduVariable {
        var_item: PduVariableItem,
        backtrace: Backtrace,
    },

    #[snafu(display("Multiple transfer syntaxes were accepted"))]
    MultipleTransferSyntaxesAccepted { backtrace: Backtrace },

    #[snafu(display("Invalid reject result {}", result))]
    InvalidRejectResult { result: u8, backtrace: Backtrace },

    #[snafu(display("Invalid reject source {} or reason {}", source_code, reason))]
    InvalidRejectSourceOrReason {
        source_code: u8,
        reason: u8,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid abort source or reason"))]
    InvalidAbortSourceOrReason { backtrace: Backtrace },

    #[snafu(display("Invalid presentation context result reason {}", reason))]
    InvalidPresentationContextResultReason { reason: u8, backtrace: Backtrace },

    #[snafu(display("Could not decode text field `{}`", field))]
    DecodeText {
        field: &'static str,
        source: dicom_encoding::text::DecodeTextError,
    },

    #[snafu(display("Missing application context name"))]
    MissingApplicationContextName { backtrace: Backtrace },

    #[snafu(display("Missing abstract syntax"))]
    MissingAbstractSyntax { backtrace: Backtrace },

    #[snafu(display("Missing transfer syntax"))]
    MissingTransferSyntax { backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The fixed-size header of a PDU.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PduHeader {
    /// the PDU type code
    pub pdu_type: u8,
    /// the length of the PDU payload, excluding the header
    pub length: u32,
}

impl PduHeader {
    /// Interpret the first 6 bytes of a PDU.
    pub fn parse(bytes: [u8; PDU_HEADER_SIZE as usize]) -> Self {
        PduHeader {
            pdu_type: bytes[0],
            length: u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
        }
    }

    /// Check the declared payload length against the local maximum.
    ///
    /// A `max_pdu_length` of 0 stands for no local maximum,
    /// in which case only the hard cap of [`LARGE_PDU_SIZE`] applies.
    /// In non-strict mode, PDUs above the local maximum
    /// are tolerated up to the hard cap.
    pub fn check_length(&self, max_pdu_length: u32, strict: bool) -> Result<()> {
        let pdu_length = self.length;
        if max_pdu_length == 0 {
            ensure!(
                pdu_length <= LARGE_PDU_SIZE,
                PduTooLargeSnafu {
                    pdu_length,
                    max_pdu_length: LARGE_PDU_SIZE
                }
            );
            return Ok(());
        }

        if strict {
            ensure!(
                pdu_length <= max_pdu_length,
                PduTooLargeSnafu {
                    pdu_length,
                    max_pdu_length
                }
            );
        } else if pdu_length > max_pdu_length {
            ensure!(
                pdu_length <= LARGE_PDU_SIZE,
                PduTooLargeSnafu {
                    pdu_length,
                    max_pdu_length: LARGE_PDU_SIZE
                }
            );
            warn!(
                "Incoming pdu was too large: length {}, maximum is {}",
                pdu_length, max_pdu_length
            );
        }
        Ok(())
    }
}

/// Validate a locally configured maximum PDU length.
pub fn validate_max_pdu_length(max_pdu_length: u32) -> Result<()> {
    ensure!(
        max_pdu_length == 0 || (MINIMUM_PDU_SIZE..=LARGE_PDU_SIZE).contains(&max_pdu_length),
        InvalidMaxPduSnafu { max_pdu_length }
    );
    Ok(())
}

/// Read one full PDU from a blocking reader.
///
/// Fails with [`Error::NoPduAvailable`]
/// if the source ends before the first byte of a new PDU.
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32, strict: bool) -> Result<Pdu>
where
    R: Read,
{
    validate_max_pdu_length(max_pdu_length)?;

    // An end of stream right at the start of a PDU is a clean close,
    // anywhere else it is a truncated PDU.
    let mut header = [0; PDU_HEADER_SIZE as usize];
    if let Err(e) = reader.read_exact(&mut header[..1]) {
        ensure!(e.kind() != ErrorKind::UnexpectedEof, NoPduAvailableSnafu);
        return Err(e).context(ReadPduFieldSnafu { field: "type" });
    }
    reader
        .read_exact(&mut header[1..])
        .context(ReadPduFieldSnafu { field: "length" })?;

    let header = PduHeader::parse(header);
    header.check_length(max_pdu_length, strict)?;

    let bytes = read_n(reader, header.length as usize).context(ReadPduSnafu)?;
    decode_pdu(header.pdu_type, &bytes)
}

/// Decode the payload of a PDU of the given type.
///
/// `bytes` must hold exactly the number of bytes declared in the PDU header.
pub fn decode_pdu(pdu_type: u8, bytes: &[u8]) -> Result<Pdu> {
    let mut cursor = Cursor::new(bytes);
    let codec = DefaultCharacterSetCodec;

    match pdu_type {
        0x01 => {
            // A-ASSOCIATE-RQ
            let header = read_association_header(&mut cursor, &codec)?;

            let mut application_context_name: Option<String> = None;
            let mut presentation_contexts = vec![];
            let mut user_variables = vec![];
            let mut unknown_items = vec![];

            // 75-xxx: one application context item,
            // one or more presentation context items,
            // one user information item
            while has_remaining(&cursor) {
                match read_pdu_variable(&mut cursor, &codec)? {
                    PduVariableItem::ApplicationContext(val) => {
                        application_context_name = Some(val);
                    }
                    PduVariableItem::PresentationContextProposed(val) => {
                        presentation_contexts.push(val);
                    }
                    PduVariableItem::UserVariables(val) => {
                        user_variables = val;
                    }
                    PduVariableItem::Unknown(item_type, content) => {
                        warn!("Keeping unknown A-ASSOCIATE-RQ item type {:02X}H", item_type);
                        unknown_items.push((item_type, content));
                    }
                    var_item => {
                        return InvalidPduVariableSnafu { var_item }.fail();
                    }
                }
            }

            Ok(Pdu::AssociationRQ(AssociationRQ {
                protocol_version: header.protocol_version,
                application_context_name: application_context_name
                    .context(MissingApplicationContextNameSnafu)?,
                called_ae_title: header.called_ae_title,
                calling_ae_title: header.calling_ae_title,
                presentation_contexts,
                user_variables,
                unknown_items,
            }))
        }
        0x02 => {
            // A-ASSOCIATE-AC
            let header = read_association_header(&mut cursor, &codec)?;

            let mut application_context_name: Option<String> = None;
            let mut presentation_contexts = vec![];
            let mut user_variables = vec![];
            let mut unknown_items = vec![];

            while has_remaining(&cursor) {
                match read_pdu_variable(&mut cursor, &codec)? {
                    PduVariableItem::ApplicationContext(val) => {
                        application_context_name = Some(val);
                    }
                    PduVariableItem::PresentationContextResult(val) => {
                        presentation_contexts.push(val);
                    }
                    PduVariableItem::UserVariables(val) => {
                        user_variables = val;
                    }
                    PduVariableItem::Unknown(item_type, content) => {
                        warn!("Keeping unknown A-ASSOCIATE-AC item type {:02X}H", item_type);
                        unknown_items.push((item_type, content));
                    }
                    var_item => {
                        return InvalidPduVariableSnafu { var_item }.fail();
                    }
                }
            }

            Ok(Pdu::AssociationAC(AssociationAC {
                protocol_version: header.protocol_version,
                application_context_name: application_context_name
                    .context(MissingApplicationContextNameSnafu)?,
                called_ae_title: header.called_ae_title,
                calling_ae_title: header.calling_ae_title,
                presentation_contexts,
                user_variables,
                unknown_items,
            }))
        }
        0x03 => {
            // A-ASSOCIATE-RJ

            // 7 - Reserved
            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            // 8 - Result: 1 rejected-permanent, 2 rejected-transient
            let result = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "Result" })?;
            let result =
                AssociationRJResult::from(result).context(InvalidRejectResultSnafu { result })?;

            // 9 - Source: 1 service-user,
            // 2 service-provider (ACSE), 3 service-provider (presentation)
            let source_code = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "Source" })?;

            // 10 - Reason/Diag., a 4-bit value qualified by the source
            let reason = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Reason/Diag.",
            })?;

            let source = AssociationRJSource::from_reason_code((source_code << 4) | (reason & 0x0F))
                .filter(|_| source_code <= 0x0F)
                .context(InvalidRejectSourceOrReasonSnafu {
                    source_code,
                    reason,
                })?;

            Ok(Pdu::AssociationRJ(AssociationRJ { result, source }))
        }
        0x04 => {
            // P-DATA-TF

            // 7-xxx: one or more presentation data value items
            let mut values = vec![];
            while has_remaining(&cursor) {
                // 1-4 - Item-length, counting the context ID,
                // the message control header and the fragment
                let item_length = cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-Length",
                })?;

                ensure!(
                    item_length >= 2,
                    InvalidItemLengthSnafu {
                        length: item_length
                    }
                );

                // 5 - Presentation-context-ID
                let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Presentation-context-ID",
                })?;

                // 6 - Message control header:
                // bit 0 set for command information, unset for data set information;
                // bit 1 set for the last fragment
                let header = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Message Control Header",
                })?;

                let value_type = if header & 0x01 > 0 {
                    PDataValueType::Command
                } else {
                    PDataValueType::Data
                };
                let is_last = (header & 0x02) > 0;

                let data =
                    read_n(&mut cursor, (item_length - 2) as usize).context(ReadPduFieldSnafu {
                        field: "Presentation-data-value",
                    })?;

                values.push(PDataValue {
                    presentation_context_id,
                    value_type,
                    is_last,
                    data,
                })
            }

            Ok(Pdu::PData { data: values })
        }
        0x05 => {
            // A-RELEASE-RQ, 7-10 - Reserved
            read_n(&mut cursor, 4).context(ReadReservedSnafu { bytes: 4_u32 })?;
            Ok(Pdu::ReleaseRQ)
        }
        0x06 => {
            // A-RELEASE-RP, 7-10 - Reserved
            read_n(&mut cursor, 4).context(ReadReservedSnafu { bytes: 4_u32 })?;
            Ok(Pdu::ReleaseRP)
        }
        0x07 => {
            // A-ABORT

            // 7-8 - Reserved
            read_n(&mut cursor, 2).context(ReadReservedSnafu { bytes: 2_u32 })?;

            // 9 - Source: 0 service-user, 1 reserved, 2 service-provider
            // 10 - Reason/Diag., significant for service-provider aborts only
            let source = AbortRQSource::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Reason/Diag",
                })?,
            )
            .context(InvalidAbortSourceOrReasonSnafu)?;

            Ok(Pdu::AbortRQ { source })
        }
        _ => Ok(Pdu::Unknown {
            pdu_type,
            data: bytes.to_vec(),
        }),
    }
}

/// The fixed fields shared by A-ASSOCIATE-RQ and A-ASSOCIATE-AC.
struct AssociationHeader {
    protocol_version: u16,
    called_ae_title: String,
    calling_ae_title: String,
}

fn read_association_header(
    cursor: &mut Cursor<&[u8]>,
    codec: &dyn TextCodec,
) -> Result<AssociationHeader> {
    // 7-8 - Protocol-version, bit 0 set for version 1
    let protocol_version = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Protocol-version",
    })?;

    // 9-10 - Reserved
    cursor
        .read_u16::<BigEndian>()
        .context(ReadReservedSnafu { bytes: 2_u32 })?;

    // 11-26 - Called-AE-title, 16 characters,
    // leading and trailing spaces are not significant
    let called_ae_title = read_ae_title(cursor, codec, "Called-AE-title")?;

    // 27-42 - Calling-AE-title
    let calling_ae_title = read_ae_title(cursor, codec, "Calling-AE-title")?;

    // 43-74 - Reserved
    read_n(cursor, 32).context(ReadReservedSnafu { bytes: 32_u32 })?;

    Ok(AssociationHeader {
        protocol_version,
        called_ae_title,
        calling_ae_title,
    })
}

fn read_ae_title(
    cursor: &mut Cursor<&[u8]>,
    codec: &dyn TextCodec,
    field: &'static str,
) -> Result<String> {
    let mut ae_bytes = [0; 16];
    cursor
        .read_exact(&mut ae_bytes)
        .context(ReadPduFieldSnafu { field })?;
    Ok(codec
        .decode(&ae_bytes)
        .context(DecodeTextSnafu { field })?
        .trim()
        .to_string())
}

/// Decode a UID, dropping trailing null padding and surrounding spaces.
fn decode_uid(codec: &dyn TextCodec, bytes: &[u8], field: &'static str) -> Result<String> {
    let text = codec.decode(bytes).context(DecodeTextSnafu { field })?;
    Ok(text
        .trim_end_matches('\0')
        .trim()
        .to_string())
}

fn has_remaining(cursor: &Cursor<&[u8]>) -> bool {
    cursor.position() < cursor.get_ref().len() as u64
}

/// Read exactly `bytes_to_read` bytes,
/// failing with `UnexpectedEof` if the source ends earlier.
fn read_n<R>(reader: &mut R, bytes_to_read: usize) -> std::io::Result<Vec<u8>>
where
    R: Read,
{
    let mut result = Vec::new();
    reader.take(bytes_to_read as u64).read_to_end(&mut result)?;
    if result.len() < bytes_to_read {
        return Err(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            "item extends past the end of its enclosing structure",
        ));
    }
    Ok(result)
}

/// Read a 16-bit length followed by that many bytes.
fn read_u16_prefixed<R>(reader: &mut R, field: &'static str) -> Result<Vec<u8>>
where
    R: Read,
{
    let length = reader
        .read_u16::<BigEndian>()
        .context(ReadPduFieldSnafu { field })?;
    read_n(reader, length as usize).context(ReadPduFieldSnafu { field })
}

/// Read the header of a variable item or sub-item,
/// returning its type and content.
fn read_item<R>(reader: &mut R) -> Result<(u8, Vec<u8>)>
where
    R: Read,
{
    // 1 - Item-type
    let item_type = reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;

    // 2 - Reserved
    reader
        .read_u8()
        .context(ReadReservedSnafu { bytes: 1_u32 })?;

    // 3-4 - Item-length
    let item_length = reader.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Item-length",
    })?;

    let bytes = read_n(reader, item_length as usize).context(ReadPduItemSnafu)?;
    Ok((item_type, bytes))
}

fn read_pdu_variable<R>(reader: &mut R, codec: &dyn TextCodec) -> Result<PduVariableItem>
where
    R: Read,
{
    let (item_type, bytes) = read_item(reader)?;
    let mut cursor = Cursor::new(bytes.as_slice());

    match item_type {
        0x10 => {
            // Application Context Item
            let val = decode_uid(codec, &bytes, "Application-context-name")?;
            Ok(PduVariableItem::ApplicationContext(val))
        }
        0x20 => {
            // Presentation Context Item (proposed)

            // 5 - Presentation-context-ID, odd between 1 and 255
            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;

            // 6-8 - Reserved
            read_n(&mut cursor, 3).context(ReadReservedSnafu { bytes: 3_u32 })?;

            // 9-xxx: one abstract syntax sub-item
            // and one or more transfer syntax sub-items
            let mut abstract_syntax: Option<String> = None;
            let mut transfer_syntaxes = vec![];
            while has_remaining(&cursor) {
                let (sub_item_type, content) = read_item(&mut cursor)?;
                match sub_item_type {
                    0x30 => {
                        abstract_syntax =
                            Some(decode_uid(codec, &content, "Abstract-syntax-name")?);
                    }
                    0x40 => {
                        transfer_syntaxes.push(decode_uid(
                            codec,
                            &content,
                            "Transfer-syntax-name",
                        )?);
                    }
                    _ => {
                        warn!(
                            "Skipping unknown presentation context sub-item type {:02X}H",
                            sub_item_type
                        );
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextProposed(
                PresentationContextProposed {
                    id: presentation_context_id,
                    abstract_syntax: abstract_syntax.context(MissingAbstractSyntaxSnafu)?,
                    transfer_syntaxes,
                },
            ))
        }
        0x21 => {
            // Presentation Context Item (result)

            // 5 - Presentation-context-ID
            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;

            // 6 - Reserved
            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            // 7 - Result/Reason
            let reason = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Result/Reason",
            })?;
            let reason = PresentationContextResultReason::from(reason)
                .context(InvalidPresentationContextResultReasonSnafu { reason })?;

            // 8 - Reserved
            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            // 9-xxx: one transfer syntax sub-item,
            // not significant unless accepted
            let mut transfer_syntax: Option<String> = None;
            while has_remaining(&cursor) {
                let (sub_item_type, content) = read_item(&mut cursor)?;
                match sub_item_type {
                    0x40 => {
                        ensure!(
                            transfer_syntax.is_none(),
                            MultipleTransferSyntaxesAcceptedSnafu
                        );
                        transfer_syntax =
                            Some(decode_uid(codec, &content, "Transfer-syntax-name")?);
                    }
                    _ => {
                        warn!(
                            "Skipping unknown presentation context sub-item type {:02X}H",
                            sub_item_type
                        );
                    }
                }
            }

            let transfer_syntax = match (transfer_syntax, reason) {
                (Some(ts), _) => ts,
                (None, PresentationContextResultReason::Acceptance) => {
                    return MissingTransferSyntaxSnafu.fail();
                }
                (None, _) => String::new(),
            };

            Ok(PduVariableItem::PresentationContextResult(
                PresentationContextResult {
                    id: presentation_context_id,
                    reason,
                    transfer_syntax,
                },
            ))
        }
        0x50 => {
            // User Information Item, 5-xxx: user data sub-items
            let mut user_variables = vec![];
            while has_remaining(&cursor) {
                let (sub_item_type, content) = read_item(&mut cursor)?;
                user_variables.push(read_user_variable(sub_item_type, content, codec)?);
            }
            Ok(PduVariableItem::UserVariables(user_variables))
        }
        _ => Ok(PduVariableItem::Unknown(item_type, bytes)),
    }
}

fn read_user_variable(
    item_type: u8,
    content: Vec<u8>,
    codec: &dyn TextCodec,
) -> Result<UserVariableItem> {
    let mut cursor = Cursor::new(content.as_slice());

    let item = match item_type {
        0x51 => {
            // Maximum Length Sub-Item, 5-8 - Maximum-length-received,
            // 0 meaning no maximum
            UserVariableItem::MaxLength(cursor.read_u32::<BigEndian>().context(
                ReadPduFieldSnafu {
                    field: "Maximum-length-received",
                },
            )?)
        }
        0x52 => {
            // Implementation Class UID Sub-Item
            UserVariableItem::ImplementationClassUID(decode_uid(
                codec,
                &content,
                "Implementation-class-uid",
            )?)
        }
        0x53 => {
            // Asynchronous Operations Window Sub-Item

            // 5-6 - Maximum-number-operations-invoked
            let invoked = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Maximum-number-operations-invoked",
            })?;
            // 7-8 - Maximum-number-operations-performed
            let performed = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Maximum-number-operations-performed",
            })?;
            UserVariableItem::AsyncOperationsWindow(invoked, performed)
        }
        0x54 => {
            // SCP/SCU Role Selection Sub-Item

            // 5-6 - UID-length, 7-xxx - SOP-class-uid
            let uid = read_u16_prefixed(&mut cursor, "SOP-class-uid")?;
            let sop_class_uid = decode_uid(codec, &uid, "SOP-class-uid")?;
            // xxx+1 - SCU-role, xxx+2 - SCP-role
            let scu_role = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "SCU-role" })?;
            let scp_role = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "SCP-role" })?;
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid,
                scu_role: scu_role != 0,
                scp_role: scp_role != 0,
            })
        }
        0x55 => {
            // Implementation Version Name Sub-Item
            let name = codec
                .decode(&content)
                .context(DecodeTextSnafu {
                    field: "Implementation-version-name",
                })?
                .trim()
                .to_string();
            UserVariableItem::ImplementationVersionName(name)
        }
        0x56 => {
            // SOP Class Extended Negotiation Sub-Item

            // 5-6 - SOP-class-uid-length, 7-xxx - SOP-class-uid
            let uid = read_u16_prefixed(&mut cursor, "SOP-class-uid")?;
            let sop_class_uid = decode_uid(codec, &uid, "SOP-class-uid")?;

            // xxx-xxx - Service-class-application-information,
            // running to the end of the sub-item
            let start = cursor.position() as usize;
            let data = content[start..].to_vec();

            UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, data)
        }
        0x57 => {
            // SOP Class Common Extended Negotiation Sub-Item

            // 5-6 - SOP-class-uid-length, 7-x - SOP-class-uid
            let uid = read_u16_prefixed(&mut cursor, "SOP-class-uid")?;
            let sop_class_uid = decode_uid(codec, &uid, "SOP-class-uid")?;

            // Service-class-uid-length, Service-class-uid
            let uid = read_u16_prefixed(&mut cursor, "Service-class-uid")?;
            let service_class_uid = decode_uid(codec, &uid, "Service-class-uid")?;

            // Related-general-sop-class-identification-length,
            // followed by length-prefixed UIDs
            let related = read_u16_prefixed(
                &mut cursor,
                "Related-general-sop-class-identification",
            )?;
            let mut related_cursor = Cursor::new(related.as_slice());
            let mut related_general_sop_classes = vec![];
            while has_remaining(&related_cursor) {
                let uid = read_u16_prefixed(&mut related_cursor, "Related-general-sop-class-uid")?;
                related_general_sop_classes.push(decode_uid(
                    codec,
                    &uid,
                    "Related-general-sop-class-uid",
                )?);
            }

            UserVariableItem::SopClassCommonExtendedNegotiationSubItem(CommonExtendedNegotiation {
                sop_class_uid,
                service_class_uid,
                related_general_sop_classes,
            })
        }
        0x58 => {
            // User Identity Negotiation Sub-Item (request)

            // 5 - User-Identity-Type
            let user_identity_type = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "User-Identity-type",
            })?;

            // 6 - Positive-response-requested
            let positive_response_requested = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "User-Identity-positive-response-requested",
            })?;

            // 7-8 - Primary-field-length, 9-n - Primary-field
            let primary_field =
                read_u16_prefixed(&mut cursor, "User-Identity-primary-field")?;

            // n+1-n+2 - Secondary-field-length, n+3-m - Secondary-field,
            // only non-empty for username and password
            let secondary_field =
                read_u16_prefixed(&mut cursor, "User-Identity-secondary-field")?;

            match UserIdentityType::from(user_identity_type) {
                Some(identity_type) => UserVariableItem::UserIdentityItem(UserIdentity::new(
                    positive_response_requested == 1,
                    identity_type,
                    primary_field,
                    secondary_field,
                )),
                None => {
                    warn!("Unknown User Identity Type code {}", user_identity_type);
                    UserVariableItem::Unknown(item_type, content)
                }
            }
        }
        0x59 => {
            // User Identity Negotiation Sub-Item (response)

            // 5-6 - Server-response-length, 7-xxx - Server-response
            let response = read_u16_prefixed(&mut cursor, "Server-response")?;
            UserVariableItem::UserIdentityServerResponse(response)
        }
        _ => UserVariableItem::Unknown(item_type, content),
    };

    Ok(item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::matches;

    #[test]
    fn empty_source_has_no_pdu() {
        let bytes: &[u8] = &[];
        let result = read_pdu(&mut Cursor::new(bytes), DEFAULT_MAX_PDU, true);
        assert!(matches!(result, Err(Error::NoPduAvailable { .. })));
    }

    #[test]
    fn truncated_pdu_is_an_error() {
        // A-RELEASE-RQ declaring 4 bytes but carrying 2
        let bytes: &[u8] = &[0x05, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00];
        let result = read_pdu(&mut Cursor::new(bytes), DEFAULT_MAX_PDU, true);
        assert!(matches!(result, Err(Error::ReadPdu { .. })));
    }

    #[test]
    fn pdv_past_pdu_end_is_a_framing_error() {
        // P-DATA-TF with a PDV item claiming 16 bytes in a 10 byte payload
        let bytes: &[u8] = &[
            0x00, 0x00, 0x00, 0x10, // item length
            0x01, 0x03, // context 1, last command fragment
            0xAA, 0xBB, 0xCC, 0xDD,
        ];
        let result = decode_pdu(0x04, bytes);
        assert!(matches!(
            result,
            Err(Error::ReadPduField {
                field: "Presentation-data-value",
                ..
            })
        ));
    }

    #[test]
    fn pdu_length_limits() {
        let header = PduHeader::parse([0x04, 0x00, 0x00, 0x00, 0x50, 0x00]);
        assert_eq!(header.pdu_type, 0x04);
        assert_eq!(header.length, 0x5000);

        assert!(matches!(
            header.check_length(DEFAULT_MAX_PDU, true),
            Err(Error::PduTooLarge { .. })
        ));
        assert!(header.check_length(DEFAULT_MAX_PDU, false).is_ok());
        assert!(header.check_length(0, true).is_ok());

        let header = PduHeader::parse([0x04, 0x00, 0x01, 0x00, 0x00, 0x00]);
        assert!(matches!(
            header.check_length(0, false),
            Err(Error::PduTooLarge { .. })
        ));
    }

    #[test]
    fn invalid_local_maximum() {
        assert!(validate_max_pdu_length(0).is_ok());
        assert!(validate_max_pdu_length(DEFAULT_MAX_PDU).is_ok());
        assert!(matches!(
            validate_max_pdu_length(100),
            Err(Error::InvalidMaxPdu { .. })
        ));
    }

    #[test]
    fn reject_reason_is_combined_with_source() {
        let bytes: &[u8] = &[0x00, 0x01, 0x03, 0x02];
        let pdu = decode_pdu(0x03, bytes).unwrap();
        assert_eq!(
            pdu,
            Pdu::AssociationRJ(AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceProviderPresentation(
                    AssociationRJServiceProviderPresentationReason::LocalLimitExceeded
                ),
            })
        );
        if let Pdu::AssociationRJ(rj) = pdu {
            assert_eq!(rj.source.reason_code(), 0x32);
        }
    }

    #[test]
    fn unknown_user_sub_items_are_kept() {
        let item = read_user_variable(0x5F, vec![1, 2, 3], &DefaultCharacterSetCodec).unwrap();
        assert_eq!(item, UserVariableItem::Unknown(0x5F, vec![1, 2, 3]));
    }

    #[test]
    fn unknown_pdu_type_is_kept() {
        let pdu = decode_pdu(0x0A, &[1, 2]).unwrap();
        assert_eq!(
            pdu,
            Pdu::Unknown {
                pdu_type: 0x0A,
                data: vec![1, 2]
            }
        );
    }
}
