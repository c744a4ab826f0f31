use dicom_net_ul::pdu::reader::{read_pdu, Error as ReadError};
use dicom_net_ul::pdu::writer::write_pdu;
use dicom_net_ul::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ,
    AssociationRJResult, AssociationRJServiceProviderASCEReason,
    AssociationRJServiceProviderPresentationReason, AssociationRJServiceUserReason,
    AssociationRJSource, AssociationRQ, CommonExtendedNegotiation, PDataValue, PDataValueType,
    Pdu, PresentationContextProposed, PresentationContextResult,
    PresentationContextResultReason, RoleSelection, UserIdentity, UserIdentityType,
    UserVariableItem, DEFAULT_MAX_PDU,
};
use matches::matches;
use rstest::rstest;
use std::io::Cursor;

fn roundtrip(pdu: &Pdu) -> Result<Pdu, Box<dyn std::error::Error>> {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, pdu)?;
    Ok(read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true)?)
}

fn association_rq() -> AssociationRQ {
    AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "STORE-SCU".to_string(),
        called_ae_title: "STORE-SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2.4.50".to_string(),
                    "1.2.840.10008.1.2.1".to_string(),
                    "1.2.840.10008.1.2".to_string(),
                ],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(32_768),
            UserVariableItem::ImplementationClassUID("1.2.3.4.5".to_string()),
            UserVariableItem::AsyncOperationsWindow(4, 2),
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                scu_role: true,
                scp_role: false,
            }),
            UserVariableItem::ImplementationVersionName("TEST 1.0".to_string()),
            UserVariableItem::SopClassExtendedNegotiationSubItem(
                "1.2.840.10008.5.1.4.1.1.2".to_string(),
                vec![1, 0, 1, 0, 0, 0, 1],
            ),
            UserVariableItem::SopClassCommonExtendedNegotiationSubItem(
                CommonExtendedNegotiation {
                    sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                    service_class_uid: "1.2.840.10008.4.2".to_string(),
                    related_general_sop_classes: vec![
                        "1.2.840.10008.5.1.4.1.1.2.1".to_string(),
                        "1.2.840.10008.5.1.4.1.1.2.2".to_string(),
                    ],
                },
            ),
            UserVariableItem::UserIdentityItem(UserIdentity::new(
                true,
                UserIdentityType::UsernamePassword,
                b"MyUsername".to_vec(),
                b"MyPassword".to_vec(),
            )),
        ],
        unknown_items: vec![],
    }
}

#[test]
fn can_read_write_associate_rq() -> Result<(), Box<dyn std::error::Error>> {
    let pdu: Pdu = association_rq().into();
    assert_eq!(roundtrip(&pdu)?, pdu);
    Ok(())
}

#[test]
fn can_read_write_associate_ac() -> Result<(), Box<dyn std::error::Error>> {
    let pdu: Pdu = AssociationAC {
        protocol_version: 1,
        calling_ae_title: "STORE-SCU".to_string(),
        called_ae_title: "STORE-SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2.1".to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(0),
            UserVariableItem::ImplementationClassUID("1.2.3.4.5.6".to_string()),
            UserVariableItem::AsyncOperationsWindow(0, 1),
            UserVariableItem::UserIdentityServerResponse(b"token".to_vec()),
        ],
        unknown_items: vec![],
    }
    .into();
    assert_eq!(roundtrip(&pdu)?, pdu);
    Ok(())
}

#[rstest]
#[case(AssociationRJResult::Permanent, AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::CalledAETitleNotRecognized))]
#[case(AssociationRJResult::Transient, AssociationRJSource::ServiceProviderASCE(AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported))]
#[case(AssociationRJResult::Transient, AssociationRJSource::ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason::LocalLimitExceeded))]
fn can_read_write_associate_rj(
    #[case] result: AssociationRJResult,
    #[case] source: AssociationRJSource,
) -> Result<(), Box<dyn std::error::Error>> {
    let pdu: Pdu = AssociationRJ { result, source }.into();
    assert_eq!(roundtrip(&pdu)?, pdu);
    Ok(())
}

#[test]
fn can_read_write_pdata() -> Result<(), Box<dyn std::error::Error>> {
    let pdu = Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: 3,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0x02, 0x00, 0x00, 0x00, 0x04, 0x00],
            },
            PDataValue {
                presentation_context_id: 3,
                value_type: PDataValueType::Data,
                is_last: false,
                data: vec![0xAA; 1024],
            },
        ],
    };
    assert_eq!(roundtrip(&pdu)?, pdu);
    Ok(())
}

#[rstest]
#[case(Pdu::ReleaseRQ)]
#[case(Pdu::ReleaseRP)]
#[case(Pdu::AbortRQ { source: AbortRQSource::ServiceUser })]
#[case(Pdu::AbortRQ { source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu) })]
fn can_read_write_control_pdus(#[case] pdu: Pdu) -> Result<(), Box<dyn std::error::Error>> {
    assert_eq!(roundtrip(&pdu)?, pdu);
    Ok(())
}

#[test]
fn unknown_user_variables_survive_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
    let mut rq = association_rq();
    rq.user_variables
        .push(UserVariableItem::Unknown(0x7F, vec![0xDE, 0xAD, 0xBE, 0xEF]));
    let pdu: Pdu = rq.into();
    let result = roundtrip(&pdu)?;
    match result {
        Pdu::AssociationRQ(AssociationRQ { user_variables, .. }) => {
            assert!(user_variables.contains(&UserVariableItem::Unknown(
                0x7F,
                vec![0xDE, 0xAD, 0xBE, 0xEF]
            )));
        }
        other => panic!("unexpected PDU {:?}", other),
    }
    Ok(())
}

#[test]
fn unknown_items_survive_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
    let mut rq = association_rq();
    rq.unknown_items.push((0x6A, vec![0x01, 0x02, 0x03]));
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &rq.clone().into())?;
    // type, reserved byte and length, right after the user information item
    assert_eq!(&bytes[bytes.len() - 7..], &[0x6A, 0x00, 0x00, 0x03, 0x01, 0x02, 0x03]);

    match read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true)? {
        Pdu::AssociationRQ(decoded) => {
            assert_eq!(decoded.unknown_items, vec![(0x6A, vec![0x01, 0x02, 0x03])]);
            assert_eq!(decoded, rq);
        }
        other => panic!("unexpected PDU {:?}", other),
    }
    Ok(())
}

#[test]
fn ae_titles_are_padded_to_16_bytes() -> Result<(), Box<dyn std::error::Error>> {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &association_rq().into())?;
    // header (6) + protocol version (2) + reserved (2)
    assert_eq!(&bytes[10..26], b"STORE-SCP       ");
    assert_eq!(&bytes[26..42], b"STORE-SCU       ");
    Ok(())
}

#[test]
fn strict_mode_rejects_oversized_pdus() -> Result<(), Box<dyn std::error::Error>> {
    let pdu = Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0; 8192],
        }],
    };
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdu)?;

    let result = read_pdu(&mut Cursor::new(&bytes), 4096, true);
    assert!(matches!(result, Err(ReadError::PduTooLarge { .. })));

    let lenient = read_pdu(&mut Cursor::new(&bytes), 4096, false)?;
    assert_eq!(lenient, pdu);
    Ok(())
}
