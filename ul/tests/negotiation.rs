//! Association negotiation through encoded PDUs,
//! as performed by a requester and an acceptor on each side of a connection.
use dicom_net_ul::association::syntax::{
    is_supported, EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN, VERIFICATION,
};
use dicom_net_ul::association::{AeTitlePolicy, Association, Error, NegotiationResult};
use dicom_net_ul::pdu::reader::read_pdu;
use dicom_net_ul::pdu::writer::write_pdu;
use dicom_net_ul::pdu::{Pdu, PresentationContextResultReason, DEFAULT_MAX_PDU};
use matches::matches;

const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
const MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";

fn through_the_wire(pdu: Pdu) -> Pdu {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdu).unwrap();
    read_pdu(&mut bytes.as_slice(), DEFAULT_MAX_PDU, true).unwrap()
}

#[test]
fn negotiate_over_the_wire() {
    let mut scu = Association::new("MODALITY", "ARCHIVE", AeTitlePolicy::Reject).unwrap();
    let ct = scu
        .presentation_contexts_mut()
        .add_for_store(CT_IMAGE_STORAGE, "1.2.840.10008.1.2.4.50", &[])
        .unwrap();
    let mr = scu
        .presentation_contexts_mut()
        .add_for_store(MR_IMAGE_STORAGE, IMPLICIT_VR_LITTLE_ENDIAN, &[])
        .unwrap();
    let echo = scu.presentation_contexts_mut().add_for_service(VERIFICATION).unwrap();

    let rq = match through_the_wire(scu.to_association_rq().into()) {
        Pdu::AssociationRQ(rq) => rq,
        pdu => panic!("unexpected PDU {:?}", pdu),
    };

    let mut scp = Association::from_association_rq(&rq, DEFAULT_MAX_PDU).unwrap();
    scp.presentation_contexts_mut().negotiate(
        |abstract_syntax| abstract_syntax != MR_IMAGE_STORAGE,
        |ts| ts == EXPLICIT_VR_LITTLE_ENDIAN || ts == IMPLICIT_VR_LITTLE_ENDIAN,
    );

    let ac = match through_the_wire(scp.to_association_ac().into()) {
        Pdu::AssociationAC(ac) => ac,
        pdu => panic!("unexpected PDU {:?}", pdu),
    };
    scu.apply_association_ac(&ac).unwrap();

    let contexts = scu.presentation_contexts();
    assert_eq!(
        contexts.get(ct).unwrap().accepted_transfer_syntax(),
        Some(EXPLICIT_VR_LITTLE_ENDIAN)
    );
    assert_eq!(
        contexts.get(mr).unwrap().result(),
        NegotiationResult::Rejected(PresentationContextResultReason::AbstractSyntaxNotSupported)
    );
    assert!(contexts.get(echo).unwrap().is_accepted());
    assert_eq!(scu.peer_max_pdu_length(), DEFAULT_MAX_PDU);
}

#[test]
fn the_129th_presentation_context_fails() {
    let mut scu = Association::new("SCU", "SCP", AeTitlePolicy::Reject).unwrap();
    for i in 0..128 {
        let id = scu
            .presentation_contexts_mut()
            .add_for_service(&format!("1.2.826.0.1.{}", i))
            .unwrap();
        assert_eq!(id % 2, 1);
    }
    let result = scu
        .presentation_contexts_mut()
        .add_for_service("1.2.826.0.1.999");
    assert!(matches!(result, Err(Error::PresentationContextIdsExhausted { .. })));
}

#[test]
fn validated_ae_titles_reach_the_wire() {
    let scu = Association::new(
        "CALLING-AE-TITLE-WAY-TOO-LONG",
        "SCP",
        AeTitlePolicy::Truncate,
    )
    .unwrap();
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &scu.to_association_rq().into()).unwrap();
    assert_eq!(&bytes[26..42], b"CALLING-AE-TITLE");

    let result = Association::new(
        "CALLING-AE-TITLE-WAY-TOO-LONG",
        "SCP",
        AeTitlePolicy::Reject,
    );
    assert!(matches!(result, Err(Error::InvalidCallingAeTitle { .. })));
}

#[test]
fn registry_supports_native_transfer_syntaxes() {
    assert!(is_supported(IMPLICIT_VR_LITTLE_ENDIAN));
    assert!(is_supported(EXPLICIT_VR_LITTLE_ENDIAN));
    assert!(!is_supported("1.2.3.4.5.6.7"));
}
