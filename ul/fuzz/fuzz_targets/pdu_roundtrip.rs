#![no_main]
use std::error::Error;

use dicom_net_ul::pdu::{reader::read_pdu, writer::write_pdu, LARGE_PDU_SIZE};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (u32, bool, &[u8])| {
    let (maxlen, strict, data) = data;
    let _ = fuzz(maxlen % (LARGE_PDU_SIZE + 1), strict, data);
});

fn fuzz(maxlen: u32, strict: bool, mut data: &[u8]) -> Result<(), Box<dyn Error>> {
    let pdu = read_pdu(&mut data, maxlen, strict)?;

    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdu)?;

    // lengths may grow on rewrite (AE title padding), so read back leniently
    let pdu2 = read_pdu(&mut bytes.as_slice(), 0, false)
        .expect("serialized pdu should always deserialize");

    assert_eq!(
        pdu.short_description().to_string(),
        pdu2.short_description().to_string(),
        "pdu should be equivalent after serializing to/from bytes"
    );

    Ok(())
}
