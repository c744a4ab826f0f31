//! Well-known UIDs and transfer syntax support checks.
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;

/// The DICOM application context name
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// Implicit VR Little Endian, the default transfer syntax
pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";

/// Explicit VR Little Endian
pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";

/// Explicit VR Big Endian (retired)
pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";

/// Verification SOP class
pub const VERIFICATION: &str = "1.2.840.10008.1.1";

/// Whether the transfer syntax is one of the uncompressed native encodings,
/// which can be re-encoded into one another without loss.
pub fn is_native_encoding(ts_uid: &str) -> bool {
    matches!(
        trim_uid(ts_uid),
        IMPLICIT_VR_LITTLE_ENDIAN | EXPLICIT_VR_LITTLE_ENDIAN | EXPLICIT_VR_BIG_ENDIAN
    )
}

/// Remove trailing padding from a UID.
pub fn trim_uid(uid: &str) -> &str {
    uid.trim_end_matches(|c: char| c == '\0' || c == ' ')
}

/// Check that a transfer syntax repository
/// supports the given transfer syntax,
/// meaning that it can parse and decode DICOM data sets.
pub fn is_supported_with_repo<R>(ts_repo: R, ts_uid: &str) -> bool
where
    R: TransferSyntaxIndex,
{
    ts_repo
        .get(trim_uid(ts_uid))
        .filter(|ts| !ts.is_unsupported())
        .is_some()
}

/// Check that the main transfer syntax registry
/// supports the given transfer syntax.
///
/// ```
/// # use dicom_net_ul::association::syntax::is_supported;
/// // Implicit VR Little Endian is guaranteed to be supported
/// assert!(is_supported("1.2.840.10008.1.2"));
/// ```
pub fn is_supported(ts_uid: &str) -> bool {
    is_supported_with_repo(TransferSyntaxRegistry, ts_uid)
}

/// From a sequence of transfer syntaxes,
/// choose the first one supported by the main transfer syntax registry.
pub fn choose_supported<I, T>(it: I) -> Option<T>
where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    it.into_iter().find(|ts| is_supported(ts.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_encodings() {
        assert!(is_native_encoding(IMPLICIT_VR_LITTLE_ENDIAN));
        assert!(is_native_encoding("1.2.840.10008.1.2.1\0"));
        assert!(is_native_encoding(EXPLICIT_VR_BIG_ENDIAN));
        assert!(!is_native_encoding("1.2.840.10008.1.2.4.50"));
        assert!(!is_native_encoding("1.2.840.10008.1.2.1.99"));
    }

    #[test]
    fn choose_first_supported() {
        assert_eq!(choose_supported(vec!["1.1.1.1.1"]), None);
        assert_eq!(
            choose_supported(vec!["1.1.1.1.1", EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN]),
            Some(EXPLICIT_VR_LITTLE_ENDIAN),
        );
        assert_eq!(
            choose_supported(vec![
                IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
                EXPLICIT_VR_LITTLE_ENDIAN.to_string()
            ]),
            Some(IMPLICIT_VR_LITTLE_ENDIAN.to_string()),
        );
    }
}
