//! Application entity title validation.
use std::borrow::Cow;

use snafu::ensure;

use super::{AeTitleEmptySnafu, AeTitleInvalidCharacterSnafu, AeTitleTooLongSnafu, Result};

/// The maximum length of an application entity title
pub const MAX_AE_TITLE_LENGTH: usize = 16;

/// What to do with an application entity title
/// longer than [`MAX_AE_TITLE_LENGTH`] characters.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AeTitlePolicy {
    /// Keep the first 16 characters
    #[default]
    Truncate,
    /// Fail with an error
    Reject,
}

/// Validate an application entity title according to the given policy,
/// returning the value which should be placed on the wire.
///
/// Leading and trailing spaces are not significant and are removed.
/// Titles made of spaces only,
/// or containing control characters or backslashes,
/// are rejected regardless of policy.
pub fn validate_ae_title<'a>(title: &'a str, policy: AeTitlePolicy) -> Result<Cow<'a, str>> {
    let trimmed = title.trim_matches(' ');
    ensure!(!trimmed.is_empty(), AeTitleEmptySnafu);
    ensure!(
        trimmed.chars().all(|c| c.is_ascii() && !c.is_ascii_control() && c != '\\'),
        AeTitleInvalidCharacterSnafu { title: trimmed }
    );

    let length = trimmed.chars().count();
    if length <= MAX_AE_TITLE_LENGTH {
        return Ok(Cow::Borrowed(trimmed));
    }

    match policy {
        AeTitlePolicy::Reject => AeTitleTooLongSnafu {
            title: trimmed,
            length,
        }
        .fail(),
        AeTitlePolicy::Truncate => {
            let truncated: String = trimmed.chars().take(MAX_AE_TITLE_LENGTH).collect();
            tracing::warn!("AE title `{}` truncated to `{}`", trimmed, truncated);
            Ok(Cow::Owned(truncated.trim_end_matches(' ').to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::Error;
    use matches::matches;
    use rstest::rstest;

    #[rstest]
    #[case("STORE-SCP", "STORE-SCP")]
    #[case("  ANY-SCP  ", "ANY-SCP")]
    #[case("SIXTEEN-CHARS-AE", "SIXTEEN-CHARS-AE")]
    fn valid_titles_pass(#[case] input: &str, #[case] expected: &str) {
        for policy in [AeTitlePolicy::Truncate, AeTitlePolicy::Reject] {
            assert_eq!(validate_ae_title(input, policy).unwrap(), expected);
        }
    }

    #[test]
    fn long_titles_follow_policy() {
        let title = "THIS-AE-TITLE-IS-TOO-LONG";
        assert_eq!(
            validate_ae_title(title, AeTitlePolicy::Truncate).unwrap(),
            "THIS-AE-TITLE-IS"
        );
        assert!(matches!(
            validate_ae_title(title, AeTitlePolicy::Reject),
            Err(Error::AeTitleTooLong { length: 25, .. })
        ));
    }

    #[test]
    fn truncation_does_not_leave_trailing_spaces() {
        assert_eq!(
            validate_ae_title("FIFTEEN-CHARS-A TAIL", AeTitlePolicy::Truncate).unwrap(),
            "FIFTEEN-CHARS-A"
        );
    }

    #[rstest]
    #[case("")]
    #[case("                ")]
    fn empty_titles_are_rejected(#[case] input: &str) {
        assert!(matches!(
            validate_ae_title(input, AeTitlePolicy::Truncate),
            Err(Error::AeTitleEmpty { .. })
        ));
    }

    #[test]
    fn control_characters_are_rejected() {
        assert!(matches!(
            validate_ae_title("BAD\\AE", AeTitlePolicy::Truncate),
            Err(Error::AeTitleInvalidCharacter { .. })
        ));
        assert!(matches!(
            validate_ae_title("BAD\nAE", AeTitlePolicy::Truncate),
            Err(Error::AeTitleInvalidCharacter { .. })
        ));
    }
}
