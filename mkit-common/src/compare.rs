//! File comparison after newline normalization.
//!
//! Content read back through `ssh` picks up carriage returns on some
//! drivers, so both sides drop every `\r` before a byte comparison.

use std::borrow::Cow;
use std::path::Path;

use memchr::memchr;

use crate::error::{HarnessError, HarnessResult};

/// Remove every carriage return; borrows when there is none.
pub fn strip_carriage_returns(data: &[u8]) -> Cow<'_, [u8]> {
    if memchr(b'\r', data).is_none() {
        return Cow::Borrowed(data);
    }
    Cow::Owned(data.iter().copied().filter(|&b| b != b'\r').collect())
}

/// Byte equality after normalization.
pub fn contents_match(expected: &[u8], actual: &[u8]) -> bool {
    strip_carriage_returns(expected) == strip_carriage_returns(actual)
}

/// 1-based line number and both versions of the first differing line.
pub fn first_difference(expected: &[u8], actual: &[u8]) -> Option<(usize, String, String)> {
    let expected = strip_carriage_returns(expected);
    let actual = strip_carriage_returns(actual);
    if expected == actual {
        return None;
    }
    let mut want = expected.split(|&b| b == b'\n');
    let mut got = actual.split(|&b| b == b'\n');
    let mut line = 1;
    loop {
        match (want.next(), got.next()) {
            (Some(w), Some(g)) if w == g => line += 1,
            (w, g) => {
                let render = |part: Option<&[u8]>| {
                    part.map(|p| String::from_utf8_lossy(p).into_owned())
                        .unwrap_or_else(|| "<missing>".to_string())
                };
                return Some((line, render(w), render(g)));
            }
        }
    }
}

/// Assert that `actual` (usually `cat` output from the node) matches the
/// local reference file.
pub fn assert_file_matches(reference: &Path, actual: &[u8]) -> HarnessResult<()> {
    let expected = std::fs::read(reference)?;
    match first_difference(&expected, actual) {
        None => Ok(()),
        Some((line, want, got)) => Err(HarnessError::AssertionFailed(format!(
            "{} mismatch at line {line}: want {want:?}, got {got:?}",
            reference.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_crlf_equals_lf() {
        assert!(contents_match(b"a\nb\n", b"a\r\nb\r\n"));
        assert!(!contents_match(b"a\nb\n", b"a\nc\n"));
    }

    #[test]
    fn test_strip_borrows_when_clean() {
        assert!(matches!(strip_carriage_returns(b"clean\n"), Cow::Borrowed(_)));
        assert_eq!(&*strip_carriage_returns(b"x\r\ny\r"), b"x\ny");
    }

    #[test]
    fn test_first_difference_reports_line() {
        let diff = first_difference(b"one\ntwo\nthree\n", b"one\r\n2\r\nthree\r\n").unwrap();
        assert_eq!(diff, (2, "two".to_string(), "2".to_string()));

        let diff = first_difference(b"one\n", b"one\nextra").unwrap();
        assert_eq!(diff.0, 2);
        assert_eq!(first_difference(b"same", b"same"), None);
    }

    #[test]
    fn test_assert_file_matches() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "Test file for checking file sync process\n").unwrap();

        assert!(
            assert_file_matches(file.path(), b"Test file for checking file sync process\r\n")
                .is_ok()
        );
        let err = assert_file_matches(file.path(), b"something else\n").unwrap_err();
        assert!(err.is_assertion());
    }

    proptest! {
        #[test]
        fn prop_inserting_carriage_returns_keeps_match(
            lines in proptest::collection::vec("[a-zA-Z0-9 ]{0,20}", 0..10)
        ) {
            let lf = lines.join("\n");
            let crlf = lines.join("\r\n");
            prop_assert!(contents_match(lf.as_bytes(), crlf.as_bytes()));
        }
    }
}
