//! Captured output assembly

/// Split one stream's bytes into lines, trimming surrounding newlines.
/// An empty (or newline-only) stream contributes no lines.
pub(crate) fn split_lines(bytes: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim_matches('\n');
    if trimmed.is_empty() {
        return Vec::new();
    }
    trimmed.split('\n').map(str::to_owned).collect()
}

/// Combined capture for a finished command: stdout lines, then stderr lines.
pub(crate) fn capture(stdout: &[u8], stderr: &[u8]) -> Vec<String> {
    let mut lines = split_lines(stdout);
    lines.extend(split_lines(stderr));
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_and_trims() {
        assert_eq!(split_lines(b"a\nb\n"), vec!["a", "b"]);
        assert_eq!(split_lines(b"a\nb"), vec!["a", "b"]);
        assert_eq!(split_lines(b"\na\n\n"), vec!["a"]);
    }

    #[test]
    fn interior_blank_lines_survive() {
        assert_eq!(split_lines(b"a\n\nb\n"), vec!["a", "", "b"]);
    }

    #[test]
    fn empty_stream_yields_no_lines() {
        assert!(split_lines(b"").is_empty());
        assert!(split_lines(b"\n\n").is_empty());
    }

    #[test]
    fn stdout_lines_precede_stderr_lines() {
        assert_eq!(capture(b"out\n", b"err1\nerr2\n"), vec!["out", "err1", "err2"]);
        assert_eq!(capture(b"", b"err\n"), vec!["err"]);
    }
}
