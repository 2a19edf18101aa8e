/// Collapse every run of whitespace (including newlines) into a single
/// space and trim the ends. Used for one-line renderings of multi-line
/// git output.
pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First non-empty line of a block of output, trimmed.
pub fn first_line(input: &str) -> &str {
    input
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
}

pub fn truncate_to_char_boundary(content: &str, max_len: usize) -> &str {
    if content.len() <= max_len {
        return content;
    }

    let cutoff = content
        .char_indices()
        .map(|(idx, _)| idx)
        .chain(std::iter::once(content.len()))
        .take_while(|&idx| idx <= max_len)
        .last()
        .unwrap_or(0);

    debug_assert!(content.is_char_boundary(cutoff));
    &content[..cutoff]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collapse_whitespace() {
        assert_eq!(
            collapse_whitespace("fatal:  repository\nnot found\t "),
            "fatal: repository not found"
        );
        assert_eq!(collapse_whitespace(""), "");
    }

    #[test]
    fn test_first_line() {
        assert_eq!(first_line("\n\n  error: abc\nmore"), "error: abc");
        assert_eq!(first_line(""), "");
    }

    #[test]
    fn test_truncate_to_char_boundary() {
        let input = "a".repeat(10);
        assert_eq!(truncate_to_char_boundary(&input, 7), "a".repeat(7));

        let input = "hello world";
        assert_eq!(truncate_to_char_boundary(input, input.len()), input);

        let input = "🔥🔥🔥"; // each fire emoji is 4 bytes
        assert_eq!(truncate_to_char_boundary(input, 5), "🔥");
        assert_eq!(truncate_to_char_boundary(input, 3), "");
    }
}
