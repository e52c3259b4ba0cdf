//! Structured section extraction from container output.
//!
//! The sandbox wrapper prints Markdown-style `## <Title>` headers around
//! each block of output; this module pulls individual sections back out.

use regex::Regex;

/// Section produced by the test command's stdout.
pub const CODE_OUTPUT: &str = "Code Output";
/// Section produced by the test command's stderr.
pub const CODE_ERROR: &str = "Code Error";
/// Section holding the mitmproxy flow log.
pub const MITM_LOG: &str = "Mitmproxy Log (HTTP/HTTPS flows)";
/// Section holding the raw tcpdump capture.
pub const TCPDUMP_LOG: &str = "Tcpdump Log (All network traffic)";
/// Section holding the interface-counter diff taken before and after tests.
pub const NETWORK_DIFF: &str = "Network Difference (Initial vs Final)";

/// Extracts the body of the `## <title>` section from `text`.
///
/// The body runs until the next `## ` header or end of input and is
/// returned trimmed. Returns the empty string when the section is absent.
pub fn extract(text: &str, title: &str) -> String {
    let pattern = format!(r"(?s)## {}\s*\n(.*?)(\n## |\z)", regex::escape(title));
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(_) => return String::new(),
    };
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

/// Whether a mitmproxy section carries enough lines to be worth analyzing.
pub fn mitm_is_useful(section: &str) -> bool {
    section.lines().count() > 4
}

/// Whether a tcpdump section carries enough lines to be worth analyzing.
pub fn tcpdump_is_useful(section: &str) -> bool {
    section.lines().count() > 10
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
## Code Output
all 3 tests passed
## Code Error

## Mitmproxy Log (HTTP/HTTPS flows)
GET https://example.com/
## Tcpdump Log (All network traffic)
12:00:00 IP 10.0.0.1 > 10.0.0.2
";

    #[test]
    fn extracts_section_until_next_header() {
        assert_eq!(extract(SAMPLE, CODE_OUTPUT), "all 3 tests passed");
        assert_eq!(extract(SAMPLE, MITM_LOG), "GET https://example.com/");
    }

    #[test]
    fn extracts_last_section_to_eof() {
        assert_eq!(extract(SAMPLE, TCPDUMP_LOG), "12:00:00 IP 10.0.0.1 > 10.0.0.2");
    }

    #[test]
    fn missing_section_yields_empty_string() {
        assert_eq!(extract(SAMPLE, NETWORK_DIFF), "");
        assert_eq!(extract("", CODE_OUTPUT), "");
    }

    #[test]
    fn empty_section_yields_empty_string() {
        assert_eq!(extract(SAMPLE, CODE_ERROR), "");
    }

    #[test]
    fn titles_with_regex_metacharacters_are_escaped() {
        // Parentheses in the mitm/tcpdump titles must match literally.
        let text = "## Mitmproxy Log (HTTP/HTTPS flows)\nflow a\nflow b\n";
        assert_eq!(extract(text, MITM_LOG), "flow a\nflow b");
    }

    #[test]
    fn extraction_is_idempotent() {
        let first = extract(SAMPLE, CODE_OUTPUT);
        let second = extract(SAMPLE, CODE_OUTPUT);
        assert_eq!(first, second);
        // Re-extracting from an extracted body that lacks the header is empty.
        assert_eq!(extract(&first, CODE_OUTPUT), "");
    }

    #[test]
    fn multiline_bodies_keep_interior_lines() {
        let text = "## Code Output\nline 1\n\nline 3\n## Code Error\nboom\n";
        assert_eq!(extract(text, CODE_OUTPUT), "line 1\n\nline 3");
        assert_eq!(extract(text, CODE_ERROR), "boom");
    }

    #[test]
    fn validity_heuristics_use_line_counts() {
        assert!(!mitm_is_useful("a\nb\nc\nd"));
        assert!(mitm_is_useful("a\nb\nc\nd\ne"));
        let ten = vec!["x"; 10].join("\n");
        let eleven = vec!["x"; 11].join("\n");
        assert!(!tcpdump_is_useful(&ten));
        assert!(tcpdump_is_useful(&eleven));
    }
}
