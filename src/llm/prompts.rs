//! Prompt builders for the analysis calls outside the review loop.

/// Builds the prompt used to review a captured network log (mitmproxy or
/// tcpdump output).
pub fn network_analysis(output: &str) -> String {
    format!(
        "===== PROMPT =====\n\
         You are a NETWORK ANALYSIS expert. Analyze the output of the network analysis script to ensure it:\n\
         - Performs as described: Verify the script matches the expected output.\n\
         - Detects issues: Identify vulnerabilities, unintended behavior, or malicious actions, highlighting severity and providing recommendations.\n\
         - Summarizes in markdown: Provide a markdown-formatted summary of the script functionality.\n\
         - Highlights problems: Clearly explain any unintended or malicious actions and suggest fixes.\n\
         \n\
         If anything is missing or unclear, DO NOT ASK for more information. Instead, just say not enough information to analyze.\n\
         \n\
         ===== NETWORK ANALYSIS OUTPUT =====\n\
         {output}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_analysis_embeds_the_captured_output() {
        let prompt = network_analysis("GET https://evil.example/exfil");
        assert!(prompt.contains("NETWORK ANALYSIS expert"));
        assert!(prompt.ends_with("GET https://evil.example/exfil"));
    }
}
