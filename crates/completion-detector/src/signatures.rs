//! Fixed signature table for the AI web frontends we know how to wait on.
//!
//! Hostname fragments are matched against the lowercased target first; only
//! when no hostname matches do we probe the live DOM for each signature's
//! input descriptor.

use crate::profile::WaitStrategy;

#[derive(Clone, Copy, Debug)]
pub struct PlatformSignature {
    pub platform: &'static str,
    /// Fragments matched against the target URL, dotted and undotted forms.
    pub hosts: &'static [&'static str],
    pub input_selector: &'static str,
    pub submit_selector: &'static str,
    pub processing_indicators: &'static [&'static str],
    pub completion_indicators: &'static [&'static str],
    pub wait_strategy: WaitStrategy,
}

pub const SIGNATURES: &[PlatformSignature] = &[
    PlatformSignature {
        platform: "lovable.dev",
        hosts: &["lovable.dev", "lovabledev", "lovableproject"],
        input_selector: "textarea[placeholder*=\"message\"]",
        submit_selector: "button[type=\"submit\"]",
        processing_indicators: &[
            ".animate-pulse",
            "[data-state=\"loading\"]",
            "button:has-text(\"Stop\")",
            ".building-indicator",
        ],
        completion_indicators: &[
            "button:has-text(\"Send\")",
            "textarea:not([disabled])",
            ".build-complete",
        ],
        wait_strategy: WaitStrategy::ButtonStateChange,
    },
    PlatformSignature {
        platform: "v0.dev",
        hosts: &["v0.dev", "v0dev"],
        input_selector: "textarea[placeholder*=\"Describe\"]",
        submit_selector: "button[aria-label=\"Send\"]",
        processing_indicators: &[
            ".generating",
            "button:has-text(\"Stop generating\")",
            "[role=\"status\"]",
        ],
        completion_indicators: &[
            "button[aria-label=\"Send\"]:not([disabled])",
            ".generation-complete",
        ],
        wait_strategy: WaitStrategy::GenerationComplete,
    },
    PlatformSignature {
        platform: "chatgpt",
        hosts: &["chatgpt", "chat.openai"],
        input_selector: "#prompt-textarea",
        submit_selector: "button[data-testid=\"send-button\"]",
        processing_indicators: &["button[data-testid=\"stop-button\"]", ".result-streaming"],
        completion_indicators: &["button[data-testid=\"send-button\"]:not([disabled])"],
        wait_strategy: WaitStrategy::StopButtonDisappears,
    },
    PlatformSignature {
        platform: "claude.ai",
        hosts: &["claude.ai", "claudeai"],
        input_selector: "div[contenteditable=\"true\"]",
        submit_selector: "button[aria-label=\"Send Message\"]",
        processing_indicators: &["button[aria-label=\"Stop\"]", ".typing-indicator"],
        completion_indicators: &["button[aria-label=\"Send Message\"]:not([disabled])"],
        wait_strategy: WaitStrategy::StopButtonDisappears,
    },
];

/// Hostname match against the signature table. First hit wins; the table
/// order is the precedence order.
pub fn match_host(target: &str) -> Option<&'static PlatformSignature> {
    let lowered = target.to_lowercase();
    SIGNATURES
        .iter()
        .find(|signature| signature.hosts.iter().any(|host| lowered.contains(host)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_fragments_match() {
        assert_eq!(
            match_host("https://chatgpt.com/c/abc").unwrap().platform,
            "chatgpt"
        );
        assert_eq!(
            match_host("https://CHAT.OPENAI.com").unwrap().platform,
            "chatgpt"
        );
        assert_eq!(
            match_host("https://lovable.dev/projects/x").unwrap().platform,
            "lovable.dev"
        );
        assert!(match_host("https://example.com").is_none());
    }
}
