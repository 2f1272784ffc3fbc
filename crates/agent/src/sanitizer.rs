/// Outcome of screening one raw prompt. On `Injection` the raw text is
/// discarded by the caller; only the matched pattern label survives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Clean,
    Injection { pattern: &'static str },
}

impl Verdict {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }
}

/// Phrases matched against a normalized copy of the prompt. Matching is
/// deliberately dumb: lowercase, collapsed whitespace, substring checks.
const INJECTION_PHRASES: &[&str] = &[
    "ignore previous instructions",
    "ignore all previous instructions",
    "ignore the above",
    "disregard your instructions",
    "disregard all prior",
    "forget your instructions",
    "you are now",
    "act as if you are",
    "pretend you are",
    "system prompt",
    "reveal your instructions",
    "print your instructions",
    "developer mode",
    "do anything now",
];

/// Delimiter sequences used by chat templates. Their presence in user text
/// is never legitimate.
const DELIMITER_MARKERS: &[&str] = &["<|", "|>", "[inst]", "[/inst]", "### system"];

#[derive(Clone, Copy, Debug, Default)]
pub struct PromptSanitizer;

impl PromptSanitizer {
    pub fn new() -> Self {
        Self
    }

    pub fn screen(&self, raw: &str) -> Verdict {
        let normalized = normalize(raw);

        for marker in DELIMITER_MARKERS {
            if normalized.contains(marker) {
                return Verdict::Injection { pattern: "template_delimiter" };
            }
        }

        for phrase in INJECTION_PHRASES {
            if normalized.contains(phrase) {
                return Verdict::Injection { pattern: "instruction_override" };
            }
        }

        Verdict::Clean
    }
}

fn normalize(raw: &str) -> String {
    raw.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}
