//! Fabric summarizer.
//!
//! Runs `fabric -p <pattern>` with the paper text on stdin. The length
//! constraints travel as a short preamble ahead of the text. Prose lines of
//! the output become the summary; bullet lines become the key takeaways.

use async_trait::async_trait;
use tracing::debug;

use crate::core::error::CollaboratorError;
use crate::domain::PaperSummary;

use super::process::{describe_failure, run_command};
use super::{SummaryConstraints, Summarizer};

/// Fabric summarizer using subprocess mode
pub struct FabricSummarizer {
    /// Path to the fabric binary (default: "fabric")
    binary_path: String,
    pattern: String,
}

impl FabricSummarizer {
    /// Looks for fabric-ai first (Homebrew install), falls back to fabric
    pub fn new(pattern: &str) -> Self {
        let binary_path = if std::process::Command::new("fabric-ai")
            .arg("--help")
            .output()
            .is_ok()
        {
            "fabric-ai".to_string()
        } else {
            "fabric".to_string()
        };

        Self {
            binary_path,
            pattern: pattern.to_string(),
        }
    }

    /// Create a summarizer with a custom binary path
    pub fn with_binary_path(binary_path: impl Into<String>, pattern: &str) -> Self {
        Self {
            binary_path: binary_path.into(),
            pattern: pattern.to_string(),
        }
    }
}

#[async_trait]
impl Summarizer for FabricSummarizer {
    async fn summarize(
        &self,
        text: &str,
        constraints: &SummaryConstraints,
    ) -> Result<PaperSummary, CollaboratorError> {
        if text.trim().is_empty() {
            return Err(CollaboratorError::InvalidInput("nothing to summarize".into()));
        }

        let input = format!("{}\n\n{}", preamble(constraints), text);
        let args = vec!["-p".to_string(), self.pattern.clone()];

        let output = run_command(&self.binary_path, &args, Some(input.as_bytes())).await?;

        if !output.status.success() {
            let message = describe_failure(&self.binary_path, &output);
            return Err(classify_failure(message));
        }

        let stdout = String::from_utf8(output.stdout)
            .map_err(|_| CollaboratorError::Model("Fabric output is not valid UTF-8".into()))?;
        debug!(pattern = %self.pattern, bytes = stdout.len(), "Fabric pattern finished");

        parse_summary(&stdout, constraints)
    }
}

fn preamble(constraints: &SummaryConstraints) -> String {
    format!(
        "Summarize the following medical paper for a general audience in {} to {} words, \
         then list {} key takeaways as bullet points.",
        constraints.min_length, constraints.max_length, constraints.key_takeaways
    )
}

/// Rate and quota complaints are worth retrying; anything else is a model failure
fn classify_failure(message: String) -> CollaboratorError {
    let lower = message.to_lowercase();
    if lower.contains("rate limit") || lower.contains("429") || lower.contains("quota") {
        CollaboratorError::QuotaExceeded {
            message,
            retry_after: None,
        }
    } else if lower.contains("timeout") || lower.contains("timed out") || lower.contains("503") {
        CollaboratorError::Unavailable(message)
    } else {
        CollaboratorError::Model(message)
    }
}

fn bullet_text(line: &str) -> Option<&str> {
    for marker in ["- ", "* ", "• "] {
        if let Some(rest) = line.strip_prefix(marker) {
            return Some(rest.trim());
        }
    }

    // "1. takeaway" / "2) takeaway"
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return Some(rest.trim());
        }
    }
    None
}

/// Split model output into summary prose and takeaways
pub fn parse_summary(
    output: &str,
    constraints: &SummaryConstraints,
) -> Result<PaperSummary, CollaboratorError> {
    let mut prose: Vec<&str> = Vec::new();
    let mut takeaways = Vec::new();

    for line in output.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match bullet_text(line) {
            Some(item) if !item.is_empty() => takeaways.push(item.to_string()),
            Some(_) => {}
            None => prose.push(line),
        }
    }

    let words: Vec<&str> = prose.iter().flat_map(|line| line.split_whitespace()).collect();
    if words.len() < constraints.min_length {
        return Err(CollaboratorError::Model(format!(
            "summary has {} words, expected at least {}",
            words.len(),
            constraints.min_length
        )));
    }

    let max = constraints.max_length.max(1);
    let summary_text = words[..words.len().min(max)].join(" ");
    takeaways.truncate(constraints.key_takeaways);

    Ok(PaperSummary {
        summary_text,
        key_takeaways: takeaways,
    })
}
