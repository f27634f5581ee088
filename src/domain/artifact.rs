//! Artifacts produced by pipeline stages.
//!
//! Each stage produces exactly one artifact variant; later stages read the
//! artifacts of earlier ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::paper::{AudioRef, Figure, PublishedRef, VideoRef};
use super::stage::Stage;

/// Text and figures pulled out of a paper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedContent {
    pub text: String,

    #[serde(default)]
    pub figures: Vec<Figure>,

    /// True when the full text was unavailable and the abstract was used
    #[serde(default)]
    pub abstract_only: bool,
}

/// Summarizer output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperSummary {
    pub summary_text: String,

    #[serde(default)]
    pub key_takeaways: Vec<String>,
}

impl PaperSummary {
    /// Script read by the narrator: the summary followed by the takeaways
    pub fn narration_script(&self) -> String {
        let mut script = self.summary_text.trim().to_string();

        if !self.key_takeaways.is_empty() {
            if !script.is_empty() {
                script.push(' ');
            }
            script.push_str("Key takeaways.");
            for takeaway in &self.key_takeaways {
                let takeaway = takeaway.trim().trim_end_matches('.');
                script.push(' ');
                script.push_str(takeaway);
                script.push('.');
            }
        }

        script
    }
}

/// Narration audio, one segment per synthesizer call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Narration {
    pub segments: Vec<AudioRef>,

    /// Characters of script that were synthesized
    pub script_chars: usize,
}

/// Output of one completed stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "data")]
pub enum StageArtifact {
    Extracted(ExtractedContent),
    Summary(PaperSummary),
    Figures(Vec<Figure>),
    Narration(Narration),
    Video(VideoRef),
    Published(PublishedRef),
    Recorded {
        recorded_at: DateTime<Utc>,
        /// Object storage copy of the video, when archiving is enabled
        #[serde(default, skip_serializing_if = "Option::is_none")]
        storage_url: Option<String>,
    },
}

impl StageArtifact {
    /// The stage this artifact belongs to
    pub fn stage(&self) -> Stage {
        match self {
            StageArtifact::Extracted(_) => Stage::Extract,
            StageArtifact::Summary(_) => Stage::Summarize,
            StageArtifact::Figures(_) => Stage::SelectFigures,
            StageArtifact::Narration(_) => Stage::SynthesizeNarration,
            StageArtifact::Video(_) => Stage::RenderVideo,
            StageArtifact::Published(_) => Stage::Upload,
            StageArtifact::Recorded { .. } => Stage::RecordPublished,
        }
    }

    pub fn as_extracted(&self) -> Option<&ExtractedContent> {
        match self {
            StageArtifact::Extracted(content) => Some(content),
            _ => None,
        }
    }

    pub fn as_summary(&self) -> Option<&PaperSummary> {
        match self {
            StageArtifact::Summary(summary) => Some(summary),
            _ => None,
        }
    }

    pub fn as_figures(&self) -> Option<&[Figure]> {
        match self {
            StageArtifact::Figures(figures) => Some(figures),
            _ => None,
        }
    }

    pub fn as_narration(&self) -> Option<&Narration> {
        match self {
            StageArtifact::Narration(narration) => Some(narration),
            _ => None,
        }
    }

    pub fn as_video(&self) -> Option<&VideoRef> {
        match self {
            StageArtifact::Video(video) => Some(video),
            _ => None,
        }
    }

    pub fn as_published(&self) -> Option<&PublishedRef> {
        match self {
            StageArtifact::Published(published) => Some(published),
            _ => None,
        }
    }

    pub fn storage_url(&self) -> Option<&str> {
        match self {
            StageArtifact::Recorded { storage_url, .. } => storage_url.as_deref(),
            _ => None,
        }
    }

    /// One-line description for event payloads (no content dumps)
    pub fn describe(&self) -> String {
        match self {
            StageArtifact::Extracted(c) => format!(
                "{} chars, {} figures{}",
                c.text.len(),
                c.figures.len(),
                if c.abstract_only { " (abstract only)" } else { "" }
            ),
            StageArtifact::Summary(s) => format!(
                "{} words, {} takeaways",
                s.summary_text.split_whitespace().count(),
                s.key_takeaways.len()
            ),
            StageArtifact::Figures(f) => format!("{} figures selected", f.len()),
            StageArtifact::Narration(n) => format!("{} audio segments", n.segments.len()),
            StageArtifact::Video(v) => format!("video at {}", v),
            StageArtifact::Published(p) => match &p.url {
                Some(url) => format!("published as {} ({})", p.id, url),
                None => format!("published as {}", p.id),
            },
            StageArtifact::Recorded {
                recorded_at,
                storage_url: Some(url),
            } => format!("recorded at {}, archived to {}", recorded_at, url),
            StageArtifact::Recorded { recorded_at, .. } => format!("recorded at {}", recorded_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_stage_mapping() {
        let summary = StageArtifact::Summary(PaperSummary {
            summary_text: "s".into(),
            key_takeaways: vec![],
        });
        assert_eq!(summary.stage(), Stage::Summarize);
        assert!(summary.as_summary().is_some());
        assert!(summary.as_extracted().is_none());

        let recorded = StageArtifact::Recorded {
            recorded_at: Utc::now(),
            storage_url: None,
        };
        assert_eq!(recorded.stage(), Stage::RecordPublished);
        assert_eq!(recorded.storage_url(), None);
    }

    #[test]
    fn test_recorded_without_storage_url_parses() {
        let json = serde_json::json!({
            "kind": "recorded",
            "data": { "recorded_at": "2024-03-05T10:00:00Z" }
        });
        let parsed: StageArtifact = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.storage_url(), None);

        let archived = StageArtifact::Recorded {
            recorded_at: Utc::now(),
            storage_url: Some("file:///archive/cardiology/1/video.mp4".into()),
        };
        assert!(archived.describe().contains("archived to file:///archive"));
    }

    #[test]
    fn test_narration_script_appends_takeaways() {
        let summary = PaperSummary {
            summary_text: "Drug X lowered blood pressure.".into(),
            key_takeaways: vec!["Effect was dose dependent".into(), "Few side effects.".into()],
        };

        assert_eq!(
            summary.narration_script(),
            "Drug X lowered blood pressure. Key takeaways. Effect was dose dependent. Few side effects."
        );
    }

    #[test]
    fn test_artifact_serialization_is_tagged() {
        let artifact = StageArtifact::Video(VideoRef("out/1.mp4".into()));
        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["kind"], "video");

        let parsed: StageArtifact = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, artifact);
    }
}
