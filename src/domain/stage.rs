//! The fixed stage sequence every paper moves through.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One causally ordered pipeline stage.
///
/// Declaration order is execution order; `Ord` follows it, so a
/// `BTreeMap<Stage, _>` iterates in stage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Summarize,
    SelectFigures,
    SynthesizeNarration,
    RenderVideo,
    Upload,
    RecordPublished,
}

impl Stage {
    /// All stages in execution order
    pub const SEQUENCE: [Stage; 7] = [
        Stage::Extract,
        Stage::Summarize,
        Stage::SelectFigures,
        Stage::SynthesizeNarration,
        Stage::RenderVideo,
        Stage::Upload,
        Stage::RecordPublished,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Summarize => "summarize",
            Stage::SelectFigures => "select_figures",
            Stage::SynthesizeNarration => "synthesize_narration",
            Stage::RenderVideo => "render_video",
            Stage::Upload => "upload",
            Stage::RecordPublished => "record_published",
        }
    }

    /// Rate-limit key of the collaborator this stage calls
    pub fn service(self) -> &'static str {
        match self {
            Stage::Extract => "extractor",
            Stage::Summarize => "summarizer",
            Stage::SelectFigures => "figure_selector",
            Stage::SynthesizeNarration => "narrator",
            Stage::RenderVideo => "renderer",
            Stage::Upload => "publisher",
            Stage::RecordPublished => "publish_ledger",
        }
    }

    /// Per-call timeout used when the configuration has no override.
    /// Rendering and uploading move whole video files.
    pub fn default_timeout(self) -> Duration {
        let secs = match self {
            Stage::Extract => 120,
            Stage::Summarize => 180,
            Stage::SelectFigures => 60,
            Stage::SynthesizeNarration => 300,
            Stage::RenderVideo => 1800,
            Stage::Upload => 1800,
            Stage::RecordPublished => 30,
        };
        Duration::from_secs(secs)
    }

    /// Position in the sequence (0-based)
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn at(index: usize) -> Option<Stage> {
        Self::SEQUENCE.get(index).copied()
    }

    pub fn next(self) -> Option<Stage> {
        Self::at(self.index() + 1)
    }

    pub fn is_last(self) -> bool {
        self.next().is_none()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::SEQUENCE
            .iter()
            .copied()
            .find(|stage| stage.name() == s)
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_order_matches_ord() {
        let mut sorted = Stage::SEQUENCE.to_vec();
        sorted.sort();
        assert_eq!(sorted, Stage::SEQUENCE.to_vec());

        for (i, stage) in Stage::SEQUENCE.iter().enumerate() {
            assert_eq!(stage.index(), i);
            assert_eq!(Stage::at(i), Some(*stage));
        }
    }

    #[test]
    fn test_next_and_last() {
        assert_eq!(Stage::Extract.next(), Some(Stage::Summarize));
        assert_eq!(Stage::Upload.next(), Some(Stage::RecordPublished));
        assert!(Stage::RecordPublished.is_last());
        assert!(!Stage::RenderVideo.is_last());
    }

    #[test]
    fn test_name_roundtrip() {
        for stage in Stage::SEQUENCE {
            assert_eq!(stage.name().parse::<Stage>().unwrap(), stage);
        }
        assert!("transcode".parse::<Stage>().is_err());
    }

    #[test]
    fn test_render_and_upload_get_longer_timeouts() {
        assert!(Stage::RenderVideo.default_timeout() > Stage::Summarize.default_timeout());
        assert!(Stage::Upload.default_timeout() > Stage::Extract.default_timeout());
    }
}
