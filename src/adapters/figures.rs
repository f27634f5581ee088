//! Local figure scoring and selection.
//!
//! Figures arriving without a score are rated from their caption and size:
//! a caption is worth 0.3, chart or table vocabulary 0.3 (microscopy 0.2),
//! clinical vocabulary 0.1, and an image of at least the minimum size 0.2.

use std::cmp::Ordering;

use async_trait::async_trait;

use crate::core::error::CollaboratorError;
use crate::domain::Figure;

use super::FigureSelector;

const CHART_WORDS: &[&str] = &[
    "chart", "graph", "plot", "diagram", "axis", "bar", "pie", "curve", "table",
];
const MICROSCOPY_WORDS: &[&str] = &[
    "microscopy", "cell", "tissue", "histology", "pathology", "specimen", "staining",
];
const CLINICAL_WORDS: &[&str] = &[
    "medical", "clinical", "health", "patient", "treatment", "disease", "therapy",
    "diagnosis", "prognosis", "outcome", "survival", "mortality",
];

pub struct ScoringFigureSelector {
    min_figure_size: u32,
}

impl ScoringFigureSelector {
    pub fn new(min_figure_size: u32) -> Self {
        Self { min_figure_size }
    }

    /// Importance in [0, 1]
    pub fn score(&self, figure: &Figure) -> f64 {
        let caption = figure.caption.to_lowercase();
        let mentions = |words: &[&str]| words.iter().any(|w| caption.contains(w));
        let mut score = 0.0;

        if !caption.trim().is_empty() {
            score += 0.3;
        }
        if mentions(CHART_WORDS) {
            score += 0.3;
        } else if mentions(MICROSCOPY_WORDS) {
            score += 0.2;
        }
        if mentions(CLINICAL_WORDS) {
            score += 0.1;
        }
        if figure.width >= self.min_figure_size && figure.height >= self.min_figure_size {
            score += 0.2;
        }

        f64::clamp(score, 0.0, 1.0)
    }
}

#[async_trait]
impl FigureSelector for ScoringFigureSelector {
    async fn select_figures(
        &self,
        figures: &[Figure],
        max_count: usize,
        min_quality_score: f64,
    ) -> Result<Vec<Figure>, CollaboratorError> {
        let mut scored: Vec<Figure> = figures
            .iter()
            .cloned()
            .map(|mut figure| {
                if figure.quality_score.is_none() {
                    figure.quality_score = Some(self.score(&figure));
                }
                figure
            })
            .filter(|figure| figure.quality_score.unwrap_or(0.0) >= min_quality_score)
            .collect();

        // Stable sort keeps document order among equal scores
        scored.sort_by(|a, b| {
            b.quality_score
                .partial_cmp(&a.quality_score)
                .unwrap_or(Ordering::Equal)
        });
        scored.truncate(max_count);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn figure(id: &str, caption: &str, size: u32) -> Figure {
        Figure {
            id: id.to_string(),
            page: 1,
            caption: caption.to_string(),
            image_path: PathBuf::from(format!("{}.jpg", id)),
            width: size,
            height: size,
            quality_score: None,
        }
    }

    #[test]
    fn test_scoring() {
        let selector = ScoringFigureSelector::new(200);

        let chart = figure("a", "Figure 1. Kaplan-Meier survival curve", 800);
        assert!((selector.score(&chart) - 0.9).abs() < 1e-9);

        let micro = figure("b", "Fig. 2 Histology of tissue", 100);
        assert!((selector.score(&micro) - 0.5).abs() < 1e-9);

        let bare = figure("c", "", 50);
        assert_eq!(selector.score(&bare), 0.0);
    }

    #[tokio::test]
    async fn test_select_filters_sorts_and_limits() {
        let selector = ScoringFigureSelector::new(200);
        let mut preset = figure("d", "", 10);
        preset.quality_score = Some(0.95);

        let figures = vec![
            figure("a", "Figure 1. Patient survival curve", 800),
            figure("b", "Figure 2. Study flow", 800),
            figure("c", "", 50),
            preset,
        ];

        let selected = selector.select_figures(&figures, 2, 0.5).await.unwrap();
        let ids: Vec<&str> = selected.iter().map(|f| f.id.as_str()).collect();

        assert_eq!(ids, vec!["d", "a"]);
    }

    #[tokio::test]
    async fn test_select_empty() {
        let selector = ScoringFigureSelector::new(200);
        assert!(selector.select_figures(&[], 3, 0.5).await.unwrap().is_empty());
    }
}
