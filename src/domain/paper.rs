//! Source papers and the references collaborators hand back.
//!
//! A `PaperRecord` is immutable once fetched; every stage reads it, none
//! writes it.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A paper fetched from the paper source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperRecord {
    /// External identifier (PMID for PubMed)
    pub id: String,

    pub title: String,

    #[serde(default)]
    pub authors: Vec<String>,

    #[serde(default)]
    pub journal: String,

    /// Publication date as reported by the source (free-form, e.g. "2024 Mar 5")
    #[serde(default)]
    pub publication_date: String,

    #[serde(default, rename = "abstract")]
    pub abstract_text: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,

    /// Open-access full text PDF, when the source knows of one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_url: Option<String>,

    /// Specialty query that surfaced this paper
    #[serde(default)]
    pub specialty: String,
}

impl PaperRecord {
    /// Create a record with just an id and title (other fields empty)
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            authors: Vec::new(),
            journal: String::new(),
            publication_date: String::new(),
            abstract_text: String::new(),
            doi: None,
            pdf_url: None,
            specialty: String::new(),
        }
    }

    pub fn with_abstract(mut self, abstract_text: impl Into<String>) -> Self {
        self.abstract_text = abstract_text.into();
        self
    }

    pub fn with_specialty(mut self, specialty: impl Into<String>) -> Self {
        self.specialty = specialty.into();
        self
    }

    /// Authors joined for display ("Unknown Authors" when empty)
    pub fn author_line(&self) -> String {
        if self.authors.is_empty() {
            "Unknown Authors".to_string()
        } else {
            self.authors.join(", ")
        }
    }
}

/// A figure extracted from a paper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Figure {
    /// Identifier unique within the paper (e.g. "p3-img1")
    pub id: String,

    /// Page the figure was found on (1-based)
    pub page: u32,

    #[serde(default)]
    pub caption: String,

    /// Image file written by the extractor
    pub image_path: PathBuf,

    #[serde(default)]
    pub width: u32,

    #[serde(default)]
    pub height: u32,

    /// Importance score in [0, 1], filled in by the figure selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
}

/// Narration audio written by the narrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioRef(pub PathBuf);

/// Rendered video file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRef(pub PathBuf);

impl fmt::Display for AudioRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl fmt::Display for VideoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Where a video ended up after publishing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedRef {
    /// Platform identifier (YouTube video id)
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Produced by a dry run; never counts as published
    #[serde(default)]
    pub dry_run: bool,
}

impl PublishedRef {
    pub fn new(id: impl Into<String>, url: Option<String>) -> Self {
        Self {
            id: id.into(),
            url,
            dry_run: false,
        }
    }

    pub fn dry_run(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: None,
            dry_run: true,
        }
    }
}
