use std::path::Path;

use serde::{Deserialize, Serialize};

/// What kind of media an asset holds, detected from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path
            .extension()
            .and_then(|value| value.to_str())
            .map(|value| value.to_ascii_lowercase())?;
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "webp" | "gif" | "bmp" | "heic" | "heif" => Some(Self::Image),
            "mp4" | "mov" | "webm" | "mkv" | "avi" | "m4v" | "mpg" | "mpeg" => Some(Self::Video),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }

    /// The media noun with its article, as it reads in a sentence.
    pub fn noun_phrase(self) -> &'static str {
        match self {
            Self::Image => "an image",
            Self::Video => "a video",
        }
    }
}

/// One rasterized still sampled from a video, already transport-encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub timestamp: f64,
    pub mime_type: String,
    pub encoded_data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TechnicalDescription {
    pub duration: String,
    pub estimated_shot_count: String,
    pub estimated_year: String,
    pub estimated_origin: String,
    pub format_aesthetic: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonomyClassification {
    pub path: String,
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoEvent {
    pub timestamp: f64,
    pub time_string: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPerson {
    pub timestamp: f64,
    pub time_string: String,
    pub name: String,
    pub description: String,
}

/// The typed outcome of one analysis call. Immutable once produced; image
/// analyses carry only the narrative, video analyses carry the full field set.
///
/// `events` and `key_people` keep the order the model returned them in. The
/// model reports by salience, not by timestamp, so they are never re-sorted.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub analysis: String,
    pub synopsis: Option<String>,
    pub suggested_title: Option<String>,
    pub technical_description: Option<TechnicalDescription>,
    pub taxonomy_classification: Option<TaxonomyClassification>,
    pub events: Vec<VideoEvent>,
    pub key_people: Vec<KeyPerson>,
}

impl AnalysisResult {
    /// Wraps a free-text narrative (the image-analysis shape) with no
    /// structured sub-fields.
    pub fn from_narrative(analysis: impl Into<String>) -> Self {
        Self {
            analysis: analysis.into(),
            synopsis: None,
            suggested_title: None,
            technical_description: None,
            taxonomy_classification: None,
            events: Vec::new(),
            key_people: Vec::new(),
        }
    }
}

/// The user-facing export shape. Wire names stay camelCase so exports from
/// this tool and from the original front-end are interchangeable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synopsis: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub technical_description: Option<TechnicalDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taxonomy_classification: Option<TaxonomyClassification>,
    pub analysis: String,
    pub events: Vec<VideoEvent>,
    pub key_people: Vec<KeyPerson>,
}

impl From<&AnalysisResult> for ExportDocument {
    fn from(result: &AnalysisResult) -> Self {
        Self {
            suggested_title: result.suggested_title.clone(),
            synopsis: result.synopsis.clone(),
            technical_description: result.technical_description.clone(),
            taxonomy_classification: result.taxonomy_classification.clone(),
            analysis: result.analysis.clone(),
            events: result.events.clone(),
            key_people: result.key_people.clone(),
        }
    }
}

/// File name for an export, mirroring the original `<kind>-analysis-<stem>.json`.
pub fn export_file_name(kind: MediaKind, source: &Path) -> String {
    let stem = source
        .file_stem()
        .and_then(|value| value.to_str())
        .filter(|value| !value.is_empty())
        .unwrap_or("export");
    format!("{}-analysis-{stem}.json", kind.label())
}

pub fn write_export(path: &Path, document: &ExportDocument) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(document)?)?;
    Ok(())
}
