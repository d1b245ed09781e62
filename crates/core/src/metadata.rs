//! CNB metadata files
//!
//! Serde models for the TOML files exchanged with the lifecycle binaries:
//! `analyzed.toml` (read back after detect/analyze), and `stack.toml`,
//! `run.toml`, `project-metadata.toml` (written into phase containers).
//! Schemas beyond the fields the orchestrator touches are owned by the
//! lifecycle; unknown keys are preserved where it matters and ignored
//! elsewhere.

use crate::errors::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// `analyzed.toml` as produced by detect/analyze.
///
/// Absence of the file, the table, or individual fields all mean "no
/// run-extension and no image override"; parsing never fails a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalyzedMetadata {
    #[serde(rename = "run-image", skip_serializing_if = "Option::is_none")]
    pub run_image: Option<AnalyzedRunImage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalyzedRunImage {
    #[serde(default)]
    pub extend: bool,
    #[serde(default)]
    pub image: String,
}

impl AnalyzedMetadata {
    /// Read `analyzed.toml` defensively: any failure yields the default.
    pub fn read_or_default(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| toml::from_str(&s).ok())
            .unwrap_or_default()
    }
}

/// `stack.toml` describing the builder's stack run image.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StackMetadata {
    #[serde(rename = "run-image")]
    pub run_image: StackRunImage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StackRunImage {
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mirrors: Vec<String>,
}

/// `run.toml` listing the run images the builder knows about.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<RunImageEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunImageEntry {
    pub image: String,
}

/// `project-metadata.toml` recording the application source provenance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProjectMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ProjectSource>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProjectSource {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub version: BTreeMap<String, toml::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, toml::Value>,
}

/// Serialize any of the metadata models to TOML text.
pub fn to_toml<T: Serialize>(value: &T) -> Result<String> {
    Ok(toml::to_string(value)?)
}
