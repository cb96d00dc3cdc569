//! Artifact data model and manifest parsing (manifest.yaml)
//!
//! An artifact is a versioned, reusable content package identified by a
//! stable `uid` and a revision-specific `version_id`. Its on-disk home is
//! always `{libraryRoot}/{uid}/{versionId}/…`, containing the content files
//! plus a `manifest.yaml` that identifies its kind.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::error::DepotError;

/// Manifest filename inside an artifact directory.
pub const MANIFEST_FILENAME: &str = "manifest.yaml";

/// The two kinds of artifact the catalog stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Component,
    Measure,
}

impl ArtifactKind {
    /// Name of the primary index table for this kind.
    pub(crate) fn table(&self) -> &'static str {
        match self {
            ArtifactKind::Component => "Components",
            ArtifactKind::Measure => "Measures",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Component => "component",
            ArtifactKind::Measure => "measure",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value type of an attribute record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    #[serde(rename = "boolean")]
    Bool,
    Int,
    #[serde(rename = "float")]
    Double,
    #[default]
    String,
}

impl AttributeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeType::Bool => "boolean",
            AttributeType::Int => "int",
            AttributeType::Double => "float",
            AttributeType::String => "string",
        }
    }

    /// Parse a stored type tag. Unknown tags (including the pre-1.3
    /// `varchar`) fall back to `String`.
    pub fn parse(s: &str) -> Self {
        match s {
            "boolean" => AttributeType::Bool,
            "int" => AttributeType::Int,
            "float" => AttributeType::Double,
            _ => AttributeType::String,
        }
    }
}

/// A named, typed attribute attached to an artifact revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeRecord {
    pub name: String,
    /// Stringified value; `attribute_type` records how to interpret it.
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(rename = "type", default)]
    pub attribute_type: AttributeType,
}

impl AttributeRecord {
    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            unit: None,
            attribute_type: AttributeType::String,
        }
    }
}

/// A content file belonging to an artifact revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub filename: String,
    pub filetype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl FileRecord {
    /// SHA-256 checksum of a file's contents, hex-encoded.
    pub fn checksum_of(path: &Path) -> Result<String> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read file for checksum: {}", path.display()))?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

/// A versioned content package: the unit the catalog stores and syncs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Stable across all revisions.
    pub uid: String,
    /// Unique per revision.
    pub version_id: String,
    pub kind: ArtifactKind,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Measures only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modeler_description: Option<String>,
    #[serde(default)]
    pub attributes: Vec<AttributeRecord>,
    #[serde(default)]
    pub files: Vec<FileRecord>,
}

impl Artifact {
    /// Create a fresh locally-authored artifact with generated identifiers.
    pub fn new(kind: ArtifactKind, name: impl Into<String>) -> Self {
        Self {
            uid: uuid::Uuid::new_v4().to_string(),
            version_id: uuid::Uuid::new_v4().to_string(),
            kind,
            name: name.into(),
            description: String::new(),
            modeler_description: None,
            attributes: Vec::new(),
            files: Vec::new(),
        }
    }

    /// Content-addressed directory for this revision under a library root.
    pub fn directory(&self, library_root: &Path) -> PathBuf {
        library_root.join(&self.uid).join(&self.version_id)
    }

    /// Reject empty identifiers before any I/O is attempted.
    pub fn validate_ids(&self) -> std::result::Result<(), DepotError> {
        validate_ids(&self.uid, &self.version_id)
    }
}

pub(crate) fn validate_ids(uid: &str, version_id: &str) -> std::result::Result<(), DepotError> {
    if uid.trim().is_empty() {
        return Err(DepotError::Validation("empty uid".to_string()));
    }
    if version_id.trim().is_empty() {
        return Err(DepotError::Validation("empty versionId".to_string()));
    }
    Ok(())
}

/// An artifact manifest (manifest.yaml)
///
/// The manifest inside a downloaded archive is the source of truth for the
/// artifact's kind and identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactManifest {
    /// Schema tag (currently "depot/v1").
    pub api_version: String,
    #[serde(flatten)]
    pub artifact: Artifact,
}

/// Current manifest schema tag.
pub const MANIFEST_API_VERSION: &str = "depot/v1";

impl ArtifactManifest {
    pub fn new(artifact: Artifact) -> Self {
        Self {
            api_version: MANIFEST_API_VERSION.to_string(),
            artifact,
        }
    }

    /// Load a manifest from a file path
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse manifest: {}", path.display()))
    }

    /// Load a manifest from an artifact directory
    pub fn from_dir(dir: &Path) -> Result<Self> {
        Self::from_file(&dir.join(MANIFEST_FILENAME))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml_ng::from_str(content).context("Invalid manifest YAML")
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml_ng::to_string(self).context("Failed to serialize manifest")
    }

    /// Write the manifest into an artifact directory.
    pub fn save_to_dir(&self, dir: &Path) -> Result<()> {
        let content = self.to_yaml()?;
        std::fs::write(dir.join(MANIFEST_FILENAME), content)
            .with_context(|| format!("Failed to write manifest in {}", dir.display()))
    }

    /// Validate the manifest contents
    pub fn validate(&self) -> Result<()> {
        if self.artifact.uid.trim().is_empty() {
            anyhow::bail!("Manifest has an empty uid");
        }
        if self.artifact.version_id.trim().is_empty() {
            anyhow::bail!("Manifest has an empty versionId");
        }
        if self.artifact.name.trim().is_empty() {
            anyhow::bail!("Manifest has an empty name");
        }
        Ok(())
    }
}
