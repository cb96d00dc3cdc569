//! Wire types for registry search and meta-search payloads.
//!
//! The registry speaks JSON with camelCase keys. Meta-search returns counts,
//! facets, and taxonomy terms without full records; search returns a page of
//! full result records.

use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactKind, AttributeRecord, FileRecord};

/// Envelope of the `/api/search` endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub result_count: u32,
    #[serde(default)]
    pub results: Vec<SearchResult>,
}

/// One record from a search page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub uid: String,
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
    #[serde(default)]
    pub provenance: Vec<Provenance>,
    /// Components only.
    #[serde(default)]
    pub costs: Vec<Cost>,
}

/// Authorship trail entry attached to a result record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub author: String,
    #[serde(default)]
    pub datetime: String,
    #[serde(default)]
    pub comment: String,
}

/// Cost line attached to a component result record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cost {
    pub name: String,
    pub cost_type: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

/// Counts, facets, and taxonomy terms returned by `/api/metasearch`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaSearchResult {
    pub result_count: u32,
    #[serde(default)]
    pub facets: Vec<Facet>,
    #[serde(default)]
    pub taxonomy_terms: Vec<TaxonomyTerm>,
}

/// A named filter dimension with its value counts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Facet {
    pub field: String,
    #[serde(default)]
    pub items: Vec<FacetItem>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetItem {
    pub value: String,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxonomyTerm {
    pub name: String,
    pub count: u32,
}
