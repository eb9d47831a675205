//! Semantic memory records and the link / entity / relationship graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stored fact: content plus metadata, optional 1024-dim embedding, and
/// free-text keywords indexed alongside the content for FTS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub content: String,
    pub metadata: serde_json::Value,
    pub collection: String,
    pub tags: Vec<String>,
    pub keywords: Option<String>,
    pub auto_tags: Vec<String>,
    pub decay_factor: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub superseded_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for `store`. A missing id means "generate one".
#[derive(Debug, Clone, Default)]
pub struct NewMemory {
    pub id: Option<String>,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub collection: Option<String>,
    pub tags: Vec<String>,
    pub keywords: Option<String>,
}

impl NewMemory {
    pub fn new(content: &str) -> Self {
        Self {
            content: content.to_string(),
            ..Default::default()
        }
    }

    pub fn in_collection(mut self, collection: &str) -> Self {
        self.collection = Some(collection.to_string());
        self
    }

    pub fn with_keywords(mut self, keywords: &str) -> Self {
        self.keywords = Some(keywords.to_string());
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| (*t).to_string()).collect();
        self
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    Related,
    Contradicts,
    Supersedes,
    Elaborates,
}

impl LinkType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Related => "related",
            Self::Contradicts => "contradicts",
            Self::Supersedes => "supersedes",
            Self::Elaborates => "elaborates",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "related" => Some(Self::Related),
            "contradicts" => Some(Self::Contradicts),
            "supersedes" => Some(Self::Supersedes),
            "elaborates" => Some(Self::Elaborates),
            _ => None,
        }
    }
}

/// A relation between two memory ids, not an owning reference; the edge
/// table declares cascade on either endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryLink {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub link_type: LinkType,
    pub strength: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub entity_type: String,
    pub canonical_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub subject_entity_id: String,
    pub predicate: String,
    pub object_entity_id: String,
    pub memory_id: Option<String>,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Vector,
    Fts,
}

impl MatchType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vector => "vector",
            Self::Fts => "fts",
        }
    }
}

/// One similarity-search result. `score` is `1 - cosine distance` on the
/// vector path; on the FTS path it is a rank-derived relevance value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub memory: Memory,
    pub score: f64,
    pub match_type: MatchType,
}

/// Embedder reachability report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryHealth {
    pub ollama: bool,
    pub model: String,
}

pub fn generate_memory_id() -> String {
    format!("mem-{}", Uuid::new_v4())
}
