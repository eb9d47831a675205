//! Semantic memory store: content + vector + FTS hybrid search, plus the
//! link / entity / relationship graph.
//!
//! Embedding failures never block a write: the memory lands with a null
//! embedding and search degrades to FTS. Enrichment (auto-tags, links,
//! entities) is best-effort by contract.

use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

use crate::adapters::sqlite::{
    cosine_distance, format_datetime, pack_vector, parse_datetime, parse_optional_datetime,
    unpack_vector,
};
use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::event::{types, MemoryAudit, NewEvent};
use crate::domain::models::memory::{
    generate_memory_id, Entity, LinkType, MatchType, Memory, MemoryHealth, MemoryLink, NewMemory,
    Relationship, SearchHit,
};
use crate::domain::ports::embedding::EmbeddingProvider;
use crate::services::event_store::EventService;

/// Project key used for the trailing audit events of memory CRUD; memories
/// themselves are not project-scoped.
const AUDIT_PROJECT: &str = "memory";

#[derive(Debug, Clone)]
pub struct FindOptions {
    pub limit: usize,
    pub threshold: f64,
    pub collection: Option<String>,
    pub use_fts: bool,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            threshold: 0.0,
            collection: None,
            use_fts: false,
        }
    }
}

#[derive(Clone)]
pub struct MemoryService {
    events: EventService,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl MemoryService {
    pub fn new(events: EventService, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { events, embedder }
    }

    fn pool(&self) -> &SqlitePool {
        self.events.pool()
    }

    // -- write --

    /// Upsert a memory. The embedding is computed through the provider; on
    /// failure the memory is stored without one and the write still lands.
    pub async fn store(&self, new: NewMemory) -> CoreResult<Memory> {
        if new.content.trim().is_empty() {
            return Err(CoreError::Invalid("memory content must not be empty".to_string()));
        }

        let id = new.id.clone().unwrap_or_else(generate_memory_id);
        let collection = new.collection.clone().unwrap_or_else(|| "default".to_string());
        let metadata = new.metadata.clone().unwrap_or_else(|| serde_json::json!({}));
        let now = format_datetime(Utc::now());

        let embedding_blob = match self.embedder.embed(&new.content).await {
            Ok(vector) => Some(pack_vector(&vector)?),
            Err(error) => {
                tracing::warn!(%id, %error, "embedding unavailable, storing without vector");
                None
            }
        };

        sqlx::query(
            "INSERT INTO memories \
             (id, content, metadata, collection, tags, keywords, embedding, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                 content = excluded.content, \
                 metadata = excluded.metadata, \
                 collection = excluded.collection, \
                 tags = excluded.tags, \
                 keywords = excluded.keywords, \
                 embedding = excluded.embedding, \
                 updated_at = excluded.updated_at",
        )
        .bind(&id)
        .bind(&new.content)
        .bind(serde_json::to_string(&metadata)?)
        .bind(&collection)
        .bind(serde_json::to_string(&new.tags)?)
        .bind(&new.keywords)
        .bind(&embedding_blob)
        .bind(&now)
        .bind(&now)
        .execute(self.pool())
        .await?;

        let audit = MemoryAudit { memory_id: id.clone(), collection: Some(collection) };
        self.events
            .append(NewEvent::new(types::MEMORY_STORED, AUDIT_PROJECT, serde_json::to_value(&audit)?))
            .await?;

        self.get(&id)
            .await?
            .ok_or_else(|| CoreError::Internal(format!("memory row missing after store: {id}")))
    }

    pub async fn get(&self, id: &str) -> CoreResult<Option<Memory>> {
        let row: Option<MemoryRow> = sqlx::query_as("SELECT * FROM memories WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// Newest first, optionally scoped to one collection.
    pub async fn list(&self, collection: Option<&str>, limit: u32) -> CoreResult<Vec<Memory>> {
        let rows: Vec<MemoryRow> = if let Some(collection) = collection {
            sqlx::query_as(
                "SELECT * FROM memories WHERE collection = ? ORDER BY created_at DESC, id LIMIT ?",
            )
            .bind(collection)
            .bind(i64::from(limit))
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as("SELECT * FROM memories ORDER BY created_at DESC, id LIMIT ?")
                .bind(i64::from(limit))
                .fetch_all(self.pool())
                .await?
        };
        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn remove(&self, id: &str) -> CoreResult<()> {
        let result = sqlx::query("DELETE FROM memories WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("memory", id));
        }

        let audit = MemoryAudit { memory_id: id.to_string(), collection: None };
        self.events
            .append(NewEvent::new(types::MEMORY_REMOVED, AUDIT_PROJECT, serde_json::to_value(&audit)?))
            .await?;
        Ok(())
    }

    // -- search --

    /// Hybrid similarity search. The vector path scores by
    /// `1 - cosine distance`; when FTS is requested, or the embedder is
    /// unavailable or fails on the query, results come from the FTS index.
    pub async fn find(&self, query: &str, options: &FindOptions) -> CoreResult<Vec<SearchHit>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        if options.use_fts || !self.embedder.is_available().await {
            return self.find_fts(query, options).await;
        }

        match self.embedder.embed(query).await {
            Ok(vector) => self.find_vector(&vector, options).await,
            Err(error) => {
                tracing::warn!(%error, "query embedding failed, falling back to FTS");
                self.find_fts(query, options).await
            }
        }
    }

    async fn find_vector(&self, query: &[f32], options: &FindOptions) -> CoreResult<Vec<SearchHit>> {
        let rows: Vec<MemoryRow> = if let Some(collection) = &options.collection {
            sqlx::query_as(
                "SELECT * FROM memories WHERE embedding IS NOT NULL AND collection = ?",
            )
            .bind(collection)
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as("SELECT * FROM memories WHERE embedding IS NOT NULL")
                .fetch_all(self.pool())
                .await?
        };

        let mut hits: Vec<SearchHit> = Vec::new();
        for row in rows {
            let memory: Memory = row.try_into()?;
            let Some(embedding) = &memory.embedding else {
                continue;
            };
            let score = f64::from(1.0 - cosine_distance(query, embedding));
            if score >= options.threshold {
                hits.push(SearchHit { memory, score, match_type: MatchType::Vector });
            }
        }

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(options.limit);
        Ok(hits)
    }

    async fn find_fts(&self, query: &str, options: &FindOptions) -> CoreResult<Vec<SearchHit>> {
        let sanitized = sanitize_fts5_query(query);
        if sanitized.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<FtsRow> = if let Some(collection) = &options.collection {
            sqlx::query_as(
                "SELECT m.*, memories_fts.rank AS fts_rank FROM memories m \
                 JOIN memories_fts ON memories_fts.rowid = m.rowid \
                 WHERE memories_fts MATCH ? AND m.collection = ? \
                 ORDER BY memories_fts.rank LIMIT ?",
            )
            .bind(&sanitized)
            .bind(collection)
            .bind(options.limit as i64)
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as(
                "SELECT m.*, memories_fts.rank AS fts_rank FROM memories m \
                 JOIN memories_fts ON memories_fts.rowid = m.rowid \
                 WHERE memories_fts MATCH ? \
                 ORDER BY memories_fts.rank LIMIT ?",
            )
            .bind(&sanitized)
            .bind(options.limit as i64)
            .fetch_all(self.pool())
            .await?
        };

        rows.into_iter()
            .map(|row| {
                // FTS5 rank is a negative bm25 value, lower is better.
                let score = -row.fts_rank;
                Ok(SearchHit {
                    memory: row.memory.try_into()?,
                    score,
                    match_type: MatchType::Fts,
                })
            })
            .collect()
    }

    /// Embedder reachability.
    pub async fn check_health(&self) -> MemoryHealth {
        MemoryHealth {
            ollama: self.embedder.is_available().await,
            model: self.embedder.model().to_string(),
        }
    }

    // -- links --

    pub async fn create_link(
        &self,
        source_id: &str,
        target_id: &str,
        link_type: LinkType,
        strength: f64,
    ) -> CoreResult<MemoryLink> {
        if source_id == target_id {
            return Err(CoreError::Invalid("memory cannot link to itself".to_string()));
        }
        for id in [source_id, target_id] {
            if self.get(id).await?.is_none() {
                return Err(CoreError::not_found("memory", id));
            }
        }

        let id = format!("lnk-{}", Uuid::new_v4());
        let result = sqlx::query(
            "INSERT INTO memory_links (id, source_id, target_id, link_type, strength, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(source_id)
        .bind(target_id)
        .bind(link_type.as_str())
        .bind(strength.clamp(0.0, 1.0))
        .bind(format_datetime(Utc::now()))
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(CoreError::Conflict(format!(
                    "link already exists: {source_id} -> {target_id} ({})",
                    link_type.as_str()
                )));
            }
            Err(other) => return Err(other.into()),
        }

        self.link(&id)
            .await?
            .ok_or_else(|| CoreError::Internal(format!("link row missing after insert: {id}")))
    }

    pub async fn link(&self, id: &str) -> CoreResult<Option<MemoryLink>> {
        let row: Option<LinkRow> = sqlx::query_as(
            "SELECT id, source_id, target_id, link_type, strength, created_at \
             FROM memory_links WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// Nudge a link's strength by `delta`, clamped into `[0, 1]`.
    pub async fn update_link_strength(&self, id: &str, delta: f64) -> CoreResult<MemoryLink> {
        let result = sqlx::query(
            "UPDATE memory_links SET strength = MAX(0.0, MIN(1.0, strength + ?)) WHERE id = ?",
        )
        .bind(delta)
        .bind(id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("memory link", id));
        }
        self.link(id)
            .await?
            .ok_or_else(|| CoreError::not_found("memory link", id))
    }

    /// Edges incident to `memory_id` in either direction.
    pub async fn get_links(
        &self,
        memory_id: &str,
        link_type: Option<LinkType>,
    ) -> CoreResult<Vec<MemoryLink>> {
        let rows: Vec<LinkRow> = if let Some(link_type) = link_type {
            sqlx::query_as(
                "SELECT id, source_id, target_id, link_type, strength, created_at \
                 FROM memory_links WHERE (source_id = ? OR target_id = ?) AND link_type = ? \
                 ORDER BY created_at",
            )
            .bind(memory_id)
            .bind(memory_id)
            .bind(link_type.as_str())
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as(
                "SELECT id, source_id, target_id, link_type, strength, created_at \
                 FROM memory_links WHERE source_id = ? OR target_id = ? \
                 ORDER BY created_at",
            )
            .bind(memory_id)
            .bind(memory_id)
            .fetch_all(self.pool())
            .await?
        };
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Propose `related` edges from vector similarity, skipping self and
    /// already-linked memories. Returns the created links. Degrades to an
    /// empty result when the memory has no embedding.
    pub async fn auto_link(
        &self,
        memory_id: &str,
        threshold: f64,
        max_links: usize,
    ) -> CoreResult<Vec<MemoryLink>> {
        let Some(memory) = self.get(memory_id).await? else {
            return Err(CoreError::not_found("memory", memory_id));
        };
        let Some(embedding) = &memory.embedding else {
            return Ok(Vec::new());
        };

        let options = FindOptions {
            limit: max_links + 1,
            threshold,
            collection: None,
            use_fts: false,
        };
        let hits = self.find_vector(embedding, &options).await?;

        let existing: std::collections::HashSet<String> = self
            .get_links(memory_id, None)
            .await?
            .into_iter()
            .flat_map(|l| [l.source_id, l.target_id])
            .collect();

        let mut created = Vec::new();
        for hit in hits {
            if created.len() >= max_links {
                break;
            }
            if hit.memory.id == memory_id || existing.contains(&hit.memory.id) {
                continue;
            }
            created.push(
                self.create_link(memory_id, &hit.memory.id, LinkType::Related, hit.score)
                    .await?,
            );
        }
        Ok(created)
    }

    /// Best-effort enrichment seam: write LLM-scored tags. When the scorer
    /// is unreachable, callers pass an empty list and the memory simply
    /// stays unenriched.
    pub async fn set_auto_tags(&self, memory_id: &str, tags: &[String]) -> CoreResult<()> {
        let result = sqlx::query("UPDATE memories SET auto_tags = ? WHERE id = ?")
            .bind(serde_json::to_string(tags)?)
            .bind(memory_id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("memory", memory_id));
        }
        Ok(())
    }

    // -- entities / relationships --

    /// Upsert an entity, de-duplicating by `(name, entity_type)` and by
    /// canonical name within the type.
    pub async fn upsert_entity(
        &self,
        name: &str,
        entity_type: &str,
        canonical_name: Option<&str>,
    ) -> CoreResult<Entity> {
        if let Some(canonical) = canonical_name {
            let existing: Option<EntityRow> = sqlx::query_as(
                "SELECT id, name, entity_type, canonical_name, created_at FROM entities \
                 WHERE entity_type = ? AND canonical_name = ?",
            )
            .bind(entity_type)
            .bind(canonical)
            .fetch_optional(self.pool())
            .await?;
            if let Some(row) = existing {
                return row.try_into();
            }
        }

        let id = format!("ent-{}", Uuid::new_v4());
        sqlx::query(
            "INSERT INTO entities (id, name, entity_type, canonical_name, created_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(name, entity_type) DO UPDATE SET \
                 canonical_name = COALESCE(excluded.canonical_name, entities.canonical_name)",
        )
        .bind(&id)
        .bind(name)
        .bind(entity_type)
        .bind(canonical_name)
        .bind(format_datetime(Utc::now()))
        .execute(self.pool())
        .await?;

        let row: EntityRow = sqlx::query_as(
            "SELECT id, name, entity_type, canonical_name, created_at FROM entities \
             WHERE name = ? AND entity_type = ?",
        )
        .bind(name)
        .bind(entity_type)
        .fetch_one(self.pool())
        .await?;
        row.try_into()
    }

    /// Upsert a `(subject, predicate, object)` triple; re-asserting updates
    /// confidence and provenance.
    pub async fn add_relationship(
        &self,
        subject_entity_id: &str,
        predicate: &str,
        object_entity_id: &str,
        memory_id: Option<&str>,
        confidence: f64,
    ) -> CoreResult<Relationship> {
        let id = format!("rel-{}", Uuid::new_v4());
        sqlx::query(
            "INSERT INTO relationships \
             (id, subject_entity_id, predicate, object_entity_id, memory_id, confidence, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(subject_entity_id, predicate, object_entity_id) DO UPDATE SET \
                 confidence = excluded.confidence, \
                 memory_id = COALESCE(excluded.memory_id, relationships.memory_id)",
        )
        .bind(&id)
        .bind(subject_entity_id)
        .bind(predicate)
        .bind(object_entity_id)
        .bind(memory_id)
        .bind(confidence.clamp(0.0, 1.0))
        .bind(format_datetime(Utc::now()))
        .execute(self.pool())
        .await?;

        let row: RelationshipRow = sqlx::query_as(
            "SELECT id, subject_entity_id, predicate, object_entity_id, memory_id, confidence, created_at \
             FROM relationships \
             WHERE subject_entity_id = ? AND predicate = ? AND object_entity_id = ?",
        )
        .bind(subject_entity_id)
        .bind(predicate)
        .bind(object_entity_id)
        .fetch_one(self.pool())
        .await?;
        row.try_into()
    }

    pub async fn tag_entity(&self, memory_id: &str, entity_id: &str, role: &str) -> CoreResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO memory_entities (memory_id, entity_id, role) VALUES (?, ?, ?)",
        )
        .bind(memory_id)
        .bind(entity_id)
        .bind(role)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

/// Quote every token so FTS5 reserved syntax (AND, OR, NOT, `col:`) reads
/// as literal terms; interior quotes are doubled.
fn sanitize_fts5_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(sqlx::FromRow)]
struct MemoryRow {
    id: String,
    content: String,
    metadata: Option<String>,
    collection: String,
    tags: Option<String>,
    keywords: Option<String>,
    auto_tags: Option<String>,
    decay_factor: f64,
    embedding: Option<Vec<u8>>,
    valid_from: Option<String>,
    valid_until: Option<String>,
    superseded_by: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<MemoryRow> for Memory {
    type Error = CoreError;

    fn try_from(row: MemoryRow) -> Result<Self, Self::Error> {
        let embedding = row.embedding.as_deref().map(unpack_vector).transpose()?;
        Ok(Memory {
            id: row.id,
            content: row.content,
            metadata: row
                .metadata
                .map(|m| serde_json::from_str(&m))
                .transpose()?
                .unwrap_or_else(|| serde_json::json!({})),
            collection: row.collection,
            tags: crate::adapters::sqlite::parse_json_or_default(row.tags)?,
            keywords: row.keywords,
            auto_tags: crate::adapters::sqlite::parse_json_or_default(row.auto_tags)?,
            decay_factor: row.decay_factor,
            embedding,
            valid_from: parse_optional_datetime(row.valid_from)?,
            valid_until: parse_optional_datetime(row.valid_until)?,
            superseded_by: row.superseded_by,
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct FtsRow {
    #[sqlx(flatten)]
    memory: MemoryRow,
    fts_rank: f64,
}

#[derive(sqlx::FromRow)]
struct LinkRow {
    id: String,
    source_id: String,
    target_id: String,
    link_type: String,
    strength: f64,
    created_at: String,
}

impl TryFrom<LinkRow> for MemoryLink {
    type Error = CoreError;

    fn try_from(row: LinkRow) -> Result<Self, Self::Error> {
        Ok(MemoryLink {
            id: row.id,
            source_id: row.source_id,
            target_id: row.target_id,
            link_type: LinkType::from_str(&row.link_type).unwrap_or(LinkType::Related),
            strength: row.strength,
            created_at: parse_datetime(&row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EntityRow {
    id: String,
    name: String,
    entity_type: String,
    canonical_name: Option<String>,
    created_at: String,
}

impl TryFrom<EntityRow> for Entity {
    type Error = CoreError;

    fn try_from(row: EntityRow) -> Result<Self, Self::Error> {
        Ok(Entity {
            id: row.id,
            name: row.name,
            entity_type: row.entity_type,
            canonical_name: row.canonical_name,
            created_at: parse_datetime(&row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RelationshipRow {
    id: String,
    subject_entity_id: String,
    predicate: String,
    object_entity_id: String,
    memory_id: Option<String>,
    confidence: f64,
    created_at: String,
}

impl TryFrom<RelationshipRow> for Relationship {
    type Error = CoreError;

    fn try_from(row: RelationshipRow) -> Result<Self, Self::Error> {
        Ok(Relationship {
            id: row.id,
            subject_entity_id: row.subject_entity_id,
            predicate: row.predicate,
            object_entity_id: row.object_entity_id,
            memory_id: row.memory_id,
            confidence: row.confidence,
            created_at: parse_datetime(&row.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_quotes_every_token() {
        assert_eq!(sanitize_fts5_query("hello world"), "\"hello\" \"world\"");
        assert_eq!(sanitize_fts5_query("AND OR NOT"), "\"AND\" \"OR\" \"NOT\"");
        assert_eq!(sanitize_fts5_query("key: value"), "\"key:\" \"value\"");
        assert_eq!(sanitize_fts5_query(""), "");
        assert_eq!(sanitize_fts5_query("say\"hi\""), "\"say\"\"hi\"\"\"");
    }
}
