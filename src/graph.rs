//! Graph store facade: the only component allowed to mutate the graph.
//!
//! Concepts, sources, instances, and relationships live in relational
//! tables; every access goes through the typed primitives here. There is no
//! raw-query surface, no variable-length traversal, and every read carries a
//! bound: the neighbor query takes an explicit seed list (capped), vector
//! search takes `top_k`, listings take limits. Pathfinding and polarity are
//! built in application code on top of [`GraphStore::neighbors`] — one
//! batched call per hop, never one query per node.
//!
//! Writes validate embedding dimensions against the active configuration;
//! a mismatched vector is a consistency error and is rejected before it
//! reaches a table.

use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{KgError, KgResult};
use crate::models::{Concept, Document, Instance, Relationship, Source};

/// Hard cap on seed-list size for batched queries.
const MAX_BATCH_IDS: usize = 5000;

/// SQLite bind-variable budget per statement; larger seed lists are split
/// into consecutive IN chunks inside one logical call.
const SQL_CHUNK: usize = 900;

/// Edge direction filter for neighbor queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
    Either,
}

/// One row of a neighbor query: a single hop from `from_id` to `to_id`.
#[derive(Debug, Clone)]
pub struct NeighborEdge {
    pub from_id: String,
    pub to_id: String,
    pub type_name: String,
}

/// Graph-wide counts for the statistics endpoint.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct GraphStats {
    pub concepts: i64,
    pub sources: i64,
    pub instances: i64,
    pub relationships: i64,
    pub documents: i64,
}

#[derive(Debug, Clone)]
pub struct GraphStore {
    pool: SqlitePool,
    /// Active embedding dimension; all stored vectors must match. Shared
    /// across clones so a config swap updates every holder at once.
    dims: Arc<AtomicUsize>,
}

impl GraphStore {
    pub fn new(pool: SqlitePool, dims: usize) -> Self {
        Self {
            pool,
            dims: Arc::new(AtomicUsize::new(dims)),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn dims(&self) -> usize {
        self.dims.load(Ordering::Relaxed)
    }

    /// Update the active dimension after an embedding rebuild.
    pub fn set_dims(&self, dims: usize) {
        self.dims.store(dims, Ordering::Relaxed);
    }

    fn check_dims(&self, embedding: &[f32]) -> KgResult<()> {
        let dims = self.dims();
        if embedding.len() != dims {
            return Err(KgError::Consistency(format!(
                "embedding dimension mismatch: expected {}, got {}",
                dims,
                embedding.len()
            )));
        }
        Ok(())
    }

    fn check_batch(ids: &[String]) -> KgResult<()> {
        if ids.len() > MAX_BATCH_IDS {
            return Err(KgError::Validation(format!(
                "batch of {} ids exceeds the {} cap",
                ids.len(),
                MAX_BATCH_IDS
            )));
        }
        Ok(())
    }

    // ============ Concepts ============

    /// Idempotent create keyed on the content-hashed id. Returns `true`
    /// when this call inserted the row, `false` when it already existed.
    /// This is the collision-safe primitive parallel ingestion relies on.
    pub async fn create_concept(&self, concept: &Concept) -> KgResult<bool> {
        self.check_dims(&concept.embedding)?;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO concepts (id, label, description, search_terms_json, embedding, dims, ontology, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&concept.id)
        .bind(&concept.label)
        .bind(&concept.description)
        .bind(serde_json::to_string(&concept.search_terms)?)
        .bind(vec_to_blob(&concept.embedding))
        .bind(self.dims() as i64)
        .bind(&concept.ontology)
        .bind(concept.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_concept(&self, id: &str) -> KgResult<Option<Concept>> {
        let row = sqlx::query(
            "SELECT id, label, description, search_terms_json, embedding, ontology, created_at FROM concepts WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(concept_from_row).transpose()
    }

    /// Batched fetch preserving no particular order.
    pub async fn get_concepts(&self, ids: &[String]) -> KgResult<Vec<Concept>> {
        Self::check_batch(ids)?;
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(SQL_CHUNK) {
            let sql = format!(
                "SELECT id, label, description, search_terms_json, embedding, ontology, created_at FROM concepts WHERE id IN ({})",
                placeholders(chunk.len())
            );
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            for row in query.fetch_all(&self.pool).await? {
                out.push(concept_from_row(row)?);
            }
        }
        Ok(out)
    }

    /// Append new search terms to a concept, preserving order and skipping
    /// duplicates. The description is never overwritten here.
    pub async fn append_search_terms(&self, id: &str, terms: &[String]) -> KgResult<()> {
        let existing: Option<String> =
            sqlx::query_scalar("SELECT search_terms_json FROM concepts WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        let existing =
            existing.ok_or_else(|| KgError::NotFound(format!("concept {}", id)))?;
        let mut all: Vec<String> = serde_json::from_str(&existing)?;
        let known: HashSet<String> = all.iter().map(|t| t.to_lowercase()).collect();
        for t in terms {
            if !known.contains(&t.to_lowercase()) {
                all.push(t.clone());
            }
        }
        sqlx::query("UPDATE concepts SET search_terms_json = ? WHERE id = ?")
            .bind(serde_json::to_string(&all)?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Manual edit surface: update label and/or description.
    pub async fn update_concept(
        &self,
        id: &str,
        label: Option<&str>,
        description: Option<&str>,
    ) -> KgResult<()> {
        if self.get_concept(id).await?.is_none() {
            return Err(KgError::NotFound(format!("concept {}", id)));
        }
        if let Some(label) = label {
            sqlx::query("UPDATE concepts SET label = ? WHERE id = ?")
                .bind(label)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        if let Some(description) = description {
            sqlx::query("UPDATE concepts SET description = ? WHERE id = ?")
                .bind(description)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Delete a concept with its instances and edges.
    pub async fn delete_concept(&self, id: &str) -> KgResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM instances WHERE concept_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM relationships WHERE from_id = ? OR to_id = ?")
            .bind(id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM concepts WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        if result.rows_affected() == 0 {
            return Err(KgError::NotFound(format!("concept {}", id)));
        }
        Ok(())
    }

    /// Every concept id, optionally scoped to an ontology. Used by the
    /// embedding rebuild job.
    pub async fn list_concept_ids(&self, ontology: Option<&str>) -> KgResult<Vec<String>> {
        let ids = match ontology {
            Some(o) => {
                sqlx::query_scalar("SELECT id FROM concepts WHERE ontology = ?")
                    .bind(o)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT id FROM concepts")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(ids)
    }

    /// Replace a concept's embedding without the dimension check. Only the
    /// rebuild job uses this, mid-flight between two active configurations.
    pub async fn rewrite_embedding(&self, id: &str, embedding: &[f32]) -> KgResult<()> {
        sqlx::query("UPDATE concepts SET embedding = ?, dims = ? WHERE id = ?")
            .bind(vec_to_blob(embedding))
            .bind(embedding.len() as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ============ Vector search ============

    /// Cosine-similarity search over concept embeddings, optionally scoped
    /// to a set of ontologies. Returns `(concept_id, similarity)` sorted
    /// descending, at most `top_k` rows at or above `threshold`.
    pub async fn vector_search(
        &self,
        embedding: &[f32],
        ontologies: Option<&[String]>,
        top_k: usize,
        threshold: f32,
    ) -> KgResult<Vec<(String, f32)>> {
        self.check_dims(embedding)?;

        let rows = match ontologies {
            Some(list) if !list.is_empty() => {
                let sql = format!(
                    "SELECT id, embedding FROM concepts WHERE ontology IN ({})",
                    placeholders(list.len())
                );
                let mut query = sqlx::query(&sql);
                for o in list {
                    query = query.bind(o);
                }
                query.fetch_all(&self.pool).await?
            }
            _ => {
                sqlx::query("SELECT id, embedding FROM concepts")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut scored: Vec<(String, f32)> = rows
            .into_iter()
            .filter_map(|row| {
                let id: String = row.get("id");
                let blob: Vec<u8> = row.get("embedding");
                let sim = cosine_similarity(embedding, &blob_to_vec(&blob));
                (sim >= threshold).then_some((id, sim))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    // ============ Neighbors ============

    /// Batched one-hop expansion: all edges touching any seed id, optionally
    /// filtered by type and direction. One logical call regardless of seed
    /// count; endpoints are concepts by construction of the schema.
    pub async fn neighbors(
        &self,
        seed_ids: &[String],
        type_filter: Option<&[String]>,
        direction: Direction,
    ) -> KgResult<Vec<NeighborEdge>> {
        Self::check_batch(seed_ids)?;
        if seed_ids.is_empty() {
            return Ok(Vec::new());
        }

        let type_clause = match type_filter {
            Some(types) if !types.is_empty() => {
                format!(" AND type_name IN ({})", placeholders(types.len()))
            }
            _ => String::new(),
        };

        let mut out = Vec::new();
        for chunk in seed_ids.chunks(SQL_CHUNK) {
            let ph = placeholders(chunk.len());
            let where_ids = match direction {
                Direction::Outgoing => format!("from_id IN ({})", ph),
                Direction::Incoming => format!("to_id IN ({})", ph),
                Direction::Either => format!("(from_id IN ({ph}) OR to_id IN ({ph}))"),
            };
            let sql = format!(
                "SELECT from_id, to_id, type_name FROM relationships WHERE {}{}",
                where_ids, type_clause
            );
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            if direction == Direction::Either {
                for id in chunk {
                    query = query.bind(id);
                }
            }
            if let Some(types) = type_filter {
                for t in types {
                    query = query.bind(t);
                }
            }
            for row in query.fetch_all(&self.pool).await? {
                out.push(NeighborEdge {
                    from_id: row.get("from_id"),
                    to_id: row.get("to_id"),
                    type_name: row.get("type_name"),
                });
            }
        }
        Ok(out)
    }

    // ============ Relationships ============

    /// Create or extend an edge. On conflict with an existing
    /// `(from, to, type)` edge the evidence lists are unioned (deduplicated
    /// by source id) and the higher confidence wins. Returns `true` when a
    /// new edge row was created.
    pub async fn upsert_edge(&self, rel: &Relationship) -> KgResult<bool> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT id, confidence, evidence_json FROM relationships WHERE from_id = ? AND to_id = ? AND type_name = ?",
        )
        .bind(&rel.from_id)
        .bind(&rel.to_id)
        .bind(&rel.type_name)
        .fetch_optional(&mut *tx)
        .await?;

        let created = match existing {
            Some(row) => {
                let id: String = row.get("id");
                let confidence: f64 = row.get("confidence");
                let evidence_json: String = row.get("evidence_json");
                let mut evidence: Vec<String> = serde_json::from_str(&evidence_json)?;
                let known: HashSet<String> = evidence.iter().cloned().collect();
                for s in &rel.evidence {
                    if !known.contains(s) {
                        evidence.push(s.clone());
                    }
                }
                sqlx::query(
                    "UPDATE relationships SET evidence_json = ?, confidence = ? WHERE id = ?",
                )
                .bind(serde_json::to_string(&evidence)?)
                .bind(confidence.max(rel.confidence))
                .bind(&id)
                .execute(&mut *tx)
                .await?;
                false
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO relationships (id, from_id, to_id, type_name, confidence, evidence_json, created_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&rel.id)
                .bind(&rel.from_id)
                .bind(&rel.to_id)
                .bind(&rel.type_name)
                .bind(rel.confidence)
                .bind(serde_json::to_string(&rel.evidence)?)
                .bind(rel.created_at)
                .execute(&mut *tx)
                .await?;
                true
            }
        };

        tx.commit().await?;
        Ok(created)
    }

    /// Full relationship rows touching a set of concepts.
    pub async fn relationships_for(&self, ids: &[String]) -> KgResult<Vec<Relationship>> {
        Self::check_batch(ids)?;
        let mut out = Vec::new();
        for chunk in ids.chunks(SQL_CHUNK) {
            let ph = placeholders(chunk.len());
            let sql = format!(
                "SELECT id, from_id, to_id, type_name, confidence, evidence_json, created_at FROM relationships WHERE from_id IN ({ph}) OR to_id IN ({ph})",
            );
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            for id in chunk {
                query = query.bind(id);
            }
            for row in query.fetch_all(&self.pool).await? {
                out.push(relationship_from_row(row)?);
            }
        }
        Ok(out)
    }

    /// Atomically re-type every edge of `old_type` to `new_type`, used by
    /// vocabulary consolidation. Edges that would collide with an existing
    /// `(from, to, new_type)` edge are folded into it (evidence union, max
    /// confidence). Returns the number of edges moved.
    pub async fn retype_edges(&self, old_type: &str, new_type: &str) -> KgResult<u64> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "SELECT id, from_id, to_id, confidence, evidence_json FROM relationships WHERE type_name = ?",
        )
        .bind(old_type)
        .fetch_all(&mut *tx)
        .await?;

        let mut moved = 0u64;
        for row in rows {
            let id: String = row.get("id");
            let from_id: String = row.get("from_id");
            let to_id: String = row.get("to_id");
            let confidence: f64 = row.get("confidence");
            let evidence: Vec<String> =
                serde_json::from_str(&row.get::<String, _>("evidence_json"))?;

            let collision = sqlx::query(
                "SELECT id, confidence, evidence_json FROM relationships WHERE from_id = ? AND to_id = ? AND type_name = ?",
            )
            .bind(&from_id)
            .bind(&to_id)
            .bind(new_type)
            .fetch_optional(&mut *tx)
            .await?;

            match collision {
                Some(other) => {
                    let other_id: String = other.get("id");
                    let other_conf: f64 = other.get("confidence");
                    let mut other_evidence: Vec<String> =
                        serde_json::from_str(&other.get::<String, _>("evidence_json"))?;
                    let known: HashSet<String> = other_evidence.iter().cloned().collect();
                    for s in evidence {
                        if !known.contains(&s) {
                            other_evidence.push(s);
                        }
                    }
                    sqlx::query(
                        "UPDATE relationships SET evidence_json = ?, confidence = ? WHERE id = ?",
                    )
                    .bind(serde_json::to_string(&other_evidence)?)
                    .bind(other_conf.max(confidence))
                    .bind(&other_id)
                    .execute(&mut *tx)
                    .await?;
                    sqlx::query("DELETE FROM relationships WHERE id = ?")
                        .bind(&id)
                        .execute(&mut *tx)
                        .await?;
                }
                None => {
                    // Re-derive the content id so it stays consistent with
                    // the (from, to, type) triple.
                    let new_id = Relationship::make_id(&from_id, &to_id, new_type);
                    sqlx::query(
                        "UPDATE relationships SET type_name = ?, id = ? WHERE id = ?",
                    )
                    .bind(new_type)
                    .bind(&new_id)
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
            moved += 1;
        }

        tx.commit().await?;
        Ok(moved)
    }

    /// Edges carrying any of the given types, bounded by `limit`. Used by
    /// polarity-axis discovery to find opposition-flavored pairs.
    pub async fn edges_of_types(
        &self,
        types: &[String],
        limit: i64,
    ) -> KgResult<Vec<Relationship>> {
        if types.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, from_id, to_id, type_name, confidence, evidence_json, created_at FROM relationships WHERE type_name IN ({}) LIMIT ?",
            placeholders(types.len())
        );
        let mut query = sqlx::query(&sql);
        for t in types {
            query = query.bind(t);
        }
        query = query.bind(limit);
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(relationship_from_row).collect()
    }

    pub async fn delete_edge(&self, id: &str) -> KgResult<()> {
        let result = sqlx::query("DELETE FROM relationships WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(KgError::NotFound(format!("relationship {}", id)));
        }
        Ok(())
    }

    /// Count edges carrying a given type.
    pub async fn count_edges_of_type(&self, type_name: &str) -> KgResult<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM relationships WHERE type_name = ?")
                .bind(type_name)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    // ============ Sources & instances ============

    /// Idempotent source insert; sources are immutable so a second insert
    /// of the same id is a no-op.
    pub async fn create_source(&self, source: &Source) -> KgResult<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO sources (id, document_id, chunk_index, text, object_key, ontology)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&source.id)
        .bind(&source.document_id)
        .bind(source.chunk_index)
        .bind(&source.text)
        .bind(&source.object_key)
        .bind(&source.ontology)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_source(&self, id: &str) -> KgResult<Option<Source>> {
        let row = sqlx::query(
            "SELECT id, document_id, chunk_index, text, object_key, ontology FROM sources WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| Source {
            id: row.get("id"),
            document_id: row.get("document_id"),
            chunk_index: row.get("chunk_index"),
            text: row.get("text"),
            object_key: row.get("object_key"),
            ontology: row.get("ontology"),
        }))
    }

    /// Batch-create instances, skipping duplicates by (concept, source).
    /// Returns the number actually inserted.
    pub async fn add_instances(&self, instances: &[Instance]) -> KgResult<u64> {
        let mut inserted = 0u64;
        let mut tx = self.pool.begin().await?;
        for inst in instances {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO instances (concept_id, source_id, quote) VALUES (?, ?, ?)",
            )
            .bind(&inst.concept_id)
            .bind(&inst.source_id)
            .bind(&inst.quote)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Evidence lookup: instances (with quotes and source text) for a concept.
    pub async fn evidence_for_concept(
        &self,
        concept_id: &str,
        limit: i64,
    ) -> KgResult<Vec<(Instance, Source)>> {
        let rows = sqlx::query(
            r#"
            SELECT i.concept_id, i.source_id, i.quote,
                   s.id, s.document_id, s.chunk_index, s.text, s.object_key, s.ontology
            FROM instances i JOIN sources s ON s.id = i.source_id
            WHERE i.concept_id = ?
            LIMIT ?
            "#,
        )
        .bind(concept_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    Instance {
                        concept_id: row.get("concept_id"),
                        source_id: row.get("source_id"),
                        quote: row.get("quote"),
                    },
                    Source {
                        id: row.get("id"),
                        document_id: row.get("document_id"),
                        chunk_index: row.get("chunk_index"),
                        text: row.get("text"),
                        object_key: row.get("object_key"),
                        ontology: row.get("ontology"),
                    },
                )
            })
            .collect())
    }

    /// Per-edge evidence counts for a set of concepts, used by the
    /// grounding calculator. Returns (from_id, to_id, type_name,
    /// evidence_count).
    pub async fn edge_evidence_counts(
        &self,
        ids: &[String],
    ) -> KgResult<Vec<(String, String, String, usize)>> {
        let rels = self.relationships_for(ids).await?;
        Ok(rels
            .into_iter()
            .map(|r| (r.from_id, r.to_id, r.type_name, r.evidence.len().max(1)))
            .collect())
    }

    // ============ Documents ============

    pub async fn create_document(&self, doc: &Document) -> KgResult<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, filename, ontology, content_type, mime, size_bytes, object_key, ingested_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.filename)
        .bind(&doc.ontology)
        .bind(&doc.content_type)
        .bind(&doc.mime)
        .bind(doc.size_bytes)
        .bind(&doc.object_key)
        .bind(doc.ingested_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                KgError::Conflict(format!("document {} already ingested", doc.id))
            }
            other => KgError::Database(other),
        })?;
        Ok(())
    }

    pub async fn get_document(&self, id: &str) -> KgResult<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, filename, ontology, content_type, mime, size_bytes, object_key, ingested_at FROM documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(document_from_row))
    }

    pub async fn list_documents(&self, ontology: &str) -> KgResult<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT id, filename, ontology, content_type, mime, size_bytes, object_key, ingested_at FROM documents WHERE ontology = ? ORDER BY ingested_at",
        )
        .bind(ontology)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(document_from_row).collect())
    }

    /// Delete a document and its sources, instances, and evidence
    /// references. Returns the source ids that were removed.
    pub async fn delete_document(&self, id: &str) -> KgResult<Vec<String>> {
        let source_ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM sources WHERE document_id = ?")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;

        let mut tx = self.pool.begin().await?;
        for chunk in source_ids.chunks(SQL_CHUNK) {
            let sql = format!(
                "DELETE FROM instances WHERE source_id IN ({})",
                placeholders(chunk.len())
            );
            let mut query = sqlx::query(&sql);
            for s in chunk {
                query = query.bind(s);
            }
            query.execute(&mut *tx).await?;
        }
        sqlx::query("DELETE FROM sources WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if result.rows_affected() == 0 {
            return Err(KgError::NotFound(format!("document {}", id)));
        }

        self.scrub_evidence(&source_ids).await?;
        Ok(source_ids)
    }

    /// Remove deleted source ids from every edge's evidence list.
    async fn scrub_evidence(&self, source_ids: &[String]) -> KgResult<()> {
        if source_ids.is_empty() {
            return Ok(());
        }
        let gone: HashSet<&String> = source_ids.iter().collect();
        let rows = sqlx::query("SELECT id, evidence_json FROM relationships")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let id: String = row.get("id");
            let evidence: Vec<String> =
                serde_json::from_str(&row.get::<String, _>("evidence_json"))?;
            let kept: Vec<String> = evidence
                .iter()
                .filter(|s| !gone.contains(s))
                .cloned()
                .collect();
            if kept.len() != evidence.len() {
                sqlx::query("UPDATE relationships SET evidence_json = ? WHERE id = ?")
                    .bind(serde_json::to_string(&kept)?)
                    .bind(&id)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    // ============ Ontologies ============

    /// Distinct ontology names with concept counts.
    pub async fn list_ontologies(&self) -> KgResult<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT ontology, COUNT(*) AS n FROM concepts GROUP BY ontology ORDER BY ontology",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("ontology"), row.get("n")))
            .collect())
    }

    pub async fn rename_ontology(&self, old: &str, new: &str) -> KgResult<()> {
        let mut tx = self.pool.begin().await?;
        for table in ["concepts", "sources", "documents"] {
            let sql = format!("UPDATE {} SET ontology = ? WHERE ontology = ?", table);
            sqlx::query(&sql)
                .bind(new)
                .bind(old)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Destructive: delete every concept, source, instance, relationship,
    /// and document in an ontology.
    pub async fn delete_ontology(&self, ontology: &str) -> KgResult<GraphStats> {
        let concept_ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM concepts WHERE ontology = ?")
                .bind(ontology)
                .fetch_all(&self.pool)
                .await?;

        let mut tx = self.pool.begin().await?;
        let mut removed = GraphStats::default();

        for chunk in concept_ids.chunks(SQL_CHUNK) {
            let ph = placeholders(chunk.len());

            let sql = format!("DELETE FROM instances WHERE concept_id IN ({})", ph);
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            removed.instances += query.execute(&mut *tx).await?.rows_affected() as i64;

            let sql = format!(
                "DELETE FROM relationships WHERE from_id IN ({ph}) OR to_id IN ({ph})"
            );
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            for id in chunk {
                query = query.bind(id);
            }
            removed.relationships += query.execute(&mut *tx).await?.rows_affected() as i64;
        }

        removed.sources += sqlx::query("DELETE FROM sources WHERE ontology = ?")
            .bind(ontology)
            .execute(&mut *tx)
            .await?
            .rows_affected() as i64;
        removed.documents += sqlx::query("DELETE FROM documents WHERE ontology = ?")
            .bind(ontology)
            .execute(&mut *tx)
            .await?
            .rows_affected() as i64;
        removed.concepts += sqlx::query("DELETE FROM concepts WHERE ontology = ?")
            .bind(ontology)
            .execute(&mut *tx)
            .await?
            .rows_affected() as i64;

        tx.commit().await?;
        Ok(removed)
    }

    // ============ Statistics ============

    pub async fn stats(&self, ontology: Option<&str>) -> KgResult<GraphStats> {
        let mut stats = GraphStats::default();
        match ontology {
            Some(o) => {
                stats.concepts =
                    sqlx::query_scalar("SELECT COUNT(*) FROM concepts WHERE ontology = ?")
                        .bind(o)
                        .fetch_one(&self.pool)
                        .await?;
                stats.sources =
                    sqlx::query_scalar("SELECT COUNT(*) FROM sources WHERE ontology = ?")
                        .bind(o)
                        .fetch_one(&self.pool)
                        .await?;
                stats.documents =
                    sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE ontology = ?")
                        .bind(o)
                        .fetch_one(&self.pool)
                        .await?;
                stats.instances = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM instances WHERE concept_id IN (SELECT id FROM concepts WHERE ontology = ?)",
                )
                .bind(o)
                .fetch_one(&self.pool)
                .await?;
                stats.relationships = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM relationships WHERE from_id IN (SELECT id FROM concepts WHERE ontology = ?)",
                )
                .bind(o)
                .fetch_one(&self.pool)
                .await?;
            }
            None => {
                stats.concepts = sqlx::query_scalar("SELECT COUNT(*) FROM concepts")
                    .fetch_one(&self.pool)
                    .await?;
                stats.sources = sqlx::query_scalar("SELECT COUNT(*) FROM sources")
                    .fetch_one(&self.pool)
                    .await?;
                stats.instances = sqlx::query_scalar("SELECT COUNT(*) FROM instances")
                    .fetch_one(&self.pool)
                    .await?;
                stats.relationships = sqlx::query_scalar("SELECT COUNT(*) FROM relationships")
                    .fetch_one(&self.pool)
                    .await?;
                stats.documents = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
                    .fetch_one(&self.pool)
                    .await?;
            }
        }
        Ok(stats)
    }
}

fn placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 2);
    for i in 0..n {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}

fn concept_from_row(row: sqlx::sqlite::SqliteRow) -> KgResult<Concept> {
    let terms: Vec<String> = serde_json::from_str(&row.get::<String, _>("search_terms_json"))?;
    Ok(Concept {
        id: row.get("id"),
        label: row.get("label"),
        description: row.get("description"),
        search_terms: terms,
        embedding: blob_to_vec(&row.get::<Vec<u8>, _>("embedding")),
        ontology: row.get("ontology"),
        created_at: row.get("created_at"),
    })
}

fn relationship_from_row(row: sqlx::sqlite::SqliteRow) -> KgResult<Relationship> {
    let evidence: Vec<String> = serde_json::from_str(&row.get::<String, _>("evidence_json"))?;
    Ok(Relationship {
        id: row.get("id"),
        from_id: row.get("from_id"),
        to_id: row.get("to_id"),
        type_name: row.get("type_name"),
        confidence: row.get("confidence"),
        evidence,
        created_at: row.get("created_at"),
    })
}

fn document_from_row(row: sqlx::sqlite::SqliteRow) -> Document {
    Document {
        id: row.get("id"),
        filename: row.get("filename"),
        ontology: row.get("ontology"),
        content_type: row.get("content_type"),
        mime: row.get("mime"),
        size_bytes: row.get("size_bytes"),
        object_key: row.get("object_key"),
        ingested_at: row.get("ingested_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_list() {
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?,?,?");
    }

    async fn test_store() -> (tempfile::TempDir, GraphStore) {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("graph.sqlite");
        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        (tmp, GraphStore::new(pool, 4))
    }

    fn concept(id_label: &str, embedding: Vec<f32>) -> Concept {
        Concept {
            id: Concept::make_id(id_label, "Test"),
            label: id_label.to_string(),
            description: format!("about {}", id_label),
            search_terms: vec![],
            embedding,
            ontology: "Test".to_string(),
            created_at: 0,
        }
    }

    fn edge(from: &Concept, to: &Concept, type_name: &str, evidence: Vec<String>) -> Relationship {
        Relationship {
            id: Relationship::make_id(&from.id, &to.id, type_name),
            from_id: from.id.clone(),
            to_id: to.id.clone(),
            type_name: type_name.to_string(),
            confidence: 0.9,
            evidence,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn create_concept_is_idempotent() {
        let (_tmp, store) = test_store().await;
        let c = concept("Ego", vec![1.0, 0.0, 0.0, 0.0]);
        assert!(store.create_concept(&c).await.unwrap());
        assert!(!store.create_concept(&c).await.unwrap());
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let (_tmp, store) = test_store().await;
        let c = concept("Ego", vec![1.0, 0.0]);
        let err = store.create_concept(&c).await.unwrap_err();
        assert!(matches!(err, KgError::Consistency(_)));
    }

    #[tokio::test]
    async fn vector_search_finds_own_embedding_first() {
        let (_tmp, store) = test_store().await;
        let a = concept("Alpha", vec![1.0, 0.0, 0.0, 0.0]);
        let b = concept("Beta", vec![0.0, 1.0, 0.0, 0.0]);
        store.create_concept(&a).await.unwrap();
        store.create_concept(&b).await.unwrap();

        let hits = store
            .vector_search(&a.embedding, None, 10, 0.99)
            .await
            .unwrap();
        assert_eq!(hits[0].0, a.id);
    }

    #[tokio::test]
    async fn upsert_edge_unions_evidence() {
        let (_tmp, store) = test_store().await;
        let a = concept("Alpha", vec![1.0, 0.0, 0.0, 0.0]);
        let b = concept("Beta", vec![0.0, 1.0, 0.0, 0.0]);
        store.create_concept(&a).await.unwrap();
        store.create_concept(&b).await.unwrap();

        let e1 = edge(&a, &b, "IMPLIES", vec!["s1".into()]);
        assert!(store.upsert_edge(&e1).await.unwrap());
        let e2 = edge(&a, &b, "IMPLIES", vec!["s1".into(), "s2".into()]);
        assert!(!store.upsert_edge(&e2).await.unwrap());

        let rels = store.relationships_for(&[a.id.clone()]).await.unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].evidence, vec!["s1".to_string(), "s2".to_string()]);
    }

    #[tokio::test]
    async fn retype_moves_all_edges_and_preserves_count() {
        let (_tmp, store) = test_store().await;
        let a = concept("Alpha", vec![1.0, 0.0, 0.0, 0.0]);
        let b = concept("Beta", vec![0.0, 1.0, 0.0, 0.0]);
        let c = concept("Gamma", vec![0.0, 0.0, 1.0, 0.0]);
        for x in [&a, &b, &c] {
            store.create_concept(x).await.unwrap();
        }
        store
            .upsert_edge(&edge(&a, &b, "LEADS_TO", vec!["s1".into()]))
            .await
            .unwrap();
        store
            .upsert_edge(&edge(&b, &c, "LEADS_TO", vec!["s2".into()]))
            .await
            .unwrap();
        store
            .upsert_edge(&edge(&a, &c, "CAUSES", vec!["s3".into()]))
            .await
            .unwrap();

        let before_target = store.count_edges_of_type("CAUSES").await.unwrap();
        let before_source = store.count_edges_of_type("LEADS_TO").await.unwrap();
        let moved = store.retype_edges("LEADS_TO", "CAUSES").await.unwrap();

        assert_eq!(moved, 2);
        assert_eq!(store.count_edges_of_type("LEADS_TO").await.unwrap(), 0);
        assert_eq!(
            store.count_edges_of_type("CAUSES").await.unwrap(),
            before_target + before_source
        );
    }

    #[tokio::test]
    async fn retype_folds_collisions_into_existing_edge() {
        let (_tmp, store) = test_store().await;
        let a = concept("Alpha", vec![1.0, 0.0, 0.0, 0.0]);
        let b = concept("Beta", vec![0.0, 1.0, 0.0, 0.0]);
        store.create_concept(&a).await.unwrap();
        store.create_concept(&b).await.unwrap();
        store
            .upsert_edge(&edge(&a, &b, "LEADS_TO", vec!["s1".into()]))
            .await
            .unwrap();
        store
            .upsert_edge(&edge(&a, &b, "CAUSES", vec!["s2".into()]))
            .await
            .unwrap();

        store.retype_edges("LEADS_TO", "CAUSES").await.unwrap();

        let rels = store.relationships_for(&[a.id.clone()]).await.unwrap();
        assert_eq!(rels.len(), 1);
        let mut evidence = rels[0].evidence.clone();
        evidence.sort();
        assert_eq!(evidence, vec!["s1".to_string(), "s2".to_string()]);
    }

    #[tokio::test]
    async fn neighbors_is_batched_and_direction_aware() {
        let (_tmp, store) = test_store().await;
        let a = concept("Alpha", vec![1.0, 0.0, 0.0, 0.0]);
        let b = concept("Beta", vec![0.0, 1.0, 0.0, 0.0]);
        let c = concept("Gamma", vec![0.0, 0.0, 1.0, 0.0]);
        for x in [&a, &b, &c] {
            store.create_concept(x).await.unwrap();
        }
        store
            .upsert_edge(&edge(&a, &b, "IMPLIES", vec![]))
            .await
            .unwrap();
        store
            .upsert_edge(&edge(&c, &a, "SUPPORTS", vec![]))
            .await
            .unwrap();

        let out = store
            .neighbors(&[a.id.clone()], None, Direction::Outgoing)
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to_id, b.id);

        let either = store
            .neighbors(&[a.id.clone()], None, Direction::Either)
            .await
            .unwrap();
        assert_eq!(either.len(), 2);

        let typed = store
            .neighbors(
                &[a.id.clone()],
                Some(&["SUPPORTS".to_string()]),
                Direction::Either,
            )
            .await
            .unwrap();
        assert_eq!(typed.len(), 1);
        assert_eq!(typed[0].from_id, c.id);
    }

    #[tokio::test]
    async fn delete_ontology_cascades() {
        let (_tmp, store) = test_store().await;
        let a = concept("Alpha", vec![1.0, 0.0, 0.0, 0.0]);
        let b = concept("Beta", vec![0.0, 1.0, 0.0, 0.0]);
        store.create_concept(&a).await.unwrap();
        store.create_concept(&b).await.unwrap();
        store
            .upsert_edge(&edge(&a, &b, "IMPLIES", vec![]))
            .await
            .unwrap();

        let removed = store.delete_ontology("Test").await.unwrap();
        assert_eq!(removed.concepts, 2);
        assert_eq!(removed.relationships, 1);
        let stats = store.stats(None).await.unwrap();
        assert_eq!(stats.concepts, 0);
        assert_eq!(stats.relationships, 0);
    }
}
