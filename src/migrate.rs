//! Database schema migrations.
//!
//! Creates all required tables (documents, sources, concepts, instances,
//! relationships, vocabulary, jobs, provider configs) and ensures
//! idempotent execution. Designed to be run via `kg init`.

use sqlx::SqlitePool;

use crate::error::KgResult;

pub async fn run_migrations(pool: &SqlitePool) -> KgResult<()> {
    // Documents: one row per ingested content hash
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            filename TEXT NOT NULL,
            ontology TEXT NOT NULL,
            content_type TEXT NOT NULL DEFAULT 'text',
            mime TEXT NOT NULL DEFAULT 'text/plain',
            size_bytes INTEGER NOT NULL,
            object_key TEXT,
            ingested_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Sources: evidence chunks, immutable once stored
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            object_key TEXT,
            ontology TEXT NOT NULL,
            UNIQUE(document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Concepts: embedding stored as little-endian f32 blob
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS concepts (
            id TEXT PRIMARY KEY,
            label TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            search_terms_json TEXT NOT NULL DEFAULT '[]',
            embedding BLOB NOT NULL,
            dims INTEGER NOT NULL,
            ontology TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Instances: (concept, source) attestation with verbatim quote
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS instances (
            concept_id TEXT NOT NULL,
            source_id TEXT NOT NULL,
            quote TEXT NOT NULL,
            PRIMARY KEY (concept_id, source_id),
            FOREIGN KEY (concept_id) REFERENCES concepts(id),
            FOREIGN KEY (source_id) REFERENCES sources(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Relationships: directed typed edges with evidence source lists
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS relationships (
            id TEXT PRIMARY KEY,
            from_id TEXT NOT NULL,
            to_id TEXT NOT NULL,
            type_name TEXT NOT NULL,
            confidence REAL NOT NULL DEFAULT 1.0,
            evidence_json TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            UNIQUE(from_id, to_id, type_name),
            FOREIGN KEY (from_id) REFERENCES concepts(id),
            FOREIGN KEY (to_id) REFERENCES concepts(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Vocabulary types
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vocabulary_types (
            name TEXT PRIMARY KEY,
            active INTEGER NOT NULL DEFAULT 1,
            builtin INTEGER NOT NULL DEFAULT 0,
            category TEXT NOT NULL DEFAULT '',
            ambiguous INTEGER NOT NULL DEFAULT 0,
            embedding BLOB,
            usage_count INTEGER NOT NULL DEFAULT 0,
            merged_into TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Vocabulary history trail: one row per action
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vocabulary_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            type_name TEXT NOT NULL,
            action TEXT NOT NULL,
            detail TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Jobs: the persisted queue
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            job_type TEXT NOT NULL,
            status TEXT NOT NULL,
            principal TEXT NOT NULL,
            ontology TEXT NOT NULL,
            params_json TEXT NOT NULL DEFAULT '{}',
            cost_estimate_json TEXT,
            progress_json TEXT NOT NULL DEFAULT '{}',
            errors_json TEXT NOT NULL DEFAULT '[]',
            result_json TEXT,
            protected INTEGER NOT NULL DEFAULT 0,
            cancel_requested INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            approved_at INTEGER,
            started_at INTEGER,
            finished_at INTEGER,
            expires_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Provider configuration rows; exactly one active per kind
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS provider_configs (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            provider TEXT NOT NULL,
            model TEXT,
            dims INTEGER,
            base_url TEXT,
            active INTEGER NOT NULL DEFAULT 0,
            delete_protected INTEGER NOT NULL DEFAULT 0,
            change_protected INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            UNIQUE(kind, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_concepts_ontology ON concepts(ontology)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sources_document_id ON sources(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sources_ontology ON sources(ontology)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_instances_source ON instances(source_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_rel_from ON relationships(from_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_rel_to ON relationships(to_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_rel_type ON relationships(type_name)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_ontology ON documents(ontology)")
        .execute(pool)
        .await?;

    Ok(())
}
