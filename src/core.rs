//! Process-wide composition root.
//!
//! All shared state — the connection pool, the graph facade, the job queue,
//! the vocabulary, and the active provider pair — lives in one [`Core`]
//! value passed explicitly to every component. There are no module-level
//! singletons; tests build a `Core` against a temp database and mock
//! providers.
//!
//! Providers sit behind a reader/writer lock so the active embedding or
//! extraction configuration can be hot-swapped atomically. A swap that
//! would change the embedding dimension is refused unless driven by the
//! rebuild job, which re-embeds the whole graph first.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::config::{Config, EmbeddingConfig, ExtractionConfig};
use crate::db;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::{KgError, KgResult};
use crate::extractor::{create_extractor, Extractor};
use crate::graph::GraphStore;
use crate::jobs::JobQueue;
use crate::migrate;
use crate::objects::ObjectStore;
use crate::vocabulary::VocabularyManager;

pub struct Core {
    pub config: Config,
    pub graph: GraphStore,
    pub jobs: JobQueue,
    pub objects: ObjectStore,
    pub vocabulary: VocabularyManager,
    embedder: RwLock<Arc<dyn EmbeddingProvider>>,
    extractor: RwLock<Arc<dyn Extractor>>,
    /// Application-level locks for the optional per-ontology matcher
    /// serialization mode.
    ontology_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Core {
    /// Connect, migrate, seed the vocabulary, and wire up providers.
    pub async fn init(config: Config) -> KgResult<Arc<Self>> {
        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool).await?;

        let embedder: Arc<dyn EmbeddingProvider> = create_provider(&config.embedding)?.into();
        let extractor: Arc<dyn Extractor> = create_extractor(&config.extraction)?.into();

        let graph = GraphStore::new(pool.clone(), embedder.dims());
        let jobs = JobQueue::new(pool.clone());
        let objects = ObjectStore::new(config.objects.root.clone());

        let vocabulary =
            VocabularyManager::load(pool.clone(), config.vocabulary.clone()).await?;
        vocabulary.seed(embedder.as_ref()).await?;

        Ok(Arc::new(Self {
            config,
            graph,
            jobs,
            objects,
            vocabulary,
            embedder: RwLock::new(embedder),
            extractor: RwLock::new(extractor),
            ontology_locks: Mutex::new(HashMap::new()),
        }))
    }

    /// The serialization lock for one ontology, created on first use. Taken
    /// by the concept matcher when `matching.serialize_per_ontology` is set
    /// to maximize reuse rate under parallel ingestion.
    pub async fn ontology_lock(&self, ontology: &str) -> Arc<Mutex<()>> {
        let mut locks = self.ontology_locks.lock().await;
        locks
            .entry(ontology.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// The active embedding provider.
    pub async fn embedder(&self) -> Arc<dyn EmbeddingProvider> {
        self.embedder.read().await.clone()
    }

    /// The active extraction provider.
    pub async fn extractor(&self) -> Arc<dyn Extractor> {
        self.extractor.read().await.clone()
    }

    /// Atomically swap the active embedding configuration.
    ///
    /// A swap to a different dimension is rejected: stored vectors would no
    /// longer match and every query would hit the consistency check. The
    /// rebuild job calls [`Core::swap_embedder_rebuilt`] instead after
    /// re-embedding the graph.
    pub async fn swap_embedder(&self, config: &EmbeddingConfig) -> KgResult<()> {
        let provider: Arc<dyn EmbeddingProvider> = create_provider(config)?.into();
        if provider.dims() != self.graph.dims() {
            return Err(KgError::Conflict(format!(
                "new embedding config has dimension {} but the graph holds {}; run an embedding rebuild job",
                provider.dims(),
                self.graph.dims()
            )));
        }
        *self.embedder.write().await = provider;
        Ok(())
    }

    /// Dimension-changing swap, only valid once the graph has been
    /// re-embedded by the rebuild job.
    pub async fn swap_embedder_rebuilt(&self, provider: Arc<dyn EmbeddingProvider>) {
        self.graph.set_dims(provider.dims());
        *self.embedder.write().await = provider;
    }

    /// Atomically swap the active extraction configuration.
    pub async fn swap_extractor(&self, config: &ExtractionConfig) -> KgResult<()> {
        let provider: Arc<dyn Extractor> = create_extractor(config)?.into();
        *self.extractor.write().await = provider;
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    //! Test harness: a `Core` over a temp database with mock providers.

    use super::*;

    pub async fn test_core() -> (tempfile::TempDir, Arc<Core>) {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            db: crate::config::DbConfig {
                path: tmp.path().join("kg.sqlite"),
            },
            objects: crate::config::ObjectsConfig {
                root: tmp.path().join("objects"),
            },
            chunking: Default::default(),
            matching: Default::default(),
            embedding: Default::default(),
            extraction: Default::default(),
            vocabulary: Default::default(),
            jobs: Default::default(),
            limits: Default::default(),
            server: Default::default(),
        };
        let core = Core::init(config).await.unwrap();
        (tmp, core)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_seeds_builtin_vocabulary() {
        let (_tmp, core) = testing::test_core().await;
        let status = core.vocabulary.status().await;
        assert_eq!(status.active, 30);
        assert_eq!(core.graph.dims(), 64);
    }

    #[tokio::test]
    async fn dimension_changing_swap_is_refused() {
        let (_tmp, core) = testing::test_core().await;
        let mut config = EmbeddingConfig::default();
        config.dims = Some(128);
        let err = core.swap_embedder(&config).await.unwrap_err();
        assert!(matches!(err, KgError::Conflict(_)));
    }

    #[tokio::test]
    async fn same_dimension_swap_succeeds() {
        let (_tmp, core) = testing::test_core().await;
        let mut config = EmbeddingConfig::default();
        config.dims = Some(64);
        core.swap_embedder(&config).await.unwrap();
    }
}
