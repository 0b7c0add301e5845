use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{info, warn};

use crate::{
    config::Config,
    embedding::{EmbeddingRuntimeConfig, TextEmbedder},
    error::{IngestError, Result},
    index_builder::IndexBuilder,
    kg_index::{IndexKey, KgIndex},
    models::{BuildSummary, IngestRequest, KeyMatch, TextNode},
    schema_store::CsvSchemaStore,
    sqlite_graph::{SqliteGraphStore, StoreLocation},
    table_resolver::{LineFormat, TableResolver},
    upsert::{UpsertEngine, UpsertOptions},
};

const DEFAULT_SOURCE: &str = "request";

/// Owns everything one ingestion needs: the graph store session, the column
/// files, the optional embedder and the accumulated index.
pub struct IndexService {
    store: SqliteGraphStore,
    schema_store: CsvSchemaStore,
    embedder: Option<EmbeddingRuntimeConfig>,
    upsert: UpsertOptions,
    index: KgIndex,
    index_path: PathBuf,
}

impl IndexService {
    pub fn new(store: SqliteGraphStore, schema_store: CsvSchemaStore, index_path: PathBuf) -> Self {
        Self {
            store,
            schema_store,
            embedder: None,
            upsert: UpsertOptions::default(),
            index: KgIndex::new(),
            index_path,
        }
    }

    pub fn with_embedder(mut self, embedder: Option<EmbeddingRuntimeConfig>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn with_upsert_options(mut self, upsert: UpsertOptions) -> Self {
        self.upsert = upsert;
        self
    }

    pub fn with_index(mut self, index: KgIndex) -> Self {
        self.index = index;
        self
    }

    /// Validates the graph declarations, opens the store and reloads a
    /// previously persisted index.
    pub fn open(config: &Config) -> anyhow::Result<Self> {
        config
            .graph_schema
            .validate()
            .context("Graph declarations do not fit table/column vertices")?;

        let store = SqliteGraphStore::open(
            StoreLocation::File(config.graph_db.clone()),
            config.graph_schema.clone(),
        )
        .with_context(|| format!("Failed opening graph store {}", config.graph_db.display()))?;

        let index = if config.index_path.is_file() {
            let index = KgIndex::load_from_sidecar(&config.index_path)?;
            info!(
                keys = index.key_count(),
                path = %config.index_path.display(),
                "Loaded existing index"
            );
            index
        } else {
            KgIndex::new()
        };

        let schema_store =
            CsvSchemaStore::new(&config.schema_dir).with_delimiter(config.schema_delimiter);

        Ok(Self::new(store, schema_store, config.index_path.clone())
            .with_embedder(config.embedding.clone())
            .with_upsert_options(config.upsert.clone())
            .with_index(index))
    }

    pub fn index(&self) -> &KgIndex {
        &self.index
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn store(&self) -> &SqliteGraphStore {
        &self.store
    }

    /// Splits the request into line nodes, builds them into the graph and
    /// merges the resulting keys into the index. The index only changes when
    /// the whole build succeeded.
    pub fn ingest<F>(&mut self, request: &IngestRequest, on_progress: F) -> Result<BuildSummary>
    where
        F: FnMut(usize, usize),
    {
        let source = request
            .source
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SOURCE);
        let nodes = TextNode::split_lines(source, &request.text);
        let format = LineFormat::new(request.headers.clone(), request.delimiter.as_deref());

        self.store.acquire()?;

        let built = {
            let mut builder = IndexBuilder::new(
                TableResolver::new(&self.schema_store),
                UpsertEngine::with_options(&mut self.store, self.upsert.clone()),
            )
            .with_format(format)
            .with_embedder(self.embedder.as_ref().map(|e| e as &dyn TextEmbedder));
            builder.build(&nodes, on_progress)
        };

        let (built_index, summary) = match built {
            Ok(built) => built,
            Err(err) => {
                if matches!(
                    err,
                    IngestError::Store(_) | IngestError::Sqlite(_) | IngestError::Io(_)
                ) {
                    warn!("Releasing graph store session after backend failure: {err}");
                    self.store.release();
                }
                return Err(err);
            }
        };

        let mut merged = self.index.clone();
        merged.merge(built_index);
        merged
            .persist_to_sidecar(&self.index_path)
            .map_err(|err| IngestError::IndexPersist(format!("{err:#}")))?;
        self.index = merged;

        info!(
            source,
            tables = summary.tables_upserted,
            keys = self.index.key_count(),
            "Ingestion merged into index"
        );
        Ok(summary)
    }

    /// Keys matching the optional table and column filters.
    pub fn lookup(&self, table: Option<&str>, column: Option<&str>) -> Vec<KeyMatch> {
        let matches = |key: &IndexKey| {
            table.map_or(true, |t| key.table == t) && column.map_or(true, |c| key.column == c)
        };

        self.index
            .keys()
            .filter(|key| matches(key))
            .map(|key| KeyMatch {
                table: key.table.clone(),
                column: key.column.clone(),
                node_ids: self
                    .index
                    .nodes_for(key)
                    .into_iter()
                    .map(ToString::to_string)
                    .collect(),
                has_embedding: self.index.embedding(key).is_some(),
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{fs, path::Path};

    use super::IndexService;
    use crate::{
        error::IngestError,
        field_mapping::GraphSchema,
        kg_index::KgIndex,
        models::IngestRequest,
        schema_store::CsvSchemaStore,
        sqlite_graph::{SqliteGraphStore, StoreLocation},
    };

    fn graph_schema() -> GraphSchema {
        GraphSchema::parse(
            "table.(name,description);column.(name_cn,name,comment)",
            "contains.(relation)",
        )
        .expect("schema")
    }

    fn service_with_store(dir: &Path, store: SqliteGraphStore) -> IndexService {
        let columns = dir.join("table_schema").join("columns");
        fs::create_dir_all(&columns).expect("schema dir");
        fs::write(
            columns.join("orders.csv"),
            "column_name,column_name_cn\norder_id,订单号\namount,金额\n",
        )
        .expect("write schema");

        IndexService::new(
            store,
            CsvSchemaStore::new(dir.join("table_schema")),
            dir.join("data").join("kg_index.sqlite"),
        )
    }

    pub(crate) fn service_in(dir: &Path) -> IndexService {
        service_with_store(
            dir,
            SqliteGraphStore::open_in_memory(graph_schema()).expect("store"),
        )
    }

    fn request(text: &str) -> IngestRequest {
        IngestRequest {
            source: Some("tables.txt".into()),
            text: text.into(),
            headers: None,
            delimiter: None,
        }
    }

    #[test]
    fn ingest_upserts_graph_and_persists_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut service = service_in(dir.path());

        let summary = service
            .ingest(&request("orders,Customer order table\n# users,skip"), |_, _| {})
            .expect("ingest");
        assert_eq!(summary.tables_upserted, 1);
        assert_eq!(summary.nodes_skipped, 1);
        assert_eq!(service.store().vertex_count("column").expect("count"), 2);

        let persisted = KgIndex::load_from_sidecar(service.index_path()).expect("sidecar");
        assert_eq!(persisted.key_count(), 2);

        let hits = service.lookup(Some("orders"), Some("amount"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].node_ids, vec!["tables.txt#1"]);
        assert!(!hits[0].has_embedding);
    }

    #[test]
    fn later_ingestions_accumulate_node_references() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut service = service_in(dir.path());
        service
            .ingest(&request("orders,Orders"), |_, _| {})
            .expect("first");
        let mut second = request("\norders,Orders again");
        second.source = None;
        service.ingest(&second, |_, _| {}).expect("second");

        let hits = service.lookup(Some("orders"), Some("order_id"));
        assert_eq!(hits[0].node_ids, vec!["request#2", "tables.txt#1"]);
        assert_eq!(service.store().vertex_count("table").expect("count"), 1);
        assert_eq!(service.lookup(None, None).len(), 2);
        assert!(service.lookup(Some("users"), None).is_empty());
    }

    #[test]
    fn header_driven_requests_use_the_given_delimiter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut service = service_in(dir.path());
        let request = IngestRequest {
            source: None,
            text: "Order table|orders".into(),
            headers: Some(vec!["table_comment".into(), "table_name".into()]),
            delimiter: Some("|".into()),
        };
        let summary = service.ingest(&request, |_, _| {}).expect("ingest");
        assert_eq!(summary.tables_upserted, 1);
        let props = service
            .store()
            .vertex_props("table", "orders")
            .expect("props")
            .expect("vertex");
        assert_eq!(props["description"], "Order table");
    }

    #[test]
    fn failed_index_persist_leaves_the_index_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut service = service_in(dir.path());
        service.ingest(&request("orders,Orders"), |_, _| {}).expect("first");
        let before = service.index().clone();

        // a directory cannot be opened as the sidecar database
        service.index_path = dir.path().join("table_schema");
        let err = service
            .ingest(&request("orders,Orders again\norders,Third"), |_, _| {})
            .expect_err("persist fails");
        assert!(matches!(err, IngestError::IndexPersist(_)), "{err:?}");
        assert_eq!(err.code(), "INDEX_PERSIST_FAILED");
        assert_eq!(service.index(), &before);
        assert_eq!(
            service.lookup(Some("orders"), Some("amount"))[0].node_ids,
            vec!["tables.txt#1"]
        );
    }

    #[test]
    fn backend_failure_releases_the_store_and_the_next_ingest_recovers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let graph_db = dir.path().join("graph").join("graph.sqlite");
        let store = SqliteGraphStore::open(StoreLocation::File(graph_db.clone()), graph_schema())
            .expect("store");
        let mut service = service_with_store(dir.path(), store);

        let admin = rusqlite::Connection::open(&graph_db).expect("admin connection");
        admin
            .execute_batch(
                "CREATE TRIGGER reject_columns BEFORE INSERT ON vertices WHEN NEW.tag = 'column'
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )
            .expect("trigger");

        let err = service
            .ingest(&request("orders,Orders"), |_, _| {})
            .expect_err("backend fails");
        assert!(matches!(err, IngestError::Sqlite(_)), "{err:?}");
        assert!(!service.store().is_acquired());
        assert_eq!(service.index().key_count(), 0);

        admin
            .execute_batch("DROP TRIGGER reject_columns;")
            .expect("drop trigger");

        let summary = service
            .ingest(&request("orders,Orders"), |_, _| {})
            .expect("recovered");
        assert_eq!(summary.tables_upserted, 1);
        assert!(service.store().is_acquired());
        assert_eq!(service.store().vertex_count("column").expect("count"), 2);
        assert_eq!(service.index().key_count(), 2);
    }
}
