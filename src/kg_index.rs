use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

pub const KG_INDEX_SCHEMA_VERSION: &str = "tablegraph.kg.index.v1";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexKey {
    pub table: String,
    pub column: String,
}

impl IndexKey {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyEmbedding {
    pub text: String,
    pub vector: Vec<f32>,
}

/// Lookup structure from `(table, column)` to the text nodes that produced
/// it. Node associations only ever accumulate.
#[derive(Debug, Clone, PartialEq)]
pub struct KgIndex {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    keys: BTreeMap<IndexKey, BTreeSet<String>>,
    nodes: BTreeMap<String, String>,
    embeddings: BTreeMap<IndexKey, KeyEmbedding>,
}

impl Default for KgIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl KgIndex {
    pub fn new() -> Self {
        Self {
            schema_version: KG_INDEX_SCHEMA_VERSION.to_string(),
            generated_at: Utc::now(),
            keys: BTreeMap::new(),
            nodes: BTreeMap::new(),
            embeddings: BTreeMap::new(),
        }
    }

    pub fn add_node(&mut self, key: IndexKey, node_id: &str, text: &str) {
        self.keys.entry(key).or_default().insert(node_id.to_string());
        self.nodes
            .entry(node_id.to_string())
            .or_insert_with(|| text.to_string());
    }

    /// Latest embedding for a key replaces the previous one.
    pub fn add_embedding(&mut self, key: IndexKey, text: String, vector: Vec<f32>) {
        self.embeddings.insert(key, KeyEmbedding { text, vector });
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &IndexKey> {
        self.keys.keys()
    }

    pub fn nodes_for(&self, key: &IndexKey) -> Vec<&str> {
        self.keys
            .get(key)
            .map(|ids| ids.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn keys_for_table(&self, table: &str) -> Vec<&IndexKey> {
        self.keys.keys().filter(|key| key.table == table).collect()
    }

    pub fn keys_for_node(&self, node_id: &str) -> Vec<&IndexKey> {
        self.keys
            .iter()
            .filter(|(_, ids)| ids.contains(node_id))
            .map(|(key, _)| key)
            .collect()
    }

    pub fn node_text(&self, node_id: &str) -> Option<&str> {
        self.nodes.get(node_id).map(String::as_str)
    }

    pub fn embedding(&self, key: &IndexKey) -> Option<&KeyEmbedding> {
        self.embeddings.get(key)
    }

    pub fn embedding_count(&self) -> usize {
        self.embeddings.len()
    }

    pub fn merge(&mut self, other: KgIndex) {
        for (key, ids) in other.keys {
            self.keys.entry(key).or_default().extend(ids);
        }
        for (id, text) in other.nodes {
            self.nodes.entry(id).or_insert(text);
        }
        self.embeddings.extend(other.embeddings);
        self.generated_at = other.generated_at.max(self.generated_at);
    }

    pub fn persist_to_sidecar(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed creating index directory {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed opening {}", path.display()))?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS keys_by_node (
                table_name TEXT NOT NULL,
                column_name TEXT NOT NULL,
                node_id TEXT NOT NULL,
                PRIMARY KEY (table_name, column_name, node_id)
            );
            CREATE TABLE IF NOT EXISTS nodes_by_id (
                node_id TEXT PRIMARY KEY,
                text TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS key_embeddings (
                table_name TEXT NOT NULL,
                column_name TEXT NOT NULL,
                text TEXT NOT NULL,
                vector_json TEXT NOT NULL,
                PRIMARY KEY (table_name, column_name)
            );
            CREATE INDEX IF NOT EXISTS idx_keys_node ON keys_by_node(node_id);
            ",
        )?;

        // the previous snapshot survives until commit
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(
            "
            DELETE FROM meta;
            DELETE FROM keys_by_node;
            DELETE FROM nodes_by_id;
            DELETE FROM key_embeddings;
            ",
        )?;

        tx.execute(
            "INSERT INTO meta(key,value) VALUES(?1,?2)",
            params!["index_schema_version", self.schema_version],
        )?;
        tx.execute(
            "INSERT INTO meta(key,value) VALUES(?1,?2)",
            params!["generated_at", self.generated_at.to_rfc3339()],
        )?;

        for (key, ids) in &self.keys {
            for id in ids {
                tx.execute(
                    "INSERT INTO keys_by_node(table_name,column_name,node_id) VALUES(?1,?2,?3)",
                    params![key.table, key.column, id],
                )?;
            }
        }

        for (id, text) in &self.nodes {
            tx.execute(
                "INSERT INTO nodes_by_id(node_id,text) VALUES(?1,?2)",
                params![id, text],
            )?;
        }

        for (key, embedding) in &self.embeddings {
            tx.execute(
                "INSERT INTO key_embeddings(table_name,column_name,text,vector_json) VALUES(?1,?2,?3,?4)",
                params![
                    key.table,
                    key.column,
                    embedding.text,
                    serde_json::to_string(&embedding.vector)?
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn load_from_sidecar(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed opening index sidecar {}", path.display()))?;

        let schema_version: String = conn
            .query_row(
                "SELECT value FROM meta WHERE key='index_schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap_or_else(|_| KG_INDEX_SCHEMA_VERSION.to_string());

        let generated_at: DateTime<Utc> = conn
            .query_row(
                "SELECT value FROM meta WHERE key='generated_at'",
                [],
                |row| {
                    let s: String = row.get(0)?;
                    Ok(DateTime::parse_from_rfc3339(&s)
                        .map(|v| v.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()))
                },
            )
            .unwrap_or_else(|_| Utc::now());

        let mut index = Self {
            schema_version,
            generated_at,
            ..Self::new()
        };

        {
            let mut stmt =
                conn.prepare("SELECT table_name,column_name,node_id FROM keys_by_node")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    IndexKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                    row.get::<_, String>(2)?,
                ))
            })?;
            for row in rows {
                let (key, id) = row?;
                index.keys.entry(key).or_default().insert(id);
            }
        }

        {
            let mut stmt = conn.prepare("SELECT node_id,text FROM nodes_by_id")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (id, text) = row?;
                index.nodes.insert(id, text);
            }
        }

        {
            let mut stmt = conn
                .prepare("SELECT table_name,column_name,text,vector_json FROM key_embeddings")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    IndexKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;
            for row in rows {
                let (key, text, vector_json) = row?;
                let vector: Vec<f32> = serde_json::from_str(&vector_json).with_context(|| {
                    format!("Corrupt embedding for {}::{}", key.table, key.column)
                })?;
                index.embeddings.insert(key, KeyEmbedding { text, vector });
            }
        }

        Ok(index)
    }
}
