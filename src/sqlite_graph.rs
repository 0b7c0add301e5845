//! Property-graph store on SQLite.
//!
//! Accepts the insertion statements of [`crate::statement`] and applies them
//! with upsert semantics: a vertex is keyed by `(tag, vid)` and an edge by
//! `(edge_type, src, dst, rank)`, so re-inserting overwrites in place. Each
//! statement runs inside one transaction.

use std::{fs, path::PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::{
    error::{IngestError, Result},
    field_mapping::GraphSchema,
    graph_store::{ExecutionResult, GraphStore},
    statement::{parse_statement, Statement},
};

const INIT_SQL: &str = "\
CREATE TABLE IF NOT EXISTS vertices (
  tag TEXT NOT NULL,
  vid TEXT NOT NULL,
  props TEXT NOT NULL,
  PRIMARY KEY (tag, vid)
);
CREATE TABLE IF NOT EXISTS edges (
  edge_type TEXT NOT NULL,
  src TEXT NOT NULL,
  dst TEXT NOT NULL,
  rank INTEGER NOT NULL DEFAULT 0,
  props TEXT NOT NULL,
  PRIMARY KEY (edge_type, src, dst, rank)
);";

const UPSERT_VERTEX_SQL: &str = "\
INSERT INTO vertices (tag, vid, props) VALUES (?1, ?2, ?3)
ON CONFLICT(tag, vid) DO UPDATE SET props = excluded.props";

const UPSERT_EDGE_SQL: &str = "\
INSERT INTO edges (edge_type, src, dst, rank, props) VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT(edge_type, src, dst, rank) DO UPDATE SET props = excluded.props";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// Lives as long as the session; releasing the handle discards it.
    Memory,
    File(PathBuf),
}

pub struct SqliteGraphStore {
    location: StoreLocation,
    schema: GraphSchema,
    conn: Option<Connection>,
}

impl std::fmt::Debug for SqliteGraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteGraphStore")
            .field("location", &self.location)
            .field("acquired", &self.conn.is_some())
            .finish_non_exhaustive()
    }
}

impl SqliteGraphStore {
    /// Opens the store and acquires a session.
    pub fn open(location: StoreLocation, schema: GraphSchema) -> Result<Self> {
        let mut store = Self {
            location,
            schema,
            conn: None,
        };
        store.acquire()?;
        Ok(store)
    }

    pub fn open_in_memory(schema: GraphSchema) -> Result<Self> {
        Self::open(StoreLocation::Memory, schema)
    }

    pub fn is_acquired(&self) -> bool {
        self.conn.is_some()
    }

    /// Connects if no session is held. Safe to call again after `release`.
    pub fn acquire(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }

        let conn = match &self.location {
            StoreLocation::Memory => Connection::open_in_memory()?,
            StoreLocation::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)?;
                }
                Connection::open(path)?
            }
        };
        conn.execute_batch(INIT_SQL)?;
        self.conn = Some(conn);
        info!(location = ?self.location, "Graph store session acquired");
        Ok(())
    }

    pub fn release(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if let Err((_, err)) = conn.close() {
            warn!("Graph store session did not close cleanly: {err}");
        }
        debug!(location = ?self.location, "Graph store session released");
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| IngestError::Store("graph store session is not acquired".to_string()))
    }

    pub fn vertex_count(&self, tag: &str) -> Result<usize> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM vertices WHERE tag = ?1",
            params![tag],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn edge_count(&self, edge_type: &str) -> Result<usize> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM edges WHERE edge_type = ?1",
            params![edge_type],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn vertex_props(&self, tag: &str, vid: &str) -> Result<Option<Map<String, Value>>> {
        let raw: Option<String> = self
            .conn()?
            .query_row(
                "SELECT props FROM vertices WHERE tag = ?1 AND vid = ?2",
                params![tag, vid],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|text| {
            serde_json::from_str::<Map<String, Value>>(&text)
                .map_err(|err| IngestError::Store(format!("corrupt properties for {vid}: {err}")))
        })
        .transpose()
    }

    pub fn edge_targets(&self, edge_type: &str, src: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT dst FROM edges WHERE edge_type = ?1 AND src = ?2 ORDER BY dst, rank",
        )?;
        let rows = stmt.query_map(params![edge_type, src], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Schema checks the store performs before touching any row.
    fn check(&self, statement: &Statement) -> Option<String> {
        let (kind, name, props, arities) = match statement {
            Statement::InsertVertex { tag, props, rows } => (
                "tag",
                tag,
                props,
                rows.iter().map(|r| r.values.len()).collect::<Vec<_>>(),
            ),
            Statement::InsertEdge {
                edge_type,
                props,
                rows,
            } => (
                "edge type",
                edge_type,
                props,
                rows.iter().map(|r| r.values.len()).collect::<Vec<_>>(),
            ),
        };

        let decl = match statement {
            Statement::InsertVertex { .. } => self.schema.tag(name),
            Statement::InsertEdge { .. } => self.schema.edge_type(name),
        };
        let Some(decl) = decl else {
            return Some(format!("{kind} `{name}` not found"));
        };

        if let Some(unknown) = props.iter().find(|p| !decl.fields.contains(*p)) {
            return Some(format!("unknown property `{unknown}` for {kind} `{name}`"));
        }

        if let Some(found) = arities.into_iter().find(|n| *n != props.len()) {
            return Some(format!(
                "wrong number of values: expected {}, found {found}",
                props.len()
            ));
        }

        None
    }

    fn apply(&mut self, statement: &Statement) -> Result<()> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| IngestError::Store("graph store session is not acquired".to_string()))?;
        let tx = conn.transaction()?;

        match statement {
            Statement::InsertVertex { tag, props, rows } => {
                for row in rows {
                    let json = Value::Object(zip_props(props, &row.values)).to_string();
                    tx.execute(UPSERT_VERTEX_SQL, params![tag, row.vid, json])?;
                }
            }
            Statement::InsertEdge {
                edge_type,
                props,
                rows,
            } => {
                for row in rows {
                    let json = Value::Object(zip_props(props, &row.values)).to_string();
                    tx.execute(
                        UPSERT_EDGE_SQL,
                        params![edge_type, row.src, row.dst, row.rank, json],
                    )?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }
}

fn zip_props(props: &[String], values: &[String]) -> Map<String, Value> {
    props
        .iter()
        .zip(values)
        .map(|(prop, value)| (prop.clone(), Value::String(value.clone())))
        .collect()
}

impl GraphStore for SqliteGraphStore {
    fn execute(&mut self, statement: &str) -> Result<ExecutionResult> {
        self.conn()?;

        let parsed = match parse_statement(statement) {
            Ok(parsed) => parsed,
            Err(err) => return Ok(ExecutionResult::failure(format!("SyntaxError: {err}"))),
        };

        if let Some(err) = self.check(&parsed) {
            return Ok(ExecutionResult::failure(err));
        }

        self.apply(&parsed)?;
        debug!(rows = parsed.row_count(), "Statement applied");
        Ok(ExecutionResult::success())
    }

    fn schema(&self) -> &GraphSchema {
        &self.schema
    }
}
