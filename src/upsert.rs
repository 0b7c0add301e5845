use tracing::{debug, info, warn};

use crate::{
    error::{IngestError, Result},
    field_mapping::{check_arity, COLUMN_TAG_ARITY, CONTAINMENT_EDGE_ARITY, TABLE_TAG_ARITY},
    graph_store::GraphStore,
    models::Table,
    statement::{column_vertex_id, table_vertex_id, EdgeRow, Statement, VertexRow},
};

pub const DEFAULT_RELATION_LABEL: &str = "contains";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOptions {
    /// Value written into the containment edge's single property.
    pub relation_label: String,
    /// Caps rows per column/edge statement. `None` sends each batch as one
    /// statement, which keeps the batch all-or-nothing.
    pub max_batch_items: Option<usize>,
}

impl Default for UpsertOptions {
    fn default() -> Self {
        Self {
            relation_label: DEFAULT_RELATION_LABEL.to_string(),
            max_batch_items: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub table_vid: String,
    pub column_ids: Vec<String>,
    pub edges: usize,
    pub statements: usize,
}

/// Writes a `Table` into the graph as one table vertex, one vertex per column
/// and one containment edge per column, always in that order. Every vertex is
/// keyed by a deterministic id, so repeating an upsert leaves the graph as it
/// was.
pub struct UpsertEngine<S> {
    store: S,
    options: UpsertOptions,
    statements: usize,
}

impl<S: GraphStore> UpsertEngine<S> {
    pub fn new(store: S) -> Self {
        Self::with_options(store, UpsertOptions::default())
    }

    pub fn with_options(store: S, options: UpsertOptions) -> Self {
        Self {
            store,
            options,
            statements: 0,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn upsert(&mut self, table: &Table) -> Result<UpsertReport> {
        self.statements = 0;

        let table_vid = self.upsert_table_vertex(table)?;
        let column_ids = self.upsert_column_vertices(table)?;
        let edges = self.upsert_containment_edges(&table.name, &column_ids)?;

        info!(
            table = %table.name,
            columns = column_ids.len(),
            edges,
            statements = self.statements,
            "Table upserted into graph"
        );

        Ok(UpsertReport {
            table_vid,
            column_ids,
            edges,
            statements: self.statements,
        })
    }

    pub fn upsert_table_vertex(&mut self, table: &Table) -> Result<String> {
        let tag = self.store.schema().table_tag().clone();
        check_arity(&tag, TABLE_TAG_ARITY)?;

        let vid = table_vertex_id(&table.name);
        let statement = Statement::InsertVertex {
            tag: tag.name,
            props: tag.fields,
            rows: vec![VertexRow {
                vid: vid.clone(),
                values: vec![table.name.clone(), table.description.clone()],
            }],
        };
        self.run("table vertex", &statement)?;
        Ok(vid)
    }

    /// Returns the column vertex ids in column order; empty when the table
    /// declares no columns.
    pub fn upsert_column_vertices(&mut self, table: &Table) -> Result<Vec<String>> {
        if table.columns.is_empty() {
            warn!(table = %table.name, "No columns to upsert for table");
            return Ok(Vec::new());
        }

        let tag = self.store.schema().column_tag().clone();
        check_arity(&tag, COLUMN_TAG_ARITY)?;

        let rows: Vec<VertexRow> = table
            .columns
            .iter()
            .map(|column| VertexRow {
                vid: column_vertex_id(&table.name, &column.name),
                values: vec![
                    column.name_cn.clone(),
                    column.name.clone(),
                    column.comment.as_deref().unwrap_or_default().trim().to_string(),
                ],
            })
            .collect();
        let column_ids = rows.iter().map(|row| row.vid.clone()).collect();

        for chunk in rows.chunks(self.chunk_size(rows.len())) {
            let statement = Statement::InsertVertex {
                tag: tag.name.clone(),
                props: tag.fields.clone(),
                rows: chunk.to_vec(),
            };
            self.run("column vertices", &statement)?;
        }
        Ok(column_ids)
    }

    /// Connects the table vertex to each column vertex. Returns the number of
    /// edges written; nothing is written when there is nothing to connect or
    /// the edge type does not declare exactly one property.
    pub fn upsert_containment_edges(
        &mut self,
        table_name: &str,
        column_ids: &[String],
    ) -> Result<usize> {
        if table_name.trim().is_empty() || column_ids.is_empty() {
            warn!(table = %table_name, "No containment edges to upsert");
            return Ok(0);
        }

        let edge = self.store.schema().containment_edge().clone();
        if edge.fields.len() != CONTAINMENT_EDGE_ARITY {
            warn!(
                edge_type = %edge.name,
                expected = CONTAINMENT_EDGE_ARITY,
                found = edge.fields.len(),
                table = %table_name,
                "Containment edge type has unexpected properties; skipping edges"
            );
            return Ok(0);
        }

        let src = table_vertex_id(table_name);
        let rows: Vec<EdgeRow> = column_ids
            .iter()
            .map(|dst| EdgeRow {
                src: src.clone(),
                dst: dst.clone(),
                rank: 0,
                values: vec![self.options.relation_label.clone()],
            })
            .collect();

        for chunk in rows.chunks(self.chunk_size(rows.len())) {
            let statement = Statement::InsertEdge {
                edge_type: edge.name.clone(),
                props: edge.fields.clone(),
                rows: chunk.to_vec(),
            };
            self.run("containment edges", &statement)?;
        }
        Ok(rows.len())
    }

    fn chunk_size(&self, total: usize) -> usize {
        self.options
            .max_batch_items
            .filter(|max| *max > 0)
            .unwrap_or(total)
            .max(1)
    }

    fn run(&mut self, step: &'static str, statement: &Statement) -> Result<()> {
        let dml = statement.render();
        debug!(step, rows = statement.row_count(), dml = %dml, "Executing graph mutation");

        self.statements += 1;
        let result = self.store.execute(&dml)?;
        if !result.succeeded {
            return Err(IngestError::StoreMutation {
                step,
                message: result.error_msg,
            });
        }
        Ok(())
    }
}
