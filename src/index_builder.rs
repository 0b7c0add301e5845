use tracing::{debug, info, warn};

use crate::{
    embedding::TextEmbedder,
    error::{IngestError, Result},
    graph_store::GraphStore,
    kg_index::{IndexKey, KgIndex},
    models::{BuildSummary, SourceNode, Table},
    schema_store::ColumnSource,
    table_resolver::{LineFormat, TableResolver},
    upsert::UpsertEngine,
};

/// Text a column is embedded from: the pair rendered as a quoted tuple,
/// e.g. `('Customer order table', '金额')`.
pub fn embedding_text(description: &str, display_name: &str) -> String {
    format!("({}, {})", quote_repr(description), quote_repr(display_name))
}

/// Single quotes unless the value holds a `'` and no `"`.
fn quote_repr(value: &str) -> String {
    let quote = if value.contains('\'') && !value.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(value.len() + 2);
    out.push(quote);
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_ascii_control() => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

pub struct IndexBuilder<'a, C, S> {
    resolver: TableResolver<C>,
    engine: UpsertEngine<S>,
    format: LineFormat,
    embedder: Option<&'a dyn TextEmbedder>,
}

impl<'a, C: ColumnSource, S: GraphStore> IndexBuilder<'a, C, S> {
    pub fn new(resolver: TableResolver<C>, engine: UpsertEngine<S>) -> Self {
        Self {
            resolver,
            engine,
            format: LineFormat::default(),
            embedder: None,
        }
    }

    pub fn with_format(mut self, format: LineFormat) -> Self {
        self.format = format;
        self
    }

    /// Enables one embedding per column, computed in a single call per node.
    pub fn with_embedder(mut self, embedder: Option<&'a dyn TextEmbedder>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn engine(&self) -> &UpsertEngine<S> {
        &self.engine
    }

    /// Resolves, upserts and indexes every node in order. Lines that fail to
    /// parse are skipped; any graph or embedding failure aborts the build and
    /// nothing built so far is returned.
    pub fn build<N, F>(&mut self, nodes: &[N], mut on_progress: F) -> Result<(KgIndex, BuildSummary)>
    where
        N: SourceNode,
        F: FnMut(usize, usize),
    {
        let total = nodes.len();
        let mut index = KgIndex::new();
        let mut summary = BuildSummary::default();

        for (done, node) in nodes.iter().enumerate() {
            summary.nodes_seen += 1;

            let table = match self.resolver.resolve(node.get_content(), &self.format) {
                Ok(Some(table)) => table,
                Ok(None) => {
                    debug!(node = node.node_id(), "Node carries no table; skipping");
                    summary.nodes_skipped += 1;
                    on_progress(done + 1, total);
                    continue;
                }
                Err(err) if err.is_parse_error() => {
                    warn!(node = node.node_id(), code = err.code(), "Skipping node: {err}");
                    summary.nodes_skipped += 1;
                    on_progress(done + 1, total);
                    continue;
                }
                Err(err) => return Err(err),
            };

            self.engine.upsert(&table)?;
            summary.tables_upserted += 1;

            for column in &table.columns {
                index.add_node(
                    IndexKey::new(&table.name, &column.name),
                    node.node_id(),
                    node.get_content(),
                );
                summary.keys_registered += 1;
            }

            if let Some(embedder) = self.embedder {
                summary.embeddings_stored += embed_columns(embedder, &table, &mut index)?;
            }

            on_progress(done + 1, total);
        }

        info!(
            nodes = summary.nodes_seen,
            skipped = summary.nodes_skipped,
            tables = summary.tables_upserted,
            keys = summary.keys_registered,
            "Index build finished"
        );
        Ok((index, summary))
    }
}

fn embed_columns(embedder: &dyn TextEmbedder, table: &Table, index: &mut KgIndex) -> Result<usize> {
    if table.columns.is_empty() {
        return Ok(0);
    }

    let texts: Vec<String> = table
        .columns
        .iter()
        .map(|column| embedding_text(&table.description, &column.name_cn))
        .collect();
    let vectors = embedder
        .embed_batch(&texts)
        .map_err(|err| IngestError::Embedding(format!("{}: {err:#}", table.name)))?;
    if vectors.len() != texts.len() {
        return Err(IngestError::Embedding(format!(
            "{}: expected {} vectors, got {}",
            table.name,
            texts.len(),
            vectors.len()
        )));
    }

    let stored = vectors.len();
    for ((column, text), vector) in table.columns.iter().zip(texts).zip(vectors) {
        index.add_embedding(IndexKey::new(&table.name, &column.name), text, vector);
    }
    Ok(stored)
}
