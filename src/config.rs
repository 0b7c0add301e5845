use std::{env, fs, net::SocketAddr, path::PathBuf};

use anyhow::{bail, Context, Result};
use tracing::warn;
use uuid::Uuid;

use crate::{
    embedding::EmbeddingRuntimeConfig,
    field_mapping::GraphSchema,
    upsert::{UpsertOptions, DEFAULT_RELATION_LABEL},
};

pub const DEFAULT_VERTEX_TAGS: &str = "table.(name,description);column.(name_cn,name,comment)";
pub const DEFAULT_EDGE_TYPES: &str = "contains.(relation)";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub api_key: String,
    pub api_key_is_fallback: bool,
    pub schema_dir: PathBuf,
    pub schema_delimiter: u8,
    pub graph_db: PathBuf,
    pub index_path: PathBuf,
    pub graph_schema: GraphSchema,
    pub upsert: UpsertOptions,
    pub embedding: Option<EmbeddingRuntimeConfig>,
    pub queue_capacity: usize,
    /// How long finished jobs stay queryable.
    pub job_retention_seconds: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bind_raw = lookup("TABLEGRAPH_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let bind_normalized = bind_raw
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .to_string();
        let bind_addr = bind_normalized
            .parse::<SocketAddr>()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let (api_key, api_key_is_fallback) = resolve_api_key(&lookup);

        let schema_dir = PathBuf::from(
            lookup("TABLEGRAPH_SCHEMA_DIR").unwrap_or_else(|| "./table_schema".to_string()),
        );
        let schema_delimiter = parse_delimiter(lookup("TABLEGRAPH_SCHEMA_DELIMITER").as_deref())?;

        let graph_db = PathBuf::from(
            lookup("TABLEGRAPH_GRAPH_DB").unwrap_or_else(|| "./data/graph.sqlite".to_string()),
        );
        let index_path = PathBuf::from(
            lookup("TABLEGRAPH_INDEX_PATH").unwrap_or_else(|| "./data/kg_index.sqlite".to_string()),
        );

        let vertex_tags =
            lookup("TABLEGRAPH_VERTEX_TAGS").unwrap_or_else(|| DEFAULT_VERTEX_TAGS.to_string());
        let edge_types =
            lookup("TABLEGRAPH_EDGE_TYPES").unwrap_or_else(|| DEFAULT_EDGE_TYPES.to_string());
        let graph_schema = GraphSchema::parse(&vertex_tags, &edge_types)
            .context("Invalid TABLEGRAPH_VERTEX_TAGS / TABLEGRAPH_EDGE_TYPES")?;

        let relation_label = lookup("TABLEGRAPH_RELATION_LABEL")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_RELATION_LABEL.to_string());
        let max_batch_items = lookup("TABLEGRAPH_MAX_BATCH_ITEMS")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|v| *v > 0);

        let embedding = if parse_flag(lookup("TABLEGRAPH_INCLUDE_EMBEDDINGS").as_deref()) {
            let timeout = lookup("TABLEGRAPH_EMBED_TIMEOUT_SECONDS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(60);
            Some(EmbeddingRuntimeConfig::new(
                &lookup("TABLEGRAPH_EMBED_PROVIDER").unwrap_or_else(|| "tei".to_string()),
                &lookup("TABLEGRAPH_EMBED_MODEL").unwrap_or_else(|| "bge-large-zh".to_string()),
                &lookup("TABLEGRAPH_EMBED_BASE_URL")
                    .unwrap_or_else(|| "http://127.0.0.1:8081".to_string()),
                lookup("TABLEGRAPH_EMBED_API_KEY"),
                lookup("TABLEGRAPH_EMBED_TEXT_INSTRUCTION"),
                timeout,
            )?)
        } else {
            None
        };

        let queue_capacity = lookup("TABLEGRAPH_QUEUE_CAPACITY")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(64);

        let job_retention_seconds = lookup("TABLEGRAPH_JOB_RETENTION_SECONDS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(24 * 60 * 60);

        Ok(Self {
            bind_addr,
            api_key,
            api_key_is_fallback,
            schema_dir,
            schema_delimiter,
            graph_db,
            index_path,
            graph_schema,
            upsert: UpsertOptions {
                relation_label,
                max_batch_items,
            },
            embedding,
            queue_capacity,
            job_retention_seconds,
        })
    }
}

fn parse_flag(value: Option<&str>) -> bool {
    value
        .map(|v| {
            matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}

fn parse_delimiter(value: Option<&str>) -> Result<u8> {
    let Some(raw) = value.filter(|v| !v.is_empty()) else {
        return Ok(b',');
    };
    let raw = if raw == "\\t" { "\t" } else { raw };
    match raw.as_bytes() {
        [byte] => Ok(*byte),
        _ => bail!("TABLEGRAPH_SCHEMA_DELIMITER must be a single byte, got `{raw}`"),
    }
}

fn resolve_api_key(lookup: &impl Fn(&str) -> Option<String>) -> (String, bool) {
    if let Some(value) = lookup("TABLEGRAPH_API_KEY") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return (trimmed.to_string(), false);
        }
    }

    if let Some(key_file) = lookup("TABLEGRAPH_API_KEY_FILE") {
        match fs::read_to_string(&key_file) {
            Ok(raw) => {
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    return (trimmed.to_string(), false);
                }
                warn!("TABLEGRAPH_API_KEY_FILE is empty: {key_file}. Falling back to generated key.");
            }
            Err(err) => {
                warn!(
                    "Failed reading TABLEGRAPH_API_KEY_FILE at {key_file}: {err}. Falling back to generated key."
                );
            }
        }
    } else {
        warn!("TABLEGRAPH_API_KEY not set. Falling back to generated key.");
    }

    let generated = format!("fallback-{}", Uuid::new_v4());
    (generated, true)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{parse_delimiter, Config};

    fn config_from(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = config_from(&[]).expect("config");
        assert_eq!(config.bind_addr.port(), 8080);
        assert!(config.api_key_is_fallback);
        assert!(config.api_key.starts_with("fallback-"));
        assert_eq!(config.schema_delimiter, b',');
        assert_eq!(config.graph_schema.table_tag().name, "table");
        assert_eq!(config.upsert.relation_label, "contains");
        assert_eq!(config.upsert.max_batch_items, None);
        assert!(config.embedding.is_none());
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.job_retention_seconds, 86_400);
    }

    #[test]
    fn overrides_are_honoured() {
        let config = config_from(&[
            ("TABLEGRAPH_BIND_ADDR", "\"127.0.0.1:9000\""),
            ("TABLEGRAPH_API_KEY", " secret "),
            ("TABLEGRAPH_MAX_BATCH_ITEMS", "500"),
            ("TABLEGRAPH_RELATION_LABEL", "包含"),
            ("TABLEGRAPH_INCLUDE_EMBEDDINGS", "yes"),
            ("TABLEGRAPH_EMBED_BASE_URL", "http://embed:80/"),
            ("TABLEGRAPH_JOB_RETENTION_SECONDS", "600"),
        ])
        .expect("config");
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:9000");
        assert_eq!(config.api_key, "secret");
        assert!(!config.api_key_is_fallback);
        assert_eq!(config.upsert.max_batch_items, Some(500));
        assert_eq!(config.upsert.relation_label, "包含");
        assert_eq!(config.job_retention_seconds, 600);
        let embedding = config.embedding.expect("embedding");
        assert_eq!(embedding.endpoint(), "http://embed:80/embed");
    }

    #[test]
    fn invalid_graph_declarations_fail_startup() {
        assert!(config_from(&[("TABLEGRAPH_VERTEX_TAGS", "table.(name,description)")]).is_err());
        assert!(config_from(&[
            ("TABLEGRAPH_INCLUDE_EMBEDDINGS", "1"),
            ("TABLEGRAPH_EMBED_PROVIDER", "openai"),
        ])
        .is_err());
    }

    #[test]
    fn delimiter_must_be_one_byte() {
        assert_eq!(parse_delimiter(None).expect("default"), b',');
        assert_eq!(parse_delimiter(Some("\\t")).expect("tab"), b'\t');
        assert_eq!(parse_delimiter(Some("|")).expect("pipe"), b'|');
        assert!(parse_delimiter(Some(";;")).is_err());
    }
}
