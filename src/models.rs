use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub name_cn: String,
    pub comment: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, name_cn: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            name_cn: name_cn.into(),
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// A resolved table definition. Columns keep the order of the schema file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub description: String,
    pub columns: Vec<Column>,
}

/// Anything the index builder can pull text out of.
pub trait SourceNode {
    fn node_id(&self) -> &str;
    fn get_content(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextNode {
    pub id: String,
    pub text: String,
}

impl TextNode {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }

    /// One node per line. Both real newlines and the escaped two-character
    /// sequence `\n` break lines; ids are `<source>#<line>` starting at 1.
    pub fn split_lines(source: &str, text: &str) -> Vec<TextNode> {
        text.split('\n')
            .flat_map(|line| line.split("\\n"))
            .enumerate()
            .map(|(idx, line)| {
                TextNode::new(
                    format!("{source}#{}", idx + 1),
                    line.trim_end_matches('\r'),
                )
            })
            .collect()
    }
}

impl SourceNode for TextNode {
    fn node_id(&self) -> &str {
        &self.id
    }

    fn get_content(&self) -> &str {
        &self.text
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSummary {
    pub nodes_seen: usize,
    pub nodes_skipped: usize,
    pub tables_upserted: usize,
    pub keys_registered: usize,
    pub embeddings_stored: usize,
}

/// One `(table, column)` entry of the index as returned by key lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMatch {
    pub table: String,
    pub column: String,
    pub node_ids: Vec<String>,
    pub has_embedding: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    pub source: Option<String>,
    pub text: String,
    pub headers: Option<Vec<String>>,
    pub delimiter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestJobResponse {
    pub job_id: String,
    pub status: JobState,
    pub progress: f64,
    pub elapsed_ms: u64,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub summary: Option<BuildSummary>,
    pub error: Option<IngestErrorPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestAcceptedResponse {
    pub job_id: String,
    pub status: JobState,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: JobState,
    pub progress: f64,
    pub message: Option<String>,
    pub request: Option<IngestRequest>,
    pub summary: Option<BuildSummary>,
    pub error: Option<IngestErrorPayload>,
}

impl JobRecord {
    pub fn queued(job_id: String, request: IngestRequest) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            created_at: now,
            updated_at: now,
            status: JobState::Queued,
            progress: 0.0,
            message: Some("Queued for ingestion".to_string()),
            request: Some(request),
            summary: None,
            error: None,
        }
    }

    pub fn to_response(&self) -> IngestJobResponse {
        let elapsed = (Utc::now() - self.created_at).num_milliseconds().max(0) as u64;
        IngestJobResponse {
            job_id: self.job_id.clone(),
            status: self.status.clone(),
            progress: self.progress,
            elapsed_ms: elapsed,
            message: self.message.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            summary: self.summary.clone(),
            error: self.error.clone(),
        }
    }
}
