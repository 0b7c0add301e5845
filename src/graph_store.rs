use crate::{error::Result, field_mapping::GraphSchema};

/// Outcome reported by the store for one executed statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub succeeded: bool,
    pub error_msg: String,
}

impl ExecutionResult {
    pub fn success() -> Self {
        Self {
            succeeded: true,
            error_msg: String::new(),
        }
    }

    pub fn failure(error_msg: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            error_msg: error_msg.into(),
        }
    }
}

/// A property-graph store that accepts insertion statements.
///
/// `Err` is reserved for the handle itself being unusable (released session,
/// broken backend). A statement the store understood but refused comes back
/// as an `ExecutionResult` with `succeeded == false`.
pub trait GraphStore {
    fn execute(&mut self, statement: &str) -> Result<ExecutionResult>;

    /// Declared tags and edge types, fetched when the handle was created.
    fn schema(&self) -> &GraphSchema;
}

impl<S: GraphStore + ?Sized> GraphStore for &mut S {
    fn execute(&mut self, statement: &str) -> Result<ExecutionResult> {
        (**self).execute(statement)
    }

    fn schema(&self) -> &GraphSchema {
        (**self).schema()
    }
}
