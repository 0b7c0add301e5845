use std::collections::HashSet;

use tracing::warn;

use crate::error::{IngestError, Result};

pub const TABLE_TAG_ARITY: usize = 2;
pub const COLUMN_TAG_ARITY: usize = 3;
pub const CONTAINMENT_EDGE_ARITY: usize = 1;

const ENCLOSING_PAIRS: [(char, char); 3] = [('(', ')'), ('[', ']'), ('{', '}')];

/// Ordered property names declared by a schema text such as
/// `column.(name_cn,name,comment)`.
///
/// Everything after the first `.` is taken, one pair of enclosing brackets is
/// dropped and the rest is split on `,`. Text without a `.` declares nothing.
pub fn extract_fields(schema_text: &str) -> Vec<String> {
    let Some((_, content)) = schema_text.split_once('.') else {
        return Vec::new();
    };

    let content = content.trim();
    let inner = ENCLOSING_PAIRS
        .iter()
        .find_map(|(open, close)| content.strip_prefix(*open)?.strip_suffix(*close))
        .unwrap_or(content);

    if inner.trim().is_empty() {
        return Vec::new();
    }

    inner
        .split(',')
        .map(|field| field.trim().trim_matches('`').to_string())
        .collect()
}

pub fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A vertex tag or edge type together with its declared property order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDecl {
    pub name: String,
    pub schema_text: String,
    pub fields: Vec<String>,
}

impl EntityDecl {
    pub fn parse(schema_text: &str) -> Result<Self> {
        let schema_text = schema_text.trim();
        let name = schema_text
            .split_once('.')
            .map(|(name, _)| name)
            .unwrap_or(schema_text)
            .trim()
            .trim_matches('`');

        if !is_identifier(name) {
            return Err(IngestError::Config(format!(
                "`{name}` in `{schema_text}` is not a valid tag or edge type name"
            )));
        }

        let fields = extract_fields(schema_text);
        if let Some(bad) = fields.iter().find(|f| !is_identifier(f)) {
            return Err(IngestError::Config(format!(
                "`{bad}` in `{schema_text}` is not a valid property name"
            )));
        }

        Ok(Self {
            name: name.to_string(),
            schema_text: schema_text.to_string(),
            fields,
        })
    }
}

/// Typed view of the graph space: which tags and edge types exist and the
/// property order of each. Built once when a store handle is created.
///
/// The first tag holds tables, the second columns and the first edge type
/// connects them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphSchema {
    tags: Vec<EntityDecl>,
    edge_types: Vec<EntityDecl>,
}

impl GraphSchema {
    pub fn new<T, E>(tags: T, edge_types: E) -> Result<Self>
    where
        T: IntoIterator,
        T::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        let tags = tags
            .into_iter()
            .map(|text| EntityDecl::parse(text.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let edge_types = edge_types
            .into_iter()
            .map(|text| EntityDecl::parse(text.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        if tags.len() < 2 {
            return Err(IngestError::Config(format!(
                "at least 2 vertex tags (table, column) are required, found {}",
                tags.len()
            )));
        }
        if edge_types.is_empty() {
            return Err(IngestError::Config(
                "at least 1 edge type (containment) is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for decl in tags.iter().chain(edge_types.iter()) {
            if !seen.insert(decl.name.as_str()) {
                return Err(IngestError::Config(format!(
                    "`{}` is declared more than once",
                    decl.name
                )));
            }
        }

        Ok(Self { tags, edge_types })
    }

    /// Parses `;`-separated declaration lists, e.g.
    /// `table.(name,description);column.(name_cn,name,comment)`.
    pub fn parse(tags: &str, edge_types: &str) -> Result<Self> {
        let split = |raw: &str| -> Vec<String> {
            raw.split(';')
                .map(str::trim)
                .filter(|decl| !decl.is_empty())
                .map(ToString::to_string)
                .collect()
        };
        Self::new(split(tags), split(edge_types))
    }

    pub fn tags(&self) -> &[EntityDecl] {
        &self.tags
    }

    pub fn edge_types(&self) -> &[EntityDecl] {
        &self.edge_types
    }

    pub fn table_tag(&self) -> &EntityDecl {
        &self.tags[0]
    }

    pub fn column_tag(&self) -> &EntityDecl {
        &self.tags[1]
    }

    pub fn containment_edge(&self) -> &EntityDecl {
        &self.edge_types[0]
    }

    pub fn tag(&self, name: &str) -> Option<&EntityDecl> {
        self.tags.iter().find(|decl| decl.name == name)
    }

    pub fn edge_type(&self, name: &str) -> Option<&EntityDecl> {
        self.edge_types.iter().find(|decl| decl.name == name)
    }

    /// Property order for a tag or edge type; empty when undeclared.
    pub fn fields_for(&self, entity_type: &str) -> &[String] {
        self.tag(entity_type)
            .or_else(|| self.edge_type(entity_type))
            .map(|decl| decl.fields.as_slice())
            .unwrap_or(&[])
    }

    /// Arity check run once at startup. Table and column tags must match
    /// exactly; a containment edge with the wrong arity is only reported.
    pub fn validate(&self) -> Result<()> {
        check_arity(self.table_tag(), TABLE_TAG_ARITY)?;
        check_arity(self.column_tag(), COLUMN_TAG_ARITY)?;

        let edge = self.containment_edge();
        if edge.fields.len() != CONTAINMENT_EDGE_ARITY {
            warn!(
                edge_type = %edge.name,
                expected = CONTAINMENT_EDGE_ARITY,
                found = edge.fields.len(),
                "Containment edge arity mismatch; edges will be skipped"
            );
        }
        Ok(())
    }
}

pub fn check_arity(decl: &EntityDecl, expected: usize) -> Result<()> {
    if decl.fields.len() != expected {
        return Err(IngestError::SchemaMismatch {
            entity: decl.name.clone(),
            expected,
            found: decl.fields.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{extract_fields, GraphSchema};
    use crate::error::IngestError;

    #[test]
    fn extracts_ordered_fields_after_first_dot() {
        assert_eq!(
            extract_fields("column.(name_cn,name,comment)"),
            vec!["name_cn", "name", "comment"]
        );
        assert_eq!(
            extract_fields("table.[ name , `description` ]"),
            vec!["name", "description"]
        );
        assert_eq!(extract_fields("contains.relation"), vec!["relation"]);
    }

    #[test]
    fn undiscoverable_text_yields_nothing() {
        assert!(extract_fields("").is_empty());
        assert!(extract_fields("table").is_empty());
        assert!(extract_fields("contains.()").is_empty());
    }

    #[test]
    fn schema_requires_two_tags_and_one_edge() {
        let err = GraphSchema::parse("table.(name,description)", "contains.(relation)")
            .expect_err("one tag");
        assert!(matches!(err, IngestError::Config(_)));

        let err = GraphSchema::parse("table.(name,description);column.(a,b,c)", "")
            .expect_err("no edge");
        assert!(matches!(err, IngestError::Config(_)));
    }

    #[test]
    fn schema_rejects_non_identifier_names() {
        let err = GraphSchema::parse(
            "table.(name,description);col umn.(a,b,c)",
            "contains.(relation)",
        )
        .expect_err("bad tag");
        assert!(matches!(err, IngestError::Config(_)));

        let err = GraphSchema::parse(
            "table.(name,descr\"iption);column.(a,b,c)",
            "contains.(relation)",
        )
        .expect_err("bad property");
        assert!(matches!(err, IngestError::Config(_)));
    }

    #[test]
    fn fields_for_covers_tags_and_edges() {
        let schema = GraphSchema::parse(
            "table.(name,description);column.(name_cn,name,comment)",
            "contains.(relation)",
        )
        .expect("schema");
        assert_eq!(schema.fields_for("table"), ["name", "description"]);
        assert_eq!(schema.fields_for("contains"), ["relation"]);
        assert!(schema.fields_for("unknown").is_empty());
        assert_eq!(schema.column_tag().name, "column");
        schema.validate().expect("valid arity");
    }

    #[test]
    fn validate_rejects_wrong_tag_arity_but_tolerates_edges() {
        let schema = GraphSchema::parse(
            "table.(name);column.(name_cn,name,comment)",
            "contains.(relation)",
        )
        .expect("schema");
        let err = schema.validate().expect_err("table arity");
        assert!(matches!(
            err,
            IngestError::SchemaMismatch { expected: 2, found: 1, .. }
        ));

        let schema = GraphSchema::parse(
            "table.(name,description);column.(name_cn,name,comment)",
            "contains.()",
        )
        .expect("schema");
        schema.validate().expect("edge arity is non-fatal");
    }
}
