//! Text form of the vertex and edge insertions sent to the graph store.
//!
//! Rendering and parsing live side by side so the escaping contract has a
//! single definition: whatever `escape_literal` produces, `parse_statement`
//! reads back verbatim.

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, tag_no_case, take_while, take_while1, take_while_m_n},
    character::complete::{anychar, char, digit1, multispace0, satisfy},
    combinator::{all_consuming, cut, map, map_res, not, opt, recognize, value},
    error::{context, Error, ParseError},
    multi::{fold_many0, separated_list0, separated_list1},
    sequence::{delimited, pair, preceded, terminated},
    IResult, Parser,
};

pub const QUOTE: char = '"';
pub const ID_SEPARATOR: &str = "::";

/// Escapes a value for embedding between double quotes.
pub fn escape_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_ascii_control() => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

fn quoted(value: &str) -> String {
    format!("{QUOTE}{}{QUOTE}", escape_literal(value))
}

/// Escapes one component of a vertex key so that `::` can only appear as the
/// separator between components.
pub fn escape_id_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | ':') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Vertex key of a table.
pub fn table_vertex_id(table_name: &str) -> String {
    escape_id_component(table_name)
}

/// Vertex key of a column, `<table>::<column>` over escaped components.
/// Never collides with another column's key nor with any table key.
pub fn column_vertex_id(table_name: &str, column_name: &str) -> String {
    format!(
        "{}{ID_SEPARATOR}{}",
        escape_id_component(table_name),
        escape_id_component(column_name)
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexRow {
    pub vid: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeRow {
    pub src: String,
    pub dst: String,
    pub rank: i64,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    InsertVertex {
        tag: String,
        props: Vec<String>,
        rows: Vec<VertexRow>,
    },
    InsertEdge {
        edge_type: String,
        props: Vec<String>,
        rows: Vec<EdgeRow>,
    },
}

impl Statement {
    pub fn row_count(&self) -> usize {
        match self {
            Self::InsertVertex { rows, .. } => rows.len(),
            Self::InsertEdge { rows, .. } => rows.len(),
        }
    }

    /// Renders the statement. Tag, edge and property names are emitted as-is
    /// and must already be identifiers; every value is quoted and escaped.
    pub fn render(&self) -> String {
        let values = |values: &[String]| {
            values
                .iter()
                .map(|v| quoted(v))
                .collect::<Vec<_>>()
                .join(", ")
        };

        match self {
            Self::InsertVertex { tag, props, rows } => {
                let items = rows
                    .iter()
                    .map(|row| format!("{}:({})", quoted(&row.vid), values(&row.values)))
                    .collect::<Vec<_>>()
                    .join(",");
                format!(
                    "INSERT VERTEX {tag}({}) VALUES {items};",
                    props.join(", ")
                )
            }
            Self::InsertEdge {
                edge_type,
                props,
                rows,
            } => {
                let items = rows
                    .iter()
                    .map(|row| {
                        let rank = if row.rank == 0 {
                            String::new()
                        } else {
                            format!("@{}", row.rank)
                        };
                        format!(
                            "{} -> {}{rank}:({})",
                            quoted(&row.src),
                            quoted(&row.dst),
                            values(&row.values)
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(",");
                format!(
                    "INSERT EDGE {edge_type}({}) VALUES {items};",
                    props.join(", ")
                )
            }
        }
    }
}

fn ws<'a, O, E: ParseError<&'a str>, F>(inner: F) -> impl Parser<&'a str, Output = O, Error = E>
where
    F: Parser<&'a str, Output = O, Error = E>,
{
    delimited(multispace0, inner, multispace0)
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Case-insensitive keyword that is not the prefix of a longer word.
fn keyword<'a>(word: &'static str) -> impl Parser<&'a str, Output = &'a str, Error = Error<&'a str>> {
    terminated(tag_no_case(word), not(satisfy(is_ident_char)))
}

fn bare_identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(is_ident_char),
    ))
    .parse(input)
}

fn identifier(input: &str) -> IResult<&str, String> {
    map(
        alt((
            delimited(char('`'), take_while1(|c: char| c != '`'), char('`')),
            bare_identifier,
        )),
        str::to_string,
    )
    .parse(input)
}

fn escape_sequence(input: &str) -> IResult<&str, char> {
    preceded(
        char('\\'),
        alt((
            value('\n', char('n')),
            value('\r', char('r')),
            value('\t', char('t')),
            preceded(
                char('x'),
                cut(map_res(
                    take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()),
                    |hex: &str| u8::from_str_radix(hex, 16).map(char::from),
                )),
            ),
            anychar,
        )),
    )
    .parse(input)
}

/// Double-quoted literal, undoing exactly what `escape_literal` does.
fn string_literal(input: &str) -> IResult<&str, String> {
    delimited(
        char(QUOTE),
        fold_many0(
            alt((
                map(is_not("\"\\"), str::to_string),
                map(escape_sequence, String::from),
            )),
            String::new,
            |mut acc, fragment| {
                acc.push_str(&fragment);
                acc
            },
        ),
        cut(char(QUOTE)),
    )
    .parse(input)
}

fn name_list(input: &str) -> IResult<&str, Vec<String>> {
    delimited(
        ws(char('(')),
        separated_list0(ws(char(',')), identifier),
        cut(ws(char(')'))),
    )
    .parse(input)
}

fn value_list(input: &str) -> IResult<&str, Vec<String>> {
    delimited(
        ws(char('(')),
        separated_list0(ws(char(',')), string_literal),
        cut(ws(char(')'))),
    )
    .parse(input)
}

fn rank(input: &str) -> IResult<&str, i64> {
    preceded(
        ws(char('@')),
        cut(map_res(recognize(pair(opt(char('-')), digit1)), |digits: &str| {
            digits.parse::<i64>()
        })),
    )
    .parse(input)
}

fn vertex_row(input: &str) -> IResult<&str, VertexRow> {
    map(
        (ws(string_literal), ws(char(':')), value_list),
        |(vid, _, values)| VertexRow { vid, values },
    )
    .parse(input)
}

fn edge_row(input: &str) -> IResult<&str, EdgeRow> {
    map(
        (
            ws(string_literal),
            ws(tag("->")),
            ws(string_literal),
            opt(rank),
            ws(char(':')),
            value_list,
        ),
        |(src, _, dst, rank, _, values)| EdgeRow {
            src,
            dst,
            rank: rank.unwrap_or(0),
            values,
        },
    )
    .parse(input)
}

fn insert_vertex(input: &str) -> IResult<&str, Statement> {
    let (input, _) = ws(keyword("VERTEX")).parse(input)?;
    let (input, (tag, props)) = cut((identifier, name_list)).parse(input)?;
    let (input, _) = cut(ws(keyword("VALUES"))).parse(input)?;
    let (input, rows) = context(
        "vertex rows",
        separated_list1(ws(char(',')), cut(vertex_row)),
    )
    .parse(input)?;

    Ok((input, Statement::InsertVertex { tag, props, rows }))
}

fn insert_edge(input: &str) -> IResult<&str, Statement> {
    let (input, _) = ws(keyword("EDGE")).parse(input)?;
    let (input, (edge_type, props)) = cut((identifier, name_list)).parse(input)?;
    let (input, _) = cut(ws(keyword("VALUES"))).parse(input)?;
    let (input, rows) = context(
        "edge rows",
        separated_list1(ws(char(',')), cut(edge_row)),
    )
    .parse(input)?;

    Ok((
        input,
        Statement::InsertEdge {
            edge_type,
            props,
            rows,
        },
    ))
}

fn statement(input: &str) -> IResult<&str, Statement> {
    delimited(
        ws(keyword("INSERT")),
        alt((insert_vertex, insert_edge)),
        (multispace0, opt(char(';')), multispace0),
    )
    .parse(input)
}

/// Parses the two insertion forms produced by [`Statement::render`].
pub fn parse_statement(input: &str) -> Result<Statement, String> {
    all_consuming(statement)
        .parse(input)
        .map(|(_, parsed)| parsed)
        .map_err(|err| match err {
            nom::Err::Incomplete(_) => "incomplete statement".to_string(),
            nom::Err::Error(e) | nom::Err::Failure(e) => {
                let near: String = e.input.chars().take(24).collect();
                format!("{:?} near `{near}`", e.code)
            }
        })
}
