//! Getting rows back out of the `insert into` statements of a database export.
//!
//! The export tool writes one statement per line, always in the same shape:
//!
//! ```text
//! insert into `journal`(`id`,`code`,`date`,`value1`,`value2`,`text`) values (26044,'C10E','1998-04-16',0.0000,0.0000,null);
//! ```
//!
//! We don't try to understand SQL. The prefix and the trailing `);` are stripped, and the values
//! are split on commas that are not inside a quoted region. Any line that doesn't have exactly
//! this layout is skipped.
use crate::ArcStr;
use std::io::{self, BufRead};

/// All row lines start with this.
pub const INSERT_MARKER: &str = "insert";

/// The fixed statement prefix and column list for one table in the export.
#[derive(Debug, Clone)]
pub struct TableLayout {
    name: ArcStr,
    prefix: String,
    columns: Vec<ArcStr>,
}

impl TableLayout {
    pub fn new(name: &str, columns: &[&str]) -> Self {
        let column_list = columns
            .iter()
            .map(|col| format!("`{}`", col))
            .collect::<Vec<_>>()
            .join(",");
        TableLayout {
            name: name.into(),
            prefix: format!("insert into `{}`({}) values (", name, column_list),
            columns: columns.iter().map(|&col| ArcStr::from(col)).collect(),
        }
    }

    /// The table of patient/code associations.
    pub fn journal() -> Self {
        Self::new("journal", &["id", "code", "date", "value1", "value2", "text"])
    }

    /// The patient demographics table.
    pub fn patient() -> Self {
        Self::new(
            "patient",
            &["id", "dob", "depscore", "isMale", "race", "pracID", "imd"],
        )
    }

    /// Recover the layout from the statement itself, for tables where we don't know the columns
    /// up front.
    pub fn from_insert(line: &str) -> Option<Self> {
        let rest = line.strip_prefix("insert into `")?;
        let (name, rest) = rest.split_once("`(")?;
        let (columns, _) = rest.split_once(") values (")?;
        let columns = columns
            .split(',')
            .map(|col| col.trim().trim_matches('`'))
            .collect::<Vec<_>>();
        if columns.iter().any(|col| col.is_empty()) {
            return None;
        }
        Some(Self::new(name, &columns))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn columns(&self) -> &[ArcStr] {
        &self.columns
    }

    /// Classify a line of the export and, if it is a row of this table, split out its fields.
    pub fn parse(&self, line: &str) -> RawLine {
        let line = line.trim_end_matches(|ch| ch == '\n' || ch == '\r');
        if !line.starts_with(INSERT_MARKER) {
            return RawLine::Other;
        }
        let body = match line
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_suffix(");"))
        {
            Some(body) => body,
            None => return RawLine::Malformed,
        };
        let fields = split_fields(body);
        if fields.len() != self.columns.len() {
            return RawLine::Malformed;
        }
        RawLine::Row(fields)
    }
}

/// What a single line of the export turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawLine {
    /// Not a row (comments, `create table`, locks, blank lines...).
    Other,
    /// Starts like a row but doesn't match the table layout.
    Malformed,
    Row(Vec<String>),
}

/// Split a comma-separated value list, treating commas inside quotes as content.
///
/// Both `'` and `"` toggle the quoted state and are dropped from the output. Sub-values
/// embedded in a quoted field (e.g. `'2469,v=130,w=80'`) are kept intact here; it is up to the
/// caller to decide what they mean.
pub fn split_fields(body: &str) -> Vec<String> {
    let mut fields = vec![];
    let mut current = String::new();
    let mut in_quote = false;
    for ch in body.chars() {
        match ch {
            ',' if !in_quote => fields.push(std::mem::take(&mut current)),
            '\'' | '"' => in_quote = !in_quote,
            _ => current.push(ch),
        }
    }
    fields.push(current);
    fields
}

/// Iterate over the lines of an export, numbered from 1.
///
/// Invalid UTF-8 (free text in old exports is not always clean) is replaced rather than treated as
/// an error.
pub fn numbered_lines(
    reader: impl BufRead,
) -> impl Iterator<Item = io::Result<(usize, String)>> {
    reader.split(b'\n').enumerate().map(|(idx, line)| {
        let line = line?;
        Ok((idx + 1, String::from_utf8_lossy(&line).into_owned()))
    })
}
