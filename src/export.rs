//! Export coded data for statistical packages.
//!
//! A `StatTable` is a rectangular table with a column-name-to-label mapping.
//! It is written as an RFC 4180 CSV data file plus an SPSS syntax file that
//! imports the CSV and applies variable labels, value labels from the
//! codebook, and the uncodable sentinel as a missing value.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::batch::BatchResult;
use crate::codebook::{Category, Codebook};
use crate::reliability::ReliabilityReport;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid variable name {0:?}")]
    BadVariableName(String),
    #[error("row {row} has {found} cells, expected {expected}")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Numeric { width: u8, decimals: u8 },
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatColumn {
    pub name: String,
    pub label: String,
    pub kind: ColumnKind,
    /// Value labels for coded columns.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub value_labels: Vec<(Category, String)>,
    /// Declared user-missing value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing: Option<Category>,
}

impl StatColumn {
    pub fn numeric(name: &str, label: &str, width: u8, decimals: u8) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            kind: ColumnKind::Numeric { width, decimals },
            value_labels: Vec::new(),
            missing: None,
        }
    }

    pub fn text(name: &str, label: &str) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            kind: ColumnKind::Text,
            value_labels: Vec::new(),
            missing: None,
        }
    }

    /// Numeric `d.d` column labelled from the codebook, `0.0` missing.
    pub fn code(name: &str, label: &str, codebook: &Codebook) -> Self {
        let mut value_labels: Vec<(Category, String)> = codebook
            .entries
            .iter()
            .map(|e| (e.category, e.label.clone()))
            .collect();
        value_labels.push((Category::UNCODABLE, codebook.uncodable_label.clone()));
        Self {
            value_labels,
            missing: Some(Category::UNCODABLE),
            ..Self::numeric(name, label, 3, 1)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StatValue {
    Number(f64),
    Code(Category),
    Text(String),
    Missing,
}

impl StatValue {
    fn text(value: Option<&str>) -> Self {
        value.map_or(StatValue::Missing, |v| StatValue::Text(v.to_string()))
    }

    fn render(&self, kind: ColumnKind) -> String {
        match (self, kind) {
            (StatValue::Number(n), ColumnKind::Numeric { decimals, .. }) => {
                format!("{:.*}", decimals as usize, n)
            }
            (StatValue::Number(n), ColumnKind::Text) => n.to_string(),
            (StatValue::Code(c), _) => c.to_string(),
            (StatValue::Text(t), _) => t.clone(),
            (StatValue::Missing, _) => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatTable {
    pub columns: Vec<StatColumn>,
    pub rows: Vec<Vec<StatValue>>,
}

impl StatTable {
    pub fn from_batch(result: &BatchResult, codebook: &Codebook) -> Self {
        let columns = vec![
            StatColumn::numeric("item_id", "Item number", 8, 0),
            StatColumn::text("response", "Response text"),
            StatColumn::numeric("rating", "Ranking", 8, 2),
            StatColumn::text("context", "Context"),
            StatColumn::code("code", "Model-assigned category", codebook),
            StatColumn::text("outcome", "Coding outcome"),
        ];
        let rows = result
            .rows
            .iter()
            .map(|row| {
                vec![
                    StatValue::Number((row.index + 1) as f64),
                    StatValue::Text(row.item.response().to_string()),
                    row.item.rating().map_or(StatValue::Missing, StatValue::Number),
                    StatValue::text(row.item.context()),
                    StatValue::Code(row.category),
                    StatValue::Text(row.outcome.as_str().to_string()),
                ]
            })
            .collect();
        Self { columns, rows }
    }

    pub fn from_reliability(report: &ReliabilityReport, codebook: &Codebook) -> Self {
        let three_raters = report.rows.iter().any(|r| r.human_2.is_some());
        let mut columns = vec![
            StatColumn::numeric("item_id", "Item number", 8, 0),
            StatColumn::text("response", "Response text"),
            StatColumn::code("human_1", "Human coder 1", codebook),
        ];
        if three_raters {
            columns.push(StatColumn::code("human_2", "Human coder 2", codebook));
        }
        columns.push(StatColumn::code("model", "Model-assigned category", codebook));
        columns.push(StatColumn::text("outcome", "Coding outcome"));

        let rows = report
            .rows
            .iter()
            .map(|row| {
                let mut cells = vec![
                    StatValue::Number((row.index + 1) as f64),
                    StatValue::Text(row.item.response().to_string()),
                    StatValue::Code(row.human_1),
                ];
                if three_raters {
                    cells.push(row.human_2.map_or(StatValue::Missing, StatValue::Code));
                }
                cells.push(StatValue::Code(row.model));
                cells.push(StatValue::Text(row.outcome.as_str().to_string()));
                cells
            })
            .collect();
        Self { columns, rows }
    }

    fn validate(&self) -> Result<(), ExportError> {
        for column in &self.columns {
            if !is_valid_variable_name(&column.name) {
                return Err(ExportError::BadVariableName(column.name.clone()));
            }
        }
        for (idx, row) in self.rows.iter().enumerate() {
            if row.len() != self.columns.len() {
                return Err(ExportError::RaggedRow {
                    row: idx,
                    expected: self.columns.len(),
                    found: row.len(),
                });
            }
        }
        Ok(())
    }

    /// Byte width of the widest value in a text column (at least 1).
    fn text_width(&self, col: usize) -> usize {
        self.rows
            .iter()
            .map(|row| row[col].render(ColumnKind::Text).len())
            .max()
            .unwrap_or(0)
            .clamp(1, 32_767)
    }
}

// =============================================================================
// Writers
// =============================================================================

pub fn write_csv<W: Write>(table: &StatTable, mut out: W) -> Result<(), ExportError> {
    table.validate()?;
    let header: Vec<String> = table.columns.iter().map(|c| csv_field(&c.name)).collect();
    write!(out, "{}\r\n", header.join(","))?;
    for row in &table.rows {
        let cells: Vec<String> = row
            .iter()
            .zip(&table.columns)
            .map(|(value, column)| csv_field(&value.render(column.kind)))
            .collect();
        write!(out, "{}\r\n", cells.join(","))?;
    }
    out.flush()?;
    Ok(())
}

/// SPSS syntax that reads `csv_file` and labels it.
pub fn write_spss_syntax<W: Write>(
    table: &StatTable,
    csv_file: &str,
    mut out: W,
) -> Result<(), ExportError> {
    table.validate()?;
    writeln!(out, "* Encoding: UTF-8.")?;
    writeln!(out, "GET DATA")?;
    writeln!(out, "  /TYPE=TXT")?;
    writeln!(out, "  /FILE={}", spss_string(csv_file))?;
    writeln!(out, "  /ENCODING='UTF8'")?;
    writeln!(out, "  /DELCASE=LINE")?;
    writeln!(out, "  /DELIMITERS=\",\"")?;
    writeln!(out, "  /QUALIFIER='\"'")?;
    writeln!(out, "  /ARRANGEMENT=DELIMITED")?;
    writeln!(out, "  /FIRSTCASE=2")?;
    writeln!(out, "  /VARIABLES=")?;
    for (idx, column) in table.columns.iter().enumerate() {
        let format = match column.kind {
            ColumnKind::Numeric { width, decimals } => format!("F{width}.{decimals}"),
            ColumnKind::Text => format!("A{}", table.text_width(idx)),
        };
        let end = if idx + 1 == table.columns.len() { "." } else { "" };
        writeln!(out, "    {} {}{}", column.name, format, end)?;
    }

    writeln!(out, "VARIABLE LABELS")?;
    for (idx, column) in table.columns.iter().enumerate() {
        let sep = if idx == 0 { "  " } else { "  /" };
        let end = if idx + 1 == table.columns.len() { "." } else { "" };
        writeln!(out, "{sep}{} {}{end}", column.name, spss_string(&column.label))?;
    }

    let labelled: Vec<&StatColumn> = table
        .columns
        .iter()
        .filter(|c| !c.value_labels.is_empty())
        .collect();
    if !labelled.is_empty() {
        writeln!(out, "VALUE LABELS")?;
        for (idx, column) in labelled.iter().enumerate() {
            let sep = if idx == 0 { "  " } else { "  /" };
            writeln!(out, "{sep}{}", column.name)?;
            for (pos, (category, label)) in column.value_labels.iter().enumerate() {
                let end = if idx + 1 == labelled.len() && pos + 1 == column.value_labels.len() {
                    "."
                } else {
                    ""
                };
                writeln!(out, "    {} {}{end}", category, spss_string(label))?;
            }
        }
    }

    for column in &table.columns {
        if let Some(missing) = column.missing {
            writeln!(out, "MISSING VALUES {} ({}).", column.name, missing)?;
        }
    }
    writeln!(out, "EXECUTE.")?;
    out.flush()?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportPaths {
    pub csv: PathBuf,
    pub syntax: PathBuf,
}

/// Write `<stem>.csv` and `<stem>.sps` into `dir`.
pub fn write_export(table: &StatTable, dir: &Path, stem: &str) -> Result<ExportPaths, ExportError> {
    std::fs::create_dir_all(dir)?;
    let csv = dir.join(format!("{stem}.csv"));
    let syntax = dir.join(format!("{stem}.sps"));

    write_csv(table, std::io::BufWriter::new(std::fs::File::create(&csv)?))?;
    let csv_name = format!("{stem}.csv");
    write_spss_syntax(
        table,
        &csv_name,
        std::io::BufWriter::new(std::fs::File::create(&syntax)?),
    )?;
    Ok(ExportPaths { csv, syntax })
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn spss_string(value: &str) -> String {
    let flat = value.replace(['\n', '\r'], " ");
    format!("'{}'", flat.replace('\'', "''"))
}

fn is_valid_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= 64
        && first.is_ascii_alphabetic()
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        && !name.ends_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_table() -> StatTable {
        let codebook = Codebook::trust_framework();
        StatTable {
            columns: vec![
                StatColumn::numeric("item_id", "Item number", 8, 0),
                StatColumn::text("response", "Response text"),
                StatColumn::code("code", "Coder's category", &codebook),
            ],
            rows: vec![
                vec![
                    StatValue::Number(1.0),
                    StatValue::Text("They said \"no\", twice".into()),
                    StatValue::Code("1.3".parse().unwrap()),
                ],
                vec![
                    StatValue::Number(2.0),
                    StatValue::Text("plain".into()),
                    StatValue::Code(Category::UNCODABLE),
                ],
            ],
        }
    }

    #[test]
    fn csv_quotes_only_when_needed() {
        let mut buf = Vec::new();
        write_csv(&small_table(), &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(
            text,
            "item_id,response,code\r\n1,\"They said \"\"no\"\", twice\",1.3\r\n2,plain,0.0\r\n"
        );
    }

    #[test]
    fn syntax_declares_labels_and_missing() {
        let mut buf = Vec::new();
        write_spss_syntax(&small_table(), "out.csv", &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("/FILE='out.csv'"));
        assert!(text.contains("    response A21"));
        assert!(text.contains("    code F3.1."));
        assert!(text.contains("  /code 'Coder''s category'."));
        assert!(text.contains("    1.1 'Competence'"));
        assert!(text.contains("    0.0 'Uncodable / missing'."));
        assert!(text.contains("MISSING VALUES code (0.0)."));
        assert!(text.trim_end().ends_with("EXECUTE."));
    }

    #[test]
    fn invalid_names_and_ragged_rows_are_rejected() {
        let mut table = small_table();
        table.columns[0].name = "1st".into();
        assert!(matches!(
            write_csv(&table, Vec::new()),
            Err(ExportError::BadVariableName(_))
        ));

        let mut table = small_table();
        table.rows[1].pop();
        assert!(matches!(
            write_csv(&table, Vec::new()),
            Err(ExportError::RaggedRow { row: 1, .. })
        ));
    }
}
