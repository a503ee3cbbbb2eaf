//! The output table: a comma-separated file with a fixed header, one row per
//! accepted metagenome in acceptance order.

use std::borrow::Cow;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, info};

use crate::domain::{KeywordFormat, OutputRow};
use crate::error::CollectorError;

pub const HEADER: [&str; 15] = [
    "metagenome_id",
    "project_name",
    "project_id",
    "biome",
    "country",
    "material",
    "feature",
    "sequence_type",
    "seq_meth",
    "sequence_count_raw",
    "alpha_diversity_shannon",
    "env_package_name",
    "species_count",
    "RC_slope",
    "keyword",
];

pub const ID_COLUMN: &str = "metagenome_id";

pub fn row_fields(row: &OutputRow, keyword_format: KeywordFormat) -> [String; 15] {
    let c = &row.candidate;
    [
        c.metagenome_id.clone(),
        c.project_name.clone(),
        c.project_id.clone(),
        c.biome.clone(),
        c.country.clone(),
        c.material.clone(),
        c.feature.clone(),
        c.sequence_type.clone(),
        c.seq_meth.clone(),
        c.sequence_count_raw.to_string(),
        c.alpha_diversity_text.clone(),
        c.env_package_name.clone(),
        row.species_count.to_string(),
        row.rc_slope.to_string(),
        row.keyword.render(keyword_format),
    ]
}

pub struct TableWriter<W: Write> {
    out: BufWriter<W>,
    keyword_format: KeywordFormat,
    rows: usize,
}

impl TableWriter<File> {
    pub fn create(path: &Utf8Path, keyword_format: KeywordFormat) -> Result<Self, CollectorError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_str().is_empty()) {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| CollectorError::Filesystem(format!("create {parent}: {err}")))?;
        }
        let file = File::create(path.as_std_path())
            .map_err(|err| CollectorError::Filesystem(format!("create {path}: {err}")))?;
        info!(path = %path, "writing table");
        Self::new(file, keyword_format)
    }
}

impl<W: Write> TableWriter<W> {
    /// Wraps `sink` and writes the header line immediately.
    pub fn new(sink: W, keyword_format: KeywordFormat) -> Result<Self, CollectorError> {
        let mut writer = Self {
            out: BufWriter::new(sink),
            keyword_format,
            rows: 0,
        };
        writer.write_line(&HEADER)?;
        Ok(writer)
    }

    pub fn write_row(&mut self, row: &OutputRow) -> Result<(), CollectorError> {
        let fields = row_fields(row, self.keyword_format);
        self.write_line(&fields)?;
        self.rows += 1;
        debug!(metagenome_id = %row.candidate.metagenome_id, row = self.rows, "row written");
        Ok(())
    }

    pub fn rows_written(&self) -> usize {
        self.rows
    }

    pub fn flush(&mut self) -> Result<(), CollectorError> {
        self.out
            .flush()
            .map_err(|err| CollectorError::Table(err.to_string()))
    }

    /// Flushes and hands back the underlying sink.
    pub fn finish(self) -> Result<W, CollectorError> {
        self.out
            .into_inner()
            .map_err(|err| CollectorError::Table(err.error().to_string()))
    }

    fn write_line<S: AsRef<str>>(&mut self, fields: &[S]) -> Result<(), CollectorError> {
        let line = fields
            .iter()
            .map(|field| escape_field(field.as_ref()))
            .collect::<Vec<_>>()
            .join(",");
        writeln!(self.out, "{line}").map_err(|err| CollectorError::Table(err.to_string()))
    }
}

fn escape_field(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub header: Vec<String>,
    pub records: Vec<Vec<String>>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|column| column == name)
    }
}

pub fn read_table(path: &Utf8Path) -> Result<Table, CollectorError> {
    let text = fs::read_to_string(path.as_std_path())
        .map_err(|err| CollectorError::Filesystem(format!("read {path}: {err}")))?;
    parse_table(&text).map_err(|err| match err {
        CollectorError::Table(message) => CollectorError::Table(format!("{path}: {message}")),
        other => other,
    })
}

pub fn parse_table(text: &str) -> Result<Table, CollectorError> {
    let mut records = parse_records(text)?.into_iter();
    let header = records
        .next()
        .ok_or_else(|| CollectorError::Table("table is empty".to_string()))?;
    let records = records
        .enumerate()
        .map(|(index, record)| {
            if record.len() == header.len() {
                Ok(record)
            } else {
                Err(CollectorError::Table(format!(
                    "row {} has {} fields, expected {}",
                    index + 1,
                    record.len(),
                    header.len()
                )))
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Table { header, records })
}

fn parse_records(text: &str) -> Result<Vec<Vec<String>>, CollectorError> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            if ch == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(ch);
            }
            continue;
        }
        match ch {
            '"' if field.is_empty() => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                push_record(&mut records, std::mem::take(&mut record));
            }
            other => field.push(other),
        }
    }

    if in_quotes {
        return Err(CollectorError::Table("unterminated quoted field".to_string()));
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        push_record(&mut records, record);
    }
    Ok(records)
}

fn push_record(records: &mut Vec<Vec<String>>, record: Vec<String>) {
    let is_blank = record.len() == 1 && record[0].is_empty();
    if !is_blank {
        records.push(record);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeResult {
    pub inputs: Vec<String>,
    pub output: String,
    pub rows_written: usize,
    /// Identifiers dropped because an earlier row already carried them.
    pub duplicates: Vec<String>,
}

/// Concatenates produced tables, keeping only the first row for every
/// `metagenome_id`.
pub fn merge_tables(
    inputs: &[Utf8PathBuf],
    output: &Utf8Path,
) -> Result<MergeResult, CollectorError> {
    let mut header: Option<Vec<String>> = None;
    let mut seen = HashSet::new();
    let mut duplicates = Vec::new();
    let mut rows = Vec::new();

    for input in inputs {
        let table = read_table(input)?;
        let id_index = table.column(ID_COLUMN).ok_or_else(|| {
            CollectorError::Table(format!("{input}: missing {ID_COLUMN} column"))
        })?;
        match &header {
            None => header = Some(table.header.clone()),
            Some(expected) if *expected != table.header => {
                return Err(CollectorError::Table(format!(
                    "{input}: header does not match {}",
                    inputs[0]
                )));
            }
            Some(_) => {}
        }

        for record in table.records {
            let id = record[id_index].clone();
            if seen.insert(id.clone()) {
                rows.push(record);
            } else {
                info!(metagenome_id = %id, file = %input, "dropping duplicate row");
                duplicates.push(id);
            }
        }
    }

    let header = header.ok_or_else(|| CollectorError::Table("no input tables".to_string()))?;
    if let Some(parent) = output.parent().filter(|parent| !parent.as_str().is_empty()) {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| CollectorError::Filesystem(format!("create {parent}: {err}")))?;
    }
    let file = File::create(output.as_std_path())
        .map_err(|err| CollectorError::Filesystem(format!("create {output}: {err}")))?;
    let mut out = BufWriter::new(file);
    for record in std::iter::once(&header).chain(rows.iter()) {
        let line = record
            .iter()
            .map(|field| escape_field(field))
            .collect::<Vec<_>>()
            .join(",");
        writeln!(out, "{line}").map_err(|err| CollectorError::Table(err.to_string()))?;
    }
    out.flush()
        .map_err(|err| CollectorError::Table(err.to_string()))?;

    Ok(MergeResult {
        inputs: inputs.iter().map(|path| path.to_string()).collect(),
        output: output.to_string(),
        rows_written: rows.len(),
        duplicates,
    })
}
