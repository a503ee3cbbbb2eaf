use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CollectorError;

/// Value written for `env_package_name` when a record does not carry one.
pub const ENV_PACKAGE_SENTINEL: &str = "None";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct FieldFilter {
    pub field: String,
    pub value: String,
}

impl FieldFilter {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

impl From<(String, String)> for FieldFilter {
    fn from((field, value): (String, String)) -> Self {
        Self { field, value }
    }
}

impl From<FieldFilter> for (String, String) {
    fn from(filter: FieldFilter) -> Self {
        (filter.field, filter.value)
    }
}

/// The filter list of a query, carried on every row the query produced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeywordTag(Vec<FieldFilter>);

impl KeywordTag {
    pub fn new(filters: Vec<FieldFilter>) -> Result<Self, CollectorError> {
        if filters.is_empty() {
            return Err(CollectorError::InvalidQuery(
                "a query needs at least one field/value pair".to_string(),
            ));
        }
        if let Some(empty) = filters.iter().find(|filter| filter.field.trim().is_empty()) {
            return Err(CollectorError::InvalidQuery(format!(
                "empty field name for value {:?}",
                empty.value
            )));
        }
        Ok(Self(filters))
    }

    /// Builds a tag from a flat `field value field value ...` token list.
    pub fn from_tokens<S: AsRef<str>>(tokens: &[S]) -> Result<Self, CollectorError> {
        if tokens.len() % 2 != 0 {
            let dangling = tokens
                .last()
                .map(|token| token.as_ref().to_string())
                .unwrap_or_default();
            return Err(CollectorError::InvalidQuery(format!(
                "field {dangling:?} has no value"
            )));
        }
        let filters = tokens
            .chunks(2)
            .map(|pair| FieldFilter::new(pair[0].as_ref(), pair[1].as_ref()))
            .collect();
        Self::new(filters)
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.0
    }

    /// List-literal form, e.g. `[['biome', 'soil'], ['country', 'USA']]`.
    pub fn to_literal(&self) -> String {
        let pairs = self
            .0
            .iter()
            .map(|filter| {
                format!(
                    "[{}, {}]",
                    quote_literal(&filter.field),
                    quote_literal(&filter.value)
                )
            })
            .collect::<Vec<_>>();
        format!("[{}]", pairs.join(", "))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.to_literal())
    }

    pub fn render(&self, format: KeywordFormat) -> String {
        match format {
            KeywordFormat::Literal => self.to_literal(),
            KeywordFormat::Json => self.to_json(),
        }
    }
}

impl fmt::Display for KeywordTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_literal())
    }
}

impl FromStr for KeywordTag {
    type Err = CollectorError;

    /// Accepts both the list-literal and the JSON rendering.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if let Ok(tag) = serde_json::from_str::<KeywordTag>(trimmed) {
            return Self::new(tag.0).map_err(|_| CollectorError::InvalidKeyword(value.to_string()));
        }
        if !trimmed.starts_with('[') || !trimmed.ends_with(']') {
            return Err(CollectorError::InvalidKeyword(value.to_string()));
        }

        let pattern = literal_pair_regex();
        let mut filters = Vec::new();
        for captures in pattern.captures_iter(trimmed) {
            let field = captures
                .get(1)
                .or_else(|| captures.get(2))
                .map(|m| unescape_literal(m.as_str()))
                .unwrap_or_default();
            let value = captures
                .get(3)
                .or_else(|| captures.get(4))
                .map(|m| unescape_literal(m.as_str()))
                .unwrap_or_default();
            filters.push(FieldFilter::new(field, value));
        }

        let leftover = pattern.replace_all(trimmed, "");
        let is_clean = leftover
            .chars()
            .all(|ch| matches!(ch, '[' | ']' | ',') || ch.is_whitespace());
        if !is_clean {
            return Err(CollectorError::InvalidKeyword(value.to_string()));
        }
        Self::new(filters).map_err(|_| CollectorError::InvalidKeyword(value.to_string()))
    }
}

fn literal_pair_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r#"\[\s*(?:'((?:[^'\\]|\\.)*)'|"((?:[^"\\]|\\.)*)")\s*,\s*(?:'((?:[^'\\]|\\.)*)'|"((?:[^"\\]|\\.)*)")\s*\]"#,
        )
        .expect("keyword literal pattern is valid")
    })
}

fn quote_literal(text: &str) -> String {
    if text.contains('\'') && !text.contains('"') {
        format!("\"{}\"", text.replace('\\', "\\\\"))
    } else {
        format!("'{}'", text.replace('\\', "\\\\").replace('\'', "\\'"))
    }
}

fn unescape_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(ch);
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum KeywordFormat {
    #[default]
    Literal,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One search request. Built once, never mutated while it is being fetched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Query {
    sequence: usize,
    keyword: KeywordTag,
    limit: usize,
    order_field: String,
    direction: SortDirection,
    public_data: bool,
    label: String,
}

impl Query {
    pub fn new(sequence: usize, keyword: KeywordTag, limit: usize) -> Result<Self, CollectorError> {
        if sequence == 0 {
            return Err(CollectorError::InvalidQuery(
                "query sequence numbers start at 1".to_string(),
            ));
        }
        if limit == 0 {
            return Err(CollectorError::InvalidLimit(format!(
                "query {sequence} has a limit of 0"
            )));
        }
        Ok(Self {
            sequence,
            keyword,
            limit,
            order_field: "created_on".to_string(),
            direction: SortDirection::Asc,
            public_data: false,
            label: format!("request_{sequence}"),
        })
    }

    pub fn with_order_field(mut self, order_field: impl Into<String>) -> Self {
        self.order_field = order_field.into();
        self
    }

    pub fn with_direction(mut self, direction: SortDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_public_data(mut self, public_data: bool) -> Self {
        self.public_data = public_data;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn sequence(&self) -> usize {
        self.sequence
    }

    pub fn keyword(&self) -> &KeywordTag {
        &self.keyword
    }

    pub fn filters(&self) -> &[FieldFilter] {
        self.keyword.filters()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn order_field(&self) -> &str {
        &self.order_field
    }

    pub fn direction(&self) -> SortDirection {
        self.direction
    }

    pub fn public_data(&self) -> bool {
        self.public_data
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub metagenome_id: String,
    pub project_name: String,
    pub project_id: String,
    pub biome: String,
    pub country: String,
    pub material: String,
    pub feature: String,
    pub sequence_type: String,
    pub seq_meth: String,
    pub sequence_count_raw: u64,
    pub alpha_diversity_shannon: f64,
    /// `alpha_diversity_shannon` as the service sent it; written to the table.
    pub alpha_diversity_text: String,
    pub env_package_name: String,
}

impl Candidate {
    pub fn mentions_16s(&self) -> bool {
        [
            &self.metagenome_id,
            &self.project_name,
            &self.project_id,
            &self.biome,
            &self.country,
            &self.material,
            &self.feature,
            &self.sequence_type,
            &self.seq_meth,
            &self.env_package_name,
        ]
        .into_iter()
        .any(|text| contains_16s_marker(text))
    }
}

/// Case-insensitive check for amplicon (16S rRNA) markers.
pub fn contains_16s_marker(text: &str) -> bool {
    text.to_ascii_lowercase().contains("16s")
}

/// An accepted candidate together with the values derived during admission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputRow {
    pub candidate: Candidate,
    pub species_count: f64,
    pub rc_slope: f64,
    pub keyword: KeywordTag,
}
