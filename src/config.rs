use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::admission::AdmissionPolicy;
use crate::domain::{FieldFilter, KeywordFormat, KeywordTag, Query, SortDirection};
use crate::error::CollectorError;
use crate::mgrast::{ClientSettings, DEFAULT_METAGENOME_URL, DEFAULT_SEARCH_URL};
use crate::rarefaction::Thresholds;

pub const DEFAULT_CONFIG_FILE: &str = "mg-collect.json";
pub const SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_LIMIT: usize = 40;
pub const DEFAULT_OUTPUT: &str = "metadata";
pub const DEFAULT_ORDER_FIELD: &str = "created_on";
pub const DEFAULT_RAREFACTION_THRESHOLD: f64 = 0.5;
pub const DEFAULT_MIN_SPECIES_COUNT: u64 = 1000;
pub const DEFAULT_MIN_READ_COUNT: u64 = 1_000_000;
pub const DEFAULT_PAGE_SIZE: usize = 5;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub queries: Vec<QueryEntry>,
    #[serde(default)]
    pub limits: Vec<usize>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub public_data: Option<bool>,
    #[serde(default)]
    pub descending: Option<bool>,
    #[serde(default)]
    pub order_field: Option<String>,
    #[serde(default)]
    pub rarefaction_threshold: Option<f64>,
    #[serde(default)]
    pub min_species_count: Option<u64>,
    #[serde(default)]
    pub min_read_count: Option<u64>,
    #[serde(default)]
    pub phylogeny: Option<bool>,
    #[serde(default)]
    pub ignore_slope: Option<bool>,
    #[serde(default)]
    pub unique_projects: Option<bool>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<usize>,
    #[serde(default)]
    pub keyword_format: Option<KeywordFormat>,
    #[serde(default)]
    pub save_pages: Option<String>,
    #[serde(default)]
    pub search_url: Option<String>,
    #[serde(default)]
    pub metagenome_url: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum QueryEntry {
    /// Flat `["field", "value", ...]` token list, as typed on the command line.
    Shorthand(Vec<String>),
    Detailed(QueryEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct QueryEntryObject {
    pub filters: Vec<FieldFilter>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub label: Option<String>,
}

/// Values given on the command line. They win over the config file.
#[derive(Debug, Clone, Default)]
pub struct CollectOverrides {
    pub metadata: Vec<Vec<String>>,
    pub limits: Vec<usize>,
    pub labels: Vec<String>,
    pub output: Option<String>,
    pub public_data: bool,
    pub descending: bool,
    pub order_field: Option<String>,
    pub rarefaction_threshold: Option<f64>,
    pub min_species_count: Option<u64>,
    pub min_read_count: Option<u64>,
    pub phylogeny: bool,
    pub ignore_slope: bool,
    pub unique_projects: bool,
    pub page_size: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<usize>,
    pub keyword_format: Option<KeywordFormat>,
    pub save_pages: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub queries: Vec<Query>,
    pub policy: AdmissionPolicy,
    pub client: ClientSettings,
    pub output: Utf8PathBuf,
    pub keyword_format: KeywordFormat,
    pub page_archive: Option<Utf8PathBuf>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `path`, or `mg-collect.json` from the working directory when it
    /// exists. Returns `None` when no config file is in play.
    pub fn load(path: Option<&str>) -> Result<Option<Config>, CollectorError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };
        if path.is_none() && !config_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| CollectorError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| CollectorError::ConfigParse(err.to_string()))?;
        Ok(Some(config))
    }

    pub fn resolve(
        config: Option<Config>,
        overrides: CollectOverrides,
    ) -> Result<ResolvedConfig, CollectorError> {
        let config = config.unwrap_or_default();
        let schema_version = config.schema_version.unwrap_or(SCHEMA_VERSION);
        if schema_version != SCHEMA_VERSION {
            return Err(CollectorError::UnsupportedSchemaVersion(schema_version));
        }

        let entries = if overrides.metadata.is_empty() {
            config
                .queries
                .into_iter()
                .map(|entry| match entry {
                    QueryEntry::Shorthand(tokens) => Ok((KeywordTag::from_tokens(&tokens)?, None, None)),
                    QueryEntry::Detailed(obj) => {
                        Ok((KeywordTag::new(obj.filters)?, obj.limit, obj.label))
                    }
                })
                .collect::<Result<Vec<_>, CollectorError>>()?
        } else {
            overrides
                .metadata
                .iter()
                .map(|tokens| Ok((KeywordTag::from_tokens(tokens)?, None, None)))
                .collect::<Result<Vec<_>, CollectorError>>()?
        };
        if entries.is_empty() {
            return Err(CollectorError::InvalidQuery(
                "no queries given (use --metadata or a config file)".to_string(),
            ));
        }

        let limit_source = if overrides.limits.is_empty() {
            config.limits
        } else {
            overrides.limits
        };
        let limits = resolve_limits(&limit_source, entries.len());

        let order_field = overrides
            .order_field
            .or(config.order_field)
            .unwrap_or_else(|| DEFAULT_ORDER_FIELD.to_string());
        if order_field.trim().is_empty() {
            return Err(CollectorError::InvalidQuery(
                "order field must not be empty".to_string(),
            ));
        }
        let direction = if overrides.descending || config.descending.unwrap_or(false) {
            SortDirection::Desc
        } else {
            SortDirection::Asc
        };
        let public_data = overrides.public_data || config.public_data.unwrap_or(false);

        let queries = entries
            .into_iter()
            .enumerate()
            .map(|(index, (keyword, limit, label))| {
                let sequence = index + 1;
                let label = label
                    .or_else(|| overrides.labels.get(index).cloned())
                    .unwrap_or_else(|| format!("request_{sequence}"));
                Ok(Query::new(sequence, keyword, limit.unwrap_or(limits[index]))?
                    .with_order_field(order_field.clone())
                    .with_direction(direction)
                    .with_public_data(public_data)
                    .with_label(label))
            })
            .collect::<Result<Vec<_>, CollectorError>>()?;

        let slope_threshold = overrides
            .rarefaction_threshold
            .or(config.rarefaction_threshold)
            .unwrap_or(DEFAULT_RAREFACTION_THRESHOLD);
        if !slope_threshold.is_finite() {
            return Err(CollectorError::InvalidThreshold(format!(
                "rarefaction threshold must be a finite number, got {slope_threshold}"
            )));
        }
        let min_species_count = overrides
            .min_species_count
            .or(config.min_species_count)
            .unwrap_or(DEFAULT_MIN_SPECIES_COUNT);
        let min_read_count = overrides
            .min_read_count
            .or(config.min_read_count)
            .unwrap_or(DEFAULT_MIN_READ_COUNT);

        let policy = AdmissionPolicy {
            thresholds: Thresholds {
                slope_threshold,
                min_species_count: min_species_count as f64,
                min_read_count: min_read_count as f64,
                ignore_slope: overrides.ignore_slope || config.ignore_slope.unwrap_or(false),
            },
            include_phylogeny: overrides.phylogeny || config.phylogeny.unwrap_or(false),
            unique_projects: overrides.unique_projects || config.unique_projects.unwrap_or(false),
        };

        let page_size = overrides
            .page_size
            .or(config.page_size)
            .unwrap_or(DEFAULT_PAGE_SIZE);
        if page_size == 0 {
            return Err(CollectorError::InvalidLimit(
                "page size must be at least 1".to_string(),
            ));
        }
        let timeout_secs = overrides
            .timeout_secs
            .or(config.timeout_secs)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(CollectorError::InvalidSetting(
                "request timeout must be at least 1 second".to_string(),
            ));
        }
        let client = ClientSettings {
            search_url: config
                .search_url
                .unwrap_or_else(|| DEFAULT_SEARCH_URL.to_string()),
            metagenome_url: config
                .metagenome_url
                .unwrap_or_else(|| DEFAULT_METAGENOME_URL.to_string()),
            timeout: Duration::from_secs(timeout_secs),
            page_size,
            max_retries: overrides.max_retries.or(config.max_retries).unwrap_or(0),
        };

        let output = output_path(
            overrides
                .output
                .or(config.output)
                .as_deref()
                .unwrap_or(DEFAULT_OUTPUT),
        );

        Ok(ResolvedConfig {
            queries,
            policy,
            client,
            output,
            keyword_format: overrides
                .keyword_format
                .or(config.keyword_format)
                .unwrap_or_default(),
            page_archive: overrides
                .save_pages
                .or(config.save_pages)
                .map(Utf8PathBuf::from),
        })
    }
}

/// Expands the user's limit list to one limit per query: nothing given means
/// the default for every query, a single value applies to all of them, a short
/// list is padded with the default and a long one is truncated.
pub fn resolve_limits(limits: &[usize], query_count: usize) -> Vec<usize> {
    match limits {
        [] => vec![DEFAULT_LIMIT; query_count],
        [single] => vec![*single; query_count],
        many => many
            .iter()
            .copied()
            .chain(std::iter::repeat(DEFAULT_LIMIT))
            .take(query_count)
            .collect(),
    }
}

/// Output names without an extension get `.csv` appended.
pub fn output_path(name: &str) -> Utf8PathBuf {
    let path = Utf8PathBuf::from(name);
    if path.extension().is_some() {
        path
    } else {
        Utf8PathBuf::from(format!("{name}.csv"))
    }
}
