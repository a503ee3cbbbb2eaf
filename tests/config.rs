use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use metagenome_collector::config::{CollectOverrides, Config, ConfigLoader, QueryEntry};
use metagenome_collector::domain::{FieldFilter, KeywordFormat, SortDirection};
use metagenome_collector::error::CollectorError;

const CONFIG: &str = r#"{
    "schema_version": 1,
    "queries": [
        ["material", "soil", "country", "USA"],
        { "filters": [["biome", "marine biome"]], "limit": 3, "label": "marine" }
    ],
    "limits": [10],
    "output": "runs/soil_vs_marine",
    "public_data": true,
    "descending": true,
    "order_field": "sequence_count_raw",
    "rarefaction_threshold": 1.5,
    "min_species_count": 500,
    "unique_projects": true,
    "page_size": 50,
    "timeout_secs": 15,
    "keyword_format": "json"
}"#;

#[test]
fn load_config_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("mg-collect.json");
    fs::write(&path, CONFIG).unwrap();

    let config = ConfigLoader::load(Some(path.to_str().unwrap()))
        .unwrap()
        .unwrap();
    assert_eq!(config.queries.len(), 2);
    assert_matches!(config.queries[0], QueryEntry::Shorthand(_));
    assert_matches!(config.queries[1], QueryEntry::Detailed(_));

    let resolved = ConfigLoader::resolve(Some(config), CollectOverrides::default()).unwrap();
    let soil = &resolved.queries[0];
    assert_eq!(soil.limit(), 10);
    assert_eq!(soil.label(), "request_1");
    assert_eq!(soil.order_field(), "sequence_count_raw");
    assert_eq!(soil.direction(), SortDirection::Desc);
    assert!(soil.public_data());

    let marine = &resolved.queries[1];
    assert_eq!(marine.limit(), 3);
    assert_eq!(marine.label(), "marine");
    assert_eq!(marine.filters(), &[FieldFilter::new("biome", "marine biome")]);

    assert_eq!(resolved.policy.thresholds.slope_threshold, 1.5);
    assert_eq!(resolved.policy.thresholds.min_species_count, 500.0);
    assert_eq!(resolved.policy.thresholds.min_read_count, 1_000_000.0);
    assert!(resolved.policy.unique_projects);
    assert!(!resolved.policy.include_phylogeny);
    assert_eq!(resolved.client.page_size, 50);
    assert_eq!(resolved.client.timeout.as_secs(), 15);
    assert_eq!(resolved.keyword_format, KeywordFormat::Json);
    assert_eq!(resolved.output, Utf8PathBuf::from("runs/soil_vs_marine.csv"));
}

#[test]
fn command_line_wins_over_file() {
    let config: Config = serde_json::from_str(CONFIG).unwrap();
    let overrides = CollectOverrides {
        metadata: vec![vec!["feature".to_string(), "lake".to_string()]],
        limits: vec![4],
        labels: vec!["lake".to_string()],
        min_species_count: Some(2000),
        output: Some("lake.tsv".to_string()),
        ..CollectOverrides::default()
    };
    let resolved = ConfigLoader::resolve(Some(config), overrides).unwrap();

    assert_eq!(resolved.queries.len(), 1);
    assert_eq!(resolved.queries[0].limit(), 4);
    assert_eq!(resolved.queries[0].label(), "lake");
    assert_eq!(resolved.policy.thresholds.min_species_count, 2000.0);
    assert_eq!(resolved.output, Utf8PathBuf::from("lake.tsv"));
    // Values the command line left alone still come from the file.
    assert_eq!(resolved.policy.thresholds.slope_threshold, 1.5);
}

#[test]
fn explicit_missing_config_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");
    let err = ConfigLoader::load(Some(path.to_str().unwrap())).unwrap_err();
    assert_matches!(err, CollectorError::ConfigRead(_));
}

#[test]
fn malformed_config_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("broken.json");
    fs::write(&path, "{ \"queries\": 12 }").unwrap();
    let err = ConfigLoader::load(Some(path.to_str().unwrap())).unwrap_err();
    assert_matches!(err, CollectorError::ConfigParse(_));
    assert!(err.is_configuration());
}

#[test]
fn unknown_schema_version_is_rejected() {
    let config: Config =
        serde_json::from_str(r#"{ "schema_version": 99, "queries": [["biome", "soil"]] }"#).unwrap();
    let err = ConfigLoader::resolve(Some(config), CollectOverrides::default()).unwrap_err();
    assert_matches!(err, CollectorError::UnsupportedSchemaVersion(99));
    assert!(err.is_configuration());
}

#[test]
fn zero_page_size_is_rejected() {
    let overrides = CollectOverrides {
        metadata: vec![vec!["material".to_string(), "soil".to_string()]],
        page_size: Some(0),
        ..CollectOverrides::default()
    };
    let err = ConfigLoader::resolve(None, overrides).unwrap_err();
    assert!(err.is_configuration());
}
