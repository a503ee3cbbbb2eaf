use serde_json::Value;

use crate::domain::{Candidate, ENV_PACKAGE_SENTINEL, contains_16s_marker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A field mentions 16S while phylogenetic (amplicon) data is excluded.
    Marker16S,
    MissingField(&'static str),
    InvalidField(&'static str),
    NotAnObject,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Candidate(Candidate),
    Skip(SkipReason),
}

pub fn try_extract(record: &Value, include_phylogeny: bool) -> Extraction {
    let Some(object) = record.as_object() else {
        return Extraction::Skip(SkipReason::NotAnObject);
    };

    if !include_phylogeny && object.values().any(|value| contains_16s_marker(&value_text(value))) {
        return Extraction::Skip(SkipReason::Marker16S);
    }

    match build_candidate(record) {
        Ok(candidate) => Extraction::Candidate(candidate),
        Err(reason) => Extraction::Skip(reason),
    }
}

fn build_candidate(record: &Value) -> Result<Candidate, SkipReason> {
    let sequence_count_raw = required(record, "sequence_count_raw")
        .and_then(|value| as_count(value).ok_or(SkipReason::InvalidField("sequence_count_raw")))?;
    let alpha_diversity = required(record, "alpha_diversity_shannon")?;
    let alpha_diversity_shannon =
        as_float(alpha_diversity).ok_or(SkipReason::InvalidField("alpha_diversity_shannon"))?;

    Ok(Candidate {
        metagenome_id: required_text(record, "metagenome_id")?,
        project_name: required_text(record, "project_name")?,
        project_id: required_text(record, "project_id")?,
        biome: required_text(record, "biome")?,
        country: required_text(record, "country")?,
        material: required_text(record, "material")?,
        feature: required_text(record, "feature")?,
        sequence_type: required_text(record, "sequence_type")?,
        seq_meth: required_text(record, "seq_meth")?,
        sequence_count_raw,
        alpha_diversity_shannon,
        alpha_diversity_text: value_text(alpha_diversity).trim().to_string(),
        env_package_name: record
            .get("env_package_name")
            .filter(|value| !value.is_null())
            .map(value_text)
            .unwrap_or_else(|| ENV_PACKAGE_SENTINEL.to_string()),
    })
}

fn required<'a>(record: &'a Value, field: &'static str) -> Result<&'a Value, SkipReason> {
    record
        .get(field)
        .filter(|value| !value.is_null())
        .ok_or(SkipReason::MissingField(field))
}

fn required_text(record: &Value, field: &'static str) -> Result<String, SkipReason> {
    required(record, field).map(value_text)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|v| *v >= 0.0 && v.fract() == 0.0).map(|v| v as u64)),
        Value::String(text) => {
            let text = text.trim();
            text.parse::<u64>().ok().or_else(|| {
                text.parse::<f64>()
                    .ok()
                    .filter(|v| *v >= 0.0 && v.fract() == 0.0)
                    .map(|v| v as u64)
            })
        }
        _ => None,
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn record() -> Value {
        json!({
            "metagenome_id": "mgm4440037.3",
            "project_name": "Soil survey",
            "project_id": "mgp15",
            "biome": "temperate grassland",
            "country": "USA",
            "material": "soil",
            "feature": "agricultural field",
            "sequence_type": "WGS",
            "seq_meth": "illumina",
            "sequence_count_raw": "2400000",
            "alpha_diversity_shannon": 612.4,
            "env_package_name": "soil"
        })
    }

    #[test]
    fn extracts_complete_record() {
        let candidate = assert_matches!(try_extract(&record(), false), Extraction::Candidate(c) => c);
        assert_eq!(candidate.metagenome_id, "mgm4440037.3");
        assert_eq!(candidate.sequence_count_raw, 2_400_000);
        assert_eq!(candidate.alpha_diversity_shannon, 612.4);
        assert_eq!(candidate.env_package_name, "soil");
    }

    #[test]
    fn alpha_diversity_keeps_source_text() {
        let mut raw = record();
        raw["alpha_diversity_shannon"] = json!(" 612.40");
        let candidate = assert_matches!(try_extract(&raw, false), Extraction::Candidate(c) => c);
        assert_eq!(candidate.alpha_diversity_shannon, 612.4);
        assert_eq!(candidate.alpha_diversity_text, "612.40");

        let candidate = assert_matches!(try_extract(&record(), false), Extraction::Candidate(c) => c);
        assert_eq!(candidate.alpha_diversity_text, "612.4");
    }

    #[test]
    fn missing_env_package_uses_sentinel() {
        let mut value = record();
        value.as_object_mut().unwrap().remove("env_package_name");
        let candidate = assert_matches!(try_extract(&value, false), Extraction::Candidate(c) => c);
        assert_eq!(candidate.env_package_name, ENV_PACKAGE_SENTINEL);
    }

    #[test]
    fn missing_required_field_is_skipped() {
        let mut value = record();
        value.as_object_mut().unwrap().remove("country");
        assert_eq!(
            try_extract(&value, false),
            Extraction::Skip(SkipReason::MissingField("country"))
        );
    }

    #[test]
    fn marker_in_any_field_is_skipped_unless_phylogeny_included() {
        let mut value = record();
        value["sequence_type"] = json!("Amplicon");
        value["project_name"] = json!("Gut 16s survey");
        assert_eq!(
            try_extract(&value, false),
            Extraction::Skip(SkipReason::Marker16S)
        );
        assert_matches!(try_extract(&value, true), Extraction::Candidate(_));
    }

    #[test]
    fn marker_in_unmapped_field_counts_too() {
        let mut value = record();
        value["pipeline_notes"] = json!("16S rRNA screened");
        assert_eq!(
            try_extract(&value, false),
            Extraction::Skip(SkipReason::Marker16S)
        );
    }

    #[test]
    fn unreadable_count_is_skipped() {
        let mut value = record();
        value["sequence_count_raw"] = json!("many");
        assert_eq!(
            try_extract(&value, false),
            Extraction::Skip(SkipReason::InvalidField("sequence_count_raw"))
        );
    }
}
