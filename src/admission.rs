use std::collections::{HashMap, HashSet};

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::domain::{Candidate, OutputRow, Query};
use crate::error::CollectorError;
use crate::rarefaction::{Thresholds, Verdict, evaluate_json};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct AdmissionPolicy {
    pub thresholds: Thresholds,
    /// Keep amplicon (16S) datasets instead of excluding them.
    pub include_phylogeny: bool,
    /// Accept at most one metagenome per project across the whole run.
    pub unique_projects: bool,
}

/// Run-wide dedup state plus per-query accepted counts.
#[derive(Debug, Default, Clone)]
pub struct AdmissionState {
    accepted_ids: HashSet<String>,
    accepted_projects: HashSet<String>,
    judged_rejections: HashMap<String, Verdict>,
    accepted_per_query: HashMap<usize, usize>,
}

impl AdmissionState {
    pub fn is_accepted(&self, metagenome_id: &str) -> bool {
        self.accepted_ids.contains(metagenome_id)
    }

    pub fn is_project_taken(&self, project_id: &str) -> bool {
        self.accepted_projects.contains(project_id)
    }

    pub fn accepted_for(&self, query_sequence: usize) -> usize {
        self.accepted_per_query
            .get(&query_sequence)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_accepted(&self) -> usize {
        self.accepted_ids.len()
    }

    fn record_acceptance(&mut self, candidate: &Candidate, query: &Query, track_project: bool) {
        self.accepted_ids.insert(candidate.metagenome_id.clone());
        if track_project {
            self.accepted_projects.insert(candidate.project_id.clone());
        }
        *self.accepted_per_query.entry(query.sequence()).or_insert(0) += 1;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Accepted(OutputRow),
    RejectedDuplicateId,
    RejectedDuplicateProject,
    RejectedBy16S,
    RejectedByThresholds(Verdict),
    /// The rarefaction curve could not be fetched; the cap is not consumed.
    CurveUnavailable(String),
    LimitReached,
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted(_))
    }
}

pub struct AdmissionController {
    policy: AdmissionPolicy,
    state: AdmissionState,
}

impl AdmissionController {
    pub fn new(policy: AdmissionPolicy) -> Self {
        Self::with_state(policy, AdmissionState::default())
    }

    pub fn with_state(policy: AdmissionPolicy, state: AdmissionState) -> Self {
        Self { policy, state }
    }

    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    pub fn state(&self) -> &AdmissionState {
        &self.state
    }

    pub fn into_state(self) -> AdmissionState {
        self.state
    }

    /// True once `query` has contributed as many rows as its limit allows.
    pub fn is_saturated(&self, query: &Query) -> bool {
        self.state.accepted_for(query.sequence()) >= query.limit()
    }

    /// Decides one candidate. `fetch_curve` is only called once every cheap
    /// check has passed.
    pub fn admit<F>(&mut self, candidate: &Candidate, query: &Query, fetch_curve: F) -> Admission
    where
        F: FnOnce(&str) -> Result<Value, CollectorError>,
    {
        let id = candidate.metagenome_id.as_str();
        let admission = self.decide(candidate, query, fetch_curve);
        debug!(
            query = query.sequence(),
            metagenome_id = id,
            outcome = ?AdmissionOutcome::from(&admission),
            "admission decision"
        );
        admission
    }

    fn decide<F>(&mut self, candidate: &Candidate, query: &Query, fetch_curve: F) -> Admission
    where
        F: FnOnce(&str) -> Result<Value, CollectorError>,
    {
        if self.is_saturated(query) {
            return Admission::LimitReached;
        }
        if !self.policy.include_phylogeny && candidate.mentions_16s() {
            return Admission::RejectedBy16S;
        }
        let id = candidate.metagenome_id.as_str();
        if self.state.is_accepted(id) {
            return Admission::RejectedDuplicateId;
        }
        if self.policy.unique_projects && self.state.is_project_taken(&candidate.project_id) {
            return Admission::RejectedDuplicateProject;
        }
        if let Some(verdict) = self.state.judged_rejections.get(id) {
            return Admission::RejectedByThresholds(*verdict);
        }

        let curve = match fetch_curve(id) {
            Ok(curve) => curve,
            Err(err) => return Admission::CurveUnavailable(err.to_string()),
        };
        let verdict = evaluate_json(&curve, &self.policy.thresholds);
        if !verdict.accepted {
            self.state
                .judged_rejections
                .insert(id.to_string(), verdict);
            return Admission::RejectedByThresholds(verdict);
        }

        self.state
            .record_acceptance(candidate, query, self.policy.unique_projects);
        Admission::Accepted(OutputRow {
            candidate: candidate.clone(),
            species_count: verdict.species_count,
            rc_slope: verdict.slope,
            keyword: query.keyword().clone(),
        })
    }
}

/// Payload-free view of an [`Admission`], used for logs and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionOutcome {
    Accepted,
    DuplicateId,
    DuplicateProject,
    Marker16S,
    Thresholds,
    CurveUnavailable,
    LimitReached,
}

impl From<&Admission> for AdmissionOutcome {
    fn from(admission: &Admission) -> Self {
        match admission {
            Admission::Accepted(_) => AdmissionOutcome::Accepted,
            Admission::RejectedDuplicateId => AdmissionOutcome::DuplicateId,
            Admission::RejectedDuplicateProject => AdmissionOutcome::DuplicateProject,
            Admission::RejectedBy16S => AdmissionOutcome::Marker16S,
            Admission::RejectedByThresholds(_) => AdmissionOutcome::Thresholds,
            Admission::CurveUnavailable(_) => AdmissionOutcome::CurveUnavailable,
            Admission::LimitReached => AdmissionOutcome::LimitReached,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::domain::KeywordTag;
    use crate::rarefaction::VerdictReason;

    fn candidate(id: &str, project: &str) -> Candidate {
        Candidate {
            metagenome_id: id.to_string(),
            project_name: format!("project {project}"),
            project_id: project.to_string(),
            biome: "soil".to_string(),
            country: "USA".to_string(),
            material: "soil".to_string(),
            feature: "field".to_string(),
            sequence_type: "WGS".to_string(),
            seq_meth: "illumina".to_string(),
            sequence_count_raw: 3_000_000,
            alpha_diversity_shannon: 400.0,
            alpha_diversity_text: "400".to_string(),
            env_package_name: "soil".to_string(),
        }
    }

    fn query(sequence: usize, limit: usize) -> Query {
        Query::new(
            sequence,
            KeywordTag::from_tokens(&["biome", "soil"]).unwrap(),
            limit,
        )
        .unwrap()
    }

    fn flat_curve(_id: &str) -> Result<Value, CollectorError> {
        Ok(json!([[1e6, 1990], [2e6, 2000], [3e6, 2000], [4e6, 2000]]))
    }

    fn steep_curve(_id: &str) -> Result<Value, CollectorError> {
        Ok(json!([[1e6, 1000], [2e6, 1500], [3e6, 2000], [4e6, 2500]]))
    }

    #[test]
    fn accepted_row_carries_derived_fields() {
        let mut controller = AdmissionController::new(AdmissionPolicy::default());
        let q = query(1, 5);
        let row = assert_matches!(
            controller.admit(&candidate("a", "p1"), &q, flat_curve),
            Admission::Accepted(row) => row
        );
        assert_eq!(row.species_count, 2000.0);
        assert_eq!(row.rc_slope, 0.0);
        assert_eq!(&row.keyword, q.keyword());
        assert_eq!(controller.state().accepted_for(1), 1);
    }

    #[test]
    fn duplicate_id_short_circuits_curve_fetch() {
        let mut controller = AdmissionController::new(AdmissionPolicy::default());
        let q1 = query(1, 5);
        let q2 = query(2, 5);
        assert!(controller.admit(&candidate("a", "p1"), &q1, flat_curve).is_accepted());

        let fetched = Cell::new(false);
        let admission = controller.admit(&candidate("a", "p1"), &q2, |id| {
            fetched.set(true);
            flat_curve(id)
        });
        assert_eq!(admission, Admission::RejectedDuplicateId);
        assert!(!fetched.get());
    }

    #[test]
    fn project_uniqueness_only_when_enabled() {
        let q = query(1, 5);
        let mut loose = AdmissionController::new(AdmissionPolicy::default());
        assert!(loose.admit(&candidate("a", "p1"), &q, flat_curve).is_accepted());
        assert!(loose.admit(&candidate("b", "p1"), &q, flat_curve).is_accepted());

        let mut strict = AdmissionController::new(AdmissionPolicy {
            unique_projects: true,
            ..AdmissionPolicy::default()
        });
        assert!(strict.admit(&candidate("a", "p1"), &q, flat_curve).is_accepted());
        assert_eq!(
            strict.admit(&candidate("b", "p1"), &q, flat_curve),
            Admission::RejectedDuplicateProject
        );
    }

    #[test]
    fn rejected_project_does_not_block_later_candidates() {
        let q = query(1, 5);
        let mut strict = AdmissionController::new(AdmissionPolicy {
            unique_projects: true,
            ..AdmissionPolicy::default()
        });
        assert_matches!(
            strict.admit(&candidate("a", "p1"), &q, steep_curve),
            Admission::RejectedByThresholds(_)
        );
        assert!(strict.admit(&candidate("b", "p1"), &q, flat_curve).is_accepted());
    }

    #[test]
    fn threshold_rejection_is_final() {
        let mut controller = AdmissionController::new(AdmissionPolicy::default());
        let q = query(1, 5);
        let verdict = assert_matches!(
            controller.admit(&candidate("a", "p1"), &q, steep_curve),
            Admission::RejectedByThresholds(v) => v
        );
        assert_eq!(verdict.reason, VerdictReason::SlopeTooSteep);

        let fetched = Cell::new(false);
        let again = controller.admit(&candidate("a", "p1"), &query(2, 5), |id| {
            fetched.set(true);
            flat_curve(id)
        });
        assert_eq!(again, Admission::RejectedByThresholds(verdict));
        assert!(!fetched.get());
    }

    #[test]
    fn failed_curve_fetch_does_not_consume_cap() {
        let mut controller = AdmissionController::new(AdmissionPolicy::default());
        let q = query(1, 1);
        let admission = controller.admit(&candidate("a", "p1"), &q, |_| {
            Err(CollectorError::RarefactionHttp("timed out".to_string()))
        });
        assert_matches!(admission, Admission::CurveUnavailable(_));
        assert!(!controller.is_saturated(&q));
        assert!(controller.admit(&candidate("a", "p1"), &q, flat_curve).is_accepted());
        assert!(controller.is_saturated(&q));
        assert_eq!(
            controller.admit(&candidate("b", "p2"), &q, flat_curve),
            Admission::LimitReached
        );
    }

    #[test]
    fn marker_rejected_when_phylogeny_excluded() {
        let mut with_marker = candidate("a", "p1");
        with_marker.sequence_type = "Amplicon 16S".to_string();
        let q = query(1, 5);

        let mut controller = AdmissionController::new(AdmissionPolicy::default());
        assert_eq!(
            controller.admit(&with_marker, &q, flat_curve),
            Admission::RejectedBy16S
        );

        let mut permissive = AdmissionController::new(AdmissionPolicy {
            include_phylogeny: true,
            ..AdmissionPolicy::default()
        });
        assert!(permissive.admit(&with_marker, &q, flat_curve).is_accepted());
    }
}
