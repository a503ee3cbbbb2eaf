use std::fs;
use std::io::Write;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::admission::{Admission, AdmissionController, AdmissionPolicy, AdmissionState};
use crate::domain::{KeywordTag, Query};
use crate::error::CollectorError;
use crate::extract::{Extraction, SkipReason, try_extract};
use crate::fetcher::PageStream;
use crate::mgrast::{MgRastClient, RawPage};
use crate::table::TableWriter;

#[derive(Debug, Clone, Serialize)]
pub struct CollectResult {
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u128,
    pub output: Option<String>,
    pub rows_written: usize,
    pub queries: Vec<QueryReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryReport {
    pub sequence: usize,
    pub label: String,
    pub keyword: KeywordTag,
    pub limit: usize,
    pub pages_fetched: usize,
    pub records_seen: usize,
    pub accepted: usize,
    pub skipped_records: usize,
    pub excluded_16s: usize,
    pub duplicate_ids: usize,
    pub duplicate_projects: usize,
    pub threshold_rejections: usize,
    pub curve_failures: usize,
    pub limit_reached: bool,
    pub fetch_error: Option<String>,
}

impl QueryReport {
    fn new(query: &Query) -> Self {
        Self {
            sequence: query.sequence(),
            label: query.label().to_string(),
            keyword: query.keyword().clone(),
            limit: query.limit(),
            pages_fetched: 0,
            records_seen: 0,
            accepted: 0,
            skipped_records: 0,
            excluded_16s: 0,
            duplicate_ids: 0,
            duplicate_projects: 0,
            threshold_rejections: 0,
            curve_failures: 0,
            limit_reached: false,
            fetch_error: None,
        }
    }

    fn tally(&mut self, admission: &Admission) {
        match admission {
            Admission::Accepted(_) => self.accepted += 1,
            Admission::RejectedDuplicateId => self.duplicate_ids += 1,
            Admission::RejectedDuplicateProject => self.duplicate_projects += 1,
            Admission::RejectedBy16S => self.excluded_16s += 1,
            Admission::RejectedByThresholds(_) => self.threshold_rejections += 1,
            Admission::CurveUnavailable(_) => self.curve_failures += 1,
            Admission::LimitReached => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App<C: MgRastClient> {
    client: C,
    policy: AdmissionPolicy,
    page_archive: Option<Utf8PathBuf>,
}

impl<C: MgRastClient> App<C> {
    pub fn new(client: C, policy: AdmissionPolicy) -> Self {
        Self {
            client,
            policy,
            page_archive: None,
        }
    }

    /// Keep a copy of every fetched search page under `dir`.
    pub fn with_page_archive(mut self, dir: Utf8PathBuf) -> Self {
        self.page_archive = Some(dir);
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Runs every query in declaration order against one shared admission
    /// state, streaming accepted rows into `writer`.
    pub fn collect<W: Write>(
        &self,
        queries: &[Query],
        writer: &mut TableWriter<W>,
        sink: &dyn ProgressSink,
    ) -> Result<CollectResult, CollectorError> {
        let (result, _) = self.collect_with_state(queries, AdmissionState::default(), writer, sink)?;
        Ok(result)
    }

    /// Like [`App::collect`], but starts from `state` and hands the final state
    /// back, so several runs can share one dedup history.
    pub fn collect_with_state<W: Write>(
        &self,
        queries: &[Query],
        state: AdmissionState,
        writer: &mut TableWriter<W>,
        sink: &dyn ProgressSink,
    ) -> Result<(CollectResult, AdmissionState), CollectorError> {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut controller = AdmissionController::with_state(self.policy, state);
        let rows_before = writer.rows_written();

        let mut reports = Vec::with_capacity(queries.len());
        for query in queries {
            reports.push(self.collect_query(query, &mut controller, writer, sink)?);
        }
        writer.flush()?;

        let elapsed = start.elapsed();
        sink.event(ProgressEvent {
            message: format!(
                "phase=Done; {} rows written",
                writer.rows_written() - rows_before
            ),
            elapsed: Some(elapsed),
        });

        let result = CollectResult {
            started_at,
            elapsed_ms: elapsed.as_millis(),
            output: None,
            rows_written: writer.rows_written() - rows_before,
            queries: reports,
        };
        Ok((result, controller.into_state()))
    }

    fn collect_query<W: Write>(
        &self,
        query: &Query,
        controller: &mut AdmissionController,
        writer: &mut TableWriter<W>,
        sink: &dyn ProgressSink,
    ) -> Result<QueryReport, CollectorError> {
        let start = Instant::now();
        let mut report = QueryReport::new(query);
        info!(
            query = query.sequence(),
            keyword = %query.keyword(),
            limit = query.limit(),
            "starting query"
        );
        sink.event(ProgressEvent {
            message: format!("phase=Search; query {} {}", query.sequence(), query.keyword()),
            elapsed: None,
        });

        let include_phylogeny = controller.policy().include_phylogeny;
        let mut pages = PageStream::new(&self.client, query);
        'pages: while !controller.is_saturated(query) {
            let page = match pages.next() {
                None => break,
                Some(Ok(page)) => page,
                Some(Err(err)) => {
                    report.fetch_error = Some(err.to_string());
                    sink.event(ProgressEvent {
                        message: format!("phase=Search; query {} stopped: {err}", query.sequence()),
                        elapsed: Some(start.elapsed()),
                    });
                    break;
                }
            };
            report.pages_fetched = pages.pages_fetched();
            self.archive_page(query, report.pages_fetched, &page);

            for record in &page.data {
                if controller.is_saturated(query) {
                    break 'pages;
                }
                report.records_seen += 1;
                let candidate = match try_extract(record, include_phylogeny) {
                    Extraction::Candidate(candidate) => candidate,
                    Extraction::Skip(SkipReason::Marker16S) => {
                        report.excluded_16s += 1;
                        continue;
                    }
                    Extraction::Skip(_) => {
                        report.skipped_records += 1;
                        continue;
                    }
                };

                let admission = controller.admit(&candidate, query, |id| self.client.rarefaction(id));
                report.tally(&admission);
                match admission {
                    Admission::Accepted(row) => {
                        writer.write_row(&row)?;
                        sink.event(ProgressEvent {
                            message: format!(
                                "phase=Admit; {} accepted ({}/{})",
                                row.candidate.metagenome_id,
                                controller.state().accepted_for(query.sequence()),
                                query.limit()
                            ),
                            elapsed: None,
                        });
                    }
                    Admission::CurveUnavailable(reason) => {
                        warn!(
                            metagenome_id = %candidate.metagenome_id,
                            %reason,
                            "rarefaction curve unavailable; skipping candidate"
                        );
                    }
                    _ => {}
                }
            }
        }

        report.limit_reached = controller.is_saturated(query);
        info!(
            query = query.sequence(),
            accepted = report.accepted,
            pages = report.pages_fetched,
            limit_reached = report.limit_reached,
            "query finished"
        );
        sink.event(ProgressEvent {
            message: format!(
                "phase=Search; query {} finished with {} rows",
                query.sequence(),
                report.accepted
            ),
            elapsed: Some(start.elapsed()),
        });
        Ok(report)
    }

    fn archive_page(&self, query: &Query, page_number: usize, page: &RawPage) {
        let Some(dir) = &self.page_archive else {
            return;
        };
        if let Err(err) = write_page(dir, query.label(), page_number, page) {
            warn!(error = %err, "failed to archive search page");
        }
    }
}

fn write_page(
    dir: &Utf8Path,
    label: &str,
    page_number: usize,
    page: &RawPage,
) -> Result<(), CollectorError> {
    fs::create_dir_all(dir.as_std_path())
        .map_err(|err| CollectorError::Filesystem(format!("create {dir}: {err}")))?;
    let path = dir.join(format!("{label}_{page_number}.json"));
    let bytes = serde_json::to_vec_pretty(page)
        .map_err(|err| CollectorError::Filesystem(err.to_string()))?;
    fs::write(path.as_std_path(), bytes)
        .map_err(|err| CollectorError::Filesystem(format!("write {path}: {err}")))
}
