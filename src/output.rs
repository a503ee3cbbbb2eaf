use std::io::{self, Write};

use serde::Serialize;

use crate::app::{CollectResult, ProgressEvent, ProgressSink};
use crate::table::MergeResult;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_collect(result: &CollectResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_merge(result: &MergeResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Human-readable progress on stderr, used in interactive mode.
pub struct ConsoleOutput;

impl ConsoleOutput {
    pub fn print_collect(result: &CollectResult) {
        for query in &result.queries {
            let status = match (&query.fetch_error, query.limit_reached) {
                (_, true) => "limit reached".to_string(),
                (Some(err), false) => format!("stopped: {err}"),
                (None, false) => "exhausted".to_string(),
            };
            println!(
                "query {} {}: {}/{} accepted, {} pages, {} rejected by thresholds, {} duplicates, {} 16S, {} skipped ({status})",
                query.sequence,
                query.keyword,
                query.accepted,
                query.limit,
                query.pages_fetched,
                query.threshold_rejections,
                query.duplicate_ids + query.duplicate_projects,
                query.excluded_16s,
                query.skipped_records + query.curve_failures,
            );
        }
        match &result.output {
            Some(path) => println!("{} rows written to {path}", result.rows_written),
            None => println!("{} rows written", result.rows_written),
        }
        println!("Overall time: {:.2}s", result.elapsed_ms as f64 / 1000.0);
    }

    pub fn print_merge(result: &MergeResult) {
        for id in &result.duplicates {
            println!("{id} is a duplicate.");
        }
        println!(
            "{} rows from {} tables saved to {}",
            result.rows_written,
            result.inputs.len(),
            result.output
        );
    }
}

impl ProgressSink for ConsoleOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{} ({} ms)", event.message, elapsed.as_millis()),
            None => eprintln!("{}", event.message),
        }
    }
}
