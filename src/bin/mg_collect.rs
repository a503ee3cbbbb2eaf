use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{ArgAction, Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use metagenome_collector::app::App;
use metagenome_collector::config::{CollectOverrides, ConfigLoader};
use metagenome_collector::domain::KeywordFormat;
use metagenome_collector::error::CollectorError;
use metagenome_collector::mgrast::MgRastHttpClient;
use metagenome_collector::output::{ConsoleOutput, JsonOutput, OutputMode};
use metagenome_collector::table::{TableWriter, merge_tables};

#[derive(Parser)]
#[command(name = "mg-collect")]
#[command(about = "Metagenomic data collection via MG-RAST")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Search MG-RAST and write the accepted metagenomes to a table")]
    Collect(CollectArgs),
    #[command(about = "Merge produced tables, dropping repeated metagenome ids")]
    Merge(MergeArgs),
}

#[derive(Args)]
struct CollectArgs {
    /// One query: `<field> <value> [<field> <value> ...]`. Repeat for more queries.
    #[arg(short = 'm', long = "metadata", num_args = 2.., action = ArgAction::Append, value_name = "FIELD VALUE")]
    metadata: Vec<Vec<String>>,

    /// Result cap per query; a single value applies to every query.
    #[arg(short = 'l', long = "limit", num_args = 1..)]
    limit: Vec<usize>,

    /// Labels for the archived search pages, one per query.
    #[arg(short = 'j', long = "json", num_args = 1..)]
    json: Vec<String>,

    #[arg(short = 'o', long)]
    output: Option<String>,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    public_data: bool,

    #[arg(long)]
    desc: bool,

    #[arg(long)]
    order_field: Option<String>,

    /// Accept a curve whose tail slope is below this value.
    #[arg(short = 'r', long, allow_negative_numbers = true)]
    rarefaction_threshold: Option<f64>,

    #[arg(long)]
    min_species_count: Option<u64>,

    #[arg(long)]
    min_read_count: Option<u64>,

    /// Keep 16S rRNA (amplicon) datasets.
    #[arg(long)]
    phylogeny: bool,

    /// Accept curves regardless of their slope.
    #[arg(long = "ignore-rc")]
    ignore_rc: bool,

    /// Accept at most one metagenome per project.
    #[arg(long = "no-duplicate-proj")]
    no_duplicate_proj: bool,

    #[arg(long)]
    page_size: Option<usize>,

    #[arg(long)]
    timeout_secs: Option<u64>,

    #[arg(long)]
    max_retries: Option<usize>,

    #[arg(long)]
    keyword_format: Option<KeywordFormat>,

    /// Directory to keep a copy of every fetched search page in.
    #[arg(long)]
    save_pages: Option<String>,
}

#[derive(Args)]
struct MergeArgs {
    #[arg(short = 'i', long = "input", num_args = 1.., required = true)]
    input: Vec<Utf8PathBuf>,

    #[arg(short = 'o', long, default_value = "metadata.csv")]
    output: Utf8PathBuf,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<CollectorError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &CollectorError) -> u8 {
    if error.is_configuration() {
        2
    } else if error.is_transport() {
        3
    } else {
        1
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    match cli.command {
        Commands::Collect(args) => run_collect(args, output_mode),
        Commands::Merge(args) => run_merge(args, output_mode),
    }
}

fn run_collect(args: CollectArgs, output_mode: OutputMode) -> miette::Result<()> {
    let config = ConfigLoader::load(args.config.as_deref())?;
    let overrides = CollectOverrides {
        metadata: args.metadata,
        limits: args.limit,
        labels: args.json,
        output: args.output,
        public_data: args.public_data,
        descending: args.desc,
        order_field: args.order_field,
        rarefaction_threshold: args.rarefaction_threshold,
        min_species_count: args.min_species_count,
        min_read_count: args.min_read_count,
        phylogeny: args.phylogeny,
        ignore_slope: args.ignore_rc,
        unique_projects: args.no_duplicate_proj,
        page_size: args.page_size,
        timeout_secs: args.timeout_secs,
        max_retries: args.max_retries,
        keyword_format: args.keyword_format,
        save_pages: args.save_pages,
    };
    let resolved = ConfigLoader::resolve(config, overrides)?;

    let client = MgRastHttpClient::new(resolved.client.clone())?;
    let mut app = App::new(client, resolved.policy);
    if let Some(dir) = resolved.page_archive.clone() {
        app = app.with_page_archive(dir);
    }

    let mut writer = TableWriter::create(&resolved.output, resolved.keyword_format)?;
    let mut result = match output_mode {
        OutputMode::Interactive => app.collect(&resolved.queries, &mut writer, &ConsoleOutput),
        OutputMode::NonInteractive => app.collect(&resolved.queries, &mut writer, &JsonOutput),
    }?;
    writer.finish()?;
    result.output = Some(resolved.output.to_string());

    match output_mode {
        OutputMode::Interactive => ConsoleOutput::print_collect(&result),
        OutputMode::NonInteractive => JsonOutput::print_collect(&result).into_diagnostic()?,
    }
    Ok(())
}

fn run_merge(args: MergeArgs, output_mode: OutputMode) -> miette::Result<()> {
    let result = merge_tables(&args.input, &args.output)?;
    match output_mode {
        OutputMode::Interactive => ConsoleOutput::print_merge(&result),
        OutputMode::NonInteractive => JsonOutput::print_merge(&result).into_diagnostic()?,
    }
    Ok(())
}
