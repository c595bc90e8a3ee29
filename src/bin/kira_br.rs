use std::io::BufRead;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_biodata_repository::app::App;
use kira_biodata_repository::config::ConfigLoader;
use kira_biodata_repository::domain::{FileFormat, FileId, FilterSpec, SourceId};
use kira_biodata_repository::error::KiraError;
use kira_biodata_repository::fetch::TransportFetcher;
use kira_biodata_repository::output::{JsonOutput, OutputMode, TextOutput};
use kira_biodata_repository::scheduler::SchedulerHandle;

#[derive(Parser)]
#[command(name = "kira-br")]
#[command(about = "Versioned archive for biological datasets")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true, help = "Print machine readable JSON instead of text")]
    json: bool,

    #[arg(long, global = true, help = "Configuration file (default: ./kira-br.json)")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Create an empty repository")]
    Init,
    #[command(about = "Create datasets and sources listed in kira-br.json")]
    SyncConfig,
    #[command(about = "Poll every due source once")]
    Update,
    #[command(about = "Poll due sources on a fixed interval until stdin closes")]
    Watch(WatchArgs),
    #[command(about = "List datasets")]
    Datasets,
    #[command(about = "List sources with their last check and error")]
    Sources(SourcesArgs),
    #[command(about = "List the files of a dataset")]
    Files(FilesArgs),
    #[command(about = "Show the revision history of a file")]
    Revisions(RevisionsArgs),
    #[command(about = "Write a revision of a file to disk")]
    Export(ExportArgs),
    #[command(about = "Store a local file as a new revision")]
    Ingest(IngestArgs),
    #[command(about = "Preview which names a filter list keeps")]
    FilterTest(FilterTestArgs),
    #[command(about = "Tag a revision")]
    Tag(TagArgs),
}

#[derive(Args)]
struct WatchArgs {
    #[arg(long)]
    interval_minutes: Option<u64>,
}

#[derive(Args)]
struct SourcesArgs {
    dataset: Option<String>,
}

#[derive(Args)]
struct FilesArgs {
    dataset: String,
}

#[derive(Args)]
struct RevisionsArgs {
    file: FileId,
}

#[derive(Args)]
struct ExportArgs {
    file: FileId,

    #[arg(long, short)]
    revision: Option<u32>,

    #[arg(long, short)]
    output: Utf8PathBuf,
}

#[derive(Args)]
struct IngestArgs {
    dataset: String,

    path: Utf8PathBuf,

    #[arg(long)]
    name: Option<String>,

    #[arg(long, value_enum, default_value_t = FileFormat::Raw)]
    format: FileFormat,
}

#[derive(Args)]
struct FilterTestArgs {
    #[arg(long, help = "Use the saved filters of this source")]
    source: Option<SourceId>,

    #[arg(long = "filter", help = "Ad-hoc filter: PATTERN, !PATTERN or PATTERN=>MAPPING")]
    filters: Vec<String>,

    names: Vec<String>,
}

#[derive(Args)]
struct TagArgs {
    file: FileId,
    revision: u32,
    tag: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(kira) = report.downcast_ref::<KiraError>() {
            return ExitCode::from(map_exit_code(kira));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::DatasetNotFound(_)
        | KiraError::SourceNotFound(_)
        | KiraError::FileNotFound(_)
        | KiraError::RevisionNotFound(_)
        | KiraError::MissingConfig
        | KiraError::ConfigRead(_)
        | KiraError::ConfigParse(_) => 2,
        KiraError::FetchHttp(_)
        | KiraError::FetchStatus { .. }
        | KiraError::UnsupportedScheme(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    let config = match cli.command {
        Commands::SyncConfig => ConfigLoader::resolve(cli.config.as_deref())?,
        _ => ConfigLoader::resolve_or_default(cli.config.as_deref())?,
    };
    let tick_interval = config.tick_interval;
    let fetcher = TransportFetcher::new(config.fetch)?;
    let app = App::open(config, fetcher)?;

    match cli.command {
        Commands::Init => {
            let root = app.init()?;
            match mode {
                OutputMode::Json => {
                    JsonOutput::print(&serde_json::json!({ "root": root })).into_diagnostic()?
                }
                OutputMode::Text => println!("initialized repository at {root}"),
            }
        }
        Commands::SyncConfig => {
            let result = match mode {
                OutputMode::Json => app.sync_config(&JsonOutput)?,
                OutputMode::Text => app.sync_config(&TextOutput)?,
            };
            match mode {
                OutputMode::Json => JsonOutput::print(&result).into_diagnostic()?,
                OutputMode::Text => TextOutput::print_sync(&result),
            }
        }
        Commands::Update => {
            let report = match mode {
                OutputMode::Json => app.update(&JsonOutput)?,
                OutputMode::Text => app.update(&TextOutput)?,
            };
            match mode {
                OutputMode::Json => JsonOutput::print(&report).into_diagnostic()?,
                OutputMode::Text => TextOutput::print_tick(&report),
            }
        }
        Commands::Watch(args) => {
            let interval = args
                .interval_minutes
                .filter(|minutes| *minutes > 0)
                .map(|minutes| std::time::Duration::from_secs(minutes * 60))
                .unwrap_or(tick_interval);
            let handle = SchedulerHandle::start(app.scheduler()?, interval);
            eprintln!(
                "watching sources every {}s; close stdin (Ctrl-D) to stop",
                interval.as_secs()
            );
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                if line.is_err() {
                    break;
                }
            }
            handle.stop();
        }
        Commands::Datasets => {
            let result = app.datasets()?;
            match mode {
                OutputMode::Json => JsonOutput::print(&result).into_diagnostic()?,
                OutputMode::Text => TextOutput::print_datasets(&result),
            }
        }
        Commands::Sources(args) => {
            let result = app.sources(args.dataset.as_deref())?;
            match mode {
                OutputMode::Json => JsonOutput::print(&result).into_diagnostic()?,
                OutputMode::Text => TextOutput::print_sources(&result),
            }
        }
        Commands::Files(args) => {
            let result = app.files(&args.dataset)?;
            match mode {
                OutputMode::Json => JsonOutput::print(&result).into_diagnostic()?,
                OutputMode::Text => TextOutput::print_files(&result),
            }
        }
        Commands::Revisions(args) => {
            let result = app.revisions(args.file)?;
            match mode {
                OutputMode::Json => JsonOutput::print(&result).into_diagnostic()?,
                OutputMode::Text => TextOutput::print_revisions(&result),
            }
        }
        Commands::Export(args) => {
            let result = app.export(args.file, args.revision, &args.output)?;
            match mode {
                OutputMode::Json => JsonOutput::print(&result).into_diagnostic()?,
                OutputMode::Text => TextOutput::print_export(&result),
            }
        }
        Commands::Ingest(args) => {
            let result = app.ingest(&args.dataset, &args.path, args.name.as_deref(), args.format)?;
            match mode {
                OutputMode::Json => JsonOutput::print(&result).into_diagnostic()?,
                OutputMode::Text => TextOutput::print_ingest(&result),
            }
        }
        Commands::FilterTest(args) => {
            let specs = args
                .filters
                .iter()
                .map(|raw| parse_filter_arg(raw))
                .collect::<Vec<_>>();
            let result = app.filter_test(args.source, &specs, &args.names)?;
            match mode {
                OutputMode::Json => JsonOutput::print(&result).into_diagnostic()?,
                OutputMode::Text => TextOutput::print_filter_test(&result),
            }
        }
        Commands::Tag(args) => {
            let result = app.tag(args.file, args.revision, &args.tag)?;
            match mode {
                OutputMode::Json => JsonOutput::print(&result).into_diagnostic()?,
                OutputMode::Text => TextOutput::print_tag(&result),
            }
        }
    }
    Ok(())
}

fn parse_filter_arg(raw: &str) -> FilterSpec {
    let (inverted, rest) = match raw.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let spec = match rest.split_once("=>") {
        Some((pattern, mapping)) => FilterSpec::new(pattern).with_mapping(mapping),
        None => FilterSpec::new(rest),
    };
    if inverted { spec.inverted() } else { spec }
}
