use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use pubmed_ingest::config::{ConfigLoader, ConfigOverrides, RunLayout};
use pubmed_ingest::coordinator::{IngestReport, PubmedIngestCoordinator};
use pubmed_ingest::error::IngestError;
use pubmed_ingest::ncbi::NcbiHttpClient;
use pubmed_ingest::notify::FileNotifier;
use pubmed_ingest::output::JsonOutput;
use pubmed_ingest::store::LocalWorkStore;
use pubmed_ingest::transfer::HttpMirrorTransfer;

#[derive(Parser)]
#[command(name = "pubmed-ingest")]
#[command(about = "Resumable PubMed/PMC metadata and full-text ingest into a work repository")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the ingest pipeline for a publication date range")]
    Run(RunArgs),
    #[command(about = "Rebuild the final report of a run from its result logs")]
    Report(ReportArgs),
    #[command(about = "Manage admin sets in the local work store")]
    AdminSet(AdminSetArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    resume: bool,

    #[arg(long)]
    start_date: Option<String>,

    #[arg(long)]
    end_date: Option<String>,

    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long = "admin-set")]
    admin_set: Option<String>,

    #[arg(long)]
    depositor: Option<String>,

    #[arg(long)]
    store_root: Option<PathBuf>,
}

#[derive(Args)]
struct ReportArgs {
    #[arg(long)]
    output_dir: PathBuf,
}

#[derive(Args)]
struct AdminSetArgs {
    #[command(subcommand)]
    command: AdminSetCommand,
}

#[derive(Subcommand)]
enum AdminSetCommand {
    #[command(about = "Register an admin set")]
    Create(CreateAdminSetArgs),
}

#[derive(Args)]
struct CreateAdminSetArgs {
    title: String,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    store_root: Option<PathBuf>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<IngestError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &IngestError) -> u8 {
    match error {
        IngestError::ConfigRead(_)
        | IngestError::ConfigParse(_)
        | IngestError::MissingAdminSet(_)
        | IngestError::InvalidDateRange(_)
        | IngestError::MissingCheckpoint(_)
        | IngestError::CheckpointParse(_)
        | IngestError::RunExists(_) => 2,
        IngestError::NcbiHttp(_)
        | IngestError::NcbiStatus { .. }
        | IngestError::TransferHttp(_)
        | IngestError::TransferStatus { .. } => 3,
        IngestError::StageIncomplete(_) => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_ingest(args),
        Commands::Report(args) => run_report(args),
        Commands::AdminSet(args) => match args.command {
            AdminSetCommand::Create(args) => run_admin_set_create(args),
        },
    }
}

fn run_ingest(args: RunArgs) -> miette::Result<()> {
    let explicit_output_dir = args.output_dir.clone();
    let overrides = ConfigOverrides {
        start_date: args.start_date,
        end_date: args.end_date,
        admin_set_title: args.admin_set,
        depositor: args.depositor,
        output_dir: args.output_dir,
        store_root: args.store_root,
    };
    let resolved = ConfigLoader::resolve(args.config.as_deref(), overrides)?;
    let settings = resolved.settings.clone();

    let store = LocalWorkStore::open(&settings.store_root, &settings.repository_base_url)?;
    let ncbi = NcbiHttpClient::new(&settings)?;
    let transfer = HttpMirrorTransfer::new()?;

    let report = if args.resume {
        let output_dir = explicit_output_dir
            .or_else(|| resolved.run.as_ref().map(|run| run.output_dir.clone()))
            .ok_or_else(|| {
                IngestError::ConfigParse("--resume needs --output-dir or a date range".to_string())
            })?;
        let notifier = FileNotifier::new(&RunLayout::new(&output_dir).summary);
        let coordinator = PubmedIngestCoordinator::new(ncbi, transfer, store, notifier, settings);
        coordinator.resume(&output_dir)?
    } else {
        let params = resolved.require_run()?.clone();
        let notifier = FileNotifier::new(&params.layout().summary);
        let coordinator = PubmedIngestCoordinator::new(ncbi, transfer, store, notifier, settings);
        coordinator.run(&params)?
    };

    JsonOutput::print_report(&report).into_diagnostic()?;
    Ok(())
}

fn run_report(args: ReportArgs) -> miette::Result<()> {
    let report = IngestReport::from_run_dir(&args.output_dir)?;
    JsonOutput::print_report(&report).into_diagnostic()?;
    Ok(())
}

fn run_admin_set_create(args: CreateAdminSetArgs) -> miette::Result<()> {
    let overrides = ConfigOverrides {
        store_root: args.store_root,
        ..ConfigOverrides::default()
    };
    let resolved = ConfigLoader::resolve(args.config.as_deref(), overrides)?;
    let settings = resolved.settings;
    let store = LocalWorkStore::open(&settings.store_root, &settings.repository_base_url)?;
    let admin_set = store.ensure_admin_set(&args.title)?;
    JsonOutput::print_admin_set(&admin_set).into_diagnostic()?;
    Ok(())
}
