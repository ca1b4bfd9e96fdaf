use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use one_client::app::{App, DatasetQuery, ListQuery, LoadOptions, SessionQuery};
use one_client::catalog::CatalogHttpClient;
use one_client::config::{Config, ConfigLoader};
use one_client::domain::{DateRange, IdKind, Qc};
use one_client::error::OneError;
use one_client::output::{JsonOutput, OutputMode, TextOutput};
use one_client::sync::Mode;

#[derive(Parser)]
#[command(name = "one")]
#[command(about = "Search, list and download datasets from a session-based data catalog")]
#[command(version)]
struct Cli {
    /// Parameter file; defaults to ONE_CONFIG or the user config directory.
    #[arg(long, global = true)]
    config: Option<String>,

    /// Override the configured refresh mode.
    #[arg(long, global = true, value_enum)]
    mode: Option<Mode>,

    #[arg(long, global = true)]
    json: bool,

    /// Treat selectors as globs rather than regular expressions.
    #[arg(long, global = true)]
    wildcards: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Write the parameter file")]
    Setup(SetupArgs),
    #[command(about = "Reload the cache tables from the catalog")]
    Refresh,
    #[command(about = "Search sessions")]
    Search(SearchArgs),
    #[command(about = "List datasets, of one session or of the whole cache")]
    List(ListArgs),
    #[command(about = "List collections")]
    Collections(SessionArg),
    #[command(about = "List revisions")]
    Revisions(SessionArg),
    #[command(about = "List subjects")]
    Subjects,
    #[command(about = "Download datasets of a session")]
    Load(LoadArgs),
    #[command(about = "Download every dataset of one collection")]
    LoadCollection(LoadCollectionArgs),
    #[command(about = "Download one dataset by its UUID")]
    LoadId(LoadIdArgs),
}

#[derive(Args)]
struct SetupArgs {
    #[arg(long)]
    base_url: String,
    #[arg(long)]
    data_server: Option<String>,
    #[arg(long)]
    object_store_url: Option<String>,
    #[arg(long)]
    cache_dir: Option<Utf8PathBuf>,
    #[arg(long)]
    tag: Option<String>,
}

#[derive(Args)]
struct SearchArgs {
    #[arg(long)]
    subject: Option<String>,
    #[arg(long)]
    lab: Option<String>,
    /// One date, or `FROM:TO` with either end optional.
    #[arg(long)]
    date: Option<String>,
    #[arg(long)]
    number: Option<u32>,
    #[arg(long)]
    task_protocol: Option<String>,
    #[arg(long)]
    project: Option<String>,
    #[arg(long = "dataset")]
    datasets: Vec<String>,
}

#[derive(Args)]
struct SessionArg {
    /// Session eid or `subject/date/number`.
    session: Option<String>,
}

#[derive(Args)]
struct ListArgs {
    session: Option<String>,
    #[arg(long)]
    dataset: Option<String>,
    #[arg(long)]
    collection: Option<String>,
    #[arg(long)]
    revision: Option<String>,
    /// Treat the revision as a cutoff rather than a pattern.
    #[arg(long)]
    last_before: bool,
    #[arg(long, default_value = "CRITICAL")]
    qc: String,
    #[arg(long)]
    ignore_qc_not_set: bool,
    #[arg(long)]
    include_missing: bool,
}

#[derive(Args)]
struct LoadArgs {
    session: String,
    /// Dataset selectors; each must resolve to exactly one dataset.
    #[arg(required_unless_present = "object")]
    datasets: Vec<String>,
    #[arg(long, conflicts_with = "datasets")]
    object: Option<String>,
    #[arg(long)]
    collection: Option<String>,
    #[arg(long)]
    revision: Option<String>,
    #[arg(long)]
    keep_uuid: bool,
    /// Leave unresolved datasets empty instead of failing.
    #[arg(long)]
    allow_missing: bool,
    /// Write the dataset or session ids of what was loaded to the cache directory.
    #[arg(long, value_enum)]
    save_ids: Option<IdKind>,
}

#[derive(Args)]
struct LoadCollectionArgs {
    session: String,
    collection: String,
    #[arg(long)]
    object: Option<String>,
    #[arg(long)]
    revision: Option<String>,
    #[arg(long)]
    keep_uuid: bool,
}

#[derive(Args)]
struct LoadIdArgs {
    id: Uuid,
    #[arg(long)]
    keep_uuid: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<OneError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &OneError) -> u8 {
    match error {
        OneError::NotFound(_) | OneError::TagNotFound(_) | OneError::MissingConfig => 2,
        OneError::Connection(_) | OneError::HttpStatus { .. } | OneError::Transfer(_) => 3,
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
    let output = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    if let Commands::Setup(args) = &cli.command {
        return run_setup(cli.config.as_deref(), args);
    }

    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }
    let refresh_mode = cli.mode.unwrap_or(Mode::Refresh);
    if matches!(cli.command, Commands::Refresh) {
        // refreshed explicitly below
        config.mode = Mode::Local;
    }
    let catalog = CatalogHttpClient::new(&config.base_url)?;
    let backends = App::<CatalogHttpClient>::default_backends(&config)?;
    let mut app = App::open(config, catalog, backends)?.with_wildcards(cli.wildcards);

    match cli.command {
        Commands::Setup(_) => Ok(()),
        Commands::Refresh => {
            let result = app.refresh(refresh_mode)?;
            match output {
                OutputMode::Json => JsonOutput::print_refresh(&result).into_diagnostic(),
                OutputMode::Text => {
                    match result.loaded_time {
                        Some(loaded) => println!("cache loaded {loaded}"),
                        None => println!("cache is empty"),
                    }
                    Ok(())
                }
            }
        }
        Commands::Search(args) => {
            let query = SessionQuery {
                subject: args.subject,
                lab: args.lab,
                date_range: args.date.as_deref().map(parse_date_range).transpose()?,
                number: args.number,
                task_protocol: args.task_protocol,
                project: args.project,
                datasets: args.datasets,
            };
            let sessions = app.search(&query)?;
            match output {
                OutputMode::Json => JsonOutput::print_sessions(&sessions).into_diagnostic(),
                OutputMode::Text => TextOutput::print_sessions(&sessions).into_diagnostic(),
            }
        }
        Commands::List(args) => {
            let eid = args
                .session
                .as_deref()
                .map(|session| app.to_eid(session))
                .transpose()?;
            let query = ListQuery {
                dataset: args.dataset.as_deref().map(Into::into).unwrap_or_default(),
                collection: args.collection,
                revision: args.revision,
                revision_last_before: args.last_before,
                qc_threshold: args.qc.parse::<Qc>()?,
                ignore_qc_not_set: args.ignore_qc_not_set,
                include_missing: args.include_missing,
            };
            let datasets = app.list_datasets(eid.as_ref(), &query)?;
            match output {
                OutputMode::Json => JsonOutput::print_datasets(&datasets).into_diagnostic(),
                OutputMode::Text => TextOutput::print_datasets(&datasets).into_diagnostic(),
            }
        }
        Commands::Collections(args) => {
            let eid = args
                .session
                .as_deref()
                .map(|session| app.to_eid(session))
                .transpose()?;
            print_lines(output, &app.list_collections(eid.as_ref()))
        }
        Commands::Revisions(args) => {
            let eid = args
                .session
                .as_deref()
                .map(|session| app.to_eid(session))
                .transpose()?;
            print_lines(output, &app.list_revisions(eid.as_ref()))
        }
        Commands::Subjects => print_lines(output, &app.list_subjects()),
        Commands::Load(args) => run_load(&mut app, args, output),
        Commands::LoadCollection(args) => {
            let eid = app.to_eid(&args.session)?;
            let options = LoadOptions {
                keep_uuid: args.keep_uuid,
            };
            let files = app.load_collection(
                &eid,
                &args.collection,
                args.object.as_deref(),
                args.revision.as_deref(),
                &options,
            )?;
            app.save()?;
            let lines = files.iter().map(ToString::to_string).collect::<Vec<_>>();
            print_lines(output, &lines)
        }
        Commands::LoadId(args) => {
            let options = LoadOptions {
                keep_uuid: args.keep_uuid,
            };
            let file = app.load_dataset_from_id(&args.id, &options)?;
            app.save()?;
            print_lines(output, &[file.to_string()])
        }
    }
}

fn run_setup(path: Option<&str>, args: &SetupArgs) -> miette::Result<()> {
    let target = match path {
        Some(path) => Utf8PathBuf::from(path),
        None => ConfigLoader::default_path()?,
    };
    let mut config = Config::new(args.base_url.clone());
    config.data_server = args.data_server.clone();
    config.object_store_url = args.object_store_url.clone();
    config.cache_dir = args.cache_dir.clone();
    config.tag = args.tag.clone();
    // validate before writing
    ConfigLoader::resolve_config(config.clone(), Default::default())?;
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent.as_std_path()).into_diagnostic()?;
    }
    ConfigLoader::write(&target, &config)?;
    info!(path = %target, "wrote parameter file");
    println!("{target}");
    Ok(())
}

fn run_load(
    app: &mut App<CatalogHttpClient>,
    args: LoadArgs,
    output: OutputMode,
) -> miette::Result<()> {
    let eid = app.to_eid(&args.session)?;
    let options = LoadOptions {
        keep_uuid: args.keep_uuid,
    };
    if args.save_ids.is_some() {
        app.ledger_mut().set_enabled(true);
    }

    if let Some(object) = &args.object {
        let files = app.load_object(
            &eid,
            object,
            args.collection.as_deref(),
            args.revision.as_deref(),
            &options,
        )?;
        let lines = files.iter().map(ToString::to_string).collect::<Vec<_>>();
        print_lines(output, &lines)?;
    } else {
        let queries = args
            .datasets
            .iter()
            .map(|dataset| DatasetQuery {
                dataset: dataset.as_str().into(),
                collection: args.collection.clone(),
                revision: args.revision.clone(),
            })
            .collect::<Vec<_>>();
        let result = app.load_datasets(&eid, &queries, !args.allow_missing, &options)?;
        match output {
            OutputMode::Json => JsonOutput::print_load(&result).into_diagnostic()?,
            OutputMode::Text => TextOutput::print_load(&result).into_diagnostic()?,
        }
    }

    app.save()?;
    if let Some(kind) = args.save_ids {
        let export = app.save_loaded_ids(kind == IdKind::Sessions, true)?;
        if let Some(file) = export.file {
            info!(%file, ids = export.ids.len(), "saved loaded ids");
        }
    }
    Ok(())
}

fn print_lines(output: OutputMode, lines: &[String]) -> miette::Result<()> {
    match output {
        OutputMode::Json => JsonOutput::print_json(lines).into_diagnostic(),
        OutputMode::Text => TextOutput::print_lines(lines).into_diagnostic(),
    }
}

fn parse_date_range(value: &str) -> Result<DateRange, OneError> {
    fn bound(raw: &str) -> Option<&str> {
        let raw = raw.trim();
        (!raw.is_empty()).then_some(raw)
    }

    match value.split_once(':') {
        Some((from, to)) => DateRange::parse(&[bound(from), bound(to)]),
        None => DateRange::parse(&[Some(value)]),
    }
}
