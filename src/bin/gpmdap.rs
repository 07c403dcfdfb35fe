use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gpmdap::app::{App, FailurePolicy, RetrievalOptions, RetrievalRequest};
use gpmdap::config::{CONFIG_FILE, ConfigLoader, Credentials, ResolvedConfig};
use gpmdap::domain::{BoundingBox, DateRange, VariableSelection};
use gpmdap::error::GpmError;
use gpmdap::output::{
    JsonOutput, OutputMode, ProductListing, RetrievalSummary, StderrProgress, print_human_summary,
};
use gpmdap::registry::Registry;
use gpmdap::session::{EarthdataSession, SessionConfig};
use gpmdap::store::{CacheLayout, FileGranuleStore};

#[derive(Parser)]
#[command(name = "gpmdap")]
#[command(about = "Retrieve, subset and cache NASA GPM precipitation grids over OPeNDAP")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download, cache and merge granules for a request")]
    Get(GetArgs),
    #[command(about = "List the granule URLs a request resolves to")]
    Urls(RequestArgs),
    #[command(about = "List missions, products and variables")]
    Products(RegistryArgs),
}

#[derive(Args, Clone)]
struct RegistryArgs {
    #[arg(long, help = "Registry JSON replacing the built-in mission table.")]
    registry: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct RequestArgs {
    #[arg(long, help = "Request file (defaults to ./gpmdap.json when present).")]
    config: Option<String>,

    #[arg(long)]
    mission: Option<String>,

    #[arg(long)]
    product: Option<String>,

    #[arg(long = "product-version")]
    version: Option<u32>,

    #[arg(long, help = "Comma-separated variable names.")]
    variables: Option<VariableSelection>,

    #[arg(long, help = "Inclusive range, e.g. 2020-01-01..2020-01-31.")]
    dates: Option<DateRange>,

    #[arg(long, allow_hyphen_values = true, help = "min_lat,max_lat,min_lon,max_lon")]
    bbox: Option<BoundingBox>,

    #[arg(long)]
    concurrency: Option<usize>,

    #[arg(long, help = "Record failed dates and granules instead of aborting.")]
    skip_failed: bool,

    #[command(flatten)]
    registry: RegistryArgs,
}

#[derive(Args, Clone)]
struct GetArgs {
    #[command(flatten)]
    request: RequestArgs,

    #[arg(long)]
    cache_dir: Option<Utf8PathBuf>,

    #[arg(long, help = "Earthdata credentials file (defaults to ./.earthdata_credentials).")]
    credentials: Option<PathBuf>,

    #[arg(long)]
    deadline_secs: Option<u64>,

    #[arg(long, help = "Narrow the remote query to the requested variables.")]
    requested_only: bool,

    #[arg(long, help = "Write the merged grids as JSON.")]
    output: Option<Utf8PathBuf>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<GpmError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &GpmError) -> u8 {
    match error {
        GpmError::InvalidRequest(_)
        | GpmError::InvalidBoundingBox(_)
        | GpmError::EmptyRetrieval(_)
        | GpmError::MissingConfig
        | GpmError::ConfigRead(_)
        | GpmError::ConfigParse(_) => 2,
        GpmError::CatalogUnavailable { .. }
        | GpmError::GranuleFetchFailed { .. }
        | GpmError::CatalogParse(_)
        | GpmError::Http(_)
        | GpmError::HttpStatus { .. }
        | GpmError::Auth(_)
        | GpmError::Dap(_) => 3,
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
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    match cli.command {
        Commands::Get(args) => run_get(args, output_mode),
        Commands::Urls(args) => run_urls(args, output_mode),
        Commands::Products(args) => run_products(args, output_mode),
    }
}

fn run_get(args: GetArgs, output_mode: OutputMode) -> miette::Result<()> {
    let mut resolved = resolve_request(&args.request)?;
    if let Some(deadline) = args.deadline_secs {
        resolved.options.deadline = Some(Duration::from_secs(deadline));
    }
    if args.requested_only {
        resolved.options.cache_full_product = false;
    }
    let registry = load_registry(resolved.registry.as_deref())?;
    let layout = match args.cache_dir.or(resolved.cache_dir.clone()) {
        Some(root) => CacheLayout::new_with_root(root),
        None => CacheLayout::new()?,
    };

    let mission = registry.mission(&resolved.request.mission)?;
    let credentials = Credentials::load(args.credentials.as_deref())?;
    let session = EarthdataSession::login(
        &credentials.username,
        &credentials.password,
        &mission.opendap_root(),
    )?;
    info!(cache = %layout.root(), "session ready");

    let app = App::new(
        registry,
        layout,
        session.clone(),
        session,
        FileGranuleStore,
    );
    let result = match output_mode {
        OutputMode::NonInteractive => {
            app.get_data(&resolved.request, &resolved.options, &JsonOutput)?
        }
        OutputMode::Interactive => {
            app.get_data(&resolved.request, &resolved.options, &StderrProgress)?
        }
    };

    if let Some(path) = &args.output {
        JsonOutput::write_result(path, &result).into_diagnostic()?;
    }
    let summary = RetrievalSummary::from_result(&result);
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_summary(&summary).into_diagnostic()?,
        OutputMode::Interactive => print_human_summary(&summary),
    }
    Ok(())
}

fn run_urls(args: RequestArgs, output_mode: OutputMode) -> miette::Result<()> {
    let resolved = resolve_request(&args)?;
    let registry = load_registry(resolved.registry.as_deref())?;
    let session = EarthdataSession::anonymous(SessionConfig::default())?;
    let layout = CacheLayout::new()?;
    let app = App::new(
        registry,
        layout,
        session.clone(),
        session,
        FileGranuleStore,
    );

    match output_mode {
        OutputMode::NonInteractive => {
            let urls = app.resolve_urls(&resolved.request, &resolved.options, &JsonOutput)?;
            JsonOutput::print_urls(&urls).into_diagnostic()?;
        }
        OutputMode::Interactive => {
            let urls = app.resolve_urls(&resolved.request, &resolved.options, &StderrProgress)?;
            for url in urls.urls() {
                println!("{url}");
            }
            for failure in &urls.failures {
                eprintln!("skipped {}: {}", failure.target, failure.reason);
            }
        }
    }
    Ok(())
}

fn run_products(args: RegistryArgs, output_mode: OutputMode) -> miette::Result<()> {
    let registry = load_registry(args.registry.as_deref())?;
    let listing = ProductListing::from_registry(&registry);
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_products(&listing).into_diagnostic()?,
        OutputMode::Interactive => {
            for mission in &listing.missions {
                println!(
                    "{} ({}, default version {:02})",
                    mission.name, mission.base_url, mission.default_version
                );
                for product in &mission.products {
                    println!("  {}: {}", product.name, product.variables.join(", "));
                }
            }
        }
    }
    Ok(())
}

fn load_registry(path: Option<&Path>) -> Result<Arc<Registry>, GpmError> {
    let registry = match path {
        Some(path) => Registry::load(path)?,
        None => Registry::builtin()?,
    };
    Ok(Arc::new(registry))
}

fn resolve_request(args: &RequestArgs) -> Result<ResolvedConfig, GpmError> {
    let use_file = args.config.is_some() || Path::new(CONFIG_FILE).exists();
    let mut resolved = if use_file {
        ConfigLoader::resolve(args.config.as_deref())?
    } else {
        let (Some(product), Some(variables), Some(dates)) =
            (&args.product, &args.variables, &args.dates)
        else {
            return Err(GpmError::MissingConfig);
        };
        ResolvedConfig {
            schema_version: 1,
            request: RetrievalRequest {
                mission: "gpm".to_string(),
                product: product.clone(),
                version: None,
                variables: variables.clone(),
                dates: *dates,
                bbox: BoundingBox::global(),
            },
            options: RetrievalOptions::default(),
            cache_dir: None,
            registry: None,
        }
    };

    let request = &mut resolved.request;
    if let Some(mission) = &args.mission {
        request.mission = mission.clone();
    }
    if let Some(product) = &args.product {
        request.product = product.clone();
    }
    if let Some(version) = args.version {
        request.version = Some(version);
    }
    if let Some(variables) = &args.variables {
        request.variables = variables.clone();
    }
    if let Some(dates) = args.dates {
        request.dates = dates;
    }
    if let Some(bbox) = args.bbox {
        request.bbox = bbox;
    }
    if let Some(concurrency) = args.concurrency {
        resolved.options.concurrency = concurrency;
    }
    if args.skip_failed {
        resolved.options.failure_policy = FailurePolicy::SkipAndReport;
    }
    if let Some(path) = &args.registry.registry {
        resolved.registry = Some(path.clone());
    }
    Ok(resolved)
}
