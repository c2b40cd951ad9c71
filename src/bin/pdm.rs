use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use pipeline_data_manager::config::LoadedConfig;
use pipeline_data_manager::downloader::Downloader;
use pipeline_data_manager::error::PipelineError;
use pipeline_data_manager::registry::{HttpRegistryClient, QueryCache};
use pipeline_data_manager::settings;
use pipeline_data_manager::uploader;

#[derive(Parser)]
#[command(name = "pdm")]
#[command(about = "Provenance-tracked data pipeline manager")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Resolve and download the read blocks of a run config")]
    Download(DownloadArgs),
    #[command(about = "POST/PATCH entity definitions from a config file")]
    Upload(UploadArgs),
    #[command(about = "Push an access log to the registry as a new run")]
    PushRun(PushRunArgs),
}

#[derive(Args, Clone)]
struct RegistryArgs {
    #[arg(
        long = "data-registry",
        help = "URL of the data registry API, defaults to the DATA_REGISTRY_URL env variable"
    )]
    data_registry: Option<String>,

    #[arg(
        long,
        help = "registry access token, defaults to the DATA_REGISTRY_ACCESS_TOKEN env variable"
    )]
    token: Option<String>,
}

#[derive(Args)]
struct DownloadArgs {
    #[arg(long, help = "path to the yaml config file")]
    config: String,

    #[command(flatten)]
    registry: RegistryArgs,
}

#[derive(Args)]
struct UploadArgs {
    #[arg(long, help = "path to the yaml config file")]
    config: String,

    #[command(flatten)]
    registry: RegistryArgs,
}

#[derive(Args)]
struct PushRunArgs {
    #[arg(long, help = "path to the access yaml file")]
    config: String,

    #[arg(long = "remote-uri", short = 'u', help = "URI to the root of the storage")]
    remote_uri: String,

    #[arg(
        long = "remote-option",
        short = 'o',
        num_args = 2,
        value_names = ["KEY", "VALUE"],
        help = "(key, value) pairs passed to the remote storage, e.g. credentials"
    )]
    remote_option: Vec<String>,

    #[arg(
        long,
        default_value = "0",
        help = "accessibility of the uploaded data, 0 is public"
    )]
    accessibility: String,

    #[command(flatten)]
    registry: RegistryArgs,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<PipelineError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &PipelineError) -> u8 {
    match error {
        PipelineError::Lookup(_) | PipelineError::AmbiguousResult { .. } => 2,
        PipelineError::RegistryHttp(_)
        | PipelineError::RegistryStatus { .. }
        | PipelineError::RegistryData(_)
        | PipelineError::Transport(_)
        | PipelineError::UnsupportedProtocol { .. } => 3,
        PipelineError::HashMismatch { .. } => 4,
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
    match cli.command {
        Commands::Download(args) => run_download(args),
        Commands::Upload(args) => run_upload(args),
        Commands::PushRun(args) => run_push_run(args),
    }
}

fn registry_client(
    args: &RegistryArgs,
    require_token: bool,
) -> Result<HttpRegistryClient, PipelineError> {
    let url = settings::registry_url(args.data_registry.as_deref());
    let token = settings::access_token(args.token.as_deref());
    if require_token && token.is_none() {
        return Err(PipelineError::MissingToken);
    }
    HttpRegistryClient::new(url, token, QueryCache::new())
}

fn run_download(args: DownloadArgs) -> miette::Result<()> {
    let config_path = Utf8PathBuf::from(args.config);
    let loaded = LoadedConfig::load(&config_path).into_diagnostic()?;
    let requests = loaded.read_requests().into_diagnostic()?;
    if requests.is_empty() {
        return Err(miette::Report::msg(
            "no read config specified in configuration file",
        ));
    }
    let client = registry_client(&args.registry, false).into_diagnostic()?;
    let mut downloader = Downloader::new(
        client,
        loaded.normalised_data_directory(),
        settings::remote_options(),
    );
    for request in requests {
        downloader.add_request(request);
    }
    downloader.download(true).into_diagnostic()?;
    Ok(())
}

fn run_upload(args: UploadArgs) -> miette::Result<()> {
    let client = registry_client(&args.registry, true).into_diagnostic()?;
    let config_path = Utf8PathBuf::from(args.config);
    uploader::upload_from_config_file(&client, &config_path).into_diagnostic()?;
    Ok(())
}

fn run_push_run(args: PushRunArgs) -> miette::Result<()> {
    let client = registry_client(&args.registry, true).into_diagnostic()?;
    let mut remote_options = settings::remote_options();
    for pair in args.remote_option.chunks(2) {
        if let [name, value] = pair {
            remote_options.insert(name.clone(), value.clone());
        }
    }
    let access_log_path = Utf8PathBuf::from(args.config);
    uploader::push_run(
        &client,
        &access_log_path,
        &args.remote_uri,
        &remote_options,
        &args.accessibility,
    )
    .into_diagnostic()?;
    Ok(())
}
