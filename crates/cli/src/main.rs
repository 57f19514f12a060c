//! CLI entry point for the HLS packager
//!
//! Parses command line arguments, loads configuration and runs one conversion
//! (or one of the inspection commands).

use clap::{Args as ClapArgs, Parser, Subcommand};
use hls_packager::{
    check_tools, run_startup_checks, BaseUrlProvider, Config, ConversionJob, ConversionWorker,
    JobEvent, JobState,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "hls-packager.toml";

/// HLS Packager - encrypted HLS archives from source videos
#[derive(Parser, Debug)]
#[command(name = "hls-packager")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file [default: hls-packager.toml]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert one video into an encrypted HLS archive
    Convert(ConvertArgs),
    /// List configured base URLs
    BaseUrls,
    /// Check that the external tools are available
    Check,
}

#[derive(ClapArgs, Debug)]
struct ConvertArgs {
    /// Source video file
    input: PathBuf,

    /// Lesson id, first path segment of the key URL
    #[arg(long)]
    lesson_id: String,

    /// Asset name (defaults to the input file stem)
    #[arg(long)]
    name: Option<String>,

    /// Base URL the key is served from
    #[arg(long, conflicts_with = "base_url_index")]
    base_url: Option<String>,

    /// Pick a configured base URL by its position in `base-urls`
    #[arg(long)]
    base_url_index: Option<usize>,

    /// Directory receiving the archive (defaults to the input's directory)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Parent directory for job workspaces
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// Keep the job workspace after the job ends
    #[arg(long)]
    keep_intermediates: bool,

    /// Print the archive description as JSON
    #[arg(long)]
    json: bool,

    /// Skip startup checks (ffmpeg, ffprobe, openssl)
    #[arg(long)]
    skip_checks: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match args.command {
        Command::Convert(convert) => run_convert(config, convert).await,
        Command::BaseUrls => {
            let default = config.base_urls.default_base_url();
            for (i, url) in config.base_urls.list_base_urls().iter().enumerate() {
                let marker = if Some(url) == default.as_ref() { "*" } else { " " };
                println!("{} [{}] {}", marker, i, url);
            }
            ExitCode::SUCCESS
        }
        Command::Check => run_check(&config),
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<Config, hls_packager::config::ConfigError> {
    match path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(DEFAULT_CONFIG_PATH),
    }
}

fn run_check(config: &Config) -> ExitCode {
    let mut ok = true;
    for report in check_tools(config) {
        let status = match (&report.error, report.required) {
            (None, _) => "ok",
            (Some(_), true) => {
                ok = false;
                "MISSING"
            }
            (Some(_), false) => "missing (optional)",
        };
        println!(
            "{:<8} {:<20} {:<16} {}",
            report.tool,
            status,
            report.version.as_deref().unwrap_or("-"),
            report.path.display()
        );
        if let Some(error) = &report.error {
            println!("         {}", error);
        }
    }
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Pick the base URL from flags, falling back to the configured default
fn select_base_url(config: &Config, args: &ConvertArgs) -> Result<String, String> {
    if let Some(url) = &args.base_url {
        return Ok(url.clone());
    }
    let urls = config.base_urls.list_base_urls();
    if let Some(index) = args.base_url_index {
        return urls.get(index).cloned().ok_or_else(|| {
            format!("base URL index {} out of range ({} configured)", index, urls.len())
        });
    }
    config
        .base_urls
        .default_base_url()
        .ok_or_else(|| "no base URL configured; pass --base-url".to_string())
}

async fn run_convert(mut config: Config, args: ConvertArgs) -> ExitCode {
    if let Some(dir) = &args.output_dir {
        config.workspace.output_dir = Some(dir.clone());
    }
    if let Some(dir) = &args.scratch_dir {
        config.workspace.scratch_dir = Some(dir.clone());
    }
    if args.keep_intermediates {
        config.workspace.keep_intermediates = true;
    }

    if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
    } else if let Err(e) = run_startup_checks(&config) {
        eprintln!("Startup check failed: {}", e);
        return ExitCode::FAILURE;
    }

    let base_url = match select_base_url(&config, &args) {
        Ok(url) => url,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut job = ConversionJob::new(&args.input, &args.lesson_id, base_url);
    if let Some(name) = &args.name {
        job = job.with_asset_name(name);
    }
    info!(key_url = %job.key_url(), "Key URL");

    let worker = ConversionWorker::from_config(&config);
    let mut handle = match worker.start(job) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling conversion");
            cancel.cancel();
        }
    });

    while let Some(event) = handle.next_event().await {
        match event {
            JobEvent::Progress(p) => eprintln!("progress: {:>3}%", p),
            JobEvent::State(JobState::Failed { .. }) => {}
            JobEvent::State(state) => info!(state = state.as_str(), "Job state"),
        }
    }

    match handle.wait().await {
        Ok(bundle) => {
            if args.json {
                match serde_json::to_string_pretty(&bundle) {
                    Ok(json) => println!("{}", json),
                    Err(e) => {
                        eprintln!("Failed to serialize result: {}", e);
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                println!("{}", bundle.path.display());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
