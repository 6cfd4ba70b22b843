use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::Value;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

use genvid_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use genvid_core::logging::{
    self, FileSink, LoggingInitOptions, LoggingInitPlan, RuntimeLogMode, DEFAULT_LOG_FILTER,
};
use genvid_core::manager::{TaskManager, TaskOptions};
use genvid_core::server::{app_router, AppState};
use genvid_core::task::{GenerationRequest, ProgressCallback, ProgressEvent, TaskStatus};

#[derive(Parser)]
#[command(
    name = "genvid",
    about = "Asynchronous AI video generation task service",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit one generation task, wait for it and print the final record.
    Generate(GenerateArgs),
}

#[derive(Args)]
struct GenerateArgs {
    #[arg(short, long, help = "Provider model tag (sora2, veo, seedance, newmodel)")]
    model: String,
    #[arg(long)]
    prompt: String,
    #[arg(long, help = "Reference image URL, data URI or local path")]
    image: Option<String>,
    #[arg(long)]
    duration: Option<u32>,
    #[arg(long = "aspect-ratio")]
    aspect_ratio: Option<String>,
    #[arg(long)]
    resolution: Option<String>,
    #[arg(
        long = "param",
        value_name = "KEY=VALUE",
        help = "Provider-specific parameter (repeatable). VALUE is parsed as JSON, else kept as a string"
    )]
    params: Vec<String>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = if cli.command.is_some() {
        RuntimeLogMode::Cli
    } else {
        RuntimeLogMode::Server
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(mode, Some(resolved_data_dir.as_path()));

    match cli.command {
        Some(Commands::Generate(args)) => run_generate(args, resolved_data_dir).await,
        None => run_server(cli.port, cli.host, resolved_data_dir).await,
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let LoggingInitPlan { filters, file_sink } = logging::compose_logging_init_plan(&init_options);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(logging::redacting_make_writer(std::io::stderr))
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));

    match file_sink {
        FileSink::Rolling { log_dir, appender } => {
            let subscriber = tracing_subscriber::registry().with(console_layer).with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(logging::redacting_make_writer(appender))
                    .with_filter(parse_env_filter_with_fallback(&filters.file, "file")),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }
            debug!(log_dir = %log_dir.display(), "Persistent file logging enabled");
        }
        FileSink::ConsoleOnly {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            let attempted_log_dir = attempted_log_dir
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(mode: RuntimeLogMode, data_dir: Option<&Path>) {
    let pid = std::process::id();
    if let Some(data_dir) = data_dir {
        let cfg_path = config_path(data_dir);
        info!(
            mode = mode.as_str(),
            pid,
            data_dir = %data_dir.display(),
            config_path = %cfg_path.display(),
            "Runtime startup metadata"
        );
    } else {
        info!(mode = mode.as_str(), pid, "Runtime startup metadata");
    }
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let mut config = match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    config.apply_env_overrides();
    config
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    let config = load_config(&data_dir);

    let port = port_override
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let tasks = TaskManager::from_config(&config);
    if let Some(max_age) = config.retention() {
        let every = (max_age / 10).max(Duration::from_secs(60));
        tasks.spawn_retention_sweeper(every, max_age);
    }

    let app = app_router(AppState::new(tasks));

    let addr = format!("{host}:{port}");
    info!(
        %addr,
        max_concurrent = config.tasks.max_concurrent,
        "Starting genvid server"
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_generate(args: GenerateArgs, data_dir: PathBuf) -> Result<()> {
    let config = load_config(&data_dir);
    let request = build_request(&args)?;

    let tasks = TaskManager::from_config(&config);
    let options = TaskOptions::default().callback(progress_printer());
    let task_id = tasks
        .create_task_with(request, options)
        .context("Task rejected")?;

    info!(task_id = %task_id, model = %args.model, "Waiting for generation task");
    tasks.wait_for(&task_id).await;
    eprintln!();

    let record = tasks
        .get_task_status(&task_id)
        .with_context(|| format!("task {task_id} disappeared before completion"))?;
    println!("{}", serde_json::to_string_pretty(&record)?);

    match record.status {
        TaskStatus::Completed => Ok(()),
        status => bail!(
            "task {task_id} ended {status}: {}",
            record.error.as_deref().unwrap_or("no error reported")
        ),
    }
}

fn build_request(args: &GenerateArgs) -> Result<GenerationRequest> {
    let mut request = GenerationRequest::new(args.model.as_str(), args.prompt.as_str());
    if let Some(image) = &args.image {
        request = request.with_image(image.as_str());
    }
    if let Some(duration) = args.duration {
        request = request.with_duration(duration);
    }
    if let Some(aspect_ratio) = &args.aspect_ratio {
        request = request.with_aspect_ratio(aspect_ratio.as_str());
    }
    if let Some(resolution) = &args.resolution {
        request = request.with_resolution(resolution.as_str());
    }
    for item in &args.params {
        let (key, value) = parse_param(item)?;
        request = request.with_param(key, value);
    }
    Ok(request)
}

fn parse_param(item: &str) -> Result<(String, Value)> {
    let (key, raw) = item
        .split_once('=')
        .with_context(|| format!("invalid --param format '{item}' (expected KEY=VALUE)"))?;
    let key = key.trim();
    if key.is_empty() {
        bail!("invalid --param format '{item}' (empty KEY)");
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

fn progress_printer() -> ProgressCallback {
    Arc::new(|event: &ProgressEvent| -> Result<()> {
        eprint!("\r{}", format_progress(event));
        Ok(())
    })
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn format_progress(event: &ProgressEvent) -> String {
    let filled = usize::from(event.progress.min(100)) * PROGRESS_BAR_WIDTH / 100;
    let bar = "█".repeat(filled) + &"░".repeat(PROGRESS_BAR_WIDTH - filled);
    if event.message.is_empty() {
        format!("[{bar}] {:3}% {}    ", event.progress, event.status)
    } else {
        format!(
            "[{bar}] {:3}% {} | {}    ",
            event.progress, event.status, event.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(params: &[&str]) -> GenerateArgs {
        GenerateArgs {
            model: "sora2".to_string(),
            prompt: "a lighthouse at dusk".to_string(),
            image: None,
            duration: Some(15),
            aspect_ratio: Some("9:16".to_string()),
            resolution: None,
            params: params.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn param_values_parse_as_json_or_fall_back_to_string() {
        assert_eq!(parse_param("hd=true").unwrap(), ("hd".to_string(), json!(true)));
        assert_eq!(parse_param("duration=25").unwrap().1, json!(25));
        assert_eq!(
            parse_param("model=sora-2-pro").unwrap().1,
            json!("sora-2-pro")
        );
        assert_eq!(
            parse_param("images=[\"https://x/a.png\"]").unwrap().1,
            json!(["https://x/a.png"])
        );
        assert_eq!(parse_param("notify_hook=").unwrap().1, json!(""));
    }

    #[test]
    fn malformed_params_are_rejected() {
        assert!(parse_param("hd").is_err());
        assert!(parse_param("=true").is_err());
    }

    #[test]
    fn request_carries_cli_overrides() {
        let request = build_request(&args(&["hd=false", "private=true"])).unwrap();

        assert_eq!(request.model.as_str(), "sora2");
        assert_eq!(request.duration, Some(15));
        assert_eq!(request.aspect_ratio.as_deref(), Some("9:16"));
        assert_eq!(request.resolution.as_deref(), Some("1080p"));
        assert_eq!(request.extra_params["hd"], json!(false));
        assert_eq!(request.extra_params["private"], json!(true));
    }

    #[test]
    fn progress_line_scales_bar_and_includes_message() {
        let event = ProgressEvent {
            task_id: "t1".to_string(),
            progress: 50,
            status: TaskStatus::Processing,
            message: "rendering".to_string(),
        };
        let line = format_progress(&event);
        assert!(line.contains(&"█".repeat(15)));
        assert!(line.contains(" 50% processing | rendering"));
    }

    #[test]
    fn cli_parses_generate_subcommand() {
        let cli = Cli::try_parse_from([
            "genvid",
            "generate",
            "--model",
            "veo",
            "--prompt",
            "waves",
            "--param",
            "seed=7",
            "-v",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 1);
        match cli.command {
            Some(Commands::Generate(args)) => {
                assert_eq!(args.model, "veo");
                assert_eq!(args.params, vec!["seed=7".to_string()]);
            }
            None => panic!("expected generate subcommand"),
        }
    }

    #[test]
    fn cli_without_subcommand_runs_server() {
        let cli = Cli::try_parse_from(["genvid", "--port", "9000"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(9000));
    }
}
