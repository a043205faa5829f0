use std::process;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use pipewrench::channel::SpawnError;
use pipewrench::exit;
use pipewrench::intercept::{InterceptConfig, Interceptor};
use pipewrench::stream::{PipelineError, run_pipeline};

#[derive(Parser, Debug)]
#[command(
    name = "pipewrench",
    version,
    about = "Pipes HTTP message bodies through an external filter command"
)]
struct Cli {
    /// Shell command executed for each intercepted message body.
    #[arg(short = 'c', long = "command")]
    command: String,

    /// Case-insensitive glob matched against Content-Type; non-matching
    /// messages pass through untouched.
    #[arg(short = 't', long = "content-type", value_name = "PATTERN")]
    content_type: Option<String>,

    /// Kill the filter and fail if it has not finished within this many
    /// seconds of end-of-message.
    #[arg(long = "drain-timeout", value_name = "SECS")]
    drain_timeout: Option<u64>,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    exit::OK
                }
                _ => exit::USAGE,
            };
            let _ = e.print();
            process::exit(code);
        }
    };

    init_tracing();

    let mut config = InterceptConfig::new(cli.command);
    if let Some(pattern) = &cli.content_type {
        config = match config.with_content_type(pattern) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: invalid content-type pattern: {e}");
                process::exit(exit::USAGE);
            }
        };
    }
    if let Some(secs) = cli.drain_timeout {
        config = config.with_drain_timeout(Duration::from_secs(secs));
    }

    // The pipeline is strictly sequential; one thread is the point.
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            process::exit(exit::OSERR);
        }
    };

    process::exit(runtime.block_on(run(config)));
}

async fn run(config: InterceptConfig) -> i32 {
    let mut interceptor = match Interceptor::new(tokio::io::stdout(), config) {
        Ok(interceptor) => interceptor,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start filter process");
            return spawn_exit_code(&e);
        }
    };

    let mut stdin = tokio::io::stdin();
    match run_pipeline(&mut stdin, &mut interceptor).await {
        Ok(()) => exit::OK,
        Err(e) => {
            tracing::error!(error = %e, "Pipeline failed");
            pipeline_exit_code(&e)
        }
    }
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("warn")
    };
    // stdout carries the rewritten HTTP stream; logs go to stderr.
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));
    let _ = subscriber.try_init();
}

fn spawn_exit_code(err: &SpawnError) -> i32 {
    match err {
        SpawnError::Spawn(io) if io.kind() == std::io::ErrorKind::NotFound => exit::OSERR,
        _ => exit::UNAVAILABLE,
    }
}

fn pipeline_exit_code(err: &PipelineError) -> i32 {
    match err {
        PipelineError::Spawn(e) => spawn_exit_code(e),
        PipelineError::Io(_) | PipelineError::Parse(_) | PipelineError::DrainTimeout => exit::IOERR,
    }
}
