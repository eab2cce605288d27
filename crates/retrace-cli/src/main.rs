mod banner;
mod capture;
mod config;
mod error;
mod inspect;
mod record;
mod replay;
mod server;
#[cfg(test)]
mod testutil;
mod websocket;

use anyhow::Context;
use capture::EndpointContext;
use clap::{Parser, Subcommand};
use config::Config;
use record::Recorder;
use replay::Replayer;
use retrace_core::{Redactor, Store};
use server::Engine;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Comma separated secrets scrubbed from everything written or hashed.
const SECRETS_ENV: &str = "RETRACE_SECRETS";

#[derive(Parser)]
#[command(name = "retrace", version, about = "Record and replay HTTP and WebSocket traffic for tests")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Forward to the real targets and record every exchange
    Record(RunArgs),
    /// Serve recorded exchanges without contacting any target
    Replay(RunArgs),
    /// Summarize a recording file (.json, .req, .resp or .websocket.log)
    Inspect {
        file: PathBuf,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Endpoint configuration file
    #[arg(short, long, default_value = "retrace.toml")]
    config: PathBuf,
    /// Directory holding the recordings
    #[arg(short, long, default_value = "recordings")]
    recording_dir: PathBuf,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Record,
    Replay,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::Record => "record",
            Mode::Replay => "replay",
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "retrace_cli=info,retrace_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(mode: Mode, args: RunArgs) -> anyhow::Result<()> {
    let config = Config::load(&args.config)?;
    let endpoints = config.compile_endpoints()?;

    let secrets = std::env::var(SECRETS_ENV).unwrap_or_default();
    let redactor = Arc::new(
        Redactor::from_comma_separated(&secrets)
            .with_context(|| format!("invalid secret list in {}", SECRETS_ENV))?,
    );
    if mode == Mode::Record {
        std::fs::create_dir_all(&args.recording_dir).with_context(|| {
            format!("creating recording dir {}", args.recording_dir.display())
        })?;
    }
    let store = Store::new(&args.recording_dir, config.layout);

    // Every port is bound before anything is served.
    let mut listeners = Vec::with_capacity(endpoints.len());
    for endpoint in &endpoints {
        listeners.push(server::bind(endpoint)?);
    }

    banner::print_startup(mode.as_str(), &args.recording_dir, config.layout, &endpoints);
    tracing::info!(
        mode = mode.as_str(),
        endpoints = endpoints.len(),
        secrets = redactor.is_active(),
        "starting"
    );

    let mut tasks = JoinSet::new();
    for (endpoint, listener) in endpoints.into_iter().zip(listeners) {
        let ctx = EndpointContext {
            endpoint: Arc::new(endpoint),
            store: store.clone(),
            redactor: redactor.clone(),
        };
        let engine = match mode {
            Mode::Record => Engine::Record(Arc::new(Recorder::new(ctx)?)),
            Mode::Replay => Engine::Replay(Arc::new(Replayer::new(ctx))),
        };
        tasks.spawn(server::serve(listener, engine));
    }

    while let Some(result) = tasks.join_next().await {
        result.context("listener task failed")??;
    }
    eprintln!("\n[retrace] shut down");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Record(args) => {
            init_tracing();
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run(Mode::Record, args))?;
        }
        Commands::Replay(args) => {
            init_tracing();
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run(Mode::Replay, args))?;
        }
        Commands::Inspect { file } => {
            print!("{}", inspect::describe(&file)?);
        }
    }

    Ok(())
}
