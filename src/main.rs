use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use syncagent::agent::{Agent, AgentExit};
use syncagent::config::resolve_config_path;
use syncagent::pipeline::Pipeline;
use syncagent::sync::fingerprint::Fingerprinter;
use syncagent::sync::section::SentinelEditor;
use syncagent::sync::SyncSettings;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "syncagent")]
#[command(
    about = "Metrics-shipping agent that keeps its configuration and binary in sync with a control server"
)]
#[command(version)]
struct Cli {
    /// Configuration file (default: /etc/syncagent/syncagent.conf if it exists, otherwise ~/.config/syncagent/syncagent.conf)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run in agent mode (gather, ship metrics, sync configuration)
    Agent {
        /// Run a single gather and sync cycle, then exit
        #[arg(long)]
        once: bool,
    },
    /// Load the configuration, gather once and print the metrics
    Test,
    /// Print the fingerprint of the managed section
    Fingerprint,
}

fn init_tracing(verbose: bool, debug: bool) {
    let default_level = if debug {
        "debug"
    } else if verbose {
        "info"
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // stdout carries `test` and `fingerprint` output
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.debug);

    let config_path = resolve_config_path(cli.config);

    match cli.command {
        Commands::Agent { once } => {
            info!("Starting agent mode with config: {}", config_path.display());

            let pipeline = Pipeline::load(&config_path)?;
            let status_port = pipeline.config().agent.status_port;
            let mut agent = Agent::new(pipeline)?;

            if let Some(port) = status_port {
                if let Err(e) = agent.status().serve(port).await {
                    error!("{:#}", e);
                }
            }

            let exit = if once {
                agent.run_once().await
            } else {
                agent.run_event_loop().await?
            };

            match exit {
                AgentExit::Shutdown => info!("Agent stopped"),
                AgentExit::Restart(reason) => info!("Agent exiting for restart: {}", reason),
            }
        }
        Commands::Test => {
            let mut pipeline = Pipeline::load(&config_path)?;
            let metrics = pipeline.gather();
            let body = pipeline.config().agent.data_format.serialize(&metrics)?;

            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&body)?;
            stdout.flush()?;
        }
        Commands::Fingerprint => {
            // Only the sentinel settings are needed, so a file that no longer
            // parses can still be fingerprinted
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            let http = toml::from_str::<syncagent::config::AgentFileConfig>(&contents)
                .ok()
                .and_then(|c| c.outputs.http)
                .unwrap_or_default();
            let settings = SyncSettings::from_config(&config_path, &http);

            let fingerprinter =
                Fingerprinter::new(Arc::new(SentinelEditor::new(settings.sentinels)));
            let fingerprint = fingerprinter.fingerprint(&settings.config_path)?;
            println!("{}", fingerprint);
        }
    }

    Ok(())
}
