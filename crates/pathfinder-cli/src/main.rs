use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pathfinder_agent::hardware::select_hardware;
use pathfinder_agent::{AgentEvent, Sandbox, SandboxError, WidgetChannelState};
use pathfinder_core::config::{Config, LoggingConfig};
use pathfinder_gateway::GatewayState;

/// Session id used for scripts started with `pathfinder run`.
const LOCAL_SESSION: &str = "local";

#[derive(Parser)]
#[command(
    name = "pathfinder",
    about = "Run Pathfinder robot code from the browser: coordinator, robot agent, and local runner",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordinator
    Coordinator {
        /// Port to listen on (default: 5000)
        #[arg(long)]
        port: Option<u16>,

        /// Serve Prometheus metrics on /metrics
        #[cfg(feature = "metrics")]
        #[arg(long)]
        metrics: bool,
    },

    /// Run the robot agent and connect it to a coordinator
    Agent {
        /// Coordinator URL, e.g. ws://10.0.0.2:5000
        #[arg(long)]
        server: Option<String>,

        /// Robot id to register with
        #[arg(long)]
        robot_id: Option<String>,

        /// Display name shown in the browser
        #[arg(long)]
        name: Option<String>,

        /// Give scripts a simulated `robot` handle
        #[arg(long)]
        simulate_hardware: bool,
    },

    /// Run a Lua script in the sandbox locally
    Run {
        /// Script to execute
        file: PathBuf,

        /// Give the script a simulated `robot` handle
        #[arg(long)]
        simulate_hardware: bool,

        /// Print every event as a JSON line
        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Query a running coordinator's health endpoint
    Status {
        /// Coordinator base URL (default: http://127.0.0.1:<gateway.port>)
        #[arg(long)]
        url: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Check the configuration for problems
    Validate,
    /// Print the config file path
    Path,
}

/// EnvFilter directives for the configured level and per-crate filters.
fn filter_directives(logging: &LoggingConfig, verbose: bool) -> String {
    let level = if verbose {
        "debug"
    } else {
        logging.level.as_deref().unwrap_or("info")
    };
    std::iter::once(level.to_string())
        .chain(logging.filters.iter().cloned())
        .collect::<Vec<_>>()
        .join(",")
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let directives = filter_directives(logging, verbose);
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new(directives)
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directives))
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match (logging.format.as_str(), logging.output.as_str()) {
        ("json", "stdout") => builder.json().with_writer(std::io::stdout).init(),
        ("json", _) => builder.json().with_writer(std::io::stderr).init(),
        (_, "stdout") => builder.with_writer(std::io::stdout).init(),
        _ => builder.with_writer(std::io::stderr).init(),
    }
}

/// Cancel `token` on Ctrl+C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
        }
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);

    let config = Config::load(&config_path)?;
    init_logging(&config.logging.clone().unwrap_or_default(), cli.verbose);

    match cli.command {
        Commands::Coordinator {
            port,
            #[cfg(feature = "metrics")]
            metrics,
        } => {
            let (warnings, errors) = config.validate();
            for warning in &warnings {
                tracing::warn!("{warning}");
            }
            if !errors.is_empty() {
                anyhow::bail!("invalid configuration: {}", errors.join("; "));
            }

            let port = port.unwrap_or_else(|| config.gateway_port());
            tracing::info!("Starting Pathfinder coordinator on port {port}");
            let state = GatewayState::from_config(config);

            #[cfg(feature = "metrics")]
            let state = if metrics {
                let handle = pathfinder_gateway::metrics::install_prometheus_recorder()?;
                state.with_metrics(handle)
            } else {
                state
            };

            pathfinder_gateway::start_gateway(Arc::new(state), port).await?;
        }
        Commands::Agent {
            server,
            robot_id,
            name,
            simulate_hardware,
        } => {
            let mut config = config;
            let mut agent = config.agent();
            if let Some(server) = server {
                agent.server_url = server;
            }
            if robot_id.is_some() {
                agent.robot_id = robot_id;
            }
            if let Some(name) = name {
                agent.robot_name = name;
            }
            let hardware = select_hardware(agent.hardware_enabled, simulate_hardware);
            config.agent = Some(agent);

            let shutdown = CancellationToken::new();
            cancel_on_ctrl_c(shutdown.clone());
            pathfinder_agent::run_agent(&config, hardware, shutdown).await?;
        }
        Commands::Run {
            file,
            simulate_hardware,
            json,
        } => {
            let code = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let hardware = select_hardware(config.agent().hardware_enabled, simulate_hardware);
            let failed = run_local(&config, &code, hardware, json).await?;
            if failed {
                std::process::exit(1);
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s)", errors.len());
                }
                println!("Configuration OK ({})", config_path.display());
            }
            ConfigAction::Path => println!("{}", config_path.display()),
        },
        Commands::Status { url } => {
            let base = url.unwrap_or_else(|| format!("http://127.0.0.1:{}", config.gateway_port()));
            let health_url = format!("{}/health", base.trim_end_matches('/'));

            println!("Pathfinder v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            match reqwest::get(&health_url).await {
                Ok(resp) => {
                    let body: serde_json::Value = resp.json().await?;
                    println!("Coordinator: {}", body["status"].as_str().unwrap_or("unknown"));
                    println!("  version:       {}", body["version"]);
                    println!("  connections:   {}", body["connections"]);
                    println!("  robots online: {}", body["robots_online"]);
                    println!("  sessions:      {}", body["sessions"]);
                    println!("  active jobs:   {}", body["active_jobs"]);
                }
                Err(e) => println!("Coordinator: not reachable at {base} ({e})"),
            }
        }
    }

    Ok(())
}

/// Run one script to completion, printing its telemetry.
///
/// Returns `true` if the script wrote anything to stderr.
async fn run_local(
    config: &Config,
    code: &str,
    hardware: Option<Arc<dyn pathfinder_agent::hardware::Hardware>>,
    json: bool,
) -> anyhow::Result<bool> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sandbox = Sandbox::new(config.sandbox(), WidgetChannelState::new(), hardware, tx);
    sandbox.execute(LOCAL_SESSION, code)?;

    let interrupt = CancellationToken::new();
    cancel_on_ctrl_c(interrupt.clone());

    let mut failed = false;
    loop {
        let event = tokio::select! {
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = interrupt.cancelled(), if !interrupt.is_cancelled() => {
                match sandbox.stop(LOCAL_SESSION).await {
                    Ok(()) | Err(SandboxError::NotRunning(_)) => {}
                    Err(e) => tracing::warn!("{e}"),
                }
                continue;
            }
        };

        if json {
            println!("{}", serde_json::to_string(&event)?);
        }
        match event {
            AgentEvent::Stdout { line, .. } if !json => println!("{line}"),
            AgentEvent::Stderr { line, .. } => {
                failed = true;
                if !json {
                    eprintln!("{line}");
                }
            }
            AgentEvent::WidgetText {
                widget_id, text, ..
            } if !json => println!("[{widget_id}] {text}"),
            AgentEvent::WidgetImage {
                widget_id, bytes, ..
            } if !json => println!("[{widget_id}] <image, {} bytes>", bytes.len()),
            AgentEvent::Finished { .. } => break,
            _ => {}
        }
    }

    Ok(failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives() {
        let logging = LoggingConfig {
            level: Some("warn".into()),
            filters: vec!["pathfinder_gateway=debug".into()],
            ..LoggingConfig::default()
        };
        assert_eq!(
            filter_directives(&logging, false),
            "warn,pathfinder_gateway=debug"
        );
        assert_eq!(
            filter_directives(&logging, true),
            "debug,pathfinder_gateway=debug"
        );
        assert_eq!(filter_directives(&LoggingConfig::default(), false), "info");
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["pathfinder", "run", "demo.lua", "--json"]).unwrap();
        match cli.command {
            Commands::Run { file, json, .. } => {
                assert_eq!(file, PathBuf::from("demo.lua"));
                assert!(json);
            }
            _ => panic!("expected run"),
        }

        let cli = Cli::try_parse_from([
            "pathfinder",
            "-v",
            "agent",
            "--server",
            "ws://10.0.0.2:5000",
            "--robot-id",
            "robot_ab12cd34",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Agent { robot_id: Some(_), .. }));
    }

    #[tokio::test]
    async fn test_run_local_reports_errors() {
        let config = Config::default();
        assert!(!run_local(&config, "print('ok')", None, false).await.unwrap());
        assert!(run_local(&config, "error('bad')", None, false).await.unwrap());
    }
}
