mod demo;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use steward::channels::{loopback, ChatBackend, IncomingPayload};
use steward::config::{load_config, Config};
use steward::gateway::{self, GatewayState};
use steward::{Orchestrator, Scheduler};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

const CONSOLE_BACKEND: &str = "console";
const CONSOLE_TARGET: &str = "console";

#[derive(Parser)]
#[command(name = "steward")]
#[command(about = "Steward CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Connect the configured backends and serve the built-in commands until Ctrl+C.
    Run {
        /// Config file path (default: STEWARD_CONFIG_PATH or ~/.steward/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Try the built-in commands from stdin, without any chat service.
    Console {
        /// Config file path; only name and abort keywords are used.
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Print the help listing the bot replies with.
    HelpText {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("steward {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Run { config }) => run(config),
        Some(Commands::Console { config }) => console(config),
        Some(Commands::HelpText { config }) => help_text(config),
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };
    if let Err(e) = result {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn help_text(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, _) = load_config(config_path)?;
    let mut orchestrator = Orchestrator::new(config);
    demo::register_demo_commands(&mut orchestrator);
    println!("{}", orchestrator.help_text());
    Ok(())
}

fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, path) = load_config(config_path)?;
    if config.backends.is_empty() {
        anyhow::bail!("no backends configured in {}", path.display());
    }
    let gateway_config = config.gateway.clone();
    let mut orchestrator = Orchestrator::new(config);
    demo::register_demo_commands(&mut orchestrator);

    let scheduler = Scheduler::new()?;
    scheduler.block_on(async {
        if !orchestrator.launch(&scheduler).await? {
            log::warn!("autoStart is off; starting anyway");
            orchestrator.start(&scheduler).await?;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let gateway_task = if gateway_config.enabled {
            let state = GatewayState::from_orchestrator(&orchestrator, &gateway_config).await;
            Some(scheduler.spawn(async move {
                let shutdown = async move {
                    let _ = stop_rx.changed().await;
                };
                gateway::run_gateway(&gateway_config, state, shutdown).await
            }))
        } else {
            None
        };

        shutdown_signal().await;
        log::info!("shutdown signal received, stopping backends");
        let _ = stop_tx.send(true);
        orchestrator.stop().await;
        if let Some(task) = gateway_task {
            task.await??;
        }
        Ok::<_, anyhow::Error>(())
    })?;
    scheduler.shutdown();
    Ok(())
}

fn console(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (mut config, _) = load_config(config_path)?;
    config.backends.clear();
    let mut orchestrator = Orchestrator::new(config.clone());
    demo::register_demo_commands(&mut orchestrator);
    let (transport, mut client) = loopback(CONSOLE_BACKEND);
    orchestrator.add_custom_backend(CONSOLE_BACKEND, move |ports| {
        Ok(Arc::new(transport.into_backend(ports)) as Arc<dyn ChatBackend>)
    });
    let username = std::env::var("USER").ok();

    let scheduler = Scheduler::new()?;
    scheduler.block_on(async {
        orchestrator.start(&scheduler).await?;
        print_intro(&config);
        scheduler.spawn(async move {
            while let Some(reply) = client.next_reply().await {
                println!("< {}", reply.text);
            }
        });

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let input = line.trim();
            if input.is_empty() {
                continue;
            }
            if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
                break;
            }
            orchestrator
                .inject(
                    CONSOLE_BACKEND,
                    IncomingPayload::new(
                        CONSOLE_TARGET,
                        username.clone(),
                        input,
                    ),
                )
                .await?;
        }
        orchestrator.stop().await;
        Ok::<_, anyhow::Error>(())
    })?;
    scheduler.shutdown();
    Ok(())
}

fn print_intro(config: &Config) {
    let hint = match config.name.as_deref() {
        Some(name) => format!("{} help", name),
        None => "help".to_string(),
    };
    println!("type '{}' for commands, /exit to quit", hint);
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
