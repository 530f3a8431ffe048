use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

use pulumicost_mcp::config::Config;
use pulumicost_mcp::mcp::Dispatcher;
use pulumicost_mcp::observability::{init_tracing, Metrics};
use pulumicost_mcp::services::Services;
use pulumicost_mcp::transport::{HttpTransport, StdioTransport};
use pulumicost_mcp::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    Stdio,
    Http,
}

#[derive(Debug, Parser)]
#[command(name = "pulumicost-mcp", version, about = "MCP gateway for cloud cost intelligence")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Which transport to serve.
    #[arg(long, value_enum, default_value = "stdio")]
    transport: Transport,

    /// Override the configured log level.
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    // Stdout belongs to the protocol on the stdio transport; logs always
    // go to stderr.
    init_tracing(&config.server.log_level, cli.transport == Transport::Http);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "cannot start runtime");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(cli, config)) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "startup failed");
            ExitCode::from(1)
        }
    }
}

fn load_config(cli: &Cli) -> std::result::Result<Config, GatewayError> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(level) = &cli.log_level {
        config.server.log_level = level.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli, config: Config) -> Result<ExitCode> {
    info!(version = pulumicost_mcp::VERSION, "pulumicost-mcp starting");

    let metrics = Arc::new(Metrics::new()?);
    let services = Services::new(&config, Arc::clone(&metrics));
    let supervisor = Arc::clone(&services.supervisor);
    let dispatcher = Arc::new(Dispatcher::new(services, Arc::clone(&metrics), &config));
    let shutdown = dispatcher.shutdown_token();

    // Initial scan before serving; the background loop takes over after.
    supervisor.scan().await;
    let supervisor_task = {
        let supervisor = Arc::clone(&supervisor);
        let cancel = shutdown.clone();
        tokio::spawn(async move { supervisor.run(cancel).await })
    };

    let interrupted = Arc::new(std::sync::atomic::AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        let interrupted = Arc::clone(&interrupted);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; shutting down");
                interrupted.store(true, std::sync::atomic::Ordering::Release);
                shutdown.cancel();
            }
        });
    }

    let served = match cli.transport {
        Transport::Stdio => {
            let transport = StdioTransport::new(Arc::clone(&dispatcher), &config);
            transport.run().await
        }
        Transport::Http => {
            let transport = HttpTransport::new(Arc::clone(&dispatcher), metrics, &config);
            transport.serve(shutdown.clone()).await
        }
    };

    shutdown.cancel();
    let _ = supervisor_task.await;

    match served {
        Ok(()) => {
            if interrupted.load(std::sync::atomic::Ordering::Acquire) {
                Ok(ExitCode::from(130))
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
        Err(e) => {
            error!(error = %e, "transport failed");
            Ok(ExitCode::from(1))
        }
    }
}
