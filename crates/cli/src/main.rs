mod state_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "agentgate", about = "agentgate: RPC and event gateway for agent hosts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Gateway {
        /// Overrides `server.bind` from the config file.
        #[arg(long)]
        bind: Option<String>,
        /// Overrides `server.port` from the config file.
        #[arg(long)]
        port: Option<u16>,
        /// Config file to load instead of the discovered one.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Read or write agent state on a running gateway.
    State {
        #[command(subcommand)]
        action: state_commands::StateAction,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration.
    Show {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<agentgate_config::GatewayConfig> {
    match path {
        Some(path) => agentgate_config::load_config(&path),
        None => Ok(agentgate_config::discover_and_load()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "agentgate starting");

    match cli.command {
        Commands::Gateway { bind, port, config } => {
            let mut config = load_config(config)?;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            agentgate_gateway::server::start_gateway(config).await
        },
        Commands::State { action } => state_commands::handle_state(action).await,
        Commands::Config {
            action: ConfigAction::Show { config },
        } => {
            let config = load_config(config)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_flags_are_optional() {
        let cli = Cli::try_parse_from(["agentgate", "gateway"]).unwrap();
        assert!(matches!(cli.command, Commands::Gateway {
            bind: None,
            port: None,
            config: None
        }));
    }

    #[test]
    fn gateway_flags_parse() {
        let cli =
            Cli::try_parse_from(["agentgate", "gateway", "--bind", "0.0.0.0", "--port", "9000"])
                .unwrap();
        let Commands::Gateway { bind, port, .. } = cli.command else {
            panic!("expected gateway command");
        };
        assert_eq!(bind.as_deref(), Some("0.0.0.0"));
        assert_eq!(port, Some(9000));
    }
}
