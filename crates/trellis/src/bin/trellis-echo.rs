//! Trellis echo server.
//!
//! Serves every configured connector with a handler that echoes bytes back,
//! which makes it handy for trying out connector and negotiation settings.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{error, info};

use trellis::prelude::*;

/// Command-line arguments.
struct Args {
    /// Path to configuration file.
    config: Option<PathBuf>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" | "-c" => {
                    config = args.next().map(PathBuf::from);
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("trellis-echo {}", env!("CARGO_PKG_VERSION"));
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {other}");
                    eprintln!("Use --help for usage information");
                    std::process::exit(1);
                }
            }
        }

        Self { config }
    }
}

fn print_help() {
    println!(
        r#"Trellis echo server

USAGE:
    trellis-echo [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Path to configuration file (TOML or JSON)
    -h, --help             Print help information
    -v, --version          Print version information

ENVIRONMENT VARIABLES:
    TRELLIS__SERVER__NAME                   Server name
    TRELLIS__CONNECTORS__<i>__PORT          Port of connector <i>
    TRELLIS__CONNECTORS__<i>__PROTOCOLS     Comma-separated protocol list
    TRELLIS__TELEMETRY__LOGGING__LEVEL      Log filter (default: info)

Without a configuration file a single plain connector named "echo" listens
on port 7007.

EXAMPLES:
    trellis-echo --config /etc/trellis/echo.toml
    TRELLIS__CONNECTORS__0__PORT=9000 trellis-echo
"#
    );
}

/// Writes back whatever it reads.
struct Echo;

#[async_trait]
impl Handler for Echo {
    async fn handle(&self, mut connection: Connection) -> Result<(), ConnectionError> {
        let (mut reader, mut writer) = tokio::io::split(&mut connection);
        tokio::io::copy(&mut reader, &mut writer).await?;
        Ok(())
    }
}

fn load_config(path: Option<PathBuf>) -> Result<TrellisConfig, trellis::config::ConfigError> {
    let loader = match path {
        Some(path) => ConfigLoader::new().with_file(path)?,
        None => {
            let mut fallback = ConnectorSettings::new("echo");
            fallback.port = 7007;
            fallback.protocols = vec!["echo".to_string()];
            ConfigLoader::new().with_config(TrellisConfig::builder().connector(fallback).build())
        }
    };
    loader.with_dotenv()?.with_env_prefix("TRELLIS").load()
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match load_config(args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let bootstrap = ServerBootstrap::new(config).handler(Echo);
    if let Err(e) = bootstrap.init_telemetry() {
        eprintln!("Failed to initialize telemetry: {e}");
        std::process::exit(1);
    }

    let server = match bootstrap.build() {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to build server");
            std::process::exit(1);
        }
    };

    info!(server = %server.name(), "starting trellis-echo {}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = server.run().await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}
