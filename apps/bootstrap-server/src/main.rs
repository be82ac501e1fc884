use anyhow::Result;
use bootstrap::Bootstrap;
use clap::{Parser, Subcommand};
use modkit::{ModuleDef, ShutdownOptions};
use nats_client::NatsClient;
use runtime::{AppConfig, CliArgs};
use std::path::PathBuf;
use std::process::ExitCode;
use telemetry::Telemetry;

const APP_NAME: &str = "bootstrap-server";

/// Bootstrap Server - modular HTTP host
#[derive(Parser)]
#[command(name = APP_NAME)]
#[command(about = "Bootstrap Server - modular HTTP host")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. ":8080" (overrides config)
    #[arg(long)]
    address: Option<String>,

    /// TLS certificate file (overrides config)
    #[arg(long = "sslcert")]
    ssl_cert: Option<String>,

    /// TLS private key file (overrides config)
    #[arg(long = "sslkey")]
    ssl_key: Option<String>,

    /// Directory served as static content
    #[arg(long = "static", env = "HTTP_STATIC_PATH")]
    static_dir: Option<PathBuf>,

    /// Print effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Run,
    /// Check configuration
    Check,
}

impl Cli {
    fn args(&self) -> CliArgs {
        CliArgs {
            config: self
                .config
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
            address: self.address.clone(),
            cert_file: self.ssl_cert.clone(),
            key_file: self.ssl_key.clone(),
            print_config: self.print_config,
            verbose: self.verbose,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            // The subscriber exists only once the logging module initialized.
            if tracing::dispatcher::has_been_set() {
                tracing::error!("{err:#}");
            } else {
                eprintln!("Error: {err:#}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let args = cli.args();
    let config = bootstrap::load_config(&args)?;

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    let server = assemble(config, cli.static_dir)?;
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            server.run(ShutdownOptions::Signals).await?;
            Ok(())
        }
        Commands::Check => check_config(&server),
    }
}

fn assemble(config: AppConfig, content: Option<PathBuf>) -> Result<Bootstrap> {
    let modules: Vec<(String, ModuleDef)> = vec![
        ("otel".to_string(), Telemetry::new().into()),
        ("nats".to_string(), NatsClient::new().into()),
    ];
    Bootstrap::new(APP_NAME, env!("CARGO_PKG_VERSION"), content, config, modules)
}

fn check_config(server: &Bootstrap) -> Result<()> {
    server.check()?;
    println!("Configuration is valid");
    println!("Modules: {}", server.app().controller().names().join(", "));
    println!("{}", server.config().to_yaml()?);
    Ok(())
}
