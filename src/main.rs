mod app;
mod models;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::error;

use crate::app::builder::{self, ServeOptions};
use crate::app::utils::logging;

#[derive(Parser)]
#[command(name = "nfc-relay-gateway", version, about = "NFC relay MITM proxy")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the TCP relay and HTTP relay listeners
    Serve {
        /// Port for framed NFC relay sessions
        #[arg(long)]
        tcp_port: u16,
        /// Port for the JSON relay endpoint
        #[arg(long)]
        http_port: u16,
        /// Path to the policy bootstrap JSON
        #[arg(long)]
        config: PathBuf,
        /// RSA private key (PKCS#8 DER or PEM); overrides the policy file
        #[arg(long)]
        key: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let _guard = match logging::setup_tracing() {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialize logging: {e}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Serve {
            tcp_port,
            http_port,
            config,
            key,
        } => {
            builder::run(ServeOptions {
                tcp_port,
                http_port,
                config_path: config,
                key_path: key,
            })
            .await
        }
    };

    if let Err(e) = result {
        error!("fatal: {}", e);
        std::process::exit(e.exit_code());
    }
}
