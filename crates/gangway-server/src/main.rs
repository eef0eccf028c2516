//! Gangway binary.
//!
//! ## Usage
//!
//! ```bash
//! gangway sftp <configfile>      # serve directories over SFTP/WebDAV
//! gangway cmd <configfile>       # expose a command over SSH
//! gangway generate <outputkey>   # generate an Ed25519 key pair
//! ```
//!
//! A missing config file is written with defaults and the process exits
//! non-zero so the operator can edit it first.

use std::env;
use std::path::Path;
use std::process::ExitCode;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gangway_server::{CmdConfig, CommandServer, FileServer, SftpConfig};

fn print_usage() {
    eprintln!(
        r#"gangway - expose commands and directories over SSH

USAGE:
    gangway <COMMAND> <ARGS>

COMMANDS:
    sftp <configfile>       Serve directories through SFTP, with optional
                            WebDAV over an in-band TCP/IP forward
    cmd <configfile>        Run a command and pipe it through SSH sessions
    generate <outputkey>    Generate an Ed25519 key pair

A missing config file is created with defaults; edit it and start again.
Missing host keys are generated on startup."#
    );
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return ExitCode::FAILURE;
    }
    match args[1].as_str() {
        "sftp" => run_sftp(&args[2..]).await,
        "cmd" => run_cmd(&args[2..]).await,
        "generate" => generate(&args[2..]),
        "--help" | "-h" => {
            print_usage();
            ExitCode::SUCCESS
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            ExitCode::FAILURE
        }
    }
}

/// Load a config, writing the default and exiting non-zero when absent.
fn load_or_scaffold<T>(path: &str) -> Result<T, ExitCode>
where
    T: serde::de::DeserializeOwned + serde::Serialize + Default,
{
    if !Path::new(path).exists() {
        return match gangway_server::config::write_default::<T>(path) {
            Ok(()) => {
                eprintln!("Created default config at {path}; edit it and start again.");
                Err(ExitCode::FAILURE)
            }
            Err(e) => {
                eprintln!("Cannot write default config to {path}: {e}");
                Err(ExitCode::FAILURE)
            }
        };
    }
    gangway_server::config::load(path).map_err(|e| {
        eprintln!("Cannot load {path}: {e}");
        ExitCode::FAILURE
    })
}

async fn run_sftp(args: &[String]) -> ExitCode {
    let Some(path) = args.first() else {
        eprintln!("Usage: gangway sftp <configfile>");
        return ExitCode::FAILURE;
    };
    let config: SftpConfig = match load_or_scaffold(path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    let server = match FileServer::new(config) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            return ExitCode::FAILURE;
        }
    };
    let cancel = server.cancel_token();
    tokio::select! {
        result = server.run() => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(error = %e, "server failed");
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            tracing::info!("interrupted, shutting down");
            ExitCode::SUCCESS
        }
    }
}

async fn run_cmd(args: &[String]) -> ExitCode {
    let Some(path) = args.first() else {
        eprintln!("Usage: gangway cmd <configfile>");
        return ExitCode::FAILURE;
    };
    let config: CmdConfig = match load_or_scaffold(path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    let server = match CommandServer::new(config) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            return ExitCode::FAILURE;
        }
    };
    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server failed");
            ExitCode::FAILURE
        }
    }
}

fn generate(args: &[String]) -> ExitCode {
    let Some(output) = args.first() else {
        eprintln!("Usage: gangway generate <outputkey>");
        return ExitCode::FAILURE;
    };
    let key = match gangway_server::hostkey::generate_key() {
        Ok(k) => k,
        Err(e) => {
            eprintln!("Key generation failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    match gangway_server::hostkey::write_key_pair(Path::new(output), &key) {
        Ok(()) => {
            println!("Wrote {output} and {output}.pub");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Cannot write key pair: {e}");
            ExitCode::FAILURE
        }
    }
}
