// src/main.rs

//! The main entry point for the pgrelay pooler.

use pgrelay::config::Config;
use pgrelay::server;
use std::env;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() {
    std::process::exit(run_app().await);
}

async fn run_app() -> i32 {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("pgrelay version {VERSION}");
        return 0;
    }

    // The configuration path comes from --config; default is pgrelay.toml.
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("pgrelay.toml")
        .to_string();

    let mut config = match Config::from_file(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
            return server::EXIT_CONFIG;
        }
    };

    // `--check` validates the configuration and exits.
    if args.contains(&"--check".to_string()) {
        println!("Configuration at \"{config_path}\" is valid.");
        return 0;
    }

    // Override the frontend port if provided on the command line.
    if let Some(port_index) = args.iter().position(|arg| arg == "--port") {
        match args.get(port_index + 1).and_then(|s| s.parse::<u16>().ok()) {
            Some(port) if port != 0 => config.port = port,
            _ => {
                eprintln!("--port requires a valid port number");
                return server::EXIT_CONFIG;
            }
        }
    }

    // Initialize logging. RUST_LOG overrides the configured level.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(config.log_destination == "stderr")
        .with_writer(std::io::stderr)
        .init();

    match server::run(config, config_path).await {
        Ok(exit_code) => exit_code,
        Err(e) => {
            error!("Startup failed: {e}");
            e.exit_code
        }
    }
}
