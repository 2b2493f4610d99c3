// src/server/initialization.rs

//! Handles the complete startup process: PID file with duplicate-instance
//! detection, TLS setup, runtime construction, and the frontend listener.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::state::Runtime;
use anyhow::{Result, anyhow};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::{TlsAcceptor, rustls};
use tracing::{info, warn};

/// Process exit codes: 1 config error, 2 fatal startup I/O,
/// 3 another instance is running.
pub const EXIT_CONFIG: i32 = 1;
pub const EXIT_STARTUP_IO: i32 = 2;
pub const EXIT_DUPLICATE: i32 = 3;

/// Error wrapper carrying the intended process exit code.
#[derive(Debug)]
pub struct StartupError {
    pub exit_code: i32,
    pub error: anyhow::Error,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for StartupError {}

fn startup_err(exit_code: i32, error: anyhow::Error) -> StartupError {
    StartupError { exit_code, error }
}

/// Initializes all components before the supervisor starts.
pub async fn setup(config: Config, config_path: &str) -> Result<ServerContext, StartupError> {
    write_pid_file(&config.pid_file_name).map_err(|e| match e.downcast_ref::<DuplicateInstance>() {
        Some(_) => startup_err(EXIT_DUPLICATE, e),
        None => startup_err(EXIT_STARTUP_IO, e),
    })?;

    let acceptor = setup_tls(&config)
        .await
        .map_err(|e| startup_err(EXIT_CONFIG, e))?;

    let status_file = config.status_file_name.clone();
    let (runtime, request_rx) = Runtime::new(config, Some(Path::new(&status_file)), config_path)
        .map_err(|e| startup_err(EXIT_STARTUP_IO, anyhow!("{e}")))?;
    info!("Runtime initialized (run id {})", runtime.run_id);

    if runtime.status.status_file_dirty() {
        warn!("Previous run left unpersisted status transitions");
    }

    let config = runtime.config();
    let listener = TcpListener::bind((config.listen_addresses.as_str(), config.port))
        .await
        .map_err(|e| {
            startup_err(
                EXIT_STARTUP_IO,
                anyhow!(
                    "cannot bind {}:{}: {e}",
                    config.listen_addresses,
                    config.port
                ),
            )
        })?;
    info!(
        "pgrelay listening on {}:{} with {} backend(s), {} worker(s)",
        config.listen_addresses,
        config.port,
        config.backends.len(),
        config.num_workers
    );

    Ok(ServerContext {
        runtime,
        listener,
        acceptor,
        request_rx: Some(request_rx),
        background_tasks: JoinSet::new(),
    })
}

#[derive(Debug)]
struct DuplicateInstance;

impl std::fmt::Display for DuplicateInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "another instance is running")
    }
}

impl std::error::Error for DuplicateInstance {}

/// Writes the supervisor pid as decimal ASCII, refusing to start when a
/// live instance already owns the file.
fn write_pid_file(path: &str) -> Result<()> {
    if path.is_empty() {
        return Ok(());
    }
    if let Ok(existing) = std::fs::read_to_string(path)
        && let Ok(pid) = existing.trim().parse::<u32>()
        && pid_is_alive(pid)
    {
        return Err(anyhow!(DuplicateInstance)
            .context(format!("pid file '{path}' belongs to running pid {pid}")));
    }
    std::fs::write(path, format!("{}\n", std::process::id()))
        .map_err(|e| anyhow!("cannot write pid file '{path}': {e}"))?;
    Ok(())
}

/// Probes liveness of a pid via a no-op kill.
fn pid_is_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

/// Removes the pid file at shutdown. Best effort.
pub fn remove_pid_file(path: &str) {
    if !path.is_empty() {
        let _ = std::fs::remove_file(path);
    }
}

/// Sets up the TLS acceptor when ssl is enabled in the configuration.
async fn setup_tls(config: &Config) -> Result<Option<TlsAcceptor>> {
    if config.ssl.enabled {
        info!("TLS is enabled. Loading certificate and key.");
        let certs = load_certs(&config.ssl.cert_path)?;
        let key = load_key(&config.ssl.key_path)?;
        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
    } else {
        Ok(None)
    }
}

/// Loads TLS certificates from a PEM file.
fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let cert_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open certificate file '{}': {}", path, e))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(anyhow!("No certificates found in '{}'", path));
    }
    Ok(certs)
}

/// Loads a private key from a PEM file.
fn load_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let key_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open private key file '{}': {}", path, e))?;
    let mut key_reader = BufReader::new(key_file);
    rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| anyhow!("No private key found in key file '{}'", path))
}

