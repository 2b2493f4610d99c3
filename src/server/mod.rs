// src/server/mod.rs

use crate::config::Config;

pub mod admin;
mod context;
pub mod initialization;
mod spawner;
mod supervisor;
mod stream;

pub use initialization::{EXIT_CONFIG, EXIT_DUPLICATE, EXIT_STARTUP_IO, StartupError};
pub use stream::AnyStream;

/// The main server startup function, orchestrating all setup phases.
/// Returns the process exit code.
pub async fn run(config: Config, config_path: String) -> Result<i32, StartupError> {
    // 1. Initialize the runtime, listener, TLS, and PID file.
    let mut server_context = initialization::setup(config, &config_path).await?;

    // 2. Spawn all background tasks.
    spawner::spawn_all(&mut server_context).map_err(|e| StartupError {
        exit_code: initialization::EXIT_STARTUP_IO,
        error: e,
    })?;

    // 3. Run the supervisor until shutdown.
    Ok(supervisor::run(server_context).await)
}
