//! echo-server: a multi-threaded TCP echo server
//!
//! Every byte sequence delivered by one read is echoed back verbatim by one
//! queued write. All sockets share a single reactor driven by a pool of
//! worker threads.
//!
//! Features:
//! - At most one outstanding read and one outstanding write per connection
//! - Periodic health checks that reap failed connections
//! - Graceful shutdown on SIGINT/SIGTERM: stop accepting, drain, exit
//! - Configuration via CLI arguments or TOML file
//! - Severity-split, size-rotated log files

mod config;
mod health;
mod logging;
mod runtime;
mod server;
mod shutdown;

use config::{Config, ConfigError};
use runtime::WorkerPool;
use server::Server;
use shutdown::StopSignal;
use std::process::ExitCode;
use tracing::{error, info};

/// Exit status for argument or startup failures (-1).
const EXIT_FAILURE: u8 = 255;

fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(ConfigError::Cli(e)) => {
            let _ = e.print();
            return ExitCode::from(EXIT_FAILURE);
        }
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    logging::init(config.debug, &config.log_dir);

    info!(
        host = %config.host,
        port = config.port,
        threads = config.threads,
        max_connections = config.max_connections,
        log_dir = %config.log_dir.display(),
        debug = config.debug,
        "Starting echo server"
    );

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server failed to start");
            eprintln!("{}", e);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let pool = WorkerPool::new(config.threads)?;
    let server = Server::start(
        pool.reactor(),
        config.server_options(),
        &config.host,
        config.port,
    )?;

    let stop = StopSignal::new();
    pool.block_on(shutdown::wait_for_signal(&stop));

    // Close the listener, then let go of the server so it drains once
    // its pending accept and health timers have released it.
    info!(connections = server.connection_count(), "Stopping server");
    server.stop();
    drop(server);
    let drained = pool.join(config.drain_timeout);

    info!(drained, "Stopped");
    Ok(())
}
