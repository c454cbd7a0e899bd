use clap::Parser;
use tracing::{error, info};

use reactor_httpd::db::DbPool;
use reactor_httpd::{Args, Reactor};

fn main() -> std::process::ExitCode {
    let args = Args::parse();
    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    let _log_guard = reactor_httpd::logging::init(&config);

    // No real driver is wired in (see DESIGN.md) -- this pre-opens
    // `db_pool_size` unit handles so the option's effect is visible and
    // request handlers can be extended to `acquire()` a real `DbHandle`.
    let _db_pool = match DbPool::init(config.db_pool_size, || Ok::<(), reactor_httpd::error::PoolError>(())) {
        Ok(db_pool) => {
            info!(capacity = db_pool.capacity(), "database pool ready");
            db_pool
        }
        Err(e) => {
            error!(%e, "failed to initialize database pool");
            return std::process::ExitCode::FAILURE;
        }
    };

    let mut reactor = match Reactor::new(config) {
        Ok(reactor) => reactor,
        Err(e) => {
            error!(%e, "failed to initialize reactor");
            return std::process::ExitCode::FAILURE;
        }
    };

    if let Err(e) = reactor.run() {
        error!(%e, "reactor loop exited");
        return std::process::ExitCode::FAILURE;
    }

    std::process::ExitCode::SUCCESS
}
