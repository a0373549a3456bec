//! The GoCICa binary: parse configuration, wire up logging, open the
//! combined cache, and drive the stdio protocol until the toolchain
//! closes the session (spec §6 "Exit codes").

use clap::Parser;
use gocica::cache::CombinedCache;
use gocica::config::Config;
use gocica::protocol::dispatcher;
use std::process::ExitCode;

fn main() -> ExitCode {
    let config = Config::parse();

    env_logger::Builder::new()
        .filter_level(config.log_level.filter())
        .target(env_logger::Target::Stderr)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(config))
}

async fn run(config: Config) -> ExitCode {
    let cache_dir = config.resolved_cache_dir();
    let (remote, identity) = match config.remote_provider() {
        Ok(Some((remote, identity))) => (Some(remote), Some(identity)),
        Ok(None) => (None, None),
        Err(e) => {
            log::warn!("remote provider configuration failed, running local-only: {e}");
            (None, None)
        }
    };

    let cache = match CombinedCache::open(cache_dir, remote, identity).await {
        Ok(cache) => cache,
        Err(e) => {
            log::error!("failed to open local cache: {e}");
            return ExitCode::FAILURE;
        }
    };

    log::info!("gocica ready, awaiting requests");

    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    match dispatcher::run(stdin, stdout, cache).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            log::error!("remote finalisation failed at close");
            ExitCode::FAILURE
        }
        Err(e) => {
            log::error!("protocol session ended with a fatal error: {e}");
            ExitCode::FAILURE
        }
    }
}
