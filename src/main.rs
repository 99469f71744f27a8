// src/main.rs
use ravel::logging::init_logging;
use ravel::{Config, Server};
use std::path::Path;
use std::sync::atomic::Ordering;
use tracing::{error, warn};

fn main() {
    init_logging();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        eprintln!("usage: {} <config-file>", args[0]);
        std::process::exit(2);
    }

    let config = match Config::load(Path::new(&args[1])) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let mut server = match Server::new(&config) {
        Ok(server) => server,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let shutdown = server.shutdown_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        shutdown.store(true, Ordering::SeqCst);
    }) {
        warn!("cannot install signal handler: {e}");
    }

    if let Err(e) = server.run() {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}
