use std::process;

use gelway::app;
use gelway::app::logger;
use gelway::config;
use gelway::errors::Error;

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn main() {
    let args = app::args::parse();

    let config = match config::load_config(&args.config_file) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            process::exit(app::EXIT_CONFIG_ERROR);
        }
    };

    if args.test_config {
        println!("configuration OK");
        process::exit(app::EXIT_OK);
    }

    if let Err(err) = logger::init_logging(&args, &config) {
        eprintln!("failed to initialize logging: {err}");
        process::exit(app::EXIT_STARTUP_FAILURE);
    }

    config::set_config(config.clone());

    match app::server::run_server(args, config) {
        Ok(()) => process::exit(app::EXIT_OK),
        Err(Error::DataDirLocked(path)) => {
            eprintln!("data directory lock is held: {path}");
            process::exit(app::EXIT_LOCK_HELD);
        }
        Err(err) => {
            eprintln!("startup failed: {err}");
            process::exit(app::EXIT_STARTUP_FAILURE);
        }
    }
}
