//! Logging setup: a tracing subscriber on stderr for interactive runs,
//! optional syslog forwarding for daemonized deployments.

use log::LevelFilter;
use syslog::{BasicLogger, Facility, Formatter3164};
use tracing_subscriber::EnvFilter;

use super::args::{Args, LogFormat};
use crate::config::{Config, VERSION};
use crate::errors::Error;

/// Install the global logger. A configured `syslog_prog_name` wins over the
/// CLI formatting flags; everything else goes through tracing-subscriber.
pub fn init_logging(args: &Args, config: &Config) -> Result<(), Error> {
    match &config.general.syslog_prog_name {
        Some(prog) => init_syslog(prog.clone())?,
        None => init_subscriber(args),
    }
    log::info!(
        "gelway {VERSION} starting, instance {:?}",
        config.general.instance_name
    );
    Ok(())
}

fn init_syslog(process: String) -> Result<(), Error> {
    let formatter = Formatter3164 {
        facility: Facility::LOG_DAEMON,
        hostname: None,
        process,
        pid: std::process::id(),
    };
    let logger = syslog::unix(formatter)
        .map_err(|err| Error::BadConfig(format!("cannot open syslog: {err}")))?;
    log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
        .map_err(|err| Error::BadConfig(format!("logger already installed: {err}")))?;
    // DEBUG through syslog is prohibitively slow; clamp to INFO.
    log::set_max_level(LevelFilter::Info);
    Ok(())
}

fn init_subscriber(args: &Args) {
    let filter = EnvFilter::from_default_env().add_directive(args.log_level.into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!args.no_color);
    match args.log_format {
        LogFormat::Structured => builder.json().init(),
        LogFormat::Debug => builder.pretty().init(),
        LogFormat::Text => builder.init(),
    }
}
