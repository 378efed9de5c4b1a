//! Runtime construction, listeners, signal handling, and shutdown.

use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use socket2::SockRef;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Builder;
use tokio::signal::unix::{signal as unix_signal, SignalKind};

use super::args::Args;
use super::state::ServerState;
use crate::backend::loopback::LoopbackConnector;
use crate::client::{FrontendSession, Transport};
use crate::compiler::heuristic::HeuristicGateway;
use crate::config::Config;
use crate::errors::Error;
use crate::http;
use crate::stats;
use crate::utils::format_elapsed;

/// Clients currently connected to the binary protocol listener.
pub static CURRENT_CLIENT_COUNT: AtomicI64 = AtomicI64::new(0);

/// Exclusive lock on the data directory, held for the process lifetime.
struct DataDirLock {
    path: PathBuf,
}

impl DataDirLock {
    fn acquire(dir: &str) -> Result<DataDirLock, Error> {
        let path = PathBuf::from(dir).join("gelway.lock");
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Ok(DataDirLock { path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::DataDirLocked(path.display().to_string()))
            }
            Err(err) => Err(Error::Socket(err)),
        }
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub fn run_server(args: Args, config: Config) -> Result<(), Error> {
    let _lock = DataDirLock::acquire(&config.general.data_dir)?;

    let runtime = Builder::new_multi_thread()
        .worker_threads(config.general.worker_threads)
        .enable_all()
        .thread_name("worker-gelway")
        .build()
        .map_err(Error::Socket)?;

    runtime.block_on(async_main(args, config))
}

async fn async_main(_args: Args, config: Config) -> Result<(), Error> {
    let started = std::time::Instant::now();
    let config = Arc::new(config);

    // Development wiring: in-process compiler heuristics and the loopback
    // backend. Deployments wire their compiler service and backend driver
    // here instead.
    let state = ServerState::new(
        config.clone(),
        Arc::new(HeuristicGateway),
        Arc::new(LoopbackConnector::new()),
    )?;
    state.pool.start();

    let addr = format!("{}:{}", config.general.host, config.general.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("listening for binary protocol on {addr}");

    if let Some(http_port) = config.general.http_port {
        let http_addr = format!("{}:{}", config.general.host, http_port);
        let http_listener = TcpListener::bind(&http_addr).await?;
        tokio::spawn(http::serve(state.clone(), http_listener));
    }

    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]);

    let mut sigterm = unix_signal(SignalKind::terminate())?;
    let mut sigint = unix_signal(SignalKind::interrupt())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down gracefully");
                break;
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    configure_tcp_socket(&stream);
                    let state = state.clone();
                    tokio::spawn(async move {
                        CURRENT_CLIENT_COUNT.fetch_add(1, Ordering::Relaxed);
                        let connected = std::time::Instant::now();
                        let (read, write) = stream.into_split();
                        let session =
                            FrontendSession::new(read, write, state, Transport::Binary);
                        match session.run().await {
                            Ok(()) => debug!(
                                "session from {peer} closed after {}",
                                format_elapsed(connected.elapsed())
                            ),
                            Err(err) => debug!(
                                "session from {peer} failed after {}: {err}",
                                format_elapsed(connected.elapsed())
                            ),
                        }
                        CURRENT_CLIENT_COUNT.fetch_sub(1, Ordering::Relaxed);
                    });
                }
                Err(err) => error!("accept failed: {err}"),
            }
        }
    }

    shutdown(&state).await;
    info!("stopped after {}", format_elapsed(started.elapsed()));
    Ok(())
}

/// Stop accepting, wait for sessions to drain, close the pool.
async fn shutdown(state: &Arc<ServerState>) {
    state.shutdown.cancel();
    let deadline =
        tokio::time::Instant::now() + state.config.general.shutdown_timeout.as_std();
    while stats::live_sessions() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if stats::live_sessions() > 0 {
        info!(
            "shutdown deadline reached with {} sessions still open",
            stats::live_sessions()
        );
    }
    state.pool.close().await;
}

pub fn configure_tcp_socket(stream: &TcpStream) {
    let sock_ref = SockRef::from(stream);
    let _ = sock_ref.set_tcp_nodelay(true);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(15));
    let _ = sock_ref.set_tcp_keepalive(&keepalive);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = dir.path().to_str().unwrap().to_string();

        let lock = DataDirLock::acquire(&dir_path).unwrap();
        let second = DataDirLock::acquire(&dir_path);
        assert!(matches!(second, Err(Error::DataDirLocked(_))));

        drop(lock);
        DataDirLock::acquire(&dir_path).unwrap();
    }
}
