//! In-process backend used by tests and development servers.
//!
//! Commands are interpreted textually: `select <int>` yields one big-endian
//! i32 row, `select '<str>'` yields the string bytes, anything mentioning
//! `boom` fails, `sleep <ms>` stalls before completing. Everything else
//! completes with its first word as the status tag.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Notify;

use super::{BackendCancel, BackendConn, BackendConnector, BackendEvent};
use crate::errors::BackendError;

#[derive(Debug, Default)]
struct CancelShared {
    fired: AtomicBool,
    notify: Notify,
}

pub struct LoopbackConn {
    branch: String,
    events: VecDeque<BackendEvent>,
    delay_ms: u64,
    cancel: Arc<CancelShared>,
    broken: bool,
}

impl LoopbackConn {
    fn new(branch: &str) -> LoopbackConn {
        LoopbackConn {
            branch: branch.to_string(),
            events: VecDeque::new(),
            delay_ms: 0,
            cancel: Arc::new(CancelShared::default()),
            broken: false,
        }
    }

    fn plan(&mut self, sql: &str) {
        let sql = sql.trim();
        // Any command mentioning "boom" fails at the backend, regardless of
        // how it compiled. Used to exercise error paths.
        if sql.contains("boom") {
            self.events.push_back(BackendEvent::Error(BackendError::Rejected {
                sqlstate: Some("XX000".to_string()),
                message: "simulated backend failure".to_string(),
            }));
            return;
        }
        let mut words = sql.split_whitespace();
        let head = words.next().unwrap_or("").to_lowercase();
        match head.as_str() {
            "select" => {
                let rest = sql[head.len()..].trim();
                if let Ok(value) = rest.parse::<i64>() {
                    self.events
                        .push_back(BackendEvent::Row((value as i32).to_be_bytes().to_vec()));
                } else if rest.starts_with('\'') && rest.ends_with('\'') && rest.len() >= 2 {
                    self.events
                        .push_back(BackendEvent::Row(rest[1..rest.len() - 1].as_bytes().to_vec()));
                } else if !rest.is_empty() {
                    // Unknown shape: echo the expression bytes as one row.
                    self.events
                        .push_back(BackendEvent::Row(rest.as_bytes().to_vec()));
                }
                self.events.push_back(BackendEvent::Complete {
                    status: "SELECT".to_string(),
                });
            }
            "sleep" => {
                self.delay_ms = words.next().and_then(|w| w.parse().ok()).unwrap_or(0);
                self.events.push_back(BackendEvent::Complete {
                    status: "SLEEP".to_string(),
                });
            }
            "start" => {
                self.events.push_back(BackendEvent::Complete {
                    status: "START TRANSACTION".to_string(),
                });
            }
            "commit" | "rollback" => {
                self.events.push_back(BackendEvent::Complete {
                    status: head.to_uppercase(),
                });
            }
            other => {
                self.events.push_back(BackendEvent::Complete {
                    status: other.to_uppercase(),
                });
            }
        }
    }
}

struct LoopbackCancel {
    shared: Arc<CancelShared>,
}

impl BackendCancel for LoopbackCancel {
    fn cancel(&self) -> BoxFuture<'static, Result<(), BackendError>> {
        let shared = self.shared.clone();
        async move {
            shared.fired.store(true, Ordering::SeqCst);
            shared.notify.notify_waiters();
            Ok(())
        }
        .boxed()
    }
}

impl BackendConn for LoopbackConn {
    fn send_query(
        &mut self,
        sql: &[u8],
        _arguments: &[u8],
    ) -> BoxFuture<'_, Result<(), BackendError>> {
        let text = String::from_utf8_lossy(sql).to_string();
        async move {
            if self.broken {
                return Err(BackendError::Disconnected("connection is broken".into()));
            }
            self.cancel.fired.store(false, Ordering::SeqCst);
            self.plan(&text);
            Ok(())
        }
        .boxed()
    }

    fn next_event(&mut self) -> BoxFuture<'_, Result<BackendEvent, BackendError>> {
        async move {
            if self.delay_ms > 0 {
                let delay = std::time::Duration::from_millis(self.delay_ms);
                self.delay_ms = 0;
                let notified = self.cancel.notify.notified();
                tokio::pin!(notified);
                // Register interest before checking the flag so a cancel
                // firing in between is not lost.
                notified.as_mut().enable();
                if !self.cancel.fired.load(Ordering::SeqCst) {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = &mut notified => {}
                    }
                }
            }
            if self.cancel.fired.swap(false, Ordering::SeqCst) {
                self.events.clear();
                return Ok(BackendEvent::Error(BackendError::Rejected {
                    sqlstate: Some("57014".to_string()),
                    message: "canceling statement due to user request".to_string(),
                }));
            }
            match self.events.pop_front() {
                Some(event) => Ok(event),
                None => Err(BackendError::Disconnected(
                    "no command in flight".to_string(),
                )),
            }
        }
        .boxed()
    }

    fn cancel_handle(&self) -> Box<dyn BackendCancel> {
        Box::new(LoopbackCancel {
            shared: self.cancel.clone(),
        })
    }

    fn reset(&mut self, branch: &str) -> BoxFuture<'_, Result<(), BackendError>> {
        let branch = branch.to_string();
        async move {
            self.branch = branch;
            self.events.clear();
            Ok(())
        }
        .boxed()
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        async {}.boxed()
    }
}

/// Connector producing loopback connections. Counts connects so tests can
/// assert on reconnect behavior.
#[derive(Debug, Default)]
pub struct LoopbackConnector {
    connects: AtomicU64,
    fail_connects: AtomicBool,
}

impl LoopbackConnector {
    pub fn new() -> LoopbackConnector {
        LoopbackConnector::default()
    }

    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Make subsequent connects fail, to exercise error paths.
    pub fn set_fail_connects(&self, fail: bool) {
        self.fail_connects.store(fail, Ordering::SeqCst);
    }
}

impl BackendConnector for LoopbackConnector {
    fn connect(&self, branch: &str) -> BoxFuture<'_, Result<Box<dyn BackendConn>, BackendError>> {
        let branch = branch.to_string();
        async move {
            if self.fail_connects.load(Ordering::SeqCst) {
                return Err(BackendError::Unavailable(
                    "loopback connects disabled".to_string(),
                ));
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(LoopbackConn::new(&branch)) as Box<dyn BackendConn>)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_select_int_row() {
        let mut conn = LoopbackConn::new("main");
        conn.send_query(b"select 1", &[]).await.unwrap();
        assert_eq!(
            conn.next_event().await.unwrap(),
            BackendEvent::Row(vec![0, 0, 0, 1])
        );
        assert_eq!(
            conn.next_event().await.unwrap(),
            BackendEvent::Complete {
                status: "SELECT".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_boom_fails_the_command() {
        let mut conn = LoopbackConn::new("main");
        conn.send_query(b"select boom", &[]).await.unwrap();
        match conn.next_event().await.unwrap() {
            BackendEvent::Error(BackendError::Rejected { sqlstate, .. }) => {
                assert_eq!(sqlstate.as_deref(), Some("XX000"))
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_interrupts_sleep() {
        let mut conn = LoopbackConn::new("main");
        conn.send_query(b"sleep 60000", &[]).await.unwrap();
        let cancel = conn.cancel_handle();
        tokio::spawn(async move {
            cancel.cancel().await.unwrap();
        });
        match conn.next_event().await.unwrap() {
            BackendEvent::Error(BackendError::Rejected { sqlstate, .. }) => {
                assert_eq!(sqlstate.as_deref(), Some("57014"))
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reset_clears_pending_events() {
        let mut conn = LoopbackConn::new("main");
        conn.send_query(b"select 1", &[]).await.unwrap();
        conn.reset("other").await.unwrap();
        assert!(conn.next_event().await.is_err());
        assert_eq!(conn.branch, "other");
    }
}
