//! Idle-Connection Watcher (spec.md §4.6).
//!
//! Installed only on `CLIENT`-mode (outbound, address-locator) connections.
//! Polls `job_count_current_connection` while the connection reports
//! `active == false`, and closes the connection once that count hits zero.
//! Ported from `original_source/prouter/handlers/jobs.py::_watch_active_connection`.
//!
//! Cancel-safety (per spec.md §4.6 and DESIGN.md): the watcher registers a
//! close callback that only flips a cancellation flag and wakes the poll
//! loop — it never calls back into `connection.close()` from inside that
//! callback, so a watcher-initiated close (which itself fires close
//! callbacks, including this one) cannot deadlock against itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use crate::rpc::Connection;

const JOB_COUNT_METHOD: &str = "job_count_current_connection";

/// Start watching `connection`, sleeping `polling_delay` between idle
/// checks. Returns immediately; the watch loop runs as a detached task that
/// exits on its own once the connection closes (from any cause) or is
/// drained of jobs.
pub fn spawn(connection: Arc<dyn Connection>, polling_delay: Duration) {
    let cancelled = Arc::new(AtomicBool::new(false));
    let wake = Arc::new(Notify::new());

    {
        let cancelled = cancelled.clone();
        let wake = wake.clone();
        connection.on_close(Arc::new(move |_| {
            cancelled.store(true, Ordering::SeqCst);
            wake.notify_waiters();
        }));
    }

    tokio::spawn(async move {
        loop {
            if cancelled.load(Ordering::SeqCst) || !connection.connected() {
                return;
            }

            if !connection.active() {
                match connection.call_simple(JOB_COUNT_METHOD, Vec::new()).await {
                    Ok(value) => {
                        if value.as_i64().unwrap_or(-1) == 0 {
                            connection.clone().close().await;
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(polling_delay) => {}
                _ = wake.notified() => return,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{ConnectionMode, MockConnection};
    use serde_json::Value;
    use std::time::Duration;

    #[tokio::test]
    async fn closes_connection_once_job_count_reaches_zero() {
        let conn = Arc::new(MockConnection::new(ConnectionMode::Client));
        conn.push_simple_response(JOB_COUNT_METHOD, Ok(Value::from(0))).await;

        let dyn_conn: Arc<dyn Connection> = conn.clone();
        spawn(dyn_conn.clone(), Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!dyn_conn.connected());
    }

    #[tokio::test]
    async fn keeps_polling_while_jobs_remain() {
        let conn = Arc::new(MockConnection::new(ConnectionMode::Client));
        conn.push_simple_response(JOB_COUNT_METHOD, Ok(Value::from(2))).await;
        conn.push_simple_response(JOB_COUNT_METHOD, Ok(Value::from(0))).await;

        let dyn_conn: Arc<dyn Connection> = conn.clone();
        spawn(dyn_conn.clone(), Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(dyn_conn.connected());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!dyn_conn.connected());
    }

    #[tokio::test]
    async fn skips_poll_while_active() {
        let conn = Arc::new(MockConnection::new(ConnectionMode::Client));
        conn.set_active(true).await;

        let dyn_conn: Arc<dyn Connection> = conn.clone();
        spawn(dyn_conn.clone(), Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(30)).await;
        // No job-count response was queued; if the watcher had polled it
        // would have seen the default `Ok(Null)` and closed. Still active.
        assert!(dyn_conn.connected());
    }
}
