/// The reserved database session used to terminate other backends.
///
/// One connection is opened at startup, tagged with an application name so it
/// is recognisable in pg_stat_activity, and kept for the life of the process.
/// It never serves any other traffic.
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Signal every backend except our own and those logged in as our own user.
///
/// The `usename <> current_user` clause is a coarse policy: sessions sharing
/// the terminator's role are assumed to be administrative and are spared.
/// Backends with a NULL `usename` (background workers) never match.
pub const TERMINATE_SQL: &str = "SELECT pg_terminate_backend(pid) AS pg_terminate_backend \
     FROM pg_stat_activity \
     WHERE pid <> pg_backend_pid() \
     AND usename <> current_user";

/// One row of the termination result: whether the signal reached that backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct TerminationOutcome {
    #[serde(rename = "pg_terminate_backend")]
    #[sqlx(rename = "pg_terminate_backend")]
    pub signalled: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum TerminateError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("termination session has been released")]
    Released,
}

impl TerminateError {
    /// Human-readable message for the caller.
    ///
    /// Errors reported by the server carry the server's own text; transport
    /// and driver errors use their display form.
    pub fn message(&self) -> String {
        match self {
            TerminateError::Database(sqlx::Error::Database(db)) => db.message().to_string(),
            other => other.to_string(),
        }
    }
}

/// Anything that can terminate non-essential connections.
///
/// The HTTP layer only sees this trait, never the connection itself.
pub trait Terminator: Send + Sync + 'static {
    fn terminate_non_essential_connections(
        &self,
    ) -> impl Future<Output = Result<Vec<TerminationOutcome>, TerminateError>> + Send;
}

/// A single long-lived Postgres session. The mutex keeps at most one command
/// in flight; the slot is emptied once the session is released.
pub struct PgTerminator {
    conn: Mutex<Option<PgConnection>>,
    backend_pid: i32,
}

impl PgTerminator {
    /// Open the reserved session, tagged with `application_name`.
    pub async fn connect(url: &str, application_name: &str) -> Result<Self, TerminateError> {
        let options = PgConnectOptions::from_str(url)?.application_name(application_name);
        let mut conn = PgConnection::connect_with(&options).await?;

        let backend_pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut conn)
            .await?;

        info!(application_name, backend_pid, "termination session established");

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            backend_pid,
        })
    }

    /// Close the session. Later calls, and later termination requests, see an
    /// empty slot. Gives up after `timeout` so shutdown cannot hang.
    pub async fn release(&self, timeout: Duration) {
        let close = async {
            let Some(conn) = self.conn.lock().await.take() else {
                return None;
            };
            Some(conn.close().await)
        };

        match tokio::time::timeout(timeout, close).await {
            Ok(None) => {}
            Ok(Some(Ok(()))) => info!(backend_pid = self.backend_pid, "termination session released"),
            Ok(Some(Err(e))) => warn!(error = %e, "failed to close termination session cleanly"),
            Err(_) => warn!(
                timeout_secs = timeout.as_secs(),
                "timed out releasing termination session"
            ),
        }
    }
}

impl Terminator for PgTerminator {
    async fn terminate_non_essential_connections(
        &self,
    ) -> Result<Vec<TerminationOutcome>, TerminateError> {
        let mut slot = self.conn.lock().await;
        let conn = slot.as_mut().ok_or(TerminateError::Released)?;

        let outcomes = sqlx::query_as::<_, TerminationOutcome>(TERMINATE_SQL)
            .fetch_all(conn)
            .await?;
        Ok(outcomes)
    }
}
