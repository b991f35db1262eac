//! SQLite connection management for the run-history store.
//!
//! SQLite permits a single writer at a time, and during a run every step
//! transition is checkpointed, so writes arrive in bursts from however many
//! step runners are in flight. Funnelling all of them through one writer
//! connection serializes those bursts at the pool instead of bouncing off
//! `SQLITE_BUSY`, while a separate read-only pool keeps CLI and API queries
//! (`list`, `status`, the REST handlers) from queueing behind checkpoint
//! traffic. WAL journal mode is what makes the concurrent readers safe
//! alongside the writer.

use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

/// Readers available to the CLI/API side. Status queries are short and
/// infrequent; a handful of connections is plenty even with the REST
/// server polling runs.
const READER_CONNECTIONS: u32 = 4;

/// How long a connection waits on a locked database before giving up.
/// Checkpoint writes are tiny, so anything still locked after this long
/// indicates a wedged process rather than ordinary contention.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Paired connection pools over one SQLite database: a single-connection
/// writer for checkpoint upserts and a read-only pool for queries.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open the database at `database_url`, creating the file and applying
    /// migrations when needed.
    ///
    /// The writer comes up first so the schema exists before the read-only
    /// pool touches the file.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options(database_url)?)
            .await?;

        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(READER_CONNECTIONS)
            .connect_with(connect_options(database_url)?.read_only(true))
            .await?;

        Ok(Self { reader, writer })
    }
}

/// Shared connection options: WAL journal, enforced foreign keys (step
/// executions cascade with their run), busy timeout, create-on-open.
fn connect_options(database_url: &str) -> Result<SqliteConnectOptions, sqlx::Error> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT)
        .create_if_missing(true))
}
