//! # Crucible Database
//!
//! Single SQLite database holding experiments, sessions, dead-ends,
//! worker findings and metric snapshots. Lives at `.crucible/crucible.db`;
//! swarm instances each open their own copy inside their worktree, which is
//! imported into the project database before the worktree is removed.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::io::get_runtime_path;

/// Schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// File name of the database inside a runtime directory
pub const DB_FILE: &str = "crucible.db";

/// Database handle shared by the state managers
pub struct CrucibleDb {
    conn: Arc<Mutex<Connection>>,
}

impl CrucibleDb {
    /// Open or create the database in the runtime directory
    pub fn open() -> Result<Self> {
        Self::open_at(get_runtime_path().join(DB_FILE))
    }

    /// Open the isolated database that belongs to a worktree
    pub fn open_in(worktree: &Path) -> Result<Self> {
        Self::open_at(worktree.join(".crucible").join(DB_FILE))
    }

    /// Open database at a specific path
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open crucible database at {:?}", path.as_ref()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        Ok(db)
    }

    /// Get a shared connection for use by the managers
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Release the connection.
    ///
    /// Closes it immediately when this is the last handle; otherwise the
    /// remaining managers keep it alive until they are dropped.
    pub fn close(self) -> Result<()> {
        match Arc::try_unwrap(self.conn) {
            Ok(mutex) => {
                let conn = mutex
                    .into_inner()
                    .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
                conn.close()
                    .map_err(|(_, e)| anyhow::anyhow!("Failed to close database: {}", e))
            }
            Err(_) => {
                tracing::debug!("Database still shared; connection released on last drop");
                Ok(())
            }
        }
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = lock(&self.conn)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < 1 {
            migrate_v1(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                [1],
            )?;
            tracing::debug!("Crucible schema migrated to version {}", SCHEMA_VERSION);
        }

        Ok(())
    }
}

/// Lock a shared connection
pub(crate) fn lock(conn: &Arc<Mutex<Connection>>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {}", e))
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS experiments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            slug TEXT NOT NULL UNIQUE,
            branch TEXT NOT NULL,
            hypothesis TEXT NOT NULL,
            status TEXT NOT NULL,
            sub_type TEXT,
            grade TEXT,
            parent_id INTEGER REFERENCES experiments(id),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            intent TEXT NOT NULL,
            experiment_id INTEGER REFERENCES experiments(id),
            started_at TEXT NOT NULL,
            ended_at TEXT,
            accomplished TEXT,
            unfinished TEXT,
            new_fragility TEXT
        );

        CREATE TABLE IF NOT EXISTS dead_ends (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            experiment_id INTEGER REFERENCES experiments(id),
            approach TEXT NOT NULL,
            structural_constraint TEXT NOT NULL,
            sub_type TEXT,
            category TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS decisions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            experiment_id INTEGER NOT NULL REFERENCES experiments(id),
            evidence_level TEXT NOT NULL,
            description TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS doubts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            experiment_id INTEGER NOT NULL REFERENCES experiments(id),
            description TEXT NOT NULL,
            severity TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS challenges (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            experiment_id INTEGER NOT NULL REFERENCES experiments(id),
            description TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS verification_rounds (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            experiment_id INTEGER NOT NULL REFERENCES experiments(id),
            started_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS verifications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            experiment_id INTEGER NOT NULL REFERENCES experiments(id),
            round_id INTEGER NOT NULL REFERENCES verification_rounds(id),
            component TEXT NOT NULL,
            grade TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS metrics (
            experiment_id INTEGER NOT NULL REFERENCES experiments(id),
            phase TEXT NOT NULL,
            fixture TEXT NOT NULL,
            metric_name TEXT NOT NULL,
            value REAL NOT NULL,
            captured_at TEXT NOT NULL,
            PRIMARY KEY (experiment_id, phase, fixture, metric_name)
        );

        CREATE INDEX IF NOT EXISTS idx_experiments_status ON experiments(status);
        CREATE INDEX IF NOT EXISTS idx_dead_ends_sub_type ON dead_ends(sub_type);
        CREATE INDEX IF NOT EXISTS idx_doubts_experiment ON doubts(experiment_id);
        CREATE INDEX IF NOT EXISTS idx_challenges_experiment ON challenges(experiment_id);
        CREATE INDEX IF NOT EXISTS idx_sessions_open ON sessions(ended_at);
        CREATE INDEX IF NOT EXISTS idx_rounds_experiment ON verification_rounds(experiment_id);
        "#,
    )?;

    Ok(())
}
