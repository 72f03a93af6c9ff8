// Credential persistence

use anyhow::{Context, Result};
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::types::CredentialKind;

/// Key/value storage for the session's two credentials
///
/// Implementations do not inspect token shape or expiry; the server's status
/// codes are the only judge of validity.
pub trait CredentialStore: Send + Sync {
    /// Current value, or `None` when absent. Never fails: backend errors are
    /// logged and reported as absent.
    fn get(&self, kind: CredentialKind) -> Option<String>;

    /// Overwrite the stored value
    fn set(&self, kind: CredentialKind, value: &str) -> Result<()>;

    /// Remove the stored value. Clearing an absent credential is not an error.
    fn clear(&self, kind: CredentialKind) -> Result<()>;
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<CredentialKind, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, kind: CredentialKind) -> Option<String> {
        self.entries.get(&kind).map(|entry| entry.value().clone())
    }

    fn set(&self, kind: CredentialKind, value: &str) -> Result<()> {
        self.entries.insert(kind, value.to_string());
        Ok(())
    }

    fn clear(&self, kind: CredentialKind) -> Result<()> {
        self.entries.remove(&kind);
        Ok(())
    }
}

/// SQLite-backed store that survives process restarts
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the session database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create session directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS session_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create session_kv table")?;

        // Tokens are secrets
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("Failed to restrict permissions: {}", path.display()))?;
        }

        tracing::debug!("Opened session store: {}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    /// Location of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self, kind: CredentialKind) -> Result<Option<String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("Session store lock poisoned"))?;

        conn.query_row(
            "SELECT value FROM session_kv WHERE key = ?",
            [kind.storage_key()],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("Failed to read {} from session store", kind))
    }
}

impl CredentialStore for SqliteStore {
    fn get(&self, kind: CredentialKind) -> Option<String> {
        match self.read(kind) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "Treating credential as absent");
                None
            }
        }
    }

    fn set(&self, kind: CredentialKind, value: &str) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("Session store lock poisoned"))?;

        conn.execute(
            "INSERT INTO session_kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![kind.storage_key(), value],
        )
        .with_context(|| format!("Failed to write {} to session store", kind))?;

        Ok(())
    }

    fn clear(&self, kind: CredentialKind) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("Session store lock poisoned"))?;

        conn.execute(
            "DELETE FROM session_kv WHERE key = ?",
            [kind.storage_key()],
        )
        .with_context(|| format!("Failed to clear {} from session store", kind))?;

        Ok(())
    }
}
