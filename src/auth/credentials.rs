// Access credential storage
// The refresh credential is only ever kept as the raw cookie the API set

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock};

/// Key under which the access token is stored
const ACCESS_TOKEN_KEY: &str = "accessToken";

/// Key under which the API's cookies are stored
const COOKIES_KEY: &str = "cookies";

/// A `Set-Cookie` header as received, with the URL that sent it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub url: String,
    pub header: String,
}

/// Holder of the current access credential
///
/// `set` and `clear` are the only writes; concurrent writers race with
/// last-writer-wins semantics. No expiry is tracked locally, the server
/// decides validity.
pub trait CredentialStore: Send + Sync {
    /// Current access token, if any
    fn get(&self) -> Result<Option<String>>;

    /// Replace the access token
    fn set(&self, token: &str) -> Result<()>;

    /// Remove the access token; a no-op when none is stored
    fn clear(&self) -> Result<()>;

    /// Cookies received from the API, as last saved
    fn cookies(&self) -> Result<Vec<StoredCookie>>;

    /// Replace the saved cookies
    fn set_cookies(&self, cookies: &[StoredCookie]) -> Result<()>;
}

/// Process-local credential store
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    token: RwLock<Option<String>>,
    cookies: RwLock<Vec<StoredCookie>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a token already stored
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
            cookies: RwLock::default(),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Result<Option<String>> {
        let token = self.token.read().unwrap_or_else(PoisonError::into_inner);
        Ok(token.clone())
    }

    fn set(&self, token: &str) -> Result<()> {
        let mut slot = self.token.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(token.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut slot = self.token.write().unwrap_or_else(PoisonError::into_inner);
        *slot = None;
        Ok(())
    }

    fn cookies(&self) -> Result<Vec<StoredCookie>> {
        let cookies = self.cookies.read().unwrap_or_else(PoisonError::into_inner);
        Ok(cookies.clone())
    }

    fn set_cookies(&self, cookies: &[StoredCookie]) -> Result<()> {
        let mut slot = self.cookies.write().unwrap_or_else(PoisonError::into_inner);
        *slot = cookies.to_vec();
        Ok(())
    }
}

/// Credential store persisted in an SQLite key/value table
///
/// Survives process restarts, the same way browser local storage survives
/// a page reload.
pub struct SqliteCredentialStore {
    conn: Mutex<Connection>,
}

impl SqliteCredentialStore {
    /// Open (or create) the credential database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create credential directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;

        Self::from_connection(conn)
    }

    /// Store backed by an in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create auth_kv table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self, key: &str) -> Result<Option<String>> {
        self.conn()
            .query_row("SELECT value FROM auth_kv WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()
            .with_context(|| format!("Failed to load {} from SQLite", key))
    }

    fn store(&self, key: &str, value: &str) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [key, value],
            )
            .with_context(|| format!("Failed to store {} in SQLite", key))?;
        Ok(())
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn get(&self) -> Result<Option<String>> {
        self.load(ACCESS_TOKEN_KEY)
    }

    fn set(&self, token: &str) -> Result<()> {
        self.store(ACCESS_TOKEN_KEY, token)
    }

    fn clear(&self) -> Result<()> {
        self.conn()
            .execute("DELETE FROM auth_kv WHERE key = ?", [ACCESS_TOKEN_KEY])
            .context("Failed to remove access token from SQLite")?;
        Ok(())
    }

    fn cookies(&self) -> Result<Vec<StoredCookie>> {
        match self.load(COOKIES_KEY)? {
            Some(json) => serde_json::from_str(&json).context("Failed to parse stored cookies"),
            None => Ok(Vec::new()),
        }
    }

    fn set_cookies(&self, cookies: &[StoredCookie]) -> Result<()> {
        let json = serde_json::to_string(cookies).context("Failed to serialize cookies")?;
        self.store(COOKIES_KEY, &json)
    }
}
