use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

/// What a domain serves. Everything except `Static` is reverse-proxied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteType {
    Static,
    Api,
    Node,
    App,
}

impl SiteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteType::Static => "static",
            SiteType::Api => "api",
            SiteType::Node => "node",
            SiteType::App => "app",
        }
    }

    pub fn is_proxied(&self) -> bool {
        !matches!(self, SiteType::Static)
    }
}

impl fmt::Display for SiteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SiteType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(SiteType::Static),
            "api" => Ok(SiteType::Api),
            "node" => Ok(SiteType::Node),
            "app" => Ok(SiteType::App),
            other => Err(format!("Invalid site type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainStatus {
    Active,
    Removed,
}

impl DomainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainStatus::Active => "active",
            DomainStatus::Removed => "removed",
        }
    }
}

impl FromStr for DomainStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(DomainStatus::Active),
            "removed" => Ok(DomainStatus::Removed),
            other => Err(format!("Invalid domain status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DomainRecord {
    pub id: i64,
    pub domain_name: String,
    pub port: u16,
    pub site_type: SiteType,
    pub ssl_enabled: bool,
    pub status: DomainStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LogEntry {
    pub id: i64,
    pub domain_name: String,
    pub action: String,
    pub status: String,
    pub message: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct DomainCounts {
    pub active: i64,
    pub ssl_enabled: i64,
}

/// Async-safe handle to the domain registry.
///
/// Wraps `DomainRegistry` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct RegistryHandle {
    inner: Arc<std::sync::Mutex<DomainRegistry>>,
}

impl RegistryHandle {
    pub fn new(registry: DomainRegistry) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(registry)),
        }
    }

    /// Run a closure with access to the registry on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&DomainRegistry) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let registry = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = registry
                .lock()
                .map_err(|e| anyhow::anyhow!("Registry lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("Registry task panicked")?
    }
}

/// SQLite-backed record of hosted domains and an append-only action log.
pub struct DomainRegistry {
    conn: Connection,
}

impl DomainRegistry {
    /// Open (or create) the database at `path` and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        let registry = Self { conn };
        registry.init()?;
        Ok(registry)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let registry = Self { conn };
        registry.init()?;
        Ok(registry)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .busy_timeout(std::time::Duration::from_secs(30))
            .context("Failed to set busy timeout")?;
        // journal_mode returns a row, so it goes through query_row.
        let _mode: String = self
            .conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .context("Failed to enable WAL")?;
        self.conn
            .execute_batch(
                "PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;",
            )
            .context("Failed to set pragmas")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS domains (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain_name TEXT UNIQUE NOT NULL,
                port INTEGER NOT NULL,
                site_type TEXT NOT NULL DEFAULT 'static',
                ssl_enabled INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS deployment_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain_name TEXT NOT NULL,
                action TEXT NOT NULL,
                status TEXT NOT NULL,
                message TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_domains_name ON domains(domain_name);
            CREATE INDEX IF NOT EXISTS idx_domains_status ON domains(status);
            CREATE INDEX IF NOT EXISTS idx_logs_domain ON deployment_logs(domain_name);
            CREATE INDEX IF NOT EXISTS idx_logs_created ON deployment_logs(created_at);
            CREATE INDEX IF NOT EXISTS idx_logs_status ON deployment_logs(status);
            ",
        )?;
        Ok(())
    }

    // ── Domains ───────────────────────────────────────────────────────

    /// Insert a domain, or update the existing row with the same name.
    ///
    /// The row becomes `active` with SSL cleared; its id and `created_at`
    /// are kept.
    pub fn upsert_domain(&self, name: &str, port: u16, site_type: SiteType) -> Result<DomainRecord> {
        self.conn
            .execute(
                "INSERT INTO domains (domain_name, port, site_type, ssl_enabled, status)
                 VALUES (?1, ?2, ?3, 0, 'active')
                 ON CONFLICT(domain_name) DO UPDATE SET
                    port = excluded.port,
                    site_type = excluded.site_type,
                    ssl_enabled = 0,
                    status = 'active'",
                params![name, port, site_type.as_str()],
            )
            .context("Failed to upsert domain")?;
        self.get_domain(name)?
            .with_context(|| format!("Domain {} missing after upsert", name))
    }

    pub fn get_domain(&self, name: &str) -> Result<Option<DomainRecord>> {
        self.conn
            .query_row(
                "SELECT id, domain_name, port, site_type, ssl_enabled, status, created_at
                 FROM domains WHERE domain_name = ?1",
                params![name],
                DomainRow::from_row,
            )
            .optional()
            .context("Failed to query domain")?
            .map(DomainRow::into_record)
            .transpose()
    }

    pub fn get_active(&self, name: &str) -> Result<Option<DomainRecord>> {
        Ok(self
            .get_domain(name)?
            .filter(|d| d.status == DomainStatus::Active))
    }

    pub fn list_active(&self) -> Result<Vec<DomainRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, domain_name, port, site_type, ssl_enabled, status, created_at
             FROM domains WHERE status = 'active' ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt
            .query_map([], DomainRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(DomainRow::into_record).collect()
    }

    /// Flag an active domain as having a certificate. Returns false if no
    /// active row matched.
    pub fn mark_ssl(&self, name: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE domains SET ssl_enabled = 1 WHERE domain_name = ?1 AND status = 'active'",
            params![name],
        )?;
        Ok(changed > 0)
    }

    /// Soft-delete: `active` → `removed`. Returns false if no active row matched.
    pub fn mark_removed(&self, name: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE domains SET status = 'removed' WHERE domain_name = ?1 AND status = 'active'",
            params![name],
        )?;
        Ok(changed > 0)
    }

    pub fn counts(&self) -> Result<DomainCounts> {
        let (active, ssl_enabled) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(ssl_enabled), 0) FROM domains WHERE status = 'active'",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;
        Ok(DomainCounts {
            active,
            ssl_enabled,
        })
    }

    // ── Audit log ─────────────────────────────────────────────────────

    pub fn append_log(&self, domain: &str, action: &str, status: &str, message: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO deployment_logs (domain_name, action, status, message)
                 VALUES (?1, ?2, ?3, ?4)",
                params![domain, action, status, message],
            )
            .context("Failed to append deployment log")?;
        Ok(())
    }

    /// Most recent entries first, optionally for a single domain.
    pub fn list_logs(&self, limit: u32, domain: Option<&str>) -> Result<Vec<LogEntry>> {
        let map = |row: &rusqlite::Row<'_>| {
            Ok(LogEntry {
                id: row.get(0)?,
                domain_name: row.get(1)?,
                action: row.get(2)?,
                status: row.get(3)?,
                message: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                created_at: row.get(5)?,
            })
        };
        let entries = match domain {
            Some(d) => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, domain_name, action, status, message, created_at
                     FROM deployment_logs WHERE domain_name = ?1
                     ORDER BY created_at DESC, id DESC LIMIT ?2",
                )?;
                stmt.query_map(params![d, limit], map)?
                    .collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, domain_name, action, status, message, created_at
                     FROM deployment_logs ORDER BY created_at DESC, id DESC LIMIT ?1",
                )?;
                stmt.query_map(params![limit], map)?
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(entries)
    }

    /// Read-only connectivity check over both tables.
    pub fn ping(&self) -> Result<()> {
        self.conn
            .query_row(
                "SELECT (SELECT COUNT(*) FROM domains) + (SELECT COUNT(*) FROM deployment_logs)",
                [],
                |row| row.get::<_, i64>(0),
            )
            .context("Database is not readable")?;
        Ok(())
    }

    /// Round-trip a probe row through `deployment_logs`. Setup only.
    pub fn self_test(&self) -> Result<()> {
        self.append_log("__selftest__", "setup", "success", "database self-test")?;
        let found = self.list_logs(1, Some("__selftest__"))?;
        if found.is_empty() {
            anyhow::bail!("Self-test row was not readable");
        }
        self.conn
            .execute(
                "DELETE FROM deployment_logs WHERE domain_name = '__selftest__'",
                [],
            )
            .context("Failed to clean up self-test row")?;
        Ok(())
    }
}

/// Intermediate row struct for reading domains before enum conversion.
struct DomainRow {
    id: i64,
    domain_name: String,
    port: i64,
    site_type: String,
    ssl_enabled: bool,
    status: String,
    created_at: String,
}

impl DomainRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            domain_name: row.get(1)?,
            port: row.get(2)?,
            site_type: row.get(3)?,
            ssl_enabled: row.get(4)?,
            status: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<DomainRecord> {
        Ok(DomainRecord {
            id: self.id,
            port: u16::try_from(self.port)
                .with_context(|| format!("Stored port out of range: {}", self.port))?,
            site_type: SiteType::from_str(&self.site_type).map_err(anyhow::Error::msg)?,
            status: DomainStatus::from_str(&self.status).map_err(anyhow::Error::msg)?,
            domain_name: self.domain_name,
            ssl_enabled: self.ssl_enabled,
            created_at: self.created_at,
        })
    }
}
