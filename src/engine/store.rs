use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use super::models::{FileRecord, Project, ProjectStatus};

/// Async-safe handle to the engine database.
///
/// Wraps `EngineDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<EngineDb>>,
}

impl DbHandle {
    pub fn new(db: EngineDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&EngineDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

/// The persistent file store: the system of record independent of any
/// running sandbox.
pub struct EngineDb {
    conn: Connection,
}

impl EngineDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    sandbox_id TEXT,
                    status TEXT NOT NULL DEFAULT 'unprovisioned',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS file_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    path TEXT NOT NULL,
                    content TEXT NOT NULL DEFAULT '',
                    is_folder INTEGER NOT NULL DEFAULT 0,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(project_id, path)
                );

                CREATE INDEX IF NOT EXISTS idx_file_records_project
                    ON file_records(project_id, path);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Project CRUD ──────────────────────────────────────────────────

    pub fn create_project(&self, id: &str, name: &str) -> Result<Project> {
        self.conn
            .execute(
                "INSERT INTO projects (id, name) VALUES (?1, ?2)",
                params![id, name],
            )
            .context("Failed to insert project")?;
        self.get_project(id)?
            .context("Project not found after insert")
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, sandbox_id, status, created_at, updated_at
                 FROM projects WHERE id = ?1",
            )
            .context("Failed to prepare get_project")?;
        let mut rows = stmt
            .query_map(params![id], |row| {
                Ok(ProjectRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    sandbox_id: row.get(2)?,
                    status: row.get(3)?,
                    created_at: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            })
            .context("Failed to query project")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read project row")?;
                Ok(Some(r.into_project()?))
            }
            None => Ok(None),
        }
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, sandbox_id, status, created_at, updated_at
                 FROM projects ORDER BY created_at",
            )
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ProjectRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    sandbox_id: row.get(2)?,
                    status: row.get(3)?,
                    created_at: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            })
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?.into_project()?);
        }
        Ok(projects)
    }

    /// Record the last-known sandbox id for reconnect attempts.
    pub fn update_project_sandbox(&self, id: &str, sandbox_id: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE projects SET sandbox_id = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![sandbox_id, id],
            )
            .context("Failed to update project sandbox id")?;
        Ok(())
    }

    pub fn update_project_status(&self, id: &str, status: &ProjectStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE projects SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update project status")?;
        Ok(())
    }

    // ── File records ──────────────────────────────────────────────────

    /// Upsert one batch of file records, stamping the given timestamp.
    /// Last writer wins on `(project_id, path)`.
    pub fn upsert_file_batch(
        &self,
        project_id: &str,
        records: &[FileRecord],
        now: &str,
    ) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin upsert transaction")?;
        for record in records {
            tx.execute(
                "INSERT INTO file_records (project_id, path, content, is_folder, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(project_id, path) DO UPDATE SET
                    content = excluded.content,
                    is_folder = excluded.is_folder,
                    updated_at = excluded.updated_at",
                params![project_id, record.path, record.content, record.is_folder, now],
            )
            .with_context(|| format!("Failed to upsert file record {}", record.path))?;
        }
        tx.commit().context("Failed to commit upsert batch")?;
        Ok(())
    }

    /// All records for a project, ordered by path ascending. The ordering
    /// is part of the contract: restore and UI listing rely on it being
    /// deterministic.
    pub fn get_project_files(&self, project_id: &str) -> Result<Vec<FileRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT project_id, path, content, is_folder, updated_at
                 FROM file_records WHERE project_id = ?1 ORDER BY path ASC",
            )
            .context("Failed to prepare get_project_files")?;
        let rows = stmt
            .query_map(params![project_id], |row| {
                Ok(FileRecord {
                    project_id: row.get(0)?,
                    path: row.get(1)?,
                    content: row.get(2)?,
                    is_folder: row.get::<_, i64>(3)? != 0,
                    updated_at: row.get(4)?,
                })
            })
            .context("Failed to query file records")?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("Failed to read file record row")?);
        }
        Ok(records)
    }

    pub fn get_file(&self, project_id: &str, path: &str) -> Result<Option<FileRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT project_id, path, content, is_folder, updated_at
                 FROM file_records WHERE project_id = ?1 AND path = ?2",
            )
            .context("Failed to prepare get_file")?;
        let mut rows = stmt
            .query_map(params![project_id, path], |row| {
                Ok(FileRecord {
                    project_id: row.get(0)?,
                    path: row.get(1)?,
                    content: row.get(2)?,
                    is_folder: row.get::<_, i64>(3)? != 0,
                    updated_at: row.get(4)?,
                })
            })
            .context("Failed to query file record")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read file record row")?)),
            None => Ok(None),
        }
    }

    pub fn delete_file(&self, project_id: &str, path: &str) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "DELETE FROM file_records WHERE project_id = ?1 AND path = ?2",
                params![project_id, path],
            )
            .context("Failed to delete file record")?;
        Ok(count > 0)
    }

    pub fn delete_project_files(&self, project_id: &str) -> Result<usize> {
        let count = self
            .conn
            .execute(
                "DELETE FROM file_records WHERE project_id = ?1",
                params![project_id],
            )
            .context("Failed to delete project file records")?;
        Ok(count)
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Intermediate row struct for reading projects from SQLite before the
/// status string becomes a typed value.
struct ProjectRow {
    id: String,
    name: String,
    sandbox_id: Option<String>,
    status: String,
    created_at: String,
    updated_at: String,
}

impl ProjectRow {
    fn into_project(self) -> Result<Project> {
        let status = ProjectStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse project status")?;
        Ok(Project {
            id: self.id,
            name: self.name,
            sandbox_id: self.sandbox_id,
            status,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_project(id: &str) -> EngineDb {
        let db = EngineDb::new_in_memory().unwrap();
        db.create_project(id, "test project").unwrap();
        db
    }

    #[test]
    fn test_migrations_create_tables() -> Result<()> {
        let db = EngineDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('projects', 'file_records')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 2, "Expected both tables to exist");
        Ok(())
    }

    #[test]
    fn test_create_and_get_project() -> Result<()> {
        let db = EngineDb::new_in_memory()?;
        let project = db.create_project("p1", "my app")?;
        assert_eq!(project.id, "p1");
        assert_eq!(project.name, "my app");
        assert_eq!(project.status, ProjectStatus::Unprovisioned);
        assert!(project.sandbox_id.is_none());

        let fetched = db.get_project("p1")?.expect("project should exist");
        assert_eq!(fetched.name, "my app");
        assert!(db.get_project("nope")?.is_none());
        Ok(())
    }

    #[test]
    fn test_update_sandbox_and_status() -> Result<()> {
        let db = db_with_project("p1");
        db.update_project_sandbox("p1", Some("sb-123"))?;
        db.update_project_status("p1", &ProjectStatus::Running)?;

        let project = db.get_project("p1")?.unwrap();
        assert_eq!(project.sandbox_id.as_deref(), Some("sb-123"));
        assert_eq!(project.status, ProjectStatus::Running);

        db.update_project_sandbox("p1", None)?;
        assert!(db.get_project("p1")?.unwrap().sandbox_id.is_none());
        Ok(())
    }

    #[test]
    fn test_upsert_is_last_writer_wins() -> Result<()> {
        let db = db_with_project("p1");
        let first = vec![FileRecord::file("p1", "README.md", "v1")];
        db.upsert_file_batch("p1", &first, "2026-01-01T00:00:00Z")?;
        let second = vec![FileRecord::file("p1", "README.md", "v2")];
        db.upsert_file_batch("p1", &second, "2026-01-02T00:00:00Z")?;

        let files = db.get_project_files("p1")?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].content, "v2");
        assert_eq!(files[0].updated_at, "2026-01-02T00:00:00Z");
        Ok(())
    }

    #[test]
    fn test_get_project_files_ordered_by_path() -> Result<()> {
        let db = db_with_project("p1");
        let records = vec![
            FileRecord::file("p1", "src/index.ts", "b"),
            FileRecord::file("p1", "README.md", "a"),
            FileRecord::folder("p1", "src"),
        ];
        db.upsert_file_batch("p1", &records, "2026-01-01T00:00:00Z")?;

        let files = db.get_project_files("p1")?;
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["README.md", "src", "src/index.ts"]);
        assert!(files[1].is_folder);
        Ok(())
    }

    #[test]
    fn test_delete_file_and_bulk_delete() -> Result<()> {
        let db = db_with_project("p1");
        let records = vec![
            FileRecord::file("p1", "a.txt", "a"),
            FileRecord::file("p1", "b.txt", "b"),
        ];
        db.upsert_file_batch("p1", &records, "2026-01-01T00:00:00Z")?;

        assert!(db.delete_file("p1", "a.txt")?);
        assert!(!db.delete_file("p1", "a.txt")?);
        assert_eq!(db.get_project_files("p1")?.len(), 1);

        assert_eq!(db.delete_project_files("p1")?, 1);
        assert!(db.get_project_files("p1")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_records_are_scoped_per_project() -> Result<()> {
        let db = EngineDb::new_in_memory()?;
        db.create_project("p1", "one")?;
        db.create_project("p2", "two")?;
        db.upsert_file_batch(
            "p1",
            &[FileRecord::file("p1", "x.txt", "one")],
            "2026-01-01T00:00:00Z",
        )?;
        db.upsert_file_batch(
            "p2",
            &[FileRecord::file("p2", "x.txt", "two")],
            "2026-01-01T00:00:00Z",
        )?;

        assert_eq!(db.get_project_files("p1")?[0].content, "one");
        assert_eq!(db.get_project_files("p2")?[0].content, "two");
        Ok(())
    }

    #[tokio::test]
    async fn test_db_handle_call() -> Result<()> {
        let handle = DbHandle::new(EngineDb::new_in_memory()?);
        handle
            .call(|db| db.create_project("p1", "via handle").map(|_| ()))
            .await?;
        let project = handle.call(|db| db.get_project("p1")).await?;
        assert_eq!(project.unwrap().name, "via handle");
        Ok(())
    }
}
