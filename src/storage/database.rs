//! SQLite Database
//!
//! Embedded database for persistent storage using rusqlite with r2d2 connection pooling.
//! Implements the core persistence traits for step executions, annotation
//! overlays and line-addressed source documents.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use story_pipeline_core::{
    AnnotationOverlay, CoreResult, DocumentStore, OverlayStore, SourceDocument, SourceLine,
    StepExecution, StepExecutionStore, StepStatus,
};

use crate::utils::error::{AppError, AppResult};
use crate::utils::paths::database_path;

/// Type alias for the connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// Database service for managing SQLite operations
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Create an in-memory database for testing.
    ///
    /// Uses an in-memory SQLite database with the same schema as the
    /// production database.
    pub fn new_in_memory() -> AppResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| AppError::database(format!("Failed to create connection pool: {}", e)))?;

        let db = Self { pool };
        db.init_schema()?;
        Ok(db)
    }

    /// Open the default database at `~/.story-pipeline/pipeline.db`
    pub fn new() -> AppResult<Self> {
        Self::open(&database_path()?)
    }

    /// Open (or create) a database file with connection pooling
    pub fn open(db_path: &Path) -> AppResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| AppError::database(format!("Failed to create connection pool: {}", e)))?;

        let db = Self { pool };
        db.init_schema()?;

        Ok(db)
    }

    /// Initialize the database schema
    fn init_schema(&self) -> AppResult<()> {
        let conn = self.get_connection()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS step_executions (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                current_step INTEGER NOT NULL DEFAULT 0,
                max_step INTEGER NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS annotation_overlays (
                document_id TEXT PRIMARY KEY,
                overlay TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS documents (
                document_id TEXT NOT NULL,
                line_id INTEGER NOT NULL,
                text TEXT NOT NULL,
                PRIMARY KEY (document_id, line_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_step_executions_status ON step_executions(status)",
            [],
        )?;

        Ok(())
    }

    /// Get a connection from the pool
    pub fn get_connection(&self) -> AppResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| AppError::database(format!("Failed to get connection: {}", e)))
    }

    /// Check if the database is healthy
    pub fn is_healthy(&self) -> bool {
        if let Ok(conn) = self.pool.get() {
            conn.query_row("SELECT 1", [], |_| Ok(())).is_ok()
        } else {
            false
        }
    }

    // ========================================================================
    // Step executions
    // ========================================================================

    /// Insert or replace a step execution record
    pub fn upsert_step_execution(&self, execution: &StepExecution) -> AppResult<()> {
        let conn = self.get_connection()?;
        conn.execute(
            "INSERT INTO step_executions
                (id, title, current_step, max_step, status, error, created_at, updated_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                title = ?2, current_step = ?3, max_step = ?4, status = ?5, error = ?6,
                updated_at = ?8, completed_at = ?9",
            params![
                execution.id,
                execution.title,
                execution.current_step,
                execution.max_step,
                execution.status.as_str(),
                execution.error,
                execution.created_at.to_rfc3339(),
                execution.updated_at.to_rfc3339(),
                execution.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Get a single step execution by ID
    pub fn get_step_execution(&self, id: &str) -> AppResult<Option<StepExecution>> {
        let conn = self.get_connection()?;
        let row = conn
            .query_row(
                "SELECT id, title, current_step, max_step, status, error,
                        created_at, updated_at, completed_at
                 FROM step_executions WHERE id = ?1",
                params![id],
                |row| {
                    Ok(StepExecutionRow {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        current_step: row.get(2)?,
                        max_step: row.get(3)?,
                        status: row.get(4)?,
                        error: row.get(5)?,
                        created_at: row.get(6)?,
                        updated_at: row.get(7)?,
                        completed_at: row.get(8)?,
                    })
                },
            )
            .optional()?;

        row.map(StepExecutionRow::into_execution).transpose()
    }

    /// Ids of step executions that have not completed, oldest update first
    pub fn list_resumable_step_executions(&self) -> AppResult<Vec<String>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM step_executions
             WHERE status IN ('pending', 'in_progress', 'cancelled', 'failed')
             ORDER BY updated_at",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    // ========================================================================
    // Annotation overlays
    // ========================================================================

    /// Replace the overlay stored for a document
    pub fn put_overlay(&self, document_id: &str, overlay: &AnnotationOverlay) -> AppResult<()> {
        let json = serde_json::to_string(overlay)?;
        let conn = self.get_connection()?;
        conn.execute(
            "INSERT INTO annotation_overlays (document_id, overlay, updated_at)
             VALUES (?1, ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(document_id) DO UPDATE SET overlay = ?2, updated_at = CURRENT_TIMESTAMP",
            params![document_id, json],
        )?;
        Ok(())
    }

    /// Get the overlay stored for a document
    pub fn get_overlay(&self, document_id: &str) -> AppResult<Option<AnnotationOverlay>> {
        let conn = self.get_connection()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT overlay FROM annotation_overlays WHERE document_id = ?1",
                params![document_id],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    // ========================================================================
    // Source documents
    // ========================================================================

    /// Replace all lines of a document
    pub fn put_document(&self, document: &SourceDocument) -> AppResult<()> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM documents WHERE document_id = ?1",
            params![document.id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO documents (document_id, line_id, text) VALUES (?1, ?2, ?3)",
            )?;
            for line in &document.lines {
                stmt.execute(params![document.id, line.id as i64, line.text])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Get a document with its lines ordered by line id
    pub fn get_document(&self, id: &str) -> AppResult<Option<SourceDocument>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT line_id, text FROM documents WHERE document_id = ?1 ORDER BY line_id",
        )?;
        let lines = stmt
            .query_map(params![id], |row| {
                let line_id: i64 = row.get(0)?;
                Ok(SourceLine::new(line_id as u64, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        if lines.is_empty() {
            return Ok(None);
        }
        Ok(Some(SourceDocument {
            id: id.to_string(),
            lines,
        }))
    }
}

/// Raw step execution row from the database
#[derive(Debug, Clone)]
struct StepExecutionRow {
    id: String,
    title: String,
    current_step: u32,
    max_step: u32,
    status: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl StepExecutionRow {
    fn into_execution(self) -> AppResult<StepExecution> {
        let status = StepStatus::parse(&self.status).ok_or_else(|| {
            AppError::database(format!(
                "unknown step status '{}' for execution {}",
                self.status, self.id
            ))
        })?;
        Ok(StepExecution {
            id: self.id,
            title: self.title,
            current_step: self.current_step,
            max_step: self.max_step,
            status,
            error: self.error,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            completed_at: self.completed_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

fn parse_timestamp(value: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AppError::database(format!("invalid timestamp '{}': {}", value, e)))
}

// ============================================================================
// Core trait implementations
// ============================================================================

#[async_trait]
impl StepExecutionStore for Database {
    async fn load(&self, id: &str) -> CoreResult<Option<StepExecution>> {
        Ok(self.get_step_execution(id)?)
    }

    async fn save(&self, execution: &StepExecution) -> CoreResult<()> {
        Ok(self.upsert_step_execution(execution)?)
    }
}

#[async_trait]
impl OverlayStore for Database {
    async fn save_overlay(&self, document_id: &str, overlay: &AnnotationOverlay) -> CoreResult<()> {
        Ok(self.put_overlay(document_id, overlay)?)
    }

    async fn load_overlay(&self, document_id: &str) -> CoreResult<Option<AnnotationOverlay>> {
        Ok(self.get_overlay(document_id)?)
    }
}

#[async_trait]
impl DocumentStore for Database {
    async fn load_document(&self, id: &str) -> CoreResult<Option<SourceDocument>> {
        Ok(self.get_document(id)?)
    }

    async fn save_document(&self, document: &SourceDocument) -> CoreResult<()> {
        Ok(self.put_document(document)?)
    }
}
