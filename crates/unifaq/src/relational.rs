//! Relational store seam. The engine consumes schema introspection,
//! read-only query execution, and a handful of typed join lookups used to
//! turn structured rows into prose for the generator.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A single SQL cell, typed. Rows never surface as positional tuples.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl std::fmt::Display for SqlValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Integer(v) => write!(f, "{}", v),
            SqlValue::Real(v) => write!(f, "{}", v),
            SqlValue::Text(v) => write!(f, "{}", v),
        }
    }
}

/// A result row with named columns.
#[derive(Debug, Clone)]
pub struct SqlRow {
    pub columns: Vec<String>,
    pub values: Vec<SqlValue>,
}

impl SqlRow {
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    /// `colonna: valore` pairs, used when narrating rows back to prose.
    pub fn to_pairs(&self) -> String {
        self.columns
            .iter()
            .zip(&self.values)
            .map(|(c, v)| format!("{}: {}", c, v))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Course row joined with its professor, rendered as prose for context.
#[derive(Debug, Clone)]
pub struct CourseProfile {
    pub name: String,
    pub credits: i64,
    pub professor: Option<String>,
    pub exam_format: Option<String>,
    pub semester: Option<i64>,
}

impl std::fmt::Display for CourseProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Il corso '{}' vale {} CFU", self.name, self.credits)?;
        if let Some(prof) = &self.professor {
            write!(f, ", è tenuto da {}", prof)?;
        }
        if let Some(exam) = &self.exam_format {
            write!(f, ", modalità d'esame: {}", exam)?;
        }
        if let Some(sem) = self.semester {
            write!(f, ", erogato nel semestre {}", sem)?;
        }
        write!(f, ".")
    }
}

#[derive(Debug, Clone)]
pub struct ProfessorProfile {
    pub full_name: String,
    pub department: Option<String>,
    pub courses: Vec<String>,
}

impl std::fmt::Display for ProfessorProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_name)?;
        if let Some(dep) = &self.department {
            write!(f, ", dipartimento di {}", dep)?;
        }
        if !self.courses.is_empty() {
            write!(f, ", insegna: {}", self.courses.join(", "))?;
        }
        write!(f, ".")
    }
}

#[derive(Debug, Clone)]
pub struct ExamProfile {
    pub course: String,
    pub date: Option<String>,
    pub location: Option<String>,
}

impl std::fmt::Display for ExamProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Appello d'esame per '{}'", self.course)?;
        if let Some(date) = &self.date {
            write!(f, " in data {}", date)?;
        }
        if let Some(loc) = &self.location {
            write!(f, ", aula {}", loc)?;
        }
        write!(f, ".")
    }
}

#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Human-readable table/column listing embedded in the NL→SQL prompt.
    async fn get_schema(&self) -> Result<String>;

    /// Execute a (validated) SELECT inside a transaction and fetch all rows.
    async fn run_query(&self, sql: &str) -> Result<Vec<SqlRow>>;

    /// Resolve a course row into a joined profile.
    async fn course_profile(&self, pk: i64) -> Result<Option<CourseProfile>>;

    /// Resolve a professor row into a joined profile.
    async fn professor_profile(&self, pk: i64) -> Result<Option<ProfessorProfile>>;

    /// Resolve an exam row into a joined profile.
    async fn exam_profile(&self, pk: i64) -> Result<Option<ExamProfile>>;

    /// Roll back any open transaction. Safe to call when none is open.
    async fn rollback(&self);

    /// Release the underlying connection. Further calls fail.
    async fn close(&self);
}

/// Opens one store per router invocation so connections are never shared
/// across concurrent requests.
pub trait StoreFactory: Send + Sync {
    fn open(&self) -> Result<Arc<dyn RelationalStore>>;
}

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| anyhow!("Database lock poisoned"))?;
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(anyhow!("Database connection already closed")),
        }
    }
}

fn value_from_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(r) => SqlValue::Real(r),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(_) => SqlValue::Text("<blob>".to_string()),
    }
}

#[async_trait]
impl RelationalStore for SqliteStore {
    async fn get_schema(&self) -> Result<String> {
        self.with_conn(|conn| {
            let mut tables = Vec::new();
            {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table' \
                     AND name NOT LIKE 'sqlite_%' ORDER BY name",
                )?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    tables.push(row.get::<_, String>(0)?);
                }
            }

            let mut schema = String::new();
            for table in &tables {
                let mut stmt = conn.prepare(&format!("PRAGMA table_info('{}')", table))?;
                let mut rows = stmt.query([])?;
                let mut columns = Vec::new();
                while let Some(row) = rows.next()? {
                    let name: String = row.get(1)?;
                    let ty: String = row.get(2)?;
                    columns.push(format!("{} {}", name, ty));
                }
                schema.push_str(&format!("TABLE {} ({})\n", table, columns.join(", ")));
            }
            Ok(schema)
        })
    }

    async fn run_query(&self, sql: &str) -> Result<Vec<SqlRow>> {
        self.with_conn(|conn| {
            // SELECT-only queries still run inside an explicit transaction
            // so a mid-query failure never leaves the connection dirty.
            conn.execute_batch("BEGIN")?;
            let result = (|| -> Result<Vec<SqlRow>> {
                let mut stmt = conn.prepare(sql)?;
                let columns: Vec<String> =
                    stmt.column_names().iter().map(|c| c.to_string()).collect();
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let mut values = Vec::with_capacity(columns.len());
                    for i in 0..columns.len() {
                        values.push(value_from_ref(row.get_ref(i)?));
                    }
                    out.push(SqlRow {
                        columns: columns.clone(),
                        values,
                    });
                }
                Ok(out)
            })();

            match result {
                Ok(rows) => {
                    conn.execute_batch("COMMIT")?;
                    Ok(rows)
                }
                Err(e) => {
                    conn.execute_batch("ROLLBACK").ok();
                    Err(e)
                }
            }
        })
    }

    async fn course_profile(&self, pk: i64) -> Result<Option<CourseProfile>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.nome, c.cfu, c.modalita_esame, c.semestre, \
                        d.nome || ' ' || d.cognome \
                 FROM corso c LEFT JOIN docente d ON c.docente_id = d.id \
                 WHERE c.id = ?1",
            )?;
            let mut rows = stmt.query([pk])?;
            match rows.next()? {
                Some(row) => Ok(Some(CourseProfile {
                    name: row.get(0)?,
                    credits: row.get(1)?,
                    exam_format: row.get(2)?,
                    semester: row.get(3)?,
                    professor: row.get(4)?,
                })),
                None => Ok(None),
            }
        })
    }

    async fn professor_profile(&self, pk: i64) -> Result<Option<ProfessorProfile>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT d.nome || ' ' || d.cognome, d.dipartimento \
                 FROM docente d WHERE d.id = ?1",
            )?;
            let mut rows = stmt.query([pk])?;
            let (full_name, department) = match rows.next()? {
                Some(row) => (row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?),
                None => return Ok(None),
            };
            drop(rows);
            drop(stmt);

            let mut stmt =
                conn.prepare("SELECT nome FROM corso WHERE docente_id = ?1 ORDER BY nome")?;
            let mut rows = stmt.query([pk])?;
            let mut courses = Vec::new();
            while let Some(row) = rows.next()? {
                courses.push(row.get::<_, String>(0)?);
            }

            Ok(Some(ProfessorProfile {
                full_name,
                department,
                courses,
            }))
        })
    }

    async fn exam_profile(&self, pk: i64) -> Result<Option<ExamProfile>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.nome, e.data, e.aula \
                 FROM esame e JOIN corso c ON e.corso_id = c.id \
                 WHERE e.id = ?1",
            )?;
            let mut rows = stmt.query([pk])?;
            match rows.next()? {
                Some(row) => Ok(Some(ExamProfile {
                    course: row.get(0)?,
                    date: row.get(1)?,
                    location: row.get(2)?,
                })),
                None => Ok(None),
            }
        })
    }

    async fn rollback(&self) {
        let result = self.with_conn(|conn| {
            // Errors with "no transaction is active" when nothing is open.
            conn.execute_batch("ROLLBACK").ok();
            Ok(())
        });
        if let Err(e) = result {
            tracing::debug!(error = %e, "Rollback on closed connection ignored");
        }
    }

    async fn close(&self) {
        match self.conn.lock() {
            Ok(mut guard) => {
                if guard.take().is_none() {
                    tracing::debug!("Connection already closed");
                }
            }
            Err(_) => tracing::warn!("Database lock poisoned during close"),
        }
    }
}

/// Factory producing one `SqliteStore` per router invocation.
pub struct SqliteStoreFactory {
    path: PathBuf,
}

impl SqliteStoreFactory {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl StoreFactory for SqliteStoreFactory {
    fn open(&self) -> Result<Arc<dyn RelationalStore>> {
        Ok(Arc::new(SqliteStore::open(&self.path)?))
    }
}

#[cfg(test)]
pub(crate) fn seed_test_db(store: &SqliteStore) -> Result<()> {
    store.with_conn(|conn| {
        conn.execute_batch(
            "CREATE TABLE docente (id INTEGER PRIMARY KEY, nome TEXT, cognome TEXT, \
                                   dipartimento TEXT);
             CREATE TABLE corso (id INTEGER PRIMARY KEY, nome TEXT, cfu INTEGER, \
                                 docente_id INTEGER, modalita_esame TEXT, semestre INTEGER);
             CREATE TABLE esame (id INTEGER PRIMARY KEY, corso_id INTEGER, data TEXT, \
                                 aula TEXT);
             INSERT INTO docente VALUES (1, 'Maria', 'Rossi', 'Informatica');
             INSERT INTO corso VALUES (1, 'Basi di Dati', 6, 1, 'scritto e orale', 1);
             INSERT INTO corso VALUES (2, 'Sistemi Operativi', 9, 1, 'scritto', 2);
             INSERT INTO esame VALUES (1, 1, '2026-06-15', 'A3');",
        )?;
        Ok(())
    })
}
