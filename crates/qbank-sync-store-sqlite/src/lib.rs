#![allow(clippy::missing_errors_doc)]

//! SQLite rendition of the authoritative catalog: gap candidates and the
//! historical attribute assignments.

use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use qbank_sync_core::{
    BookId, CatalogRecord, CatalogSource, EligibilityFlags, EligibilityPredicate, HistorySource,
    PackagingInfo, QuestionKey, UNRESOLVED_ATTRIBUTE,
};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

const SCHEMA_CATALOG_V1: &str = r"
CREATE TABLE IF NOT EXISTS institutions (
  id INTEGER PRIMARY KEY,
  name TEXT NOT NULL,
  domain TEXT,
  active INTEGER NOT NULL DEFAULT 1 CHECK (active IN (0, 1))
);

CREATE TABLE IF NOT EXISTS books (
  id INTEGER PRIMARY KEY,
  institution_id INTEGER NOT NULL,
  name TEXT NOT NULL,
  course_id INTEGER,
  deleted INTEGER NOT NULL DEFAULT 0 CHECK (deleted IN (0, 1)),
  creates_trial_exams INTEGER NOT NULL DEFAULT 0 CHECK (creates_trial_exams IN (0, 1)),
  FOREIGN KEY (institution_id) REFERENCES institutions(id)
);

CREATE TABLE IF NOT EXISTS book_packaging (
  book_id INTEGER PRIMARY KEY,
  packaged_book_id INTEGER,
  zip_version TEXT,
  packaged_book_name TEXT,
  packaged_book_version TEXT,
  package_exe TEXT,
  FOREIGN KEY (book_id) REFERENCES books(id)
);

CREATE TABLE IF NOT EXISTS tests (
  id INTEGER PRIMARY KEY,
  book_id INTEGER NOT NULL,
  deleted INTEGER NOT NULL DEFAULT 0 CHECK (deleted IN (0, 1)),
  question_count INTEGER NOT NULL DEFAULT 0,
  FOREIGN KEY (book_id) REFERENCES books(id)
);

CREATE TABLE IF NOT EXISTS superseded_books (
  book_id INTEGER PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS question_attribute_history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  book_id INTEGER NOT NULL,
  test_id INTEGER NOT NULL,
  question_no INTEGER NOT NULL,
  attribute_id INTEGER,
  recorded_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_attribute_history_question
  ON question_attribute_history(book_id, test_id, question_no);
CREATE INDEX IF NOT EXISTS idx_tests_book
  ON tests(book_id);
";

// Every clause of the eligibility conjunction lives in the query; the
// exclusion list is bound as an array.
const CANDIDATES_SQL: &str = r"
SELECT
  i.id, i.name, i.domain,
  b.id, b.name, b.course_id, b.creates_trial_exams,
  p.packaged_book_id, p.zip_version, p.packaged_book_name, p.packaged_book_version,
  SUM(t.question_count)
FROM institutions i
JOIN books b ON b.institution_id = i.id
JOIN book_packaging p ON p.book_id = b.id
JOIN tests t ON t.book_id = b.id
WHERE i.active = 1
  AND b.deleted = 0
  AND i.id NOT IN (SELECT value FROM rarray(?1))
  AND t.deleted = 0
  AND t.question_count > 0
  AND b.id NOT IN (SELECT book_id FROM superseded_books)
  AND p.packaged_book_version IS NOT NULL
  AND p.package_exe IS NULL
GROUP BY i.id, b.id
ORDER BY i.id, b.id
";

const HISTORY_SQL: &str = r"
SELECT attribute_id
FROM question_attribute_history
WHERE book_id = ?1
  AND test_id = ?2
  AND question_no = ?3
  AND attribute_id IS NOT NULL
  AND attribute_id != ?4
ORDER BY recorded_at DESC, id DESC
LIMIT 1
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteStoreOptions {
    pub busy_timeout: Duration,
}

impl Default for SqliteStoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

pub struct SqliteCatalogStore {
    conn: Connection,
}

impl SqliteCatalogStore {
    pub fn open(path: &Path, options: &SqliteStoreOptions) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;
        conn.busy_timeout(options.busy_timeout)
            .context("failed to configure sqlite busy timeout")?;
        rusqlite::vtab::array::load_module(&conn)
            .context("failed to load sqlite array module")?;

        tracing::debug!(target: "qbank_sync::store", path = %path.display(), "catalog store opened");
        Ok(Self { conn })
    }

    /// Creates the catalog tables when absent. Production catalogs are owned
    /// elsewhere; this is for fixtures and local runs.
    pub fn ensure_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_CATALOG_V1)
            .context("failed to apply catalog schema")
    }

    pub fn ping(&self) -> Result<()> {
        let one: i64 = self
            .conn
            .query_row("SELECT 1", [], |row| row.get(0))
            .context("catalog ping failed")?;
        anyhow::ensure!(one == 1, "catalog ping returned {one}");
        Ok(())
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl CatalogSource for SqliteCatalogStore {
    fn load_candidates(&self, predicate: &EligibilityPredicate) -> Result<Vec<CatalogRecord>> {
        let excluded: Rc<Vec<Value>> = Rc::new(
            predicate
                .excluded_institution_ids
                .iter()
                .copied()
                .map(Value::from)
                .collect(),
        );

        let mut stmt = self
            .conn
            .prepare(CANDIDATES_SQL)
            .context("failed to prepare candidate query")?;
        let rows = stmt
            .query_map(params![excluded], parse_candidate_row)
            .context("failed to query gap candidates")?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("failed to decode candidate row")?);
        }

        tracing::debug!(
            target: "qbank_sync::store",
            candidates = records.len(),
            excluded = ?predicate.excluded_institution_ids,
            "loaded gap candidates"
        );
        Ok(records)
    }
}

impl HistorySource for SqliteCatalogStore {
    fn historical_attribute(&self, key: QuestionKey) -> Result<Option<i64>> {
        self.conn
            .query_row(
                HISTORY_SQL,
                params![
                    key.book_id.0,
                    key.test_id,
                    key.question_no,
                    UNRESOLVED_ATTRIBUTE
                ],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read attribute history for {key}"))
    }
}

fn parse_candidate_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CatalogRecord> {
    Ok(CatalogRecord {
        institution_id: row.get(0)?,
        institution_name: row.get(1)?,
        institution_domain: row.get(2)?,
        book_id: BookId(row.get(3)?),
        book_name: row.get(4)?,
        course_id: row.get(5)?,
        creates_trial_exams: row.get(6)?,
        packaging: PackagingInfo {
            packaged_book_id: row.get(7)?,
            zip_version: row.get(8)?,
            packaged_book_name: row.get(9)?,
            packaged_book_version: row.get(10)?,
        },
        // Rows only come back when every clause held.
        eligibility: EligibilityFlags {
            institution_active: true,
            deleted: false,
            question_count: row.get(11)?,
            superseded: false,
            packaged: false,
        },
    })
}
