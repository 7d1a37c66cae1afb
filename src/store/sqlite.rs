//! SQLite document store backend

use super::traits::{DocumentStore, OpenStore, StoreError, StoreResult};
use crate::model::{
    Book, BookId, BookStatus, Chapter, Chunk, Claim, ClaimLabel, ClaimType, ExtractionMethod,
    FinalOutput, Idea, IdeaExample, PipelineVariant, RecordId, User,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

/// SQLite-backed document store
///
/// Single database file, one table per record class. Thread-safe via an
/// internal mutex on the connection. Child tables declare
/// `ON DELETE CASCADE` foreign keys so deleting a book removes every chunk,
/// chapter, claim, idea, and final output that references it.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Initialize the database schema
    fn init_schema(conn: &Connection) -> StoreResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                credential_hash TEXT,
                external_identity TEXT,
                avatar_url TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS books (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                author TEXT,
                original_filename TEXT NOT NULL,
                page_count INTEGER,
                original_word_count INTEGER,
                variant TEXT NOT NULL,
                status TEXT NOT NULL,
                current_step TEXT,
                progress INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                processing_started_at TEXT,
                processing_completed_at TEXT,
                total_chunks INTEGER,
                total_chapters INTEGER,
                density_score REAL,
                recommended_compression REAL,
                extraction_method TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_books_user_created
                ON books(user_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                book_id TEXT NOT NULL,
                ord INTEGER NOT NULL,
                text TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (book_id, ord),
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS chapters (
                id TEXT PRIMARY KEY,
                book_id TEXT NOT NULL,
                ord INTEGER NOT NULL,
                title TEXT NOT NULL,
                level INTEGER NOT NULL,
                original_content TEXT NOT NULL,
                original_token_count INTEGER NOT NULL,
                compressed_content TEXT,
                key_insights_json TEXT,
                compressed_token_count INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (book_id, ord),
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS claims (
                id TEXT PRIMARY KEY,
                book_id TEXT NOT NULL,
                chunk_id TEXT NOT NULL,
                text TEXT NOT NULL,
                claim_type TEXT NOT NULL,
                label TEXT,
                score REAL,
                reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_claims_book_label
                ON claims(book_id, label);

            CREATE TABLE IF NOT EXISTS ideas (
                id TEXT PRIMARY KEY,
                book_id TEXT NOT NULL,
                ord INTEGER NOT NULL,
                title TEXT NOT NULL,
                merged_claims_json TEXT NOT NULL,
                principle TEXT,
                behavior_delta TEXT,
                examples_json TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (book_id, ord),
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS final_outputs (
                book_id TEXT PRIMARY KEY,
                markdown TEXT NOT NULL,
                word_count INTEGER NOT NULL,
                unit_count INTEGER NOT NULL,
                compression_ratio REAL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
            );
            "#,
        )?;
        Ok(())
    }

    fn configure(conn: &Connection) -> StoreResult<()> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        // WAL allows pollers to read while a pipeline job writes.
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a panic mid-statement; propagating the
        // panic is the only sane option for an embedded store.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl OpenStore for SqliteStore {
    fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

// --- Row mapping helpers ---

fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn parse_ts(raw: String) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::DateParse(format!("{}: {}", raw, e)))
}

fn parse_opt_ts(raw: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    raw.map(parse_ts).transpose()
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<(User, String, String)> {
    Ok((
        User {
            id: RecordId::from_string(row.get::<_, String>(0)?),
            email: row.get(1)?,
            display_name: row.get(2)?,
            credential_hash: row.get(3)?,
            external_identity: row.get(4)?,
            avatar_url: row.get(5)?,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        },
        row.get(6)?,
        row.get(7)?,
    ))
}

fn finish_user((mut user, created, updated): (User, String, String)) -> StoreResult<User> {
    user.created_at = parse_ts(created)?;
    user.updated_at = parse_ts(updated)?;
    Ok(user)
}

struct BookRow {
    book: Book,
    variant: String,
    status: String,
    extraction_method: Option<String>,
    started: Option<String>,
    completed: Option<String>,
    created: String,
    updated: String,
}

fn row_to_book(row: &Row<'_>) -> rusqlite::Result<BookRow> {
    let book = Book {
        id: BookId::from_string(row.get::<_, String>(0)?),
        user_id: RecordId::from_string(row.get::<_, String>(1)?),
        title: row.get(2)?,
        author: row.get(3)?,
        original_filename: row.get(4)?,
        page_count: row.get(5)?,
        original_word_count: row.get(6)?,
        variant: PipelineVariant::Claims, // patched in finish_book
        status: BookStatus::Uploaded,     // patched in finish_book
        current_step: row.get(9)?,
        progress: row.get(10)?,
        error: row.get(11)?,
        processing_started_at: None,
        processing_completed_at: None,
        total_chunks: row.get(14)?,
        total_chapters: row.get(15)?,
        density_score: row.get(16)?,
        recommended_compression: row.get(17)?,
        extraction_method: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    Ok(BookRow {
        book,
        variant: row.get(7)?,
        status: row.get(8)?,
        extraction_method: row.get(18)?,
        started: row.get(12)?,
        completed: row.get(13)?,
        created: row.get(19)?,
        updated: row.get(20)?,
    })
}

fn finish_book(raw: BookRow) -> StoreResult<Book> {
    let mut book = raw.book;
    book.variant = raw
        .variant
        .parse::<PipelineVariant>()
        .map_err(StoreError::Corrupt)?;
    book.status = raw
        .status
        .parse::<BookStatus>()
        .map_err(StoreError::Corrupt)?;
    book.extraction_method = raw
        .extraction_method
        .map(|m| m.parse::<ExtractionMethod>().map_err(StoreError::Corrupt))
        .transpose()?;
    book.processing_started_at = parse_opt_ts(raw.started)?;
    book.processing_completed_at = parse_opt_ts(raw.completed)?;
    book.created_at = parse_ts(raw.created)?;
    book.updated_at = parse_ts(raw.updated)?;
    Ok(book)
}

const BOOK_COLUMNS: &str = "id, user_id, title, author, original_filename, page_count, \
     original_word_count, variant, status, current_step, progress, error, \
     processing_started_at, processing_completed_at, total_chunks, total_chapters, \
     density_score, recommended_compression, extraction_method, created_at, updated_at";

impl DocumentStore for SqliteStore {
    fn insert_user(&self, user: &User) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO users (id, email, display_name, credential_hash, external_identity, \
             avatar_url, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                user.id.as_str(),
                user.email,
                user.display_name,
                user.credential_hash,
                user.external_identity,
                user.avatar_url,
                ts(&user.created_at),
                ts(&user.updated_at),
            ],
        )?;
        Ok(())
    }

    fn get_user(&self, id: &RecordId) -> StoreResult<Option<User>> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                "SELECT id, email, display_name, credential_hash, external_identity, avatar_url, \
                 created_at, updated_at FROM users WHERE id = ?1",
                params![id.as_str()],
                row_to_user,
            )
            .optional()?;
        raw.map(finish_user).transpose()
    }

    fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                "SELECT id, email, display_name, credential_hash, external_identity, avatar_url, \
                 created_at, updated_at FROM users WHERE email = ?1",
                params![email],
                row_to_user,
            )
            .optional()?;
        raw.map(finish_user).transpose()
    }

    fn insert_book(&self, book: &Book) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            &format!(
                "INSERT INTO books ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, \
                 ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
                BOOK_COLUMNS
            ),
            params![
                book.id.as_str(),
                book.user_id.as_str(),
                book.title,
                book.author,
                book.original_filename,
                book.page_count,
                book.original_word_count,
                book.variant.as_str(),
                book.status.as_str(),
                book.current_step,
                book.progress,
                book.error,
                book.processing_started_at.as_ref().map(ts),
                book.processing_completed_at.as_ref().map(ts),
                book.total_chunks,
                book.total_chapters,
                book.density_score,
                book.recommended_compression,
                book.extraction_method.map(|m| m.as_str()),
                ts(&book.created_at),
                ts(&book.updated_at),
            ],
        )?;
        Ok(())
    }

    fn get_book(&self, id: &BookId) -> StoreResult<Option<Book>> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM books WHERE id = ?1", BOOK_COLUMNS),
                params![id.as_str()],
                row_to_book,
            )
            .optional()?;
        raw.map(finish_book).transpose()
    }

    fn list_books_for_user(&self, user_id: &RecordId) -> StoreResult<Vec<Book>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM books WHERE user_id = ?1 ORDER BY created_at DESC",
            BOOK_COLUMNS
        ))?;
        let rows = stmt.query_map(params![user_id.as_str()], row_to_book)?;
        let mut books = Vec::new();
        for raw in rows {
            books.push(finish_book(raw?)?);
        }
        Ok(books)
    }

    fn update_book(&self, book: &Book) -> StoreResult<bool> {
        let conn = self.lock();
        let affected = conn.execute(
            "UPDATE books SET user_id = ?2, title = ?3, author = ?4, original_filename = ?5, \
             page_count = ?6, original_word_count = ?7, variant = ?8, status = ?9, \
             current_step = ?10, progress = ?11, error = ?12, processing_started_at = ?13, \
             processing_completed_at = ?14, total_chunks = ?15, total_chapters = ?16, \
             density_score = ?17, recommended_compression = ?18, extraction_method = ?19, \
             updated_at = ?20 WHERE id = ?1",
            params![
                book.id.as_str(),
                book.user_id.as_str(),
                book.title,
                book.author,
                book.original_filename,
                book.page_count,
                book.original_word_count,
                book.variant.as_str(),
                book.status.as_str(),
                book.current_step,
                book.progress,
                book.error,
                book.processing_started_at.as_ref().map(ts),
                book.processing_completed_at.as_ref().map(ts),
                book.total_chunks,
                book.total_chapters,
                book.density_score,
                book.recommended_compression,
                book.extraction_method.map(|m| m.as_str()),
                ts(&Utc::now()),
            ],
        )?;
        Ok(affected > 0)
    }

    fn delete_book(&self, id: &BookId) -> StoreResult<bool> {
        let conn = self.lock();
        let affected = conn.execute("DELETE FROM books WHERE id = ?1", params![id.as_str()])?;
        Ok(affected > 0)
    }

    fn insert_chunks(&self, chunks: &[Chunk]) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO chunks (id, book_id, ord, text, token_count, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for chunk in chunks {
                stmt.execute(params![
                    chunk.id.as_str(),
                    chunk.book_id.as_str(),
                    chunk.order,
                    chunk.text,
                    chunk.token_count,
                    ts(&chunk.created_at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn list_chunks(&self, book_id: &BookId) -> StoreResult<Vec<Chunk>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, book_id, ord, text, token_count, created_at FROM chunks \
             WHERE book_id = ?1 ORDER BY ord",
        )?;
        let rows = stmt.query_map(params![book_id.as_str()], |row| {
            Ok((
                Chunk {
                    id: RecordId::from_string(row.get::<_, String>(0)?),
                    book_id: BookId::from_string(row.get::<_, String>(1)?),
                    order: row.get(2)?,
                    text: row.get(3)?,
                    token_count: row.get(4)?,
                    created_at: Utc::now(),
                },
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut chunks = Vec::new();
        for row in rows {
            let (mut chunk, created) = row?;
            chunk.created_at = parse_ts(created)?;
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    fn insert_chapters(&self, chapters: &[Chapter]) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO chapters (id, book_id, ord, title, level, original_content, \
                 original_token_count, compressed_content, key_insights_json, \
                 compressed_token_count, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for chapter in chapters {
                let insights_json = chapter
                    .key_insights
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                stmt.execute(params![
                    chapter.id.as_str(),
                    chapter.book_id.as_str(),
                    chapter.order,
                    chapter.title,
                    chapter.level,
                    chapter.original_content,
                    chapter.original_token_count,
                    chapter.compressed_content,
                    insights_json,
                    chapter.compressed_token_count,
                    ts(&chapter.created_at),
                    ts(&chapter.updated_at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn list_chapters(&self, book_id: &BookId) -> StoreResult<Vec<Chapter>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, book_id, ord, title, level, original_content, original_token_count, \
             compressed_content, key_insights_json, compressed_token_count, created_at, \
             updated_at FROM chapters WHERE book_id = ?1 ORDER BY ord",
        )?;
        let rows = stmt.query_map(params![book_id.as_str()], |row| {
            Ok((
                Chapter {
                    id: RecordId::from_string(row.get::<_, String>(0)?),
                    book_id: BookId::from_string(row.get::<_, String>(1)?),
                    order: row.get(2)?,
                    title: row.get(3)?,
                    level: row.get(4)?,
                    original_content: row.get(5)?,
                    original_token_count: row.get(6)?,
                    compressed_content: row.get(7)?,
                    key_insights: None,
                    compressed_token_count: row.get(9)?,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                },
                row.get::<_, Option<String>>(8)?,
                row.get::<_, String>(10)?,
                row.get::<_, String>(11)?,
            ))
        })?;
        let mut chapters = Vec::new();
        for row in rows {
            let (mut chapter, insights_json, created, updated) = row?;
            chapter.key_insights = insights_json
                .map(|j| serde_json::from_str::<Vec<String>>(&j))
                .transpose()?;
            chapter.created_at = parse_ts(created)?;
            chapter.updated_at = parse_ts(updated)?;
            chapters.push(chapter);
        }
        Ok(chapters)
    }

    fn update_chapter_compression(
        &self,
        id: &RecordId,
        compressed_content: &str,
        key_insights: &[String],
        compressed_token_count: u32,
    ) -> StoreResult<bool> {
        let conn = self.lock();
        let affected = conn.execute(
            "UPDATE chapters SET compressed_content = ?2, key_insights_json = ?3, \
             compressed_token_count = ?4, updated_at = ?5 WHERE id = ?1",
            params![
                id.as_str(),
                compressed_content,
                serde_json::to_string(key_insights)?,
                compressed_token_count,
                ts(&Utc::now()),
            ],
        )?;
        Ok(affected > 0)
    }

    fn insert_claims(&self, claims: &[Claim]) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO claims (id, book_id, chunk_id, text, claim_type, label, score, \
                 reason, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for claim in claims {
                stmt.execute(params![
                    claim.id.as_str(),
                    claim.book_id.as_str(),
                    claim.chunk_id.as_str(),
                    claim.text,
                    claim.claim_type.as_str(),
                    claim.label.map(|l| l.as_str()),
                    claim.score,
                    claim.reason,
                    ts(&claim.created_at),
                    ts(&claim.updated_at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn count_claims(&self, book_id: &BookId) -> StoreResult<u64> {
        let conn = self.lock();
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM claims WHERE book_id = ?1",
            params![book_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn list_unlabeled_claims(&self, book_id: &BookId) -> StoreResult<Vec<Claim>> {
        self.query_claims(
            "SELECT id, book_id, chunk_id, text, claim_type, label, score, reason, created_at, \
             updated_at FROM claims WHERE book_id = ?1 AND label IS NULL ORDER BY created_at",
            book_id,
        )
    }

    fn list_kept_claims(&self, book_id: &BookId) -> StoreResult<Vec<Claim>> {
        self.query_claims(
            "SELECT id, book_id, chunk_id, text, claim_type, label, score, reason, created_at, \
             updated_at FROM claims WHERE book_id = ?1 \
             AND label IN ('core_insight', 'supporting_insight') ORDER BY score DESC",
            book_id,
        )
    }

    fn update_claim_evaluation(
        &self,
        id: &RecordId,
        label: ClaimLabel,
        score: f64,
        reason: &str,
    ) -> StoreResult<bool> {
        let conn = self.lock();
        let affected = conn.execute(
            "UPDATE claims SET label = ?2, score = ?3, reason = ?4, updated_at = ?5 WHERE id = ?1",
            params![id.as_str(), label.as_str(), score, reason, ts(&Utc::now())],
        )?;
        Ok(affected > 0)
    }

    fn delete_ideas(&self, book_id: &BookId) -> StoreResult<u64> {
        let conn = self.lock();
        let affected = conn.execute(
            "DELETE FROM ideas WHERE book_id = ?1",
            params![book_id.as_str()],
        )?;
        Ok(affected as u64)
    }

    fn insert_ideas(&self, ideas: &[Idea]) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO ideas (id, book_id, ord, title, merged_claims_json, principle, \
                 behavior_delta, examples_json, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for idea in ideas {
                let examples_json = idea
                    .examples
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                stmt.execute(params![
                    idea.id.as_str(),
                    idea.book_id.as_str(),
                    idea.order,
                    idea.title,
                    serde_json::to_string(&idea.merged_claims)?,
                    idea.principle,
                    idea.behavior_delta,
                    examples_json,
                    ts(&idea.created_at),
                    ts(&idea.updated_at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn list_ideas(&self, book_id: &BookId) -> StoreResult<Vec<Idea>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, book_id, ord, title, merged_claims_json, principle, behavior_delta, \
             examples_json, created_at, updated_at FROM ideas WHERE book_id = ?1 ORDER BY ord",
        )?;
        let rows = stmt.query_map(params![book_id.as_str()], |row| {
            Ok((
                Idea {
                    id: RecordId::from_string(row.get::<_, String>(0)?),
                    book_id: BookId::from_string(row.get::<_, String>(1)?),
                    order: row.get(2)?,
                    title: row.get(3)?,
                    merged_claims: Vec::new(),
                    principle: row.get(5)?,
                    behavior_delta: row.get(6)?,
                    examples: None,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                },
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
            ))
        })?;
        let mut ideas = Vec::new();
        for row in rows {
            let (mut idea, merged_json, examples_json, created, updated) = row?;
            idea.merged_claims = serde_json::from_str(&merged_json)?;
            idea.examples = examples_json
                .map(|j| serde_json::from_str::<Vec<IdeaExample>>(&j))
                .transpose()?;
            idea.created_at = parse_ts(created)?;
            idea.updated_at = parse_ts(updated)?;
            ideas.push(idea);
        }
        Ok(ideas)
    }

    fn upsert_final_output(&self, output: &FinalOutput) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO final_outputs (book_id, markdown, word_count, unit_count, \
             compression_ratio, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(book_id) DO UPDATE SET markdown = excluded.markdown, \
             word_count = excluded.word_count, unit_count = excluded.unit_count, \
             compression_ratio = excluded.compression_ratio, updated_at = excluded.updated_at",
            params![
                output.book_id.as_str(),
                output.markdown,
                output.word_count,
                output.unit_count,
                output.compression_ratio,
                ts(&output.created_at),
                ts(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    fn get_final_output(&self, book_id: &BookId) -> StoreResult<Option<FinalOutput>> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                "SELECT book_id, markdown, word_count, unit_count, compression_ratio, \
                 created_at, updated_at FROM final_outputs WHERE book_id = ?1",
                params![book_id.as_str()],
                |row| {
                    Ok((
                        FinalOutput {
                            book_id: BookId::from_string(row.get::<_, String>(0)?),
                            markdown: row.get(1)?,
                            word_count: row.get(2)?,
                            unit_count: row.get(3)?,
                            compression_ratio: row.get(4)?,
                            created_at: Utc::now(),
                            updated_at: Utc::now(),
                        },
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;
        match raw {
            Some((mut output, created, updated)) => {
                output.created_at = parse_ts(created)?;
                output.updated_at = parse_ts(updated)?;
                Ok(Some(output))
            }
            None => Ok(None),
        }
    }
}

impl SqliteStore {
    fn query_claims(&self, sql: &str, book_id: &BookId) -> StoreResult<Vec<Claim>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![book_id.as_str()], |row| {
            Ok((
                Claim {
                    id: RecordId::from_string(row.get::<_, String>(0)?),
                    book_id: BookId::from_string(row.get::<_, String>(1)?),
                    chunk_id: RecordId::from_string(row.get::<_, String>(2)?),
                    text: row.get(3)?,
                    claim_type: ClaimType::Principle, // patched below
                    label: None,
                    score: row.get(6)?,
                    reason: row.get(7)?,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                },
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
            ))
        })?;
        let mut claims = Vec::new();
        for row in rows {
            let (mut claim, claim_type, label, created, updated) = row?;
            claim.claim_type = claim_type
                .parse::<ClaimType>()
                .map_err(StoreError::Corrupt)?;
            claim.label = label
                .map(|l| l.parse::<ClaimLabel>().map_err(StoreError::Corrupt))
                .transpose()?;
            claim.created_at = parse_ts(created)?;
            claim.updated_at = parse_ts(updated)?;
            claims.push(claim);
        }
        Ok(claims)
    }
}
