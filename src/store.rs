//! 持久化
//!
//! 书籍、段落、题目和图片资产的存储接口，提供 SQLite 与内存两种实现。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::asset_manager::ImageAsset;
use crate::error::{StoreError, StoreResult};
use crate::markup::recount;
use crate::question::{Choice, Question, QUESTIONS_PER_PARAGRAPH};

/// 书籍记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub id: i64,
    pub title: String,
    pub file_path: String,
    pub format: String,
    pub cover_url: Option<String>,
}

/// 段落记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paragraph {
    pub id: i64,
    pub book_id: i64,
    /// 书内顺序号，从 1 开始连续编号
    pub sequence: i64,
    pub content: String,
    pub word_count: usize,
}

/// 书籍存储（由上传层使用）
pub trait BookStore: Send + Sync {
    fn create_book(&self, title: &str, file_path: &str, format: &str) -> StoreResult<i64>;
    fn get_book(&self, book_id: i64) -> StoreResult<Option<Book>>;
    fn set_cover_url(&self, book_id: i64, cover_url: Option<&str>) -> StoreResult<()>;
    /// 删除书籍及其全部段落
    fn delete_book(&self, book_id: i64) -> StoreResult<()>;
}

/// 段落存储
pub trait ParagraphStore: Send + Sync {
    fn create_paragraph(
        &self,
        book_id: i64,
        sequence: i64,
        content: &str,
        word_count: usize,
    ) -> StoreResult<i64>;

    /// 按顺序号升序返回
    fn list_paragraphs(&self, book_id: i64) -> StoreResult<Vec<Paragraph>>;

    fn get_paragraph(&self, paragraph_id: i64) -> StoreResult<Option<Paragraph>>;

    /// 删除书籍的全部段落，返回删除数量
    fn delete_paragraphs(&self, book_id: i64) -> StoreResult<usize>;

    /// 按 ID 删除段落（导入回滚时只删除本次创建的段落），返回删除数量
    fn remove_paragraphs(&self, paragraph_ids: &[i64]) -> StoreResult<usize>;

    /// 修改段落内容，字数通过 `recount` 重新计算
    fn update_content(&self, paragraph_id: i64, content: &str) -> StoreResult<()>;

    /// 记录图片资产，已存在的 `(book_id, hash)` 忽略
    fn record_images(&self, assets: &[ImageAsset]) -> StoreResult<()>;
}

/// 题目存储
pub trait QuestionStore: Send + Sync {
    fn has_questions(&self, paragraph_id: i64) -> StoreResult<bool>;

    fn list_questions(&self, paragraph_id: i64) -> StoreResult<Vec<Question>>;

    /// 保存五道题目
    ///
    /// 整组写入；段落已有题目时不做任何修改并返回 false
    fn save_questions(&self, paragraph_id: i64, questions: &[Question]) -> StoreResult<bool>;
}

fn check_question_count(questions: &[Question]) -> StoreResult<()> {
    if questions.len() != QUESTIONS_PER_PARAGRAPH {
        return Err(StoreError::Invalid(format!(
            "每个段落需要 {} 道题目，实际 {} 道",
            QUESTIONS_PER_PARAGRAPH,
            questions.len()
        )));
    }
    Ok(())
}

// ==================== SQLite ====================

/// SQLite 存储
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// 打开（或创建）数据库文件
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// 内存数据库
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            "PRAGMA encoding = 'UTF-8';
             PRAGMA foreign_keys = ON;

             CREATE TABLE IF NOT EXISTS books (
                 id INTEGER PRIMARY KEY,
                 title TEXT NOT NULL,
                 file_path TEXT NOT NULL,
                 format TEXT NOT NULL,
                 cover_url TEXT,
                 added_at DATETIME DEFAULT CURRENT_TIMESTAMP
             );

             CREATE TABLE IF NOT EXISTS paragraphs (
                 id INTEGER PRIMARY KEY,
                 book_id INTEGER NOT NULL,
                 sequence INTEGER NOT NULL,
                 content TEXT NOT NULL,
                 word_count INTEGER NOT NULL,
                 UNIQUE (book_id, sequence)
             );

             CREATE TABLE IF NOT EXISTS questions (
                 id INTEGER PRIMARY KEY,
                 paragraph_id INTEGER NOT NULL REFERENCES paragraphs(id) ON DELETE CASCADE,
                 position INTEGER NOT NULL,
                 question_text TEXT NOT NULL,
                 option_a TEXT NOT NULL,
                 option_b TEXT NOT NULL,
                 option_c TEXT NOT NULL,
                 option_d TEXT NOT NULL,
                 correct_answer TEXT NOT NULL CHECK (correct_answer IN ('A', 'B', 'C', 'D')),
                 UNIQUE (paragraph_id, position)
             );

             CREATE TABLE IF NOT EXISTS image_assets (
                 book_id INTEGER NOT NULL,
                 content_hash TEXT NOT NULL,
                 url TEXT NOT NULL,
                 file_path TEXT NOT NULL,
                 PRIMARY KEY (book_id, content_hash)
             );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn paragraph_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Paragraph> {
    Ok(Paragraph {
        id: row.get(0)?,
        book_id: row.get(1)?,
        sequence: row.get(2)?,
        content: row.get(3)?,
        word_count: row.get::<_, i64>(4)? as usize,
    })
}

impl BookStore for SqliteStore {
    fn create_book(&self, title: &str, file_path: &str, format: &str) -> StoreResult<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO books (title, file_path, format) VALUES (?1, ?2, ?3)",
            params![title, file_path, format],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_book(&self, book_id: i64) -> StoreResult<Option<Book>> {
        let conn = self.lock()?;
        let book = conn
            .query_row(
                "SELECT id, title, file_path, format, cover_url FROM books WHERE id = ?1",
                [book_id],
                |row| {
                    Ok(Book {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        file_path: row.get(2)?,
                        format: row.get(3)?,
                        cover_url: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(book)
    }

    fn set_cover_url(&self, book_id: i64, cover_url: Option<&str>) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE books SET cover_url = ?1 WHERE id = ?2",
            params![cover_url, book_id],
        )?;
        Ok(())
    }

    fn delete_book(&self, book_id: i64) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM paragraphs WHERE book_id = ?1", [book_id])?;
        tx.execute("DELETE FROM image_assets WHERE book_id = ?1", [book_id])?;
        tx.execute("DELETE FROM books WHERE id = ?1", [book_id])?;
        tx.commit()?;
        Ok(())
    }
}

impl ParagraphStore for SqliteStore {
    fn create_paragraph(
        &self,
        book_id: i64,
        sequence: i64,
        content: &str,
        word_count: usize,
    ) -> StoreResult<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO paragraphs (book_id, sequence, content, word_count) VALUES (?1, ?2, ?3, ?4)",
            params![book_id, sequence, content, word_count as i64],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn list_paragraphs(&self, book_id: i64) -> StoreResult<Vec<Paragraph>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, book_id, sequence, content, word_count
             FROM paragraphs WHERE book_id = ?1 ORDER BY sequence",
        )?;

        let paragraphs = stmt
            .query_map([book_id], paragraph_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(paragraphs)
    }

    fn get_paragraph(&self, paragraph_id: i64) -> StoreResult<Option<Paragraph>> {
        let conn = self.lock()?;
        let paragraph = conn
            .query_row(
                "SELECT id, book_id, sequence, content, word_count FROM paragraphs WHERE id = ?1",
                [paragraph_id],
                paragraph_from_row,
            )
            .optional()?;
        Ok(paragraph)
    }

    fn delete_paragraphs(&self, book_id: i64) -> StoreResult<usize> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM paragraphs WHERE book_id = ?1", [book_id])?;
        debug!(book_id, removed, "删除段落");
        Ok(removed)
    }

    fn remove_paragraphs(&self, paragraph_ids: &[i64]) -> StoreResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM paragraphs WHERE id = ?1")?;
            for id in paragraph_ids {
                removed += stmt.execute([id])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    fn update_content(&self, paragraph_id: i64, content: &str) -> StoreResult<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE paragraphs SET content = ?1, word_count = ?2 WHERE id = ?3",
            params![content, recount(content) as i64, paragraph_id],
        )?;
        if updated == 0 {
            return Err(StoreError::Invalid(format!("段落不存在: {}", paragraph_id)));
        }
        Ok(())
    }

    fn record_images(&self, assets: &[ImageAsset]) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO image_assets (book_id, content_hash, url, file_path)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for asset in assets {
                stmt.execute(params![
                    asset.book_id,
                    asset.content_hash,
                    asset.url,
                    asset.file_path.to_string_lossy()
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

impl QuestionStore for SqliteStore {
    fn has_questions(&self, paragraph_id: i64) -> StoreResult<bool> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM questions WHERE paragraph_id = ?1",
            [paragraph_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn list_questions(&self, paragraph_id: i64) -> StoreResult<Vec<Question>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT question_text, option_a, option_b, option_c, option_d, correct_answer
             FROM questions WHERE paragraph_id = ?1 ORDER BY position",
        )?;

        let rows = stmt
            .query_map([paragraph_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(question_text, option_a, option_b, option_c, option_d, answer)| {
                Ok(Question {
                    question_text,
                    option_a,
                    option_b,
                    option_c,
                    option_d,
                    correct_answer: answer.parse::<Choice>().map_err(StoreError::Invalid)?,
                })
            })
            .collect()
    }

    fn save_questions(&self, paragraph_id: i64, questions: &[Question]) -> StoreResult<bool> {
        check_question_count(questions)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let existing: i64 = tx.query_row(
            "SELECT COUNT(*) FROM questions WHERE paragraph_id = ?1",
            [paragraph_id],
            |row| row.get(0),
        )?;
        if existing > 0 {
            return Ok(false);
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO questions
                 (paragraph_id, position, question_text, option_a, option_b, option_c, option_d, correct_answer)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for (position, q) in questions.iter().enumerate() {
                stmt.execute(params![
                    paragraph_id,
                    position as i64,
                    q.question_text,
                    q.option_a,
                    q.option_b,
                    q.option_c,
                    q.option_d,
                    q.correct_answer.as_str(),
                ])?;
            }
        }

        tx.commit()?;
        Ok(true)
    }
}

// ==================== 内存实现 ====================

#[derive(Default)]
struct MemoryInner {
    next_book_id: i64,
    next_paragraph_id: i64,
    books: BTreeMap<i64, Book>,
    paragraphs: BTreeMap<i64, Paragraph>,
    questions: HashMap<i64, Vec<Question>>,
    images: HashSet<(i64, String)>,
}

/// 内存存储
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, MemoryInner>> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }

    /// 已记录的图片数量
    pub fn image_count(&self, book_id: i64) -> StoreResult<usize> {
        Ok(self.lock()?.images.iter().filter(|(id, _)| *id == book_id).count())
    }
}

impl BookStore for MemoryStore {
    fn create_book(&self, title: &str, file_path: &str, format: &str) -> StoreResult<i64> {
        let mut inner = self.lock()?;
        inner.next_book_id += 1;
        let id = inner.next_book_id;
        inner.books.insert(
            id,
            Book {
                id,
                title: title.to_string(),
                file_path: file_path.to_string(),
                format: format.to_string(),
                cover_url: None,
            },
        );
        Ok(id)
    }

    fn get_book(&self, book_id: i64) -> StoreResult<Option<Book>> {
        Ok(self.lock()?.books.get(&book_id).cloned())
    }

    fn set_cover_url(&self, book_id: i64, cover_url: Option<&str>) -> StoreResult<()> {
        if let Some(book) = self.lock()?.books.get_mut(&book_id) {
            book.cover_url = cover_url.map(str::to_string);
        }
        Ok(())
    }

    fn delete_book(&self, book_id: i64) -> StoreResult<()> {
        self.delete_paragraphs(book_id)?;
        let mut inner = self.lock()?;
        inner.images.retain(|(id, _)| *id != book_id);
        inner.books.remove(&book_id);
        Ok(())
    }
}

impl ParagraphStore for MemoryStore {
    fn create_paragraph(
        &self,
        book_id: i64,
        sequence: i64,
        content: &str,
        word_count: usize,
    ) -> StoreResult<i64> {
        let mut inner = self.lock()?;
        if inner
            .paragraphs
            .values()
            .any(|p| p.book_id == book_id && p.sequence == sequence)
        {
            return Err(StoreError::Invalid(format!(
                "段落顺序号重复: book_id={}, sequence={}",
                book_id, sequence
            )));
        }

        inner.next_paragraph_id += 1;
        let id = inner.next_paragraph_id;
        inner.paragraphs.insert(
            id,
            Paragraph {
                id,
                book_id,
                sequence,
                content: content.to_string(),
                word_count,
            },
        );
        Ok(id)
    }

    fn list_paragraphs(&self, book_id: i64) -> StoreResult<Vec<Paragraph>> {
        let mut paragraphs: Vec<Paragraph> = self
            .lock()?
            .paragraphs
            .values()
            .filter(|p| p.book_id == book_id)
            .cloned()
            .collect();
        paragraphs.sort_by_key(|p| p.sequence);
        Ok(paragraphs)
    }

    fn get_paragraph(&self, paragraph_id: i64) -> StoreResult<Option<Paragraph>> {
        Ok(self.lock()?.paragraphs.get(&paragraph_id).cloned())
    }

    fn delete_paragraphs(&self, book_id: i64) -> StoreResult<usize> {
        let mut inner = self.lock()?;
        let ids: Vec<i64> = inner
            .paragraphs
            .values()
            .filter(|p| p.book_id == book_id)
            .map(|p| p.id)
            .collect();
        for id in &ids {
            inner.paragraphs.remove(id);
            inner.questions.remove(id);
        }
        Ok(ids.len())
    }

    fn remove_paragraphs(&self, paragraph_ids: &[i64]) -> StoreResult<usize> {
        let mut inner = self.lock()?;
        let mut removed = 0;
        for id in paragraph_ids {
            if inner.paragraphs.remove(id).is_some() {
                inner.questions.remove(id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn update_content(&self, paragraph_id: i64, content: &str) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let paragraph = inner
            .paragraphs
            .get_mut(&paragraph_id)
            .ok_or_else(|| StoreError::Invalid(format!("段落不存在: {}", paragraph_id)))?;
        paragraph.content = content.to_string();
        paragraph.word_count = recount(content);
        Ok(())
    }

    fn record_images(&self, assets: &[ImageAsset]) -> StoreResult<()> {
        let mut inner = self.lock()?;
        for asset in assets {
            inner.images.insert((asset.book_id, asset.content_hash.clone()));
        }
        Ok(())
    }
}

impl QuestionStore for MemoryStore {
    fn has_questions(&self, paragraph_id: i64) -> StoreResult<bool> {
        Ok(self
            .lock()?
            .questions
            .get(&paragraph_id)
            .is_some_and(|q| !q.is_empty()))
    }

    fn list_questions(&self, paragraph_id: i64) -> StoreResult<Vec<Question>> {
        Ok(self
            .lock()?
            .questions
            .get(&paragraph_id)
            .cloned()
            .unwrap_or_default())
    }

    fn save_questions(&self, paragraph_id: i64, questions: &[Question]) -> StoreResult<bool> {
        check_question_count(questions)?;

        let mut inner = self.lock()?;
        if inner.questions.contains_key(&paragraph_id) {
            return Ok(false);
        }
        inner.questions.insert(paragraph_id, questions.to_vec());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::question::default_questions;
    use std::path::PathBuf;

    fn stores() -> Vec<(&'static str, Box<dyn TestStore>)> {
        let sqlite: Box<dyn TestStore> = Box::new(SqliteStore::open_in_memory().unwrap());
        let memory: Box<dyn TestStore> = Box::new(MemoryStore::new());
        vec![("sqlite", sqlite), ("memory", memory)]
    }

    trait TestStore: BookStore + ParagraphStore + QuestionStore {}
    impl<T: BookStore + ParagraphStore + QuestionStore> TestStore for T {}

    #[test]
    fn test_paragraph_crud() {
        for (name, store) in stores() {
            let book_id = store.create_book("书", "/tmp/a.txt", "txt").unwrap();
            store.create_paragraph(book_id, 2, "<p>second</p>", 6).unwrap();
            let first = store.create_paragraph(book_id, 1, "<p>first</p>", 5).unwrap();

            let list = store.list_paragraphs(book_id).unwrap();
            assert_eq!(list.iter().map(|p| p.sequence).collect::<Vec<_>>(), vec![1, 2], "{}", name);

            store.update_content(first, "<p>更新后的内容</p>").unwrap();
            let updated = store.get_paragraph(first).unwrap().unwrap();
            assert_eq!(updated.word_count, 6, "{}", name);

            assert_eq!(store.delete_paragraphs(book_id).unwrap(), 2, "{}", name);
            assert!(store.list_paragraphs(book_id).unwrap().is_empty(), "{}", name);
            assert!(store.get_paragraph(first).unwrap().is_none(), "{}", name);
        }
    }

    #[test]
    fn test_remove_paragraphs_by_id() {
        for (name, store) in stores() {
            let kept = store.create_paragraph(1, 1, "<p>kept</p>", 4).unwrap();
            let a = store.create_paragraph(1, 2, "<p>a</p>", 1).unwrap();
            let b = store.create_paragraph(1, 3, "<p>b</p>", 1).unwrap();

            assert_eq!(store.remove_paragraphs(&[a, b, 404]).unwrap(), 2, "{}", name);
            let list = store.list_paragraphs(1).unwrap();
            assert_eq!(list.iter().map(|p| p.id).collect::<Vec<_>>(), vec![kept], "{}", name);
            assert_eq!(store.remove_paragraphs(&[]).unwrap(), 0, "{}", name);
        }
    }

    #[test]
    fn test_duplicate_sequence_rejected() {
        for (name, store) in stores() {
            store.create_paragraph(1, 1, "<p>a</p>", 1).unwrap();
            assert!(store.create_paragraph(1, 1, "<p>b</p>", 1).is_err(), "{}", name);
        }
    }

    #[test]
    fn test_update_missing_paragraph() {
        for (name, store) in stores() {
            let result = store.update_content(404, "<p>x</p>");
            assert!(matches!(result, Err(StoreError::Invalid(_))), "{}", name);
        }
    }

    #[test]
    fn test_questions_saved_once() {
        for (name, store) in stores() {
            let id = store.create_paragraph(1, 1, "<p>a</p>", 1).unwrap();
            assert!(!store.has_questions(id).unwrap(), "{}", name);

            let questions = default_questions();
            assert!(store.save_questions(id, &questions).unwrap(), "{}", name);
            assert!(store.has_questions(id).unwrap(), "{}", name);

            // 第二次保存不修改已有题目
            let mut other = default_questions();
            other[0].question_text = "另一题".to_string();
            assert!(!store.save_questions(id, &other).unwrap(), "{}", name);
            assert_eq!(store.list_questions(id).unwrap(), questions, "{}", name);
        }
    }

    #[test]
    fn test_partial_question_set_rejected() {
        for (name, store) in stores() {
            let id = store.create_paragraph(1, 1, "<p>a</p>", 1).unwrap();
            let mut questions = default_questions();
            questions.pop();
            assert!(store.save_questions(id, &questions).is_err(), "{}", name);
            assert!(!store.has_questions(id).unwrap(), "{}", name);
        }
    }

    #[test]
    fn test_record_images_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let asset = ImageAsset {
            book_id: 3,
            content_hash: "abc".to_string(),
            url: "/uploads/images/3/abc.png".to_string(),
            file_path: PathBuf::from("uploads/images/3/abc.png"),
        };
        store.record_images(&[asset.clone(), asset.clone()]).unwrap();
        store.record_images(&[asset]).unwrap();

        let conn = store.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM image_assets", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_delete_book_cascades() {
        for (name, store) in stores() {
            let book_id = store.create_book("书", "/tmp/a.txt", "txt").unwrap();
            store.set_cover_url(book_id, Some("/uploads/covers/c.jpg")).unwrap();
            assert_eq!(
                store.get_book(book_id).unwrap().unwrap().cover_url.as_deref(),
                Some("/uploads/covers/c.jpg"),
                "{}",
                name
            );

            let id = store.create_paragraph(book_id, 1, "<p>a</p>", 1).unwrap();
            store.save_questions(id, &default_questions()).unwrap();

            store.delete_book(book_id).unwrap();
            assert!(store.get_book(book_id).unwrap().is_none(), "{}", name);
            assert!(!store.has_questions(id).unwrap(), "{}", name);
        }
    }
}
