//! 持久化记忆存储（SQLite）
//!
//! 两张表：conversation_turns（按会话追加的轮次日志）与 notes（笔记）。
//! 每次写操作在返回前已提交（自动提交 + synchronous=FULL），不存在「已确认但丢失」的写入；
//! 连接由 Mutex 串行化，可被多个会话并发调用。

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::memory::note::{parse_tags, NewNote, Note, NoteId, DEFAULT_NOTE_LIMIT};
use crate::memory::{ConversationTurn, Role, SessionStats, ToolCallRecord};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Note not found: {0}")]
    NotFound(NoteId),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Store lock poisoned")]
    Poisoned,
}

/// 记忆存储 trait：会话轮次日志 + 笔记表
///
/// recent_turns 返回最近 limit 条轮次，按时间正序（最旧在前），与 LLM 上下文顺序一致。
pub trait MemoryStore: Send + Sync {
    fn append_turn(&self, turn: &ConversationTurn) -> Result<i64, StorageError>;

    fn recent_turns(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationTurn>, StorageError>;

    fn session_stats(&self, session_id: &str) -> Result<SessionStats, StorageError>;

    /// 删除会话全部轮次，返回删除条数（唯一会删除轮次的路径，由外部显式调用）
    fn clear_session(&self, session_id: &str) -> Result<usize, StorageError>;

    fn list_sessions(&self) -> Result<Vec<String>, StorageError>;

    fn save_note(&self, note: NewNote) -> Result<NoteId, StorageError>;

    /// 按时间倒序列出笔记；query 为标题 / 内容 / 标签的子串过滤，limit 默认 10
    fn list_notes(&self, query: Option<&str>, limit: Option<usize>) -> Result<Vec<Note>, StorageError>;

    fn delete_note(&self, id: NoteId) -> Result<(), StorageError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS conversation_turns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    tool_calls_json TEXT,
    tool_call_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_turns_session ON conversation_turns(session_id, id);

CREATE TABLE IF NOT EXISTS notes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT,
    content TEXT NOT NULL,
    tags TEXT,
    created_at TEXT NOT NULL
);
";

/// SQLite 实现
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// 打开（或创建）数据库文件；父目录不存在时自动创建
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
        Self::init(conn)
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

type TurnRow = (String, String, String, DateTime<Utc>, Option<String>);

fn turn_from_row(row: TurnRow) -> Result<ConversationTurn, StorageError> {
    let (session_id, role, content, timestamp, tool_calls_json) = row;
    let role: Role = role.parse().map_err(StorageError::Corrupt)?;
    let tool_calls: Vec<ToolCallRecord> = match tool_calls_json {
        Some(json) => serde_json::from_str(&json)?,
        None => Vec::new(),
    };
    Ok(ConversationTurn {
        session_id,
        role,
        content,
        timestamp,
        tool_calls,
    })
}

type NoteRow = (NoteId, Option<String>, String, Option<String>, DateTime<Utc>);

fn note_from_row((id, title, content, tags, created_at): NoteRow) -> Note {
    Note {
        id,
        title,
        content,
        tags: tags.as_deref().map(parse_tags).unwrap_or_default(),
        created_at,
    }
}

impl MemoryStore for SqliteStore {
    fn append_turn(&self, turn: &ConversationTurn) -> Result<i64, StorageError> {
        let tool_calls_json = if turn.tool_calls.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&turn.tool_calls)?)
        };
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO conversation_turns
                (session_id, role, content, timestamp, tool_calls_json, tool_call_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                turn.session_id,
                turn.role.as_str(),
                turn.content,
                turn.timestamp,
                tool_calls_json,
                turn.tool_calls.len() as i64,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn recent_turns(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationTurn>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, role, content, timestamp, tool_calls_json
             FROM conversation_turns
             WHERE session_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![session_id, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?
            .collect::<Result<Vec<TurnRow>, _>>()?;
        let mut turns = rows
            .into_iter()
            .map(turn_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        turns.reverse();
        Ok(turns)
    }

    fn session_stats(&self, session_id: &str) -> Result<SessionStats, StorageError> {
        let conn = self.conn()?;
        let (turn_count, user_turns, assistant_turns, tool_turns, tool_calls): (i64, i64, i64, i64, i64) =
            conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(role = 'user'), 0),
                        COALESCE(SUM(role = 'assistant'), 0),
                        COALESCE(SUM(role = 'tool'), 0),
                        COALESCE(SUM(tool_call_count), 0)
                 FROM conversation_turns WHERE session_id = ?1",
                params![session_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )?;
        let edge = |order: &str| -> Result<Option<DateTime<Utc>>, StorageError> {
            let sql = format!(
                "SELECT timestamp FROM conversation_turns WHERE session_id = ?1 ORDER BY id {order} LIMIT 1"
            );
            Ok(conn
                .query_row(&sql, params![session_id], |row| row.get(0))
                .optional()?)
        };
        Ok(SessionStats {
            session_id: session_id.to_string(),
            turn_count: turn_count as u64,
            user_turns: user_turns as u64,
            assistant_turns: assistant_turns as u64,
            tool_turns: tool_turns as u64,
            tool_calls: tool_calls as u64,
            first_activity: edge("ASC")?,
            last_activity: edge("DESC")?,
        })
    }

    fn clear_session(&self, session_id: &str) -> Result<usize, StorageError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM conversation_turns WHERE session_id = ?1",
            params![session_id],
        )?;
        tracing::info!(session_id, deleted = n, "session cleared");
        Ok(n)
    }

    fn list_sessions(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT session_id FROM conversation_turns
             GROUP BY session_id ORDER BY MAX(id) DESC",
        )?;
        let sessions = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(sessions)
    }

    fn save_note(&self, note: NewNote) -> Result<NoteId, StorageError> {
        let tags = if note.tags.is_empty() {
            None
        } else {
            Some(note.tags.join(","))
        };
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO notes (title, content, tags, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![note.title, note.content, tags, Utc::now()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn list_notes(&self, query: Option<&str>, limit: Option<usize>) -> Result<Vec<Note>, StorageError> {
        let limit = limit.unwrap_or(DEFAULT_NOTE_LIMIT) as i64;
        let query = query.map(str::trim).filter(|q| !q.is_empty());
        let conn = self.conn()?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<NoteRow> {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
        };
        let rows = match query {
            Some(q) => {
                let pattern = format!("%{}%", escape_like(q));
                let mut stmt = conn.prepare(
                    "SELECT id, title, content, tags, created_at FROM notes
                     WHERE title LIKE ?1 ESCAPE '\\'
                        OR content LIKE ?1 ESCAPE '\\'
                        OR tags LIKE ?1 ESCAPE '\\'
                     ORDER BY id DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![pattern, limit], map_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, title, content, tags, created_at FROM notes
                     ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit], map_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(rows.into_iter().map(note_from_row).collect())
    }

    fn delete_note(&self, id: NoteId) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM notes WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(StorageError::NotFound(id));
        }
        Ok(())
    }
}
