//! 记忆层：会话轮次日志与笔记表（SQLite 持久化）

pub mod note;
pub mod store;
pub mod turn;

pub use note::{NewNote, Note, NoteId, DEFAULT_NOTE_LIMIT};
pub use store::{MemoryStore, SqliteStore, StorageError};
pub use turn::{ConversationTurn, Role, SessionStats, ToolCallRecord};
