//! 笔记工具：save_note / get_notes / delete_note
//!
//! 全部委托给 MemoryStore；save 只在存储本身失败时报错，get 支持子串过滤与条数上限。
//! 存储是同步 SQLite，调用放在 spawn_blocking 里，执行器的超时在存储阻塞时仍然有效。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::memory::{MemoryStore, NewNote, Note, StorageError, DEFAULT_NOTE_LIMIT};
use crate::tools::{Tool, ToolSpec};

const MAX_NOTE_LIMIT: i64 = 50;

fn format_note(note: &Note) -> String {
    let mut s = match &note.title {
        Some(title) => format!("- [{}] {}: {}", note.id, title, note.content),
        None => format!("- [{}] {}", note.id, note.content),
    };
    if !note.tags.is_empty() {
        s.push_str(&format!(" (tags: {})", note.tags.join(", ")));
    }
    s.push_str(&format!(" @ {}", note.created_at.format("%Y-%m-%d %H:%M")));
    s
}

/// 在阻塞线程池里执行一次存储操作
async fn blocking<T, F>(store: &Arc<dyn MemoryStore>, op: F) -> Result<Result<T, StorageError>, String>
where
    F: FnOnce(&dyn MemoryStore) -> Result<T, StorageError> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .map_err(|e| format!("storage task failed: {e}"))
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SaveNoteArgs {
    /// The full content of the note
    content: String,
    /// Brief title for the note (e.g., 'Shopping List', 'Meeting Notes')
    title: Option<String>,
    /// Optional comma-separated tags (e.g., 'work,urgent')
    tags: Option<String>,
}

pub struct SaveNoteTool {
    store: Arc<dyn MemoryStore>,
}

impl SaveNoteTool {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for SaveNoteTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::from_args::<SaveNoteArgs>(
            "save_note",
            "Save a note, task, or reminder for later retrieval. \
             Good for to-do lists, important information, or things to remember.",
        )
        .unwrap_or_else(|_| ToolSpec::new("save_note", "Save a note."))
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: SaveNoteArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        let mut note = NewNote::new(args.content);
        if let Some(title) = args.title {
            note = note.with_title(title);
        }
        if let Some(tags) = args.tags.as_deref() {
            note = note.with_tags(tags);
        }
        let id = blocking(&self.store, move |store| store.save_note(note))
            .await?
            .map_err(|e| format!("Error saving note: {e}"))?;
        Ok(format!("Note saved (id {id})"))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct GetNotesArgs {
    /// Optional search term to filter notes by title, content, or tags
    search_term: Option<String>,
    /// Maximum number of notes to return (default: 10)
    limit: Option<i64>,
}

pub struct GetNotesTool {
    store: Arc<dyn MemoryStore>,
}

impl GetNotesTool {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for GetNotesTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::from_args::<GetNotesArgs>(
            "get_notes",
            "Retrieve saved notes, newest first. Can filter by keyword or list all notes.",
        )
        .unwrap_or_else(|_| ToolSpec::new("get_notes", "Retrieve saved notes."))
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        // 无参数工具调用时模型可能传 null
        let args: GetNotesArgs = if args.is_null() {
            GetNotesArgs {
                search_term: None,
                limit: None,
            }
        } else {
            serde_json::from_value(args).map_err(|e| e.to_string())?
        };
        let limit = args
            .limit
            .map(|n| n.clamp(1, MAX_NOTE_LIMIT) as usize)
            .unwrap_or(DEFAULT_NOTE_LIMIT);
        let term = args.search_term.clone();
        let notes = blocking(&self.store, move |store| store.list_notes(term.as_deref(), Some(limit)))
            .await?
            .map_err(|e| format!("Error retrieving notes: {e}"))?;
        if notes.is_empty() {
            return Ok(match args.search_term.as_deref() {
                Some(t) if !t.trim().is_empty() => format!("No notes found matching '{t}'."),
                _ => "No notes found.".to_string(),
            });
        }
        let mut out = format!("Found {} note(s):\n", notes.len());
        for note in &notes {
            out.push_str(&format_note(note));
            out.push('\n');
        }
        Ok(out)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct DeleteNoteArgs {
    /// Id of the note to delete
    id: i64,
}

pub struct DeleteNoteTool {
    store: Arc<dyn MemoryStore>,
}

impl DeleteNoteTool {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for DeleteNoteTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::from_args::<DeleteNoteArgs>("delete_note", "Delete a saved note by its id.")
            .unwrap_or_else(|_| ToolSpec::new("delete_note", "Delete a note."))
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: DeleteNoteArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        let id = args.id;
        match blocking(&self.store, move |store| store.delete_note(id)).await? {
            Ok(()) => Ok(format!("Note {} deleted", args.id)),
            Err(StorageError::NotFound(id)) => Err(format!("Note {id} not found")),
            Err(e) => Err(format!("Error deleting note: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SqliteStore;
    use serde_json::json;

    fn store() -> Arc<dyn MemoryStore> {
        Arc::new(SqliteStore::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_save_then_get() {
        let store = store();
        let save = SaveNoteTool::new(store.clone());
        let get = GetNotesTool::new(store.clone());

        let out = save
            .execute(json!({"title": "Groceries", "content": "eggs and flour", "tags": "home"}))
            .await
            .unwrap();
        assert!(out.starts_with("Note saved"));
        save.execute(json!({"content": "call the bank"})).await.unwrap();

        let all = get.execute(json!({})).await.unwrap();
        assert!(all.starts_with("Found 2 note(s)"));
        let lines: Vec<&str> = all.lines().skip(1).collect();
        assert!(lines[0].contains("call the bank"), "newest first");

        let filtered = get.execute(json!({"search_term": "flour", "limit": 5})).await.unwrap();
        assert!(filtered.contains("Groceries"));
        assert!(!filtered.contains("bank"));

        let none = get.execute(json!({"search_term": "zebra"})).await.unwrap();
        assert_eq!(none, "No notes found matching 'zebra'.");
        assert!(get.execute(Value::Null).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_missing_note_is_error() {
        let store = store();
        let delete = DeleteNoteTool::new(store.clone());
        let id = store.save_note("x".into()).unwrap();
        assert!(delete.execute(json!({"id": id})).await.is_ok());
        let err = delete.execute(json!({"id": id})).await.unwrap_err();
        assert!(err.contains("not found"));
    }

    #[test]
    fn test_specs() {
        let store = store();
        let spec = SaveNoteTool::new(store.clone()).spec();
        assert!(spec.get_param("content").unwrap().required);
        assert!(!spec.get_param("title").unwrap().required);
        let spec = GetNotesTool::new(store).spec();
        assert!(spec.parameters.iter().all(|p| !p.required));
    }

    /// 每次写笔记都阻塞一段时间的存储
    struct StallingStore {
        inner: SqliteStore,
        stall: std::time::Duration,
    }

    impl MemoryStore for StallingStore {
        fn append_turn(&self, turn: &crate::memory::ConversationTurn) -> Result<i64, StorageError> {
            self.inner.append_turn(turn)
        }

        fn recent_turns(
            &self,
            session_id: &str,
            limit: usize,
        ) -> Result<Vec<crate::memory::ConversationTurn>, StorageError> {
            self.inner.recent_turns(session_id, limit)
        }

        fn session_stats(&self, session_id: &str) -> Result<crate::memory::SessionStats, StorageError> {
            self.inner.session_stats(session_id)
        }

        fn clear_session(&self, session_id: &str) -> Result<usize, StorageError> {
            self.inner.clear_session(session_id)
        }

        fn list_sessions(&self) -> Result<Vec<String>, StorageError> {
            self.inner.list_sessions()
        }

        fn save_note(&self, note: NewNote) -> Result<crate::memory::NoteId, StorageError> {
            std::thread::sleep(self.stall);
            self.inner.save_note(note)
        }

        fn list_notes(&self, query: Option<&str>, limit: Option<usize>) -> Result<Vec<Note>, StorageError> {
            self.inner.list_notes(query, limit)
        }

        fn delete_note(&self, id: crate::memory::NoteId) -> Result<(), StorageError> {
            self.inner.delete_note(id)
        }
    }

    #[tokio::test]
    async fn test_stalled_store_hits_tool_timeout() {
        use crate::tools::{ToolErrorKind, ToolExecutor, ToolRegistry};

        let store: Arc<dyn MemoryStore> = Arc::new(StallingStore {
            inner: SqliteStore::open_in_memory().unwrap(),
            stall: std::time::Duration::from_millis(500),
        });
        let mut registry = ToolRegistry::new();
        registry.register(SaveNoteTool::new(store)).unwrap();
        let executor = ToolExecutor::with_timeout(registry, std::time::Duration::from_millis(50));

        let result = executor.execute("save_note", json!({"content": "slow"})).await;
        assert_eq!(result.error_kind, Some(ToolErrorKind::Timeout));
        assert!(result.elapsed_ms < 400, "timeout fired after {}ms", result.elapsed_ms);
    }
}
