//! 笔记：单调递增 id、内容、可选标题与标签

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type NoteId = i64;

/// get_notes 未指定 limit 时的默认条数
pub const DEFAULT_NOTE_LIMIT: usize = 10;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: NoteId,
    pub title: Option<String>,
    pub content: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// 待保存的笔记
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NewNote {
    pub title: Option<String>,
    pub content: String,
    pub tags: Vec<String>,
}

impl NewNote {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        let title = title.into();
        let title = title.trim();
        self.title = (!title.is_empty()).then(|| title.to_string());
        self
    }

    /// 逗号分隔的标签，去空白、去空项
    pub fn with_tags(mut self, tags: &str) -> Self {
        self.tags = parse_tags(tags);
        self
    }
}

impl From<&str> for NewNote {
    fn from(content: &str) -> Self {
        NewNote::new(content)
    }
}

pub(crate) fn parse_tags(tags: &str) -> Vec<String> {
    tags.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_note_builder() {
        let note = NewNote::new("buy milk").with_title("  ").with_tags("home, urgent,,");
        assert_eq!(note.title, None);
        assert_eq!(note.tags, vec!["home", "urgent"]);
        assert_eq!(NewNote::from("x").content, "x");
    }

    #[test]
    fn test_note_serializes_created_at() {
        let note = Note {
            id: 1,
            title: None,
            content: "x".into(),
            tags: vec![],
            created_at: Utc::now(),
        };
        let back: Note = serde_json::from_str(&serde_json::to_string(&note).unwrap()).unwrap();
        assert_eq!(back, note);
    }
}
