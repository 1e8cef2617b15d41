//! 工具注册表
//!
//! 所有工具实现 Tool trait（spec / execute / timeout），由 ToolRegistry 按注册顺序保存，
//! 按名查找；ToolExecutor 在调用时做参数校验、超时与结果归一化。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::AgentError;
use crate::tools::ToolSpec;

/// 工具 trait：声明（供 LLM 选择）、可选的专属超时、异步执行（args 已通过 schema 校验）
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    /// 工具专属超时；None 表示使用执行器默认值。网络类工具通常给更长的预算
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// 执行工具，成功返回给模型看的文本，失败返回错误描述
    async fn execute(&self, args: Value) -> Result<String, String>;
}

struct Entry {
    spec: ToolSpec,
    tool: Arc<dyn Tool>,
}

/// 工具注册表：保持注册顺序，describe_all 的输出在重启之间保持稳定
#[derive(Default)]
pub struct ToolRegistry {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；同名工具已存在时返回 DuplicateTool
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), AgentError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), AgentError> {
        let spec = tool.spec();
        if self.index.contains_key(&spec.name) {
            return Err(AgentError::DuplicateTool(spec.name));
        }
        self.index.insert(spec.name.clone(), self.entries.len());
        self.entries.push(Entry { spec, tool });
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Tool>, AgentError> {
        self.index
            .get(name)
            .map(|&i| self.entries[i].tool.clone())
            .ok_or_else(|| AgentError::UnknownTool(name.to_string()))
    }

    pub fn spec(&self, name: &str) -> Option<&ToolSpec> {
        self.index.get(name).map(|&i| &self.entries[i].spec)
    }

    /// 按注册顺序返回全部工具声明
    pub fn describe_all(&self) -> Vec<ToolSpec> {
        self.entries.iter().map(|e| e.spec.clone()).collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.spec.name.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
