//! Search 工具：DuckDuckGo Instant Answer 查询
//!
//! 单次外部请求，带超时与 User-Agent；结果（摘要、Results、RelatedTopics）按出现顺序截断到
//! num_results 条（1..=max_results）。结果为空或网络失败时返回错误，而不是空的成功结果。
//! 个别字段含 HTML 时用 html2text 提取纯文本。

use std::time::Duration;

use async_trait::async_trait;
use html2text::from_read;
use reqwest::{Client, Url};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::{Tool, ToolSpec};

pub const DUCKDUCKGO_API: &str = "https://api.duckduckgo.com/";

/// 单条搜索结果
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub text: String,
    pub url: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SearchArgs {
    /// The search query (e.g., 'latest AI news', 'rust async book')
    query: String,
    /// Number of results to return (1-10, default 3)
    num_results: Option<i64>,
}

/// Search 工具：base_url 可配置（测试时指向本地 mock 服务）
pub struct SearchTool {
    client: Client,
    base_url: String,
    max_results: usize,
    default_results: usize,
    timeout: Duration,
}

fn plain_text(s: &str) -> String {
    let text = if s.contains('<') {
        from_read(s.as_bytes(), 200).unwrap_or_else(|_| s.to_string())
    } else {
        s.to_string()
    };
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn push_topic(topic: &Value, hits: &mut Vec<SearchHit>) {
    // 分组主题：{"Name": "...", "Topics": [...]}
    if let Some(children) = topic.get("Topics").and_then(Value::as_array) {
        for child in children {
            push_topic(child, hits);
        }
        return;
    }
    let text = topic
        .get("Text")
        .and_then(Value::as_str)
        .filter(|t| !t.trim().is_empty())
        .or_else(|| topic.get("Result").and_then(Value::as_str))
        .map(plain_text)
        .unwrap_or_default();
    if text.is_empty() {
        return;
    }
    let url = topic
        .get("FirstURL")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    hits.push(SearchHit { text, url });
}

/// 从 Instant Answer JSON 中按顺序提取结果：摘要 → Results → RelatedTopics
pub fn extract_hits(body: &Value) -> Vec<SearchHit> {
    let mut hits = Vec::new();
    let abstract_text = body
        .get("AbstractText")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if !abstract_text.trim().is_empty() {
        let heading = body.get("Heading").and_then(Value::as_str).unwrap_or_default();
        let text = if heading.is_empty() {
            plain_text(abstract_text)
        } else {
            format!("{} - {}", heading, plain_text(abstract_text))
        };
        let url = body
            .get("AbstractURL")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        hits.push(SearchHit { text, url });
    }
    for key in ["Results", "RelatedTopics"] {
        if let Some(items) = body.get(key).and_then(Value::as_array) {
            for item in items {
                push_topic(item, &mut hits);
            }
        }
    }
    hits
}

impl SearchTool {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64, max_results: usize, default_results: usize) -> Self {
        let timeout = Duration::from_secs(timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("agentforge/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| Client::new());
        let max_results = max_results.max(1);
        Self {
            client,
            base_url: base_url.into(),
            max_results,
            default_results: default_results.clamp(1, max_results),
            timeout,
        }
    }

    async fn search(&self, query: &str, count: usize) -> Result<Vec<SearchHit>, String> {
        let url = Url::parse_with_params(
            &self.base_url,
            &[
                ("q", query),
                ("format", "json"),
                ("no_html", "1"),
                ("skip_disambig", "1"),
            ],
        )
        .map_err(|e| format!("Invalid search endpoint: {e}"))?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("Search request failed: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("Search service returned HTTP {}", resp.status()));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| format!("Search response unreadable: {e}"))?;
        let mut hits = extract_hits(&body);
        hits.truncate(count);
        Ok(hits)
    }
}

#[async_trait]
impl Tool for SearchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::from_args::<SearchArgs>(
            "web_search",
            "Search the web for current information, news, facts, or answers. \
             Use this when you need up-to-date information beyond your knowledge cutoff.",
        )
        .unwrap_or_else(|_| ToolSpec::new("web_search", "Search the web."))
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: SearchArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        let query = args.query.trim();
        if query.is_empty() {
            return Err("Search query is empty".to_string());
        }
        let count = args
            .num_results
            .map(|n| n.clamp(1, self.max_results as i64) as usize)
            .unwrap_or(self.default_results);
        tracing::info!(query = %query, count, "search tool query");
        let hits = self.search(query, count).await?;
        if hits.is_empty() {
            return Err(format!("No results found for '{query}'"));
        }
        let mut out = format!("Search results for '{query}':\n");
        for (i, hit) in hits.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, hit.text));
            if !hit.url.is_empty() {
                out.push_str(&format!("   {}\n", hit.url));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "Heading": "Rust",
            "AbstractText": "Rust is a systems programming language.",
            "AbstractURL": "https://en.wikipedia.org/wiki/Rust",
            "Results": [],
            "RelatedTopics": [
                {"Text": "Cargo - the Rust package manager", "FirstURL": "https://duckduckgo.com/Cargo"},
                {"Name": "Tools", "Topics": [
                    {"Text": "rustup - toolchain installer", "FirstURL": "https://duckduckgo.com/rustup"}
                ]},
                {"Text": "", "FirstURL": "https://duckduckgo.com/empty"}
            ]
        })
    }

    #[test]
    fn test_extract_hits_order_and_nesting() {
        let hits = extract_hits(&sample());
        assert_eq!(hits.len(), 3);
        assert!(hits[0].text.starts_with("Rust - "));
        assert_eq!(hits[2].url, "https://duckduckgo.com/rustup");
    }

    #[tokio::test]
    async fn test_search_truncates_to_requested_count() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(sample().to_string())
            .create_async()
            .await;
        let tool = SearchTool::new(server.url(), 5, 10, 3);
        let out = tool
            .execute(json!({"query": "rust", "num_results": 2}))
            .await
            .unwrap();
        assert!(out.contains("1. Rust - "));
        assert!(out.contains("2. Cargo"));
        assert!(!out.contains("3."));
    }

    #[tokio::test]
    async fn test_empty_result_set_is_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"AbstractText": "", "Results": [], "RelatedTopics": []}"#)
            .create_async()
            .await;
        let tool = SearchTool::new(server.url(), 5, 10, 3);
        let err = tool.execute(json!({"query": "zzzz"})).await.unwrap_err();
        assert!(err.contains("No results"));
    }

    #[tokio::test]
    async fn test_http_failure_is_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/")
            .match_query(mockito::Matcher::Any)
            .with_status(503)
            .create_async()
            .await;
        let tool = SearchTool::new(server.url(), 5, 10, 3);
        let err = tool.execute(json!({"query": "rust"})).await.unwrap_err();
        assert!(err.contains("503"));
    }
}
