//! Agent 端到端场景：ScriptedBackend 驱动循环，HTTP 工具指向 mockito，存储落在临时目录

use std::sync::Arc;
use std::time::Duration;

use agentforge::agent::{default_registry, Agent};
use agentforge::config::AppConfig;
use agentforge::core::{AgentError, RecoveryEngine, RetryConfig};
use agentforge::llm::{BackendReply, LlmError, ScriptedBackend};
use agentforge::memory::{MemoryStore, Role, SqliteStore};
use agentforge::react::LoopOptions;
use agentforge::tools::{ToolCallRequest, ToolExecutor, ToolStatus};
use serde_json::json;

fn call(name: &str, args: serde_json::Value) -> ToolCallRequest {
    ToolCallRequest::new("", name, args)
}

fn fast_recovery() -> RecoveryEngine {
    RecoveryEngine::new(RetryConfig {
        max_retries: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    })
}

fn build_agent(
    backend: Arc<ScriptedBackend>,
    store: Arc<dyn MemoryStore>,
    cfg: &AppConfig,
) -> Agent {
    let registry = default_registry(cfg, store.clone()).unwrap();
    Agent::builder(backend, store)
        .executor(ToolExecutor::new(registry, 5))
        .recovery(fast_recovery())
        .options(LoopOptions::default())
        .build()
}

#[tokio::test]
async fn test_search_then_save_note_is_durable() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("GET", "/")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "Heading": "Rust 1.80",
                "AbstractText": "Rust 1.80 stabilised LazyCell and LazyLock.",
                "AbstractURL": "https://blog.rust-lang.org/",
                "RelatedTopics": []
            })
            .to_string(),
        )
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("agent.db");
    let mut cfg = AppConfig::default();
    cfg.tools.search.base_url = server.url();

    let backend = Arc::new(ScriptedBackend::new(vec![
        ScriptedBackend::tool_calls(vec![call("web_search", json!({"query": "rust 1.80 release"}))]),
        ScriptedBackend::tool_calls(vec![call(
            "save_note",
            json!({"title": "Rust 1.80", "content": "LazyCell and LazyLock are stable"}),
        )]),
        ScriptedBackend::final_answer("Saved a note about Rust 1.80."),
    ]));
    {
        let store: Arc<dyn MemoryStore> = Arc::new(SqliteStore::open(&db).unwrap());
        let agent = build_agent(backend.clone(), store, &cfg);
        let answer = agent
            .submit_user_message("s1", "Look up the Rust 1.80 release and save a note")
            .await
            .unwrap();
        assert_eq!(answer, "Saved a note about Rust 1.80.");
    }

    // 重新打开数据库，全部轮次都已落盘
    let store = SqliteStore::open(&db).unwrap();
    let turns = store.recent_turns("s1", 10).unwrap();
    let roles: Vec<Role> = turns.iter().map(|t| t.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Tool, Role::Tool, Role::Assistant]);
    assert_eq!(turns[1].tool_calls[0].request.tool_name, "web_search");
    assert_eq!(turns[1].tool_calls[0].result.status, ToolStatus::Ok);
    assert!(turns[1].tool_calls[0]
        .result
        .payload
        .as_deref()
        .unwrap()
        .contains("LazyLock"));
    assert_eq!(turns[2].tool_calls[0].request.tool_name, "save_note");

    let notes = store.list_notes(Some("LazyLock"), None).unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].title.as_deref(), Some("Rust 1.80"));

    // 第三次模型调用的上下文里能看到前两批工具结果
    let third = &backend.requests()[2];
    assert_eq!(third.turns.iter().filter(|t| t.role == Role::Tool).count(), 2);
}

#[tokio::test]
async fn test_stuck_loop_on_unregistered_tool_terminates() {
    let store: Arc<dyn MemoryStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let backend = Arc::new(ScriptedBackend::repeating(ScriptedBackend::tool_calls(vec![call(
        "teleport",
        json!({"to": "mars"}),
    )])));
    let agent = build_agent(backend.clone(), store.clone(), &AppConfig::default());

    let err = agent.submit_user_message("s1", "take me to mars").await.unwrap_err();
    match &err {
        AgentError::MaxIterationsExceeded { max, partial } => {
            assert_eq!(*max, 5);
            assert!(!partial.is_empty());
        }
        other => panic!("expected MaxIterationsExceeded, got {other:?}"),
    }
    assert_eq!(err.reason_code(), "max_iterations_exceeded");
    assert_eq!(backend.call_count(), 5);

    // 部分回答作为 assistant 轮次记录
    let stats = agent.list_session_stats("s1").unwrap();
    assert_eq!(stats.user_turns, 1);
    assert_eq!(stats.assistant_turns, 1);
    let last = store.recent_turns("s1", 1).unwrap();
    assert!(last[0].content.contains("Unknown tool"));
}

#[tokio::test]
async fn test_unknown_city_still_yields_answer() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("GET", "/Qwzxvland")
        .match_query(mockito::Matcher::Any)
        .with_status(404)
        .with_body("Unknown location")
        .create_async()
        .await;
    let mut cfg = AppConfig::default();
    cfg.tools.weather.base_url = server.url();

    let store: Arc<dyn MemoryStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let backend = Arc::new(ScriptedBackend::new(vec![
        ScriptedBackend::tool_calls(vec![call("get_weather", json!({"city": "Qwzxvland"}))]),
        ScriptedBackend::final_answer("I couldn't find a place called Qwzxvland."),
    ]));
    let agent = build_agent(backend.clone(), store.clone(), &cfg);

    let answer = agent
        .submit_user_message("s1", "weather in Qwzxvland?")
        .await
        .unwrap();
    assert!(answer.contains("Qwzxvland"));

    let turns = store.recent_turns("s1", 10).unwrap();
    let result = &turns[1].tool_calls[0].result;
    assert_eq!(result.status, ToolStatus::Error);
    assert!(result
        .error_message
        .as_deref()
        .unwrap()
        .contains("Unrecognized location"));
    // 模型看到的是错误文本
    let second = &backend.requests()[1];
    let tool_turn = second.turns.iter().find(|t| t.role == Role::Tool).unwrap();
    assert!(tool_turn.tool_calls[0]
        .result
        .to_model_content()
        .starts_with("Error:"));
}

#[tokio::test]
async fn test_missing_required_argument_is_captured_for_every_tool() {
    let store: Arc<dyn MemoryStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let registry = default_registry(&AppConfig::default(), store).unwrap();
    let executor = ToolExecutor::new(registry, 5);
    for spec in executor.describe_all() {
        if !spec.parameters.iter().any(|p| p.required) {
            continue;
        }
        let result = executor.execute(&spec.name, json!({})).await;
        assert_eq!(result.status, ToolStatus::Error, "tool {}", spec.name);
        assert!(
            result.error_message.as_deref().unwrap().contains("missing required parameter"),
            "tool {}: {:?}",
            spec.name,
            result.error_message
        );
    }
}

#[tokio::test]
async fn test_calculator_scenario() {
    let store: Arc<dyn MemoryStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let executor = ToolExecutor::new(default_registry(&AppConfig::default(), store).unwrap(), 5);
    let result = executor
        .execute("calculator", json!({"expression": "sqrt(144) + 10^2"}))
        .await;
    assert_eq!(result.payload.as_deref(), Some("112"));
}

#[tokio::test]
async fn test_backend_unavailable_surfaces_reason_code() {
    let store: Arc<dyn MemoryStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let backend = Arc::new(ScriptedBackend::repeating(Err(LlmError::Network(
        "connection refused".into(),
    ))));
    let agent = build_agent(backend.clone(), store, &AppConfig::default());
    let err = agent.submit_user_message("s1", "hello").await.unwrap_err();
    assert_eq!(err.reason_code(), "backend_unavailable");
    assert_eq!(backend.call_count(), 3);
}

#[tokio::test]
async fn test_sessions_are_isolated_and_clearable() {
    let store: Arc<dyn MemoryStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let backend = Arc::new(ScriptedBackend::repeating(Ok(BackendReply::FinalAnswer(
        "hi".into(),
    ))));
    let agent = build_agent(backend.clone(), store, &AppConfig::default());
    agent.submit_user_message("a", "hello").await.unwrap();
    agent.submit_user_message("b", "hello").await.unwrap();
    agent.submit_user_message("a", "again").await.unwrap();

    // 第三次调用只看到会话 a 的历史
    let third = &backend.requests()[2];
    assert!(third.turns.iter().all(|t| t.session_id == "a"));
    assert_eq!(third.turns.len(), 3);

    assert_eq!(agent.clear_session("a").unwrap(), 4);
    assert_eq!(agent.list_session_stats("a").unwrap().turn_count, 0);
    assert_eq!(agent.list_session_stats("b").unwrap().turn_count, 2);
}
