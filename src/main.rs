//! AgentForge - 命令行对话入口
//!
//! 初始化日志与配置，构建 Agent，然后逐行读取用户输入。
//! 以 / 开头的是本地命令（/stats、/clear、/notes、/quit），其余交给 Agent。
//! Ctrl+C 取消当前查询；没有进行中的查询时退出。

use std::path::PathBuf;
use std::sync::Arc;

use agentforge::agent::Agent;
use agentforge::config::{load_config, AppConfig};
use agentforge::observability;
use agentforge::react::{LoopStatus, ReactEvent};
use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const HELP: &str = "Commands: /stats  /clear  /notes [term]  /help  /quit";

/// AgentForge 命令行参数
#[derive(Parser, Debug)]
#[command(name = "agentforge")]
#[command(version, about = "Tool-calling assistant with persistent session memory")]
struct Args {
    /// 额外的配置文件（覆盖 config/default.toml 中的键）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 会话 id；未指定时取配置 app.session_id
    #[arg(short, long)]
    session: Option<String>,
}

fn print_event(ev: &ReactEvent) {
    match ev {
        ReactEvent::ToolCall { tool, args } => println!("  -> {tool} {args}"),
        ReactEvent::Observation { tool, ok, preview } => {
            let mark = if *ok { "ok" } else { "error" };
            println!("  <- {tool} [{mark}] {}", preview.replace('\n', " "));
        }
        ReactEvent::Recovery { action, detail } => println!("  .. {action}: {detail}"),
        _ => {}
    }
}

async fn handle_command(agent: &Agent, session_id: &str, line: &str) -> anyhow::Result<bool> {
    let mut parts = line.splitn(2, ' ');
    let cmd = parts.next().unwrap_or_default();
    let rest = parts.next().map(str::trim).filter(|s| !s.is_empty());
    match cmd {
        "/quit" | "/exit" => return Ok(false),
        "/help" => println!("{HELP}"),
        "/stats" => {
            let stats = agent.list_session_stats(session_id)?;
            println!(
                "session {}: {} turns ({} user, {} assistant, {} tool), {} tool calls",
                stats.session_id,
                stats.turn_count,
                stats.user_turns,
                stats.assistant_turns,
                stats.tool_turns,
                stats.tool_calls
            );
            if let (Some(first), Some(last)) = (stats.first_activity, stats.last_activity) {
                println!("first activity {first}, last activity {last}");
            }
            let (prompt, completion, total) = agent.token_usage();
            if total > 0 {
                println!("tokens: {prompt} prompt + {completion} completion = {total}");
            }
        }
        "/clear" => {
            let n = agent.clear_session(session_id)?;
            println!("cleared {n} turn(s)");
        }
        "/notes" => {
            let notes = agent.list_notes(rest, None)?;
            if notes.is_empty() {
                println!("no notes");
            }
            for note in notes {
                let title = note.title.as_deref().unwrap_or("-");
                println!("[{}] {title}: {}", note.id, note.content);
            }
        }
        other => println!("unknown command {other}. {HELP}"),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let args = Args::parse();

    let cfg = load_config(args.config.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    let session_id = args.session.unwrap_or_else(|| cfg.app.session_id.clone());
    let agent = Arc::new(Agent::from_config(&cfg).context("Failed to create agent")?);

    let shutdown = agent.supervisor().shutdown_token();
    {
        let agent = agent.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if !agent.cancel_current() {
                    agent.supervisor().cancel_all();
                    break;
                }
            }
        });
    }

    println!(
        "AgentForge ({}) session '{}', tools: {}",
        agent.backend_name(),
        session_id,
        agent.tool_names().join(", ")
    );
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('/') {
            match handle_command(&agent, &session_id, line).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    eprintln!("error: {e:#}");
                    continue;
                }
            }
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let printer = tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                print_event(&ev);
            }
        });
        let result = agent.submit(&session_id, line, Some(&tx)).await;
        drop(tx);
        let _ = printer.await;

        match result {
            Ok(outcome) => {
                println!("{}", outcome.answer);
                if outcome.status == LoopStatus::MaxIterationsExceeded {
                    println!("(stopped after {} model calls)", outcome.iterations);
                }
            }
            Err(e) => eprintln!("[{}] {e}", e.reason_code()),
        }
    }

    agent.supervisor().cancel_all();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_config_and_session() {
        let args = Args::try_parse_from(["agentforge", "-c", "local.toml", "--session", "work"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("local.toml")));
        assert_eq!(args.session.as_deref(), Some("work"));
    }

    #[test]
    fn test_unknown_flag_is_rejected() {
        assert!(Args::try_parse_from(["agentforge", "--bogus"]).is_err());
    }
}
