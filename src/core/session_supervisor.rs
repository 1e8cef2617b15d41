//! 会话监管：同一会话的查询串行化、取消管理
//!
//! 每个 session_id 一把 tokio Mutex，保证同一会话的轮次按提交顺序写入；最后一个持有者释放时移除该锁，
//! 锁表只保留有查询在跑或在排队的会话。
//! 根 CancellationToken 在进程退出时取消，begin_query 为每次查询派生子 token 并登记到 active，
//! 查询结束（ActiveQuery drop）即注销，Ctrl+C 只取消仍在运行的查询。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

type LockTable = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

#[derive(Debug)]
pub struct SessionSupervisor {
    root: CancellationToken,
    active: Mutex<HashMap<String, CancellationToken>>,
    locks: LockTable,
}

/// 会话锁守卫；drop 时若无人排队则从锁表移除
#[derive(Debug)]
pub struct SessionGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    lock: Arc<AsyncMutex<()>>,
    session_id: String,
    locks: &'a LockTable,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        if let Ok(mut map) = self.locks.lock() {
            // 克隆只发生在持有 map 锁时，此处计数可靠：表里一份 + 自己一份
            let idle = map
                .get(&self.session_id)
                .map(|l| Arc::ptr_eq(l, &self.lock) && Arc::strong_count(&self.lock) == 2)
                .unwrap_or(false);
            if idle {
                map.remove(&self.session_id);
            }
        }
    }
}

/// 一次正在运行的查询；drop 时从 active 注销
#[derive(Debug)]
pub struct ActiveQuery<'a> {
    supervisor: &'a SessionSupervisor,
    session_id: String,
    token: CancellationToken,
}

impl ActiveQuery<'_> {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for ActiveQuery<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.supervisor.active.lock() {
            active.remove(&self.session_id);
        }
    }
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            active: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// 获取会话锁；持有期间同一会话的其他查询等待
    pub async fn lock_session(&self, session_id: &str) -> SessionGuard<'_> {
        let lock = match self.locks.lock() {
            Ok(mut map) => map.entry(session_id.to_string()).or_default().clone(),
            // 锁中毒时退化为不共享的新锁
            Err(_) => Arc::new(AsyncMutex::new(())),
        };
        let guard = lock.clone().lock_owned().await;
        SessionGuard {
            guard: Some(guard),
            lock,
            session_id: session_id.to_string(),
            locks: &self.locks,
        }
    }

    /// 为一次查询派生取消令牌并登记；调用方应持有该会话的锁
    pub fn begin_query(&self, session_id: &str) -> ActiveQuery<'_> {
        let token = self.root.child_token();
        if let Ok(mut active) = self.active.lock() {
            active.insert(session_id.to_string(), token.clone());
        }
        ActiveQuery {
            supervisor: self,
            session_id: session_id.to_string(),
            token,
        }
    }

    /// 取消所有正在运行的查询；没有运行中的查询时返回 false
    pub fn cancel_current(&self) -> bool {
        let tokens: Vec<CancellationToken> = match self.active.lock() {
            Ok(active) => active.values().cloned().collect(),
            Err(_) => return false,
        };
        tokens.iter().for_each(CancellationToken::cancel);
        !tokens.is_empty()
    }

    /// 只取消指定会话的查询
    pub fn cancel_session(&self, session_id: &str) -> bool {
        match self.active.lock().ok().and_then(|a| a.get(session_id).cloned()) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn running_queries(&self) -> usize {
        self.active.lock().map(|a| a.len()).unwrap_or(0)
    }

    /// 锁表中的会话数（有查询在跑或排队）
    pub fn tracked_sessions(&self) -> usize {
        self.locks.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// 取消全部（进程退出）
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    /// 进程级令牌，REPL 等外层循环据此退出
    pub fn shutdown_token(&self) -> CancellationToken {
        self.root.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
