//! 核心编排层：错误与恢复、阶段状态机、会话监管

pub mod error;
pub mod recovery;
pub mod session_supervisor;
pub mod state;

pub use error::{AgentError, RecoveryAction};
pub use recovery::{RecoveryEngine, RetryConfig};
pub use session_supervisor::SessionSupervisor;
pub use state::{AgentPhase, IllegalTransition, PhaseMachine};
