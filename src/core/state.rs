//! 单次查询的阶段状态机
//!
//! AwaitingInput → ModelCall → ToolDispatch / FinalAnswer → Done / Failed。
//! ToolDispatch 之后回到 ModelCall；任何非终态都可以因取消或存储失败进入 Failed。

use serde::Serialize;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    AwaitingInput,
    ModelCall,
    ToolDispatch,
    FinalAnswer,
    Done,
    Failed,
}

impl AgentPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentPhase::Done | AgentPhase::Failed)
    }

    pub fn can_transition_to(self, next: AgentPhase) -> bool {
        use AgentPhase::*;
        match (self, next) {
            (AwaitingInput, ModelCall) => true,
            (ModelCall, ToolDispatch | FinalAnswer | ModelCall) => true,
            (ToolDispatch, ModelCall) => true,
            (FinalAnswer, Done) => true,
            (Done | Failed, AwaitingInput) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("illegal phase transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: AgentPhase,
    pub to: AgentPhase,
}

/// 持有当前阶段，只允许合法迁移
#[derive(Debug, Clone)]
pub struct PhaseMachine {
    phase: AgentPhase,
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self {
            phase: AgentPhase::AwaitingInput,
        }
    }
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> AgentPhase {
        self.phase
    }

    pub fn transition(&mut self, to: AgentPhase) -> Result<AgentPhase, IllegalTransition> {
        if !self.phase.can_transition_to(to) {
            return Err(IllegalTransition {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        Ok(to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_with_one_tool_round() {
        let mut m = PhaseMachine::new();
        for next in [
            AgentPhase::ModelCall,
            AgentPhase::ToolDispatch,
            AgentPhase::ModelCall,
            AgentPhase::FinalAnswer,
            AgentPhase::Done,
            AgentPhase::AwaitingInput,
        ] {
            m.transition(next).unwrap();
        }
        assert_eq!(m.phase(), AgentPhase::AwaitingInput);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut m = PhaseMachine::new();
        let err = m.transition(AgentPhase::ToolDispatch).unwrap_err();
        assert_eq!(err.from, AgentPhase::AwaitingInput);
        m.transition(AgentPhase::ModelCall).unwrap();
        m.transition(AgentPhase::Failed).unwrap();
        assert!(m.transition(AgentPhase::Failed).is_err());
        assert!(m.transition(AgentPhase::ModelCall).is_err());
    }
}
