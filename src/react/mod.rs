//! 编排层：有界工具调用循环与过程事件

pub mod events;
pub mod loop_;

pub use events::ReactEvent;
pub use loop_::{run_query, LoopOptions, LoopStatus, ReactOutcome, ReactSession};
