//! 推理层：终止判定、过程事件、推理循环控制器

pub mod events;
pub mod loop_;
pub mod termination;

pub use events::LoopEvent;
pub use loop_::{LoopOutcome, ReasoningLoop};
pub use termination::{
    ResponseActions, TerminationCondition, TerminationEvaluator, TerminationOutcome,
};
