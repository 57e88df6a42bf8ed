//! 终止判定
//!
//! 每轮结束时根据模型回复、工具输出携带的动作与已完成轮数给出 TerminationOutcome。
//! 最大轮数只是安全阀：语义条件优先，只有全部未触发时才检查上限。

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// 可配置的停止条件
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationCondition {
    /// 模型回复不含工具调用即视为完成
    NoToolCalls,
    Escalate,
    Transfer,
    /// 工具要求跳过后续模型总结，直接以工具结果作答
    SkipSummarization,
    InputRequired,
}

impl TerminationCondition {
    pub fn all() -> Vec<Self> {
        vec![
            TerminationCondition::NoToolCalls,
            TerminationCondition::Escalate,
            TerminationCondition::Transfer,
            TerminationCondition::SkipSummarization,
            TerminationCondition::InputRequired,
        ]
    }
}

/// 模型回复或工具输出附带的控制动作
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseActions {
    #[serde(default)]
    pub escalate: bool,
    #[serde(default)]
    pub transfer_to: Option<String>,
    /// 需要人工输入时的提示
    #[serde(default)]
    pub input_required: Option<String>,
    /// 显式结束（exit_loop）
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub skip_summarization: bool,
}

impl ResponseActions {
    pub fn escalate() -> Self {
        Self {
            escalate: true,
            ..Self::default()
        }
    }

    pub fn transfer(target: impl Into<String>) -> Self {
        Self {
            transfer_to: Some(target.into()),
            ..Self::default()
        }
    }

    pub fn input_required(prompt: impl Into<String>) -> Self {
        Self {
            input_required: Some(prompt.into()),
            ..Self::default()
        }
    }

    pub fn complete() -> Self {
        Self {
            complete: true,
            ..Self::default()
        }
    }

    /// 合并另一组动作（工具输出叠加到模型回复上）
    pub fn merge(&mut self, other: &ResponseActions) {
        self.escalate |= other.escalate;
        self.complete |= other.complete;
        self.skip_summarization |= other.skip_summarization;
        if other.transfer_to.is_some() {
            self.transfer_to = other.transfer_to.clone();
        }
        if other.input_required.is_some() {
            self.input_required = other.input_required.clone();
        }
    }
}

/// 单轮终止判定结果（不持久化）
#[derive(Clone, Debug, PartialEq)]
pub enum TerminationOutcome {
    Continue,
    StopNormal,
    StopEscalate,
    StopTransfer(String),
    StopInputRequired(String),
    StopSafetyLimit,
}

#[derive(Clone, Debug)]
pub struct TerminationEvaluator {
    conditions: HashSet<TerminationCondition>,
    max_iterations: u32,
}

impl TerminationEvaluator {
    pub fn new(conditions: impl IntoIterator<Item = TerminationCondition>, max_iterations: u32) -> Self {
        Self {
            conditions: conditions.into_iter().collect(),
            max_iterations,
        }
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn limit_reached(&self, completed_iterations: u32) -> bool {
        completed_iterations >= self.max_iterations
    }

    fn enabled(&self, c: TerminationCondition) -> bool {
        self.conditions.contains(&c)
    }

    /// completed_iterations 为包含本轮在内的已完成轮数
    pub fn evaluate(
        &self,
        has_tool_calls: bool,
        actions: &ResponseActions,
        completed_iterations: u32,
    ) -> TerminationOutcome {
        if self.enabled(TerminationCondition::InputRequired) {
            if let Some(prompt) = &actions.input_required {
                return TerminationOutcome::StopInputRequired(prompt.clone());
            }
        }
        if self.enabled(TerminationCondition::Escalate) && actions.escalate {
            return TerminationOutcome::StopEscalate;
        }
        if self.enabled(TerminationCondition::Transfer) {
            if let Some(target) = &actions.transfer_to {
                return TerminationOutcome::StopTransfer(target.clone());
            }
        }
        if actions.complete
            || (self.enabled(TerminationCondition::SkipSummarization) && actions.skip_summarization)
            || (self.enabled(TerminationCondition::NoToolCalls) && !has_tool_calls)
        {
            return TerminationOutcome::StopNormal;
        }
        if self.limit_reached(completed_iterations) {
            return TerminationOutcome::StopSafetyLimit;
        }
        TerminationOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator(max: u32) -> TerminationEvaluator {
        TerminationEvaluator::new(TerminationCondition::all(), max)
    }

    #[test]
    fn test_no_tool_calls_stops_normally() {
        let outcome = evaluator(5).evaluate(false, &ResponseActions::default(), 1);
        assert_eq!(outcome, TerminationOutcome::StopNormal);
    }

    #[test]
    fn test_semantic_stop_wins_over_limit() {
        let outcome = evaluator(1).evaluate(false, &ResponseActions::default(), 1);
        assert_eq!(outcome, TerminationOutcome::StopNormal);
    }

    #[test]
    fn test_limit_reached_with_tool_calls() {
        let e = evaluator(5);
        assert_eq!(e.evaluate(true, &ResponseActions::default(), 4), TerminationOutcome::Continue);
        assert_eq!(
            e.evaluate(true, &ResponseActions::default(), 5),
            TerminationOutcome::StopSafetyLimit
        );
    }

    #[test]
    fn test_input_required_has_priority() {
        let mut actions = ResponseActions::input_required("which file?");
        actions.escalate = true;
        assert_eq!(
            evaluator(5).evaluate(true, &actions, 1),
            TerminationOutcome::StopInputRequired("which file?".to_string())
        );
    }

    #[test]
    fn test_disabled_condition_is_ignored() {
        let e = TerminationEvaluator::new(vec![TerminationCondition::Escalate], 10);
        assert_eq!(e.evaluate(false, &ResponseActions::default(), 1), TerminationOutcome::Continue);
        assert_eq!(
            e.evaluate(true, &ResponseActions::transfer("billing"), 1),
            TerminationOutcome::Continue
        );
        assert_eq!(e.evaluate(true, &ResponseActions::escalate(), 1), TerminationOutcome::StopEscalate);
    }

    #[test]
    fn test_merge_keeps_tool_actions() {
        let mut actions = ResponseActions::default();
        actions.merge(&ResponseActions::transfer("billing"));
        actions.merge(&ResponseActions::complete());
        assert_eq!(actions.transfer_to.as_deref(), Some("billing"));
        assert!(actions.complete);
    }
}
