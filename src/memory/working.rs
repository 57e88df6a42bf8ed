//! Working Memory：单个任务交给模型的有界对话历史
//!
//! 四种策略：none（不裁剪）/ fixed_window（保留最近 N 条）/ token_budget（按预算裁剪，最近若干条必留）/
//! summarizing（超过 budget×threshold 时调用摘要器压缩最旧的消息，失败则回退为固定窗口）。
//! 成本估算在每次 append 后立即更新，阈值判断永远基于当前消息集合。

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::llm::ModelError;
use crate::memory::token_budget::{truncate_to_tokens, TokenEstimator};
use crate::memory::{Message, Role};

/// 摘要消息前缀
pub const SUMMARY_PREFIX: &str = "Previous conversation summary: ";
/// 压缩后保留原文的最近消息所占 target 的比例
const RECENT_SHARE_OF_TARGET: f64 = 0.8;

/// 摘要器：专门用于压缩消息片段的模型调用
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// previous 为上一次摘要（若有），新摘要应在其基础上延续
    async fn summarize(
        &self,
        messages: &[Message],
        previous: Option<&str>,
    ) -> Result<String, ModelError>;
}

/// summarizing 策略参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SummarizingPolicy {
    pub budget: usize,
    /// 触发阈值（budget 的比例）
    pub threshold: f64,
    /// 压缩目标（budget 的比例，须小于 threshold）
    pub target: f64,
    pub preserve_recent: usize,
    /// 摘要失败时回退的窗口大小
    pub fallback_window: usize,
}

/// 记忆策略（任务配置时确定）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryStrategy {
    None,
    FixedWindow { window_size: usize },
    TokenBudget { budget: usize, preserve_recent: usize },
    Summarizing(SummarizingPolicy),
}

impl MemoryStrategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            MemoryStrategy::None => StrategyKind::None,
            MemoryStrategy::FixedWindow { .. } => StrategyKind::FixedWindow,
            MemoryStrategy::TokenBudget { .. } => StrategyKind::TokenBudget,
            MemoryStrategy::Summarizing(_) => StrategyKind::Summarizing,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    None,
    FixedWindow,
    TokenBudget,
    Summarizing,
}

/// Working Memory 快照（写入检查点）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkingMemoryState {
    pub messages: Vec<Message>,
    pub estimated_tokens: usize,
    pub strategy: StrategyKind,
    pub summary: Option<String>,
}

/// 有界对话历史
pub struct WorkingMemory {
    strategy: MemoryStrategy,
    messages: VecDeque<Message>,
    summary: Option<String>,
    estimated_tokens: usize,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl WorkingMemory {
    pub fn new(strategy: MemoryStrategy) -> Self {
        Self {
            strategy,
            messages: VecDeque::new(),
            summary: None,
            estimated_tokens: 0,
            summarizer: None,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn strategy(&self) -> &MemoryStrategy {
        &self.strategy
    }

    pub fn estimated_tokens(&self) -> usize {
        self.estimated_tokens
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// 交给模型的上下文：摘要（若有）作为首条 system 消息，其后为保留的原文
    pub fn context(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if let Some(s) = &self.summary {
            out.push(summary_message(s));
        }
        out.extend(self.messages.iter().cloned());
        out
    }

    /// 追加一条消息并按策略裁剪；摘要失败在内部吸收，不向外传播
    pub async fn append(&mut self, message: Message) {
        self.estimated_tokens += TokenEstimator::message_cost(&message);
        self.messages.push_back(message);

        match self.strategy.clone() {
            MemoryStrategy::None => {}
            MemoryStrategy::FixedWindow { window_size } => self.evict_to_window(window_size),
            MemoryStrategy::TokenBudget {
                budget,
                preserve_recent,
            } => {
                while self.estimated_tokens > budget && self.messages.len() > preserve_recent {
                    self.pop_oldest();
                }
            }
            MemoryStrategy::Summarizing(policy) => self.maybe_summarize(&policy).await,
        }

        debug_assert_eq!(self.estimated_tokens, self.recompute());
    }

    pub fn snapshot(&self) -> WorkingMemoryState {
        WorkingMemoryState {
            messages: self.messages.iter().cloned().collect(),
            estimated_tokens: self.estimated_tokens,
            strategy: self.strategy.kind(),
            summary: self.summary.clone(),
        }
    }

    /// 从快照恢复；估算值按恢复后的消息重新计算
    pub fn restore(&mut self, state: WorkingMemoryState) {
        if state.strategy != self.strategy.kind() {
            tracing::warn!(
                from = ?state.strategy,
                to = ?self.strategy.kind(),
                "restoring working memory under a different strategy"
            );
        }
        self.messages = state.messages.into();
        self.summary = state.summary;
        self.estimated_tokens = self.recompute();
    }

    fn recompute(&self) -> usize {
        let summary = self
            .summary
            .as_ref()
            .map(|s| TokenEstimator::message_cost(&summary_message(s)))
            .unwrap_or(0);
        summary + self.messages.iter().map(TokenEstimator::message_cost).sum::<usize>()
    }

    fn pop_oldest(&mut self) {
        if let Some(m) = self.messages.pop_front() {
            self.estimated_tokens -= TokenEstimator::message_cost(&m);
        }
    }

    fn evict_to_window(&mut self, window: usize) {
        while self.messages.len() > window {
            self.pop_oldest();
        }
    }

    async fn maybe_summarize(&mut self, policy: &SummarizingPolicy) {
        let trigger = policy.budget as f64 * policy.threshold;
        if self.estimated_tokens as f64 <= trigger {
            return;
        }
        let target_tokens = (policy.budget as f64 * policy.target) as usize;
        let split = self.summary_split(policy, target_tokens);
        if split == 0 {
            tracing::debug!(
                tokens = self.estimated_tokens,
                "nothing old enough to summarize"
            );
            return;
        }

        let older: Vec<Message> = self.messages.iter().take(split).cloned().collect();
        let summarizer = match &self.summarizer {
            Some(s) => Arc::clone(s),
            None => {
                tracing::warn!("summarizing strategy without summarizer, falling back to window");
                self.evict_to_window(policy.fallback_window);
                return;
            }
        };

        match summarizer.summarize(&older, self.summary.as_deref()).await {
            Ok(text) => {
                self.messages.drain(..split);
                self.summary = Some(text);
                self.estimated_tokens = self.recompute();
                if self.estimated_tokens > target_tokens {
                    self.shrink_summary(target_tokens);
                }
                tracing::debug!(
                    summarized = split,
                    kept = self.messages.len(),
                    tokens = self.estimated_tokens,
                    "working memory compacted"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "summarization failed, falling back to window eviction");
                self.evict_to_window(policy.fallback_window);
            }
        }
    }

    /// 从尾部挑选保留原文的消息，返回待摘要前缀的长度
    fn summary_split(&self, policy: &SummarizingPolicy, target_tokens: usize) -> usize {
        let recent_budget = (target_tokens as f64 * RECENT_SHARE_OF_TARGET) as usize;
        let mut keep = 0;
        let mut kept_tokens = 0;
        for m in self.messages.iter().rev() {
            let cost = TokenEstimator::message_cost(m);
            if keep < policy.preserve_recent || kept_tokens + cost <= recent_budget {
                keep += 1;
                kept_tokens += cost;
            } else {
                break;
            }
        }
        let len = self.messages.len();
        let split = len - keep.min(len);
        // 工具结果不能脱离发起调用的 assistant 消息：优先把 assistant 留在原文里，
        // 退到开头时改为把整段工具结果一起摘要
        let is_tool = |i: usize| i < len && self.messages[i].role == Role::Tool;
        let mut back = split;
        while back > 0 && is_tool(back) {
            back -= 1;
        }
        if back > 0 || !is_tool(split) {
            return back;
        }
        let mut forward = split;
        while is_tool(forward) {
            forward += 1;
        }
        forward
    }

    fn shrink_summary(&mut self, target_tokens: usize) {
        let Some(text) = self.summary.take() else {
            return;
        };
        let tail: usize = self.messages.iter().map(TokenEstimator::message_cost).sum();
        let room = target_tokens.saturating_sub(tail);
        let mut allowed = TokenEstimator::estimate(&text);
        let mut shrunk = text.clone();
        while allowed > 0 && TokenEstimator::message_cost(&summary_message(&shrunk)) > room {
            allowed -= 1;
            shrunk = truncate_to_tokens(&text, allowed);
        }
        self.summary = Some(shrunk);
        self.estimated_tokens = self.recompute();
        if self.estimated_tokens > target_tokens {
            tracing::warn!(
                tokens = self.estimated_tokens,
                target = target_tokens,
                "recent messages alone exceed the summarization target"
            );
        }
    }
}

fn summary_message(summary: &str) -> Message {
    Message::system(format!("{SUMMARY_PREFIX}{summary}"))
}
