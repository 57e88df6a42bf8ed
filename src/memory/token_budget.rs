//! Token 估算
//!
//! 字符计数近似：Working Memory 的每次 append 与阈值判断都以此为准。

use crate::memory::Message;

/// 每条消息的固定开销（角色、分隔符等）
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    /// 使用简单的启发式规则：英文约 4 字符/token，中文约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0;
        let mut non_ascii_chars = 0;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }

    /// 单条消息的成本：正文 + 工具调用参数 + 固定开销
    pub fn message_cost(message: &Message) -> usize {
        let calls: usize = message
            .tool_calls
            .iter()
            .map(|c| Self::estimate(&c.name) + Self::estimate(&c.args.to_string()))
            .sum();
        Self::estimate(&message.content) + calls + MESSAGE_OVERHEAD_TOKENS
    }
}

/// 将文本截断到指定 token 数以内（保留开头，结尾追加 "..."）
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    if TokenEstimator::estimate(text) <= max_tokens {
        return text.to_string();
    }
    if max_tokens == 0 {
        return String::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let ratio = max_tokens as f64 / TokenEstimator::estimate(text) as f64;
    let mut keep = ((chars.len() as f64) * ratio) as usize;
    loop {
        let candidate = format!("{}...", chars[..keep].iter().collect::<String>().trim_end());
        if TokenEstimator::estimate(&candidate) <= max_tokens || keep == 0 {
            return candidate;
        }
        keep = keep.saturating_sub((keep / 10).max(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ToolCall;

    #[test]
    fn test_token_estimator_english() {
        let text = "Hello, world! This is a test.";
        let tokens = TokenEstimator::estimate(text);
        assert!(tokens > 0);
        assert!(tokens < text.len());
    }

    #[test]
    fn test_token_estimator_chinese() {
        assert_eq!(TokenEstimator::estimate("你好世界"), 3);
    }

    #[test]
    fn test_message_cost_includes_overhead_and_args() {
        let plain = Message::user("a".repeat(400));
        assert_eq!(TokenEstimator::message_cost(&plain), 104);

        let call = ToolCall::new("echo", serde_json::json!({"text": "hello"}));
        let with_call = Message::assistant_with_tools("a".repeat(400), vec![call]);
        assert!(TokenEstimator::message_cost(&with_call) > 104);
    }

    #[test]
    fn test_truncate_to_tokens_fits() {
        let text = "word ".repeat(200);
        let truncated = truncate_to_tokens(&text, 20);
        assert!(TokenEstimator::estimate(&truncated) <= 20);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncate_to_tokens("short", 20), "short");
    }
}
