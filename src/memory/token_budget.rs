//! Token 估算与上下文预算
//!
//! 不依赖具体 tokenizer：按「内容字符数 / 4」近似，足以判断是否接近上下文窗口。

use crate::memory::Message;

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算单段文本的 token 数
    pub fn estimate(text: &str) -> usize {
        text.chars().count() / 4
    }

    /// 估算整段消息列表：先累加所有消息内容长度，再除以 4
    pub fn estimate_messages(messages: &[Message]) -> usize {
        let chars: usize = messages.iter().map(|m| m.text().chars().count()).sum();
        chars / 4
    }
}

/// 上下文预算：模型窗口大小与触发压缩的比例
#[derive(Debug, Clone, Copy)]
pub struct TokenBudget {
    context_window: usize,
    compaction_ratio: f64,
}

impl TokenBudget {
    pub fn new(context_window: usize, compaction_ratio: f64) -> Self {
        Self {
            context_window,
            compaction_ratio: compaction_ratio.clamp(0.05, 1.0),
        }
    }

    /// 超过此值即需压缩
    pub fn threshold(&self) -> usize {
        (self.context_window as f64 * self.compaction_ratio) as usize
    }

    pub fn exceeds(&self, messages: &[Message]) -> bool {
        TokenEstimator::estimate_messages(messages) > self.threshold()
    }

    pub fn context_window(&self) -> usize {
        self.context_window
    }
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self::new(100_000, 0.8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_is_quarter_of_length() {
        assert_eq!(TokenEstimator::estimate("abcdefgh"), 2);
        assert_eq!(TokenEstimator::estimate(""), 0);
    }

    #[test]
    fn test_estimate_sums_before_dividing() {
        let messages = vec![Message::user("abc"), Message::assistant("d")];
        assert_eq!(TokenEstimator::estimate_messages(&messages), 1);
    }

    #[test]
    fn test_default_threshold_is_eighty_percent() {
        let budget = TokenBudget::default();
        assert_eq!(budget.threshold(), 80_000);
        let small = vec![Message::user("x".repeat(4 * 80_000))];
        assert!(!budget.exceeds(&small));
        let big = vec![Message::user("x".repeat(4 * 80_001))];
        assert!(budget.exceeds(&big));
    }
}
