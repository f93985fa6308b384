//! ContextManager：控制送入 LLM 的消息量
//!
//! 估算 token 数超过阈值（上下文窗口 × 比例）时压缩：保留开头的 system 消息、第一条 user 消息、
//! 一行占位摘要与最近 N 条消息。压缩只影响本轮 LLM 看到的列表，Session 中保存的完整历史不变。

use crate::memory::{Message, Role, TokenBudget, TokenEstimator};

pub const DEFAULT_KEEP_RECENT: usize = 10;

/// 一次准备的结果
#[derive(Debug, Clone)]
pub struct PreparedContext {
    pub messages: Vec<Message>,
    pub compacted: bool,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

#[derive(Debug, Clone)]
pub struct ContextManager {
    budget: TokenBudget,
    keep_recent: usize,
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new(TokenBudget::default(), DEFAULT_KEEP_RECENT)
    }
}

impl ContextManager {
    pub fn new(budget: TokenBudget, keep_recent: usize) -> Self {
        Self {
            budget,
            keep_recent: keep_recent.max(1),
        }
    }

    pub fn budget(&self) -> &TokenBudget {
        &self.budget
    }

    /// 未超过阈值时原样返回，否则压缩
    pub fn prepare(&self, messages: &[Message]) -> PreparedContext {
        let tokens_before = TokenEstimator::estimate_messages(messages);
        if tokens_before <= self.budget.threshold() {
            return PreparedContext {
                messages: messages.to_vec(),
                compacted: false,
                tokens_before,
                tokens_after: tokens_before,
            };
        }
        let compacted = self.compact(messages);
        let tokens_after = TokenEstimator::estimate_messages(&compacted);
        PreparedContext {
            compacted: compacted.as_slice() != messages,
            messages: compacted,
            tokens_before,
            tokens_after,
        }
    }

    /// 压缩：system + 第一条 user + 摘要占位 + 最近 keep_recent 条。
    ///
    /// 尾部窗口不会以 tool 消息开头：向前扩展到发出该调用的 assistant 消息，
    /// 保证调用与结果成对出现。压缩后不变小则返回原列表。
    pub fn compact(&self, messages: &[Message]) -> Vec<Message> {
        let head = usize::from(messages.first().map(|m| m.role) == Some(Role::System));

        let mut tail_start = messages.len().saturating_sub(self.keep_recent).max(head);
        while tail_start > head && messages[tail_start].role == Role::Tool {
            tail_start -= 1;
        }

        let first_user = messages[head..tail_start]
            .iter()
            .position(|m| m.role == Role::User)
            .map(|i| i + head);

        let omitted = (head..tail_start).filter(|i| Some(*i) != first_user).count();
        if omitted == 0 {
            return messages.to_vec();
        }

        let mut out = Vec::with_capacity(head + 2 + messages.len() - tail_start);
        out.extend_from_slice(&messages[..head]);
        if let Some(i) = first_user {
            out.push(messages[i].clone());
        }
        out.push(Message::system(format!(
            "[{} earlier messages were compacted to fit the context window; the full history is kept in the session record and can be searched with recallMemory.]",
            omitted
        )));
        out.extend_from_slice(&messages[tail_start..]);

        if TokenEstimator::estimate_messages(&out) >= TokenEstimator::estimate_messages(messages) {
            return messages.to_vec();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ToolCall;
    use serde_json::json;

    fn long_history(n: usize, chars: usize) -> Vec<Message> {
        let mut msgs = vec![Message::system("sys"), Message::user("original request")];
        for i in 0..n {
            let body = format!("{}{}", i, "x".repeat(chars));
            if i % 2 == 0 {
                msgs.push(Message::assistant(body));
            } else {
                msgs.push(Message::user(body));
            }
        }
        msgs
    }

    #[test]
    fn test_under_threshold_unchanged() {
        let cm = ContextManager::default();
        let msgs = long_history(4, 10);
        let prepared = cm.prepare(&msgs);
        assert!(!prepared.compacted);
        assert_eq!(prepared.messages, msgs);
    }

    #[test]
    fn test_compaction_shape() {
        let cm = ContextManager::new(TokenBudget::new(1_000, 0.8), 10);
        let msgs = long_history(40, 400);
        let prepared = cm.prepare(&msgs);
        assert!(prepared.compacted);
        let out = prepared.messages;
        assert_eq!(out.len(), 13);
        assert_eq!(out[0], msgs[0]);
        assert_eq!(out[1], msgs[1]);
        assert_eq!(out[2].role, Role::System);
        assert!(out[2].text().contains("30 earlier messages"));
        assert_eq!(&out[3..], &msgs[msgs.len() - 10..]);
        assert!(prepared.tokens_after < prepared.tokens_before);
    }

    #[test]
    fn test_tail_does_not_split_tool_pairs() {
        let cm = ContextManager::new(TokenBudget::new(100, 0.5), 2);
        let call = ToolCall::new("listAgents", json!({}));
        let mut msgs = long_history(10, 200);
        msgs.push(Message::assistant_tool_calls(None, vec![call.clone()]));
        msgs.push(Message::tool_result(call.id.clone(), "[]".repeat(50)));
        msgs.push(Message::tool_result("other", "y".repeat(50)));
        let out = cm.compact(&msgs);
        let tail_first = out.iter().position(|m| m.has_tool_calls()).unwrap();
        assert_eq!(out[tail_first + 1].tool_call_id.as_deref(), Some(call.id.as_str()));
        assert!(out.len() >= 3 + 2);
    }

    #[test]
    fn test_first_user_inside_tail_not_duplicated() {
        let cm = ContextManager::new(TokenBudget::new(10, 0.1), 10);
        let msgs = vec![Message::system("s"), Message::user("q"), Message::assistant("a")];
        assert_eq!(cm.compact(&msgs), msgs);
    }

    #[test]
    fn test_no_system_message() {
        let cm = ContextManager::new(TokenBudget::new(100, 0.5), 3);
        let mut msgs = vec![Message::user("first")];
        for i in 0..10 {
            msgs.push(Message::assistant(format!("{}{}", i, "z".repeat(100))));
        }
        let out = cm.compact(&msgs);
        assert_eq!(out[0], msgs[0]);
        assert_eq!(out[1].role, Role::System);
        assert_eq!(out.len(), 5);
    }
}
