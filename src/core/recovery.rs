//! 工具错误恢复：分类与建议
//!
//! 工具失败不会中止编排循环。RecoveryEngine 根据错误文本把失败归入固定分类，
//! 并附上一条给 LLM 看的建议，让模型自行换参数重试或放弃该路径。

use std::fmt;

use serde::{Deserialize, Serialize};

/// 工具级错误分类
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolErrorKind {
    NotFound,
    Unauthorized,
    RateLimit,
    Timeout,
    Unknown,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolErrorKind::NotFound => "NotFound",
            ToolErrorKind::Unauthorized => "Unauthorized",
            ToolErrorKind::RateLimit => "RateLimit",
            ToolErrorKind::Timeout => "Timeout",
            ToolErrorKind::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 语义化错误恢复：错误文本 → 分类 → 建议
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// 按子串匹配分类（大小写不敏感）
    pub fn classify(&self, message: &str) -> ToolErrorKind {
        let lower = message.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
        if has(&["not found", "404", "no such"]) {
            ToolErrorKind::NotFound
        } else if has(&["unauthorized", "401", "forbidden", "403"]) {
            ToolErrorKind::Unauthorized
        } else if has(&["rate limit", "ratelimit", "429", "too many requests"]) {
            ToolErrorKind::RateLimit
        } else if has(&["timeout", "timed out"]) {
            ToolErrorKind::Timeout
        } else {
            ToolErrorKind::Unknown
        }
    }

    /// 每个分类对应的重试指引（给 LLM，而不是给人看）
    pub fn suggestion(&self, kind: ToolErrorKind) -> &'static str {
        match kind {
            ToolErrorKind::NotFound => {
                "The requested resource was not found. Verify the identifiers, or list the available items first, then retry with a valid reference."
            }
            ToolErrorKind::Unauthorized => {
                "Access was denied. The integration may be disconnected or its credentials expired; do not retry with the same credentials, tell the user to reconnect it instead."
            }
            ToolErrorKind::RateLimit => {
                "The service is rate limiting requests. Wait before retrying, and reduce the number of calls by batching or narrowing the request."
            }
            ToolErrorKind::Timeout => {
                "The tool did not finish within the remaining time budget; consider breaking the task into smaller steps."
            }
            ToolErrorKind::Unknown => {
                "The tool failed unexpectedly. Review the arguments against the tool schema and try a different approach if the error repeats."
            }
        }
    }

    /// 未找到与未授权重试也不会成功
    pub fn is_retryable(&self, kind: ToolErrorKind) -> bool {
        !matches!(kind, ToolErrorKind::NotFound | ToolErrorKind::Unauthorized)
    }
}
