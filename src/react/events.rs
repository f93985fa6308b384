//! 编排过程事件：只追加，供外部观察与流式展示；循环本身从不读取

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Session 状态变化（running / resuming / completed / failed）
    StatusUpdate,
    ToolCall,
    ToolResult,
    Verification,
    /// 最终回复校验未通过，重新进入循环
    Retry,
    Error,
    /// 本轮送入 LLM 的上下文被压缩
    Compaction,
    /// 预算将尽，写检查点并挂起
    Checkpoint,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::StatusUpdate => "status_update",
            EventType::ToolCall => "tool_call",
            EventType::ToolResult => "tool_result",
            EventType::Verification => "verification",
            EventType::Retry => "retry",
            EventType::Error => "error",
            EventType::Compaction => "compaction",
            EventType::Checkpoint => "checkpoint",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "status_update" => EventType::StatusUpdate,
            "tool_call" => EventType::ToolCall,
            "tool_result" => EventType::ToolResult,
            "verification" => EventType::Verification,
            "retry" => EventType::Retry,
            "error" => EventType::Error,
            "compaction" => EventType::Compaction,
            "checkpoint" => EventType::Checkpoint,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationEvent {
    pub session_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

impl OrchestrationEvent {
    pub fn new(session_id: impl Into<String>, event_type: EventType, data: Value) -> Self {
        Self {
            session_id: session_id.into(),
            event_type,
            data,
            created_at: Utc::now(),
        }
    }
}
