//! JSON-RPC 2.0 消息与 MCP 工具描述

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.to_string(),
            params,
        }
    }

    pub fn tools_list(id: u64) -> Self {
        Self::new(id, "tools/list", Some(serde_json::json!({})))
    }

    pub fn tools_call(id: u64, name: &str, arguments: Value) -> Self {
        Self::new(
            id,
            "tools/call",
            Some(serde_json::json!({ "name": name, "arguments": arguments })),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// tools/list 返回的单个工具
#[derive(Debug, Clone, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
}

/// 常见 JSON-RPC / MCP 错误码
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// 资源不存在（MCP 扩展）
    pub const RESOURCE_NOT_FOUND: i64 = -32001;
    /// 无权限（MCP 扩展）
    pub const PERMISSION_DENIED: i64 = -32002;
}

/// MCP tools/call 的结果若带 `isError: true`，从 content 中取出错误文本
pub fn tool_error_text(result: &Value) -> Option<String> {
    if !result.get("isError").and_then(|v| v.as_bool()).unwrap_or(false) {
        return None;
    }
    let text = result
        .get("content")
        .and_then(|c| c.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "remote tool reported an error".to_string());
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tools_call_request_shape() {
        let req = JsonRpcRequest::tools_call(7, "list_issues", json!({"repo": "a/b"}));
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["id"], 7);
        assert_eq!(v["method"], "tools/call");
        assert_eq!(v["params"]["name"], "list_issues");
        assert_eq!(v["params"]["arguments"]["repo"], "a/b");
    }

    #[test]
    fn test_error_response_parses() {
        let resp: JsonRpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0", "id": 1,
            "error": {"code": -32601, "message": "Method not found"}
        }))
        .unwrap();
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_tool_definition_alias() {
        let list: ToolsListResult = serde_json::from_value(json!({
            "tools": [{"name": "search", "inputSchema": {"type": "object"}}]
        }))
        .unwrap();
        assert_eq!(list.tools[0].input_schema["type"], "object");
        assert_eq!(list.tools[0].description, "");
    }

    #[test]
    fn test_tool_error_text() {
        let r = json!({"isError": true, "content": [{"type": "text", "text": "Rate limit hit"}]});
        assert_eq!(tool_error_text(&r).as_deref(), Some("Rate limit hit"));
        assert!(tool_error_text(&json!({"content": []})).is_none());
    }
}
