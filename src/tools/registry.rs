//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找。
//! 本地工具通常实现 TypedTool：输入输出为具体类型，参数 schema 由 schemars 生成，
//! LLM 给出的 JSON 参数在注册表边界反序列化，格式不对的调用在执行前就被拒绝。
//! 注册表在进程启动时构建，之后只读（以 Arc 共享）。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::ToolErrorKind;
use crate::react::ResultType;
use crate::tools::ToolContext;

/// 送给 LLM 的工具目录条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 工具实现返回的错误；文本会交给 RecoveryEngine 分类
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("Unknown tool: {0} not found")]
    UnknownTool(String),

    #[error("nested tool depth {depth} exceeds the limit of {max}")]
    DepthExceeded { depth: u32, max: u32 },

    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    pub fn failed(msg: impl Into<String>) -> Self {
        ToolError::Failed(msg.into())
    }

    /// 已知分类；None 表示按错误文本分类
    pub fn kind(&self) -> Option<ToolErrorKind> {
        match self {
            ToolError::InvalidArguments { .. } | ToolError::DepthExceeded { .. } => {
                Some(ToolErrorKind::Unknown)
            }
            ToolError::UnknownTool(_) => Some(ToolErrorKind::NotFound),
            ToolError::Failed(_) => None,
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema（供 LLM 生成正确的参数格式）
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 成功结果校验时使用的评判标准
    fn result_type(&self) -> ResultType {
        ResultType::Validation
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError>;
}

/// 强类型工具：Input 由 LLM 参数反序列化而来，Output 序列化为结果 JSON
#[async_trait]
pub trait TypedTool: Send + Sync + 'static {
    type Input: DeserializeOwned + JsonSchema + Send;
    type Output: Serialize + Send;

    const NAME: &'static str;

    fn description(&self) -> &str;

    fn result_type(&self) -> ResultType {
        ResultType::for_tool(Self::NAME)
    }

    async fn run(&self, input: Self::Input, ctx: &ToolContext) -> Result<Self::Output, ToolError>;
}

/// 由 schemars 生成参数 schema，去掉 LLM 不需要的元信息
pub fn input_schema<T: JsonSchema>() -> Value {
    let mut schema = serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| {
        serde_json::json!({"type": "object", "properties": {}})
    });
    if let Value::Object(map) = &mut schema {
        map.remove("$schema");
        map.remove("title");
    }
    schema
}

/// TypedTool → Tool 的适配
struct Typed<T: TypedTool> {
    inner: T,
    schema: Value,
}

#[async_trait]
impl<T: TypedTool> Tool for Typed<T> {
    fn name(&self) -> &str {
        T::NAME
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    fn result_type(&self) -> ResultType {
        self.inner.result_type()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let args = if args.is_null() {
            Value::Object(Default::default())
        } else {
            args
        };
        let input: T::Input =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments {
                tool: T::NAME.to_string(),
                reason: e.to_string(),
            })?;
        let output = self.inner.run(input, ctx).await?;
        serde_json::to_value(output)
            .map_err(|e| ToolError::failed(format!("failed to serialize {} output: {}", T::NAME, e)))
    }
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn register_typed<T: TypedTool>(&mut self, tool: T) {
        self.register(Typed {
            inner: tool,
            schema: input_schema::<T::Input>(),
        });
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub async fn execute(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        tool.execute(args, ctx).await
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// 完整目录（按名称排序，保证每轮提示稳定）
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .values()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolContext;
    use serde_json::json;

    #[derive(Deserialize, JsonSchema)]
    struct EchoInput {
        /// 要回显的文本
        text: String,
        #[serde(default)]
        times: Option<u32>,
    }

    struct EchoTool;

    #[async_trait]
    impl TypedTool for EchoTool {
        type Input = EchoInput;
        type Output = Value;
        const NAME: &'static str = "echo";

        fn description(&self) -> &str {
            "Echo text back"
        }

        async fn run(&self, input: EchoInput, _ctx: &ToolContext) -> Result<Value, ToolError> {
            Ok(json!({"echo": input.text.repeat(input.times.unwrap_or(1) as usize)}))
        }
    }

    fn registry() -> ToolRegistry {
        let mut r = ToolRegistry::new();
        r.register_typed(EchoTool);
        r
    }

    #[tokio::test]
    async fn test_typed_execute() {
        let ctx = ToolContext::new("s1", "u1");
        let out = registry()
            .execute("echo", json!({"text": "ab", "times": 2}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["echo"], "abab");
    }

    #[tokio::test]
    async fn test_malformed_arguments_rejected() {
        let ctx = ToolContext::new("s1", "u1");
        let err = registry()
            .execute("echo", json!({"txt": "ab"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
        assert_eq!(err.kind(), Some(ToolErrorKind::Unknown));
        assert!(err.to_string().starts_with("invalid arguments"));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let ctx = ToolContext::new("s1", "u1");
        let err = registry().execute("nope", json!({}), &ctx).await.unwrap_err();
        assert_eq!(err.kind(), Some(ToolErrorKind::NotFound));
    }

    #[test]
    fn test_specs_carry_generated_schema() {
        let specs = registry().specs();
        assert_eq!(specs.len(), 1);
        let params = &specs[0].parameters;
        assert_eq!(params["type"], "object");
        assert!(params["properties"]["text"].is_object());
        assert_eq!(params["required"], json!(["text"]));
        assert!(params.get("$schema").is_none());
    }
}
