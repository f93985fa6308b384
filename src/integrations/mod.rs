//! 远程集成：用户注册的 JSON-RPC 工具服务器

pub mod cache;
pub mod endpoints;
pub mod jsonrpc;
pub mod proxy;

pub use cache::{is_read_call, CachePolicy, ResponseCache};
pub use endpoints::{
    remote_tool_name, split_remote_tool_name, EndpointRegistry, InMemoryEndpoints,
    IntegrationEndpoint, OAuthCredentials, REMOTE_TOOL_PREFIX,
};
pub use proxy::{IntegrationProxy, ProxyConfig, ProxyError};
