//! 外部工具提供方（MCP）：连接、握手、工具目录与远程调用

pub mod connection;
pub mod manager;

pub use connection::{
    ProviderConnector, ProviderEndpoint, ProviderSession, ProviderTransport, RemoteCallResult,
    RemoteToolInfo, RmcpConnector, RmcpSession,
};
pub use manager::{ConnectSummary, ConnectionManager};
