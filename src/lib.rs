/// Fake TCP Tunnel 库入口
///
/// 隧道核心：会话复用、分段校验和、伪装 TCP 帧与控制协议。
/// 抓包/注入由调用方通过 `Capture` 接入
pub mod capture;
pub mod checksum;
pub mod client;
pub mod config;
pub mod control;
pub mod disguise;
pub mod error;
pub mod link;
pub mod packet;
pub mod port;
pub mod rate_limiter;
pub mod segment;
pub mod server;
pub mod session;
pub mod stats;
mod task;
pub mod tls;

// 重新导出常用类型
pub use capture::{Capture, MemoryCapture, StealthCapture};
pub use client::Client;
pub use config::{ClientConfig, ServerConfig};
pub use control::{ControlMessage, ControlState};
pub use disguise::FakeTcp;
pub use error::{Result, TunnelError};
pub use packet::Protocol;
pub use port::{OsPortReserver, PortReserver};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use server::Server;
pub use session::{SessionHandle, SessionIdentity};
pub use stats::{TunnelStats, TunnelStatsSnapshot};
