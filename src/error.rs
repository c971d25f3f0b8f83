/// 自定义错误类型
///
/// 按隧道核心的错误分类定义：协议违规、临时错误、容量耗尽、查找失败，
/// 调用者可以据此决定丢弃、重试还是断开连接
use std::io;
use std::time::Duration;
use thiserror::Error;

/// 隧道核心的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 控制报文格式错误，对该连接是致命的，不应重试
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// 数据帧校验/解密失败或会话尚未注册，丢弃后继续
    #[error("Temporary failure: {0}")]
    Temporary(String),

    /// 会话句柄空间耗尽
    #[error("Session handle space exhausted")]
    CapacityExceeded,

    /// 映射表中查不到对应条目
    #[error("Not found: {0}")]
    NotFound(String),

    /// 输入长度不足
    #[error("Truncated input: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    /// 不支持的地址族或报文类型
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: Duration },

    /// TLS 握手或密钥交换失败
    #[error("TLS error: {0}")]
    Tls(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建协议违规错误
    pub fn violation(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    /// 创建临时错误
    pub fn temporary(msg: impl Into<String>) -> Self {
        Self::Temporary(msg.into())
    }

    /// 创建查找失败错误
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// 创建长度不足错误
    pub fn truncated(needed: usize, actual: usize) -> Self {
        Self::Truncated { needed, actual }
    }

    /// 创建不支持错误
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 创建 TLS 错误
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// 是否为协议违规
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::ProtocolViolation(_))
    }

    /// 是否为可丢弃后继续的临时错误
    ///
    /// 数据帧长度不足也按临时错误处理
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_) | Self::Truncated { .. })
    }

    /// 是否为容量耗尽
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, Self::CapacityExceeded)
    }

    /// 是否为查找失败
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// 是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 是否应当终止整条隧道，其余错误只影响单个报文或会话
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation(_) | Self::Io(_) | Self::Tls(_) | Self::Config(_) | Self::Other(_)
        )
    }
}
