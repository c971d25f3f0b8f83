use anyhow::{Context, Result};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;

use super::{validator::ConfigValidator, ClientConfig, ServerConfig};
use crate::rate_limiter::RateLimiterConfig;

/// ServerConfig Builder
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    listen_addr: Option<SocketAddrV4>,
    egress_addr: Option<Ipv4Addr>,
    reserve_addr: Option<Ipv4Addr>,
    link_ttl_secs: Option<u64>,
    cleanup_interval_secs: Option<u64>,
    require_security: bool,
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
    rate_limit: Option<RateLimiterConfig>,
}

impl ServerConfigBuilder {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置监听端点
    pub fn listen_addr(mut self, addr: SocketAddrV4) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    /// 设置重新注入使用的源地址
    pub fn egress_addr(mut self, addr: Ipv4Addr) -> Self {
        self.egress_addr = Some(addr);
        self
    }

    /// 设置端口预留绑定的地址
    pub fn reserve_addr(mut self, addr: Ipv4Addr) -> Self {
        self.reserve_addr = Some(addr);
        self
    }

    /// 设置链路空闲超时
    pub fn link_ttl_secs(mut self, secs: u64) -> Self {
        self.link_ttl_secs = Some(secs);
        self
    }

    /// 设置清理间隔
    pub fn cleanup_interval_secs(mut self, secs: u64) -> Self {
        self.cleanup_interval_secs = Some(secs);
        self
    }

    /// 设置是否要求安全交换
    pub fn require_security(mut self, require: bool) -> Self {
        self.require_security = require;
        self
    }

    /// 设置证书路径
    pub fn cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cert_path = Some(path.into());
        self
    }

    /// 设置私钥路径
    pub fn key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    /// 设置登记速率限制
    pub fn rate_limit(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    /// 构建 ServerConfig 并验证
    pub fn build(self) -> Result<ServerConfig> {
        let config = ServerConfig {
            listen_addr: self.listen_addr.context("listen_addr is required")?,
            egress_addr: self.egress_addr.context("egress_addr is required")?,
            reserve_addr: self.reserve_addr,
            link_ttl_secs: self.link_ttl_secs.unwrap_or_else(super::default_link_ttl_secs),
            cleanup_interval_secs: self
                .cleanup_interval_secs
                .unwrap_or_else(super::default_cleanup_interval_secs),
            require_security: self.require_security,
            cert_path: self.cert_path,
            key_path: self.key_path,
            rate_limit: self.rate_limit,
        };

        // 验证配置
        ConfigValidator::validate_server_config(&config)?;

        Ok(config)
    }
}

/// ClientConfig Builder
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    local_addr: Option<SocketAddrV4>,
    server_addr: Option<SocketAddrV4>,
    security: bool,
    ca_cert_path: Option<PathBuf>,
    skip_verify: bool,
    server_name: Option<String>,
    register_timeout_secs: Option<u64>,
    session_idle_timeout_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
}

impl ClientConfigBuilder {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置本地端点
    pub fn local_addr(mut self, addr: SocketAddrV4) -> Self {
        self.local_addr = Some(addr);
        self
    }

    /// 设置服务端端点
    pub fn server_addr(mut self, addr: SocketAddrV4) -> Self {
        self.server_addr = Some(addr);
        self
    }

    /// 设置是否启用安全交换
    pub fn security(mut self, security: bool) -> Self {
        self.security = security;
        self
    }

    /// 设置 CA 证书路径
    pub fn ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    /// 设置是否跳过证书验证
    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.skip_verify = skip;
        self
    }

    /// 设置 TLS 服务器名
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn register_timeout_secs(mut self, secs: u64) -> Self {
        self.register_timeout_secs = Some(secs);
        self
    }

    pub fn session_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.session_idle_timeout_secs = Some(secs);
        self
    }

    pub fn sweep_interval_secs(mut self, secs: u64) -> Self {
        self.sweep_interval_secs = Some(secs);
        self
    }

    /// 构建 ClientConfig 并验证
    pub fn build(self) -> Result<ClientConfig> {
        let config = ClientConfig {
            local_addr: self.local_addr.context("local_addr is required")?,
            server_addr: self.server_addr.context("server_addr is required")?,
            security: self.security,
            ca_cert_path: self.ca_cert_path,
            skip_verify: self.skip_verify,
            server_name: self.server_name,
            register_timeout_secs: self
                .register_timeout_secs
                .unwrap_or_else(super::default_register_timeout_secs),
            session_idle_timeout_secs: self
                .session_idle_timeout_secs
                .unwrap_or_else(super::default_session_idle_timeout_secs),
            sweep_interval_secs: self
                .sweep_interval_secs
                .unwrap_or_else(super::default_sweep_interval_secs),
        };

        ConfigValidator::validate_client_config(&config)?;

        Ok(config)
    }
}
