// 配置管理模块 - 使用模块化设计

mod builder;
mod validator;

// 重新导出 builder 和 validator
pub use builder::{ClientConfigBuilder, ServerConfigBuilder};
pub use validator::ConfigValidator;

use crate::rate_limiter::RateLimiterConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_register_timeout_secs() -> u64 {
    5
}

fn default_session_idle_timeout_secs() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    5
}

fn default_link_ttl_secs() -> u64 {
    120
}

fn default_cleanup_interval_secs() -> u64 {
    10
}

/// 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// 伪装连接的本地端点
    pub local_addr: SocketAddrV4,
    /// 伪装连接的服务端端点
    pub server_addr: SocketAddrV4,
    /// 是否在隧道内做 TLS 密钥交换并加密
    #[serde(default)]
    pub security: bool,
    /// CA 证书路径（可选）
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    /// 是否跳过证书验证（仅用于测试）
    #[serde(default)]
    pub skip_verify: bool,
    /// TLS 服务器名，默认使用服务端 IP
    #[serde(default)]
    pub server_name: Option<String>,
    /// 会话登记等待答复的超时（秒）
    #[serde(default = "default_register_timeout_secs")]
    pub register_timeout_secs: u64,
    /// 会话空闲超时（秒）
    #[serde(default = "default_session_idle_timeout_secs")]
    pub session_idle_timeout_secs: u64,
    /// 空闲会话扫描间隔（秒）
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl ClientConfig {
    /// 创建 Builder
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// 验证配置
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_client_config(self)
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_secs(self.register_timeout_secs)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// TLS 服务器名
    pub fn tls_server_name(&self) -> String {
        self.server_name
            .clone()
            .unwrap_or_else(|| self.server_addr.ip().to_string())
    }
}

/// 服务器端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 伪装连接的监听端点
    pub listen_addr: SocketAddrV4,
    /// 重新注入真实网络时使用的源地址
    pub egress_addr: Ipv4Addr,
    /// 端口预留绑定的地址，默认与 egress_addr 相同
    #[serde(default)]
    pub reserve_addr: Option<Ipv4Addr>,
    /// 链路空闲超时（秒）
    #[serde(default = "default_link_ttl_secs")]
    pub link_ttl_secs: u64,
    /// 链路清理间隔（秒）
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// 是否要求客户端先完成安全交换
    #[serde(default)]
    pub require_security: bool,
    /// TLS 证书路径
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// TLS 私钥路径
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// 会话登记速率限制（可选）
    #[serde(default)]
    pub rate_limit: Option<RateLimiterConfig>,
}

impl ServerConfig {
    /// 创建 Builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// 验证配置
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_server_config(self)
    }

    pub fn link_ttl(&self) -> Duration {
        Duration::from_secs(self.link_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn reserve_addr(&self) -> Ipv4Addr {
        self.reserve_addr.unwrap_or(self.egress_addr)
    }

    /// 是否配置了 TLS 证书，可以接受安全交换
    pub fn has_tls(&self) -> bool {
        self.cert_path.is_some() && self.key_path.is_some()
    }
}

/// 展开路径中的 `~` 与环境变量
pub fn expand_path(path: &Path) -> anyhow::Result<PathBuf> {
    let raw = path
        .to_str()
        .with_context(|| format!("Path is not valid UTF-8: {:?}", path))?;
    let expanded = shellexpand::full(raw)
        .with_context(|| format!("Failed to expand path: {}", raw))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

fn expand_optional(path: &mut Option<PathBuf>) -> anyhow::Result<()> {
    if let Some(p) = path.as_mut() {
        *p = expand_path(p)?;
    }
    Ok(())
}

/// 应用配置
pub struct AppConfig;

impl AppConfig {
    /// 从文件加载服务器配置
    pub fn load_server_config(path: impl AsRef<Path>) -> anyhow::Result<ServerConfig> {
        #[derive(Deserialize)]
        struct ServerConfigWrapper {
            server: ServerConfig,
        }

        let path = expand_path(path.as_ref())?;
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read server configuration {:?}", path))?;
        let mut wrapper: ServerConfigWrapper =
            toml::from_str(&content).context("Failed to parse server configuration")?;
        expand_optional(&mut wrapper.server.cert_path)?;
        expand_optional(&mut wrapper.server.key_path)?;
        wrapper
            .server
            .validate()
            .context("Server configuration validation failed")?;
        Ok(wrapper.server)
    }

    /// 从文件加载客户端配置
    pub fn load_client_config(path: impl AsRef<Path>) -> anyhow::Result<ClientConfig> {
        #[derive(Deserialize)]
        struct ClientConfigWrapper {
            client: ClientConfig,
        }

        let path = expand_path(path.as_ref())?;
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read client configuration {:?}", path))?;
        let mut wrapper: ClientConfigWrapper =
            toml::from_str(&content).context("Failed to parse client configuration")?;
        expand_optional(&mut wrapper.client.ca_cert_path)?;
        wrapper
            .client
            .validate()
            .context("Client configuration validation failed")?;
        Ok(wrapper.client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "fake-tcp-tunnel-{}-{}.toml",
            name,
            std::process::id()
        ));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_client_defaults() {
        let toml_str = r#"
            local_addr = "10.0.0.5:40000"
            server_addr = "203.0.113.10:443"
        "#;
        let config: ClientConfig = toml::from_str(toml_str).unwrap();
        assert!(!config.security);
        assert_eq!(config.register_timeout(), Duration::from_secs(5));
        assert_eq!(config.session_idle_timeout(), Duration::from_secs(60));
        assert_eq!(config.tls_server_name(), "203.0.113.10");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_toml_with_rate_limit() {
        let toml_str = r#"
            listen_addr = "0.0.0.0:443"
            egress_addr = "198.51.100.1"
            require_security = true
            cert_path = "/path/to/cert.pem"
            key_path = "/path/to/key.pem"

            [rate_limit]
            requests_per_second = 50
            burst_size = 100
        "#;
        let config: ServerConfig = toml::from_str(toml_str).unwrap();
        assert!(config.require_security);
        assert!(config.has_tls());
        assert_eq!(config.link_ttl(), Duration::from_secs(120));
        assert_eq!(config.reserve_addr(), Ipv4Addr::new(198, 51, 100, 1));
        assert_eq!(config.rate_limit.as_ref().unwrap().requests_per_second, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_server_config_file() {
        let path = write_temp(
            "server",
            r#"
            [server]
            listen_addr = "0.0.0.0:443"
            egress_addr = "198.51.100.1"
            link_ttl_secs = 30
            "#,
        );
        let config = AppConfig::load_server_config(&path).unwrap();
        assert_eq!(config.link_ttl(), Duration::from_secs(30));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_load_client_config_rejects_invalid() {
        let path = write_temp(
            "client",
            r#"
            [client]
            local_addr = "10.0.0.5:40000"
            server_addr = "203.0.113.10:0"
            "#,
        );
        assert!(AppConfig::load_client_config(&path).is_err());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_expand_path() {
        std::env::set_var("FAKE_TCP_TUNNEL_TEST_DIR", "/opt/tunnel");
        let expanded = expand_path(Path::new("$FAKE_TCP_TUNNEL_TEST_DIR/cert.pem")).unwrap();
        assert_eq!(expanded, PathBuf::from("/opt/tunnel/cert.pem"));
        assert_eq!(
            expand_path(Path::new("/plain/path")).unwrap(),
            PathBuf::from("/plain/path")
        );
    }
}
