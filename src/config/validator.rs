use anyhow::{bail, Result};
use std::net::SocketAddrV4;
use tracing::warn;

use super::{ClientConfig, ServerConfig};
use crate::rate_limiter::RateLimiterConfig;

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证端点可用作连接目标
    pub fn validate_endpoint(addr: &SocketAddrV4, context: &str) -> Result<()> {
        Self::validate_port(addr.port(), context)?;
        if addr.ip().is_unspecified() || addr.ip().is_broadcast() {
            bail!("{}: {} is not a usable address", context, addr.ip());
        }
        Ok(())
    }

    /// 验证超时/间隔不为 0
    pub fn validate_duration(secs: u64, context: &str) -> Result<()> {
        if secs == 0 {
            bail!("{} must be greater than 0", context);
        }
        Ok(())
    }

    /// 验证客户端配置
    pub fn validate_client_config(config: &ClientConfig) -> Result<()> {
        Self::validate_port(config.local_addr.port(), "Client local_addr")?;
        Self::validate_endpoint(&config.server_addr, "Client server_addr")?;
        Self::validate_duration(config.register_timeout_secs, "register_timeout_secs")?;
        Self::validate_duration(config.session_idle_timeout_secs, "session_idle_timeout_secs")?;
        Self::validate_duration(config.sweep_interval_secs, "sweep_interval_secs")?;

        if let Some(ref name) = config.server_name {
            if name.trim().is_empty() {
                bail!("Client server_name cannot be empty");
            }
        }

        if !config.security && (config.ca_cert_path.is_some() || config.skip_verify) {
            warn!("TLS settings are ignored because security is disabled");
        }
        if config.security && config.skip_verify {
            warn!("Certificate verification is disabled; the tunnel key exchange is not authenticated");
        }
        Ok(())
    }

    /// 验证服务器配置
    pub fn validate_server_config(config: &ServerConfig) -> Result<()> {
        Self::validate_port(config.listen_addr.port(), "Server listen_addr")?;
        if config.egress_addr.is_unspecified() {
            bail!("Server egress_addr must be a concrete IPv4 address");
        }
        Self::validate_duration(config.link_ttl_secs, "link_ttl_secs")?;
        Self::validate_duration(config.cleanup_interval_secs, "cleanup_interval_secs")?;

        // 验证证书配置
        match (&config.cert_path, &config.key_path) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => bail!("cert_path and key_path must both be set, or both omitted"),
        }
        if config.require_security && !config.has_tls() {
            bail!("require_security needs cert_path and key_path");
        }

        if config.cleanup_interval_secs > config.link_ttl_secs {
            warn!(
                "cleanup_interval_secs ({}) exceeds link_ttl_secs ({}), links will outlive their TTL",
                config.cleanup_interval_secs, config.link_ttl_secs
            );
        }

        // 验证速率限制配置
        if let Some(ref rate_limit) = config.rate_limit {
            Self::validate_rate_limit_config(rate_limit)?;
        }

        Ok(())
    }

    /// 验证速率限制配置
    pub fn validate_rate_limit_config(config: &RateLimiterConfig) -> Result<()> {
        if config.requests_per_second == 0 {
            bail!("rate_limit.requests_per_second must be greater than 0");
        }
        if config.burst_size == 0 {
            bail!("rate_limit.burst_size must be greater than 0");
        }
        if config.burst_size < config.requests_per_second {
            warn!(
                "rate_limit.burst_size ({}) is less than requests_per_second ({}), \
                 this may cause frequent rate limiting",
                config.burst_size, config.requests_per_second
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn server() -> ServerConfig {
        ServerConfig::builder()
            .listen_addr("0.0.0.0:443".parse().unwrap())
            .egress_addr("198.51.100.1".parse().unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn test_validate_port() {
        assert!(ConfigValidator::validate_port(0, "test").is_err());
        assert!(ConfigValidator::validate_port(443, "test").is_ok());
        assert!(ConfigValidator::validate_port(65535, "test").is_ok());
    }

    #[test]
    fn test_validate_endpoint() {
        assert!(ConfigValidator::validate_endpoint(&"0.0.0.0:443".parse().unwrap(), "t").is_err());
        assert!(ConfigValidator::validate_endpoint(&"255.255.255.255:443".parse().unwrap(), "t").is_err());
        assert!(ConfigValidator::validate_endpoint(&"203.0.113.10:443".parse().unwrap(), "t").is_ok());
    }

    #[test]
    fn test_server_tls_pairing() {
        let mut config = server();
        assert!(ConfigValidator::validate_server_config(&config).is_ok());

        config.cert_path = Some(PathBuf::from("/cert.pem"));
        assert!(ConfigValidator::validate_server_config(&config).is_err());

        config.key_path = Some(PathBuf::from("/key.pem"));
        config.require_security = true;
        assert!(ConfigValidator::validate_server_config(&config).is_ok());

        config.cert_path = None;
        config.key_path = None;
        assert!(ConfigValidator::validate_server_config(&config).is_err());
    }

    #[test]
    fn test_server_rejects_zero_durations() {
        let mut config = server();
        config.link_ttl_secs = 0;
        assert!(ConfigValidator::validate_server_config(&config).is_err());

        let mut config = server();
        config.egress_addr = "0.0.0.0".parse().unwrap();
        assert!(ConfigValidator::validate_server_config(&config).is_err());
    }

    #[test]
    fn test_validate_rate_limit_config() {
        let invalid = RateLimiterConfig {
            requests_per_second: 0,
            burst_size: 200,
        };
        assert!(ConfigValidator::validate_rate_limit_config(&invalid).is_err());

        let invalid = RateLimiterConfig {
            requests_per_second: 100,
            burst_size: 0,
        };
        assert!(ConfigValidator::validate_rate_limit_config(&invalid).is_err());

        assert!(ConfigValidator::validate_rate_limit_config(&RateLimiterConfig::default()).is_ok());
    }
}
