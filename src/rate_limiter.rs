/// 会话登记速率限制
///
/// 按隧道对端分别计数的 token bucket，一个对端刷满句柄空间和端口时不会挤占其他对端
use crate::error::{Result, TunnelError};
use governor::{
    clock::{Clock, DefaultClock},
    DefaultKeyedRateLimiter, Quota,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddrV4;
use std::num::NonZeroU32;
use std::time::Duration;

/// 速率限制器配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// 每个对端每秒允许的登记数
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    /// 突发容量
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

fn default_requests_per_second() -> u32 {
    100
}

fn default_burst_size() -> u32 {
    200
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst_size: default_burst_size(),
        }
    }
}

/// 按对端计数的登记限流器
pub struct RateLimiter {
    inner: DefaultKeyedRateLimiter<SocketAddrV4>,
    clock: DefaultClock,
    config: RateLimiterConfig,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("peers", &self.inner.len())
            .finish()
    }
}

impl RateLimiter {
    /// 速率或突发为 0 时返回配置错误
    pub fn new(config: RateLimiterConfig) -> Result<Self> {
        let rate = NonZeroU32::new(config.requests_per_second)
            .ok_or_else(|| TunnelError::config_error("requests_per_second must be > 0"))?;
        let burst = NonZeroU32::new(config.burst_size)
            .ok_or_else(|| TunnelError::config_error("burst_size must be > 0"))?;

        Ok(Self {
            inner: DefaultKeyedRateLimiter::keyed(Quota::per_second(rate).allow_burst(burst)),
            clock: DefaultClock::default(),
            config,
        })
    }

    /// 为 `peer` 取一个令牌；被限流时返回需要等待的时间
    pub fn check(&self, peer: SocketAddrV4) -> std::result::Result<(), Duration> {
        self.inner
            .check_key(&peer)
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }

    /// 丢弃令牌桶已经回满的对端状态
    pub fn shrink(&self) {
        self.inner.retain_recent();
        self.inner.shrink_to_fit();
    }

    /// 当前持有状态的对端数
    pub fn tracked_peers(&self) -> usize {
        self.inner.len()
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }
}
