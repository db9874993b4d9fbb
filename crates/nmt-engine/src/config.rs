//! Engine Configuration - 服务核心配置

use std::time::Duration;

use anyhow::bail;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 缓存条目存活时间（秒）
    pub cache_ttl_secs: u64,

    /// 缓存容量（条目数），0 = 不缓存
    pub cache_capacity: usize,

    /// 合并窗口（毫秒）：首个请求到达后最多等待这么久凑批
    pub batch_window_ms: u64,

    /// 单批上限；为 1 时跳过合并窗口
    pub max_batch_size: usize,

    /// 单请求默认等待上限（毫秒）
    pub request_timeout_ms: u64,

    /// 启动时是否跑一次预热翻译
    pub warmup: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 3600,
            cache_capacity: 1000,
            batch_window_ms: 5,
            max_batch_size: 8,
            request_timeout_ms: 30_000,
            warmup: true,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_batch_size == 0 {
            bail!("max_batch_size must be >= 1");
        }
        if self.request_timeout_ms == 0 {
            bail!("request_timeout_ms must be nonzero");
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
