//! Weight Store - 版本化权重仓库
//!
//! 热更新模型：读取方拿到的是 Arc 快照，reload 只替换槽位指针。
//! 在途批次继续使用自己启动时的快照，新批次看到新版本，
//! 任何时刻最多短暂共存两份权重。

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Context;
use chrono::{DateTime, Utc};

use nmt_core::{ModelConfig, ModelWeights};

#[derive(Debug)]
pub struct VersionedWeights {
    pub version: u64,
    pub loaded_at: DateTime<Utc>,
    pub weights: ModelWeights,
}

pub struct WeightStore {
    slot: RwLock<Option<Arc<VersionedWeights>>>,
    next_version: AtomicU64,
}

impl WeightStore {
    /// 空仓库：在第一次加载前所有翻译请求得到 ModelNotLoaded
    pub fn empty() -> Self {
        Self {
            slot: RwLock::new(None),
            next_version: AtomicU64::new(1),
        }
    }

    /// 当前快照；克隆 Arc，不持有锁
    pub fn snapshot(&self) -> Option<Arc<VersionedWeights>> {
        match self.slot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.snapshot().is_some()
    }

    pub fn version(&self) -> Option<u64> {
        self.snapshot().map(|v| v.version)
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot().map(|v| v.loaded_at)
    }

    /// 安装一套新权重，返回新版本号。换指针是原子动作，
    /// 读取方要么看到旧版本要么看到新版本，不会看到中间态。
    pub fn install(&self, weights: ModelWeights) -> u64 {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let fresh = Arc::new(VersionedWeights {
            version,
            loaded_at: Utc::now(),
            weights,
        });
        match self.slot.write() {
            Ok(mut guard) => *guard = Some(fresh),
            Err(poisoned) => *poisoned.into_inner() = Some(fresh),
        }
        version
    }

    /// 从权重目录加载并安装。加载失败时旧版本原样保留。
    pub fn load_dir(&self, dir: &Path) -> anyhow::Result<u64> {
        let weights = ModelWeights::from_dir(dir)
            .with_context(|| format!("loading model from {}", dir.display()))?;
        Ok(self.install(weights))
    }

    /// 固定种子初始化并安装（演示/预热/测试路径）
    pub fn install_seeded(&self, config: ModelConfig, seed: u64) -> anyhow::Result<u64> {
        config.validate()?;
        Ok(self.install(ModelWeights::seeded(config, seed)))
    }
}
