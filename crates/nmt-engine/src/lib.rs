//! NMT Engine - 翻译服务核心
//!
//! 把 nmt-core 的纯计算包装成可并发服务的形态：
//! - 结果缓存（指纹、TTL + LRU、单飞去重）
//! - 批次调度器（合并窗口 + 串行计算循环）
//! - 版本化权重仓库（原子热更新）
//! - 分词管线（任务前缀 + HF tokenizer）
//! - TranslationEngine 门面

pub mod cache;
pub mod config;
pub mod engine;
pub mod fingerprint;
pub mod pipeline;
pub mod scheduler;
pub mod store;

pub use cache::{CachedTranslation, TranslationCache};
pub use config::EngineConfig;
pub use engine::{EngineStats, TranslationEngine};
pub use fingerprint::fingerprint;
pub use pipeline::TextPipeline;
pub use scheduler::BatchScheduler;
pub use store::{VersionedWeights, WeightStore};
