//! Translation Engine - 翻译引擎门面
//!
//! 请求路径：校验 -> 指纹 -> 缓存/单飞 -> 调度器 -> 解码 -> 组装响应。
//! 超时只包在等待端：共享计算在独立任务里继续，后续同指纹请求
//! 仍然能拿到它的结果。

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use nmt_core::controller::DecodeParams;
use nmt_core::ModelConfig;
use nmt_protocol::{
    supported_languages, HealthStatus, ModelInfo, TranslateError, TranslationRequest,
    TranslationResponse,
};

use crate::cache::{CacheConfig, CacheCounters, CachedTranslation, TranslationCache};
use crate::config::EngineConfig;
use crate::fingerprint::fingerprint;
use crate::pipeline::TextPipeline;
use crate::scheduler::{BatchScheduler, Job, SchedulerConfig};
use crate::store::WeightStore;

/// /stats 端点的快照
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStats {
    pub cache_entries: usize,
    pub cache: CacheCounters,
    pub model_version: Option<u64>,
    pub uptime_seconds: u64,
}

pub struct TranslationEngine {
    store: Arc<WeightStore>,
    cache: TranslationCache,
    scheduler: BatchScheduler,
    pipeline: Arc<TextPipeline>,
    config: EngineConfig,
    started_at: Instant,
}

impl TranslationEngine {
    /// 构建引擎并启动调度循环。权重仓库初始为空，
    /// 由 `load_model_dir` / `install_seeded` 填充。
    pub fn new(pipeline: TextPipeline, config: EngineConfig) -> anyhow::Result<Arc<Self>> {
        config.validate()?;
        let store = Arc::new(WeightStore::empty());
        let scheduler = BatchScheduler::start(
            Arc::clone(&store),
            SchedulerConfig {
                max_batch_size: config.max_batch_size,
                batch_window: config.batch_window(),
            },
        );
        let cache = TranslationCache::new(CacheConfig {
            ttl: config.cache_ttl(),
            capacity: config.cache_capacity,
        });
        Ok(Arc::new(Self {
            store,
            cache,
            scheduler,
            pipeline: Arc::new(pipeline),
            config,
            started_at: Instant::now(),
        }))
    }

    /// 翻译入口，使用引擎默认超时
    pub async fn translate(
        &self,
        request: TranslationRequest,
    ) -> Result<TranslationResponse, TranslateError> {
        self.translate_with_timeout(request, self.config.request_timeout())
            .await
    }

    /// 带显式等待上限的翻译。超时只作用于这一个等待方；
    /// 已经启动的共享计算继续完成并照常落缓存。
    pub async fn translate_with_timeout(
        &self,
        request: TranslationRequest,
        timeout: Duration,
    ) -> Result<TranslationResponse, TranslateError> {
        let started = Instant::now();
        request.validate()?;

        // 快照既是 ModelNotLoaded 检查，也提供编码所需的配置
        let snapshot = self.store.snapshot().ok_or(TranslateError::ModelNotLoaded)?;
        let model_config = &snapshot.weights.config;

        let source_ids = self.pipeline.encode_source(
            model_config,
            &request.source_language,
            &request.target_language,
            &request.text,
        )?;
        let params = DecodeParams {
            max_length: request.max_length,
            beam_size: request.beam_size,
            temperature: request.temperature,
        };

        let key = fingerprint(&request);
        let scheduler = self.scheduler.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let compute = move || async move {
            let (tx, rx) = tokio::sync::oneshot::channel();
            scheduler.submit(Job {
                source_ids,
                params,
                respond: tx,
            })?;
            let outcome = rx
                .await
                .map_err(|_| TranslateError::Compute("scheduler dropped request".to_string()))??;
            Ok(CachedTranslation {
                translated_text: pipeline.decode(&outcome.tokens),
                confidence: outcome.confidence(),
                truncated: outcome.truncated,
            })
        };

        let (value, _cache_hit) = tokio::time::timeout(timeout, self.cache.get_or_compute(key, compute))
            .await
            .map_err(|_| TranslateError::Timeout(timeout.as_millis() as u64))??;

        Ok(TranslationResponse {
            translated_text: value.translated_text,
            source_language: request.source_language,
            target_language: request.target_language,
            processing_time: started.elapsed().as_secs_f64(),
            confidence: value.confidence,
            truncated: value.truncated,
        })
    }

    /// 从权重目录热加载（阻塞 IO 放进 blocking 线程）
    pub async fn load_model_dir(&self, dir: &Path) -> anyhow::Result<u64> {
        let store = Arc::clone(&self.store);
        let dir = dir.to_path_buf();
        let version = tokio::task::spawn_blocking(move || store.load_dir(&dir)).await??;
        info!(version, "model weights installed");
        Ok(version)
    }

    /// 固定种子初始化权重（演示/测试）
    pub fn install_seeded(&self, config: ModelConfig, seed: u64) -> anyhow::Result<u64> {
        let version = self.store.install_seeded(config, seed)?;
        info!(version, seed, "seeded model weights installed");
        Ok(version)
    }

    /// 预热：跑一次真实翻译把各线程与内存路径拉起来。
    /// 失败只记日志，不阻止启动。
    pub async fn warmup(&self) {
        if !self.config.warmup {
            return;
        }
        let request = TranslationRequest::new("hello world", "en", "de");
        match self.translate(request).await {
            Ok(resp) => info!(elapsed = resp.processing_time, "warmup translation done"),
            Err(e) => warn!(error = %e, "warmup translation failed"),
        }
    }

    pub fn model_info(&self) -> ModelInfo {
        ModelInfo {
            languages_supported: supported_languages(),
            is_loaded: self.store.is_loaded(),
            version: self.store.version().unwrap_or(0),
            last_updated: self.store.loaded_at(),
        }
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus {
            status: if self.store.is_loaded() {
                "healthy".to_string()
            } else {
                "degraded".to_string()
            },
            model_loaded: self.store.is_loaded(),
            cache_entries: self.cache.len(),
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            cache_entries: self.cache.len(),
            cache: self.cache.counters(),
            model_version: self.store.version(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
        info!("translation cache cleared");
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_loaded(&self) -> bool {
        self.store.is_loaded()
    }
}
