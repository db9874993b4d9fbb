//! Translation Cache - 翻译结果缓存
//!
//! 按指纹缓存最终译文。三条规则：
//! - 惰性 TTL：过期条目在下次命中时删除，没有后台清扫线程；
//! - 容量上限：超出后淘汰最久未访问的条目（capacity = 0 时完全旁路存储）；
//! - 单飞：同一指纹的并发请求只触发一次计算，其余订阅共享结果。
//!   计算跑在独立 spawn 的任务里，等待方超时或断开不会取消它；
//!   计算失败只广播错误，不写入缓存，下一个请求照常重算。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;

use nmt_protocol::TranslateError;

/// 缓存值：最终译文与解码元信息
#[derive(Debug, Clone)]
pub struct CachedTranslation {
    pub translated_text: String,
    pub confidence: f32,
    pub truncated: bool,
}

struct CacheEntry {
    value: CachedTranslation,
    created_at: Instant,
    last_access: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub capacity: usize,
}

/// 命中/计算计数（/stats 用）
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CacheCounters {
    pub hits: u64,
    pub computed: u64,
    pub joined: u64,
}

struct Inner {
    entries: DashMap<u64, CacheEntry>,
    inflight: DashMap<u64, broadcast::Sender<Result<CachedTranslation, TranslateError>>>,
    config: CacheConfig,
    hits: AtomicU64,
    computed: AtomicU64,
    joined: AtomicU64,
}

#[derive(Clone)]
pub struct TranslationCache {
    inner: Arc<Inner>,
}

impl TranslationCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                inflight: DashMap::new(),
                config,
                hits: AtomicU64::new(0),
                computed: AtomicU64::new(0),
                joined: AtomicU64::new(0),
            }),
        }
    }

    /// 查缓存，命中刷新访问时间；过期条目就地删除
    pub fn lookup(&self, key: u64) -> Option<CachedTranslation> {
        if self.inner.config.capacity == 0 {
            return None;
        }
        let expired = match self.inner.entries.get_mut(&key) {
            None => return None,
            Some(mut entry) => {
                if entry.created_at.elapsed() >= self.inner.config.ttl {
                    true
                } else {
                    entry.last_access = Instant::now();
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
            }
        };
        if expired {
            self.inner.entries.remove(&key);
        }
        None
    }

    /// 命中直接返回；未命中时同一指纹至多一个计算任务，
    /// 并发调用方共享其结果。返回 (值, 是否缓存命中)。
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: u64,
        compute: F,
    ) -> Result<(CachedTranslation, bool), TranslateError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<CachedTranslation, TranslateError>>
            + Send
            + 'static,
    {
        if let Some(value) = self.lookup(key) {
            return Ok((value, true));
        }

        let mut rx = match self.inner.inflight.entry(key) {
            Entry::Occupied(occupied) => {
                // 已有同指纹计算在途，订阅共享结果
                self.inner.joined.fetch_add(1, Ordering::Relaxed);
                occupied.get().subscribe()
            }
            Entry::Vacant(slot) => {
                self.inner.computed.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = broadcast::channel(1);
                slot.insert(tx.clone());

                // 计算在独立任务里进行：等待方的超时/断开不影响它
                let inner = Arc::clone(&self.inner);
                let fut = compute();
                tokio::spawn(async move {
                    let result = fut.await;
                    if let Ok(value) = &result {
                        inner.store(key, value.clone());
                    }
                    // 先写缓存、再摘 inflight、最后广播：订阅只可能发生在
                    // inflight 条目存在期间，因此永远在广播之前
                    inner.inflight.remove(&key);
                    let _ = tx.send(result);
                });
                rx
            }
        };

        match rx.recv().await {
            Ok(outcome) => outcome.map(|v| (v, false)),
            Err(_) => {
                // 计算任务在广播前消失（panic），清掉残留的 inflight 条目
                self.inner.inflight.remove(&key);
                Err(TranslateError::Compute(
                    "translation task aborted before completion".to_string(),
                ))
            }
        }
    }

    pub fn clear(&self) {
        self.inner.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn counters(&self) -> CacheCounters {
        CacheCounters {
            hits: self.inner.hits.load(Ordering::Relaxed),
            computed: self.inner.computed.load(Ordering::Relaxed),
            joined: self.inner.joined.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    fn store(&self, key: u64, value: CachedTranslation) {
        if self.config.capacity == 0 {
            return;
        }
        let now = Instant::now();
        self.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
                last_access: now,
            },
        );
        // 超出容量时淘汰最久未访问的条目
        while self.entries.len() > self.config.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().last_access)
                .map(|e| *e.key());
            match oldest {
                Some(k) => {
                    self.entries.remove(&k);
                }
                None => break,
            }
        }
    }
}
