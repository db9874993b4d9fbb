//! Batch Scheduler - 批次调度器
//!
//! mpsc 提交队列 + 单消费者循环。消费者是唯一的计算入口，
//! 一批张量计算 await 完成后才取下一批，天然串行化了对 CPU 的争用。
//!
//! 合并窗口：首个请求到达后开窗，batch_window 到期或凑满
//! max_batch_size 即封批；max_batch_size == 1 时不开窗。
//! 整批共享一次编码，解码逐步推进，已完成的序列退出后续步。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use nmt_core::controller::{DecodeController, DecodeOutcome, DecodeParams};
use nmt_core::encoder::encode_batch;
use nmt_core::ModelWeights;
use nmt_protocol::TranslateError;

use crate::store::WeightStore;

pub struct Job {
    pub source_ids: Vec<u32>,
    pub params: DecodeParams,
    pub respond: oneshot::Sender<Result<DecodeOutcome, TranslateError>>,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub max_batch_size: usize,
    pub batch_window: Duration,
}

#[derive(Clone)]
pub struct BatchScheduler {
    queue: mpsc::UnboundedSender<Job>,
}

impl BatchScheduler {
    /// 启动消费者循环并返回提交句柄
    pub fn start(store: Arc<WeightStore>, config: SchedulerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_loop(rx, store, config));
        Self { queue: tx }
    }

    pub fn submit(&self, job: Job) -> Result<(), TranslateError> {
        self.queue
            .send(job)
            .map_err(|_| TranslateError::Compute("scheduler stopped".to_string()))
    }
}

async fn run_loop(
    mut rx: mpsc::UnboundedReceiver<Job>,
    store: Arc<WeightStore>,
    config: SchedulerConfig,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];

        // 合并窗口：时间或容量先到为准
        if config.max_batch_size > 1 {
            let deadline = Instant::now() + config.batch_window;
            while batch.len() < config.max_batch_size {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(job)) => batch.push(job),
                    Ok(None) => break,
                    Err(_) => break, // 窗口到期
                }
            }
        }

        // 批次启动时固定一份权重快照，期间 reload 不影响本批
        let snapshot = match store.snapshot() {
            Some(s) => s,
            None => {
                warn!(jobs = batch.len(), "batch rejected: no model loaded");
                for job in batch {
                    let _ = job.respond.send(Err(TranslateError::ModelNotLoaded));
                }
                continue;
            }
        };

        debug!(
            jobs = batch.len(),
            version = snapshot.version,
            "dispatching batch"
        );

        // 张量计算进阻塞线程；await 使上一批完成后才封下一批
        let joined = tokio::task::spawn_blocking(move || {
            run_batch(&snapshot.weights, batch);
        })
        .await;
        if let Err(e) = joined {
            // 批任务 panic：oneshot 发送端一并丢弃，等待方收到断开错误
            error!(error = %e, "batch task failed");
        }
    }
}

/// 同步执行一整批：一次编码 + 逐步解码
fn run_batch(weights: &ModelWeights, jobs: Vec<Job>) {
    let sources: Vec<Vec<u32>> = jobs.iter().map(|j| j.source_ids.clone()).collect();

    let encoded = match encode_batch(weights, &sources) {
        Ok(e) => e,
        Err(e) => {
            let msg = e.to_string();
            for job in jobs {
                let _ = job.respond.send(Err(TranslateError::Compute(msg.clone())));
            }
            return;
        }
    };

    let mut controllers: Vec<Option<DecodeController>> = Vec::with_capacity(jobs.len());
    let mut responders = Vec::with_capacity(jobs.len());
    let mut max_steps = 0usize;

    for (i, job) in jobs.into_iter().enumerate() {
        match DecodeController::new(
            weights,
            encoded.sequence(i),
            encoded.masks[i].clone(),
            job.params.clone(),
        ) {
            Ok(ctrl) => {
                max_steps = max_steps.max(job.params.max_length + 1);
                controllers.push(Some(ctrl));
                responders.push(Some(job.respond));
            }
            Err(e) => {
                // 单个序列初始化失败不拖垮整批
                let _ = job.respond.send(Err(TranslateError::Compute(e.to_string())));
                controllers.push(None);
                responders.push(None);
            }
        }
    }

    // 确定性逐步推进；完成的序列不再参与后续步
    for _ in 0..max_steps {
        let mut active = false;
        for i in 0..controllers.len() {
            let Some(ctrl) = controllers[i].as_mut() else {
                continue;
            };
            if ctrl.is_finished() {
                continue;
            }
            active = true;
            if let Err(e) = ctrl.step(weights) {
                if let Some(tx) = responders[i].take() {
                    let _ = tx.send(Err(TranslateError::Compute(e.to_string())));
                }
                controllers[i] = None;
            }
        }
        if !active {
            break;
        }
    }

    for (ctrl, responder) in controllers.into_iter().zip(responders) {
        if let (Some(ctrl), Some(tx)) = (ctrl, responder) {
            let _ = tx.send(Ok(ctrl.into_outcome()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nmt_core::ModelConfig;

    fn params(max_length: usize) -> DecodeParams {
        DecodeParams {
            max_length,
            beam_size: 1,
            temperature: 1.0,
        }
    }

    async fn submit_one(
        scheduler: &BatchScheduler,
        ids: Vec<u32>,
        max_length: usize,
    ) -> Result<DecodeOutcome, TranslateError> {
        let (tx, rx) = oneshot::channel();
        scheduler
            .submit(Job {
                source_ids: ids,
                params: params(max_length),
                respond: tx,
            })
            .unwrap();
        rx.await.expect("scheduler dropped responder")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_model_rejects_jobs() {
        let store = Arc::new(WeightStore::empty());
        let scheduler = BatchScheduler::start(
            store,
            SchedulerConfig {
                max_batch_size: 4,
                batch_window: Duration::from_millis(2),
            },
        );
        let res = submit_one(&scheduler, vec![3, 4], 4).await;
        assert!(matches!(res, Err(TranslateError::ModelNotLoaded)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_jobs_all_answered() {
        let store = Arc::new(WeightStore::empty());
        store.install_seeded(ModelConfig::tiny(), 7).unwrap();
        let scheduler = BatchScheduler::start(
            Arc::clone(&store),
            SchedulerConfig {
                max_batch_size: 4,
                batch_window: Duration::from_millis(5),
            },
        );

        let mut handles = Vec::new();
        for t in 0..6u32 {
            let s = scheduler.clone();
            handles.push(tokio::spawn(async move {
                submit_one(&s, vec![3 + t, 4, 5], 4).await
            }));
        }
        for h in handles {
            let outcome = h.await.unwrap().unwrap();
            assert!(outcome.tokens.len() <= 4);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_batched_result_matches_solo() {
        // 同一序列单独算和随批算结果一致（padding 被掩码隔离）
        let store = Arc::new(WeightStore::empty());
        store.install_seeded(ModelConfig::tiny(), 7).unwrap();
        let solo_sched = BatchScheduler::start(
            Arc::clone(&store),
            SchedulerConfig {
                max_batch_size: 1,
                batch_window: Duration::from_millis(0),
            },
        );
        let solo = submit_one(&solo_sched, vec![3, 4, 5], 4).await.unwrap();

        let batch_sched = BatchScheduler::start(
            Arc::clone(&store),
            SchedulerConfig {
                max_batch_size: 4,
                batch_window: Duration::from_millis(10),
            },
        );
        let a = {
            let s = batch_sched.clone();
            tokio::spawn(async move { submit_one(&s, vec![3, 4, 5], 4).await })
        };
        let b = {
            let s = batch_sched.clone();
            tokio::spawn(async move { submit_one(&s, vec![9, 10, 11, 12, 13], 4).await })
        };
        let batched = a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(solo.tokens, batched.tokens);
        assert!((solo.avg_logprob - batched.avg_logprob).abs() < 1e-4);
    }
}
