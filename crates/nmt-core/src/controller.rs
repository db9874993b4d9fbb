//! Decoding Controller - 解码控制器
//!
//! 显式状态机 INIT -> GENERATING -> {DONE, TRUNCATED}，由外部批次循环
//! 逐步推进（每次 step 推进一个解码步）。两种搜索策略：
//! - 贪心 (beam_size = 1)：argmax，平手取最小 token id；
//! - 束搜索 (beam_size > 1)：长度归一化累计对数概率，全局 top-k 剪枝，
//!   完成集合；有完成假设时取最优完成，否则取最优存活假设并标记截断。
//!
//! 打分与剪枝一律用未缩放 logits 的对数概率，温度只参与置信度数值的
//! 计算，不影响任何选择。达到 max_length 是成功 + 截断标记，不是错误。

use std::cmp::Ordering;

use ndarray::{ArrayView1, ArrayView2};

use crate::decoder::{decode_step, DecodeState};
use crate::error::{Error, Result};
use crate::ops::log_softmax_row;
use crate::weights::ModelWeights;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePhase {
    Init,
    Generating,
    Done,
    Truncated,
}

#[derive(Debug, Clone)]
pub struct DecodeParams {
    pub max_length: usize,
    pub beam_size: usize,
    pub temperature: f32,
}

/// 解码结果。`avg_logprob` 为逐 token 对数概率的均值（含 EOS 决策），
/// 置信度即其指数。
#[derive(Debug, Clone)]
pub struct DecodeOutcome {
    pub tokens: Vec<u32>,
    pub avg_logprob: f32,
    pub truncated: bool,
}

impl DecodeOutcome {
    pub fn confidence(&self) -> f32 {
        self.avg_logprob.exp().clamp(0.0, 1.0)
    }
}

/// argmax，平手取最小下标（严格大于才更新）
pub fn argmax_lowest(row: ArrayView1<f32>) -> usize {
    let mut best = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in row.iter().enumerate() {
        if v > best_val {
            best = i;
            best_val = v;
        }
    }
    best
}

struct GreedySearch {
    state: DecodeState,
    last: u32,
    tokens: Vec<u32>,
    sum_logprob: f32,
    decisions: usize,
}

/// `sum_logprob` 累计未缩放对数概率，只用于打分/剪枝；
/// `conf_logprob` 累计温度缩放后的对数概率，只用于置信度。
struct Hypothesis {
    state: DecodeState,
    last: u32,
    tokens: Vec<u32>,
    sum_logprob: f32,
    conf_logprob: f32,
    decisions: usize,
}

impl Hypothesis {
    fn norm_score(&self) -> f32 {
        self.sum_logprob / self.decisions.max(1) as f32
    }

    fn avg_conf(&self) -> f32 {
        self.conf_logprob / self.decisions.max(1) as f32
    }
}

struct Finished {
    tokens: Vec<u32>,
    sum_logprob: f32,
    conf_logprob: f32,
    decisions: usize,
}

impl Finished {
    fn norm_score(&self) -> f32 {
        self.sum_logprob / self.decisions.max(1) as f32
    }

    fn avg_conf(&self) -> f32 {
        self.conf_logprob / self.decisions.max(1) as f32
    }
}

struct BeamSearch {
    live: Vec<Hypothesis>,
    finished: Vec<Finished>,
    width: usize,
}

enum Search {
    Greedy(GreedySearch),
    Beam(BeamSearch),
}

pub struct DecodeController {
    phase: DecodePhase,
    params: DecodeParams,
    eos_id: u32,
    search: Search,
}

impl DecodeController {
    pub fn new(
        weights: &ModelWeights,
        encoder_out: ArrayView2<f32>,
        src_mask: Vec<bool>,
        params: DecodeParams,
    ) -> Result<Self> {
        if params.max_length == 0 || params.beam_size == 0 {
            return Err(
                Error::InvalidArgument("max_length and beam_size must be >= 1".to_string()).into(),
            );
        }
        if !(params.temperature.is_finite() && params.temperature > 0.0) {
            return Err(Error::InvalidArgument(format!(
                "temperature must be a positive finite number, got {}",
                params.temperature
            ))
            .into());
        }
        // 位置表只有 max_target_len 行，请求的 max_length 在此收紧
        let params = DecodeParams {
            max_length: params.max_length.min(weights.config.max_target_len),
            ..params
        };

        let state = DecodeState::init(weights, encoder_out, src_mask)?;
        let bos = weights.config.bos_id;
        let search = if params.beam_size == 1 {
            Search::Greedy(GreedySearch {
                state,
                last: bos,
                tokens: Vec::new(),
                sum_logprob: 0.0,
                decisions: 0,
            })
        } else {
            Search::Beam(BeamSearch {
                live: vec![Hypothesis {
                    state,
                    last: bos,
                    tokens: Vec::new(),
                    sum_logprob: 0.0,
                    conf_logprob: 0.0,
                    decisions: 0,
                }],
                finished: Vec::new(),
                width: params.beam_size,
            })
        };

        Ok(Self {
            phase: DecodePhase::Init,
            params,
            eos_id: weights.config.eos_id,
            search,
        })
    }

    pub fn phase(&self) -> DecodePhase {
        self.phase
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, DecodePhase::Done | DecodePhase::Truncated)
    }

    /// 推进一个解码步。已结束的控制器 step 是 no-op，批次循环据此
    /// 把完成的序列排除在后续步之外。
    pub fn step(&mut self, weights: &ModelWeights) -> Result<()> {
        if self.is_finished() {
            return Ok(());
        }
        self.phase = DecodePhase::Generating;
        match &mut self.search {
            Search::Greedy(_) => self.step_greedy(weights),
            Search::Beam(_) => self.step_beam(weights),
        }
    }

    fn step_greedy(&mut self, weights: &ModelWeights) -> Result<()> {
        let g = match &mut self.search {
            Search::Greedy(g) => g,
            Search::Beam(_) => unreachable!(),
        };
        let logits = decode_step(weights, &mut g.state, g.last)?;
        let logp = log_softmax_row(logits.view());
        let next = argmax_lowest(logp.view()) as u32;

        // 置信度取温度缩放后的对数概率，选择本身不看温度
        let temperature = self.params.temperature;
        g.sum_logprob += if (temperature - 1.0).abs() < f32::EPSILON {
            logp[next as usize]
        } else {
            let scaled = logits.mapv(|v| v / temperature);
            log_softmax_row(scaled.view())[next as usize]
        };
        g.decisions += 1;

        if next == self.eos_id {
            self.phase = DecodePhase::Done;
        } else {
            g.tokens.push(next);
            g.last = next;
            if g.tokens.len() >= self.params.max_length {
                self.phase = DecodePhase::Truncated;
            }
        }
        Ok(())
    }

    fn step_beam(&mut self, weights: &ModelWeights) -> Result<()> {
        let (eos, temperature, max_length) =
            (self.eos_id, self.params.temperature, self.params.max_length);
        let b = match &mut self.search {
            Search::Beam(b) => b,
            Search::Greedy(_) => unreachable!(),
        };
        let width = b.width;

        struct Candidate {
            pidx: usize,
            token: u32,
            sum_logprob: f32,
            conf_logprob: f32,
            decisions: usize,
        }

        // 1. 扩展每个存活假设：各取 top-width 个候选
        // parents 保存已 step 的解码状态，被选中的候选再从这里克隆分叉
        let mut parents: Vec<(DecodeState, Vec<u32>)> = Vec::with_capacity(b.live.len());
        let mut candidates: Vec<Candidate> = Vec::new();
        for hyp in b.live.drain(..) {
            let Hypothesis {
                mut state,
                last,
                tokens,
                sum_logprob,
                conf_logprob,
                decisions,
            } = hyp;
            let logits = decode_step(weights, &mut state, last)?;
            // 打分用未缩放对数概率，温度只进置信度那一列
            let logp = log_softmax_row(logits.view());
            let conf = if (temperature - 1.0).abs() < f32::EPSILON {
                None
            } else {
                let scaled = logits.mapv(|v| v / temperature);
                Some(log_softmax_row(scaled.view()))
            };

            let mut idx: Vec<usize> = (0..logp.len()).collect();
            idx.sort_by(|&a, &c| {
                logp[c]
                    .partial_cmp(&logp[a])
                    .unwrap_or(Ordering::Equal)
                    .then(a.cmp(&c))
            });
            let pidx = parents.len();
            for &t in idx.iter().take(width) {
                candidates.push(Candidate {
                    pidx,
                    token: t as u32,
                    sum_logprob: sum_logprob + logp[t],
                    conf_logprob: conf_logprob + conf.as_ref().map_or(logp[t], |c| c[t]),
                    decisions: decisions + 1,
                });
            }
            parents.push((state, tokens));
        }

        // 2. 全局按长度归一化分数剪枝到 width 个
        candidates.sort_by(|a, c| {
            let sa = a.sum_logprob / a.decisions as f32;
            let sc = c.sum_logprob / c.decisions as f32;
            sc.partial_cmp(&sa).unwrap_or(Ordering::Equal)
        });
        for cand in candidates.into_iter().take(width) {
            if cand.token == eos {
                b.finished.push(Finished {
                    tokens: parents[cand.pidx].1.clone(),
                    sum_logprob: cand.sum_logprob,
                    conf_logprob: cand.conf_logprob,
                    decisions: cand.decisions,
                });
            } else {
                let mut tokens = parents[cand.pidx].1.clone();
                tokens.push(cand.token);
                b.live.push(Hypothesis {
                    state: parents[cand.pidx].0.clone(),
                    last: cand.token,
                    tokens,
                    sum_logprob: cand.sum_logprob,
                    conf_logprob: cand.conf_logprob,
                    decisions: cand.decisions,
                });
            }
        }

        // 3. 终止判定：完成集合满、无存活假设、或存活假设达到长度上限
        let exhausted = b
            .live
            .first()
            .map(|h| h.tokens.len() >= max_length)
            .unwrap_or(false);
        if b.finished.len() >= width || b.live.is_empty() || exhausted {
            self.phase = if b.finished.is_empty() {
                DecodePhase::Truncated
            } else {
                DecodePhase::Done
            };
        }
        Ok(())
    }

    /// 取出最终结果。贪心直接返回累计序列；束搜索优先取最优完成假设，
    /// 否则取最优存活假设并标记截断。
    pub fn into_outcome(self) -> DecodeOutcome {
        let truncated_phase = self.phase == DecodePhase::Truncated;
        match self.search {
            Search::Greedy(g) => DecodeOutcome {
                tokens: g.tokens,
                avg_logprob: if g.decisions == 0 {
                    0.0
                } else {
                    g.sum_logprob / g.decisions as f32
                },
                truncated: truncated_phase,
            },
            Search::Beam(b) => {
                let best_finished = b
                    .finished
                    .into_iter()
                    .max_by(|a, c| {
                        a.norm_score()
                            .partial_cmp(&c.norm_score())
                            .unwrap_or(Ordering::Equal)
                    });
                if let Some(f) = best_finished {
                    DecodeOutcome {
                        avg_logprob: f.avg_conf(),
                        tokens: f.tokens,
                        truncated: false,
                    }
                } else if let Some(h) = b.live.into_iter().max_by(|a, c| {
                    a.norm_score()
                        .partial_cmp(&c.norm_score())
                        .unwrap_or(Ordering::Equal)
                }) {
                    DecodeOutcome {
                        avg_logprob: h.avg_conf(),
                        tokens: h.tokens,
                        truncated: true,
                    }
                } else {
                    DecodeOutcome {
                        tokens: Vec::new(),
                        avg_logprob: 0.0,
                        truncated: true,
                    }
                }
            }
        }
    }
}

/// 跑完整个解码循环。批次调度器有自己的逐步循环，这个入口给
/// 单序列路径和测试使用。步数上界为 max_length + 1。
pub fn run_to_completion(
    weights: &ModelWeights,
    encoder_out: ArrayView2<f32>,
    src_mask: Vec<bool>,
    params: DecodeParams,
) -> Result<DecodeOutcome> {
    let max_steps = params.max_length + 1;
    let mut ctrl = DecodeController::new(weights, encoder_out, src_mask, params)?;
    for _ in 0..max_steps {
        if ctrl.is_finished() {
            break;
        }
        ctrl.step(weights)?;
    }
    Ok(ctrl.into_outcome())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::encoder::encode_batch;
    use crate::weights::ModelWeights;
    use ndarray::array;

    fn setup() -> (ModelWeights, crate::encoder::EncodedBatch) {
        let w = ModelWeights::seeded(ModelConfig::tiny(), 2024);
        let enc = encode_batch(&w, &[vec![5, 9, 13]]).unwrap();
        (w, enc)
    }

    fn params(max_length: usize, beam_size: usize) -> DecodeParams {
        DecodeParams {
            max_length,
            beam_size,
            temperature: 1.0,
        }
    }

    #[test]
    fn test_argmax_tie_breaks_to_lowest_index() {
        let row = array![1.0_f32, 3.0, 3.0, 2.0];
        assert_eq!(argmax_lowest(row.view()), 1);
        let row = array![f32::NEG_INFINITY, f32::NEG_INFINITY];
        assert_eq!(argmax_lowest(row.view()), 0);
    }

    #[test]
    fn test_greedy_terminates_within_bound() {
        let (w, enc) = setup();
        let out =
            run_to_completion(&w, enc.sequence(0), enc.masks[0].clone(), params(8, 1)).unwrap();
        assert!(out.tokens.len() <= 8);
        assert!(out.confidence() > 0.0 && out.confidence() <= 1.0);
    }

    #[test]
    fn test_greedy_deterministic() {
        let (w, enc) = setup();
        let a = run_to_completion(&w, enc.sequence(0), enc.masks[0].clone(), params(8, 1)).unwrap();
        let b = run_to_completion(&w, enc.sequence(0), enc.masks[0].clone(), params(8, 1)).unwrap();
        assert_eq!(a.tokens, b.tokens);
        assert!((a.avg_logprob - b.avg_logprob).abs() < 1e-7);
    }

    #[test]
    fn test_max_length_one_is_success_not_error() {
        let (w, enc) = setup();
        let out =
            run_to_completion(&w, enc.sequence(0), enc.masks[0].clone(), params(1, 1)).unwrap();
        // 要么第一步就 EOS (Done)，要么截断；都不是错误
        assert!(out.tokens.len() <= 1);
        if !out.tokens.is_empty() {
            assert!(out.truncated);
        }
    }

    #[test]
    fn test_stepwise_matches_run_to_completion() {
        let (w, enc) = setup();
        let g = run_to_completion(&w, enc.sequence(0), enc.masks[0].clone(), params(6, 1)).unwrap();
        // 外部逐步推进（批次循环的用法）与一次跑完结果一致
        let mut ctrl =
            DecodeController::new(&w, enc.sequence(0), enc.masks[0].clone(), params(6, 1)).unwrap();
        for _ in 0..7 {
            if ctrl.is_finished() {
                break;
            }
            ctrl.step(&w).unwrap();
        }
        let b = ctrl.into_outcome();
        assert_eq!(g.tokens, b.tokens);
        assert!((g.avg_logprob - b.avg_logprob).abs() < 1e-7);
    }

    #[test]
    fn test_beam_score_not_worse_than_greedy() {
        let (w, enc) = setup();
        let g = run_to_completion(&w, enc.sequence(0), enc.masks[0].clone(), params(3, 1)).unwrap();
        let b = run_to_completion(&w, enc.sequence(0), enc.masks[0].clone(), params(3, 8)).unwrap();
        assert!(
            b.avg_logprob >= g.avg_logprob - 1e-4,
            "beam {} < greedy {}",
            b.avg_logprob,
            g.avg_logprob
        );
    }

    #[test]
    fn test_beam_selection_invariant_to_temperature() {
        // 温度只缩放置信度，束搜索选出的序列必须逐 token 一致
        for seed in [7_u64, 29, 101, 2024] {
            let w = ModelWeights::seeded(ModelConfig::tiny(), seed);
            let enc = encode_batch(&w, &[vec![3, 9, 17]]).unwrap();
            let cold = run_to_completion(
                &w,
                enc.sequence(0),
                enc.masks[0].clone(),
                DecodeParams {
                    max_length: 8,
                    beam_size: 4,
                    temperature: 1.0,
                },
            )
            .unwrap();
            let hot = run_to_completion(
                &w,
                enc.sequence(0),
                enc.masks[0].clone(),
                DecodeParams {
                    max_length: 8,
                    beam_size: 4,
                    temperature: 3.5,
                },
            )
            .unwrap();
            assert_eq!(cold.tokens, hot.tokens, "seed {seed}");
            assert_eq!(cold.truncated, hot.truncated, "seed {seed}");
        }
    }

    #[test]
    fn test_temperature_flattens_greedy_confidence() {
        // 贪心每步取 argmax，T > 1 压平分布后该 token 的概率单调下降
        let (w, enc) = setup();
        let cold =
            run_to_completion(&w, enc.sequence(0), enc.masks[0].clone(), params(8, 1)).unwrap();
        let hot = run_to_completion(
            &w,
            enc.sequence(0),
            enc.masks[0].clone(),
            DecodeParams {
                max_length: 8,
                beam_size: 1,
                temperature: 3.5,
            },
        )
        .unwrap();
        assert_eq!(cold.tokens, hot.tokens);
        assert!(hot.avg_logprob <= cold.avg_logprob + 1e-6);
    }

    #[test]
    fn test_finished_controller_step_is_noop() {
        let (w, enc) = setup();
        let mut ctrl =
            DecodeController::new(&w, enc.sequence(0), enc.masks[0].clone(), params(2, 1)).unwrap();
        for _ in 0..3 {
            ctrl.step(&w).unwrap();
        }
        assert!(ctrl.is_finished());
        let phase = ctrl.phase();
        ctrl.step(&w).unwrap();
        assert_eq!(ctrl.phase(), phase);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let (w, enc) = setup();
        assert!(
            DecodeController::new(&w, enc.sequence(0), enc.masks[0].clone(), params(0, 1)).is_err()
        );
        assert!(DecodeController::new(
            &w,
            enc.sequence(0),
            enc.masks[0].clone(),
            DecodeParams {
                max_length: 4,
                beam_size: 1,
                temperature: 0.0
            }
        )
        .is_err());
    }
}
