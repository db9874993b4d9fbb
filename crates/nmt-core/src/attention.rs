//! Multi-Head Attention - 多头缩放点积注意力 (CPU)
//!
//! 单一实现同时服务三种用法：
//! - 编码器自注意力（padding 掩码）
//! - 解码器自注意力（增量 K/V，q_len=1 时因果性天然满足；
//!   批量 prefill 时通过 `causal_offset` 显式掩码）
//! - 解码器交叉注意力（K/V 来自编码器输出，padding 掩码）
//!
//! K/V 投影由调用方完成并传入，解码器因此可以缓存投影结果。

use ndarray::{s, Array2, ArrayView2, Axis};
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::ops::softmax_rows;

/// 一组注意力投影权重，全部为 [d_model, d_model]，按 x·W 使用
#[derive(Debug, Clone)]
pub struct AttentionWeights {
    pub wq: Array2<f32>,
    pub wk: Array2<f32>,
    pub wv: Array2<f32>,
    pub wo: Array2<f32>,
}

impl AttentionWeights {
    /// K/V 投影，交叉注意力在 init 时调用一次并缓存结果
    pub fn project_kv(&self, x: ArrayView2<f32>) -> (Array2<f32>, Array2<f32>) {
        (x.dot(&self.wk), x.dot(&self.wv))
    }
}

/// 多头注意力前向。
///
/// # Arguments
/// * `x_q` - Query 输入 [q_len, d_model]（未投影）
/// * `k_proj`, `v_proj` - 已投影的 K/V [kv_len, d_model]
/// * `key_padding` - 每个 key 位置是否为真实 token（false = padding，屏蔽）
/// * `causal_offset` - Some(past) 时启用因果掩码：第 i 行只能看前
///   past + i + 1 个 key
pub fn multi_head_attention(
    w: &AttentionWeights,
    x_q: ArrayView2<f32>,
    k_proj: ArrayView2<f32>,
    v_proj: ArrayView2<f32>,
    num_heads: usize,
    key_padding: Option<&[bool]>,
    causal_offset: Option<usize>,
) -> Result<Array2<f32>> {
    let (q_len, d_model) = x_q.dim();
    let (kv_len, kv_dim) = k_proj.dim();

    // --- 1. 形状契约 ---
    if d_model % num_heads != 0 {
        return Err(Error::ShapeMismatch(format!(
            "d_model ({}) not divisible by num_heads ({})",
            d_model, num_heads
        ))
        .into());
    }
    if kv_dim != d_model || v_proj.dim() != (kv_len, d_model) {
        return Err(Error::ShapeMismatch(format!(
            "K/V shape {:?}/{:?} does not match d_model {}",
            k_proj.dim(),
            v_proj.dim(),
            d_model
        ))
        .into());
    }
    if let Some(pad) = key_padding {
        if pad.len() != kv_len {
            return Err(Error::ShapeMismatch(format!(
                "padding mask len {} != kv_len {}",
                pad.len(),
                kv_len
            ))
            .into());
        }
    }

    let head_dim = d_model / num_heads;
    let scale = 1.0f32 / (head_dim as f32).sqrt();

    // --- 2. Q 投影 ---
    let q = x_q.dot(&w.wq); // [q_len, d_model]

    // --- 3. 按 head 并行计算 ---
    // 输出重塑为 3D [q_len, heads, head_dim]，沿 head 轴切分后
    // 每个可变视图互不重叠，rayon 可以安全分发
    let mut ctx = Array2::<f32>::zeros((q_len, d_model));
    {
        let mut ctx3 = ctx
            .view_mut()
            .into_shape_with_order((q_len, num_heads, head_dim))
            .map_err(|e| Error::ShapeMismatch(format!("ctx view failed: {}", e)))?;
        let heads: Vec<_> = ctx3.axis_iter_mut(Axis(1)).collect();

        heads.into_par_iter().enumerate().for_each(|(h, mut out_head)| {
            let col = h * head_dim..(h + 1) * head_dim;
            let q_head = q.slice(s![.., col.clone()]);
            let k_head = k_proj.slice(s![.., col.clone()]);
            let v_head = v_proj.slice(s![.., col]);

            // S = Q · K^T / sqrt(d_k)，shape [q_len, kv_len]
            let mut scores = q_head.dot(&k_head.t());
            scores *= scale;

            // Padding 掩码：屏蔽非真实 token 的 key 列
            if let Some(pad) = key_padding {
                for (j, &real) in pad.iter().enumerate() {
                    if !real {
                        scores.column_mut(j).fill(f32::NEG_INFINITY);
                    }
                }
            }

            // 因果掩码：第 i 行只看前 past + i + 1 个 key
            if let Some(past) = causal_offset {
                for (i, mut row) in scores.outer_iter_mut().enumerate() {
                    let valid = past + i + 1;
                    if valid < kv_len {
                        row.slice_mut(s![valid..]).fill(f32::NEG_INFINITY);
                    }
                }
            }

            let probs = softmax_rows(&scores);
            out_head.assign(&probs.dot(&v_head));
        });
    }

    // --- 4. 输出投影 ---
    Ok(ctx.dot(&w.wo))
}
