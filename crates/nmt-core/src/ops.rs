//! Tensor Ops - 基础张量算子
//!
//! 编码器/解码器共用的数值核心：数值稳定的 softmax、LayerNorm、
//! 正弦位置编码表。全部基于 ndarray 视图，不做多余拷贝。

use ndarray::{Array1, Array2, ArrayView1, Axis, Zip};

/// 逐行 Softmax（数值稳定版：先减每行最大值再取 exp）
///
/// 行内允许存在 -inf（掩码位置），只要每行至少有一个有限值，
/// 输出每行和为 1。
pub fn softmax_rows(scores: &Array2<f32>) -> Array2<f32> {
    // 1. 每行最大值: [Rows, 1]
    let max_vals = scores.map_axis(Axis(1), |row| {
        row.fold(f32::NEG_INFINITY, |a, &b| a.max(b))
    });

    // 2. exp(x - max)，利用广播机制减去最大值
    let exps = (scores - &max_vals.insert_axis(Axis(1))).mapv(f32::exp);

    // 3. 归一化
    let sums = exps.sum_axis(Axis(1));
    &exps / &sums.insert_axis(Axis(1))
}

/// 单行 log-softmax，解码时用于 token 对数概率
pub fn log_softmax_row(logits: ArrayView1<f32>) -> Array1<f32> {
    let max = logits.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let log_sum = logits.mapv(|x| (x - max).exp()).sum().ln();
    logits.mapv(|x| x - max - log_sum)
}

/// LayerNorm：逐行标准化后按元素仿射 (scale, bias)
pub fn layer_norm(x: &Array2<f32>, scale: &Array1<f32>, bias: &Array1<f32>, eps: f32) -> Array2<f32> {
    let mut out = Array2::zeros(x.raw_dim());
    for (row, mut out_row) in x.outer_iter().zip(out.outer_iter_mut()) {
        let mean = row.mean().unwrap_or(0.0);
        let var = row.mapv(|v| (v - mean) * (v - mean)).mean().unwrap_or(0.0);
        let inv = 1.0 / (var + eps).sqrt();
        Zip::from(&mut out_row)
            .and(&row)
            .and(scale)
            .and(bias)
            .for_each(|o, &v, &s, &b| *o = (v - mean) * inv * s + b);
    }
    out
}

pub fn relu(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(|v| v.max(0.0))
}

/// 正弦位置编码表 [max_len, d_model]
///
/// PE(pos, 2i)   = sin(pos / 10000^(2i/d))
/// PE(pos, 2i+1) = cos(pos / 10000^(2i/d))
pub fn sinusoidal_table(max_len: usize, d_model: usize) -> Array2<f32> {
    let mut table = Array2::zeros((max_len, d_model));
    for pos in 0..max_len {
        for i in 0..d_model {
            let exponent = (2 * (i / 2)) as f32 / d_model as f32;
            let angle = pos as f32 / 10000f32.powf(exponent);
            table[[pos, i]] = if i % 2 == 0 { angle.sin() } else { angle.cos() };
        }
    }
    table
}
