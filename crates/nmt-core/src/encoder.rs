//! Encoder Stack - 编码器栈
//!
//! 批内各序列 padding 到同一长度，一次调用完成整批编码。
//! 每层: 自注意力 -> 残差 -> LayerNorm -> FFN -> 残差 -> LayerNorm (post-norm)。
//! 编码输出在整个解码过程中只读共享。

use ndarray::{s, Array2, Array3};

use crate::error::{Error, Result};
use crate::ops::{layer_norm, relu};
use crate::weights::{position_rows, EncoderLayerWeights, ModelWeights, LAYER_NORM_EPS};

/// 一个批次的编码结果
#[derive(Debug, Clone)]
pub struct EncodedBatch {
    /// [batch, padded_len, d_model]
    pub hidden: Array3<f32>,
    /// 每序列 padding 掩码，true = 真实 token
    pub masks: Vec<Vec<bool>>,
    pub lengths: Vec<usize>,
}

impl EncodedBatch {
    /// 第 i 个序列的编码输出视图 [padded_len, d_model]
    pub fn sequence(&self, i: usize) -> ndarray::ArrayView2<'_, f32> {
        self.hidden.slice(s![i, .., ..])
    }
}

/// 整批编码。序列 padding 到批内最大长度，padding 位置通过掩码
/// 从注意力中剔除。
pub fn encode_batch(weights: &ModelWeights, sequences: &[Vec<u32>]) -> Result<EncodedBatch> {
    if sequences.is_empty() {
        return Err(Error::InvalidArgument("empty batch".to_string()).into());
    }
    let config = &weights.config;
    let max_len = sequences.iter().map(|s| s.len()).max().unwrap_or(0);
    if max_len == 0 {
        return Err(Error::InvalidArgument("empty sequence in batch".to_string()).into());
    }
    if max_len > config.max_source_len {
        return Err(Error::InvalidArgument(format!(
            "source length {} exceeds limit {}",
            max_len, config.max_source_len
        ))
        .into());
    }

    let mut hidden = Array3::zeros((sequences.len(), max_len, config.d_model));
    let mut masks = Vec::with_capacity(sequences.len());
    let mut lengths = Vec::with_capacity(sequences.len());

    for (b, seq) in sequences.iter().enumerate() {
        // padding 到批内最大长度，pad 位置照常计算但被掩码屏蔽
        let mut padded = seq.clone();
        padded.resize(max_len, config.pad_id);
        let mut mask = vec![true; seq.len()];
        mask.resize(max_len, false);

        // embedding * sqrt(d) + 位置编码
        let mut x = weights.embed(&padded)?;
        x += &position_rows(weights, 0, max_len);

        for layer in &weights.encoder_layers {
            x = encoder_layer_forward(config.num_heads, layer, x, &mask)?;
        }

        hidden.slice_mut(s![b, .., ..]).assign(&x);
        masks.push(mask);
        lengths.push(seq.len());
    }

    Ok(EncodedBatch {
        hidden,
        masks,
        lengths,
    })
}

fn encoder_layer_forward(
    num_heads: usize,
    layer: &EncoderLayerWeights,
    x: Array2<f32>,
    mask: &[bool],
) -> Result<Array2<f32>> {
    // 自注意力 + 残差 + 归一化
    let (k, v) = layer.self_attn.project_kv(x.view());
    let attn = crate::attention::multi_head_attention(
        &layer.self_attn,
        x.view(),
        k.view(),
        v.view(),
        num_heads,
        Some(mask),
        None,
    )?;
    let x = layer_norm(&(&x + &attn), &layer.norm1.scale, &layer.norm1.bias, LAYER_NORM_EPS);

    // FFN + 残差 + 归一化
    let h = relu(&(x.dot(&layer.ffn.w1) + &layer.ffn.b1));
    let ff = h.dot(&layer.ffn.w2) + &layer.ffn.b2;
    Ok(layer_norm(&(&x + &ff), &layer.norm2.scale, &layer.norm2.bias, LAYER_NORM_EPS))
}
