//! Decoder Stack - 解码器栈与增量解码状态
//!
//! 每个请求独占一个 DecodeState：
//! - 自注意力 K/V 逐步追加（每步只投影新 token，避免重复计算前缀）；
//! - 交叉注意力 K/V 在 init 时从编码输出投影一次，之后只读。
//! q_len=1 的自注意力天然满足因果性（缓存里只有过去的 token）。
//!
//! 状态 Clone 后两份互不影响，束搜索靠这一点分叉假设。

use ndarray::{Array1, Array2, ArrayView2};

use crate::attention::multi_head_attention;
use crate::error::{Error, Result};
use crate::ops::{layer_norm, relu};
use crate::weights::{position_rows, DecoderLayerWeights, ModelWeights, LAYER_NORM_EPS};

/// 单层的 K/V 缓存
#[derive(Debug, Clone)]
struct LayerKv {
    self_k: Array2<f32>,  // [生成步数, d_model]，逐步增长
    self_v: Array2<f32>,
    cross_k: Array2<f32>, // [src_len, d_model]，init 后只读
    cross_v: Array2<f32>,
}

/// 单请求增量解码状态
#[derive(Debug, Clone)]
pub struct DecodeState {
    step: usize,
    layers: Vec<LayerKv>,
    src_mask: Vec<bool>,
}

impl DecodeState {
    /// 从编码输出初始化：逐层预投影交叉注意力 K/V
    pub fn init(
        weights: &ModelWeights,
        encoder_out: ArrayView2<f32>,
        src_mask: Vec<bool>,
    ) -> Result<Self> {
        let d = weights.config.d_model;
        if encoder_out.ncols() != d {
            return Err(Error::ShapeMismatch(format!(
                "encoder output width {} != d_model {}",
                encoder_out.ncols(),
                d
            ))
            .into());
        }
        if src_mask.len() != encoder_out.nrows() {
            return Err(Error::ShapeMismatch(format!(
                "src mask len {} != encoder rows {}",
                src_mask.len(),
                encoder_out.nrows()
            ))
            .into());
        }

        let layers = weights
            .decoder_layers
            .iter()
            .map(|layer| {
                let (cross_k, cross_v) = layer.cross_attn.project_kv(encoder_out);
                LayerKv {
                    self_k: Array2::zeros((0, d)),
                    self_v: Array2::zeros((0, d)),
                    cross_k,
                    cross_v,
                }
            })
            .collect();

        Ok(Self {
            step: 0,
            layers,
            src_mask,
        })
    }

    /// 已生成的步数
    pub fn step(&self) -> usize {
        self.step
    }
}

/// 解码一步：输入上一个 token，返回下一 token 的 logits [vocab_size]
pub fn decode_step(
    weights: &ModelWeights,
    state: &mut DecodeState,
    token: u32,
) -> Result<Array1<f32>> {
    let config = &weights.config;
    if state.step >= config.max_target_len {
        return Err(Error::InvalidArgument(format!(
            "decode step {} exceeds max_target_len {}",
            state.step, config.max_target_len
        ))
        .into());
    }

    // embedding * sqrt(d) + 当前位置编码，x: [1, d_model]
    let mut x = weights.embed(&[token])?;
    x += &position_rows(weights, state.step, 1);

    for (layer, kv) in weights.decoder_layers.iter().zip(state.layers.iter_mut()) {
        x = decoder_layer_forward(config.num_heads, layer, kv, x, &state.src_mask)?;
    }

    state.step += 1;
    let logits = weights.logits(x.view());
    Ok(logits.row(0).to_owned())
}

fn decoder_layer_forward(
    num_heads: usize,
    layer: &DecoderLayerWeights,
    kv: &mut LayerKv,
    x: Array2<f32>,
    src_mask: &[bool],
) -> Result<Array2<f32>> {
    // 1. 自注意力：新 token 的 K/V 追加进缓存后对全部前缀做注意力
    let k_new = x.dot(&layer.self_attn.wk);
    let v_new = x.dot(&layer.self_attn.wv);
    kv.self_k
        .push_row(k_new.row(0))
        .map_err(|e| Error::ShapeMismatch(format!("kv append failed: {}", e)))?;
    kv.self_v
        .push_row(v_new.row(0))
        .map_err(|e| Error::ShapeMismatch(format!("kv append failed: {}", e)))?;

    let attn = multi_head_attention(
        &layer.self_attn,
        x.view(),
        kv.self_k.view(),
        kv.self_v.view(),
        num_heads,
        None,
        None, // 缓存只含过去与当前 token，无需额外因果掩码
    )?;
    let x = layer_norm(&(&x + &attn), &layer.norm1.scale, &layer.norm1.bias, LAYER_NORM_EPS);

    // 2. 交叉注意力：对只读的编码端 K/V，源端 padding 掩码生效
    let attn = multi_head_attention(
        &layer.cross_attn,
        x.view(),
        kv.cross_k.view(),
        kv.cross_v.view(),
        num_heads,
        Some(src_mask),
        None,
    )?;
    let x = layer_norm(&(&x + &attn), &layer.norm2.scale, &layer.norm2.bias, LAYER_NORM_EPS);

    // 3. FFN
    let h = relu(&(x.dot(&layer.ffn.w1) + &layer.ffn.b1));
    let ff = h.dot(&layer.ffn.w2) + &layer.ffn.b2;
    Ok(layer_norm(&(&x + &ff), &layer.norm3.scale, &layer.norm3.bias, LAYER_NORM_EPS))
}
