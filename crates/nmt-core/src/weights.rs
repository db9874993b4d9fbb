//! Model Weights - 不可变权重集合
//!
//! 加载后只读，通过 Arc 在批次间共享。两条构造路径：
//! - `from_dir`：权重目录（config.json + model.safetensors），mmap 零拷贝读取，
//!   支持 F32 / BF16 存储（BF16 在加载时转为 F32 计算）；
//! - `seeded`：固定种子随机初始化，测试与预热专用。
//!
//! 所有形状在构造时对照 ModelConfig 校验一次，forward 路径不再检查。

use std::fs::File;
use std::path::Path;

use half::bf16;
use memmap2::Mmap;
use ndarray::{s, Array1, Array2, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use safetensors::tensor::Dtype;
use safetensors::SafeTensors;

use crate::attention::AttentionWeights;
use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::ops::sinusoidal_table;

#[derive(Debug, Clone)]
pub struct LayerNormWeights {
    pub scale: Array1<f32>,
    pub bias: Array1<f32>,
}

#[derive(Debug, Clone)]
pub struct FeedForwardWeights {
    pub w1: Array2<f32>, // [d_model, d_ff]
    pub b1: Array1<f32>,
    pub w2: Array2<f32>, // [d_ff, d_model]
    pub b2: Array1<f32>,
}

#[derive(Debug, Clone)]
pub struct EncoderLayerWeights {
    pub self_attn: AttentionWeights,
    pub norm1: LayerNormWeights,
    pub ffn: FeedForwardWeights,
    pub norm2: LayerNormWeights,
}

#[derive(Debug, Clone)]
pub struct DecoderLayerWeights {
    pub self_attn: AttentionWeights,
    pub norm1: LayerNormWeights,
    pub cross_attn: AttentionWeights,
    pub norm2: LayerNormWeights,
    pub ffn: FeedForwardWeights,
    pub norm3: LayerNormWeights,
}

/// 完整权重集合。embedding 与输出投影默认共享（lm_head 缺省时
/// 用 embedding 的转置计算 logits）。
#[derive(Debug, Clone)]
pub struct ModelWeights {
    pub config: ModelConfig,
    pub embedding: Array2<f32>, // [vocab, d_model]
    pub pos_table: Array2<f32>, // [max(max_source_len, max_target_len), d_model]
    pub encoder_layers: Vec<EncoderLayerWeights>,
    pub decoder_layers: Vec<DecoderLayerWeights>,
    pub lm_head: Option<Array2<f32>>, // [d_model, vocab]
}

pub const LAYER_NORM_EPS: f32 = 1e-5;

impl ModelWeights {
    /// 从权重目录加载：config.json + model.safetensors
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let config = ModelConfig::from_json(File::open(dir.join("config.json"))?)?;

        let file = File::open(dir.join("model.safetensors"))?;
        // mmap 只读映射，文件生命周期内不会被修改
        let mmap = unsafe { Mmap::map(&file)? };
        let st = SafeTensors::deserialize(&mmap)
            .map_err(|e| Error::WeightFile(format!("safetensors parse failed: {}", e)))?;

        Self::from_safetensors(config, &st)
    }

    fn from_safetensors(config: ModelConfig, st: &SafeTensors) -> Result<Self> {
        let d = config.d_model;
        let d_ff = config.d_ff;
        let vocab = config.vocab_size;

        let embedding = tensor_2d(st, "shared.weight", (vocab, d))?;

        let attn = |prefix: &str| -> Result<AttentionWeights> {
            Ok(AttentionWeights {
                wq: tensor_2d(st, &format!("{}.q.weight", prefix), (d, d))?,
                wk: tensor_2d(st, &format!("{}.k.weight", prefix), (d, d))?,
                wv: tensor_2d(st, &format!("{}.v.weight", prefix), (d, d))?,
                wo: tensor_2d(st, &format!("{}.o.weight", prefix), (d, d))?,
            })
        };
        let norm = |prefix: &str| -> Result<LayerNormWeights> {
            Ok(LayerNormWeights {
                scale: tensor_1d(st, &format!("{}.weight", prefix), d)?,
                bias: tensor_1d(st, &format!("{}.bias", prefix), d)?,
            })
        };
        let ffn = |prefix: &str| -> Result<FeedForwardWeights> {
            Ok(FeedForwardWeights {
                w1: tensor_2d(st, &format!("{}.w1.weight", prefix), (d, d_ff))?,
                b1: tensor_1d(st, &format!("{}.w1.bias", prefix), d_ff)?,
                w2: tensor_2d(st, &format!("{}.w2.weight", prefix), (d_ff, d))?,
                b2: tensor_1d(st, &format!("{}.w2.bias", prefix), d)?,
            })
        };

        let mut encoder_layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            let p = format!("encoder.layers.{}", i);
            encoder_layers.push(EncoderLayerWeights {
                self_attn: attn(&format!("{}.self_attn", p))?,
                norm1: norm(&format!("{}.norm1", p))?,
                ffn: ffn(&format!("{}.ffn", p))?,
                norm2: norm(&format!("{}.norm2", p))?,
            });
        }

        let mut decoder_layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            let p = format!("decoder.layers.{}", i);
            decoder_layers.push(DecoderLayerWeights {
                self_attn: attn(&format!("{}.self_attn", p))?,
                norm1: norm(&format!("{}.norm1", p))?,
                cross_attn: attn(&format!("{}.cross_attn", p))?,
                norm2: norm(&format!("{}.norm2", p))?,
                ffn: ffn(&format!("{}.ffn", p))?,
                norm3: norm(&format!("{}.norm3", p))?,
            });
        }

        // lm_head 可选，缺省时与 embedding 共享
        let lm_head = match st.tensor("lm_head.weight") {
            Ok(_) => Some(tensor_2d(st, "lm_head.weight", (d, vocab))?),
            Err(_) => None,
        };

        let max_len = config.max_source_len.max(config.max_target_len);
        let pos_table = sinusoidal_table(max_len, d);

        Ok(Self {
            config,
            embedding,
            pos_table,
            encoder_layers,
            decoder_layers,
            lm_head,
        })
    }

    /// 固定种子随机初始化，不读任何文件；相同 (config, seed) 产生
    /// 完全相同的权重
    pub fn seeded(config: ModelConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let d = config.d_model;
        let d_ff = config.d_ff;

        let embedding = rand_mat(&mut rng, config.vocab_size, d);

        let attn = |rng: &mut StdRng| AttentionWeights {
            wq: rand_mat(rng, d, d),
            wk: rand_mat(rng, d, d),
            wv: rand_mat(rng, d, d),
            wo: rand_mat(rng, d, d),
        };
        let norm = || LayerNormWeights {
            scale: Array1::ones(d),
            bias: Array1::zeros(d),
        };
        let ffn = |rng: &mut StdRng| FeedForwardWeights {
            w1: rand_mat(rng, d, d_ff),
            b1: Array1::zeros(d_ff),
            w2: rand_mat(rng, d_ff, d),
            b2: Array1::zeros(d),
        };

        let encoder_layers = (0..config.num_layers)
            .map(|_| EncoderLayerWeights {
                self_attn: attn(&mut rng),
                norm1: norm(),
                ffn: ffn(&mut rng),
                norm2: norm(),
            })
            .collect();
        let decoder_layers = (0..config.num_layers)
            .map(|_| DecoderLayerWeights {
                self_attn: attn(&mut rng),
                norm1: norm(),
                cross_attn: attn(&mut rng),
                norm2: norm(),
                ffn: ffn(&mut rng),
                norm3: norm(),
            })
            .collect();

        let max_len = config.max_source_len.max(config.max_target_len);
        let pos_table = sinusoidal_table(max_len, d);

        Self {
            config,
            embedding,
            pos_table,
            encoder_layers,
            decoder_layers,
            lm_head: None,
        }
    }

    /// token 序列 -> 缩放后的 embedding [len, d_model]（不含位置编码）
    pub fn embed(&self, ids: &[u32]) -> Result<Array2<f32>> {
        let d = self.config.d_model;
        let scale = (d as f32).sqrt();
        let mut out = Array2::zeros((ids.len(), d));
        for (i, &id) in ids.iter().enumerate() {
            if id as usize >= self.config.vocab_size {
                return Err(Error::InvalidArgument(format!(
                    "token id {} out of vocab range {}",
                    id, self.config.vocab_size
                ))
                .into());
            }
            let row = self.embedding.row(id as usize);
            out.row_mut(i).assign(&row.mapv(|v| v * scale));
        }
        Ok(out)
    }

    /// 隐状态 -> logits [rows, vocab]；lm_head 缺省时与 embedding 共享权重
    pub fn logits(&self, hidden: ArrayView2<f32>) -> Array2<f32> {
        match &self.lm_head {
            Some(w) => hidden.dot(w),
            None => hidden.dot(&self.embedding.t()),
        }
    }
}

fn rand_mat(rng: &mut StdRng, rows: usize, cols: usize) -> Array2<f32> {
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-0.1f32..0.1))
}

/// 按名称取 2D 张量并校验形状；支持 F32/BF16 存储
fn tensor_2d(st: &SafeTensors, name: &str, shape: (usize, usize)) -> Result<Array2<f32>> {
    let view = st
        .tensor(name)
        .map_err(|_| Error::MissingTensor(name.to_string()))?;
    if view.shape() != [shape.0, shape.1] {
        return Err(Error::ShapeMismatch(format!(
            "{}: expected [{}, {}], got {:?}",
            name, shape.0, shape.1, view.shape()
        ))
        .into());
    }
    let data = to_f32_vec(view.dtype(), view.data(), name)?;
    Array2::from_shape_vec(shape, data)
        .map_err(|e| Error::ShapeMismatch(format!("{}: {}", name, e)).into())
}

fn tensor_1d(st: &SafeTensors, name: &str, len: usize) -> Result<Array1<f32>> {
    let view = st
        .tensor(name)
        .map_err(|_| Error::MissingTensor(name.to_string()))?;
    if view.shape() != [len] {
        return Err(Error::ShapeMismatch(format!(
            "{}: expected [{}], got {:?}",
            name, len, view.shape()
        ))
        .into());
    }
    let data = to_f32_vec(view.dtype(), view.data(), name)?;
    Ok(Array1::from_vec(data))
}

fn to_f32_vec(dtype: Dtype, raw: &[u8], name: &str) -> Result<Vec<f32>> {
    match dtype {
        Dtype::F32 => Ok(raw
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()),
        // BF16 存储，加载时转 F32 计算
        Dtype::BF16 => Ok(raw
            .chunks_exact(2)
            .map(|b| bf16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect()),
        other => Err(Error::WeightFile(format!(
            "{}: unsupported dtype {:?} (expected F32 or BF16)",
            name, other
        ))
        .into()),
    }
}

/// 位置编码行视图（encoder/decoder 共用）
pub fn position_rows(weights: &ModelWeights, start: usize, len: usize) -> ArrayView2<'_, f32> {
    weights.pos_table.slice(s![start..start + len, ..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_is_deterministic() {
        let c = ModelConfig::tiny();
        let a = ModelWeights::seeded(c.clone(), 11);
        let b = ModelWeights::seeded(c, 11);
        assert_eq!(a.embedding, b.embedding);
        assert_eq!(
            a.encoder_layers[0].self_attn.wq,
            b.encoder_layers[0].self_attn.wq
        );
    }

    #[test]
    fn test_seeded_shapes() {
        let c = ModelConfig::tiny();
        let w = ModelWeights::seeded(c.clone(), 1);
        assert_eq!(w.embedding.dim(), (c.vocab_size, c.d_model));
        assert_eq!(w.encoder_layers.len(), c.num_layers);
        assert_eq!(w.decoder_layers.len(), c.num_layers);
        assert_eq!(w.pos_table.nrows(), c.max_source_len.max(c.max_target_len));
    }

    #[test]
    fn test_embed_scales_and_checks_range() {
        let c = ModelConfig::tiny();
        let w = ModelWeights::seeded(c.clone(), 2);
        let e = w.embed(&[0, 1, 2]).unwrap();
        assert_eq!(e.dim(), (3, c.d_model));
        let scale = (c.d_model as f32).sqrt();
        assert!((e[[0, 0]] - w.embedding[[0, 0]] * scale).abs() < 1e-6);

        assert!(w.embed(&[c.vocab_size as u32]).is_err());
    }

    fn bytes2(a: &Array2<f32>) -> (Vec<usize>, Vec<u8>) {
        (
            vec![a.nrows(), a.ncols()],
            a.iter().flat_map(|v| v.to_le_bytes()).collect(),
        )
    }

    fn bytes1(a: &Array1<f32>) -> (Vec<usize>, Vec<u8>) {
        (vec![a.len()], a.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    type RawTensors = Vec<(String, (Vec<usize>, Vec<u8>))>;

    fn push_attn(raw: &mut RawTensors, prefix: &str, a: &AttentionWeights) {
        raw.push((format!("{}.q.weight", prefix), bytes2(&a.wq)));
        raw.push((format!("{}.k.weight", prefix), bytes2(&a.wk)));
        raw.push((format!("{}.v.weight", prefix), bytes2(&a.wv)));
        raw.push((format!("{}.o.weight", prefix), bytes2(&a.wo)));
    }

    fn push_norm(raw: &mut RawTensors, prefix: &str, n: &LayerNormWeights) {
        raw.push((format!("{}.weight", prefix), bytes1(&n.scale)));
        raw.push((format!("{}.bias", prefix), bytes1(&n.bias)));
    }

    fn push_ffn(raw: &mut RawTensors, prefix: &str, f: &FeedForwardWeights) {
        raw.push((format!("{}.w1.weight", prefix), bytes2(&f.w1)));
        raw.push((format!("{}.w1.bias", prefix), bytes1(&f.b1)));
        raw.push((format!("{}.w2.weight", prefix), bytes2(&f.w2)));
        raw.push((format!("{}.w2.bias", prefix), bytes1(&f.b2)));
    }

    #[test]
    fn test_dir_save_load_round_trip() {
        use safetensors::tensor::TensorView;

        let config = ModelConfig::tiny();
        let w = ModelWeights::seeded(config.clone(), 5);

        let mut raw: RawTensors = vec![("shared.weight".to_string(), bytes2(&w.embedding))];
        for (i, layer) in w.encoder_layers.iter().enumerate() {
            let p = format!("encoder.layers.{}", i);
            push_attn(&mut raw, &format!("{}.self_attn", p), &layer.self_attn);
            push_norm(&mut raw, &format!("{}.norm1", p), &layer.norm1);
            push_ffn(&mut raw, &format!("{}.ffn", p), &layer.ffn);
            push_norm(&mut raw, &format!("{}.norm2", p), &layer.norm2);
        }
        for (i, layer) in w.decoder_layers.iter().enumerate() {
            let p = format!("decoder.layers.{}", i);
            push_attn(&mut raw, &format!("{}.self_attn", p), &layer.self_attn);
            push_norm(&mut raw, &format!("{}.norm1", p), &layer.norm1);
            push_attn(&mut raw, &format!("{}.cross_attn", p), &layer.cross_attn);
            push_norm(&mut raw, &format!("{}.norm2", p), &layer.norm2);
            push_ffn(&mut raw, &format!("{}.ffn", p), &layer.ffn);
            push_norm(&mut raw, &format!("{}.norm3", p), &layer.norm3);
        }

        let views: Vec<(String, TensorView)> = raw
            .iter()
            .map(|(name, (shape, bytes))| {
                (
                    name.clone(),
                    TensorView::new(Dtype::F32, shape.clone(), bytes).unwrap(),
                )
            })
            .collect();
        let blob = safetensors::serialize(views, &None).unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.safetensors"), blob).unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            serde_json::to_string(&config).unwrap(),
        )
        .unwrap();

        let loaded = ModelWeights::from_dir(dir.path()).unwrap();
        assert_eq!(loaded.embedding, w.embedding);
        assert_eq!(
            loaded.encoder_layers[0].self_attn.wq,
            w.encoder_layers[0].self_attn.wq
        );
        assert_eq!(
            loaded.decoder_layers[1].cross_attn.wv,
            w.decoder_layers[1].cross_attn.wv
        );
        assert_eq!(loaded.decoder_layers[0].ffn.b1, w.decoder_layers[0].ffn.b1);
        assert!(loaded.lm_head.is_none());
    }

    #[test]
    fn test_logits_tied_to_embedding() {
        let c = ModelConfig::tiny();
        let w = ModelWeights::seeded(c.clone(), 3);
        let h = Array2::ones((1, c.d_model));
        let logits = w.logits(h.view());
        assert_eq!(logits.dim(), (1, c.vocab_size));
        // 共享权重：logits[v] = sum(embedding[v])
        let expect: f32 = w.embedding.row(5).sum();
        assert!((logits[[0, 5]] - expect).abs() < 1e-4);
    }
}
