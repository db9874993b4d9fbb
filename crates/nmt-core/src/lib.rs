//! NMT Core - 翻译模型核心
//!
//! 纯计算层：模型配置、权重集合、张量算子、多头注意力、编码器/解码器栈
//! 以及解码控制器。这一层不涉及任何 IO 以外的副作用（权重加载除外），
//! 所有计算都是确定性的：相同的权重与输入必然产生相同的输出。

pub mod attention;
pub mod config;
pub mod controller;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod ops;
pub mod weights;

pub use config::ModelConfig;
pub use controller::{DecodeController, DecodeOutcome, DecodeParams, DecodePhase};
pub use decoder::DecodeState;
pub use encoder::EncodedBatch;
pub use error::{Error, Result};
pub use weights::ModelWeights;
