//! Model Configuration - 模型配置与形状契约
//!
//! 所有形状约束在构造时检查一次，之后各层 forward 假定形状合法。

use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// 运行时模型配置。从权重目录的 config.json 读取，或用 `Default` 构造
/// 紧凑的 seq2seq 档位（d_model 512 / 8 头 / 6 层）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub d_model: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub d_ff: usize,

    /// 源序列最大长度（编码端，含任务前缀）
    #[serde(default = "default_max_len")]
    pub max_source_len: usize,

    /// 目标序列最大长度（位置表的行数上限）
    #[serde(default = "default_max_len")]
    pub max_target_len: usize,

    // 特殊 token
    pub pad_id: u32,
    pub bos_id: u32,
    pub eos_id: u32,
}

fn default_max_len() -> usize {
    128
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 32000,
            d_model: 512,
            num_heads: 8,
            num_layers: 6,
            d_ff: 2048,
            max_source_len: 128,
            max_target_len: 128,
            pad_id: 0,
            bos_id: 1,
            eos_id: 2,
        }
    }
}

impl ModelConfig {
    /// 从 config.json 读取并校验
    pub fn from_json<R: Read>(mut reader: R) -> Result<Self> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let config: ModelConfig = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// 参数有效性检查，失败的配置不允许进入任何 forward 路径
    pub fn validate(&self) -> Result<()> {
        if self.d_model == 0 || self.num_heads == 0 || self.num_layers == 0 || self.d_ff == 0 {
            return Err(Error::InvalidArgument(
                "model dimensions must be nonzero".to_string(),
            )
            .into());
        }
        if self.d_model % self.num_heads != 0 {
            return Err(Error::InvalidArgument(format!(
                "d_model ({}) must be divisible by num_heads ({})",
                self.d_model, self.num_heads
            ))
            .into());
        }
        if self.vocab_size == 0 {
            return Err(Error::InvalidArgument("vocab_size must be nonzero".to_string()).into());
        }
        if self.max_source_len == 0 || self.max_target_len == 0 {
            return Err(
                Error::InvalidArgument("sequence length limits must be nonzero".to_string()).into(),
            );
        }
        for (name, id) in [
            ("pad_id", self.pad_id),
            ("bos_id", self.bos_id),
            ("eos_id", self.eos_id),
        ] {
            if id as usize >= self.vocab_size {
                return Err(Error::InvalidArgument(format!(
                    "{} ({}) out of vocab range ({})",
                    name, id, self.vocab_size
                ))
                .into());
            }
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.d_model / self.num_heads
    }

    /// 测试与 seeded 初始化常用的小档位
    pub fn tiny() -> Self {
        Self {
            vocab_size: 32,
            d_model: 16,
            num_heads: 4,
            num_layers: 2,
            d_ff: 32,
            max_source_len: 32,
            max_target_len: 32,
            pad_id: 0,
            bos_id: 1,
            eos_id: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(ModelConfig::default().validate().is_ok());
        assert!(ModelConfig::tiny().validate().is_ok());
        assert_eq!(ModelConfig::default().head_dim(), 64);
    }

    #[test]
    fn test_invalid_head_split_rejected() {
        let mut c = ModelConfig::default();
        c.num_heads = 7;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_special_token_out_of_vocab_rejected() {
        let mut c = ModelConfig::tiny();
        c.eos_id = c.vocab_size as u32;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "vocab_size": 64, "d_model": 32, "num_heads": 4, "num_layers": 2,
            "d_ff": 64, "pad_id": 0, "bos_id": 1, "eos_id": 2
        }"#;
        let c = ModelConfig::from_json(json.as_bytes()).unwrap();
        assert_eq!(c.vocab_size, 64);
        // 缺省字段落到默认长度
        assert_eq!(c.max_source_len, 128);
    }
}
