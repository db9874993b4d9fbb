//! Text Pipeline - 分词管线
//!
//! 编码前拼接任务前缀（"translate English to German: ..." 风格），
//! 之后交给分词器。两种后端：
//! - Hf：HuggingFace tokenizers，生产路径；
//! - WordLevel：无文件依赖的按词哈希映射，演示/预热/测试路径
//!   （确定性，但 decode 产出的是占位词而非自然语言）。

use std::path::Path;

use anyhow::{anyhow, Context};
use tokenizers::Tokenizer;

use nmt_core::ModelConfig;
use nmt_protocol::{language_name, TranslateError};

pub enum TextPipeline {
    Hf(Box<Tokenizer>),
    WordLevel,
}

impl TextPipeline {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| anyhow!("tokenizer load failed: {}", e))
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(Self::Hf(Box::new(tokenizer)))
    }

    pub fn word_level() -> Self {
        Self::WordLevel
    }

    /// 任务前缀 + 源文本。语言代码在协议层已经校验过，
    /// 这里对未知代码仅作兜底回退到原始代码。
    pub fn format_source(source: &str, target: &str, text: &str) -> String {
        let src = language_name(source).unwrap_or(source);
        let tgt = language_name(target).unwrap_or(target);
        format!("translate {} to {}: {}", src, tgt, text.trim())
    }

    /// 源文本 -> token 序列（含任务前缀，截断到 max_source_len，EOS 结尾）
    pub fn encode_source(
        &self,
        config: &ModelConfig,
        source: &str,
        target: &str,
        text: &str,
    ) -> Result<Vec<u32>, TranslateError> {
        let prefixed = Self::format_source(source, target, text);
        let mut ids = match self {
            Self::Hf(tokenizer) => {
                let encoding = tokenizer
                    .encode(prefixed.as_str(), false)
                    .map_err(|e| TranslateError::Compute(format!("tokenize failed: {}", e)))?;
                encoding.get_ids().to_vec()
            }
            Self::WordLevel => prefixed
                .split_whitespace()
                .map(|w| word_id(w, config.vocab_size))
                .collect(),
        };

        for &id in &ids {
            if id as usize >= config.vocab_size {
                return Err(TranslateError::Compute(format!(
                    "tokenizer produced id {} outside vocab {}",
                    id, config.vocab_size
                )));
            }
        }

        // 留出 EOS 的位置
        ids.truncate(config.max_source_len.saturating_sub(1));
        ids.push(config.eos_id);
        Ok(ids)
    }

    /// token 序列 -> 文本
    pub fn decode(&self, ids: &[u32]) -> String {
        match self {
            Self::Hf(tokenizer) => tokenizer.decode(ids, true).unwrap_or_default(),
            Self::WordLevel => ids
                .iter()
                .map(|id| format!("w{}", id))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// 词 -> 固定哈希 id，避开特殊 token 区间 [0, 4)
fn word_id(word: &str, vocab_size: usize) -> u32 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut h = DefaultHasher::new();
    word.hash(&mut h);
    let span = (vocab_size.max(5) - 4) as u64;
    (4 + (h.finish() % span)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_prefix() {
        assert_eq!(
            TextPipeline::format_source("en", "de", " Hello world "),
            "translate English to German: Hello world"
        );
    }

    #[test]
    fn test_word_level_encode_deterministic() {
        let p = TextPipeline::word_level();
        let c = ModelConfig::tiny();
        let a = p.encode_source(&c, "en", "de", "hello world").unwrap();
        let b = p.encode_source(&c, "en", "de", "hello world").unwrap();
        assert_eq!(a, b);
        assert_eq!(*a.last().unwrap(), c.eos_id);
        assert!(a.iter().all(|&id| (id as usize) < c.vocab_size));
    }

    #[test]
    fn test_source_truncated_to_limit() {
        let p = TextPipeline::word_level();
        let c = ModelConfig::tiny();
        let long = "word ".repeat(c.max_source_len * 2);
        let ids = p.encode_source(&c, "en", "de", &long).unwrap();
        assert!(ids.len() <= c.max_source_len);
        assert_eq!(*ids.last().unwrap(), c.eos_id);
    }

    #[test]
    fn test_different_language_pair_changes_ids() {
        // 任务前缀参与编码，语言对不同则 token 序列不同
        let p = TextPipeline::word_level();
        let c = ModelConfig::tiny();
        let de = p.encode_source(&c, "en", "de", "hello").unwrap();
        let fr = p.encode_source(&c, "en", "fr", "hello").unwrap();
        assert_ne!(de, fr);
    }
}
