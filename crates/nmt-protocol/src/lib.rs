//! Protocol types - 翻译服务的共享协议类型
//!
//! Server 和 Engine 之间传递的请求/响应 DTO、语言表以及错误分类。
//! 这一层刻意保持轻量：只有 serde 类型和校验逻辑，不依赖张量栈。

use serde::{Deserialize, Serialize};

pub mod error;
pub mod language;

pub use error::{TranslateError, ValidationError};
pub use language::{language_name, supported_languages, is_supported};

/// 请求参数的硬上限，超出即 ValidationError
pub const MAX_TEXT_CHARS: usize = 4096;
pub const MAX_OUTPUT_TOKENS: usize = 256;
pub const MAX_BEAM_SIZE: usize = 16;
pub const MAX_TEMPERATURE: f32 = 4.0;

/// Server -> Engine 的翻译请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationRequest {
    /// 源文本
    pub text: String,

    /// 源语言代码 (ISO 639-1)
    #[serde(default = "default_source")]
    pub source_language: String,

    /// 目标语言代码
    #[serde(default = "default_target")]
    pub target_language: String,

    /// 最大生成 token 数
    #[serde(default = "default_max_length")]
    pub max_length: usize,

    /// 温度参数，仅影响置信度数值，不改变贪心/束搜索的选择
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// 束宽，1 = 贪心解码
    #[serde(default = "default_beam_size")]
    pub beam_size: usize,
}

fn default_source() -> String {
    "en".to_string()
}
fn default_target() -> String {
    "de".to_string()
}
fn default_max_length() -> usize {
    50
}
fn default_temperature() -> f32 {
    1.0
}
fn default_beam_size() -> usize {
    1
}

impl TranslationRequest {
    /// 便捷构造：其余参数取 API 默认值
    pub fn new(text: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source_language: source.into(),
            target_language: target.into(),
            max_length: default_max_length(),
            temperature: default_temperature(),
            beam_size: default_beam_size(),
        }
    }

    /// 同步校验，任何计算开始之前执行；失败的请求永远不会进入调度队列
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.text.trim().is_empty() {
            return Err(ValidationError::EmptyText);
        }
        if self.text.chars().count() > MAX_TEXT_CHARS {
            return Err(ValidationError::TextTooLong {
                chars: self.text.chars().count(),
                limit: MAX_TEXT_CHARS,
            });
        }
        if !is_supported(&self.source_language) {
            return Err(ValidationError::UnknownLanguage(self.source_language.clone()));
        }
        if !is_supported(&self.target_language) {
            return Err(ValidationError::UnknownLanguage(self.target_language.clone()));
        }
        if self.max_length == 0 || self.max_length > MAX_OUTPUT_TOKENS {
            return Err(ValidationError::MaxLengthOutOfRange {
                got: self.max_length,
                limit: MAX_OUTPUT_TOKENS,
            });
        }
        if self.beam_size == 0 || self.beam_size > MAX_BEAM_SIZE {
            return Err(ValidationError::BeamSizeOutOfRange {
                got: self.beam_size,
                limit: MAX_BEAM_SIZE,
            });
        }
        if !self.temperature.is_finite() || self.temperature <= 0.0 || self.temperature > MAX_TEMPERATURE {
            return Err(ValidationError::TemperatureOutOfRange(self.temperature));
        }
        Ok(())
    }
}

/// Engine -> Server 的翻译响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationResponse {
    /// 翻译结果文本
    pub translated_text: String,

    /// 源语言代码（回显）
    pub source_language: String,

    /// 目标语言代码（回显）
    pub target_language: String,

    /// 端到端处理耗时（秒），缓存命中时接近 0
    pub processing_time: f64,

    /// 置信度 = exp(平均 token 对数概率)，范围 (0, 1]
    pub confidence: f32,

    /// 解码在输出 EOS 之前达到 max_length（成功，非错误）
    pub truncated: bool,
}

/// 模型信息（只读查询，不改变核心状态）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// 支持的语言代码列表
    pub languages_supported: Vec<String>,

    /// 是否已加载权重
    pub is_loaded: bool,

    /// 权重版本号，每次 reload 递增
    pub version: u64,

    /// 最近一次加载时间
    pub last_updated: Option<chrono::DateTime<chrono::Utc>>,
}

/// 健康探针返回值
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub model_loaded: bool,
    pub cache_entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_request() -> TranslationRequest {
        TranslationRequest::new("Hello world", "en", "de")
    }

    #[test]
    fn test_valid_request_passes() {
        assert!(valid_request().validate().is_ok());
    }

    #[test]
    fn test_empty_text_rejected() {
        let mut req = valid_request();
        req.text = "   ".to_string();
        assert!(matches!(req.validate(), Err(ValidationError::EmptyText)));
    }

    #[test]
    fn test_unknown_language_rejected() {
        let mut req = valid_request();
        req.target_language = "xx".to_string();
        assert!(matches!(
            req.validate(),
            Err(ValidationError::UnknownLanguage(_))
        ));
    }

    #[test]
    fn test_out_of_range_params_rejected() {
        let mut req = valid_request();
        req.max_length = 0;
        assert!(req.validate().is_err());

        let mut req = valid_request();
        req.max_length = MAX_OUTPUT_TOKENS + 1;
        assert!(req.validate().is_err());

        let mut req = valid_request();
        req.beam_size = MAX_BEAM_SIZE + 1;
        assert!(req.validate().is_err());

        let mut req = valid_request();
        req.temperature = 0.0;
        assert!(req.validate().is_err());

        let mut req = valid_request();
        req.temperature = f32::NAN;
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_request_defaults_from_json() {
        // 只给 text，其余字段应落到 API 默认值
        let req: TranslationRequest = serde_json::from_str(r#"{"text": "hello"}"#).unwrap();
        assert_eq!(req.source_language, "en");
        assert_eq!(req.target_language, "de");
        assert_eq!(req.max_length, 50);
        assert_eq!(req.beam_size, 1);
        assert!((req.temperature - 1.0).abs() < f32::EPSILON);
    }
}
