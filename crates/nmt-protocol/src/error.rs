//! Error Taxonomy - 翻译服务错误分类
//!
//! 四类顶层错误，各自有固定的 HTTP 映射（由 server 层完成）：
//! Validation -> 400, ModelNotLoaded -> 503, Timeout -> 504, Compute -> 500。
//! 截断（TRUNCATED）不是错误，由响应里的 `truncated` 标志表达。

use thiserror::Error;

/// 请求校验失败，同步返回，永远不会进入计算路径
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("text is empty")]
    EmptyText,

    #[error("text too long: {chars} chars (limit {limit})")]
    TextTooLong { chars: usize, limit: usize },

    #[error("unsupported language: {0}")]
    UnknownLanguage(String),

    #[error("max_length out of range: {got} (must be 1..={limit})")]
    MaxLengthOutOfRange { got: usize, limit: usize },

    #[error("beam_size out of range: {got} (must be 1..={limit})")]
    BeamSizeOutOfRange { got: usize, limit: usize },

    #[error("temperature out of range: {0} (must be in (0, 4])")]
    TemperatureOutOfRange(f32),
}

/// 翻译路径上所有可能失败的分类
#[derive(Debug, Clone, Error)]
pub enum TranslateError {
    /// 请求参数非法
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// 前向计算失败（形状不匹配、权重缺失等），单请求级别
    #[error("compute failed: {0}")]
    Compute(String),

    /// 等待端超时；共享的计算本身继续进行
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    /// 尚未加载任何权重
    #[error("no model loaded")]
    ModelNotLoaded,
}

impl TranslateError {
    /// 是否属于调用方可修正的错误（而非服务端状态问题）
    pub fn is_client_error(&self) -> bool {
        matches!(self, TranslateError::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = TranslateError::Validation(ValidationError::EmptyText);
        assert_eq!(e.to_string(), "validation failed: text is empty");
        assert!(e.is_client_error());

        let e = TranslateError::Timeout(500);
        assert_eq!(e.to_string(), "request timed out after 500 ms");
        assert!(!e.is_client_error());
    }
}
