//! Language Table - 支持的语言列表
//!
//! 固定的 12 种语言，代码为 ISO 639-1。请求校验和 /languages 端点共用这张表。

/// (代码, 英文名)
pub const SUPPORTED_LANGUAGES: [(&str, &str); 12] = [
    ("en", "English"),
    ("de", "German"),
    ("fr", "French"),
    ("es", "Spanish"),
    ("it", "Italian"),
    ("pt", "Portuguese"),
    ("ru", "Russian"),
    ("ja", "Japanese"),
    ("ko", "Korean"),
    ("zh", "Chinese"),
    ("ar", "Arabic"),
    ("hi", "Hindi"),
];

/// 语言代码是否在支持列表中
pub fn is_supported(code: &str) -> bool {
    SUPPORTED_LANGUAGES.iter().any(|(c, _)| *c == code)
}

/// 代码 -> 英文名，未知代码返回 None
pub fn language_name(code: &str) -> Option<&'static str> {
    SUPPORTED_LANGUAGES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
}

/// 全部语言代码（/languages 端点和 ModelInfo 使用）
pub fn supported_languages() -> Vec<String> {
    SUPPORTED_LANGUAGES
        .iter()
        .map(|(c, _)| c.to_string())
        .collect()
}
