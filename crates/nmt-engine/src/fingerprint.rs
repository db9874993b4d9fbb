//! Cache Fingerprint - 请求指纹
//!
//! 同一进程内确定性的 u64 指纹，覆盖所有影响翻译结果的字段。
//! 文本只做首尾去空白，保留大小写（大小写会改变翻译结果）。

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use nmt_protocol::TranslationRequest;

pub fn fingerprint(req: &TranslationRequest) -> u64 {
    // DefaultHasher::new() 使用固定密钥，进程内结果稳定
    let mut h = DefaultHasher::new();
    req.text.trim().hash(&mut h);
    req.source_language.hash(&mut h);
    req.target_language.hash(&mut h);
    req.max_length.hash(&mut h);
    req.beam_size.hash(&mut h);
    // f32 无 Hash，按位模式参与
    req.temperature.to_bits().hash(&mut h);
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(text: &str) -> TranslationRequest {
        TranslationRequest::new(text, "en", "de")
    }

    #[test]
    fn test_trim_insensitive_case_sensitive() {
        assert_eq!(fingerprint(&req("hello")), fingerprint(&req("  hello  ")));
        assert_ne!(fingerprint(&req("hello")), fingerprint(&req("Hello")));
    }

    #[test]
    fn test_params_change_fingerprint() {
        let a = req("hello");
        let mut b = req("hello");
        b.target_language = "fr".to_string();
        assert_ne!(fingerprint(&a), fingerprint(&b));

        let mut c = req("hello");
        c.beam_size = 4;
        assert_ne!(fingerprint(&a), fingerprint(&c));

        let mut d = req("hello");
        d.max_length = 10;
        assert_ne!(fingerprint(&a), fingerprint(&d));

        let mut e = req("hello");
        e.temperature = 2.0;
        assert_ne!(fingerprint(&a), fingerprint(&e));
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let a = req("the quick brown fox");
        assert_eq!(fingerprint(&a), fingerprint(&a.clone()));
    }
}
