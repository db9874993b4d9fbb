use std::path::PathBuf;
use std::sync::Arc;

use nmt_engine::TranslationEngine;

/// 各 handler 共享的应用状态
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<TranslationEngine>,
    /// 启动时的模型目录；/model/reload 不带 body 时回落到这里
    pub model_dir: Option<PathBuf>,
}
