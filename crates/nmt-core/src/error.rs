pub use anyhow::Result;
// 使用 thiserror 定义叶子错误类型，跨层组合交给 anyhow
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Missing tensor: {0}")]
    MissingTensor(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization/Deserialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("Weight file error: {0}")]
    WeightFile(String),
}
