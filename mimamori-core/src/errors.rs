//! 設定エラー

use thiserror::Error;

/// 設定の組み立てに失敗した理由
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("--thread-name and --thread-pattern are mutually exclusive")]
    ConflictingSelection,
    #[error("invalid thread pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("watch size must be greater than zero")]
    ZeroSize,
}
