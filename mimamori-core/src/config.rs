//! ウォッチセッションの設定

use crate::errors::ConfigError;
use crate::selection::ThreadSelection;
use mimamori_target::AccessKind;
use regex::Regex;

/// 1回のウォッチセッションの設定
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// 対象プロセス
    pub pid: i32,
    pub address: u64,
    pub size: usize,
    pub access: AccessKind,
    pub selection: ThreadSelection,
}

impl WatchConfig {
    /// 設定を組み立てる
    ///
    /// `thread_name` と `thread_pattern` はどちらか一方のみ指定できます。
    /// どちらも無ければ全スレッドが対象です。
    pub fn new(
        pid: i32,
        address: u64,
        size: usize,
        access: AccessKind,
        thread_name: Option<String>,
        thread_pattern: Option<String>,
    ) -> Result<Self, ConfigError> {
        if size == 0 {
            return Err(ConfigError::ZeroSize);
        }

        let selection = selection_from(thread_name, thread_pattern)?;

        Ok(Self {
            pid,
            address,
            size,
            access,
            selection,
        })
    }
}

/// CLIのフィルタ指定から選択ポリシーを作る
pub fn selection_from(
    thread_name: Option<String>,
    thread_pattern: Option<String>,
) -> Result<ThreadSelection, ConfigError> {
    match (thread_name, thread_pattern) {
        (Some(_), Some(_)) => Err(ConfigError::ConflictingSelection),
        (Some(name), None) => Ok(ThreadSelection::ByName(name)),
        (None, Some(pattern)) => Regex::new(&pattern)
            .map(ThreadSelection::Matching)
            .map_err(|source| ConfigError::InvalidPattern { pattern, source }),
        (None, None) => Ok(ThreadSelection::All),
    }
}
