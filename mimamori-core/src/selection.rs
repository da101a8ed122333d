//! 監視対象スレッドの選択ポリシー

use crate::Result;
use mimamori_target::{ThreadEnumerator, ThreadInfo};
use regex::Regex;
use std::fmt;

/// どのスレッドにウォッチポイントを設定するか
#[derive(Clone)]
pub enum ThreadSelection {
    /// スレッド名の完全一致（例: "GameThread"）
    ByName(String),
    /// スレッド名が正規表現にマッチするもの
    Matching(Regex),
    /// 全スレッド
    All,
}

impl ThreadSelection {
    /// 列挙器から対象スレッドを取得する
    pub fn select(&self, enumerator: &dyn ThreadEnumerator) -> Result<Vec<ThreadInfo>> {
        match self {
            ThreadSelection::ByName(name) => enumerator.list_threads(Some(name)),
            ThreadSelection::Matching(pattern) => Ok(enumerator
                .list_threads(None)?
                .into_iter()
                .filter(|t| pattern.is_match(&t.name))
                .collect()),
            ThreadSelection::All => enumerator.list_threads(None),
        }
    }
}

impl fmt::Debug for ThreadSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadSelection::ByName(name) => write!(f, "ByName({:?})", name),
            ThreadSelection::Matching(pattern) => write!(f, "Matching({:?})", pattern.as_str()),
            ThreadSelection::All => f.write_str("All"),
        }
    }
}

impl fmt::Display for ThreadSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadSelection::ByName(name) => write!(f, "threads named '{}'", name),
            ThreadSelection::Matching(pattern) => write!(f, "threads matching /{}/", pattern.as_str()),
            ThreadSelection::All => f.write_str("all threads"),
        }
    }
}
