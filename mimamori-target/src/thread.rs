//! スレッド管理機能

use crate::Result;
use std::fs;
use std::io;
use std::path::PathBuf;

/// スレッドID
pub type ThreadId = i32;

/// 列挙されたスレッドの情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub tid: ThreadId,
    /// スレッド名（表示用のみ）
    pub name: String,
}

impl ThreadInfo {
    /// スレッド情報を作成する
    pub fn new(tid: ThreadId, name: impl Into<String>) -> Self {
        Self {
            tid,
            name: name.into(),
        }
    }
}

/// プロセス内のスレッドを列挙する
pub trait ThreadEnumerator: Send + Sync {
    /// スレッドを列挙する
    ///
    /// `filter` が指定された場合、名前が完全一致するスレッドのみを返します。
    fn list_threads(&self, filter: Option<&str>) -> Result<Vec<ThreadInfo>>;
}

/// /proc/<pid>/task を読んでスレッドを列挙する
#[derive(Debug, Clone)]
pub struct ProcThreadEnumerator {
    pid: i32,
}

impl ProcThreadEnumerator {
    pub fn new(pid: i32) -> Self {
        Self { pid }
    }

    fn task_dir(&self) -> PathBuf {
        PathBuf::from(format!("/proc/{}/task", self.pid))
    }
}

impl ThreadEnumerator for ProcThreadEnumerator {
    fn list_threads(&self, filter: Option<&str>) -> Result<Vec<ThreadInfo>> {
        let task_dir = self.task_dir();
        let entries = fs::read_dir(&task_dir)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", task_dir.display(), e))?;

        let mut threads = Vec::new();
        for entry in entries {
            let entry = entry?;
            let tid = match entry.file_name().to_str().and_then(|s| s.parse::<ThreadId>().ok()) {
                Some(tid) => tid,
                None => continue,
            };

            // 読み取り中に終了したスレッドは無視する
            let name = match fs::read_to_string(entry.path().join("comm")) {
                Ok(comm) => comm.trim_end_matches('\n').to_string(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            if filter.map_or(true, |f| f == name) {
                threads.push(ThreadInfo { tid, name });
            }
        }

        threads.sort_by_key(|t| t.tid);
        Ok(threads)
    }
}
