//! 再設定ワーカー
//!
//! トラップハンドラの中でウォッチポイントを再設定するのは危険なため、
//! 専用スレッドで条件変数を待ち、再設定要求が立ったときだけスイープを行います。
//!
//! ptraceのようにトレーサースレッドからしかレジスタを触れないホストでは
//! このワーカーは使わず、イベントループから [`WatchpointManager::sweep`] を呼びます。

use crate::manager::{Shared, WatchpointManager};
use crate::Result;
use std::sync::{Arc, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::debug;

/// 再設定ワーカー
pub struct RearmWorker {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl RearmWorker {
    /// ワーカースレッドを起動する
    pub fn spawn(manager: &WatchpointManager) -> Result<Self> {
        let shared = manager.shared().clone();
        shared.lock_state().worker_stop = false;

        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name("mimamori-rearm".to_string())
            .spawn(move || run(&worker))?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// ワーカーを停止して終了を待つ
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.shared.lock_state().worker_stop = true;
            self.shared.condvar().notify_all();
            if handle.join().is_err() {
                debug!("re-arm worker panicked");
            }
        }
    }
}

impl Drop for RearmWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: &Shared) {
    let mut state = shared.lock_state();
    loop {
        state = shared
            .condvar()
            .wait_while(state, |s| !s.rearm_pending && !s.worker_stop)
            .unwrap_or_else(PoisonError::into_inner);

        if state.worker_stop {
            break;
        }

        let report = shared.sweep_locked(&mut state);
        debug!(
            rearmed = report.rearmed.len(),
            failed = report.failed.len(),
            "re-arm sweep finished"
        );
    }
}
