//! ptraceでアタッチしたプロセスに対するウォッチセッション
//!
//! ptraceではトレーサースレッドしかデバッグレジスタを触れないため、
//! トラップのディスパッチと再設定スイープはどちらもこのイベントループで行います。

use crate::config::WatchConfig;
use crate::manager::{InstallReport, WatchpointManager};
use crate::Result;
use mimamori_target::{HandlerSlot, ProcThreadEnumerator, PtraceWatchFacility, TraceEvent, Tracee};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// セッション終了時の集計
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// 処理したウォッチポイントトラップの数
    pub traps_handled: usize,
    /// 再配送したトラップの数
    pub traps_forwarded: usize,
    /// 再設定に成功した回数
    pub rearms: usize,
    /// 対象プロセスの終了コード
    pub exit_code: Option<i32>,
}

/// ウォッチセッション
pub struct WatchSession {
    config: WatchConfig,
    tracee: Tracee,
    dispatcher: Arc<HandlerSlot>,
    manager: WatchpointManager,
}

impl WatchSession {
    /// 対象プロセスの全スレッドにアタッチする
    ///
    /// 戻った時点で全スレッドは停止しています。
    pub fn attach(config: WatchConfig) -> Result<Self> {
        let tracee = Tracee::seize(config.pid)?;
        let dispatcher = Arc::new(HandlerSlot::new());
        let manager = WatchpointManager::new(
            Arc::new(ProcThreadEnumerator::new(config.pid)),
            Arc::new(PtraceWatchFacility::new(tracee.threads())),
            dispatcher.clone(),
            config.selection.clone(),
        );
        info!(
            "attached to process {} ({} threads), watching {}",
            tracee.pid(),
            tracee.threads().tids().len(),
            manager.selection()
        );

        Ok(Self {
            config,
            tracee,
            dispatcher,
            manager,
        })
    }

    /// マネージャへの参照を取得する
    pub fn manager(&self) -> &WatchpointManager {
        &self.manager
    }

    /// 設定されたウォッチポイントをinstallする
    pub fn install(&self) -> Result<InstallReport> {
        self.manager
            .install(self.config.address, self.config.size, self.config.access)
    }

    /// 停止中のスレッドを再開し、`stop` が立つかプロセスが終了するまでイベントを処理する
    ///
    /// 終了時にはウォッチポイントをuninstallします。
    pub fn run(&self, stop: &AtomicBool) -> Result<SessionSummary> {
        let mut summary = SessionSummary::default();
        self.tracee.resume_all()?;

        while !stop.load(Ordering::SeqCst) {
            match self.tracee.wait_event()? {
                TraceEvent::Trap(event) => {
                    let disposition = self.dispatcher.dispatch(&event);
                    if disposition.is_handled() {
                        summary.traps_handled += 1;
                    } else {
                        debug!(tid = event.tid, kind = ?event.kind, "forwarding SIGTRAP");
                        summary.traps_forwarded += 1;
                    }
                    self.tracee.resume_trap(&event, disposition)?;
                }
                TraceEvent::Signal { tid, signal } => {
                    debug!(tid, "forwarding {:?}", signal);
                    self.tracee.resume(tid, Some(signal))?;
                }
                TraceEvent::Stopped(tid) => self.tracee.resume(tid, None)?,
                TraceEvent::ThreadExited(tid) => debug!(tid, "thread exited"),
                TraceEvent::Exited(code) => {
                    info!("process exited with code {}", code);
                    summary.exit_code = Some(code);
                    return Ok(summary);
                }
                TraceEvent::Killed(signal) => {
                    info!("process killed by {:?}", signal);
                    return Ok(summary);
                }
                TraceEvent::Interrupted => continue,
            }

            // トラップしたスレッドを再開した後で再設定する
            let report = self.manager.sweep();
            summary.rearms += report.rearmed.len();
            for (tid, e) in &report.failed {
                warn!(tid, "re-arm failed: {}", e);
            }
        }

        self.manager.uninstall();
        Ok(summary)
    }

    /// ウォッチポイントを外してデタッチする
    pub fn detach(self) {
        self.manager.uninstall();
        self.tracee.detach_all();
    }
}
