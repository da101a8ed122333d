//! ウォッチポイントマネージャ
//!
//! 1つのウォッチ要求（アドレス・サイズ・アクセス条件）を、選択したスレッド群の
//! スロット0に設定し、トラップのたびに解除・再設定して監視を継続します。
//!
//! 各スレッドの状態遷移:
//! `未設定 -> 設定済み`（install / スイープ）`-> 未設定`（トラップ）`-> 設定済み`（次のスイープ）

use crate::selection::ThreadSelection;
use crate::Result;
use mimamori_target::{
    AccessKind, HardwareBreakpointFacility, ThreadEnumerator, ThreadId, TrapDispatcher,
    TrapDisposition, TrapEvent, TrapHandler, WatchError,
};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 使用するハードウェアスロット
pub const WATCH_SLOT: usize = 0;

/// 論理的なウォッチ要求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchRequest {
    pub address: u64,
    pub size: usize,
    pub access: AccessKind,
}

impl fmt::Display for WatchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x} (size: {}, access: {})", self.address, self.size, self.access)
    }
}

/// 監視対象として選ばれたスレッド
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedThread {
    pub tid: ThreadId,
    pub name: String,
    /// スロット0に現在の要求が設定されているか
    pub armed: bool,
    /// install時の設定に失敗したか。失敗したスレッドは次のinstallまで再設定しない
    pub install_failed: bool,
}

/// installの結果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub armed: Vec<ThreadId>,
    pub failed: Vec<(ThreadId, WatchError)>,
}

impl InstallReport {
    /// 1スレッドも設定できなかったか
    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}

/// 再設定スイープの結果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub rearmed: Vec<ThreadId>,
    pub failed: Vec<(ThreadId, WatchError)>,
}

impl SweepReport {
    /// 何も行わなかったか
    pub fn is_empty(&self) -> bool {
        self.rearmed.is_empty() && self.failed.is_empty()
    }
}

/// トラップハンドラとスイープが共有する状態
#[derive(Debug, Default)]
pub(crate) struct WatchState {
    pub(crate) request: Option<WatchRequest>,
    pub(crate) threads: Vec<TrackedThread>,
    /// 再設定が必要なスレッドがあるか
    pub(crate) rearm_pending: bool,
    /// 再設定ワーカーへの停止要求
    pub(crate) worker_stop: bool,
}

/// ハンドラとしてディスパッチャに登録される部分
pub(crate) struct Shared {
    facility: Arc<dyn HardwareBreakpointFacility>,
    state: Mutex<WatchState>,
    rearm: Condvar,
}

impl Shared {
    /// 状態をロックする
    ///
    /// 状態はフラグの集まりで常に整合しているため、ポイズンは回復して使い続けます。
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("watch state lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub(crate) fn condvar(&self) -> &Condvar {
        &self.rearm
    }

    /// ロック保持中にスイープを行う
    pub(crate) fn sweep_locked(&self, state: &mut WatchState) -> SweepReport {
        let mut report = SweepReport::default();
        if !state.rearm_pending {
            return report;
        }

        if let Some(request) = state.request {
            for thread in state
                .threads
                .iter_mut()
                .filter(|t| !t.armed && !t.install_failed)
            {
                match self.facility.set_watch(
                    thread.tid,
                    WATCH_SLOT,
                    request.address,
                    request.size,
                    request.access,
                ) {
                    Ok(()) => {
                        thread.armed = true;
                        report.rearmed.push(thread.tid);
                        debug!(tid = thread.tid, "watchpoint re-armed at 0x{:x}", request.address);
                    }
                    Err(e) => {
                        warn!(tid = thread.tid, name = %thread.name, "failed to re-arm watchpoint: {}", e);
                        report.failed.push((thread.tid, e));
                    }
                }
            }
        }

        state.rearm_pending = false;
        report
    }

    fn handle_trap(&self, event: &TrapEvent) -> TrapDisposition {
        if !event.kind.is_watch_trap() {
            return TrapDisposition::NotHandled;
        }

        let mut guard = self.lock_state();
        let state = &mut *guard;

        let request = match state.request {
            Some(request) => request,
            None => return TrapDisposition::NotHandled,
        };

        let thread = match state
            .threads
            .iter_mut()
            .find(|t| t.tid == event.tid && t.armed)
        {
            Some(thread) => thread,
            None => {
                debug!(tid = event.tid, pc = event.pc, "trap from an unwatched thread");
                return TrapDisposition::NotHandled;
            }
        };

        // 同じ命令で無限にトラップしないよう、戻る前に解除する
        if let Err(e) = self.facility.clear_watch(event.tid, WATCH_SLOT) {
            warn!(tid = event.tid, "failed to clear watchpoint in trap handler: {}", e);
            return TrapDisposition::NotHandled;
        }

        thread.armed = false;
        state.rearm_pending = true;
        self.rearm.notify_all();

        info!(
            tid = event.tid,
            "0x{:x} tried to \"{}\" at 0x{:x}",
            event.pc,
            request.access,
            request.address
        );
        TrapDisposition::Handled
    }
}

impl TrapHandler for Shared {
    fn handle(&self, event: &TrapEvent) -> TrapDisposition {
        match panic::catch_unwind(AssertUnwindSafe(|| self.handle_trap(event))) {
            Ok(disposition) => disposition,
            Err(_) => {
                error!(tid = event.tid, "trap handler panicked, leaving trap unhandled");
                TrapDisposition::NotHandled
            }
        }
    }
}

/// ウォッチポイントマネージャ
///
/// 3つの協調コンポーネント（スレッド列挙器、ハードウェアブレークポイント機構、
/// トラップディスパッチャ）を注入して構築します。クローンは同じ状態を共有します。
#[derive(Clone)]
pub struct WatchpointManager {
    enumerator: Arc<dyn ThreadEnumerator>,
    dispatcher: Arc<dyn TrapDispatcher>,
    selection: ThreadSelection,
    shared: Arc<Shared>,
}

impl WatchpointManager {
    /// 新しいマネージャを作成する
    pub fn new(
        enumerator: Arc<dyn ThreadEnumerator>,
        facility: Arc<dyn HardwareBreakpointFacility>,
        dispatcher: Arc<dyn TrapDispatcher>,
        selection: ThreadSelection,
    ) -> Self {
        Self {
            enumerator,
            dispatcher,
            selection,
            shared: Arc::new(Shared {
                facility,
                state: Mutex::new(WatchState::default()),
                rearm: Condvar::new(),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// スレッド選択ポリシーを取得する
    pub fn selection(&self) -> &ThreadSelection {
        &self.selection
    }

    /// ウォッチポイントを設定する
    ///
    /// 以前の要求は丸ごと置き換えられます。対象スレッドはこの時点のスナップショットで、
    /// 以降に生成されたスレッドは対象になりません。スレッドごとの失敗は互いに独立で、
    /// 戻り値のレポートに記録されます。`Err` になるのはスレッド列挙の失敗だけです。
    pub fn install(&self, address: u64, size: usize, access: AccessKind) -> Result<InstallReport> {
        let request = WatchRequest { address, size, access };
        let selected = self.selection.select(self.enumerator.as_ref())?;
        info!(
            "installing watchpoint at {} on {} ({} found)",
            request,
            self.selection,
            selected.len()
        );

        let handler: Arc<dyn TrapHandler> = self.shared.clone();
        self.dispatcher.register_handler(handler);

        let mut state = self.shared.lock_state();

        // 新しいスナップショットに含まれないスレッドに古いウォッチが残らないようにする
        for old in state.threads.iter().filter(|t| t.armed) {
            if selected.iter().any(|t| t.tid == old.tid) {
                continue;
            }
            if let Err(e) = self.shared.facility.clear_watch(old.tid, WATCH_SLOT) {
                warn!(tid = old.tid, "failed to clear stale watchpoint: {}", e);
            }
        }

        let previously_armed: Vec<ThreadId> = state
            .threads
            .iter()
            .filter(|t| t.armed)
            .map(|t| t.tid)
            .collect();

        let mut report = InstallReport::default();
        let mut threads = Vec::with_capacity(selected.len());
        for info in selected {
            let (armed, install_failed) =
                match self.shared.facility.set_watch(info.tid, WATCH_SLOT, address, size, access) {
                    Ok(()) => {
                        info!("hardware watchpoint set at 0x{:x} ({} {})", address, info.tid, info.name);
                        report.armed.push(info.tid);
                        (true, false)
                    }
                    Err(e) => {
                        warn!(tid = info.tid, name = %info.name, "failed to set watchpoint: {}", e);
                        report.failed.push((info.tid, e));
                        // 前回のウォッチが残っていれば外す。外せなければ次のトラップで外す
                        let still_programmed = previously_armed.contains(&info.tid)
                            && match self.shared.facility.clear_watch(info.tid, WATCH_SLOT) {
                                Ok(()) => false,
                                Err(e) => {
                                    warn!(tid = info.tid, "failed to clear previous watchpoint: {}", e);
                                    true
                                }
                            };
                        (still_programmed, true)
                    }
                };
            threads.push(TrackedThread {
                tid: info.tid,
                name: info.name,
                armed,
                install_failed,
            });
        }

        state.request = Some(request);
        state.threads = threads;
        state.rearm_pending = false;

        Ok(report)
    }

    /// ウォッチポイントを取り除く
    ///
    /// ディスパッチャからハンドラを解除し、設定済みのスレッドをすべて解除します。
    /// 何もinstallされていなければ何もしません（他のハンドラの登録を壊さないため）。
    /// 解除したスレッド数を返します。
    pub fn uninstall(&self) -> usize {
        let mut state = self.shared.lock_state();
        if state.request.is_none() {
            return 0;
        }

        self.dispatcher.unregister_handler();

        let mut disarmed = 0;
        for thread in state.threads.iter().filter(|t| t.armed) {
            match self.shared.facility.clear_watch(thread.tid, WATCH_SLOT) {
                Ok(()) => disarmed += 1,
                Err(e) => warn!(tid = thread.tid, "failed to clear watchpoint on uninstall: {}", e),
            }
        }

        state.request = None;
        state.threads.clear();
        state.rearm_pending = false;
        info!("watchpoint uninstalled ({} threads disarmed)", disarmed);

        disarmed
    }

    /// 再設定スイープを行う
    ///
    /// 再設定要求が無ければ何もしません。要求があれば未設定のスレッドに
    /// 現在の要求を設定し直し、結果に関わらず要求フラグを下ろします。
    pub fn sweep(&self) -> SweepReport {
        let mut state = self.shared.lock_state();
        self.shared.sweep_locked(&mut state)
    }

    /// 再設定要求が立つまで最大 `timeout` 待つ
    pub fn wait_rearm(&self, timeout: Duration) -> bool {
        let state = self.shared.lock_state();
        let (state, _) = self
            .shared
            .condvar()
            .wait_timeout_while(state, timeout, |s| !s.rearm_pending)
            .unwrap_or_else(PoisonError::into_inner);
        state.rearm_pending
    }

    /// 現在のウォッチ要求
    pub fn request(&self) -> Option<WatchRequest> {
        self.shared.lock_state().request
    }

    /// 監視対象スレッドのスナップショット
    pub fn tracked_threads(&self) -> Vec<TrackedThread> {
        self.shared.lock_state().threads.clone()
    }

    /// 再設定要求が立っているか
    pub fn rearm_pending(&self) -> bool {
        self.shared.lock_state().rearm_pending
    }

    /// installされているか
    pub fn is_installed(&self) -> bool {
        self.shared.lock_state().request.is_some()
    }
}

impl fmt::Debug for WatchpointManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock_state();
        f.debug_struct("WatchpointManager")
            .field("selection", &self.selection)
            .field("request", &state.request)
            .field("threads", &state.threads)
            .field("rearm_pending", &state.rearm_pending)
            .finish()
    }
}
