//! プロセス制御機能
//!
//! 対象プロセスの全スレッドに PTRACE_SEIZE でアタッチし、
//! 停止イベントをトラップイベントやシグナルに変換します。

use crate::debugreg;
use crate::registers::Registers;
use crate::thread::{ProcThreadEnumerator, ThreadEnumerator, ThreadId};
use crate::trap::{TrapDisposition, TrapEvent, TrapKind};
use crate::Result;
use nix::errno::Errno;
use nix::libc;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// 割り込み停止を待つ間のポーリング間隔
const STOP_POLL_INTERVAL: Duration = Duration::from_micros(200);

/// 停止イベントの種類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// SIGTRAPによる停止（DR6で分類済み）
    Trap(TrapEvent),
    /// SIGTRAP以外のシグナル配送停止
    Signal { tid: ThreadId, signal: Signal },
    /// 割り込みやグループ停止などのptraceイベント停止
    Stopped(ThreadId),
    /// リーダー以外のスレッドが終了した
    ThreadExited(ThreadId),
    /// プロセスが終了した
    Exited(i32),
    /// プロセスがシグナルで終了した
    Killed(Signal),
    /// 待機中にトレーサー自身がシグナルを受けた（EINTR）
    Interrupted,
}

/// [`ThreadStates::wait_for_stop`] がどの停止で戻ったか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// PTRACE_INTERRUPT（またはグループ停止）による停止。呼び出し側が再開する
    Interrupt,
    /// 割り込みより先にシグナル・トラップ停止が届いた。
    /// イベントは保留キューに積まれ、再開はイベントループが行う
    Deferred,
}

/// トレース中のスレッドとその停止状態
///
/// ptraceの操作はトレーサースレッドからしか行えないため、
/// この型の停止・再開を伴う操作も同じスレッドから呼ぶ必要があります。
#[derive(Debug)]
pub struct ThreadStates {
    /// スレッドグループリーダー（= PID）
    leader: ThreadId,
    /// tid -> 停止中かどうか
    states: Mutex<HashMap<ThreadId, bool>>,
    /// イベントループに渡す前に受け取ってしまった停止イベント
    deferred: Mutex<VecDeque<TraceEvent>>,
}

impl ThreadStates {
    pub fn new(leader: ThreadId) -> Self {
        Self {
            leader,
            states: Mutex::new(HashMap::new()),
            deferred: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ThreadId, bool>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_deferred(&self) -> MutexGuard<'_, VecDeque<TraceEvent>> {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// スレッドグループリーダーのTID
    pub fn leader(&self) -> ThreadId {
        self.leader
    }

    /// スレッドを登録する
    pub fn insert(&self, tid: ThreadId, stopped: bool) {
        self.lock().insert(tid, stopped);
    }

    /// スレッドを登録解除する
    pub fn remove(&self, tid: ThreadId) {
        self.lock().remove(&tid);
    }

    /// 停止状態を更新する（未登録のスレッドは無視）
    pub fn set_stopped(&self, tid: ThreadId, stopped: bool) {
        if let Some(state) = self.lock().get_mut(&tid) {
            *state = stopped;
        }
    }

    /// 停止中かどうか。トレースしていなければ `None`
    pub fn is_stopped(&self, tid: ThreadId) -> Option<bool> {
        self.lock().get(&tid).copied()
    }

    /// トレース中のスレッドID一覧（昇順）
    pub fn tids(&self) -> Vec<ThreadId> {
        let mut tids: Vec<_> = self.lock().keys().copied().collect();
        tids.sort_unstable();
        tids
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// 保留中のイベントを積む
    pub fn defer(&self, event: TraceEvent) {
        self.lock_deferred().push_back(event);
    }

    /// 保留中のイベントを1つ取り出す
    pub fn pop_deferred(&self) -> Option<TraceEvent> {
        self.lock_deferred().pop_front()
    }

    /// スレッドの保留イベントを捨て、再配送すべきシグナルがあれば返す
    ///
    /// SIGTRAPはトレーサー由来なので返しません。
    pub fn take_deferred_signal(&self, tid: ThreadId) -> Option<Signal> {
        let mut pending = None;
        self.lock_deferred().retain(|event| match event {
            TraceEvent::Signal { tid: t, signal } if *t == tid => {
                if *signal != Signal::SIGTRAP {
                    pending = Some(*signal);
                }
                false
            }
            TraceEvent::Trap(trap) if trap.tid == tid => false,
            TraceEvent::Stopped(t) if *t == tid => false,
            _ => true,
        });
        pending
    }

    /// waitpidの結果を停止イベントに変換し、スレッドの状態を更新する
    pub fn translate(&self, status: WaitStatus) -> Option<TraceEvent> {
        let event = match status {
            WaitStatus::Stopped(pid, Signal::SIGTRAP) => {
                let tid = pid.as_raw();
                self.set_stopped(tid, true);
                TraceEvent::Trap(read_trap(tid))
            }
            WaitStatus::Stopped(pid, signal) => {
                self.set_stopped(pid.as_raw(), true);
                TraceEvent::Signal {
                    tid: pid.as_raw(),
                    signal,
                }
            }
            WaitStatus::PtraceEvent(pid, _, event) => {
                if event != libc::PTRACE_EVENT_STOP {
                    debug!(tid = pid.as_raw(), event, "unexpected ptrace event");
                }
                self.set_stopped(pid.as_raw(), true);
                TraceEvent::Stopped(pid.as_raw())
            }
            WaitStatus::Exited(pid, code) => {
                self.remove(pid.as_raw());
                if pid.as_raw() == self.leader {
                    TraceEvent::Exited(code)
                } else {
                    TraceEvent::ThreadExited(pid.as_raw())
                }
            }
            WaitStatus::Signaled(pid, signal, _) => {
                self.remove(pid.as_raw());
                if pid.as_raw() == self.leader {
                    TraceEvent::Killed(signal)
                } else {
                    TraceEvent::ThreadExited(pid.as_raw())
                }
            }
            _ => return None,
        };
        Some(event)
    }

    /// PTRACE_INTERRUPT を送ったスレッドが停止するまで待つ
    ///
    /// 割り込み停止より先に届いたシグナル・トラップ停止は再配送せずに保留キューへ積み、
    /// スレッドは停止したままにします。スレッドやプロセスが終了していた場合は
    /// 終了イベントを保留して `ESRCH` を返します。
    pub fn wait_for_stop(&self, tid: ThreadId) -> nix::Result<StopKind> {
        let pid = Pid::from_raw(tid);
        loop {
            let status = waitpid(pid, Some(WaitPidFlag::__WALL | WaitPidFlag::WNOHANG))?;
            match status {
                WaitStatus::StillAlive => {
                    // グループ終了中はリーダーの状態が報告されないことがある
                    if thread_is_dead(self.leader, tid) {
                        self.remove(tid);
                        return Err(Errno::ESRCH);
                    }
                    thread::sleep(STOP_POLL_INTERVAL);
                }
                WaitStatus::PtraceEvent(_, _, _) => {
                    self.set_stopped(tid, true);
                    return Ok(StopKind::Interrupt);
                }
                WaitStatus::Stopped(_, _) => {
                    if let Some(event) = self.translate(status) {
                        debug!(tid, "stop arrived before interrupt: {:?}", event);
                        self.defer(event);
                    }
                    return Ok(StopKind::Deferred);
                }
                WaitStatus::Exited(_, _) | WaitStatus::Signaled(_, _, _) => {
                    if let Some(event) = self.translate(status) {
                        self.defer(event);
                    }
                    return Err(Errno::ESRCH);
                }
                _ => continue,
            }
        }
    }

    /// スレッドを停止させた状態で `f` を実行する
    ///
    /// 既に停止中ならそのまま実行します。実行中なら PTRACE_INTERRUPT で停止させ、
    /// 割り込み停止で止まった場合だけ実行後に再開します。
    pub fn with_stopped<T>(&self, tid: ThreadId, f: impl FnOnce() -> nix::Result<T>) -> nix::Result<T> {
        match self.is_stopped(tid) {
            None => Err(Errno::ESRCH),
            Some(true) => f(),
            Some(false) => {
                let pid = Pid::from_raw(tid);
                ptrace::interrupt(pid)?;
                match self.wait_for_stop(tid)? {
                    StopKind::Interrupt => {
                        let result = f();
                        ptrace::cont(pid, None)?;
                        self.set_stopped(tid, false);
                        result
                    }
                    // 保留したイベントをイベントループが処理するまで停止させておく
                    StopKind::Deferred => f(),
                }
            }
        }
    }
}

/// /proc からスレッドが既に終了（ゾンビ）しているか調べる
fn thread_is_dead(leader: ThreadId, tid: ThreadId) -> bool {
    let stat = match fs::read_to_string(format!("/proc/{}/task/{}/stat", leader, tid)) {
        Ok(stat) => stat,
        Err(_) => return true,
    };

    // comm に空白や括弧が含まれうるので最後の ')' の後ろを見る
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next())
        .map_or(true, |state| matches!(state, 'Z' | 'X' | 'x'))
}

/// SIGTRAP停止の原因をDR6から判定し、DR6をクリアする
fn read_trap(tid: ThreadId) -> TrapEvent {
    let regs = Registers::new(tid);

    let kind = match regs.read_debugreg(debugreg::DR6) {
        Ok(dr6) => {
            // DR6はCPUがクリアしないため、次のトラップと混ざらないよう消しておく
            if let Err(e) = regs.write_debugreg(debugreg::DR6, 0) {
                debug!(tid, "failed to clear DR6: {}", e);
            }
            debug!(tid, slots = ?debugreg::triggered_slots(dr6), "DR6 = 0x{:x}", dr6);
            debugreg::classify(dr6)
        }
        Err(e) => {
            debug!(tid, "failed to read DR6: {}", e);
            TrapKind::Other
        }
    };

    let pc = regs.get_pc().unwrap_or_else(|e| {
        debug!(tid, "failed to read pc: {}", e);
        0
    });

    TrapEvent { kind, pc, tid }
}

/// デバッグ対象のプロセス
pub struct Tracee {
    pid: Pid,
    threads: Arc<ThreadStates>,
}

impl Tracee {
    /// 既存プロセスの全スレッドに PTRACE_SEIZE でアタッチし、停止させる
    ///
    /// アタッチ時点のスレッドだけが対象で、その後に生成されたスレッドは追跡しません。
    pub fn seize(pid: i32) -> Result<Self> {
        let threads = Arc::new(ThreadStates::new(pid));
        let enumerator = ProcThreadEnumerator::new(pid);

        for thread in enumerator.list_threads(None)? {
            let tid = Pid::from_raw(thread.tid);
            match ptrace::seize(tid, ptrace::Options::empty()) {
                Ok(()) => {}
                // 列挙後に終了したスレッド
                Err(Errno::ESRCH) => continue,
                Err(e) => {
                    return Err(anyhow::anyhow!(
                        "Failed to seize thread {} ({}): {}",
                        thread.tid,
                        thread.name,
                        e
                    ))
                }
            }

            threads.insert(thread.tid, false);
            ptrace::interrupt(tid)?;
            match threads.wait_for_stop(thread.tid) {
                Ok(_) => {}
                Err(Errno::ESRCH) => continue,
                Err(e) => return Err(e.into()),
            }
            debug!(tid = thread.tid, name = %thread.name, "seized");
        }

        if threads.is_empty() {
            return Err(anyhow::anyhow!("No threads could be attached in process {}", pid));
        }

        Ok(Self {
            pid: Pid::from_raw(pid),
            threads,
        })
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// スレッドの停止状態を共有する
    pub fn threads(&self) -> Arc<ThreadStates> {
        self.threads.clone()
    }

    /// スレッドを再開する
    ///
    /// 既に終了していたスレッドは登録解除するだけでエラーにしません。
    pub fn resume(&self, tid: ThreadId, signal: Option<Signal>) -> Result<()> {
        match ptrace::cont(Pid::from_raw(tid), signal) {
            Ok(()) => {
                self.threads.set_stopped(tid, false);
                Ok(())
            }
            Err(Errno::ESRCH) => {
                debug!(tid, "thread vanished before resume");
                self.threads.remove(tid);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// トラップしたスレッドを再開する
    ///
    /// ハンドラが処理しなかったトラップはSIGTRAPとして再配送します。
    pub fn resume_trap(&self, event: &TrapEvent, disposition: TrapDisposition) -> Result<()> {
        let signal = match disposition {
            TrapDisposition::Handled => None,
            TrapDisposition::NotHandled => Some(Signal::SIGTRAP),
        };
        self.resume(event.tid, signal)
    }

    /// 停止中の全スレッドを再開する
    ///
    /// 保留イベントを持つスレッドはイベントループが再開するので触りません。
    pub fn resume_all(&self) -> Result<()> {
        let deferred: Vec<ThreadId> = self
            .threads
            .lock_deferred()
            .iter()
            .filter_map(|event| match event {
                TraceEvent::Trap(trap) => Some(trap.tid),
                TraceEvent::Signal { tid, .. } | TraceEvent::Stopped(tid) => Some(*tid),
                _ => None,
            })
            .collect();

        for tid in self.threads.tids() {
            if self.threads.is_stopped(tid) == Some(true) && !deferred.contains(&tid) {
                self.resume(tid, None)?;
            }
        }
        Ok(())
    }

    /// 次の停止イベントを待機する
    ///
    /// 他の操作の途中で受け取って保留したイベントがあれば、それを先に返します。
    pub fn wait_event(&self) -> Result<TraceEvent> {
        if let Some(event) = self.threads.pop_deferred() {
            return Ok(event);
        }

        loop {
            let status = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::EINTR) => return Ok(TraceEvent::Interrupted),
                Err(e) => return Err(anyhow::anyhow!("waitpid failed: {}", e)),
            };

            match self.threads.translate(status) {
                Some(event) => return Ok(event),
                None => debug!("ignoring wait status {:?}", status),
            }
        }
    }

    /// 全スレッドからデタッチする
    ///
    /// 実行中のスレッドは一度停止させてからデタッチします。
    pub fn detach_all(&self) {
        for tid in self.threads.tids() {
            let pid = Pid::from_raw(tid);
            if self.threads.is_stopped(tid) != Some(true) {
                if let Err(e) = ptrace::interrupt(pid) {
                    debug!(tid, "interrupt before detach failed: {}", e);
                    self.threads.remove(tid);
                    continue;
                }
                if let Err(e) = self.threads.wait_for_stop(tid) {
                    debug!(tid, "wait before detach failed: {}", e);
                    self.threads.remove(tid);
                    continue;
                }
            }

            let pending = self.threads.take_deferred_signal(tid);
            if let Err(e) = ptrace::detach(pid, pending) {
                warn!(tid, "detach failed: {}", e);
            }
            self.threads.remove(tid);
        }
    }
}

impl Drop for Tracee {
    fn drop(&mut self) {
        self.detach_all();
    }
}
