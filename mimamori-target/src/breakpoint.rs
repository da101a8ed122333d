//! ハードウェアウォッチポイント機能

use crate::debugreg;
use crate::process::ThreadStates;
use crate::registers::Registers;
use crate::thread::ThreadId;
use nix::errno::Errno;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// 監視するアクセスの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Read,
    Write,
    ReadWrite,
    Execute,
}

impl AccessKind {
    /// 短縮表記（r, w, rw, x）
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessKind::Read => "r",
            AccessKind::Write => "w",
            AccessKind::ReadWrite => "rw",
            AccessKind::Execute => "x",
        }
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "r" | "read" => Ok(AccessKind::Read),
            "w" | "write" => Ok(AccessKind::Write),
            "rw" | "readwrite" | "read-write" => Ok(AccessKind::ReadWrite),
            "x" | "exec" | "execute" => Ok(AccessKind::Execute),
            other => Err(anyhow::anyhow!(
                "Invalid access kind '{}' (expected r, w, rw or x)",
                other
            )),
        }
    }
}

/// ウォッチポイントの設定・解除に失敗した理由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WatchError {
    #[error("hardware slot {slot} is unavailable")]
    SlotUnavailable { slot: usize },
    #[error("unsupported watch size {size} at 0x{address:x}")]
    UnsupportedSize { address: u64, size: usize },
    #[error("permission denied on thread {tid}")]
    PermissionDenied { tid: ThreadId },
    #[error("debug register access failed on thread {tid}: {errno}")]
    Os { tid: ThreadId, errno: Errno },
}

impl WatchError {
    /// ptraceのエラー番号を分類する
    pub fn from_errno(tid: ThreadId, errno: Errno) -> Self {
        match errno {
            Errno::EPERM | Errno::EACCES => WatchError::PermissionDenied { tid },
            errno => WatchError::Os { tid, errno },
        }
    }
}

/// スレッド単位でハードウェアウォッチポイントを設定・解除する
pub trait HardwareBreakpointFacility: Send + Sync {
    /// スレッド `tid` のスロット `slot` にウォッチポイントを設定する
    fn set_watch(
        &self,
        tid: ThreadId,
        slot: usize,
        address: u64,
        size: usize,
        access: AccessKind,
    ) -> Result<(), WatchError>;

    /// スレッド `tid` のスロット `slot` を解除する
    fn clear_watch(&self, tid: ThreadId, slot: usize) -> Result<(), WatchError>;
}

/// ptrace経由でデバッグレジスタを書き換えるファシリティ
///
/// デバッグレジスタはスレッドがptrace停止中でなければ書き換えられません。
/// 実行中のスレッドに対しては一時的に割り込んで停止させ、書き換え後に再開します。
/// すべての呼び出しはトレーサースレッドから行う必要があります。
pub struct PtraceWatchFacility {
    threads: Arc<ThreadStates>,
}

impl PtraceWatchFacility {
    pub fn new(threads: Arc<ThreadStates>) -> Self {
        Self { threads }
    }

    fn program(
        &self,
        tid: ThreadId,
        slot: usize,
        address: u64,
        size: usize,
        access: AccessKind,
    ) -> nix::Result<()> {
        let regs = Registers::new(tid);

        // 古い長さのままアドレスを変えるとカーネルに拒否されるため、先に無効化する
        let dr7 = debugreg::disable(regs.read_debugreg(debugreg::DR7)?, slot);
        regs.write_debugreg(debugreg::DR7, dr7)?;
        regs.write_debugreg(slot, address)?;
        regs.write_debugreg(debugreg::DR7, debugreg::enable(dr7, slot, size, access))?;

        debug!(
            tid,
            slot,
            "DR{} = 0x{:x}, DR7 = 0x{:x}",
            slot,
            address,
            debugreg::enable(dr7, slot, size, access)
        );
        Ok(())
    }

    fn unprogram(&self, tid: ThreadId, slot: usize) -> nix::Result<()> {
        let regs = Registers::new(tid);
        let dr7 = regs.read_debugreg(debugreg::DR7)?;
        if debugreg::is_enabled(dr7, slot) {
            regs.write_debugreg(debugreg::DR7, debugreg::disable(dr7, slot))?;
        }
        debug!(tid, slot, "DR{} cleared", slot);
        Ok(())
    }
}

impl HardwareBreakpointFacility for PtraceWatchFacility {
    fn set_watch(
        &self,
        tid: ThreadId,
        slot: usize,
        address: u64,
        size: usize,
        access: AccessKind,
    ) -> Result<(), WatchError> {
        debugreg::validate(slot, address, size, access)?;
        if access == AccessKind::Read {
            debug!(tid, "read-only watch is programmed as read/write on x86");
        }

        self.threads
            .with_stopped(tid, || self.program(tid, slot, address, size, access))
            .map_err(|errno| WatchError::from_errno(tid, errno))
    }

    fn clear_watch(&self, tid: ThreadId, slot: usize) -> Result<(), WatchError> {
        if slot >= debugreg::SLOT_COUNT {
            return Err(WatchError::SlotUnavailable { slot });
        }

        self.threads
            .with_stopped(tid, || self.unprogram(tid, slot))
            .map_err(|errno| WatchError::from_errno(tid, errno))
    }
}
