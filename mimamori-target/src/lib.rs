//! Mimamori ターゲットプロセス制御
//!
//! このクレートは、ウォッチポイントマネージャが依存する低レベル機能を提供します。
//! スレッド列挙、デバッグレジスタによるハードウェアウォッチポイントの設定・解除、
//! ptraceによるトラップイベントの受信とディスパッチを行います。

pub mod thread;
pub mod registers;
pub mod debugreg;
pub mod breakpoint;
pub mod trap;
pub mod process;

pub use thread::{ProcThreadEnumerator, ThreadEnumerator, ThreadId, ThreadInfo};
pub use registers::Registers;
pub use breakpoint::{AccessKind, HardwareBreakpointFacility, PtraceWatchFacility, WatchError};
pub use trap::{HandlerSlot, TrapDispatcher, TrapDisposition, TrapEvent, TrapHandler, TrapKind};
pub use process::{StopKind, ThreadStates, TraceEvent, Tracee};

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;
