//! Mimamori ウォッチポイント管理のコア機能
//!
//! このクレートは、1つの論理的なウォッチ要求を複数スレッドのハードウェア
//! ウォッチポイントとして維持するマネージャを提供します。
//! トラップのたびにスロットを解除し、トラップハンドラの外で再設定することで
//! 監視を一度きりではなく継続的にします。

pub mod config;
pub mod errors;
pub mod manager;
pub mod parse;
pub mod rearm;
pub mod selection;
pub mod session;

pub use config::WatchConfig;
pub use manager::{InstallReport, SweepReport, TrackedThread, WatchRequest, WatchpointManager, WATCH_SLOT};
pub use rearm::RearmWorker;
pub use selection::ThreadSelection;
pub use session::{SessionSummary, WatchSession};

// 他のクレートから使用するために再エクスポート
pub use mimamori_target::{AccessKind, ThreadId, ThreadInfo, TrapDisposition, TrapEvent, TrapKind, WatchError};

/// コア機能の結果型
pub type Result<T> = anyhow::Result<T>;
