//! トラップイベントとハンドラのディスパッチ

use crate::thread::ThreadId;
use std::sync::{Arc, PoisonError, RwLock};

/// トラップの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    /// ハードウェアブレークポイント（ウォッチポイント）
    Breakpoint,
    /// シングルステップ
    SingleStep,
    /// その他のハードウェア例外
    Other,
}

impl TrapKind {
    /// ウォッチポイント由来の可能性があるトラップかどうか
    pub fn is_watch_trap(&self) -> bool {
        matches!(self, TrapKind::Breakpoint | TrapKind::SingleStep)
    }
}

/// ディスパッチャから届くトラップイベント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapEvent {
    pub kind: TrapKind,
    /// トラップ時の命令ポインタ
    pub pc: u64,
    /// トラップしたスレッド
    pub tid: ThreadId,
}

/// ハンドラの処理結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapDisposition {
    /// 処理済み。既定のトラップ動作を抑制する
    Handled,
    /// 未処理。既定の動作（シグナル配送など）に任せる
    NotHandled,
}

impl TrapDisposition {
    pub fn is_handled(&self) -> bool {
        *self == TrapDisposition::Handled
    }
}

/// トラップハンドラ
///
/// トラップしたスレッドのコンテキストで同期的に呼ばれるため、
/// 短時間で戻り、決してパニックを外へ伝播させてはいけません。
pub trait TrapHandler: Send + Sync {
    fn handle(&self, event: &TrapEvent) -> TrapDisposition;
}

/// 例外・トラップのディスパッチャ
///
/// プロセス全体で登録できるハンドラは1つだけです。
pub trait TrapDispatcher: Send + Sync {
    /// ハンドラを登録する（既存の登録は置き換えられる）
    fn register_handler(&self, handler: Arc<dyn TrapHandler>);

    /// 登録されているハンドラを解除する
    fn unregister_handler(&self);
}

/// ハンドラを1つだけ保持するディスパッチャ
#[derive(Default)]
pub struct HandlerSlot {
    handler: RwLock<Option<Arc<dyn TrapHandler>>>,
}

impl HandlerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// ハンドラが登録されているかどうか
    pub fn is_registered(&self) -> bool {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// イベントを登録済みハンドラへ渡す
    ///
    /// ハンドラが無い場合は `NotHandled` を返します。
    pub fn dispatch(&self, event: &TrapEvent) -> TrapDisposition {
        // ハンドラ実行中にロックを保持しない
        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match handler {
            Some(handler) => handler.handle(event),
            None => TrapDisposition::NotHandled,
        }
    }
}

impl TrapDispatcher for HandlerSlot {
    fn register_handler(&self, handler: Arc<dyn TrapHandler>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn unregister_handler(&self) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
