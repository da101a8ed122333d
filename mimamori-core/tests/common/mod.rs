//! テスト用の協調コンポーネント

#![allow(dead_code)]

use mimamori_core::{ThreadSelection, WatchpointManager};
use mimamori_target::{
    AccessKind, HandlerSlot, HardwareBreakpointFacility, ThreadEnumerator, ThreadId, ThreadInfo,
    TrapEvent, TrapKind, WatchError,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// スロットに書き込まれた内容
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Programmed {
    pub address: u64,
    pub size: usize,
    pub access: AccessKind,
}

/// 固定のスレッド一覧を返す列挙器
pub struct FakeEnumerator {
    threads: Mutex<Vec<ThreadInfo>>,
    fail: AtomicBool,
}

impl FakeEnumerator {
    pub fn new(threads: &[(ThreadId, &str)]) -> Self {
        Self {
            threads: Mutex::new(
                threads
                    .iter()
                    .map(|(tid, name)| ThreadInfo::new(*tid, *name))
                    .collect(),
            ),
            fail: AtomicBool::new(false),
        }
    }

    pub fn set_threads(&self, threads: &[(ThreadId, &str)]) {
        *self.threads.lock().unwrap() = threads
            .iter()
            .map(|(tid, name)| ThreadInfo::new(*tid, *name))
            .collect();
    }

    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

impl ThreadEnumerator for FakeEnumerator {
    fn list_threads(&self, filter: Option<&str>) -> anyhow::Result<Vec<ThreadInfo>> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("enumeration failed");
        }
        Ok(self
            .threads
            .lock()
            .unwrap()
            .iter()
            .filter(|t| filter.map_or(true, |f| f == t.name))
            .cloned()
            .collect())
    }
}

/// スロットの内容をメモリ上に記録するファシリティ
#[derive(Default)]
pub struct FakeFacility {
    slots: Mutex<HashMap<(ThreadId, usize), Programmed>>,
    set_failures: Mutex<HashMap<ThreadId, WatchError>>,
    clear_failures: Mutex<HashSet<ThreadId>>,
    panic_on_clear: AtomicBool,
    set_calls: Mutex<Vec<ThreadId>>,
}

impl FakeFacility {
    pub fn slot(&self, tid: ThreadId, slot: usize) -> Option<Programmed> {
        self.slots.lock().unwrap().get(&(tid, slot)).copied()
    }

    /// 全スレッドで使用中のスロット数
    pub fn programmed_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn fail_set(&self, tid: ThreadId, error: WatchError) {
        self.set_failures.lock().unwrap().insert(tid, error);
    }

    pub fn allow_set(&self, tid: ThreadId) {
        self.set_failures.lock().unwrap().remove(&tid);
    }

    pub fn fail_clear(&self, tid: ThreadId) {
        self.clear_failures.lock().unwrap().insert(tid);
    }

    pub fn panic_on_clear(&self) {
        self.panic_on_clear.store(true, Ordering::SeqCst);
    }

    pub fn set_calls(&self, tid: ThreadId) -> usize {
        self.set_calls.lock().unwrap().iter().filter(|t| **t == tid).count()
    }
}

impl HardwareBreakpointFacility for FakeFacility {
    fn set_watch(
        &self,
        tid: ThreadId,
        slot: usize,
        address: u64,
        size: usize,
        access: AccessKind,
    ) -> Result<(), WatchError> {
        self.set_calls.lock().unwrap().push(tid);
        if let Some(error) = self.set_failures.lock().unwrap().get(&tid) {
            return Err(*error);
        }
        self.slots
            .lock()
            .unwrap()
            .insert((tid, slot), Programmed { address, size, access });
        Ok(())
    }

    fn clear_watch(&self, tid: ThreadId, slot: usize) -> Result<(), WatchError> {
        if self.panic_on_clear.load(Ordering::SeqCst) {
            panic!("clear_watch exploded");
        }
        if self.clear_failures.lock().unwrap().contains(&tid) {
            return Err(WatchError::PermissionDenied { tid });
        }
        self.slots.lock().unwrap().remove(&(tid, slot));
        Ok(())
    }
}

/// マネージャと協調コンポーネント一式
pub struct Harness {
    pub enumerator: Arc<FakeEnumerator>,
    pub facility: Arc<FakeFacility>,
    pub dispatcher: Arc<HandlerSlot>,
    pub manager: WatchpointManager,
}

impl Harness {
    pub fn new(threads: &[(ThreadId, &str)], selection: ThreadSelection) -> Self {
        let enumerator = Arc::new(FakeEnumerator::new(threads));
        let facility = Arc::new(FakeFacility::default());
        let dispatcher = Arc::new(HandlerSlot::new());
        let manager = WatchpointManager::new(
            enumerator.clone(),
            facility.clone(),
            dispatcher.clone(),
            selection,
        );
        Self {
            enumerator,
            facility,
            dispatcher,
            manager,
        }
    }

    /// 書き込みトラップを模擬する
    pub fn trap(&self, tid: ThreadId, pc: u64) -> mimamori_target::TrapDisposition {
        self.dispatcher.dispatch(&TrapEvent {
            kind: TrapKind::Breakpoint,
            pc,
            tid,
        })
    }

    pub fn armed(&self, tid: ThreadId) -> Option<bool> {
        self.manager
            .tracked_threads()
            .iter()
            .find(|t| t.tid == tid)
            .map(|t| t.armed)
    }
}

pub fn programmed(address: u64, size: usize, access: AccessKind) -> Option<Programmed> {
    Some(Programmed { address, size, access })
}
