//! ウォッチポイントマネージャのテスト

mod common;

use common::{programmed, Harness};
use mimamori_core::{AccessKind, ThreadSelection, TrapDisposition, TrapEvent, TrapKind, WatchError, WATCH_SLOT};
use regex::Regex;

fn game_thread_only() -> ThreadSelection {
    ThreadSelection::ByName("GameThread".to_string())
}

#[test]
fn test_end_to_end_trap_and_rearm() {
    let h = Harness::new(&[(1, "GameThread")], game_thread_only());

    let report = h.manager.install(0x1000, 4, AccessKind::Write).unwrap();
    assert_eq!(report.armed, vec![1]);
    assert!(report.failed.is_empty());
    assert_eq!(h.facility.slot(1, WATCH_SLOT), programmed(0x1000, 4, AccessKind::Write));

    // トラップ: ハンドラは処理済みを返し、スロットは解除され、再設定要求が立つ
    assert_eq!(h.trap(1, 0x2000), TrapDisposition::Handled);
    assert_eq!(h.armed(1), Some(false));
    assert!(h.manager.rearm_pending());
    assert_eq!(h.facility.slot(1, WATCH_SLOT), None);

    // スイープ: 再設定され、要求フラグが下りる
    let sweep = h.manager.sweep();
    assert_eq!(sweep.rearmed, vec![1]);
    assert_eq!(h.armed(1), Some(true));
    assert!(!h.manager.rearm_pending());
    assert_eq!(h.facility.slot(1, WATCH_SLOT), programmed(0x1000, 4, AccessKind::Write));
}

#[test]
fn test_repeated_traps_rearm_idempotently() {
    let h = Harness::new(&[(1, "GameThread"), (2, "GameThread")], game_thread_only());
    h.manager.install(0x1000, 4, AccessKind::Write).unwrap();

    for i in 0..5 {
        assert_eq!(h.trap(1, 0x2000 + i), TrapDisposition::Handled);
        h.manager.sweep();
    }

    assert_eq!(h.armed(1), Some(true));
    assert_eq!(h.armed(2), Some(true));
    assert_eq!(h.facility.slot(1, WATCH_SLOT), programmed(0x1000, 4, AccessKind::Write));
    // 古いスロットが溜まっていない
    assert_eq!(h.facility.programmed_count(), 2);
    assert_eq!(h.facility.set_calls(1), 6);
}

#[test]
fn test_trap_while_disarmed_is_not_handled() {
    let h = Harness::new(&[(1, "GameThread")], game_thread_only());
    h.manager.install(0x1000, 4, AccessKind::Write).unwrap();

    assert_eq!(h.trap(1, 0x2000), TrapDisposition::Handled);
    // 再設定前の同じスレッドからのトラップはウォッチポイント由来ではない
    assert_eq!(h.trap(1, 0x2004), TrapDisposition::NotHandled);

    h.manager.sweep();
    assert_eq!(h.trap(1, 0x2008), TrapDisposition::Handled);
}

#[test]
fn test_arm_failure_is_isolated() {
    let h = Harness::new(&[(1, "T"), (2, "T"), (3, "T")], ThreadSelection::All);
    h.facility.fail_set(2, WatchError::SlotUnavailable { slot: 0 });

    let report = h.manager.install(0x1000, 4, AccessKind::Write).unwrap();
    assert_eq!(report.armed, vec![1, 3]);
    assert_eq!(report.failed, vec![(2, WatchError::SlotUnavailable { slot: 0 })]);

    assert_eq!(h.armed(1), Some(true));
    assert_eq!(h.armed(2), Some(false));
    assert_eq!(h.armed(3), Some(true));
    assert!(h.facility.slot(1, WATCH_SLOT).is_some());
    assert!(h.facility.slot(3, WATCH_SLOT).is_some());
}

#[test]
fn test_install_failed_thread_is_skipped_by_sweep() {
    let h = Harness::new(&[(1, "T"), (2, "T")], ThreadSelection::All);
    h.facility.fail_set(2, WatchError::PermissionDenied { tid: 2 });
    h.manager.install(0x1000, 4, AccessKind::Write).unwrap();
    h.facility.allow_set(2);

    h.trap(1, 0x2000);
    let sweep = h.manager.sweep();
    assert_eq!(sweep.rearmed, vec![1]);
    assert_eq!(h.armed(2), Some(false));
    assert_eq!(h.facility.set_calls(2), 1);

    // 新しいinstallでやり直される
    let report = h.manager.install(0x1000, 4, AccessKind::Write).unwrap();
    assert_eq!(report.armed, vec![1, 2]);
}

#[test]
fn test_rearm_failure_is_retried_on_next_sweep() {
    let h = Harness::new(&[(1, "T"), (2, "T")], ThreadSelection::All);
    h.manager.install(0x1000, 4, AccessKind::Write).unwrap();

    h.trap(1, 0x2000);
    h.trap(2, 0x2000);
    h.facility.fail_set(1, WatchError::SlotUnavailable { slot: 0 });

    let sweep = h.manager.sweep();
    assert_eq!(sweep.rearmed, vec![2]);
    assert_eq!(sweep.failed.len(), 1);
    // 結果に関わらず要求フラグは下りる
    assert!(!h.manager.rearm_pending());
    assert_eq!(h.armed(1), Some(false));

    h.facility.allow_set(1);
    h.trap(2, 0x2000);
    let sweep = h.manager.sweep();
    assert_eq!(sweep.rearmed, vec![1, 2]);
}

#[test]
fn test_last_install_wins() {
    let h = Harness::new(&[(1, "T"), (2, "T")], ThreadSelection::All);
    h.manager.install(0x1000, 4, AccessKind::Write).unwrap();
    h.manager.install(0x3000, 8, AccessKind::ReadWrite).unwrap();
    h.manager.sweep();

    for tid in [1, 2] {
        assert_eq!(h.armed(tid), Some(true));
        assert_eq!(h.facility.slot(tid, WATCH_SLOT), programmed(0x3000, 8, AccessKind::ReadWrite));
    }
}

#[test]
fn test_sweep_uses_current_request_after_reinstall() {
    let h = Harness::new(&[(1, "T"), (2, "T")], ThreadSelection::All);
    h.facility.fail_set(2, WatchError::PermissionDenied { tid: 2 });
    h.manager.install(0x1000, 4, AccessKind::Write).unwrap();

    h.trap(1, 0x2000);
    h.manager.install(0x3000, 2, AccessKind::Read).unwrap();
    h.trap(1, 0x2000);
    h.manager.sweep();

    assert_eq!(h.facility.slot(1, WATCH_SLOT), programmed(0x3000, 2, AccessKind::Read));
    assert_eq!(h.manager.request().map(|r| r.address), Some(0x3000));
}

#[test]
fn test_reinstall_clears_threads_dropped_from_snapshot() {
    let h = Harness::new(&[(1, "T"), (2, "T")], ThreadSelection::All);
    h.manager.install(0x1000, 4, AccessKind::Write).unwrap();

    h.enumerator.set_threads(&[(2, "T")]);
    h.manager.install(0x1000, 4, AccessKind::Write).unwrap();

    assert_eq!(h.facility.slot(1, WATCH_SLOT), None);
    assert!(h.facility.slot(2, WATCH_SLOT).is_some());
    assert_eq!(h.armed(1), None);
}

#[test]
fn test_reinstall_arm_failure_clears_previous_watch() {
    let h = Harness::new(&[(1, "T"), (2, "T")], ThreadSelection::All);
    h.manager.install(0x1000, 4, AccessKind::Write).unwrap();

    h.facility
        .fail_set(1, WatchError::UnsupportedSize { address: 0x3001, size: 4 });
    let report = h.manager.install(0x3001, 4, AccessKind::Write).unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, 1);

    // 古いアドレスのウォッチが残っていない
    assert_eq!(h.facility.slot(1, WATCH_SLOT), None);
    assert_eq!(h.armed(1), Some(false));
    assert_eq!(h.trap(1, 0x2000), TrapDisposition::NotHandled);

    // 失敗したスレッドはスイープでも再設定しない
    assert!(h.manager.sweep().is_empty());
    assert_eq!(h.facility.slot(1, WATCH_SLOT), None);
    assert_eq!(h.armed(2), Some(true));
}

#[test]
fn test_reinstall_arm_failure_with_clear_failure_keeps_thread_armed() {
    let h = Harness::new(&[(1, "T")], ThreadSelection::All);
    h.manager.install(0x1000, 4, AccessKind::Write).unwrap();

    h.facility.fail_set(1, WatchError::PermissionDenied { tid: 1 });
    h.facility.fail_clear(1);
    h.manager.install(0x2000, 4, AccessKind::Write).unwrap();

    // スロットがまだ使われているのでトラップ時に外せるようにしておく
    assert_eq!(h.facility.slot(1, WATCH_SLOT), programmed(0x1000, 4, AccessKind::Write));
    assert_eq!(h.armed(1), Some(true));
    assert_eq!(h.manager.uninstall(), 1);
}

#[test]
fn test_thread_snapshot_is_not_refreshed() {
    let h = Harness::new(&[(1, "T")], ThreadSelection::All);
    h.manager.install(0x1000, 4, AccessKind::Write).unwrap();

    h.enumerator.set_threads(&[(1, "T"), (9, "T")]);
    h.trap(1, 0x2000);
    h.manager.sweep();

    assert_eq!(h.manager.tracked_threads().len(), 1);
    assert_eq!(h.facility.slot(9, WATCH_SLOT), None);
}

#[test]
fn test_selection_by_name_and_all() {
    let threads = [(1, "GameThread"), (2, "RenderThread")];

    let h = Harness::new(&threads, game_thread_only());
    h.manager.install(0x1000, 4, AccessKind::Write).unwrap();
    let tracked: Vec<_> = h.manager.tracked_threads().iter().map(|t| t.tid).collect();
    assert_eq!(tracked, vec![1]);

    let h = Harness::new(&threads, ThreadSelection::All);
    h.manager.install(0x1000, 4, AccessKind::Write).unwrap();
    let tracked: Vec<_> = h.manager.tracked_threads().iter().map(|t| t.tid).collect();
    assert_eq!(tracked, vec![1, 2]);

    let h = Harness::new(&threads, ThreadSelection::Matching(Regex::new("Render").unwrap()));
    h.manager.install(0x1000, 4, AccessKind::Write).unwrap();
    let tracked: Vec<_> = h.manager.tracked_threads().iter().map(|t| t.tid).collect();
    assert_eq!(tracked, vec![2]);
}

#[test]
fn test_enumeration_failure_keeps_previous_state() {
    let h = Harness::new(&[(1, "T")], ThreadSelection::All);
    h.manager.install(0x1000, 4, AccessKind::Write).unwrap();

    h.enumerator.fail();
    assert!(h.manager.install(0x3000, 4, AccessKind::Write).is_err());
    assert_eq!(h.manager.request().map(|r| r.address), Some(0x1000));
    assert_eq!(h.armed(1), Some(true));
}

#[test]
fn test_trap_kinds() {
    let h = Harness::new(&[(1, "T")], ThreadSelection::All);
    h.manager.install(0x1000, 4, AccessKind::Write).unwrap();

    let other = TrapEvent {
        kind: TrapKind::Other,
        pc: 0x2000,
        tid: 1,
    };
    assert_eq!(h.dispatcher.dispatch(&other), TrapDisposition::NotHandled);
    assert_eq!(h.armed(1), Some(true));
    assert!(!h.manager.rearm_pending());

    let step = TrapEvent {
        kind: TrapKind::SingleStep,
        ..other
    };
    assert_eq!(h.dispatcher.dispatch(&step), TrapDisposition::Handled);
    assert_eq!(h.armed(1), Some(false));
}

#[test]
fn test_trap_from_untracked_thread() {
    let h = Harness::new(&[(1, "GameThread"), (2, "RenderThread")], game_thread_only());
    h.manager.install(0x1000, 4, AccessKind::Write).unwrap();

    assert_eq!(h.trap(2, 0x2000), TrapDisposition::NotHandled);
    assert_eq!(h.armed(1), Some(true));
    assert!(!h.manager.rearm_pending());
}

#[test]
fn test_only_faulting_thread_is_disarmed() {
    let h = Harness::new(&[(1, "T"), (2, "T"), (3, "T")], ThreadSelection::All);
    h.manager.install(0x1000, 4, AccessKind::Write).unwrap();

    h.trap(2, 0x2000);
    assert_eq!(h.armed(1), Some(true));
    assert_eq!(h.armed(2), Some(false));
    assert_eq!(h.armed(3), Some(true));
    assert!(h.facility.slot(1, WATCH_SLOT).is_some());
    assert!(h.facility.slot(3, WATCH_SLOT).is_some());
}

#[test]
fn test_clear_failure_is_not_handled() {
    let h = Harness::new(&[(1, "T")], ThreadSelection::All);
    h.manager.install(0x1000, 4, AccessKind::Write).unwrap();
    h.facility.fail_clear(1);

    assert_eq!(h.trap(1, 0x2000), TrapDisposition::NotHandled);
    assert_eq!(h.armed(1), Some(true));
    assert!(!h.manager.rearm_pending());
}

#[test]
fn test_panic_in_handler_is_contained() {
    let h = Harness::new(&[(1, "T")], ThreadSelection::All);
    h.manager.install(0x1000, 4, AccessKind::Write).unwrap();
    h.facility.panic_on_clear();

    assert_eq!(h.trap(1, 0x2000), TrapDisposition::NotHandled);

    // ロックがポイズンされてもマネージャは使い続けられる
    assert_eq!(h.armed(1), Some(true));
    assert!(h.manager.is_installed());
}

#[test]
fn test_trap_before_install_is_not_handled() {
    let h = Harness::new(&[(1, "T")], ThreadSelection::All);
    assert_eq!(h.trap(1, 0x2000), TrapDisposition::NotHandled);
    assert!(h.manager.sweep().is_empty());
}

#[test]
fn test_sweep_without_pending_is_noop() {
    let h = Harness::new(&[(1, "T")], ThreadSelection::All);
    h.manager.install(0x1000, 4, AccessKind::Write).unwrap();

    assert!(h.manager.sweep().is_empty());
    assert_eq!(h.facility.set_calls(1), 1);
}

#[test]
fn test_uninstall() {
    let h = Harness::new(&[(1, "T"), (2, "T")], ThreadSelection::All);
    h.manager.install(0x1000, 4, AccessKind::Write).unwrap();
    h.trap(2, 0x2000);
    assert!(h.dispatcher.is_registered());

    // 解除済みのスレッド2は数えない
    assert_eq!(h.manager.uninstall(), 1);
    assert!(!h.dispatcher.is_registered());
    assert_eq!(h.facility.programmed_count(), 0);
    assert!(!h.manager.is_installed());
    assert!(h.manager.tracked_threads().is_empty());
    assert!(!h.manager.rearm_pending());

    assert_eq!(h.trap(1, 0x2000), TrapDisposition::NotHandled);
    assert!(h.manager.sweep().is_empty());

    // 2回目は何もしない
    assert_eq!(h.manager.uninstall(), 0);
}

#[test]
fn test_uninstall_without_install_keeps_foreign_handler() {
    let h = Harness::new(&[(1, "T")], ThreadSelection::All);
    let other = Harness::new(&[(1, "T")], ThreadSelection::All);
    other.manager.install(0x1000, 4, AccessKind::Write).unwrap();

    // 別の dispatcher を使うマネージャの uninstall は影響しない
    assert_eq!(h.manager.uninstall(), 0);
    assert!(other.dispatcher.is_registered());
}

#[test]
fn test_uninstall_while_rearm_pending() {
    let h = Harness::new(&[(1, "T"), (2, "T")], ThreadSelection::All);
    h.manager.install(0x1000, 4, AccessKind::Write).unwrap();
    assert_eq!(h.trap(1, 0x2000), TrapDisposition::Handled);
    assert!(h.manager.rearm_pending());

    assert_eq!(h.manager.uninstall(), 1);
    assert!(!h.manager.rearm_pending());
    assert_eq!(h.facility.programmed_count(), 0);

    // 保留中だった再設定は実行されない
    assert!(h.manager.sweep().is_empty());
    assert_eq!(h.facility.programmed_count(), 0);
    assert_eq!(h.facility.set_calls(1), 1);
}
