//! x86-64 デバッグレジスタ（DR0-DR3, DR6, DR7）のエンコード
//!
//! DR7のレイアウト:
//! - ビット `2*n`: スロットnのローカル有効化
//! - ビット `16+4*n` から2ビット: アクセス条件（RW）
//! - ビット `18+4*n` から2ビット: 監視長（LEN）
//!
//! DR6のビット0-3はどのスロットが発火したかを、ビット14はシングルステップを示します。

use crate::breakpoint::{AccessKind, WatchError};
use crate::trap::TrapKind;

/// ハードウェアスロット数（DR0-DR3）
pub const SLOT_COUNT: usize = 4;

/// ステータスレジスタのインデックス
pub const DR6: usize = 6;

/// 制御レジスタのインデックス
pub const DR7: usize = 7;

const DR6_SLOT_MASK: u64 = 0b1111;
const DR6_SINGLE_STEP: u64 = 1 << 14;

const RW_EXECUTE: u64 = 0b00;
const RW_WRITE: u64 = 0b01;
const RW_READ_WRITE: u64 = 0b11;

/// 監視長をLENビットに変換する
pub fn len_bits(size: usize) -> Option<u64> {
    match size {
        1 => Some(0b00),
        2 => Some(0b01),
        4 => Some(0b11),
        8 => Some(0b10),
        _ => None,
    }
}

/// アクセス条件をRWビットに変換する
///
/// x86には読み取り専用の条件がないため、`Read` は読み書きとして扱われます。
pub fn rw_bits(access: AccessKind) -> u64 {
    match access {
        AccessKind::Execute => RW_EXECUTE,
        AccessKind::Write => RW_WRITE,
        AccessKind::Read | AccessKind::ReadWrite => RW_READ_WRITE,
    }
}

/// スロット・アドレス・サイズ・条件がハードウェアで表現可能か検証する
pub fn validate(slot: usize, address: u64, size: usize, access: AccessKind) -> Result<(), WatchError> {
    if slot >= SLOT_COUNT {
        return Err(WatchError::SlotUnavailable { slot });
    }

    let unsupported = || WatchError::UnsupportedSize { address, size };
    len_bits(size).ok_or_else(unsupported)?;

    // アドレスはサイズ境界に揃っている必要がある
    if address % size as u64 != 0 {
        return Err(unsupported());
    }

    // 実行ブレークポイントは長さ1のみ
    if access == AccessKind::Execute && size != 1 {
        return Err(unsupported());
    }

    Ok(())
}

/// DR7のうち指定スロットに関係するビットのマスク
fn slot_mask(slot: usize) -> u64 {
    (0b1 << (slot * 2)) | (0b1111 << (16 + slot * 4))
}

/// 指定スロットを有効化したDR7の値を計算する
///
/// 事前に [`validate`] で検証済みであることを前提とします。
pub fn enable(dr7: u64, slot: usize, size: usize, access: AccessKind) -> u64 {
    let len = len_bits(size).unwrap_or(0b00);
    let rw = rw_bits(access);

    (dr7 & !slot_mask(slot))
        | (0b1 << (slot * 2))
        | (rw << (16 + slot * 4))
        | (len << (18 + slot * 4))
}

/// 指定スロットを無効化したDR7の値を計算する
pub fn disable(dr7: u64, slot: usize) -> u64 {
    dr7 & !slot_mask(slot)
}

/// 指定スロットがDR7で有効かどうか
pub fn is_enabled(dr7: u64, slot: usize) -> bool {
    dr7 & (0b1 << (slot * 2)) != 0
}

/// DR6から発火したスロットを取得する
pub fn triggered_slots(dr6: u64) -> Vec<usize> {
    (0..SLOT_COUNT)
        .filter(|slot| dr6 & DR6_SLOT_MASK & (1 << slot) != 0)
        .collect()
}

/// DR6からトラップの種類を判定する
pub fn classify(dr6: u64) -> TrapKind {
    if dr6 & DR6_SLOT_MASK != 0 {
        TrapKind::Breakpoint
    } else if dr6 & DR6_SINGLE_STEP != 0 {
        TrapKind::SingleStep
    } else {
        TrapKind::Other
    }
}
