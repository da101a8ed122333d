//! レジスタアクセス機能

use crate::Result;
use nix::libc::{c_long, c_void};
use nix::sys::ptrace;
use nix::unistd::Pid;
use std::mem;

/// struct user 内の u_debugreg[0] のオフセット
const DEBUGREG_OFFSET: usize = mem::offset_of!(nix::libc::user, u_debugreg);

/// スレッド単位のレジスタアクセス
///
/// 対象スレッドはptraceで停止している必要があります。
pub struct Registers {
    tid: Pid,
}

impl Registers {
    /// レジスタアクセスを作成する
    pub fn new(tid: i32) -> Self {
        Self {
            tid: Pid::from_raw(tid),
        }
    }

    /// 汎用レジスタを読み取る
    pub fn read(&self) -> Result<nix::libc::user_regs_struct> {
        let regs = ptrace::getregs(self.tid)?;
        Ok(regs)
    }

    /// プログラムカウンタ（RIP）を取得する
    pub fn get_pc(&self) -> Result<u64> {
        let regs = self.read()?;
        Ok(regs.rip)
    }

    /// デバッグレジスタ DR`index` を読み取る
    pub fn read_debugreg(&self, index: usize) -> nix::Result<u64> {
        let value = ptrace::read_user(self.tid, Self::debugreg_offset(index))?;
        Ok(value as u64)
    }

    /// デバッグレジスタ DR`index` に書き込む
    pub fn write_debugreg(&self, index: usize, value: u64) -> nix::Result<()> {
        ptrace::write_user(self.tid, Self::debugreg_offset(index), value as c_long)
    }

    fn debugreg_offset(index: usize) -> *mut c_void {
        (DEBUGREG_OFFSET + index * mem::size_of::<u64>()) as *mut c_void
    }
}
