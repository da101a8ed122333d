//! ウォッチポイントの動作確認用のサンプルプログラム
//!
//! "GameThread" がコインを定期的に加算し、"RenderThread" がそれを読み取ります。
//! 表示されたPIDとアドレスを使って、次のように監視できます。
//!
//! ```text
//! mimamori watch --pid <PID> --address <ADDR> --size 4 --access w --thread-name GameThread
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// コインを保持するプレイヤー
#[repr(C)]
struct Player {
    _padding: [u8; 0x310],
    total_coins: AtomicU32,
}

/// コインを加算する
#[inline(never)]
fn add_coin(player: &Player, amount: u32) -> u32 {
    player.total_coins.fetch_add(amount, Ordering::SeqCst) + amount
}

fn main() {
    let player = Arc::new(Player {
        _padding: [0; 0x310],
        total_coins: AtomicU32::new(0),
    });

    println!("pid: {}", std::process::id());
    println!("player instance: {:p}", Arc::as_ptr(&player));
    println!("total_coins (instance + 0x310): {:p}", &player.total_coins);

    let game = {
        let player = player.clone();
        thread::Builder::new()
            .name("GameThread".to_string())
            .spawn(move || loop {
                let total = add_coin(&player, 1);
                println!("[GameThread] AddCoin() -> {}", total);
                thread::sleep(Duration::from_secs(1));
            })
            .expect("failed to spawn GameThread")
    };

    let render = {
        let player = player.clone();
        thread::Builder::new()
            .name("RenderThread".to_string())
            .spawn(move || loop {
                let _ = player.total_coins.load(Ordering::SeqCst);
                thread::sleep(Duration::from_millis(500));
            })
            .expect("failed to spawn RenderThread")
    };

    let _ = game.join();
    let _ = render.join();
}
