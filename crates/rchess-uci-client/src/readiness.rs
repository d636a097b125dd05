use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};

use crate::transport::EngineLink;

pub const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const READY_POLL_SLICE: Duration = Duration::from_millis(50);

/// isready/readyok ハンドシェイクを待機可能なバリアへ変換する。
///
/// readyok 1 回で登録済みの待機者全員を起こす（応答 1 行 = 待機者 1 人
/// ではない）。リストの drain と通知は 1 つのロック区間で行う。
#[derive(Default)]
pub struct ReadinessGate {
    waiters: Mutex<Vec<Sender<()>>>,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribe(&self) -> Receiver<()> {
        let (tx, rx) = mpsc::channel();
        self.waiters.lock().unwrap().push(tx);
        rx
    }

    /// readyok を観測した側が呼ぶ。待機者リストを一括で空にして通知する。
    pub fn signal_ready(&self) {
        let mut waiters = self.waiters.lock().unwrap();
        for waiter in waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    /// readiness probe を送り、次の readyok まで待つ。
    /// エンジン未接続なら空虚に ready 扱いで即座に戻る。
    pub fn wait_ready(&self, link: Option<&dyn EngineLink>) -> Result<()> {
        let Some(link) = link else {
            return Ok(());
        };
        let woken = self.subscribe();
        link.send("isready");
        let deadline = Instant::now() + READY_PROBE_TIMEOUT;
        loop {
            if woken.try_recv().is_ok() {
                return Ok(());
            }
            match link.recv_line(READY_POLL_SLICE) {
                Some(line) if line == "readyok" => {
                    // 自分もリストに入っているので一緒に drain される
                    self.signal_ready();
                    return Ok(());
                }
                // 期待外の行はプロトコル desync として捨てて続行
                Some(_) => {}
                None => {
                    if Instant::now() >= deadline {
                        bail!("engine never acknowledged readiness probe");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_ready_without_engine_is_vacuous() {
        let gate = ReadinessGate::new();
        assert!(gate.wait_ready(None).is_ok());
    }

    #[test]
    fn single_signal_drains_every_waiter() {
        let gate = ReadinessGate::new();
        let first = gate.subscribe();
        let second = gate.subscribe();
        gate.signal_ready();
        assert!(first.try_recv().is_ok());
        assert!(second.try_recv().is_ok());
        // リストは空になっているため、2 回目の signal で二重に起きない
        gate.signal_ready();
        assert!(first.try_recv().is_err());
        assert!(second.try_recv().is_err());
    }
}
