use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use rchess_uci_client::EngineLink;

/// 1 局面分の応答台本。
pub struct Script {
    /// go に対して流す info 行
    pub lines: Vec<String>,
    /// 探索を締めくくる行 ("bestmove ..." 丸ごと)
    pub bestmove: String,
    /// true なら bestmove を stop 受信まで保留する（長考のシミュレーション）
    pub hold_until_stop: bool,
}

impl Script {
    pub fn immediate(lines: &[&str], bestmove: &str) -> Self {
        Self {
            lines: lines.iter().map(|s| s.to_string()).collect(),
            bestmove: bestmove.to_string(),
            hold_until_stop: false,
        }
    }

    pub fn held(lines: &[&str], bestmove: &str) -> Self {
        Self {
            hold_until_stop: true,
            ..Self::immediate(lines, bestmove)
        }
    }
}

/// 台本どおりに応答する偽エンジン。送られたコマンドを全て記録する。
pub struct ScriptedEngine {
    scripts: Mutex<HashMap<String, Script>>,
    current_fen: Mutex<Option<String>>,
    held_reply: Mutex<Option<String>>,
    sent: Mutex<Vec<String>>,
    tx: Mutex<Sender<String>>,
    rx: Mutex<Receiver<String>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            scripts: Mutex::new(HashMap::new()),
            current_fen: Mutex::new(None),
            held_reply: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
        }
    }

    pub fn script(&self, fen: &str, script: Script) {
        self.scripts.lock().unwrap().insert(fen.to_string(), script);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count_sent(&self, prefix: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }

    fn emit(&self, line: &str) {
        let _ = self.tx.lock().unwrap().send(line.to_string());
    }
}

impl EngineLink for ScriptedEngine {
    fn send(&self, line: &str) {
        self.sent.lock().unwrap().push(line.to_string());
        if line == "isready" {
            self.emit("readyok");
            return;
        }
        if let Some(fen) = line.strip_prefix("position fen ") {
            *self.current_fen.lock().unwrap() = Some(fen.to_string());
            return;
        }
        if line.starts_with("go") {
            let fen = self.current_fen.lock().unwrap().clone().unwrap_or_default();
            let scripts = self.scripts.lock().unwrap();
            match scripts.get(&fen) {
                Some(script) => {
                    for info in &script.lines {
                        self.emit(info);
                    }
                    if script.hold_until_stop {
                        *self.held_reply.lock().unwrap() = Some(script.bestmove.clone());
                    } else {
                        self.emit(&script.bestmove);
                    }
                }
                None => self.emit("bestmove (none)"),
            }
            return;
        }
        if line == "stop" {
            if let Some(reply) = self.held_reply.lock().unwrap().take() {
                self.emit(&reply);
            }
        }
        // setoption / ucinewgame には応答しない
    }

    fn recv_line(&self, timeout: Duration) -> Option<String> {
        self.rx.lock().unwrap().recv_timeout(timeout).ok()
    }
}
