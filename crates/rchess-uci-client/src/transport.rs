use std::collections::HashSet;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use log::{debug, warn};

use crate::strength::skill_level;

pub const ENGINE_READY_TIMEOUT: Duration = Duration::from_secs(30);
pub const ENGINE_QUIT_TIMEOUT: Duration = Duration::from_millis(300);
pub const ENGINE_QUIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// エンジンが UCI_Elo で受け付けるレーティングの下限。
/// これ未満の設定値はここへクランプして送る。
pub const ENGINE_ELO_FLOOR: u32 = 1320;

/// エンジンプロセス起動時の設定。
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub path: PathBuf,
    pub args: Vec<String>,
    /// `go movetime` に渡す思考時間 (ms)
    pub think_time_ms: u64,
    /// ranked リクエストで要求する並列ライン数
    pub multipv_lines: usize,
    /// 対戦相手として想定するレーティング。UCI_Elo / Skill Level に写像される。
    pub rating: u32,
    /// 追加の UCI オプション (Name=Value 形式)
    pub uci_options: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("stockfish"),
            args: Vec::new(),
            think_time_ms: 1000,
            multipv_lines: 3,
            rating: 1600,
            uci_options: Vec::new(),
        }
    }
}

/// コーディネータから見たエンジンとの境界。
/// 実運用は [`UciTransport`]、テストはスクリプト実装を差し込む。
pub trait EngineLink: Send + Sync {
    /// コマンド 1 行を送る。終了済みのエンジンに対しては黙って no-op。
    fn send(&self, line: &str);
    /// 次の応答行を受け取る。タイムアウト・切断時は None。
    fn recv_line(&self, timeout: Duration) -> Option<String>;
}

/// 1 本のエンジンプロセスに対する入出力をカプセル化する。
///
/// プロセスと 1:1 対応し、交換はプロセスの破棄と新規構築で行う。
/// 引退したトランスポート宛ての送信は無視され、読み残しの行は
/// 誰にもルーティングされずチャネルごと破棄される。
pub struct UciTransport {
    child: Mutex<Child>,
    stdin: Mutex<Option<BufWriter<ChildStdin>>>,
    rx: Mutex<Receiver<String>>,
    opt_names: HashSet<String>,
    label: String,
}

impl UciTransport {
    pub fn spawn(cfg: &EngineConfig) -> Result<Self> {
        let mut cmd = Command::new(&cfg.path);
        if !cfg.args.is_empty() {
            cmd.args(&cfg.args);
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn engine at {}", cfg.path.display()))?;
        let stdin = child.stdin.take().context("engine stdin unavailable")?;
        let stdout = child.stdout.take().context("engine stdout unavailable")?;
        let (tx, rx) = mpsc::channel::<String>();
        thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        let label = cfg
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "engine".to_string());
        let mut transport = Self {
            child: Mutex::new(child),
            stdin: Mutex::new(Some(BufWriter::new(stdin))),
            rx: Mutex::new(rx),
            opt_names: HashSet::new(),
            label,
        };
        transport.initialize(cfg)?;
        Ok(transport)
    }

    /// uci ハンドシェイクで広告されたオプション名を回収しつつ、
    /// 固定オプション群と強さ設定を流し込む。
    fn initialize(&mut self, cfg: &EngineConfig) -> Result<()> {
        self.send_line("uci");
        let deadline = Instant::now() + ENGINE_READY_TIMEOUT;
        loop {
            let line = self.recv_until(deadline)?;
            if let Some(rest) = line.strip_prefix("option ") {
                if let Some(name) = parse_option_name(rest) {
                    self.opt_names.insert(name);
                }
            } else if line == "uciok" {
                break;
            }
        }
        self.set_option_if_available("Threads", "1");
        self.set_option_if_available("UCI_LimitStrength", "true");
        self.set_option_if_available("UCI_Elo", &cfg.rating.max(ENGINE_ELO_FLOOR).to_string());
        self.set_option_if_available("Skill Level", &skill_level(cfg.rating).to_string());
        for opt in &cfg.uci_options {
            if let Some((name, value)) = opt.split_once('=') {
                self.set_option_if_available(name.trim(), value.trim());
            } else {
                // "=" がない場合はオプション名のみとみなし、値なしで送る
                self.send_line(&format!("setoption name {}", opt.trim()));
            }
        }
        self.send_line("isready");
        loop {
            if self.recv_until(deadline)? == "readyok" {
                break;
            }
        }
        self.send_line("ucinewgame");
        Ok(())
    }

    /// 広告されたオプションだけを setoption する。広告リストが空
    /// （ハンドシェイク前）の場合は無条件で送る。
    pub fn set_option_if_available(&self, name: &str, value: &str) {
        if option_allowed(&self.opt_names, name) {
            self.send_line(&format!("setoption name {name} value {value}"));
        } else {
            debug!("{}: option '{}' not advertised, skipping", self.label, name);
        }
    }

    fn send_line(&self, msg: &str) {
        let mut slot = self.stdin.lock().unwrap();
        let Some(writer) = slot.as_mut() else {
            return;
        };
        let written = writer
            .write_all(msg.as_bytes())
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush());
        if written.is_err() {
            // プロセス消滅。以後の send は no-op になる。
            warn!("{}: engine stdin closed, dropping '{}'", self.label, msg);
            *slot = None;
        }
    }

    fn recv_until(&self, deadline: Instant) -> Result<String> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.rx.lock().unwrap().recv_timeout(remaining) {
            Ok(line) => Ok(line),
            Err(_) => bail!("{}: engine read timeout during handshake", self.label),
        }
    }
}

impl EngineLink for UciTransport {
    fn send(&self, line: &str) {
        self.send_line(line);
    }

    fn recv_line(&self, timeout: Duration) -> Option<String> {
        self.rx.lock().unwrap().recv_timeout(timeout).ok()
    }
}

impl Drop for UciTransport {
    fn drop(&mut self) {
        self.send_line("quit");
        let deadline = Instant::now() + ENGINE_QUIT_TIMEOUT;
        let mut child = self.child.lock().unwrap();
        while Instant::now() < deadline {
            if let Ok(Some(_)) = child.try_wait() {
                return;
            }
            thread::sleep(ENGINE_QUIT_POLL_INTERVAL);
        }
        let _ = child.kill();
        let _ = child.wait();
    }
}

fn option_allowed(advertised: &HashSet<String>, name: &str) -> bool {
    advertised.is_empty() || advertised.contains(name)
}

/// `option name <Name> type ...` 行からオプション名を取り出す。
pub fn parse_option_name(line: &str) -> Option<String> {
    let mut tokens = line.split_whitespace().peekable();
    while let Some(tok) = tokens.next() {
        if tok == "name" {
            let mut parts = Vec::new();
            while let Some(next) = tokens.peek() {
                if *next == "type" {
                    break;
                }
                parts.push(tokens.next().unwrap().to_string());
            }
            if !parts.is_empty() {
                return Some(parts.join(" "));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_option_name_handles_multiword_names() {
        assert_eq!(
            parse_option_name("name Skill Level type spin default 20 min 0 max 20"),
            Some("Skill Level".to_string())
        );
        assert_eq!(
            parse_option_name("name MultiPV type spin default 1 min 1 max 500"),
            Some("MultiPV".to_string())
        );
        assert_eq!(parse_option_name("type spin default 1"), None);
    }

    #[test]
    fn options_are_filtered_by_advertised_names() {
        let advertised: HashSet<String> =
            ["MultiPV".to_string(), "Skill Level".to_string()].into();
        assert!(option_allowed(&advertised, "MultiPV"));
        assert!(option_allowed(&advertised, "Skill Level"));
        assert!(!option_allowed(&advertised, "UCI_Elo"));
        // ハンドシェイク前（広告リスト未回収）は無条件に通す
        assert!(option_allowed(&HashSet::new(), "UCI_Elo"));
    }
}
