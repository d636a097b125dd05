use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Result, anyhow};
use log::debug;
use rchess_uci_client::{EngineCoordinator, RequestOutcome, Suggestion};

use crate::timeline::{ReplayError, TimelineEntry, build_timeline, clamp_index, sanitize_moves};

/// タイムライン上のカーソルと候補手ロードを束ねる対話セッション。
///
/// ナビゲーションは即座に戻り、候補手のロードはバックグラウンドで
/// コーディネータに委ねる。連打されたナビゲーションの整合性は
/// コーディネータの世代機構が面倒を見るため、ここでは最後に発行した
/// ロードだけを覚えておけばよい。
pub struct AnalysisSession {
    coordinator: Arc<EngineCoordinator>,
    timeline: Vec<TimelineEntry>,
    cursor: usize,
    pending: Option<JoinHandle<Result<RequestOutcome<Vec<Suggestion>>>>>,
}

impl std::fmt::Debug for AnalysisSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisSession")
            .field("cursor", &self.cursor)
            .field("timeline_len", &self.timeline.len())
            .finish_non_exhaustive()
    }
}

impl AnalysisSession {
    /// 手順をリプレイしてセッションを開く。壊れた手順はエラー。
    pub fn new<S: AsRef<str>>(
        coordinator: Arc<EngineCoordinator>,
        moves: &[S],
    ) -> Result<Self, ReplayError> {
        Ok(Self {
            coordinator,
            timeline: build_timeline(moves)?,
            cursor: 0,
            pending: None,
        })
    }

    /// 外部由来の（信頼できない）手順からセッションを開く。
    /// 壊れた位置以降は切り捨てられ、構築自体は必ず成功する。
    pub fn new_sanitized<S: AsRef<str>>(coordinator: Arc<EngineCoordinator>, moves: &[S]) -> Self {
        let cleaned = sanitize_moves(moves);
        let timeline =
            build_timeline(&cleaned).expect("sanitized history always replays cleanly");
        Self {
            coordinator,
            timeline,
            cursor: 0,
            pending: None,
        }
    }

    pub fn timeline(&self) -> &[TimelineEntry] {
        &self.timeline
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn current_entry(&self) -> &TimelineEntry {
        &self.timeline[self.cursor]
    }

    /// 指定インデックスへ移動し、その局面の候補手ロードを発行する。
    /// 範囲外のインデックスは両端へ丸める。移動自体はブロックしない。
    pub fn navigate_to(&mut self, index: usize) -> &TimelineEntry {
        self.cursor = clamp_index(&self.timeline, index);
        let fen = self.timeline[self.cursor].position.clone();
        debug!("navigate to ply {} ({fen})", self.cursor);
        // ナビゲーション順はこのスレッドで確定させ、ロード本体だけを
        // ワーカーへ逃がす。前回のロードが残っていても待たずに
        // 差し替える。遅れて走った古いワーカーは stale として扱われる。
        let generation = self.coordinator.begin_navigation(&fen);
        let coordinator = self.coordinator.clone();
        self.pending = Some(thread::spawn(move || {
            coordinator.load_suggestions_at(&fen, generation)
        }));
        &self.timeline[self.cursor]
    }

    pub fn step_forward(&mut self) -> &TimelineEntry {
        self.navigate_to(self.cursor.saturating_add(1))
    }

    pub fn step_back(&mut self) -> &TimelineEntry {
        self.navigate_to(self.cursor.saturating_sub(1))
    }

    /// 直近に発行したロードの完了を待つ。発行済みのロードがなければ
    /// 現在局面について観測済みの候補をそのまま返す。
    pub fn wait_for_suggestions(&mut self) -> Result<RequestOutcome<Vec<Suggestion>>> {
        match self.pending.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("suggestion loader panicked"))?,
            None => {
                let current = self
                    .coordinator
                    .current_suggestions()
                    .filter(|(fen, _)| *fen == self.current_entry().position)
                    .map(|(_, suggestions)| suggestions)
                    .unwrap_or_default();
                Ok(RequestOutcome::Fresh(current))
            }
        }
    }

    /// タイムラインを新しい手順で作り直し、エンジン側の解析状態も
    /// リセットする。
    pub fn start_new_game<S: AsRef<str>>(&mut self, moves: &[S]) -> Result<()> {
        let cleaned = sanitize_moves(moves);
        self.timeline =
            build_timeline(&cleaned).expect("sanitized history always replays cleanly");
        self.cursor = 0;
        self.pending = None;
        self.coordinator.new_game()
    }
}
