use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, warn};
use shakmaty::fen::Fen;
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess};

use crate::cache::SuggestionCache;
use crate::readiness::ReadinessGate;
use crate::strength::{blunder_probability, pick_weakened_move};
use crate::suggestion::{SearchStats, Suggestion, compact_and_sort, parse_ranked_info};
use crate::transport::{EngineConfig, EngineLink, UciTransport};

/// ranked リクエストのデフォルト本数。
pub const DEFAULT_LINE_COUNT: usize = 3;

/// go 発行後に terminating reply を待つ余裕 (ms)。
/// 思考時間 + margin で stop を送り、さらに margin 経過で打ち切る。
const STOP_MARGIN_MS: u64 = 500;

/// busy 解除待ちの 1 スライス。世代の再確認を挟むために小刻みに起きる。
const IDLE_WAIT_SLICE: Duration = Duration::from_millis(25);

/// 鮮度付きの結果。計算中により新しい世代へ追い越された場合でも
/// 集まった分は best-effort で持ち帰る。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome<T> {
    Fresh(T),
    Superseded(T),
}

impl<T> RequestOutcome<T> {
    pub fn is_fresh(&self) -> bool {
        matches!(self, RequestOutcome::Fresh(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            RequestOutcome::Fresh(inner) | RequestOutcome::Superseded(inner) => inner,
        }
    }
}

/// ナビゲーション状態。ターゲットの更新と候補の公開は必ず同じ
/// ロックの下で行う。別々のロックに分けると「ターゲット確認」と
/// 「公開」の間に別スレッドのナビゲーションが割り込める。
#[derive(Default)]
struct NavState {
    /// UI が最後にナビゲートした局面。完了時の「まだこの局面を
    /// 見ているか」の判定に使う。
    target: Option<String>,
    /// 外部から観測される現在の候補手。最新のナビゲーションに
    /// 属するリクエストだけが上書きできる。
    current: Option<(String, Vec<Suggestion>)>,
}

/// エンジンへのリクエストを直列化する唯一の窓口。
///
/// 共有可変状態は全てここが所有する: 世代カウンタ、busy フラグ、
/// 排他交換ロック、候補キャッシュ、外部から観測される「現在の候補」。
/// 他のコンポーネントがこれらへ直接触れる経路は存在しない。
pub struct EngineCoordinator {
    link: RwLock<Option<Arc<dyn EngineLink>>>,
    gate: ReadinessGate,
    /// 単調増加の世代カウンタ。インクリメントそのものが飛行中の
    /// 旧世代リクエスト全ての無効化を意味する。
    generation: AtomicU64,
    /// go 発行〜terminating reply の間だけ true。
    busy: Mutex<bool>,
    /// bestmove 到着時に通知される。固定間隔ポーリングの置き換え。
    idle: Condvar,
    /// readiness → position → go → bestmove の排他区間。
    exchange_lock: Mutex<()>,
    cache: SuggestionCache,
    nav: Mutex<NavState>,
    stats: Mutex<SearchStats>,
    /// replace_engine 経由で起動した場合の設定。強さ変更での再起動に使う。
    config: Mutex<Option<EngineConfig>>,
    think_time_ms: u64,
    line_count: usize,
}

impl EngineCoordinator {
    pub fn new(think_time_ms: u64, line_count: usize) -> Self {
        Self {
            link: RwLock::new(None),
            gate: ReadinessGate::new(),
            generation: AtomicU64::new(0),
            busy: Mutex::new(false),
            idle: Condvar::new(),
            exchange_lock: Mutex::new(()),
            cache: SuggestionCache::new(),
            nav: Mutex::new(NavState::default()),
            stats: Mutex::new(SearchStats::default()),
            config: Mutex::new(None),
            think_time_ms,
            line_count: line_count.max(1),
        }
    }

    /// エンジンプロセスを spawn して接続済みコーディネータを作る。
    pub fn with_engine(cfg: &EngineConfig) -> Result<Self> {
        let coordinator = Self::new(cfg.think_time_ms, cfg.multipv_lines);
        coordinator.replace_engine(cfg)?;
        Ok(coordinator)
    }

    /// リンクを差し替える。旧トランスポートは所有権ごと引退し、
    /// そこに束縛されていた応答が新しいセッションへ届くことはない。
    pub fn install_link(&self, link: Arc<dyn EngineLink>) {
        let old = self.link.write().unwrap().replace(link);
        drop(old);
    }

    /// エンジンを作り直す。古いプロセスは Drop で quit → 猶予 → kill
    /// され、旧リンク宛ての応答は新しいセッションへ届かない。
    /// 世代も進めるので、旧エンジンに束縛された飛行中のリクエストは
    /// 全て stale になる。
    pub fn replace_engine(&self, cfg: &EngineConfig) -> Result<()> {
        let transport = UciTransport::spawn(cfg)?;
        self.begin_generation();
        self.install_link(Arc::new(transport));
        *self.config.lock().unwrap() = Some(cfg.clone());
        Ok(())
    }

    /// レーティングだけ変えてエンジンを再起動する。UCI_Elo / Skill Level
    /// は起動時オプションとして流し込むため、プロセス交換で反映する。
    /// エンジン未接続なら何もしない。
    pub fn set_strength(&self, rating: u32) -> Result<()> {
        let Some(mut cfg) = self.config.lock().unwrap().clone() else {
            return Ok(());
        };
        cfg.rating = rating;
        self.replace_engine(&cfg)
    }

    fn link(&self) -> Option<Arc<dyn EngineLink>> {
        self.link.read().unwrap().clone()
    }

    /// 新しい世代を払い出す。これ以前に始まった全リクエストは stale になる。
    pub fn begin_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.lock().unwrap()
    }

    /// 外部から観測される現在の候補 (局面, リスト)。
    pub fn current_suggestions(&self) -> Option<(String, Vec<Suggestion>)> {
        self.nav.lock().unwrap().current.clone()
    }

    /// 直近の探索の主ライン統計。
    pub fn last_search_stats(&self) -> SearchStats {
        *self.stats.lock().unwrap()
    }

    /// 新規ゲーム: キャッシュと観測状態を破棄し、エンジンに
    /// ucinewgame を通知する。
    ///
    /// 実行中の探索があれば stop で追い立て、排他交換ロックの獲得で
    /// その完了を待ってから送る。ucinewgame が go〜terminating reply の
    /// 途中に割り込むと、飛行中の pump が応答行を取りこぼす。
    pub fn new_game(&self) -> Result<()> {
        self.begin_generation();
        self.cache.clear();
        {
            let mut nav = self.nav.lock().unwrap();
            nav.target = None;
            nav.current = None;
        }
        if let Some(link) = self.link() {
            if self.is_busy() {
                link.send("stop");
            }
            let _guard = self.exchange_lock.lock().unwrap();
            link.send("ucinewgame");
            self.gate.wait_ready(Some(link.as_ref()))?;
        }
        Ok(())
    }

    /// 局面の最善手を 1 本だけ求める。指せる手がない・応答が解釈
    /// できない場合は None（エラーにはしない）。
    pub fn request_best_move(&self, fen: &str) -> Result<Option<UciMove>> {
        let Some(link) = self.link() else {
            return Ok(None);
        };
        let _guard = self.exchange_lock.lock().unwrap();
        self.gate.wait_ready(Some(link.as_ref()))?;
        link.send(&format!("position fen {fen}"));
        link.send(&format!("go movetime {}", self.think_time_ms));
        self.set_busy(true);
        let pumped = self.pump_search(link.as_ref(), |line| {
            line.strip_prefix("bestmove ").map(|rest| {
                let token = rest.split_whitespace().next().unwrap_or_default();
                if token == "(none)" {
                    None
                } else {
                    UciMove::from_ascii(token.as_bytes()).ok()
                }
            })
        });
        self.set_busy(false);
        pumped
    }

    /// `line_count` 本の候補手を順位付きで求める。
    ///
    /// `generation` が渡され、開始前の時点で既に追い越されていれば
    /// エンジンに触れずに空で戻る（安価な先取りキャンセル）。完了後に
    /// 追い越されていた場合は集まった分を Superseded として返し、
    /// current 経路専用の副作用（完了後の readiness probe）は行わない。
    pub fn request_ranked_suggestions(
        &self,
        fen: &str,
        line_count: usize,
        generation: Option<u64>,
    ) -> Result<RequestOutcome<Vec<Suggestion>>> {
        if let Some(g) = generation {
            if !self.is_current(g) {
                debug!("ranked request for gen {g} preempted before start");
                return Ok(RequestOutcome::Superseded(Vec::new()));
            }
        }
        let Some(link) = self.link() else {
            return Ok(RequestOutcome::Fresh(Vec::new()));
        };
        let pos = parse_fen(fen)?;
        let line_count = line_count.max(1);

        let _guard = self.exchange_lock.lock().unwrap();
        self.gate.wait_ready(Some(link.as_ref()))?;
        if line_count > 1 {
            link.send(&format!("setoption name MultiPV value {line_count}"));
        }
        link.send(&format!("position fen {fen}"));
        link.send(&format!("go movetime {}", self.think_time_ms));
        self.set_busy(true);

        let mut slots: Vec<Option<Suggestion>> = vec![None; line_count];
        let mut stats = SearchStats::default();
        let pumped = self.pump_search(link.as_ref(), |line| {
            if line.starts_with("bestmove ") || line == "bestmove" {
                return Some(());
            }
            if line.starts_with("info") {
                stats.update_from_line(line);
                if let Some(ranked) = parse_ranked_info(line) {
                    if (1..=line_count).contains(&ranked.rank) {
                        let rank = ranked.rank;
                        match ranked.resolve(&pos) {
                            Some(suggestion) => slots[rank - 1] = Some(suggestion),
                            // 解釈できない行は黙って落とす（そのランクは欠番）
                            None => debug!("dropping unresolvable info line: {line}"),
                        }
                    }
                }
            }
            None
        });
        self.set_busy(false);
        // ranked モードの後始末は成否によらず行う
        if line_count > 1 {
            link.send("setoption name MultiPV value 1");
        }
        pumped?;
        *self.stats.lock().unwrap() = stats;

        let suggestions = compact_and_sort(slots);
        let fresh = generation.map_or(true, |g| self.is_current(g));
        if fresh {
            // current 経路のみ: 次のコマンドに備えて readiness を確認しておく
            self.gate.wait_ready(Some(link.as_ref()))?;
            Ok(RequestOutcome::Fresh(suggestions))
        } else {
            Ok(RequestOutcome::Superseded(suggestions))
        }
    }

    /// ナビゲーションを 1 件確定させる。世代の払い出しとターゲットの
    /// 更新を同じロックの下で行うので、複数スレッドから呼ばれても
    /// 「世代が大きいほうが後のナビゲーション」という全順序が立つ。
    /// ナビゲーションを発行するスレッドで確定させてから、ロード本体を
    /// ワーカースレッドへ逃がすのが想定の使い方。
    pub fn begin_navigation(&self, fen: &str) -> u64 {
        let mut nav = self.nav.lock().unwrap();
        let generation = self.begin_generation();
        nav.target = Some(fen.to_string());
        generation
    }

    /// ナビゲーション時のエントリポイント。確定と実行を一括で行う
    /// 便宜形。並行ナビゲーションの順序を呼び出し順に固定したい場合は
    /// [`Self::begin_navigation`] + [`Self::load_suggestions_at`] を使う。
    pub fn load_suggestions(&self, fen: &str) -> Result<RequestOutcome<Vec<Suggestion>>> {
        let generation = self.begin_navigation(fen);
        self.load_suggestions_at(fen, generation)
    }

    /// 確定済みナビゲーションのロード本体。
    ///
    /// キャッシュ命中なら即座に供給。そうでなければ実行中の探索を
    /// stop で追い立て、アイドルを待ってから ranked リクエストを
    /// 実行する。結果は局面キーでキャッシュされ（stale でも局面の
    /// 真の最善手は誰が尋ねたかに依存しない）、「現在の候補」の
    /// 上書きは世代が current のままかつナビゲーション先がこの局面の
    /// ままである場合に限る。キャッシュ供給の経路も同じ条件に従う。
    pub fn load_suggestions_at(
        &self,
        fen: &str,
        generation: u64,
    ) -> Result<RequestOutcome<Vec<Suggestion>>> {
        if let Some(cached) = self.cache.get(fen) {
            if self.publish_if_current(fen, &cached, generation) {
                return Ok(RequestOutcome::Fresh(cached));
            }
            return Ok(RequestOutcome::Superseded(cached));
        }

        if self.is_busy() {
            if let Some(link) = self.link() {
                // 協調的キャンセル: エンジンが即座に捨てるとは仮定せず、
                // terminating reply は通常経路で待つ
                link.send("stop");
            }
        }
        if !self.wait_until_idle(generation) {
            debug!("gen {generation} superseded while waiting for idle engine");
            return Ok(RequestOutcome::Superseded(Vec::new()));
        }
        if !self.is_current(generation) {
            return Ok(RequestOutcome::Superseded(Vec::new()));
        }

        let outcome =
            self.request_ranked_suggestions(fen, self.line_count, Some(generation))?;
        let fresh = outcome.is_fresh();
        let suggestions = outcome.into_inner();
        if !suggestions.is_empty() {
            self.cache.set(fen, suggestions.clone());
        }
        if fresh && self.publish_if_current(fen, &suggestions, generation) {
            return Ok(RequestOutcome::Fresh(suggestions));
        }
        Ok(RequestOutcome::Superseded(suggestions))
    }

    /// レーティングに応じて最善手または弱体化した手を返す。
    pub fn weak_or_best_move(&self, fen: &str, rating: u32) -> Result<Option<String>> {
        self.weak_or_best_move_with(fen, rating, &mut rand::rng())
    }

    /// 乱数源を外から渡せるバリアント（シード固定テスト用）。
    pub fn weak_or_best_move_with<R: rand::Rng>(
        &self,
        fen: &str,
        rating: u32,
        rng: &mut R,
    ) -> Result<Option<String>> {
        let probability = blunder_probability(rating);
        if probability <= 0.03 {
            // どうせ常に 1 番手を選ぶ強さなら 3 本も聞かない
            return Ok(self.request_best_move(fen)?.map(|m| m.to_string()));
        }
        let suggestions = self
            .request_ranked_suggestions(fen, DEFAULT_LINE_COUNT, None)?
            .into_inner();
        if suggestions.is_empty() {
            warn!("no ranked suggestions for weakened pick, falling back to best move");
            return Ok(self.request_best_move(fen)?.map(|m| m.to_string()));
        }
        Ok(pick_weakened_move(fen, &suggestions, probability, rng))
    }

    /// まだ最新のナビゲーションであるときに限り候補を公開する。
    /// 確認と公開を 1 つのロック区間で行う。区間の外で確認すると、
    /// その隙に別のナビゲーションが確定して古い候補で上書きできて
    /// しまう。
    fn publish_if_current(&self, fen: &str, suggestions: &[Suggestion], generation: u64) -> bool {
        let mut nav = self.nav.lock().unwrap();
        if !self.is_current(generation) || nav.target.as_deref() != Some(fen) {
            return false;
        }
        nav.current = Some((fen.to_string(), suggestions.to_vec()));
        true
    }

    fn set_busy(&self, value: bool) {
        let mut busy = self.busy.lock().unwrap();
        *busy = value;
        if !value {
            self.idle.notify_all();
        }
    }

    /// busy が解けるまで待つ。terminating reply 到着で通知されるが、
    /// スライスごとに起きて世代を再確認する。追い越されたら false。
    fn wait_until_idle(&self, generation: u64) -> bool {
        let mut busy = self.busy.lock().unwrap();
        while *busy {
            if !self.is_current(generation) {
                return false;
            }
            let (guard, _) = self.idle.wait_timeout(busy, IDLE_WAIT_SLICE).unwrap();
            busy = guard;
        }
        true
    }

    /// 応答行を terminating reply まで汲み上げる共通ループ。
    ///
    /// `on_line` が Some を返した時点で完走。soft 期限超過で stop を
    /// 1 度だけ送り、hard 期限まで粘ってから諦める。途中の readyok は
    /// readiness gate の待機者へ流す。
    fn pump_search<T>(
        &self,
        link: &dyn EngineLink,
        mut on_line: impl FnMut(&str) -> Option<T>,
    ) -> Result<T> {
        let start = Instant::now();
        let soft = Duration::from_millis(self.think_time_ms.saturating_add(STOP_MARGIN_MS));
        let hard = soft + Duration::from_millis(STOP_MARGIN_MS);
        let mut stop_sent = false;
        loop {
            let deadline = if stop_sent { hard } else { soft };
            let elapsed = start.elapsed();
            if elapsed >= deadline {
                if !stop_sent {
                    link.send("stop");
                    stop_sent = true;
                    continue;
                }
                bail!("engine sent no terminating reply within {hard:?}");
            }
            match link.recv_line(deadline - elapsed) {
                Some(line) => {
                    if line == "readyok" {
                        // 並行する readiness probe への応答。探索とは無関係。
                        self.gate.signal_ready();
                        continue;
                    }
                    if let Some(done) = on_line(&line) {
                        return Ok(done);
                    }
                    // 期待パターン外の行は捨てて続行
                }
                None => {
                    if stop_sent {
                        bail!("engine link went silent after stop");
                    }
                    link.send("stop");
                    stop_sent = true;
                }
            }
        }
    }
}

fn parse_fen(fen: &str) -> Result<Chess> {
    let parsed: Fen = fen
        .parse()
        .with_context(|| format!("invalid FEN: {fen}"))?;
    parsed
        .into_position(CastlingMode::Standard)
        .map_err(|e| anyhow!("unusable FEN '{fen}': {e}"))
}
