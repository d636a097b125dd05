use serde::{Deserialize, Serialize};
use shakmaty::san::SanPlus;
use shakmaty::uci::UciMove;
use shakmaty::Chess;

/// mate スコアの写像先。mate-in-N は N に関係なく全ての cp 評価の外側に
/// 順位付けされる（相手側の mate は負号）。
pub const MATE_SCORE: i32 = 100_000;

/// 1 局面に対する候補手 1 本。score 降順のリストで保持される。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    /// UCI 形式の指し手 (from + to + 昇格)
    #[serde(rename = "move")]
    pub uci: String,
    /// SAN 表記
    pub san: String,
    /// 手番側から見た評価値 (centipawn、mate は ±MATE_SCORE)
    pub score: i32,
    /// multipv 順位 (1 始まり)
    pub rank: usize,
}

/// `info ... multipv k ... score (cp|mate) v ... pv m ...` を 1 本分の
/// 候補として分解した中間表現。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RankedLine {
    pub rank: usize,
    pub score: i32,
    pub uci: String,
}

impl RankedLine {
    /// 指し手をルール側で検証し SAN を解決する。非合法・解釈不能な
    /// エンジン出力はここで None となり、そのランクは欠番のまま残る。
    pub(crate) fn resolve(self, pos: &Chess) -> Option<Suggestion> {
        let uci = UciMove::from_ascii(self.uci.as_bytes()).ok()?;
        let m = uci.to_move(pos).ok()?;
        let san = SanPlus::from_move(pos.clone(), &m).to_string();
        Some(Suggestion {
            uci: self.uci,
            san,
            score: self.score,
            rank: self.rank,
        })
    }
}

/// ranked な info 行を分解する。multipv 指定がない行はランク 1 とみなす。
/// パターンに合わない行（score か pv を欠く）は None。
pub(crate) fn parse_ranked_info(line: &str) -> Option<RankedLine> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.first().copied() != Some("info") {
        return None;
    }
    let mut rank = 1usize;
    let mut score: Option<i32> = None;
    let mut uci: Option<&str> = None;
    let mut i = 1;
    while i < tokens.len() {
        match tokens[i] {
            "multipv" => {
                if i + 1 < tokens.len() {
                    rank = tokens[i + 1].parse::<usize>().unwrap_or(1);
                    i += 1;
                }
            }
            "score" => {
                if i + 2 < tokens.len() {
                    match tokens[i + 1] {
                        "cp" => {
                            score = tokens[i + 2].parse::<i32>().ok();
                            i += 2;
                        }
                        "mate" => {
                            score = tokens[i + 2]
                                .parse::<i32>()
                                .ok()
                                .map(|n| if n < 0 { -MATE_SCORE } else { MATE_SCORE });
                            i += 2;
                        }
                        _ => {}
                    }
                }
            }
            "pv" => {
                uci = tokens.get(i + 1).copied();
                break;
            }
            _ => {}
        }
        i += 1;
    }
    Some(RankedLine {
        rank,
        score: score?,
        uci: uci?.to_string(),
    })
}

/// 主ライン (multipv 1) の探索統計。表示用に最後の探索から持ち越す。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SearchStats {
    pub depth: Option<u32>,
    pub nodes: Option<u64>,
    pub time_ms: Option<u64>,
}

impl SearchStats {
    /// info 行から統計を拾う。multipv != 1 の行は無視する。
    pub fn update_from_line(&mut self, line: &str) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first().copied() != Some("info") {
            return;
        }
        let mut i = 1;
        while i < tokens.len() {
            if tokens[i] == "multipv" {
                if tokens.get(i + 1).copied() != Some("1") {
                    return;
                }
            }
            i += 1;
        }
        let mut i = 1;
        while i + 1 < tokens.len() {
            match tokens[i] {
                "depth" => {
                    self.depth = tokens[i + 1].parse::<u32>().ok().or(self.depth);
                    i += 1;
                }
                "nodes" => {
                    self.nodes = tokens[i + 1].parse::<u64>().ok().or(self.nodes);
                    i += 1;
                }
                "time" => {
                    self.time_ms = tokens[i + 1].parse::<u64>().ok().or(self.time_ms);
                    i += 1;
                }
                _ => {}
            }
            i += 1;
        }
    }
}

/// 欠番ランクを詰め、正規化スコアの降順に並べる。
/// 同点はエンジン報告順（= ランク順）を保つ（安定ソート）。
pub(crate) fn compact_and_sort(slots: Vec<Option<Suggestion>>) -> Vec<Suggestion> {
    let mut out: Vec<Suggestion> = slots.into_iter().flatten().collect();
    out.sort_by(|a, b| b.score.cmp(&a.score));
    out
}
