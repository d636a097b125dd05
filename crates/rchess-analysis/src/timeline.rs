use log::warn;
use serde::Serialize;
use shakmaty::fen::Fen;
use shakmaty::san::SanPlus;
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess, EnPassantMode, Position};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplayError {
    /// 手順の途中でルール上指せない（または解釈できない）手に当たった。
    #[error("illegal move '{uci}' at ply {ply}")]
    IllegalMove { ply: usize, uci: String },
}

/// 1 手分の表記ペア。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MoveRecord {
    pub uci: String,
    pub san: String,
}

/// リプレイ済みゲームの 1 局面。初期局面が index 0、以降 1 手ごとに
/// 1 エントリ。played はこの局面へ至った手、next は直後に指された手。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub index: usize,
    pub position: String,
    #[serde(rename = "playedMove", skip_serializing_if = "Option::is_none")]
    pub played: Option<MoveRecord>,
    #[serde(rename = "nextMove", skip_serializing_if = "Option::is_none")]
    pub next: Option<MoveRecord>,
}

/// UCI 手順を初期局面からリプレイしてタイムラインを組み立てる。
///
/// K 手の手順からちょうど K+1 エントリを返す。途中で指せない手に
/// 当たった場合は、どの手で壊れたかを示すエラーを返す（部分結果は
/// 返さない。上流データの崩れを許容したい場合は [`sanitize_moves`] を
/// 先に通す）。
pub fn build_timeline<S: AsRef<str>>(moves: &[S]) -> Result<Vec<TimelineEntry>, ReplayError> {
    let mut pos = Chess::default();
    let mut entries = vec![TimelineEntry {
        index: 0,
        position: fen_of(&pos),
        played: None,
        next: None,
    }];
    for (ply, token) in moves.iter().enumerate() {
        let token = token.as_ref();
        let (record, next_pos) = apply_uci(&pos, token).ok_or_else(|| ReplayError::IllegalMove {
            ply,
            uci: token.to_string(),
        })?;
        entries
            .last_mut()
            .expect("timeline starts with the initial entry")
            .next = Some(record.clone());
        pos = next_pos;
        entries.push(TimelineEntry {
            index: ply + 1,
            position: fen_of(&pos),
            played: Some(record),
            next: None,
        });
    }
    Ok(entries)
}

/// 外部由来の手順をルール照合しながら写し取り、最初に指せない手が
/// 現れた時点で打ち切る。壊れた残りを捨てることで、同期ずれした
/// 上流データでもタイムライン構築自体は成功させる。
pub fn sanitize_moves<S: AsRef<str>>(moves: &[S]) -> Vec<String> {
    let mut pos = Chess::default();
    let mut valid = Vec::with_capacity(moves.len());
    for (ply, token) in moves.iter().enumerate() {
        let token = token.as_ref();
        match apply_uci(&pos, token) {
            Some((record, next_pos)) => {
                valid.push(record.uci);
                pos = next_pos;
            }
            None => {
                warn!("truncating desynchronized history at ply {ply} ('{token}')");
                break;
            }
        }
    }
    valid
}

/// インデックスをタイムラインの範囲内へ丸める。
pub fn clamp_index(timeline: &[TimelineEntry], index: usize) -> usize {
    index.min(timeline.len().saturating_sub(1))
}

fn fen_of(pos: &Chess) -> String {
    Fen::from_position(pos.clone(), EnPassantMode::Legal).to_string()
}

fn apply_uci(pos: &Chess, token: &str) -> Option<(MoveRecord, Chess)> {
    let uci = UciMove::from_ascii(token.as_bytes()).ok()?;
    let m = uci.to_move(pos).ok()?;
    let san = SanPlus::from_move(pos.clone(), &m).to_string();
    let record = MoveRecord {
        uci: m.to_uci(CastlingMode::Standard).to_string(),
        san,
    };
    Some((record, pos.clone().play(&m).ok()?))
}
