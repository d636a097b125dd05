use log::debug;
use rand::Rng;
use shakmaty::fen::Fen;
use shakmaty::{CastlingMode, Chess, Position};

use crate::suggestion::Suggestion;

/// 設定可能なレーティングの下限・上限。
pub const RATING_FLOOR: u32 = 600;
pub const RATING_CEILING: u32 = 2600;
/// これ以上のレーティングではブランダー確率を固定値にする閾値。
pub const RATING_MID_THRESHOLD: u32 = 1600;
const BLUNDER_SPREAD: f64 = 1000.0;

/// レーティングをエンジン固有の Skill Level (0–20) へ線形に写像する。
/// 範囲外は両端へクランプ。
pub fn skill_level(rating: u32) -> u8 {
    let clamped = rating.clamp(RATING_FLOOR, RATING_CEILING) as f64;
    let t = (clamped - RATING_FLOOR as f64) / (RATING_CEILING - RATING_FLOOR) as f64;
    (t * 20.0).round() as u8
}

/// レーティング → 「エンジンの推奨から逸脱する」確率。
///
/// 閾値以上は一律 0.02。閾値未満は floor に向かって 0.05 から 0.80 まで
/// 線形に増加する: t = clamp((閾値 - rating) / spread, 0, 1)、
/// p = 0.05 + 0.75 * t。
pub fn blunder_probability(rating: u32) -> f64 {
    if rating >= RATING_MID_THRESHOLD {
        return 0.02;
    }
    let t = ((RATING_MID_THRESHOLD - rating) as f64 / BLUNDER_SPREAD).clamp(0.0, 1.0);
    0.05 + 0.75 * t
}

/// 段階的弱体化による指し手選択。
///
/// 一様乱数 r を 1 回引き、
/// - r < 0.4p: 合法手から一様ランダム（エンジン出力を完全に無視する大ブランダー）
/// - r < p かつ候補 2 本以上:
///   - r < 0.7p かつ候補 3 本以上なら 3 番手、そうでなければ 2 番手
/// - それ以外: 最善手
///
/// 低レートほど「少し悪い手」ではなく「出力無視」側に確率質量が寄る。
pub fn pick_weakened_move<R: Rng>(
    fen: &str,
    suggestions: &[Suggestion],
    blunder_probability: f64,
    rng: &mut R,
) -> Option<String> {
    let r: f64 = rng.random();
    if r < 0.4 * blunder_probability {
        if let Some(mv) = random_legal_move(fen, rng) {
            debug!("weakened pick: random legal move {mv} (r={r:.3})");
            return Some(mv);
        }
    }
    if r < blunder_probability && suggestions.len() >= 2 {
        if r < 0.7 * blunder_probability && suggestions.len() >= 3 {
            return Some(suggestions[2].uci.clone());
        }
        return Some(suggestions[1].uci.clone());
    }
    suggestions.first().map(|s| s.uci.clone())
}

fn random_legal_move<R: Rng>(fen: &str, rng: &mut R) -> Option<String> {
    let parsed: Fen = fen.parse().ok()?;
    let pos: Chess = parsed.into_position(CastlingMode::Standard).ok()?;
    let legals = pos.legal_moves();
    if legals.is_empty() {
        return None;
    }
    let idx = rng.random_range(0..legals.len());
    Some(legals[idx].to_uci(CastlingMode::Standard).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{RngCore, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    const START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

    /// 常に同じ u64 を返す RNG。f64 標本 r = (v >> 11) * 2^-53 を
    /// 狙った値に固定するために使う。
    struct ConstRng(u64);

    impl RngCore for ConstRng {
        fn next_u32(&mut self) -> u32 {
            self.0 as u32
        }

        fn next_u64(&mut self) -> u64 {
            self.0
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for chunk in dest.chunks_mut(8) {
                let bytes = self.0.to_le_bytes();
                chunk.copy_from_slice(&bytes[..chunk.len()]);
            }
        }
    }

    fn const_rng(r: f64) -> ConstRng {
        ConstRng(((r * (1u64 << 53) as f64) as u64) << 11)
    }

    fn suggestions() -> Vec<Suggestion> {
        vec![
            Suggestion {
                uci: "e2e4".into(),
                san: "e4".into(),
                score: 50,
                rank: 1,
            },
            Suggestion {
                uci: "d2d4".into(),
                san: "d4".into(),
                score: 30,
                rank: 2,
            },
            Suggestion {
                uci: "g1f3".into(),
                san: "Nf3".into(),
                score: 20,
                rank: 3,
            },
        ]
    }

    #[test]
    fn skill_level_clamps_and_scales_linearly() {
        assert_eq!(skill_level(RATING_FLOOR), 0);
        assert_eq!(skill_level(RATING_CEILING), 20);
        assert_eq!(skill_level(0), 0);
        assert_eq!(skill_level(9999), 20);
        // 単調非減少
        let mut last = 0;
        for rating in (RATING_FLOOR..=RATING_CEILING).step_by(50) {
            let level = skill_level(rating);
            assert!(level >= last);
            last = level;
        }
    }

    #[test]
    fn blunder_probability_matches_rating_curve() {
        assert_eq!(blunder_probability(RATING_MID_THRESHOLD), 0.02);
        assert_eq!(blunder_probability(2400), 0.02);
        // t = 0.5 → 0.05 + 0.375
        assert!((blunder_probability(1100) - 0.425).abs() < 1e-9);
        assert!((blunder_probability(RATING_FLOOR) - 0.80).abs() < 1e-9);
        // 単調非増加
        let mut last = f64::MAX;
        for rating in (RATING_FLOOR..=2400).step_by(25) {
            let p = blunder_probability(rating);
            assert!(p <= last);
            last = p;
        }
    }

    #[test]
    fn weakened_pick_layers_by_draw_value() {
        let p = 0.5;
        // r=0.9: 最善
        let best = pick_weakened_move(START_FEN, &suggestions(), p, &mut const_rng(0.9));
        assert_eq!(best.as_deref(), Some("e2e4"));
        // r=0.4: 0.7p 以上 p 未満 → 2 番手
        let second = pick_weakened_move(START_FEN, &suggestions(), p, &mut const_rng(0.4));
        assert_eq!(second.as_deref(), Some("d2d4"));
        // r=0.25: 0.4p 以上 0.7p 未満 → 3 番手
        let third = pick_weakened_move(START_FEN, &suggestions(), p, &mut const_rng(0.25));
        assert_eq!(third.as_deref(), Some("g1f3"));
        // r=0.0: 完全ランダムな合法手（候補リスト外もあり得る）
        let random = pick_weakened_move(START_FEN, &suggestions(), p, &mut const_rng(0.0));
        assert!(random.is_some());
    }

    #[test]
    fn weakened_pick_with_short_suggestion_list() {
        let p = 0.5;
        let two = &suggestions()[..2];
        // 3 番手ゾーンでも候補が 2 本なら 2 番手へ落ちる
        let pick = pick_weakened_move(START_FEN, two, p, &mut const_rng(0.25));
        assert_eq!(pick.as_deref(), Some("d2d4"));

        let one = &suggestions()[..1];
        // 候補 1 本なら常に最善
        let pick = pick_weakened_move(START_FEN, one, p, &mut const_rng(0.45));
        assert_eq!(pick.as_deref(), Some("e2e4"));

        // 候補ゼロかつ大ブランダーゾーン外 → None
        let none = pick_weakened_move(START_FEN, &[], p, &mut const_rng(0.9));
        assert!(none.is_none());
    }

    #[test]
    fn lower_rating_shifts_mass_toward_random_moves() {
        // 同一シードで 2 レーティングを比較: 低レートの方が
        // 「候補リスト外の手」を引く回数が多いはず
        let off_list = |rating: u32| {
            let p = blunder_probability(rating);
            let mut rng = ChaCha8Rng::seed_from_u64(42);
            let listed: Vec<String> = suggestions().iter().map(|s| s.uci.clone()).collect();
            (0..500)
                .filter(|_| {
                    let pick = pick_weakened_move(START_FEN, &suggestions(), p, &mut rng);
                    pick.map(|m| !listed.contains(&m)).unwrap_or(false)
                })
                .count()
        };
        assert!(off_list(600) > off_list(1500));
    }
}
