//! 完了済み・進行中ゲームを局面単位で閲覧するためのリプレイ層。
//!
//! UCI 手順を初期局面からリプレイして局面タイムラインを組み立て、
//! ナビゲーションのたびに `rchess-uci-client` のコーディネータへ
//! 候補手ロードを発行する。

pub mod session;
pub mod timeline;

pub use session::AnalysisSession;
pub use timeline::{
    MoveRecord, ReplayError, TimelineEntry, build_timeline, clamp_index, sanitize_moves,
};
