//! クライアント側から UCI エンジンを運転するオーケストレーション層。
//!
//! 外部エンジンプロセス（1 プロセス = 1 トランスポート）を行単位の
//! コマンド/応答プロトコルで駆動し、UI から殺到する解析リクエストを
//! 世代トークンで直列化・先取りキャンセルする。盤面のルール判定と
//! FEN/SAN 生成は `shakmaty` に委ねる。

pub mod cache;
pub mod coordinator;
pub mod readiness;
pub mod strength;
pub mod suggestion;
pub mod transport;

pub use cache::SuggestionCache;
pub use coordinator::{DEFAULT_LINE_COUNT, EngineCoordinator, RequestOutcome};
pub use readiness::ReadinessGate;
pub use strength::{blunder_probability, pick_weakened_move, skill_level};
pub use suggestion::{MATE_SCORE, SearchStats, Suggestion};
pub use transport::{ENGINE_ELO_FLOOR, EngineConfig, EngineLink, UciTransport};
