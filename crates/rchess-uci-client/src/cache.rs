use std::collections::HashMap;
use std::sync::Mutex;

use crate::suggestion::Suggestion;

/// 局面文字列 → 候補手リストのメモ化。
///
/// キーは局面の正規文字列そのもので、等価性は文字列一致。サイズ上限も
/// TTL もない。1 ブラウジングセッションで訪れる局面数が鍵空間の上限で
/// あり、新規ゲーム開始・解析終了時に丸ごと clear される。
#[derive(Default)]
pub struct SuggestionCache {
    inner: Mutex<HashMap<String, Vec<Suggestion>>>,
}

impl SuggestionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, position: &str) -> Option<Vec<Suggestion>> {
        self.inner.lock().unwrap().get(position).cloned()
    }

    pub fn set(&self, position: &str, suggestions: Vec<Suggestion>) {
        self.inner
            .lock()
            .unwrap()
            .insert(position.to_string(), suggestions);
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}
