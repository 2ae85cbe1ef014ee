//! Alias（別名）模組
//!
//! 對使用者或腳本送出的命令文字匹配，在送往伺服器之前攔截

use crate::pattern::{MatchCore, PatternObject, PatternSet};

/// 別名定義
#[derive(Debug)]
pub struct Alias {
    core: MatchCore,
    keep_eval: bool,
}

impl Alias {
    /// 創建新的別名
    pub fn new(id: impl Into<String>, patterns: impl Into<PatternSet>) -> Self {
        Self {
            core: MatchCore::new(id, patterns),
            keep_eval: false,
        }
    }

    /// 匹配後是否繼續評估後面的別名
    pub fn keep_eval(&self) -> bool {
        self.keep_eval
    }

    pub fn with_keep_eval(mut self, keep_eval: bool) -> Self {
        self.keep_eval = keep_eval;
        self
    }
}

impl PatternObject for Alias {
    fn core(&self) -> &MatchCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MatchCore {
        &mut self.core
    }
}
