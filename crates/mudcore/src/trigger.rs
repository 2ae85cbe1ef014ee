//! Trigger（觸發器）模組
//!
//! 對伺服器輸出的每一行進行匹配並執行動作

use crate::pattern::{MatchCore, PatternObject, PatternSet};

/// 觸發器定義
#[derive(Debug)]
pub struct Trigger {
    core: MatchCore,
    /// 匹配後仍繼續評估後面的觸發器
    keep_eval: bool,
    /// 對含 ANSI 的原始文字匹配
    raw: bool,
}

impl Trigger {
    /// 創建新的觸發器
    ///
    /// # Example
    /// ```
    /// use mudcore::pattern::{Pattern, PatternObject};
    /// use mudcore::trigger::Trigger;
    ///
    /// let trigger = Trigger::new("gold", Pattern::regex(r"你獲得了\s*(\d+)\s*金幣").unwrap())
    ///     .with_priority(10)
    ///     .with_keep_eval(true);
    /// assert_eq!(trigger.priority(), 10);
    /// assert!(trigger.keep_eval());
    /// ```
    pub fn new(id: impl Into<String>, patterns: impl Into<PatternSet>) -> Self {
        Self {
            core: MatchCore::new(id, patterns),
            keep_eval: false,
            raw: false,
        }
    }

    pub fn keep_eval(&self) -> bool {
        self.keep_eval
    }

    pub fn raw(&self) -> bool {
        self.raw
    }

    pub fn with_keep_eval(mut self, keep_eval: bool) -> Self {
        self.keep_eval = keep_eval;
        self
    }

    pub fn with_raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }
}

impl PatternObject for Trigger {
    fn core(&self) -> &MatchCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MatchCore {
        &mut self.core
    }
}
