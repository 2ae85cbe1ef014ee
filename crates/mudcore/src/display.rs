//! 顯示輸出模組
//!
//! Session 把解碼後（保留 ANSI）的行與診斷訊息送到 `DisplaySink`，
//! 如何呈現由呼叫端決定。

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;

/// 診斷訊息等級
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for MessageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageLevel::Info => "INFO",
            MessageLevel::Warning => "WARNING",
            MessageLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// 顯示端介面
pub trait DisplaySink {
    /// 伺服器輸出的一行（保留 ANSI）
    fn line(&self, text: &str);

    /// 核心產生的短訊息
    fn message(&self, level: MessageLevel, text: &str);
}

/// 不輸出任何東西
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DisplaySink for NullSink {
    fn line(&self, _text: &str) {}
    fn message(&self, _level: MessageLevel, _text: &str) {}
}

/// 訊息緩衝區 - 使用環形緩衝區儲存歷史訊息
///
/// 當緩衝區滿了時，最舊的訊息會被移除
#[derive(Debug, Clone)]
pub struct MessageBuffer {
    messages: VecDeque<String>,
    capacity: usize,
}

impl MessageBuffer {
    /// 創建新的訊息緩衝區
    ///
    /// # Example
    /// ```
    /// use mudcore::display::MessageBuffer;
    ///
    /// let buffer = MessageBuffer::new(100);
    /// assert_eq!(buffer.len(), 0);
    /// ```
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
        }
    }

    /// 添加訊息，已滿時移除最舊的一筆
    pub fn push(&mut self, message: String) {
        if self.messages.len() >= self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// 最後 n 條訊息（舊到新）
    pub fn last_n(&self, n: usize) -> Vec<&String> {
        let skip = self.messages.len().saturating_sub(n);
        self.messages.iter().skip(skip).collect()
    }

    /// 是否有任何訊息包含 `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.messages.iter().any(|m| m.contains(needle))
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new(1000) // 預設容量 1000 條訊息
    }
}

/// 以緩衝區當作顯示端；診斷訊息以 `[LEVEL] text` 形式記錄
impl DisplaySink for RefCell<MessageBuffer> {
    fn line(&self, text: &str) {
        self.borrow_mut().push(text.to_string());
    }

    fn message(&self, level: MessageLevel, text: &str) {
        self.borrow_mut().push(format!("[{}] {}", level, text));
    }
}
