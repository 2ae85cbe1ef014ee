//! 文字編解碼模組
//!
//! 伺服器編碼可由設定或 CHARSET 協商決定（UTF-8、Big5、GBK 等）

use encoding_rs::Encoding;

/// 以 encoding_rs 為基礎的編解碼器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextCodec {
    encoding: &'static Encoding,
}

impl TextCodec {
    /// 依標籤建立編解碼器，不認識的標籤回傳 `None`
    ///
    /// # Example
    /// ```
    /// use mudcore::encoding::TextCodec;
    ///
    /// let codec = TextCodec::for_label("big5").unwrap();
    /// assert_eq!(codec.name(), "Big5");
    /// assert!(TextCodec::for_label("no-such-charset").is_none());
    /// ```
    pub fn for_label(label: &str) -> Option<Self> {
        Encoding::for_label(label.trim().as_bytes()).map(|encoding| Self { encoding })
    }

    pub fn utf8() -> Self {
        Self { encoding: encoding_rs::UTF_8 }
    }

    /// 正式名稱
    pub fn name(&self) -> &'static str {
        self.encoding.name()
    }

    /// 將伺服器位元組解碼為 UTF-8 字串（無效字元替換為 U+FFFD）
    pub fn decode(&self, bytes: &[u8]) -> String {
        let (decoded, _) = self.encoding.decode_without_bom_handling(bytes);
        decoded.into_owned()
    }

    /// 將字串編碼為伺服器位元組（無法編碼的字元會被替換）
    pub fn encode(&self, text: &str) -> Vec<u8> {
        let (encoded, _, _) = self.encoding.encode(text);
        encoded.into_owned()
    }
}

impl Default for TextCodec {
    fn default() -> Self {
        Self::utf8()
    }
}
