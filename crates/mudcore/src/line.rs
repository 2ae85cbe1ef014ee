//! 行組裝模組
//!
//! 累積協定引擎送出的資料位元組，遇到換行或 go-ahead 時切出一行。

use bytes::{Bytes, BytesMut};
use lazy_static::lazy_static;
use regex::Regex;

use crate::encoding::TextCodec;

lazy_static! {
    /// CSI (`ESC [ ... final`)、OSC (`ESC ] ... BEL/ST`) 與兩字元轉義序列
    static ref ANSI_RE: Regex =
        Regex::new(r"\x1b(?:\[[0-?]*[ -/]*[@-~]|\][^\x07\x1b]*(?:\x07|\x1b\\)|[@-Z\\-_])")
            .expect("ANSI pattern is valid");
}

/// 移除 ANSI 轉義碼
pub fn strip_ansi(input: &str) -> String {
    ANSI_RE.replace_all(input, "").into_owned()
}

/// 一行伺服器輸出
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// 原始位元組（不含換行）
    pub bytes: Bytes,
    /// 解碼後文字，保留 ANSI
    pub raw: String,
    /// 解碼後文字，已移除 ANSI
    pub text: String,
}

impl Line {
    pub fn new(bytes: Bytes, codec: &TextCodec) -> Self {
        let raw = codec.decode(&bytes);
        let text = strip_ansi(&raw);
        Self { bytes, raw, text }
    }
}

/// 行組裝器
#[derive(Debug)]
pub struct LineAssembler {
    buf: BytesMut,
    newline: Vec<u8>,
    codec: TextCodec,
}

impl LineAssembler {
    /// `newline` 為空時使用 `\n`
    pub fn new(newline: &str, codec: TextCodec) -> Self {
        let newline = if newline.is_empty() { b"\n".to_vec() } else { newline.as_bytes().to_vec() };
        Self {
            buf: BytesMut::with_capacity(1024),
            newline,
            codec,
        }
    }

    pub fn codec(&self) -> TextCodec {
        self.codec
    }

    /// 切換編碼（CHARSET 協商後）
    pub fn set_codec(&mut self, codec: TextCodec) {
        self.codec = codec;
    }

    /// 是否有尚未送出的資料
    pub fn has_pending(&self) -> bool {
        !self.buf.is_empty()
    }

    /// 加入資料，回傳所有完整的行
    pub fn push(&mut self, data: &[u8]) -> Vec<Line> {
        let mut lines = Vec::new();
        let mut search_from = self.buf.len().saturating_sub(self.newline.len() - 1);
        self.buf.extend_from_slice(data);

        while let Some(pos) = find(&self.buf[search_from..], &self.newline) {
            let end = search_from + pos;
            let mut line = self.buf.split_to(end + self.newline.len());
            line.truncate(end);
            if line.last() == Some(&b'\r') {
                line.truncate(end - 1);
            }
            lines.push(Line::new(line.freeze(), &self.codec));
            search_from = 0;
        }
        lines
    }

    /// go-ahead：送出目前累積的不完整行（沒有資料時回傳 `None`）
    pub fn flush(&mut self) -> Option<Line> {
        if self.buf.is_empty() {
            return None;
        }
        let mut line = self.buf.split();
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Some(Line::new(line.freeze(), &self.codec))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembler() -> LineAssembler {
        LineAssembler::new("\n", TextCodec::utf8())
    }

    fn texts(lines: &[Line]) -> Vec<&str> {
        lines.iter().map(|l| l.text.as_str()).collect()
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[31mRed\x1b[0m Normal"), "Red Normal");
        assert_eq!(strip_ansi("\x1b[1;32;40mHP\x1b[m"), "HP");
        assert_eq!(strip_ansi("\x1b]0;title\x07text"), "text");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn test_crlf_and_lf() {
        let mut a = assembler();
        let lines = a.push(b"hello\r\nworld\n");
        assert_eq!(texts(&lines), vec!["hello", "world"]);
        assert!(!a.has_pending());
    }

    #[test]
    fn test_partial_line_kept_until_newline() {
        let mut a = assembler();
        assert!(a.push(b"Room: ").is_empty());
        assert!(a.has_pending());
        let lines = a.push(b"Hall\r\n");
        assert_eq!(texts(&lines), vec!["Room: Hall"]);
    }

    #[test]
    fn test_flush_prompt() {
        let mut a = assembler();
        a.push(b"> ");
        let line = a.flush().unwrap();
        assert_eq!(line.text, "> ");
        assert!(a.flush().is_none());
    }

    #[test]
    fn test_empty_line() {
        let mut a = assembler();
        let lines = a.push(b"\r\n");
        assert_eq!(texts(&lines), vec![""]);
    }

    #[test]
    fn test_raw_and_stripped() {
        let mut a = assembler();
        let lines = a.push(b"\x1b[31mDanger\x1b[0m\n");
        assert_eq!(lines[0].raw, "\x1b[31mDanger\x1b[0m");
        assert_eq!(lines[0].text, "Danger");
        assert_eq!(&lines[0].bytes[..], b"\x1b[31mDanger\x1b[0m");
    }

    #[test]
    fn test_multibyte_newline_split_across_pushes() {
        let mut a = LineAssembler::new("\r\n", TextCodec::utf8());
        assert!(a.push(b"abc\r").is_empty());
        let lines = a.push(b"\ndef\r\n");
        assert_eq!(texts(&lines), vec!["abc", "def"]);
    }

    #[test]
    fn test_big5_decoding() {
        let mut a = LineAssembler::new("\n", TextCodec::for_label("big5").unwrap());
        let lines = a.push(&[0xa7, 0x41, 0xa6, 0x6e, b'\n']);
        assert_eq!(lines[0].text, "你好");
    }
}
