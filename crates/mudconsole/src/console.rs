//! 終端機輸出與本地命令
//!
//! 以 `#` 開頭的輸入由客戶端處理，其餘交給 [`Session::exec`]

use std::io::Write;

use mudcore::{DisplaySink, MessageLevel, ObjectKind, Session};

/// 直接寫到 stdout 的顯示端（保留伺服器的 ANSI 色彩）
pub struct ConsoleSink;

impl DisplaySink for ConsoleSink {
    fn line(&self, text: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}", text);
    }

    fn message(&self, level: MessageLevel, text: &str) {
        let color = match level {
            MessageLevel::Info => "36",
            MessageLevel::Warning => "33",
            MessageLevel::Error => "31",
        };
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "\x1b[{}m[{}]\x1b[0m {}", color, level, text);
    }
}

/// 本地命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalCommand {
    Quit,
    Load(String),
    Unload(String),
    Reload(String),
    Modules,
    Save,
    /// 列出某類物件
    List(ObjectKind),
    Enable(String, bool),
}

impl LocalCommand {
    /// 不是本地命令時回傳 `None`
    pub fn parse(input: &str) -> Option<Self> {
        let rest = input.trim().strip_prefix('#')?;
        let mut parts = rest.split_whitespace();
        let name = parts.next()?.to_ascii_lowercase();
        let arg = parts.next().map(str::to_string);

        match (name.as_str(), arg) {
            ("quit" | "exit", _) => Some(Self::Quit),
            ("load", Some(id)) => Some(Self::Load(id)),
            ("unload", Some(id)) => Some(Self::Unload(id)),
            ("reload", Some(id)) => Some(Self::Reload(id)),
            ("modules", _) => Some(Self::Modules),
            ("save", _) => Some(Self::Save),
            ("tri" | "triggers", _) => Some(Self::List(ObjectKind::Trigger)),
            ("ali" | "aliases", _) => Some(Self::List(ObjectKind::Alias)),
            ("cmd" | "commands", _) => Some(Self::List(ObjectKind::Command)),
            ("ti" | "timers", _) => Some(Self::List(ObjectKind::Timer)),
            ("gmcp", _) => Some(Self::List(ObjectKind::Gmcp)),
            ("enable", Some(group)) => Some(Self::Enable(group, true)),
            ("disable", Some(group)) => Some(Self::Enable(group, false)),
            _ => None,
        }
    }

    /// 執行命令；回傳是否繼續讀取輸入
    pub fn apply(&self, session: &Session) -> bool {
        match self {
            Self::Quit => {
                session.disconnect();
                return false;
            }
            Self::Load(id) => match session.load_module(id) {
                Ok(true) => session.info(&format!("已載入模組 {}", id)),
                Ok(false) => session.warning(&format!("找不到模組 {}", id)),
                Err(e) => session.report_error(&format!("載入模組 {}", id), &e),
            },
            Self::Unload(id) => {
                if !session.unload_module(id) {
                    session.warning(&format!("模組 {} 未載入", id));
                }
            }
            Self::Reload(id) => {
                if let Err(e) = session.reload_module(id) {
                    session.report_error(&format!("重新載入模組 {}", id), &e);
                }
            }
            Self::Modules => session.info(&format!("模組: {}", session.modules().join(", "))),
            Self::Save => session.save_variables(),
            Self::List(kind) => session.info(&format!("{:?}: {}", kind, session.ids(*kind).join(", "))),
            Self::Enable(group, enabled) => {
                let counts = session.enable_group(group, *enabled);
                session.info(&format!("群組 {}: {} 個物件", group, counts.total()));
            }
        }
        true
    }
}
