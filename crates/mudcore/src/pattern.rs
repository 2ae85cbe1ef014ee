//! 匹配物件共用模組
//!
//! Trigger / Alias / Command 共用的匹配模式、多行游標、結果型別、
//! 非同步完成事件與動作定義。

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

use crate::script::ScriptError;
use crate::session::Session;

/// 預設優先級（數字越小越先評估）
pub const DEFAULT_PRIORITY: i32 = 100;

/// 預設等待逾時
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// 匹配模式錯誤
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("無效的正則表達式 `{pattern}`: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("多行模式不可為空")]
    Empty,

    #[error("未知的匹配方式 `{0}`")]
    UnknownMode(String),
}

/// 模式字串的解讀方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    Regex,
    Exact,
    Contains,
    StartsWith,
    EndsWith,
}

impl std::str::FromStr for MatchMode {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "regex" => Ok(MatchMode::Regex),
            "exact" => Ok(MatchMode::Exact),
            "contains" => Ok(MatchMode::Contains),
            "starts_with" | "startswith" => Ok(MatchMode::StartsWith),
            "ends_with" | "endswith" => Ok(MatchMode::EndsWith),
            _ => Err(PatternError::UnknownMode(s.to_string())),
        }
    }
}

/// 單行匹配模式
#[derive(Debug, Clone)]
pub enum Pattern {
    /// 完全相等
    Exact(String),
    /// 純文字匹配（包含）
    Contains(String),
    /// 純文字匹配（開頭）
    StartsWith(String),
    /// 純文字匹配（結尾）
    EndsWith(String),
    /// 正則表達式，從行首開始匹配（不要求匹配整行）
    Regex(Regex),
}

impl Pattern {
    /// 編譯正則表達式，固定從位置 0 開始匹配
    pub fn regex(pattern: &str) -> Result<Self, PatternError> {
        Regex::new(&format!(r"\A(?:{})", pattern))
            .map(Pattern::Regex)
            .map_err(|source| PatternError::InvalidRegex {
                pattern: pattern.to_string(),
                source,
            })
    }

    /// 依 `is_regex` 決定正則或完全相等
    pub fn new(pattern: &str, is_regex: bool) -> Result<Self, PatternError> {
        let mode = if is_regex { MatchMode::Regex } else { MatchMode::Exact };
        Self::with_mode(pattern, mode)
    }

    pub fn with_mode(pattern: &str, mode: MatchMode) -> Result<Self, PatternError> {
        Ok(match mode {
            MatchMode::Regex => return Self::regex(pattern),
            MatchMode::Exact => Pattern::Exact(pattern.to_string()),
            MatchMode::Contains => Pattern::Contains(pattern.to_string()),
            MatchMode::StartsWith => Pattern::StartsWith(pattern.to_string()),
            MatchMode::EndsWith => Pattern::EndsWith(pattern.to_string()),
        })
    }

    pub fn exact(text: impl Into<String>) -> Self {
        Pattern::Exact(text.into())
    }

    pub fn contains(text: impl Into<String>) -> Self {
        Pattern::Contains(text.into())
    }

    /// 嘗試匹配，成功時回傳捕獲群組（未參與匹配的群組為空字串）
    pub fn captures(&self, line: &str) -> Option<Vec<String>> {
        let matched = match self {
            Pattern::Exact(s) => line == s,
            Pattern::Contains(s) => line.contains(s.as_str()),
            Pattern::StartsWith(s) => line.starts_with(s.as_str()),
            Pattern::EndsWith(s) => line.ends_with(s.as_str()),
            Pattern::Regex(re) => {
                let caps = re.captures(line)?;
                return Some(
                    caps.iter()
                        .skip(1)
                        .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                        .collect(),
                );
            }
        };
        matched.then(Vec::new)
    }
}

/// 一組依序匹配的模式；只有一個時為單行模式
#[derive(Debug, Clone)]
pub struct PatternSet(Vec<Pattern>);

impl PatternSet {
    /// 單一正則
    pub fn regex(pattern: &str) -> Result<Self, PatternError> {
        Pattern::regex(pattern).map(Self::from)
    }

    /// 多行正則，依序匹配連續的行
    pub fn regex_lines<I, S>(patterns: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let compiled = patterns
            .into_iter()
            .map(|p| Pattern::regex(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::try_from(compiled)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_multi_line(&self) -> bool {
        self.0.len() > 1
    }
}

impl From<Pattern> for PatternSet {
    fn from(pattern: Pattern) -> Self {
        PatternSet(vec![pattern])
    }
}

impl TryFrom<Vec<Pattern>> for PatternSet {
    type Error = PatternError;

    fn try_from(patterns: Vec<Pattern>) -> Result<Self, Self::Error> {
        if patterns.is_empty() {
            return Err(PatternError::Empty);
        }
        Ok(PatternSet(patterns))
    }
}

/// 匹配狀態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    NotSet,
    Failure,
    Success,
    Timeout,
    Abort,
}

/// 匹配結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub state: MatchState,
    pub id: String,
    /// 匹配到的文字（多行時以 `\n` 連接）
    pub line: String,
    /// 捕獲群組（多行時依行序合併）
    pub wildcards: Vec<String>,
}

impl MatchResult {
    pub fn new(state: MatchState, id: impl Into<String>) -> Self {
        Self {
            state,
            id: id.into(),
            line: String::new(),
            wildcards: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == MatchState::Success
    }
}

/// 多行匹配游標
///
/// `line_index` 永遠落在 `[0, patterns.len())`；非首行失敗時歸零，
/// 不會從第二行重新嘗試。
#[derive(Debug)]
pub struct Matcher {
    patterns: PatternSet,
    line_index: usize,
    lines: Vec<String>,
    pending: Vec<String>,
    wildcards: Vec<String>,
}

impl Matcher {
    pub fn new(patterns: PatternSet) -> Self {
        Self {
            patterns,
            line_index: 0,
            lines: Vec::new(),
            pending: Vec::new(),
            wildcards: Vec::new(),
        }
    }

    pub fn line_index(&self) -> usize {
        self.line_index
    }

    pub fn line_count(&self) -> usize {
        self.patterns.len()
    }

    /// 最近一次成功的捕獲群組；失敗時已清空
    pub fn wildcards(&self) -> &[String] {
        &self.wildcards
    }

    /// 放棄進行中的多行匹配
    pub fn reset(&mut self) {
        self.line_index = 0;
        self.lines.clear();
        self.pending.clear();
    }

    /// 以一行推進游標；成功時回傳完整文字
    pub fn step(&mut self, line: &str) -> (MatchState, String) {
        let Some(groups) = self.patterns.0[self.line_index].captures(line) else {
            self.reset();
            self.wildcards.clear();
            return (MatchState::Failure, String::new());
        };

        self.lines.push(line.to_string());
        self.pending.extend(groups);

        if self.line_index + 1 < self.patterns.len() {
            self.line_index += 1;
            return (MatchState::NotSet, String::new());
        }

        let text = self.lines.join("\n");
        self.wildcards = std::mem::take(&mut self.pending);
        self.reset();
        (MatchState::Success, text)
    }
}

enum EventState<T> {
    Pending,
    Set(T),
    Aborted,
}

/// 可重置的單執行緒完成事件
///
/// `set` 喚醒所有等待者；`abort` 讓等待者拿到 `None`
pub struct CompletionEvent<T> {
    state: RefCell<EventState<T>>,
    notify: Notify,
}

impl<T: Clone> CompletionEvent<T> {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(EventState::Pending),
            notify: Notify::new(),
        }
    }

    pub fn set(&self, value: T) {
        *self.state.borrow_mut() = EventState::Set(value);
        self.notify.notify_waiters();
    }

    pub fn abort(&self) {
        *self.state.borrow_mut() = EventState::Aborted;
        self.notify.notify_waiters();
    }

    pub fn reset(&self) {
        *self.state.borrow_mut() = EventState::Pending;
    }

    pub fn is_set(&self) -> bool {
        matches!(*self.state.borrow(), EventState::Set(_))
    }

    /// 等待事件；已經設定時立即回傳
    pub async fn wait(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match &*self.state.borrow() {
                EventState::Set(value) => return Some(value.clone()),
                EventState::Aborted => return None,
                EventState::Pending => {}
            }
            notified.await;
        }
    }
}

impl<T: Clone> Default for CompletionEvent<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CompletionEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.state.borrow() {
            EventState::Pending => "pending",
            EventState::Set(_) => "set",
            EventState::Aborted => "aborted",
        };
        f.debug_struct("CompletionEvent").field("state", &state).finish()
    }
}

/// 匹配回呼
pub type MatchCallback = Rc<dyn Fn(&Session, &MatchResult) -> Result<(), ScriptError>>;

/// 匹配成功後的動作
#[derive(Clone)]
pub enum Action {
    /// 展開後交給 `Session::exec`（會經過 Alias / Command）
    Send(String),
    /// 展開後顯示在本地
    Echo(String),
    /// 展開後寫入變數
    SetVariable(String, String),
    /// 自訂回呼
    Callback(MatchCallback),
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Send(t) => f.debug_tuple("Send").field(t).finish(),
            Action::Echo(t) => f.debug_tuple("Echo").field(t).finish(),
            Action::SetVariable(n, t) => f.debug_tuple("SetVariable").field(n).field(t).finish(),
            Action::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// 展開動作模板
///
/// `%1`..`%9` 與 `$1`..`$9` 取捕獲群組，`%0` / `$0` 為匹配文字，
/// `@name` 取變數值
pub fn expand_template<F>(template: &str, result: &MatchResult, lookup: F) -> String
where
    F: Fn(&str) -> Option<Value>,
{
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '%' | '$' => match chars.peek().and_then(|d| d.to_digit(10)) {
                Some(0) => {
                    chars.next();
                    out.push_str(&result.line);
                }
                Some(n) => {
                    chars.next();
                    if let Some(w) = result.wildcards.get(n as usize - 1) {
                        out.push_str(w);
                    }
                }
                None => out.push(c),
            },
            '@' => {
                let mut name = String::new();
                while let Some(&n) = chars.peek() {
                    if n.is_alphanumeric() || n == '_' {
                        name.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if name.is_empty() {
                    out.push('@');
                    continue;
                }
                match lookup(&name) {
                    Some(Value::String(s)) => out.push_str(&s),
                    Some(Value::Null) | None => {}
                    Some(v) => out.push_str(&v.to_string()),
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Trigger / Alias / Command 共用的屬性與匹配行為
pub struct MatchCore {
    id: String,
    group: String,
    enabled: Cell<bool>,
    priority: i32,
    one_shot: bool,
    timeout: Duration,
    sync: bool,
    seq: Cell<u64>,
    matcher: RefCell<Matcher>,
    event: CompletionEvent<MatchResult>,
    actions: Vec<Action>,
    on_success: Option<MatchCallback>,
    on_failure: Option<MatchCallback>,
    on_timeout: Option<MatchCallback>,
}

impl MatchCore {
    pub fn new(id: impl Into<String>, patterns: impl Into<PatternSet>) -> Self {
        Self {
            id: id.into(),
            group: String::new(),
            enabled: Cell::new(true),
            priority: DEFAULT_PRIORITY,
            one_shot: false,
            timeout: DEFAULT_TIMEOUT,
            sync: true,
            seq: Cell::new(0),
            matcher: RefCell::new(Matcher::new(patterns.into())),
            event: CompletionEvent::new(),
            actions: Vec::new(),
            on_success: None,
            on_failure: None,
            on_timeout: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn enabled(&self) -> bool {
        self.enabled.get()
    }

    /// 停用時同時放棄進行中的多行匹配
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled);
        if !enabled {
            self.matcher.borrow_mut().reset();
        }
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn one_shot(&self) -> bool {
        self.one_shot
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn sync(&self) -> bool {
        self.sync
    }

    /// 加入 Session 的順序，同優先級時依此排序
    pub fn seq(&self) -> u64 {
        self.seq.get()
    }

    pub(crate) fn set_seq(&self, seq: u64) {
        self.seq.set(seq);
    }

    pub fn line_index(&self) -> usize {
        self.matcher.borrow().line_index()
    }

    pub fn wildcards(&self) -> Vec<String> {
        self.matcher.borrow().wildcards().to_vec()
    }

    pub fn event(&self) -> &CompletionEvent<MatchResult> {
        &self.event
    }

    /// 清除完成事件並重置游標
    pub fn reset(&self) {
        self.event.reset();
        self.matcher.borrow_mut().reset();
    }

    /// 匹配一行
    ///
    /// `invoke` 且 `sync` 時，成功執行動作與成功回呼，失敗執行失敗回呼；
    /// 成功時一律設定完成事件
    pub fn match_line(&self, session: &Session, line: &str, invoke: bool) -> MatchResult {
        let (state, text, wildcards) = {
            let mut matcher = self.matcher.borrow_mut();
            let (state, text) = matcher.step(line);
            (state, text, matcher.wildcards().to_vec())
        };

        let result = MatchResult {
            state,
            id: self.id.clone(),
            line: text,
            wildcards,
        };

        let fire = invoke && self.sync;
        match state {
            MatchState::Success => {
                debug!("{} 匹配成功: {:?}", self.id, result.line);
                if fire {
                    self.run_success(session, &result);
                }
                self.event.set(result.clone());
            }
            MatchState::Failure if fire => {
                if let Some(cb) = &self.on_failure {
                    if let Err(e) = cb(session, &result) {
                        session.report_error(&format!("{} 失敗回呼", self.id), &e);
                    }
                }
            }
            _ => {}
        }
        result
    }

    /// 執行動作與成功回呼；錯誤回報給 Session，不往外傳
    pub fn run_success(&self, session: &Session, result: &MatchResult) {
        for action in &self.actions {
            let outcome = match action {
                Action::Send(t) => {
                    session.exec(&expand_template(t, result, |n| session.variable(n)));
                    Ok(())
                }
                Action::Echo(t) => {
                    session.echo(&expand_template(t, result, |n| session.variable(n)));
                    Ok(())
                }
                Action::SetVariable(name, t) => {
                    let value = expand_template(t, result, |n| session.variable(n));
                    session.set_variable(name, Value::String(value));
                    Ok(())
                }
                Action::Callback(cb) => cb(session, result),
            };
            if let Err(e) = outcome {
                session.report_error(&format!("{} 動作", self.id), &e);
            }
        }
        if let Some(cb) = &self.on_success {
            if let Err(e) = cb(session, result) {
                session.report_error(&format!("{} 成功回呼", self.id), &e);
            }
        }
    }

    pub fn run_failure(&self, session: &Session, result: &MatchResult) {
        if let Some(cb) = &self.on_failure {
            if let Err(e) = cb(session, result) {
                session.report_error(&format!("{} 失敗回呼", self.id), &e);
            }
        }
    }

    pub fn run_timeout(&self, session: &Session, result: &MatchResult) {
        if let Some(cb) = &self.on_timeout {
            if let Err(e) = cb(session, result) {
                session.report_error(&format!("{} 逾時回呼", self.id), &e);
            }
        }
    }

    /// 等待下一次成功匹配（先清除舊結果），逾時回傳 `Timeout`
    pub async fn triggered(&self) -> MatchResult {
        self.event.reset();
        match tokio::time::timeout(self.timeout, self.event.wait()).await {
            Ok(Some(result)) => result,
            Ok(None) => MatchResult::new(MatchState::Abort, self.id.clone()),
            Err(_) => MatchResult::new(MatchState::Timeout, self.id.clone()),
        }
    }
}

impl fmt::Debug for MatchCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchCore")
            .field("id", &self.id)
            .field("group", &self.group)
            .field("enabled", &self.enabled.get())
            .field("priority", &self.priority)
            .field("one_shot", &self.one_shot)
            .field("sync", &self.sync)
            .field("actions", &self.actions)
            .finish_non_exhaustive()
    }
}

/// 以 [`MatchCore`] 為核心的物件，提供共用的建構方法
pub trait PatternObject {
    fn core(&self) -> &MatchCore;
    fn core_mut(&mut self) -> &mut MatchCore;

    fn id(&self) -> &str {
        self.core().id()
    }

    fn group(&self) -> &str {
        self.core().group()
    }

    fn enabled(&self) -> bool {
        self.core().enabled()
    }

    fn set_enabled(&self, enabled: bool) {
        self.core().set_enabled(enabled)
    }

    fn priority(&self) -> i32 {
        self.core().priority()
    }

    fn with_group(mut self, group: impl Into<String>) -> Self
    where
        Self: Sized,
    {
        self.core_mut().group = group.into();
        self
    }

    fn with_priority(mut self, priority: i32) -> Self
    where
        Self: Sized,
    {
        self.core_mut().priority = priority;
        self
    }

    fn with_one_shot(mut self, one_shot: bool) -> Self
    where
        Self: Sized,
    {
        self.core_mut().one_shot = one_shot;
        self
    }

    fn with_timeout(mut self, timeout: Duration) -> Self
    where
        Self: Sized,
    {
        self.core_mut().timeout = timeout;
        self
    }

    fn with_sync(mut self, sync: bool) -> Self
    where
        Self: Sized,
    {
        self.core_mut().sync = sync;
        self
    }

    fn with_enabled(self, enabled: bool) -> Self
    where
        Self: Sized,
    {
        self.core().enabled.set(enabled);
        self
    }

    /// 添加動作
    fn add_action(mut self, action: Action) -> Self
    where
        Self: Sized,
    {
        self.core_mut().actions.push(action);
        self
    }

    fn on_success<F>(mut self, f: F) -> Self
    where
        Self: Sized,
        F: Fn(&Session, &MatchResult) -> Result<(), ScriptError> + 'static,
    {
        self.core_mut().on_success = Some(Rc::new(f));
        self
    }

    fn on_failure<F>(mut self, f: F) -> Self
    where
        Self: Sized,
        F: Fn(&Session, &MatchResult) -> Result<(), ScriptError> + 'static,
    {
        self.core_mut().on_failure = Some(Rc::new(f));
        self
    }

    fn on_timeout<F>(mut self, f: F) -> Self
    where
        Self: Sized,
        F: Fn(&Session, &MatchResult) -> Result<(), ScriptError> + 'static,
    {
        self.core_mut().on_timeout = Some(Rc::new(f));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::display::NullSink;
    use crate::trigger::Trigger;
    use tokio::task::LocalSet;
    use tokio::time::Instant;
    use tokio_test::{assert_pending, assert_ready, task};

    fn matcher(lines: &[&str]) -> Matcher {
        Matcher::new(PatternSet::regex_lines(lines).unwrap())
    }

    #[test]
    fn test_regex_is_anchored_at_start_only() {
        let p = Pattern::regex("Hello").unwrap();
        assert!(p.captures("Hello world").is_some());
        assert!(p.captures("Say Hello").is_none());
    }

    #[test]
    fn test_alternation_stays_anchored() {
        let p = Pattern::regex("foo|bar").unwrap();
        assert!(p.captures("bar!").is_some());
        assert!(p.captures("xbar").is_none());
    }

    #[test]
    fn test_unmatched_group_is_empty_string() {
        let p = Pattern::regex(r"(a)?(b)").unwrap();
        assert_eq!(p.captures("b").unwrap(), vec!["".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_literal_patterns() {
        assert!(Pattern::exact("look").captures("look").is_some());
        assert!(Pattern::exact("look").captures("look north").is_none());
        assert!(Pattern::contains("金幣").captures("你獲得了金幣").is_some());
        assert!(Pattern::new("a.c", false).unwrap().captures("abc").is_none());
        assert!(Pattern::new("a.c", true).unwrap().captures("abc").is_some());
    }

    #[test]
    fn test_match_modes() {
        let starts = Pattern::with_mode("你獲得", "starts_with".parse().unwrap()).unwrap();
        assert!(starts.captures("你獲得了金幣").is_some());
        assert!(starts.captures("他獲得了金幣").is_none());

        let ends = Pattern::with_mode("金幣", MatchMode::EndsWith).unwrap();
        assert!(ends.captures("你獲得了金幣").is_some());
        assert!(ends.captures("金幣掉了").is_none());

        let contains = Pattern::with_mode("(", "contains".parse().unwrap()).unwrap();
        assert!(contains.captures("a (b)").is_some());

        assert!(matches!("fuzzy".parse::<MatchMode>(), Err(PatternError::UnknownMode(_))));
        assert_eq!(serde_json::from_str::<MatchMode>(r#""ends_with""#).unwrap(), MatchMode::EndsWith);
    }

    #[test]
    fn test_invalid_regex() {
        let err = Pattern::regex("(unclosed").unwrap_err();
        assert!(matches!(err, PatternError::InvalidRegex { .. }));
        assert!(matches!(PatternSet::try_from(Vec::new()), Err(PatternError::Empty)));
    }

    #[test]
    fn test_multi_line_room() {
        let mut m = matcher(&["^Room: (.+)$", "^Exits: (.+)$", "^$"]);
        assert_eq!(m.step("Room: Hall").0, MatchState::NotSet);
        assert_eq!(m.line_index(), 1);
        assert_eq!(m.step("Exits: north").0, MatchState::NotSet);
        let (state, text) = m.step("");
        assert_eq!(state, MatchState::Success);
        assert_eq!(text, "Room: Hall\nExits: north\n");
        assert_eq!(m.wildcards(), ["Hall", "north"]);
        assert_eq!(m.line_index(), 0);
    }

    #[test]
    fn test_interior_failure_resets_without_retry() {
        let mut m = matcher(&["^A", "^B"]);
        m.step("A1");
        // 第二步失敗，即使此行符合第一步也不重新開始
        assert_eq!(m.step("A2").0, MatchState::Failure);
        assert_eq!(m.line_index(), 0);
        assert_eq!(m.step("B").0, MatchState::Failure);
    }

    #[test]
    fn test_cursor_never_exceeds_last_index() {
        let mut m = matcher(&["^x", "^y", "^z"]);
        let lines = ["x", "y", "x", "x", "y", "z", "z", "y", "x", "y", "z", "q"];
        for line in lines {
            m.step(line);
            assert!(m.line_index() < m.line_count());
        }
    }

    #[test]
    fn test_failure_clears_wildcards() {
        let mut m = matcher(&[r"^hp (\d+)"]);
        assert_eq!(m.step("hp 10").0, MatchState::Success);
        assert_eq!(m.wildcards(), ["10"]);
        assert_eq!(m.step("mp 3").0, MatchState::Failure);
        assert!(m.wildcards().is_empty());
    }

    #[test]
    fn test_expand_template() {
        let result = MatchResult {
            state: MatchState::Success,
            id: "t".into(),
            line: "你獲得 50 金幣".into(),
            wildcards: vec!["50".into(), "金幣".into()],
        };
        let lookup = |name: &str| match name {
            "target" => Some(Value::String("rat".into())),
            "hp" => Some(Value::from(100)),
            _ => None,
        };
        assert_eq!(expand_template("echo $1 %2", &result, lookup), "echo 50 金幣");
        assert_eq!(expand_template("kill @target @hp", &result, lookup), "kill rat 100");
        assert_eq!(expand_template("mail a@ b @none.", &result, lookup), "mail a@ b .");
        assert_eq!(expand_template("%9 100%", &result, lookup), " 100%");
        assert_eq!(expand_template("%0", &result, lookup), "你獲得 50 金幣");
    }

    #[tokio::test]
    async fn test_completion_event() {
        let event = CompletionEvent::<u32>::new();
        let mut waiter = task::spawn(event.wait());
        assert_pending!(waiter.poll());

        event.set(7);
        assert!(waiter.is_woken());
        assert_eq!(assert_ready!(waiter.poll()), Some(7));

        // 已設定時立即回傳
        assert_eq!(event.wait().await, Some(7));

        event.reset();
        let mut waiter = task::spawn(event.wait());
        assert_pending!(waiter.poll());
        event.abort();
        assert_eq!(assert_ready!(waiter.poll()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggered_success_timeout_and_abort() {
        LocalSet::new()
            .run_until(async {
                let session = Session::new("wait", SessionConfig::default(), Rc::new(NullSink));
                session.add_object(
                    Trigger::new("hp", Pattern::regex(r"^HP: (\d+)").unwrap()).with_timeout(Duration::from_secs(5)),
                );
                let hp = session.trigger("hp").unwrap();

                let waiter = {
                    let hp = Rc::clone(&hp);
                    tokio::task::spawn_local(async move { hp.core().triggered().await })
                };
                tokio::task::yield_now().await;
                session.feed(b"HP: 80\n");
                let result = waiter.await.unwrap();
                assert_eq!(result.state, MatchState::Success);
                assert_eq!(result.wildcards, ["80"]);

                // 舊結果已清除，沒有新行時等到逾時
                let begin = Instant::now();
                let result = hp.core().triggered().await;
                assert_eq!(result.state, MatchState::Timeout);
                assert_eq!(result.id, "hp");
                assert!(begin.elapsed() >= Duration::from_secs(5));

                let waiter = {
                    let hp = Rc::clone(&hp);
                    tokio::task::spawn_local(async move { hp.core().triggered().await })
                };
                tokio::task::yield_now().await;
                session.clean();
                assert_eq!(waiter.await.unwrap().state, MatchState::Abort);
                assert!(session.trigger("hp").is_none());
            })
            .await;
    }
}
