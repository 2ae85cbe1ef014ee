//! Command（命令）模組
//!
//! 送出命令後同時等待多個結果觸發器（成功／失敗／重試），
//! 與整體逾時競賽，先完成者決定結果。

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CommandDefaults;
use crate::pattern::{MatchCore, MatchResult, MatchState, PatternObject, PatternSet};
use crate::script::ScriptError;
use crate::session::Session;
use crate::trigger::Trigger;

/// 命令狀態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Idle,
    Issued,
    AwaitingOutcome,
    Succeeded,
    Failed,
    Retrying,
    TimedOut,
}

/// 一次 `execute` 的結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// `Success` / `Failure` / `Timeout` / `Abort`
    pub state: MatchState,
    pub id: String,
    /// 實際送出的命令
    pub command: String,
    /// 決定結果的伺服器文字
    pub line: String,
    pub wildcards: Vec<String>,
    pub timeout: Duration,
}

impl CommandResult {
    fn new(state: MatchState, id: &str, command: &str, timeout: Duration) -> Self {
        Self {
            state,
            id: id.to_string(),
            command: command.to_string(),
            line: String::new(),
            wildcards: Vec::new(),
            timeout,
        }
    }

    fn with_match(mut self, matched: MatchResult) -> Self {
        self.line = matched.line;
        self.wildcards = matched.wildcards;
        self
    }

    fn as_match_result(&self) -> MatchResult {
        MatchResult {
            state: self.state,
            id: self.id.clone(),
            line: self.line.clone(),
            wildcards: self.wildcards.clone(),
        }
    }
}

/// 單次呼叫用的覆寫回呼
pub type CommandCallback = Rc<dyn Fn(&Session, &CommandResult) -> Result<(), ScriptError>>;

pub type CommandFuture<'a> = Pin<Box<dyn Future<Output = Result<CommandResult, ScriptError>> + 'a>>;

/// 非同步命令
///
/// `core()` 的模式對使用者輸入的命令文字匹配；匹配成功時 Session
/// 以該文字呼叫 `execute`
pub trait Command: PatternObject {
    fn execute<'a>(&'a self, session: &'a Session, cmd: &'a str) -> CommandFuture<'a>;

    /// 取消所有進行中的等待，可重複呼叫
    fn reset(&self);

    /// 需要與命令一起註冊到 Session 的結果觸發器
    fn outcome_triggers(&self) -> Vec<Rc<Trigger>> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Retry,
}

/// 以成功／失敗／重試觸發器判定結果的命令
pub struct SimpleCommand {
    core: MatchCore,
    success: Vec<Rc<Trigger>>,
    failure: Vec<Rc<Trigger>>,
    retry: Vec<Rc<Trigger>>,
    max_retry: u32,
    retry_backoff: Duration,
    default_text: Option<String>,
    on_success: Option<CommandCallback>,
    on_failure: Option<CommandCallback>,
    on_timeout: Option<CommandCallback>,
    state: Cell<CommandState>,
    token: RefCell<CancellationToken>,
}

impl SimpleCommand {
    pub fn new(id: impl Into<String>, patterns: impl Into<PatternSet>) -> Self {
        let defaults = CommandDefaults::default();
        Self {
            core: MatchCore::new(id, patterns),
            success: Vec::new(),
            failure: Vec::new(),
            retry: Vec::new(),
            max_retry: defaults.max_retry,
            retry_backoff: defaults.retry_backoff(),
            default_text: None,
            on_success: None,
            on_failure: None,
            on_timeout: None,
            state: Cell::new(CommandState::Idle),
            token: RefCell::new(CancellationToken::new()),
        }
        .with_sync(false)
        .with_timeout(defaults.timeout())
    }

    /// 套用 Session 設定的預設逾時與重試值
    pub fn with_defaults(mut self, defaults: &CommandDefaults) -> Self {
        self.max_retry = defaults.max_retry;
        self.retry_backoff = defaults.retry_backoff();
        self.with_timeout(defaults.timeout())
    }

    pub fn with_success(mut self, trigger: Trigger) -> Self {
        self.success.push(Self::outcome(trigger));
        self
    }

    pub fn with_failure(mut self, trigger: Trigger) -> Self {
        self.failure.push(Self::outcome(trigger));
        self
    }

    pub fn with_retry(mut self, trigger: Trigger) -> Self {
        self.retry.push(Self::outcome(trigger));
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// 以空字串執行時送出的命令
    pub fn with_default_text(mut self, text: impl Into<String>) -> Self {
        self.default_text = Some(text.into());
        self
    }

    /// 成功回呼，收到送出的命令文字、匹配行與捕獲群組
    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&Session, &CommandResult) -> Result<(), ScriptError> + 'static,
    {
        self.on_success = Some(Rc::new(f));
        self
    }

    pub fn on_failure<F>(mut self, f: F) -> Self
    where
        F: Fn(&Session, &CommandResult) -> Result<(), ScriptError> + 'static,
    {
        self.on_failure = Some(Rc::new(f));
        self
    }

    /// 逾時回呼，`CommandResult::timeout` 為當次使用的逾時
    pub fn on_timeout<F>(mut self, f: F) -> Self
    where
        F: Fn(&Session, &CommandResult) -> Result<(), ScriptError> + 'static,
    {
        self.on_timeout = Some(Rc::new(f));
        self
    }

    pub fn state(&self) -> CommandState {
        self.state.get()
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }

    // 結果觸發器只記錄狀態，不阻擋其他觸發器
    fn outcome(trigger: Trigger) -> Rc<Trigger> {
        Rc::new(trigger.with_sync(false).with_keep_eval(true))
    }

    fn set_state(&self, state: CommandState) {
        debug!("命令 {} 狀態: {:?} -> {:?}", self.core.id(), self.state.get(), state);
        self.state.set(state);
    }

    fn token(&self) -> CancellationToken {
        let mut token = self.token.borrow_mut();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        token.clone()
    }

    fn notify(&self, session: &Session, callback: Option<&CommandCallback>, result: &CommandResult, what: &str) {
        if let Some(cb) = callback {
            if let Err(e) = cb(session, result) {
                session.report_error(&format!("{} {}", self.core.id(), what), &e);
            }
        }
    }

    fn outcomes(&self) -> impl Iterator<Item = (Outcome, &Rc<Trigger>)> {
        self.success
            .iter()
            .map(|t| (Outcome::Success, t))
            .chain(self.failure.iter().map(|t| (Outcome::Failure, t)))
            .chain(self.retry.iter().map(|t| (Outcome::Retry, t)))
    }

    /// 執行命令，`callback` 在命令本身的回呼之後呼叫
    pub async fn execute_with(
        &self,
        session: &Session,
        cmd: &str,
        callback: Option<CommandCallback>,
    ) -> CommandResult {
        let text = match (cmd.is_empty(), &self.default_text) {
            (true, Some(default)) => default.as_str(),
            _ => cmd,
        };
        let id = self.core.id();
        let timeout = self.core.timeout();
        let token = self.token();
        let mut retries: u32 = 0;

        let result = loop {
            for (_, trigger) in self.outcomes() {
                trigger.core().reset();
            }
            self.set_state(CommandState::Issued);

            // 先建立等待再送出，避免回應比等待早到
            let mut waits = JoinSet::new();
            for (kind, trigger) in self.outcomes() {
                let trigger = Rc::clone(trigger);
                waits.spawn_local(async move { (kind, trigger.core().event().wait().await) });
            }

            session.write_line(text);
            self.set_state(CommandState::AwaitingOutcome);

            let first = async {
                if waits.is_empty() {
                    std::future::pending().await
                } else {
                    waits.join_next().await
                }
            };

            let raced = tokio::select! {
                _ = token.cancelled() => None,
                r = tokio::time::timeout(timeout, first) => Some(r),
            };
            waits.abort_all();

            let base = CommandResult::new(MatchState::Abort, id, text, timeout);
            let (kind, matched) = match raced {
                None => break base,
                Some(Err(_)) => {
                    self.set_state(CommandState::TimedOut);
                    break CommandResult { state: MatchState::Timeout, ..base };
                }
                Some(Ok(Some(Ok((kind, Some(matched)))))) => (kind, matched),
                Some(Ok(_)) => break base,
            };

            match kind {
                Outcome::Success => {
                    self.set_state(CommandState::Succeeded);
                    break CommandResult { state: MatchState::Success, ..base }.with_match(matched);
                }
                Outcome::Failure => {
                    self.set_state(CommandState::Failed);
                    break CommandResult { state: MatchState::Failure, ..base }.with_match(matched);
                }
                Outcome::Retry => {
                    retries += 1;
                    if retries > self.max_retry {
                        warn!("命令 {} 重試 {} 次後放棄", id, self.max_retry);
                        self.set_state(CommandState::Failed);
                        break CommandResult { state: MatchState::Failure, ..base }.with_match(matched);
                    }
                    self.set_state(CommandState::Retrying);
                    let cancelled = tokio::select! {
                        _ = token.cancelled() => true,
                        _ = tokio::time::sleep(self.retry_backoff) => false,
                    };
                    if cancelled {
                        break base;
                    }
                }
            }
        };

        match result.state {
            MatchState::Success => {
                self.core.run_success(session, &result.as_match_result());
                self.notify(session, self.on_success.as_ref(), &result, "成功回呼");
            }
            MatchState::Failure => {
                self.core.run_failure(session, &result.as_match_result());
                self.notify(session, self.on_failure.as_ref(), &result, "失敗回呼");
            }
            MatchState::Timeout => {
                info!("命令 {} 逾時 ({:?})", id, timeout);
                self.core.run_timeout(session, &result.as_match_result());
                self.notify(session, self.on_timeout.as_ref(), &result, "逾時回呼");
            }
            _ => {
                debug!("命令 {} 已取消", id);
                self.set_state(CommandState::Idle);
                return result;
            }
        }
        self.notify(session, callback.as_ref(), &result, "覆寫回呼");
        result
    }
}

impl PatternObject for SimpleCommand {
    fn core(&self) -> &MatchCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MatchCore {
        &mut self.core
    }
}

impl Command for SimpleCommand {
    fn execute<'a>(&'a self, session: &'a Session, cmd: &'a str) -> CommandFuture<'a> {
        Box::pin(async move { Ok(self.execute_with(session, cmd, None).await) })
    }

    fn reset(&self) {
        self.token.borrow().cancel();
        for (_, trigger) in self.outcomes() {
            trigger.core().reset();
        }
    }

    fn outcome_triggers(&self) -> Vec<Rc<Trigger>> {
        self.outcomes().map(|(_, t)| Rc::clone(t)).collect()
    }
}

impl fmt::Debug for SimpleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleCommand")
            .field("core", &self.core)
            .field("state", &self.state.get())
            .field("max_retry", &self.max_retry)
            .field("retry_backoff", &self.retry_backoff)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::display::NullSink;
    use crate::pattern::{Pattern, DEFAULT_TIMEOUT};
    use tokio::task::LocalSet;
    use tokio::time::Instant;

    fn session() -> Session {
        Session::new("cmd", SessionConfig::default(), Rc::new(NullSink))
    }

    fn walk() -> SimpleCommand {
        SimpleCommand::new("walk", Pattern::regex("^(n|s|e|w)$").unwrap())
            .with_success(Trigger::new("walk_ok", Pattern::regex(r"^你來到了(\S+)").unwrap()))
            .with_failure(Trigger::new("walk_fail", Pattern::exact("這個方向沒有出路。")))
            .with_retry(Trigger::new("walk_busy", Pattern::exact("You are busy.")))
            .with_max_retry(3)
            .with_retry_backoff(Duration::from_millis(500))
    }

    fn start(session: &Session, cmd: &Rc<SimpleCommand>, text: &str) -> tokio::task::JoinHandle<CommandResult> {
        let (session, cmd, text) = (session.clone(), Rc::clone(cmd), text.to_string());
        tokio::task::spawn_local(async move { cmd.execute_with(&session, &text, None).await })
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_exhausted() {
        LocalSet::new()
            .run_until(async {
                let session = session();
                let mut rx = session.bind_outbound();
                let cmd = Rc::new(walk());
                session.add_object(Rc::clone(&cmd));

                let task = start(&session, &cmd, "n");
                // 第一次送出加上三次重試
                for _ in 0..4 {
                    assert_eq!(rx.recv().await.unwrap(), b"n\r\n");
                    session.feed(b"You are busy.\r\n");
                }

                let result = task.await.unwrap();
                assert_eq!(result.state, MatchState::Failure);
                assert_eq!(result.line, "You are busy.");
                assert_eq!(cmd.state(), CommandState::Failed);
                assert!(rx.try_recv().is_err());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_with_override_callback() {
        LocalSet::new()
            .run_until(async {
                let session = session();
                let mut rx = session.bind_outbound();
                let cmd = Rc::new(walk());
                session.add_object(Rc::clone(&cmd));

                let seen = Rc::new(RefCell::new(None));
                let task = {
                    let (session, cmd, seen) = (session.clone(), Rc::clone(&cmd), Rc::clone(&seen));
                    tokio::task::spawn_local(async move {
                        let cb: CommandCallback = Rc::new(move |_: &Session, r: &CommandResult| {
                            *seen.borrow_mut() = Some(r.wildcards.clone());
                            Ok(())
                        });
                        cmd.execute_with(&session, "e", Some(cb)).await
                    })
                };

                assert_eq!(rx.recv().await.unwrap(), b"e\r\n");
                session.feed("你來到了廣場\r\n".as_bytes());

                let result = task.await.unwrap();
                assert_eq!(result.state, MatchState::Success);
                assert_eq!(result.command, "e");
                assert_eq!(result.wildcards, vec!["廣場"]);
                assert_eq!(cmd.state(), CommandState::Succeeded);
                assert_eq!(*seen.borrow(), Some(vec!["廣場".to_string()]));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_trigger() {
        LocalSet::new()
            .run_until(async {
                let session = session();
                let mut rx = session.bind_outbound();
                let cmd = Rc::new(walk().on_failure(|s: &Session, r: &CommandResult| {
                    s.set_variable("blocked", r.command.as_str());
                    Ok(())
                }));
                session.add_object(Rc::clone(&cmd));

                let task = start(&session, &cmd, "w");
                rx.recv().await.unwrap();
                session.feed("這個方向沒有出路。\r\n".as_bytes());

                assert_eq!(task.await.unwrap().state, MatchState::Failure);
                assert_eq!(session.get_variable("blocked", false), serde_json::json!("w"));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        LocalSet::new()
            .run_until(async {
                let session = session();
                let _rx = session.bind_outbound();
                let cmd = Rc::new(walk());
                session.add_object(Rc::clone(&cmd));

                let begin = Instant::now();
                let result = start(&session, &cmd, "s").await.unwrap();
                assert_eq!(result.state, MatchState::Timeout);
                assert_eq!(result.timeout, DEFAULT_TIMEOUT);
                assert!(begin.elapsed() >= DEFAULT_TIMEOUT);
                assert_eq!(cmd.state(), CommandState::TimedOut);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_callback_sees_command() {
        LocalSet::new()
            .run_until(async {
                let session = session();
                let _rx = session.bind_outbound();
                let seen = Rc::new(RefCell::new(None));
                let cmd = {
                    let seen = Rc::clone(&seen);
                    Rc::new(
                        walk()
                            .with_timeout(Duration::from_secs(3))
                            .on_timeout(move |_: &Session, r: &CommandResult| {
                                *seen.borrow_mut() = Some((r.id.clone(), r.command.clone(), r.timeout));
                                Ok(())
                            }),
                    )
                };
                session.add_object(Rc::clone(&cmd));

                let result = start(&session, &cmd, "s").await.unwrap();
                assert_eq!(result.state, MatchState::Timeout);
                assert_eq!(
                    *seen.borrow(),
                    Some(("walk".to_string(), "s".to_string(), Duration::from_secs(3)))
                );
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_callback_sees_command_and_wildcards() {
        LocalSet::new()
            .run_until(async {
                let session = session();
                let mut rx = session.bind_outbound();
                let cmd = Rc::new(walk().on_success(|s: &Session, r: &CommandResult| {
                    s.set_variable("moved", format!("{} {} {}", r.command, r.line, r.wildcards.join(",")));
                    Ok(())
                }));
                session.add_object(Rc::clone(&cmd));

                let task = start(&session, &cmd, "n");
                rx.recv().await.unwrap();
                session.feed("你來到了客棧\r\n".as_bytes());

                assert_eq!(task.await.unwrap().state, MatchState::Success);
                assert_eq!(
                    session.get_variable("moved", ""),
                    serde_json::json!("n 你來到了客棧 客棧")
                );
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_aborts() {
        LocalSet::new()
            .run_until(async {
                let session = session();
                let mut rx = session.bind_outbound();
                let cmd = Rc::new(walk());
                session.add_object(Rc::clone(&cmd));

                let task = start(&session, &cmd, "n");
                rx.recv().await.unwrap();
                cmd.reset();

                assert_eq!(task.await.unwrap().state, MatchState::Abort);
                assert_eq!(cmd.state(), CommandState::Idle);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exec_routes_to_command() {
        LocalSet::new()
            .run_until(async {
                let session = session();
                let mut rx = session.bind_outbound();
                let cmd = Rc::new(walk().with_default_text("look"));
                session.add_object(Rc::clone(&cmd));

                session.exec("n");
                assert_eq!(rx.recv().await.unwrap(), b"n\r\n");
                assert_eq!(session.active_tasks(), 1);
                session.feed("你來到了樹林\r\n".as_bytes());
                tokio::time::sleep(Duration::from_millis(1)).await;
                assert_eq!(cmd.state(), CommandState::Succeeded);

                // 沒有匹配命令的文字直接送出
                session.exec("look");
                assert_eq!(rx.recv().await.unwrap(), b"look\r\n");
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_text() {
        LocalSet::new()
            .run_until(async {
                let session = session();
                let mut rx = session.bind_outbound();
                let cmd = Rc::new(walk().with_default_text("look"));

                let task = start(&session, &cmd, "");
                assert_eq!(rx.recv().await.unwrap(), b"look\r\n");
                cmd.reset();
                assert_eq!(task.await.unwrap().command, "look");
            })
            .await;
    }
}
