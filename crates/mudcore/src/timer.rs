//! Timer（定時器）模組
//!
//! 每隔 `timeout` 執行一次回呼；`one_shot` 時執行一次後自動移除

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::script::ScriptError;
use crate::session::{Session, WeakSession};

pub type TimerCallback = Rc<dyn Fn(&Session) -> Result<(), ScriptError>>;

/// 定時器
pub struct Timer {
    id: String,
    group: String,
    timeout: Duration,
    one_shot: bool,
    enabled: Cell<bool>,
    fired: Cell<u64>,
    callback: Option<TimerCallback>,
    session: RefCell<Option<WeakSession>>,
    handle: RefCell<Option<JoinHandle<()>>>,
}

impl Timer {
    pub fn new(id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            id: id.into(),
            group: String::new(),
            timeout,
            one_shot: false,
            enabled: Cell::new(true),
            fired: Cell::new(0),
            callback: None,
            session: RefCell::new(None),
            handle: RefCell::new(None),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_one_shot(mut self, one_shot: bool) -> Self {
        self.one_shot = one_shot;
        self
    }

    pub fn with_enabled(self, enabled: bool) -> Self {
        self.enabled.set(enabled);
        self
    }

    pub fn with_callback<F>(mut self, f: F) -> Self
    where
        F: Fn(&Session) -> Result<(), ScriptError> + 'static,
    {
        self.callback = Some(Rc::new(f));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn one_shot(&self) -> bool {
        self.one_shot
    }

    pub fn enabled(&self) -> bool {
        self.enabled.get()
    }

    /// 已觸發次數
    pub fn fired(&self) -> u64 {
        self.fired.get()
    }

    /// 是否有排程中的任務
    pub fn is_scheduled(&self) -> bool {
        self.handle.borrow().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// 停用時立即取消排程；重新啟用時建立新的排程
    pub fn set_enabled(self: &Rc<Self>, enabled: bool) {
        self.enabled.set(enabled);
        self.cancel();
        if enabled {
            self.schedule();
        }
    }

    /// 加入 Session 時呼叫
    pub(crate) fn attach(self: &Rc<Self>, session: WeakSession) {
        *self.session.borrow_mut() = Some(session);
        self.cancel();
        if self.enabled.get() {
            self.schedule();
        }
    }

    /// 取消排程（已完成或未排程時不做事）
    pub fn cancel(&self) {
        if let Some(handle) = self.handle.borrow_mut().take() {
            handle.abort();
        }
    }

    fn schedule(self: &Rc<Self>) {
        let Some(session) = self.session.borrow().clone() else {
            return;
        };
        let timer = Rc::downgrade(self);
        let period = self.timeout;

        let handle = tokio::task::spawn_local(async move {
            loop {
                tokio::time::sleep(period).await;
                let (Some(timer), Some(session)) = (timer.upgrade(), session.upgrade()) else {
                    break;
                };
                if !timer.fire(&session) {
                    break;
                }
            }
        });
        *self.handle.borrow_mut() = Some(handle);
    }

    // 回傳是否繼續排程
    fn fire(&self, session: &Session) -> bool {
        if !self.enabled.get() {
            return false;
        }
        self.fired.set(self.fired.get() + 1);
        trace!("定時器 {} 觸發 (第 {} 次)", self.id, self.fired.get());

        if let Some(cb) = &self.callback {
            if let Err(e) = cb(session) {
                session.report_error(&format!("定時器 {}", self.id), &e);
            }
        }

        if self.one_shot {
            debug!("一次性定時器 {} 移除", self.id);
            // 先取出自己的 handle，移除時不會中止正在執行的任務
            self.handle.borrow_mut().take();
            session.del_timer(&self.id);
            return false;
        }
        true
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("group", &self.group)
            .field("timeout", &self.timeout)
            .field("one_shot", &self.one_shot)
            .field("enabled", &self.enabled.get())
            .field("fired", &self.fired.get())
            .finish_non_exhaustive()
    }
}
