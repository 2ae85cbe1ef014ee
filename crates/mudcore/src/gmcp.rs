//! GMCP 觸發器模組
//!
//! 以 GMCP 訊息名稱（例如 `Char.Vitals`）為鍵，保存最近一次解碼的值

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;

use crate::pattern::{CompletionEvent, DEFAULT_TIMEOUT};
use crate::script::ScriptError;
use crate::session::Session;

pub type GmcpCallback = Rc<dyn Fn(&Session, &str, &Value) -> Result<(), ScriptError>>;

/// GMCP 觸發器
pub struct GmcpTrigger {
    name: String,
    group: String,
    enabled: Cell<bool>,
    timeout: Duration,
    value: RefCell<Value>,
    event: CompletionEvent<Value>,
    callback: Option<GmcpCallback>,
}

impl GmcpTrigger {
    /// `name` 同時作為註冊鍵
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: String::new(),
            enabled: Cell::new(true),
            timeout: DEFAULT_TIMEOUT,
            value: RefCell::new(Value::Null),
            event: CompletionEvent::new(),
            callback: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_callback<F>(mut self, f: F) -> Self
    where
        F: Fn(&Session, &str, &Value) -> Result<(), ScriptError> + 'static,
    {
        self.callback = Some(Rc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn enabled(&self) -> bool {
        self.enabled.get()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled);
    }

    /// 最近一次收到的值
    pub fn value(&self) -> Value {
        self.value.borrow().clone()
    }

    pub fn reset(&self) {
        self.event.reset();
    }

    pub fn abort(&self) {
        self.event.abort();
    }

    /// 解析原始 JSON 文字；不是合法 JSON 時當作字串
    pub fn parse(raw: &str) -> Value {
        if raw.trim().is_empty() {
            return Value::Null;
        }
        serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
    }

    /// 收到對應的 GMCP 訊息
    pub fn feed(&self, session: &Session, raw: &str) {
        if !self.enabled.get() {
            return;
        }
        let value = Self::parse(raw);
        *self.value.borrow_mut() = value.clone();
        self.event.set(value.clone());

        if let Some(cb) = &self.callback {
            if let Err(e) = cb(session, &self.name, &value) {
                session.report_error(&format!("GMCP {}", self.name), &e);
            }
        }
    }

    /// 等待下一筆訊息，逾時或取消時回傳 `None`
    pub async fn triggered(&self) -> Option<Value> {
        self.event.reset();
        tokio::time::timeout(self.timeout, self.event.wait())
            .await
            .ok()
            .flatten()
    }
}

impl fmt::Debug for GmcpTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GmcpTrigger")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("enabled", &self.enabled.get())
            .field("value", &self.value.borrow())
            .finish_non_exhaustive()
    }
}
