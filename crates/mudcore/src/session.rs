//! Session（連線會話）模組
//!
//! 一個 Session 對應一條伺服器連線：驅動協定引擎與行組裝器，
//! 將每一行交給觸發器評估，並把命令寫回伺服器。
//!
//! Session 只在單一執行緒的 `LocalSet` 中使用；所有狀態以 `RefCell` / `Cell`
//! 保存，任何借用都不會跨越 `.await` 或使用者回呼。

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::alias::Alias;
use crate::command::Command;
use crate::config::SessionConfig;
use crate::display::{DisplaySink, MessageLevel};
use crate::encoding::TextCodec;
use crate::gmcp::GmcpTrigger;
use crate::line::{Line, LineAssembler};
use crate::module::{ModuleLoader, ScriptModule};
use crate::pattern::PatternObject;
use crate::persist::VariableStore;
use crate::registry::{GroupCounts, ObjectKind, SessionObject, SessionRegistry};
use crate::script::ScriptError;
use crate::telnet::protocol::{self, IAC};
use crate::telnet::{ProtocolEngine, ProtocolEvent, TelnetClient, TelnetConfig, TelnetError, TelnetOption};
use crate::timer::Timer;
use crate::trigger::Trigger;
use crate::variables::GlobalVariables;

struct SessionInner {
    name: String,
    config: SessionConfig,
    display: Rc<dyn DisplaySink>,
    engine: RefCell<ProtocolEngine>,
    assembler: RefCell<LineAssembler>,
    registry: RefCell<SessionRegistry>,
    outbound: RefCell<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    shutdown: RefCell<CancellationToken>,
    user_disconnect: Cell<bool>,
    closed: Cell<bool>,
    server_echo: Cell<bool>,
    gmcp: RefCell<BTreeMap<String, Value>>,
    mssp: RefCell<BTreeMap<String, String>>,
    msdp: RefCell<BTreeMap<String, Value>>,
    modules: RefCell<Vec<(String, Box<dyn ScriptModule>)>>,
    loader: RefCell<Option<Rc<dyn ModuleLoader>>>,
    store: RefCell<Option<Rc<dyn VariableStore>>>,
    globals: GlobalVariables,
}

/// 連線會話（可複製的共享參照）
#[derive(Clone)]
pub struct Session {
    inner: Rc<SessionInner>,
}

/// 不持有所有權的 Session 參照，供物件與腳本回呼保存
#[derive(Clone)]
pub struct WeakSession(Weak<SessionInner>);

impl WeakSession {
    pub fn upgrade(&self) -> Option<Session> {
        self.0.upgrade().map(|inner| Session { inner })
    }
}

impl fmt::Debug for WeakSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakSession")
    }
}

impl Session {
    pub fn new(name: impl Into<String>, config: SessionConfig, display: Rc<dyn DisplaySink>) -> Self {
        Self::with_globals(name, config, display, GlobalVariables::new())
    }

    /// 與其他 Session 共用全域變數
    pub fn with_globals(
        name: impl Into<String>,
        config: SessionConfig,
        display: Rc<dyn DisplaySink>,
        globals: GlobalVariables,
    ) -> Self {
        let codec = TextCodec::for_label(&config.encoding).unwrap_or_else(|| {
            warn!("不認識的編碼 {}，改用 UTF-8", config.encoding);
            TextCodec::utf8()
        });

        let inner = SessionInner {
            name: name.into(),
            engine: RefCell::new(ProtocolEngine::from_config(&config)),
            assembler: RefCell::new(LineAssembler::new(&config.newline, codec)),
            registry: RefCell::new(SessionRegistry::new()),
            outbound: RefCell::new(None),
            shutdown: RefCell::new(CancellationToken::new()),
            user_disconnect: Cell::new(false),
            closed: Cell::new(false),
            server_echo: Cell::new(false),
            gmcp: RefCell::new(BTreeMap::new()),
            mssp: RefCell::new(BTreeMap::new()),
            msdp: RefCell::new(BTreeMap::new()),
            modules: RefCell::new(Vec::new()),
            loader: RefCell::new(None),
            store: RefCell::new(None),
            globals,
            display,
            config,
        };
        Self { inner: Rc::new(inner) }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession(Rc::downgrade(&self.inner))
    }

    pub fn is_connected(&self) -> bool {
        self.inner.outbound.borrow().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// 伺服器是否負責回顯（通常表示正在輸入密碼）
    pub fn server_echo(&self) -> bool {
        self.inner.server_echo.get()
    }

    /// 目前的文字編碼
    pub fn codec(&self) -> TextCodec {
        self.inner.assembler.borrow().codec()
    }

    // ---- 顯示與錯誤回報 ----

    /// 在本地顯示一行文字
    pub fn echo(&self, text: &str) {
        self.inner.display.line(text);
    }

    pub fn info(&self, text: &str) {
        info!("[{}] {}", self.inner.name, text);
        self.inner.display.message(MessageLevel::Info, text);
    }

    pub fn warning(&self, text: &str) {
        warn!("[{}] {}", self.inner.name, text);
        self.inner.display.message(MessageLevel::Warning, text);
    }

    /// 回報回呼或命令的錯誤，不中斷 Session
    pub fn report_error(&self, context: &str, err: &dyn fmt::Display) {
        error!("[{}] {}: {}", self.inner.name, context, err);
        self.inner
            .display
            .message(MessageLevel::Error, &format!("{}: {}", context, err));
    }

    // ---- 輸入 ----

    /// 餵入伺服器送來的位元組
    pub fn feed(&self, data: &[u8]) {
        trace!("<< {:02x?}", data);
        let events = self.inner.engine.borrow_mut().feed(data);

        for event in events {
            match event {
                ProtocolEvent::Data(bytes) => {
                    let lines = self.inner.assembler.borrow_mut().push(&bytes);
                    for line in &lines {
                        self.dispatch_line(line);
                    }
                }
                ProtocolEvent::GoAhead => {
                    let line = self.inner.assembler.borrow_mut().flush();
                    if let Some(line) = line {
                        self.dispatch_line(&line);
                    }
                }
                ProtocolEvent::Send(bytes) => self.write_bytes(bytes),
                ProtocolEvent::Echo(on) => {
                    debug!("伺服器回顯: {}", on);
                    self.inner.server_echo.set(on);
                }
                ProtocolEvent::Charset(label) => match TextCodec::for_label(&label) {
                    Some(codec) => {
                        info!("切換編碼為 {}", codec.name());
                        self.inner.assembler.borrow_mut().set_codec(codec);
                    }
                    None => warn!("無法使用協商的編碼 {}", label),
                },
                ProtocolEvent::Gmcp { name, value } => self.feed_gmcp(&name, &value),
                ProtocolEvent::Mssp { name, value } => {
                    debug!("MSSP {} = {}", name, value);
                    self.inner.mssp.borrow_mut().insert(name, value);
                }
                ProtocolEvent::Msdp { name, value } => {
                    debug!("MSDP {} = {}", name, value);
                    self.inner.msdp.borrow_mut().insert(name, value);
                }
            }
        }
    }

    /// 收到一筆 GMCP 訊息
    pub fn feed_gmcp(&self, name: &str, raw: &str) {
        debug!("GMCP {} {}", name, raw);
        self.inner
            .gmcp
            .borrow_mut()
            .insert(name.to_string(), GmcpTrigger::parse(raw));

        let handler = self.inner.registry.borrow().gmcp(name);
        if let Some(handler) = handler {
            handler.feed(self, raw);
        }
    }

    /// 對一行執行觸發器
    ///
    /// 依優先級（同級依加入順序）評估；非 `keep_eval` 的觸發器成功後停止，
    /// `one_shot` 的觸發器成功後立即移除
    pub fn dispatch_line(&self, line: &Line) {
        self.inner.display.line(&line.raw);
        {
            let mut registry = self.inner.registry.borrow_mut();
            let vars = registry.variables_mut();
            vars.set("%line", line.text.as_str());
            vars.set("%raw", line.raw.as_str());
        }

        let triggers = self.inner.registry.borrow().enabled_triggers();
        for trigger in triggers {
            // 前面的回呼可能已停用或移除此觸發器
            if !trigger.enabled() || !self.holds_trigger(&trigger) {
                continue;
            }
            let text = if trigger.raw() { &line.raw } else { &line.text };
            let result = trigger.core().match_line(self, text, true);
            if !result.is_success() {
                continue;
            }
            if trigger.core().one_shot() {
                self.remove_object(ObjectKind::Trigger, trigger.id());
            }
            if !trigger.keep_eval() {
                break;
            }
        }
    }

    fn holds_trigger(&self, trigger: &Rc<Trigger>) -> bool {
        self.inner
            .registry
            .borrow()
            .trigger(trigger.id())
            .is_some_and(|cur| Rc::ptr_eq(&cur, trigger))
    }

    // ---- 輸出 ----

    /// 執行使用者或腳本的命令文字
    ///
    /// 以分隔符號拆開後逐一處理：第一個匹配的 Command 執行；沒有 Command
    /// 匹配時評估 Alias；都沒有匹配時原文送往伺服器
    pub fn exec(&self, text: &str) {
        let sep = self.inner.config.command_separator.as_str();
        if sep.is_empty() {
            self.exec_one(text);
        } else {
            for part in text.split(sep) {
                self.exec_one(part.trim());
            }
        }
    }

    fn exec_one(&self, cmd: &str) {
        let commands = self.inner.registry.borrow().enabled_commands();
        for command in commands {
            if command.core().match_line(self, cmd, false).is_success() {
                debug!("命令 {} 處理: {}", command.id(), cmd);
                self.spawn_command(command, cmd.to_string());
                return;
            }
        }

        let aliases = self.inner.registry.borrow().enabled_aliases();
        let mut handled = false;
        for alias in aliases {
            if alias.core().match_line(self, cmd, true).is_success() {
                handled = true;
                if !alias.keep_eval() {
                    break;
                }
            }
        }

        if !handled {
            self.write_line(cmd);
        }
    }

    fn spawn_command(&self, command: Rc<dyn Command>, text: String) {
        let session = self.clone();
        self.spawn(async move {
            if let Err(e) = command.execute(&session, &text).await {
                session.report_error(&format!("命令 {}", command.id()), &e);
            }
        });
    }

    /// 在 Session 的 LocalSet 上執行背景任務，`clean` 時一併取消
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let handle = tokio::task::spawn_local(future);
        self.inner.registry.borrow_mut().track(handle);
    }

    /// 直接送出一行（不經過 Alias / Command）
    pub fn write_line(&self, text: &str) {
        let encoded = self.codec().encode(text);
        let mut out = Vec::with_capacity(encoded.len() + 2);
        for b in encoded {
            out.push(b);
            if b == IAC {
                out.push(IAC);
            }
        }
        out.extend_from_slice(b"\r\n");
        self.write_bytes(out);
    }

    /// 送出原始位元組
    pub fn write_bytes(&self, data: Vec<u8>) {
        trace!(">> {:02x?}", data);
        match self.inner.outbound.borrow().as_ref() {
            Some(tx) => {
                if tx.send(data).is_err() {
                    warn!("連線寫入端已關閉");
                }
            }
            None => debug!("未連線，丟棄 {} 位元組", data.len()),
        }
    }

    /// 建立新的輸出通道並回傳接收端
    pub fn bind_outbound(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.outbound.borrow_mut() = Some(tx);
        rx
    }

    /// 視窗大小變更；NAWS 已協商時送出
    pub fn set_window_size(&self, width: u16, height: u16) {
        let bytes = self.inner.engine.borrow_mut().negotiator_mut().resize(width, height);
        if let Some(bytes) = bytes {
            self.write_bytes(bytes);
        }
    }

    /// 送出 GMCP 訊息；伺服器未啟用 GMCP 時忽略
    pub fn send_gmcp(&self, package: &str, value: Option<&Value>) -> bool {
        let enabled = self
            .inner
            .engine
            .borrow()
            .negotiator()
            .is_remote_enabled(TelnetOption::Gmcp);
        if !enabled {
            warn!("GMCP 尚未啟用，忽略 {}", package);
            return false;
        }
        self.write_bytes(protocol::gmcp(package, value));
        true
    }

    // ---- 協定資料 ----

    pub fn gmcp(&self, name: &str) -> Option<Value> {
        self.inner.gmcp.borrow().get(name).cloned()
    }

    pub fn mssp(&self) -> BTreeMap<String, String> {
        self.inner.mssp.borrow().clone()
    }

    pub fn msdp(&self, name: &str) -> Option<Value> {
        self.inner.msdp.borrow().get(name).cloned()
    }

    // ---- 物件管理 ----

    /// 加入物件；同 id 的舊物件被取代並回傳
    pub fn add_object(&self, obj: impl Into<SessionObject>) -> Option<SessionObject> {
        let obj = obj.into();
        let timer = match &obj {
            SessionObject::Timer(t) => Some(Rc::clone(t)),
            _ => None,
        };
        let old = self.inner.registry.borrow_mut().add(obj);
        if let Some(timer) = timer {
            timer.attach(self.downgrade());
        }
        old
    }

    pub fn add_objects<I>(&self, objs: I)
    where
        I: IntoIterator,
        I::Item: Into<SessionObject>,
    {
        for obj in objs {
            self.add_object(obj);
        }
    }

    /// 依物件的種類與 id 移除
    pub fn del_object(&self, obj: impl Into<SessionObject>) -> bool {
        let obj = obj.into();
        self.remove_object(obj.kind(), obj.id()).is_some()
    }

    /// 回傳實際移除的數量
    pub fn del_objects<I>(&self, objs: I) -> usize
    where
        I: IntoIterator,
        I::Item: Into<SessionObject>,
    {
        objs.into_iter().map(|o| self.del_object(o)).filter(|&removed| removed).count()
    }

    pub fn remove_object(&self, kind: ObjectKind, id: &str) -> Option<SessionObject> {
        self.inner.registry.borrow_mut().remove(kind, id)
    }

    pub fn del_timer(&self, id: &str) -> bool {
        self.remove_object(ObjectKind::Timer, id).is_some()
    }

    /// 啟用或停用群組
    pub fn enable_group(&self, group: &str, enabled: bool) -> GroupCounts {
        self.inner.registry.borrow().enable_group(group, enabled)
    }

    pub fn get_unique_id(&self, prefix: &str) -> String {
        self.inner.registry.borrow_mut().get_unique_id(prefix)
    }

    pub fn trigger(&self, id: &str) -> Option<Rc<Trigger>> {
        self.inner.registry.borrow().trigger(id)
    }

    pub fn alias(&self, id: &str) -> Option<Rc<Alias>> {
        self.inner.registry.borrow().alias(id)
    }

    pub fn command(&self, id: &str) -> Option<Rc<dyn Command>> {
        self.inner.registry.borrow().command(id)
    }

    pub fn timer(&self, id: &str) -> Option<Rc<Timer>> {
        self.inner.registry.borrow().timer(id)
    }

    pub fn gmcp_trigger(&self, name: &str) -> Option<Rc<GmcpTrigger>> {
        self.inner.registry.borrow().gmcp(name)
    }

    /// 某類物件的 id（字母序）
    pub fn ids(&self, kind: ObjectKind) -> Vec<String> {
        self.inner.registry.borrow().ids(kind)
    }

    pub fn active_tasks(&self) -> usize {
        self.inner.registry.borrow().active_tasks()
    }

    // ---- 變數 ----

    pub fn set_variable(&self, name: &str, value: impl Into<Value>) {
        self.inner.registry.borrow_mut().variables_mut().set(name, value);
    }

    /// 取值，不存在時回傳 `default`
    pub fn get_variable(&self, name: &str, default: impl Into<Value>) -> Value {
        self.inner.registry.borrow().variables().get_or(name, default)
    }

    pub fn variable(&self, name: &str) -> Option<Value> {
        self.inner.registry.borrow().variables().get(name).cloned()
    }

    pub fn del_variable(&self, name: &str) -> Option<Value> {
        self.inner.registry.borrow_mut().variables_mut().remove(name)
    }

    /// # Panics
    /// 名稱與值的數量不同或為空時
    pub fn set_variables<S: AsRef<str>>(&self, names: &[S], values: Vec<Value>) {
        self.inner.registry.borrow_mut().variables_mut().set_many(names, values);
    }

    /// # Panics
    /// 名稱列表為空時
    pub fn get_variables<S: AsRef<str>>(&self, names: &[S]) -> Vec<Value> {
        self.inner.registry.borrow().variables().get_many(names)
    }

    pub fn global_variables(&self) -> &GlobalVariables {
        &self.inner.globals
    }

    /// 設定變數存檔；`load_variables` 開啟時立即載入
    pub fn set_variable_store(&self, store: Rc<dyn VariableStore>) {
        if self.inner.config.load_variables {
            match store.load(&self.inner.name) {
                Ok(values) => self.inner.registry.borrow_mut().variables_mut().extend(values),
                Err(e) => self.report_error("載入變數", &e),
            }
        }
        *self.inner.store.borrow_mut() = Some(store);
    }

    /// 立即儲存變數；沒有設定存檔時不做事
    pub fn save_variables(&self) {
        let Some(store) = self.inner.store.borrow().clone() else {
            return;
        };
        let vars = self.inner.registry.borrow().variables().clone();
        if let Err(e) = store.save(&self.inner.name, &vars) {
            self.report_error("儲存變數", &e);
        }
    }

    // ---- 模組 ----

    pub fn set_module_loader(&self, loader: Rc<dyn ModuleLoader>) {
        *self.inner.loader.borrow_mut() = Some(loader);
    }

    /// 載入模組；已載入時先卸載。載入器沒有該模組時回傳 `Ok(false)`
    pub fn load_module(&self, id: &str) -> Result<bool, ScriptError> {
        if self.modules().iter().any(|m| m == id) {
            self.unload_module(id);
        }
        let loader = self
            .inner
            .loader
            .borrow()
            .clone()
            .ok_or_else(|| ScriptError::NotFound(format!("沒有模組載入器: {}", id)))?;

        let Some(mut module) = loader.load(id, self)? else {
            return Ok(false);
        };
        module.register(self)?;
        info!("[{}] 已載入模組 {} ({})", self.inner.name, id, module.name());
        self.inner.modules.borrow_mut().push((id.to_string(), module));
        Ok(true)
    }

    pub fn unload_module(&self, id: &str) -> bool {
        let entry = {
            let mut modules = self.inner.modules.borrow_mut();
            modules.iter().position(|(m, _)| m == id).map(|i| modules.remove(i))
        };
        let Some((_, mut module)) = entry else {
            return false;
        };
        if let Err(e) = module.unload(self) {
            self.report_error(&format!("卸載模組 {}", id), &e);
        }
        info!("[{}] 已卸載模組 {}", self.inner.name, id);
        true
    }

    pub fn reload_module(&self, id: &str) -> Result<bool, ScriptError> {
        self.unload_module(id);
        self.load_module(id)
    }

    /// 已載入的模組 id（載入順序）
    pub fn modules(&self) -> Vec<String> {
        self.inner.modules.borrow().iter().map(|(id, _)| id.clone()).collect()
    }

    // ---- 連線 ----

    /// 在任意位元組流上執行 Session，直到對方關閉、發生錯誤或呼叫 `disconnect`
    pub async fn run<T>(&self, transport: T) -> Result<(), TelnetError>
    where
        T: AsyncRead + AsyncWrite,
    {
        let token = CancellationToken::new();
        *self.inner.shutdown.borrow_mut() = token.clone();
        self.serve(transport, token).await
    }

    async fn serve<T>(&self, transport: T, token: CancellationToken) -> Result<(), TelnetError>
    where
        T: AsyncRead + AsyncWrite,
    {
        let mut rx = self.bind_outbound();
        let (mut reader, mut writer) = tokio::io::split(transport);
        let mut buf = vec![0u8; self.inner.config.read_buffer_size.max(1)];

        let result = loop {
            tokio::select! {
                _ = token.cancelled() => {
                    while let Ok(data) = rx.try_recv() {
                        if let Err(e) = writer.write_all(&data).await {
                            warn!("斷線前寫入失敗: {}", e);
                            break;
                        }
                    }
                    let _ = writer.shutdown().await;
                    break Ok(());
                }
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        info!("[{}] 伺服器關閉連線", self.inner.name);
                        break Ok(());
                    }
                    Ok(n) => self.feed(&buf[..n]),
                    Err(e) => break Err(TelnetError::Io(e)),
                },
                Some(data) = rx.recv() => {
                    if let Err(e) = writer.write_all(&data).await {
                        break Err(TelnetError::Io(e));
                    }
                }
            }
        };

        self.on_disconnected();
        result
    }

    fn on_disconnected(&self) {
        self.inner.outbound.borrow_mut().take();
        let pending = self.inner.assembler.borrow_mut().flush();
        if let Some(line) = pending {
            self.dispatch_line(&line);
        }
        *self.inner.engine.borrow_mut() = ProtocolEngine::from_config(&self.inner.config);
        self.inner.server_echo.set(false);
        if self.inner.config.save_variables {
            self.save_variables();
        }
        self.info("連線已中斷");
    }

    /// 連線並執行；`auto_reconnect` 時斷線後等待一段時間重連
    ///
    /// 重連前取消所有等待與背景任務（物件保留），因此本方法本身不應以
    /// [`Session::spawn`] 執行
    pub async fn connect_and_run(&self, host: &str, port: u16) -> Result<(), TelnetError> {
        // 整個重連迴圈共用同一個 token，連線建立前的 `disconnect` 也會生效
        let token = CancellationToken::new();
        *self.inner.shutdown.borrow_mut() = token.clone();
        self.inner.user_disconnect.set(false);
        loop {
            let mut client = TelnetClient::new(TelnetConfig::from(&self.inner.config));
            let connected = tokio::select! {
                _ = token.cancelled() => {
                    info!("[{}] 連線建立前已要求斷線", self.inner.name);
                    return Ok(());
                }
                connected = client.connect(host, port) => connected,
            };
            let outcome = match connected {
                Ok(stream) => {
                    self.info(&format!("已連線到 {}:{}", host, port));
                    let result = self.serve(stream, token.clone()).await;
                    client.mark_disconnected();
                    result
                }
                Err(e) => Err(e),
            };
            if let Err(e) = &outcome {
                self.report_error("連線", e);
            }

            if !self.inner.config.auto_reconnect || self.inner.user_disconnect.get() || self.is_closed() {
                return outcome;
            }

            self.inner.registry.borrow_mut().reset_waits();
            let delay = self.inner.config.reconnect_delay();
            self.info(&format!("{} 秒後重新連線", delay.as_secs()));
            tokio::select! {
                _ = token.cancelled() => return outcome,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// 要求結束連線（送出 EOF），不會自動重連
    pub fn disconnect(&self) {
        self.inner.user_disconnect.set(true);
        self.inner.shutdown.borrow().cancel();
    }

    /// 關閉 Session：卸載模組、斷線並清空所有物件；可重複呼叫
    pub fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        for id in self.modules().iter().rev() {
            self.unload_module(id);
        }
        self.disconnect();
        self.clean();
        self.info("Session 已關閉");
    }

    /// 取消所有等待與背景任務並清空物件；可重複呼叫
    pub fn clean(&self) {
        self.inner.registry.borrow_mut().clean();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.inner.name)
            .field("connected", &self.is_connected())
            .field("closed", &self.inner.closed.get())
            .finish_non_exhaustive()
    }
}
