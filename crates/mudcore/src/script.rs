//! Lua 腳本支援模組
//!
//! 使用 mlua 載入 `<dir>/<id>.lua` 作為模組。腳本透過全域 `mud` 表
//! 建立觸發器、別名、定時器與 GMCP 處理器；模組卸載時自動移除。
//!
//! ```lua
//! mud.trigger{ pattern = "^你獲得了 (\\d+) 金幣", send = "say 謝謝 %1" }
//! mud.alias{ id = "kk", pattern = "^kk (.+)$", callback = function(id, line, w)
//!     mud.send("kill " .. w[1])
//! end }
//! ```

use std::cell::RefCell;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use mlua::{Function, Lua, LuaSerdeExt, Table};
use thiserror::Error;
use tracing::{debug, info};

use crate::alias::Alias;
use crate::gmcp::GmcpTrigger;
use crate::module::{ModuleLoader, ScriptModule};
use crate::pattern::{Action, MatchMode, MatchResult, Pattern, PatternObject, PatternSet};
use crate::registry::ObjectKind;
use crate::session::{Session, WeakSession};
use crate::timer::Timer;
use crate::trigger::Trigger;

/// 腳本執行錯誤
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Lua 錯誤: {0}")]
    Lua(String),

    #[error("回呼錯誤: {0}")]
    Callback(String),

    #[error("腳本未找到: {0}")]
    NotFound(String),

    #[error("讀取腳本失敗: {0}")]
    Io(#[from] io::Error),
}

impl From<mlua::Error> for ScriptError {
    fn from(err: mlua::Error) -> Self {
        ScriptError::Lua(err.to_string())
    }
}

/// 從目錄載入 Lua 模組
#[derive(Debug, Clone)]
pub struct LuaModuleLoader {
    dir: PathBuf,
}

impl LuaModuleLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.lua", id))
    }
}

impl ModuleLoader for LuaModuleLoader {
    fn load(&self, id: &str, _session: &Session) -> Result<Option<Box<dyn ScriptModule>>, ScriptError> {
        let path = self.path_for(id);
        if !path.exists() {
            debug!("找不到模組檔案: {:?}", path);
            return Ok(None);
        }
        let code = fs::read_to_string(&path)?;
        Ok(Some(Box::new(LuaModule::new(id, code))))
    }
}

type Created = Rc<RefCell<Vec<(ObjectKind, String)>>>;

/// 一個 Lua 模組（各自擁有獨立的 Lua 狀態）
pub struct LuaModule {
    name: String,
    code: String,
    lua: Lua,
    created: Created,
}

impl LuaModule {
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
            lua: Lua::new(),
            created: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// 模組建立的物件
    pub fn created(&self) -> Vec<(ObjectKind, String)> {
        self.created.borrow().clone()
    }
}

impl ScriptModule for LuaModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn register(&mut self, session: &Session) -> Result<(), ScriptError> {
        install_api(&self.lua, session.downgrade(), Rc::clone(&self.created))?;
        self.lua.load(self.code.as_str()).set_name(self.name.as_str()).exec()?;
        info!("Lua 模組 {} 建立了 {} 個物件", self.name, self.created.borrow().len());
        Ok(())
    }

    fn unload(&mut self, session: &Session) -> Result<(), ScriptError> {
        let hook = self
            .lua
            .globals()
            .get::<Option<Function>>("unload")
            .map_err(ScriptError::from)
            .and_then(|f| match f {
                Some(f) => f.call::<()>(()).map_err(ScriptError::from),
                None => Ok(()),
            });

        let created = std::mem::take(&mut *self.created.borrow_mut());
        for (kind, id) in created {
            session.remove_object(kind, &id);
        }
        hook
    }
}

fn session_of(weak: &WeakSession) -> mlua::Result<Session> {
    weak.upgrade()
        .ok_or_else(|| mlua::Error::RuntimeError("Session 已關閉".to_string()))
}

/// `match` 指定匹配方式；未指定時依 `regex`（預設 true）
fn mode_from(spec: &Table) -> mlua::Result<MatchMode> {
    if let Some(mode) = spec.get::<Option<String>>("match")? {
        return mode.parse().map_err(mlua::Error::external);
    }
    Ok(match spec.get::<Option<bool>>("regex")?.unwrap_or(true) {
        true => MatchMode::Regex,
        false => MatchMode::Exact,
    })
}

fn seconds(value: f64, key: &str) -> mlua::Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| mlua::Error::RuntimeError(format!("{} 不是有效的秒數 ({}): {}", key, value, e)))
}

fn patterns_from(spec: &Table) -> mlua::Result<PatternSet> {
    let mode = mode_from(spec)?;
    if let Some(list) = spec.get::<Option<Vec<String>>>("patterns")? {
        let compiled = list
            .iter()
            .map(|p| Pattern::with_mode(p, mode))
            .collect::<Result<Vec<_>, _>>()
            .map_err(mlua::Error::external)?;
        return PatternSet::try_from(compiled).map_err(mlua::Error::external);
    }
    let pattern: String = spec.get("pattern")?;
    Pattern::with_mode(&pattern, mode)
        .map(PatternSet::from)
        .map_err(mlua::Error::external)
}

/// 套用共用欄位：group / priority / one_shot / enabled / timeout / send / callback
fn configure<T: PatternObject>(mut obj: T, spec: &Table) -> mlua::Result<T> {
    if let Some(group) = spec.get::<Option<String>>("group")? {
        obj = obj.with_group(group);
    }
    if let Some(priority) = spec.get::<Option<i32>>("priority")? {
        obj = obj.with_priority(priority);
    }
    if let Some(one_shot) = spec.get::<Option<bool>>("one_shot")? {
        obj = obj.with_one_shot(one_shot);
    }
    if let Some(enabled) = spec.get::<Option<bool>>("enabled")? {
        obj = obj.with_enabled(enabled);
    }
    if let Some(secs) = spec.get::<Option<f64>>("timeout")? {
        obj = obj.with_timeout(seconds(secs, "timeout")?);
    }
    if let Some(send) = spec.get::<Option<String>>("send")? {
        obj = obj.add_action(Action::Send(send));
    }
    if let Some(f) = spec.get::<Option<Function>>("callback")? {
        obj = obj.add_action(Action::Callback(Rc::new(move |_: &Session, r: &MatchResult| -> Result<(), ScriptError> {
            f.call::<()>((r.id.clone(), r.line.clone(), r.wildcards.clone()))?;
            Ok(())
        })));
    }
    Ok(obj)
}

fn object_id(session: &Session, spec: &Table, prefix: &str) -> mlua::Result<String> {
    Ok(match spec.get::<Option<String>>("id")? {
        Some(id) => id,
        None => session.get_unique_id(prefix),
    })
}

/// 建立全域 `mud` 表
fn install_api(lua: &Lua, weak: WeakSession, created: Created) -> mlua::Result<()> {
    let mud = lua.create_table()?;

    let (w, c) = (weak.clone(), Rc::clone(&created));
    mud.set(
        "trigger",
        lua.create_function(move |_, spec: Table| {
            let session = session_of(&w)?;
            let id = object_id(&session, &spec, "tri")?;
            let trigger = Trigger::new(id.clone(), patterns_from(&spec)?)
                .with_keep_eval(spec.get::<Option<bool>>("keep_eval")?.unwrap_or(false))
                .with_raw(spec.get::<Option<bool>>("raw")?.unwrap_or(false));
            session.add_object(configure(trigger, &spec)?);
            c.borrow_mut().push((ObjectKind::Trigger, id.clone()));
            Ok(id)
        })?,
    )?;

    let (w, c) = (weak.clone(), Rc::clone(&created));
    mud.set(
        "alias",
        lua.create_function(move |_, spec: Table| {
            let session = session_of(&w)?;
            let id = object_id(&session, &spec, "ali")?;
            let alias = Alias::new(id.clone(), patterns_from(&spec)?)
                .with_keep_eval(spec.get::<Option<bool>>("keep_eval")?.unwrap_or(false));
            session.add_object(configure(alias, &spec)?);
            c.borrow_mut().push((ObjectKind::Alias, id.clone()));
            Ok(id)
        })?,
    )?;

    let (w, c) = (weak.clone(), Rc::clone(&created));
    mud.set(
        "timer",
        lua.create_function(move |_, spec: Table| {
            let session = session_of(&w)?;
            let id = object_id(&session, &spec, "ti")?;
            let interval: f64 = spec.get("interval")?;
            let interval = seconds(interval, "interval")?.max(Duration::from_millis(1));
            let mut timer = Timer::new(id.clone(), interval)
                .with_one_shot(spec.get::<Option<bool>>("one_shot")?.unwrap_or(false))
                .with_enabled(spec.get::<Option<bool>>("enabled")?.unwrap_or(true));
            if let Some(group) = spec.get::<Option<String>>("group")? {
                timer = timer.with_group(group);
            }
            let send = spec.get::<Option<String>>("send")?;
            let callback = spec.get::<Option<Function>>("callback")?;
            let timer_id = id.clone();
            timer = timer.with_callback(move |session: &Session| {
                if let Some(text) = &send {
                    session.exec(text);
                }
                if let Some(f) = &callback {
                    f.call::<()>(timer_id.clone())?;
                }
                Ok(())
            });
            session.add_object(timer);
            c.borrow_mut().push((ObjectKind::Timer, id.clone()));
            Ok(id)
        })?,
    )?;

    let (w, c) = (weak.clone(), Rc::clone(&created));
    mud.set(
        "gmcp",
        lua.create_function(move |lua, spec: Table| {
            let session = session_of(&w)?;
            let name: String = spec.get("name")?;
            let mut handler = GmcpTrigger::new(name.clone());
            if let Some(group) = spec.get::<Option<String>>("group")? {
                handler = handler.with_group(group);
            }
            if let Some(f) = spec.get::<Option<Function>>("callback")? {
                let lua = lua.clone();
                handler = handler.with_callback(move |_: &Session, name: &str, value: &serde_json::Value| {
                    let value = lua.to_value(value)?;
                    f.call::<()>((name.to_string(), value))?;
                    Ok(())
                });
            }
            session.add_object(handler);
            c.borrow_mut().push((ObjectKind::Gmcp, name.clone()));
            Ok(name)
        })?,
    )?;

    let w = weak.clone();
    mud.set(
        "send",
        lua.create_function(move |_, text: String| {
            session_of(&w)?.write_line(&text);
            Ok(())
        })?,
    )?;

    let w = weak.clone();
    mud.set(
        "exec",
        lua.create_function(move |_, text: String| {
            session_of(&w)?.exec(&text);
            Ok(())
        })?,
    )?;

    let w = weak.clone();
    mud.set(
        "echo",
        lua.create_function(move |_, text: String| {
            session_of(&w)?.echo(&text);
            Ok(())
        })?,
    )?;

    let w = weak.clone();
    mud.set(
        "setvar",
        lua.create_function(move |lua, (name, value): (String, mlua::Value)| {
            let value: serde_json::Value = lua.from_value(value)?;
            session_of(&w)?.set_variable(&name, value);
            Ok(())
        })?,
    )?;

    let w = weak.clone();
    mud.set(
        "getvar",
        lua.create_function(move |lua, (name, default): (String, mlua::Value)| {
            let default: serde_json::Value = lua.from_value(default)?;
            let value = session_of(&w)?.get_variable(&name, default);
            lua.to_value(&value)
        })?,
    )?;

    let w = weak.clone();
    mud.set(
        "enable_group",
        lua.create_function(move |_, (group, enabled): (String, Option<bool>)| {
            let counts = session_of(&w)?.enable_group(&group, enabled.unwrap_or(true));
            Ok(counts.total())
        })?,
    )?;

    let w = weak;
    mud.set(
        "unique_id",
        lua.create_function(move |_, prefix: String| Ok(session_of(&w)?.get_unique_id(&prefix)))?,
    )?;

    // mud.log(message) - 寫入 tracing 日誌
    mud.set(
        "log",
        lua.create_function(|_, msg: String| {
            tracing::info!("[Script] {}", msg);
            Ok(())
        })?,
    )?;

    lua.globals().set("mud", mud)
}
