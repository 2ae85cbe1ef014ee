//! 腳本模組介面
//!
//! 模組載入後向 Session 註冊自己的 Trigger / Alias / Timer 等物件，
//! 卸載前可執行清理。實際的程式碼載入方式由 [`ModuleLoader`] 決定。

use crate::script::ScriptError;
use crate::session::Session;

/// 已載入的模組
pub trait ScriptModule {
    fn name(&self) -> &str;

    /// 向 Session 註冊物件
    fn register(&mut self, session: &Session) -> Result<(), ScriptError>;

    /// 卸載前呼叫
    fn unload(&mut self, _session: &Session) -> Result<(), ScriptError> {
        Ok(())
    }
}

/// 模組載入器
pub trait ModuleLoader {
    /// 依 id 建立模組；該 id 沒有可用的模組時回傳 `None`
    fn load(&self, id: &str, session: &Session) -> Result<Option<Box<dyn ScriptModule>>, ScriptError>;
}
