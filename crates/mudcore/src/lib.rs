//! MUD Core Library
//!
//! 提供 MUD 客戶端的核心功能：
//! - `telnet`: Telnet 協定狀態機、選項協商與連線
//! - `line`: 行組裝與 ANSI 處理
//! - `pattern`: 觸發器、別名、命令共用的匹配核心
//! - `trigger` / `alias` / `command` / `timer` / `gmcp`: 自動化物件
//! - `session`: 連線會話與物件註冊
//! - `script`: Lua 腳本模組

pub mod alias;
pub mod command;
pub mod config;
pub mod display;
pub mod encoding;
pub mod gmcp;
pub mod line;
pub mod module;
pub mod pattern;
pub mod persist;
pub mod registry;
pub mod script;
pub mod session;
pub mod telnet;
pub mod timer;
pub mod trigger;
pub mod variables;

pub use alias::Alias;
pub use command::{Command, CommandResult, CommandState, SimpleCommand};
pub use config::{CommandDefaults, SessionConfig};
pub use display::{DisplaySink, MessageBuffer, MessageLevel, NullSink};
pub use encoding::TextCodec;
pub use gmcp::GmcpTrigger;
pub use line::{Line, LineAssembler};
pub use module::{ModuleLoader, ScriptModule};
pub use pattern::{Action, MatchMode, MatchResult, MatchState, Pattern, PatternObject, PatternSet};
pub use persist::{JsonFileStore, VariableStore};
pub use registry::{ObjectKind, SessionObject};
pub use script::{LuaModuleLoader, ScriptError};
pub use session::{Session, WeakSession};
pub use telnet::{ProtocolEngine, ProtocolEvent, TelnetClient, TelnetError, TelnetOption};
pub use timer::Timer;
pub use trigger::Trigger;
pub use variables::{GlobalVariables, Variables};
