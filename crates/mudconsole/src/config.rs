//! Profile 設定檔
//!
//! 每個 Profile 對應一個伺服器帳號：`<config_dir>/mudconsole/profiles/<name>.json`

use std::fs;
use std::path::PathBuf;

use mudcore::pattern::{MatchMode, PatternError};
use mudcore::{Action, Alias, Pattern, PatternObject, SessionConfig, Trigger};
use serde::{Deserialize, Serialize};

/// 別名設定（可序列化版本）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasConfig {
    pub id: String,
    pub pattern: String,
    /// 匹配後送出的命令（支援 `%1`、`@變數`）
    pub send: String,
    #[serde(default = "default_true")]
    pub regex: bool,
    /// 指定匹配方式時優先於 `regex`
    #[serde(default)]
    pub mode: Option<MatchMode>,
    #[serde(default)]
    pub group: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl AliasConfig {
    pub fn build(&self) -> Result<Alias, PatternError> {
        Ok(Alias::new(self.id.as_str(), compile(&self.pattern, self.regex, self.mode)?)
            .with_group(self.group.as_str())
            .with_enabled(self.enabled)
            .add_action(Action::Send(self.send.clone())))
    }
}

/// 觸發器設定（可序列化版本）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub id: String,
    pub pattern: String,
    pub send: String,
    #[serde(default = "default_true")]
    pub regex: bool,
    /// 指定匹配方式時優先於 `regex`
    #[serde(default)]
    pub mode: Option<MatchMode>,
    #[serde(default)]
    pub group: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub keep_eval: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl TriggerConfig {
    pub fn build(&self) -> Result<Trigger, PatternError> {
        Ok(Trigger::new(self.id.as_str(), compile(&self.pattern, self.regex, self.mode)?)
            .with_keep_eval(self.keep_eval)
            .with_group(self.group.as_str())
            .with_priority(self.priority)
            .with_enabled(self.enabled)
            .add_action(Action::Send(self.send.clone())))
    }
}

fn compile(pattern: &str, regex: bool, mode: Option<MatchMode>) -> Result<Pattern, PatternError> {
    match mode {
        Some(mode) => Pattern::with_mode(pattern, mode),
        None => Pattern::new(pattern, regex),
    }
}

fn default_true() -> bool {
    true
}

fn default_priority() -> i32 {
    mudcore::pattern::DEFAULT_PRIORITY
}

/// 單一帳號/伺服器的完整設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    /// Profile 名稱，同時作為 Session 名稱與變數檔名
    pub name: String,
    pub host: String,
    pub port: u16,
    pub session: SessionConfig,
    /// 啟動時依序載入的模組
    pub modules: Vec<String>,
    /// Lua 模組目錄，預設 `<config_dir>/scripts`
    pub script_dir: Option<PathBuf>,
    /// 變數存檔目錄，預設 `<config_dir>/variables`
    pub variables_dir: Option<PathBuf>,
    pub aliases: Vec<AliasConfig>,
    pub triggers: Vec<TriggerConfig>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            host: "localhost".to_string(),
            port: 4000,
            session: SessionConfig::default(),
            modules: Vec::new(),
            script_dir: None,
            variables_dir: None,
            aliases: Vec::new(),
            triggers: Vec::new(),
        }
    }
}

impl Profile {
    pub fn path(name: &str) -> PathBuf {
        config_dir().join("profiles").join(format!("{}.json", name))
    }

    /// 讀取 Profile；檔案不存在或格式錯誤時回傳 `None`
    pub fn load(name: &str) -> Option<Self> {
        let path = Self::path(name);
        let content = fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<Profile>(&content) {
            Ok(profile) => Some(profile),
            Err(e) => {
                tracing::error!("Profile 格式錯誤 {:?}: {}", path, e);
                None
            }
        }
    }

    /// 直接連線用的臨時 Profile
    pub fn direct(host: &str, port: u16) -> Self {
        Self {
            name: host.replace(['.', ':'], "_"),
            host: host.to_string(),
            port,
            ..Default::default()
        }
    }

    pub fn script_dir(&self) -> PathBuf {
        self.script_dir.clone().unwrap_or_else(|| config_dir().join("scripts"))
    }

    pub fn variables_dir(&self) -> PathBuf {
        self.variables_dir.clone().unwrap_or_else(|| config_dir().join("variables"))
    }
}

/// 獲取設定目錄
pub fn config_dir() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        config_dir.join("mudconsole")
    } else {
        PathBuf::from(".")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_defaults() {
        let profile: Profile = serde_json::from_str(r#"{"name": "pkuxkx", "host": "mud.pkuxkx.net", "port": 8081}"#).unwrap();
        assert_eq!(profile.name, "pkuxkx");
        assert_eq!(profile.port, 8081);
        assert_eq!(profile.session.command_separator, ";");
        assert!(profile.modules.is_empty());
    }

    #[test]
    fn test_session_overrides() {
        let profile: Profile =
            serde_json::from_str(r#"{"session": {"encoding": "big5", "auto_reconnect": true}}"#).unwrap();
        assert_eq!(profile.session.encoding, "big5");
        assert!(profile.session.auto_reconnect);
        assert_eq!(profile.host, "localhost");
    }

    #[test]
    fn test_build_objects() {
        let trigger: TriggerConfig =
            serde_json::from_str(r#"{"id": "t", "pattern": "^你餓了", "send": "eat", "priority": 5}"#).unwrap();
        let trigger = trigger.build().unwrap();
        assert_eq!(trigger.priority(), 5);
        assert!(trigger.enabled());

        let alias: AliasConfig =
            serde_json::from_str(r#"{"id": "a", "pattern": "(", "send": "x", "regex": true}"#).unwrap();
        assert!(alias.build().is_err());
    }

    #[test]
    fn test_trigger_match_mode() {
        let trigger: TriggerConfig =
            serde_json::from_str(r#"{"id": "t", "pattern": "(", "send": "x", "mode": "contains"}"#).unwrap();
        assert_eq!(trigger.mode, Some(MatchMode::Contains));
        assert!(trigger.build().is_ok());

        let pattern = compile(&trigger.pattern, trigger.regex, trigger.mode).unwrap();
        assert!(pattern.captures("a (b)").is_some());
        assert!(compile("(", true, None).is_err());
    }

    #[test]
    fn test_direct_profile_name() {
        let profile = Profile::direct("127.0.0.1", 23);
        assert_eq!(profile.name, "127_0_0_1");
        assert_eq!(profile.port, 23);
    }
}
