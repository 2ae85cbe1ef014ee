//! Session 設定
//!
//! 每個連線建立時構造一份 [`SessionConfig`]，並以參照方式交給協定引擎、
//! 行組裝器與命令執行引擎使用。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::telnet::TelnetOption;

/// 單一 Session 的完整設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// 伺服器文字編碼（encoding_rs 標籤，例如 `utf-8`、`big5`、`gbk`）
    pub encoding: String,
    /// 行結束符號
    pub newline: String,
    /// 多命令分隔符號（空字串表示不分割）
    pub command_separator: String,
    /// MTTS / MNES 回報的客戶端名稱
    pub client_name: String,
    /// 客戶端版本
    pub client_version: String,
    /// MTTS 第二輪回報的終端類型
    pub terminal_type: String,
    /// NAWS 寬度
    pub naws_width: u16,
    /// NAWS 高度
    pub naws_height: u16,
    /// 選項協商表
    pub options: OptionTable,
    /// 接受 GMCP 後送出的 Core.Supports.Set 模組列表
    pub gmcp_supports: Vec<String>,
    /// Command 預設值
    pub command: CommandDefaults,
    /// 連線逾時（秒）
    pub connect_timeout_secs: u64,
    /// 讀取緩衝區大小
    pub read_buffer_size: usize,
    /// 斷線後自動重連
    pub auto_reconnect: bool,
    /// 重連前等待秒數
    pub reconnect_delay_secs: u64,
    /// 建立 Session 時載入變數
    pub load_variables: bool,
    /// 斷線時儲存變數
    pub save_variables: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            encoding: "utf-8".to_string(),
            newline: "\n".to_string(),
            command_separator: ";".to_string(),
            client_name: "MUDCORE".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            terminal_type: "XTERM".to_string(),
            naws_width: 100,
            naws_height: 40,
            options: OptionTable::default(),
            gmcp_supports: Vec::new(),
            command: CommandDefaults::default(),
            connect_timeout_secs: 30,
            read_buffer_size: 8192,
            auto_reconnect: false,
            reconnect_delay_secs: 15,
            load_variables: false,
            save_variables: false,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Command 執行引擎的預設參數
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandDefaults {
    /// 等待結果的逾時（毫秒）
    pub timeout_ms: u64,
    /// 最大重試次數
    pub max_retry: u32,
    /// 重試前等待（毫秒）
    pub retry_backoff_ms: u64,
}

impl Default for CommandDefaults {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_retry: 20,
            retry_backoff_ms: 2_000,
        }
    }
}

impl CommandDefaults {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// 每個選項是否接受協商
///
/// 未列出的選項一律拒絕。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionTable {
    pub echo: bool,
    pub sga: bool,
    pub eor: bool,
    pub charset: bool,
    pub ttype: bool,
    pub naws: bool,
    pub mnes: bool,
    pub gmcp: bool,
    pub msdp: bool,
    pub mssp: bool,
    pub mccp2: bool,
    pub mccp3: bool,
    pub msp: bool,
    pub mxp: bool,
}

impl Default for OptionTable {
    fn default() -> Self {
        Self {
            echo: true,
            sga: true,
            eor: true,
            charset: true,
            ttype: true,
            naws: true,
            mnes: true,
            gmcp: true,
            msdp: true,
            mssp: true,
            mccp2: false,
            mccp3: false,
            msp: false,
            mxp: false,
        }
    }
}

impl OptionTable {
    /// 查詢選項是否接受；`None` 表示不認識的選項
    pub fn accepts(&self, option: TelnetOption) -> Option<bool> {
        let accepted = match option {
            TelnetOption::Echo => self.echo,
            TelnetOption::SuppressGoAhead => self.sga,
            TelnetOption::EndOfRecord => self.eor,
            TelnetOption::Charset => self.charset,
            TelnetOption::TerminalType => self.ttype,
            TelnetOption::Naws => self.naws,
            TelnetOption::NewEnviron => self.mnes,
            TelnetOption::Gmcp => self.gmcp,
            TelnetOption::Msdp => self.msdp,
            TelnetOption::Mssp => self.mssp,
            TelnetOption::Mccp2 => self.mccp2,
            TelnetOption::Mccp3 => self.mccp3,
            TelnetOption::Msp => self.msp,
            TelnetOption::Mxp => self.mxp,
            TelnetOption::BinaryTransmission | TelnetOption::Unknown(_) => return None,
        };
        Some(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.read_buffer_size, 8192);
        assert_eq!(config.command.max_retry, 20);
        assert_eq!(config.command.retry_backoff(), Duration::from_secs(2));
        assert_eq!(config.encoding, "utf-8");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"encoding":"big5","options":{"mccp2":true}}"#).unwrap();
        assert_eq!(config.encoding, "big5");
        assert!(config.options.mccp2);
        assert!(config.options.gmcp);
        assert_eq!(config.newline, "\n");
    }

    #[test]
    fn test_option_table_lookup() {
        let table = OptionTable::default();
        assert_eq!(table.accepts(TelnetOption::Gmcp), Some(true));
        assert_eq!(table.accepts(TelnetOption::Mccp2), Some(false));
        assert_eq!(table.accepts(TelnetOption::Unknown(200)), None);
    }
}
