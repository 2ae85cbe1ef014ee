//! 選項協商處理器
//!
//! 每個選項的處理只依賴 (命令方向, 目前設定)，回覆位元組與解出的資料
//! 以 [`ProtocolEvent`] 形式輸出，不直接接觸傳輸層。

use encoding_rs::Encoding;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use super::engine::ProtocolEvent;
use super::protocol::{self, TelnetCommand, TelnetOption};
use crate::config::{OptionTable, SessionConfig};

/// MTTS 旗標
const MTTS_ANSI: u32 = 1;
const MTTS_UTF8: u32 = 4;
const MTTS_256_COLORS: u32 = 8;
const MTTS_TRUECOLOR: u32 = 256;
const MTTS_MNES: u32 = 512;

/// 子協商錯誤（記錄後丟棄，不會中斷連線）
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubnegotiationError {
    #[error("空的子協商")]
    Empty,

    #[error("{0:?} 子協商格式錯誤")]
    Malformed(TelnetOption),

    #[error("{0:?} 未經協商即收到子協商")]
    NotNegotiated(TelnetOption),
}

/// 協商所需的靜態設定
#[derive(Debug, Clone)]
pub struct NegotiationSettings {
    pub table: OptionTable,
    pub client_name: String,
    pub client_version: String,
    pub terminal_type: String,
    pub encoding: &'static Encoding,
    pub naws: (u16, u16),
    pub gmcp_supports: Vec<String>,
}

impl NegotiationSettings {
    pub fn from_config(config: &SessionConfig) -> Self {
        let encoding = Encoding::for_label(config.encoding.as_bytes()).unwrap_or(encoding_rs::UTF_8);
        Self {
            table: config.options.clone(),
            client_name: config.client_name.clone(),
            client_version: config.client_version.clone(),
            terminal_type: config.terminal_type.clone(),
            encoding,
            naws: (config.naws_width, config.naws_height),
            gmcp_supports: config.gmcp_supports.clone(),
        }
    }

    /// MTTS 位元遮罩
    pub fn mtts_bitmask(&self) -> u32 {
        let mut bits = MTTS_ANSI | MTTS_256_COLORS | MTTS_TRUECOLOR;
        if self.encoding == encoding_rs::UTF_8 {
            bits |= MTTS_UTF8;
        }
        if self.table.mnes {
            bits |= MTTS_MNES;
        }
        bits
    }
}

/// 選項由哪一方執行
#[derive(Debug, Clone, Copy)]
struct Sides {
    /// 伺服器可以 WILL（我們回覆 DO）
    remote: bool,
    /// 伺服器可以要求我們 DO（我們回覆 WILL）
    local: bool,
}

fn sides(option: TelnetOption) -> Sides {
    match option {
        TelnetOption::SuppressGoAhead | TelnetOption::Charset => Sides { remote: true, local: true },
        TelnetOption::TerminalType | TelnetOption::Naws | TelnetOption::NewEnviron => {
            Sides { remote: false, local: true }
        }
        _ => Sides { remote: true, local: false },
    }
}

/// 拒絕回覆：WILL/WONT → DONT，DO/DONT → WONT
pub fn refusal(cmd: TelnetCommand, option: TelnetOption) -> Vec<u8> {
    match cmd {
        TelnetCommand::Will | TelnetCommand::Wont => protocol::command(TelnetCommand::Dont, option),
        TelnetCommand::Do | TelnetCommand::Dont => protocol::command(TelnetCommand::Wont, option),
        _ => Vec::new(),
    }
}

/// 協商狀態
#[derive(Debug)]
pub struct Negotiator {
    settings: NegotiationSettings,
    /// 伺服器端已啟用的選項
    remote: [bool; 256],
    /// 我們已啟用的選項
    local: [bool; 256],
    /// MTTS 回報輪次
    ttype_round: u8,
}

impl Negotiator {
    pub fn new(settings: NegotiationSettings) -> Self {
        Self {
            settings,
            remote: [false; 256],
            local: [false; 256],
            ttype_round: 0,
        }
    }

    pub fn settings(&self) -> &NegotiationSettings {
        &self.settings
    }

    /// 伺服器端是否已啟用選項
    pub fn is_remote_enabled(&self, option: TelnetOption) -> bool {
        self.remote[option.as_byte() as usize]
    }

    /// 我方是否已啟用選項
    pub fn is_local_enabled(&self, option: TelnetOption) -> bool {
        self.local[option.as_byte() as usize]
    }

    /// 處理 `IAC <cmd> <option>`
    pub fn negotiate(&mut self, cmd: TelnetCommand, option: TelnetOption, out: &mut Vec<ProtocolEvent>) {
        let accepted = self.settings.table.accepts(option).unwrap_or(false);
        let sides = sides(option);
        let i = option.as_byte() as usize;

        match cmd {
            TelnetCommand::Will if accepted && sides.remote => {
                if !self.remote[i] {
                    self.remote[i] = true;
                    debug!("接受伺服器 WILL {:?}", option);
                    out.push(ProtocolEvent::Send(protocol::command(TelnetCommand::Do, option)));
                    self.on_remote_enabled(option, out);
                }
            }
            TelnetCommand::Wont if accepted && sides.remote => {
                if self.remote[i] {
                    self.remote[i] = false;
                    out.push(ProtocolEvent::Send(protocol::command(TelnetCommand::Dont, option)));
                    self.on_remote_disabled(option, out);
                }
            }
            TelnetCommand::Do if accepted && sides.local => {
                if !self.local[i] {
                    self.local[i] = true;
                    debug!("接受伺服器 DO {:?}", option);
                    out.push(ProtocolEvent::Send(protocol::command(TelnetCommand::Will, option)));
                    self.on_local_enabled(option, out);
                }
            }
            TelnetCommand::Dont if accepted && sides.local => {
                if self.local[i] {
                    self.local[i] = false;
                    out.push(ProtocolEvent::Send(protocol::command(TelnetCommand::Wont, option)));
                }
            }
            _ => {
                debug!("拒絕 {:?} {:?}", cmd, option);
                out.push(ProtocolEvent::Send(refusal(cmd, option)));
            }
        }
    }

    fn on_remote_enabled(&mut self, option: TelnetOption, out: &mut Vec<ProtocolEvent>) {
        match option {
            TelnetOption::Echo => out.push(ProtocolEvent::Echo(true)),
            TelnetOption::Gmcp => {
                let hello = json!({
                    "client": self.settings.client_name,
                    "version": self.settings.client_version,
                });
                out.push(ProtocolEvent::Send(protocol::gmcp("Core.Hello", Some(&hello))));
                if !self.settings.gmcp_supports.is_empty() {
                    let supports = json!(self.settings.gmcp_supports);
                    out.push(ProtocolEvent::Send(protocol::gmcp("Core.Supports.Set", Some(&supports))));
                }
            }
            _ => {}
        }
    }

    fn on_remote_disabled(&mut self, option: TelnetOption, out: &mut Vec<ProtocolEvent>) {
        if option == TelnetOption::Echo {
            out.push(ProtocolEvent::Echo(false));
        }
    }

    fn on_local_enabled(&mut self, option: TelnetOption, out: &mut Vec<ProtocolEvent>) {
        match option {
            TelnetOption::Naws => {
                let (width, height) = self.settings.naws;
                out.push(ProtocolEvent::Send(protocol::naws(width, height)));
            }
            TelnetOption::TerminalType => self.ttype_round = 0,
            _ => {}
        }
    }

    /// 視窗大小變更；NAWS 尚未協商時回傳 `None`
    pub fn resize(&mut self, width: u16, height: u16) -> Option<Vec<u8>> {
        self.settings.naws = (width, height);
        self.is_local_enabled(TelnetOption::Naws)
            .then(|| protocol::naws(width, height))
    }

    /// 處理完整的子協商內容（第一個位元組為選項）
    pub fn subnegotiate(&mut self, payload: &[u8], out: &mut Vec<ProtocolEvent>) -> Result<(), SubnegotiationError> {
        let (&opt, data) = payload.split_first().ok_or(SubnegotiationError::Empty)?;
        let option = TelnetOption::from_byte(opt);

        if self.settings.table.accepts(option) != Some(true) {
            return Err(SubnegotiationError::NotNegotiated(option));
        }

        match option {
            TelnetOption::TerminalType => self.ttype(data, out),
            TelnetOption::NewEnviron => self.mnes(data, out),
            TelnetOption::Charset => self.charset(data, out),
            TelnetOption::Gmcp => {
                let (name, value) = protocol::decode_gmcp(data).ok_or(SubnegotiationError::Malformed(option))?;
                out.push(ProtocolEvent::Gmcp { name, value });
                Ok(())
            }
            TelnetOption::Mssp => {
                let pairs = protocol::decode_mssp(data).ok_or(SubnegotiationError::Malformed(option))?;
                out.extend(pairs.into_iter().map(|(name, value)| ProtocolEvent::Mssp { name, value }));
                Ok(())
            }
            TelnetOption::Msdp => {
                let pairs = protocol::decode_msdp(data).ok_or(SubnegotiationError::Malformed(option))?;
                out.extend(pairs.into_iter().map(|(name, value)| ProtocolEvent::Msdp { name, value }));
                Ok(())
            }
            TelnetOption::Mccp2 | TelnetOption::Mccp3 => {
                warn!("伺服器要求啟動壓縮 {:?}，本客戶端不支援解壓縮", option);
                Ok(())
            }
            other => {
                debug!("忽略 {:?} 子協商 ({} 位元組)", other, data.len());
                Ok(())
            }
        }
    }

    /// MTTS 三輪握手：客戶端名稱 → 終端類型 → `MTTS <bitmask>`
    fn ttype(&mut self, data: &[u8], out: &mut Vec<ProtocolEvent>) -> Result<(), SubnegotiationError> {
        if data.first() != Some(&protocol::TTYPE_SEND) {
            return Err(SubnegotiationError::Malformed(TelnetOption::TerminalType));
        }
        let name = match self.ttype_round {
            0 => self.settings.client_name.clone(),
            1 => self.settings.terminal_type.clone(),
            _ => format!("MTTS {}", self.settings.mtts_bitmask()),
        };
        self.ttype_round = self.ttype_round.saturating_add(1);
        out.push(ProtocolEvent::Send(protocol::ttype_is(&name)));
        Ok(())
    }

    fn mnes_variables(&self) -> Vec<(&'static str, String)> {
        vec![
            ("CLIENT_NAME", self.settings.client_name.clone()),
            ("CLIENT_VERSION", self.settings.client_version.clone()),
            ("CHARSET", self.settings.encoding.name().to_string()),
            ("MTTS", self.settings.mtts_bitmask().to_string()),
            ("TERMINAL_TYPE", self.settings.terminal_type.clone()),
        ]
    }

    /// MNES：回覆伺服器要求的變數；未指定時回覆全部
    fn mnes(&mut self, data: &[u8], out: &mut Vec<ProtocolEvent>) -> Result<(), SubnegotiationError> {
        let (&kind, rest) = data
            .split_first()
            .ok_or(SubnegotiationError::Malformed(TelnetOption::NewEnviron))?;
        if kind != protocol::ENV_SEND {
            debug!("忽略 NEW-ENVIRON 子協商類型 {}", kind);
            return Ok(());
        }

        let requested: Vec<String> = rest
            .split(|&b| b == protocol::ENV_VAR || b == protocol::ENV_USERVAR)
            .filter(|name| !name.is_empty())
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .collect();

        let known = self.mnes_variables();
        let mut reply = vec![protocol::ENV_IS];
        if requested.is_empty() {
            for (name, value) in &known {
                push_env(&mut reply, name, Some(value));
            }
        } else {
            for name in &requested {
                let value = known.iter().find(|(k, _)| k == name).map(|(_, v)| v);
                push_env(&mut reply, name, value);
            }
        }
        out.push(ProtocolEvent::Send(protocol::subnegotiation(TelnetOption::NewEnviron, &reply)));
        Ok(())
    }

    /// CHARSET REQUEST：列表中有設定的編碼就接受，否則拒絕
    fn charset(&mut self, data: &[u8], out: &mut Vec<ProtocolEvent>) -> Result<(), SubnegotiationError> {
        let (&kind, rest) = data
            .split_first()
            .ok_or(SubnegotiationError::Malformed(TelnetOption::Charset))?;

        match kind {
            protocol::CHARSET_REQUEST => {
                let (&sep, list) = rest
                    .split_first()
                    .ok_or(SubnegotiationError::Malformed(TelnetOption::Charset))?;
                let chosen = list
                    .split(|&b| b == sep)
                    .filter(|name| !name.is_empty())
                    .find(|name| Encoding::for_label(name) == Some(self.settings.encoding));

                match chosen {
                    Some(name) => {
                        let mut reply = vec![protocol::CHARSET_ACCEPTED];
                        reply.extend_from_slice(name);
                        out.push(ProtocolEvent::Send(protocol::subnegotiation(TelnetOption::Charset, &reply)));
                        out.push(ProtocolEvent::Charset(String::from_utf8_lossy(name).into_owned()));
                    }
                    None => {
                        out.push(ProtocolEvent::Send(protocol::subnegotiation(
                            TelnetOption::Charset,
                            &[protocol::CHARSET_REJECTED],
                        )));
                    }
                }
                Ok(())
            }
            protocol::CHARSET_ACCEPTED => {
                out.push(ProtocolEvent::Charset(String::from_utf8_lossy(rest).into_owned()));
                Ok(())
            }
            protocol::CHARSET_REJECTED => {
                debug!("伺服器拒絕字元集");
                Ok(())
            }
            _ => Err(SubnegotiationError::Malformed(TelnetOption::Charset)),
        }
    }
}

fn push_env(buf: &mut Vec<u8>, name: &str, value: Option<&String>) {
    buf.push(protocol::ENV_VAR);
    buf.extend_from_slice(name.as_bytes());
    if let Some(value) = value {
        buf.push(protocol::ENV_VALUE);
        buf.extend_from_slice(value.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telnet::protocol::IAC;

    fn negotiator() -> Negotiator {
        Negotiator::new(NegotiationSettings::from_config(&SessionConfig::default()))
    }

    fn sent(events: &[ProtocolEvent]) -> Vec<Vec<u8>> {
        events
            .iter()
            .filter_map(|e| match e {
                ProtocolEvent::Send(b) => Some(b.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_refusal_polarity() {
        let opt = TelnetOption::Unknown(99);
        assert_eq!(refusal(TelnetCommand::Will, opt), vec![IAC, 254, 99]);
        assert_eq!(refusal(TelnetCommand::Wont, opt), vec![IAC, 254, 99]);
        assert_eq!(refusal(TelnetCommand::Do, opt), vec![IAC, 252, 99]);
        assert_eq!(refusal(TelnetCommand::Dont, opt), vec![IAC, 252, 99]);
    }

    #[test]
    fn test_accepted_option_acknowledged_once() {
        let mut n = negotiator();
        let mut out = Vec::new();
        n.negotiate(TelnetCommand::Will, TelnetOption::SuppressGoAhead, &mut out);
        n.negotiate(TelnetCommand::Will, TelnetOption::SuppressGoAhead, &mut out);
        assert_eq!(sent(&out), vec![vec![IAC, 253, 3]]);
        assert!(n.is_remote_enabled(TelnetOption::SuppressGoAhead));
    }

    #[test]
    fn test_rejected_option_by_table() {
        let mut n = negotiator();
        let mut out = Vec::new();
        n.negotiate(TelnetCommand::Will, TelnetOption::Mccp2, &mut out);
        assert_eq!(sent(&out), vec![vec![IAC, 254, 86]]);
    }

    #[test]
    fn test_client_side_option_refuses_will() {
        // NAWS 是客戶端選項，伺服器 WILL NAWS 應被拒絕
        let mut n = negotiator();
        let mut out = Vec::new();
        n.negotiate(TelnetCommand::Will, TelnetOption::Naws, &mut out);
        assert_eq!(sent(&out), vec![vec![IAC, 254, 31]]);
    }

    #[test]
    fn test_do_naws_sends_size() {
        let mut n = negotiator();
        let mut out = Vec::new();
        n.negotiate(TelnetCommand::Do, TelnetOption::Naws, &mut out);
        assert_eq!(
            sent(&out),
            vec![vec![IAC, 251, 31], vec![IAC, 250, 31, 0, 100, 0, 40, IAC, 240]]
        );
        assert_eq!(n.resize(120, 50), Some(vec![IAC, 250, 31, 0, 120, 0, 50, IAC, 240]));
    }

    #[test]
    fn test_resize_before_naws_negotiated() {
        let mut n = negotiator();
        assert_eq!(n.resize(80, 24), None);
    }

    #[test]
    fn test_echo_events() {
        let mut n = negotiator();
        let mut out = Vec::new();
        n.negotiate(TelnetCommand::Will, TelnetOption::Echo, &mut out);
        n.negotiate(TelnetCommand::Wont, TelnetOption::Echo, &mut out);
        let echoes: Vec<bool> = out
            .iter()
            .filter_map(|e| match e {
                ProtocolEvent::Echo(on) => Some(*on),
                _ => None,
            })
            .collect();
        assert_eq!(echoes, vec![true, false]);
    }

    #[test]
    fn test_gmcp_hello_after_accept() {
        let mut n = negotiator();
        let mut out = Vec::new();
        n.negotiate(TelnetCommand::Will, TelnetOption::Gmcp, &mut out);
        let replies = sent(&out);
        assert_eq!(replies[0], vec![IAC, 253, 201]);
        let hello = String::from_utf8_lossy(&replies[1]);
        assert!(hello.contains("Core.Hello"));
        assert!(hello.contains("MUDCORE"));
    }

    #[test]
    fn test_mtts_three_rounds() {
        let mut n = negotiator();
        let mut out = Vec::new();
        n.negotiate(TelnetCommand::Do, TelnetOption::TerminalType, &mut out);
        out.clear();
        for _ in 0..4 {
            n.subnegotiate(&[24, protocol::TTYPE_SEND], &mut out).unwrap();
        }
        let replies = sent(&out);
        assert_eq!(replies[0], protocol::ttype_is("MUDCORE"));
        assert_eq!(replies[1], protocol::ttype_is("XTERM"));
        assert_eq!(replies[2], protocol::ttype_is("MTTS 781"));
        assert_eq!(replies[3], protocol::ttype_is("MTTS 781"));
    }

    #[test]
    fn test_mnes_requested_variable() {
        let mut n = negotiator();
        let mut out = Vec::new();
        let mut payload = vec![39, protocol::ENV_SEND, protocol::ENV_VAR];
        payload.extend_from_slice(b"CHARSET");
        payload.push(protocol::ENV_VAR);
        payload.extend_from_slice(b"NOPE");
        n.subnegotiate(&payload, &mut out).unwrap();

        let mut expected = vec![protocol::ENV_IS, protocol::ENV_VAR];
        expected.extend_from_slice(b"CHARSET");
        expected.push(protocol::ENV_VALUE);
        expected.extend_from_slice(b"UTF-8");
        expected.push(protocol::ENV_VAR);
        expected.extend_from_slice(b"NOPE");
        assert_eq!(sent(&out), vec![protocol::subnegotiation(TelnetOption::NewEnviron, &expected)]);
    }

    #[test]
    fn test_charset_request_accept_and_reject() {
        let mut n = negotiator();
        let mut out = Vec::new();
        let mut payload = vec![42, protocol::CHARSET_REQUEST, b';'];
        payload.extend_from_slice(b"BIG5;UTF-8");
        n.subnegotiate(&payload, &mut out).unwrap();
        let mut accepted = vec![protocol::CHARSET_ACCEPTED];
        accepted.extend_from_slice(b"UTF-8");
        assert_eq!(sent(&out), vec![protocol::subnegotiation(TelnetOption::Charset, &accepted)]);
        assert!(out.contains(&ProtocolEvent::Charset("UTF-8".to_string())));

        out.clear();
        let mut payload = vec![42, protocol::CHARSET_REQUEST, b' '];
        payload.extend_from_slice(b"BIG5 GBK");
        n.subnegotiate(&payload, &mut out).unwrap();
        assert_eq!(
            sent(&out),
            vec![protocol::subnegotiation(TelnetOption::Charset, &[protocol::CHARSET_REJECTED])]
        );
    }

    #[test]
    fn test_subnegotiation_for_refused_option() {
        let mut n = negotiator();
        let mut out = Vec::new();
        assert_eq!(
            n.subnegotiate(&[86], &mut out),
            Err(SubnegotiationError::NotNegotiated(TelnetOption::Mccp2))
        );
        assert_eq!(n.subnegotiate(&[], &mut out), Err(SubnegotiationError::Empty));
        assert!(out.is_empty());
    }

    #[test]
    fn test_malformed_ttype() {
        let mut n = negotiator();
        let mut out = Vec::new();
        assert_eq!(
            n.subnegotiate(&[24, 9], &mut out),
            Err(SubnegotiationError::Malformed(TelnetOption::TerminalType))
        );
    }
}
