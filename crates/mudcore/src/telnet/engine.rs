//! 位元組流協定引擎
//!
//! 把伺服器送來的原始位元組拆成：一般資料、go-ahead 訊號、需要回覆的
//! 協商位元組，以及子協商解出的 GMCP/MSSP/MSDP 資料。
//!
//! 引擎是純狀態機，不持有任何 I/O，回覆以 [`ProtocolEvent::Send`] 交給
//! 呼叫者寫出。

use serde_json::Value;
use tracing::{trace, warn};

use super::negotiation::{NegotiationSettings, Negotiator};
use super::protocol::{TelnetCommand, TelnetOption, IAC};
use crate::config::SessionConfig;

/// 子協商內容上限
const MAX_SUBNEGOTIATION: usize = 64 * 1024;

/// 引擎輸出事件（依到達順序）
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// 一般資料位元組
    Data(Vec<u8>),
    /// 立即送出目前累積的不完整行
    GoAhead,
    /// 需要寫回伺服器的位元組
    Send(Vec<u8>),
    /// 伺服器 ECHO 狀態改變（true 表示伺服器負責回顯，通常為密碼輸入）
    Echo(bool),
    /// 字元集協商結果
    Charset(String),
    /// GMCP 訊息（值尚未解析）
    Gmcp { name: String, value: String },
    /// MSSP 變數
    Mssp { name: String, value: String },
    /// MSDP 變數
    Msdp { name: String, value: Value },
}

/// 狀態機狀態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Normal,
    WaitCommand,
    /// 已收到 WILL/WONT/DO/DONT，等待選項位元組
    WaitOption(TelnetCommand),
    WaitSubnegotiation,
    WaitSubnegotiationData,
    /// 子協商中收到 IAC，可能是轉義資料或 `IAC SE`
    WaitEscapedEnd,
}

/// Telnet 協定引擎
#[derive(Debug)]
pub struct ProtocolEngine {
    state: EngineState,
    negotiator: Negotiator,
    /// 累積中的一般資料
    data: Vec<u8>,
    /// 累積中的子協商內容（第一個位元組為選項）
    subneg: Vec<u8>,
    /// 超過上限的子協商：持續吞掉內容直到 `IAC SE`
    discarding: bool,
}

impl ProtocolEngine {
    pub fn new(settings: NegotiationSettings) -> Self {
        Self {
            state: EngineState::Normal,
            negotiator: Negotiator::new(settings),
            data: Vec::new(),
            subneg: Vec::new(),
            discarding: false,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(NegotiationSettings::from_config(config))
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    pub fn negotiator_mut(&mut self) -> &mut Negotiator {
        &mut self.negotiator
    }

    /// 餵入一段位元組，回傳依序產生的事件
    pub fn feed(&mut self, input: &[u8]) -> Vec<ProtocolEvent> {
        let mut events = Vec::new();
        for &b in input {
            self.step(b, &mut events);
        }
        self.flush_data(&mut events);
        events
    }

    fn flush_data(&mut self, events: &mut Vec<ProtocolEvent>) {
        if !self.data.is_empty() {
            events.push(ProtocolEvent::Data(std::mem::take(&mut self.data)));
        }
    }

    fn go_ahead(&mut self, events: &mut Vec<ProtocolEvent>) {
        self.flush_data(events);
        events.push(ProtocolEvent::GoAhead);
    }

    fn step(&mut self, b: u8, events: &mut Vec<ProtocolEvent>) {
        match self.state {
            EngineState::Normal => {
                if b == IAC {
                    self.state = EngineState::WaitCommand;
                } else {
                    self.data.push(b);
                }
            }
            EngineState::WaitCommand => {
                if b == IAC {
                    // IAC IAC：轉義的 0xFF 資料
                    self.data.push(IAC);
                    self.state = EngineState::Normal;
                    return;
                }
                // 命令位元組不屬於可顯示文字，先送出累積的不完整行
                self.go_ahead(events);
                self.state = match TelnetCommand::from_byte(b) {
                    cmd if cmd.is_negotiation() => EngineState::WaitOption(cmd),
                    TelnetCommand::Sb => EngineState::WaitSubnegotiation,
                    TelnetCommand::Nop | TelnetCommand::GoAhead | TelnetCommand::Eor => EngineState::Normal,
                    _ => {
                        warn!("未預期的 Telnet 命令位元組: {}", b);
                        EngineState::Normal
                    }
                };
            }
            EngineState::WaitOption(cmd) => {
                let option = TelnetOption::from_byte(b);
                trace!("收到 {:?} {:?}", cmd, option);
                self.negotiator.negotiate(cmd, option, events);
                self.state = EngineState::Normal;
            }
            EngineState::WaitSubnegotiation => {
                self.subneg.clear();
                self.discarding = false;
                self.subneg.push(b);
                self.state = EngineState::WaitSubnegotiationData;
            }
            EngineState::WaitSubnegotiationData => {
                if b == IAC {
                    self.state = EngineState::WaitEscapedEnd;
                } else {
                    self.push_subneg(&[b]);
                }
            }
            EngineState::WaitEscapedEnd => {
                if TelnetCommand::from_byte(b) == TelnetCommand::Se {
                    self.state = EngineState::Normal;
                    if std::mem::take(&mut self.discarding) {
                        return;
                    }
                    let payload = std::mem::take(&mut self.subneg);
                    trace!("子協商完成: {}", hex(&payload));
                    if let Err(e) = self.negotiator.subnegotiate(&payload, events) {
                        warn!("丟棄子協商: {}", e);
                    }
                } else {
                    self.state = EngineState::WaitSubnegotiationData;
                    if b == IAC {
                        self.push_subneg(&[IAC]);
                    } else {
                        self.push_subneg(&[IAC, b]);
                    }
                }
            }
        }
    }

    fn push_subneg(&mut self, bytes: &[u8]) {
        if self.discarding {
            return;
        }
        if self.subneg.len() + bytes.len() > MAX_SUBNEGOTIATION {
            warn!("子協商超過 {} 位元組，已丟棄", MAX_SUBNEGOTIATION);
            self.subneg = Vec::new();
            self.discarding = true;
            return;
        }
        self.subneg.extend_from_slice(bytes);
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
