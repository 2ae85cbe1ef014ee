//! Telnet 協定常數與子協商編解碼
//!
//! 實作 RFC 854 Telnet 協定命令，以及 MUD 常用子協定的封包格式：
//! NAWS (RFC 1073)、CHARSET (RFC 2066)、MTTS、MNES、GMCP、MSDP、MSSP。

use serde_json::{Map, Value};

/// Telnet IAC (Interpret As Command) - 0xFF
pub const IAC: u8 = 255;

/// 定義「名稱 = 位元組」對照的列舉，同時產生雙向轉換
macro_rules! byte_table {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident = $byte:literal,)+ }) => {
        $(#[$meta])*
        pub enum $name {
            $($(#[$vmeta])* $variant,)+
            /// 表中沒有的值
            Unknown(u8),
        }

        impl $name {
            pub fn from_byte(byte: u8) -> Self {
                match byte {
                    $($byte => Self::$variant,)+
                    other => Self::Unknown(other),
                }
            }

            pub fn as_byte(&self) -> u8 {
                match self {
                    $(Self::$variant => $byte,)+
                    Self::Unknown(b) => *b,
                }
            }
        }
    };
}

byte_table! {
    /// IAC 之後的命令位元組（RFC 854，EOR 見 RFC 885）
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    TelnetCommand {
        Eor = 239,
        Se = 240,
        Nop = 241,
        DataMark = 242,
        Break = 243,
        InterruptProcess = 244,
        AbortOutput = 245,
        AreYouThere = 246,
        EraseCharacter = 247,
        EraseLine = 248,
        GoAhead = 249,
        Sb = 250,
        Will = 251,
        Wont = 252,
        Do = 253,
        Dont = 254,
    }
}

impl TelnetCommand {
    /// WILL / WONT / DO / DONT
    pub fn is_negotiation(self) -> bool {
        matches!(self, Self::Will | Self::Wont | Self::Do | Self::Dont)
    }
}

byte_table! {
    /// 協商選項；MNES 以 NEW-ENVIRON 承載
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    TelnetOption {
        BinaryTransmission = 0,
        Echo = 1,
        SuppressGoAhead = 3,
        TerminalType = 24,
        EndOfRecord = 25,
        Naws = 31,
        NewEnviron = 39,
        Charset = 42,
        Msdp = 69,
        Mssp = 70,
        Mccp2 = 86,
        Mccp3 = 87,
        Msp = 90,
        Mxp = 91,
        Gmcp = 201,
    }
}

// ── 子協商常數 ───────────────────────────────────────────────────────────

/// TTYPE / NEW-ENVIRON / CHARSET 共用的 IS 與 SEND
pub const TTYPE_IS: u8 = 0;
pub const TTYPE_SEND: u8 = 1;

pub const ENV_IS: u8 = 0;
pub const ENV_SEND: u8 = 1;
pub const ENV_INFO: u8 = 2;
pub const ENV_VAR: u8 = 0;
pub const ENV_VALUE: u8 = 1;
pub const ENV_ESC: u8 = 2;
pub const ENV_USERVAR: u8 = 3;

pub const CHARSET_REQUEST: u8 = 1;
pub const CHARSET_ACCEPTED: u8 = 2;
pub const CHARSET_REJECTED: u8 = 3;

pub const MSSP_VAR: u8 = 1;
pub const MSSP_VAL: u8 = 2;

pub const MSDP_VAR: u8 = 1;
pub const MSDP_VAL: u8 = 2;
pub const MSDP_TABLE_OPEN: u8 = 3;
pub const MSDP_TABLE_CLOSE: u8 = 4;
pub const MSDP_ARRAY_OPEN: u8 = 5;
pub const MSDP_ARRAY_CLOSE: u8 = 6;

/// 產生 `IAC <cmd> <opt>` 三位元組
pub fn command(cmd: TelnetCommand, option: TelnetOption) -> Vec<u8> {
    vec![IAC, cmd.as_byte(), option.as_byte()]
}

/// 產生 `IAC SB <opt> <data> IAC SE`，資料中的 0xFF 會轉義為 `IAC IAC`
pub fn subnegotiation(option: TelnetOption, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(data.len() + 5);
    buf.extend_from_slice(&[IAC, TelnetCommand::Sb.as_byte(), option.as_byte()]);
    for &b in data {
        if b == IAC {
            buf.push(IAC);
        }
        buf.push(b);
    }
    buf.extend_from_slice(&[IAC, TelnetCommand::Se.as_byte()]);
    buf
}

/// NAWS 視窗大小（寬、高各 16 位元，big-endian）
pub fn naws(width: u16, height: u16) -> Vec<u8> {
    let mut data = Vec::with_capacity(4);
    data.extend_from_slice(&width.to_be_bytes());
    data.extend_from_slice(&height.to_be_bytes());
    subnegotiation(TelnetOption::Naws, &data)
}

/// TTYPE `IS <name>`
pub fn ttype_is(name: &str) -> Vec<u8> {
    let mut data = vec![TTYPE_IS];
    data.extend_from_slice(name.as_bytes());
    subnegotiation(TelnetOption::TerminalType, &data)
}

/// GMCP 封包：`<Package.Message> <JSON>`
pub fn gmcp(package: &str, value: Option<&Value>) -> Vec<u8> {
    let payload = match value {
        Some(v) => format!("{} {}", package, v),
        None => package.to_string(),
    };
    subnegotiation(TelnetOption::Gmcp, payload.as_bytes())
}

/// 解析 GMCP 內容，回傳 (名稱, 原始值字串)
///
/// 沒有值的訊息（例如 `Core.Goodbye`）回傳空字串。
pub fn decode_gmcp(payload: &[u8]) -> Option<(String, String)> {
    let text = String::from_utf8_lossy(payload);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    match text.split_once(char::is_whitespace) {
        Some((name, value)) => Some((name.to_string(), value.trim().to_string())),
        None => Some((text.to_string(), String::new())),
    }
}

/// 解析 MSSP 內容，多個 VAL 以逗號合併
///
/// 格式錯誤（VAL 出現在 VAR 之前）回傳 `None`。
pub fn decode_mssp(payload: &[u8]) -> Option<Vec<(String, String)>> {
    let mut pairs: Vec<(String, Vec<String>)> = Vec::new();
    let mut i = 0;

    while i < payload.len() {
        let marker = payload[i];
        i += 1;
        let start = i;
        while i < payload.len() && payload[i] != MSSP_VAR && payload[i] != MSSP_VAL {
            i += 1;
        }
        let text = String::from_utf8_lossy(&payload[start..i]).into_owned();
        match marker {
            MSSP_VAR => pairs.push((text, Vec::new())),
            MSSP_VAL => pairs.last_mut()?.1.push(text),
            _ => return None,
        }
    }

    Some(
        pairs
            .into_iter()
            .map(|(name, values)| (name, values.join(",")))
            .collect(),
    )
}

/// 解析 MSDP 內容為 (名稱, 值) 列表
///
/// 值可以是字串、陣列 (ARRAY_OPEN ... ARRAY_CLOSE) 或表格
/// (TABLE_OPEN ... TABLE_CLOSE)，表格可巢狀。
pub fn decode_msdp(payload: &[u8]) -> Option<Vec<(String, Value)>> {
    let mut reader = MsdpReader { data: payload, pos: 0 };
    let mut out = Vec::new();
    while !reader.at_end() {
        let (name, value) = reader.pair()?;
        out.push((name, value));
    }
    Some(out)
}

struct MsdpReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl MsdpReader<'_> {
    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Option<()> {
        if self.peek()? == byte {
            self.pos += 1;
            Some(())
        } else {
            None
        }
    }

    fn text(&mut self) -> String {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if (MSDP_VAR..=MSDP_ARRAY_CLOSE).contains(&b) {
                break;
            }
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.data[start..self.pos]).into_owned()
    }

    fn pair(&mut self) -> Option<(String, Value)> {
        self.expect(MSDP_VAR)?;
        let name = self.text();
        self.expect(MSDP_VAL)?;
        let value = self.value()?;
        Some((name, value))
    }

    fn value(&mut self) -> Option<Value> {
        match self.peek() {
            Some(MSDP_TABLE_OPEN) => {
                self.pos += 1;
                let mut table = Map::new();
                while self.peek()? != MSDP_TABLE_CLOSE {
                    let (name, value) = self.pair()?;
                    table.insert(name, value);
                }
                self.pos += 1;
                Some(Value::Object(table))
            }
            Some(MSDP_ARRAY_OPEN) => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != MSDP_ARRAY_CLOSE {
                    self.expect(MSDP_VAL)?;
                    items.push(self.value()?);
                }
                self.pos += 1;
                Some(Value::Array(items))
            }
            _ => Some(Value::String(self.text())),
        }
    }
}
