//! Telnet 協定模組
//!
//! 協定引擎（狀態機）、選項協商與 TCP 連線管理

mod client;
mod engine;
mod negotiation;
pub mod protocol;

pub use client::{ConnectionState, TelnetClient, TelnetConfig, TelnetError};
pub use engine::{EngineState, ProtocolEngine, ProtocolEvent};
pub use negotiation::{refusal, NegotiationSettings, Negotiator, SubnegotiationError};
pub use protocol::{TelnetCommand, TelnetOption};
