//! TCP 連線建立
//!
//! 只負責解析主機與建立連線；連線後的位元組流交給 `Session::run`

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;

/// 連線錯誤
#[derive(Debug, Error)]
pub enum TelnetError {
    #[error("無法連線到 {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("連線 {0} 逾時 ({1:?})")]
    Timeout(String, Duration),

    #[error("找不到主機 {0}")]
    Resolve(String),

    #[error("尚未連線")]
    NotConnected,

    #[error("連線中斷: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// 連線參數，由 [`SessionConfig`] 產生
#[derive(Debug, Clone)]
pub struct TelnetConfig {
    /// 解析與連線的總時限
    pub connect_timeout: Duration,
    pub nodelay: bool,
}

impl Default for TelnetConfig {
    fn default() -> Self {
        TelnetConfig::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for TelnetConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            nodelay: true,
        }
    }
}

/// 連線器：依序嘗試主機解析出的每個位址
#[derive(Debug, Default)]
pub struct TelnetClient {
    config: TelnetConfig,
    state: ConnectionState,
    peer: Option<SocketAddr>,
    connects: u32,
}

impl TelnetClient {
    pub fn new(config: TelnetConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn config(&self) -> &TelnetConfig {
        &self.config
    }

    /// 目前連線的對端位址
    pub fn peer_addr(&self) -> Result<SocketAddr, TelnetError> {
        match (self.state, self.peer) {
            (ConnectionState::Connected, Some(addr)) => Ok(addr),
            _ => Err(TelnetError::NotConnected),
        }
    }

    /// 成功建立連線的次數
    pub fn connects(&self) -> u32 {
        self.connects
    }

    /// 連線到伺服器；逾時涵蓋 DNS 解析與所有位址的嘗試
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<TcpStream, TelnetError> {
        let target = format!("{}:{}", host, port);
        self.state = ConnectionState::Connecting;
        self.peer = None;
        info!("正在連線到 {}", target);

        let attempt = tokio::time::timeout(self.config.connect_timeout, Self::open(&target));
        let result = match attempt.await {
            Ok(result) => result,
            Err(_) => Err(TelnetError::Timeout(target.clone(), self.config.connect_timeout)),
        };

        match result {
            Ok((stream, addr)) => {
                if self.config.nodelay {
                    stream.set_nodelay(true)?;
                }
                self.state = ConnectionState::Connected;
                self.peer = Some(addr);
                self.connects += 1;
                info!("已連線到 {} ({})", target, addr);
                Ok(stream)
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn open(target: &str) -> Result<(TcpStream, SocketAddr), TelnetError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(target)
            .await
            .map_err(|_| TelnetError::Resolve(target.to_string()))?
            .collect();
        debug!("{} 解析為 {:?}", target, addrs);

        let mut last = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok((stream, addr)),
                Err(e) => {
                    warn!("連線 {} 失敗: {}", addr, e);
                    last = Some(e);
                }
            }
        }
        Err(match last {
            Some(source) => TelnetError::Connect {
                addr: target.to_string(),
                source,
            },
            None => TelnetError::Resolve(target.to_string()),
        })
    }

    /// 連線結束後呼叫
    pub fn mark_disconnected(&mut self) {
        if let Some(addr) = self.peer.take() {
            info!("與 {} 的連線已結束", addr);
        }
        self.state = ConnectionState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_config_from_session_config() {
        let session_config = SessionConfig {
            connect_timeout_secs: 5,
            ..SessionConfig::default()
        };
        let config = TelnetConfig::from(&session_config);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert!(config.nodelay);
    }

    #[test]
    fn test_peer_before_connect() {
        let client = TelnetClient::default();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(matches!(client.peer_addr(), Err(TelnetError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_and_mark_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TelnetClient::default();
        let stream = client.connect("127.0.0.1", addr.port()).await.unwrap();
        assert!(stream.nodelay().unwrap());
        assert_eq!(client.peer_addr().unwrap(), addr);
        assert_eq!(client.connects(), 1);

        client.mark_disconnected();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.peer_addr().is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // 取得一個沒有監聽的連接埠
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut client = TelnetClient::default();
        let err = client.connect("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, TelnetError::Connect { .. }));
        assert!(err.to_string().contains(&format!("127.0.0.1:{}", port)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.connects(), 0);
    }

    #[tokio::test]
    async fn test_unresolvable_host() {
        let mut client = TelnetClient::default();
        let err = client.connect("no-such-host.invalid", 23).await.unwrap_err();
        assert!(matches!(err, TelnetError::Resolve(_) | TelnetError::Timeout(..)));
    }
}
