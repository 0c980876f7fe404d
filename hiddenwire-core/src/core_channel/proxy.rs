/*
    ProxyHandshake - SOCKS4a CONNECT through the local anonymity proxy

    An outbound channel into the anonymity network first talks to the local
    SOCKS proxy. Until the proxy grants the connection the channel refuses
    framed messages; afterwards the same socket carries frames end to end.

    Request:  [0x04][0x01][port: u16 BE][0x00 0x00 0x00 0x01][0x00][hostname][0x00]
               ver   CONNECT             marker (0.0.0.1)     empty user id
    Reply:    [status: u16 BE][6 bytes padding], only 0x005A means granted.
*/

use std::fmt;
use thiserror::Error;

pub const SOCKS_VERSION: u8 = 0x04;
pub const SOCKS_CMD_CONNECT: u8 = 0x01;

/// Placeholder address 0.0.0.1 followed by the empty user id terminator
const SOCKS4A_MARKER: [u8; 5] = [0x00, 0x00, 0x00, 0x01, 0x00];

/// Reply status meaning "request granted"
pub const SOCKS_STATUS_GRANTED: u16 = 0x005A;

pub const REPLY_LEN: usize = 8;

const MAX_HOSTNAME_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    #[error("Proxy rejected the connection with status {0:#06x}")]
    Rejected(u16),

    #[error("Proxy closed the connection after {0} of {REPLY_LEN} reply bytes")]
    TruncatedReply(usize),

    #[error("Invalid proxy target hostname: {0}")]
    InvalidHostname(String),
}

/// Where the proxy should connect us
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub host: String,
    pub port: u16,
}

impl ProxyTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Build the CONNECT request for `target`
pub fn encode_request(target: &ProxyTarget) -> Result<Vec<u8>, ProxyError> {
    let host = target.host.as_bytes();
    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN || host.contains(&0) {
        return Err(ProxyError::InvalidHostname(target.host.clone()));
    }

    let mut request = Vec::with_capacity(4 + SOCKS4A_MARKER.len() + host.len() + 1);
    request.push(SOCKS_VERSION);
    request.push(SOCKS_CMD_CONNECT);
    request.extend_from_slice(&target.port.to_be_bytes());
    request.extend_from_slice(&SOCKS4A_MARKER);
    request.extend_from_slice(host);
    request.push(0x00);
    Ok(request)
}

/// Check a complete reply
pub fn parse_reply(reply: &[u8; REPLY_LEN]) -> Result<(), ProxyError> {
    let status = u16::from_be_bytes([reply[0], reply[1]]);
    if status == SOCKS_STATUS_GRANTED {
        Ok(())
    } else {
        Err(ProxyError::Rejected(status))
    }
}

/// In-progress handshake on a non-blocking socket.
///
/// The request may leave in several writes and the reply may arrive in
/// several reads; exactly `REPLY_LEN` bytes are consumed so that frames sent
/// right behind the reply stay in the socket for the frame decoder.
#[derive(Debug)]
pub struct ProxyHandshake {
    target: ProxyTarget,
    request: Vec<u8>,
    written: usize,
    reply: [u8; REPLY_LEN],
    received: usize,
}

impl ProxyHandshake {
    pub fn new(target: ProxyTarget) -> Result<Self, ProxyError> {
        let request = encode_request(&target)?;
        Ok(Self { target, request, written: 0, reply: [0; REPLY_LEN], received: 0 })
    }

    pub fn target(&self) -> &ProxyTarget {
        &self.target
    }

    /// Request bytes not yet written
    pub fn unsent(&self) -> &[u8] {
        &self.request[self.written..]
    }

    pub fn mark_written(&mut self, n: usize) {
        self.written = (self.written + n).min(self.request.len());
    }

    pub fn request_sent(&self) -> bool {
        self.written == self.request.len()
    }

    /// Buffer for the rest of the reply
    pub fn reply_space(&mut self) -> &mut [u8] {
        &mut self.reply[self.received..]
    }

    /// Record `n` reply bytes. Returns the verdict once the reply is complete.
    pub fn mark_received(&mut self, n: usize) -> Option<Result<(), ProxyError>> {
        self.received = (self.received + n).min(REPLY_LEN);
        (self.received == REPLY_LEN).then(|| parse_reply(&self.reply))
    }

    /// Verdict when the proxy closed the socket mid-reply
    pub fn truncated(&self) -> ProxyError {
        ProxyError::TruncatedReply(self.received)
    }
}
