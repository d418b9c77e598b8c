//! One blocking TCP connection to a TDX quote server.

use super::codec::{
    encode_bars_request, encode_security_list_request, parse_bars, parse_security_list,
    read_frame, CodecError, TdxBar, TdxSecurity, SETUP_PACKETS,
};
use crate::data::provider::ProviderError;
use std::io::Write;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, warn};

impl From<CodecError> for ProviderError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Desync(msg) => ProviderError::Desync(msg),
            CodecError::Io(io) => io.into(),
            CodecError::Malformed(msg) => ProviderError::ResponseFormat(msg),
        }
    }
}

#[derive(Debug)]
pub struct TdxConnection {
    stream: TcpStream,
    server: String,
}

impl TdxConnection {
    /// Connect to the first reachable server in `servers`, in order.
    pub fn connect(servers: &[String], timeout: Duration) -> Result<Self, ProviderError> {
        let mut last_error = None;
        for server in servers {
            match Self::connect_one(server, timeout) {
                Ok(conn) => {
                    debug!(server = %server, "tdx connected");
                    return Ok(conn);
                }
                Err(e) => {
                    warn!(server = %server, error = %e, "tdx server unreachable, trying next");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| ProviderError::NotConfigured("no tdx servers configured".into())))
    }

    fn connect_one(server: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let addr: SocketAddr = server
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ProviderError::Network(format!("cannot resolve {server}")))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream,
            server: server.to_string(),
        };
        for pkt in SETUP_PACKETS {
            conn.request(pkt)?;
        }
        Ok(conn)
    }

    /// `host:port` this connection landed on.
    pub fn server(&self) -> &str {
        &self.server
    }

    fn request(&mut self, pkt: &[u8]) -> Result<Vec<u8>, CodecError> {
        self.stream.write_all(pkt)?;
        read_frame(&mut self.stream)
    }

    /// Most recent `count` daily bars, oldest first.
    pub fn daily_bars(
        &mut self,
        market: u16,
        code: &str,
        count: u16,
    ) -> Result<Vec<TdxBar>, CodecError> {
        let pkt = encode_bars_request(market, code, 0, count)?;
        let body = self.request(&pkt)?;
        parse_bars(&body)
    }

    /// One page of the security list for `market`, starting at `start`.
    pub fn security_page(
        &mut self,
        market: u16,
        start: u16,
    ) -> Result<Vec<TdxSecurity>, CodecError> {
        let body = self.request(&encode_security_list_request(market, start))?;
        parse_security_list(&body)
    }

    pub fn close(self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}
