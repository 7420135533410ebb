//! HTTP tunnel to a bootstrap seed
//!
//! Some networks cannot reach the seed node over UDP. For those, FIND_NODE
//! requests to the seed travel as `GET {url}?data=<base32 datagram>` and the
//! response body is the base32-encoded reply datagram. The datagrams are
//! exactly what would have gone over UDP, network header included.

use reqwest::Client;
use std::net::SocketAddr;
use std::time::Duration;

const TUNNEL_TIMEOUT: Duration = Duration::from_secs(20);
const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Tunnel errors
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// URL not http(s)
    #[error("Invalid tunnel URL: {0}")]
    InvalidUrl(String),

    /// HTTP failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status
    #[error("Tunnel returned status {0}")]
    Status(u16),

    /// Body is not valid base32
    #[error("Invalid base32 in tunnel response")]
    InvalidEncoding,
}

/// Client side of the seed tunnel
#[derive(Debug, Clone)]
pub struct BootstrapTunnel {
    client: Client,
    url: String,
    seed: SocketAddr,
}

impl BootstrapTunnel {
    /// Create a tunnel to `seed` via `url`
    ///
    /// # Errors
    ///
    /// - `TunnelError::InvalidUrl` if the URL is not http(s)
    /// - `TunnelError::Http` if the client cannot be built
    pub fn new(seed: SocketAddr, url: &str) -> Result<Self, TunnelError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(TunnelError::InvalidUrl(url.to_string()));
        }
        let client = Client::builder().timeout(TUNNEL_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            seed,
        })
    }

    /// Address of the seed this tunnel serves
    #[must_use]
    pub fn seed(&self) -> SocketAddr {
        self.seed
    }

    /// Send one datagram and return the reply datagram
    ///
    /// # Errors
    ///
    /// Returns a `TunnelError` on HTTP failure or an undecodable body
    pub async fn exchange(&self, datagram: &[u8]) -> Result<Vec<u8>, TunnelError> {
        let url = format!("{}?data={}", self.url, base32_encode(datagram));
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(TunnelError::Status(response.status().as_u16()));
        }
        let body = response.text().await?;
        base32_decode(body.trim()).ok_or(TunnelError::InvalidEncoding)
    }
}

/// RFC 4648 base32 without padding
#[must_use]
pub fn base32_encode(input: &[u8]) -> String {
    let mut output = String::with_capacity(input.len().div_ceil(5) * 8);
    let mut buffer: u64 = 0;
    let mut bits_in_buffer = 0;

    for &byte in input {
        buffer = (buffer << 8) | u64::from(byte);
        bits_in_buffer += 8;
        while bits_in_buffer >= 5 {
            bits_in_buffer -= 5;
            output.push(ALPHABET[((buffer >> bits_in_buffer) & 0x1F) as usize] as char);
        }
        buffer &= (1 << bits_in_buffer) - 1;
    }
    if bits_in_buffer > 0 {
        output.push(ALPHABET[((buffer << (5 - bits_in_buffer)) & 0x1F) as usize] as char);
    }
    output
}

/// Decode RFC 4648 base32, tolerating lowercase and padding
#[must_use]
pub fn base32_decode(input: &str) -> Option<Vec<u8>> {
    let input = input.to_uppercase();
    let input = input.trim_end_matches('=');

    let mut output = Vec::with_capacity(input.len() * 5 / 8);
    let mut buffer: u64 = 0;
    let mut bits_in_buffer = 0;

    for c in input.chars() {
        let value = ALPHABET.iter().position(|&x| x == c as u8)? as u64;
        buffer = (buffer << 5) | value;
        bits_in_buffer += 5;

        if bits_in_buffer >= 8 {
            bits_in_buffer -= 8;
            output.push((buffer >> bits_in_buffer) as u8);
            buffer &= (1 << bits_in_buffer) - 1;
        }
    }

    Some(output)
}
