//! Client side of the HTTP/1.1 Upgrade handshake
//!
//! Writes the GET Upgrade request, reads until the end of the response head,
//! checks the `101` status and the `Sec-WebSocket-Accept` value, and returns
//! any bytes that arrived after the head so they can seed the receive buffer.

use crate::traits::{Endpoint, Result, StreamError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tracing::debug;

/// Largest response head accepted before giving up
pub const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Run the handshake over an already connected (and secured) stream
///
/// # Returns
/// Bytes received after the response head (possibly the start of the first frame)
pub async fn perform<S>(stream: &mut S, endpoint: &Endpoint, timeout: Duration) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, exchange(stream, endpoint))
        .await
        .map_err(|_| {
            StreamError::Timeout(format!(
                "WebSocket handshake with {} did not finish within {:?}",
                endpoint.host_header(),
                timeout
            ))
        })?
}

async fn exchange<S>(stream: &mut S, endpoint: &Endpoint) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    stream.write_all(build_request(endpoint, &key).as_bytes()).await?;
    stream.flush().await?;

    let mut response = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(StreamError::Handshake(
                "Connection closed before the handshake response completed".to_string(),
            ));
        }
        response.extend_from_slice(&chunk[..n]);

        if let Some(end) = check_response(&response, &key)? {
            debug!(
                "Handshake with {} complete ({} bytes past the response head)",
                endpoint.host_header(),
                response.len() - end
            );
            return Ok(response.split_off(end));
        }

        if response.len() > MAX_RESPONSE_HEAD {
            return Err(StreamError::Handshake(format!(
                "Response head exceeds {} bytes",
                MAX_RESPONSE_HEAD
            )));
        }
    }
}

/// The Upgrade request for `endpoint` with the given `Sec-WebSocket-Key`
pub fn build_request(endpoint: &Endpoint, key: &str) -> String {
    format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n",
        endpoint.path(),
        endpoint.host_header(),
        key
    )
}

/// Most response headers looked at
const MAX_HEADERS: usize = 32;

/// Check a complete response head against the key that was sent
pub fn validate_response(head: &[u8], key: &str) -> Result<()> {
    match check_response(head, key)? {
        Some(_) => Ok(()),
        None => Err(StreamError::Handshake(
            "Response head is incomplete".to_string(),
        )),
    }
}

/// Parse the response head at the start of `buf` and check it against `key`
///
/// Returns None while the head is still incomplete, else its length.
fn check_response(buf: &[u8], key: &str) -> Result<Option<usize>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    let head_len = match response.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => {
            return Err(StreamError::Handshake(format!(
                "Malformed response head: {}",
                e
            )))
        }
    };

    if response.version != Some(1) || response.code != Some(101) {
        return Err(StreamError::Handshake(format!(
            "Expected 101 Switching Protocols, got {} {}",
            response.code.unwrap_or_default(),
            response.reason.unwrap_or_default()
        )));
    }

    let headers = &*response.headers;
    if !has_token(headers, "Upgrade", "websocket") {
        return Err(StreamError::Handshake(
            "Missing 'Upgrade: websocket' header".to_string(),
        ));
    }
    if !has_token(headers, "Connection", "upgrade") {
        return Err(StreamError::Handshake(
            "Missing 'Connection: Upgrade' header".to_string(),
        ));
    }

    let expected = derive_accept_key(key.as_bytes());
    let accept = headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("Sec-WebSocket-Accept"))
        .map(|h| String::from_utf8_lossy(h.value).trim().to_string());

    match accept {
        Some(value) if value == expected => Ok(Some(head_len)),
        Some(value) => Err(StreamError::Handshake(format!(
            "Sec-WebSocket-Accept mismatch: expected {}, got {}",
            expected, value
        ))),
        None => Err(StreamError::Handshake(
            "Missing Sec-WebSocket-Accept header".to_string(),
        )),
    }
}

/// Whether any `name` header lists `token` (comma separated, any case)
fn has_token(headers: &[httparse::Header<'_>], name: &str, token: &str) -> bool {
    headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case(name))
        .any(|h| {
            String::from_utf8_lossy(h.value)
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case(token))
        })
}
