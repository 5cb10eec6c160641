use crate::{Config, Error, HandshakeError};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha1_smol::Sha1;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::Url;

const SWITCHING_PROTOCOLS: &str = "HTTP/1.1 101 Switching Protocols";
const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Result of a successful upgrade: what the client asked for.
#[derive(Debug)]
pub struct Upgrade {
    /// The request target reconstructed as a ws:// or wss:// URL.
    pub url: Url,
    /// Sub-protocols offered via `Sec-WebSocket-Protocol`, in request order.
    /// Informational; this crate does not negotiate one.
    pub protocols: Vec<String>,
}

struct CodepointReceiver {
    string: String,
    valid: bool,
}

impl utf8parse::Receiver for CodepointReceiver {
    fn codepoint(&mut self, c: char) {
        self.string.push(c);
    }

    fn invalid_sequence(&mut self) {
        self.valid = false;
    }
}

/// Read from the stream one byte at a time, validating UTF-8 incrementally,
/// until `until` is seen or `max_len` is reached.
async fn read_utf8_until(
    stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
    max_len: usize,
    until: &'static str,
) -> Result<String, Error> {
    let mut parser = utf8parse::Parser::new();
    let mut receiver = CodepointReceiver {
        string: String::new(),
        valid: true,
    };

    loop {
        let byte = stream.read_u8().await?;
        parser.advance(&mut receiver, byte);
        if !receiver.valid {
            return Err(HandshakeError::InvalidUtf8.into());
        }
        if receiver.string.len() > max_len || receiver.string.ends_with(until) {
            break;
        }
    }

    Ok(receiver.string)
}

async fn read_headers(
    stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
    max_len: usize,
) -> Result<HashMap<String, String>, Error> {
    let header_block = read_utf8_until(stream, max_len, "\r\n\r\n").await?;
    let mut headers = HashMap::new();

    for line in header_block.lines() {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(HandshakeError::MissingOrInvalidHeader(line.into()).into());
        };
        headers.insert(name.trim().to_lowercase(), value.trim().to_owned());
    }

    Ok(headers)
}

fn require(
    headers: &HashMap<String, String>,
    name: &str,
    expect: &str,
) -> Result<(), HandshakeError> {
    if headers
        .get(name)
        .map(|value| value.eq_ignore_ascii_case(expect))
        != Some(true)
    {
        return Err(HandshakeError::MissingOrInvalidHeader(name.into()));
    }
    Ok(())
}

/// `Sec-WebSocket-Accept` derivation from RFC 6455 section 1.3.
pub fn accept_key(key: &str) -> String {
    let digest = Sha1::from(format!("{}{}", key, ACCEPT_GUID)).digest().bytes();
    BASE64.encode(digest)
}

fn check_origin(headers: &HashMap<String, String>, config: &Config) -> Result<(), HandshakeError> {
    let Some(allowed) = &config.allowed_origins else {
        return Ok(());
    };
    let Some(origin) = headers.get("origin") else {
        return Err(HandshakeError::OriginNotAllowed("<missing>".into()));
    };
    if !allowed.iter().any(|entry| entry.eq_ignore_ascii_case(origin)) {
        return Err(HandshakeError::OriginNotAllowed(origin.clone()));
    }
    Ok(())
}

/// Validate a client upgrade request and switch protocols. Nothing is
/// written to the stream unless every check passes, so a failed handshake
/// leaves the caller free to answer with a plain HTTP 400.
pub async fn server(
    stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
    secure: bool,
    config: &Config,
) -> Result<Upgrade, Error> {
    let request_line = read_utf8_until(stream, config.max_request_len, "\n").await?;
    let mut parts = request_line.split_ascii_whitespace();
    let (Some("GET"), Some(request_path), Some("HTTP/1.1")) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(HandshakeError::InvalidRequest(request_line.trim().into()).into());
    };
    let request_path = request_path.to_owned();

    let headers = read_headers(stream, config.max_request_len).await?;

    let Some(host) = headers.get("host") else {
        return Err(HandshakeError::MissingOrInvalidHeader("Host".into()).into());
    };

    let url = format!(
        "{}://{}{}",
        if secure { "wss" } else { "ws" },
        host,
        request_path
    )
    .parse::<Url>()
    .map_err(|_| HandshakeError::InvalidRequest(request_path))?;

    require(&headers, "connection", "upgrade")?;
    require(&headers, "upgrade", "websocket")?;
    require(&headers, "sec-websocket-version", "13")?;
    check_origin(&headers, config)?;

    let Some(key) = headers.get("sec-websocket-key") else {
        return Err(HandshakeError::MissingOrInvalidHeader("Sec-WebSocket-Key".into()).into());
    };

    let protocols = headers
        .get("sec-websocket-protocol")
        .map(|list| {
            list.split(',')
                .map(|protocol| protocol.trim().to_owned())
                .filter(|protocol| !protocol.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let response = format!(
        concat!(
            "{}\r\n",
            "Connection: Upgrade\r\n",
            "Upgrade: websocket\r\n",
            "Sec-WebSocket-Accept: {}\r\n",
            "\r\n",
        ),
        SWITCHING_PROTOCOLS,
        accept_key(key.trim()),
    );

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;

    Ok(Upgrade { url, protocols })
}
