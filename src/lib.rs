//! Server-side WebSocket core over any `AsyncRead + AsyncWrite` stream:
//! the RFC 6455 frame codec, the fragmentation/control state machine that
//! assembles frames into messages, and the HTTP upgrade that produces a
//! session. One task owns one session; there is no cross-connection state.

pub mod assemble;
pub mod frame;
pub mod handshake;

use assemble::{Assembler, Step};
use frame::{close_code, Frame, FrameStream};
use handshake::Upgrade;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, BufStream};
use tracing::{debug, warn};

/// Cap on the accumulated payload of one message, fragmented or not.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Cap on the HTTP upgrade preamble.
pub const MAX_REQUEST_LEN: usize = 8 * 1024;

#[derive(Error, Debug)]
pub enum Error {
    /// Transport fault. The channel is presumed broken, so no close frame
    /// is sent on this path.
    #[error("I/O: {0}")]
    Io(#[from] tokio::io::Error),
    /// The peer violated framing rules; the connection ends after a
    /// best-effort close frame with status 1002.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    /// A message exceeded the configured size bound; the connection ends
    /// after a close frame with status 1009.
    #[error("message exceeded the maximum message size")]
    MessageTooBig,
    /// The upgrade request failed validation; callers map this to HTTP 400.
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),
    /// The peer closed the websocket, with their status and reason if any.
    #[error("the websocket has been closed")]
    Closed(Option<Close>),
    /// Read or write on a session that already terminated.
    #[error("the websocket was already closed")]
    WasClosed,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("reserved opcode 0x{0:X}")]
    ReservedOpcode(u8),
    #[error("fragmented control frame")]
    FragmentedControl,
    #[error("control frame payload over 125 bytes")]
    OversizedControl,
    #[error("payload length was not minimally encoded")]
    NonMinimalLength,
    #[error("continuation frame without a message in progress")]
    OrphanContinuation,
    #[error("data frame while another message is in progress")]
    InterleavedMessage,
    #[error("text payload is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("invalid request line: {0:?}")]
    InvalidRequest(String),
    #[error("missing or invalid header: {0}")]
    MissingOrInvalidHeader(String),
    #[error("origin not allowed: {0}")]
    OriginNotAllowed(String),
    #[error("request was not valid UTF-8")]
    InvalidUtf8,
}

impl Error {
    /// The close frame owed to the peer before tearing the connection down,
    /// if the error calls for one.
    fn close_frame(&self) -> Option<Frame> {
        match self {
            Error::Protocol(err) => {
                Some(Frame::close(close_code::PROTOCOL_ERROR, &err.to_string()))
            }
            Error::MessageTooBig => {
                Some(Frame::close(close_code::MESSAGE_TOO_BIG, "message too big"))
            }
            _ => None,
        }
    }
}

/// Status and reason from a peer's close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Close {
    pub status: u16,
    pub reason: String,
}

/// One complete application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    fn into_frame(self) -> Frame {
        match self {
            Message::Text(text) => Frame::text(&text),
            Message::Binary(data) => Frame::binary(data),
        }
    }
}

/// Per-session knobs. Passed at accept time; there is no process-global
/// configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub max_message_size: usize,
    pub max_request_len: usize,
    /// Origins accepted during the handshake. `None` allows any origin.
    pub allowed_origins: Option<Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_message_size: MAX_MESSAGE_SIZE,
            max_request_len: MAX_REQUEST_LEN,
            allowed_origins: None,
        }
    }
}

/// An upgraded connection. Exclusively owns the transport; every write on
/// the connection (data, pong replies, close frames) goes through here, so
/// frames never interleave.
pub struct WebSocket<Stream> {
    stream: FrameStream<BufStream<Stream>>,
    assembler: Assembler,
    upgrade: Upgrade,
    open: bool,
    sent_close: bool,
}

impl<Stream> WebSocket<Stream>
where
    Stream: AsyncRead + AsyncWrite + Unpin,
{
    /// Perform the server handshake on a fresh connection with default
    /// configuration.
    pub async fn accept(stream: Stream) -> Result<Self, Error> {
        Self::accept_with(Config::default(), false, stream).await
    }

    /// Perform the server handshake with explicit configuration. `secure`
    /// only affects the scheme of the reported request URL; TLS itself is
    /// the transport's business.
    pub async fn accept_with(config: Config, secure: bool, stream: Stream) -> Result<Self, Error> {
        let mut stream = BufStream::new(stream);
        let upgrade = handshake::server(&mut stream, secure, &config).await?;
        debug!(url = %upgrade.url, "websocket upgrade complete");

        Ok(WebSocket {
            stream: FrameStream::new(stream, config.max_message_size),
            assembler: Assembler::new(config.max_message_size),
            upgrade,
            open: true,
            sent_close: false,
        })
    }

    /// The request URL the client upgraded on.
    pub fn url(&self) -> &url::Url {
        &self.upgrade.url
    }

    /// Sub-protocols the client offered, in request order.
    pub fn protocols(&self) -> &[String] {
        &self.upgrade.protocols
    }

    /// Read the next complete message. Control traffic is handled inline:
    /// pings are answered with an echoing pong before the next frame is
    /// read, pongs are noted and skipped. Returns `Error::Closed` once the
    /// peer's close frame has been processed and echoed.
    pub async fn read(&mut self) -> Result<Message, Error> {
        if !self.open {
            return Err(Error::WasClosed);
        }

        loop {
            let frame = match self.stream.read_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    // peer went away without a close frame
                    self.open = false;
                    return Err(Error::Closed(None));
                }
                Err(err) => return Err(self.terminate(err).await),
            };

            match self.assembler.accept(frame) {
                Ok(Some(Step::Message(message))) => return Ok(message),
                Ok(Some(Step::Pong(payload))) => {
                    let pong = Frame::pong(payload);
                    if let Err(err) = self.write_and_flush(&pong).await {
                        return Err(self.terminate(err).await);
                    }
                }
                Ok(Some(Step::PongReceived(payload))) => {
                    debug!(len = payload.len(), "pong received");
                }
                Ok(Some(Step::Close(close))) => {
                    self.open = false;
                    if !self.sent_close {
                        let echo = match &close {
                            Some(close) => Frame::close(close.status, &close.reason),
                            None => Frame::bare_close(),
                        };
                        let _ = self.stream.write_frame(&echo).await;
                        let _ = self.stream.flush().await;
                    }
                    return Err(Error::Closed(close));
                }
                Ok(None) => {}
                Err(err) => return Err(self.terminate(err).await),
            }
        }
    }

    /// Write one message as a single unfragmented, unmasked frame.
    pub async fn write(&mut self, message: Message) -> Result<(), Error> {
        if !self.open {
            return Err(Error::WasClosed);
        }
        self.stream.write_frame(&message.into_frame()).await
    }

    /// Start a normal close handshake (status 1000). The session stays
    /// readable so the peer's close echo can be drained.
    pub async fn close(&mut self) -> Result<(), Error> {
        if self.sent_close {
            return Ok(());
        }
        self.sent_close = true;
        self.stream
            .write_frame(&Frame::close(close_code::NORMAL, ""))
            .await?;
        self.flush().await
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        self.stream.flush().await
    }

    async fn write_and_flush(&mut self, frame: &Frame) -> Result<(), Error> {
        self.stream.write_frame(frame).await?;
        self.stream.flush().await
    }

    /// Run the session to completion, invoking `on_message` once per
    /// assembled message. Resolves with the peer's close reason on a clean
    /// shutdown and the terminal error otherwise.
    pub async fn serve<F>(mut self, mut on_message: F) -> Result<Option<Close>, Error>
    where
        F: FnMut(Message),
    {
        loop {
            match self.read().await {
                Ok(message) => on_message(message),
                Err(Error::Closed(close)) => {
                    debug!(?close, "websocket session closed");
                    return Ok(close);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Shared exit path for decode and assembly failures: send the close
    /// frame the error taxonomy calls for (none for I/O faults) and mark
    /// the session dead.
    async fn terminate(&mut self, err: Error) -> Error {
        self.open = false;
        if let Some(frame) = err.close_frame() {
            warn!(%err, "terminating websocket session");
            if !self.sent_close {
                self.sent_close = true;
                let _ = self.stream.write_frame(&frame).await;
                let _ = self.stream.flush().await;
            }
        }
        err
    }
}
