use crate::{Error, ProtocolError};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Close status codes from RFC 6455 section 7.4.1. Only `NORMAL`,
/// `PROTOCOL_ERROR`, and `MESSAGE_TOO_BIG` are produced by this crate; the
/// rest are defined for callers building their own close frames.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    pub const RESERVED: u16 = 1004;
    pub const NO_STATUS_RECEIVED: u16 = 1005;
    pub const ABNORMAL_CLOSURE: u16 = 1006;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const MANDATORY_EXTENSION: u16 = 1010;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const TLS_HANDSHAKE: u16 = 1015;
}

const FIN: u8 = 0b1000_0000;
const RSV1: u8 = 0b0100_0000;
const RSV2: u8 = 0b0010_0000;
const RSV3: u8 = 0b0001_0000;
const OPCODE: u8 = 0b0000_1111;
const MASK: u8 = 0b1000_0000;
const LEN7: u8 = 0b0111_1111;

const LEN16_MARKER: u8 = 126;
const LEN64_MARKER: u8 = 127;
const MAX_INLINE_LEN: usize = 125;
const MAX_CONTROL_PAYLOAD: usize = 125;

/// Initial capacity of the read buffer, enough for most frames without
/// reallocation.
const READ_BUFFER_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Opcodes 0x3-0x7 and 0xB-0xF are reserved and rejected outright.
    fn from_bits(bits: u8) -> Result<Opcode, ProtocolError> {
        match bits {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            _ => Err(ProtocolError::ReservedOpcode(bits)),
        }
    }

    pub fn is_control(self) -> bool {
        self as u8 >= 0x8
    }
}

fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// One unit of the wire format. The payload is always held unmasked;
/// masking is applied while composing and removed while parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: Opcode,
    pub mask_key: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl Frame {
    fn unfragmented(opcode: Opcode, payload: Vec<u8>) -> Frame {
        Frame {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask_key: None,
            payload,
        }
    }

    pub fn text(text: &str) -> Frame {
        Frame::unfragmented(Opcode::Text, text.as_bytes().to_vec())
    }

    pub fn binary(data: Vec<u8>) -> Frame {
        Frame::unfragmented(Opcode::Binary, data)
    }

    pub fn ping(payload: Vec<u8>) -> Frame {
        Frame::unfragmented(Opcode::Ping, payload)
    }

    pub fn pong(payload: Vec<u8>) -> Frame {
        Frame::unfragmented(Opcode::Pong, payload)
    }

    pub fn close(status: u16, reason: &str) -> Frame {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&status.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        Frame::unfragmented(Opcode::Close, payload)
    }

    /// A close frame with no status or reason.
    pub fn bare_close() -> Frame {
        Frame::unfragmented(Opcode::Close, Vec::new())
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Serialize to wire bytes. Always emits the minimal length form; the
    /// payload is XOR-masked in the output iff `mask_key` is set. Exact
    /// inverse of [`Frame::parse`] for any frame honoring the control-frame
    /// and length invariants.
    pub fn compose(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + 8 + 4 + self.payload.len());

        let mut b0 = (self.opcode as u8) & OPCODE;
        if self.fin {
            b0 |= FIN;
        }
        if self.rsv1 {
            b0 |= RSV1;
        }
        if self.rsv2 {
            b0 |= RSV2;
        }
        if self.rsv3 {
            b0 |= RSV3;
        }
        out.push(b0);

        let mask_bit = if self.mask_key.is_some() { MASK } else { 0 };
        match self.payload.len() {
            len if len <= MAX_INLINE_LEN => out.push(mask_bit | len as u8),
            len if len <= u16::MAX as usize => {
                out.push(mask_bit | LEN16_MARKER);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            }
            len => {
                out.push(mask_bit | LEN64_MARKER);
                out.extend_from_slice(&(len as u64).to_be_bytes());
            }
        }

        match self.mask_key {
            Some(key) => {
                out.extend_from_slice(&key);
                let start = out.len();
                out.extend_from_slice(&self.payload);
                apply_mask(&mut out[start..], key);
            }
            None => out.extend_from_slice(&self.payload),
        }

        out
    }

    /// Try to parse one frame from the front of `buffer`, consuming its
    /// bytes on success. `Ok(None)` means the buffer does not yet hold a
    /// complete frame. Structural violations (reserved opcode, fragmented or
    /// oversized control frame, non-minimal length encoding) are protocol
    /// errors; a frame announcing a payload over `max_payload` is rejected
    /// before any of it is buffered.
    pub fn parse(buffer: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>, Error> {
        if buffer.len() < 2 {
            return Ok(None);
        }

        let b0 = buffer[0];
        let b1 = buffer[1];

        let opcode = Opcode::from_bits(b0 & OPCODE)?;
        let fin = b0 & FIN != 0;
        let masked = b1 & MASK != 0;
        let len7 = b1 & LEN7;

        let len_ext_size = match len7 {
            LEN16_MARKER => 2,
            LEN64_MARKER => 8,
            _ => 0,
        };
        let mask_size = if masked { 4 } else { 0 };
        let header_size = 2 + len_ext_size + mask_size;
        if buffer.len() < header_size {
            return Ok(None);
        }

        let payload_len = match len7 {
            LEN16_MARKER => {
                let len = u16::from_be_bytes([buffer[2], buffer[3]]) as u64;
                if len <= MAX_INLINE_LEN as u64 {
                    return Err(ProtocolError::NonMinimalLength.into());
                }
                len
            }
            LEN64_MARKER => {
                let len = u64::from_be_bytes([
                    buffer[2], buffer[3], buffer[4], buffer[5], buffer[6], buffer[7], buffer[8],
                    buffer[9],
                ]);
                if len <= u16::MAX as u64 {
                    return Err(ProtocolError::NonMinimalLength.into());
                }
                len
            }
            _ => len7 as u64,
        };

        if opcode.is_control() {
            if !fin {
                return Err(ProtocolError::FragmentedControl.into());
            }
            if payload_len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(ProtocolError::OversizedControl.into());
            }
        }

        if payload_len > max_payload as u64 {
            return Err(Error::MessageTooBig);
        }
        let payload_len = payload_len as usize;

        if buffer.len() < header_size + payload_len {
            return Ok(None);
        }

        let mask_key = if masked {
            let at = 2 + len_ext_size;
            Some([buffer[at], buffer[at + 1], buffer[at + 2], buffer[at + 3]])
        } else {
            None
        };

        buffer.advance(header_size);
        let mut payload = buffer.split_to(payload_len).to_vec();
        if let Some(key) = mask_key {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            fin,
            rsv1: b0 & RSV1 != 0,
            rsv2: b0 & RSV2 != 0,
            rsv3: b0 & RSV3 != 0,
            opcode,
            mask_key,
            payload,
        }))
    }
}

/// Frame-level view of a byte stream: accumulates reads into a buffer and
/// hands out whole frames, writes composed frames back.
pub struct FrameStream<Stream> {
    stream: Stream,
    buffer: BytesMut,
    max_payload: usize,
}

impl<Stream> FrameStream<Stream>
where
    Stream: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: Stream, max_payload: usize) -> Self {
        FrameStream {
            stream,
            buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            max_payload,
        }
    }

    /// Read the next frame. `Ok(None)` is a clean end of stream on a frame
    /// boundary; end of stream with a partial frame buffered is an I/O
    /// error, since the peer vanished mid-frame.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, Error> {
        loop {
            if let Some(frame) = Frame::parse(&mut self.buffer, self.max_payload)? {
                return Ok(Some(frame));
            }

            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
        }
    }

    pub fn get_mut(&mut self) -> &mut Stream {
        &mut self.stream
    }

    pub fn into_inner(self) -> Stream {
        self.stream
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        self.stream.write_all(&frame.compose()).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        self.stream.flush().await?;
        Ok(())
    }
}
