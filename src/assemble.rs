use crate::frame::{Frame, Opcode};
use crate::{Close, Error, Message, ProtocolError};

/// Fragmentation state of one connection. At most one data message may be
/// open at a time; control frames pass through without touching it.
#[derive(Debug)]
enum State {
    Idle,
    Assembling { binary: bool, payload: Vec<u8> },
}

/// What the session should do after feeding a frame to the assembler.
#[derive(Debug)]
pub enum Step {
    /// A complete application message to deliver.
    Message(Message),
    /// Reply to a peer ping by writing a pong with this exact payload.
    Pong(Vec<u8>),
    /// The peer answered a ping. Liveness only, nothing to do.
    PongReceived(Vec<u8>),
    /// The peer started the close handshake; echo a close and stop reading.
    Close(Option<Close>),
}

/// Turns the per-connection frame sequence into messages and control
/// actions. Pure state machine, owns no I/O; the session drives it and
/// performs whatever each [`Step`] asks for.
pub struct Assembler {
    state: State,
    max_message_size: usize,
}

impl Assembler {
    pub fn new(max_message_size: usize) -> Self {
        Assembler {
            state: State::Idle,
            max_message_size,
        }
    }

    /// Feed one frame. `Ok(None)` means the frame was absorbed into an
    /// in-progress message and more frames are needed. Errors are terminal
    /// for the connection; the caller decides whether a close frame goes
    /// out based on the error variant.
    pub fn accept(&mut self, frame: Frame) -> Result<Option<Step>, Error> {
        match frame.opcode {
            Opcode::Close => Ok(Some(Step::Close(parse_close(frame.into_payload())?))),
            Opcode::Ping => Ok(Some(Step::Pong(frame.into_payload()))),
            Opcode::Pong => Ok(Some(Step::PongReceived(frame.into_payload()))),

            Opcode::Text | Opcode::Binary => match self.state {
                State::Assembling { .. } => Err(ProtocolError::InterleavedMessage.into()),
                State::Idle => {
                    let binary = frame.opcode == Opcode::Binary;
                    let fin = frame.fin;
                    let payload = frame.into_payload();
                    if payload.len() > self.max_message_size {
                        return Err(Error::MessageTooBig);
                    }
                    if fin {
                        Ok(Some(Step::Message(finish(binary, payload)?)))
                    } else {
                        self.state = State::Assembling { binary, payload };
                        Ok(None)
                    }
                }
            },

            Opcode::Continuation => match &mut self.state {
                State::Idle => Err(ProtocolError::OrphanContinuation.into()),
                State::Assembling { payload, .. } => {
                    if payload.len() + frame.payload.len() > self.max_message_size {
                        self.state = State::Idle;
                        return Err(Error::MessageTooBig);
                    }
                    payload.extend_from_slice(&frame.payload);
                    if frame.fin {
                        let State::Assembling { binary, payload } =
                            std::mem::replace(&mut self.state, State::Idle)
                        else {
                            unreachable!("checked assembling above");
                        };
                        Ok(Some(Step::Message(finish(binary, payload)?)))
                    } else {
                        Ok(None)
                    }
                }
            },
        }
    }
}

fn finish(binary: bool, payload: Vec<u8>) -> Result<Message, Error> {
    if binary {
        Ok(Message::Binary(payload))
    } else {
        let text = String::from_utf8(payload).map_err(|_| ProtocolError::InvalidUtf8)?;
        Ok(Message::Text(text))
    }
}

/// Close payloads are either empty (no status), or a big-endian status
/// followed by a UTF-8 reason. A one-byte payload carries no usable status.
fn parse_close(payload: Vec<u8>) -> Result<Option<Close>, Error> {
    match payload[..] {
        [] | [_] => Ok(None),
        [status_high, status_low, ref reason @ ..] => {
            let status = u16::from_be_bytes([status_high, status_low]);
            let reason = std::str::from_utf8(reason)
                .map_err(|_| ProtocolError::InvalidUtf8)?
                .to_owned();
            Ok(Some(Close { status, reason }))
        }
    }
}
