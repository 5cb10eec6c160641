//! End-to-end tests over in-memory duplex pipes: a hand-rolled client does
//! the HTTP upgrade and speaks masked frames at a real `WebSocket` server
//! session.

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use wulfenite::frame::{close_code, Frame, FrameStream, Opcode};
use wulfenite::{Close, Config, Error, Message, ProtocolError, WebSocket};

const UPGRADE_REQUEST: &[u8] = concat!(
    "GET /echo HTTP/1.1\r\n",
    "Host: test.invalid\r\n",
    "Connection: Upgrade\r\n",
    "Upgrade: websocket\r\n",
    "Sec-WebSocket-Version: 13\r\n",
    "Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n",
    "\r\n",
)
.as_bytes();

const MASK: [u8; 4] = [0xa1, 0xb2, 0xc3, 0xd4];

/// Upgrade the client half and hand back a frame-level view of it.
async fn client_connect(mut stream: DuplexStream) -> FrameStream<DuplexStream> {
    stream.write_all(UPGRADE_REQUEST).await.unwrap();

    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        response.push(byte[0]);
    }

    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

    FrameStream::new(stream, usize::MAX)
}

fn masked(frame: Frame) -> Frame {
    Frame {
        mask_key: Some(MASK),
        ..frame
    }
}

fn masked_fragment(opcode: Opcode, fin: bool, payload: &[u8]) -> Frame {
    Frame {
        fin,
        rsv1: false,
        rsv2: false,
        rsv3: false,
        opcode,
        mask_key: Some(MASK),
        payload: payload.to_vec(),
    }
}

#[tokio::test]
async fn echo_roundtrip() {
    let (client, server) = tokio::io::duplex(64 * 1024);

    let server = tokio::spawn(async move {
        let mut ws = WebSocket::accept(server).await.unwrap();
        assert_eq!(ws.url().path(), "/echo");
        loop {
            match ws.read().await {
                Ok(message) => {
                    ws.write(message).await.unwrap();
                    ws.flush().await.unwrap();
                }
                Err(Error::Closed(close)) => return close,
                Err(err) => panic!("server error: {err}"),
            }
        }
    });

    let mut client = client_connect(client).await;
    client
        .write_frame(&masked(Frame::text("marco")))
        .await
        .unwrap();
    client
        .write_frame(&masked(Frame::binary(vec![0, 1, 2])))
        .await
        .unwrap();
    client.flush().await.unwrap();

    let echo = client.read_frame().await.unwrap().unwrap();
    assert_eq!(echo.opcode, Opcode::Text);
    assert_eq!(echo.payload, b"marco");
    assert_eq!(echo.mask_key, None);

    let echo = client.read_frame().await.unwrap().unwrap();
    assert_eq!(echo.opcode, Opcode::Binary);
    assert_eq!(echo.payload, vec![0, 1, 2]);

    client
        .write_frame(&masked(Frame::close(close_code::NORMAL, "done")))
        .await
        .unwrap();
    client.flush().await.unwrap();

    let close = server.await.unwrap();
    assert_eq!(
        close,
        Some(Close {
            status: close_code::NORMAL,
            reason: "done".into()
        })
    );

    // server echoed our close
    let echo = client.read_frame().await.unwrap().unwrap();
    assert_eq!(echo.opcode, Opcode::Close);
    assert_eq!(&echo.payload[..2], &close_code::NORMAL.to_be_bytes());
}

#[tokio::test]
async fn fragmented_message_with_interleaved_ping() {
    let (client, server) = tokio::io::duplex(64 * 1024);

    let server = tokio::spawn(async move {
        let mut ws = WebSocket::accept(server).await.unwrap();
        let message = ws.read().await.unwrap();
        assert_eq!(message, Message::Text("Hello".into()));
        matches!(ws.read().await, Err(Error::Closed(_)))
    });

    let mut client = client_connect(client).await;
    client
        .write_frame(&masked_fragment(Opcode::Text, false, b"He"))
        .await
        .unwrap();
    client
        .write_frame(&masked_fragment(Opcode::Continuation, false, b"ll"))
        .await
        .unwrap();
    // a ping in the middle of the fragmented message
    client
        .write_frame(&masked(Frame::ping(b"still there?".to_vec())))
        .await
        .unwrap();
    client
        .write_frame(&masked_fragment(Opcode::Continuation, true, b"o"))
        .await
        .unwrap();
    client.flush().await.unwrap();

    // the pong echoes the ping payload exactly
    let pong = client.read_frame().await.unwrap().unwrap();
    assert_eq!(pong.opcode, Opcode::Pong);
    assert_eq!(pong.payload, b"still there?");

    client
        .write_frame(&masked(Frame::bare_close()))
        .await
        .unwrap();
    client.flush().await.unwrap();
    assert!(server.await.unwrap());
}

#[tokio::test]
async fn serve_delivers_messages_and_close_reason() {
    let (client, server) = tokio::io::duplex(64 * 1024);

    let server = tokio::spawn(async move {
        let ws = WebSocket::accept(server).await.unwrap();
        let mut seen = Vec::new();
        let close = ws.serve(|message| seen.push(message)).await.unwrap();
        (seen, close)
    });

    let mut client = client_connect(client).await;
    client
        .write_frame(&masked(Frame::text("one")))
        .await
        .unwrap();
    client
        .write_frame(&masked(Frame::text("two")))
        .await
        .unwrap();
    client
        .write_frame(&masked(Frame::close(close_code::GOING_AWAY, "bye")))
        .await
        .unwrap();
    client.flush().await.unwrap();

    let (seen, close) = server.await.unwrap();
    assert_eq!(
        seen,
        vec![Message::Text("one".into()), Message::Text("two".into())]
    );
    assert_eq!(
        close,
        Some(Close {
            status: close_code::GOING_AWAY,
            reason: "bye".into()
        })
    );
}

#[tokio::test]
async fn orphan_continuation_closes_with_protocol_error() {
    let (client, server) = tokio::io::duplex(64 * 1024);

    let server = tokio::spawn(async move {
        let mut ws = WebSocket::accept(server).await.unwrap();
        ws.read().await
    });

    let mut client = client_connect(client).await;
    client
        .write_frame(&masked_fragment(Opcode::Continuation, true, b"stray"))
        .await
        .unwrap();
    client.flush().await.unwrap();

    let err = server.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolError::OrphanContinuation)
    ));

    let close = client.read_frame().await.unwrap().unwrap();
    assert_eq!(close.opcode, Opcode::Close);
    assert_eq!(
        &close.payload[..2],
        &close_code::PROTOCOL_ERROR.to_be_bytes()
    );
}

#[tokio::test]
async fn interleaved_data_frame_closes_with_protocol_error() {
    let (client, server) = tokio::io::duplex(64 * 1024);

    let server = tokio::spawn(async move {
        let mut ws = WebSocket::accept(server).await.unwrap();
        ws.read().await
    });

    let mut client = client_connect(client).await;
    client
        .write_frame(&masked_fragment(Opcode::Text, false, b"open"))
        .await
        .unwrap();
    client
        .write_frame(&masked_fragment(Opcode::Text, true, b"second"))
        .await
        .unwrap();
    client.flush().await.unwrap();

    let err = server.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolError::InterleavedMessage)
    ));

    let close = client.read_frame().await.unwrap().unwrap();
    assert_eq!(close.opcode, Opcode::Close);
    assert_eq!(
        &close.payload[..2],
        &close_code::PROTOCOL_ERROR.to_be_bytes()
    );
}

#[tokio::test]
async fn oversized_message_closes_with_1009() {
    let (client, server) = tokio::io::duplex(64 * 1024);

    let config = Config {
        max_message_size: 16,
        ..Config::default()
    };
    let server = tokio::spawn(async move {
        let mut ws = WebSocket::accept_with(config, false, server).await.unwrap();
        ws.read().await
    });

    let mut client = client_connect(client).await;
    client
        .write_frame(&masked_fragment(Opcode::Binary, false, &[0; 10]))
        .await
        .unwrap();
    client
        .write_frame(&masked_fragment(Opcode::Continuation, true, &[0; 10]))
        .await
        .unwrap();
    client.flush().await.unwrap();

    let err = server.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::MessageTooBig));

    let close = client.read_frame().await.unwrap().unwrap();
    assert_eq!(close.opcode, Opcode::Close);
    assert_eq!(
        &close.payload[..2],
        &close_code::MESSAGE_TOO_BIG.to_be_bytes()
    );
}

#[tokio::test]
async fn reserved_opcode_closes_with_protocol_error() {
    let (client, server) = tokio::io::duplex(64 * 1024);

    let server = tokio::spawn(async move {
        let mut ws = WebSocket::accept(server).await.unwrap();
        ws.read().await
    });

    let mut client = client_connect(client).await;
    // opcode 0x3 is reserved; the codec refuses to build such a frame, so
    // write the raw header bytes directly
    client.get_mut().write_all(&[0x83, 0x00]).await.unwrap();
    client.get_mut().flush().await.unwrap();

    let err = server.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolError::ReservedOpcode(0x3))
    ));

    let close = client.read_frame().await.unwrap().unwrap();
    assert_eq!(close.opcode, Opcode::Close);
    assert_eq!(
        &close.payload[..2],
        &close_code::PROTOCOL_ERROR.to_be_bytes()
    );
}

#[tokio::test]
async fn abrupt_disconnect_is_an_io_error() {
    let (client, server) = tokio::io::duplex(64 * 1024);

    let server = tokio::spawn(async move {
        let mut ws = WebSocket::accept(server).await.unwrap();
        ws.read().await
    });

    let mut client = client_connect(client).await;
    // half a frame header, then hang up
    client.get_mut().write_all(&[0x82]).await.unwrap();
    client.get_mut().flush().await.unwrap();
    drop(client);

    let err = server.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}

#[tokio::test]
async fn clean_eof_reports_closed_without_reason() {
    let (client, server) = tokio::io::duplex(64 * 1024);

    let server = tokio::spawn(async move {
        let mut ws = WebSocket::accept(server).await.unwrap();
        ws.read().await
    });

    let client = client_connect(client).await;
    drop(client);

    let err = server.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Closed(None)));
}
