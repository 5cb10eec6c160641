use anyhow::{Context, Result};
use tokio::net::TcpListener;
use wulfenite::{Error, WebSocket};

#[derive(argh::FromArgs)]
#[argh(description = "websocket echo server")]
struct Args {
    #[argh(option, description = "address to bind to", default = "String::from(\"127.0.0.1:8080\")")]
    bind: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args: Args = argh::from_env();

    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    tracing::info!("listening on {}", args.bind);

    loop {
        let (stream, peer) = listener.accept().await.context("accept")?;

        tokio::spawn(async move {
            let mut ws = match WebSocket::accept(stream).await {
                Ok(ws) => ws,
                Err(err) => {
                    tracing::warn!(%peer, %err, "upgrade failed");
                    return;
                }
            };
            tracing::info!(%peer, url = %ws.url(), "connected");

            loop {
                match ws.read().await {
                    Ok(message) => {
                        if let Err(err) = ws.write(message).await {
                            tracing::warn!(%peer, %err, "write failed");
                            break;
                        }
                        if let Err(err) = ws.flush().await {
                            tracing::warn!(%peer, %err, "flush failed");
                            break;
                        }
                    }
                    Err(Error::Closed(close)) => {
                        tracing::info!(%peer, ?close, "closed");
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(%peer, %err, "session ended");
                        break;
                    }
                }
            }
        });
    }
}
