//! A WebSocket echo server built on `HttpExchange`.
//! Plain HTTP requests get a short text response, upgrade requests are echoed frame by frame.

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use wsgate::{HttpExchange, MessageType, Options, WebSocket};

/// Echoes every data fragment back with the same type and end-of-message flag.
///
/// # Arguments
/// * `ws` - The upgraded connection
async fn echo(ws: WebSocket) -> wsgate::Result<()> {
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        let result = ws.receive(&mut buf).await?;
        if result.message_type == MessageType::Close {
            log::debug!(
                "Client closed ({:?}, {:?})",
                result.close_status,
                result.close_description
            );
            return Ok(());
        }

        ws.send(
            &buf[..result.count],
            result.message_type,
            result.end_of_message,
        )
        .await?;
    }
}

/// Reads one request from the connection and either upgrades it or answers with plain text.
async fn handle_connection(stream: TcpStream) -> wsgate::Result<()> {
    let mut exchange = HttpExchange::read_request(stream).await?;

    if !exchange.is_websocket_request() {
        log::info!(
            "Plain request for {} ({:?})",
            exchange.request().uri(),
            exchange.can_upgrade().reason
        );
        exchange.write_body(b"Hello World").await?;
        exchange.finish().await?;
        return Ok(());
    }

    let ws = exchange
        .accept_websocket_with_options(
            Options::default()
                .with_max_payload_read(100 * 1024 * 1024)
                .with_max_read_buffer(200 * 1024 * 1024),
        )
        .await?;

    echo(ws).await
}

/// Main entry point for the echo server.
///
/// Initializes logging and starts listening on port 8080. Each connection is handled in a separate
/// task.
#[tokio::main]
async fn main() -> Result<()> {
    simple_logger::init_with_level(log::Level::Debug).expect("log");

    let listener = TcpListener::bind("0.0.0.0:8080").await?;

    log::debug!("Listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = listener.accept().await?;
        log::info!("Client connected from {peer}");

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream).await {
                log::error!("Error in connection: {}", e);
            }
        });
    }
}
