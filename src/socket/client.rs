//! Client side of the opening handshake.

use bytes::Bytes;
use http_body_util::Empty;
use hyper::{header, Method, Request};
use hyper_util::rt::TokioIo;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use url::Url;

use crate::{
    handshake::{self, generate_key, WEBSOCKET_VERSION},
    Result, WebSocketError,
};

use super::{HttpStream, Options, Role, WebSocket};

impl WebSocket {
    /// Establishes a WebSocket connection to the specified `ws://` url.
    ///
    /// # Examples
    /// ```no_run
    /// use wsgate::WebSocket;
    ///
    /// #[tokio::main]
    /// async fn main() -> wsgate::Result<()> {
    ///    let ws = WebSocket::connect("ws://127.0.0.1:8080/chat".parse()?).await?;
    ///    Ok(())
    /// }
    /// ```
    pub async fn connect(url: Url) -> Result<WebSocket> {
        Self::connect_with_options(url, Options::default()).await
    }

    /// Establishes a WebSocket connection with custom options.
    ///
    /// Only plain `ws://` urls are dialed; for TLS, open the stream yourself and use
    /// [`WebSocket::handshake`].
    pub async fn connect_with_options(url: Url, options: Options) -> Result<WebSocket> {
        if url.scheme() != "ws" {
            return Err(WebSocketError::InvalidHttpScheme);
        }
        let host = url.host_str().ok_or(WebSocketError::InvalidHttpScheme)?;
        let port = url
            .port_or_known_default()
            .ok_or(WebSocketError::InvalidHttpScheme)?;

        let tcp_stream = TcpStream::connect((host, port)).await?;
        if options.no_delay {
            tcp_stream.set_nodelay(true)?;
        }

        Self::handshake(url, tcp_stream, options).await
    }

    /// Performs a WebSocket handshake over an existing connection.
    ///
    /// The upgrade request is sent through hyper's HTTP/1 client; the response must be
    /// `101 Switching Protocols` with a `Sec-WebSocket-Accept` matching the generated key.
    pub async fn handshake<S>(url: Url, io: S, options: Options) -> Result<WebSocket>
    where
        S: AsyncWrite + AsyncRead + Send + Unpin + 'static,
    {
        let host = url.host_str().ok_or(WebSocketError::InvalidHttpScheme)?;
        let host_header = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let key = generate_key();
        let request = Request::builder()
            .method(Method::GET)
            .uri(&url[url::Position::BeforePath..])
            .header(header::HOST, host_header)
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "Upgrade")
            .header(header::SEC_WEBSOCKET_KEY, key.as_str())
            .header(header::SEC_WEBSOCKET_VERSION, WEBSOCKET_VERSION)
            .body(Empty::<Bytes>::new())
            .map_err(|err| WebSocketError::InvalidHttpRequest(err.to_string()))?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;

        tokio::spawn(async move {
            if let Err(_err) = conn.with_upgrades().await {
                #[cfg(feature = "logging")]
                log::error!("upgrading connection: {:?}", _err);
            }
        });

        let mut response = sender.send_request(request).await?;
        handshake::verify(&response, &key)?;

        #[cfg(feature = "logging")]
        log::debug!("handshake with {url} accepted");

        let upgraded = hyper::upgrade::on(&mut response).await?;

        Ok(WebSocket::new(
            Role::Client,
            HttpStream::from(TokioIo::new(upgraded)),
            options.negotiate(),
        ))
    }
}
