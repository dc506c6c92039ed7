//! A single HTTP/1.1 request/response exchange that may switch to the WebSocket protocol.

use bytes::{Bytes, BytesMut};
use http::{
    header, HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, Uri, Version,
};
use nom::{
    bytes::complete::{tag, take_till1, take_while, take_while1},
    character::complete::space0,
    multi::many0,
    sequence::{delimited, preceded, terminated},
    IResult, Parser,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    handshake::{self, UpgradeDecision},
    response::{Commit, ResponseGuard},
    socket::HttpStream,
    Options, ResponseState, Result, Role, WebSocket, WebSocketError,
};

/// Largest request head accepted by [`HttpExchange::read_request`].
pub const MAX_REQUEST_HEAD: usize = 16 * 1024;

/// One HTTP/1.1 exchange read from a transport.
///
/// The exchange either produces an ordinary response ([`write_body`](Self::write_body) and
/// [`finish`](Self::finish)) or switches protocols ([`accept_websocket`](Self::accept_websocket)), never
/// both: the first write commits the response and from then on the upgrade is refused with
/// [`WebSocketError::AlreadyCommitted`].
///
/// # Example
/// ```no_run
/// use wsgate::{HttpExchange, WebSocketError};
///
/// async fn serve(stream: tokio::net::TcpStream) -> wsgate::Result<()> {
///     let mut exchange = HttpExchange::read_request(stream).await?;
///
///     match exchange.accept_websocket().await {
///         Ok(ws) => {
///             // hand `ws` to the application
///             # let _ = ws;
///             Ok(())
///         }
///         Err(err) if err.is_negotiation_error() => {
///             exchange.set_status(http::StatusCode::BAD_REQUEST)?;
///             exchange.write_body(err.to_string().as_bytes()).await?;
///             exchange.finish().await?;
///             Ok(())
///         }
///         Err(err) => Err(err),
///     }
/// }
/// ```
pub struct HttpExchange<S> {
    request: Request<()>,
    status: StatusCode,
    headers: HeaderMap,
    guard: ResponseGuard,
    /// `None` once the transport was handed over or returned.
    io: Option<S>,
    /// Bytes read past the request head.
    read_buf: BytesMut,
    chunked: bool,
}

impl<S> HttpExchange<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Reads one request head from `io`.
    ///
    /// Bytes following the head are kept: they become the first bytes of the WebSocket stream if the
    /// exchange is upgraded.
    pub async fn read_request(mut io: S) -> Result<Self> {
        let mut buf = BytesMut::with_capacity(1024);

        let head_len = loop {
            if let Some(end) = find_head_end(&buf) {
                break end;
            }
            if buf.len() > MAX_REQUEST_HEAD {
                return Err(WebSocketError::RequestHeadTooLarge);
            }
            if io.read_buf(&mut buf).await? == 0 {
                return Err(WebSocketError::InvalidHttpRequest(
                    "connection closed before the request head was complete".to_owned(),
                ));
            }
        };

        if head_len > MAX_REQUEST_HEAD {
            return Err(WebSocketError::RequestHeadTooLarge);
        }

        let head = buf.split_to(head_len);
        let request = parse_request_head(&head)?;

        #[cfg(feature = "logging")]
        log::debug!("{} {} {:?}", request.method(), request.uri(), request.version());

        Ok(Self {
            request,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            guard: ResponseGuard::new(),
            io: Some(io),
            read_buf: buf,
            chunked: false,
        })
    }

    /// The parsed request. Its body is not read by the exchange: the part that arrived together with
    /// the head is available through [`buffered`](Self::buffered), the rest is still on the transport.
    pub fn request(&self) -> &Request<()> {
        &self.request
    }

    /// Bytes that were read past the request head.
    ///
    /// For an ordinary request this is the start of its body. After an upgrade it is empty, the bytes
    /// having been handed to the [`WebSocket`].
    pub fn buffered(&self) -> &[u8] {
        &self.read_buf
    }

    pub fn response_state(&self) -> ResponseState {
        self.guard.state()
    }

    /// Reports whether the exchange can be upgraded to a WebSocket, and why not.
    ///
    /// A committed or upgraded response is reported as [`UpgradeRefusal::AlreadyCommitted`](crate::UpgradeRefusal::AlreadyCommitted)
    /// before the request headers are looked at.
    pub fn can_upgrade(&self) -> UpgradeDecision {
        handshake::evaluate(
            self.request.version(),
            self.request.headers(),
            self.guard.state(),
        )
    }

    /// Returns `true` if the request asks to switch to some protocol and the response is still
    /// pending. The target protocol is not checked; see
    /// [`is_websocket_request`](Self::is_websocket_request).
    pub fn is_upgradable_request(&self) -> bool {
        self.guard.state() == ResponseState::Pending
            && handshake::is_upgrade_request(self.request.version(), self.request.headers())
    }

    /// Returns `true` if [`accept_websocket`](Self::accept_websocket) would succeed.
    pub fn is_websocket_request(&self) -> bool {
        self.can_upgrade().eligible
    }

    /// Sets the status of the ordinary response.
    pub fn set_status(&mut self, status: StatusCode) -> Result<()> {
        match self.guard.state() {
            ResponseState::Pending => {
                self.status = status;
                Ok(())
            }
            ResponseState::Committed => Err(WebSocketError::AlreadyCommitted),
            ResponseState::Upgraded => Err(WebSocketError::AlreadyUpgraded),
        }
    }

    /// Response headers. Changes made after the response was committed are not sent.
    ///
    /// Headers set here before an upgrade are included in the 101 response, except `Content-Length`
    /// and `Transfer-Encoding`.
    pub fn response_headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Writes part of the response body.
    ///
    /// The first call commits the response and writes the head. Without a `Content-Length` header the
    /// body uses chunked transfer encoding and each call writes one chunk. HTTP/1.0 clients cannot
    /// decode chunks, so their responses are sent with `Connection: close` and the body ends when the
    /// transport is closed. Every call flushes.
    pub async fn write_body(&mut self, data: &[u8]) -> Result<()> {
        self.commit_head().await?;

        let io = self.io.as_mut().ok_or(WebSocketError::AlreadyUpgraded)?;
        // an empty chunk would terminate the body
        if !data.is_empty() {
            if self.chunked {
                io.write_all(format!("{:X}\r\n", data.len()).as_bytes())
                    .await?;
                io.write_all(data).await?;
                io.write_all(b"\r\n").await?;
            } else {
                io.write_all(data).await?;
            }
        }
        io.flush().await?;

        Ok(())
    }

    /// Completes the ordinary response and returns the transport.
    ///
    /// A chunked body gets its terminating chunk. If nothing was written yet, an empty response with
    /// `Content-Length: 0` is sent. Request bytes still in [`buffered`](Self::buffered) are discarded.
    ///
    /// A response without a length (see [`write_body`](Self::write_body)) is only complete once the
    /// returned transport is shut down.
    pub async fn finish(mut self) -> Result<S> {
        if self.guard.state() == ResponseState::Pending
            && !self.headers.contains_key(header::CONTENT_LENGTH)
        {
            self.headers
                .insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        }

        self.commit_head().await?;

        let mut io = self.io.take().ok_or(WebSocketError::AlreadyUpgraded)?;
        if self.chunked {
            io.write_all(b"0\r\n\r\n").await?;
        }
        io.flush().await?;

        Ok(io)
    }

    /// Commits the response and writes its head if this is the first write.
    async fn commit_head(&mut self) -> Result<()> {
        if !self.guard.commit(Commit::Headers)? {
            return Ok(());
        }

        let has_length = self.headers.contains_key(header::CONTENT_LENGTH);
        self.chunked = !has_length && self.request.version() >= Version::HTTP_11;
        if self.chunked {
            self.headers.insert(
                header::TRANSFER_ENCODING,
                HeaderValue::from_static("chunked"),
            );
        } else if !has_length {
            self.headers.remove(header::TRANSFER_ENCODING);
            self.headers
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        }

        let head = encode_head(self.status, &self.headers);
        let io = self.io.as_mut().ok_or(WebSocketError::AlreadyUpgraded)?;
        io.write_all(&head).await?;

        Ok(())
    }
}

impl<S> HttpExchange<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Completes the opening handshake and turns the transport into a server-side [`WebSocket`].
    ///
    /// # Errors
    /// - [`WebSocketError::AlreadyUpgraded`] if the exchange was already upgraded.
    /// - [`WebSocketError::AlreadyCommitted`] if response bytes were written.
    /// - [`WebSocketError::NotUpgradeRequest`], [`WebSocketError::MissingSecWebSocketKey`] or
    ///   [`WebSocketError::InvalidSecWebsocketVersion`] if the request is not a valid upgrade request.
    ///
    /// Nothing is written in any of these cases and the exchange stays usable for an ordinary response
    /// unless it was upgraded.
    pub async fn accept_websocket(&mut self) -> Result<WebSocket> {
        self.accept_websocket_with_options(Options::default()).await
    }

    /// Like [`accept_websocket`](Self::accept_websocket), with custom connection options.
    pub async fn accept_websocket_with_options(&mut self, options: Options) -> Result<WebSocket> {
        match self.guard.state() {
            ResponseState::Upgraded => return Err(WebSocketError::AlreadyUpgraded),
            ResponseState::Committed => return Err(WebSocketError::AlreadyCommitted),
            ResponseState::Pending => {}
        }

        self.can_upgrade().into_result()?;

        let key = self
            .request
            .headers()
            .get(header::SEC_WEBSOCKET_KEY)
            .ok_or(WebSocketError::MissingSecWebSocketKey)?;
        let accept = HeaderValue::try_from(handshake::accept_key(key.as_bytes()))
            .map_err(|err| WebSocketError::InvalidHttpRequest(err.to_string()))?;

        // from here on the exchange belongs to the WebSocket, even if writing the 101 fails
        self.guard.commit(Commit::Upgrade)?;
        let mut io = self.io.take().ok_or(WebSocketError::AlreadyUpgraded)?;

        let mut headers = std::mem::take(&mut self.headers);
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::TRANSFER_ENCODING);
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);

        io.write_all(&encode_head(StatusCode::SWITCHING_PROTOCOLS, &headers))
            .await?;
        io.flush().await?;

        #[cfg(feature = "logging")]
        log::debug!("upgraded {} to websocket", self.request.uri());

        let prefix: Bytes = std::mem::take(&mut self.read_buf).freeze();
        Ok(WebSocket::new(
            Role::Server,
            HttpStream::raw(io, prefix),
            options.negotiate(),
        ))
    }
}

/// Returns the length of the request head including the blank line, if it is complete.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn encode_head(status: StatusCode, headers: &HeaderMap) -> BytesMut {
    let mut head = BytesMut::with_capacity(256);
    head.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    for (name, value) in headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

// ================ Request head parser ====================

type RequestLine<'a> = (&'a [u8], &'a [u8], &'a [u8]);

/// `tchar` from RFC 9110.
fn is_token(c: u8) -> bool {
    c.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&c)
}

/// `METHOD SP request-target SP HTTP/x.y CRLF`
fn request_line(input: &[u8]) -> IResult<&[u8], RequestLine<'_>> {
    (
        terminated(take_while1(is_token), tag(" ")),
        terminated(take_till1(|c: u8| c == b' ' || c == b'\r'), tag(" ")),
        terminated(
            preceded(
                tag("HTTP/"),
                take_while1(|c: u8| c.is_ascii_digit() || c == b'.'),
            ),
            tag("\r\n"),
        ),
    )
        .parse(input)
}

/// `field-name ":" OWS field-value CRLF`
fn header_line(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8])> {
    (
        terminated(take_while1(is_token), tag(":")),
        delimited(
            space0,
            take_while(|c: u8| c != b'\r' && c != b'\n'),
            tag("\r\n"),
        ),
    )
        .parse(input)
}

fn request_head(input: &[u8]) -> IResult<&[u8], (RequestLine<'_>, Vec<(&[u8], &[u8])>)> {
    terminated((request_line, many0(header_line)), tag("\r\n")).parse(input)
}

fn parse_request_head(head: &[u8]) -> Result<Request<()>> {
    let invalid = |reason: String| WebSocketError::InvalidHttpRequest(reason);

    let (_, ((method, target, version), fields)) =
        request_head(head).map_err(|_| invalid("malformed request head".to_owned()))?;

    let version = match version {
        b"1.1" => Version::HTTP_11,
        b"1.0" => Version::HTTP_10,
        other => {
            return Err(invalid(format!(
                "unsupported version HTTP/{}",
                String::from_utf8_lossy(other)
            )))
        }
    };
    let method = Method::from_bytes(method).map_err(|err| invalid(err.to_string()))?;
    let uri = Uri::try_from(target).map_err(|err| invalid(err.to_string()))?;

    let mut headers = HeaderMap::with_capacity(fields.len());
    for (name, value) in fields {
        let name = HeaderName::from_bytes(name).map_err(|err| invalid(err.to_string()))?;
        let value =
            HeaderValue::from_bytes(value.trim_ascii()).map_err(|err| invalid(err.to_string()))?;
        headers.append(name, value);
    }

    let mut request = Request::new(());
    *request.method_mut() = method;
    *request.uri_mut() = uri;
    *request.version_mut() = version;
    *request.headers_mut() = headers;

    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::Encoder,
        frame::Frame,
        MessageType, UpgradeRefusal,
    };
    use tokio::io::{duplex, DuplexStream};
    use tokio_util::codec::Encoder as _;

    const UPGRADE_REQUEST: &str = "GET /chat HTTP/1.1\r\n\
        Host: localhost\r\n\
        Upgrade: websocket\r\n\
        Connection: keep-alive, Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";

    const PLAIN_REQUEST: &str = "GET /hello HTTP/1.1\r\nHost: localhost\r\n\r\n";

    async fn read_exchange(request: &[u8]) -> (HttpExchange<DuplexStream>, DuplexStream) {
        let (mut client, server) = duplex(64 * 1024);
        client.write_all(request).await.unwrap();
        let exchange = HttpExchange::read_request(server).await.unwrap();
        (exchange, client)
    }

    async fn read_head(client: &mut DuplexStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            client.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    #[test]
    fn test_parse_request_head() {
        let request = parse_request_head(
            b"POST /a/b?c=d HTTP/1.1\r\nHost: example.com\r\nX-Multi: one\r\nx-multi: two  \r\n\r\n",
        )
        .unwrap();

        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.uri().path(), "/a/b");
        assert_eq!(request.uri().query(), Some("c=d"));
        assert_eq!(request.version(), Version::HTTP_11);
        assert_eq!(request.headers()[header::HOST], "example.com");

        let multi: Vec<_> = request.headers().get_all("x-multi").iter().collect();
        assert_eq!(multi, vec!["one", "two"]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for head in [
            &b"GET\r\n\r\n"[..],
            b"GET / FTP/1.1\r\n\r\n",
            b"GET / HTTP/2.0\r\n\r\n",
            b"GET / HTTP/1.1\r\nBad Header\r\n\r\n",
        ] {
            assert!(matches!(
                parse_request_head(head),
                Err(WebSocketError::InvalidHttpRequest(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_read_request_keeps_trailing_bytes() {
        let mut bytes = PLAIN_REQUEST.as_bytes().to_vec();
        bytes.extend_from_slice(b"extra");
        let (exchange, _client) = read_exchange(&bytes).await;

        assert_eq!(exchange.request().uri().path(), "/hello");
        assert_eq!(&exchange.read_buf[..], b"extra");
    }

    #[tokio::test]
    async fn test_read_request_too_large() {
        let (mut client, server) = duplex(64 * 1024);
        let mut bytes = b"GET / HTTP/1.1\r\n".to_vec();
        bytes.extend(std::iter::repeat(b'a').take(MAX_REQUEST_HEAD + 1));
        client.write_all(&bytes).await.unwrap();

        assert!(matches!(
            HttpExchange::read_request(server).await,
            Err(WebSocketError::RequestHeadTooLarge)
        ));
    }

    #[tokio::test]
    async fn test_read_request_truncated() {
        let (mut client, server) = duplex(1024);
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        drop(client);

        assert!(matches!(
            HttpExchange::read_request(server).await,
            Err(WebSocketError::InvalidHttpRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_chunked_response() {
        let (mut exchange, mut client) = read_exchange(PLAIN_REQUEST.as_bytes()).await;

        assert!(!exchange.is_upgradable_request());
        assert_eq!(
            exchange.can_upgrade().reason,
            Some(UpgradeRefusal::NotUpgradeRequest)
        );

        exchange
            .response_headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        exchange.write_body(b"Hello ").await.unwrap();
        assert_eq!(exchange.response_state(), ResponseState::Committed);
        exchange.write_body(b"World").await.unwrap();
        drop(exchange.finish().await.unwrap());

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert_eq!(
            response,
            "HTTP/1.1 200 OK\r\n\
             content-type: text/plain\r\n\
             transfer-encoding: chunked\r\n\
             \r\n\
             6\r\nHello \r\n\
             5\r\nWorld\r\n\
             0\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn test_fixed_length_response() {
        let (mut exchange, mut client) = read_exchange(PLAIN_REQUEST.as_bytes()).await;

        exchange.set_status(StatusCode::NOT_FOUND).unwrap();
        exchange
            .response_headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from_static("4"));
        exchange.write_body(b"nope").await.unwrap();
        assert!(matches!(
            exchange.set_status(StatusCode::OK),
            Err(WebSocketError::AlreadyCommitted)
        ));
        drop(exchange.finish().await.unwrap());

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert_eq!(
            response,
            "HTTP/1.1 404 Not Found\r\ncontent-length: 4\r\n\r\nnope"
        );
    }

    #[tokio::test]
    async fn test_http10_response_is_close_delimited() {
        let (mut exchange, mut client) =
            read_exchange(b"GET /old HTTP/1.0\r\nHost: localhost\r\n\r\n").await;

        exchange.write_body(b"Hello ").await.unwrap();
        exchange.write_body(b"World").await.unwrap();
        let mut io = exchange.finish().await.unwrap();
        io.shutdown().await.unwrap();
        drop(io);

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert_eq!(
            response,
            "HTTP/1.1 200 OK\r\nconnection: close\r\n\r\nHello World"
        );
    }

    #[tokio::test]
    async fn test_body_bytes_read_with_head_are_exposed() {
        let request = "POST /submit HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello";
        let (mut exchange, _client) = read_exchange(request.as_bytes()).await;

        assert_eq!(exchange.request().method(), Method::POST);
        assert_eq!(exchange.buffered(), b"hello");

        exchange.write_body(b"ok").await.unwrap();
        assert_eq!(exchange.buffered(), b"hello");
    }

    #[tokio::test]
    async fn test_empty_response() {
        let (exchange, mut client) = read_exchange(PLAIN_REQUEST.as_bytes()).await;
        drop(exchange.finish().await.unwrap());

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert_eq!(response, "HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n");
    }

    #[tokio::test]
    async fn test_accept_after_commit() {
        let (mut exchange, mut client) = read_exchange(UPGRADE_REQUEST.as_bytes()).await;
        assert!(exchange.is_websocket_request());

        exchange.write_body(b"too late").await.unwrap();

        assert!(!exchange.is_websocket_request());
        assert_eq!(
            exchange.can_upgrade().reason,
            Some(UpgradeRefusal::AlreadyCommitted)
        );
        assert!(matches!(
            exchange.accept_websocket().await,
            Err(WebSocketError::AlreadyCommitted)
        ));

        drop(exchange.finish().await.unwrap());

        // the ordinary response is intact and nothing else was written
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\n8\r\ntoo late\r\n0\r\n\r\n"));
        assert!(!response.contains("101"));
    }

    #[tokio::test]
    async fn test_accept_websocket() {
        let (mut exchange, mut client) = read_exchange(UPGRADE_REQUEST.as_bytes()).await;
        exchange
            .response_headers_mut()
            .insert("x-served-by", HeaderValue::from_static("wsgate"));
        exchange
            .response_headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from_static("10"));

        let ws = exchange.accept_websocket().await.unwrap();
        assert_eq!(ws.role(), Role::Server);
        assert_eq!(exchange.response_state(), ResponseState::Upgraded);

        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(head.contains("upgrade: websocket\r\n"));
        assert!(head.contains("connection: Upgrade\r\n"));
        assert!(head.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(head.contains("x-served-by: wsgate\r\n"));
        assert!(!head.contains("content-length"));

        assert!(matches!(
            exchange.accept_websocket().await,
            Err(WebSocketError::AlreadyUpgraded)
        ));
        assert!(matches!(
            exchange.write_body(b"nope").await,
            Err(WebSocketError::AlreadyUpgraded)
        ));
        assert!(!exchange.is_upgradable_request());
    }

    #[tokio::test]
    async fn test_missing_key_leaves_exchange_usable() {
        let request = UPGRADE_REQUEST.replace("Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n", "");
        let (mut exchange, mut client) = read_exchange(request.as_bytes()).await;

        assert!(exchange.is_upgradable_request());
        assert_eq!(
            exchange.can_upgrade().reason,
            Some(UpgradeRefusal::MissingKey)
        );

        let err = exchange.accept_websocket().await.unwrap_err();
        assert!(matches!(err, WebSocketError::MissingSecWebSocketKey));
        assert!(err.is_negotiation_error());
        assert_eq!(exchange.response_state(), ResponseState::Pending);

        exchange.set_status(StatusCode::BAD_REQUEST).unwrap();
        exchange.write_body(b"bad").await.unwrap();
        drop(exchange.finish().await.unwrap());

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn test_upgradable_but_not_websocket() {
        let request = "GET / HTTP/1.1\r\nHost: x\r\nUpgrade: h2c\r\nConnection: Upgrade, HTTP2-Settings\r\n\r\n";
        let (exchange, _client) = read_exchange(request.as_bytes()).await;

        assert!(exchange.is_upgradable_request());
        assert!(!exchange.is_websocket_request());
    }

    #[tokio::test]
    async fn test_http10_is_not_upgradable() {
        let request = UPGRADE_REQUEST.replace("HTTP/1.1", "HTTP/1.0");
        let (mut exchange, _client) = read_exchange(request.as_bytes()).await;

        assert!(!exchange.is_upgradable_request());
        assert!(matches!(
            exchange.accept_websocket().await,
            Err(WebSocketError::NotUpgradeRequest)
        ));
    }

    #[tokio::test]
    async fn test_frame_sent_with_request_is_not_lost() {
        let mut bytes = UPGRADE_REQUEST.as_bytes().to_vec();
        let mut frame = BytesMut::new();
        Encoder::new(Role::Client)
            .encode(Frame::text("early"), &mut frame)
            .unwrap();
        bytes.extend_from_slice(&frame);

        let (mut exchange, mut client) = read_exchange(&bytes).await;
        let ws = exchange.accept_websocket().await.unwrap();
        assert!(exchange.buffered().is_empty());
        read_head(&mut client).await;

        let message = ws.receive_message().await.unwrap();
        assert_eq!(message.message_type, MessageType::Text);
        assert_eq!(message.as_text(), Some("early"));
    }
}
