//! The CONNECT-then-MITM front door.
//!
//! Every tunneled connection is terminated with a forged certificate; each
//! decrypted request is offered to the registry router first, and forwarded
//! upstream untouched when the router declines it. Requests to github get
//! the configured token injected on the way through.

use crate::errors::ProxyError;
use crate::mitm::CertAuthority;
use crate::router::{self, RegistryRequest, ResponseSink, SynthesizedResponse};
use crate::CoreContext;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;

const REGISTRY_HOST: &str = "package.elm-lang.org";
const GITHUB_HOSTS: &[&str] = &["github.com", "api.github.com"];

/// Intercepted bodies are buffered; anything larger than this is dropped.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// A request read off an intercepted stream, before any routing decision.
#[derive(Debug, PartialEq)]
struct RawRequest {
    method: String,
    /// The request target as it appeared on the request line (origin-form
    /// inside tunnels, absolute-form for plain proxy requests).
    target: String,
    minor_version: u8,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

/// A response ready to serialize back onto the client stream.
#[derive(Debug, PartialEq)]
struct WireResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl From<SynthesizedResponse> for WireResponse {
    fn from(resp: SynthesizedResponse) -> Self {
        let mut headers = vec![("Content-Type".to_string(), resp.content_type)];
        headers.extend(resp.headers);
        WireResponse {
            status: resp.status,
            headers,
            body: resp.body,
        }
    }
}

/// Accepts proxy connections until the shutdown signal fires. The listener
/// is bound by the caller so address errors surface at boot.
pub async fn run(
    ctx: Arc<CoreContext>,
    authority: Arc<CertAuthority>,
    mut listener: TcpListener,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let ctx = ctx.clone();
                    let authority = authority.clone();
                    actix_rt::spawn(async move {
                        if let Err(e) = serve_connection(stream, ctx, authority).await {
                            log::debug!("connection from {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => log::warn!("accept failed: {}", e),
            },
            _ = &mut shutdown => {
                log::info!("proxy listener stopping");
                return;
            }
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    ctx: Arc<CoreContext>,
    authority: Arc<CertAuthority>,
) -> Result<(), ProxyError> {
    let mut pending = Vec::new();
    let request = match read_request(&mut stream, &mut pending).await? {
        Some(request) => request,
        None => return Ok(()),
    };

    if request.method.eq_ignore_ascii_case("CONNECT") {
        let target = request.target.clone();
        let host = target.split(':').next().unwrap_or_default().to_string();
        let config = authority.server_config(&host)?;
        stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        let tls = TlsAcceptor::from(config).accept(stream).await?;
        serve_intercepted(tls, &host, ctx).await
    } else {
        // Plain absolute-form proxying gets the same host dispatch as a
        // tunneled request, it just arrives without TLS.
        log::debug!("{} - {}", request.method, request.target);
        let response = match split_absolute_target(&request.target) {
            Some((scheme, host_port, origin)) => {
                let host_port = host_port.to_string();
                let origin = origin.to_string();
                let host = host_port.split(':').next().unwrap_or_default().to_string();
                let mut request = request;
                request.target = origin;
                route_request(&ctx, scheme, &host, &host_port, &request).await
            }
            None => WireResponse {
                status: 400,
                headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
                body: b"expected an absolute request target".to_vec(),
            },
        };
        stream.write_all(&encode_response(&response)).await?;
        stream.flush().await?;
        Ok(())
    }
}

/// Serves decrypted HTTP/1.1 requests off a tunneled stream until the peer
/// hangs up or asks to close.
async fn serve_intercepted<S>(
    mut stream: S,
    host: &str,
    ctx: Arc<CoreContext>,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut pending = Vec::new();
    loop {
        let request = match read_request(&mut stream, &mut pending).await? {
            Some(request) => request,
            None => return Ok(()),
        };
        log::debug!("{} - {}{}", request.method, host, request.target);

        let response = route_request(&ctx, "https", host, host, &request).await;
        let close = wants_close(&request);
        stream.write_all(&encode_response(&response)).await?;
        stream.flush().await?;
        if close {
            return Ok(());
        }
    }
}

/// The serve-locally-or-forward decision for one request. Shared by the
/// tunneled and plain proxy paths; `request.target` is origin-form here.
async fn route_request(
    ctx: &CoreContext,
    scheme: &str,
    host: &str,
    authority: &str,
    request: &RawRequest,
) -> WireResponse {
    if host == REGISTRY_HOST {
        let (path, query) = split_target(&request.target);
        let mut sink = ResponseSink::new();
        router::dispatch(
            ctx,
            &RegistryRequest {
                method: &request.method,
                path,
                query,
                content_type: header_value(&request.headers, "content-type"),
                body: &request.body,
            },
            &mut sink,
        );
        if let Some(response) = sink.synthesize() {
            return response.into();
        }
    }
    let inject_token = GITHUB_HOSTS.contains(&host);
    let url = format!("{}://{}{}", scheme, authority, request.target);
    forward(ctx, &url, request, inject_token).await
}

/// Splits an absolute-form request target into scheme, authority, and the
/// origin-form remainder.
fn split_absolute_target(target: &str) -> Option<(&'static str, &str, &str)> {
    let (scheme, rest) = if let Some(rest) = target.strip_prefix("http://") {
        ("http", rest)
    } else if let Some(rest) = target.strip_prefix("https://") {
        ("https", rest)
    } else {
        return None;
    };
    match rest.find('/') {
        Some(at) => Some((scheme, &rest[..at], &rest[at..])),
        None => Some((scheme, rest, "/")),
    }
}

/// Replays the request upstream through the shared client. Network failures
/// come back as a 502 so the tunnel stays usable.
async fn forward(
    ctx: &CoreContext,
    url: &str,
    request: &RawRequest,
    inject_token: bool,
) -> WireResponse {
    match forward_inner(ctx, url, request, inject_token).await {
        Ok(response) => response,
        Err(e) => {
            log::warn!("forwarding {} failed: {}", url, e);
            WireResponse {
                status: 502,
                headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
                body: b"upstream request failed".to_vec(),
            }
        }
    }
}

async fn forward_inner(
    ctx: &CoreContext,
    url: &str,
    request: &RawRequest,
    inject_token: bool,
) -> Result<WireResponse, ProxyError> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|_| ProxyError::BadRequest(format!("method `{}`", request.method)))?;

    let mut builder = ctx.upstream.request(method, url);
    for (name, value) in &request.headers {
        if is_hop_by_hop(name)
            || name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    if inject_token {
        if let Some(token) = &ctx.settings.credentials.github {
            log::debug!("appending credential header to github request");
            builder = builder.header("Authorization", format!("token {}", token));
        }
    }
    if !request.body.is_empty() {
        builder = builder.body(request.body.clone());
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let mut headers = Vec::new();
    for (name, value) in response.headers() {
        if is_hop_by_hop(name.as_str()) || name.as_str() == "content-length" {
            continue;
        }
        headers.push((
            name.to_string(),
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
        ));
    }
    let body = response.bytes().await?.to_vec();
    Ok(WireResponse {
        status,
        headers,
        body,
    })
}

/// Reads one HTTP/1.1 request off the stream. `pending` carries bytes read
/// past the previous request. `None` means the peer closed cleanly between
/// requests.
async fn read_request<R>(
    stream: &mut R,
    pending: &mut Vec<u8>,
) -> Result<Option<RawRequest>, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let (method, target, minor_version, headers, head_len) = loop {
        let mut header_buf = [httparse::EMPTY_HEADER; 64];
        let mut parser = httparse::Request::new(&mut header_buf);
        match parser
            .parse(&pending[..])
            .map_err(|e| ProxyError::BadRequest(e.to_string()))?
        {
            httparse::Status::Complete(head_len) => {
                let method = parser.method.unwrap_or_default().to_string();
                let target = parser.path.unwrap_or_default().to_string();
                let minor_version = parser.version.unwrap_or(1);
                let headers: Vec<(String, String)> = parser
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_string(),
                            String::from_utf8_lossy(h.value).into_owned(),
                        )
                    })
                    .collect();
                break (method, target, minor_version, headers, head_len);
            }
            httparse::Status::Partial => {
                if fill(stream, pending).await? == 0 {
                    if pending.is_empty() {
                        return Ok(None);
                    }
                    return Err(ProxyError::BadRequest("unexpected eof in head".into()));
                }
            }
        }
    };
    pending.drain(..head_len);

    let chunked = header_value(&headers, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    let body = if chunked {
        read_chunked_body(stream, pending).await?
    } else if let Some(length) =
        header_value(&headers, "content-length").and_then(|v| v.trim().parse::<usize>().ok())
    {
        if length > MAX_BODY_BYTES {
            return Err(ProxyError::BadRequest("body too large".into()));
        }
        take_exact(stream, pending, length).await?
    } else {
        Vec::new()
    };

    Ok(Some(RawRequest {
        method,
        target,
        minor_version,
        headers,
        body,
    }))
}

async fn read_chunked_body<R>(stream: &mut R, pending: &mut Vec<u8>) -> Result<Vec<u8>, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let line = take_line(stream, pending).await?;
        let size_str = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| ProxyError::BadRequest(format!("chunk size `{}`", size_str)))?;
        if size == 0 {
            // Trailers run until an empty line.
            loop {
                if take_line(stream, pending).await?.is_empty() {
                    return Ok(body);
                }
            }
        }
        if body.len() + size > MAX_BODY_BYTES {
            return Err(ProxyError::BadRequest("body too large".into()));
        }
        body.extend_from_slice(&take_exact(stream, pending, size).await?);
        // Chunk data is followed by its own CRLF.
        take_exact(stream, pending, 2).await?;
    }
}

async fn fill<R>(stream: &mut R, pending: &mut Vec<u8>) -> Result<usize, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    let n = stream.read(&mut chunk).await?;
    pending.extend_from_slice(&chunk[..n]);
    Ok(n)
}

async fn take_exact<R>(
    stream: &mut R,
    pending: &mut Vec<u8>,
    count: usize,
) -> Result<Vec<u8>, ProxyError>
where
    R: AsyncRead + Unpin,
{
    while pending.len() < count {
        if fill(stream, pending).await? == 0 {
            return Err(ProxyError::BadRequest("unexpected eof in body".into()));
        }
    }
    let rest = pending.split_off(count);
    Ok(std::mem::replace(pending, rest))
}

async fn take_line<R>(stream: &mut R, pending: &mut Vec<u8>) -> Result<String, ProxyError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(at) = pending.windows(2).position(|w| w == b"\r\n") {
            let line = take_exact(stream, pending, at + 2).await?;
            return Ok(String::from_utf8_lossy(&line[..at]).into_owned());
        }
        if fill(stream, pending).await? == 0 {
            return Err(ProxyError::BadRequest("unexpected eof in body".into()));
        }
    }
}

fn encode_response(response: &WireResponse) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {} {}\r\n",
        response.status,
        reason_phrase(response.status)
    )
    .into_bytes();
    for (name, value) in &response.headers {
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", response.body.len()).as_bytes());
    out.extend_from_slice(&response.body);
    out
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "",
    }
}

fn wants_close(request: &RawRequest) -> bool {
    match header_value(&request.headers, "connection") {
        Some(value) => value.eq_ignore_ascii_case("close"),
        None => request.minor_version == 0,
    }
}

fn split_target(target: &str) -> (&str, &str) {
    match target.find('?') {
        Some(at) => (&target[..at], &target[at + 1..]),
        None => (target, ""),
    }
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
