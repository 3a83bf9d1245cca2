//! Plain HTTP forwarding for absolute-form `http://` requests
//!
//! One request per client connection: `Connection: close` is forced towards
//! the origin and back to the client, so the response body is simply relayed
//! until the origin closes.

use crate::http::{HttpError, RequestHead, parse_response_head, read_head, render_headers};
use crate::tracker::{TrackedResponse, TrafficTracker, unbracket};
use crate::tunnel::{ConnectTarget, HandlerOpts, ReplayStream, connect_target};
use bytes::Bytes;
use ::http::uri::Uri;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

// Connection-scoped headers that must not travel past the proxy
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
    "transfer-encoding",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|hop| hop.eq_ignore_ascii_case(name))
}

/// Forwards one plain HTTP request to its origin and relays the response.
///
/// `buffered` holds bytes the client sent after the request head. Returns the
/// status code sent to the client; failures after the response started are
/// recorded on the traffic record and returned as errors.
pub async fn forward_http<S>(
    request: RequestHead,
    mut client: S,
    buffered: Bytes,
    opts: &HandlerOpts,
    tracker: &TrafficTracker,
) -> io::Result<u16>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = tracker.start_request(&request, opts.connection_id, true);
    let exchange = tracker.track_http_request(&id, &request);

    let origin = match origin_of(&request) {
        Some(origin) => origin,
        None => {
            let response = exchange.response(client);
            return reject(response, 400, "Only absolute http:// URLs can be forwarded").await;
        }
    };
    if request.content_length().is_none() && request.header("transfer-encoding").is_some() {
        let response = exchange.response(client);
        return reject(response, 411, "Chunked request bodies are not supported").await;
    }

    let mut target = match connect_target(&origin.target, opts).await {
        Ok(stream) => tracker.track_target_socket(&id, stream),
        Err(e) => {
            debug!(connection_id = opts.connection_id, target = %origin.target, error = %e, "Origin connect failed");
            let mut response = exchange.response(client);
            send_error(&mut response, 502, "Bad Gateway").await?;
            response.fail(&e.to_string()).await?;
            return Ok(502);
        }
    };

    let mut head = format!("{} {} HTTP/1.1\r\n", request.method, origin.path);
    render_headers(&origin_headers(&request, &origin.host), &mut head);
    head.push_str("\r\n");

    let relayed = async {
        target.write_all(head.as_bytes()).await?;

        let length = request.content_length().unwrap_or(0);
        if length > 0 {
            let mut body = exchange
                .request_body(ReplayStream::new(buffered, &mut client))
                .take(length);
            tokio::io::copy(&mut body, &mut target).await?;
        }
        target.flush().await?;

        let mut buffer = Vec::new();
        let end = read_head(&mut target, &mut buffer).await?;
        let response_head = parse_response_head(&buffer[..end])?;
        Ok::<_, HttpError>((response_head, buffer.split_off(end)))
    }
    .await;

    let mut response = exchange.response(client);
    let (response_head, body_start) = match relayed {
        Ok(parts) => parts,
        Err(e) => {
            send_error(&mut response, 502, "Bad Gateway").await?;
            response.fail(&e.to_string()).await?;
            return Ok(502);
        }
    };

    let status = response_head.status;
    let mut headers: Vec<(String, String)> = response_head
        .headers
        .into_iter()
        .filter(|(name, _)| !is_hop_by_hop(name) || name.eq_ignore_ascii_case("transfer-encoding"))
        .collect();
    headers.push(("Connection".to_string(), "close".to_string()));
    response.write_head(status, headers).await?;

    let copied = async {
        response.write_all(&body_start).await?;
        tokio::io::copy(&mut target, &mut response).await?;
        Ok::<_, io::Error>(())
    }
    .await;

    match copied {
        Ok(()) => response.end().await?,
        Err(e) => {
            response.fail(&e.to_string()).await?;
            return Err(e);
        }
    }
    Ok(status)
}

struct Origin {
    target: ConnectTarget,
    /// Value for the `Host` header
    host: String,
    path: String,
}

fn origin_of(request: &RequestHead) -> Option<Origin> {
    let uri: Uri = request.url.parse().ok()?;
    if !uri.scheme_str()?.eq_ignore_ascii_case("http") {
        return None;
    }
    let authority = uri.authority()?;
    let host = unbracket(authority.host());
    if host.is_empty() {
        return None;
    }

    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| !pq.is_empty())
        .unwrap_or("/");
    Some(Origin {
        target: ConnectTarget {
            host: host.to_string(),
            port: authority.port_u16().unwrap_or(80),
        },
        host: authority.as_str().rsplit('@').next().unwrap_or_default().to_string(),
        path: path.to_string(),
    })
}

fn origin_headers(request: &RequestHead, host: &str) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = request
        .headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .cloned()
        .collect();
    if request.header("host").is_none() {
        headers.insert(0, ("Host".to_string(), host.to_string()));
    }
    headers.push(("Connection".to_string(), "close".to_string()));
    headers
}

async fn send_error<W: AsyncWrite + Unpin>(
    response: &mut TrackedResponse<W>,
    status: u16,
    message: &str,
) -> io::Result<()> {
    response
        .write_head(
            status,
            vec![
                ("Content-Type".to_string(), "text/plain".to_string()),
                ("Content-Length".to_string(), message.len().to_string()),
                ("Connection".to_string(), "close".to_string()),
            ],
        )
        .await?;
    response.write_all(message.as_bytes()).await
}

async fn reject<W: AsyncWrite + Unpin>(
    mut response: TrackedResponse<W>,
    status: u16,
    message: &str,
) -> io::Result<u16> {
    send_error(&mut response, status, message).await?;
    response.end().await?;
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_of_absolute_url() {
        let origin = origin_of(&RequestHead::new("GET", "http://example.com:8080/a/b?c=d")).unwrap();
        assert_eq!(origin.target.host, "example.com");
        assert_eq!(origin.target.port, 8080);
        assert_eq!(origin.host, "example.com:8080");
        assert_eq!(origin.path, "/a/b?c=d");

        let bare = origin_of(&RequestHead::new("GET", "http://example.com")).unwrap();
        assert_eq!(bare.target.port, 80);
        assert_eq!(bare.path, "/");
    }

    #[test]
    fn test_origin_of_rejects_other_forms() {
        assert!(origin_of(&RequestHead::new("GET", "/relative")).is_none());
        assert!(origin_of(&RequestHead::new("GET", "https://example.com/")).is_none());
        assert!(origin_of(&RequestHead::new("GET", "ftp://example.com/")).is_none());
    }

    #[test]
    fn test_origin_headers_strip_hop_by_hop() {
        let request = RequestHead::new("GET", "http://example.com/")
            .with_header("Accept", "*/*")
            .with_header("Proxy-Connection", "keep-alive")
            .with_header("Proxy-Authorization", "Basic Zm9vOmJhcg==")
            .with_header("Connection", "keep-alive");
        let headers = origin_headers(&request, "example.com");
        assert_eq!(
            headers,
            vec![
                ("Host".to_string(), "example.com".to_string()),
                ("Accept".to_string(), "*/*".to_string()),
                ("Connection".to_string(), "close".to_string()),
            ]
        );
    }

    #[test]
    fn test_origin_headers_keep_client_host() {
        let request = RequestHead::new("GET", "http://example.com/").with_header("Host", "other.test");
        let headers = origin_headers(&request, "example.com");
        assert_eq!(headers[0], ("Host".to_string(), "other.test".to_string()));
        assert_eq!(headers.len(), 2);
    }
}
