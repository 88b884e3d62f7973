use color_eyre::{eyre::eyre, Result};
use reqwest::header::{CACHE_CONTROL, PRAGMA};
use std::future::Future;
use tracing::debug;

use super::types::{CacheMode, Request, Response};

/// Outbound network used by the interceptor.
///
/// `send` resolves to whatever response the server produced, whatever its
/// status, and fails only when no response could be obtained at all.
pub trait Network: Send + Sync {
  fn send(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}

/// HTTP network backed by reqwest
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    Self::from_builder(Self::client_builder())
  }

  /// Network that ignores proxy settings, for talking to local test servers.
  #[cfg(test)]
  pub(crate) fn direct() -> Result<Self> {
    Self::from_builder(Self::client_builder().no_proxy())
  }

  /// Redirects come back to the caller as-is instead of being followed.
  fn client_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder().redirect(reqwest::redirect::Policy::none())
  }

  fn from_builder(builder: reqwest::ClientBuilder) -> Result<Self> {
    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Network for HttpNetwork {
  fn send(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send {
    let prepared = self.prepare(request);
    let url = request.url.clone();

    async move {
      let response = prepared?
        .send()
        .await
        .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?;

      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| match value.to_str() {
          Ok(v) => Some((name.as_str().to_string(), v.to_string())),
          Err(_) => {
            debug!(url = %url, header = %name, "Dropping non-text header value");
            None
          }
        })
        .collect();

      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read body of {}: {}", url, e))?
        .to_vec();

      Ok(Response {
        status,
        headers,
        body,
      })
    }
  }
}

impl HttpNetwork {
  fn prepare(&self, request: &Request) -> Result<reqwest::RequestBuilder> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid request method '{}': {}", request.method, e))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }

    if request.cache == CacheMode::Reload {
      builder = builder
        .header(CACHE_CONTROL, "no-cache")
        .header(PRAGMA, "no-cache");
    }

    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    Ok(builder)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;
  use url::Url;

  /// Serve one canned HTTP response and hand back the raw request head.
  async fn serve_once(
    reply: impl AsRef<[u8]> + Send + 'static,
  ) -> (Url, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut head = Vec::new();
      let mut buf = [0u8; 1024];
      while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
          break;
        }
        head.extend_from_slice(&buf[..n]);
      }
      socket.write_all(reply.as_ref()).await.unwrap();
      socket.shutdown().await.ok();
      String::from_utf8_lossy(&head).to_lowercase()
    });

    let url = Url::parse(&format!("http://{}/vr", addr)).unwrap();
    (url, handle)
  }

  #[tokio::test]
  async fn test_send_returns_status_headers_and_body() {
    let (url, server) = serve_once(
      "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: 6\r\nconnection: close\r\n\r\n<html>",
    )
    .await;

    let network = HttpNetwork::direct().unwrap();
    let response = network.send(&Request::get(url)).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.header("Content-Type"), Some("text/html"));
    assert_eq!(response.body, b"<html>");

    let head = server.await.unwrap();
    assert!(head.starts_with("get /vr "));
    assert!(!head.contains("pragma: no-cache"));
  }

  #[tokio::test]
  async fn test_reload_mode_bypasses_caches() {
    let (url, server) =
      serve_once("HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n").await;

    let network = HttpNetwork::direct().unwrap();
    let request = Request::get(url).with_cache_mode(CacheMode::Reload);
    network.send(&request).await.unwrap();

    let head = server.await.unwrap();
    assert!(head.contains("cache-control: no-cache"));
    assert!(head.contains("pragma: no-cache"));
  }

  #[tokio::test]
  async fn test_error_status_is_not_a_failure() {
    let (url, _server) = serve_once(
      "HTTP/1.1 404 Not Found\r\ncontent-length: 9\r\nconnection: close\r\n\r\nnot found",
    )
    .await;

    let network = HttpNetwork::direct().unwrap();
    let response = network.send(&Request::get(url)).await.unwrap();
    assert_eq!(response.status, 404);
    assert_eq!(response.text(), "not found");
  }

  #[tokio::test]
  async fn test_unreachable_host_fails() {
    // Bind then drop to get a port nothing listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let network = HttpNetwork::direct().unwrap();
    let url = Url::parse(&format!("http://{}/vr", addr)).unwrap();
    assert!(network.send(&Request::get(url)).await.is_err());
  }

  #[tokio::test]
  async fn test_redirect_is_returned_not_followed() {
    let (url, server) = serve_once(
      "HTTP/1.1 301 Moved Permanently\r\nlocation: /new\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
    )
    .await;

    let network = HttpNetwork::direct().unwrap();
    let response = network.send(&Request::get(url)).await.unwrap();

    assert_eq!(response.status, 301);
    assert_eq!(response.header("Location"), Some("/new"));
    server.await.unwrap();
  }

  #[tokio::test]
  async fn test_non_text_header_is_dropped() {
    let mut reply = b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nx-title: caf".to_vec();
    reply.push(0xE9);
    reply.extend_from_slice(b"\r\nconnection: close\r\n\r\nok");
    let (url, _server) = serve_once(reply).await;

    let network = HttpNetwork::direct().unwrap();
    let response = network.send(&Request::get(url)).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.header("x-title"), None);
    assert_eq!(response.header("content-length"), Some("2"));
    assert_eq!(response.text(), "ok");
  }
}
