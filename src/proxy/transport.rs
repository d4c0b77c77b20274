//! Proxy transport layer for HTTP and SOCKS protocols
//!
//! Opens raw tunnels through a candidate proxy and builds HTTP clients that
//! route through it.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};
use tracing::{debug, instrument};

use crate::error::{BoostError, Result};
use crate::models::{ProxyAddress, ProxyCredentials, ProxyProtocol};

/// Proxy transport handler
pub struct ProxyTransport;

impl ProxyTransport {
    /// Connect to a target through the specified proxy
    ///
    /// Credentials carried by the address are sent as `Proxy-Authorization`
    /// for HTTP proxies and as username/password auth for SOCKS5.
    #[instrument(skip(proxy), fields(proxy = %proxy, target = %target_host))]
    pub async fn connect(
        proxy: &ProxyAddress,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        let credentials = proxy.credentials.as_ref();
        match proxy.protocol {
            ProxyProtocol::Http | ProxyProtocol::Https => {
                Self::connect_http(proxy, credentials, target_host, target_port).await
            }
            ProxyProtocol::Socks4 => Self::connect_socks4(proxy, target_host, target_port).await,
            ProxyProtocol::Socks5 => {
                Self::connect_socks5(proxy, credentials, target_host, target_port).await
            }
        }
    }

    /// Connect through HTTP CONNECT method
    async fn connect_http(
        proxy: &ProxyAddress,
        credentials: Option<&ProxyCredentials>,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        debug!("Connecting to HTTP proxy at {}", proxy.authority());

        let mut stream = TcpStream::connect(proxy.authority())
            .await
            .map_err(|e| BoostError::ProxyConnectionFailed(format!("TCP connect failed: {}", e)))?;

        let connect_request = Self::build_connect_request(credentials, target_host, target_port);
        stream.write_all(connect_request.as_bytes()).await.map_err(|e| {
            BoostError::ProxyConnectionFailed(format!("Failed to send CONNECT: {}", e))
        })?;

        let mut response = vec![0u8; 1024];
        let n = stream.read(&mut response).await.map_err(|e| {
            BoostError::ProxyConnectionFailed(format!("Failed to read CONNECT response: {}", e))
        })?;

        let response_str = String::from_utf8_lossy(&response[..n]);
        if !Self::is_connect_established(&response_str) {
            return Err(BoostError::ProxyConnectionFailed(format!(
                "CONNECT failed: {}",
                response_str.lines().next().unwrap_or("empty response")
            )));
        }

        debug!("HTTP CONNECT tunnel established");
        Ok(stream)
    }

    fn is_connect_established(response: &str) -> bool {
        let mut status = response.split_whitespace();
        matches!(
            (status.next(), status.next()),
            (Some(version), Some(code)) if version.starts_with("HTTP/1.") && code.starts_with('2')
        )
    }

    /// Build HTTP CONNECT request
    fn build_connect_request(
        credentials: Option<&ProxyCredentials>,
        target_host: &str,
        target_port: u16,
    ) -> String {
        let mut request = format!(
            "CONNECT {}:{} HTTP/1.1\r\nHost: {}:{}\r\n",
            target_host, target_port, target_host, target_port
        );

        if let Some(creds) = credentials {
            let encoded = BASE64.encode(format!("{}:{}", creds.username, creds.password));
            request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", encoded));
        }

        request.push_str("\r\n");
        request
    }

    /// Connect through SOCKS4 proxy (hostnames go out as SOCKS4a)
    async fn connect_socks4(
        proxy: &ProxyAddress,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        debug!("Connecting to SOCKS4 proxy at {}", proxy.authority());

        let stream = Socks4Stream::connect(proxy.authority().as_str(), (target_host, target_port))
            .await
            .map_err(|e| {
                BoostError::ProxyConnectionFailed(format!("SOCKS4 connect failed: {}", e))
            })?;

        debug!("SOCKS4 connection established");
        Ok(stream.into_inner())
    }

    /// Connect through SOCKS5 proxy
    async fn connect_socks5(
        proxy: &ProxyAddress,
        credentials: Option<&ProxyCredentials>,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        debug!("Connecting to SOCKS5 proxy at {}", proxy.authority());

        let authority = proxy.authority();
        let target = (target_host, target_port);
        let stream = match credentials {
            Some(creds) => {
                Socks5Stream::connect_with_password(
                    authority.as_str(),
                    target,
                    &creds.username,
                    &creds.password,
                )
                .await
            }
            None => Socks5Stream::connect(authority.as_str(), target).await,
        }
        .map_err(|e| BoostError::ProxyConnectionFailed(format!("SOCKS5 connect failed: {}", e)))?;

        debug!("SOCKS5 connection established");
        Ok(stream.into_inner())
    }

    /// Parse host and port from a URL, defaulting the port by scheme
    pub fn parse_target(raw: &str) -> Result<(String, u16)> {
        let url = url::Url::parse(raw)?;
        let host = url
            .host_str()
            .ok_or_else(|| BoostError::InvalidRequest(format!("Missing host in {}", raw)))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| BoostError::InvalidRequest(format!("Missing port in {}", raw)))?;
        Ok((host, port))
    }

    /// Client builder routing every request through `proxy`
    pub fn client_builder(
        proxy: &ProxyAddress,
        timeout: Duration,
    ) -> Result<reqwest::ClientBuilder> {
        Ok(reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(proxy.url())?)
            .timeout(timeout)
            .connect_timeout(timeout)
            .danger_accept_invalid_certs(true))
    }

    /// HTTP client whose every request is routed through `proxy`
    pub fn http_client(
        proxy: &ProxyAddress,
        timeout: Duration,
        user_agent: &str,
    ) -> Result<reqwest::Client> {
        let client = Self::client_builder(proxy, timeout)?
            .user_agent(user_agent)
            .build()?;
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_build_connect_request() {
        let request = ProxyTransport::build_connect_request(None, "httpbin.org", 443);
        assert_eq!(
            request,
            "CONNECT httpbin.org:443 HTTP/1.1\r\nHost: httpbin.org:443\r\n\r\n"
        );

        let creds = ProxyCredentials {
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        let request = ProxyTransport::build_connect_request(Some(&creds), "example.com", 80);
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_connect_status_line() {
        assert!(ProxyTransport::is_connect_established(
            "HTTP/1.1 200 Connection established\r\n\r\n"
        ));
        assert!(ProxyTransport::is_connect_established("HTTP/1.0 200 OK\r\n"));
        assert!(!ProxyTransport::is_connect_established(
            "HTTP/1.1 407 Proxy Authentication Required\r\n"
        ));
        assert!(!ProxyTransport::is_connect_established(""));
    }

    #[test]
    fn test_parse_target() {
        assert_eq!(
            ProxyTransport::parse_target("http://httpbin.org/post").unwrap(),
            ("httpbin.org".to_string(), 80)
        );
        assert_eq!(
            ProxyTransport::parse_target("https://example.com:8443/x").unwrap(),
            ("example.com".to_string(), 8443)
        );
        assert!(ProxyTransport::parse_target("not a url").is_err());
    }

    #[tokio::test]
    async fn test_http_connect_through_local_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            socket
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            request
        });

        let proxy = ProxyAddress::new("127.0.0.1", port, ProxyProtocol::Http);
        ProxyTransport::connect(&proxy, "example.com", 443).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_http_connect_sends_address_credentials() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            socket
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            request
        });

        let proxy = ProxyAddress::parse(&format!("user:pass@127.0.0.1:{}", port)).unwrap();
        ProxyTransport::connect(&proxy, "example.com", 443).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[tokio::test]
    async fn test_http_connect_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").await;
        });

        let proxy = ProxyAddress::new("127.0.0.1", port, ProxyProtocol::Http);
        let err = ProxyTransport::connect(&proxy, "example.com", 443).await.unwrap_err();
        assert!(matches!(err, BoostError::ProxyConnectionFailed(_)));
    }
}
