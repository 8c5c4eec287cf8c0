//! Session tokens for the controller connection.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tonic::async_trait;
use tracing::debug;

use super::{ControllerError, ControllerResult};

/// Source of the token sent in the session auth header.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Obtain a fresh session token. Called before every connection attempt
    /// that follows an `Unauthenticated` rejection.
    async fn fresh_token(&self) -> ControllerResult<Option<String>>;
}

/// No token at all, for services without controller auth.
pub struct NoToken;

#[async_trait]
impl TokenSource for NoToken {
    async fn fresh_token(&self) -> ControllerResult<Option<String>> {
        Ok(None)
    }
}

/// A fixed token.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn fresh_token(&self) -> ControllerResult<Option<String>> {
        Ok(Some(self.0.clone()))
    }
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
struct RefreshPayload {
    token: String,
}

/// Exchanges a long-lived refresh token for a session token over HTTP.
pub struct HttpTokenSource {
    client: Client,
    url: String,
    refresh_token: String,
}

impl HttpTokenSource {
    /// `base_url` is the service root, `refresh_path` the exchange endpoint.
    pub fn new(
        base_url: &str,
        refresh_path: &str,
        refresh_token: impl Into<String>,
    ) -> ControllerResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|err| ControllerError::Token(err.to_string()))?;
        Ok(Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), refresh_path),
            refresh_token: refresh_token.into(),
        })
    }
}

#[async_trait]
impl TokenSource for HttpTokenSource {
    async fn fresh_token(&self) -> ControllerResult<Option<String>> {
        let response = self
            .client
            .post(&self.url)
            .json(&RefreshRequest {
                refresh_token: &self.refresh_token,
            })
            .send()
            .await
            .map_err(|err| ControllerError::Token(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ControllerError::Token(format!(
                "token refresh returned {}",
                response.status()
            )));
        }
        let payload = response
            .json::<RefreshPayload>()
            .await
            .map_err(|err| ControllerError::Token(err.to_string()))?;
        debug!(url = %self.url, "session token refreshed");
        Ok(Some(payload.token))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    // Accept one request, answer with `body`, and return the raw request.
    async fn serve_once(listener: TcpListener, body: &'static str) -> String {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut request = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let read = socket.read(&mut chunk).await.expect("read");
            if read == 0 {
                break;
            }
            request.extend_from_slice(&chunk[..read]);
            let text = String::from_utf8_lossy(&request);
            if let Some(split) = text.find("\r\n\r\n") {
                let length = text[..split]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if request.len() >= split + 4 + length {
                    break;
                }
            }
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        socket
            .write_all(response.as_bytes())
            .await
            .expect("write");
        String::from_utf8_lossy(&request).into_owned()
    }

    #[tokio::test]
    async fn test_refresh_token_sent_in_body_not_url() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let base = format!("http://{}", listener.local_addr().expect("addr"));
        let server = tokio::spawn(serve_once(listener, r#"{"token":"session-1"}"#));

        let source = HttpTokenSource::new(&base, "/api/auth/jwt/refresh_token", "long-lived")
            .expect("source");
        let token = source.fresh_token().await.expect("refresh");
        assert_eq!(token.as_deref(), Some("session-1"));

        let request = server.await.expect("server");
        let request_line = request.lines().next().expect("request line");
        assert!(request_line.starts_with("POST /api/auth/jwt/refresh_token "));
        assert!(!request_line.contains("long-lived"));
        assert!(request.ends_with(r#"{"refresh_token":"long-lived"}"#));
    }
}
