//! # CA Client
//!
//! Talks to the [`CaServer`](super::ca_server::CaServer) over its Unix socket.
//! Each request is wrapped in an [`AuthenticatedRequest`] envelope carrying the
//! shared bearer token and the next value of a monotonic counter.
//!
//! The counter is stamped from the wall clock in nanoseconds, so clients that
//! come and go (one per `issue` invocation, one per bastion process) keep
//! advancing the server's high-water mark instead of starting over at one.
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Result, bail};
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use zeroize::Zeroizing;

use super::ca_server::STALE_COUNTER;
use super::{AuthenticatedRequest, CaRequest, CaResponse, MAX_MESSAGE_SIZE};
use crate::issuance::request::IssuanceRequest;

/// A client for the Certificate Authority.
#[derive(Clone)]
pub struct CaClient {
    socket_path: String,
    auth_token: Zeroizing<String>,
    /// Shared across all clones of this client.
    counter: Arc<AtomicU64>,
}

impl CaClient {
    /// Creates a new `CaClient`.
    ///
    /// # Arguments
    ///
    /// * `socket_path` - The path to the Unix socket of the CA server.
    /// * `auth_token` - The shared secret token for authenticating IPC requests.
    pub fn new(socket_path: String, auth_token: Zeroizing<String>) -> Self {
        CaClient {
            socket_path,
            auth_token,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Asks the CA server to issue a certificate for `request`.
    pub async fn issue(&self, request: IssuanceRequest) -> Result<CaResponse> {
        self.send_request(CaRequest::IssueCertificate(request)).await
    }

    /// Sends a request to the CA server and returns the response.
    ///
    /// A request that lost the counter race against another client is sent
    /// once more with a fresh counter.
    pub async fn send_request(&self, request: CaRequest) -> Result<CaResponse> {
        match self.send_once(request.clone()).await? {
            CaResponse::Error(message) if message == STALE_COUNTER => {
                debug!("counter was overtaken, retrying");
                self.send_once(request).await
            }
            response => Ok(response),
        }
    }

    /// Next counter value: the current time in nanoseconds, or one past the
    /// last value handed out if the clock has not moved on.
    fn next_counter(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        let previous = self
            .counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or_else(|last| last);
        now.max(previous.saturating_add(1))
    }

    async fn send_once(&self, request: CaRequest) -> Result<CaResponse> {
        debug!("connection to: {}", self.socket_path);
        let mut stream = UnixStream::connect(&self.socket_path).await?;

        let auth_request = AuthenticatedRequest {
            token: self.auth_token.to_string(),
            counter: self.next_counter(),
            request,
        };

        let request_json = Zeroizing::new(serde_json::to_string(&auth_request)?);
        let request_bytes = request_json.as_bytes();
        let request_len = request_bytes.len() as u32;
        if request_len > MAX_MESSAGE_SIZE {
            bail!(
                "Request size {} exceeds maximum allowed {}",
                request_len,
                MAX_MESSAGE_SIZE
            );
        }
        stream.write_all(&request_len.to_be_bytes()).await?;
        stream.write_all(request_bytes).await?;

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let response_len = u32::from_be_bytes(len_buf);
        if response_len > MAX_MESSAGE_SIZE {
            bail!(
                "Response size {} exceeds maximum allowed {}",
                response_len,
                MAX_MESSAGE_SIZE
            );
        }
        let mut response_buf = vec![0u8; response_len as usize];
        stream.read_exact(&mut response_buf).await?;
        let response: CaResponse = serde_json::from_slice(&response_buf)?;
        debug!("read response from: {}", self.socket_path);
        Ok(response)
    }
}
