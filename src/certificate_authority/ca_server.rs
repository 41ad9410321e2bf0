//! # CA Server
//!
//! This module provides a server for the Certificate Authority (CA) that listens for requests
//! on a Unix socket and runs them through the [`Issuer`].
//!
//! Every request must be wrapped in an [`AuthenticatedRequest`] envelope that
//! carries a bearer token and a monotonic counter. The server verifies the token
//! using constant-time comparison and rejects any counter value that is not
//! strictly greater than the previously accepted one.
//!
//! Each connection is served on its own task and must complete within
//! [`CONNECTION_TIMEOUT`].
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use log::{debug, error, info, warn};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;
use zeroize::Zeroizing;

use super::{AuthenticatedRequest, CaRequest, CaResponse, MAX_MESSAGE_SIZE};
use crate::issuance::Issuer;

/// Time a peer has to send its request and receive the response.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Returned when the token is valid but the counter was already used.
pub const STALE_COUNTER: &str = "stale request counter";

/// A server for the Certificate Authority.
///
/// Cloning is cheap; clones share the issuer and the counter state.
#[derive(Clone)]
pub struct CaServer {
    socket_path: String,
    issuer: Arc<Issuer>,
    /// Shared secret token used to authenticate IPC requests.
    auth_token: Arc<Zeroizing<String>>,
    /// The last accepted monotonic counter value.
    last_counter: Arc<AtomicU64>,
    /// How often the replay guard drops expired records.
    sweep_interval: Duration,
}

impl CaServer {
    /// Creates a new `CaServer`.
    ///
    /// # Arguments
    ///
    /// * `socket_path` - The path to the Unix socket to listen on.
    /// * `issuer` - The issuance pipeline requests are run through.
    /// * `auth_token` - The shared secret token for authenticating IPC requests.
    /// * `sweep_interval` - How often to sweep the replay guard.
    pub fn new(
        socket_path: String,
        issuer: Issuer,
        auth_token: Zeroizing<String>,
        sweep_interval: Duration,
    ) -> Self {
        CaServer {
            socket_path,
            issuer: Arc::new(issuer),
            auth_token: Arc::new(auth_token),
            last_counter: Arc::new(AtomicU64::new(0)),
            sweep_interval,
        }
    }

    /// Runs the CA server.
    ///
    /// Binds the Unix socket and spawns one task per accepted connection.
    /// The replay guard is swept on the configured interval.
    pub async fn run(&self) -> Result<()> {
        if self.sweep_interval.is_zero() {
            bail!("sweep interval must be greater than zero");
        }
        // Clean up old socket if it exists
        if fs::metadata(&self.socket_path).is_ok() {
            fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        // only the service user may connect
        fs::set_permissions(&self.socket_path, fs::Permissions::from_mode(0o600))?;
        let server_uid = nix::unistd::getuid();
        info!("CA server listening on {}", self.socket_path);

        let mut sweep = tokio::time::interval(self.sweep_interval);
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        debug!("New connection to CA server");
                        if peer_is_service_user(&stream, server_uid) {
                            let server = self.clone();
                            tokio::spawn(async move {
                                match timeout(CONNECTION_TIMEOUT, server.handle_connection(stream)).await {
                                    Ok(Ok(())) => {}
                                    Ok(Err(e)) => error!("CA connection failed: {}", e),
                                    Err(_) => warn!("CA connection timed out after {:?}", CONNECTION_TIMEOUT),
                                }
                            });
                        }
                    }
                    Err(e) => error!("connection failed: {:?}", e),
                },
                _ = sweep.tick() => {
                    self.issuer.replay_guard().sweep();
                }
            }
        }
    }

    /// Reads one length-prefixed request from `stream` and writes the response.
    async fn handle_connection(&self, mut stream: UnixStream) -> Result<()> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let msg_len = u32::from_be_bytes(len_buf);
        if msg_len > MAX_MESSAGE_SIZE {
            bail!(
                "message size {} exceeds maximum {}",
                msg_len,
                MAX_MESSAGE_SIZE
            );
        }
        let mut buf = vec![0u8; msg_len as usize];
        stream.read_exact(&mut buf).await?;
        let request_json = String::from_utf8(buf)?;
        debug!("got request (length={})", request_json.len());

        let response = self.process(&request_json);

        let response_json = serde_json::to_string(&response)?;
        let response_bytes = response_json.as_bytes();
        let response_len = response_bytes.len() as u32;
        stream.write_all(&response_len.to_be_bytes()).await?;
        stream.write_all(response_bytes).await?;
        Ok(())
    }

    /// Authenticates a raw request envelope and dispatches it.
    pub fn process(&self, request_json: &str) -> CaResponse {
        let auth_req = match serde_json::from_str::<AuthenticatedRequest>(request_json) {
            Ok(auth_req) => auth_req,
            Err(e) => {
                error!("Failed to deserialize request: {}", e);
                return CaResponse::Error(format!("Invalid request format: {}", e));
            }
        };

        let token_valid: bool = auth_req
            .token
            .as_bytes()
            .ct_eq(self.auth_token.as_bytes())
            .into();
        if !token_valid {
            error!("Rejected CA request: invalid authentication token");
            return CaResponse::Error("authentication failed".to_string());
        }
        let counter = auth_req.counter;
        if let Err(last) = self
            .last_counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                (counter > last).then_some(counter)
            })
        {
            warn!(
                "Rejected CA request: counter {} is not greater than last accepted {}",
                counter, last
            );
            return CaResponse::Error(STALE_COUNTER.to_string());
        }
        self.handle_request(auth_req.request)
    }

    /// Dispatches a [`CaRequest`] to the issuer and returns the resulting [`CaResponse`].
    pub fn handle_request(&self, request: CaRequest) -> CaResponse {
        match request {
            CaRequest::IssueCertificate(request) => {
                debug!("issuing user certificate");
                CaResponse::from_issuance(self.issuer.issue(&request))
            }
        }
    }
}

/// Verifies the connecting process belongs to the same user as the server
/// (`SO_PEERCRED`).
fn peer_is_service_user(stream: &UnixStream, server_uid: nix::unistd::Uid) -> bool {
    match stream.peer_cred() {
        Ok(cred) if cred.uid() == server_uid.as_raw() => true,
        Ok(cred) => {
            error!(
                "Rejected CA connection from UID {}, expected {}",
                cred.uid(),
                server_uid
            );
            false
        }
        Err(e) => {
            error!("Failed to get peer credentials: {}", e);
            false
        }
    }
}
