//! Forwarded tunnels from a local port to a database pod.
//!
//! A [`TunnelHandle`] owns the forwarding session. It is closed exactly once,
//! either explicitly through [`TunnelHandle::close`] or implicitly when it is
//! dropped, so an early return on an error path cannot leak a forwarder.

use crate::client::{ClusterClient, ForwardSession};
use crate::config::{ForwardPort, RetryPolicy};
use crate::error::CollectorError;
use crate::models::InstanceId;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

/// Address every tunnel listens on.
pub const LOCAL_HOST: &str = "127.0.0.1";

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// An open tunnel to one instance.
#[derive(Debug)]
pub struct TunnelHandle {
    instance: InstanceId,
    local_port: u16,
    remote_port: u16,
    session: Option<ForwardSession>,
    // Held for the lifetime of a tunnel on a fixed port
    _port_guard: Option<OwnedMutexGuard<()>>,
}

impl TunnelHandle {
    /// The pod this tunnel reaches.
    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    /// Port on [`LOCAL_HOST`] that summary tools connect to.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Database port inside the pod.
    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Whether [`TunnelHandle::close`] has not run yet.
    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Tears the session down. Closing an already closed handle does nothing.
    pub async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.shutdown().await;
            tracing::debug!(
                "Closed tunnel {}:{} -> {}:{}",
                LOCAL_HOST,
                self.local_port,
                self.instance,
                self.remote_port
            );
        }
        self._port_guard = None;
    }
}

/// Opens tunnels according to the run's port and retry settings.
pub struct TunnelManager {
    client: Arc<dyn ClusterClient>,
    forward_port: ForwardPort,
    startup_timeout: Duration,
    retry: RetryPolicy,
    fixed_port: Arc<Mutex<()>>,
}

impl TunnelManager {
    /// Creates a manager with no retries.
    ///
    /// # Arguments
    /// * `client` - Cluster client that starts the forwarding sessions
    /// * `forward_port` - Local port policy for every tunnel
    /// * `startup_timeout` - How long a tunnel may take to become ready
    pub fn new(
        client: Arc<dyn ClusterClient>,
        forward_port: ForwardPort,
        startup_timeout: Duration,
    ) -> Self {
        Self {
            client,
            forward_port,
            startup_timeout,
            retry: RetryPolicy::default(),
            fixed_port: Arc::new(Mutex::new(())),
        }
    }

    /// Builder method to retry failed tunnel starts.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Opens a tunnel and waits until the local end accepts connections.
    ///
    /// # Errors
    /// Returns `Tunnel` when the port hint is unusable, a fixed port is
    /// already taken, the forwarder exits early, or it is not ready within
    /// the startup timeout.
    pub async fn open(&self, namespace: &str, pod: &str, remote_port: u16) -> Result<TunnelHandle> {
        let instance = InstanceId::new(namespace, pod);

        if let ForwardPort::Invalid(raw) = &self.forward_port {
            return Err(CollectorError::tunnel(format!(
                "{}: invalid forward port '{}'",
                instance, raw
            )));
        }

        let attempts = self.retry.max_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            let delay = self.retry.delay_before(attempt);
            if !delay.is_zero() {
                tracing::debug!("Retrying tunnel to {} in {:?}", instance, delay);
                tokio::time::sleep(delay).await;
            }
            match self.open_once(&instance, remote_port).await {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    tracing::warn!(
                        "Tunnel to {} failed (attempt {}/{}): {}",
                        instance,
                        attempt,
                        attempts,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| CollectorError::tunnel(format!("{}: no attempt made", instance))))
    }

    /// Releases a tunnel. Closing an already closed handle does nothing.
    pub async fn close(&self, handle: &mut TunnelHandle) {
        handle.close().await;
    }

    async fn open_once(&self, instance: &InstanceId, remote_port: u16) -> Result<TunnelHandle> {
        let (local_port, port_guard) = match &self.forward_port {
            ForwardPort::Fixed(port) => {
                let guard = Arc::clone(&self.fixed_port).lock_owned().await;
                ensure_port_free(*port)
                    .await
                    .map_err(|e| CollectorError::tunnel(format!("{}: {}", instance, e)))?;
                (*port, Some(guard))
            }
            _ => (allocate_port().await?, None),
        };

        let mut session = self
            .client
            .port_forward(&instance.namespace, &instance.pod, local_port, remote_port)
            .await?;

        if let Err(e) = wait_ready(&mut session, local_port, self.startup_timeout).await {
            session.shutdown().await;
            return Err(CollectorError::tunnel(format!("{}: {}", instance, e)));
        }

        tracing::debug!(
            "Tunnel {}:{} -> {}:{} ready",
            LOCAL_HOST,
            local_port,
            instance,
            remote_port
        );
        Ok(TunnelHandle {
            instance: instance.clone(),
            local_port,
            remote_port,
            session: Some(session),
            _port_guard: port_guard,
        })
    }
}

/// Picks an unused local port by binding port 0 and releasing it.
pub async fn allocate_port() -> Result<u16> {
    let listener = TcpListener::bind((LOCAL_HOST, 0))
        .await
        .map_err(|e| CollectorError::tunnel(format!("cannot allocate a local port: {}", e)))?;
    let port = listener
        .local_addr()
        .map_err(|e| CollectorError::tunnel(format!("cannot read allocated port: {}", e)))?
        .port();
    Ok(port)
}

/// Fails when something else already listens on `port`.
///
/// Without this a forwarder that cannot bind would leave the port answered
/// by an unrelated process.
async fn ensure_port_free(port: u16) -> std::result::Result<(), String> {
    TcpListener::bind((LOCAL_HOST, port))
        .await
        .map(drop)
        .map_err(|e| format!("local port {}:{} is not available: {}", LOCAL_HOST, port, e))
}

async fn accepts_connections(port: u16) -> bool {
    let probe = tokio::time::timeout(CONNECT_PROBE_TIMEOUT, TcpStream::connect((LOCAL_HOST, port)))
        .await;
    matches!(probe, Ok(Ok(_)))
}

/// Waits until the session is ready to carry traffic.
///
/// A forwarder that announces its listener is ready once it says so. Other
/// sessions are ready once the local port accepts a connection. Either way
/// the session must still be running afterwards.
async fn wait_ready(
    session: &mut ForwardSession,
    local_port: u16,
    startup_timeout: Duration,
) -> std::result::Result<(), String> {
    let deadline = Instant::now() + startup_timeout;
    loop {
        if let Some(reason) = session.exit_reason().await {
            return Err(reason);
        }
        let ready = match session.announced_ready() {
            Some(announced) => announced,
            None => accepts_connections(local_port).await,
        };
        if ready {
            if let Some(reason) = session.exit_reason().await {
                return Err(reason);
            }
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(format!(
                "{}:{} not ready after {:?}",
                LOCAL_HOST, local_port, startup_timeout
            ));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
