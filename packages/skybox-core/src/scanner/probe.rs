//! Single-address reachability probe.
//!
//! A probe is a TCP connect bounded by a timeout. Whether an established
//! connection counts as "an adb device" is decided by a [`TargetPolicy`];
//! the default policy accepts anything that connects.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;

/// Default adb-over-TCP port on the boxes.
pub const ADB_PORT: u16 = 5555;

/// Per-probe timeout used when sweeping a whole subnet.
pub const BULK_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Timeout for a single deliberate connection check.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Why a probe did not find a device.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ProbeFailure {
    #[error("connection timed out")]
    TimedOut,

    #[error("connection refused")]
    Refused,

    #[error("host or network unreachable")]
    Unreachable,

    #[error("connected, but the service was not recognised")]
    NotTarget,

    #[error("{0}")]
    Io(String),
}

impl From<std::io::Error> for ProbeFailure {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            ErrorKind::ConnectionRefused => ProbeFailure::Refused,
            ErrorKind::TimedOut => ProbeFailure::TimedOut,
            ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable => {
                ProbeFailure::Unreachable
            }
            _ => ProbeFailure::Io(e.to_string()),
        }
    }
}

/// Outcome of one probe. Built once by [`DeviceProbe::probe`] and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    address: SocketAddrV4,
    reachable: bool,
    latency_ms: f64,
    error: Option<ProbeFailure>,
}

impl ProbeResult {
    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }

    pub fn reachable(&self) -> bool {
        self.reachable
    }

    /// Time spent on the attempt, success or not.
    pub fn latency_ms(&self) -> f64 {
        self.latency_ms
    }

    pub fn error(&self) -> Option<&ProbeFailure> {
        self.error.as_ref()
    }
}

/// Decides whether an established connection belongs to a target device.
///
/// Implementations may talk to the peer (e.g. an adb `CNXN` exchange) but must
/// not hold on to the stream; it is closed as soon as `identify` returns.
pub trait TargetPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn identify<'a>(&'a self, stream: &'a mut TcpStream) -> BoxFuture<'a, bool>;
}

/// Treats every host that accepts the TCP connection as a target.
///
/// A closed port, an absent host and a different service on the adb port are
/// not told apart beyond what the connect error says.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeConnectableIsTarget;

impl TargetPolicy for AssumeConnectableIsTarget {
    fn name(&self) -> &'static str {
        "assume-connectable-is-target"
    }

    fn identify<'a>(&'a self, _stream: &'a mut TcpStream) -> BoxFuture<'a, bool> {
        Box::pin(futures::future::ready(true))
    }
}

/// Bounded-timeout reachability check against one `ip:port`.
#[derive(Clone)]
pub struct DeviceProbe {
    timeout: Duration,
    policy: Arc<dyn TargetPolicy>,
}

impl DeviceProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            policy: Arc::new(AssumeConnectableIsTarget),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn TargetPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Probe `address`. Never fails: every error ends up in the result.
    ///
    /// The timeout covers both the connect and the policy check. The stream
    /// is dropped before returning on every path, including the timeout one
    /// (the in-flight future is dropped with it).
    pub async fn probe(&self, address: SocketAddrV4) -> ProbeResult {
        let start = Instant::now();

        let outcome = match tokio::time::timeout(self.timeout, self.connect_and_identify(address))
            .await
        {
            Ok(inner) => inner,
            Err(_elapsed) => Err(ProbeFailure::TimedOut),
        };

        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        match outcome {
            Ok(()) => {
                tracing::debug!("{} accepted connection in {:.1}ms", address, latency_ms);
                ProbeResult {
                    address,
                    reachable: true,
                    latency_ms,
                    error: None,
                }
            }
            Err(e) => {
                tracing::trace!("{} not reachable: {}", address, e);
                ProbeResult {
                    address,
                    reachable: false,
                    latency_ms,
                    error: Some(e),
                }
            }
        }
    }

    async fn connect_and_identify(&self, address: SocketAddrV4) -> Result<(), ProbeFailure> {
        let mut stream = TcpStream::connect(address).await?;
        let accepted = self.policy.identify(&mut stream).await;
        drop(stream);
        if accepted {
            Ok(())
        } else {
            Err(ProbeFailure::NotTarget)
        }
    }
}

/// Probe `ip:port` once with the default policy.
pub async fn probe(ip: Ipv4Addr, port: u16, timeout: Duration) -> ProbeResult {
    DeviceProbe::new(timeout)
        .probe(SocketAddrV4::new(ip, port))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    struct RejectAll;

    impl TargetPolicy for RejectAll {
        fn name(&self) -> &'static str {
            "reject-all"
        }

        fn identify<'a>(&'a self, _stream: &'a mut TcpStream) -> BoxFuture<'a, bool> {
            Box::pin(async { false })
        }
    }

    struct Stall;

    impl TargetPolicy for Stall {
        fn name(&self) -> &'static str {
            "stall"
        }

        fn identify<'a>(&'a self, _stream: &'a mut TcpStream) -> BoxFuture<'a, bool> {
            Box::pin(futures::future::pending())
        }
    }

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn test_open_port_is_reachable() {
        let (_listener, port) = listener().await;
        assert_eq!(
            DeviceProbe::new(BULK_PROBE_TIMEOUT).policy_name(),
            "assume-connectable-is-target"
        );
        let result = probe(Ipv4Addr::LOCALHOST, port, CONNECT_TIMEOUT).await;
        assert!(result.reachable());
        assert_eq!(result.error(), None);
        assert_eq!(result.address(), SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
    }

    #[tokio::test]
    async fn test_closed_port_is_refused() {
        let (listener, port) = listener().await;
        drop(listener);
        let result = probe(Ipv4Addr::LOCALHOST, port, CONNECT_TIMEOUT).await;
        assert!(!result.reachable());
        assert_eq!(result.error(), Some(&ProbeFailure::Refused));
    }

    #[tokio::test]
    async fn test_policy_rejection() {
        let (_listener, port) = listener().await;
        let probe = DeviceProbe::new(CONNECT_TIMEOUT).with_policy(Arc::new(RejectAll));
        assert_eq!(probe.policy_name(), "reject-all");
        assert_eq!(probe.timeout(), CONNECT_TIMEOUT);
        let result = probe
            .probe(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
            .await;
        assert!(!result.reachable());
        assert_eq!(result.error(), Some(&ProbeFailure::NotTarget));
    }

    #[tokio::test]
    async fn test_timeout_covers_policy() {
        let (_listener, port) = listener().await;
        let probe = DeviceProbe::new(Duration::from_millis(100)).with_policy(Arc::new(Stall));
        let result = probe
            .probe(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
            .await;
        assert_eq!(result.error(), Some(&ProbeFailure::TimedOut));
        assert!(result.latency_ms() >= 100.0);
    }

    #[test]
    fn test_io_error_classification() {
        let refused = std::io::Error::from(ErrorKind::ConnectionRefused);
        assert_eq!(ProbeFailure::from(refused), ProbeFailure::Refused);
        let unreachable = std::io::Error::from(ErrorKind::HostUnreachable);
        assert_eq!(ProbeFailure::from(unreachable), ProbeFailure::Unreachable);
        let other = std::io::Error::new(ErrorKind::Other, "boom");
        assert_eq!(ProbeFailure::from(other), ProbeFailure::Io("boom".to_string()));
    }
}
