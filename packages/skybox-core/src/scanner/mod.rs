//! LAN discovery of adb-enabled boxes.
//!
//! A sweep probes `a.b.c.N` on the adb port for every `N` in a range of the
//! local /24, one concurrent probe per address. Results are reported as they
//! arrive through a [`ScanEvent`] callback, and a single `Finished` event closes
//! each session once every probe has resolved.

pub mod arp;
mod probe;
mod subnet;

pub use probe::{
    probe, AssumeConnectableIsTarget, DeviceProbe, ProbeFailure, ProbeResult, TargetPolicy,
    ADB_PORT, BULK_PROBE_TIMEOUT, CONNECT_TIMEOUT,
};
pub use subnet::{candidates, local_ipv4, subnet_of};

use subnet::usable_local;

use anyhow::{Context, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Create a Command that hides the console window on Windows.
#[cfg(target_os = "windows")]
pub(crate) fn hidden_command_sync(program: &str) -> Command {
    use std::os::windows::process::CommandExt;
    let mut cmd = Command::new(program);
    cmd.creation_flags(CREATE_NO_WINDOW);
    cmd
}

#[cfg(not(target_os = "windows"))]
pub(crate) fn hidden_command_sync(program: &str) -> Command {
    Command::new(program)
}

/// Operator-facing conditions raised by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ScanError {
    #[error("A scan is already running")]
    AlreadyScanning,

    #[error("Cannot determine the local subnet: {0}")]
    SubnetUnresolvable(String),
}

/// Knobs for a sweep. The octet range is given per call to `start_scan`.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub port: u16,
    pub probe_timeout: Duration,
    /// Upper bound on probes in flight at once.
    pub max_concurrency: usize,
    /// Overall watchdog for a sweep; derived from the candidate count when unset.
    pub deadline: Option<Duration>,
    /// Skip local address discovery and sweep this address's /24.
    pub local_ip: Option<Ipv4Addr>,
    /// Local address discovery used when `local_ip` is unset.
    pub discover_local: fn() -> Ipv4Addr,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            port: ADB_PORT,
            probe_timeout: BULK_PROBE_TIMEOUT,
            max_concurrency: 256,
            deadline: None,
            local_ip: None,
            discover_local: local_ipv4,
        }
    }
}

impl ScanOptions {
    const DEADLINE_SLACK: Duration = Duration::from_secs(2);

    /// Probes run in waves of `max_concurrency`, each wave bounded by the
    /// probe timeout.
    pub fn deadline_for(&self, candidates: usize) -> Duration {
        if let Some(deadline) = self.deadline {
            return deadline;
        }
        let waves = candidates.div_ceil(self.max_concurrency.max(1)).max(1) as u32;
        self.probe_timeout * waves + Self::DEADLINE_SLACK
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanOutcome {
    /// Every candidate was probed.
    Completed,
    /// `cancel()` stopped dispatch; in-flight probes were allowed to finish.
    Cancelled,
    /// The watchdog fired and the stragglers were aborted.
    DeadlineExceeded,
    /// No usable local address, nothing was probed.
    SubnetUnresolvable,
}

/// Final summary of one session, delivered with `Finished` and by `ScanHandle::wait`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub local_ip: Option<Ipv4Addr>,
    pub subnet: Option<String>,
    /// Reachable devices in the order they were found.
    pub devices: Vec<ProbeResult>,
    pub candidates: usize,
    pub probed: usize,
    pub skipped: usize,
    pub elapsed_secs: f64,
    pub outcome: ScanOutcome,
}

impl ScanReport {
    pub fn addresses(&self) -> Vec<SocketAddrV4> {
        self.devices.iter().map(|d| d.address()).collect()
    }
}

/// Notifications emitted during a sweep.
///
/// `DeviceFound` events arrive in completion order. `Finished` is emitted
/// exactly once per started session, after all of its `DeviceFound` events.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    Started {
        subnet: Ipv4Network,
        candidates: usize,
    },
    DeviceFound(ProbeResult),
    Warning(ScanError),
    Finished(ScanReport),
}

/// Callback type for scan notifications
pub type EventCallback = Arc<dyn Fn(ScanEvent) + Send + Sync>;

/// Mutable state of one sweep. Owned by the session task; probe tasks hand
/// their results back instead of touching it.
#[derive(Debug)]
pub struct ScanSession {
    local_ip: Option<Ipv4Addr>,
    subnet: Option<Ipv4Network>,
    candidates: Vec<Ipv4Addr>,
    discovered: Vec<ProbeResult>,
    probed: usize,
    started: Instant,
}

impl ScanSession {
    pub fn new(local_ip: Ipv4Addr, start_octet: u8, end_octet: u8) -> Self {
        Self {
            local_ip: Some(local_ip),
            subnet: Some(subnet_of(local_ip)),
            candidates: candidates(local_ip, start_octet, end_octet),
            discovered: Vec::new(),
            probed: 0,
            started: Instant::now(),
        }
    }

    fn unresolved() -> Self {
        Self {
            local_ip: None,
            subnet: None,
            candidates: Vec::new(),
            discovered: Vec::new(),
            probed: 0,
            started: Instant::now(),
        }
    }

    pub fn candidates(&self) -> &[Ipv4Addr] {
        &self.candidates
    }

    pub fn discovered(&self) -> &[ProbeResult] {
        &self.discovered
    }

    /// Count a resolved probe. Returns true when it found a device.
    fn record(&mut self, result: &ProbeResult) -> bool {
        self.probed += 1;
        if result.reachable() {
            self.discovered.push(result.clone());
            true
        } else {
            false
        }
    }

    fn finish(self, outcome: ScanOutcome) -> ScanReport {
        ScanReport {
            local_ip: self.local_ip,
            subnet: self.subnet.map(|s| s.to_string()),
            candidates: self.candidates.len(),
            skipped: self.candidates.len().saturating_sub(self.probed),
            probed: self.probed,
            devices: self.discovered,
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            outcome,
        }
    }
}

/// Clears the running flag when the session task ends, however it ends.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Control over a running sweep.
pub struct ScanHandle {
    cancel: CancellationToken,
    task: JoinHandle<ScanReport>,
}

impl ScanHandle {
    /// Stop dispatching probes. Probes already connecting run to completion
    /// or timeout; `Finished` still follows.
    pub fn cancel(&self) {
        tracing::info!("Scan cancellation requested");
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the session to end and return its report.
    pub async fn wait(self) -> Result<ScanReport> {
        self.task.await.context("Scan task panicked")
    }
}

/// Sweeps the local /24 for hosts accepting connections on the adb port.
///
/// At most one session runs per scanner; `start_scan` while one is active
/// warns and does nothing.
pub struct NetworkScanner {
    options: ScanOptions,
    policy: Arc<dyn TargetPolicy>,
    running: Arc<AtomicBool>,
}

impl NetworkScanner {
    pub fn new(options: ScanOptions) -> Self {
        Self {
            options,
            policy: Arc::new(AssumeConnectableIsTarget),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn TargetPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    pub fn is_scanning(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start sweeping `prefix.start_octet ..= prefix.end_octet` in the background.
    ///
    /// Returns `None` (after a `Warning(AlreadyScanning)` event) when a session
    /// is already running. Must be called from within a tokio runtime.
    pub fn start_scan(
        &self,
        start_octet: u8,
        end_octet: u8,
        on_event: Option<EventCallback>,
    ) -> Option<ScanHandle> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!("{}", ScanError::AlreadyScanning);
            if let Some(callback) = &on_event {
                callback(ScanEvent::Warning(ScanError::AlreadyScanning));
            }
            return None;
        }

        let guard = RunningGuard(self.running.clone());
        let cancel = CancellationToken::new();
        let run = SessionRun {
            options: self.options.clone(),
            policy: self.policy.clone(),
            cancel: cancel.clone(),
            on_event,
        };
        let task = tokio::spawn(run.execute(start_octet, end_octet, guard));

        Some(ScanHandle { cancel, task })
    }
}

struct SessionRun {
    options: ScanOptions,
    policy: Arc<dyn TargetPolicy>,
    cancel: CancellationToken,
    on_event: Option<EventCallback>,
}

impl SessionRun {
    fn emit(&self, event: ScanEvent) {
        if let Some(callback) = &self.on_event {
            callback(event);
        }
    }

    /// Clear the running flag, then announce the end of the session.
    fn finish(&self, session: ScanSession, outcome: ScanOutcome, guard: RunningGuard) -> ScanReport {
        let report = session.finish(outcome);
        tracing::info!(
            "Scan finished ({:?}): {} devices found, {}/{} probed in {:.1}s",
            report.outcome,
            report.devices.len(),
            report.probed,
            report.candidates,
            report.elapsed_secs
        );
        drop(guard);
        self.emit(ScanEvent::Finished(report.clone()));
        report
    }

    async fn execute(self, start_octet: u8, end_octet: u8, guard: RunningGuard) -> ScanReport {
        let local_ip = match self.options.local_ip {
            Some(ip) => Ok(ip),
            None => usable_local((self.options.discover_local)()),
        };
        let local_ip = match local_ip {
            Ok(ip) => ip,
            Err(e) => {
                tracing::warn!("{}", e);
                self.emit(ScanEvent::Warning(e));
                return self.finish(
                    ScanSession::unresolved(),
                    ScanOutcome::SubnetUnresolvable,
                    guard,
                );
            }
        };

        let mut session = ScanSession::new(local_ip, start_octet, end_octet);
        let total = session.candidates().len();
        let subnet = subnet_of(local_ip);
        tracing::info!(
            "Scanning {} (.{}-.{}) port {}: {} candidates, policy {}",
            subnet,
            start_octet,
            end_octet,
            self.options.port,
            total,
            self.policy.name()
        );
        self.emit(ScanEvent::Started {
            subnet,
            candidates: total,
        });

        let probe = DeviceProbe::new(self.options.probe_timeout).with_policy(self.policy.clone());
        let limiter = Arc::new(Semaphore::new(self.options.max_concurrency.max(1)));
        let mut probes = JoinSet::new();

        for &ip in session.candidates() {
            if self.cancel.is_cancelled() {
                break;
            }
            let probe = probe.clone();
            let limiter = limiter.clone();
            let cancel = self.cancel.clone();
            let address = SocketAddrV4::new(ip, self.options.port);
            probes.spawn(async move {
                let _permit = limiter.acquire_owned().await.ok()?;
                if cancel.is_cancelled() {
                    return None;
                }
                Some(probe.probe(address).await)
            });
        }

        let deadline = tokio::time::Instant::now() + self.options.deadline_for(total);
        let mut timed_out = false;

        loop {
            match tokio::time::timeout_at(deadline, probes.join_next()).await {
                Ok(Some(joined)) => self.collect(&mut session, joined),
                Ok(None) => break,
                Err(_elapsed) => {
                    tracing::warn!(
                        "Scan deadline reached with {} probes outstanding, aborting them",
                        probes.len()
                    );
                    timed_out = true;
                    probes.abort_all();
                    // Reap every task so none outlives the session.
                    while let Some(joined) = probes.join_next().await {
                        self.collect(&mut session, joined);
                    }
                    break;
                }
            }
        }

        let outcome = if timed_out {
            ScanOutcome::DeadlineExceeded
        } else if self.cancel.is_cancelled() {
            ScanOutcome::Cancelled
        } else {
            ScanOutcome::Completed
        };
        self.finish(session, outcome, guard)
    }

    fn collect(
        &self,
        session: &mut ScanSession,
        joined: std::result::Result<Option<ProbeResult>, tokio::task::JoinError>,
    ) {
        match joined {
            Ok(Some(result)) => {
                if session.record(&result) {
                    tracing::info!("Found device at {}", result.address());
                    self.emit(ScanEvent::DeviceFound(result));
                }
            }
            // Skipped after cancellation.
            Ok(None) => {}
            Err(e) if e.is_cancelled() => {}
            Err(e) => tracing::warn!("Probe task failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_is_per_wave() {
        let options = ScanOptions {
            probe_timeout: Duration::from_millis(500),
            max_concurrency: 100,
            ..Default::default()
        };
        assert_eq!(options.deadline_for(0), Duration::from_millis(2500));
        assert_eq!(options.deadline_for(254), Duration::from_millis(3500));

        let fixed = ScanOptions {
            deadline: Some(Duration::from_secs(1)),
            ..options
        };
        assert_eq!(fixed.deadline_for(254), Duration::from_secs(1));
    }

    #[test]
    fn test_session_records_only_reachable() {
        let mut session = ScanSession::new(Ipv4Addr::new(10, 1, 2, 3), 1, 4);
        assert_eq!(session.candidates().len(), 3);

        let found = DeviceProbeFixture::reachable(Ipv4Addr::new(10, 1, 2, 1));
        let missed = DeviceProbeFixture::unreachable(Ipv4Addr::new(10, 1, 2, 2));
        assert!(session.record(&found));
        assert!(!session.record(&missed));
        assert_eq!(session.discovered().len(), 1);

        let report = session.finish(ScanOutcome::Cancelled);
        assert_eq!(report.probed, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.subnet.as_deref(), Some("10.1.2.0/24"));
        assert_eq!(report.addresses(), vec![SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 1), ADB_PORT)]);
    }

    #[test]
    fn test_report_json_shape() {
        let mut session = ScanSession::new(Ipv4Addr::new(10, 1, 2, 3), 1, 1);
        session.record(&DeviceProbeFixture::reachable(Ipv4Addr::new(10, 1, 2, 1)));
        let json = serde_json::to_value(session.finish(ScanOutcome::Completed)).unwrap();
        assert_eq!(json["outcome"], "completed");
        assert_eq!(json["devices"][0]["address"], "10.1.2.1:5555");
        assert_eq!(json["devices"][0]["reachable"], true);
        assert!(json["devices"][0]["error"].is_null());
    }

    /// Builds probe results without touching the network.
    struct DeviceProbeFixture;

    impl DeviceProbeFixture {
        fn reachable(ip: Ipv4Addr) -> ProbeResult {
            serde_json::from_value(serde_json::json!({
                "address": format!("{}:{}", ip, ADB_PORT),
                "reachable": true,
                "latencyMs": 1.5,
                "error": null,
            }))
            .unwrap()
        }

        fn unreachable(ip: Ipv4Addr) -> ProbeResult {
            serde_json::from_value(serde_json::json!({
                "address": format!("{}:{}", ip, ADB_PORT),
                "reachable": false,
                "latencyMs": 500.0,
                "error": { "kind": "timed_out" },
            }))
            .unwrap()
        }
    }
}
