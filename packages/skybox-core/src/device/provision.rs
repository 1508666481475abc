//! The end-to-end provisioning run for one box.

use super::{DeviceController, DeviceError};
use crate::scanner::arp::NeighborTable;
use crate::validate::{self, MacAddress, MacParseError};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Invalid IP address: {0:?}")]
    InvalidIp(String),

    #[error("Invalid MAC address {value:?}: {source}")]
    InvalidMac {
        value: String,
        #[source]
        source: MacParseError,
    },

    #[error("Serial head {head:?} plus MAC does not make a 32 digit hex serial")]
    InvalidSerial { head: String },

    #[error("Invalid PPPoE account {0:?}: expected 11 digits")]
    InvalidAccount(String),

    #[error("Cannot reach adb on {0}; is USB debugging enabled on the box?")]
    AdbUnavailable(SocketAddrV4),

    #[error("Box at {target} is not made by {expected}")]
    WrongManufacturer {
        target: SocketAddrV4,
        expected: String,
    },

    #[error("The box rejected the {0} command")]
    Rejected(&'static str),

    #[error("Box with MAC {0} did not reappear in the ARP table after the reset")]
    DeviceLost(MacAddress),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("ARP lookup failed: {0}")]
    Neighbor(String),
}

/// What to do after the MAC and serial are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionMode {
    /// Write the PPPoE account and reboot.
    Standard,
    /// Wipe a box that already carries an account, then dial it in again.
    FactoryReset,
}

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub ip: String,
    pub mac: String,
    pub account: String,
    pub mode: ProvisionMode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ProvisionStep {
    Validated,
    Online { target: SocketAddrV4 },
    ManufacturerChecked,
    MacWritten { mac: MacAddress },
    AccountWritten,
    Rebooted,
    FactoryReset,
    Relocated { from: Ipv4Addr, to: Ipv4Addr },
    AutoDialed { target: SocketAddrV4 },
}

impl std::fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisionStep::Validated => write!(f, "Input validated"),
            ProvisionStep::Online { target } => write!(f, "Connected to {}", target),
            ProvisionStep::ManufacturerChecked => write!(f, "Manufacturer verified"),
            ProvisionStep::MacWritten { mac } => write!(f, "MAC set to {}", mac),
            ProvisionStep::AccountWritten => write!(f, "PPPoE account written"),
            ProvisionStep::Rebooted => write!(f, "Reboot issued"),
            ProvisionStep::FactoryReset => write!(f, "Factory reset issued"),
            ProvisionStep::Relocated { from, to } => write!(f, "Box moved from {} to {}", from, to),
            ProvisionStep::AutoDialed { target } => write!(f, "Auto-dial completed on {}", target),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionReport {
    /// Address the box was last driven at (differs from the request after a relocation).
    pub target: SocketAddrV4,
    pub steps: Vec<ProvisionStep>,
}

/// Callback type for provisioning progress
pub type StepCallback = Box<dyn Fn(&ProvisionStep) + Send + Sync>;

struct Validated {
    ip: Ipv4Addr,
    mac: MacAddress,
    account: String,
}

/// Runs the provisioning sequence against a box.
pub struct Provisioner {
    controller: Arc<DeviceController>,
    neighbors: Arc<dyn NeighborTable>,
    port: u16,
    settle: Duration,
}

impl Provisioner {
    pub fn new(
        controller: Arc<DeviceController>,
        neighbors: Arc<dyn NeighborTable>,
        port: u16,
    ) -> Self {
        let settle = Duration::from_secs(controller.profile().reset_settle_secs);
        Self {
            controller,
            neighbors,
            port,
            settle,
        }
    }

    /// Override how long to wait for a box to come back after a reset.
    pub fn with_settle_time(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Everything is validated before the first command reaches the box.
    fn validate(&self, request: &ProvisionRequest) -> Result<Validated, ProvisionError> {
        let ip_str = request.ip.trim();
        if !validate::is_valid_ipv4(ip_str) {
            return Err(ProvisionError::InvalidIp(request.ip.clone()));
        }
        let ip: Ipv4Addr = ip_str
            .parse()
            .map_err(|_| ProvisionError::InvalidIp(request.ip.clone()))?;

        let mac_str = request.mac.trim();
        let mac: MacAddress = mac_str.parse().map_err(|source| ProvisionError::InvalidMac {
            value: request.mac.clone(),
            source,
        })?;

        let head = &self.controller.profile().sn_head;
        if !validate::is_valid_serial(head, mac_str) {
            return Err(ProvisionError::InvalidSerial { head: head.clone() });
        }

        let account = request.account.trim();
        if !validate::is_valid_account(account) {
            return Err(ProvisionError::InvalidAccount(request.account.clone()));
        }

        Ok(Validated {
            ip,
            mac,
            account: account.to_string(),
        })
    }

    pub async fn provision(
        &self,
        request: &ProvisionRequest,
        on_step: Option<&StepCallback>,
    ) -> Result<ProvisionReport, ProvisionError> {
        let mut steps = Vec::new();
        let mut record = |step: ProvisionStep| {
            tracing::info!("{}", step);
            if let Some(callback) = on_step {
                callback(&step);
            }
            steps.push(step);
        };

        let input = self.validate(request)?;
        record(ProvisionStep::Validated);

        let mut target = SocketAddrV4::new(input.ip, self.port);
        let session = self.controller.session(target).await;
        if !session.is_online().await? {
            return Err(ProvisionError::AdbUnavailable(target));
        }
        record(ProvisionStep::Online { target });

        let expected = &self.controller.profile().manufacturer;
        if !session.manufacturer_matches(expected).await? {
            return Err(ProvisionError::WrongManufacturer {
                target,
                expected: expected.clone(),
            });
        }
        record(ProvisionStep::ManufacturerChecked);

        session.write_mac(&input.mac).await?;
        record(ProvisionStep::MacWritten { mac: input.mac });

        match request.mode {
            ProvisionMode::Standard => {
                session.write_account(&input.mac, &input.account).await?;
                record(ProvisionStep::AccountWritten);
                if !session.reboot().await? {
                    return Err(ProvisionError::Rejected("reboot"));
                }
                record(ProvisionStep::Rebooted);
            }
            ProvisionMode::FactoryReset => {
                if session.pppoe_is_ottx().await? {
                    if !session.factory_reset().await? {
                        return Err(ProvisionError::Rejected("factory reset"));
                    }
                    record(ProvisionStep::FactoryReset);
                    drop(session);

                    tracing::info!(
                        "Waiting {}s for {} to come back",
                        self.settle.as_secs(),
                        input.mac
                    );
                    tokio::time::sleep(self.settle).await;

                    let new_ip = self.relocate(input.mac).await?;
                    record(ProvisionStep::Relocated {
                        from: input.ip,
                        to: new_ip,
                    });
                    target = SocketAddrV4::new(new_ip, self.port);

                    let session = self.controller.session(target).await;
                    if !session.is_online().await? {
                        return Err(ProvisionError::AdbUnavailable(target));
                    }
                    session.auto_dial(&input.account).await?;
                } else {
                    session.auto_dial(&input.account).await?;
                }
                record(ProvisionStep::AutoDialed { target });
            }
        }

        Ok(ProvisionReport { target, steps })
    }

    async fn relocate(&self, mac: MacAddress) -> Result<Ipv4Addr, ProvisionError> {
        let neighbors = self.neighbors.clone();
        let found = tokio::task::spawn_blocking(move || neighbors.find_by_mac(&mac))
            .await
            .map_err(|e| ProvisionError::Neighbor(e.to_string()))?
            .map_err(|e| ProvisionError::Neighbor(format!("{:#}", e)))?;
        found.ok_or(ProvisionError::DeviceLost(mac))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::device::testing::ScriptedAdb;
    use crate::scanner::arp::NeighborEntry;

    struct Neighbors(Vec<NeighborEntry>);

    impl NeighborTable for Neighbors {
        fn entries(&self) -> anyhow::Result<Vec<NeighborEntry>> {
            Ok(self.0.clone())
        }
    }

    const MAC: &str = "A0:B1:C2:D3:E4:F5";

    fn healthy_box() -> ScriptedAdb {
        ScriptedAdb::default()
            .reply("connect", true, "connected to box")
            .reply("get-state", true, "device")
            .reply("getprop", true, "SKYWORTH")
    }

    fn provisioner(adb: Arc<ScriptedAdb>, neighbors: Vec<NeighborEntry>) -> Provisioner {
        let controller = Arc::new(DeviceController::new(adb, AgentConfig::default().provision));
        Provisioner::new(controller, Arc::new(Neighbors(neighbors)), 5555)
            .with_settle_time(Duration::ZERO)
    }

    fn request(mode: ProvisionMode) -> ProvisionRequest {
        ProvisionRequest {
            ip: "192.168.1.50".to_string(),
            mac: MAC.to_string(),
            account: "07551234567".to_string(),
            mode,
        }
    }

    #[tokio::test]
    async fn test_standard_run() {
        let adb = Arc::new(healthy_box());
        let report = provisioner(adb.clone(), Vec::new())
            .provision(&request(ProvisionMode::Standard), None)
            .await
            .unwrap();

        assert_eq!(report.target.to_string(), "192.168.1.50:5555");
        assert_eq!(report.steps.last(), Some(&ProvisionStep::Rebooted));
        let calls = adb.calls();
        assert!(calls.iter().any(|c| c.ends_with("skset mac A0:B1:C2:D3:E4:F5")));
        assert!(calls.iter().any(|c| c.ends_with("dhcpusr 07551234567ottx01@ottx")));
        assert_eq!(calls.last().unwrap(), "-s 192.168.1.50:5555 reboot");
    }

    #[tokio::test]
    async fn test_invalid_input_sends_nothing() {
        let adb = Arc::new(healthy_box());
        let p = provisioner(adb.clone(), Vec::new());

        let mut bad = request(ProvisionMode::Standard);
        bad.account = "1234567890".to_string();
        assert!(matches!(
            p.provision(&bad, None).await,
            Err(ProvisionError::InvalidAccount(_))
        ));

        let mut bad = request(ProvisionMode::Standard);
        bad.mac = "A0:B1-C2:D3:E4:F5".to_string();
        assert!(matches!(
            p.provision(&bad, None).await,
            Err(ProvisionError::InvalidMac { .. })
        ));

        let mut bad = request(ProvisionMode::Standard);
        bad.ip = "192.168.1.300".to_string();
        assert!(matches!(
            p.provision(&bad, None).await,
            Err(ProvisionError::InvalidIp(_))
        ));

        assert!(adb.calls().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_manufacturer_writes_nothing() {
        let adb = Arc::new(
            ScriptedAdb::default()
                .reply("connect", true, "connected to box")
                .reply("get-state", true, "device")
                .reply("getprop", true, "HUAWEI"),
        );
        let result = provisioner(adb.clone(), Vec::new())
            .provision(&request(ProvisionMode::Standard), None)
            .await;
        assert!(matches!(result, Err(ProvisionError::WrongManufacturer { .. })));
        assert!(!adb.calls().iter().any(|c| c.contains("skset")));
    }

    #[tokio::test]
    async fn test_offline_box() {
        let adb = Arc::new(ScriptedAdb::default().reply("connect", true, "cannot connect to"));
        let result = provisioner(adb, Vec::new())
            .provision(&request(ProvisionMode::Standard), None)
            .await;
        assert!(matches!(result, Err(ProvisionError::AdbUnavailable(_))));
    }

    #[tokio::test]
    async fn test_factory_reset_relocates_by_mac() {
        let adb = Arc::new(
            healthy_box()
                .reply("skget", true, "07550000000ottx01@ottx")
                .reply("MASTER_CLEAR", true, "Broadcast completed: result=0"),
        );
        let moved = NeighborEntry {
            ip: Ipv4Addr::new(192, 168, 1, 77),
            mac: MAC.parse().unwrap(),
        };
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: StepCallback = Box::new(move |step: &ProvisionStep| sink.lock().unwrap().push(step.clone()));

        let report = provisioner(adb.clone(), vec![moved])
            .provision(&request(ProvisionMode::FactoryReset), Some(&callback))
            .await
            .unwrap();

        assert_eq!(report.target.to_string(), "192.168.1.77:5555");
        assert!(report.steps.contains(&ProvisionStep::Relocated {
            from: Ipv4Addr::new(192, 168, 1, 50),
            to: Ipv4Addr::new(192, 168, 1, 77),
        }));
        assert_eq!(*seen.lock().unwrap(), report.steps);
        assert!(adb
            .calls()
            .iter()
            .any(|c| c.starts_with("-s 192.168.1.77:5555 shell am start")));
    }

    #[tokio::test]
    async fn test_factory_reset_box_not_found() {
        let adb = Arc::new(
            healthy_box()
                .reply("skget", true, "ottx")
                .reply("MASTER_CLEAR", true, "Broadcast completed"),
        );
        let result = provisioner(adb, Vec::new())
            .provision(&request(ProvisionMode::FactoryReset), None)
            .await;
        assert!(matches!(result, Err(ProvisionError::DeviceLost(_))));
    }

    #[tokio::test]
    async fn test_factory_reset_without_account_dials_in_place() {
        let adb = Arc::new(healthy_box().reply("skget", true, "unset"));
        let report = provisioner(adb.clone(), Vec::new())
            .provision(&request(ProvisionMode::FactoryReset), None)
            .await
            .unwrap();
        assert!(!report.steps.contains(&ProvisionStep::FactoryReset));
        assert_eq!(report.target.to_string(), "192.168.1.50:5555");
        assert!(!adb.calls().iter().any(|c| c.contains("MASTER_CLEAR")));
    }
}
