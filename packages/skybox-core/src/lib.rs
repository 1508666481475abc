//! Skybox Core Library
//!
//! This crate provides the core functionality for provisioning set-top boxes
//! over the LAN:
//! - Input validation (IPv4, MAC, serial, PPPoE account)
//! - Network scanning (concurrent adb port sweep of the local /24)
//! - Device control through the `adb` tool (MAC/serial writes, reboot, reset)
//! - Configuration and persistence of the last scan
//!
//! # Example
//!
//! ```no_run
//! use skybox_core::scanner::{EventCallback, NetworkScanner, ScanEvent, ScanOptions};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let scanner = NetworkScanner::new(ScanOptions::default());
//!     let on_event: EventCallback = Arc::new(|event: ScanEvent| {
//!         if let ScanEvent::DeviceFound(device) = event {
//!             println!("adb open on {}", device.address());
//!         }
//!     });
//!
//!     if let Some(handle) = scanner.start_scan(1, 255, Some(on_event)) {
//!         let report = handle.wait().await?;
//!         println!("Found {} devices", report.devices.len());
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod device;
pub mod persistence;
pub mod scanner;
pub mod validate;

// Re-export commonly used types
pub use config::{AgentConfig, ConfigSource};
pub use device::{DeviceController, DeviceError, ProvisionMode, ProvisionRequest, Provisioner};
pub use scanner::{
    DeviceProbe, NetworkScanner, ProbeResult, ScanError, ScanEvent, ScanHandle, ScanOptions,
    ScanOutcome, ScanReport,
};
pub use validate::MacAddress;
