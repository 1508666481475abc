//! Driving boxes through the `adb` command-line tool.
//!
//! All adb invocations go through an [`AdbRunner`], so the command sequences
//! can be exercised without a real adb binary. Commands against the same
//! `ip:port` are serialised: a [`DeviceSession`] holds that target's lock for
//! as long as it lives.

mod provision;

pub use provision::{
    ProvisionError, ProvisionMode, ProvisionReport, ProvisionRequest, ProvisionStep, Provisioner,
    StepCallback,
};

use crate::config::{AgentConfig, ProvisionConfig};
use crate::scanner::hidden_command_sync;
use crate::validate::MacAddress;
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Key presses that walk the mode-selector screen to the PPPoE dial button.
const AUTO_DIAL_KEYS: &[&str] = &[
    "KEYCODE_DPAD_DOWN",
    "KEYCODE_DPAD_DOWN",
    "KEYCODE_DPAD_CENTER",
    "KEYCODE_BACK",
    "KEYCODE_DPAD_DOWN",
    "KEYCODE_DPAD_DOWN",
    "KEYCODE_DPAD_CENTER",
    "KEYCODE_DPAD_CENTER",
];

const MODE_SELECTER_ACTIVITY: &str =
    "com.skyworth.modeselecter/com.skyworth.modeselecter.MainActivity";

const PPPOE_USER_KEY: &str = "skyworth.params.net.dhcpusr";
const PPPOE_PASSWORD_KEY: &str = "skyworth.params.net.dhcppwd";

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Failed to run adb: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("`adb {command}` failed: {output}")]
    CommandFailed { command: String, output: String },

    #[error("adb worker task failed: {0}")]
    Task(String),
}

/// Captured result of one adb invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stdout and stderr together; adb splits its messages between both.
    pub fn combined(&self) -> String {
        let mut text = self.stdout.trim().to_string();
        let err = self.stderr.trim();
        if !err.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(err);
        }
        text
    }
}

/// Runs the adb tool with the given arguments.
pub trait AdbRunner: Send + Sync {
    fn run(&self, args: &[String]) -> std::io::Result<CommandOutput>;
}

/// Spawns the real adb executable.
#[derive(Debug, Clone)]
pub struct SystemAdb {
    binary: String,
}

impl SystemAdb {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl AdbRunner for SystemAdb {
    fn run(&self, args: &[String]) -> std::io::Result<CommandOutput> {
        tracing::debug!("{} {}", self.binary, args.join(" "));
        let output = hidden_command_sync(&self.binary).args(args).output()?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// `adb connect` exits 0 on failure too; only the message tells.
pub fn connect_succeeded(output: &str) -> bool {
    if output.contains("cannot connect to") || output.contains("failed to connect") {
        return false;
    }
    output.contains("connected to")
}

pub fn reboot_succeeded(output: &CommandOutput) -> bool {
    let text = output.combined();
    output.success && !text.contains("error: device") && !text.contains("not found")
}

pub fn broadcast_completed(output: &CommandOutput) -> bool {
    output.success && output.combined().contains("Broadcast completed")
}

/// Issues provisioning commands to boxes on the LAN.
pub struct DeviceController {
    runner: Arc<dyn AdbRunner>,
    profile: ProvisionConfig,
    targets: Mutex<HashMap<SocketAddrV4, Arc<AsyncMutex<()>>>>,
}

impl DeviceController {
    pub fn new(runner: Arc<dyn AdbRunner>, profile: ProvisionConfig) -> Self {
        Self {
            runner,
            profile,
            targets: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            Arc::new(SystemAdb::new(config.adb.binary.clone())),
            config.provision.clone(),
        )
    }

    pub fn profile(&self) -> &ProvisionConfig {
        &self.profile
    }

    /// Exclusive access to `target` until the session is dropped.
    pub async fn session(&self, target: SocketAddrV4) -> DeviceSession<'_> {
        let lock = {
            let mut targets = self
                .targets
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            targets.entry(target).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        DeviceSession {
            controller: self,
            target,
            serial: target.to_string(),
            _guard: guard,
        }
    }

    /// Stop the local adb server (and any stuck adb process on Windows).
    pub async fn kill_server(&self) -> Result<bool, DeviceError> {
        let output = self.run(args(["kill-server"])).await?;
        if !output.success {
            return Ok(false);
        }

        #[cfg(target_os = "windows")]
        {
            let _ = tokio::task::spawn_blocking(|| {
                hidden_command_sync("taskkill")
                    .args(["/im", "adb.exe", "/f"])
                    .output()
            })
            .await;
        }

        Ok(true)
    }

    async fn run(&self, args: Vec<String>) -> Result<CommandOutput, DeviceError> {
        let runner = self.runner.clone();
        tokio::task::spawn_blocking(move || runner.run(&args))
            .await
            .map_err(|e| DeviceError::Task(e.to_string()))?
            .map_err(DeviceError::from)
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Serialised access to one box.
pub struct DeviceSession<'a> {
    controller: &'a DeviceController,
    target: SocketAddrV4,
    serial: String,
    _guard: OwnedMutexGuard<()>,
}

impl DeviceSession<'_> {
    pub fn target(&self) -> SocketAddrV4 {
        self.target
    }

    async fn shell(&self, command: &str) -> Result<CommandOutput, DeviceError> {
        self.controller
            .run(args(["-s", &self.serial, "shell", command]))
            .await
    }

    /// Run a shell command that must exit 0.
    async fn shell_ok(&self, command: &str) -> Result<CommandOutput, DeviceError> {
        let output = self.shell(command).await?;
        if output.success {
            Ok(output)
        } else {
            Err(DeviceError::CommandFailed {
                command: format!("-s {} shell {}", self.serial, command),
                output: output.combined(),
            })
        }
    }

    pub async fn connect(&self) -> Result<bool, DeviceError> {
        let output = self.controller.run(args(["connect", &self.serial])).await?;
        let connected = connect_succeeded(&output.combined());
        tracing::debug!("adb connect {}: {}", self.serial, connected);
        Ok(connected)
    }

    /// Connected and reporting the `device` state.
    pub async fn is_online(&self) -> Result<bool, DeviceError> {
        if !self.connect().await? {
            return Ok(false);
        }
        let output = self
            .controller
            .run(args(["-s", &self.serial, "get-state"]))
            .await?;
        Ok(output.success && output.stdout.trim() == "device")
    }

    pub async fn manufacturer_matches(&self, expected: &str) -> Result<bool, DeviceError> {
        let output = self.shell("getprop ro.product.manufacturer").await?;
        Ok(output.success
            && output
                .stdout
                .trim()
                .to_uppercase()
                .contains(&expected.to_uppercase()))
    }

    /// Whether the PPPoE account on the box is already an `ottx` one.
    pub async fn pppoe_is_ottx(&self) -> Result<bool, DeviceError> {
        let output = self.shell(&format!("skget {}", PPPOE_USER_KEY)).await?;
        Ok(output.success && output.stdout.to_lowercase().contains("ottx"))
    }

    /// Write the MAC, then the serial derived from it.
    pub async fn write_mac(&self, mac: &MacAddress) -> Result<(), DeviceError> {
        self.shell_ok(&format!("skset mac {}", mac.colon())).await?;
        self.write_serial(mac).await
    }

    async fn write_serial(&self, mac: &MacAddress) -> Result<(), DeviceError> {
        let serial = format!("{}{}", self.controller.profile.sn_head, mac.plain());
        self.shell_ok(&format!("skset sn {}", serial)).await?;
        Ok(())
    }

    async fn write_pppoe(&self, account: &str) -> Result<(), DeviceError> {
        let profile = &self.controller.profile;
        self.shell_ok(&format!(
            "skset {} {}{}",
            PPPOE_USER_KEY, account, profile.pppoe_suffix
        ))
        .await?;
        self.shell_ok(&format!(
            "skset {} {}",
            PPPOE_PASSWORD_KEY, profile.pppoe_password
        ))
        .await?;
        Ok(())
    }

    /// Write the serial and the PPPoE credentials.
    pub async fn write_account(&self, mac: &MacAddress, account: &str) -> Result<(), DeviceError> {
        self.write_serial(mac).await?;
        self.write_pppoe(account).await
    }

    /// Open the mode selector, store the PPPoE account and press through to dial.
    pub async fn auto_dial(&self, account: &str) -> Result<(), DeviceError> {
        self.shell_ok(&format!("am start -n {}", MODE_SELECTER_ACTIVITY))
            .await?;
        self.write_pppoe(account).await?;
        for key in AUTO_DIAL_KEYS {
            self.shell_ok(&format!("input keyevent {}", key)).await?;
        }
        Ok(())
    }

    pub async fn reboot(&self) -> Result<bool, DeviceError> {
        let output = self
            .controller
            .run(args(["-s", &self.serial, "reboot"]))
            .await?;
        Ok(reboot_succeeded(&output))
    }

    /// Ask the box to wipe itself.
    pub async fn factory_reset(&self) -> Result<bool, DeviceError> {
        let output = self
            .shell("am broadcast -a android.intent.action.MASTER_CLEAR")
            .await?;
        Ok(broadcast_completed(&output))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Replies to adb invocations by substring match; unmatched calls succeed
    /// with empty output. Every call is recorded.
    #[derive(Default)]
    pub struct ScriptedAdb {
        replies: Mutex<Vec<(String, CommandOutput)>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedAdb {
        pub fn reply(self, pattern: &str, success: bool, stdout: &str) -> Self {
            self.replies.lock().unwrap().push((
                pattern.to_string(),
                CommandOutput {
                    success,
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                },
            ));
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl AdbRunner for ScriptedAdb {
        fn run(&self, args: &[String]) -> std::io::Result<CommandOutput> {
            let line = args.join(" ");
            self.calls.lock().unwrap().push(line.clone());
            let replies = self.replies.lock().unwrap();
            Ok(replies
                .iter()
                .find(|(pattern, _)| line.contains(pattern.as_str()))
                .map(|(_, out)| out.clone())
                .unwrap_or(CommandOutput {
                    success: true,
                    ..Default::default()
                }))
        }
    }
}
