//! Out-of-band power control through an external IPMI tool.
//!
//! The rest of the crate consumes only the [`PowerEffector`] trait;
//! [`IpmiController`] drives the real `ipmitool` binary and [`MockPower`]
//! is the in-memory stand-in used by the test harness.

use crate::config::{Config, Secret};
use parking_lot::Mutex;
use std::future::Future;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Power state as reported by the IPMI tool. Advisory, never authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedPower {
    On,
    Off,
    /// Command failed, timed out, or produced unparseable output
    Unknown,
}

/// Interface to the backend's power controls.
pub trait PowerEffector: Send + Sync + 'static {
    fn query_power(&self) -> impl Future<Output = ObservedPower> + Send;
    fn power_on(&self) -> impl Future<Output = anyhow::Result<()>> + Send;
    fn power_soft(&self) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Drives the external IPMI tool. Invocations are serialized: at most one
/// external process is live at any time.
pub struct IpmiController {
    tool_path: String,
    host: String,
    user: String,
    password: Secret,
    timeout: Duration,
    invocation: tokio::sync::Mutex<()>,
}

impl IpmiController {
    pub fn new(config: &Config, timeout: Duration) -> Self {
        Self {
            tool_path: config.ipmi_path.clone(),
            host: config.ipmi_host.clone(),
            user: config.ipmi_user.clone(),
            password: config.ipmi_password.clone(),
            timeout,
            invocation: tokio::sync::Mutex::new(()),
        }
    }

    /// Run `<tool> -I lanplus -H <host> -U <user> -P <password> chassis
    /// power <verb>` and return its stdout. The password never appears in
    /// logs; failures report the verb only.
    async fn run_tool(&self, verb: &str) -> anyhow::Result<String> {
        let _serialized = self.invocation.lock().await;

        let mut cmd = Command::new(&self.tool_path);
        cmd.args([
            "-I",
            "lanplus",
            "-H",
            self.host.as_str(),
            "-U",
            self.user.as_str(),
            "-P",
            self.password.expose(),
            "chassis",
            "power",
            verb,
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "ipmi '{}' timed out after {:?}",
                    verb,
                    self.timeout
                )
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "ipmi '{}' exited with {}: {}",
                verb,
                output.status,
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl PowerEffector for IpmiController {
    async fn query_power(&self) -> ObservedPower {
        match self.run_tool("status").await {
            Ok(output) => {
                if output.contains("Chassis Power is on") {
                    ObservedPower::On
                } else if output.contains("Chassis Power is off") {
                    ObservedPower::Off
                } else {
                    debug!(output = %output.trim(), "Unparseable power status output");
                    ObservedPower::Unknown
                }
            }
            Err(e) => {
                warn!(error = %e, "Power status query failed");
                ObservedPower::Unknown
            }
        }
    }

    async fn power_on(&self) -> anyhow::Result<()> {
        self.run_tool("on").await.map(|_| ())
    }

    async fn power_soft(&self) -> anyhow::Result<()> {
        self.run_tool("soft").await.map(|_| ())
    }
}

/// A recorded mock invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerCall {
    Status,
    On,
    Soft,
}

/// In-memory power effector for tests. Flips a shared power flag the way
/// the mock IPMI tool flips its state file, and records every call.
pub struct MockPower {
    on: AtomicBool,
    report_unknown: AtomicBool,
    fail_commands: AtomicBool,
    calls: Mutex<Vec<PowerCall>>,
}

impl MockPower {
    pub fn new(initially_on: bool) -> Self {
        Self {
            on: AtomicBool::new(initially_on),
            report_unknown: AtomicBool::new(false),
            fail_commands: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }

    /// Force the power state without going through a command.
    pub fn set_on(&self, on: bool) {
        self.on.store(on, Ordering::SeqCst);
    }

    /// When set, `query_power` returns `Unknown` regardless of state.
    pub fn set_report_unknown(&self, unknown: bool) {
        self.report_unknown.store(unknown, Ordering::SeqCst);
    }

    /// When set, `power_on` and `power_soft` fail without changing state.
    pub fn set_fail_commands(&self, fail: bool) {
        self.fail_commands.store(fail, Ordering::SeqCst);
    }

    /// Every invocation so far, in order.
    pub fn calls(&self) -> Vec<PowerCall> {
        self.calls.lock().clone()
    }

    fn count(&self, call: PowerCall) -> usize {
        self.calls.lock().iter().filter(|c| **c == call).count()
    }

    pub fn power_on_calls(&self) -> usize {
        self.count(PowerCall::On)
    }

    pub fn power_soft_calls(&self) -> usize {
        self.count(PowerCall::Soft)
    }

    pub fn status_calls(&self) -> usize {
        self.count(PowerCall::Status)
    }
}

impl PowerEffector for MockPower {
    async fn query_power(&self) -> ObservedPower {
        self.calls.lock().push(PowerCall::Status);
        if self.report_unknown.load(Ordering::SeqCst) {
            ObservedPower::Unknown
        } else if self.on.load(Ordering::SeqCst) {
            ObservedPower::On
        } else {
            ObservedPower::Off
        }
    }

    async fn power_on(&self) -> anyhow::Result<()> {
        self.calls.lock().push(PowerCall::On);
        if self.fail_commands.load(Ordering::SeqCst) {
            anyhow::bail!("mock power-on failure");
        }
        self.on.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn power_soft(&self) -> anyhow::Result<()> {
        self.calls.lock().push(PowerCall::Soft);
        if self.fail_commands.load(Ordering::SeqCst) {
            anyhow::bail!("mock power-soft failure");
        }
        self.on.store(false, Ordering::SeqCst);
        Ok(())
    }
}
