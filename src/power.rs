use crate::config::PowerConfig;
use crate::error::PowerError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Interpretation of the monitored power line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalLevel {
    /// External/ignition power is present
    Present,
    /// Running on battery
    Absent,
}

/// Capability interface over the binary hardware line. Selected at
/// construction: the sysfs GPIO implementation on real hardware, a scripted
/// mock everywhere else.
#[async_trait]
pub trait PowerLine: Send + Sync {
    async fn poll(&mut self) -> Result<SignalLevel, PowerError>;

    /// Release the underlying hardware handle. Called exactly once on every
    /// exit path of the sentinel loop.
    async fn release(&mut self);
}

/// Power line backed by the sysfs GPIO interface.
///
/// The pin is exported on first poll and unexported on release. Polarity is
/// configurable: with `active_low` a low level reads as power absent.
pub struct GpioPowerLine {
    pin: u32,
    active_low: bool,
    exported: bool,
}

impl GpioPowerLine {
    pub fn new(pin: u32, active_low: bool) -> Self {
        Self {
            pin,
            active_low,
            exported: false,
        }
    }

    fn value_path(&self) -> String {
        format!("/sys/class/gpio/gpio{}/value", self.pin)
    }

    async fn export(&mut self) -> Result<(), PowerError> {
        if self.exported {
            return Ok(());
        }
        // Export fails with EBUSY when the pin is already exported; in that
        // case the value file exists and the pin is usable as-is.
        if let Err(e) = tokio::fs::write("/sys/class/gpio/export", self.pin.to_string()).await {
            if !tokio::fs::try_exists(self.value_path()).await.unwrap_or(false) {
                return Err(PowerError::LineSetup {
                    details: format!("export of GPIO {} failed: {}", self.pin, e),
                });
            }
        }
        tokio::fs::write(
            format!("/sys/class/gpio/gpio{}/direction", self.pin),
            "in",
        )
        .await
        .map_err(|e| PowerError::LineSetup {
            details: format!("direction of GPIO {} failed: {}", self.pin, e),
        })?;
        self.exported = true;
        info!("Power line ready on GPIO {}", self.pin);
        Ok(())
    }
}

#[async_trait]
impl PowerLine for GpioPowerLine {
    async fn poll(&mut self) -> Result<SignalLevel, PowerError> {
        self.export().await?;
        let raw = tokio::fs::read_to_string(self.value_path())
            .await
            .map_err(|e| PowerError::LineRead {
                details: format!("GPIO {}: {}", self.pin, e),
            })?;
        let high = raw.trim() == "1";
        let absent = if self.active_low { !high } else { high };
        Ok(if absent {
            SignalLevel::Absent
        } else {
            SignalLevel::Present
        })
    }

    async fn release(&mut self) {
        if self.exported {
            if let Err(e) =
                tokio::fs::write("/sys/class/gpio/unexport", self.pin.to_string()).await
            {
                warn!("Failed to unexport GPIO {}: {}", self.pin, e);
            }
            self.exported = false;
        }
        debug!("Power line on GPIO {} released", self.pin);
    }
}

/// The irreversible power-off side effect, substitutable in dev/test.
#[async_trait]
pub trait ShutdownAction: Send + Sync {
    async fn power_off(&self) -> Result<(), PowerError>;
}

/// Executes a real system power-off.
pub struct SystemPowerOff;

#[async_trait]
impl ShutdownAction for SystemPowerOff {
    async fn power_off(&self) -> Result<(), PowerError> {
        info!("Executing system power-off");
        let status = tokio::process::Command::new("sudo")
            .args(["poweroff"])
            .status()
            .await
            .map_err(|e| PowerError::PowerOff {
                details: e.to_string(),
            })?;
        if !status.success() {
            return Err(PowerError::PowerOff {
                details: format!("poweroff exited with {}", status),
            });
        }
        Ok(())
    }
}

/// Log-only stand-in for `SystemPowerOff`.
pub struct LogOnlyPowerOff;

#[async_trait]
impl ShutdownAction for LogOnlyPowerOff {
    async fn power_off(&self) -> Result<(), PowerError> {
        warn!("SIMULATION: system power-off would execute now");
        Ok(())
    }
}

/// Run-length debounce over the power signal. Pure state, no I/O.
#[derive(Debug)]
pub struct DebounceState {
    consecutive_low: u32,
    threshold: u32,
}

impl DebounceState {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_low: 0,
            threshold,
        }
    }

    /// Feed one reading. Returns true when the run of consecutive "absent"
    /// readings reaches the threshold. Any "present" reading resets the run
    /// to zero; there is no partial decay.
    pub fn observe(&mut self, level: SignalLevel) -> bool {
        match level {
            SignalLevel::Absent => {
                self.consecutive_low += 1;
                warn!(
                    "Power loss detected ({}/{})",
                    self.consecutive_low, self.threshold
                );
            }
            SignalLevel::Present => {
                if self.consecutive_low > 0 {
                    debug!("Power restored, debounce counter reset");
                }
                self.consecutive_low = 0;
            }
        }
        self.consecutive_low >= self.threshold
    }

    pub fn consecutive_low(&self) -> u32 {
        self.consecutive_low
    }
}

/// Debounces the UPS power-loss line and commits to a graceful shutdown once
/// the threshold is reached.
///
/// A single noisy reading (ignition relay bounce) never triggers shutdown;
/// only a full run of `debounce_threshold` consecutive absent readings does.
/// Once the shutdown sequence is entered it is not re-entrant: the sentinel
/// waits out the grace period, fires the power-off action and terminates its
/// own loop.
pub struct PowerSentinel {
    line: Box<dyn PowerLine>,
    action: Box<dyn ShutdownAction>,
    debounce: DebounceState,
    poll_interval: Duration,
    shutdown_delay: Duration,
}

/// How the sentinel loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentinelOutcome {
    /// Cancellation token observed, no shutdown triggered
    Cancelled,
    /// Threshold reached and the shutdown sequence completed
    ShutdownCommitted,
}

impl PowerSentinel {
    pub fn new(
        config: &PowerConfig,
        line: Box<dyn PowerLine>,
        action: Box<dyn ShutdownAction>,
    ) -> Self {
        Self {
            line,
            action,
            debounce: DebounceState::new(config.debounce_threshold),
            poll_interval: Duration::from_secs(config.poll_interval_seconds),
            shutdown_delay: Duration::from_secs(config.shutdown_delay_seconds),
        }
    }

    /// Poll loop. Checks the cancellation token at every loop head; a poll
    /// blocked on the line read observes cancellation within one interval.
    /// The hardware handle is released on every exit path.
    pub async fn run(mut self, cancel: CancellationToken) -> SentinelOutcome {
        info!(
            "Power sentinel started (threshold {}, poll every {:?})",
            self.debounce.threshold, self.poll_interval
        );

        let outcome = loop {
            if cancel.is_cancelled() {
                break SentinelOutcome::Cancelled;
            }

            let level = tokio::select! {
                result = self.line.poll() => match result {
                    Ok(level) => level,
                    Err(e) => {
                        // A failed read is no evidence either way; leave the
                        // debounce counter untouched and retry next interval.
                        error!("Power line read failed: {}", e);
                        tokio::select! {
                            _ = sleep(self.poll_interval) => continue,
                            _ = cancel.cancelled() => break SentinelOutcome::Cancelled,
                        }
                    }
                },
                _ = cancel.cancelled() => break SentinelOutcome::Cancelled,
            };

            if self.debounce.observe(level) {
                self.commit_shutdown().await;
                break SentinelOutcome::ShutdownCommitted;
            }

            tokio::select! {
                _ = sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => break SentinelOutcome::Cancelled,
            }
        };

        self.line.release().await;
        info!("Power sentinel stopped ({:?})", outcome);
        outcome
    }

    async fn commit_shutdown(&self) {
        info!(
            "Ignition off confirmed; powering off in {:?}",
            self.shutdown_delay
        );
        // Grace period for a future operator-cancel hook; deliberately not
        // interruptible today.
        sleep(self.shutdown_delay).await;
        if let Err(e) = self.action.power_off().await {
            error!("Power-off action failed: {}", e);
        }
    }
}
