use crate::config::SentinelConfig;
use crate::error::Result;
use crate::evidence;
use crate::geofence::GeofenceEvaluator;
use crate::gps::GpsMonitor;
use crate::pipeline::{CapturePipeline, PipelineConfig, PipelineEvent};
use crate::power::{
    GpioPowerLine, LogOnlyPowerOff, PowerSentinel, SentinelOutcome, ShutdownAction,
    SystemPowerOff,
};
use crate::preview::PreviewSlot;
use crate::telemetry::TelemetryStore;
use crate::thermal::ThermalMonitor;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Why the appliance is coming down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The capture pipeline ended its stream normally
    PipelineEnded,
    /// The capture pipeline reported an unrecoverable fault
    PipelineFatal(String),
    /// The power sentinel committed to shutdown
    PowerLoss,
    /// SIGINT/SIGTERM, or the embedding test cancelled us
    Requested,
}

/// Owns every long-running component and their start/stop ordering.
///
/// Startup: power sentinel first (safety net before anything heavy), then
/// GPS, thermal, the capture pipeline, and last the web surface. Teardown
/// runs the same list in reverse, cancelling and awaiting one component at
/// a time so no task outlives the resources it borrows.
pub struct SentinelOrchestrator {
    config: SentinelConfig,
}

impl SentinelOrchestrator {
    pub fn new(config: SentinelConfig) -> Self {
        Self { config }
    }

    /// Run until a terminal condition, then tear everything down. Returns
    /// the process exit code: 0 for any orderly shutdown, 1 when the
    /// pipeline died of a fatal fault.
    ///
    /// `external_shutdown` lets an embedder request an orderly stop without
    /// signals; the binary passes a token it never cancels.
    pub async fn run(self, external_shutdown: CancellationToken) -> Result<i32> {
        let recording_dir = PathBuf::from(&self.config.recording.directory);
        evidence::ensure_recording_dir(&recording_dir)?;

        let store = Arc::new(TelemetryStore::new());
        let preview = Arc::new(PreviewSlot::new());
        let evaluator = Arc::new(GeofenceEvaluator::from_config(
            &self.config.zones,
            &self.config.schedule,
        )?);

        // Power sentinel comes up before anything heavy so an ignition-off
        // during startup is still caught.
        let power_cancel = CancellationToken::new();
        let mut power_handle = self.spawn_power_sentinel(power_cancel.clone());
        let mut power_done = false;

        let gps_cancel = CancellationToken::new();
        let gps_handle = tokio::spawn(
            GpsMonitor::new(&self.config.gps, Arc::clone(&store)).run(gps_cancel.clone()),
        );

        let thermal_cancel = CancellationToken::new();
        let thermal_handle = tokio::spawn(
            ThermalMonitor::new(self.config.thermal.clone()).run(thermal_cancel.clone()),
        );

        let mut pipeline = CapturePipeline::build(
            PipelineConfig::from_config(&self.config.camera, &self.config.recording),
            Arc::clone(&preview),
        )?;
        pipeline.start()?;

        #[cfg(feature = "web")]
        let (web_cancel, web_handle) = {
            let status = Arc::new(crate::status::StatusQuery::new(
                Arc::clone(&store),
                Arc::clone(&evaluator),
                pipeline.state_handle(),
            ));
            let server = crate::web::WebServer::new(
                self.config.stream.clone(),
                status,
                Arc::clone(&preview),
                recording_dir.clone(),
            );
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(server.start(cancel.clone()));
            (cancel, handle)
        };
        #[cfg(not(feature = "web"))]
        let _ = &evaluator;

        info!("All components running");

        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        let reason = tokio::select! {
            event = pipeline.wait_terminated() => match event {
                PipelineEvent::EndOfStream => ShutdownReason::PipelineEnded,
                PipelineEvent::FatalError(details) => ShutdownReason::PipelineFatal(details),
            },
            outcome = &mut power_handle => {
                power_done = true;
                match outcome {
                    Ok(SentinelOutcome::ShutdownCommitted) => {}
                    Ok(SentinelOutcome::Cancelled) => {
                        warn!("Power sentinel exited without being asked to")
                    }
                    Err(e) => error!("Power sentinel task failed: {}", e),
                }
                ShutdownReason::PowerLoss
            },
            _ = tokio::signal::ctrl_c() => ShutdownReason::Requested,
            _ = sigterm.recv() => ShutdownReason::Requested,
            _ = external_shutdown.cancelled() => ShutdownReason::Requested,
        };

        info!("Shutting down: {:?}", reason);

        // Reverse start order, one component at a time.
        #[cfg(feature = "web")]
        {
            web_cancel.cancel();
            match web_handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Web server shut down with error: {}", e),
                Err(e) => error!("Web server task failed: {}", e),
            }
        }

        pipeline.stop().await;

        thermal_cancel.cancel();
        if let Err(e) = thermal_handle.await {
            error!("Thermal monitor task failed: {}", e);
        }

        gps_cancel.cancel();
        if let Err(e) = gps_handle.await {
            error!("GPS monitor task failed: {}", e);
        }

        power_cancel.cancel();
        if !power_done {
            if let Err(e) = power_handle.await {
                error!("Power sentinel task failed: {}", e);
            }
        }

        info!("Shutdown complete");
        Ok(match reason {
            ShutdownReason::PipelineFatal(_) => 1,
            _ => 0,
        })
    }

    fn spawn_power_sentinel(&self, cancel: CancellationToken) -> JoinHandle<SentinelOutcome> {
        let line = GpioPowerLine::new(self.config.power.gpio_pin, self.config.power.active_low);
        let action: Box<dyn ShutdownAction> = if self.config.power.simulate_poweroff {
            Box::new(LogOnlyPowerOff)
        } else {
            Box::new(SystemPowerOff)
        };
        let sentinel = PowerSentinel::new(&self.config.power, Box::new(line), action);
        tokio::spawn(sentinel.run(cancel))
    }
}
