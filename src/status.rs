use crate::geofence::{GeofenceEvaluator, ZoneMatch};
use crate::pipeline::{PipelineState, PipelineStateHandle};
use crate::telemetry::{TelemetrySample, TelemetryStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Snapshot of the appliance for operators. Assembled fresh per request;
/// nothing here is cached.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub telemetry: TelemetrySample,
    pub zone: ZoneMatch,
    pub pipeline: PipelineState,
    pub generated_at: DateTime<Utc>,
}

/// Pulls together the live telemetry, geofence verdict and pipeline state.
/// Cheap enough to call per request.
pub struct StatusQuery {
    store: Arc<TelemetryStore>,
    evaluator: Arc<GeofenceEvaluator>,
    pipeline: PipelineStateHandle,
}

impl StatusQuery {
    pub fn new(
        store: Arc<TelemetryStore>,
        evaluator: Arc<GeofenceEvaluator>,
        pipeline: PipelineStateHandle,
    ) -> Self {
        Self {
            store,
            evaluator,
            pipeline,
        }
    }

    pub fn report(&self) -> StatusReport {
        let telemetry = self.store.read();
        let zone = self.evaluator.check(&telemetry);
        StatusReport {
            telemetry,
            zone,
            pipeline: self.pipeline.get(),
            generated_at: Utc::now(),
        }
    }
}
