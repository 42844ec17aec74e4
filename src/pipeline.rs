use crate::config::{CameraConfig, RecordingConfig};
use crate::error::PipelineError;
use crate::evidence;
use crate::preview::PreviewSlot;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(all(feature = "camera", target_os = "linux"))]
use gstreamer as gst;
#[cfg(all(feature = "camera", target_os = "linux"))]
use gstreamer::prelude::*;
#[cfg(all(feature = "camera", target_os = "linux"))]
use gstreamer_app as gst_app;

/// Immutable description of the capture pipeline. Fixed once `build` runs;
/// changing any of it requires constructing a new pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub bitrate: u32,
    pub recording_dir: PathBuf,
    pub chunk_seconds: u32,
}

impl PipelineConfig {
    pub fn from_config(camera: &CameraConfig, recording: &RecordingConfig) -> Self {
        Self {
            width: camera.width,
            height: camera.height,
            framerate: camera.framerate,
            bitrate: camera.encoding_bitrate,
            recording_dir: PathBuf::from(&recording.directory),
            chunk_seconds: recording.chunk_seconds,
        }
    }
}

/// Lifecycle of one pipeline instance. Transitions are monotonic except for
/// teardown; a stopped or errored instance is never restarted, build a new
/// one from the top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Stopped,
    Building,
    Playing,
    Error,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Stopped => "Stopped",
            PipelineState::Building => "Building",
            PipelineState::Playing => "Playing",
            PipelineState::Error => "Error",
        }
    }
}

/// Terminal bus events. Either one releases the orchestrator's blocking wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    EndOfStream,
    FatalError(String),
}

/// Read-only view of the pipeline state for the status query surface.
#[derive(Clone)]
pub struct PipelineStateHandle {
    inner: Arc<Mutex<PipelineState>>,
}

impl PipelineStateHandle {
    pub fn get(&self) -> PipelineState {
        *self.inner.lock()
    }
}

/// Legal transitions only; everything else is a caller bug surfaced as
/// `InvalidState`. Error is reachable solely from Playing.
fn try_transition(
    state: &Mutex<PipelineState>,
    to: PipelineState,
) -> Result<(), PipelineError> {
    let mut current = state.lock();
    let legal = matches!(
        (*current, to),
        (PipelineState::Stopped, PipelineState::Building)
            | (PipelineState::Building, PipelineState::Playing)
            | (PipelineState::Building, PipelineState::Stopped)
            | (PipelineState::Playing, PipelineState::Stopped)
            | (PipelineState::Playing, PipelineState::Error)
    );
    if !legal {
        return Err(PipelineError::InvalidState {
            state: current.as_str(),
        });
    }
    debug!("Pipeline state {} -> {}", current.as_str(), to.as_str());
    *current = to;
    Ok(())
}

/// The textual pipeline description handed to the media subsystem.
///
/// One camera source fans out through a tee into three branches:
/// 1. evidence: unbounded queue, hardware H.264 encode, segmenting sink
///    rotating every chunk period (must never drop frames);
/// 2. inference: leaky queue into a 640x640 downscale, terminated by a
///    discard sink until a model is attached (never backpressures 1 or 3);
/// 3. preview: leaky queue, 640x480 downscale, JPEG encode into a
///    single-slot app sink (keep newest only).
fn pipeline_description(config: &PipelineConfig) -> String {
    let location = evidence::segment_location(&config.recording_dir);
    format!(
        "libcamerasrc ! video/x-raw,width={width},height={height},framerate={framerate}/1,format=NV12 ! tee name=t \
         t. ! queue max-size-buffers=0 max-size-bytes=0 max-size-time=0 ! \
         v4l2h264enc bitrate={bitrate} ! h264parse ! \
         splitmuxsink location={location} max-size-time={chunk_ns} \
         t. ! queue leaky=downstream ! videoscale ! video/x-raw,width=640,height=640 ! \
         videoconvert ! fakesink name=inference_sink sync=false \
         t. ! queue leaky=downstream ! videoscale ! video/x-raw,width=640,height=480 ! \
         videoconvert ! jpegenc ! appsink name=preview_sink max-buffers=1 drop=true sync=false",
        width = config.width,
        height = config.height,
        framerate = config.framerate,
        bitrate = config.bitrate,
        location = location.display(),
        chunk_ns = config.chunk_seconds as u64 * 1_000_000_000,
    )
}

/// Owns the media pipeline handle and drives its lifecycle. Exactly one
/// instance is live at a time; the orchestrator blocks on
/// [`wait_terminated`](CapturePipeline::wait_terminated) while it runs.
///
/// Without the `camera` feature (or off Linux) a mock driver stands in,
/// exercising the same state machine, segment rotation and preview
/// publishing so the rest of the system behaves identically in development.
pub struct CapturePipeline {
    config: PipelineConfig,
    state: Arc<Mutex<PipelineState>>,
    preview: Arc<PreviewSlot>,
    event_tx: watch::Sender<Option<PipelineEvent>>,
    event_rx: watch::Receiver<Option<PipelineEvent>>,
    driver_cancel: CancellationToken,
    #[cfg(all(feature = "camera", target_os = "linux"))]
    pipeline: Option<gst::Pipeline>,
    #[cfg(not(all(feature = "camera", target_os = "linux")))]
    mock_task: Option<tokio::task::JoinHandle<()>>,
}

impl CapturePipeline {
    /// Construct the pipeline from its immutable description.
    ///
    /// Build failure is fatal to the process: a malformed description
    /// cannot be validated against hardware ahead of time, and no partial
    /// or retry state is defined.
    pub fn build(
        config: PipelineConfig,
        preview: Arc<PreviewSlot>,
    ) -> Result<Self, PipelineError> {
        let state = Arc::new(Mutex::new(PipelineState::Stopped));
        try_transition(&state, PipelineState::Building)?;

        let (event_tx, event_rx) = watch::channel(None);

        let mut capture = Self {
            config,
            state,
            preview,
            event_tx,
            event_rx,
            driver_cancel: CancellationToken::new(),
            #[cfg(all(feature = "camera", target_os = "linux"))]
            pipeline: None,
            #[cfg(not(all(feature = "camera", target_os = "linux")))]
            mock_task: None,
        };

        capture.build_inner()?;
        Ok(capture)
    }

    #[cfg(all(feature = "camera", target_os = "linux"))]
    fn build_inner(&mut self) -> Result<(), PipelineError> {
        gst::init().map_err(|e| PipelineError::Build {
            details: format!("media subsystem init failed: {}", e),
        })?;

        let description = pipeline_description(&self.config);
        info!("Building pipeline: {}", description);

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| PipelineError::Build {
                details: e.to_string(),
            })?
            .downcast::<gst::Pipeline>()
            .map_err(|_| PipelineError::Build {
                details: "description did not produce a pipeline".to_string(),
            })?;

        let preview_sink = pipeline
            .by_name("preview_sink")
            .and_then(|e| e.downcast::<gst_app::AppSink>().ok())
            .ok_or_else(|| PipelineError::Build {
                details: "preview_sink missing from pipeline".to_string(),
            })?;

        // The callback only copies the JPEG bytes into the single-slot
        // holder; no long-running work on the streaming thread.
        let preview = Arc::clone(&self.preview);
        preview_sink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| match sink.pull_sample() {
                    Ok(sample) => {
                        if let Some(buffer) = sample.buffer() {
                            if let Ok(map) = buffer.map_readable() {
                                preview.publish(map.as_slice().to_vec());
                            }
                        }
                        Ok(gst::FlowSuccess::Ok)
                    }
                    Err(_) => Err(gst::FlowError::Error),
                })
                .build(),
        );

        self.pipeline = Some(pipeline);
        Ok(())
    }

    #[cfg(not(all(feature = "camera", target_os = "linux")))]
    fn build_inner(&mut self) -> Result<(), PipelineError> {
        let description = pipeline_description(&self.config);
        info!("Building pipeline (mock driver): {}", description);
        Ok(())
    }

    /// Start capture. Returns once the pipeline is confirmed active; after
    /// that, bus events arrive asynchronously and the caller is never
    /// blocked again.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        self.start_inner()?;
        try_transition(&self.state, PipelineState::Playing)?;
        info!("Capture pipeline playing");
        Ok(())
    }

    #[cfg(all(feature = "camera", target_os = "linux"))]
    fn start_inner(&mut self) -> Result<(), PipelineError> {
        // Refuse restart of a consumed instance before touching hardware.
        if *self.state.lock() != PipelineState::Building {
            return Err(PipelineError::InvalidState {
                state: self.state.lock().as_str(),
            });
        }

        let pipeline = self.pipeline.as_ref().ok_or(PipelineError::Start {
            details: "pipeline not built".to_string(),
        })?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| PipelineError::Start {
                details: e.to_string(),
            })?;

        // Confirm the transition actually completed before reporting active.
        let (result, _, _) = pipeline.state(gst::ClockTime::from_seconds(5));
        result.map_err(|e| PipelineError::Start {
            details: format!("pipeline did not reach playing: {}", e),
        })?;

        self.spawn_bus_watcher(pipeline)?;
        Ok(())
    }

    /// Watches the pipeline bus on a blocking thread and forwards terminal
    /// events. The handler only flips state, releases the hardware and
    /// signals the waiter.
    #[cfg(all(feature = "camera", target_os = "linux"))]
    fn spawn_bus_watcher(&self, pipeline: &gst::Pipeline) -> Result<(), PipelineError> {
        let bus = pipeline.bus().ok_or(PipelineError::Start {
            details: "pipeline has no bus".to_string(),
        })?;

        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        let cancel = self.driver_cancel.clone();
        let pipeline_weak = pipeline.downgrade();

        tokio::task::spawn_blocking(move || loop {
            if cancel.is_cancelled() {
                break;
            }
            let Some(message) = bus.timed_pop(gst::ClockTime::from_mseconds(100)) else {
                continue;
            };
            match message.view() {
                gst::MessageView::Error(err) => {
                    let details = format!("{} ({:?})", err.error(), err.debug());
                    error!("Pipeline bus error: {}", details);
                    let _ = try_transition(&state, PipelineState::Error);
                    if let Some(pipeline) = pipeline_weak.upgrade() {
                        let _ = pipeline.set_state(gst::State::Null);
                    }
                    notify(&event_tx, PipelineEvent::FatalError(details));
                    break;
                }
                gst::MessageView::Eos(..) => {
                    info!("Pipeline reached end of stream");
                    let _ = try_transition(&state, PipelineState::Stopped);
                    if let Some(pipeline) = pipeline_weak.upgrade() {
                        let _ = pipeline.set_state(gst::State::Null);
                    }
                    notify(&event_tx, PipelineEvent::EndOfStream);
                    break;
                }
                _ => {}
            }
        });

        Ok(())
    }

    #[cfg(not(all(feature = "camera", target_os = "linux")))]
    fn start_inner(&mut self) -> Result<(), PipelineError> {
        if *self.state.lock() != PipelineState::Building {
            return Err(PipelineError::InvalidState {
                state: self.state.lock().as_str(),
            });
        }

        let cancel = self.driver_cancel.clone();
        let config = self.config.clone();
        let preview = Arc::clone(&self.preview);

        // Synthesizes what the real pipeline produces: one segment file per
        // chunk period and a steady trickle of preview frames.
        self.mock_task = Some(tokio::spawn(async move {
            let chunk = std::time::Duration::from_secs(config.chunk_seconds as u64);
            let frame_tick = std::time::Duration::from_millis(100);
            let mut segment_index = 0u32;
            let mut next_rotation = tokio::time::Instant::now();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep_until(next_rotation) => {
                        let name = format!("evidence_{:05}.mp4", segment_index);
                        if let Err(e) =
                            tokio::fs::write(config.recording_dir.join(&name), MOCK_JPEG).await
                        {
                            warn!("Mock segment write failed: {}", e);
                        }
                        segment_index += 1;
                        next_rotation += chunk;
                    }
                    _ = tokio::time::sleep(frame_tick) => {
                        preview.publish(MOCK_JPEG.to_vec());
                    }
                }
            }
            debug!("Mock pipeline driver stopped after {} segment(s)", segment_index);
        }));

        Ok(())
    }

    /// Deliver a synthetic bus event to the mock driver. Illegal transitions
    /// (a fatal error while not Playing) are ignored, matching the real bus
    /// watcher which only runs while the pipeline plays.
    #[cfg(not(all(feature = "camera", target_os = "linux")))]
    pub fn simulate_bus_event(&self, event: PipelineEvent) {
        let to = match &event {
            PipelineEvent::FatalError(details) => {
                error!("Pipeline bus error: {}", details);
                PipelineState::Error
            }
            PipelineEvent::EndOfStream => PipelineState::Stopped,
        };
        if try_transition(&self.state, to).is_ok() {
            self.driver_cancel.cancel();
            notify(&self.event_tx, event);
        }
    }

    /// Stop capture and release the media handle. Idempotent; safe on every
    /// exit path, including after a bus-reported error has already torn the
    /// instance down.
    pub async fn stop(&mut self) {
        self.stop_inner().await;
        // Teardown from Stopped or Error is a no-op.
        if try_transition(&self.state, PipelineState::Stopped).is_ok() {
            info!("Capture pipeline stopped");
        }
        notify(&self.event_tx, PipelineEvent::EndOfStream);
    }

    #[cfg(all(feature = "camera", target_os = "linux"))]
    async fn stop_inner(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            // The segmenting sink only writes the container index for the
            // in-flight segment once EOS has propagated through the muxer;
            // going straight to Null would leave the last file unplayable.
            // The bus watcher signals the terminal event when EOS arrives.
            if *self.state.lock() == PipelineState::Playing {
                pipeline.send_event(gst::event::Eos::new());
                if !drain_terminal_event(&self.event_rx, EOS_DRAIN_LIMIT).await {
                    warn!("End of stream did not drain in time, stopping anyway");
                }
            }
            self.driver_cancel.cancel();
            if let Err(e) = pipeline.set_state(gst::State::Null) {
                warn!("Failed to null pipeline during stop: {}", e);
            }
        } else {
            self.driver_cancel.cancel();
        }
    }

    #[cfg(not(all(feature = "camera", target_os = "linux")))]
    async fn stop_inner(&mut self) {
        self.driver_cancel.cancel();
        if let Some(task) = self.mock_task.take() {
            let _ = task.await;
        }
    }

    /// Block until the pipeline terminates, normally or fatally. Multiple
    /// waiters all observe the first terminal event.
    pub async fn wait_terminated(&self) -> PipelineEvent {
        let mut rx = self.event_rx.clone();
        let event = match rx.wait_for(|event| event.is_some()).await {
            Ok(event) => event.clone().expect("checked by wait_for"),
            // The sender lives as long as self; closure means teardown raced
            // ahead of the waiter.
            Err(_) => PipelineEvent::EndOfStream,
        };
        event
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    pub fn state_handle(&self) -> PipelineStateHandle {
        PipelineStateHandle {
            inner: Arc::clone(&self.state),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

/// Upper bound on waiting for EOS to reach the bus during teardown.
#[cfg(any(test, all(feature = "camera", target_os = "linux")))]
const EOS_DRAIN_LIMIT: std::time::Duration = std::time::Duration::from_secs(5);

/// Wait, bounded, for the bus watcher to report a terminal event. Returns
/// true once one is in the channel; false on timeout. Completes immediately
/// when an earlier fatal error already signaled.
#[cfg(any(test, all(feature = "camera", target_os = "linux")))]
async fn drain_terminal_event(
    rx: &watch::Receiver<Option<PipelineEvent>>,
    limit: std::time::Duration,
) -> bool {
    let mut rx = rx.clone();
    let signaled = matches!(
        tokio::time::timeout(limit, rx.wait_for(|event| event.is_some())).await,
        Ok(Ok(_))
    );
    signaled
}

/// First terminal event wins; later ones are ignored.
fn notify(tx: &watch::Sender<Option<PipelineEvent>>, event: PipelineEvent) {
    if tx.borrow().is_none() {
        let _ = tx.send(Some(event));
    }
}

/// Tiny valid-prefix JPEG payload used by the mock driver.
#[cfg(not(all(feature = "camera", target_os = "linux")))]
const MOCK_JPEG: &[u8] = &[
    0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46, 0x00, 0x01, 0xFF, 0xD9,
];

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(recording_dir: PathBuf) -> PipelineConfig {
        PipelineConfig {
            width: 1920,
            height: 1080,
            framerate: 30,
            bitrate: 4_000_000,
            recording_dir,
            chunk_seconds: 60,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_drain_completes_once_bus_signals() {
        let (tx, rx) = watch::channel(None);

        let waiter =
            tokio::spawn(
                async move { drain_terminal_event(&rx, EOS_DRAIN_LIMIT).await },
            );

        // The bus reports end of stream shortly after EOS is injected.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tx.send(Some(PipelineEvent::EndOfStream)).unwrap();

        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_drain_gives_up_after_limit() {
        let (_tx, rx) = watch::channel::<Option<PipelineEvent>>(None);
        assert!(!drain_terminal_event(&rx, EOS_DRAIN_LIMIT).await);
    }

    #[tokio::test]
    async fn test_teardown_drain_sees_prior_fatal_error() {
        let (_tx, rx) = watch::channel(Some(PipelineEvent::FatalError("gone".to_string())));
        assert!(drain_terminal_event(&rx, EOS_DRAIN_LIMIT).await);
    }

    #[test]
    fn test_description_contains_all_three_branches() {
        let description = pipeline_description(&test_config(PathBuf::from("/data/rec")));
        assert!(description.contains("tee name=t"));
        assert!(description.contains("splitmuxsink location=/data/rec/evidence_%05d.mp4"));
        assert!(description.contains("max-size-time=60000000000"));
        assert_eq!(description.matches("queue leaky=downstream").count(), 2);
        assert!(description.contains("fakesink name=inference_sink"));
        assert!(description.contains("appsink name=preview_sink max-buffers=1 drop=true"));
        assert!(description.contains("width=1920,height=1080,framerate=30/1"));
    }

    #[cfg(not(all(feature = "camera", target_os = "linux")))]
    mod mock_driver {
        use super::*;
        use std::time::Duration;

        fn build_pipeline(dir: &std::path::Path, chunk_seconds: u32) -> CapturePipeline {
            let mut config = test_config(dir.to_path_buf());
            config.chunk_seconds = chunk_seconds;
            CapturePipeline::build(config, Arc::new(PreviewSlot::new())).unwrap()
        }

        #[tokio::test]
        async fn test_lifecycle_stopped_building_playing_stopped() {
            let dir = tempfile::tempdir().unwrap();
            let mut pipeline = build_pipeline(dir.path(), 60);
            assert_eq!(pipeline.state(), PipelineState::Building);

            pipeline.start().unwrap();
            assert_eq!(pipeline.state(), PipelineState::Playing);

            pipeline.stop().await;
            assert_eq!(pipeline.state(), PipelineState::Stopped);
        }

        #[tokio::test]
        async fn test_restart_of_consumed_instance_rejected() {
            let dir = tempfile::tempdir().unwrap();
            let mut pipeline = build_pipeline(dir.path(), 60);
            pipeline.start().unwrap();
            pipeline.stop().await;

            assert!(matches!(
                pipeline.start(),
                Err(PipelineError::InvalidState { .. })
            ));
            assert_eq!(pipeline.state(), PipelineState::Stopped);
        }

        #[tokio::test]
        async fn test_double_start_rejected() {
            let dir = tempfile::tempdir().unwrap();
            let mut pipeline = build_pipeline(dir.path(), 60);
            pipeline.start().unwrap();
            assert!(pipeline.start().is_err());
            pipeline.stop().await;
        }

        #[tokio::test]
        async fn test_fatal_error_only_reachable_from_playing() {
            let dir = tempfile::tempdir().unwrap();
            let pipeline = build_pipeline(dir.path(), 60);

            // Injected while Building: ignored.
            pipeline.simulate_bus_event(PipelineEvent::FatalError("boom".to_string()));
            assert_eq!(pipeline.state(), PipelineState::Building);
        }

        #[tokio::test]
        async fn test_fatal_error_releases_blocked_waiter() {
            let dir = tempfile::tempdir().unwrap();
            let mut pipeline = build_pipeline(dir.path(), 60);
            pipeline.start().unwrap();

            let handle = pipeline.state_handle();
            pipeline.simulate_bus_event(PipelineEvent::FatalError("encoder fault".to_string()));

            let event = pipeline.wait_terminated().await;
            assert_eq!(
                event,
                PipelineEvent::FatalError("encoder fault".to_string())
            );
            assert_eq!(handle.get(), PipelineState::Error);
        }

        #[tokio::test]
        async fn test_end_of_stream_transitions_to_stopped() {
            let dir = tempfile::tempdir().unwrap();
            let mut pipeline = build_pipeline(dir.path(), 60);
            pipeline.start().unwrap();

            pipeline.simulate_bus_event(PipelineEvent::EndOfStream);
            assert_eq!(pipeline.wait_terminated().await, PipelineEvent::EndOfStream);
            assert_eq!(pipeline.state(), PipelineState::Stopped);
        }

        #[tokio::test(start_paused = true)]
        async fn test_segment_rotation_matches_chunk_duration() {
            let dir = tempfile::tempdir().unwrap();
            let mut pipeline = build_pipeline(dir.path(), 1);
            pipeline.start().unwrap();

            // 3.2 chunk periods: expect floor(D/T) segments ±1 in-flight.
            tokio::time::sleep(Duration::from_millis(3200)).await;
            pipeline.stop().await;

            let segments = crate::evidence::list_segments(dir.path());
            assert!(
                (3..=4).contains(&segments.len()),
                "unexpected segment count: {:?}",
                segments
            );
            // Sequential suffixes, no gaps.
            for (i, name) in segments.iter().enumerate() {
                assert_eq!(name, &format!("evidence_{:05}.mp4", i));
            }
        }

        #[tokio::test(start_paused = true)]
        async fn test_preview_frames_flow_while_playing() {
            let dir = tempfile::tempdir().unwrap();
            let preview = Arc::new(PreviewSlot::new());
            let mut pipeline =
                CapturePipeline::build(test_config(dir.path().to_path_buf()), Arc::clone(&preview))
                    .unwrap();
            pipeline.start().unwrap();

            tokio::time::sleep(Duration::from_millis(500)).await;
            pipeline.stop().await;

            let frame = preview.latest().expect("preview frame published");
            assert_eq!(&frame.data[..2], &[0xFF, 0xD8]);
        }
    }
}
