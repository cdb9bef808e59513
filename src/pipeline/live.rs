//! Live detection for one connected client.
//!
//! A `LiveSession` reacts to control messages. With an open camera,
//! `detection_control: active` spawns a tokio task that owns the capture
//! handle and ticks at roughly 30 fps until it is told to stop or hits a
//! fault it cannot handle. Device reads run on the blocking pool under a
//! per-read timeout, and alerts are sent from detached tasks, so neither a
//! stalled camera nor a slow SMS gateway holds up the tick. Without a camera, detection runs on frames the
//! browser pushes. Each session has its own sequence window and alert
//! throttle; nothing is shared between sessions except the models.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::notify::{ClientMessage, ControlStatus, DetectionSummary, FrameDetection, Notification};
use crate::alert::{Alert, AlertDispatcher, AlertThrottle, DEFAULT_ALERT_COOLDOWN_SECS};
use crate::annotate::Annotator;
use crate::detect::{DetectionFusion, FrameAssessment, FusionSettings, ModelSet};
use crate::error::VigilError;
use crate::frame::Frame;
use crate::ingest::browser::{decode_data_url, encode_jpeg_base64};
use crate::ingest::{CameraConfig, CameraSource, CaptureGuard, FrameSource};

/// Timing and acceptance rules of the live loop.
#[derive(Clone, Debug, PartialEq)]
pub struct LiveSettings {
    /// Pause between ticks.
    pub tick: Duration,
    /// Reads tried per tick before a `frame_error` is reported.
    pub read_attempts: u32,
    pub retry_backoff: Duration,
    /// Longest wait for one device read. A read still blocked after this
    /// counts as a failed attempt.
    pub read_timeout: Duration,
    /// Frames whose mean brightness is below this are rejected as blank.
    pub min_brightness: f64,
    pub alert_cooldown_secs: f64,
    /// Draw overlays on frames sent back to the client.
    pub annotate_frames: bool,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(33),
            read_attempts: 3,
            retry_backoff: Duration::from_millis(100),
            read_timeout: Duration::from_secs(1),
            min_brightness: 10.0,
            alert_cooldown_secs: DEFAULT_ALERT_COOLDOWN_SECS,
            annotate_frames: true,
        }
    }
}

/// Builds an unopened capture source for a session.
pub type CameraFactory = Arc<dyn Fn() -> Box<dyn FrameSource> + Send + Sync>;

/// Everything a session needs, shared by all sessions of a server.
#[derive(Clone)]
pub struct LiveContext {
    pub models: ModelSet,
    pub fusion: FusionSettings,
    pub dispatcher: AlertDispatcher,
    pub annotator: Arc<Annotator>,
    pub settings: LiveSettings,
    camera: CameraFactory,
}

impl LiveContext {
    pub fn new(
        models: ModelSet,
        fusion: FusionSettings,
        dispatcher: AlertDispatcher,
        annotator: Arc<Annotator>,
        camera: CameraConfig,
    ) -> Self {
        Self {
            models,
            fusion,
            dispatcher,
            annotator,
            settings: LiveSettings::default(),
            camera: Arc::new(move || Box::new(CameraSource::new(camera.clone())) as Box<dyn FrameSource>),
        }
    }

    pub fn with_settings(mut self, settings: LiveSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replace the capture device with any frame source.
    pub fn with_camera_factory(
        mut self,
        factory: impl Fn() -> Box<dyn FrameSource> + Send + Sync + 'static,
    ) -> Self {
        self.camera = Arc::new(factory);
        self
    }
}

type PendingRead = JoinHandle<(CaptureGuard, Result<Option<Frame>>)>;

/// A capture handle read on the blocking pool.
///
/// A read that outlives its timeout is not abandoned: it stays pending and
/// the next `read` waits on it again, so at most one read is ever in flight.
pub struct LiveCapture {
    name: String,
    idle: Option<CaptureGuard>,
    pending: Option<PendingRead>,
}

impl LiveCapture {
    pub fn new(capture: CaptureGuard) -> Self {
        Self {
            name: capture.describe(),
            idle: Some(capture),
            pending: None,
        }
    }

    pub fn describe(&self) -> &str {
        &self.name
    }

    /// Next frame, or an error when none arrived within `timeout`.
    pub async fn read(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        let mut handle = match self.pending.take() {
            Some(handle) => handle,
            None => {
                let mut capture = self
                    .idle
                    .take()
                    .ok_or_else(|| anyhow!("capture {} already released", self.name))?;
                tokio::task::spawn_blocking(move || {
                    let read = capture.next_frame();
                    (capture, read)
                })
            }
        };
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok((capture, read))) => {
                self.idle = Some(capture);
                read
            }
            // A panicked read dropped, and so released, the capture.
            Ok(Err(err)) => Err(anyhow!("capture worker failed: {}", err)),
            Err(_) => {
                self.pending = Some(handle);
                Err(anyhow!(
                    "no frame from {} within {} ms",
                    self.name,
                    timeout.as_millis()
                ))
            }
        }
    }

    /// Give the device back. A capture stuck in a read is released by its
    /// worker when the read returns.
    pub fn release(&mut self) {
        if let Some(mut capture) = self.idle.take() {
            capture.release();
        }
        if self.pending.take().is_some() {
            log::warn!(
                "capture {} is still blocked in a read; it will be released when the read returns",
                self.name
            );
        }
    }
}

impl Drop for LiveCapture {
    fn drop(&mut self) {
        self.release();
    }
}

/// Result of one tick's read attempts.
#[derive(Debug)]
pub enum FrameRead {
    Frame(Frame),
    /// Every attempt failed or produced a blank frame.
    Exhausted(String),
    /// The capture reported end of stream.
    Ended,
    Stopped,
}

/// Read until a usable frame arrives, at most `read_attempts` times with
/// `retry_backoff` between attempts. `stop` is checked before every attempt.
pub async fn read_valid_frame(
    capture: &mut LiveCapture,
    settings: &LiveSettings,
    stop: &AtomicBool,
) -> FrameRead {
    let attempts = settings.read_attempts.max(1);
    let mut last_problem = String::new();
    for attempt in 1..=attempts {
        if stop.load(Ordering::SeqCst) {
            return FrameRead::Stopped;
        }
        match capture.read(settings.read_timeout).await {
            Ok(Some(frame)) => {
                let brightness = frame.mean_brightness();
                if brightness >= settings.min_brightness {
                    return FrameRead::Frame(frame);
                }
                last_problem = format!("blank frame (mean brightness {:.1})", brightness);
            }
            Ok(None) => return FrameRead::Ended,
            Err(err) => last_problem = format!("{err:#}"),
        }
        log::debug!("read attempt {}/{} failed: {}", attempt, attempts, last_problem);
        if attempt < attempts {
            tokio::time::sleep(settings.retry_backoff).await;
        }
    }
    FrameRead::Exhausted(last_problem)
}

/// How a camera loop ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoopExit {
    Stopped,
    Faulted(String),
}

struct SessionDetector {
    fusion: DetectionFusion,
    throttle: AlertThrottle,
}

struct TickOutcome {
    assessment: FrameAssessment,
    alert: Option<Alert>,
    /// Base64 JPEG of the frame to send back.
    encoded: Result<String>,
}

fn evaluate_frame(
    detector: &Mutex<SessionDetector>,
    annotator: &Annotator,
    frame: &Frame,
    annotate: bool,
) -> Result<TickOutcome, VigilError> {
    let (assessment, fire) = {
        let mut detector = detector.lock().unwrap_or_else(PoisonError::into_inner);
        let assessment = detector.fusion.evaluate(frame, None)?;
        let fire = detector
            .throttle
            .should_alert(assessment.is_dangerous(), crate::epoch_seconds());
        (assessment, fire)
    };
    let alert = if fire {
        Alert::from_assessment(&assessment)
    } else {
        None
    };
    let encoded = render(annotator, frame, &assessment, annotate);
    Ok(TickOutcome {
        assessment,
        alert,
        encoded,
    })
}

fn render(annotator: &Annotator, frame: &Frame, assessment: &FrameAssessment, annotate: bool) -> Result<String> {
    if annotate && assessment.is_dangerous() {
        encode_jpeg_base64(&annotator.annotate(frame, &assessment.events())?)
    } else {
        encode_jpeg_base64(frame)
    }
}

async fn evaluate_off_thread(
    detector: Arc<Mutex<SessionDetector>>,
    annotator: Arc<Annotator>,
    frame: Frame,
    annotate: bool,
) -> Result<Result<TickOutcome, VigilError>> {
    tokio::task::spawn_blocking(move || evaluate_frame(&detector, &annotator, &frame, annotate))
        .await
        .map_err(|e| anyhow!("frame worker failed: {}", e))
}

/// Send `alert` in the background; delivery never delays the next frame.
fn dispatch_alert(dispatcher: &AlertDispatcher, alert: Alert) {
    let dispatcher = dispatcher.clone();
    tokio::spawn(async move {
        let sent = tokio::task::spawn_blocking(move || dispatcher.dispatch(&alert, None)).await;
        match sent {
            Ok(Ok(_)) => {}
            // Already logged by the dispatcher.
            Ok(Err(_)) => {}
            Err(err) => log::error!("alert worker failed: {}", err),
        }
    });
}

async fn emit(tx: &mpsc::Sender<Notification>, note: Notification) -> Result<()> {
    tx.send(note)
        .await
        .map_err(|_| anyhow!("client channel closed"))
}

struct CameraLoop {
    ctx: LiveContext,
    detector: Arc<Mutex<SessionDetector>>,
    stop: Arc<AtomicBool>,
    tx: mpsc::Sender<Notification>,
}

impl CameraLoop {
    async fn run(self, capture: CaptureGuard) -> LoopExit {
        let mut capture = LiveCapture::new(capture);
        log::info!("live detection started on {}", capture.describe());
        let exit = match self.ticks(&mut capture).await {
            Ok(()) => LoopExit::Stopped,
            Err(err) => LoopExit::Faulted(format!("{err:#}")),
        };
        capture.release();
        match &exit {
            LoopExit::Stopped => log::info!("live detection stopped"),
            LoopExit::Faulted(reason) => {
                log::error!("live detection aborted: {}", reason);
                let _ = self.tx.send(Notification::DetectionStatus(ControlStatus::Error)).await;
                let _ = self.tx.send(Notification::CameraStatus(ControlStatus::Inactive)).await;
            }
        }
        exit
    }

    /// `Ok` on a stop request, `Err` on a fault the session cannot absorb.
    async fn ticks(&self, capture: &mut LiveCapture) -> Result<()> {
        let settings = &self.ctx.settings;
        let mut frame_num = 0u64;
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            let frame = match read_valid_frame(capture, settings, &self.stop).await {
                FrameRead::Frame(frame) => frame,
                FrameRead::Stopped => return Ok(()),
                FrameRead::Ended => bail!("capture {} ended", capture.describe()),
                FrameRead::Exhausted(problem) => {
                    let err = VigilError::TransientFrameFault(format!(
                        "no valid frame after {} attempts: {}",
                        settings.read_attempts, problem
                    ));
                    log::warn!("{}", err);
                    emit(
                        &self.tx,
                        Notification::FrameError {
                            error: err.to_string(),
                        },
                    )
                    .await?;
                    tokio::time::sleep(settings.tick).await;
                    continue;
                }
            };

            let outcome = evaluate_off_thread(
                self.detector.clone(),
                self.ctx.annotator.clone(),
                frame,
                settings.annotate_frames,
            )
            .await?;
            match outcome {
                Ok(outcome) => {
                    emit(
                        &self.tx,
                        Notification::DetectionData(DetectionSummary::from_assessment(&outcome.assessment)),
                    )
                    .await?;
                    if let Some(alert) = outcome.alert {
                        dispatch_alert(&self.ctx.dispatcher, alert);
                    }
                    let jpeg = outcome
                        .encoded
                        .map_err(|e| anyhow!("encode frame {}: {:#}", outcome.assessment.frame_index, e))?;
                    emit(
                        &self.tx,
                        Notification::VideoFrame {
                            frame: jpeg,
                            detection: FrameDetection::from(&outcome.assessment),
                            frame_num,
                        },
                    )
                    .await?;
                    frame_num += 1;
                }
                Err(err) if err.is_frame_local() => {
                    log::warn!("{}", err);
                    emit(
                        &self.tx,
                        Notification::DetectionError {
                            error: err.to_string(),
                        },
                    )
                    .await?;
                }
                Err(err) => return Err(err.into()),
            }
            tokio::time::sleep(settings.tick).await;
        }
    }
}

struct RunningLoop {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<LoopExit>,
}

/// Controller for one client connection.
pub struct LiveSession {
    ctx: LiveContext,
    tx: mpsc::Sender<Notification>,
    detector: Arc<Mutex<SessionDetector>>,
    camera: Option<CaptureGuard>,
    running: Option<RunningLoop>,
    browser_mode: bool,
    browser_frames: u64,
    started: Instant,
}

impl LiveSession {
    pub fn new(ctx: LiveContext, tx: mpsc::Sender<Notification>) -> Result<Self> {
        let fusion = DetectionFusion::new(ctx.models.clone(), ctx.fusion.clone())?;
        let throttle = AlertThrottle::new(ctx.settings.alert_cooldown_secs);
        Ok(Self {
            ctx,
            tx,
            detector: Arc::new(Mutex::new(SessionDetector { fusion, throttle })),
            camera: None,
            running: None,
            browser_mode: false,
            browser_frames: 0,
            started: Instant::now(),
        })
    }

    /// Camera loop running, or browser detection enabled.
    pub fn is_active(&self) -> bool {
        self.browser_mode || self.running.as_ref().is_some_and(|r| !r.handle.is_finished())
    }

    /// A capture device is held, by the session or by its running loop.
    pub fn camera_open(&self) -> bool {
        self.camera.is_some() || self.running.as_ref().is_some_and(|r| !r.handle.is_finished())
    }

    /// Greeting sent once the connection is up.
    pub async fn connect(&mut self) -> Result<()> {
        log::info!("live client connected");
        emit(&self.tx, Notification::connected()).await?;
        emit(&self.tx, Notification::CameraStatus(ControlStatus::Inactive)).await?;
        emit(&self.tx, Notification::DetectionStatus(ControlStatus::Inactive)).await
    }

    /// Apply one client message. `Err` only when the client is gone.
    pub async fn handle(&mut self, message: ClientMessage) -> Result<()> {
        self.reap().await;
        match message {
            ClientMessage::CameraControl(ControlStatus::Active) => self.start_camera().await,
            ClientMessage::CameraControl(_) => self.stop_camera().await,
            ClientMessage::DetectionControl(ControlStatus::Active) => self.start_detection().await,
            ClientMessage::DetectionControl(_) => self.stop_detection().await,
            ClientMessage::VideoFrame { frame } => self.browser_frame(frame).await,
        }
    }

    /// Stop all detection and give the camera back.
    pub async fn shutdown(&mut self) {
        self.stop_loop().await;
        self.browser_mode = false;
        if let Some(mut camera) = self.camera.take() {
            camera.release();
        }
        log::info!("live client disconnected");
    }

    async fn start_camera(&mut self) -> Result<()> {
        if self.camera_open() {
            return emit(&self.tx, Notification::CameraStatus(ControlStatus::Active)).await;
        }
        let factory = self.ctx.camera.clone();
        let opened = tokio::task::spawn_blocking(move || {
            let mut source = factory();
            let name = source.describe();
            match source.open() {
                Ok(info) => Ok((source, info)),
                Err(err) => Err(VigilError::source_unavailable(name, err)),
            }
        })
        .await;
        let status = match opened {
            Ok(Ok((source, info))) => {
                log::info!(
                    "camera {} ready ({}x{} @ {:.0} fps)",
                    source.describe(),
                    info.width,
                    info.height,
                    info.effective_fps()
                );
                self.camera = Some(CaptureGuard::new(source));
                ControlStatus::Active
            }
            Ok(Err(err)) => {
                log::error!("{}", err);
                ControlStatus::Error
            }
            Err(err) => {
                log::error!("camera open worker failed: {}", err);
                ControlStatus::Error
            }
        };
        emit(&self.tx, Notification::CameraStatus(status)).await
    }

    async fn stop_camera(&mut self) -> Result<()> {
        let was_detecting = self.stop_loop().await;
        if let Some(mut camera) = self.camera.take() {
            camera.release();
        }
        emit(&self.tx, Notification::CameraStatus(ControlStatus::Inactive)).await?;
        if was_detecting {
            emit(&self.tx, Notification::DetectionStatus(ControlStatus::Inactive)).await?;
        }
        Ok(())
    }

    async fn start_detection(&mut self) -> Result<()> {
        if self.is_active() {
            return emit(&self.tx, Notification::DetectionStatus(ControlStatus::Active)).await;
        }
        match self.camera.take() {
            Some(capture) => {
                let stop = Arc::new(AtomicBool::new(false));
                let camera_loop = CameraLoop {
                    ctx: self.ctx.clone(),
                    detector: self.detector.clone(),
                    stop: stop.clone(),
                    tx: self.tx.clone(),
                };
                let handle = tokio::spawn(camera_loop.run(capture));
                self.running = Some(RunningLoop { stop, handle });
            }
            None => {
                log::info!("no camera open; detecting on browser frames");
                self.browser_mode = true;
            }
        }
        emit(&self.tx, Notification::DetectionStatus(ControlStatus::Active)).await
    }

    async fn stop_detection(&mut self) -> Result<()> {
        let camera_released = self.stop_loop().await;
        self.browser_mode = false;
        emit(&self.tx, Notification::DetectionStatus(ControlStatus::Inactive)).await?;
        if camera_released {
            emit(&self.tx, Notification::CameraStatus(ControlStatus::Inactive)).await?;
        }
        Ok(())
    }

    async fn browser_frame(&mut self, data_url: String) -> Result<()> {
        if !self.browser_mode {
            log::debug!("browser frame ignored: browser detection inactive");
            return Ok(());
        }
        let index = self.browser_frames;
        self.browser_frames += 1;
        let timestamp = self.started.elapsed().as_secs_f64();
        let detector = self.detector.clone();
        let annotator = self.ctx.annotator.clone();
        let annotate = self.ctx.settings.annotate_frames;

        let outcome = tokio::task::spawn_blocking(move || {
            let frame = match decode_data_url(&data_url, index, timestamp) {
                Ok(frame) => frame,
                Err(err) => {
                    log::debug!("dropping undecodable browser frame {}: {:#}", index, err);
                    return None;
                }
            };
            Some(evaluate_frame(&detector, &annotator, &frame, annotate))
        })
        .await;

        let outcome = match outcome {
            Ok(Some(Ok(outcome))) => outcome,
            Ok(Some(Err(err))) => {
                log::warn!("{}", err);
                return emit(
                    &self.tx,
                    Notification::DetectionError {
                        error: err.to_string(),
                    },
                )
                .await;
            }
            Ok(None) => return Ok(()),
            Err(err) => {
                log::error!("browser frame worker failed: {}", err);
                return Ok(());
            }
        };

        emit(
            &self.tx,
            Notification::DetectionData(DetectionSummary::from_assessment(&outcome.assessment)),
        )
        .await?;
        if let Some(alert) = outcome.alert {
            dispatch_alert(&self.ctx.dispatcher, alert);
        }
        match outcome.encoded {
            Ok(frame) => emit(&self.tx, Notification::VideoFrameProcessed { frame }).await,
            Err(err) => {
                log::warn!("could not encode processed browser frame {}: {:#}", index, err);
                Ok(())
            }
        }
    }

    /// Stop the camera loop if there is one. True when a loop existed.
    async fn stop_loop(&mut self) -> bool {
        let Some(running) = self.running.take() else {
            return false;
        };
        running.stop.store(true, Ordering::SeqCst);
        match running.handle.await {
            Ok(exit) => log::debug!("camera loop joined: {:?}", exit),
            Err(err) => log::error!("camera loop task failed: {}", err),
        }
        true
    }

    /// Forget a loop that ended on its own; it already told the client.
    async fn reap(&mut self) {
        if self.running.as_ref().is_some_and(|r| r.handle.is_finished()) {
            self.stop_loop().await;
        }
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.stop.store(true, Ordering::SeqCst);
        }
    }
}
