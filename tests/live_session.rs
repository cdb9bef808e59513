use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use vigilant_eye::alert::{AlertDispatcher, AlertGateway, RecordingGateway};
use vigilant_eye::detect::{StubClassifier, StubDetector};
use vigilant_eye::ingest::browser::encode_jpeg_base64;
use vigilant_eye::ingest::{CameraConfig, FrameSource, ScriptedSource, SourceStep};
use vigilant_eye::pipeline::{
    ClientMessage, ControlStatus, LiveContext, LiveSession, LiveSettings, Notification,
};
use vigilant_eye::{Annotator, Frame, FusionSettings, ModelSet, PixelOrder};

const PHONE: &str = "+15550100";

fn bright(index: u64) -> Frame {
    Frame::new(vec![120u8; 8 * 8 * 3], 8, 8, PixelOrder::Bgr, index as f64 / 30.0, index)
        .expect("frame")
}

fn violent_models() -> ModelSet {
    ModelSet::new().with_violence(Arc::new(
        StubClassifier::constant(vec![0.9, 0.1])
            .with_sequence_len(2)
            .with_edge(8),
    ))
}

fn fast() -> LiveSettings {
    LiveSettings {
        tick: Duration::from_millis(1),
        retry_backoff: Duration::from_millis(1),
        ..LiveSettings::default()
    }
}

/// Records like `RecordingGateway` but takes `delay` to deliver.
struct SlowGateway {
    inner: Arc<RecordingGateway>,
    delay: Duration,
}

impl AlertGateway for SlowGateway {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn send(&self, destination: &str, body: &str) -> anyhow::Result<String> {
        std::thread::sleep(self.delay);
        self.inner.send(destination, body)
    }
}

/// Alerts are delivered in the background; wait until `n` have landed.
async fn sent_eventually(gateway: &RecordingGateway, n: usize) -> Vec<(String, String)> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while gateway.sent().len() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {n} alerts"));
    gateway.sent()
}

struct Harness {
    session: LiveSession,
    seen: Arc<Mutex<Vec<Notification>>>,
    collector: JoinHandle<()>,
    gateway: Arc<RecordingGateway>,
}

impl Harness {
    fn new(models: ModelSet, camera: Option<ScriptedSource>) -> Self {
        Self::with(models, camera, fast(), Duration::ZERO)
    }

    fn with(
        models: ModelSet,
        camera: Option<ScriptedSource>,
        settings: LiveSettings,
        alert_delay: Duration,
    ) -> Self {
        let gateway = Arc::new(RecordingGateway::new());
        let slow = Arc::new(SlowGateway {
            inner: gateway.clone(),
            delay: alert_delay,
        });
        let dispatcher = AlertDispatcher::new(slow, Some(PHONE.to_string()));
        let slot = Mutex::new(camera);
        let ctx = LiveContext::new(
            models,
            FusionSettings::default(),
            dispatcher,
            Arc::new(Annotator::new()),
            CameraConfig::default(),
        )
        .with_settings(settings)
        .with_camera_factory(move || {
            let source = slot
                .lock()
                .expect("camera slot")
                .take()
                .unwrap_or_else(|| ScriptedSource::unopenable("camera already taken"));
            Box::new(source) as Box<dyn FrameSource>
        });

        let (tx, mut rx) = mpsc::channel(32);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let collector = tokio::spawn(async move {
            while let Some(note) = rx.recv().await {
                sink.lock().expect("seen").push(note);
            }
        });
        Self {
            session: LiveSession::new(ctx, tx).expect("session"),
            seen,
            collector,
            gateway,
        }
    }

    async fn send(&mut self, message: ClientMessage) {
        self.session.handle(message).await.expect("client connected");
    }

    fn count(&self, event: &str) -> usize {
        self.seen
            .lock()
            .expect("seen")
            .iter()
            .filter(|n| n.event_name() == event)
            .count()
    }

    async fn wait_for(&self, event: &str, at_least: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.count(event) < at_least {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {at_least} {event}"));
    }

    /// Disconnect and return everything the client received.
    async fn finish(mut self) -> (Vec<Notification>, Arc<RecordingGateway>) {
        self.session.shutdown().await;
        drop(self.session);
        self.collector.await.expect("collector");
        let seen = self.seen.lock().expect("seen").clone();
        (seen, self.gateway)
    }
}

fn names(seen: &[Notification]) -> Vec<&'static str> {
    seen.iter().map(Notification::event_name).collect()
}

#[tokio::test]
async fn camera_loop_survives_read_faults_and_stops_cleanly() {
    let mut steps = vec![
        SourceStep::Fault("select timeout".into()),
        SourceStep::Fault("select timeout".into()),
        SourceStep::Fault("select timeout".into()),
    ];
    steps.extend((0..10_000).map(|i| SourceStep::Frame(bright(i))));
    let source = ScriptedSource::new(steps);
    let releases = source.release_counter();

    let mut h = Harness::new(violent_models(), Some(source));
    h.session.connect().await.expect("connect");
    h.send(ClientMessage::CameraControl(ControlStatus::Active)).await;
    assert!(h.session.camera_open());
    h.send(ClientMessage::DetectionControl(ControlStatus::Active)).await;
    assert!(h.session.is_active());

    h.wait_for("video_frame", 3).await;
    h.send(ClientMessage::DetectionControl(ControlStatus::Inactive)).await;
    assert!(!h.session.is_active());
    assert!(!h.session.camera_open());
    assert_eq!(releases.load(Ordering::SeqCst), 1);

    let (seen, gateway) = h.finish().await;
    let names = names(&seen);
    assert_eq!(
        &names[..3],
        &["connection_status", "camera_status", "detection_status"]
    );

    let frame_errors: Vec<_> = seen
        .iter()
        .filter_map(|n| match n {
            Notification::FrameError { error } => Some(error.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(frame_errors.len(), 1);
    assert!(frame_errors[0].contains("no valid frame after 3 attempts"));
    let first_error = names.iter().position(|n| *n == "frame_error").expect("frame_error");
    let first_frame = names.iter().position(|n| *n == "video_frame").expect("video_frame");
    assert!(first_error < first_frame);

    assert!(!seen.contains(&Notification::DetectionStatus(ControlStatus::Error)));
    assert!(seen.ends_with(&[
        Notification::DetectionStatus(ControlStatus::Inactive),
        Notification::CameraStatus(ControlStatus::Inactive),
    ]));

    let violent_frames = seen
        .iter()
        .filter(|n| matches!(n, Notification::VideoFrame { detection, .. } if detection.violence_detected))
        .count();
    assert!(violent_frames >= 1);
    let sent = sent_eventually(&gateway, 1).await;
    assert_eq!(sent.len(), 1, "cooldown allows one alert per minute");
    assert_eq!(sent[0].0, PHONE);
    assert!(sent[0].1.contains("VIOLENCE"));
    assert_eq!(releases.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn capture_end_aborts_the_loop() {
    let source = ScriptedSource::new(vec![
        SourceStep::Frame(bright(0)),
        SourceStep::Frame(bright(1)),
        SourceStep::End,
    ]);
    let releases = source.release_counter();

    let mut h = Harness::new(ModelSet::new(), Some(source));
    h.send(ClientMessage::CameraControl(ControlStatus::Active)).await;
    h.send(ClientMessage::DetectionControl(ControlStatus::Active)).await;
    h.wait_for("video_frame", 2).await;
    h.wait_for("camera_status", 2).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.session.is_active() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("loop finished");
    assert_eq!(releases.load(Ordering::SeqCst), 1);

    let (seen, gateway) = h.finish().await;
    assert!(seen.ends_with(&[
        Notification::DetectionStatus(ControlStatus::Error),
        Notification::CameraStatus(ControlStatus::Inactive),
    ]));
    assert!(gateway.sent().is_empty());
    assert_eq!(releases.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unopenable_camera_reports_error() {
    let mut h = Harness::new(
        ModelSet::new(),
        Some(ScriptedSource::unopenable("device busy")),
    );
    h.send(ClientMessage::CameraControl(ControlStatus::Active)).await;
    assert!(!h.session.camera_open());

    let (seen, _) = h.finish().await;
    assert_eq!(seen, vec![Notification::CameraStatus(ControlStatus::Error)]);
}

#[tokio::test]
async fn browser_frames_are_detected_without_a_camera() {
    let weapons = StubDetector::from_url(
        &url::Url::parse("stub://weapons?boxes=1,1,6,6,0.9,1").expect("url"),
    )
    .expect("stub detector");
    let models = ModelSet::new().with_weapons(Arc::new(weapons));
    let mut h = Harness::new(models, None);
    let data_url = format!(
        "data:image/jpeg;base64,{}",
        encode_jpeg_base64(&bright(0)).expect("jpeg")
    );

    // Ignored until detection is enabled.
    h.send(ClientMessage::VideoFrame {
        frame: data_url.clone(),
    })
    .await;
    h.send(ClientMessage::DetectionControl(ControlStatus::Active)).await;
    assert!(h.session.is_active());
    assert!(!h.session.camera_open());
    h.send(ClientMessage::VideoFrame { frame: data_url }).await;
    h.send(ClientMessage::VideoFrame {
        frame: "data:image/jpeg;base64,bm90IGEganBlZw==".to_string(),
    })
    .await;
    h.send(ClientMessage::DetectionControl(ControlStatus::Inactive)).await;

    let (seen, gateway) = h.finish().await;
    assert_eq!(
        names(&seen),
        vec![
            "detection_status",
            "detection_data",
            "video_frame_processed",
            "detection_status",
        ]
    );
    match &seen[1] {
        Notification::DetectionData(summary) => {
            assert!(summary.weapons_detected);
            assert!(!summary.violence_detected);
            assert_eq!(summary.boxes.len(), 1);
            assert_eq!(summary.frame_index, 0);
        }
        other => panic!("unexpected {other:?}"),
    }
    let sent = sent_eventually(&gateway, 1).await;
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.contains("WEAPON"));
}

#[tokio::test]
async fn disconnect_releases_running_camera() {
    let source = ScriptedSource::new((0..10_000).map(|i| SourceStep::Frame(bright(i))).collect());
    let releases = source.release_counter();
    let reads = source.read_counter();

    let mut h = Harness::new(ModelSet::new(), Some(source));
    h.send(ClientMessage::CameraControl(ControlStatus::Active)).await;
    h.send(ClientMessage::DetectionControl(ControlStatus::Active)).await;
    h.wait_for("video_frame", 1).await;
    let (_, _) = h.finish().await;

    assert_eq!(releases.load(Ordering::SeqCst), 1);
    let after = reads.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(reads.load(Ordering::SeqCst), after);
}

#[tokio::test]
async fn stalled_camera_read_reports_frame_error_and_frames_resume() {
    let mut steps = vec![
        SourceStep::Frame(bright(0)),
        SourceStep::Stall(Duration::from_millis(300)),
    ];
    steps.extend((1..10_000).map(|i| SourceStep::Frame(bright(i))));
    let source = ScriptedSource::new(steps);
    let releases = source.release_counter();
    let settings = LiveSettings {
        read_timeout: Duration::from_millis(20),
        ..fast()
    };

    let mut h = Harness::with(ModelSet::new(), Some(source), settings, Duration::ZERO);
    h.send(ClientMessage::CameraControl(ControlStatus::Active)).await;
    h.send(ClientMessage::DetectionControl(ControlStatus::Active)).await;
    h.wait_for("frame_error", 1).await;
    h.wait_for("video_frame", 3).await;
    h.send(ClientMessage::DetectionControl(ControlStatus::Inactive)).await;
    assert_eq!(releases.load(Ordering::SeqCst), 1);

    let (seen, _) = h.finish().await;
    let error = seen
        .iter()
        .find_map(|n| match n {
            Notification::FrameError { error } => Some(error.clone()),
            _ => None,
        })
        .expect("frame_error");
    assert!(error.contains("within 20 ms"), "{error}");
}

#[tokio::test]
async fn stop_returns_while_the_camera_is_stuck_in_a_read() {
    let source = ScriptedSource::new(vec![
        SourceStep::Frame(bright(0)),
        SourceStep::Stall(Duration::from_millis(1500)),
        SourceStep::Frame(bright(1)),
    ]);
    let releases = source.release_counter();
    let settings = LiveSettings {
        read_timeout: Duration::from_millis(20),
        ..fast()
    };

    let mut h = Harness::with(ModelSet::new(), Some(source), settings, Duration::ZERO);
    h.send(ClientMessage::CameraControl(ControlStatus::Active)).await;
    h.send(ClientMessage::DetectionControl(ControlStatus::Active)).await;
    h.wait_for("video_frame", 1).await;

    // Other tasks on this runtime keep running while the device is blocked.
    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = ticks.clone();
    let ticker = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(5)).await;
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    tokio::time::sleep(Duration::from_millis(150)).await;
    ticker.abort();
    assert!(ticks.load(Ordering::SeqCst) >= 5);

    let started = Instant::now();
    tokio::time::timeout(
        Duration::from_millis(750),
        h.send(ClientMessage::DetectionControl(ControlStatus::Inactive)),
    )
    .await
    .expect("stop returned");
    assert!(started.elapsed() < Duration::from_millis(750));
    assert!(!h.session.is_active());
    assert!(!h.session.camera_open());

    let (seen, _) = h.finish().await;
    assert!(seen.ends_with(&[
        Notification::DetectionStatus(ControlStatus::Inactive),
        Notification::CameraStatus(ControlStatus::Inactive),
    ]));
    tokio::time::timeout(Duration::from_secs(5), async {
        while releases.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("camera released once the read returned");
    assert_eq!(releases.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn slow_alert_delivery_does_not_hold_up_frames() {
    let source = ScriptedSource::new((0..10_000).map(|i| SourceStep::Frame(bright(i))).collect());
    let mut h = Harness::with(violent_models(), Some(source), fast(), Duration::from_secs(2));
    h.send(ClientMessage::CameraControl(ControlStatus::Active)).await;
    h.send(ClientMessage::DetectionControl(ControlStatus::Active)).await;

    tokio::time::timeout(Duration::from_secs(1), h.wait_for("video_frame", 20))
        .await
        .expect("frames kept flowing while the alert was in flight");
    assert!(h.gateway.sent().is_empty());

    let sent = sent_eventually(&h.gateway, 1).await;
    assert!(sent[0].1.contains("VIOLENCE"));
    let (_, gateway) = h.finish().await;
    assert_eq!(gateway.sent().len(), 1);
}
