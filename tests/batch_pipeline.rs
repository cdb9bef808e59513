use anyhow::Result;

use vigilant_eye::detect::{EventKind, ModelCapability};
use vigilant_eye::pipeline::BatchState;
use vigilant_eye::sink::{FrameSink, NullSink};
use vigilant_eye::transcode::Transcoder;
use vigilant_eye::{
    Annotator, BatchProcessor, BatchReport, DetectionFusion, FileSource, FusionSettings, ModelSet,
    ModelSettings, Stage, VigilError,
};

fn models(violence: Option<&str>, weapons: Option<&str>) -> ModelSet {
    ModelSet::load(&ModelSettings {
        violence_model: violence.map(str::to_string),
        weapon_model: weapons.map(str::to_string),
        ..ModelSettings::default()
    })
}

fn scan(input: &str, models: ModelSet) -> Result<BatchReport, VigilError> {
    let annotator = Annotator::new();
    let fusion = DetectionFusion::new(models, FusionSettings::default()).expect("fusion");
    let mut source = FileSource::new(input).expect("local path");
    let report = BatchProcessor::new(fusion, &annotator).run(&mut source, |info| {
        Ok(Box::new(NullSink::new(*info)) as Box<dyn FrameSink>)
    });
    report
}

/// Stand-in encoder that copies the piped frames to its last argument.
#[cfg(unix)]
fn fake_ffmpeg(dir: &std::path::Path) -> Result<std::path::PathBuf> {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("fake-ffmpeg");
    std::fs::write(&path, "#!/bin/sh\nfor last; do :; done\nexec cat > \"$last\"\n")?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

#[test]
fn violent_clip_reports_events_once_window_fills() -> Result<()> {
    let models = models(Some("stub://violence?probs=0.9,0.1&frames=4&edge=8"), None);

    let report = scan("stub://clip?frames=12&fps=25&width=32&height=24", models)?;

    assert_eq!(report.frames_processed, 12);
    assert_eq!(report.events.len(), 9);
    assert!(report.events.iter().all(|e| e.kind() == EventKind::Violence));
    assert_eq!(report.events[0].frame_index(), 3);
    let records = report.records();
    assert_eq!(records[0].timestamp, "0.12s");
    assert!(records[0].coordinates.is_none());
    assert_eq!(report.sink.frames_written, 12);
    assert_eq!(report.sink.fps, 25.0);
    Ok(())
}

#[cfg(unix)]
#[test]
fn annotated_frames_stream_into_the_encoder_without_intermediates() -> Result<()> {
    let work = tempfile::tempdir()?;
    let out_dir = tempfile::tempdir()?;
    // An output whose name looks like raw video must still be the only file written.
    let out = out_dir.path().join("scan.rgb");
    let transcoder = Transcoder::new(fake_ffmpeg(work.path())?);
    let annotator = Annotator::new();
    let fusion = DetectionFusion::new(
        models(Some("stub://violence?probs=0.9,0.1&frames=4&edge=8"), None),
        FusionSettings::default(),
    )?;
    let mut source = FileSource::new("stub://clip?frames=12&fps=25&width=32&height=24")?;

    let report = BatchProcessor::new(fusion, &annotator).run(&mut source, |info| {
        Ok(Box::new(transcoder.start(info, &out)?) as Box<dyn FrameSink>)
    })?;

    assert_eq!(report.sink.frames_written, 12);
    assert_eq!(report.sink.path.as_deref(), Some(out.as_path()));
    assert_eq!(std::fs::metadata(&out)?.len(), 12 * 32 * 24 * 3);
    let written: Vec<_> = std::fs::read_dir(out_dir.path())?.collect::<std::io::Result<_>>()?;
    assert_eq!(written.len(), 1);
    Ok(())
}

#[test]
fn missing_encoder_fails_at_convert() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let out = dir.path().join("clip.mp4");
    let transcoder = Transcoder::new(dir.path().join("no-such-ffmpeg"));
    let annotator = Annotator::new();
    let fusion = DetectionFusion::new(ModelSet::new(), FusionSettings::default())?;
    let mut source = FileSource::new("stub://clip?frames=2&width=16&height=16")?;

    let err = BatchProcessor::new(fusion, &annotator)
        .run(&mut source, |info| {
            Ok(Box::new(transcoder.start(info, &out)?) as Box<dyn FrameSink>)
        })
        .unwrap_err();

    assert_eq!(err.stage(), Stage::Convert);
    assert!(!out.exists());
    Ok(())
}

#[test]
fn weapon_boxes_carry_coordinates_and_frame_time() -> Result<()> {
    let models = models(
        None,
        Some("stub://weapons?boxes=4.7,3.2,20.9,18.1,0.82,1;1,1,5,5,0.95,0;2,2,6,6,0.5,1"),
    );

    let report = scan("stub://clip?frames=3&fps=10&width=32&height=24", models)?;

    assert_eq!(report.events.len(), 3);
    let records = report.records();
    assert!(records.iter().all(|r| r.coordinates == Some([4, 3, 20, 18])));
    assert_eq!(records[2].timestamp, "0.20s");
    let serialized = serde_json::to_value(&records[0])?;
    assert_eq!(serialized["type"], "weapon");
    assert_eq!(serialized["frame"], 0);
    Ok(())
}

#[test]
fn empty_clip_is_an_empty_result() -> Result<()> {
    let models = models(Some("stub://violence?probs=0.9,0.1&frames=4&edge=8"), None);

    let report = scan("stub://clip?frames=0", models)?;

    assert!(report.events.is_empty());
    assert_eq!(report.frames_processed, 0);
    assert_eq!(report.sink.frames_written, 0);
    assert!(report.alert().is_none());
    Ok(())
}

#[test]
fn unreadable_source_is_fatal() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let annotator = Annotator::new();
    let fusion = DetectionFusion::new(ModelSet::new(), FusionSettings::default())?;
    let mut source = FileSource::new("stub://missing")?;
    let mut batch = BatchProcessor::new(fusion, &annotator);
    let out = dir.path().join("out.mp4");
    let transcoder = Transcoder::new("ffmpeg");

    let err = batch
        .run(&mut source, |info| {
            Ok(Box::new(transcoder.start(info, &out)?) as Box<dyn FrameSink>)
        })
        .unwrap_err();

    assert!(matches!(err, VigilError::SourceUnavailable { .. }));
    assert_eq!(err.stage(), Stage::Open);
    assert_eq!(batch.state(), BatchState::Failed);
    assert!(!dir.path().join("out.mp4").exists());
    Ok(())
}

#[test]
fn unavailable_model_disables_only_its_path() -> Result<()> {
    let models = models(
        Some("stub://unavailable"),
        Some("stub://weapons?boxes=1,1,9,9,0.9,1"),
    );
    assert!(!models.is_available(ModelCapability::ViolenceClassifier));
    assert!(models.is_available(ModelCapability::WeaponDetector));
    assert_eq!(models.unavailable().len(), 1);

    let report = scan("stub://clip?frames=2&width=16&height=16", models)?;

    assert_eq!(report.events.len(), 2);
    assert!(report.weapons_detected());
    assert!(!report.violence_detected());
    Ok(())
}
