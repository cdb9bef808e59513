//! vigil_scan - Scan one video file for violence and weapons.
//!
//! Runs the same batch session the server runs for uploads:
//! - every frame goes through both detectors
//! - detections are printed (or emitted as JSON with `--json`)
//! - with `--out`, annotated frames are piped to ffmpeg and encoded to MP4
//!   as the scan runs
//! - with `--alert`, one SMS alert is sent when anything was detected
//!
//! Ctrl-C stops at the next frame boundary and keeps partial results.

use anyhow::{anyhow, Result};
use clap::Parser;
use serde_json::json;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use vigilant_eye::alert::{AlertDispatcher, AlertGateway, LogGateway, TwilioGateway};
use vigilant_eye::config::VigilConfig;
use vigilant_eye::media::TempFiles;
use vigilant_eye::sink::{FrameSink, NullSink};
use vigilant_eye::transcode::Transcoder;
use vigilant_eye::ui::{Ui, UiMode};
use vigilant_eye::{Annotator, BatchProcessor, DetectionFusion, FileSource, ModelSet};

#[derive(Parser, Debug)]
#[command(
    name = "vigil_scan",
    about = "Scan a video file for violence and weapons"
)]
struct Args {
    /// Video file to scan (or a stub://clip source)
    #[arg(value_name = "INPUT")]
    input: String,

    /// Write an annotated MP4 here (requires ffmpeg)
    #[arg(long, value_name = "PATH")]
    out: Option<PathBuf>,

    /// Violence classifier model (overrides VIGIL_VIOLENCE_MODEL)
    #[arg(long, value_name = "PATH")]
    violence_model: Option<String>,

    /// Weapon detector model (overrides VIGIL_WEAPON_MODEL)
    #[arg(long, value_name = "PATH")]
    weapon_model: Option<String>,

    /// TTF/OTF font for overlay labels
    #[arg(long, value_name = "PATH")]
    font: Option<PathBuf>,

    /// Send an alert when anything is detected
    #[arg(long)]
    alert: bool,

    /// Alert destination (defaults to DEFAULT_ALERT_PHONE)
    #[arg(long, value_name = "NUMBER", requires = "alert")]
    phone: Option<String>,

    /// Print results as JSON on stdout
    #[arg(long)]
    json: bool,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let ui = Ui::new(UiMode::parse(Some(&args.ui)), is_tty, args.json);

    let mut cfg = VigilConfig::load()?;
    if let Some(model) = args.violence_model.clone() {
        cfg.models.violence_model = Some(model);
    }
    if let Some(model) = args.weapon_model.clone() {
        cfg.models.weapon_model = Some(model);
    }
    if let Some(font) = args.font.clone() {
        cfg.font_path = Some(font);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .map_err(|e| anyhow!("failed to set Ctrl-C handler: {}", e))?;

    let models = {
        let _stage = ui.stage("Load models");
        let models = ModelSet::load(&cfg.models);
        models.warm_up();
        models
    };
    for (capability, reason) in models.unavailable() {
        if !args.json {
            eprintln!("warning: {} disabled ({})", capability, reason);
        }
    }
    let annotator = Annotator::from_optional_font(cfg.font_path.as_deref());
    let fusion = DetectionFusion::new(models, cfg.fusion.clone())?;

    // A failed or interrupted encode must not leave a truncated file behind.
    let mut temp = TempFiles::new();
    if let Some(out) = &args.out {
        temp.track(out);
    }
    let transcoder = Transcoder::new(&cfg.ffmpeg).with_timeout(cfg.transcode_timeout);

    let report = {
        let _stage = ui.stage("Scan frames");
        let mut source = FileSource::new(args.input.clone())?;
        let mut progress = None;
        let out = args.out.as_deref();
        let transcoder = &transcoder;
        let result = BatchProcessor::new(fusion, &annotator)
            .with_stop_flag(stop)
            .with_progress(|done, total| {
                progress.get_or_insert_with(|| ui.frames(total)).set(done);
            })
            .run(&mut source, |info| {
                let sink: Box<dyn FrameSink> = match out {
                    Some(path) => Box::new(transcoder.start(info, path)?),
                    None => Box::new(NullSink::new(*info)),
                };
                Ok(sink)
            });
        if let Some(bar) = &progress {
            bar.finish();
        }
        result?
    };
    if let Some(out) = &args.out {
        temp.keep(out);
    }

    if args.alert {
        let _stage = ui.stage("Send alert");
        match report.alert() {
            Some(alert) => {
                let gateway: Arc<dyn AlertGateway> = match cfg.twilio.clone() {
                    Some(twilio) => Arc::new(TwilioGateway::new(twilio)),
                    None => Arc::new(LogGateway),
                };
                let dispatcher = AlertDispatcher::new(gateway, cfg.default_alert_phone.clone());
                let file_name = std::path::Path::new(&args.input)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| args.input.clone());
                if let Err(err) = dispatcher.dispatch(&alert.with_file(file_name), args.phone.as_deref()) {
                    eprintln!("warning: {}", err);
                }
            }
            None => log::info!("nothing detected; no alert sent"),
        }
    }

    if args.json {
        let summary = json!({
            "input": args.input,
            "frames_processed": report.frames_processed,
            "fps": report.stream.effective_fps(),
            "stopped_early": report.stopped_early,
            "read_fault": report.read_fault,
            "violence_detected": report.violence_detected(),
            "weapons_detected": report.weapons_detected(),
            "detection_results": report.records(),
            "output": args.out,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!(
        "vigil_scan: {} frames from {} ({}x{} @ {:.2} fps)",
        report.frames_processed,
        args.input,
        report.stream.width,
        report.stream.height,
        report.stream.effective_fps()
    );
    if report.stopped_early {
        println!("stopped early on request; results are partial");
    }
    if let Some(fault) = &report.read_fault {
        println!("read error ended the scan early: {}", fault);
    }
    if report.events.is_empty() {
        println!("no violence or weapons detected");
    }
    for record in report.records() {
        match record.coordinates {
            Some([x1, y1, x2, y2]) => println!(
                "  {:>8}  frame {:>6}  {:?}  {:.1}%  box ({}, {}) - ({}, {})",
                record.timestamp,
                record.frame,
                record.kind,
                record.confidence * 100.0,
                x1,
                y1,
                x2,
                y2
            ),
            None => println!(
                "  {:>8}  frame {:>6}  {:?}  {:.1}%",
                record.timestamp,
                record.frame,
                record.kind,
                record.confidence * 100.0
            ),
        }
    }
    if let Some(out) = &args.out {
        println!("annotated video written to {}", out.display());
    }
    Ok(())
}
