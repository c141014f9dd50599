use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use touch_vision::config;
use touch_vision::device::AdbChannel;
use touch_vision::gesture::{synthesize_path, synthesize_tap};
use touch_vision::logging;
use touch_vision::oracle::{Expectation, Oracle, content_signals};
use touch_vision::region::{Point, Region};
use touch_vision::runner::{FanoutReporter, JsonlReporter, LogReporter, RunState, RunSummary};
use touch_vision::session::{Session, cleanup_old_sessions, list_sessions};
use touch_vision::snapshot::{Frame, MockFramebuffer};
use touch_vision::workflow::{CancellationFlag, Orchestrator, RunContext, Workflow};

/// Touch Vision - perceptual UI automation for touchscreen devices
#[derive(Parser, Debug)]
#[command(
    name = "touch-vision",
    about = "Drive touchscreen devices through multi-step workflows using only pixels and synthetic touches",
    after_help = "ENVIRONMENT VARIABLES:\n\
        TOUCH_VISION_ADB_PATH            adb executable\n\
        TOUCH_VISION_ADB_TIMEOUT         adb command timeout (s)\n\
        TOUCH_VISION_TESSERACT_PATH      tesseract executable\n\
        TOUCH_VISION_POLL_INTERVAL_MS    oracle poll interval\n\
        TOUCH_VISION_CAPTURE_TIMEOUT_MS  capture retry budget\n\
        TOUCH_VISION_SESSION_DIR         base directory for sessions\n\
        TOUCH_VISION_ASSETS_DIR          base directory for template images\n\
        TOUCH_VISION_LOG                 log filter (e.g. debug, touch_vision=trace)"
)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a workflow on one or more devices (one thread per device)
    Run {
        /// Workflow definition (JSON)
        #[arg(short, long)]
        workflow: PathBuf,

        /// adb serial; repeat for several devices
        #[arg(short, long = "device", required = true)]
        devices: Vec<String>,

        /// Run variable as key=value; repeatable
        #[arg(long = "var")]
        vars: Vec<String>,

        /// Output directory for events, summaries and evidence frames
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Keep the session directory after completion
        #[arg(long, short = 'k')]
        keep: bool,

        /// Print summaries as JSON
        #[arg(long)]
        json: bool,
    },

    /// Evaluate one expectation against a screenshot
    Detect {
        /// Screenshot file
        #[arg(short, long)]
        image: PathBuf,

        /// Region as x_min,x_max,y_min,y_max (fractions)
        #[arg(short, long, default_value = "0,1,0,1")]
        region: Region,

        /// Expect this text
        #[arg(long, conflicts_with_all = ["any_text", "template", "content"])]
        text: Option<String>,

        /// Expect any text at all
        #[arg(long, conflicts_with_all = ["template", "content"])]
        any_text: bool,

        /// Expect this template image
        #[arg(long, conflicts_with = "content")]
        template: Option<PathBuf>,

        /// Expect generic loaded content
        #[arg(long)]
        content: bool,

        /// Threshold / minimum confidence override
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Print a synthesized swipe path as JSON
    Gesture {
        /// Start point in pixels, x,y
        #[arg(long)]
        from: String,

        /// End point in pixels, x,y
        #[arg(long)]
        to: String,

        /// Total duration in milliseconds
        #[arg(short, long, default_value = "400")]
        duration: u64,
    },

    /// Print tap points synthesized for a region
    Tap {
        /// Region as x_min,x_max,y_min,y_max (fractions)
        #[arg(short, long)]
        region: Region,

        /// Screen size, WxH
        #[arg(short, long, default_value = "1080x2400")]
        size: String,

        /// Number of points
        #[arg(short, long, default_value = "5")]
        count: usize,
    },

    /// List attached adb devices
    Devices,

    /// List kept sessions, optionally removing old ones
    Sessions {
        /// Remove sessions last modified more than this many hours ago
        #[arg(long, value_name = "HOURS")]
        clean_older_than: Option<u64>,
    },

    /// Create a mock framebuffer screenshot for building fixtures
    Mock {
        /// Width in pixels
        #[arg(short = 'W', long, default_value = "1080")]
        width: u32,

        /// Height in pixels
        #[arg(short = 'H', long, default_value = "2400")]
        height: u32,

        /// Output file path
        #[arg(short, long, default_value = "./mock_screen.png")]
        output: PathBuf,

        /// Fill color as hex (e.g., "ff0000" for red)
        #[arg(short, long, default_value = "ffffff")]
        color: String,

        /// Text drawn near the top-left corner
        #[arg(short, long)]
        text: Option<String>,

        /// Text scale factor
        #[arg(long, default_value = "4")]
        scale: u32,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    logging::init();
    let args = Args::parse();

    match args.command {
        Commands::Run {
            workflow,
            devices,
            vars,
            output,
            keep,
            json,
        } => {
            let workflow = Workflow::from_json_file(&workflow)?;
            workflow.validate()?;
            let vars = parse_vars(&vars)?;

            // Output dir given: use it and keep it
            let session = match &output {
                Some(dir) => Session::in_dir(dir),
                None => Session::for_workflow(&workflow.name).keep(keep),
            };
            session.init()?;

            let workflow = Arc::new(workflow);
            let cancel = CancellationFlag::new();
            let mut handles = Vec::new();
            for serial in devices {
                let mut ctx = RunContext::for_device(&serial);
                ctx.vars.extend(vars.clone());
                let run_dir = session.run_dir(&ctx.run_id);
                let workflow = Arc::clone(&workflow);
                let cancel = cancel.clone();

                handles.push(thread::spawn(move || {
                    let mut reporter = FanoutReporter::new().with(LogReporter);
                    match JsonlReporter::new(&run_dir) {
                        Ok(jsonl) => reporter = reporter.with(jsonl),
                        Err(e) => tracing::warn!(error = %e, dir = %run_dir.display(), "event log disabled"),
                    }
                    let channel = AdbChannel::for_serial(&serial);
                    let mut orchestrator = Orchestrator::new(channel, Oracle::tesseract())
                        .reporter(reporter)
                        .cancellation(cancel)
                        .evidence_dir(&run_dir);
                    orchestrator.run(&workflow, &mut ctx)
                }));
            }

            let mut summaries: Vec<RunSummary> = Vec::new();
            for handle in handles {
                match handle.join() {
                    Ok(summary) => summaries.push(summary),
                    Err(_) => eprintln!("A run thread panicked"),
                }
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else {
                for summary in &summaries {
                    print_summary(summary);
                }
                if session.keep {
                    println!("\nSession: {}", session.dir.display());
                }
            }

            let aborted = summaries.iter().filter(|s| s.state == RunState::Aborted).count();
            if aborted > 0 {
                return Err(format!("{} of {} runs aborted", aborted, summaries.len()).into());
            }
        }

        Commands::Detect {
            image,
            region,
            text,
            any_text,
            template,
            content,
            threshold,
        } => {
            let frame = Frame::from_encoded(&std::fs::read(&image)?)?;
            let expectation = match (text, any_text, template, content) {
                (Some(text), _, _, _) => Expectation::text(text),
                (None, true, _, _) => Expectation::any_text(),
                (None, false, Some(path), _) => Expectation::template_path(path),
                (None, false, None, true) => Expectation::content(),
                _ => return Err("one of --text, --any-text, --template or --content is required".into()),
            };
            let expectation = match threshold {
                Some(t) => expectation.with_threshold(t),
                None => expectation,
            };
            expectation.validate()?;

            let crop = frame.crop(&region);
            let oracle = Oracle::tesseract();
            let result = oracle.evaluate(&crop, &expectation)?;
            let mut report = serde_json::to_value(&result)?;
            if content {
                report["signals"] = serde_json::to_value(content_signals(crop.image()))?;
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Gesture { from, to, duration } => {
            let (x0, y0) = parse_pair(&from, ',')?;
            let (x1, y1) = parse_pair(&to, ',')?;
            let path = synthesize_path(Point::new(x0, y0), Point::new(x1, y1), Duration::from_millis(duration))?;
            println!("{}", serde_json::to_string_pretty(&path)?);
        }

        Commands::Tap { region, size, count } => {
            let (w, h) = parse_pair(&size, 'x')?;
            let (w, h) = (w as u32, h as u32);
            let points = (0..count)
                .map(|_| synthesize_tap(&region, w, h))
                .collect::<Result<Vec<_>, _>>()?;
            println!("{}", serde_json::to_string_pretty(&points)?);
        }

        Commands::Devices => {
            let devices = AdbChannel::devices(&config::adb_path())?;
            if devices.is_empty() {
                println!("No devices attached");
            }
            for device in devices {
                println!("{}\t{}", device.serial, device.status);
            }
        }

        Commands::Sessions { clean_older_than } => {
            let base = PathBuf::from(config::session_base_dir());
            if let Some(hours) = clean_older_than {
                let removed = cleanup_old_sessions(&base, Duration::from_secs(hours.saturating_mul(3600)))?;
                println!("Removed {} session(s) older than {}h", removed, hours);
            }
            let sessions = list_sessions(&base)?;
            if sessions.is_empty() {
                println!("No sessions under {}", base.display());
            }
            for dir in sessions {
                println!("{}", dir.display());
            }
        }

        Commands::Mock {
            width,
            height,
            output,
            color,
            text,
            scale,
        } => {
            let rgb = parse_hex_color(&color)?;
            let mut fb = MockFramebuffer::with_color(width, height, rgb);
            if let Some(text) = text {
                let fg = if rgb.iter().map(|&c| u32::from(c)).sum::<u32>() > 384 {
                    [0, 0, 0]
                } else {
                    [255, 255, 255]
                };
                fb.draw_text_scaled(16, 16, &text, fg, rgb, scale);
            }
            std::fs::write(&output, fb.to_png()?)?;
            println!("Created mock screen: {}", output.display());
            println!("  Size: {}x{}", width, height);
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("\n=== {} on {} ===", summary.workflow, summary.device);
    println!("Run: {}", summary.run_id);
    println!("State: {}", summary.state);
    if let Some(error) = &summary.error {
        println!("Error: {}", error);
    }
    for outcome in &summary.steps {
        let score = outcome.score.map(|s| format!(" score={:.3}", s)).unwrap_or_default();
        println!(
            "  {:<24} {:?} (attempts: {}){}",
            outcome.step_id, outcome.state, outcome.attempts, score
        );
    }
    println!("Duration: {:.1}s", summary.duration().num_milliseconds() as f64 / 1000.0);
}

fn parse_vars(vars: &[String]) -> Result<HashMap<String, String>, String> {
    vars.iter()
        .map(|kv| {
            kv.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| format!("Invalid --var '{}'. Use key=value", kv))
        })
        .collect()
}

fn parse_pair(s: &str, sep: char) -> Result<(f64, f64), String> {
    let (a, b) = s
        .split_once(sep)
        .ok_or_else(|| format!("Invalid pair '{}'. Use a{}b", s, sep))?;
    let parse = |v: &str| v.trim().parse::<f64>().map_err(|e| format!("Invalid number '{}': {}", v, e));
    Ok((parse(a)?, parse(b)?))
}

fn parse_hex_color(hex: &str) -> Result<[u8; 3], String> {
    let hex = hex.trim_start_matches('#');
    if hex.len() != 6 || !hex.is_ascii() {
        return Err(format!("Invalid color '{}'. Use RRGGBB", hex));
    }
    let channel = |i: usize| {
        u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| format!("Invalid color '{}'. Use RRGGBB", hex))
    };
    Ok([channel(0)?, channel(2)?, channel(4)?])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_color() {
        assert_eq!(parse_hex_color("#ff8000"), Ok([255, 128, 0]));
        assert_eq!(parse_hex_color("FFFFFF"), Ok([255, 255, 255]));
        assert!(parse_hex_color("fff").is_err());
        assert!(parse_hex_color("gg0000").is_err());
    }

    #[test]
    fn test_parse_hex_color_rejects_multibyte_input() {
        // six bytes, but 'é' straddles a channel boundary
        assert!(parse_hex_color("a\u{e9}abc").is_err());
        assert!(parse_hex_color("\u{e9}\u{e9}\u{e9}").is_err());
    }

    #[test]
    fn test_parse_pair_and_vars() {
        assert_eq!(parse_pair("1080x2400", 'x'), Ok((1080.0, 2400.0)));
        assert!(parse_pair("1080", 'x').is_err());
        let vars = parse_vars(&["title=Desk lamp".to_string()]).unwrap();
        assert_eq!(vars.get("title").map(String::as_str), Some("Desk lamp"));
        assert!(parse_vars(&["=x".to_string()]).is_err());
    }
}
