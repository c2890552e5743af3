//! calcam - capture a meal photo and estimate its calories.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use calorie_camera::presenter::AnalysisOutcome;
use calorie_camera::{
    CalcamConfig, CancelToken, CaptureFormat, CapturedFrame, CaptureSession, InferenceClient,
    Presenter,
};

#[derive(Parser)]
#[command(name = "calcam", about = "Meal-photo calorie estimation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Capture a still frame from the camera and save it.
    Capture {
        /// Output image path (.jpg or .png decides the encoding).
        #[arg(long, short)]
        output: PathBuf,

        /// Camera source override (device path, http(s) URL, or stub://).
        #[arg(long, env = "CALCAM_CAMERA_SOURCE")]
        source: Option<String>,

        /// Bound the output to max_size x max_size, scaling down only.
        #[arg(long)]
        max_size: Option<u32>,
    },

    /// Analyze an existing image file through the proxy.
    Analyze {
        /// Image file (.jpg/.jpeg/.png).
        image: PathBuf,

        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Full flow: capture, analyze, render the result.
    Run {
        /// Camera source override (device path, http(s) URL, or stub://).
        #[arg(long, env = "CALCAM_CAMERA_SOURCE")]
        source: Option<String>,

        /// Bound the captured frame to max_size x max_size.
        #[arg(long)]
        max_size: Option<u32>,

        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    #[default]
    Table,
    Json,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = CalcamConfig::load()?;

    match cli.command {
        Command::Capture {
            output,
            source,
            max_size,
        } => {
            if let Some(source) = source {
                config.camera.source = source;
            }
            let format = format_for_path(&output)?;
            let mut session = CaptureSession::new(config.camera);
            session.acquire()?;
            session.bind_preview()?;
            let bounds = max_size.map(|s| (s, s));
            let frame = session.capture(bounds, format)?;
            std::fs::write(&output, frame.bytes())
                .with_context(|| format!("write {}", output.display()))?;
            log::info!(
                "captured {}x{} frame to {}",
                frame.width(),
                frame.height(),
                output.display()
            );
            session.release();
        }

        Command::Analyze { image, format } => {
            let frame = load_frame(&image)?;
            let client = InferenceClient::new(&config.proxy_url);
            let cancel = CancelToken::new();
            let analysis = client.analyze_image(&frame, &cancel)?;
            let narrative = client.explain(&analysis, &cancel)?;
            print_outcome(
                &AnalysisOutcome {
                    analysis,
                    narrative,
                },
                format,
            )?;
        }

        Command::Run {
            source,
            max_size,
            format,
        } => {
            if let Some(source) = source {
                config.camera.source = source;
            }
            let session = CaptureSession::new(config.camera);
            let client = InferenceClient::new(&config.proxy_url);
            let mut presenter = Presenter::new(session, Box::new(client))
                .with_capture_bounds(max_size.map(|s| (s, s)))
                .with_capture_format(CaptureFormat::Jpeg);

            presenter.prepare_camera()?;
            presenter.capture()?;
            presenter.analyze().map_err(|err| {
                anyhow!(
                    "{}",
                    presenter
                        .user_message()
                        .map(str::to_string)
                        .unwrap_or_else(|| err.to_string())
                )
            })?;
            let outcome = presenter
                .outcome()
                .ok_or_else(|| anyhow!("analysis finished without a result"))?;
            print_outcome(outcome, format)?;
        }
    }

    Ok(())
}

fn format_for_path(path: &PathBuf) -> Result<CaptureFormat> {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => Ok(CaptureFormat::Jpeg),
        Some("png") => Ok(CaptureFormat::Png),
        other => Err(anyhow!(
            "unsupported output extension {:?}; use .jpg or .png",
            other
        )),
    }
}

fn load_frame(path: &PathBuf) -> Result<CapturedFrame> {
    let mime = match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        other => {
            return Err(anyhow!(
                "unsupported image extension {:?}; use .jpg or .png",
                other
            ))
        }
    };
    let bytes =
        std::fs::read(path).with_context(|| format!("read image {}", path.display()))?;
    let decoded = image::load_from_memory(&bytes)
        .with_context(|| format!("decode image {}", path.display()))?;
    Ok(CapturedFrame::from_encoded(
        bytes,
        mime,
        decoded.width(),
        decoded.height(),
    ))
}

fn print_outcome(outcome: &AnalysisOutcome, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let payload = serde_json::json!({
                "analysis": &outcome.analysis,
                "narrative": &outcome.narrative.text,
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        OutputFormat::Table => {
            let view = calorie_camera::ResultView {
                rows: outcome
                    .analysis
                    .items
                    .iter()
                    .map(|item| (item.name.clone(), item.calories))
                    .collect(),
                total_calories: outcome.analysis.total_calories,
                reported_total: outcome.analysis.reported_total,
                cooking_method: outcome.analysis.cooking_method.clone(),
                narrative: outcome.narrative.text.clone(),
            };
            print!("{}", view.to_table());
        }
    }
    Ok(())
}
