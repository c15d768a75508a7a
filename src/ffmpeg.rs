use std::path::Path;
use std::process::{Command, Output, Stdio};

use anyhow::{anyhow, Context};
use cached::proc_macro::cached;
use serde::{Deserialize, Serialize};

use crate::arguments::ProcessInvocation;
use crate::error::PipelineError;
use crate::process::announce_command;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Metadata {
    /// Frame rate exactly as FFmpeg reports it, e.g. `30000/1001`.
    pub frame_rate: String,
    pub fps: f64,
    pub duration: f64,
    /// Overall container bitrate in bits per second.
    pub bit_rate: Option<f64>,
}

#[derive(Deserialize)]
struct ProbeStream {
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: ProbeFormat,
}

#[must_use]
pub fn parse_fraction(value: &str) -> Option<f64> {
    let (numerator, denominator) = value.split_once('/').unwrap_or((value, "1"));

    let numerator: f64 = numerator.trim().parse().ok()?;
    let denominator: f64 = denominator.trim().parse().ok()?;

    if denominator == 0.0 || numerator <= 0.0 {
        return None;
    }

    Some(numerator / denominator)
}

pub fn parse_probe_output(json: &str) -> anyhow::Result<Metadata> {
    let output: ProbeOutput =
        serde_json::from_str(json).context("Unable to parse ffprobe JSON output")?;

    let stream = output
        .streams
        .first()
        .ok_or_else(|| anyhow!("ffprobe reported no video stream"))?;

    let (frame_rate, fps) = [&stream.r_frame_rate, &stream.avg_frame_rate]
        .into_iter()
        .flatten()
        .find_map(|rate| parse_fraction(rate).map(|fps| (rate.clone(), fps)))
        .ok_or_else(|| anyhow!("ffprobe reported no usable frame rate"))?;

    let duration = output
        .format
        .duration
        .as_deref()
        .or(stream.duration.as_deref())
        .and_then(|duration| duration.trim().parse::<f64>().ok())
        .ok_or_else(|| anyhow!("ffprobe reported no usable duration"))?;

    let bit_rate = output
        .format
        .bit_rate
        .as_deref()
        .and_then(|bit_rate| bit_rate.trim().parse::<f64>().ok());

    Ok(Metadata {
        frame_rate,
        fps,
        duration,
        bit_rate,
    })
}

#[must_use]
pub fn probe_invocation(path: &Path) -> ProcessInvocation {
    let mut arguments: Vec<String> = [
        "-v",
        "quiet",
        "-print_format",
        "json",
        "-show_format",
        "-show_streams",
        "-select_streams",
        "v:0",
    ]
    .map(String::from)
    .to_vec();

    arguments.push(path.to_string_lossy().to_string());

    ProcessInvocation::new("ffprobe".to_owned(), arguments)
}

#[must_use]
pub fn cut_invocation(source: &Path, seconds: f64, output: &Path) -> ProcessInvocation {
    ProcessInvocation::new(
        "ffmpeg".to_owned(),
        vec![
            "-loglevel".to_owned(),
            "warning".to_owned(),
            "-y".to_owned(),
            "-i".to_owned(),
            source.to_string_lossy().to_string(),
            "-t".to_owned(),
            seconds.to_string(),
            "-map".to_owned(),
            "0".to_owned(),
            "-c".to_owned(),
            "copy".to_owned(),
            output.to_string_lossy().to_string(),
        ],
    )
}

fn run_captured(invocation: &ProcessInvocation, show_commands: bool) -> anyhow::Result<Output> {
    announce_command(invocation, show_commands);

    Command::new(invocation.program())
        .args(invocation.arguments())
        .stdin(Stdio::null())
        .output()
        .map_err(|source| {
            PipelineError::ProcessSpawnError {
                program: invocation.program().to_owned(),
                source,
            }
            .into()
        })
}

#[cached(
    result = true,
    key = "String",
    convert = r#"{ path.to_string_lossy().to_string() }"#
)]
pub fn get_metadata(path: &Path, show_commands: bool) -> anyhow::Result<Metadata> {
    let output = run_captured(&probe_invocation(path), show_commands)?;

    if !output.status.success() {
        return Err(anyhow!(
            "ffprobe returned {} while probing {path:?}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    let json = std::str::from_utf8(&output.stdout)
        .context("Unable to decode ffprobe output as UTF-8")?;

    parse_probe_output(json).with_context(|| format!("Unable to read metadata for {path:?}"))
}

/// Losslessly copies the first `seconds` of `source` into `output`.
pub fn cut_video(
    source: &Path,
    seconds: f64,
    output: &Path,
    show_commands: bool,
) -> anyhow::Result<()> {
    let result = run_captured(&cut_invocation(source, seconds, output), show_commands)?;

    if !result.status.success() {
        return Err(anyhow!(
            "FFmpeg returned error code {} while cutting {source:?}:\n{}",
            result.status,
            String::from_utf8_lossy(&result.stderr)
        ));
    }

    Ok(())
}
