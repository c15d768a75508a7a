use std::path::PathBuf;

use clap::Parser;

use crate::arguments::MetricOptions;

#[derive(Clone, Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Video encoder to use (x264, x265, av1, hevc_nvenc, h264_nvenc, hevc_qsv, h264_qsv, av1_qsv)
    #[arg(short, long, default_value = "x264")]
    pub encoder: String,

    /// CRF value(s) to compare (the encoder's default when omitted)
    #[arg(long, num_args = 1..)]
    pub crf: Vec<u32>,

    /// Preset(s) to compare (the encoder's default when omitted)
    #[arg(short, long, num_args = 1..)]
    pub preset: Vec<String>,

    /// Quality/speed tradeoff for the av1 encoder; lower is slower and better
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=8), default_value_t = 5)]
    pub av1_cpu_used: u8,

    /// Number of decimal places used for the data in the table
    #[arg(short, long, default_value_t = 2)]
    pub decimal_places: usize,

    /// Only compute the quality metrics for every nth frame
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..), default_value_t = 1)]
    pub subsample: u32,

    /// Number of threads libvmaf may use (all available cores when omitted)
    #[arg(long)]
    pub n_threads: Option<usize>,

    /// Use the VMAF phone model
    #[arg(long)]
    pub phone_model: bool,

    /// Also calculate SSIM
    #[arg(long)]
    pub ssim: bool,

    /// Also calculate PSNR
    #[arg(long)]
    pub psnr: bool,

    /// FFmpeg video filter chain applied before encoding and to the metric reference
    #[arg(long, visible_alias = "vf")]
    pub video_filters: Option<String>,

    /// Only encode the first SECONDS of the original video
    #[arg(short = 't', long, value_name = "SECONDS", value_parser = parse_seconds)]
    pub encode_length: Option<f64>,

    /// Output folder (defaults to "(<original filename>)")
    #[arg(short, long)]
    pub output_folder: Option<PathBuf>,

    /// Print each FFmpeg command before running it
    #[arg(long)]
    pub show_commands: bool,

    /// Only measure an existing transcode given with --transcoded-video-path
    #[arg(long, requires = "transcoded_video_path", conflicts_with = "encode_length")]
    pub no_transcoding_mode: bool,

    /// Previously transcoded video (no-transcoding mode only)
    #[arg(long)]
    pub transcoded_video_path: Option<PathBuf>,

    /// VMAF model file
    #[arg(long, default_value = "vmaf_models/vmaf_v0.6.1.json")]
    pub vmaf_model_path: PathBuf,

    /// Original (reference) video
    pub source: PathBuf,
}

fn parse_seconds(value: &str) -> Result<f64, String> {
    let seconds: f64 = value
        .parse()
        .map_err(|err| format!("'{value}' is not a number: {err}"))?;

    if seconds.is_finite() && seconds > 0.0 {
        Ok(seconds)
    } else {
        Err(format!("'{value}' is not a positive number of seconds"))
    }
}

impl Config {
    #[must_use]
    pub fn threads(&self) -> usize {
        self.n_threads.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        })
    }

    #[must_use]
    pub fn source_filename(&self) -> String {
        self.source.file_name().map_or_else(
            || self.source.to_string_lossy().to_string(),
            |name| name.to_string_lossy().to_string(),
        )
    }

    #[must_use]
    pub fn output_folder(&self) -> PathBuf {
        self.output_folder
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("({})", self.source_filename())))
    }

    /// Encoded files keep the source container, except where it cannot hold the codec.
    #[must_use]
    pub fn output_extension(&self) -> String {
        let extension = self
            .source
            .extension()
            .map_or_else(|| "mkv".to_owned(), |ext| ext.to_string_lossy().to_string());

        if extension.eq_ignore_ascii_case("m4v") && self.encoder == "x265" {
            "mp4".to_owned()
        } else {
            extension
        }
    }

    #[must_use]
    pub fn metric_options(&self, log_path: PathBuf) -> MetricOptions {
        MetricOptions {
            log_path,
            model_path: self.vmaf_model_path.clone(),
            subsample: self.subsample,
            phone_model: self.phone_model,
            psnr: self.psnr,
            ssim: self.ssim,
            threads: self.threads(),
            filter_chain: self.video_filters.clone(),
        }
    }
}
