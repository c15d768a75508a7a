use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::Deserialize;
use statrs::statistics::Statistics;

use crate::error::PipelineError;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Metric {
    Vmaf,
    Ssim,
    Psnr,
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Vmaf => write!(f, "VMAF"),
            Self::Ssim => write!(f, "SSIM"),
            Self::Psnr => write!(f, "PSNR"),
        }
    }
}

#[derive(Deserialize)]
struct LibVmafMetrics {
    vmaf: f64,
    #[serde(default, alias = "float_ssim")]
    ssim: Option<f64>,
    #[serde(default, alias = "psnr_y")]
    psnr: Option<f64>,
}

#[derive(Deserialize)]
struct LibVmafFrame {
    #[serde(rename = "frameNum")]
    frame_num: u64,
    metrics: LibVmafMetrics,
}

#[derive(Deserialize)]
struct LibVmafLog {
    frames: Vec<LibVmafFrame>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetricSample {
    pub frame: u64,
    pub vmaf: f64,
    pub ssim: Option<f64>,
    pub psnr: Option<f64>,
}

impl MetricSample {
    #[must_use]
    pub const fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Vmaf => Some(self.vmaf),
            Metric::Ssim => self.ssim,
            Metric::Psnr => self.psnr,
        }
    }
}

/// Arithmetic mean of every metric present in the log.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, PartialEq)]
pub struct MetricSummary {
    pub vmaf: f64,
    pub ssim: Option<f64>,
    pub psnr: Option<f64>,
}

impl MetricSummary {
    #[must_use]
    pub const fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Vmaf => Some(self.vmaf),
            Metric::Ssim => self.ssim,
            Metric::Psnr => self.psnr,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MetricLog {
    pub samples: Vec<MetricSample>,
    pub summary: MetricSummary,
}

impl MetricLog {
    #[must_use]
    pub fn from_samples(samples: Vec<MetricSample>) -> Self {
        let mean = |metric: Metric| -> Option<f64> {
            let values: Vec<f64> = samples
                .iter()
                .filter_map(|sample| sample.value(metric))
                .collect();

            (!values.is_empty()).then(|| values.mean())
        };

        let summary = MetricSummary {
            vmaf: mean(Metric::Vmaf).unwrap_or(f64::NAN),
            ssim: mean(Metric::Ssim),
            psnr: mean(Metric::Psnr),
        };

        Self { samples, summary }
    }

    /// Per-frame values of one metric, in frame order.
    #[must_use]
    pub fn series(&self, metric: Metric) -> Vec<(u64, f64)> {
        self.samples
            .iter()
            .filter_map(|sample| sample.value(metric).map(|value| (sample.frame, value)))
            .collect()
    }
}

pub fn parse(log_path: &Path) -> Result<MetricLog, PipelineError> {
    let file = File::open(log_path)
        .map_err(|err| PipelineError::malformed_log(log_path, format!("unable to open: {err}")))?;

    let is_empty = file
        .metadata()
        .map(|metadata| metadata.len() == 0)
        .unwrap_or(false);

    if is_empty {
        return Err(PipelineError::malformed_log(log_path, "file is empty"));
    }

    let log: LibVmafLog = serde_json::from_reader(BufReader::new(file))
        .map_err(|err| PipelineError::malformed_log(log_path, err.to_string()))?;

    if log.frames.is_empty() {
        return Err(PipelineError::malformed_log(log_path, "log contains no frames"));
    }

    let mut samples: Vec<MetricSample> = log
        .frames
        .into_iter()
        .map(|frame| MetricSample {
            frame: frame.frame_num,
            vmaf: frame.metrics.vmaf,
            ssim: frame.metrics.ssim,
            psnr: frame.metrics.psnr,
        })
        .collect();

    samples.sort_by_key(|sample| sample.frame);

    Ok(MetricLog::from_samples(samples))
}
