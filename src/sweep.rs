use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::arguments::{
    build_encode_arguments, build_metric_arguments, ProcessInvocation, RunConfig,
};
use crate::config::Config;
use crate::error::PipelineError;
use crate::ffmpeg::{self, Metadata};
use crate::metrics::{self, Metric, MetricLog, MetricSummary};
use crate::process::{expected_units, RunOutcome, Supervisor};
use crate::profile::{self, EncoderFamily, EncoderProfile};
use crate::report;
use crate::util::{round_to, verify_directory, verify_filename, HumanBitrate};

pub const RAW_LOG_DIRECTORY: &str = "Raw JSON Data";

/// Access to the external tools a sweep needs.
pub trait Toolchain {
    fn execute(
        &mut self,
        invocation: &ProcessInvocation,
        expected_units: u64,
        message: &str,
    ) -> anyhow::Result<RunOutcome>;

    fn metadata(&mut self, path: &Path) -> anyhow::Result<Metadata>;

    fn cut(&mut self, source: &Path, seconds: f64, output: &Path) -> anyhow::Result<()>;
}

pub struct SystemToolchain {
    supervisor: Supervisor,
    show_commands: bool,
}

impl SystemToolchain {
    #[must_use]
    pub const fn new(show_commands: bool) -> Self {
        Self {
            supervisor: Supervisor::new(show_commands),
            show_commands,
        }
    }
}

impl Toolchain for SystemToolchain {
    fn execute(
        &mut self,
        invocation: &ProcessInvocation,
        expected_units: u64,
        message: &str,
    ) -> anyhow::Result<RunOutcome> {
        self.supervisor.run(invocation, expected_units, message)
    }

    fn metadata(&mut self, path: &Path) -> anyhow::Result<Metadata> {
        ffmpeg::get_metadata(path, self.show_commands)
    }

    fn cut(&mut self, source: &Path, seconds: f64, output: &Path) -> anyhow::Result<()> {
        ffmpeg::cut_video(source, seconds, output, self.show_commands)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    Idle,
    PreparingRun,
    Encoding,
    MeasuringQuality,
    RowRecorded,
    Done,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::PreparingRun => write!(f, "preparing run"),
            Self::Encoding => write!(f, "encoding"),
            Self::MeasuringQuality => write!(f, "measuring quality"),
            Self::RowRecorded => write!(f, "row recorded"),
            Self::Done => write!(f, "done"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SweepMode {
    Quality {
        values: Vec<u32>,
        preset: Option<String>,
    },
    Preset {
        presets: Vec<String>,
        quality: u32,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SweepPoint {
    pub label: String,
    /// Unique per sweep; names the encoded file and its metric log.
    pub file_stem: String,
    pub quality: u32,
    pub preset: Option<String>,
}

#[derive(Debug)]
pub struct SweepPlan {
    pub profile: &'static EncoderProfile,
    pub mode: SweepMode,
    pub cpu_used: Option<u8>,
}

impl SweepPlan {
    /// Validates the requested sweep before anything touches the filesystem.
    pub fn new(
        profile: &'static EncoderProfile,
        qualities: &[u32],
        presets: &[String],
        cpu_used: u8,
    ) -> Result<Self, PipelineError> {
        if qualities.len() > 1 && presets.len() > 1 {
            return Err(PipelineError::InvalidSweepConfiguration(
                "multiple CRF values and multiple presets cannot be compared at the same time"
                    .to_owned(),
            ));
        }

        let invalid = |err: PipelineError| PipelineError::InvalidSweepConfiguration(err.to_string());

        if !presets.is_empty() && !profile.supports_presets() {
            return Err(PipelineError::InvalidSweepConfiguration(format!(
                "the {} encoder has no presets",
                profile.name
            )));
        }

        for quality in qualities {
            profile.check_quality(*quality).map_err(invalid)?;
        }

        for preset in presets {
            profile.resolve_preset(preset).map_err(|err| {
                PipelineError::InvalidSweepConfiguration(format!(
                    "{err} (available presets: {})",
                    profile.preset_names().join(", ")
                ))
            })?;
        }

        let mut seen = HashSet::new();
        if let Some(duplicate) = qualities
            .iter()
            .map(ToString::to_string)
            .chain(presets.iter().cloned())
            .find(|value| !seen.insert(value.clone()))
        {
            return Err(PipelineError::InvalidSweepConfiguration(format!(
                "'{duplicate}' was given more than once"
            )));
        }

        let mode = if presets.len() > 1 {
            SweepMode::Preset {
                presets: presets.to_vec(),
                quality: qualities.first().copied().unwrap_or(profile.default_quality),
            }
        } else {
            SweepMode::Quality {
                values: if qualities.is_empty() {
                    vec![profile.default_quality]
                } else {
                    qualities.to_vec()
                },
                preset: presets
                    .first()
                    .cloned()
                    .or_else(|| profile.default_preset.map(ToOwned::to_owned)),
            }
        };

        Ok(Self {
            profile,
            mode,
            cpu_used: (profile.family == EncoderFamily::Aom).then_some(cpu_used),
        })
    }

    #[must_use]
    pub fn points(&self) -> Vec<SweepPoint> {
        match &self.mode {
            SweepMode::Quality { values, preset } => values
                .iter()
                .map(|quality| SweepPoint {
                    label: quality.to_string(),
                    file_stem: format!("CRF {quality}"),
                    quality: *quality,
                    preset: preset.clone(),
                })
                .collect(),
            SweepMode::Preset { presets, quality } => presets
                .iter()
                .map(|preset| SweepPoint {
                    label: preset.clone(),
                    file_stem: preset.clone(),
                    quality: *quality,
                    preset: Some(preset.clone()),
                })
                .collect(),
        }
    }

    #[must_use]
    pub const fn label_heading(&self) -> &'static str {
        match self.mode {
            SweepMode::Quality { .. } => "CRF",
            SweepMode::Preset { .. } => "Preset",
        }
    }

    /// Description and value of the parameter held constant across the sweep.
    #[must_use]
    pub fn constant_parameter(&self) -> (String, String) {
        match &self.mode {
            SweepMode::Quality {
                preset: Some(preset),
                ..
            } => ("Preset".to_owned(), preset.clone()),
            SweepMode::Quality { preset: None, .. } => (
                "cpu-used".to_owned(),
                self.cpu_used
                    .map_or_else(|| "default".to_owned(), |cpu_used| cpu_used.to_string()),
            ),
            SweepMode::Preset { quality, .. } => ("CRF value".to_owned(), quality.to_string()),
        }
    }

    #[must_use]
    pub fn directory_name(&self) -> String {
        match &self.mode {
            SweepMode::Quality { .. } => {
                let (name, value) = self.constant_parameter();
                format!("CRF comparison at {} {value}", name.to_lowercase())
            }
            SweepMode::Preset { quality, .. } => format!("Presets comparison at CRF {quality}"),
        }
    }

    #[must_use]
    pub fn run_config(
        &self,
        point: &SweepPoint,
        input: &Path,
        output: &Path,
        filter_chain: Option<&str>,
    ) -> RunConfig {
        RunConfig {
            encoder: self.profile.name.to_owned(),
            quality: Some(point.quality),
            preset: point.preset.clone(),
            cpu_used: self.cpu_used,
            filter_chain: filter_chain.map(ToOwned::to_owned),
            input: input.to_path_buf(),
            output: output.to_path_buf(),
        }
    }
}

/// Measured values of one run, already rounded to the table precision.
#[derive(Clone, Debug, PartialEq)]
pub struct RowMetrics {
    pub elapsed: Option<f64>,
    pub size_mb: f64,
    pub bitrate_kbps: Option<f64>,
    pub quality: MetricSummary,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RowOutcome {
    Measured(RowMetrics),
    Failed { stage: Stage, reason: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ComparisonRow {
    pub label: String,
    pub outcome: RowOutcome,
}

#[derive(Clone, Debug)]
pub struct ComparisonTable {
    pub label_heading: Option<String>,
    pub include_time: bool,
    pub metrics: Vec<Metric>,
    pub decimal_places: usize,
    rows: Vec<ComparisonRow>,
}

impl ComparisonTable {
    #[must_use]
    pub fn new(config: &Config, label_heading: Option<&str>) -> Self {
        let mut metrics = vec![Metric::Vmaf];

        if config.ssim {
            metrics.push(Metric::Ssim);
        }

        if config.psnr {
            metrics.push(Metric::Psnr);
        }

        Self {
            label_heading: label_heading.map(ToOwned::to_owned),
            include_time: !config.no_transcoding_mode,
            metrics,
            decimal_places: config.decimal_places,
            rows: vec![],
        }
    }

    #[must_use]
    pub fn with_row(mut self, row: ComparisonRow) -> Self {
        self.rows.push(row);
        self
    }

    #[must_use]
    pub fn rows(&self) -> &[ComparisonRow] {
        &self.rows
    }
}

/// Sweep-wide values written once, after the table.
#[derive(Clone, Debug)]
pub struct SweepSummary {
    pub source_filename: String,
    pub original_bitrate: Option<f64>,
    pub encoder: String,
    pub constant_parameter: (String, String),
    pub filter_chain: Option<String>,
    pub subsample: u32,
}

#[derive(Clone, Debug)]
pub struct SweepReport {
    pub directory: PathBuf,
    pub header: Option<String>,
    pub table: ComparisonTable,
    pub summary: Option<SweepSummary>,
}

struct Orchestrator<'a, T: Toolchain> {
    config: &'a Config,
    toolchain: &'a mut T,
    directory: PathBuf,
    reference: PathBuf,
    reference_metadata: Metadata,
    stage: Stage,
}

impl<T: Toolchain> Orchestrator<'_, T> {
    fn enter(&mut self, stage: Stage, label: &str) {
        debug!("[{label}] {} -> {stage}", self.stage);
        self.stage = stage;
    }

    fn failed(&mut self, table: ComparisonTable, label: &str, reason: String) -> ComparisonTable {
        warn!("[{label}] Run failed while {}: {reason}", self.stage);

        let row = ComparisonRow {
            label: label.to_owned(),
            outcome: RowOutcome::Failed {
                stage: self.stage,
                reason,
            },
        };

        self.enter(Stage::RowRecorded, label);
        table.with_row(row)
    }

    fn run_point(
        &mut self,
        plan: &SweepPlan,
        table: ComparisonTable,
        point: &SweepPoint,
    ) -> anyhow::Result<ComparisonTable> {
        self.enter(Stage::PreparingRun, &point.label);

        let output = self
            .directory
            .join(format!("{}.{}", point.file_stem, self.config.output_extension()));

        let run = plan.run_config(
            point,
            &self.reference,
            &output,
            self.config.video_filters.as_deref(),
        );

        let invocation = build_encode_arguments(&run, plan.profile)
            .with_context(|| format!("Unable to build encoder arguments for {}", point.label))?;

        self.enter(Stage::Encoding, &point.label);

        let outcome = self
            .toolchain
            .execute(
                &invocation,
                expected_units(self.reference_metadata.fps, self.reference_metadata.duration),
                &format!("Encoding ({} {})", plan.label_heading(), point.label),
            )
            .with_context(|| format!("Unable to run encoder for {}", point.label))?;

        if !outcome.success() {
            let error = PipelineError::ProcessFailed {
                program: invocation.program().to_owned(),
                status: outcome.status,
            };

            return Ok(self.failed(table, &point.label, error.to_string()));
        }

        self.measure(table, &point.label, &point.file_stem, &output, Some(outcome.elapsed))
    }

    fn measure(
        &mut self,
        table: ComparisonTable,
        label: &str,
        file_stem: &str,
        distorted: &Path,
        elapsed: Option<Duration>,
    ) -> anyhow::Result<ComparisonTable> {
        self.enter(Stage::MeasuringQuality, label);

        let size_bytes = match std::fs::metadata(distorted) {
            Ok(metadata) => metadata.len(),
            Err(err) => {
                return Ok(self.failed(table, label, format!("{distorted:?} is unreadable: {err}")))
            }
        };

        let distorted_metadata = match self.toolchain.metadata(distorted) {
            Ok(metadata) => metadata,
            Err(err) => return Ok(self.failed(table, label, format!("{err:#}"))),
        };

        let log_path = self
            .directory
            .join(RAW_LOG_DIRECTORY)
            .join(format!("{file_stem}.json"));

        verify_filename(&log_path)
            .with_context(|| format!("Unable to verify metric log path {log_path:?}"))?;

        if log_path.exists() {
            std::fs::remove_file(&log_path)
                .with_context(|| format!("Unable to remove stale metric log {log_path:?}"))?;
        }

        let invocation = build_metric_arguments(
            distorted,
            &self.reference,
            &self.reference_metadata.frame_rate,
            &self.config.metric_options(log_path.clone()),
        )
        .with_context(|| format!("Unable to build metric arguments for {label}"))?;

        let outcome = self
            .toolchain
            .execute(
                &invocation,
                expected_units(self.reference_metadata.fps, distorted_metadata.duration),
                &format!("Computing quality metrics ({label})"),
            )
            .with_context(|| format!("Unable to run quality metrics for {label}"))?;

        if !outcome.success() {
            let error = PipelineError::ProcessFailed {
                program: invocation.program().to_owned(),
                status: outcome.status,
            };

            return Ok(self.failed(table, label, error.to_string()));
        }

        let log = match metrics::parse(&log_path) {
            Ok(log) => log,
            Err(err) if err.is_run_failure() => {
                return Ok(self.failed(table, label, err.to_string()))
            }
            Err(err) => return Err(err.into()),
        };

        self.plot(label, file_stem, &log);

        let places = table.decimal_places;

        #[allow(clippy::as_conversions)]
        #[allow(clippy::cast_precision_loss)]
        let row = ComparisonRow {
            label: label.to_owned(),
            outcome: RowOutcome::Measured(RowMetrics {
                elapsed: elapsed.map(|elapsed| round_to(elapsed.as_secs_f64(), places)),
                size_mb: round_to(size_bytes as f64 / 1_000_000.0, places),
                bitrate_kbps: distorted_metadata
                    .bit_rate
                    .map(|bit_rate| round_to(bit_rate / 1000.0, places)),
                quality: MetricSummary {
                    vmaf: round_to(log.summary.vmaf, places),
                    ssim: log.summary.ssim.map(|value| round_to(value, places)),
                    psnr: log.summary.psnr.map(|value| round_to(value, places)),
                },
            }),
        };

        info!("[{label}] VMAF {:.2}", log.summary.vmaf);
        self.enter(Stage::RowRecorded, label);

        Ok(table.with_row(row))
    }

    fn plot(&self, label: &str, file_stem: &str, log: &MetricLog) {
        let chart_path = self.directory.join(format!("{file_stem}.svg"));

        if let Err(err) = report::plot_quality(&chart_path, label, log, Metric::Vmaf) {
            warn!("Unable to plot quality chart {chart_path:?}: {err:#}");
        }
    }
}

#[allow(clippy::print_stdout)]
fn print_banner(config: &Config, metadata: &Metadata) {
    println!("Filename: {}", config.source_filename());
    println!(
        "Bitrate: {}",
        metadata
            .bit_rate
            .map_or_else(|| "unknown".to_owned(), |bit_rate| HumanBitrate(bit_rate).to_string())
    );
    println!("Framerate: {} ({:.3}) FPS", metadata.frame_rate, metadata.fps);

    if let Some(filter_chain) = &config.video_filters {
        println!("The following filter(s) will be used: {filter_chain}");
    }
}

/// Runs the whole comparison described by `config`.
///
/// Configuration problems are reported before any directory is created or any
/// encode is started. Failed runs become failed rows; only a missing tool or a
/// filesystem error aborts the sweep.
pub fn execute<T: Toolchain>(config: &Config, toolchain: &mut T) -> anyhow::Result<SweepReport> {
    let profile = profile::lookup(&config.encoder)?;

    if profile.family.is_hardware() {
        info!("{} encodes on a hardware device", profile.name);
    }

    let plan = if config.no_transcoding_mode {
        None
    } else {
        Some(SweepPlan::new(
            profile,
            &config.crf,
            &config.preset,
            config.av1_cpu_used,
        )?)
    };

    let source_metadata = toolchain
        .metadata(&config.source)
        .with_context(|| format!("Unable to read metadata for {:?}", config.source))?;

    print_banner(config, &source_metadata);

    let root = config.output_folder();

    let Some(plan) = plan else {
        let transcoded = config
            .transcoded_video_path
            .as_ref()
            .ok_or_else(|| {
                PipelineError::InvalidSweepConfiguration(
                    "no-transcoding mode needs a transcoded video path".to_owned(),
                )
            })?;

        verify_directory(&root)
            .with_context(|| format!("Unable to verify output directory {root:?}"))?;

        let mut orchestrator = Orchestrator {
            config,
            toolchain,
            directory: root.clone(),
            reference: config.source.clone(),
            reference_metadata: source_metadata,
            stage: Stage::Idle,
        };

        let label = transcoded
            .file_name()
            .map_or_else(String::new, |name| name.to_string_lossy().to_string());

        let table = orchestrator.measure(
            ComparisonTable::new(config, None),
            &label,
            "QualityMetrics",
            transcoded,
            None,
        )?;

        orchestrator.enter(Stage::Done, &label);

        return Ok(SweepReport {
            directory: root,
            header: None,
            table,
            summary: None,
        });
    };

    let directory = root.join(plan.directory_name());
    verify_directory(&directory)
        .with_context(|| format!("Unable to verify sweep directory {directory:?}"))?;

    let (reference, reference_metadata, header) = if let Some(seconds) = config.encode_length {
        let source = config.source.as_path();
        let stem = source
            .file_stem()
            .map_or_else(String::new, |stem| stem.to_string_lossy().to_string());
        let cut = directory.join(format!(
            "{stem} [{seconds}s].{}",
            config.output_extension()
        ));

        info!("Cutting the video to a length of {seconds} seconds");
        toolchain
            .cut(source, seconds, &cut)
            .with_context(|| format!("Unable to cut {source:?} to {seconds} seconds"))?;

        let metadata = toolchain
            .metadata(&cut)
            .with_context(|| format!("Unable to read metadata for {cut:?}"))?;

        let header = format!(
            "You chose to encode {} for {seconds} second{} using {}.",
            config.source_filename(),
            if (seconds - 1.0).abs() < f64::EPSILON { "" } else { "s" },
            profile.name
        );

        (cut, metadata, Some(header))
    } else {
        (config.source.clone(), source_metadata.clone(), None)
    };

    let mut orchestrator = Orchestrator {
        config,
        toolchain,
        directory: directory.clone(),
        reference,
        reference_metadata,
        stage: Stage::Idle,
    };

    let table = plan.points().iter().try_fold(
        ComparisonTable::new(config, Some(plan.label_heading())),
        |table, point| orchestrator.run_point(&plan, table, point),
    )?;

    orchestrator.enter(Stage::Done, plan.label_heading());

    Ok(SweepReport {
        directory,
        header,
        table,
        summary: Some(SweepSummary {
            source_filename: config.source_filename(),
            original_bitrate: source_metadata.bit_rate,
            encoder: profile.name.to_owned(),
            constant_parameter: plan.constant_parameter(),
            filter_chain: config.video_filters.clone(),
            subsample: config.subsample,
        }),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::HashMap;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    use clap::Parser;

    use super::*;
    use crate::arguments::decode;

    #[derive(Default)]
    struct FakeToolchain {
        encodes: Vec<String>,
        metric_runs: usize,
        failing_encodes: HashSet<String>,
        failing_metrics: HashSet<String>,
        broken_logs: HashSet<String>,
        scores: HashMap<String, Vec<f64>>,
    }

    fn stem_of(path: &str) -> String {
        Path::new(path)
            .file_stem()
            .unwrap()
            .to_string_lossy()
            .to_string()
    }

    impl Toolchain for FakeToolchain {
        fn execute(
            &mut self,
            invocation: &ProcessInvocation,
            _expected_units: u64,
            _message: &str,
        ) -> anyhow::Result<RunOutcome> {
            let success = ExitStatus::from_raw(0);
            let failure = ExitStatus::from_raw(1 << 8);
            let elapsed = Duration::from_millis(1500);

            if invocation.value_of("-lavfi").is_some() {
                self.metric_runs += 1;

                let log_path = PathBuf::from(
                    decode::libvmaf_option(invocation.value_of("-lavfi").unwrap(), "log_path")
                        .unwrap(),
                );
                let stem = stem_of(&log_path.to_string_lossy());

                if self.failing_metrics.contains(&stem) {
                    return Ok(RunOutcome { status: failure, elapsed });
                }

                let contents = if self.broken_logs.contains(&stem) {
                    "{".to_owned()
                } else {
                    let scores = self
                        .scores
                        .get(&stem)
                        .cloned()
                        .unwrap_or_else(|| vec![90.0, 92.0, 88.0]);

                    let frames: Vec<String> = scores
                        .iter()
                        .enumerate()
                        .map(|(index, score)| {
                            format!(r#"{{"frameNum": {index}, "metrics": {{"vmaf": {score}}}}}"#)
                        })
                        .collect();

                    format!(r#"{{"frames": [{}]}}"#, frames.join(","))
                };

                std::fs::write(log_path, contents)?;

                return Ok(RunOutcome { status: success, elapsed });
            }

            let output = invocation.arguments().last().unwrap().clone();
            let stem = stem_of(&output);
            self.encodes.push(stem.clone());

            if self.failing_encodes.contains(&stem) {
                return Ok(RunOutcome { status: failure, elapsed });
            }

            std::fs::write(&output, vec![0_u8; 2_500_000])?;

            Ok(RunOutcome { status: success, elapsed })
        }

        fn metadata(&mut self, _path: &Path) -> anyhow::Result<Metadata> {
            Ok(Metadata {
                frame_rate: "30/1".to_owned(),
                fps: 30.0,
                duration: 10.0,
                bit_rate: Some(2_000_000.0),
            })
        }

        fn cut(&mut self, _source: &Path, _seconds: f64, output: &Path) -> anyhow::Result<()> {
            std::fs::write(output, b"cut")?;
            Ok(())
        }
    }

    fn config(temp: &Path, extra: &[&str]) -> Config {
        let output = temp.join("out");
        let mut args = vec!["vqm", "clip.mkv", "-o", output.to_str().unwrap()];
        args.extend_from_slice(extra);

        Config::parse_from(args)
    }

    fn measured(row: &ComparisonRow) -> &RowMetrics {
        match &row.outcome {
            RowOutcome::Measured(metrics) => metrics,
            RowOutcome::Failed { reason, .. } => panic!("row {} failed: {reason}", row.label),
        }
    }

    #[test]
    fn test_quality_sweep_rows_in_order() {
        let temp = tempfile::tempdir().unwrap();
        let config = config(temp.path(), &["--crf", "20", "23", "26"]);
        let mut toolchain = FakeToolchain::default();
        toolchain
            .scores
            .insert("CRF 23".to_owned(), vec![95.0, 94.5, 94.0]);

        let report = execute(&config, &mut toolchain).unwrap();
        let rows = report.table.rows();

        assert_eq!(
            rows.iter().map(|row| row.label.as_str()).collect::<Vec<_>>(),
            ["20", "23", "26"]
        );
        assert_eq!(toolchain.encodes, ["CRF 20", "CRF 23", "CRF 26"]);

        let first = measured(&rows[0]);
        assert_eq!(first.elapsed, Some(1.5));
        assert_eq!(first.size_mb, 2.5);
        assert_eq!(first.bitrate_kbps, Some(2000.0));
        assert_eq!(first.quality.vmaf, 90.0);
        assert_eq!(measured(&rows[1]).quality.vmaf, 94.5);

        assert_eq!(
            report.directory,
            temp.path().join("out").join("CRF comparison at preset medium")
        );
        assert!(report
            .directory
            .join(RAW_LOG_DIRECTORY)
            .join("CRF 26.json")
            .exists());

        let summary = report.summary.unwrap();
        assert_eq!(summary.encoder, "x264");
        assert_eq!(
            summary.constant_parameter,
            ("Preset".to_owned(), "medium".to_owned())
        );
    }

    #[test]
    fn test_failed_encode_records_failed_row() {
        let temp = tempfile::tempdir().unwrap();
        let config = config(temp.path(), &["--crf", "20", "23", "26"]);
        let mut toolchain = FakeToolchain::default();
        toolchain.failing_encodes.insert("CRF 23".to_owned());

        let report = execute(&config, &mut toolchain).unwrap();
        let rows = report.table.rows();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].label, "23");
        assert!(matches!(
            &rows[1].outcome,
            RowOutcome::Failed { stage: Stage::Encoding, reason } if reason.contains("ffmpeg exited")
        ));
        measured(&rows[0]);
        measured(&rows[2]);
        assert_eq!(toolchain.metric_runs, 2);
    }

    #[test]
    fn test_last_row_failure_keeps_earlier_rows() {
        let temp = tempfile::tempdir().unwrap();
        let config = config(temp.path(), &["--crf", "20", "23", "26"]);
        let mut toolchain = FakeToolchain::default();
        toolchain.failing_metrics.insert("CRF 26".to_owned());

        let report = execute(&config, &mut toolchain).unwrap();
        let rows = report.table.rows();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].label, "26");
        assert!(matches!(
            rows[2].outcome,
            RowOutcome::Failed {
                stage: Stage::MeasuringQuality,
                ..
            }
        ));
    }

    #[test]
    fn test_malformed_log_fails_only_that_point() {
        let temp = tempfile::tempdir().unwrap();
        let config = config(temp.path(), &["-p", "slow", "medium", "fast", "--crf", "24"]);
        let mut toolchain = FakeToolchain::default();
        toolchain.broken_logs.insert("medium".to_owned());

        let report = execute(&config, &mut toolchain).unwrap();
        let rows = report.table.rows();

        assert_eq!(report.table.label_heading.as_deref(), Some("Preset"));
        assert_eq!(
            rows.iter().map(|row| row.label.as_str()).collect::<Vec<_>>(),
            ["slow", "medium", "fast"]
        );
        assert!(matches!(
            &rows[1].outcome,
            RowOutcome::Failed { reason, .. } if reason.starts_with("Malformed metric log")
        ));
        measured(&rows[2]);
        assert!(report.directory.ends_with("Presets comparison at CRF 24"));
    }

    #[test]
    fn test_conflicting_sweep_spawns_nothing() {
        let temp = tempfile::tempdir().unwrap();
        let config = config(
            temp.path(),
            &["--crf", "20", "23", "-p", "slow", "fast", "-e", "x265"],
        );
        let mut toolchain = FakeToolchain::default();

        let error = execute(&config, &mut toolchain).unwrap_err();

        assert!(matches!(
            error.downcast_ref::<PipelineError>(),
            Some(PipelineError::InvalidSweepConfiguration(_))
        ));
        assert!(toolchain.encodes.is_empty());
        assert_eq!(toolchain.metric_runs, 0);
        assert!(!temp.path().join("out").exists());
    }

    #[test]
    fn test_unknown_encoder_spawns_nothing() {
        let temp = tempfile::tempdir().unwrap();
        let config = config(temp.path(), &["-e", "vp9"]);
        let mut toolchain = FakeToolchain::default();

        let error = execute(&config, &mut toolchain).unwrap_err();

        assert!(matches!(
            error.downcast_ref::<PipelineError>(),
            Some(PipelineError::UnknownEncoder(_))
        ));
        assert!(!temp.path().join("out").exists());
    }

    #[test]
    fn test_plan_validation() {
        let x264 = profile::lookup("x264").unwrap();
        let av1 = profile::lookup("av1").unwrap();
        let nvenc = profile::lookup("hevc_nvenc").unwrap();

        assert!(SweepPlan::new(x264, &[20, 60], &[], 5).is_err());
        assert!(SweepPlan::new(x264, &[20, 20], &[], 5).is_err());
        assert!(SweepPlan::new(av1, &[30], &["slow".to_owned()], 5).is_err());
        assert!(SweepPlan::new(nvenc, &[], &["slow".to_owned(), "ultrafast".to_owned()], 5).is_err());

        let plan = SweepPlan::new(av1, &[30, 40], &[], 3).unwrap();
        assert_eq!(plan.cpu_used, Some(3));
        assert_eq!(plan.directory_name(), "CRF comparison at cpu-used 3");
        assert_eq!(plan.points()[1].file_stem, "CRF 40");

        let plan = SweepPlan::new(x264, &[], &[], 5).unwrap();
        assert_eq!(plan.cpu_used, None);
        assert_eq!(
            plan.points(),
            [SweepPoint {
                label: "23".to_owned(),
                file_stem: "CRF 23".to_owned(),
                quality: 23,
                preset: Some("medium".to_owned()),
            }]
        );
    }

    #[test]
    fn test_encode_length_cuts_reference() {
        let temp = tempfile::tempdir().unwrap();
        let config = config(temp.path(), &["-t", "30", "--crf", "23"]);
        let mut toolchain = FakeToolchain::default();

        let report = execute(&config, &mut toolchain).unwrap();

        assert_eq!(
            report.header.as_deref(),
            Some("You chose to encode clip.mkv for 30 seconds using x264.")
        );
        assert!(report.directory.join("clip [30s].mkv").exists());
    }

    #[test]
    fn test_no_transcoding_mode() {
        let temp = tempfile::tempdir().unwrap();
        let transcoded = temp.path().join("transcoded.mp4");
        std::fs::write(&transcoded, vec![0_u8; 1_000_000]).unwrap();

        let config = config(
            temp.path(),
            &[
                "--no-transcoding-mode",
                "--transcoded-video-path",
                transcoded.to_str().unwrap(),
            ],
        );

        let mut toolchain = FakeToolchain::default();
        toolchain.scores.insert("QualityMetrics".to_owned(), vec![80.0]);

        let report = execute(&config, &mut toolchain).unwrap();

        assert!(toolchain.encodes.is_empty());
        assert!(report.summary.is_none());
        assert!(!report.table.include_time);
        assert_eq!(report.directory, temp.path().join("out"));

        let rows = report.table.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].label, "transcoded.mp4");

        let metrics = measured(&rows[0]);
        assert_eq!(metrics.elapsed, None);
        assert_eq!(metrics.size_mb, 1.0);
        assert_eq!(metrics.quality.vmaf, 80.0);
    }
}
