use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::profile::{EncoderFamily, EncoderProfile};

const FFMPEG_BASE_ARGUMENTS: [&str; 6] = ["-progress", "-", "-nostats", "-loglevel", "warning", "-y"];

const OPTION_SPECIAL_CHARACTERS: [char; 2] = ['\'', ':'];

const GRAPH_SPECIAL_CHARACTERS: [char; 5] = ['\'', '[', ']', ',', ';'];

/// A fully resolved external command. Built once per run and never modified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessInvocation {
    program: String,
    arguments: Vec<String>,
}

impl ProcessInvocation {
    #[must_use]
    pub const fn new(program: String, arguments: Vec<String>) -> Self {
        Self { program, arguments }
    }

    /// Wraps the given arguments in an `ffmpeg` call that reports progress on stdout.
    #[must_use]
    pub fn ffmpeg(arguments: Vec<String>) -> Self {
        let mut full_arguments: Vec<String> = FFMPEG_BASE_ARGUMENTS
            .iter()
            .map(|argument| (*argument).to_owned())
            .collect();

        full_arguments.extend(arguments);

        Self::new("ffmpeg".to_owned(), full_arguments)
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    /// Returns the argument following the first occurrence of `flag`.
    #[must_use]
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        self.arguments
            .iter()
            .position(|argument| argument == flag)
            .and_then(|index| self.arguments.get(index + 1))
            .map(String::as_str)
    }
}

impl fmt::Display for ProcessInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;

        for argument in &self.arguments {
            if argument.is_empty() || argument.contains(' ') {
                write!(f, " \"{argument}\"")?;
            } else {
                write!(f, " {argument}")?;
            }
        }

        Ok(())
    }
}

/// Settings for a single encode. Fields an encoder does not need may be left unset.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub encoder: String,
    pub quality: Option<u32>,
    pub preset: Option<String>,
    pub cpu_used: Option<u8>,
    pub filter_chain: Option<String>,
    pub input: PathBuf,
    pub output: PathBuf,
}

impl EncoderFamily {
    fn tuning_arguments(
        self,
        profile: &EncoderProfile,
        run: &RunConfig,
    ) -> Result<Vec<String>, PipelineError> {
        let quality = run
            .quality
            .ok_or_else(|| PipelineError::missing(profile.name, "a quality value"))?;
        profile.check_quality(quality)?;

        let preset = |run: &RunConfig| -> Result<&'static str, PipelineError> {
            let preset = run
                .preset
                .as_deref()
                .ok_or_else(|| PipelineError::missing(profile.name, "a preset"))?;

            profile.resolve_preset(preset)
        };

        let arguments = match self {
            Self::Software => vec![
                profile.quality_flag.to_owned(),
                quality.to_string(),
                "-preset".to_owned(),
                preset(run)?.to_owned(),
            ],
            Self::Aom => {
                if let Some(preset) = &run.preset {
                    return Err(PipelineError::unsupported(
                        profile.name,
                        format!("preset '{preset}' (use cpu-used instead)"),
                    ));
                }

                let cpu_used = run
                    .cpu_used
                    .ok_or_else(|| PipelineError::missing(profile.name, "a cpu-used value"))?;

                vec![
                    profile.quality_flag.to_owned(),
                    quality.to_string(),
                    "-b:v".to_owned(),
                    "0".to_owned(),
                    "-cpu-used".to_owned(),
                    cpu_used.to_string(),
                ]
            }
            Self::Nvenc => {
                let mut arguments = vec![
                    "-preset".to_owned(),
                    preset(run)?.to_owned(),
                    "-tune".to_owned(),
                    "hq".to_owned(),
                    "-bufsize".to_owned(),
                    "5M".to_owned(),
                    "-rc".to_owned(),
                    "constqp".to_owned(),
                    profile.quality_flag.to_owned(),
                    quality.to_string(),
                ];

                arguments.extend(
                    [
                        "-b:v",
                        "0K",
                        "-g",
                        "250",
                        "-bf",
                        "3",
                        "-b_ref_mode",
                        "middle",
                        "-temporal-aq",
                        "1",
                        "-rc-lookahead",
                        "20",
                        "-i_qfactor",
                        "0.75",
                        "-b_qfactor",
                        "1.1",
                    ]
                    .map(String::from),
                );

                arguments
            }
            Self::Qsv => vec![
                profile.quality_flag.to_owned(),
                quality.to_string(),
                "-preset".to_owned(),
                preset(run)?.to_owned(),
                "-look_ahead".to_owned(),
                "1".to_owned(),
                "-look_ahead_depth".to_owned(),
                "40".to_owned(),
            ],
        };

        Ok(arguments)
    }
}

pub fn build_encode_arguments(
    run: &RunConfig,
    profile: &EncoderProfile,
) -> Result<ProcessInvocation, PipelineError> {
    if run.encoder != profile.name {
        return Err(PipelineError::UnknownEncoder(run.encoder.clone()));
    }

    let tuning = profile.family.tuning_arguments(profile, run)?;

    let mut arguments: Vec<String> = profile
        .family
        .hwaccel_prefix()
        .iter()
        .map(|argument| (*argument).to_owned())
        .collect();

    arguments.push("-i".to_owned());
    arguments.push(run.input.to_string_lossy().to_string());
    arguments.push("-map".to_owned());
    arguments.push("0:V".to_owned());
    arguments.push("-c:v".to_owned());
    arguments.push(profile.codec.to_owned());
    arguments.extend(tuning);

    if let Some(filter_chain) = &run.filter_chain {
        arguments.push("-vf".to_owned());
        arguments.push(filter_chain.clone());
    }

    arguments.push(run.output.to_string_lossy().to_string());

    Ok(ProcessInvocation::ffmpeg(arguments))
}

#[derive(Clone, Debug)]
pub struct MetricOptions {
    pub log_path: PathBuf,
    pub model_path: PathBuf,
    pub subsample: u32,
    pub phone_model: bool,
    pub psnr: bool,
    pub ssim: bool,
    pub threads: usize,
    /// Applied to the reference leg only.
    pub filter_chain: Option<String>,
}

impl MetricOptions {
    #[must_use]
    pub fn option_string(&self) -> String {
        let flag = |enabled: bool| if enabled { "1" } else { "0" };

        [
            ("log_fmt", "json".to_owned()),
            (
                "log_path",
                escape_option_value(&self.log_path.to_string_lossy()),
            ),
            (
                "model_path",
                escape_option_value(&self.model_path.to_string_lossy()),
            ),
            ("n_subsample", self.subsample.to_string()),
            ("phone_model", flag(self.phone_model).to_owned()),
            ("psnr", flag(self.psnr).to_owned()),
            ("ssim", flag(self.ssim).to_owned()),
            ("n_threads", self.threads.to_string()),
        ]
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(":")
    }
}

fn escape_with(value: &str, special_characters: &[char]) -> String {
    let mut escaped = String::with_capacity(value.len());

    for character in value.chars() {
        if character == '\\' || special_characters.contains(&character) {
            escaped.push('\\');
        }

        escaped.push(character);
    }

    escaped
}

/// Escapes a single filter option value so it cannot end the option early.
#[must_use]
pub fn escape_option_value(value: &str) -> String {
    escape_with(value, &OPTION_SPECIAL_CHARACTERS)
}

/// Escapes a filter's complete argument string for embedding in a filter graph.
///
/// The graph parser strips one level of escaping before the filter sees its
/// options, so option values end up escaped twice.
#[must_use]
pub fn escape_graph_arguments(arguments: &str) -> String {
    escape_with(arguments, &GRAPH_SPECIAL_CHARACTERS)
}

pub fn build_metric_arguments(
    distorted: &Path,
    reference: &Path,
    fps: &str,
    options: &MetricOptions,
) -> Result<ProcessInvocation, PipelineError> {
    if fps.is_empty() {
        return Err(PipelineError::missing("libvmaf", "a frame rate"));
    }

    if options.subsample == 0 {
        return Err(PipelineError::unsupported("libvmaf", "n_subsample=0"));
    }

    let reference_filters = options
        .filter_chain
        .as_ref()
        .map_or_else(String::new, |filter_chain| format!(",{filter_chain}"));

    let filter_graph = format!(
        "[0:v]setpts=PTS-STARTPTS[dist];[1:v]setpts=PTS-STARTPTS{reference_filters}[ref];[dist][ref]libvmaf={}",
        escape_graph_arguments(&options.option_string())
    );

    let arguments = vec![
        "-r".to_owned(),
        fps.to_owned(),
        "-i".to_owned(),
        distorted.to_string_lossy().to_string(),
        "-r".to_owned(),
        fps.to_owned(),
        "-i".to_owned(),
        reference.to_string_lossy().to_string(),
        "-map".to_owned(),
        "0:V".to_owned(),
        "-map".to_owned(),
        "1:V".to_owned(),
        "-lavfi".to_owned(),
        filter_graph,
        "-f".to_owned(),
        "null".to_owned(),
        "-".to_owned(),
    ];

    Ok(ProcessInvocation::ffmpeg(arguments))
}


#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::profile::{lookup, names};

    fn run_for(profile: &EncoderProfile, quality: u32) -> RunConfig {
        RunConfig {
            encoder: profile.name.to_owned(),
            quality: Some(quality),
            preset: profile.default_preset.map(ToOwned::to_owned),
            cpu_used: Some(5),
            filter_chain: None,
            input: PathBuf::from("input.mkv"),
            output: PathBuf::from("out/CRF 23.mkv"),
        }
    }

    fn metric_options(log_path: &str) -> MetricOptions {
        MetricOptions {
            log_path: PathBuf::from(log_path),
            model_path: PathBuf::from("vmaf_models/vmaf_v0.6.1.json"),
            subsample: 1,
            phone_model: false,
            psnr: false,
            ssim: true,
            threads: 4,
            filter_chain: None,
        }
    }

    /// Splits on colons that are not preceded by an escaping backslash.
    fn split_unescaped(value: &str) -> Vec<String> {
        let mut parts = vec![String::new()];
        let mut escaped = false;

        for character in value.chars() {
            if escaped {
                escaped = false;
            } else if character == '\\' {
                escaped = true;
            } else if character == ':' {
                parts.push(String::new());
                continue;
            }

            if let Some(part) = parts.last_mut() {
                part.push(character);
            }
        }

        parts
    }

    #[test]
    fn test_codec_once_and_output_last() {
        for name in names() {
            let profile = lookup(name).unwrap();
            let invocation = build_encode_arguments(&run_for(profile, 23), profile).unwrap();
            let arguments = invocation.arguments();

            assert_eq!(invocation.program(), "ffmpeg");
            assert_eq!(
                arguments.iter().filter(|a| *a == profile.codec).count(),
                1,
                "{name}: {invocation}"
            );
            assert_eq!(arguments.iter().filter(|a| *a == "-c:v").count(), 1);
            assert_eq!(arguments.last().unwrap(), "out/CRF 23.mkv");
        }
    }

    #[test]
    fn test_software_arguments() {
        let profile = lookup("x264").unwrap();
        let mut run = run_for(profile, 18);
        run.preset = Some("veryslow".to_owned());
        run.filter_chain = Some("crop=1920:800:0:140".to_owned());

        let invocation = build_encode_arguments(&run, profile).unwrap();

        assert_eq!(
            invocation.arguments(),
            [
                "-progress",
                "-",
                "-nostats",
                "-loglevel",
                "warning",
                "-y",
                "-i",
                "input.mkv",
                "-map",
                "0:V",
                "-c:v",
                "libx264",
                "-crf",
                "18",
                "-preset",
                "veryslow",
                "-vf",
                "crop=1920:800:0:140",
                "out/CRF 23.mkv",
            ]
        );
    }

    #[test]
    fn test_nvenc_maps_quality_and_preset() {
        let profile = lookup("hevc_nvenc").unwrap();
        let mut run = run_for(profile, 30);
        run.preset = Some("slow".to_owned());

        let invocation = build_encode_arguments(&run, profile).unwrap();
        let arguments = invocation.arguments();

        assert_eq!(&arguments[6..8], ["-hwaccel", "cuda"]);
        assert_eq!(invocation.value_of("-preset"), Some("p6"));
        assert_eq!(invocation.value_of("-rc"), Some("constqp"));
        assert_eq!(invocation.value_of("-qp"), Some("30"));
        assert_eq!(invocation.value_of("-rc-lookahead"), Some("20"));
        assert!(!arguments.iter().any(|a| a == "-crf"));
    }

    #[test]
    fn test_nvenc_unmapped_preset_fails() {
        let profile = lookup("h264_nvenc").unwrap();
        let mut run = run_for(profile, 30);
        run.preset = Some("ultrafast".to_owned());

        assert!(matches!(
            build_encode_arguments(&run, profile),
            Err(PipelineError::UnsupportedParameter { .. })
        ));
    }

    #[test]
    fn test_qsv_arguments() {
        let profile = lookup("av1_qsv").unwrap();
        let invocation = build_encode_arguments(&run_for(profile, 25), profile).unwrap();

        assert_eq!(invocation.value_of("-hwaccel"), Some("qsv"));
        assert_eq!(invocation.value_of("-global_quality:v"), Some("25"));
        assert_eq!(invocation.value_of("-preset"), Some("medium"));
        assert_eq!(invocation.value_of("-look_ahead_depth"), Some("40"));
    }

    #[test]
    fn test_aom_arguments() {
        let profile = lookup("av1").unwrap();
        let mut run = run_for(profile, 35);
        run.cpu_used = Some(3);

        let invocation = build_encode_arguments(&run, profile).unwrap();

        assert_eq!(invocation.value_of("-crf"), Some("35"));
        assert_eq!(invocation.value_of("-b:v"), Some("0"));
        assert_eq!(invocation.value_of("-cpu-used"), Some("3"));
        assert_eq!(invocation.value_of("-preset"), None);

        run.preset = Some("slow".to_owned());
        assert!(matches!(
            build_encode_arguments(&run, profile),
            Err(PipelineError::UnsupportedParameter { .. })
        ));
    }

    #[test]
    fn test_missing_fields_fail_fast() {
        let profile = lookup("x265").unwrap();

        let mut run = run_for(profile, 23);
        run.quality = None;
        assert!(matches!(
            build_encode_arguments(&run, profile),
            Err(PipelineError::MissingParameter { .. })
        ));

        let mut run = run_for(profile, 23);
        run.preset = None;
        assert!(matches!(
            build_encode_arguments(&run, profile),
            Err(PipelineError::MissingParameter { .. })
        ));

        let profile = lookup("av1").unwrap();
        let mut run = run_for(profile, 23);
        run.cpu_used = None;
        assert!(build_encode_arguments(&run, profile).is_err());
    }

    #[test]
    fn test_out_of_range_quality_fails() {
        let profile = lookup("x264").unwrap();

        assert!(matches!(
            build_encode_arguments(&run_for(profile, 52), profile),
            Err(PipelineError::UnsupportedParameter { .. })
        ));
    }

    proptest! {
        #[test]
        fn test_quality_round_trip(index in 0_usize..8, fraction in 0.0_f64..=1.0) {
            let profile = lookup(names()[index]).unwrap();
            let start = *profile.quality_range.start();
            let end = *profile.quality_range.end();

            #[allow(clippy::as_conversions, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let quality = start + (f64::from(end - start) * fraction).round() as u32;

            let invocation = build_encode_arguments(&run_for(profile, quality), profile).unwrap();
            let parsed: u32 = invocation.value_of(profile.quality_flag).unwrap().parse().unwrap();

            prop_assert_eq!(parsed, quality);
        }
    }

    #[test]
    fn test_metric_arguments_layout() {
        let mut options = metric_options("out/Raw JSON Data/CRF 23.json");
        options.filter_chain = Some("bwdif=mode=0".to_owned());

        let invocation = build_metric_arguments(
            Path::new("out/CRF 23.mkv"),
            Path::new("source.mkv"),
            "30000/1001",
            &options,
        )
        .unwrap();

        let arguments = invocation.arguments();
        assert_eq!(
            &arguments[6..18],
            [
                "-r",
                "30000/1001",
                "-i",
                "out/CRF 23.mkv",
                "-r",
                "30000/1001",
                "-i",
                "source.mkv",
                "-map",
                "0:V",
                "-map",
                "1:V",
            ]
        );

        let graph = invocation.value_of("-lavfi").unwrap();
        assert!(graph.starts_with(
            "[0:v]setpts=PTS-STARTPTS[dist];[1:v]setpts=PTS-STARTPTS,bwdif=mode=0[ref];[dist][ref]libvmaf=log_fmt=json:"
        ));
        assert!(graph.ends_with(":n_subsample=1:phone_model=0:psnr=0:ssim=1:n_threads=4"));
        assert_eq!(&arguments[arguments.len() - 3..], ["-f", "null", "-"]);
    }

    #[test]
    fn test_metric_log_path_is_escaped() {
        let options = metric_options("C:/vqm/(clip.mkv)/Raw JSON Data/CRF 23.json");
        let option_string = options.option_string();
        let parts = split_unescaped(&option_string);

        assert_eq!(parts.len(), 8);
        assert_eq!(
            parts[1],
            "log_path=C\\:/vqm/(clip.mkv)/Raw JSON Data/CRF 23.json"
        );

        for part in &parts {
            assert_eq!(part.matches('=').count(), 1, "{part}");
        }
    }

    #[test]
    fn test_escape_option_value() {
        assert_eq!(escape_option_value("plain/path.json"), "plain/path.json");
        assert_eq!(escape_option_value("a'b:c,d[e]f"), "a\\'b\\:c,d[e]f");
        assert_eq!(escape_option_value("C:\\logs"), "C\\:\\\\logs");
    }

    #[test]
    fn test_escape_graph_arguments() {
        assert_eq!(
            escape_graph_arguments("log_path=a\\:b[c],d;e'f"),
            "log_path=a\\\\:b\\[c\\]\\,d\\;e\\'f"
        );
    }

    #[test]
    fn test_metric_paths_survive_graph_and_option_parsing() {
        let log_path = "/vqm/(Movie: Part 1's [cut], x;y.mkv)/Raw JSON Data/CRF 23.json";
        let mut options = metric_options(log_path);
        options.model_path = PathBuf::from("C:/models/vmaf_v0.6.1.json");

        let invocation = build_metric_arguments(
            Path::new("out/CRF 23.mkv"),
            Path::new("source.mkv"),
            "24/1",
            &options,
        )
        .unwrap();

        let graph = invocation.value_of("-lavfi").unwrap();
        let (_, arguments) = graph.split_once("libvmaf=").unwrap();
        let (_, rest) = decode::token(arguments, "[],;");

        assert_eq!(rest, "", "graph parser stopped early in {graph}");
        assert_eq!(
            decode::libvmaf_option(graph, "log_path").as_deref(),
            Some(log_path)
        );
        assert_eq!(
            decode::libvmaf_option(graph, "model_path").as_deref(),
            Some("C:/models/vmaf_v0.6.1.json")
        );
        assert_eq!(
            decode::libvmaf_option(graph, "n_threads").as_deref(),
            Some("4")
        );
    }

    #[test]
    fn test_metric_arguments_reject_missing_fps() {
        assert!(build_metric_arguments(
            Path::new("a.mkv"),
            Path::new("b.mkv"),
            "",
            &metric_options("log.json")
        )
        .is_err());
    }
}
