use std::ops::RangeInclusive;

use crate::error::PipelineError;

const X264_PRESETS: &[&str] = &[
    "veryslow",
    "slower",
    "slow",
    "medium",
    "fast",
    "faster",
    "veryfast",
    "superfast",
    "ultrafast",
];

const NVENC_PRESETS: &[(&str, &str)] = &[("slow", "p6"), ("medium", "p4"), ("fast", "p2")];

const QSV_PRESETS: &[(&str, &str)] = &[
    ("veryslow", "veryslow"),
    ("slower", "slower"),
    ("slow", "slow"),
    ("medium", "medium"),
    ("fast", "fast"),
    ("faster", "faster"),
    ("veryfast", "veryfast"),
];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EncoderFamily {
    /// x264 and x265: native `-crf` and `-preset`.
    Software,
    /// libaom: `-crf` with `-b:v 0`, speed through `-cpu-used`.
    Aom,
    /// NVIDIA NVENC: constant-QP rate control, `p1`..`p7` presets.
    Nvenc,
    /// Intel Quick Sync: `-global_quality`, restricted preset names.
    Qsv,
}

impl EncoderFamily {
    #[must_use]
    pub const fn hwaccel_prefix(&self) -> &'static [&'static str] {
        match self {
            Self::Software | Self::Aom => &[],
            Self::Nvenc => &["-hwaccel", "cuda"],
            Self::Qsv => &["-hwaccel", "qsv"],
        }
    }

    #[must_use]
    pub const fn is_hardware(&self) -> bool {
        matches!(self, Self::Nvenc | Self::Qsv)
    }
}

#[derive(Copy, Clone, Debug)]
pub enum PresetVocabulary {
    /// Preset names are handed to the encoder unchanged.
    Native(&'static [&'static str]),
    /// Preset names are translated to encoder-internal names.
    Mapped(&'static [(&'static str, &'static str)]),
    /// The encoder has no preset option.
    None,
}

#[allow(clippy::module_name_repetitions)]
#[derive(Debug)]
pub struct EncoderProfile {
    pub name: &'static str,
    pub codec: &'static str,
    pub family: EncoderFamily,
    /// Flag carrying the quality value once it has been mapped for this encoder.
    pub quality_flag: &'static str,
    pub quality_range: RangeInclusive<u32>,
    pub presets: PresetVocabulary,
    pub default_quality: u32,
    pub default_preset: Option<&'static str>,
}

impl EncoderProfile {
    pub fn check_quality(&self, quality: u32) -> Result<(), PipelineError> {
        if self.quality_range.contains(&quality) {
            Ok(())
        } else {
            Err(PipelineError::unsupported(
                self.name,
                format!(
                    "quality value {quality} (supported range is {}-{})",
                    self.quality_range.start(),
                    self.quality_range.end()
                ),
            ))
        }
    }

    /// Translates a user-facing preset name to the value passed to the encoder.
    pub fn resolve_preset(&self, preset: &str) -> Result<&'static str, PipelineError> {
        let resolved = match self.presets {
            PresetVocabulary::Native(names) => names.iter().find(|name| **name == preset).copied(),
            PresetVocabulary::Mapped(mapping) => mapping
                .iter()
                .find(|(name, _internal)| *name == preset)
                .map(|(_name, internal)| *internal),
            PresetVocabulary::None => None,
        };

        resolved.ok_or_else(|| PipelineError::unsupported(self.name, format!("preset '{preset}'")))
    }

    #[must_use]
    pub const fn supports_presets(&self) -> bool {
        !matches!(self.presets, PresetVocabulary::None)
    }

    #[must_use]
    pub fn preset_names(&self) -> Vec<&'static str> {
        match self.presets {
            PresetVocabulary::Native(names) => names.to_vec(),
            PresetVocabulary::Mapped(mapping) => mapping.iter().map(|(name, _)| *name).collect(),
            PresetVocabulary::None => vec![],
        }
    }
}

static PROFILES: [EncoderProfile; 8] = [
    EncoderProfile {
        name: "x264",
        codec: "libx264",
        family: EncoderFamily::Software,
        quality_flag: "-crf",
        quality_range: 0..=51,
        presets: PresetVocabulary::Native(X264_PRESETS),
        default_quality: 23,
        default_preset: Some("medium"),
    },
    EncoderProfile {
        name: "x265",
        codec: "libx265",
        family: EncoderFamily::Software,
        quality_flag: "-crf",
        quality_range: 0..=51,
        presets: PresetVocabulary::Native(X264_PRESETS),
        default_quality: 23,
        default_preset: Some("medium"),
    },
    EncoderProfile {
        name: "av1",
        codec: "libaom-av1",
        family: EncoderFamily::Aom,
        quality_flag: "-crf",
        quality_range: 0..=63,
        presets: PresetVocabulary::None,
        default_quality: 23,
        default_preset: None,
    },
    EncoderProfile {
        name: "hevc_nvenc",
        codec: "hevc_nvenc",
        family: EncoderFamily::Nvenc,
        quality_flag: "-qp",
        quality_range: 0..=51,
        presets: PresetVocabulary::Mapped(NVENC_PRESETS),
        default_quality: 23,
        default_preset: Some("medium"),
    },
    EncoderProfile {
        name: "h264_nvenc",
        codec: "h264_nvenc",
        family: EncoderFamily::Nvenc,
        quality_flag: "-qp",
        quality_range: 0..=51,
        presets: PresetVocabulary::Mapped(NVENC_PRESETS),
        default_quality: 23,
        default_preset: Some("medium"),
    },
    EncoderProfile {
        name: "hevc_qsv",
        codec: "hevc_qsv",
        family: EncoderFamily::Qsv,
        quality_flag: "-global_quality:v",
        quality_range: 1..=51,
        presets: PresetVocabulary::Mapped(QSV_PRESETS),
        default_quality: 23,
        default_preset: Some("medium"),
    },
    EncoderProfile {
        name: "h264_qsv",
        codec: "h264_qsv",
        family: EncoderFamily::Qsv,
        quality_flag: "-global_quality:v",
        quality_range: 1..=51,
        presets: PresetVocabulary::Mapped(QSV_PRESETS),
        default_quality: 23,
        default_preset: Some("medium"),
    },
    EncoderProfile {
        name: "av1_qsv",
        codec: "av1_qsv",
        family: EncoderFamily::Qsv,
        quality_flag: "-global_quality:v",
        quality_range: 1..=51,
        presets: PresetVocabulary::Mapped(QSV_PRESETS),
        default_quality: 23,
        default_preset: Some("medium"),
    },
];

pub fn lookup(name: &str) -> Result<&'static EncoderProfile, PipelineError> {
    PROFILES
        .iter()
        .find(|profile| profile.name == name)
        .ok_or_else(|| PipelineError::UnknownEncoder(name.to_owned()))
}

#[must_use]
pub fn names() -> Vec<&'static str> {
    PROFILES.iter().map(|profile| profile.name).collect()
}
