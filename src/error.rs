use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unknown encoder '{0}'")]
    UnknownEncoder(String),

    #[error("Encoder {encoder} does not support {parameter}")]
    UnsupportedParameter { encoder: String, parameter: String },

    #[error("Encoder {encoder} requires {parameter}, but none was given")]
    MissingParameter { encoder: String, parameter: String },

    #[error("Unable to spawn {program}")]
    ProcessSpawnError {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}")]
    ProcessFailed { program: String, status: ExitStatus },

    #[error("Malformed metric log {path:?}: {reason}")]
    MalformedMetricLog { path: PathBuf, reason: String },

    #[error("Invalid sweep configuration: {0}")]
    InvalidSweepConfiguration(String),
}

impl PipelineError {
    pub fn unsupported(encoder: &str, parameter: impl Into<String>) -> Self {
        Self::UnsupportedParameter {
            encoder: encoder.to_owned(),
            parameter: parameter.into(),
        }
    }

    pub fn missing(encoder: &str, parameter: impl Into<String>) -> Self {
        Self::MissingParameter {
            encoder: encoder.to_owned(),
            parameter: parameter.into(),
        }
    }

    pub fn malformed_log(path: &std::path::Path, reason: impl Into<String>) -> Self {
        Self::MalformedMetricLog {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Per-run failures end up as failed rows instead of aborting the sweep.
    #[must_use]
    pub const fn is_run_failure(&self) -> bool {
        matches!(
            self,
            Self::ProcessFailed { .. } | Self::MalformedMetricLog { .. }
        )
    }
}
