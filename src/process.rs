use std::io::{BufRead, BufReader, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::Context;
use indicatif::ProgressBar;
use tracing::debug;

use crate::arguments::ProcessInvocation;
use crate::error::PipelineError;
use crate::util::create_progress_style;

const PROGRESS_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] {msg:<32} [{wide_bar:.cyan/blue}] {percent:>3}% {human_pos:>8}/{human_len:>8} ({smooth_per_sec:>6} FPS, ETA: {smooth_eta:>3})";

#[derive(Copy, Clone, Debug)]
pub struct RunOutcome {
    pub status: ExitStatus,
    pub elapsed: Duration,
}

impl RunOutcome {
    #[must_use]
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Number of frames a run is expected to report, padded by one so float
/// truncation of the frame rate never leaves the bar short of completion.
#[allow(clippy::as_conversions)]
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_sign_loss)]
#[must_use]
pub fn expected_units(frame_rate: f64, duration: f64) -> u64 {
    let frames = (frame_rate * duration).ceil();

    if frames.is_finite() && frames > 0.0 {
        frames as u64 + 1
    } else {
        1
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ProgressState {
    pub estimated_total: u64,
    pub current: u64,
    pub finished: bool,
}

impl ProgressState {
    #[must_use]
    pub const fn new(estimated_total: u64) -> Self {
        Self {
            estimated_total,
            current: 0,
            finished: false,
        }
    }

    /// Applies one line of FFmpeg's `-progress` output. Returns whether anything changed.
    pub fn observe(&mut self, line: &str) -> bool {
        let Some((key, value)) = line.split_once('=') else {
            return false;
        };

        match key.trim() {
            "frame" => match value.trim().parse::<u64>() {
                Ok(frame) if frame > self.current => {
                    self.current = frame;
                    true
                }
                _ => false,
            },
            "progress" if value.trim() == "end" => {
                self.finished = true;
                true
            }
            _ => false,
        }
    }

    /// Completed units clamped to the estimate, for display.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.current.min(self.estimated_total)
    }
}

pub trait ProgressSink {
    fn update(&mut self, state: &ProgressState);
    fn finish(&mut self, state: &ProgressState);
}

impl ProgressSink for ProgressBar {
    fn update(&mut self, state: &ProgressState) {
        self.set_position(state.position());
    }

    fn finish(&mut self, state: &ProgressState) {
        if state.finished {
            self.set_position(state.estimated_total);
        }

        ProgressBar::finish(self);
    }
}

/// Folds progress lines into the state, reporting each change to the sink.
pub fn track_progress<I, S>(lines: I, initial: ProgressState, sink: &mut S) -> ProgressState
where
    I: IntoIterator<Item = String>,
    S: ProgressSink + ?Sized,
{
    let state = lines.into_iter().fold(initial, |mut state, line| {
        if state.observe(&line) {
            sink.update(&state);
        }

        state
    });

    sink.finish(&state);

    state
}

/// Splits a progress stream into lines, replacing invalid UTF-8 instead of stopping at it.
pub fn progress_lines<R: BufRead>(reader: R) -> impl Iterator<Item = String> {
    reader
        .split(b'\n')
        .map_while(Result::ok)
        .map(|line| String::from_utf8_lossy(&line).trim_end_matches('\r').to_owned())
}

/// Echoes the command line when requested and always records it at debug level.
#[allow(clippy::print_stdout)]
pub fn announce_command(invocation: &ProcessInvocation, show_commands: bool) {
    if show_commands {
        println!("Running the following command:\n{invocation}");
    }

    debug!("Spawning {invocation}");
}

fn progress_bar(expected_units: u64, message: &str) -> anyhow::Result<ProgressBar> {
    let progress_bar = ProgressBar::new(expected_units);
    progress_bar.set_style(
        create_progress_style(PROGRESS_TEMPLATE)
            .context("Unable to create process progress bar style")?,
    );
    progress_bar.set_message(message.to_owned());

    Ok(progress_bar)
}

pub struct Supervisor {
    show_commands: bool,
}

impl Supervisor {
    #[must_use]
    pub const fn new(show_commands: bool) -> Self {
        Self { show_commands }
    }

    /// Runs the invocation to completion. The exit status is reported, not judged.
    pub fn run(
        &self,
        invocation: &ProcessInvocation,
        expected_units: u64,
        message: &str,
    ) -> anyhow::Result<RunOutcome> {
        let mut progress_bar = progress_bar(expected_units, message)?;

        announce_command(invocation, self.show_commands);

        let spawn_error = |source: std::io::Error| PipelineError::ProcessSpawnError {
            program: invocation.program().to_owned(),
            source,
        };

        let start = Instant::now();

        let mut child = Command::new(invocation.program())
            .args(invocation.arguments())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(spawn_error)?;

        let Some(stdout) = child.stdout.take() else {
            if let Err(err) = child.kill().and_then(|()| child.wait().map(|_| ())) {
                debug!("Unable to stop {}: {err}", invocation.program());
            }

            return Err(spawn_error(std::io::Error::other("process unexpectedly had no stdout")).into());
        };

        progress_bar.enable_steady_tick(Duration::from_secs(1));

        let mut reader = BufReader::new(stdout);

        let state = track_progress(
            progress_lines(reader.by_ref()),
            ProgressState::new(expected_units),
            &mut progress_bar,
        );

        // Whatever is left must still be read or the child blocks on a full pipe.
        if let Err(err) = std::io::copy(&mut reader, &mut std::io::sink()) {
            debug!("Unable to drain {} output: {err}", invocation.program());
        }

        let status = child
            .wait()
            .with_context(|| format!("Unable to wait for {} subprocess", invocation.program()))?;

        let elapsed = start.elapsed();

        debug!(
            "{} exited with {status} after {:.2}s ({} of ~{} frames)",
            invocation.program(),
            elapsed.as_secs_f64(),
            state.current,
            state.estimated_total
        );

        Ok(RunOutcome { status, elapsed })
    }
}
