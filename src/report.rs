use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use plotters::prelude::*;
use prettytable::{format, Cell, Row, Table};
use tracing::info;

use crate::metrics::{Metric, MetricLog};
use crate::sweep::{ComparisonTable, RowOutcome, SweepReport, SweepSummary};
use crate::util::{format_decimal, HumanBitrate};

pub const TABLE_FILENAME: &str = "Table.txt";

const FAILED_CELL: &str = "FAILED";
const MISSING_CELL: &str = "-";

fn headings(table: &ComparisonTable) -> Vec<String> {
    let mut headings = vec![];

    if let Some(label_heading) = &table.label_heading {
        headings.push(label_heading.clone());
    }

    if table.include_time {
        headings.push("Encoding Time (s)".to_owned());
    }

    headings.push("Size".to_owned());
    headings.push("Bitrate".to_owned());
    headings.extend(table.metrics.iter().map(ToString::to_string));

    headings
}

fn cells(table: &ComparisonTable, label: &str, outcome: &RowOutcome) -> Vec<String> {
    let places = table.decimal_places;
    let mut cells = vec![];

    if table.label_heading.is_some() {
        cells.push(label.to_owned());
    }

    match outcome {
        RowOutcome::Measured(metrics) => {
            if table.include_time {
                cells.push(metrics.elapsed.map_or_else(
                    || MISSING_CELL.to_owned(),
                    |elapsed| format_decimal(elapsed, places),
                ));
            }

            cells.push(format!("{} MB", format_decimal(metrics.size_mb, places)));
            cells.push(metrics.bitrate_kbps.map_or_else(
                || MISSING_CELL.to_owned(),
                |kbps| format!("{} kbit/s", format_decimal(kbps, places)),
            ));

            cells.extend(table.metrics.iter().map(|metric| {
                metrics.quality.value(*metric).map_or_else(
                    || MISSING_CELL.to_owned(),
                    |value| format_decimal(value, places),
                )
            }));
        }
        RowOutcome::Failed { .. } => {
            let width = headings(table).len() - cells.len();
            cells.push(FAILED_CELL.to_owned());
            cells.extend(std::iter::repeat(MISSING_CELL.to_owned()).take(width - 1));
        }
    }

    cells
}

#[must_use]
pub fn render_table(table: &ComparisonTable) -> String {
    let mut output = Table::new();
    output.set_format(*format::consts::FORMAT_BOX_CHARS);
    output.set_titles(Row::new(
        headings(table).iter().map(|heading| Cell::new(heading)).collect(),
    ));

    for row in table.rows() {
        output.add_row(Row::new(
            cells(table, &row.label, &row.outcome)
                .iter()
                .map(|cell| Cell::new(cell))
                .collect(),
        ));
    }

    output.to_string()
}

#[must_use]
pub fn render_failures(table: &ComparisonTable) -> Option<String> {
    let failures: Vec<String> = table
        .rows()
        .iter()
        .filter_map(|row| match &row.outcome {
            RowOutcome::Failed { stage, reason } => {
                Some(format!("{}: failed while {stage}: {reason}", row.label))
            }
            RowOutcome::Measured(_) => None,
        })
        .collect();

    (!failures.is_empty()).then(|| format!("Failed runs:\n{}", failures.join("\n")))
}

#[must_use]
pub fn render_summary(summary: &SweepSummary) -> String {
    let (constant_name, constant_value) = &summary.constant_parameter;

    [
        format!("File Transcoded: {}", summary.source_filename),
        format!(
            "Bitrate: {}",
            summary.original_bitrate.map_or_else(
                || "unknown".to_owned(),
                |bit_rate| HumanBitrate(bit_rate).to_string()
            )
        ),
        format!("Encoder used for the transcodes: {}", summary.encoder),
        format!("{constant_name} used for the transcodes: {constant_value}"),
        format!(
            "Filter(s) used: {}",
            summary.filter_chain.as_deref().unwrap_or("None")
        ),
        format!("n_subsample: {}", summary.subsample),
    ]
    .join("\n")
}

#[must_use]
pub fn render_report(report: &SweepReport) -> String {
    let mut sections: Vec<String> = report.header.iter().cloned().collect();

    sections.push(render_table(&report.table).trim_end().to_owned());
    sections.extend(render_failures(&report.table));
    sections.extend(report.summary.as_ref().map(render_summary));

    format!("{}\n", sections.join("\n\n"))
}

/// Writes `Table.txt` into the report's directory and returns its path.
pub fn write_report(report: &SweepReport) -> anyhow::Result<PathBuf> {
    let path = report.directory.join(TABLE_FILENAME);

    std::fs::write(&path, render_report(report))
        .with_context(|| format!("Unable to write comparison table to {path:?}"))?;

    info!("Comparison table written to {path:?}");

    Ok(path)
}

/// Plots one metric per frame as an SVG line chart. Logs without the metric produce no file.
pub fn plot_quality(path: &Path, label: &str, log: &MetricLog, metric: Metric) -> anyhow::Result<()> {
    let series = log.series(metric);

    let Some(last_frame) = series.iter().map(|(frame, _)| *frame).max() else {
        return Ok(());
    };

    let (low, high) = series
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(low, high), (_, value)| {
            (low.min(*value), high.max(*value))
        });

    let plot_error = |err: String| anyhow!("Unable to plot {metric} for {label}: {err}");

    let root = SVGBackend::new(path, (1280, 720)).into_drawing_area();
    root.fill(&WHITE).map_err(|err| plot_error(err.to_string()))?;

    let mut chart = ChartBuilder::on(&root)
        .caption(format!("{metric} per frame ({label})"), ("sans-serif", 24))
        .margin(16)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(0..last_frame.max(1), (low.floor() - 1.0)..(high.ceil() + 1.0))
        .map_err(|err| plot_error(err.to_string()))?;

    chart
        .configure_mesh()
        .x_desc("Frame")
        .y_desc(metric.to_string())
        .draw()
        .map_err(|err| plot_error(err.to_string()))?;

    chart
        .draw_series(LineSeries::new(series.iter().copied(), &BLUE))
        .map_err(|err| plot_error(err.to_string()))?;

    if let Some(mean) = log.summary.value(metric) {
        chart
            .draw_series(LineSeries::new([(0, mean), (last_frame, mean)], &RED))
            .map_err(|err| plot_error(err.to_string()))?;
    }

    root.present().map_err(|err| plot_error(err.to_string()))?;

    Ok(())
}
