//! Report rendering: collect every registered buffer under the manager
//! lock, correct and clean the samples, and write a bordered table (or
//! JSON) to the caller's sink.
//!
//! Dumping is a quiescent-point operation. Recording concurrently with a
//! dump is undefined, by the same contract the storage layer documents.

use std::collections::BTreeMap;
use std::io::Write;

use crate::clean::clean;
use crate::error::Error;
use crate::manager::{manager, Calibration};
use crate::ring::KEY_PULSE;
use crate::stats::{summarize, Summary};
use crate::tsc::{calib_key, Mode};
use crate::Cycles;

/// Unit the report's duration columns are rendered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Cycles,
    Time,
}

/// Whether samples are reported as recorded or with the measured
/// instrumentation overhead subtracted (clamped at zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Samples {
    Raw,
    Calibrated,
}

const WIDTH: usize = 121;

/// Adaptive time rendering: two decimals, unit chosen by magnitude.
pub fn format_time(ns: f64) -> String {
    if ns < 1e3 {
        format!("{ns:.2} ns")
    } else if ns < 1e6 {
        format!("{:.2} us", ns / 1e3)
    } else if ns < 1e9 {
        format!("{:.2} ms", ns / 1e6)
    } else if ns < 60e9 {
        format!("{:.2} s", ns / 1e9)
    } else {
        format!("{:.2} min", ns / 60e9)
    }
}

/// Metric-suffix cycle rendering: two decimals, K/M/B/T steps.
pub fn format_cycles(cycles: f64) -> String {
    if cycles < 1e3 {
        format!("{cycles:.2}")
    } else if cycles < 1e6 {
        format!("{:.2} K", cycles / 1e3)
    } else if cycles < 1e9 {
        format!("{:.2} M", cycles / 1e6)
    } else if cycles < 1e12 {
        format!("{:.2} B", cycles / 1e9)
    } else {
        format!("{:.2} T", cycles / 1e12)
    }
}

fn format_value(v: f64, unit: Unit) -> String {
    match unit {
        Unit::Cycles => format_cycles(v),
        Unit::Time => format_time(v),
    }
}

/// One rendered component: cleaned summary plus the bypass count.
struct Row {
    name: &'static str,
    summary: Summary,
    bypass: usize,
}

/// Collect, correct, clean and summarize everything recorded so far.
/// Buffers sharing an id are merged across threads after the per-buffer
/// offset subtraction (each buffer knows its own mode pair).
fn build_rows(cal: &Calibration, unit: Unit, data: Samples) -> Vec<Row> {
    let mgr = manager();
    let mut merged: BTreeMap<(&'static str, usize), Vec<Cycles>> = BTreeMap::new();
    for buf in mgr.collect_buffers() {
        let offset = match data {
            Samples::Raw => 0,
            Samples::Calibrated => mgr.calibration_offset(buf.calib_key),
        };
        merged
            .entry((buf.name, buf.addr))
            .or_default()
            .extend(buf.samples.iter().map(|&s| s.saturating_sub(offset)));
    }

    let mut rows = Vec::with_capacity(merged.len());
    for ((name, _addr), samples) in merged {
        if samples.is_empty() {
            continue;
        }
        let values: Vec<f64> = match unit {
            Unit::Cycles => samples.iter().map(|&s| s as f64).collect(),
            Unit::Time => samples
                .iter()
                .map(|&s| s as f64 / cal.cycles_per_ns)
                .collect(),
        };
        let cleaned = clean(&values);
        if let Some(summary) = summarize(&cleaned.samples) {
            rows.push(Row {
                name,
                summary,
                bypass: cleaned.bypass,
            });
        }
    }
    rows
}

fn border(sink: &mut impl Write, fill: char) -> std::io::Result<()> {
    let line: String = std::iter::repeat(fill).take(WIDTH - 2).collect();
    writeln!(sink, "#{line}#")
}

fn write_overhead_table(
    sink: &mut impl Write,
    cal: &Calibration,
    unit: Unit,
) -> std::io::Result<()> {
    let show = |key: u8| -> String {
        let offset = manager().calibration_offset(key) as f64;
        match unit {
            Unit::Cycles => format_cycles(offset),
            Unit::Time => format_time(offset / cal.cycles_per_ns),
        }
    };

    border(sink, '=')?;
    writeln!(sink, "# CALIBRATION OVERHEAD (start mode x stop mode)")?;
    border(sink, '=')?;
    writeln!(
        sink,
        "{:<14}{:>12}{:>12}{:>12}",
        "START \\ STOP", "FAST", "MID", "HARD"
    )?;
    for (label, start) in [("FAST", Mode::Fast), ("MID", Mode::Mid), ("HARD", Mode::Hard)] {
        writeln!(
            sink,
            "{:<14}{:>12}{:>12}{:>12}",
            label,
            show(calib_key(start, Mode::Fast)),
            show(calib_key(start, Mode::Mid)),
            show(calib_key(start, Mode::Hard)),
        )?;
    }
    writeln!(sink, "{:<14}{:>12}", "PULSE", show(KEY_PULSE))?;
    border(sink, '-')?;
    Ok(())
}

/// Render the full report into `sink`.
pub fn dump(sink: &mut impl Write, unit: Unit, data: Samples) -> Result<(), Error> {
    let cal = manager().ensure_calibrated();
    let rows = build_rows(cal, unit, data);

    let unit_label = match unit {
        Unit::Cycles => "CYCLES",
        Unit::Time => "TIME",
    };
    let data_label = match data {
        Samples::Raw => "RAW",
        Samples::Calibrated => "CALIBRATED",
    };
    let clock_note = if unit == Unit::Time && cal.clock_fallback {
        " [uncalibrated clock]"
    } else {
        ""
    };

    if data == Samples::Calibrated {
        write_overhead_table(sink, cal, unit)?;
    }

    border(sink, '=')?;
    writeln!(
        sink,
        "# METRONOME TELEMETRY REPORT ({unit_label}, {data_label}){clock_note}"
    )?;
    border(sink, '=')?;
    writeln!(
        sink,
        "{:<25}{:>8}{:>12}{:>12}{:>12}{:>8}{:>12}{:>12}{:>12}{:>8}",
        "COMPONENT",
        "SAMPLES",
        "AVG",
        "MEDIAN",
        "STD DEV",
        "SKEW",
        "MIN",
        "MAX",
        "RANGE",
        "BYPASS"
    )?;
    border(sink, '-')?;

    for row in &rows {
        let s = &row.summary;
        writeln!(
            sink,
            "{:<25}{:>8}{:>12}{:>12}{:>12}{:>8.2}{:>12}{:>12}{:>12}{:>8}",
            row.name,
            s.samples,
            format_value(s.avg, unit),
            format_value(s.median, unit),
            format_value(s.std_dev, unit),
            s.skew,
            format_value(s.min, unit),
            format_value(s.max, unit),
            format_value(s.range, unit),
            row.bypass,
        )?;
    }

    border(sink, '=')?;
    Ok(())
}

#[derive(serde::Serialize)]
struct JsonComponent {
    component: &'static str,
    bypass: usize,
    #[serde(flatten)]
    summary: Summary,
}

#[derive(serde::Serialize)]
struct JsonReport {
    cycles_per_ns: f64,
    components: Vec<JsonComponent>,
}

/// Machine-readable dump: raw cycle statistics per component plus the
/// calibrated tick ratio, so consumers can convert units themselves.
pub fn dump_json(sink: &mut impl Write) -> Result<(), Error> {
    let cal = manager().ensure_calibrated();
    let rows = build_rows(cal, Unit::Cycles, Samples::Raw);

    let report = JsonReport {
        cycles_per_ns: cal.cycles_per_ns,
        components: rows
            .into_iter()
            .map(|row| JsonComponent {
                component: row.name,
                bypass: row.bypass,
                summary: row.summary,
            })
            .collect(),
    };
    serde_json::to_writer(&mut *sink, &report)?;
    writeln!(sink)?;
    Ok(())
}
