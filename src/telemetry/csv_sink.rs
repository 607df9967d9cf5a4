//! Wide-format CSV telemetry log sink.
//!
//! One row per frame, one column per field. The header starts as
//! `timestamp,vin` and extends as new fields appear; when that happens
//! mid-stream the whole file is rewritten with the widened header so
//! existing rows stay aligned.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Local;

use super::decoder::{TelemetryFrame, TelemetryValue};
use super::fanout::FrameSink;

/// Fixed columns that always come first.
const FIXED_COLUMNS: [&str; 2] = ["timestamp", "vin"];

/// Flush to disk every N frames for crash safety.
const FLUSH_EVERY_FRAMES: u32 = 10;

/// Build a timestamped CSV log path under `log_dir`, like
/// `serve-{VIN}-{YYYYMMDD-HHMMSS}.csv`. Creates the directory if needed.
pub fn create_log_path(vin: &str, log_dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(log_dir)?;
    let stamp = Local::now().format("%Y%m%d-%H%M%S");
    Ok(log_dir.join(format!("serve-{vin}-{stamp}.csv")))
}

fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn parse_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                chars.next();
                current.push('"');
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    fields.push(current);
    fields
}

struct CsvState {
    writer: Option<BufWriter<File>>,
    fieldnames: Vec<String>,
    frame_count: u64,
    since_flush: u32,
}

/// Telemetry sink that appends wide-format CSV rows.
///
/// Values are written exactly as the vehicle reported them (Celsius,
/// miles, bar) so the log is a faithful record. Location values are
/// flattened to `latitude=..;longitude=..`.
pub struct CsvLogSink {
    path: PathBuf,
    vin_filter: Option<String>,
    state: Mutex<CsvState>,
}

impl CsvLogSink {
    /// `vin` restricts logging to frames for that vehicle; `None` logs all.
    pub fn new(path: PathBuf, vin: Option<String>) -> Self {
        Self {
            path,
            vin_filter: vin,
            state: Mutex::new(CsvState {
                writer: None,
                fieldnames: FIXED_COLUMNS.iter().map(|s| s.to_string()).collect(),
                frame_count: 0,
                since_flush: 0,
            }),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.path
    }

    pub fn frame_count(&self) -> u64 {
        lock(&self.state).frame_count
    }

    /// Flush and close the file.
    pub fn close(&self) {
        let mut state = lock(&self.state);
        if let Some(mut writer) = state.writer.take() {
            if let Err(error) = writer.flush() {
                tracing::warn!(%error, "failed to flush CSV log on close");
            }
        }
    }

    fn write_row(&self, state: &mut CsvState, row: &HashMap<String, String>) -> std::io::Result<()> {
        if state.writer.is_none() {
            let file = File::create(&self.path)?;
            let mut writer = BufWriter::new(file);
            writeln!(writer, "{}", state.fieldnames.join(","))?;
            state.writer = Some(writer);
        }

        let line: Vec<String> = state
            .fieldnames
            .iter()
            .map(|name| row.get(name).map(|v| csv_escape(v)).unwrap_or_default())
            .collect();

        // Bounded by the check above.
        if let Some(writer) = state.writer.as_mut() {
            writeln!(writer, "{}", line.join(","))?;
        }
        Ok(())
    }

    /// Rewrite the file with the widened header, preserving every row.
    fn rewrite_header(&self, state: &mut CsvState) -> std::io::Result<()> {
        let Some(mut writer) = state.writer.take() else {
            return Ok(());
        };
        writer.flush()?;
        drop(writer);

        // Read back the existing rows keyed by the old header.
        let reader = BufReader::new(File::open(&self.path)?);
        let mut lines = reader.lines();
        let old_header: Vec<String> = match lines.next() {
            Some(Ok(line)) => parse_csv_line(&line),
            _ => Vec::new(),
        };
        let mut rows: Vec<HashMap<String, String>> = Vec::new();
        for line in lines {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let values = parse_csv_line(&line);
            rows.push(
                old_header
                    .iter()
                    .cloned()
                    .zip(values)
                    .filter(|(_, v)| !v.is_empty())
                    .collect(),
            );
        }

        // Rewrite with the expanded header.
        let file = File::create(&self.path)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", state.fieldnames.join(","))?;
        for row in rows {
            let line: Vec<String> = state
                .fieldnames
                .iter()
                .map(|name| row.get(name).map(|v| csv_escape(v)).unwrap_or_default())
                .collect();
            writeln!(writer, "{}", line.join(","))?;
        }
        state.writer = Some(writer);
        Ok(())
    }
}

fn lock(state: &Mutex<CsvState>) -> std::sync::MutexGuard<'_, CsvState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn render_value(value: &TelemetryValue) -> String {
    match value {
        TelemetryValue::Location {
            latitude,
            longitude,
        } => format!("latitude={latitude};longitude={longitude}"),
        other => other.to_string(),
    }
}

#[async_trait]
impl FrameSink for CsvLogSink {
    fn name(&self) -> &'static str {
        "csv-log"
    }

    async fn on_frame(&self, frame: &TelemetryFrame) -> anyhow::Result<()> {
        if let Some(vin) = &self.vin_filter {
            if &frame.vin != vin {
                return Ok(());
            }
        }

        let mut row: HashMap<String, String> = HashMap::new();
        row.insert("timestamp".to_string(), frame.created_at.to_rfc3339());
        row.insert("vin".to_string(), frame.vin.clone());
        for datum in &frame.data {
            row.insert(datum.field_name.clone(), render_value(&datum.value));
        }

        let mut state = lock(&self.state);

        // Discover new columns; widen the header first when the file
        // already has rows.
        let new_fields: Vec<String> = row
            .keys()
            .filter(|k| !state.fieldnames.contains(k))
            .cloned()
            .collect();
        if !new_fields.is_empty() {
            let had_file = state.writer.is_some();
            let mut sorted = new_fields;
            sorted.sort_unstable();
            state.fieldnames.extend(sorted);
            if had_file {
                self.rewrite_header(&mut state)?;
            }
        }

        self.write_row(&mut state, &row)?;
        state.frame_count += 1;
        state.since_flush += 1;

        if state.since_flush >= FLUSH_EVERY_FRAMES {
            if let Some(writer) = state.writer.as_mut() {
                writer.flush()?;
            }
            state.since_flush = 0;
        }
        Ok(())
    }
}
