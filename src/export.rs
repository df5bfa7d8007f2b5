//! CSV export of execution results.
//!
//! Rows are streamed to the sink one at a time; the full result is never held
//! in memory. A failed export reports how many rows reached the sink.

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{GuardError, Result};
use crate::guard::ExecutionResult;
use crate::warehouse::{ColumnInfo, Row};

/// Which rows an export covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExportKind {
    /// The rows currently shown in the preview grid.
    Preview,
    /// Every row of the result.
    All,
}

impl ExportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportKind::Preview => "preview",
            ExportKind::All => "all",
        }
    }
}

impl fmt::Display for ExportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Destination accepting one row at a time.
pub trait RowSink {
    fn write_header(&mut self, columns: &[ColumnInfo]) -> io::Result<()>;
    fn write_row(&mut self, row: &Row) -> io::Result<()>;
    /// Flushes buffered output. Called once, on every exit path.
    fn finish(&mut self) -> io::Result<()>;
}

/// CSV sink over any writer.
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> CsvSink<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: csv::WriterBuilder::new().from_writer(inner),
        }
    }

    /// Flushes and returns the underlying writer.
    pub fn into_inner(self) -> io::Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }
}

impl CsvSink<BufWriter<File>> {
    /// Creates the file, and its parent directories, for writing.
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> RowSink for CsvSink<W> {
    fn write_header(&mut self, columns: &[ColumnInfo]) -> io::Result<()> {
        self.writer
            .write_record(columns.iter().map(|c| c.name.as_str()))
            .map_err(io::Error::from)
    }

    fn write_row(&mut self, row: &Row) -> io::Result<()> {
        self.writer
            .write_record(row.iter().map(|v| v.to_csv_field()))
            .map_err(io::Error::from)
    }

    fn finish(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Streams results into sinks.
#[derive(Debug, Clone)]
pub struct Exporter {
    export_dir: PathBuf,
    page_size: usize,
}

impl Exporter {
    pub fn new(export_dir: impl Into<PathBuf>, page_size: usize) -> Self {
        Self {
            export_dir: export_dir.into(),
            page_size: page_size.max(1),
        }
    }

    pub fn export_dir(&self) -> &Path {
        &self.export_dir
    }

    /// `<export_dir>/<YYYYmmdd_HHMMSS>_<job_id|nojob>_<kind>.csv`
    pub fn path_for(&self, job_id: Option<&str>, kind: ExportKind) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let job = job_id.unwrap_or("nojob");
        self.export_dir.join(format!("{stamp}_{job}_{kind}.csv"))
    }

    /// Consumes the result and writes every row, preview rows first.
    ///
    /// `progress` is called with the running count every `page_size` rows.
    pub async fn export<S, F>(&self, result: ExecutionResult, sink: &mut S, progress: F) -> Result<u64>
    where
        S: RowSink + Send,
        F: FnMut(u64) + Send,
    {
        let (columns, rows) = result.into_rows().await?;
        self.export_stream(&columns, rows, sink, progress).await
    }

    pub async fn export_stream<S, F>(
        &self,
        columns: &[ColumnInfo],
        mut rows: BoxStream<'_, Result<Row>>,
        sink: &mut S,
        mut progress: F,
    ) -> Result<u64>
    where
        S: RowSink + Send,
        F: FnMut(u64) + Send,
    {
        let mut written: u64 = 0;
        if let Err(e) = sink.write_header(columns) {
            return Err(abandon(sink, written, e));
        }
        while let Some(row) = rows.next().await {
            let row = match row {
                Ok(row) => row,
                Err(e) => return Err(abandon(sink, written, e)),
            };
            if let Err(e) = sink.write_row(&row) {
                return Err(abandon(sink, written, e));
            }
            written += 1;
            if written % self.page_size as u64 == 0 {
                debug!(rows = written, "Export progress");
                progress(written);
            }
        }
        sink.finish()
            .map_err(|e| GuardError::export(written, e))?;
        info!(rows = written, "Export complete");
        Ok(written)
    }

    /// Writes rows already in memory, such as the preview.
    pub fn export_rows<S: RowSink>(&self, columns: &[ColumnInfo], rows: &[Row], sink: &mut S) -> Result<u64> {
        let mut written: u64 = 0;
        if let Err(e) = sink.write_header(columns) {
            return Err(abandon(sink, written, e));
        }
        for row in rows {
            if let Err(e) = sink.write_row(row) {
                return Err(abandon(sink, written, e));
            }
            written += 1;
        }
        sink.finish()
            .map_err(|e| GuardError::export(written, e))?;
        Ok(written)
    }
}

fn abandon<S: RowSink + ?Sized>(sink: &mut S, written: u64, cause: impl fmt::Display) -> GuardError {
    warn!(rows = written, error = %cause, "Export stopped");
    if let Err(e) = sink.finish() {
        debug!(error = %e, "Flush after failed export also failed");
    }
    GuardError::export(written, cause)
}
