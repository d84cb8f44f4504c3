//! JSONL writer for change events - one event per line, append-only

use super::error::PipelineResult;
use crate::events::ChangeEvent;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const FLUSH_EVERY: Duration = Duration::from_secs(5);

pub struct JsonlEventWriter {
    writer: BufWriter<fs::File>,
    last_flush: Instant,
    written: u64,
}

impl JsonlEventWriter {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn new(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        log::info!("📝 Writing change events to: {}", path.display());

        Ok(Self {
            writer: BufWriter::new(file),
            last_flush: Instant::now(),
            written: 0,
        })
    }

    pub fn write_event(&mut self, event: &ChangeEvent) -> PipelineResult<()> {
        let json = serde_json::to_string(event)?;
        writeln!(self.writer, "{}", json)?;
        self.written += 1;

        if self.last_flush.elapsed() > FLUSH_EVERY {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> PipelineResult<()> {
        self.writer.flush()?;
        self.last_flush = Instant::now();
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl Drop for JsonlEventWriter {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Drain `rx` into `writer` until every sender is gone.
///
/// Returns the number of events written.
pub async fn event_export_task(
    mut rx: mpsc::UnboundedReceiver<ChangeEvent>,
    mut writer: JsonlEventWriter,
) -> u64 {
    log::info!("📤 Starting change event export");

    while let Some(event) = rx.recv().await {
        if let Err(e) = writer.write_event(&event) {
            log::error!("❌ Failed to write change event for {}: {}", event.index_key, e);
        }
    }

    if let Err(e) = writer.flush() {
        log::error!("❌ Failed to flush change events: {}", e);
    }
    log::info!("✅ Change event export stopped ({} events written)", writer.written());
    writer.written()
}
