//! Iteration log: per-scheduler-iteration backend statistics, written as
//! JSON lines while the measured run is active.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::{IterationSink, IterationStats};
use crate::error::{BenchError, Result};

/// Opens one capture per measured run
#[derive(Debug, Clone, Default)]
pub struct IterationWriter {
    path: Option<PathBuf>,
}

impl IterationWriter {
    /// `None` disables the iteration log
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// Create the log file and start the writer.
    ///
    /// The file is closed once every sink handed out has been dropped and
    /// [`IterationCapture::finish`] is awaited.
    pub fn capture(&self) -> Result<IterationCapture> {
        let Some(path) = &self.path else {
            return Ok(IterationCapture {
                sender: None,
                writer: None,
            });
        };

        let file = File::create(path).map_err(|source| BenchError::ReportWrite {
            path: path.clone(),
            source,
        })?;
        let (sender, mut receiver) = mpsc::unbounded_channel::<IterationStats>();
        let path = path.clone();

        let writer = tokio::task::spawn_blocking(move || -> Result<u64> {
            let mut out = BufWriter::new(file);
            let mut written = 0u64;
            while let Some(stats) = receiver.blocking_recv() {
                serde_json::to_writer(&mut out, &stats).map_err(std::io::Error::from)?;
                out.write_all(b"\n")?;
                written += 1;
            }
            out.flush()?;
            tracing::debug!(path = %path.display(), iterations = written, "Closed iteration log");
            Ok(written)
        });

        Ok(IterationCapture {
            sender: Some(sender),
            writer: Some(writer),
        })
    }
}

/// An open iteration log for one run
pub struct IterationCapture {
    sender: Option<IterationSink>,
    writer: Option<JoinHandle<Result<u64>>>,
}

impl IterationCapture {
    /// Sink to hand to the dispatcher; `None` when logging is disabled
    pub fn sink(&self) -> Option<IterationSink> {
        self.sender.clone()
    }

    /// Close the log and return the number of iterations written.
    ///
    /// Waits until every outstanding sink has been dropped.
    pub async fn finish(mut self) -> Result<u64> {
        self.sender.take();
        let Some(writer) = self.writer.take() else {
            return Ok(0);
        };
        writer
            .await
            .map_err(|e| BenchError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(iter: u64) -> IterationStats {
        IterationStats {
            iter,
            num_active_requests: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_disabled_writer_has_no_sink() {
        let capture = IterationWriter::new(None).capture().unwrap();
        assert!(capture.sink().is_none());
        assert_eq!(capture.finish().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_writes_one_line_per_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iterations.jsonl");
        let capture = IterationWriter::new(Some(path.clone())).capture().unwrap();

        let sink = capture.sink().unwrap();
        for i in 0..3 {
            sink.send(stats(i)).unwrap();
        }
        drop(sink);

        assert_eq!(capture.finish().await.unwrap(), 3);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        let parsed: IterationStats = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(parsed.iter, 2);
        assert_eq!(parsed.num_active_requests, 2);
    }

    #[tokio::test]
    async fn test_unwritable_path_fails_capture() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("iterations.jsonl");
        let result = IterationWriter::new(Some(path)).capture();
        assert!(matches!(result, Err(BenchError::ReportWrite { .. })));
    }
}
