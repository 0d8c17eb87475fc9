//! Polling tail of a node's system.log

use clusterprobe_core::{ProbeError, ProbeResult};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cluster::LogMark;

/// Tails one log file
#[derive(Debug, Clone)]
pub struct LogTail {
    path: PathBuf,
    poll_interval: Duration,
}

impl LogTail {
    pub fn new<P: Into<PathBuf>>(path: P, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current end of the log; a missing file marks offset zero
    pub async fn mark(&self) -> ProbeResult<LogMark> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => Ok(LogMark { offset: meta.len() }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LogMark { offset: 0 }),
            Err(e) => Err(e.into()),
        }
    }

    /// Wait until a line written after `mark` contains any of `patterns`
    pub async fn wait_for(
        &self,
        patterns: &[String],
        mark: LogMark,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ProbeResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut position = mark.offset;
        // bytes of a line that has not been terminated yet
        let mut pending: Vec<u8> = Vec::new();

        loop {
            let (chunk, start, next) = self.read_from(position).await?;
            if start < position {
                pending.clear();
            }
            position = next;

            if !chunk.is_empty() {
                pending.extend_from_slice(&chunk);
                if let Some(last) = pending.iter().rposition(|&b| b == b'\n') {
                    let complete: Vec<u8> = pending.drain(..=last).collect();
                    for line in String::from_utf8_lossy(&complete).lines() {
                        if let Some(pattern) = patterns.iter().find(|p| line.contains(p.as_str())) {
                            debug!("Found '{}' in {}", pattern, self.path.display());
                            return Ok(true);
                        }
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                // a final line may still lack its newline
                let tail = String::from_utf8_lossy(&pending);
                return Ok(patterns.iter().any(|p| tail.contains(p.as_str())));
            }

            let sleep_for = self.poll_interval.min(deadline - now);
            trace!("No match in {} yet, sleeping {:?}", self.path.display(), sleep_for);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ProbeError::cancelled(format!(
                        "waiting for {:?} in {}",
                        patterns,
                        self.path.display()
                    )));
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    /// Bytes from `position` to the end of the file, with the offset they
    /// start at and the new end. The start drops back to zero when the
    /// file shrank.
    async fn read_from(&self, position: u64) -> ProbeResult<(Vec<u8>, u64, u64)> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), position, position)),
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        // rotated or truncated underneath us
        let start = if len < position { 0 } else { position };

        file.seek(SeekFrom::Start(start)).await?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await?;

        let next = start + bytes.len() as u64;
        Ok((bytes, start, next))
    }
}
