//! Checkpoint writer.
//!
//! [`CheckpointWriter`] streams batches to any `Write` sink. Opening a
//! path with [`CheckpointWriter::append`] keeps earlier batches, so one
//! file accumulates the bank of every batch of a run.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use ember_core::record::particle;

use crate::codec::encode_batch;
use crate::error::CheckpointError;

/// Writes checkpoint batches to a byte stream.
///
/// # Examples
///
/// ```
/// use ember_checkpoint::{CheckpointReader, CheckpointWriter};
///
/// let mut buf = Vec::new();
/// let mut writer = CheckpointWriter::with_payload_len(&mut buf, 2);
/// writer.write_batch(0, &[1.0, 2.0, 3.0, 4.0]).unwrap();
/// writer.write_batch(1, &[]).unwrap();
/// assert_eq!(writer.batches_written(), 2);
/// drop(writer);
///
/// let mut reader = CheckpointReader::with_payload_len(buf.as_slice(), 2);
/// let first = reader.next_batch().unwrap().unwrap();
/// assert_eq!(first.count(2), 2);
/// assert_eq!(reader.next_batch().unwrap().unwrap().batch, 1);
/// assert!(reader.next_batch().unwrap().is_none());
/// ```
pub struct CheckpointWriter<W: Write> {
    writer: W,
    payload_len: usize,
    batches_written: u64,
    particles_written: u64,
}

impl CheckpointWriter<BufWriter<File>> {
    /// Open `path` for appending, creating it if missing.
    pub fn append(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref();
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        tracing::debug!(path = %path.display(), "checkpoint opened for append");
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> CheckpointWriter<W> {
    /// Wrap a sink, writing full particle payloads.
    pub fn new(writer: W) -> Self {
        Self::with_payload_len(writer, particle::PAYLOAD_LEN)
    }

    /// Wrap a sink with a custom payload width.
    pub fn with_payload_len(writer: W, payload_len: usize) -> Self {
        Self {
            writer,
            payload_len,
            batches_written: 0,
            particles_written: 0,
        }
    }

    /// Append one batch. `payloads` holds whole particles back to back.
    pub fn write_batch(&mut self, batch: i64, payloads: &[f64]) -> Result<(), CheckpointError> {
        encode_batch(&mut self.writer, batch, payloads, self.payload_len)?;
        let count = (payloads.len() / self.payload_len) as u64;
        self.batches_written += 1;
        self.particles_written += count;
        tracing::trace!(batch, count, "checkpoint batch written");
        Ok(())
    }

    /// Flush the underlying writer.
    pub fn flush(&mut self) -> Result<(), CheckpointError> {
        self.writer.flush()?;
        Ok(())
    }

    /// Values per particle.
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Number of batches written so far.
    pub fn batches_written(&self) -> u64 {
        self.batches_written
    }

    /// Number of particles written so far.
    pub fn particles_written(&self) -> u64 {
        self.particles_written
    }

    /// Consume the writer and return the underlying `Write` sink.
    pub fn into_inner(self) -> W {
        self.writer
    }
}
