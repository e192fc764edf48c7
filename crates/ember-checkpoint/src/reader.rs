//! Checkpoint reader.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use ember_core::record::particle;

use crate::codec::{decode_batch, Batch};
use crate::error::CheckpointError;

/// Reads checkpoint batches from a byte stream.
pub struct CheckpointReader<R: Read> {
    reader: R,
    payload_len: usize,
    batches_read: u64,
}

impl CheckpointReader<BufReader<File>> {
    /// Open a checkpoint file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read> CheckpointReader<R> {
    /// Wrap a source holding full particle payloads.
    pub fn new(reader: R) -> Self {
        Self::with_payload_len(reader, particle::PAYLOAD_LEN)
    }

    /// Wrap a source with a custom payload width.
    pub fn with_payload_len(reader: R, payload_len: usize) -> Self {
        Self {
            reader,
            payload_len,
            batches_read: 0,
        }
    }

    /// Read the next batch, or `None` if the stream is exhausted.
    pub fn next_batch(&mut self) -> Result<Option<Batch>, CheckpointError> {
        let batch = decode_batch(&mut self.reader, self.payload_len)?;
        if batch.is_some() {
            self.batches_read += 1;
        }
        Ok(batch)
    }

    /// Values per particle.
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Number of batches read so far.
    pub fn batches_read(&self) -> u64 {
        self.batches_read
    }

    /// Convert into a batch iterator.
    pub fn batches(self) -> BatchIter<R> {
        BatchIter {
            reader: self.reader,
            payload_len: self.payload_len,
            done: false,
        }
    }
}

/// Iterator over the remaining batches of a [`CheckpointReader`].
///
/// Yields `Err` at most once; iteration stops after the first error.
pub struct BatchIter<R: Read> {
    reader: R,
    payload_len: usize,
    done: bool,
}

impl<R: Read> Iterator for BatchIter<R> {
    type Item = Result<Batch, CheckpointError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match decode_batch(&mut self.reader, self.payload_len) {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::CheckpointWriter;

    #[test]
    fn iterator_stops_after_error() {
        let mut buf = Vec::new();
        let mut w = CheckpointWriter::with_payload_len(&mut buf, 1);
        w.write_batch(0, &[1.0]).unwrap();
        w.write_batch(1, &[2.0, 3.0]).unwrap();
        buf.truncate(buf.len() - 8);

        let mut iter = CheckpointReader::with_payload_len(buf.as_slice(), 1).batches();
        assert_eq!(iter.next().unwrap().unwrap().payloads, vec![1.0]);
        assert!(matches!(
            iter.next(),
            Some(Err(CheckpointError::Truncated { batch: Some(1), .. }))
        ));
        assert!(iter.next().is_none());
    }

    #[test]
    fn default_width_is_particle_payload() {
        let r = CheckpointReader::new(&[][..]);
        assert_eq!(r.payload_len(), particle::PAYLOAD_LEN);
        assert_eq!(r.batches_read(), 0);
    }
}
