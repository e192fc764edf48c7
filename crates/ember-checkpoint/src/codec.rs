//! Binary encode/decode for checkpoint batches.
//!
//! All values are little-endian. A batch is
//!
//! ```text
//! [batch: i64][count: i64][count * payload_len f64]
//! ```
//!
//! with no file header, so appending batches from successive runs yields
//! a valid file.

use std::io::{self, Read, Write};

use crate::error::CheckpointError;

/// One decoded batch.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    /// Batch index recorded by the writer.
    pub batch: i64,
    /// Particle payloads, back to back.
    pub payloads: Vec<f64>,
}

impl Batch {
    /// Number of particles given a payload width.
    pub fn count(&self, payload_len: usize) -> usize {
        if payload_len == 0 {
            0
        } else {
            self.payloads.len() / payload_len
        }
    }

    /// Iterate the particle payloads as slices of `payload_len` values.
    pub fn particles(&self, payload_len: usize) -> std::slice::Chunks<'_, f64> {
        self.payloads.chunks(payload_len.max(1))
    }
}

/// Write a little-endian i64.
pub fn write_i64_le(w: &mut dyn Write, v: i64) -> Result<(), CheckpointError> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

/// Write a little-endian f64.
pub fn write_f64_le(w: &mut dyn Write, v: f64) -> Result<(), CheckpointError> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

/// Read a little-endian i64.
pub fn read_i64_le(r: &mut dyn Read) -> Result<i64, CheckpointError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

/// Read a little-endian f64.
pub fn read_f64_le(r: &mut dyn Read) -> Result<f64, CheckpointError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

/// Encode one batch. `payloads` must hold whole particles.
pub fn encode_batch(
    w: &mut dyn Write,
    batch: i64,
    payloads: &[f64],
    payload_len: usize,
) -> Result<(), CheckpointError> {
    if payload_len == 0 || payloads.len() % payload_len != 0 {
        return Err(CheckpointError::RaggedPayload {
            values: payloads.len(),
            payload_len,
        });
    }
    write_i64_le(w, batch)?;
    write_i64_le(w, (payloads.len() / payload_len) as i64)?;
    for &v in payloads {
        write_f64_le(w, v)?;
    }
    Ok(())
}

/// Decode one batch, or `None` at a clean end of input.
pub fn decode_batch(
    r: &mut dyn Read,
    payload_len: usize,
) -> Result<Option<Batch>, CheckpointError> {
    // Distinguish a clean EOF before the header from one inside it.
    let mut head = [0u8; 8];
    let mut filled = 0;
    while filled < head.len() {
        match r.read(&mut head[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(CheckpointError::Truncated {
                    batch: None,
                    detail: format!("got {filled} of 8 bytes of the batch index"),
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CheckpointError::Io(e)),
        }
    }
    let batch = i64::from_le_bytes(head);

    let count = read_i64_le(r).map_err(|e| truncated(e, batch, "particle count"))?;
    if count < 0 {
        return Err(CheckpointError::NegativeCount { batch, count });
    }
    let values = (count as usize).saturating_mul(payload_len);
    let mut payloads = Vec::with_capacity(values.min(1 << 20));
    for i in 0..values {
        let v = read_f64_le(r).map_err(|e| {
            truncated(
                e,
                batch,
                &format!("value {i} of {values} ({count} particles)"),
            )
        })?;
        payloads.push(v);
    }
    Ok(Some(Batch { batch, payloads }))
}

fn truncated(e: CheckpointError, batch: i64, what: &str) -> CheckpointError {
    match e {
        CheckpointError::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof => {
            CheckpointError::Truncated {
                batch: Some(batch),
                detail: format!("missing {what}"),
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_clean_end() {
        let mut r: &[u8] = &[];
        assert!(decode_batch(&mut r, 3).unwrap().is_none());
    }

    #[test]
    fn layout_is_header_then_values() {
        let mut buf = Vec::new();
        encode_batch(&mut buf, 7, &[1.0, 2.0, 3.0, 4.0], 2).unwrap();
        assert_eq!(buf.len(), 16 + 4 * 8);
        assert_eq!(i64::from_le_bytes(buf[0..8].try_into().unwrap()), 7);
        assert_eq!(i64::from_le_bytes(buf[8..16].try_into().unwrap()), 2);
        assert_eq!(f64::from_le_bytes(buf[16..24].try_into().unwrap()), 1.0);
    }

    #[test]
    fn ragged_payload_rejected() {
        let mut buf = Vec::new();
        let err = encode_batch(&mut buf, 0, &[1.0, 2.0, 3.0], 2).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::RaggedPayload {
                values: 3,
                payload_len: 2
            }
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_header_is_truncation() {
        let mut r: &[u8] = &[1, 2, 3];
        let err = decode_batch(&mut r, 2).unwrap_err();
        assert!(matches!(err, CheckpointError::Truncated { batch: None, .. }));
    }

    #[test]
    fn missing_values_name_the_batch() {
        let mut buf = Vec::new();
        encode_batch(&mut buf, 4, &[1.0, 2.0], 2).unwrap();
        buf.truncate(buf.len() - 3);
        let err = decode_batch(&mut buf.as_slice(), 2).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::Truncated { batch: Some(4), .. }
        ));
    }

    #[test]
    fn negative_count_rejected() {
        let mut buf = Vec::new();
        write_i64_le(&mut buf, 2).unwrap();
        write_i64_le(&mut buf, -5).unwrap();
        let err = decode_batch(&mut buf.as_slice(), 2).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::NegativeCount { batch: 2, count: -5 }
        ));
        assert!(err.to_string().contains("negative"));
    }
}
