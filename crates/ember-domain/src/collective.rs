//! Batched reduce and broadcast of large `f64` arrays.
//!
//! Both are built from point-to-point messages on the collective tag
//! range and split arrays into chunks of at most `batch` values. They
//! block, and every rank must call them in the same order.

use ember_core::{fatal, RankId, Site};

use crate::transport::{TagLayout, Transport};

const REDUCE: u32 = 0;
const BROADCAST: u32 = 1;

fn check_batch(batch: usize) {
    if batch == 0 {
        fatal!(Site::here("collective"), "batch size must be at least one");
    }
}

/// Sum `data` element-wise into the root's copy.
///
/// On return the root holds the global sum; other ranks' `data` is
/// unchanged.
pub fn reduce_sum<T: Transport + ?Sized>(transport: &T, data: &mut [f64], batch: usize) {
    check_batch(batch);
    let tag = TagLayout::new(transport.size()).collective(REDUCE);
    let rank = transport.rank();
    if !rank.is_root() {
        let sends: Vec<_> = data
            .chunks(batch)
            .map(|chunk| transport.isend(RankId::ROOT, tag, chunk.to_vec()))
            .collect();
        for send in &sends {
            transport.wait_send(send);
        }
        return;
    }
    for source in 1..transport.size() {
        let source = RankId(source as u32);
        for chunk in data.chunks_mut(batch) {
            let part = transport.recv(source, tag);
            if part.len() != chunk.len() {
                fatal!(
                    Site::here("collective"),
                    "reduce chunk from rank {source} has {} values, expected {}",
                    part.len(),
                    chunk.len()
                );
            }
            for (acc, v) in chunk.iter_mut().zip(part) {
                *acc += v;
            }
        }
    }
}

/// Copy the root's `data` to every rank.
pub fn broadcast<T: Transport + ?Sized>(transport: &T, data: &mut [f64], batch: usize) {
    check_batch(batch);
    let tag = TagLayout::new(transport.size()).collective(BROADCAST);
    if transport.rank().is_root() {
        let mut sends = Vec::new();
        for dest in 1..transport.size() {
            for chunk in data.chunks(batch) {
                sends.push(transport.isend(RankId(dest as u32), tag, chunk.to_vec()));
            }
        }
        for send in &sends {
            transport.wait_send(send);
        }
        return;
    }
    for chunk in data.chunks_mut(batch) {
        let part = transport.recv(RankId::ROOT, tag);
        if part.len() != chunk.len() {
            fatal!(
                Site::here("collective"),
                "broadcast chunk has {} values, expected {}",
                part.len(),
                chunk.len()
            );
        }
        chunk.copy_from_slice(&part);
    }
}

/// [`reduce_sum`] followed by [`broadcast`]: every rank ends with the sum.
pub fn all_reduce_sum<T: Transport + ?Sized>(transport: &T, data: &mut [f64], batch: usize) {
    reduce_sum(transport, data, batch);
    broadcast(transport, data, batch);
}
