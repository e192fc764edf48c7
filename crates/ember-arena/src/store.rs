//! The flat, growable, offset-addressed store.
//!
//! [`Arena`] is a single `Vec` of `f64` fields with a bump cursor. All
//! structures in a run (list commons, list items, particle records,
//! direct-index arrays, root slots) live inside it and refer to each other
//! by [`Offset`].
//!
//! Fields are stored as `AtomicU64` bit patterns. Reads and writes take
//! `&self` with relaxed ordering, so worker threads can operate on the
//! records they own concurrently without locks; growth takes `&mut self`,
//! so the compiler rules out growth during the parallel region and the
//! [`GrowthGate`] rules it out at run time as well.

use std::sync::atomic::{AtomicU64, Ordering};

use ember_core::record::{decode_offset, encode_offset};
use ember_core::{fatal, Offset, Site};

use crate::config::ArenaConfig;
use crate::error::ArenaError;
use crate::gate::GrowthGate;

/// Offset-addressed store of `f64` fields.
pub struct Arena {
    /// Backing storage. `data.len()` is the reserved size.
    data: Vec<AtomicU64>,
    /// Bump pointer: fields in `[0, cursor)` are allocated.
    cursor: usize,
    max_size: usize,
    gate: GrowthGate,
    /// Number of times the backing store was extended.
    growths: u64,
}

// Compile-time assertion: Arena must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<Arena>();
};

impl Arena {
    /// Create an arena, reserving `config.initial_capacity` fields.
    pub fn new(config: &ArenaConfig) -> Result<Self, ArenaError> {
        config.validate()?;
        let mut data = Vec::new();
        reserve_or_abort(&mut data, config.initial_capacity);
        Ok(Self {
            data,
            cursor: 0,
            max_size: config.max_size,
            gate: GrowthGate::new(),
            growths: 0,
        })
    }

    /// The growth gate. Open it with [`GrowthGate::allow`] or, preferably,
    /// through [`Arena::growth_window`].
    pub fn gate(&self) -> &GrowthGate {
        &self.gate
    }

    /// Open the gate for the lifetime of the returned guard.
    pub fn growth_window(&mut self) -> GrowthWindow<'_> {
        self.gate.allow();
        GrowthWindow { arena: self }
    }

    /// Bump-allocate `size` zeroed fields, growing the store if needed.
    ///
    /// Returns the base offset of the new block. The gate must be open.
    /// A zero-size request is logged and returns the current cursor.
    pub fn try_allocate(&mut self, size: usize) -> Result<Offset, ArenaError> {
        self.gate.check(size);
        if size == 0 {
            tracing::warn!(cursor = self.cursor, "zero-size arena allocation");
            return Ok(self.cursor);
        }
        let end = self.checked_end(size)?;
        if end > self.data.len() {
            self.extend_to(end);
        }
        let base = self.cursor;
        self.cursor = end;
        Ok(base)
    }

    /// [`try_allocate`](Self::try_allocate), escalating a capacity error to fatal.
    pub fn allocate(&mut self, size: usize) -> Offset {
        match self.try_allocate(size) {
            Ok(base) => base,
            Err(e) => fatal!(Site::here("arena"), "{e}"),
        }
    }

    /// Reserve `total` fields in one growth without advancing the cursor.
    ///
    /// Subsequent allocations up to `total` fields are served from the
    /// reserved block without touching the backing store again.
    pub fn try_preallocate(&mut self, total: usize) -> Result<(), ArenaError> {
        self.gate.check(total);
        let end = self.checked_end(total)?;
        if end > self.data.len() {
            self.extend_to(end);
        }
        Ok(())
    }

    fn checked_end(&self, size: usize) -> Result<usize, ArenaError> {
        match self.cursor.checked_add(size) {
            Some(end) if end <= self.max_size => Ok(end),
            _ => Err(ArenaError::CapacityExceeded {
                requested: size,
                used: self.cursor,
                max_size: self.max_size,
            }),
        }
    }

    fn extend_to(&mut self, end: usize) {
        let additional = end - self.data.len();
        reserve_or_abort(&mut self.data, additional);
        self.data.resize_with(end, || AtomicU64::new(0));
        self.growths += 1;
        tracing::debug!(size = end, growths = self.growths, "arena grown");
    }

    #[inline]
    fn cell(&self, offset: Offset) -> &AtomicU64 {
        if offset >= self.cursor {
            fatal!(
                Site::here("arena").at(offset),
                "offset outside allocated range [0, {})",
                self.cursor
            );
        }
        &self.data[offset]
    }

    /// Read one field.
    #[inline]
    pub fn get(&self, offset: Offset) -> f64 {
        f64::from_bits(self.cell(offset).load(Ordering::Relaxed))
    }

    /// Write one field.
    #[inline]
    pub fn put(&self, offset: Offset, value: f64) {
        self.cell(offset).store(value.to_bits(), Ordering::Relaxed);
    }

    /// Atomically add `delta` to one field and return the new value.
    pub fn add(&self, offset: Offset, delta: f64) -> f64 {
        let cell = self.cell(offset);
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match cell.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return f64::from_bits(next),
                Err(actual) => current = actual,
            }
        }
    }

    /// Read a field holding an encoded offset.
    #[inline]
    pub fn get_offset(&self, offset: Offset) -> Option<Offset> {
        decode_offset(self.get(offset))
    }

    /// Write an encoded offset into a field.
    #[inline]
    pub fn put_offset(&self, offset: Offset, target: Option<Offset>) {
        self.put(offset, encode_offset(target));
    }

    /// Copy `len` fields from `src` to `dst`. The ranges must not overlap.
    pub fn copy(&self, src: Offset, dst: Offset, len: usize) {
        if src < dst + len && dst < src + len && len > 0 {
            fatal!(Site::here("arena").at(dst), "overlapping copy from {src} ({len} fields)");
        }
        for i in 0..len {
            self.put(dst + i, self.get(src + i));
        }
    }

    /// Zero `len` fields starting at `offset`.
    pub fn zero(&self, offset: Offset, len: usize) {
        for i in 0..len {
            self.put(offset + i, 0.0);
        }
    }

    /// Copy `out.len()` fields starting at `offset` into `out`.
    pub fn read_into(&self, offset: Offset, out: &mut [f64]) {
        for (i, v) in out.iter_mut().enumerate() {
            *v = self.get(offset + i);
        }
    }

    /// Copy `values` into the arena starting at `offset`.
    pub fn write_from(&self, offset: Offset, values: &[f64]) {
        for (i, &v) in values.iter().enumerate() {
            self.put(offset + i, v);
        }
    }

    /// Fields allocated so far; valid offsets are `[0, size)`.
    pub fn size(&self) -> usize {
        self.cursor
    }

    /// Fields reserved in the backing store.
    pub fn reserved(&self) -> usize {
        self.data.len()
    }

    /// Reserved fields not yet handed out.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    /// Memory usage of the backing storage in bytes.
    pub fn memory_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<AtomicU64>()
    }

    /// Number of times the backing store has been extended.
    pub fn growths(&self) -> u64 {
        self.growths
    }
}

/// Bracketed growth section. The gate is closed again on drop.
pub struct GrowthWindow<'a> {
    arena: &'a mut Arena,
}

impl std::ops::Deref for GrowthWindow<'_> {
    type Target = Arena;

    fn deref(&self) -> &Arena {
        self.arena
    }
}

impl std::ops::DerefMut for GrowthWindow<'_> {
    fn deref_mut(&mut self) -> &mut Arena {
        self.arena
    }
}

impl Drop for GrowthWindow<'_> {
    fn drop(&mut self) {
        self.arena.gate.deny();
    }
}

fn reserve_or_abort(data: &mut Vec<AtomicU64>, additional: usize) {
    if let Err(e) = data.try_reserve_exact(additional) {
        fatal!(
            Site::here("arena"),
            "system allocator refused {additional} fields: {e}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Arena {
        Arena::new(&ArenaConfig {
            initial_capacity: 16,
            max_size: 1024,
        })
        .unwrap()
    }

    #[test]
    fn allocations_are_sequential_and_zeroed() {
        let mut arena = small();
        let mut w = arena.growth_window();
        let a = w.allocate(10);
        let b = w.allocate(20);
        assert_eq!(a, 0);
        assert_eq!(b, 10);
        assert_eq!(w.size(), 30);
        assert!((0..30).all(|i| w.get(i) == 0.0));
    }

    #[test]
    fn values_survive_growth() {
        let mut arena = small();
        let mut w = arena.growth_window();
        let a = w.allocate(4);
        w.put(a + 3, 42.5);
        let _ = w.allocate(500);
        assert!(w.growths() >= 1);
        assert_eq!(w.get(a + 3), 42.5);
    }

    #[test]
    fn preallocate_serves_later_allocations_without_growth() {
        let mut arena = small();
        let mut w = arena.growth_window();
        w.try_preallocate(400).unwrap();
        let growths = w.growths();
        let size_before = w.size();
        for _ in 0..40 {
            w.allocate(10);
        }
        assert_eq!(size_before, 0);
        assert_eq!(w.size(), 400);
        assert_eq!(w.growths(), growths);
    }

    #[test]
    fn capacity_exceeded_is_an_error() {
        let mut arena = small();
        let mut w = arena.growth_window();
        w.allocate(1000);
        let err = w.try_allocate(100).unwrap_err();
        assert_eq!(
            err,
            ArenaError::CapacityExceeded {
                requested: 100,
                used: 1000,
                max_size: 1024
            }
        );
    }

    #[test]
    fn zero_size_allocation_returns_cursor() {
        let mut arena = small();
        let mut w = arena.growth_window();
        w.allocate(5);
        assert_eq!(w.allocate(0), 5);
        assert_eq!(w.size(), 5);
    }

    #[test]
    fn window_closes_gate_on_drop() {
        let mut arena = small();
        {
            let _w = arena.growth_window();
            assert!(arena_gate_open(&_w));
        }
        assert!(!arena.gate().is_open());
    }

    fn arena_gate_open(a: &Arena) -> bool {
        a.gate().is_open()
    }

    #[test]
    #[should_panic(expected = "while growth is denied")]
    fn allocate_with_closed_gate_is_fatal() {
        let mut arena = small();
        arena.allocate(1);
    }

    #[test]
    #[should_panic(expected = "outside allocated range")]
    fn read_past_cursor_is_fatal() {
        let mut arena = small();
        arena.growth_window().allocate(2);
        arena.get(2);
    }

    #[test]
    fn offsets_encode_through_fields() {
        let mut arena = small();
        let slot = arena.growth_window().allocate(2);
        arena.put_offset(slot, Some(123));
        arena.put_offset(slot + 1, None);
        assert_eq!(arena.get_offset(slot), Some(123));
        assert_eq!(arena.get_offset(slot + 1), None);
    }

    #[test]
    fn add_accumulates() {
        let mut arena = small();
        let f = arena.growth_window().allocate(1);
        arena.add(f, 1.5);
        assert_eq!(arena.add(f, 2.0), 3.5);
    }

    #[test]
    fn copy_and_bulk_io() {
        let mut arena = small();
        let base = arena.growth_window().allocate(8);
        arena.write_from(base, &[1.0, 2.0, 3.0, 4.0]);
        arena.copy(base, base + 4, 4);
        let mut out = [0.0; 4];
        arena.read_into(base + 4, &mut out);
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
        arena.zero(base, 4);
        assert_eq!(arena.get(base), 0.0);
    }

    #[test]
    fn concurrent_writers_to_disjoint_records() {
        let mut arena = small();
        let base = arena.growth_window().allocate(64);
        std::thread::scope(|s| {
            for t in 0..4 {
                let arena = &arena;
                s.spawn(move || {
                    for i in 0..16 {
                        arena.put(base + t * 16 + i, (t * 100 + i) as f64);
                    }
                });
            }
        });
        assert_eq!(arena.get(base + 3 * 16 + 5), 305.0);
    }
}
