//! Rendezvous reassembly: collecting fragmented command blocks.
//!
//! Entries are keyed by `(source rank, nonce)`; the nonce is a per-sender
//! counter, so concurrent blocks from one sender never collide. Whichever
//! part arrives first creates the entry (every part restates the block
//! totals), payload copies run outside the table lock, and the arrival
//! whose credit bump reaches the declared part count finalizes the entry
//! exactly once.

use std::cell::UnsafeCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::protocol_fatal;
use crate::fabric::Rank;
use crate::wire::{RdzvPayloadPartArgs, WirePersona};

/// Execution metadata carried by the command part of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMeta {
    pub reply: u64,
    pub persona: WirePersona,
    pub flags: u32,
}

/// A fully reassembled command block. The caller tracked the source rank
/// as part of the table key.
pub struct FinalizedBlock {
    pub data: Vec<u8>,
    pub meta: BlockMeta,
}

struct ReassemblyEntry {
    total_len: usize,
    total_parts: u32,
    credits: AtomicU32,
    buf: UnsafeCell<Box<[u8]>>,
    meta: Mutex<Option<BlockMeta>>,
}

// Parts write disjoint ranges of `buf` at their declared offsets without a
// lock; the credit counter publishes the writes to the finalizer.
unsafe impl Send for ReassemblyEntry {}
unsafe impl Sync for ReassemblyEntry {}

impl ReassemblyEntry {
    fn new(total_len: usize, total_parts: u32) -> Self {
        Self {
            total_len,
            total_parts,
            credits: AtomicU32::new(0),
            buf: UnsafeCell::new(vec![0u8; total_len].into_boxed_slice()),
            meta: Mutex::new(None),
        }
    }

    fn write_part(&self, offset: usize, payload: &[u8]) {
        match offset.checked_add(payload.len()) {
            Some(end) if end <= self.total_len => {}
            _ => protocol_fatal(&format!(
                "part at offset {} of {} bytes overruns block of {}",
                offset,
                payload.len(),
                self.total_len
            )),
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                (*self.buf.get()).as_mut_ptr().add(offset),
                payload.len(),
            );
        }
    }

    /// Move the buffer out. Only the finalizing arrival calls this, after
    /// the credit counter showed every writer is done.
    fn take_buf(&self) -> Vec<u8> {
        unsafe { std::mem::take(&mut *self.buf.get()).into_vec() }
    }
}

/// The shared table of in-progress blocks.
#[derive(Default)]
pub struct ReassemblyTable {
    entries: Mutex<HashMap<(Rank, u64), Arc<ReassemblyEntry>>>,
}

impl ReassemblyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks currently awaiting parts.
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        match self.entries.lock() {
            Ok(tbl) => tbl.len(),
            Err(_) => 0,
        }
    }

    /// Record one arriving part. Returns the finished block when this
    /// part was the one that completed it.
    ///
    /// `meta` accompanies the command part; it must arrive on exactly one
    /// part of each block.
    pub fn add_part(
        &self,
        source: Rank,
        part: &RdzvPayloadPartArgs,
        payload: &[u8],
        meta: Option<BlockMeta>,
    ) -> Option<FinalizedBlock> {
        let key = (source, part.nonce);
        let total_len = part.total_len as usize;
        let total_parts = part.total_parts;
        if total_parts == 0 {
            protocol_fatal("rendezvous block declares zero parts");
        }

        let (entry, optimistic_last) = {
            let mut tbl = match self.entries.lock() {
                Ok(tbl) => tbl,
                Err(poisoned) => poisoned.into_inner(),
            };
            match tbl.entry(key) {
                Entry::Occupied(occ) => {
                    let entry = Arc::clone(occ.get());
                    if entry.total_len != total_len || entry.total_parts != total_parts {
                        protocol_fatal(&format!(
                            "parts of block ({}, {}) disagree about its shape",
                            source, part.nonce
                        ));
                    }
                    // Optimistic read under the table lock: if every other
                    // part is already counted, this arrival must finish the
                    // block and can drop the map entry in the same critical
                    // section. Counted implies the peer's lookup is long
                    // done, so nobody can miss the entry.
                    let counted = entry.credits.load(Ordering::Acquire);
                    let last = counted + 1 == total_parts;
                    if last {
                        occ.remove();
                    }
                    (entry, last)
                }
                Entry::Vacant(vac) => {
                    let entry = Arc::new(ReassemblyEntry::new(total_len, total_parts));
                    if total_parts == 1 {
                        // Single-part block: never enters the map.
                        (entry, true)
                    } else {
                        vac.insert(Arc::clone(&entry));
                        (entry, false)
                    }
                }
            }
        };

        if let Some(meta) = meta {
            let mut slot = match entry.meta.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            if slot.replace(meta).is_some() {
                protocol_fatal(&format!(
                    "block ({}, {}) received two command parts",
                    source, part.nonce
                ));
            }
        }

        // The slow copy happens outside the lock so arriving parts only
        // contend on the atomic below.
        entry.write_part(part.offset as usize, payload);

        // Authoritative count: the add that reaches the declared total
        // finalizes, no matter what the optimistic read concluded.
        let prev = entry.credits.fetch_add(1, Ordering::AcqRel);
        if prev >= total_parts {
            protocol_fatal(&format!(
                "block ({}, {}) received more parts than declared",
                source, part.nonce
            ));
        }
        let last = prev + 1 == total_parts;
        debug_assert!(last || !optimistic_last);

        if last && !optimistic_last {
            let removed = {
                let mut tbl = match self.entries.lock() {
                    Ok(tbl) => tbl,
                    Err(poisoned) => poisoned.into_inner(),
                };
                tbl.remove(&key)
            };
            if removed.is_none() {
                protocol_fatal(&format!(
                    "block ({}, {}) finalized twice",
                    source, part.nonce
                ));
            }
        }

        if last {
            let meta = match entry.meta.lock() {
                Ok(mut slot) => slot.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            let Some(meta) = meta else {
                protocol_fatal(&format!(
                    "block ({}, {}) completed without a command part",
                    source, part.nonce
                ));
            };
            Some(FinalizedBlock {
                data: entry.take_buf(),
                meta,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part_args(nonce: u64, total_len: usize, total_parts: u32, offset: usize) -> RdzvPayloadPartArgs {
        RdzvPayloadPartArgs {
            nonce,
            total_len: total_len as u64,
            total_parts,
            offset: offset as u64,
        }
    }

    fn meta() -> BlockMeta {
        BlockMeta {
            reply: 7,
            persona: WirePersona::Slot(0),
            flags: 0b11,
        }
    }

    /// Split `data` into `n` chunks with their offsets.
    fn chunks(data: &[u8], n: usize) -> Vec<(usize, Vec<u8>)> {
        let chunk = data.len().div_ceil(n);
        (0..n)
            .map(|i| {
                let lo = i * chunk;
                let hi = ((i + 1) * chunk).min(data.len());
                (lo, data[lo..hi].to_vec())
            })
            .collect()
    }

    fn permutations(n: usize) -> Vec<Vec<usize>> {
        if n == 1 {
            return vec![vec![0]];
        }
        let mut out = Vec::new();
        for p in permutations(n - 1) {
            for slot in 0..n {
                let mut q = p.clone();
                q.insert(slot, n - 1);
                out.push(q);
            }
        }
        out
    }

    fn run_order(data: &[u8], parts: &[(usize, Vec<u8>)], order: &[usize]) {
        let tbl = ReassemblyTable::new();
        let mut finalized = Vec::new();
        for &i in order {
            let (offset, payload) = &parts[i];
            let args = part_args(9, data.len(), parts.len() as u32, *offset);
            // The command part is the chunk at offset zero.
            let m = if *offset == 0 { Some(meta()) } else { None };
            if let Some(block) = tbl.add_part(3, &args, payload, m) {
                finalized.push(block);
            }
        }
        assert_eq!(finalized.len(), 1, "order {:?}", order);
        let block = &finalized[0];
        assert_eq!(block.data, data, "order {:?}", order);
        assert_eq!(block.meta, meta());
        assert_eq!(tbl.pending(), 0);
    }

    #[test]
    fn all_arrival_orders_of_three_parts() {
        let data: Vec<u8> = (0..=254).collect();
        let parts = chunks(&data, 3);
        for order in permutations(3) {
            run_order(&data, &parts, &order);
        }
    }

    #[test]
    fn all_arrival_orders_of_four_parts() {
        let data: Vec<u8> = (0..200u8).cycle().take(1000).collect();
        let parts = chunks(&data, 4);
        for order in permutations(4) {
            run_order(&data, &parts, &order);
        }
    }

    #[test]
    fn single_part_block_skips_the_table() {
        let tbl = ReassemblyTable::new();
        let args = part_args(1, 4, 1, 0);
        let block = tbl
            .add_part(0, &args, &[1, 2, 3, 4], Some(meta()))
            .expect("single part completes immediately");
        assert_eq!(block.data, vec![1, 2, 3, 4]);
        assert_eq!(tbl.pending(), 0);
    }

    #[test]
    fn interleaved_blocks_do_not_mix() {
        let tbl = ReassemblyTable::new();
        let a: Vec<u8> = vec![0xAA; 10];
        let b: Vec<u8> = vec![0xBB; 10];
        // Same sender with two nonces, plus the same nonce from another
        // sender, all in flight at once.
        let blocks: [(Rank, u64, &Vec<u8>); 3] = [(0, 1, &a), (0, 2, &b), (1, 1, &a)];
        for (src, nonce, data) in blocks {
            let (offset, payload) = &chunks(data, 2)[0];
            let args = part_args(nonce, data.len(), 2, *offset);
            assert!(tbl.add_part(src, &args, payload, Some(meta())).is_none());
        }
        assert_eq!(tbl.pending(), 3);
        let mut done = Vec::new();
        for (src, nonce, data) in blocks {
            let (offset, payload) = &chunks(data, 2)[1];
            let args = part_args(nonce, data.len(), 2, *offset);
            let block = tbl
                .add_part(src, &args, payload, None)
                .expect("second part completes the block");
            done.push((src, block.data));
        }
        assert_eq!(done, vec![(0, a.clone()), (0, b), (1, a)]);
        assert_eq!(tbl.pending(), 0);
    }

    #[test]
    fn concurrent_parts_finalize_exactly_once() {
        use std::sync::atomic::AtomicUsize;

        let data: Vec<u8> = (0..64u8).cycle().take(4096).collect();
        let parts = chunks(&data, 8);
        let tbl = Arc::new(ReassemblyTable::new());
        let finals = Arc::new(AtomicUsize::new(0));
        let collected = Arc::new(Mutex::new(Vec::new()));

        std::thread::scope(|s| {
            for (offset, payload) in parts {
                let tbl = Arc::clone(&tbl);
                let finals = Arc::clone(&finals);
                let collected = Arc::clone(&collected);
                s.spawn(move || {
                    let args = part_args(5, 4096, 8, offset);
                    let m = (offset == 0).then(meta);
                    if let Some(block) = tbl.add_part(2, &args, &payload, m) {
                        finals.fetch_add(1, Ordering::SeqCst);
                        if let Ok(mut c) = collected.lock() {
                            c.push(block.data);
                        }
                    }
                });
            }
        });

        assert_eq!(finals.load(Ordering::SeqCst), 1);
        let collected = collected.lock().expect("no panics held the lock");
        assert_eq!(collected[0], data);
        assert_eq!(tbl.pending(), 0);
    }

    #[test]
    #[should_panic]
    fn overrunning_part_aborts() {
        let tbl = ReassemblyTable::new();
        let args = part_args(1, 8, 2, 6);
        let _ = tbl.add_part(0, &args, &[0; 4], None);
    }
}
