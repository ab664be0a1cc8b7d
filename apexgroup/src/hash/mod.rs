//! Open-addressed hash table mapping 32-bit hashes to row-table indices
//!
//! Slots carry only `(hash, row)` pairs; key bytes live out-of-band in the
//! row table and equality is externalized through [`RowMapContext`], so
//! the table stays small and probe loops touch one contiguous slot array.
//! Probing is linear over a power-of-two capacity with the load factor
//! bounded below 3/4 by doubling rehash.

use arrow::util::bit_util;
use log::debug;

use crate::{oom, Result};

/// Slot sentinel: no row stored.
const NO_ROW: u32 = u32::MAX;

const INITIAL_CAPACITY: usize = 1 << 11;

/// Externalized equality and row-append callbacks bound to the row tables.
pub(crate) trait RowMapContext {
    /// Compare probe rows (mini-batch indices in `selection`) against the
    /// candidate row-table rows in `ids`; push mismatching probe rows onto
    /// `mismatch` in selection order.
    fn equal(&self, selection: &[u16], ids: &[u32], mismatch: &mut Vec<u16>);

    /// Append the selected mini-batch rows to the main row table, in
    /// selection order.
    fn append(&mut self, selection: &[u16]) -> Result<()>;
}

#[derive(Clone, Copy)]
struct Slot {
    hash: u32,
    row: u32,
}

const EMPTY_SLOT: Slot = Slot {
    hash: 0,
    row: NO_ROW,
};

pub(crate) struct GroupHashTable {
    slots: Vec<Slot>,
    mask: usize,
    occupied: usize,
}

impl GroupHashTable {
    pub fn new() -> Self {
        Self {
            slots: vec![EMPTY_SLOT; INITIAL_CAPACITY],
            mask: INITIAL_CAPACITY - 1,
            occupied: 0,
        }
    }

    /// Number of stored rows; equals the main row table's length because
    /// every distinct row owns exactly one slot.
    pub fn len(&self) -> usize {
        self.occupied
    }

    /// Drop all entries and shrink back to the initial capacity.
    pub fn clean(&mut self) {
        self.slots.clear();
        self.slots.resize(INITIAL_CAPACITY, EMPTY_SLOT);
        self.mask = INITIAL_CAPACITY - 1;
        self.occupied = 0;
    }

    fn home(&self, hash: u32) -> usize {
        hash as usize & self.mask
    }

    /// Scan from `slot` for the first hash-equal slot or the first empty
    /// slot, whichever comes first.
    fn probe_from(&self, mut slot: usize, hash: u32) -> (usize, Option<u32>) {
        loop {
            let s = self.slots[slot];
            if s.row == NO_ROW {
                return (slot, None);
            }
            if s.hash == hash {
                return (slot, Some(s.row));
            }
            slot = (slot + 1) & self.mask;
        }
    }

    /// For each probe decide whether a match is possible and record a
    /// tentative slot. Never false-negative: a stored equal row implies an
    /// equal hash, which this scan cannot skip.
    pub fn early_filter(&self, hashes: &[u32], match_bits: &mut [u8], hints: &mut [u32]) {
        debug_assert!(match_bits.len() >= bit_util::ceil(hashes.len(), 8));
        match_bits[..bit_util::ceil(hashes.len(), 8)].fill(0);
        for (i, &hash) in hashes.iter().enumerate() {
            let (slot, candidate) = self.probe_from(self.home(hash), hash);
            hints[i] = slot as u32;
            if candidate.is_some() {
                bit_util::set_bit(match_bits, i);
            }
        }
    }

    /// Resolve the candidates marked in `match_bits`, writing matched row
    /// ids to `ids_out` and clearing the bit of every probe that reaches
    /// an empty slot without an equal row.
    pub fn find(
        &self,
        hashes: &[u32],
        match_bits: &mut [u8],
        hints: &mut [u32],
        ids_out: &mut [u32],
        ctx: &dyn RowMapContext,
    ) {
        let mut selection: Vec<u16> = Vec::new();
        let mut candidate_ids: Vec<u32> = Vec::new();
        for i in 0..hashes.len() {
            if bit_util::get_bit(match_bits, i) {
                selection.push(i as u16);
                candidate_ids.push(self.slots[hints[i] as usize].row);
            }
        }

        let mut mismatch: Vec<u16> = Vec::new();
        while !selection.is_empty() {
            mismatch.clear();
            ctx.equal(&selection, &candidate_ids, &mut mismatch);

            // Matched probes keep their candidate id; mismatches reprobe
            // past the colliding slot.
            let mut next_selection = Vec::with_capacity(mismatch.len());
            let mut next_ids = Vec::with_capacity(mismatch.len());
            let mut m = 0;
            for (k, &i) in selection.iter().enumerate() {
                if m < mismatch.len() && mismatch[m] == i {
                    m += 1;
                    let hash = hashes[i as usize];
                    let (slot, candidate) =
                        self.probe_from((hints[i as usize] as usize + 1) & self.mask, hash);
                    hints[i as usize] = slot as u32;
                    match candidate {
                        Some(row) => {
                            next_selection.push(i);
                            next_ids.push(row);
                        }
                        None => bit_util::unset_bit(match_bits, i as usize),
                    }
                } else {
                    ids_out[i as usize] = candidate_ids[k];
                }
            }
            selection = next_selection;
            candidate_ids = next_ids;
        }
    }

    /// Map the selected probes to dense row ids, inserting unseen keys in
    /// selection order. A later duplicate of a key first seen in this call
    /// resolves to the id the first occurrence received: each round
    /// inserts slots for rows that reached an empty slot, appends their
    /// key bytes through `ctx`, then compares the deferred rows against
    /// their candidates (which by then are present in the row table).
    pub fn map_new_keys(
        &mut self,
        selection: &[u16],
        hashes: &[u32],
        ids_out: &mut [u32],
        ctx: &mut dyn RowMapContext,
    ) -> Result<()> {
        let mut pending: Vec<u16> = selection.to_vec();
        let mut cursors: Vec<u32> = pending
            .iter()
            .map(|&i| self.home(hashes[i as usize]) as u32)
            .collect();

        let mut inserted: Vec<u16> = Vec::new();
        let mut deferred: Vec<u16> = Vec::new();
        let mut deferred_ids: Vec<u32> = Vec::new();
        let mut deferred_slots: Vec<u32> = Vec::new();
        let mut mismatch: Vec<u16> = Vec::new();

        while !pending.is_empty() {
            inserted.clear();
            deferred.clear();
            deferred_ids.clear();
            deferred_slots.clear();
            let mut grew = false;

            for (k, &i) in pending.iter().enumerate() {
                let hash = hashes[i as usize];
                let start = if grew {
                    self.home(hash)
                } else {
                    cursors[k] as usize
                };
                let (slot, candidate) = self.probe_from(start, hash);
                if let Some(row) = candidate {
                    deferred.push(i);
                    deferred_ids.push(row);
                    deferred_slots.push(slot as u32);
                    continue;
                }
                // Reached an empty slot: this key is new.
                let mut slot = slot;
                if self.needs_grow() {
                    self.grow()?;
                    grew = true;
                    let (s, candidate) = self.probe_from(self.home(hash), hash);
                    // Restarting from home may rediscover a hash-equal
                    // slot that the cursor had already stepped past.
                    if let Some(row) = candidate {
                        deferred.push(i);
                        deferred_ids.push(row);
                        deferred_slots.push(s as u32);
                        continue;
                    }
                    slot = s;
                }
                let id = self.occupied as u32;
                self.slots[slot] = Slot { hash, row: id };
                self.occupied += 1;
                ids_out[i as usize] = id;
                inserted.push(i);
            }

            if !inserted.is_empty() {
                ctx.append(&inserted)?;
            }

            pending.clear();
            cursors.clear();
            if !deferred.is_empty() {
                mismatch.clear();
                ctx.equal(&deferred, &deferred_ids, &mut mismatch);
                let mut m = 0;
                for (k, &i) in deferred.iter().enumerate() {
                    if m < mismatch.len() && mismatch[m] == i {
                        m += 1;
                        pending.push(i);
                        cursors.push(if grew {
                            self.home(hashes[i as usize]) as u32
                        } else {
                            (deferred_slots[k] + 1) & self.mask as u32
                        });
                    } else {
                        ids_out[i as usize] = deferred_ids[k];
                    }
                }
            }
        }
        Ok(())
    }

    fn needs_grow(&self) -> bool {
        (self.occupied + 1) * 4 > self.slots.len() * 3
    }

    fn grow(&mut self) -> Result<()> {
        let new_capacity = self.slots.len() * 2;
        let mut new_slots = Vec::new();
        new_slots.try_reserve_exact(new_capacity).map_err(oom)?;
        new_slots.resize(new_capacity, EMPTY_SLOT);
        let new_mask = new_capacity - 1;
        for slot in &self.slots {
            if slot.row == NO_ROW {
                continue;
            }
            let mut at = slot.hash as usize & new_mask;
            while new_slots[at].row != NO_ROW {
                at = (at + 1) & new_mask;
            }
            new_slots[at] = *slot;
        }
        debug!(
            "group hash table rehash: {} -> {} slots ({} occupied)",
            self.slots.len(),
            new_capacity,
            self.occupied
        );
        self.slots = new_slots;
        self.mask = new_mask;
        Ok(())
    }
}

/// Collect the positions of bits equal to `target` as u16 indices.
pub(crate) fn bits_to_indexes(target: bool, bits: &[u8], num_bits: usize, out: &mut Vec<u16>) {
    out.clear();
    for i in 0..num_bits {
        if bit_util::get_bit(bits, i) == target {
            out.push(i as u16);
        }
    }
}
