//! In-memory write buffer for one table.
//!
//! The partition map is a persistent ordered map, so sealing a memtable for
//! flush is an O(1) snapshot and readers can keep iterating a sealed
//! memtable while the flush writes it out.

use crate::commitlog::ReplayPosition;
use crate::mutation::{Cell, Mutation, PartitionKey};
use compact_str::CompactString;
use im::OrdMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct PartitionEntry {
    pub cells: OrdMap<CompactString, Cell>,
    pub tombstone_micros: Option<u64>,
}

impl PartitionEntry {
    /// Last-write-wins merge of one mutation into this partition.
    pub fn apply(&mut self, mutation: &Mutation) {
        if let Some(ts) = mutation.tombstone_micros {
            if ts >= self.tombstone_micros.unwrap_or(0) {
                self.tombstone_micros = Some(ts);
                self.cells = self
                    .cells
                    .iter()
                    .filter(|(_, cell)| cell.timestamp_micros > ts)
                    .map(|(column, cell)| (column.clone(), cell.clone()))
                    .collect();
            }
        }
        for cell in &mutation.cells {
            if self
                .tombstone_micros
                .is_some_and(|ts| cell.timestamp_micros <= ts)
            {
                continue;
            }
            match self.cells.get(cell.column.as_str()) {
                Some(existing) if existing.timestamp_micros > cell.timestamp_micros => {}
                _ => {
                    self.cells.insert(cell.column.clone(), cell.clone());
                }
            }
        }
    }

    pub fn live_cell(&self, column: &str) -> Option<&Cell> {
        self.cells.get(column)
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty() && self.tombstone_micros.is_none()
    }

    pub fn max_timestamp_micros(&self) -> u64 {
        self.cells
            .values()
            .map(|c| c.timestamp_micros)
            .chain(self.tombstone_micros)
            .max()
            .unwrap_or(0)
    }

    /// Mutation form of this partition's full state, used when persisting a
    /// run and when answering mutation-form reads.
    pub fn to_mutation(&self, key: &PartitionKey) -> Mutation {
        Mutation {
            key: key.clone(),
            cells: self.cells.values().cloned().collect(),
            tombstone_micros: self.tombstone_micros,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Memtable {
    partitions: OrdMap<PartitionKey, PartitionEntry>,
    occupancy_bytes: u64,
    min_live_timestamp_micros: u64,
    max_timestamp_micros: u64,
    rp_low: ReplayPosition,
    rp_high: ReplayPosition,
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}

impl Memtable {
    pub fn new() -> Self {
        Self {
            partitions: OrdMap::new(),
            occupancy_bytes: 0,
            min_live_timestamp_micros: u64::MAX,
            max_timestamp_micros: 0,
            rp_low: ReplayPosition::default(),
            rp_high: ReplayPosition::default(),
        }
    }

    pub fn apply(&mut self, mutation: &Mutation, rp: ReplayPosition) {
        let mut entry = self.partitions.get(&mutation.key).cloned().unwrap_or_default();
        entry.apply(mutation);
        self.partitions.insert(mutation.key.clone(), entry);
        self.occupancy_bytes += mutation.footprint();
        self.min_live_timestamp_micros = self
            .min_live_timestamp_micros
            .min(mutation.min_timestamp_micros());
        self.max_timestamp_micros = self.max_timestamp_micros.max(mutation.max_timestamp_micros());
        if !rp.is_default() {
            if self.rp_low.is_default() || rp < self.rp_low {
                self.rp_low = rp;
            }
            if rp > self.rp_high {
                self.rp_high = rp;
            }
        }
    }

    pub fn get(&self, key: &PartitionKey) -> Option<&PartitionEntry> {
        self.partitions.get(key)
    }

    pub fn partitions(&self) -> &OrdMap<PartitionKey, PartitionEntry> {
        &self.partitions
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Dirty bytes held, accounted against the dirty-memory manager.
    pub fn occupancy_bytes(&self) -> u64 {
        self.occupancy_bytes
    }

    /// Minimum live write timestamp; data older than this cannot exist here,
    /// which bounds what purging may drop elsewhere.
    pub fn min_live_timestamp_micros(&self) -> u64 {
        self.min_live_timestamp_micros
    }

    pub fn max_timestamp_micros(&self) -> u64 {
        self.max_timestamp_micros
    }

    pub fn replay_position_range(&self) -> (ReplayPosition, ReplayPosition) {
        (self.rp_low, self.rp_high)
    }
}

/// One active memtable plus the sealed tail awaiting flush.
///
/// The generation counter advances whenever buffered contents are wiped
/// wholesale (truncate); a write that captured an older generation before
/// its log append is detected as racing the truncate and dropped.
#[derive(Debug)]
pub struct MemtableList {
    active: Memtable,
    sealed: Vec<Arc<Memtable>>,
    generation: u64,
}

impl Default for MemtableList {
    fn default() -> Self {
        Self::new()
    }
}

impl MemtableList {
    pub fn new() -> Self {
        Self {
            active: Memtable::new(),
            sealed: Vec::new(),
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn active(&self) -> &Memtable {
        &self.active
    }

    pub fn active_mut(&mut self) -> &mut Memtable {
        &mut self.active
    }

    pub fn sealed(&self) -> &[Arc<Memtable>] {
        &self.sealed
    }

    /// Swap the active memtable out for flushing. No-op when it is empty.
    pub fn seal_active(&mut self) -> Option<Arc<Memtable>> {
        if self.active.is_empty() {
            return None;
        }
        let sealed = Arc::new(std::mem::take(&mut self.active));
        self.sealed.push(Arc::clone(&sealed));
        Some(sealed)
    }

    /// Forget sealed memtables whose data is durably merged on disk.
    pub fn retire_sealed(&mut self, flushed: &[Arc<Memtable>]) {
        self.sealed
            .retain(|m| !flushed.iter().any(|f| Arc::ptr_eq(m, f)));
    }

    /// Advance the generation without touching contents. In-flight writes
    /// that captured the old generation are dropped at insert time.
    pub fn bump_generation(&mut self) {
        self.generation += 1;
    }

    /// Discard everything buffered, advancing the generation. Returns the
    /// total occupancy released so the caller can settle dirty accounting.
    pub fn clear(&mut self) -> u64 {
        let mut released = self.active.occupancy_bytes();
        for m in &self.sealed {
            released += m.occupancy_bytes();
        }
        self.active = Memtable::new();
        self.sealed.clear();
        self.generation += 1;
        released
    }

    /// Highest replay position buffered anywhere in the list.
    pub fn highest_replay_position(&self) -> ReplayPosition {
        let mut high = self.active.replay_position_range().1;
        for m in &self.sealed {
            high = high.max(m.replay_position_range().1);
        }
        high
    }

    /// Reads see the active memtable plus every sealed one.
    pub fn snapshots(&self) -> Vec<Memtable> {
        let mut out = Vec::with_capacity(1 + self.sealed.len());
        out.push(self.active.clone());
        for m in &self.sealed {
            out.push((**m).clone());
        }
        out
    }
}
