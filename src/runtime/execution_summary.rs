// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Per-source execution summaries reported by remote peers.
//!
//! Responsibilities:
//! - Accumulates per-executor progress statistics (time/rows/iterations/concurrency)
//!   received redundantly from remote sources.
//! - Publishes each source slot exactly once; after publish the slot's executor-id
//!   set is frozen so profile reporters can read it without locking.
//!
//! Key exported interfaces:
//! - Types: `ExecutionSummary`, `ExecutionSummaryTable`, `ConnectionProfileInfo`.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::rockflow_logging::warn;

/// Progress statistics for one remote executor, as reported by its peer.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ExecutionSummary {
    pub time_processed_ns: u64,
    pub num_produced_rows: u64,
    pub num_iterations: u64,
    pub concurrency: u64,
}

/// Per-source packet/byte counters, owned by the fetch loop.
#[derive(Copy, Clone, Debug, Default)]
pub struct ConnectionProfileInfo {
    pub packets: u64,
    pub bytes: u64,
}

/// One published summary entry. Numeric fields stay mutable after publish;
/// the surrounding map's key set does not.
#[derive(Debug)]
struct SummaryCell {
    time_processed_ns: AtomicU64,
    num_produced_rows: AtomicU64,
    num_iterations: AtomicU64,
    concurrency: AtomicU64,
}

impl SummaryCell {
    fn new(summary: ExecutionSummary) -> Self {
        Self {
            time_processed_ns: AtomicU64::new(summary.time_processed_ns),
            num_produced_rows: AtomicU64::new(summary.num_produced_rows),
            num_iterations: AtomicU64::new(summary.num_iterations),
            concurrency: AtomicU64::new(summary.concurrency),
        }
    }

    fn load(&self) -> ExecutionSummary {
        ExecutionSummary {
            time_processed_ns: self.time_processed_ns.load(Ordering::Relaxed),
            num_produced_rows: self.num_produced_rows.load(Ordering::Relaxed),
            num_iterations: self.num_iterations.load(Ordering::Relaxed),
            concurrency: self.concurrency.load(Ordering::Relaxed),
        }
    }

    /// Streaming connections re-send their own cumulative snapshot, so a later
    /// report dominates an earlier one field by field.
    fn merge_streaming(&self, incoming: ExecutionSummary) {
        self.time_processed_ns
            .fetch_max(incoming.time_processed_ns, Ordering::Relaxed);
        self.num_produced_rows
            .fetch_max(incoming.num_produced_rows, Ordering::Relaxed);
        self.num_iterations
            .fetch_max(incoming.num_iterations, Ordering::Relaxed);
        self.concurrency
            .fetch_max(incoming.concurrency, Ordering::Relaxed);
    }

    /// One-shot sources each contribute a single disjoint report: counts add
    /// up, elapsed time does not.
    fn merge_accumulate(&self, incoming: ExecutionSummary) {
        self.time_processed_ns
            .fetch_max(incoming.time_processed_ns, Ordering::Relaxed);
        self.num_produced_rows
            .fetch_add(incoming.num_produced_rows, Ordering::Relaxed);
        self.num_iterations
            .fetch_add(incoming.num_iterations, Ordering::Relaxed);
        self.concurrency
            .fetch_add(incoming.concurrency, Ordering::Relaxed);
    }
}

/// Per-source table of executor-id -> [`ExecutionSummary`].
///
/// Each slot is published at most once via [`OnceLock`]: the producer fully
/// builds the map before `set`, so any thread observing the slot through
/// `get` sees a frozen key set. Later merges only touch the atomic fields of
/// existing entries; an unknown executor id after publish is dropped with a
/// warning instead of mutating the map.
#[derive(Debug)]
pub struct ExecutionSummaryTable {
    slots: Vec<OnceLock<HashMap<String, SummaryCell>>>,
}

impl ExecutionSummaryTable {
    pub fn new(source_num: usize) -> Self {
        let mut slots = Vec::with_capacity(source_num);
        slots.resize_with(source_num, OnceLock::new);
        Self { slots }
    }

    pub fn source_num(&self) -> usize {
        self.slots.len()
    }

    pub fn is_published(&self, index: usize) -> bool {
        self.slots
            .get(index)
            .is_some_and(|slot| slot.get().is_some())
    }

    /// Merge one reported payload into the slot at `index`.
    ///
    /// First payload for a slot publishes it verbatim; subsequent payloads
    /// update existing entries with streaming (max) or accumulate (max time,
    /// sum counts) semantics.
    pub fn merge(&self, index: usize, entries: &[(String, ExecutionSummary)], streaming: bool) {
        if entries.is_empty() {
            return;
        }
        let Some(slot) = self.slots.get(index) else {
            warn!(
                "execution summary slot {} out of range (source_num={}), dropping report",
                index,
                self.slots.len()
            );
            return;
        };
        if slot.get().is_none() {
            let mut map = HashMap::with_capacity(entries.len());
            for (executor_id, summary) in entries {
                map.insert(executor_id.clone(), SummaryCell::new(*summary));
            }
            if slot.set(map).is_ok() {
                return;
            }
            // Lost a publish race; fall through and merge into the winner.
        }
        let map = slot.get().expect("published slot");
        for (executor_id, summary) in entries {
            let Some(cell) = map.get(executor_id) else {
                warn!(
                    "execution {} not found in execution summaries, this should not happen",
                    executor_id
                );
                continue;
            };
            if streaming {
                cell.merge_streaming(*summary);
            } else {
                cell.merge_accumulate(*summary);
            }
        }
    }

    /// Value snapshot of a published slot, or `None` before publish.
    /// Never exposes a partially built map.
    pub fn snapshot(&self, index: usize) -> Option<HashMap<String, ExecutionSummary>> {
        let map = self.slots.get(index)?.get()?;
        Some(
            map.iter()
                .map(|(executor_id, cell)| (executor_id.clone(), cell.load()))
                .collect(),
        )
    }
}
