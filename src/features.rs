//! Translates a `PacketRecord` into the fixed 20-element `FeatureVector`.
//!
//! The canonical feature order and names are grounded on
//! `original_source/tests/test_features.py::TestFeatureExtractor`, which
//! pins `global_syn_rate`/`src_syn_rate`/`dst_syn_rate`/`syn_flag`/
//! `packet_size`/`unique_dst_ports` as named keys of a 20-entry dict; here
//! they become index-stable positions of a fixed array instead, per the
//! "dynamic feature dictionaries ... replaced by a fixed-arity ordered
//! vector" design note.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::data::{FlowKey, PacketRecord};
use crate::sliding_window::SlidingWindowCounter;

pub const FEATURE_COUNT: usize = 20;

pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "global_syn_rate",
    "global_packet_rate",
    "global_byte_rate",
    "src_syn_rate",
    "src_packet_rate",
    "src_byte_rate",
    "dst_syn_rate",
    "dst_packet_rate",
    "dst_byte_rate",
    "unique_dst_ports",
    "unique_src_ips_to_dst",
    "packet_size",
    "dst_port",
    "src_port",
    "syn_flag",
    "ack_flag",
    "fin_flag",
    "rst_flag",
    "syn_packet_ratio",
    "src_syn_ratio",
];

/// Default number of `observe` calls between lazy-eviction sweeps of the
/// per-key counter map.
pub const DEFAULT_EVICTION_INTERVAL: u64 = 10_000;

/// Per-key bundle of sliding counters and uniqueness sets.
struct CounterCell {
    syn_count: SlidingWindowCounter,
    packet_count: SlidingWindowCounter,
    byte_count: SlidingWindowCounter,
    /// port -> timestamp last observed, used to compute unique_dst_ports.
    unique_dst_ports: HashMap<u16, f64>,
    /// src_ip -> timestamp last observed, used to compute unique_src_ips_to_dst.
    unique_src_ips: HashMap<String, f64>,
}

impl CounterCell {
    fn new(window_seconds: f64) -> Self {
        CounterCell {
            syn_count: SlidingWindowCounter::new(window_seconds),
            packet_count: SlidingWindowCounter::new(window_seconds),
            byte_count: SlidingWindowCounter::new(window_seconds),
            unique_dst_ports: HashMap::new(),
            unique_src_ips: HashMap::new(),
        }
    }

}

// Last-observation timestamp is tracked alongside the cell (not inside it) so
// staleness can be judged even once the sliding counter itself has emptied --
// the counter only stores recent entries, not a high-water mark of "last seen".
struct CounterCellInner {
    cell: CounterCell,
    last_packet_ts: f64,
}

/// Inner state protected by the single extractor mutex (per spec §5, the
/// only lock is this one, never held across a classifier or sink call).
struct ExtractorState {
    window_seconds: f64,
    cells: HashMap<FlowKey, CounterCellInner>,
    observation_count: u64,
    eviction_interval: u64,
}

impl ExtractorState {
    fn cell_mut(&mut self, key: FlowKey) -> &mut CounterCellInner {
        let window = self.window_seconds;
        self.cells
            .entry(key)
            .or_insert_with(|| CounterCellInner {
                cell: CounterCell::new(window),
                last_packet_ts: f64::NEG_INFINITY,
            })
    }

    fn observe_key(&mut self, key: FlowKey, record: &PacketRecord) {
        let inner = self.cell_mut(key);
        let ts = record.timestamp;
        inner.last_packet_ts = ts;
        if record.is_syn() {
            inner.cell.syn_count.add(ts, 1.0);
        } else {
            inner.cell.syn_count.add(ts, 0.0);
        }
        inner.cell.packet_count.add(ts, 1.0);
        inner.cell.byte_count.add(ts, record.packet_size as f64);
        inner.cell.unique_dst_ports.insert(record.dst_port, ts);
        inner
            .cell
            .unique_src_ips
            .insert(record.src_ip.clone(), ts);
    }

    fn sweep_if_due(&mut self, now: f64) {
        self.observation_count += 1;
        if self.observation_count % self.eviction_interval != 0 {
            return;
        }
        let window = self.window_seconds;
        self.cells.retain(|_, inner| !inner.is_stale(now, window));
        for inner in self.cells.values_mut() {
            inner
                .cell
                .unique_dst_ports
                .retain(|_, &mut ts| now - ts <= window);
            inner
                .cell
                .unique_src_ips
                .retain(|_, &mut ts| now - ts <= window);
        }
    }
}

impl CounterCellInner {
    fn is_stale(&mut self, now: f64, window_seconds: f64) -> bool {
        self.cell.packet_count.prune(now);
        if !self.cell.packet_count.is_empty() {
            return false;
        }
        now - self.last_packet_ts > window_seconds
    }
}

/// Maintains per-key counters and produces the canonical 20-element feature
/// vector for each observed `PacketRecord`.
///
/// `extract` is called serially from worker threads under a single mutex
/// (`parking_lot::Mutex`, matching the teacher's choice throughout
/// `main.rs`'s globals); the extractor itself performs no internal
/// parallelism.
pub struct FeatureExtractor {
    state: Mutex<ExtractorState>,
}

impl FeatureExtractor {
    pub fn new(window_seconds: f64) -> Self {
        Self::with_eviction_interval(window_seconds, DEFAULT_EVICTION_INTERVAL)
    }

    pub fn with_eviction_interval(window_seconds: f64, eviction_interval: u64) -> Self {
        assert!(window_seconds > 0.0, "window_seconds must be > 0");
        assert!(eviction_interval > 0, "eviction_interval must be > 0");
        FeatureExtractor {
            state: Mutex::new(ExtractorState {
                window_seconds,
                cells: HashMap::new(),
                observation_count: 0,
                eviction_interval,
            }),
        }
    }

    pub fn feature_names(&self) -> [&'static str; FEATURE_COUNT] {
        FEATURE_NAMES
    }

    /// Update global, source, destination, and pair counters for `record`.
    pub fn observe(&self, record: &PacketRecord) {
        let mut state = self.state.lock();
        state.observe_key(FlowKey::Global, record);
        state.observe_key(FlowKey::Source(record.src_ip.clone()), record);
        state.observe_key(FlowKey::Dest(record.dst_ip.clone()), record);
        state.observe_key(
            FlowKey::Pair(record.src_ip.clone(), record.dst_ip.clone()),
            record,
        );
        let now = record.timestamp;
        state.sweep_if_due(now);
    }

    /// Observe `record`, then compute and return the 20-element feature
    /// vector from the resulting counter state relative to `record.timestamp`.
    pub fn extract(&self, record: &PacketRecord) -> [f64; FEATURE_COUNT] {
        self.observe(record);

        let mut state = self.state.lock();
        let window = state.window_seconds;
        let now = record.timestamp;

        let global = state.cell_mut(FlowKey::Global);
        let global_syn_rate = global.cell.syn_count.rate(now);
        let global_packet_rate = global.cell.packet_count.rate(now);
        let global_byte_rate = global.cell.byte_count.rate(now);
        let global_syn_count = global.cell.syn_count.sum(now);
        let global_packet_count = global.cell.packet_count.sum(now);

        let src_key = FlowKey::Source(record.src_ip.clone());
        let src = state.cell_mut(src_key);
        let src_syn_rate = src.cell.syn_count.rate(now);
        let src_packet_rate = src.cell.packet_count.rate(now);
        let src_byte_rate = src.cell.byte_count.rate(now);
        let src_syn_count = src.cell.syn_count.sum(now);
        let src_packet_count = src.cell.packet_count.sum(now);
        let unique_dst_ports = src.cell.unique_dst_ports.len() as f64;

        let dst_key = FlowKey::Dest(record.dst_ip.clone());
        let dst = state.cell_mut(dst_key);
        let dst_syn_rate = dst.cell.syn_count.rate(now);
        let dst_packet_rate = dst.cell.packet_count.rate(now);
        let dst_byte_rate = dst.cell.byte_count.rate(now);
        let unique_src_ips_to_dst = dst.cell.unique_src_ips.len() as f64;

        let _ = window;

        let syn_packet_ratio = global_syn_count / global_packet_count.max(1.0);
        let src_syn_ratio = src_syn_count / src_packet_count.max(1.0);

        [
            global_syn_rate,
            global_packet_rate,
            global_byte_rate,
            src_syn_rate,
            src_packet_rate,
            src_byte_rate,
            dst_syn_rate,
            dst_packet_rate,
            dst_byte_rate,
            unique_dst_ports,
            unique_src_ips_to_dst,
            record.packet_size as f64,
            record.dst_port as f64,
            record.src_port as f64,
            if record.is_syn() { 1.0 } else { 0.0 },
            if record.is_ack() { 1.0 } else { 0.0 },
            if record.is_fin() { 1.0 } else { 0.0 },
            if record.is_rst() { 1.0 } else { 0.0 },
            syn_packet_ratio,
            src_syn_ratio,
        ]
    }

    /// Drop all state. A freshly constructed extractor and a reset one with
    /// the same parameters behave identically for the next record (R2).
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.cells.clear();
        state.observation_count = 0;
    }
}
