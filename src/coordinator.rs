//! `DetectionCoordinator`: owns the session lifecycle, the capture/worker/
//! statistics threads, and fan-out to subscribed event sinks.
//!
//! Thread-per-role shape (capture producer, worker consumers, a
//! cadence-driven statistics thread) with `parking_lot`/`dashmap` for the
//! shared state, consistent with `features.rs`'s extractor mutex and
//! `recovery.rs`'s per-fault dashmap, and with one thread per responsibility
//! rather than a pooled or async runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::bounded;
use dashmap::DashMap;
use log::{debug, error};
use parking_lot::Mutex;

use crate::capture::{CaptureSource, InterfaceDescriptor, NextOutcome};
use crate::classifier::ThreatClassifier;
use crate::config::Config;
use crate::data::{PacketRecord, ThreatEvent};
use crate::error::{Result, SynwatchError};
use crate::features::FeatureExtractor;
use crate::queue::{PacketQueue, PopResult, PushOutcome};
use crate::recovery::{RecoveryFault, RecoveryPolicy};
use crate::sink::{Event, EventSink, SessionState, SINK_DELIVERY_DEADLINE};
use crate::stats::DetectionStatistics;

/// Worker-loop publish cadence.
const STATS_PUBLISH_EVERY: u64 = 1_000;
/// Window over which the absorbed-error rate is evaluated.
const ERROR_RATE_WINDOW: u64 = 1_000;
const ERROR_RATE_THRESHOLD: f64 = 0.10;
/// Upper bound on how long `stop()` waits for threads to join.
const JOIN_DEADLINE: Duration = Duration::from_secs(5);

type SinkList = Arc<Mutex<Vec<Arc<dyn EventSink>>>>;
type CooldownMap = Arc<DashMap<(String, String), f64>>;

/// Wires `CaptureSource -> PacketQueue -> FeatureExtractor -> ThreatClassifier
/// -> EventSink` behind the session state machine.
pub struct DetectionCoordinator {
    capture_source: Arc<dyn CaptureSource>,
    classifier: Arc<ThreatClassifier>,
    extractor: Arc<FeatureExtractor>,
    queue: Arc<PacketQueue>,
    stats: Arc<DetectionStatistics>,
    recovery: Arc<RecoveryPolicy>,
    config: Config,
    state: Mutex<SessionState>,
    sinks: SinkList,
    cooldowns: CooldownMap,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// The currently open capture handle, shared with the capture thread so
    /// `stop()` can call `close()` on it directly rather than waiting for
    /// the capture thread to notice `running` has gone false and close it
    /// from inside its own loop, which never happens while that thread is
    /// blocked inside a `next()` call.
    capture_handle: Mutex<Option<Arc<Mutex<Box<dyn crate::capture::CaptureHandle>>>>>,
}

impl DetectionCoordinator {
    pub fn new(
        config: Config,
        capture_source: Arc<dyn CaptureSource>,
        classifier: Arc<ThreatClassifier>,
        recovery: Arc<RecoveryPolicy>,
    ) -> Self {
        let extractor = Arc::new(FeatureExtractor::new(config.detection.window_seconds as f64));
        let queue = Arc::new(PacketQueue::new(config.detection.max_queue_size));
        DetectionCoordinator {
            capture_source,
            classifier,
            extractor,
            queue,
            stats: Arc::new(DetectionStatistics::new()),
            recovery,
            config,
            state: Mutex::new(SessionState::Idle),
            sinks: Arc::new(Mutex::new(Vec::new())),
            cooldowns: Arc::new(DashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
            capture_handle: Mutex::new(None),
        }
    }

    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        self.sinks.lock().push(sink);
    }

    pub fn list_interfaces(&self) -> Vec<InterfaceDescriptor> {
        self.capture_source.list_interfaces()
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn get_statistics(&self) -> crate::stats::StatisticsSnapshot {
        self.stats.snapshot()
    }

    /// Drops all extractor state. Only meaningful while `Idle`/`Stopped`:
    /// a reset extractor behaves like a fresh one.
    pub fn reset_state(&self) {
        self.extractor.reset();
    }

    fn transition(&self, guard: &mut SessionState, to: SessionState) {
        let from = guard.clone();
        *guard = to.clone();
        Self::dispatch(&self.sinks, Event::StateChanged { from, to });
    }

    fn dispatch(sinks: &SinkList, event: Event) {
        let subscribers = sinks.lock().clone();
        for sink in subscribers {
            let (tx, rx) = bounded::<()>(1);
            let sink = sink.clone();
            let event_clone = event.clone();
            std::thread::spawn(move || {
                sink.handle(event_clone);
                let _ = tx.send(());
            });
            let _ = rx.recv_timeout(SINK_DELIVERY_DEADLINE);
        }
    }

    /// Opens the capture handle, retrying transient failures with the
    /// `CaptureOpenTransient` exponential backoff schedule. An
    /// `UnknownInterface` failure is not transient and is returned at once.
    /// The retry cap is `RecoveryPolicy`'s own configurable `max_attempts`
    /// (default 3), not the backoff schedule's length, so reconfiguring the
    /// policy's attempt budget actually changes how many times a transient
    /// capture-open failure is retried; the backoff *duration* still clamps
    /// to the schedule's last step once `attempt` runs past it.
    fn open_capture_with_retry(&self, interface_id: &str) -> Result<Box<dyn crate::capture::CaptureHandle>> {
        let mut last_err = None;
        for attempt in 1..=self.recovery.max_attempts() {
            match self.capture_source.open(
                interface_id,
                &self.config.network.bpf_filter,
                self.config.network.promiscuous_mode,
                Duration::from_secs(self.config.network.capture_timeout),
            ) {
                Ok(handle) => {
                    self.recovery.reset(&RecoveryFault::CaptureOpenTransient);
                    return Ok(handle);
                }
                Err(SynwatchError::UnknownInterface(id)) => {
                    return Err(SynwatchError::UnknownInterface(id));
                }
                Err(e) => {
                    error!("capture open attempt {} failed: {}", attempt, e);
                    let _ = self.recovery.attempt_recovery(RecoveryFault::CaptureOpenTransient);
                    last_err = Some(e);
                    std::thread::sleep(RecoveryPolicy::capture_open_backoff(attempt));
                }
            }
        }
        Err(last_err.unwrap_or(SynwatchError::CaptureOpenFailed {
            cause: "unknown capture failure".to_string(),
        }))
    }

    /// Starts a monitoring session on `interface_id`.
    pub fn start(&self, interface_id: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Idle && *state != SessionState::Stopped {
                return Err(SynwatchError::NotReady {
                    cause: format!("cannot start from state {}", *state),
                });
            }
            self.transition(&mut state, SessionState::Starting);
        }

        if !self.classifier.load_status().can_score() {
            let mut state = self.state.lock();
            self.transition(&mut state, SessionState::Stopped);
            return Err(SynwatchError::NotReady {
                cause: "classifier is not ready to score".to_string(),
            });
        }

        let handle = match self.open_capture_with_retry(interface_id) {
            Ok(handle) => handle,
            Err(e) => {
                let mut state = self.state.lock();
                self.transition(&mut state, SessionState::Stopped);
                return Err(e);
            }
        };

        let handle: Arc<Mutex<Box<dyn crate::capture::CaptureHandle>>> = Arc::new(Mutex::new(handle));
        *self.capture_handle.lock() = Some(handle.clone());

        self.running.store(true, Ordering::Release);
        let mut threads = self.threads.lock();
        threads.push(self.spawn_capture_thread(handle));
        for _ in 0..self.config.detection.worker_count {
            threads.push(self.spawn_worker_thread());
        }
        threads.push(self.spawn_statistics_thread());
        drop(threads);

        let mut state = self.state.lock();
        self.transition(&mut state, SessionState::Running);
        Ok(())
    }

    /// Idempotent: calling `stop` while `Idle`/`Stopped` is a no-op (R1).
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Idle || *state == SessionState::Stopped {
                return;
            }
            self.transition(&mut state, SessionState::Stopping);
        }

        self.running.store(false, Ordering::Release);
        self.queue.close();

        // Close the capture handle from here rather than waiting for the
        // capture thread to do it after its own loop exits: that loop only
        // re-checks `running` between `next()` calls, so if the thread is
        // currently blocked inside one, its own `handle.close()` never runs
        // in time to unblock it. Closing from a detached thread means a
        // handle whose current call is still in flight doesn't make `stop()`
        // itself wait on the lock.
        if let Some(handle) = self.capture_handle.lock().clone() {
            std::thread::spawn(move || {
                handle.lock().close();
            });
        }

        let handles: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        let deadline = std::time::Instant::now() + JOIN_DEADLINE;
        for handle in handles {
            Self::join_with_deadline(handle, deadline);
        }

        Self::dispatch(
            &self.sinks,
            Event::StatisticsSnapshot(self.stats.snapshot()),
        );

        let mut state = self.state.lock();
        self.transition(&mut state, SessionState::Stopped);
    }

    /// Joins `handle`, but never waits past `deadline`: the join itself
    /// happens on a detached helper thread, and this call only blocks for
    /// whatever time remains before `deadline`. A thread still running past
    /// that point is logged as stuck and left to finish on its own; `stop()`
    /// proceeds to `Stopped` regardless (spec: "past that, threads are
    /// logged as stuck but the session transitions to Stopped regardless").
    fn join_with_deadline(handle: JoinHandle<()>, deadline: std::time::Instant) {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        let (tx, rx) = bounded::<()>(1);
        std::thread::spawn(move || {
            let _ = handle.join();
            let _ = tx.send(());
        });
        if rx.recv_timeout(remaining).is_err() {
            debug!("thread did not join before the shutdown deadline");
        }
    }

    fn spawn_capture_thread(
        &self,
        handle: Arc<Mutex<Box<dyn crate::capture::CaptureHandle>>>,
    ) -> JoinHandle<()> {
        let queue_sender = self.queue.sender_handle();
        let queue = self.queue.clone();
        let stats = self.stats.clone();
        let running = self.running.clone();
        let read_timeout = Duration::from_secs(self.config.network.capture_timeout);

        std::thread::spawn(move || {
            while running.load(Ordering::Acquire) {
                match handle.lock().next(read_timeout) {
                    NextOutcome::Record(record) => {
                        stats.record_packet_captured();
                        if queue_sender.try_push(record) == PushOutcome::Dropped {
                            stats.record_packet_dropped();
                        }
                        stats.observe_queue_depth(queue.len() as u64);
                    }
                    NextOutcome::Timeout => continue,
                    NextOutcome::Closed => break,
                }
            }
            handle.lock().close();
        })
    }

    fn spawn_worker_thread(&self) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let extractor = self.extractor.clone();
        let classifier = self.classifier.clone();
        let stats = self.stats.clone();
        let running = self.running.clone();
        let sinks = self.sinks.clone();
        let cooldowns = self.cooldowns.clone();
        let cooldown_seconds = self.config.detection.alert_cooldown_seconds as f64;

        std::thread::spawn(move || {
            let mut processed_since_publish: u64 = 0;
            let mut processed_since_window: u64 = 0;
            let mut errors_since_window: u64 = 0;

            loop {
                if !running.load(Ordering::Acquire) && queue.is_empty() {
                    break;
                }
                match queue.pop(Duration::from_millis(100)) {
                    PopResult::Record(record) => {
                        process_record(
                            &record,
                            &extractor,
                            &classifier,
                            &stats,
                            &sinks,
                            &cooldowns,
                            cooldown_seconds,
                            &mut errors_since_window,
                        );
                        processed_since_publish += 1;
                        processed_since_window += 1;

                        if processed_since_publish >= STATS_PUBLISH_EVERY {
                            processed_since_publish = 0;
                            Self::dispatch(&sinks, Event::StatisticsSnapshot(stats.snapshot()));
                        }
                        if processed_since_window >= ERROR_RATE_WINDOW {
                            let rate = errors_since_window as f64 / processed_since_window as f64;
                            if rate > ERROR_RATE_THRESHOLD {
                                Self::dispatch(
                                    &sinks,
                                    Event::Error {
                                        kind: "HighErrorRate".to_string(),
                                        message: format!(
                                            "{:.1}% of the last {} records failed to score",
                                            rate * 100.0,
                                            processed_since_window
                                        ),
                                    },
                                );
                            }
                            processed_since_window = 0;
                            errors_since_window = 0;
                        }
                    }
                    PopResult::Timeout => continue,
                    PopResult::Closed => break,
                }
            }
        })
    }

    /// Wakes at `statistics_interval_s`, publishing a snapshot each time, but
    /// sleeps in short ticks so it observes the shutdown flag within 500 ms
    /// rather than oversleeping a full interval past `stop()`.
    fn spawn_statistics_thread(&self) -> JoinHandle<()> {
        let stats = self.stats.clone();
        let sinks = self.sinks.clone();
        let running = self.running.clone();
        let interval = Duration::from_secs(self.config.telemetry.statistics_interval_s.max(1));
        let tick = Duration::from_millis(200).min(interval);

        std::thread::spawn(move || {
            let mut elapsed = Duration::ZERO;
            while running.load(Ordering::Acquire) {
                std::thread::sleep(tick);
                elapsed += tick;
                if elapsed >= interval {
                    elapsed = Duration::ZERO;
                    Self::dispatch(&sinks, Event::StatisticsSnapshot(stats.snapshot()));
                }
            }
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn process_record(
    record: &PacketRecord,
    extractor: &FeatureExtractor,
    classifier: &ThreatClassifier,
    stats: &DetectionStatistics,
    sinks: &SinkList,
    cooldowns: &CooldownMap,
    cooldown_seconds: f64,
    errors_since_window: &mut u64,
) {
    let features = extractor.extract(record);
    stats.record_feature_extracted();

    let scored = classifier.score(&features);
    stats.record_prediction_made();

    let (probability, is_threat) = match scored {
        Ok(result) => result,
        Err(e) => {
            debug!("packet scoring failed: {}", e);
            stats.record_processing_error();
            *errors_since_window += 1;
            return;
        }
    };

    if !is_threat {
        return;
    }

    stats.record_threat_detected();

    let key = (record.src_ip.clone(), record.dst_ip.clone());
    let now = record.timestamp;
    let suppressed = match cooldowns.get(&key) {
        Some(last) => now - *last < cooldown_seconds,
        None => false,
    };

    if !suppressed {
        // Only an emitted alert advances the cooldown anchor: if a
        // suppressed hit moved it forward too, a sustained flood (which
        // never leaves a `cooldown_seconds` gap between threat-worthy
        // packets) would never re-arm and only the very first alert for
        // the pair would ever be emitted.
        cooldowns.insert(key, now);
        let event = ThreatEvent::new(record, probability, &features);
        DetectionCoordinator::dispatch(sinks, Event::ThreatDetected(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureHandle;
    use crate::classifier::ConstantModel;
    use crate::sink::ChannelEventSink;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    struct ScriptedHandle {
        records: StdMutex<VecDeque<PacketRecord>>,
    }

    impl CaptureHandle for ScriptedHandle {
        fn next(&mut self, _deadline: Duration) -> NextOutcome {
            match self.records.lock().unwrap().pop_front() {
                Some(record) => NextOutcome::Record(record),
                None => NextOutcome::Timeout,
            }
        }

        fn close(&mut self) {}
    }

    struct ScriptedCaptureSource {
        records: StdMutex<Option<VecDeque<PacketRecord>>>,
    }

    impl CaptureSource for ScriptedCaptureSource {
        fn list_interfaces(&self) -> Vec<InterfaceDescriptor> {
            vec![InterfaceDescriptor {
                id: "test0".to_string(),
                display_name: "test0".to_string(),
            }]
        }

        fn open(
            &self,
            _interface_id: &str,
            _filter_expression: &str,
            _promiscuous: bool,
            _read_timeout: Duration,
        ) -> Result<Box<dyn CaptureHandle>> {
            let records = self.records.lock().unwrap().take().unwrap_or_default();
            Ok(Box::new(ScriptedHandle {
                records: StdMutex::new(records),
            }))
        }
    }

    fn record(t: f64, src: &str, dst: &str) -> PacketRecord {
        PacketRecord {
            timestamp: t,
            src_ip: src.to_string(),
            dst_ip: dst.to_string(),
            src_port: 44000,
            dst_port: 80,
            flags: crate::data::FLAG_SYN,
            packet_size: 64,
        }
    }

    #[test]
    fn single_benign_syn_extracts_without_a_threat() {
        let mut config = Config::default();
        config.detection.worker_count = 1;
        config.telemetry.statistics_interval_s = 60;

        let source = Arc::new(ScriptedCaptureSource {
            records: StdMutex::new(Some(VecDeque::from([record(0.0, "10.0.0.1", "10.0.0.2")]))),
        });
        let classifier = Arc::new(ThreatClassifier::new(
            Arc::new(ConstantModel { probability: 0.10 }),
            None,
            0.7,
        ));
        let recovery = Arc::new(RecoveryPolicy::new(Default::default()));
        let coordinator = DetectionCoordinator::new(config, source, classifier, recovery);

        let (sink, rx) = ChannelEventSink::new(16);
        coordinator.subscribe(Arc::new(sink));

        coordinator.start("test0").expect("start should succeed");
        std::thread::sleep(Duration::from_millis(200));
        coordinator.stop();

        let snapshot = coordinator.get_statistics();
        assert_eq!(snapshot.features_extracted, 1);
        assert_eq!(snapshot.predictions_made, 1);
        assert_eq!(snapshot.threats_detected, 0);
        assert!(!rx
            .try_iter()
            .any(|event| matches!(event, Event::ThreatDetected(_))));
    }

    #[test]
    fn model_unavailable_refuses_to_start() {
        let config = Config::default();
        let source = Arc::new(ScriptedCaptureSource {
            records: StdMutex::new(Some(VecDeque::new())),
        });
        let classifier = Arc::new(ThreatClassifier::unloaded());
        let recovery = Arc::new(RecoveryPolicy::new(Default::default()));
        let coordinator = DetectionCoordinator::new(config, source, classifier, recovery);

        match coordinator.start("test0") {
            Err(SynwatchError::NotReady { .. }) => {}
            other => panic!("expected NotReady, got {:?}", other),
        }
        assert_eq!(coordinator.state(), SessionState::Stopped);
    }

    #[test]
    fn r1_stop_is_idempotent_while_idle() {
        let config = Config::default();
        let source = Arc::new(ScriptedCaptureSource {
            records: StdMutex::new(Some(VecDeque::new())),
        });
        let classifier = Arc::new(ThreatClassifier::new(
            Arc::new(ConstantModel { probability: 0.0 }),
            None,
            0.7,
        ));
        let recovery = Arc::new(RecoveryPolicy::new(Default::default()));
        let coordinator = DetectionCoordinator::new(config, source, classifier, recovery);

        coordinator.stop();
        assert_eq!(coordinator.state(), SessionState::Idle);
    }

    #[test]
    fn p5_start_stop_completes_well_under_five_seconds() {
        let mut config = Config::default();
        config.telemetry.statistics_interval_s = 60;
        let source = Arc::new(ScriptedCaptureSource {
            records: StdMutex::new(Some(VecDeque::from([record(0.0, "10.0.0.1", "10.0.0.2")]))),
        });
        let classifier = Arc::new(ThreatClassifier::new(
            Arc::new(ConstantModel { probability: 0.0 }),
            None,
            0.7,
        ));
        let recovery = Arc::new(RecoveryPolicy::new(Default::default()));
        let coordinator = DetectionCoordinator::new(config, source, classifier, recovery);

        let start = std::time::Instant::now();
        coordinator.start("test0").unwrap();
        coordinator.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(coordinator.state(), SessionState::Stopped);
    }
}
