//! Bounded MPSC queue with overflow accounting.
//!
//! A newtype around a channel with `enqueue`/`dequeue`-style methods, built
//! on `crossbeam_channel`'s bounded channel rather than
//! `crossbeam_queue::ArrayQueue` because `PacketQueue::pop(deadline)` needs an
//! actual parking wait up to a deadline, which `ArrayQueue` cannot do.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::data::PacketRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    Dropped,
}

/// Bounded single-producer-capable MPSC queue. `max_size` is fixed at
/// construction; the single capture thread is the only producer in this
/// crate's topology, which is what makes the FIFO guarantee hold.
pub struct PacketQueue {
    sender: Sender<PacketRecord>,
    receiver: Receiver<PacketRecord>,
    max_size: usize,
    closed: Arc<AtomicBool>,
}

/// What `PacketQueue::pop` actually returns: the outcome bundled with the
/// record payload, since an enum carrying non-`Copy` data can't derive
/// `Copy` itself.
pub enum PopResult {
    Record(PacketRecord),
    Timeout,
    Closed,
}

impl PacketQueue {
    pub fn new(max_size: usize) -> Self {
        let (sender, receiver) = bounded(max_size);
        PacketQueue {
            sender,
            receiver,
            max_size,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Current number of records waiting to be popped.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Non-blocking push. Never blocks the capture thread; on a full queue
    /// or a queue whose receiver side has been dropped, returns `Dropped`
    /// rather than propagating an error.
    pub fn try_push(&self, record: PacketRecord) -> PushOutcome {
        if self.closed.load(Ordering::Acquire) {
            return PushOutcome::Dropped;
        }
        match self.sender.try_send(record) {
            Ok(()) => PushOutcome::Accepted,
            Err(TrySendError::Full(_)) => PushOutcome::Dropped,
            Err(TrySendError::Disconnected(_)) => PushOutcome::Dropped,
        }
    }

    /// Blocks up to `deadline` for the next record.
    pub fn pop(&self, deadline: Duration) -> PopResult {
        match self.receiver.recv_timeout(deadline) {
            Ok(record) => PopResult::Record(record),
            Err(RecvTimeoutError::Timeout) => PopResult::Timeout,
            Err(RecvTimeoutError::Disconnected) => {
                if self.receiver.is_empty() {
                    PopResult::Closed
                } else {
                    PopResult::Timeout
                }
            }
        }
    }

    /// After `close`, further `try_push` calls return `Dropped`; already
    /// enqueued records remain poppable until drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn sender_handle(&self) -> PacketQueueSender {
        PacketQueueSender {
            sender: self.sender.clone(),
            closed: self.closed.clone(),
        }
    }
}

/// A cloneable handle usable from the capture thread; keeps `PacketQueue`
/// itself non-`Clone` so there is exactly one logical queue per session.
#[derive(Clone)]
pub struct PacketQueueSender {
    sender: Sender<PacketRecord>,
    closed: Arc<AtomicBool>,
}

impl PacketQueueSender {
    pub fn try_push(&self, record: PacketRecord) -> PushOutcome {
        if self.closed.load(Ordering::Acquire) {
            return PushOutcome::Dropped;
        }
        match self.sender.try_send(record) {
            Ok(()) => PushOutcome::Accepted,
            Err(_) => PushOutcome::Dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(src: &str) -> PacketRecord {
        PacketRecord {
            timestamp: 0.0,
            src_ip: src.to_string(),
            dst_ip: "10.0.0.2".to_string(),
            src_port: 1,
            dst_port: 80,
            flags: crate::data::FLAG_SYN,
            packet_size: 64,
        }
    }

    #[test]
    fn fifo_ordering_with_single_producer() {
        let queue = PacketQueue::new(10);
        for i in 0..5 {
            queue.try_push(record(&i.to_string()));
        }
        for i in 0..5 {
            match queue.pop(Duration::from_millis(10)) {
                PopResult::Record(r) => assert_eq!(r.src_ip, i.to_string()),
                _ => panic!("expected a record"),
            }
        }
    }

    #[test]
    fn p4_overflow_drops_without_exceeding_capacity() {
        let queue = PacketQueue::new(4);
        let mut dropped = 0;
        for i in 0..20 {
            if queue.try_push(record(&i.to_string())) == PushOutcome::Dropped {
                dropped += 1;
            }
            assert!(queue.len() <= queue.max_size());
        }
        assert!(dropped >= 16);
    }

    #[test]
    fn pop_times_out_on_empty_queue() {
        let queue = PacketQueue::new(4);
        match queue.pop(Duration::from_millis(5)) {
            PopResult::Timeout => {}
            _ => panic!("expected timeout"),
        }
    }

    #[test]
    fn closing_drains_remaining_records_before_reporting_closed() {
        let queue = PacketQueue::new(4);
        queue.try_push(record("10.0.0.1"));
        queue.close();
        match queue.pop(Duration::from_millis(10)) {
            PopResult::Record(r) => assert_eq!(r.src_ip, "10.0.0.1"),
            _ => panic!("expected the pre-close record to still be drainable"),
        }
    }
}
