use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use rollup_statsd::metric;

use crate::metric::Packet;
use crate::statsd::AggregatorCounters;

/// Bounded queue between the decoder and the aggregation workers.
///
/// Enqueueing never blocks. Packets arriving while the queue is full are dropped and counted,
/// favoring fresh traffic over completeness under overload.
#[derive(Debug)]
pub struct PacketQueue {
    sender: RwLock<Option<Sender<Packet>>>,
    receiver: Receiver<Packet>,
    closed: AtomicBool,
}

impl PacketQueue {
    /// Creates a queue holding at most `size` packets.
    pub fn new(size: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(size);
        Self {
            sender: RwLock::new(Some(sender)),
            receiver,
            closed: AtomicBool::new(false),
        }
    }

    /// Adds a packet, or drops it if the queue is full.
    ///
    /// Packets enqueued after [`close`](Self::close) are dropped as well.
    pub fn enqueue(&self, packet: Packet) {
        let result = match self.sender.read().as_ref() {
            Some(sender) => sender.try_send(packet),
            None => Err(TrySendError::Disconnected(packet)),
        };

        match result {
            Ok(()) => metric!(counter(AggregatorCounters::QueueEnqueues) += 1),
            Err(TrySendError::Full(_)) => {
                metric!(counter(AggregatorCounters::QueueDiscarded) += 1, reason = "full")
            }
            Err(TrySendError::Disconnected(_)) => {
                metric!(counter(AggregatorCounters::QueueDiscarded) += 1, reason = "closed")
            }
        }
    }

    /// Takes the next packet, blocking until one is available.
    ///
    /// Returns `None` once the queue is closed and all buffered packets were taken.
    pub fn dequeue(&self) -> Option<Packet> {
        let packet = self.receiver.recv().ok()?;
        metric!(counter(AggregatorCounters::QueueDequeues) += 1);
        Some(packet)
    }

    /// Closes the queue, waking up all blocked consumers once the queue is drained.
    ///
    /// Only the first call has an effect.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.sender.write().take();
    }

    /// Returns `true` once the queue was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns the approximate number of buffered packets.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Returns `true` if no packets are buffered.
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}
