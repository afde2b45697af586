//! Second-stage transmitter for batch-dispatch mode.

use std::sync::Arc;

use crate::mailbox::Consumer;
use crate::packet::{Packet, TransmitSink};
use crate::runtime::stats::SchedulerStats;
use crate::trace::debug;

/// Drains the arbiter's forward buffer into the transmit sink in batches.
pub struct Dispatcher<P: Packet, S: TransmitSink<P>> {
    input: Consumer<Box<P>>,
    sink: S,
    batch_limit: usize,
    stats: Arc<SchedulerStats>,
}

impl<P: Packet, S: TransmitSink<P>> Dispatcher<P, S> {
    pub(crate) fn new(
        input: Consumer<Box<P>>,
        sink: S,
        batch_limit: usize,
        stats: Arc<SchedulerStats>,
    ) -> Self {
        Self {
            input,
            sink,
            batch_limit,
            stats,
        }
    }

    /// Transmits up to `batch_limit` packets and releases their slots.
    ///
    /// Returns the number transmitted.
    pub fn run(&mut self) -> usize {
        let mut sent = 0;
        while sent < self.batch_limit {
            let Some(packet) = self.input.extract() else {
                break;
            };
            self.sink.transmit(*packet);
            sent += 1;
        }

        if sent > 0 {
            self.input.clear();
            self.stats.add_dispatched(sent as u64);
            self.stats.add_transmitted(sent as u64);
        }
        sent
    }

    /// Discards whatever is left. Returns the count.
    pub fn shutdown(self) -> usize {
        let mut discarded = 0;
        while self.input.extract().is_some() {
            discarded += 1;
        }
        self.input.clear();
        debug!(discarded, "dispatcher drained");
        discarded
    }
}

impl<P: Packet, S: TransmitSink<P>> std::fmt::Debug for Dispatcher<P, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("batch_limit", &self.batch_limit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::MailboxConfig;
    use crate::mailbox::{self, Producer};

    type Sent = Arc<Mutex<Vec<u8>>>;

    fn setup(
        batch: usize,
    ) -> (
        Producer<Box<Vec<u8>>>,
        Dispatcher<Vec<u8>, impl FnMut(Vec<u8>) + Send + 'static>,
        Sent,
    ) {
        let (tx, rx) = mailbox::channel(MailboxConfig::new(64, 64)).unwrap();
        let sent: Sent = Arc::default();
        let out = Arc::clone(&sent);
        let sink = move |packet: Vec<u8>| out.lock().unwrap().push(packet[0]);
        let dispatcher = Dispatcher::new(rx, sink, batch, Arc::new(SchedulerStats::new(1)));
        (tx, dispatcher, sent)
    }

    #[test]
    fn run_respects_batch_limit() {
        let (tx, mut dispatcher, sent) = setup(3);
        for i in 0..7u8 {
            tx.insert(Box::new(vec![i])).unwrap();
        }

        assert_eq!(dispatcher.run(), 3);
        assert_eq!(dispatcher.run(), 3);
        assert_eq!(dispatcher.run(), 1);
        assert_eq!(dispatcher.run(), 0);
        assert_eq!(*sent.lock().unwrap(), (0..7).collect::<Vec<_>>());

        let snap = dispatcher.stats.snapshot();
        assert_eq!(snap.dispatched, 7);
        assert_eq!(snap.transmitted, 7);
    }

    #[test]
    fn run_frees_room_for_the_producer() {
        let (tx, mut dispatcher, _) = setup(1000);
        let usable = 64 - 2 * MailboxConfig::new(64, 64).entries_per_line();
        for i in 0..usable {
            tx.insert(Box::new(vec![i as u8])).unwrap();
        }
        assert!(tx.insert(Box::new(vec![0])).is_err());

        assert_eq!(dispatcher.run(), usable);
        assert!(tx.insert(Box::new(vec![0])).is_ok());
    }

    #[test]
    fn shutdown_discards_remaining() {
        let (tx, dispatcher, sent) = setup(2);
        for i in 0..5u8 {
            tx.insert(Box::new(vec![i])).unwrap();
        }
        assert_eq!(dispatcher.shutdown(), 5);
        assert!(sent.lock().unwrap().is_empty());
    }
}
