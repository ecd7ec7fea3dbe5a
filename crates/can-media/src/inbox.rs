use crate::{
    lock, DataFrame, FilterBank, FilterConfiguration, ReceivedFramesHandler, Result, Timestamp,
    TimestampedDataFrame,
};
use std::sync::Mutex;
use tracing::trace;

/// Receive side shared by every backend: the filter bank and the handler.
///
/// Reader threads and peers deliver through it; the owning adapter
/// reconfigures it.
pub(crate) struct Inbox {
    bank: Mutex<FilterBank>,
    handler: Mutex<Option<ReceivedFramesHandler>>,
}

impl Inbox {
    pub(crate) fn new(number_of_acceptance_filters: usize) -> Self {
        Self {
            bank: Mutex::new(FilterBank::new(number_of_acceptance_filters)),
            handler: Mutex::new(None),
        }
    }

    pub(crate) fn number_of_acceptance_filters(&self) -> usize {
        lock(&self.bank).len()
    }

    pub(crate) fn set_handler(&self, handler: Option<ReceivedFramesHandler>) {
        *lock(&self.handler) = handler;
    }

    pub(crate) fn reconfigure(&self, configuration: &[FilterConfiguration]) -> Result<()> {
        lock(&self.bank).reconfigure(configuration)
    }

    /// Filter `frames` and hand the survivors to the handler, if any survive.
    pub(crate) fn deliver(&self, frames: impl Iterator<Item = TimestampedDataFrame>) {
        let accepted: Vec<_> = {
            let bank = lock(&self.bank);
            frames.filter(|f| bank.accepts(f.frame())).collect()
        };
        if accepted.is_empty() {
            return;
        }
        trace!(count = accepted.len(), "delivering frames");
        if let Some(handler) = lock(&self.handler).as_mut() {
            handler(accepted);
        }
    }

    /// Hand the sender's own loopback-flagged frames back to it.
    pub(crate) fn deliver_loopback(&self, frames: &[DataFrame], timestamp: Timestamp) {
        self.deliver(
            frames
                .iter()
                .filter(|f| f.loopback())
                .map(|f| TimestampedDataFrame::received(f, true, timestamp)),
        );
    }
}
