use crate::{lock, MediaError, ReceivedFramesHandler, Result, TimestampedDataFrame};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// FIFO of everything a media handler received; for assertions in tests.
#[derive(Clone, Default)]
pub struct FrameSink {
    collected: Arc<Mutex<VecDeque<TimestampedDataFrame>>>,
}

impl FrameSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handler to pass to `Media::start` that feeds this sink.
    pub fn handler(&self) -> ReceivedFramesHandler {
        let collected = Arc::clone(&self.collected);
        Box::new(move |frames: Vec<TimestampedDataFrame>| {
            lock(&collected).extend(frames);
        })
    }

    /// Remove the oldest frame. Popping an empty sink is a test bug.
    pub fn pop(&self) -> Result<TimestampedDataFrame> {
        lock(&self.collected)
            .pop_front()
            .ok_or(MediaError::ContractViolation("pop from an empty frame sink"))
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.collected).is_empty()
    }

    pub fn len(&self) -> usize {
        lock(&self.collected).len()
    }
}

impl core::fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameSink")
            .field("collected", &*lock(&self.collected))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DataFrame, FrameFormat, Timestamp};

    #[test]
    fn test_fifo_order() {
        let sink = FrameSink::new();
        assert!(sink.is_empty());
        assert!(matches!(sink.pop(), Err(MediaError::ContractViolation(_))));

        let ts = Timestamp::now();
        let a = DataFrame::new(1, vec![1], FrameFormat::Base, false).unwrap();
        let b = DataFrame::new(1, vec![2], FrameFormat::Base, false).unwrap();
        let mut handler = sink.handler();
        handler(vec![TimestampedDataFrame::received(&a, false, ts)]);
        handler(vec![TimestampedDataFrame::received(&b, false, ts)]);

        assert_eq!(sink.len(), 2);
        assert!(sink.pop().unwrap().is_same_manifestation(&a));
        assert!(sink.pop().unwrap().is_same_manifestation(&b));
        assert!(sink.is_empty());
    }
}
