use crate::{DataFrame, FilterConfiguration, MediaError, Result, TimestampedDataFrame};
use async_trait::async_trait;
use std::time::Instant;

/// Reception callback registered at `start`.
///
/// Invoked with non-empty batches, possibly from a backend's own I/O thread,
/// so it must be `Send` and should return quickly.
pub type ReceivedFramesHandler = Box<dyn FnMut(Vec<TimestampedDataFrame>) + Send>;

/// Boundary between a CAN transfer protocol and one CAN adapter.
///
/// Every operation other than the capacity getters fails with
/// [`MediaError::ResourceClosed`] unless the adapter is started and not closed.
#[async_trait]
pub trait Media: Send {
    /// Stable identity for logs and equality; never parsed.
    fn interface_name(&self) -> &str;

    /// Maximum payload length per frame.
    fn mtu(&self) -> usize;

    /// Size of the acceptance filter bank, fixed at construction.
    fn number_of_acceptance_filters(&self) -> usize;

    /// Register the reception handler and begin operation. Allowed once.
    fn start(
        &mut self,
        handler: ReceivedFramesHandler,
        no_automatic_retransmission: bool,
    ) -> Result<()>;

    /// Replace the whole filter bank; slots not covered by `configuration`
    /// become dead filters.
    fn configure_acceptance_filters(&mut self, configuration: &[FilterConfiguration]) -> Result<()>;

    fn automatic_retransmission_enabled(&self) -> bool;

    /// Transmit a non-empty batch sharing one identifier before the deadline.
    ///
    /// Returns how many frames went out; fewer than requested means the
    /// deadline expired, which is not an error.
    async fn send_until(&mut self, frames: &[DataFrame], monotonic_deadline: Instant)
        -> Result<usize>;

    /// Release the adapter. Only the first call succeeds.
    fn close(&mut self) -> Result<()>;

    /// Interfaces this backend can see on the host, without duplicates.
    fn list_available_interface_names() -> Result<Vec<String>>
    where
        Self: Sized;
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MediaState {
    #[default]
    Created,
    Started,
    Closed,
}

/// `Created -> Started -> Closed`, each step taken at most once.
#[derive(Debug, Default)]
pub struct Lifecycle {
    state: MediaState,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MediaState {
        self.state
    }

    pub fn start(&mut self) -> Result<()> {
        match self.state {
            MediaState::Created => {
                self.state = MediaState::Started;
                Ok(())
            }
            MediaState::Started | MediaState::Closed => Err(MediaError::ResourceClosed),
        }
    }

    /// Fails unless `start` has not been attempted successfully yet. Backends
    /// check this, do their fallible setup, and only then call [`Self::start`].
    pub fn ensure_created(&self) -> Result<()> {
        match self.state {
            MediaState::Created => Ok(()),
            MediaState::Started | MediaState::Closed => Err(MediaError::ResourceClosed),
        }
    }

    pub fn ensure_started(&self) -> Result<()> {
        match self.state {
            MediaState::Started => Ok(()),
            MediaState::Created | MediaState::Closed => Err(MediaError::ResourceClosed),
        }
    }

    /// Close from any state but `Closed`; returns the state left behind.
    pub fn close(&mut self) -> Result<MediaState> {
        match self.state {
            MediaState::Closed => Err(MediaError::ResourceClosed),
            prev => {
                self.state = MediaState::Closed;
                Ok(prev)
            }
        }
    }
}

/// Checks every backend applies before a batch reaches the wire.
pub fn validate_transmission(frames: &[DataFrame], mtu: usize) -> Result<()> {
    let first = frames
        .first()
        .ok_or(MediaError::ContractViolation("empty transmission set"))?;
    if frames.iter().any(|f| f.data().is_empty()) {
        return Err(MediaError::ContractViolation(
            "CAN frames with empty payload are not valid",
        ));
    }
    if frames.iter().any(|f| f.data().len() > mtu) {
        return Err(MediaError::ContractViolation("payload exceeds MTU"));
    }
    if frames.iter().any(|f| f.identifier() != first.identifier()) {
        return Err(MediaError::ContractViolation("nonuniform CAN ID in one batch"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameFormat;

    fn frame(id: u32, data: &[u8]) -> DataFrame {
        DataFrame::new(id, data.to_vec(), FrameFormat::Extended, false).unwrap()
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut lc = Lifecycle::new();
        assert_eq!(lc.ensure_started(), Err(MediaError::ResourceClosed));
        lc.start().unwrap();
        lc.ensure_started().unwrap();
        assert_eq!(lc.start(), Err(MediaError::ResourceClosed));
        assert_eq!(lc.close(), Ok(MediaState::Started));
        assert_eq!(lc.ensure_started(), Err(MediaError::ResourceClosed));
        assert_eq!(lc.start(), Err(MediaError::ResourceClosed));
        assert_eq!(lc.close(), Err(MediaError::ResourceClosed));
    }

    #[test]
    fn test_failed_setup_leaves_start_retryable() {
        let mut lc = Lifecycle::new();
        let setup = |ok: bool| -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(MediaError::Io("port vanished".into()))
            }
        };

        lc.ensure_created().unwrap();
        assert!(setup(false).is_err());
        assert_eq!(lc.state(), MediaState::Created);

        lc.ensure_created().unwrap();
        setup(true).unwrap();
        lc.start().unwrap();
        assert_eq!(lc.ensure_created(), Err(MediaError::ResourceClosed));
        lc.close().unwrap();
        assert_eq!(lc.ensure_created(), Err(MediaError::ResourceClosed));
    }

    #[test]
    fn test_close_before_start() {
        let mut lc = Lifecycle::new();
        assert_eq!(lc.close(), Ok(MediaState::Created));
        assert_eq!(lc.start(), Err(MediaError::ResourceClosed));
    }

    #[test]
    fn test_validate_transmission() {
        assert!(validate_transmission(&[frame(1, b"a"), frame(1, b"bc")], 8).is_ok());
        assert!(matches!(
            validate_transmission(&[], 8),
            Err(MediaError::ContractViolation(_))
        ));
        assert!(matches!(
            validate_transmission(&[frame(1, b"a"), frame(1, b"")], 8),
            Err(MediaError::ContractViolation(_))
        ));
        assert!(matches!(
            validate_transmission(&[frame(1, b"a"), frame(2, b"a")], 8),
            Err(MediaError::ContractViolation(_))
        ));
        assert!(matches!(
            validate_transmission(&[frame(1, &[0u8; 9])], 8),
            Err(MediaError::ContractViolation(_))
        ));
    }
}
