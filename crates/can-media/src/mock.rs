use crate::inbox::Inbox;
use crate::{
    lock, validate_transmission, DataFrame, FilterConfiguration, Lifecycle, Media, MediaError,
    ReceivedFramesHandler, Result, Timestamp, TimestampedDataFrame, VALID_MTU_SET,
};
use async_trait::async_trait;
use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tracing::{debug, trace};

static NEXT_BUS_ID: AtomicU64 = AtomicU64::new(1);

/// An in-process CAN bus. Every [`MockMedia`] attached to the same bus (or a
/// clone of it) sees the frames the others transmit.
#[derive(Clone)]
pub struct VirtualBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    id: u64,
    peers: Mutex<Vec<Peer>>,
}

/// Registry entry: the receive side of one adapter and the largest payload
/// it can take.
struct Peer {
    mtu: usize,
    inbox: Weak<Inbox>,
}

impl Peer {
    fn is(&self, inbox: &Arc<Inbox>) -> bool {
        self.inbox.upgrade().is_some_and(|p| Arc::ptr_eq(&p, inbox))
    }
}

impl Default for VirtualBus {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                id: NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed),
                peers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Number of adapters currently on the bus.
    pub fn peer_count(&self) -> usize {
        lock(&self.inner.peers)
            .iter()
            .filter(|p| p.inbox.strong_count() > 0)
            .count()
    }

    pub fn contains(&self, media: &MockMedia) -> bool {
        lock(&self.inner.peers).iter().any(|p| p.is(&media.inbox))
    }

    fn attach(&self, inbox: &Arc<Inbox>, mtu: usize) {
        let mut peers = lock(&self.inner.peers);
        peers.retain(|p| p.inbox.strong_count() > 0);
        peers.push(Peer {
            mtu,
            inbox: Arc::downgrade(inbox),
        });
        debug!(bus = self.inner.id, peers = peers.len(), "peer attached");
    }

    fn detach(&self, inbox: &Arc<Inbox>) {
        let mut peers = lock(&self.inner.peers);
        peers.retain(|p| p.inbox.strong_count() > 0 && !p.is(inbox));
        debug!(bus = self.inner.id, peers = peers.len(), "peer detached");
    }

    /// Live peers other than `inbox`, snapshotted so delivery runs unlocked.
    fn peers_except(&self, inbox: &Arc<Inbox>) -> Vec<(usize, Arc<Inbox>)> {
        lock(&self.inner.peers)
            .iter()
            .filter_map(|p| p.inbox.upgrade().map(|i| (p.mtu, i)))
            .filter(|(_, p)| !Arc::ptr_eq(p, inbox))
            .collect()
    }
}

/// Media backed by a [`VirtualBus`], with fault injection for tests.
///
/// The deadline of `send_until` is ignored: the bus has no congestion, so a
/// batch is either delivered in full or fails with the injected fault.
/// A peer never receives a frame longer than its own MTU.
pub struct MockMedia {
    bus: VirtualBus,
    inbox: Arc<Inbox>,
    interface_name: String,
    mtu: usize,
    lifecycle: Lifecycle,
    automatic_retransmission_enabled: bool,
    raise_on_send_once: Option<MediaError>,
}

impl MockMedia {
    /// Create an adapter and attach it to `bus`.
    pub fn new(bus: &VirtualBus, mtu: usize, number_of_acceptance_filters: usize) -> Result<Self> {
        if !VALID_MTU_SET.contains(&mtu) {
            return Err(MediaError::ContractViolation("invalid MTU"));
        }
        if number_of_acceptance_filters == 0 {
            return Err(MediaError::ContractViolation(
                "at least one acceptance filter is required",
            ));
        }
        let inbox = Arc::new(Inbox::new(number_of_acceptance_filters));
        bus.attach(&inbox, mtu);
        Ok(Self {
            bus: bus.clone(),
            inbox,
            interface_name: format!("mock@{:08x}", bus.id()),
            mtu,
            lifecycle: Lifecycle::new(),
            automatic_retransmission_enabled: false,
            raise_on_send_once: None,
        })
    }

    /// Make the next `send_until` fail with `error` instead of transmitting.
    pub fn raise_on_send_once(&mut self, error: MediaError) {
        self.raise_on_send_once = Some(error);
    }

    /// Feed frames straight into this adapter's filter and handler, as if
    /// they had arrived from outside the bus. Loopback flags are kept.
    pub fn inject_received(&self, frames: &[DataFrame]) -> Result<()> {
        self.lifecycle.ensure_started()?;
        let timestamp = Timestamp::now();
        self.inbox.deliver(
            frames
                .iter()
                .map(|f| TimestampedDataFrame::received(f, f.loopback(), timestamp)),
        );
        Ok(())
    }

    pub fn bus(&self) -> &VirtualBus {
        &self.bus
    }
}

#[async_trait]
impl Media for MockMedia {
    fn interface_name(&self) -> &str {
        &self.interface_name
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn number_of_acceptance_filters(&self) -> usize {
        self.inbox.number_of_acceptance_filters()
    }

    fn start(
        &mut self,
        handler: ReceivedFramesHandler,
        no_automatic_retransmission: bool,
    ) -> Result<()> {
        self.lifecycle.start()?;
        self.inbox.set_handler(Some(handler));
        self.automatic_retransmission_enabled = !no_automatic_retransmission;
        debug!(
            iface = %self.interface_name,
            retransmission = self.automatic_retransmission_enabled,
            "mock media started"
        );
        Ok(())
    }

    fn configure_acceptance_filters(&mut self, configuration: &[FilterConfiguration]) -> Result<()> {
        self.lifecycle.ensure_started()?;
        self.inbox.reconfigure(configuration)?;
        debug!(iface = %self.interface_name, count = configuration.len(), "filters configured");
        Ok(())
    }

    fn automatic_retransmission_enabled(&self) -> bool {
        self.automatic_retransmission_enabled
    }

    async fn send_until(
        &mut self,
        frames: &[DataFrame],
        _monotonic_deadline: Instant,
    ) -> Result<usize> {
        self.lifecycle.ensure_started()?;
        if let Some(e) = self.raise_on_send_once.take() {
            debug!(iface = %self.interface_name, error = %e, "raising injected send failure");
            return Err(e);
        }
        validate_transmission(frames, self.mtu)?;

        let timestamp = Timestamp::now();
        // Loopback is local to the sender; on the wire every frame is plain.
        for (mtu, peer) in self.bus.peers_except(&self.inbox) {
            if frames.iter().any(|f| f.data().len() > mtu) {
                trace!(iface = %self.interface_name, mtu, "dropping frames over peer MTU");
            }
            peer.deliver(
                frames
                    .iter()
                    .filter(|f| f.data().len() <= mtu)
                    .map(|f| TimestampedDataFrame::received(f, false, timestamp)),
            );
        }
        self.inbox.deliver_loopback(frames, timestamp);
        Ok(frames.len())
    }

    fn close(&mut self) -> Result<()> {
        self.lifecycle.close()?;
        self.bus.detach(&self.inbox);
        self.inbox.set_handler(None);
        debug!(iface = %self.interface_name, "mock media closed");
        Ok(())
    }

    fn list_available_interface_names() -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

impl fmt::Display for MockMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MockMedia(interface_name='{}', mtu={})",
            self.interface_name, self.mtu
        )
    }
}
