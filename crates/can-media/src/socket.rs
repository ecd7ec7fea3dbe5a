use crate::inbox::Inbox;
use crate::{
    validate_transmission, BusInfo, DataFrame, FilterConfiguration, FrameFormat, Lifecycle, Media,
    MediaError, ReceivedFramesHandler, Result, Timestamp, TimestampedDataFrame,
};
use async_trait::async_trait;
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Id, Socket, StandardId};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Classic CAN sockets only; FD sockets are not opened.
pub const SOCKETCAN_MTU: usize = 8;

/// `ARPHRD_CAN` as reported in `/sys/class/net/<if>/type`.
const ARPHRD_CAN: &str = "280";

#[derive(Clone, Debug)]
pub struct SocketCanConfig {
    /// Poll period of the reader thread; bounds how long `close` waits.
    pub read_timeout: Duration,
    pub number_of_acceptance_filters: usize,
}

impl Default for SocketCanConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(100),
            number_of_acceptance_filters: 16,
        }
    }
}

/// Linux kernel CAN socket. Filtering happens in user space through the same
/// bank the virtual bus uses, so behaviour matches it bit for bit.
pub struct SocketCanMedia {
    iface: String,
    socket: Arc<CanSocket>,
    inbox: Arc<Inbox>,
    lifecycle: Lifecycle,
    automatic_retransmission_enabled: bool,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl SocketCanMedia {
    pub fn open(iface: &str, config: SocketCanConfig) -> Result<Self> {
        if config.number_of_acceptance_filters == 0 {
            return Err(MediaError::ContractViolation(
                "at least one acceptance filter is required",
            ));
        }
        let socket = CanSocket::open(iface).map_err(|e| match e.kind() {
            ErrorKind::NotFound => MediaError::InterfaceNotFound(iface.to_string()),
            _ => MediaError::Io(e.to_string()),
        })?;
        socket.set_read_timeout(config.read_timeout)?;
        debug!(iface, "can socket opened");
        Ok(Self {
            iface: iface.to_string(),
            socket: Arc::new(socket),
            inbox: Arc::new(Inbox::new(config.number_of_acceptance_filters)),
            lifecycle: Lifecycle::new(),
            automatic_retransmission_enabled: false,
            stop: Arc::new(AtomicBool::new(false)),
            reader: None,
        })
    }

    /// CAN network interfaces known to the kernel.
    pub fn list_buses() -> Result<Vec<BusInfo>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir("/sys/class/net")? {
            let entry = entry?;
            let kind = std::fs::read_to_string(entry.path().join("type")).unwrap_or_default();
            if kind.trim() == ARPHRD_CAN {
                out.push(BusInfo {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    driver: "socketcan".to_string(),
                });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out.dedup_by(|a, b| a.name == b.name);
        Ok(out)
    }

    fn spawn_reader(&mut self) -> Result<()> {
        let socket = Arc::clone(&self.socket);
        let inbox = Arc::clone(&self.inbox);
        let stop = Arc::clone(&self.stop);
        let iface = self.iface.clone();
        let handle = std::thread::Builder::new()
            .name(format!("socketcan-rx {iface}"))
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    match socket.read_frame() {
                        Ok(frame) => {
                            if let Some(frame) = from_socket_frame(&frame) {
                                let rx = TimestampedDataFrame::received(&frame, false, Timestamp::now());
                                inbox.deliver(std::iter::once(rx));
                            }
                        }
                        Err(e)
                            if matches!(
                                e.kind(),
                                ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                            ) => {}
                        Err(e) => {
                            warn!(iface = %iface, error = %e, "can socket read failed, reader stopping");
                            break;
                        }
                    }
                }
            })?;
        self.reader = Some(handle);
        Ok(())
    }
}

fn to_socket_frame(frame: &DataFrame) -> Result<CanFrame> {
    let id: Id = match frame.format() {
        FrameFormat::Base => u16::try_from(frame.identifier())
            .ok()
            .and_then(StandardId::new)
            .map(Id::Standard),
        FrameFormat::Extended => ExtendedId::new(frame.identifier()).map(Id::Extended),
    }
    .ok_or(MediaError::InvalidFrame("identifier out of range"))?;
    CanFrame::new(id, frame.data()).ok_or(MediaError::InvalidFrame("payload too long"))
}

/// Data frames only; remote and error frames are dropped.
fn from_socket_frame(frame: &CanFrame) -> Option<DataFrame> {
    if !matches!(frame, CanFrame::Data(_)) {
        return None;
    }
    let (identifier, format) = match frame.id() {
        Id::Standard(id) => (u32::from(id.as_raw()), FrameFormat::Base),
        Id::Extended(id) => (id.as_raw(), FrameFormat::Extended),
    };
    DataFrame::new(identifier, frame.data(), format, false).ok()
}

#[async_trait]
impl Media for SocketCanMedia {
    fn interface_name(&self) -> &str {
        &self.iface
    }

    fn mtu(&self) -> usize {
        SOCKETCAN_MTU
    }

    fn number_of_acceptance_filters(&self) -> usize {
        self.inbox.number_of_acceptance_filters()
    }

    fn start(
        &mut self,
        handler: ReceivedFramesHandler,
        no_automatic_retransmission: bool,
    ) -> Result<()> {
        self.lifecycle.ensure_created()?;
        self.inbox.set_handler(Some(handler));
        if let Err(e) = self.spawn_reader() {
            self.inbox.set_handler(None);
            warn!(iface = %self.iface, error = %e, "socketcan reader failed to start");
            return Err(e);
        }
        // One-shot mode is a netlink link setting, outside what a raw socket controls
        self.automatic_retransmission_enabled = !no_automatic_retransmission;
        self.lifecycle.start()?;
        debug!(iface = %self.iface, "socketcan media started");
        Ok(())
    }

    fn configure_acceptance_filters(&mut self, configuration: &[FilterConfiguration]) -> Result<()> {
        self.lifecycle.ensure_started()?;
        self.inbox.reconfigure(configuration)
    }

    fn automatic_retransmission_enabled(&self) -> bool {
        self.automatic_retransmission_enabled
    }

    /// `write_frame` blocks the calling thread, bounded by the time left until
    /// the deadline. Under tokio, call from a blocking-capable context
    /// (`spawn_blocking` or `block_in_place`) when deadlines are long.
    async fn send_until(
        &mut self,
        frames: &[DataFrame],
        monotonic_deadline: Instant,
    ) -> Result<usize> {
        self.lifecycle.ensure_started()?;
        validate_transmission(frames, SOCKETCAN_MTU)?;
        let mut sent = 0;
        for frame in frames {
            let remaining = monotonic_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let out = to_socket_frame(frame)?;
            self.socket.set_write_timeout(remaining)?;
            match self.socket.write_frame(&out) {
                Ok(()) => {}
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
                Err(e) => return Err(e.into()),
            }
            sent += 1;
            if frame.loopback() {
                self.inbox
                    .deliver_loopback(std::slice::from_ref(frame), Timestamp::now());
            }
        }
        if sent < frames.len() {
            debug!(iface = %self.iface, sent, total = frames.len(), "deadline reached");
        }
        Ok(sent)
    }

    fn close(&mut self) -> Result<()> {
        self.lifecycle.close()?;
        self.stop.store(true, Ordering::Relaxed);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!(iface = %self.iface, "socketcan reader thread panicked");
            }
        }
        self.inbox.set_handler(None);
        debug!(iface = %self.iface, "socketcan media closed");
        Ok(())
    }

    fn list_available_interface_names() -> Result<Vec<String>> {
        Ok(Self::list_buses()?.into_iter().map(|b| b.name).collect())
    }
}

impl Drop for SocketCanMedia {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_conversion() {
        let f = DataFrame::new(0x123, vec![1, 2, 3], FrameFormat::Base, true).unwrap();
        let back = from_socket_frame(&to_socket_frame(&f).unwrap()).unwrap();
        assert_eq!(back.identifier(), 0x123);
        assert_eq!(back.format(), FrameFormat::Base);
        assert_eq!(back.data(), &[1, 2, 3]);
        assert!(!back.loopback());

        let f = DataFrame::new(0x1234_5678, vec![9], FrameFormat::Extended, false).unwrap();
        let back = from_socket_frame(&to_socket_frame(&f).unwrap()).unwrap();
        assert_eq!(back.identifier(), 0x1234_5678);
        assert_eq!(back.format(), FrameFormat::Extended);

        let f = DataFrame::new(1, vec![0; 9], FrameFormat::Base, false).unwrap();
        assert!(to_socket_frame(&f).is_err());
    }
}
