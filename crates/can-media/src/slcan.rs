use crate::inbox::Inbox;
use crate::{
    validate_transmission, BusInfo, DataFrame, FilterConfiguration, FrameFormat, Lifecycle, Media,
    MediaError, MediaState, ReceivedFramesHandler, Result, Timestamp, TimestampedDataFrame,
};
use async_trait::async_trait;
use serialport::{SerialPort, SerialPortType};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// SLCAN carries classic frames only.
pub const SLCAN_MTU: usize = 8;

#[derive(Clone, Debug)]
pub struct SlcanConfig {
    pub bitrate: SlcanBitrate,
    pub baud_rate: u32,
    /// Poll period of the reader thread; bounds how long `close` waits.
    pub read_timeout: Duration,
    /// Filters are applied in software, so the bank size is a free choice.
    pub number_of_acceptance_filters: usize,
}

impl Default for SlcanConfig {
    fn default() -> Self {
        Self {
            bitrate: SlcanBitrate::B500k,
            baud_rate: 115_200,
            read_timeout: Duration::from_millis(100),
            number_of_acceptance_filters: 8,
        }
    }
}

/// SLCAN text protocol over serial (common on macOS USB-CAN dongles)
pub struct SlcanMedia {
    port_path: String,
    port: Box<dyn SerialPort>,
    inbox: Arc<Inbox>,
    lifecycle: Lifecycle,
    automatic_retransmission_enabled: bool,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl SlcanMedia {
    /// Open the port and program the bitrate. The channel stays closed until `start`.
    pub fn open(path: &str, config: SlcanConfig) -> Result<Self> {
        if config.number_of_acceptance_filters == 0 {
            return Err(MediaError::ContractViolation(
                "at least one acceptance filter is required",
            ));
        }
        let mut port = serialport::new(path, config.baud_rate)
            .timeout(config.read_timeout)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => MediaError::InterfaceNotFound(path.to_string()),
                _ => MediaError::Io(e.to_string()),
            })?;
        // Close whatever state the dongle was left in, then set the bitrate
        let _ = Self::write_cmd(&mut *port, b"C\r");
        Self::write_cmd(&mut *port, &[b'S', config.bitrate.code(), b'\r'])?;
        debug!(path, bitrate = ?config.bitrate, "slcan port opened");
        Ok(SlcanMedia {
            port_path: path.to_string(),
            port,
            inbox: Arc::new(Inbox::new(config.number_of_acceptance_filters)),
            lifecycle: Lifecycle::new(),
            automatic_retransmission_enabled: false,
            stop: Arc::new(AtomicBool::new(false)),
            reader: None,
        })
    }

    /// Serial ports on this host, labelled by how likely they are SLCAN dongles.
    pub fn list_buses() -> Result<Vec<BusInfo>> {
        let mut out: Vec<BusInfo> = Vec::new();
        for p in serialport::available_ports().map_err(|e| MediaError::Io(e.to_string()))? {
            if out.iter().any(|b| b.name == p.port_name) {
                continue;
            }
            let driver = match p.port_type {
                SerialPortType::UsbPort(_) => "slcan-serial",
                _ => "serial",
            };
            out.push(BusInfo {
                name: p.port_name,
                driver: driver.to_string(),
            });
        }
        Ok(out)
    }

    fn write_cmd(port: &mut dyn SerialPort, cmd: &[u8]) -> Result<()> {
        port.write_all(cmd)?;
        Ok(())
    }

    fn stop_reader(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!(path = %self.port_path, "slcan reader thread panicked");
            }
        }
    }

    fn spawn_reader(&mut self) -> Result<()> {
        self.stop.store(false, Ordering::Relaxed);
        let mut port = self
            .port
            .try_clone()
            .map_err(|e| MediaError::Io(e.to_string()))?;
        let inbox = Arc::clone(&self.inbox);
        let stop = Arc::clone(&self.stop);
        let path = self.port_path.clone();
        let handle = std::thread::Builder::new()
            .name(format!("slcan-rx {path}"))
            .spawn(move || {
                let mut buf = [0u8; 128];
                let mut acc: Vec<u8> = Vec::with_capacity(64);
                while !stop.load(Ordering::Relaxed) {
                    let n = match port.read(&mut buf) {
                        Ok(n) => n,
                        Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                            continue
                        }
                        Err(e) => {
                            warn!(path = %path, error = %e, "slcan read failed, reader stopping");
                            break;
                        }
                    };
                    acc.extend_from_slice(&buf[..n]);
                    // Lines end in CR; BEL is the adapter's error reply
                    while let Some(pos) = acc.iter().position(|&b| b == b'\r' || b == 0x07) {
                        let line: Vec<u8> = acc.drain(..=pos).collect();
                        let body = &line[..line.len() - 1];
                        if line[line.len() - 1] == 0x07 {
                            debug!(path = %path, "slcan adapter reported an error");
                            continue;
                        }
                        if body.is_empty() {
                            continue;
                        }
                        match parse_frame(body) {
                            Ok(Some(frame)) => {
                                let rx = TimestampedDataFrame::received(&frame, false, Timestamp::now());
                                inbox.deliver(std::iter::once(rx));
                            }
                            Ok(None) => {}
                            Err(e) => warn!(path = %path, error = %e, "unparseable slcan line"),
                        }
                    }
                }
            })?;
        self.reader = Some(handle);
        Ok(())
    }
}

#[async_trait]
impl Media for SlcanMedia {
    fn interface_name(&self) -> &str {
        &self.port_path
    }

    fn mtu(&self) -> usize {
        SLCAN_MTU
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
        let opened = self
            .spawn_reader()
            .and_then(|()| Self::write_cmd(&mut *self.port, b"O\r"));
        if let Err(e) = opened {
            self.stop_reader();
            self.inbox.set_handler(None);
            warn!(path = %self.port_path, error = %e, "slcan channel failed to open");
            return Err(e);
        }
        // SLCAN has no standard command for one-shot mode; the flag is informational
        self.automatic_retransmission_enabled = !no_automatic_retransmission;
        self.lifecycle.start()?;
        debug!(path = %self.port_path, "slcan channel open");
        Ok(())
    }

    fn configure_acceptance_filters(&mut self, configuration: &[FilterConfiguration]) -> Result<()> {
        self.lifecycle.ensure_started()?;
        self.inbox.reconfigure(configuration)
    }

    fn automatic_retransmission_enabled(&self) -> bool {
        self.automatic_retransmission_enabled
    }

    /// Writes block the calling thread, each bounded by the time left until
    /// the deadline. Under tokio, call from a blocking-capable context
    /// (`spawn_blocking` or `block_in_place`) when deadlines are long.
    async fn send_until(
        &mut self,
        frames: &[DataFrame],
        monotonic_deadline: Instant,
    ) -> Result<usize> {
        self.lifecycle.ensure_started()?;
        validate_transmission(frames, SLCAN_MTU)?;
        let mut sent = 0;
        for frame in frames {
            let remaining = monotonic_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let line = encode_frame(frame)?;
            self.port
                .set_timeout(remaining)
                .map_err(|e| MediaError::Io(e.to_string()))?;
            match self.port.write_all(&line) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
            sent += 1;
            if frame.loopback() {
                self.inbox
                    .deliver_loopback(std::slice::from_ref(frame), Timestamp::now());
            }
        }
        if sent < frames.len() {
            debug!(path = %self.port_path, sent, total = frames.len(), "deadline reached");
        }
        Ok(sent)
    }

    fn close(&mut self) -> Result<()> {
        let prev = self.lifecycle.close()?;
        if prev == MediaState::Started {
            if let Err(e) = Self::write_cmd(&mut *self.port, b"C\r") {
                warn!(path = %self.port_path, error = %e, "failed to close slcan channel");
            }
        }
        self.stop_reader();
        self.inbox.set_handler(None);
        debug!(path = %self.port_path, "slcan media closed");
        Ok(())
    }

    fn list_available_interface_names() -> Result<Vec<String>> {
        Ok(Self::list_buses()?.into_iter().map(|b| b.name).collect())
    }
}

impl Drop for SlcanMedia {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn encode_frame(frame: &DataFrame) -> Result<Vec<u8>> {
    if frame.data().len() > SLCAN_MTU {
        return Err(MediaError::InvalidFrame("dlc > 8"));
    }
    let mut out = Vec::with_capacity(32);
    match frame.format() {
        FrameFormat::Extended => {
            out.push(b'T');
            out.extend_from_slice(format!("{:08X}", frame.identifier()).as_bytes());
        }
        FrameFormat::Base => {
            out.push(b't');
            out.extend_from_slice(format!("{:03X}", frame.identifier()).as_bytes());
        }
    }
    out.push(b'0' + frame.data().len() as u8);
    for b in frame.data() {
        out.extend_from_slice(format!("{b:02X}").as_bytes());
    }
    out.push(b'\r');
    Ok(out)
}

fn parse_hex(digits: &[u8]) -> Result<u32> {
    let s = std::str::from_utf8(digits).map_err(|_| MediaError::InvalidFrame("utf8"))?;
    u32::from_str_radix(s, 16).map_err(|_| MediaError::InvalidFrame("hex"))
}

/// Parse one line without its terminator. Remote frames and transmit
/// acknowledgements yield `None`.
fn parse_frame(line: &[u8]) -> Result<Option<DataFrame>> {
    let (format, id_len) = match line.first() {
        Some(b't') => (FrameFormat::Base, 3),
        Some(b'T') => (FrameFormat::Extended, 8),
        Some(b'r' | b'R' | b'z' | b'Z') => return Ok(None),
        Some(_) => return Err(MediaError::InvalidFrame("unknown header")),
        None => return Err(MediaError::InvalidFrame("empty")),
    };
    if line.len() < 1 + id_len + 1 {
        return Err(MediaError::InvalidFrame("short header"));
    }
    let id = parse_hex(&line[1..1 + id_len])?;
    let dlc = line[1 + id_len]
        .checked_sub(b'0')
        .filter(|&d| usize::from(d) <= SLCAN_MTU)
        .ok_or(MediaError::InvalidFrame("dlc"))?;
    let data_start = 2 + id_len;
    let data_end = data_start + 2 * usize::from(dlc);
    // Anything past the data is an optional adapter timestamp
    let hex = line
        .get(data_start..data_end)
        .ok_or(MediaError::InvalidFrame("short data"))?;
    let data = hex
        .chunks(2)
        .map(|pair| parse_hex(pair).map(|b| b as u8))
        .collect::<Result<Vec<u8>>>()?;
    DataFrame::new(id, data, format, false).map(Some)
}

/// Supported SLCAN bitrates (mapped to Sx codes)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlcanBitrate {
    B10k,  // S0
    B20k,  // S1
    B50k,  // S2
    B100k, // S3
    B125k, // S4
    B250k, // S5
    B500k, // S6
    B800k, // S7
    B1M,   // S8
}

impl SlcanBitrate {
    pub fn code(self) -> u8 {
        match self {
            SlcanBitrate::B10k => b'0',
            SlcanBitrate::B20k => b'1',
            SlcanBitrate::B50k => b'2',
            SlcanBitrate::B100k => b'3',
            SlcanBitrate::B125k => b'4',
            SlcanBitrate::B250k => b'5',
            SlcanBitrate::B500k => b'6',
            SlcanBitrate::B800k => b'7',
            SlcanBitrate::B1M => b'8',
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_lines() {
        let f = DataFrame::new(0x123, vec![0xDE, 0xAD], FrameFormat::Base, false).unwrap();
        assert_eq!(encode_frame(&f).unwrap(), b"t1232DEAD\r".to_vec());
        let f = DataFrame::new(0x1ABCDEF, vec![1], FrameFormat::Extended, true).unwrap();
        assert_eq!(encode_frame(&f).unwrap(), b"T01ABCDEF101\r".to_vec());
        let f = DataFrame::new(1, vec![0; 12], FrameFormat::Base, false).unwrap();
        assert!(encode_frame(&f).is_err());
    }

    #[test]
    fn test_parse_lines() {
        let f = parse_frame(b"t1232DEAD").unwrap().unwrap();
        assert_eq!(f.identifier(), 0x123);
        assert_eq!(f.format(), FrameFormat::Base);
        assert_eq!(f.data(), &[0xDE, 0xAD]);

        let f = parse_frame(b"T01ABCDEF101").unwrap().unwrap();
        assert_eq!(f.identifier(), 0x1ABCDEF);
        assert_eq!(f.format(), FrameFormat::Extended);
        assert!(!f.loopback());

        // Trailing adapter timestamp is ignored
        let f = parse_frame(b"t00110A1B2").unwrap().unwrap();
        assert_eq!(f.data(), &[0x0A]);

        assert_eq!(parse_frame(b"r1230").unwrap(), None);
        assert_eq!(parse_frame(b"z").unwrap(), None);
        assert!(parse_frame(b"t12").is_err());
        assert!(parse_frame(b"t1239").is_err());
        assert!(parse_frame(b"t1232DE").is_err());
        assert!(parse_frame(b"x").is_err());
        assert!(parse_frame(b"").is_err());
    }

    #[test]
    fn test_bitrate_codes() {
        assert_eq!(SlcanBitrate::B10k.code(), b'0');
        assert_eq!(SlcanBitrate::B500k.code(), b'6');
        assert_eq!(SlcanBitrate::B1M.code(), b'8');
    }
}
