use anyhow::{bail, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use can_media as can;
use can_media::{FilterConfiguration, FrameFormat, Media, TimestampedDataFrame};

#[derive(Parser, Debug)]
#[command(
    name = "canmedia",
    version,
    about = "CAN media layer CLI",
    disable_help_subcommand = true
)]
struct Cli {
    /// Transmit deadline in milliseconds
    #[arg(long, default_value_t = 1000u64, global = true)]
    deadline_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Backend {
    /// Pick by device name: `mock*` uses a virtual bus, serial paths and COM
    /// ports use SLCAN, others SocketCAN
    Auto,
    Mock,
    Slcan,
    Socketcan,
}

impl Backend {
    /// Settle `Auto` for the names only the CLI knows about.
    fn resolve(self, device: &str) -> Backend {
        match self {
            Backend::Auto if device.starts_with("mock") => Backend::Mock,
            other => other,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available CAN interfaces
    List {
        /// Backend to query (auto lists every compiled backend)
        #[arg(long, value_enum, default_value_t = Backend::Auto)]
        backend: Backend,
    },
    /// Sniff frames from a CAN interface
    Sniff {
        /// Interface name (e.g., can0, /dev/ttyACM0)
        #[arg(long, default_value = "mock0")]
        device: String,
        /// Number of frames to read before exiting
        #[arg(long, default_value_t = 10)]
        count: u32,
        /// Give up after this many milliseconds without a frame
        #[arg(long, default_value_t = 2000u64)]
        idle_ms: u64,
        #[arg(long, value_enum, default_value_t = Backend::Auto)]
        backend: Backend,
        /// Bitrate for SLCAN (only when backend=slcan)
        #[arg(long, value_enum)]
        bitrate: Option<Bitrate>,
        /// Acceptance filters as ID/MASK[:base|ext] in hex; none means promiscuous
        #[arg(long = "filter")]
        filters: Vec<String>,
        /// Write frames to .srlog (NDJSON) file
        #[arg(long)]
        to: Option<String>,
    },
    /// Send a CAN frame
    Send {
        #[arg(long, default_value = "mock0")]
        device: String,
        /// CAN ID in hex (e.g., 0x123)
        #[arg(long)]
        id: String,
        /// Data bytes as hex, space-separated (e.g., "01 02 03")
        #[arg(long, value_delimiter = ' ')]
        data: Vec<String>,
        /// Force a 29-bit identifier even when the value fits 11 bits
        #[arg(long, action = ArgAction::SetTrue)]
        extended: bool,
        #[arg(long, value_enum, default_value_t = Backend::Auto)]
        backend: Backend,
        #[arg(long, value_enum)]
        bitrate: Option<Bitrate>,
    },
    /// Validate a CAN device by opening it, sending a probe frame and listening briefly
    Doctor {
        /// Device path or name (e.g., /dev/tty.usbserial-0001 or can0)
        #[arg(long, default_value = "mock0")]
        device: String,
        #[arg(long, value_enum, default_value_t = Backend::Auto)]
        backend: Backend,
        #[arg(long, value_enum)]
        bitrate: Option<Bitrate>,
        /// Probe CAN ID in hex (e.g., 0x123)
        #[arg(long, default_value = "0x123")]
        id: String,
        /// Probe data bytes as hex
        #[arg(long, value_delimiter = ' ', default_values_t = vec!["00".to_string(), "00".to_string()])]
        data: Vec<String>,
        /// Milliseconds to listen for a frame after send (0 to skip)
        #[arg(long, default_value_t = 300u32)]
        recv_ms: u32,
    },
    /// Replay an .srlog file onto a CAN interface
    Replay {
        /// Path of the .srlog file
        #[arg(long)]
        path: String,
        #[arg(long, default_value = "mock0")]
        device: String,
        #[arg(long, value_enum, default_value_t = Backend::Auto)]
        backend: Backend,
        #[arg(long, value_enum)]
        bitrate: Option<Bitrate>,
        /// Honour the recorded inter-frame gaps
        #[arg(long, action = ArgAction::SetTrue)]
        realtime: bool,
    },
    /// Exercise loopback, filtering and fault injection on a virtual bus
    Selftest,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();
    let deadline = Duration::from_millis(cli.deadline_ms);

    match cli.command {
        Commands::List { backend } => can_list_backend(backend),
        Commands::Sniff {
            device,
            count,
            idle_ms,
            backend,
            bitrate,
            filters,
            to,
        } => {
            can_sniff_backend(
                backend,
                &device,
                count,
                Duration::from_millis(idle_ms),
                bitrate,
                &filters,
                to.as_deref(),
                deadline,
            )
            .await
        }
        Commands::Send {
            device,
            id,
            data,
            extended,
            backend,
            bitrate,
        } => can_send_backend(backend, &device, &id, &data, extended, bitrate, deadline).await,
        Commands::Doctor {
            device,
            backend,
            bitrate,
            id,
            data,
            recv_ms,
        } => can_doctor_backend(backend, &device, &id, &data, bitrate, recv_ms, deadline).await,
        Commands::Replay {
            path,
            device,
            backend,
            bitrate,
            realtime,
        } => can_replay(&path, backend, &device, bitrate, realtime, deadline).await,
        Commands::Selftest => selftest(deadline).await,
    }
}

fn setup_tracing() {
    // Best-effort; avoid panics if already set
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// An opened adapter. Mock adapters keep their virtual bus alongside.
struct Opened {
    media: Box<dyn Media>,
    bus: Option<can::VirtualBus>,
}

fn open_backend(backend: Backend, device: &str, bitrate: Option<Bitrate>) -> Result<Opened> {
    let media: Box<dyn Media> = match backend.resolve(device) {
        Backend::Auto => can::open_media(device)?,
        Backend::Mock => {
            let bus = can::VirtualBus::new();
            let media = can::MockMedia::new(&bus, 8, 4)?;
            return Ok(Opened {
                media: Box::new(media),
                bus: Some(bus),
            });
        }
        Backend::Slcan => open_slcan(device, bitrate)?,
        Backend::Socketcan => open_socketcan(device)?,
    };
    info!(device, iface = media.interface_name(), "media opened");
    Ok(Opened { media, bus: None })
}

#[cfg(feature = "slcan")]
fn open_slcan(device: &str, bitrate: Option<Bitrate>) -> Result<Box<dyn Media>> {
    let mut config = can::SlcanConfig::default();
    if let Some(b) = bitrate {
        config.bitrate = b.into_transport();
    }
    Ok(Box::new(can::SlcanMedia::open(device, config)?))
}

#[cfg(not(feature = "slcan"))]
fn open_slcan(_device: &str, _bitrate: Option<Bitrate>) -> Result<Box<dyn Media>> {
    bail!("built without the slcan feature")
}

#[cfg(all(feature = "socketcan", target_os = "linux"))]
fn open_socketcan(device: &str) -> Result<Box<dyn Media>> {
    Ok(Box::new(can::SocketCanMedia::open(
        device,
        can::SocketCanConfig::default(),
    )?))
}

#[cfg(not(all(feature = "socketcan", target_os = "linux")))]
fn open_socketcan(_device: &str) -> Result<Box<dyn Media>> {
    bail!("built without the socketcan feature")
}

fn can_list_backend(backend: Backend) -> Result<()> {
    if matches!(backend, Backend::Mock | Backend::Auto) {
        for name in can::MockMedia::list_available_interface_names()? {
            println!("{name}\tmock");
        }
    }
    #[cfg(feature = "slcan")]
    if matches!(backend, Backend::Slcan | Backend::Auto) {
        for bus in can::SlcanMedia::list_buses()? {
            println!("{}\t{}", bus.name, bus.driver);
        }
    }
    #[cfg(all(feature = "socketcan", target_os = "linux"))]
    if matches!(backend, Backend::Socketcan | Backend::Auto) {
        for bus in can::SocketCanMedia::list_buses()? {
            println!("{}\t{}", bus.name, bus.driver);
        }
    }
    Ok(())
}

/// Start `media` with a handler that forwards every frame into a channel.
fn start_collecting(media: &mut dyn Media) -> Result<mpsc::Receiver<TimestampedDataFrame>> {
    let (tx, rx) = mpsc::channel();
    media.start(
        Box::new(move |frames: Vec<TimestampedDataFrame>| {
            for f in frames {
                // Receiver gone means we are shutting down
                let _ = tx.send(f);
            }
        }),
        false,
    )?;
    Ok(rx)
}

/// Fit the requested filters into the adapter's bank, merging if needed.
fn configure_filters(media: &mut dyn Media, specs: &[String]) -> Result<()> {
    let mut filters = specs
        .iter()
        .map(|s| parse_filter(s))
        .collect::<Result<Vec<_>>>()?;
    if filters.is_empty() {
        filters.push(FilterConfiguration::new_promiscuous(None));
    }
    let slots = media.number_of_acceptance_filters();
    if filters.len() > slots {
        let merged = can::optimize_filter_configurations(&filters, slots)?;
        warn!(
            requested = filters.len(),
            slots,
            "more filters than acceptance slots, merged"
        );
        filters = merged;
    }
    for f in &filters {
        info!(filter = %f, "acceptance filter");
    }
    media.configure_acceptance_filters(&filters)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn can_sniff_backend(
    backend: Backend,
    device: &str,
    count: u32,
    idle: Duration,
    bitrate: Option<Bitrate>,
    filters: &[String],
    to: Option<&str>,
    deadline: Duration,
) -> Result<()> {
    let mut writer = match to {
        Some(path) => {
            let file = File::create(path)?;
            let mut w = BufWriter::new(file);
            let header = srlog_header_line(backend, device, bitrate);
            w.write_all(header.as_bytes())?;
            w.write_all(b"\n")?;
            Some(w)
        }
        None => None,
    };

    let Opened { mut media, bus } = open_backend(backend, device, bitrate)?;
    let rx = start_collecting(media.as_mut())?;
    configure_filters(media.as_mut(), filters)?;

    // A virtual bus is silent on its own; attach a peer emitting heartbeats
    if let Some(bus) = &bus {
        let mut heartbeat = can::MockMedia::new(bus, 8, 1)?;
        heartbeat.start(Box::new(|_frames: Vec<TimestampedDataFrame>| {}), false)?;
        let frame = can::DataFrame::new(0x700, vec![0x00, 0x00, 0x00, 0x00], FrameFormat::Base, false)?;
        for _ in 0..count {
            heartbeat
                .send_until(std::slice::from_ref(&frame), Instant::now() + deadline)
                .await?;
        }
        heartbeat.close()?;
    }

    for _ in 0..count {
        match rx.recv_timeout(idle) {
            Ok(frame) => {
                print_frame(&frame);
                if let Some(w) = writer.as_mut() {
                    w.write_all(srlog_record_line(&frame).as_bytes())?;
                    w.write_all(b"\n")?;
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(device, idle_ms = idle.as_millis() as u64, "no frame received, stopping");
                break;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    if let Some(w) = writer.as_mut() {
        w.flush()?;
    }
    media.close()?;
    Ok(())
}

async fn can_send_backend(
    backend: Backend,
    device: &str,
    id_str: &str,
    data_hex: &[String],
    extended: bool,
    bitrate: Option<Bitrate>,
    deadline: Duration,
) -> Result<()> {
    let frame = build_frame(id_str, data_hex, extended, false)?;
    let Opened { mut media, .. } = open_backend(backend, device, bitrate)?;
    media.start(Box::new(|_frames: Vec<TimestampedDataFrame>| {}), false)?;
    let sent = media
        .send_until(std::slice::from_ref(&frame), Instant::now() + deadline)
        .await?;
    if sent == 0 {
        warn!(device, "deadline expired before the frame went out");
    } else {
        info!(device, frame = %frame, "sent frame");
    }
    media.close()?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn can_doctor_backend(
    backend: Backend,
    device: &str,
    id_str: &str,
    data_hex: &[String],
    bitrate: Option<Bitrate>,
    recv_ms: u32,
    deadline: Duration,
) -> Result<()> {
    let frame = build_frame(id_str, data_hex, false, false)?;
    println!(
        "doctor: backend={backend:?} device={device} bitrate={}",
        bitrate.map(|b| b.as_str()).unwrap_or("default")
    );
    let Opened { mut media, .. } = open_backend(backend, device, bitrate)?;
    println!(
        "open: ok ({}, mtu={}, filters={})",
        media.interface_name(),
        media.mtu(),
        media.number_of_acceptance_filters()
    );
    let rx = start_collecting(media.as_mut())?;
    media.configure_acceptance_filters(&[FilterConfiguration::new_promiscuous(None)])?;
    let sent = media
        .send_until(std::slice::from_ref(&frame), Instant::now() + deadline)
        .await?;
    println!("send: {sent}/1 ({} bytes)", frame.data().len());
    if recv_ms > 0 {
        match rx.recv_timeout(Duration::from_millis(u64::from(recv_ms))) {
            Ok(f) => {
                print!("recv: ");
                print_frame(&f);
            }
            Err(e) => eprintln!("recv: no frame within {recv_ms} ms ({e})"),
        }
    }
    media.close()?;
    println!("doctor: done");
    Ok(())
}

async fn can_replay(
    path: &str,
    backend: Backend,
    device: &str,
    bitrate: Option<Bitrate>,
    realtime: bool,
    deadline: Duration,
) -> Result<()> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut first = String::new();
    let _ = reader.read_line(&mut first)?;
    let header: SrlogHeader = match serde_json::from_str(&first) {
        Ok(h) => h,
        Err(e) => bail!("invalid srlog header: {e}"),
    };
    println!(
        "replay: {path} recorded on {} ({}) -> {device} realtime={realtime}",
        header.device, header.backend
    );

    let Opened { mut media, .. } = open_backend(backend, device, bitrate)?;
    media.start(Box::new(|_frames: Vec<TimestampedDataFrame>| {}), false)?;

    let mut prev_ts: Option<time::OffsetDateTime> = None;
    let mut total = 0usize;
    let mut skipped = 0usize;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let rec: SrlogRecord = serde_json::from_str(&line)?;
        if realtime {
            let ts = time::OffsetDateTime::parse(&rec.ts, &time::format_description::well_known::Rfc3339).ok();
            if let (Some(prev), Some(now)) = (prev_ts, ts) {
                if let Ok(gap) = Duration::try_from(now - prev) {
                    tokio::time::sleep(gap).await;
                }
            }
            prev_ts = ts.or(prev_ts);
        }
        let Some(frame) = replayable_frame(&rec)? else {
            warn!(id = %rec.id, ts = %rec.ts, "skipping zero-length record");
            skipped += 1;
            continue;
        };
        total += media
            .send_until(std::slice::from_ref(&frame), Instant::now() + deadline)
            .await?;
    }
    media.close()?;
    println!("replay: sent {total} frames, skipped {skipped}");
    Ok(())
}

/// Walk two peers on a virtual bus through loopback, filtering, fault
/// injection and shutdown, printing each observation.
async fn selftest(deadline: Duration) -> Result<()> {
    let bus = can::VirtualBus::new();
    let mut me = can::MockMedia::new(&bus, 64, 3)?;
    let mut pe = can::MockMedia::new(&bus, 8, 1)?;
    let me_sink = can::FrameSink::new();
    let pe_sink = can::FrameSink::new();
    me.start(me_sink.handler(), false)?;
    pe.start(pe_sink.handler(), false)?;
    println!("selftest: {me} and {pe} on one bus");

    let batch = [
        can::DataFrame::new(123, b"abc".to_vec(), FrameFormat::Extended, false)?,
        can::DataFrame::new(123, b"def".to_vec(), FrameFormat::Extended, true)?,
    ];
    me.configure_acceptance_filters(&[FilterConfiguration::new_promiscuous(None)])?;
    me.send_until(&batch, Instant::now() + deadline).await?;
    check("peer with default filters hears nothing", pe_sink.is_empty())?;
    let own = me_sink.pop()?;
    check("sender sees only its loopback frame", own.loopback() && me_sink.is_empty())?;

    pe.configure_acceptance_filters(&[FilterConfiguration::new(123, 127, None)?])?;
    me.send_until(&batch, Instant::now() + deadline).await?;
    let first = pe_sink.pop()?;
    let second = pe_sink.pop()?;
    check(
        "peer receives both frames in order, never as loopback",
        first.data() == b"abc" && second.data() == b"def" && !first.loopback() && !second.loopback(),
    )?;

    me.raise_on_send_once(can::MediaError::Driver("injected".into()));
    let failed = me.send_until(&batch, Instant::now() + deadline).await;
    check("injected fault surfaces once", failed.is_err() && pe_sink.is_empty())?;
    let sent = me.send_until(&batch, Instant::now() + deadline).await?;
    check("next send succeeds", sent == batch.len())?;

    me.close()?;
    check("closed adapter leaves the bus", !bus.contains(&me) && bus.contains(&pe))?;
    check(
        "closed adapter rejects I/O",
        me.send_until(&batch, Instant::now() + deadline).await == Err(can::MediaError::ResourceClosed),
    )?;
    pe.close()?;
    println!("selftest: ok");
    Ok(())
}

fn check(what: &str, ok: bool) -> Result<()> {
    if ok {
        println!("  ok   {what}");
        Ok(())
    } else {
        println!("  FAIL {what}");
        bail!("selftest failed: {what}")
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Bitrate {
    #[value(name = "10k")]
    B10k,
    #[value(name = "20k")]
    B20k,
    #[value(name = "50k")]
    B50k,
    #[value(name = "100k")]
    B100k,
    #[value(name = "125k")]
    B125k,
    #[value(name = "250k")]
    B250k,
    #[value(name = "500k")]
    B500k,
    #[value(name = "800k")]
    B800k,
    #[value(name = "1m")]
    B1M,
}

impl Bitrate {
    #[cfg(feature = "slcan")]
    fn into_transport(self) -> can::SlcanBitrate {
        match self {
            Bitrate::B10k => can::SlcanBitrate::B10k,
            Bitrate::B20k => can::SlcanBitrate::B20k,
            Bitrate::B50k => can::SlcanBitrate::B50k,
            Bitrate::B100k => can::SlcanBitrate::B100k,
            Bitrate::B125k => can::SlcanBitrate::B125k,
            Bitrate::B250k => can::SlcanBitrate::B250k,
            Bitrate::B500k => can::SlcanBitrate::B500k,
            Bitrate::B800k => can::SlcanBitrate::B800k,
            Bitrate::B1M => can::SlcanBitrate::B1M,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Bitrate::B10k => "10k",
            Bitrate::B20k => "20k",
            Bitrate::B50k => "50k",
            Bitrate::B100k => "100k",
            Bitrate::B125k => "125k",
            Bitrate::B250k => "250k",
            Bitrate::B500k => "500k",
            Bitrate::B800k => "800k",
            Bitrate::B1M => "1m",
        }
    }
}

fn parse_hex_u32(s: &str) -> Option<u32> {
    let t = s.trim();
    let no_prefix = t.strip_prefix("0x").unwrap_or(t);
    u32::from_str_radix(no_prefix, 16).ok()
}

fn parse_id(s: &str, extended: bool) -> Option<(u32, FrameFormat)> {
    let parsed = parse_hex_u32(s)?;
    if parsed <= FrameFormat::Base.max_identifier() && !extended {
        Some((parsed, FrameFormat::Base))
    } else if parsed <= FrameFormat::Extended.max_identifier() {
        Some((parsed, FrameFormat::Extended))
    } else {
        None
    }
}

fn parse_hex_bytes(items: &[String]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(items.len());
    for s in items {
        let t = s.trim();
        let no_prefix = t.strip_prefix("0x").unwrap_or(t);
        let b = u8::from_str_radix(no_prefix, 16)
            .map_err(|e| anyhow::anyhow!("invalid hex byte '{t}': {e}"))?;
        out.push(b);
    }
    Ok(out)
}

/// `ID/MASK[:base|ext]`, both hex.
fn parse_filter(s: &str) -> Result<FilterConfiguration> {
    let (body, format) = match s.rsplit_once(':') {
        Some((body, "base")) => (body, Some(FrameFormat::Base)),
        Some((body, "ext")) => (body, Some(FrameFormat::Extended)),
        Some((_, other)) => bail!("unknown frame format '{other}' in filter '{s}'"),
        None => (s, None),
    };
    let (id, mask) = body
        .split_once('/')
        .ok_or_else(|| anyhow::anyhow!("filter '{s}' is not ID/MASK"))?;
    let id = parse_hex_u32(id).ok_or_else(|| anyhow::anyhow!("invalid filter id in '{s}'"))?;
    let mask = parse_hex_u32(mask).ok_or_else(|| anyhow::anyhow!("invalid filter mask in '{s}'"))?;
    Ok(FilterConfiguration::new(id, mask, format)?)
}

fn build_frame(id_str: &str, data_hex: &[String], extended: bool, loopback: bool) -> Result<can::DataFrame> {
    let (id, format) =
        parse_id(id_str, extended).ok_or_else(|| anyhow::anyhow!("invalid CAN id: {id_str}"))?;
    let bytes = parse_hex_bytes(data_hex)?;
    Ok(can::DataFrame::new(id, bytes, format, loopback)?)
}

fn format_ts(f: &TimestampedDataFrame) -> String {
    f.timestamp
        .system
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "".into())
}

fn print_frame(f: &TimestampedDataFrame) {
    println!(
        "{frame}\tlen={len}\t{ts}",
        frame = f,
        len = f.data().len(),
        ts = format_ts(f)
    );
}

fn srlog_header_line(backend: Backend, device: &str, bitrate: Option<Bitrate>) -> String {
    let header = SrlogHeader {
        format: "srlog".to_string(),
        version: 1,
        backend: format!("{backend:?}"),
        device: device.to_string(),
        bitrate: bitrate.map(|b| b.as_str().to_string()),
    };
    serde_json::to_string(&header).unwrap_or_else(|_| "{}".to_string())
}

fn srlog_record_line(f: &TimestampedDataFrame) -> String {
    let mut data_hex = String::new();
    for b in f.data() {
        let _ = core::fmt::Write::write_fmt(&mut data_hex, format_args!("{b:02X}"));
    }
    let id = match f.format() {
        FrameFormat::Base => format!("0x{:03X}", f.identifier()),
        FrameFormat::Extended => format!("0x{:08X}", f.identifier()),
    };
    let rec = SrlogRecord {
        ts: format_ts(f),
        id,
        ext: f.format() == FrameFormat::Extended,
        len: f.data().len(),
        data: data_hex,
    };
    serde_json::to_string(&rec).unwrap_or_else(|_| "{}".to_string())
}

fn record_to_frame(rec: &SrlogRecord) -> Result<can::DataFrame> {
    let id = parse_hex_u32(&rec.id).ok_or_else(|| anyhow::anyhow!("invalid id {}", rec.id))?;
    let format = if rec.ext {
        FrameFormat::Extended
    } else {
        FrameFormat::Base
    };
    let bytes = (0..rec.data.len())
        .step_by(2)
        .map(|i| {
            rec.data
                .get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| anyhow::anyhow!("invalid data '{}'", rec.data))
        })
        .collect::<Result<Vec<u8>>>()?;
    if bytes.len() != rec.len {
        bail!("record length {} does not match data '{}'", rec.len, rec.data);
    }
    Ok(can::DataFrame::new(id, bytes, format, false)?)
}

/// Zero-length frames can be captured but never transmitted.
fn replayable_frame(rec: &SrlogRecord) -> Result<Option<can::DataFrame>> {
    if rec.len == 0 {
        return Ok(None);
    }
    record_to_frame(rec).map(Some)
}

#[derive(Serialize, Deserialize)]
struct SrlogHeader {
    format: String,
    version: u32,
    backend: String,
    device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    bitrate: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct SrlogRecord {
    ts: String,
    id: String,
    ext: bool,
    len: usize,
    data: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filter() {
        let f = parse_filter("7B/7F").unwrap();
        assert_eq!((f.identifier, f.mask, f.format), (0x7B, 0x7F, None));
        let f = parse_filter("0x100/0x7FF:base").unwrap();
        assert_eq!(f.format, Some(FrameFormat::Base));
        assert!(parse_filter("100").is_err());
        assert!(parse_filter("100/7FF:fd").is_err());
        assert!(parse_filter("800/0:base").is_err());
    }

    #[test]
    fn test_parse_id_format() {
        assert_eq!(parse_id("0x123", false), Some((0x123, FrameFormat::Base)));
        assert_eq!(parse_id("0x123", true), Some((0x123, FrameFormat::Extended)));
        assert_eq!(parse_id("800", false), Some((0x800, FrameFormat::Extended)));
        assert_eq!(parse_id("20000000", false), None);
    }

    #[test]
    fn test_srlog_record_roundtrip_fields() {
        let frame = can::DataFrame::new(0x1ABCDEF, vec![1, 0xFF], FrameFormat::Extended, false).unwrap();
        let rx = TimestampedDataFrame::received(&frame, false, can::Timestamp::now());
        let rec: SrlogRecord = serde_json::from_str(&srlog_record_line(&rx)).unwrap();
        assert_eq!(rec.id, "0x01ABCDEF");
        assert!(rec.ext);
        assert_eq!(rec.data, "01FF");
        assert_eq!(record_to_frame(&rec).unwrap(), frame);
    }

    #[test]
    fn test_auto_backend_picks_mock_for_mock_devices() {
        assert_eq!(Backend::Auto.resolve("mock0"), Backend::Mock);
        assert_eq!(Backend::Auto.resolve("can0"), Backend::Auto);
        assert_eq!(Backend::Slcan.resolve("mock0"), Backend::Slcan);
        let opened = open_backend(Backend::Auto, "mock0", None).unwrap();
        assert!(opened.bus.is_some());
    }

    #[test]
    fn test_zero_length_records_are_not_replayed() {
        let empty: SrlogRecord = serde_json::from_str(
            r#"{"ts":"2024-01-01T00:00:00Z","id":"0x123","ext":false,"len":0,"data":""}"#,
        )
        .unwrap();
        assert!(replayable_frame(&empty).unwrap().is_none());

        let one: SrlogRecord = serde_json::from_str(
            r#"{"ts":"2024-01-01T00:00:00Z","id":"0x123","ext":false,"len":1,"data":"AB"}"#,
        )
        .unwrap();
        let frame = replayable_frame(&one).unwrap().unwrap();
        assert_eq!(frame.data(), &[0xAB]);
    }

    #[tokio::test]
    async fn test_selftest_passes() {
        selftest(Duration::from_millis(100)).await.unwrap();
    }
}
