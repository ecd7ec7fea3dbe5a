//! can-media: the media boundary of a CAN transport
//!
//! This crate defines the [`Media`] contract every CAN adapter implements for a
//! transfer protocol: deadline-bound transmission, callback-driven reception and
//! a fixed bank of acceptance filters. Backends are feature-gated; the default
//! build enables a `mock` virtual bus so protocol code can be tested on any host.

mod types;
pub use types::{
    dlc_to_length, length_to_dlc, required_padding, BusInfo, DataFrame, FrameFormat, Timestamp,
    TimestampedDataFrame, MAX_DATA_LENGTH, VALID_MTU_SET,
};

mod error;
pub use error::{MediaError, Result};

mod filter;
pub use filter::{accepts, optimize_filter_configurations, FilterBank, FilterConfiguration};

mod traits;
pub use traits::{validate_transmission, Lifecycle, Media, MediaState, ReceivedFramesHandler};

mod inbox;

mod select;
pub use select::{open_media, BackendKind};

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::{MockMedia, VirtualBus};

#[cfg(feature = "mock")]
mod sink;

#[cfg(feature = "mock")]
pub use sink::FrameSink;

#[cfg(feature = "slcan")]
mod slcan;

#[cfg(feature = "slcan")]
pub use slcan::{SlcanBitrate, SlcanConfig, SlcanMedia};

#[cfg(all(feature = "socketcan", target_os = "linux"))]
mod socket;

#[cfg(all(feature = "socketcan", target_os = "linux"))]
pub use socket::{SocketCanConfig, SocketCanMedia};

/// Lock ignoring poisoning: a panicking handler must not wedge the bus.
pub(crate) fn lock<T>(m: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
