use crate::{Media, Result};

/// Which backend family a device name belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BackendKind {
    /// Serial-line adapter speaking SLCAN (`COM9`, `\\.\COM12`, `/dev/ttyACM0`).
    Slcan,
    /// Kernel CAN socket (`can0`, `vcan1`).
    SocketCan,
}

impl BackendKind {
    pub fn for_device(device_name: &str) -> Self {
        let windows_com_port = device_name
            .replace(['\\', '.'], "")
            .to_lowercase()
            .starts_with("com");
        let unix_tty = device_name.starts_with("/dev/");
        if windows_com_port || unix_tty {
            BackendKind::Slcan
        } else {
            BackendKind::SocketCan
        }
    }
}

/// Open the backend matching `device_name` with default settings.
pub fn open_media(device_name: &str) -> Result<Box<dyn Media>> {
    let kind = BackendKind::for_device(device_name);
    tracing::debug!(device_name, ?kind, "selecting media backend");
    match kind {
        BackendKind::Slcan => open_slcan(device_name),
        BackendKind::SocketCan => open_socketcan(device_name),
    }
}

#[cfg(feature = "slcan")]
fn open_slcan(device_name: &str) -> Result<Box<dyn Media>> {
    let media = crate::SlcanMedia::open(device_name, crate::SlcanConfig::default())?;
    Ok(Box::new(media))
}

#[cfg(not(feature = "slcan"))]
fn open_slcan(_device_name: &str) -> Result<Box<dyn Media>> {
    Err(crate::MediaError::Unsupported("slcan backend not compiled in"))
}

#[cfg(all(feature = "socketcan", target_os = "linux"))]
fn open_socketcan(device_name: &str) -> Result<Box<dyn Media>> {
    let media = crate::SocketCanMedia::open(device_name, crate::SocketCanConfig::default())?;
    Ok(Box::new(media))
}

#[cfg(not(all(feature = "socketcan", target_os = "linux")))]
fn open_socketcan(_device_name: &str) -> Result<Box<dyn Media>> {
    Err(crate::MediaError::Unsupported(
        "socketcan backend not compiled in",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_names_select_slcan() {
        for name in ["COM9", "com1", "\\\\.\\COM12", "/dev/ttyACM0", "/dev/tty.usbserial-0001"] {
            assert_eq!(BackendKind::for_device(name), BackendKind::Slcan, "{name}");
        }
    }

    #[test]
    fn test_other_names_select_socketcan() {
        for name in ["can0", "vcan1", "slcan0", "dev/ttyACM0", ""] {
            assert_eq!(BackendKind::for_device(name), BackendKind::SocketCan, "{name}");
        }
    }

    #[cfg(not(all(feature = "socketcan", target_os = "linux")))]
    #[test]
    fn test_missing_backend_is_unsupported() {
        assert!(matches!(
            open_media("can0"),
            Err(crate::MediaError::Unsupported(_))
        ));
    }
}
