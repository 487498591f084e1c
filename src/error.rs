
use std::error;
use std::fmt;
use std::io;


/// Reason why the peripheral registers or DMA memory could not be accessed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessError {
    AlreadyMapped,
    PermissionDenied,
    DeviceNotFound,
    UnsupportedPlatform,
    OutOfMemory,
    OtherDeviceError,
}

impl AccessError {
    fn description(&self) -> &str {
        match *self {
            AccessError::AlreadyMapped => "peripherals already mapped by this process",
            AccessError::PermissionDenied => "permission denied",
            AccessError::DeviceNotFound => "device not found",
            AccessError::UnsupportedPlatform => "unsupported platform",
            AccessError::OutOfMemory => "DMA memory could not be allocated",
            AccessError::OtherDeviceError => "other device error",
        }
    }
}


/// DMA PWM engine error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Cycle or step time rejected, or no integer clock divider exists for the step.
    InvalidTiming { cycle_time_us: u32, step_time_us: u32 },
    /// DMA channel index not usable on this host.
    InvalidChannel(u8),
    InvalidPin(u8),
    InvalidWidth { width_us: u32, cycle_time_us: u32 },
    InvalidLevel(i32),
    ChannelBusy(u8),
    ChannelNotActive(u8),
    PinNotRegistered(u8),
    /// The pacing peripheral already runs at another step time for another channel.
    PacingInUse { step_time_us: u32, owner: u8 },
    PeripheralAccess(AccessError),
}

impl Error {
    /// Bad argument values, detected before any hardware is touched.
    pub fn is_validation(&self) -> bool {
        match *self {
            Error::InvalidTiming { .. }
            | Error::InvalidChannel(_)
            | Error::InvalidPin(_)
            | Error::InvalidWidth { .. }
            | Error::InvalidLevel(_) => true,
            _ => false,
        }
    }

    /// Operation not allowed in the current lifecycle state.
    pub fn is_state(&self) -> bool {
        match *self {
            Error::ChannelBusy(_)
            | Error::ChannelNotActive(_)
            | Error::PinNotRegistered(_)
            | Error::PacingInUse { .. } => true,
            _ => false,
        }
    }

    /// Register or memory access failure; usually fatal for the process.
    pub fn is_resource(&self) -> bool {
        match *self {
            Error::PeripheralAccess(_) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::InvalidTiming { cycle_time_us, step_time_us } => write!(
                f,
                "invalid timing: cycle {} us with step {} us",
                cycle_time_us, step_time_us
            ),
            Error::InvalidChannel(ch) => write!(f, "DMA channel {} is not usable", ch),
            Error::InvalidPin(pin) => write!(f, "GPIO {} is not a valid PWM pin", pin),
            Error::InvalidWidth { width_us, cycle_time_us } => write!(
                f,
                "pulse width {} us exceeds cycle time {} us",
                width_us, cycle_time_us
            ),
            Error::InvalidLevel(level) => write!(f, "log level {} out of range", level),
            Error::ChannelBusy(ch) => write!(f, "DMA channel {} is already active", ch),
            Error::ChannelNotActive(ch) => write!(f, "DMA channel {} is not active", ch),
            Error::PinNotRegistered(pin) => write!(f, "GPIO {} is not registered", pin),
            Error::PacingInUse { step_time_us, owner } => write!(
                f,
                "pacing source runs at {} us steps for DMA channel {}",
                step_time_us, owner
            ),
            Error::PeripheralAccess(ref kind) => {
                write!(f, "peripheral access error: {}", kind.description())
            }
        }
    }
}

impl error::Error for Error {}

impl From<AccessError> for Error {
    fn from(kind: AccessError) -> Error {
        Error::PeripheralAccess(kind)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::PeripheralAccess(match err.kind() {
            io::ErrorKind::NotFound => AccessError::DeviceNotFound,
            io::ErrorKind::PermissionDenied => AccessError::PermissionDenied,
            _ => AccessError::OtherDeviceError,
        })
    }
}
