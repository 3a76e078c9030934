//! Definition of DeviceError used by the discovery and mount code.

/// A device discovery or host mount error.
pub(crate) struct DeviceError {
    pub(crate) message: String,
    pub(crate) source: DeviceErrorSource,
}

/// Possible device error kind sources.
pub(crate) enum DeviceErrorSource {
    None,
    StdIoError(std::io::Error),
    StdIntParseError(std::num::ParseIntError),
    NixError(nix::Error),
}

impl DeviceError {
    /// Return a new `Self` with the given message.
    pub(crate) fn new(message: &str) -> DeviceError {
        DeviceError {
            message: String::from(message),
            source: DeviceErrorSource::None,
        }
    }
}

impl std::fmt::Debug for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DeviceError {}

impl From<std::io::Error> for DeviceError {
    fn from(error: std::io::Error) -> DeviceError {
        DeviceError {
            message: format!("{error}"),
            source: DeviceErrorSource::StdIoError(error),
        }
    }
}

impl From<std::num::ParseIntError> for DeviceError {
    fn from(error: std::num::ParseIntError) -> DeviceError {
        DeviceError {
            message: format!("{error}"),
            source: DeviceErrorSource::StdIntParseError(error),
        }
    }
}

impl From<nix::Error> for DeviceError {
    fn from(error: nix::Error) -> DeviceError {
        DeviceError {
            message: format!("{error}"),
            source: DeviceErrorSource::NixError(error),
        }
    }
}

impl From<String> for DeviceError {
    fn from(message: String) -> DeviceError {
        DeviceError {
            message,
            source: DeviceErrorSource::None,
        }
    }
}

impl From<DeviceError> for tonic::Status {
    fn from(dev_error: DeviceError) -> Self {
        match dev_error.source {
            DeviceErrorSource::StdIoError(error)
                if error.kind() == std::io::ErrorKind::NotFound =>
            {
                tonic::Status::not_found(dev_error.message)
            }
            _ => tonic::Status::internal(dev_error.message),
        }
    }
}
