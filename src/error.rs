use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// Malformed SQL, manifest, or version string.
    Parse(String),
    /// Bad input that leaves no state change: malformed extension names,
    /// duplicate installs, unknown types, in-use uninstalls, lock timeouts.
    Validation(String),
    /// Internal inconsistency: failed index probes, schema drift, broken
    /// invariants. The statement fails and staged operations are rolled back.
    Integrity(String),
    /// Failure reported across the extension ABI: register returned an error,
    /// encode/decode signalled failure, a VDF reported a statement error.
    Abi(String),
    /// dlopen, allocation, or file-system failure.
    Resource(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Parse(msg) => write!(f, "Parse error: {}", msg),
            Error::Validation(msg) => write!(f, "{}", msg),
            Error::Integrity(msg) => write!(f, "Integrity error: {}", msg),
            Error::Abi(msg) => write!(f, "Extension ABI error: {}", msg),
            Error::Resource(msg) => write!(f, "Resource error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}
