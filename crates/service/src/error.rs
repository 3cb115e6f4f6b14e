use std::fmt;

/// Error kinds surfaced to peers and to local callers.
///
/// The wire form of each kind is its code string; an error reply from a peer
/// is mapped back through [`Error::from_remote`] so both sides observe the
/// same variants.
#[derive(Debug, Clone)]
pub enum Error {
    /// No local factory and no listening client for the requested tuple.
    NotFound(String),
    /// Certificate/address mismatch. Fatal for the command and for the
    /// connection carrying it.
    Verify(String),
    /// The candidate list was empty.
    NoAttemptsMade,
    /// Every candidate failed; carries the underlying failures.
    AttemptsFailed(Vec<String>),
    /// CSR subject malformed.
    BadCertificateRequest(String),
    /// The user/secret pair was rejected.
    NoSuchUser,
    /// Generic local failure.
    Connection(String),
    /// The underlying physical connection is gone.
    ConnectionLost,
    Codec(String),
    Io(String),
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::Verify(_) => "VerifyError",
            Self::NoAttemptsMade => "NoAttemptsMade",
            Self::AttemptsFailed(_) => "AttemptsFailed",
            Self::BadCertificateRequest(_) => "BadCertificateRequest",
            Self::NoSuchUser => "NoSuchUser",
            Self::Connection(_) | Self::Codec(_) | Self::Io(_) => "ConnectionError",
            Self::ConnectionLost => "ConnectionLost",
        }
    }

    /// Whether transmitting this error must also terminate the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Verify(_))
    }

    pub fn description(&self) -> String {
        match self {
            Self::NotFound(what) => what.clone(),
            Self::Verify(why) => why.clone(),
            Self::NoAttemptsMade => "there was no available connection path".to_string(),
            Self::AttemptsFailed(reasons) => reasons.join("; "),
            Self::BadCertificateRequest(why) => why.clone(),
            Self::NoSuchUser => "no such user".to_string(),
            Self::Connection(why) | Self::Codec(why) | Self::Io(why) => why.clone(),
            Self::ConnectionLost => "connection lost".to_string(),
        }
    }

    /// Rebuild an error from the code and description of an error reply.
    pub fn from_remote(code: &str, description: &str) -> Self {
        match code {
            "NotFound" => Self::NotFound(description.to_string()),
            "VerifyError" => Self::Verify(description.to_string()),
            "NoAttemptsMade" => Self::NoAttemptsMade,
            "AttemptsFailed" => {
                Self::AttemptsFailed(description.split("; ").map(str::to_string).collect())
            }
            "BadCertificateRequest" => Self::BadCertificateRequest(description.to_string()),
            "NoSuchUser" => Self::NoSuchUser,
            "ConnectionLost" => Self::ConnectionLost,
            _ => Self::Connection(format!("{}: {}", code, description)),
        }
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.description())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<codec::Error> for Error {
    fn from(value: codec::Error) -> Self {
        Self::Codec(value.to_string())
    }
}
