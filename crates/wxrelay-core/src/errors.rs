/// Core error type shared by the relay crates.
///
/// Adapter crates (bridge, SMTP, HTTP) map their specific errors into this type
/// so lifecycle and routing code can treat failures uniformly.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),

    #[error("no active session")]
    NotActive,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("delivery failed after {attempts} attempts: {last}")]
    Delivery { attempts: u32, last: String },
}

pub type Result<T> = std::result::Result<T, Error>;
