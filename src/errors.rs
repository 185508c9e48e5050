use std::fmt::Write as _;
use std::panic::Location;

use thiserror::Error;

/// Broad category of a PsiCash failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    /// The local datastore could not be loaded, even after resetting it.
    #[error("Failed to initialize the local datastore.")]
    Initialization,

    /// Reading from or writing to the local datastore failed.
    #[error("Datastore operation failed.")]
    Datastore,

    /// Malformed JSON or other structured data was encountered at a boundary.
    #[error("Failed to parse data.")]
    Parse,

    /// The injected transport returned nothing, or reported that it could not
    /// complete the exchange. Never retried.
    #[error("Transport failed to complete the request.")]
    Transport,

    /// The server returned a status or body outside the documented vocabulary.
    #[error("Server response violated the protocol.")]
    Protocol,

    /// A caller supplied a value that cannot be used.
    #[error("Invalid argument.")]
    InvalidArgument,

    /// The operation is not allowed for the current user type.
    #[error("Operation not permitted.")]
    NotPermitted,
}

/// One link of an error chain: a message and where it was added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message: String,
    pub location: &'static Location<'static>,
}

/// Error type returned by every fallible PsiCash operation.
///
/// Each frame is pushed by a caller as the error travels up, so the frame list
/// reads like a hand-built stack trace. The first frame is where the error was
/// created.
#[derive(Debug, Clone, Error)]
#[error("{}", render_chain(.kind, .frames))]
pub struct PsiCashError {
    kind: ErrorKind,
    frames: Vec<Frame>,
}

pub type Result<T, E = PsiCashError> = std::result::Result<T, E>;

impl PsiCashError {
    /// Creates a fresh single-frame error at the caller's location.
    #[track_caller]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            frames: vec![Frame {
                message: message.into(),
                location: Location::caller(),
            }],
        }
    }

    /// Adds a frame of context at the caller's location.
    #[track_caller]
    pub fn wrap(mut self, message: impl Into<String>) -> Self {
        self.frames.push(Frame {
            message: message.into(),
            location: Location::caller(),
        });
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Frames, innermost first.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// The message the error was created with.
    pub fn message(&self) -> &str {
        self.frames
            .first()
            .map(|frame| frame.message.as_str())
            .unwrap_or_default()
    }
}

/// Adds `wrap_err` to results carrying a [`PsiCashError`].
pub trait WrapError<T> {
    fn wrap_err(self, message: &str) -> Result<T>;
}

impl<T> WrapError<T> for Result<T> {
    #[track_caller]
    fn wrap_err(self, message: &str) -> Result<T> {
        match self {
            Ok(value) => Ok(value),
            Err(err) => Err(err.wrap(message)),
        }
    }
}

fn render_chain(kind: &ErrorKind, frames: &[Frame]) -> String {
    let mut out = kind.to_string();
    for frame in frames {
        let _ = write!(
            out,
            "\n  {} ({}:{})",
            frame.message,
            frame.location.file(),
            frame.location.line()
        );
    }
    out
}
