use core::fmt;

/// Error values surfaced by the builder, its collaborators, and passes.
///
/// There is no exception-like control flow anywhere in the crate: every
/// fallible operation returns `Result<_, Error>`, and the builder
/// additionally latches the first error it sees (see [`Builder::error`]).
///
/// [`Builder::error`]: crate::Builder::error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An arena refused an allocation (its configured byte limit was hit).
    NoHeapMemory,
    /// A label id outside the code-holder's issued range, or a bind of an
    /// invalid label.
    InvalidLabel,
    /// A label name was registered twice with the code-holder.
    LabelAlreadyDefined,
    /// API misuse that is detectable at runtime (deleting an unknown pass,
    /// an empty label name, a bad const-pool entry size).
    InvalidArgument,
    /// An operation that is not legal in the current state.
    InvalidState,
    /// The strict validator rejected an instruction before it was recorded.
    InvalidInstruction,
    /// An operation that needs an attached code-holder ran while detached.
    NotInitialized,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoHeapMemory => write!(f, "arena allocation failed"),
            Error::InvalidLabel => write!(f, "invalid label"),
            Error::LabelAlreadyDefined => write!(f, "label already defined"),
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::InvalidState => write!(f, "invalid state"),
            Error::InvalidInstruction => write!(f, "invalid instruction"),
            Error::NotInitialized => write!(f, "no code holder attached"),
        }
    }
}

impl std::error::Error for Error {}
