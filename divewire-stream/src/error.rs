/// Errors which can arise anywhere in the download stack
///
/// One flat enum is shared by the transport contract, the protocol
/// engines and the device sessions, so that a failure deep inside a
/// ring walk propagates to the caller with `?` and no translation
/// layers in between.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A precondition on an operation's arguments was violated: an
    /// unaligned address, a wrong buffer size, a nonsensical parameter.
    InvalidArgs,

    /// An allocation failed.
    NoMemory,

    /// The transport itself failed: closed port, OS error. Never
    /// retried.
    Io,

    /// A bounded blocking operation exceeded its deadline. Recovered
    /// by retry inside the transfer loop, surfaced once retries are
    /// exhausted.
    Timeout,

    /// A framing, echo, length or checksum check failed.
    Protocol,

    /// On-device bytes are inconsistent: an out-of-range ring pointer,
    /// a bad sentinel.
    DataFormat,

    /// The operation is not provided by this family or transport.
    Unsupported,

    /// The session's cancel flag was observed.
    Cancelled,
}
