/// A summary of a message for logging purposes.
///
/// Wire messages may carry large payloads; logging them in full is rarely
/// useful. Types implementing this trait render a compact, single-line
/// description suitable for `tracing` fields.
pub trait MessageSummary {
    /// Return a brief string representation of the message.
    fn summary(&self) -> String;
}
