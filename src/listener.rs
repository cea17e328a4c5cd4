use std::io;

use crate::tailer::TailerHandle;

/// Downstream consumer of everything a tailer produces.
///
/// Every callback arrives on the tailer's own thread, in file order; across
/// a rotation, all fully-read lines of the old file land before
/// [`file_rotated`](TailerListener::file_rotated), which in turn lands
/// before any line of the replacement. A panicking callback is not caught:
/// it unwinds out of the tailer's run loop and stops it.
pub trait TailerListener: Send {
    /// Called once during construction with a handle that can stop the
    /// tailer from any thread.
    fn initialize(&mut self, _handle: &TailerHandle) {}

    /// One complete line, excluding its `\n`, `\r`, or `\r\n` terminator.
    /// Bytes are forwarded as read; nothing validates UTF-8 here.
    fn line(&mut self, line: &[u8]);

    /// An open attempt failed because the file does not exist yet.
    fn file_not_found(&mut self) {}

    /// The file at the path was replaced; emitted after the old file is
    /// drained and before the replacement is opened.
    fn file_rotated(&mut self) {}

    /// Unrecoverable failure; the tailer shuts down after delivery.
    fn error(&mut self, _error: &io::Error) {}
}
