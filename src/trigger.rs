use std::{
    sync::mpsc::{Receiver, RecvTimeoutError},
    time::Duration,
};

/// Outcome of a single poll-interval wait.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Wait {
    /// The interval elapsed; poll again.
    Elapsed,
    /// A stop was requested while waiting.
    Cancelled,
}

/// The sole designated suspension point of the read and file loops.
///
/// Implementations block the calling thread for a bounded duration and must
/// observe an external stop request, surfacing it as [`Wait::Cancelled`].
pub trait Trigger: Send {
    fn wait(&mut self) -> Wait;
}

/// Default trigger: parks on a shutdown channel for a fixed read interval.
///
/// A message on the channel, or the sending side going away entirely,
/// cancels the wait immediately; otherwise the wait runs out the interval.
pub struct IntervalTrigger {
    interval: Duration,
    shutdown: Receiver<()>,
}

impl IntervalTrigger {
    pub fn new(interval: Duration, shutdown: Receiver<()>) -> IntervalTrigger {
        IntervalTrigger { interval, shutdown }
    }
}

impl Trigger for IntervalTrigger {
    fn wait(&mut self) -> Wait {
        match self.shutdown.recv_timeout(self.interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Wait::Cancelled,
            Err(RecvTimeoutError::Timeout) => Wait::Elapsed,
        }
    }
}

#[cfg(test)]
mod test {
    use std::{sync::mpsc, time::Instant};

    use super::*;

    #[test]
    fn elapses_after_interval() {
        let (_tx, rx) = mpsc::channel();
        let mut trigger = IntervalTrigger::new(Duration::from_millis(10), rx);
        let start = Instant::now();
        assert_eq!(trigger.wait(), Wait::Elapsed);
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn cancels_on_message() {
        let (tx, rx) = mpsc::channel();
        let mut trigger = IntervalTrigger::new(Duration::from_secs(60), rx);
        tx.send(()).unwrap();
        assert_eq!(trigger.wait(), Wait::Cancelled);
    }

    #[test]
    fn cancels_when_sender_is_gone() {
        let (tx, rx) = mpsc::channel::<()>();
        let mut trigger = IntervalTrigger::new(Duration::from_secs(60), rx);
        drop(tx);
        assert_eq!(trigger.wait(), Wait::Cancelled);
    }
}
