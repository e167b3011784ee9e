//! Progress reporting for long-running operations (download, install).
//!
//! Producers (transports, engines) push fractions into a [`ProgressReporter`],
//! which drops anything that would move backwards. Callers consume a
//! [`ProgressStream`]: zero or more `Progress` items followed by exactly one
//! `Finished` item carrying the outcome.

use std::fmt;

use tokio::sync::mpsc;

use crate::vm::error::{VmError, VmResult};

/// One item of a [`ProgressStream`].
#[derive(Debug)]
pub enum ProgressUpdate<T> {
    /// Fraction complete, in `[0, 1]`, never decreasing.
    Progress(f64),
    /// Terminal outcome. Nothing follows it.
    Finished(VmResult<T>),
}

/// Sending half of a [`ProgressStream`].
pub type ProgressSender<T> = mpsc::UnboundedSender<ProgressUpdate<T>>;

/// A finite, ordered sequence of progress values terminated by one result.
pub struct ProgressStream<T> {
    rx: mpsc::UnboundedReceiver<ProgressUpdate<T>>,
    finished: bool,
}

impl<T> ProgressStream<T> {
    /// Create a connected sender/stream pair.
    pub fn channel() -> (ProgressSender<T>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                rx,
                finished: false,
            },
        )
    }

    /// A stream that is already complete.
    pub fn finished(result: VmResult<T>) -> Self {
        let (tx, stream) = Self::channel();
        let _ = tx.send(ProgressUpdate::Finished(result));
        stream
    }

    /// Next update, or `None` once the terminal result has been yielded.
    ///
    /// If the producer disappears without a result, a final
    /// `Finished(Err(VmError::Shutdown))` is synthesised.
    pub async fn next(&mut self) -> Option<ProgressUpdate<T>> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(ProgressUpdate::Finished(result)) => {
                self.finished = true;
                Some(ProgressUpdate::Finished(result))
            }
            Some(update) => Some(update),
            None => {
                self.finished = true;
                Some(ProgressUpdate::Finished(Err(VmError::Shutdown)))
            }
        }
    }

    /// Drain the stream and return the terminal result.
    pub async fn finish(mut self) -> VmResult<T> {
        while let Some(update) = self.next().await {
            if let ProgressUpdate::Finished(result) = update {
                return result;
            }
        }
        Err(VmError::Shutdown)
    }

    /// Drain the stream, handing every progress value to `on_progress`.
    pub async fn for_each_progress(mut self, mut on_progress: impl FnMut(f64)) -> VmResult<T> {
        while let Some(update) = self.next().await {
            match update {
                ProgressUpdate::Progress(fraction) => on_progress(fraction),
                ProgressUpdate::Finished(result) => return result,
            }
        }
        Err(VmError::Shutdown)
    }
}

impl<T> fmt::Debug for ProgressStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressStream")
            .field("finished", &self.finished)
            .finish()
    }
}

/// Monotonic progress sink handed to producers.
///
/// Values are clamped to `[0, 1]`; NaN and values not greater than the last
/// forwarded one are dropped.
pub struct ProgressReporter {
    last: Option<f64>,
    sink: Box<dyn FnMut(f64) + Send>,
}

impl ProgressReporter {
    pub fn new(sink: impl FnMut(f64) + Send + 'static) -> Self {
        Self {
            last: None,
            sink: Box::new(sink),
        }
    }

    /// A reporter that forwards nowhere.
    pub fn discard() -> Self {
        Self::new(|_| {})
    }

    /// Report `written / expected`. Unknown or zero totals report nothing.
    pub fn report_bytes(&mut self, written: u64, expected: Option<u64>) {
        if let Some(expected) = expected.filter(|&e| e > 0) {
            self.report(written as f64 / expected as f64);
        }
    }

    pub fn report(&mut self, fraction: f64) {
        if fraction.is_nan() {
            return;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        if self.last.is_some_and(|last| fraction <= last) {
            return;
        }
        self.last = Some(fraction);
        (self.sink)(fraction);
    }

    /// Report exactly 1.0 unless it was already reported.
    pub fn complete(&mut self) {
        self.report(1.0);
    }

    /// The last value forwarded, if any.
    pub fn last(&self) -> Option<f64> {
        self.last
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("last", &self.last)
            .finish_non_exhaustive()
    }
}
