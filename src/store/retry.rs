//! Shared backoff-retry combinator.
//!
//! One retry loop for every write path, parameterised by an error classifier
//! that decides whether a failure is worth another attempt.

use std::io;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::StoreConfig;

/// Whether a failure may succeed on a later attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient conflict; back off and try again.
    Retryable,
    /// Permanent; stop immediately.
    Fatal,
}

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_retries: u32,
}

impl Backoff {
    /// Build a backoff schedule.
    pub fn new(base: Duration, max: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max: max.max(base),
            max_retries,
        }
    }

    /// Backoff schedule described by the store configuration.
    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
            config.max_retries,
        )
    }

    /// Maximum retries after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Upper bound of the delay before retry number `retry` (0-based).
    pub fn ceiling(&self, retry: u32) -> Duration {
        let factor = 1_u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Jittered delay before retry number `retry`: uniform in `[ceiling/2, ceiling]`.
    pub fn delay(&self, retry: u32) -> Duration {
        let ceiling = self.ceiling(retry);
        let floor = ceiling.checked_div(2).unwrap_or(ceiling);
        if ceiling <= floor {
            return ceiling;
        }
        rand::thread_rng().gen_range(floor..=ceiling)
    }
}

/// Result of a retried operation together with its cost.
#[derive(Debug)]
pub struct RetryReport<T, E> {
    /// Final result: the first success, or the last error.
    pub result: Result<T, E>,
    /// Retries performed (0 when the first attempt settled it).
    pub retries: u32,
    /// Wall time spent including backoff sleeps.
    pub elapsed: Duration,
}

/// Run `op` until it succeeds, fails fatally, or retries are exhausted.
///
/// `op` receives the 0-based attempt number. `on_retry` is invoked before each
/// backoff sleep with the attempt that failed and its error. Backoff sleeps
/// block the thread; never call this directly from an async task.
pub fn retry_blocking<T, E>(
    backoff: &Backoff,
    classify: impl Fn(&E) -> ErrorClass,
    mut on_retry: impl FnMut(u32, &E),
    mut op: impl FnMut(u32) -> Result<T, E>,
) -> RetryReport<T, E> {
    let started = Instant::now();
    let mut attempt: u32 = 0;
    loop {
        match op(attempt) {
            Ok(value) => {
                return RetryReport {
                    result: Ok(value),
                    retries: attempt,
                    elapsed: started.elapsed(),
                }
            }
            Err(e) => {
                let exhausted = attempt >= backoff.max_retries();
                if exhausted || classify(&e) == ErrorClass::Fatal {
                    return RetryReport {
                        result: Err(e),
                        retries: attempt,
                        elapsed: started.elapsed(),
                    };
                }
                on_retry(attempt, &e);
                std::thread::sleep(backoff.delay(attempt));
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

/// Windows sharing/lock violation and access-denied codes seen during replace.
const WINDOWS_TRANSIENT_CODES: [i32; 4] = [5, 32, 33, 183];

/// Classify an I/O error raised while writing or replacing a state file.
pub fn classify_io(error: &io::Error) -> ErrorClass {
    if cfg!(windows) {
        if let Some(code) = error.raw_os_error() {
            if WINDOWS_TRANSIENT_CODES.contains(&code) {
                return ErrorClass::Retryable;
            }
        }
    }
    match error.kind() {
        io::ErrorKind::PermissionDenied
        | io::ErrorKind::AlreadyExists
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::ResourceBusy => ErrorClass::Retryable,
        _ => ErrorClass::Fatal,
    }
}
