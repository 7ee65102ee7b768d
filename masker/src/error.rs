//! Fixed error taxonomy with per-category recovery handlers.
//!
//! Categories are a closed enum rather than an open hierarchy; at most one
//! recovery handler is registered per category, and retries are bounded
//! with exponential backoff.

use anyhow::Error;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, thread, time::Duration};

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Unreadable or corrupt input capture. Fatal.
    Input,
    /// External dissector unavailable or failed. Non-fatal, fail closed.
    Dissector,
    /// One packet could not be processed. Non-fatal, pass through.
    PacketProcessing,
    /// Output sink failed. Fatal.
    Output,
    /// Memory pressure. Non-fatal until sustained above the ceiling.
    Memory,
    /// Post-run output check failed. Non-fatal, reported.
    Validation,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ErrorCategory::Input => "input",
            ErrorCategory::Dissector => "dissector",
            ErrorCategory::PacketProcessing => "packet_processing",
            ErrorCategory::Output => "output",
            ErrorCategory::Memory => "memory",
            ErrorCategory::Validation => "validation",
        };
        f.write_str(name)
    }
}

/// One recorded error occurrence.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ErrorInfo {
    pub category: ErrorCategory,
    pub message: String,
}

type Handler = Box<dyn Fn(&ErrorInfo) -> bool>;

/// Records errors, dispatches the registered recovery handler, and runs
/// bounded retries.
pub struct RecoveryHandler {
    handlers: HashMap<ErrorCategory, Handler>,
    max_attempts: usize,
    base_delay: Duration,
    history: Vec<ErrorInfo>,
}

impl RecoveryHandler {
    pub fn new(max_attempts: usize, base_delay: Duration) -> Self {
        RecoveryHandler {
            handlers: HashMap::new(),
            max_attempts: max_attempts.max(1),
            base_delay,
            history: Vec::new(),
        }
    }

    /// Register the recovery handler for a category, replacing any previous
    /// one.
    pub fn register<F>(&mut self, category: ErrorCategory, handler: F)
    where
        F: Fn(&ErrorInfo) -> bool + 'static,
    {
        self.handlers.insert(category, Box::new(handler));
    }

    /// Record a non-fatal error and run its recovery handler, if any.
    /// Returns whether the handler reported successful recovery.
    pub fn record(&mut self, category: ErrorCategory, message: impl Into<String>) -> bool {
        let info = ErrorInfo {
            category,
            message: message.into(),
        };
        warn!("[{}] {}", info.category, info.message);
        let recovered = match self.handlers.get(&category) {
            Some(handler) => {
                let ok = handler(&info);
                debug!("Recovery handler for {} returned {}", category, ok);
                ok
            }
            None => false,
        };
        self.history.push(info);
        recovered
    }

    /// Run `operation` up to the configured number of attempts, sleeping
    /// with exponential backoff and invoking the category's recovery
    /// handler between attempts.
    pub fn retry<T, F>(&mut self, category: ErrorCategory, mut operation: F) -> Result<T, Error>
    where
        F: FnMut() -> Result<T, Error>,
    {
        let mut delay = self.base_delay;
        let mut last_err = None;
        for attempt in 1..=self.max_attempts {
            match operation() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    error!(
                        "[{}] attempt {}/{} failed: {:#}",
                        category, attempt, self.max_attempts, err
                    );
                    self.record(category, format!("{:#}", err));
                    last_err = Some(err);
                    if attempt < self.max_attempts {
                        thread::sleep(delay);
                        delay *= 2;
                    }
                }
            }
        }
        // max_attempts >= 1, so at least one error was stored
        Err(last_err.unwrap())
    }

    pub fn history(&self) -> &[ErrorInfo] {
        &self.history
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.history
            .iter()
            .map(|e| format!("[{}] {}", e.category, e.message))
            .collect()
    }

    pub fn count(&self, category: ErrorCategory) -> usize {
        self.history
            .iter()
            .filter(|e| e.category == category)
            .count()
    }
}

impl Default for RecoveryHandler {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::{cell::Cell, rc::Rc};

    #[test]
    fn retry_gives_up_after_max_attempts() {
        let mut handler = RecoveryHandler::new(3, Duration::from_millis(1));
        let calls = Rc::new(Cell::new(0u32));
        let counted = Rc::clone(&calls);
        let result: Result<(), Error> = handler.retry(ErrorCategory::Input, move || {
            counted.set(counted.get() + 1);
            anyhow::bail!("nope")
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
        assert_eq!(handler.count(ErrorCategory::Input), 3);
    }

    #[test]
    fn retry_stops_on_success() {
        let mut handler = RecoveryHandler::new(3, Duration::from_millis(1));
        let calls = Rc::new(Cell::new(0u32));
        let counted = Rc::clone(&calls);
        let result = handler.retry(ErrorCategory::Input, move || {
            counted.set(counted.get() + 1);
            if counted.get() < 2 {
                anyhow::bail!("transient")
            }
            Ok(42)
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn registered_handler_runs_on_record() {
        let mut handler = RecoveryHandler::default();
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        handler.register(ErrorCategory::Memory, move |_| {
            flag.set(true);
            true
        });
        assert!(handler.record(ErrorCategory::Memory, "pressure at 85%"));
        assert!(ran.get());
        // No handler registered for this category.
        assert!(!handler.record(ErrorCategory::Validation, "size mismatch"));
    }
}
