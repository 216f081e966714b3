//! Pluggable output channel for script-visible output (`print` and friends).
//!
//! The engine owns exactly one [`Outputer`]. Embedders swap it to capture or
//! redirect output; the default writes to stdout.

use std::io::{self, Write as _};

use crate::error::Exception;

/// Receives script output. Implementations must not add separators or
/// terminators of their own; the caller emits those explicitly.
pub trait Outputer {
    /// Writes one chunk of output.
    fn output(&mut self, chunk: &str) -> Result<(), Exception>;

    /// Flushes any buffering. The default is a no-op.
    fn flush(&mut self) -> Result<(), Exception> {
        Ok(())
    }
}

/// Default outputer: line-buffered stdout.
#[derive(Debug, Default)]
pub struct StdOutputer;

impl Outputer for StdOutputer {
    fn output(&mut self, chunk: &str) -> Result<(), Exception> {
        io::stdout()
            .write_all(chunk.as_bytes())
            .map_err(|e| Exception::new(crate::rc::ResultCode::Io, e.to_string()))
    }

    fn flush(&mut self) -> Result<(), Exception> {
        io::stdout()
            .flush()
            .map_err(|e| Exception::new(crate::rc::ResultCode::Io, e.to_string()))
    }
}

/// Outputer that collects everything into a shared string buffer.
///
/// Clones share the buffer, so a caller can keep one clone, hand the other to
/// the engine, and read the collected output afterwards.
#[derive(Debug, Default, Clone)]
pub struct CollectStringOutputer(std::rc::Rc<std::cell::RefCell<String>>);

impl CollectStringOutputer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the collected output so far.
    #[must_use]
    pub fn output_string(&self) -> String {
        self.0.borrow().clone()
    }
}

impl Outputer for CollectStringOutputer {
    fn output(&mut self, chunk: &str) -> Result<(), Exception> {
        self.0.borrow_mut().push_str(chunk);
        Ok(())
    }
}

/// Outputer that discards everything.
#[derive(Debug, Default)]
pub struct NullOutputer;

impl Outputer for NullOutputer {
    fn output(&mut self, _chunk: &str) -> Result<(), Exception> {
        Ok(())
    }
}
