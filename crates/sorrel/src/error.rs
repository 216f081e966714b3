//! Error state, public exception reports, and the internal flow-control enum.
//!
//! Three mechanisms coexist, as the propagation policy requires:
//!
//! * [`EngineError`] is the structured, locally recoverable error record used
//!   by layers that cannot or should not allocate exception values (the
//!   tokenizer, the allocator paths). It is consumed or converted into an
//!   exception at language-feature boundaries.
//! * Script exceptions are ordinary heap values of the exception kind and
//!   travel inside [`EvalError::Exception`].
//! * Flow control (`return`/`break`/`continue`/`exit`/interruption) travels
//!   as dedicated [`EvalError`] variants with their payload value, recognized
//!   only by the constructs designed to intercept them.

use std::fmt;

use crate::{rc::ResultCode, resource::ResourceError, value::Value};

/// One stack-trace frame of an exception report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Script name of the frame.
    pub script: String,
    /// 1-based line.
    pub line: u32,
    /// 0-based column.
    pub column: u32,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.script, self.line, self.column)
    }
}

/// The public failure report handed to embedders: an unhandled exception, a
/// syntax error, or a fatal condition, with its script location and the
/// script-function stack trace captured at throw time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    pub code: ResultCode,
    pub message: String,
    /// Script name, when known.
    pub script: Option<String>,
    /// 1-based line; 0 when unknown.
    pub line: u32,
    /// 0-based column.
    pub column: u32,
    /// Innermost frame first.
    pub stacktrace: Vec<StackFrame>,
}

impl Exception {
    /// A bare report with no location. Natives use this to raise errors.
    #[must_use]
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            script: None,
            line: 0,
            column: 0,
            stacktrace: Vec::new(),
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        if let Some(script) = &self.script {
            write!(f, " at {script}:{}:{}", self.line, self.column)?;
        }
        Ok(())
    }
}

impl std::error::Error for Exception {}

/// The engine's structured error record.
///
/// A reusable buffer, distinct from the exception state: code, 1-based line,
/// 0-based column, message, and optionally the script name. `clear` resets it
/// to `Ok` without releasing the message buffer.
#[derive(Debug, Clone, Default)]
pub(crate) struct EngineError {
    code: Option<ResultCode>,
    pub line: u32,
    pub column: u32,
    pub message: String,
    pub script: Option<String>,
}

impl EngineError {
    pub fn is_set(&self) -> bool {
        self.code.is_some_and(|c| c != ResultCode::Ok)
    }

    pub fn code(&self) -> ResultCode {
        self.code.unwrap_or(ResultCode::Ok)
    }

    pub fn set(&mut self, code: ResultCode, line: u32, column: u32, message: &str) {
        self.code = Some(code);
        self.line = line;
        self.column = column;
        self.message.clear();
        // OOM and FATAL bypass all message formatting.
        if !code.is_allocation_free() {
            self.message.push_str(message);
        }
    }

    pub fn clear(&mut self) {
        self.code = None;
        self.line = 0;
        self.column = 0;
        self.message.clear();
        self.script = None;
    }

    /// Converts the record into a public report, consuming the state.
    pub fn take_report(&mut self) -> Exception {
        let report = Exception {
            code: self.code(),
            message: std::mem::take(&mut self.message),
            script: self.script.take(),
            line: self.line,
            column: self.column,
            stacktrace: Vec::new(),
        };
        self.clear();
        report
    }
}

/// Internal result type for every evaluation-path operation.
pub(crate) type EvalResult<V> = Result<V, EvalError>;

/// The non-`Ok` outcomes of evaluation: errors, script exceptions, and the
/// flow-control carriers. Payload values ride in the variant; call sites that
/// pop scopes must rescope the payload into the surviving scope first.
#[derive(Debug)]
pub(crate) enum EvalError {
    /// A script exception value is propagating (catchable).
    Exception(Value),
    /// An `assert` failure: carries an exception value but is not catchable.
    Uncatchable(Value),
    /// `return`, with the propagating value.
    Return(Value),
    /// `break`, with its optional payload (`Undef` when none).
    Break(Value),
    /// `continue`.
    Continue,
    /// `exit`, with the script result.
    Exit(Value),
    /// Cooperative interruption; unwinds like `exit` and beats everything
    /// except OOM/FATAL.
    Interrupted,
    /// Resource exhaustion; propagates without allocating.
    Oom,
    /// Unrecoverable corruption.
    Fatal(ResultCode),
    /// A structured engine error (syntax errors and other non-exception
    /// failures), converted to an exception or report at a feature boundary.
    Engine(Box<EngineError>),
}

impl EvalError {
    pub fn code(&self) -> ResultCode {
        match self {
            Self::Exception(_) => ResultCode::Exception,
            Self::Uncatchable(_) => ResultCode::Assert,
            Self::Return(_) => ResultCode::Return,
            Self::Break(_) => ResultCode::Break,
            Self::Continue => ResultCode::Continue,
            Self::Exit(_) => ResultCode::Exit,
            Self::Interrupted => ResultCode::Interrupted,
            Self::Oom => ResultCode::Oom,
            Self::Fatal(code) => *code,
            Self::Engine(err) => err.code(),
        }
    }

    /// The payload value carried by this outcome, when there is one.
    pub fn payload(&self) -> Option<Value> {
        match self {
            Self::Exception(v) | Self::Uncatchable(v) | Self::Return(v) | Self::Break(v) | Self::Exit(v) => Some(*v),
            _ => None,
        }
    }

    /// True when this outcome may legitimately cross a `catch` boundary
    /// uncaught (flow control and fatal conditions).
    pub fn is_catchable(&self) -> bool {
        matches!(self, Self::Exception(_) | Self::Engine(_))
    }
}

impl From<ResourceError> for EvalError {
    fn from(err: ResourceError) -> Self {
        match err.result_code() {
            ResultCode::Interrupted => Self::Interrupted,
            _ => Self::Oom,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_oom_skips_message_formatting() {
        let mut err = EngineError::default();
        err.set(ResultCode::Oom, 3, 7, "this text must be dropped");
        assert!(err.is_set());
        assert_eq!(err.code(), ResultCode::Oom);
        assert!(err.message.is_empty(), "OOM must not retain a formatted message");
        assert_eq!((err.line, err.column), (3, 7));
    }

    #[test]
    fn take_report_consumes_the_state() {
        let mut err = EngineError::default();
        err.set(ResultCode::Syntax, 2, 4, "unexpected token");
        let report = err.take_report();
        assert_eq!(report.code, ResultCode::Syntax);
        assert_eq!(report.message, "unexpected token");
        assert!(!err.is_set(), "the record is cleared by take_report");
    }

    #[test]
    fn flow_control_is_not_catchable() {
        assert!(!EvalError::Return(Value::Int(1)).is_catchable());
        assert!(!EvalError::Interrupted.is_catchable());
        assert!(!EvalError::Uncatchable(Value::Undef).is_catchable(), "assert failures pass through catch");
        assert!(EvalError::Exception(Value::Undef).is_catchable());
    }

    #[test]
    fn resource_errors_map_to_oom_or_interrupt() {
        use std::time::Duration;
        let oom: EvalError = ResourceError::Allocation { limit: 1, count: 2 }.into();
        assert_eq!(oom.code(), ResultCode::Oom);
        let timed: EvalError = ResourceError::Time {
            limit: Duration::from_secs(1),
            elapsed: Duration::from_secs(2),
        }
        .into();
        assert_eq!(timed.code(), ResultCode::Interrupted);
    }
}
