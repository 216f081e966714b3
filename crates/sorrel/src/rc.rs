//! The closed result-code taxonomy shared by the value engine and the script engine.
//!
//! Codes are semantic by name only; the numeric values are an internal detail
//! and may change between releases. Script-visible exceptions expose the code
//! both as an integer (`code` property) and as its name (`codeString()`).

use strum::{Display, EnumString, FromRepr, IntoStaticStr};

/// Result code for every engine-level operation.
///
/// The taxonomy covers plain errors, resource exhaustion, protocol violations,
/// flow-control carriers (`Return`, `Break`, `Continue`, `Exit`, `Interrupted`),
/// script exceptions, and script-syntax failures. Flow-control codes are not
/// errors: they are recognized by the constructs designed to intercept them and
/// reported as `Misuse` everywhere else.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, FromRepr)]
pub enum ResultCode {
    /// Success.
    Ok,
    /// Generic, unclassified error.
    Error,
    /// Out of memory, or an allocation cap was exceeded. Propagation of this
    /// code never allocates (no formatted messages).
    Oom,
    /// Unrecoverable corruption. Once raised, the engine refuses further work.
    Fatal,

    // --- Flow control (not errors) ---
    /// `continue` inside a loop body.
    Continue,
    /// `break` inside a loop body. May carry a payload value.
    Break,
    /// `return` inside a function body. Carries the return value.
    Return,
    /// `exit` anywhere. Carries the script result and unwinds to the top driver.
    Exit,
    /// A script exception is propagating. The exception value travels with it.
    Exception,
    /// An `assert` or `affirm` failed. `affirm` failures are catchable,
    /// `assert` failures are not.
    Assert,

    // --- Argument / protocol errors ---
    /// An API was used in a way it does not support (wrong call context,
    /// flow-control code escaping its construct, and similar).
    Misuse,
    /// A lookup (property, variable, hash entry) found nothing.
    NotFound,
    /// An entry with the given key already exists.
    AlreadyExists,
    /// A numeric or structural value is out of its permitted range.
    Range,
    /// A value has the wrong type for the requested operation.
    Type,
    /// The operation is recognized but not supported by this build or value.
    Unsupported,
    /// The operation is forbidden for this caller.
    Access,

    // --- Concurrency discipline (single-threaded visiting/locking) ---
    /// A container is being visited and cannot be re-entered.
    IsVisiting,
    /// A container's list parts are being visited; mutation is forbidden.
    IsVisitingList,
    /// The container forbids creating new properties.
    DisallowNewProperties,
    /// The container forbids setting properties.
    DisallowPropSet,
    /// The container forbids replacing its prototype.
    DisallowPrototypeSet,
    /// Assignment to a const variable or const property.
    ConstViolation,
    /// The container is locked against mutation and iteration.
    Locked,

    // --- Lifetime / destruction ---
    /// A cycle was detected where none is permitted (e.g. result export).
    CyclesDetected,
    /// The value-engine is tearing down and cannot service the call.
    DestructionRunning,
    /// The value has already been finalized.
    Finalized,
    /// The value still has references and cannot be disposed.
    HasReferences,

    // --- Cancellation ---
    /// Cooperative interruption was requested and honored.
    Interrupted,
    /// The operation was cancelled before it ran.
    Cancelled,

    // --- Host I/O ---
    /// An I/O error from the host environment.
    Io,
    /// An internal invariant failed in a way that "cannot happen".
    CannotHappen,

    // --- Script syntax / runtime script errors ---
    /// Generic syntax error.
    Syntax,
    /// A well-formed token appeared where it is not allowed.
    UnexpectedToken,
    /// End of input inside an unfinished construct.
    UnexpectedEof,
    /// Integer division or modulus by zero.
    DivByZero,
    /// An identifier did not resolve in the scope chain.
    UnknownIdentifier,
    /// Call of a value that is not callable.
    CallOfNonFunction,
}

impl ResultCode {
    /// True for the flow-control carriers, which are not errors.
    #[must_use]
    pub fn is_flow_control(self) -> bool {
        matches!(
            self,
            Self::Continue | Self::Break | Self::Return | Self::Exit | Self::Interrupted
        )
    }

    /// True for codes which must propagate without any allocation
    /// (no formatted messages, no new exception values).
    #[must_use]
    pub fn is_allocation_free(self) -> bool {
        matches!(self, Self::Oom | Self::Fatal)
    }

    /// Stable integer form exposed to scripts via an exception's `code` property.
    #[must_use]
    pub fn as_int(self) -> i64 {
        self as i64
    }

    /// Inverse of [`ResultCode::as_int`] for values produced by this build.
    #[must_use]
    pub fn from_int(code: i64) -> Option<Self> {
        u16::try_from(code).ok().and_then(Self::from_repr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_names_round_trip() {
        for code in [
            ResultCode::Ok,
            ResultCode::Oom,
            ResultCode::Exception,
            ResultCode::ConstViolation,
            ResultCode::DivByZero,
            ResultCode::UnknownIdentifier,
        ] {
            let name: &'static str = code.into();
            assert_eq!(name.parse::<ResultCode>().unwrap(), code, "name {name} should round-trip");
        }
    }

    #[test]
    fn int_form_round_trips() {
        let code = ResultCode::CallOfNonFunction;
        assert_eq!(ResultCode::from_int(code.as_int()), Some(code));
        assert_eq!(ResultCode::from_int(-1), None);
        assert_eq!(ResultCode::from_int(i64::MAX), None);
    }

    #[test]
    fn flow_control_classification() {
        assert!(ResultCode::Break.is_flow_control());
        assert!(ResultCode::Exit.is_flow_control());
        assert!(!ResultCode::Exception.is_flow_control(), "exceptions travel separately");
        assert!(!ResultCode::Oom.is_flow_control());
    }
}
