use std::fmt;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Created, no parameters accepted yet.
    NotConfigured,
    /// Parameters validated and stored; no resources acquired.
    Configured,
    /// Resources live, workers running, dispatch enabled.
    Active,
    /// Resources live, dispatch halted.
    Suspended,
    /// Resources released. Terminal.
    Closed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::NotConfigured => write!(f, "not_configured"),
            State::Configured => write!(f, "configured"),
            State::Active => write!(f, "active"),
            State::Suspended => write!(f, "suspended"),
            State::Closed => write!(f, "closed"),
        }
    }
}

/// A state-changing operation on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Configure,
    Establish,
    Suspend,
    Resume,
    Shutdown,
}

/// The one transition predicate every operation consults.
///
/// Returns the state the connection moves to when `op` is legal in `from`,
/// or `None` when the operation must fail with `WrongState` (or
/// `AlreadyInitialized`, for `Configure`) without touching the state field.
///
/// ```text
/// not_configured --configure--> configured
/// configured     --establish--> active        (failure --> closed)
/// active         --suspend-->   suspended
/// suspended      --resume-->    active
/// any non-closed --shutdown-->  closed
/// ```
pub fn next_state(from: State, op: Op) -> Option<State> {
    match (from, op) {
        (State::NotConfigured, Op::Configure) => Some(State::Configured),
        (State::Configured, Op::Establish) => Some(State::Active),
        (State::Active, Op::Suspend) => Some(State::Suspended),
        (State::Suspended, Op::Resume) => Some(State::Active),
        (State::Closed, _) => None,
        (_, Op::Shutdown) => Some(State::Closed),
        _ => None,
    }
}
