/// Lifecycle of an analyzer session.
///
/// A claimed interface starts in `Stopped`. Only `Running` has an
/// acquisition loop in flight, and losing the device from any state lands
/// in `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Stopped,
    Running,
}

impl SessionState {
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running)
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self, SessionState::Disconnected)
    }
}
