//! Session lifecycle state machine.
//!
//! Models the lifecycle of one remote-rendering session with validated
//! transitions that return `Result` instead of panicking.

use serde::{Deserialize, Serialize};

use crate::error::StreamError;

// ── SessionState ─────────────────────────────────────────────────

/// The current phase of a session.
///
/// ```text
///  Created ──► Ready ◄──► Loading
///     │          │           │
///     │          ▼           │
///     │       Closing ◄──────┘
///     │          │
///     └────────► Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SessionState {
    /// Inserted in the registry; render handle not yet acquired.
    #[default]
    Created,
    /// A navigation is in progress.
    Loading,
    /// Live and capturable.
    Ready,
    /// Teardown in progress. No new subscriptions or capture cycles.
    Closing,
    /// Terminal. Holds no render handle and no subscribers.
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Loading => write!(f, "Loading"),
            Self::Ready => write!(f, "Ready"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

impl SessionState {
    /// `Closing` or `Closed`.
    pub fn is_terminating(&self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }

    /// Whether frames may be captured in this state.
    pub fn is_capturable(&self) -> bool {
        matches!(self, Self::Ready)
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Render handle acquired.
    ///
    /// Valid from: `Created`.
    pub fn mark_ready(&mut self) -> Result<(), StreamError> {
        match self {
            Self::Created => {
                *self = Self::Ready;
                Ok(())
            }
            _ => Err(StreamError::Protocol(format!(
                "cannot become ready from {self}"
            ))),
        }
    }

    /// Render handle could not be acquired.
    ///
    /// Valid from: `Created`.
    pub fn fail_init(&mut self) -> Result<(), StreamError> {
        match self {
            Self::Created => {
                *self = Self::Closed;
                Ok(())
            }
            _ => Err(StreamError::Protocol(format!(
                "cannot fail init from {self}"
            ))),
        }
    }

    /// Start a navigation.
    ///
    /// Valid from: `Ready`. `Loading` reports `Busy`, terminating states
    /// report `SessionClosed`.
    pub fn begin_load(&mut self, id: &str) -> Result<(), StreamError> {
        match self {
            Self::Ready => {
                *self = Self::Loading;
                Ok(())
            }
            Self::Loading => Err(StreamError::Busy(format!("{id}: navigation in progress"))),
            Self::Created => Err(StreamError::Busy(format!("{id}: renderer starting"))),
            Self::Closing | Self::Closed => Err(StreamError::SessionClosed(id.to_string())),
        }
    }

    /// Navigation finished, successfully or not.
    ///
    /// Valid from: `Loading`. If a close started meanwhile the state is
    /// left untouched.
    pub fn finish_load(&mut self) -> Result<(), StreamError> {
        match self {
            Self::Loading => {
                *self = Self::Ready;
                Ok(())
            }
            Self::Closing | Self::Closed => Ok(()),
            _ => Err(StreamError::Protocol(format!(
                "cannot finish load from {self}"
            ))),
        }
    }

    /// Start teardown.
    ///
    /// Valid from: `Created`, `Loading`, `Ready`.
    pub fn begin_close(&mut self, id: &str) -> Result<(), StreamError> {
        match self {
            Self::Created | Self::Loading | Self::Ready => {
                *self = Self::Closing;
                Ok(())
            }
            Self::Closing | Self::Closed => Err(StreamError::SessionClosed(id.to_string())),
        }
    }

    /// Teardown finished.
    ///
    /// Valid from: `Closing`.
    pub fn finish_close(&mut self) -> Result<(), StreamError> {
        match self {
            Self::Closing => {
                *self = Self::Closed;
                Ok(())
            }
            _ => Err(StreamError::Protocol(format!(
                "cannot finish close from {self}"
            ))),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_lifecycle() {
        let mut state = SessionState::default();
        assert_eq!(state, SessionState::Created);

        state.mark_ready().unwrap();
        assert!(state.is_capturable());

        state.begin_load("s1").unwrap();
        assert_eq!(state, SessionState::Loading);
        assert!(!state.is_capturable());

        state.finish_load().unwrap();
        assert_eq!(state, SessionState::Ready);

        state.begin_close("s1").unwrap();
        assert!(state.is_terminating());

        state.finish_close().unwrap();
        assert_eq!(state, SessionState::Closed);
    }

    #[test]
    fn init_failure_goes_straight_to_closed() {
        let mut state = SessionState::Created;
        state.fail_init().unwrap();
        assert_eq!(state, SessionState::Closed);
    }

    #[test]
    fn concurrent_navigation_is_busy() {
        let mut state = SessionState::Loading;
        assert!(matches!(state.begin_load("s1"), Err(StreamError::Busy(_))));
    }

    #[test]
    fn closed_rejects_everything() {
        let mut state = SessionState::Closed;
        assert!(matches!(
            state.begin_load("s1"),
            Err(StreamError::SessionClosed(_))
        ));
        assert!(matches!(
            state.begin_close("s1"),
            Err(StreamError::SessionClosed(_))
        ));
        assert!(state.mark_ready().is_err());
        assert!(state.finish_close().is_err());
    }

    #[test]
    fn close_during_load_wins() {
        let mut state = SessionState::Loading;
        state.begin_close("s1").unwrap();
        state.finish_load().unwrap();
        assert_eq!(state, SessionState::Closing);
    }

    #[test]
    fn display_format() {
        assert_eq!(SessionState::Created.to_string(), "Created");
        assert_eq!(SessionState::Loading.to_string(), "Loading");
        assert_eq!(SessionState::Ready.to_string(), "Ready");
        assert_eq!(SessionState::Closing.to_string(), "Closing");
        assert_eq!(SessionState::Closed.to_string(), "Closed");
    }
}
