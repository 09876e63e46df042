//! Actions naming state transitions and side-effect requests.
//!
//! An [`Action`] is an immutable identifier plus a visibility flag. It carries
//! no data itself: the data travels next to it as a [`Payload`]. Reducers and
//! effects are keyed by action name.
//!
//! # Visibility
//!
//! - **Private** actions only flow between a component and its direct parent
//!   or children. They are never intercepted and never broadcast.
//! - **Public** actions may additionally be intercepted by other components of
//!   the page and broadcast across pages.
//!
//! # Example
//!
//! ```rust
//! use canopy::domain::Action;
//!
//! let increment = Action::private("increment");
//! let refresh = Action::public("refresh");
//!
//! assert!(increment.is_private());
//! assert_eq!(refresh.name(), "refresh");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Data travelling with an action.
///
/// Payloads are plain JSON values so that reducers and effects of unrelated
/// components can exchange data without sharing Rust types.
pub type Payload = serde_json::Value;

/// Immutable identifier of a state transition or side-effect request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Action {
    name: String,
    private: bool,
}

impl Action {
    /// Creates a private action.
    ///
    /// Private actions stay within one component and its direct relatives.
    #[must_use]
    pub fn private(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            private: true,
        }
    }

    /// Creates a public action, eligible for interception and broadcast.
    #[must_use]
    pub fn public(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            private: false,
        }
    }

    /// Returns the action name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` for private actions.
    #[must_use]
    pub const fn is_private(&self) -> bool {
        self.private
    }

    /// Returns `true` for public actions.
    #[must_use]
    pub const fn is_public(&self) -> bool {
        !self.private
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.private {
            write!(f, "{} (private)", self.name)
        } else {
            f.write_str(&self.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visibility_is_fixed_at_construction() {
        let private = Action::private("increment");
        let public = Action::public("increment");

        assert!(private.is_private());
        assert!(public.is_public());
        assert_ne!(private, public);
        assert_eq!(private.name(), public.name());
    }

    #[test]
    fn display_marks_private_actions() {
        assert_eq!(Action::private("tick").to_string(), "tick (private)");
        assert_eq!(Action::public("tick").to_string(), "tick");
    }
}
