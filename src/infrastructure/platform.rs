//! Opaque platform capability handle.
//!
//! The engine never looks inside a [`Platform`]: it only threads it from the
//! [`Runtime`](super::Runtime) to every
//! [`ComponentContext`](crate::component::ComponentContext), where effects
//! downcast it to whatever host services the embedding application provides
//! (navigation, dialogs, permissions and so on).

use std::any::Any;
use std::fmt;
use std::rc::Rc;

/// Shared, type-erased host capability surface.
///
/// # Example
///
/// ```rust
/// use canopy::infrastructure::Platform;
///
/// struct Clipboard(String);
///
/// let platform = Platform::new(Clipboard("hi".to_string()));
/// let clipboard = platform.downcast_ref::<Clipboard>().unwrap();
/// assert_eq!(clipboard.0, "hi");
/// assert!(Platform::none().downcast_ref::<Clipboard>().is_none());
/// ```
#[derive(Clone, Default)]
pub struct Platform {
    inner: Option<Rc<dyn Any>>,
}

impl Platform {
    /// Wraps a host capability value.
    #[must_use]
    pub fn new<T: Any>(capabilities: T) -> Self {
        Self {
            inner: Some(Rc::new(capabilities)),
        }
    }

    /// A platform without capabilities.
    #[must_use]
    pub const fn none() -> Self {
        Self { inner: None }
    }

    /// Returns `true` when host capabilities were provided.
    #[must_use]
    pub const fn is_available(&self) -> bool {
        self.inner.is_some()
    }

    /// Borrows the capabilities as `T`, if that is what they are.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.as_deref().and_then(<dyn Any>::downcast_ref::<T>)
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("available", &self.is_available())
            .finish()
    }
}
