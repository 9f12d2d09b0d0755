//! Collector that folds many independent failures into one error

use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// A batch of independent errors reported as a single error
///
/// Used by [`ResourceManager::close`](crate::ResourceManager::close) so that a
/// failure to close one resource never stops the others from being closed.
/// The presence of a `BatchError` means "one or more operations failed";
/// [`BatchError::errors`] gives access to each individual failure.
///
/// # Example
///
/// ```rust
/// use flight_sync::BatchError;
///
/// let mut batch = BatchError::new();
/// assert!(batch.is_empty());
///
/// batch.add("first failure");
/// batch.add(std::io::Error::other("second failure"));
///
/// let err = batch.into_result().unwrap_err();
/// assert_eq!(err.len(), 2);
/// assert_eq!(err.to_string(), "first failure\nsecond failure");
/// ```
#[derive(Error, Debug, Default)]
#[error("{}", display_errors(.errors))]
pub struct BatchError {
    errors: Vec<BoxError>,
}

impl BatchError {
    /// Create an empty batch
    #[must_use]
    pub const fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Add an error to the batch
    pub fn add(&mut self, err: impl Into<BoxError>) {
        self.errors.push(err.into());
    }

    /// Check whether no error was collected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of collected errors
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// The collected errors, in the order they were added
    #[must_use]
    pub fn errors(&self) -> &[BoxError] {
        &self.errors
    }

    /// `Ok(())` if nothing was collected, otherwise the batch itself
    ///
    /// # Errors
    ///
    /// Returns `self` when at least one error was added.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl Extend<BoxError> for BatchError {
    fn extend<I: IntoIterator<Item = BoxError>>(&mut self, iter: I) {
        self.errors.extend(iter);
    }
}

fn display_errors(errors: &[BoxError]) -> impl fmt::Display + '_ {
    struct Joined<'a>(&'a [BoxError]);

    impl fmt::Display for Joined<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            for (i, err) in self.0.iter().enumerate() {
                if i > 0 {
                    f.write_str("\n")?;
                }
                write!(f, "{err}")?;
            }
            Ok(())
        }
    }

    Joined(errors)
}
