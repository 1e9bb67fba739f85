//! Smart pointer to [`tokio::sync::RwLock`].

use std::time::Duration;

use crate::sync::{Error, Result, DEFAULT_TIMEOUT_DURATION};
use tokio::time::timeout;

/// Smart pointer to [`tokio::sync::RwLock`].
///
/// Wraps acquiring the lock into [`timeout`] so a deadlocked or starved
/// structure surfaces as an error on the offending task instead of hanging
/// the whole node.
#[derive(Debug)]
pub struct RwLock<T> {
    inner: tokio::sync::RwLock<T>,
    timeout: Duration,
}

impl<T> RwLock<T> {
    /// Create new `RwLock` with the default acquire timeout.
    pub fn new(value: T) -> Self {
        Self {
            inner: tokio::sync::RwLock::new(value),
            timeout: DEFAULT_TIMEOUT_DURATION,
        }
    }

    /// Create new `RwLock` with the given acquire timeout.
    pub fn new_with_timeout(value: T, timeout: Duration) -> Self {
        Self {
            inner: tokio::sync::RwLock::new(value),
            timeout,
        }
    }

    /// Wrapper around [`tokio::sync::RwLock::read()`].
    ///
    /// # Panics
    ///
    /// Panics when the timeout is reached.
    pub async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, T> {
        match timeout(self.timeout, self.inner.read()).await {
            Ok(read_guard) => read_guard,
            Err(_) => panic!("timed out while waiting for `read` lock after {} ms", self.timeout.as_millis()),
        }
    }

    /// Wrapper around [`tokio::sync::RwLock::read()`]. Returns an error when
    /// the timeout is reached.
    pub async fn read_err(&self) -> Result<tokio::sync::RwLockReadGuard<'_, T>> {
        timeout(self.timeout, self.inner.read())
            .await
            .map_err(|_| Error::ReadLockTimeout(self.timeout.as_millis()))
    }

    /// Wrapper around [`tokio::sync::RwLock::write()`].
    ///
    /// # Panics
    ///
    /// Panics when the timeout is reached.
    pub async fn write(&self) -> tokio::sync::RwLockWriteGuard<'_, T> {
        match timeout(self.timeout, self.inner.write()).await {
            Ok(write_guard) => write_guard,
            Err(_) => panic!("timed out while waiting for `write` lock after {} ms", self.timeout.as_millis()),
        }
    }

    /// Wrapper around [`tokio::sync::RwLock::write()`]. Returns an error when
    /// the timeout is reached.
    pub async fn write_err(&self) -> Result<tokio::sync::RwLockWriteGuard<'_, T>> {
        timeout(self.timeout, self.inner.write())
            .await
            .map_err(|_| Error::WriteLockTimeout(self.timeout.as_millis()))
    }
}

impl<T> std::ops::Deref for RwLock<T> {
    type Target = tokio::sync::RwLock<T>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> From<T> for RwLock<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}
