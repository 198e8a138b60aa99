//! Message object pool.
//!
//! Keeps a LIFO free list of reset messages per kind so the read path does
//! not allocate a fresh `Message` for every frame. A fresh message is always
//! a valid substitute, so an empty free list simply allocates.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::Message;
use crate::error::PoolError;

/// Idle messages kept per kind before releases are dropped.
const DEFAULT_MAX_IDLE: usize = 1024;

/// Per-kind free lists of reusable messages.
pub struct MessagePool {
    /// Free list per registered kind.
    free_lists: HashMap<String, Mutex<Vec<Message>>>,
    /// Cap on each free list.
    max_idle: usize,
}

impl MessagePool {
    /// Create a pool serving the given message kinds.
    pub fn new<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_max_idle(kinds, DEFAULT_MAX_IDLE)
    }

    pub fn with_max_idle<I, S>(kinds: I, max_idle: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let free_lists = kinds
            .into_iter()
            .map(|kind| (kind.into(), Mutex::new(Vec::new())))
            .collect();
        Self {
            free_lists,
            max_idle,
        }
    }

    /// Take a reset message of `kind`.
    pub fn acquire(&self, kind: &str) -> Result<Message, PoolError> {
        let list = self.list(kind)?;
        Ok(list.lock().pop().unwrap_or_default())
    }

    /// Reset `msg` and return it to the free list of `kind`.
    pub fn release(&self, kind: &str, mut msg: Message) -> Result<(), PoolError> {
        let list = self.list(kind)?;
        msg.reset();
        let mut free = list.lock();
        if free.len() < self.max_idle {
            free.push(msg);
        }
        Ok(())
    }

    /// Number of idle messages held for `kind`.
    pub fn idle(&self, kind: &str) -> Result<usize, PoolError> {
        Ok(self.list(kind)?.lock().len())
    }

    fn list(&self, kind: &str) -> Result<&Mutex<Vec<Message>>, PoolError> {
        self.free_lists
            .get(kind)
            .ok_or_else(|| PoolError::UnknownKind(kind.to_string()))
    }
}
