//! Connection lifecycle hooks.
//!
//! The server calls `before_connect` before a connection is registered,
//! `after_connect` once its pumps are running, and `on_close` after it has
//! been removed. A `before_connect` or `after_connect` error aborts the
//! connection; `on_close` errors are only logged.

use tracing::info;

use crate::connection::Connection;
use crate::error::HookError;

/// Callbacks invoked at fixed points of a connection's life.
pub trait ConnHook: Send + Sync {
    fn before_connect(&self, _conn: &Connection) -> Result<(), HookError> {
        Ok(())
    }

    fn after_connect(&self, _conn: &Connection) -> Result<(), HookError> {
        Ok(())
    }

    fn on_close(&self, _conn: &Connection) -> Result<(), HookError> {
        Ok(())
    }
}

/// Hook that logs every lifecycle event.
#[derive(Debug, Default)]
pub struct LogHook;

impl ConnHook for LogHook {
    fn before_connect(&self, conn: &Connection) -> Result<(), HookError> {
        info!(conn_id = conn.conn_id(), peer = ?conn.peer_addr(), "Client connecting");
        Ok(())
    }

    fn after_connect(&self, conn: &Connection) -> Result<(), HookError> {
        info!(conn_id = conn.conn_id(), "Client connected");
        Ok(())
    }

    fn on_close(&self, conn: &Connection) -> Result<(), HookError> {
        info!(
            conn_id = conn.conn_id(),
            reason = ?conn.close_reason(),
            "Client disconnected"
        );
        Ok(())
    }
}
