//! Built-in system routes.
//!
//! * `PING` (route 1): replies `"<message_id>:PONG"` on route 1 and counts as
//!   activity for the health sweep.
//! * `ACTIVE_SHUTDOWN` (route 10): replies `"ok"` on route 10, then closes the
//!   connection once the reply has been queued.

use std::sync::Arc;

use crate::connection::CloseReason;
use crate::error::{HandlerError, RouterError};
use crate::manager::ConnManager;
use crate::message::Message;
use crate::router::Router;

pub const PING: i32 = 1;
pub const ACTIVE_SHUTDOWN: i32 = 10;

/// Register the system routes on `router`.
pub fn register_system_routes(
    router: &Router,
    manager: &Arc<ConnManager>,
) -> Result<(), RouterError> {
    let mgr = Arc::clone(manager);
    router.register_route(PING, move |message_id, conn_id, _body| {
        let mgr = Arc::clone(&mgr);
        async move {
            let conn = mgr.find_conn(conn_id)?;
            let reply = Message::new(format!("{message_id}:PONG"), message_id, PING);
            conn.send_message(reply).await?;
            conn.update_last_active_time();
            Ok::<_, HandlerError>(())
        }
    })?;

    let mgr = Arc::clone(manager);
    router.register_route(ACTIVE_SHUTDOWN, move |message_id, conn_id, _body| {
        let mgr = Arc::clone(&mgr);
        async move {
            let conn = mgr.find_conn(conn_id)?;
            conn.send_message(Message::new("ok", message_id, ACTIVE_SHUTDOWN))
                .await?;
            // The writer drains queued replies before the socket goes away.
            conn.signal_close(CloseReason::Requested);
            Ok::<_, HandlerError>(())
        }
    })?;

    Ok(())
}
