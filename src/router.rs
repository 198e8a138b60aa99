//! Route table mapping a route id to its async handler.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use crate::error::{HandlerError, RouterError};
use crate::store::{DashStore, Store};

/// A registered handler: `(message_id, conn_id, body)`.
pub type RouteHandler =
    Arc<dyn Fn(i32, i32, Bytes) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Dispatches message bodies to handlers by route id.
pub struct Router {
    routes: Box<dyn Store<RouteHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::with_store(Box::new(DashStore::new()))
    }

    pub fn with_store(routes: Box<dyn Store<RouteHandler>>) -> Self {
        Self { routes }
    }

    /// Register `handler` for `route_id`. Each route id can be taken once.
    pub fn register_route<F, Fut>(&self, route_id: i32, handler: F) -> Result<(), RouterError>
    where
        F: Fn(i32, i32, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: RouteHandler = Arc::new(move |message_id, conn_id, body| {
            handler(message_id, conn_id, body).boxed()
        });
        if !self.routes.try_insert(route_id, handler) {
            return Err(RouterError::RouteExists(route_id));
        }
        debug!(route_id, "Route registered");
        Ok(())
    }

    /// Run the handler for `route_id` to completion.
    pub async fn handle_message(
        &self,
        route_id: i32,
        conn_id: i32,
        message_id: i32,
        body: Bytes,
    ) -> Result<(), RouterError> {
        let handler = self
            .routes
            .get(route_id)
            .ok_or(RouterError::HandlerNotFound(route_id))?;
        handler(message_id, conn_id, body)
            .await
            .map_err(|source| RouterError::Handler { route_id, source })
    }

    pub fn contains(&self, route_id: i32) -> bool {
        self.routes.exists(route_id)
    }

    /// Registered route ids in ascending order.
    pub fn routes(&self) -> Vec<i32> {
        let mut ids = Vec::with_capacity(self.routes.len());
        self.routes.range(&mut |route_id, _| {
            ids.push(route_id);
            true
        });
        ids.sort_unstable();
        ids
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_dispatch_to_handler() {
        let router = Router::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            router
                .register_route(4, move |message_id, conn_id, body| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.lock().push((message_id, conn_id, body));
                        Ok(())
                    }
                })
                .unwrap();
        }

        router
            .handle_message(4, 77, 3, Bytes::from_static(b"abc"))
            .await
            .unwrap();
        assert_eq!(
            seen.lock().as_slice(),
            &[(3, 77, Bytes::from_static(b"abc"))]
        );
    }

    #[tokio::test]
    async fn test_duplicate_route_keeps_first_handler() {
        let router = Router::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        {
            let first = Arc::clone(&first);
            router
                .register_route(1, move |_, _, _| {
                    first.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                })
                .unwrap();
        }
        let err = {
            let second = Arc::clone(&second);
            router
                .register_route(1, move |_, _, _| {
                    second.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                })
                .unwrap_err()
        };
        assert!(matches!(err, RouterError::RouteExists(1)));
        assert_eq!(router.routes(), vec![1]);

        router.handle_message(1, 1, 1, Bytes::new()).await.unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_route_invokes_nothing() {
        let router = Router::new();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            router
                .register_route(1, move |_, _, _| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                })
                .unwrap();
        }

        let err = router
            .handle_message(2, 1, 1, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::HandlerNotFound(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let router = Router::new();
        router
            .register_route(9, |_, _, _| async { Err(HandlerError::msg("rejected")) })
            .unwrap();

        let err = router
            .handle_message(9, 1, 1, Bytes::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "route 9 handler failed: rejected");
        assert!(router.contains(9));
        assert!(!router.contains(10));
    }
}
