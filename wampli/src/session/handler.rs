use std::future::Future;

use anyhow::Result;
use async_trait::async_trait;

use crate::session::session::{
    Event,
    Invocation,
    RpcYield,
};

/// Handles events published to a subscription.
///
/// Events of one subscription are handled one at a time, in the order the router sent them.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: Event);
}

#[async_trait]
impl<F> EventHandler for F
where
    F: Fn(Event) + Send + Sync,
{
    async fn handle_event(&self, event: Event) {
        self(event)
    }
}

/// Handles invocations of a registered procedure.
///
/// Each invocation runs on its own task. Returning a
/// [`CallError`][`crate::core::error::CallError`] sends that error back to the caller; any other
/// error becomes `wamp.error.runtime_error`.
#[async_trait]
pub trait InvocationHandler: Send + Sync {
    async fn invoke(&self, invocation: Invocation) -> Result<RpcYield>;
}

#[async_trait]
impl<F, Fut> InvocationHandler for F
where
    F: Fn(Invocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<RpcYield>> + Send,
{
    async fn invoke(&self, invocation: Invocation) -> Result<RpcYield> {
        self(invocation).await
    }
}
