use async_trait::async_trait;
use futures::future::BoxFuture;
use log::trace;
use std::{future::Future, time::Duration};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::TunnelError;

const RELEASE_GRACE: Duration = Duration::from_millis(500);

/// Tear-down step for a half-built transport.
#[async_trait]
pub trait Release: Send + Sized {
    async fn release(self);
}

#[async_trait]
impl<T> Release for T
where
    T: AsyncWrite + Unpin + Send,
{
    async fn release(mut self) {
        // A peer that never answers must not hold the release step open.
        if let Err(e) = tokio::time::timeout(RELEASE_GRACE, self.shutdown()).await {
            trace!("release shutdown skipped: {}", e);
        }
    }
}

/// Acquires a resource, runs `use_step` on it and hands it back on success.
///
/// On failure the resource is released before the error, tagged with `context`,
/// propagates. No path leaves a half-negotiated resource behind.
pub async fn bracket<R, A, U>(acquire: A, use_step: U, context: &str) -> Result<R, TunnelError>
where
    R: Release,
    A: Future<Output = Result<R, TunnelError>>,
    U: for<'a> FnOnce(&'a mut R) -> BoxFuture<'a, Result<(), TunnelError>>,
{
    let mut resource = acquire.await.map_err(|e| e.context(context))?;

    match use_step(&mut resource).await {
        Ok(()) => Ok(resource),
        Err(e) => {
            resource.release().await;
            Err(e.context(context))
        }
    }
}
