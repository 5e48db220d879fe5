use futures::{future::BoxFuture, stream::FuturesUnordered, StreamExt};
use std::{fmt, future::Future, time::Duration};
use tokio::time::{timeout_at, Instant};

/// Why a race was not won by a success.
#[derive(Debug)]
pub enum RaceError<E> {
    /// The deadline settled first.
    Timeout(Duration),
    /// The first producer to settle failed.
    Failed(E),
    /// The first producer to settle panicked or was aborted.
    Lost(String),
}

impl<E: fmt::Display> fmt::Display for RaceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaceError::Timeout(d) => write!(f, "timed out after {}ms", d.as_millis()),
            RaceError::Failed(e) => write!(f, "{}", e),
            RaceError::Lost(e) => write!(f, "producer lost: {}", e),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RaceError<E> {}

pub type Producer<T, E> = BoxFuture<'static, Result<T, E>>;

/// Runs every producer concurrently and returns whichever settles first,
/// success or failure, bounded by `deadline`.
///
/// Producers are spawned onto the runtime and detached: when the race is decided
/// the losers keep running to completion and their side effects still land, only
/// their results are discarded.
///
/// Returns `None` when there is nothing to race.
pub async fn race<T, E>(
    producers: Vec<Producer<T, E>>,
    deadline: Duration,
) -> Option<Result<T, RaceError<E>>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    if producers.is_empty() {
        return None;
    }

    let expires = Instant::now() + deadline;
    let mut running: FuturesUnordered<_> = producers.into_iter().map(tokio::spawn).collect();

    // Dropping `running` detaches the losers; a dropped `JoinHandle` never aborts.
    let first = timeout_at(expires, running.next()).await;

    Some(match first {
        Ok(Some(Ok(Ok(value)))) => Ok(value),
        Ok(Some(Ok(Err(e)))) => Err(RaceError::Failed(e)),
        Ok(Some(Err(e))) => Err(RaceError::Lost(e.to_string())),
        Ok(None) | Err(_) => Err(RaceError::Timeout(deadline)),
    })
}

/// Bounds a single future by an absolute instant. Unlike [`race`], the future is
/// dropped when the instant passes.
pub async fn deadline_at<F: Future>(expires: Instant, fut: F) -> Option<F::Output> {
    timeout_at(expires, fut).await.ok()
}
