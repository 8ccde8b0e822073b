use std::future::Future;

use qkv_types::KvError;

/// A resource that must be finalized once, knowing whether the work done
/// with it failed.
pub trait AsyncClose {
    fn close(&self, failed: bool) -> impl Future<Output = Result<(), KvError>> + Send;

    /// Starts a failed close without waiting for it. Used when a scope is
    /// dropped or unwinds before its own `close` finished.
    fn close_detached(&self);
}

// Armed until the scope's own close has returned.
struct CloseGuard<'a, T: AsyncClose> {
    resource: &'a T,
    armed: bool,
}

impl<T: AsyncClose> Drop for CloseGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!("scope abandoned before close; closing as failed");
            self.resource.close_detached();
        }
    }
}

/// Runs `action` with `resource`, then closes the resource exactly once:
/// `close(false)` after success, `close(true)` after failure.
///
/// A failed action's error is returned as is; a close error raised while
/// unwinding it is only logged. A close error after a successful action is
/// returned.
///
/// If the returned future is dropped early (a caller timeout, `select!`,
/// task abort) or `action` panics, the resource is closed as failed through
/// [`AsyncClose::close_detached`].
pub async fn use_scope<'a, T, R, E, F, Fut>(resource: &'a T, action: F) -> Result<R, E>
where
    T: AsyncClose + Sync,
    E: From<KvError>,
    F: FnOnce(&'a T) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let mut guard = CloseGuard { resource, armed: true };
    let result = match action(resource).await {
        Ok(value) => resource.close(false).await.map(|()| value).map_err(E::from),
        Err(error) => {
            if let Err(close_error) = resource.close(true).await {
                tracing::warn!(error = %close_error, "close after failed scope did not complete");
            }
            Err(error)
        }
    };
    guard.armed = false;
    result
}
