//! Background loop for polling workloads.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

/// Handle to a loop started by [`spawn_loop`]. Dropping it stops the loop.
#[derive(Debug)]
pub struct LoopHandle {
    running: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl LoopHandle {
    /// Asks the loop to stop. The iteration in flight runs to completion.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stops the loop and waits for the current iteration to finish.
    pub async fn join(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                tracing::warn!(%error, "loop task ended abnormally");
            }
        }
    }
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Repeatedly runs `work` until stopped. Each failed iteration is passed to
/// `on_error` and the loop carries on.
pub fn spawn_loop<F, Fut, E, H>(work: F, on_error: H) -> LoopHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Send + 'static,
    H: FnMut(E) + Send + 'static,
{
    spawn_loop_while(|| true, work, on_error)
}

/// [`spawn_loop`] that also ends on its own once `proceed` returns `false`.
/// `proceed` is checked before every iteration.
pub fn spawn_loop_while<P, F, Fut, E, H>(proceed: P, mut work: F, mut on_error: H) -> LoopHandle
where
    P: Fn() -> bool + Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Send + 'static,
    H: FnMut(E) + Send + 'static,
{
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    let task = tokio::spawn(async move {
        while flag.load(Ordering::Acquire) && proceed() {
            if let Err(error) = work().await {
                on_error(error);
            }
            tokio::task::yield_now().await;
        }
    });
    LoopHandle { running, task: Some(task) }
}

/// [`spawn_loop`] with failures logged at `warn`.
pub fn spawn_logged_loop<F, Fut, E>(work: F) -> LoopHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    spawn_loop(work, log_failure)
}

/// [`spawn_loop_while`] with failures logged at `warn`.
pub fn spawn_logged_loop_while<P, F, Fut, E>(proceed: P, work: F) -> LoopHandle
where
    P: Fn() -> bool + Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    spawn_loop_while(proceed, work, log_failure)
}

fn log_failure<E: Display>(error: E) {
    tracing::warn!(%error, "loop iteration failed");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn errors_do_not_stop_the_loop() {
        let runs = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let handle = {
            let runs = runs.clone();
            let errors = errors.clone();
            spawn_loop(
                move || {
                    let n = runs.fetch_add(1, Ordering::SeqCst);
                    async move {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        if n % 2 == 0 {
                            Err(format!("iteration {n}"))
                        } else {
                            Ok(())
                        }
                    }
                },
                move |_| {
                    errors.fetch_add(1, Ordering::SeqCst);
                },
            )
        };
        while runs.load(Ordering::SeqCst) < 6 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(handle.is_running());
        handle.join().await;

        let total = runs.load(Ordering::SeqCst);
        assert!(errors.load(Ordering::SeqCst) >= 3);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), total);
    }

    #[tokio::test]
    async fn drop_stops_the_loop() {
        let runs = Arc::new(AtomicUsize::new(0));
        let handle = {
            let runs = runs.clone();
            spawn_logged_loop(move || {
                runs.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(()) }
            })
        };
        while runs.load(Ordering::SeqCst) < 3 {
            tokio::task::yield_now().await;
        }
        let flag = handle.running.clone();
        drop(handle);
        assert!(!flag.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn loop_ends_when_condition_turns_false() {
        let runs = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));
        let handle = {
            let runs = runs.clone();
            let done = done.clone();
            spawn_logged_loop_while(
                move || !done.load(Ordering::Acquire),
                move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, String>(()) }
                },
            )
        };
        while runs.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        done.store(true, Ordering::Release);
        while handle.is_running() {
            tokio::task::yield_now().await;
        }
        // The handle was never stopped; the loop ended by itself.
        assert!(handle.running.load(Ordering::Acquire));
        let total = runs.load(Ordering::SeqCst);
        tokio::task::yield_now().await;
        assert_eq!(runs.load(Ordering::SeqCst), total);
    }
}
