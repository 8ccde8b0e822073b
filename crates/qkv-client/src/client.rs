use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use qkv_proto::Request;
use qkv_types::{Address, KvError};

use crate::call;
use crate::transport::Transport;

/// Round-robin over the configured endpoints.
pub struct EndpointBalancer {
    endpoints: Vec<Address>,
    next: AtomicUsize,
}

impl EndpointBalancer {
    pub fn new(endpoints: Vec<Address>) -> Result<Self, KvError> {
        if endpoints.is_empty() {
            return Err(KvError::InvalidArgument("at least one endpoint is required".into()));
        }
        Ok(EndpointBalancer { endpoints, next: AtomicUsize::new(0) })
    }

    pub fn next(&self) -> &Address {
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        &self.endpoints[i % self.endpoints.len()]
    }

    pub fn endpoints(&self) -> &[Address] {
        &self.endpoints
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    endpoints: EndpointBalancer,
    request_timeout: Duration,
    closed: watch::Sender<bool>,
}

/// Handle through which entries, transactions and trees talk to the store.
///
/// Cheap to clone; all clones share the transport, the endpoint rotation and
/// the closed flag.
#[derive(Clone)]
pub struct ContextClient {
    inner: Arc<Inner>,
}

impl ContextClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        endpoints: Vec<Address>,
        request_timeout: Duration,
    ) -> Result<Self, KvError> {
        let (closed, _) = watch::channel(false);
        Ok(ContextClient {
            inner: Arc::new(Inner {
                transport,
                endpoints: EndpointBalancer::new(endpoints)?,
                request_timeout,
                closed,
            }),
        })
    }

    pub fn request_timeout(&self) -> Duration {
        self.inner.request_timeout
    }

    pub fn endpoints(&self) -> &[Address] {
        self.inner.endpoints.endpoints()
    }

    /// Send with the client's default timeout.
    pub async fn request<Q: Request>(&self, request: Q) -> Result<Q::Response, KvError> {
        self.request_with_timeout(request, Some(self.inner.request_timeout))
            .await
    }

    /// Send with an explicit timeout; `None` waits until the store answers.
    pub async fn request_with_timeout<Q: Request>(
        &self,
        request: Q,
        timeout: Option<Duration>,
    ) -> Result<Q::Response, KvError> {
        let mut closed = self.inner.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(KvError::Closed);
        }
        let to = self.inner.endpoints.next();
        tokio::select! {
            result = call::send_request(self.inner.transport.as_ref(), to, &request, timeout) => result,
            _ = closed.wait_for(|closed| *closed) => {
                tracing::debug!(kind = ?Q::KIND, %to, "request abandoned on client close");
                Err(KvError::Closed)
            }
        }
    }

    /// Cancels every outstanding call; they resolve with [`KvError::Closed`].
    /// Later requests fail immediately.
    pub fn close(&self) {
        self.inner.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }
}
