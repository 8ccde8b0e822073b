use qkv_proto::v1::Envelope;
use qkv_types::{Address, StatusCode};

/// What a transport eventually reports for one request.
pub type Outcome = Result<Envelope, StatusCode>;

/// Two-outcome completion handler registered with a transport.
///
/// Both `success` and `failure` consume the handler, so a transport can
/// resolve a request at most once.
pub struct ResponseHandler {
    complete: Box<dyn FnOnce(Outcome) + Send>,
}

impl ResponseHandler {
    pub fn new(complete: impl FnOnce(Outcome) + Send + 'static) -> Self {
        ResponseHandler { complete: Box::new(complete) }
    }

    pub fn success(self, response: Envelope) {
        (self.complete)(Ok(response))
    }

    pub fn failure(self, code: StatusCode) {
        (self.complete)(Err(code))
    }
}

/// Cancellable registration of an in-flight request.
///
/// Dropping an armed registration cancels it, so a caller that abandons a
/// call (timeout, client close, dropped future) never leaves the transport
/// holding a pending request.
pub struct Registration {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Registration {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Registration { cancel: Some(Box::new(cancel)) }
    }

    /// A registration with nothing left to cancel.
    pub fn detached() -> Self {
        Registration { cancel: None }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// The request resolved; disarm without cancelling.
    pub fn release(mut self) {
        self.cancel = None;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Message transport the client sends through.
///
/// Implementations must be safe for concurrent sends and must invoke each
/// handler at most once. Responses arriving after cancellation must be
/// discarded (or delivered to a handler whose receiver is gone).
pub trait Transport: Send + Sync + 'static {
    fn send_request(&self, to: &Address, request: Envelope, handler: ResponseHandler) -> Registration;
}
