//! Turns a fire-and-forget transport send into an awaitable typed result.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use qkv_proto::v1::Envelope;
use qkv_proto::Request;
use qkv_types::{Address, KvError};

use crate::transport::{ResponseHandler, Transport};

/// Sends `request` to `to` and waits for exactly one of: a typed response,
/// a status failure, or the timeout.
///
/// `timeout == None` waits indefinitely. On timeout the transport
/// registration is cancelled; a late response then lands on a closed channel
/// and is dropped. No retries happen here.
pub async fn send_request<Q: Request>(
    transport: &dyn Transport,
    to: &Address,
    request: &Q,
    timeout: Option<Duration>,
) -> Result<Q::Response, KvError> {
    let deadline = timeout.map(|limit| Instant::now() + limit);
    let (tx, rx) = oneshot::channel();
    let registration = transport.send_request(
        to,
        Envelope::for_request(request),
        ResponseHandler::new(move |outcome| {
            // Receiver gone means the call already resolved another way.
            let _ = tx.send(outcome);
        }),
    );

    let received = match deadline {
        Some(at) => match tokio::time::timeout_at(at, rx).await {
            Ok(received) => received,
            Err(_) => {
                tracing::debug!(kind = ?Q::KIND, %to, "request timed out");
                registration.cancel();
                return Err(KvError::Timeout);
            }
        },
        None => rx.await,
    };
    registration.release();

    match received {
        Ok(Ok(envelope)) => {
            if envelope.kind != Q::KIND as u32 {
                return Err(KvError::Codec(format!(
                    "expected {:?} response, got kind {:#04x}",
                    Q::KIND,
                    envelope.kind
                )));
            }
            envelope.decode_as()
        }
        Ok(Err(code)) => {
            tracing::debug!(kind = ?Q::KIND, %to, code, "request failed");
            Err(KvError::from_code(code, request.transaction()))
        }
        Err(_) => Err(KvError::Disconnected),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use qkv_proto::v1;
    use qkv_proto::RequestKind;
    use qkv_types::code;

    use super::*;
    use crate::transport::{Outcome, Registration};

    /// Holds on to every handler without answering and counts cancellations.
    #[derive(Default)]
    struct Silent {
        pending: Mutex<Vec<ResponseHandler>>,
        cancels: Arc<AtomicUsize>,
    }

    impl Transport for Silent {
        fn send_request(&self, _to: &Address, _req: Envelope, handler: ResponseHandler) -> Registration {
            self.pending.lock().unwrap().push(handler);
            let cancels = self.cancels.clone();
            Registration::new(move || {
                cancels.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    /// Answers synchronously with a canned outcome.
    struct Canned {
        outcome: Box<dyn Fn() -> Outcome + Send + Sync>,
        cancels: Arc<AtomicUsize>,
    }

    impl Transport for Canned {
        fn send_request(&self, _to: &Address, _req: Envelope, handler: ResponseHandler) -> Registration {
            match (self.outcome)() {
                Ok(env) => handler.success(env),
                Err(code) => handler.failure(code),
            }
            let cancels = self.cancels.clone();
            Registration::new(move || {
                cancels.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    /// Drops every handler without invoking it.
    struct Dropping;

    impl Transport for Dropping {
        fn send_request(&self, _to: &Address, _req: Envelope, _handler: ResponseHandler) -> Registration {
            Registration::detached()
        }
    }

    fn addr() -> Address {
        "127.0.0.1:1".parse().unwrap()
    }

    fn get_request() -> v1::GetRequest {
        v1::GetRequest { replicas: None, key: b"k".to_vec() }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_registration_once() {
        let transport = Silent::default();
        let result = send_request(
            &transport,
            &addr(),
            &get_request(),
            Some(Duration::from_millis(50)),
        )
        .await;
        assert_eq!(result, Err(KvError::Timeout));
        assert_eq!(transport.cancels.load(Ordering::SeqCst), 1);

        // A response that shows up after the timeout goes nowhere.
        let late = transport.pending.lock().unwrap().pop().unwrap();
        late.success(Envelope::reply(RequestKind::Get, &v1::GetResponse::default()));
        assert_eq!(transport.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_decodes_without_cancelling() {
        let cancels = Arc::new(AtomicUsize::new(0));
        let transport = Canned {
            outcome: Box::new(|| {
                Ok(Envelope::reply(
                    RequestKind::Get,
                    &v1::GetResponse { version: 4, value: Some(b"v".to_vec()) },
                ))
            }),
            cancels: cancels.clone(),
        };
        let resp = send_request(&transport, &addr(), &get_request(), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(resp.version, 4);
        assert_eq!(resp.value.as_deref(), Some(&b"v"[..]));
        assert_eq!(cancels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_code_becomes_typed_error() {
        let transport = Canned {
            outcome: Box::new(|| Err(code::TR_INTERRUPTED)),
            cancels: Arc::default(),
        };
        let req = v1::CommitTransactionRequest { index: 12 };
        let err = send_request(&transport, &addr(), &req, None).await.unwrap_err();
        assert_eq!(err, KvError::TransactionInterrupted { index: 12 });

        let transport = Canned {
            outcome: Box::new(|| Err(999)),
            cancels: Arc::default(),
        };
        let err = send_request(&transport, &addr(), &get_request(), None).await.unwrap_err();
        assert_eq!(err, KvError::Status { code: 999 });
    }

    #[tokio::test]
    async fn mismatched_kind_is_rejected() {
        let transport = Canned {
            outcome: Box::new(|| Ok(Envelope::reply(RequestKind::Set, &v1::SetResponse::default()))),
            cancels: Arc::default(),
        };
        let err = send_request(&transport, &addr(), &get_request(), None).await.unwrap_err();
        assert!(matches!(err, KvError::Codec(_)));
    }

    #[tokio::test]
    async fn dropped_handler_reports_disconnect() {
        let err = send_request(&Dropping, &addr(), &get_request(), Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert_eq!(err, KvError::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_call_cancels_on_drop() {
        let transport = Silent::default();
        let (to, req) = (addr(), get_request());
        let call = send_request(&transport, &to, &req, None);
        let _ = tokio::time::timeout(Duration::from_millis(10), call).await;
        assert_eq!(transport.cancels.load(Ordering::SeqCst), 1);
    }
}
