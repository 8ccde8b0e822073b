use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};

use qkv_proto::v1::gateway_client::GatewayClient;
use qkv_proto::v1::Envelope;
use qkv_proto::STATUS_CODE_METADATA;
use qkv_types::{code, Address, StatusCode};

use crate::transport::{Registration, ResponseHandler, Transport};

/// [`Transport`] over the gRPC `Gateway` service.
///
/// One lazily connected channel per address; each request runs on its own
/// task, and cancelling the registration aborts that task.
pub struct GrpcTransport {
    channels: Mutex<HashMap<Address, Channel>>,
    connect_timeout: Duration,
}

impl GrpcTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        GrpcTransport {
            channels: Mutex::new(HashMap::new()),
            connect_timeout,
        }
    }

    fn channel(&self, to: &Address) -> Result<Channel, tonic::transport::Error> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(channel) = channels.get(to) {
            return Ok(channel.clone());
        }
        let channel = Endpoint::from_shared(to.as_str().to_string())?
            .connect_timeout(self.connect_timeout)
            .connect_lazy();
        channels.insert(to.clone(), channel.clone());
        Ok(channel)
    }
}

impl Transport for GrpcTransport {
    fn send_request(&self, to: &Address, request: Envelope, handler: ResponseHandler) -> Registration {
        let channel = match self.channel(to) {
            Ok(channel) => channel,
            Err(error) => {
                tracing::warn!(%to, %error, "invalid endpoint");
                handler.failure(code::ILLEGAL_ARGUMENT);
                return Registration::detached();
            }
        };
        let task = tokio::spawn(async move {
            match GatewayClient::new(channel).dispatch(request).await {
                Ok(response) => handler.success(response.into_inner()),
                Err(status) => handler.failure(status_code(&status)),
            }
        });
        Registration::new(move || task.abort())
    }
}

/// Store status code carried by `status`, falling back to the gRPC code.
pub fn status_code(status: &Status) -> StatusCode {
    let carried = status
        .metadata()
        .get(STATUS_CODE_METADATA)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    if let Some(code) = carried {
        return code;
    }
    match status.code() {
        Code::DeadlineExceeded => code::TIMEOUT,
        Code::InvalidArgument => code::ILLEGAL_ARGUMENT,
        _ => code::UNEXPECTED_ERROR,
    }
}
