use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use qkv_types::{Address, KvError, Quorum};

use crate::client::ContextClient;
use crate::grpc::GrpcTransport;
use crate::transport::Transport;

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub endpoints: Vec<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_n")]
    pub n: u8,
    #[serde(default = "default_rw")]
    pub r: u8,
    #[serde(default = "default_rw")]
    pub w: u8,
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_n() -> u8 {
    3
}

fn default_rw() -> u8 {
    2
}

impl ClientConfig {
    pub fn addresses(&self) -> Result<Vec<Address>, KvError> {
        self.endpoints.iter().map(|e| e.parse()).collect()
    }

    pub fn quorum(&self) -> Result<Quorum, KvError> {
        Quorum::new(self.n, self.r, self.w)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl ContextClient {
    pub fn from_config(transport: Arc<dyn Transport>, config: &ClientConfig) -> Result<Self, KvError> {
        ContextClient::new(transport, config.addresses()?, config.request_timeout())
    }

    /// Client over gRPC. Connections are opened on first use.
    pub fn connect(config: &ClientConfig) -> Result<Self, KvError> {
        let transport = Arc::new(GrpcTransport::new(config.request_timeout()));
        ContextClient::from_config(transport, config)
    }
}

#[cfg(test)]
mod tests {
    use figment::providers::{Format, Toml};
    use figment::Figment;

    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: ClientConfig = Figment::new()
            .merge(Toml::string(r#"endpoints = ["127.0.0.1:17400"]"#))
            .extract()
            .unwrap();
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.quorum().unwrap(), Quorum::default());
        assert_eq!(config.addresses().unwrap()[0].as_str(), "http://127.0.0.1:17400");
    }
}
