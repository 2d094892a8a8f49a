//! reqwest implementation of [`EndpointProbe`]

use std::time::Duration;

use async_trait::async_trait;

use super::EndpointProbe;
use crate::Error;

/// Per-request timeout for reachability probes
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTPS probe trusting the system roots plus an optional extra CA
#[derive(Clone, Debug, Default)]
pub struct HttpProbe;

impl HttpProbe {
    fn client(&self, ca_pem: Option<Vec<u8>>) -> Result<reqwest::Client, Error> {
        let mut builder = reqwest::Client::builder().timeout(PROBE_TIMEOUT);
        if let Some(pem) = ca_pem {
            let ca = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::validation(format!("invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(ca);
        }
        builder
            .build()
            .map_err(|e| Error::internal("http_probe", format!("failed to build client: {}", e)))
    }
}

#[async_trait]
impl EndpointProbe for HttpProbe {
    async fn get_status(&self, url: &str, ca_pem: Option<Vec<u8>>) -> Result<u16, Error> {
        let response = self
            .client(ca_pem)?
            .get(url)
            .send()
            .await
            .map_err(|e| Error::internal("http_probe", e.to_string()))?;
        Ok(response.status().as_u16())
    }
}

