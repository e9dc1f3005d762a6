use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use url::Url;

use super::EncoderFormat;
use crate::{MotifError, Result};

/// Server-side step that rewrites a recording into the delivery container.
pub trait ContainerNormalizer: Send + Sync {
    /// Returns the normalized bytes. Empty output counts as failure.
    fn normalize(&self, bytes: &[u8], content_type: &str, target: EncoderFormat) -> Result<Vec<u8>>;
}

/// Posts the recording to an HTTP endpoint and reads the converted body.
#[derive(Debug, Clone)]
pub struct HttpNormalizer {
    endpoint: Url,
    client: reqwest::blocking::Client,
}

impl HttpNormalizer {
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint)?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self { endpoint, client })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl ContainerNormalizer for HttpNormalizer {
    fn normalize(&self, bytes: &[u8], content_type: &str, target: EncoderFormat) -> Result<Vec<u8>> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("target", target.extension());

        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, content_type)
            .header(ACCEPT, target.container_mime())
            .body(bytes.to_vec())
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(MotifError::Normalize(format!("server answered {status}")));
        }
        let body = response.bytes()?;
        if body.is_empty() {
            return Err(MotifError::Normalize("server returned an empty body".into()));
        }
        tracing::debug!(endpoint = %self.endpoint, bytes = body.len(), "normalized recording");
        Ok(body.to_vec())
    }
}
