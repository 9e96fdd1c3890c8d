use bytes::Bytes;

use super::VuContext;
use crate::engine::http_client::{HttpRequest, HttpResponse};
use crate::error::ExternalCallError;
use crate::stats::{names, Sample};

impl VuContext {
    /// Send `req` through the shared client and record its outcome.
    ///
    /// Every call adds one `http_reqs` and one `http_req_failed` sample.
    /// Completed exchanges also add their latency to `http_req_duration`
    /// and their byte counts; a status of 400 or above counts as failed.
    /// Transport errors are tallied under `errors` and handed back to the
    /// scenario.
    pub async fn request(&self, req: HttpRequest) -> Result<HttpResponse, ExternalCallError> {
        self.record(Sample::counter(names::HTTP_REQS, 1.0));

        match self.client.request(&req).await {
            Ok(response) => {
                let ms = response.duration.as_secs_f64() * 1000.0;
                self.record(Sample::trend(names::HTTP_REQ_DURATION, ms));
                self.record(Sample::rate(names::HTTP_REQ_FAILED, response.status_code() >= 400));
                self.record(Sample::counter(names::DATA_SENT, response.bytes_sent as f64));
                self.record(Sample::counter(names::DATA_RECEIVED, response.bytes_received as f64));
                Ok(response)
            }
            Err(err) => {
                tracing::debug!(worker = self.worker_id, url = %req.url, error = %err, "request failed");
                self.record(Sample::rate(names::HTTP_REQ_FAILED, true));
                self.record_error(&err.to_string());
                Err(err)
            }
        }
    }

    pub async fn get(&self, url: impl Into<String>) -> Result<HttpResponse, ExternalCallError> {
        self.request(HttpRequest::get(url)).await
    }

    pub async fn post(
        &self,
        url: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Result<HttpResponse, ExternalCallError> {
        self.request(HttpRequest::post(url, body)).await
    }
}
