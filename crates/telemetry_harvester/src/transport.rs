use crate::error::TransportError;
use crate::request::HarvestRequest;
use crate::retry::HarvestResponse;
use reqwest::header::RETRY_AFTER;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sends harvest requests to the ingestion backend.
///
/// Uses native async fn in traits instead of `#[async_trait]`. Implementors
/// receive the harvest's cancellation token and may abort early, but should
/// report the abort as [`TransportError::Cancelled`] rather than hiding it.
///
/// # Note on Object Safety
///
/// This trait uses `impl Future` return types which are not object-safe.
/// For dynamic dispatch, use `Arc<dyn TransportBoxed>`.
pub trait Transport: Send + Sync {
    /// Sends one request and returns the status and `Retry-After` header.
    fn send(
        &self,
        request: &HarvestRequest,
        ctx: &CancellationToken,
    ) -> impl Future<Output = Result<HarvestResponse, TransportError>> + Send;

    /// Returns the transport name for debugging.
    fn name(&self) -> &str;
}

/// Object-safe version of [`Transport`] for dynamic dispatch.
pub trait TransportBoxed: Send + Sync {
    /// Sends one request (boxed future for object safety).
    fn send_boxed<'a>(
        &'a self,
        request: &'a HarvestRequest,
        ctx: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<HarvestResponse, TransportError>> + Send + 'a>>;

    /// Returns the transport name for debugging.
    fn name(&self) -> &str;
}

/// Blanket implementation: any Transport can be used as TransportBoxed
impl<T: Transport> TransportBoxed for T {
    fn send_boxed<'a>(
        &'a self,
        request: &'a HarvestRequest,
        ctx: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<HarvestResponse, TransportError>> + Send + 'a>> {
        Box::pin(self.send(request, ctx))
    }

    fn name(&self) -> &str {
        Transport::name(self)
    }
}

/// Default transport backed by a shared `reqwest::Client`.
///
/// `Client::clone()` is an `Arc` increment, so one client can be shared by
/// several harvesters.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Request timeout applied by the default client.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Wraps an existing client.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Self::DEFAULT_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

fn classify(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Http(err.to_string())
    }
}

impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: &HarvestRequest,
        ctx: &CancellationToken,
    ) -> Result<HarvestResponse, TransportError> {
        let exchange = async {
            let resp = self
                .client
                .request(request.method.clone(), request.url.clone())
                .headers(request.headers.clone())
                .body(request.body.clone())
                .send()
                .await
                .map_err(|e| classify(&e))?;

            let status = resp.status().as_u16();
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            // Drain so the connection returns to the pool.
            let _ = resp.bytes().await;
            Ok(HarvestResponse::new(status, retry_after))
        };

        tokio::select! {
            biased;
            result = exchange => result,
            () = ctx.cancelled() => Err(TransportError::Cancelled),
        }
    }

    fn name(&self) -> &str {
        "reqwest"
    }
}
