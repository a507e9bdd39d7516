use async_trait::async_trait;
use reqwest::{Request, Response};

/// Sends one prepared request for the download helpers.
///
/// Implementations decide on transport policy (timeouts, proxies); status
/// handling stays with the caller.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: Request) -> reqwest::Result<Response>;
}
