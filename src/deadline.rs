//! Deadline bounded provider calls.
//!
//! The pending call is dropped when the deadline fires, so a late answer from
//! the wallet is discarded and the caller sees exactly one outcome. No retry
//! happens here.

use std::{future::Future, time::Duration};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{error::ProviderError, transport::RpcRequest, wrap::WrappedProvider};

/// Default deadline for chain id and account list fetches.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Race `fut` against `deadline`.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| ProviderError::Timeout(deadline))?
}

/// Send `request` through `provider`, failing with [`ProviderError::Timeout`]
/// if it does not settle within `deadline`.
pub async fn call_with_deadline(
    provider: &WrappedProvider,
    request: RpcRequest,
    deadline: Duration,
) -> Result<Value, ProviderError> {
    with_deadline(deadline, provider.request(request)).await
}

/// [`call_with_deadline`] and deserialize the result.
pub async fn call_as_with_deadline<R: DeserializeOwned>(
    provider: &WrappedProvider,
    method: &str,
    params: Vec<Value>,
    deadline: Duration,
) -> Result<R, ProviderError> {
    let value = call_with_deadline(provider, RpcRequest::new(method, params), deadline).await?;
    Ok(serde_json::from_value(value)?)
}
