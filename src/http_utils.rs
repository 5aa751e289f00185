use anyhow::{anyhow, Result};
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, Limited};

pub fn body_full(content: impl Into<Bytes>) -> BoxBody<Bytes, anyhow::Error> {
    Full::new(content.into()).map_err(|err| anyhow!("{err}")).boxed()
}

pub fn body_empty() -> BoxBody<Bytes, anyhow::Error> {
    body_full(Bytes::new())
}

/// Collect a request body, refusing anything over `limit` bytes.
pub async fn read_body_limited(body: hyper::body::Incoming, limit: usize) -> Result<Bytes> {
    let collected = Limited::new(body, limit)
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read request body: {err}"))?;
    Ok(collected.to_bytes())
}
