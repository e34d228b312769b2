use std::{future::Future, sync::Arc, time::Duration};

use bytes::Bytes;
use reqwest::{header::RANGE, Client};

use crate::{segment::Segment, util::range::ByteRange, TsumugiError, TsumugiResult};

/// Downloads the data of one segment.
///
/// Failures must be classified through [`TsumugiError::kind`] so the backoff scheduler
/// can tell transient network errors from fatal ones. Dropping the returned future
/// cancels the request.
pub trait SegmentFetcher: Send + Sync + 'static {
    fn fetch(&self, segment: &Segment) -> impl Future<Output = TsumugiResult<Bytes>> + Send;
}

impl<F: SegmentFetcher> SegmentFetcher for Arc<F> {
    fn fetch(&self, segment: &Segment) -> impl Future<Output = TsumugiResult<Bytes>> + Send {
        self.as_ref().fetch(segment)
    }
}

#[derive(Debug, Clone)]
pub struct HttpSegmentFetcher {
    client: Client,
}

impl HttpSegmentFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn with_timeout(timeout: Duration) -> TsumugiResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::new(client))
    }
}

impl Default for HttpSegmentFetcher {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

impl SegmentFetcher for HttpSegmentFetcher {
    fn fetch(&self, segment: &Segment) -> impl Future<Output = TsumugiResult<Bytes>> + Send {
        let empty = segment.byte_range.as_ref().is_some_and(ByteRange::is_empty);
        let mut request = self.client.get(segment.url.clone());
        if let Some(range) = segment.byte_range.as_ref().and_then(ByteRange::to_http_range) {
            request = request.header(RANGE, range);
        }
        let id = segment.id.clone();

        async move {
            if empty {
                tracing::trace!(segment = %id, "Empty byte range, nothing to fetch.");
                return Ok(Bytes::new());
            }
            let response = request.send().await?;
            if !response.status().is_success() {
                let status = response.status();
                if let Ok(body) = response.text().await {
                    tracing::warn!(segment = %id, "Error body: {body}");
                }
                return Err(TsumugiError::HttpError(status));
            }

            let bytes = response.bytes().await?;
            tracing::trace!(segment = %id, size = bytes.len(), "Fetched segment.");
            Ok(bytes)
        }
    }
}
