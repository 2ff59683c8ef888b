use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::{BoxStream, Stream};

use crate::engine::RequestCompletion;
use crate::ProxyError;

/// Body pipe for streamed responses.
///
/// Forwards upstream frames through the chunk hook inline, so the client
/// sees chunks at the cadence the upstream emitted them, and fires the
/// terminal hook exactly once: on end of stream, on a relay error, or on
/// teardown when the client goes away before the stream finishes.
pub(crate) struct RelayBody {
    upstream: BoxStream<'static, reqwest::Result<Bytes>>,
    completion: Option<RequestCompletion>,
}

impl RelayBody {
    pub(crate) fn new(
        upstream: BoxStream<'static, reqwest::Result<Bytes>>,
        completion: RequestCompletion,
    ) -> Self {
        Self {
            upstream,
            completion: Some(completion),
        }
    }

    fn finish(&mut self, error: Option<ProxyError>) {
        if let Some(completion) = self.completion.take() {
            completion.finish(error);
        }
    }
}

impl Stream for RelayBody {
    type Item = Result<Bytes, ProxyError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();
        match Pin::new(&mut this.upstream).poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                let chunk = match this.completion.as_mut() {
                    Some(completion) => completion.apply_chunk_hook(chunk),
                    None => chunk,
                };
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                let message = err.to_string();
                this.finish(Some(ProxyError::Body(message.clone())));
                Poll::Ready(Some(Err(ProxyError::Body(message))))
            }
            Poll::Ready(None) => {
                this.finish(None);
                Poll::Ready(None)
            }
        }
    }
}

impl Drop for RelayBody {
    fn drop(&mut self) {
        // Only reachable when neither end-of-stream nor a relay error got
        // there first, i.e. the client hung up mid-stream.
        self.finish(Some(ProxyError::ClientDisconnected));
    }
}
