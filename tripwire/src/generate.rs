//! The opaque generation call the engine guards.
//!
//! A [`Generator`] is anything that turns [`GenerationParams`] into a
//! [`GenerationResult`]. It must report failure through `Err`, never through
//! a sentinel result. Streaming is optional: the default
//! [`Generator::stream`] wraps a single `generate` call in a one-chunk stream.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::types::{ChunkStream, FinishReason, GenerationParams, GenerationResult, StreamChunk};

/// A model endpoint (or anything shaped like one).
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce one complete result.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails. Errors are not retried.
    async fn generate(
        &self,
        params: &GenerationParams,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult>;

    /// Produce a chunk stream.
    ///
    /// Default implementation falls back to a single `generate` call.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be opened.
    async fn stream(
        &self,
        params: &GenerationParams,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream> {
        let result = self.generate(params, cancel).await?;
        Ok(single_shot(result))
    }
}

#[async_trait]
impl<G: Generator + ?Sized> Generator for Arc<G> {
    async fn generate(
        &self,
        params: &GenerationParams,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult> {
        (**self).generate(params, cancel).await
    }

    async fn stream(
        &self,
        params: &GenerationParams,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream> {
        (**self).stream(params, cancel).await
    }
}

/// A complete result replayed as a text chunk followed by a finish chunk.
#[must_use]
pub fn single_shot(result: GenerationResult) -> ChunkStream {
    let mut chunks = Vec::with_capacity(2);
    if !result.text.is_empty() {
        chunks.push(Ok(StreamChunk::text(result.text)));
    }
    chunks.push(Ok(StreamChunk::Finish {
        reason: result.finish_reason,
        usage: result.usage,
    }));
    Box::pin(futures::stream::iter(chunks))
}

/// Drain a chunk stream into a single result.
///
/// Text deltas are concatenated; the last finish chunk supplies the finish
/// reason and usage.
///
/// # Errors
///
/// Returns the first upstream error, or [`Error::Stream`] for an in-band
/// error chunk.
pub async fn collect_stream(mut stream: ChunkStream) -> Result<GenerationResult> {
    let mut result = GenerationResult::default();
    while let Some(chunk) = stream.next().await {
        match chunk? {
            StreamChunk::TextDelta { delta } => result.text.push_str(&delta),
            StreamChunk::Finish { reason, usage } => {
                result.finish_reason = reason;
                result.usage = usage;
            }
            StreamChunk::Error { message } => return Err(Error::stream(message)),
            StreamChunk::ToolCall { .. } | StreamChunk::Metadata { .. } => {}
        }
    }
    Ok(result)
}

/// [`Generator`] backed by an async closure. See [`generator_fn`].
#[derive(Clone)]
pub struct FnGenerator<F>(F);

impl<F> std::fmt::Debug for FnGenerator<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnGenerator").finish_non_exhaustive()
    }
}

/// Build a [`Generator`] from an async closure.
///
/// ```rust,ignore
/// let generator = generator_fn(|params, _cancel| async move {
///     Ok(GenerationResult::from_text(format!("echo: {:?}", params.prompt)))
/// });
/// ```
pub const fn generator_fn<F, Fut>(f: F) -> FnGenerator<F>
where
    F: Fn(GenerationParams, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<GenerationResult>> + Send + 'static,
{
    FnGenerator(f)
}

#[async_trait]
impl<F, Fut> Generator for FnGenerator<F>
where
    F: Fn(GenerationParams, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<GenerationResult>> + Send + 'static,
{
    async fn generate(
        &self,
        params: &GenerationParams,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult> {
        (self.0)(params.clone(), cancel.clone()).await
    }
}

/// Streaming [`Generator`] backed by an async closure. See [`stream_generator_fn`].
#[derive(Clone)]
pub struct FnStreamGenerator<F>(F);

impl<F> std::fmt::Debug for FnStreamGenerator<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStreamGenerator").finish_non_exhaustive()
    }
}

/// Build a streaming [`Generator`] from an async closure that opens a stream.
///
/// Its `generate` drains the stream with [`collect_stream`].
pub const fn stream_generator_fn<F, Fut>(f: F) -> FnStreamGenerator<F>
where
    F: Fn(GenerationParams, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ChunkStream>> + Send + 'static,
{
    FnStreamGenerator(f)
}

#[async_trait]
impl<F, Fut> Generator for FnStreamGenerator<F>
where
    F: Fn(GenerationParams, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ChunkStream>> + Send + 'static,
{
    async fn generate(
        &self,
        params: &GenerationParams,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult> {
        collect_stream(self.stream(params, cancel).await?).await
    }

    async fn stream(
        &self,
        params: &GenerationParams,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream> {
        (self.0)(params.clone(), cancel.clone()).await
    }
}

/// Chunks from a list of text deltas followed by a `stop` finish.
///
/// Handy for tests and replaying cached responses.
#[must_use]
pub fn text_stream<I, S>(deltas: I) -> ChunkStream
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let chunks: Vec<Result<StreamChunk>> = deltas
        .into_iter()
        .map(|d| Ok(StreamChunk::text(d)))
        .chain(std::iter::once(Ok(StreamChunk::finish(FinishReason::Stop))))
        .collect();
    Box::pin(futures::stream::iter(chunks))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_stream_replays_generate() {
        let generator = generator_fn(|params: GenerationParams, _| async move {
            Ok::<_, Error>(GenerationResult::from_text(
                params.prompt.unwrap_or_default(),
            ))
        });
        let cancel = CancellationToken::new();

        let stream = generator
            .stream(&GenerationParams::from_prompt("hello"), &cancel)
            .await
            .unwrap();
        let chunks: Vec<_> = stream.map(Result::unwrap).collect().await;
        assert_eq!(
            chunks,
            [StreamChunk::text("hello"), StreamChunk::finish(FinishReason::Stop)]
        );
    }

    #[tokio::test]
    async fn test_stream_generator_collects_for_generate() {
        let generator = Arc::new(stream_generator_fn(|_, _| async {
            Ok::<_, Error>(text_stream(["a", "b", "c"]))
        }));
        let result = generator
            .generate(&GenerationParams::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.text, "abc");
        assert_eq!(result.finish_reason, FinishReason::Stop);
    }

    #[tokio::test]
    async fn test_collect_stream_surfaces_error_chunks() {
        let stream: ChunkStream = Box::pin(futures::stream::iter(vec![
            Ok(StreamChunk::text("partial")),
            Ok(StreamChunk::error("provider hung up")),
        ]));
        let err = collect_stream(stream).await.unwrap_err();
        assert!(matches!(err, Error::Stream(msg) if msg == "provider hung up"));
    }
}
