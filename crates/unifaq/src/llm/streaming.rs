//! Lazy token sequence produced by streaming generation.

use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Finite, non-restartable sequence of generated tokens. The producer
/// side closes the channel after the last token.
pub struct TokenStream {
    receiver: mpsc::Receiver<String>,
}

impl TokenStream {
    pub fn new(receiver: mpsc::Receiver<String>) -> Self {
        Self { receiver }
    }

    pub async fn next(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    /// Drain the stream into a single string (one-shot consumption).
    pub async fn collect(mut self) -> String {
        let mut result = String::new();
        while let Some(token) = self.next().await {
            result.push_str(&token);
        }
        result
    }
}

impl Stream for TokenStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
