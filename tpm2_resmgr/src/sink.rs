// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Message-passing seams between pipeline stages.

use std::sync::Arc;

/// Receives items pushed by an upstream pipeline stage.
pub trait Sink<T>: Send + Sync {
    /// Accepts `item`. Called inline by the dispatch worker, so it must not
    /// block for long.
    fn enqueue(&self, item: T);
}

/// A pipeline stage with a configurable downstream.
pub trait Source<T> {
    /// Directs this stage's output at `sink`.
    fn add_sink(&self, sink: Arc<dyn Sink<T>>);
}
