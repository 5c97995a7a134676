// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::{CompletionRequest, ResponseEvent};

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<ResponseEvent>> + Send>>;

/// Contract for a model backend.
///
/// The runtime always drives providers in streaming mode; callers that want
/// a synchronous reply simply wait for [`ResponseEvent::Final`].  A provider
/// must emit exactly one `Final` event per stream, carrying the fully
/// aggregated reply — deltas are advisory and may be absent.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Human-readable provider name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users and the token tracker.
    fn model_name(&self) -> &str;

    /// Send a completion request and return a streaming response.
    async fn generate(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream>;

    /// Context window size for this provider/model combination, when known.
    fn context_window(&self) -> Option<u32> {
        None
    }
}
