// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Contract between the remote block stream and the transport layer.
//!
//! Responsibilities:
//! - Defines the pull interface a remote reader exposes: one decoded result
//!   unit per call, plus cancel/close lifecycle and mode introspection.
//! - Defines the fatal error taxonomy the stream surfaces to its consumer.
//!
//! Key exported interfaces:
//! - Types: `RemoteResultSource`, `RemoteResult`, `RemoteResponse`,
//!   `DecodeDetail`, `RemoteStreamError`.

use arrow::datatypes::SchemaRef;
use thiserror::Error;

use crate::exec::chunk::Chunk;
use crate::runtime::execution_summary::ExecutionSummary;

/// Per-fetch bookkeeping, distinct from the row data itself.
#[derive(Copy, Clone, Debug, Default)]
pub struct DecodeDetail {
    pub rows: usize,
    pub packet_bytes: usize,
}

/// Decoded response payload. A syntactically valid response may still carry a
/// remote-side logical failure in `error`, and the last response of a source
/// usually carries the execution summaries.
#[derive(Clone, Debug, Default)]
pub struct RemoteResponse {
    pub error: Option<String>,
    pub execution_summaries: Vec<(String, ExecutionSummary)>,
}

/// One result unit returned by [`RemoteResultSource::next_result`].
#[derive(Debug, Default)]
pub struct RemoteResult {
    /// Transport-level failure message. Set means the call itself failed and
    /// nothing else in the result is meaningful.
    pub error: Option<String>,
    /// All contributors are drained; terminal.
    pub eof: bool,
    pub resp: Option<RemoteResponse>,
    pub blocks: Vec<Chunk>,
    pub decode_detail: DecodeDetail,
    /// Connection index the result came from. Only meaningful for streaming
    /// readers; one-shot readers always report 0.
    pub call_index: usize,
    /// Human-readable request descriptor for logs.
    pub req_info: String,
}

impl RemoteResult {
    pub fn meet_error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn eof() -> Self {
        Self {
            eof: true,
            ..Default::default()
        }
    }
}

/// Pull-based reader over results arriving from other nodes of a distributed
/// query. Implemented by the streaming exchange receiver and the one-shot
/// batch reader; the block stream holds it as a trait object.
pub trait RemoteResultSource: Send + Sync {
    /// Short reader kind name used in stream names and log prefixes.
    fn reader_name(&self) -> &'static str;

    /// Whether this reader streams repeated cumulative reports per connection
    /// (true) or returns one final report per contributor (false). Drives the
    /// summary merge policy and partition forwarding.
    fn is_streaming(&self) -> bool;

    /// Number of independent remote contributors.
    fn source_num(&self) -> usize;

    /// Output schema, fixed for the reader's lifetime.
    fn output_schema(&self) -> SchemaRef;

    /// Fetch the next decoded result unit, blocking on network I/O as needed.
    /// `stream_id` selects the fine-grained shuffle partition for streaming
    /// readers; one-shot readers ignore it.
    fn next_result(&self, stream_id: usize) -> RemoteResult;

    /// Best-effort abort of in-flight remote operations.
    fn cancel(&self);

    /// Release resources. Called exactly once at end-of-life.
    fn close(&self);

    /// Thread-count hooks forwarded to the profiling framework, not
    /// interpreted here.
    fn collect_new_thread_count(&self, cnt: &mut i32) {
        let _ = cnt;
    }

    fn reset_new_thread_count(&self) {}
}

/// Fatal failures surfaced by the remote block stream. Neither kind is retried
/// here; retry policy, if any, lives in the transport layer.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteStreamError {
    /// Transport-level failure reported by the reader (connection loss,
    /// malformed wire data).
    #[error("{prefix}: remote read failed: {message}")]
    RemoteRead { prefix: String, message: String },

    /// A decoded response whose embedded status signals a remote-side logical
    /// failure.
    #[error("{prefix}: remote response error: {message}")]
    RemoteResponse { prefix: String, message: String },
}

impl RemoteStreamError {
    /// The originating source's message, preserved verbatim.
    pub fn message(&self) -> &str {
        match self {
            Self::RemoteRead { message, .. } => message,
            Self::RemoteResponse { message, .. } => message,
        }
    }
}
