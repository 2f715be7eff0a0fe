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
//! Remote block stream for receiving distributed upstream data.
//!
//! Responsibilities:
//! - Pulls decoded result units from a remote reader and hands row chunks to
//!   the consuming operator one at a time.
//! - Merges execution summaries and connection counters carried alongside the
//!   data, and exposes them to concurrent profile reporters.
//! - Handles end-of-stream, cancellation, and fatal error propagation.
//!
//! Key exported interfaces:
//! - Types: `RemoteBlockStream`.
//!
//! Current limitations:
//! - Chunks are forwarded exactly as the reader decoded them; no re-batching
//!   is applied before delivery.

use std::collections::VecDeque;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;

use crate::exec::chunk::Chunk;
use crate::rockflow_logging::{debug, trace, warn};
use crate::runtime::execution_summary::{
    ConnectionProfileInfo, ExecutionSummary, ExecutionSummaryTable,
};
use crate::runtime::remote_source::{RemoteResultSource, RemoteStreamError};

/// Adapter that turns a [`RemoteResultSource`] into a lazily produced sequence
/// of row chunks.
///
/// Runs on the single thread of its consuming operator; only the execution
/// summary table is shared with concurrent observers (see
/// [`ExecutionSummaryTable`] for the publish protocol).
pub struct RemoteBlockStream {
    reader: Arc<dyn RemoteResultSource>,
    source_num: usize,
    connection_profile_infos: Vec<ConnectionProfileInfo>,
    schema: SchemaRef,
    block_queue: VecDeque<Chunk>,
    execution_summaries: Arc<ExecutionSummaryTable>,
    name: String,
    log_prefix: String,
    total_rows: u64,
    finished: bool,
    // For fine grained shuffle, the sender partitions data into multiple
    // streams by hashing; a streaming reader only returns stream `stream_id`.
    // One-shot readers ignore it.
    stream_id: usize,
}

impl RemoteBlockStream {
    pub fn new(
        reader: Arc<dyn RemoteResultSource>,
        req_id: &str,
        executor_id: &str,
        stream_id: usize,
    ) -> Self {
        let source_num = reader.source_num();
        let schema = reader.output_schema();
        let name = format!("RemoteBlockStream({})", reader.reader_name());
        let log_prefix = format!("{name} req_id={req_id} executor_id={executor_id}");
        Self {
            reader,
            source_num,
            connection_profile_infos: vec![ConnectionProfileInfo::default(); source_num],
            schema,
            block_queue: VecDeque::new(),
            execution_summaries: Arc::new(ExecutionSummaryTable::new(source_num)),
            name,
            log_prefix,
            total_rows: 0,
            finished: false,
            stream_id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    /// Pop the next chunk, refilling the queue from the reader when empty.
    /// `Ok(None)` is terminal end-of-stream.
    pub fn next_block(&mut self) -> Result<Option<Chunk>, RemoteStreamError> {
        if self.finished {
            return Ok(None);
        }
        if self.block_queue.is_empty() && !self.fetch_remote_result()? {
            self.finished = true;
            return Ok(None);
        }
        // todo should merge some blocks to make sure the output block is big enough
        Ok(self.block_queue.pop_front())
    }

    /// Refill the queue with one non-empty fetch. Returns false on
    /// end-of-stream. Empty payloads (statistics-only packets) are skipped by
    /// looping, so a peer emitting many of them cannot grow the stack.
    fn fetch_remote_result(&mut self) -> Result<bool, RemoteStreamError> {
        loop {
            let result = self.reader.next_result(self.stream_id);
            if let Some(message) = result.error {
                warn!("{}: remote reader meets error: {}", self.log_prefix, message);
                return Err(RemoteStreamError::RemoteRead {
                    prefix: self.log_prefix.clone(),
                    message,
                });
            }
            if result.eof {
                return Ok(false);
            }
            if let Some(resp) = result.resp.as_ref() {
                if let Some(message) = resp.error.as_ref() {
                    warn!("{}: remote reader meets error: {}", self.log_prefix, message);
                    return Err(RemoteStreamError::RemoteResponse {
                        prefix: self.log_prefix.clone(),
                        message: message.clone(),
                    });
                }
                // Only the last response of a source carries execution
                // summaries. Streaming readers report per-connection slots;
                // one-shot readers all accumulate into slot 0.
                if self.reader.is_streaming() {
                    self.execution_summaries
                        .merge(result.call_index, &resp.execution_summaries, true);
                } else {
                    self.execution_summaries
                        .merge(0, &resp.execution_summaries, false);
                }
            }

            let index = if self.reader.is_streaming() {
                result.call_index
            } else {
                0
            };
            if let Some(info) = self.connection_profile_infos.get_mut(index) {
                info.packets += 1;
                info.bytes += result.decode_detail.packet_bytes as u64;
            }

            self.total_rows += result.decode_detail.rows as u64;
            trace!(
                "{}: recv {} rows from remote for {}, total recv row num: {}",
                self.log_prefix, result.decode_detail.rows, result.req_info, self.total_rows
            );
            if result.decode_detail.rows == 0 {
                continue;
            }
            self.block_queue.extend(result.blocks);
            return Ok(true);
        }
    }

    /// Ordinary shutdown drains via end-of-stream; only a forceful kill
    /// interrupts outstanding remote calls.
    pub fn cancel(&mut self, kill: bool) {
        if kill {
            self.reader.cancel();
        }
    }

    /// Terminal lifecycle hook; closes the underlying reader.
    pub fn close(&mut self) {
        debug!(
            "{}: finish read {} rows from remote",
            self.log_prefix, self.total_rows
        );
        self.reader.close();
    }

    pub fn source_num(&self) -> usize {
        self.source_num
    }

    pub fn is_streaming(&self) -> bool {
        self.reader.is_streaming()
    }

    pub fn total_rows(&self) -> u64 {
        self.total_rows
    }

    pub fn connection_profile_infos(&self) -> &[ConnectionProfileInfo] {
        &self.connection_profile_infos
    }

    /// Shared handle for profile reporters running on other threads.
    pub fn execution_summary_table(&self) -> Arc<ExecutionSummaryTable> {
        Arc::clone(&self.execution_summaries)
    }

    /// Value snapshot of one source's summaries, or `None` until that slot is
    /// published. Never a partially built view.
    pub fn remote_execution_summaries(
        &self,
        index: usize,
    ) -> Option<std::collections::HashMap<String, ExecutionSummary>> {
        self.execution_summaries.snapshot(index)
    }

    pub fn collect_new_thread_count(&self, cnt: &mut i32) {
        self.reader.collect_new_thread_count(cnt);
    }

    pub fn reset_new_thread_count(&self) {
        self.reader.reset_new_thread_count();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use arrow::array::{Int64Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

    use super::RemoteBlockStream;
    use crate::exec::chunk::Chunk;
    use crate::runtime::execution_summary::ExecutionSummary;
    use crate::runtime::remote_source::{
        DecodeDetail, RemoteResponse, RemoteResult, RemoteResultSource, RemoteStreamError,
    };

    fn test_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]))
    }

    fn chunk_of(values: Vec<i64>) -> Chunk {
        let batch =
            RecordBatch::try_new(test_schema(), vec![Arc::new(Int64Array::from(values))])
                .expect("batch");
        Chunk::new(batch)
    }

    fn data_result(call_index: usize, values: Vec<i64>) -> RemoteResult {
        let chunk = chunk_of(values);
        let rows = chunk.len();
        RemoteResult {
            resp: Some(RemoteResponse::default()),
            decode_detail: DecodeDetail {
                rows,
                packet_bytes: rows * 8,
            },
            blocks: vec![chunk],
            call_index,
            req_info: format!("test source {call_index}"),
            ..Default::default()
        }
    }

    struct ScriptedSource {
        streaming: bool,
        source_num: usize,
        script: Mutex<std::collections::VecDeque<RemoteResult>>,
        cancel_calls: AtomicUsize,
        close_calls: AtomicUsize,
        seen_stream_ids: Mutex<Vec<usize>>,
    }

    impl ScriptedSource {
        fn new(streaming: bool, source_num: usize, script: Vec<RemoteResult>) -> Self {
            Self {
                streaming,
                source_num,
                script: Mutex::new(script.into()),
                cancel_calls: AtomicUsize::new(0),
                close_calls: AtomicUsize::new(0),
                seen_stream_ids: Mutex::new(Vec::new()),
            }
        }
    }

    impl RemoteResultSource for ScriptedSource {
        fn reader_name(&self) -> &'static str {
            "Scripted"
        }

        fn is_streaming(&self) -> bool {
            self.streaming
        }

        fn source_num(&self) -> usize {
            self.source_num
        }

        fn output_schema(&self) -> SchemaRef {
            test_schema()
        }

        fn next_result(&self, stream_id: usize) -> RemoteResult {
            self.seen_stream_ids.lock().expect("lock").push(stream_id);
            self.script
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(RemoteResult::eof)
        }

        fn cancel(&self) {
            self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        }

        fn close(&self) {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn delivers_blocks_in_order_and_counts_rows() {
        let source = Arc::new(ScriptedSource::new(
            true,
            2,
            vec![data_result(0, vec![1, 2, 3]), data_result(1, vec![4, 5])],
        ));
        let mut stream = RemoteBlockStream::new(Arc::clone(&source) as Arc<dyn RemoteResultSource>, "req-1", "exec-1", 0);

        let first = stream.next_block().expect("ok").expect("chunk");
        assert_eq!(first.len(), 3);
        let second = stream.next_block().expect("ok").expect("chunk");
        assert_eq!(second.len(), 2);
        assert!(stream.next_block().expect("ok").is_none());

        assert_eq!(stream.total_rows(), 5);
        let infos = stream.connection_profile_infos();
        assert_eq!(infos[0].packets, 1);
        assert_eq!(infos[0].bytes, 24);
        assert_eq!(infos[1].packets, 1);
        assert_eq!(infos[1].bytes, 16);
    }

    #[test]
    fn empty_payloads_are_skipped_not_terminal() {
        let empty = |call_index| RemoteResult {
            resp: Some(RemoteResponse::default()),
            decode_detail: DecodeDetail {
                rows: 0,
                packet_bytes: 4,
            },
            call_index,
            req_info: "empty packet".to_string(),
            ..Default::default()
        };
        let source = Arc::new(ScriptedSource::new(
            true,
            1,
            vec![empty(0), empty(0), data_result(0, vec![7])],
        ));
        let mut stream = RemoteBlockStream::new(Arc::clone(&source) as Arc<dyn RemoteResultSource>, "req-1", "exec-1", 0);

        let chunk = stream.next_block().expect("ok").expect("chunk");
        assert_eq!(chunk.len(), 1);
        // Empty packets still count toward connection profile bookkeeping.
        assert_eq!(stream.connection_profile_infos()[0].packets, 3);
        assert!(stream.next_block().expect("ok").is_none());
    }

    #[test]
    fn transport_failure_is_fatal_with_verbatim_message() {
        let source = Arc::new(ScriptedSource::new(
            true,
            1,
            vec![RemoteResult::meet_error("connection reset by peer")],
        ));
        let mut stream = RemoteBlockStream::new(Arc::clone(&source) as Arc<dyn RemoteResultSource>, "req-1", "exec-1", 0);
        let err = stream.next_block().expect_err("fatal");
        match &err {
            RemoteStreamError::RemoteRead { message, .. } => {
                assert_eq!(message, "connection reset by peer");
            }
            other => panic!("unexpected error kind: {other:?}"),
        }
        assert!(err.to_string().contains("req_id=req-1"));
    }

    #[test]
    fn response_error_is_fatal() {
        let result = RemoteResult {
            resp: Some(RemoteResponse {
                error: Some("remote executor failed".to_string()),
                execution_summaries: Vec::new(),
            }),
            ..Default::default()
        };
        let source = Arc::new(ScriptedSource::new(false, 1, vec![result]));
        let mut stream = RemoteBlockStream::new(Arc::clone(&source) as Arc<dyn RemoteResultSource>, "req-1", "exec-1", 0);
        let err = stream.next_block().expect_err("fatal");
        assert!(matches!(err, RemoteStreamError::RemoteResponse { .. }));
        assert_eq!(err.message(), "remote executor failed");
    }

    #[test]
    fn streaming_summaries_land_in_per_connection_slots() {
        let mut with_summary = data_result(1, vec![1]);
        with_summary.resp = Some(RemoteResponse {
            error: None,
            execution_summaries: vec![(
                "opA".to_string(),
                ExecutionSummary {
                    time_processed_ns: 100,
                    num_produced_rows: 10,
                    num_iterations: 1,
                    concurrency: 2,
                },
            )],
        });
        let source = Arc::new(ScriptedSource::new(true, 2, vec![with_summary]));
        let mut stream = RemoteBlockStream::new(Arc::clone(&source) as Arc<dyn RemoteResultSource>, "req-1", "exec-1", 0);
        stream.next_block().expect("ok").expect("chunk");

        assert!(stream.remote_execution_summaries(0).is_none());
        let slot1 = stream.remote_execution_summaries(1).expect("published");
        assert_eq!(slot1["opA"].num_produced_rows, 10);
    }

    #[test]
    fn batch_summaries_accumulate_into_slot_zero() {
        let mut results = Vec::new();
        for call_index in 0..3 {
            let mut r = data_result(call_index, vec![1]);
            r.resp = Some(RemoteResponse {
                error: None,
                execution_summaries: vec![(
                    "opA".to_string(),
                    ExecutionSummary {
                        time_processed_ns: 30,
                        num_produced_rows: 5,
                        num_iterations: 1,
                        concurrency: 1,
                    },
                )],
            });
            results.push(r);
        }
        let source = Arc::new(ScriptedSource::new(false, 3, results));
        let mut stream = RemoteBlockStream::new(Arc::clone(&source) as Arc<dyn RemoteResultSource>, "req-1", "exec-1", 0);
        while stream.next_block().expect("ok").is_some() {}

        let slot0 = stream.remote_execution_summaries(0).expect("published");
        assert_eq!(slot0["opA"].num_produced_rows, 15);
        assert_eq!(slot0["opA"].time_processed_ns, 30);
        assert!(stream.remote_execution_summaries(1).is_none());
        // One-shot readers route all connection bookkeeping to slot 0 too.
        assert_eq!(stream.connection_profile_infos()[0].packets, 3);
    }

    #[test]
    fn cancel_forwards_only_when_forceful() {
        let source = Arc::new(ScriptedSource::new(true, 1, Vec::new()));
        let mut stream = RemoteBlockStream::new(Arc::clone(&source) as Arc<dyn RemoteResultSource>, "req-1", "exec-1", 0);
        stream.cancel(false);
        assert_eq!(source.cancel_calls.load(Ordering::SeqCst), 0);
        stream.cancel(true);
        assert_eq!(source.cancel_calls.load(Ordering::SeqCst), 1);
        stream.cancel(true);
        assert_eq!(source.cancel_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn close_closes_reader_once() {
        let source = Arc::new(ScriptedSource::new(true, 1, Vec::new()));
        let mut stream = RemoteBlockStream::new(Arc::clone(&source) as Arc<dyn RemoteResultSource>, "req-1", "exec-1", 0);
        assert!(stream.next_block().expect("ok").is_none());
        stream.close();
        assert_eq!(source.close_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stream_id_is_forwarded_on_every_fetch() {
        let source = Arc::new(ScriptedSource::new(
            true,
            1,
            vec![data_result(0, vec![1]), data_result(0, vec![2])],
        ));
        let mut stream = RemoteBlockStream::new(Arc::clone(&source) as Arc<dyn RemoteResultSource>, "req-1", "exec-1", 3);
        while stream.next_block().expect("ok").is_some() {}
        let seen = source.seen_stream_ids.lock().expect("lock").clone();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|id| *id == 3));
    }
}
