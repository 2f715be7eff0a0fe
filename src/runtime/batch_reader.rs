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
//! One-shot batch remote reader.
//!
//! Each contributor produces exactly one final response; the transport layer
//! decodes them and hands them over as [`BatchResponse`] values. Unlike the
//! streaming exchange receiver, the batch reader never partitions, so the
//! fine-grained shuffle stream id is ignored.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use arrow::datatypes::SchemaRef;

use crate::exec::chunk::Chunk;
use crate::rockflow_logging::debug;
use crate::runtime::remote_source::{
    DecodeDetail, RemoteResponse, RemoteResult, RemoteResultSource,
};

/// One contributor's final decoded response.
pub struct BatchResponse {
    pub resp: RemoteResponse,
    pub blocks: Vec<Chunk>,
    pub packet_bytes: usize,
    pub req_info: String,
}

/// Reader over a fixed set of one-shot contributor responses. `next_result`
/// drains them in arrival order, then reports end-of-stream.
pub struct BatchReader {
    schema: SchemaRef,
    source_num: usize,
    pending: Mutex<VecDeque<BatchResponse>>,
    canceled: AtomicBool,
}

impl BatchReader {
    pub fn new(schema: SchemaRef, source_num: usize, responses: Vec<BatchResponse>) -> Self {
        Self {
            schema,
            source_num,
            pending: Mutex::new(responses.into()),
            canceled: AtomicBool::new(false),
        }
    }
}

impl RemoteResultSource for BatchReader {
    fn reader_name(&self) -> &'static str {
        "Batch"
    }

    fn is_streaming(&self) -> bool {
        false
    }

    fn source_num(&self) -> usize {
        self.source_num
    }

    fn output_schema(&self) -> SchemaRef {
        std::sync::Arc::clone(&self.schema)
    }

    fn next_result(&self, _stream_id: usize) -> RemoteResult {
        if self.canceled.load(Ordering::Acquire) {
            return RemoteResult::meet_error("batch reader canceled");
        }
        let next = self.pending.lock().expect("batch reader lock").pop_front();
        match next {
            Some(response) => {
                let rows: usize = response.blocks.iter().map(|c| c.len()).sum();
                RemoteResult {
                    error: None,
                    eof: false,
                    resp: Some(response.resp),
                    decode_detail: DecodeDetail {
                        rows,
                        packet_bytes: response.packet_bytes,
                    },
                    blocks: response.blocks,
                    // One-shot contributors all fold into a single slot.
                    call_index: 0,
                    req_info: response.req_info,
                }
            }
            None => RemoteResult::eof(),
        }
    }

    fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    fn close(&self) {
        let dropped = self.pending.lock().expect("batch reader lock").len();
        if dropped != 0 {
            debug!("batch reader closed with {} undelivered responses", dropped);
        }
        self.pending.lock().expect("batch reader lock").clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{Int64Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

    use super::{BatchReader, BatchResponse};
    use crate::exec::chunk::Chunk;
    use crate::runtime::remote_source::{RemoteResponse, RemoteResultSource};

    fn test_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]))
    }

    fn response(values: Vec<i64>) -> BatchResponse {
        let batch =
            RecordBatch::try_new(test_schema(), vec![Arc::new(Int64Array::from(values))])
                .expect("batch");
        BatchResponse {
            resp: RemoteResponse::default(),
            blocks: vec![Chunk::new(batch)],
            packet_bytes: 32,
            req_info: "batch contributor".to_string(),
        }
    }

    #[test]
    fn drains_responses_then_eof() {
        let reader = BatchReader::new(
            test_schema(),
            2,
            vec![response(vec![1, 2]), response(vec![3])],
        );
        let first = reader.next_result(0);
        assert_eq!(first.decode_detail.rows, 2);
        assert_eq!(first.call_index, 0);
        let second = reader.next_result(0);
        assert_eq!(second.decode_detail.rows, 1);
        assert!(reader.next_result(0).eof);
    }

    #[test]
    fn stream_id_is_ignored() {
        let reader = BatchReader::new(test_schema(), 1, vec![response(vec![4])]);
        let result = reader.next_result(9);
        assert_eq!(result.decode_detail.rows, 1);
    }

    #[test]
    fn cancel_fails_subsequent_fetches() {
        let reader = BatchReader::new(test_schema(), 1, vec![response(vec![4])]);
        reader.cancel();
        let result = reader.next_result(0);
        assert!(result.error.expect("canceled").contains("canceled"));
    }
}
