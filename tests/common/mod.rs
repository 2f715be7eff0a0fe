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
//! Shared helpers for integration tests.

use std::sync::Arc;

use arrow::array::{Int64Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

use rockflow::exec::chunk::Chunk;
use rockflow::runtime::execution_summary::ExecutionSummary;

pub fn test_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]))
}

pub fn chunk_of(values: Vec<i64>) -> Chunk {
    let batch = RecordBatch::try_new(test_schema(), vec![Arc::new(Int64Array::from(values))])
        .expect("batch");
    Chunk::new(batch)
}

pub fn summary(time: u64, rows: u64) -> ExecutionSummary {
    ExecutionSummary {
        time_processed_ns: time,
        num_produced_rows: rows,
        num_iterations: 1,
        concurrency: 1,
    }
}
