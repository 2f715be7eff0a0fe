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
//! In-process exchange registry backing the streaming remote reader.
//!
//! The transport layer pushes decoded packets (chunks plus the optional
//! response payload) tagged with the originating sender and partition lane;
//! [`ExchangeReceiverSource`] pops them as result units for the remote block
//! stream. Each sender reports end-of-stream per lane it writes to.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

use arrow::datatypes::SchemaRef;

use crate::common::types::format_uuid;
use crate::exec::chunk::Chunk;
use crate::rockflow_logging::debug;
use crate::runtime::remote_source::{
    DecodeDetail, RemoteResponse, RemoteResult, RemoteResultSource,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ExchangeKey {
    pub finst_id_hi: i64,
    pub finst_id_lo: i64,
    pub node_id: i32,
}

impl ExchangeKey {
    #[inline]
    pub(crate) fn finst_uuid(&self) -> String {
        format_uuid(self.finst_id_hi, self.finst_id_lo)
    }
}

const CANCELED_KEYS_TTL: Duration = Duration::from_secs(600);
const CANCELED_KEYS_MAX_SIZE: usize = 8192;
const EXCHANGE_WAIT_LOG_INTERVAL: Duration = Duration::from_secs(5);

static CANCELED_KEYS: OnceLock<Mutex<HashMap<ExchangeKey, Instant>>> = OnceLock::new();

fn canceled_keys() -> &'static Mutex<HashMap<ExchangeKey, Instant>> {
    CANCELED_KEYS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn cleanup_canceled_keys_locked(keys: &mut HashMap<ExchangeKey, Instant>, now: Instant) {
    keys.retain(|_, ts| now.duration_since(*ts) <= CANCELED_KEYS_TTL);
    if keys.len() > CANCELED_KEYS_MAX_SIZE {
        keys.clear();
    }
}

fn mark_key_canceled(key: ExchangeKey) {
    let now = Instant::now();
    let mut guard = canceled_keys().lock().expect("exchange canceled keys lock");
    cleanup_canceled_keys_locked(&mut guard, now);
    guard.insert(key, now);
}

fn is_key_canceled(key: &ExchangeKey) -> bool {
    let now = Instant::now();
    let mut guard = canceled_keys().lock().expect("exchange canceled keys lock");
    cleanup_canceled_keys_locked(&mut guard, now);
    guard.contains_key(key)
}

/// One decoded transmission from a sender, queued per partition lane.
struct ExchangePacket {
    sender_index: usize,
    chunks: Vec<Chunk>,
    resp: Option<RemoteResponse>,
    packet_bytes: usize,
}

#[derive(Default)]
struct LaneState {
    packets: VecDeque<ExchangePacket>,
    finished_senders: HashSet<usize>,
}

#[derive(Default)]
struct ReceiverState {
    expected_senders: usize,
    lanes: Vec<LaneState>,
    canceled: bool,
}

impl ReceiverState {
    fn lane_mut(&mut self, lane: usize) -> &mut LaneState {
        if lane >= self.lanes.len() {
            self.lanes.resize_with(lane + 1, LaneState::default);
        }
        &mut self.lanes[lane]
    }
}

struct Receiver {
    mu: Mutex<ReceiverState>,
    cv: Condvar,
}

static EXCHANGE: OnceLock<Mutex<HashMap<ExchangeKey, Arc<Receiver>>>> = OnceLock::new();

fn exchange() -> &'static Mutex<HashMap<ExchangeKey, Arc<Receiver>>> {
    EXCHANGE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn get_or_create(key: ExchangeKey) -> Arc<Receiver> {
    let mut guard = exchange().lock().expect("exchange lock");
    let existed = guard.contains_key(&key);
    let receiver = guard
        .entry(key)
        .or_insert_with(|| {
            Arc::new(Receiver {
                mu: Mutex::new(ReceiverState::default()),
                cv: Condvar::new(),
            })
        })
        .clone();
    if !existed {
        debug!(
            "exchange receiver CREATED: finst={} node_id={}",
            key.finst_uuid(),
            key.node_id
        );
    }
    receiver
}

/// Cancel every exchange of one fragment instance. Late pushes for the keys
/// are dropped until the cancel marker expires.
pub fn cancel_fragment(finst_id_hi: i64, finst_id_lo: i64) {
    let mut guard = exchange().lock().expect("exchange lock");
    let keys: Vec<ExchangeKey> = guard
        .keys()
        .copied()
        .filter(|k| k.finst_id_hi == finst_id_hi && k.finst_id_lo == finst_id_lo)
        .collect();
    for k in keys {
        mark_key_canceled(k);
        if let Some(r) = guard.get(&k).cloned() {
            let mut st = r.mu.lock().expect("exchange receiver lock");
            st.canceled = true;
            r.cv.notify_all();
            drop(st);
        }
        guard.remove(&k);
    }
}

/// Push one decoded transmission into a receiver.
///
/// `lane` is the fine-grained shuffle partition the sender hashed this data
/// to; unpartitioned senders always use lane 0. `eos` marks `sender_index`
/// finished on that lane; a sender must close every lane it writes to.
pub fn push_packet(
    key: ExchangeKey,
    lane: usize,
    sender_index: usize,
    chunks: Vec<Chunk>,
    resp: Option<RemoteResponse>,
    payload_bytes: usize,
    eos: bool,
) {
    if is_key_canceled(&key) {
        return;
    }
    let chunks_len = chunks.len();
    let row_count: usize = chunks.iter().map(|c| c.len()).sum();
    debug!(
        "exchange push_packet: finst={} node_id={} lane={} sender_index={} chunks={} rows={} eos={}",
        key.finst_uuid(),
        key.node_id,
        lane,
        sender_index,
        chunks_len,
        row_count,
        eos
    );

    let r = get_or_create(key);
    let mut st = r.mu.lock().expect("exchange receiver lock");
    if st.canceled {
        debug!(
            "exchange push_packet: CANCELED, dropping {} chunks ({} rows) from sender_index={}",
            chunks_len, row_count, sender_index
        );
        return;
    }
    let expected_senders = st.expected_senders;
    let lane_state = st.lane_mut(lane);
    if chunks_len != 0 || resp.is_some() {
        lane_state.packets.push_back(ExchangePacket {
            sender_index,
            chunks,
            resp,
            packet_bytes: payload_bytes,
        });
    }
    if eos {
        lane_state.finished_senders.insert(sender_index);
        debug!(
            "exchange push_packet: sender_index={} marked FINISHED on lane {}, finished={}/{}",
            sender_index,
            lane,
            lane_state.finished_senders.len(),
            expected_senders
        );
    }
    r.cv.notify_all();
}

pub fn set_expected_senders(key: ExchangeKey, expected_senders: usize) {
    if is_key_canceled(&key) {
        return;
    }
    let r = get_or_create(key);
    let mut st = r.mu.lock().expect("exchange receiver lock");
    let before = st.expected_senders;
    st.expected_senders = st.expected_senders.max(expected_senders);
    if st.expected_senders != before {
        debug!(
            "exchange expected_senders UPDATED: finst={} node_id={} before={} after={}",
            key.finst_uuid(),
            key.node_id,
            before,
            st.expected_senders
        );
    }
    r.cv.notify_all();
}

/// Streaming remote reader over one exchange receiver. `source_num` is the
/// number of upstream connections; every result unit reports the connection
/// it came from as its call index.
pub struct ExchangeReceiverSource {
    key: ExchangeKey,
    schema: SchemaRef,
    expected_senders: usize,
    timeout: Duration,
    receiver: Arc<Receiver>,
}

impl ExchangeReceiverSource {
    pub fn new(
        key: ExchangeKey,
        schema: SchemaRef,
        expected_senders: usize,
        timeout: Duration,
    ) -> Result<Self, String> {
        if is_key_canceled(&key) {
            return Err("exchange canceled".to_string());
        }
        set_expected_senders(key, expected_senders);
        let receiver = get_or_create(key);
        Ok(Self {
            key,
            schema,
            expected_senders,
            timeout,
            receiver,
        })
    }

    /// Like [`ExchangeReceiverSource::new`] with the wait timeout taken from
    /// the runtime config.
    pub fn from_config(
        key: ExchangeKey,
        schema: SchemaRef,
        expected_senders: usize,
    ) -> Result<Self, String> {
        let wait_ms = crate::rockflow_config::config()
            .map(|c| c.runtime.exchange_wait_ms)
            .unwrap_or(300_000);
        Self::new(key, schema, expected_senders, Duration::from_millis(wait_ms))
    }

    fn result_from_packet(&self, packet: ExchangePacket) -> RemoteResult {
        let rows: usize = packet.chunks.iter().map(|c| c.len()).sum();
        RemoteResult {
            error: None,
            eof: false,
            resp: packet.resp.or_else(|| Some(RemoteResponse::default())),
            decode_detail: DecodeDetail {
                rows,
                packet_bytes: packet.packet_bytes,
            },
            blocks: packet.chunks,
            call_index: packet.sender_index,
            req_info: format!(
                "exchange finst={} node_id={} sender={}",
                self.key.finst_uuid(),
                self.key.node_id,
                packet.sender_index
            ),
        }
    }
}

impl RemoteResultSource for ExchangeReceiverSource {
    fn reader_name(&self) -> &'static str {
        "Exchange"
    }

    fn is_streaming(&self) -> bool {
        true
    }

    fn source_num(&self) -> usize {
        self.expected_senders
    }

    fn output_schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn next_result(&self, stream_id: usize) -> RemoteResult {
        let r = &self.receiver;
        let start = Instant::now();
        let mut st = r.mu.lock().expect("exchange receiver lock");
        loop {
            if st.canceled {
                debug!(
                    "exchange next_result CANCELED: finst={} node_id={}",
                    self.key.finst_uuid(),
                    self.key.node_id
                );
                return RemoteResult::meet_error(format!(
                    "exchange canceled: finst_id={} node_id={}",
                    self.key.finst_uuid(),
                    self.key.node_id
                ));
            }

            let expected = st.expected_senders.max(self.expected_senders);
            if let Some(packet) = st.lane_mut(stream_id).packets.pop_front() {
                drop(st);
                return self.result_from_packet(packet);
            }
            let finished = st.lane_mut(stream_id).finished_senders.len();
            if expected == 0 || finished >= expected {
                return RemoteResult::eof();
            }

            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                debug!(
                    "exchange next_result TIMEOUT: finst={} node_id={} stream_id={} expected={} finished={} elapsed={:?}",
                    self.key.finst_uuid(),
                    self.key.node_id,
                    stream_id,
                    expected,
                    finished,
                    elapsed
                );
                return RemoteResult::meet_error(format!(
                    "exchange timeout waiting for senders: finst_id={} node_id={} expected={} finished={}",
                    self.key.finst_uuid(),
                    self.key.node_id,
                    expected,
                    finished
                ));
            }
            let remain = self.timeout - elapsed;
            let wait_step = remain.min(EXCHANGE_WAIT_LOG_INTERVAL);
            let (next, wait_res) = match r.cv.wait_timeout(st, wait_step) {
                Ok(v) => v,
                Err(_) => {
                    return RemoteResult::meet_error("exchange wait poisoned".to_string());
                }
            };
            st = next;
            if wait_res.timed_out() && wait_step < remain {
                debug!(
                    "exchange next_result WAITING: finst={} node_id={} stream_id={} elapsed={:?} remain={:?}",
                    self.key.finst_uuid(),
                    self.key.node_id,
                    stream_id,
                    start.elapsed(),
                    self.timeout.saturating_sub(start.elapsed())
                );
            }
        }
    }

    fn cancel(&self) {
        mark_key_canceled(self.key);
        let mut st = self.receiver.mu.lock().expect("exchange receiver lock");
        st.canceled = true;
        self.receiver.cv.notify_all();
    }

    fn close(&self) {
        exchange()
            .lock()
            .expect("exchange lock")
            .remove(&self.key);
    }
}
