//! Per-request result fan-out.
//!
//! Each submitted request registers a stream before it is enqueued; the
//! token processor appends events to it as steps complete. Delivery is an
//! in-memory FIFO channel per `req_id`. A client that has gone away only
//! drops the receiving half; sends to it are discarded and the task runs to
//! completion server-side.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::error::{Error, Result};

use super::task::TokenId;

/// One event on a request's result stream.
///
/// Progress events carry a single token; the terminal event (`is_end == 1`)
/// carries the totals and, when requested, the full token id history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEvent {
    pub req_id: String,
    pub is_end: u8,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub token_ids: Vec<TokenId>,
    pub send_idx: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub inference_time_cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub infer_seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub return_all_tokens: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tokens_all_num: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tokens_all_ids: Option<Vec<TokenId>>,
    /// Concatenated output text, present on terminal events.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error_msg: String,
    #[serde(default)]
    pub error_code: i32,
}

impl ResultEvent {
    /// Terminal error event for transport or engine faults.
    pub fn error(req_id: impl Into<String>, error_msg: impl Into<String>, error_code: i32) -> Self {
        Self {
            req_id: req_id.into(),
            is_end: 1,
            token: String::new(),
            token_ids: Vec::new(),
            send_idx: 0,
            inference_time_cost: None,
            infer_seed: None,
            return_all_tokens: None,
            tokens_all_num: None,
            tokens_all_ids: None,
            result: None,
            error_msg: error_msg.into(),
            error_code,
        }
    }
}

/// Registry of live result streams, keyed by `req_id`.
#[derive(Default)]
pub struct OutputRouter {
    streams: Mutex<HashMap<String, UnboundedSender<ResultEvent>>>,
}

impl OutputRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the result stream for a request. A `req_id` can only have one
    /// live stream; a second subscription is the caller reusing an id that
    /// is still in flight.
    pub fn subscribe(&self, req_id: &str) -> Result<UnboundedReceiver<ResultEvent>> {
        let mut streams = self.streams.lock().unwrap();
        if streams.contains_key(req_id) {
            return Err(Error::DuplicateRequest(req_id.to_string()));
        }
        let (tx, rx) = unbounded_channel();
        streams.insert(req_id.to_string(), tx);
        Ok(rx)
    }

    /// Append an event to its request's stream, closing the stream after a
    /// terminal event. Events for disconnected clients are dropped.
    pub fn send(&self, event: ResultEvent) {
        let terminal = event.is_end == 1;
        let req_id = event.req_id.clone();
        let mut streams = self.streams.lock().unwrap();
        if let Some(tx) = streams.get(&req_id) {
            if tx.send(event).is_err() {
                debug!("req_id: {} client stream is gone, dropping event", req_id);
            }
        }
        if terminal {
            streams.remove(&req_id);
        }
    }

    /// Drop a stream without a terminal event (submission failed after
    /// subscribe).
    pub fn finish(&self, req_id: &str) {
        self.streams.lock().unwrap().remove(req_id);
    }

    pub fn active_streams(&self) -> usize {
        self.streams.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(req_id: &str, send_idx: u64) -> ResultEvent {
        ResultEvent {
            is_end: 0,
            send_idx,
            ..ResultEvent::error(req_id, "", 0)
        }
    }

    #[test]
    fn events_arrive_in_order_and_terminal_closes() {
        let router = OutputRouter::new();
        let mut rx = router.subscribe("r1").unwrap();

        router.send(progress("r1", 0));
        router.send(progress("r1", 1));
        let mut last = ResultEvent::error("r1", "", 0);
        last.send_idx = 2;
        router.send(last);

        let first = tokio_test::block_on(rx.recv()).unwrap();
        assert_eq!(first.send_idx, 0);
        let second = tokio_test::block_on(rx.recv()).unwrap();
        assert_eq!(second.send_idx, 1);
        let third = tokio_test::block_on(rx.recv()).unwrap();
        assert_eq!(third.is_end, 1);
        // Sender side was dropped with the terminal event.
        assert!(tokio_test::block_on(rx.recv()).is_none());
        assert_eq!(router.active_streams(), 0);
    }

    #[test]
    fn duplicate_req_id_is_rejected() {
        let router = OutputRouter::new();
        let _rx = router.subscribe("r1").unwrap();
        assert!(matches!(
            router.subscribe("r1"),
            Err(Error::DuplicateRequest(_))
        ));
    }

    #[test]
    fn send_to_disconnected_client_is_dropped() {
        let router = OutputRouter::new();
        let rx = router.subscribe("r1").unwrap();
        drop(rx);
        // Must not panic or error; the task keeps running server-side.
        router.send(progress("r1", 0));
        assert_eq!(router.active_streams(), 1);
        router.finish("r1");
        assert_eq!(router.active_streams(), 0);
    }

    #[test]
    fn optional_fields_are_omitted_from_the_wire() {
        let json = serde_json::to_string(&progress("r1", 3)).unwrap();
        assert!(!json.contains("tokens_all_num"));
        assert!(json.contains("\"send_idx\":3"));
        assert!(json.contains("\"error_code\":0"));
    }
}
