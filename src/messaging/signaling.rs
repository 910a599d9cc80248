//! Voice-call signaling slots.
//!
//! Call signals are never persisted. Each one lives in a single-value watch
//! slot that only remembers the latest value; receiving a request, response
//! or end clears the other two. Audio fragments are relayed the same way,
//! each fragment overwriting the previous one.

use crate::messaging::PeerId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Invitation to start a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRequest {
    /// Caller
    pub sender_id: PeerId,
    /// Callee
    pub receiver_id: PeerId,
}

/// Answer to a call request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallResponse {
    /// Callee
    pub sender_id: PeerId,
    /// Caller
    pub receiver_id: PeerId,
    /// Whether the call was accepted
    pub accepted: bool,
}

/// Hang-up notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEnd {
    /// Party hanging up
    pub sender_id: PeerId,
    /// Other party
    pub receiver_id: PeerId,
}

/// Latest-value slots for the call signals of this device
#[derive(Debug)]
pub struct CallSignals {
    request: watch::Sender<Option<CallRequest>>,
    response: watch::Sender<Option<CallResponse>>,
    end: watch::Sender<Option<CallEnd>>,
    fragment: watch::Sender<Option<Arc<Vec<u8>>>>,
}

impl Default for CallSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl CallSignals {
    /// Create empty slots
    pub fn new() -> Self {
        Self {
            request: watch::channel(None).0,
            response: watch::channel(None).0,
            end: watch::channel(None).0,
            fragment: watch::channel(None).0,
        }
    }

    /// Clear the request, response and end slots
    pub fn reset(&self) {
        self.request.send_replace(None);
        self.response.send_replace(None);
        self.end.send_replace(None);
    }

    /// Record an inbound call request
    pub fn on_request(&self, request: CallRequest) {
        self.reset();
        self.request.send_replace(Some(request));
    }

    /// Record an inbound call response
    pub fn on_response(&self, response: CallResponse) {
        self.reset();
        self.response.send_replace(Some(response));
    }

    /// Record an inbound call end
    pub fn on_end(&self, end: CallEnd) {
        self.reset();
        self.end.send_replace(Some(end));
    }

    /// Replace the latest audio fragment
    pub fn on_fragment(&self, bytes: Vec<u8>) {
        self.fragment.send_replace(Some(Arc::new(bytes)));
    }

    /// Latest call request, if not cleared
    pub fn request(&self) -> Option<CallRequest> {
        *self.request.borrow()
    }

    /// Latest call response, if not cleared
    pub fn response(&self) -> Option<CallResponse> {
        *self.response.borrow()
    }

    /// Latest call end, if not cleared
    pub fn end(&self) -> Option<CallEnd> {
        *self.end.borrow()
    }

    /// Latest audio fragment
    pub fn fragment(&self) -> Option<Arc<Vec<u8>>> {
        self.fragment.borrow().clone()
    }

    /// Observe call requests
    pub fn subscribe_requests(&self) -> watch::Receiver<Option<CallRequest>> {
        self.request.subscribe()
    }

    /// Observe call responses
    pub fn subscribe_responses(&self) -> watch::Receiver<Option<CallResponse>> {
        self.response.subscribe()
    }

    /// Observe call ends
    pub fn subscribe_ends(&self) -> watch::Receiver<Option<CallEnd>> {
        self.end.subscribe()
    }

    /// Observe audio fragments
    pub fn subscribe_fragments(&self) -> watch::Receiver<Option<Arc<Vec<u8>>>> {
        self.fragment.subscribe()
    }
}
