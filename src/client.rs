//! Client session state (§3, §4.6): per-connected-client subscription,
//! decode buffer, outbound queue, and diffing state for its attached grid.
//!
//! The read-append-decode-dispatch shape is grounded in the teacher's
//! `handle_connection` in `src/socket.rs` (buffered reads, incremental
//! parse, one dispatch per complete frame), generalized from newline-framed
//! JSON to the binary codec's `decode`-returns-consumed-length contract.

use crate::redraw::GridSnapshot;
use std::collections::{HashSet, VecDeque};
use tokio::net::UnixStream;

pub const DEFAULT_OUTBOUND_CAP: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    Pty { pty_id: u64, rows: u16, cols: u16 },
    Session { session_name: String, tab_index: usize },
    None,
}

pub struct ClientSession {
    pub id: u64,
    pub stream: UnixStream,
    pub decode_buf: Vec<u8>,
    pub outbound: VecDeque<u8>,
    pub outbound_cap: usize,
    pub subscription: Subscription,
    pub grid: GridSnapshot,
    pub known_hl_ids: HashSet<u64>,
    pub alive: bool,
}

impl ClientSession {
    pub fn new(id: u64, stream: UnixStream) -> Self {
        ClientSession {
            id,
            stream,
            decode_buf: Vec::new(),
            outbound: VecDeque::new(),
            outbound_cap: DEFAULT_OUTBOUND_CAP,
            subscription: Subscription::None,
            grid: GridSnapshot::default(),
            known_hl_ids: HashSet::new(),
            alive: true,
        }
    }

    /// Queue bytes for writing; returns `false` if this would overflow the
    /// cap, in which case the caller must disconnect the client (§5).
    pub fn queue_outbound(&mut self, bytes: &[u8]) -> bool {
        if self.outbound.len() + bytes.len() > self.outbound_cap {
            return false;
        }
        self.outbound.extend(bytes.iter().copied());
        true
    }

    /// Attaching to a new target resets the per-grid diff state, so the
    /// next render is a full paint (§4.5, §4.6).
    pub fn attach(&mut self, subscription: Subscription) {
        self.subscription = subscription;
        self.grid = GridSnapshot::default();
        self.known_hl_ids.clear();
    }

}
