//! The `Server` record (§4.7): owns the PTY registry, client registry, and
//! session store, and exposes the operations `src/rpc.rs` dispatches into.
//!
//! This is the single owned record described in §9 ("no process-wide
//! singleton"): everything lives here, created once in `main` and driven by
//! the event loop in `src/eventloop.rs`. Mirrors the teacher's habit of
//! building all shared state once in `main()`, generalized from a single
//! fixed PTY/child to a registry of any number of them.

use crate::client::{ClientSession, Subscription};
use crate::codec::{self, Message};
use crate::error::RpcError;
use crate::frame::FrameScheduler;
use crate::pty::PtyHandle;
use crate::redraw::{self, RedrawEvent};
use crate::session::{Direction, Session};
use crate::session_store::SessionStore;
use crate::style::StyleTable;
use rmpv::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

pub struct PtyInfo {
    pub id: u64,
    pub cwd: String,
    pub title: String,
    pub attached_client_count: usize,
}

pub struct Server {
    pub ptys: HashMap<u64, PtyHandle>,
    pub clients: HashMap<u64, ClientSession>,
    pub sessions: HashMap<String, Session>,
    pub scheduler: FrameScheduler,
    pub styles: StyleTable,
    pub next_pty_id: u64,
    pub next_client_id: u64,
    pub session_store: Box<dyn SessionStore>,
    pub default_command: Vec<String>,
    pub join_timeout: Duration,
    pub default_rows: u16,
    pub default_cols: u16,
}

impl Server {
    pub fn new(default_command: Vec<String>, session_store: Box<dyn SessionStore>) -> Self {
        Server {
            ptys: HashMap::new(),
            clients: HashMap::new(),
            sessions: HashMap::new(),
            scheduler: FrameScheduler::new(crate::frame::DEFAULT_FRAME_BUDGET),
            styles: StyleTable::new(),
            next_pty_id: 1,
            next_client_id: 1,
            session_store,
            default_command,
            join_timeout: Duration::from_secs(2),
            default_rows: 24,
            default_cols: 80,
        }
    }

    pub fn alloc_client_id(&mut self) -> u64 {
        let id = self.next_client_id;
        self.next_client_id += 1;
        id
    }

    pub fn spawn_pty(&mut self, rows: u16, cols: u16, cwd: Option<String>) -> Result<u64, RpcError> {
        let id = self.next_pty_id;
        let cwd = cwd.unwrap_or_else(|| std::env::var("HOME").unwrap_or_else(|_| "/".to_string()));
        let shell = self.default_command.clone();
        let handle = PtyHandle::spawn(id, &shell, &cwd, rows, cols)?;
        self.next_pty_id += 1;
        self.ptys.insert(id, handle);
        info!("spawned pty {id} ({cols}x{rows}) cwd={cwd}");
        Ok(id)
    }

    pub fn close_pty(&mut self, pty_id: u64) -> Result<(), RpcError> {
        self.close_pty_with_status(pty_id, 0)
    }

    /// Tear down a PTY and notify its attached clients with the child's
    /// real exit status (§8 scenario 4: `pty_exit(pty_id, status=7)`).
    pub fn close_pty_with_status(&mut self, pty_id: u64, status: i32) -> Result<(), RpcError> {
        let mut handle = self.ptys.remove(&pty_id).ok_or(RpcError::PtyNotFound(pty_id))?;
        self.scheduler.cancel(pty_id);
        handle.shutdown(self.join_timeout);

        let dead_clients: Vec<u64> = self
            .clients
            .keys()
            .copied()
            .filter(|&cid| self.resolve_subscribed_pty(cid) == Some(pty_id))
            .collect();
        for client_id in dead_clients {
            if let Some(client) = self.clients.get_mut(&client_id) {
                let msg = Message::Notification {
                    method: "pty_exit".into(),
                    params: Value::Array(vec![Value::from(pty_id), Value::from(status)]),
                };
                let mut buf = Vec::new();
                codec::encode(&msg, &mut buf);
                if !client.queue_outbound(&buf) {
                    client.alive = false;
                }
            }
        }
        Ok(())
    }

    pub fn list_ptys(&self) -> Vec<PtyInfo> {
        self.ptys
            .values()
            .map(|p| PtyInfo {
                id: p.id,
                cwd: p.cwd.clone(),
                title: p.shared.lock().unwrap().title.clone(),
                attached_client_count: p.attached_clients.len(),
            })
            .collect()
    }

    /// Resolve the pty a client is currently watching, whichever kind of
    /// subscription it holds. For a session subscription this follows
    /// `(session_name, tab_index)` to that tab's active pane (§3, §4.6).
    pub fn resolve_subscribed_pty(&self, client_id: u64) -> Option<u64> {
        let client = self.clients.get(&client_id)?;
        match &client.subscription {
            Subscription::Pty { pty_id, .. } => Some(*pty_id),
            Subscription::Session { session_name, tab_index } => {
                self.sessions.get(session_name)?.tabs.get(*tab_index)?.active_pane_pty_id()
            }
            Subscription::None => None,
        }
    }

    fn detach_current_pty(&mut self, client_id: u64) {
        if let Some(prev_pty) = self.resolve_subscribed_pty(client_id) {
            if let Some(prev) = self.ptys.get_mut(&prev_pty) {
                prev.attached_clients.remove(&client_id);
            }
        }
    }

    pub fn attach(&mut self, client_id: u64, pty_id: u64) -> Result<(), RpcError> {
        let (rows, cols) = {
            let handle = self.ptys.get(&pty_id).ok_or(RpcError::PtyNotFound(pty_id))?;
            (handle.rows, handle.cols)
        };
        self.detach_current_pty(client_id);
        if let Some(handle) = self.ptys.get_mut(&pty_id) {
            handle.attached_clients.insert(client_id);
        }
        let client = self.clients.get_mut(&client_id).ok_or(RpcError::NotAttached)?;
        client.attach(Subscription::Pty { pty_id, rows, cols });
        Ok(())
    }

    /// `attach(session_name)` (§4.6): subscribe to "whatever pane is active"
    /// in the session's active tab rather than a fixed pty.
    pub fn attach_session(&mut self, client_id: u64, session_name: &str) -> Result<(), RpcError> {
        let (tab_index, pty_id) = {
            let session = self
                .sessions
                .get(session_name)
                .ok_or_else(|| RpcError::SessionNotFound(session_name.to_string()))?;
            let tab_index = session.active_tab;
            let pty_id = session
                .tabs
                .get(tab_index)
                .and_then(|t| t.active_pane_pty_id())
                .ok_or_else(|| RpcError::SessionNotFound(session_name.to_string()))?;
            (tab_index, pty_id)
        };
        self.detach_current_pty(client_id);
        if let Some(handle) = self.ptys.get_mut(&pty_id) {
            handle.attached_clients.insert(client_id);
        }
        let client = self.clients.get_mut(&client_id).ok_or(RpcError::NotAttached)?;
        client.attach(Subscription::Session { session_name: session_name.to_string(), tab_index });
        Ok(())
    }

    /// §4.6: resizing a client attached directly to a pty resizes that pty;
    /// a client attached to a session re-tiles by resizing its active pane's
    /// pty to the new viewport (multi-pane co-tiling is a client-UI layout
    /// concern layered on the ratios already carried in the layout tree).
    pub fn resize_client(&mut self, client_id: u64, rows: u16, cols: u16) -> Result<(), RpcError> {
        let pty_id = self.resolve_subscribed_pty(client_id).ok_or(RpcError::NotAttached)?;
        let handle = self.ptys.get_mut(&pty_id).ok_or(RpcError::PtyNotFound(pty_id))?;
        handle.resize(rows, cols)?;
        if let Some(client) = self.clients.get_mut(&client_id) {
            if let Subscription::Pty { rows: r, cols: c, .. } = &mut client.subscription {
                *r = rows;
                *c = cols;
            }
        }
        Ok(())
    }

    /// Split the client's current pane into two: the pane it was already
    /// looking at (if any) stays put, and a freshly spawned pty becomes its
    /// sibling. When `session_name` doesn't exist yet, the new session's
    /// initial pane is the client's *existing* pty, not the new one — a
    /// fresh session with nothing to split would otherwise have to split a
    /// pane against itself.
    pub fn split_pane(&mut self, client_id: u64, direction: Direction, session_name: &str) -> Result<u64, RpcError> {
        let existing_pty = self.resolve_subscribed_pty(client_id);
        let (rows, cols) = existing_pty
            .and_then(|pty_id| self.ptys.get(&pty_id))
            .map(|p| (p.rows, p.cols))
            .unwrap_or((self.default_rows, self.default_cols));
        let new_pty_id = self.spawn_pty(rows, cols, None)?;
        let new_cwd = self.ptys.get(&new_pty_id).map(|p| p.cwd.clone()).unwrap_or_default();

        if let Some(session) = self.sessions.get_mut(session_name) {
            session.split_active(direction, new_pty_id, new_cwd);
        } else {
            let first_pty = existing_pty.unwrap_or(new_pty_id);
            let first_cwd = existing_pty
                .and_then(|id| self.ptys.get(&id))
                .map(|p| p.cwd.clone())
                .unwrap_or_else(|| new_cwd.clone());
            let mut session = Session::new(session_name.to_string(), first_pty, first_cwd);
            if first_pty != new_pty_id {
                session.split_active(direction, new_pty_id, new_cwd);
            }
            self.sessions.insert(session_name.to_string(), session);
        }
        Ok(new_pty_id)
    }

    pub fn write_pty(&self, pty_id: u64, bytes: &[u8]) -> Result<(), RpcError> {
        let handle = self.ptys.get(&pty_id).ok_or(RpcError::PtyNotFound(pty_id))?;
        handle.write_input(bytes).map_err(RpcError::from)
    }

    /// Compute and queue a `redraw` notification for one client, given its
    /// currently attached PTY. No-op if the client isn't attached to a PTY
    /// or that PTY no longer exists.
    pub fn render_client(&mut self, client_id: u64) {
        let pty_id = match self.resolve_subscribed_pty(client_id) {
            Some(id) => id,
            None => return,
        };
        let handle = match self.ptys.get(&pty_id) {
            Some(h) => h,
            None => return,
        };
        let guard = handle.shared.lock().unwrap();
        let client = self.clients.get_mut(&client_id).unwrap();
        let mut events = redraw::diff_screen(
            pty_id,
            guard.emulator.screen(),
            &mut client.grid,
            &mut self.styles,
            &mut client.known_hl_ids,
        );
        drop(guard);
        if events.is_empty() {
            return;
        }
        events.push(RedrawEvent::Flush);
        let msg = Message::Notification {
            method: "redraw".into(),
            params: redraw::encode_events(&events),
        };
        let mut buf = Vec::new();
        codec::encode(&msg, &mut buf);
        if !client.queue_outbound(&buf) {
            warn!("client {client_id} outbound queue overflow, disconnecting (slow client)");
            client.alive = false;
        }
    }

    /// Render every client currently attached to `pty_id` (§4.4 step "render").
    pub fn render_pty(&mut self, pty_id: u64) {
        let client_ids: Vec<u64> = match self.ptys.get(&pty_id) {
            Some(h) => h.attached_clients.iter().copied().collect(),
            None => return,
        };
        for client_id in client_ids {
            self.render_client(client_id);
        }
    }

    pub fn remove_client(&mut self, client_id: u64) {
        let pty_id = self.resolve_subscribed_pty(client_id);
        self.clients.remove(&client_id);
        if let Some(pty_id) = pty_id {
            if let Some(handle) = self.ptys.get_mut(&pty_id) {
                handle.attached_clients.remove(&client_id);
            }
        }
    }

    /// §4.7 shutdown sequence: notify every attached client of each pty's
    /// teardown, SIGHUP its child, and join the reader thread — all via the
    /// same path a client-initiated `close_pty` takes.
    pub fn shutdown(&mut self) {
        let pty_ids: Vec<u64> = self.ptys.keys().copied().collect();
        for pty_id in pty_ids {
            let _ = self.close_pty_with_status(pty_id, 0);
        }
    }
}
