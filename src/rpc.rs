//! RPC method dispatch (§4.6): matches each request method name against a
//! handler and turns the result into a `[1, msgid, error, result]` response.
//!
//! Grounded in the teacher's `handle_request` match over `InjectRequest`
//! variants in `src/socket.rs`, generalized from a closed three-variant enum
//! to a string-keyed method table since §4.6 names a fixed but larger set of
//! methods (`spawn_pty`, `close_pty`, `list_ptys`, `attach`, `resize`,
//! `split_pane`, `session_save`, `session_load`, `session_rename`,
//! `session_delete`) plus two notifications (`write_pty`, `mouse`).

use crate::codec::Message;
use crate::error::RpcError;
use crate::server::Server;
use crate::session::Direction;
use rmpv::Value;

fn get_str(map: &[(Value, Value)], key: &str) -> Option<String> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .and_then(|(_, v)| v.as_str().map(|s| s.to_string()))
}

fn get_u64(map: &[(Value, Value)], key: &str) -> Option<u64> {
    map.iter().find(|(k, _)| k.as_str() == Some(key)).and_then(|(_, v)| v.as_u64())
}

fn as_map(params: &Value) -> &[(Value, Value)] {
    match params {
        Value::Map(entries) => entries,
        _ => &[],
    }
}

fn as_array(params: &Value) -> &[Value] {
    match params {
        Value::Array(items) => items,
        _ => &[],
    }
}

/// Handle one request, returning the `(error, result)` pair for the response
/// frame. `error` is `None` on success.
pub fn handle_request(server: &mut Server, client_id: u64, method: &str, params: &Value) -> (Option<Value>, Value) {
    let result = match method {
        "spawn_pty" => spawn_pty(server, client_id, params),
        "close_pty" => close_pty(server, params),
        "list_ptys" => Ok(list_ptys(server)),
        "attach" => attach(server, client_id, params),
        "resize" => resize(server, client_id, params),
        "split_pane" => split_pane(server, client_id, params),
        "session_save" => session_save(server, client_id, params),
        "session_load" => session_load(server, params),
        "session_rename" => session_rename(server, params),
        "session_delete" => session_delete(server, params),
        other => Err(RpcError::UnknownMethod(other.to_string())),
    };

    match result {
        Ok(value) => (None, value),
        Err(e) => (Some(Value::from(e.to_string())), Value::Nil),
    }
}

/// Handle one notification; errors are logged and dropped (§7 — notifications
/// have no reply).
pub fn handle_notification(server: &mut Server, method: &str, params: &Value) {
    let result: Result<(), RpcError> = match method {
        "write_pty" => {
            let items = as_array(params);
            let pty_id = items.first().and_then(|v| v.as_u64());
            let bytes = items.get(1).and_then(|v| match v {
                Value::Binary(b) => Some(b.clone()),
                Value::String(s) => s.as_str().map(|s| s.as_bytes().to_vec()),
                _ => None,
            });
            match (pty_id, bytes) {
                (Some(pty_id), Some(bytes)) => server.write_pty(pty_id, &bytes),
                _ => Err(RpcError::InvalidParams("write_pty expects [pty_id, bytes]".into())),
            }
        }
        "mouse" => Ok(()), // mouse event routing is a client-UI concern layered on write_pty
        other => Err(RpcError::UnknownMethod(other.to_string())),
    };
    if let Err(e) = result {
        tracing::warn!("notification {method} failed: {e}");
    }
}

fn spawn_pty(server: &mut Server, client_id: u64, params: &Value) -> Result<Value, RpcError> {
    let map = as_map(params);
    let rows = get_u64(map, "rows").map(|v| v as u16).unwrap_or(server.default_rows);
    let cols = get_u64(map, "cols").map(|v| v as u16).unwrap_or(server.default_cols);
    let cwd = get_str(map, "cwd");
    let attach_after = map
        .iter()
        .find(|(k, _)| k.as_str() == Some("attach"))
        .and_then(|(_, v)| v.as_bool())
        .unwrap_or(false);

    let pty_id = server.spawn_pty(rows, cols, cwd)?;
    if attach_after {
        server.attach(client_id, pty_id)?;
        server.render_client(client_id);
    }
    Ok(Value::Map(vec![(Value::from("pty_id"), Value::from(pty_id))]))
}

fn close_pty(server: &mut Server, params: &Value) -> Result<Value, RpcError> {
    let items = as_array(params);
    let pty_id = items.first().and_then(|v| v.as_u64()).ok_or_else(|| {
        RpcError::InvalidParams("close_pty expects [pty_id]".into())
    })?;
    server.close_pty(pty_id)?;
    Ok(Value::Nil)
}

fn list_ptys(server: &Server) -> Value {
    let entries = server
        .list_ptys()
        .into_iter()
        .map(|info| {
            Value::Map(vec![
                (Value::from("id"), Value::from(info.id)),
                (Value::from("cwd"), Value::from(info.cwd)),
                (Value::from("title"), Value::from(info.title)),
                (Value::from("attached_client_count"), Value::from(info.attached_client_count as u64)),
            ])
        })
        .collect();
    Value::Map(vec![(Value::from("ptys"), Value::Array(entries))])
}

/// `attach(pty_id | session_name)` (§4.6): the wire param is either a small
/// integer (direct pty attach) or a string (attach to a session's active
/// pane, tracked as `(session_name, tab_index)` rather than a fixed pty).
fn attach(server: &mut Server, client_id: u64, params: &Value) -> Result<Value, RpcError> {
    let items = as_array(params);
    let target = items
        .first()
        .ok_or_else(|| RpcError::InvalidParams("attach expects [pty_id | session_name]".into()))?;
    if let Some(pty_id) = target.as_u64() {
        server.attach(client_id, pty_id)?;
    } else if let Some(session_name) = target.as_str() {
        server.attach_session(client_id, session_name)?;
    } else {
        return Err(RpcError::InvalidParams("attach expects a pty id or a session name".into()));
    }
    server.render_client(client_id);
    Ok(Value::Nil)
}

fn resize(server: &mut Server, client_id: u64, params: &Value) -> Result<Value, RpcError> {
    let items = as_array(params);
    let rows = items.first().and_then(|v| v.as_u64()).ok_or_else(|| {
        RpcError::InvalidParams("resize expects [rows, cols]".into())
    })? as u16;
    let cols = items.get(1).and_then(|v| v.as_u64()).ok_or_else(|| {
        RpcError::InvalidParams("resize expects [rows, cols]".into())
    })? as u16;
    server.resize_client(client_id, rows, cols)?;
    Ok(Value::Nil)
}

fn split_pane(server: &mut Server, client_id: u64, params: &Value) -> Result<Value, RpcError> {
    let map = as_map(params);
    let direction = match get_str(map, "direction").as_deref() {
        Some("col") => Direction::Col,
        _ => Direction::Row,
    };
    let session_name = get_str(map, "session").unwrap_or_else(|| format!("client-{client_id}"));
    let pty_id = server.split_pane(client_id, direction, &session_name)?;
    Ok(Value::Map(vec![(Value::from("pty_id"), Value::from(pty_id))]))
}

fn session_save(server: &mut Server, _client_id: u64, params: &Value) -> Result<Value, RpcError> {
    let name = as_array(params)
        .first()
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::InvalidParams("session_save expects [name]".into()))?;
    let session = server.sessions.get(name).ok_or_else(|| RpcError::SessionNotFound(name.to_string()))?;
    server
        .session_store
        .save(session)
        .map_err(|e| RpcError::InvalidParams(e.to_string()))?;
    Ok(Value::Nil)
}

fn session_load(server: &mut Server, params: &Value) -> Result<Value, RpcError> {
    let name = as_array(params)
        .first()
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::InvalidParams("session_load expects [name]".into()))?;
    let loaded = server
        .session_store
        .load(name)
        .map_err(|e| RpcError::InvalidParams(e.to_string()))?
        .ok_or_else(|| RpcError::SessionNotFound(name.to_string()))?;
    server.sessions.insert(name.to_string(), loaded);
    Ok(Value::Nil)
}

fn session_rename(server: &mut Server, params: &Value) -> Result<Value, RpcError> {
    let items = as_array(params);
    let from = items.first().and_then(|v| v.as_str()).ok_or_else(|| {
        RpcError::InvalidParams("session_rename expects [from, to]".into())
    })?;
    let to = items.get(1).and_then(|v| v.as_str()).ok_or_else(|| {
        RpcError::InvalidParams("session_rename expects [from, to]".into())
    })?;
    server
        .session_store
        .rename(from, to)
        .map_err(|e| RpcError::InvalidParams(e.to_string()))?;
    if let Some(mut session) = server.sessions.remove(from) {
        session.name = to.to_string();
        server.sessions.insert(to.to_string(), session);
    }
    Ok(Value::Nil)
}

fn session_delete(server: &mut Server, params: &Value) -> Result<Value, RpcError> {
    let name = as_array(params)
        .first()
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::InvalidParams("session_delete expects [name]".into()))?;
    server
        .session_store
        .delete(name)
        .map_err(|e| RpcError::InvalidParams(e.to_string()))?;
    server.sessions.remove(name);
    Ok(Value::Nil)
}

/// Used by the connection loop to frame a response for a `Message::Request`.
pub fn respond(msgid: u64, error: Option<Value>, result: Value) -> Message {
    Message::Response { msgid, error, result }
}
