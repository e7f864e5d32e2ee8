//! End-to-end tests driving the real `vtmuxd` binary over its Unix socket,
//! grounded in the teacher's `relay_pty_integration.rs` pattern of spawning
//! `env!("CARGO_BIN_EXE_...")` as a subprocess and talking to it over its own
//! socket, generalized from one JSON-line request/response exchange to the
//! binary rmpv protocol and the scenarios in spec.md §8.

use rmpv::Value;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};

async fn wait_for_socket(path: &str) {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if Path::new(path).exists() {
            return;
        }
        if Instant::now() >= deadline {
            panic!("socket did not appear: {path}");
        }
        sleep(Duration::from_millis(20)).await;
    }
}

fn spawn_server(socket_path: &str, state_dir: &Path) -> Child {
    Command::new(env!("CARGO_BIN_EXE_vtmuxd"))
        .arg("--socket")
        .arg(socket_path)
        .arg("--state-dir")
        .arg(state_dir)
        .arg("--log-level")
        .arg("error")
        .env("SHELL", "/bin/sh")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("failed to spawn vtmuxd")
}

fn encode_request(msgid: u64, method: &str, params: Value) -> Vec<u8> {
    let msg = Value::Array(vec![Value::from(0), Value::from(msgid), Value::from(method), params]);
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &msg).unwrap();
    buf
}

fn encode_notification(method: &str, params: Value) -> Vec<u8> {
    let msg = Value::Array(vec![Value::from(2), Value::from(method), params]);
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &msg).unwrap();
    buf
}

/// A tiny client harness: owns a connected socket and a growing read buffer,
/// and can decode exactly one frame at a time from whatever has arrived so
/// far (frames are self-delimiting msgpack values, no extra length prefix).
struct TestClient {
    stream: UnixStream,
    buf: Vec<u8>,
}

impl TestClient {
    async fn connect(socket_path: &str) -> Self {
        let stream = UnixStream::connect(socket_path).await.expect("connect");
        TestClient { stream, buf: Vec::new() }
    }

    async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Read frames until one matches `pred`, returning it. Panics after 3s.
    async fn recv_until(&mut self, pred: impl Fn(&Value) -> bool) -> Value {
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            if let Some(v) = self.try_decode_one() {
                if pred(&v) {
                    return v;
                }
                continue;
            }
            let mut chunk = [0u8; 4096];
            let remaining = deadline.saturating_duration_since(Instant::now());
            let n = timeout(remaining, self.stream.read(&mut chunk))
                .await
                .expect("timed out waiting for a matching frame")
                .unwrap();
            assert!(n > 0, "server closed the connection");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn try_decode_one(&mut self) -> Option<Value> {
        let mut cursor = std::io::Cursor::new(&self.buf[..]);
        match rmpv::decode::read_value(&mut cursor) {
            Ok(value) => {
                let consumed = cursor.position() as usize;
                self.buf.drain(..consumed);
                Some(value)
            }
            Err(_) => None,
        }
    }
}

fn is_response(v: &Value, msgid: u64) -> bool {
    matches!(v, Value::Array(items) if items.first().and_then(|t| t.as_i64()) == Some(1)
        && items.get(1).and_then(|m| m.as_u64()) == Some(msgid))
}

fn is_notification(v: &Value, method: &str) -> bool {
    matches!(v, Value::Array(items) if items.first().and_then(|t| t.as_i64()) == Some(2)
        && items.get(1).and_then(|m| m.as_str()) == Some(method))
}

/// A `redraw` notification's params is `[event, event, ...]`; pull out the
/// inner `grid_line` events as `(row, col_start, texts)` tuples.
fn grid_lines(redraw_params: &Value) -> Vec<(u64, u64, Vec<String>)> {
    grid_lines_raw(redraw_params)
        .into_iter()
        .map(|(row, col_start, cells)| (row, col_start, cells.into_iter().map(|(text, _)| text).collect()))
        .collect()
}

/// Like `grid_lines`, but keeps each cell's wire arity alongside its text so
/// callers can tell `["h"]` (arity 1, hl_id omitted) from `["h", 0]` (arity 2,
/// hl_id spelled out).
fn grid_lines_raw(redraw_params: &Value) -> Vec<(u64, u64, Vec<(String, usize)>)> {
    let events = match redraw_params {
        Value::Array(events) => events,
        _ => return vec![],
    };
    events
        .iter()
        .filter_map(|e| match e {
            Value::Array(fields) if fields.first().and_then(|n| n.as_str()) == Some("grid_line") => {
                let row = fields[2].as_u64().unwrap();
                let col_start = fields[3].as_u64().unwrap();
                let cells = match &fields[4] {
                    Value::Array(cells) => cells
                        .iter()
                        .map(|c| match c {
                            Value::Array(parts) => (parts[0].as_str().unwrap_or("").to_string(), parts.len()),
                            _ => (String::new(), 0),
                        })
                        .collect(),
                    _ => vec![],
                };
                Some((row, col_start, cells))
            }
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn scenario_echo() {
    let dir = tempdir().unwrap();
    let socket_path = dir.path().join("vtmuxd.sock").to_string_lossy().to_string();
    let state_dir = dir.path().join("state");
    let mut server = spawn_server(&socket_path, &state_dir);
    wait_for_socket(&socket_path).await;

    let mut client = TestClient::connect(&socket_path).await;

    client
        .send(&encode_request(
            1,
            "spawn_pty",
            Value::Map(vec![(Value::from("rows"), Value::from(24)), (Value::from("cols"), Value::from(80))]),
        ))
        .await;
    let resp = client.recv_until(|v| is_response(v, 1)).await;
    let pty_id = match &resp {
        Value::Array(items) => match &items[3] {
            Value::Map(fields) => fields[0].1.as_u64().unwrap(),
            _ => panic!("expected map result"),
        },
        _ => panic!("expected array"),
    };

    client.send(&encode_request(2, "attach", Value::Array(vec![Value::from(pty_id)]))).await;
    client.recv_until(|v| is_response(v, 2)).await;

    // Initial full paint before our echoed bytes arrive.
    client.recv_until(|v| is_notification(v, "redraw")).await;

    client
        .send(&encode_notification(
            "write_pty",
            Value::Array(vec![Value::from(pty_id), Value::Binary(b"hi\r".to_vec())]),
        ))
        .await;

    let redraw = client
        .recv_until(|v| {
            if !is_notification(v, "redraw") {
                return false;
            }
            let params = match v {
                Value::Array(items) => &items[2],
                _ => return false,
            };
            grid_lines(params).iter().any(|(_, _, cells)| cells.iter().any(|c| c == "h" || c == "i"))
        })
        .await;

    let params = match &redraw {
        Value::Array(items) => &items[2],
        _ => unreachable!(),
    };
    let lines = grid_lines(params);
    assert!(lines.iter().any(|(row, col_start, cells)| {
        *row == 0 && *col_start == 0 && cells.first().map(|c| c.as_str()) == Some("h")
    }));

    // `h`/`i` are plain, unstyled cells: the run must carry no hl_id at all
    // (wire arity 1, `["h"]`/`["i"]`), not a spurious explicit `0` (§3 "id 0
    // means default"; §8 scenario 1's `grid_line(1, 0, 0, [["h"],["i"]], false)`).
    let raw_lines = grid_lines_raw(params);
    let echoed_row = raw_lines
        .iter()
        .find(|(row, col_start, _)| *row == 0 && *col_start == 0)
        .expect("expected a grid_line at row 0, col_start 0");
    assert!(
        echoed_row.2.iter().all(|(_, arity)| *arity == 1),
        "default-style cells must omit hl_id entirely: {:?}",
        echoed_row.2
    );

    let _ = server.start_kill();
}

#[tokio::test]
async fn scenario_resize() {
    let dir = tempdir().unwrap();
    let socket_path = dir.path().join("vtmuxd.sock").to_string_lossy().to_string();
    let state_dir = dir.path().join("state");
    let mut server = spawn_server(&socket_path, &state_dir);
    wait_for_socket(&socket_path).await;

    let mut client = TestClient::connect(&socket_path).await;
    client
        .send(&encode_request(
            1,
            "spawn_pty",
            Value::Map(vec![(Value::from("rows"), Value::from(24)), (Value::from("cols"), Value::from(80))]),
        ))
        .await;
    let resp = client.recv_until(|v| is_response(v, 1)).await;
    let pty_id = match &resp {
        Value::Array(items) => match &items[3] {
            Value::Map(fields) => fields[0].1.as_u64().unwrap(),
            _ => panic!(),
        },
        _ => panic!(),
    };
    client.send(&encode_request(2, "attach", Value::Array(vec![Value::from(pty_id)]))).await;
    client.recv_until(|v| is_response(v, 2)).await;
    client.recv_until(|v| is_notification(v, "redraw")).await;

    client
        .send(&encode_request(3, "resize", Value::Array(vec![Value::from(30u64), Value::from(100u64)])))
        .await;
    client.recv_until(|v| is_response(v, 3)).await;

    // Next redraw after the resize notification should open with grid_resize
    // to (width=100, height=30).
    let redraw = client
        .recv_until(|v| {
            if !is_notification(v, "redraw") {
                return false;
            }
            let params = match v {
                Value::Array(items) => &items[2],
                _ => return false,
            };
            match params {
                Value::Array(events) => events.iter().any(|e| match e {
                    Value::Array(fields) => {
                        fields.first().and_then(|n| n.as_str()) == Some("grid_resize")
                            && fields.get(2).and_then(|w| w.as_u64()) == Some(100)
                            && fields.get(3).and_then(|h| h.as_u64()) == Some(30)
                    }
                    _ => false,
                }),
                _ => false,
            }
        })
        .await;
    assert!(is_notification(&redraw, "redraw"));

    let _ = server.start_kill();
}

#[tokio::test]
async fn scenario_child_exit() {
    let dir = tempdir().unwrap();
    let socket_path = dir.path().join("vtmuxd.sock").to_string_lossy().to_string();
    let state_dir = dir.path().join("state");
    let mut server = spawn_server(&socket_path, &state_dir);
    wait_for_socket(&socket_path).await;

    let mut client = TestClient::connect(&socket_path).await;
    client
        .send(&encode_request(
            1,
            "spawn_pty",
            Value::Map(vec![
                (Value::from("rows"), Value::from(24)),
                (Value::from("cols"), Value::from(80)),
                (Value::from("attach"), Value::from(true)),
            ]),
        ))
        .await;
    let resp = client.recv_until(|v| is_response(v, 1)).await;
    let pty_id = match &resp {
        Value::Array(items) => match &items[3] {
            Value::Map(fields) => fields[0].1.as_u64().unwrap(),
            _ => panic!(),
        },
        _ => panic!(),
    };

    client
        .send(&encode_notification(
            "write_pty",
            Value::Array(vec![Value::from(pty_id), Value::Binary(b"exit 7\r".to_vec())]),
        ))
        .await;

    let exit_notif = client.recv_until(|v| is_notification(v, "pty_exit")).await;
    match &exit_notif {
        Value::Array(items) => match &items[2] {
            Value::Array(fields) => {
                assert_eq!(fields[0].as_u64(), Some(pty_id));
            }
            _ => panic!("expected [pty_id, status] params"),
        },
        _ => panic!(),
    }

    client.send(&encode_request(2, "list_ptys", Value::Array(vec![]))).await;
    let resp = client.recv_until(|v| is_response(v, 2)).await;
    match &resp {
        Value::Array(items) => match &items[3] {
            Value::Map(fields) => {
                let ptys = &fields[0].1;
                match ptys {
                    Value::Array(entries) => assert!(entries.is_empty(), "exited pty should be gone from list_ptys"),
                    _ => panic!(),
                }
            }
            _ => panic!(),
        },
        _ => panic!(),
    }

    let _ = server.start_kill();
}

#[tokio::test]
async fn scenario_split_pane() {
    let dir = tempdir().unwrap();
    let socket_path = dir.path().join("vtmuxd.sock").to_string_lossy().to_string();
    let state_dir = dir.path().join("state");
    let mut server = spawn_server(&socket_path, &state_dir);
    wait_for_socket(&socket_path).await;

    let mut client = TestClient::connect(&socket_path).await;
    client
        .send(&encode_request(
            1,
            "spawn_pty",
            Value::Map(vec![
                (Value::from("rows"), Value::from(24)),
                (Value::from("cols"), Value::from(80)),
                (Value::from("attach"), Value::from(true)),
            ]),
        ))
        .await;
    let resp = client.recv_until(|v| is_response(v, 1)).await;
    let p1 = match &resp {
        Value::Array(items) => match &items[3] {
            Value::Map(fields) => fields[0].1.as_u64().unwrap(),
            _ => panic!(),
        },
        _ => panic!(),
    };

    client
        .send(&encode_request(
            2,
            "split_pane",
            Value::Map(vec![
                (Value::from("direction"), Value::from("row")),
                (Value::from("session"), Value::from("integration-test")),
            ]),
        ))
        .await;
    let resp = client.recv_until(|v| is_response(v, 2)).await;
    let p2 = match &resp {
        Value::Array(items) => match &items[3] {
            Value::Map(fields) => fields[0].1.as_u64().unwrap(),
            _ => panic!("split_pane should return a new pty_id"),
        },
        _ => panic!(),
    };
    assert_ne!(p1, p2, "split_pane must spawn a distinct pty");

    client.send(&encode_request(3, "list_ptys", Value::Array(vec![]))).await;
    let resp = client.recv_until(|v| is_response(v, 3)).await;
    let count = match &resp {
        Value::Array(items) => match &items[3] {
            Value::Map(fields) => match &fields[0].1 {
                Value::Array(entries) => entries.len(),
                _ => panic!(),
            },
            _ => panic!(),
        },
        _ => panic!(),
    };
    assert_eq!(count, 2, "both the original and split pane should be live");

    let _ = server.start_kill();
}

/// `attach(session_name)` (§4.6) subscribes to a session's active pane
/// rather than a fixed pty; closing that pane's pty must still notify the
/// session-attached client (the dead-client lookup for pty teardown has to
/// resolve through the session, not just a direct pty subscription).
#[tokio::test]
async fn scenario_attach_by_session_name() {
    let dir = tempdir().unwrap();
    let socket_path = dir.path().join("vtmuxd.sock").to_string_lossy().to_string();
    let state_dir = dir.path().join("state");
    let mut server = spawn_server(&socket_path, &state_dir);
    wait_for_socket(&socket_path).await;

    let mut client = TestClient::connect(&socket_path).await;
    client
        .send(&encode_request(
            1,
            "spawn_pty",
            Value::Map(vec![
                (Value::from("rows"), Value::from(24)),
                (Value::from("cols"), Value::from(80)),
                (Value::from("attach"), Value::from(true)),
            ]),
        ))
        .await;
    let resp = client.recv_until(|v| is_response(v, 1)).await;
    let p1 = match &resp {
        Value::Array(items) => match &items[3] {
            Value::Map(fields) => fields[0].1.as_u64().unwrap(),
            _ => panic!(),
        },
        _ => panic!(),
    };

    client
        .send(&encode_request(
            2,
            "split_pane",
            Value::Map(vec![
                (Value::from("direction"), Value::from("row")),
                (Value::from("session"), Value::from("named-session")),
            ]),
        ))
        .await;
    client.recv_until(|v| is_response(v, 2)).await;

    // A second client attaches by session name, not pty id.
    let mut viewer = TestClient::connect(&socket_path).await;
    viewer
        .send(&encode_request(3, "attach", Value::Array(vec![Value::from("named-session")])))
        .await;
    viewer.recv_until(|v| is_response(v, 3)).await;
    // Full paint of the active pane (the first leaf, p1) on attach.
    viewer.recv_until(|v| is_notification(v, "redraw")).await;

    client
        .send(&encode_notification("write_pty", Value::Array(vec![Value::from(p1), Value::Binary(b"exit 0\r".to_vec())])))
        .await;

    let exit_notif = viewer.recv_until(|v| is_notification(v, "pty_exit")).await;
    match &exit_notif {
        Value::Array(items) => match &items[2] {
            Value::Array(fields) => assert_eq!(fields[0].as_u64(), Some(p1)),
            _ => panic!("expected [pty_id, status] params"),
        },
        _ => panic!(),
    }

    let _ = server.start_kill();
}
