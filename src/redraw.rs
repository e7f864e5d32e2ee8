//! Redraw builder (§4.5): diffs a PTY's emulator screen against each
//! client's last-known view and emits a minimal sequence of redraw events.
//!
//! The per-cell style extraction mirrors `vt100_style()` from the
//! RobCoUnified terminal renderer; the row-span diff is new logic driven
//! directly by the algorithm in §4.5.

use crate::style::{Color, Style, StyleTable};
use rmpv::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum RedrawEvent {
    GridResize { grid: u64, width: u16, height: u16 },
    HlAttrDefine { id: u64, style: Style },
    DefaultColorsSet { fg: Color, bg: Color, special: Color },
    GridLine { grid: u64, row: u16, col_start: u16, cells: Vec<RunCell>, wrap: bool },
    GridCursorGoto { grid: u64, row: u16, col: u16 },
    GridClear { grid: u64 },
    Flush,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunCell {
    pub text: String,
    pub hl_id: Option<u64>,
    pub repeat: Option<u32>,
}

/// One cell's worth of diffable state: text plus its interned style id.
#[derive(Debug, Clone, PartialEq)]
pub struct SentCell {
    pub text: String,
    pub hl_id: u64,
}

/// A client's last-sent view of one grid: used both to diff against and to
/// update as events are emitted (so a partial send cannot desync — §4.5).
#[derive(Debug, Clone, Default)]
pub struct GridSnapshot {
    pub rows: Vec<Vec<SentCell>>,
    pub cursor: Option<(u16, u16)>,
}

/// Builds the minimal `grid_line` events needed to bring `snapshot` in line
/// with `screen`, updating `snapshot` in place as it goes, interning any new
/// styles into `styles`, and tracking which hl ids this particular client has
/// already seen via `known_hl_ids`.
pub fn diff_screen(
    grid: u64,
    screen: &vt100::Screen,
    snapshot: &mut GridSnapshot,
    styles: &mut StyleTable,
    known_hl_ids: &mut std::collections::HashSet<u64>,
) -> Vec<RedrawEvent> {
    let (rows, cols) = screen.size();
    let mut events = Vec::new();

    if snapshot.rows.len() != rows as usize || snapshot.rows.iter().any(|r| r.len() != cols as usize) {
        // First time this client sees `grid` (or its dimensions changed):
        // §4.5 lists `default_colors_set` alongside `grid_resize` as part of
        // the bootstrap a client needs before it can render anything.
        if snapshot.rows.is_empty() {
            events.push(RedrawEvent::DefaultColorsSet {
                fg: Color::Default,
                bg: Color::Default,
                special: Color::Default,
            });
        }
        events.push(RedrawEvent::GridResize { grid, width: cols, height: rows });
        snapshot.rows = vec![
            vec![SentCell { text: String::new(), hl_id: 0 }; cols as usize];
            rows as usize
        ];
    }

    for row in 0..rows {
        let current: Vec<SentCell> = (0..cols)
            .map(|col| {
                let cell = screen.cell(row, col);
                let (text, hl_id) = match cell {
                    Some(c) => {
                        let style = Style::from_cell(c);
                        let hl_id = styles.intern(style);
                        (c.contents(), hl_id)
                    }
                    None => (String::new(), 0),
                };
                SentCell { text, hl_id }
            })
            .collect();

        let old = &snapshot.rows[row as usize];
        let mut first_diff = None;
        let mut last_diff = None;
        for col in 0..cols as usize {
            if old[col] != current[col] {
                if first_diff.is_none() {
                    first_diff = Some(col);
                }
                last_diff = Some(col);
            }
        }

        if let (Some(start), Some(end)) = (first_diff, last_diff) {
            let span = &current[start..=end];

            for cell in span {
                if cell.hl_id != 0 && known_hl_ids.insert(cell.hl_id) {
                    if let Some(style) = styles.get(cell.hl_id) {
                        events.push(RedrawEvent::HlAttrDefine { id: cell.hl_id, style });
                    }
                }
            }

            events.push(RedrawEvent::GridLine {
                grid,
                row,
                col_start: start as u16,
                cells: run_length_encode(span),
                wrap: false,
            });
        }

        snapshot.rows[row as usize] = current;
    }

    let cursor = if screen.hide_cursor() {
        None
    } else {
        let (r, c) = screen.cursor_position();
        Some((r, c))
    };
    if cursor != snapshot.cursor {
        if let Some((r, c)) = cursor {
            events.push(RedrawEvent::GridCursorGoto { grid, row: r, col: c });
        }
        snapshot.cursor = cursor;
    }

    events
}

fn run_length_encode(cells: &[SentCell]) -> Vec<RunCell> {
    let mut out = Vec::new();
    let mut i = 0;
    // A cell run starts in the default highlight context (id 0) until told
    // otherwise, so a span of untouched/default cells omits `hl_id` entirely
    // rather than spelling out `0` (§8 scenario 1: `[["h"],["i"]]`, not
    // `[["h",0],["i"]]`).
    let mut prev_hl: Option<u64> = Some(0);
    while i < cells.len() {
        let hl_id = cells[i].hl_id;
        let mut j = i + 1;
        while j < cells.len() && cells[j].text == cells[i].text && cells[j].hl_id == hl_id {
            j += 1;
        }
        let repeat = (j - i) as u32;
        out.push(RunCell {
            text: cells[i].text.clone(),
            hl_id: if Some(hl_id) == prev_hl { None } else { Some(hl_id) },
            repeat: if repeat > 1 { Some(repeat) } else { None },
        });
        prev_hl = Some(hl_id);
        i = j;
    }
    out
}

/// Encode a batch of events as the `params` value for a `[2, "redraw", params]`
/// notification: `[event, event, …]` where each event is `[name, fields…]`.
pub fn encode_events(events: &[RedrawEvent]) -> Value {
    Value::Array(events.iter().map(encode_event).collect())
}

fn encode_style(style: &Style) -> Value {
    let mut fields = Vec::new();
    if let Some(c) = style.fg {
        fields.push((Value::from("foreground"), encode_color(c)));
    }
    if let Some(c) = style.bg {
        fields.push((Value::from("background"), encode_color(c)));
    }
    if let Some(c) = style.special {
        fields.push((Value::from("special"), encode_color(c)));
    }
    if style.reverse {
        fields.push((Value::from("reverse"), Value::from(true)));
    }
    if style.italic {
        fields.push((Value::from("italic"), Value::from(true)));
    }
    if style.bold {
        fields.push((Value::from("bold"), Value::from(true)));
    }
    if style.underline {
        fields.push((Value::from("underline"), Value::from(true)));
    }
    if style.strikethrough {
        fields.push((Value::from("strikethrough"), Value::from(true)));
    }
    Value::Map(fields)
}

fn encode_color(c: Color) -> Value {
    match c {
        Color::Default => Value::Nil,
        Color::Indexed(i) => Value::from(i),
        Color::Rgb(r, g, b) => Value::from(((r as u32) << 16) | ((g as u32) << 8) | b as u32),
    }
}

fn encode_event(event: &RedrawEvent) -> Value {
    match event {
        RedrawEvent::GridResize { grid, width, height } => Value::Array(vec![
            Value::from("grid_resize"),
            Value::from(*grid),
            Value::from(*width),
            Value::from(*height),
        ]),
        RedrawEvent::HlAttrDefine { id, style } => Value::Array(vec![
            Value::from("hl_attr_define"),
            Value::from(*id),
            encode_style(style),
        ]),
        RedrawEvent::DefaultColorsSet { fg, bg, special } => Value::Array(vec![
            Value::from("default_colors_set"),
            encode_color(*fg),
            encode_color(*bg),
            encode_color(*special),
        ]),
        RedrawEvent::GridLine { grid, row, col_start, cells, wrap } => {
            let encoded_cells = cells
                .iter()
                .map(|c| {
                    let mut v = vec![Value::from(c.text.as_str())];
                    if let Some(hl) = c.hl_id {
                        v.push(Value::from(hl));
                        if let Some(r) = c.repeat {
                            v.push(Value::from(r));
                        }
                    } else if let Some(r) = c.repeat {
                        // Cannot omit hl_id while specifying repeat; re-emit.
                        v.push(Value::Nil);
                        v.push(Value::from(r));
                    }
                    Value::Array(v)
                })
                .collect();
            Value::Array(vec![
                Value::from("grid_line"),
                Value::from(*grid),
                Value::from(*row),
                Value::from(*col_start),
                Value::Array(encoded_cells),
                Value::from(*wrap),
            ])
        }
        RedrawEvent::GridCursorGoto { grid, row, col } => Value::Array(vec![
            Value::from("grid_cursor_goto"),
            Value::from(*grid),
            Value::from(*row),
            Value::from(*col),
        ]),
        RedrawEvent::GridClear { grid } => {
            Value::Array(vec![Value::from("grid_clear"), Value::from(*grid)])
        }
        RedrawEvent::Flush => Value::Array(vec![Value::from("flush")]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn screen_from(text: &str, rows: u16, cols: u16) -> vt100::Parser {
        let mut parser = vt100::Parser::new(rows, cols, 0);
        parser.process(text.as_bytes());
        parser
    }

    #[test]
    fn first_diff_emits_full_resize_and_paint() {
        let parser = screen_from("hi", 2, 5);
        let mut snapshot = GridSnapshot::default();
        let mut styles = StyleTable::new();
        let mut known = HashSet::new();
        let events = diff_screen(1, parser.screen(), &mut snapshot, &mut styles, &mut known);
        assert!(matches!(events[0], RedrawEvent::DefaultColorsSet { .. }));
        assert!(matches!(events[1], RedrawEvent::GridResize { .. }));
        assert!(events.iter().any(|e| matches!(e, RedrawEvent::GridLine { row: 0, .. })));
    }

    #[test]
    fn diff_minimality_single_changed_span() {
        let mut parser = screen_from("aaaaa", 1, 5);
        let mut snapshot = GridSnapshot::default();
        let mut styles = StyleTable::new();
        let mut known = HashSet::new();
        diff_screen(1, parser.screen(), &mut snapshot, &mut styles, &mut known);

        // Move cursor back and overwrite columns 1-2 only.
        parser.process(b"\x1b[1;2Hbb");
        let events = diff_screen(1, parser.screen(), &mut snapshot, &mut styles, &mut known);

        let grid_lines: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, RedrawEvent::GridLine { .. }))
            .collect();
        assert_eq!(grid_lines.len(), 1);
        if let RedrawEvent::GridLine { row, col_start, .. } = grid_lines[0] {
            assert_eq!(*row, 0);
            assert_eq!(*col_start, 1);
        }
    }

    #[test]
    fn attach_idempotence_second_attach_is_noop_after_full_paint() {
        let parser = screen_from("x", 1, 3);
        let mut snapshot = GridSnapshot::default();
        let mut styles = StyleTable::new();
        let mut known = HashSet::new();
        let first = diff_screen(1, parser.screen(), &mut snapshot, &mut styles, &mut known);
        assert!(!first.is_empty());
        let second = diff_screen(1, parser.screen(), &mut snapshot, &mut styles, &mut known);
        assert!(second.is_empty());
    }

    #[test]
    fn no_cross_client_leakage_independent_known_sets() {
        let parser = screen_from("x", 1, 3);
        let mut snapshot_a = GridSnapshot::default();
        let mut snapshot_b = GridSnapshot::default();
        let mut styles = StyleTable::new();
        let mut known_a = HashSet::new();
        let mut known_b = HashSet::new();

        diff_screen(1, parser.screen(), &mut snapshot_a, &mut styles, &mut known_a);
        let events_b = diff_screen(1, parser.screen(), &mut snapshot_b, &mut styles, &mut known_b);
        // Client B's first paint must re-declare hl_attr_define even though A
        // already saw the same style ids, since B's known set is independent.
        assert!(events_b.iter().any(|e| matches!(e, RedrawEvent::GridResize { .. })));
    }
}
