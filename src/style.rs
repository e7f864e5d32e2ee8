//! Style / highlight records (§3) and the per-server interning table that
//! assigns stable numeric ids to them. Id 0 is always the default style.
//!
//! Cell-to-style extraction mirrors `vt100_style()` from the RobCoUnified
//! terminal renderer: each `vt100::Cell`'s color/attribute accessors map
//! directly onto this record.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Color {
    Default,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

impl From<vt100::Color> for Color {
    fn from(c: vt100::Color) -> Self {
        match c {
            vt100::Color::Default => Color::Default,
            vt100::Color::Idx(i) => Color::Indexed(i),
            vt100::Color::Rgb(r, g, b) => Color::Rgb(r, g, b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Style {
    pub fg: Option<Color>,
    pub bg: Option<Color>,
    pub special: Option<Color>,
    pub reverse: bool,
    pub italic: bool,
    pub bold: bool,
    pub underline: bool,
    pub strikethrough: bool,
    pub blend: u8,
}

impl Style {
    pub fn from_cell(cell: &vt100::Cell) -> Self {
        Style {
            fg: match cell.fgcolor() {
                vt100::Color::Default => None,
                c => Some(c.into()),
            },
            bg: match cell.bgcolor() {
                vt100::Color::Default => None,
                c => Some(c.into()),
            },
            special: None,
            reverse: cell.inverse(),
            italic: cell.italic(),
            bold: cell.bold(),
            underline: cell.underline(),
            strikethrough: false,
            blend: 0,
        }
    }

    pub fn is_default(&self) -> bool {
        *self == Style::default()
    }
}

/// Server-wide style interning table. Id 0 is reserved for the default style
/// and is never allocated a slot.
#[derive(Debug, Default)]
pub struct StyleTable {
    by_style: HashMap<Style, u64>,
    by_id: Vec<Style>,
    next_id: u64,
}

impl StyleTable {
    pub fn new() -> Self {
        StyleTable {
            by_style: HashMap::new(),
            by_id: Vec::new(),
            next_id: 1,
        }
    }

    /// Look up (or allocate) the id for `style`. The default style always
    /// maps to id 0 without occupying a table slot.
    pub fn intern(&mut self, style: Style) -> u64 {
        if style.is_default() {
            return 0;
        }
        if let Some(&id) = self.by_style.get(&style) {
            return id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.by_style.insert(style, id);
        self.by_id.push(style);
        id
    }

    pub fn get(&self, id: u64) -> Option<Style> {
        if id == 0 {
            return Some(Style::default());
        }
        self.by_id.get((id - 1) as usize).copied()
    }
}
