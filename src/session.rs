//! Named sessions of tabs of split panes (§3). A pane points at a PTY id; a
//! split holds children with ratios summing to 1. Sessions outlive client
//! detaches and are looked up by name in the `Server`'s session store.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Row,
    Col,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LayoutNode {
    Pane {
        pty_id: u64,
        cwd: String,
    },
    Split {
        direction: Direction,
        children: Vec<LayoutNode>,
        ratios: Vec<f64>,
    },
}

impl LayoutNode {
    /// A freshly created tab root is always a single pane.
    pub fn single_pane(pty_id: u64, cwd: String) -> Self {
        LayoutNode::Pane { pty_id, cwd }
    }

    /// True if every pty_id reachable from this node is present in `live`.
    pub fn is_dead(&self, live: &dyn Fn(u64) -> bool) -> bool {
        match self {
            LayoutNode::Pane { pty_id, .. } => !live(*pty_id),
            LayoutNode::Split { children, .. } => children.iter().all(|c| c.is_dead(live)),
        }
    }

    /// The first leaf pane reachable from this node, depth-first.
    pub fn first_pane_pty_id(&self) -> Option<u64> {
        match self {
            LayoutNode::Pane { pty_id, .. } => Some(*pty_id),
            LayoutNode::Split { children, .. } => children.first().and_then(|c| c.first_pane_pty_id()),
        }
    }

    /// Normalize ratios on a split node so they sum to exactly 1.0, with any
    /// rounding remainder distributed to the last child (§3).
    pub fn normalize_ratios(&mut self) {
        if let LayoutNode::Split { children, ratios, .. } = self {
            for child in children.iter_mut() {
                child.normalize_ratios();
            }
            if ratios.is_empty() {
                return;
            }
            let sum: f64 = ratios.iter().sum();
            if sum <= 0.0 {
                let even = 1.0 / ratios.len() as f64;
                ratios.iter_mut().for_each(|r| *r = even);
                return;
            }
            let last = ratios.len() - 1;
            let mut running = 0.0;
            for r in ratios.iter_mut().take(last) {
                *r /= sum;
                running += *r;
            }
            ratios[last] = 1.0 - running;
        }
    }
}

#[derive(Debug, Clone)]
pub struct Tab {
    pub root: LayoutNode,
}

impl Tab {
    /// The pty a viewer attached to this tab should show. Pane-focus within
    /// a split isn't tracked server-side (see `Session::split_active`), so
    /// this walks to the first leaf pane rather than a tracked "active" one.
    pub fn active_pane_pty_id(&self) -> Option<u64> {
        self.root.first_pane_pty_id()
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub name: String,
    pub tabs: Vec<Tab>,
    pub active_tab: usize,
}

impl Session {
    pub fn new(name: String, first_pty: u64, cwd: String) -> Self {
        Session {
            name,
            tabs: vec![Tab {
                root: LayoutNode::single_pane(first_pty, cwd),
            }],
            active_tab: 0,
        }
    }

    pub fn active_tab(&self) -> &Tab {
        &self.tabs[self.active_tab]
    }

    pub fn active_tab_mut(&mut self) -> &mut Tab {
        &mut self.tabs[self.active_tab]
    }

    /// Split the active tab's root pane into a row/col split with a new pane.
    /// Only supports splitting when the active root is a single pane; nested
    /// split targeting is a client-UI concern (tracked by which pane in the
    /// layout the client considers "active", not modeled on the server).
    pub fn split_active(&mut self, direction: Direction, new_pty: u64, cwd: String) {
        let tab = self.active_tab_mut();
        let existing = tab.root.clone();
        tab.root = LayoutNode::Split {
            direction,
            children: vec![existing, LayoutNode::single_pane(new_pty, cwd)],
            ratios: vec![0.5, 0.5],
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_remainder_goes_to_last_child() {
        let mut node = LayoutNode::Split {
            direction: Direction::Row,
            children: vec![
                LayoutNode::single_pane(1, "/".into()),
                LayoutNode::single_pane(2, "/".into()),
                LayoutNode::single_pane(3, "/".into()),
            ],
            ratios: vec![0.33, 0.33, 0.33],
        };
        node.normalize_ratios();
        if let LayoutNode::Split { ratios, .. } = node {
            let sum: f64 = ratios.iter().sum();
            assert!((sum - 1.0).abs() < 1e-9);
        } else {
            panic!("expected split");
        }
    }

    #[test]
    fn split_active_creates_two_panes_half_each() {
        let mut session = Session::new("work".into(), 1, "/home".into());
        session.split_active(Direction::Row, 2, "/home".into());
        match &session.active_tab().root {
            LayoutNode::Split { children, ratios, .. } => {
                assert_eq!(children.len(), 2);
                assert_eq!(ratios, &vec![0.5, 0.5]);
            }
            _ => panic!("expected split root"),
        }
    }

    #[test]
    fn active_pane_pty_id_walks_to_first_leaf() {
        let mut session = Session::new("work".into(), 1, "/home".into());
        session.split_active(Direction::Col, 2, "/home".into());
        assert_eq!(session.active_tab().active_pane_pty_id(), Some(1));
    }

    #[test]
    fn dead_pane_detection() {
        let node = LayoutNode::single_pane(5, "/".into());
        assert!(node.is_dead(&|id| id != 5));
        assert!(!node.is_dead(&|id| id == 5));
    }
}
