//! Session persistence (§6, external collaborator boundary).
//!
//! The core consumes sessions through the `SessionStore` trait and never
//! parses JSON itself; `JsonSessionStore` is the one concrete implementation
//! this binary ships, matching the file shape from §6:
//! `$HOME/.local/state/<name>/sessions/<session>.json`.

use crate::session::{Direction, LayoutNode, Session, Tab};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub trait SessionStore: Send {
    fn load(&self, name: &str) -> anyhow::Result<Option<Session>>;
    fn save(&self, session: &Session) -> anyhow::Result<()>;
    fn rename(&self, from: &str, to: &str) -> anyhow::Result<()>;
    fn delete(&self, name: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionFile {
    active_tab: usize,
    tabs: Vec<TabFile>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TabFile {
    root: NodeFile,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum NodeFile {
    Pane {
        pty_id: u64,
        cwd: String,
    },
    Split {
        direction: String,
        children: Vec<NodeFile>,
        #[serde(default)]
        ratio: Vec<f64>,
    },
}

impl From<&LayoutNode> for NodeFile {
    fn from(node: &LayoutNode) -> Self {
        match node {
            LayoutNode::Pane { pty_id, cwd } => NodeFile::Pane {
                pty_id: *pty_id,
                cwd: cwd.clone(),
            },
            LayoutNode::Split { direction, children, ratios } => NodeFile::Split {
                direction: match direction {
                    Direction::Row => "row".to_string(),
                    Direction::Col => "col".to_string(),
                },
                children: children.iter().map(NodeFile::from).collect(),
                ratio: ratios.clone(),
            },
        }
    }
}

impl From<NodeFile> for LayoutNode {
    fn from(node: NodeFile) -> Self {
        match node {
            NodeFile::Pane { pty_id, cwd } => LayoutNode::Pane { pty_id, cwd },
            NodeFile::Split { direction, children, ratio } => LayoutNode::Split {
                direction: if direction == "col" { Direction::Col } else { Direction::Row },
                children: children.into_iter().map(LayoutNode::from).collect(),
                ratios: ratio,
            },
        }
    }
}

pub struct JsonSessionStore {
    state_dir: PathBuf,
}

impl JsonSessionStore {
    /// `state_dir` is `$HOME/.local/state/<name>/sessions`.
    pub fn new(state_dir: PathBuf) -> Self {
        JsonSessionStore { state_dir }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{name}.json"))
    }
}

impl SessionStore for JsonSessionStore {
    fn load(&self, name: &str) -> anyhow::Result<Option<Session>> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        let file: SessionFile = serde_json::from_str(&raw)?;
        Ok(Some(Session {
            name: name.to_string(),
            // §6: `active_tab` is 1-based on disk; in-memory it's a 0-based index.
            active_tab: file.active_tab.saturating_sub(1),
            tabs: file
                .tabs
                .into_iter()
                .map(|t| Tab { root: t.root.into() })
                .collect(),
        }))
    }

    fn save(&self, session: &Session) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.state_dir)?;
        let file = SessionFile {
            active_tab: session.active_tab + 1,
            tabs: session
                .tabs
                .iter()
                .map(|t| TabFile { root: NodeFile::from(&t.root) })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(self.path_for(&session.name), json)?;
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> anyhow::Result<()> {
        std::fs::rename(self.path_for(from), self.path_for(to))?;
        Ok(())
    }

    fn delete(&self, name: &str) -> anyhow::Result<()> {
        let path = self.path_for(name);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use tempfile::tempdir;

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path().to_path_buf());
        let mut session = Session::new("work".into(), 1, "/home/user".into());
        session.split_active(Direction::Col, 2, "/home/user".into());

        store.save(&session).unwrap();
        let loaded = store.load("work").unwrap().unwrap();

        assert_eq!(loaded.active_tab, 0);
        match &loaded.tabs[0].root {
            LayoutNode::Split { children, .. } => assert_eq!(children.len(), 2),
            _ => panic!("expected split"),
        }
    }

    #[test]
    fn load_missing_session_is_none() {
        let dir = tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path().to_path_buf());
        assert!(store.load("nope").unwrap().is_none());
    }

    #[test]
    fn rename_moves_file() {
        let dir = tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path().to_path_buf());
        let session = Session::new("old".into(), 1, "/".into());
        store.save(&session).unwrap();
        store.rename("old", "new").unwrap();
        assert!(store.load("old").unwrap().is_none());
        assert!(store.load("new").unwrap().is_some());
    }
}
