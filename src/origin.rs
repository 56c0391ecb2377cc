use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::stack::Frame;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RefKind {
    Ref,
    Unref,
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefKind::Ref => write!(f, "ref"),
            RefKind::Unref => write!(f, "unref"),
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    label: Arc<str>,
    children: Vec<Node>,
    /// Stacks that ended exactly here
    refs: u64,
    unrefs: u64,
}

impl Node {
    fn new(label: Arc<str>) -> Self {
        Self {
            label,
            children: vec![],
            refs: 0,
            unrefs: 0,
        }
    }

    fn child(&mut self, label: &Arc<str>) -> &mut Node {
        let index = match self.children.iter().position(|x| x.label == *label) {
            Some(index) => index,
            None => {
                self.children.push(Node::new(label.clone()));
                self.children.len() - 1
            }
        };
        &mut self.children[index]
    }

    fn collect(&self, prefix: &mut Vec<Arc<str>>, out: &mut Vec<OriginPath>) {
        for (kind, count) in [(RefKind::Ref, self.refs), (RefKind::Unref, self.unrefs)] {
            if count > 0 {
                out.push(OriginPath {
                    frames: prefix.clone(),
                    kind,
                    count,
                });
            }
        }
        for child in &self.children {
            prefix.push(child.label.clone());
            child.collect(prefix, out);
            prefix.pop();
        }
    }
}

/// One distinct call stack and how often it was seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginPath {
    pub frames: Vec<Arc<str>>,
    pub kind: RefKind,
    pub count: u64,
}

/// Prefix tree of the stacks reference changes to one type came from.
#[derive(Debug, Clone)]
pub struct OriginTrie {
    type_name: Arc<str>,
    root: Node,
}

impl OriginTrie {
    pub fn new(type_name: impl Into<Arc<str>>) -> Self {
        Self {
            type_name: type_name.into(),
            root: Node::new(Arc::from("")),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// `frames` is innermost first, so stacks share nodes from the reference
    /// operation outwards.
    pub fn insert(&mut self, frames: &[Frame], kind: RefKind) {
        let mut node = &mut self.root;
        for frame in frames {
            node = node.child(&frame.name);
        }
        match kind {
            RefKind::Ref => node.refs += 1,
            RefKind::Unref => node.unrefs += 1,
        }
    }

    /// All recorded stacks in insertion order of their first frames.
    pub fn paths(&self) -> Vec<OriginPath> {
        let mut out = vec![];
        self.root.collect(&mut vec![], &mut out);
        out
    }

    pub fn total(&self, kind: RefKind) -> u64 {
        self.paths()
            .iter()
            .filter(|x| x.kind == kind)
            .map(|x| x.count)
            .sum()
    }
}

impl fmt::Display for OriginTrie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.type_name)?;
        for path in self.paths() {
            writeln!(f, "  [{}] x{}", path.kind, path.count)?;
            if path.frames.is_empty() {
                writeln!(f, "    <no frames>")?;
            }
            for frame in &path.frames {
                writeln!(f, "    {frame}")?;
            }
        }
        Ok(())
    }
}

/// Origin tries keyed by type name.
#[derive(Debug, Default)]
pub struct Origins {
    tries: BTreeMap<Arc<str>, OriginTrie>,
}

impl Origins {
    pub fn record(&mut self, type_name: &str, frames: &[Frame], kind: RefKind) {
        if let Some(trie) = self.tries.get_mut(type_name) {
            trie.insert(frames, kind);
            return;
        }
        let type_name: Arc<str> = Arc::from(type_name);
        let mut trie = OriginTrie::new(type_name.clone());
        trie.insert(frames, kind);
        self.tries.insert(type_name, trie);
    }

    pub fn clear(&mut self) {
        self.tries.clear();
    }

    /// Copies of every trie, ordered by type name.
    pub fn snapshot(&self) -> Vec<OriginTrie> {
        self.tries.values().cloned().collect()
    }
}
