use std::fmt;

use crate::{origin::OriginTrie, ObjectId};

/// A tracked object as read back from the object system at report time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveEntry {
    pub id: ObjectId,
    pub type_name: String,
    pub ref_count: u32,
}

/// Readable entries of a set of tracked objects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectList {
    pub entries: Vec<LiveEntry>,
    /// Size of the underlying set, including entries that could not be read
    pub total: usize,
}

impl fmt::Display for ObjectList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(
                f,
                " - {}, {}: {} refs",
                entry.id, entry.type_name, entry.ref_count
            )?;
        }
        writeln!(f, "{} objects", self.total)
    }
}

/// Everything currently alive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveReport(pub ObjectList);

impl fmt::Display for LiveReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Living Objects:")?;
        write!(f, "{}", self.0)
    }
}

/// What changed since the previous checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointReport {
    pub added: ObjectList,
    /// Finalized objects with the type name they had when they went away
    pub removed: Vec<(ObjectId, String)>,
}

impl fmt::Display for CheckpointReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Added Objects:")?;
        write!(f, "{}", self.added)?;
        writeln!(f, "\nRemoved Objects:")?;
        for (id, type_name) in &self.removed {
            writeln!(f, " - {id}, {type_name}")?;
        }
        writeln!(f, "{} objects", self.removed.len())?;
        writeln!(f, "\nSaved new check point")
    }
}

/// Printed once when the process goes away.
#[derive(Debug, Clone, Default)]
pub struct FinalReport {
    pub alive: ObjectList,
    /// Present when origin tracing is enabled
    pub origins: Option<Vec<OriginTrie>>,
}

impl fmt::Display for FinalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\nStill Alive:")?;
        write!(f, "{}", self.alive)?;
        if let Some(origins) = &self.origins {
            writeln!(f, "\nReferences:")?;
            for (i, trie) in origins.iter().enumerate() {
                writeln!(f, "#{}", i + 1)?;
                write!(f, "{trie}")?;
            }
        }
        Ok(())
    }
}
