use notify::op;
use std::path::{Path, PathBuf};

/// What happened to a path, reduced to the cases the monitor dispatches on.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum Op {
    Create,
    Remove,
    Rename,
    Write,
}

/// Info about a path and its corresponding `notify` event
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct PathOp {
    pub path: PathBuf,
    pub op: Op,
}

impl PathOp {
    pub fn new(path: &Path, op: Op) -> Self {
        Self {
            path: path.to_path_buf(),
            op,
        }
    }

    /// Classifies a raw notify operation.
    ///
    /// A single raw event may carry several flags; create wins over remove,
    /// which wins over rename and write. Metadata-only changes and rescans
    /// yield `None`.
    pub fn from_raw(path: &Path, op_: op::Op) -> Option<Self> {
        let op = if Self::is_create(op_) {
            Op::Create
        } else if Self::is_remove(op_) {
            Op::Remove
        } else if Self::is_rename(op_) {
            Op::Rename
        } else if Self::is_write(op_) {
            Op::Write
        } else {
            return None;
        };

        Some(Self::new(path, op))
    }

    pub fn is_create(op_: op::Op) -> bool {
        op_.contains(op::CREATE)
    }

    pub fn is_remove(op_: op::Op) -> bool {
        op_.contains(op::REMOVE)
    }

    pub fn is_rename(op_: op::Op) -> bool {
        op_.contains(op::RENAME)
    }

    pub fn is_write(op_: op::Op) -> bool {
        op_.intersects(op::WRITE | op::CLOSE_WRITE)
    }
}
