//! In-memory virtual filesystem.
//!
//! This module provides:
//! - [`VirtualFs`] - A hierarchical tree of files and directories addressed by
//!   absolute slash-delimited paths
//! - [`FsNode`] - A node of that tree (exclusively owned by its parent)
//!
//! The filesystem is the authority on structure only. It never consults the
//! permission system; callers (sandboxed code included) check permissions
//! themselves before mutating anything.
//!
//! Freshly constructed filesystems contain:
//!
//! ```text
//! /
//! ├── home/
//! │   └── project/
//! │       └── example.txt
//! └── tmp/
//! ```

mod tree;

pub use tree::{FsNode, NodeKind, VirtualFs};
