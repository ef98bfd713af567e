//! Tree storage for the virtual filesystem.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a filesystem node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// A file holding string content
    File,
    /// A directory holding ordered children
    Directory,
}

#[derive(Clone, Debug)]
enum NodeData {
    File { content: String },
    Directory { children: Vec<FsNode> },
}

/// A node of the filesystem tree.
///
/// Directories own their children exclusively; names are unique among
/// siblings and children keep creation order.
#[derive(Clone, Debug)]
pub struct FsNode {
    id: Uuid,
    name: String,
    data: NodeData,
}

impl FsNode {
    fn directory(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            data: NodeData::Directory {
                children: Vec::new(),
            },
        }
    }

    fn file(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            data: NodeData::File {
                content: content.into(),
            },
        }
    }

    /// Unique identity of this node.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Name of this node (`"root"` for the root).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this node is a file or a directory.
    pub fn kind(&self) -> NodeKind {
        match self.data {
            NodeData::File { .. } => NodeKind::File,
            NodeData::Directory { .. } => NodeKind::Directory,
        }
    }

    /// Returns true for directories.
    pub fn is_dir(&self) -> bool {
        self.kind() == NodeKind::Directory
    }

    /// Returns true for files.
    pub fn is_file(&self) -> bool {
        self.kind() == NodeKind::File
    }

    /// File content, `None` for directories.
    pub fn content(&self) -> Option<&str> {
        match &self.data {
            NodeData::File { content } => Some(content),
            NodeData::Directory { .. } => None,
        }
    }

    /// Ordered children; empty for files.
    pub fn children(&self) -> &[FsNode] {
        match &self.data {
            NodeData::Directory { children } => children,
            NodeData::File { .. } => &[],
        }
    }

    fn child(&self, name: &str) -> Option<&FsNode> {
        self.children().iter().find(|c| c.name == name)
    }

    fn child_mut(&mut self, name: &str) -> Option<&mut FsNode> {
        self.children_mut()?.iter_mut().find(|c| c.name == name)
    }

    fn children_mut(&mut self) -> Option<&mut Vec<FsNode>> {
        match &mut self.data {
            NodeData::Directory { children } => Some(children),
            NodeData::File { .. } => None,
        }
    }
}

/// In-memory hierarchical filesystem.
///
/// All operations take absolute slash-delimited paths. Empty segments are
/// ignored, so `/a//b/` and `/a/b` name the same node. There are no symlinks
/// and `.`/`..` are ordinary names.
///
/// The tree lives behind a lock so a single instance can be shared between
/// the pipeline and sandboxed code.
#[derive(Debug)]
pub struct VirtualFs {
    root: RwLock<FsNode>,
}

impl Default for VirtualFs {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualFs {
    /// Create a filesystem seeded with `/home/project/example.txt` and `/tmp`.
    pub fn new() -> Self {
        let fs = Self::empty();
        fs.mkdir("/home");
        fs.mkdir("/home/project");
        fs.mkdir("/tmp");
        fs.write_file("/home/project/example.txt", "This is an example file.");
        fs
    }

    /// Create a filesystem containing only the root directory.
    pub fn empty() -> Self {
        Self {
            root: RwLock::new(FsNode::directory("root")),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, FsNode> {
        self.root.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FsNode> {
        self.root.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create every missing directory along `path`.
    ///
    /// Existing directories are left alone. Returns false if a segment
    /// already exists as a file.
    pub fn mkdir(&self, path: &str) -> bool {
        let mut root = self.write();
        let mut current: &mut FsNode = &mut root;
        for part in components(path) {
            let Some(children) = current.children_mut() else {
                return false;
            };
            let index = match children.iter().position(|c| c.name == part) {
                Some(index) => index,
                None => {
                    children.push(FsNode::directory(part));
                    children.len() - 1
                }
            };
            current = &mut children[index];
        }
        current.is_dir()
    }

    /// Create or overwrite the file at `path`.
    ///
    /// The parent directory must already exist. Returns false if it does not,
    /// or if `path` names an existing directory.
    pub fn write_file(&self, path: &str, content: &str) -> bool {
        let parts = components(path);
        let Some((name, parent)) = parts.split_last() else {
            return false;
        };

        let mut root = self.write();
        let Some(children) = find_mut(&mut root, parent).and_then(FsNode::children_mut) else {
            return false;
        };
        match children.iter_mut().find(|c| c.name == *name) {
            Some(existing) => match &mut existing.data {
                NodeData::File { content: current } => {
                    *current = content.to_string();
                    true
                }
                NodeData::Directory { .. } => false,
            },
            None => {
                children.push(FsNode::file(*name, content));
                true
            }
        }
    }

    /// Content of the file at `path`, or `None` if it is not a file.
    pub fn read_file(&self, path: &str) -> Option<String> {
        let root = self.read();
        find(&root, &components(path))?.content().map(str::to_string)
    }

    /// Names of the immediate children of the directory at `path`.
    ///
    /// Returns `None` if `path` is not a directory.
    pub fn list_files(&self, path: &str) -> Option<Vec<String>> {
        let root = self.read();
        let node = find(&root, &components(path))?;
        node.is_dir()
            .then(|| node.children().iter().map(|c| c.name.clone()).collect())
    }

    /// Remove the file at `path`.
    ///
    /// Returns false (leaving the tree untouched) if there is no file there.
    pub fn delete_file(&self, path: &str) -> bool {
        let parts = components(path);
        let Some((name, parent)) = parts.split_last() else {
            return false;
        };
        let mut root = self.write();
        detach_file(&mut root, parent, name).is_some()
    }

    /// Move the file at `src` to `dst`, overwriting a file already at `dst`.
    ///
    /// The node is detached from its parent and re-attached under the
    /// destination directory in one step while holding the write lock, so
    /// there is never a moment where both paths hold the content. The node
    /// keeps its identity. On failure the tree is unchanged.
    pub fn move_file(&self, src: &str, dst: &str) -> bool {
        let src_parts = components(src);
        let dst_parts = components(dst);
        let (Some((src_name, src_parent)), Some((dst_name, dst_parent))) =
            (src_parts.split_last(), dst_parts.split_last())
        else {
            return false;
        };

        let mut root = self.write();

        if !find(&root, &src_parts).is_some_and(FsNode::is_file) {
            return false;
        }
        let Some(dst_dir) = find(&root, dst_parent).filter(|n| n.is_dir()) else {
            return false;
        };
        if dst_dir.child(dst_name).is_some_and(FsNode::is_dir) {
            return false;
        }
        if src_parts == dst_parts {
            return true;
        }

        let Some(mut node) = detach_file(&mut root, src_parent, src_name) else {
            return false;
        };
        node.name = (*dst_name).to_string();
        match attach(&mut root, dst_parent, node) {
            Ok(()) => true,
            Err(mut node) => {
                // Validated above under the same lock; put it back regardless.
                node.name = (*src_name).to_string();
                let _ = attach(&mut root, src_parent, node);
                false
            }
        }
    }

    /// Lines of the file at `path` containing `term` as a substring.
    ///
    /// Returns `None` if the file does not exist.
    pub fn search_in_file(&self, path: &str, term: &str) -> Option<Vec<String>> {
        let content = self.read_file(path)?;
        Some(
            content
                .split('\n')
                .filter(|line| line.contains(term))
                .map(str::to_string)
                .collect(),
        )
    }

    /// Returns true if any node exists at `path`.
    pub fn exists(&self, path: &str) -> bool {
        find(&self.read(), &components(path)).is_some()
    }

    /// Returns true if `path` names a directory.
    pub fn is_dir(&self, path: &str) -> bool {
        find(&self.read(), &components(path)).is_some_and(FsNode::is_dir)
    }

    /// Deep copy of the whole tree.
    pub fn snapshot(&self) -> FsNode {
        self.read().clone()
    }
}

fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn find<'a>(root: &'a FsNode, parts: &[&str]) -> Option<&'a FsNode> {
    let mut current = root;
    for part in parts {
        current = current.child(part)?;
    }
    Some(current)
}

fn find_mut<'a>(root: &'a mut FsNode, parts: &[&str]) -> Option<&'a mut FsNode> {
    let mut current = root;
    for part in parts {
        current = current.child_mut(part)?;
    }
    Some(current)
}

/// Remove and return the file `name` under the directory at `parent`.
fn detach_file(root: &mut FsNode, parent: &[&str], name: &str) -> Option<FsNode> {
    let children = find_mut(root, parent)?.children_mut()?;
    let index = children
        .iter()
        .position(|c| c.name == name && c.is_file())?;
    Some(children.remove(index))
}

/// Insert `node` under the directory at `parent`, replacing a file of the
/// same name in place.
fn attach(root: &mut FsNode, parent: &[&str], node: FsNode) -> Result<(), FsNode> {
    let Some(children) = find_mut(root, parent).and_then(FsNode::children_mut) else {
        return Err(node);
    };
    match children.iter().position(|c| c.name == node.name) {
        Some(index) if children[index].is_file() => children[index] = node,
        Some(_) => return Err(node),
        None => children.push(node),
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_layout() {
        let fs = VirtualFs::new();
        assert_eq!(fs.list_files("/").unwrap(), vec!["home", "tmp"]);
        assert_eq!(fs.list_files("/home").unwrap(), vec!["project"]);
        assert_eq!(
            fs.read_file("/home/project/example.txt").unwrap(),
            "This is an example file."
        );
        assert_eq!(fs.list_files("/tmp").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_root_invariants() {
        let fs = VirtualFs::empty();
        let root = fs.snapshot();
        assert_eq!(root.name(), "root");
        assert!(root.is_dir());
        assert!(root.content().is_none());
        assert!(fs.list_files("/").unwrap().is_empty());
    }

    #[test]
    fn test_mkdir_creates_intermediate_directories() {
        let fs = VirtualFs::empty();
        assert!(fs.mkdir("/a/b/c"));
        assert!(fs.list_files("/a").unwrap().contains(&"b".to_string()));
        assert!(fs.list_files("/a/b").unwrap().contains(&"c".to_string()));
        // Idempotent
        assert!(fs.mkdir("/a/b/c"));
        assert_eq!(fs.list_files("/a/b").unwrap(), vec!["c"]);
    }

    #[test]
    fn test_mkdir_through_file_fails() {
        let fs = VirtualFs::new();
        assert!(!fs.mkdir("/home/project/example.txt/sub"));
        assert!(!fs.mkdir("/home/project/example.txt"));
        assert!(fs.read_file("/home/project/example.txt").is_some());
    }

    #[test]
    fn test_write_read_round_trip_and_overwrite() {
        let fs = VirtualFs::new();
        assert!(fs.write_file("/tmp/a.txt", "one"));
        assert_eq!(fs.read_file("/tmp/a.txt").unwrap(), "one");

        assert!(fs.write_file("/tmp/a.txt", "two"));
        assert_eq!(fs.read_file("/tmp/a.txt").unwrap(), "two");
        assert_eq!(fs.list_files("/tmp").unwrap(), vec!["a.txt"]);

        // Empty content survives the round trip
        assert!(fs.write_file("/tmp/empty.txt", ""));
        assert_eq!(fs.read_file("/tmp/empty.txt").unwrap(), "");
    }

    #[test]
    fn test_write_requires_parent_directory() {
        let fs = VirtualFs::new();
        assert!(!fs.write_file("/missing/a.txt", "x"));
        assert!(!fs.write_file("/home/project/example.txt/a.txt", "x"));
        assert!(!fs.write_file("/", "x"));
        // Cannot overwrite a directory with a file
        assert!(!fs.write_file("/home/project", "x"));
        assert!(fs.is_dir("/home/project"));
    }

    #[test]
    fn test_read_and_list_type_checks() {
        let fs = VirtualFs::new();
        assert!(fs.read_file("/home").is_none());
        assert!(fs.read_file("/nope").is_none());
        assert!(fs.list_files("/home/project/example.txt").is_none());
        assert!(fs.list_files("/nope").is_none());
    }

    #[test]
    fn test_path_normalization() {
        let fs = VirtualFs::new();
        assert!(fs.write_file("//tmp///x.txt", "x"));
        assert_eq!(fs.read_file("/tmp/x.txt").unwrap(), "x");
        assert!(fs.list_files("/tmp/").is_some());
    }

    #[test]
    fn test_delete_file() {
        let fs = VirtualFs::new();
        assert!(fs.delete_file("/home/project/example.txt"));
        assert!(fs.read_file("/home/project/example.txt").is_none());
        assert!(!fs.delete_file("/home/project/example.txt"));
    }

    #[test]
    fn test_delete_missing_leaves_tree_unchanged() {
        let fs = VirtualFs::new();
        let before = format!("{:?}", fs.snapshot());
        assert!(!fs.delete_file("/tmp/ghost.txt"));
        assert!(!fs.delete_file("/no/such/dir/file"));
        // Directories are not files
        assert!(!fs.delete_file("/tmp"));
        assert_eq!(format!("{:?}", fs.snapshot()), before);
    }

    #[test]
    fn test_move_file() {
        let fs = VirtualFs::new();
        let id = fs.snapshot().children()[0].children()[0].children()[0].id();

        assert!(fs.move_file("/home/project/example.txt", "/tmp/moved.txt"));
        assert!(fs.read_file("/home/project/example.txt").is_none());
        assert_eq!(
            fs.read_file("/tmp/moved.txt").unwrap(),
            "This is an example file."
        );

        // Same node, reattached
        let snapshot = fs.snapshot();
        let tmp = snapshot.children().iter().find(|c| c.name() == "tmp").unwrap();
        assert_eq!(tmp.children()[0].id(), id);
    }

    #[test]
    fn test_move_file_overwrites_destination_file() {
        let fs = VirtualFs::new();
        fs.write_file("/tmp/a.txt", "a");
        fs.write_file("/tmp/b.txt", "b");
        assert!(fs.move_file("/tmp/a.txt", "/tmp/b.txt"));
        assert_eq!(fs.list_files("/tmp").unwrap(), vec!["b.txt"]);
        assert_eq!(fs.read_file("/tmp/b.txt").unwrap(), "a");
    }

    #[test]
    fn test_failed_move_leaves_tree_unchanged() {
        let fs = VirtualFs::new();
        let before = format!("{:?}", fs.snapshot());

        // Missing source
        assert!(!fs.move_file("/tmp/none.txt", "/tmp/other.txt"));
        // Missing destination directory
        assert!(!fs.move_file("/home/project/example.txt", "/missing/x.txt"));
        // Destination is a directory
        assert!(!fs.move_file("/home/project/example.txt", "/tmp"));
        // Source is a directory
        assert!(!fs.move_file("/tmp", "/home/tmp"));

        assert_eq!(format!("{:?}", fs.snapshot()), before);
    }

    #[test]
    fn test_move_onto_itself() {
        let fs = VirtualFs::new();
        assert!(fs.move_file("/home/project/example.txt", "/home/project/example.txt"));
        assert!(fs.read_file("/home/project/example.txt").is_some());
    }

    #[test]
    fn test_search_in_file() {
        let fs = VirtualFs::new();
        fs.write_file("/tmp/log.txt", "alpha\nbeta\nalphabet\n");
        assert_eq!(
            fs.search_in_file("/tmp/log.txt", "alpha").unwrap(),
            vec!["alpha", "alphabet"]
        );
        assert!(fs.search_in_file("/tmp/log.txt", "gamma").unwrap().is_empty());
        assert!(fs.search_in_file("/tmp/none.txt", "alpha").is_none());
    }

    #[test]
    fn test_sibling_names_unique() {
        let fs = VirtualFs::empty();
        fs.mkdir("/a");
        fs.mkdir("/a");
        fs.write_file("/f", "1");
        fs.write_file("/f", "2");
        assert_eq!(fs.list_files("/").unwrap(), vec!["a", "f"]);
    }
}
