//! Hierarchical file-tree snapshots rebuilt from a flat container listing.
//!
//! A snapshot is always recomputed from scratch; nothing here patches an
//! existing tree. Two listings with the same set of entries produce equal
//! trees regardless of listing order.

use serde::{Deserialize, Serialize};

/// One node of a project file tree. `id` is the absolute container path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FileNode {
    File {
        id: String,
        name: String,
    },
    Folder {
        id: String,
        name: String,
        children: Vec<FileNode>,
    },
}

impl FileNode {
    pub fn id(&self) -> &str {
        match self {
            Self::File { id, .. } | Self::Folder { id, .. } => id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::File { name, .. } | Self::Folder { name, .. } => name,
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, Self::Folder { .. })
    }

    /// Depth-first lookup by id.
    pub fn find<'a>(nodes: &'a [FileNode], id: &str) -> Option<&'a FileNode> {
        for node in nodes {
            if node.id() == id {
                return Some(node);
            }
            if let Self::Folder { children, .. } = node {
                if let Some(found) = Self::find(children, id) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Absolute ids of every file (not folder) under `nodes`.
    pub fn file_ids(nodes: &[FileNode]) -> Vec<String> {
        let mut out = Vec::new();
        collect_file_ids(nodes, &mut out);
        out
    }
}

fn collect_file_ids(nodes: &[FileNode], out: &mut Vec<String>) {
    for node in nodes {
        match node {
            FileNode::File { id, .. } => out.push(id.clone()),
            FileNode::Folder { children, .. } => collect_file_ids(children, out),
        }
    }
}

/// A listing entry relative to the project root, tagged file or directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PathEntry {
    pub path: String,
    pub is_dir: bool,
}

impl PathEntry {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_dir: false,
        }
    }

    pub fn dir(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_dir: true,
        }
    }

    /// Parse a `find`-style listing line where directories carry a trailing `/`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim().trim_start_matches("./");
        if line.is_empty() || line == "." || line == "/" {
            return None;
        }
        let is_dir = line.ends_with('/');
        let path = line.trim_matches('/').to_string();
        if path.is_empty() {
            return None;
        }
        Some(Self { path, is_dir })
    }
}

/// Build the tree for `root` from a flat listing.
pub fn build_file_tree(root: &str, entries: &[PathEntry]) -> Vec<FileNode> {
    let mut sorted: Vec<&PathEntry> = entries.iter().collect();
    sorted.sort();

    let mut nodes = Vec::new();
    for entry in sorted {
        let segments: Vec<&str> = entry.path.split('/').filter(|s| !s.is_empty()).collect();
        insert(&mut nodes, root, &segments, entry.is_dir);
    }
    nodes
}

fn insert(nodes: &mut Vec<FileNode>, parent_id: &str, segments: &[&str], is_dir: bool) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    let id = join_id(parent_id, first);

    if rest.is_empty() && !is_dir {
        if !nodes.iter().any(|n| n.name() == *first) {
            nodes.push(FileNode::File {
                id,
                name: (*first).to_string(),
            });
        }
        return;
    }

    let idx = match nodes.iter().position(|n| n.name() == *first) {
        Some(idx) => idx,
        None => {
            nodes.push(FileNode::Folder {
                id,
                name: (*first).to_string(),
                children: Vec::new(),
            });
            nodes.len() - 1
        }
    };

    // A file already holds this name; the entry cannot be placed under it.
    if let FileNode::Folder { id, children, .. } = &mut nodes[idx] {
        let folder_id = id.clone();
        insert(children, &folder_id, rest, is_dir);
    }
}

fn join_id(parent: &str, name: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "/home/user/project";

    fn listing(lines: &[&str]) -> Vec<PathEntry> {
        lines.iter().filter_map(|l| PathEntry::parse(l)).collect()
    }

    #[test]
    fn builds_folder_and_root_file() {
        let tree = build_file_tree(ROOT, &listing(&["a/", "a/b.txt", "c.txt"]));
        assert_eq!(
            tree,
            vec![
                FileNode::Folder {
                    id: format!("{ROOT}/a"),
                    name: "a".into(),
                    children: vec![FileNode::File {
                        id: format!("{ROOT}/a/b.txt"),
                        name: "b.txt".into(),
                    }],
                },
                FileNode::File {
                    id: format!("{ROOT}/c.txt"),
                    name: "c.txt".into(),
                },
            ]
        );
    }

    #[test]
    fn rebuilding_is_idempotent_and_order_independent() {
        let lines = ["src/", "src/main.rs", "README.md", "src/lib/", "src/lib/x.rs"];
        let mut shuffled = lines;
        shuffled.reverse();

        let first = build_file_tree(ROOT, &listing(&lines));
        let second = build_file_tree(ROOT, &listing(&lines));
        let reordered = build_file_tree(ROOT, &listing(&shuffled));
        assert_eq!(first, second);
        assert_eq!(first, reordered);
    }

    #[test]
    fn duplicate_entries_collapse() {
        let tree = build_file_tree(ROOT, &listing(&["a/", "a/", "a/b.txt", "a/b.txt"]));
        assert_eq!(tree.len(), 1);
        match &tree[0] {
            FileNode::Folder { children, .. } => assert_eq!(children.len(), 1),
            other => panic!("expected folder, got {other:?}"),
        }
    }

    #[test]
    fn missing_parent_entries_are_synthesized() {
        let tree = build_file_tree(ROOT, &listing(&["deep/er/file.txt"]));
        let file = FileNode::find(&tree, &format!("{ROOT}/deep/er/file.txt"));
        assert!(file.is_some(), "file should be reachable: {tree:?}");
        assert!(FileNode::find(&tree, &format!("{ROOT}/deep")).unwrap().is_folder());
    }

    #[test]
    fn every_child_id_is_prefixed_by_parent_id() {
        fn check(nodes: &[FileNode], parent: &str) {
            for node in nodes {
                assert!(
                    node.id().starts_with(&format!("{parent}/")),
                    "{} not under {parent}",
                    node.id()
                );
                if let FileNode::Folder { id, children, .. } = node {
                    check(children, id);
                }
            }
        }
        let tree = build_file_tree(ROOT, &listing(&["x/", "x/y/", "x/y/z.md", "w.txt"]));
        check(&tree, ROOT);
    }

    #[test]
    fn empty_directory_is_kept() {
        let tree = build_file_tree(ROOT, &listing(&["empty/"]));
        assert_eq!(
            tree,
            vec![FileNode::Folder {
                id: format!("{ROOT}/empty"),
                name: "empty".into(),
                children: vec![],
            }]
        );
    }

    #[test]
    fn serializes_with_type_tag() {
        let node = FileNode::File {
            id: "/p/a.txt".into(),
            name: "a.txt".into(),
        };
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["type"], "file");
        assert_eq!(json["name"], "a.txt");
    }

    #[test]
    fn parse_skips_dot_entries() {
        assert_eq!(PathEntry::parse("./"), None);
        assert_eq!(PathEntry::parse("."), None);
        assert_eq!(PathEntry::parse("./src/"), Some(PathEntry::dir("src")));
    }
}
