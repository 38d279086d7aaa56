//! The logical tree of archive entries.
//!
//! ZIP's central directory is a flat list, and nothing obliges an archiver
//! to write records for directories: a lone `a/b/c.txt` implies `a/` and
//! `a/b/` without spelling either out. This module rebuilds the hierarchy,
//! synthesizing the directories the flat list only implies.
//!
//! Parent links would make an owned parent↔child tree cyclic, so entries
//! live in an arena and refer to each other by index.

use std::borrow::Cow;
use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use log::*;

use crate::spec;

/// Index of an [`Entry`] in its archive's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(pub(crate) usize);

/// A file or directory in the archive.
#[derive(Debug)]
pub struct Entry<'a> {
    /// The full stored path. Directories end in `/`; files never do.
    pub name: Cow<'a, str>,
    /// Uncompressed size in bytes (zero for directories).
    pub size: usize,
    /// Offset of the entry's local file header in the archive buffer.
    pub offset: usize,
    /// MS-DOS packed modification time and date, exactly as stored.
    pub timestamp: u32,
    /// CRC-32 of the uncompressed data.
    pub crc32: u32,
    pub(crate) encrypted: bool,
    /// The containing directory; only the root has none.
    pub parent: Option<EntryId>,
    /// Contained entries, in tree order. Empty for files.
    pub children: Vec<EntryId>,
}

impl Entry<'_> {
    /// Returns true if the entry is a directory
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }

    /// Returns true if the entry is a file
    pub fn is_file(&self) -> bool {
        !self.is_dir()
    }

    /// The modification time as a calendar date, when the stored stamp
    /// describes one (zeroed stamps don't).
    pub fn last_modified(&self) -> Option<NaiveDateTime> {
        spec::parse_msdos(self.timestamp)
    }
}

/// The assembled hierarchy: the entry arena, the root's id, and a directory
/// lookup keyed by normalized path (no leading or trailing `/`).
pub(crate) struct EntryTree<'a> {
    pub entries: Vec<Entry<'a>>,
    pub root: EntryId,
    pub directories: BTreeMap<String, EntryId>,
}

impl<'a> EntryTree<'a> {
    /// Organizes the flat central-directory list into a rooted tree.
    ///
    /// Directories sort ahead of files so explicit directory records are in
    /// place before anything needs them as a parent; intermediate
    /// directories with no record of their own are synthesized on first
    /// use, inheriting the timestamp of the entry that forced them into
    /// existence.
    pub fn build(mut flat: Vec<Entry<'a>>) -> Self {
        flat.sort_by(|a, b| {
            b.is_dir()
                .cmp(&a.is_dir())
                .then_with(|| a.name.cmp(&b.name))
        });

        let mut entries = Vec::with_capacity(flat.len() + 1);
        entries.push(Entry {
            name: Cow::Borrowed("/"),
            size: 0,
            offset: 0,
            timestamp: 0,
            crc32: 0,
            encrypted: false,
            parent: None,
            children: Vec::new(),
        });
        let root = EntryId(0);
        let mut directories: BTreeMap<String, EntryId> = BTreeMap::new();

        for entry in flat {
            let is_dir = entry.is_dir();
            let timestamp = entry.timestamp;
            let name = entry.name.to_string();
            let components: Vec<&str> = name.split('/').filter(|c| !c.is_empty()).collect();
            let mut entry = Some(entry);
            let mut current = root;
            let mut path = String::new();

            for (i, component) in components.iter().enumerate() {
                if !path.is_empty() {
                    path.push('/');
                }
                path.push_str(component);
                let terminal = i + 1 == components.len();

                if terminal && !is_dir {
                    let id = EntryId(entries.len());
                    let mut file = entry.take().unwrap();
                    file.parent = Some(current);
                    entries.push(file);
                    entries[current.0].children.push(id);
                } else if let Some(&dir) = directories.get(&path) {
                    if terminal {
                        warn!("Duplicate directory record for {path}");
                    }
                    current = dir;
                } else {
                    let id = EntryId(entries.len());
                    let mut dir = if terminal {
                        entry.take().unwrap()
                    } else {
                        Entry {
                            name: Cow::Owned(format!("{path}/")),
                            size: 0,
                            offset: 0,
                            timestamp,
                            crc32: 0,
                            encrypted: false,
                            parent: None,
                            children: Vec::new(),
                        }
                    };
                    dir.parent = Some(current);
                    entries.push(dir);
                    entries[current.0].children.push(id);
                    directories.insert(path.clone(), id);
                    current = id;
                }
            }

            if let Some(dropped) = entry {
                warn!("Ignoring entry with unusable path {:?}", dropped.name);
            }
        }

        EntryTree {
            entries,
            root,
            directories,
        }
    }

    /// Looks up an entry by path.
    ///
    /// `/` names the root; otherwise one leading and one trailing slash are
    /// ignored, so `/a/b`, `a/b`, and `a/b/` all name the same entry.
    pub fn find(&self, path: &str) -> Option<EntryId> {
        if path == "/" {
            return Some(self.root);
        }
        let normalized = path.strip_prefix('/').unwrap_or(path);
        let normalized = normalized.strip_suffix('/').unwrap_or(normalized);

        self.entries
            .iter()
            .position(|entry| {
                let name = entry.name.strip_suffix('/').unwrap_or(&entry.name);
                name == normalized
            })
            .map(EntryId)
            .or_else(|| self.directories.get(normalized).copied())
    }

    /// Absolute path of an entry, rebuilt from its parent chain.
    ///
    /// Each stored name embeds its ancestors' path, so every step strips
    /// the parent's name off the front and prepends the parent's own path.
    pub fn full_path(&self, id: EntryId) -> String {
        let entry = &self.entries[id.0];
        let Some(parent) = entry.parent else {
            return entry.name.to_string();
        };
        if parent == self.root {
            return entry.name.to_string();
        }
        let parent_name = &*self.entries[parent.0].name;
        let own = entry.name.strip_prefix(parent_name).unwrap_or(&entry.name);
        format!("{}{}", self.full_path(parent), own)
    }

    /// Pre-order walk from the root; the callback sees each entry and its
    /// depth, the root at depth 0.
    pub fn walk<F: FnMut(&Entry<'a>, usize)>(&self, visit: &mut F) {
        self.walk_from(self.root, 0, visit);
    }

    fn walk_from<F: FnMut(&Entry<'a>, usize)>(&self, id: EntryId, depth: usize, visit: &mut F) {
        let entry = &self.entries[id.0];
        visit(entry, depth);
        for &child in &entry.children {
            self.walk_from(child, depth + 1, visit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> Entry<'static> {
        Entry {
            name: Cow::Owned(name.to_string()),
            size: if name.ends_with('/') { 0 } else { 42 },
            offset: 7,
            timestamp: 0x586F_53CC,
            crc32: 0xABCD_EF01,
            encrypted: false,
            parent: None,
            children: Vec::new(),
        }
    }

    fn names<'t>(tree: &'t EntryTree, ids: &[EntryId]) -> Vec<&'t str> {
        ids.iter().map(|id| &*tree.entries[id.0].name).collect()
    }

    #[test]
    fn synthesizes_implicit_directories() {
        let tree = EntryTree::build(vec![record("a/b/c.txt")]);

        // Root, two synthesized directories, and the file.
        assert_eq!(tree.entries.len(), 4);
        let a = tree.find("a").unwrap();
        let b = tree.find("a/b").unwrap();
        let c = tree.find("a/b/c.txt").unwrap();
        assert_eq!(tree.entries[a.0].name, "a/");
        assert_eq!(tree.entries[b.0].name, "a/b/");
        assert!(tree.entries[a.0].is_dir());

        // Synthesized directories zero their record fields but carry the
        // triggering entry's timestamp.
        assert_eq!(tree.entries[a.0].size, 0);
        assert_eq!(tree.entries[a.0].crc32, 0);
        assert_eq!(tree.entries[a.0].offset, 0);
        assert_eq!(tree.entries[a.0].timestamp, 0x586F_53CC);

        assert_eq!(tree.entries[a.0].parent, Some(tree.root));
        assert_eq!(tree.entries[b.0].parent, Some(a));
        assert_eq!(tree.entries[c.0].parent, Some(b));
    }

    #[test]
    fn explicit_directory_records_are_reused() {
        let tree = EntryTree::build(vec![record("a/b/c.txt"), record("a/"), record("a/b/")]);

        // No stubs shadowing the real records: root + a/ + a/b/ + c.txt.
        assert_eq!(tree.entries.len(), 4);
        let a = tree.find("a").unwrap();
        // The explicit record's fields survive.
        assert_eq!(tree.entries[a.0].offset, 7);
    }

    #[test]
    fn parent_child_links_are_symmetric() {
        let tree = EntryTree::build(vec![
            record("dir/"),
            record("dir/f.txt"),
            record("g.txt"),
            record("x/y/z.bin"),
        ]);

        for (i, entry) in tree.entries.iter().enumerate() {
            if let Some(parent) = entry.parent {
                assert!(tree.entries[parent.0].children.contains(&EntryId(i)));
            }
            for &child in &entry.children {
                assert_eq!(tree.entries[child.0].parent, Some(EntryId(i)));
            }
            assert_eq!(entry.is_dir(), entry.name.ends_with('/'));
        }
    }

    #[test]
    fn walk_is_preorder_directories_first() {
        let tree = EntryTree::build(vec![record("dir/"), record("dir/f.txt"), record("g.txt")]);

        let mut visited = Vec::new();
        tree.walk(&mut |entry, depth| visited.push((entry.name.to_string(), depth)));
        assert_eq!(
            visited,
            vec![
                ("/".to_string(), 0),
                ("dir/".to_string(), 1),
                ("dir/f.txt".to_string(), 2),
                ("g.txt".to_string(), 1),
            ]
        );
    }

    #[test]
    fn find_normalizes_slashes() {
        let tree = EntryTree::build(vec![record("a/b/c.txt")]);

        assert_eq!(tree.find("/"), Some(tree.root));
        let b = tree.find("a/b").unwrap();
        assert_eq!(tree.find("/a/b"), Some(b));
        assert_eq!(tree.find("a/b/"), Some(b));
        assert_eq!(tree.find("a/b/c.txt"), tree.find("/a/b/c.txt"));
        assert_eq!(tree.find("no/such/entry"), None);
    }

    #[test]
    fn full_path_matches_stored_names() {
        let tree = EntryTree::build(vec![record("a/b/c.txt"), record("top.txt")]);

        assert_eq!(tree.full_path(tree.root), "/");
        for id in 1..tree.entries.len() {
            let id = EntryId(id);
            assert_eq!(tree.full_path(id), &*tree.entries[id.0].name);
        }
    }

    #[test]
    fn empty_list_is_a_lone_root() {
        let tree = EntryTree::build(Vec::new());
        assert_eq!(tree.entries.len(), 1);
        assert!(tree.entries[0].children.is_empty());
        assert!(tree.directories.is_empty());
    }
}
