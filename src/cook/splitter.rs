//! Diff splitter
//!
//! Classifies a container filesystem diff and routes changed files
//! into output package staging trees. A prefix trie over the diff
//! paths finds the leaves (changed paths with no deeper-changed
//! descendants); each added leaf maps to the most specific matching
//! destination pattern. Modified and deleted leaves are skipped with a
//! warning: a deleted file has nothing to copy, and a modified file's
//! pre-image is unknown, so copying it blind would be unsafe.

use crate::docker::{DiffEntry, DiffKind};
use crate::error::{KilnError, KilnResult};
use crate::recipe::PackageRecipe;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One file to pull out of the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyInstruction {
    /// In-container path of the changed leaf
    pub source: String,
    /// Destination staging root the pattern mapped to
    pub dest_root: PathBuf,
    /// Final location: `<dest_root>/<original path>`
    pub dest: PathBuf,
}

#[derive(Debug)]
struct Matcher {
    pattern: glob::Pattern,
    raw: String,
    dest: PathBuf,
}

/// Routes diff leaves into destination staging roots
#[derive(Debug)]
pub struct Splitter {
    matchers: Vec<Matcher>,
}

impl Splitter {
    /// Build a splitter from an ordered pattern → destination map
    pub fn new(map: &[(String, PathBuf)]) -> KilnResult<Self> {
        let mut matchers = Vec::with_capacity(map.len());
        for (raw, dest) in map {
            let pattern = glob::Pattern::new(raw).map_err(|e| KilnError::RecipeLint {
                problems: vec![format!("invalid file pattern {raw:?}: {e}")],
            })?;
            matchers.push(Matcher {
                pattern,
                raw: raw.clone(),
                dest: dest.clone(),
            });
        }
        Ok(Self { matchers })
    }

    /// Pattern map for a recipe's packages: each sub-package claims
    /// its declared globs; the main package (first, no globs) holds
    /// the catch-all.
    pub fn for_packages(packages: &[(PackageRecipe, PathBuf)]) -> KilnResult<Self> {
        let mut map = Vec::new();
        for (package, staging) in packages {
            if package.files.is_empty() {
                map.push(("/**".to_string(), staging.clone()));
            } else {
                for pattern in &package.files {
                    map.push((pattern.clone(), staging.clone()));
                }
            }
        }
        Self::new(&map)
    }

    /// Classify the diff and produce copy instructions for its added
    /// leaves
    pub fn split(&self, entries: &[DiffEntry]) -> Vec<CopyInstruction> {
        let mut instructions = Vec::new();
        for entry in leaves(entries) {
            match entry.kind {
                DiffKind::Deleted => {
                    warn!("{} was deleted by the build, skipping", entry.path);
                }
                DiffKind::Modified => {
                    warn!(
                        "{} was modified but not created by the build, skipping",
                        entry.path
                    );
                }
                DiffKind::Added => match self.route(&entry.path) {
                    Some(dest_root) => {
                        let relative = entry.path.trim_start_matches('/');
                        instructions.push(CopyInstruction {
                            source: entry.path.clone(),
                            dest: dest_root.join(relative),
                            dest_root,
                        });
                    }
                    None => debug!("{} matches no package pattern", entry.path),
                },
            }
        }
        instructions
    }

    /// Most specific matching destination (longer pattern wins ties)
    fn route(&self, path: &str) -> Option<PathBuf> {
        self.matchers
            .iter()
            .filter(|m| m.pattern.matches(path))
            .max_by_key(|m| m.raw.len())
            .map(|m| m.dest.clone())
    }
}

#[derive(Default)]
struct TrieNode {
    children: BTreeMap<String, TrieNode>,
}

/// The diff entries with no deeper-diffed descendants
fn leaves(entries: &[DiffEntry]) -> Vec<&DiffEntry> {
    let mut root = TrieNode::default();
    for entry in entries {
        let mut node = &mut root;
        for segment in segments(&entry.path) {
            node = node.children.entry(segment.to_string()).or_default();
        }
    }

    entries
        .iter()
        .filter(|entry| {
            let mut node = &root;
            for segment in segments(&entry.path) {
                match node.children.get(segment) {
                    Some(child) => node = child,
                    None => return false,
                }
            }
            node.children.is_empty()
        })
        .collect()
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Destination for the single-package case: everything into one root
pub fn single_destination(root: &Path) -> Vec<(String, PathBuf)> {
    vec![("/**".to_string(), root.to_path_buf())]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn added(path: &str) -> DiffEntry {
        DiffEntry {
            path: path.to_string(),
            kind: DiffKind::Added,
        }
    }

    fn entry(path: &str, kind: DiffKind) -> DiffEntry {
        DiffEntry {
            path: path.to_string(),
            kind,
        }
    }

    #[test]
    fn routes_leaves_to_their_destination_roots() {
        let splitter = Splitter::new(&[
            ("/a/**".to_string(), PathBuf::from("/a")),
            ("/b/**".to_string(), PathBuf::from("/b")),
        ])
        .unwrap();

        let instructions = splitter.split(&[added("/a/foo"), added("/b/bar")]);
        assert_eq!(
            instructions,
            vec![
                CopyInstruction {
                    source: "/a/foo".to_string(),
                    dest_root: PathBuf::from("/a"),
                    dest: PathBuf::from("/a/a/foo"),
                },
                CopyInstruction {
                    source: "/b/bar".to_string(),
                    dest_root: PathBuf::from("/b"),
                    dest: PathBuf::from("/b/b/bar"),
                },
            ]
        );
    }

    #[test]
    fn parents_with_changed_children_are_not_leaves() {
        let splitter = Splitter::new(&[("/**".to_string(), PathBuf::from("/out"))]).unwrap();
        let instructions = splitter.split(&[
            entry("/usr", DiffKind::Modified),
            entry("/usr/bin", DiffKind::Modified),
            added("/usr/bin/tool"),
        ]);
        assert_eq!(instructions.len(), 1);
        assert_eq!(instructions[0].source, "/usr/bin/tool");
    }

    #[test]
    fn modified_and_deleted_leaves_are_skipped() {
        let splitter = Splitter::new(&[("/**".to_string(), PathBuf::from("/out"))]).unwrap();
        let instructions = splitter.split(&[
            entry("/etc/passwd", DiffKind::Modified),
            entry("/tmp/scratch", DiffKind::Deleted),
            added("/usr/bin/tool"),
        ]);
        assert_eq!(instructions.len(), 1);
        assert_eq!(instructions[0].source, "/usr/bin/tool");
    }

    #[test]
    fn unmatched_leaves_are_silently_ignored() {
        let splitter =
            Splitter::new(&[("/usr/**".to_string(), PathBuf::from("/out"))]).unwrap();
        let instructions = splitter.split(&[added("/var/log/build.log"), added("/usr/bin/t")]);
        assert_eq!(instructions.len(), 1);
        assert_eq!(instructions[0].source, "/usr/bin/t");
    }

    #[test]
    fn longer_pattern_wins_ties() {
        let splitter = Splitter::new(&[
            ("/usr/**".to_string(), PathBuf::from("/main")),
            ("/usr/share/doc/**".to_string(), PathBuf::from("/doc")),
        ])
        .unwrap();

        let instructions = splitter.split(&[
            added("/usr/bin/tool"),
            added("/usr/share/doc/tool/README"),
        ]);
        assert_eq!(instructions[0].dest_root, PathBuf::from("/main"));
        assert_eq!(instructions[1].dest_root, PathBuf::from("/doc"));
    }

    #[test]
    fn package_matchers_give_main_package_the_catch_all() {
        let main = PackageRecipe {
            name: "tool".to_string(),
            ..PackageRecipe::default()
        };
        let doc = PackageRecipe {
            name: "tool-doc".to_string(),
            files: vec!["/usr/share/doc/**".to_string()],
            ..PackageRecipe::default()
        };
        let splitter = Splitter::for_packages(&[
            (main, PathBuf::from("/stage/tool")),
            (doc, PathBuf::from("/stage/tool-doc")),
        ])
        .unwrap();

        let instructions = splitter.split(&[
            added("/usr/bin/tool"),
            added("/usr/share/doc/tool/README"),
        ]);
        assert_eq!(instructions[0].dest_root, PathBuf::from("/stage/tool"));
        assert_eq!(instructions[1].dest_root, PathBuf::from("/stage/tool-doc"));
    }

    #[test]
    fn invalid_pattern_is_a_lint_error() {
        let err = Splitter::new(&[("[".to_string(), PathBuf::from("/x"))]).unwrap_err();
        assert!(matches!(err, KilnError::RecipeLint { .. }));
    }

    #[test]
    fn single_destination_routes_everything() {
        let map = single_destination(Path::new("/out"));
        let splitter = Splitter::new(&map).unwrap();
        let instructions = splitter.split(&[added("/usr/bin/tool"), added("/etc/tool.conf")]);
        assert_eq!(instructions.len(), 2);
        assert!(instructions
            .iter()
            .all(|i| i.dest_root == PathBuf::from("/out")));
    }
}
