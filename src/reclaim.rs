use crate::tree::DepNode;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Mark-and-sweep over the logical tree after optional-dependency
/// failures. Mark walks pre-order and stops at failed nodes, so everything
/// below a failure stays unmarked; sweep walks post-order and removes the
/// install directory of every dead non-root node. Returns the purged
/// addresses.
pub fn reclaim(
    root: &DepNode,
    failed: &HashSet<String>,
    prefix: &Path,
    warn: &dyn Fn(&str),
) -> HashSet<String> {
    let mut live = HashSet::new();
    mark(root, failed, &mut live);

    let mut purged: HashSet<String> = HashSet::new();
    root.walk_post_order(&mut |node| {
        if node.is_root || live.contains(&node.address) || purged.contains(&node.address) {
            return;
        }
        let dir = node.path(prefix);
        if dir.symlink_metadata().is_ok() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn(&format!("failed to remove {}: {e}", dir.display()));
            }
        }
        purged.insert(node.address.clone());
    });
    purged
}

fn mark(node: &DepNode, failed: &HashSet<String>, live: &mut HashSet<String>) {
    if !node.is_root && failed.contains(&node.address) {
        return;
    }
    live.insert(node.address.clone());
    for child in &node.children {
        mark(child, failed, live);
    }
}
