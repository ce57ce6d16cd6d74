use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::thread;

/// One node of the locked dependency graph. Addresses are colon-joined
/// nesting paths (`a`, `a:b`); the root's address is empty.
#[derive(Debug, Clone, Default)]
pub struct DepNode {
    pub name: String,
    pub version: String,
    pub resolved: String,
    pub integrity: String,
    pub dev: bool,
    pub optional: bool,
    pub bundled: bool,
    pub is_root: bool,
    pub address: String,
    pub children: Vec<DepNode>,
}

impl DepNode {
    /// Logical install directory under `prefix`, one `node_modules` hop per
    /// nesting level.
    pub fn path(&self, prefix: &Path) -> PathBuf {
        let mut p = prefix.to_path_buf();
        if self.is_root {
            return p;
        }
        for segment in self.address.split(':') {
            p.push("node_modules");
            for part in segment.split('/') {
                p.push(part);
            }
        }
        p
    }

    pub fn count(&self) -> usize {
        1 + self.children.iter().map(DepNode::count).sum::<usize>()
    }

    pub fn walk_pre_order<'a>(&'a self, f: &mut dyn FnMut(&'a DepNode)) {
        f(self);
        for child in &self.children {
            child.walk_pre_order(f);
        }
    }

    pub fn walk_post_order<'a>(&'a self, f: &mut dyn FnMut(&'a DepNode)) {
        for child in &self.children {
            child.walk_post_order(f);
        }
        f(self);
    }

    pub fn find(&self, address: &str) -> Option<&DepNode> {
        if self.address == address {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(address))
    }
}

/// Build the logical tree from `package.json` plus a v1-style lockfile
/// (nested `dependencies` objects carrying `version`, `resolved`,
/// `integrity` and the `dev`/`optional`/`bundled` flags).
pub fn build_tree(manifest: &Value, lock: &Value) -> Result<DepNode> {
    let mut root = DepNode {
        name: manifest
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        version: manifest
            .get("version")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        is_root: true,
        ..Default::default()
    };
    if let Some(deps) = lock.get("dependencies").and_then(|v| v.as_object()) {
        root.children = build_children(deps, "");
    }
    Ok(root)
}

fn build_children(deps: &serde_json::Map<String, Value>, parent_address: &str) -> Vec<DepNode> {
    let mut names: Vec<&String> = deps.keys().collect();
    names.sort();
    names
        .into_iter()
        .filter_map(|name| {
            let entry = deps.get(name)?;
            let address = if parent_address.is_empty() {
                name.clone()
            } else {
                format!("{parent_address}:{name}")
            };
            let str_field = |key: &str| {
                entry
                    .get(key)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            let bool_field =
                |key: &str| entry.get(key).and_then(|v| v.as_bool()).unwrap_or(false);
            let mut node = DepNode {
                name: name.clone(),
                version: str_field("version"),
                resolved: str_field("resolved"),
                integrity: str_field("integrity"),
                dev: bool_field("dev"),
                optional: bool_field("optional"),
                bundled: bool_field("bundled"),
                is_root: false,
                address,
                children: Vec::new(),
            };
            if let Some(nested) = entry.get("dependencies").and_then(|v| v.as_object()) {
                node.children = build_children(nested, &node.address);
            }
            Some(node)
        })
        .collect()
}

/// A visitor failure, kept with enough context for the orchestrator to
/// decide between skip-and-reclaim and abort.
pub struct VisitFailure {
    pub address: String,
    pub optional: bool,
    pub error: anyhow::Error,
}

struct WalkInner<'a> {
    queue: VecDeque<&'a DepNode>,
    /// queued plus currently-visiting nodes
    outstanding: usize,
    aborted: bool,
}

struct WalkState<'a> {
    inner: Mutex<WalkInner<'a>>,
    cond: Condvar,
    failures: Mutex<Vec<VisitFailure>>,
}

impl<'a> WalkState<'a> {
    fn enqueue_children(&self, node: &'a DepNode) {
        let mut inner = self.inner.lock();
        for child in &node.children {
            inner.queue.push_back(child);
            inner.outstanding += 1;
        }
        self.cond.notify_all();
    }
}

/// Visit the tree with at most `limit` visitors in flight. Each visitor
/// receives a `next` continuation; calling it schedules the node's children.
/// A failing non-optional visitor stops the walk; optional failures are
/// collected and the walk continues.
pub fn visit_concurrent<'a, F>(root: &'a DepNode, limit: usize, visitor: F) -> Vec<VisitFailure>
where
    F: Fn(&'a DepNode, &dyn Fn()) -> Result<()> + Sync,
{
    let state = WalkState {
        inner: Mutex::new(WalkInner {
            queue: VecDeque::from([root]),
            outstanding: 1,
            aborted: false,
        }),
        cond: Condvar::new(),
        failures: Mutex::new(Vec::new()),
    };
    let workers = limit.max(1).min(root.count());
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| worker(&state, &visitor));
        }
    });
    state.failures.into_inner()
}

fn worker<'a, F>(state: &WalkState<'a>, visitor: &F)
where
    F: Fn(&'a DepNode, &dyn Fn()) -> Result<()> + Sync,
{
    loop {
        let node = {
            let mut inner = state.inner.lock();
            loop {
                if inner.aborted || (inner.queue.is_empty() && inner.outstanding == 0) {
                    return;
                }
                if let Some(node) = inner.queue.pop_front() {
                    break node;
                }
                state.cond.wait(&mut inner);
            }
        };
        let next = || state.enqueue_children(node);
        let result = visitor(node, &next);
        let mut inner = state.inner.lock();
        inner.outstanding -= 1;
        if let Err(error) = result {
            if !node.optional {
                inner.aborted = true;
            }
            state.failures.lock().push(VisitFailure {
                address: node.address.clone(),
                optional: node.optional,
                error,
            });
        }
        drop(inner);
        state.cond.notify_all();
    }
}
