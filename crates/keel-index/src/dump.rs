//! Debug dumps of a B+ tree: Graphviz DOT and indented text.
//!
//! Read-only collaborators built on shared page guards; they hold at most
//! one pin per tree level at a time and never block writers longer than a
//! search would.

use crate::key::{IndexKey, IndexValue};
use crate::node::{InternalNode, LeafNode, NodeKind};
use crate::tree::BPlusTree;
use keel_common::page::PageId;
use keel_common::Result;
use std::fmt::Write;

impl<K: IndexKey, V: IndexValue> BPlusTree<K, V> {
    /// Renders the tree as a Graphviz digraph.
    pub fn to_dot(&self) -> Result<String> {
        let mut out = String::new();
        out.push_str("digraph BPlusTree {\n");
        out.push_str("  node [shape=record];\n");

        let root = self.get_root_page_id();
        if root.is_valid() {
            self.dot_node(root, &mut out)?;
        }
        out.push_str("}\n");
        Ok(out)
    }

    fn dot_node(&self, page_id: PageId, out: &mut String) -> Result<()> {
        let guard = self.pool.fetch_page_read(page_id)?;
        match NodeKind::of(guard.data())? {
            NodeKind::Leaf => {
                let leaf = LeafNode::<K, V>::decode(guard.data())?;
                drop(guard);

                let keys = leaf
                    .entries
                    .iter()
                    .map(|(k, _)| k.to_string())
                    .collect::<Vec<_>>()
                    .join("|");
                let _ = writeln!(
                    out,
                    "  leaf_{} [label=\"{{page {} (size {}/{})|{{{}}}}}\" color=green];",
                    page_id.0,
                    page_id.0,
                    leaf.len(),
                    leaf.max_size,
                    keys
                );
                if leaf.next_leaf.is_valid() {
                    let _ = writeln!(
                        out,
                        "  leaf_{} -> leaf_{} [style=dashed];",
                        page_id.0, leaf.next_leaf.0
                    );
                    let _ = writeln!(
                        out,
                        "  {{rank=same leaf_{} leaf_{}}};",
                        page_id.0, leaf.next_leaf.0
                    );
                }
            }
            NodeKind::Internal => {
                let internal = InternalNode::<K>::decode(guard.data())?;
                drop(guard);

                let keys = internal
                    .entries
                    .iter()
                    .enumerate()
                    .map(|(i, (k, _))| {
                        if i == 0 {
                            " ".to_string()
                        } else {
                            k.to_string()
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("|");
                let _ = writeln!(
                    out,
                    "  int_{} [label=\"{{page {} (size {}/{})|{{{}}}}}\" color=pink];",
                    page_id.0,
                    page_id.0,
                    internal.size(),
                    internal.max_size,
                    keys
                );

                for (_, child) in &internal.entries {
                    let child_guard = self.pool.fetch_page_read(*child)?;
                    let child_kind = NodeKind::of(child_guard.data())?;
                    drop(child_guard);
                    let prefix = match child_kind {
                        NodeKind::Leaf => "leaf",
                        NodeKind::Internal => "int",
                    };
                    let _ = writeln!(out, "  int_{} -> {}_{};", page_id.0, prefix, child.0);
                    self.dot_node(*child, out)?;
                }
            }
        }
        Ok(())
    }

    /// Renders the tree as indented text, one node per line.
    pub fn to_pretty(&self) -> Result<String> {
        let mut out = String::new();
        let root = self.get_root_page_id();
        if !root.is_valid() {
            out.push_str("(empty tree)\n");
            return Ok(out);
        }
        self.pretty_node(root, 0, &mut out)?;
        Ok(out)
    }

    fn pretty_node(&self, page_id: PageId, depth: usize, out: &mut String) -> Result<()> {
        let indent = "  ".repeat(depth);
        let guard = self.pool.fetch_page_read(page_id)?;
        match NodeKind::of(guard.data())? {
            NodeKind::Leaf => {
                let leaf = LeafNode::<K, V>::decode(guard.data())?;
                drop(guard);

                let keys = leaf
                    .entries
                    .iter()
                    .map(|(k, _)| k.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                let next = if leaf.next_leaf.is_valid() {
                    leaf.next_leaf.to_string()
                } else {
                    "none".to_string()
                };
                let _ = writeln!(
                    out,
                    "{indent}leaf {} size={}/{} next={} keys=[{}]",
                    page_id.0,
                    leaf.len(),
                    leaf.max_size,
                    next,
                    keys
                );
            }
            NodeKind::Internal => {
                let internal = InternalNode::<K>::decode(guard.data())?;
                drop(guard);

                let keys = internal
                    .entries
                    .iter()
                    .skip(1)
                    .map(|(k, _)| k.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                let _ = writeln!(
                    out,
                    "{indent}internal {} size={}/{} keys=[{}]",
                    page_id.0,
                    internal.size(),
                    internal.max_size,
                    keys
                );
                for (_, child) in &internal.entries {
                    self.pretty_node(*child, depth + 1, out)?;
                }
            }
        }
        Ok(())
    }
}
