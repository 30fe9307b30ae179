//! Flat, index-addressed parse tree.
//!
//! Nodes live in one dense vector; a [`ParseNode`] is an index into it.
//! Children are inline (no per-node heap until a node exceeds four
//! children). The passes rewrite nodes in place; cloning a subtree records
//! every identifier-class copy so deferred patch steps can replay link and
//! type results onto the clones.

use smallvec::SmallVec;

use crate::intern::Name;
use crate::model::{Marker, Selection};
use crate::ops::Op;

pub type ParseNode = usize;

/// Absent node / absent index sentinel.
pub const NONE: usize = usize::MAX;

/// Matrix dimension "not yet known".
pub const UNKNOWN_SIZE: usize = 0;

/// Type tag "not yet resolved" (the static pass owns the tag space).
pub const UNINITIALISED_TYPE: usize = usize::MAX;

#[derive(Debug, Clone)]
pub struct Node {
    pub op: Op,
    pub sel: Selection,
    pub flag: usize,
    pub double: f64,
    pub name: Name,
    pub ty: usize,
    pub rows: usize,
    pub cols: usize,
    pub sym: usize,
    pub children: SmallVec<[ParseNode; 4]>,
}

impl Node {
    fn new(op: Op, sel: Selection) -> Self {
        Node {
            op,
            sel,
            flag: NONE,
            double: 0.0,
            name: Name::EMPTY,
            ty: UNINITIALISED_TYPE,
            rows: UNKNOWN_SIZE,
            cols: UNKNOWN_SIZE,
            sym: NONE,
            children: SmallVec::new(),
        }
    }
}

#[derive(Clone, Default)]
pub struct ParseTree {
    nodes: Vec<Node>,
    pub root: ParseNode,
    nary_stack: Vec<ParseNode>,
    nary_start: Vec<usize>,
    /// (origin, clone) pairs recorded by `clone_subtree`, replayed by the
    /// patch steps after the static pass and after linking.
    pub cloned_vars: Vec<(ParseNode, ParseNode)>,
    /// String-literal contents; literal nodes hold an index in their flag.
    strings: Vec<String>,
}

impl ParseTree {
    pub fn new() -> Self {
        ParseTree {
            nodes: Vec::new(),
            root: NONE,
            nary_stack: Vec::new(),
            nary_start: Vec::new(),
            cloned_vars: Vec::new(),
            strings: Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.root = NONE;
        self.nary_stack.clear();
        self.nary_start.clear();
        self.cloned_vars.clear();
        self.strings.clear();
    }

    pub fn add_string(&mut self, content: String) -> usize {
        self.strings.push(content);
        self.strings.len() - 1
    }

    pub fn string(&self, index: usize) -> &str {
        &self.strings[index]
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    // Construction ----------------------------------------------------------

    pub fn add_terminal(&mut self, op: Op, sel: Selection) -> ParseNode {
        self.nodes.push(Node::new(op, sel));
        self.nodes.len() - 1
    }

    pub fn add_unary(&mut self, op: Op, sel: Selection, child: ParseNode) -> ParseNode {
        let pn = self.add_terminal(op, sel);
        self.nodes[pn].children.push(child);
        pn
    }

    /// Unary node spanning exactly its child.
    pub fn wrap_unary(&mut self, op: Op, child: ParseNode) -> ParseNode {
        let sel = self.nodes[child].sel;
        self.add_unary(op, sel, child)
    }

    /// Unary node whose selection extends from `left` to the child's right.
    pub fn add_left_unary(&mut self, op: Op, left: Marker, child: ParseNode) -> ParseNode {
        let sel = Selection::new(left, self.nodes[child].sel.right());
        self.add_unary(op, sel, child)
    }

    /// Unary node whose selection extends from the child's left to `right`.
    pub fn add_right_unary(&mut self, op: Op, right: Marker, child: ParseNode) -> ParseNode {
        let sel = Selection::new(self.nodes[child].sel.left(), right);
        self.add_unary(op, sel, child)
    }

    pub fn add_node(&mut self, op: Op, sel: Selection, children: &[ParseNode]) -> ParseNode {
        let pn = self.add_terminal(op, sel);
        self.nodes[pn].children.extend_from_slice(children);
        pn
    }

    /// N-ary node whose selection spans the first and last present child.
    pub fn add_node_span(&mut self, op: Op, children: &[ParseNode]) -> ParseNode {
        let sel = self.span_of(children);
        self.add_node(op, sel, children)
    }

    fn span_of(&self, children: &[ParseNode]) -> Selection {
        let mut iter = children.iter().filter(|&&c| c != NONE);
        let first = iter.next().expect("span_of requires a present child");
        let mut sel = self.nodes[*first].sel;
        for &c in iter {
            sel = sel.merge(&self.nodes[c].sel);
        }
        sel
    }

    // N-ary builder ---------------------------------------------------------

    pub fn prepare_nary(&mut self) {
        self.nary_start.push(self.nary_stack.len());
    }

    pub fn add_nary_child(&mut self, pn: ParseNode) {
        self.nary_stack.push(pn);
    }

    pub fn pop_nary_child(&mut self) -> ParseNode {
        debug_assert!(self.nary_stack.len() > *self.nary_start.last().unwrap());
        self.nary_stack.pop().unwrap()
    }

    pub fn finish_nary(&mut self, op: Op, sel: Selection) -> ParseNode {
        let start = self.nary_start.pop().unwrap();
        let children: Vec<ParseNode> = self.nary_stack.drain(start..).collect();
        self.add_node(op, sel, &children)
    }

    pub fn finish_nary_span(&mut self, op: Op) -> ParseNode {
        let start = *self.nary_start.last().unwrap();
        let sel = self.span_of(&self.nary_stack[start..].to_vec());
        self.finish_nary(op, sel)
    }

    pub fn cancel_nary(&mut self) {
        let start = self.nary_start.pop().unwrap();
        self.nary_stack.truncate(start);
    }

    // Accessors -------------------------------------------------------------

    pub fn op(&self, pn: ParseNode) -> Op {
        self.nodes[pn].op
    }

    pub fn set_op(&mut self, pn: ParseNode, op: Op) {
        self.nodes[pn].op = op;
    }

    pub fn sel(&self, pn: ParseNode) -> Selection {
        self.nodes[pn].sel
    }

    pub fn left(&self, pn: ParseNode) -> Marker {
        self.nodes[pn].sel.left()
    }

    pub fn right(&self, pn: ParseNode) -> Marker {
        self.nodes[pn].sel.right()
    }

    pub fn set_left(&mut self, pn: ParseNode, m: Marker) {
        self.nodes[pn].sel.start = m.index;
    }

    pub fn set_right(&mut self, pn: ParseNode, m: Marker) {
        self.nodes[pn].sel.end = m.index;
    }

    pub fn num_args(&self, pn: ParseNode) -> usize {
        self.nodes[pn].children.len()
    }

    pub fn arg(&self, pn: ParseNode, index: usize) -> ParseNode {
        self.nodes[pn].children[index]
    }

    pub fn set_arg(&mut self, pn: ParseNode, index: usize, val: ParseNode) {
        self.nodes[pn].children[index] = val;
    }

    pub fn reduce_num_args(&mut self, pn: ParseNode, len: usize) {
        self.nodes[pn].children.truncate(len);
    }

    /// Wholesale child replacement, for pass rewrites that change arity.
    pub fn set_children(&mut self, pn: ParseNode, children: &[ParseNode]) {
        self.nodes[pn].children.clear();
        self.nodes[pn].children.extend_from_slice(children);
    }

    pub fn child(&self, pn: ParseNode) -> ParseNode {
        self.arg(pn, 0)
    }

    pub fn lhs(&self, pn: ParseNode) -> ParseNode {
        self.arg(pn, 0)
    }

    pub fn rhs(&self, pn: ParseNode) -> ParseNode {
        self.arg(pn, 1)
    }

    pub fn flag(&self, pn: ParseNode) -> usize {
        self.nodes[pn].flag
    }

    pub fn set_flag(&mut self, pn: ParseNode, flag: usize) {
        self.nodes[pn].flag = flag;
    }

    pub fn double(&self, pn: ParseNode) -> f64 {
        self.nodes[pn].double
    }

    pub fn set_double(&mut self, pn: ParseNode, val: f64) {
        self.nodes[pn].double = val;
    }

    pub fn name(&self, pn: ParseNode) -> Name {
        self.nodes[pn].name
    }

    pub fn set_name(&mut self, pn: ParseNode, name: Name) {
        self.nodes[pn].name = name;
    }

    pub fn ty(&self, pn: ParseNode) -> usize {
        self.nodes[pn].ty
    }

    pub fn set_ty(&mut self, pn: ParseNode, ty: usize) {
        self.nodes[pn].ty = ty;
    }

    pub fn rows(&self, pn: ParseNode) -> usize {
        self.nodes[pn].rows
    }

    pub fn cols(&self, pn: ParseNode) -> usize {
        self.nodes[pn].cols
    }

    pub fn set_rows(&mut self, pn: ParseNode, rows: usize) {
        self.nodes[pn].rows = rows;
    }

    pub fn set_cols(&mut self, pn: ParseNode, cols: usize) {
        self.nodes[pn].cols = cols;
    }

    pub fn sym(&self, pn: ParseNode) -> usize {
        self.nodes[pn].sym
    }

    pub fn set_sym(&mut self, pn: ParseNode, sym: usize) {
        self.nodes[pn].sym = sym;
    }

    pub fn copy_dims(&mut self, dest: ParseNode, src: ParseNode) {
        self.nodes[dest].rows = self.nodes[src].rows;
        self.nodes[dest].cols = self.nodes[src].cols;
    }

    pub fn transpose_dims(&mut self, dest: ParseNode, src: ParseNode) {
        self.nodes[dest].rows = self.nodes[src].cols;
        self.nodes[dest].cols = self.nodes[src].rows;
    }

    pub fn set_scalar(&mut self, pn: ParseNode) {
        self.nodes[pn].rows = 1;
        self.nodes[pn].cols = 1;
    }

    pub fn definitely_scalar(&self, pn: ParseNode) -> bool {
        self.rows(pn) == 1 && self.cols(pn) == 1
    }

    pub fn definitely_not_scalar(&self, pn: ParseNode) -> bool {
        self.rows(pn) > 1 || self.cols(pn) > 1
    }

    // Function-node layout:
    //   Algorithm: [val_cap, ref_cap, params, body, name]
    //   Lambda:    [val_cap, ref_cap, params, body]

    pub fn val_cap_list(&self, fn_node: ParseNode) -> ParseNode {
        self.arg(fn_node, 0)
    }

    pub fn ref_cap_list(&self, fn_node: ParseNode) -> ParseNode {
        self.arg(fn_node, 1)
    }

    pub fn set_ref_list(&mut self, fn_node: ParseNode, list: ParseNode) {
        self.set_arg(fn_node, 1, list);
    }

    pub fn param_list(&self, fn_node: ParseNode) -> ParseNode {
        self.arg(fn_node, 2)
    }

    pub fn body(&self, fn_node: ParseNode) -> ParseNode {
        self.arg(fn_node, 3)
    }

    pub fn set_body(&mut self, fn_node: ParseNode, body: ParseNode) {
        self.set_arg(fn_node, 3, body);
    }

    pub fn alg_name(&self, fn_node: ParseNode) -> ParseNode {
        self.arg(fn_node, 4)
    }

    pub fn val_list_size(&self, val_cap: ParseNode) -> usize {
        if val_cap == NONE {
            0
        } else {
            self.num_args(val_cap)
        }
    }

    // Unit-vector layout: [element, rows, cols]

    pub fn unit_vector_elem(&self, pn: ParseNode) -> ParseNode {
        self.arg(pn, 0)
    }

    pub fn unit_vector_rows(&self, pn: ParseNode) -> ParseNode {
        self.arg(pn, 1)
    }

    pub fn unit_vector_cols(&self, pn: ParseNode) -> ParseNode {
        self.arg(pn, 2)
    }

    // Clone / append / patch ------------------------------------------------

    fn is_identifier_class(op: Op) -> bool {
        matches!(op, Op::Identifier | Op::ReadGlobal | Op::ReadUpvalue)
    }

    /// Whether a node's flag holds a node reference at append time
    /// (post-parse, post-resolution; link slots come later).
    fn flag_is_node_ref(op: Op) -> bool {
        matches!(
            op,
            Op::Identifier
                | Op::Import
                | Op::FromImport
                | Op::UnknownList
                | Op::SingleCharMultProxy
                | Op::Switch
                | Op::SwitchNumeric
                | Op::SwitchString
        )
    }

    /// Structurally copy a subtree, recording identifier-class copies in the
    /// clone ledger.
    pub fn clone_subtree(&mut self, pn: ParseNode) -> ParseNode {
        let node = self.nodes[pn].clone();
        let copy = self.nodes.len();
        self.nodes.push(node);
        for i in 0..self.nodes[copy].children.len() {
            let child = self.nodes[copy].children[i];
            if child != NONE {
                let cloned_child = self.clone_subtree(child);
                self.nodes[copy].children[i] = cloned_child;
            }
        }
        // Error ops cover scope-access fields awaiting static resolution;
        // the linker rewrites their clones to module references
        if Self::is_identifier_class(self.nodes[copy].op) || self.nodes[copy].op == Op::Error {
            self.cloned_vars.push((pn, copy));
        }
        copy
    }

    /// Replay resolved types onto clones whose own resolution never ran
    /// (recursion retries leave such nodes behind).
    pub fn patch_cloned_types(&mut self) {
        for i in 0..self.cloned_vars.len() {
            let (origin, clone) = self.cloned_vars[i];
            if self.nodes[clone].ty == UNINITIALISED_TYPE {
                self.nodes[clone].ty = self.nodes[origin].ty;
                self.nodes[clone].rows = self.nodes[origin].rows;
                self.nodes[clone].cols = self.nodes[origin].cols;
            }
        }
    }

    /// Replay link results (read op + slot) onto clones. The linker only
    /// walks the tree reachable from the root; instantiated bodies pick up
    /// their slots here.
    pub fn patch_clones(&mut self) {
        for i in 0..self.cloned_vars.len() {
            let (origin, clone) = self.cloned_vars[i];
            if Self::is_identifier_class(self.nodes[origin].op) {
                self.nodes[clone].op = self.nodes[origin].op;
                self.nodes[clone].flag = self.nodes[origin].flag;
                self.nodes[clone].sym = self.nodes[origin].sym;
            }
        }
    }

    /// Concatenate another tree's cells into this one, offsetting its
    /// internal indices. Returns the offset to add to foreign node indices;
    /// in particular `offset + other.root` addresses the appended root.
    pub fn append(&mut self, other: &ParseTree) -> usize {
        let offset = self.nodes.len();
        let string_offset = self.strings.len();
        for node in &other.nodes {
            let mut copy = node.clone();
            for child in copy.children.iter_mut() {
                if *child != NONE {
                    *child += offset;
                }
            }
            if Self::flag_is_node_ref(copy.op) && copy.flag != NONE {
                copy.flag += offset;
            } else if copy.op == Op::StringLiteral && copy.flag != NONE {
                copy.flag += string_offset;
            }
            self.nodes.push(copy);
        }
        for &(origin, clone) in &other.cloned_vars {
            self.cloned_vars.push((origin + offset, clone + offset));
        }
        self.strings.extend(other.strings.iter().cloned());
        offset
    }

    /// Literal `1`, for rewrites that need a unit factor.
    pub fn make_one(&mut self, sel: Selection) -> ParseNode {
        let pn = self.add_terminal(Op::IntegerLiteral, sel);
        self.set_double(pn, 1.0);
        self.set_scalar(pn);
        pn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sel(start: usize, end: usize) -> Selection {
        Selection::from_span(0, start, end)
    }

    #[test]
    fn terminal_has_no_children() {
        let mut tree = ParseTree::new();
        let pn = tree.add_terminal(Op::IntegerLiteral, sel(0, 1));
        assert_eq!(tree.num_args(pn), 0);
        assert_eq!(tree.op(pn), Op::IntegerLiteral);
    }

    #[test]
    fn left_unary_extends_selection() {
        let mut tree = ParseTree::new();
        let child = tree.add_terminal(Op::IntegerLiteral, sel(2, 3));
        let pn = tree.add_left_unary(Op::UnaryMinus, Marker::new(0, 1), child);
        assert_eq!(tree.sel(pn).start, 1);
        assert_eq!(tree.sel(pn).end, 3);
        assert_eq!(tree.child(pn), child);
    }

    #[test]
    fn nary_builder_collects_children_in_order() {
        let mut tree = ParseTree::new();
        tree.prepare_nary();
        let a = tree.add_terminal(Op::IntegerLiteral, sel(0, 1));
        tree.add_nary_child(a);
        let b = tree.add_terminal(Op::IntegerLiteral, sel(2, 3));
        tree.add_nary_child(b);
        let pn = tree.finish_nary(Op::Block, sel(0, 3));
        assert_eq!(tree.num_args(pn), 2);
        assert_eq!(tree.arg(pn, 0), a);
        assert_eq!(tree.arg(pn, 1), b);
    }

    #[test]
    fn nested_nary_builders_do_not_interfere() {
        let mut tree = ParseTree::new();
        tree.prepare_nary();
        let a = tree.add_terminal(Op::IntegerLiteral, sel(0, 1));
        tree.add_nary_child(a);
        tree.prepare_nary();
        let b = tree.add_terminal(Op::IntegerLiteral, sel(2, 3));
        tree.add_nary_child(b);
        let inner = tree.finish_nary(Op::List, sel(2, 3));
        tree.add_nary_child(inner);
        let outer = tree.finish_nary(Op::Block, sel(0, 3));
        assert_eq!(tree.num_args(inner), 1);
        assert_eq!(tree.num_args(outer), 2);
    }

    #[test]
    fn pop_nary_child_returns_last() {
        let mut tree = ParseTree::new();
        tree.prepare_nary();
        let a = tree.add_terminal(Op::IntegerLiteral, sel(0, 1));
        tree.add_nary_child(a);
        assert_eq!(tree.pop_nary_child(), a);
        tree.cancel_nary();
    }

    #[test]
    fn clone_subtree_copies_structure_and_records_identifiers() {
        let mut tree = ParseTree::new();
        let id = tree.add_terminal(Op::Identifier, sel(0, 1));
        let lit = tree.add_terminal(Op::IntegerLiteral, sel(2, 3));
        let add = tree.add_node(Op::Addition, sel(0, 3), &[id, lit]);
        let copy = tree.clone_subtree(add);
        assert_eq!(tree.op(copy), Op::Addition);
        assert_ne!(tree.arg(copy, 0), id);
        assert_eq!(tree.op(tree.arg(copy, 0)), Op::Identifier);
        assert_eq!(tree.cloned_vars.len(), 1);
        assert_eq!(tree.cloned_vars[0].0, id);
    }

    #[test]
    fn patch_clones_replays_link_results() {
        let mut tree = ParseTree::new();
        let id = tree.add_terminal(Op::Identifier, sel(0, 1));
        let copy = tree.clone_subtree(id);
        tree.set_op(id, Op::ReadGlobal);
        tree.set_flag(id, 7);
        tree.patch_clones();
        assert_eq!(tree.op(copy), Op::ReadGlobal);
        assert_eq!(tree.flag(copy), 7);
    }

    #[test]
    fn append_offsets_children_and_root() {
        let mut a = ParseTree::new();
        a.add_terminal(Op::IntegerLiteral, sel(0, 1));

        let mut b = ParseTree::new();
        let lit = b.add_terminal(Op::IntegerLiteral, sel(0, 1));
        let blk = b.add_node(Op::Block, sel(0, 1), &[lit]);
        b.root = blk;

        let offset = a.append(&b);
        assert_eq!(offset, 1);
        let appended_root = offset + b.root;
        assert_eq!(a.op(appended_root), Op::Block);
        assert_eq!(a.arg(appended_root, 0), offset + lit);
    }

    #[test]
    fn reduce_num_args_truncates() {
        let mut tree = ParseTree::new();
        let a = tree.add_terminal(Op::IntegerLiteral, sel(0, 1));
        let b = tree.add_terminal(Op::IntegerLiteral, sel(1, 2));
        let n = tree.add_node(Op::List, sel(0, 2), &[a, b]);
        tree.reduce_num_args(n, 1);
        assert_eq!(tree.num_args(n), 1);
    }
}
