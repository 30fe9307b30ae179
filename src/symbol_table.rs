//! Symbols, usages, and scope segments.
//!
//! A scope may be split into several segments (namespace reopen, nested
//! scopes interleaving); segments of one scope chain through
//! `prev_lexical_segment`. All cross-references are indices into the owning
//! vectors, so the table can be cloned wholesale for the interpreter.

use std::collections::HashMap;

use crate::intern::Name;
use crate::model::{Marker, ModelId, Selection};
use crate::parse_tree::{ParseNode, ParseTree, NONE, UNINITIALISED_TYPE, UNKNOWN_SIZE};

pub type SymbolIndex = usize;
pub type ScopeSegmentIndex = usize;
pub type UsageIndex = usize;

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: Name,
    pub declaration_lexical_depth: u16,
    pub declaration_closure_depth: u8,
    /// Successively: the declaring parse node, the linked slot, or a
    /// module/namespace identifier.
    pub flag: usize,
    pub ty: usize,
    pub rows: usize,
    pub cols: usize,
    pub comment: ParseNode,
    pub shadowed_index: SymbolIndex,
    pub last_usage_index: UsageIndex,
    pub previous_namespace_index: usize,
    pub is_const: bool,
    pub is_used: bool,
    pub is_reassigned: bool,
    pub is_closure_nested: bool,
    pub is_prototype: bool,
    pub is_ewise_index: bool,
    pub is_captured_by_value: bool,
    pub tied_to_file: bool,
}

impl Symbol {
    fn new(
        name: Name,
        pn: ParseNode,
        lexical_depth: u16,
        closure_depth: u8,
        shadowed: SymbolIndex,
        is_const: bool,
    ) -> Self {
        Symbol {
            name,
            declaration_lexical_depth: lexical_depth,
            declaration_closure_depth: closure_depth,
            flag: pn,
            ty: UNINITIALISED_TYPE,
            rows: UNKNOWN_SIZE,
            cols: UNKNOWN_SIZE,
            comment: NONE,
            shadowed_index: shadowed,
            last_usage_index: NONE,
            previous_namespace_index: NONE,
            is_const,
            is_used: false,
            is_reassigned: false,
            is_closure_nested: false,
            is_prototype: false,
            is_ewise_index: false,
            is_captured_by_value: false,
            tied_to_file: false,
        }
    }

    /// Capture-list slot of a closure-nested symbol.
    pub fn closure_index(&self) -> usize {
        debug_assert!(self.declaration_closure_depth != 0);
        self.declaration_closure_depth as usize - 1
    }
}

#[derive(Debug, Clone)]
pub struct SymbolUsage {
    pub sel: Selection,
    pub prev_usage_index: UsageIndex,
    pub symbol_index: SymbolIndex,
    pub pn: ParseNode,
}

#[derive(Debug, Clone)]
pub struct ScopeSegment {
    pub start_of_selection: Marker,
    /// Enclosing closure node, or NONE outside any function.
    pub fn_node: ParseNode,
    pub parent_lexical_segment: ScopeSegmentIndex,
    pub prev_lexical_segment: ScopeSegmentIndex,
    pub prev_namespace_segment: ScopeSegmentIndex,
    pub first_sym_index: SymbolIndex,
    pub usage_begin: usize,
    pub usage_end: usize,
    pub is_end_of_scope: bool,
}

impl ScopeSegment {
    fn new(
        start: Marker,
        fn_node: ParseNode,
        parent: ScopeSegmentIndex,
        prev: ScopeSegmentIndex,
        sym_begin: SymbolIndex,
        usage_begin: usize,
    ) -> Self {
        ScopeSegment {
            start_of_selection: start,
            fn_node,
            parent_lexical_segment: parent,
            prev_lexical_segment: prev,
            prev_namespace_segment: NONE,
            first_sym_index: sym_begin,
            usage_begin,
            usage_end: NONE,
            is_end_of_scope: false,
        }
    }

    pub fn is_start_of_scope(&self) -> bool {
        self.prev_lexical_segment == NONE
    }
}

#[derive(Clone, Default)]
pub struct SymbolTable {
    pub symbols: Vec<Symbol>,
    pub scope_segments: Vec<ScopeSegment>,
    pub usages: Vec<SymbolUsage>,
    /// Name → active symbol, maintained during the lexical pass.
    pub lexical_map: HashMap<Name, SymbolIndex>,
    /// (namespace symbol, member name) → symbol, persisted for `a.b` access.
    pub scoped_vars: HashMap<(SymbolIndex, Name), SymbolIndex>,
    /// Module-level (depth 0) declarations of each imported model.
    pub module_exports: HashMap<ModelId, HashMap<Name, SymbolIndex>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable::default()
    }

    pub fn reset(&mut self, doc_start: Marker) {
        self.symbols.clear();
        self.scope_segments.clear();
        self.usages.clear();
        self.lexical_map.clear();
        self.scoped_vars.clear();
        self.module_exports.clear();
        self.scope_segments
            .push(ScopeSegment::new(doc_start, NONE, NONE, NONE, 0, 0));
    }

    /// Declare a symbol for `pn` and record its declaration usage.
    pub fn add_symbol(
        &mut self,
        parse_tree: &mut ParseTree,
        pn: ParseNode,
        lexical_depth: u16,
        closure_depth: u8,
        shadowed: SymbolIndex,
        is_const: bool,
    ) -> SymbolIndex {
        let index = self.symbols.len();
        let name = parse_tree.name(pn);
        parse_tree.set_sym(pn, index);
        let mut sym = Symbol::new(name, pn, lexical_depth, closure_depth, shadowed, is_const);
        sym.comment = parse_tree.flag(pn);
        sym.last_usage_index = self.usages.len();
        self.symbols.push(sym);
        self.usages.push(SymbolUsage {
            sel: parse_tree.sel(pn),
            prev_usage_index: NONE,
            symbol_index: index,
            pn,
        });
        index
    }

    /// Record a reference, linking it into the symbol's usage chain and
    /// marking closure nesting when the read crosses a closure boundary.
    pub fn resolve_reference(
        &mut self,
        parse_tree: &mut ParseTree,
        pn: ParseNode,
        sym_id: SymbolIndex,
        closure_depth: u8,
    ) {
        let sym = &mut self.symbols[sym_id];
        parse_tree.set_sym(pn, sym_id);
        sym.is_used = true;
        sym.is_closure_nested |= sym.declaration_closure_depth != 0
            && closure_depth != sym.declaration_closure_depth;

        let prev = sym.last_usage_index;
        self.usages.push(SymbolUsage {
            sel: parse_tree.sel(pn),
            prev_usage_index: prev,
            symbol_index: sym_id,
            pn,
        });
        sym.last_usage_index = self.usages.len() - 1;
    }

    /// Insert a usage stub for a scope access whose symbol is not yet
    /// known; the static pass patches it via `resolve_scope_reference`.
    pub fn add_usage_stub(&mut self, pn: ParseNode, sel: Selection) -> UsageIndex {
        self.usages.push(SymbolUsage {
            sel,
            prev_usage_index: NONE,
            symbol_index: NONE,
            pn,
        });
        self.usages.len() - 1
    }

    /// Patch a stub usage once the accessed symbol is resolved.
    pub fn resolve_scope_reference(
        &mut self,
        parse_tree: &mut ParseTree,
        usage_index: UsageIndex,
        sym_index: SymbolIndex,
    ) {
        let pn = self.usages[usage_index].pn;
        self.usages[usage_index].symbol_index = sym_index;
        parse_tree.set_sym(pn, sym_index);

        let sym = &mut self.symbols[sym_index];
        sym.is_used = true;
        self.usages[usage_index].prev_usage_index = sym.last_usage_index;
        sym.last_usage_index = usage_index;
    }

    /// Open a new scope: the active segment ends its usage span and a fresh
    /// segment starts with the active one as parent.
    pub fn add_scope(&mut self, start: Marker, closure: ParseNode) {
        let parent = self.scope_segments.len() - 1;
        self.scope_segments[parent].usage_end = self.usages.len();
        let segment = ScopeSegment::new(
            start,
            closure,
            parent,
            NONE,
            self.symbols.len(),
            self.usages.len(),
        );
        self.scope_segments.push(segment);
    }

    /// Close the active scope and push a continuation segment of its parent.
    pub fn close_scope(&mut self, stop: Marker) {
        let closed = self.scope_segments.len() - 1;
        self.scope_segments[closed].usage_end = self.usages.len();
        self.scope_segments[closed].is_end_of_scope = true;

        let prev_index = self.scope_segments[closed].parent_lexical_segment;
        let prev = &self.scope_segments[prev_index];
        let segment = ScopeSegment::new(
            stop,
            prev.fn_node,
            prev.parent_lexical_segment,
            prev_index,
            self.symbols.len(),
            self.usages.len(),
        );
        self.scope_segments.push(segment);
    }

    /// Index of the segment covering a marker (segments are ordered by
    /// their start marker within one model).
    pub fn containing_scope(&self, m: Marker) -> ScopeSegmentIndex {
        let mut result = 0;
        for (i, segment) in self.scope_segments.iter().enumerate() {
            if segment.start_of_selection.model == m.model
                && segment.start_of_selection.index <= m.index
            {
                result = i;
            }
        }
        result
    }

    /// Seal the final segment. Cross-references stay as indices.
    pub fn finalize(&mut self) {
        if let Some(last) = self.scope_segments.last_mut() {
            last.is_end_of_scope = true;
            last.usage_end = self.usages.len();
        }
    }

    pub fn first_occurrence(&self, sym_index: SymbolIndex) -> Selection {
        let mut usage_index = self.symbols[sym_index].last_usage_index;
        loop {
            let usage = &self.usages[usage_index];
            if usage.prev_usage_index == NONE {
                return usage.sel;
            }
            usage_index = usage.prev_usage_index;
        }
    }

    pub fn occurrences(&self, sym_index: SymbolIndex) -> Vec<Selection> {
        let mut found = Vec::new();
        let mut usage_index = self.symbols[sym_index].last_usage_index;
        while usage_index != NONE {
            found.push(self.usages[usage_index].sel);
            usage_index = self.usages[usage_index].prev_usage_index;
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::Op;

    fn tree_with_identifier() -> (ParseTree, ParseNode) {
        let mut tree = ParseTree::new();
        let pn = tree.add_terminal(Op::Identifier, Selection::from_span(0, 0, 1));
        (tree, pn)
    }

    #[test]
    fn add_symbol_records_declaration_usage() {
        let (mut tree, pn) = tree_with_identifier();
        let mut table = SymbolTable::new();
        table.reset(Marker::new(0, 0));
        let sym = table.add_symbol(&mut tree, pn, 0, 0, NONE, false);
        assert_eq!(tree.sym(pn), sym);
        assert_eq!(table.usages.len(), 1);
        assert_eq!(table.usages[0].prev_usage_index, NONE);
    }

    #[test]
    fn references_chain_most_recent_first() {
        let (mut tree, pn) = tree_with_identifier();
        let use1 = tree.add_terminal(Op::Identifier, Selection::from_span(0, 4, 5));
        let use2 = tree.add_terminal(Op::Identifier, Selection::from_span(0, 8, 9));
        let mut table = SymbolTable::new();
        table.reset(Marker::new(0, 0));
        let sym = table.add_symbol(&mut tree, pn, 0, 0, NONE, false);
        table.resolve_reference(&mut tree, use1, sym, 0);
        table.resolve_reference(&mut tree, use2, sym, 0);

        let occurrences = table.occurrences(sym);
        assert_eq!(occurrences.len(), 3);
        assert_eq!(occurrences[0].start, 8);
        assert_eq!(occurrences[2].start, 0);
        assert_eq!(table.first_occurrence(sym).start, 0);
    }

    #[test]
    fn cross_closure_reference_marks_nesting() {
        let (mut tree, pn) = tree_with_identifier();
        let reference = tree.add_terminal(Op::Identifier, Selection::from_span(0, 4, 5));
        let mut table = SymbolTable::new();
        table.reset(Marker::new(0, 0));
        let sym = table.add_symbol(&mut tree, pn, 0, 1, NONE, false);
        table.resolve_reference(&mut tree, reference, sym, 2);
        assert!(table.symbols[sym].is_closure_nested);
    }

    #[test]
    fn global_reference_does_not_mark_nesting() {
        let (mut tree, pn) = tree_with_identifier();
        let reference = tree.add_terminal(Op::Identifier, Selection::from_span(0, 4, 5));
        let mut table = SymbolTable::new();
        table.reset(Marker::new(0, 0));
        let sym = table.add_symbol(&mut tree, pn, 0, 0, NONE, false);
        table.resolve_reference(&mut tree, reference, sym, 2);
        assert!(!table.symbols[sym].is_closure_nested);
    }

    #[test]
    fn close_scope_chains_continuation_segment() {
        let mut table = SymbolTable::new();
        table.reset(Marker::new(0, 0));
        table.add_scope(Marker::new(0, 5), NONE);
        table.close_scope(Marker::new(0, 9));
        assert_eq!(table.scope_segments.len(), 3);
        let closed = &table.scope_segments[1];
        assert!(closed.is_end_of_scope);
        let continuation = &table.scope_segments[2];
        assert_eq!(continuation.prev_lexical_segment, 0);
        assert!(!continuation.is_start_of_scope());
    }

    #[test]
    fn containing_scope_picks_latest_started_segment() {
        let mut table = SymbolTable::new();
        table.reset(Marker::new(0, 0));
        table.add_scope(Marker::new(0, 5), NONE);
        table.close_scope(Marker::new(0, 9));
        assert_eq!(table.containing_scope(Marker::new(0, 3)), 0);
        assert_eq!(table.containing_scope(Marker::new(0, 6)), 1);
        assert_eq!(table.containing_scope(Marker::new(0, 12)), 2);
    }
}
