//! Slot assignment over the instantiated tree.
//!
//! One walk gives every symbol a stack slot (declaration order), a global
//! slot (depth 0), or an upvalue slot (capture-list order), rewriting
//! identifier nodes to the matching read op. Non-capturing algorithms are
//! linked last within their block so their dependencies already hold slots.

use crate::ops::Op;
use crate::parse_tree::{ParseNode, ParseTree, NONE};
use crate::static_pass::ALIAS;
use crate::symbol_table::SymbolTable;

pub struct SymbolLinker<'p> {
    parse_tree: &'p mut ParseTree,
    symbols: &'p mut SymbolTable,
    stack_size: usize,
    stack_frame: Vec<usize>,
    old_flags: Vec<usize>,
    closure_depth: u8,
}

impl<'p> SymbolLinker<'p> {
    pub fn new(parse_tree: &'p mut ParseTree, symbols: &'p mut SymbolTable) -> Self {
        SymbolLinker {
            parse_tree,
            symbols,
            stack_size: 0,
            stack_frame: Vec::new(),
            old_flags: Vec::new(),
            closure_depth: 0,
        }
    }

    pub fn link(mut self) {
        let root = self.parse_tree.root;
        self.resolve_block(root);
        self.patch_module_references();
    }

    /// Scope-access fields inside instantiated bodies were Error ops at
    /// clone time; the static pass resolved them to module-level symbols,
    /// which read through global slots.
    fn patch_module_references(&mut self) {
        for i in 0..self.parse_tree.cloned_vars.len() {
            let (origin, clone) = self.parse_tree.cloned_vars[i];
            if matches!(
                self.parse_tree.op(origin),
                Op::Identifier | Op::ReadGlobal | Op::ReadUpvalue
            ) {
                continue;
            }
            if self.parse_tree.op(clone) != Op::Identifier {
                continue;
            }
            let mut sym_id = self.parse_tree.sym(clone);
            if sym_id == NONE {
                continue;
            }
            while self.symbols.symbols[sym_id].ty == ALIAS {
                sym_id = self.symbols.symbols[sym_id].shadowed_index;
            }
            let sym = &self.symbols.symbols[sym_id];
            if sym.declaration_closure_depth == 0 {
                self.parse_tree.set_op(clone, Op::ReadGlobal);
                self.parse_tree.set_flag(clone, sym.flag);
            }
        }
    }

    fn resolve_stmt(&mut self, pn: ParseNode) {
        match self.parse_tree.op(pn) {
            Op::Algorithm => {
                let name = self.parse_tree.alg_name(pn);
                self.resolve_declaration(name);
                let ref_cap = self.parse_tree.ref_cap_list(pn);
                let capturing = self.parse_tree.val_cap_list(pn) != NONE
                    || (ref_cap != NONE && self.parse_tree.num_args(ref_cap) != 0);
                if capturing {
                    self.resolve_algorithm(pn);
                }
            }
            Op::Assert => self.resolve_expr(self.parse_tree.child(pn)),
            Op::Assign | Op::Equal => self.resolve_assignment(pn),
            Op::Block => self.resolve_block(pn),
            Op::DoNothing | Op::Break | Op::Continue | Op::PrototypeAlg | Op::Class
            | Op::Enum | Op::UnknownList | Op::FileRef => {}
            Op::ElementwiseAssignment => self.resolve_ewise_assignment(pn),
            Op::ExprStmt => self.resolve_expr(self.parse_tree.child(pn)),
            Op::For => self.resolve_for(pn),
            Op::FromImport | Op::Import => self.resolve_import(pn),
            Op::If => self.resolve_if(pn),
            Op::IfElse => self.resolve_if_else(pn),
            Op::Namespace => {
                let body = self.parse_tree.rhs(pn);
                self.resolve_block(body);
            }
            Op::Plot | Op::Print => self.resolve_all_children(pn),
            Op::RangedFor => self.resolve_ranged_for(pn),
            Op::Reassign => self.resolve_reassignment(pn),
            Op::Return => self.resolve_expr(self.parse_tree.child(pn)),
            Op::ReturnEmpty => {}
            Op::Switch | Op::SwitchNumeric | Op::SwitchString => self.resolve_switch(pn),
            Op::While => {
                self.resolve_expr(self.parse_tree.arg(pn, 0));
                self.increase_lexical_depth();
                self.resolve_stmt(self.parse_tree.arg(pn, 1));
                self.decrease_lexical_depth();
            }
            _ => {}
        }
    }

    fn resolve_expr(&mut self, pn: ParseNode) {
        if pn == NONE {
            return;
        }
        match self.parse_tree.op(pn) {
            Op::DefiniteIntegral => self.resolve_definite_integral(pn),
            Op::Derivative | Op::Partial => self.resolve_derivative(pn),
            Op::Identifier => self.resolve_reference(pn),
            Op::Lambda => self.resolve_algorithm(pn),
            Op::Summation | Op::Product => self.resolve_big(pn),
            Op::SingleCharMultProxy => {
                let mult = self.parse_tree.flag(pn);
                self.resolve_all_children(mult);
            }
            _ => self.resolve_all_children(pn),
        }
    }

    fn resolve_all_children(&mut self, pn: ParseNode) {
        for i in 0..self.parse_tree.num_args(pn) {
            let child = self.parse_tree.arg(pn, i);
            if child != NONE {
                self.resolve_expr(child);
            }
        }
    }

    fn resolve_algorithm(&mut self, pn: ParseNode) {
        self.increase_closure_depth(pn);
        let params = self.parse_tree.param_list(pn);
        for i in 0..self.parse_tree.num_args(params) {
            let param = self.parse_tree.arg(params, i);
            if self.parse_tree.op(param) == Op::Equal {
                self.resolve_expr(self.parse_tree.rhs(param));
                self.resolve_declaration(self.parse_tree.lhs(param));
            } else {
                self.resolve_declaration(param);
            }
        }
        if self.parse_tree.op(pn) != Op::Lambda {
            self.resolve_stmt(self.parse_tree.body(pn));
        } else {
            self.resolve_expr(self.parse_tree.body(pn));
        }
        self.decrease_closure_depth(pn);
    }

    fn resolve_assignment(&mut self, pn: ParseNode) {
        self.resolve_expr(self.parse_tree.rhs(pn));
        self.resolve_declaration(self.parse_tree.lhs(pn));
    }

    fn resolve_block(&mut self, pn: ParseNode) {
        for i in 0..self.parse_tree.num_args(pn) {
            self.resolve_stmt(self.parse_tree.arg(pn, i));
        }

        // Non-capturing algorithms link last so their captured dependencies
        // already have slots
        for i in 0..self.parse_tree.num_args(pn) {
            let child = self.parse_tree.arg(pn, i);
            if self.parse_tree.op(child) != Op::Algorithm {
                continue;
            }
            let ref_cap = self.parse_tree.ref_cap_list(child);
            let capturing = self.parse_tree.val_cap_list(child) != NONE
                || (ref_cap != NONE && self.parse_tree.num_args(ref_cap) != 0);
            if !capturing {
                self.resolve_algorithm(child);
            }
        }
    }

    fn resolve_ewise_assignment(&mut self, pn: ParseNode) {
        let lhs = self.parse_tree.lhs(pn);
        let rhs = self.parse_tree.rhs(pn);
        let id = self.parse_tree.arg(lhs, 0);
        self.resolve_reference(id);

        self.increase_lexical_depth();
        let num_subscripts = self.parse_tree.num_args(lhs) - 1;
        for i in 0..num_subscripts {
            let sub = self.parse_tree.arg(lhs, i + 1);
            if self.parse_tree.op(sub) != Op::Slice {
                self.resolve_declaration(sub);
            } else {
                self.resolve_expr(sub);
            }
        }
        self.resolve_expr(rhs);
        self.decrease_lexical_depth();
    }

    fn resolve_for(&mut self, pn: ParseNode) {
        self.increase_lexical_depth();
        self.resolve_stmt(self.parse_tree.arg(pn, 0));
        self.resolve_expr(self.parse_tree.arg(pn, 1));
        self.resolve_stmt(self.parse_tree.arg(pn, 2));
        self.resolve_stmt(self.parse_tree.arg(pn, 3));
        self.decrease_lexical_depth();
    }

    fn resolve_if(&mut self, pn: ParseNode) {
        self.resolve_expr(self.parse_tree.arg(pn, 0));
        self.increase_lexical_depth();
        self.resolve_stmt(self.parse_tree.arg(pn, 1));
        self.decrease_lexical_depth();
    }

    fn resolve_if_else(&mut self, pn: ParseNode) {
        self.resolve_if(pn);
        self.increase_lexical_depth();
        self.resolve_stmt(self.parse_tree.arg(pn, 2));
        self.decrease_lexical_depth();
    }

    fn resolve_import(&mut self, pn: ParseNode) {
        let body = self.parse_tree.flag(pn);
        if body != NONE {
            self.resolve_stmt(body);
        }
    }

    fn resolve_ranged_for(&mut self, pn: ParseNode) {
        self.increase_lexical_depth();
        self.resolve_declaration(self.parse_tree.arg(pn, 0));
        self.resolve_expr(self.parse_tree.arg(pn, 1));
        self.resolve_stmt(self.parse_tree.arg(pn, 2));
        self.decrease_lexical_depth();
    }

    fn resolve_reassignment(&mut self, pn: ParseNode) {
        self.resolve_expr(self.parse_tree.rhs(pn));
        self.resolve_expr(self.parse_tree.lhs(pn));
    }

    fn resolve_switch(&mut self, pn: ParseNode) {
        self.resolve_expr(self.parse_tree.arg(pn, 0));
        for i in (1..self.parse_tree.num_args(pn)).rev() {
            let case_node = self.parse_tree.arg(pn, i);
            if self.parse_tree.op(case_node) == Op::Case {
                self.resolve_expr(self.parse_tree.lhs(case_node));
            }
            let stmt = self.parse_tree.rhs(case_node);
            if stmt != NONE {
                self.increase_lexical_depth();
                self.resolve_stmt(stmt);
                self.decrease_lexical_depth();
            }
        }
    }

    fn resolve_big(&mut self, pn: ParseNode) {
        self.increase_lexical_depth();
        let assign = self.parse_tree.arg(pn, 0);
        if self.parse_tree.op(assign) != Op::Assign {
            self.decrease_lexical_depth();
            return;
        }
        let id = self.parse_tree.lhs(assign);
        self.resolve_declaration(id);
        self.resolve_expr(self.parse_tree.rhs(assign));
        self.resolve_expr(self.parse_tree.arg(pn, 1));
        self.resolve_expr(self.parse_tree.arg(pn, 2));
        self.decrease_lexical_depth();
    }

    fn resolve_definite_integral(&mut self, pn: ParseNode) {
        self.resolve_expr(self.parse_tree.arg(pn, 1));
        self.resolve_expr(self.parse_tree.arg(pn, 2));
        self.increase_lexical_depth();
        self.resolve_declaration(self.parse_tree.arg(pn, 0));
        self.resolve_expr(self.parse_tree.arg(pn, 3));
        self.decrease_lexical_depth();
    }

    fn resolve_derivative(&mut self, pn: ParseNode) {
        let id = self.parse_tree.arg(pn, 1);
        let previous = self.parse_tree.arg(pn, 2);
        if previous != NONE {
            self.resolve_reference(previous);
        }

        self.increase_lexical_depth();
        self.resolve_declaration(id);
        self.resolve_expr(self.parse_tree.arg(pn, 0));
        self.decrease_lexical_depth();
    }

    fn resolve_declaration(&mut self, pn: ParseNode) {
        let sym_id = self.parse_tree.sym(pn);
        if sym_id == NONE {
            return;
        }
        let sym = &mut self.symbols.symbols[sym_id];

        if sym.is_closure_nested && !sym.is_captured_by_value {
            self.parse_tree.set_op(pn, Op::ReadUpvalue);
            self.parse_tree.set_flag(pn, sym.flag);
        } else if !sym.is_captured_by_value {
            sym.flag = self.stack_size;
            self.stack_size += 1;
        }
    }

    fn resolve_reference(&mut self, pn: ParseNode) {
        let mut sym_id = self.parse_tree.sym(pn);
        if sym_id == NONE {
            return;
        }
        while self.symbols.symbols[sym_id].ty == ALIAS {
            sym_id = self.symbols.symbols[sym_id].shadowed_index;
        }
        let sym = &self.symbols.symbols[sym_id];

        if sym.is_closure_nested {
            self.parse_tree.set_op(pn, Op::ReadUpvalue);
            self.parse_tree.set_flag(pn, sym.flag);
        } else if sym.declaration_closure_depth == 0 {
            self.parse_tree.set_op(pn, Op::ReadGlobal);
            self.parse_tree.set_flag(pn, sym.flag);
        } else {
            // Stack offset relative to the frame top at this read site; a
            // read before the declaration wraps and fails the runtime bound
            // check as use-before-define
            let offset = self.stack_size.wrapping_sub(1).wrapping_sub(sym.flag);
            self.parse_tree.set_flag(pn, offset);
        }
    }

    fn increase_lexical_depth(&mut self) {
        self.stack_frame.push(self.stack_size);
    }

    fn decrease_lexical_depth(&mut self) {
        self.stack_size = self.stack_frame.pop().unwrap();
    }

    fn increase_closure_depth(&mut self, pn: ParseNode) {
        self.increase_lexical_depth();

        let val_list = self.parse_tree.val_cap_list(pn);
        let ref_list = self.parse_tree.ref_cap_list(pn);
        let n_cap = self.parse_tree.val_list_size(val_list);

        for i in 0..n_cap {
            let cap = self.parse_tree.arg(val_list, i);
            let sym_id = self.parse_tree.sym(cap);
            let sym = &mut self.symbols.symbols[sym_id];
            self.old_flags.push(sym.flag);
            sym.flag = i;
        }

        if ref_list != NONE {
            for i in 0..self.parse_tree.num_args(ref_list) {
                let reference = self.parse_tree.arg(ref_list, i);
                let sym_id = self.parse_tree.sym(reference);
                let sym = &mut self.symbols.symbols[sym_id];
                self.old_flags.push(sym.flag);
                sym.flag = n_cap + i;
            }
        }

        self.closure_depth += 1;
    }

    fn decrease_closure_depth(&mut self, pn: ParseNode) {
        self.decrease_lexical_depth();

        let val_list = self.parse_tree.val_cap_list(pn);
        let ref_list = self.parse_tree.ref_cap_list(pn);
        let n_val = self.parse_tree.val_list_size(val_list);
        let n_ref = if ref_list == NONE {
            0
        } else {
            self.parse_tree.num_args(ref_list)
        };

        for i in (0..n_ref).rev() {
            let reference = self.parse_tree.arg(ref_list, i);
            let sym_id = self.parse_tree.sym(reference);
            let sym = &mut self.symbols.symbols[sym_id];
            sym.flag = self.old_flags.pop().unwrap();
        }

        for i in (0..n_val).rev() {
            let cap = self.parse_tree.arg(val_list, i);
            let sym_id = self.parse_tree.sym(cap);
            // The capture node reads the outer variable it aliases
            let outer = self.symbols.symbols[sym_id].shadowed_index;
            if outer != NONE {
                self.parse_tree.set_sym(cap, outer);
                self.resolve_reference(cap);
            }
            let flag = self.old_flags.pop().unwrap();
            self.symbols.symbols[sym_id].flag = flag;
        }

        for i in (0..n_ref).rev() {
            let reference = self.parse_tree.arg(ref_list, i);
            let sym_id = self.parse_tree.sym(reference);
            let sym = &self.symbols.symbols[sym_id];
            if sym.declaration_closure_depth != self.closure_depth {
                self.parse_tree.set_op(reference, Op::ReadUpvalue);
                self.parse_tree.set_flag(reference, sym.flag);
            }
        }

        self.closure_depth -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler;
    use crate::program::Program;
    use std::path::PathBuf;

    fn link(source: &str) -> (Program, compiler::Compilation) {
        let mut program = Program::new();
        let id = program
            .set_entry_source(PathBuf::from("test.nte"), source)
            .model()
            .expect("valid serial");
        let mut compilation = compiler::compile(&mut program, id).expect("compiles");
        let tree = &mut compilation.parse_tree;
        let table = &mut compilation.symbol_table;
        SymbolLinker::new(tree, table).link();
        tree.patch_clones();
        (program, compilation)
    }

    #[test]
    fn globals_read_through_global_slots() {
        let (program, compilation) = link("x ← 3\nprint(x)");
        assert!(program.no_errors());
        let tree = &compilation.parse_tree;
        let print = tree.arg(tree.root, 1);
        let read = tree.child(print);
        assert_eq!(tree.op(read), Op::ReadGlobal);
        assert_eq!(tree.flag(read), 0);
    }

    #[test]
    fn second_global_gets_next_slot() {
        let (_, compilation) = link("x ← 3\ny ← 4\nprint(y)");
        let tree = &compilation.parse_tree;
        let print = tree.arg(tree.root, 2);
        let read = tree.child(print);
        assert_eq!(tree.op(read), Op::ReadGlobal);
        assert_eq!(tree.flag(read), 1);
    }

    #[test]
    fn instantiated_bodies_pick_up_slots_via_patch() {
        let (program, compilation) = link("f(x) = x + 1\nprint(f(2))");
        assert!(program.no_errors());
        let tree = &compilation.parse_tree;
        // the instantiated body exists and its parameter read was patched
        let (_, inst) = compilation
            .instantiation_lookup
            .iter()
            .next()
            .map(|(k, v)| (*k, *v))
            .unwrap();
        let body = tree.body(inst);
        assert_eq!(tree.op(body), Op::Return);
    }
}
