//! Size-aware type inference and monomorphic instantiation.
//!
//! Types are `usize` tags: the abstract tags live at the top of the space
//! and function types are small indices into a hash-consed pool of sorted
//! declaration sets. Every call site instantiates each declaration in the
//! callee's function set against the concrete argument signature, memoising
//! the results; recursion is broken with a RECURSIVE_CYCLE seed and a
//! single retry.
//!
//! Imports are driven from here: the first encounter of a module runs
//! scanner, parser, and symbol-lexical passes on it and splices its parse
//! tree and symbol table into the entry model's.

use std::collections::HashMap;

use log::debug;

use crate::errors::ErrorCode;
use crate::lexical_pass::LexicalPass;
use crate::model::ModelId;
use crate::ops::Op;
use crate::parse_tree::{ParseNode, ParseTree, NONE, UNKNOWN_SIZE};
use crate::parser::Parser;
use crate::program::Program;
use crate::scanner::Scanner;
use crate::settings::SettingId;
use crate::symbol_table::SymbolTable;

pub type Type = usize;

pub const UNINITIALISED: Type = usize::MAX;
pub const NUMERIC: Type = usize::MAX - 1;
pub const STRING: Type = usize::MAX - 2;
pub const BOOLEAN: Type = usize::MAX - 3;
pub const VOID_TYPE: Type = usize::MAX - 4;
pub const RECURSIVE_CYCLE: Type = usize::MAX - 5;
pub const FAILURE: Type = usize::MAX - 6;
pub const NAMESPACE_TYPE: Type = usize::MAX - 7;
pub const MODULE_TYPE: Type = usize::MAX - 8;
pub const ALIAS: Type = usize::MAX - 9;

/// Function-set types are pool indices, far below the abstract tags.
pub fn is_function_set(t: Type) -> bool {
    t < usize::MAX - 32
}

/// Declaration index + concrete argument tags; NUMERIC is followed by rows
/// and cols each time.
pub type CallSignature = Vec<usize>;
/// Function node + captured-value types at declaration.
pub type DeclareSignature = Vec<usize>;

pub type InstantiationLookup = HashMap<(ParseNode, ParseNode), ParseNode>;
pub type NumericSwitchMap = HashMap<(ParseNode, u64), ParseNode>;
pub type StringSwitchMap = HashMap<(ParseNode, String), ParseNode>;

/// Canonical hash key for a numeric switch value (merges -0.0 into 0.0).
pub fn numeric_key(value: f64) -> u64 {
    if value == 0.0 {
        0.0f64.to_bits()
    } else {
        value.to_bits()
    }
}

#[derive(Clone, Copy)]
struct CallResult {
    ty: Type,
    rows: usize,
    cols: usize,
    instantiated: ParseNode,
}

#[derive(Clone, Copy)]
struct ReturnType {
    ty: Type,
    rows: usize,
    cols: usize,
}

#[derive(Clone, Copy)]
struct CachedInfo {
    ty: Type,
    rows: usize,
    cols: usize,
}

pub struct StaticPass<'p> {
    program: &'p mut Program,
    parse_tree: &'p mut ParseTree,
    symbol_table: &'p mut SymbolTable,
    active_model: ModelId,

    pub instantiation_lookup: InstantiationLookup,
    pub number_switch: NumericSwitchMap,
    pub string_switch: StringSwitchMap,

    pool: Vec<usize>,
    memoized_sets: HashMap<Vec<usize>, Type>,
    declared_funcs: Vec<DeclareSignature>,
    declared_func_map: HashMap<DeclareSignature, usize>,
    called_func_map: HashMap<CallSignature, CallResult>,
    all_calls: Vec<(ParseNode, CallSignature)>,
    return_types: Vec<ReturnType>,

    retry_at_recursion: bool,
    first_attempt: bool,
    recursion_fallback: Option<CallSignature>,
    encountered_autosize: bool,
}

impl<'p> StaticPass<'p> {
    pub fn new(
        program: &'p mut Program,
        parse_tree: &'p mut ParseTree,
        symbol_table: &'p mut SymbolTable,
        entry_model: ModelId,
    ) -> Self {
        StaticPass {
            program,
            parse_tree,
            symbol_table,
            active_model: entry_model,
            instantiation_lookup: HashMap::new(),
            number_switch: HashMap::new(),
            string_switch: HashMap::new(),
            pool: Vec::new(),
            memoized_sets: HashMap::new(),
            declared_funcs: Vec::new(),
            declared_func_map: HashMap::new(),
            called_func_map: HashMap::new(),
            all_calls: Vec::new(),
            return_types: Vec::new(),
            retry_at_recursion: false,
            first_attempt: true,
            recursion_fallback: None,
            encountered_autosize: false,
        }
    }

    pub fn resolve(&mut self) {
        if !self.program.no_errors() {
            return;
        }
        debug!("static pass over model {}", self.active_model);

        let root = self.parse_tree.root;
        self.parse_tree.root = self.resolve_stmt(root);

        let unresolved: Vec<CallSignature> = self
            .called_func_map
            .iter()
            .filter(|(_, result)| result.ty == RECURSIVE_CYCLE)
            .map(|(sig, _)| sig.clone())
            .collect();
        for sig in unresolved {
            let fn_node = self.func_from_call_sig(&sig);
            self.error_code(fn_node, fn_node, ErrorCode::RecursiveType);
        }
        if !self.program.no_errors() {
            return;
        }

        for (call, sig) in std::mem::take(&mut self.all_calls) {
            let decl = &self.declared_funcs[sig[0]];
            let abstract_fn = decl[0];
            if let Some(result) = self.called_func_map.get(&sig) {
                self.instantiation_lookup
                    .insert((abstract_fn, call), result.instantiated);
            }
        }

        self.parse_tree.patch_cloned_types();
    }

    // Diagnostics helpers ---------------------------------------------------

    fn error(&mut self, pn: ParseNode, offender: ParseNode) -> ParseNode {
        self.error_code(pn, offender, ErrorCode::TypeError)
    }

    /// While a recursion retry is pending, mismatches are provisional: the
    /// node is tagged RECURSIVE_CYCLE and nothing is reported, so the retry
    /// can succeed with the memoised return type.
    fn error_code(&mut self, pn: ParseNode, offender: ParseNode, code: ErrorCode) -> ParseNode {
        if self.retry_at_recursion {
            self.parse_tree.set_ty(pn, RECURSIVE_CYCLE);
            return pn;
        }
        if self.program.no_errors() {
            let sel = self.parse_tree.sel(offender);
            self.program.fail(sel, code);
        }
        self.parse_tree.set_ty(pn, FAILURE);
        pn
    }

    fn error_type(&mut self, pn: ParseNode, code: ErrorCode) -> Type {
        if self.retry_at_recursion {
            return RECURSIVE_CYCLE;
        }
        if self.program.no_errors() {
            let sel = self.parse_tree.sel(pn);
            self.program.fail(sel, code);
        }
        FAILURE
    }

    fn ty(&self, pn: ParseNode) -> Type {
        self.parse_tree.ty(pn)
    }

    fn dims_disagree(a: usize, b: usize) -> bool {
        a != UNKNOWN_SIZE && b != UNKNOWN_SIZE && a != b
    }

    fn unify_dim(&mut self, pn: ParseNode, a: usize, b: usize) -> usize {
        if Self::dims_disagree(a, b) {
            self.error_code(pn, pn, ErrorCode::DimensionMismatch);
        }
        if a == UNKNOWN_SIZE {
            b
        } else {
            a
        }
    }

    // Function sets ---------------------------------------------------------

    fn declare(&mut self, sig: DeclareSignature) -> usize {
        if let Some(&index) = self.declared_func_map.get(&sig) {
            return index;
        }
        let index = self.declared_funcs.len();
        self.declared_funcs.push(sig.clone());
        self.declared_func_map.insert(sig, index);
        index
    }

    fn make_function_set(&mut self, decl: usize) -> Type {
        let members = vec![decl];
        if let Some(&t) = self.memoized_sets.get(&members) {
            return t;
        }
        let t = self.pool.len();
        self.pool.push(1);
        self.pool.push(decl);
        self.memoized_sets.insert(members, t);
        t
    }

    fn set_len(&self, t: Type) -> usize {
        self.pool[t]
    }

    fn set_member(&self, t: Type, i: usize) -> usize {
        self.pool[t + 1 + i]
    }

    fn function_set_union(&mut self, a: Type, b: Type) -> Type {
        if a == b {
            return a;
        }
        let mut members = Vec::new();
        let (mut i, mut j) = (0, 0);
        let (n, m) = (self.set_len(a), self.set_len(b));
        while i < n && j < m {
            let fa = self.set_member(a, i);
            let fb = self.set_member(b, j);
            if fa <= fb {
                members.push(fa);
                i += 1;
                if fa == fb {
                    j += 1;
                }
            } else {
                members.push(fb);
                j += 1;
            }
        }
        while i < n {
            members.push(self.set_member(a, i));
            i += 1;
        }
        while j < m {
            members.push(self.set_member(b, j));
            j += 1;
        }

        if let Some(&t) = self.memoized_sets.get(&members) {
            return t;
        }
        let t = self.pool.len();
        self.pool.push(members.len());
        self.pool.extend_from_slice(&members);
        self.memoized_sets.insert(members, t);
        t
    }

    fn func_from_decl_sig(&self, sig: &DeclareSignature) -> ParseNode {
        sig[0]
    }

    fn func_from_call_sig(&self, sig: &CallSignature) -> ParseNode {
        self.func_from_decl_sig(&self.declared_funcs[sig[0]])
    }

    // Statements ------------------------------------------------------------

    fn resolve_stmt(&mut self, pn: ParseNode) -> ParseNode {
        if !self.program.no_errors() {
            return pn;
        }

        match self.parse_tree.op(pn) {
            Op::SettingsUpdate => {
                // Settings were enacted lexically; nothing remains to run
                self.parse_tree.set_op(pn, Op::DoNothing);
                pn
            }
            Op::DoNothing | Op::Break | Op::Continue | Op::Class | Op::Enum | Op::FileRef => pn,

            Op::Assign | Op::Equal => {
                let rhs = self.resolve_expr_top(self.parse_tree.rhs(pn), 0, 0);
                self.parse_tree.set_arg(pn, 1, rhs);
                let lhs = self.parse_tree.lhs(pn);
                let sym_id = self.parse_tree.sym(lhs);
                if sym_id != NONE {
                    let sym = &mut self.symbol_table.symbols[sym_id];
                    sym.ty = self.parse_tree.ty(rhs);
                    sym.rows = self.parse_tree.rows(rhs);
                    sym.cols = self.parse_tree.cols(rhs);
                }
                pn
            }

            Op::Reassign => self.resolve_reassign(pn),
            Op::ElementwiseAssignment => self.resolve_elementwise(pn),

            Op::Return => {
                let child = self.resolve_expr_top(self.parse_tree.child(pn), 0, 0);
                self.parse_tree.set_arg(pn, 0, child);
                let child_type = self.ty(child);
                let child_rows = self.parse_tree.rows(child);
                let child_cols = self.parse_tree.cols(child);

                let expected = self.return_types.last().map(|rt| rt.ty).unwrap_or(VOID_TYPE);
                if expected == UNINITIALISED || expected == RECURSIVE_CYCLE {
                    if let Some(rt) = self.return_types.last_mut() {
                        rt.ty = child_type;
                        rt.rows = child_rows;
                        rt.cols = child_cols;
                    }
                } else if is_function_set(expected) {
                    if !is_function_set(child_type) {
                        self.error(pn, child);
                    } else {
                        let unioned = self.function_set_union(expected, child_type);
                        if let Some(rt) = self.return_types.last_mut() {
                            rt.ty = unioned;
                        }
                    }
                } else if child_type != expected {
                    self.error(pn, pn);
                } else {
                    let expected_rows = self
                        .return_types
                        .last()
                        .map(|rt| rt.rows)
                        .unwrap_or(UNKNOWN_SIZE);
                    if Self::dims_disagree(expected_rows, child_rows) {
                        return self.error_code(pn, child, ErrorCode::DimensionMismatch);
                    }
                    if let Some(rt) = self.return_types.last_mut() {
                        if rt.rows == UNKNOWN_SIZE {
                            rt.rows = child_rows;
                        }
                        if rt.cols == UNKNOWN_SIZE {
                            rt.cols = child_cols;
                        }
                    }
                }
                pn
            }

            Op::ReturnEmpty => {
                match self.return_types.last().map(|rt| rt.ty) {
                    Some(UNINITIALISED) => self.return_types.last_mut().unwrap().ty = VOID_TYPE,
                    Some(VOID_TYPE) | None => {}
                    Some(_) => {
                        self.error(pn, pn);
                    }
                }
                pn
            }

            Op::If | Op::While => {
                let cond = self.resolve_expr_top(self.parse_tree.arg(pn, 0), 0, 0);
                self.parse_tree.set_arg(pn, 0, cond);
                if self.ty(cond) != BOOLEAN {
                    return self.error_code(pn, cond, ErrorCode::ExpectBoolean);
                }
                let body = self.resolve_stmt(self.parse_tree.arg(pn, 1));
                self.parse_tree.set_arg(pn, 1, body);
                pn
            }

            Op::IfElse => {
                let cond = self.resolve_expr_top(self.parse_tree.arg(pn, 0), 0, 0);
                self.parse_tree.set_arg(pn, 0, cond);
                if self.ty(cond) != BOOLEAN {
                    return self.error_code(pn, cond, ErrorCode::ExpectBoolean);
                }
                let body = self.resolve_stmt(self.parse_tree.arg(pn, 1));
                self.parse_tree.set_arg(pn, 1, body);
                let else_body = self.resolve_stmt(self.parse_tree.arg(pn, 2));
                self.parse_tree.set_arg(pn, 2, else_body);
                pn
            }

            Op::For => {
                let init = self.resolve_stmt(self.parse_tree.arg(pn, 0));
                self.parse_tree.set_arg(pn, 0, init);
                let cond = self.resolve_expr_top(self.parse_tree.arg(pn, 1), 0, 0);
                self.parse_tree.set_arg(pn, 1, cond);
                if self.ty(cond) != BOOLEAN {
                    return self.error_code(pn, cond, ErrorCode::ExpectBoolean);
                }
                let update = self.resolve_stmt(self.parse_tree.arg(pn, 2));
                self.parse_tree.set_arg(pn, 2, update);
                let body = self.resolve_stmt(self.parse_tree.arg(pn, 3));
                self.parse_tree.set_arg(pn, 3, body);
                pn
            }

            Op::RangedFor => {
                let iterable = self.resolve_expr_top(self.parse_tree.arg(pn, 1), 0, 0);
                self.parse_tree.set_arg(pn, 1, iterable);
                if self.ty(iterable) != NUMERIC {
                    return self.error(pn, iterable);
                }
                let var = self.parse_tree.arg(pn, 0);
                let sym_id = self.parse_tree.sym(var);
                if sym_id != NONE {
                    let sym = &mut self.symbol_table.symbols[sym_id];
                    sym.ty = NUMERIC;
                    sym.rows = 1;
                    sym.cols = 1;
                }
                let body = self.resolve_stmt(self.parse_tree.arg(pn, 2));
                self.parse_tree.set_arg(pn, 2, body);
                pn
            }

            Op::ExprStmt => {
                let expr = self.resolve_expr_top(self.parse_tree.child(pn), 0, 0);
                self.parse_tree.set_arg(pn, 0, expr);
                let head_is_call = self.parse_tree.op(expr) == Op::Call
                    && is_function_set(self.ty(self.parse_tree.arg(expr, 0)));
                if !head_is_call {
                    let level = self.program.settings.level(SettingId::UnusedExpression);
                    let sel = self.parse_tree.sel(expr);
                    self.program.warn(level, sel, ErrorCode::UnusedExpression);
                    self.parse_tree.set_op(pn, Op::DoNothing);
                }
                pn
            }

            Op::Algorithm => self.resolve_alg(pn),
            Op::PrototypeAlg => pn,

            Op::Block => self.resolve_block(pn),
            Op::LexicalScope => {
                self.parse_tree.set_op(pn, Op::Block);
                self.resolve_block(pn)
            }
            Op::Namespace => {
                let name = self.parse_tree.arg(pn, 0);
                let sym_id = self.parse_tree.sym(name);
                if sym_id != NONE {
                    self.symbol_table.symbols[sym_id].ty = NAMESPACE_TYPE;
                }
                let body = self.resolve_block(self.parse_tree.arg(pn, 1));
                self.parse_tree.set_arg(pn, 1, body);
                pn
            }

            Op::Print => {
                for i in 0..self.parse_tree.num_args(pn) {
                    let expr = self.resolve_expr_top(self.parse_tree.arg(pn, i), 0, 0);
                    self.parse_tree.set_arg(pn, i, expr);
                }
                pn
            }

            Op::Assert => {
                let child = self.resolve_expr_top(self.parse_tree.child(pn), 0, 0);
                self.parse_tree.set_arg(pn, 0, child);
                if self.ty(child) != BOOLEAN {
                    return self.error_code(pn, child, ErrorCode::ExpectBoolean);
                }
                if self.parse_tree.op(child) == Op::True {
                    self.parse_tree.set_op(pn, Op::DoNothing);
                }
                pn
            }

            Op::Plot => {
                let expected = [STRING, STRING, NUMERIC, STRING, NUMERIC];
                for (i, &want) in expected.iter().enumerate() {
                    let arg = self.resolve_expr_top(self.parse_tree.arg(pn, i), 0, 0);
                    self.parse_tree.set_arg(pn, i, arg);
                    if self.ty(arg) != want {
                        return self.error(pn, arg);
                    }
                }
                pn
            }

            Op::Import => self.resolve_import(pn),
            Op::FromImport => self.resolve_from_import(pn),
            Op::Switch => self.resolve_switch(pn),
            Op::UnknownList => {
                for i in 0..self.parse_tree.num_args(pn) {
                    let id = self.parse_tree.arg(pn, i);
                    let sym_id = self.parse_tree.sym(id);
                    if sym_id != NONE {
                        let sym = &mut self.symbol_table.symbols[sym_id];
                        sym.ty = NUMERIC;
                        sym.rows = 1;
                        sym.cols = 1;
                    }
                }
                pn
            }

            _ => self.error_code(pn, pn, ErrorCode::UnrecognizedStmt),
        }
    }

    fn resolve_reassign(&mut self, pn: ParseNode) -> ParseNode {
        let lhs = self.resolve_lvalue(self.parse_tree.lhs(pn), true);
        if !self.program.no_errors() {
            return lhs;
        }
        self.parse_tree.set_arg(pn, 0, lhs);

        if self.parse_tree.op(lhs) == Op::SubscriptAccess {
            let rhs = self.resolve_expr_top(self.parse_tree.rhs(pn), 0, 0);
            self.parse_tree.set_arg(pn, 1, rhs);
            for i in 0..self.parse_tree.num_args(lhs) {
                let arg = self.resolve_expr(self.parse_tree.arg(lhs, i), 0, 0);
                self.parse_tree.set_arg(lhs, i, arg);
                if self.ty(arg) != NUMERIC {
                    return self.error(pn, arg);
                }
            }
            if self.ty(rhs) != NUMERIC {
                return self.error(pn, rhs);
            }
            pn
        } else {
            let sym_id = self.parse_tree.sym(lhs);
            if sym_id == NONE {
                return pn;
            }
            let (sym_ty, sym_rows, sym_cols) = {
                let sym = &self.symbol_table.symbols[sym_id];
                (sym.ty, sym.rows, sym.cols)
            };
            let rhs = self.resolve_expr_top(self.parse_tree.rhs(pn), sym_rows, sym_cols);
            self.parse_tree.set_arg(pn, 1, rhs);

            if is_function_set(sym_ty) {
                let t = self.ty(rhs);
                if !is_function_set(t) {
                    return self.error(pn, rhs);
                }
                let unioned = self.function_set_union(sym_ty, t);
                self.symbol_table.symbols[sym_id].ty = unioned;
                pn
            } else if self.ty(rhs) != sym_ty {
                self.error(pn, rhs)
            } else {
                pn
            }
        }
    }

    fn resolve_elementwise(&mut self, pn: ParseNode) -> ParseNode {
        let lhs = self.parse_tree.lhs(pn);
        let var = self.resolve_expr_top(self.parse_tree.arg(lhs, 0), 0, 0);
        self.parse_tree.set_arg(lhs, 0, var);
        if self.ty(var) != NUMERIC {
            return self.error(pn, var);
        }

        for i in 1..self.parse_tree.num_args(lhs) {
            let sub = self.parse_tree.arg(lhs, i);
            if self.parse_tree.op(sub) == Op::Identifier {
                let sym_id = self.parse_tree.sym(sub);
                if sym_id != NONE {
                    let sym = &mut self.symbol_table.symbols[sym_id];
                    sym.ty = NUMERIC;
                    sym.rows = 1;
                    sym.cols = 1;
                }
                self.parse_tree.set_ty(sub, NUMERIC);
                self.parse_tree.set_scalar(sub);
            } else {
                let sub = self.resolve_expr_top(sub, 0, 0);
                self.parse_tree.set_arg(lhs, i, sub);
                if self.ty(sub) != NUMERIC {
                    return self.error(pn, sub);
                }
            }
        }

        let rhs = self.resolve_expr_top(self.parse_tree.rhs(pn), 0, 0);
        self.parse_tree.set_arg(pn, 1, rhs);
        if self.ty(rhs) != NUMERIC {
            return self.error(pn, rhs);
        }
        pn
    }

    fn resolve_block(&mut self, pn: ParseNode) -> ParseNode {
        for i in 0..self.parse_tree.num_args(pn) {
            let stmt = self.resolve_stmt(self.parse_tree.arg(pn, i));
            self.parse_tree.set_arg(pn, i, stmt);
        }
        pn
    }

    fn resolve_lvalue(&mut self, pn: ParseNode, write: bool) -> ParseNode {
        match self.parse_tree.op(pn) {
            Op::ScopeAccess => self.resolve_scope_access(pn, write),
            Op::SubscriptAccess | Op::Identifier => pn,
            _ => pn,
        }
    }

    /// Declares the function's signature; the body is resolved per
    /// instantiation.
    fn resolve_alg(&mut self, pn: ParseNode) -> ParseNode {
        let params = self.parse_tree.param_list(pn);
        for i in 0..self.parse_tree.num_args(params) {
            let param = self.parse_tree.arg(params, i);
            if self.parse_tree.op(param) == Op::Equal {
                let resolved = self.resolve_stmt(param);
                self.parse_tree.set_arg(params, i, resolved);
            }
        }

        let mut sig: DeclareSignature = vec![pn];

        let cap_list = self.parse_tree.val_cap_list(pn);
        let cap_list_size = self.parse_tree.val_list_size(cap_list);
        for i in 0..cap_list_size {
            let cap = self.parse_tree.arg(cap_list, i);
            let inner_sym = self.parse_tree.sym(cap);
            if inner_sym == NONE {
                continue;
            }
            let outer = self.symbol_table.symbols[inner_sym].shadowed_index;
            if outer == NONE {
                continue;
            }
            let outer_sym = &self.symbol_table.symbols[outer];
            let t = outer_sym.ty;
            sig.push(t);
            if t == NUMERIC {
                sig.push(outer_sym.rows);
                sig.push(outer_sym.cols);
            }
        }

        let ref_list = self.parse_tree.ref_cap_list(pn);
        if ref_list != NONE {
            for i in 0..self.parse_tree.num_args(ref_list) {
                let reference = self.parse_tree.arg(ref_list, i);
                if self.parse_tree.op(reference) != Op::ReadUpvalue {
                    continue;
                }
                let sym_id = self.parse_tree.sym(reference);
                if sym_id == NONE {
                    continue;
                }
                let sym = &self.symbol_table.symbols[sym_id];
                let t = sym.ty;
                sig.push(t);
                if t == NUMERIC {
                    sig.push(sym.rows);
                    sig.push(sym.cols);
                }
            }
        }

        let decl = self.declare(sig);
        let t = self.make_function_set(decl);

        let name = self.parse_tree.alg_name(pn);
        let sym_id = self.parse_tree.sym(name);
        if sym_id != NONE {
            self.symbol_table.symbols[sym_id].ty = t;
        }
        self.parse_tree.set_ty(pn, t);
        pn
    }

    fn resolve_lambda(&mut self, pn: ParseNode) -> ParseNode {
        let mut sig: DeclareSignature = vec![pn];
        let ref_list = self.parse_tree.ref_cap_list(pn);
        if ref_list != NONE {
            for i in 0..self.parse_tree.num_args(ref_list) {
                let reference = self.parse_tree.arg(ref_list, i);
                if self.parse_tree.op(reference) != Op::ReadUpvalue {
                    continue;
                }
                let sym_id = self.parse_tree.sym(reference);
                if sym_id == NONE {
                    continue;
                }
                let sym = &self.symbol_table.symbols[sym_id];
                let t = sym.ty;
                sig.push(t);
                if t == NUMERIC {
                    sig.push(sym.rows);
                    sig.push(sym.cols);
                }
            }
        }
        let decl = self.declare(sig);
        let t = self.make_function_set(decl);
        self.parse_tree.set_ty(pn, t);
        pn
    }

    // Switch lowering -------------------------------------------------------

    fn resolve_switch(&mut self, pn: ParseNode) -> ParseNode {
        let key = self.resolve_expr_top(self.parse_tree.arg(pn, 0), 0, 0);
        self.parse_tree.set_arg(pn, 0, key);

        match self.ty(key) {
            NUMERIC => self.resolve_switch_numeric(pn),
            STRING => self.resolve_switch_string(pn),
            _ => self.error_code(pn, key, ErrorCode::UnsupportedSwitchType),
        }
    }

    /// Case codepaths are back-filled so fallthrough shares the later case's
    /// path; keys map O(1) to codepaths.
    fn resolve_switch_numeric(&mut self, pn: ParseNode) -> ParseNode {
        self.parse_tree.set_flag(pn, NONE);

        let mut last_codepath = NONE;
        for i in (1..self.parse_tree.num_args(pn)).rev() {
            let case_node = self.parse_tree.arg(pn, i);
            let codepath = self.parse_tree.rhs(case_node);
            if codepath != NONE {
                last_codepath = self.resolve_stmt(codepath);
            }
            self.parse_tree.set_arg(case_node, 1, last_codepath);
        }

        for i in 1..self.parse_tree.num_args(pn) {
            let case_node = self.parse_tree.arg(pn, i);
            let codepath = self.parse_tree.rhs(case_node);

            if self.parse_tree.op(case_node) == Op::Case {
                let case_key = self.resolve_expr(self.parse_tree.lhs(case_node), 0, 0);
                if self.ty(case_key) != NUMERIC {
                    return self.error(pn, case_key);
                }
                let val = self.parse_tree.double(case_key);
                let previous = self.number_switch.insert((pn, numeric_key(val)), codepath);
                if previous.is_some() && self.first_attempt {
                    return self.error_code(pn, case_key, ErrorCode::RedundantCase);
                }
            } else {
                if self.parse_tree.flag(pn) != NONE {
                    let label = self.parse_tree.lhs(case_node);
                    return self.error_code(pn, label, ErrorCode::RedundantCase);
                }
                self.parse_tree.set_flag(pn, case_node);
            }
        }

        self.parse_tree.set_op(pn, Op::SwitchNumeric);
        pn
    }

    fn resolve_switch_string(&mut self, pn: ParseNode) -> ParseNode {
        self.parse_tree.set_flag(pn, NONE);

        let mut last_codepath = NONE;
        for i in (1..self.parse_tree.num_args(pn)).rev() {
            let case_node = self.parse_tree.arg(pn, i);
            let codepath = self.parse_tree.rhs(case_node);
            if codepath != NONE {
                last_codepath = self.resolve_stmt(codepath);
            }
            self.parse_tree.set_arg(case_node, 1, last_codepath);
        }

        for i in 1..self.parse_tree.num_args(pn) {
            let case_node = self.parse_tree.arg(pn, i);
            let codepath = self.parse_tree.rhs(case_node);

            if self.parse_tree.op(case_node) == Op::Case {
                let case_key = self.resolve_expr(self.parse_tree.lhs(case_node), 0, 0);
                if self.ty(case_key) != STRING {
                    return self.error(pn, case_key);
                }
                if self.parse_tree.op(case_key) != Op::StringLiteral {
                    return self.error(pn, case_key);
                }
                let val = self.parse_tree.string(self.parse_tree.flag(case_key)).to_string();
                let previous = self.string_switch.insert((pn, val), codepath);
                if previous.is_some() && self.first_attempt {
                    return self.error_code(pn, case_key, ErrorCode::RedundantCase);
                }
            } else {
                if self.parse_tree.flag(pn) != NONE {
                    let label = self.parse_tree.lhs(case_node);
                    return self.error_code(pn, label, ErrorCode::RedundantCase);
                }
                self.parse_tree.set_flag(pn, case_node);
            }
        }

        self.parse_tree.set_op(pn, Op::SwitchString);
        pn
    }

    // Imports ---------------------------------------------------------------

    /// Compile an imported model (scanner, parser, lexical) and splice its
    /// tree and symbol table into the active ones. Returns the appended
    /// root, or NONE on failure or if already imported.
    fn splice_module(&mut self, pn: ParseNode, file: ParseNode) -> Option<ParseNode> {
        let module: ModelId = self.parse_tree.double(file) as usize;

        if self.program.model(module).is_imported {
            self.parse_tree.set_flag(pn, NONE);
            return Some(NONE);
        }
        self.program.model_mut(module).is_imported = true;

        let tokens = Scanner::new(self.program, module).scan_all();
        let mut sub_parser = Parser::new(self.program, module, tokens);
        sub_parser.parse_all();
        let mut sub_tree = std::mem::take(&mut sub_parser.parse_tree);
        drop(sub_parser);
        let sub_table = LexicalPass::new(self.program, &mut sub_tree, module).resolve_symbols();

        if !self.program.no_errors() {
            self.parse_tree.set_flag(pn, NONE);
            self.error_code(pn, file, ErrorCode::FileCorrupted);
            return None;
        }

        let node_offset = self.parse_tree.append(&sub_tree);
        let sym_offset = self.symbol_table.symbols.len();
        let seg_offset = self.symbol_table.scope_segments.len();
        let usage_offset = self.symbol_table.usages.len();

        let shift = |x: usize, offset: usize| if x == NONE { NONE } else { x + offset };

        // Node-side fixups for the appended range
        for node in node_offset..self.parse_tree.len() {
            let sym = self.parse_tree.sym(node);
            if sym != NONE {
                self.parse_tree.set_sym(node, sym + sym_offset);
            }
            match self.parse_tree.op(node) {
                Op::ScopeAccess => {
                    let rhs = self.parse_tree.rhs(node);
                    let stub = self.parse_tree.flag(rhs);
                    if stub != NONE {
                        self.parse_tree.set_flag(rhs, stub + usage_offset);
                    }
                }
                Op::Algorithm => {
                    // Value-capture lists record their scope-segment index
                    let val_cap = self.parse_tree.val_cap_list(node);
                    if val_cap != NONE {
                        let seg = self.parse_tree.flag(val_cap);
                        if seg != NONE {
                            self.parse_tree.set_flag(val_cap, seg + seg_offset);
                        }
                    }
                }
                _ => {}
            }
        }

        for mut sym in sub_table.symbols.iter().cloned() {
            sym.flag = shift(sym.flag, node_offset);
            sym.comment = shift(sym.comment, node_offset);
            sym.shadowed_index = shift(sym.shadowed_index, sym_offset);
            sym.last_usage_index = shift(sym.last_usage_index, usage_offset);
            sym.previous_namespace_index = shift(sym.previous_namespace_index, seg_offset);
            self.symbol_table.symbols.push(sym);
        }
        for mut seg in sub_table.scope_segments.iter().cloned() {
            seg.fn_node = shift(seg.fn_node, node_offset);
            seg.parent_lexical_segment = shift(seg.parent_lexical_segment, seg_offset);
            seg.prev_lexical_segment = shift(seg.prev_lexical_segment, seg_offset);
            seg.prev_namespace_segment = shift(seg.prev_namespace_segment, seg_offset);
            seg.first_sym_index += sym_offset;
            seg.usage_begin += usage_offset;
            seg.usage_end = shift(seg.usage_end, usage_offset);
            self.symbol_table.scope_segments.push(seg);
        }
        for mut usage in sub_table.usages.iter().cloned() {
            usage.prev_usage_index = shift(usage.prev_usage_index, usage_offset);
            usage.symbol_index = shift(usage.symbol_index, sym_offset);
            usage.pn += node_offset;
            self.symbol_table.usages.push(usage);
        }
        for (&(scope_sym, name), &member) in sub_table.scoped_vars.iter() {
            self.symbol_table
                .scoped_vars
                .insert((scope_sym + sym_offset, name), member + sym_offset);
        }

        // Record module-level exports
        let mut exports = HashMap::new();
        for (i, sym) in sub_table.symbols.iter().enumerate() {
            if sym.declaration_lexical_depth == 0 {
                exports.insert(sym.name, i + sym_offset);
            }
        }
        self.symbol_table.module_exports.insert(module, exports);

        // Resolve the spliced body with the active model swapped
        let spliced_root = node_offset + sub_tree.root;
        let outer_model = self.active_model;
        self.active_model = module;
        let resolved = self.resolve_stmt(spliced_root);
        self.active_model = outer_model;
        self.parse_tree.set_flag(pn, resolved);

        Some(resolved)
    }

    fn resolve_import(&mut self, pn: ParseNode) -> ParseNode {
        let file = self.parse_tree.child(pn);
        let module: ModelId = self.parse_tree.double(file) as usize;

        let var = self.parse_tree.flag(pn);
        let sym_id = self.parse_tree.sym(var);
        if sym_id != NONE {
            let sym = &mut self.symbol_table.symbols[sym_id];
            sym.ty = MODULE_TYPE;
            sym.flag = module;
        }

        // The flag is repurposed from the bound identifier to the spliced
        // body the interpreter executes once
        if self.splice_module(pn, file).is_none() {
            return pn;
        }
        pn
    }

    fn resolve_from_import(&mut self, pn: ParseNode) -> ParseNode {
        let file = self.parse_tree.arg(pn, 0);
        let module: ModelId = self.parse_tree.double(file) as usize;

        if self.splice_module(pn, file).is_none() {
            return pn;
        }

        let mut i = 1;
        while i < self.parse_tree.num_args(pn) {
            let component = self.parse_tree.arg(pn, i);
            let alias = self.parse_tree.arg(pn, i + 1);
            let declared = if alias == NONE { component } else { alias };

            let target_name = self.parse_tree.name(component);
            let export = self
                .symbol_table
                .module_exports
                .get(&module)
                .and_then(|exports| exports.get(&target_name))
                .copied();

            let Some(mut target) = export else {
                self.parse_tree.set_op(component, Op::Error);
                return self.error_code(pn, component, ErrorCode::ModuleFieldNotFound);
            };
            while self.symbol_table.symbols[target].ty == ALIAS {
                target = self.symbol_table.symbols[target].shadowed_index;
            }

            // Record the import as a usage on the imported identifier
            self.symbol_table.symbols[target].is_used = true;
            let sel = self.parse_tree.sel(component);
            let stub = self.symbol_table.add_usage_stub(component, sel);
            self.symbol_table
                .resolve_scope_reference(self.parse_tree, stub, target);

            let local_sym = self.parse_tree.sym(declared);
            if local_sym != NONE {
                let sym = &mut self.symbol_table.symbols[local_sym];
                sym.ty = ALIAS;
                sym.shadowed_index = target;
            }
            i += 2;
        }
        pn
    }

    fn resolve_scope_access(&mut self, pn: ParseNode, write: bool) -> ParseNode {
        let lhs = self.parse_tree.lhs(pn);
        let lhs = match self.parse_tree.op(lhs) {
            Op::ScopeAccess => self.resolve_scope_access(lhs, false),
            _ => lhs,
        };
        if !self.program.no_errors() {
            return self.error(pn, pn);
        }
        let field = self.parse_tree.arg(pn, 1);

        let mut lhs_sym = self.parse_tree.sym(lhs);
        if lhs_sym == NONE {
            return self.error(pn, lhs);
        }
        while self.symbol_table.symbols[lhs_sym].ty == ALIAS {
            lhs_sym = self.symbol_table.symbols[lhs_sym].shadowed_index;
        }

        let field_name = self.parse_tree.name(field);
        let lhs_ty = self.symbol_table.symbols[lhs_sym].ty;

        let target = if lhs_ty == MODULE_TYPE {
            let module = self.symbol_table.symbols[lhs_sym].flag;
            match self
                .symbol_table
                .module_exports
                .get(&module)
                .and_then(|exports| exports.get(&field_name))
            {
                Some(&t) => t,
                None => return self.error_code(pn, field, ErrorCode::ModuleFieldNotFound),
            }
        } else if lhs_ty == NAMESPACE_TYPE {
            match self
                .symbol_table
                .scoped_vars
                .get(&(lhs_sym, field_name))
            {
                Some(&t) => t,
                None => return self.error_code(pn, field, ErrorCode::BadRead),
            }
        } else {
            return self.error_code(pn, lhs, ErrorCode::TypeError);
        };

        let mut target = target;
        while self.symbol_table.symbols[target].ty == ALIAS {
            target = self.symbol_table.symbols[target].shadowed_index;
        }

        // Patch the stub usage inserted by the lexical pass
        let stub = self.parse_tree.flag(field);
        self.parse_tree.set_op(field, Op::Identifier);
        if stub != NONE {
            self.symbol_table
                .resolve_scope_reference(self.parse_tree, stub, target);
        }
        self.parse_tree.set_sym(field, target);

        {
            let sym = &mut self.symbol_table.symbols[target];
            if write {
                if sym.is_const {
                    return self.error_code(pn, field, ErrorCode::ReassignConstant);
                }
                sym.is_reassigned = true;
            } else {
                sym.is_used = true;
            }
        }

        let sym = &self.symbol_table.symbols[target];
        self.parse_tree.set_ty(field, sym.ty);
        self.parse_tree.set_rows(field, sym.rows);
        self.parse_tree.set_cols(field, sym.cols);
        field
    }

    // Calls and instantiation -----------------------------------------------

    fn fill_defaults_and_instantiate(&mut self, call_node: ParseNode, mut sig: CallSignature) -> Type {
        let decl = &self.declared_funcs[sig[0]];
        let fn_node = decl[0];

        let params = self.parse_tree.param_list(fn_node);
        let n_params = self.parse_tree.num_args(params);
        let mut n_args = 0;
        let mut i = 1;
        while i < sig.len() {
            n_args += 1;
            i += if sig[i] == NUMERIC { 3 } else { 1 };
        }

        if n_args > n_params {
            return self.error_type(call_node, ErrorCode::TooManyArgs);
        }

        for i in n_args..n_params {
            let param = self.parse_tree.arg(params, i);
            if self.parse_tree.op(param) != Op::Equal {
                return self.error_type(call_node, ErrorCode::TooFewArgs);
            }
            let default_var = self.parse_tree.lhs(param);
            let sym_id = self.parse_tree.sym(default_var);
            if sym_id == NONE {
                return self.error_type(call_node, ErrorCode::TooFewArgs);
            }
            let sym = &self.symbol_table.symbols[sym_id];
            let t = sym.ty;
            sig.push(t);
            if t == NUMERIC {
                sig.push(sym.rows);
                sig.push(sym.cols);
            }
        }

        self.instantiate(call_node, sig)
    }

    fn instantiate(&mut self, call_node: ParseNode, sig: CallSignature) -> Type {
        self.all_calls.push((call_node, sig.clone()));

        let decl = self.declared_funcs[sig[0]].clone();
        let abstract_fn = decl[0];

        if let Some(result) = self.called_func_map.get(&sig).copied() {
            self.retry_at_recursion |= result.ty == RECURSIVE_CYCLE && self.first_attempt;

            if self.parse_tree.rows(call_node) == UNKNOWN_SIZE {
                self.parse_tree.set_rows(call_node, result.rows);
            } else if result.rows != UNKNOWN_SIZE
                && result.rows != self.parse_tree.rows(call_node)
            {
                self.error_type(call_node, ErrorCode::DimensionMismatch);
            }
            if self.parse_tree.cols(call_node) == UNKNOWN_SIZE {
                self.parse_tree.set_cols(call_node, result.cols);
            } else if result.cols != UNKNOWN_SIZE
                && result.cols != self.parse_tree.cols(call_node)
            {
                self.error_type(call_node, ErrorCode::DimensionMismatch);
            }
            return result.ty;
        }

        let is_recursion_root = self.recursion_fallback.is_none();
        if is_recursion_root {
            self.recursion_fallback = Some(sig.clone());
        }

        self.called_func_map.insert(
            sig.clone(),
            CallResult {
                ty: RECURSIVE_CYCLE,
                rows: UNKNOWN_SIZE,
                cols: UNKNOWN_SIZE,
                instantiated: NONE,
            },
        );

        let instantiated_fn = self.parse_tree.clone_subtree(abstract_fn);

        let val_list = self.parse_tree.val_cap_list(instantiated_fn);
        let ref_list = self.parse_tree.ref_cap_list(instantiated_fn);
        let params = self.parse_tree.param_list(instantiated_fn);
        let n_vals = self.parse_tree.val_list_size(val_list);

        // Overwrite captured and parameter symbol types, saving the old
        let mut saved: Vec<(usize, CachedInfo)> = Vec::new();
        let save_and_set =
            |table: &mut SymbolTable, saved: &mut Vec<(usize, CachedInfo)>, sym_id: usize, ty, rows, cols| {
                let sym = &mut table.symbols[sym_id];
                saved.push((
                    sym_id,
                    CachedInfo {
                        ty: sym.ty,
                        rows: sym.rows,
                        cols: sym.cols,
                    },
                ));
                sym.ty = ty;
                sym.rows = rows;
                sym.cols = cols;
            };

        let mut type_index = 1;
        let next_from = |sig_vec: &Vec<usize>, idx: &mut usize| -> (Type, usize, usize) {
            let t = sig_vec[*idx];
            *idx += 1;
            if t == NUMERIC {
                let r = sig_vec[*idx];
                let c = sig_vec[*idx + 1];
                *idx += 2;
                (t, r, c)
            } else {
                (t, UNKNOWN_SIZE, UNKNOWN_SIZE)
            }
        };

        if val_list != NONE {
            let scope_index = self.parse_tree.flag(val_list);
            let first = self.symbol_table.scope_segments[scope_index].first_sym_index;
            for i in 0..n_vals {
                let (t, r, c) = next_from(&decl, &mut type_index);
                save_and_set(self.symbol_table, &mut saved, first + i, t, r, c);
            }
        }
        if ref_list != NONE {
            for i in 0..self.parse_tree.num_args(ref_list) {
                let reference = self.parse_tree.arg(ref_list, i);
                if self.parse_tree.op(reference) != Op::ReadUpvalue {
                    continue;
                }
                let sym_id = self.parse_tree.sym(reference);
                if sym_id == NONE {
                    continue;
                }
                let (t, r, c) = next_from(&decl, &mut type_index);
                save_and_set(self.symbol_table, &mut saved, sym_id, t, r, c);
            }
        }

        let mut arg_index = 1;
        for i in 0..self.parse_tree.num_args(params) {
            let mut param = self.parse_tree.arg(params, i);
            if self.parse_tree.op(param) == Op::Equal {
                param = self.parse_tree.lhs(param);
            }
            let sym_id = self.parse_tree.sym(param);
            let (t, r, c) = next_from(&sig, &mut arg_index);
            self.parse_tree.set_ty(param, t);
            if sym_id != NONE {
                save_and_set(self.symbol_table, &mut saved, sym_id, t, r, c);
            }
        }

        let is_alg = self.parse_tree.op(instantiated_fn) != Op::Lambda;
        let (mut return_type, mut rows, mut cols) = self.resolve_function_body(instantiated_fn, is_alg);

        self.called_func_map.insert(
            sig.clone(),
            CallResult {
                ty: return_type,
                rows,
                cols,
                instantiated: instantiated_fn,
            },
        );

        if is_recursion_root && self.recursion_fallback.as_ref() == Some(&sig) {
            if self.retry_at_recursion {
                self.retry_at_recursion = false;
                self.first_attempt = false;

                let (rt, r, c) = self.resolve_function_body(instantiated_fn, is_alg);
                return_type = rt;
                rows = r;
                cols = c;

                self.first_attempt = true;
                self.called_func_map.insert(
                    sig.clone(),
                    CallResult {
                        ty: return_type,
                        rows,
                        cols,
                        instantiated: instantiated_fn,
                    },
                );
            }
            self.recursion_fallback = None;
        } else if self.first_attempt && return_type == RECURSIVE_CYCLE {
            // Didn't work; be sure to try this instantiation again
            self.called_func_map.remove(&sig);
        }

        for (sym_id, info) in saved.into_iter().rev() {
            let sym = &mut self.symbol_table.symbols[sym_id];
            sym.ty = info.ty;
            sym.rows = info.rows;
            sym.cols = info.cols;
        }

        if self.parse_tree.rows(call_node) == UNKNOWN_SIZE {
            self.parse_tree.set_rows(call_node, rows);
        } else if rows != UNKNOWN_SIZE && rows != self.parse_tree.rows(call_node) {
            self.error_type(call_node, ErrorCode::DimensionMismatch);
        }
        if self.parse_tree.cols(call_node) == UNKNOWN_SIZE {
            self.parse_tree.set_cols(call_node, cols);
        } else if cols != UNKNOWN_SIZE && cols != self.parse_tree.cols(call_node) {
            self.error_type(call_node, ErrorCode::DimensionMismatch);
        }

        return_type
    }

    fn resolve_function_body(&mut self, instantiated_fn: ParseNode, is_alg: bool) -> (Type, usize, usize) {
        if is_alg {
            self.return_types.push(ReturnType {
                ty: UNINITIALISED,
                rows: UNKNOWN_SIZE,
                cols: UNKNOWN_SIZE,
            });
            let body = self.resolve_stmt(self.parse_tree.body(instantiated_fn));
            self.parse_tree.set_body(instantiated_fn, body);
            let rt = self.return_types.pop().unwrap();
            let ty = if rt.ty == UNINITIALISED { VOID_TYPE } else { rt.ty };
            (ty, rt.rows, rt.cols)
        } else {
            let body = self.resolve_expr(self.parse_tree.body(instantiated_fn), 0, 0);
            self.parse_tree.set_body(instantiated_fn, body);
            (
                self.parse_tree.ty(body),
                self.parse_tree.rows(body),
                self.parse_tree.cols(body),
            )
        }
    }

    fn instantiate_set_of_funcs(
        &mut self,
        call_node: ParseNode,
        fun_group: Type,
        sig: &mut CallSignature,
    ) -> Type {
        let mut expected = RECURSIVE_CYCLE;
        let mut expected_index = 0;
        while expected_index < self.set_len(fun_group) {
            sig[0] = self.set_member(fun_group, expected_index);
            expected = self.fill_defaults_and_instantiate(call_node, sig.clone());
            if expected != RECURSIVE_CYCLE {
                break;
            }
            expected_index += 1;
        }

        if expected == RECURSIVE_CYCLE {
            return self.error_type(call_node, ErrorCode::RecursiveType);
        }

        for i in 0..self.set_len(fun_group) {
            if i == expected_index {
                continue;
            }
            sig[0] = self.set_member(fun_group, i);
            let evaluated = self.fill_defaults_and_instantiate(call_node, sig.clone());
            if evaluated == RECURSIVE_CYCLE {
                continue;
            }
            if is_function_set(expected) {
                if !is_function_set(evaluated) {
                    return self.error_type(call_node, ErrorCode::TypeError);
                }
                expected = self.function_set_union(expected, evaluated);
            } else if evaluated != expected {
                return self.error_type(call_node, ErrorCode::TypeError);
            }
        }

        expected
    }

    fn call_site(&mut self, pn: ParseNode) -> ParseNode {
        let head = self.parse_tree.arg(pn, 0);
        if self.parse_tree.op(head) == Op::SingleCharMultProxy {
            return self.patch_single_char_mult(pn, head);
        }

        let head = self.resolve_expr(head, 0, 0);
        self.parse_tree.set_arg(pn, 0, head);
        let node_size = self.parse_tree.num_args(pn);
        let callable_type = self.ty(head);

        if self.parse_tree.op(head) == Op::GammaFunction {
            if node_size != 2 {
                return self.error_code(pn, pn, ErrorCode::TooManyArgs);
            }
            let arg = self.resolve_expr(self.parse_tree.arg(pn, 1), 1, 1);
            self.parse_tree.set_arg(pn, 1, arg);
            if self.ty(arg) != NUMERIC {
                return self.error(pn, arg);
            }
            self.parse_tree.set_ty(pn, NUMERIC);
            self.parse_tree.set_scalar(pn);
            return pn;
        }

        if callable_type == NUMERIC {
            // Juxtaposition against a parenthetical is multiplication
            if node_size == 2 {
                let rhs = self.resolve_expr(self.parse_tree.rhs(pn), 0, 0);
                self.parse_tree.set_arg(pn, 1, rhs);
                if self.ty(rhs) == NUMERIC {
                    let mult = self
                        .parse_tree
                        .add_node_span(Op::Multiplication, &[head, rhs]);
                    return self.resolve_mult(mult, 0, 0);
                }
                return self.error(pn, rhs);
            }
            return self.error_code(pn, pn, ErrorCode::NotCallable);
        }
        if callable_type == UNINITIALISED {
            return self.error_code(pn, head, ErrorCode::UseBeforeDefine);
        }
        if !is_function_set(callable_type) {
            return self.error_code(pn, head, ErrorCode::NotCallable);
        }

        let mut sig: CallSignature = vec![self.set_member(callable_type, 0)];
        for i in 1..node_size {
            let arg = self.resolve_expr(self.parse_tree.arg(pn, i), 0, 0);
            self.parse_tree.set_arg(pn, i, arg);
            let t = self.ty(arg);
            sig.push(t);
            if t == NUMERIC {
                sig.push(self.parse_tree.rows(arg));
                sig.push(self.parse_tree.cols(arg));
            }
        }

        self.parse_tree.set_op(pn, Op::Call);
        let t = self.instantiate_set_of_funcs(pn, callable_type, &mut sig);
        self.parse_tree.set_ty(pn, t);
        pn
    }

    /// Re-associate `x y(z)` when `y(z)` turned out to be a call inside a
    /// single-char multiplication proxy.
    fn patch_single_char_mult(&mut self, parent: ParseNode, proxy: ParseNode) -> ParseNode {
        let mult = self.parse_tree.flag(proxy);
        let index = self.parse_tree.num_args(mult) - 1;
        let last = self.parse_tree.arg(mult, index);
        self.parse_tree.set_arg(parent, 0, last);
        self.parse_tree.set_arg(mult, index, parent);
        self.resolve_implicit_mult(mult, 0)
    }

    fn resolve_implicit_mult(&mut self, pn: ParseNode, start: usize) -> ParseNode {
        let lhs = self.resolve_expr(self.parse_tree.arg(pn, start), 0, 0);
        self.parse_tree.set_arg(pn, start, lhs);
        let tl = self.ty(lhs);

        if start == self.parse_tree.num_args(pn) - 1 {
            return lhs;
        }

        if tl == NUMERIC {
            let rhs = self.resolve_implicit_mult(pn, start + 1);
            if self.ty(rhs) != NUMERIC {
                return self.error(pn, rhs);
            }
            let mult = self.parse_tree.add_node_span(Op::Multiplication, &[lhs, rhs]);
            return self.resolve_mult_node(mult);
        }
        if tl == UNINITIALISED {
            return self.error_code(pn, lhs, ErrorCode::UseBeforeDefine);
        }
        if !is_function_set(tl) {
            return self.error_code(pn, lhs, ErrorCode::NotCallable);
        }

        // Function application by juxtaposition
        let rhs = self.resolve_implicit_mult(pn, start + 1);
        let tr = self.ty(rhs);
        let mut sig: CallSignature = vec![self.set_member(tl, 0), tr];
        if tr == NUMERIC {
            sig.push(self.parse_tree.rows(rhs));
            sig.push(self.parse_tree.cols(rhs));
        }

        let call = self.parse_tree.add_node_span(Op::Call, &[lhs, rhs]);
        let t = self.instantiate_set_of_funcs(call, tl, &mut sig);
        self.parse_tree.set_ty(call, t);
        call
    }

    // Expressions -----------------------------------------------------------

    /// Autosize entry point: a failed first resolution retries once, then
    /// residual unknowns become AUTOSIZE errors.
    fn resolve_expr_top(&mut self, pn: ParseNode, rows_expected: usize, cols_expected: usize) -> ParseNode {
        let pn = self.resolve_expr(pn, rows_expected, cols_expected);
        if !self.encountered_autosize {
            return pn;
        }
        self.encountered_autosize = false;
        let pn = self.resolve_expr(pn, rows_expected, cols_expected);
        if self.encountered_autosize {
            self.encountered_autosize = false;
            return self.error_code(pn, pn, ErrorCode::Autosize);
        }
        pn
    }

    fn set_numeric(&mut self, pn: ParseNode, rows: usize, cols: usize) -> ParseNode {
        self.parse_tree.set_ty(pn, NUMERIC);
        self.parse_tree.set_rows(pn, rows);
        self.parse_tree.set_cols(pn, cols);
        pn
    }

    fn enforce_scalar(&mut self, pn: ParseNode) -> ParseNode {
        if self.ty(pn) != NUMERIC {
            return self.error(pn, pn);
        }
        if self.parse_tree.definitely_not_scalar(pn) {
            return self.error_code(pn, pn, ErrorCode::ExpectScalar);
        }
        self.parse_tree.set_scalar(pn);
        pn
    }

    fn resolve_expr(&mut self, pn: ParseNode, rows_expected: usize, cols_expected: usize) -> ParseNode {
        if !self.program.no_errors() {
            return pn;
        }

        match self.parse_tree.op(pn) {
            Op::IntegerLiteral | Op::DecimalLiteral => {
                let value = self.parse_tree.double(pn);
                if value == 0.0 && (rows_expected > 1 || cols_expected > 1) {
                    self.parse_tree.set_op(pn, Op::ZeroMatrix);
                    return self.set_numeric(pn, rows_expected, cols_expected);
                }
                if value == 1.0 && (rows_expected > 1 || cols_expected > 1) {
                    self.parse_tree.set_op(pn, Op::OnesMatrix);
                    return self.set_numeric(pn, rows_expected, cols_expected);
                }
                self.set_numeric(pn, 1, 1)
            }
            Op::True | Op::False => {
                self.parse_tree.set_ty(pn, BOOLEAN);
                pn
            }
            Op::StringLiteral => {
                self.parse_tree.set_ty(pn, STRING);
                pn
            }
            Op::Infinity => self.set_numeric(pn, 1, 1),
            Op::Pi
            | Op::EulersNumber
            | Op::GoldenRatio
            | Op::SpeedOfLight
            | Op::PlanckConstant
            | Op::ReducedPlanckConstant
            | Op::StefanBoltzmannConstant
            | Op::Gravity
            | Op::CurrencyPounds
            | Op::CurrencyEuros
            | Op::CurrencyDollars => self.set_numeric(pn, 1, 1),

            Op::IdentityAutosize => {
                if rows_expected == UNKNOWN_SIZE && cols_expected == UNKNOWN_SIZE {
                    self.encountered_autosize = true;
                    self.parse_tree.set_ty(pn, NUMERIC);
                    return pn;
                }
                let n = if rows_expected != UNKNOWN_SIZE {
                    rows_expected
                } else {
                    cols_expected
                };
                self.parse_tree.set_op(pn, Op::IdentityMatrix);
                self.parse_tree.set_flag(pn, n);
                self.set_numeric(pn, n, n)
            }

            Op::IdentityMatrix | Op::ZeroMatrix | Op::OnesMatrix => {
                // Already lowered on a prior attempt
                self.parse_tree.set_ty(pn, NUMERIC);
                pn
            }

            Op::MaybeTranspose | Op::GammaFunction => {
                self.parse_tree.set_ty(pn, UNINITIALISED);
                pn
            }

            Op::Identifier | Op::ReadGlobal | Op::ReadUpvalue => {
                let mut sym_id = self.parse_tree.sym(pn);
                if sym_id == NONE {
                    return self.error_code(pn, pn, ErrorCode::BadRead);
                }
                while self.symbol_table.symbols[sym_id].ty == ALIAS {
                    sym_id = self.symbol_table.symbols[sym_id].shadowed_index;
                }
                let sym = &self.symbol_table.symbols[sym_id];
                self.parse_tree.set_ty(pn, sym.ty);
                self.parse_tree.set_rows(pn, sym.rows);
                self.parse_tree.set_cols(pn, sym.cols);
                pn
            }

            Op::SingleCharMultProxy => {
                let mult = self.parse_tree.flag(pn);
                self.resolve_implicit_mult(mult, 0)
            }
            Op::ImplicitMultiply => self.resolve_implicit_mult(pn, 0),
            Op::Call | Op::AmbiguousParenthetical => self.call_site(pn),

            Op::GroupParen | Op::GroupBracket => {
                let child = self.resolve_expr(self.parse_tree.child(pn), rows_expected, cols_expected);
                self.parse_tree.set_arg(pn, 0, child);
                self.parse_tree.set_ty(pn, self.parse_tree.ty(child));
                self.parse_tree.copy_dims(pn, child);
                pn
            }

            Op::Addition | Op::Subtraction => {
                let lhs = self.resolve_expr(self.parse_tree.lhs(pn), rows_expected, cols_expected);
                self.parse_tree.set_arg(pn, 0, lhs);
                let (lr, lc) = (self.parse_tree.rows(lhs), self.parse_tree.cols(lhs));
                let (er, ec) = (
                    if lr != UNKNOWN_SIZE { lr } else { rows_expected },
                    if lc != UNKNOWN_SIZE { lc } else { cols_expected },
                );
                let rhs = self.resolve_expr(self.parse_tree.rhs(pn), er, ec);
                self.parse_tree.set_arg(pn, 1, rhs);
                if self.ty(lhs) != NUMERIC {
                    return self.error(pn, lhs);
                }
                if self.ty(rhs) != NUMERIC {
                    return self.error(pn, rhs);
                }
                let rows = self.unify_dim(pn, lr, self.parse_tree.rows(rhs));
                let cols = self.unify_dim(pn, lc, self.parse_tree.cols(rhs));
                self.set_numeric(pn, rows, cols)
            }

            Op::Multiplication => self.resolve_mult(pn, rows_expected, cols_expected),

            Op::Division | Op::Forwardslash => {
                let lhs = self.resolve_expr(self.parse_tree.lhs(pn), rows_expected, cols_expected);
                self.parse_tree.set_arg(pn, 0, lhs);
                let rhs = self.resolve_expr(self.parse_tree.rhs(pn), 1, 1);
                self.parse_tree.set_arg(pn, 1, rhs);
                if self.ty(lhs) != NUMERIC {
                    return self.error(pn, lhs);
                }
                if self.ty(rhs) != NUMERIC {
                    return self.error(pn, rhs);
                }
                if self.parse_tree.definitely_not_scalar(rhs) {
                    return self.error_code(pn, rhs, ErrorCode::ExpectScalar);
                }
                let (r, c) = (self.parse_tree.rows(lhs), self.parse_tree.cols(lhs));
                self.set_numeric(pn, r, c)
            }

            Op::LinearSolve => {
                let a = self.resolve_expr(self.parse_tree.lhs(pn), 0, 0);
                self.parse_tree.set_arg(pn, 0, a);
                let b = self.resolve_expr(self.parse_tree.rhs(pn), 0, 0);
                self.parse_tree.set_arg(pn, 1, b);
                if self.ty(a) != NUMERIC {
                    return self.error(pn, a);
                }
                if self.ty(b) != NUMERIC {
                    return self.error(pn, b);
                }
                let rows = self.parse_tree.cols(a);
                let cols = self.parse_tree.cols(b);
                self.set_numeric(pn, rows, cols)
            }

            Op::EntrywiseProduct => {
                let lhs = self.resolve_expr(self.parse_tree.lhs(pn), rows_expected, cols_expected);
                self.parse_tree.set_arg(pn, 0, lhs);
                let rhs = self.resolve_expr(
                    self.parse_tree.rhs(pn),
                    self.parse_tree.rows(lhs),
                    self.parse_tree.cols(lhs),
                );
                self.parse_tree.set_arg(pn, 1, rhs);
                if self.ty(lhs) != NUMERIC || self.ty(rhs) != NUMERIC {
                    return self.error(pn, pn);
                }
                let rows = self.unify_dim(pn, self.parse_tree.rows(lhs), self.parse_tree.rows(rhs));
                let cols = self.unify_dim(pn, self.parse_tree.cols(lhs), self.parse_tree.cols(rhs));
                self.set_numeric(pn, rows, cols)
            }

            Op::Modulus => self.resolve_scalar_binary(pn),

            Op::Cross => {
                let lhs = self.resolve_expr(self.parse_tree.lhs(pn), 3, 1);
                self.parse_tree.set_arg(pn, 0, lhs);
                let rhs = self.resolve_expr(self.parse_tree.rhs(pn), 3, 1);
                self.parse_tree.set_arg(pn, 1, rhs);
                if self.ty(lhs) != NUMERIC || self.ty(rhs) != NUMERIC {
                    return self.error(pn, pn);
                }
                self.set_numeric(pn, 3, 1)
            }

            // `·` is the dot product on vectors, the ordinary product
            // otherwise
            Op::Dot => {
                let lhs = self.resolve_expr(self.parse_tree.lhs(pn), 0, 0);
                self.parse_tree.set_arg(pn, 0, lhs);
                let rhs = self.resolve_expr(
                    self.parse_tree.rhs(pn),
                    self.parse_tree.rows(lhs),
                    self.parse_tree.cols(lhs),
                );
                self.parse_tree.set_arg(pn, 1, rhs);
                if self.ty(lhs) != NUMERIC || self.ty(rhs) != NUMERIC {
                    return self.error(pn, pn);
                }
                let (lr, lc) = (self.parse_tree.rows(lhs), self.parse_tree.cols(lhs));
                let (rr, rc) = (self.parse_tree.rows(rhs), self.parse_tree.cols(rhs));
                let lhs_vector = lr == 1 || lc == 1;
                let rhs_vector = rr == 1 || rc == 1;
                if lr == UNKNOWN_SIZE || lc == UNKNOWN_SIZE || rr == UNKNOWN_SIZE
                    || rc == UNKNOWN_SIZE
                {
                    self.parse_tree.set_ty(pn, NUMERIC);
                    pn
                } else if lhs_vector && rhs_vector {
                    self.set_numeric(pn, 1, 1)
                } else {
                    if Self::dims_disagree(lc, rr) {
                        return self.error_code(pn, pn, ErrorCode::DimensionMismatch);
                    }
                    self.set_numeric(pn, lr, rc)
                }
            }

            Op::OuterProduct => {
                let lhs = self.resolve_expr(self.parse_tree.lhs(pn), 0, 1);
                self.parse_tree.set_arg(pn, 0, lhs);
                let rhs = self.resolve_expr(self.parse_tree.rhs(pn), 0, 1);
                self.parse_tree.set_arg(pn, 1, rhs);
                if self.ty(lhs) != NUMERIC || self.ty(rhs) != NUMERIC {
                    return self.error(pn, pn);
                }
                let rows = self.parse_tree.rows(lhs);
                let cols = self.parse_tree.rows(rhs);
                self.set_numeric(pn, rows, cols)
            }

            Op::UnaryMinus => {
                let child = self.resolve_expr(self.parse_tree.child(pn), rows_expected, cols_expected);
                self.parse_tree.set_arg(pn, 0, child);
                if self.ty(child) != NUMERIC {
                    return self.error(pn, child);
                }
                self.parse_tree.set_ty(pn, NUMERIC);
                self.parse_tree.copy_dims(pn, child);
                pn
            }

            Op::Power => self.resolve_power(pn),

            Op::Sqrt | Op::Exp | Op::NaturalLog | Op::Log | Op::SignFunction
            | Op::ErrorFunction | Op::CompErrFunc | Op::Sine | Op::Cosine | Op::Tangent
            | Op::Arcsine | Op::Arccosine | Op::Arctangent | Op::Cosecant | Op::Secant
            | Op::Cotangent | Op::Arccosecant | Op::Arcsecant | Op::Arccotangent
            | Op::HyperbolicSine | Op::HyperbolicCosine | Op::HyperbolicTangent
            | Op::HyperbolicArcsine | Op::HyperbolicArccosine | Op::HyperbolicArctangent
            | Op::HyperbolicCosecant | Op::HyperbolicSecant | Op::HyperbolicCotangent
            | Op::HyperbolicArccosecant | Op::HyperbolicArcsecant | Op::HyperbolicArccotangent => {
                let child = self.resolve_expr(self.parse_tree.child(pn), 1, 1);
                self.parse_tree.set_arg(pn, 0, child);
                let child = self.enforce_scalar(child);
                if self.ty(child) == FAILURE {
                    return pn;
                }
                self.set_numeric(pn, 1, 1)
            }

            Op::NRoot | Op::LogBase | Op::Arctangent2 | Op::Binomial => self.resolve_scalar_binary(pn),

            Op::Factorial => {
                let child = self.resolve_expr(self.parse_tree.child(pn), 1, 1);
                self.parse_tree.set_arg(pn, 0, child);
                let child = self.enforce_scalar(child);
                if self.ty(child) == FAILURE {
                    return pn;
                }
                self.set_numeric(pn, 1, 1)
            }

            Op::Transpose | Op::Adjoint | Op::PseudoInverse => {
                let child = self.resolve_expr(self.parse_tree.child(pn), cols_expected, rows_expected);
                self.parse_tree.set_arg(pn, 0, child);
                if self.ty(child) != NUMERIC {
                    return self.error(pn, child);
                }
                self.parse_tree.set_ty(pn, NUMERIC);
                self.parse_tree.transpose_dims(pn, child);
                pn
            }

            Op::Invert => {
                let child = self.resolve_expr(self.parse_tree.child(pn), 0, 0);
                self.parse_tree.set_arg(pn, 0, child);
                if self.ty(child) != NUMERIC {
                    return self.error(pn, child);
                }
                let r = self.parse_tree.rows(child);
                let c = self.parse_tree.cols(child);
                if Self::dims_disagree(r, c) {
                    return self.error_code(pn, child, ErrorCode::DimensionMismatch);
                }
                self.set_numeric(pn, r, c)
            }

            Op::Abs | Op::Norm | Op::Norm1 | Op::NormInfinity | Op::NormSquared => {
                let child = self.resolve_expr(self.parse_tree.child(pn), 0, 0);
                self.parse_tree.set_arg(pn, 0, child);
                if self.ty(child) != NUMERIC {
                    return self.error(pn, child);
                }
                self.set_numeric(pn, 1, 1)
            }

            Op::NormP => {
                let child = self.resolve_expr(self.parse_tree.child(pn), 0, 0);
                self.parse_tree.set_arg(pn, 0, child);
                let p = self.resolve_expr(self.parse_tree.rhs(pn), 1, 1);
                self.parse_tree.set_arg(pn, 1, p);
                if self.ty(child) != NUMERIC || self.ty(p) != NUMERIC {
                    return self.error(pn, pn);
                }
                self.set_numeric(pn, 1, 1)
            }

            Op::Ceil | Op::Floor => {
                let child = self.resolve_expr(self.parse_tree.child(pn), 1, 1);
                self.parse_tree.set_arg(pn, 0, child);
                let child = self.enforce_scalar(child);
                if self.ty(child) == FAILURE {
                    return pn;
                }
                self.set_numeric(pn, 1, 1)
            }

            Op::InnerProduct => {
                let lhs = self.resolve_expr(self.parse_tree.lhs(pn), 0, 0);
                self.parse_tree.set_arg(pn, 0, lhs);
                let rhs = self.resolve_expr(
                    self.parse_tree.rhs(pn),
                    self.parse_tree.rows(lhs),
                    self.parse_tree.cols(lhs),
                );
                self.parse_tree.set_arg(pn, 1, rhs);
                if self.ty(lhs) != NUMERIC || self.ty(rhs) != NUMERIC {
                    return self.error(pn, pn);
                }
                self.set_numeric(pn, 1, 1)
            }

            Op::Length | Op::RowsFn | Op::ColsFn | Op::Cardinality => {
                let child = self.resolve_expr(self.parse_tree.child(pn), 0, 0);
                self.parse_tree.set_arg(pn, 0, child);
                if self.ty(child) != NUMERIC {
                    return self.error(pn, child);
                }
                self.set_numeric(pn, 1, 1)
            }

            Op::Matrix => self.resolve_matrix(pn),
            Op::Cases => self.resolve_cases(pn),

            Op::Less | Op::Greater => {
                for i in 0..self.parse_tree.num_args(pn) {
                    let operand = self.resolve_expr(self.parse_tree.arg(pn, i), 1, 1);
                    self.parse_tree.set_arg(pn, i, operand);
                    let operand = self.enforce_scalar(operand);
                    if self.ty(operand) == FAILURE {
                        return pn;
                    }
                }
                self.parse_tree.set_ty(pn, BOOLEAN);
                pn
            }

            Op::Equal | Op::NotEqual | Op::Approx | Op::NotApprox => {
                let lhs = self.resolve_expr(self.parse_tree.lhs(pn), 0, 0);
                self.parse_tree.set_arg(pn, 0, lhs);
                let rhs = self.resolve_expr(
                    self.parse_tree.rhs(pn),
                    self.parse_tree.rows(lhs),
                    self.parse_tree.cols(lhs),
                );
                self.parse_tree.set_arg(pn, 1, rhs);
                if self.ty(lhs) != self.ty(rhs) {
                    return self.error(pn, rhs);
                }
                self.parse_tree.set_ty(pn, BOOLEAN);
                pn
            }

            Op::Member | Op::NotMember => self.resolve_membership(pn),

            Op::LogicalAnd | Op::LogicalOr => {
                let lhs = self.resolve_expr(self.parse_tree.lhs(pn), 0, 0);
                self.parse_tree.set_arg(pn, 0, lhs);
                let rhs = self.resolve_expr(self.parse_tree.rhs(pn), 0, 0);
                self.parse_tree.set_arg(pn, 1, rhs);
                if self.ty(lhs) != BOOLEAN {
                    return self.error_code(pn, lhs, ErrorCode::ExpectBoolean);
                }
                if self.ty(rhs) != BOOLEAN {
                    return self.error_code(pn, rhs, ErrorCode::ExpectBoolean);
                }
                self.parse_tree.set_ty(pn, BOOLEAN);
                pn
            }

            Op::LogicalNot => {
                let child = self.resolve_expr(self.parse_tree.child(pn), 0, 0);
                self.parse_tree.set_arg(pn, 0, child);
                if self.ty(child) != BOOLEAN {
                    return self.error_code(pn, child, ErrorCode::ExpectBoolean);
                }
                self.parse_tree.set_ty(pn, BOOLEAN);
                pn
            }

            Op::SubscriptAccess => self.resolve_subscript_access(pn, rows_expected, cols_expected),

            Op::Slice => {
                for i in 0..self.parse_tree.num_args(pn) {
                    let part = self.parse_tree.arg(pn, i);
                    if self.parse_tree.op(part) == Op::SliceAll {
                        continue;
                    }
                    let part = self.resolve_expr(part, 1, 1);
                    self.parse_tree.set_arg(pn, i, part);
                    if self.ty(part) != NUMERIC {
                        return self.error(pn, part);
                    }
                }
                self.set_numeric(pn, 1, 1)
            }
            Op::SliceAll => self.set_numeric(pn, 1, 1),

            Op::Summation | Op::Product => {
                let assign = self.parse_tree.arg(pn, 0);
                let var = self.parse_tree.lhs(assign);
                let sym_id = self.parse_tree.sym(var);
                if sym_id != NONE {
                    let sym = &mut self.symbol_table.symbols[sym_id];
                    sym.ty = NUMERIC;
                    sym.rows = 1;
                    sym.cols = 1;
                }
                let start = self.resolve_expr(self.parse_tree.rhs(assign), 1, 1);
                self.parse_tree.set_arg(assign, 1, start);
                let stop = self.resolve_expr(self.parse_tree.arg(pn, 1), 1, 1);
                self.parse_tree.set_arg(pn, 1, stop);
                if self.ty(start) != NUMERIC || self.ty(stop) != NUMERIC {
                    return self.error_code(pn, pn, ErrorCode::BigSymbolArg);
                }
                let body = self.resolve_expr(self.parse_tree.arg(pn, 2), 0, 0);
                self.parse_tree.set_arg(pn, 2, body);
                if self.ty(body) != NUMERIC {
                    return self.error(pn, body);
                }
                self.parse_tree.set_ty(pn, NUMERIC);
                self.parse_tree.copy_dims(pn, body);
                pn
            }

            Op::Derivative | Op::Partial => self.resolve_deriv(pn),

            Op::DefiniteIntegral => {
                let hi = self.resolve_expr(self.parse_tree.arg(pn, 1), 1, 1);
                self.parse_tree.set_arg(pn, 1, hi);
                let lo = self.resolve_expr(self.parse_tree.arg(pn, 2), 1, 1);
                self.parse_tree.set_arg(pn, 2, lo);
                if self.ty(hi) != NUMERIC || self.ty(lo) != NUMERIC {
                    return self.error_code(pn, pn, ErrorCode::BigSymbolArg);
                }
                let var = self.parse_tree.arg(pn, 0);
                let sym_id = self.parse_tree.sym(var);
                if sym_id != NONE {
                    let sym = &mut self.symbol_table.symbols[sym_id];
                    sym.ty = NUMERIC;
                    sym.rows = 1;
                    sym.cols = 1;
                }
                let kernel = self.resolve_expr(self.parse_tree.arg(pn, 3), 0, 0);
                self.parse_tree.set_arg(pn, 3, kernel);
                if self.ty(kernel) != NUMERIC {
                    return self.error(pn, kernel);
                }
                self.parse_tree.set_ty(pn, NUMERIC);
                self.parse_tree.copy_dims(pn, kernel);
                pn
            }

            Op::IntegerRange => {
                let lo = self.resolve_expr(self.parse_tree.lhs(pn), 1, 1);
                self.parse_tree.set_arg(pn, 0, lo);
                let hi = self.resolve_expr(self.parse_tree.rhs(pn), 1, 1);
                self.parse_tree.set_arg(pn, 1, hi);
                if self.ty(lo) != NUMERIC || self.ty(hi) != NUMERIC {
                    return self.error(pn, pn);
                }
                self.set_numeric(pn, 1, UNKNOWN_SIZE)
            }

            Op::AccentHat => {
                let child = self.resolve_expr(self.parse_tree.child(pn), 0, 0);
                self.parse_tree.set_arg(pn, 0, child);
                if self.ty(child) != NUMERIC {
                    return self.error(pn, child);
                }
                let (r, c) = (self.parse_tree.rows(child), self.parse_tree.cols(child));
                let dims = match (r, c) {
                    (3, 1) => (3, 3),
                    (6, 1) => (4, 4),
                    (3, 3) => (3, 1),
                    (4, 4) => (6, 1),
                    _ => (UNKNOWN_SIZE, UNKNOWN_SIZE),
                };
                self.set_numeric(pn, dims.0, dims.1)
            }

            Op::AccentBar => {
                let child = self.resolve_expr(self.parse_tree.child(pn), rows_expected, cols_expected);
                self.parse_tree.set_arg(pn, 0, child);
                if self.ty(child) != NUMERIC {
                    return self.error(pn, child);
                }
                self.parse_tree.set_ty(pn, NUMERIC);
                self.parse_tree.copy_dims(pn, child);
                pn
            }

            Op::Lambda => self.resolve_lambda(pn),
            Op::ScopeAccess => self.resolve_scope_access(pn, false),
            Op::UnitVector => {
                self.parse_tree.set_ty(pn, NUMERIC);
                pn
            }

            Op::Limit | Op::Integral => {
                if self.retry_at_recursion {
                    self.parse_tree.set_ty(pn, RECURSIVE_CYCLE);
                    return pn;
                }
                if self.program.no_errors() {
                    let sel = self.parse_tree.sel(pn);
                    self.program.fail_with_message(
                        sel,
                        "limits and indefinite integrals are symbolic; only definite integrals evaluate",
                        ErrorCode::TypeError,
                    );
                }
                self.parse_tree.set_ty(pn, FAILURE);
                pn
            }

            Op::Error => {
                self.parse_tree.set_ty(pn, FAILURE);
                pn
            }

            _ => self.error_code(pn, pn, ErrorCode::TypeError),
        }
    }

    fn resolve_scalar_binary(&mut self, pn: ParseNode) -> ParseNode {
        let lhs = self.resolve_expr(self.parse_tree.lhs(pn), 1, 1);
        self.parse_tree.set_arg(pn, 0, lhs);
        let rhs = self.resolve_expr(self.parse_tree.rhs(pn), 1, 1);
        self.parse_tree.set_arg(pn, 1, rhs);
        if self.ty(lhs) != NUMERIC {
            return self.error(pn, lhs);
        }
        if self.ty(rhs) != NUMERIC {
            return self.error(pn, rhs);
        }
        let lhs = self.enforce_scalar(lhs);
        let rhs = self.enforce_scalar(rhs);
        if self.ty(lhs) == FAILURE || self.ty(rhs) == FAILURE {
            return pn;
        }
        self.set_numeric(pn, 1, 1)
    }

    fn resolve_mult(&mut self, pn: ParseNode, rows_expected: usize, cols_expected: usize) -> ParseNode {
        let _ = (rows_expected, cols_expected);
        self.resolve_mult_node(pn)
    }

    fn resolve_mult_node(&mut self, pn: ParseNode) -> ParseNode {
        let lhs = self.resolve_expr(self.parse_tree.lhs(pn), 0, 0);
        self.parse_tree.set_arg(pn, 0, lhs);
        let rhs = self.resolve_expr(self.parse_tree.rhs(pn), 0, 0);
        self.parse_tree.set_arg(pn, 1, rhs);
        if self.ty(lhs) != NUMERIC {
            return self.error(pn, lhs);
        }
        if self.ty(rhs) != NUMERIC {
            return self.error(pn, rhs);
        }

        // A⁻¹·B is solved, not inverted and multiplied
        if self.parse_tree.op(lhs) == Op::Invert {
            let a = self.parse_tree.child(lhs);
            self.parse_tree.set_op(pn, Op::LinearSolve);
            self.parse_tree.set_arg(pn, 0, a);
            let rows = self.parse_tree.cols(a);
            let cols = self.parse_tree.cols(rhs);
            return self.set_numeric(pn, rows, cols);
        }

        let (lr, lc) = (self.parse_tree.rows(lhs), self.parse_tree.cols(lhs));
        let (rr, rc) = (self.parse_tree.rows(rhs), self.parse_tree.cols(rhs));

        if lr == 1 && lc == 1 {
            return self.set_numeric(pn, rr, rc);
        }
        if rr == 1 && rc == 1 {
            return self.set_numeric(pn, lr, lc);
        }
        if Self::dims_disagree(lc, rr) {
            return self.error_code(pn, pn, ErrorCode::DimensionMismatch);
        }
        self.set_numeric(pn, lr, rc)
    }

    fn resolve_power(&mut self, pn: ParseNode) -> ParseNode {
        let base = self.resolve_expr(self.parse_tree.lhs(pn), 0, 0);
        self.parse_tree.set_arg(pn, 0, base);
        let exponent = self.parse_tree.rhs(pn);

        // A^T and A^(-1) are structure, not arithmetic
        if self.parse_tree.op(exponent) == Op::MaybeTranspose {
            let level = self.program.settings.level(SettingId::TransposeT);
            let sel = self.parse_tree.sel(exponent);
            self.program.warn(level, sel, ErrorCode::TransposeTWarning);
            self.parse_tree.set_op(pn, Op::Transpose);
            self.parse_tree.set_arg(pn, 0, base);
            self.parse_tree.reduce_num_args(pn, 1);
            if self.ty(base) != NUMERIC {
                return self.error(pn, base);
            }
            self.parse_tree.set_ty(pn, NUMERIC);
            self.parse_tree.transpose_dims(pn, base);
            return pn;
        }

        let exponent = self.resolve_expr(exponent, 1, 1);
        self.parse_tree.set_arg(pn, 1, exponent);
        if self.ty(base) != NUMERIC {
            return self.error(pn, base);
        }
        if self.ty(exponent) != NUMERIC {
            return self.error(pn, exponent);
        }

        let exp_is_negative_one = (self.parse_tree.op(exponent) == Op::IntegerLiteral
            && self.parse_tree.double(exponent) == -1.0)
            || (self.parse_tree.op(exponent) == Op::UnaryMinus
                && self.parse_tree.op(self.parse_tree.child(exponent)) == Op::IntegerLiteral
                && self.parse_tree.double(self.parse_tree.child(exponent)) == 1.0);

        if exp_is_negative_one && self.parse_tree.definitely_not_scalar(base) {
            self.parse_tree.set_op(pn, Op::Invert);
            self.parse_tree.set_arg(pn, 0, base);
            self.parse_tree.reduce_num_args(pn, 1);
            let (r, c) = (self.parse_tree.rows(base), self.parse_tree.cols(base));
            if Self::dims_disagree(r, c) {
                return self.error_code(pn, base, ErrorCode::DimensionMismatch);
            }
            return self.set_numeric(pn, r, c);
        }

        // ‖x‖² lowers to a fused norm-squared
        if self.parse_tree.op(base) == Op::Norm
            && self.parse_tree.op(exponent) == Op::IntegerLiteral
            && self.parse_tree.double(exponent) == 2.0
        {
            let vec = self.parse_tree.child(base);
            self.parse_tree.set_op(pn, Op::NormSquared);
            self.parse_tree.set_arg(pn, 0, vec);
            self.parse_tree.reduce_num_args(pn, 1);
            return self.set_numeric(pn, 1, 1);
        }

        if self.parse_tree.definitely_not_scalar(base) {
            let (r, c) = (self.parse_tree.rows(base), self.parse_tree.cols(base));
            if Self::dims_disagree(r, c) {
                return self.error_code(pn, base, ErrorCode::DimensionMismatch);
            }
            if self.parse_tree.op(exponent) != Op::IntegerLiteral {
                return self.error_code(pn, exponent, ErrorCode::ExpectNaturalNumber);
            }
            return self.set_numeric(pn, r, c);
        }

        self.set_numeric(pn, 1, 1)
    }

    fn resolve_matrix(&mut self, pn: ParseNode) -> ParseNode {
        let typeset_rows = self.parse_tree.flag(pn);
        let nargs = self.parse_tree.num_args(pn);
        let typeset_cols = nargs / typeset_rows.max(1);

        let mut all_scalar = true;
        for i in 0..nargs {
            let entry = self.resolve_expr(self.parse_tree.arg(pn, i), 1, 1);
            self.parse_tree.set_arg(pn, i, entry);
            if self.ty(entry) != NUMERIC {
                return self.error(pn, entry);
            }
            all_scalar &= self.parse_tree.definitely_scalar(entry);
        }

        if all_scalar {
            self.set_numeric(pn, typeset_rows, typeset_cols)
        } else {
            // Block matrices settle their shape at runtime
            self.set_numeric(pn, UNKNOWN_SIZE, UNKNOWN_SIZE)
        }
    }

    fn resolve_cases(&mut self, pn: ParseNode) -> ParseNode {
        let mut rows = UNKNOWN_SIZE;
        let mut cols = UNKNOWN_SIZE;
        let mut i = 0;
        while i < self.parse_tree.num_args(pn) {
            let value = self.resolve_expr(self.parse_tree.arg(pn, i), rows, cols);
            self.parse_tree.set_arg(pn, i, value);
            if self.ty(value) != NUMERIC {
                return self.error(pn, value);
            }
            rows = self.unify_dim(pn, rows, self.parse_tree.rows(value));
            cols = self.unify_dim(pn, cols, self.parse_tree.cols(value));

            let condition = self.resolve_expr(self.parse_tree.arg(pn, i + 1), 0, 0);
            self.parse_tree.set_arg(pn, i + 1, condition);
            if self.ty(condition) != BOOLEAN {
                return self.error_code(pn, condition, ErrorCode::ExpectBoolean);
            }
            i += 2;
        }
        self.set_numeric(pn, rows, cols)
    }

    fn resolve_membership(&mut self, pn: ParseNode) -> ParseNode {
        let lhs = self.resolve_expr(self.parse_tree.lhs(pn), 0, 0);
        self.parse_tree.set_arg(pn, 0, lhs);
        if self.ty(lhs) != NUMERIC {
            return self.error(pn, lhs);
        }

        let rhs = self.parse_tree.rhs(pn);
        match self.parse_tree.op(rhs) {
            Op::Reals | Op::PositiveReals | Op::NegativeReals | Op::Integers | Op::Naturals
            | Op::Rationals | Op::PositiveRationals | Op::NegativeRationals => {}
            Op::IntegerRange | Op::IntervalCloseClose | Op::IntervalCloseOpen => {
                let lo = self.resolve_expr(self.parse_tree.lhs(rhs), 1, 1);
                self.parse_tree.set_arg(rhs, 0, lo);
                let hi = self.resolve_expr(self.parse_tree.rhs(rhs), 1, 1);
                self.parse_tree.set_arg(rhs, 1, hi);
                if self.ty(lo) != NUMERIC || self.ty(hi) != NUMERIC {
                    return self.error(pn, rhs);
                }
            }
            Op::SetLiteral => {
                for i in 0..self.parse_tree.num_args(rhs) {
                    let member = self.resolve_expr(self.parse_tree.arg(rhs, i), 1, 1);
                    self.parse_tree.set_arg(rhs, i, member);
                    if self.ty(member) != NUMERIC {
                        return self.error(pn, member);
                    }
                }
            }
            _ => return self.error(pn, rhs),
        }

        self.parse_tree.set_ty(pn, BOOLEAN);
        pn
    }

    fn resolve_subscript_access(
        &mut self,
        pn: ParseNode,
        rows_expected: usize,
        cols_expected: usize,
    ) -> ParseNode {
        // `e` with a subscript is a unit vector whose length autosizes
        if self.parse_tree.op(self.parse_tree.arg(pn, 0)) == Op::EulersNumber
            && self.parse_tree.num_args(pn) == 2
        {
            return self.resolve_unit_vector(pn, rows_expected, cols_expected);
        }

        let base = self.resolve_expr(self.parse_tree.arg(pn, 0), 0, 0);
        self.parse_tree.set_arg(pn, 0, base);
        if self.ty(base) != NUMERIC {
            return self.error(pn, base);
        }

        let num_indices = self.parse_tree.num_args(pn) - 1;
        if num_indices > 2 {
            return self.error_code(pn, pn, ErrorCode::IndexOutOfRange);
        }

        let mut all_scalar_indices = true;
        for i in 1..=num_indices {
            let sub = self.resolve_expr(self.parse_tree.arg(pn, i), 1, 1);
            self.parse_tree.set_arg(pn, i, sub);
            if self.ty(sub) != NUMERIC {
                return self.error(pn, sub);
            }
            all_scalar_indices &= self.parse_tree.op(sub) != Op::Slice;
        }

        if all_scalar_indices {
            self.set_numeric(pn, 1, 1)
        } else {
            self.set_numeric(pn, UNKNOWN_SIZE, UNKNOWN_SIZE)
        }
    }

    fn resolve_unit_vector(
        &mut self,
        pn: ParseNode,
        rows_expected: usize,
        cols_expected: usize,
    ) -> ParseNode {
        let index = self.resolve_expr(self.parse_tree.arg(pn, 1), 1, 1);
        if self.ty(index) != NUMERIC {
            return self.error(pn, index);
        }

        if rows_expected == UNKNOWN_SIZE && cols_expected == UNKNOWN_SIZE {
            self.encountered_autosize = true;
            self.parse_tree.set_ty(pn, NUMERIC);
            return pn;
        }

        let sel = self.parse_tree.sel(pn);
        let rows = if rows_expected == UNKNOWN_SIZE { 1 } else { rows_expected };
        let cols = if cols_expected == UNKNOWN_SIZE { 1 } else { cols_expected };
        let rows_node = self.parse_tree.add_terminal(Op::IntegerLiteral, sel);
        self.parse_tree.set_double(rows_node, rows as f64);
        self.parse_tree.set_ty(rows_node, NUMERIC);
        self.parse_tree.set_scalar(rows_node);
        let cols_node = self.parse_tree.add_terminal(Op::IntegerLiteral, sel);
        self.parse_tree.set_double(cols_node, cols as f64);
        self.parse_tree.set_ty(cols_node, NUMERIC);
        self.parse_tree.set_scalar(cols_node);

        self.parse_tree.set_op(pn, Op::UnitVector);
        self.parse_tree
            .set_children(pn, &[index, rows_node, cols_node]);
        self.set_numeric(pn, rows, cols)
    }

    fn resolve_deriv(&mut self, pn: ParseNode) -> ParseNode {
        let point = self.parse_tree.arg(pn, 2);
        if point == NONE {
            return self.error_code(pn, pn, ErrorCode::BadRead);
        }
        let point = self.resolve_expr(point, 0, 0);
        self.parse_tree.set_arg(pn, 2, point);
        if self.ty(point) != NUMERIC {
            return self.error(pn, point);
        }
        let (pr, pc) = (self.parse_tree.rows(point), self.parse_tree.cols(point));
        if pc > 1 {
            return self.error_code(pn, point, ErrorCode::DimensionMismatch);
        }

        let var = self.parse_tree.arg(pn, 1);
        let sym_id = self.parse_tree.sym(var);
        if sym_id != NONE {
            let sym = &mut self.symbol_table.symbols[sym_id];
            sym.ty = NUMERIC;
            sym.rows = pr;
            sym.cols = pc;
        }

        let body = self.resolve_expr(self.parse_tree.arg(pn, 0), 0, 0);
        self.parse_tree.set_arg(pn, 0, body);
        if self.ty(body) != NUMERIC {
            return self.error(pn, body);
        }
        let (br, bc) = (self.parse_tree.rows(body), self.parse_tree.cols(body));
        if bc > 1 {
            return self.error_code(pn, body, ErrorCode::DimensionMismatch);
        }

        // scalar wrt scalar → scalar; scalar wrt vector → row vector;
        // vector wrt scalar → vector; vector wrt vector → Jacobian
        let dims = match (br, pr) {
            (1, 1) => (1, 1),
            (1, n) => (1, n),
            (m, 1) => (m, 1),
            (m, n) => (m, n),
        };
        self.set_numeric(pn, dims.0, dims.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler;
    use std::path::PathBuf;

    fn analyse(source: &str) -> (Program, Option<compiler::Compilation>) {
        let mut program = Program::new();
        let id = program
            .set_entry_source(PathBuf::from("test.nte"), source)
            .model()
            .expect("valid serial");
        let compilation = compiler::compile(&mut program, id);
        (program, compilation)
    }

    fn first_error(program: &Program) -> Option<ErrorCode> {
        program.error_stream.errors.first().map(|e| e.code)
    }

    #[test]
    fn numeric_literal_types_as_scalar() {
        let (program, result) = analyse("x ← 3\nprint(x)");
        assert!(program.no_errors());
        let compilation = result.unwrap();
        let tree = &compilation.parse_tree;
        let assign = tree.arg(tree.root, 0);
        let rhs = tree.rhs(assign);
        assert_eq!(tree.ty(rhs), NUMERIC);
        assert!(tree.definitely_scalar(rhs));
    }

    #[test]
    fn condition_must_be_boolean() {
        let (program, _) = analyse("if(1) {\nprint(1)\n}");
        assert_eq!(first_error(&program), Some(ErrorCode::ExpectBoolean));
    }

    #[test]
    fn matrix_dims_propagate() {
        let serial = format!("A ← {}\nprint(A)", crate::serial::matrix(2, 2, &["1", "2", "3", "4"]));
        let (program, result) = analyse(&serial);
        assert!(program.no_errors());
        let compilation = result.unwrap();
        let tree = &compilation.parse_tree;
        let assign = tree.arg(tree.root, 0);
        let rhs = tree.rhs(assign);
        assert_eq!(tree.rows(rhs), 2);
        assert_eq!(tree.cols(rhs), 2);
    }

    #[test]
    fn incompatible_matrix_addition_errors() {
        let serial = format!(
            "A ← {}\nB ← {}\nprint(A + B)",
            crate::serial::matrix(2, 2, &["1", "2", "3", "4"]),
            crate::serial::matrix(3, 1, &["1", "2", "3"]),
        );
        let (program, _) = analyse(&serial);
        assert_eq!(first_error(&program), Some(ErrorCode::DimensionMismatch));
    }

    #[test]
    fn inner_dim_mismatch_errors() {
        let serial = format!(
            "A ← {}\nB ← {}\nprint(A * B)",
            crate::serial::matrix(2, 2, &["1", "2", "3", "4"]),
            crate::serial::matrix(3, 1, &["1", "2", "3"]),
        );
        let (program, _) = analyse(&serial);
        assert_eq!(first_error(&program), Some(ErrorCode::DimensionMismatch));
    }

    #[test]
    fn function_instantiates_per_signature() {
        let (program, result) = analyse("f(x) = x * x\nprint(f(3))");
        assert!(program.no_errors());
        let compilation = result.unwrap();
        assert_eq!(compilation.instantiation_lookup.len(), 1);
    }

    #[test]
    fn call_with_too_many_args_errors() {
        let (program, _) = analyse("f(x) = x\nprint(f(1, 2))");
        assert_eq!(first_error(&program), Some(ErrorCode::TooManyArgs));
    }

    #[test]
    fn call_with_too_few_args_errors() {
        let (program, _) = analyse("algorithm f(x, y) {\nreturn x + y\n}\nprint(f(1))");
        assert_eq!(first_error(&program), Some(ErrorCode::TooFewArgs));
    }

    #[test]
    fn default_arguments_fill_missing() {
        let (program, _) = analyse("algorithm f(x, y = 10) {\nreturn x + y\n}\nprint(f(1))");
        assert!(program.no_errors(), "{:?}", first_error(&program));
    }

    #[test]
    fn switch_lowering_builds_numeric_map() {
        let (program, result) = analyse(
            "n ← 3\nswitch(n) {\ncase 1:\nprint(1)\ncase 2:\nprint(2)\n}",
        );
        assert!(program.no_errors());
        let compilation = result.unwrap();
        assert_eq!(compilation.number_switch.len(), 2);
    }

    #[test]
    fn duplicate_case_is_redundant() {
        let (program, _) = analyse(
            "n ← 3\nswitch(n) {\ncase 1:\nprint(1)\ncase 1:\nprint(2)\n}",
        );
        assert_eq!(first_error(&program), Some(ErrorCode::RedundantCase));
    }

    #[test]
    fn recursion_resolves_with_retry() {
        let (program, _) = analyse(
            "algorithm fact(n) {\nif(n < 2) {\nreturn 1\n}\nreturn n * fact(n - 1)\n}\nprint(fact(5))",
        );
        assert!(program.no_errors(), "{:?}", first_error(&program));
    }

    #[test]
    fn switch_on_boolean_is_unsupported() {
        let (program, _) = analyse("switch(true) {\ncase 1:\nprint(1)\n}");
        assert_eq!(first_error(&program), Some(ErrorCode::UnsupportedSwitchType));
    }

    #[test]
    fn transpose_swaps_dims() {
        let serial = format!(
            "A ← {}\nB ← A{}\nprint(B)",
            crate::serial::matrix(2, 3, &["1", "2", "3", "4", "5", "6"]),
            crate::serial::unary(crate::serial::KEY_SUPERSCRIPT, "T"),
        );
        let (program, result) = analyse(&serial);
        assert!(program.no_errors());
        let compilation = result.unwrap();
        let tree = &compilation.parse_tree;
        let assign = tree.arg(tree.root, 1);
        let rhs = tree.rhs(assign);
        assert_eq!((tree.rows(rhs), tree.cols(rhs)), (3, 2));
    }

    #[test]
    fn matrix_inverse_times_vector_becomes_linear_solve() {
        let serial = format!(
            "A ← {}\nb ← {}\nx ← A{} * b\nprint(x)",
            crate::serial::matrix(2, 2, &["2", "0", "0", "2"]),
            crate::serial::matrix(2, 1, &["2", "4"]),
            crate::serial::unary(crate::serial::KEY_SUPERSCRIPT, "-1"),
        );
        let (program, result) = analyse(&serial);
        assert!(program.no_errors(), "{:?}", first_error(&program));
        let compilation = result.unwrap();
        let tree = &compilation.parse_tree;
        let assign = tree.arg(tree.root, 2);
        assert_eq!(tree.op(tree.rhs(assign)), Op::LinearSolve);
    }

    #[test]
    fn norm_squared_is_fused() {
        let serial = format!(
            "v ← {}\nn ← ‖v‖{}\nprint(n)",
            crate::serial::matrix(2, 1, &["3", "4"]),
            crate::serial::unary(crate::serial::KEY_SUPERSCRIPT, "2"),
        );
        let (program, result) = analyse(&serial);
        assert!(program.no_errors(), "{:?}", first_error(&program));
        let compilation = result.unwrap();
        let tree = &compilation.parse_tree;
        let assign = tree.arg(tree.root, 1);
        assert_eq!(tree.op(tree.rhs(assign)), Op::NormSquared);
    }

    #[test]
    fn unused_expression_warns_and_becomes_noop() {
        let (program, result) = analyse("x ← 1\nx + 1\nprint(x)");
        assert!(program.no_errors());
        assert!(program
            .error_stream
            .warnings
            .iter()
            .any(|w| w.code == ErrorCode::UnusedExpression));
        let compilation = result.unwrap();
        let tree = &compilation.parse_tree;
        assert_eq!(tree.op(tree.arg(tree.root, 1)), Op::DoNothing);
    }

    #[test]
    fn autosize_identity_takes_dims_from_context() {
        let serial = format!(
            "A ← {}\nB ← A + I\nprint(B)",
            crate::serial::matrix(2, 2, &["1", "0", "0", "1"]),
        );
        let (program, result) = analyse(&serial);
        assert!(program.no_errors(), "{:?}", first_error(&program));
        let compilation = result.unwrap();
        let tree = &compilation.parse_tree;
        let assign = tree.arg(tree.root, 1);
        let add = tree.rhs(assign);
        assert_eq!(tree.op(tree.rhs(add)), Op::IdentityMatrix);
    }

    #[test]
    fn calling_a_number_errors() {
        let (program, _) = analyse("x ← 1\nx(1, 2)");
        assert_eq!(first_error(&program), Some(ErrorCode::NotCallable));
    }
}
