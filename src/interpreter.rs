//! Tree-walking interpreter.
//!
//! Executes the instantiated parse tree over a value stack. The host owns
//! an [`Interpreter`] handle; execution runs either on the caller thread
//! (`run`) or on one detached worker (`run_thread`) against a job that owns
//! deep clones of the compiled artefacts, so the host may keep editing.
//!
//! The host reads `status`, `error_code`, `error_node`, calls `stop()`, and
//! drains the message queue; the worker polls the directive at the top of
//! every statement.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::compiler::Compilation;
use crate::errors::ErrorCode;
use crate::link_pass::SymbolLinker;
use crate::matrix::Matrix;
use crate::message::{MessageQueue, OutputMessage};
use crate::ops::Op;
use crate::parse_tree::{ParseNode, ParseTree, NONE};
use crate::serial;
use crate::stack::Stack;
use crate::static_pass::{
    numeric_key, InstantiationLookup, NumericSwitchMap, StringSwitchMap,
};
use crate::value::{Algorithm, Closure, Lambda, Value};

// Host directives
pub const RUN: usize = 0;
pub const PAUSE: usize = 1;
pub const STOP: usize = 2;

// Status lattice, combined by bit-or
pub const NORMAL: usize = 0;
pub const CONTINUE: usize = 1;
pub const BREAK: usize = 3;
pub const RETURN: usize = 7;
pub const RUNTIME_ERROR: usize = 15;
pub const FINISHED: usize = usize::MAX;

const APPROX_TOL: f64 = 1e-7;
const DERIVATIVE_INCR: f64 = 1e-9;
const INTEGRAL_STEPS: usize = 50;

struct Shared {
    directive: AtomicUsize,
    status: AtomicUsize,
    error: Mutex<(ErrorCode, ParseNode)>,
}

/// Everything the executor needs, cloned out of the compilation so the
/// host-side artefacts stay editable.
pub struct RunJob {
    pub parse_tree: ParseTree,
    pub symbol_table: crate::symbol_table::SymbolTable,
    pub inst_lookup: InstantiationLookup,
    pub number_switch: NumericSwitchMap,
    pub string_switch: StringSwitchMap,
}

impl RunJob {
    pub fn from_compilation(compilation: &Compilation) -> Self {
        RunJob {
            parse_tree: compilation.parse_tree.clone(),
            symbol_table: compilation.symbol_table.clone(),
            inst_lookup: compilation.instantiation_lookup.clone(),
            number_switch: compilation.number_switch.clone(),
            string_switch: compilation.string_switch.clone(),
        }
    }
}

pub struct Interpreter {
    shared: Arc<Shared>,
    pub message_queue: MessageQueue,
}

impl Interpreter {
    pub fn new() -> Self {
        Interpreter {
            shared: Arc::new(Shared {
                directive: AtomicUsize::new(RUN),
                status: AtomicUsize::new(NORMAL),
                error: Mutex::new((ErrorCode::NoErrorFound, NONE)),
            }),
            message_queue: MessageQueue::new(),
        }
    }

    pub fn status(&self) -> usize {
        self.shared.status.load(Ordering::SeqCst)
    }

    pub fn error_code(&self) -> ErrorCode {
        self.shared.error.lock().unwrap().0
    }

    pub fn error_node(&self) -> ParseNode {
        self.shared.error.lock().unwrap().1
    }

    pub fn finished(&self) -> bool {
        matches!(self.status(), FINISHED | RUNTIME_ERROR)
    }

    /// Ask the running program to stop; it notices at the next statement.
    pub fn stop(&self) {
        self.shared.directive.store(STOP, Ordering::SeqCst);
    }

    /// Suspend at the next statement boundary until `resume` or `stop`.
    pub fn pause(&self) {
        let _ = self.shared.directive.compare_exchange(
            RUN,
            PAUSE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn resume(&self) {
        let _ = self.shared.directive.compare_exchange(
            PAUSE,
            RUN,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Execute on the caller thread.
    pub fn run(&self, mut job: RunJob) {
        self.reset();
        link_job(&mut job);
        let mut executor = Executor::new(&job, self.shared.clone(), self.message_queue.clone());
        executor.execute();
    }

    /// Execute on one detached worker thread. At most one worker exists per
    /// interpreter; the host polls `status` and drains the queue.
    pub fn run_thread(&self, mut job: RunJob) {
        self.reset();
        let shared = self.shared.clone();
        let queue = self.message_queue.clone();
        thread::spawn(move || {
            link_job(&mut job);
            let mut executor = Executor::new(&job, shared, queue);
            executor.execute();
        });
    }

    fn reset(&self) {
        self.shared.directive.store(RUN, Ordering::SeqCst);
        self.shared.status.store(NORMAL, Ordering::SeqCst);
        *self.shared.error.lock().unwrap() = (ErrorCode::NoErrorFound, NONE);
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

fn link_job(job: &mut RunJob) {
    SymbolLinker::new(&mut job.parse_tree, &mut job.symbol_table).link();
    job.parse_tree.patch_clones();
}

/// Lanczos approximation of the gamma function.
fn gamma(x: f64) -> f64 {
    const G: f64 = 7.0;
    const COEFFS: [f64; 9] = [
        0.99999999999980993,
        676.5203681218851,
        -1259.1392167224028,
        771.32342877765313,
        -176.61502916214059,
        12.507343278686905,
        -0.13857109526572012,
        9.9843695780195716e-6,
        1.5056327351493116e-7,
    ];
    if x < 0.5 {
        std::f64::consts::PI / ((std::f64::consts::PI * x).sin() * gamma(1.0 - x))
    } else {
        let x = x - 1.0;
        let mut acc = COEFFS[0];
        for (i, &c) in COEFFS.iter().enumerate().skip(1) {
            acc += c / (x + i as f64);
        }
        let t = x + G + 0.5;
        (2.0 * std::f64::consts::PI).sqrt() * t.powf(x + 0.5) * (-t).exp() * acc
    }
}

#[derive(Clone, Copy)]
struct Slice {
    start: isize,
    len: usize,
    step: isize,
}

struct Executor<'j> {
    parse_tree: &'j ParseTree,
    inst_lookup: &'j InstantiationLookup,
    number_switch: &'j NumericSwitchMap,
    string_switch: &'j StringSwitchMap,
    shared: Arc<Shared>,
    messages: MessageQueue,
    stack: Stack,
    frames: Vec<usize>,
    active_closure: Option<Closure>,
    status: usize,
    error_code: ErrorCode,
    error_node: ParseNode,
}

impl<'j> Executor<'j> {
    fn new(job: &'j RunJob, shared: Arc<Shared>, messages: MessageQueue) -> Self {
        Executor {
            parse_tree: &job.parse_tree,
            inst_lookup: &job.inst_lookup,
            number_switch: &job.number_switch,
            string_switch: &job.string_switch,
            shared,
            messages,
            stack: Stack::new(),
            frames: Vec::new(),
            active_closure: None,
            status: NORMAL,
            error_code: ErrorCode::NoErrorFound,
            error_node: NONE,
        }
    }

    fn execute(&mut self) {
        let root = self.parse_tree.root;
        self.block_stmt(root);

        let final_status = if self.error_code != ErrorCode::NoErrorFound {
            RUNTIME_ERROR
        } else {
            FINISHED
        };
        *self.shared.error.lock().unwrap() = (self.error_code, self.error_node);
        self.shared.status.store(final_status, Ordering::SeqCst);
    }

    fn error(&mut self, code: ErrorCode, pn: ParseNode) -> Value {
        if self.status < RUNTIME_ERROR {
            self.shared.directive.store(STOP, Ordering::SeqCst);
            self.error_code = code;
            self.error_node = pn;
        }
        self.status = RUNTIME_ERROR;
        Value::RuntimeError(code)
    }

    // Statements ------------------------------------------------------------

    fn interpret_stmt(&mut self, pn: ParseNode) {
        loop {
            match self.shared.directive.load(Ordering::Relaxed) {
                STOP => {
                    if self.error_code == ErrorCode::NoErrorFound {
                        self.error_code = ErrorCode::UserStop;
                        self.error_node = self.parse_tree.root;
                    }
                    self.status = RUNTIME_ERROR;
                    return;
                }
                PAUSE => std::thread::yield_now(),
                _ => break,
            }
        }

        match self.parse_tree.op(pn) {
            Op::Algorithm => self.algorithm_stmt(pn),
            Op::Assert => self.assert_stmt(pn),
            Op::Assign | Op::Equal => self.assign_stmt(pn),
            Op::Block => self.block_stmt(pn),
            Op::Break => self.status |= BREAK,
            Op::Continue => self.status |= CONTINUE,
            Op::DoNothing | Op::Class | Op::Enum | Op::PrototypeAlg | Op::UnknownList
            | Op::FileRef => {}
            Op::ElementwiseAssignment => self.elementwise_assignment(pn),
            Op::ExprStmt => self.call_stmt(self.parse_tree.child(pn)),
            Op::For => self.for_stmt(pn),
            Op::If => self.if_stmt(pn),
            Op::IfElse => self.if_else_stmt(pn),
            Op::Import | Op::FromImport => {
                let body = self.parse_tree.flag(pn);
                if body != NONE {
                    self.interpret_stmt(body);
                }
            }
            Op::Namespace => self.block_stmt(self.parse_tree.rhs(pn)),
            Op::Plot => self.plot_stmt(pn),
            Op::Print => self.print_stmt(pn),
            Op::RangedFor => self.ranged_for_stmt(pn),
            Op::Reassign => {
                let lhs = self.parse_tree.lhs(pn);
                let rhs = self.parse_tree.rhs(pn);
                self.reassign(lhs, rhs);
            }
            Op::Return | Op::ReturnEmpty => self.return_stmt(pn),
            Op::SwitchNumeric => self.switch_stmt_numeric(pn),
            Op::SwitchString => self.switch_stmt_string(pn),
            Op::While => self.while_stmt(pn),
            _ => {
                self.error(ErrorCode::UnrecognizedStmt, pn);
            }
        }
    }

    fn block_stmt(&mut self, pn: ParseNode) {
        let mut i = 0;
        while i < self.parse_tree.num_args(pn) && self.status == NORMAL {
            self.interpret_stmt(self.parse_tree.arg(pn, i));
            i += 1;
        }
    }

    fn print_stmt(&mut self, pn: ParseNode) {
        let mut i = 0;
        while i < self.parse_tree.num_args(pn) && self.status == NORMAL {
            self.print_node(self.parse_tree.arg(pn, i));
            i += 1;
        }
    }

    fn assert_stmt(&mut self, pn: ParseNode) {
        let child = self.parse_tree.child(pn);
        if !self.evaluate_condition(child) && self.status < RUNTIME_ERROR {
            self.error(ErrorCode::AssertFail, child);
        }
    }

    fn assign_stmt(&mut self, pn: ParseNode) {
        let lhs = self.parse_tree.lhs(pn);
        let rhs = self.parse_tree.rhs(pn);
        let value = self.interpret_expr(rhs);

        if self.parse_tree.op(lhs) == Op::ReadUpvalue {
            self.write_upvalue(lhs, value);
        } else {
            self.stack.push(value);
        }
    }

    fn while_stmt(&mut self, pn: ParseNode) {
        while self.status <= CONTINUE && self.evaluate_condition(self.parse_tree.arg(pn, 0)) {
            self.status = NORMAL;
            let stack_size = self.stack.len();
            self.interpret_stmt(self.parse_tree.arg(pn, 1));
            if self.status < RETURN {
                self.stack.trim(stack_size);
            }
        }
        if self.status == BREAK || self.status == CONTINUE {
            self.status = NORMAL;
        }
    }

    fn for_stmt(&mut self, pn: ParseNode) {
        let stack_size = self.stack.len();
        self.interpret_stmt(self.parse_tree.arg(pn, 0));

        while self.status <= CONTINUE && self.evaluate_condition(self.parse_tree.arg(pn, 1)) {
            self.status = NORMAL;
            let inner_size = self.stack.len();
            self.interpret_stmt(self.parse_tree.arg(pn, 3));
            if self.status < RETURN {
                self.stack.trim(inner_size);
                self.interpret_stmt(self.parse_tree.arg(pn, 2));
            }
        }
        if self.status == BREAK || self.status == CONTINUE {
            self.status = NORMAL;
        }
        if self.status < RETURN {
            self.stack.trim(stack_size);
        }
    }

    fn ranged_for_stmt(&mut self, pn: ParseNode) {
        let iterable = self.interpret_expr(self.parse_tree.arg(pn, 1));
        let stack_size = self.stack.len();

        match iterable {
            Value::Double(x) => {
                // A scalar iterates once, bound to its own value
                self.stack.push(Value::Double(x));
                self.interpret_stmt(self.parse_tree.arg(pn, 2));
            }
            Value::Matrix(mat) => {
                if !mat.is_vector() {
                    self.error(ErrorCode::RuntimeDimensionMismatch, self.parse_tree.arg(pn, 1));
                    return;
                }
                self.stack.push(Value::Double(0.0));
                let mut i = 0;
                while i < mat.size() && self.status <= CONTINUE {
                    self.status = NORMAL;
                    *self.stack.back_mut() = Value::Double(mat.linear(i));
                    self.interpret_stmt(self.parse_tree.arg(pn, 2));
                    i += 1;
                }
            }
            Value::RuntimeError(_) => return,
            _ => {
                self.error(ErrorCode::RuntimeTypeError, self.parse_tree.arg(pn, 1));
                return;
            }
        }

        if self.status == BREAK || self.status == CONTINUE {
            self.status = NORMAL;
        }
        if self.status < RETURN {
            self.stack.trim(stack_size);
        }
    }

    fn if_stmt(&mut self, pn: ParseNode) {
        if self.status == NORMAL && self.evaluate_condition(self.parse_tree.arg(pn, 0)) {
            let stack_size = self.stack.len();
            self.interpret_stmt(self.parse_tree.arg(pn, 1));
            if self.status < RETURN {
                self.stack.trim(stack_size);
            }
        }
    }

    fn if_else_stmt(&mut self, pn: ParseNode) {
        if self.status != NORMAL {
            return;
        }
        let branch = if self.evaluate_condition(self.parse_tree.arg(pn, 0)) {
            self.parse_tree.arg(pn, 1)
        } else {
            self.parse_tree.arg(pn, 2)
        };
        if self.status == NORMAL {
            let stack_size = self.stack.len();
            self.interpret_stmt(branch);
            if self.status < RETURN {
                self.stack.trim(stack_size);
            }
        }
    }

    fn switch_stmt_numeric(&mut self, pn: ParseNode) {
        let key = match self.interpret_expr(self.parse_tree.arg(pn, 0)) {
            Value::Double(x) => x,
            Value::RuntimeError(_) => return,
            _ => {
                self.error(ErrorCode::RuntimeTypeError, pn);
                return;
            }
        };
        let codepath = match self.number_switch.get(&(pn, numeric_key(key))) {
            Some(&path) => path,
            None => {
                let default_node = self.parse_tree.flag(pn);
                if default_node != NONE {
                    self.parse_tree.rhs(default_node)
                } else {
                    NONE
                }
            }
        };
        if codepath != NONE {
            self.interpret_stmt(codepath);
        }
        if self.status == BREAK || self.status == CONTINUE {
            self.status = NORMAL;
        }
    }

    fn switch_stmt_string(&mut self, pn: ParseNode) {
        let key = match self.interpret_expr(self.parse_tree.arg(pn, 0)) {
            Value::Str(s) => s,
            Value::RuntimeError(_) => return,
            _ => {
                self.error(ErrorCode::RuntimeTypeError, pn);
                return;
            }
        };
        let codepath = match self.string_switch.get(&(pn, key)) {
            Some(&path) => path,
            None => {
                let default_node = self.parse_tree.flag(pn);
                if default_node != NONE {
                    self.parse_tree.rhs(default_node)
                } else {
                    NONE
                }
            }
        };
        if codepath != NONE {
            self.interpret_stmt(codepath);
        }
        if self.status == BREAK || self.status == CONTINUE {
            self.status = NORMAL;
        }
    }

    fn algorithm_stmt(&mut self, pn: ParseNode) {
        let val_cap = self.parse_tree.val_cap_list(pn);
        let ref_cap = self.parse_tree.ref_cap_list(pn);
        let closure = self.init_closure(val_cap, ref_cap);
        self.stack.push(Value::Algorithm(Algorithm { def: pn, closure }));
    }

    fn init_closure(&mut self, val_cap: ParseNode, ref_cap: ParseNode) -> Closure {
        let mut closure = Closure::new();

        let n_vals = self.parse_tree.val_list_size(val_cap);
        for i in 0..n_vals {
            let capture = self.parse_tree.arg(val_cap, i);
            let value = self.read_value(capture);
            closure.push(Value::new_cell(value));
        }

        if ref_cap != NONE {
            for i in 0..self.parse_tree.num_args(ref_cap) {
                let up = self.parse_tree.arg(ref_cap, i);
                match self.parse_tree.op(up) {
                    // Declared in this scope: a fresh heap cell
                    Op::Identifier => closure.push(Value::new_cell(Value::Uninitialised)),
                    // Passed through from the enclosing closure
                    Op::ReadUpvalue => {
                        let index = self.parse_tree.flag(up);
                        let cell = self
                            .active_closure
                            .as_ref()
                            .expect("enclosing closure present")[index]
                            .clone();
                        closure.push(cell);
                    }
                    _ => {}
                }
            }
        }

        closure
    }

    /// Replace this activation's locally-created cells with fresh copies so
    /// mutations inside the callee do not alias previous activations.
    fn break_local_closure_links(
        &mut self,
        closure: &mut Closure,
        val_cap: ParseNode,
        ref_cap: ParseNode,
    ) {
        let val_cap_size = self.parse_tree.val_list_size(val_cap);
        for cell in closure.iter_mut().take(val_cap_size) {
            let copy = cell.borrow().clone();
            *cell = Value::new_cell(copy);
        }
        if ref_cap != NONE {
            for i in 0..self.parse_tree.num_args(ref_cap) {
                if self.parse_tree.op(self.parse_tree.arg(ref_cap, i)) == Op::Identifier {
                    let j = val_cap_size + i;
                    let copy = closure[j].borrow().clone();
                    closure[j] = Value::new_cell(copy);
                }
            }
        }
    }

    fn return_stmt(&mut self, pn: ParseNode) {
        let value = if self.parse_tree.op(pn) == Op::Return {
            self.interpret_expr(self.parse_tree.child(pn))
        } else {
            Value::Uninitialised
        };
        self.status |= RETURN;
        self.stack.push(value);
    }

    fn plot_stmt(&mut self, pn: ParseNode) {
        let title = self.interpret_expr(self.parse_tree.arg(pn, 0));
        let x_label = self.interpret_expr(self.parse_tree.arg(pn, 1));
        let x = self.interpret_expr(self.parse_tree.arg(pn, 2));
        let y_label = self.interpret_expr(self.parse_tree.arg(pn, 3));
        let y = self.interpret_expr(self.parse_tree.arg(pn, 4));

        if self.status != NORMAL {
            return;
        }

        let (Value::Str(title), Value::Str(x_label), Value::Str(y_label)) =
            (title, x_label, y_label)
        else {
            self.error(ErrorCode::RuntimeTypeError, pn);
            return;
        };

        let data: Vec<(f64, f64)> = match (x, y) {
            (Value::Double(a), Value::Double(b)) => vec![(a, b)],
            (Value::Matrix(a), Value::Matrix(b)) => {
                if !a.same_shape(&b) || !a.is_vector() {
                    self.error(ErrorCode::RuntimeDimensionMismatch, pn);
                    return;
                }
                (0..a.size()).map(|i| (a.linear(i), b.linear(i))).collect()
            }
            _ => {
                self.error(ErrorCode::RuntimeDimensionMismatch, pn);
                return;
            }
        };

        self.messages.enqueue(OutputMessage::PlotCreate {
            title,
            x_label,
            y_label,
        });
        self.messages
            .enqueue(OutputMessage::PlotDiscreteSeries { data });
    }

    // Reads and writes ------------------------------------------------------

    fn read_value(&mut self, pn: ParseNode) -> Value {
        match self.parse_tree.op(pn) {
            Op::Identifier => self.read_local(pn),
            Op::ReadGlobal => self.read_global(pn),
            Op::ReadUpvalue => self.read_upvalue(pn),
            _ => self.error(ErrorCode::RuntimeTypeError, pn),
        }
    }

    fn read_local(&mut self, pn: ParseNode) -> Value {
        let offset = self.parse_tree.flag(pn);
        if offset >= self.stack.len() {
            return self.error(ErrorCode::UseBeforeDefine, pn);
        }
        let index = self.stack.from_top(offset);
        self.stack.read(index).clone()
    }

    fn read_global(&mut self, pn: ParseNode) -> Value {
        let index = self.parse_tree.flag(pn);
        if index >= self.stack.len() {
            return self.error(ErrorCode::UseBeforeDefine, pn);
        }
        self.stack.read(index).clone()
    }

    fn read_upvalue(&mut self, pn: ParseNode) -> Value {
        let index = self.parse_tree.flag(pn);
        match &self.active_closure {
            Some(closure) if index < closure.len() => closure[index].borrow().clone(),
            _ => self.error(ErrorCode::UseBeforeDefine, pn),
        }
    }

    fn write_value(&mut self, pn: ParseNode, value: Value) {
        match self.parse_tree.op(pn) {
            Op::Identifier => {
                let offset = self.parse_tree.flag(pn);
                if offset >= self.stack.len() {
                    self.error(ErrorCode::UseBeforeDefine, pn);
                    return;
                }
                let index = self.stack.from_top(offset);
                *self.stack.read_mut(index) = value;
            }
            Op::ReadGlobal => {
                let index = self.parse_tree.flag(pn);
                if index >= self.stack.len() {
                    self.error(ErrorCode::UseBeforeDefine, pn);
                    return;
                }
                *self.stack.read_mut(index) = value;
            }
            Op::ReadUpvalue => self.write_upvalue(pn, value),
            _ => {
                self.error(ErrorCode::RuntimeTypeError, pn);
            }
        }
    }

    fn write_upvalue(&mut self, pn: ParseNode, value: Value) {
        let index = self.parse_tree.flag(pn);
        match &self.active_closure {
            Some(closure) if index < closure.len() => {
                *closure[index].borrow_mut() = value;
            }
            _ => {
                self.error(ErrorCode::UseBeforeDefine, pn);
            }
        }
    }

    fn reassign(&mut self, lhs: ParseNode, rhs: ParseNode) {
        if self.parse_tree.op(lhs) == Op::SubscriptAccess {
            self.reassign_subscript(lhs, rhs);
            return;
        }

        let new_value = self.interpret_expr(rhs);
        if new_value.is_error() {
            return;
        }
        let old_value = self.read_value(lhs);
        if !old_value.same_kind(&new_value) && !matches!(old_value, Value::Uninitialised) {
            self.error(ErrorCode::RuntimeDimensionMismatch, rhs);
            return;
        }
        self.write_value(lhs, new_value);
    }

    fn reassign_subscript(&mut self, lhs: ParseNode, rhs: ParseNode) {
        let num_indices = self.parse_tree.num_args(lhs) - 1;
        let rvalue = self.interpret_expr(rhs);
        let target_node = self.parse_tree.arg(lhs, 0);
        let target = self.read_value(target_node);

        match target {
            Value::Double(_) => {
                if !matches!(rvalue, Value::Double(_)) {
                    self.error(ErrorCode::RuntimeTypeError, rhs);
                    return;
                }
                let mut i = 1;
                while i <= num_indices && self.status == NORMAL {
                    self.read_slice(self.parse_tree.arg(lhs, i), 1);
                    i += 1;
                }
                if self.status == NORMAL {
                    self.write_value(target_node, rvalue);
                }
            }
            Value::Matrix(mut lmat) => {
                let rmat = match rvalue {
                    Value::Double(x) => Matrix::from_vec(1, 1, vec![x]),
                    Value::Matrix(m) => m,
                    _ => {
                        self.error(ErrorCode::RuntimeTypeError, rhs);
                        return;
                    }
                };

                if num_indices == 1 {
                    if !lmat.is_vector() {
                        self.error(ErrorCode::RuntimeTypeError, rhs);
                        return;
                    }
                    let index_node = self.parse_tree.arg(lhs, 1);
                    let Some(slice) = self.read_slice(index_node, lmat.size()) else {
                        return;
                    };
                    if slice.len != rmat.size() {
                        self.error(ErrorCode::RuntimeDimensionMismatch, rhs);
                        return;
                    }
                    let mut pos = slice.start;
                    for k in 0..slice.len {
                        *lmat.linear_mut(pos as usize) = rmat.linear(k);
                        pos += slice.step;
                    }
                    self.write_value(target_node, Value::Matrix(lmat));
                } else if num_indices == 2 {
                    let row_node = self.parse_tree.arg(lhs, 1);
                    let Some(rows) = self.read_slice(row_node, lmat.rows()) else {
                        return;
                    };
                    let col_node = self.parse_tree.arg(lhs, 2);
                    let Some(cols) = self.read_slice(col_node, lmat.cols()) else {
                        return;
                    };
                    if rows.len != rmat.rows() || cols.len != rmat.cols() {
                        self.error(ErrorCode::RuntimeDimensionMismatch, rhs);
                        return;
                    }
                    let mut r = rows.start;
                    for i in 0..rows.len {
                        let mut c = cols.start;
                        for j in 0..cols.len {
                            *lmat.at_mut(r as usize, c as usize) = rmat.at(i, j);
                            c += cols.step;
                        }
                        r += rows.step;
                    }
                    self.write_value(target_node, Value::Matrix(lmat));
                } else {
                    self.error(ErrorCode::IndexOutOfRange, lhs);
                }
            }
            Value::RuntimeError(_) => {}
            _ => {
                self.error(ErrorCode::RuntimeTypeError, lhs);
            }
        }
    }

    fn elementwise_assignment(&mut self, pn: ParseNode) {
        let lhs = self.parse_tree.lhs(pn);
        let rhs = self.parse_tree.rhs(pn);

        let num_subscripts = self.parse_tree.num_args(lhs) - 1;
        let target_node = self.parse_tree.arg(lhs, 0);
        let target = self.read_value(target_node);

        let Value::Matrix(mut lmat) = target else {
            if let Value::Double(_) = target {
                // Scalar target: the loop collapses to a single assignment
                self.stack.push(Value::Double(0.0));
                let rvalue = self.interpret_expr(rhs);
                self.stack.pop();
                if self.status == NORMAL {
                    self.write_value(target_node, rvalue);
                }
            }
            return;
        };

        if num_subscripts == 1 {
            if !lmat.is_vector() {
                self.error(ErrorCode::RuntimeDimensionMismatch, lhs);
                return;
            }
            self.stack.push(Value::Double(0.0));
            for i in 0..lmat.size() {
                *self.stack.back_mut() = Value::Double(i as f64);
                let rvalue = self.interpret_expr(rhs);
                match rvalue {
                    Value::Double(x) => *lmat.linear_mut(i) = x,
                    _ => {
                        self.error(ErrorCode::RuntimeTypeError, rhs);
                        return;
                    }
                }
            }
            self.stack.pop();
            self.write_value(target_node, Value::Matrix(lmat));
            return;
        }

        let row_is_slice = self.parse_tree.op(self.parse_tree.arg(lhs, 1)) == Op::Slice;
        let col_is_slice = self.parse_tree.op(self.parse_tree.arg(lhs, 2)) == Op::Slice;

        if row_is_slice {
            // One free column index
            self.stack.push(Value::Double(0.0));
            for j in 0..lmat.cols() {
                *self.stack.back_mut() = Value::Double(j as f64);
                let rvalue = self.interpret_expr(rhs);
                match rvalue {
                    Value::Matrix(col) if col.cols() == 1 && col.rows() == lmat.rows() => {
                        for i in 0..lmat.rows() {
                            *lmat.at_mut(i, j) = col.at(i, 0);
                        }
                    }
                    Value::Double(x) if lmat.rows() == 1 => *lmat.at_mut(0, j) = x,
                    _ => {
                        self.error(ErrorCode::RuntimeDimensionMismatch, rhs);
                        return;
                    }
                }
            }
            self.stack.pop();
        } else if col_is_slice {
            self.stack.push(Value::Double(0.0));
            for i in 0..lmat.rows() {
                *self.stack.back_mut() = Value::Double(i as f64);
                let rvalue = self.interpret_expr(rhs);
                match rvalue {
                    Value::Matrix(row) if row.rows() == 1 && row.cols() == lmat.cols() => {
                        for j in 0..lmat.cols() {
                            *lmat.at_mut(i, j) = row.at(0, j);
                        }
                    }
                    Value::Double(x) if lmat.cols() == 1 => *lmat.at_mut(i, 0) = x,
                    _ => {
                        self.error(ErrorCode::RuntimeDimensionMismatch, rhs);
                        return;
                    }
                }
            }
            self.stack.pop();
        } else {
            self.stack.push(Value::Double(0.0));
            self.stack.push(Value::Double(0.0));
            for i in 0..lmat.rows() {
                let second = self.stack.len() - 2;
                *self.stack.read_mut(second) = Value::Double(i as f64);
                for j in 0..lmat.cols() {
                    *self.stack.back_mut() = Value::Double(j as f64);
                    let rvalue = self.interpret_expr(rhs);
                    match rvalue {
                        Value::Double(x) => *lmat.at_mut(i, j) = x,
                        _ => {
                            self.error(ErrorCode::RuntimeTypeError, rhs);
                            return;
                        }
                    }
                }
            }
            self.stack.pop();
            self.stack.pop();
        }
        self.write_value(target_node, Value::Matrix(lmat));
    }

    // Expressions -----------------------------------------------------------

    fn evaluate_condition(&mut self, pn: ParseNode) -> bool {
        let value = self.interpret_expr(pn);
        if self.error_code != ErrorCode::NoErrorFound {
            return false;
        }
        match value {
            Value::Bool(b) => b,
            _ => {
                self.error(ErrorCode::RuntimeTypeError, pn);
                false
            }
        }
    }

    fn read_double(&mut self, pn: ParseNode) -> Option<f64> {
        match self.interpret_expr(pn) {
            Value::Double(x) => Some(x),
            Value::RuntimeError(_) => None,
            _ => {
                self.error(ErrorCode::RuntimeTypeError, pn);
                None
            }
        }
    }

    fn interpret_expr(&mut self, pn: ParseNode) -> Value {
        use std::f64::consts;
        match self.parse_tree.op(pn) {
            Op::IntegerLiteral | Op::DecimalLiteral => Value::Double(self.parse_tree.double(pn)),
            Op::True => Value::Bool(true),
            Op::False => Value::Bool(false),
            Op::StringLiteral => Value::Str(self.string_content(pn)),
            Op::Infinity => Value::Double(f64::INFINITY),
            Op::Pi => Value::Double(consts::PI),
            Op::EulersNumber => Value::Double(consts::E),
            Op::GoldenRatio => Value::Double(1.618_033_988_749_894_8),
            Op::SpeedOfLight => Value::Double(299_792_458.0),
            Op::PlanckConstant => Value::Double(6.626_070_15e-34),
            Op::ReducedPlanckConstant => Value::Double(1.054_571_817e-34),
            Op::StefanBoltzmannConstant => Value::Double(5.670_374_419e-8),
            Op::Gravity => Value::Double(9.80665),
            Op::CurrencyPounds | Op::CurrencyEuros | Op::CurrencyDollars => Value::Double(1.0),

            Op::Identifier => self.read_local(pn),
            Op::ReadGlobal => self.read_global(pn),
            Op::ReadUpvalue => self.read_upvalue(pn),
            Op::SingleCharMultProxy => {
                let mult = self.parse_tree.flag(pn);
                self.interpret_expr(mult)
            }

            Op::GroupParen | Op::GroupBracket => self.interpret_expr(self.parse_tree.child(pn)),

            Op::Addition | Op::Subtraction | Op::Multiplication | Op::Division
            | Op::Forwardslash | Op::Modulus | Op::EntrywiseProduct | Op::Cross | Op::Dot
            | Op::OuterProduct | Op::Power => {
                let lhs = self.interpret_expr(self.parse_tree.lhs(pn));
                let rhs = self.interpret_expr(self.parse_tree.rhs(pn));
                self.binary_dispatch(self.parse_tree.op(pn), lhs, rhs, pn)
            }

            Op::LinearSolve => {
                let a = self.interpret_expr(self.parse_tree.lhs(pn));
                let b = self.interpret_expr(self.parse_tree.rhs(pn));
                match (a, b) {
                    (Value::Matrix(a), Value::Matrix(b)) => match a.solve(&b) {
                        Some(x) => Value::Matrix(x),
                        None => self.error(ErrorCode::RuntimeDimensionMismatch, pn),
                    },
                    (Value::Double(a), Value::Double(b)) => Value::Double(b / a),
                    (Value::RuntimeError(code), _) | (_, Value::RuntimeError(code)) => {
                        Value::RuntimeError(code)
                    }
                    _ => self.error(ErrorCode::RuntimeTypeError, pn),
                }
            }

            Op::UnaryMinus => match self.interpret_expr(self.parse_tree.child(pn)) {
                Value::Double(x) => Value::Double(-x),
                Value::Matrix(m) => Value::Matrix(m.neg()),
                Value::RuntimeError(code) => Value::RuntimeError(code),
                _ => self.error(ErrorCode::RuntimeTypeError, pn),
            },

            Op::LogicalNot => match self.interpret_expr(self.parse_tree.child(pn)) {
                Value::Bool(b) => Value::Bool(!b),
                Value::RuntimeError(code) => Value::RuntimeError(code),
                _ => self.error(ErrorCode::RuntimeTypeError, pn),
            },

            Op::LogicalAnd => {
                let lhs = self.evaluate_condition(self.parse_tree.lhs(pn));
                if self.status >= RUNTIME_ERROR {
                    return Value::RuntimeError(self.error_code);
                }
                if !lhs {
                    return Value::Bool(false);
                }
                Value::Bool(self.evaluate_condition(self.parse_tree.rhs(pn)))
            }
            Op::LogicalOr => {
                let lhs = self.evaluate_condition(self.parse_tree.lhs(pn));
                if self.status >= RUNTIME_ERROR {
                    return Value::RuntimeError(self.error_code);
                }
                if lhs {
                    return Value::Bool(true);
                }
                Value::Bool(self.evaluate_condition(self.parse_tree.rhs(pn)))
            }

            Op::Less => self.chain_compare(pn, false),
            Op::Greater => self.chain_compare(pn, true),

            Op::Equal | Op::NotEqual | Op::Approx | Op::NotApprox => {
                let lhs = self.interpret_expr(self.parse_tree.lhs(pn));
                let rhs = self.interpret_expr(self.parse_tree.rhs(pn));
                if lhs.is_error() || rhs.is_error() {
                    return Value::RuntimeError(self.error_code);
                }
                let approx = matches!(self.parse_tree.op(pn), Op::Approx | Op::NotApprox);
                let equal = self.values_equal(&lhs, &rhs, approx);
                let negate = matches!(self.parse_tree.op(pn), Op::NotEqual | Op::NotApprox);
                Value::Bool(equal != negate)
            }

            Op::Member | Op::NotMember => {
                let result = self.membership(pn);
                match (result, self.parse_tree.op(pn)) {
                    (Value::Bool(b), Op::NotMember) => Value::Bool(!b),
                    (v, _) => v,
                }
            }

            Op::Matrix => self.matrix_literal(pn),
            Op::Cases => self.cases(pn),
            Op::IdentityMatrix => Value::Matrix(Matrix::identity(self.parse_tree.rows(pn))),
            Op::ZeroMatrix => {
                Value::Matrix(Matrix::new(self.parse_tree.rows(pn), self.parse_tree.cols(pn)))
            }
            Op::OnesMatrix => Value::Matrix(Matrix::ones(
                self.parse_tree.rows(pn),
                self.parse_tree.cols(pn),
            )),
            Op::UnitVector => self.unit_vector(pn),

            Op::Transpose => match self.interpret_expr(self.parse_tree.child(pn)) {
                Value::Matrix(m) => Value::Matrix(m.transpose()),
                Value::Double(x) => Value::Double(x),
                Value::RuntimeError(code) => Value::RuntimeError(code),
                _ => self.error(ErrorCode::RuntimeTypeError, pn),
            },
            Op::Adjoint => match self.interpret_expr(self.parse_tree.child(pn)) {
                Value::Matrix(m) => Value::Matrix(m.transpose()),
                Value::Double(x) => Value::Double(x),
                Value::RuntimeError(code) => Value::RuntimeError(code),
                _ => self.error(ErrorCode::RuntimeTypeError, pn),
            },
            Op::PseudoInverse => match self.interpret_expr(self.parse_tree.child(pn)) {
                Value::Matrix(m) => match m.pseudo_inverse() {
                    Some(p) => Value::Matrix(p),
                    None => self.error(ErrorCode::RuntimeDimensionMismatch, pn),
                },
                Value::Double(x) => Value::Double(1.0 / x),
                Value::RuntimeError(code) => Value::RuntimeError(code),
                _ => self.error(ErrorCode::RuntimeTypeError, pn),
            },
            Op::Invert => match self.interpret_expr(self.parse_tree.child(pn)) {
                Value::Matrix(m) => match m.inverse() {
                    Some(inv) => Value::Matrix(inv),
                    None => self.error(ErrorCode::RuntimeDimensionMismatch, pn),
                },
                Value::Double(x) => Value::Double(1.0 / x),
                Value::RuntimeError(code) => Value::RuntimeError(code),
                _ => self.error(ErrorCode::RuntimeTypeError, pn),
            },

            Op::Abs => match self.interpret_expr(self.parse_tree.child(pn)) {
                Value::Double(x) => Value::Double(x.abs()),
                Value::Matrix(m) => match m.determinant() {
                    Some(d) => Value::Double(d),
                    None => self.error(ErrorCode::RuntimeDimensionMismatch, pn),
                },
                Value::RuntimeError(code) => Value::RuntimeError(code),
                _ => self.error(ErrorCode::RuntimeTypeError, pn),
            },
            Op::Norm => self.norm(pn, |m| m.norm_l2()),
            Op::Norm1 => self.norm(pn, |m| m.norm_l1()),
            Op::NormInfinity => self.norm(pn, |m| m.norm_linf()),
            Op::NormSquared => self.norm(pn, |m| m.norm_squared()),
            Op::NormP => {
                let Some(p) = self.read_double(self.parse_tree.rhs(pn)) else {
                    return Value::RuntimeError(self.error_code);
                };
                match self.interpret_expr(self.parse_tree.child(pn)) {
                    Value::Matrix(m) => Value::Double(m.norm_p(p)),
                    Value::Double(x) => Value::Double(x.abs()),
                    Value::RuntimeError(code) => Value::RuntimeError(code),
                    _ => self.error(ErrorCode::RuntimeTypeError, pn),
                }
            }

            Op::AccentHat => match self.interpret_expr(self.parse_tree.child(pn)) {
                Value::Matrix(m) => {
                    let result = if m.is_vector() { m.hat() } else { m.vee() };
                    match result {
                        Some(out) => Value::Matrix(out),
                        None => self.error(ErrorCode::RuntimeDimensionMismatch, pn),
                    }
                }
                Value::RuntimeError(code) => Value::RuntimeError(code),
                _ => self.error(ErrorCode::RuntimeTypeError, pn),
            },
            Op::AccentBar => self.interpret_expr(self.parse_tree.child(pn)),

            Op::Ceil => match self.read_double(self.parse_tree.child(pn)) {
                Some(x) => Value::Double(x.ceil()),
                None => Value::RuntimeError(self.error_code),
            },
            Op::Floor => match self.read_double(self.parse_tree.child(pn)) {
                Some(x) => Value::Double(x.floor()),
                None => Value::RuntimeError(self.error_code),
            },

            Op::Sqrt => match self.read_double(self.parse_tree.child(pn)) {
                Some(x) => Value::Double(x.sqrt()),
                None => Value::RuntimeError(self.error_code),
            },
            Op::NRoot => {
                let Some(degree) = self.read_double(self.parse_tree.lhs(pn)) else {
                    return Value::RuntimeError(self.error_code);
                };
                let Some(radicand) = self.read_double(self.parse_tree.rhs(pn)) else {
                    return Value::RuntimeError(self.error_code);
                };
                Value::Double(radicand.powf(1.0 / degree))
            }
            Op::LogBase => {
                let Some(x) = self.read_double(self.parse_tree.lhs(pn)) else {
                    return Value::RuntimeError(self.error_code);
                };
                let Some(base) = self.read_double(self.parse_tree.rhs(pn)) else {
                    return Value::RuntimeError(self.error_code);
                };
                Value::Double(x.ln() / base.ln())
            }
            Op::Arctangent2 => {
                let Some(y) = self.read_double(self.parse_tree.lhs(pn)) else {
                    return Value::RuntimeError(self.error_code);
                };
                let Some(x) = self.read_double(self.parse_tree.rhs(pn)) else {
                    return Value::RuntimeError(self.error_code);
                };
                Value::Double(y.atan2(x))
            }

            Op::InnerProduct => {
                let lhs = self.interpret_expr(self.parse_tree.lhs(pn));
                let rhs = self.interpret_expr(self.parse_tree.rhs(pn));
                self.binary_dispatch(Op::Dot, lhs, rhs, pn)
            }

            Op::Length => match self.interpret_expr(self.parse_tree.child(pn)) {
                Value::Matrix(m) => Value::Double(m.size() as f64),
                Value::Double(_) => Value::Double(1.0),
                Value::Str(s) => Value::Double(s.chars().count() as f64),
                Value::RuntimeError(code) => Value::RuntimeError(code),
                _ => self.error(ErrorCode::RuntimeTypeError, pn),
            },
            Op::RowsFn => match self.interpret_expr(self.parse_tree.child(pn)) {
                Value::Matrix(m) => Value::Double(m.rows() as f64),
                Value::Double(_) => Value::Double(1.0),
                Value::RuntimeError(code) => Value::RuntimeError(code),
                _ => self.error(ErrorCode::RuntimeTypeError, pn),
            },
            Op::ColsFn => match self.interpret_expr(self.parse_tree.child(pn)) {
                Value::Matrix(m) => Value::Double(m.cols() as f64),
                Value::Double(_) => Value::Double(1.0),
                Value::RuntimeError(code) => Value::RuntimeError(code),
                _ => self.error(ErrorCode::RuntimeTypeError, pn),
            },

            Op::Factorial => self.factorial(pn),
            Op::Binomial => self.binomial(pn),
            Op::GammaFunction => {
                // Call node rewritten by the static pass: [head, argument]
                match self.read_double(self.parse_tree.rhs(pn)) {
                    Some(x) => Value::Double(gamma(x)),
                    None => Value::RuntimeError(self.error_code),
                }
            }

            Op::Summation => self.big(pn, Op::Addition),
            Op::Product => self.big(pn, Op::Multiplication),
            Op::Derivative | Op::Partial => self.finite_difference(pn),
            Op::DefiniteIntegral => self.definite_integral(pn),
            Op::IntegerRange => self.integer_range(pn),

            Op::ImplicitMultiply => self.implicit_mult(pn, 0),
            Op::Call | Op::AmbiguousParenthetical => self.call(pn),
            Op::Lambda => self.anon_fun(pn),
            Op::SubscriptAccess => self.element_access(pn),

            _ => {
                if let Some(f) = self.parse_tree.op(pn).scalar_function() {
                    return match self.read_double(self.parse_tree.child(pn)) {
                        Some(x) => Value::Double(f(x)),
                        None => Value::RuntimeError(self.error_code),
                    };
                }
                self.error(ErrorCode::RuntimeTypeError, pn)
            }
        }
    }

    fn string_content(&self, pn: ParseNode) -> String {
        self.parse_tree.string(self.parse_tree.flag(pn)).to_string()
    }

    fn chain_compare(&mut self, pn: ParseNode, greater: bool) -> Value {
        let mask = self.parse_tree.flag(pn);
        let Some(mut left) = self.read_double(self.parse_tree.arg(pn, 0)) else {
            return Value::RuntimeError(self.error_code);
        };
        for i in 1..self.parse_tree.num_args(pn) {
            let Some(right) = self.read_double(self.parse_tree.arg(pn, i)) else {
                return Value::RuntimeError(self.error_code);
            };
            let inclusive = (mask >> (i - 1)) & 1 == 1;
            let holds = match (greater, inclusive) {
                (false, true) => left <= right,
                (false, false) => left < right,
                (true, true) => left >= right,
                (true, false) => left > right,
            };
            if !holds {
                return Value::Bool(false);
            }
            left = right;
        }
        Value::Bool(true)
    }

    fn values_equal(&self, lhs: &Value, rhs: &Value, approx: bool) -> bool {
        match (lhs, rhs) {
            (Value::Double(a), Value::Double(b)) => {
                if approx {
                    (a - b).abs() < APPROX_TOL
                } else {
                    a == b
                }
            }
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Matrix(a), Value::Matrix(b)) => {
                if approx {
                    a.approx_eq(b, APPROX_TOL)
                } else {
                    a == b
                }
            }
            _ => false,
        }
    }

    fn membership(&mut self, pn: ParseNode) -> Value {
        let Some(x) = self.read_double(self.parse_tree.lhs(pn)) else {
            return Value::RuntimeError(self.error_code);
        };
        let rhs = self.parse_tree.rhs(pn);
        let result = match self.parse_tree.op(rhs) {
            Op::Reals | Op::Rationals => x.is_finite(),
            Op::PositiveReals | Op::PositiveRationals => x.is_finite() && x > 0.0,
            Op::NegativeReals | Op::NegativeRationals => x.is_finite() && x < 0.0,
            Op::Integers => x.fract() == 0.0,
            Op::Naturals => x.fract() == 0.0 && x >= 0.0,
            Op::IntegerRange => {
                let Some(lo) = self.read_double(self.parse_tree.lhs(rhs)) else {
                    return Value::RuntimeError(self.error_code);
                };
                let Some(hi) = self.read_double(self.parse_tree.rhs(rhs)) else {
                    return Value::RuntimeError(self.error_code);
                };
                x.fract() == 0.0 && x >= lo && x <= hi
            }
            Op::IntervalCloseClose => {
                let Some(lo) = self.read_double(self.parse_tree.lhs(rhs)) else {
                    return Value::RuntimeError(self.error_code);
                };
                let Some(hi) = self.read_double(self.parse_tree.rhs(rhs)) else {
                    return Value::RuntimeError(self.error_code);
                };
                x >= lo && x <= hi
            }
            Op::IntervalCloseOpen => {
                let Some(lo) = self.read_double(self.parse_tree.lhs(rhs)) else {
                    return Value::RuntimeError(self.error_code);
                };
                let Some(hi) = self.read_double(self.parse_tree.rhs(rhs)) else {
                    return Value::RuntimeError(self.error_code);
                };
                x >= lo && x < hi
            }
            Op::SetLiteral => {
                let mut found = false;
                for i in 0..self.parse_tree.num_args(rhs) {
                    if let Some(member) = self.read_double(self.parse_tree.arg(rhs, i)) {
                        found |= member == x;
                    } else {
                        return Value::RuntimeError(self.error_code);
                    }
                }
                found
            }
            _ => return self.error(ErrorCode::RuntimeTypeError, rhs),
        };
        Value::Bool(result)
    }

    fn matrix_literal(&mut self, pn: ParseNode) -> Value {
        let nargs = self.parse_tree.num_args(pn);
        let typeset_rows = self.parse_tree.flag(pn);
        let typeset_cols = nargs / typeset_rows;

        let mut elements = Vec::with_capacity(nargs);
        let mut elem_rows = vec![0usize; typeset_rows];
        let mut elem_cols = vec![0usize; typeset_cols];

        for i in 0..typeset_rows {
            for j in 0..typeset_cols {
                let value = self.interpret_expr(self.parse_tree.arg(pn, i * typeset_cols + j));
                let (r, c) = match &value {
                    Value::Double(_) => (1, 1),
                    Value::Matrix(m) => (m.rows(), m.cols()),
                    Value::RuntimeError(code) => return Value::RuntimeError(*code),
                    _ => return self.error(ErrorCode::RuntimeTypeError, pn),
                };
                if i == 0 {
                    elem_cols[j] = c;
                } else if elem_cols[j] != c {
                    return self.error(ErrorCode::RuntimeDimensionMismatch, pn);
                }
                if j == 0 {
                    elem_rows[i] = r;
                } else if elem_rows[i] != r {
                    return self.error(ErrorCode::RuntimeDimensionMismatch, pn);
                }
                elements.push(value);
            }
        }

        let rows: usize = elem_rows.iter().sum();
        let cols: usize = elem_cols.iter().sum();
        let mut out = Matrix::new(rows, cols);

        let mut row = 0;
        for i in 0..typeset_rows {
            let mut col = 0;
            for j in 0..typeset_cols {
                match &elements[i * typeset_cols + j] {
                    Value::Double(x) => *out.at_mut(row, col) = *x,
                    Value::Matrix(m) => {
                        for r in 0..m.rows() {
                            for c in 0..m.cols() {
                                *out.at_mut(row + r, col + c) = m.at(r, c);
                            }
                        }
                    }
                    _ => unreachable!(),
                }
                col += elem_cols[j];
            }
            row += elem_rows[i];
        }

        Value::Matrix(out)
    }

    fn cases(&mut self, pn: ParseNode) -> Value {
        let mut i = 0;
        while i < self.parse_tree.num_args(pn) && self.status < RUNTIME_ERROR {
            if self.evaluate_condition(self.parse_tree.arg(pn, i + 1)) {
                return self.interpret_expr(self.parse_tree.arg(pn, i));
            }
            i += 2;
        }
        self.error(ErrorCode::EmptyCases, pn)
    }

    fn unit_vector(&mut self, pn: ParseNode) -> Value {
        let Some(elem) = self.read_double(self.parse_tree.unit_vector_elem(pn)) else {
            return Value::RuntimeError(self.error_code);
        };
        let Some(rows) = self.read_double(self.parse_tree.unit_vector_rows(pn)) else {
            return Value::RuntimeError(self.error_code);
        };
        let Some(cols) = self.read_double(self.parse_tree.unit_vector_cols(pn)) else {
            return Value::RuntimeError(self.error_code);
        };
        let (r, c, e) = (rows as usize, cols as usize, elem as usize);
        if (r > 1 && c > 1) || e >= r * c || elem < 0.0 {
            return self.error(ErrorCode::RuntimeDimensionMismatch, pn);
        }
        if r > 1 {
            Value::Matrix(Matrix::unit_vector(r, e, true))
        } else if c > 1 {
            Value::Matrix(Matrix::unit_vector(c, e, false))
        } else {
            Value::Double(1.0)
        }
    }

    fn integer_range(&mut self, pn: ParseNode) -> Value {
        let Some(lo) = self.read_double(self.parse_tree.lhs(pn)) else {
            return Value::RuntimeError(self.error_code);
        };
        let Some(hi) = self.read_double(self.parse_tree.rhs(pn)) else {
            return Value::RuntimeError(self.error_code);
        };
        if hi < lo {
            return self.error(ErrorCode::NonTerminatingSlice, pn);
        }
        let len = (hi - lo) as usize + 1;
        let data: Vec<f64> = (0..len).map(|i| lo + i as f64).collect();
        Value::Matrix(Matrix::from_vec(1, len, data))
    }

    fn norm(&mut self, pn: ParseNode, f: impl Fn(&Matrix) -> f64) -> Value {
        match self.interpret_expr(self.parse_tree.child(pn)) {
            Value::Matrix(m) => Value::Double(f(&m)),
            Value::Double(x) => Value::Double(x.abs()),
            Value::RuntimeError(code) => Value::RuntimeError(code),
            _ => self.error(ErrorCode::RuntimeTypeError, pn),
        }
    }

    fn factorial(&mut self, pn: ParseNode) -> Value {
        let value = self.interpret_expr(self.parse_tree.child(pn));
        let Value::Double(x) = value else {
            return self.error(ErrorCode::RuntimeTypeError, pn);
        };
        if x < 0.0 || x.fract() != 0.0 {
            return self.error(ErrorCode::ExpectPositiveInt, pn);
        }
        let n = x as u64;
        let limit = if usize::BITS == 64 { 20 } else { 12 };
        if n > limit {
            return self.error(ErrorCode::CalcOverflow, pn);
        }
        let mut acc: u64 = 1;
        for k in 2..=n {
            acc *= k;
        }
        Value::Double(acc as f64)
    }

    fn binomial(&mut self, pn: ParseNode) -> Value {
        let lhs = self.parse_tree.lhs(pn);
        let Some(n) = self.read_double(lhs) else {
            return Value::RuntimeError(self.error_code);
        };
        if n < 1.0 {
            return self.error(ErrorCode::ExpectNaturalNumber, lhs);
        }
        let rhs = self.parse_tree.rhs(pn);
        let Some(k) = self.read_double(rhs) else {
            return Value::RuntimeError(self.error_code);
        };
        if k < 0.0 {
            return self.error(ErrorCode::ExpectPositiveInt, rhs);
        }
        if k > n {
            return self.error(ErrorCode::BinomialKExceedsN, pn);
        }
        let (n, k) = (n as u64, k as u64);
        let mut result = 1.0;
        for i in 1..=k {
            result = result * (n - k + i) as f64 / i as f64;
        }
        Value::Double(result)
    }

    fn big(&mut self, pn: ParseNode, op: Op) -> Value {
        let assign = self.parse_tree.arg(pn, 0);
        let stop = self.parse_tree.arg(pn, 1);
        let body = self.parse_tree.arg(pn, 2);

        self.interpret_stmt(assign);
        if self.status >= RUNTIME_ERROR || self.stack.is_empty() {
            return Value::RuntimeError(self.error_code);
        }
        let Value::Double(start) = self.stack.back().clone() else {
            return self.error(ErrorCode::BigSymbolArg, assign);
        };
        let Some(stop_value) = self.read_double(stop) else {
            return self.error(ErrorCode::BigSymbolArg, stop);
        };
        let mut index = start as i64;
        let stop_index = stop_value as i64;
        if stop_index < index {
            return self.error(ErrorCode::BigSymbolRange, pn);
        }

        let mut accumulated = self.interpret_expr(body);
        while index < stop_index && self.status < RUNTIME_ERROR {
            index += 1;
            *self.stack.back_mut() = Value::Double(index as f64);
            let sample = self.interpret_expr(body);
            accumulated = self.binary_dispatch(op, accumulated, sample, pn);
        }

        self.stack.trim(self.stack.len() - 1);
        accumulated
    }

    /// Central-difference derivative with a fixed increment; vector
    /// evaluation points produce gradients column by column.
    fn finite_difference(&mut self, pn: ParseNode) -> Value {
        let point_node = self.parse_tree.arg(pn, 2);
        let point = self.interpret_expr(point_node);
        self.stack.push(point.clone());
        let expr = self.parse_tree.arg(pn, 0);
        let base = self.interpret_expr(expr);

        let result = match point {
            Value::Double(_) => {
                if let Value::Double(x) = self.stack.back().clone() {
                    *self.stack.back_mut() = Value::Double(x + DERIVATIVE_INCR);
                }
                let shifted = self.interpret_expr(expr);
                match (base, shifted) {
                    (Value::Double(f0), Value::Double(f1)) => {
                        Value::Double((f1 - f0) / DERIVATIVE_INCR)
                    }
                    (Value::Matrix(f0), Value::Matrix(f1)) => match f1.sub(&f0) {
                        Some(diff) => Value::Matrix(diff.scale(1.0 / DERIVATIVE_INCR)),
                        None => self.error(ErrorCode::RuntimeDimensionMismatch, pn),
                    },
                    _ => self.error(ErrorCode::RuntimeTypeError, pn),
                }
            }
            Value::Matrix(v) => {
                if v.cols() != 1 {
                    self.stack.pop();
                    return self.error(ErrorCode::RuntimeDimensionMismatch, point_node);
                }
                match base {
                    Value::Double(f0) => {
                        let mut grad = Matrix::new(1, v.rows());
                        for i in 0..v.rows() {
                            self.perturb(i, DERIVATIVE_INCR);
                            let shifted = self.interpret_expr(expr);
                            self.perturb(i, -DERIVATIVE_INCR);
                            match shifted {
                                Value::Double(f1) => {
                                    *grad.at_mut(0, i) = (f1 - f0) / DERIVATIVE_INCR
                                }
                                _ => {
                                    self.stack.pop();
                                    return self.error(ErrorCode::RuntimeTypeError, pn);
                                }
                            }
                        }
                        Value::Matrix(grad)
                    }
                    Value::Matrix(f0) => {
                        if f0.cols() != 1 {
                            self.stack.pop();
                            return self.error(ErrorCode::RuntimeDimensionMismatch, expr);
                        }
                        let mut jac = Matrix::new(f0.rows(), v.rows());
                        for i in 0..v.rows() {
                            self.perturb(i, DERIVATIVE_INCR);
                            let shifted = self.interpret_expr(expr);
                            self.perturb(i, -DERIVATIVE_INCR);
                            match shifted {
                                Value::Matrix(f1) if f1.same_shape(&f0) => {
                                    for r in 0..f0.rows() {
                                        *jac.at_mut(r, i) =
                                            (f1.at(r, 0) - f0.at(r, 0)) / DERIVATIVE_INCR;
                                    }
                                }
                                _ => {
                                    self.stack.pop();
                                    return self.error(ErrorCode::RuntimeTypeError, pn);
                                }
                            }
                        }
                        Value::Matrix(jac)
                    }
                    _ => self.error(ErrorCode::RuntimeTypeError, pn),
                }
            }
            Value::RuntimeError(code) => Value::RuntimeError(code),
            _ => self.error(ErrorCode::RuntimeTypeError, pn),
        };

        self.stack.pop();
        result
    }

    fn perturb(&mut self, index: usize, delta: f64) {
        if let Value::Matrix(m) = self.stack.back_mut() {
            *m.linear_mut(index) += delta;
        }
    }

    /// Midpoint rule over a fixed number of steps.
    fn definite_integral(&mut self, pn: ParseNode) -> Value {
        let Some(tf) = self.read_double(self.parse_tree.arg(pn, 1)) else {
            return Value::RuntimeError(self.error_code);
        };
        let Some(t0) = self.read_double(self.parse_tree.arg(pn, 2)) else {
            return Value::RuntimeError(self.error_code);
        };

        let dt = (tf - t0) / INTEGRAL_STEPS as f64;
        self.stack.push(Value::Double(t0 + dt / 2.0));

        let kernel = self.parse_tree.arg(pn, 3);
        let sample = self.interpret_expr(kernel);
        let mut accumulated = self.binary_dispatch(Op::Multiplication, Value::Double(dt), sample, kernel);

        for _ in 1..INTEGRAL_STEPS {
            if self.error_node != NONE {
                self.stack.pop();
                return Value::RuntimeError(self.error_code);
            }
            if let Value::Double(t) = self.stack.back().clone() {
                *self.stack.back_mut() = Value::Double(t + dt);
            }
            let sample = self.interpret_expr(kernel);
            let under_dt =
                self.binary_dispatch(Op::Multiplication, Value::Double(dt), sample, kernel);
            accumulated = self.binary_dispatch(Op::Addition, accumulated, under_dt, kernel);
        }

        self.stack.pop();
        accumulated
    }

    fn implicit_mult(&mut self, pn: ParseNode, start: usize) -> Value {
        let lhs_node = self.parse_tree.arg(pn, start);
        let lhs = self.interpret_expr(lhs_node);
        if start == self.parse_tree.num_args(pn) - 1 {
            return lhs;
        }
        let rhs = self.implicit_mult(pn, start + 1);
        if !lhs.is_function() {
            return self.binary_dispatch(Op::Multiplication, lhs, rhs, pn);
        }

        let stack_size = self.stack.len();
        let result = match lhs {
            Value::Lambda(lambda) => {
                let params = self.parse_tree.param_list(lambda.def);
                if self.parse_tree.num_args(params) != 1 {
                    return self.error(ErrorCode::InvalidArgs, lhs_node);
                }
                self.stack.push(rhs);
                self.interpret_expr(self.parse_tree.body(lambda.def))
            }
            Value::Algorithm(alg) => {
                self.stack.push(rhs);
                self.interpret_stmt(self.parse_tree.body(alg.def));
                self.stack.back().clone()
            }
            _ => Value::RuntimeError(self.error_code),
        };
        self.stack.trim(stack_size);
        result
    }

    fn anon_fun(&mut self, pn: ParseNode) -> Value {
        let ref_list = self.parse_tree.ref_cap_list(pn);
        let closure = self.init_closure(NONE, ref_list);
        Value::Lambda(Lambda { def: pn, closure })
    }

    fn call(&mut self, pn: ParseNode) -> Value {
        let callee = self.interpret_expr(self.parse_tree.arg(pn, 0));
        match callee {
            Value::Lambda(f) => {
                let mut closure = f.closure.clone();
                self.inner_call(pn, &mut closure, f.def, true, true)
            }
            Value::Algorithm(alg) => {
                let mut closure = alg.closure.clone();
                self.inner_call(pn, &mut closure, alg.def, true, false)
            }
            Value::RuntimeError(code) => Value::RuntimeError(code),
            _ => self.error(ErrorCode::NotCallable, pn),
        }
    }

    fn call_stmt(&mut self, pn: ParseNode) {
        let callee = self.interpret_expr(self.parse_tree.arg(pn, 0));
        match callee {
            Value::Lambda(_) => {} // no observable side effects
            Value::Algorithm(alg) => {
                let mut closure = alg.closure.clone();
                self.inner_call(pn, &mut closure, alg.def, false, false);
            }
            Value::RuntimeError(_) => {}
            _ => {
                self.error(ErrorCode::NotCallable, pn);
            }
        }
    }

    fn inner_call(
        &mut self,
        call: ParseNode,
        closure: &mut Closure,
        fn_node: ParseNode,
        expect_return: bool,
        is_lambda: bool,
    ) -> Value {
        let Some(&inst_fn) = self.inst_lookup.get(&(fn_node, call)) else {
            return self.error(ErrorCode::InvalidArgs, call);
        };

        let val_cap = self.parse_tree.val_cap_list(inst_fn);
        let ref_cap = self.parse_tree.ref_cap_list(inst_fn);
        let params = self.parse_tree.param_list(inst_fn);
        let body = self.parse_tree.body(inst_fn);

        let nargs = self.parse_tree.num_args(call) - 1;
        let nparams = self.parse_tree.num_args(params);
        if nargs > nparams {
            return self.error(ErrorCode::InvalidArgs, call);
        }

        let mut stack_values: Vec<Value> = Vec::new();
        let mut closure_values: Vec<(ParseNode, Value)> = Vec::new();
        let mut i = 0;
        while i < nargs && self.status == NORMAL {
            let mut param = self.parse_tree.arg(params, i);
            if self.parse_tree.op(param) == Op::Equal {
                param = self.parse_tree.lhs(param);
            }
            let value = self.interpret_expr(self.parse_tree.arg(call, i + 1));
            if self.parse_tree.op(param) == Op::ReadUpvalue {
                closure_values.push((param, value));
            } else {
                stack_values.push(value);
            }
            i += 1;
        }

        self.break_local_closure_links(closure, val_cap, ref_cap);
        self.frames.push(self.stack.len());
        let old_closure = self.active_closure.take();
        self.active_closure = Some(closure.clone());

        let mut i = nargs;
        while i < nparams && self.status == NORMAL {
            let default_node = self.parse_tree.arg(params, i);
            if self.parse_tree.op(default_node) != Op::Equal {
                return self.error(ErrorCode::InvalidArgs, call);
            }
            let param = self.parse_tree.lhs(default_node);
            let value = self.interpret_expr(self.parse_tree.rhs(default_node));
            if self.parse_tree.op(param) == Op::ReadUpvalue {
                closure_values.push((param, value));
            } else {
                stack_values.push(value);
            }
            i += 1;
        }

        for value in stack_values {
            self.stack.push(value);
        }
        for (param, value) in closure_values {
            self.write_upvalue(param, value);
        }

        let answer = if is_lambda {
            self.interpret_expr(body)
        } else {
            self.interpret_stmt(body);
            if self.status != RETURN {
                if expect_return {
                    self.error(ErrorCode::NoReturn, call)
                } else {
                    Value::Uninitialised
                }
            } else {
                let value = self.stack.read_return();
                self.status = NORMAL;
                value
            }
        };

        if self.error_code != ErrorCode::NoErrorFound {
            return Value::RuntimeError(self.error_code);
        }

        let frame = self.frames.pop().unwrap();
        self.stack.trim(frame);
        self.active_closure = old_closure;
        answer
    }

    fn element_access(&mut self, pn: ParseNode) -> Value {
        let base = self.interpret_expr(self.parse_tree.arg(pn, 0));
        let num_indices = self.parse_tree.num_args(pn) - 1;

        match base {
            Value::Double(x) => {
                let mut i = 1;
                while i <= num_indices && self.status == NORMAL {
                    self.read_slice(self.parse_tree.arg(pn, i), 1);
                    i += 1;
                }
                if self.status == NORMAL {
                    Value::Double(x)
                } else {
                    Value::RuntimeError(self.error_code)
                }
            }
            Value::Matrix(mat) => {
                if num_indices == 1 {
                    if !mat.is_vector() {
                        return self.error(ErrorCode::IndexOutOfRange, pn);
                    }
                    let Some(slice) = self.read_slice(self.parse_tree.arg(pn, 1), mat.size())
                    else {
                        return Value::RuntimeError(self.error_code);
                    };
                    if slice.len == 1 {
                        return Value::Double(mat.linear(slice.start as usize));
                    }
                    let mut data = Vec::with_capacity(slice.len);
                    let mut pos = slice.start;
                    for _ in 0..slice.len {
                        data.push(mat.linear(pos as usize));
                        pos += slice.step;
                    }
                    // Slicing preserves the vector's orientation
                    if mat.rows() == 1 {
                        Value::Matrix(Matrix::from_vec(1, data.len(), data))
                    } else {
                        Value::Matrix(Matrix::from_vec(data.len(), 1, data))
                    }
                } else if num_indices == 2 {
                    let Some(rows) = self.read_slice(self.parse_tree.arg(pn, 1), mat.rows())
                    else {
                        return Value::RuntimeError(self.error_code);
                    };
                    let Some(cols) = self.read_slice(self.parse_tree.arg(pn, 2), mat.cols())
                    else {
                        return Value::RuntimeError(self.error_code);
                    };
                    if rows.len == 1 && cols.len == 1 {
                        return Value::Double(mat.at(rows.start as usize, cols.start as usize));
                    }
                    let mut out = Matrix::new(rows.len, cols.len);
                    let mut r = rows.start;
                    for i in 0..rows.len {
                        let mut c = cols.start;
                        for j in 0..cols.len {
                            *out.at_mut(i, j) = mat.at(r as usize, c as usize);
                            c += cols.step;
                        }
                        r += rows.step;
                    }
                    Value::Matrix(out)
                } else {
                    self.error(ErrorCode::IndexOutOfRange, pn)
                }
            }
            Value::RuntimeError(code) => Value::RuntimeError(code),
            _ => self.error(ErrorCode::RuntimeTypeError, pn),
        }
    }

    fn read_index(&mut self, pn: ParseNode, size: usize) -> Option<isize> {
        let value = self.read_double(pn)?;
        let index = value as isize;
        if index < 0 || index as usize >= size {
            self.error(ErrorCode::IndexOutOfRange, pn);
            return None;
        }
        Some(index)
    }

    fn read_slice(&mut self, pn: ParseNode, size: usize) -> Option<Slice> {
        if self.parse_tree.op(pn) != Op::Slice {
            let index = self.read_index(pn, size)?;
            return Some(Slice {
                start: index,
                len: 1,
                step: 1,
            });
        }

        let nargs = self.parse_tree.num_args(pn);
        if nargs == 1 {
            return Some(Slice {
                start: 0,
                len: size,
                step: 1,
            });
        }

        let first = self.parse_tree.arg(pn, 0);
        let last = self.parse_tree.arg(pn, 1);
        let step = if nargs == 3 {
            self.read_double(self.parse_tree.arg(pn, 2))? as isize
        } else {
            1
        };

        if step == 0 {
            self.error(ErrorCode::IndexOutOfRange, pn);
            return None;
        }
        if step > 0 {
            let f = if self.parse_tree.op(first) != Op::SliceAll {
                self.read_index(first, size)?
            } else {
                0
            };
            let l = if self.parse_tree.op(last) != Op::SliceAll {
                self.read_index(last, size)?
            } else {
                size as isize - 1
            };
            let diff = l - f;
            if diff < 0 {
                self.error(ErrorCode::NonTerminatingSlice, pn);
                return None;
            }
            Some(Slice {
                start: f,
                len: 1 + (diff / step) as usize,
                step,
            })
        } else {
            let f = if self.parse_tree.op(first) != Op::SliceAll {
                self.read_index(first, size)?
            } else {
                size as isize - 1
            };
            let l = if self.parse_tree.op(last) != Op::SliceAll {
                self.read_index(last, size)?
            } else {
                0
            };
            let diff = l - f;
            if diff > 0 {
                self.error(ErrorCode::NonTerminatingSlice, pn);
                return None;
            }
            Some(Slice {
                start: f,
                len: 1 + (diff / step) as usize,
                step,
            })
        }
    }

    fn binary_dispatch(&mut self, op: Op, lhs: Value, rhs: Value, pn: ParseNode) -> Value {
        use Value::*;
        if let RuntimeError(code) = lhs {
            return RuntimeError(code);
        }
        if let RuntimeError(code) = rhs {
            return RuntimeError(code);
        }

        match op {
            Op::Addition => match (lhs, rhs) {
                (Double(a), Double(b)) => Double(a + b),
                (Matrix(a), Matrix(b)) => match a.add(&b) {
                    Some(m) => Matrix(m),
                    None => self.error(ErrorCode::RuntimeDimensionMismatch, pn),
                },
                (Str(a), Str(b)) => Str(a + &b),
                _ => self.error(ErrorCode::RuntimeTypeError, pn),
            },
            Op::Subtraction => match (lhs, rhs) {
                (Double(a), Double(b)) => Double(a - b),
                (Matrix(a), Matrix(b)) => match a.sub(&b) {
                    Some(m) => Matrix(m),
                    None => self.error(ErrorCode::RuntimeDimensionMismatch, pn),
                },
                _ => self.error(ErrorCode::RuntimeTypeError, pn),
            },
            Op::Multiplication => match (lhs, rhs) {
                (Double(a), Double(b)) => Double(a * b),
                (Double(a), Matrix(b)) => Matrix(b.scale(a)),
                (Matrix(a), Double(b)) => Matrix(a.scale(b)),
                (Matrix(a), Matrix(b)) => match a.matmul(&b) {
                    Some(m) => {
                        if m.size() == 1 {
                            Double(m.linear(0))
                        } else {
                            Matrix(m)
                        }
                    }
                    None => self.error(ErrorCode::RuntimeDimensionMismatch, pn),
                },
                _ => self.error(ErrorCode::RuntimeTypeError, pn),
            },
            Op::Division | Op::Forwardslash => match (lhs, rhs) {
                (Double(a), Double(b)) => Double(a / b),
                (Matrix(a), Double(b)) => Matrix(a.scale(1.0 / b)),
                _ => self.error(ErrorCode::RuntimeTypeError, pn),
            },
            Op::Modulus => match (lhs, rhs) {
                (Double(a), Double(b)) => Double(a.rem_euclid(b)),
                _ => self.error(ErrorCode::RuntimeTypeError, pn),
            },
            Op::EntrywiseProduct => match (lhs, rhs) {
                (Double(a), Double(b)) => Double(a * b),
                (Matrix(a), Matrix(b)) => match a.entrywise(&b) {
                    Some(m) => Matrix(m),
                    None => self.error(ErrorCode::RuntimeDimensionMismatch, pn),
                },
                _ => self.error(ErrorCode::RuntimeTypeError, pn),
            },
            Op::Cross => match (lhs, rhs) {
                (Matrix(a), Matrix(b)) => match a.cross(&b) {
                    Some(m) => Matrix(m),
                    None => self.error(ErrorCode::RuntimeDimensionMismatch, pn),
                },
                _ => self.error(ErrorCode::RuntimeTypeError, pn),
            },
            Op::Dot => match (lhs, rhs) {
                (Double(a), Double(b)) => Double(a * b),
                (Double(a), Matrix(b)) => Matrix(b.scale(a)),
                (Matrix(a), Double(b)) => Matrix(a.scale(b)),
                (Matrix(a), Matrix(b)) => {
                    if a.is_vector() && b.is_vector() {
                        match a.dot(&b) {
                            Some(x) => Double(x),
                            None => self.error(ErrorCode::RuntimeDimensionMismatch, pn),
                        }
                    } else {
                        match a.matmul(&b) {
                            Some(m) => Matrix(m),
                            None => self.error(ErrorCode::RuntimeDimensionMismatch, pn),
                        }
                    }
                }
                _ => self.error(ErrorCode::RuntimeTypeError, pn),
            },
            Op::OuterProduct => match (lhs, rhs) {
                (Matrix(a), Matrix(b)) => match a.outer(&b) {
                    Some(m) => Matrix(m),
                    None => self.error(ErrorCode::RuntimeDimensionMismatch, pn),
                },
                _ => self.error(ErrorCode::RuntimeTypeError, pn),
            },
            Op::Power => match (lhs, rhs) {
                (Double(a), Double(b)) => Double(a.powf(b)),
                (Matrix(a), Double(b)) => {
                    if b.fract() != 0.0 {
                        return self.error(ErrorCode::ExpectNaturalNumber, pn);
                    }
                    let result = if b < 0.0 {
                        a.inverse().and_then(|inv| inv.pow((-b) as u32))
                    } else {
                        a.pow(b as u32)
                    };
                    match result {
                        Some(m) => Matrix(m),
                        None => self.error(ErrorCode::RuntimeDimensionMismatch, pn),
                    }
                }
                _ => self.error(ErrorCode::RuntimeTypeError, pn),
            },
            _ => self.error(ErrorCode::RuntimeTypeError, pn),
        }
    }

    // Output ----------------------------------------------------------------

    fn print_node(&mut self, pn: ParseNode) {
        let value = self.interpret_expr(pn);
        if self.status != NORMAL {
            return;
        }

        let text = match value {
            Value::Double(x) => format_number(x),
            Value::Bool(b) => if b { "true" } else { "false" }.to_string(),
            Value::Str(s) => remove_escapes(&s),
            Value::Matrix(m) => {
                let formatted: Vec<String> =
                    m.data().iter().map(|&x| format_number(x)).collect();
                let refs: Vec<&str> = formatted.iter().map(|s| s.as_str()).collect();
                serial::matrix(m.rows() as u16, m.cols() as u16, &refs)
            }
            Value::Lambda(_) => "<lambda>".to_string(),
            Value::Algorithm(_) => "<algorithm>".to_string(),
            _ => return,
        };

        if self.status == NORMAL {
            self.messages.enqueue(OutputMessage::Print { message: text });
        }
    }
}

/// Decimal formatting: six places, trailing zeros trimmed, signed zero
/// normalised.
pub fn format_number(num: f64) -> String {
    if num.is_infinite() {
        return if num > 0.0 { "∞".into() } else { "-∞".into() };
    }
    if num.is_nan() {
        return "NaN".into();
    }
    let mut text = format!("{num:.6}");
    if text.contains('.') {
        while text.ends_with('0') {
            text.pop();
        }
        if text.ends_with('.') {
            text.pop();
        }
    }
    if text == "-0" {
        return "0".into();
    }
    text
}

/// Process `\n`, `\"`, and `\\` escapes in string content.
pub fn remove_escapes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_trims_trailing_zeros() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(3.25), "3.25");
        assert_eq!(format_number(0.5), "0.5");
    }

    #[test]
    fn format_normalises_signed_zero() {
        assert_eq!(format_number(-0.0), "0");
    }

    #[test]
    fn remove_escapes_handles_all_three() {
        assert_eq!(remove_escapes(r"a\nb"), "a\nb");
        assert_eq!(remove_escapes(r#"a\"b"#), "a\"b");
        assert_eq!(remove_escapes(r"a\\b"), "a\\b");
    }

    #[test]
    fn gamma_matches_factorial() {
        assert!((gamma(5.0) - 24.0).abs() < 1e-9);
        assert!((gamma(0.5) - std::f64::consts::PI.sqrt()).abs() < 1e-9);
    }
}
