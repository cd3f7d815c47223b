// Tree-walking evaluator for strategy scripts

use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use crate::ast::*;
use crate::builtins;
use crate::error::{ScriptError, ScriptResult};
use crate::format::{apply_spec, percent_format, FormatArg};
use crate::indicators::{Indicator, IndicatorKind, LineRef, Source};
use crate::runtime::{repeated_len, LineField, Runtime, SandboxLimits, MAX_SEQUENCE};
use crate::value::{range_len, Args, Class, Function, Instance, ModuleKind, Value};

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

struct Frame {
    locals: HashMap<String, Value>,
    function: Option<Rc<Function>>,
}

pub struct Interpreter {
    pub(crate) globals: HashMap<String, Value>,
    pub(crate) runtime: Runtime,
    limits: SandboxLimits,
    ops: u64,
    started: Option<Instant>,
    depth: usize,
    frames: Vec<Frame>,
}

impl Interpreter {
    pub fn new(runtime: Runtime, limits: SandboxLimits) -> Self {
        Self {
            globals: HashMap::new(),
            runtime,
            limits,
            ops: 0,
            started: None,
            depth: 0,
            frames: Vec::new(),
        }
    }

    /// Start the wall-clock budget; the first call wins.
    pub fn start_clock(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    pub fn operations(&self) -> u64 {
        self.ops
    }

    pub(crate) fn tick(&mut self) -> ScriptResult<()> {
        self.ops += 1;
        if self.ops > self.limits.max_operations {
            return Err(ScriptError::limit(format!(
                "LimitExceeded: operation budget of {} exceeded",
                self.limits.max_operations
            )));
        }
        if self.ops % 4096 == 0 {
            if let (Some(limit), Some(started)) = (self.limits.time_limit, self.started) {
                if started.elapsed() > limit {
                    return Err(ScriptError::limit(format!(
                        "LimitExceeded: time limit of {}s exceeded",
                        limit.as_secs()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Execute module-level statements into the global namespace.
    pub fn run_module(&mut self, module: &Module) -> ScriptResult<()> {
        match self.exec_block(&module.body) {
            Ok(_) => Ok(()),
            Err(err) => {
                let line = err.pending_line.unwrap_or(1);
                Err(err.leave_frame("<module>", line))
            }
        }
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    /// Call a method defined in the instance's class chain, if there is one.
    pub fn call_method(&mut self, instance: &Rc<Instance>, name: &str, args: Vec<Value>) -> ScriptResult<Option<Value>> {
        match instance.class.lookup(name) {
            Some(Value::Function(function)) => {
                let receiver = Value::Instance(instance.clone());
                self.call_function(&function, Some(receiver), Args::new(args)).map(Some)
            }
            _ => Ok(None),
        }
    }

    // ------------------------------------------------------------------ names

    fn lookup_name(&self, name: &str) -> ScriptResult<Value> {
        if let Some(value) = self.frames.last().and_then(|f| f.locals.get(name)) {
            return Ok(value.clone());
        }
        if let Some(value) = self.globals.get(name) {
            return Ok(value.clone());
        }
        builtins::lookup(name).ok_or_else(|| ScriptError::name_error(name))
    }

    fn store_name(&mut self, name: &str, value: Value) {
        match self.frames.last_mut() {
            Some(frame) => {
                frame.locals.insert(name.to_string(), value);
            }
            None => {
                self.globals.insert(name.to_string(), value);
            }
        }
    }

    /// `super()` with no arguments: the defining class and the first argument of the current method.
    pub(crate) fn implicit_super(&self) -> ScriptResult<Value> {
        let frame = self
            .frames
            .last()
            .ok_or_else(|| ScriptError::new("RuntimeError", "super(): no arguments"))?;
        let function = frame
            .function
            .as_ref()
            .ok_or_else(|| ScriptError::new("RuntimeError", "super(): no arguments"))?;
        let class = function
            .owner
            .borrow()
            .as_ref()
            .and_then(|weak| weak.upgrade())
            .ok_or_else(|| ScriptError::new("RuntimeError", "super(): __class__ cell not found"))?;
        let first = function
            .def
            .params
            .first()
            .and_then(|p| frame.locals.get(&p.name))
            .ok_or_else(|| ScriptError::new("RuntimeError", "super(): no arguments"))?;
        match first {
            Value::Instance(instance) => Ok(Value::Super {
                instance: instance.clone(),
                class,
            }),
            other => Err(ScriptError::type_error(format!(
                "super(type, obj): obj must be an instance, not {}",
                other.type_name()
            ))),
        }
    }

    // ------------------------------------------------------------- statements

    fn exec_block(&mut self, body: &[Stmt]) -> ScriptResult<Flow> {
        for stmt in body {
            let flow = self.exec_stmt(stmt).map_err(|e| e.at_line(stmt.line))?;
            if !matches!(flow, Flow::Normal) {
                return Ok(flow);
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> ScriptResult<Flow> {
        self.tick()?;
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value)?;
                for target in targets {
                    self.assign(target, value.clone())?;
                }
            }
            StmtKind::AugAssign { target, op, value } => self.exec_aug_assign(target, *op, value)?,
            StmtKind::If { test, body, orelse } => {
                let test = self.eval(test)?;
                return if self.truthy(&test) {
                    self.exec_block(body)
                } else {
                    self.exec_block(orelse)
                };
            }
            StmtKind::While { test, body } => loop {
                self.tick()?;
                let test = self.eval(test)?;
                if !self.truthy(&test) {
                    break;
                }
                match self.exec_block(body)? {
                    Flow::Break => break,
                    Flow::Return(v) => return Ok(Flow::Return(v)),
                    Flow::Normal | Flow::Continue => {}
                }
            },
            StmtKind::For { target, iter, body } => {
                let iterable = self.eval(iter)?;
                if let Value::Range { start, stop, step } = iterable {
                    let mut i = start;
                    while (step > 0 && i < stop) || (step < 0 && i > stop) {
                        self.tick()?;
                        self.assign(target, Value::Int(i))?;
                        match self.exec_block(body)? {
                            Flow::Break => break,
                            Flow::Return(v) => return Ok(Flow::Return(v)),
                            Flow::Normal | Flow::Continue => {}
                        }
                        i += step;
                    }
                } else {
                    for item in self.iterate(&iterable)? {
                        self.tick()?;
                        self.assign(target, item)?;
                        match self.exec_block(body)? {
                            Flow::Break => break,
                            Flow::Return(v) => return Ok(Flow::Return(v)),
                            Flow::Normal | Flow::Continue => {}
                        }
                    }
                }
            }
            StmtKind::FunctionDef(def) => {
                let mut defaults = Vec::with_capacity(def.params.len());
                for param in &def.params {
                    defaults.push(match &param.default {
                        Some(expr) => Some(self.eval(expr)?),
                        None => None,
                    });
                }
                let function = Function {
                    def: def.clone(),
                    defaults,
                    owner: Default::default(),
                };
                self.store_name(&def.name, Value::Function(Rc::new(function)));
            }
            StmtKind::ClassDef(def) => self.exec_class_def(def)?,
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::Pass => {}
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Import { names } => {
                for alias in names {
                    let module = ModuleKind::resolve(&alias.name).ok_or_else(|| import_error(&alias.name))?;
                    match &alias.asname {
                        Some(asname) => self.store_name(asname, Value::Module(module)),
                        None => {
                            let root = alias.name.split('.').next().unwrap_or(&alias.name);
                            let root_module = ModuleKind::resolve(root).ok_or_else(|| import_error(root))?;
                            self.store_name(root, Value::Module(root_module));
                        }
                    }
                }
            }
            StmtKind::ImportFrom { module, level, names } => {
                let path = module.as_deref().unwrap_or("");
                if *level > 0 {
                    return Err(import_error(&format!("{}{}", ".".repeat(*level), path)));
                }
                let kind = ModuleKind::resolve(path).ok_or_else(|| import_error(path))?;
                for alias in names {
                    if alias.name == "*" {
                        return Err(ScriptError::new("ImportError", "wildcard imports are not supported"));
                    }
                    let value = builtins::module_attr(kind, &alias.name).ok_or_else(|| {
                        ScriptError::new(
                            "ImportError",
                            format!("cannot import name '{}' from '{}'", alias.name, path),
                        )
                    })?;
                    let bound = alias.asname.as_deref().unwrap_or(&alias.name);
                    self.store_name(bound, value);
                }
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_aug_assign(&mut self, target: &Expr, op: BinOp, value: &Expr) -> ScriptResult<()> {
        let rhs = self.eval(value)?;
        match &target.kind {
            ExprKind::Name(name) => {
                let current = self.lookup_name(name)?;
                // In-place extension keeps aliases of the list in sync
                if let (Value::List(list), BinOp::Add) = (&current, op) {
                    let items = self.iterate(&rhs)?;
                    list.borrow_mut().extend(items);
                    return Ok(());
                }
                let updated = self.binary(op, &current, &rhs)?;
                self.store_name(name, updated);
            }
            ExprKind::Attribute { value: object, attr } => {
                let object = self.eval(object)?;
                let current = self.get_attr(&object, attr)?;
                let updated = self.binary(op, &current, &rhs)?;
                self.set_attr(&object, attr, updated)?;
            }
            ExprKind::Subscript { value: container, index } => {
                let container = self.eval(container)?;
                let index = self.eval(index)?;
                let current = self.get_item(&container, &index)?;
                let updated = self.binary(op, &current, &rhs)?;
                self.set_item(&container, index, updated)?;
            }
            _ => return Err(ScriptError::new("SyntaxError", "illegal expression for augmented assignment")),
        }
        Ok(())
    }

    fn exec_class_def(&mut self, def: &Rc<ClassDef>) -> ScriptResult<()> {
        let mut bases = Vec::new();
        let mut is_strategy = false;
        for base in &def.bases {
            match self.eval(base)? {
                Value::Class(class) => {
                    is_strategy |= class.is_strategy;
                    bases.push(class);
                }
                Value::StrategyBase => is_strategy = true,
                other => {
                    return Err(ScriptError::type_error(format!(
                        "cannot inherit from {}",
                        other.type_name()
                    )))
                }
            }
        }

        self.frames.push(Frame {
            locals: HashMap::new(),
            function: None,
        });
        let result = self.exec_block(&def.body);
        let namespace = self.frames.pop().map(|f| f.locals).unwrap_or_default();
        result?;

        let class = Rc::new(Class {
            name: def.name.clone(),
            bases,
            is_strategy,
            attrs: std::cell::RefCell::new(namespace),
        });
        for value in class.attrs.borrow().values() {
            if let Value::Function(function) = value {
                *function.owner.borrow_mut() = Some(Rc::downgrade(&class));
            }
        }
        self.store_name(&def.name, Value::Class(class));
        Ok(())
    }

    fn assign(&mut self, target: &Expr, value: Value) -> ScriptResult<()> {
        match &target.kind {
            ExprKind::Name(name) => {
                self.store_name(name, value);
                Ok(())
            }
            ExprKind::Attribute { value: object, attr } => {
                let object = self.eval(object)?;
                self.set_attr(&object, attr, value)
            }
            ExprKind::Subscript { value: container, index } => {
                let container = self.eval(container)?;
                let index = self.eval(index)?;
                self.set_item(&container, index, value)
            }
            ExprKind::Tuple(targets) | ExprKind::List(targets) => {
                let items = self.iterate(&value)?;
                match items.len().cmp(&targets.len()) {
                    Ordering::Greater => Err(ScriptError::value_error(format!(
                        "too many values to unpack (expected {})",
                        targets.len()
                    ))),
                    Ordering::Less => Err(ScriptError::value_error(format!(
                        "not enough values to unpack (expected {}, got {})",
                        targets.len(),
                        items.len()
                    ))),
                    Ordering::Equal => {
                        for (target, item) in targets.iter().zip(items) {
                            self.assign(target, item)?;
                        }
                        Ok(())
                    }
                }
            }
            _ => Err(ScriptError::new("SyntaxError", "cannot assign to expression")),
        }
    }

    // ------------------------------------------------------------ expressions

    pub(crate) fn eval(&mut self, expr: &Expr) -> ScriptResult<Value> {
        match &expr.kind {
            ExprKind::Name(name) => self.lookup_name(name),
            ExprKind::Int(i) => Ok(Value::Int(*i)),
            ExprKind::Float(f) => Ok(Value::Float(*f)),
            ExprKind::Str(s) => Ok(Value::str(s)),
            ExprKind::Bool(b) => Ok(Value::Bool(*b)),
            ExprKind::None => Ok(Value::None),
            ExprKind::FString(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        FPart::Lit(text) => out.push_str(text),
                        FPart::Expr { expr, spec, conversion } => {
                            let value = self.eval(expr)?;
                            let value = match conversion {
                                Some('r') => Value::str(self.repr(&value)),
                                Some(_) => Value::str(self.to_str(&value)),
                                None => value,
                            };
                            match spec {
                                Some(spec) => out.push_str(&apply_spec(&self.format_arg(&value), spec)?),
                                None => out.push_str(&self.to_str(&value)),
                            }
                        }
                    }
                }
                Ok(Value::str(out))
            }
            ExprKind::List(items) => {
                let values = items.iter().map(|i| self.eval(i)).collect::<ScriptResult<Vec<_>>>()?;
                Ok(Value::list(values))
            }
            ExprKind::Tuple(items) => {
                let values = items.iter().map(|i| self.eval(i)).collect::<ScriptResult<Vec<_>>>()?;
                Ok(Value::tuple(values))
            }
            ExprKind::Dict(entries) => {
                let mut dict = crate::value::Dict::default();
                for (key, value) in entries {
                    let key = self.eval(key)?;
                    let value = self.eval(value)?;
                    dict.insert(key, value);
                }
                Ok(Value::Dict(Rc::new(std::cell::RefCell::new(dict))))
            }
            ExprKind::ListComp { elt, target, iter, cond } => {
                let iterable = self.eval(iter)?;
                let mut out = Vec::new();
                for item in self.iterate(&iterable)? {
                    self.tick()?;
                    self.assign(target, item)?;
                    if let Some(cond) = cond {
                        let keep = self.eval(cond)?;
                        if !self.truthy(&keep) {
                            continue;
                        }
                    }
                    out.push(self.eval(elt)?);
                }
                Ok(Value::list(out))
            }
            ExprKind::Attribute { value, attr } => {
                let object = self.eval(value)?;
                self.get_attr(&object, attr)
            }
            ExprKind::Subscript { value, index } => {
                let container = self.eval(value)?;
                if let ExprKind::Slice { lower, upper } = &index.kind {
                    let lower = match lower {
                        Some(e) => Some(self.eval(e)?),
                        None => None,
                    };
                    let upper = match upper {
                        Some(e) => Some(self.eval(e)?),
                        None => None,
                    };
                    return self.slice(&container, lower.as_ref(), upper.as_ref());
                }
                let index = self.eval(index)?;
                self.get_item(&container, &index)
            }
            ExprKind::Slice { .. } => Err(ScriptError::new("SyntaxError", "slice outside of subscript")),
            ExprKind::Call { func, args, kwargs } => {
                let callee = self.eval(func)?;
                let positional = args.iter().map(|a| self.eval(a)).collect::<ScriptResult<Vec<_>>>()?;
                let mut keywords = Vec::with_capacity(kwargs.len());
                for (name, value) in kwargs {
                    keywords.push((name.clone(), self.eval(value)?));
                }
                self.call_value(callee, Args { positional, keywords })
            }
            ExprKind::BinOp { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.binary(*op, &left, &right)
            }
            ExprKind::UnaryOp { op, operand } => {
                let value = self.eval(operand)?;
                self.unary(*op, &value)
            }
            ExprKind::And(left, right) => {
                let left = self.eval(left)?;
                if !self.truthy(&left) {
                    return Ok(left);
                }
                self.eval(right)
            }
            ExprKind::Or(left, right) => {
                let left = self.eval(left)?;
                if self.truthy(&left) {
                    return Ok(left);
                }
                self.eval(right)
            }
            ExprKind::Compare { left, ops, comparators } => {
                let mut left = self.eval(left)?;
                if ops.len() == 1 {
                    let right = self.eval(&comparators[0])?;
                    return self.compare(ops[0], &left, &right);
                }
                for (op, comparator) in ops.iter().zip(comparators) {
                    let right = self.eval(comparator)?;
                    let result = self.compare(*op, &left, &right)?;
                    if !self.truthy(&result) {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            ExprKind::IfExp { test, body, orelse } => {
                let test = self.eval(test)?;
                if self.truthy(&test) {
                    self.eval(body)
                } else {
                    self.eval(orelse)
                }
            }
        }
    }

    pub(crate) fn truthy(&self, value: &Value) -> bool {
        value.truthy(&self.runtime.market)
    }

    pub(crate) fn to_str(&self, value: &Value) -> String {
        value.display(&self.runtime.market)
    }

    pub(crate) fn repr(&self, value: &Value) -> String {
        value.repr(&self.runtime.market)
    }

    pub(crate) fn format_arg(&self, value: &Value) -> FormatArg {
        match value {
            Value::Int(i) => FormatArg::Int(*i),
            Value::Bool(b) => FormatArg::Int(*b as i64),
            Value::Float(_) | Value::Line(_) | Value::Indicator(_) => {
                FormatArg::Float(value.as_number(&self.runtime.market).unwrap_or(f64::NAN))
            }
            other => FormatArg::Text(self.to_str(other)),
        }
    }

    pub(crate) fn number(&self, value: &Value) -> Option<f64> {
        value.as_number(&self.runtime.market)
    }

    // ------------------------------------------------------------- operators

    fn lazy_source(value: &Value) -> Option<Source> {
        match value {
            Value::Line(line) => Some(Source::Line(*line)),
            Value::Indicator(ind) => Some(Source::Indicator(ind.clone())),
            Value::Feed(feed) => Some(Source::Line(LineRef {
                feed: *feed,
                field: LineField::Close,
            })),
            Value::Int(i) => Some(Source::Const(*i as f64)),
            Value::Float(f) => Some(Source::Const(*f)),
            Value::Bool(b) => Some(Source::Const(*b as i64 as f64)),
            _ => None,
        }
    }

    /// Inside `__init__`, operators on lines build indicators evaluated per bar.
    fn lazy_indicator(&mut self, kind: IndicatorKind, name: String, operands: &[&Value]) -> Option<Value> {
        if !self.runtime.in_init || !operands.iter().any(|v| v.is_lazy_line()) {
            return None;
        }
        let inputs = operands.iter().map(|v| Self::lazy_source(v)).collect::<Option<Vec<_>>>()?;
        let indicator = Indicator::new(kind, name, inputs);
        self.runtime.min_period = self.runtime.min_period.max(indicator.min_period);
        Some(Value::Indicator(Rc::new(indicator)))
    }

    pub(crate) fn binary(&mut self, op: BinOp, left: &Value, right: &Value) -> ScriptResult<Value> {
        if let Some(lazy) = self.lazy_indicator(IndicatorKind::Arith(op), format!("({})", op.symbol()), &[left, right])
        {
            return Ok(lazy);
        }

        match (left, right) {
            (Value::Int(_) | Value::Bool(_), Value::Int(_) | Value::Bool(_)) => {
                let (a, b) = (left.as_int().unwrap_or(0), right.as_int().unwrap_or(0));
                return int_op(op, a, b);
            }
            (Value::Str(a), Value::Str(b)) if op == BinOp::Add => return Ok(Value::str(format!("{}{}", a, b))),
            (Value::Str(s), n) | (n, Value::Str(s)) if op == BinOp::Mul && n.as_int().is_some() => {
                let count = usize::try_from(n.as_int().unwrap_or(0)).unwrap_or(0);
                repeated_len(s.len(), count)?;
                return Ok(Value::str(s.repeat(count)));
            }
            (Value::Str(fmt), args) if op == BinOp::Mod => return self.percent(fmt, args),
            (Value::List(a), Value::List(b)) if op == BinOp::Add => {
                let mut items = a.borrow().clone();
                items.extend(b.borrow().iter().cloned());
                return Ok(Value::list(items));
            }
            (Value::List(l), n) | (n, Value::List(l)) if op == BinOp::Mul && n.as_int().is_some() => {
                let count = usize::try_from(n.as_int().unwrap_or(0)).unwrap_or(0);
                let items = l.borrow();
                repeated_len(items.len(), count)?;
                let repeated: Vec<Value> = (0..count).flat_map(|_| items.iter().cloned()).collect();
                return Ok(Value::list(repeated));
            }
            (Value::Tuple(a), Value::Tuple(b)) if op == BinOp::Add => {
                let items: Vec<Value> = a.iter().chain(b.iter()).cloned().collect();
                return Ok(Value::tuple(items));
            }
            _ => {}
        }

        match (self.number(left), self.number(right)) {
            (Some(a), Some(b)) => float_op(op, a, b),
            _ => Err(ScriptError::type_error(format!(
                "unsupported operand type(s) for {}: '{}' and '{}'",
                op.symbol(),
                left.type_name(),
                right.type_name()
            ))),
        }
    }

    fn percent(&self, fmt: &str, args: &Value) -> ScriptResult<Value> {
        let items: Vec<Value> = match args {
            Value::Tuple(items) => items.iter().cloned().collect(),
            other => vec![other.clone()],
        };
        let format_args: Vec<FormatArg> = items.iter().map(|v| self.format_arg(v)).collect();
        let reprs: Vec<String> = items.iter().map(|v| self.repr(v)).collect();
        percent_format(fmt, &format_args, &reprs).map(Value::str)
    }

    fn unary(&mut self, op: UnaryOp, value: &Value) -> ScriptResult<Value> {
        match op {
            UnaryOp::Not => Ok(Value::Bool(!self.truthy(value))),
            UnaryOp::Neg => {
                if let Some(lazy) = self.lazy_indicator(IndicatorKind::Neg, "(-)".to_string(), &[value]) {
                    return Ok(lazy);
                }
                match value {
                    Value::Int(_) | Value::Bool(_) => {
                        let i = value.as_int().unwrap_or(0);
                        Ok(i.checked_neg().map(Value::Int).unwrap_or(Value::Float(-(i as f64))))
                    }
                    other => match self.number(other) {
                        Some(x) => Ok(Value::Float(-x)),
                        None => Err(ScriptError::type_error(format!(
                            "bad operand type for unary -: '{}'",
                            other.type_name()
                        ))),
                    },
                }
            }
            UnaryOp::Pos => match value {
                Value::Int(_) | Value::Bool(_) => Ok(Value::Int(value.as_int().unwrap_or(0))),
                other => match self.number(other) {
                    Some(x) => Ok(Value::Float(x)),
                    None => Err(ScriptError::type_error(format!(
                        "bad operand type for unary +: '{}'",
                        other.type_name()
                    ))),
                },
            },
        }
    }

    pub(crate) fn values_eq(&self, left: &Value, right: &Value) -> bool {
        match (left, right) {
            (Value::List(a), Value::List(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| self.values_eq(x, y))
            }
            (Value::Tuple(a), Value::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| self.values_eq(x, y))
            }
            (Value::Dict(a), Value::Dict(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.entries.len() == b.entries.len()
                    && a.entries
                        .iter()
                        .all(|(k, v)| b.get(k).map(|other| self.values_eq(v, other)).unwrap_or(false))
            }
            (a, b) if a.is_lazy_line() || b.is_lazy_line() => match (self.number(a), self.number(b)) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
            (a, b) => a.key_eq(b) || a.is_same(b),
        }
    }

    pub(crate) fn ordering(&self, left: &Value, right: &Value) -> ScriptResult<Option<Ordering>> {
        match (left, right) {
            (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
            (Value::DateTime(a), Value::DateTime(b)) => Ok(Some(a.cmp(b))),
            (Value::Date(a), Value::Date(b)) => Ok(Some(a.cmp(b))),
            (Value::List(_) | Value::Tuple(_), Value::List(_) | Value::Tuple(_))
                if std::mem::discriminant(left) == std::mem::discriminant(right) =>
            {
                let a = self.iterate(left)?;
                let b = self.iterate(right)?;
                for (x, y) in a.iter().zip(b.iter()) {
                    if !self.values_eq(x, y) {
                        return self.ordering(x, y);
                    }
                }
                Ok(Some(a.len().cmp(&b.len())))
            }
            _ => match (self.number(left), self.number(right)) {
                (Some(a), Some(b)) => Ok(a.partial_cmp(&b)),
                _ => Err(ScriptError::type_error(format!(
                    "comparison not supported between instances of '{}' and '{}'",
                    left.type_name(),
                    right.type_name()
                ))),
            },
        }
    }

    pub(crate) fn compare(&mut self, op: CmpOp, left: &Value, right: &Value) -> ScriptResult<Value> {
        match op {
            CmpOp::Is => return Ok(Value::Bool(left.is_same(right))),
            CmpOp::IsNot => return Ok(Value::Bool(!left.is_same(right))),
            CmpOp::In => return self.contains(right, left).map(Value::Bool),
            CmpOp::NotIn => return self.contains(right, left).map(|b| Value::Bool(!b)),
            _ => {}
        }
        if let Some(lazy) = self.lazy_indicator(IndicatorKind::Compare(op), format!("({})", op.symbol()), &[left, right])
        {
            return Ok(lazy);
        }
        let result = match op {
            CmpOp::Eq => self.values_eq(left, right),
            CmpOp::NotEq => !self.values_eq(left, right),
            _ => {
                let ordering = self.ordering(left, right)?;
                match (op, ordering) {
                    (_, None) => false,
                    (CmpOp::Lt, Some(o)) => o == Ordering::Less,
                    (CmpOp::LtE, Some(o)) => o != Ordering::Greater,
                    (CmpOp::Gt, Some(o)) => o == Ordering::Greater,
                    (CmpOp::GtE, Some(o)) => o != Ordering::Less,
                    _ => false,
                }
            }
        };
        Ok(Value::Bool(result))
    }

    fn contains(&self, container: &Value, item: &Value) -> ScriptResult<bool> {
        match container {
            Value::List(items) => Ok(items.borrow().iter().any(|v| self.values_eq(v, item))),
            Value::Tuple(items) => Ok(items.iter().any(|v| self.values_eq(v, item))),
            Value::Dict(dict) => Ok(dict.borrow().get(item).is_some()),
            Value::Str(haystack) => match item {
                Value::Str(needle) => Ok(haystack.contains(&**needle)),
                other => Err(ScriptError::type_error(format!(
                    "'in <string>' requires string as left operand, not {}",
                    other.type_name()
                ))),
            },
            Value::Range { start, stop, step } => Ok(match item.as_int() {
                Some(i) => {
                    let in_bounds = if *step > 0 {
                        i >= *start && i < *stop
                    } else {
                        i <= *start && i > *stop
                    };
                    in_bounds && (i - start) % step == 0
                }
                None => false,
            }),
            other => Err(ScriptError::type_error(format!(
                "argument of type '{}' is not iterable",
                other.type_name()
            ))),
        }
    }

    // ------------------------------------------------------ sequences & items

    pub(crate) fn iterate(&self, value: &Value) -> ScriptResult<Vec<Value>> {
        match value {
            Value::List(items) => Ok(items.borrow().clone()),
            Value::Tuple(items) => Ok(items.to_vec()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::str(c.to_string())).collect()),
            Value::Dict(dict) => Ok(dict.borrow().entries.iter().map(|(k, _)| k.clone()).collect()),
            Value::Range { start, stop, step } => {
                let len = range_len(*start, *stop, *step);
                if len > MAX_SEQUENCE as i64 {
                    return Err(ScriptError::new("MemoryError", "range too large to materialize"));
                }
                Ok((0..len).map(|i| Value::Int(start + i * step)).collect())
            }
            other => Err(ScriptError::type_error(format!(
                "'{}' object is not iterable",
                other.type_name()
            ))),
        }
    }

    fn normalize_index(index: i64, len: usize, what: &str) -> ScriptResult<usize> {
        let idx = if index < 0 { index + len as i64 } else { index };
        if idx < 0 || idx >= len as i64 {
            return Err(ScriptError::index_error(format!("{} index out of range", what)));
        }
        Ok(idx as usize)
    }

    fn ago(index: &Value) -> ScriptResult<i64> {
        index
            .as_int()
            .ok_or_else(|| ScriptError::type_error("line indices must be integers"))
    }

    pub(crate) fn get_item(&self, container: &Value, index: &Value) -> ScriptResult<Value> {
        let market = &self.runtime.market;
        match container {
            Value::List(items) => {
                let items = items.borrow();
                let i = index
                    .as_int()
                    .ok_or_else(|| ScriptError::type_error("list indices must be integers"))?;
                Ok(items[Self::normalize_index(i, items.len(), "list")?].clone())
            }
            Value::Tuple(items) => {
                let i = index
                    .as_int()
                    .ok_or_else(|| ScriptError::type_error("tuple indices must be integers"))?;
                Ok(items[Self::normalize_index(i, items.len(), "tuple")?].clone())
            }
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let i = index
                    .as_int()
                    .ok_or_else(|| ScriptError::type_error("string indices must be integers"))?;
                Ok(Value::str(chars[Self::normalize_index(i, chars.len(), "string")?].to_string()))
            }
            Value::Dict(dict) => dict
                .borrow()
                .get(index)
                .cloned()
                .ok_or_else(|| ScriptError::new("KeyError", self.repr(index))),
            Value::Feed(feed) => self.get_item(
                &Value::Line(LineRef {
                    feed: *feed,
                    field: LineField::Close,
                }),
                index,
            ),
            Value::Line(line) => {
                let ago = Self::ago(index)?;
                market
                    .index_for(line.feed, ago)
                    .and_then(|i| market.row(line.feed, i))
                    .map(|row| Value::Float(line.field.read(row)))
                    .ok_or_else(|| ScriptError::index_error("array index out of range"))
            }
            Value::DateTimeLine(feed) => {
                let ago = Self::ago(index)?;
                market
                    .index_for(*feed, ago)
                    .and_then(|i| market.row(*feed, i))
                    .map(|row| Value::DateTime(row.date))
                    .ok_or_else(|| ScriptError::index_error("array index out of range"))
            }
            Value::Indicator(ind) => {
                let ago = Self::ago(index)?;
                let i = market
                    .index_for(ind.feed, ago)
                    .ok_or_else(|| ScriptError::index_error("array index out of range"))?;
                Ok(Value::Float(ind.value_at(i, market).unwrap_or(f64::NAN)))
            }
            Value::Params(params) => {
                let Value::Str(key) = index else {
                    return Err(ScriptError::type_error("parameter names must be strings"));
                };
                params
                    .borrow()
                    .iter()
                    .find(|(k, _)| k.as_str() == &**key)
                    .map(|(_, v)| v.clone())
                    .ok_or_else(|| ScriptError::new("KeyError", self.repr(index)))
            }
            other => Err(ScriptError::type_error(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }

    fn slice(&self, container: &Value, lower: Option<&Value>, upper: Option<&Value>) -> ScriptResult<Value> {
        let bound = |v: Option<&Value>, default: i64, len: i64| -> ScriptResult<i64> {
            match v {
                None | Some(Value::None) => Ok(default),
                Some(v) => {
                    let i = v
                        .as_int()
                        .ok_or_else(|| ScriptError::type_error("slice indices must be integers"))?;
                    let i = if i < 0 { i + len } else { i };
                    Ok(i.clamp(0, len))
                }
            }
        };
        let range = |len: usize| -> ScriptResult<std::ops::Range<usize>> {
            let len = len as i64;
            let start = bound(lower, 0, len)?;
            let end = bound(upper, len, len)?.max(start);
            Ok(start as usize..end as usize)
        };
        match container {
            Value::List(items) => {
                let items = items.borrow();
                Ok(Value::list(items[range(items.len())?].to_vec()))
            }
            Value::Tuple(items) => Ok(Value::tuple(items[range(items.len())?].to_vec())),
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                Ok(Value::str(chars[range(chars.len())?].iter().collect::<String>()))
            }
            other => Err(ScriptError::type_error(format!(
                "'{}' object is not sliceable",
                other.type_name()
            ))),
        }
    }

    fn set_item(&mut self, container: &Value, index: Value, value: Value) -> ScriptResult<()> {
        match container {
            Value::List(items) => {
                let mut items = items.borrow_mut();
                let i = index
                    .as_int()
                    .ok_or_else(|| ScriptError::type_error("list indices must be integers"))?;
                let idx = Self::normalize_index(i, items.len(), "list assignment")?;
                items[idx] = value;
                Ok(())
            }
            Value::Dict(dict) => {
                if matches!(index, Value::List(_) | Value::Dict(_)) {
                    return Err(ScriptError::type_error(format!("unhashable type: '{}'", index.type_name())));
                }
                dict.borrow_mut().insert(index, value);
                Ok(())
            }
            other => Err(ScriptError::type_error(format!(
                "'{}' object does not support item assignment",
                other.type_name()
            ))),
        }
    }

    // ------------------------------------------------------------- attributes

    pub(crate) fn get_attr(&mut self, object: &Value, name: &str) -> ScriptResult<Value> {
        if is_dunder(name) && name != "__init__" {
            return Err(ScriptError::new(
                "AttributeError",
                format!("access to attribute '{}' is not allowed", name),
            ));
        }
        match object {
            Value::Instance(instance) => {
                if instance.class.is_strategy && name == "log" {
                    return Ok(Value::native(object.clone(), "log"));
                }
                if let Some(value) = instance.attrs.borrow().get(name) {
                    return Ok(value.clone());
                }
                if let Some(value) = instance.class.lookup(name) {
                    return Ok(match value {
                        Value::Function(function) => Value::BoundMethod {
                            receiver: Box::new(object.clone()),
                            function,
                        },
                        other => other,
                    });
                }
                if instance.class.is_strategy {
                    if let Some(value) = self.strategy_attr(object, name) {
                        return Ok(value);
                    }
                }
                Err(ScriptError::attribute_error(&instance.class.name, name))
            }
            Value::Class(class) => class
                .lookup(name)
                .ok_or_else(|| ScriptError::new("AttributeError", format!("type object '{}' has no attribute '{}'", class.name, name))),
            Value::Super { instance, class } => {
                let receiver = Value::Instance(instance.clone());
                if let Some(value) = class.lookup_in_bases(name) {
                    return Ok(match value {
                        Value::Function(function) => Value::BoundMethod {
                            receiver: Box::new(receiver),
                            function,
                        },
                        other => other,
                    });
                }
                if class.is_strategy {
                    if let Some(value) = self.strategy_attr(&receiver, name) {
                        return Ok(value);
                    }
                }
                if name == "__init__" {
                    return Ok(Value::native(receiver, "__init__"));
                }
                Err(ScriptError::attribute_error("super", name))
            }
            Value::Module(kind) => builtins::module_attr(*kind, name).ok_or_else(|| {
                ScriptError::new(
                    "AttributeError",
                    format!("module '{}' has no attribute '{}'", kind.name(), name),
                )
            }),
            other => match self.native_attr(other, name)? {
                Some(value) => Ok(value),
                None => Err(ScriptError::attribute_error(&other.type_name(), name)),
            },
        }
    }

    fn set_attr(&mut self, object: &Value, name: &str, value: Value) -> ScriptResult<()> {
        if is_dunder(name) {
            return Err(ScriptError::new(
                "AttributeError",
                format!("access to attribute '{}' is not allowed", name),
            ));
        }
        match object {
            Value::Instance(instance) => {
                instance.attrs.borrow_mut().insert(name.to_string(), value);
                Ok(())
            }
            Value::Class(class) => {
                class.attrs.borrow_mut().insert(name.to_string(), value);
                Ok(())
            }
            Value::Params(params) => {
                let mut params = params.borrow_mut();
                match params.iter_mut().find(|(k, _)| k.as_str() == name) {
                    Some(entry) => entry.1 = value,
                    None => params.push((name.to_string(), value)),
                }
                Ok(())
            }
            other => Err(ScriptError::new(
                "AttributeError",
                format!("'{}' object attribute '{}' is read-only", other.type_name(), name),
            )),
        }
    }

    // ------------------------------------------------------------------ calls

    pub(crate) fn call_value(&mut self, callee: Value, args: Args) -> ScriptResult<Value> {
        self.tick()?;
        match callee {
            Value::Function(function) => self.call_function(&function, None, args),
            Value::BoundMethod { receiver, function } => self.call_function(&function, Some(*receiver), args),
            Value::Builtin(builtin) => self.call_builtin(builtin, args),
            Value::NativeMethod { receiver, name } => self.call_native(*receiver, &name, args),
            Value::IndicatorClass(class) => self.make_indicator(class, args),
            Value::Class(class) => {
                if class.is_strategy {
                    return Err(ScriptError::type_error(format!(
                        "strategy class '{}' is instantiated by the engine",
                        class.name
                    )));
                }
                let instance = Rc::new(Instance::new(class.clone()));
                match class.lookup("__init__") {
                    Some(Value::Function(init)) => {
                        self.call_function(&init, Some(Value::Instance(instance.clone())), args)?;
                    }
                    _ if !args.is_empty() => {
                        return Err(ScriptError::type_error(format!("{}() takes no arguments", class.name)));
                    }
                    _ => {}
                }
                Ok(Value::Instance(instance))
            }
            other => Err(ScriptError::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    pub(crate) fn call_function(
        &mut self,
        function: &Rc<Function>,
        receiver: Option<Value>,
        args: Args,
    ) -> ScriptResult<Value> {
        let def = &function.def;
        if self.depth >= self.limits.max_call_depth {
            return Err(ScriptError::limit("RecursionError: maximum recursion depth exceeded"));
        }

        let params = &def.params;
        let positional: Vec<Value> = receiver.into_iter().chain(args.positional).collect();
        if positional.len() > params.len() {
            return Err(ScriptError::type_error(format!(
                "{}() takes {} positional arguments but {} were given",
                def.name,
                params.len(),
                positional.len()
            )));
        }
        let mut slots: Vec<Option<Value>> = vec![None; params.len()];
        for (slot, value) in slots.iter_mut().zip(positional) {
            *slot = Some(value);
        }
        for (key, value) in args.keywords {
            match params.iter().position(|p| p.name == key) {
                Some(i) if slots[i].is_none() => slots[i] = Some(value),
                Some(_) => {
                    return Err(ScriptError::type_error(format!(
                        "{}() got multiple values for argument '{}'",
                        def.name, key
                    )))
                }
                None => {
                    return Err(ScriptError::type_error(format!(
                        "{}() got an unexpected keyword argument '{}'",
                        def.name, key
                    )))
                }
            }
        }

        let mut locals = HashMap::with_capacity(params.len());
        for (i, (param, slot)) in params.iter().zip(slots).enumerate() {
            let value = match slot {
                Some(value) => value,
                None => function.defaults.get(i).cloned().flatten().ok_or_else(|| {
                    ScriptError::type_error(format!(
                        "{}() missing 1 required positional argument: '{}'",
                        def.name, param.name
                    ))
                })?,
            };
            locals.insert(param.name.clone(), value);
        }

        self.frames.push(Frame {
            locals,
            function: Some(function.clone()),
        });
        self.depth += 1;
        let result = self.exec_block(&def.body);
        self.depth -= 1;
        self.frames.pop();

        match result {
            Ok(Flow::Return(value)) => Ok(value),
            Ok(_) => Ok(Value::None),
            Err(err) => Err(err.leave_frame(&def.name, def.line)),
        }
    }
}

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

fn import_error(module: &str) -> ScriptError {
    ScriptError::new("ImportError", format!("package not available: '{}'", module))
}

fn int_op(op: BinOp, a: i64, b: i64) -> ScriptResult<Value> {
    let promoted = || float_op(op, a as f64, b as f64);
    match op {
        BinOp::Add => a.checked_add(b).map(Value::Int).map_or_else(promoted, Ok),
        BinOp::Sub => a.checked_sub(b).map(Value::Int).map_or_else(promoted, Ok),
        BinOp::Mul => a.checked_mul(b).map(Value::Int).map_or_else(promoted, Ok),
        BinOp::Div => {
            if b == 0 {
                return Err(ScriptError::zero_division());
            }
            Ok(Value::Float(a as f64 / b as f64))
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(ScriptError::new("ZeroDivisionError", "integer division or modulo by zero"));
            }
            let q = a.wrapping_div(b);
            let adjust = a.wrapping_rem(b) != 0 && ((a < 0) != (b < 0));
            Ok(Value::Int(if adjust { q - 1 } else { q }))
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(ScriptError::new("ZeroDivisionError", "integer division or modulo by zero"));
            }
            let r = a.wrapping_rem(b);
            Ok(Value::Int(if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r }))
        }
        BinOp::Pow => {
            if b >= 0 {
                u32::try_from(b)
                    .ok()
                    .and_then(|exp| a.checked_pow(exp))
                    .map(Value::Int)
                    .map_or_else(promoted, Ok)
            } else {
                promoted()
            }
        }
    }
}

fn float_op(op: BinOp, a: f64, b: f64) -> ScriptResult<Value> {
    let value = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div | BinOp::FloorDiv | BinOp::Mod if b == 0.0 => {
            return Err(ScriptError::new("ZeroDivisionError", "float division by zero"))
        }
        BinOp::Div => a / b,
        BinOp::FloorDiv => (a / b).floor(),
        BinOp::Mod => a - b * (a / b).floor(),
        BinOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(ScriptError::new(
                    "ZeroDivisionError",
                    "0.0 cannot be raised to a negative power",
                ));
            }
            a.powf(b)
        }
    };
    Ok(Value::Float(value))
}
