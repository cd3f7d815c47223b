// Runtime values of the strategy language

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::rc::{Rc, Weak};

use ax_types::Trade;
use chrono::{NaiveDate, NaiveDateTime};

use crate::ast::FunctionDef;
use crate::builtins::Builtin;
use crate::error::{ScriptError, ScriptResult};
use crate::indicators::{Indicator, IndicatorClass, LineRef};
use crate::runtime::{Market, OrderHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Backtrader,
    Indicators,
    Math,
    Datetime,
    /// `bt.Order`, carrying the status constants
    OrderConstants,
}

impl ModuleKind {
    pub fn name(&self) -> &'static str {
        match self {
            ModuleKind::Backtrader => "backtrader",
            ModuleKind::Indicators => "backtrader.indicators",
            ModuleKind::Math => "math",
            ModuleKind::Datetime => "datetime",
            ModuleKind::OrderConstants => "backtrader.Order",
        }
    }

    /// Resolve a dotted import path to a module the runtime provides.
    pub fn resolve(path: &str) -> Option<ModuleKind> {
        Some(match path {
            "backtrader" => ModuleKind::Backtrader,
            "backtrader.indicators" | "backtrader.ind" => ModuleKind::Indicators,
            "math" => ModuleKind::Math,
            "datetime" => ModuleKind::Datetime,
            _ => return None,
        })
    }
}

/// Closure-free user function; defaults are evaluated once at definition time
#[derive(Debug)]
pub struct Function {
    pub def: Rc<FunctionDef>,
    pub defaults: Vec<Option<Value>>,
    /// Class whose body defined the function, for zero-argument `super()`
    pub owner: RefCell<Option<Weak<Class>>>,
}

#[derive(Debug)]
pub struct Class {
    pub name: String,
    pub bases: Vec<Rc<Class>>,
    /// Derives (directly or not) from the simulation strategy base
    pub is_strategy: bool,
    pub attrs: RefCell<HashMap<String, Value>>,
}

impl Class {
    /// Depth-first, left-to-right attribute lookup through the bases.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.attrs.borrow().get(name) {
            return Some(value.clone());
        }
        self.bases.iter().find_map(|base| base.lookup(name))
    }

    /// Lookup that skips this class itself, as `super()` does.
    pub fn lookup_in_bases(&self, name: &str) -> Option<Value> {
        self.bases.iter().find_map(|base| base.lookup(name))
    }
}

#[derive(Debug)]
pub struct Instance {
    pub class: Rc<Class>,
    pub attrs: RefCell<HashMap<String, Value>>,
}

impl Instance {
    pub fn new(class: Rc<Class>) -> Self {
        Self {
            class,
            attrs: RefCell::new(HashMap::new()),
        }
    }
}

/// Dict preserving insertion order; keys compare by value
#[derive(Debug, Clone, Default)]
pub struct Dict {
    pub entries: Vec<(Value, Value)>,
}

impl Dict {
    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k.key_eq(key)).map(|(_, v)| v)
    }

    pub fn insert(&mut self, key: Value, value: Value) {
        match self.entries.iter_mut().find(|(k, _)| k.key_eq(&key)) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &Value) -> Option<Value> {
        let idx = self.entries.iter().position(|(k, _)| k.key_eq(key))?;
        Some(self.entries.remove(idx).1)
    }
}

/// Execution details of an order as seen by scripts
#[derive(Debug, Clone, Default)]
pub struct ExecutedView {
    pub price: f64,
    pub size: f64,
    pub comm: f64,
    pub value: f64,
    pub dt: Option<NaiveDateTime>,
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<Vec<Value>>),
    Dict(Rc<RefCell<Dict>>),
    Range { start: i64, stop: i64, step: i64 },
    Function(Rc<Function>),
    BoundMethod { receiver: Box<Value>, function: Rc<Function> },
    Builtin(Builtin),
    /// Method implemented by the runtime, bound to its receiver
    NativeMethod { receiver: Box<Value>, name: Rc<str> },
    Class(Rc<Class>),
    Instance(Rc<Instance>),
    Module(ModuleKind),
    /// `bt.Strategy` itself
    StrategyBase,
    IndicatorClass(IndicatorClass),
    Super { instance: Rc<Instance>, class: Rc<Class> },
    Feed(usize),
    Line(LineRef),
    DateTimeLine(usize),
    Indicator(Rc<Indicator>),
    Position(usize),
    Broker,
    Params(Rc<RefCell<Vec<(String, Value)>>>),
    Order(Rc<OrderHandle>),
    Trade(Rc<Trade>),
    Executed(Rc<ExecutedView>),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
}

impl Value {
    pub fn str(text: impl AsRef<str>) -> Value {
        Value::Str(Rc::from(text.as_ref()))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::new(items))
    }

    pub fn native(receiver: Value, name: &str) -> Value {
        Value::NativeMethod {
            receiver: Box::new(receiver),
            name: Rc::from(name),
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            Value::None => "NoneType".into(),
            Value::Bool(_) => "bool".into(),
            Value::Int(_) => "int".into(),
            Value::Float(_) => "float".into(),
            Value::Str(_) => "str".into(),
            Value::List(_) => "list".into(),
            Value::Tuple(_) => "tuple".into(),
            Value::Dict(_) => "dict".into(),
            Value::Range { .. } => "range".into(),
            Value::Function(_) => "function".into(),
            Value::BoundMethod { .. } | Value::NativeMethod { .. } => "method".into(),
            Value::Builtin(_) => "builtin_function_or_method".into(),
            Value::Class(_) | Value::StrategyBase | Value::IndicatorClass(_) => "type".into(),
            Value::Instance(inst) => inst.class.name.clone(),
            Value::Module(_) => "module".into(),
            Value::Super { .. } => "super".into(),
            Value::Feed(_) => "Data".into(),
            Value::Line(_) | Value::DateTimeLine(_) => "Line".into(),
            Value::Indicator(ind) => ind.name.clone(),
            Value::Position(_) => "Position".into(),
            Value::Broker => "Broker".into(),
            Value::Params(_) => "Params".into(),
            Value::Order(_) => "Order".into(),
            Value::Trade(_) => "Trade".into(),
            Value::Executed(_) => "ExecutionBits".into(),
            Value::DateTime(_) => "datetime".into(),
            Value::Date(_) => "date".into(),
        }
    }

    /// Numeric view; lines and indicators read their current value.
    pub fn as_number(&self, market: &Market) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Line(line) => Some(
                market
                    .index_for(line.feed, 0)
                    .and_then(|i| market.row(line.feed, i))
                    .map(|row| line.field.read(row))
                    .unwrap_or(f64::NAN),
            ),
            Value::Indicator(ind) => Some(ind.current(0, market)),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(*b as i64),
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn is_lazy_line(&self) -> bool {
        matches!(self, Value::Line(_) | Value::Indicator(_))
    }

    pub fn truthy(&self, market: &Market) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Dict(dict) => !dict.borrow().entries.is_empty(),
            Value::Range { start, stop, step } => range_len(*start, *stop, *step) > 0,
            Value::Position(feed) => market.position_size(*feed) != 0.0,
            Value::Line(_) | Value::Indicator(_) => {
                let v = self.as_number(market).unwrap_or(f64::NAN);
                !v.is_nan() && v != 0.0
            }
            _ => true,
        }
    }

    /// Equality used for dict keys and `in` checks on plain data.
    pub fn key_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.key_eq(y)),
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Feed(a), Value::Feed(b)) => a == b,
            (Value::Order(a), Value::Order(b)) => a.id == b.id,
            (a, b) => match (a.plain_number(), b.plain_number()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }

    fn plain_number(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(*b as i64 as f64),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Identity comparison behind `is`.
    pub fn is_same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b) || a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Indicator(a), Value::Indicator(b)) => Rc::ptr_eq(a, b),
            (Value::Order(a), Value::Order(b)) => Rc::ptr_eq(a, b),
            (Value::Trade(a), Value::Trade(b)) => Rc::ptr_eq(a, b),
            (Value::Feed(a), Value::Feed(b)) => a == b,
            (Value::Position(a), Value::Position(b)) => a == b,
            (Value::Line(a), Value::Line(b)) => a == b,
            (Value::Broker, Value::Broker) | (Value::StrategyBase, Value::StrategyBase) => true,
            (Value::Module(a), Value::Module(b)) => a == b,
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            _ => false,
        }
    }

    /// `str()` rendering
    pub fn display(&self, market: &Market) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            _ => self.repr(market),
        }
    }

    /// `repr()` rendering
    pub fn repr(&self, market: &Market) -> String {
        match self {
            Value::None => "None".into(),
            Value::Bool(true) => "True".into(),
            Value::Bool(false) => "False".into(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => float_repr(*f),
            Value::Str(s) => quote(s),
            Value::List(items) => {
                let parts: Vec<String> = items.borrow().iter().map(|v| v.repr(market)).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Tuple(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.repr(market)).collect();
                if parts.len() == 1 {
                    format!("({},)", parts[0])
                } else {
                    format!("({})", parts.join(", "))
                }
            }
            Value::Dict(dict) => {
                let parts: Vec<String> = dict
                    .borrow()
                    .entries
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.repr(market), v.repr(market)))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Range { start, stop, step } => {
                if *step == 1 {
                    format!("range({}, {})", start, stop)
                } else {
                    format!("range({}, {}, {})", start, stop, step)
                }
            }
            Value::Function(f) => format!("<function {}>", f.def.name),
            Value::BoundMethod { function, .. } => format!("<bound method {}>", function.def.name),
            Value::NativeMethod { name, .. } => format!("<built-in method {}>", name),
            Value::Builtin(b) => format!("<built-in function {}>", b.name()),
            Value::Class(c) => format!("<class '{}'>", c.name),
            Value::StrategyBase => "<class 'backtrader.Strategy'>".into(),
            Value::IndicatorClass(c) => format!("<class 'backtrader.indicators.{}'>", c.name()),
            Value::Instance(inst) => format!("<{} object>", inst.class.name),
            Value::Module(m) => format!("<module '{}'>", m.name()),
            Value::Super { class, .. } => format!("<super: <class '{}'>>", class.name),
            Value::Feed(i) => {
                let name = market.feeds.get(*i).map(|f| f.name.as_str()).unwrap_or("?");
                format!("<Data '{}'>", name)
            }
            Value::Line(_) | Value::Indicator(_) => float_repr(self.as_number(market).unwrap_or(f64::NAN)),
            Value::DateTimeLine(feed) => match market.index_for(*feed, 0).and_then(|i| market.row(*feed, i)) {
                Some(row) => row.date.format("%Y-%m-%d %H:%M:%S").to_string(),
                None => "nan".into(),
            },
            Value::Position(feed) => format!(
                "Position(size={}, price={})",
                float_repr(market.position_size(*feed)),
                float_repr(market.position_price(*feed))
            ),
            Value::Broker => "<Broker>".into(),
            Value::Params(params) => {
                let parts: Vec<String> = params
                    .borrow()
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v.repr(market)))
                    .collect();
                format!("Params({})", parts.join(", "))
            }
            Value::Order(order) => {
                let state = order.state.borrow();
                format!("<Order ref={} {} {}>", order.ref_num, order.side.as_str(), state.status.name())
            }
            Value::Trade(trade) => format!(
                "<Trade {} size={} pnl={}>",
                if trade.is_closed() { "closed" } else { "open" },
                trade.size,
                trade.pnl
            ),
            Value::Executed(e) => format!("<Executed price={} size={}>", float_repr(e.price), float_repr(e.size)),
            Value::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
        }
    }
}

pub fn range_len(start: i64, stop: i64, step: i64) -> i64 {
    if step > 0 && start < stop {
        (stop - start + step - 1) / step
    } else if step < 0 && start > stop {
        (start - stop - step - 1) / -step
    } else {
        0
    }
}

/// Shortest round-trip float rendering with the `1.0` / `1e+16` conventions scripts expect.
pub fn float_repr(value: f64) -> String {
    if value.is_nan() {
        return "nan".into();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf".into() } else { "-inf".into() };
    }
    let abs = value.abs();
    if abs != 0.0 && !(1e-4..1e16).contains(&abs) {
        let text = format!("{:e}", value);
        return match text.split_once('e') {
            Some((mantissa, exp)) => {
                let (sign, digits) = match exp.strip_prefix('-') {
                    Some(d) => ('-', d),
                    None => ('+', exp),
                };
                format!("{}e{}{:0>2}", mantissa, sign, digits)
            }
            None => text,
        };
    }
    if value.fract() == 0.0 {
        return format!("{:.1}", value);
    }
    format!("{}", value)
}

fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for c in text.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c => {
                let _ = write!(out, "{}", c);
            }
        }
    }
    out.push('\'');
    out
}

/// Call arguments as evaluated at the call site
#[derive(Debug, Clone, Default)]
pub struct Args {
    pub positional: Vec<Value>,
    pub keywords: Vec<(String, Value)>,
}

impl Args {
    pub fn new(positional: Vec<Value>) -> Self {
        Self {
            positional,
            keywords: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.keywords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keyword(&self, name: &str) -> Option<&Value> {
        self.keywords.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Argument by position or keyword name, treating `None` as absent.
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.positional
            .get(index)
            .or_else(|| self.keyword(name))
            .filter(|v| !v.is_none())
    }

    pub fn require(&self, func: &str, index: usize, name: &str) -> ScriptResult<&Value> {
        self.get(index, name)
            .ok_or_else(|| ScriptError::type_error(format!("{}() missing required argument: '{}'", func, name)))
    }

    /// Reject extra positional arguments or keywords outside `names`.
    pub fn check(&self, func: &str, names: &[&str]) -> ScriptResult<()> {
        if self.positional.len() > names.len() {
            return Err(ScriptError::type_error(format!(
                "{}() takes at most {} arguments ({} given)",
                func,
                names.len(),
                self.positional.len()
            )));
        }
        for (key, _) in &self.keywords {
            if !names.contains(&key.as_str()) {
                return Err(ScriptError::type_error(format!(
                    "{}() got an unexpected keyword argument '{}'",
                    func, key
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_repr() {
        assert_eq!(float_repr(1.0), "1.0");
        assert_eq!(float_repr(-2.5), "-2.5");
        assert_eq!(float_repr(0.1), "0.1");
        assert_eq!(float_repr(1e16), "1e+16");
        assert_eq!(float_repr(1.5e-5), "1.5e-05");
        assert_eq!(float_repr(f64::NAN), "nan");
    }

    #[test]
    fn test_repr_of_containers() {
        let market = Market::default();
        let value = Value::list(vec![Value::Int(1), Value::str("a"), Value::tuple(vec![Value::Float(2.0)])]);
        assert_eq!(value.repr(&market), "[1, 'a', (2.0,)]");
        assert_eq!(Value::str("it's").repr(&market), "'it\\'s'");
        assert_eq!(Value::str("plain").display(&market), "plain");
    }

    #[test]
    fn test_dict_keys_compare_by_value() {
        let mut dict = Dict::default();
        dict.insert(Value::Int(1), Value::str("one"));
        dict.insert(Value::Float(1.0), Value::str("uno"));
        dict.insert(Value::str("k"), Value::None);
        assert_eq!(dict.entries.len(), 2);
        assert!(matches!(dict.get(&Value::Bool(true)), Some(Value::Str(s)) if &**s == "uno"));
        assert!(dict.remove(&Value::str("k")).is_some());
    }

    #[test]
    fn test_range_len() {
        assert_eq!(range_len(0, 5, 1), 5);
        assert_eq!(range_len(0, 5, 2), 3);
        assert_eq!(range_len(5, 0, -2), 3);
        assert_eq!(range_len(3, 3, 1), 0);
    }

    #[test]
    fn test_args_lookup_and_check() {
        let args = Args {
            positional: vec![Value::Int(1)],
            keywords: vec![("size".to_string(), Value::Float(2.0))],
        };
        assert!(matches!(args.get(0, "data"), Some(Value::Int(1))));
        assert!(matches!(args.get(1, "size"), Some(Value::Float(_))));
        assert!(args.check("buy", &["data", "size"]).is_ok());
        assert!(args.check("buy", &["data"]).is_err());
        assert!(args.require("buy", 2, "price").is_err());
    }
}
