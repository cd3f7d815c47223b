// Builtin functions and the modules scripts can import

use std::cmp::Ordering;
use std::rc::Rc;

use chrono::{NaiveDate, NaiveTime};

use crate::error::{ScriptError, ScriptResult};
use crate::indicators::{Indicator, IndicatorClass, LineRef, Source};
use crate::interp::Interpreter;
use crate::runtime::LineField;
use crate::value::{range_len, Args, Dict, ModuleKind, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathFn {
    Sqrt,
    Log,
    Log10,
    Log2,
    Exp,
    Floor,
    Ceil,
    Fabs,
    Pow,
    Trunc,
    IsNan,
    IsInf,
    IsFinite,
    Sin,
    Cos,
    Tan,
    Atan,
}

impl MathFn {
    const ALL: [MathFn; 17] = [
        MathFn::Sqrt,
        MathFn::Log,
        MathFn::Log10,
        MathFn::Log2,
        MathFn::Exp,
        MathFn::Floor,
        MathFn::Ceil,
        MathFn::Fabs,
        MathFn::Pow,
        MathFn::Trunc,
        MathFn::IsNan,
        MathFn::IsInf,
        MathFn::IsFinite,
        MathFn::Sin,
        MathFn::Cos,
        MathFn::Tan,
        MathFn::Atan,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MathFn::Sqrt => "sqrt",
            MathFn::Log => "log",
            MathFn::Log10 => "log10",
            MathFn::Log2 => "log2",
            MathFn::Exp => "exp",
            MathFn::Floor => "floor",
            MathFn::Ceil => "ceil",
            MathFn::Fabs => "fabs",
            MathFn::Pow => "pow",
            MathFn::Trunc => "trunc",
            MathFn::IsNan => "isnan",
            MathFn::IsInf => "isinf",
            MathFn::IsFinite => "isfinite",
            MathFn::Sin => "sin",
            MathFn::Cos => "cos",
            MathFn::Tan => "tan",
            MathFn::Atan => "atan",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Len,
    Abs,
    Min,
    Max,
    Round,
    Int,
    Float,
    Str,
    Bool,
    Repr,
    Range,
    Sum,
    Print,
    List,
    Dict,
    Tuple,
    Isinstance,
    Enumerate,
    Zip,
    Sorted,
    Reversed,
    Any,
    All,
    Super,
    Pow,
    Divmod,
    Math(MathFn),
    DateTime,
    Date,
    Num2Date,
}

impl Builtin {
    const GLOBALS: [Builtin; 26] = [
        Builtin::Len,
        Builtin::Abs,
        Builtin::Min,
        Builtin::Max,
        Builtin::Round,
        Builtin::Int,
        Builtin::Float,
        Builtin::Str,
        Builtin::Bool,
        Builtin::Repr,
        Builtin::Range,
        Builtin::Sum,
        Builtin::Print,
        Builtin::List,
        Builtin::Dict,
        Builtin::Tuple,
        Builtin::Isinstance,
        Builtin::Enumerate,
        Builtin::Zip,
        Builtin::Sorted,
        Builtin::Reversed,
        Builtin::Any,
        Builtin::All,
        Builtin::Super,
        Builtin::Pow,
        Builtin::Divmod,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Builtin::Len => "len",
            Builtin::Abs => "abs",
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Round => "round",
            Builtin::Int => "int",
            Builtin::Float => "float",
            Builtin::Str => "str",
            Builtin::Bool => "bool",
            Builtin::Repr => "repr",
            Builtin::Range => "range",
            Builtin::Sum => "sum",
            Builtin::Print => "print",
            Builtin::List => "list",
            Builtin::Dict => "dict",
            Builtin::Tuple => "tuple",
            Builtin::Isinstance => "isinstance",
            Builtin::Enumerate => "enumerate",
            Builtin::Zip => "zip",
            Builtin::Sorted => "sorted",
            Builtin::Reversed => "reversed",
            Builtin::Any => "any",
            Builtin::All => "all",
            Builtin::Super => "super",
            Builtin::Pow => "pow",
            Builtin::Divmod => "divmod",
            Builtin::Math(f) => f.name(),
            Builtin::DateTime => "datetime",
            Builtin::Date => "date",
            Builtin::Num2Date => "num2date",
        }
    }
}

/// Names visible in every scope without an import.
pub fn lookup(name: &str) -> Option<Value> {
    Builtin::GLOBALS
        .iter()
        .find(|b| b.name() == name)
        .map(|b| Value::Builtin(*b))
}

/// Status and execution-type constants carried by `bt.Order` and order objects.
pub fn order_constant(name: &str) -> Option<Value> {
    const STATUS: [&str; 9] = [
        "Created",
        "Submitted",
        "Accepted",
        "Partial",
        "Completed",
        "Canceled",
        "Expired",
        "Margin",
        "Rejected",
    ];
    if name == "Status" {
        return Some(Value::list(STATUS.iter().map(Value::str).collect()));
    }
    if name == "Cancelled" {
        return Some(Value::Int(5));
    }
    if let Some(code) = STATUS.iter().position(|s| *s == name) {
        return Some(Value::Int(code as i64));
    }
    match name {
        "Market" | "Buy" => Some(Value::Int(0)),
        "Sell" => Some(Value::Int(1)),
        _ => None,
    }
}

pub fn module_attr(kind: ModuleKind, name: &str) -> Option<Value> {
    match kind {
        ModuleKind::Backtrader => match name {
            "Strategy" => Some(Value::StrategyBase),
            "indicators" | "ind" => Some(Value::Module(ModuleKind::Indicators)),
            "Order" => Some(Value::Module(ModuleKind::OrderConstants)),
            "num2date" => Some(Value::Builtin(Builtin::Num2Date)),
            _ => None,
        },
        ModuleKind::Indicators => IndicatorClass::lookup(name).map(Value::IndicatorClass),
        ModuleKind::Math => match name {
            "pi" => Some(Value::Float(std::f64::consts::PI)),
            "e" => Some(Value::Float(std::f64::consts::E)),
            "tau" => Some(Value::Float(std::f64::consts::TAU)),
            "inf" => Some(Value::Float(f64::INFINITY)),
            "nan" => Some(Value::Float(f64::NAN)),
            _ => MathFn::ALL
                .iter()
                .find(|f| f.name() == name)
                .map(|f| Value::Builtin(Builtin::Math(*f))),
        },
        ModuleKind::Datetime => match name {
            "datetime" => Some(Value::Builtin(Builtin::DateTime)),
            "date" => Some(Value::Builtin(Builtin::Date)),
            _ => None,
        },
        ModuleKind::OrderConstants => order_constant(name),
    }
}

impl Interpreter {
    fn float_arg(&self, func: &str, value: &Value) -> ScriptResult<f64> {
        self.number(value).ok_or_else(|| {
            ScriptError::type_error(format!(
                "{}() argument must be a real number, not '{}'",
                func,
                value.type_name()
            ))
        })
    }

    fn int_arg(func: &str, value: &Value) -> ScriptResult<i64> {
        value.as_int().ok_or_else(|| {
            ScriptError::type_error(format!(
                "{}() argument must be an integer, not '{}'",
                func,
                value.type_name()
            ))
        })
    }

    /// Lines collapse to their current value when handed to plain functions.
    fn concrete(&self, value: Value) -> Value {
        match value {
            Value::Line(_) | Value::Indicator(_) => Value::Float(self.number(&value).unwrap_or(f64::NAN)),
            other => other,
        }
    }

    pub(crate) fn length(&self, value: &Value) -> ScriptResult<usize> {
        let market = &self.runtime.market;
        Ok(match value {
            Value::Str(s) => s.chars().count(),
            Value::List(items) => items.borrow().len(),
            Value::Tuple(items) => items.len(),
            Value::Dict(dict) => dict.borrow().entries.len(),
            Value::Range { start, stop, step } => range_len(*start, *stop, *step) as usize,
            Value::Feed(feed) | Value::DateTimeLine(feed) => market.feed_len(*feed),
            Value::Line(line) => market.feed_len(line.feed),
            Value::Indicator(ind) => market.feed_len(ind.feed),
            Value::Params(params) => params.borrow().len(),
            Value::Instance(inst) if inst.class.is_strategy => market.feed_len(0),
            other => {
                return Err(ScriptError::type_error(format!(
                    "object of type '{}' has no len()",
                    other.type_name()
                )))
            }
        })
    }

    fn extremum(&self, func: &str, args: Args, want: Ordering) -> ScriptResult<Value> {
        if let Some((key, _)) = args.keywords.iter().find(|(k, _)| k != "default") {
            return Err(ScriptError::type_error(format!(
                "{}() got an unexpected keyword argument '{}'",
                func, key
            )));
        }
        let candidates = if args.positional.len() == 1 {
            self.iterate(&args.positional[0])?
        } else {
            args.positional.clone()
        };
        let mut best: Option<Value> = None;
        for candidate in candidates {
            let candidate = self.concrete(candidate);
            best = Some(match best {
                None => candidate,
                Some(current) => {
                    if self.ordering(&candidate, &current)? == Some(want) {
                        candidate
                    } else {
                        current
                    }
                }
            });
        }
        match best {
            Some(value) => Ok(value),
            None => args
                .keyword("default")
                .cloned()
                .ok_or_else(|| ScriptError::value_error(format!("{}() arg is an empty sequence", func))),
        }
    }

    pub(crate) fn call_builtin(&mut self, builtin: Builtin, args: Args) -> ScriptResult<Value> {
        let name = builtin.name();
        match builtin {
            Builtin::Len => {
                args.check(name, &["obj"])?;
                let value = args.require(name, 0, "obj")?;
                Ok(Value::Int(self.length(value)? as i64))
            }
            Builtin::Abs => {
                args.check(name, &["x"])?;
                match args.require(name, 0, "x")? {
                    Value::Int(i) => Ok(i.checked_abs().map(Value::Int).unwrap_or(Value::Float((*i as f64).abs()))),
                    Value::Bool(b) => Ok(Value::Int(*b as i64)),
                    other => Ok(Value::Float(self.float_arg(name, other)?.abs())),
                }
            }
            Builtin::Min => self.extremum(name, args, Ordering::Less),
            Builtin::Max => self.extremum(name, args, Ordering::Greater),
            Builtin::Round => {
                args.check(name, &["number", "ndigits"])?;
                let number = args.require(name, 0, "number")?;
                match args.get(1, "ndigits") {
                    None => match number {
                        Value::Int(_) | Value::Bool(_) => Ok(Value::Int(number.as_int().unwrap_or(0))),
                        other => {
                            let x = self.float_arg(name, other)?;
                            if !x.is_finite() {
                                return Err(ScriptError::value_error("cannot convert float NaN or infinity to integer"));
                            }
                            Ok(Value::Int(x.round_ties_even() as i64))
                        }
                    },
                    Some(digits) => {
                        let digits = Self::int_arg(name, digits)?;
                        if let Value::Int(i) = number {
                            return Ok(Value::Int(*i));
                        }
                        let x = self.float_arg(name, number)?;
                        let factor = 10f64.powi(digits.clamp(-308, 308) as i32);
                        let rounded = (x * factor).round_ties_even() / factor;
                        Ok(Value::Float(if rounded.is_finite() { rounded } else { x }))
                    }
                }
            }
            Builtin::Int => {
                args.check(name, &["x"])?;
                match args.get(0, "x") {
                    None => Ok(Value::Int(0)),
                    Some(Value::Int(i)) => Ok(Value::Int(*i)),
                    Some(Value::Bool(b)) => Ok(Value::Int(*b as i64)),
                    Some(Value::Str(s)) => s.trim().replace('_', "").parse::<i64>().map(Value::Int).map_err(|_| {
                        ScriptError::value_error(format!("invalid literal for int() with base 10: '{}'", s))
                    }),
                    Some(other) => {
                        let x = self.float_arg(name, other)?;
                        if !x.is_finite() {
                            return Err(ScriptError::value_error("cannot convert float NaN or infinity to integer"));
                        }
                        Ok(Value::Int(x.trunc() as i64))
                    }
                }
            }
            Builtin::Float => {
                args.check(name, &["x"])?;
                match args.get(0, "x") {
                    None => Ok(Value::Float(0.0)),
                    Some(Value::Str(s)) => s
                        .trim()
                        .parse::<f64>()
                        .map(Value::Float)
                        .map_err(|_| ScriptError::value_error(format!("could not convert string to float: '{}'", s))),
                    Some(other) => Ok(Value::Float(self.float_arg(name, other)?)),
                }
            }
            Builtin::Str => {
                args.check(name, &["object"])?;
                Ok(match args.get(0, "object") {
                    None if args.positional.is_empty() => Value::str(""),
                    None => Value::str("None"),
                    Some(v) => Value::str(self.to_str(v)),
                })
            }
            Builtin::Repr => {
                args.check(name, &["obj"])?;
                let value = args.positional.first().cloned().unwrap_or(Value::None);
                Ok(Value::str(self.repr(&value)))
            }
            Builtin::Bool => {
                args.check(name, &["x"])?;
                Ok(Value::Bool(args.get(0, "x").map(|v| self.truthy(v)).unwrap_or(false)))
            }
            Builtin::Range => {
                if !args.keywords.is_empty() || args.positional.is_empty() || args.positional.len() > 3 {
                    return Err(ScriptError::type_error("range expected 1 to 3 integer arguments"));
                }
                let ints = args
                    .positional
                    .iter()
                    .map(|v| Self::int_arg(name, v))
                    .collect::<ScriptResult<Vec<_>>>()?;
                let (start, stop, step) = match ints.as_slice() {
                    [stop] => (0, *stop, 1),
                    [start, stop] => (*start, *stop, 1),
                    [start, stop, step] => (*start, *stop, *step),
                    _ => unreachable!("argument count checked above"),
                };
                if step == 0 {
                    return Err(ScriptError::value_error("range() arg 3 must not be zero"));
                }
                Ok(Value::Range { start, stop, step })
            }
            Builtin::Sum => {
                args.check(name, &["iterable", "start"])?;
                let items = self.iterate(args.require(name, 0, "iterable")?)?;
                let mut total = args.get(1, "start").cloned().unwrap_or(Value::Int(0));
                for item in items {
                    self.tick()?;
                    let item = self.concrete(item);
                    total = self.binary(crate::ast::BinOp::Add, &total, &item)?;
                }
                Ok(total)
            }
            Builtin::Print => {
                if let Some((key, _)) = args.keywords.iter().find(|(k, _)| k != "sep" && k != "end") {
                    return Err(ScriptError::type_error(format!(
                        "print() got an unexpected keyword argument '{}'",
                        key
                    )));
                }
                let sep = match args.keyword("sep") {
                    Some(Value::Str(s)) => s.to_string(),
                    _ => " ".to_string(),
                };
                let parts: Vec<String> = args.positional.iter().map(|v| self.to_str(v)).collect();
                self.runtime.log(None, parts.join(&sep));
                Ok(Value::None)
            }
            Builtin::List => {
                args.check(name, &["iterable"])?;
                match args.get(0, "iterable") {
                    None => Ok(Value::list(Vec::new())),
                    Some(v) => Ok(Value::list(self.iterate(v)?)),
                }
            }
            Builtin::Tuple => {
                args.check(name, &["iterable"])?;
                match args.get(0, "iterable") {
                    None => Ok(Value::tuple(Vec::new())),
                    Some(v) => Ok(Value::tuple(self.iterate(v)?)),
                }
            }
            Builtin::Dict => {
                if args.positional.len() > 1 {
                    return Err(ScriptError::type_error("dict expected at most 1 argument"));
                }
                let mut dict = Dict::default();
                if let Some(source) = args.positional.first() {
                    match source {
                        Value::Dict(other) => dict.entries = other.borrow().entries.clone(),
                        other => {
                            for pair in self.iterate(other)? {
                                let items = self.iterate(&pair)?;
                                let [key, value]: [Value; 2] = items.try_into().map_err(|_| {
                                    ScriptError::value_error("dictionary update sequence element has wrong length")
                                })?;
                                dict.insert(key, value);
                            }
                        }
                    }
                }
                for (key, value) in args.keywords {
                    dict.insert(Value::str(key), value);
                }
                Ok(Value::Dict(Rc::new(std::cell::RefCell::new(dict))))
            }
            Builtin::Isinstance => {
                args.check(name, &["obj", "class_or_tuple"])?;
                let object = args.require(name, 0, "obj")?;
                let classes = match args.require(name, 1, "class_or_tuple")? {
                    Value::Tuple(items) => items.to_vec(),
                    other => vec![other.clone()],
                };
                let mut result = false;
                for class in &classes {
                    result |= match (class, object) {
                        (Value::Builtin(Builtin::Int), Value::Int(_) | Value::Bool(_)) => true,
                        (Value::Builtin(Builtin::Float), Value::Float(_)) => true,
                        (Value::Builtin(Builtin::Str), Value::Str(_)) => true,
                        (Value::Builtin(Builtin::Bool), Value::Bool(_)) => true,
                        (Value::Builtin(Builtin::List), Value::List(_)) => true,
                        (Value::Builtin(Builtin::Tuple), Value::Tuple(_)) => true,
                        (Value::Builtin(Builtin::Dict), Value::Dict(_)) => true,
                        (Value::Builtin(Builtin::DateTime), Value::DateTime(_)) => true,
                        (Value::Builtin(Builtin::Date), Value::Date(_)) => true,
                        (Value::StrategyBase, Value::Instance(inst)) => inst.class.is_strategy,
                        (Value::Class(class), Value::Instance(inst)) => derives_from(&inst.class, class),
                        (Value::Builtin(_) | Value::Class(_) | Value::StrategyBase | Value::IndicatorClass(_), _) => false,
                        (other, _) => {
                            return Err(ScriptError::type_error(format!(
                                "isinstance() arg 2 must be a type or tuple of types, not {}",
                                other.type_name()
                            )))
                        }
                    };
                }
                Ok(Value::Bool(result))
            }
            Builtin::Enumerate => {
                args.check(name, &["iterable", "start"])?;
                let items = self.iterate(args.require(name, 0, "iterable")?)?;
                let start = match args.get(1, "start") {
                    Some(v) => Self::int_arg(name, v)?,
                    None => 0,
                };
                Ok(Value::list(
                    items
                        .into_iter()
                        .enumerate()
                        .map(|(i, v)| Value::tuple(vec![Value::Int(start + i as i64), v]))
                        .collect(),
                ))
            }
            Builtin::Zip => {
                if !args.keywords.is_empty() {
                    return Err(ScriptError::type_error("zip() takes no keyword arguments"));
                }
                let columns = args
                    .positional
                    .iter()
                    .map(|v| self.iterate(v))
                    .collect::<ScriptResult<Vec<_>>>()?;
                let len = columns.iter().map(Vec::len).min().unwrap_or(0);
                Ok(Value::list(
                    (0..len)
                        .map(|i| Value::tuple(columns.iter().map(|c| c[i].clone()).collect()))
                        .collect(),
                ))
            }
            Builtin::Sorted => {
                if args.positional.len() != 1 {
                    return Err(ScriptError::type_error("sorted expected 1 argument"));
                }
                let items = self.iterate(args.require(name, 0, "iterable")?)?;
                let key = args.keyword("key").filter(|k| !k.is_none()).cloned();
                let reverse = args.keyword("reverse").map(|v| self.truthy(v)).unwrap_or(false);
                for (k, _) in &args.keywords {
                    if k != "key" && k != "reverse" {
                        return Err(ScriptError::type_error(format!(
                            "sorted() got an unexpected keyword argument '{}'",
                            k
                        )));
                    }
                }
                let mut keyed = Vec::with_capacity(items.len());
                for item in items {
                    let sort_key = match &key {
                        Some(func) => self.call_value(func.clone(), Args::new(vec![item.clone()]))?,
                        None => self.concrete(item.clone()),
                    };
                    keyed.push((sort_key, item));
                }
                let mut failure = None;
                keyed.sort_by(|(a, _), (b, _)| match self.ordering(a, b) {
                    Ok(order) => order.unwrap_or(Ordering::Equal),
                    Err(err) => {
                        failure.get_or_insert(err);
                        Ordering::Equal
                    }
                });
                if let Some(err) = failure {
                    return Err(err);
                }
                let mut sorted: Vec<Value> = keyed.into_iter().map(|(_, v)| v).collect();
                if reverse {
                    sorted.reverse();
                }
                Ok(Value::list(sorted))
            }
            Builtin::Reversed => {
                args.check(name, &["sequence"])?;
                let mut items = self.iterate(args.require(name, 0, "sequence")?)?;
                items.reverse();
                Ok(Value::list(items))
            }
            Builtin::Any | Builtin::All => {
                args.check(name, &["iterable"])?;
                let items = self.iterate(args.require(name, 0, "iterable")?)?;
                let result = if builtin == Builtin::Any {
                    items.iter().any(|v| self.truthy(v))
                } else {
                    items.iter().all(|v| self.truthy(v))
                };
                Ok(Value::Bool(result))
            }
            Builtin::Super => match args.positional.as_slice() {
                [] => self.implicit_super(),
                [Value::Class(class), Value::Instance(instance)] => Ok(Value::Super {
                    instance: instance.clone(),
                    class: class.clone(),
                }),
                _ => Err(ScriptError::type_error("super() expects no arguments or (type, obj)")),
            },
            Builtin::Pow => {
                args.check(name, &["base", "exp"])?;
                let base = args.require(name, 0, "base")?.clone();
                let exp = args.require(name, 1, "exp")?.clone();
                self.binary(crate::ast::BinOp::Pow, &base, &exp)
            }
            Builtin::Divmod => {
                args.check(name, &["a", "b"])?;
                let a = args.require(name, 0, "a")?.clone();
                let b = args.require(name, 1, "b")?.clone();
                let quotient = self.binary(crate::ast::BinOp::FloorDiv, &a, &b)?;
                let remainder = self.binary(crate::ast::BinOp::Mod, &a, &b)?;
                Ok(Value::tuple(vec![quotient, remainder]))
            }
            Builtin::Math(func) => self.call_math(func, &args),
            Builtin::DateTime => {
                args.check(name, &["year", "month", "day", "hour", "minute", "second", "microsecond"])?;
                let mut parts = [0i64; 7];
                for (i, field) in ["year", "month", "day", "hour", "minute", "second", "microsecond"]
                    .iter()
                    .enumerate()
                {
                    parts[i] = match args.get(i, field) {
                        Some(v) => Self::int_arg(name, v)?,
                        None if i < 3 => {
                            return Err(ScriptError::type_error(format!(
                                "datetime() missing required argument '{}'",
                                field
                            )))
                        }
                        None => 0,
                    };
                }
                let date = make_date(parts[0], parts[1], parts[2])?;
                let time = u32::try_from(parts[6])
                    .ok()
                    .and_then(|micro| {
                        NaiveTime::from_hms_micro_opt(
                            u32::try_from(parts[3]).ok()?,
                            u32::try_from(parts[4]).ok()?,
                            u32::try_from(parts[5]).ok()?,
                            micro,
                        )
                    })
                    .ok_or_else(|| ScriptError::value_error("time component out of range"))?;
                Ok(Value::DateTime(date.and_time(time)))
            }
            Builtin::Date => {
                args.check(name, &["year", "month", "day"])?;
                let year = Self::int_arg(name, args.require(name, 0, "year")?)?;
                let month = Self::int_arg(name, args.require(name, 1, "month")?)?;
                let day = Self::int_arg(name, args.require(name, 2, "day")?)?;
                Ok(Value::Date(make_date(year, month, day)?))
            }
            Builtin::Num2Date => {
                args.check(name, &["x"])?;
                match args.require(name, 0, "x")? {
                    Value::DateTime(dt) => Ok(Value::DateTime(*dt)),
                    Value::Date(d) => Ok(Value::DateTime(d.and_time(NaiveTime::default()))),
                    other => Err(ScriptError::type_error(format!(
                        "num2date() expects a datetime, not '{}'",
                        other.type_name()
                    ))),
                }
            }
        }
    }

    fn call_math(&self, func: MathFn, args: &Args) -> ScriptResult<Value> {
        let name = func.name();
        let x = self.float_arg(name, args.require(name, 0, "x")?)?;
        let domain = || ScriptError::value_error("math domain error");
        let value = match func {
            MathFn::Sqrt => {
                if x < 0.0 {
                    return Err(domain());
                }
                x.sqrt()
            }
            MathFn::Log => {
                if x <= 0.0 {
                    return Err(domain());
                }
                match args.get(1, "base") {
                    Some(base) => x.ln() / self.float_arg(name, base)?.ln(),
                    None => x.ln(),
                }
            }
            MathFn::Log10 | MathFn::Log2 if x <= 0.0 => return Err(domain()),
            MathFn::Log10 => x.log10(),
            MathFn::Log2 => x.log2(),
            MathFn::Exp => x.exp(),
            MathFn::Floor | MathFn::Ceil | MathFn::Trunc => {
                if !x.is_finite() {
                    return Err(ScriptError::value_error("cannot convert float NaN or infinity to integer"));
                }
                let rounded = match func {
                    MathFn::Floor => x.floor(),
                    MathFn::Ceil => x.ceil(),
                    _ => x.trunc(),
                };
                return Ok(Value::Int(rounded as i64));
            }
            MathFn::Fabs => x.abs(),
            MathFn::Pow => x.powf(self.float_arg(name, args.require(name, 1, "y")?)?),
            MathFn::IsNan => return Ok(Value::Bool(x.is_nan())),
            MathFn::IsInf => return Ok(Value::Bool(x.is_infinite())),
            MathFn::IsFinite => return Ok(Value::Bool(x.is_finite())),
            MathFn::Sin => x.sin(),
            MathFn::Cos => x.cos(),
            MathFn::Tan => x.tan(),
            MathFn::Atan => x.atan(),
        };
        Ok(Value::Float(value))
    }

    /// `bt.indicators.X(...)`: inputs come first, then the period.
    pub(crate) fn make_indicator(&mut self, class: IndicatorClass, args: Args) -> ScriptResult<Value> {
        let name = class.name();
        for (key, _) in &args.keywords {
            if !matches!(key.as_str(), "period" | "plot" | "plotname" | "subplot") {
                return Err(ScriptError::type_error(format!(
                    "{}() got an unexpected keyword argument '{}'",
                    name, key
                )));
            }
        }

        let mut inputs = Vec::new();
        let mut rest = Vec::new();
        for value in args.positional.iter().cloned() {
            let source = match &value {
                Value::Feed(feed) => Some(Source::Line(LineRef {
                    feed: *feed,
                    field: LineField::Close,
                })),
                Value::Line(line) => Some(Source::Line(*line)),
                Value::Indicator(ind) => Some(Source::Indicator(ind.clone())),
                Value::Int(_) | Value::Float(_) if !inputs.is_empty() && inputs.len() < class.inputs() => {
                    self.number(&value).map(Source::Const)
                }
                _ => None,
            };
            match source {
                Some(source) if inputs.len() < class.inputs() => inputs.push(source),
                _ => rest.push(value),
            }
        }
        if inputs.is_empty() && class.inputs() == 1 {
            inputs.push(Source::Line(LineRef {
                feed: 0,
                field: LineField::Close,
            }));
        }
        if inputs.len() != class.inputs() {
            return Err(ScriptError::type_error(format!(
                "{}() requires {} data inputs, got {}",
                name,
                class.inputs(),
                inputs.len()
            )));
        }

        let period_arg = args.keyword("period").or(rest.first());
        if rest.len() > usize::from(args.keyword("period").is_none()) {
            return Err(ScriptError::type_error(format!("{}() got too many positional arguments", name)));
        }
        let period = match period_arg {
            Some(value) => {
                let period = value
                    .as_int()
                    .ok_or_else(|| ScriptError::type_error(format!("{}() period must be an integer", name)))?;
                if period < 1 {
                    return Err(ScriptError::value_error(format!("{}() period must be at least 1", name)));
                }
                period as usize
            }
            None => class
                .default_period()
                .ok_or_else(|| ScriptError::type_error(format!("{}() requires a 'period' argument", name)))?,
        };

        let indicator = Indicator::new(class.kind(period), name, inputs);
        if self.runtime.in_init {
            self.runtime.min_period = self.runtime.min_period.max(indicator.min_period);
        }
        Ok(Value::Indicator(Rc::new(indicator)))
    }
}

fn derives_from(class: &Rc<crate::value::Class>, target: &Rc<crate::value::Class>) -> bool {
    Rc::ptr_eq(class, target) || class.bases.iter().any(|base| derives_from(base, target))
}

fn make_date(year: i64, month: i64, day: i64) -> ScriptResult<NaiveDate> {
    let year = i32::try_from(year).ok();
    let month = u32::try_from(month).ok();
    let day = u32::try_from(day).ok();
    let date = match (year, month, day) {
        (Some(y), Some(m), Some(d)) => NaiveDate::from_ymd_opt(y, m, d),
        _ => None,
    };
    date.ok_or_else(|| ScriptError::value_error("day is out of range for month"))
}
