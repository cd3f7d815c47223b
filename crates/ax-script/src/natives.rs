// Attributes and methods the runtime implements natively

use std::rc::Rc;

use ax_types::{OrderRequest, Side};
use chrono::format::{Item, StrftimeItems};
use chrono::{Datelike, NaiveDateTime, NaiveTime, Timelike};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::builtins::{self, Builtin};
use crate::error::{ScriptError, ScriptResult};
use crate::format::{apply_spec, parse_template, Field};
use crate::indicators::LineRef;
use crate::interp::Interpreter;
use crate::runtime::{repeated_len, LineField, OrderHandle};
use crate::value::{Args, Dict, ExecutedView, Value};

const STR_METHODS: &[&str] = &[
    "upper", "lower", "strip", "lstrip", "rstrip", "title", "capitalize", "startswith", "endswith", "format",
    "join", "split", "replace", "find", "count", "isdigit", "zfill",
];
const LIST_METHODS: &[&str] = &[
    "append", "pop", "extend", "insert", "index", "count", "clear", "copy", "sort", "reverse", "remove",
];
const DICT_METHODS: &[&str] = &["get", "keys", "values", "items", "pop", "setdefault", "update", "copy", "clear"];
const STRATEGY_METHODS: &[&str] = &[
    "buy", "sell", "close", "cancel", "log", "getposition", "getdatabyname", "__init__", "start", "prenext",
    "nextstart", "next", "stop", "notify_order", "notify_trade",
];

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(f64::NAN)
}

fn strftime(format: &str, render: impl FnOnce(StrftimeItems<'_>) -> String) -> ScriptResult<String> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(ScriptError::value_error(format!("invalid format string '{}'", format)));
    }
    Ok(render(StrftimeItems::new(format)))
}

impl Interpreter {
    /// Attribute of a strategy instance served by the runtime.
    pub(crate) fn strategy_attr(&self, object: &Value, name: &str) -> Option<Value> {
        let feeds = self.runtime.market.feeds.len();
        match name {
            "data" | "data0" => Some(Value::Feed(0)),
            "datas" => Some(Value::list((0..feeds.max(1)).map(Value::Feed).collect())),
            "datetime" => Some(Value::DateTimeLine(0)),
            "position" => Some(Value::Position(0)),
            "broker" => Some(Value::Broker),
            _ if STRATEGY_METHODS.contains(&name) => Some(Value::native(object.clone(), name)),
            _ => {
                let index: usize = name.strip_prefix("data")?.parse().ok()?;
                (index < feeds).then_some(Value::Feed(index))
            }
        }
    }

    pub(crate) fn native_attr(&self, object: &Value, name: &str) -> ScriptResult<Option<Value>> {
        let market = &self.runtime.market;
        let method = |names: &[&str]| names.contains(&name).then(|| Value::native(object.clone(), name));
        Ok(match object {
            Value::Str(_) => method(STR_METHODS),
            Value::List(_) => method(LIST_METHODS),
            Value::Dict(_) => method(DICT_METHODS),
            Value::Feed(feed) => match name {
                "datetime" => Some(Value::DateTimeLine(*feed)),
                "_name" | "name" => Some(Value::str(
                    market.feeds.get(*feed).map(|f| f.name.as_str()).unwrap_or_default(),
                )),
                "get" => method(&["get"]),
                _ => LineField::parse(name).map(|field| Value::Line(LineRef { feed: *feed, field })),
            },
            Value::Line(_) | Value::Indicator(_) => method(&["get"]),
            Value::DateTimeLine(_) => method(&["date", "datetime", "time"]),
            Value::Position(feed) => match name {
                "size" => Some(Value::Float(market.position_size(*feed))),
                "price" => Some(Value::Float(market.position_price(*feed))),
                _ => None,
            },
            Value::Broker => method(&["getvalue", "getcash", "get_value", "get_cash", "getposition"]),
            Value::Params(params) => params
                .borrow()
                .iter()
                .find(|(k, _)| k.as_str() == name)
                .map(|(_, v)| v.clone()),
            Value::Order(order) => self.order_attr(object, order, name),
            Value::Trade(trade) => {
                let signed = match trade.direction {
                    Side::Buy => trade.size,
                    Side::Sell => -trade.size,
                };
                match name {
                    "isclosed" => Some(Value::Bool(trade.is_closed())),
                    "isopen" => Some(Value::Bool(trade.is_open())),
                    "justopened" => Some(Value::Bool(false)),
                    "long" => Some(Value::Bool(trade.is_long())),
                    "status" => Some(Value::Int(if trade.is_closed() { 2 } else { 1 })),
                    "pnl" => Some(Value::Float(to_f64(trade.pnl))),
                    "pnlcomm" => Some(Value::Float(to_f64(trade.pnl_comm))),
                    "size" => Some(Value::Float(to_f64(signed))),
                    "price" => Some(Value::Float(to_f64(trade.price))),
                    "value" => Some(Value::Float(to_f64(trade.size * trade.price))),
                    "commission" => Some(Value::Float(to_f64(trade.commission))),
                    "data" => Some(Value::Feed(trade.feed)),
                    "dtopen" => Some(Value::DateTime(trade.opened_at)),
                    "dtclose" => Some(trade.closed_at.map(Value::DateTime).unwrap_or(Value::None)),
                    _ => None,
                }
            }
            Value::Executed(view) => match name {
                "price" => Some(Value::Float(view.price)),
                "size" => Some(Value::Float(view.size)),
                "comm" => Some(Value::Float(view.comm)),
                "value" => Some(Value::Float(view.value)),
                "dt" => Some(view.dt.map(Value::DateTime).unwrap_or(Value::None)),
                _ => None,
            },
            Value::DateTime(dt) => match name {
                "year" => Some(Value::Int(dt.year() as i64)),
                "month" => Some(Value::Int(dt.month() as i64)),
                "day" => Some(Value::Int(dt.day() as i64)),
                "hour" => Some(Value::Int(dt.hour() as i64)),
                "minute" => Some(Value::Int(dt.minute() as i64)),
                "second" => Some(Value::Int(dt.second() as i64)),
                "microsecond" => Some(Value::Int((dt.nanosecond() / 1_000) as i64)),
                _ => method(&["isoformat", "strftime", "date", "time", "weekday", "isoweekday", "timestamp"]),
            },
            Value::Date(d) => match name {
                "year" => Some(Value::Int(d.year() as i64)),
                "month" => Some(Value::Int(d.month() as i64)),
                "day" => Some(Value::Int(d.day() as i64)),
                _ => method(&["isoformat", "strftime", "weekday", "isoweekday"]),
            },
            _ => None,
        })
    }

    fn order_attr(&self, object: &Value, order: &Rc<OrderHandle>, name: &str) -> Option<Value> {
        let state = order.state.borrow();
        match name {
            "status" => Some(Value::Int(state.status.code())),
            "ref" => Some(Value::Int(order.ref_num)),
            "size" => Some(order.signed_size().map(Value::Float).unwrap_or(Value::None)),
            "data" => Some(Value::Feed(order.feed)),
            "executed" => {
                let view = match &state.executed {
                    Some(exec) => ExecutedView {
                        price: to_f64(exec.price),
                        size: match order.side {
                            Side::Buy => to_f64(exec.size),
                            Side::Sell => -to_f64(exec.size),
                        },
                        comm: to_f64(exec.commission),
                        value: to_f64(exec.value),
                        dt: Some(exec.executed_at),
                    },
                    None => ExecutedView::default(),
                };
                Some(Value::Executed(Rc::new(view)))
            }
            "isbuy" | "issell" | "alive" | "getstatusname" => Some(Value::native(object.clone(), name)),
            _ => builtins::order_constant(name),
        }
    }

    pub(crate) fn call_native(&mut self, receiver: Value, name: &str, args: Args) -> ScriptResult<Value> {
        match &receiver {
            Value::Str(text) => self.str_method(text, name, args),
            Value::List(_) => self.list_method(&receiver, name, args),
            Value::Dict(_) => self.dict_method(&receiver, name, args),
            Value::Instance(_) => self.strategy_method(name, args),
            Value::Feed(feed) => self.line_get(
                &Value::Line(LineRef {
                    feed: *feed,
                    field: LineField::Close,
                }),
                args,
            ),
            Value::Line(_) | Value::Indicator(_) => self.line_get(&receiver, args),
            Value::DateTimeLine(feed) => {
                args.check(name, &["ago"])?;
                let ago = args.get(0, "ago").and_then(Value::as_int).unwrap_or(0);
                let market = &self.runtime.market;
                let stamp = market
                    .index_for(*feed, ago)
                    .and_then(|i| market.row(*feed, i))
                    .map(|row| row.date)
                    .ok_or_else(|| ScriptError::index_error("array index out of range"))?;
                Ok(match name {
                    "date" => Value::Date(stamp.date()),
                    "time" => Value::str(stamp.time().format("%H:%M:%S").to_string()),
                    _ => Value::DateTime(stamp),
                })
            }
            Value::Broker => {
                let market = &self.runtime.market;
                match name {
                    "getvalue" | "get_value" => Ok(Value::Float(to_f64(market.value))),
                    "getcash" | "get_cash" => Ok(Value::Float(to_f64(market.cash))),
                    _ => Ok(Value::Position(self.feed_arg(&args, 0)?)),
                }
            }
            Value::Order(order) => {
                let status = order.state.borrow().status;
                match name {
                    "isbuy" => Ok(Value::Bool(order.side == Side::Buy)),
                    "issell" => Ok(Value::Bool(order.side == Side::Sell)),
                    "alive" => Ok(Value::Bool(status.is_active())),
                    _ => {
                        let code = args.get(0, "status").and_then(Value::as_int).unwrap_or(status.code());
                        match builtins::order_constant("Status") {
                            Some(Value::List(names)) => names
                                .borrow()
                                .get(code as usize)
                                .cloned()
                                .ok_or_else(|| ScriptError::index_error("status code out of range")),
                            _ => Ok(Value::None),
                        }
                    }
                }
            }
            Value::DateTime(dt) => self.datetime_method(*dt, name, args),
            Value::Date(d) => match name {
                "isoformat" => Ok(Value::str(d.format("%Y-%m-%d").to_string())),
                "strftime" => {
                    let format = self.str_arg(&args, 0, "format")?;
                    strftime(&format, |items| d.format_with_items(items).to_string()).map(Value::str)
                }
                "weekday" => Ok(Value::Int(d.weekday().num_days_from_monday() as i64)),
                _ => Ok(Value::Int(d.weekday().number_from_monday() as i64)),
            },
            other => Err(ScriptError::attribute_error(&other.type_name(), name)),
        }
    }

    fn str_arg(&self, args: &Args, index: usize, name: &str) -> ScriptResult<Rc<str>> {
        match args.get(index, name) {
            Some(Value::Str(s)) => Ok(s.clone()),
            Some(other) => Err(ScriptError::type_error(format!(
                "argument '{}' must be str, not {}",
                name,
                other.type_name()
            ))),
            None => Err(ScriptError::type_error(format!("missing required argument: '{}'", name))),
        }
    }

    fn feed_arg(&self, args: &Args, index: usize) -> ScriptResult<usize> {
        match args.get(index, "data") {
            None => Ok(0),
            Some(Value::Feed(feed)) => Ok(*feed),
            Some(other) => Err(ScriptError::type_error(format!(
                "expected a data feed, got '{}'",
                other.type_name()
            ))),
        }
    }

    /// `line.get(ago=0, size=1)`: the `size` values ending `ago` bars back.
    fn line_get(&self, line: &Value, args: Args) -> ScriptResult<Value> {
        args.check("get", &["ago", "size"])?;
        let ago = args.get(0, "ago").and_then(Value::as_int).unwrap_or(0);
        let size = args.get(1, "size").and_then(Value::as_int).unwrap_or(1).max(0) as usize;
        let market = &self.runtime.market;
        let feed = match line {
            Value::Line(l) => l.feed,
            Value::Indicator(ind) => ind.feed,
            _ => 0,
        };
        let Some(end) = market.index_for(feed, ago) else {
            return Ok(Value::list(Vec::new()));
        };
        if end + 1 < size {
            return Ok(Value::list(Vec::new()));
        }
        let values = (end + 1 - size..=end)
            .map(|i| match line {
                Value::Line(l) => market.row(l.feed, i).map(|row| l.field.read(row)).unwrap_or(f64::NAN),
                Value::Indicator(ind) => ind.value_at(i, market).unwrap_or(f64::NAN),
                _ => f64::NAN,
            })
            .map(Value::Float)
            .collect();
        Ok(Value::list(values))
    }

    fn strategy_method(&mut self, name: &str, args: Args) -> ScriptResult<Value> {
        match name {
            "buy" => self.submit_order(Side::Buy, args),
            "sell" => self.submit_order(Side::Sell, args),
            "close" => {
                args.check(name, &["data", "size"])?;
                let feed = self.feed_arg(&args, 0)?;
                let position = self.runtime.market.position_decimal(feed);
                if position.is_zero() {
                    return Ok(Value::None);
                }
                let size = match args.get(1, "size") {
                    Some(value) => self.order_size(value)?,
                    None => position.abs(),
                };
                let side = if position > Decimal::ZERO { Side::Sell } else { Side::Buy };
                let handle = self.runtime.submit(OrderRequest::market(feed, side).with_size(size));
                Ok(Value::Order(handle))
            }
            "cancel" => {
                args.check(name, &["order"])?;
                match args.get(0, "order") {
                    Some(Value::Order(order)) => {
                        if order.state.borrow().status.is_active() {
                            self.runtime.cancel(order.id);
                        }
                        Ok(Value::None)
                    }
                    None => Ok(Value::None),
                    Some(other) => Err(ScriptError::type_error(format!(
                        "cancel() expects an order, got '{}'",
                        other.type_name()
                    ))),
                }
            }
            "log" => {
                args.check(name, &["txt", "dt", "doprint"])?;
                let text = args.get(0, "txt").map(|v| self.to_str(v)).unwrap_or_default();
                let timestamp = match args.get(1, "dt") {
                    Some(Value::DateTime(dt)) => Some(*dt),
                    Some(Value::Date(d)) => Some(d.and_time(NaiveTime::default())),
                    _ => None,
                };
                self.runtime.log(timestamp, text);
                Ok(Value::None)
            }
            "getposition" => {
                args.check(name, &["data"])?;
                Ok(Value::Position(self.feed_arg(&args, 0)?))
            }
            "getdatabyname" => {
                args.check(name, &["name"])?;
                let wanted = self.str_arg(&args, 0, "name")?;
                self.runtime
                    .market
                    .feed_index(&wanted)
                    .map(Value::Feed)
                    .ok_or_else(|| ScriptError::new("KeyError", format!("'{}'", wanted)))
            }
            // Base-class hooks reached through super()
            _ => Ok(Value::None),
        }
    }

    fn order_size(&self, value: &Value) -> ScriptResult<Decimal> {
        let size = self
            .number(value)
            .ok_or_else(|| ScriptError::type_error("order size must be a number"))?;
        if !(size > 0.0) || !size.is_finite() {
            return Err(ScriptError::value_error(format!("order size must be positive, got {}", size)));
        }
        Decimal::from_f64(size).ok_or_else(|| ScriptError::value_error("order size out of range"))
    }

    fn submit_order(&mut self, side: Side, args: Args) -> ScriptResult<Value> {
        let func = side.as_str();
        args.check(func, &["data", "size", "price", "exectype"])?;
        if args.get(2, "price").is_some() {
            return Err(ScriptError::value_error("only market orders are supported; price must be None"));
        }
        match args.get(3, "exectype") {
            None | Some(Value::Int(0)) => {}
            Some(_) => return Err(ScriptError::value_error("only market orders are supported")),
        }
        let feed = self.feed_arg(&args, 0)?;
        let mut request = OrderRequest::market(feed, side);
        if let Some(size) = args.get(1, "size") {
            request = request.with_size(self.order_size(size)?);
        }
        Ok(Value::Order(self.runtime.submit(request)))
    }

    fn datetime_method(&self, dt: NaiveDateTime, name: &str, args: Args) -> ScriptResult<Value> {
        match name {
            "isoformat" => {
                let sep = match args.get(0, "sep") {
                    Some(Value::Str(s)) => s.to_string(),
                    _ => "T".to_string(),
                };
                Ok(Value::str(format!("{}{}{}", dt.date().format("%Y-%m-%d"), sep, dt.time().format("%H:%M:%S"))))
            }
            "strftime" => {
                let format = self.str_arg(&args, 0, "format")?;
                strftime(&format, |items| dt.format_with_items(items).to_string()).map(Value::str)
            }
            "date" => Ok(Value::Date(dt.date())),
            "time" => Ok(Value::str(dt.time().format("%H:%M:%S").to_string())),
            "weekday" => Ok(Value::Int(dt.weekday().num_days_from_monday() as i64)),
            "isoweekday" => Ok(Value::Int(dt.weekday().number_from_monday() as i64)),
            _ => Ok(Value::Float(dt.and_utc().timestamp_millis() as f64 / 1000.0)),
        }
    }

    fn str_method(&mut self, text: &Rc<str>, name: &str, args: Args) -> ScriptResult<Value> {
        let s: &str = text;
        match name {
            "upper" => Ok(Value::str(s.to_uppercase())),
            "lower" => Ok(Value::str(s.to_lowercase())),
            "strip" | "lstrip" | "rstrip" => {
                let chars: Option<Vec<char>> = match args.get(0, "chars") {
                    Some(Value::Str(c)) => Some(c.chars().collect()),
                    _ => None,
                };
                let pred = |c: char| match &chars {
                    Some(set) => set.contains(&c),
                    None => c.is_whitespace(),
                };
                Ok(Value::str(match name {
                    "strip" => s.trim_matches(pred),
                    "lstrip" => s.trim_start_matches(pred),
                    _ => s.trim_end_matches(pred),
                }))
            }
            "title" => {
                let mut out = String::with_capacity(s.len());
                let mut boundary = true;
                for c in s.chars() {
                    if boundary {
                        out.extend(c.to_uppercase());
                    } else {
                        out.extend(c.to_lowercase());
                    }
                    boundary = !c.is_alphabetic();
                }
                Ok(Value::str(out))
            }
            "capitalize" => {
                let mut chars = s.chars();
                Ok(Value::str(match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                    None => String::new(),
                }))
            }
            "startswith" | "endswith" => {
                let candidates = match args.require(name, 0, "prefix")? {
                    Value::Str(p) => vec![p.clone()],
                    Value::Tuple(items) => items
                        .iter()
                        .map(|v| match v {
                            Value::Str(p) => Ok(p.clone()),
                            other => Err(ScriptError::type_error(format!(
                                "tuple for {} must only contain str, not {}",
                                name,
                                other.type_name()
                            ))),
                        })
                        .collect::<ScriptResult<Vec<_>>>()?,
                    other => {
                        return Err(ScriptError::type_error(format!(
                            "{} first arg must be str or a tuple of str, not {}",
                            name,
                            other.type_name()
                        )))
                    }
                };
                let hit = candidates.iter().any(|p| {
                    if name == "startswith" {
                        s.starts_with(&**p)
                    } else {
                        s.ends_with(&**p)
                    }
                });
                Ok(Value::Bool(hit))
            }
            "format" => self.str_format(s, &args),
            "join" => {
                let items = self.iterate(args.require(name, 0, "iterable")?)?;
                let mut parts = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    match item {
                        Value::Str(part) => parts.push(part.to_string()),
                        other => {
                            return Err(ScriptError::type_error(format!(
                                "sequence item {}: expected str instance, {} found",
                                i,
                                other.type_name()
                            )))
                        }
                    }
                }
                Ok(Value::str(parts.join(s)))
            }
            "split" => {
                let limit = args.get(1, "maxsplit").and_then(Value::as_int).unwrap_or(-1);
                let parts: Vec<Value> = match args.get(0, "sep") {
                    Some(Value::Str(sep)) if sep.is_empty() => {
                        return Err(ScriptError::value_error("empty separator"));
                    }
                    Some(Value::Str(sep)) if limit >= 0 => {
                        s.splitn(limit as usize + 1, &**sep).map(Value::str).collect()
                    }
                    Some(Value::Str(sep)) => s.split(&**sep).map(Value::str).collect(),
                    _ => s.split_whitespace().map(Value::str).collect(),
                };
                Ok(Value::list(parts))
            }
            "replace" => {
                let old = self.str_arg(&args, 0, "old")?;
                let new = self.str_arg(&args, 1, "new")?;
                Ok(Value::str(s.replace(&*old, &new)))
            }
            "find" => {
                let sub = self.str_arg(&args, 0, "sub")?;
                Ok(Value::Int(match s.find(&*sub) {
                    Some(byte) => s[..byte].chars().count() as i64,
                    None => -1,
                }))
            }
            "count" => {
                let sub = self.str_arg(&args, 0, "sub")?;
                let count = if sub.is_empty() {
                    s.chars().count() + 1
                } else {
                    s.matches(&*sub).count()
                };
                Ok(Value::Int(count as i64))
            }
            "isdigit" => Ok(Value::Bool(!s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))),
            _ => {
                let width = usize::try_from(args.require(name, 0, "width")?.as_int().unwrap_or(0)).unwrap_or(0);
                repeated_len(width, 1)?;
                let len = s.chars().count();
                if len >= width {
                    return Ok(Value::Str(text.clone()));
                }
                let (sign, digits) = match s.strip_prefix(['-', '+']) {
                    Some(rest) => (&s[..1], rest),
                    None => ("", s),
                };
                Ok(Value::str(format!("{}{}{}", sign, "0".repeat(width - len), digits)))
            }
        }
    }

    fn str_format(&self, template: &str, args: &Args) -> ScriptResult<Value> {
        let mut out = String::new();
        let mut auto = 0usize;
        for field in parse_template(template)? {
            match field {
                Field::Literal(text) => out.push_str(&text),
                Field::Replace { name, conversion, spec } => {
                    let value = if name.is_empty() {
                        let value = args.positional.get(auto).cloned();
                        auto += 1;
                        value
                    } else if let Ok(index) = name.parse::<usize>() {
                        args.positional.get(index).cloned()
                    } else {
                        args.keyword(&name).cloned()
                    };
                    let value = value.ok_or_else(|| {
                        if name.is_empty() || name.parse::<usize>().is_ok() {
                            ScriptError::index_error("Replacement index out of range for positional args tuple")
                        } else {
                            ScriptError::new("KeyError", format!("'{}'", name))
                        }
                    })?;
                    let value = match conversion {
                        Some('r') => Value::str(self.repr(&value)),
                        Some(_) => Value::str(self.to_str(&value)),
                        None => value,
                    };
                    if spec.is_empty() {
                        out.push_str(&self.to_str(&value));
                    } else {
                        out.push_str(&apply_spec(&self.format_arg(&value), &spec)?);
                    }
                }
            }
        }
        Ok(Value::str(out))
    }

    fn list_method(&mut self, receiver: &Value, name: &str, args: Args) -> ScriptResult<Value> {
        let Value::List(list) = receiver else {
            return Err(ScriptError::attribute_error(&receiver.type_name(), name));
        };
        match name {
            "append" => {
                let item = args.positional.into_iter().next().unwrap_or(Value::None);
                list.borrow_mut().push(item);
                Ok(Value::None)
            }
            "pop" => {
                let mut items = list.borrow_mut();
                if items.is_empty() {
                    return Err(ScriptError::index_error("pop from empty list"));
                }
                let index = args.get(0, "index").and_then(Value::as_int).unwrap_or(-1);
                let len = items.len() as i64;
                let idx = if index < 0 { index + len } else { index };
                if idx < 0 || idx >= len {
                    return Err(ScriptError::index_error("pop index out of range"));
                }
                Ok(items.remove(idx as usize))
            }
            "extend" => {
                let items = self.iterate(args.require(name, 0, "iterable")?)?;
                list.borrow_mut().extend(items);
                Ok(Value::None)
            }
            "insert" => {
                let index = args
                    .require(name, 0, "index")?
                    .as_int()
                    .ok_or_else(|| ScriptError::type_error("list indices must be integers"))?;
                let item = args.positional.get(1).cloned().unwrap_or(Value::None);
                let mut items = list.borrow_mut();
                let len = items.len() as i64;
                let idx = if index < 0 { (index + len).max(0) } else { index.min(len) };
                items.insert(idx as usize, item);
                Ok(Value::None)
            }
            "index" | "count" | "remove" => {
                let needle = args.positional.first().cloned().unwrap_or(Value::None);
                let snapshot = list.borrow().clone();
                let position = snapshot.iter().position(|v| self.values_eq(v, &needle));
                match name {
                    "count" => Ok(Value::Int(
                        snapshot.iter().filter(|v| self.values_eq(v, &needle)).count() as i64,
                    )),
                    _ => {
                        let idx = position.ok_or_else(|| {
                            ScriptError::value_error(format!("{} is not in list", self.repr(&needle)))
                        })?;
                        if name == "remove" {
                            list.borrow_mut().remove(idx);
                            Ok(Value::None)
                        } else {
                            Ok(Value::Int(idx as i64))
                        }
                    }
                }
            }
            "clear" => {
                list.borrow_mut().clear();
                Ok(Value::None)
            }
            "copy" => Ok(Value::list(list.borrow().clone())),
            "sort" => {
                let sorted = self.call_builtin(
                    Builtin::Sorted,
                    Args {
                        positional: vec![receiver.clone()],
                        keywords: args.keywords,
                    },
                )?;
                if let Value::List(sorted) = sorted {
                    let items = sorted.borrow().clone();
                    *list.borrow_mut() = items;
                }
                Ok(Value::None)
            }
            _ => {
                list.borrow_mut().reverse();
                Ok(Value::None)
            }
        }
    }

    fn dict_method(&mut self, receiver: &Value, name: &str, args: Args) -> ScriptResult<Value> {
        let Value::Dict(dict) = receiver else {
            return Err(ScriptError::attribute_error(&receiver.type_name(), name));
        };
        let key = args.positional.first().cloned().unwrap_or(Value::None);
        let default = args.positional.get(1).cloned();
        match name {
            "get" => Ok(dict.borrow().get(&key).cloned().or(default).unwrap_or(Value::None)),
            "keys" => Ok(Value::list(dict.borrow().entries.iter().map(|(k, _)| k.clone()).collect())),
            "values" => Ok(Value::list(dict.borrow().entries.iter().map(|(_, v)| v.clone()).collect())),
            "items" => Ok(Value::list(
                dict.borrow()
                    .entries
                    .iter()
                    .map(|(k, v)| Value::tuple(vec![k.clone(), v.clone()]))
                    .collect(),
            )),
            "pop" => {
                let removed = dict.borrow_mut().remove(&key);
                removed
                    .or(default)
                    .ok_or_else(|| ScriptError::new("KeyError", self.repr(&key)))
            }
            "setdefault" => {
                let existing = dict.borrow().get(&key).cloned();
                match existing {
                    Some(value) => Ok(value),
                    None => {
                        let value = default.unwrap_or(Value::None);
                        dict.borrow_mut().insert(key, value.clone());
                        Ok(value)
                    }
                }
            }
            "update" => {
                let mut entries: Vec<(Value, Value)> = match args.positional.first() {
                    Some(Value::Dict(other)) => other.borrow().entries.clone(),
                    Some(other) => {
                        let mut pairs = Vec::new();
                        for pair in self.iterate(other)? {
                            let items = self.iterate(&pair)?;
                            let [k, v]: [Value; 2] = items.try_into().map_err(|_| {
                                ScriptError::value_error("dictionary update sequence element has wrong length")
                            })?;
                            pairs.push((k, v));
                        }
                        pairs
                    }
                    None => Vec::new(),
                };
                entries.extend(args.keywords.into_iter().map(|(k, v)| (Value::str(k), v)));
                let mut target = dict.borrow_mut();
                for (k, v) in entries {
                    target.insert(k, v);
                }
                Ok(Value::None)
            }
            "copy" => {
                let copy: Dict = dict.borrow().clone();
                Ok(Value::Dict(Rc::new(std::cell::RefCell::new(copy))))
            }
            _ => {
                dict.borrow_mut().entries.clear();
                Ok(Value::None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::interp::Interpreter;
    use crate::parser::parse_module;
    use crate::runtime::{Runtime, SandboxLimits};

    fn run(source: &str) -> Interpreter {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let mut interp = Interpreter::new(Runtime::new(Box::new(tx)), SandboxLimits::default());
        interp.run_module(&parse_module(source).unwrap()).unwrap();
        interp
    }

    fn repr_of(interp: &Interpreter, name: &str) -> String {
        interp.repr(interp.global(name).unwrap())
    }

    #[test]
    fn test_string_methods() {
        let interp = run(
            "a = '  Hi There  '.strip().lower()\nb = 'a,b,,c'.split(',')\nc = 'x y  z'.split()\nd = 'abc'.startswith(('z', 'a'))\ne = '{0}-{name!r}'.format(1, name='n')\nf = '7'.zfill(3)\ng = 'hello'.find('l')\n",
        );
        assert_eq!(repr_of(&interp, "a"), "'hi there'");
        assert_eq!(repr_of(&interp, "b"), "['a', 'b', '', 'c']");
        assert_eq!(repr_of(&interp, "c"), "['x', 'y', 'z']");
        assert_eq!(repr_of(&interp, "d"), "True");
        assert_eq!(interp.to_str(interp.global("e").unwrap()), "1-'n'");
        assert_eq!(repr_of(&interp, "f"), "'007'");
        assert_eq!(repr_of(&interp, "g"), "2");
    }

    #[test]
    fn test_list_methods() {
        let interp = run(
            "xs = [5, 3, 9]\nxs.sort()\nlast = xs.pop()\nxs.insert(0, 1)\nxs.remove(3)\nidx = xs.index(5)\nys = xs.copy()\nys.reverse()\n",
        );
        assert_eq!(repr_of(&interp, "xs"), "[1, 5]");
        assert_eq!(repr_of(&interp, "last"), "9");
        assert_eq!(repr_of(&interp, "idx"), "1");
        assert_eq!(repr_of(&interp, "ys"), "[5, 1]");
    }

    #[test]
    fn test_dict_methods() {
        let interp = run(
            "d = {'a': 1}\nd.update(b=2)\nv = d.get('z', 0)\nd.setdefault('c', [])\nks = d.keys()\np = d.pop('a')\nits = d.items()\n",
        );
        assert_eq!(repr_of(&interp, "v"), "0");
        assert_eq!(repr_of(&interp, "ks"), "['a', 'b', 'c']");
        assert_eq!(repr_of(&interp, "p"), "1");
        assert_eq!(repr_of(&interp, "its"), "[('b', 2), ('c', [])]");
    }

    #[test]
    fn test_datetime_methods() {
        let interp = run(
            "from datetime import datetime\nd = datetime(2024, 3, 4, 9, 5)\na = d.strftime('%Y/%m/%d %H:%M')\nb = d.isoformat()\nc = d.weekday()\ne = d.date().isoformat()\n",
        );
        assert_eq!(repr_of(&interp, "a"), "'2024/03/04 09:05'");
        assert_eq!(repr_of(&interp, "b"), "'2024-03-04T09:05:00'");
        assert_eq!(repr_of(&interp, "c"), "0");
        assert_eq!(repr_of(&interp, "e"), "'2024-03-04'");
    }
}
