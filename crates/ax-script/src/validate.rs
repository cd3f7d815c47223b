// Static checks run before any strategy source is stored or executed

use ax_types::ValidationError;
use tracing::debug;

use crate::ast::*;
use crate::parser::parse_module;

/// Module prefixes that can never be imported
pub const DENIED_MODULES: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "shutil",
    "socket",
    "multiprocessing",
    "threading",
    "ctypes",
    "importlib",
    "builtins",
    "signal",
    "pty",
    "pickle",
    "marshal",
    "requests",
    "urllib",
    "http",
    "pathlib",
    "io",
];

/// Modules the runtime provides besides the simulation library
pub const AVAILABLE_MODULES: &[&str] = &["math", "datetime"];

/// Names the simulation library can be imported under
pub const SIMULATION_MODULES: &[&str] = &["backtrader"];

pub const BANNED_CALLS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "open",
    "__import__",
    "input",
    "globals",
    "locals",
    "getattr",
    "setattr",
    "delattr",
    "vars",
];

/// Dunder attributes scripts may still touch
const ALLOWED_DUNDERS: &[&str] = &["__init__"];

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub denied_modules: Vec<String>,
    pub available_modules: Vec<String>,
    pub simulation_modules: Vec<String>,
    pub banned_calls: Vec<String>,
    pub strategy_base: String,
    pub required_methods: Vec<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        let owned = |names: &[&str]| names.iter().map(|s| s.to_string()).collect();
        Self {
            denied_modules: owned(DENIED_MODULES),
            available_modules: owned(AVAILABLE_MODULES),
            simulation_modules: owned(SIMULATION_MODULES),
            banned_calls: owned(BANNED_CALLS),
            strategy_base: "Strategy".to_string(),
            required_methods: vec!["next".to_string()],
        }
    }
}

/// Static validator for strategy sources
///
/// Validation is advisory: it rejects code early with a readable reason, but
/// the interpreter enforces the same boundaries at run time.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    config: ValidatorConfig,
}

impl Validator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    /// Check `source` and hand it back unchanged when acceptable.
    pub fn validate<'a>(&self, source: &'a str) -> Result<&'a str, ValidationError> {
        let module = parse_module(source)?;

        let mut walker = Walker {
            config: &self.config,
            error: None,
        };
        walker.visit_body(&module.body);
        if let Some(err) = walker.error {
            debug!(error = %err, "Strategy source rejected");
            return Err(err);
        }

        self.check_strategy_class(&module)?;
        Ok(source)
    }

    fn check_strategy_class(&self, module: &Module) -> Result<(), ValidationError> {
        let classes: Vec<&ClassDef> = module
            .body
            .iter()
            .filter_map(|stmt| match &stmt.kind {
                StmtKind::ClassDef(class) => Some(class.as_ref()),
                _ => None,
            })
            .filter(|class| class.bases.iter().any(|base| self.is_strategy_base(base)))
            .collect();

        let class = match classes.as_slice() {
            [] => return Err(ValidationError::MissingStrategyClass),
            [class] => *class,
            many => {
                return Err(ValidationError::MultipleStrategyClasses {
                    names: many.iter().map(|c| c.name.as_str()).collect::<Vec<_>>().join(", "),
                })
            }
        };

        for method in &self.config.required_methods {
            let defined = class
                .body
                .iter()
                .any(|stmt| matches!(&stmt.kind, StmtKind::FunctionDef(f) if f.name == *method));
            if !defined {
                return Err(ValidationError::MissingMethod {
                    class: class.name.clone(),
                    method: method.clone(),
                });
            }
        }
        Ok(())
    }

    fn is_strategy_base(&self, base: &Expr) -> bool {
        match &base.kind {
            ExprKind::Name(name) => *name == self.config.strategy_base,
            ExprKind::Attribute { attr, .. } => *attr == self.config.strategy_base,
            _ => false,
        }
    }
}

/// Convenience wrapper using the default validator.
pub fn validate(source: &str) -> Result<&str, ValidationError> {
    Validator::default().validate(source)
}

/// Source-order walk recording the first safety violation
struct Walker<'c> {
    config: &'c ValidatorConfig,
    error: Option<ValidationError>,
}

impl<'c> Walker<'c> {
    fn fail(&mut self, err: ValidationError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn check_module(&mut self, module: &str, line: usize) {
        let root = module.split('.').next().unwrap_or(module);
        if self.config.denied_modules.iter().any(|m| m == root) {
            self.fail(ValidationError::DeniedImport {
                module: module.to_string(),
                line,
            });
            return;
        }
        let known = self.config.available_modules.iter().any(|m| m == root)
            || self.config.simulation_modules.iter().any(|m| m == root);
        if !known {
            self.fail(ValidationError::PackageNotAvailable {
                module: module.to_string(),
                line,
            });
        }
    }

    fn visit_body(&mut self, body: &[Stmt]) {
        for stmt in body {
            if self.error.is_some() {
                return;
            }
            self.visit_stmt(stmt);
        }
    }

    fn visit_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Expr(expr) => self.visit_expr(expr),
            StmtKind::Assign { targets, value } => {
                targets.iter().for_each(|t| self.visit_expr(t));
                self.visit_expr(value);
            }
            StmtKind::AugAssign { target, value, .. } => {
                self.visit_expr(target);
                self.visit_expr(value);
            }
            StmtKind::If { test, body, orelse } => {
                self.visit_expr(test);
                self.visit_body(body);
                self.visit_body(orelse);
            }
            StmtKind::While { test, body } => {
                self.visit_expr(test);
                self.visit_body(body);
            }
            StmtKind::For { target, iter, body } => {
                self.visit_expr(target);
                self.visit_expr(iter);
                self.visit_body(body);
            }
            StmtKind::FunctionDef(def) => {
                for param in &def.params {
                    if let Some(default) = &param.default {
                        self.visit_expr(default);
                    }
                }
                self.visit_body(&def.body);
            }
            StmtKind::ClassDef(class) => {
                class.bases.iter().for_each(|b| self.visit_expr(b));
                self.visit_body(&class.body);
            }
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.visit_expr(value);
                }
            }
            StmtKind::Import { names } => {
                for alias in names {
                    self.check_module(&alias.name, stmt.line);
                }
            }
            StmtKind::ImportFrom { module, level, .. } => {
                if *level > 0 {
                    // Relative imports have no package to resolve against
                    let name = format!("{}{}", ".".repeat(*level), module.as_deref().unwrap_or(""));
                    self.fail(ValidationError::PackageNotAvailable {
                        module: name,
                        line: stmt.line,
                    });
                } else if let Some(module) = module {
                    self.check_module(module, stmt.line);
                }
            }
            StmtKind::Pass | StmtKind::Break | StmtKind::Continue => {}
        }
    }

    fn visit_expr(&mut self, expr: &Expr) {
        if self.error.is_some() {
            return;
        }
        match &expr.kind {
            ExprKind::Call { func, args, kwargs } => {
                if let ExprKind::Name(name) = &func.kind {
                    if self.config.banned_calls.iter().any(|b| b == name) {
                        self.fail(ValidationError::BannedCall {
                            name: name.clone(),
                            line: expr.line,
                        });
                        return;
                    }
                }
                self.visit_expr(func);
                args.iter().for_each(|a| self.visit_expr(a));
                kwargs.iter().for_each(|(_, v)| self.visit_expr(v));
            }
            ExprKind::Attribute { value, attr } => {
                if is_dunder(attr) && !ALLOWED_DUNDERS.contains(&attr.as_str()) {
                    self.fail(ValidationError::DunderAccess {
                        attribute: attr.clone(),
                        line: expr.line,
                    });
                    return;
                }
                self.visit_expr(value);
            }
            ExprKind::Name(name) => {
                // Bare references such as `f = eval` smuggle the call through an alias
                if self.config.banned_calls.iter().any(|b| b == name) {
                    self.fail(ValidationError::BannedCall {
                        name: name.clone(),
                        line: expr.line,
                    });
                }
            }
            ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::Str(_) | ExprKind::Bool(_) | ExprKind::None => {}
            ExprKind::FString(parts) => {
                for part in parts {
                    if let FPart::Expr { expr, .. } = part {
                        self.visit_expr(expr);
                    }
                }
            }
            ExprKind::List(items) | ExprKind::Tuple(items) => items.iter().for_each(|i| self.visit_expr(i)),
            ExprKind::Dict(entries) => {
                for (k, v) in entries {
                    self.visit_expr(k);
                    self.visit_expr(v);
                }
            }
            ExprKind::ListComp { elt, target, iter, cond } => {
                self.visit_expr(iter);
                self.visit_expr(target);
                if let Some(cond) = cond {
                    self.visit_expr(cond);
                }
                self.visit_expr(elt);
            }
            ExprKind::Subscript { value, index } => {
                self.visit_expr(value);
                self.visit_expr(index);
            }
            ExprKind::Slice { lower, upper } => {
                if let Some(lower) = lower {
                    self.visit_expr(lower);
                }
                if let Some(upper) = upper {
                    self.visit_expr(upper);
                }
            }
            ExprKind::BinOp { left, right, .. } | ExprKind::And(left, right) | ExprKind::Or(left, right) => {
                self.visit_expr(left);
                self.visit_expr(right);
            }
            ExprKind::UnaryOp { operand, .. } => self.visit_expr(operand),
            ExprKind::Compare { left, comparators, .. } => {
                self.visit_expr(left);
                comparators.iter().for_each(|c| self.visit_expr(c));
            }
            ExprKind::IfExp { test, body, orelse } => {
                self.visit_expr(test);
                self.visit_expr(body);
                self.visit_expr(orelse);
            }
        }
    }
}

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = "import backtrader as bt\n\nclass SmaCross(bt.Strategy):\n    params = (('period', 15),)\n\n    def __init__(self):\n        self.sma = bt.indicators.SMA(self.data.close, period=self.p.period)\n\n    def next(self):\n        if self.data.close[0] > self.sma[0]:\n            self.buy()\n";

    #[test]
    fn test_valid_source_returned_unchanged() {
        assert_eq!(validate(VALID).unwrap(), VALID);
    }

    #[test]
    fn test_blank_and_comment_lines_between_methods() {
        let src = "import backtrader as bt\n\n\nclass Spaced(bt.Strategy):\n\n    def start(self):\n        pass\n\n\n    # entry logic below\n\n    def next(self):\n        if self.data.close[0] > 0:\n\n            self.buy()\n\n";
        assert_eq!(validate(src).unwrap(), src);
    }

    #[test]
    fn test_syntax_error() {
        let err = validate("class S(bt.Strategy)\n    def next(self): pass\n").unwrap_err();
        assert!(matches!(err, ValidationError::Syntax { line: 1, .. }));
    }

    #[test]
    fn test_denied_and_unavailable_imports() {
        let src = format!("import os\n{}", VALID);
        assert_eq!(
            validate(&src).unwrap_err(),
            ValidationError::DeniedImport {
                module: "os".to_string(),
                line: 1
            }
        );

        let src = format!("from os.path import join\n{}", VALID);
        assert!(matches!(validate(&src).unwrap_err(), ValidationError::DeniedImport { .. }));

        let src = format!("import numpy as np\n{}", VALID);
        let err = validate(&src).unwrap_err();
        assert_eq!(err.to_string(), "package not available: 'numpy' (line 1)");

        let src = format!("from . import helpers\n{}", VALID);
        assert!(matches!(validate(&src).unwrap_err(), ValidationError::PackageNotAvailable { .. }));

        let src = format!("import math\nfrom datetime import datetime\n{}", VALID);
        assert!(validate(&src).is_ok());
    }

    #[test]
    fn test_banned_calls_and_dunders() {
        let src = VALID.replace("self.buy()", "eval('1')");
        assert_eq!(
            validate(&src).unwrap_err(),
            ValidationError::BannedCall {
                name: "eval".to_string(),
                line: 11
            }
        );

        let src = VALID.replace("self.buy()", "x = self.__class__");
        assert!(matches!(validate(&src).unwrap_err(), ValidationError::DunderAccess { .. }));

        let src = VALID.replace("self.buy()", "f = open");
        assert!(matches!(validate(&src).unwrap_err(), ValidationError::BannedCall { .. }));
    }

    #[test]
    fn test_first_violation_in_source_order_wins() {
        let src = VALID.replace("self.buy()", "exec('x')\n            import socket");
        assert!(matches!(validate(&src).unwrap_err(), ValidationError::BannedCall { .. }));
    }

    #[test]
    fn test_strategy_class_rules() {
        assert_eq!(
            validate("import backtrader as bt\nx = 1\n").unwrap_err(),
            ValidationError::MissingStrategyClass
        );

        let two = format!("{}\nclass Other(bt.Strategy):\n    def next(self):\n        pass\n", VALID);
        assert!(matches!(
            validate(&two).unwrap_err(),
            ValidationError::MultipleStrategyClasses { names } if names == "SmaCross, Other"
        ));

        let no_next = "import backtrader as bt\nclass S(bt.Strategy):\n    def start(self):\n        pass\n";
        assert_eq!(
            validate(no_next).unwrap_err(),
            ValidationError::MissingMethod {
                class: "S".to_string(),
                method: "next".to_string()
            }
        );

        let bare_base = "from backtrader import Strategy\nclass S(Strategy):\n    def next(self):\n        pass\n";
        assert!(validate(bare_base).is_ok());
    }
}
