// Recursive-descent parser producing the syntax tree

use std::rc::Rc;

use crate::ast::*;
use crate::error::ParseError;
use crate::lexer::{tokenize, Keyword, Tok, Token};

pub fn parse_module(source: &str) -> Result<Module, ParseError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let mut body = Vec::new();
    while !parser.at(&Tok::Eof) {
        if parser.eat(&Tok::Newline) {
            continue;
        }
        body.extend(parser.statement()?);
    }
    Ok(Module { body })
}

/// Parse a standalone expression, as found inside f-string braces.
fn parse_expression(source: &str, line: usize) -> Result<Expr, ParseError> {
    let mut tokens = tokenize(source.trim())?;
    for token in &mut tokens {
        token.line = line;
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr_list()?;
    parser.eat(&Tok::Newline);
    if !parser.at(&Tok::Eof) {
        return Err(parser.unexpected());
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn current(&self) -> &Token {
        // tokenize always terminates the stream with Eof
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_tok(&self, offset: usize) -> &Tok {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].tok
    }

    fn line(&self) -> usize {
        self.current().line
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn at(&self, tok: &Tok) -> bool {
        &self.current().tok == tok
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(&self.current().tok, Tok::Op(o) if *o == op)
    }

    fn at_kw(&self, kw: Keyword) -> bool {
        matches!(&self.current().tok, Tok::Keyword(k) if *k == kw)
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.at(tok) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, kw: Keyword) -> bool {
        if self.at_kw(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error_here(&self, message: impl Into<String>) -> ParseError {
        let token = self.current();
        ParseError::new(token.line, token.col, message)
    }

    fn unexpected(&self) -> ParseError {
        self.error_here(format!("invalid syntax: unexpected {}", self.current().tok))
    }

    fn expect_op(&mut self, op: &str) -> Result<(), ParseError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error_here(format!("expected '{}', found {}", op, self.current().tok)))
        }
    }

    fn expect_kw(&mut self, kw: Keyword) -> Result<(), ParseError> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.error_here(format!("expected '{}', found {}", kw.as_str(), self.current().tok)))
        }
    }

    fn expect_name(&mut self) -> Result<String, ParseError> {
        match &self.current().tok {
            Tok::Name(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            other => Err(self.error_here(format!("expected a name, found {}", other))),
        }
    }

    fn end_of_statement(&mut self) -> Result<(), ParseError> {
        if self.eat(&Tok::Newline) || self.at(&Tok::Eof) || self.at(&Tok::Dedent) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    // ---------------------------------------------------------------- statements

    fn statement(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let line = self.line();
        let kind = match &self.current().tok {
            Tok::Keyword(Keyword::Def) => StmtKind::FunctionDef(Rc::new(self.function_def()?)),
            Tok::Keyword(Keyword::Class) => StmtKind::ClassDef(Rc::new(self.class_def()?)),
            Tok::Keyword(Keyword::If) => {
                self.advance();
                self.if_tail()?
            }
            Tok::Keyword(Keyword::While) => {
                self.advance();
                let test = self.test()?;
                let body = self.block()?;
                StmtKind::While { test, body }
            }
            Tok::Keyword(Keyword::For) => {
                self.advance();
                let target = self.target_list()?;
                self.expect_kw(Keyword::In)?;
                let iter = self.expr_list()?;
                let body = self.block()?;
                StmtKind::For { target, iter, body }
            }
            Tok::Op("@") => return Err(self.error_here("decorators are not supported")),
            Tok::Indent => return Err(self.error_here("unexpected indent")),
            _ => return self.simple_statements(),
        };
        Ok(vec![Stmt { kind, line }])
    }

    /// One or more `;`-separated simple statements ending the line.
    fn simple_statements(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut stmts = vec![self.simple_statement()?];
        while self.eat_op(";") {
            if self.at(&Tok::Newline) || self.at(&Tok::Eof) {
                break;
            }
            stmts.push(self.simple_statement()?);
        }
        self.end_of_statement()?;
        Ok(stmts)
    }

    fn simple_statement(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        let kind = match &self.current().tok {
            Tok::Keyword(Keyword::Pass) => {
                self.advance();
                StmtKind::Pass
            }
            Tok::Keyword(Keyword::Break) => {
                self.advance();
                StmtKind::Break
            }
            Tok::Keyword(Keyword::Continue) => {
                self.advance();
                StmtKind::Continue
            }
            Tok::Keyword(Keyword::Return) => {
                self.advance();
                if self.at(&Tok::Newline) || self.at_op(";") || self.at(&Tok::Eof) {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.expr_list()?))
                }
            }
            Tok::Keyword(Keyword::Import) => {
                self.advance();
                let mut names = vec![self.import_alias()?];
                while self.eat_op(",") {
                    names.push(self.import_alias()?);
                }
                StmtKind::Import { names }
            }
            Tok::Keyword(Keyword::From) => {
                self.advance();
                self.import_from()?
            }
            Tok::Keyword(kw) if is_unsupported(*kw) => {
                return Err(self.error_here(format!("'{}' statements are not supported", kw.as_str())));
            }
            _ => self.expression_statement()?,
        };
        Ok(Stmt { kind, line })
    }

    fn expression_statement(&mut self) -> Result<StmtKind, ParseError> {
        let first = self.expr_list()?;

        if let Tok::Op(op) = self.current().tok.clone() {
            let aug = match op {
                "+=" => Some(BinOp::Add),
                "-=" => Some(BinOp::Sub),
                "*=" => Some(BinOp::Mul),
                "/=" => Some(BinOp::Div),
                "//=" => Some(BinOp::FloorDiv),
                "%=" => Some(BinOp::Mod),
                "**=" => Some(BinOp::Pow),
                _ => None,
            };
            if let Some(op) = aug {
                self.advance();
                check_target(&first, false)?;
                let value = self.expr_list()?;
                return Ok(StmtKind::AugAssign { target: first, op, value });
            }
        }

        if !self.at_op("=") {
            return Ok(StmtKind::Expr(first));
        }

        let mut exprs = vec![first];
        while self.eat_op("=") {
            exprs.push(self.expr_list()?);
        }
        let value = exprs.pop().ok_or_else(|| self.unexpected())?;
        for target in &exprs {
            check_target(target, true)?;
        }
        Ok(StmtKind::Assign { targets: exprs, value })
    }

    fn import_alias(&mut self) -> Result<Alias, ParseError> {
        let mut name = self.expect_name()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.expect_name()?);
        }
        let asname = if self.eat_kw(Keyword::As) {
            Some(self.expect_name()?)
        } else {
            None
        };
        Ok(Alias { name, asname })
    }

    fn import_from(&mut self) -> Result<StmtKind, ParseError> {
        let mut level = 0;
        while self.at_op(".") {
            self.advance();
            level += 1;
        }
        let module = if matches!(self.current().tok, Tok::Name(_)) {
            let mut name = self.expect_name()?;
            while self.eat_op(".") {
                name.push('.');
                name.push_str(&self.expect_name()?);
            }
            Some(name)
        } else {
            None
        };
        if level == 0 && module.is_none() {
            return Err(self.unexpected());
        }
        self.expect_kw(Keyword::Import)?;

        let parenthesized = self.eat_op("(");
        let mut names = Vec::new();
        if self.eat_op("*") {
            names.push(Alias {
                name: "*".to_string(),
                asname: None,
            });
        } else {
            loop {
                let name = self.expect_name()?;
                let asname = if self.eat_kw(Keyword::As) {
                    Some(self.expect_name()?)
                } else {
                    None
                };
                names.push(Alias { name, asname });
                if !self.eat_op(",") {
                    break;
                }
                if parenthesized && self.at_op(")") {
                    break;
                }
            }
        }
        if parenthesized {
            self.expect_op(")")?;
        }
        Ok(StmtKind::ImportFrom { module, level, names })
    }

    fn if_tail(&mut self) -> Result<StmtKind, ParseError> {
        let test = self.test()?;
        let body = self.block()?;
        let orelse = if self.at_kw(Keyword::Elif) {
            let elif_line = self.line();
            self.advance();
            vec![Stmt {
                kind: self.if_tail()?,
                line: elif_line,
            }]
        } else if self.eat_kw(Keyword::Else) {
            self.block()?
        } else {
            Vec::new()
        };
        Ok(StmtKind::If { test, body, orelse })
    }

    /// `:` followed by an indented suite or a same-line simple statement list.
    fn block(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.expect_op(":")?;
        if !self.eat(&Tok::Newline) {
            return self.simple_statements();
        }
        if !self.eat(&Tok::Indent) {
            return Err(self.error_here("expected an indented block"));
        }
        let mut body = Vec::new();
        while !self.at(&Tok::Dedent) && !self.at(&Tok::Eof) {
            if self.eat(&Tok::Newline) {
                continue;
            }
            body.extend(self.statement()?);
        }
        self.eat(&Tok::Dedent);
        Ok(body)
    }

    fn function_def(&mut self) -> Result<FunctionDef, ParseError> {
        let line = self.line();
        self.expect_kw(Keyword::Def)?;
        let name = self.expect_name()?;
        self.expect_op("(")?;

        let mut params = Vec::new();
        while !self.at_op(")") {
            if self.at_op("*") || self.at_op("**") {
                return Err(self.error_here("variadic parameters are not supported"));
            }
            let param = self.expect_name()?;
            if self.eat_op(":") {
                self.test()?;
            }
            let default = if self.eat_op("=") { Some(self.test()?) } else { None };
            if default.is_none() && params.iter().any(|p: &Param| p.default.is_some()) {
                return Err(self.error_here("non-default argument follows default argument"));
            }
            params.push(Param { name: param, default });
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        if self.eat_op("->") {
            self.test()?;
        }
        let body = self.block()?;
        Ok(FunctionDef { name, params, body, line })
    }

    fn class_def(&mut self) -> Result<ClassDef, ParseError> {
        let line = self.line();
        self.expect_kw(Keyword::Class)?;
        let name = self.expect_name()?;
        let mut bases = Vec::new();
        if self.eat_op("(") {
            while !self.at_op(")") {
                bases.push(self.test()?);
                if !self.eat_op(",") {
                    break;
                }
            }
            self.expect_op(")")?;
        }
        let body = self.block()?;
        Ok(ClassDef { name, bases, body, line })
    }

    // ---------------------------------------------------------------- expressions

    /// `a, b` style lists; a trailing comma or more than one item makes a tuple.
    fn expr_list(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        let first = self.test()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.starts_expression() {
                items.push(self.test()?);
            } else {
                break;
            }
        }
        Ok(Expr::new(ExprKind::Tuple(items), line))
    }

    fn target_list(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        let first = self.or_expr_target()?;
        if !self.at_op(",") {
            check_target(&first, true)?;
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_kw(Keyword::In) {
                break;
            }
            items.push(self.or_expr_target()?);
        }
        let target = Expr::new(ExprKind::Tuple(items), line);
        check_target(&target, true)?;
        Ok(target)
    }

    // Targets in `for` headers stop before `in`
    fn or_expr_target(&mut self) -> Result<Expr, ParseError> {
        self.arith()
    }

    fn starts_expression(&self) -> bool {
        match &self.current().tok {
            Tok::Name(_) | Tok::Int(_) | Tok::Float(_) | Tok::Str(_) | Tok::FStr(_) => true,
            Tok::Keyword(k) => matches!(k, Keyword::True | Keyword::False | Keyword::None | Keyword::Not),
            Tok::Op(op) => matches!(*op, "(" | "[" | "{" | "-" | "+"),
            _ => false,
        }
    }

    fn test(&mut self) -> Result<Expr, ParseError> {
        if self.at_kw(Keyword::Lambda) {
            return Err(self.error_here("lambda expressions are not supported"));
        }
        let line = self.line();
        let body = self.or_test()?;
        if self.at_kw(Keyword::If) {
            self.advance();
            let test = self.or_test()?;
            self.expect_kw(Keyword::Else)?;
            let orelse = self.test()?;
            return Ok(Expr::new(
                ExprKind::IfExp {
                    test: Box::new(test),
                    body: Box::new(body),
                    orelse: Box::new(orelse),
                },
                line,
            ));
        }
        Ok(body)
    }

    fn or_test(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.and_test()?;
        while self.at_kw(Keyword::Or) {
            let line = self.line();
            self.advance();
            let right = self.and_test()?;
            left = Expr::new(ExprKind::Or(Box::new(left), Box::new(right)), line);
        }
        Ok(left)
    }

    fn and_test(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.not_test()?;
        while self.at_kw(Keyword::And) {
            let line = self.line();
            self.advance();
            let right = self.not_test()?;
            left = Expr::new(ExprKind::And(Box::new(left), Box::new(right)), line);
        }
        Ok(left)
    }

    fn not_test(&mut self) -> Result<Expr, ParseError> {
        if self.at_kw(Keyword::Not) {
            let line = self.line();
            self.advance();
            let operand = self.not_test()?;
            return Ok(Expr::new(
                ExprKind::UnaryOp {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                line,
            ));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        let left = self.arith()?;
        let mut ops = Vec::new();
        let mut comparators = Vec::new();
        loop {
            let op = match &self.current().tok {
                Tok::Op("==") => CmpOp::Eq,
                Tok::Op("!=") => CmpOp::NotEq,
                Tok::Op("<") => CmpOp::Lt,
                Tok::Op("<=") => CmpOp::LtE,
                Tok::Op(">") => CmpOp::Gt,
                Tok::Op(">=") => CmpOp::GtE,
                Tok::Keyword(Keyword::In) => CmpOp::In,
                Tok::Keyword(Keyword::Not) if matches!(self.peek_tok(1), Tok::Keyword(Keyword::In)) => {
                    self.advance();
                    CmpOp::NotIn
                }
                Tok::Keyword(Keyword::Is) => {
                    if matches!(self.peek_tok(1), Tok::Keyword(Keyword::Not)) {
                        self.advance();
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    }
                }
                Tok::Op("|") | Tok::Op("&") | Tok::Op("^") | Tok::Op("<<") | Tok::Op(">>") => {
                    return Err(self.error_here("bitwise operators are not supported"));
                }
                _ => break,
            };
            self.advance();
            ops.push(op);
            comparators.push(self.arith()?);
        }
        if ops.is_empty() {
            return Ok(left);
        }
        Ok(Expr::new(
            ExprKind::Compare {
                left: Box::new(left),
                ops,
                comparators,
            },
            line,
        ))
    }

    fn arith(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.term()?;
        loop {
            let op = match &self.current().tok {
                Tok::Op("+") => BinOp::Add,
                Tok::Op("-") => BinOp::Sub,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let right = self.term()?;
            left = binop(op, left, right, line);
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.factor()?;
        loop {
            let op = match &self.current().tok {
                Tok::Op("*") => BinOp::Mul,
                Tok::Op("/") => BinOp::Div,
                Tok::Op("//") => BinOp::FloorDiv,
                Tok::Op("%") => BinOp::Mod,
                Tok::Op("@") => return Err(self.error_here("matrix multiplication is not supported")),
                _ => break,
            };
            let line = self.line();
            self.advance();
            let right = self.factor()?;
            left = binop(op, left, right, line);
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        let op = match &self.current().tok {
            Tok::Op("-") => Some(UnaryOp::Neg),
            Tok::Op("+") => Some(UnaryOp::Pos),
            Tok::Op("~") => return Err(self.error_here("bitwise operators are not supported")),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.factor()?;
            // Fold negative literals so `-1` indexes read naturally
            if op == UnaryOp::Neg {
                match operand.kind {
                    ExprKind::Int(i) => return Ok(Expr::new(ExprKind::Int(-i), line)),
                    ExprKind::Float(f) => return Ok(Expr::new(ExprKind::Float(-f), line)),
                    _ => {}
                }
            }
            return Ok(Expr::new(
                ExprKind::UnaryOp {
                    op,
                    operand: Box::new(operand),
                },
                line,
            ));
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr, ParseError> {
        let base = self.primary()?;
        if self.at_op("**") {
            let line = self.line();
            self.advance();
            let exponent = self.factor()?;
            return Ok(binop(BinOp::Pow, base, exponent, line));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.atom()?;
        loop {
            let line = self.line();
            if self.eat_op(".") {
                let attr = self.expect_name()?;
                expr = Expr::new(
                    ExprKind::Attribute {
                        value: Box::new(expr),
                        attr,
                    },
                    line,
                );
            } else if self.eat_op("(") {
                let (args, kwargs) = self.call_args()?;
                expr = Expr::new(
                    ExprKind::Call {
                        func: Box::new(expr),
                        args,
                        kwargs,
                    },
                    line,
                );
            } else if self.eat_op("[") {
                let index = self.subscript()?;
                self.expect_op("]")?;
                expr = Expr::new(
                    ExprKind::Subscript {
                        value: Box::new(expr),
                        index: Box::new(index),
                    },
                    line,
                );
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), ParseError> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while !self.at_op(")") {
            if self.at_op("*") || self.at_op("**") {
                return Err(self.error_here("argument unpacking is not supported"));
            }
            let is_keyword = matches!(self.current().tok, Tok::Name(_)) && matches!(self.peek_tok(1), Tok::Op("="));
            if is_keyword {
                let name = self.expect_name()?;
                self.expect_op("=")?;
                let value = self.test()?;
                if kwargs.iter().any(|(k, _)| *k == name) {
                    return Err(self.error_here(format!("keyword argument repeated: {}", name)));
                }
                kwargs.push((name, value));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error_here("positional argument follows keyword argument"));
                }
                let line = self.line();
                let arg = self.test()?;
                // Bare generator argument: sum(x for x in xs)
                if self.at_kw(Keyword::For) {
                    let comp = self.comprehension_tail(arg, line)?;
                    args.push(comp);
                } else {
                    args.push(arg);
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok((args, kwargs))
    }

    fn subscript(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        let lower = if self.at_op(":") { None } else { Some(self.test()?) };
        if !self.eat_op(":") {
            return lower.ok_or_else(|| self.unexpected());
        }
        let upper = if self.at_op("]") { None } else { Some(Box::new(self.test()?)) };
        if self.at_op(":") {
            return Err(self.error_here("slice steps are not supported"));
        }
        Ok(Expr::new(
            ExprKind::Slice {
                lower: lower.map(Box::new),
                upper,
            },
            line,
        ))
    }

    fn comprehension_tail(&mut self, elt: Expr, line: usize) -> Result<Expr, ParseError> {
        self.expect_kw(Keyword::For)?;
        let target = self.target_list()?;
        self.expect_kw(Keyword::In)?;
        let iter = self.or_test()?;
        let cond = if self.eat_kw(Keyword::If) {
            Some(Box::new(self.or_test()?))
        } else {
            None
        };
        if self.at_kw(Keyword::For) {
            return Err(self.error_here("nested comprehensions are not supported"));
        }
        Ok(Expr::new(
            ExprKind::ListComp {
                elt: Box::new(elt),
                target: Box::new(target),
                iter: Box::new(iter),
                cond,
            },
            line,
        ))
    }

    fn atom(&mut self) -> Result<Expr, ParseError> {
        let token = self.current().clone();
        let line = token.line;
        let kind = match token.tok {
            Tok::Name(name) => {
                self.advance();
                ExprKind::Name(name)
            }
            Tok::Int(i) => {
                self.advance();
                ExprKind::Int(i)
            }
            Tok::Float(f) => {
                self.advance();
                ExprKind::Float(f)
            }
            Tok::Keyword(Keyword::True) => {
                self.advance();
                ExprKind::Bool(true)
            }
            Tok::Keyword(Keyword::False) => {
                self.advance();
                ExprKind::Bool(false)
            }
            Tok::Keyword(Keyword::None) => {
                self.advance();
                ExprKind::None
            }
            Tok::Str(_) | Tok::FStr(_) => return self.strings(),
            Tok::Op("(") => {
                self.advance();
                if self.eat_op(")") {
                    return Ok(Expr::new(ExprKind::Tuple(Vec::new()), line));
                }
                let first = self.test()?;
                if self.at_kw(Keyword::For) {
                    let comp = self.comprehension_tail(first, line)?;
                    self.expect_op(")")?;
                    return Ok(comp);
                }
                if self.eat_op(")") {
                    return Ok(first);
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.at_op(")") {
                        break;
                    }
                    items.push(self.test()?);
                }
                self.expect_op(")")?;
                ExprKind::Tuple(items)
            }
            Tok::Op("[") => {
                self.advance();
                if self.eat_op("]") {
                    return Ok(Expr::new(ExprKind::List(Vec::new()), line));
                }
                let first = self.test()?;
                if self.at_kw(Keyword::For) {
                    let comp = self.comprehension_tail(first, line)?;
                    self.expect_op("]")?;
                    return Ok(comp);
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.at_op("]") {
                        break;
                    }
                    items.push(self.test()?);
                }
                self.expect_op("]")?;
                ExprKind::List(items)
            }
            Tok::Op("{") => {
                self.advance();
                let mut entries = Vec::new();
                while !self.at_op("}") {
                    let key = self.test()?;
                    if !self.eat_op(":") {
                        return Err(self.error_here("set literals are not supported"));
                    }
                    let value = self.test()?;
                    entries.push((key, value));
                    if !self.eat_op(",") {
                        break;
                    }
                }
                self.expect_op("}")?;
                ExprKind::Dict(entries)
            }
            Tok::Keyword(kw) if is_unsupported(kw) => {
                return Err(self.error_here(format!("'{}' is not supported", kw.as_str())));
            }
            _ => return Err(self.unexpected()),
        };
        Ok(Expr::new(kind, line))
    }

    /// Adjacent string literals concatenate; any f-string makes the whole an f-string.
    fn strings(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        let mut parts: Vec<FPart> = Vec::new();
        let mut formatted = false;
        loop {
            match self.current().tok.clone() {
                Tok::Str(s) => {
                    self.advance();
                    parts.push(FPart::Lit(s));
                }
                Tok::FStr(s) => {
                    let token_line = self.line();
                    self.advance();
                    formatted = true;
                    parts.extend(parse_fstring(&s, token_line)?);
                }
                _ => break,
            }
        }
        if !formatted {
            let text: String = parts
                .into_iter()
                .map(|p| match p {
                    FPart::Lit(s) => s,
                    FPart::Expr { .. } => String::new(),
                })
                .collect();
            return Ok(Expr::new(ExprKind::Str(text), line));
        }
        Ok(Expr::new(ExprKind::FString(parts), line))
    }
}

fn binop(op: BinOp, left: Expr, right: Expr, line: usize) -> Expr {
    Expr::new(
        ExprKind::BinOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        line,
    )
}

fn is_unsupported(kw: Keyword) -> bool {
    matches!(
        kw,
        Keyword::Assert
            | Keyword::Async
            | Keyword::Await
            | Keyword::Del
            | Keyword::Except
            | Keyword::Finally
            | Keyword::Global
            | Keyword::Lambda
            | Keyword::Nonlocal
            | Keyword::Raise
            | Keyword::Try
            | Keyword::With
            | Keyword::Yield
    )
}

fn check_target(expr: &Expr, allow_tuple: bool) -> Result<(), ParseError> {
    match &expr.kind {
        ExprKind::Name(_) | ExprKind::Attribute { .. } | ExprKind::Subscript { .. } => Ok(()),
        ExprKind::Tuple(items) | ExprKind::List(items) if allow_tuple => {
            items.iter().try_for_each(|item| check_target(item, true))
        }
        _ => Err(ParseError::new(expr.line, 1, "cannot assign to expression")),
    }
}

/// Split an f-string body into literal text and `{expr[!r][:spec]}` fields.
fn parse_fstring(body: &str, line: usize) -> Result<Vec<FPart>, ParseError> {
    let chars: Vec<char> = body.chars().collect();
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '{' {
            if chars.get(i + 1) == Some(&'{') {
                literal.push('{');
                i += 2;
                continue;
            }
            if !literal.is_empty() {
                parts.push(FPart::Lit(std::mem::take(&mut literal)));
            }
            i += 1;

            let mut depth = 0usize;
            let mut quote: Option<char> = None;
            let mut expr_text = String::new();
            let mut conversion = None;
            let mut spec: Option<String> = None;
            loop {
                let Some(&ch) = chars.get(i) else {
                    return Err(ParseError::new(line, 1, "f-string: expecting '}'"));
                };
                if let Some(q) = quote {
                    expr_text.push(ch);
                    if ch == q {
                        quote = None;
                    }
                    i += 1;
                    continue;
                }
                match ch {
                    '\'' | '"' => {
                        quote = Some(ch);
                        expr_text.push(ch);
                    }
                    '(' | '[' | '{' => {
                        depth += 1;
                        expr_text.push(ch);
                    }
                    ')' | ']' => {
                        depth = depth.saturating_sub(1);
                        expr_text.push(ch);
                    }
                    '}' if depth > 0 => {
                        depth -= 1;
                        expr_text.push(ch);
                    }
                    '}' => {
                        i += 1;
                        break;
                    }
                    '!' if depth == 0 && chars.get(i + 1) != Some(&'=') => {
                        conversion = chars.get(i + 1).copied();
                        i += 2;
                        continue;
                    }
                    ':' if depth == 0 => {
                        // Spec runs to the matching close brace
                        let mut text = String::new();
                        i += 1;
                        while let Some(&sc) = chars.get(i) {
                            if sc == '}' {
                                break;
                            }
                            text.push(sc);
                            i += 1;
                        }
                        spec = Some(text);
                        continue;
                    }
                    _ => expr_text.push(ch),
                }
                i += 1;
            }

            if expr_text.trim().is_empty() {
                return Err(ParseError::new(line, 1, "f-string: empty expression not allowed"));
            }
            let expr = parse_expression(&expr_text, line)?;
            parts.push(FPart::Expr { expr, spec, conversion });
            continue;
        }
        if c == '}' {
            if chars.get(i + 1) == Some(&'}') {
                literal.push('}');
                i += 2;
                continue;
            }
            return Err(ParseError::new(line, 1, "f-string: single '}' is not allowed"));
        }
        literal.push(c);
        i += 1;
    }
    if !literal.is_empty() {
        parts.push(FPart::Lit(literal));
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Module {
        parse_module(source).unwrap()
    }

    #[test]
    fn test_parses_strategy_class() {
        let module = parse(
            "import backtrader as bt\n\nclass S(bt.Strategy):\n    params = (('period', 15),)\n\n    def __init__(self):\n        self.sma = bt.indicators.SMA(self.data.close, period=self.p.period)\n\n    def next(self):\n        if not self.position and self.data.close[0] > self.sma[0]:\n            self.buy()\n",
        );
        assert_eq!(module.body.len(), 2);
        let StmtKind::ClassDef(class) = &module.body[1].kind else {
            panic!("expected class");
        };
        assert_eq!(class.name, "S");
        assert_eq!(class.bases[0].dotted_name().as_deref(), Some("bt.Strategy"));
        assert_eq!(class.body.len(), 3);
        assert_eq!(class.line, 3);
    }

    #[test]
    fn test_operator_precedence() {
        let module = parse("x = 1 + 2 * 3 ** 2\n");
        let StmtKind::Assign { value, .. } = &module.body[0].kind else {
            panic!("expected assign");
        };
        let ExprKind::BinOp { op, right, .. } = &value.kind else {
            panic!("expected binop");
        };
        assert_eq!(*op, BinOp::Add);
        assert!(matches!(right.kind, ExprKind::BinOp { op: BinOp::Mul, .. }));
    }

    #[test]
    fn test_tuple_unpacking_and_chained_compare() {
        let module = parse("a, b = 1, 2\nok = 0 < a <= b\nfor i, x in enumerate(xs):\n    pass\n");
        assert!(matches!(module.body[0].kind, StmtKind::Assign { .. }));
        let StmtKind::Assign { value, .. } = &module.body[1].kind else {
            panic!("expected assign");
        };
        assert!(matches!(&value.kind, ExprKind::Compare { ops, .. } if ops.len() == 2));
        assert!(matches!(module.body[2].kind, StmtKind::For { .. }));
    }

    #[test]
    fn test_fstring_fields() {
        let module = parse("s = f'Close {self.data.close[0]:.2f} {x!r} {{lit}}'\n");
        let StmtKind::Assign { value, .. } = &module.body[0].kind else {
            panic!("expected assign");
        };
        let ExprKind::FString(parts) = &value.kind else {
            panic!("expected f-string");
        };
        assert!(matches!(&parts[1], FPart::Expr { spec: Some(s), .. } if s == ".2f"));
        assert!(matches!(&parts[3], FPart::Expr { conversion: Some('r'), .. }));
        assert!(matches!(&parts[4], FPart::Lit(s) if s == " {lit}"));
    }

    #[test]
    fn test_import_forms() {
        let module = parse("import backtrader.indicators as btind, math\nfrom . import helpers\nfrom datetime import (datetime, date,)\n");
        let StmtKind::Import { names } = &module.body[0].kind else {
            panic!("expected import");
        };
        assert_eq!(names[0].name, "backtrader.indicators");
        assert_eq!(names[0].asname.as_deref(), Some("btind"));
        assert!(matches!(&module.body[1].kind, StmtKind::ImportFrom { level: 1, module: None, .. }));
        assert!(matches!(&module.body[2].kind, StmtKind::ImportFrom { names, .. } if names.len() == 2));
    }

    #[test]
    fn test_elif_chain_and_inline_block() {
        let module = parse("if a: x = 1\nelif b:\n    x = 2\nelse:\n    x = 3\n");
        let StmtKind::If { orelse, .. } = &module.body[0].kind else {
            panic!("expected if");
        };
        assert!(matches!(orelse[0].kind, StmtKind::If { .. }));
    }

    #[test]
    fn test_syntax_errors_carry_position() {
        let err = parse_module("def f(:\n    pass\n").unwrap_err();
        assert_eq!(err.line, 1);

        let err = parse_module("x = 1\ny = (2 +\n").unwrap_err();
        assert!(err.line >= 2);

        let err = parse_module("try:\n    pass\n").unwrap_err();
        assert!(err.message.contains("not supported"));

        assert!(parse_module("1 = x\n").is_err());
    }

    #[test]
    fn test_comprehension_and_slices() {
        let module = parse("ys = [x * 2 for x in xs if x > 0]\nz = sum(v for v in ys)\nw = ys[1:3]\n");
        let StmtKind::Assign { value, .. } = &module.body[0].kind else {
            panic!("expected assign");
        };
        assert!(matches!(value.kind, ExprKind::ListComp { .. }));
        let StmtKind::Assign { value, .. } = &module.body[2].kind else {
            panic!("expected assign");
        };
        assert!(matches!(&value.kind, ExprKind::Subscript { index, .. } if matches!(index.kind, ExprKind::Slice { .. })));
    }
}
