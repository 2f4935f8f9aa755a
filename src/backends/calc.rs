//! # calc: a tiny line-oriented numeric language.
//!
//! The reference runtime behind every built-in backend. A program is a list of
//! assignments executed top to bottom in a persistent context:
//!
//! ```text
//! # comments start with '#'
//! freq = 220 * 2 ^ (3 / 12)
//! amp = 0.2; done = 0
//! ```
//!
//! - Statements: `name = expr`, separated by newlines or `;`.
//! - Expressions: numbers, names, `+ - * / %`, `^` (power, right-associative),
//!   unary `-`, parentheses, and the calls `sin cos abs sqrt floor min max`.
//! - `pi` is predefined.
//! - An expression may nest at most 256 levels deep (parentheses, unary signs and
//!   operator chains all count); deeper input is a `SyntaxError`.
//!
//! ## Errors
//! Every failure is a [`Diagnostic`] with the 1-based line it happened on:
//! `SyntaxError` (nothing of the program runs), `NameError`, `ZeroDivisionError`,
//! `TypeError` and `ValueError` (statements before the failing one keep their effect).

use std::collections::BTreeMap;

use crate::backends::{Flow, Interpreter};
use crate::error::Diagnostic;

/// Deepest expression a statement may build: nesting, unary chains and operator chains
/// all count. Evaluation recurses on the tree, so this also bounds its stack use.
const MAX_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Num(f64),
    Var(String),
    Neg(Box<Expr>),
    Bin(Op, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
}

#[derive(Debug, Clone, PartialEq)]
struct Statement {
    line: u32,
    name: String,
    expr: Expr,
}

/// Parsed program, ready to run any number of times.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    statements: Vec<Statement>,
}

impl Program {
    /// Parses the whole source; the first syntax error aborts.
    pub fn parse(source: &str) -> Result<Self, Diagnostic> {
        let mut statements = Vec::new();
        for (idx, raw) in source.lines().enumerate() {
            let line = u32::try_from(idx + 1).unwrap_or(u32::MAX);
            let code = raw.split('#').next().unwrap_or_default();
            for segment in code.split(';') {
                if segment.trim().is_empty() {
                    continue;
                }
                let toks = lex(segment, line)?;
                statements.push(Parser {
                    toks,
                    pos: 0,
                    line,
                    depth: 0,
                }
                .statement()?);
            }
        }
        Ok(Self { statements })
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Returns `true` if some statement assigns `name`.
    pub fn assigns(&self, name: &str) -> bool {
        self.statements.iter().any(|s| s.name == name)
    }
}

/// Persistent variable context.
#[derive(Debug, Clone)]
pub struct Calc {
    vars: BTreeMap<String, f64>,
}

impl Default for Calc {
    fn default() -> Self {
        Self::new()
    }
}

impl Calc {
    pub fn new() -> Self {
        let mut vars = BTreeMap::new();
        vars.insert("pi".to_string(), std::f64::consts::PI);
        Self { vars }
    }

    /// Parses and runs `source`.
    pub fn exec(&mut self, source: &str) -> Result<(), Diagnostic> {
        let program = Program::parse(source)?;
        self.run(&program)
    }

    /// Runs every statement in order, stopping at the first failure.
    pub fn run(&mut self, program: &Program) -> Result<(), Diagnostic> {
        for st in &program.statements {
            let value = self.eval(&st.expr).map_err(|d| d.at_line(st.line))?;
            self.set(&st.name, value);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.vars.get(name).copied()
    }

    pub fn set(&mut self, name: &str, value: f64) {
        match self.vars.get_mut(name) {
            Some(slot) => *slot = value,
            None => {
                self.vars.insert(name.to_string(), value);
            }
        }
    }

    pub fn vars(&self) -> &BTreeMap<String, f64> {
        &self.vars
    }

    /// `true` once the program assigned a non-zero `done`.
    pub fn is_done(&self) -> bool {
        self.get("done").is_some_and(|v| v != 0.0)
    }

    fn eval(&self, e: &Expr) -> Result<f64, Diagnostic> {
        match e {
            Expr::Num(n) => Ok(*n),
            Expr::Var(name) => self
                .vars
                .get(name)
                .copied()
                .ok_or_else(|| Diagnostic::new("NameError", format!("name '{name}' is not defined"))),
            Expr::Neg(inner) => Ok(-self.eval(inner)?),
            Expr::Bin(op, l, r) => {
                let (l, r) = (self.eval(l)?, self.eval(r)?);
                match op {
                    Op::Add => Ok(l + r),
                    Op::Sub => Ok(l - r),
                    Op::Mul => Ok(l * r),
                    Op::Div | Op::Rem if r == 0.0 => {
                        Err(Diagnostic::new("ZeroDivisionError", "division by zero"))
                    }
                    Op::Div => Ok(l / r),
                    Op::Rem => Ok(l.rem_euclid(r)),
                    Op::Pow => Ok(l.powf(r)),
                }
            }
            Expr::Call(name, args) => {
                let args = args.iter().map(|a| self.eval(a)).collect::<Result<Vec<_>, _>>()?;
                call(name, &args)
            }
        }
    }
}

fn call(name: &str, args: &[f64]) -> Result<f64, Diagnostic> {
    let unary = |f: fn(f64) -> f64| match args {
        [x] => Ok(f(*x)),
        _ => Err(Diagnostic::new(
            "TypeError",
            format!("{name}() takes exactly one argument ({} given)", args.len()),
        )),
    };
    match name {
        "sin" => unary(f64::sin),
        "cos" => unary(f64::cos),
        "abs" => unary(f64::abs),
        "floor" => unary(f64::floor),
        "sqrt" => match args {
            [x] if *x < 0.0 => Err(Diagnostic::new("ValueError", "math domain error")),
            _ => unary(f64::sqrt),
        },
        "min" | "max" => {
            let pick = if name == "min" { f64::min } else { f64::max };
            args.iter()
                .copied()
                .reduce(pick)
                .ok_or_else(|| Diagnostic::new("TypeError", format!("{name} expected at least 1 argument")))
        }
        _ => Err(Diagnostic::new("NameError", format!("name '{name}' is not defined"))),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Ident(String),
    Sym(char),
}

fn syntax(line: u32, msg: impl Into<String>) -> Diagnostic {
    Diagnostic::new("SyntaxError", msg).at_line(line)
}

fn lex(src: &str, line: u32) -> Result<Vec<Tok>, Diagnostic> {
    let chars: Vec<char> = src.chars().collect();
    let len = chars.len();
    let mut out = Vec::new();
    let mut i = 0;

    while i < len {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) {
            let start = i;
            while i < len && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            if i < len && matches!(chars[i], 'e' | 'E') {
                let mut j = i + 1;
                if j < len && matches!(chars[j], '+' | '-') {
                    j += 1;
                }
                if j < len && chars[j].is_ascii_digit() {
                    i = j;
                    while i < len && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text: String = chars[start..i].iter().collect();
            let n = text
                .parse::<f64>()
                .map_err(|_| syntax(line, format!("invalid number literal '{text}'")))?;
            out.push(Tok::Num(n));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < len && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            out.push(Tok::Ident(chars[start..i].iter().collect()));
        } else if "+-*/%^(),=".contains(c) {
            out.push(Tok::Sym(c));
            i += 1;
        } else {
            return Err(syntax(line, format!("invalid character '{c}'")));
        }
    }
    Ok(out)
}

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
    line: u32,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn bump(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn eat(&mut self, sym: char) -> bool {
        if self.peek() == Some(&Tok::Sym(sym)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, sym: char) -> Result<(), Diagnostic> {
        if self.eat(sym) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected '{sym}'")))
        }
    }

    fn enter(&mut self) -> Result<(), Diagnostic> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(syntax(self.line, "expression nested too deeply"));
        }
        Ok(())
    }

    fn unexpected(&self, what: &str) -> Diagnostic {
        match self.peek() {
            Some(Tok::Num(n)) => syntax(self.line, format!("{what}, found {n}")),
            Some(Tok::Ident(s)) => syntax(self.line, format!("{what}, found '{s}'")),
            Some(Tok::Sym(c)) => syntax(self.line, format!("{what}, found '{c}'")),
            None => syntax(self.line, format!("{what}, found end of statement")),
        }
    }

    fn statement(mut self) -> Result<Statement, Diagnostic> {
        let name = match self.bump() {
            Some(Tok::Ident(name)) => name,
            _ => {
                self.pos = 0;
                return Err(self.unexpected("expected assignment target"));
            }
        };
        self.expect('=')?;
        let expr = self.additive()?;
        if self.peek().is_some() {
            return Err(self.unexpected("expected end of statement"));
        }
        Ok(Statement {
            line: self.line,
            name,
            expr,
        })
    }

    fn additive(&mut self) -> Result<Expr, Diagnostic> {
        let outer = self.depth;
        let mut lhs = self.term()?;
        loop {
            let op = if self.eat('+') {
                Op::Add
            } else if self.eat('-') {
                Op::Sub
            } else {
                self.depth = outer;
                return Ok(lhs);
            };
            self.enter()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(self.term()?));
        }
    }

    fn term(&mut self) -> Result<Expr, Diagnostic> {
        let outer = self.depth;
        let mut lhs = self.unary()?;
        loop {
            let op = if self.eat('*') {
                Op::Mul
            } else if self.eat('/') {
                Op::Div
            } else if self.eat('%') {
                Op::Rem
            } else {
                self.depth = outer;
                return Ok(lhs);
            };
            self.enter()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(self.unary()?));
        }
    }

    fn unary(&mut self) -> Result<Expr, Diagnostic> {
        self.enter()?;
        let expr = self.signed()?;
        self.depth -= 1;
        Ok(expr)
    }

    fn signed(&mut self) -> Result<Expr, Diagnostic> {
        if self.eat('-') {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        if self.eat('+') {
            return self.unary();
        }
        let base = self.primary()?;
        if self.eat('^') {
            return Ok(Expr::Bin(Op::Pow, Box::new(base), Box::new(self.unary()?)));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr, Diagnostic> {
        match self.peek().cloned() {
            Some(Tok::Num(n)) => {
                self.pos += 1;
                Ok(Expr::Num(n))
            }
            Some(Tok::Ident(name)) => {
                self.pos += 1;
                if !self.eat('(') {
                    return Ok(Expr::Var(name));
                }
                let mut args = Vec::new();
                if !self.eat(')') {
                    loop {
                        args.push(self.additive()?);
                        if self.eat(')') {
                            break;
                        }
                        self.expect(',')?;
                    }
                }
                Ok(Expr::Call(name, args))
            }
            Some(Tok::Sym('(')) => {
                self.pos += 1;
                let inner = self.additive()?;
                self.expect(')')?;
                Ok(inner)
            }
            _ => Err(self.unexpected("expected expression")),
        }
    }
}

/// [`Interpreter`] over a persistent [`Calc`] context.
///
/// Ticks are no-ops; the program ends once it assigns a non-zero `done`.
#[derive(Debug, Default)]
pub struct CalcInterpreter {
    calc: Calc,
}

impl CalcInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(&self) -> &Calc {
        &self.calc
    }
}

impl Interpreter for CalcInterpreter {
    fn exec(&mut self, _title: &str, source: &str) -> Result<(), Diagnostic> {
        self.calc.exec(source)
    }

    fn tick(&mut self) -> Result<Flow, Diagnostic> {
        Ok(if self.calc.is_done() { Flow::Done } else { Flow::Continue })
    }
}
