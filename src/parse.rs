//! Parser and scope analyzer
//!
//! The compilation pipeline treats parsing as an external collaborator: the
//! orchestrator only needs a [`FunctionLiteral`] tree and the [`ScopeInfo`]
//! produced by [`analyze`]. The surface language is a small function-per-line
//! form, one declaration per line:
//!
//! ```text
//! fn add(a, b) = a + b
//! fn hyp(a, b) = sqrt(a * a + b * b)
//! resumable fn stream(x) = x + 1
//! numeric fn dot2(ax, ay, bx, by) = ax * bx + ay * by
//! # comments start with '#'
//! ```
//!
//! `resumable` marks generator-style functions the legacy baseline backend
//! cannot represent. `numeric` declares an asm-like numeric-subset module
//! that prefers the legacy backend after validation.

use crate::error::{Error, Result, SourceLocation};
use unicode_xid::UnicodeXID;

/// Maximum expression nesting depth accepted by the parser. Deeper trees
/// abort with [`Error::StackOverflow`] before any recursive traversal can
/// exhaust the real stack.
pub const MAX_EXPR_DEPTH: usize = 64;

/// Intrinsic functions callable from expressions. The bytecode tier lowers
/// these to dedicated instructions; the legacy baseline backend has no
/// lowering for them.
pub const INTRINSICS: &[&str] = &["abs", "sqrt", "floor", "min", "max"];

/// Index of an intrinsic by name
pub fn intrinsic_index(name: &str) -> Option<u8> {
    INTRINSICS.iter().position(|i| *i == name).map(|i| i as u8)
}

/// Number of arguments an intrinsic takes
pub fn intrinsic_arity(index: u8) -> usize {
    match index {
        3 | 4 => 2, // min, max
        _ => 1,
    }
}

/// Evaluate an intrinsic over already-computed arguments
pub fn apply_intrinsic(index: u8, args: &[f64]) -> f64 {
    match index {
        0 => args[0].abs(),
        1 => args[0].sqrt(),
        2 => args[0].floor(),
        3 => args[0].min(args[1]),
        4 => args[0].max(args[1]),
        _ => f64::NAN,
    }
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Expression tree for a function body
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Numeric literal
    Number(f64),
    /// Reference to a parameter by name (resolved by analysis)
    Ident(String),
    /// Negation
    Neg(Box<Expr>),
    /// Binary operation
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Intrinsic call
    Call { callee: String, args: Vec<Expr> },
}

impl Expr {
    /// Nesting depth of the expression tree
    pub fn depth(&self) -> usize {
        match self {
            Expr::Number(_) | Expr::Ident(_) => 1,
            Expr::Neg(inner) => 1 + inner.depth(),
            Expr::Binary { lhs, rhs, .. } => 1 + lhs.depth().max(rhs.depth()),
            Expr::Call { args, .. } => {
                1 + args.iter().map(Expr::depth).max().unwrap_or(0)
            }
        }
    }

    /// Whether any subexpression is an intrinsic call
    pub fn uses_intrinsics(&self) -> bool {
        match self {
            Expr::Number(_) | Expr::Ident(_) => false,
            Expr::Neg(inner) => inner.uses_intrinsics(),
            Expr::Binary { lhs, rhs, .. } => lhs.uses_intrinsics() || rhs.uses_intrinsics(),
            Expr::Call { .. } => true,
        }
    }
}

/// Function kinds relevant to tier selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Normal,
    /// Generator-style function with suspendable activations
    Resumable,
}

/// A parsed function declaration
#[derive(Debug, Clone)]
pub struct FunctionLiteral {
    /// Function name
    pub name: String,
    /// Parameter names in declaration order
    pub params: Vec<String>,
    /// Body expression
    pub body: Expr,
    /// Normal or resumable
    pub kind: FunctionKind,
    /// Declared as an asm-like numeric-subset module
    pub numeric_module: bool,
    /// Stable id within the enclosing program
    pub literal_id: u32,
    /// Location of the declaration
    pub location: SourceLocation,
}

impl FunctionLiteral {
    /// Whether the legacy baseline backend cannot represent this function.
    /// Resumable activations assume bytecode underneath, and the legacy
    /// backend has no intrinsic-call lowering.
    pub fn must_use_interpreter(&self) -> bool {
        self.kind == FunctionKind::Resumable || self.body.uses_intrinsics()
    }
}

/// Static scope information produced by [`analyze`]
#[derive(Debug, Clone)]
pub struct ScopeInfo {
    /// Parameter names, slot order
    pub params: Vec<String>,
    /// Maximum expression depth observed
    pub max_depth: usize,
}

impl ScopeInfo {
    /// Resolve a name to its parameter slot
    pub fn resolve(&self, name: &str) -> Option<u8> {
        self.params.iter().position(|p| p == name).map(|i| i as u8)
    }

    /// Number of parameter slots
    pub fn param_count(&self) -> u8 {
        self.params.len() as u8
    }
}

/// Analyze a function literal: resolve identifiers against the parameter
/// scope, check intrinsic calls, and bound the tree depth.
pub fn analyze(literal: &FunctionLiteral) -> Result<ScopeInfo> {
    let depth = literal.body.depth();
    if depth > MAX_EXPR_DEPTH {
        return Err(Error::stack_overflow(depth, MAX_EXPR_DEPTH));
    }
    let scope = ScopeInfo {
        params: literal.params.clone(),
        max_depth: depth,
    };
    check_expr(&literal.body, &scope, literal.location)?;
    Ok(scope)
}

fn check_expr(expr: &Expr, scope: &ScopeInfo, location: SourceLocation) -> Result<()> {
    match expr {
        Expr::Number(_) => Ok(()),
        Expr::Ident(name) => {
            if scope.resolve(name).is_none() {
                return Err(Error::analysis_error(
                    format!("'{}' is not defined", name),
                    location,
                ));
            }
            Ok(())
        }
        Expr::Neg(inner) => check_expr(inner, scope, location),
        Expr::Binary { lhs, rhs, .. } => {
            check_expr(lhs, scope, location)?;
            check_expr(rhs, scope, location)
        }
        Expr::Call { callee, args } => {
            let index = intrinsic_index(callee).ok_or_else(|| {
                Error::analysis_error(format!("'{}' is not an intrinsic", callee), location)
            })?;
            if args.len() != intrinsic_arity(index) {
                return Err(Error::analysis_error(
                    format!(
                        "'{}' takes {} argument(s), got {}",
                        callee,
                        intrinsic_arity(index),
                        args.len()
                    ),
                    location,
                ));
            }
            for arg in args {
                check_expr(arg, scope, location)?;
            }
            Ok(())
        }
    }
}

/// Parse a whole program: one function declaration per line, `#` comments
/// and blank lines ignored. Literal ids are assigned in source order.
pub fn parse_program(source: &str) -> Result<Vec<FunctionLiteral>> {
    let mut literals = Vec::new();
    for (idx, line) in source.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let literal = parse_function(line, idx as u32 + 1, literals.len() as u32)?;
        literals.push(literal);
    }
    Ok(literals)
}

/// Parse a single function declaration line
pub fn parse_function(line: &str, line_number: u32, literal_id: u32) -> Result<FunctionLiteral> {
    let mut parser = LineParser::new(line, line_number);
    parser.skip_ws();
    let location = parser.location();

    let mut kind = FunctionKind::Normal;
    let mut numeric_module = false;
    let mut keyword = parser.expect_ident()?;
    if keyword == "resumable" {
        kind = FunctionKind::Resumable;
        parser.skip_ws();
        keyword = parser.expect_ident()?;
    } else if keyword == "numeric" {
        numeric_module = true;
        parser.skip_ws();
        keyword = parser.expect_ident()?;
    }
    if keyword != "fn" {
        return Err(Error::parse_error(
            format!("expected 'fn', found '{}'", keyword),
            location,
        ));
    }

    parser.skip_ws();
    let name = parser.expect_ident()?;
    parser.expect_char('(')?;
    let mut params = Vec::new();
    parser.skip_ws();
    if !parser.eat_char(')') {
        loop {
            parser.skip_ws();
            params.push(parser.expect_ident()?);
            parser.skip_ws();
            if parser.eat_char(')') {
                break;
            }
            parser.expect_char(',')?;
        }
    }
    parser.skip_ws();
    parser.expect_char('=')?;

    let body = parser.parse_expr(0)?;
    parser.skip_ws();
    if let Some(c) = parser.peek() {
        return Err(Error::parse_error(
            format!("unexpected character '{}'", c),
            parser.location(),
        ));
    }
    if body.depth() > MAX_EXPR_DEPTH {
        return Err(Error::stack_overflow(body.depth(), MAX_EXPR_DEPTH));
    }

    Ok(FunctionLiteral {
        name,
        params,
        body,
        kind,
        numeric_module,
        literal_id,
        location,
    })
}

/// Single-line recursive-descent parser
struct LineParser<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: u32,
    column: u32,
}

impl<'a> LineParser<'a> {
    fn new(line: &'a str, line_number: u32) -> Self {
        Self {
            chars: line.chars().peekable(),
            line: line_number,
            column: 1,
        }
    }

    fn location(&self) -> SourceLocation {
        SourceLocation::new(self.line, self.column)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next();
        if c.is_some() {
            self.column += 1;
        }
        c
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn eat_char(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_char(&mut self, expected: char) -> Result<()> {
        self.skip_ws();
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            Some(c) => Err(Error::parse_error(
                format!("expected '{}', found '{}'", expected, c),
                self.location(),
            )),
            None => Err(Error::parse_error(
                format!("expected '{}', found end of line", expected),
                self.location(),
            )),
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        self.skip_ws();
        let location = self.location();
        let mut ident = String::new();
        match self.peek() {
            Some(c) if UnicodeXID::is_xid_start(c) => {
                ident.push(c);
                self.bump();
            }
            Some(c) => {
                return Err(Error::parse_error(
                    format!("expected identifier, found '{}'", c),
                    location,
                ))
            }
            None => {
                return Err(Error::parse_error(
                    "expected identifier, found end of line",
                    location,
                ))
            }
        }
        while matches!(self.peek(), Some(c) if UnicodeXID::is_xid_continue(c)) {
            ident.push(self.bump().unwrap_or_default());
        }
        Ok(ident)
    }

    fn parse_number(&mut self) -> Result<f64> {
        let location = self.location();
        let mut text = String::new();
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '.') {
            text.push(self.bump().unwrap_or_default());
        }
        text.parse::<f64>()
            .map_err(|_| Error::parse_error(format!("invalid number '{}'", text), location))
    }

    /// Precedence-climbing expression parser.
    /// min_prec 0 = additive, 1 = multiplicative.
    fn parse_expr(&mut self, min_prec: u8) -> Result<Expr> {
        let mut lhs = if min_prec >= 1 {
            self.parse_unary()?
        } else {
            self.parse_expr(1)?
        };
        loop {
            self.skip_ws();
            let op = match (self.peek(), min_prec) {
                (Some('+'), 0) => BinaryOp::Add,
                (Some('-'), 0) => BinaryOp::Sub,
                (Some('*'), 1) => BinaryOp::Mul,
                (Some('/'), 1) => BinaryOp::Div,
                _ => break,
            };
            self.bump();
            let rhs = if min_prec >= 1 {
                self.parse_unary()?
            } else {
                self.parse_expr(1)?
            };
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        self.skip_ws();
        if self.eat_char('-') {
            let operand = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(operand)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        self.skip_ws();
        let location = self.location();
        match self.peek() {
            Some('(') => {
                self.bump();
                let inner = self.parse_expr(0)?;
                self.expect_char(')')?;
                Ok(inner)
            }
            Some(c) if c.is_ascii_digit() || c == '.' => Ok(Expr::Number(self.parse_number()?)),
            Some(c) if UnicodeXID::is_xid_start(c) => {
                let name = self.expect_ident()?;
                self.skip_ws();
                if self.eat_char('(') {
                    let mut args = Vec::new();
                    self.skip_ws();
                    if !self.eat_char(')') {
                        loop {
                            args.push(self.parse_expr(0)?);
                            self.skip_ws();
                            if self.eat_char(')') {
                                break;
                            }
                            self.expect_char(',')?;
                        }
                    }
                    Ok(Expr::Call { callee: name, args })
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Some(c) => Err(Error::parse_error(
                format!("unexpected character '{}'", c),
                location,
            )),
            None => Err(Error::parse_error("unexpected end of line", location)),
        }
    }
}
