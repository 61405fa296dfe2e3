//! Selection cuts compiled from string expressions
//!
//! A cut such as `"1.83965 < M < 1.89965 and abs(dr) < 2"` is tokenized and
//! parsed once, with every variable name resolved through the
//! [`VariableProvider`]. Evaluation walks the typed AST; it never touches the
//! original string.
//!
//! Supports arithmetic (+, -, *, /), comparisons (==, !=, <, <=, >, >=) with
//! chaining, boolean operators (`and`/`&&`, `or`/`||`, `not`/`!`), and built-in
//! functions (abs, sqrt, log, exp, pow, min, max). Identifiers followed by a
//! parenthesised argument list that are not functions are meta-variables
//! (`daughter(0, M)`, `useCMSFrame(p)`).

use crate::event::Event;
use crate::types::{CandidateId, PipelineError, Result};
use crate::variables::{Variable, VariableProvider};
use std::fmt;

// ── AST ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Const(f64),
    Var(Variable),
    Neg(Box<Expr>),
    Arith(ArithOp, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Func {
    Abs,
    Sqrt,
    Log,
    Exp,
    Pow,
    Min,
    Max,
}

fn func_from_ident(name: &str) -> Option<Func> {
    match name {
        "abs" => Some(Func::Abs),
        "sqrt" => Some(Func::Sqrt),
        "log" => Some(Func::Log),
        "exp" => Some(Func::Exp),
        "pow" => Some(Func::Pow),
        "min" => Some(Func::Min),
        "max" => Some(Func::Max),
        _ => None,
    }
}

// ── Compiled cut ───────────────────────────────────────────────

/// A compiled selection predicate
#[derive(Debug, Clone, PartialEq)]
pub struct Cut {
    /// `None` for the empty cut, which always passes
    ast: Option<Expr>,
    source: String,
}

impl Cut {
    /// The cut that accepts everything
    pub fn always() -> Self {
        Self { ast: None, source: String::new() }
    }

    /// Parse and compile a cut expression
    ///
    /// Unknown variable names fail here, with `PipelineError::UnknownVariable`.
    pub fn compile(input: &str, provider: &dyn VariableProvider) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(Self::always());
        }
        let tokens = tokenize(input)?;
        let mut parser = Parser::new(&tokens, provider);
        let ast = parser.parse_or()?;
        if parser.pos < parser.tokens.len() {
            return Err(PipelineError::Expression(format!(
                "unexpected token after expression in '{}': {:?}",
                input, parser.tokens[parser.pos]
            )));
        }
        Ok(Self { ast: Some(ast), source: input.trim().to_string() })
    }

    /// True for the empty cut
    pub fn is_always(&self) -> bool {
        self.ast.is_none()
    }

    /// The expression text this cut was compiled from
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate the cut on a candidate
    pub fn passes(&self, provider: &dyn VariableProvider, event: &Event, id: CandidateId) -> bool {
        match &self.ast {
            None => true,
            Some(ast) => truthy(eval(ast, provider, event, id)),
        }
    }

    /// Split off the parts of this cut that only look at one daughter slot
    ///
    /// Top-level conjuncts whose variables are all `daughter(i, ...)` for a single
    /// `i < n_slots` are rewritten to act on the daughter directly and returned in
    /// slot `i`. Everything else stays in the residual cut, which must still be
    /// evaluated on the assembled candidate.
    pub fn split_slot_cuts(&self, n_slots: usize) -> (Vec<Cut>, Cut) {
        let mut slots: Vec<Vec<Expr>> = vec![Vec::new(); n_slots];
        let mut residual = Vec::new();

        if let Some(ast) = &self.ast {
            let mut conjuncts = Vec::new();
            flatten_and(ast, &mut conjuncts);
            for conjunct in conjuncts {
                match single_slot(conjunct) {
                    Some(slot) if slot < n_slots => slots[slot].push(strip_daughter(conjunct)),
                    _ => residual.push(conjunct.clone()),
                }
            }
        }

        let slot_cuts = slots.into_iter().map(Cut::from_conjuncts).collect();
        (slot_cuts, Cut::from_conjuncts(residual))
    }

    fn from_conjuncts(conjuncts: Vec<Expr>) -> Cut {
        let ast = conjuncts
            .into_iter()
            .reduce(|acc, e| Expr::And(Box::new(acc), Box::new(e)));
        let source = ast.as_ref().map(|a| a.to_string()).unwrap_or_default();
        Cut { ast, source }
    }
}

impl fmt::Display for Cut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.source.is_empty() {
            write!(f, "<always>")
        } else {
            write!(f, "{}", self.source)
        }
    }
}

fn flatten_and<'a>(e: &'a Expr, out: &mut Vec<&'a Expr>) {
    match e {
        Expr::And(a, b) => {
            flatten_and(a, out);
            flatten_and(b, out);
        }
        other => out.push(other),
    }
}

/// The daughter slot every variable in `e` refers to, if there is exactly one
fn single_slot(e: &Expr) -> Option<usize> {
    let mut slot = None;
    let mut ok = true;
    visit_vars(e, &mut |v| match v {
        Variable::Daughter(i, _) => match slot {
            None => slot = Some(*i),
            Some(s) if s == *i => {}
            Some(_) => ok = false,
        },
        _ => ok = false,
    });
    if ok {
        slot
    } else {
        None
    }
}

fn visit_vars<F: FnMut(&Variable)>(e: &Expr, f: &mut F) {
    match e {
        Expr::Const(_) => {}
        Expr::Var(v) => f(v),
        Expr::Neg(a) | Expr::Not(a) => visit_vars(a, f),
        Expr::Arith(_, a, b) | Expr::Compare(_, a, b) | Expr::And(a, b) | Expr::Or(a, b) => {
            visit_vars(a, f);
            visit_vars(b, f);
        }
        Expr::Call(_, args) => args.iter().for_each(|a| visit_vars(a, f)),
    }
}

fn strip_daughter(e: &Expr) -> Expr {
    let strip = |a: &Expr| Box::new(strip_daughter(a));
    match e {
        Expr::Var(Variable::Daughter(_, inner)) => Expr::Var((**inner).clone()),
        Expr::Const(c) => Expr::Const(*c),
        Expr::Var(v) => Expr::Var(v.clone()),
        Expr::Neg(a) => Expr::Neg(strip(a)),
        Expr::Not(a) => Expr::Not(strip(a)),
        Expr::Arith(op, a, b) => Expr::Arith(*op, strip(a), strip(b)),
        Expr::Compare(op, a, b) => Expr::Compare(*op, strip(a), strip(b)),
        Expr::And(a, b) => Expr::And(strip(a), strip(b)),
        Expr::Or(a, b) => Expr::Or(strip(a), strip(b)),
        Expr::Call(func, args) => Expr::Call(*func, args.iter().map(strip_daughter).collect()),
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(c) => write!(f, "{}", c),
            Expr::Var(v) => write!(f, "{}", v),
            Expr::Neg(a) => write!(f, "-({})", a),
            Expr::Not(a) => write!(f, "not ({})", a),
            Expr::Arith(op, a, b) => {
                let sym = match op {
                    ArithOp::Add => "+",
                    ArithOp::Sub => "-",
                    ArithOp::Mul => "*",
                    ArithOp::Div => "/",
                };
                write!(f, "({} {} {})", a, sym, b)
            }
            Expr::Compare(op, a, b) => {
                let sym = match op {
                    CmpOp::Eq => "==",
                    CmpOp::Ne => "!=",
                    CmpOp::Lt => "<",
                    CmpOp::Le => "<=",
                    CmpOp::Gt => ">",
                    CmpOp::Ge => ">=",
                };
                write!(f, "{} {} {}", a, sym, b)
            }
            Expr::And(a, b) => write!(f, "{} and {}", a, b),
            Expr::Or(a, b) => write!(f, "({} or {})", a, b),
            Expr::Call(func, args) => {
                let name = match func {
                    Func::Abs => "abs",
                    Func::Sqrt => "sqrt",
                    Func::Log => "log",
                    Func::Exp => "exp",
                    Func::Pow => "pow",
                    Func::Min => "min",
                    Func::Max => "max",
                };
                write!(f, "{}(", name)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
        }
    }
}

// ── Evaluation ─────────────────────────────────────────────────

fn truthy(v: f64) -> bool {
    !v.is_nan() && v != 0.0
}

fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn eval(e: &Expr, provider: &dyn VariableProvider, event: &Event, id: CandidateId) -> f64 {
    let ev = |a: &Expr| eval(a, provider, event, id);
    match e {
        Expr::Const(c) => *c,
        Expr::Var(v) => provider.value(event, id, v),
        Expr::Neg(a) => -ev(a),
        Expr::Not(a) => flag(!truthy(ev(a))),
        Expr::Arith(op, a, b) => {
            let (x, y) = (ev(a), ev(b));
            match op {
                ArithOp::Add => x + y,
                ArithOp::Sub => x - y,
                ArithOp::Mul => x * y,
                ArithOp::Div => x / y,
            }
        }
        Expr::Compare(op, a, b) => {
            let (x, y) = (ev(a), ev(b));
            // IEEE comparisons with NaN are false, `!=` included here
            if x.is_nan() || y.is_nan() {
                return 0.0;
            }
            flag(match op {
                CmpOp::Eq => x == y,
                CmpOp::Ne => x != y,
                CmpOp::Lt => x < y,
                CmpOp::Le => x <= y,
                CmpOp::Gt => x > y,
                CmpOp::Ge => x >= y,
            })
        }
        Expr::And(a, b) => flag(truthy(ev(a)) && truthy(ev(b))),
        Expr::Or(a, b) => flag(truthy(ev(a)) || truthy(ev(b))),
        Expr::Call(func, args) => {
            let x = ev(&args[0]);
            match func {
                Func::Abs => x.abs(),
                Func::Sqrt => x.sqrt(),
                Func::Log => x.ln(),
                Func::Exp => x.exp(),
                Func::Pow => x.powf(ev(&args[1])),
                Func::Min => args[1..].iter().map(|a| ev(a)).fold(x, f64::min),
                Func::Max => args[1..].iter().map(|a| ev(a)).fold(x, f64::max),
            }
        }
    }
}

// ── Tokenizer ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    /// `name(...)` that is not a math function, kept verbatim for the provider
    MetaVar(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    Not,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // Two-character operators
        if i + 1 < chars.len() {
            let tok = match (c, chars[i + 1]) {
                ('&', '&') => Some(Token::And),
                ('|', '|') => Some(Token::Or),
                ('=', '=') => Some(Token::Eq),
                ('!', '=') => Some(Token::Ne),
                ('<', '=') => Some(Token::Le),
                ('>', '=') => Some(Token::Ge),
                _ => None,
            };
            if let Some(t) = tok {
                tokens.push(t);
                i += 2;
                continue;
            }
        }

        match c {
            '+' => tokens.push(Token::Plus),
            '-' => tokens.push(Token::Minus),
            '*' => tokens.push(Token::Star),
            '/' => tokens.push(Token::Slash),
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            ',' => tokens.push(Token::Comma),
            '<' => tokens.push(Token::Lt),
            '>' => tokens.push(Token::Gt),
            '!' => tokens.push(Token::Not),
            _ if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_digit()
                        || chars[i] == '.'
                        || chars[i] == 'e'
                        || chars[i] == 'E'
                        || ((chars[i] == '+' || chars[i] == '-')
                            && i > start
                            && (chars[i - 1] == 'e' || chars[i - 1] == 'E')))
                {
                    i += 1;
                }
                let s: String = chars[start..i].iter().collect();
                let n: f64 = s
                    .parse()
                    .map_err(|_| PipelineError::Expression(format!("invalid number: '{}'", s)))?;
                tokens.push(Token::Num(n));
                continue;
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "not" => tokens.push(Token::Not),
                    _ => {
                        let mut j = i;
                        while j < chars.len() && chars[j].is_whitespace() {
                            j += 1;
                        }
                        if j < chars.len() && chars[j] == '(' && func_from_ident(&word).is_none() {
                            let end = matching_paren(&chars, j).ok_or_else(|| {
                                PipelineError::Expression(format!(
                                    "unbalanced parentheses after '{}'",
                                    word
                                ))
                            })?;
                            let text: String = chars[start..=end].iter().collect();
                            tokens.push(Token::MetaVar(text));
                            i = end + 1;
                        } else {
                            tokens.push(Token::Ident(word));
                        }
                    }
                }
                continue;
            }
            _ => {
                return Err(PipelineError::Expression(format!("unexpected character: '{}'", c)));
            }
        }
        i += 1;
    }

    Ok(tokens)
}

fn matching_paren(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (k, &c) in chars.iter().enumerate().skip(open) {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(k);
                }
            }
            _ => {}
        }
    }
    None
}

// ── Parser (recursive descent) ─────────────────────────────────

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    provider: &'a dyn VariableProvider,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token], provider: &'a dyn VariableProvider) -> Self {
        Self { tokens, pos: 0, provider }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        match self.advance() {
            Some(t) if t == expected => Ok(()),
            other => Err(PipelineError::Expression(format!(
                "expected {:?}, got {:?}",
                expected, other
            ))),
        }
    }

    // ── Grammar rules ──────────────────────────────────────────

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_not()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let rhs = self.parse_not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.advance();
            let e = self.parse_not()?;
            return Ok(Expr::Not(Box::new(e)));
        }
        self.parse_cmp()
    }

    fn cmp_op(&self) -> Option<CmpOp> {
        match self.peek() {
            Some(Token::Eq) => Some(CmpOp::Eq),
            Some(Token::Ne) => Some(CmpOp::Ne),
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Le) => Some(CmpOp::Le),
            Some(Token::Gt) => Some(CmpOp::Gt),
            Some(Token::Ge) => Some(CmpOp::Ge),
            _ => None,
        }
    }

    /// `a < b < c` means `a < b and b < c`
    fn parse_cmp(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_add()?;
        let mut chain: Option<Expr> = None;
        while let Some(op) = self.cmp_op() {
            self.advance();
            let rhs = self.parse_add()?;
            let link = Expr::Compare(op, Box::new(lhs), Box::new(rhs.clone()));
            chain = Some(match chain {
                None => link,
                Some(prev) => Expr::And(Box::new(prev), Box::new(link)),
            });
            lhs = rhs;
        }
        Ok(chain.unwrap_or(lhs))
    }

    fn parse_add(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => ArithOp::Add,
                Some(Token::Minus) => ArithOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_mul()?;
            lhs = Expr::Arith(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => ArithOp::Mul,
                Some(Token::Slash) => ArithOp::Div,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Arith(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Minus) => {
                self.advance();
                let e = self.parse_unary()?;
                Ok(Expr::Neg(Box::new(e)))
            }
            Some(Token::Plus) => {
                self.advance();
                self.parse_unary()
            }
            _ => self.parse_atom(),
        }
    }

    fn parse_atom(&mut self) -> Result<Expr> {
        match self.advance().cloned() {
            Some(Token::Num(n)) => Ok(Expr::Const(n)),
            Some(Token::LParen) => {
                let e = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(e)
            }
            Some(Token::MetaVar(text)) => Ok(Expr::Var(self.provider.resolve(&text)?)),
            Some(Token::Ident(name)) => {
                if let Some(func) = func_from_ident(&name) {
                    if matches!(self.peek(), Some(Token::LParen)) {
                        self.advance();
                        let mut args = vec![self.parse_or()?];
                        while matches!(self.peek(), Some(Token::Comma)) {
                            self.advance();
                            args.push(self.parse_or()?);
                        }
                        self.expect(&Token::RParen)?;
                        let arity_ok = match func {
                            Func::Pow => args.len() == 2,
                            Func::Min | Func::Max => args.len() >= 2,
                            _ => args.len() == 1,
                        };
                        if !arity_ok {
                            return Err(PipelineError::Expression(format!(
                                "wrong number of arguments for '{}'",
                                name
                            )));
                        }
                        return Ok(Expr::Call(func, args));
                    }
                }
                Ok(Expr::Var(self.provider.resolve(&name)?))
            }
            other => Err(PipelineError::Expression(format!(
                "expected number, variable, or '(', got {:?}",
                other
            ))),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────
