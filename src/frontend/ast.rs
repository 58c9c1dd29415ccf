//! The abstract syntax tree handed over by the external parser.
//!
//! Expression and pattern nodes carry a `ty` slot which starts out empty
//! and is filled in during type checking. Identifier symbols are likewise
//! rewritten in place to their unique storage names (`x` -> `x_3`) as the
//! checker assigns slots, so the lowering pass only ever sees storage
//! names.

use itertools::Itertools;

use crate::{frontend::intern::InternedSymbol, middle::ty::Type};

#[derive(Debug)]
pub struct Program {
    pub statements: Vec<Statement>,
}

#[derive(Debug)]
pub enum Statement {
    /// A group of mutually visible algebraic type definitions
    /// (`type t1 = ... and t2 = ...`)
    Types(Vec<TypeDefinition>),
    Let(LetGroup),
}

/// A `let` / `let rec` definition group. Definitions in a recursive group
/// see each other's names; in a non-recursive group the defined names only
/// become visible after their bodies are checked.
#[derive(Debug)]
pub struct LetGroup {
    pub recursive: bool,
    pub defs: Vec<Definition>,
}

#[derive(Debug)]
pub enum Definition {
    /// A constant (no parameters) or function definition
    Value {
        name: InternedSymbol,
        params: Vec<Parameter>,
        /// Missing annotations receive a fresh unification cell
        return_ty: Option<Type>,
        body: Expression,
    },
    /// A mutable scalar (`mutable x : int`) or array
    /// (`mutable a [e1, e2] : float`) definition
    Mutable {
        name: InternedSymbol,
        dims: Option<Vec<Expression>>,
        ty: Type,
    },
}

#[derive(Debug)]
pub struct Parameter {
    pub name: InternedSymbol,
    pub ty: Option<Type>,
}

#[derive(Debug)]
pub struct TypeDefinition {
    pub name: InternedSymbol,
    pub constructors: Vec<ConstructorDefinition>,
}

#[derive(Debug)]
pub struct ConstructorDefinition {
    pub name: InternedSymbol,
    pub fields: Vec<Type>,
}

#[derive(Debug)]
pub struct Expression {
    pub kind: ExpressionKind,
    /// Filled in by type checking, read by lowering
    pub ty: Option<Type>,
}

impl Expression {
    pub fn new(kind: ExpressionKind) -> Self {
        Self { kind, ty: None }
    }
}

#[derive(Debug)]
pub enum ExpressionKind {
    Unit,
    Int(i64),
    Float(f64),
    Char(u8),
    Bool(bool),
    String(String),
    /// A lowercase identifier naming a value binding or function
    Identifier(InternedSymbol),
    /// An uppercase identifier: a nullary constructor use
    Constructor(InternedSymbol),
    /// Function or constructor application, always by name
    Call {
        name: InternedSymbol,
        args: Vec<Expression>,
    },
    /// `a[e1, e2]`, yielding a reference to the element
    ArrayIndex {
        name: InternedSymbol,
        indices: Vec<Expression>,
    },
    /// `dim k a`, reading the k-th dimension extent (1-based)
    Dim {
        name: InternedSymbol,
        index: usize,
    },
    Unary {
        operator: UnaryOperatorKind,
        operand: Box<Expression>,
    },
    Binary {
        lhs: Box<Expression>,
        operator: BinaryOperatorKind,
        rhs: Box<Expression>,
    },
    If {
        condition: Box<Expression>,
        positive: Box<Expression>,
        negative: Option<Box<Expression>>,
    },
    While {
        condition: Box<Expression>,
        body: Box<Expression>,
    },
    For {
        counter: InternedSymbol,
        start: Box<Expression>,
        end: Box<Expression>,
        descending: bool,
        body: Box<Expression>,
    },
    Match {
        scrutinee: Box<Expression>,
        clauses: Vec<Clause>,
    },
    New(Type),
    LetIn {
        group: LetGroup,
        body: Box<Expression>,
    },
}

#[derive(Debug)]
pub struct Clause {
    pub pattern: Pattern,
    pub body: Expression,
}

#[derive(Debug)]
pub struct Pattern {
    pub kind: PatternKind,
    pub ty: Option<Type>,
}

impl Pattern {
    pub fn new(kind: PatternKind) -> Self {
        Self { kind, ty: None }
    }
}

#[derive(Debug)]
pub enum PatternKind {
    Int(i64),
    Float(f64),
    Char(u8),
    Bool(bool),
    /// A lowercase identifier, binding the scrutinee to a fresh slot.
    /// Catch-all patterns are spelled this way; there is no wildcard.
    Binding(InternedSymbol),
    /// A constructor pattern; nullary constructors have no sub-patterns
    Constructor {
        name: InternedSymbol,
        fields: Vec<Pattern>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOperatorKind {
    /// `+e`
    Plus,
    /// `-e`
    Minus,
    /// `+.e`
    FloatPlus,
    /// `-.e`
    FloatMinus,
    /// `!e`, loading through a reference
    Deref,
    /// `not e`
    Not,
    /// `delete e`, releasing a reference's storage
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOperatorKind {
    Add,
    Subtract,
    Multiply,
    Divide,
    FloatAdd,
    FloatSubtract,
    FloatMultiply,
    FloatDivide,
    Modulus,
    Power,
    /// `=`, structural equality
    StructuralEquals,
    /// `<>`
    StructuralNotEquals,
    /// `==`, physical (identity) equality
    PhysicalEquals,
    /// `!=`
    PhysicalNotEquals,
    LessThan,
    GreaterThan,
    LessThanOrEqualTo,
    GreaterThanOrEqualTo,
    LogicalAnd,
    LogicalOr,
    /// `;`
    Sequence,
    /// `:=`
    Assign,
}

impl core::fmt::Display for UnaryOperatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let symbol = match self {
            Self::Plus => "+",
            Self::Minus => "-",
            Self::FloatPlus => "+.",
            Self::FloatMinus => "-.",
            Self::Deref => "!",
            Self::Not => "not ",
            Self::Delete => "delete ",
        };
        write!(f, "{symbol}")
    }
}

impl core::fmt::Display for BinaryOperatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let symbol = match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::FloatAdd => "+.",
            Self::FloatSubtract => "-.",
            Self::FloatMultiply => "*.",
            Self::FloatDivide => "/.",
            Self::Modulus => "mod",
            Self::Power => "**",
            Self::StructuralEquals => "=",
            Self::StructuralNotEquals => "<>",
            Self::PhysicalEquals => "==",
            Self::PhysicalNotEquals => "!=",
            Self::LessThan => "<",
            Self::GreaterThan => ">",
            Self::LessThanOrEqualTo => "<=",
            Self::GreaterThanOrEqualTo => ">=",
            Self::LogicalAnd => "&&",
            Self::LogicalOr => "||",
            Self::Sequence => ";",
            Self::Assign => ":=",
        };
        write!(f, "{symbol}")
    }
}

/// Decodes the body of a quoted character token (`'a'`, `'\n'`, `'\x41'`)
/// into the byte it denotes.
pub fn decode_char_literal(token: &str) -> u8 {
    let inner = token.trim_matches('\'');
    let mut bytes = inner.bytes();

    match bytes.next() {
        Some(b'\\') => decode_escape(&mut bytes),
        Some(b) => b,
        None => 0,
    }
}

/// Decodes the body of a quoted string token into its raw bytes.
pub fn decode_string_literal(token: &str) -> String {
    let inner = token.trim_matches('"');
    let mut out = String::with_capacity(inner.len());
    let mut bytes = inner.bytes();

    while let Some(b) = bytes.next() {
        if b == b'\\' {
            out.push(decode_escape(&mut bytes) as char);
        } else {
            out.push(b as char);
        }
    }

    out
}

fn decode_escape(bytes: &mut core::str::Bytes) -> u8 {
    match bytes.next() {
        Some(b'n') => b'\n',
        Some(b't') => b'\t',
        Some(b'r') => b'\r',
        Some(b'0') => 0,
        Some(b'\\') => b'\\',
        Some(b'\'') => b'\'',
        Some(b'"') => b'"',
        Some(b'x') => {
            let hi = bytes.next().unwrap_or(b'0') as char;
            let lo = bytes.next().unwrap_or(b'0') as char;
            let hex: String = [hi, lo].into_iter().collect();
            u8::from_str_radix(&hex, 16).unwrap_or(0)
        }
        Some(other) => other,
        None => 0,
    }
}

impl core::fmt::Display for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ExpressionKind::Unit => write!(f, "()"),
            ExpressionKind::Int(n) => write!(f, "{n}"),
            ExpressionKind::Float(x) => write!(f, "{x}"),
            ExpressionKind::Char(c) => write!(f, "'{}'", (*c as char).escape_default()),
            ExpressionKind::Bool(b) => write!(f, "{b}"),
            ExpressionKind::String(s) => write!(f, "{s:?}"),
            ExpressionKind::Identifier(name) | ExpressionKind::Constructor(name) => {
                write!(f, "{name}")
            }
            ExpressionKind::Call { name, args } => {
                write!(f, "({name} {})", args.iter().map(|a| a.to_string()).join(" "))
            }
            ExpressionKind::ArrayIndex { name, indices } => {
                write!(
                    f,
                    "{name}[{}]",
                    indices.iter().map(|i| i.to_string()).join(", ")
                )
            }
            ExpressionKind::Dim { name, index } => write!(f, "dim {index} {name}"),
            ExpressionKind::Unary { operator, operand } => write!(f, "{operator}{operand}"),
            ExpressionKind::Binary { lhs, operator, rhs } => {
                write!(f, "({lhs} {operator} {rhs})")
            }
            ExpressionKind::If {
                condition,
                positive,
                negative,
            } => {
                write!(f, "if {condition} then {positive}")?;
                if let Some(negative) = negative {
                    write!(f, " else {negative}")?;
                }
                Ok(())
            }
            ExpressionKind::While { condition, body } => {
                write!(f, "while {condition} do {body} done")
            }
            ExpressionKind::For {
                counter,
                start,
                end,
                descending,
                body,
            } => {
                let direction = if *descending { "downto" } else { "to" };
                write!(f, "for {counter} = {start} {direction} {end} do {body} done")
            }
            ExpressionKind::Match { scrutinee, clauses } => {
                write!(
                    f,
                    "match {scrutinee} with {} end",
                    clauses
                        .iter()
                        .map(|c| format!("{} -> {}", c.pattern, c.body))
                        .join(" | ")
                )
            }
            ExpressionKind::New(ty) => write!(f, "new {ty}"),
            ExpressionKind::LetIn { group, body } => {
                let rec = if group.recursive { " rec" } else { "" };
                write!(f, "let{rec} ... in {body}")
            }
        }
    }
}

impl core::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PatternKind::Int(n) => write!(f, "{n}"),
            PatternKind::Float(x) => write!(f, "{x}"),
            PatternKind::Char(c) => write!(f, "'{}'", (*c as char).escape_default()),
            PatternKind::Bool(b) => write!(f, "{b}"),
            PatternKind::Binding(name) => write!(f, "{name}"),
            PatternKind::Constructor { name, fields } => {
                if fields.is_empty() {
                    write!(f, "{name}")
                } else {
                    write!(
                        f,
                        "({name} {})",
                        fields.iter().map(|p| p.to_string()).join(" ")
                    )
                }
            }
        }
    }
}
