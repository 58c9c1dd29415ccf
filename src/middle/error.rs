//! Fatal compilation errors.
//!
//! There is no recovery and no aggregation anywhere in this crate: the
//! first violation found wins, checking stops, and the error travels up as
//! a `Result` to whoever drives the compilation. [`CompileError::report`]
//! is the single place that turns one into a process exit.

use colored::Colorize;
use indoc::formatdoc;

use crate::frontend::intern::InternedSymbol;

#[derive(Debug)]
pub enum CompileError {
    Semantic(SemanticError),
    /// The generated module failed structural verification; carries the
    /// plain-text rendering of the offending module
    MalformedModule { reason: String, module: String },
}

pub type Result<T> = core::result::Result<T, CompileError>;

#[derive(Debug, PartialEq)]
pub enum SemanticError {
    UnknownIdentifier {
        name: InternedSymbol,
    },
    RedeclaredIdentifier {
        name: InternedSymbol,
    },
    TypeMismatch {
        /// Source rendering of the offending expression or pattern
        expression: String,
        expected: String,
        actual: String,
    },
    /// Too many or too few arguments in an application, constructor use,
    /// or constructor pattern; also raised when a bare lowercase
    /// identifier of function type is used as a value
    ParameterCountMismatch {
        name: InternedSymbol,
    },
    /// Structural/physical (in)equality on function or array operands, or
    /// an ordering comparison on anything but int, float or char
    ComparisonNotAllowed {
        operator: String,
        operand_ty: String,
    },
    /// Indexing something that is not an array, or with the wrong number
    /// of indices
    NotAnArray {
        name: InternedSymbol,
    },
    /// `dim k a` with `k` outside the declared dimensionality
    ArrayDimensionMismatch {
        name: InternedSymbol,
    },
    /// `new` of an array type
    ReferenceOfArrayType,
    /// A function definition annotated with a function return type
    FunctionReturnType {
        name: InternedSymbol,
    },
}

impl From<SemanticError> for CompileError {
    fn from(error: SemanticError) -> Self {
        Self::Semantic(error)
    }
}

impl core::fmt::Display for SemanticError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownIdentifier { name } => {
                write!(f, "Unknown identifier {name}")
            }
            Self::RedeclaredIdentifier { name } => {
                write!(f, "Redeclared identifier {name}")
            }
            Self::TypeMismatch {
                expression,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Type mismatch in {expression}: expected {expected}, found {actual}"
                )
            }
            Self::ParameterCountMismatch { name } => {
                write!(f, "Parameter number mismatch for {name}")
            }
            Self::ComparisonNotAllowed {
                operator,
                operand_ty,
            } => {
                write!(f, "Type {operand_ty} not allowed as an operand of {operator}")
            }
            Self::NotAnArray { name } => {
                write!(f, "{name} is not an array of the required dimensionality")
            }
            Self::ArrayDimensionMismatch { name } => {
                write!(f, "Array dimensions mismatch for {name}")
            }
            Self::ReferenceOfArrayType => {
                write!(f, "Reference cannot be of an array type")
            }
            Self::FunctionReturnType { name } => {
                write!(f, "Return type of {name} cannot be a function")
            }
        }
    }
}

impl core::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Semantic(error) => write!(f, "{error}"),
            Self::MalformedModule { reason, module } => {
                let report = formatdoc! {"
                    the generated module failed verification: {reason}

                    {module}"
                };
                write!(f, "{report}")
            }
        }
    }
}

impl CompileError {
    /// The top of the fatal-error funnel: print the diagnostic to stderr
    /// and terminate the compilation with a non-zero status.
    pub fn report(self) -> ! {
        eprintln!("{} {self}", "error:".red().bold());
        std::process::exit(1);
    }
}
