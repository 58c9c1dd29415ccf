use std::rc::Rc;

use colored::Colorize;
use hashbrown::HashSet;

use crate::{
    frontend::intern::InternedSymbol,
    index::{IndexVec, simple_index},
};

simple_index! {
    /// Identifies a unification cell in [`TypeContext`]
    pub struct UnknownId;
}

/// Thin pointer to an interned type kind. Do not construct directly;
/// use the constructors on [`TypeContext`] so that structurally equal
/// types share one allocation.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Type(Rc<TypeKind>);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Unit,
    Int,
    Float,
    Char,
    Bool,
    /// `from -> to`; multi-parameter functions are curried chains
    Function(Type, Type),
    /// `t ref`
    Reference(Type),
    /// `array [...] of t` with its declared dimensionality
    Array { dim: usize, element: Type },
    /// A declared algebraic type, compared by name
    Named(InternedSymbol),
    /// A unification cell: unbound until first compared against another
    /// type, then permanently forwarding to it
    Unknown(UnknownId),
}

impl Type {
    /// Direct constructors for the parser-facing side: annotation types
    /// arrive from outside the checker and need no interning (equality is
    /// structural either way). Unknown cells can only be minted by a
    /// [`TypeContext`].
    fn from_kind(kind: TypeKind) -> Self {
        Self(Rc::new(kind))
    }

    pub fn unit() -> Self {
        Self::from_kind(TypeKind::Unit)
    }

    pub fn int() -> Self {
        Self::from_kind(TypeKind::Int)
    }

    pub fn float() -> Self {
        Self::from_kind(TypeKind::Float)
    }

    pub fn char() -> Self {
        Self::from_kind(TypeKind::Char)
    }

    pub fn bool() -> Self {
        Self::from_kind(TypeKind::Bool)
    }

    pub fn function(from: Type, to: Type) -> Self {
        Self::from_kind(TypeKind::Function(from, to))
    }

    pub fn reference(inner: Type) -> Self {
        Self::from_kind(TypeKind::Reference(inner))
    }

    pub fn array(dim: usize, element: Type) -> Self {
        Self::from_kind(TypeKind::Array { dim, element })
    }

    pub fn named(name: InternedSymbol) -> Self {
        Self::from_kind(TypeKind::Named(name))
    }
}

impl core::fmt::Debug for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Type").field(&self.0).finish()
    }
}

impl core::ops::Deref for Type {
    type Target = TypeKind;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl TypeKind {
    pub fn is_unit(&self) -> bool {
        matches!(self, TypeKind::Unit)
    }

    pub fn is_function(&self) -> bool {
        matches!(self, TypeKind::Function(..))
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, TypeKind::Unknown(_))
    }
}

/// Owns the type interning table and the unification cells.
///
/// Unification here is deliberately one-shot: a cell binds the first time
/// it is compared against another type and is never revisited to
/// re-propagate information, so the outcome of checking can depend on
/// comparison order. This mirrors the language's accepted-program set and
/// must not be "fixed" into union-find.
#[derive(Debug, Default)]
pub struct TypeContext {
    type_table: HashSet<Rc<TypeKind>>,
    unknown_bindings: IndexVec<UnknownId, Option<Type>>,
}

impl TypeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, kind: TypeKind) -> Type {
        let rc = self.type_table.get_or_insert(Rc::new(kind));
        Type(rc.clone())
    }

    pub fn unit(&mut self) -> Type {
        self.intern(TypeKind::Unit)
    }

    pub fn int(&mut self) -> Type {
        self.intern(TypeKind::Int)
    }

    pub fn float(&mut self) -> Type {
        self.intern(TypeKind::Float)
    }

    pub fn char(&mut self) -> Type {
        self.intern(TypeKind::Char)
    }

    pub fn bool(&mut self) -> Type {
        self.intern(TypeKind::Bool)
    }

    pub fn function(&mut self, from: Type, to: Type) -> Type {
        self.intern(TypeKind::Function(from, to))
    }

    pub fn reference(&mut self, inner: Type) -> Type {
        self.intern(TypeKind::Reference(inner))
    }

    pub fn array(&mut self, dim: usize, element: Type) -> Type {
        self.intern(TypeKind::Array { dim, element })
    }

    pub fn named(&mut self, name: InternedSymbol) -> Type {
        self.intern(TypeKind::Named(name))
    }

    /// Allocates a fresh, unbound unification cell
    pub fn fresh_unknown(&mut self) -> Type {
        let id = self.unknown_bindings.push(None);
        self.intern(TypeKind::Unknown(id))
    }

    /// Follows unification cell bindings until reaching either a concrete
    /// type or an unbound cell. Nested unknowns are left in place and
    /// resolved on demand as comparisons recurse into them.
    pub fn resolve(&self, ty: &Type) -> Type {
        let mut current = ty.clone();

        loop {
            let next = match &*current {
                TypeKind::Unknown(id) => match &self.unknown_bindings[*id] {
                    Some(bound) => bound.clone(),
                    None => return current,
                },
                _ => return current,
            };

            current = next;
        }
    }

    fn bind(&mut self, id: UnknownId, ty: Type) {
        let cell = &mut self.unknown_bindings[id];
        debug_assert!(cell.is_none(), "a bound unification cell is never rebound");
        *cell = Some(ty);
    }

    /// The structural equality / compatibility test at the heart of the
    /// checker. An unbound cell on either side binds to the resolved view
    /// of the other side and the comparison succeeds; concrete types
    /// require matching variants and recursively equal children.
    pub fn equals(&mut self, a: &Type, b: &Type) -> bool {
        let a = self.resolve(a);
        let b = self.resolve(b);

        match (&*a, &*b) {
            (TypeKind::Unknown(u), TypeKind::Unknown(v)) if u == v => true,
            (TypeKind::Unknown(u), _) => {
                self.bind(*u, b.clone());
                true
            }
            (_, TypeKind::Unknown(v)) => {
                self.bind(*v, a.clone());
                true
            }
            (TypeKind::Unit, TypeKind::Unit)
            | (TypeKind::Int, TypeKind::Int)
            | (TypeKind::Float, TypeKind::Float)
            | (TypeKind::Char, TypeKind::Char)
            | (TypeKind::Bool, TypeKind::Bool) => true,
            (TypeKind::Function(from_a, to_a), TypeKind::Function(from_b, to_b)) => {
                let (from_a, from_b) = (from_a.clone(), from_b.clone());
                let (to_a, to_b) = (to_a.clone(), to_b.clone());
                self.equals(&from_a, &from_b) && self.equals(&to_a, &to_b)
            }
            (TypeKind::Reference(inner_a), TypeKind::Reference(inner_b)) => {
                let (inner_a, inner_b) = (inner_a.clone(), inner_b.clone());
                self.equals(&inner_a, &inner_b)
            }
            (
                TypeKind::Array {
                    dim: dim_a,
                    element: elem_a,
                },
                TypeKind::Array {
                    dim: dim_b,
                    element: elem_b,
                },
            ) => {
                let (elem_a, elem_b) = (elem_a.clone(), elem_b.clone());
                *dim_a == *dim_b && self.equals(&elem_a, &elem_b)
            }
            (TypeKind::Named(name_a), TypeKind::Named(name_b)) => name_a == name_b,
            _ => false,
        }
    }

    /// Renders a type with all reachable unification cells resolved, for
    /// use in diagnostics.
    pub fn render(&self, ty: &Type) -> String {
        let resolved = self.resolve(ty);

        match &*resolved {
            TypeKind::Function(from, to) => {
                let from_str = match &*self.resolve(from) {
                    TypeKind::Function(..) => format!("({})", self.render(from)),
                    _ => self.render(from),
                };
                format!("{} -> {}", from_str, self.render(to))
            }
            TypeKind::Reference(inner) => format!("{} ref", self.render(inner)),
            TypeKind::Array { dim, element } => {
                if *dim == 1 {
                    format!("array of {}", self.render(element))
                } else {
                    format!(
                        "array [{}] of {}",
                        vec!["*"; *dim].join(", "),
                        self.render(element)
                    )
                }
            }
            _ => resolved.to_string(),
        }
    }
}

impl core::fmt::Display for TypeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unit => write!(f, "unit"),
            Self::Int => write!(f, "int"),
            Self::Float => write!(f, "float"),
            Self::Char => write!(f, "char"),
            Self::Bool => write!(f, "bool"),
            Self::Function(from, to) => match &**from {
                TypeKind::Function(..) => write!(f, "({}) -> {}", **from, **to),
                _ => write!(f, "{} -> {}", **from, **to),
            },
            Self::Reference(inner) => write!(f, "{} ref", **inner),
            Self::Array { dim, element } => {
                if *dim == 1 {
                    write!(f, "array of {}", **element)
                } else {
                    write!(f, "array [{}] of {}", vec!["*"; *dim].join(", "), **element)
                }
            }
            Self::Named(name) => write!(f, "{name}"),
            Self::Unknown(id) => write!(f, "@{}", crate::index::Index::index(*id)),
        }
    }
}

impl core::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", (**self).to_string().yellow())
    }
}
