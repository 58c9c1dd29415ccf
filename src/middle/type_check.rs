//! The type checking pass.
//!
//! Checking walks the whole program once before any lowering happens. It
//! has three jobs that cannot be separated: deciding whether the program
//! is well typed, assigning every binding its storage slot (which rewrites
//! identifiers to their unique storage names in place), and decorating
//! every expression and pattern node with its resolved type. The lowering
//! pass consumes all three results through the same AST.
//!
//! The first violation found ends the compilation; there is no recovery
//! and no error aggregation.

use hashbrown::HashMap;
use strum::IntoEnumIterator;

use crate::{
    frontend::{
        ast::{
            BinaryOperatorKind, ConstructorDefinition, Definition, Expression, ExpressionKind,
            LetGroup, Pattern, PatternKind, Program, Statement, UnaryOperatorKind,
        },
        intern::InternedSymbol,
    },
    middle::{
        error::SemanticError,
        runtime::RuntimePrimitive,
        symbol::{SymbolTable, TypeDefTable},
        ty::{Type, TypeContext, TypeKind},
    },
};

/// Everything later passes need from checking: the unification state
/// (for resolving node types), the constructor registry, and the storage
/// names the runtime primitives were registered under.
#[derive(Debug)]
pub struct ModuleCheckResults {
    pub types: TypeContext,
    /// Mangled constructor name -> tag / fields / owning type
    pub constructors: HashMap<InternedSymbol, ConstructorInfo>,
    /// Algebraic type name -> its constructors' mangled names, in
    /// declaration order
    pub adts: HashMap<InternedSymbol, Vec<InternedSymbol>>,
    /// Runtime primitive -> the binding it was registered under
    pub runtime: HashMap<RuntimePrimitive, RuntimeBinding>,
}

/// How a runtime primitive was registered: its mangled storage name and
/// its curried source type
#[derive(Debug, Clone)]
pub struct RuntimeBinding {
    pub name: InternedSymbol,
    pub ty: Type,
}

#[derive(Debug, Clone)]
pub struct ConstructorInfo {
    /// The integer discriminant stored at offset 0 of the constructed
    /// record, derived from the constructor's storage slot
    pub tag: usize,
    pub fields: Vec<Type>,
    pub owner: InternedSymbol,
}

pub struct TypeChecker {
    types: TypeContext,
    symbols: SymbolTable,
    typedefs: TypeDefTable,
    constructors: HashMap<InternedSymbol, ConstructorInfo>,
    adts: HashMap<InternedSymbol, Vec<InternedSymbol>>,
    runtime: HashMap<RuntimePrimitive, RuntimeBinding>,
}

/// Type checks a whole program, decorating the AST in place.
pub fn check_program(program: &mut Program) -> Result<ModuleCheckResults, SemanticError> {
    let mut checker = TypeChecker {
        types: TypeContext::new(),
        symbols: SymbolTable::new(),
        typedefs: TypeDefTable::new(),
        constructors: HashMap::new(),
        adts: HashMap::new(),
        runtime: HashMap::new(),
    };

    checker.symbols.open_scope();
    checker.register_runtime_primitives();

    for statement in program.statements.iter_mut() {
        checker.check_statement(statement)?;
    }

    Ok(ModuleCheckResults {
        types: checker.types,
        constructors: checker.constructors,
        adts: checker.adts,
        runtime: checker.runtime,
    })
}

impl TypeChecker {
    /// Registers the runtime library in the outermost scope. The fixed
    /// iteration order pins the slot suffix of each primitive's storage
    /// name.
    fn register_runtime_primitives(&mut self) {
        for primitive in RuntimePrimitive::iter() {
            let ty = primitive.source_type(&mut self.types);
            let mut name = InternedSymbol::new(&primitive.to_string());

            self.symbols
                .insert(&mut name, ty.clone())
                .expect("runtime primitives are registered once into a fresh scope");
            self.runtime.insert(primitive, RuntimeBinding { name, ty });
        }
    }

    fn check_statement(&mut self, statement: &mut Statement) -> Result<(), SemanticError> {
        match statement {
            Statement::Types(defs) => {
                // Names first so that constructors of mutually recursive
                // types can mention each other
                for def in defs.iter() {
                    self.typedefs.insert(def.name)?;
                }

                for def in defs.iter_mut() {
                    let owner = def.name;
                    for constructor in def.constructors.iter_mut() {
                        self.check_constructor(constructor, owner)?;
                    }
                }

                Ok(())
            }
            Statement::Let(group) => self.check_let_group(group),
        }
    }

    fn check_constructor(
        &mut self,
        constructor: &mut ConstructorDefinition,
        owner: InternedSymbol,
    ) -> Result<(), SemanticError> {
        for field in &constructor.fields {
            self.check_type(field)?;
        }

        // Constructors are registered as curried functions into the
        // owning type
        let mut curried = self.types.named(owner);
        for field in constructor.fields.iter().rev() {
            curried = self.types.function(field.clone(), curried);
        }

        let entry = self.symbols.insert(&mut constructor.name, curried)?;

        self.constructors.insert(
            entry.mangled,
            ConstructorInfo {
                tag: entry.slot,
                fields: constructor.fields.clone(),
                owner,
            },
        );
        self.adts.entry(owner).or_default().push(entry.mangled);

        Ok(())
    }

    fn check_let_group(&mut self, group: &mut LetGroup) -> Result<(), SemanticError> {
        for def in group.defs.iter_mut() {
            self.materialize_annotations(def);
        }

        // A recursive group's names are visible inside its own bodies; a
        // plain group checks all bodies against the enclosing scope first
        // and only then binds the new names.
        if group.recursive {
            for def in group.defs.iter_mut() {
                self.declare_definition(def)?;
            }
            for def in group.defs.iter_mut() {
                self.check_definition_body(def)?;
            }
        } else {
            for def in group.defs.iter_mut() {
                self.check_definition_body(def)?;
            }
            for def in group.defs.iter_mut() {
                self.declare_definition(def)?;
            }
        }

        Ok(())
    }

    /// Gives unannotated parameters and return types their unification
    /// cells, once, before either checking phase can observe them
    fn materialize_annotations(&mut self, def: &mut Definition) {
        if let Definition::Value {
            params, return_ty, ..
        } = def
        {
            for param in params.iter_mut() {
                if param.ty.is_none() {
                    param.ty = Some(self.types.fresh_unknown());
                }
            }

            if return_ty.is_none() {
                *return_ty = Some(self.types.fresh_unknown());
            }
        }
    }

    fn declare_definition(&mut self, def: &mut Definition) -> Result<(), SemanticError> {
        match def {
            Definition::Value {
                name,
                params,
                return_ty,
                ..
            } => {
                let ret = return_ty.clone().expect("annotations were materialized");
                self.check_type(&ret)?;

                if self.types.resolve(&ret).is_function() {
                    return Err(SemanticError::FunctionReturnType { name: *name });
                }

                let mut curried = ret;
                for param in params.iter().rev() {
                    let param_ty = param.ty.clone().expect("annotations were materialized");
                    curried = self.types.function(param_ty, curried);
                }

                self.symbols.insert(name, curried)?;
                Ok(())
            }
            Definition::Mutable { name, dims, ty } => {
                self.check_type(ty)?;

                match dims {
                    None => {
                        let reference = self.types.reference(ty.clone());
                        self.symbols.insert(name, reference)?;
                    }
                    Some(dims) => {
                        for dim in dims.iter_mut() {
                            self.check_expression(dim)?;
                            let int = self.types.int();
                            self.expect(dim, &int)?;
                        }

                        let array = self.types.array(dims.len(), ty.clone());
                        self.symbols.insert(name, array)?;
                    }
                }

                Ok(())
            }
        }
    }

    fn check_definition_body(&mut self, def: &mut Definition) -> Result<(), SemanticError> {
        let Definition::Value {
            params,
            return_ty,
            body,
            ..
        } = def
        else {
            return Ok(());
        };

        self.symbols.open_scope();

        for param in params.iter_mut() {
            let ty = param.ty.clone().expect("annotations were materialized");
            self.check_type(&ty)?;
            self.symbols.insert(&mut param.name, ty)?;
        }

        self.check_expression(body)?;
        let ret = return_ty.clone().expect("annotations were materialized");
        self.expect(body, &ret)?;

        self.symbols.close_scope();
        Ok(())
    }

    /// Validates that every `Named` type mentioned in an annotation was
    /// actually declared
    fn check_type(&self, ty: &Type) -> Result<(), SemanticError> {
        match &**ty {
            TypeKind::Function(from, to) => {
                self.check_type(from)?;
                self.check_type(to)
            }
            TypeKind::Reference(inner) => self.check_type(inner),
            TypeKind::Array { element, .. } => self.check_type(element),
            TypeKind::Named(name) => self.typedefs.lookup(*name),
            _ => Ok(()),
        }
    }

    /// Requires `expr` to have type `expected`, reporting a fatal type
    /// mismatch otherwise. The comparison direction matters: an unbound
    /// cell on the expected side grounds to the expression's type.
    fn expect(&mut self, expr: &Expression, expected: &Type) -> Result<(), SemanticError> {
        let actual = expr
            .ty
            .clone()
            .expect("expression is checked before its type is required");

        if !self.types.equals(expected, &actual) {
            return Err(SemanticError::TypeMismatch {
                expression: expr.to_string(),
                expected: self.types.render(expected),
                actual: self.types.render(&actual),
            });
        }

        Ok(())
    }

    fn check_expression(&mut self, expr: &mut Expression) -> Result<(), SemanticError> {
        let ty = match &mut expr.kind {
            ExpressionKind::Unit => self.types.unit(),
            ExpressionKind::Int(_) => self.types.int(),
            ExpressionKind::Float(_) => self.types.float(),
            ExpressionKind::Char(_) => self.types.char(),
            ExpressionKind::Bool(_) => self.types.bool(),
            ExpressionKind::String(_) => {
                let char_ty = self.types.char();
                self.types.array(1, char_ty)
            }
            ExpressionKind::Identifier(name) => {
                let entry = self.symbols.lookup(name)?;

                // A bare function name is not a value; it must be applied
                if self.types.resolve(&entry.ty).is_function() {
                    return Err(SemanticError::ParameterCountMismatch { name: *name });
                }

                entry.ty
            }
            ExpressionKind::Constructor(name) => self.symbols.lookup(name)?.ty,
            ExpressionKind::ArrayIndex { name, indices } => {
                let entry = self.symbols.lookup(name)?;

                let hole = self.types.fresh_unknown();
                let expected = self.types.array(indices.len(), hole);
                if !self.types.equals(&entry.ty, &expected) {
                    return Err(SemanticError::NotAnArray { name: *name });
                }

                for index in indices.iter_mut() {
                    self.check_expression(index)?;
                    let int = self.types.int();
                    self.expect(index, &int)?;
                }

                let element = match &*self.types.resolve(&entry.ty) {
                    TypeKind::Array { element, .. } => element.clone(),
                    _ => unreachable!("entry type was just unified with an array"),
                };
                self.types.reference(element)
            }
            ExpressionKind::Dim { name, index } => {
                let entry = self.symbols.lookup(name)?;

                match &*self.types.resolve(&entry.ty) {
                    TypeKind::Unknown(_) => {}
                    TypeKind::Array { dim, .. } => {
                        if *index < 1 || *index > *dim {
                            return Err(SemanticError::ArrayDimensionMismatch { name: *name });
                        }
                    }
                    _ => return Err(SemanticError::NotAnArray { name: *name }),
                }

                self.types.int()
            }
            ExpressionKind::Call { name, args } => {
                let entry = self.symbols.lookup(name)?;
                let name = *name;
                let mut tmp = entry.ty;

                for arg in args.iter_mut() {
                    self.check_expression(arg)?;

                    // An unknown callee type is grounded as a function one
                    // argument at a time
                    if self.types.resolve(&tmp).is_unknown() {
                        let from = self.types.fresh_unknown();
                        let to = self.types.fresh_unknown();
                        let grounded = self.types.function(from, to);
                        self.types.equals(&tmp, &grounded);
                    }

                    let resolved = self.types.resolve(&tmp);
                    match &*resolved {
                        TypeKind::Function(from, to) => {
                            self.expect(arg, from)?;
                            tmp = to.clone();
                        }
                        _ => return Err(SemanticError::ParameterCountMismatch { name }),
                    }
                }

                // Partial application is not a value
                if self.types.resolve(&tmp).is_function() {
                    return Err(SemanticError::ParameterCountMismatch { name });
                }

                tmp
            }
            ExpressionKind::Unary { operator, operand } => {
                self.check_expression(operand)?;

                match operator {
                    UnaryOperatorKind::Plus | UnaryOperatorKind::Minus => {
                        let int = self.types.int();
                        self.expect(operand, &int)?;
                        int
                    }
                    UnaryOperatorKind::FloatPlus | UnaryOperatorKind::FloatMinus => {
                        let float = self.types.float();
                        self.expect(operand, &float)?;
                        float
                    }
                    UnaryOperatorKind::Not => {
                        let bool_ty = self.types.bool();
                        self.expect(operand, &bool_ty)?;
                        bool_ty
                    }
                    UnaryOperatorKind::Deref => self.expect_reference(operand)?,
                    UnaryOperatorKind::Delete => {
                        self.expect_reference(operand)?;
                        self.types.unit()
                    }
                }
            }
            ExpressionKind::Binary { lhs, operator, rhs } => {
                self.check_expression(lhs)?;
                self.check_expression(rhs)?;

                match operator {
                    BinaryOperatorKind::Add
                    | BinaryOperatorKind::Subtract
                    | BinaryOperatorKind::Multiply
                    | BinaryOperatorKind::Divide
                    | BinaryOperatorKind::Modulus => {
                        let int = self.types.int();
                        self.expect(lhs, &int)?;
                        self.expect(rhs, &int)?;
                        int
                    }
                    BinaryOperatorKind::FloatAdd
                    | BinaryOperatorKind::FloatSubtract
                    | BinaryOperatorKind::FloatMultiply
                    | BinaryOperatorKind::FloatDivide
                    | BinaryOperatorKind::Power => {
                        let float = self.types.float();
                        self.expect(lhs, &float)?;
                        self.expect(rhs, &float)?;
                        float
                    }
                    BinaryOperatorKind::StructuralEquals
                    | BinaryOperatorKind::StructuralNotEquals
                    | BinaryOperatorKind::PhysicalEquals
                    | BinaryOperatorKind::PhysicalNotEquals => {
                        let rhs_ty = rhs.ty.clone().expect("rhs was checked");
                        self.expect(lhs, &rhs_ty)?;

                        let lhs_ty = lhs.ty.clone().expect("lhs was checked");
                        if matches!(
                            &*self.types.resolve(&lhs_ty),
                            TypeKind::Array { .. } | TypeKind::Function(..)
                        ) {
                            return Err(SemanticError::ComparisonNotAllowed {
                                operator: operator.to_string(),
                                operand_ty: self.types.render(&lhs_ty),
                            });
                        }

                        self.types.bool()
                    }
                    BinaryOperatorKind::LessThan
                    | BinaryOperatorKind::GreaterThan
                    | BinaryOperatorKind::LessThanOrEqualTo
                    | BinaryOperatorKind::GreaterThanOrEqualTo => {
                        let rhs_ty = rhs.ty.clone().expect("rhs was checked");
                        self.expect(lhs, &rhs_ty)?;

                        let lhs_ty = lhs.ty.clone().expect("lhs was checked");
                        match &*self.types.resolve(&lhs_ty) {
                            TypeKind::Int
                            | TypeKind::Float
                            | TypeKind::Char
                            | TypeKind::Unknown(_) => {}
                            _ => {
                                return Err(SemanticError::ComparisonNotAllowed {
                                    operator: operator.to_string(),
                                    operand_ty: self.types.render(&lhs_ty),
                                });
                            }
                        }

                        self.types.bool()
                    }
                    BinaryOperatorKind::LogicalAnd | BinaryOperatorKind::LogicalOr => {
                        let bool_ty = self.types.bool();
                        self.expect(lhs, &bool_ty)?;
                        self.expect(rhs, &bool_ty)?;
                        bool_ty
                    }
                    BinaryOperatorKind::Assign => {
                        let rhs_ty = rhs.ty.clone().expect("rhs was checked");
                        let expected = self.types.reference(rhs_ty);
                        self.expect(lhs, &expected)?;
                        self.types.unit()
                    }
                    BinaryOperatorKind::Sequence => rhs.ty.clone().expect("rhs was checked"),
                }
            }
            ExpressionKind::If {
                condition,
                positive,
                negative,
            } => {
                self.check_expression(condition)?;
                let bool_ty = self.types.bool();
                self.expect(condition, &bool_ty)?;

                self.check_expression(positive)?;

                match negative {
                    Some(negative) => {
                        self.check_expression(negative)?;
                        let negative_ty = negative.ty.clone().expect("negative was checked");
                        self.expect(positive, &negative_ty)?;
                    }
                    None => {
                        let unit = self.types.unit();
                        self.expect(positive, &unit)?;
                    }
                }

                positive.ty.clone().expect("positive was checked")
            }
            ExpressionKind::While { condition, body } => {
                self.check_expression(condition)?;
                let bool_ty = self.types.bool();
                self.expect(condition, &bool_ty)?;

                self.check_expression(body)?;
                self.types.unit()
            }
            ExpressionKind::For {
                counter,
                start,
                end,
                body,
                ..
            } => {
                self.check_expression(start)?;
                let int = self.types.int();
                self.expect(start, &int)?;

                self.check_expression(end)?;
                self.expect(end, &int)?;

                self.symbols.open_scope();
                self.symbols.insert(counter, int)?;
                self.check_expression(body)?;
                self.symbols.close_scope();

                self.types.unit()
            }
            ExpressionKind::Match { scrutinee, clauses } => {
                self.check_expression(scrutinee)?;

                let result = self.types.fresh_unknown();

                for clause in clauses.iter_mut() {
                    self.symbols.open_scope();

                    self.check_pattern(&mut clause.pattern)?;
                    self.check_expression(&mut clause.body)?;

                    let pattern_ty = clause.pattern.ty.clone().expect("pattern was checked");
                    self.expect(scrutinee, &pattern_ty)?;
                    self.expect(&clause.body, &result)?;

                    self.symbols.close_scope();
                }

                clauses
                    .first()
                    .and_then(|clause| clause.body.ty.clone())
                    .unwrap_or(result)
            }
            ExpressionKind::New(ty) => {
                if matches!(&**ty, TypeKind::Array { .. }) {
                    return Err(SemanticError::ReferenceOfArrayType);
                }

                self.check_type(ty)?;
                self.types.reference(ty.clone())
            }
            ExpressionKind::LetIn { group, body } => {
                self.symbols.open_scope();
                self.check_let_group(group)?;
                self.check_expression(body)?;
                self.symbols.close_scope();

                body.ty.clone().expect("body was checked")
            }
        };

        expr.ty = Some(ty);
        Ok(())
    }

    /// Requires `operand` to be a reference, grounding an unknown operand
    /// type to a reference of a fresh cell, and returns the pointee type
    fn expect_reference(&mut self, operand: &Expression) -> Result<Type, SemanticError> {
        let operand_ty = operand.ty.clone().expect("operand was checked");

        if self.types.resolve(&operand_ty).is_unknown() {
            let hole = self.types.fresh_unknown();
            let expected = self.types.reference(hole);
            self.expect(operand, &expected)?;
        }

        match &*self.types.resolve(&operand_ty) {
            TypeKind::Reference(inner) => Ok(inner.clone()),
            _ => Err(SemanticError::TypeMismatch {
                expression: operand.to_string(),
                expected: "a reference".to_string(),
                actual: self.types.render(&operand_ty),
            }),
        }
    }

    fn check_pattern(&mut self, pattern: &mut Pattern) -> Result<(), SemanticError> {
        let ty = match &mut pattern.kind {
            PatternKind::Int(_) => self.types.int(),
            PatternKind::Float(_) => self.types.float(),
            PatternKind::Char(_) => self.types.char(),
            PatternKind::Bool(_) => self.types.bool(),
            PatternKind::Binding(name) => {
                // The binder's type is discovered from the scrutinee; it
                // occupies a fresh slot scoped to its clause
                let cell = self.types.fresh_unknown();
                self.symbols.insert(name, cell.clone())?;
                cell
            }
            PatternKind::Constructor { name, fields } => {
                let entry = self.symbols.lookup(name)?;
                let name = *name;
                let mut tmp = entry.ty;

                for field in fields.iter_mut() {
                    self.check_pattern(field)?;

                    let resolved = self.types.resolve(&tmp);
                    match &*resolved {
                        TypeKind::Function(from, to) => {
                            let field_ty = field.ty.clone().expect("field pattern was checked");
                            if !self.types.equals(&field_ty, from) {
                                return Err(SemanticError::TypeMismatch {
                                    expression: field.to_string(),
                                    expected: self.types.render(from),
                                    actual: self.types.render(&field_ty),
                                });
                            }
                            tmp = to.clone();
                        }
                        _ => return Err(SemanticError::ParameterCountMismatch { name }),
                    }
                }

                if self.types.resolve(&tmp).is_function() {
                    return Err(SemanticError::ParameterCountMismatch { name });
                }

                tmp
            }
        };

        pattern.ty = Some(ty);
        Ok(())
    }
}
