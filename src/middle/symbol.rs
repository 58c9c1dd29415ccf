//! The scoped symbol table.
//!
//! Every binding in the language ends up in process-wide storage rather
//! than a stack frame, so each successful insertion assigns the binding a
//! numeric slot and rewrites its identifier in place to the storage name
//! `{name}_{slot}`. Slot counters are seeded from the enclosing scope when
//! a scope opens and are discarded when it closes: slot numbers strictly
//! increase along a nesting path and are reused across sibling scopes,
//! which can never alias live storage.

use hashbrown::{HashMap, HashSet};

use crate::{
    frontend::intern::InternedSymbol,
    middle::{error::SemanticError, ty::Type},
};

#[derive(Debug, Clone)]
pub struct SymbolEntry {
    pub ty: Type,
    pub slot: usize,
    /// The unique storage name assigned at insertion
    pub mangled: InternedSymbol,
}

#[derive(Debug)]
struct Scope {
    locals: HashMap<InternedSymbol, SymbolEntry>,
    /// The next slot to assign, seeded from the parent at open time
    counter: usize,
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_scope(&mut self) {
        let counter = self.scopes.last().map(|s| s.counter).unwrap_or(0);
        self.scopes.push(Scope {
            locals: HashMap::new(),
            counter,
        });
    }

    /// Drops the current scope. The parent keeps the counter value it had
    /// before the child opened, so sibling scopes reuse slot numbers.
    pub fn close_scope(&mut self) {
        self.scopes
            .pop()
            .expect("close_scope called with no open scope");
    }

    /// Binds `name` in the current scope, assigns it the next slot, and
    /// rewrites `name` to its unique storage form. Shadowing an outer
    /// scope is legal; redeclaring within the current scope is fatal.
    pub fn insert(
        &mut self,
        name: &mut InternedSymbol,
        ty: Type,
    ) -> Result<SymbolEntry, SemanticError> {
        let scope = self
            .scopes
            .last_mut()
            .expect("insert called with no open scope");

        if scope.locals.contains_key(name) {
            return Err(SemanticError::RedeclaredIdentifier { name: *name });
        }

        let slot = scope.counter;
        scope.counter += 1;

        let entry = SymbolEntry {
            ty,
            slot,
            mangled: name.mangled(slot),
        };
        scope.locals.insert(*name, entry.clone());

        *name = entry.mangled;
        Ok(entry)
    }

    /// Finds `name` innermost-to-outermost and rewrites it to the storage
    /// name recorded at insertion. A total miss is fatal.
    pub fn lookup(&self, name: &mut InternedSymbol) -> Result<SymbolEntry, SemanticError> {
        for scope in self.scopes.iter().rev() {
            if let Some(entry) = scope.locals.get(name) {
                *name = entry.mangled;
                return Ok(entry.clone());
            }
        }

        Err(SemanticError::UnknownIdentifier { name: *name })
    }
}

/// The set of declared algebraic type names
#[derive(Debug, Default)]
pub struct TypeDefTable {
    types: HashSet<InternedSymbol>,
}

impl TypeDefTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: InternedSymbol) -> Result<(), SemanticError> {
        if !self.types.insert(name) {
            return Err(SemanticError::RedeclaredIdentifier { name });
        }
        Ok(())
    }

    pub fn lookup(&self, name: InternedSymbol) -> Result<(), SemanticError> {
        if !self.types.contains(&name) {
            return Err(SemanticError::UnknownIdentifier { name });
        }
        Ok(())
    }
}
