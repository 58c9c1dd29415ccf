//! Lowers the checked AST into an LIR module.
//!
//! By the time this pass runs, every identifier in the AST has been
//! rewritten to its unique storage name and every expression node carries
//! its type, so lowering never fails: it is a straight-line translation
//! of each construct into blocks and instructions.
//!
//! Two pieces carry most of the weight here. Storage slots: every source
//! binding (including function parameters and loop counters) becomes a
//! module-wide global slot rather than a stack location, and the builder
//! keeps a log of the slots each in-progress function body creates so
//! that the function can be given its save/restore bracket. Insertion
//! cursor: a definition group nested in an expression switches emission
//! into a freshly declared function and back, so the builder tracks an
//! explicit (function, block) insertion point the way an IR builder
//! would.

use std::rc::Rc;

use hashbrown::{HashMap, HashSet};
use strum::IntoEnumIterator;

use crate::{
    frontend::{
        ast::{
            BinaryOperatorKind, Clause, ConstructorDefinition, Definition, Expression,
            ExpressionKind, LetGroup, Pattern, PatternKind, Program, Statement, TypeDefinition,
            UnaryOperatorKind,
        },
        intern::InternedSymbol,
    },
    index::IndexVec,
    middle::{
        error::CompileError,
        lir::{
            self, BinaryOp, Block, BlockId, FunctionDefinition, FunctionId, GlobalId, GlobalSlot,
            Immediate, Instruction, Operand, Register, RegisterId, StaticData, Struct, UnaryOp,
        },
        runtime::RuntimePrimitive,
        ty::{self, TypeKind},
        type_check::ModuleCheckResults,
    },
};

/// The fixed diagnostic the compiled program prints before exiting when
/// no pattern clause matches
pub const NO_MATCH_MESSAGE: &str = "Runtime Error: No matching pattern found\n";

/// Lowers a checked program into a verified LIR module. The result is a
/// `main` function holding the top-level statements plus one function per
/// user definition and constructor.
pub fn lower_program(
    program: &Program,
    results: &ModuleCheckResults,
) -> Result<lir::Module, CompileError> {
    let mut builder = ModuleBuilder::new(results);

    builder.declare_runtime();

    let main = builder.declare_function(InternedSymbol::new("main"), Vec::new(), lir::Type::I64);
    builder.enter_function(main);

    for statement in &program.statements {
        builder.lower_statement(statement);
    }

    builder.push(Instruction::Return {
        value: Some(Operand::Immediate(Immediate::Int(0))),
    });

    let module = builder.finish();

    if let Err(reason) = super::verify::verify_module(&module) {
        return Err(CompileError::MalformedModule {
            reason,
            module: super::pretty_print::render_plain(&module),
        });
    }

    Ok(module)
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    function: FunctionId,
    block: BlockId,
}

/// What [`ModuleBuilder::declare_definition`] produced for one
/// definition, consumed positionally by the body-lowering phase
enum DeclaredDef {
    Constant { global: GlobalId },
    Function { id: FunctionId, param_globals: Vec<GlobalId> },
    Mutable,
}

struct ModuleBuilder<'check> {
    results: &'check ModuleCheckResults,

    externals: Vec<lir::ExternalFunction>,
    external_names: HashSet<InternedSymbol>,
    globals: IndexVec<GlobalId, GlobalSlot>,
    statics: IndexVec<lir::StaticId, StaticData>,
    functions: IndexVec<FunctionId, FunctionDefinition>,

    /// Storage name -> the slot it currently denotes. Sibling scopes may
    /// reuse a slot number after the first holder dies, so this tracks
    /// the latest creation; display names stay unique via a suffix.
    global_scope: HashMap<InternedSymbol, GlobalId>,
    function_scope: HashMap<InternedSymbol, FunctionId>,
    name_uses: HashMap<InternedSymbol, usize>,

    cursor: Option<Cursor>,
    /// One log per function body currently being lowered. Every slot
    /// created while a body is open lands in its log (and in the logs of
    /// all enclosing bodies), which is exactly the save set of its
    /// activation bracket.
    save_logs: Vec<Vec<GlobalId>>,
}

impl<'check> ModuleBuilder<'check> {
    fn new(results: &'check ModuleCheckResults) -> Self {
        Self {
            results,
            externals: Vec::new(),
            external_names: HashSet::new(),
            globals: IndexVec::new(),
            statics: IndexVec::new(),
            functions: IndexVec::new(),
            global_scope: HashMap::new(),
            function_scope: HashMap::new(),
            name_uses: HashMap::new(),
            cursor: None,
            save_logs: Vec::new(),
        }
    }

    /* Declarations */

    /// Declares every runtime primitive under the storage name checking
    /// registered it with, plus the allocation, process-exit, and float
    /// power externals that generated code references directly.
    fn declare_runtime(&mut self) {
        for primitive in RuntimePrimitive::iter() {
            let binding = self.results.runtime[&primitive].clone();
            let (params, return_ty) = self.flatten_signature(&binding.ty);
            self.externals.push(lir::ExternalFunction {
                name: binding.name,
                params,
                return_ty,
            });
            self.external_names.insert(binding.name);
        }

        let direct: [(&str, Vec<lir::Type>, lir::Type); 4] = [
            ("malloc", vec![lir::Type::I64], lir::Type::Ptr),
            ("free", vec![lir::Type::Ptr], lir::Type::Unit),
            ("exit", vec![lir::Type::I64], lir::Type::Unit),
            ("pow", vec![lir::Type::F64, lir::Type::F64], lir::Type::F64),
        ];
        for (name, params, return_ty) in direct {
            let name = InternedSymbol::new(name);
            self.externals.push(lir::ExternalFunction {
                name,
                params,
                return_ty,
            });
            self.external_names.insert(name);
        }
    }

    fn unique_name(&mut self, name: InternedSymbol) -> InternedSymbol {
        let count = self.name_uses.entry(name).or_insert(0);
        *count += 1;

        if *count == 1 {
            name
        } else {
            InternedSymbol::new(&format!("{}.{}", name, *count - 1))
        }
    }

    fn define_global(&mut self, name: InternedSymbol, ty: lir::Type) -> GlobalId {
        let display = self.unique_name(name);
        let id = self.globals.push(GlobalSlot { name: display, ty });

        self.global_scope.insert(name, id);
        for log in self.save_logs.iter_mut() {
            log.push(id);
        }

        id
    }

    fn declare_function(
        &mut self,
        name: InternedSymbol,
        params: Vec<lir::Type>,
        return_ty: lir::Type,
    ) -> FunctionId {
        let display = self.unique_name(name);

        let mut registers = IndexVec::new();
        let params = params
            .into_iter()
            .map(|ty| {
                let id = registers.next_index();
                registers.push(Register { id, ty })
            })
            .collect();

        let id = self.functions.push(FunctionDefinition {
            name: display,
            params,
            return_ty,
            registers,
            blocks: IndexVec::new(),
        });
        self.function_scope.insert(name, id);

        id
    }

    /* Cursor management */

    fn create_block_in(&mut self, function: FunctionId) -> BlockId {
        let blocks = &mut self.functions[function].blocks;
        let id = blocks.next_index();
        blocks.push(Block {
            id,
            instructions: Vec::new(),
            predecessors: Default::default(),
        })
    }

    /// Creates the function's entry block and moves the insertion point
    /// there
    fn enter_function(&mut self, function: FunctionId) -> BlockId {
        let block = self.create_block_in(function);
        self.cursor = Some(Cursor { function, block });
        block
    }

    fn create_block(&mut self) -> BlockId {
        let function = self.cursor.expect("no insertion point").function;
        self.create_block_in(function)
    }

    fn set_block(&mut self, block: BlockId) {
        let cursor = self.cursor.as_mut().expect("no insertion point");
        cursor.block = block;
    }

    fn current_block(&self) -> BlockId {
        self.cursor.expect("no insertion point").block
    }

    fn create_register(&mut self, ty: lir::Type) -> RegisterId {
        let function = self.cursor.expect("no insertion point").function;
        let registers = &mut self.functions[function].registers;
        let id = registers.next_index();
        registers.push(Register { id, ty })
    }

    /// Appends an instruction at the insertion point, recording
    /// predecessor edges for the branch terminators
    fn push(&mut self, instruction: Instruction) {
        let cursor = self.cursor.expect("no insertion point");
        let blocks = &mut self.functions[cursor.function].blocks;

        match &instruction {
            Instruction::Jump { destination } => {
                blocks[*destination].predecessors.insert(cursor.block);
            }
            Instruction::Branch {
                positive, negative, ..
            } => {
                blocks[*positive].predecessors.insert(cursor.block);
                blocks[*negative].predecessors.insert(cursor.block);
            }
            _ => {}
        }

        blocks[cursor.block].instructions.push(instruction);
    }

    /* Type plumbing */

    fn lower_ty(&self, ty: &ty::Type) -> lir::Type {
        match &*self.results.types.resolve(ty) {
            TypeKind::Unit => lir::Type::Unit,
            TypeKind::Int => lir::Type::I64,
            TypeKind::Float => lir::Type::F64,
            TypeKind::Char => lir::Type::I8,
            TypeKind::Bool => lir::Type::I1,
            TypeKind::Function(..)
            | TypeKind::Reference(_)
            | TypeKind::Array { .. }
            | TypeKind::Named(_) => lir::Type::Ptr,
            // A cell nothing ever grounded: any word-sized storage works
            TypeKind::Unknown(_) => lir::Type::I64,
        }
    }

    /// Uncurries a function type into the flat parameter list and return
    /// type its procedure is declared with
    fn flatten_signature(&self, ty: &ty::Type) -> (Vec<lir::Type>, lir::Type) {
        let mut params = Vec::new();
        let mut current = self.results.types.resolve(ty);

        loop {
            let resolved = current.clone();
            match &*resolved {
                TypeKind::Function(from, to) => {
                    params.push(self.lower_ty(from));
                    current = self.results.types.resolve(to);
                }
                _ => break,
            }
        }

        (params, self.lower_ty(&current))
    }

    fn expression_ty<'a>(&self, expr: &'a Expression) -> &'a ty::Type {
        expr.ty
            .as_ref()
            .expect("expression was typed by the checking pass")
    }

    /* Small emission helpers */

    fn global_address(&self, global: GlobalId) -> Operand {
        Operand::Immediate(Immediate::GlobalLabel(self.globals[global].name))
    }

    fn function_label(&self, name: InternedSymbol) -> Operand {
        let id = self
            .function_scope
            .get(&name)
            .copied()
            .expect("function is declared before it is referenced");
        Operand::Immediate(Immediate::FunctionLabel(self.functions[id].name))
    }

    fn emit_binary(&mut self, operator: BinaryOp, ty: lir::Type, lhs: Operand, rhs: Operand) -> Operand {
        let destination = self.create_register(ty);
        self.push(Instruction::BinaryOperation {
            operator,
            destination,
            lhs,
            rhs,
        });
        Operand::Register(destination)
    }

    fn emit_load(&mut self, ty: lir::Type, address: Operand) -> Operand {
        let destination = self.create_register(ty);
        self.push(Instruction::LoadMem {
            destination,
            address,
        });
        Operand::Register(destination)
    }

    fn emit_malloc(&mut self, size: Operand) -> Operand {
        let destination = self.create_register(lir::Type::Ptr);
        self.push(Instruction::Call {
            target: Operand::Immediate(Immediate::FunctionLabel(InternedSymbol::new("malloc"))),
            arguments: vec![size],
            destination: Some(destination),
        });
        Operand::Register(destination)
    }

    fn emit_free(&mut self, pointer: Operand) {
        self.push(Instruction::Call {
            target: Operand::Immediate(Immediate::FunctionLabel(InternedSymbol::new("free"))),
            arguments: vec![pointer],
            destination: None,
        });
    }

    /// Interns the bytes of a string literal (8 byte length prefix, the
    /// characters, a trailing NUL) and yields a pointer to the first
    /// character
    fn emit_string_literal(&mut self, value: &str) -> Operand {
        let mut bytes = (value.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);

        let id = self.statics.push(StaticData { bytes });

        let destination = self.create_register(lir::Type::Ptr);
        self.push(Instruction::GetArrayElementPointer {
            destination,
            source: Operand::Immediate(Immediate::StaticLabel(id)),
            ty: lir::Type::I8,
            index: Operand::Immediate(Immediate::Int(8)),
        });
        Operand::Register(destination)
    }

    /* Statements and definitions */

    fn lower_statement(&mut self, statement: &Statement) {
        match statement {
            Statement::Types(defs) => {
                // Declare every dispatch comparator first so constructors
                // of mutually recursive types can reference each other
                for def in defs {
                    let name = InternedSymbol::new(&format!("{}_cmp", def.name));
                    self.declare_function(
                        name,
                        vec![lir::Type::Ptr, lir::Type::Ptr],
                        lir::Type::I1,
                    );
                }

                for def in defs {
                    self.lower_type_definition(def);
                }
            }
            Statement::Let(group) => self.lower_let_group(group),
        }
    }

    fn lower_let_group(&mut self, group: &LetGroup) {
        let declared: Vec<DeclaredDef> = group
            .defs
            .iter()
            .map(|def| self.declare_definition(def))
            .collect();

        for (def, info) in group.defs.iter().zip(declared) {
            self.lower_definition_body(def, info);
        }
    }

    fn declare_definition(&mut self, def: &Definition) -> DeclaredDef {
        match def {
            Definition::Value {
                name,
                params,
                return_ty,
                ..
            } => {
                let return_ty = return_ty.as_ref().expect("annotations were materialized");

                if params.is_empty() {
                    let ty = self.lower_ty(return_ty);
                    let global = self.define_global(*name, ty);
                    DeclaredDef::Constant { global }
                } else {
                    let mut param_globals = Vec::new();
                    let mut param_tys = Vec::new();

                    for param in params {
                        let ty =
                            self.lower_ty(param.ty.as_ref().expect("annotations were materialized"));
                        param_tys.push(ty.clone());
                        param_globals.push(self.define_global(param.name, ty));
                    }

                    let ret = self.lower_ty(return_ty);
                    let id = self.declare_function(*name, param_tys, ret);

                    DeclaredDef::Function { id, param_globals }
                }
            }
            Definition::Mutable { name, dims, ty } => {
                self.lower_mutable_definition(*name, dims.as_deref(), ty);
                DeclaredDef::Mutable
            }
        }
    }

    /// A mutable definition allocates its storage at the definition site:
    /// a scalar gets a heap cell, an array gets one flat row-major
    /// allocation preceded by a header word per declared dimension.
    fn lower_mutable_definition(
        &mut self,
        name: InternedSymbol,
        dims: Option<&[Expression]>,
        ty: &ty::Type,
    ) {
        let element_ty = self.lower_ty(ty);
        let global = self.define_global(name, lir::Type::Ptr);

        match dims {
            None => {
                let size = Operand::Immediate(Immediate::Int(element_ty.size() as i64));
                let alloc = self.emit_malloc(size);
                self.push(Instruction::StoreMem {
                    address: self.global_address(global),
                    source: alloc,
                });
            }
            Some(dims) => {
                let mut size = Operand::Immediate(Immediate::Int(element_ty.size() as i64));
                let mut extents = Vec::new();

                for dim in dims {
                    let value = self.lower_expression(dim);
                    extents.push(value.clone());
                    size = self.emit_binary(BinaryOp::Mul, lir::Type::I64, size, value);
                }

                let header = Operand::Immediate(Immediate::Int(8 * dims.len() as i64));
                size = self.emit_binary(BinaryOp::Add, lir::Type::I64, size, header);

                let alloc = self.emit_malloc(size);

                // Data pointer sits after the header; extent k lives at
                // word -k relative to it
                let data = self.create_register(lir::Type::Ptr);
                self.push(Instruction::GetArrayElementPointer {
                    destination: data,
                    source: alloc,
                    ty: lir::Type::I64,
                    index: Operand::Immediate(Immediate::Int(dims.len() as i64)),
                });

                for (i, extent) in extents.into_iter().enumerate() {
                    let slot = self.create_register(lir::Type::Ptr);
                    self.push(Instruction::GetArrayElementPointer {
                        destination: slot,
                        source: Operand::Register(data),
                        ty: lir::Type::I64,
                        index: Operand::Immediate(Immediate::Int(-(i as i64 + 1))),
                    });
                    self.push(Instruction::StoreMem {
                        address: Operand::Register(slot),
                        source: extent,
                    });
                }

                self.push(Instruction::StoreMem {
                    address: self.global_address(global),
                    source: Operand::Register(data),
                });
            }
        }
    }

    fn lower_definition_body(&mut self, def: &Definition, info: DeclaredDef) {
        match (def, info) {
            (Definition::Value { body, .. }, DeclaredDef::Constant { global }) => {
                let value = self.lower_expression(body);
                self.push(Instruction::StoreMem {
                    address: self.global_address(global),
                    source: value,
                });
            }
            (Definition::Value { body, .. }, DeclaredDef::Function { id, param_globals }) => {
                self.lower_function_body(id, &param_globals, body);
            }
            (Definition::Mutable { .. }, _) => {}
            (Definition::Value { .. }, DeclaredDef::Mutable) => {
                unreachable!("declaration results are consumed positionally")
            }
        }
    }

    /// Emits a parameter-taking function as the head/body/tail bracket
    /// that makes recursion safe under global-slot storage.
    ///
    /// The head block (the entry) snapshots into a heap-allocated backup
    /// record every slot this activation will write: the parameter slots
    /// plus every slot created while lowering the body (locals, loop
    /// counters, pattern binders, nested definitions). The body block
    /// then stores the incoming arguments and evaluates; the tail block
    /// restores every saved slot, frees the backup, and returns. Slots
    /// that already existed outside this function are deliberately not
    /// saved: writes to enclosing bindings must survive the call.
    fn lower_function_body(
        &mut self,
        function: FunctionId,
        param_globals: &[GlobalId],
        body: &Expression,
    ) {
        let saved_cursor = self.cursor;

        let head = self.create_block_in(function);
        let body_block = self.create_block_in(function);
        let tail = self.create_block_in(function);

        self.cursor = Some(Cursor {
            function,
            block: body_block,
        });

        let params = self.functions[function].params.clone();
        for (param, global) in params.iter().zip(param_globals) {
            self.push(Instruction::StoreMem {
                address: self.global_address(*global),
                source: Operand::Register(*param),
            });
        }

        self.save_logs.push(Vec::new());
        let value = self.lower_expression(body);
        let body_slots = self.save_logs.pop().expect("log was pushed above");

        self.push(Instruction::Jump { destination: tail });

        let mut save_set: Vec<GlobalId> = param_globals.to_vec();
        for slot in body_slots {
            if !save_set.contains(&slot) {
                save_set.push(slot);
            }
        }

        // Head: snapshot every slot into the backup record
        self.set_block(head);
        let backup = self.emit_malloc(Operand::Immediate(Immediate::Int(
            8 * save_set.len() as i64,
        )));
        for (i, global) in save_set.iter().enumerate() {
            let ty = self.globals[*global].ty.clone();
            let value = self.emit_load(ty, self.global_address(*global));
            let slot = self.create_register(lir::Type::Ptr);
            self.push(Instruction::GetArrayElementPointer {
                destination: slot,
                source: backup.clone(),
                ty: lir::Type::I64,
                index: Operand::Immediate(Immediate::Int(i as i64)),
            });
            self.push(Instruction::StoreMem {
                address: Operand::Register(slot),
                source: value,
            });
        }
        self.push(Instruction::Jump {
            destination: body_block,
        });

        // Tail: restore in the save order, release the record, return
        self.set_block(tail);
        for (i, global) in save_set.iter().enumerate() {
            let slot = self.create_register(lir::Type::Ptr);
            self.push(Instruction::GetArrayElementPointer {
                destination: slot,
                source: backup.clone(),
                ty: lir::Type::I64,
                index: Operand::Immediate(Immediate::Int(i as i64)),
            });
            let ty = self.globals[*global].ty.clone();
            let value = self.emit_load(ty, Operand::Register(slot));
            self.push(Instruction::StoreMem {
                address: self.global_address(*global),
                source: value,
            });
        }
        self.emit_free(backup);
        self.push(Instruction::Return { value: Some(value) });

        self.cursor = saved_cursor;
    }

    /* Algebraic types */

    fn lower_type_definition(&mut self, def: &TypeDefinition) {
        let saved_cursor = self.cursor;

        let dispatch_name = InternedSymbol::new(&format!("{}_cmp", def.name));
        let dispatch = self
            .function_scope
            .get(&dispatch_name)
            .copied()
            .expect("dispatch comparator was declared");

        let head = self.create_block_in(dispatch);
        let chain = self.create_block_in(dispatch);
        let merge = self.create_block_in(dispatch);

        let (lhs, rhs) = {
            let params = &self.functions[dispatch].params;
            (params[0], params[1])
        };

        self.cursor = Some(Cursor {
            function: dispatch,
            block: chain,
        });

        // One trial per constructor: matching tags route to that
        // constructor's own comparator
        let mut incomings = Vec::new();
        for constructor in &def.constructors {
            self.lower_constructor(constructor);

            let info = &self.results.constructors[&constructor.name];
            let tag = info.tag as i64;

            let positive = self.create_block();
            let negative = self.create_block();

            let observed = self.emit_load(lir::Type::I64, Operand::Register(lhs));
            let matches = self.emit_binary(
                BinaryOp::IcmpEq,
                lir::Type::I1,
                observed,
                Operand::Immediate(Immediate::Int(tag)),
            );
            self.push(Instruction::Branch {
                condition: matches,
                positive,
                negative,
            });

            self.set_block(positive);
            let comparator = InternedSymbol::new(&format!("{}_cmp", constructor.name));
            let target = self.function_label(comparator);
            let result = self.create_register(lir::Type::I1);
            self.push(Instruction::Call {
                target,
                arguments: vec![Operand::Register(lhs), Operand::Register(rhs)],
                destination: Some(result),
            });
            incomings.push((positive, Operand::Register(result)));
            self.push(Instruction::Jump { destination: merge });

            self.set_block(negative);
        }

        // Unknown or mismatched tag: unequal
        let fallback = self.current_block();
        incomings.push((fallback, Operand::Immediate(Immediate::Bool(false))));
        self.push(Instruction::Jump { destination: merge });

        // Entry: the two operands must carry the same tag at all
        self.set_block(head);
        let left_tag = self.emit_load(lir::Type::I64, Operand::Register(lhs));
        let right_tag = self.emit_load(lir::Type::I64, Operand::Register(rhs));
        let same = self.emit_binary(BinaryOp::IcmpEq, lir::Type::I1, left_tag, right_tag);
        self.push(Instruction::Branch {
            condition: same,
            positive: chain,
            negative: fallback,
        });

        self.set_block(merge);
        let result = self.create_register(lir::Type::I1);
        self.push(Instruction::Phi {
            destination: result,
            sources: incomings,
        });
        self.push(Instruction::Return {
            value: Some(Operand::Register(result)),
        });

        self.cursor = saved_cursor;
    }

    fn record_layout(&self, fields: &[ty::Type]) -> Struct {
        let mut layout = vec![lir::Type::I64];
        layout.extend(fields.iter().map(|f| self.lower_ty(f)));
        Struct(Rc::from(layout))
    }

    /// Emits the two procedures behind one constructor: the allocator
    /// that builds the tagged record, and the structural comparator for
    /// records carrying this constructor's tag.
    fn lower_constructor(&mut self, constructor: &ConstructorDefinition) {
        let saved_cursor = self.cursor;

        let info = self.results.constructors[&constructor.name].clone();
        let layout = self.record_layout(&info.fields);
        let field_tys: Vec<lir::Type> = info.fields.iter().map(|f| self.lower_ty(f)).collect();

        /* Allocating constructor */

        let allocator = self.declare_function(constructor.name, field_tys, lir::Type::Ptr);
        self.enter_function(allocator);

        let size = Operand::Immediate(Immediate::Int(layout.size() as i64));
        let record = self.emit_malloc(size);

        let tag_slot = self.create_register(lir::Type::Ptr);
        self.push(Instruction::GetStructElementPointer {
            destination: tag_slot,
            source: record.clone(),
            ty: layout.clone(),
            index: 0,
        });
        self.push(Instruction::StoreMem {
            address: Operand::Register(tag_slot),
            source: Operand::Immediate(Immediate::Int(info.tag as i64)),
        });

        let params = self.functions[allocator].params.clone();
        for (i, param) in params.iter().enumerate() {
            let field_slot = self.create_register(lir::Type::Ptr);
            self.push(Instruction::GetStructElementPointer {
                destination: field_slot,
                source: record.clone(),
                ty: layout.clone(),
                index: i + 1,
            });
            self.push(Instruction::StoreMem {
                address: Operand::Register(field_slot),
                source: Operand::Register(*param),
            });
        }

        self.push(Instruction::Return {
            value: Some(record),
        });

        /* Structural comparator */

        let comparator_name = InternedSymbol::new(&format!("{}_cmp", constructor.name));
        let comparator = self.declare_function(
            comparator_name,
            vec![lir::Type::Ptr, lir::Type::Ptr],
            lir::Type::I1,
        );
        self.enter_function(comparator);

        let (lhs_record, rhs_record) = {
            let params = &self.functions[comparator].params;
            (params[0], params[1])
        };

        let mut condition = Operand::Immediate(Immediate::Bool(true));

        for (i, field) in info.fields.iter().enumerate() {
            let field_ty = self.lower_ty(field);

            let lhs_slot = self.create_register(lir::Type::Ptr);
            self.push(Instruction::GetStructElementPointer {
                destination: lhs_slot,
                source: Operand::Register(lhs_record),
                ty: layout.clone(),
                index: i + 1,
            });
            let mut lhs = self.emit_load(field_ty.clone(), Operand::Register(lhs_slot));

            let rhs_slot = self.create_register(lir::Type::Ptr);
            self.push(Instruction::GetStructElementPointer {
                destination: rhs_slot,
                source: Operand::Register(rhs_record),
                ty: layout.clone(),
                index: i + 1,
            });
            let mut rhs = self.emit_load(field_ty, Operand::Register(rhs_slot));

            // Reference fields compare by pointee
            let mut source_ty = self.results.types.resolve(field);
            loop {
                let resolved = source_ty.clone();
                match &*resolved {
                    TypeKind::Reference(inner) => {
                        let inner_ty = self.lower_ty(inner);
                        lhs = self.emit_load(inner_ty.clone(), lhs);
                        rhs = self.emit_load(inner_ty, rhs);
                        source_ty = self.results.types.resolve(inner);
                    }
                    _ => break,
                }
            }

            let piece = match &*source_ty {
                TypeKind::Unit => None,
                TypeKind::Float => {
                    Some(self.emit_binary(BinaryOp::FcmpEq, lir::Type::I1, lhs, rhs))
                }
                TypeKind::Named(owner) => {
                    let dispatch = InternedSymbol::new(&format!("{owner}_cmp"));
                    let target = self.function_label(dispatch);
                    let result = self.create_register(lir::Type::I1);
                    self.push(Instruction::Call {
                        target,
                        arguments: vec![lhs, rhs],
                        destination: Some(result),
                    });
                    Some(Operand::Register(result))
                }
                _ => Some(self.emit_binary(BinaryOp::IcmpEq, lir::Type::I1, lhs, rhs)),
            };

            if let Some(piece) = piece {
                condition = self.emit_binary(BinaryOp::And, lir::Type::I1, condition, piece);
            }
        }

        self.push(Instruction::Return {
            value: Some(condition),
        });

        self.cursor = saved_cursor;
    }

    /* Expressions */

    fn lower_expression(&mut self, expr: &Expression) -> Operand {
        match &expr.kind {
            ExpressionKind::Unit => Operand::Immediate(Immediate::Unit),
            ExpressionKind::Int(n) => Operand::Immediate(Immediate::Int(*n)),
            ExpressionKind::Float(x) => Operand::Immediate(Immediate::Float(*x)),
            ExpressionKind::Char(c) => Operand::Immediate(Immediate::Char(*c)),
            ExpressionKind::Bool(b) => Operand::Immediate(Immediate::Bool(*b)),
            ExpressionKind::String(s) => self.emit_string_literal(s),
            ExpressionKind::Identifier(name) => {
                if let Some(global) = self.global_scope.get(name).copied() {
                    let ty = self.globals[global].ty.clone();
                    self.emit_load(ty, self.global_address(global))
                } else {
                    // A named function used as a value
                    self.function_label(*name)
                }
            }
            ExpressionKind::Constructor(name) => {
                let target = self.function_label(*name);
                let destination = self.create_register(lir::Type::Ptr);
                self.push(Instruction::Call {
                    target,
                    arguments: Vec::new(),
                    destination: Some(destination),
                });
                Operand::Register(destination)
            }
            ExpressionKind::Call { name, args } => {
                let arguments: Vec<Operand> =
                    args.iter().map(|arg| self.lower_expression(arg)).collect();

                let target = if self.function_scope.contains_key(name) {
                    self.function_label(*name)
                } else if self.external_names.contains(name) {
                    Operand::Immediate(Immediate::FunctionLabel(*name))
                } else {
                    // A function-typed parameter: call indirectly through
                    // the function pointer stored in its slot
                    let global = self.global_scope[name];
                    self.emit_load(lir::Type::Ptr, self.global_address(global))
                };

                match self.lower_ty(self.expression_ty(expr)) {
                    lir::Type::Unit => {
                        self.push(Instruction::Call {
                            target,
                            arguments,
                            destination: None,
                        });
                        Operand::Immediate(Immediate::Unit)
                    }
                    ty => {
                        let destination = self.create_register(ty);
                        self.push(Instruction::Call {
                            target,
                            arguments,
                            destination: Some(destination),
                        });
                        Operand::Register(destination)
                    }
                }
            }
            ExpressionKind::ArrayIndex { name, indices } => {
                let global = self.global_scope[name];
                let data = self.emit_load(lir::Type::Ptr, self.global_address(global));

                let element_ty = match &*self.results.types.resolve(self.expression_ty(expr)) {
                    TypeKind::Reference(inner) => self.lower_ty(inner),
                    _ => unreachable!("indexing yields a reference to the element"),
                };

                // offset = sum(index_k * stride_k), strides accumulated
                // from the header extents right-to-left
                let mut offset = Operand::Immediate(Immediate::Int(0));
                let mut stride = Operand::Immediate(Immediate::Int(1));

                for (position, index) in indices.iter().enumerate().rev() {
                    let value = self.lower_expression(index);
                    let scaled =
                        self.emit_binary(BinaryOp::Mul, lir::Type::I64, value, stride.clone());
                    offset = self.emit_binary(BinaryOp::Add, lir::Type::I64, offset, scaled);

                    let extent_slot = self.create_register(lir::Type::Ptr);
                    self.push(Instruction::GetArrayElementPointer {
                        destination: extent_slot,
                        source: data.clone(),
                        ty: lir::Type::I64,
                        index: Operand::Immediate(Immediate::Int(-(position as i64 + 1))),
                    });
                    let extent = self.emit_load(lir::Type::I64, Operand::Register(extent_slot));
                    stride = self.emit_binary(BinaryOp::Mul, lir::Type::I64, stride, extent);
                }

                let address = self.create_register(lir::Type::Ptr);
                self.push(Instruction::GetArrayElementPointer {
                    destination: address,
                    source: data,
                    ty: element_ty,
                    index: offset,
                });
                Operand::Register(address)
            }
            ExpressionKind::Dim { name, index } => {
                let global = self.global_scope[name];
                let data = self.emit_load(lir::Type::Ptr, self.global_address(global));

                let extent_slot = self.create_register(lir::Type::Ptr);
                self.push(Instruction::GetArrayElementPointer {
                    destination: extent_slot,
                    source: data,
                    ty: lir::Type::I64,
                    index: Operand::Immediate(Immediate::Int(-(*index as i64))),
                });
                self.emit_load(lir::Type::I64, Operand::Register(extent_slot))
            }
            ExpressionKind::Unary { operator, operand } => {
                let value = self.lower_expression(operand);

                match operator {
                    UnaryOperatorKind::Plus | UnaryOperatorKind::FloatPlus => value,
                    UnaryOperatorKind::Minus => {
                        let destination = self.create_register(lir::Type::I64);
                        self.push(Instruction::UnaryOperation {
                            operator: UnaryOp::Neg,
                            destination,
                            operand: value,
                        });
                        Operand::Register(destination)
                    }
                    UnaryOperatorKind::FloatMinus => {
                        let destination = self.create_register(lir::Type::F64);
                        self.push(Instruction::UnaryOperation {
                            operator: UnaryOp::Fneg,
                            destination,
                            operand: value,
                        });
                        Operand::Register(destination)
                    }
                    UnaryOperatorKind::Not => {
                        let destination = self.create_register(lir::Type::I1);
                        self.push(Instruction::UnaryOperation {
                            operator: UnaryOp::Not,
                            destination,
                            operand: value,
                        });
                        Operand::Register(destination)
                    }
                    UnaryOperatorKind::Deref => {
                        let ty = self.lower_ty(self.expression_ty(expr));
                        self.emit_load(ty, value)
                    }
                    UnaryOperatorKind::Delete => {
                        self.emit_free(value);
                        Operand::Immediate(Immediate::Unit)
                    }
                }
            }
            ExpressionKind::Binary { lhs, operator, rhs } => {
                self.lower_binary(lhs, *operator, rhs)
            }
            ExpressionKind::If {
                condition,
                positive,
                negative,
            } => {
                let condition = self.lower_expression(condition);

                let positive_block = self.create_block();
                let negative_block = self.create_block();
                let merge = self.create_block();

                self.push(Instruction::Branch {
                    condition,
                    positive: positive_block,
                    negative: negative_block,
                });

                self.set_block(positive_block);
                let positive_value = self.lower_expression(positive);
                let positive_end = self.current_block();
                self.push(Instruction::Jump { destination: merge });

                self.set_block(negative_block);
                let negative_value = match negative {
                    Some(negative) => self.lower_expression(negative),
                    None => Operand::Immediate(Immediate::Unit),
                };
                let negative_end = self.current_block();
                self.push(Instruction::Jump { destination: merge });

                self.set_block(merge);
                let ty = self.lower_ty(self.expression_ty(expr));
                let destination = self.create_register(ty);
                self.push(Instruction::Phi {
                    destination,
                    sources: vec![
                        (positive_end, positive_value),
                        (negative_end, negative_value),
                    ],
                });
                Operand::Register(destination)
            }
            ExpressionKind::While { condition, body } => {
                let test = self.create_block();
                let body_block = self.create_block();
                let exit = self.create_block();

                self.push(Instruction::Jump { destination: test });

                self.set_block(test);
                let condition = self.lower_expression(condition);
                self.push(Instruction::Branch {
                    condition,
                    positive: body_block,
                    negative: exit,
                });

                self.set_block(body_block);
                self.lower_expression(body);
                self.push(Instruction::Jump { destination: test });

                self.set_block(exit);
                Operand::Immediate(Immediate::Unit)
            }
            ExpressionKind::For {
                counter,
                start,
                end,
                descending,
                body,
            } => {
                // The counter gets a private slot; the end bound is
                // evaluated once up front
                let global = self.define_global(*counter, lir::Type::I64);
                let start = self.lower_expression(start);
                self.push(Instruction::StoreMem {
                    address: self.global_address(global),
                    source: start,
                });
                let bound = self.lower_expression(end);

                let test = self.create_block();
                let body_block = self.create_block();
                let exit = self.create_block();

                self.push(Instruction::Jump { destination: test });

                self.set_block(test);
                let current = self.emit_load(lir::Type::I64, self.global_address(global));
                let comparison = if *descending {
                    BinaryOp::IcmpSge
                } else {
                    BinaryOp::IcmpSle
                };
                let condition =
                    self.emit_binary(comparison, lir::Type::I1, current.clone(), bound.clone());
                self.push(Instruction::Branch {
                    condition,
                    positive: body_block,
                    negative: exit,
                });

                self.set_block(body_block);
                self.lower_expression(body);
                let step = if *descending {
                    BinaryOp::Sub
                } else {
                    BinaryOp::Add
                };
                let next = self.emit_binary(
                    step,
                    lir::Type::I64,
                    current,
                    Operand::Immediate(Immediate::Int(1)),
                );
                self.push(Instruction::StoreMem {
                    address: self.global_address(global),
                    source: next,
                });
                self.push(Instruction::Jump { destination: test });

                self.set_block(exit);
                Operand::Immediate(Immediate::Unit)
            }
            ExpressionKind::Match { scrutinee, clauses } => {
                let value = self.lower_expression(scrutinee);
                self.lower_match(expr, value, clauses)
            }
            ExpressionKind::New(ty) => {
                let size = self.lower_ty(ty).size();
                self.emit_malloc(Operand::Immediate(Immediate::Int(size as i64)))
            }
            ExpressionKind::LetIn { group, body } => {
                self.lower_let_group(group);
                self.lower_expression(body)
            }
        }
    }

    fn lower_binary(
        &mut self,
        lhs: &Expression,
        operator: BinaryOperatorKind,
        rhs: &Expression,
    ) -> Operand {
        use BinaryOperatorKind::*;

        let left = self.lower_expression(lhs);

        // Short-circuit operators evaluate their right operand in a
        // separate block that only runs when the outcome is still open
        if matches!(operator, LogicalAnd | LogicalOr) {
            let continued = self.create_block();
            let settled = self.create_block();
            let merge = self.create_block();

            let (positive, negative) = match operator {
                LogicalAnd => (continued, settled),
                _ => (settled, continued),
            };
            self.push(Instruction::Branch {
                condition: left,
                positive,
                negative,
            });

            self.set_block(continued);
            let right = self.lower_expression(rhs);
            let continued_end = self.current_block();
            self.push(Instruction::Jump { destination: merge });

            self.set_block(settled);
            let constant = Operand::Immediate(Immediate::Bool(operator == LogicalOr));
            self.push(Instruction::Jump { destination: merge });

            self.set_block(merge);
            let destination = self.create_register(lir::Type::I1);
            self.push(Instruction::Phi {
                destination,
                sources: vec![(continued_end, right), (settled, constant)],
            });
            return Operand::Register(destination);
        }

        let right = self.lower_expression(rhs);

        match operator {
            Add => self.emit_binary(BinaryOp::Add, lir::Type::I64, left, right),
            Subtract => self.emit_binary(BinaryOp::Sub, lir::Type::I64, left, right),
            Multiply => self.emit_binary(BinaryOp::Mul, lir::Type::I64, left, right),
            Divide => self.emit_binary(BinaryOp::Sdiv, lir::Type::I64, left, right),
            Modulus => self.emit_binary(BinaryOp::Srem, lir::Type::I64, left, right),
            FloatAdd => self.emit_binary(BinaryOp::Fadd, lir::Type::F64, left, right),
            FloatSubtract => self.emit_binary(BinaryOp::Fsub, lir::Type::F64, left, right),
            FloatMultiply => self.emit_binary(BinaryOp::Fmul, lir::Type::F64, left, right),
            FloatDivide => self.emit_binary(BinaryOp::Fdiv, lir::Type::F64, left, right),
            Power => {
                let destination = self.create_register(lir::Type::F64);
                self.push(Instruction::Call {
                    target: Operand::Immediate(Immediate::FunctionLabel(InternedSymbol::new(
                        "pow",
                    ))),
                    arguments: vec![left, right],
                    destination: Some(destination),
                });
                Operand::Register(destination)
            }
            StructuralEquals => self.lower_structural_comparison(lhs, left, right, false),
            StructuralNotEquals => self.lower_structural_comparison(lhs, left, right, true),
            PhysicalEquals => self.lower_physical_comparison(lhs, left, right, false),
            PhysicalNotEquals => self.lower_physical_comparison(lhs, left, right, true),
            LessThan | GreaterThan | LessThanOrEqualTo | GreaterThanOrEqualTo => {
                let is_float = matches!(
                    &*self.results.types.resolve(self.expression_ty(lhs)),
                    TypeKind::Float
                );
                let op = match (operator, is_float) {
                    (LessThan, false) => BinaryOp::IcmpSlt,
                    (GreaterThan, false) => BinaryOp::IcmpSgt,
                    (LessThanOrEqualTo, false) => BinaryOp::IcmpSle,
                    (GreaterThanOrEqualTo, false) => BinaryOp::IcmpSge,
                    (LessThan, true) => BinaryOp::FcmpLt,
                    (GreaterThan, true) => BinaryOp::FcmpGt,
                    (LessThanOrEqualTo, true) => BinaryOp::FcmpLe,
                    (GreaterThanOrEqualTo, true) => BinaryOp::FcmpGe,
                    _ => unreachable!(),
                };
                self.emit_binary(op, lir::Type::I1, left, right)
            }
            Assign => {
                self.push(Instruction::StoreMem {
                    address: left,
                    source: right,
                });
                Operand::Immediate(Immediate::Unit)
            }
            Sequence => right,
            LogicalAnd | LogicalOr => unreachable!("handled above"),
        }
    }

    /// Structural equality dereferences through reference chains on both
    /// operands and dispatches algebraic operands to the owning type's
    /// generated comparator.
    fn lower_structural_comparison(
        &mut self,
        lhs: &Expression,
        mut left: Operand,
        mut right: Operand,
        negated: bool,
    ) -> Operand {
        let mut operand_ty = self.results.types.resolve(self.expression_ty(lhs));

        loop {
            let resolved = operand_ty.clone();
            match &*resolved {
                TypeKind::Reference(inner) => {
                    let inner_ty = self.lower_ty(inner);
                    left = self.emit_load(inner_ty.clone(), left);
                    right = self.emit_load(inner_ty, right);
                    operand_ty = self.results.types.resolve(inner);
                }
                _ => break,
            }
        }

        match &*operand_ty {
            TypeKind::Unit => Operand::Immediate(Immediate::Bool(true)),
            TypeKind::Float => {
                let op = if negated {
                    BinaryOp::FcmpNe
                } else {
                    BinaryOp::FcmpEq
                };
                self.emit_binary(op, lir::Type::I1, left, right)
            }
            TypeKind::Named(owner) => {
                let dispatch = InternedSymbol::new(&format!("{owner}_cmp"));
                let target = self.function_label(dispatch);
                let equal = self.create_register(lir::Type::I1);
                self.push(Instruction::Call {
                    target,
                    arguments: vec![left, right],
                    destination: Some(equal),
                });

                if negated {
                    let destination = self.create_register(lir::Type::I1);
                    self.push(Instruction::UnaryOperation {
                        operator: UnaryOp::Not,
                        destination,
                        operand: Operand::Register(equal),
                    });
                    Operand::Register(destination)
                } else {
                    Operand::Register(equal)
                }
            }
            _ => {
                let op = if negated {
                    BinaryOp::IcmpNe
                } else {
                    BinaryOp::IcmpEq
                };
                self.emit_binary(op, lir::Type::I1, left, right)
            }
        }
    }

    /// Physical equality is a plain identity comparison of the operand
    /// bit patterns; references are not chased.
    fn lower_physical_comparison(
        &mut self,
        lhs: &Expression,
        left: Operand,
        right: Operand,
        negated: bool,
    ) -> Operand {
        match &*self.results.types.resolve(self.expression_ty(lhs)) {
            TypeKind::Unit => Operand::Immediate(Immediate::Bool(true)),
            TypeKind::Float => {
                let op = if negated {
                    BinaryOp::FcmpNe
                } else {
                    BinaryOp::FcmpEq
                };
                self.emit_binary(op, lir::Type::I1, left, right)
            }
            _ => {
                let op = if negated {
                    BinaryOp::IcmpNe
                } else {
                    BinaryOp::IcmpEq
                };
                self.emit_binary(op, lir::Type::I1, left, right)
            }
        }
    }

    /// A match is a chain of trial blocks in clause order; if every trial
    /// falls through, the generated fault sequence prints a fixed
    /// diagnostic and exits with a non-zero status.
    fn lower_match(&mut self, expr: &Expression, scrutinee: Operand, clauses: &[Clause]) -> Operand {
        let merge = self.create_block();
        let mut incomings = Vec::new();

        for clause in clauses {
            let positive = self.create_block();
            let negative = self.create_block();

            let condition = self.lower_pattern(&clause.pattern, &scrutinee);
            self.push(Instruction::Branch {
                condition,
                positive,
                negative,
            });

            self.set_block(positive);
            let value = self.lower_expression(&clause.body);
            incomings.push((self.current_block(), value));
            self.push(Instruction::Jump { destination: merge });

            self.set_block(negative);
        }

        let message = self.emit_string_literal(NO_MATCH_MESSAGE);
        let print_string = self.results.runtime[&RuntimePrimitive::PrintString].name;
        self.push(Instruction::Call {
            target: Operand::Immediate(Immediate::FunctionLabel(print_string)),
            arguments: vec![message],
            destination: None,
        });
        self.push(Instruction::Call {
            target: Operand::Immediate(Immediate::FunctionLabel(InternedSymbol::new("exit"))),
            arguments: vec![Operand::Immediate(Immediate::Int(1))],
            destination: None,
        });
        self.push(Instruction::Unreachable);

        self.set_block(merge);
        let ty = self.lower_ty(self.expression_ty(expr));
        let destination = self.create_register(ty);
        self.push(Instruction::Phi {
            destination,
            sources: incomings,
        });
        Operand::Register(destination)
    }

    /// Compiles a pattern into a boolean condition over the scrutinee
    /// value, binding fresh slots along the way.
    fn lower_pattern(&mut self, pattern: &Pattern, scrutinee: &Operand) -> Operand {
        match &pattern.kind {
            PatternKind::Int(n) => self.emit_binary(
                BinaryOp::IcmpEq,
                lir::Type::I1,
                scrutinee.clone(),
                Operand::Immediate(Immediate::Int(*n)),
            ),
            PatternKind::Float(x) => self.emit_binary(
                BinaryOp::FcmpEq,
                lir::Type::I1,
                scrutinee.clone(),
                Operand::Immediate(Immediate::Float(*x)),
            ),
            PatternKind::Char(c) => self.emit_binary(
                BinaryOp::IcmpEq,
                lir::Type::I1,
                scrutinee.clone(),
                Operand::Immediate(Immediate::Char(*c)),
            ),
            PatternKind::Bool(b) => self.emit_binary(
                BinaryOp::IcmpEq,
                lir::Type::I1,
                scrutinee.clone(),
                Operand::Immediate(Immediate::Bool(*b)),
            ),
            PatternKind::Binding(name) => {
                // Always matches; the scrutinee lands in a fresh slot
                let ty = self.lower_ty(
                    pattern
                        .ty
                        .as_ref()
                        .expect("pattern was typed by the checking pass"),
                );
                let global = self.define_global(*name, ty);
                self.push(Instruction::StoreMem {
                    address: self.global_address(global),
                    source: scrutinee.clone(),
                });
                Operand::Immediate(Immediate::Bool(true))
            }
            PatternKind::Constructor { name, fields } => {
                let info = self.results.constructors[name].clone();

                let observed = self.emit_load(lir::Type::I64, scrutinee.clone());
                let tag_matches = self.emit_binary(
                    BinaryOp::IcmpEq,
                    lir::Type::I1,
                    observed,
                    Operand::Immediate(Immediate::Int(info.tag as i64)),
                );

                if fields.is_empty() {
                    return tag_matches;
                }

                // Field sub-patterns only run once the tag matched, so a
                // wrong-shape record is never read past its tag
                let positive = self.create_block();
                let negative = self.create_block();
                let merge = self.create_block();

                self.push(Instruction::Branch {
                    condition: tag_matches.clone(),
                    positive,
                    negative,
                });

                self.set_block(positive);
                let layout = self.record_layout(&info.fields);
                let mut condition = tag_matches;

                for (i, (sub_pattern, field)) in fields.iter().zip(&info.fields).enumerate() {
                    let slot = self.create_register(lir::Type::Ptr);
                    self.push(Instruction::GetStructElementPointer {
                        destination: slot,
                        source: scrutinee.clone(),
                        ty: layout.clone(),
                        index: i + 1,
                    });
                    let field_ty = self.lower_ty(field);
                    let value = self.emit_load(field_ty, Operand::Register(slot));

                    let sub_condition = self.lower_pattern(sub_pattern, &value);
                    condition =
                        self.emit_binary(BinaryOp::And, lir::Type::I1, condition, sub_condition);
                }

                let positive_end = self.current_block();
                self.push(Instruction::Jump { destination: merge });

                self.set_block(negative);
                self.push(Instruction::Jump { destination: merge });

                self.set_block(merge);
                let destination = self.create_register(lir::Type::I1);
                self.push(Instruction::Phi {
                    destination,
                    sources: vec![
                        (positive_end, condition),
                        (negative, Operand::Immediate(Immediate::Bool(false))),
                    ],
                });
                Operand::Register(destination)
            }
        }
    }

    fn finish(self) -> lir::Module {
        let globals_by_name = self
            .globals
            .enumerate()
            .map(|(id, slot)| (slot.name, id))
            .collect();
        let functions_by_name = self
            .functions
            .enumerate()
            .map(|(id, function)| (function.name, id))
            .collect();

        lir::Module {
            externals: self.externals,
            globals: self.globals,
            statics: self.statics,
            functions: self.functions,
            globals_by_name,
            functions_by_name,
        }
    }
}
