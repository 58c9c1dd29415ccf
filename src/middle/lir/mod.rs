//! LIR (Low-level Intermediate Representation). In this form, loops,
//! conditionals and pattern matches are simplified to labeled blocks with
//! branches, expression trees are flattened into instructions over typed
//! virtual registers, and every source binding has become a named global
//! storage slot. This textual module is the compiler core's output; an
//! optimizing backend consumes it from here.

use std::{collections::BTreeSet, rc::Rc};

use hashbrown::HashMap;

use crate::{
    frontend::intern::InternedSymbol,
    index::{IndexVec, simple_index},
};

pub mod ast_lowering;
pub mod pretty_print;
pub mod verify;

simple_index! {
    /// Identifies an LIR block within one function
    pub struct BlockId;
}

simple_index! {
    /// Identifies a virtual LIR register which holds a temporary value
    pub struct RegisterId;
}

simple_index! {
    /// Identifies a global storage slot
    pub struct GlobalId;
}

simple_index! {
    /// Identifies a chunk of read-only static data
    pub struct StaticId;
}

simple_index! {
    /// Identifies a function definition within the module
    pub struct FunctionId;
}

impl BlockId {
    pub const ZERO: Self = Self(0);
}

#[derive(Debug)]
pub struct Module {
    pub externals: Vec<ExternalFunction>,
    pub globals: IndexVec<GlobalId, GlobalSlot>,
    pub statics: IndexVec<StaticId, StaticData>,
    pub functions: IndexVec<FunctionId, FunctionDefinition>,
    /// Storage-slot display names are unique module-wide
    pub globals_by_name: HashMap<InternedSymbol, GlobalId>,
    pub functions_by_name: HashMap<InternedSymbol, FunctionId>,
}

impl Module {
    pub fn global_named(&self, name: InternedSymbol) -> Option<&GlobalSlot> {
        self.globals_by_name.get(&name).map(|id| &self.globals[*id])
    }

    pub fn function_named(&self, name: InternedSymbol) -> Option<&FunctionDefinition> {
        self.functions_by_name
            .get(&name)
            .map(|id| &self.functions[*id])
    }

    pub fn external_named(&self, name: InternedSymbol) -> Option<&ExternalFunction> {
        self.externals.iter().find(|e| e.name == name)
    }
}

/// A runtime primitive the emitted module links against, known only by
/// name and signature
#[derive(Debug, Clone)]
pub struct ExternalFunction {
    pub name: InternedSymbol,
    pub params: Vec<Type>,
    pub return_ty: Type,
}

/// One named storage slot. Every source binding lives in one of these;
/// there are no stack frames in the output.
#[derive(Debug, Clone)]
pub struct GlobalSlot {
    pub name: InternedSymbol,
    pub ty: Type,
}

/// Read-only bytes, used for string literals (an 8 byte length prefix
/// followed by the characters and a terminating NUL)
#[derive(Debug, Clone)]
pub struct StaticData {
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
pub struct FunctionDefinition {
    pub name: InternedSymbol,
    /// Registers that receive the incoming arguments
    pub params: Vec<RegisterId>,
    pub return_ty: Type,
    pub registers: IndexVec<RegisterId, Register>,
    pub blocks: IndexVec<BlockId, Block>,
}

/// A temporary virtual register of some type
#[derive(Debug, Clone, PartialEq)]
pub struct Register {
    pub id: RegisterId,
    pub ty: Type,
}

#[derive(Debug)]
pub struct Block {
    pub id: BlockId,
    pub instructions: Vec<Instruction>,
    pub predecessors: BTreeSet<BlockId>,
}

impl Block {
    pub fn is_terminated(&self) -> bool {
        self.instructions
            .last()
            .is_some_and(Instruction::is_terminator)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Move {
        destination: RegisterId,
        source: Operand,
    },
    UnaryOperation {
        operator: UnaryOp,
        destination: RegisterId,
        operand: Operand,
    },
    BinaryOperation {
        operator: BinaryOp,
        destination: RegisterId,
        lhs: Operand,
        rhs: Operand,
    },
    /// Loads a value of the destination register's type from an address
    LoadMem {
        destination: RegisterId,
        address: Operand,
    },
    /// Stores a value through an address
    StoreMem {
        address: Operand,
        source: Operand,
    },
    /// Computes the address of field `index` of a record of layout `ty`
    GetStructElementPointer {
        destination: RegisterId,
        source: Operand,
        ty: Struct,
        index: usize,
    },
    /// Computes `source + index * size_of(ty)`; `index` may be negative
    /// (array dimension headers live before the data pointer)
    GetArrayElementPointer {
        destination: RegisterId,
        source: Operand,
        ty: Type,
        index: Operand,
    },
    Branch {
        condition: Operand,
        positive: BlockId,
        negative: BlockId,
    },
    Jump {
        destination: BlockId,
    },
    /// The merge value combining the values produced along the
    /// predecessor paths into the containing block
    Phi {
        destination: RegisterId,
        sources: Vec<(BlockId, Operand)>,
    },
    Call {
        /// A function label for direct calls, or a register holding a
        /// function address for indirect ones
        target: Operand,
        arguments: Vec<Operand>,
        /// Absent for unit-returning calls
        destination: Option<RegisterId>,
    },
    Return {
        value: Option<Operand>,
    },
    /// Terminates a block control can never leave (after the generated
    /// no-match fault sequence calls `exit`)
    Unreachable,
}

impl Instruction {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instruction::Branch { .. }
                | Instruction::Jump { .. }
                | Instruction::Return { .. }
                | Instruction::Unreachable
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Immediate {
    Int(i64),
    Float(f64),
    Char(u8),
    Bool(bool),
    Unit,
    /// Address of a static data chunk
    StaticLabel(StaticId),
    /// Address of a global storage slot
    GlobalLabel(InternedSymbol),
    /// Address of a defined or external function
    FunctionLabel(InternedSymbol),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Immediate(Immediate),
    Register(RegisterId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum UnaryOp {
    Neg,
    Fneg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Sdiv,
    Srem,
    Fadd,
    Fsub,
    Fmul,
    Fdiv,
    And,
    Or,
    IcmpEq,
    IcmpNe,
    IcmpSlt,
    IcmpSgt,
    IcmpSle,
    IcmpSge,
    FcmpEq,
    FcmpNe,
    FcmpLt,
    FcmpGt,
    FcmpLe,
    FcmpGe,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    I1,
    I8,
    I64,
    F64,
    Ptr,
    Unit,
    Struct(Struct),
}

/// A packed record layout
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Struct(pub Rc<[Type]>);

impl Type {
    pub fn size(&self) -> usize {
        match self {
            Type::I1 | Type::I8 => 1,
            Type::I64 | Type::F64 | Type::Ptr => 8,
            Type::Unit => 0,
            Type::Struct(fields) => fields.size(),
        }
    }
}

impl Struct {
    pub fn size(&self) -> usize {
        self.0.iter().map(Type::size).sum()
    }

    /// Byte offset of field `index` in the packed layout
    pub fn offset(&self, index: usize) -> usize {
        self.0[..index].iter().map(Type::size).sum()
    }
}
