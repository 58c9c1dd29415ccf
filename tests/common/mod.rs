//! Shared test support: shorthand constructors for building ASTs the way
//! the external parser would, and a small reference interpreter for the
//! emitted LIR so observable program behavior can be asserted end to end.

#![allow(dead_code)]

use std::collections::HashMap;

use lumec::{
    frontend::{
        ast::{
            BinaryOperatorKind, Clause, ConstructorDefinition, Definition, Expression,
            ExpressionKind, LetGroup, Parameter, Pattern, PatternKind, Program, Statement,
            TypeDefinition, UnaryOperatorKind,
        },
        intern::InternedSymbol,
    },
    index::Index,
    middle::{
        lir::{self, BinaryOp, BlockId, Immediate, Instruction, Operand, UnaryOp},
        ty::Type,
    },
};

/* AST shorthand */

pub fn sym(name: &str) -> InternedSymbol {
    InternedSymbol::new(name)
}

pub fn unit() -> Expression {
    Expression::new(ExpressionKind::Unit)
}

pub fn int(value: i64) -> Expression {
    Expression::new(ExpressionKind::Int(value))
}

pub fn float(value: f64) -> Expression {
    Expression::new(ExpressionKind::Float(value))
}

pub fn boolean(value: bool) -> Expression {
    Expression::new(ExpressionKind::Bool(value))
}

pub fn string(value: &str) -> Expression {
    Expression::new(ExpressionKind::String(value.to_string()))
}

pub fn ident(name: &str) -> Expression {
    Expression::new(ExpressionKind::Identifier(sym(name)))
}

pub fn constructor(name: &str) -> Expression {
    Expression::new(ExpressionKind::Constructor(sym(name)))
}

pub fn call(name: &str, args: Vec<Expression>) -> Expression {
    Expression::new(ExpressionKind::Call {
        name: sym(name),
        args,
    })
}

pub fn array_index(name: &str, indices: Vec<Expression>) -> Expression {
    Expression::new(ExpressionKind::ArrayIndex {
        name: sym(name),
        indices,
    })
}

pub fn dim(index: usize, name: &str) -> Expression {
    Expression::new(ExpressionKind::Dim {
        name: sym(name),
        index,
    })
}

pub fn unary(operator: UnaryOperatorKind, operand: Expression) -> Expression {
    Expression::new(ExpressionKind::Unary {
        operator,
        operand: Box::new(operand),
    })
}

pub fn deref(operand: Expression) -> Expression {
    unary(UnaryOperatorKind::Deref, operand)
}

pub fn binary(lhs: Expression, operator: BinaryOperatorKind, rhs: Expression) -> Expression {
    Expression::new(ExpressionKind::Binary {
        lhs: Box::new(lhs),
        operator,
        rhs: Box::new(rhs),
    })
}

pub fn assign(lhs: Expression, rhs: Expression) -> Expression {
    binary(lhs, BinaryOperatorKind::Assign, rhs)
}

/// Right-nested `;` sequence
pub fn seq(exprs: Vec<Expression>) -> Expression {
    exprs
        .into_iter()
        .rev()
        .reduce(|rhs, lhs| binary(lhs, BinaryOperatorKind::Sequence, rhs))
        .expect("seq of at least one expression")
}

pub fn if_else(condition: Expression, positive: Expression, negative: Expression) -> Expression {
    Expression::new(ExpressionKind::If {
        condition: Box::new(condition),
        positive: Box::new(positive),
        negative: Some(Box::new(negative)),
    })
}

pub fn while_loop(condition: Expression, body: Expression) -> Expression {
    Expression::new(ExpressionKind::While {
        condition: Box::new(condition),
        body: Box::new(body),
    })
}

pub fn for_loop(
    counter: &str,
    start: Expression,
    end: Expression,
    descending: bool,
    body: Expression,
) -> Expression {
    Expression::new(ExpressionKind::For {
        counter: sym(counter),
        start: Box::new(start),
        end: Box::new(end),
        descending,
        body: Box::new(body),
    })
}

pub fn match_expr(scrutinee: Expression, clauses: Vec<(Pattern, Expression)>) -> Expression {
    Expression::new(ExpressionKind::Match {
        scrutinee: Box::new(scrutinee),
        clauses: clauses
            .into_iter()
            .map(|(pattern, body)| Clause { pattern, body })
            .collect(),
    })
}

pub fn pat_int(value: i64) -> Pattern {
    Pattern::new(PatternKind::Int(value))
}

pub fn pat_bind(name: &str) -> Pattern {
    Pattern::new(PatternKind::Binding(sym(name)))
}

pub fn pat_ctor(name: &str, fields: Vec<Pattern>) -> Pattern {
    Pattern::new(PatternKind::Constructor {
        name: sym(name),
        fields,
    })
}

/// `let <name> : <ty> = <body>` (a constant definition; its body runs
/// inside `main` at the definition site)
pub fn constant(name: &str, ty: Type, body: Expression) -> Statement {
    Statement::Let(LetGroup {
        recursive: false,
        defs: vec![Definition::Value {
            name: sym(name),
            params: Vec::new(),
            return_ty: Some(ty),
            body,
        }],
    })
}

pub fn function(
    recursive: bool,
    name: &str,
    params: Vec<(&str, Type)>,
    return_ty: Type,
    body: Expression,
) -> Statement {
    Statement::Let(LetGroup {
        recursive,
        defs: vec![Definition::Value {
            name: sym(name),
            params: params
                .into_iter()
                .map(|(name, ty)| Parameter {
                    name: sym(name),
                    ty: Some(ty),
                })
                .collect(),
            return_ty: Some(return_ty),
            body,
        }],
    })
}

pub fn mutable(name: &str, ty: Type) -> Statement {
    Statement::Let(LetGroup {
        recursive: false,
        defs: vec![Definition::Mutable {
            name: sym(name),
            dims: None,
            ty,
        }],
    })
}

pub fn mutable_array(name: &str, dims: Vec<Expression>, ty: Type) -> Statement {
    Statement::Let(LetGroup {
        recursive: false,
        defs: vec![Definition::Mutable {
            name: sym(name),
            dims: Some(dims),
            ty,
        }],
    })
}

pub fn type_def(name: &str, constructors: Vec<(&str, Vec<Type>)>) -> Statement {
    Statement::Types(vec![TypeDefinition {
        name: sym(name),
        constructors: constructors
            .into_iter()
            .map(|(name, fields)| ConstructorDefinition {
                name: sym(name),
                fields,
            })
            .collect(),
    }])
}

pub fn program(statements: Vec<Statement>) -> Program {
    Program { statements }
}

/* LIR reference interpreter */

pub struct ExecResult {
    pub exit_code: i64,
    pub output: String,
}

/// Compiles the program and runs the emitted module, returning the exit
/// code and everything the print primitives wrote.
pub fn compile_and_run(mut program: Program) -> ExecResult {
    let module = lumec::compile_program(&mut program).expect("program should compile");
    run_module(&module)
}

pub fn run_module(module: &lir::Module) -> ExecResult {
    let mut machine = Machine::new(module);

    match machine.call_function(sym("main"), Vec::new()) {
        Ok(value) => ExecResult {
            exit_code: match value {
                Value::Int(code) => code,
                _ => 0,
            },
            output: machine.output,
        },
        Err(Exit(code)) => ExecResult {
            exit_code: code,
            output: machine.output,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Value {
    Int(i64),
    Float(f64),
    Char(u8),
    Bool(bool),
    Ptr(usize),
    Unit,
}

/// Early termination through the `exit` primitive
struct Exit(i64);

const FN_BASE: usize = 1 << 48;

struct Machine<'m> {
    module: &'m lir::Module,
    memory: Vec<u8>,
    globals: HashMap<InternedSymbol, usize>,
    statics: Vec<usize>,
    fn_by_addr: HashMap<usize, InternedSymbol>,
    fn_addrs: HashMap<InternedSymbol, usize>,
    output: String,
}

impl<'m> Machine<'m> {
    fn new(module: &'m lir::Module) -> Self {
        let mut machine = Self {
            module,
            memory: vec![0; 8],
            globals: HashMap::new(),
            statics: Vec::new(),
            fn_by_addr: HashMap::new(),
            fn_addrs: HashMap::new(),
            output: String::new(),
        };

        for data in module.statics.iter() {
            let addr = machine.alloc(data.bytes.len());
            machine.memory[addr..addr + data.bytes.len()].copy_from_slice(&data.bytes);
            machine.statics.push(addr);
        }

        for slot in module.globals.iter() {
            let addr = machine.alloc(8);
            machine.globals.insert(slot.name, addr);
        }

        let mut next_fn = FN_BASE;
        let names = module
            .functions
            .iter()
            .map(|f| f.name)
            .chain(module.externals.iter().map(|e| e.name));
        for name in names {
            machine.fn_by_addr.insert(next_fn, name);
            machine.fn_addrs.insert(name, next_fn);
            next_fn += 8;
        }

        machine
    }

    fn alloc(&mut self, size: usize) -> usize {
        let addr = (self.memory.len() + 7) & !7;
        self.memory.resize(addr + size.max(1), 0);
        addr
    }

    fn call_function(&mut self, name: InternedSymbol, args: Vec<Value>) -> Result<Value, Exit> {
        let module = self.module;
        if let Some(function) = module.function_named(name) {
            self.exec_function(function, args)
        } else {
            self.call_external(name, args)
        }
    }

    fn exec_function(
        &mut self,
        function: &lir::FunctionDefinition,
        args: Vec<Value>,
    ) -> Result<Value, Exit> {
        let mut registers: Vec<Option<Value>> = vec![None; function.registers.len()];
        for (param, arg) in function.params.iter().zip(args) {
            registers[param.index()] = Some(arg);
        }

        let mut block = BlockId::ZERO;
        let mut previous: Option<BlockId> = None;

        'blocks: loop {
            let current = &function.blocks[block];

            for instruction in &current.instructions {
                match instruction {
                    Instruction::Move {
                        destination,
                        source,
                    } => {
                        registers[destination.index()] = Some(self.eval(&registers, source));
                    }
                    Instruction::UnaryOperation {
                        operator,
                        destination,
                        operand,
                    } => {
                        let value = self.eval(&registers, operand);
                        registers[destination.index()] = Some(apply_unary(*operator, value));
                    }
                    Instruction::BinaryOperation {
                        operator,
                        destination,
                        lhs,
                        rhs,
                    } => {
                        let lhs = self.eval(&registers, lhs);
                        let rhs = self.eval(&registers, rhs);
                        registers[destination.index()] = Some(apply_binary(*operator, lhs, rhs));
                    }
                    Instruction::LoadMem {
                        destination,
                        address,
                    } => {
                        let addr = self.eval_ptr(&registers, address);
                        let ty = &function.registers[*destination].ty;
                        registers[destination.index()] = Some(self.load(ty, addr));
                    }
                    Instruction::StoreMem { address, source } => {
                        let addr = self.eval_ptr(&registers, address);
                        let value = self.eval(&registers, source);
                        self.store(addr, value);
                    }
                    Instruction::GetStructElementPointer {
                        destination,
                        source,
                        ty,
                        index,
                    } => {
                        let base = self.eval_ptr(&registers, source);
                        registers[destination.index()] =
                            Some(Value::Ptr(base + ty.offset(*index)));
                    }
                    Instruction::GetArrayElementPointer {
                        destination,
                        source,
                        ty,
                        index,
                    } => {
                        let base = self.eval_ptr(&registers, source);
                        let index = match self.eval(&registers, index) {
                            Value::Int(n) => n,
                            other => panic!("non-integer gep index: {other:?}"),
                        };
                        let addr = base as i64 + index * ty.size() as i64;
                        registers[destination.index()] = Some(Value::Ptr(addr as usize));
                    }
                    Instruction::Phi {
                        destination,
                        sources,
                    } => {
                        let from = previous.expect("phi in an entry block");
                        let (_, value) = sources
                            .iter()
                            .find(|(block, _)| *block == from)
                            .expect("phi covers the incoming edge");
                        registers[destination.index()] = Some(self.eval(&registers, value));
                    }
                    Instruction::Call {
                        target,
                        arguments,
                        destination,
                    } => {
                        let addr = self.eval_ptr(&registers, target);
                        let callee = *self
                            .fn_by_addr
                            .get(&addr)
                            .expect("call through a non-function pointer");
                        let args = arguments
                            .iter()
                            .map(|arg| self.eval(&registers, arg))
                            .collect();

                        let result = self.call_function(callee, args)?;
                        if let Some(destination) = destination {
                            registers[destination.index()] = Some(result);
                        }
                    }
                    Instruction::Branch {
                        condition,
                        positive,
                        negative,
                    } => {
                        let taken = match self.eval(&registers, condition) {
                            Value::Bool(b) => b,
                            other => panic!("non-boolean branch condition: {other:?}"),
                        };
                        previous = Some(block);
                        block = if taken { *positive } else { *negative };
                        continue 'blocks;
                    }
                    Instruction::Jump { destination } => {
                        previous = Some(block);
                        block = *destination;
                        continue 'blocks;
                    }
                    Instruction::Return { value } => {
                        return Ok(match value {
                            Some(value) => self.eval(&registers, value),
                            None => Value::Unit,
                        });
                    }
                    Instruction::Unreachable => {
                        panic!("control reached an unreachable terminator")
                    }
                }
            }

            unreachable!("block fell through without a terminator");
        }
    }

    fn eval(&self, registers: &[Option<Value>], operand: &Operand) -> Value {
        match operand {
            Operand::Register(register) => {
                registers[register.index()].expect("register read before it was written")
            }
            Operand::Immediate(immediate) => match immediate {
                Immediate::Int(n) => Value::Int(*n),
                Immediate::Float(x) => Value::Float(*x),
                Immediate::Char(c) => Value::Char(*c),
                Immediate::Bool(b) => Value::Bool(*b),
                Immediate::Unit => Value::Unit,
                Immediate::StaticLabel(id) => Value::Ptr(self.statics[id.index()]),
                Immediate::GlobalLabel(name) => Value::Ptr(self.globals[name]),
                Immediate::FunctionLabel(name) => Value::Ptr(self.fn_addrs[name]),
            },
        }
    }

    fn eval_ptr(&self, registers: &[Option<Value>], operand: &Operand) -> usize {
        match self.eval(registers, operand) {
            Value::Ptr(addr) => addr,
            other => panic!("expected a pointer, found {other:?}"),
        }
    }

    fn load(&self, ty: &lir::Type, addr: usize) -> Value {
        match ty {
            lir::Type::I64 => {
                let bytes: [u8; 8] = self.memory[addr..addr + 8].try_into().unwrap();
                Value::Int(i64::from_le_bytes(bytes))
            }
            lir::Type::F64 => {
                let bytes: [u8; 8] = self.memory[addr..addr + 8].try_into().unwrap();
                Value::Float(f64::from_le_bytes(bytes))
            }
            lir::Type::I8 => Value::Char(self.memory[addr]),
            lir::Type::I1 => Value::Bool(self.memory[addr] != 0),
            lir::Type::Ptr => {
                let bytes: [u8; 8] = self.memory[addr..addr + 8].try_into().unwrap();
                Value::Ptr(u64::from_le_bytes(bytes) as usize)
            }
            lir::Type::Unit => Value::Unit,
            lir::Type::Struct(_) => panic!("aggregate loads are never emitted"),
        }
    }

    fn store(&mut self, addr: usize, value: Value) {
        match value {
            Value::Int(n) => {
                self.memory[addr..addr + 8].copy_from_slice(&n.to_le_bytes());
            }
            Value::Float(x) => {
                self.memory[addr..addr + 8].copy_from_slice(&x.to_le_bytes());
            }
            Value::Char(c) => self.memory[addr] = c,
            Value::Bool(b) => self.memory[addr] = b as u8,
            Value::Ptr(p) => {
                self.memory[addr..addr + 8].copy_from_slice(&(p as u64).to_le_bytes());
            }
            Value::Unit => {}
        }
    }

    fn c_string(&self, addr: usize) -> String {
        let end = self.memory[addr..]
            .iter()
            .position(|b| *b == 0)
            .map(|i| addr + i)
            .expect("unterminated string");
        String::from_utf8_lossy(&self.memory[addr..end]).into_owned()
    }

    fn call_external(&mut self, name: InternedSymbol, args: Vec<Value>) -> Result<Value, Exit> {
        let full = name.value();
        let base = match full.rsplit_once('_') {
            Some((head, tail))
                if !head.is_empty() && !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) =>
            {
                head
            }
            _ => full,
        };

        let int_arg = |i: usize| match args[i] {
            Value::Int(n) => n,
            other => panic!("{base}: expected int, found {other:?}"),
        };
        let float_arg = |i: usize| match args[i] {
            Value::Float(x) => x,
            other => panic!("{base}: expected float, found {other:?}"),
        };
        let ptr_arg = |i: usize| match args[i] {
            Value::Ptr(p) => p,
            other => panic!("{base}: expected pointer, found {other:?}"),
        };

        let result = match base {
            "print_int" => {
                self.output.push_str(&int_arg(0).to_string());
                Value::Unit
            }
            "print_bool" => {
                let text = match args[0] {
                    Value::Bool(true) => "true",
                    Value::Bool(false) => "false",
                    other => panic!("print_bool: {other:?}"),
                };
                self.output.push_str(text);
                Value::Unit
            }
            "print_char" => {
                let c = match args[0] {
                    Value::Char(c) => c,
                    other => panic!("print_char: {other:?}"),
                };
                self.output.push(c as char);
                Value::Unit
            }
            "print_float" => {
                self.output.push_str(&float_arg(0).to_string());
                Value::Unit
            }
            "print_string" => {
                let text = self.c_string(ptr_arg(0));
                self.output.push_str(&text);
                Value::Unit
            }
            "abs" => Value::Int(int_arg(0).abs()),
            "fabs" => Value::Float(float_arg(0).abs()),
            "sqrt" => Value::Float(float_arg(0).sqrt()),
            "sin" => Value::Float(float_arg(0).sin()),
            "cos" => Value::Float(float_arg(0).cos()),
            "tan" => Value::Float(float_arg(0).tan()),
            "atan" => Value::Float(float_arg(0).atan()),
            "exp" => Value::Float(float_arg(0).exp()),
            "ln" => Value::Float(float_arg(0).ln()),
            "pi" => Value::Float(std::f64::consts::PI),
            "incr" | "decr" => {
                let addr = ptr_arg(0);
                let current = match self.load(&lir::Type::I64, addr) {
                    Value::Int(n) => n,
                    _ => unreachable!(),
                };
                let next = if base == "incr" { current + 1 } else { current - 1 };
                self.store(addr, Value::Int(next));
                Value::Unit
            }
            "float_of_int" => Value::Float(int_arg(0) as f64),
            "int_of_float" => Value::Int(float_arg(0) as i64),
            "round" => Value::Int(float_arg(0).round() as i64),
            "int_of_char" => match args[0] {
                Value::Char(c) => Value::Int(c as i64),
                other => panic!("int_of_char: {other:?}"),
            },
            "char_of_int" => Value::Char(int_arg(0) as u8),
            "strlen" => Value::Int(self.c_string(ptr_arg(0)).len() as i64),
            "strcmp" => {
                let lhs = self.c_string(ptr_arg(0));
                let rhs = self.c_string(ptr_arg(1));
                Value::Int(match lhs.cmp(&rhs) {
                    std::cmp::Ordering::Less => -1,
                    std::cmp::Ordering::Equal => 0,
                    std::cmp::Ordering::Greater => 1,
                })
            }
            "strcpy" | "strcat" => {
                let dest = ptr_arg(0);
                let source = self.c_string(ptr_arg(1));
                let offset = if base == "strcat" {
                    self.c_string(dest).len()
                } else {
                    0
                };
                for (i, byte) in source.bytes().enumerate() {
                    self.memory[dest + offset + i] = byte;
                }
                self.memory[dest + offset + source.len()] = 0;
                Value::Unit
            }
            "malloc" => {
                let size = int_arg(0).max(0) as usize;
                let addr = self.alloc(size);
                Value::Ptr(addr)
            }
            "free" => Value::Unit,
            "exit" => return Err(Exit(int_arg(0))),
            "pow" => Value::Float(float_arg(0).powf(float_arg(1))),
            other => panic!("unimplemented external function {other}"),
        };

        Ok(result)
    }
}

fn apply_unary(operator: UnaryOp, value: Value) -> Value {
    match (operator, value) {
        (UnaryOp::Neg, Value::Int(n)) => Value::Int(-n),
        (UnaryOp::Fneg, Value::Float(x)) => Value::Float(-x),
        (UnaryOp::Not, Value::Bool(b)) => Value::Bool(!b),
        (operator, value) => panic!("invalid unary operation {operator} on {value:?}"),
    }
}

fn apply_binary(operator: BinaryOp, lhs: Value, rhs: Value) -> Value {
    use BinaryOp::*;

    match (operator, lhs, rhs) {
        (Add, Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_add(b)),
        (Sub, Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_sub(b)),
        (Mul, Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_mul(b)),
        (Sdiv, Value::Int(a), Value::Int(b)) => Value::Int(a / b),
        (Srem, Value::Int(a), Value::Int(b)) => Value::Int(a % b),
        (Fadd, Value::Float(a), Value::Float(b)) => Value::Float(a + b),
        (Fsub, Value::Float(a), Value::Float(b)) => Value::Float(a - b),
        (Fmul, Value::Float(a), Value::Float(b)) => Value::Float(a * b),
        (Fdiv, Value::Float(a), Value::Float(b)) => Value::Float(a / b),
        (And, Value::Bool(a), Value::Bool(b)) => Value::Bool(a & b),
        (Or, Value::Bool(a), Value::Bool(b)) => Value::Bool(a | b),
        (IcmpEq, a, b) => Value::Bool(identity_eq(a, b)),
        (IcmpNe, a, b) => Value::Bool(!identity_eq(a, b)),
        (IcmpSlt, a, b) => Value::Bool(int_like(a) < int_like(b)),
        (IcmpSgt, a, b) => Value::Bool(int_like(a) > int_like(b)),
        (IcmpSle, a, b) => Value::Bool(int_like(a) <= int_like(b)),
        (IcmpSge, a, b) => Value::Bool(int_like(a) >= int_like(b)),
        (FcmpEq, Value::Float(a), Value::Float(b)) => Value::Bool(a == b),
        (FcmpNe, Value::Float(a), Value::Float(b)) => Value::Bool(a != b),
        (FcmpLt, Value::Float(a), Value::Float(b)) => Value::Bool(a < b),
        (FcmpGt, Value::Float(a), Value::Float(b)) => Value::Bool(a > b),
        (FcmpLe, Value::Float(a), Value::Float(b)) => Value::Bool(a <= b),
        (FcmpGe, Value::Float(a), Value::Float(b)) => Value::Bool(a >= b),
        (operator, lhs, rhs) => {
            panic!("invalid binary operation {operator} on {lhs:?} and {rhs:?}")
        }
    }
}

fn identity_eq(lhs: Value, rhs: Value) -> bool {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Char(a), Value::Char(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Ptr(a), Value::Ptr(b)) => a == b,
        (Value::Unit, Value::Unit) => true,
        (lhs, rhs) => panic!("identity comparison between {lhs:?} and {rhs:?}"),
    }
}

fn int_like(value: Value) -> i64 {
    match value {
        Value::Int(n) => n,
        Value::Char(c) => c as i64,
        other => panic!("ordering comparison on {other:?}"),
    }
}
