//! Textual rendering of LIR modules: colored for terminals, stripped of
//! ANSI escapes when the module is emitted as the compiler's output.

use colored::Colorize;
use itertools::Itertools;

use crate::{index::Index, middle::lir};

/// Renders the whole module: extern declarations, statics, storage slots,
/// then every function with its labeled blocks.
pub fn render_module(module: &lir::Module) -> String {
    let mut out = String::new();

    for external in &module.externals {
        out.push_str(&format!(
            "{} {}({}) -> {}\n",
            "declare".magenta(),
            external.name.value().blue(),
            external.params.iter().map(|ty| ty.to_string()).join(", "),
            external.return_ty
        ));
    }
    out.push('\n');

    for (id, data) in module.statics.enumerate() {
        let escaped: String = data
            .bytes
            .iter()
            .flat_map(|b| std::ascii::escape_default(*b))
            .map(char::from)
            .collect();
        out.push_str(&format!(
            "{} __$static_alloc_{} = b\"{}\"\n",
            "static".magenta(),
            id.index(),
            escaped
        ));
    }
    if !module.statics.is_empty() {
        out.push('\n');
    }

    for slot in module.globals.iter() {
        out.push_str(&format!(
            "{} {}: {}\n",
            "global".magenta(),
            format!("@{}", slot.name.value()).green(),
            slot.ty
        ));
    }
    if !module.globals.is_empty() {
        out.push('\n');
    }

    for function in module.functions.iter() {
        out.push_str(&render_function(function));
        out.push('\n');
    }

    out
}

/// The plain-text form handed to the backend (and to the malformed-module
/// report)
pub fn render_plain(module: &lir::Module) -> String {
    strip_ansi_escapes::strip_str(render_module(module))
}

pub fn render_function(function: &lir::FunctionDefinition) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "{} {}{}",
        "fn".magenta(),
        function.name.value().blue(),
        "(".white()
    ));

    out.push_str(
        &function
            .params
            .iter()
            .map(|param| format!("{}: {}", param, function.registers[*param].ty))
            .join(", "),
    );

    out.push_str(&format!(") -> {} {{\n", function.return_ty));

    for block in function.blocks.iter() {
        out.push_str(&format!("{}\n", format!("{}:", block.id).bright_red()));

        for instruction in &block.instructions {
            out.push_str(&format!("    {instruction}\n"));
        }
    }

    out.push_str("}\n");
    out
}

impl core::fmt::Display for lir::Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            lir::Instruction::Move {
                destination,
                source,
            } => {
                write!(f, "{destination} {} {source}", "=".white())
            }
            lir::Instruction::UnaryOperation {
                operator,
                destination,
                operand,
            } => {
                write!(
                    f,
                    "{destination} {} {} {operand}",
                    "=".white(),
                    operator.to_string().cyan()
                )
            }
            lir::Instruction::BinaryOperation {
                operator,
                destination,
                lhs,
                rhs,
            } => {
                write!(
                    f,
                    "{destination} {} {} {lhs}, {rhs}",
                    "=".white(),
                    operator.to_string().cyan()
                )
            }
            lir::Instruction::LoadMem {
                destination,
                address,
            } => {
                write!(f, "{destination} {} {} {address}", "=".white(), "load".cyan())
            }
            lir::Instruction::StoreMem { address, source } => {
                write!(f, "{} {address} {} {source}", "store".cyan(), "<-".white())
            }
            lir::Instruction::GetStructElementPointer {
                destination,
                source,
                ty,
                index,
            } => {
                write!(
                    f,
                    "{destination} {} {} {source}, {}, {}",
                    "=".white(),
                    "get_struct_element_ptr".cyan(),
                    lir::Type::Struct(ty.clone()),
                    index.to_string().purple()
                )
            }
            lir::Instruction::GetArrayElementPointer {
                destination,
                source,
                ty,
                index,
            } => {
                write!(
                    f,
                    "{destination} {} {} {source}, {ty}, {index}",
                    "=".white(),
                    "get_array_element_ptr".cyan()
                )
            }
            lir::Instruction::Branch {
                condition,
                positive,
                negative,
            } => {
                write!(
                    f,
                    "{} {condition} {} {}",
                    "br".cyan(),
                    positive.to_string().blue(),
                    negative.to_string().blue()
                )
            }
            lir::Instruction::Jump { destination } => {
                write!(f, "{} {}", "jmp".cyan(), destination.to_string().blue())
            }
            lir::Instruction::Phi {
                destination,
                sources,
            } => {
                write!(
                    f,
                    "{destination} {} {}{}{}{}",
                    "=".white(),
                    "phi".bright_green(),
                    "(".white(),
                    sources
                        .iter()
                        .map(|(block, value)| format!(
                            "{} -> {value}",
                            block.to_string().blue()
                        ))
                        .join(", "),
                    ")".white()
                )
            }
            lir::Instruction::Call {
                target,
                arguments,
                destination,
            } => {
                if let Some(destination) = destination {
                    write!(f, "{destination} {} ", "=".white())?;
                }
                write!(
                    f,
                    "{} {target}({})",
                    "call".cyan(),
                    arguments.iter().map(|arg| arg.to_string()).join(", ")
                )
            }
            lir::Instruction::Return { value: Some(value) } => {
                write!(f, "{} {value}", "ret".cyan())
            }
            lir::Instruction::Return { value: None } => {
                write!(f, "{}", "ret".cyan())
            }
            lir::Instruction::Unreachable => write!(f, "{}", "unreachable".cyan()),
        }
    }
}

impl core::fmt::Display for lir::RegisterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format!("%{}", self.index()).yellow())
    }
}

impl core::fmt::Display for lir::BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, ".label_{}", self.index())
    }
}

impl core::fmt::Display for lir::Immediate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            lir::Immediate::Int(value) => write!(f, "{value}"),
            lir::Immediate::Float(value) => write!(f, "{value}"),
            lir::Immediate::Char(value) => {
                write!(f, "'{}'", (*value as char).escape_default())
            }
            lir::Immediate::Bool(value) => write!(f, "{value}"),
            lir::Immediate::Unit => write!(f, "()"),
            lir::Immediate::StaticLabel(id) => {
                write!(f, "__$static_alloc_{}", id.index())
            }
            lir::Immediate::GlobalLabel(name) => write!(f, "@{}", name.value()),
            lir::Immediate::FunctionLabel(name) => write!(f, "{}", name.value()),
        }
    }
}

impl core::fmt::Display for lir::Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            lir::Operand::Immediate(immediate) => {
                write!(f, "{}", immediate.to_string().purple())
            }
            lir::Operand::Register(register) => write!(f, "{register}"),
        }
    }
}

impl core::fmt::Display for lir::Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            lir::Type::I1 => write!(f, "i1"),
            lir::Type::I8 => write!(f, "i8"),
            lir::Type::I64 => write!(f, "i64"),
            lir::Type::F64 => write!(f, "f64"),
            lir::Type::Ptr => write!(f, "ptr"),
            lir::Type::Unit => write!(f, "unit"),
            lir::Type::Struct(fields) => {
                write!(f, "{{ ")?;
                for (i, field) in fields.0.iter().enumerate() {
                    write!(f, "{field}")?;
                    if i != fields.0.len() - 1 {
                        write!(f, ", ")?;
                    }
                }
                write!(f, " }}")
            }
        }
    }
}
