//! Structural verification of a generated module.
//!
//! Runs after lowering and before the module is handed out. A failure
//! here is a compiler defect, not a user error, so the caller aborts the
//! compilation and prints the offending module alongside the reason.

use crate::{
    index::Index,
    middle::lir::{self, Instruction, Operand},
};

pub fn verify_module(module: &lir::Module) -> Result<(), String> {
    for function in module.functions.iter() {
        verify_function(module, function)
            .map_err(|reason| format!("in fn {}: {reason}", function.name))?;
    }

    Ok(())
}

fn verify_function(
    module: &lir::Module,
    function: &lir::FunctionDefinition,
) -> Result<(), String> {
    if function.blocks.is_empty() {
        return Err("function has no blocks".into());
    }

    for param in &function.params {
        if function.registers.get(*param).is_none() {
            return Err(format!("parameter register %{} does not exist", param.index()));
        }
    }

    for block in function.blocks.iter() {
        verify_block(module, function, block)
            .map_err(|reason| format!("block .label_{}: {reason}", block.id.index()))?;
    }

    Ok(())
}

fn verify_block(
    module: &lir::Module,
    function: &lir::FunctionDefinition,
    block: &lir::Block,
) -> Result<(), String> {
    let Some(last) = block.instructions.last() else {
        return Err("block is empty".into());
    };

    if !last.is_terminator() {
        return Err("block does not end in a terminator".into());
    }

    for (i, instruction) in block.instructions.iter().enumerate() {
        if instruction.is_terminator() && i != block.instructions.len() - 1 {
            return Err("terminator in the middle of a block".into());
        }

        verify_instruction(module, function, block, instruction)?;
    }

    Ok(())
}

fn verify_instruction(
    module: &lir::Module,
    function: &lir::FunctionDefinition,
    block: &lir::Block,
    instruction: &Instruction,
) -> Result<(), String> {
    for operand in instruction_operands(instruction) {
        verify_operand(module, function, operand)?;
    }

    if let Some(destination) = instruction_destination(instruction) {
        if function.registers.get(destination).is_none() {
            return Err(format!(
                "destination register %{} does not exist",
                destination.index()
            ));
        }
    }

    match instruction {
        Instruction::Branch {
            positive, negative, ..
        } => {
            verify_target(function, *positive)?;
            verify_target(function, *negative)?;
        }
        Instruction::Jump { destination } => verify_target(function, *destination)?,
        Instruction::Phi { sources, .. } => {
            if sources.is_empty() {
                return Err("phi with no incoming values".into());
            }

            for (source, _) in sources {
                verify_target(function, *source)?;

                if !block.predecessors.contains(source) {
                    return Err(format!(
                        "phi source .label_{} is not a predecessor",
                        source.index()
                    ));
                }
            }
        }
        Instruction::Call {
            target, arguments, ..
        } => {
            if let Operand::Immediate(lir::Immediate::FunctionLabel(name)) = target {
                let arity = if let Some(callee) = module.function_named(*name) {
                    callee.params.len()
                } else if let Some(external) = module.external_named(*name) {
                    external.params.len()
                } else {
                    return Err(format!("call target {name} is not declared"));
                };

                if arguments.len() != arity {
                    return Err(format!(
                        "call to {name} passes {} arguments, expected {arity}",
                        arguments.len()
                    ));
                }
            }
        }
        _ => {}
    }

    Ok(())
}

fn verify_target(function: &lir::FunctionDefinition, target: lir::BlockId) -> Result<(), String> {
    if function.blocks.get(target).is_none() {
        return Err(format!("jump target .label_{} does not exist", target.index()));
    }
    Ok(())
}

fn verify_operand(
    module: &lir::Module,
    function: &lir::FunctionDefinition,
    operand: &Operand,
) -> Result<(), String> {
    match operand {
        Operand::Register(register) => {
            if function.registers.get(*register).is_none() {
                return Err(format!("register %{} does not exist", register.index()));
            }
        }
        Operand::Immediate(lir::Immediate::GlobalLabel(name)) => {
            if module.global_named(*name).is_none() {
                return Err(format!("global @{name} does not exist"));
            }
        }
        Operand::Immediate(lir::Immediate::StaticLabel(id)) => {
            if module.statics.get(*id).is_none() {
                return Err(format!("static __$static_alloc_{} does not exist", id.index()));
            }
        }
        Operand::Immediate(lir::Immediate::FunctionLabel(name)) => {
            if module.function_named(*name).is_none() && module.external_named(*name).is_none() {
                return Err(format!("function {name} is not declared"));
            }
        }
        Operand::Immediate(_) => {}
    }

    Ok(())
}

fn instruction_destination(instruction: &Instruction) -> Option<lir::RegisterId> {
    match instruction {
        Instruction::Move { destination, .. }
        | Instruction::UnaryOperation { destination, .. }
        | Instruction::BinaryOperation { destination, .. }
        | Instruction::LoadMem { destination, .. }
        | Instruction::GetStructElementPointer { destination, .. }
        | Instruction::GetArrayElementPointer { destination, .. }
        | Instruction::Phi { destination, .. } => Some(*destination),
        Instruction::Call { destination, .. } => *destination,
        Instruction::StoreMem { .. }
        | Instruction::Branch { .. }
        | Instruction::Jump { .. }
        | Instruction::Return { .. }
        | Instruction::Unreachable => None,
    }
}

fn instruction_operands(instruction: &Instruction) -> Vec<&Operand> {
    match instruction {
        Instruction::Move { source, .. } => vec![source],
        Instruction::UnaryOperation { operand, .. } => vec![operand],
        Instruction::BinaryOperation { lhs, rhs, .. } => vec![lhs, rhs],
        Instruction::LoadMem { address, .. } => vec![address],
        Instruction::StoreMem { address, source } => vec![address, source],
        Instruction::GetStructElementPointer { source, .. } => vec![source],
        Instruction::GetArrayElementPointer { source, index, .. } => vec![source, index],
        Instruction::Branch { condition, .. } => vec![condition],
        Instruction::Phi { sources, .. } => sources.iter().map(|(_, value)| value).collect(),
        Instruction::Call {
            target, arguments, ..
        } => {
            let mut operands = vec![target];
            operands.extend(arguments.iter());
            operands
        }
        Instruction::Return { value: Some(value) } => vec![value],
        Instruction::Return { value: None }
        | Instruction::Jump { .. }
        | Instruction::Unreachable => Vec::new(),
    }
}
