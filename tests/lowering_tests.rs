//! Structural tests over the emitted LIR: block shapes, the string
//! static layout, the activation bracket, and the generated ADT
//! procedures.

mod common;

use common::*;
use lumec::{
    compile_program,
    frontend::ast::BinaryOperatorKind,
    middle::{
        lir::{self, Immediate, Instruction, Operand},
        ty::Type,
    },
};

fn compile(mut program: lumec::frontend::ast::Program) -> lir::Module {
    compile_program(&mut program).expect("program should compile")
}

fn function_with_prefix<'m>(
    module: &'m lir::Module,
    prefix: &str,
) -> &'m lir::FunctionDefinition {
    module
        .functions
        .iter()
        .find(|f| f.name.value().starts_with(prefix))
        .unwrap_or_else(|| panic!("no function starting with {prefix}"))
}

fn calls_in(block: &lir::Block) -> Vec<&str> {
    block
        .instructions
        .iter()
        .filter_map(|i| match i {
            Instruction::Call {
                target: Operand::Immediate(Immediate::FunctionLabel(name)),
                ..
            } => Some(name.value()),
            _ => None,
        })
        .collect()
}

#[test]
fn main_ends_by_returning_zero() {
    let module = compile(program(vec![constant(
        "u",
        Type::unit(),
        call("print_int", vec![int(1)]),
    )]));

    let main = module.function_named(sym("main")).expect("main exists");
    let returns_zero = main.blocks.iter().any(|block| {
        matches!(
            block.instructions.last(),
            Some(Instruction::Return {
                value: Some(Operand::Immediate(Immediate::Int(0)))
            })
        )
    });

    assert!(returns_zero);
}

#[test]
fn runtime_primitives_are_declared_under_their_storage_names() {
    let module = compile(program(vec![]));

    // print_int is registered first and so carries slot 0
    assert!(module.external_named(sym("print_int_0")).is_some());
    assert!(module.external_named(sym("malloc")).is_some());
    assert!(module.external_named(sym("exit")).is_some());

    let strcmp = module
        .externals
        .iter()
        .find(|e| e.name.value().starts_with("strcmp"))
        .expect("strcmp is declared");
    assert_eq!(strcmp.params.len(), 2, "curried signatures are flattened");
}

#[test]
fn string_literals_are_length_prefixed_and_nul_terminated() {
    let module = compile(program(vec![constant(
        "u",
        Type::unit(),
        call("print_string", vec![string("hi")]),
    )]));

    let data = &module.statics.iter().next().expect("one static").bytes;
    let mut expected = 2u64.to_le_bytes().to_vec();
    expected.extend_from_slice(b"hi");
    expected.push(0);

    assert_eq!(*data, expected);
}

#[test]
fn conditionals_merge_through_a_phi() {
    let module = compile(program(vec![constant(
        "x",
        Type::int(),
        if_else(boolean(true), int(1), int(2)),
    )]));

    let main = module.function_named(sym("main")).unwrap();
    let has_phi = main
        .blocks
        .iter()
        .flat_map(|b| b.instructions.iter())
        .any(|i| matches!(i, Instruction::Phi { .. }));

    assert!(has_phi);
}

#[test]
fn function_bodies_get_the_save_restore_bracket() {
    let module = compile(program(vec![
        function(
            true,
            "f",
            vec![("n", Type::int())],
            Type::int(),
            if_else(
                binary(ident("n"), BinaryOperatorKind::StructuralEquals, int(0)),
                int(0),
                call("f", vec![binary(ident("n"), BinaryOperatorKind::Subtract, int(1))]),
            ),
        ),
        constant("r", Type::int(), call("f", vec![int(2)])),
    ]));

    let f = function_with_prefix(&module, "f_");

    // Entry block allocates the backup record and snapshots the
    // parameter slot before any body code runs
    let head = &f.blocks[lir::BlockId::ZERO];
    assert!(calls_in(head).contains(&"malloc"));
    assert!(
        head.instructions
            .iter()
            .any(|i| matches!(i, Instruction::StoreMem { .. })),
        "the head stores the snapshot into the backup record"
    );

    // Some block restores and releases the backup and carries the return
    let tail = f
        .blocks
        .iter()
        .find(|b| calls_in(b).contains(&"free"))
        .expect("a block frees the backup record");
    assert!(matches!(
        tail.instructions.last(),
        Some(Instruction::Return { value: Some(_) })
    ));
}

#[test]
fn bracket_saves_own_slots_but_not_enclosing_ones() {
    let module = compile(program(vec![
        mutable("acc", Type::int()),
        function(
            true,
            "f",
            vec![("n", Type::int())],
            Type::int(),
            seq(vec![
                assign(
                    ident("acc"),
                    binary(deref(ident("acc")), BinaryOperatorKind::Add, ident("n")),
                ),
                int(0),
            ]),
        ),
    ]));

    let f = function_with_prefix(&module, "f_");
    let head = &f.blocks[lir::BlockId::ZERO];

    let snapshotted: Vec<&str> = head
        .instructions
        .iter()
        .filter_map(|i| match i {
            Instruction::LoadMem {
                address: Operand::Immediate(Immediate::GlobalLabel(name)),
                ..
            } => Some(name.value()),
            _ => None,
        })
        .collect();

    assert!(
        snapshotted.iter().any(|name| name.starts_with("n_")),
        "the parameter slot is saved"
    );
    assert!(
        !snapshotted.iter().any(|name| name.starts_with("acc_")),
        "writes to enclosing bindings must survive the call"
    );
}

#[test]
fn loop_counters_are_included_in_the_enclosing_bracket() {
    let module = compile(program(vec![function(
        true,
        "f",
        vec![("n", Type::int())],
        Type::unit(),
        for_loop("i", int(1), ident("n"), false, unit()),
    )]));

    let f = function_with_prefix(&module, "f_");
    let head = &f.blocks[lir::BlockId::ZERO];

    let snapshotted: Vec<&str> = head
        .instructions
        .iter()
        .filter_map(|i| match i {
            Instruction::LoadMem {
                address: Operand::Immediate(Immediate::GlobalLabel(name)),
                ..
            } => Some(name.value()),
            _ => None,
        })
        .collect();

    assert!(snapshotted.iter().any(|name| name.starts_with("i_")));
}

#[test]
fn array_definitions_write_the_dimension_header() {
    let module = compile(program(vec![mutable_array(
        "a",
        vec![int(2), int(3)],
        Type::int(),
    )]));

    let main = module.function_named(sym("main")).unwrap();

    // Negative header offsets for the two extents
    let header_offsets: Vec<i64> = main
        .blocks
        .iter()
        .flat_map(|b| b.instructions.iter())
        .filter_map(|i| match i {
            Instruction::GetArrayElementPointer {
                index: Operand::Immediate(Immediate::Int(n)),
                ..
            } if *n < 0 => Some(*n),
            _ => None,
        })
        .collect();

    assert_eq!(header_offsets, vec![-1, -2]);
}

#[test]
fn algebraic_types_emit_constructor_and_comparator_procedures() {
    let module = compile(program(vec![type_def(
        "color",
        vec![("Red", vec![]), ("Green", vec![Type::int()])],
    )]));

    assert!(module.function_named(sym("color_cmp")).is_some());

    let red = function_with_prefix(&module, "Red_");
    assert!(!red.name.value().ends_with("_cmp"));
    assert!(calls_in(&red.blocks[lir::BlockId::ZERO]).contains(&"malloc"));

    let green = function_with_prefix(&module, "Green_");
    assert_eq!(green.params.len(), 1, "one field, one constructor argument");

    assert!(
        module
            .functions
            .iter()
            .any(|f| f.name.value().starts_with("Red_") && f.name.value().ends_with("_cmp")),
        "each constructor gets its own comparator"
    );
}

#[test]
fn no_match_fault_prints_and_exits_nonzero() {
    let module = compile(program(vec![constant(
        "x",
        Type::int(),
        match_expr(int(1), vec![(pat_int(2), int(0))]),
    )]));

    let main = module.function_named(sym("main")).unwrap();

    let fault = main
        .blocks
        .iter()
        .find(|b| calls_in(b).contains(&"exit"))
        .expect("a block calls exit");
    assert!(calls_in(fault).iter().any(|c| c.starts_with("print_string")));
    assert!(matches!(
        fault.instructions.last(),
        Some(Instruction::Unreachable)
    ));
}

#[test]
fn rendered_module_lists_declarations_and_functions() {
    let module = compile(program(vec![constant(
        "u",
        Type::unit(),
        call("print_int", vec![int(1)]),
    )]));

    let text = lumec::middle::lir::pretty_print::render_plain(&module);

    assert!(text.contains("declare print_int_0(i64) -> unit"));
    assert!(text.contains("fn main() -> i64 {"));
    assert!(text.contains(".label_0:"));
    assert!(!text.contains('\u{1b}'), "plain rendering carries no ANSI escapes");
}
