use codec::decoder::{TranslateError, translate};
use codec::plan::{Plan, PlanInstr, PlanOp};
use codec::wire;
use vm::ir::OpCode;
use vm::rt::{KeyClass, TypeDesc};

fn op(op: PlanOp) -> PlanInstr {
    PlanInstr::new(op)
}

#[test]
fn odd_int_widths_are_rejected() {
    for width in [0i64, 3, 5, 16] {
        let plan = vec![op(PlanOp::Int).with_iv(width), op(PlanOp::Halt)];
        assert_eq!(
            translate(&plan).expect_err("width must be rejected"),
            TranslateError::IntWidth(width)
        );
    }
}

#[test]
fn missing_type_descriptor_is_rejected() {
    let plan = vec![op(PlanOp::MapAlloc), op(PlanOp::Halt)];
    assert_eq!(
        translate(&plan).expect_err("map_alloc needs a descriptor"),
        TranslateError::MissingTypeDesc(0)
    );
}

#[test]
fn oversized_field_ids_are_rejected() {
    let plan = vec![op(PlanOp::StructMarkTag).with_iv(4096), op(PlanOp::Halt)];
    assert_eq!(
        translate(&plan).expect_err("field id past the bitmap"),
        TranslateError::FieldOutOfRange(4096)
    );
}

#[test]
fn prologue_loads_the_invocation_arguments() {
    let plan: Plan = vec![op(PlanOp::Halt)];
    let program = translate(&plan).expect("halt-only plan translates");
    let ins = program.ins();
    assert_eq!(ins[0].op, OpCode::Ldap); // buf
    assert_eq!(ins[1].op, OpCode::Ldaq); // i
    assert_eq!(ins[2].op, OpCode::Ldap); // p
    assert_eq!(ins[3].op, OpCode::Ldap); // rs
    assert_eq!(ins[4].op, OpCode::Ldaq); // st
    assert_eq!(ins[5].op, OpCode::Jal); // halt lowers to a jump at the epilogue
}

#[test]
fn struct_switch_builds_a_dense_table() {
    let plan = vec![
        op(PlanOp::StructSwitch).with_sw(vec![-1, 2, -1, 3]),
        op(PlanOp::StructSkip),
        op(PlanOp::Halt),
        op(PlanOp::Halt),
    ];
    let program = translate(&plan).expect("switch plan translates");
    let bsw = program
        .ins()
        .iter()
        .find(|i| i.op == OpCode::Bsw)
        .expect("a bsw instruction");
    let table = bsw.sw.as_ref().expect("switch table resolved");
    assert_eq!(table.len(), 4);
    assert_eq!(table[0], -1);
    assert_eq!(table[2], -1);
    assert!(table[1] >= 0);
    assert!(table[3] >= 0);
    assert_ne!(table[1], table[3]);
}

#[test]
fn every_branch_lands_inside_the_program() {
    let vt = TypeDesc::map("map<i32,u32>", KeyClass::I32, 4, 4);
    let record = TypeDesc::record("R", 8);
    let plan = vec![
        op(PlanOp::StructBitmap).with_sw(vec![1]),
        op(PlanOp::StructReadType),
        op(PlanOp::StructIsStop).with_to(9),
        op(PlanOp::StructSwitch).with_sw(vec![-1, 5]),
        op(PlanOp::StructSkip),
        op(PlanOp::StructMarkTag).with_iv(1),
        op(PlanOp::MapAlloc).with_vt(&vt),
        op(PlanOp::MapSetStr).with_vt(&vt),
        op(PlanOp::Goto).with_to(1),
        op(PlanOp::StructRequire).with_sw(vec![1]).with_vt(&record),
        op(PlanOp::Halt),
    ];
    let program = translate(&plan).expect("plan translates");
    let len = program.len() as u32;
    for ins in program.ins() {
        match ins.op {
            OpCode::Beq
            | OpCode::Bne
            | OpCode::Blt
            | OpCode::Bltu
            | OpCode::Bgeu
            | OpCode::Beqn
            | OpCode::Bnen
            | OpCode::Jal => {
                assert!(ins.br < len, "branch target {} out of range", ins.br);
            }
            OpCode::Bsw => {
                for &slot in ins.sw.as_ref().expect("resolved table").iter() {
                    assert!(
                        slot == -1 || (slot as u32) < len,
                        "switch slot {slot} out of range"
                    );
                }
            }
            _ => {}
        }
    }
}

#[test]
fn fast_and_safe_map_lowerings_differ() {
    let fast = TypeDesc::map("fast", KeyClass::I64, 8, 4);
    let safe = TypeDesc::map_opaque("safe", 8, 4);
    assert!(fast.is_fast_map());
    assert!(!safe.is_fast_map());

    let fast_plan = vec![op(PlanOp::MapSetI64).with_vt(&fast), op(PlanOp::Halt)];
    let safe_plan = vec![op(PlanOp::MapSetI64).with_vt(&safe), op(PlanOp::Halt)];
    let fast_len = translate(&fast_plan).expect("fast translates").len();
    let safe_len = translate(&safe_plan).expect("safe translates").len();
    // the safe path materializes the key into runtime state first
    assert!(safe_len > fast_len);
}

#[test]
fn type_check_uses_the_wire_tag() {
    let plan = vec![
        op(PlanOp::Type).with_tx(wire::T_I64),
        op(PlanOp::Int).with_iv(8),
        op(PlanOp::Halt),
    ];
    let program = translate(&plan).expect("typed plan translates");
    let check = program
        .ins()
        .iter()
        .find(|i| i.op == OpCode::Addi && i.iv == wire::T_I64 as i64)
        .expect("expected-tag immediate");
    assert_eq!(check.iv, 10);
}
