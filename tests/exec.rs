//! End-to-end tests: compile whole methods and execute the allocated IR on
//! the machine model in `common`, checking observable results — return
//! values, repair behavior at block boundaries, ABI argument binding,
//! caller-saved survival across calls, and spilling under pressure.

mod common;

use common::{check_invariants, compile, compile_body, run, Externs};
use stackjit::bytecode::asm::BodyAsm;
use stackjit::bytecode::{MethodDef, Module, Signature, Ty};
use stackjit::ir::Op;

fn has_op(compiled: &stackjit::CompiledMethod, op: Op) -> bool {
    let g = &compiled.graph;
    g.block_ids()
        .any(|bb| g.ins_ids(bb).iter().any(|&i| g.ins(i).op == op))
}

#[test]
fn test_return_zero() {
    let body = BodyAsm::new().ldc(0).ret().finish();
    let len = body.len() as u32;
    let compiled = compile_body("zero", 0, Ty::Int, body);
    check_invariants(&compiled, len);

    // One real block plus the epilogue; a single constant feeds the return.
    assert_eq!(compiled.graph.block_count(), 2);
    let entry_ops: Vec<Op> = compiled
        .graph
        .ins_ids(compiled.graph.entry)
        .iter()
        .map(|&i| compiled.graph.ins(i).op)
        .collect();
    assert_eq!(entry_ops.iter().filter(|&&op| op == Op::IConst).count(), 1);

    assert_eq!(run(&compiled, &[], &Externs::new()), 0);
}

#[test]
fn test_return_sum_of_args() {
    let body = BodyAsm::new().ldarg(0).ldarg(1).add().ret().finish();
    let len = body.len() as u32;
    let compiled = compile_body("add2", 2, Ty::Int, body);
    check_invariants(&compiled, len);

    assert_eq!(run(&compiled, &[4, 3], &Externs::new()), 7);
    assert_eq!(run(&compiled, &[-10, 10], &Externs::new()), 0);
}

#[test]
fn test_compare_and_branch() {
    let body = BodyAsm::new()
        .ldarg(0)
        .ldarg(1)
        .bgt("one")
        .ldc(2)
        .ret()
        .label("one")
        .ldc(1)
        .ret()
        .finish();
    let len = body.len() as u32;
    let compiled = compile_body("pick", 2, Ty::Int, body);
    check_invariants(&compiled, len);

    assert_eq!(run(&compiled, &[10, 20], &Externs::new()), 2);
    assert_eq!(run(&compiled, &[30, 20], &Externs::new()), 1);
    assert_eq!(run(&compiled, &[20, 20], &Externs::new()), 2);
}

#[test]
fn test_counting_loop_with_back_edge() {
    // for (i = 0; i < 10; ++i) res += i;  =>  45
    let body = BodyAsm::new()
        .ldc(0)
        .stloc(0)
        .ldc(0)
        .stloc(1)
        .br("cond")
        .label("body")
        .ldloc(0)
        .ldloc(1)
        .add()
        .stloc(0)
        .ldloc(1)
        .ldc(1)
        .add()
        .stloc(1)
        .label("cond")
        .ldloc(1)
        .ldc(10)
        .blt("body")
        .ldloc(0)
        .ret()
        .finish();
    let len = body.len() as u32;
    let compiled = compile_body("count", 0, Ty::Int, body);
    check_invariants(&compiled, len);

    // entry, body, cond, exit, epilogue — and the loop ran.
    assert_eq!(compiled.graph.block_count(), 5);
    assert_eq!(run(&compiled, &[], &Externs::new()), 45);
}

#[test]
fn test_loop_over_argument_bound() {
    // Same loop with an argument bound, so a value is live around the
    // back edge from entry through exit.
    let body = BodyAsm::new()
        .ldc(0)
        .stloc(0)
        .ldc(0)
        .stloc(1)
        .br("cond")
        .label("body")
        .ldloc(0)
        .ldloc(1)
        .add()
        .stloc(0)
        .ldloc(1)
        .ldc(1)
        .add()
        .stloc(1)
        .label("cond")
        .ldloc(1)
        .ldarg(0)
        .blt("body")
        .ldloc(0)
        .ret()
        .finish();
    let len = body.len() as u32;
    let compiled = compile_body("countn", 1, Ty::Int, body);
    check_invariants(&compiled, len);

    assert_eq!(run(&compiled, &[10], &Externs::new()), 45);
    assert_eq!(run(&compiled, &[0], &Externs::new()), 0);
    assert_eq!(run(&compiled, &[100], &Externs::new()), 4950);
}

#[test]
fn test_argument_collision_forces_swap_repair() {
    // swapped(a, b) = helper(b, a): the natural assignment leaves a in RDI
    // and b in RSI, but the call wants them exchanged — a two-cycle the
    // entry repair resolves with a swap.
    let mut module = Module::new();
    let token = module.push(MethodDef::new(
        "helper",
        Signature::new(2, Ty::Int),
        BodyAsm::new().ldarg(0).ret().finish(),
    ));
    let index = module.push(MethodDef::new(
        "swapped",
        Signature::new(2, Ty::Int),
        BodyAsm::new().ldarg(1).ldarg(0).call(token).ret().finish(),
    ));
    let compiled = compile(&module, index);

    assert!(has_op(&compiled, Op::Swap), "expected a swap repair");
    // helper(x, y) = x + 2y, deliberately asymmetric.
    let externs = Externs::new().with("helper", 2, |args| args[0] + 2 * args[1]);
    assert_eq!(run(&compiled, &[7, 9], &externs), 9 + 2 * 7);
}

#[test]
fn test_value_survives_call_clobbering() {
    // x = 5; return leaf(3) + x — x must survive the caller-saved wipe.
    let mut module = Module::new();
    let token = module.push(MethodDef::new(
        "leaf",
        Signature::new(1, Ty::Int),
        BodyAsm::new().ldarg(0).ret().finish(),
    ));
    let index = module.push(MethodDef::new(
        "keeper",
        Signature::new(0, Ty::Int),
        BodyAsm::new()
            .ldc(5)
            .stloc(0)
            .ldc(3)
            .call(token)
            .ldloc(0)
            .add()
            .ret()
            .finish(),
    ));
    let compiled = compile(&module, index);
    assert!(!compiled.callee_saved.is_empty());

    let externs = Externs::new().with("leaf", 1, |args| args[0] * 2);
    assert_eq!(run(&compiled, &[], &externs), 6 + 5);
}

#[test]
fn test_call_arguments_bind_right_to_left() {
    let mut module = Module::new();
    let token = module.push(MethodDef::new(
        "digits",
        Signature::new(3, Ty::Int),
        BodyAsm::new().ldarg(0).ret().finish(),
    ));
    let index = module.push(MethodDef::new(
        "caller",
        Signature::new(0, Ty::Int),
        BodyAsm::new()
            .ldc(1)
            .ldc(2)
            .ldc(3)
            .call(token)
            .ret()
            .finish(),
    ));
    let compiled = compile(&module, index);

    let externs = Externs::new().with("digits", 3, |args| {
        args[0] + 10 * args[1] + 100 * args[2]
    });
    assert_eq!(run(&compiled, &[], &externs), 321);
}

#[test]
fn test_void_call_clobbers_and_continues() {
    let mut module = Module::new();
    let token = module.push(MethodDef::new(
        "notify",
        Signature::new(1, Ty::Void),
        BodyAsm::new().ret().finish(),
    ));
    let index = module.push(MethodDef::new(
        "notifier",
        Signature::new(0, Ty::Int),
        BodyAsm::new()
            .ldc(9)
            .stloc(0)
            .ldc(1)
            .call(token)
            .ldloc(0)
            .ret()
            .finish(),
    ));
    let compiled = compile(&module, index);

    let externs = Externs::new().with("notify", 1, |_| 0);
    assert_eq!(run(&compiled, &[], &externs), 9);
}

#[test]
fn test_register_pressure_spills() {
    let mut asm = BodyAsm::new();
    for i in 0..16 {
        asm.ldc(i as i32 + 1).stloc(i);
    }
    asm.ldloc(0);
    for i in 1..16 {
        asm.ldloc(i).add();
    }
    asm.ret();
    let body = asm.finish();
    let len = body.len() as u32;
    let compiled = compile_body("pressure", 0, Ty::Int, body);
    check_invariants(&compiled, len);

    assert!(compiled.spill_slots > 0);
    assert_eq!(run(&compiled, &[], &Externs::new()), (1..=16).sum::<i64>());
}

#[test]
fn test_constant_folding_preserves_results() {
    // The same select, written with literals and with variables holding
    // those literals, must agree for all inputs.
    let folded_body = BodyAsm::new()
        .ldc(2)
        .ldarg(0)
        .brtrue("t")
        .ldc(4)
        .add()
        .ret()
        .label("t")
        .ldc(3)
        .add()
        .ret()
        .finish();
    let folded_len = folded_body.len() as u32;
    let folded = compile_body("folded", 1, Ty::Int, folded_body);
    check_invariants(&folded, folded_len);

    let unfolded_body = BodyAsm::new()
        .ldc(2)
        .stloc(0)
        .ldc(4)
        .stloc(1)
        .ldc(3)
        .stloc(2)
        .ldloc(0)
        .ldarg(0)
        .brtrue("t")
        .ldloc(1)
        .add()
        .ret()
        .label("t")
        .ldloc(2)
        .add()
        .ret()
        .finish();
    let unfolded_len = unfolded_body.len() as u32;
    let unfolded = compile_body("unfolded", 1, Ty::Int, unfolded_body);
    check_invariants(&unfolded, unfolded_len);

    for input in [0, 1, -3] {
        let a = run(&folded, &[input], &Externs::new());
        let b = run(&unfolded, &[input], &Externs::new());
        assert_eq!(a, b, "folded and unfolded disagree for {input}");
        assert_eq!(a, if input != 0 { 5 } else { 6 });
    }

    // And the constant-carrying version actually folded.
    assert!(!has_op(&folded, Op::Add));
    assert!(!has_op(&folded, Op::AddI));
}

#[test]
fn test_arguments_flow_through_loop() {
    // Decrement arg0 down to zero, accumulating into arg1's slot; the
    // argument registers are live around the back edge and must be
    // repaired consistently.
    let body = BodyAsm::new()
        .br("cond")
        .label("body")
        .ldarg(1)
        .ldarg(0)
        .add()
        .starg(1)
        .ldarg(0)
        .ldc(-1)
        .add()
        .starg(0)
        .label("cond")
        .ldarg(0)
        .brtrue("body")
        .ldarg(1)
        .ret()
        .finish();
    let len = body.len() as u32;
    let compiled = compile_body("accum", 2, Ty::Int, body);
    check_invariants(&compiled, len);

    assert_eq!(run(&compiled, &[4, 0], &Externs::new()), 4 + 3 + 2 + 1);
    assert_eq!(run(&compiled, &[0, 11], &Externs::new()), 11);
}
