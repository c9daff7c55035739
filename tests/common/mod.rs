//! Test harness: executes a compiled method's allocated IR on a small
//! machine model. Registers start as junk, arguments arrive in their ABI
//! registers, calls dispatch to native closures and clobber the
//! caller-saved set, and the return value is read from RAX — so an
//! allocation or repair mistake surfaces as a wrong result or a read of
//! junk, not as a silently passing test.

use std::collections::HashMap;

use stackjit::bytecode::{MethodDef, Module, Signature, Ty};
use stackjit::compiler::{CompiledMethod, Compiler};
use stackjit::ir::block::FlowGraph;
use stackjit::ir::{BlockId, Op, Operand};
use stackjit::x64::{CallConv, Register};

const JUNK: i64 = 0x5EED_5EED_5EED;

pub type ExternFn = fn(&[i64]) -> i64;

/// Native methods callable from compiled code, keyed by name.
#[derive(Default)]
pub struct Externs {
    map: HashMap<String, (usize, ExternFn)>,
}

impl Externs {
    pub fn new() -> Externs {
        Externs::default()
    }

    pub fn with(mut self, name: &str, param_count: usize, body: ExternFn) -> Externs {
        self.map.insert(name.to_string(), (param_count, body));
        self
    }
}

pub struct Machine {
    regs: [i64; Register::COUNT],
    spill: Vec<i64>,
    cmp: Option<(i64, i64)>,
}

impl Machine {
    fn get(&self, op: Operand) -> i64 {
        match op {
            Operand::Phys(reg) => self.regs[reg.index()],
            other => panic!("unallocated operand {other} reached execution"),
        }
    }

    fn set(&mut self, op: Operand, value: i64) {
        match op {
            Operand::Phys(reg) => self.regs[reg.index()] = value,
            other => panic!("unallocated operand {other} reached execution"),
        }
    }
}

/// Execute the allocated IR of `compiled` and return the RAX value at the
/// end of the epilogue.
pub fn run(compiled: &CompiledMethod, args: &[i64], externs: &Externs) -> i64 {
    let g = &compiled.graph;
    let mut m = Machine {
        regs: [JUNK; Register::COUNT],
        spill: vec![JUNK; compiled.spill_slots as usize + 4],
        cmp: None,
    };
    for (i, &value) in args.iter().enumerate() {
        m.regs[CallConv::ARGS[i].index()] = value;
    }

    let mut bb = g.entry;
    let mut steps = 0u32;
    loop {
        steps += 1;
        assert!(steps < 100_000, "runaway execution");
        match exec_block(g, bb, &mut m, externs) {
            Some(next) => bb = next,
            None => {
                assert_eq!(bb, g.epilogue, "fell off a non-epilogue block");
                return m.regs[Register::Rax.index()];
            }
        }
    }
}

fn exec_block(g: &FlowGraph, bb: BlockId, m: &mut Machine, externs: &Externs) -> Option<BlockId> {
    for id in g.ins_ids(bb) {
        let ins = g.ins(id);
        match ins.op {
            Op::Nop | Op::SetRet | Op::LoadArg => {}
            Op::IConst => m.set(ins.dest, ins.const0 as i64),
            Op::Mov => {
                let v = m.get(ins.r0);
                m.set(ins.dest, v);
            }
            Op::Add => {
                assert_eq!(ins.dest, ins.r0, "two-operand form violated: {ins}");
                let v = m.get(ins.r0).wrapping_add(m.get(ins.r1));
                m.set(ins.dest, v);
            }
            Op::AddI => {
                assert_eq!(ins.dest, ins.r0, "two-operand form violated: {ins}");
                let v = m.get(ins.r0).wrapping_add(ins.const0 as i64);
                m.set(ins.dest, v);
            }
            Op::Cmp => m.cmp = Some((m.get(ins.r0), m.get(ins.r1))),
            Op::CmpI => m.cmp = Some((m.get(ins.r0), ins.const0 as i64)),
            Op::SpillVar => {
                let v = m.get(ins.r0);
                m.spill[ins.slot() as usize] = v;
            }
            Op::SpillConst => m.spill[ins.slot() as usize] = ins.const0 as i64,
            Op::FillVar => {
                let v = m.spill[ins.slot() as usize];
                assert_ne!(v, JUNK, "fill from a never-written slot: {ins}");
                m.set(ins.dest, v);
            }
            Op::Swap => {
                let (a, b) = (m.get(ins.r0), m.get(ins.r1));
                m.set(ins.r0, b);
                m.set(ins.r1, a);
            }
            Op::Call | Op::VoidCall => {
                let callee = ins.callee.as_ref().expect("call without callee");
                let (param_count, body) = externs
                    .map
                    .get(&callee.name)
                    .unwrap_or_else(|| panic!("no extern for {}", callee.name));
                assert_eq!(ins.call_args.len(), *param_count);
                let mut call_args = Vec::with_capacity(*param_count);
                for (i, &op) in ins.call_args.iter().enumerate() {
                    assert_eq!(
                        op,
                        Operand::Phys(CallConv::arg_reg(i)),
                        "argument {i} not in its ABI register: {ins}"
                    );
                    call_args.push(m.get(op));
                }
                let result = body(&call_args);
                // The ABI: caller-saved registers do not survive.
                for reg in CallConv::CALLER_SAVED {
                    m.regs[reg.index()] = JUNK;
                }
                if ins.op == Op::Call {
                    m.regs[CallConv::RET.index()] = result;
                }
            }
            Op::Br => return Some(ins.call_infos[0].target),
            Op::Ble | Op::Blt | Op::Bg | Op::Bge | Op::Bne | Op::Beq => {
                let (a, b) = m.cmp.expect("conditional branch without a compare");
                let taken = match ins.op {
                    Op::Ble => a <= b,
                    Op::Blt => a < b,
                    Op::Bg => a > b,
                    Op::Bge => a >= b,
                    Op::Bne => a != b,
                    Op::Beq => a == b,
                    _ => unreachable!(),
                };
                let edge = if taken { 0 } else { 1 };
                return Some(ins.call_infos[edge].target);
            }
        }
    }
    None
}

/// Compile one method (with optional extra methods for call tokens).
pub fn compile(module: &Module, index: u32) -> CompiledMethod {
    Compiler::new(module, index as usize)
        .compile()
        .unwrap_or_else(|e| panic!("compile failed: {e}"))
}

/// Compile a single stand-alone method body.
pub fn compile_body(name: &str, params: u32, ret: Ty, body: Vec<u8>) -> CompiledMethod {
    let mut module = Module::new();
    let index = module.push(MethodDef::new(name, Signature::new(params, ret), body));
    compile(&module, index)
}

/// Structural invariants every compiled method must satisfy: block ranges
/// tile the body, edges are symmetric, and every surviving operand is
/// physical.
pub fn check_invariants(compiled: &CompiledMethod, body_len: u32) {
    let g = &compiled.graph;
    let order = g.program_order();
    let mut expected = 0;
    for &id in &order {
        let b = g.block(id);
        assert_eq!(b.start, expected, "gap or overlap before BB{id}");
        expected = b.end;
    }
    assert_eq!(expected, body_len, "blocks do not tile the body");

    for &id in &order {
        for &succ in &g.block(id).to {
            let fwd = g.block(id).to.iter().filter(|&&s| s == succ).count();
            let back = g.block(succ).from.iter().filter(|&&p| p == id).count();
            assert_eq!(fwd, back, "asymmetric edge BB{id} -> BB{succ}");
        }
        let b = g.block(id);
        if let Some(states) = &b.in_var_state {
            assert_eq!(states.len(), b.in_vars.len());
            assert!(states.iter().all(|vs| vs.is_live()));
        }
        for ins_id in g.ins_ids(id) {
            let ins = g.ins(ins_id);
            for op in [ins.dest, ins.r0, ins.r1] {
                assert!(
                    !matches!(op, Operand::Virt(_)),
                    "virtual operand survived allocation: {ins}"
                );
            }
        }
    }
}
