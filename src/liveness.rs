// This module computes each block's live-in variable set with a backward
// worklist fixed point. A single per-block scan classifies local/argument
// loads as uses (entering the live-in set unless the block defined the
// variable earlier) and stores as defs; a return defines the return slot.
// The fixed point then grows live-in sets from successors minus defs,
// re-enqueueing predecessors whenever a set grows. The domain is finite and
// the transfer monotone, so the loop terminates.

//! Backward liveness dataflow over the block graph.

use std::collections::VecDeque;

use log::{debug, trace};

use crate::bytecode::{BodyIter, MethodDef, Opcode};
use crate::error::CompileResult;
use crate::ir::block::FlowGraph;
use crate::ir::{arg_var, local_var, BlockId, Var, RET_VAR};

/// Compute `in_vars`/`def_vars` for every block.
pub fn run(g: &mut FlowGraph, method: &MethodDef) -> CompileResult<()> {
    debug!("=== liveness");
    scan_blocks(g, method)?;
    g.dump("before converge");
    converge(g);
    g.dump("computed in-vars");
    Ok(())
}

fn add_use(g: &mut FlowGraph, bb: BlockId, var: Var) {
    let b = g.block_mut(bb);
    if !b.def_vars.contains(&var) {
        trace!("\tfound use of {var} in BB{bb}");
        b.in_vars.insert(var);
    }
}

fn add_def(g: &mut FlowGraph, bb: BlockId, var: Var) {
    trace!("\tfound def of {var} in BB{bb}");
    g.block_mut(bb).def_vars.insert(var);
}

fn scan_blocks(g: &mut FlowGraph, method: &MethodDef) -> CompileResult<()> {
    let params = method.signature.param_count;
    let returns = method.signature.returns_value();

    if returns {
        let ep = g.epilogue;
        g.block_mut(ep).in_vars.insert(RET_VAR);
    }

    for bb in g.program_order() {
        let (start, end) = {
            let b = g.block(bb);
            (b.start, b.end)
        };
        let mut it = BodyIter::new(&method.body, start, end);
        while let Some(ins) = it.next_instr()? {
            match ins.opcode {
                Opcode::Ldloc0 => add_use(g, bb, local_var(0, params)),
                Opcode::Ldloc1 => add_use(g, bb, local_var(1, params)),
                Opcode::Ldloc2 => add_use(g, bb, local_var(2, params)),
                Opcode::Ldloc3 => add_use(g, bb, local_var(3, params)),
                Opcode::LdlocS => add_use(g, bb, local_var(ins.imm as u32, params)),
                Opcode::Stloc0 => add_def(g, bb, local_var(0, params)),
                Opcode::Stloc1 => add_def(g, bb, local_var(1, params)),
                Opcode::Stloc2 => add_def(g, bb, local_var(2, params)),
                Opcode::Stloc3 => add_def(g, bb, local_var(3, params)),
                Opcode::StlocS => add_def(g, bb, local_var(ins.imm as u32, params)),
                Opcode::Ldarg0 => add_use(g, bb, arg_var(0)),
                Opcode::Ldarg1 => add_use(g, bb, arg_var(1)),
                Opcode::Ldarg2 => add_use(g, bb, arg_var(2)),
                Opcode::Ldarg3 => add_use(g, bb, arg_var(3)),
                Opcode::LdargS => add_use(g, bb, arg_var(ins.imm as u32)),
                Opcode::StargS => add_def(g, bb, arg_var(ins.imm as u32)),
                Opcode::Ret => {
                    if returns {
                        add_def(g, bb, RET_VAR);
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn converge(g: &mut FlowGraph) {
    let mut queue: VecDeque<BlockId> = VecDeque::new();

    // Leaf blocks are ready immediately.
    for bb in g.block_ids() {
        let b = g.block_mut(bb);
        b.enqueued = false;
        b.done = false;
        if b.to.is_empty() {
            b.enqueued = true;
            queue.push_back(bb);
        }
    }

    while let Some(bb) = queue.pop_front() {
        g.block_mut(bb).enqueued = false;
        let before = g.block(bb).in_vars.len();
        trace!("iterating BB{bb}");

        let succs = g.block(bb).to.clone();
        for succ in succs {
            let incoming: Vec<Var> = g.block(succ).in_vars.iter().copied().collect();
            for v in incoming {
                if !g.block(bb).def_vars.contains(&v) {
                    g.block_mut(bb).in_vars.insert(v);
                }
            }
        }

        g.block_mut(bb).done = true;
        let modified = before != g.block(bb).in_vars.len();

        for pred in g.block(bb).from.clone() {
            let p = g.block_mut(pred);
            if !p.enqueued && (!p.done || modified) {
                p.enqueued = true;
                p.done = false;
                queue.push_back(pred);
            }
        }
    }
}
