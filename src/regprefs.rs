// This module computes soft register affinities ahead of allocation. ABI
// fixed points seed the preferences: a LoadArg destination likes its
// argument register, a call result likes the return register. Each branch
// then hands the block's preferences positionally to its successors' live-in
// virtual registers. The first path to reach a live-in sets its mask; every
// further path intersects, so only registers every path agrees on survive.
// The allocator treats the masks as hints in its free-register search and
// when deciding whether to swap a commutative instruction's operands.

//! Register preference pass.

use log::{debug, trace};

use crate::ir::block::FlowGraph;
use crate::ir::{BlockId, Op, VReg};
use crate::x64::{CallConv, RegMask};

/// Compute per-block `reg_prefs` maps. Runs after ABI pseudo-op insertion
/// and before allocation.
pub fn run(g: &mut FlowGraph) {
    debug!("=== register preferences");
    for bb in g.forward_order() {
        propagate_block(g, bb);
    }
}

fn propagate_block(g: &mut FlowGraph, bb: BlockId) {
    for id in g.ins_ids(bb) {
        let ins = g.ins(id);
        match ins.op {
            Op::LoadArg => {
                if let Some(dest) = ins.dest.virt() {
                    let reg = CallConv::arg_reg(ins.const0 as usize);
                    trace!("BB{bb}: R{dest} likes {reg}");
                    g.block_mut(bb).reg_prefs.insert(dest, RegMask::single(reg));
                }
            }
            Op::Call => {
                if let Some(dest) = ins.dest.virt() {
                    trace!("BB{bb}: R{dest} likes {}", CallConv::RET);
                    g.block_mut(bb)
                        .reg_prefs
                        .insert(dest, RegMask::single(CallConv::RET));
                }
            }
            op if op.is_branch() => {
                let edges: Vec<(BlockId, Vec<VReg>)> = ins
                    .call_infos
                    .iter()
                    .map(|ci| (ci.target, ci.args.clone()))
                    .collect();
                for (target, args) in edges {
                    for (position, arg) in args.iter().enumerate() {
                        let Some(&mask) = g.block(bb).reg_prefs.get(arg) else {
                            continue;
                        };
                        merge_pref(g, target, position as VReg, mask);
                    }
                }
            }
            _ => {}
        }
    }
}

/// First writer sets, later writers intersect.
fn merge_pref(g: &mut FlowGraph, target: BlockId, vreg: VReg, mask: RegMask) {
    let prefs = &mut g.block_mut(target).reg_prefs;
    match prefs.get_mut(&vreg) {
        Some(existing) => existing.intersect(mask),
        None => {
            prefs.insert(vreg, mask);
        }
    }
    trace!(
        "BB{target}: R{vreg} prefs now ({})",
        g.block(target).reg_prefs[&vreg]
    );
}
