// This module folds constants forward across the block graph. Each block
// keeps a virtual-register-to-constant map, seeded from the incoming edge
// only when the block has exactly one predecessor (multi-predecessor blocks
// start unknown — a deliberate simplification). IConst registers a constant;
// Add with two known operands folds to IConst and with one known operand
// rewrites to the immediate form; AddI with a known operand folds to IConst.
// Every branch snapshots the map into its outgoing CallInfos so successors
// can seed. Replacement is in place and link-preserving, and re-applied
// until the instruction no longer folds.

//! Forward constant propagation.

use hashbrown::HashMap;
use log::{debug, trace};

use crate::ir::block::FlowGraph;
use crate::ir::{BlockId, Ins, InsId, Op, VReg};

/// Run constant propagation over the whole graph.
pub fn run(g: &mut FlowGraph) {
    debug!("=== constant propagation");
    for bb in g.forward_order() {
        propagate_block(g, bb);
    }
    g.dump("after cprop");
}

fn propagate_block(g: &mut FlowGraph, bb: BlockId) {
    trace!("cprop BB{bb}");
    let mut consts: HashMap<VReg, i32> = HashMap::new();

    // Seed from the only incoming edge; joins start unknown.
    let preds = g.block(bb).from.clone();
    if let [pred] = preds[..] {
        if let Some(info) = g.info_for(pred, bb) {
            if let Some(values) = &info.cprop_values {
                for (vreg, value) in values.iter().enumerate() {
                    if let Some(c) = value {
                        trace!("\tseeding R{vreg} = {c}");
                        consts.insert(vreg as VReg, *c);
                    }
                }
            }
        }
    }

    let mut current = g.block(bb).first_ins;
    while let Some(id) = current {
        // A fold can itself become foldable; retry until stable.
        while let Some(replacement) = fold_one(g, &mut consts, id) {
            trace!("replacing ({}) with ({replacement})", g.ins(id));
            g.replace(id, replacement);
        }
        current = g.ins(id).next;
    }
}

/// Apply one rewrite of the instruction, or register its knowledge.
fn fold_one(g: &mut FlowGraph, consts: &mut HashMap<VReg, i32>, id: InsId) -> Option<Ins> {
    let ins = g.ins(id);
    match ins.op {
        Op::IConst => {
            let dest = ins.dest.virt()?;
            trace!("\tR{dest} [const {}]", ins.const0);
            consts.insert(dest, ins.const0);
            None
        }
        Op::Add => {
            let dest = ins.dest.virt()?;
            let r0 = ins.r0.virt()?;
            let r1 = ins.r1.virt()?;
            let v0 = consts.get(&r0).copied();
            let v1 = consts.get(&r1).copied();
            match (v0, v1) {
                (Some(a), Some(b)) => Some(Ins::iconst(dest, a.wrapping_add(b))),
                (Some(c), None) => Some(Ins::add_imm(dest, r1, c)),
                (None, Some(c)) => Some(Ins::add_imm(dest, r0, c)),
                (None, None) => None,
            }
        }
        Op::AddI => {
            let dest = ins.dest.virt()?;
            let r0 = ins.r0.virt()?;
            let c = *consts.get(&r0)?;
            Some(Ins::iconst(dest, ins.const0.wrapping_add(c)))
        }
        Op::Ble | Op::Blt | Op::Bg | Op::Bge | Op::Bne | Op::Beq | Op::Br => {
            let snapshots: Vec<Vec<Option<i32>>> = ins
                .call_infos
                .iter()
                .map(|ci| ci.args.iter().map(|a| consts.get(a).copied()).collect())
                .collect();
            let ins = g.ins_mut(id);
            for (ci, snap) in ins.call_infos.iter_mut().zip(snapshots) {
                ci.cprop_values = Some(snap);
            }
            None
        }
        _ => None,
    }
}
