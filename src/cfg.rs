// This module builds the basic-block graph from the decoded instruction
// stream. A current block starts at offset zero and is split as branches and
// their targets are discovered; a zero-length epilogue block is the single
// target of every return. Splitting is lazy: branch targets inside not-yet-
// visited code produce blocks whose own terminators are found later, and
// fallthrough edges for straight-line code are added when the scan crosses
// a block boundary.

//! Control-flow graph construction.

use log::{debug, trace};

use crate::bytecode::{BodyIter, FlowControl, Opcode};
use crate::error::{CompileError, CompileResult};
use crate::ir::block::FlowGraph;

/// Split a linear method body into a block graph.
pub fn build(body: &[u8]) -> CompileResult<FlowGraph> {
    let mut g = FlowGraph::new(body.len() as u32);
    let mut current = g.entry;
    let epilogue = g.epilogue;

    debug!("=== BB formation");
    let mut it = BodyIter::whole(body);
    while let Some(ins) = it.next_instr()? {
        trace!("{:#x}: {:?} [{:?}]", ins.offset, ins.opcode, ins.flow);
        match ins.flow {
            FlowControl::Next | FlowControl::Call => {
                if ins.opcode == Opcode::Jmp {
                    return Err(CompileError::Unsupported("jmp tail transfer"));
                }
                // Crossing into an already-formed block is a fallthrough.
                if ins.next >= g.block(current).end {
                    let next = g.block(current).next_in_order.ok_or(
                        CompileError::Malformed {
                            offset: ins.offset,
                            reason: "body ends without a terminator",
                        },
                    )?;
                    g.link(current, next);
                    current = next;
                }
            }
            FlowControl::Branch => {
                let target_offset = ins.branch_target();
                // A branch ending the body has no tail block to split off.
                let next = if it.has_next() {
                    Some(g.split_at(current, ins.next, false)?)
                } else {
                    None
                };
                let found = g.find_at(g.entry, target_offset)?;
                let target = g.split_at(found, target_offset, false)?;
                g.link(current, target);
                if let Some(next) = next {
                    if target != next {
                        // An unconditional branch never falls through.
                        g.unlink(current, next);
                    }
                    current = next;
                }
            }
            FlowControl::CondBranch => {
                if !it.has_next() {
                    return Err(CompileError::Malformed {
                        offset: ins.offset,
                        reason: "conditional branch falls off the end of the body",
                    });
                }
                let target_offset = ins.branch_target();
                let next = g.split_at(current, ins.next, true)?;
                let found = g.find_at(g.entry, target_offset)?;
                let target = g.split_at(found, target_offset, true)?;
                g.link(current, target);
                // The taken edge must be successor 0; later passes rely on it.
                g.make_first_dest(current, target);
                current = next;
            }
            FlowControl::Return => {
                if it.has_next() {
                    let next = g.split_at(current, ins.next, false)?;
                    // A speculative fallthrough edge may exist if an earlier
                    // conditional split linked current to next; a returning
                    // block never falls through.
                    g.unlink(current, next);
                    g.link(current, epilogue);
                    current = next;
                } else {
                    g.link(current, epilogue);
                }
            }
            FlowControl::Throw => {
                return Err(CompileError::Unsupported("exception flow"));
            }
        }
    }
    g.block_mut(current).next_in_order = Some(epilogue);

    g.dump("BB formation");
    Ok(g)
}
