// This module reconciles two allocation decisions for the same values at a
// block boundary — a restricted parallel-move problem. Each pair names where
// the target block expects a live-in (dst) and where the incoming edge
// actually left it (src). Pairs whose destination is no remaining pair's
// source are safe overwrites and are emitted in peel order; when only cycles
// remain, a two-register cycle is broken with a swap. Longer cycles and
// multi-predecessor targets are declared fatal limitations.

//! Cross-block repair-code synthesis.

use log::debug;

use crate::error::{internal, CompileError, CompileResult};
use crate::ir::block::FlowGraph;
use crate::ir::{BlockId, Ins, VarState};

/// One mismatched live-in: the target expects `dst`, the edge provides
/// `src`; `pos` is the live-in index, used to retarget the block's
/// published entry state after the move is planted.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RepairPair {
    pub dst: VarState,
    pub src: VarState,
    pub pos: usize,
}

/// Prepend moves to `bb` so that values arriving in the pairs' source
/// locations end up where the block expects them.
///
/// Repair is planted on the target, which is only sound when the target has
/// a single predecessor; a critical edge is rejected.
pub(crate) fn emit_repair_code(
    g: &mut FlowGraph,
    bb: BlockId,
    pairs: Vec<RepairPair>,
) -> CompileResult<()> {
    if log::log_enabled!(log::Level::Debug) {
        let table = pairs
            .iter()
            .map(|p| format!("{} <= {}", p.dst, p.src))
            .collect::<Vec<_>>()
            .join(",");
        debug!("repairing BB{bb} with {table}");
    }

    if g.block(bb).from.len() > 1 {
        return Err(CompileError::CriticalEdge { block: bb });
    }

    let mut remaining = pairs;
    let mut moves: Vec<Ins> = Vec::new();
    let mut fixups: Vec<(usize, VarState)> = Vec::new();

    while !remaining.is_empty() {
        // Peel any pair whose destination no other pair still reads.
        let peelable = (0..remaining.len()).find(|&i| {
            let dst = remaining[i].dst;
            !remaining
                .iter()
                .enumerate()
                .any(|(j, q)| j != i && q.src.loc_eq(&dst))
        });
        if let Some(i) = peelable {
            let p = remaining.remove(i);
            moves.push(repair_move(&p)?);
            fixups.push((p.pos, p.src));
            continue;
        }

        // Only cycles remain; a two-cycle resolves with one swap.
        let Some((i, j)) = find_two_cycle(&remaining) else {
            return Err(CompileError::RepairCycle);
        };
        let a = remaining[i];
        let b = remaining[j];
        let ra = a
            .dst
            .reg
            .ok_or_else(|| internal!("repair swap of non-register state {}", a.dst))?;
        let rb = a
            .src
            .reg
            .ok_or_else(|| internal!("repair swap of non-register state {}", a.src))?;
        moves.push(Ins::swap(ra, rb));
        fixups.push((a.pos, a.src));
        fixups.push((b.pos, b.src));
        remaining.remove(j);
        remaining.remove(i);
    }

    g.prepend_chain(bb, moves);

    // After repair the block effectively takes its live-ins where the edge
    // delivered them; publish that.
    if let Some(states) = &mut g.block_mut(bb).in_var_state {
        for (pos, vs) in fixups {
            if pos < states.len() {
                states[pos] = vs;
            }
        }
    }
    Ok(())
}

fn repair_move(p: &RepairPair) -> CompileResult<Ins> {
    if let Some(slot) = p.src.spill {
        let Some(reg) = p.dst.reg else {
            return Err(internal!("memory-to-memory repair {} <= {}", p.dst, p.src));
        };
        return Ok(Ins::fill_var(reg, slot));
    }
    let src = p
        .src
        .reg
        .ok_or_else(|| internal!("repair from unallocated state {}", p.src))?;
    if let Some(slot) = p.dst.spill {
        return Ok(Ins::spill_var(src, slot));
    }
    let dst = p
        .dst
        .reg
        .ok_or_else(|| internal!("repair into unallocated state {}", p.dst))?;
    Ok(Ins::phys_mov(dst, src))
}

fn find_two_cycle(pairs: &[RepairPair]) -> Option<(usize, usize)> {
    for i in 0..pairs.len() {
        for j in i + 1..pairs.len() {
            if pairs[i].dst.loc_eq(&pairs[j].src) && pairs[i].src.loc_eq(&pairs[j].dst) {
                return Some((i, j));
            }
        }
    }
    None
}
