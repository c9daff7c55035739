// This module lowers each block's stack bytecode to the register IR. An
// explicit evaluation stack holds constants and virtual registers; constants
// fold lazily (const+const folds immediately, const+var lowers to the
// immediate-form opcode, flipping comparison sense when the constant was the
// left operand). Every outgoing edge snapshots the live virtual-register
// bindings the target needs into a CallInfo — the phi-node replacement.
// Residual evaluation-stack values crossing an edge are materialized into
// synthetic stack variables; the target captures the depth once and every
// other predecessor must match it.

//! Stack-machine to IR translation.

use hashbrown::HashMap;
use log::{debug, trace};

use crate::bytecode::{BodyIter, Instr, MethodDef, Module, Opcode};
use crate::error::{internal, CompileError, CompileResult};
use crate::ir::block::FlowGraph;
use crate::ir::{
    stack_var, arg_var, is_stack_var, local_var, BlockId, CallInfo, CalleeRef, Ins, Op, VReg, Var,
    RET_VAR,
};

/// A value on the evaluation stack: a constant awaiting materialization or
/// an already-emitted virtual register.
#[derive(Debug, Clone, Copy)]
enum StackValue {
    Const(i32),
    Reg(VReg),
}

/// Translate every block of `method` into IR.
pub fn translate(g: &mut FlowGraph, method: &MethodDef, module: &Module) -> CompileResult<()> {
    debug!("=== IR translation");
    let tr = Translator { method, module };
    for bb in g.program_order() {
        tr.translate_block(g, bb)?;
    }
    g.dump("IR emitted");
    Ok(())
}

struct Translator<'m> {
    method: &'m MethodDef,
    module: &'m Module,
}

impl<'m> Translator<'m> {
    fn translate_block(&self, g: &mut FlowGraph, bb: BlockId) -> CompileResult<()> {
        trace!("emitting body of BB{bb}");
        let params = self.method.signature.param_count;

        // Every live-in variable gets a fresh virtual register, in live-in
        // order: the allocator relies on live-in i being vreg i.
        let mut table: HashMap<Var, VReg> = HashMap::new();
        let in_vars: Vec<Var> = g.block(bb).in_vars.iter().copied().collect();
        for v in in_vars {
            let vreg = g.block_mut(bb).next_vreg();
            trace!("\t{v} == R{vreg}");
            table.insert(v, vreg);
        }

        let mut stack: Vec<StackValue> = Vec::new();
        if let Some(depth) = g.block(bb).stack_args {
            for slot in 0..depth {
                let vreg = *table
                    .get(&stack_var(slot))
                    .ok_or_else(|| internal!("stack slot {slot} missing from BB{bb} live-ins"))?;
                stack.push(StackValue::Reg(vreg));
            }
        }
        g.block_mut(bb).translated = true;

        let (start, end) = {
            let b = g.block(bb);
            (b.start, b.end)
        };
        let mut it = BodyIter::new(&self.method.body, start, end);
        let mut done = false;
        while let Some(ins) = it.next_instr()? {
            if done {
                return Err(CompileError::BranchNotBlockFinal { offset: ins.offset });
            }
            match ins.opcode {
                // Nothing for now; sequence points later.
                Opcode::Nop => {}

                Opcode::Ldc0 => stack.push(StackValue::Const(0)),
                Opcode::Ldc1 => stack.push(StackValue::Const(1)),
                Opcode::Ldc2 => stack.push(StackValue::Const(2)),
                Opcode::Ldc3 => stack.push(StackValue::Const(3)),
                Opcode::Ldc4 => stack.push(StackValue::Const(4)),
                Opcode::Ldc5 => stack.push(StackValue::Const(5)),
                Opcode::LdcS | Opcode::LdcI => stack.push(StackValue::Const(ins.imm)),

                Opcode::Ldloc0 => self.load_var(g, bb, &table, &mut stack, local_var(0, params))?,
                Opcode::Ldloc1 => self.load_var(g, bb, &table, &mut stack, local_var(1, params))?,
                Opcode::Ldloc2 => self.load_var(g, bb, &table, &mut stack, local_var(2, params))?,
                Opcode::Ldloc3 => self.load_var(g, bb, &table, &mut stack, local_var(3, params))?,
                Opcode::LdlocS => {
                    self.load_var(g, bb, &table, &mut stack, local_var(ins.imm as u32, params))?
                }
                Opcode::Ldarg0 => self.load_var(g, bb, &table, &mut stack, arg_var(0))?,
                Opcode::Ldarg1 => self.load_var(g, bb, &table, &mut stack, arg_var(1))?,
                Opcode::Ldarg2 => self.load_var(g, bb, &table, &mut stack, arg_var(2))?,
                Opcode::Ldarg3 => self.load_var(g, bb, &table, &mut stack, arg_var(3))?,
                Opcode::LdargS => self.load_var(g, bb, &table, &mut stack, arg_var(ins.imm as u32))?,

                Opcode::Stloc0 => {
                    let v = self.store_var(g, bb, &mut stack, &ins)?;
                    table.insert(local_var(0, params), v);
                }
                Opcode::Stloc1 => {
                    let v = self.store_var(g, bb, &mut stack, &ins)?;
                    table.insert(local_var(1, params), v);
                }
                Opcode::Stloc2 => {
                    let v = self.store_var(g, bb, &mut stack, &ins)?;
                    table.insert(local_var(2, params), v);
                }
                Opcode::Stloc3 => {
                    let v = self.store_var(g, bb, &mut stack, &ins)?;
                    table.insert(local_var(3, params), v);
                }
                Opcode::StlocS => {
                    let v = self.store_var(g, bb, &mut stack, &ins)?;
                    table.insert(local_var(ins.imm as u32, params), v);
                }
                Opcode::StargS => {
                    let v = self.store_var(g, bb, &mut stack, &ins)?;
                    table.insert(arg_var(ins.imm as u32), v);
                }

                Opcode::Add => {
                    let r1 = pop(&mut stack, &ins)?;
                    let r0 = pop(&mut stack, &ins)?;
                    let folded = match (r0, r1) {
                        (StackValue::Const(a), StackValue::Const(b)) => {
                            StackValue::Const(a.wrapping_add(b))
                        }
                        (StackValue::Reg(r), StackValue::Const(c))
                        | (StackValue::Const(c), StackValue::Reg(r)) => {
                            let dest = g.block_mut(bb).next_vreg();
                            g.append(bb, Ins::add_imm(dest, r, c));
                            StackValue::Reg(dest)
                        }
                        (StackValue::Reg(a), StackValue::Reg(b)) => {
                            let dest = g.block_mut(bb).next_vreg();
                            g.append(bb, Ins::add(dest, a, b));
                            StackValue::Reg(dest)
                        }
                    };
                    stack.push(folded);
                }

                Opcode::Ble => {
                    self.cond_branch(g, bb, &mut table, &mut stack, &ins, Op::Ble)?;
                    done = true;
                }
                Opcode::Blt => {
                    self.cond_branch(g, bb, &mut table, &mut stack, &ins, Op::Blt)?;
                    done = true;
                }
                Opcode::Bgt => {
                    self.cond_branch(g, bb, &mut table, &mut stack, &ins, Op::Bg)?;
                    done = true;
                }
                Opcode::Bge => {
                    self.cond_branch(g, bb, &mut table, &mut stack, &ins, Op::Bge)?;
                    done = true;
                }
                Opcode::Beq => {
                    self.cond_branch(g, bb, &mut table, &mut stack, &ins, Op::Beq)?;
                    done = true;
                }
                Opcode::Bne => {
                    self.cond_branch(g, bb, &mut table, &mut stack, &ins, Op::Bne)?;
                    done = true;
                }
                Opcode::Brtrue => {
                    self.bool_branch(g, bb, &mut table, &mut stack, &ins, Op::Bne)?;
                    done = true;
                }
                Opcode::Brfalse => {
                    self.bool_branch(g, bb, &mut table, &mut stack, &ins, Op::Beq)?;
                    done = true;
                }

                Opcode::Br => {
                    let target = first_target(g, bb)?;
                    self.flush_stack(g, bb, &mut table, &mut stack, &[target])?;
                    let info = self.edge_info(g, &table, target)?;
                    g.append(bb, Ins::branch(info));
                    done = true;
                }

                Opcode::Ret => {
                    if self.method.signature.returns_value() {
                        let val = pop(&mut stack, &ins)?;
                        let vreg = self.emit_store(g, bb, val);
                        table.insert(RET_VAR, vreg);
                    }
                    if !stack.is_empty() {
                        return Err(CompileError::Malformed {
                            offset: ins.offset,
                            reason: "operand stack not empty at return",
                        });
                    }
                    let info = self.edge_info(g, &table, g.epilogue)?;
                    g.append(bb, Ins::branch(info));
                    done = true;
                }

                Opcode::Call => {
                    self.lower_call(g, bb, &mut stack, &ins)?;
                }

                Opcode::Jmp | Opcode::Throw => {
                    return Err(CompileError::UnsupportedOpcode {
                        opcode: ins.opcode,
                        offset: ins.offset,
                    });
                }
            }
        }

        if !done {
            let to = g.block(bb).to.clone();
            if to.len() > 1 {
                return Err(CompileError::FallthroughToMultiple { block: bb });
            }
            if let Some(&target) = to.first() {
                self.flush_stack(g, bb, &mut table, &mut stack, &[target])?;
                let info = self.edge_info(g, &table, target)?;
                g.append(bb, Ins::branch(info));
            }
        }
        Ok(())
    }

    fn load_var(
        &self,
        g: &mut FlowGraph,
        bb: BlockId,
        table: &HashMap<Var, VReg>,
        stack: &mut Vec<StackValue>,
        var: Var,
    ) -> CompileResult<()> {
        let src = *table
            .get(&var)
            .ok_or_else(|| internal!("load of {var} with no binding in BB{bb}"))?;
        let dest = g.block_mut(bb).next_vreg();
        g.append(bb, Ins::mov(dest, src));
        stack.push(StackValue::Reg(dest));
        Ok(())
    }

    /// Pop and copy into a fresh virtual register (a store's new binding).
    fn store_var(
        &self,
        g: &mut FlowGraph,
        bb: BlockId,
        stack: &mut Vec<StackValue>,
        at: &Instr,
    ) -> CompileResult<VReg> {
        let val = pop(stack, at)?;
        Ok(self.emit_store(g, bb, val))
    }

    fn emit_store(&self, g: &mut FlowGraph, bb: BlockId, val: StackValue) -> VReg {
        let dest = g.block_mut(bb).next_vreg();
        match val {
            StackValue::Const(c) => g.append(bb, Ins::iconst(dest, c)),
            StackValue::Reg(r) => g.append(bb, Ins::mov(dest, r)),
        };
        dest
    }

    fn cond_branch(
        &self,
        g: &mut FlowGraph,
        bb: BlockId,
        table: &mut HashMap<Var, VReg>,
        stack: &mut Vec<StackValue>,
        at: &Instr,
        op: Op,
    ) -> CompileResult<()> {
        let r1 = pop(stack, at)?;
        let r0 = pop(stack, at)?;
        // Canonicalize a constant into the immediate form; a left-hand
        // constant flips the comparison sense.
        let branch_op = match (r0, r1) {
            (StackValue::Reg(a), StackValue::Reg(b)) => {
                g.append(bb, Ins::cmp(a, b));
                op
            }
            (StackValue::Reg(a), StackValue::Const(c)) => {
                g.append(bb, Ins::cmp_imm(a, c));
                op
            }
            (StackValue::Const(c), StackValue::Reg(b)) => {
                g.append(bb, Ins::cmp_imm(b, c));
                op.swapped_cmp()
            }
            (StackValue::Const(a), StackValue::Const(b)) => {
                let v = self.emit_store(g, bb, StackValue::Const(a));
                g.append(bb, Ins::cmp_imm(v, b));
                op
            }
        };
        self.finish_cond(g, bb, table, stack, branch_op)
    }

    /// Boolean branches compare their operand against zero.
    fn bool_branch(
        &self,
        g: &mut FlowGraph,
        bb: BlockId,
        table: &mut HashMap<Var, VReg>,
        stack: &mut Vec<StackValue>,
        at: &Instr,
        op: Op,
    ) -> CompileResult<()> {
        let val = pop(stack, at)?;
        let vreg = match val {
            StackValue::Reg(r) => r,
            StackValue::Const(c) => self.emit_store(g, bb, StackValue::Const(c)),
        };
        g.append(bb, Ins::cmp_imm(vreg, 0));
        self.finish_cond(g, bb, table, stack, op)
    }

    fn finish_cond(
        &self,
        g: &mut FlowGraph,
        bb: BlockId,
        table: &mut HashMap<Var, VReg>,
        stack: &mut Vec<StackValue>,
        op: Op,
    ) -> CompileResult<()> {
        let to = g.block(bb).to.clone();
        if to.len() != 2 {
            return Err(internal!(
                "conditional branch in BB{bb} with {} successors",
                to.len()
            ));
        }
        self.flush_stack(g, bb, table, stack, &to)?;
        // Edge 0 is the taken edge by CFG convention.
        let taken = self.edge_info(g, table, to[0])?;
        let fallthrough = self.edge_info(g, table, to[1])?;
        g.append(bb, Ins::cond_branch(op, taken, fallthrough));
        Ok(())
    }

    fn lower_call(
        &self,
        g: &mut FlowGraph,
        bb: BlockId,
        stack: &mut Vec<StackValue>,
        at: &Instr,
    ) -> CompileResult<()> {
        let callee = self.module.method(at.token())?;
        let param_count = callee.signature.param_count;
        if param_count as usize > crate::x64::CallConv::ARGS.len() {
            return Err(CompileError::Unsupported(
                "more than six integer arguments",
            ));
        }
        let returns = callee.signature.returns_value();

        // Arguments pop right to left.
        let mut popped = Vec::with_capacity(param_count as usize);
        for _ in 0..param_count {
            popped.push(pop(stack, at)?);
        }
        popped.reverse();

        // Every argument gets a fresh register so its live range ends at
        // the call; the allocator requires argument freshness.
        let mut args = Vec::with_capacity(popped.len());
        for val in popped {
            args.push(self.emit_store(g, bb, val));
        }

        let dest = if returns {
            Some(g.block_mut(bb).next_vreg())
        } else {
            None
        };
        let callee_ref = CalleeRef {
            token: at.token(),
            name: callee.name.clone(),
            param_count,
            returns,
        };
        g.append(bb, Ins::call(dest, callee_ref, args));
        if let Some(dest) = dest {
            stack.push(StackValue::Reg(dest));
        }
        Ok(())
    }

    /// Materialize residual evaluation-stack values into synthetic stack
    /// variables and register the depth with each target.
    fn flush_stack(
        &self,
        g: &mut FlowGraph,
        bb: BlockId,
        table: &mut HashMap<Var, VReg>,
        stack: &mut [StackValue],
        targets: &[BlockId],
    ) -> CompileResult<()> {
        let depth = stack.len() as u32;
        if depth == 0 {
            return Ok(());
        }
        trace!("BB{bb} carries {depth} stack values across its edges");
        for (slot, val) in stack.iter_mut().enumerate() {
            let vreg = match *val {
                StackValue::Reg(r) => r,
                StackValue::Const(c) => {
                    let v = self.emit_store(g, bb, StackValue::Const(c));
                    *val = StackValue::Reg(v);
                    v
                }
            };
            table.insert(stack_var(slot as u32), vreg);
        }
        for &target in targets {
            self.register_stack_depth(g, bb, target, depth)?;
        }
        Ok(())
    }

    fn register_stack_depth(
        &self,
        g: &mut FlowGraph,
        bb: BlockId,
        target: BlockId,
        depth: u32,
    ) -> CompileResult<()> {
        match g.block(target).stack_args {
            Some(existing) if existing == depth => Ok(()),
            Some(existing) => Err(CompileError::StackDepthMismatch {
                block: target,
                expected: existing,
                found: depth,
            }),
            None => {
                // The capture must happen before the target or any of its
                // other predecessors is translated; those edges were built
                // without the stack slots.
                let too_late = g.block(target).translated
                    || g
                        .block(target)
                        .from
                        .iter()
                        .any(|&p| p != bb && g.block(p).translated);
                if too_late {
                    return Err(CompileError::StackDepthMismatch {
                        block: target,
                        expected: 0,
                        found: depth,
                    });
                }
                g.block_mut(target).stack_args = Some(depth);
                for slot in 0..depth {
                    g.block_mut(target).in_vars.insert(stack_var(slot));
                }
                Ok(())
            }
        }
    }

    fn edge_info(
        &self,
        g: &FlowGraph,
        table: &HashMap<Var, VReg>,
        target: BlockId,
    ) -> CompileResult<CallInfo> {
        trace!("computing translation table to BB{target}");
        let mut args = Vec::with_capacity(g.block(target).in_vars.len());
        for &v in &g.block(target).in_vars {
            let vreg = table.get(&v).copied().ok_or_else(|| {
                if is_stack_var(v) {
                    CompileError::StackDepthMismatch {
                        block: target,
                        expected: g.block(target).stack_args.unwrap_or(0),
                        found: 0,
                    }
                } else {
                    internal!("no binding for var {v} on edge to BB{target}")
                }
            })?;
            args.push(vreg);
        }
        Ok(CallInfo::new(args, target))
    }
}

fn first_target(g: &FlowGraph, bb: BlockId) -> CompileResult<BlockId> {
    g.block(bb)
        .to
        .first()
        .copied()
        .ok_or_else(|| internal!("branch in BB{bb} with no successor"))
}

fn pop(stack: &mut Vec<StackValue>, at: &Instr) -> CompileResult<StackValue> {
    stack.pop().ok_or(CompileError::Malformed {
        offset: at.offset,
        reason: "operand stack underflow",
    })
}
