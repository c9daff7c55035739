// This module renders the fully allocated block graph as a textual,
// line-oriented AT&T assembly stream. Emission walks the program-order
// chain: one label per block, one mnemonic per surviving instruction, with
// jumps to the immediately following block elided. The prologue pushes the
// frame pointer, saves exactly the callee-saved registers the allocator
// accumulated, and reserves 16-byte-rounded space for the method-wide
// maximum spill-slot count; the epilogue restores in reverse. The sink is a
// trait so a binary encoder can replace the text writer.

//! Textual x86-64 code generation.

use log::debug;

use crate::error::{internal, CompileResult};
use crate::ir::block::FlowGraph;
use crate::ir::{BlockId, Op, Operand};
use crate::regalloc::AllocOutcome;
use crate::x64::Register;

/// Destination for emitted assembly. `TextSink` is the default; a binary
/// encoder satisfying the same surface is an interchangeable alternative.
pub trait CodeSink {
    fn directive(&mut self, text: &str);
    fn label(&mut self, label: &str);
    fn ins(&mut self, text: &str);
}

/// Collects the assembly into a string, one line per element.
#[derive(Default)]
pub struct TextSink {
    out: String,
}

impl TextSink {
    pub fn new() -> TextSink {
        TextSink::default()
    }

    pub fn into_string(self) -> String {
        self.out
    }
}

impl CodeSink for TextSink {
    fn directive(&mut self, text: &str) {
        self.out.push('\t');
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn label(&mut self, label: &str) {
        self.out.push_str(label);
        self.out.push_str(":\n");
    }

    fn ins(&mut self, text: &str) {
        self.out.push('\t');
        self.out.push_str(text);
        self.out.push('\n');
    }
}

/// Emit a whole method as text.
pub fn emit_text(g: &FlowGraph, outcome: &AllocOutcome, name: &str) -> CompileResult<String> {
    let mut sink = TextSink::new();
    emit_method(g, outcome, name, &mut sink)?;
    Ok(sink.into_string())
}

/// Emit a whole method into an arbitrary sink.
pub fn emit_method(
    g: &FlowGraph,
    outcome: &AllocOutcome,
    name: &str,
    sink: &mut dyn CodeSink,
) -> CompileResult<()> {
    debug!("=== codegen {name}");
    let frame = Frame::new(outcome);

    sink.directive(".text");
    sink.directive(&format!(".globl {name}"));
    sink.label(name);

    // Prologue: frame pointer, saved registers, spill space.
    sink.ins("pushq %rbp");
    sink.ins("movq %rsp, %rbp");
    for reg in &outcome.callee_saved {
        sink.ins(&format!("pushq {reg}"));
    }
    if frame.spill_bytes > 0 {
        sink.ins(&format!("subq ${}, %rsp", frame.spill_bytes));
    }

    let order = g.program_order();
    for (index, &bb) in order.iter().enumerate() {
        sink.label(&block_label(name, bb));
        let next = order.get(index + 1).copied();
        emit_block(g, bb, next, name, &frame, sink)?;
    }

    // Epilogue: restore in reverse and return.
    if frame.spill_bytes > 0 {
        sink.ins(&format!("addq ${}, %rsp", frame.spill_bytes));
    }
    for reg in outcome.callee_saved.iter().rev() {
        sink.ins(&format!("popq {reg}"));
    }
    sink.ins("popq %rbp");
    sink.ins("retq");
    Ok(())
}

struct Frame {
    saved_count: u32,
    spill_bytes: u32,
}

impl Frame {
    fn new(outcome: &AllocOutcome) -> Frame {
        Frame {
            saved_count: outcome.callee_saved.len() as u32,
            spill_bytes: (outcome.spill_slots * 8).div_ceil(16) * 16,
        }
    }

    /// RBP-relative address of a spill slot, below the saved registers.
    fn slot(&self, slot: u32) -> String {
        let offset = -8 * (self.saved_count as i32 + slot as i32 + 1);
        format!("{offset}(%rbp)")
    }
}

fn block_label(name: &str, bb: BlockId) -> String {
    format!(".L{name}_{bb}")
}

fn emit_block(
    g: &FlowGraph,
    bb: BlockId,
    next_in_order: Option<BlockId>,
    name: &str,
    frame: &Frame,
    sink: &mut dyn CodeSink,
) -> CompileResult<()> {
    for id in g.ins_ids(bb) {
        let ins = g.ins(id);
        match ins.op {
            Op::Nop | Op::SetRet | Op::LoadArg => {}
            Op::IConst => {
                sink.ins(&format!("movq ${}, {}", ins.const0, reg_of(ins.dest)?));
            }
            Op::Mov => {
                sink.ins(&format!("movq {}, {}", reg_of(ins.r0)?, reg_of(ins.dest)?));
            }
            Op::Add => {
                sink.ins(&format!("addq {}, {}", reg_of(ins.r1)?, reg_of(ins.dest)?));
            }
            Op::AddI => {
                sink.ins(&format!("addq ${}, {}", ins.const0, reg_of(ins.dest)?));
            }
            Op::Cmp => {
                sink.ins(&format!("cmpq {}, {}", reg_of(ins.r1)?, reg_of(ins.r0)?));
            }
            Op::CmpI => {
                sink.ins(&format!("cmpq ${}, {}", ins.const0, reg_of(ins.r0)?));
            }
            Op::SpillVar => {
                sink.ins(&format!("movq {}, {}", reg_of(ins.r0)?, frame.slot(ins.slot())));
            }
            Op::SpillConst => {
                sink.ins(&format!("movq ${}, {}", ins.const0, frame.slot(ins.slot())));
            }
            Op::FillVar => {
                sink.ins(&format!("movq {}, {}", frame.slot(ins.slot()), reg_of(ins.dest)?));
            }
            Op::Swap => {
                sink.ins(&format!("xchgq {}, {}", reg_of(ins.r0)?, reg_of(ins.r1)?));
            }
            Op::Call | Op::VoidCall => {
                let callee = ins
                    .callee
                    .as_ref()
                    .ok_or_else(|| internal!("call without a callee"))?;
                sink.ins(&format!("callq {}", callee.name));
            }
            Op::Br => {
                let target = ins.call_infos[0].target;
                if next_in_order != Some(target) {
                    sink.ins(&format!("jmp {}", block_label(name, target)));
                }
            }
            Op::Ble | Op::Blt | Op::Bg | Op::Bge | Op::Bne | Op::Beq => {
                let taken = ins.call_infos[0].target;
                let fallthrough = ins.call_infos[1].target;
                sink.ins(&format!("{} {}", jcc(ins.op), block_label(name, taken)));
                if next_in_order != Some(fallthrough) {
                    sink.ins(&format!("jmp {}", block_label(name, fallthrough)));
                }
            }
        }
    }
    Ok(())
}

fn jcc(op: Op) -> &'static str {
    match op {
        Op::Ble => "jle",
        Op::Blt => "jl",
        Op::Bg => "jg",
        Op::Bge => "jge",
        Op::Bne => "jne",
        Op::Beq => "je",
        _ => unreachable!("not a conditional branch"),
    }
}

fn reg_of(op: Operand) -> CompileResult<Register> {
    op.phys()
        .ok_or_else(|| internal!("unallocated operand {op} reached codegen"))
}
