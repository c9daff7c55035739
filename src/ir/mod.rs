// This module defines the compiler's intermediate representation: the IR
// opcode set (including the pseudo ops the register allocator introduces),
// the Operand sum type that replaces vreg-vs-physical integer masking, the
// VarState location of a value (register home, spill-slot home, or neither),
// per-edge CallInfo descriptors that stand in for phi nodes, and the flat
// instruction node stored in the per-method arena. Variable numbering for
// the liveness namespace (return slot, arguments, locals, synthetic stack
// slots) also lives here.

//! Intermediate representation: instructions, operands and edge contracts.

pub mod block;

use crate::x64::Register;

/// Virtual register index, dense per basic block.
pub type VReg = u32;

/// Liveness variable number. A single integer namespace: `0` is the return
/// slot, arguments are small negatives, locals are positive, and synthetic
/// operand-stack slots are large negatives.
pub type Var = i32;

/// Identifies a basic block within one method's flow graph.
pub type BlockId = u32;

/// Identifies an instruction node within one method's arena.
pub type InsId = u32;

/// The return-slot variable.
pub const RET_VAR: Var = 0;

/// Base of the synthetic operand-stack variable range.
pub const STACK_VAR_BASE: Var = -1_000_000;

/// Variable number for argument `index`.
pub fn arg_var(index: u32) -> Var {
    -1 - index as Var
}

/// Variable number for local `index` of a method with `param_count`
/// parameters. Locals sit above the return slot and the argument range.
pub fn local_var(index: u32, param_count: u32) -> Var {
    1 + param_count as Var + index as Var
}

/// Variable number for residual operand-stack slot `slot` (0 = bottom).
pub fn stack_var(slot: u32) -> Var {
    STACK_VAR_BASE - slot as Var
}

pub fn is_stack_var(var: Var) -> bool {
    var <= STACK_VAR_BASE
}

/// IR opcodes. `SetRet`/`LoadArg` are ABI pseudo ops inserted before
/// allocation; `SpillVar`/`SpillConst`/`FillVar`/`Swap` are introduced by the
/// allocator and must not appear earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    IConst,
    Mov,
    Add,
    AddI,
    Cmp,
    CmpI,
    Ble,
    Blt,
    Bg,
    Bge,
    Bne,
    Beq,
    Br,
    Nop,
    SetRet,
    LoadArg,
    SpillVar,
    SpillConst,
    FillVar,
    Call,
    VoidCall,
    Swap,
}

impl Op {
    /// Branch sense with swapped comparison operands (used when the
    /// front end canonicalizes a left-hand constant into an immediate).
    pub fn swapped_cmp(self) -> Op {
        match self {
            Op::Ble => Op::Bge,
            Op::Blt => Op::Bg,
            Op::Bg => Op::Blt,
            Op::Bge => Op::Ble,
            other => other,
        }
    }

    pub fn is_cond_branch(self) -> bool {
        matches!(self, Op::Ble | Op::Blt | Op::Bg | Op::Bge | Op::Bne | Op::Beq)
    }

    pub fn is_branch(self) -> bool {
        self.is_cond_branch() || self == Op::Br
    }
}

/// An instruction operand: unset, a virtual register awaiting allocation,
/// or a resolved physical register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operand {
    #[default]
    None,
    Virt(VReg),
    Phys(Register),
}

impl Operand {
    pub fn virt(self) -> Option<VReg> {
        match self {
            Operand::Virt(v) => Some(v),
            _ => None,
        }
    }

    pub fn phys(self) -> Option<Register> {
        match self {
            Operand::Phys(r) => Some(r),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::None => f.write_str("_"),
            Operand::Virt(v) => write!(f, "R{v}"),
            Operand::Phys(r) => f.write_str(r.name()),
        }
    }
}

/// Resolved location of a value: a register home, a spill-slot home, or
/// neither (not live).
///
/// Both homes may be set transiently inside the allocator — a value that is
/// register-resident and also has a valid spill copy is the cheapest
/// eviction candidate. At block boundaries exactly one home must remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VarState {
    pub reg: Option<Register>,
    pub spill: Option<u32>,
}

impl VarState {
    pub const NONE: VarState = VarState {
        reg: None,
        spill: None,
    };

    pub fn in_reg(reg: Register) -> VarState {
        VarState {
            reg: Some(reg),
            spill: None,
        }
    }

    pub fn in_spill(slot: u32) -> VarState {
        VarState {
            reg: None,
            spill: Some(slot),
        }
    }

    pub fn is_live(&self) -> bool {
        self.reg.is_some() || self.spill.is_some()
    }

    /// Whether two settled states name the same location.
    pub fn loc_eq(&self, other: &VarState) -> bool {
        debug_assert!(
            self.reg.is_none() || self.spill.is_none(),
            "comparing a dual-homed var state"
        );
        if self.reg.is_some() && self.reg == other.reg {
            return true;
        }
        if self.spill.is_some() && self.spill == other.spill {
            return true;
        }
        false
    }
}

impl std::fmt::Display for VarState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.reg, self.spill) {
            (Some(r), Some(s)) => write!(f, "(VS {r} spill[{s}])"),
            (Some(r), None) => write!(f, "(VS {r})"),
            (None, Some(s)) => write!(f, "(VS spill[{s}])"),
            (None, None) => f.write_str("(VS unk)"),
        }
    }
}

/// One control-flow edge's contract: the source virtual registers feeding
/// the target block's live-in variables, in the target's live-in order.
/// This is the system's phi-node replacement.
#[derive(Debug, Clone)]
pub struct CallInfo {
    pub args: Vec<VReg>,
    pub target: BlockId,
    /// Resolved source locations, filled by allocation.
    pub alloc_result: Option<Vec<VarState>>,
    /// Per-argument constant snapshot, filled by constant propagation.
    pub cprop_values: Option<Vec<Option<i32>>>,
    /// Set when the edge was allocated against an unfinished target.
    pub need_repairing: bool,
}

impl CallInfo {
    pub fn new(args: Vec<VReg>, target: BlockId) -> CallInfo {
        CallInfo {
            args,
            target,
            alloc_result: None,
            cprop_values: None,
            need_repairing: false,
        }
    }
}

impl std::fmt::Display for CallInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let args = self
            .args
            .iter()
            .map(|a| format!("R{a}"))
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "(BB{}, {args})", self.target)
    }
}

/// Resolved call target carried by `Call`/`VoidCall`.
#[derive(Debug, Clone)]
pub struct CalleeRef {
    pub token: u32,
    pub name: String,
    pub param_count: u32,
    pub returns: bool,
}

/// A flat, tagged instruction node. Fields unused by an opcode stay at
/// their defaults; the allocator rewrites operands in place and may retag
/// `op` (dead stores become `Nop`, spill-homed constants become
/// `SpillConst`).
#[derive(Debug, Clone, Default)]
pub struct Ins {
    pub op: Op,
    pub dest: Operand,
    pub r0: Operand,
    pub r1: Operand,
    pub const0: i32,
    pub const1: i32,
    pub call_infos: Vec<CallInfo>,
    pub callee: Option<Box<CalleeRef>>,
    pub call_args: Vec<Operand>,
    pub prev: Option<InsId>,
    pub next: Option<InsId>,
}

impl Default for Op {
    fn default() -> Op {
        Op::Nop
    }
}

impl Ins {
    pub fn new(op: Op) -> Ins {
        Ins {
            op,
            ..Ins::default()
        }
    }

    pub fn iconst(dest: VReg, value: i32) -> Ins {
        Ins {
            op: Op::IConst,
            dest: Operand::Virt(dest),
            const0: value,
            ..Ins::default()
        }
    }

    pub fn mov(dest: VReg, src: VReg) -> Ins {
        Ins {
            op: Op::Mov,
            dest: Operand::Virt(dest),
            r0: Operand::Virt(src),
            ..Ins::default()
        }
    }

    pub fn add(dest: VReg, r0: VReg, r1: VReg) -> Ins {
        Ins {
            op: Op::Add,
            dest: Operand::Virt(dest),
            r0: Operand::Virt(r0),
            r1: Operand::Virt(r1),
            ..Ins::default()
        }
    }

    pub fn add_imm(dest: VReg, r0: VReg, value: i32) -> Ins {
        Ins {
            op: Op::AddI,
            dest: Operand::Virt(dest),
            r0: Operand::Virt(r0),
            const0: value,
            ..Ins::default()
        }
    }

    pub fn cmp(r0: VReg, r1: VReg) -> Ins {
        Ins {
            op: Op::Cmp,
            r0: Operand::Virt(r0),
            r1: Operand::Virt(r1),
            ..Ins::default()
        }
    }

    pub fn cmp_imm(r0: VReg, value: i32) -> Ins {
        Ins {
            op: Op::CmpI,
            r0: Operand::Virt(r0),
            const0: value,
            ..Ins::default()
        }
    }

    /// Conditional branch: edge 0 is the taken edge, edge 1 the fallthrough.
    pub fn cond_branch(op: Op, taken: CallInfo, fallthrough: CallInfo) -> Ins {
        debug_assert!(op.is_cond_branch());
        Ins {
            op,
            call_infos: vec![taken, fallthrough],
            ..Ins::default()
        }
    }

    pub fn branch(info: CallInfo) -> Ins {
        Ins {
            op: Op::Br,
            call_infos: vec![info],
            ..Ins::default()
        }
    }

    pub fn set_ret(src: VReg) -> Ins {
        Ins {
            op: Op::SetRet,
            r0: Operand::Virt(src),
            ..Ins::default()
        }
    }

    pub fn load_arg(dest: VReg, position: u32) -> Ins {
        Ins {
            op: Op::LoadArg,
            dest: Operand::Virt(dest),
            const0: position as i32,
            ..Ins::default()
        }
    }

    /// Store `src` into spill slot `slot`.
    pub fn spill_var(src: Register, slot: u32) -> Ins {
        Ins {
            op: Op::SpillVar,
            r0: Operand::Phys(src),
            const0: slot as i32,
            ..Ins::default()
        }
    }

    /// Load spill slot `slot` into `dest`.
    pub fn fill_var(dest: Register, slot: u32) -> Ins {
        Ins {
            op: Op::FillVar,
            dest: Operand::Phys(dest),
            const0: slot as i32,
            ..Ins::default()
        }
    }

    pub fn phys_mov(dest: Register, src: Register) -> Ins {
        Ins {
            op: Op::Mov,
            dest: Operand::Phys(dest),
            r0: Operand::Phys(src),
            ..Ins::default()
        }
    }

    pub fn swap(a: Register, b: Register) -> Ins {
        Ins {
            op: Op::Swap,
            r0: Operand::Phys(a),
            r1: Operand::Phys(b),
            ..Ins::default()
        }
    }

    pub fn call(dest: Option<VReg>, callee: CalleeRef, args: Vec<VReg>) -> Ins {
        let op = if dest.is_some() { Op::Call } else { Op::VoidCall };
        Ins {
            op,
            dest: dest.map(Operand::Virt).unwrap_or_default(),
            callee: Some(Box::new(callee)),
            call_args: args.into_iter().map(Operand::Virt).collect(),
            ..Ins::default()
        }
    }

    /// Spill slot referenced by `SpillVar`/`FillVar` (`const0`) or
    /// `SpillConst` (`const1`).
    pub fn slot(&self) -> u32 {
        match self.op {
            Op::SpillConst => self.const1 as u32,
            _ => self.const0 as u32,
        }
    }
}

impl std::fmt::Display for Ins {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.op {
            Op::IConst => write!(f, "IConst {} <= {}", self.dest, self.const0),
            Op::Mov => write!(f, "Mov {} <= {}", self.dest, self.r0),
            Op::Add => write!(f, "Add {} <= {} {}", self.dest, self.r0, self.r1),
            Op::AddI => write!(f, "AddI {} <= {} [{}]", self.dest, self.r0, self.const0),
            Op::Cmp => write!(f, "Cmp {} {}", self.r0, self.r1),
            Op::CmpI => write!(f, "CmpI {} [{}]", self.r0, self.const0),
            Op::Ble | Op::Blt | Op::Bg | Op::Bge | Op::Bne | Op::Beq => write!(
                f,
                "{:?} {} {}",
                self.op, self.call_infos[0], self.call_infos[1]
            ),
            Op::Br => write!(f, "Br {}", self.call_infos[0]),
            Op::Nop => f.write_str("Nop"),
            Op::SetRet => write!(f, "SetRet {}", self.r0),
            Op::LoadArg => write!(f, "LoadArg {} <= REG_ARG [{}]", self.dest, self.const0),
            Op::SpillVar => write!(f, "SpillVar [{}] <= {}", self.const0, self.r0),
            Op::SpillConst => write!(f, "SpillConst [{}] <= [{}]", self.const1, self.const0),
            Op::FillVar => write!(f, "FillVar {} <= [{}]", self.dest, self.const0),
            Op::Swap => write!(f, "Swap {} <> {}", self.r0, self.r1),
            Op::Call | Op::VoidCall => {
                let name = self.callee.as_ref().map(|c| c.name.as_str()).unwrap_or("?");
                let args = self
                    .call_args
                    .iter()
                    .map(|a| a.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                if self.op == Op::Call {
                    write!(f, "Call {} <= {name} ({args})", self.dest)
                } else {
                    write!(f, "VoidCall {name} ({args})")
                }
            }
        }
    }
}
