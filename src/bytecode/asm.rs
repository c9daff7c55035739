//! A small bytecode assembler for building method bodies in tests.
//!
//! Forward branches reference labels that are patched in [`BodyAsm::finish`].
//! Misuse (unknown labels, out-of-range displacements) panics: this is test
//! scaffolding, not part of the compilation pipeline.

use hashbrown::HashMap;

use super::Opcode;

/// Builder for a method body byte vector.
#[derive(Default)]
pub struct BodyAsm {
    bytes: Vec<u8>,
    labels: HashMap<String, u32>,
    fixups: Vec<(usize, String)>,
}

impl BodyAsm {
    pub fn new() -> BodyAsm {
        BodyAsm::default()
    }

    pub fn nop(&mut self) -> &mut Self {
        self.op(Opcode::Nop)
    }

    /// Load an integer constant, choosing the shortest encoding.
    pub fn ldc(&mut self, value: i32) -> &mut Self {
        match value {
            0 => self.op(Opcode::Ldc0),
            1 => self.op(Opcode::Ldc1),
            2 => self.op(Opcode::Ldc2),
            3 => self.op(Opcode::Ldc3),
            4 => self.op(Opcode::Ldc4),
            5 => self.op(Opcode::Ldc5),
            v if (-128..=127).contains(&v) => {
                self.op(Opcode::LdcS);
                self.bytes.push(v as i8 as u8);
                self
            }
            v => {
                self.op(Opcode::LdcI);
                self.bytes.extend_from_slice(&v.to_le_bytes());
                self
            }
        }
    }

    pub fn ldloc(&mut self, index: u8) -> &mut Self {
        match index {
            0 => self.op(Opcode::Ldloc0),
            1 => self.op(Opcode::Ldloc1),
            2 => self.op(Opcode::Ldloc2),
            3 => self.op(Opcode::Ldloc3),
            i => {
                self.op(Opcode::LdlocS);
                self.bytes.push(i);
                self
            }
        }
    }

    pub fn stloc(&mut self, index: u8) -> &mut Self {
        match index {
            0 => self.op(Opcode::Stloc0),
            1 => self.op(Opcode::Stloc1),
            2 => self.op(Opcode::Stloc2),
            3 => self.op(Opcode::Stloc3),
            i => {
                self.op(Opcode::StlocS);
                self.bytes.push(i);
                self
            }
        }
    }

    pub fn ldarg(&mut self, index: u8) -> &mut Self {
        match index {
            0 => self.op(Opcode::Ldarg0),
            1 => self.op(Opcode::Ldarg1),
            2 => self.op(Opcode::Ldarg2),
            3 => self.op(Opcode::Ldarg3),
            i => {
                self.op(Opcode::LdargS);
                self.bytes.push(i);
                self
            }
        }
    }

    pub fn starg(&mut self, index: u8) -> &mut Self {
        self.op(Opcode::StargS);
        self.bytes.push(index);
        self
    }

    pub fn add(&mut self) -> &mut Self {
        self.op(Opcode::Add)
    }

    pub fn br(&mut self, label: &str) -> &mut Self {
        self.branch(Opcode::Br, label)
    }

    pub fn ble(&mut self, label: &str) -> &mut Self {
        self.branch(Opcode::Ble, label)
    }

    pub fn blt(&mut self, label: &str) -> &mut Self {
        self.branch(Opcode::Blt, label)
    }

    pub fn bgt(&mut self, label: &str) -> &mut Self {
        self.branch(Opcode::Bgt, label)
    }

    pub fn bge(&mut self, label: &str) -> &mut Self {
        self.branch(Opcode::Bge, label)
    }

    pub fn beq(&mut self, label: &str) -> &mut Self {
        self.branch(Opcode::Beq, label)
    }

    pub fn bne(&mut self, label: &str) -> &mut Self {
        self.branch(Opcode::Bne, label)
    }

    pub fn brtrue(&mut self, label: &str) -> &mut Self {
        self.branch(Opcode::Brtrue, label)
    }

    pub fn brfalse(&mut self, label: &str) -> &mut Self {
        self.branch(Opcode::Brfalse, label)
    }

    pub fn ret(&mut self) -> &mut Self {
        self.op(Opcode::Ret)
    }

    pub fn call(&mut self, token: u32) -> &mut Self {
        self.op(Opcode::Call);
        self.bytes.extend_from_slice(&token.to_le_bytes());
        self
    }

    pub fn throw(&mut self) -> &mut Self {
        self.op(Opcode::Throw)
    }

    /// Define `label` at the current offset.
    pub fn label(&mut self, label: &str) -> &mut Self {
        let offset = self.bytes.len() as u32;
        if self.labels.insert(label.to_string(), offset).is_some() {
            panic!("label {label} defined twice");
        }
        self
    }

    /// Patch branch fixups and return the body bytes.
    pub fn finish(&mut self) -> Vec<u8> {
        for (pos, label) in self.fixups.drain(..) {
            let target = *self
                .labels
                .get(&label)
                .unwrap_or_else(|| panic!("undefined label {label}"));
            let next = pos as i64 + 1;
            let rel = target as i64 - next;
            if !(-128..=127).contains(&rel) {
                panic!("branch to {label} out of short range ({rel})");
            }
            self.bytes[pos] = rel as i8 as u8;
        }
        std::mem::take(&mut self.bytes)
    }

    fn op(&mut self, op: Opcode) -> &mut Self {
        self.bytes.push(op as u8);
        self
    }

    fn branch(&mut self, op: Opcode, label: &str) -> &mut Self {
        self.op(op);
        self.fixups.push((self.bytes.len(), label.to_string()));
        self.bytes.push(0);
        self
    }
}
