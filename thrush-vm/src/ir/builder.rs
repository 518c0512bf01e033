use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::rt::{RawPtr, TypeDesc};

use super::{CallId, GenericReg, Instr, OpCode, PointerReg, Program, Reg};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildError {
    DuplicateLabel(String),
    UnresolvedLabel(String),
    DanglingLabel(String),
    SlotOutOfRange(usize),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::DuplicateLabel(name) => write!(f, "duplicate label '{name}'"),
            BuildError::UnresolvedLabel(name) => write!(f, "unresolved label '{name}'"),
            BuildError::DanglingLabel(name) => {
                write!(f, "label '{name}' attached past the last instruction")
            }
            BuildError::SlotOutOfRange(slot) => {
                write!(f, "argument/return slot {slot} out of range, expected 0..8")
            }
        }
    }
}

impl std::error::Error for BuildError {}

enum RefKind {
    Branch,
    Switch(usize),
}

struct LabelRef {
    at: usize,
    kind: RefKind,
    name: String,
}

/// Fluent IR assembler. One method per opcode, labels with deferred
/// fixups, and `{n}` label-name expansion keyed to the high-level opcode
/// index pinned by `mark`. Errors accumulate and surface from `build`.
pub struct Builder {
    ins: Vec<Instr>,
    labels: HashMap<String, usize>,
    pending: Vec<String>,
    refs: Vec<LabelRef>,
    errors: Vec<BuildError>,
    pin: usize,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Builder {
            ins: Vec::new(),
            labels: HashMap::new(),
            pending: Vec::new(),
            refs: Vec::new(),
            errors: Vec::new(),
            pin: 0,
        }
    }

    fn localize(&self, name: &str) -> String {
        if name.contains("{n}") {
            name.replace("{n}", &self.pin.to_string())
        } else {
            name.to_string()
        }
    }

    /// Attach a label to the next-emitted instruction.
    pub fn label(&mut self, name: &str) -> &mut Self {
        let name = self.localize(name);
        self.pending.push(name);
        self
    }

    /// Pin the current high-level opcode index: subsequent `{n}` labels
    /// expand with it, and the positional label `at(i)` resolves to the
    /// next-emitted instruction.
    pub fn mark(&mut self, i: usize) -> &mut Self {
        self.pin = i;
        let name = Self::position_label(i);
        self.pending.push(name);
        self
    }

    /// Label name of the instruction marked with high-level index `i`.
    pub fn at(&self, i: usize) -> String {
        Self::position_label(i)
    }

    fn position_label(i: usize) -> String {
        format!("@{i}")
    }

    fn emit(&mut self, ins: Instr) -> &mut Self {
        let here = self.ins.len();
        for name in self.pending.drain(..) {
            if self.labels.insert(name.clone(), here).is_some() {
                self.errors.push(BuildError::DuplicateLabel(name));
            }
        }
        self.ins.push(ins);
        self
    }

    fn branch_to(&mut self, name: &str) {
        let name = self.localize(name);
        self.refs.push(LabelRef {
            at: self.ins.len(),
            kind: RefKind::Branch,
            name,
        });
    }

    fn check_slot(&mut self, slot: usize) -> i64 {
        if slot >= 8 {
            self.errors.push(BuildError::SlotOutOfRange(slot));
        }
        slot as i64
    }

    pub fn nop(&mut self) -> &mut Self {
        self.emit(Instr::new(OpCode::Nop))
    }

    pub fn halt(&mut self) -> &mut Self {
        self.emit(Instr::new(OpCode::Halt))
    }

    pub fn brk(&mut self) -> &mut Self {
        self.emit(Instr::new(OpCode::Break))
    }

    pub fn ip(&mut self, pr: RawPtr, pd: PointerReg) -> &mut Self {
        let mut i = Instr::new(OpCode::Ip);
        i.pr = pr;
        i.pd = pd;
        self.emit(i)
    }

    /// `ip` of a type descriptor: the descriptor's address becomes the
    /// immediate and the instruction keeps the descriptor alive.
    pub fn ipt(&mut self, vt: &Arc<TypeDesc>, pd: PointerReg) -> &mut Self {
        let mut i = Instr::new(OpCode::Ip);
        i.pr = RawPtr::new(Arc::as_ptr(vt) as *mut u8);
        i.pd = pd;
        i.vt = Some(vt.clone());
        self.emit(i)
    }

    pub fn ib(&mut self, v: i8, rx: GenericReg) -> &mut Self {
        self.addi(GenericReg::Rz, v as i64, rx)
    }

    pub fn iw(&mut self, v: i16, rx: GenericReg) -> &mut Self {
        self.addi(GenericReg::Rz, v as i64, rx)
    }

    pub fn il(&mut self, v: i32, rx: GenericReg) -> &mut Self {
        self.addi(GenericReg::Rz, v as i64, rx)
    }

    pub fn iq(&mut self, v: i64, rx: GenericReg) -> &mut Self {
        self.addi(GenericReg::Rz, v, rx)
    }

    pub fn movq(&mut self, rx: GenericReg, ry: GenericReg) -> &mut Self {
        self.addi(rx, 0, ry)
    }

    pub fn movp(&mut self, ps: PointerReg, pd: PointerReg) -> &mut Self {
        self.addpi(ps, 0, pd)
    }

    fn load(&mut self, op: OpCode, ps: PointerReg, iv: i64, rx: GenericReg) -> &mut Self {
        let mut i = Instr::new(op);
        i.ps = ps;
        i.iv = iv;
        i.rx = rx;
        self.emit(i)
    }

    pub fn lb(&mut self, ps: PointerReg, iv: i64, rx: GenericReg) -> &mut Self {
        self.load(OpCode::Lb, ps, iv, rx)
    }

    pub fn lw(&mut self, ps: PointerReg, iv: i64, rx: GenericReg) -> &mut Self {
        self.load(OpCode::Lw, ps, iv, rx)
    }

    pub fn ll(&mut self, ps: PointerReg, iv: i64, rx: GenericReg) -> &mut Self {
        self.load(OpCode::Ll, ps, iv, rx)
    }

    pub fn lq(&mut self, ps: PointerReg, iv: i64, rx: GenericReg) -> &mut Self {
        self.load(OpCode::Lq, ps, iv, rx)
    }

    pub fn lp(&mut self, ps: PointerReg, iv: i64, pd: PointerReg) -> &mut Self {
        let mut i = Instr::new(OpCode::Lp);
        i.ps = ps;
        i.iv = iv;
        i.pd = pd;
        self.emit(i)
    }

    fn store(&mut self, op: OpCode, rx: GenericReg, pd: PointerReg, iv: i64) -> &mut Self {
        let mut i = Instr::new(op);
        i.rx = rx;
        i.pd = pd;
        i.iv = iv;
        self.emit(i)
    }

    pub fn sb(&mut self, rx: GenericReg, pd: PointerReg, iv: i64) -> &mut Self {
        self.store(OpCode::Sb, rx, pd, iv)
    }

    pub fn sw(&mut self, rx: GenericReg, pd: PointerReg, iv: i64) -> &mut Self {
        self.store(OpCode::Sw, rx, pd, iv)
    }

    pub fn sl(&mut self, rx: GenericReg, pd: PointerReg, iv: i64) -> &mut Self {
        self.store(OpCode::Sl, rx, pd, iv)
    }

    pub fn sq(&mut self, rx: GenericReg, pd: PointerReg, iv: i64) -> &mut Self {
        self.store(OpCode::Sq, rx, pd, iv)
    }

    pub fn sp(&mut self, ps: PointerReg, pd: PointerReg, iv: i64) -> &mut Self {
        let mut i = Instr::new(OpCode::Sp);
        i.ps = ps;
        i.pd = pd;
        i.iv = iv;
        self.emit(i)
    }

    pub fn ldaq(&mut self, slot: usize, rx: GenericReg) -> &mut Self {
        let iv = self.check_slot(slot);
        let mut i = Instr::new(OpCode::Ldaq);
        i.iv = iv;
        i.rx = rx;
        self.emit(i)
    }

    pub fn ldap(&mut self, slot: usize, pd: PointerReg) -> &mut Self {
        let iv = self.check_slot(slot);
        let mut i = Instr::new(OpCode::Ldap);
        i.iv = iv;
        i.pd = pd;
        self.emit(i)
    }

    pub fn strq(&mut self, rx: GenericReg, slot: usize) -> &mut Self {
        let iv = self.check_slot(slot);
        let mut i = Instr::new(OpCode::Strq);
        i.rx = rx;
        i.iv = iv;
        self.emit(i)
    }

    pub fn strp(&mut self, ps: PointerReg, slot: usize) -> &mut Self {
        let iv = self.check_slot(slot);
        let mut i = Instr::new(OpCode::Strp);
        i.ps = ps;
        i.iv = iv;
        self.emit(i)
    }

    pub fn addp(&mut self, ps: PointerReg, rx: GenericReg, pd: PointerReg) -> &mut Self {
        let mut i = Instr::new(OpCode::Addp);
        i.ps = ps;
        i.rx = rx;
        i.pd = pd;
        self.emit(i)
    }

    pub fn subp(&mut self, ps: PointerReg, rx: GenericReg, pd: PointerReg) -> &mut Self {
        let mut i = Instr::new(OpCode::Subp);
        i.ps = ps;
        i.rx = rx;
        i.pd = pd;
        self.emit(i)
    }

    pub fn addpi(&mut self, ps: PointerReg, iv: i64, pd: PointerReg) -> &mut Self {
        let mut i = Instr::new(OpCode::Addpi);
        i.ps = ps;
        i.iv = iv;
        i.pd = pd;
        self.emit(i)
    }

    fn three_reg(
        &mut self,
        op: OpCode,
        rx: GenericReg,
        ry: GenericReg,
        rd: GenericReg,
    ) -> &mut Self {
        let mut i = Instr::new(op);
        i.rx = rx;
        i.ry = ry;
        i.rd = rd;
        self.emit(i)
    }

    pub fn add(&mut self, rx: GenericReg, ry: GenericReg, rd: GenericReg) -> &mut Self {
        self.three_reg(OpCode::Add, rx, ry, rd)
    }

    pub fn sub(&mut self, rx: GenericReg, ry: GenericReg, rd: GenericReg) -> &mut Self {
        self.three_reg(OpCode::Sub, rx, ry, rd)
    }

    fn imm_op(&mut self, op: OpCode, rx: GenericReg, iv: i64, ry: GenericReg) -> &mut Self {
        let mut i = Instr::new(op);
        i.rx = rx;
        i.iv = iv;
        i.ry = ry;
        self.emit(i)
    }

    pub fn addi(&mut self, rx: GenericReg, iv: i64, ry: GenericReg) -> &mut Self {
        self.imm_op(OpCode::Addi, rx, iv, ry)
    }

    pub fn subi(&mut self, rx: GenericReg, iv: i64, ry: GenericReg) -> &mut Self {
        self.imm_op(OpCode::Addi, rx, iv.wrapping_neg(), ry)
    }

    pub fn muli(&mut self, rx: GenericReg, iv: i64, ry: GenericReg) -> &mut Self {
        self.imm_op(OpCode::Muli, rx, iv, ry)
    }

    pub fn andi(&mut self, rx: GenericReg, iv: i64, ry: GenericReg) -> &mut Self {
        self.imm_op(OpCode::Andi, rx, iv, ry)
    }

    pub fn xori(&mut self, rx: GenericReg, iv: i64, ry: GenericReg) -> &mut Self {
        self.imm_op(OpCode::Xori, rx, iv, ry)
    }

    pub fn shri(&mut self, rx: GenericReg, iv: i64, ry: GenericReg) -> &mut Self {
        self.imm_op(OpCode::Shri, rx, iv, ry)
    }

    pub fn sbiti(&mut self, rx: GenericReg, iv: i64, ry: GenericReg) -> &mut Self {
        self.imm_op(OpCode::Sbiti, rx, iv, ry)
    }

    fn swap(&mut self, op: OpCode, rx: GenericReg, ry: GenericReg) -> &mut Self {
        let mut i = Instr::new(op);
        i.rx = rx;
        i.ry = ry;
        self.emit(i)
    }

    pub fn swapw(&mut self, rx: GenericReg, ry: GenericReg) -> &mut Self {
        self.swap(OpCode::Swapw, rx, ry)
    }

    pub fn swapl(&mut self, rx: GenericReg, ry: GenericReg) -> &mut Self {
        self.swap(OpCode::Swapl, rx, ry)
    }

    pub fn swapq(&mut self, rx: GenericReg, ry: GenericReg) -> &mut Self {
        self.swap(OpCode::Swapq, rx, ry)
    }

    fn branch(&mut self, op: OpCode, rx: GenericReg, ry: GenericReg, to: &str) -> &mut Self {
        self.branch_to(to);
        let mut i = Instr::new(op);
        i.rx = rx;
        i.ry = ry;
        self.emit(i)
    }

    pub fn beq(&mut self, rx: GenericReg, ry: GenericReg, to: &str) -> &mut Self {
        self.branch(OpCode::Beq, rx, ry, to)
    }

    pub fn bne(&mut self, rx: GenericReg, ry: GenericReg, to: &str) -> &mut Self {
        self.branch(OpCode::Bne, rx, ry, to)
    }

    pub fn blt(&mut self, rx: GenericReg, ry: GenericReg, to: &str) -> &mut Self {
        self.branch(OpCode::Blt, rx, ry, to)
    }

    pub fn bltu(&mut self, rx: GenericReg, ry: GenericReg, to: &str) -> &mut Self {
        self.branch(OpCode::Bltu, rx, ry, to)
    }

    pub fn bgeu(&mut self, rx: GenericReg, ry: GenericReg, to: &str) -> &mut Self {
        self.branch(OpCode::Bgeu, rx, ry, to)
    }

    pub fn beqn(&mut self, ps: PointerReg, to: &str) -> &mut Self {
        self.branch_to(to);
        let mut i = Instr::new(OpCode::Beqn);
        i.ps = ps;
        self.emit(i)
    }

    pub fn bnen(&mut self, ps: PointerReg, to: &str) -> &mut Self {
        self.branch_to(to);
        let mut i = Instr::new(OpCode::Bnen);
        i.ps = ps;
        self.emit(i)
    }

    /// Unconditional jump; the index of the jumping instruction lands in
    /// the link register (diagnostic, normally `Pn`).
    pub fn jal(&mut self, to: &str, pd: PointerReg) -> &mut Self {
        self.branch_to(to);
        let mut i = Instr::new(OpCode::Jal);
        i.pd = pd;
        self.emit(i)
    }

    /// Table switch on `rx`: one label per slot, empty = fall through.
    pub fn bsw(&mut self, rx: GenericReg, targets: &[String]) -> &mut Self {
        let here = self.ins.len();
        for (slot, name) in targets.iter().enumerate() {
            if !name.is_empty() {
                let name = self.localize(name);
                self.refs.push(LabelRef {
                    at: here,
                    kind: RefKind::Switch(slot),
                    name,
                });
            }
        }
        let mut i = Instr::new(OpCode::Bsw);
        i.rx = rx;
        i.iv = targets.len() as i64;
        self.emit(i)
    }

    pub fn bzero(&mut self, iv: i64, pd: PointerReg) -> &mut Self {
        let mut i = Instr::new(OpCode::Bzero);
        i.iv = iv;
        i.pd = pd;
        self.emit(i)
    }

    pub fn bcopy(&mut self, ps: PointerReg, rx: GenericReg, pd: PointerReg) -> &mut Self {
        let mut i = Instr::new(OpCode::Bcopy);
        i.ps = ps;
        i.rx = rx;
        i.pd = pd;
        self.emit(i)
    }

    fn call(&mut self, op: OpCode, id: CallId) -> &mut Self {
        let mut i = Instr::new(op);
        i.iv = id.raw() as i64;
        self.emit(i)
    }

    pub fn ccall(&mut self, id: CallId) -> &mut Self {
        self.call(OpCode::Ccall, id)
    }

    pub fn gcall(&mut self, id: CallId) -> &mut Self {
        self.call(OpCode::Gcall, id)
    }

    pub fn icall(&mut self, id: CallId) -> &mut Self {
        self.call(OpCode::Icall, id)
    }

    fn route_arg(&mut self, slot: usize, r: Reg) -> &mut Self {
        let last = self.ins.last_mut().expect("call argument before any instruction");
        debug_assert!(matches!(
            last.op,
            OpCode::Ccall | OpCode::Gcall | OpCode::Icall
        ));
        if last.args.len() <= slot {
            last.args.resize(slot + 1, Reg::G(GenericReg::Rz));
        }
        last.args[slot] = r;
        self
    }

    fn route_ret(&mut self, slot: usize, r: Reg) -> &mut Self {
        let last = self.ins.last_mut().expect("call return before any instruction");
        debug_assert!(matches!(
            last.op,
            OpCode::Ccall | OpCode::Gcall | OpCode::Icall
        ));
        if last.rets.len() <= slot {
            last.rets.resize(slot + 1, Reg::G(GenericReg::Rz));
        }
        last.rets[slot] = r;
        self
    }

    pub fn a0(&mut self, r: impl Into<Reg>) -> &mut Self {
        self.route_arg(0, r.into())
    }

    pub fn a1(&mut self, r: impl Into<Reg>) -> &mut Self {
        self.route_arg(1, r.into())
    }

    pub fn a2(&mut self, r: impl Into<Reg>) -> &mut Self {
        self.route_arg(2, r.into())
    }

    pub fn a3(&mut self, r: impl Into<Reg>) -> &mut Self {
        self.route_arg(3, r.into())
    }

    pub fn a4(&mut self, r: impl Into<Reg>) -> &mut Self {
        self.route_arg(4, r.into())
    }

    pub fn a5(&mut self, r: impl Into<Reg>) -> &mut Self {
        self.route_arg(5, r.into())
    }

    pub fn a6(&mut self, r: impl Into<Reg>) -> &mut Self {
        self.route_arg(6, r.into())
    }

    pub fn a7(&mut self, r: impl Into<Reg>) -> &mut Self {
        self.route_arg(7, r.into())
    }

    pub fn r0(&mut self, r: impl Into<Reg>) -> &mut Self {
        self.route_ret(0, r.into())
    }

    pub fn r1(&mut self, r: impl Into<Reg>) -> &mut Self {
        self.route_ret(1, r.into())
    }

    pub fn r2(&mut self, r: impl Into<Reg>) -> &mut Self {
        self.route_ret(2, r.into())
    }

    pub fn r3(&mut self, r: impl Into<Reg>) -> &mut Self {
        self.route_ret(3, r.into())
    }

    /// Resolve every label and fixup and produce the immutable program.
    pub fn build(mut self) -> Result<Program, BuildError> {
        if let Some(err) = self.errors.first() {
            return Err(err.clone());
        }
        if let Some(name) = self.pending.first() {
            return Err(BuildError::DanglingLabel(name.clone()));
        }

        let mut tables: HashMap<usize, Vec<i32>> = HashMap::new();
        for (i, ins) in self.ins.iter().enumerate() {
            if ins.op == OpCode::Bsw {
                tables.insert(i, vec![-1; ins.iv as usize]);
            }
        }

        for fixup in &self.refs {
            let target = *self
                .labels
                .get(&fixup.name)
                .ok_or_else(|| BuildError::UnresolvedLabel(fixup.name.clone()))?;
            match fixup.kind {
                RefKind::Branch => self.ins[fixup.at].br = target as u32,
                RefKind::Switch(slot) => {
                    if let Some(table) = tables.get_mut(&fixup.at) {
                        table[slot] = target as i32;
                    }
                }
            }
        }

        for (i, table) in tables {
            self.ins[i].sw = Some(Arc::from(table.into_boxed_slice()));
        }

        Ok(Program::new(self.ins))
    }
}
