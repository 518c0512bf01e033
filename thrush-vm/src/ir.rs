use std::fmt;
use std::sync::Arc;

use crate::rt::{RawPtr, TypeDesc};

pub mod builder;
pub mod calls;

pub use builder::{BuildError, Builder};
pub use calls::{
    CallHandle, CallId, CallKind, lookup_call, register_ccall, register_gcall, register_icall,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenericReg {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    /// Hard-wired zero: reads 0, writes are discarded.
    Rz,
}

impl GenericReg {
    pub(crate) fn index(self) -> usize {
        match self {
            GenericReg::R0 => 0,
            GenericReg::R1 => 1,
            GenericReg::R2 => 2,
            GenericReg::R3 => 3,
            GenericReg::R4 => 4,
            GenericReg::R5 => 5,
            GenericReg::Rz => 6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            GenericReg::R0 => "r0",
            GenericReg::R1 => "r1",
            GenericReg::R2 => "r2",
            GenericReg::R3 => "r3",
            GenericReg::R4 => "r4",
            GenericReg::R5 => "r5",
            GenericReg::Rz => "rz",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointerReg {
    P0,
    P1,
    P2,
    P3,
    P4,
    P5,
    P6,
    /// Hard-wired null: reads null, writes are discarded.
    Pn,
}

impl PointerReg {
    pub(crate) fn index(self) -> usize {
        match self {
            PointerReg::P0 => 0,
            PointerReg::P1 => 1,
            PointerReg::P2 => 2,
            PointerReg::P3 => 3,
            PointerReg::P4 => 4,
            PointerReg::P5 => 5,
            PointerReg::P6 => 6,
            PointerReg::Pn => 7,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PointerReg::P0 => "p0",
            PointerReg::P1 => "p1",
            PointerReg::P2 => "p2",
            PointerReg::P3 => "p3",
            PointerReg::P4 => "p4",
            PointerReg::P5 => "p5",
            PointerReg::P6 => "p6",
            PointerReg::Pn => "pn",
        }
    }
}

/// Either register bank, for call argument/return routing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reg {
    G(GenericReg),
    P(PointerReg),
}

impl Reg {
    pub fn name(self) -> &'static str {
        match self {
            Reg::G(r) => r.name(),
            Reg::P(r) => r.name(),
        }
    }
}

impl From<GenericReg> for Reg {
    fn from(r: GenericReg) -> Self {
        Reg::G(r)
    }
}

impl From<PointerReg> for Reg {
    fn from(r: PointerReg) -> Self {
        Reg::P(r)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    Nop,
    Ip,
    Lb,
    Lw,
    Ll,
    Lq,
    Lp,
    Sb,
    Sw,
    Sl,
    Sq,
    Sp,
    Ldaq,
    Ldap,
    Strq,
    Strp,
    Addp,
    Subp,
    Addpi,
    Add,
    Sub,
    Addi,
    Muli,
    Andi,
    Xori,
    Shri,
    Sbiti,
    Swapw,
    Swapl,
    Swapq,
    Beq,
    Bne,
    Blt,
    Bltu,
    Bgeu,
    Beqn,
    Bnen,
    Jal,
    Bsw,
    Bzero,
    Bcopy,
    Ccall,
    Gcall,
    Icall,
    Halt,
    Break,
}

impl OpCode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            OpCode::Nop => "nop",
            OpCode::Ip => "ip",
            OpCode::Lb => "lb",
            OpCode::Lw => "lw",
            OpCode::Ll => "ll",
            OpCode::Lq => "lq",
            OpCode::Lp => "lp",
            OpCode::Sb => "sb",
            OpCode::Sw => "sw",
            OpCode::Sl => "sl",
            OpCode::Sq => "sq",
            OpCode::Sp => "sp",
            OpCode::Ldaq => "ldaq",
            OpCode::Ldap => "ldap",
            OpCode::Strq => "strq",
            OpCode::Strp => "strp",
            OpCode::Addp => "addp",
            OpCode::Subp => "subp",
            OpCode::Addpi => "addpi",
            OpCode::Add => "add",
            OpCode::Sub => "sub",
            OpCode::Addi => "addi",
            OpCode::Muli => "muli",
            OpCode::Andi => "andi",
            OpCode::Xori => "xori",
            OpCode::Shri => "shri",
            OpCode::Sbiti => "sbiti",
            OpCode::Swapw => "swapw",
            OpCode::Swapl => "swapl",
            OpCode::Swapq => "swapq",
            OpCode::Beq => "beq",
            OpCode::Bne => "bne",
            OpCode::Blt => "blt",
            OpCode::Bltu => "bltu",
            OpCode::Bgeu => "bgeu",
            OpCode::Beqn => "beqn",
            OpCode::Bnen => "bnen",
            OpCode::Jal => "jal",
            OpCode::Bsw => "bsw",
            OpCode::Bzero => "bzero",
            OpCode::Bcopy => "bcopy",
            OpCode::Ccall => "ccall",
            OpCode::Gcall => "gcall",
            OpCode::Icall => "icall",
            OpCode::Halt => "halt",
            OpCode::Break => "break",
        }
    }
}

pub const NO_BRANCH: u32 = u32::MAX;

/// One IR instruction. Operand fields are populated per opcode group;
/// unused fields stay at their defaults. `br` and `sw` slots hold indices
/// into the owning program once built.
#[derive(Clone, Debug)]
pub struct Instr {
    pub op: OpCode,
    pub rx: GenericReg,
    pub ry: GenericReg,
    pub rd: GenericReg,
    pub ps: PointerReg,
    pub pd: PointerReg,
    pub iv: i64,
    pub pr: RawPtr,
    pub br: u32,
    pub vt: Option<Arc<TypeDesc>>,
    pub sw: Option<Arc<[i32]>>,
    pub args: Vec<Reg>,
    pub rets: Vec<Reg>,
}

impl Instr {
    pub(crate) fn new(op: OpCode) -> Self {
        Instr {
            op,
            rx: GenericReg::Rz,
            ry: GenericReg::Rz,
            rd: GenericReg::Rz,
            ps: PointerReg::Pn,
            pd: PointerReg::Pn,
            iv: 0,
            pr: RawPtr::NULL,
            br: NO_BRANCH,
            vt: None,
            sw: None,
            args: Vec::new(),
            rets: Vec::new(),
        }
    }

    fn fmt_call(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = calls::call_name(CallId::from_raw(self.iv as u32));
        write!(f, "{} {}(", self.op.mnemonic(), name)?;
        for (i, r) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", r.name())?;
        }
        write!(f, ")")?;
        if !self.rets.is_empty() {
            write!(f, " -> (")?;
            for (i, r) in self.rets.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", r.name())?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.op.mnemonic();
        match self.op {
            OpCode::Nop | OpCode::Halt | OpCode::Break => write!(f, "{m}"),
            OpCode::Ip => {
                write!(f, "{m} {:?} -> {}", self.pr, self.pd.name())?;
                if let Some(vt) = &self.vt {
                    write!(f, " ; {}", vt.name)?;
                }
                Ok(())
            }
            OpCode::Lb | OpCode::Lw | OpCode::Ll | OpCode::Lq => {
                write!(f, "{m} {}{:+} -> {}", self.ps.name(), self.iv, self.rx.name())
            }
            OpCode::Lp => {
                write!(f, "{m} {}{:+} -> {}", self.ps.name(), self.iv, self.pd.name())
            }
            OpCode::Sb | OpCode::Sw | OpCode::Sl | OpCode::Sq => {
                write!(f, "{m} {} -> {}{:+}", self.rx.name(), self.pd.name(), self.iv)
            }
            OpCode::Sp => {
                write!(f, "{m} {} -> {}{:+}", self.ps.name(), self.pd.name(), self.iv)
            }
            OpCode::Ldaq => write!(f, "{m} #{} -> {}", self.iv, self.rx.name()),
            OpCode::Ldap => write!(f, "{m} #{} -> {}", self.iv, self.pd.name()),
            OpCode::Strq => write!(f, "{m} {} -> #{}", self.rx.name(), self.iv),
            OpCode::Strp => write!(f, "{m} {} -> #{}", self.ps.name(), self.iv),
            OpCode::Addp | OpCode::Subp => write!(
                f,
                "{m} {}, {} -> {}",
                self.ps.name(),
                self.rx.name(),
                self.pd.name()
            ),
            OpCode::Addpi => {
                write!(f, "{m} {}{:+} -> {}", self.ps.name(), self.iv, self.pd.name())
            }
            OpCode::Add | OpCode::Sub => write!(
                f,
                "{m} {}, {} -> {}",
                self.rx.name(),
                self.ry.name(),
                self.rd.name()
            ),
            OpCode::Addi
            | OpCode::Muli
            | OpCode::Andi
            | OpCode::Xori
            | OpCode::Shri
            | OpCode::Sbiti => write!(
                f,
                "{m} {}, {:#x} -> {}",
                self.rx.name(),
                self.iv,
                self.ry.name()
            ),
            OpCode::Swapw | OpCode::Swapl | OpCode::Swapq => {
                write!(f, "{m} {} -> {}", self.rx.name(), self.ry.name())
            }
            OpCode::Beq | OpCode::Bne | OpCode::Blt | OpCode::Bltu | OpCode::Bgeu => write!(
                f,
                "{m} {}, {} -> @{}",
                self.rx.name(),
                self.ry.name(),
                self.br
            ),
            OpCode::Beqn | OpCode::Bnen => write!(f, "{m} {} -> @{}", self.ps.name(), self.br),
            OpCode::Jal => write!(f, "{m} @{}, {}", self.br, self.pd.name()),
            OpCode::Bsw => {
                let width = self.sw.as_ref().map_or(0, |t| t.len());
                write!(f, "{m} {}, [{width}]", self.rx.name())
            }
            OpCode::Bzero => write!(f, "{m} {} -> {}", self.iv, self.pd.name()),
            OpCode::Bcopy => write!(
                f,
                "{m} {} -> {}, len={}",
                self.ps.name(),
                self.pd.name(),
                self.rx.name()
            ),
            OpCode::Ccall | OpCode::Gcall | OpCode::Icall => self.fmt_call(f),
        }
    }
}

/// An immutable, fully linked instruction sequence. Fall-through is the
/// next index; running off the end halts. Safe to share across workers.
#[derive(Debug)]
pub struct Program {
    ins: Box<[Instr]>,
}

impl Program {
    pub(crate) fn new(ins: Vec<Instr>) -> Self {
        Program {
            ins: ins.into_boxed_slice(),
        }
    }

    pub fn ins(&self) -> &[Instr] {
        &self.ins
    }

    pub fn len(&self) -> usize {
        self.ins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ins.is_empty()
    }

    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for (i, ins) in self.ins.iter().enumerate() {
            out.push_str(&format!("{i:4}: {ins}\n"));
        }
        out
    }
}
