use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use crate::ir::{CallId, GenericReg, Instr, OpCode, PointerReg, Program, Reg, calls};
use crate::rt::{RawPtr, Slot};

const RZ: usize = 6;
const PN: usize = 7;

/// Portable interpreter for IR programs. One instance executes one
/// program to completion on one worker; instances are pooled and must be
/// returned with `free` once the return slots have been read.
pub struct Emulator {
    program: Option<Arc<Program>>,
    pc: Option<usize>,
    uv: [u64; 7],
    pv: [RawPtr; 8],
    ar: [Slot; 8],
    rv: [Slot; 8],
}

static POOL: Mutex<Vec<Box<Emulator>>> = Mutex::new(Vec::new());

impl Emulator {
    /// Acquire a pooled instance bound to `program`, allocating a fresh
    /// one when the pool is empty.
    pub fn load(program: Arc<Program>) -> Box<Emulator> {
        let recycled = POOL.lock().unwrap_or_else(|e| e.into_inner()).pop();
        let mut emu = recycled.unwrap_or_else(|| {
            Box::new(Emulator {
                program: None,
                pc: None,
                uv: [0; 7],
                pv: [RawPtr::NULL; 8],
                ar: [Slot::default(); 8],
                rv: [Slot::default(); 8],
            })
        });
        emu.reset(program);
        emu
    }

    fn reset(&mut self, program: Arc<Program>) {
        self.pc = if program.is_empty() { None } else { Some(0) };
        self.program = Some(program);
        self.uv = [0; 7];
        self.pv = [RawPtr::NULL; 8];
        self.ar = [Slot::default(); 8];
        self.rv = [Slot::default(); 8];
    }

    /// Return the instance to the shared pool.
    pub fn free(mut self: Box<Self>) {
        self.program = None;
        self.pc = None;
        POOL.lock().unwrap_or_else(|e| e.into_inner()).push(self);
    }

    pub fn au(&mut self, i: usize, v: u64) -> &mut Self {
        self.ar[i].u = v;
        self
    }

    pub fn ap(&mut self, i: usize, v: RawPtr) -> &mut Self {
        self.ar[i].p = v;
        self
    }

    pub fn ru(&self, i: usize) -> u64 {
        self.rv[i].u
    }

    pub fn rp(&self, i: usize) -> RawPtr {
        self.rv[i].p
    }

    pub fn halted(&self) -> bool {
        self.pc.is_none()
    }

    /* call-state capability for registered handles */

    pub fn gr(&self, r: GenericReg) -> u64 {
        self.uv[r.index()]
    }

    pub fn set_gr(&mut self, r: GenericReg, v: u64) {
        self.uv[r.index()] = v;
    }

    pub fn pr(&self, r: PointerReg) -> RawPtr {
        self.pv[r.index()]
    }

    pub fn set_pr(&mut self, r: PointerReg, v: RawPtr) {
        self.pv[r.index()] = v;
    }

    pub fn arg_u(&self, ins: &Instr, k: usize) -> u64 {
        match ins.args[k] {
            Reg::G(r) => self.gr(r),
            Reg::P(r) => self.pr(r).addr(),
        }
    }

    pub fn arg_p(&self, ins: &Instr, k: usize) -> RawPtr {
        match ins.args[k] {
            Reg::G(r) => RawPtr::from_addr(self.gr(r)),
            Reg::P(r) => self.pr(r),
        }
    }

    pub fn set_ret_u(&mut self, ins: &Instr, k: usize, v: u64) {
        match ins.rets[k] {
            Reg::G(r) => self.set_gr(r, v),
            Reg::P(r) => self.set_pr(r, RawPtr::from_addr(v)),
        }
    }

    pub fn set_ret_p(&mut self, ins: &Instr, k: usize, v: RawPtr) {
        match ins.rets[k] {
            Reg::G(r) => self.set_gr(r, v.addr()),
            Reg::P(r) => self.set_pr(r, v),
        }
    }

    /// Execute until the program halts. Memory operands are raw addresses
    /// the caller keeps valid; every multi-byte access is unaligned.
    pub fn run(&mut self) {
        let Some(program) = self.program.clone() else {
            return;
        };
        let code = program.ins();

        while let Some(idx) = self.pc {
            let p = &code[idx];
            let next = idx + 1;
            self.pc = if next < code.len() { Some(next) } else { None };
            self.uv[RZ] = 0;
            self.pv[PN] = RawPtr::NULL;

            match p.op {
                OpCode::Nop => {}
                OpCode::Halt => self.pc = None,
                OpCode::Break => self.trap(idx, p),
                OpCode::Ip => self.pv[p.pd.index()] = p.pr,
                OpCode::Lb => {
                    let at = self.pv[p.ps.index()].offset(p.iv);
                    self.uv[p.rx.index()] =
                        unsafe { at.get().cast::<i8>().read_unaligned() } as i64 as u64;
                }
                OpCode::Lw => {
                    let at = self.pv[p.ps.index()].offset(p.iv);
                    self.uv[p.rx.index()] =
                        unsafe { at.get().cast::<i16>().read_unaligned() } as i64 as u64;
                }
                OpCode::Ll => {
                    let at = self.pv[p.ps.index()].offset(p.iv);
                    self.uv[p.rx.index()] =
                        unsafe { at.get().cast::<i32>().read_unaligned() } as i64 as u64;
                }
                OpCode::Lq => {
                    let at = self.pv[p.ps.index()].offset(p.iv);
                    self.uv[p.rx.index()] =
                        unsafe { at.get().cast::<i64>().read_unaligned() } as u64;
                }
                OpCode::Lp => {
                    let at = self.pv[p.ps.index()].offset(p.iv);
                    self.pv[p.pd.index()] =
                        RawPtr::new(unsafe { at.get().cast::<*mut u8>().read_unaligned() });
                }
                OpCode::Sb => {
                    let at = self.pv[p.pd.index()].offset(p.iv);
                    unsafe { at.get().write_unaligned(self.uv[p.rx.index()] as u8) };
                }
                OpCode::Sw => {
                    let at = self.pv[p.pd.index()].offset(p.iv);
                    unsafe {
                        at.get()
                            .cast::<u16>()
                            .write_unaligned(self.uv[p.rx.index()] as u16)
                    };
                }
                OpCode::Sl => {
                    let at = self.pv[p.pd.index()].offset(p.iv);
                    unsafe {
                        at.get()
                            .cast::<u32>()
                            .write_unaligned(self.uv[p.rx.index()] as u32)
                    };
                }
                OpCode::Sq => {
                    let at = self.pv[p.pd.index()].offset(p.iv);
                    unsafe { at.get().cast::<u64>().write_unaligned(self.uv[p.rx.index()]) };
                }
                OpCode::Sp => {
                    let at = self.pv[p.pd.index()].offset(p.iv);
                    unsafe {
                        at.get()
                            .cast::<*mut u8>()
                            .write_unaligned(self.pv[p.ps.index()].get())
                    };
                }
                OpCode::Ldaq => self.uv[p.rx.index()] = self.ar[p.iv as usize].u,
                OpCode::Ldap => self.pv[p.pd.index()] = self.ar[p.iv as usize].p,
                OpCode::Strq => self.rv[p.iv as usize].u = self.uv[p.rx.index()],
                OpCode::Strp => self.rv[p.iv as usize].p = self.pv[p.ps.index()],
                OpCode::Addp => {
                    self.pv[p.pd.index()] = self.pv[p.ps.index()].add(self.uv[p.rx.index()]);
                }
                OpCode::Subp => {
                    self.pv[p.pd.index()] = self.pv[p.ps.index()].sub(self.uv[p.rx.index()]);
                }
                OpCode::Addpi => self.pv[p.pd.index()] = self.pv[p.ps.index()].offset(p.iv),
                OpCode::Add => {
                    self.uv[p.rd.index()] =
                        self.uv[p.rx.index()].wrapping_add(self.uv[p.ry.index()]);
                }
                OpCode::Sub => {
                    self.uv[p.rd.index()] =
                        self.uv[p.rx.index()].wrapping_sub(self.uv[p.ry.index()]);
                }
                OpCode::Addi => {
                    self.uv[p.ry.index()] = self.uv[p.rx.index()].wrapping_add(p.iv as u64);
                }
                OpCode::Muli => {
                    self.uv[p.ry.index()] = self.uv[p.rx.index()].wrapping_mul(p.iv as u64);
                }
                OpCode::Andi => self.uv[p.ry.index()] = self.uv[p.rx.index()] & p.iv as u64,
                OpCode::Xori => self.uv[p.ry.index()] = self.uv[p.rx.index()] ^ p.iv as u64,
                OpCode::Shri => {
                    self.uv[p.ry.index()] = self.uv[p.rx.index()] >> (p.iv as u32 & 63);
                }
                OpCode::Sbiti => {
                    self.uv[p.ry.index()] = self.uv[p.rx.index()] | 1u64 << (p.iv as u32 & 63);
                }
                OpCode::Swapw => {
                    self.uv[p.ry.index()] = (self.uv[p.rx.index()] as u16).swap_bytes() as u64;
                }
                OpCode::Swapl => {
                    self.uv[p.ry.index()] = (self.uv[p.rx.index()] as u32).swap_bytes() as u64;
                }
                OpCode::Swapq => self.uv[p.ry.index()] = self.uv[p.rx.index()].swap_bytes(),
                OpCode::Beq => {
                    if self.uv[p.rx.index()] == self.uv[p.ry.index()] {
                        self.pc = Some(p.br as usize);
                    }
                }
                OpCode::Bne => {
                    if self.uv[p.rx.index()] != self.uv[p.ry.index()] {
                        self.pc = Some(p.br as usize);
                    }
                }
                OpCode::Blt => {
                    if (self.uv[p.rx.index()] as i64) < self.uv[p.ry.index()] as i64 {
                        self.pc = Some(p.br as usize);
                    }
                }
                OpCode::Bltu => {
                    if self.uv[p.rx.index()] < self.uv[p.ry.index()] {
                        self.pc = Some(p.br as usize);
                    }
                }
                OpCode::Bgeu => {
                    if self.uv[p.rx.index()] >= self.uv[p.ry.index()] {
                        self.pc = Some(p.br as usize);
                    }
                }
                OpCode::Beqn => {
                    if self.pv[p.ps.index()].is_null() {
                        self.pc = Some(p.br as usize);
                    }
                }
                OpCode::Bnen => {
                    if !self.pv[p.ps.index()].is_null() {
                        self.pc = Some(p.br as usize);
                    }
                }
                OpCode::Jal => {
                    self.pv[p.pd.index()] = RawPtr::from_addr(idx as u64);
                    self.pc = Some(p.br as usize);
                }
                OpCode::Bsw => {
                    let v = self.uv[p.rx.index()];
                    if let Some(table) = &p.sw {
                        if (v as usize) < table.len() {
                            let target = table[v as usize];
                            if target >= 0 {
                                self.pc = Some(target as usize);
                            }
                        }
                    }
                }
                OpCode::Bzero => unsafe {
                    std::ptr::write_bytes(self.pv[p.pd.index()].get(), 0, p.iv as usize);
                },
                OpCode::Bcopy => unsafe {
                    std::ptr::copy(
                        self.pv[p.ps.index()].get(),
                        self.pv[p.pd.index()].get(),
                        self.uv[p.rx.index()] as usize,
                    );
                },
                OpCode::Ccall | OpCode::Gcall | OpCode::Icall => {
                    let call = calls::lookup_call(CallId::from_raw(p.iv as u32));
                    call.call(self, p);
                }
            }
        }
    }

    fn trap(&self, idx: usize, ins: &Instr) {
        tracing::warn!(pc = idx, instr = %ins, "debugger break\n{}", self.dump());
    }

    pub fn dump(&self) -> String {
        let mut out = String::from("Emulator {\n");
        match self.pc {
            Some(pc) => {
                let _ = writeln!(out, "    pc  @{pc}");
            }
            None => {
                let _ = writeln!(out, "    pc  <halted>");
            }
        }
        for (i, v) in self.uv.iter().take(6).enumerate() {
            let _ = writeln!(out, "    r{i}  {v:#x}");
        }
        out.push_str("   ----\n");
        for (i, v) in self.pv.iter().take(7).enumerate() {
            let _ = writeln!(out, "    p{i}  {v:?}");
        }
        out.push('}');
        out
    }
}
