pub mod emu;
pub mod ir;
pub mod rt;

pub use emu::Emulator;
pub use ir::{
    BuildError, Builder, CallHandle, CallId, CallKind, GenericReg, Instr, OpCode, PointerReg,
    Program, Reg, lookup_call, register_ccall, register_gcall, register_icall,
};
pub use rt::{KeyClass, RawPtr, Slot, TypeDesc, TypeKind};
