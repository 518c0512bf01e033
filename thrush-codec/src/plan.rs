use std::sync::Arc;

use vm::rt::TypeDesc;

/// Protocol-level decoder opcodes as produced by the schema reflector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanOp {
    Int,
    Str,
    Bin,
    Enum,
    Size,
    Type,
    Seek,
    Deref,
    CtrLoad,
    CtrDecr,
    CtrIsZero,
    MapAlloc,
    MapClose,
    MapSetI8,
    MapSetI16,
    MapSetI32,
    MapSetI64,
    MapSetStr,
    MapSetPointer,
    ListAlloc,
    StructSkip,
    StructIgnore,
    StructBitmap,
    StructSwitch,
    StructRequire,
    StructIsStop,
    StructMarkTag,
    StructReadType,
    StructCheckType,
    MakeState,
    DropState,
    Construct,
    Defer,
    Goto,
    Halt,
}

/// One plan instruction. `sw` is the sparse field table: for
/// `StructSwitch` it maps field id to plan index (-1 = unknown field);
/// for `StructBitmap`/`StructRequire` it lists required field ids.
#[derive(Clone, Debug)]
pub struct PlanInstr {
    pub op: PlanOp,
    pub iv: i64,
    pub tx: u8,
    pub to: usize,
    pub vt: Option<Arc<TypeDesc>>,
    pub sw: Vec<i32>,
}

impl PlanInstr {
    pub fn new(op: PlanOp) -> Self {
        PlanInstr {
            op,
            iv: 0,
            tx: 0,
            to: 0,
            vt: None,
            sw: Vec::new(),
        }
    }

    pub fn with_iv(mut self, iv: i64) -> Self {
        self.iv = iv;
        self
    }

    pub fn with_tx(mut self, tx: u8) -> Self {
        self.tx = tx;
        self
    }

    pub fn with_to(mut self, to: usize) -> Self {
        self.to = to;
        self
    }

    pub fn with_vt(mut self, vt: &Arc<TypeDesc>) -> Self {
        self.vt = Some(vt.clone());
        self
    }

    pub fn with_sw(mut self, sw: Vec<i32>) -> Self {
        self.sw = sw;
        self
    }
}

pub type Plan = Vec<PlanInstr>;
