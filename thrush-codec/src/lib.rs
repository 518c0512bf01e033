pub mod decoder;
pub mod host;
pub mod plan;
pub mod state;
pub mod wire;

pub use decoder::{
    DecodeError, DecodeErrorKind, Decoder, Linker, TranslateError, link, set_linker, translate,
};
pub use plan::{Plan, PlanInstr, PlanOp};
pub use state::RuntimeState;
