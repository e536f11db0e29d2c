mod builder;
mod op;
mod vbn;

pub use builder::{BlockId, BytecodeBuilder};
pub use op::Opcode;
pub use vbn::{read_vbn, read_vbn_unchecked, write_vbn};
