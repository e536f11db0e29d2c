use crate::op::Opcode;
use crate::vbn::write_vbn;

/// A block handle returned by [`BytecodeBuilder::declare_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockId(pub u32);

/// Assembles the instruction stream and block-offset table of one function.
///
/// Branch operands reference blocks by index, so forward branches need no
/// fixups: declare the target block up front, emit the branch, and bind the
/// block when its code starts.
///
/// ```
/// use bytecode::{BytecodeBuilder, Opcode};
///
/// let mut b = BytecodeBuilder::new();
/// let entry = b.start_block();
/// let exit = b.declare_block();
/// b.emit_vbn(Opcode::I64, 1);
/// b.branch(exit);
/// b.bind_block(exit);
/// b.emit(Opcode::Ret);
/// let (code, offsets) = b.finish();
/// assert_eq!(offsets[entry.0 as usize], 0);
/// assert_eq!(code[offsets[exit.0 as usize] as usize], Opcode::Ret as u8);
/// ```
pub struct BytecodeBuilder {
    code: Vec<u8>,
    block_offsets: Vec<u32>,
}

const OFFSET_UNBOUND: u32 = u32::MAX;

impl BytecodeBuilder {
    pub fn new() -> BytecodeBuilder {
        BytecodeBuilder { code: Vec::new(), block_offsets: Vec::new() }
    }

    /// Reserve a block index to be bound later.
    pub fn declare_block(&mut self) -> BlockId {
        self.block_offsets.push(OFFSET_UNBOUND);
        BlockId(self.block_offsets.len() as u32 - 1)
    }

    /// Bind a declared block to the current position.
    pub fn bind_block(&mut self, block: BlockId) {
        debug_assert_eq!(
            self.block_offsets[block.0 as usize], OFFSET_UNBOUND,
            "block bound twice"
        );
        self.block_offsets[block.0 as usize] = self.code.len() as u32;
    }

    /// Declare and immediately bind a block at the current position.
    pub fn start_block(&mut self) -> BlockId {
        let block = self.declare_block();
        self.bind_block(block);
        block
    }

    pub fn offset(&self) -> usize {
        self.code.len()
    }

    // ── Emitters ───────────────────────────────────────────────────

    pub fn emit(&mut self, op: Opcode) {
        self.code.push(op as u8);
    }

    pub fn operand(&mut self, value: i64) {
        write_vbn(&mut self.code, value);
    }

    pub fn emit_vbn(&mut self, op: Opcode, a: i64) {
        self.emit(op);
        self.operand(a);
    }

    pub fn emit_vbn2(&mut self, op: Opcode, a: i64, b: i64) {
        self.emit(op);
        self.operand(a);
        self.operand(b);
    }

    pub fn emit_vbn3(&mut self, op: Opcode, a: i64, b: i64, c: i64) {
        self.emit(op);
        self.operand(a);
        self.operand(b);
        self.operand(c);
    }

    pub fn f32_const(&mut self, value: f32) {
        self.emit(Opcode::F32);
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn f64_const(&mut self, value: f64) {
        self.emit(Opcode::F64);
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn branch(&mut self, target: BlockId) {
        self.emit_vbn(Opcode::Branch, target.0 as i64);
    }

    pub fn branch_if(&mut self, true_block: BlockId, false_block: BlockId) {
        self.emit_vbn2(Opcode::BranchIf, true_block.0 as i64, false_block.0 as i64);
    }

    pub fn push_try(&mut self, try_block: BlockId, catch_block: BlockId) {
        self.emit_vbn2(Opcode::PushTry, try_block.0 as i64, catch_block.0 as i64);
    }

    pub fn pop_try(&mut self, done_block: BlockId) {
        self.emit_vbn(Opcode::PopTry, done_block.0 as i64);
    }

    pub fn finish(self) -> (Vec<u8>, Vec<u32>) {
        assert!(
            self.block_offsets.iter().all(|&offset| offset != OFFSET_UNBOUND),
            "unbound block in function"
        );
        (self.code, self.block_offsets)
    }
}

impl Default for BytecodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vbn::read_vbn;

    #[test]
    fn forward_branches_resolve_through_block_indices() {
        let mut b = BytecodeBuilder::new();
        let entry = b.start_block();
        let exit = b.declare_block();
        b.branch(exit);
        b.bind_block(exit);
        b.emit(Opcode::Ret);
        let (code, offsets) = b.finish();

        assert_eq!(offsets[entry.0 as usize], 0);
        assert_eq!(code[0], Opcode::Branch as u8);
        let mut offset = 1;
        let target = read_vbn(&code, &mut offset).unwrap();
        assert_eq!(target, exit.0 as i64);
        assert_eq!(code[offsets[target as usize] as usize], Opcode::Ret as u8);
    }

    #[test]
    #[should_panic(expected = "unbound block")]
    fn unbound_block_is_rejected() {
        let mut b = BytecodeBuilder::new();
        let dangling = b.declare_block();
        b.branch(dangling);
        let _ = b.finish();
    }

    #[test]
    fn float_immediates_are_raw_little_endian() {
        let mut b = BytecodeBuilder::new();
        b.start_block();
        b.f64_const(1.5);
        let (code, _) = b.finish();
        assert_eq!(code[0], Opcode::F64 as u8);
        assert_eq!(&code[1..9], &1.5f64.to_le_bytes());
    }
}
