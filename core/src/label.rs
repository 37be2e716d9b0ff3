/// Branch target inside one block.
///
/// A branch may name a label before it is placed; the lowering pass
/// records the operand offset and fills it in when the label lands.
#[derive(Debug, Clone)]
pub struct Label {
    pub id: u32,
    /// Arena offset once placed.
    pub offset: Option<usize>,
    /// Arena offsets of 32-bit branch operands still waiting for
    /// `offset`.
    pub pending: Vec<usize>,
}

impl Label {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            offset: None,
            pending: Vec::new(),
        }
    }

    /// Place the label and hand back the operands to patch.
    pub fn place(&mut self, offset: usize) -> Vec<usize> {
        self.offset = Some(offset);
        std::mem::take(&mut self.pending)
    }

    /// Referenced but never placed.
    pub fn is_dangling(&self) -> bool {
        self.offset.is_none() && !self.pending.is_empty()
    }
}
