use serde::{Deserialize, Serialize};

use super::statement::{JumpData, JumpTarget, Statement, StatementKind};
use super::term::{BinaryOp, Direction, MemoryLocation, Term, TermKind, UnaryOp};
use super::{BlockId, StmtId, TermId};

/// 基本ブロック
///
/// 文はIDの列として保持し、実体はProgramのアリーナにある
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicBlock {
    pub id: BlockId,
    /// 先頭の機械語アドレス（合成ブロックはNone）
    pub address: Option<u64>,
    pub statements: Vec<StmtId>,
    pub successors: Vec<BlockId>,
    pub predecessors: Vec<BlockId>,
}

impl BasicBlock {
    fn new(id: BlockId, address: Option<u64>) -> Self {
        Self {
            id,
            address,
            statements: Vec::new(),
            successors: Vec::new(),
            predecessors: Vec::new(),
        }
    }
}

/// IRプログラム
///
/// 項・文・基本ブロックのアリーナ。生成後の相互参照はすべてIDを経由する
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    terms: Vec<Term>,
    statements: Vec<Statement>,
    blocks: Vec<BasicBlock>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    // ===== ブロック =====

    pub fn add_block(&mut self, address: Option<u64>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::new(id, address));
        id
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.0 as usize]
    }

    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.iter()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// アドレスからブロックを検索
    pub fn block_at(&self, address: u64) -> Option<BlockId> {
        self.blocks.iter().find(|b| b.address == Some(address)).map(|b| b.id)
    }

    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        if !self.blocks[from.0 as usize].successors.contains(&to) {
            self.blocks[from.0 as usize].successors.push(to);
        }
        if !self.blocks[to.0 as usize].predecessors.contains(&from) {
            self.blocks[to.0 as usize].predecessors.push(from);
        }
    }

    /// ブロック末尾のジャンプ文
    pub fn terminating_jump(&self, block: BlockId) -> Option<StmtId> {
        let last = *self.block(block).statements.last()?;
        self.statement(last).as_jump().map(|_| last)
    }

    // ===== 項 =====

    pub fn term(&self, id: TermId) -> &Term {
        &self.terms[id.0 as usize]
    }

    pub fn term_mut(&mut self, id: TermId) -> &mut Term {
        &mut self.terms[id.0 as usize]
    }

    pub fn terms(&self) -> impl Iterator<Item = &Term> {
        self.terms.iter()
    }

    pub fn term_count(&self) -> usize {
        self.terms.len()
    }

    fn add_term(&mut self, kind: TermKind, direction: Direction, size: u32) -> TermId {
        let id = TermId(self.terms.len() as u32);
        self.terms.push(Term {
            id,
            kind,
            direction,
            size,
            source: None,
            statement: None,
        });
        id
    }

    pub fn int_const(&mut self, value: u64, size: u32) -> TermId {
        self.add_term(TermKind::IntConst { value }, Direction::Read, size)
    }

    pub fn intrinsic(&mut self, name: &str, size: u32) -> TermId {
        self.add_term(TermKind::Intrinsic { name: name.to_string() }, Direction::Read, size)
    }

    pub fn undefined(&mut self, size: u32) -> TermId {
        self.add_term(TermKind::Undefined, Direction::Read, size)
    }

    pub fn access(&mut self, location: MemoryLocation, direction: Direction) -> TermId {
        let size = location.size;
        self.add_term(TermKind::MemoryLocationAccess { location }, direction, size)
    }

    pub fn dereference(&mut self, address: TermId, direction: Direction, size: u32) -> TermId {
        self.add_term(TermKind::Dereference { address }, direction, size)
    }

    pub fn unary(&mut self, op: UnaryOp, operand: TermId, size: u32) -> TermId {
        self.add_term(TermKind::UnaryOperator { op, operand }, Direction::Read, size)
    }

    pub fn binary(&mut self, op: BinaryOp, left: TermId, right: TermId, size: u32) -> TermId {
        self.add_term(TermKind::BinaryOperator { op, left, right }, Direction::Read, size)
    }

    pub fn choice(&mut self, preferred: TermId, default: TermId) -> TermId {
        let size = self.term(preferred).size;
        self.add_term(TermKind::Choice { preferred, default }, Direction::Read, size)
    }

    /// 項（とその部分項）を文に帰属させる
    pub fn attach_term(&mut self, term: TermId, stmt: StmtId) {
        self.term_mut(term).statement = Some(stmt);
        match self.term(term).kind.clone() {
            TermKind::Dereference { address } => self.attach_term(address, stmt),
            TermKind::UnaryOperator { operand, .. } => self.attach_term(operand, stmt),
            TermKind::BinaryOperator { left, right, .. } => {
                self.attach_term(left, stmt);
                self.attach_term(right, stmt);
            }
            TermKind::Choice { preferred, default } => {
                self.attach_term(preferred, stmt);
                self.attach_term(default, stmt);
            }
            _ => {}
        }
    }

    /// 項自身とそこから到達可能な部分項をすべて集める
    pub fn collect_subterms(&self, term: TermId, out: &mut Vec<TermId>) {
        out.push(term);
        match self.term(term).kind {
            TermKind::Dereference { address } => self.collect_subterms(address, out),
            TermKind::UnaryOperator { operand, .. } => self.collect_subterms(operand, out),
            TermKind::BinaryOperator { left, right, .. } => {
                self.collect_subterms(left, out);
                self.collect_subterms(right, out);
            }
            TermKind::Choice { preferred, default } => {
                self.collect_subterms(preferred, out);
                self.collect_subterms(default, out);
            }
            _ => {}
        }
    }

    // ===== 文 =====

    pub fn statement(&self, id: StmtId) -> &Statement {
        &self.statements[id.0 as usize]
    }

    pub fn statement_mut(&mut self, id: StmtId) -> &mut Statement {
        &mut self.statements[id.0 as usize]
    }

    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    fn push_statement(&mut self, block: BlockId, address: Option<u64>, kind: StatementKind) -> StmtId {
        let id = StmtId(self.statements.len() as u32);
        self.statements.push(Statement { id, address, kind });
        self.blocks[block.0 as usize].statements.push(id);
        id
    }

    pub fn push_comment(&mut self, block: BlockId, address: Option<u64>, text: &str) -> StmtId {
        self.push_statement(block, address, StatementKind::Comment { text: text.to_string() })
    }

    pub fn push_inline_assembly(&mut self, block: BlockId, address: Option<u64>, text: &str) -> StmtId {
        self.push_statement(block, address, StatementKind::InlineAssembly { text: text.to_string() })
    }

    /// 代入文を追加する
    ///
    /// 左辺のsourceに右辺を記録し、両辺の項を文に帰属させる
    pub fn push_assignment(&mut self, block: BlockId, address: Option<u64>, left: TermId, right: TermId) -> StmtId {
        let id = self.push_statement(block, address, StatementKind::Assignment { left, right });
        self.term_mut(left).source = Some(right);
        self.attach_term(left, id);
        self.attach_term(right, id);
        id
    }

    pub fn push_kill(&mut self, block: BlockId, address: Option<u64>, target: TermId) -> StmtId {
        let id = self.push_statement(block, address, StatementKind::Kill { target });
        self.attach_term(target, id);
        id
    }

    pub fn push_jump(
        &mut self,
        block: BlockId,
        address: Option<u64>,
        condition: Option<TermId>,
        then_target: JumpTarget,
        else_target: Option<JumpTarget>,
    ) -> StmtId {
        let id = self.push_statement(
            block,
            address,
            StatementKind::Jump(JumpData { condition, then_target, else_target }),
        );
        if let Some(cond) = condition {
            self.attach_term(cond, id);
        }
        let jump = self.statement(id).as_jump().cloned();
        if let Some(jump) = jump {
            if let Some(addr) = jump.then_target.address {
                self.attach_term(addr, id);
            }
            if let Some(addr) = jump.else_target.and_then(|t| t.address) {
                self.attach_term(addr, id);
            }
        }
        id
    }

    pub fn push_call(&mut self, block: BlockId, address: Option<u64>, target: TermId) -> StmtId {
        let id = self.push_statement(block, address, StatementKind::Call { target });
        self.attach_term(target, id);
        id
    }

    pub fn push_return(&mut self, block: BlockId, address: Option<u64>) -> StmtId {
        self.push_statement(block, address, StatementKind::Return)
    }
}

impl std::fmt::Display for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Program: {} blocks, {} statements, {} terms",
            self.blocks.len(), self.statements.len(), self.terms.len())?;
        for block in &self.blocks {
            match block.address {
                Some(addr) => writeln!(f, "{} ({:#x}):", block.id, addr)?,
                None => writeln!(f, "{}:", block.id)?,
            }
            for &stmt in &block.statements {
                writeln!(f, "  {}: {:?}", stmt, self.statement(stmt).kind)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment_source_backref() {
        let mut program = Program::new();
        let block = program.add_block(Some(0x1000));

        let rax = program.access(MemoryLocation::register(0, 8), Direction::Write);
        let one = program.int_const(1, 8);
        let stmt = program.push_assignment(block, Some(0x1000), rax, one);

        assert_eq!(program.term(rax).source, Some(one));
        assert_eq!(program.term(rax).statement, Some(stmt));
        assert_eq!(program.term(one).statement, Some(stmt));
    }

    #[test]
    fn test_subterm_collection() {
        let mut program = Program::new();
        let base = program.access(MemoryLocation::register(0, 8), Direction::Read);
        let four = program.int_const(4, 8);
        let addr = program.binary(BinaryOp::Add, base, four, 8);
        let deref = program.dereference(addr, Direction::Read, 8);

        let mut seen = Vec::new();
        program.collect_subterms(deref, &mut seen);
        assert_eq!(seen.len(), 4);
        assert!(seen.contains(&base));
        assert!(seen.contains(&four));
        assert!(seen.contains(&addr));
    }

    #[test]
    fn test_terminating_jump() {
        let mut program = Program::new();
        let b0 = program.add_block(Some(0x1000));
        let b1 = program.add_block(Some(0x1010));

        program.push_jump(b0, Some(0x1000), None, JumpTarget::block(b1), None);
        program.push_return(b1, Some(0x1010));

        assert!(program.terminating_jump(b0).is_some());
        assert!(program.terminating_jump(b1).is_none());
    }
}
