use std::collections::BTreeSet;

use anyhow::Result;

use crate::arch::{reg, Architecture};
use crate::context::CancellationToken;
use crate::insn::{Cc, Instruction, Instructions, Operand, Operation};
use crate::ir::{
    BinaryOp, BlockId, Direction, JumpTarget, MemoryLocation, Program, StatementKind, TermId,
    UnaryOp,
};

/// 機械語からIRへのリフタ
///
/// デコード済み命令列を基本ブロックに分割し、項と文の列へ持ち上げる。
/// 比較はフラグ疑似レジスタへの代入として表現し、条件分岐はその読み取りになる
pub struct IrGenerator<'a> {
    architecture: &'a dyn Architecture,
    instructions: &'a Instructions,
}

impl<'a> IrGenerator<'a> {
    pub fn new(architecture: &'a dyn Architecture, instructions: &'a Instructions) -> Self {
        Self { architecture, instructions }
    }

    /// IRプログラムを生成する
    pub fn generate(&self, cancellation: &CancellationToken) -> Result<Program> {
        let mut program = Program::new();

        // 1. リーダー（ブロック先頭アドレス）を求める
        let leaders = self.find_leaders();

        // 2. 命令をリーダーで区切りながらリフトする
        let mut order: Vec<BlockId> = Vec::new();
        let mut current: Option<BlockId> = None;

        for insn in self.instructions.iter() {
            cancellation.poll()?;

            if current.is_none() || leaders.contains(&insn.address) {
                let block = program.add_block(Some(insn.address));
                order.push(block);
                current = Some(block);
            }
            let block = current.unwrap();

            self.lift(&mut program, block, insn);

            if ends_block(&insn.operation) {
                current = None;
            }
        }

        // 3. 落下経路とジャンプ先を解決して辺を張る
        self.resolve_flow(&mut program, &order);

        Ok(program)
    }

    /// ブロック先頭となるアドレスの集合
    fn find_leaders(&self) -> BTreeSet<u64> {
        let mut leaders = BTreeSet::new();

        let mut first = true;
        for insn in self.instructions.iter() {
            if first {
                leaders.insert(insn.address);
                first = false;
            }
            match &insn.operation {
                Operation::Jmp { target } | Operation::Jcc { target, .. } => {
                    if let Operand::Imm { value, .. } = target {
                        leaders.insert(*value as u64);
                    }
                    leaders.insert(insn.address + insn.size as u64);
                }
                Operation::Call { target } => {
                    // 呼び出し先は関数入口になるのでブロックを切る
                    if let Operand::Imm { value, .. } = target {
                        leaders.insert(*value as u64);
                    }
                }
                Operation::Ret => {
                    leaders.insert(insn.address + insn.size as u64);
                }
                _ => {}
            }
        }

        leaders
    }

    /// 1命令をリフトする
    fn lift(&self, program: &mut Program, block: BlockId, insn: &Instruction) {
        let addr = Some(insn.address);

        match &insn.operation {
            Operation::Nop => {}

            Operation::Mov { dst, src } => {
                let right = self.read_operand(program, src, insn);
                let left = self.write_operand(program, dst, insn);
                program.push_assignment(block, addr, left, right);
            }

            Operation::MovZx { dst, src } => {
                let src_term = self.read_operand(program, src, insn);
                let size = operand_size(dst);
                let extended = program.unary(UnaryOp::ZeroExtend, src_term, size);
                let left = self.write_operand(program, dst, insn);
                program.push_assignment(block, addr, left, extended);
            }

            Operation::MovSx { dst, src } => {
                let src_term = self.read_operand(program, src, insn);
                let size = operand_size(dst);
                let extended = program.unary(UnaryOp::SignExtend, src_term, size);
                let left = self.write_operand(program, dst, insn);
                program.push_assignment(block, addr, left, extended);
            }

            Operation::Lea { dst, src } => {
                let address = self.address_expression(program, src, insn);
                let left = self.write_operand(program, dst, insn);
                program.push_assignment(block, addr, left, address);
            }

            Operation::Arith { op, dst, src } => {
                let size = operand_size(dst);
                let left_read = self.read_operand(program, dst, insn);
                let right = self.read_operand(program, src, insn);
                let result = program.binary(*op, left_read, right, size);
                let left_write = self.write_operand(program, dst, insn);
                program.push_assignment(block, addr, left_write, result);

                // 結果からZF/SFを計算し直す
                let result_read = self.read_operand(program, dst, insn);
                let zero = program.int_const(0, size);
                let is_zero = program.binary(BinaryOp::Equal, result_read, zero, 1);
                let zf = program.access(flag_location(reg::ZF), Direction::Write);
                program.push_assignment(block, addr, zf, is_zero);

                let result_read = self.read_operand(program, dst, insn);
                let zero = program.int_const(0, size);
                let is_negative = program.binary(BinaryOp::SignedLess, result_read, zero, 1);
                let sf = program.access(flag_location(reg::SF), Direction::Write);
                program.push_assignment(block, addr, sf, is_negative);
            }

            Operation::Neg { dst } => {
                let size = operand_size(dst);
                let value = self.read_operand(program, dst, insn);
                let negated = program.unary(UnaryOp::Negate, value, size);
                let left = self.write_operand(program, dst, insn);
                program.push_assignment(block, addr, left, negated);
            }

            Operation::Not { dst } => {
                let size = operand_size(dst);
                let value = self.read_operand(program, dst, insn);
                let inverted = program.unary(UnaryOp::Not, value, size);
                let left = self.write_operand(program, dst, insn);
                program.push_assignment(block, addr, left, inverted);
            }

            Operation::Cmp { lhs, rhs } => {
                self.lift_compare(program, block, insn, lhs, rhs);
            }

            Operation::Test { lhs, rhs } => {
                let size = operand_size(lhs);
                let l = self.read_operand(program, lhs, insn);
                let r = self.read_operand(program, rhs, insn);
                let masked = program.binary(BinaryOp::And, l, r, size);
                let zero = program.int_const(0, size);
                let is_zero = program.binary(BinaryOp::Equal, masked, zero, 1);
                let zf = program.access(flag_location(reg::ZF), Direction::Write);
                program.push_assignment(block, addr, zf, is_zero);

                let l = self.read_operand(program, lhs, insn);
                let r = self.read_operand(program, rhs, insn);
                let masked = program.binary(BinaryOp::And, l, r, size);
                let zero = program.int_const(0, size);
                let is_negative = program.binary(BinaryOp::SignedLess, masked, zero, 1);
                let sf = program.access(flag_location(reg::SF), Direction::Write);
                program.push_assignment(block, addr, sf, is_negative);
            }

            Operation::Push { src } => {
                let value = self.read_operand(program, src, insn);
                self.adjust_stack_pointer(program, block, addr, -8);
                let sp = self.stack_pointer_read(program);
                let size = operand_size(src);
                let slot = program.dereference(sp, Direction::Write, size);
                program.push_assignment(block, addr, slot, value);
            }

            Operation::Pop { dst } => {
                let sp = self.stack_pointer_read(program);
                let size = operand_size(dst);
                let slot = program.dereference(sp, Direction::Read, size);
                let left = self.write_operand(program, dst, insn);
                program.push_assignment(block, addr, left, slot);
                self.adjust_stack_pointer(program, block, addr, 8);
            }

            Operation::Leave => {
                // rsp := rbp; rbp := *(rsp); rsp := rsp + 8
                let rbp = program.access(MemoryLocation::register(reg::RBP, 8), Direction::Read);
                let rsp = program.access(self.architecture.stack_pointer(), Direction::Write);
                program.push_assignment(block, addr, rsp, rbp);

                let sp = self.stack_pointer_read(program);
                let slot = program.dereference(sp, Direction::Read, 8);
                let rbp = program.access(MemoryLocation::register(reg::RBP, 8), Direction::Write);
                program.push_assignment(block, addr, rbp, slot);
                self.adjust_stack_pointer(program, block, addr, 8);
            }

            Operation::Jmp { target } => {
                let target_term = self.jump_target_term(program, target, insn);
                program.push_jump(block, addr, None, JumpTarget::address(target_term), None);
            }

            Operation::Jcc { cc, target } => {
                let condition = self.condition_term(program, *cc);
                let target_term = self.jump_target_term(program, target, insn);
                // else側（落下経路）はresolve_flowで埋める
                program.push_jump(block, addr, Some(condition), JumpTarget::address(target_term), None);
            }

            Operation::Call { target } => {
                let target_term = self.jump_target_term(program, target, insn);
                program.push_call(block, addr, target_term);

                // フラグは呼び出しをまたいで生き残らない
                for flag in [reg::ZF, reg::SF, reg::CF, reg::OF, reg::PF] {
                    let term = program.access(flag_location(flag), Direction::Write);
                    program.push_kill(block, addr, term);
                }
            }

            Operation::Ret => {
                program.push_return(block, addr);
            }

            Operation::Other { mnemonic, operands } => {
                let text = if operands.is_empty() {
                    mnemonic.clone()
                } else {
                    format!("{} {}", mnemonic, operands)
                };
                program.push_inline_assembly(block, addr, &text);
            }
        }
    }

    /// cmpをフラグ疑似レジスタへの代入に展開する
    fn lift_compare(
        &self,
        program: &mut Program,
        block: BlockId,
        insn: &Instruction,
        lhs: &Operand,
        rhs: &Operand,
    ) {
        let addr = Some(insn.address);

        let comparisons = [
            (reg::ZF, BinaryOp::Equal),
            (reg::SF, BinaryOp::SignedLess),
            (reg::CF, BinaryOp::UnsignedLess),
        ];
        for (flag, op) in comparisons {
            let l = self.read_operand(program, lhs, insn);
            let r = self.read_operand(program, rhs, insn);
            let compared = program.binary(op, l, r, 1);
            let dst = program.access(flag_location(flag), Direction::Write);
            program.push_assignment(block, addr, dst, compared);
        }
    }

    /// 条件コードをフラグ読み取りの式にする
    fn condition_term(&self, program: &mut Program, cc: Cc) -> TermId {
        let read_flag = |program: &mut Program, flag: i64| {
            program.access(flag_location(flag), Direction::Read)
        };

        match cc {
            Cc::E => read_flag(program, reg::ZF),
            Cc::Ne => {
                let zf = read_flag(program, reg::ZF);
                program.unary(UnaryOp::Not, zf, 1)
            }
            Cc::L | Cc::S => read_flag(program, reg::SF),
            Cc::Le => {
                let sf = read_flag(program, reg::SF);
                let zf = read_flag(program, reg::ZF);
                program.binary(BinaryOp::Or, sf, zf, 1)
            }
            Cc::G => {
                let sf = read_flag(program, reg::SF);
                let zf = read_flag(program, reg::ZF);
                let either = program.binary(BinaryOp::Or, sf, zf, 1);
                program.unary(UnaryOp::Not, either, 1)
            }
            Cc::Ge | Cc::Ns => {
                let sf = read_flag(program, reg::SF);
                program.unary(UnaryOp::Not, sf, 1)
            }
            Cc::B => read_flag(program, reg::CF),
            Cc::Be => {
                let cf = read_flag(program, reg::CF);
                let zf = read_flag(program, reg::ZF);
                program.binary(BinaryOp::Or, cf, zf, 1)
            }
            Cc::A => {
                let cf = read_flag(program, reg::CF);
                let zf = read_flag(program, reg::ZF);
                let either = program.binary(BinaryOp::Or, cf, zf, 1);
                program.unary(UnaryOp::Not, either, 1)
            }
            Cc::Ae => {
                let cf = read_flag(program, reg::CF);
                program.unary(UnaryOp::Not, cf, 1)
            }
        }
    }

    /// ジャンプ・呼び出し先の項
    fn jump_target_term(&self, program: &mut Program, target: &Operand, insn: &Instruction) -> TermId {
        match target {
            Operand::Imm { value, .. } => program.int_const(*value as u64, 8),
            Operand::Reg { offset, size } => {
                program.access(MemoryLocation::register(*offset, *size), Direction::Read)
            }
            Operand::Mem { .. } => {
                let address = self.address_expression(program, target, insn);
                program.dereference(address, Direction::Read, 8)
            }
        }
    }

    /// オペランドを読み取り項にする
    fn read_operand(&self, program: &mut Program, operand: &Operand, insn: &Instruction) -> TermId {
        match operand {
            Operand::Reg { offset, size } => {
                program.access(MemoryLocation::register(*offset, *size), Direction::Read)
            }
            Operand::Imm { value, size } => program.int_const(*value as u64, *size),
            Operand::Mem { size, .. } => {
                let address = self.address_expression(program, operand, insn);
                program.dereference(address, Direction::Read, *size)
            }
        }
    }

    /// オペランドを書き込み項にする
    fn write_operand(&self, program: &mut Program, operand: &Operand, insn: &Instruction) -> TermId {
        match operand {
            Operand::Reg { offset, size } => {
                program.access(MemoryLocation::register(*offset, *size), Direction::Write)
            }
            Operand::Imm { .. } => {
                // 即値への書き込みはデコーダの誤りでしか起きない
                program.undefined(8)
            }
            Operand::Mem { size, .. } => {
                let address = self.address_expression(program, operand, insn);
                program.dereference(address, Direction::Write, *size)
            }
        }
    }

    /// メモリオペランドのアドレス式 [base + index*scale + disp]
    fn address_expression(&self, program: &mut Program, operand: &Operand, insn: &Instruction) -> TermId {
        let (base, index, scale, disp) = match operand {
            Operand::Mem { base, index, scale, disp, .. } => (*base, *index, *scale, *disp),
            Operand::Reg { offset, size } => {
                return program.access(MemoryLocation::register(*offset, *size), Direction::Read);
            }
            Operand::Imm { value, .. } => return program.int_const(*value as u64, 8),
        };

        // rip相対は絶対アドレスに畳む
        if base == Some(reg::RIP) {
            let absolute = (insn.address + insn.size as u64).wrapping_add(disp as u64);
            return program.int_const(absolute, 8);
        }

        let mut expr: Option<TermId> = base.map(|offset| {
            program.access(MemoryLocation::register(offset, 8), Direction::Read)
        });

        if let Some(index_offset) = index {
            let index_term =
                program.access(MemoryLocation::register(index_offset, 8), Direction::Read);
            let scaled = if scale > 1 {
                let factor = program.int_const(scale as u64, 8);
                program.binary(BinaryOp::Mul, index_term, factor, 8)
            } else {
                index_term
            };
            expr = Some(match expr {
                Some(prev) => program.binary(BinaryOp::Add, prev, scaled, 8),
                None => scaled,
            });
        }

        if disp != 0 || expr.is_none() {
            let disp_term = program.int_const(disp as u64, 8);
            expr = Some(match expr {
                Some(prev) => program.binary(BinaryOp::Add, prev, disp_term, 8),
                None => disp_term,
            });
        }

        expr.unwrap()
    }

    fn stack_pointer_read(&self, program: &mut Program) -> TermId {
        program.access(self.architecture.stack_pointer(), Direction::Read)
    }

    /// rsp += delta
    fn adjust_stack_pointer(&self, program: &mut Program, block: BlockId, addr: Option<u64>, delta: i64) {
        let sp_read = self.stack_pointer_read(program);
        let amount = program.int_const(delta.unsigned_abs(), 8);
        let op = if delta < 0 { BinaryOp::Sub } else { BinaryOp::Add };
        let adjusted = program.binary(op, sp_read, amount, 8);
        let sp_write = program.access(self.architecture.stack_pointer(), Direction::Write);
        program.push_assignment(block, addr, sp_write, adjusted);
    }

    /// 落下経路の補完とジャンプ先ブロックの解決
    fn resolve_flow(&self, program: &mut Program, order: &[BlockId]) {
        for (position, &block) in order.iter().enumerate() {
            let next = order.get(position + 1).copied();

            let last = program.block(block).statements.last().copied();
            let terminated = match last {
                Some(stmt) => matches!(
                    program.statement(stmt).kind,
                    StatementKind::Jump(_) | StatementKind::Return
                ),
                None => false,
            };

            if !terminated {
                // リーダーで切られたブロック: 次ブロックへの無条件ジャンプを補う
                if let Some(next) = next {
                    program.push_jump(block, None, None, JumpTarget::block(next), None);
                    program.add_edge(block, next);
                }
                continue;
            }

            let stmt = last.unwrap();
            if let Some(jump) = program.statement(stmt).as_jump().cloned() {
                // アドレス項が定数ならブロックに解決
                let mut then_target = jump.then_target.clone();
                if then_target.block.is_none() {
                    if let Some(addr_term) = then_target.address {
                        if let Some(value) = program.term(addr_term).as_int_const() {
                            then_target.block = program.block_at(value);
                        }
                    }
                }
                if let Some(to) = then_target.block {
                    program.add_edge(block, to);
                }

                // 条件付きジャンプの落下経路をelse側に入れる
                let mut else_target = jump.else_target.clone();
                if jump.condition.is_some() && else_target.is_none() {
                    if let Some(next) = next {
                        else_target = Some(JumpTarget::block(next));
                    }
                }
                if let Some(to) = else_target.as_ref().and_then(|t| t.block) {
                    program.add_edge(block, to);
                }

                if let StatementKind::Jump(data) = &mut program.statement_mut(stmt).kind {
                    data.then_target = then_target;
                    data.else_target = else_target;
                }
            }
        }
    }
}

fn operand_size(operand: &Operand) -> u32 {
    match operand {
        Operand::Reg { size, .. } | Operand::Imm { size, .. } | Operand::Mem { size, .. } => *size,
    }
}

fn flag_location(offset: i64) -> MemoryLocation {
    MemoryLocation::register(offset, 1)
}

fn ends_block(operation: &Operation) -> bool {
    matches!(
        operation,
        Operation::Jmp { .. } | Operation::Jcc { .. } | Operation::Ret
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::X64Architecture;
    use crate::insn::Instruction;

    fn lift(instructions: Instructions) -> Program {
        let arch = X64Architecture::new();
        let generator = IrGenerator::new(&arch, &instructions);
        generator.generate(&CancellationToken::new()).unwrap()
    }

    #[test]
    fn test_lift_mov_and_ret() {
        let mut instructions = Instructions::new();
        instructions.push(Instruction {
            address: 0x1000,
            size: 5,
            operation: Operation::Mov {
                dst: Operand::Reg { offset: reg::RAX, size: 4 },
                src: Operand::Imm { value: 1, size: 4 },
            },
        });
        instructions.push(Instruction { address: 0x1005, size: 1, operation: Operation::Ret });

        let program = lift(instructions);
        assert_eq!(program.block_count(), 1);

        let block = program.blocks().next().unwrap();
        assert_eq!(block.statements.len(), 2);

        let (left, right) = program.statement(block.statements[0]).as_assignment().unwrap();
        assert!(program.term(left).is_write());
        assert_eq!(program.term(right).as_int_const(), Some(1));
        assert!(program.statement(block.statements[1]).is_return());
    }

    #[test]
    fn test_lift_conditional_branch_blocks() {
        // cmp eax, 0; je 0x100a; mov eax, 1; ret / ret
        let mut instructions = Instructions::new();
        instructions.push(Instruction {
            address: 0x1000,
            size: 3,
            operation: Operation::Cmp {
                lhs: Operand::Reg { offset: reg::RAX, size: 4 },
                rhs: Operand::Imm { value: 0, size: 4 },
            },
        });
        instructions.push(Instruction {
            address: 0x1003,
            size: 2,
            operation: Operation::Jcc { cc: Cc::E, target: Operand::Imm { value: 0x100a, size: 8 } },
        });
        instructions.push(Instruction {
            address: 0x1005,
            size: 5,
            operation: Operation::Mov {
                dst: Operand::Reg { offset: reg::RAX, size: 4 },
                src: Operand::Imm { value: 1, size: 4 },
            },
        });
        instructions.push(Instruction { address: 0x100a, size: 1, operation: Operation::Ret });

        let program = lift(instructions);
        assert_eq!(program.block_count(), 3);

        let entry = program.block_at(0x1000).unwrap();
        let jump = program.terminating_jump(entry).unwrap();
        let data = program.statement(jump).as_jump().unwrap();
        assert!(data.condition.is_some());
        assert_eq!(data.then_target.block, program.block_at(0x100a));
        assert_eq!(data.else_target.as_ref().unwrap().block, program.block_at(0x1005));
        assert_eq!(program.block(entry).successors.len(), 2);
    }

    #[test]
    fn test_lift_push_updates_stack_pointer() {
        let mut instructions = Instructions::new();
        instructions.push(Instruction {
            address: 0x1000,
            size: 1,
            operation: Operation::Push { src: Operand::Reg { offset: reg::RBP, size: 8 } },
        });
        instructions.push(Instruction { address: 0x1001, size: 1, operation: Operation::Ret });

        let program = lift(instructions);
        let block = program.blocks().next().unwrap();

        // rsp更新とスタックスロットへの格納の2つの代入
        let assignments: Vec<_> = block
            .statements
            .iter()
            .filter_map(|&s| program.statement(s).as_assignment())
            .collect();
        assert_eq!(assignments.len(), 2);

        let (slot, _) = assignments[1];
        assert!(program.term(slot).as_dereference_address().is_some());
        assert!(program.term(slot).is_write());
    }

    #[test]
    fn test_rip_relative_folds_to_constant() {
        // mov rax, [rip + 0x2000]
        let mut instructions = Instructions::new();
        instructions.push(Instruction {
            address: 0x1000,
            size: 7,
            operation: Operation::Mov {
                dst: Operand::Reg { offset: reg::RAX, size: 8 },
                src: Operand::Mem {
                    base: Some(reg::RIP),
                    index: None,
                    scale: 1,
                    disp: 0x2000,
                    size: 8,
                },
            },
        });
        instructions.push(Instruction { address: 0x1007, size: 1, operation: Operation::Ret });

        let program = lift(instructions);
        let block = program.blocks().next().unwrap();
        let (_, right) = program.statement(block.statements[0]).as_assignment().unwrap();

        let address = program.term(right).as_dereference_address().unwrap();
        assert_eq!(program.term(address).as_int_const(), Some(0x1007 + 0x2000));
    }
}
