use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ir::BinaryOp;

/// 条件コード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cc {
    E,
    Ne,
    L,
    Le,
    G,
    Ge,
    B,
    Be,
    A,
    Ae,
    S,
    Ns,
}

/// デコード済みオペランド
///
/// レジスタはアーキテクチャのレジスタ空間オフセットで表す
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    Reg { offset: i64, size: u32 },
    Imm { value: i64, size: u32 },
    Mem {
        base: Option<i64>,
        index: Option<i64>,
        scale: u8,
        disp: i64,
        size: u32,
    },
}

/// デコード済み命令の操作
///
/// リフタが消費するアーキテクチャ中立の形。未対応の命令はOtherになり、
/// インラインアセンブリとしてIRに残る
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Mov { dst: Operand, src: Operand },
    MovZx { dst: Operand, src: Operand },
    MovSx { dst: Operand, src: Operand },
    Lea { dst: Operand, src: Operand },
    /// dst = dst op src（フラグ更新を伴う）
    Arith { op: BinaryOp, dst: Operand, src: Operand },
    Neg { dst: Operand },
    Not { dst: Operand },
    Cmp { lhs: Operand, rhs: Operand },
    Test { lhs: Operand, rhs: Operand },
    Push { src: Operand },
    Pop { dst: Operand },
    Jmp { target: Operand },
    Jcc { cc: Cc, target: Operand },
    Call { target: Operand },
    Ret,
    Leave,
    Nop,
    Other { mnemonic: String, operands: String },
}

/// デコード済み命令
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instruction {
    pub address: u64,
    pub size: u32,
    pub operation: Operation,
}

/// デコード済み命令列（アドレス順）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Instructions {
    map: BTreeMap<u64, Instruction>,
}

impl Instructions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, instruction: Instruction) {
        self.map.insert(instruction.address, instruction);
    }

    pub fn get(&self, address: u64) -> Option<&Instruction> {
        self.map.get(&address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instruction> {
        self.map.values()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_order() {
        let mut instructions = Instructions::new();
        instructions.push(Instruction { address: 0x1004, size: 1, operation: Operation::Ret });
        instructions.push(Instruction { address: 0x1000, size: 4, operation: Operation::Nop });

        let addrs: Vec<u64> = instructions.iter().map(|i| i.address).collect();
        assert_eq!(addrs, vec![0x1000, 0x1004]);
    }
}
