use anyhow::{anyhow, Result};
use capstone::arch::x86::{X86Operand, X86OperandType};
use capstone::prelude::*;
use capstone::RegId;
use tracing::warn;

use crate::arch::register_from_name;
use crate::insn::{Cc, Instruction, Instructions, Operand, Operation};
use crate::ir::BinaryOp;

/// Capstoneベースのx86-64命令デコーダ
///
/// 機械語をアーキテクチャ中立のInstructionsに変換する。リフトできない
/// 命令はOtherとして残し、パイプラインを止めない
pub struct InstructionDecoder {
    cs: Capstone,
}

impl InstructionDecoder {
    pub fn new() -> Result<Self> {
        let cs = Capstone::new()
            .x86()
            .mode(capstone::arch::x86::ArchMode::Mode64)
            .detail(true)
            .build()
            .map_err(|e| anyhow!("failed to create capstone engine: {}", e))?;

        Ok(Self { cs })
    }

    /// バイト列をデコードしてInstructionsを作る
    pub fn decode(&self, code: &[u8], base_address: u64, max_instructions: usize) -> Result<Instructions> {
        let insns = self
            .cs
            .disasm_count(code, base_address, max_instructions)
            .map_err(|e| anyhow!("disassembly failed: {}", e))?;

        let mut result = Instructions::new();

        for insn in insns.iter() {
            let address = insn.address();
            let size = insn.bytes().len() as u32;
            let mnemonic = insn.mnemonic().unwrap_or("???").to_string();
            let op_str = insn.op_str().unwrap_or("").to_string();

            let operands: Vec<X86Operand> = match self.cs.insn_detail(&insn) {
                Ok(detail) => detail
                    .arch_detail()
                    .x86()
                    .map(|x86| x86.operands().collect())
                    .unwrap_or_default(),
                Err(_) => Vec::new(),
            };

            let operation = match self.convert(&mnemonic, &op_str, &operands) {
                Ok(op) => op,
                Err(e) => {
                    warn!("{:#x}: {} {} - {}", address, mnemonic, op_str, e);
                    Operation::Other { mnemonic: mnemonic.clone(), operands: op_str.clone() }
                }
            };

            result.push(Instruction { address, size, operation });
        }

        Ok(result)
    }

    /// ニーモニックとオペランドからOperationを作る
    fn convert(&self, mnemonic: &str, op_str: &str, operands: &[X86Operand]) -> Result<Operation> {
        let op = |i: usize| -> Result<Operand> {
            operands
                .get(i)
                .ok_or_else(|| anyhow!("missing operand {}", i))
                .and_then(|o| self.convert_operand(o))
        };

        let operation = match mnemonic {
            "mov" | "movabs" => Operation::Mov { dst: op(0)?, src: op(1)? },
            "movzx" => Operation::MovZx { dst: op(0)?, src: op(1)? },
            "movsx" | "movsxd" => Operation::MovSx { dst: op(0)?, src: op(1)? },
            "lea" => Operation::Lea { dst: op(0)?, src: op(1)? },

            "add" => Operation::Arith { op: BinaryOp::Add, dst: op(0)?, src: op(1)? },
            "sub" => Operation::Arith { op: BinaryOp::Sub, dst: op(0)?, src: op(1)? },
            "imul" if operands.len() == 2 => {
                Operation::Arith { op: BinaryOp::Mul, dst: op(0)?, src: op(1)? }
            }
            "and" => Operation::Arith { op: BinaryOp::And, dst: op(0)?, src: op(1)? },
            "or" => Operation::Arith { op: BinaryOp::Or, dst: op(0)?, src: op(1)? },
            "xor" => Operation::Arith { op: BinaryOp::Xor, dst: op(0)?, src: op(1)? },
            "shl" | "sal" => Operation::Arith { op: BinaryOp::Shl, dst: op(0)?, src: op(1)? },
            "shr" => Operation::Arith { op: BinaryOp::Shr, dst: op(0)?, src: op(1)? },
            "sar" => Operation::Arith { op: BinaryOp::Sar, dst: op(0)?, src: op(1)? },

            "inc" => Operation::Arith {
                op: BinaryOp::Add,
                dst: op(0)?,
                src: Operand::Imm { value: 1, size: operand_size(&op(0)?) },
            },
            "dec" => Operation::Arith {
                op: BinaryOp::Sub,
                dst: op(0)?,
                src: Operand::Imm { value: 1, size: operand_size(&op(0)?) },
            },
            "neg" => Operation::Neg { dst: op(0)? },
            "not" => Operation::Not { dst: op(0)? },

            "cmp" => Operation::Cmp { lhs: op(0)?, rhs: op(1)? },
            "test" => Operation::Test { lhs: op(0)?, rhs: op(1)? },

            "push" => Operation::Push { src: op(0)? },
            "pop" => Operation::Pop { dst: op(0)? },
            "leave" => Operation::Leave,

            "jmp" => Operation::Jmp { target: op(0)? },
            "call" => Operation::Call { target: op(0)? },
            "ret" | "retn" => Operation::Ret,

            "je" | "jz" => Operation::Jcc { cc: Cc::E, target: op(0)? },
            "jne" | "jnz" => Operation::Jcc { cc: Cc::Ne, target: op(0)? },
            "jl" | "jnge" => Operation::Jcc { cc: Cc::L, target: op(0)? },
            "jle" | "jng" => Operation::Jcc { cc: Cc::Le, target: op(0)? },
            "jg" | "jnle" => Operation::Jcc { cc: Cc::G, target: op(0)? },
            "jge" | "jnl" => Operation::Jcc { cc: Cc::Ge, target: op(0)? },
            "jb" | "jc" | "jnae" => Operation::Jcc { cc: Cc::B, target: op(0)? },
            "jbe" | "jna" => Operation::Jcc { cc: Cc::Be, target: op(0)? },
            "ja" | "jnbe" => Operation::Jcc { cc: Cc::A, target: op(0)? },
            "jae" | "jnb" | "jnc" => Operation::Jcc { cc: Cc::Ae, target: op(0)? },
            "js" => Operation::Jcc { cc: Cc::S, target: op(0)? },
            "jns" => Operation::Jcc { cc: Cc::Ns, target: op(0)? },

            "nop" | "endbr64" | "int3" => Operation::Nop,

            _ => Operation::Other { mnemonic: mnemonic.to_string(), operands: op_str.to_string() },
        };

        Ok(operation)
    }

    fn convert_operand(&self, operand: &X86Operand) -> Result<Operand> {
        let size = operand.size as u32;

        match operand.op_type {
            X86OperandType::Reg(reg) => {
                let name = self
                    .cs
                    .reg_name(reg)
                    .ok_or_else(|| anyhow!("unknown register id"))?;
                let (offset, reg_size) =
                    register_from_name(&name).ok_or_else(|| anyhow!("unsupported register {}", name))?;
                Ok(Operand::Reg { offset, size: reg_size })
            }
            X86OperandType::Imm(value) => Ok(Operand::Imm { value, size }),
            X86OperandType::Mem(mem) => {
                let reg_offset = |reg: RegId| -> Result<Option<i64>> {
                    if reg.0 == 0 {
                        return Ok(None);
                    }
                    let name = self
                        .cs
                        .reg_name(reg)
                        .ok_or_else(|| anyhow!("unknown register id"))?;
                    register_from_name(&name)
                        .map(|(offset, _)| Some(offset))
                        .ok_or_else(|| anyhow!("unsupported register {}", name))
                };

                Ok(Operand::Mem {
                    base: reg_offset(mem.base())?,
                    index: reg_offset(mem.index())?,
                    scale: mem.scale() as u8,
                    disp: mem.disp(),
                    size,
                })
            }
            _ => Err(anyhow!("unsupported operand type")),
        }
    }
}

fn operand_size(operand: &Operand) -> u32 {
    match operand {
        Operand::Reg { size, .. } | Operand::Imm { size, .. } | Operand::Mem { size, .. } => *size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::reg;

    #[test]
    fn test_decode_simple_sequence() -> Result<()> {
        // mov eax, 1; ret
        let code = [0xb8, 0x01, 0x00, 0x00, 0x00, 0xc3];
        let decoder = InstructionDecoder::new()?;
        let instructions = decoder.decode(&code, 0x1000, 16)?;

        assert_eq!(instructions.len(), 2);

        let mov = instructions.get(0x1000).unwrap();
        match &mov.operation {
            Operation::Mov { dst: Operand::Reg { offset, size }, src: Operand::Imm { value, .. } } => {
                assert_eq!(*offset, reg::RAX);
                assert_eq!(*size, 4);
                assert_eq!(*value, 1);
            }
            other => panic!("unexpected operation: {:?}", other),
        }

        assert_eq!(instructions.get(0x1005).unwrap().operation, Operation::Ret);
        Ok(())
    }

    #[test]
    fn test_decode_unknown_becomes_other() -> Result<()> {
        // cpuid
        let code = [0x0f, 0xa2];
        let decoder = InstructionDecoder::new()?;
        let instructions = decoder.decode(&code, 0x1000, 16)?;

        match &instructions.get(0x1000).unwrap().operation {
            Operation::Other { mnemonic, .. } => assert_eq!(mnemonic, "cpuid"),
            other => panic!("unexpected operation: {:?}", other),
        }
        Ok(())
    }
}
