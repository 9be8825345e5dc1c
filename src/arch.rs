use crate::calling::Convention;
use crate::ir::{MemoryDomain, MemoryLocation};

/// x86-64レジスタのオフセット定義
///
/// レジスタをMemoryDomain::Registerの連続したオフセットで表現する
pub mod reg {
    pub const RAX: i64 = 0;
    pub const RCX: i64 = 8;
    pub const RDX: i64 = 16;
    pub const RBX: i64 = 24;
    pub const RSP: i64 = 32;
    pub const RBP: i64 = 40;
    pub const RSI: i64 = 48;
    pub const RDI: i64 = 56;
    pub const R8: i64 = 64;
    pub const R9: i64 = 72;
    pub const R10: i64 = 80;
    pub const R11: i64 = 88;
    pub const R12: i64 = 96;
    pub const R13: i64 = 104;
    pub const R14: i64 = 112;
    pub const R15: i64 = 120;
    pub const RIP: i64 = 128;

    // フラグは1バイトの疑似レジスタとして扱う
    pub const ZF: i64 = 512;
    pub const SF: i64 = 513;
    pub const CF: i64 = 514;
    pub const OF: i64 = 515;
    pub const PF: i64 = 516;
}

/// アーキテクチャ情報
///
/// 解析パスが必要とする最小限の照会面。グローバルメモリの判定規則はここが唯一の定義
pub trait Architecture {
    /// ポインタ幅（バイト）
    fn pointer_size(&self) -> u32 {
        8
    }

    /// この記憶位置への書き込みがプログラム外から観測可能か
    fn is_global_memory(&self, location: &MemoryLocation) -> bool;

    /// スタックポインタの記憶位置
    fn stack_pointer(&self) -> MemoryLocation;

    /// 未知の呼び出し先に仮定する規約
    fn default_convention(&self) -> Convention;

    /// レジスタ位置の表示名（コード生成用）
    fn register_name(&self, location: &MemoryLocation) -> Option<String>;
}

/// レジスタ名から（オフセット, サイズ）を解決
///
/// デコーダがcapstoneの名前をレジスタ空間の位置に写すのに使う
pub fn register_from_name(name: &str) -> Option<(i64, u32)> {
    let result = match name {
        "rax" => (reg::RAX, 8),
        "rcx" => (reg::RCX, 8),
        "rdx" => (reg::RDX, 8),
        "rbx" => (reg::RBX, 8),
        "rsp" => (reg::RSP, 8),
        "rbp" => (reg::RBP, 8),
        "rsi" => (reg::RSI, 8),
        "rdi" => (reg::RDI, 8),
        "r8" => (reg::R8, 8),
        "r9" => (reg::R9, 8),
        "r10" => (reg::R10, 8),
        "r11" => (reg::R11, 8),
        "r12" => (reg::R12, 8),
        "r13" => (reg::R13, 8),
        "r14" => (reg::R14, 8),
        "r15" => (reg::R15, 8),
        "rip" => (reg::RIP, 8),

        "eax" => (reg::RAX, 4),
        "ecx" => (reg::RCX, 4),
        "edx" => (reg::RDX, 4),
        "ebx" => (reg::RBX, 4),
        "esp" => (reg::RSP, 4),
        "ebp" => (reg::RBP, 4),
        "esi" => (reg::RSI, 4),
        "edi" => (reg::RDI, 4),
        "r8d" => (reg::R8, 4),
        "r9d" => (reg::R9, 4),
        "r10d" => (reg::R10, 4),
        "r11d" => (reg::R11, 4),
        "r12d" => (reg::R12, 4),
        "r13d" => (reg::R13, 4),
        "r14d" => (reg::R14, 4),
        "r15d" => (reg::R15, 4),

        "ax" => (reg::RAX, 2),
        "cx" => (reg::RCX, 2),
        "dx" => (reg::RDX, 2),
        "bx" => (reg::RBX, 2),
        "sp" => (reg::RSP, 2),
        "bp" => (reg::RBP, 2),
        "si" => (reg::RSI, 2),
        "di" => (reg::RDI, 2),
        "r8w" => (reg::R8, 2),
        "r9w" => (reg::R9, 2),
        "r10w" => (reg::R10, 2),
        "r11w" => (reg::R11, 2),

        "al" => (reg::RAX, 1),
        "cl" => (reg::RCX, 1),
        "dl" => (reg::RDX, 1),
        "bl" => (reg::RBX, 1),
        "spl" => (reg::RSP, 1),
        "bpl" => (reg::RBP, 1),
        "sil" => (reg::RSI, 1),
        "dil" => (reg::RDI, 1),
        "r8b" => (reg::R8, 1),
        "r9b" => (reg::R9, 1),

        _ => return None,
    };
    Some(result)
}

/// x86-64 (System V ABI)
#[derive(Debug, Clone, Copy, Default)]
pub struct X64Architecture;

impl X64Architecture {
    pub fn new() -> Self {
        Self
    }
}

impl Architecture for X64Architecture {
    fn is_global_memory(&self, location: &MemoryLocation) -> bool {
        location.domain == MemoryDomain::Global
    }

    fn stack_pointer(&self) -> MemoryLocation {
        MemoryLocation::register(reg::RSP, 8)
    }

    fn default_convention(&self) -> Convention {
        Convention {
            arguments: vec![
                MemoryLocation::register(reg::RDI, 8),
                MemoryLocation::register(reg::RSI, 8),
                MemoryLocation::register(reg::RDX, 8),
                MemoryLocation::register(reg::RCX, 8),
                MemoryLocation::register(reg::R8, 8),
                MemoryLocation::register(reg::R9, 8),
            ],
            return_value: Some(MemoryLocation::register(reg::RAX, 8)),
            scratch: vec![
                MemoryLocation::register(reg::RAX, 8),
                MemoryLocation::register(reg::RCX, 8),
                MemoryLocation::register(reg::RDX, 8),
                MemoryLocation::register(reg::RSI, 8),
                MemoryLocation::register(reg::RDI, 8),
                MemoryLocation::register(reg::R8, 8),
                MemoryLocation::register(reg::R9, 8),
                MemoryLocation::register(reg::R10, 8),
                MemoryLocation::register(reg::R11, 8),
                MemoryLocation::register(reg::ZF, 1),
                MemoryLocation::register(reg::SF, 1),
                MemoryLocation::register(reg::CF, 1),
                MemoryLocation::register(reg::OF, 1),
                MemoryLocation::register(reg::PF, 1),
            ],
        }
    }

    fn register_name(&self, location: &MemoryLocation) -> Option<String> {
        if location.domain != MemoryDomain::Register {
            return None;
        }

        let base = match location.offset {
            reg::RAX => "ax",
            reg::RCX => "cx",
            reg::RDX => "dx",
            reg::RBX => "bx",
            reg::RSP => "sp",
            reg::RBP => "bp",
            reg::RSI => "si",
            reg::RDI => "di",
            reg::R8 => "r8",
            reg::R9 => "r9",
            reg::R10 => "r10",
            reg::R11 => "r11",
            reg::R12 => "r12",
            reg::R13 => "r13",
            reg::R14 => "r14",
            reg::R15 => "r15",
            reg::RIP => "ip",
            reg::ZF => return Some("zf".to_string()),
            reg::SF => return Some("sf".to_string()),
            reg::CF => return Some("cf".to_string()),
            reg::OF => return Some("of".to_string()),
            reg::PF => return Some("pf".to_string()),
            _ => return None,
        };

        // r8〜r15は数字サフィクス、それ以外はr/e接頭辞でサイズを表す
        let name = if base.starts_with('r') {
            match location.size {
                8 => base.to_string(),
                4 => format!("{}d", base),
                2 => format!("{}w", base),
                1 => format!("{}b", base),
                _ => base.to_string(),
            }
        } else {
            match location.size {
                8 => format!("r{}", base),
                4 => format!("e{}", base),
                2 => base.to_string(),
                1 => format!("{}l", &base[..1]),
                _ => format!("r{}", base),
            }
        };

        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_memory_classification() {
        let arch = X64Architecture::new();

        assert!(arch.is_global_memory(&MemoryLocation::global(0x404000, 8)));
        assert!(!arch.is_global_memory(&MemoryLocation::register(reg::RAX, 8)));
        assert!(!arch.is_global_memory(&MemoryLocation::stack(-8, 8)));
        assert!(!arch.is_global_memory(&MemoryLocation::temporary(0, 8)));
    }

    #[test]
    fn test_register_names() {
        let arch = X64Architecture::new();

        assert_eq!(arch.register_name(&MemoryLocation::register(reg::RAX, 8)).unwrap(), "rax");
        assert_eq!(arch.register_name(&MemoryLocation::register(reg::RAX, 4)).unwrap(), "eax");
        assert_eq!(arch.register_name(&MemoryLocation::register(reg::R8, 4)).unwrap(), "r8d");
        assert_eq!(arch.register_name(&MemoryLocation::register(reg::ZF, 1)).unwrap(), "zf");
        assert!(arch.register_name(&MemoryLocation::stack(-8, 8)).is_none());
    }

    #[test]
    fn test_default_convention() {
        let arch = X64Architecture::new();
        let conv = arch.default_convention();

        assert_eq!(conv.arguments.len(), 6);
        assert_eq!(conv.arguments[0].offset, reg::RDI);
        assert_eq!(conv.return_value.unwrap().offset, reg::RAX);
    }
}
