use serde::{Deserialize, Serialize};

use super::{StmtId, TermId};

/// 記憶域のドメイン
///
/// レジスタ・スタック・グローバルメモリ・一時変数を区別する
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemoryDomain {
    Register,
    Stack,
    Global,
    Temporary,
}

/// 記憶位置 (ドメイン, オフセット, サイズ)
///
/// スタックはフレーム相対の負オフセットを取るためオフセットは符号付き
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemoryLocation {
    pub domain: MemoryDomain,
    pub offset: i64,
    pub size: u32,
}

impl MemoryLocation {
    pub fn new(domain: MemoryDomain, offset: i64, size: u32) -> Self {
        Self { domain, offset, size }
    }

    /// レジスタ位置を作成
    pub fn register(offset: i64, size: u32) -> Self {
        Self::new(MemoryDomain::Register, offset, size)
    }

    /// スタック位置を作成
    pub fn stack(offset: i64, size: u32) -> Self {
        Self::new(MemoryDomain::Stack, offset, size)
    }

    /// グローバルメモリ位置を作成
    pub fn global(offset: i64, size: u32) -> Self {
        Self::new(MemoryDomain::Global, offset, size)
    }

    /// 一時変数位置を作成
    pub fn temporary(offset: i64, size: u32) -> Self {
        Self::new(MemoryDomain::Temporary, offset, size)
    }

    /// 終端オフセット（exclusive）
    pub fn end(&self) -> i64 {
        self.offset + self.size as i64
    }

    /// 同一ドメインで1バイトでも重なるか
    pub fn overlaps(&self, other: &MemoryLocation) -> bool {
        self.domain == other.domain && self.offset < other.end() && other.offset < self.end()
    }

    /// otherを完全に覆うか
    pub fn covers(&self, other: &MemoryLocation) -> bool {
        self.domain == other.domain && self.offset <= other.offset && other.end() <= self.end()
    }

    /// 重なり部分を取り出す
    pub fn intersection(&self, other: &MemoryLocation) -> Option<MemoryLocation> {
        if !self.overlaps(other) {
            return None;
        }
        let offset = self.offset.max(other.offset);
        let end = self.end().min(other.end());
        Some(MemoryLocation::new(self.domain, offset, (end - offset) as u32))
    }
}

impl std::fmt::Display for MemoryLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let domain = match self.domain {
            MemoryDomain::Register => "reg",
            MemoryDomain::Stack => "stack",
            MemoryDomain::Global => "mem",
            MemoryDomain::Temporary => "tmp",
        };
        write!(f, "{}:{:#x}:{}", domain, self.offset, self.size)
    }
}

/// 項の方向（読み取り or 書き込み）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Read,
    Write,
}

/// 単項演算子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Negate,
    SignExtend,
    ZeroExtend,
    Truncate,
}

/// 二項演算子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    UnsignedDiv,
    SignedDiv,
    UnsignedRem,
    SignedRem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Equal,
    NotEqual,
    SignedLess,
    SignedLessOrEqual,
    UnsignedLess,
    UnsignedLessOrEqual,
}

/// 項の種類
///
/// 式レベルのIRノード。子はすべてTermIdで参照する
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TermKind {
    /// 整数定数
    IntConst { value: u64 },
    /// 組み込み疑似値（未定義動作や環境依存値の目印）
    Intrinsic { name: String },
    /// 未定義値
    Undefined,
    /// 既知の記憶位置へのアクセス
    MemoryLocationAccess { location: MemoryLocation },
    /// アドレス式を介した間接アクセス
    Dereference { address: TermId },
    /// 単項演算
    UnaryOperator { op: UnaryOp, operand: TermId },
    /// 二項演算
    BinaryOperator { op: BinaryOp, left: TermId, right: TermId },
    /// 2つの候補から値を選ぶ（優先側に定義があればそちら）
    Choice { preferred: TermId, default: TermId },
}

/// 項
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Term {
    pub id: TermId,
    pub kind: TermKind,
    pub direction: Direction,
    /// サイズ（バイト）
    pub size: u32,
    /// 書き込み項の場合、格納される右辺の項
    pub source: Option<TermId>,
    /// この項を所有する文
    pub statement: Option<StmtId>,
}

impl Term {
    pub fn is_read(&self) -> bool {
        self.direction == Direction::Read
    }

    pub fn is_write(&self) -> bool {
        self.direction == Direction::Write
    }

    /// 既知位置アクセスならその記憶位置
    pub fn as_memory_location_access(&self) -> Option<&MemoryLocation> {
        match &self.kind {
            TermKind::MemoryLocationAccess { location } => Some(location),
            _ => None,
        }
    }

    /// 間接アクセスならアドレス項
    pub fn as_dereference_address(&self) -> Option<TermId> {
        match self.kind {
            TermKind::Dereference { address } => Some(address),
            _ => None,
        }
    }

    pub fn as_choice(&self) -> Option<(TermId, TermId)> {
        match self.kind {
            TermKind::Choice { preferred, default } => Some((preferred, default)),
            _ => None,
        }
    }

    pub fn as_int_const(&self) -> Option<u64> {
        match self.kind {
            TermKind::IntConst { value } => Some(value),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_overlap() {
        let rax = MemoryLocation::register(0, 8);
        let eax = MemoryLocation::register(0, 4);
        let rcx = MemoryLocation::register(8, 8);

        assert!(rax.overlaps(&eax));
        assert!(rax.covers(&eax));
        assert!(!eax.covers(&rax));
        assert!(!rax.overlaps(&rcx));
    }

    #[test]
    fn test_location_intersection() {
        let a = MemoryLocation::stack(-16, 8);
        let b = MemoryLocation::stack(-12, 8);

        let inter = a.intersection(&b).unwrap();
        assert_eq!(inter.offset, -12);
        assert_eq!(inter.size, 4);

        let c = MemoryLocation::register(0, 8);
        assert!(a.intersection(&c).is_none());
    }

    #[test]
    fn test_location_display() {
        let loc = MemoryLocation::register(0x10, 8);
        assert_eq!(format!("{}", loc), "reg:0x10:8");
    }
}
