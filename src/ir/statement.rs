use serde::{Deserialize, Serialize};

use super::{BlockId, StmtId, TermId};

/// ジャンプの行き先
///
/// 明示的なアドレス項と、解決済みの基本ブロックの両方またはどちらかを持つ
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JumpTarget {
    pub address: Option<TermId>,
    pub block: Option<BlockId>,
}

impl JumpTarget {
    pub fn block(block: BlockId) -> Self {
        Self { address: None, block: Some(block) }
    }

    pub fn address(address: TermId) -> Self {
        Self { address: Some(address), block: None }
    }

    pub fn resolved(address: TermId, block: BlockId) -> Self {
        Self { address: Some(address), block: Some(block) }
    }
}

/// ジャンプ文の中身
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JumpData {
    /// 条件項（無条件ジャンプならNone）
    pub condition: Option<TermId>,
    pub then_target: JumpTarget,
    pub else_target: Option<JumpTarget>,
}

impl JumpData {
    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }
}

/// 文の種類
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StatementKind {
    /// 注釈（コード生成には影響しない）
    Comment { text: String },
    /// リフトできなかった命令
    InlineAssembly { text: String },
    /// 代入
    Assignment { left: TermId, right: TermId },
    /// 記憶位置の無効化（呼び出し後のフラグ等）
    Kill { target: TermId },
    /// ジャンプ
    Jump(JumpData),
    /// 関数呼び出し
    Call { target: TermId },
    /// 関数からの復帰
    Return,
}

/// 文
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statement {
    pub id: StmtId,
    /// 由来する機械語アドレス
    pub address: Option<u64>,
    pub kind: StatementKind,
}

impl Statement {
    pub fn as_jump(&self) -> Option<&JumpData> {
        match &self.kind {
            StatementKind::Jump(jump) => Some(jump),
            _ => None,
        }
    }

    pub fn as_call_target(&self) -> Option<TermId> {
        match self.kind {
            StatementKind::Call { target } => Some(target),
            _ => None,
        }
    }

    pub fn as_assignment(&self) -> Option<(TermId, TermId)> {
        match self.kind {
            StatementKind::Assignment { left, right } => Some((left, right)),
            _ => None,
        }
    }

    pub fn is_return(&self) -> bool {
        matches!(self.kind, StatementKind::Return)
    }
}
