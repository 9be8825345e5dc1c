/// 呼び出し規約と関数シグネチャ
///
/// 呼び出し先の同定（CalleeId）、規約（Convention）、復元されたシグネチャ
/// （Signature）と、それらを呼び出し地点の項に具体化するフック群
pub mod hooks;

pub use hooks::{CallHook, ConventionDetector, Hooks, ReturnHook};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ir::{MemoryLocation, StmtId};

/// 呼び出し先の同定子
///
/// 既知アドレスの直接呼び出しか、呼び出し地点ごとの関数ポインタクラス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CalleeId {
    /// 既知のエントリアドレス
    Address(u64),
    /// 間接呼び出し（呼び出し文ごとに1クラス）
    Site(StmtId),
}

impl std::fmt::Display for CalleeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalleeId::Address(addr) => write!(f, "callee:{:#x}", addr),
            CalleeId::Site(stmt) => write!(f, "callee:{}", stmt),
        }
    }
}

/// 呼び出し規約
///
/// 引数候補スロット（順序付き）、戻り値スロット、呼び出しで壊れる記憶位置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Convention {
    pub arguments: Vec<MemoryLocation>,
    pub return_value: Option<MemoryLocation>,
    pub scratch: Vec<MemoryLocation>,
}

/// 呼び出し先ごとの規約の表
#[derive(Debug, Clone, Default)]
pub struct Conventions {
    map: HashMap<CalleeId, Convention>,
}

impl Conventions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, callee: &CalleeId) -> Option<&Convention> {
        self.map.get(callee)
    }

    pub fn contains(&self, callee: &CalleeId) -> bool {
        self.map.contains_key(callee)
    }

    pub fn insert(&mut self, callee: CalleeId, convention: Convention) {
        self.map.insert(callee, convention);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// 復元されたシグネチャ
///
/// 引数の記憶位置の順序付きリストと、あれば戻り値の記憶位置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub arguments: Vec<MemoryLocation>,
    pub return_value: Option<MemoryLocation>,
}

/// 呼び出し先ごとのシグネチャの表
///
/// シグネチャ復元パスがこの表をその場で更新する（表自体は差し替えない）
#[derive(Debug, Clone, Default)]
pub struct Signatures {
    map: HashMap<CalleeId, Signature>,
}

impl Signatures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, callee: &CalleeId) -> Option<&Signature> {
        self.map.get(callee)
    }

    pub fn insert(&mut self, callee: CalleeId, signature: Signature) {
        self.map.insert(callee, signature);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
