use serde::{Deserialize, Serialize};

use super::program::Program;
use super::{BlockId, FunId, StmtId};

/// 関数
///
/// 基本ブロックの集合と入口ブロック。名前とコメントは解析中に書き換わる
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub id: FunId,
    pub entry: BlockId,
    /// 入口を含む所属ブロック
    pub blocks: Vec<BlockId>,
    pub name: String,
    pub comment: String,
    /// 関数内のReturn文
    pub returns: Vec<StmtId>,
}

impl Function {
    pub fn new(id: FunId, entry: BlockId, blocks: Vec<BlockId>) -> Self {
        Self {
            id,
            entry,
            blocks,
            name: String::new(),
            comment: String::new(),
            returns: Vec::new(),
        }
    }

    /// 入口ブロックの機械語アドレス
    pub fn entry_address(&self, program: &Program) -> Option<u64> {
        program.block(self.entry).address
    }

    /// コメントに1行追記
    pub fn append_comment(&mut self, line: &str) {
        if !self.comment.is_empty() {
            self.comment.push('\n');
        }
        self.comment.push_str(line);
    }
}

/// 関数の集合
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Functions {
    list: Vec<Function>,
}

impl Functions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: BlockId, blocks: Vec<BlockId>) -> FunId {
        let id = FunId(self.list.len() as u32);
        self.list.push(Function::new(id, entry, blocks));
        id
    }

    pub fn get(&self, id: FunId) -> &Function {
        &self.list[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: FunId) -> &mut Function {
        &mut self.list[id.0 as usize]
    }

    pub fn list(&self) -> &[Function] {
        &self.list
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Function> {
        self.list.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Program;

    #[test]
    fn test_comment_append() {
        let mut program = Program::new();
        let entry = program.add_block(Some(0x1000));

        let mut functions = Functions::new();
        let id = functions.push(entry, vec![entry]);

        let fun = functions.get_mut(id);
        fun.append_comment("_Z3fooi");
        fun.append_comment("foo(int)");
        assert_eq!(fun.comment, "_Z3fooi\nfoo(int)");

        assert_eq!(functions.get(id).entry_address(&program), Some(0x1000));
    }
}
