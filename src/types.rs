use std::collections::HashMap;

use anyhow::Result;

use crate::context::CancellationToken;
use crate::ir::{FunId, Program, TermKind};
use crate::liveness::Liveness;
use crate::variables::Variables;

/// 変数に与える型
///
/// 出力はCなので整数は幅（バイト）と符号の組で持ち、
/// 表示するときにstdintの名前へ落とす
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Unknown,
    Void,
    Int { size: u32, signed: bool },
    Pointer(Box<Type>),
}

impl Type {
    /// 記憶位置の幅から整数型を作る
    ///
    /// stdintに対応する幅は1/2/4/8バイトだけ。それ以外はUnknown
    pub fn int_from_size(size: u32, signed: bool) -> Self {
        match size {
            1 | 2 | 4 | 8 => Type::Int { size, signed },
            _ => Type::Unknown,
        }
    }

    /// C表記の型名
    pub fn to_c_string(&self) -> String {
        match self {
            Type::Void => "void".to_string(),
            Type::Int { size, signed } => {
                let prefix = if *signed { "int" } else { "uint" };
                format!("{}{}_t", prefix, size * 8)
            }
            Type::Pointer(inner) => {
                // 指し先が分からないポインタはvoid*で出す
                if **inner == Type::Unknown {
                    "void*".to_string()
                } else {
                    format!("{}*", inner.to_c_string())
                }
            }
            // 型が付かなかった変数はレジスタ幅の整数で出す
            Type::Unknown => "uint64_t".to_string(),
        }
    }
}

/// 変数ごとの型の表
#[derive(Debug, Clone, Default)]
pub struct Types {
    map: HashMap<usize, Type>,
}

impl Types {
    pub fn type_of(&self, variable_index: usize) -> &Type {
        self.map.get(&variable_index).unwrap_or(&Type::Unknown)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// 型解析
///
/// 生きている項を持つ変数にサイズベースの整数型を与え、間接アクセスの
/// アドレスに使われた変数はポインタに昇格する
pub struct TypeAnalyzer<'a> {
    program: &'a Program,
    variables: &'a Variables,
    livenesses: &'a HashMap<FunId, Liveness>,
}

impl<'a> TypeAnalyzer<'a> {
    pub fn new(
        program: &'a Program,
        variables: &'a Variables,
        livenesses: &'a HashMap<FunId, Liveness>,
    ) -> Self {
        Self { program, variables, livenesses }
    }

    pub fn analyze(self, cancellation: &CancellationToken) -> Result<Types> {
        let mut types = Types::default();

        // 1. 生きている項を持つ変数にサイズベースの型を与える
        for variable in self.variables.list() {
            cancellation.poll()?;

            let any_live = variable
                .terms
                .iter()
                .any(|&term| self.livenesses.values().any(|l| l.is_live(term)));
            if !any_live {
                continue;
            }

            let size = variable
                .location
                .map(|l| l.size)
                .or_else(|| variable.terms.first().map(|&t| self.program.term(t).size))
                .unwrap_or(8);

            types.map.insert(variable.index, Type::int_from_size(size, false));
        }

        // 2. アドレスに使われた変数はポインタ
        for term in self.program.terms() {
            if let TermKind::Dereference { address } = term.kind {
                if let Some(variable) = self.variables.variable_of(address) {
                    if types.map.contains_key(&variable.index) {
                        types
                            .map
                            .insert(variable.index, Type::Pointer(Box::new(Type::Unknown)));
                    }
                }
            }
        }

        Ok(types)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_type_names() {
        assert_eq!(Type::int_from_size(4, false).to_c_string(), "uint32_t");
        assert_eq!(Type::int_from_size(8, true).to_c_string(), "int64_t");
        assert_eq!(Type::int_from_size(1, true).to_c_string(), "int8_t");
        assert_eq!(Type::int_from_size(3, false), Type::Unknown);
        assert_eq!(Type::int_from_size(0, true), Type::Unknown);
    }

    #[test]
    fn test_pointer_type_names() {
        assert_eq!(Type::Pointer(Box::new(Type::Unknown)).to_c_string(), "void*");
        assert_eq!(
            Type::Pointer(Box::new(Type::Int { size: 1, signed: false })).to_c_string(),
            "uint8_t*"
        );
        assert_eq!(Type::Void.to_c_string(), "void");
    }
}
