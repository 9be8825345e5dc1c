use std::cell::RefCell;
use std::collections::HashMap;

use anyhow::Result;

use crate::calling::{Hooks, Signature, Signatures};
use crate::context::CancellationToken;
use crate::dataflow::Dataflow;
use crate::ir::{FunId, Functions};

/// シグネチャ復元
///
/// 規約の引数候補スロットのうち、関数本体で書き込みより先に読まれた
/// 接頭辞を引数とみなす。戻り値スロットは本体が定義していれば採用する。
/// 結果は既存のSignaturesへその場で書き込む
pub struct SignatureAnalyzer<'a> {
    signatures: &'a RefCell<Signatures>,
    functions: &'a Functions,
    dataflows: &'a HashMap<FunId, Dataflow>,
    hooks: &'a Hooks,
}

impl<'a> SignatureAnalyzer<'a> {
    pub fn new(
        signatures: &'a RefCell<Signatures>,
        functions: &'a Functions,
        dataflows: &'a HashMap<FunId, Dataflow>,
        hooks: &'a Hooks,
    ) -> Self {
        Self { signatures, functions, dataflows, hooks }
    }

    pub fn analyze(&self, cancellation: &CancellationToken) -> Result<()> {
        for function in self.functions.list() {
            cancellation.poll()?;

            let callee = match self.hooks.get_function_callee_id(function) {
                Some(callee) => callee,
                None => continue,
            };
            let convention = match self.hooks.convention(&callee) {
                Some(convention) => convention,
                None => continue,
            };
            let dataflow = match self.dataflows.get(&function.id) {
                Some(dataflow) => dataflow,
                None => continue,
            };

            // 引数: 未初期化読み取りに現れる候補スロットの最長接頭辞
            let mut arguments = Vec::new();
            for slot in &convention.arguments {
                let read_uninitialized = dataflow
                    .uninitialized_reads()
                    .iter()
                    .any(|read| slot.overlaps(read));
                if read_uninitialized {
                    arguments.push(*slot);
                } else {
                    break;
                }
            }

            // 戻り値: 規約のスロットを本体が定義していれば採用
            let return_value = convention
                .return_value
                .filter(|location| dataflow.is_written(location));

            self.signatures
                .borrow_mut()
                .insert(callee, Signature { arguments, return_value });
        }

        Ok(())
    }
}
