use std::collections::HashMap;

use crate::calling::Hooks;
use crate::ir::{FunId, Function, Functions, Program, StatementKind, StmtId, TermId};

/// 関数の国勢調査
///
/// 基本ブロックから到達できる文と項（フック経由のものを含む）を
/// 決定的な順序で集める
#[derive(Debug, Default)]
pub struct Census {
    statements: Vec<StmtId>,
    terms: Vec<TermId>,
}

impl Census {
    pub fn statements(&self) -> &[StmtId] {
        &self.statements
    }

    pub fn terms(&self) -> &[TermId] {
        &self.terms
    }
}

/// 関数ひとつ分の調査を実行する
pub fn census_function(program: &Program, function: &Function, hooks: Option<&Hooks>) -> Census {
    let mut census = Census::default();

    for &block in &function.blocks {
        for &stmt in &program.block(block).statements {
            census.statements.push(stmt);

            match &program.statement(stmt).kind {
                StatementKind::Comment { .. } | StatementKind::InlineAssembly { .. } => {}

                StatementKind::Assignment { left, right } => {
                    program.collect_subterms(*left, &mut census.terms);
                    program.collect_subterms(*right, &mut census.terms);
                }

                StatementKind::Kill { target } => {
                    program.collect_subterms(*target, &mut census.terms);
                }

                StatementKind::Jump(jump) => {
                    if let Some(condition) = jump.condition {
                        program.collect_subterms(condition, &mut census.terms);
                    }
                    if let Some(address) = jump.then_target.address {
                        program.collect_subterms(address, &mut census.terms);
                    }
                    if let Some(address) = jump.else_target.as_ref().and_then(|t| t.address) {
                        program.collect_subterms(address, &mut census.terms);
                    }
                }

                StatementKind::Call { target } => {
                    program.collect_subterms(*target, &mut census.terms);

                    if let Some(hook) = hooks.and_then(|h| h.get_call_hook(stmt)) {
                        let mut hook_terms: Vec<TermId> =
                            hook.argument_terms().map(|(_, term)| term).collect();
                        hook_terms.sort();
                        if let Some(term) = hook.return_value_term() {
                            hook_terms.push(term);
                        }
                        for term in hook_terms {
                            program.collect_subterms(term, &mut census.terms);
                        }
                    }
                }

                StatementKind::Return => {
                    if let Some(hook) = hooks.and_then(|h| h.get_return_hook(function, stmt)) {
                        let mut hook_terms: Vec<TermId> =
                            hook.terms().map(|(_, term)| term).collect();
                        hook_terms.sort();
                        for term in hook_terms {
                            program.collect_subterms(term, &mut census.terms);
                        }
                    }
                }
            }
        }
    }

    census
}

/// 項→関数の対応表
#[derive(Debug, Default)]
pub struct TermToFunction {
    map: HashMap<TermId, FunId>,
}

impl TermToFunction {
    /// 全関数を調査して対応表を作る
    pub fn compute(program: &Program, functions: &Functions, hooks: &Hooks) -> Self {
        let mut map = HashMap::new();
        for function in functions.list() {
            let census = census_function(program, function, Some(hooks));
            for &term in census.terms() {
                map.insert(term, function.id);
            }
        }
        Self { map }
    }

    pub fn function_of(&self, term: TermId) -> Option<FunId> {
        self.map.get(&term).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
