use std::collections::HashMap;

use crate::dataflow::Dataflow;
use crate::ir::{FunId, Functions, MemoryLocation, Program, TermId, TermKind};

/// 復元された変数
#[derive(Debug, Clone)]
pub struct Variable {
    pub index: usize,
    /// 代表の記憶位置（全項が未解決ならNone）
    pub location: Option<MemoryLocation>,
    /// この変数に統合された項
    pub terms: Vec<TermId>,
}

/// 項→変数の対応表
#[derive(Debug, Clone, Default)]
pub struct Variables {
    assignment: HashMap<TermId, usize>,
    list: Vec<Variable>,
}

impl Variables {
    pub fn variable_of(&self, term: TermId) -> Option<&Variable> {
        self.assignment.get(&term).map(|&index| &self.list[index])
    }

    pub fn list(&self) -> &[Variable] {
        &self.list
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

/// 項→変数の統合
///
/// 到達定義で結ばれた読み取りと定義を同じ変数に束ねる。定義を持たない
/// 読み取り（引数など）は関数内で記憶位置ごとに束ねる
pub struct VariableAnalyzer<'a> {
    program: &'a Program,
    functions: &'a Functions,
    dataflows: &'a HashMap<FunId, Dataflow>,
}

impl<'a> VariableAnalyzer<'a> {
    pub fn new(
        program: &'a Program,
        functions: &'a Functions,
        dataflows: &'a HashMap<FunId, Dataflow>,
    ) -> Self {
        Self { program, functions, dataflows }
    }

    pub fn analyze(self) -> Variables {
        let mut union_find = UnionFind::default();

        for function in self.functions.list() {
            let dataflow = match self.dataflows.get(&function.id) {
                Some(dataflow) => dataflow,
                None => continue,
            };

            // 到達定義の辺で統合
            let mut reads: Vec<(TermId, Vec<TermId>)> = dataflow
                .terms_with_definitions()
                .map(|(term, defs)| {
                    let mut d: Vec<TermId> = defs
                        .chunks
                        .iter()
                        .flat_map(|c| c.definitions.iter().copied())
                        .collect();
                    d.sort();
                    d.dedup();
                    (term, d)
                })
                .collect();
            reads.sort_by_key(|(term, _)| *term);

            let mut unbound: HashMap<MemoryLocation, TermId> = HashMap::new();
            for (read, defs) in reads {
                if defs.is_empty() {
                    let location = self.storage_location(read, dataflow);
                    if let Some(location) = location {
                        match unbound.get(&location) {
                            Some(&first) => union_find.union(read, first),
                            None => {
                                unbound.insert(location, read);
                                union_find.insert(read);
                            }
                        }
                    }
                    continue;
                }
                for def in defs {
                    union_find.union(read, def);
                }
            }
        }

        // 等価類から変数を作る
        let mut variables = Variables::default();
        let mut class_index: HashMap<TermId, usize> = HashMap::new();

        let mut members: Vec<TermId> = union_find.members();
        members.sort();

        for term in members {
            let root = union_find.find(term);
            let index = match class_index.get(&root) {
                Some(&index) => index,
                None => {
                    let index = variables.list.len();
                    class_index.insert(root, index);
                    variables.list.push(Variable { index, location: None, terms: Vec::new() });
                    index
                }
            };

            let variable = &mut variables.list[index];
            variable.terms.push(term);
            if variable.location.is_none() {
                variable.location = self.storage_location_any(term);
            }
            variables.assignment.insert(term, index);
        }

        variables
    }

    /// 項の記憶位置（該当関数のデータフローで解決）
    fn storage_location(&self, term: TermId, dataflow: &Dataflow) -> Option<MemoryLocation> {
        match &self.program.term(term).kind {
            TermKind::MemoryLocationAccess { location } => Some(*location),
            TermKind::Dereference { .. } => dataflow.memory_location(term),
            _ => None,
        }
    }

    fn storage_location_any(&self, term: TermId) -> Option<MemoryLocation> {
        if let TermKind::MemoryLocationAccess { location } = &self.program.term(term).kind {
            return Some(*location);
        }
        for dataflow in self.dataflows.values() {
            if let Some(location) = dataflow.memory_location(term) {
                return Some(location);
            }
        }
        None
    }
}

/// 経路圧縮付きUnion-Find
#[derive(Debug, Default)]
struct UnionFind {
    parent: HashMap<TermId, TermId>,
}

impl UnionFind {
    fn insert(&mut self, term: TermId) {
        self.parent.entry(term).or_insert(term);
    }

    fn find(&mut self, term: TermId) -> TermId {
        self.insert(term);
        let mut root = term;
        while self.parent[&root] != root {
            root = self.parent[&root];
        }
        let mut current = term;
        while self.parent[&current] != root {
            let next = self.parent[&current];
            self.parent.insert(current, root);
            current = next;
        }
        root
    }

    fn union(&mut self, a: TermId, b: TermId) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            // 小さいIDを根にして決定的にする
            let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent.insert(child, root);
        }
    }

    fn members(&self) -> Vec<TermId> {
        self.parent.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{reg, X64Architecture};
    use crate::calling::{Conventions, Hooks, Signatures};
    use crate::context::CancellationToken;
    use crate::dataflow::DataflowAnalyzer;
    use crate::ir::{Direction, Program};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_read_unifies_with_definition() {
        let mut program = Program::new();
        let block = program.add_block(Some(0x1000));

        let rax_w = program.access(MemoryLocation::register(reg::RAX, 8), Direction::Write);
        let one = program.int_const(1, 8);
        program.push_assignment(block, Some(0x1000), rax_w, one);

        let rax_r = program.access(MemoryLocation::register(reg::RAX, 8), Direction::Read);
        let rcx_w = program.access(MemoryLocation::register(reg::RCX, 8), Direction::Write);
        program.push_assignment(block, Some(0x1005), rcx_w, rax_r);
        program.push_return(block, Some(0x100a));

        let mut functions = Functions::new();
        let fun_id = functions.push(block, vec![block]);

        let arch = X64Architecture::new();
        let hooks = Hooks::new(
            Rc::new(RefCell::new(Conventions::new())),
            Rc::new(RefCell::new(Signatures::new())),
        );
        let dataflow = DataflowAnalyzer::new(&program, &arch, functions.get(fun_id), &hooks)
            .analyze(&CancellationToken::new())
            .unwrap();

        let mut dataflows = HashMap::new();
        dataflows.insert(fun_id, dataflow);

        let variables = VariableAnalyzer::new(&program, &functions, &dataflows).analyze();

        let v_write = variables.variable_of(rax_w).unwrap();
        let v_read = variables.variable_of(rax_r).unwrap();
        assert_eq!(v_write.index, v_read.index);
        assert_eq!(v_write.location, Some(MemoryLocation::register(reg::RAX, 8)));
    }
}
