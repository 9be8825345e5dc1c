use std::collections::HashSet;

use crate::arch::Architecture;
use crate::calling::{Hooks, Signatures};
use crate::census::census_function;
use crate::cflow::Graph;
use crate::dataflow::Dataflow;
use crate::ir::{Function, Program, StatementKind, StmtId, TermId, TermKind};

/// 関数ひとつ分の生存集合
///
/// 単調: 一度生きた項はパスの間ずっと生きたまま
#[derive(Debug, Default)]
pub struct Liveness {
    live: HashSet<TermId>,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_live(&self, term: TermId) -> bool {
        self.live.contains(&term)
    }

    /// 項を生存にする。すでに生きていればfalse
    pub fn make_live(&mut self, term: TermId) -> bool {
        self.live.insert(term)
    }

    pub fn live_terms(&self) -> impl Iterator<Item = TermId> + '_ {
        self.live.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

/// 生存性解析
///
/// プログラムが観測する値を持つ項を求める。種は (a) グローバル・未解決
/// ポインタへの格納 (b) 生きているジャンプの条件と行き先 (c) シグネチャの
/// 引数として呼び出しへ流れる項 (d) 自関数の戻り値。そこからデータフローの
/// 定義連鎖と複合項の構造を遡って伝播する
pub struct LivenessAnalyzer<'a> {
    liveness: Liveness,
    program: &'a Program,
    function: &'a Function,
    dataflow: &'a Dataflow,
    architecture: &'a dyn Architecture,
    graph: &'a Graph,
    hooks: &'a Hooks,
    signatures: &'a Signatures,
    /// 構造解析が冗長と証明したジャンプ（二分探索のため整列）
    dead_jumps: Vec<StmtId>,
}

impl<'a> LivenessAnalyzer<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        program: &'a Program,
        function: &'a Function,
        dataflow: &'a Dataflow,
        architecture: &'a dyn Architecture,
        graph: &'a Graph,
        hooks: &'a Hooks,
        signatures: &'a Signatures,
    ) -> Self {
        Self {
            liveness: Liveness::new(),
            program,
            function,
            dataflow,
            architecture,
            graph,
            hooks,
            signatures,
            dead_jumps: Vec::new(),
        }
    }

    pub fn analyze(mut self) -> Liveness {
        self.collect_dead_jumps();

        let census = census_function(self.program, self.function, Some(self.hooks));

        for &stmt in census.statements() {
            self.compute_statement_liveness(stmt);
        }
        for &term in census.terms() {
            self.compute_term_liveness(term);
        }

        // 自関数のシグネチャに戻り値があれば、各Return地点の戻り値項を種にする
        if let Some(callee) = self.hooks.get_function_callee_id(self.function) {
            if let Some(signature) = self.signatures.get(&callee) {
                if let Some(return_location) = signature.return_value {
                    for &ret in &self.function.returns {
                        if let Some(hook) = self.hooks.get_return_hook(self.function, ret) {
                            if let Some(term) = hook.return_value_term(&return_location) {
                                self.make_live(term);
                            }
                        }
                    }
                }
            }
        }

        self.liveness
    }

    /// Switch領域の範囲検査ノードの終端ジャンプは冗長
    fn collect_dead_jumps(&mut self) {
        self.dead_jumps.clear();

        for node in self.graph.nodes() {
            if let Some(region) = node.as_region() {
                if let Some(switch) = region.as_switch() {
                    if let Some(bounds_node) = switch.bounds_check_node {
                        if let Some(block) = self.graph.basic_block(bounds_node) {
                            if let Some(jump) = self.program.terminating_jump(block) {
                                self.dead_jumps.push(jump);
                            }
                        }
                    }
                }
            }
        }

        self.dead_jumps.sort();
    }

    /// 文ごとの種
    fn compute_statement_liveness(&mut self, stmt: StmtId) {
        match &self.program.statement(stmt).kind {
            StatementKind::Comment { .. }
            | StatementKind::InlineAssembly { .. }
            | StatementKind::Assignment { .. }
            | StatementKind::Kill { .. }
            | StatementKind::Return => {}

            StatementKind::Jump(jump) => {
                if self.dead_jumps.binary_search(&stmt).is_err() {
                    if let Some(condition) = jump.condition {
                        self.make_live(condition);
                    }
                    if let Some(address) = jump.then_target.address {
                        self.make_live(address);
                    }
                    if let Some(address) = jump.else_target.as_ref().and_then(|t| t.address) {
                        self.make_live(address);
                    }
                }
            }

            StatementKind::Call { target } => {
                self.make_live(*target);

                if let Some(callee) = self.hooks.get_callee_id(stmt) {
                    if let Some(signature) = self.signatures.get(&callee) {
                        if let Some(hook) = self.hooks.get_call_hook(stmt) {
                            let argument_terms: Vec<TermId> = signature
                                .arguments
                                .iter()
                                .filter_map(|location| hook.argument_term(location))
                                .collect();
                            for term in argument_terms {
                                self.make_live(term);
                            }
                        }
                    }
                }
            }
        }
    }

    /// 項ごとの種
    fn compute_term_liveness(&mut self, term: TermId) {
        match &self.program.term(term).kind {
            TermKind::IntConst { .. }
            | TermKind::Intrinsic { .. }
            | TermKind::Undefined
            | TermKind::UnaryOperator { .. }
            | TermKind::BinaryOperator { .. }
            | TermKind::Choice { .. } => {}

            TermKind::MemoryLocationAccess { location } => {
                // グローバルメモリへの格納は副作用として残る
                if self.program.term(term).is_write() && self.architecture.is_global_memory(location) {
                    self.make_live(term);
                }
            }

            TermKind::Dereference { .. } => {
                // 未知ポインタまたはグローバル位置への格納は観測可能
                if self.program.term(term).is_write() {
                    match self.dataflow.memory_location(term) {
                        None => {
                            self.make_live(term);
                        }
                        Some(location) => {
                            if self.architecture.is_global_memory(&location) {
                                self.make_live(term);
                            }
                        }
                    }
                }
            }
        }
    }

    /// 項を生存にして、そこから届く項へ伝播する
    ///
    /// 再帰の代わりに明示的なワークリストで深さを抑える
    pub fn make_live(&mut self, term: TermId) {
        let mut worklist = vec![term];

        while let Some(term) = worklist.pop() {
            if !self.liveness.make_live(term) {
                continue;
            }
            self.propagate(term, &mut worklist);
        }
    }

    fn propagate(&self, term: TermId, worklist: &mut Vec<TermId>) {
        #[cfg(feature = "prefer-constants")]
        {
            // 具体値が分かっている読み取りはそれ自身で表現できるので遡らない
            if self.program.term(term).is_read() && self.dataflow.value(term).is_concrete() {
                return;
            }
        }

        match &self.program.term(term).kind {
            TermKind::IntConst { .. } | TermKind::Intrinsic { .. } | TermKind::Undefined => {}

            TermKind::MemoryLocationAccess { .. } => {
                self.propagate_through_dataflow(term, worklist);
            }

            TermKind::Dereference { address } => {
                self.propagate_through_dataflow(term, worklist);

                // 未解決ポインタはアドレス式を手放せない
                if self.dataflow.memory_location(term).is_none() {
                    worklist.push(*address);
                }
            }

            TermKind::UnaryOperator { operand, .. } => {
                worklist.push(*operand);
            }

            TermKind::BinaryOperator { left, right, .. } => {
                worklist.push(*left);
                worklist.push(*right);
            }

            TermKind::Choice { preferred, default } => {
                if !self.dataflow.definitions(*preferred).is_empty() {
                    worklist.push(*preferred);
                } else {
                    worklist.push(*default);
                }
            }
        }
    }

    /// 読み取りなら到達定義へ、書き込みなら格納される右辺へ
    fn propagate_through_dataflow(&self, term: TermId, worklist: &mut Vec<TermId>) {
        if self.program.term(term).is_read() {
            for chunk in &self.dataflow.definitions(term).chunks {
                for &definition in &chunk.definitions {
                    worklist.push(definition);
                }
            }
        } else if let Some(source) = self.program.term(term).source {
            worklist.push(source);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{reg, X64Architecture};
    use crate::calling::{CalleeId, Conventions, Signature};
    use crate::cflow::{GraphBuilder, Region, RegionKind, SwitchRegion};
    use crate::context::CancellationToken;
    use crate::dataflow::DataflowAnalyzer;
    use crate::ir::{BinaryOp, Direction, Functions, JumpTarget, MemoryLocation};
    use std::cell::RefCell;
    use std::rc::Rc;

    /// 合成した関数に生存性解析を一式かけるテストハーネス
    struct Harness {
        program: Program,
        functions: Functions,
        arch: X64Architecture,
        conventions: Rc<RefCell<Conventions>>,
        signatures: Rc<RefCell<Signatures>>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                program: Program::new(),
                functions: Functions::new(),
                arch: X64Architecture::new(),
                conventions: Rc::new(RefCell::new(Conventions::new())),
                signatures: Rc::new(RefCell::new(Signatures::new())),
            }
        }

        fn run(&mut self) -> (Liveness, Hooks, Dataflow) {
            self.run_with_graph(|_, _| {})
        }

        fn run_with_graph<F>(&mut self, customize: F) -> (Liveness, Hooks, Dataflow)
        where
            F: FnOnce(&mut Graph, &Program),
        {
            let mut hooks = Hooks::new(self.conventions.clone(), self.signatures.clone());
            hooks.prepare(&mut self.program, &self.functions);

            let function = &self.functions.list()[0];
            let dataflow = DataflowAnalyzer::new(&self.program, &self.arch, function, &hooks)
                .analyze(&CancellationToken::new())
                .unwrap();

            let mut graph = GraphBuilder::new().build(function);
            customize(&mut graph, &self.program);

            let signatures = self.signatures.borrow();
            let liveness = LivenessAnalyzer::new(
                &self.program,
                function,
                &dataflow,
                &self.arch,
                &graph,
                &hooks,
                &signatures,
            )
            .analyze();
            drop(signatures);

            (liveness, hooks, dataflow)
        }
    }

    /// 生きている複合項の閉包が成り立つかを確かめる
    fn check_closure(program: &Program, dataflow: &Dataflow, liveness: &Liveness) {
        for term in liveness.live_terms() {
            // 定数化された読み取りは伝播を打ち切るので閉包の対象外
            #[cfg(feature = "prefer-constants")]
            {
                if program.term(term).is_read() && dataflow.value(term).is_concrete() {
                    continue;
                }
            }

            match &program.term(term).kind {
                TermKind::UnaryOperator { operand, .. } => {
                    assert!(liveness.is_live(*operand));
                }
                TermKind::BinaryOperator { left, right, .. } => {
                    assert!(liveness.is_live(*left));
                    assert!(liveness.is_live(*right));
                }
                TermKind::Choice { preferred, default } => {
                    if !dataflow.definitions(*preferred).is_empty() {
                        assert!(liveness.is_live(*preferred));
                    } else {
                        assert!(liveness.is_live(*default));
                    }
                }
                TermKind::MemoryLocationAccess { .. } | TermKind::Dereference { .. } => {
                    if program.term(term).is_read() {
                        for chunk in &dataflow.definitions(term).chunks {
                            for &definition in &chunk.definitions {
                                assert!(liveness.is_live(definition));
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_leaf_assignment_is_dead() {
        // x = 1; return  — 観測されないので空
        let mut h = Harness::new();
        let block = h.program.add_block(Some(0x1000));

        let rax = h.program.access(MemoryLocation::register(reg::RAX, 8), Direction::Write);
        let one = h.program.int_const(1, 8);
        h.program.push_assignment(block, Some(0x1000), rax, one);
        let ret = h.program.push_return(block, Some(0x1005));

        let fun_id = h.functions.push(block, vec![block]);
        h.functions.get_mut(fun_id).returns.push(ret);

        let (liveness, _, _) = h.run();
        assert!(liveness.is_empty());
    }

    #[test]
    fn test_global_store_is_live() {
        // *0x404000 = 1 — グローバル格納は生存、定数1はsource経由で生存
        let mut h = Harness::new();
        let block = h.program.add_block(Some(0x1000));

        let address = h.program.int_const(0x404000, 8);
        let store = h.program.dereference(address, Direction::Write, 8);
        let one = h.program.int_const(1, 8);
        h.program.push_assignment(block, Some(0x1000), store, one);
        h.program.push_return(block, Some(0x1008));

        h.functions.push(block, vec![block]);

        let (liveness, _, dataflow) = h.run();

        assert!(liveness.is_live(store));
        assert!(liveness.is_live(one));
        check_closure(&h.program, &dataflow, &liveness);
    }

    #[test]
    fn test_unresolved_pointer_store_keeps_address() {
        // *p = y — 格納・y・pすべて生存
        let mut h = Harness::new();
        let block = h.program.add_block(Some(0x1000));

        let p = h.program.access(MemoryLocation::register(reg::RDI, 8), Direction::Read);
        let store = h.program.dereference(p, Direction::Write, 8);
        let y = h.program.access(MemoryLocation::register(reg::RSI, 8), Direction::Read);
        h.program.push_assignment(block, Some(0x1000), store, y);
        h.program.push_return(block, Some(0x1005));

        h.functions.push(block, vec![block]);

        let (liveness, _, dataflow) = h.run();

        assert!(liveness.is_live(store));
        assert!(liveness.is_live(y));
        assert!(liveness.is_live(p));
        check_closure(&h.program, &dataflow, &liveness);
    }

    #[test]
    fn test_call_arguments_become_live() {
        // rdi := 1; rsi := 2; call f(a, b)
        let mut h = Harness::new();
        let block = h.program.add_block(Some(0x1000));

        let rdi_w = h.program.access(MemoryLocation::register(reg::RDI, 8), Direction::Write);
        let one = h.program.int_const(1, 8);
        h.program.push_assignment(block, Some(0x1000), rdi_w, one);

        let rsi_w = h.program.access(MemoryLocation::register(reg::RSI, 8), Direction::Write);
        let two = h.program.int_const(2, 8);
        h.program.push_assignment(block, Some(0x1005), rsi_w, two);

        let target = h.program.int_const(0x401000, 8);
        let call = h.program.push_call(block, Some(0x100a), target);
        h.program.push_return(block, Some(0x100f));

        h.functions.push(block, vec![block]);

        h.signatures.borrow_mut().insert(
            CalleeId::Address(0x401000),
            Signature {
                arguments: vec![
                    MemoryLocation::register(reg::RDI, 8),
                    MemoryLocation::register(reg::RSI, 8),
                ],
                return_value: None,
            },
        );

        let (liveness, hooks, dataflow) = h.run();

        assert!(liveness.is_live(target));

        let hook = hooks.get_call_hook(call).unwrap();
        let arg0 = hook.argument_term(&MemoryLocation::register(reg::RDI, 8)).unwrap();
        let arg1 = hook.argument_term(&MemoryLocation::register(reg::RSI, 8)).unwrap();
        assert!(liveness.is_live(arg0));
        assert!(liveness.is_live(arg1));

        // 引数へ到達する定義と、その右辺も生きる
        // （prefer-constants時は定数化された引数で伝播が止まる）
        #[cfg(not(feature = "prefer-constants"))]
        {
            assert!(liveness.is_live(rdi_w));
            assert!(liveness.is_live(rsi_w));
            assert!(liveness.is_live(one));
            assert!(liveness.is_live(two));
        }

        check_closure(&h.program, &dataflow, &liveness);
    }

    #[test]
    fn test_switch_bounds_check_jump_not_seeded() {
        // b0: cmpの結果で分岐（範囲検査） b1: jmp [table + idx*8]  b2: ret
        let mut h = Harness::new();

        let b0 = h.program.add_block(Some(0x1000));
        let b1 = h.program.add_block(Some(0x1010));
        let b2 = h.program.add_block(Some(0x1020));

        // cf := idx <u 4
        let idx = h.program.access(MemoryLocation::register(reg::RAX, 8), Direction::Read);
        let four = h.program.int_const(4, 8);
        let compare = h.program.binary(BinaryOp::UnsignedLess, idx, four, 1);
        let cf_w = h.program.access(MemoryLocation::register(reg::CF, 1), Direction::Write);
        h.program.push_assignment(b0, Some(0x1000), cf_w, compare);

        let cf_r = h.program.access(MemoryLocation::register(reg::CF, 1), Direction::Read);
        let bounds_jump = h.program.push_jump(
            b0,
            Some(0x1005),
            Some(cf_r),
            JumpTarget::block(b1),
            Some(JumpTarget::block(b2)),
        );

        let idx2 = h.program.access(MemoryLocation::register(reg::RAX, 8), Direction::Read);
        let eight = h.program.int_const(8, 8);
        let scaled = h.program.binary(BinaryOp::Mul, idx2, eight, 8);
        let table = h.program.int_const(0x2000, 8);
        let slot_addr = h.program.binary(BinaryOp::Add, table, scaled, 8);
        let slot = h.program.dereference(slot_addr, Direction::Read, 8);
        h.program.push_jump(b1, Some(0x1010), None, JumpTarget::address(slot), None);

        h.program.push_return(b2, Some(0x1020));

        h.program.add_edge(b0, b1);
        h.program.add_edge(b0, b2);

        h.functions.push(b0, vec![b0, b1, b2]);

        let (liveness, _, dataflow) = h.run_with_graph(|graph, program| {
            let bounds_node = graph.node_of_block(program.block_at(0x1000).unwrap()).unwrap();
            let jump_node = graph.node_of_block(program.block_at(0x1010).unwrap()).unwrap();
            graph.add_region(Region {
                kind: RegionKind::Switch(SwitchRegion {
                    value: None,
                    jump_node,
                    bounds_check_node: Some(bounds_node),
                }),
                nodes: vec![bounds_node, jump_node],
            });
        });

        // 範囲検査ジャンプの条件は種にならず、そこだけに流れる値も死ぬ
        assert!(!liveness.is_live(cf_r));
        assert!(!liveness.is_live(cf_w));
        assert!(!liveness.is_live(compare));

        // 間接ジャンプ自体の行き先は生きている
        assert!(liveness.is_live(slot));
        assert!(liveness.is_live(idx2));

        // 冗長なジャンプが本当に範囲検査ブロックを終端しているか
        let jump_stmt = h.program.terminating_jump(h.program.block_at(0x1000).unwrap()).unwrap();
        assert_eq!(jump_stmt, bounds_jump);

        check_closure(&h.program, &dataflow, &liveness);
    }

    #[test]
    fn test_own_return_value_is_seeded() {
        // rax := 7; return — 自関数のシグネチャに戻り値があれば生きる
        let mut h = Harness::new();
        let block = h.program.add_block(Some(0x1000));

        let rax_w = h.program.access(MemoryLocation::register(reg::RAX, 8), Direction::Write);
        let seven = h.program.int_const(7, 8);
        h.program.push_assignment(block, Some(0x1000), rax_w, seven);
        let ret = h.program.push_return(block, Some(0x1005));

        let fun_id = h.functions.push(block, vec![block]);
        h.functions.get_mut(fun_id).returns.push(ret);

        h.signatures.borrow_mut().insert(
            CalleeId::Address(0x1000),
            Signature {
                arguments: vec![],
                return_value: Some(MemoryLocation::register(reg::RAX, 8)),
            },
        );

        let (liveness, hooks, dataflow) = h.run();

        let function = &h.functions.list()[0];
        let hook = hooks.get_return_hook(function, ret).unwrap();
        let return_term = hook
            .return_value_term(&MemoryLocation::register(reg::RAX, 8))
            .unwrap();

        assert!(liveness.is_live(return_term));
        #[cfg(not(feature = "prefer-constants"))]
        {
            assert!(liveness.is_live(rax_w));
            assert!(liveness.is_live(seven));
        }

        check_closure(&h.program, &dataflow, &liveness);
    }

    #[test]
    fn test_liveness_is_idempotent_and_monotone() {
        let mut h = Harness::new();
        let block = h.program.add_block(Some(0x1000));

        let address = h.program.int_const(0x404000, 8);
        let store = h.program.dereference(address, Direction::Write, 8);
        let one = h.program.int_const(1, 8);
        h.program.push_assignment(block, Some(0x1000), store, one);
        h.program.push_return(block, Some(0x1008));

        h.functions.push(block, vec![block]);

        let (first, _, _) = h.run();
        let (second, _, _) = h.run();

        let a: HashSet<TermId> = first.live_terms().collect();
        let b: HashSet<TermId> = second.live_terms().collect();
        assert_eq!(a, b);

        // make_liveは冪等
        let mut liveness = Liveness::new();
        assert!(liveness.make_live(store));
        assert!(!liveness.make_live(store));
        assert!(liveness.is_live(store));
    }

    #[test]
    fn test_choice_prefers_defined_candidate() {
        let mut h = Harness::new();
        let block = h.program.add_block(Some(0x1000));

        // rcx := 5（preferredへ届く定義）
        let rcx_w = h.program.access(MemoryLocation::register(reg::RCX, 8), Direction::Write);
        let five = h.program.int_const(5, 8);
        h.program.push_assignment(block, Some(0x1000), rcx_w, five);

        // *0x404000 = choice(rcx, rdx)
        let preferred = h.program.access(MemoryLocation::register(reg::RCX, 8), Direction::Read);
        let fallback = h.program.access(MemoryLocation::register(reg::RDX, 8), Direction::Read);
        let choice = h.program.choice(preferred, fallback);
        let address = h.program.int_const(0x404000, 8);
        let store = h.program.dereference(address, Direction::Write, 8);
        h.program.push_assignment(block, Some(0x1005), store, choice);
        h.program.push_return(block, Some(0x100a));

        h.functions.push(block, vec![block]);

        let (liveness, _, dataflow) = h.run();

        assert!(liveness.is_live(choice));
        assert!(!liveness.is_live(fallback));
        #[cfg(not(feature = "prefer-constants"))]
        {
            assert!(liveness.is_live(preferred));
            assert!(liveness.is_live(rcx_w));
        }

        check_closure(&h.program, &dataflow, &liveness);
    }
}
