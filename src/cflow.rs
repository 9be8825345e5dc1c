use std::collections::{HashMap, HashSet};

use crate::dataflow::Dataflow;
use crate::ir::{BlockId, Function, Program, TermId, TermKind};

/// 領域グラフのノードID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Switch領域
///
/// 間接ジャンプとジャンプテーブルから復元される。bounds_check_nodeは
/// インデックスの範囲検査を行うブロックで、その終端ジャンプはswitch構造に
/// 吸収されるため冗長になる
#[derive(Debug, Clone)]
pub struct SwitchRegion {
    /// スイッチ変数（インデックス項）
    pub value: Option<TermId>,
    /// 間接ジャンプを含むノード
    pub jump_node: NodeId,
    /// 範囲検査ノード
    pub bounds_check_node: Option<NodeId>,
}

/// 領域の種類
#[derive(Debug, Clone)]
pub enum RegionKind {
    /// ループ（バックエッジで検出）
    Loop { head: NodeId },
    /// switch文
    Switch(SwitchRegion),
}

/// 領域
#[derive(Debug, Clone)]
pub struct Region {
    pub kind: RegionKind,
    /// 所属ノード
    pub nodes: Vec<NodeId>,
}

impl Region {
    pub fn as_switch(&self) -> Option<&SwitchRegion> {
        match &self.kind {
            RegionKind::Switch(switch) => Some(switch),
            _ => None,
        }
    }
}

/// ノードの種類
#[derive(Debug, Clone)]
pub enum NodeKind {
    Basic { block: BlockId },
    Region(Region),
}

/// 領域グラフのノード
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
}

impl Node {
    pub fn as_region(&self) -> Option<&Region> {
        match &self.kind {
            NodeKind::Region(region) => Some(region),
            _ => None,
        }
    }

    pub fn as_basic_block(&self) -> Option<BlockId> {
        match self.kind {
            NodeKind::Basic { block } => Some(block),
            _ => None,
        }
    }
}

/// 構造化された制御フローグラフ
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    block_nodes: HashMap<BlockId, NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn add_basic(&mut self, block: BlockId) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node { id, kind: NodeKind::Basic { block } });
        self.block_nodes.insert(block, id);
        id
    }

    pub fn add_region(&mut self, region: Region) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node { id, kind: NodeKind::Region(region) });
        id
    }

    /// 基本ブロックに対応するノード
    pub fn node_of_block(&self, block: BlockId) -> Option<NodeId> {
        self.block_nodes.get(&block).copied()
    }

    /// ノードの基本ブロック（領域ノードならNone）
    pub fn basic_block(&self, id: NodeId) -> Option<BlockId> {
        self.node(id).as_basic_block()
    }
}

/// 基本ブロックから領域グラフの骨格を作る
#[derive(Debug, Default)]
pub struct GraphBuilder;

impl GraphBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(&self, function: &Function) -> Graph {
        let mut graph = Graph::new();
        for &block in &function.blocks {
            graph.add_basic(block);
        }
        graph
    }
}

/// 構造解析
///
/// ループとswitchを検出して領域ノードを追加する
pub struct StructureAnalyzer<'a> {
    program: &'a Program,
    function: &'a Function,
    dataflow: &'a Dataflow,
}

impl<'a> StructureAnalyzer<'a> {
    pub fn new(program: &'a Program, function: &'a Function, dataflow: &'a Dataflow) -> Self {
        Self { program, function, dataflow }
    }

    pub fn analyze(&self, graph: &mut Graph) {
        self.detect_loops(graph);
        self.detect_switches(graph);
    }

    /// ループ領域を検出
    ///
    /// 支配木を先に求め、行き先が自分を支配しているエッジをバックエッジとする
    fn detect_loops(&self, graph: &mut Graph) {
        let members: HashSet<BlockId> = self.function.blocks.iter().copied().collect();

        let order = self.reverse_postorder(&members);
        let idom = self.compute_dominators(&order, &members);

        let mut back_edges: Vec<(BlockId, BlockId)> = Vec::new();
        for &block in &order {
            for &succ in &self.program.block(block).successors {
                if members.contains(&succ) && dominates(succ, block, &idom) {
                    back_edges.push((block, succ));
                }
            }
        }

        for (from, to) in back_edges {
            let body = self.natural_loop(from, to, &members);
            let head = match graph.node_of_block(to) {
                Some(node) => node,
                None => continue,
            };
            let nodes: Vec<NodeId> = body
                .iter()
                .filter_map(|&b| graph.node_of_block(b))
                .collect();
            graph.add_region(Region { kind: RegionKind::Loop { head }, nodes });
        }
    }

    /// 入口からの逆ポストオーダー（到達できないブロックは含まない）
    fn reverse_postorder(&self, members: &HashSet<BlockId>) -> Vec<BlockId> {
        let mut visited: HashSet<BlockId> = HashSet::new();
        let mut postorder: Vec<BlockId> = Vec::new();
        self.postorder_walk(self.function.entry, members, &mut visited, &mut postorder);
        postorder.reverse();
        postorder
    }

    fn postorder_walk(
        &self,
        block: BlockId,
        members: &HashSet<BlockId>,
        visited: &mut HashSet<BlockId>,
        out: &mut Vec<BlockId>,
    ) {
        if !visited.insert(block) {
            return;
        }
        for &succ in &self.program.block(block).successors {
            if members.contains(&succ) {
                self.postorder_walk(succ, members, visited, out);
            }
        }
        out.push(block);
    }

    /// 各ブロックの直近支配ノードを反復で求める
    ///
    /// 逆ポストオーダー上で、処理済み先行ノード同士の支配列を交差させる。
    /// 入口の直近支配ノードは入口自身とする
    fn compute_dominators(
        &self,
        order: &[BlockId],
        members: &HashSet<BlockId>,
    ) -> HashMap<BlockId, BlockId> {
        let position: HashMap<BlockId, usize> =
            order.iter().enumerate().map(|(i, &b)| (b, i)).collect();

        let mut idom: HashMap<BlockId, BlockId> = HashMap::new();
        if let Some(&entry) = order.first() {
            idom.insert(entry, entry);
        }

        let mut changed = true;
        while changed {
            changed = false;

            for &block in order.iter().skip(1) {
                let mut candidate: Option<BlockId> = None;
                for &pred in &self.program.block(block).predecessors {
                    if !members.contains(&pred) || !idom.contains_key(&pred) {
                        continue;
                    }
                    candidate = Some(match candidate {
                        None => pred,
                        Some(current) => intersect(pred, current, &idom, &position),
                    });
                }

                if let Some(new_idom) = candidate {
                    if idom.get(&block) != Some(&new_idom) {
                        idom.insert(block, new_idom);
                        changed = true;
                    }
                }
            }
        }

        idom
    }

    /// バックエッジ (from → head) の自然ループ
    fn natural_loop(&self, from: BlockId, head: BlockId, members: &HashSet<BlockId>) -> Vec<BlockId> {
        let mut body = vec![head];
        let mut stack = vec![from];
        let mut seen: HashSet<BlockId> = HashSet::new();
        seen.insert(head);

        while let Some(block) = stack.pop() {
            if !seen.insert(block) {
                continue;
            }
            body.push(block);
            for &pred in &self.program.block(block).predecessors {
                if members.contains(&pred) {
                    stack.push(pred);
                }
            }
        }

        body.sort();
        body
    }

    /// 間接ジャンプからswitch領域を検出
    fn detect_switches(&self, graph: &mut Graph) {
        let members: HashSet<BlockId> = self.function.blocks.iter().copied().collect();
        let mut switches: Vec<Region> = Vec::new();

        for &block in &self.function.blocks {
            let jump_stmt = match self.program.terminating_jump(block) {
                Some(stmt) => stmt,
                None => continue,
            };
            let jump = match self.program.statement(jump_stmt).as_jump() {
                Some(jump) => jump,
                None => continue,
            };

            // 無条件かつ行き先が未解決の間接ジャンプで、ターゲットがテーブル読み込み
            if jump.condition.is_some() || jump.then_target.block.is_some() {
                continue;
            }
            let target = match jump.then_target.address {
                Some(term) => term,
                None => continue,
            };
            let table_address = match self.program.term(target).as_dereference_address() {
                Some(address) => address,
                None => continue,
            };

            let value = self.switch_index(table_address);

            let jump_node = match graph.node_of_block(block) {
                Some(node) => node,
                None => continue,
            };

            // 範囲検査: 条件ジャンプで終わる唯一の先行ブロック
            let preds: Vec<BlockId> = self
                .program
                .block(block)
                .predecessors
                .iter()
                .copied()
                .filter(|p| members.contains(p))
                .collect();
            let bounds_check_node = match preds.as_slice() {
                [pred] => self
                    .program
                    .terminating_jump(*pred)
                    .filter(|&stmt| {
                        self.program
                            .statement(stmt)
                            .as_jump()
                            .map(|j| j.is_conditional())
                            .unwrap_or(false)
                    })
                    .and_then(|_| graph.node_of_block(*pred)),
                _ => None,
            };

            let mut nodes = vec![jump_node];
            if let Some(node) = bounds_check_node {
                nodes.insert(0, node);
            }

            switches.push(Region {
                kind: RegionKind::Switch(SwitchRegion { value, jump_node, bounds_check_node }),
                nodes,
            });
        }

        for region in switches {
            graph.add_region(region);
        }
    }

    /// テーブルアドレス式からスイッチ変数を探す
    ///
    /// base + index*scale の index にあたる項。見つからなければ
    /// アドレス式中の未解決読み取りで代用する
    fn switch_index(&self, address: TermId) -> Option<TermId> {
        let mut subterms = Vec::new();
        self.program.collect_subterms(address, &mut subterms);

        for &term in &subterms {
            if let TermKind::BinaryOperator { op: crate::ir::BinaryOp::Mul, left, right } =
                &self.program.term(term).kind
            {
                if self.program.term(*right).as_int_const().is_some() {
                    return Some(*left);
                }
                if self.program.term(*left).as_int_const().is_some() {
                    return Some(*right);
                }
            }
        }

        subterms
            .iter()
            .copied()
            .find(|&t| {
                matches!(self.program.term(t).kind, TermKind::MemoryLocationAccess { .. })
                    && !self.dataflow.definitions(t).is_empty()
            })
    }
}

/// 支配木上で2ノードの共通の祖先へ登る
fn intersect(
    a: BlockId,
    b: BlockId,
    idom: &HashMap<BlockId, BlockId>,
    position: &HashMap<BlockId, usize>,
) -> BlockId {
    let mut x = a;
    let mut y = b;
    while x != y {
        while position[&x] > position[&y] {
            x = idom[&x];
        }
        while position[&y] > position[&x] {
            y = idom[&y];
        }
    }
    x
}

/// aがbを支配するか。支配木をbから根へ辿って確かめる
fn dominates(a: BlockId, b: BlockId, idom: &HashMap<BlockId, BlockId>) -> bool {
    let mut current = b;
    loop {
        if current == a {
            return true;
        }
        match idom.get(&current) {
            Some(&parent) if parent != current => current = parent,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinaryOp, Direction, Functions, JumpTarget, MemoryLocation};

    #[test]
    fn test_switch_detection_with_bounds_check() {
        let mut program = Program::new();

        // b0: if (index <= 3) goto b1 else goto b2
        // b1: jmp [0x2000 + index*8]
        // b2: ret
        let b0 = program.add_block(Some(0x1000));
        let b1 = program.add_block(Some(0x1010));
        let b2 = program.add_block(Some(0x1020));

        let cf = program.access(MemoryLocation::register(514, 1), Direction::Read);
        program.push_jump(
            b0,
            Some(0x1000),
            Some(cf),
            JumpTarget::block(b1),
            Some(JumpTarget::block(b2)),
        );

        let index = program.access(MemoryLocation::register(0, 8), Direction::Read);
        let eight = program.int_const(8, 8);
        let scaled = program.binary(BinaryOp::Mul, index, eight, 8);
        let base = program.int_const(0x2000, 8);
        let addr = program.binary(BinaryOp::Add, base, scaled, 8);
        let table = program.dereference(addr, Direction::Read, 8);
        program.push_jump(b1, Some(0x1010), None, JumpTarget::address(table), None);

        program.push_return(b2, Some(0x1020));

        program.add_edge(b0, b1);
        program.add_edge(b0, b2);

        let mut functions = Functions::new();
        let fun_id = functions.push(b0, vec![b0, b1, b2]);
        let function = functions.get(fun_id);

        let dataflow = Dataflow::new();
        let mut graph = GraphBuilder::new().build(function);
        StructureAnalyzer::new(&program, function, &dataflow).analyze(&mut graph);

        let switch = graph
            .nodes()
            .filter_map(|n| n.as_region())
            .filter_map(|r| r.as_switch())
            .next()
            .expect("switch region not detected");

        assert_eq!(switch.value, Some(index));
        assert_eq!(graph.basic_block(switch.jump_node), Some(b1));
        assert_eq!(switch.bounds_check_node.and_then(|n| graph.basic_block(n)), Some(b0));
    }

    #[test]
    fn test_loop_detection() {
        let mut program = Program::new();

        // b0 → b1 → b1（自己ループ）→ b2
        let b0 = program.add_block(Some(0x1000));
        let b1 = program.add_block(Some(0x1010));
        let b2 = program.add_block(Some(0x1020));

        program.push_jump(b0, Some(0x1000), None, JumpTarget::block(b1), None);
        let zf = program.access(MemoryLocation::register(512, 1), Direction::Read);
        program.push_jump(
            b1,
            Some(0x1010),
            Some(zf),
            JumpTarget::block(b1),
            Some(JumpTarget::block(b2)),
        );
        program.push_return(b2, Some(0x1020));

        program.add_edge(b0, b1);
        program.add_edge(b1, b1);
        program.add_edge(b1, b2);

        let mut functions = Functions::new();
        let fun_id = functions.push(b0, vec![b0, b1, b2]);
        let function = functions.get(fun_id);

        let dataflow = Dataflow::new();
        let mut graph = GraphBuilder::new().build(function);
        StructureAnalyzer::new(&program, function, &dataflow).analyze(&mut graph);

        let has_loop = graph
            .nodes()
            .filter_map(|n| n.as_region())
            .any(|r| matches!(r.kind, RegionKind::Loop { .. }));
        assert!(has_loop);
    }

    #[test]
    fn test_diamond_is_not_a_loop() {
        let mut program = Program::new();

        // b0 → {b1, b2} → b3（合流はあるがループはない）
        let b0 = program.add_block(Some(0x1000));
        let b1 = program.add_block(Some(0x1010));
        let b2 = program.add_block(Some(0x1020));
        let b3 = program.add_block(Some(0x1030));

        let zf = program.access(MemoryLocation::register(512, 1), Direction::Read);
        program.push_jump(
            b0,
            Some(0x1000),
            Some(zf),
            JumpTarget::block(b1),
            Some(JumpTarget::block(b2)),
        );
        program.push_jump(b1, Some(0x1010), None, JumpTarget::block(b3), None);
        program.push_jump(b2, Some(0x1020), None, JumpTarget::block(b3), None);
        program.push_return(b3, Some(0x1030));

        program.add_edge(b0, b1);
        program.add_edge(b0, b2);
        program.add_edge(b1, b3);
        program.add_edge(b2, b3);

        let mut functions = Functions::new();
        let fun_id = functions.push(b0, vec![b0, b1, b2, b3]);
        let function = functions.get(fun_id);

        let dataflow = Dataflow::new();
        let mut graph = GraphBuilder::new().build(function);
        StructureAnalyzer::new(&program, function, &dataflow).analyze(&mut graph);

        // 合流点b3への前向きエッジはバックエッジではない
        let has_loop = graph
            .nodes()
            .filter_map(|n| n.as_region())
            .any(|r| matches!(r.kind, RegionKind::Loop { .. }));
        assert!(!has_loop);
    }
}
