use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use anyhow::Result;

use crate::arch::Architecture;
use crate::calling::Hooks;
use crate::context::CancellationToken;
use crate::ir::{
    BinaryOp, BlockId, Function, MemoryLocation, Program, StatementKind, TermId, TermKind, UnaryOp,
};

/// 抽象値
///
/// 具体的な定数、スタックポインタ相対のオフセット、不明のいずれか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbstractValue {
    Concrete(u64),
    StackOffset(i64),
    Unknown,
}

impl AbstractValue {
    pub fn is_concrete(&self) -> bool {
        matches!(self, AbstractValue::Concrete(_))
    }

    pub fn as_concrete(&self) -> Option<u64> {
        match self {
            AbstractValue::Concrete(value) => Some(*value),
            _ => None,
        }
    }
}

/// 到達定義の断片
///
/// 読み取り項のフットプリントの部分範囲と、そこへ到達する定義項の集合
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub location: MemoryLocation,
    pub definitions: Vec<TermId>,
}

/// 読み取り項ごとの到達定義
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReachingDefinitions {
    pub chunks: Vec<Chunk>,
}

impl ReachingDefinitions {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

static EMPTY_DEFINITIONS: ReachingDefinitions = ReachingDefinitions { chunks: Vec::new() };

/// 関数ひとつ分のデータフロー解析結果
#[derive(Debug, Default)]
pub struct Dataflow {
    values: HashMap<TermId, AbstractValue>,
    memory_locations: HashMap<TermId, MemoryLocation>,
    definitions: HashMap<TermId, ReachingDefinitions>,
    /// 書き込みより先に読まれた記憶位置（引数の証拠）
    uninitialized_reads: HashSet<MemoryLocation>,
    /// 関数内のどこかで書かれた記憶位置
    written: HashSet<MemoryLocation>,
}

impl Dataflow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self, term: TermId) -> AbstractValue {
        self.values.get(&term).copied().unwrap_or(AbstractValue::Unknown)
    }

    /// 解決済みの記憶位置（間接アクセスで未解決ならNone）
    pub fn memory_location(&self, term: TermId) -> Option<MemoryLocation> {
        self.memory_locations.get(&term).copied()
    }

    pub fn definitions(&self, term: TermId) -> &ReachingDefinitions {
        self.definitions.get(&term).unwrap_or(&EMPTY_DEFINITIONS)
    }

    pub fn uninitialized_reads(&self) -> &HashSet<MemoryLocation> {
        &self.uninitialized_reads
    }

    pub fn is_written(&self, location: &MemoryLocation) -> bool {
        self.written.iter().any(|w| w.overlaps(location))
    }

    pub fn terms_with_definitions(&self) -> impl Iterator<Item = (TermId, &ReachingDefinitions)> {
        self.definitions.iter().map(|(&term, defs)| (term, defs))
    }

    pub fn located_terms(&self) -> impl Iterator<Item = (TermId, MemoryLocation)> + '_ {
        self.memory_locations.iter().map(|(&term, &loc)| (term, loc))
    }

    // テストと解析器が直接結果を構築するための書き込み口

    pub fn set_value(&mut self, term: TermId, value: AbstractValue) {
        self.values.insert(term, value);
    }

    pub fn set_memory_location(&mut self, term: TermId, location: MemoryLocation) {
        self.memory_locations.insert(term, location);
    }

    pub fn set_definitions(&mut self, term: TermId, definitions: ReachingDefinitions) {
        self.definitions.insert(term, definitions);
    }
}

/// 定義状態: 記憶位置ごとの現在の定義項集合
type DefState = Vec<(MemoryLocation, BTreeSet<TermId>)>;

/// データフロー解析器
///
/// ブロック単位のワークリストで到達定義の不動点を求め、その後に
/// 最終状態から各項の値・位置・定義を記録する
pub struct DataflowAnalyzer<'a> {
    program: &'a Program,
    architecture: &'a dyn Architecture,
    function: &'a Function,
    hooks: &'a Hooks,
    dataflow: Dataflow,
}

impl<'a> DataflowAnalyzer<'a> {
    pub fn new(
        program: &'a Program,
        architecture: &'a dyn Architecture,
        function: &'a Function,
        hooks: &'a Hooks,
    ) -> Self {
        Self {
            program,
            architecture,
            function,
            hooks,
            dataflow: Dataflow::new(),
        }
    }

    pub fn analyze(mut self, cancellation: &CancellationToken) -> Result<Dataflow> {
        let members: HashSet<BlockId> = self.function.blocks.iter().copied().collect();

        let mut in_states: HashMap<BlockId, DefState> = HashMap::new();
        let mut out_states: HashMap<BlockId, DefState> = HashMap::new();

        let mut queue: VecDeque<BlockId> = self.function.blocks.iter().copied().collect();
        let mut queued: HashSet<BlockId> = queue.iter().copied().collect();

        // 1. 到達定義の不動点
        while let Some(block) = queue.pop_front() {
            cancellation.poll()?;
            queued.remove(&block);

            let mut state = self.merged_in_state(block, &members, &out_states);
            in_states.insert(block, state.clone());

            self.execute_block(block, &mut state, false);

            if out_states.get(&block) != Some(&state) {
                out_states.insert(block, state);
                for &succ in &self.program.block(block).successors {
                    if members.contains(&succ) && queued.insert(succ) {
                        queue.push_back(succ);
                    }
                }
            }
        }

        // 2. 最終状態からの記録パス
        for &block in &self.function.blocks {
            cancellation.poll()?;
            let mut state = self.merged_in_state(block, &members, &out_states);
            self.execute_block(block, &mut state, true);
        }

        Ok(self.dataflow)
    }

    fn merged_in_state(
        &self,
        block: BlockId,
        members: &HashSet<BlockId>,
        out_states: &HashMap<BlockId, DefState>,
    ) -> DefState {
        let mut state = DefState::new();
        for &pred in &self.program.block(block).predecessors {
            if !members.contains(&pred) {
                continue;
            }
            if let Some(pred_out) = out_states.get(&pred) {
                merge_states(&mut state, pred_out);
            }
        }
        state
    }

    fn execute_block(&mut self, block: BlockId, state: &mut DefState, record: bool) {
        for &stmt in &self.program.block(block).statements {
            match &self.program.statement(stmt).kind {
                StatementKind::Comment { .. } | StatementKind::InlineAssembly { .. } => {}

                StatementKind::Assignment { left, right } => {
                    let value = self.eval_read(*right, state, record);
                    self.exec_write(*left, value, state, record);
                }

                StatementKind::Kill { target } => {
                    if let Some(location) = self.program.term(*target).as_memory_location_access() {
                        kill_location(state, location);
                    }
                }

                StatementKind::Jump(jump) => {
                    if let Some(condition) = jump.condition {
                        self.eval_read(condition, state, record);
                    }
                    if let Some(address) = jump.then_target.address {
                        self.eval_read(address, state, record);
                    }
                    if let Some(address) = jump.else_target.as_ref().and_then(|t| t.address) {
                        self.eval_read(address, state, record);
                    }
                }

                StatementKind::Call { target } => {
                    self.eval_read(*target, state, record);

                    // 引数フック項は呼び出し直前の状態で読む
                    if let Some(hook) = self.hooks.get_call_hook(stmt) {
                        let argument_terms: Vec<TermId> =
                            hook.argument_terms().map(|(_, term)| term).collect();
                        for term in argument_terms {
                            self.eval_read(term, state, record);
                        }
                    }

                    // 呼び出しで壊れるレジスタを無効化
                    if let Some(callee) = self.hooks.get_callee_id(stmt) {
                        if let Some(convention) = self.hooks.convention(&callee) {
                            for location in &convention.scratch {
                                kill_location(state, location);
                            }
                        }
                    }

                    // 戻り値スロットは呼び出しが定義する
                    if let Some(term) = self.hooks.get_call_hook(stmt).and_then(|h| h.return_value_term()) {
                        if let Some(location) = self.program.term(term).as_memory_location_access() {
                            let location = *location;
                            define_location(state, location, term);
                            if record {
                                self.dataflow.written.insert(location);
                                self.dataflow.set_value(term, AbstractValue::Unknown);
                            }
                        }
                    }
                }

                StatementKind::Return => {
                    if let Some(hook) = self.hooks.get_return_hook(self.function, stmt) {
                        let terms: Vec<TermId> = hook.terms().map(|(_, term)| term).collect();
                        for term in terms {
                            self.eval_read(term, state, record);
                        }
                    }
                }
            }
        }
    }

    /// 読み取り項を評価し、到達定義と抽象値を求める
    fn eval_read(&mut self, term: TermId, state: &DefState, record: bool) -> AbstractValue {
        let kind = self.program.term(term).kind.clone();
        let size = self.program.term(term).size;

        let value = match kind {
            TermKind::IntConst { value } => AbstractValue::Concrete(value),
            TermKind::Intrinsic { .. } | TermKind::Undefined => AbstractValue::Unknown,

            TermKind::MemoryLocationAccess { location } => {
                self.read_location(term, location, state, record)
            }

            TermKind::Dereference { address } => {
                let address_value = self.eval_read(address, state, record);
                match self.resolve_address(address_value, size) {
                    Some(location) => {
                        self.dataflow.set_memory_location(term, location);
                        self.read_location(term, location, state, record)
                    }
                    None => {
                        self.dataflow.memory_locations.remove(&term);
                        if record {
                            self.dataflow.set_definitions(term, ReachingDefinitions::default());
                        }
                        AbstractValue::Unknown
                    }
                }
            }

            TermKind::UnaryOperator { op, operand } => {
                let operand_size = self.program.term(operand).size;
                let value = self.eval_read(operand, state, record);
                fold_unary(op, value, operand_size, size)
            }

            TermKind::BinaryOperator { op, left, right } => {
                let l = self.eval_read(left, state, record);
                let r = self.eval_read(right, state, record);
                fold_binary(op, l, r, size)
            }

            TermKind::Choice { preferred, default } => {
                let p = self.eval_read(preferred, state, record);
                let d = self.eval_read(default, state, record);
                if !self.dataflow.definitions(preferred).is_empty() {
                    p
                } else {
                    d
                }
            }
        };

        // 不動点パスでも値を記録する。解決と値推定が両パスで一致するため
        self.dataflow.set_value(term, value);
        value
    }

    /// 既知位置の読み取り: 到達定義を引いて値を推定する
    fn read_location(
        &mut self,
        term: TermId,
        location: MemoryLocation,
        state: &DefState,
        record: bool,
    ) -> AbstractValue {
        let definitions = chunks_for(state, &location);
        let covered = footprint_covered(&location, &definitions);

        let value = if definitions.chunks.is_empty()
            && location == self.architecture.stack_pointer()
        {
            // 関数入口でのスタックポインタ
            AbstractValue::StackOffset(0)
        } else {
            let mut all_defs: BTreeSet<TermId> = BTreeSet::new();
            for chunk in &definitions.chunks {
                all_defs.extend(chunk.definitions.iter().copied());
            }
            if covered && all_defs.len() == 1 {
                self.dataflow.value(*all_defs.iter().next().unwrap())
            } else {
                AbstractValue::Unknown
            }
        };

        if record {
            if !covered && location.domain != crate::ir::MemoryDomain::Temporary {
                self.dataflow.uninitialized_reads.insert(location);
            }
            self.dataflow.set_definitions(term, definitions);
        }

        value
    }

    /// 書き込み項を実行する
    fn exec_write(&mut self, term: TermId, value: AbstractValue, state: &mut DefState, record: bool) {
        let kind = self.program.term(term).kind.clone();
        let size = self.program.term(term).size;

        match kind {
            TermKind::MemoryLocationAccess { location } => {
                define_location(state, location, term);
                self.dataflow.set_value(term, value);
                if record {
                    self.dataflow.written.insert(location);
                }
            }
            TermKind::Dereference { address } => {
                let address_value = self.eval_read(address, state, record);
                match self.resolve_address(address_value, size) {
                    Some(location) => {
                        define_location(state, location, term);
                        self.dataflow.set_memory_location(term, location);
                        self.dataflow.set_value(term, value);
                        if record {
                            self.dataflow.written.insert(location);
                        }
                    }
                    None => {
                        // ポインタ未解決の格納は何も無効化しない（保守的）
                        self.dataflow.memory_locations.remove(&term);
                        self.dataflow.set_value(term, value);
                    }
                }
            }
            _ => {}
        }
    }

    /// アドレス抽象値から記憶位置を求める
    fn resolve_address(&self, address: AbstractValue, size: u32) -> Option<MemoryLocation> {
        match address {
            AbstractValue::Concrete(value) => Some(MemoryLocation::global(value as i64, size)),
            AbstractValue::StackOffset(offset) => Some(MemoryLocation::stack(offset, size)),
            AbstractValue::Unknown => None,
        }
    }
}

/// 状態の併合（定義集合の和）
fn merge_states(into: &mut DefState, other: &DefState) {
    for (location, defs) in other {
        match into.iter_mut().find(|(l, _)| l == location) {
            Some((_, existing)) => existing.extend(defs.iter().copied()),
            None => into.push((*location, defs.clone())),
        }
    }
}

/// 位置への書き込み: 完全に覆われた定義を消して新しい定義を立てる
fn define_location(state: &mut DefState, location: MemoryLocation, term: TermId) {
    state.retain(|(l, _)| !location.covers(l));
    let mut defs = BTreeSet::new();
    defs.insert(term);
    state.push((location, defs));
}

/// 位置の無効化: 重なる定義をすべて消す
fn kill_location(state: &mut DefState, location: &MemoryLocation) {
    state.retain(|(l, _)| !location.overlaps(l));
}

/// 読み取りフットプリントに重なる定義を断片として集める
fn chunks_for(state: &DefState, location: &MemoryLocation) -> ReachingDefinitions {
    let mut chunks: Vec<Chunk> = Vec::new();

    for (def_location, defs) in state {
        if let Some(intersection) = def_location.intersection(location) {
            match chunks.iter_mut().find(|c| c.location == intersection) {
                Some(chunk) => {
                    for &def in defs {
                        if !chunk.definitions.contains(&def) {
                            chunk.definitions.push(def);
                        }
                    }
                }
                None => chunks.push(Chunk {
                    location: intersection,
                    definitions: defs.iter().copied().collect(),
                }),
            }
        }
    }

    for chunk in &mut chunks {
        chunk.definitions.sort();
    }
    chunks.sort_by_key(|c| (c.location.offset, c.location.size));

    ReachingDefinitions { chunks }
}

/// 断片がフットプリント全体を覆うか
fn footprint_covered(location: &MemoryLocation, definitions: &ReachingDefinitions) -> bool {
    let mut covered = location.offset;
    loop {
        if covered >= location.end() {
            return true;
        }
        let next = definitions
            .chunks
            .iter()
            .filter(|c| c.location.offset <= covered && covered < c.location.end())
            .map(|c| c.location.end())
            .max();
        match next {
            Some(end) if end > covered => covered = end,
            _ => return false,
        }
    }
}

fn fold_unary(op: UnaryOp, value: AbstractValue, operand_size: u32, size: u32) -> AbstractValue {
    let concrete = match value.as_concrete() {
        Some(v) => v,
        None => return AbstractValue::Unknown,
    };

    let result = match op {
        UnaryOp::Not => !concrete,
        UnaryOp::Negate => concrete.wrapping_neg(),
        UnaryOp::ZeroExtend | UnaryOp::Truncate => concrete,
        UnaryOp::SignExtend => {
            let bits = operand_size * 8;
            if bits >= 64 {
                concrete
            } else {
                let sign = 1u64 << (bits - 1);
                if concrete & sign != 0 {
                    concrete | !(sign * 2 - 1)
                } else {
                    concrete
                }
            }
        }
    };

    AbstractValue::Concrete(mask_to_size(result, size))
}

fn fold_binary(op: BinaryOp, left: AbstractValue, right: AbstractValue, size: u32) -> AbstractValue {
    use AbstractValue::*;

    // スタックポインタ相対の加減算
    match (op, left, right) {
        (BinaryOp::Add, StackOffset(base), Concrete(delta))
        | (BinaryOp::Add, Concrete(delta), StackOffset(base)) => {
            return StackOffset(base.wrapping_add(delta as i64));
        }
        (BinaryOp::Sub, StackOffset(base), Concrete(delta)) => {
            return StackOffset(base.wrapping_sub(delta as i64));
        }
        _ => {}
    }

    let (l, r) = match (left.as_concrete(), right.as_concrete()) {
        (Some(l), Some(r)) => (l, r),
        _ => return Unknown,
    };

    let result = match op {
        BinaryOp::Add => l.wrapping_add(r),
        BinaryOp::Sub => l.wrapping_sub(r),
        BinaryOp::Mul => l.wrapping_mul(r),
        BinaryOp::UnsignedDiv => {
            if r == 0 {
                return Unknown;
            }
            l / r
        }
        BinaryOp::SignedDiv => {
            if r == 0 {
                return Unknown;
            }
            (l as i64).wrapping_div(r as i64) as u64
        }
        BinaryOp::UnsignedRem => {
            if r == 0 {
                return Unknown;
            }
            l % r
        }
        BinaryOp::SignedRem => {
            if r == 0 {
                return Unknown;
            }
            (l as i64).wrapping_rem(r as i64) as u64
        }
        BinaryOp::And => l & r,
        BinaryOp::Or => l | r,
        BinaryOp::Xor => l ^ r,
        BinaryOp::Shl => l.wrapping_shl(r as u32),
        BinaryOp::Shr => l.wrapping_shr(r as u32),
        BinaryOp::Sar => ((l as i64).wrapping_shr(r as u32)) as u64,
        BinaryOp::Equal => (l == r) as u64,
        BinaryOp::NotEqual => (l != r) as u64,
        BinaryOp::SignedLess => ((l as i64) < (r as i64)) as u64,
        BinaryOp::SignedLessOrEqual => ((l as i64) <= (r as i64)) as u64,
        BinaryOp::UnsignedLess => (l < r) as u64,
        BinaryOp::UnsignedLessOrEqual => (l <= r) as u64,
    };

    Concrete(mask_to_size(result, size))
}

fn mask_to_size(value: u64, size: u32) -> u64 {
    if size >= 8 {
        value
    } else {
        value & ((1u64 << (size * 8)) - 1)
    }
}
