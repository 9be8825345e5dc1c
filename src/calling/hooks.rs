use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use super::{CalleeId, Convention, Conventions, Signatures};
use crate::ir::{Direction, Function, Functions, MemoryLocation, Program, StatementKind, StmtId, TermId};

/// 規約検出コールバック
///
/// 未知のCalleeIdを初めて見たときに呼ばれ、Conventionsへ追記できる
pub type ConventionDetector = Box<dyn Fn(&CalleeId, &mut Conventions)>;

/// 呼び出し地点ごとのフック
///
/// シグネチャの引数スロットに対応する読み取り項と、戻り値スロットへの
/// 書き込み項を具体化して保持する
#[derive(Debug, Default)]
pub struct CallHook {
    arguments: HashMap<MemoryLocation, TermId>,
    return_value: Option<TermId>,
}

impl CallHook {
    /// 引数スロットに対応する項
    pub fn argument_term(&self, location: &MemoryLocation) -> Option<TermId> {
        self.arguments.get(location).copied()
    }

    pub fn argument_terms(&self) -> impl Iterator<Item = (&MemoryLocation, TermId)> {
        self.arguments.iter().map(|(loc, &term)| (loc, term))
    }

    /// 呼び出し地点で戻り値スロットを定義する項
    pub fn return_value_term(&self) -> Option<TermId> {
        self.return_value
    }
}

/// Return文ごとのフック
#[derive(Debug, Default)]
pub struct ReturnHook {
    values: HashMap<MemoryLocation, TermId>,
}

impl ReturnHook {
    /// 戻り値スロットに対応する読み取り項
    pub fn return_value_term(&self, location: &MemoryLocation) -> Option<TermId> {
        self.values.get(location).copied()
    }

    pub fn terms(&self) -> impl Iterator<Item = (&MemoryLocation, TermId)> {
        self.values.iter().map(|(loc, &term)| (loc, term))
    }
}

/// フック群
///
/// ConventionsとSignaturesへの共有参照の上に構築される。両ストアは
/// フック構築後に差し替えてはならず、更新は中身の書き換えで行う
pub struct Hooks {
    conventions: Rc<RefCell<Conventions>>,
    signatures: Rc<RefCell<Signatures>>,
    detector: Option<ConventionDetector>,
    seen: HashSet<CalleeId>,
    function_callees: HashMap<u32, CalleeId>,
    call_callees: HashMap<StmtId, CalleeId>,
    call_hooks: HashMap<StmtId, CallHook>,
    return_hooks: HashMap<(u32, StmtId), ReturnHook>,
}

impl Hooks {
    pub fn new(conventions: Rc<RefCell<Conventions>>, signatures: Rc<RefCell<Signatures>>) -> Self {
        Self {
            conventions,
            signatures,
            detector: None,
            seen: HashSet::new(),
            function_callees: HashMap::new(),
            call_callees: HashMap::new(),
            call_hooks: HashMap::new(),
            return_hooks: HashMap::new(),
        }
    }

    /// 規約検出コールバックを設定
    pub fn set_convention_detector(&mut self, detector: ConventionDetector) {
        self.detector = Some(detector);
    }

    /// 未知のCalleeIdを初めて見たときに検出コールバックを起動する
    fn first_sight(&mut self, callee: CalleeId) {
        if !self.seen.insert(callee) {
            return;
        }
        if self.conventions.borrow().contains(&callee) {
            return;
        }
        if let Some(detector) = &self.detector {
            detector(&callee, &mut self.conventions.borrow_mut());
        }
    }

    /// 全関数の呼び出し・復帰地点にフック項を具体化する
    ///
    /// データフローパスの冒頭で呼ばれる。現在のシグネチャに従って
    /// 引数・戻り値の項をプログラムのアリーナへ割り当てる
    pub fn prepare(&mut self, program: &mut Program, functions: &Functions) {
        for function in functions.list() {
            let function_callee = function
                .entry_address(program)
                .map(CalleeId::Address);

            if let Some(callee) = function_callee {
                self.first_sight(callee);
                self.function_callees.insert(function.id.0, callee);
            }

            for &block in &function.blocks {
                for &stmt in &program.block(block).statements.clone() {
                    if let StatementKind::Call { target } = program.statement(stmt).kind {
                        let callee = match program.term(target).as_int_const() {
                            Some(address) => CalleeId::Address(address),
                            None => CalleeId::Site(stmt),
                        };
                        self.first_sight(callee);
                        self.call_callees.insert(stmt, callee);

                        let signature = self.signatures.borrow().get(&callee).cloned();
                        if let Some(signature) = signature {
                            let mut hook = CallHook::default();
                            for &location in &signature.arguments {
                                let term = program.access(location, Direction::Read);
                                program.attach_term(term, stmt);
                                hook.arguments.insert(location, term);
                            }
                            if let Some(location) = signature.return_value {
                                let term = program.access(location, Direction::Write);
                                program.attach_term(term, stmt);
                                hook.return_value = Some(term);
                            }
                            self.call_hooks.insert(stmt, hook);
                        }
                    }
                }
            }

            // 関数自身のシグネチャに戻り値があれば、各Return文にフックを張る
            if let Some(callee) = function_callee {
                let return_location = self
                    .signatures
                    .borrow()
                    .get(&callee)
                    .and_then(|s| s.return_value);
                if let Some(location) = return_location {
                    for &ret in &function.returns {
                        let term = program.access(location, Direction::Read);
                        program.attach_term(term, ret);
                        let hook = self
                            .return_hooks
                            .entry((function.id.0, ret))
                            .or_default();
                        hook.values.insert(location, term);
                    }
                }
            }
        }
    }

    /// 関数のCalleeId
    pub fn get_function_callee_id(&self, function: &Function) -> Option<CalleeId> {
        self.function_callees.get(&function.id.0).copied()
    }

    /// 呼び出し文のCalleeId
    pub fn get_callee_id(&self, call: StmtId) -> Option<CalleeId> {
        self.call_callees.get(&call).copied()
    }

    pub fn get_call_hook(&self, call: StmtId) -> Option<&CallHook> {
        self.call_hooks.get(&call)
    }

    pub fn get_return_hook(&self, function: &Function, ret: StmtId) -> Option<&ReturnHook> {
        self.return_hooks.get(&(function.id.0, ret))
    }

    /// 呼び出し先の規約
    pub fn convention(&self, callee: &CalleeId) -> Option<Convention> {
        self.conventions.borrow().get(callee).cloned()
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("call_hooks", &self.call_hooks.len())
            .field("return_hooks", &self.return_hooks.len())
            .finish()
    }
}
