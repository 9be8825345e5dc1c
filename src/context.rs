use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::calling::{Conventions, Hooks, Signatures};
use crate::census::TermToFunction;
use crate::cflow::Graph;
use crate::codegen::Tree;
use crate::dataflow::Dataflow;
use crate::insn::Instructions;
use crate::ir::{FunId, Functions, Program};
use crate::liveness::Liveness;
use crate::module::Module;
use crate::types::Types;
use crate::variables::Variables;

/// パイプラインの失敗
#[derive(Debug, Error)]
pub enum PipelineError {
    /// 協調的キャンセルによる中断。Contextは部分的な状態のまま破棄される
    #[error("decompilation cancelled")]
    Cancelled,
}

/// キャンセルトークン
///
/// 別スレッドから発火でき、解析側は区切りごとにpollする
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// 発火していればCancelledで巻き戻す
    pub fn poll(&self) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// ログの受け口
///
/// コアはロギング基盤に直接依存しない。フェーズ名などの文字列を受け取る
pub trait LogSink {
    fn log(&self, message: &str);
}

/// tracingへ転送する既定のシンク
#[derive(Debug, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, message: &str) {
        tracing::info!("{}", message);
    }
}

/// すべて捨てるシンク
#[derive(Debug, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn log(&self, _message: &str) {}
}

/// デコンパイルの結果ストア
///
/// 各解析パスの成果物を型付きスロットで保持する。スロットは原則1回書き込み。
/// Signatures / Conventions / Hooks / Dataflows のみパス再実行で更新される
pub struct Context {
    pub(crate) module: Option<Module>,
    pub(crate) instructions: Option<Instructions>,
    pub(crate) program: Option<Program>,
    pub(crate) functions: Option<Functions>,
    pub(crate) conventions: Option<Rc<RefCell<Conventions>>>,
    pub(crate) signatures: Option<Rc<RefCell<Signatures>>>,
    pub(crate) hooks: Option<Hooks>,
    pub(crate) dataflows: Option<HashMap<FunId, Dataflow>>,
    pub(crate) variables: Option<Variables>,
    pub(crate) graphs: Option<HashMap<FunId, Graph>>,
    pub(crate) livenesses: Option<HashMap<FunId, Liveness>>,
    pub(crate) types: Option<Types>,
    pub(crate) tree: Option<Tree>,
    pub(crate) term_to_function: Option<TermToFunction>,
    cancellation: CancellationToken,
    log_sink: Box<dyn LogSink>,
}

fn installed<'a, T>(slot: &'a Option<T>, name: &str) -> &'a T {
    match slot {
        Some(value) => value,
        None => panic!("precondition not met: {} is not installed", name),
    }
}

fn install<T>(slot: &mut Option<T>, value: T, name: &str) {
    if slot.is_some() {
        panic!("precondition not met: {} is already installed", name);
    }
    *slot = Some(value);
}

impl Context {
    pub fn new() -> Self {
        Self {
            module: None,
            instructions: None,
            program: None,
            functions: None,
            conventions: None,
            signatures: None,
            hooks: None,
            dataflows: None,
            variables: None,
            graphs: None,
            livenesses: None,
            types: None,
            tree: None,
            term_to_function: None,
            cancellation: CancellationToken::new(),
            log_sink: Box::new(TracingSink),
        }
    }

    pub fn with_log_sink(mut self, sink: Box<dyn LogSink>) -> Self {
        self.log_sink = sink;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn log(&self, message: &str) {
        self.log_sink.log(message);
    }

    // ===== スロット =====

    pub fn module(&self) -> &Module {
        installed(&self.module, "module")
    }

    pub fn set_module(&mut self, module: Module) {
        install(&mut self.module, module, "module");
    }

    pub fn instructions(&self) -> &Instructions {
        installed(&self.instructions, "instructions")
    }

    pub fn set_instructions(&mut self, instructions: Instructions) {
        install(&mut self.instructions, instructions, "instructions");
    }

    pub fn program(&self) -> &Program {
        installed(&self.program, "program")
    }

    pub fn set_program(&mut self, program: Program) {
        install(&mut self.program, program, "program");
    }

    pub fn functions(&self) -> &Functions {
        installed(&self.functions, "functions")
    }

    pub fn set_functions(&mut self, functions: Functions) {
        install(&mut self.functions, functions, "functions");
    }

    pub fn has_conventions(&self) -> bool {
        self.conventions.is_some()
    }

    pub fn conventions(&self) -> &Rc<RefCell<Conventions>> {
        installed(&self.conventions, "conventions")
    }

    /// 規約ストアを設置する。Hooks構築後は差し替えず中身を更新する
    pub fn set_conventions(&mut self, conventions: Rc<RefCell<Conventions>>) {
        self.conventions = Some(conventions);
    }

    pub fn has_signatures(&self) -> bool {
        self.signatures.is_some()
    }

    pub fn signatures(&self) -> &Rc<RefCell<Signatures>> {
        installed(&self.signatures, "signatures")
    }

    /// シグネチャストアを設置する。Hooks構築後は差し替えず中身を更新する
    pub fn set_signatures(&mut self, signatures: Rc<RefCell<Signatures>>) {
        self.signatures = Some(signatures);
    }

    pub fn hooks(&self) -> &Hooks {
        installed(&self.hooks, "hooks")
    }

    /// フックを設置する（データフローパスごとに作り直される）
    pub fn set_hooks(&mut self, hooks: Hooks) {
        self.hooks = Some(hooks);
    }

    pub fn dataflows(&self) -> &HashMap<FunId, Dataflow> {
        installed(&self.dataflows, "dataflows")
    }

    /// データフロー表を設置する（2回目のパスで置き換えられる）
    pub fn set_dataflows(&mut self, dataflows: HashMap<FunId, Dataflow>) {
        self.dataflows = Some(dataflows);
    }

    pub fn variables(&self) -> &Variables {
        installed(&self.variables, "variables")
    }

    pub fn set_variables(&mut self, variables: Variables) {
        install(&mut self.variables, variables, "variables");
    }

    pub fn graphs(&self) -> &HashMap<FunId, Graph> {
        installed(&self.graphs, "graphs")
    }

    pub fn set_graphs(&mut self, graphs: HashMap<FunId, Graph>) {
        install(&mut self.graphs, graphs, "graphs");
    }

    pub fn livenesses(&self) -> &HashMap<FunId, Liveness> {
        installed(&self.livenesses, "livenesses")
    }

    pub fn set_livenesses(&mut self, livenesses: HashMap<FunId, Liveness>) {
        install(&mut self.livenesses, livenesses, "livenesses");
    }

    pub fn types(&self) -> &Types {
        installed(&self.types, "types")
    }

    pub fn set_types(&mut self, types: Types) {
        install(&mut self.types, types, "types");
    }

    pub fn tree(&self) -> &Tree {
        installed(&self.tree, "tree")
    }

    pub fn set_tree(&mut self, tree: Tree) {
        install(&mut self.tree, tree, "tree");
    }

    pub fn term_to_function(&self) -> &TermToFunction {
        installed(&self.term_to_function, "term_to_function")
    }

    pub fn set_term_to_function(&mut self, map: TermToFunction) {
        install(&mut self.term_to_function, map, "term_to_function");
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
