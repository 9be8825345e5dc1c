use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::Result;
use xxhash_rust::xxh3::Xxh3;

use crate::calling::{ConventionDetector, Conventions, Hooks, Signatures};
use crate::census::TermToFunction;
use crate::cflow::{GraphBuilder, StructureAnalyzer};
use crate::codegen::{CodeGenerator, Tree};
use crate::context::Context;
use crate::dataflow::{Dataflow, DataflowAnalyzer};
use crate::funcgen::FunctionsGenerator;
use crate::ir::{FunId, Function};
use crate::irgen::IrGenerator;
use crate::liveness::LivenessAnalyzer;
use crate::module::Module;
use crate::sigrec::SignatureAnalyzer;
use crate::types::TypeAnalyzer;
use crate::variables::VariableAnalyzer;

/// パイプライン制御
///
/// 12段のパス列を順に実行し、フェーズごとにログとキャンセル確認を行う。
/// データフローは2回走る: 1回目はシグネチャなしで呼び出し先を洗い出し、
/// シグネチャ復元後の2回目で精度を上げる
pub trait MasterAnalyzer {
    /// 未知の呼び出し先に対する規約検出コールバック（既定では何もしない）
    fn convention_detector(&self, _module: &Module) -> ConventionDetector {
        Box::new(|_, _| {})
    }

    fn create_program(&self, context: &mut Context) -> Result<()> {
        context.log("Creating intermediate representation of the program.");

        let program = IrGenerator::new(context.module().architecture(), context.instructions())
            .generate(context.cancellation())?;

        context.set_program(program);
        Ok(())
    }

    fn create_functions(&self, context: &mut Context) -> Result<()> {
        context.log("Creating functions.");

        let mut functions =
            FunctionsGenerator::new().make_functions(context.program(), context.module());

        for function in functions.iter_mut() {
            self.pick_function_name(context, function);
        }

        context.set_functions(functions);
        Ok(())
    }

    fn pick_function_name(&self, context: &Context, function: &mut Function) {
        if let Some(address) = function.entry_address(context.program()) {
            match context.module().get_name(address) {
                Some(name) if !name.is_empty() => {
                    // シンボル名があればそれを正規化して使う
                    let clean = Tree::clean_name(name);
                    if name != clean {
                        function.append_comment(name);
                    }

                    let demangled = context.module().demangler().demangle(name);
                    if demangled.contains('(') {
                        // デマングル結果が関数らしければコメントに残す
                        function.append_comment(&demangled);
                    }

                    function.name = clean;
                }
                _ => {
                    // 入口アドレスから名前を発明する
                    function.name = format!("func_{:x}", address);
                }
            }
        } else {
            // 入口がなければ実行内で安定な一意スタンプを使う
            function.name = format!("func_noentry_{:x}", function_identity(function));
        }
    }

    fn dataflow_analysis(&self, context: &mut Context) -> Result<()> {
        context.log("Dataflow analysis.");

        if !context.has_signatures() {
            context.set_signatures(Rc::new(RefCell::new(Signatures::new())));
        }
        if !context.has_conventions() {
            context.set_conventions(Rc::new(RefCell::new(Conventions::new())));
        }

        let mut hooks = Hooks::new(context.conventions().clone(), context.signatures().clone());
        hooks.set_convention_detector(self.convention_detector(context.module()));

        {
            let program = match context.program.as_mut() {
                Some(program) => program,
                None => panic!("precondition not met: program is not installed"),
            };
            let functions = match context.functions.as_ref() {
                Some(functions) => functions,
                None => panic!("precondition not met: functions is not installed"),
            };
            hooks.prepare(program, functions);
        }
        context.set_hooks(hooks);

        let mut dataflows = HashMap::new();
        for function in context.functions().list() {
            self.dataflow_analysis_of_function(context, function, &mut dataflows)?;
            context.cancellation().poll()?;
        }
        context.set_dataflows(dataflows);
        Ok(())
    }

    fn dataflow_analysis_of_function(
        &self,
        context: &Context,
        function: &Function,
        dataflows: &mut HashMap<FunId, Dataflow>,
    ) -> Result<()> {
        context.log(&format!("Dataflow analysis of {}.", function.name));

        let dataflow = DataflowAnalyzer::new(
            context.program(),
            context.module().architecture(),
            function,
            context.hooks(),
        )
        .analyze(context.cancellation())?;

        dataflows.insert(function.id, dataflow);
        Ok(())
    }

    fn reconstruct_signatures(&self, context: &mut Context) -> Result<()> {
        context.log("Reconstructing function signatures.");

        SignatureAnalyzer::new(
            context.signatures().as_ref(),
            context.functions(),
            context.dataflows(),
            context.hooks(),
        )
        .analyze(context.cancellation())
    }

    fn reconstruct_variables(&self, context: &mut Context) -> Result<()> {
        context.log("Reconstructing variables.");

        let variables =
            VariableAnalyzer::new(context.program(), context.functions(), context.dataflows())
                .analyze();

        context.set_variables(variables);
        Ok(())
    }

    fn structural_analysis(&self, context: &mut Context) -> Result<()> {
        context.log("Structural analysis.");

        let mut graphs = HashMap::new();
        for function in context.functions().list() {
            context.log(&format!("Structural analysis of {}.", function.name));

            let dataflow = &context.dataflows()[&function.id];
            let mut graph = GraphBuilder::new().build(function);
            StructureAnalyzer::new(context.program(), function, dataflow).analyze(&mut graph);

            graphs.insert(function.id, graph);
            context.cancellation().poll()?;
        }
        context.set_graphs(graphs);
        Ok(())
    }

    fn liveness_analysis(&self, context: &mut Context) -> Result<()> {
        context.log("Liveness analysis.");

        let signatures = context.signatures().clone();
        let signatures = signatures.borrow();

        let mut livenesses = HashMap::new();
        for function in context.functions().list() {
            context.log(&format!("Liveness analysis of {}.", function.name));

            let liveness = LivenessAnalyzer::new(
                context.program(),
                function,
                &context.dataflows()[&function.id],
                context.module().architecture(),
                &context.graphs()[&function.id],
                context.hooks(),
                &signatures,
            )
            .analyze();

            livenesses.insert(function.id, liveness);
            context.cancellation().poll()?;
        }

        drop(signatures);
        context.set_livenesses(livenesses);
        Ok(())
    }

    fn reconstruct_types(&self, context: &mut Context) -> Result<()> {
        context.log("Reconstructing types.");

        let types = TypeAnalyzer::new(context.program(), context.variables(), context.livenesses())
            .analyze(context.cancellation())?;

        context.set_types(types);
        Ok(())
    }

    fn generate_tree(&self, context: &mut Context) -> Result<()> {
        context.log("Generating AST.");

        let signatures = context.signatures().clone();
        let signatures = signatures.borrow();

        let tree = CodeGenerator::new(
            context.program(),
            context.module().architecture(),
            context.functions(),
            context.hooks(),
            &signatures,
            context.dataflows(),
            context.variables(),
            context.livenesses(),
            context.types(),
        )
        .make_compilation_unit(context.cancellation())?;

        drop(signatures);
        context.set_tree(tree);
        Ok(())
    }

    /// ASTのIR参照が全関数の調査結果に含まれるか検証する
    #[cfg(feature = "tree-checks")]
    fn check_tree(&self, context: &Context) -> Result<()> {
        use std::collections::HashSet;

        use crate::census::census_function;
        use crate::ir::{StmtId, TermId};

        context.log("Checking AST.");

        let mut statements: HashSet<StmtId> = HashSet::new();
        let mut terms: HashSet<TermId> = HashSet::new();
        for function in context.functions().list() {
            let census = census_function(context.program(), function, Some(context.hooks()));
            statements.extend(census.statements().iter().copied());
            terms.extend(census.terms().iter().copied());
        }

        for function in &context.tree().root.functions {
            for statement in &function.body {
                if let Some(ir) = statement.statement {
                    assert!(statements.contains(&ir), "AST references unknown statement {}", ir);
                }
                statement.walk_expressions(&mut |expression| {
                    if let Some(term) = expression.term {
                        assert!(terms.contains(&term), "AST references unknown term {}", term);
                    }
                });
            }
        }

        Ok(())
    }

    fn compute_term_to_function_mapping(&self, context: &mut Context) -> Result<()> {
        context.log("Computing term to function mapping.");

        let map = TermToFunction::compute(context.program(), context.functions(), context.hooks());
        context.set_term_to_function(map);
        Ok(())
    }

    /// 全フェーズを順に実行する
    fn decompile(&self, context: &mut Context) -> Result<()> {
        context.log("Decompiling.");

        self.create_program(context)?;
        context.cancellation().poll()?;

        self.create_functions(context)?;
        context.cancellation().poll()?;

        self.dataflow_analysis(context)?;
        context.cancellation().poll()?;

        self.reconstruct_signatures(context)?;
        context.cancellation().poll()?;

        self.dataflow_analysis(context)?;
        context.cancellation().poll()?;

        self.reconstruct_variables(context)?;
        context.cancellation().poll()?;

        self.structural_analysis(context)?;
        context.cancellation().poll()?;

        self.liveness_analysis(context)?;
        context.cancellation().poll()?;

        self.reconstruct_types(context)?;
        context.cancellation().poll()?;

        self.generate_tree(context)?;
        context.cancellation().poll()?;

        #[cfg(feature = "tree-checks")]
        {
            self.check_tree(context)?;
            context.cancellation().poll()?;
        }

        self.compute_term_to_function_mapping(context)?;
        context.cancellation().poll()?;

        context.log("Decompilation completed.");
        Ok(())
    }
}

/// 実行内で安定な関数の一意スタンプ
///
/// 所属ブロックID列のxxh3。同じ入力に対して実行をまたいでも変わらない
fn function_identity(function: &Function) -> u64 {
    let mut hasher = Xxh3::new();
    for block in &function.blocks {
        hasher.update(&block.0.to_le_bytes());
    }
    hasher.digest()
}

/// 既定の制御器（規約検出は何もしない）
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMasterAnalyzer;

impl DefaultMasterAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

impl MasterAnalyzer for DefaultMasterAnalyzer {}

/// x86-64向けの制御器
///
/// 未知の呼び出し先にSystem Vの既定規約を仮定する
#[derive(Debug, Clone, Copy, Default)]
pub struct X64MasterAnalyzer;

impl X64MasterAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

impl MasterAnalyzer for X64MasterAnalyzer {
    fn convention_detector(&self, module: &Module) -> ConventionDetector {
        let convention = module.architecture().default_convention();
        Box::new(move |callee, conventions| {
            conventions.insert(*callee, convention.clone());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{reg, X64Architecture};
    use crate::context::PipelineError;
    use crate::insn::{Instruction, Instructions, Operand, Operation};
    use crate::ir::Program;
    use crate::mangling::Demangler;

    struct FakeDemangler;

    impl Demangler for FakeDemangler {
        fn demangle(&self, name: &str) -> String {
            if name == "_Z3fooi" {
                "foo(int)".to_string()
            } else {
                name.to_string()
            }
        }
    }

    fn context_with_program(program: Program, module: Module) -> Context {
        let mut context = Context::new();
        context.set_module(module);
        context.set_instructions(Instructions::new());
        context.set_program(program);
        context
    }

    #[test]
    fn test_function_named_from_symbol() {
        let mut program = Program::new();
        let entry = program.add_block(Some(0x401000));
        program.push_return(entry, Some(0x401000));

        let mut module = Module::new(Box::new(X64Architecture::new()));
        module.add_symbol(0x401000, "_Z3fooi");
        module.set_demangler(Box::new(FakeDemangler));

        let mut context = context_with_program(program, module);
        DefaultMasterAnalyzer::new().create_functions(&mut context).unwrap();

        let function = &context.functions().list()[0];
        assert_eq!(function.name, "_Z3fooi");
        assert!(function.comment.contains("foo(int)"));
    }

    #[test]
    fn test_function_named_from_address() {
        let mut program = Program::new();
        let entry = program.add_block(Some(0x401000));
        program.push_return(entry, Some(0x401000));

        let module = Module::new(Box::new(X64Architecture::new()));

        let mut context = context_with_program(program, module);
        DefaultMasterAnalyzer::new().create_functions(&mut context).unwrap();

        assert_eq!(context.functions().list()[0].name, "func_401000");
    }

    #[test]
    fn test_function_without_entry_address() {
        let mut program = Program::new();
        let entry = program.add_block(None);
        program.push_return(entry, None);

        let module = Module::new(Box::new(X64Architecture::new()));

        let mut context = context_with_program(program, module);
        DefaultMasterAnalyzer::new().create_functions(&mut context).unwrap();

        let name = &context.functions().list()[0].name;
        let stamp = name.strip_prefix("func_noentry_").expect("unexpected name");
        assert!(!stamp.is_empty());
        assert!(stamp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_unclean_symbol_lands_in_comment() {
        let mut program = Program::new();
        let entry = program.add_block(Some(0x401000));
        program.push_return(entry, Some(0x401000));

        let mut module = Module::new(Box::new(X64Architecture::new()));
        module.add_symbol(0x401000, "name.with.dots");

        let mut context = context_with_program(program, module);
        DefaultMasterAnalyzer::new().create_functions(&mut context).unwrap();

        let function = &context.functions().list()[0];
        assert_eq!(function.name, "name_with_dots");
        assert!(function.comment.contains("name.with.dots"));
    }

    /// グローバル格納ひとつの小さなプログラムを組み立てる
    fn store_program() -> Instructions {
        let mut instructions = Instructions::new();
        // mov qword ptr [0x404000], 7
        instructions.push(Instruction {
            address: 0x1000,
            size: 12,
            operation: Operation::Mov {
                dst: Operand::Mem {
                    base: None,
                    index: None,
                    scale: 1,
                    disp: 0x404000,
                    size: 8,
                },
                src: Operand::Imm { value: 7, size: 8 },
            },
        });
        instructions.push(Instruction { address: 0x100c, size: 1, operation: Operation::Ret });
        instructions
    }

    #[test]
    fn test_full_pipeline_populates_all_artifacts() {
        let mut context = Context::new();
        context.set_module(Module::new(Box::new(X64Architecture::new())));
        context.set_instructions(store_program());

        X64MasterAnalyzer::new().decompile(&mut context).unwrap();

        // 全関数にデータフロー・グラフ・生存集合が揃う
        for function in context.functions().list() {
            assert!(context.dataflows().contains_key(&function.id));
            assert!(context.graphs().contains_key(&function.id));
            assert!(context.livenesses().contains_key(&function.id));
        }

        assert_eq!(context.tree().root.functions.len(), context.functions().len());
        assert!(!context.term_to_function().is_empty());

        // グローバル格納はASTに残る
        let output = format!("{}", context.tree());
        assert!(output.contains("0x404000"), "output was: {}", output);
    }

    #[test]
    fn test_cancellation_aborts_pipeline() {
        let mut context = Context::new();
        context.set_module(Module::new(Box::new(X64Architecture::new())));
        context.set_instructions(store_program());

        context.cancellation().cancel();

        let error = X64MasterAnalyzer::new().decompile(&mut context).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<PipelineError>(),
            Some(PipelineError::Cancelled)
        ));
    }

    #[test]
    fn test_call_with_signature_keeps_arguments_live() {
        // callee(0x2000)はrdiを読んでraxへ: シグネチャ復元後、
        // caller(0x1000)の引数設定が生存になる
        let mut instructions = Instructions::new();
        // caller: mov rdi, 5; call 0x2000; ret
        instructions.push(Instruction {
            address: 0x1000,
            size: 7,
            operation: Operation::Mov {
                dst: Operand::Reg { offset: reg::RDI, size: 8 },
                src: Operand::Imm { value: 5, size: 8 },
            },
        });
        instructions.push(Instruction {
            address: 0x1007,
            size: 5,
            operation: Operation::Call { target: Operand::Imm { value: 0x2000, size: 8 } },
        });
        instructions.push(Instruction { address: 0x100c, size: 1, operation: Operation::Ret });
        // callee: mov rax, rdi; ret
        instructions.push(Instruction {
            address: 0x2000,
            size: 3,
            operation: Operation::Mov {
                dst: Operand::Reg { offset: reg::RAX, size: 8 },
                src: Operand::Reg { offset: reg::RDI, size: 8 },
            },
        });
        instructions.push(Instruction { address: 0x2003, size: 1, operation: Operation::Ret });

        let mut context = Context::new();
        context.set_module(Module::new(Box::new(X64Architecture::new())));
        context.set_instructions(instructions);

        X64MasterAnalyzer::new().decompile(&mut context).unwrap();

        assert_eq!(context.functions().len(), 2);

        // 呼び出し側でrdiへの代入が生き残っている
        let caller = context
            .functions()
            .list()
            .iter()
            .find(|f| f.entry_address(context.program()) == Some(0x1000))
            .unwrap();
        let liveness = &context.livenesses()[&caller.id];
        assert!(!liveness.is_empty());

        let output = format!("{}", context.tree());
        assert!(output.contains("func_2000"), "output was: {}", output);
    }
}
