use std::collections::HashMap;

use anyhow::Result;

use crate::arch::Architecture;
use crate::calling::{Hooks, Signatures};
use crate::census::census_function;
use crate::context::CancellationToken;
use crate::dataflow::Dataflow;
use crate::ir::{
    BinaryOp, FunId, Function, Functions, MemoryDomain, Program, StatementKind, StmtId, TermId,
    TermKind, UnaryOp,
};
use crate::liveness::Liveness;
use crate::types::Types;
use crate::variables::{Variable, Variables};

/// 生成された抽象構文木
#[derive(Debug, Default)]
pub struct Tree {
    pub root: CompilationUnit,
}

impl Tree {
    /// シンボル名をC識別子に正規化する
    ///
    /// 識別子に使えない文字は'_'に置き換え、数字で始まる名前には'_'を前置する
    pub fn clean_name(name: &str) -> String {
        let mut cleaned: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        if cleaned.is_empty() {
            cleaned.push('_');
        }
        if cleaned.chars().next().unwrap().is_ascii_digit() {
            cleaned.insert(0, '_');
        }
        cleaned
    }
}

/// 翻訳単位
#[derive(Debug, Default)]
pub struct CompilationUnit {
    pub functions: Vec<FunctionDefinition>,
}

/// 関数定義
#[derive(Debug)]
pub struct FunctionDefinition {
    pub name: String,
    pub comment: String,
    pub return_type: String,
    /// (型, 名前)
    pub parameters: Vec<(String, String)>,
    /// (型, 名前)
    pub declarations: Vec<(String, String)>,
    pub body: Vec<AstStatement>,
    pub function: FunId,
}

/// goto先
#[derive(Debug)]
pub enum GotoTarget {
    Label(String),
    Indirect(AstExpression),
}

/// AST文
#[derive(Debug)]
pub struct AstStatement {
    pub kind: AstStatementKind,
    /// 由来するIR文
    pub statement: Option<StmtId>,
}

#[derive(Debug)]
pub enum AstStatementKind {
    Label(String),
    Expression(AstExpression),
    /// conditionがNoneなら無条件goto
    Goto { condition: Option<AstExpression>, target: GotoTarget },
    Return(Option<AstExpression>),
    Comment(String),
    InlineAsm(String),
}

/// AST式
#[derive(Debug)]
pub struct AstExpression {
    pub kind: AstExpressionKind,
    /// 由来するIR項
    pub term: Option<TermId>,
}

#[derive(Debug)]
pub enum AstExpressionKind {
    Constant(u64),
    Identifier(String),
    Unary { op: UnaryOp, operand: Box<AstExpression> },
    Binary { op: BinaryOp, left: Box<AstExpression>, right: Box<AstExpression> },
    Dereference(Box<AstExpression>),
    Assignment { left: Box<AstExpression>, right: Box<AstExpression> },
    Call { target: Box<AstExpression>, arguments: Vec<AstExpression> },
}

impl AstStatement {
    /// 文に含まれる式を巡回する
    pub fn walk_expressions(&self, visit: &mut impl FnMut(&AstExpression)) {
        match &self.kind {
            AstStatementKind::Expression(expr) => expr.walk(visit),
            AstStatementKind::Goto { condition, target } => {
                if let Some(condition) = condition {
                    condition.walk(visit);
                }
                if let GotoTarget::Indirect(target) = target {
                    target.walk(visit);
                }
            }
            AstStatementKind::Return(Some(expr)) => expr.walk(visit),
            _ => {}
        }
    }
}

impl AstExpression {
    pub fn walk(&self, visit: &mut impl FnMut(&AstExpression)) {
        visit(self);
        match &self.kind {
            AstExpressionKind::Unary { operand, .. } => operand.walk(visit),
            AstExpressionKind::Binary { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            }
            AstExpressionKind::Dereference(inner) => inner.walk(visit),
            AstExpressionKind::Assignment { left, right } => {
                left.walk(visit);
                right.walk(visit);
            }
            AstExpressionKind::Call { target, arguments } => {
                target.walk(visit);
                for argument in arguments {
                    argument.walk(visit);
                }
            }
            _ => {}
        }
    }
}

/// コード生成
///
/// 構造化の結果と生存集合からASTを作る。書き込み先が生きていない代入は
/// 出力されない（生存性による不要コード削除）
pub struct CodeGenerator<'a> {
    program: &'a Program,
    architecture: &'a dyn Architecture,
    functions: &'a Functions,
    hooks: &'a Hooks,
    signatures: &'a Signatures,
    dataflows: &'a HashMap<FunId, Dataflow>,
    variables: &'a Variables,
    livenesses: &'a HashMap<FunId, Liveness>,
    types: &'a Types,
}

impl<'a> CodeGenerator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        program: &'a Program,
        architecture: &'a dyn Architecture,
        functions: &'a Functions,
        hooks: &'a Hooks,
        signatures: &'a Signatures,
        dataflows: &'a HashMap<FunId, Dataflow>,
        variables: &'a Variables,
        livenesses: &'a HashMap<FunId, Liveness>,
        types: &'a Types,
    ) -> Self {
        Self {
            program,
            architecture,
            functions,
            hooks,
            signatures,
            dataflows,
            variables,
            livenesses,
            types,
        }
    }

    pub fn make_compilation_unit(self, cancellation: &CancellationToken) -> Result<Tree> {
        let mut tree = Tree::default();

        for function in self.functions.list() {
            cancellation.poll()?;
            tree.root.functions.push(self.make_function(function));
        }

        Ok(tree)
    }

    fn make_function(&self, function: &Function) -> FunctionDefinition {
        let empty = Liveness::new();
        let liveness = self.livenesses.get(&function.id).unwrap_or(&empty);
        let dataflow = self.dataflows.get(&function.id);

        let signature = self
            .hooks
            .get_function_callee_id(function)
            .and_then(|callee| self.signatures.get(&callee).cloned())
            .unwrap_or_default();

        let return_type = match signature.return_value {
            Some(location) => crate::types::Type::int_from_size(location.size, false).to_c_string(),
            None => "void".to_string(),
        };

        let parameters: Vec<(String, String)> = signature
            .arguments
            .iter()
            .enumerate()
            .map(|(index, location)| {
                let ty = crate::types::Type::int_from_size(location.size, false).to_c_string();
                (ty, format!("a{}", index + 1))
            })
            .collect();

        // 生きている項が属する変数を宣言する
        let mut declared: Vec<usize> = Vec::new();
        let mut declarations: Vec<(String, String)> = Vec::new();
        let census = census_function(self.program, function, Some(self.hooks));
        for &term in census.terms() {
            if !liveness.is_live(term) {
                continue;
            }
            if let Some(variable) = self.variables.variable_of(term) {
                if declared.contains(&variable.index) {
                    continue;
                }
                if let Some(location) = variable.location {
                    if location.domain == MemoryDomain::Global {
                        continue;
                    }
                }
                declared.push(variable.index);
                declarations.push((
                    self.types.type_of(variable.index).to_c_string(),
                    self.variable_name(variable),
                ));
            }
        }
        declarations.sort();

        let mut body = Vec::new();
        for &block in &function.blocks {
            body.push(AstStatement {
                kind: AstStatementKind::Label(self.block_label(block)),
                statement: None,
            });
            for &stmt in &self.program.block(block).statements {
                self.make_statement(function, stmt, liveness, dataflow, &mut body);
            }
        }

        FunctionDefinition {
            name: function.name.clone(),
            comment: function.comment.clone(),
            return_type,
            parameters,
            declarations,
            body,
            function: function.id,
        }
    }

    fn make_statement(
        &self,
        function: &Function,
        stmt: StmtId,
        liveness: &Liveness,
        dataflow: Option<&Dataflow>,
        out: &mut Vec<AstStatement>,
    ) {
        match &self.program.statement(stmt).kind {
            StatementKind::Comment { text } => {
                out.push(AstStatement {
                    kind: AstStatementKind::Comment(text.clone()),
                    statement: Some(stmt),
                });
            }

            StatementKind::InlineAssembly { text } => {
                out.push(AstStatement {
                    kind: AstStatementKind::InlineAsm(text.clone()),
                    statement: Some(stmt),
                });
            }

            StatementKind::Assignment { left, right } => {
                // 書き込み先が死んでいる代入は落とす
                if !liveness.is_live(*left) {
                    return;
                }
                let expression = AstExpression {
                    kind: AstExpressionKind::Assignment {
                        left: Box::new(self.make_expression(*left, dataflow)),
                        right: Box::new(self.make_expression(*right, dataflow)),
                    },
                    term: None,
                };
                out.push(AstStatement {
                    kind: AstStatementKind::Expression(expression),
                    statement: Some(stmt),
                });
            }

            StatementKind::Kill { .. } => {}

            StatementKind::Jump(jump) => {
                // 条件が生きていない条件付きジャンプは構造に吸収済み
                if let Some(condition) = jump.condition {
                    if !liveness.is_live(condition) {
                        return;
                    }
                }

                let then_target = match jump.then_target.block {
                    Some(block) => GotoTarget::Label(self.block_label(block)),
                    None => match jump.then_target.address {
                        Some(address) => {
                            GotoTarget::Indirect(self.make_expression(address, dataflow))
                        }
                        None => return,
                    },
                };

                out.push(AstStatement {
                    kind: AstStatementKind::Goto {
                        condition: jump.condition.map(|c| self.make_expression(c, dataflow)),
                        target: then_target,
                    },
                    statement: Some(stmt),
                });

                if jump.condition.is_some() {
                    if let Some(else_target) = &jump.else_target {
                        let target = match else_target.block {
                            Some(block) => GotoTarget::Label(self.block_label(block)),
                            None => match else_target.address {
                                Some(address) => {
                                    GotoTarget::Indirect(self.make_expression(address, dataflow))
                                }
                                None => return,
                            },
                        };
                        out.push(AstStatement {
                            kind: AstStatementKind::Goto { condition: None, target },
                            statement: Some(stmt),
                        });
                    }
                }
            }

            StatementKind::Call { target } => {
                let arguments = match (
                    self.hooks.get_callee_id(stmt),
                    self.hooks.get_call_hook(stmt),
                ) {
                    (Some(callee), Some(hook)) => match self.signatures.get(&callee) {
                        Some(signature) => signature
                            .arguments
                            .iter()
                            .filter_map(|location| hook.argument_term(location))
                            .map(|term| self.make_expression(term, dataflow))
                            .collect(),
                        None => Vec::new(),
                    },
                    _ => Vec::new(),
                };

                let target_expression = match self.program.term(*target).as_int_const() {
                    Some(address) => {
                        // 既知アドレスは関数名で呼ぶ
                        let name = self
                            .functions
                            .list()
                            .iter()
                            .find(|f| f.entry_address(self.program) == Some(address))
                            .map(|f| f.name.clone())
                            .unwrap_or_else(|| format!("func_{:x}", address));
                        AstExpression {
                            kind: AstExpressionKind::Identifier(name),
                            term: Some(*target),
                        }
                    }
                    None => self.make_expression(*target, dataflow),
                };

                out.push(AstStatement {
                    kind: AstStatementKind::Expression(AstExpression {
                        kind: AstExpressionKind::Call {
                            target: Box::new(target_expression),
                            arguments,
                        },
                        term: None,
                    }),
                    statement: Some(stmt),
                });
            }

            StatementKind::Return => {
                let value = self
                    .hooks
                    .get_function_callee_id(function)
                    .and_then(|callee| self.signatures.get(&callee).cloned())
                    .and_then(|signature| signature.return_value)
                    .and_then(|location| {
                        self.hooks
                            .get_return_hook(function, stmt)
                            .and_then(|hook| hook.return_value_term(&location))
                    })
                    .map(|term| self.make_expression(term, dataflow));

                out.push(AstStatement {
                    kind: AstStatementKind::Return(value),
                    statement: Some(stmt),
                });
            }
        }
    }

    fn make_expression(&self, term: TermId, dataflow: Option<&Dataflow>) -> AstExpression {
        let kind = match &self.program.term(term).kind {
            TermKind::IntConst { value } => AstExpressionKind::Constant(*value),
            TermKind::Intrinsic { name } => AstExpressionKind::Identifier(name.clone()),
            TermKind::Undefined => AstExpressionKind::Identifier("__undefined".to_string()),

            TermKind::MemoryLocationAccess { .. } => {
                AstExpressionKind::Identifier(self.term_name(term))
            }

            TermKind::Dereference { address } => {
                // 変数に解決された間接アクセスは名前で参照する
                if self.variables.variable_of(term).is_some()
                    && dataflow.and_then(|d| d.memory_location(term)).is_some()
                {
                    AstExpressionKind::Identifier(self.term_name(term))
                } else {
                    AstExpressionKind::Dereference(Box::new(
                        self.make_expression(*address, dataflow),
                    ))
                }
            }

            TermKind::UnaryOperator { op, operand } => AstExpressionKind::Unary {
                op: *op,
                operand: Box::new(self.make_expression(*operand, dataflow)),
            },

            TermKind::BinaryOperator { op, left, right } => AstExpressionKind::Binary {
                op: *op,
                left: Box::new(self.make_expression(*left, dataflow)),
                right: Box::new(self.make_expression(*right, dataflow)),
            },

            TermKind::Choice { preferred, default } => {
                let chosen = match dataflow {
                    Some(dataflow) if !dataflow.definitions(*preferred).is_empty() => *preferred,
                    _ => *default,
                };
                return AstExpression {
                    kind: self.make_expression(chosen, dataflow).kind,
                    term: Some(term),
                };
            }
        };

        AstExpression { kind, term: Some(term) }
    }

    /// 項の表示名（変数があれば変数名）
    fn term_name(&self, term: TermId) -> String {
        if let Some(variable) = self.variables.variable_of(term) {
            return self.variable_name(variable);
        }
        match &self.program.term(term).kind {
            TermKind::MemoryLocationAccess { location } => self
                .architecture
                .register_name(location)
                .unwrap_or_else(|| format!("loc_{:x}", location.offset)),
            _ => format!("t{}", term.0),
        }
    }

    fn variable_name(&self, variable: &Variable) -> String {
        match variable.location {
            Some(location) => match location.domain {
                MemoryDomain::Register => self
                    .architecture
                    .register_name(&location)
                    .unwrap_or_else(|| format!("r{:x}", location.offset)),
                MemoryDomain::Stack => {
                    if location.offset < 0 {
                        format!("var_{:x}", -location.offset)
                    } else {
                        format!("arg_{:x}", location.offset)
                    }
                }
                MemoryDomain::Global => format!("g_{:x}", location.offset),
                MemoryDomain::Temporary => format!("tmp_{:x}", location.offset),
            },
            None => format!("v{}", variable.index),
        }
    }

    fn block_label(&self, block: crate::ir::BlockId) -> String {
        match self.program.block(block).address {
            Some(address) => format!("label_{:x}", address),
            None => format!("block_{}", block.0),
        }
    }
}

// ===== C疑似コードの出力 =====

fn binary_op_str(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::UnsignedDiv | BinaryOp::SignedDiv => "/",
        BinaryOp::UnsignedRem | BinaryOp::SignedRem => "%",
        BinaryOp::And => "&",
        BinaryOp::Or => "|",
        BinaryOp::Xor => "^",
        BinaryOp::Shl => "<<",
        BinaryOp::Shr | BinaryOp::Sar => ">>",
        BinaryOp::Equal => "==",
        BinaryOp::NotEqual => "!=",
        BinaryOp::SignedLess | BinaryOp::UnsignedLess => "<",
        BinaryOp::SignedLessOrEqual | BinaryOp::UnsignedLessOrEqual => "<=",
    }
}

impl std::fmt::Display for AstExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            AstExpressionKind::Constant(value) => {
                if *value < 10 {
                    write!(f, "{}", value)
                } else {
                    write!(f, "{:#x}", value)
                }
            }
            AstExpressionKind::Identifier(name) => write!(f, "{}", name),
            AstExpressionKind::Unary { op, operand } => {
                let symbol = match op {
                    UnaryOp::Not => "!",
                    UnaryOp::Negate => "-",
                    UnaryOp::SignExtend | UnaryOp::ZeroExtend | UnaryOp::Truncate => "",
                };
                write!(f, "{}({})", symbol, operand)
            }
            AstExpressionKind::Binary { op, left, right } => {
                write!(f, "({} {} {})", left, binary_op_str(*op), right)
            }
            AstExpressionKind::Dereference(inner) => write!(f, "*({})", inner),
            AstExpressionKind::Assignment { left, right } => write!(f, "{} = {}", left, right),
            AstExpressionKind::Call { target, arguments } => {
                write!(f, "{}(", target)?;
                for (i, argument) in arguments.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", argument)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl std::fmt::Display for AstStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            AstStatementKind::Label(name) => write!(f, "{}:", name),
            AstStatementKind::Expression(expr) => write!(f, "    {};", expr),
            AstStatementKind::Goto { condition, target } => {
                write!(f, "    ")?;
                if let Some(condition) = condition {
                    write!(f, "if ({}) ", condition)?;
                }
                match target {
                    GotoTarget::Label(label) => write!(f, "goto {};", label),
                    GotoTarget::Indirect(expr) => write!(f, "goto *({});", expr),
                }
            }
            AstStatementKind::Return(None) => write!(f, "    return;"),
            AstStatementKind::Return(Some(expr)) => write!(f, "    return {};", expr),
            AstStatementKind::Comment(text) => write!(f, "    /* {} */", text),
            AstStatementKind::InlineAsm(text) => write!(f, "    __asm__(\"{}\");", text),
        }
    }
}

impl std::fmt::Display for FunctionDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.comment.is_empty() {
            for line in self.comment.lines() {
                writeln!(f, "/* {} */", line)?;
            }
        }

        write!(f, "{} {}(", self.return_type, self.name)?;
        for (i, (ty, name)) in self.parameters.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} {}", ty, name)?;
        }
        writeln!(f, ") {{")?;

        for (ty, name) in &self.declarations {
            writeln!(f, "    {} {};", ty, name)?;
        }
        if !self.declarations.is_empty() {
            writeln!(f)?;
        }

        for statement in &self.body {
            writeln!(f, "{}", statement)?;
        }

        writeln!(f, "}}")
    }
}

impl std::fmt::Display for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, function) in self.root.functions.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", function)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_name() {
        assert_eq!(Tree::clean_name("_Z3fooi"), "_Z3fooi");
        assert_eq!(Tree::clean_name("operator=="), "operator__");
        assert_eq!(Tree::clean_name("3start"), "_3start");
        assert_eq!(Tree::clean_name(""), "_");
        assert_eq!(Tree::clean_name("name.with.dots"), "name_with_dots");
    }

    #[test]
    fn test_expression_display() {
        let expr = AstExpression {
            kind: AstExpressionKind::Binary {
                op: BinaryOp::Add,
                left: Box::new(AstExpression {
                    kind: AstExpressionKind::Identifier("rax".to_string()),
                    term: None,
                }),
                right: Box::new(AstExpression {
                    kind: AstExpressionKind::Constant(16),
                    term: None,
                }),
            },
            term: None,
        };
        assert_eq!(format!("{}", expr), "(rax + 0x10)");
    }
}
