/// ネイティブコードをC疑似コードへ復元するデコンパイラコア
///
/// バイナリのロードから、IRリフト・関数分割・データフロー・シグネチャ復元・
/// 構造解析・生存性解析・型付け・AST生成までのパイプラインを提供する
pub mod arch;
pub mod calling;
pub mod census;
pub mod cflow;
pub mod codegen;
pub mod context;
pub mod dataflow;
pub mod decoder;
pub mod funcgen;
pub mod insn;
pub mod ir;
pub mod irgen;
pub mod liveness;
pub mod mangling;
pub mod master;
pub mod module;
pub mod sigrec;
pub mod types;
pub mod variables;

pub use context::{CancellationToken, Context, LogSink, NullSink, PipelineError, TracingSink};
pub use master::{DefaultMasterAnalyzer, MasterAnalyzer, X64MasterAnalyzer};
pub use module::Module;
