use anyhow::{anyhow, Result};
use tracing::{error, info};

use fukugen::decoder::InstructionDecoder;
use fukugen::{Context, MasterAnalyzer, Module, X64MasterAnalyzer};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: fukugen <binary> [max-instructions]");
        std::process::exit(2);
    }
    let path = &args[1];
    let max_instructions: usize = args
        .get(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(100_000);

    info!("Loading module: {}", path);
    let module = Module::load(path)?;

    let text = module
        .text_section()
        .ok_or_else(|| anyhow!("no executable section found"))?
        .clone();
    info!("Decoding {} ({:#x}, {} bytes)", text.name, text.address, text.size);

    let decoder = InstructionDecoder::new()?;
    let instructions =
        decoder.decode(module.section_bytes(&text), text.address, max_instructions)?;
    info!("Decoded {} instructions", instructions.len());

    let mut context = Context::new();
    context.set_module(module);
    context.set_instructions(instructions);

    match X64MasterAnalyzer::new().decompile(&mut context) {
        Ok(()) => {
            info!("Decompiled {} functions", context.functions().len());
            println!("{}", context.tree());
            Ok(())
        }
        Err(e) => {
            error!("Decompilation failed: {:#}", e);
            std::process::exit(1);
        }
    }
}
