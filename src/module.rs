use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, Result};
use goblin::Object;

use crate::arch::{Architecture, X64Architecture};
use crate::mangling::{Demangler, NullDemangler};

/// セクション情報
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    /// 仮想アドレス
    pub address: u64,
    pub size: u64,
    /// ファイルオフセット
    pub offset: usize,
    pub executable: bool,
}

/// ロード済みバイナリモジュール
///
/// セクション・シンボル・デマングラ・アーキテクチャ情報をまとめて保持する。
/// ELF/PEはgoblinで解析する。テストや段階実行用に空のモジュールも作れる
pub struct Module {
    name: String,
    architecture: Box<dyn Architecture>,
    demangler: Box<dyn Demangler>,
    /// 仮想アドレス → シンボル名
    symbols: HashMap<u64, String>,
    sections: Vec<Section>,
    data: Vec<u8>,
    entry: Option<u64>,
}

impl Module {
    /// 合成モジュールを作成（バイナリなし）
    pub fn new(architecture: Box<dyn Architecture>) -> Self {
        Self {
            name: String::new(),
            architecture,
            demangler: Box::new(NullDemangler),
            symbols: HashMap::new(),
            sections: Vec::new(),
            data: Vec::new(),
            entry: None,
        }
    }

    /// ファイルからモジュールをロード
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let mut module = Self::new(Box::new(X64Architecture::new()));
        module.name = path
            .as_ref()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match Object::parse(&data)? {
            Object::Elf(elf) => {
                module.entry = Some(elf.entry);

                for sym in elf.syms.iter() {
                    if sym.is_function() && sym.st_value != 0 {
                        if let Some(name) = elf.strtab.get_at(sym.st_name) {
                            if !name.is_empty() {
                                module.symbols.insert(sym.st_value, name.to_string());
                            }
                        }
                    }
                }

                for sh in &elf.section_headers {
                    let name = elf
                        .shdr_strtab
                        .get_at(sh.sh_name)
                        .unwrap_or("")
                        .to_string();
                    let executable =
                        sh.sh_flags & goblin::elf::section_header::SHF_EXECINSTR as u64 != 0;
                    module.sections.push(Section {
                        name,
                        address: sh.sh_addr,
                        size: sh.sh_size,
                        offset: sh.sh_offset as usize,
                        executable,
                    });
                }
            }
            Object::PE(pe) => {
                let image_base = pe.image_base as u64;
                module.entry = Some(image_base + pe.entry as u64);

                for export in &pe.exports {
                    if let Some(name) = export.name {
                        module
                            .symbols
                            .insert(image_base + export.rva as u64, name.to_string());
                    }
                }

                const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
                for section in &pe.sections {
                    let name = section.name().unwrap_or("").to_string();
                    module.sections.push(Section {
                        name,
                        address: image_base + section.virtual_address as u64,
                        size: section.size_of_raw_data as u64,
                        offset: section.pointer_to_raw_data as usize,
                        executable: section.characteristics & IMAGE_SCN_MEM_EXECUTE != 0,
                    });
                }
            }
            _ => return Err(anyhow!("unsupported binary format")),
        }

        module.data = data;
        Ok(module)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// アドレスのシンボル名（なければNone）
    pub fn get_name(&self, address: u64) -> Option<&str> {
        self.symbols.get(&address).map(|s| s.as_str())
    }

    pub fn add_symbol(&mut self, address: u64, name: &str) {
        self.symbols.insert(address, name.to_string());
    }

    pub fn symbol_addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.symbols.keys().copied()
    }

    pub fn architecture(&self) -> &dyn Architecture {
        self.architecture.as_ref()
    }

    pub fn demangler(&self) -> &dyn Demangler {
        self.demangler.as_ref()
    }

    pub fn set_demangler(&mut self, demangler: Box<dyn Demangler>) {
        self.demangler = demangler;
    }

    pub fn entry(&self) -> Option<u64> {
        self.entry
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// 実行可能セクションのうち最初のもの（通常.text）
    pub fn text_section(&self) -> Option<&Section> {
        self.sections
            .iter()
            .find(|s| s.executable && s.size > 0)
    }

    /// セクションのバイト列
    pub fn section_bytes(&self, section: &Section) -> &[u8] {
        let start = section.offset.min(self.data.len());
        let end = (section.offset + section.size as usize).min(self.data.len());
        &self.data[start..end]
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("symbols", &self.symbols.len())
            .field("sections", &self.sections.len())
            .field("entry", &self.entry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_module_symbols() {
        let mut module = Module::new(Box::new(X64Architecture::new()));
        module.add_symbol(0x401000, "_Z3fooi");

        assert_eq!(module.get_name(0x401000), Some("_Z3fooi"));
        assert_eq!(module.get_name(0x402000), None);
        assert_eq!(module.demangler().demangle("_Z3fooi"), "_Z3fooi");
    }
}
