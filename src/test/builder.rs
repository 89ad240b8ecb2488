use goblin::elf::{
    header::EM_X86_64,
    section_header::{SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHT_NOBITS, SHT_PROGBITS, SHT_STRTAB, SHT_SYMTAB},
    sym::{STV_DEFAULT, STV_HIDDEN},
};

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;

// STB_GLOBAL << 4 | STT_OBJECT
const GLOBAL_OBJECT: u8 = 0x11;

pub struct SymbolSpec {
    name: String,
    other: u8,
    size: u64,
}

impl SymbolSpec {
    pub fn hidden(name: &str, size: u64) -> SymbolSpec {
        SymbolSpec {
            name: name.to_string(),
            other: STV_HIDDEN,
            size,
        }
    }

    pub fn global(name: &str, size: u64) -> SymbolSpec {
        SymbolSpec {
            name: name.to_string(),
            other: STV_DEFAULT,
            size,
        }
    }
}

struct SectionSpec {
    name: String,
    section_type: u32,
    flags: u64,
    addr: u64,
    offset: Option<u64>,
    data: Vec<u8>,
    size: u64,
}

#[derive(Default)]
struct Header {
    name: u32,
    section_type: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    addralign: u64,
    entsize: u64,
}

impl Header {
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.name.to_le_bytes());
        out.extend_from_slice(&self.section_type.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.addr.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.link.to_le_bytes());
        out.extend_from_slice(&self.info.to_le_bytes());
        out.extend_from_slice(&self.addralign.to_le_bytes());
        out.extend_from_slice(&self.entsize.to_le_bytes());
    }
}

fn flags_for(name: &str) -> u64 {
    match name {
        ".text" => u64::from(SHF_ALLOC | SHF_EXECINSTR),
        ".data" | ".bss" => u64::from(SHF_ALLOC | SHF_WRITE),
        _ => u64::from(SHF_ALLOC),
    }
}

fn add_name(names: &mut Vec<u8>, name: &str) -> u32 {
    let offset = names.len() as u32;
    names.extend_from_slice(name.as_bytes());
    names.push(0);
    offset
}

fn pad_to(out: &mut Vec<u8>, align: usize) {
    let len = out.len().div_ceil(align) * align;
    out.resize(len, 0);
}

/// Assembles minimal ELF64 x86_64 images for tests.
///
/// Layout: file header, section contents in call order, `.symtab`/`.strtab` when symbols were
/// added, `.shstrtab`, then the section header table. `.shstrtab` is always the last section.
#[derive(Default)]
pub struct ElfBuilder {
    sections: Vec<SectionSpec>,
    symbols: Vec<SymbolSpec>,
}

impl ElfBuilder {
    pub fn new() -> ElfBuilder {
        ElfBuilder::default()
    }

    // 16-byte aligned, address equal to the file offset
    pub fn section(mut self, name: &str, data: &[u8]) -> ElfBuilder {
        self.sections.push(SectionSpec {
            name: name.to_string(),
            section_type: SHT_PROGBITS,
            flags: flags_for(name),
            addr: 0,
            offset: None,
            data: data.to_vec(),
            size: data.len() as u64,
        });
        self
    }

    // `offset` must not be below the end of the previous section
    pub fn section_at(mut self, name: &str, offset: u64, addr: u64, data: &[u8]) -> ElfBuilder {
        self.sections.push(SectionSpec {
            name: name.to_string(),
            section_type: SHT_PROGBITS,
            flags: flags_for(name),
            addr,
            offset: Some(offset),
            data: data.to_vec(),
            size: data.len() as u64,
        });
        self
    }

    pub fn nobits(mut self, name: &str, addr: u64, size: u64) -> ElfBuilder {
        self.sections.push(SectionSpec {
            name: name.to_string(),
            section_type: SHT_NOBITS,
            flags: flags_for(name),
            addr,
            offset: None,
            data: Vec::new(),
            size,
        });
        self
    }

    pub fn symbol(mut self, symbol: SymbolSpec) -> ElfBuilder {
        self.symbols.push(symbol);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = vec![0u8; EHDR_SIZE];
        let mut names = vec![0u8];
        let mut headers = vec![Header::default()];

        for section in &self.sections {
            let offset = if section.section_type == SHT_NOBITS {
                out.len() as u64
            } else {
                match section.offset {
                    Some(offset) => {
                        assert!(offset as usize >= out.len(), "{} overlaps", section.name);
                        out.resize(offset as usize, 0);
                    }
                    None => pad_to(&mut out, 16),
                }
                let offset = out.len() as u64;
                out.extend_from_slice(&section.data);
                offset
            };

            let addr = if section.offset.is_none() && section.section_type != SHT_NOBITS {
                offset
            } else {
                section.addr
            };

            headers.push(Header {
                name: add_name(&mut names, &section.name),
                section_type: section.section_type,
                flags: section.flags,
                addr,
                offset,
                size: section.size,
                addralign: 16,
                ..Header::default()
            });
        }

        if !self.symbols.is_empty() {
            let symtab_index = headers.len() as u32;
            let mut strings = vec![0u8];
            let mut table = vec![0u8; SYM_SIZE];

            for symbol in &self.symbols {
                let name = strings.len() as u32;
                strings.extend_from_slice(symbol.name.as_bytes());
                strings.push(0);

                table.extend_from_slice(&name.to_le_bytes());
                table.push(GLOBAL_OBJECT);
                table.push(symbol.other);
                table.extend_from_slice(&1u16.to_le_bytes());
                table.extend_from_slice(&0u64.to_le_bytes());
                table.extend_from_slice(&symbol.size.to_le_bytes());
            }

            pad_to(&mut out, 8);
            let symtab_offset = out.len() as u64;
            out.extend_from_slice(&table);
            headers.push(Header {
                name: add_name(&mut names, ".symtab"),
                section_type: SHT_SYMTAB,
                offset: symtab_offset,
                size: table.len() as u64,
                link: symtab_index + 1,
                info: 1,
                addralign: 8,
                entsize: SYM_SIZE as u64,
                ..Header::default()
            });

            let strtab_offset = out.len() as u64;
            out.extend_from_slice(&strings);
            headers.push(Header {
                name: add_name(&mut names, ".strtab"),
                section_type: SHT_STRTAB,
                offset: strtab_offset,
                size: strings.len() as u64,
                addralign: 1,
                ..Header::default()
            });
        }

        let shstrtab_name = add_name(&mut names, ".shstrtab");
        let shstrtab_offset = out.len() as u64;
        out.extend_from_slice(&names);
        headers.push(Header {
            name: shstrtab_name,
            section_type: SHT_STRTAB,
            offset: shstrtab_offset,
            size: names.len() as u64,
            addralign: 1,
            ..Header::default()
        });

        pad_to(&mut out, 8);
        let shoff = out.len() as u64;
        for header in &headers {
            header.write(&mut out);
        }

        let count = headers.len() as u16;
        out[0..4].copy_from_slice(b"\x7FELF");
        out[4] = 2; // ELFCLASS64
        out[5] = 1; // ELFDATA2LSB
        out[6] = 1; // EV_CURRENT
        out[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        out[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        out[20..24].copy_from_slice(&1u32.to_le_bytes());
        out[40..48].copy_from_slice(&shoff.to_le_bytes());
        out[52..54].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        out[58..60].copy_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
        out[60..62].copy_from_slice(&count.to_le_bytes());
        out[62..64].copy_from_slice(&(count - 1).to_le_bytes());

        out
    }
}
