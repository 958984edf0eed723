use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use dwarf2cpp::convert;
use dwarf2cpp::dwarf::Dwarf;
use dwarf2cpp::elf::Elf;
use dwarf2cpp::ghidra;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() != 3 {
        bail!("Usage: dwarf2cpp <input ELF file> <output directory>");
    }

    let elf_filename = &args[1];
    let out_directory = Path::new(&args[2]);

    println!("Loading ELF file {elf_filename}...");
    let elf = Elf::new(elf_filename)
        .with_context(|| format!("Failed to parse {elf_filename} as an ELF file"))?;

    println!("Loading DWARFv1 information...");
    let dwarf = Dwarf::new(&elf).context("Failed to parse DWARF data")?;

    println!("Converting DWARFv1 entries to C++ data...");
    let mut conversion = convert::process_dwarf(&dwarf).context("Failed to process DWARF data")?;

    println!("Done converting DWARFv1 data!");
    println!("\tNumber of C++ files: {}", conversion.files.len());
    println!();

    for file in &mut conversion.files {
        file.filename = file.filename.replace('\\', "/");
    }

    for file in &conversion.files {
        let path = out_directory.join(relative_output_path(&file.filename));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        println!("Writing file {}...", path.display());
        let source = file.source_string(&conversion.arena, &dwarf, false, true);
        fs::write(&path, source).with_context(|| format!("Failed to write {}", path.display()))?;
    }

    let export_path = out_directory.join("ghidra-export.txt");
    let export_file = fs::File::create(&export_path)
        .with_context(|| format!("Failed to create {}", export_path.display()))?;
    let mut writer = BufWriter::new(export_file);
    ghidra::write_export(&mut writer, &conversion.files, &mut conversion.arena, &dwarf)?;
    println!("Exported Ghidra Mapping.");

    println!("Done.");
    Ok(())
}

/// Compile unit names arrive as the paths the compiler saw; keep them
/// relative so every output lands under the output directory.
fn relative_output_path(filename: &str) -> PathBuf {
    let mut rel = filename;
    if rel.len() >= 2 && rel.as_bytes()[1] == b':' {
        rel = &rel[2..];
    }
    PathBuf::from(rel.trim_start_matches('/'))
}
