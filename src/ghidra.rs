use std::io::Write;

use anyhow::Result;

use crate::cpp::{
    fundamental_type_size, hex_string, ClassData, EnumData, File, Function, TypeArena, UserKind,
    UserTypeData, Variable,
};
use crate::dwarf::{Dwarf, DW_OP_ADD, DW_OP_DEREF2, DW_OP_DEREF4};

/// Writes the line-oriented mapping consumed by the disassembler-side
/// import script: one record per user type, variable, and function,
/// grouped under a `# <filename>` header per compile unit.
pub fn write_export<W: Write>(
    out: &mut W,
    files: &[File],
    arena: &mut TypeArena,
    dwarf: &Dwarf,
) -> Result<()> {
    for file in files {
        writeln!(out, "# {}", file.filename)?;

        anonymize_type_names(file, arena);

        for &id in &file.user_types {
            let ut = arena.get(id);
            match (&ut.kind, &ut.data) {
                (Some(UserKind::Class), UserTypeData::Class(class)) => {
                    writeln!(
                        out,
                        "class {} {} {} {} {} {}",
                        ut.name,
                        class.vtable,
                        class.vtable_size,
                        inheritance_list(arena, class),
                        member_list(arena, class),
                        class.size
                    )?;
                }
                (Some(UserKind::Struct), UserTypeData::Class(class)) => {
                    writeln!(
                        out,
                        "struct {} {} {}",
                        ut.name,
                        member_list(arena, class),
                        class.size
                    )?;
                }
                (Some(UserKind::Union), UserTypeData::Class(class)) => {
                    writeln!(
                        out,
                        "union {} {} {}",
                        ut.name,
                        member_list(arena, class),
                        class.size
                    )?;
                }
                (Some(UserKind::Enum), UserTypeData::Enum(data)) => {
                    writeln!(
                        out,
                        "enum {} {} {}",
                        ut.name,
                        fundamental_type_size(data.base),
                        element_list(data)
                    )?;
                }
                _ => {}
            }
        }

        for var in &file.variables {
            writeln!(
                out,
                "var {} {} {} {}",
                var.name,
                hex_string(var.address),
                var.typ.name_string(arena, ""),
                var.is_global
            )?;
        }

        for fun in &file.functions {
            write_function(out, arena, dwarf, fun)?;
        }
    }
    Ok(())
}

/// Compiler-generated placeholder names get the compile unit's basename
/// prefixed so they stay unique across the whole export. The rename is
/// permanent; later records see the new name.
fn anonymize_type_names(file: &File, arena: &mut TypeArena) {
    for &id in &file.user_types {
        let name = &arena.get(id).name;
        if !(name.starts_with("_anon") || name.starts_with("_enum") || name.starts_with("_class"))
        {
            continue;
        }
        let basename = match file.filename.rfind('/') {
            Some(pos) => &file.filename[pos + 1..],
            None => &file.filename,
        };
        let renamed = format!("{basename}{}", arena.get(id).name).replace('.', "_");
        arena.get_mut(id).name = renamed;
    }
}

fn inheritance_list(arena: &TypeArena, class: &ClassData) -> String {
    if class.inheritances.is_empty() {
        return "null".to_string();
    }
    class
        .inheritances
        .iter()
        .map(|inh| format!("{},{}", inh.typ.name_string(arena, ""), inh.offset))
        .collect::<Vec<_>>()
        .join(";")
}

fn member_list(arena: &TypeArena, class: &ClassData) -> String {
    if class.members.is_empty() {
        return "null".to_string();
    }
    class
        .members
        .iter()
        .map(|m| {
            format!(
                "{},{},{},{},{},{}",
                m.name,
                m.typ.name_string(arena, ""),
                m.offset,
                m.typ.size(arena),
                m.bit_size,
                m.bit_offset
            )
        })
        .collect::<Vec<_>>()
        .join(";")
}

fn element_list(data: &EnumData) -> String {
    data.elements
        .iter()
        .map(|e| format!("{}={}", e.name, e.value))
        .collect::<Vec<_>>()
        .join(";")
}

fn write_function<W: Write>(
    out: &mut W,
    arena: &TypeArena,
    dwarf: &Dwarf,
    fun: &Function,
) -> Result<()> {
    let owner = match fun.owner {
        Some(id) => arena.get(id).name.clone(),
        None => "null".to_string(),
    };
    write!(
        out,
        "func {} {} {} {} {} ",
        fun.name,
        if fun.mangled_name.is_empty() {
            "null"
        } else {
            &fun.mangled_name
        },
        hex_string(fun.start_address as i64),
        fun.signature.return_type.name_string(arena, ""),
        owner
    )?;

    if fun.signature.parameters.is_empty() {
        write!(out, "null")?;
    } else {
        let params = fun
            .signature
            .parameters
            .iter()
            .map(|p| format!("{},{}", p.typ.name_string(arena, ""), p.name))
            .collect::<Vec<_>>()
            .join(";");
        write!(out, "{params}")?;
    }
    write!(out, " ")?;

    if fun.locals.is_empty() {
        write!(out, "null")?;
    } else {
        let locals = fun
            .locals
            .iter()
            .map(|v| local_record(arena, v))
            .collect::<Vec<_>>()
            .join(";");
        write!(out, "{locals}")?;
    }
    write!(out, " ")?;

    match dwarf.line_entries_at(fun.start_address) {
        Some(lines) => {
            let records = lines
                .iter()
                .map(|entry| format!("{},{}", entry.line, hex_string(entry.address_offset as i64)))
                .collect::<Vec<_>>()
                .join(";");
            writeln!(out, "{records}")?;
        }
        None => writeln!(out, "null")?,
    }
    Ok(())
}

fn local_record(arena: &TypeArena, var: &Variable) -> String {
    let mut record = format!(
        "{},{},{}",
        var.typ.name_string(arena, ""),
        var.name,
        var.is_global
    );
    for op in &var.location_ops {
        record.push_str(&format!(",{}", op.opcode));
        if op.opcode != DW_OP_DEREF2 && op.opcode != DW_OP_DEREF4 && op.opcode != DW_OP_ADD {
            record.push_str(&format!("={}", op.value));
        }
    }
    record
}
