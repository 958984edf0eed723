mod common;

use anyhow::Result;
use common::*;
use dwarf2cpp::convert::process_dwarf;
use dwarf2cpp::cpp::{
    fundamental_type_name, modifier_string, ClassData, File, Function, FunctionData, LocationOp,
    Member, Parameter, Type, TypeArena, UserKind, UserTypeData, Variable,
};
use dwarf2cpp::dwarf::{
    Dwarf, DW_FT_FLOAT, DW_FT_INTEGER, DW_FT_UNSIGNED_INTEGER, DW_FT_VOID,
    DW_OP_ADDR, DW_OP_BASEREG, DW_TAG_CLASS_TYPE, DW_TAG_COMPILE_UNIT,
    DW_TAG_ENUMERATION_TYPE, DW_TAG_FORMAL_PARAMETER, DW_TAG_GLOBAL_SUBROUTINE,
    DW_TAG_GLOBAL_VARIABLE, DW_TAG_INHERITANCE, DW_TAG_LEXICAL_BLOCK, DW_TAG_LOCAL_VARIABLE,
    DW_TAG_MEMBER, DW_TAG_STRUCTURE_TYPE,
};

fn class_shell(arena: &mut TypeArena, name: &str, kind: UserKind, data: ClassData) -> usize {
    let id = arena.alloc();
    let ut = arena.get_mut(id);
    ut.name = name.to_string();
    ut.kind = Some(kind);
    ut.data = UserTypeData::Class(data);
    id
}

#[test]
fn groups_anonymous_unions_by_shared_offset() {
    let mut arena = TypeArena::new();
    let id = class_shell(
        &mut arena,
        "S",
        UserKind::Struct,
        ClassData {
            size: 8,
            members: vec![
                Member {
                    name: "a".into(),
                    offset: 0,
                    typ: Type::fundamental(DW_FT_INTEGER),
                    ..Member::default()
                },
                Member {
                    name: "b".into(),
                    offset: 0,
                    typ: Type::fundamental(DW_FT_FLOAT),
                    ..Member::default()
                },
                Member {
                    name: "c".into(),
                    offset: 4,
                    typ: Type::fundamental(DW_FT_INTEGER),
                    ..Member::default()
                },
            ],
            ..ClassData::default()
        },
    );

    let definition = arena.get(id).definition_string(&arena, false);
    assert_eq!(
        definition,
        "struct S\n{\n\tunion\n\t{\n\t\tint a;\n\t\tfloat b;\n\t};\n\tint c;\n};"
    );
}

#[test]
fn bit_field_groups_render_as_structs() {
    let mut arena = TypeArena::new();
    let id = class_shell(
        &mut arena,
        "S",
        UserKind::Struct,
        ClassData {
            size: 4,
            members: vec![
                Member {
                    name: "lo".into(),
                    offset: 0,
                    typ: Type::fundamental(DW_FT_UNSIGNED_INTEGER),
                    bit_offset: 0,
                    bit_size: 4,
                    ..Member::default()
                },
                Member {
                    name: "hi".into(),
                    offset: 0,
                    typ: Type::fundamental(DW_FT_UNSIGNED_INTEGER),
                    bit_offset: 4,
                    bit_size: 4,
                    ..Member::default()
                },
            ],
            ..ClassData::default()
        },
    );

    let definition = arena.get(id).definition_string(&arena, false);
    assert_eq!(
        definition,
        "struct S\n{\n\tstruct\n\t{\n\t\tuint lo : 4;\n\t\tuint hi : 4;\n\t};\n};"
    );
}

#[test]
fn nested_subroutine_types_rotate_separators() {
    let mut arena = TypeArena::new();
    let inner = arena.alloc();
    {
        let ut = arena.get_mut(inner);
        ut.kind = Some(UserKind::Function);
        ut.data = UserTypeData::Function(FunctionData {
            return_type: Type::fundamental(DW_FT_INTEGER),
            parameters: vec![Parameter {
                name: "x".into(),
                typ: Type::fundamental(DW_FT_INTEGER),
            }],
        });
    }
    let outer = arena.alloc();
    {
        let ut = arena.get_mut(outer);
        ut.name = "cb".into();
        ut.kind = Some(UserKind::Function);
        ut.data = UserTypeData::Function(FunctionData {
            return_type: Type::fundamental(DW_FT_VOID),
            parameters: vec![Parameter {
                name: String::new(),
                typ: Type::user(inner),
            }],
        });
    }

    assert_eq!(
        arena.get(outer).declaration_string(&arena),
        "typedef cb@void@null$int$int;"
    );
}

#[test]
fn variables_render_with_location_comments() {
    let arena = TypeArena::new();
    let var = Variable {
        name: "x".into(),
        typ: Type::fundamental(DW_FT_INTEGER),
        is_global: true,
        address: 0x10,
        location_ops: vec![LocationOp {
            opcode: DW_OP_ADDR,
            value: 16,
        }],
    };
    assert_eq!(var.declaration_string(&arena), "int x");
    assert_eq!(var.location_string(), "Global, Address: 0x10, Loc Data: ADDR=16 ");
}

#[test]
fn function_definitions_carry_line_comments() -> Result<()> {
    let mut arena = TypeArena::new();
    let c = class_shell(&mut arena, "C", UserKind::Class, ClassData::default());

    let fun = Function {
        name: "f".into(),
        mangled_name: "f__1CFi".into(),
        is_global: true,
        start_address: 0x100,
        signature: FunctionData {
            return_type: Type::fundamental(DW_FT_INTEGER),
            parameters: vec![Parameter {
                name: "a".into(),
                typ: Type::fundamental(DW_FT_INTEGER),
            }],
        },
        locals: vec![Variable {
            name: "s".into(),
            typ: Type::fundamental(DW_FT_INTEGER),
            is_global: true,
            address: 0x9000,
            location_ops: vec![LocationOp {
                opcode: DW_OP_ADDR,
                value: 0x9000,
            }],
        }],
        owner: Some(c),
    };

    let lines = build_lines(&[(0x100, vec![(12, 3, 0), (0, 0xffff, 0x20)])]);
    let dwarf = Dwarf::from_sections(&[], &lines)?;

    assert_eq!(
        fun.definition_string(&arena, &dwarf),
        "// f__1CFi, Global\n\
         // Start address: 0x100\n\
         int C::f(int a)\n\
         {\n\
         \tstatic int s; // Global, Address: 0x9000, Loc Data: ADDR=36864 \n\
         \t// Line 12, Character 3, Address: 0x100, Func Offset: 0\n\
         \t// Func End, Address: 0x120, Func Offset: 0x20\n\
         }"
    );
    Ok(())
}

#[test]
fn unknown_discriminants_render_in_angle_brackets() {
    assert_eq!(
        fundamental_type_name(0x99),
        "<unknown fundamental type (0x99)>"
    );
    assert_eq!(modifier_string(0x07), "<unknown modifier (0x7)>");

    // Unknown modifiers survive through array rendering.
    let mut arena = TypeArena::new();
    let arr = arena.alloc();
    {
        let ut = arena.get_mut(arr);
        ut.kind = Some(UserKind::Array);
        ut.data = UserTypeData::Array(dwarf2cpp::cpp::ArrayData {
            element: Type::fundamental(DW_FT_INTEGER),
            dimensions: vec![4],
        });
    }
    let typ = Type {
        base: dwarf2cpp::cpp::TypeBase::User(arr),
        modifiers: vec![0x07],
    };
    assert_eq!(typ.name_string(&arena, ""), "int[4]<unknown modifier (0x7)>");
}

#[test]
fn source_emission_orders_sections() {
    let mut arena = TypeArena::new();
    let class_id = class_shell(&mut arena, "C", UserKind::Class, ClassData::default());

    let fn_id = arena.alloc();
    {
        let ut = arena.get_mut(fn_id);
        ut.name = "handler".into();
        ut.kind = Some(UserKind::Function);
        ut.data = UserTypeData::Function(FunctionData::default());
    }
    let arr_id = arena.alloc();
    {
        let ut = arena.get_mut(arr_id);
        ut.name = "buf".into();
        ut.kind = Some(UserKind::Array);
        ut.data = UserTypeData::Array(dwarf2cpp::cpp::ArrayData {
            element: Type::fundamental(DW_FT_INTEGER),
            dimensions: vec![16],
        });
    }

    let mut file = File::new("main.c".into());
    file.user_types = vec![arr_id, fn_id, class_id];
    file.variables.push(Variable {
        name: "v".into(),
        typ: Type::fundamental(DW_FT_INTEGER),
        ..Variable::default()
    });

    let dwarf = Dwarf::from_sections(&[], &[]).unwrap();
    let source = file.source_string(&arena, &dwarf, false, false);

    let class_decl = source.find("typedef class C;").unwrap();
    let fn_decl = source.find("typedef handler@void;").unwrap();
    let arr_decl = source.find("typedef int buf[16];").unwrap();
    let class_def = source.find("class C\n{").unwrap();
    let var_decl = source.find("int v; //").unwrap();
    assert!(class_decl < fn_decl);
    assert!(fn_decl < arr_decl);
    assert!(arr_decl < class_def);
    assert!(class_def < var_decl);

    // Emission is pure: a second render is identical.
    assert_eq!(source, file.source_string(&arena, &dwarf, false, false));

    let types_only = file.source_string(&arena, &dwarf, true, false);
    assert!(!types_only.contains("int v;"));
}

#[test]
fn ghidra_export_end_to_end() -> Result<()> {
    let (debug, _) = build_debug(&[DieNode::new(DW_TAG_COMPILE_UNIT)
        .name("main.c")
        .child(
            DieNode::new(DW_TAG_CLASS_TYPE)
                .labeled("Base")
                .name("Base")
                .with(byte_size(4))
                .child(
                    DieNode::new(DW_TAG_MEMBER)
                        .name("b")
                        .with(fund(DW_FT_INTEGER))
                        .with(loc_addr(0)),
                ),
        )
        .child(
            DieNode::new(DW_TAG_CLASS_TYPE)
                .labeled("Foo")
                .name("Foo")
                .with(byte_size(16))
                .child(
                    DieNode::new(DW_TAG_INHERITANCE)
                        .with(udt("Base"))
                        .with(loc_const(0)),
                )
                .child(
                    DieNode::new(DW_TAG_MEMBER)
                        .name("a")
                        .with(fund(DW_FT_INTEGER))
                        .with(loc_addr(4)),
                )
                .child(
                    DieNode::new(DW_TAG_MEMBER)
                        .name("flags")
                        .with(fund(DW_FT_UNSIGNED_INTEGER))
                        .with(loc_addr(8))
                        .with(bit_offset(5))
                        .with(bit_size(3)),
                ),
        )
        .child(
            DieNode::new(DW_TAG_ENUMERATION_TYPE)
                .name("Color")
                .with(byte_size(4))
                .with(element_list(4, &[("RED", 0), ("GREEN", 1), ("BLUE", 5)])),
        )
        .child(
            DieNode::new(DW_TAG_GLOBAL_VARIABLE)
                .name("__vt__3Foo")
                .with(udt("Foo"))
                .with(loc_addr(0x8001000)),
        )
        .child(
            DieNode::new(DW_TAG_GLOBAL_VARIABLE)
                .name("counter")
                .with(fund(DW_FT_INTEGER))
                .with(loc_addr(0x8000)),
        )
        .child(
            DieNode::new(DW_TAG_GLOBAL_SUBROUTINE)
                .name("f")
                .with(mangled("f__3FooFi"))
                .with(fund(DW_FT_VOID))
                .with(low_pc(0x100))
                .child(
                    DieNode::new(DW_TAG_FORMAL_PARAMETER)
                        .name("x")
                        .with(fund(DW_FT_INTEGER)),
                )
                .child(
                    DieNode::new(DW_TAG_LEXICAL_BLOCK).child(
                        DieNode::new(DW_TAG_LOCAL_VARIABLE)
                            .name("tmp")
                            .with(fund(DW_FT_INTEGER))
                            .with(location(&[(DW_OP_BASEREG, Some(30))])),
                    ),
                ),
        )]);
    let lines = build_lines(&[(0x100, vec![(10, 0xffff, 0)])]);
    let dwarf = Dwarf::from_sections(&debug, &lines)?;
    let mut conv = process_dwarf(&dwarf)?;

    let mut out = Vec::new();
    dwarf2cpp::ghidra::write_export(&mut out, &conv.files, &mut conv.arena, &dwarf)?;
    let export = String::from_utf8(out)?;

    assert_eq!(
        export,
        "# main.c\n\
         class Base -1 -1 null b,int,0,4,-1,-1 4\n\
         class Foo 134221824 16 Base,0 a,int,4,4,-1,-1;flags,uint,8,4,3,5 16\n\
         enum Color 4 RED=0;GREEN=1;BLUE=5\n\
         var __vt__3Foo 0x8001000 Foo true\n\
         var counter 0x8000 int true\n\
         func f f__3FooFi 0x100 void Foo int,x int,tmp,false,2=30 10,0\n"
    );

    // The same conversion also renders the source view with the vtable
    // and method fixups applied.
    let source = conv.files[0].source_string(&conv.arena, &dwarf, false, true);
    assert!(source.contains("class Foo : Base /* 0x10 */\n"));
    assert!(source.contains("\t/* 0x4 */ int a;\n"));
    assert!(source.contains("\t/* 0x8 */ uint flags : 3;\n"));
    assert!(source.contains("\tvoid f(int x);\n"));
    assert!(source.contains("// vtable: 0x8001000\n"));
    assert!(source.contains("void Foo::f(int x)\n{\n"));
    assert!(source.contains("\tint tmp; // Local, Address: 0xffffffff, Loc Data: BASEREG=30 \n"));
    assert!(source.contains("\t// Line 10, Address: 0x100, Func Offset: 0\n"));
    Ok(())
}

#[test]
fn ghidra_export_anonymizes_placeholder_names() -> Result<()> {
    let (debug, _) = build_debug(&[DieNode::new(DW_TAG_COMPILE_UNIT)
        .name("over/main.cpp")
        .child(
            DieNode::new(DW_TAG_STRUCTURE_TYPE)
                .name("_anon0")
                .with(byte_size(4)),
        )]);
    let dwarf = Dwarf::from_sections(&debug, &[])?;
    let mut conv = process_dwarf(&dwarf)?;

    let mut out = Vec::new();
    dwarf2cpp::ghidra::write_export(&mut out, &conv.files, &mut conv.arena, &dwarf)?;
    let export = String::from_utf8(out)?;

    assert_eq!(
        export,
        "# over/main.cpp\nstruct main_cpp_anon0 null 4\n"
    );
    Ok(())
}
