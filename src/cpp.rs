use crate::dwarf::{
    Dwarf, FundType, LocationOpcode, TypeModifier, DW_FT_BOOLEAN, DW_FT_CHAR, DW_FT_DBL_PREC_FLOAT,
    DW_FT_EXT_PREC_FLOAT, DW_FT_FLOAT, DW_FT_INTEGER, DW_FT_LONG, DW_FT_LONG_LONG,
    DW_FT_SHORT, DW_FT_SIGNED_CHAR, DW_FT_SIGNED_INTEGER, DW_FT_SIGNED_LONG,
    DW_FT_SIGNED_LONG_LONG, DW_FT_SIGNED_SHORT, DW_FT_ULONG_128, DW_FT_UNSIGNED_CHAR,
    DW_FT_UNSIGNED_INTEGER, DW_FT_UNSIGNED_LONG, DW_FT_UNSIGNED_LONG_LONG, DW_FT_UNSIGNED_SHORT,
    DW_FT_VOID, DW_MOD_CONST, DW_MOD_POINTER_TO, DW_MOD_REFERENCE_TO, DW_MOD_VOLATILE, DW_OP_ADD,
    DW_OP_ADDR, DW_OP_BASEREG, DW_OP_CONST, DW_OP_DEREF2, DW_OP_DEREF4, DW_OP_REG,
};

/// Handle to a user type in the arena. All cross references between user
/// types go through these; the graph may be cyclic.
pub type UserTypeId = usize;

/// Owns every user type decoded in a run. Shells are allocated during the
/// first pass over a compile unit and filled in during the second, so a
/// handle taken from a forward reference stays valid.
#[derive(Default, Debug)]
pub struct TypeArena {
    types: Vec<UserType>,
}

impl TypeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self) -> UserTypeId {
        self.types.push(UserType::default());
        self.types.len() - 1
    }

    pub fn get(&self, id: UserTypeId) -> &UserType {
        &self.types[id]
    }

    pub fn get_mut(&mut self, id: UserTypeId) -> &mut UserType {
        &mut self.types[id]
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserKind {
    Class,
    Struct,
    Union,
    Enum,
    Array,
    Function,
}

#[derive(Default, Debug)]
pub struct UserType {
    pub name: String,
    /// Position within the owning compile unit's type list.
    pub index: usize,
    /// None while the type is still an unfilled first-pass shell.
    pub kind: Option<UserKind>,
    pub data: UserTypeData,
}

#[derive(Default, Debug)]
pub enum UserTypeData {
    #[default]
    Empty,
    Class(ClassData),
    Enum(EnumData),
    Array(ArrayData),
    Function(FunctionData),
}

impl UserType {
    pub fn class_data(&self) -> Option<&ClassData> {
        match &self.data {
            UserTypeData::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn class_data_mut(&mut self) -> Option<&mut ClassData> {
        match &mut self.data {
            UserTypeData::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_class_like(&self) -> bool {
        matches!(
            self.kind,
            Some(UserKind::Class) | Some(UserKind::Struct) | Some(UserKind::Union)
        )
    }

    pub fn declaration_string(&self, arena: &TypeArena) -> String {
        format!("typedef {};", self.head_string(arena, false, false))
    }

    /// Header line plus body for class-like and enum types.
    pub fn definition_string(&self, arena: &TypeArena, include_comments: bool) -> String {
        let mut out = self.head_string(arena, include_comments, true);
        out.push('\n');
        match &self.data {
            UserTypeData::Class(c) => {
                let kind = self.kind.unwrap_or(UserKind::Class);
                out.push_str(&c.body_string(arena, kind, include_comments));
            }
            UserTypeData::Enum(e) => out.push_str(&e.body_string()),
            _ => {}
        }
        out.push(';');
        out
    }

    pub fn head_string(
        &self,
        arena: &TypeArena,
        include_size: bool,
        include_inheritances: bool,
    ) -> String {
        match &self.data {
            UserTypeData::Class(c) => c.name_string(
                arena,
                self.kind.unwrap_or(UserKind::Class),
                &self.name,
                include_size,
                include_inheritances,
            ),
            UserTypeData::Enum(e) => e.name_string(&self.name),
            UserTypeData::Array(a) => a.name_string(arena, &self.name, 0),
            UserTypeData::Function(f) => f.ghidra_string(arena, &self.name, 0),
            UserTypeData::Empty => "<unknown user type>".to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum TypeBase {
    Fundamental(FundType),
    User(UserTypeId),
}

/// A type use: a fundamental kind or a user type handle, wrapped in zero
/// or more modifier bytes stored innermost-first as they appear on the
/// wire.
#[derive(Clone, Debug)]
pub struct Type {
    pub base: TypeBase,
    pub modifiers: Vec<TypeModifier>,
}

impl Default for Type {
    fn default() -> Self {
        Self {
            base: TypeBase::Fundamental(DW_FT_VOID),
            modifiers: Vec::new(),
        }
    }
}

impl Type {
    pub fn fundamental(ft: FundType) -> Self {
        Self {
            base: TypeBase::Fundamental(ft),
            modifiers: Vec::new(),
        }
    }

    pub fn user(id: UserTypeId) -> Self {
        Self {
            base: TypeBase::User(id),
            modifiers: Vec::new(),
        }
    }

    /// Size in bytes as emitted to the mapping export: 4 for anything
    /// behind a pointer or reference, otherwise the fundamental size or
    /// the user type's body size.
    pub fn size(&self, arena: &TypeArena) -> i64 {
        for &m in &self.modifiers {
            if m == DW_MOD_POINTER_TO || m == DW_MOD_REFERENCE_TO {
                return 4;
            }
        }
        match self.base {
            TypeBase::Fundamental(ft) => fundamental_type_size(ft),
            TypeBase::User(id) => match &arena.get(id).data {
                UserTypeData::Class(c) => c.size,
                UserTypeData::Enum(e) => fundamental_type_size(e.base),
                UserTypeData::Array(a) => {
                    let mut amount = 1;
                    for &d in &a.dimensions {
                        amount *= d;
                    }
                    amount * a.element.size(arena)
                }
                UserTypeData::Function(_) => 4,
                UserTypeData::Empty => -1,
            },
        }
    }

    pub fn name_string(&self, arena: &TypeArena, var_name: &str) -> String {
        self.render(arena, var_name, 0)
    }

    fn render(&self, arena: &TypeArena, var_name: &str, depth: usize) -> String {
        let mut out = String::new();

        // const/volatile go in front, pointer/reference behind.
        for &m in &self.modifiers {
            if m == DW_MOD_CONST || m == DW_MOD_VOLATILE {
                out.push_str(&modifier_string(m));
                out.push(' ');
            }
        }

        match self.base {
            TypeBase::Fundamental(ft) => out.push_str(&fundamental_type_name(ft)),
            TypeBase::User(id) => {
                let ut = arena.get(id);
                match &ut.data {
                    UserTypeData::Array(a) => {
                        out.push_str(&a.name_string(arena, var_name, depth));
                        for &m in &self.modifiers {
                            if m != DW_MOD_CONST && m != DW_MOD_VOLATILE {
                                out.push_str(&modifier_string(m));
                            }
                        }
                        return out;
                    }
                    UserTypeData::Function(f) => {
                        return f.ghidra_string(arena, var_name, depth);
                    }
                    _ => out.push_str(&ut.name),
                }
            }
        }

        for &m in &self.modifiers {
            if m == DW_MOD_POINTER_TO || m == DW_MOD_REFERENCE_TO {
                out.push_str(&modifier_string(m));
            }
        }

        if !var_name.is_empty() {
            out.push(' ');
            out.push_str(var_name);
        }
        out
    }
}

#[derive(Debug)]
pub struct ClassData {
    pub size: i64,
    pub members: Vec<Member>,
    pub inheritances: Vec<Inheritance>,
    pub methods: Vec<Function>,
    /// Bound by the vtable fixup; -1 until a matching __vt__ global is
    /// found.
    pub vtable: i64,
    pub vtable_size: i64,
}

impl Default for ClassData {
    fn default() -> Self {
        Self {
            size: 0,
            members: Vec::new(),
            inheritances: Vec::new(),
            methods: Vec::new(),
            vtable: -1,
            vtable_size: -1,
        }
    }
}

impl ClassData {
    pub fn name_string(
        &self,
        arena: &TypeArena,
        kind: UserKind,
        name: &str,
        include_size: bool,
        include_inheritances: bool,
    ) -> String {
        let keyword = match kind {
            UserKind::Struct => "struct ",
            UserKind::Union => "union ",
            _ => "class ",
        };
        let mut out = format!("{keyword}{name}");

        if include_inheritances {
            for (i, inh) in self.inheritances.iter().enumerate() {
                let base = inh.typ.name_string(arena, "");
                if i == 0 {
                    out.push_str(&format!(" : {base}"));
                } else {
                    out.push_str(&format!(", {base}"));
                }
            }
        }

        if include_size {
            out.push(' ');
            out.push_str(&star_comment(&hex_string(self.size)));
        }
        out
    }

    /// Braced member list. Consecutive members sharing a byte offset are
    /// regrouped into the anonymous union (or struct, for bit-fields)
    /// they came from.
    pub fn body_string(&self, arena: &TypeArena, kind: UserKind, include_offsets: bool) -> String {
        let mut out = String::from("{\n");

        let include_unions = kind != UserKind::Union;
        let mut union_offset: i64 = -1;
        let size = self.members.len();

        for i in 0..size {
            out.push('\t');

            let m = &self.members[i];
            let offset = m.offset;

            if include_unions
                && offset != union_offset
                && i < size - 1
                && self.members[i + 1].offset == offset
            {
                union_offset = offset;
                out.push_str(if m.bit_size == -1 { "union" } else { "struct" });
                out.push_str("\n\t{\n\t");
            }

            if include_unions && union_offset != -1 {
                out.push('\t');
            }

            out.push_str(&m.member_string(arena, include_offsets));
            out.push_str(";\n");

            if include_unions
                && union_offset != -1
                && (i == size - 1 || self.members[i + 1].offset != offset)
            {
                union_offset = -1;
                out.push_str("\t};\n");
            }
        }

        if !self.methods.is_empty() {
            out.push('\n');
            for fun in &self.methods {
                out.push('\t');
                out.push_str(&fun.declaration_string(arena));
                out.push('\n');
            }
        }

        if self.vtable != -1 {
            out.push_str(&format!("\t// vtable: {}\n", hex_string(self.vtable)));
        }

        out.push('}');
        out
    }
}

#[derive(Debug)]
pub struct Member {
    pub name: String,
    /// Byte offset within the enclosing aggregate.
    pub offset: i64,
    pub typ: Type,
    pub bit_offset: i64,
    pub bit_size: i64,
}

impl Default for Member {
    fn default() -> Self {
        Self {
            name: String::new(),
            offset: 0,
            typ: Type::default(),
            bit_offset: -1,
            bit_size: -1,
        }
    }
}

impl Member {
    pub fn member_string(&self, arena: &TypeArena, include_offset: bool) -> String {
        let mut out = String::new();
        if include_offset {
            out.push_str(&star_comment(&hex_string(self.offset)));
            out.push(' ');
        }
        out.push_str(&self.typ.name_string(arena, &self.name));
        if self.bit_size != -1 {
            out.push_str(&format!(" : {}", self.bit_size));
        }
        out
    }
}

#[derive(Default, Debug)]
pub struct Inheritance {
    pub typ: Type,
    /// Offset of the base sub-object within the derived aggregate.
    pub offset: i64,
}

#[derive(Debug)]
pub struct EnumData {
    pub base: FundType,
    pub elements: Vec<EnumElement>,
}

impl Default for EnumData {
    fn default() -> Self {
        Self {
            base: DW_FT_INTEGER,
            elements: Vec::new(),
        }
    }
}

impl EnumData {
    pub fn name_string(&self, name: &str) -> String {
        let mut out = format!("enum {name}");
        if self.base != DW_FT_INTEGER {
            out.push_str(&format!(" : {}", fundamental_type_name(self.base)));
        }
        out
    }

    pub fn body_string(&self) -> String {
        let mut out = String::from("{\n");
        let mut last_value: i64 = -1;
        let size = self.elements.len();

        for (i, element) in self.elements.iter().enumerate() {
            out.push('\t');
            out.push_str(&element.element_string(last_value));
            last_value = element.value;
            if i != size - 1 {
                out.push(',');
            }
            out.push('\n');
        }

        out.push('}');
        out
    }
}

#[derive(Debug)]
pub struct EnumElement {
    pub name: String,
    pub value: i64,
}

impl EnumElement {
    /// The explicit value is omitted when it just continues the previous
    /// one.
    pub fn element_string(&self, last_value: i64) -> String {
        if self.value != last_value + 1 {
            format!("{} = {}", self.name, hex_string(self.value))
        } else {
            self.name.clone()
        }
    }
}

#[derive(Default, Debug)]
pub struct ArrayData {
    pub element: Type,
    pub dimensions: Vec<i64>,
}

impl ArrayData {
    pub fn name_string(&self, arena: &TypeArena, var_name: &str, depth: usize) -> String {
        let mut out = self.element.render(arena, var_name, depth);
        for &d in &self.dimensions {
            out.push_str(&format!("[{d}]"));
        }
        out
    }
}

#[derive(Clone, Default, Debug)]
pub struct FunctionData {
    pub return_type: Type,
    pub parameters: Vec<Parameter>,
}

/// Separator cycle for nested subroutine type rendering; the choice is
/// addressed by recursion depth so reentrant renders stay stable.
const NEST_CHARS: [char; 4] = ['@', '$', ':', '|'];

impl FunctionData {
    /// Subroutine types render in the flat `name@return@param...` form
    /// the mapping consumer expects, one separator per nesting level.
    pub fn ghidra_string(&self, arena: &TypeArena, name: &str, depth: usize) -> String {
        let separator = NEST_CHARS[depth % NEST_CHARS.len()];
        let mut out = String::new();
        out.push_str(if name.is_empty() { "null" } else { name });
        out.push(separator);
        out.push_str(&self.return_type.render(arena, "", depth + 1));
        for param in &self.parameters {
            out.push(separator);
            out.push_str(&param.typ.render(arena, "", depth + 1));
        }
        out
    }

    pub fn parameters_string(&self, arena: &TypeArena) -> String {
        let mut out = String::from("(");
        for (i, param) in self.parameters.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&param.typ.name_string(arena, &param.name));
        }
        out.push(')');
        out
    }
}

#[derive(Clone, Default, Debug)]
pub struct Parameter {
    pub name: String,
    pub typ: Type,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocationOp {
    pub opcode: LocationOpcode,
    /// -1 for the operand-less opcodes (DEREF2, DEREF4, ADD).
    pub value: i64,
}

#[derive(Clone, Debug)]
pub struct Variable {
    pub name: String,
    pub typ: Type,
    pub is_global: bool,
    /// Static address when the location expression yields one, else -1.
    pub address: i64,
    /// The full location expression, retained verbatim.
    pub location_ops: Vec<LocationOp>,
}

impl Default for Variable {
    fn default() -> Self {
        Self {
            name: String::new(),
            typ: Type::default(),
            is_global: false,
            address: -1,
            location_ops: Vec::new(),
        }
    }
}

impl Variable {
    pub fn declaration_string(&self, arena: &TypeArena) -> String {
        self.typ.name_string(arena, &self.name)
    }

    pub fn location_string(&self) -> String {
        let mut out = String::new();
        out.push_str(if self.is_global { "Global" } else { "Local" });
        out.push_str(&format!(", Address: {}", hex_string(self.address)));
        out.push_str(", Loc Data: ");
        for op in &self.location_ops {
            let mut show = true;
            match op.opcode {
                DW_OP_REG => out.push_str("REG"),
                DW_OP_BASEREG => out.push_str("BASEREG"),
                DW_OP_ADDR => out.push_str("ADDR"),
                DW_OP_CONST => out.push_str("CONST"),
                DW_OP_DEREF2 => {
                    out.push_str("DEREF2");
                    show = false;
                }
                DW_OP_DEREF4 => {
                    out.push_str("DEREF4");
                    show = false;
                }
                DW_OP_ADD => {
                    out.push_str("ADD");
                    show = false;
                }
                other => out.push_str(&hex_string(other as i64)),
            }
            if show {
                out.push_str(&format!("={}", op.value));
            }
            out.push(' ');
        }
        out
    }
}

#[derive(Clone, Default, Debug)]
pub struct Function {
    pub name: String,
    pub mangled_name: String,
    pub is_global: bool,
    pub start_address: u32,
    pub signature: FunctionData,
    /// Locals from every lexical block of the body, flattened.
    pub locals: Vec<Variable>,
    /// Set when the method fixup recovered the class this function
    /// belongs to.
    pub owner: Option<UserTypeId>,
}

impl Function {
    pub fn signature_string(&self, arena: &TypeArena, skip_namespace: bool) -> String {
        let mut out = format!("{} ", self.signature.return_type.name_string(arena, ""));
        if let Some(owner) = self.owner {
            if !skip_namespace {
                out.push_str(&format!("{}::", arena.get(owner).name));
            }
        }
        out.push_str(&self.name);
        out.push_str(&self.signature.parameters_string(arena));
        out
    }

    pub fn declaration_string(&self, arena: &TypeArena) -> String {
        format!("{};", self.signature_string(arena, true))
    }

    pub fn definition_string(&self, arena: &TypeArena, dwarf: &Dwarf) -> String {
        let mut out = String::new();

        let linkage = if self.is_global { "Global" } else { "Local" };
        if self.mangled_name.is_empty() {
            out.push_str(&comment(linkage));
        } else {
            out.push_str(&comment(&format!("{}, {linkage}", self.mangled_name)));
        }
        out.push_str(&comment(&format!(
            "Start address: {}",
            hex_string(self.start_address as i64)
        )));

        out.push_str(&self.signature_string(arena, false));
        out.push_str("\n{\n");

        for var in &self.locals {
            out.push('\t');
            if var.is_global {
                out.push_str("static ");
            }
            out.push_str(&var.declaration_string(arena));
            out.push_str("; // ");
            out.push_str(&var.location_string());
            out.push('\n');
        }

        if let Some(lines) = dwarf.line_entries_at(self.start_address) {
            for entry in lines {
                out.push_str("\t// ");
                if entry.line != 0 {
                    out.push_str(&format!("Line {}", entry.line));
                } else {
                    out.push_str("Func End");
                }
                if entry.char_offset != -1 {
                    out.push_str(&format!(", Character {}", entry.char_offset));
                }
                out.push_str(&format!(
                    ", Address: {}, Func Offset: {}\n",
                    hex_string(self.start_address as i64 + entry.address_offset as i64),
                    hex_string(entry.address_offset as i64)
                ));
            }
        }

        out.push('}');
        out
    }
}

#[derive(Debug)]
pub struct File {
    pub filename: String,
    pub user_types: Vec<UserTypeId>,
    pub variables: Vec<Variable>,
    pub functions: Vec<Function>,
}

impl File {
    pub fn new(filename: String) -> Self {
        Self {
            filename,
            user_types: Vec::new(),
            variables: Vec::new(),
            functions: Vec::new(),
        }
    }

    /// Reconstructed source text: type declarations, subroutine and array
    /// typedefs, full type definitions, then (unless `just_user_types`)
    /// variables and functions.
    pub fn source_string(
        &self,
        arena: &TypeArena,
        dwarf: &Dwarf,
        just_user_types: bool,
        include_comments: bool,
    ) -> String {
        let mut out = String::new();

        for &id in &self.user_types {
            let ut = arena.get(id);
            if ut.is_class_like() || ut.kind == Some(UserKind::Enum) {
                out.push_str(&ut.declaration_string(arena));
                out.push('\n');
            }
        }
        out.push('\n');

        for &id in &self.user_types {
            let ut = arena.get(id);
            if ut.kind == Some(UserKind::Function) {
                out.push_str(&ut.declaration_string(arena));
                out.push('\n');
            }
        }
        out.push('\n');

        for &id in &self.user_types {
            let ut = arena.get(id);
            if ut.kind == Some(UserKind::Array) {
                out.push_str(&ut.declaration_string(arena));
                out.push('\n');
            }
        }
        out.push('\n');

        for &id in &self.user_types {
            let ut = arena.get(id);
            if ut.is_class_like() || ut.kind == Some(UserKind::Enum) {
                out.push_str(&ut.definition_string(arena, include_comments));
                out.push_str("\n\n");
            }
        }

        if !just_user_types {
            for var in &self.variables {
                out.push_str(&var.declaration_string(arena));
                out.push_str("; // ");
                out.push_str(&var.location_string());
                out.push('\n');
            }
            out.push('\n');

            for fun in &self.functions {
                out.push_str(&fun.declaration_string(arena));
                out.push('\n');
            }
            out.push('\n');

            for fun in &self.functions {
                out.push_str(&fun.definition_string(arena, dwarf));
                out.push_str("\n\n");
            }
        }

        out
    }
}

/// Lowercase hex with a 0x prefix, except a bare `0`; negative values
/// print as unsigned 32-bit, matching the addresses they stand for.
pub fn hex_string(x: i64) -> String {
    if x == 0 {
        "0".to_string()
    } else {
        format!("{:#x}", x as u32)
    }
}

fn comment(text: &str) -> String {
    format!("// {text}\n")
}

fn star_comment(text: &str) -> String {
    format!("/* {text} */")
}

pub fn fundamental_type_name(ft: FundType) -> String {
    match ft {
        DW_FT_CHAR | DW_FT_SIGNED_CHAR => "char".to_string(),
        DW_FT_UNSIGNED_CHAR => "uchar".to_string(),
        DW_FT_SHORT | DW_FT_SIGNED_SHORT => "short".to_string(),
        DW_FT_UNSIGNED_SHORT => "ushort".to_string(),
        DW_FT_INTEGER | DW_FT_SIGNED_INTEGER => "int".to_string(),
        DW_FT_UNSIGNED_INTEGER => "uint".to_string(),
        DW_FT_LONG | DW_FT_SIGNED_LONG => "long".to_string(),
        DW_FT_UNSIGNED_LONG => "ulong".to_string(),
        DW_FT_FLOAT => "float".to_string(),
        DW_FT_DBL_PREC_FLOAT => "double".to_string(),
        DW_FT_EXT_PREC_FLOAT => "long double".to_string(),
        DW_FT_VOID => "void".to_string(),
        DW_FT_BOOLEAN => "bool".to_string(),
        DW_FT_LONG_LONG | DW_FT_SIGNED_LONG_LONG => "long long".to_string(),
        DW_FT_UNSIGNED_LONG_LONG => "unsigned long long".to_string(),
        DW_FT_ULONG_128 => "ulonglong".to_string(),
        other => format!("<unknown fundamental type ({})>", hex_string(other as i64)),
    }
}

pub fn fundamental_type_size(ft: FundType) -> i64 {
    match ft {
        DW_FT_CHAR | DW_FT_SIGNED_CHAR | DW_FT_UNSIGNED_CHAR => 1,
        DW_FT_SHORT | DW_FT_SIGNED_SHORT | DW_FT_UNSIGNED_SHORT => 2,
        DW_FT_INTEGER | DW_FT_SIGNED_INTEGER | DW_FT_UNSIGNED_INTEGER => 4,
        // 8 bytes on the targets this tool reads.
        DW_FT_LONG | DW_FT_SIGNED_LONG | DW_FT_UNSIGNED_LONG => 8,
        DW_FT_FLOAT => 4,
        DW_FT_DBL_PREC_FLOAT => 8,
        DW_FT_EXT_PREC_FLOAT => 8,
        DW_FT_VOID => 4,
        DW_FT_BOOLEAN => 1,
        DW_FT_LONG_LONG | DW_FT_SIGNED_LONG_LONG | DW_FT_UNSIGNED_LONG_LONG | DW_FT_ULONG_128 => 8,
        _ => -1,
    }
}

pub fn modifier_string(m: TypeModifier) -> String {
    match m {
        DW_MOD_CONST => "const".to_string(),
        DW_MOD_POINTER_TO => "*".to_string(),
        DW_MOD_REFERENCE_TO => "&".to_string(),
        DW_MOD_VOLATILE => "volatile".to_string(),
        other => format!("<unknown modifier ({})>", hex_string(other as i64)),
    }
}
