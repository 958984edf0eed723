use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, bail, Context, Result};

use crate::cpp::{
    ArrayData, ClassData, EnumData, EnumElement, File, Function, FunctionData, Inheritance,
    LocationOp, Member, Parameter, Type, TypeArena, TypeBase, UserKind, UserTypeData, UserTypeId,
    Variable,
};
use crate::dwarf::{
    parse_attribute, Attribute, Cursor, Dwarf, DW_AT_BIT_OFFSET, DW_AT_BIT_SIZE, DW_AT_BYTE_SIZE,
    DW_AT_ELEMENT_LIST, DW_AT_FUND_TYPE, DW_AT_LOCATION, DW_AT_LOW_PC, DW_AT_MANGLED_NAME,
    DW_AT_MOD_FUND_TYPE, DW_AT_MOD_U_D_TYPE, DW_AT_NAME, DW_AT_ORDERING, DW_AT_SUBSCR_DATA,
    DW_AT_USER_DEF_TYPE, DW_FMT_ET, DW_FMT_FT_C_C, DW_FT_INTEGER, DW_FT_LONG, DW_FT_UNSIGNED_CHAR,
    DW_FT_UNSIGNED_SHORT, DW_OP_ADD, DW_OP_ADDR, DW_OP_CONST, DW_OP_DEREF2, DW_OP_DEREF4,
    DW_ORD_ROW_MAJOR, DW_TAG_ARRAY_TYPE, DW_TAG_CLASS_TYPE, DW_TAG_COMPILE_UNIT,
    DW_TAG_ENUMERATION_TYPE, DW_TAG_FORMAL_PARAMETER, DW_TAG_GLOBAL_SUBROUTINE,
    DW_TAG_GLOBAL_VARIABLE, DW_TAG_INHERITANCE, DW_TAG_INLINED_SUBROUTINE, DW_TAG_LEXICAL_BLOCK,
    DW_TAG_LOCAL_VARIABLE, DW_TAG_MEMBER, DW_TAG_STRUCTURE_TYPE, DW_TAG_SUBROUTINE,
    DW_TAG_SUBROUTINE_TYPE, DW_TAG_UNION_TYPE,
};

#[derive(Debug)]
pub struct Conversion {
    pub arena: TypeArena,
    pub files: Vec<File>,
}

/// Walks every compile unit of the DIE stream and reconstructs the
/// per-file source model. The first error aborts the whole conversion.
pub fn process_dwarf(dwarf: &Dwarf) -> Result<Conversion> {
    let mut converter = Converter::new(dwarf);
    converter.run()?;
    Ok(Conversion {
        arena: converter.arena,
        files: converter.files,
    })
}

struct Converter<'d> {
    dwarf: &'d Dwarf,
    arena: TypeArena,
    /// DIE offset -> user type shell, shared across compile units so
    /// cross-unit references still resolve.
    type_map: HashMap<u32, UserTypeId>,
    /// Name buckets of the compile unit being decoded.
    name_buckets: BTreeMap<String, Vec<UserTypeId>>,
    files: Vec<File>,
}

const TYPE_TAGS: [u16; 6] = [
    DW_TAG_CLASS_TYPE,
    DW_TAG_STRUCTURE_TYPE,
    DW_TAG_UNION_TYPE,
    DW_TAG_ENUMERATION_TYPE,
    DW_TAG_ARRAY_TYPE,
    DW_TAG_SUBROUTINE_TYPE,
];

fn is_type_attr(name: u16) -> bool {
    matches!(
        name,
        DW_AT_FUND_TYPE | DW_AT_USER_DEF_TYPE | DW_AT_MOD_FUND_TYPE | DW_AT_MOD_U_D_TYPE
    )
}

impl<'d> Converter<'d> {
    fn new(dwarf: &'d Dwarf) -> Self {
        Self {
            dwarf,
            arena: TypeArena::new(),
            type_map: HashMap::new(),
            name_buckets: BTreeMap::new(),
            files: Vec::new(),
        }
    }

    fn run(&mut self) -> Result<()> {
        let dwarf = self.dwarf;
        let mut index = if dwarf.entries.is_empty() {
            None
        } else {
            Some(0)
        };

        while let Some(i) = index {
            if dwarf.entries[i].tag == DW_TAG_COMPILE_UNIT {
                self.process_compile_unit(i)?;
            }
            index = self.next_sibling(i);
        }

        for file_index in 0..self.files.len() {
            self.attach_vtables(file_index);
        }
        Ok(())
    }

    /// Sibling step that refuses to walk backwards, so a malformed
    /// sibling chain cannot loop forever.
    fn next_sibling(&self, index: usize) -> Option<usize> {
        match self.dwarf.sibling_index(index) {
            Some(next) if next > index => Some(next),
            _ => None,
        }
    }

    fn child_range_end(&self, index: usize) -> usize {
        self.dwarf
            .sibling_index(index)
            .unwrap_or(self.dwarf.entries.len())
    }

    fn process_compile_unit(&mut self, cu_index: usize) -> Result<()> {
        let dwarf = self.dwarf;
        self.name_buckets.clear();

        let entry = &dwarf.entries[cu_index];
        let filename = match entry.attr(DW_AT_NAME) {
            Some(attr) => attr.string()?.to_string(),
            None => String::new(),
        };

        // Compile units sharing a filename merge into one output file.
        let file_index = match self.files.iter().position(|f| f.filename == filename) {
            Some(i) => i,
            None => {
                self.files.push(File::new(filename.clone()));
                self.files.len() - 1
            }
        };

        let end = self.child_range_end(cu_index);

        // Pass 1: allocate a shell for every type-bearing child so
        // forward references resolve during pass 2.
        let mut i = cu_index + 1;
        while i < end {
            let e = &dwarf.entries[i];
            if TYPE_TAGS.contains(&e.tag) {
                let id = self.arena.alloc();
                self.type_map.insert(e.offset, id);
            }
            match self.next_sibling(i) {
                Some(n) => i = n,
                None => break,
            }
        }

        // Pass 2: decode everything.
        let mut i = cu_index + 1;
        while i < end {
            let e = &dwarf.entries[i];
            match e.tag {
                DW_TAG_GLOBAL_VARIABLE | DW_TAG_LOCAL_VARIABLE => {
                    let var = self
                        .decode_variable(i)
                        .with_context(|| format!("In compile unit '{filename}'"))?;
                    self.files[file_index].variables.push(var);
                }
                tag if TYPE_TAGS.contains(&tag) => {
                    let id = *self
                        .type_map
                        .get(&e.offset)
                        .ok_or_else(|| anyhow!("Missing type shell for DIE {:#x}", e.offset))?;
                    self.decode_user_type(i, id)
                        .with_context(|| format!("In compile unit '{filename}'"))?;

                    let index = self.files[file_index].user_types.len();
                    self.arena.get_mut(id).index = index;
                    self.files[file_index].user_types.push(id);

                    let name = self.arena.get(id).name.clone();
                    self.name_buckets.entry(name).or_default().push(id);
                }
                DW_TAG_GLOBAL_SUBROUTINE | DW_TAG_SUBROUTINE | DW_TAG_INLINED_SUBROUTINE => {
                    let mut fun = Function {
                        signature: self
                            .decode_subroutine_type(i)
                            .with_context(|| format!("In compile unit '{filename}'"))?,
                        ..Function::default()
                    };
                    self.decode_function(i, file_index, &mut fun)
                        .with_context(|| format!("In compile unit '{filename}'"))?;
                    self.files[file_index].functions.push(fun);
                }
                _ => {}
            }
            match self.next_sibling(i) {
                Some(n) => i = n,
                None => break,
            }
        }

        self.fix_user_type_names();
        self.sort_functions(file_index);
        Ok(())
    }

    /// Empty names become `type`; duplicated names get a positional
    /// suffix. Runs on the buckets gathered while decoding this unit.
    fn fix_user_type_names(&mut self) {
        for (name, ids) in &self.name_buckets {
            let noname = name.is_empty();
            let duplicate = ids.len() > 1;
            if !noname && !duplicate {
                continue;
            }
            for (i, &id) in ids.iter().enumerate() {
                let ut = self.arena.get_mut(id);
                if noname {
                    ut.name = "type".to_string();
                }
                if duplicate {
                    ut.name.push_str(&format!("_{i}"));
                }
            }
        }
    }

    /// With line information the functions sort by first source line
    /// (line-less functions at the end, by start address) and the list
    /// is reversed so emission runs top to bottom. Without line
    /// information the compile unit order stands.
    fn sort_functions(&mut self, file_index: usize) {
        let dwarf = self.dwarf;
        if !dwarf.has_line_info() {
            return;
        }
        let functions = &mut self.files[file_index].functions;
        functions.sort_by(|a, b| compare_by_line(dwarf, a, b));
        functions.reverse();
    }

    fn resolve_type_ref(&self, offset: u32) -> Result<UserTypeId> {
        self.type_map
            .get(&offset)
            .copied()
            .ok_or_else(|| anyhow!("Unresolved type reference {offset:#x}"))
    }

    fn decode_type_attr(&self, attr: &Attribute) -> Result<Type> {
        match attr.name {
            DW_AT_FUND_TYPE => Ok(Type::fundamental(attr.hword()?)),
            DW_AT_USER_DEF_TYPE => Ok(Type::user(self.resolve_type_ref(attr.reference()?)?)),
            DW_AT_MOD_FUND_TYPE => {
                let block = attr.block()?;
                if block.len() < 2 {
                    bail!(
                        "Malformed mod_fund_type block: {} bytes is shorter than the trailing type",
                        block.len()
                    );
                }
                let (mods, tail) = block.split_at(block.len() - 2);
                let ft = u16::from_le_bytes([tail[0], tail[1]]);
                Ok(Type {
                    base: TypeBase::Fundamental(ft),
                    modifiers: mods.to_vec(),
                })
            }
            DW_AT_MOD_U_D_TYPE => {
                let block = attr.block()?;
                if block.len() < 4 {
                    bail!(
                        "Malformed mod_u_d_type block: {} bytes is shorter than the trailing reference",
                        block.len()
                    );
                }
                let (mods, tail) = block.split_at(block.len() - 4);
                let reference = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
                Ok(Type {
                    base: TypeBase::User(self.resolve_type_ref(reference)?),
                    modifiers: mods.to_vec(),
                })
            }
            other => bail!("Attribute {other:#x} is not a type attribute"),
        }
    }

    /// Full location expression: (opcode, value) tuples, -1 standing in
    /// for the operand-less opcodes.
    fn decode_location_ops(&self, block: &[u8]) -> Result<Vec<LocationOp>> {
        let mut cur = Cursor::new(block);
        let mut ops = Vec::new();
        while !cur.is_finished() {
            let opcode = cur.read_u8()?;
            let value = if opcode == DW_OP_DEREF2 || opcode == DW_OP_DEREF4 || opcode == DW_OP_ADD
            {
                -1
            } else {
                cur.read_u32().context("Truncated location expression")? as i64
            };
            ops.push(LocationOp { opcode, value });
        }
        Ok(ops)
    }

    /// Member and base-class offsets must reduce to a static value right
    /// at the front of the expression.
    fn decode_static_location(&self, attr: &Attribute) -> Result<i64> {
        let block = attr.block()?;
        let mut cur = Cursor::new(block);
        let opcode = cur.read_u8().context("Empty location expression")?;
        if opcode == DW_OP_ADDR || opcode == DW_OP_CONST {
            Ok(cur.read_u32().context("Truncated location expression")? as i64)
        } else {
            bail!("Location expression does not start with a static address (opcode {opcode:#x})");
        }
    }

    fn decode_variable(&self, index: usize) -> Result<Variable> {
        let dwarf = self.dwarf;
        let entry = &dwarf.entries[index];
        let mut var = Variable {
            is_global: entry.tag == DW_TAG_GLOBAL_VARIABLE,
            ..Variable::default()
        };

        for attr in &entry.attributes {
            match attr.name {
                DW_AT_NAME => var.name = attr.string()?.to_string(),
                DW_AT_LOCATION => {
                    var.location_ops = self.decode_location_ops(attr.block()?).with_context(
                        || format!("Bad location expression for variable '{}'", var.name),
                    )?;
                    // The last static opcode wins; register-relative
                    // locations leave the address at -1.
                    var.address = -1;
                    for op in &var.location_ops {
                        if op.opcode == DW_OP_ADDR || op.opcode == DW_OP_CONST {
                            var.address = op.value;
                        }
                    }
                }
                name if is_type_attr(name) => {
                    var.typ = self
                        .decode_type_attr(attr)
                        .with_context(|| format!("Bad type for variable '{}'", var.name))?;
                }
                _ => {}
            }
        }
        Ok(var)
    }

    fn decode_user_type(&mut self, index: usize, id: UserTypeId) -> Result<()> {
        let dwarf = self.dwarf;
        let entry = &dwarf.entries[index];

        let mut name = String::new();
        if let Some(attr) = entry.attr(DW_AT_NAME) {
            name = attr.string()?.replace('@', "_");
        }
        self.arena.get_mut(id).name = name.clone();

        match entry.tag {
            DW_TAG_CLASS_TYPE | DW_TAG_STRUCTURE_TYPE | DW_TAG_UNION_TYPE => {
                let kind = match entry.tag {
                    DW_TAG_STRUCTURE_TYPE => UserKind::Struct,
                    DW_TAG_UNION_TYPE => UserKind::Union,
                    _ => UserKind::Class,
                };
                let body = self
                    .decode_class_type(index)
                    .with_context(|| format!("Failed to decode class type '{name}'"))?;
                let ut = self.arena.get_mut(id);
                ut.kind = Some(kind);
                ut.data = UserTypeData::Class(body);
            }
            DW_TAG_ENUMERATION_TYPE => {
                let body = self
                    .decode_enum_type(index)
                    .with_context(|| format!("Failed to decode enum type '{name}'"))?;
                let ut = self.arena.get_mut(id);
                ut.kind = Some(UserKind::Enum);
                ut.data = UserTypeData::Enum(body);
            }
            DW_TAG_ARRAY_TYPE => {
                let body = self
                    .decode_array_type(index)
                    .with_context(|| format!("Failed to decode array type '{name}'"))?;
                let ut = self.arena.get_mut(id);
                ut.kind = Some(UserKind::Array);
                ut.data = UserTypeData::Array(body);
            }
            DW_TAG_SUBROUTINE_TYPE => {
                let body = self
                    .decode_subroutine_type(index)
                    .with_context(|| format!("Failed to decode subroutine type '{name}'"))?;
                let ut = self.arena.get_mut(id);
                ut.kind = Some(UserKind::Function);
                ut.data = UserTypeData::Function(body);
            }
            other => bail!("DIE tag {other:#x} is not a user type"),
        }
        Ok(())
    }

    fn decode_class_type(&self, index: usize) -> Result<ClassData> {
        let dwarf = self.dwarf;
        let entry = &dwarf.entries[index];
        let mut class = ClassData::default();

        if let Some(attr) = entry.attr(DW_AT_BYTE_SIZE) {
            class.size = attr.word()? as i64;
        }

        let end = self.child_range_end(index);

        // One cheap scan up front so the member list allocates once.
        let mut member_count = 0;
        let mut i = index + 1;
        while i < end {
            if dwarf.entries[i].tag == DW_TAG_MEMBER {
                member_count += 1;
            }
            match self.next_sibling(i) {
                Some(n) => i = n,
                None => break,
            }
        }
        class.members = Vec::with_capacity(member_count);

        let mut i = index + 1;
        while i < end {
            match dwarf.entries[i].tag {
                DW_TAG_MEMBER => class.members.push(self.decode_member(i)?),
                DW_TAG_INHERITANCE => class.inheritances.push(self.decode_inheritance(i)?),
                _ => {}
            }
            match self.next_sibling(i) {
                Some(n) => i = n,
                None => break,
            }
        }
        Ok(class)
    }

    fn decode_member(&self, index: usize) -> Result<Member> {
        let entry = &self.dwarf.entries[index];
        let mut member = Member::default();

        for attr in &entry.attributes {
            match attr.name {
                DW_AT_NAME => member.name = attr.string()?.to_string(),
                DW_AT_BIT_OFFSET => member.bit_offset = attr.hword()? as i64,
                DW_AT_BIT_SIZE => member.bit_size = attr.word()? as i64,
                DW_AT_LOCATION => {
                    member.offset = self
                        .decode_static_location(attr)
                        .with_context(|| format!("Bad offset for member '{}'", member.name))?;
                }
                name if is_type_attr(name) => {
                    member.typ = self
                        .decode_type_attr(attr)
                        .with_context(|| format!("Bad type for member '{}'", member.name))?;
                }
                _ => {}
            }
        }
        Ok(member)
    }

    fn decode_inheritance(&self, index: usize) -> Result<Inheritance> {
        let entry = &self.dwarf.entries[index];
        let mut inheritance = Inheritance::default();

        for attr in &entry.attributes {
            match attr.name {
                DW_AT_USER_DEF_TYPE => {
                    inheritance.typ = self
                        .decode_type_attr(attr)
                        .context("Bad base class type in inheritance record")?;
                }
                DW_AT_LOCATION => {
                    inheritance.offset = self
                        .decode_static_location(attr)
                        .context("Bad base class offset in inheritance record")?;
                }
                _ => {}
            }
        }
        Ok(inheritance)
    }

    fn decode_enum_type(&self, index: usize) -> Result<EnumData> {
        let entry = &self.dwarf.entries[index];
        let mut data = EnumData::default();
        let mut byte_size: i64 = 0;

        if let Some(attr) = entry.attr(DW_AT_BYTE_SIZE) {
            byte_size = attr.word()? as i64;
            data.base = match byte_size {
                1 => DW_FT_UNSIGNED_CHAR,
                2 => DW_FT_UNSIGNED_SHORT,
                4 => DW_FT_INTEGER,
                8 => DW_FT_LONG,
                other => bail!("Unsupported enum base type size {other}"),
            };
        }

        if let Some(attr) = entry.attr(DW_AT_ELEMENT_LIST) {
            if !matches!(byte_size, 1 | 2 | 4 | 8) {
                bail!("Enum element list without a usable byte size ({byte_size})");
            }
            self.decode_element_list(attr.block()?, byte_size, &mut data)?;
        }
        Ok(data)
    }

    /// Packed (value, NUL-terminated name) pairs; 1- and 2-byte values
    /// read unsigned, 4- and 8-byte values signed.
    fn decode_element_list(&self, block: &[u8], byte_size: i64, data: &mut EnumData) -> Result<()> {
        let mut cur = Cursor::new(block);
        while !cur.is_finished() {
            let value = match byte_size {
                1 => cur.read_u8()? as i64,
                2 => cur.read_u16()? as i64,
                4 => cur.read_u32()? as i32 as i64,
                8 => cur.read_u64()? as i64,
                other => bail!("Unsupported enum base type size {other}"),
            };
            let name = String::from_utf8(cur.read_cstr()?.to_vec())
                .context("Invalid UTF-8 in enum element name")?;
            data.elements.push(EnumElement { name, value });
        }
        Ok(())
    }

    fn decode_array_type(&self, index: usize) -> Result<ArrayData> {
        let entry = &self.dwarf.entries[index];
        let mut array = ArrayData::default();

        for attr in &entry.attributes {
            match attr.name {
                DW_AT_ORDERING => {
                    let ordering = attr.hword()?;
                    if ordering != DW_ORD_ROW_MAJOR {
                        bail!("Unsupported array ordering {ordering:#x}");
                    }
                }
                DW_AT_SUBSCR_DATA => {
                    self.decode_subscript_data(attr.block()?, &mut array)?;
                }
                _ => {}
            }
        }
        Ok(array)
    }

    /// Dimension records prefixed by a format byte; an FMT_ET record
    /// carries the element type attribute and ends the block.
    fn decode_subscript_data(&self, block: &[u8], array: &mut ArrayData) -> Result<()> {
        let mut cur = Cursor::new(block);
        while !cur.is_finished() {
            let format = cur.read_u8()?;
            if format == DW_FMT_ET {
                let attr = parse_attribute(&mut cur)
                    .context("Malformed element type record in subscript data")?;
                array.element = self.decode_type_attr(&attr)?;
                break;
            } else if format == DW_FMT_FT_C_C {
                let fund = cur.read_u16()?;
                // Only constant long bounds starting at zero occur in
                // the inputs this tool supports.
                if fund != DW_FT_LONG {
                    bail!("Unsupported subscript index type {fund:#x}");
                }
                let low = cur.read_u32()?;
                if low != 0 {
                    bail!("Subscript lower bound {low:#x} is not zero");
                }
                let high = cur.read_u32()?;
                array.dimensions.push(high as i64 + 1);
            } else {
                bail!("Unsupported subscript data format {format:#x}");
            }
        }
        Ok(())
    }

    fn decode_subroutine_type(&self, index: usize) -> Result<FunctionData> {
        let dwarf = self.dwarf;
        let entry = &dwarf.entries[index];
        let mut data = FunctionData::default();

        let end = self.child_range_end(index);

        let mut param_count = 0;
        let mut i = index + 1;
        while i < end {
            if dwarf.entries[i].tag == DW_TAG_FORMAL_PARAMETER {
                param_count += 1;
            }
            match self.next_sibling(i) {
                Some(n) => i = n,
                None => break,
            }
        }
        data.parameters = Vec::with_capacity(param_count);

        for attr in &entry.attributes {
            if is_type_attr(attr.name) {
                data.return_type = self
                    .decode_type_attr(attr)
                    .context("Bad subroutine return type")?;
            }
        }

        let mut i = index + 1;
        while i < end {
            if dwarf.entries[i].tag == DW_TAG_FORMAL_PARAMETER {
                data.parameters.push(self.decode_parameter(i)?);
            }
            match self.next_sibling(i) {
                Some(n) => i = n,
                None => break,
            }
        }
        Ok(data)
    }

    fn decode_parameter(&self, index: usize) -> Result<Parameter> {
        let entry = &self.dwarf.entries[index];
        let mut param = Parameter::default();

        for attr in &entry.attributes {
            match attr.name {
                DW_AT_NAME => param.name = attr.string()?.to_string(),
                name if is_type_attr(name) => {
                    param.typ = self
                        .decode_type_attr(attr)
                        .with_context(|| format!("Bad type for parameter '{}'", param.name))?;
                }
                _ => {}
            }
        }
        Ok(param)
    }

    fn decode_function(
        &mut self,
        index: usize,
        file_index: usize,
        fun: &mut Function,
    ) -> Result<()> {
        let dwarf = self.dwarf;
        let entry = &dwarf.entries[index];
        fun.is_global = entry.tag == DW_TAG_GLOBAL_SUBROUTINE;

        for attr in &entry.attributes {
            match attr.name {
                DW_AT_NAME => fun.name = attr.string()?.to_string(),
                DW_AT_MANGLED_NAME => fun.mangled_name = attr.string()?.to_string(),
                DW_AT_LOW_PC => fun.start_address = attr.address()?,
                _ => {}
            }
        }

        let end = self.child_range_end(index);
        let mut i = index + 1;
        while i < end {
            if dwarf.entries[i].tag == DW_TAG_LEXICAL_BLOCK {
                self.decode_lexical_block(i, fun)
                    .with_context(|| format!("In function '{}'", fun.name))?;
            }
            match self.next_sibling(i) {
                Some(n) => i = n,
                None => break,
            }
        }

        self.attach_method(file_index, fun);
        Ok(())
    }

    /// Collects the block's variables into the function's flat locals
    /// list, descending into nested blocks.
    fn decode_lexical_block(&self, index: usize, fun: &mut Function) -> Result<()> {
        let dwarf = self.dwarf;
        let end = self.child_range_end(index);

        let mut i = index + 1;
        while i < end {
            match dwarf.entries[i].tag {
                DW_TAG_GLOBAL_VARIABLE | DW_TAG_LOCAL_VARIABLE => {
                    fun.locals.push(self.decode_variable(i)?);
                }
                DW_TAG_LEXICAL_BLOCK => self.decode_lexical_block(i, fun)?,
                _ => {}
            }
            match self.next_sibling(i) {
                Some(n) => i = n,
                None => break,
            }
        }
        Ok(())
    }

    /// Recovers the owning class of a free-floating subroutine DIE: a
    /// leading `this` parameter names it directly, otherwise the
    /// `__<len><name>F` fragment of the mangled name is matched against
    /// the current unit's user types.
    fn attach_method(&mut self, file_index: usize, fun: &mut Function) {
        let dwarf = self.dwarf;
        fun.owner = None;

        let this_owner = fun.signature.parameters.first().and_then(|p| {
            if p.name != "this" {
                return None;
            }
            match p.typ.base {
                TypeBase::User(id) if self.arena.get(id).class_data().is_some() => Some(id),
                _ => None,
            }
        });

        if let Some(owner) = this_owner {
            fun.signature.parameters.remove(0);
            fun.owner = Some(owner);
            let method = fun.clone();
            if let Some(class) = self.arena.get_mut(owner).class_data_mut() {
                class.methods.push(method);
            }
            return;
        }

        if fun.mangled_name.len() <= 2 {
            return;
        }
        let Some(class_name) = mangled_class_name(&fun.mangled_name) else {
            return;
        };

        let matches: Vec<UserTypeId> = self.files[file_index]
            .user_types
            .iter()
            .copied()
            .filter(|&id| self.arena.get(id).name == class_name)
            .collect();

        match matches.len() {
            0 => {}
            1 => {
                let owner = matches[0];
                fun.owner = Some(owner);
                let method = fun.clone();
                if let Some(class) = self.arena.get_mut(owner).class_data_mut() {
                    class.methods.push(method);
                    if dwarf.has_line_info() {
                        class.methods.sort_by(|a, b| compare_by_line(dwarf, a, b));
                    }
                }
            }
            n => eprintln!(
                "warning: mangled name '{}' matches {n} user types named '{class_name}'; \
                 not attaching the method",
                fun.mangled_name
            ),
        }
    }

    /// Binds `__vt__<len><name>` globals to every class of that name:
    /// the variable's static address becomes the vtable address and the
    /// size of the variable's own type body becomes the vtable size.
    fn attach_vtables(&mut self, file_index: usize) {
        let vtables: Vec<(i64, Option<UserTypeId>, String)> = self.files[file_index]
            .variables
            .iter()
            .filter_map(|var| {
                let class_name = vtable_class_name(&var.name)?;
                let type_id = match var.typ.base {
                    TypeBase::User(id) => Some(id),
                    TypeBase::Fundamental(_) => None,
                };
                Some((var.address, type_id, class_name))
            })
            .collect();

        for (address, type_id, class_name) in vtables {
            let vtable_size =
                type_id.and_then(|id| self.arena.get(id).class_data().map(|c| c.size));

            let targets: Vec<UserTypeId> = (0..self.arena.len())
                .filter(|&id| self.arena.get(id).name == class_name)
                .collect();
            for id in targets {
                if let Some(class) = self.arena.get_mut(id).class_data_mut() {
                    class.vtable = address;
                    if let Some(size) = vtable_size {
                        class.vtable_size = size;
                    }
                }
            }
        }
    }
}

/// Total order on functions for source ordering: first line number
/// descending, functions without line records after all others, tied by
/// start address.
fn compare_by_line(dwarf: &Dwarf, a: &Function, b: &Function) -> Ordering {
    let line_a = first_line(dwarf, a);
    let line_b = first_line(dwarf, b);
    match (line_a, line_b) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.start_address.cmp(&b.start_address),
    }
}

fn first_line(dwarf: &Dwarf, fun: &Function) -> Option<u32> {
    dwarf
        .line_entries_at(fun.start_address)
        .and_then(|lines| lines.first())
        .map(|entry| entry.line)
}

/// `__vt__3Foo` -> `Foo`. The length prefix is clamped to what is
/// actually there, as the producers sometimes truncate.
fn vtable_class_name(name: &str) -> Option<String> {
    let rest = name.strip_prefix("__vt__")?;
    parse_length_prefixed(rest)
}

/// `…__3FooFi` -> `Foo`: decimal digits after the last underscore give
/// the class name length, and the character after the name must be 'F'
/// (the argument list marker).
fn mangled_class_name(mangled: &str) -> Option<String> {
    let pos = mangled.rfind('_')?;
    let rest = &mangled[pos + 1..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let len: usize = digits.parse().ok()?;
    let rest = &rest[digits.len()..];
    if rest.len() < len + 1 || rest.as_bytes()[len] != b'F' {
        return None;
    }
    Some(rest[..len].to_string())
}

fn parse_length_prefixed(rest: &str) -> Option<String> {
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let len: usize = digits.parse().ok()?;
    let rest = &rest[digits.len()..];
    let take = len.min(rest.len());
    Some(rest[..take].to_string())
}
