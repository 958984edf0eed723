use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Context, Result};

use crate::elf::Elf;

pub type DwarfTag = u16;
pub type DwarfAttr = u16;
pub type DwarfForm = u16;
pub type FundType = u16;
pub type TypeModifier = u8;
pub type LocationOpcode = u8;

// DW_TAG_* constants (DWARF 1.1)
pub const DW_TAG_PADDING: DwarfTag = 0x0000;
pub const DW_TAG_ARRAY_TYPE: DwarfTag = 0x0001;
pub const DW_TAG_CLASS_TYPE: DwarfTag = 0x0002;
pub const DW_TAG_ENTRY_POINT: DwarfTag = 0x0003;
pub const DW_TAG_ENUMERATION_TYPE: DwarfTag = 0x0004;
pub const DW_TAG_FORMAL_PARAMETER: DwarfTag = 0x0005;
pub const DW_TAG_GLOBAL_SUBROUTINE: DwarfTag = 0x0006;
pub const DW_TAG_GLOBAL_VARIABLE: DwarfTag = 0x0007;
pub const DW_TAG_LABEL: DwarfTag = 0x000a;
pub const DW_TAG_LEXICAL_BLOCK: DwarfTag = 0x000b;
pub const DW_TAG_LOCAL_VARIABLE: DwarfTag = 0x000c;
pub const DW_TAG_MEMBER: DwarfTag = 0x000d;
pub const DW_TAG_POINTER_TYPE: DwarfTag = 0x000f;
pub const DW_TAG_REFERENCE_TYPE: DwarfTag = 0x0010;
pub const DW_TAG_COMPILE_UNIT: DwarfTag = 0x0011;
pub const DW_TAG_STRING_TYPE: DwarfTag = 0x0012;
pub const DW_TAG_STRUCTURE_TYPE: DwarfTag = 0x0013;
pub const DW_TAG_SUBROUTINE: DwarfTag = 0x0014;
pub const DW_TAG_SUBROUTINE_TYPE: DwarfTag = 0x0015;
pub const DW_TAG_TYPEDEF: DwarfTag = 0x0016;
pub const DW_TAG_UNION_TYPE: DwarfTag = 0x0017;
pub const DW_TAG_UNSPECIFIED_PARAMETERS: DwarfTag = 0x0018;
pub const DW_TAG_VARIANT: DwarfTag = 0x0019;
pub const DW_TAG_COMMON_BLOCK: DwarfTag = 0x001a;
pub const DW_TAG_COMMON_INCLUSION: DwarfTag = 0x001b;
pub const DW_TAG_INHERITANCE: DwarfTag = 0x001c;
pub const DW_TAG_INLINED_SUBROUTINE: DwarfTag = 0x001d;
pub const DW_TAG_MODULE: DwarfTag = 0x001e;
pub const DW_TAG_PTR_TO_MEMBER_TYPE: DwarfTag = 0x001f;
pub const DW_TAG_SET_TYPE: DwarfTag = 0x0020;
pub const DW_TAG_SUBRANGE_TYPE: DwarfTag = 0x0021;
pub const DW_TAG_WITH_STMT: DwarfTag = 0x0022;

// DW_FORM_* constants; a DWARF v1 attribute name carries its form in the
// low nibble.
pub const DW_FORM_ADDR: DwarfForm = 0x1;
pub const DW_FORM_REF: DwarfForm = 0x2;
pub const DW_FORM_BLOCK2: DwarfForm = 0x3;
pub const DW_FORM_BLOCK4: DwarfForm = 0x4;
pub const DW_FORM_DATA2: DwarfForm = 0x5;
pub const DW_FORM_DATA4: DwarfForm = 0x6;
pub const DW_FORM_DATA8: DwarfForm = 0x7;
pub const DW_FORM_STRING: DwarfForm = 0x8;

// DW_AT_* constants (subset used by the converter)
pub const DW_AT_SIBLING: DwarfAttr = 0x0010 | DW_FORM_REF;
pub const DW_AT_LOCATION: DwarfAttr = 0x0020 | DW_FORM_BLOCK2;
pub const DW_AT_NAME: DwarfAttr = 0x0030 | DW_FORM_STRING;
pub const DW_AT_FUND_TYPE: DwarfAttr = 0x0050 | DW_FORM_DATA2;
pub const DW_AT_MOD_FUND_TYPE: DwarfAttr = 0x0060 | DW_FORM_BLOCK2;
pub const DW_AT_USER_DEF_TYPE: DwarfAttr = 0x0070 | DW_FORM_REF;
pub const DW_AT_MOD_U_D_TYPE: DwarfAttr = 0x0080 | DW_FORM_BLOCK2;
pub const DW_AT_ORDERING: DwarfAttr = 0x0090 | DW_FORM_DATA2;
pub const DW_AT_SUBSCR_DATA: DwarfAttr = 0x00a0 | DW_FORM_BLOCK2;
pub const DW_AT_BYTE_SIZE: DwarfAttr = 0x00b0 | DW_FORM_DATA4;
pub const DW_AT_BIT_OFFSET: DwarfAttr = 0x00c0 | DW_FORM_DATA2;
pub const DW_AT_BIT_SIZE: DwarfAttr = 0x00d0 | DW_FORM_DATA4;
pub const DW_AT_ELEMENT_LIST: DwarfAttr = 0x00f0 | DW_FORM_BLOCK4;
pub const DW_AT_STMT_LIST: DwarfAttr = 0x0100 | DW_FORM_DATA4;
pub const DW_AT_LOW_PC: DwarfAttr = 0x0110 | DW_FORM_ADDR;
pub const DW_AT_HIGH_PC: DwarfAttr = 0x0120 | DW_FORM_ADDR;
pub const DW_AT_LANGUAGE: DwarfAttr = 0x0130 | DW_FORM_DATA4;
pub const DW_AT_COMP_DIR: DwarfAttr = 0x01b0 | DW_FORM_STRING;
pub const DW_AT_PRODUCER: DwarfAttr = 0x0250 | DW_FORM_STRING;
// Vendor extension carrying the mangled symbol name of a subroutine.
pub const DW_AT_MANGLED_NAME: DwarfAttr = 0x2000 | DW_FORM_STRING;

// DW_FT_* fundamental type constants
pub const DW_FT_CHAR: FundType = 0x0001;
pub const DW_FT_SIGNED_CHAR: FundType = 0x0002;
pub const DW_FT_UNSIGNED_CHAR: FundType = 0x0003;
pub const DW_FT_SHORT: FundType = 0x0004;
pub const DW_FT_SIGNED_SHORT: FundType = 0x0005;
pub const DW_FT_UNSIGNED_SHORT: FundType = 0x0006;
pub const DW_FT_INTEGER: FundType = 0x0007;
pub const DW_FT_SIGNED_INTEGER: FundType = 0x0008;
pub const DW_FT_UNSIGNED_INTEGER: FundType = 0x0009;
pub const DW_FT_LONG: FundType = 0x000a;
pub const DW_FT_SIGNED_LONG: FundType = 0x000b;
pub const DW_FT_UNSIGNED_LONG: FundType = 0x000c;
pub const DW_FT_POINTER: FundType = 0x000d;
pub const DW_FT_FLOAT: FundType = 0x000e;
pub const DW_FT_DBL_PREC_FLOAT: FundType = 0x000f;
pub const DW_FT_EXT_PREC_FLOAT: FundType = 0x0010;
pub const DW_FT_COMPLEX: FundType = 0x0011;
pub const DW_FT_DBL_PREC_COMPLEX: FundType = 0x0012;
pub const DW_FT_VOID: FundType = 0x0014;
pub const DW_FT_BOOLEAN: FundType = 0x0015;
pub const DW_FT_EXT_PREC_COMPLEX: FundType = 0x0016;
pub const DW_FT_LABEL: FundType = 0x0017;
// GNU extensions
pub const DW_FT_LONG_LONG: FundType = 0x8008;
pub const DW_FT_SIGNED_LONG_LONG: FundType = 0x8108;
pub const DW_FT_UNSIGNED_LONG_LONG: FundType = 0x8208;
// SN Systems 128-bit integer
pub const DW_FT_ULONG_128: FundType = 0x8a10;

// DW_MOD_* type modifier bytes
pub const DW_MOD_POINTER_TO: TypeModifier = 0x01;
pub const DW_MOD_REFERENCE_TO: TypeModifier = 0x02;
pub const DW_MOD_CONST: TypeModifier = 0x03;
pub const DW_MOD_VOLATILE: TypeModifier = 0x04;

// DW_OP_* location expression opcodes
pub const DW_OP_REG: LocationOpcode = 0x01;
pub const DW_OP_BASEREG: LocationOpcode = 0x02;
pub const DW_OP_ADDR: LocationOpcode = 0x03;
pub const DW_OP_CONST: LocationOpcode = 0x04;
pub const DW_OP_DEREF2: LocationOpcode = 0x05;
pub const DW_OP_DEREF4: LocationOpcode = 0x06;
pub const DW_OP_ADD: LocationOpcode = 0x07;

// Array ordering and subscript data formats
pub const DW_ORD_ROW_MAJOR: u16 = 0x0000;
pub const DW_ORD_COL_MAJOR: u16 = 0x0001;

pub const DW_FMT_FT_C_C: u8 = 0x0;
pub const DW_FMT_FT_C_X: u8 = 0x1;
pub const DW_FMT_FT_X_C: u8 = 0x2;
pub const DW_FMT_FT_X_X: u8 = 0x3;
pub const DW_FMT_UT_C_C: u8 = 0x4;
pub const DW_FMT_UT_C_X: u8 = 0x5;
pub const DW_FMT_UT_X_C: u8 = 0x6;
pub const DW_FMT_UT_X_X: u8 = 0x7;
pub const DW_FMT_ET: u8 = 0x8;

#[derive(Clone, Copy)]
pub(crate) struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn advance(&mut self, amount: usize) -> Result<()> {
        if self.pos + amount > self.data.len() {
            bail!("Cursor advanced past end of data");
        }
        self.pos += amount;
        Ok(())
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        if self.pos >= self.data.len() {
            bail!("Unexpected end of data");
        }
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub(crate) fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            bail!("Unexpected end of data while reading bytes");
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.data[start..self.pos])
    }

    pub(crate) fn read_cstr(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        while self.pos < self.data.len() && self.data[self.pos] != 0 {
            self.pos += 1;
        }
        if self.pos >= self.data.len() {
            bail!("Unterminated string in DWARF data");
        }
        let end = self.pos;
        self.pos += 1; // skip null terminator
        Ok(&self.data[start..end])
    }
}

#[derive(Clone, Debug)]
pub enum AttrValue {
    Address(u32),
    Reference(u32),
    Block(Vec<u8>),
    Half(u16),
    Word(u32),
    Double(u64),
    String(String),
}

#[derive(Clone, Debug)]
pub struct Attribute {
    pub name: DwarfAttr,
    pub value: AttrValue,
}

impl Attribute {
    pub fn string(&self) -> Result<&str> {
        match &self.value {
            AttrValue::String(s) => Ok(s),
            _ => bail!("Attribute {:#x} is not a string form", self.name),
        }
    }

    pub fn hword(&self) -> Result<u16> {
        match self.value {
            AttrValue::Half(v) => Ok(v),
            _ => bail!("Attribute {:#x} is not a half-word form", self.name),
        }
    }

    pub fn word(&self) -> Result<u32> {
        match self.value {
            AttrValue::Word(v) => Ok(v),
            _ => bail!("Attribute {:#x} is not a word form", self.name),
        }
    }

    pub fn address(&self) -> Result<u32> {
        match self.value {
            AttrValue::Address(v) => Ok(v),
            _ => bail!("Attribute {:#x} is not an address form", self.name),
        }
    }

    pub fn reference(&self) -> Result<u32> {
        match self.value {
            AttrValue::Reference(v) => Ok(v),
            _ => bail!("Attribute {:#x} is not a reference form", self.name),
        }
    }

    pub fn block(&self) -> Result<&[u8]> {
        match &self.value {
            AttrValue::Block(b) => Ok(b),
            _ => bail!("Attribute {:#x} is not a block form", self.name),
        }
    }
}

/// Decode one attribute at the cursor: a u16 name whose low nibble selects
/// the value encoding. Also used for the attribute embedded in an FMT_ET
/// subscript record.
pub(crate) fn parse_attribute(cur: &mut Cursor) -> Result<Attribute> {
    let name = cur.read_u16()?;
    let value = match name & 0xf {
        DW_FORM_ADDR => AttrValue::Address(cur.read_u32()?),
        DW_FORM_REF => AttrValue::Reference(cur.read_u32()?),
        DW_FORM_BLOCK2 => {
            let size = cur.read_u16()? as usize;
            AttrValue::Block(cur.read_bytes(size)?.to_vec())
        }
        DW_FORM_BLOCK4 => {
            let size = cur.read_u32()? as usize;
            AttrValue::Block(cur.read_bytes(size)?.to_vec())
        }
        DW_FORM_DATA2 => AttrValue::Half(cur.read_u16()?),
        DW_FORM_DATA4 => AttrValue::Word(cur.read_u32()?),
        DW_FORM_DATA8 => AttrValue::Double(cur.read_u64()?),
        DW_FORM_STRING => {
            let bytes = cur.read_cstr()?;
            AttrValue::String(
                String::from_utf8(bytes.to_vec()).context("Invalid UTF-8 in DWARF string")?,
            )
        }
        form => bail!("Unsupported DWARF form {form:#x} in attribute {name:#x}"),
    };
    Ok(Attribute { name, value })
}

#[derive(Clone, Debug)]
pub struct Entry {
    /// Offset of this DIE within the .debug section; references resolve
    /// against this space.
    pub offset: u32,
    pub tag: DwarfTag,
    pub attributes: Vec<Attribute>,
}

impl Entry {
    pub fn attr(&self, name: DwarfAttr) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn contains(&self, name: DwarfAttr) -> bool {
        self.attr(name).is_some()
    }

    pub fn sibling_offset(&self) -> Option<u32> {
        match self.attr(DW_AT_SIBLING)?.value {
            AttrValue::Reference(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_padding(&self) -> bool {
        self.tag == DW_TAG_PADDING
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineEntry {
    pub line: u32,
    /// Character position within the line, -1 when absent.
    pub char_offset: i16,
    /// Code offset from the owning line program's base address.
    pub address_offset: u32,
}

pub struct Dwarf {
    pub entries: Vec<Entry>,
    offset_index: HashMap<u32, usize>,
    line_entries: BTreeMap<u32, Vec<LineEntry>>,
}

impl Dwarf {
    pub fn new(elf: &Elf) -> Result<Self> {
        let debug = elf
            .section_data(".debug")
            .context("Input has no .debug section")?;
        let line = elf.section_data(".line").unwrap_or(&[]);
        Self::from_sections(debug, line)
    }

    /// Parses raw .debug and .line section bytes. The second section may be
    /// empty when the input carries no line records.
    pub fn from_sections(debug: &[u8], line: &[u8]) -> Result<Self> {
        let (entries, offset_index) = parse_entries(debug)?;
        let line_entries = parse_line_table(line)?;
        Ok(Self {
            entries,
            offset_index,
            line_entries,
        })
    }

    pub fn index_from_reference(&self, offset: u32) -> Option<usize> {
        self.offset_index.get(&offset).copied()
    }

    pub fn entry_from_reference(&self, offset: u32) -> Option<&Entry> {
        self.index_from_reference(offset).map(|i| &self.entries[i])
    }

    /// Resolves the sibling link of the entry at `index`. None means the
    /// chain ended: no sibling attribute, or a reference past the section.
    pub fn sibling_index(&self, index: usize) -> Option<usize> {
        let offset = self.entries[index].sibling_offset()?;
        self.index_from_reference(offset)
    }

    pub fn has_line_info(&self) -> bool {
        !self.line_entries.is_empty()
    }

    /// All line records of the line program whose base address is exactly
    /// `address` (the owning function's entry point).
    pub fn line_entries_at(&self, address: u32) -> Option<&[LineEntry]> {
        self.line_entries.get(&address).map(|v| v.as_slice())
    }
}

fn parse_entries(debug: &[u8]) -> Result<(Vec<Entry>, HashMap<u32, usize>)> {
    let mut entries = Vec::new();
    let mut offset_index = HashMap::new();
    let mut cur = Cursor::new(debug);

    while !cur.is_finished() {
        let offset = cur.position() as u32;
        let length = cur
            .read_u32()
            .with_context(|| format!("Truncated DIE length at offset {offset:#x}"))?;

        if (length as usize) < 4 {
            bail!("DIE at offset {offset:#x} has impossible length {length}");
        }

        if length < 8 {
            // Null entry: length only, used as padding and as a sibling
            // chain terminator.
            cur.advance(length as usize - 4)
                .with_context(|| format!("Truncated null DIE at offset {offset:#x}"))?;
            offset_index.insert(offset, entries.len());
            entries.push(Entry {
                offset,
                tag: DW_TAG_PADDING,
                attributes: Vec::new(),
            });
            continue;
        }

        let end = offset as usize + length as usize;
        if end > debug.len() {
            bail!("DIE at offset {offset:#x} extends past end of .debug section");
        }

        let tag = cur.read_u16()?;
        let mut attributes = Vec::new();
        while cur.position() < end {
            let attr = parse_attribute(&mut cur)
                .with_context(|| format!("Bad attribute in DIE at offset {offset:#x}"))?;
            attributes.push(attr);
        }
        if cur.position() != end {
            bail!("Attributes of DIE at offset {offset:#x} overran the entry length");
        }

        offset_index.insert(offset, entries.len());
        entries.push(Entry {
            offset,
            tag,
            attributes,
        });
    }

    Ok((entries, offset_index))
}

/// The .line section is a sequence of line programs, each `u32 total
/// length (self-inclusive), u32 base address, (u32 line, u16 char, u32
/// address delta)*`. Every record is keyed under its program's base
/// address.
fn parse_line_table(data: &[u8]) -> Result<BTreeMap<u32, Vec<LineEntry>>> {
    let mut map: BTreeMap<u32, Vec<LineEntry>> = BTreeMap::new();
    let mut cur = Cursor::new(data);

    while !cur.is_finished() {
        let start = cur.position();
        let length = cur
            .read_u32()
            .with_context(|| format!("Truncated line program length at offset {start:#x}"))?
            as usize;
        if length < 8 {
            bail!("Line program at offset {start:#x} is shorter than its header");
        }
        let end = start + length;
        if end > data.len() {
            bail!("Line program at offset {start:#x} extends past end of .line section");
        }

        let base = cur.read_u32()?;
        let records = map.entry(base).or_default();
        while cur.position() + 10 <= end {
            let line = cur.read_u32()?;
            let char_offset = cur.read_u16()? as i16;
            let address_offset = cur.read_u32()?;
            records.push(LineEntry {
                line,
                char_offset,
                address_offset,
            });
        }
        if cur.position() != end {
            bail!("Line program at offset {start:#x} has trailing bytes");
        }
    }

    Ok(map)
}
