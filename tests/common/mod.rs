#![allow(dead_code)]

use std::collections::HashMap;

use dwarf2cpp::dwarf::{
    DW_AT_BIT_OFFSET, DW_AT_BIT_SIZE, DW_AT_BYTE_SIZE, DW_AT_ELEMENT_LIST, DW_AT_FUND_TYPE,
    DW_AT_LOCATION, DW_AT_LOW_PC, DW_AT_MANGLED_NAME, DW_AT_MOD_FUND_TYPE, DW_AT_MOD_U_D_TYPE,
    DW_AT_NAME, DW_AT_ORDERING, DW_AT_SIBLING, DW_AT_SUBSCR_DATA, DW_AT_USER_DEF_TYPE,
    DW_FMT_ET, DW_FMT_FT_C_C, DW_FT_LONG, DW_OP_ADDR, DW_OP_CONST,
};

/// Raw fragment of a block payload; labels resolve to the u32 offset of
/// the DIE they name once the tree is laid out.
pub enum Part {
    Bytes(Vec<u8>),
    Label(String),
}

pub enum Payload {
    Addr(u32),
    Ref(String),
    Hword(u16),
    Word(u32),
    Str(String),
    Block2(Vec<Part>),
    Block4(Vec<Part>),
}

/// One DIE of a synthetic .debug stream. Sibling attributes are computed
/// automatically from the tree shape.
pub struct DieNode {
    pub tag: u16,
    pub label: Option<String>,
    pub attrs: Vec<(u16, Payload)>,
    pub children: Vec<DieNode>,
}

impl DieNode {
    pub fn new(tag: u16) -> Self {
        Self {
            tag,
            label: None,
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn labeled(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn with(mut self, attr: (u16, Payload)) -> Self {
        self.attrs.push(attr);
        self
    }

    pub fn name(self, name: &str) -> Self {
        self.with((DW_AT_NAME, Payload::Str(name.to_string())))
    }

    pub fn child(mut self, child: DieNode) -> Self {
        self.children.push(child);
        self
    }
}

fn parts_size(parts: &[Part]) -> usize {
    parts
        .iter()
        .map(|p| match p {
            Part::Bytes(b) => b.len(),
            Part::Label(_) => 4,
        })
        .sum()
}

fn payload_size(payload: &Payload) -> usize {
    match payload {
        Payload::Addr(_) | Payload::Ref(_) | Payload::Word(_) => 4,
        Payload::Hword(_) => 2,
        Payload::Str(s) => s.len() + 1,
        Payload::Block2(parts) => 2 + parts_size(parts),
        Payload::Block4(parts) => 4 + parts_size(parts),
    }
}

fn entry_size(node: &DieNode) -> usize {
    // length + tag + implicit sibling attribute + explicit attributes
    4 + 2
        + 6
        + node
            .attrs
            .iter()
            .map(|(_, p)| 2 + payload_size(p))
            .sum::<usize>()
}

fn subtree_size(node: &DieNode) -> usize {
    entry_size(node) + node.children.iter().map(subtree_size).sum::<usize>()
}

fn assign_offsets(node: &DieNode, offset: &mut u32, labels: &mut HashMap<String, u32>) {
    if let Some(label) = &node.label {
        labels.insert(label.clone(), *offset);
    }
    *offset += entry_size(node) as u32;
    for child in &node.children {
        assign_offsets(child, offset, labels);
    }
}

fn emit_parts(parts: &[Part], out: &mut Vec<u8>, labels: &HashMap<String, u32>) {
    for part in parts {
        match part {
            Part::Bytes(b) => out.extend_from_slice(b),
            Part::Label(l) => {
                let offset = labels
                    .get(l)
                    .unwrap_or_else(|| panic!("unknown label '{l}'"));
                out.extend(offset.to_le_bytes());
            }
        }
    }
}

fn emit_payload(payload: &Payload, out: &mut Vec<u8>, labels: &HashMap<String, u32>) {
    match payload {
        Payload::Addr(v) | Payload::Word(v) => out.extend(v.to_le_bytes()),
        Payload::Ref(l) => {
            let offset = labels
                .get(l)
                .unwrap_or_else(|| panic!("unknown label '{l}'"));
            out.extend(offset.to_le_bytes());
        }
        Payload::Hword(v) => out.extend(v.to_le_bytes()),
        Payload::Str(s) => {
            out.extend_from_slice(s.as_bytes());
            out.push(0);
        }
        Payload::Block2(parts) => {
            out.extend((parts_size(parts) as u16).to_le_bytes());
            emit_parts(parts, out, labels);
        }
        Payload::Block4(parts) => {
            out.extend((parts_size(parts) as u32).to_le_bytes());
            emit_parts(parts, out, labels);
        }
    }
}

fn emit_node(node: &DieNode, out: &mut Vec<u8>, labels: &HashMap<String, u32>) {
    let start = out.len();
    let sibling = (start + subtree_size(node)) as u32;
    out.extend((entry_size(node) as u32).to_le_bytes());
    out.extend(node.tag.to_le_bytes());
    out.extend(DW_AT_SIBLING.to_le_bytes());
    out.extend(sibling.to_le_bytes());
    for (name, payload) in &node.attrs {
        out.extend(name.to_le_bytes());
        emit_payload(payload, out, labels);
    }
    for child in &node.children {
        emit_node(child, out, labels);
    }
}

/// Serializes the DIE forest into .debug bytes and returns the label ->
/// offset map for reference checks.
pub fn build_debug(roots: &[DieNode]) -> (Vec<u8>, HashMap<String, u32>) {
    let mut labels = HashMap::new();
    let mut offset = 0u32;
    for root in roots {
        assign_offsets(root, &mut offset, &mut labels);
    }

    let mut out = Vec::new();
    for root in roots {
        emit_node(root, &mut out, &labels);
    }
    (out, labels)
}

/// Serializes .line programs: (base address, [(line, char, delta)]).
pub fn build_lines(programs: &[(u32, Vec<(u32, u16, u32)>)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (base, records) in programs {
        let length = 8 + 10 * records.len() as u32;
        out.extend(length.to_le_bytes());
        out.extend(base.to_le_bytes());
        for (line, char_offset, delta) in records {
            out.extend(line.to_le_bytes());
            out.extend(char_offset.to_le_bytes());
            out.extend(delta.to_le_bytes());
        }
    }
    out
}

// Attribute shorthands for the forms the converter consumes.

pub fn fund(ft: u16) -> (u16, Payload) {
    (DW_AT_FUND_TYPE, Payload::Hword(ft))
}

pub fn udt(label: &str) -> (u16, Payload) {
    (DW_AT_USER_DEF_TYPE, Payload::Ref(label.to_string()))
}

pub fn mod_fund(mods: &[u8], ft: u16) -> (u16, Payload) {
    (
        DW_AT_MOD_FUND_TYPE,
        Payload::Block2(vec![
            Part::Bytes(mods.to_vec()),
            Part::Bytes(ft.to_le_bytes().to_vec()),
        ]),
    )
}

pub fn mod_udt(mods: &[u8], label: &str) -> (u16, Payload) {
    (
        DW_AT_MOD_U_D_TYPE,
        Payload::Block2(vec![
            Part::Bytes(mods.to_vec()),
            Part::Label(label.to_string()),
        ]),
    )
}

pub fn byte_size(n: u32) -> (u16, Payload) {
    (DW_AT_BYTE_SIZE, Payload::Word(n))
}

pub fn bit_offset(n: u16) -> (u16, Payload) {
    (DW_AT_BIT_OFFSET, Payload::Hword(n))
}

pub fn bit_size(n: u32) -> (u16, Payload) {
    (DW_AT_BIT_SIZE, Payload::Word(n))
}

pub fn low_pc(address: u32) -> (u16, Payload) {
    (DW_AT_LOW_PC, Payload::Addr(address))
}

pub fn mangled(name: &str) -> (u16, Payload) {
    (DW_AT_MANGLED_NAME, Payload::Str(name.to_string()))
}

pub fn ordering(value: u16) -> (u16, Payload) {
    (DW_AT_ORDERING, Payload::Hword(value))
}

/// Location expression from (opcode, operand) tuples; None marks the
/// operand-less opcodes.
pub fn location(ops: &[(u8, Option<u32>)]) -> (u16, Payload) {
    let mut bytes = Vec::new();
    for (opcode, operand) in ops {
        bytes.push(*opcode);
        if let Some(value) = operand {
            bytes.extend(value.to_le_bytes());
        }
    }
    (DW_AT_LOCATION, Payload::Block2(vec![Part::Bytes(bytes)]))
}

pub fn loc_addr(address: u32) -> (u16, Payload) {
    location(&[(DW_OP_ADDR, Some(address))])
}

pub fn loc_const(value: u32) -> (u16, Payload) {
    location(&[(DW_OP_CONST, Some(value))])
}

/// Packed enum element list for a given base size.
pub fn element_list(byte_size: usize, items: &[(&str, i64)]) -> (u16, Payload) {
    let mut bytes = Vec::new();
    for (name, value) in items {
        bytes.extend(&value.to_le_bytes()[..byte_size]);
        bytes.extend_from_slice(name.as_bytes());
        bytes.push(0);
    }
    (DW_AT_ELEMENT_LIST, Payload::Block4(vec![Part::Bytes(bytes)]))
}

pub fn subscr(parts: Vec<Part>) -> (u16, Payload) {
    (DW_AT_SUBSCR_DATA, Payload::Block2(parts))
}

/// FMT_FT_C_C record: long index, bounds [0, high].
pub fn fmt_dim_long(high: u32) -> Part {
    let mut bytes = vec![DW_FMT_FT_C_C];
    bytes.extend(DW_FT_LONG.to_le_bytes());
    bytes.extend(0u32.to_le_bytes());
    bytes.extend(high.to_le_bytes());
    Part::Bytes(bytes)
}

/// FMT_ET record embedding a fund_type attribute.
pub fn fmt_et_fund(ft: u16) -> Part {
    let mut bytes = vec![DW_FMT_ET];
    bytes.extend(DW_AT_FUND_TYPE.to_le_bytes());
    bytes.extend(ft.to_le_bytes());
    Part::Bytes(bytes)
}

/// FMT_ET record embedding a mod_u_d_type attribute referencing a label.
pub fn fmt_et_mod_udt(mods: &[u8], label: &str) -> Vec<Part> {
    let mut head = vec![DW_FMT_ET];
    head.extend(DW_AT_MOD_U_D_TYPE.to_le_bytes());
    head.extend(((mods.len() + 4) as u16).to_le_bytes());
    let mut parts = vec![Part::Bytes(head)];
    if !mods.is_empty() {
        parts.push(Part::Bytes(mods.to_vec()));
    }
    parts.push(Part::Label(label.to_string()));
    parts
}
