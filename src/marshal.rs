//! An in-memory `Encoder`/`Decoder` pair and the `Marshal` implementations
//! for the core types that expose encode(encoder)/decode(decoder)
//! contracts. The wire format itself is out of scope; this module exists
//! to let `decode(encode(t)) == t` be checked without a concrete XML
//! dependency, keeping marshalling behind a narrow trait rather than a
//! concrete format.

use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::external::{Decoder, Encoder};
use crate::opcode::OpCode;
use crate::pcodeop::{OpId, PcodeOp, PrimaryFlags, SecondaryFlags, SeqNum};
use crate::space::{Address, SpaceIndex};
use crate::types::{
    Datatype, DatatypeFlags, DisplayFormat, EnumBody, Field, MetaType, StructBody, SubMetaType, TypeId, TypeVariant,
    UnionBody,
};
use crate::varnode::VarnodeId;

/// One element as it accumulates in memory: a tag, its attributes, and its
/// children in encounter order.
#[derive(Debug, Clone, Default)]
struct Element {
    tag: String,
    attrs: HashMap<String, String>,
    unsigned_attrs: HashMap<String, u64>,
    children: Vec<Element>,
}

/// Builds a tree of [`Element`]s via the stack discipline `open_element` /
/// `close_element` implies: each `close_element` pops the current element
/// and appends it to its parent's children (or, at depth zero, to `roots`).
#[derive(Debug, Default)]
pub struct InMemoryEncoder {
    roots: Vec<Element>,
    stack: Vec<Element>,
}

impl InMemoryEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands the single top-level element produced to a fresh decoder.
    /// Panics if `close_element` wasn't balanced with every `open_element`,
    /// or if more than one top-level element was written.
    pub fn into_decoder(mut self) -> InMemoryDecoder {
        assert!(self.stack.is_empty(), "unbalanced open_element/close_element");
        assert_eq!(self.roots.len(), 1, "expected exactly one top-level element");
        InMemoryDecoder::new(self.roots.remove(0))
    }
}

impl Encoder for InMemoryEncoder {
    fn open_element(&mut self, tag: &str) -> Result<()> {
        self.stack.push(Element { tag: tag.to_string(), ..Default::default() });
        Ok(())
    }

    fn close_element(&mut self, tag: &str) -> Result<()> {
        let el = self.stack.pop().ok_or_else(|| anyhow!("close_element({tag}) with no open element"))?;
        if el.tag != tag {
            return Err(anyhow!("close_element({tag}) does not match open element {}", el.tag));
        }
        match self.stack.last_mut() {
            Some(parent) => parent.children.push(el),
            None => self.roots.push(el),
        }
        Ok(())
    }

    fn write_attribute(&mut self, name: &str, value: &str) -> Result<()> {
        let el = self.stack.last_mut().ok_or_else(|| anyhow!("write_attribute({name}) outside any element"))?;
        el.attrs.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn write_unsigned_attribute(&mut self, name: &str, value: u64) -> Result<()> {
        let el = self.stack.last_mut().ok_or_else(|| anyhow!("write_unsigned_attribute({name}) outside any element"))?;
        el.unsigned_attrs.insert(name.to_string(), value);
        Ok(())
    }
}

/// Walks an [`Element`] tree with the same stack discipline the encoder
/// built it under. `open_element` descends into the next unread child;
/// `close_element` ascends back to the parent.
pub struct InMemoryDecoder {
    stack: Vec<(Element, usize)>,
}

impl InMemoryDecoder {
    fn new(root: Element) -> Self {
        Self { stack: vec![(root, 0)] }
    }

    fn current(&self) -> Result<&Element> {
        self.stack.last().map(|(el, _)| el).ok_or_else(|| anyhow!("read outside any element"))
    }
}

impl Decoder for InMemoryDecoder {
    fn open_element(&mut self) -> Result<String> {
        let (parent, idx) = self.stack.last_mut().ok_or_else(|| anyhow!("open_element with no current element"))?;
        let child = parent.children.get(*idx).cloned().ok_or_else(|| anyhow!("no more children to open"))?;
        *idx += 1;
        let tag = child.tag.clone();
        self.stack.push((child, 0));
        Ok(tag)
    }

    fn close_element(&mut self) -> Result<()> {
        self.stack.pop().ok_or_else(|| anyhow!("close_element with no open element"))?;
        Ok(())
    }

    fn read_attribute(&mut self, name: &str) -> Result<Option<String>> {
        Ok(self.current()?.attrs.get(name).cloned())
    }

    fn read_unsigned_attribute(&mut self, name: &str) -> Result<Option<u64>> {
        Ok(self.current()?.unsigned_attrs.get(name).copied())
    }
}

fn require_unsigned(d: &mut dyn Decoder, name: &str) -> Result<u64> {
    d.read_unsigned_attribute(name)?.ok_or_else(|| anyhow!("missing unsigned attribute {name}"))
}

fn require_string(d: &mut dyn Decoder, name: &str) -> Result<String> {
    d.read_attribute(name)?.ok_or_else(|| anyhow!("missing attribute {name}"))
}

fn meta_tag(m: MetaType) -> u64 {
    m as u64
}

const META_ORDER: &[MetaType] = &[
    MetaType::Void,
    MetaType::Bool,
    MetaType::Int,
    MetaType::Uint,
    MetaType::Float,
    MetaType::Char,
    MetaType::Code,
    MetaType::Ptr,
    MetaType::PtrRel,
    MetaType::Array,
    MetaType::Struct,
    MetaType::Union,
    MetaType::Enum,
    MetaType::PartialStruct,
    MetaType::PartialUnion,
    MetaType::PartialEnum,
    MetaType::Spacebase,
    MetaType::Unknown,
];

fn meta_from_tag(tag: u64) -> Result<MetaType> {
    META_ORDER.get(tag as usize).copied().ok_or_else(|| anyhow!("unknown metatype tag {tag}"))
}

/// `sub_meta` is a pure function of `meta` (`Datatype::sub_meta_for`) except
/// that `Ptr`/`PtrRel` both map to `SubPtr` and the three partial variants
/// all map to `SubPartial`; encoding `meta` alone and recomputing
/// `sub_meta_for` on decode loses that, so for `Ptr`-vs-`PtrRel` and the
/// three partials we additionally encode the `TypeVariant` discriminant,
/// which already disambiguates them.
impl crate::external::Marshal for Datatype {
    fn encode(&self, e: &mut dyn Encoder) -> Result<()> {
        e.open_element("datatype")?;
        e.write_unsigned_attribute("meta", meta_tag(self.meta))?;
        e.write_unsigned_attribute("size", self.size as u64)?;
        e.write_unsigned_attribute("alignment", self.alignment as u64)?;
        e.write_unsigned_attribute("id", self.id)?;
        if let Some(name) = &self.name {
            e.write_attribute("name", name)?;
        }
        if let Some(target) = self.typedef_target {
            e.write_unsigned_attribute("typedef_target", target.0 as u64)?;
        }
        e.write_unsigned_attribute("flags", self.flags.into_raw() as u64)?;
        if let Some(format) = self.display_format {
            e.write_unsigned_attribute("display_format", display_format_tag(format))?;
        }
        encode_variant(&self.variant, e)?;
        e.close_element("datatype")?;
        Ok(())
    }

    fn decode(d: &mut dyn Decoder) -> Result<Self> {
        let tag = d.open_element()?;
        if tag != "datatype" {
            return Err(anyhow!("expected <datatype>, found <{tag}>"));
        }
        let meta = meta_from_tag(require_unsigned(d, "meta")?)?;
        let size = require_unsigned(d, "size")? as u32;
        let alignment = require_unsigned(d, "alignment")? as u32;
        let id = require_unsigned(d, "id")?;
        let name = d.read_attribute("name")?;
        let typedef_target = d.read_unsigned_attribute("typedef_target")?.map(|v| TypeId(v as u32));
        let flags = DatatypeFlags::from_raw(require_unsigned(d, "flags")? as u32)?;
        let display_format = d.read_unsigned_attribute("display_format")?.map(display_format_from_tag).transpose()?;
        let variant = decode_variant(d)?;
        d.close_element()?;
        Ok(Datatype {
            meta,
            sub_meta: Datatype::sub_meta_for(meta),
            size,
            alignment,
            id,
            name,
            typedef_target,
            flags,
            variant,
            display_format,
        })
    }
}

fn display_format_tag(format: DisplayFormat) -> u64 {
    match format {
        DisplayFormat::Hex => 0,
        DisplayFormat::Dec => 1,
        DisplayFormat::Oct => 2,
        DisplayFormat::Bin => 3,
        DisplayFormat::Char => 4,
    }
}

fn display_format_from_tag(tag: u64) -> Result<DisplayFormat> {
    match tag {
        0 => Ok(DisplayFormat::Hex),
        1 => Ok(DisplayFormat::Dec),
        2 => Ok(DisplayFormat::Oct),
        3 => Ok(DisplayFormat::Bin),
        4 => Ok(DisplayFormat::Char),
        _ => Err(anyhow!("unknown display_format tag {tag}")),
    }
}

fn encode_field(f: &Field, e: &mut dyn Encoder) -> Result<()> {
    e.open_element("field")?;
    e.write_unsigned_attribute("offset", f.offset as u64)?;
    e.write_attribute("name", &f.name)?;
    e.write_unsigned_attribute("type_id", f.type_id.0 as u64)?;
    e.close_element("field")?;
    Ok(())
}

/// Reads the remaining children of the current element as `<field>`s,
/// stopping at the first exhausted `open_element`. `Decoder::open_element`
/// has no lookahead, so this doubles as both the peek and the read.
fn decode_fields(d: &mut dyn Decoder) -> Result<Vec<Field>> {
    let mut fields = Vec::new();
    loop {
        match d.open_element() {
            Ok(t) if t == "field" => {
                let offset = require_unsigned(d, "offset")? as u32;
                let name = require_string(d, "name")?;
                let type_id = TypeId(require_unsigned(d, "type_id")? as u32);
                d.close_element()?;
                fields.push(Field { offset, name, type_id });
            }
            Ok(other) => return Err(anyhow!("expected <field>, found <{other}>")),
            Err(_) => break,
        }
    }
    Ok(fields)
}

fn encode_variant(v: &TypeVariant, e: &mut dyn Encoder) -> Result<()> {
    e.open_element("variant")?;
    match v {
        TypeVariant::Void => e.write_attribute("kind", "void")?,
        TypeVariant::Unknown { bytes } => {
            e.write_attribute("kind", "unknown")?;
            e.write_unsigned_attribute("bytes", *bytes as u64)?;
        }
        TypeVariant::Bool { bytes } => {
            e.write_attribute("kind", "bool")?;
            e.write_unsigned_attribute("bytes", *bytes as u64)?;
        }
        TypeVariant::Int { bytes, signed } => {
            e.write_attribute("kind", "int")?;
            e.write_unsigned_attribute("bytes", *bytes as u64)?;
            e.write_unsigned_attribute("signed", *signed as u64)?;
        }
        TypeVariant::Float { bytes } => {
            e.write_attribute("kind", "float")?;
            e.write_unsigned_attribute("bytes", *bytes as u64)?;
        }
        TypeVariant::Char => e.write_attribute("kind", "char")?,
        TypeVariant::Code => e.write_attribute("kind", "code")?,
        TypeVariant::Pointer { pointee } => {
            e.write_attribute("kind", "pointer")?;
            e.write_unsigned_attribute("pointee", pointee.0 as u64)?;
        }
        TypeVariant::PointerRel { container, offset, pointee, stripped } => {
            e.write_attribute("kind", "pointer_rel")?;
            e.write_unsigned_attribute("container", container.0 as u64)?;
            e.write_unsigned_attribute("offset", *offset)?;
            e.write_unsigned_attribute("pointee", pointee.0 as u64)?;
            if let Some(s) = stripped {
                e.write_unsigned_attribute("stripped", s.0 as u64)?;
            }
        }
        TypeVariant::Array { element, len } => {
            e.write_attribute("kind", "array")?;
            e.write_unsigned_attribute("element", element.0 as u64)?;
            e.write_unsigned_attribute("len", *len as u64)?;
        }
        TypeVariant::Struct(body) => {
            e.write_attribute("kind", "struct")?;
            for f in &body.fields {
                encode_field(f, e)?;
            }
        }
        TypeVariant::Union(body) => {
            e.write_attribute("kind", "union")?;
            for f in &body.fields {
                encode_field(f, e)?;
            }
        }
        TypeVariant::Enum(body) => {
            e.write_attribute("kind", "enum")?;
            e.write_unsigned_attribute("underlying_size", body.underlying_size as u64)?;
            for (name, value) in &body.members {
                e.open_element("member")?;
                e.write_attribute("name", name)?;
                e.write_unsigned_attribute("value", *value)?;
                e.close_element("member")?;
            }
        }
        TypeVariant::PartialStruct { container, offset, size } => {
            e.write_attribute("kind", "partial_struct")?;
            e.write_unsigned_attribute("container", container.0 as u64)?;
            e.write_unsigned_attribute("offset", *offset as u64)?;
            e.write_unsigned_attribute("size", *size as u64)?;
        }
        TypeVariant::PartialUnion { container, offset, size } => {
            e.write_attribute("kind", "partial_union")?;
            e.write_unsigned_attribute("container", container.0 as u64)?;
            e.write_unsigned_attribute("offset", *offset as u64)?;
            e.write_unsigned_attribute("size", *size as u64)?;
        }
        TypeVariant::PartialEnum { container, offset, size } => {
            e.write_attribute("kind", "partial_enum")?;
            e.write_unsigned_attribute("container", container.0 as u64)?;
            e.write_unsigned_attribute("offset", *offset as u64)?;
            e.write_unsigned_attribute("size", *size as u64)?;
        }
        TypeVariant::Spacebase { space } => {
            e.write_attribute("kind", "spacebase")?;
            e.write_unsigned_attribute("space", space.0 as u64)?;
        }
    }
    e.close_element("variant")?;
    Ok(())
}

fn decode_variant(d: &mut dyn Decoder) -> Result<TypeVariant> {
    let tag = d.open_element()?;
    if tag != "variant" {
        return Err(anyhow!("expected <variant>, found <{tag}>"));
    }
    let kind = require_string(d, "kind")?;
    let variant = match kind.as_str() {
        "void" => TypeVariant::Void,
        "unknown" => TypeVariant::Unknown { bytes: require_unsigned(d, "bytes")? as u32 },
        "bool" => TypeVariant::Bool { bytes: require_unsigned(d, "bytes")? as u32 },
        "int" => TypeVariant::Int { bytes: require_unsigned(d, "bytes")? as u32, signed: require_unsigned(d, "signed")? != 0 },
        "float" => TypeVariant::Float { bytes: require_unsigned(d, "bytes")? as u32 },
        "char" => TypeVariant::Char,
        "code" => TypeVariant::Code,
        "pointer" => TypeVariant::Pointer { pointee: TypeId(require_unsigned(d, "pointee")? as u32) },
        "pointer_rel" => TypeVariant::PointerRel {
            container: TypeId(require_unsigned(d, "container")? as u32),
            offset: require_unsigned(d, "offset")?,
            pointee: TypeId(require_unsigned(d, "pointee")? as u32),
            stripped: d.read_unsigned_attribute("stripped")?.map(|v| TypeId(v as u32)),
        },
        "array" => TypeVariant::Array { element: TypeId(require_unsigned(d, "element")? as u32), len: require_unsigned(d, "len")? as u32 },
        "struct" | "union" => {
            let fields = decode_fields(d)?;
            if kind == "struct" { TypeVariant::Struct(StructBody { fields }) } else { TypeVariant::Union(UnionBody { fields }) }
        }
        "enum" => {
            let underlying_size = require_unsigned(d, "underlying_size")? as u32;
            let mut members = Vec::new();
            while let Ok(t) = d.open_element() {
                if t != "member" {
                    return Err(anyhow!("expected <member>, found <{t}>"));
                }
                let name = require_string(d, "name")?;
                let value = require_unsigned(d, "value")?;
                d.close_element()?;
                members.push((name, value));
            }
            TypeVariant::Enum(EnumBody { members, underlying_size })
        }
        "partial_struct" => TypeVariant::PartialStruct {
            container: TypeId(require_unsigned(d, "container")? as u32),
            offset: require_unsigned(d, "offset")? as u32,
            size: require_unsigned(d, "size")? as u32,
        },
        "partial_union" => TypeVariant::PartialUnion {
            container: TypeId(require_unsigned(d, "container")? as u32),
            offset: require_unsigned(d, "offset")? as u32,
            size: require_unsigned(d, "size")? as u32,
        },
        "partial_enum" => TypeVariant::PartialEnum {
            container: TypeId(require_unsigned(d, "container")? as u32),
            offset: require_unsigned(d, "offset")? as u32,
            size: require_unsigned(d, "size")? as u32,
        },
        "spacebase" => TypeVariant::Spacebase { space: SpaceIndex(require_unsigned(d, "space")? as u32) },
        other => return Err(anyhow!("unknown variant kind {other}")),
    };
    d.close_element()?;
    Ok(variant)
}

impl crate::external::Marshal for PcodeOp {
    fn encode(&self, e: &mut dyn Encoder) -> Result<()> {
        e.open_element("pcodeop")?;
        e.write_unsigned_attribute("id", self.id.0 as u64)?;
        e.write_unsigned_attribute("opcode", u8::from(self.opcode) as u64)?;
        e.write_unsigned_attribute("addr_space", self.seq.address.space.0 as u64)?;
        e.write_unsigned_attribute("addr_offset", self.seq.address.offset)?;
        e.write_unsigned_attribute("order", self.seq.order as u64)?;
        e.write_unsigned_attribute("time", self.seq.time)?;
        if let Some(out) = self.output {
            e.write_unsigned_attribute("output", out.0 as u64)?;
        }
        e.write_unsigned_attribute("primary_flags", self.primary.into_raw() as u64)?;
        e.write_unsigned_attribute("secondary_flags", self.secondary.into_raw() as u64)?;
        for input in &self.inputs {
            e.open_element("input")?;
            e.write_unsigned_attribute("varnode", input.0 as u64)?;
            e.close_element("input")?;
        }
        e.close_element("pcodeop")?;
        Ok(())
    }

    fn decode(d: &mut dyn Decoder) -> Result<Self> {
        let tag = d.open_element()?;
        if tag != "pcodeop" {
            return Err(anyhow!("expected <pcodeop>, found <{tag}>"));
        }
        let id = OpId(require_unsigned(d, "id")? as u32);
        let opcode = OpCode::try_from(require_unsigned(d, "opcode")? as u8).map_err(|e| anyhow!("{e}"))?;
        let address = Address::new(SpaceIndex(require_unsigned(d, "addr_space")? as u32), require_unsigned(d, "addr_offset")?);
        let order = require_unsigned(d, "order")? as u32;
        let time = require_unsigned(d, "time")?;
        let output = d.read_unsigned_attribute("output")?.map(|v| VarnodeId(v as u32));
        let primary = PrimaryFlags::from_raw(require_unsigned(d, "primary_flags")? as u32)?;
        let secondary = SecondaryFlags::from_raw(require_unsigned(d, "secondary_flags")? as u32)?;
        let mut inputs = Vec::new();
        while let Ok(t) = d.open_element() {
            if t != "input" {
                return Err(anyhow!("expected <input>, found <{t}>"));
            }
            inputs.push(VarnodeId(require_unsigned(d, "varnode")? as u32));
            d.close_element()?;
        }
        d.close_element()?;
        Ok(PcodeOp {
            id,
            opcode,
            inputs,
            output,
            seq: SeqNum::new(address, order, time),
            parent: None,
            block_pos: None,
            primary,
            secondary,
            list_prev: None,
            list_next: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::Marshal;

    fn round_trip_datatype(d: Datatype) -> Datatype {
        let mut enc = InMemoryEncoder::new();
        d.encode(&mut enc).unwrap();
        let mut dec = enc.into_decoder();
        Datatype::decode(&mut dec).unwrap()
    }

    fn same_shape(a: &Datatype, b: &Datatype) -> bool {
        a.meta == b.meta
            && a.size == b.size
            && a.alignment == b.alignment
            && a.id == b.id
            && a.name == b.name
            && a.typedef_target == b.typedef_target
            && a.flags.into_raw() == b.flags.into_raw()
            && a.display_format == b.display_format
            && format!("{:?}", a.variant) == format!("{:?}", b.variant)
    }

    #[test]
    fn primitive_int_round_trips() {
        let d = Datatype {
            meta: MetaType::Int,
            sub_meta: SubMetaType::SubInt,
            size: 4,
            alignment: 4,
            id: 42,
            name: Some("int".to_string()),
            typedef_target: None,
            flags: DatatypeFlags(DatatypeFlags::CORE),
            variant: TypeVariant::Int { bytes: 4, signed: true },
            display_format: None,
        };
        let back = round_trip_datatype(d.clone());
        assert!(same_shape(&d, &back));
    }

    #[test]
    fn struct_with_fields_round_trips() {
        let d = Datatype {
            meta: MetaType::Struct,
            sub_meta: SubMetaType::SubStruct,
            size: 8,
            alignment: 4,
            id: 7,
            name: Some("pair".to_string()),
            typedef_target: None,
            flags: DatatypeFlags::empty(),
            variant: TypeVariant::Struct(StructBody {
                fields: vec![
                    Field { offset: 0, name: "tag".to_string(), type_id: TypeId(1) },
                    Field { offset: 4, name: "value".to_string(), type_id: TypeId(2) },
                ],
            }),
            display_format: None,
        };
        let back = round_trip_datatype(d.clone());
        assert!(same_shape(&d, &back));
    }

    #[test]
    fn enum_with_members_round_trips() {
        let d = Datatype {
            meta: MetaType::Enum,
            sub_meta: SubMetaType::SubEnum,
            size: 4,
            alignment: 4,
            id: 9,
            name: Some("color".to_string()),
            typedef_target: None,
            flags: DatatypeFlags::empty(),
            variant: TypeVariant::Enum(EnumBody { members: vec![("red".to_string(), 0), ("blue".to_string(), 1)], underlying_size: 4 }),
            display_format: None,
        };
        let back = round_trip_datatype(d.clone());
        assert!(same_shape(&d, &back));
    }

    #[test]
    fn pointer_rel_round_trips_with_stripped() {
        let d = Datatype {
            meta: MetaType::PtrRel,
            sub_meta: SubMetaType::SubPtr,
            size: 8,
            alignment: 8,
            id: 3,
            name: None,
            typedef_target: None,
            flags: DatatypeFlags(DatatypeFlags::IS_PTRREL),
            variant: TypeVariant::PointerRel { container: TypeId(0), offset: 4, pointee: TypeId(1), stripped: Some(TypeId(5)) },
            display_format: None,
        };
        let back = round_trip_datatype(d.clone());
        assert!(same_shape(&d, &back));
    }

    #[test]
    fn typedef_with_display_format_round_trips() {
        let d = Datatype {
            meta: MetaType::Int,
            sub_meta: SubMetaType::SubInt,
            size: 4,
            alignment: 4,
            id: 99,
            name: Some("HANDLE".to_string()),
            typedef_target: Some(TypeId(0)),
            flags: DatatypeFlags(DatatypeFlags::FORCE_DISPLAY_FORMAT),
            variant: TypeVariant::Int { bytes: 4, signed: false },
            display_format: Some(DisplayFormat::Hex),
        };
        let back = round_trip_datatype(d.clone());
        assert!(same_shape(&d, &back));
    }

    #[test]
    fn pcodeop_round_trips() {
        let op = PcodeOp {
            id: OpId(3),
            opcode: OpCode::IntAdd,
            inputs: vec![VarnodeId(1), VarnodeId(2)],
            output: Some(VarnodeId(3)),
            seq: SeqNum::new(Address::new(SpaceIndex(0), 0x100), 0, 5),
            parent: None,
            block_pos: None,
            primary: PrimaryFlags::empty(),
            secondary: SecondaryFlags::empty(),
            list_prev: None,
            list_next: None,
        };
        let mut enc = InMemoryEncoder::new();
        op.encode(&mut enc).unwrap();
        let mut dec = enc.into_decoder();
        let back = PcodeOp::decode(&mut dec).unwrap();
        assert_eq!(back.id, op.id);
        assert_eq!(back.opcode, op.opcode);
        assert_eq!(back.inputs, op.inputs);
        assert_eq!(back.output, op.output);
        assert_eq!(back.seq, op.seq);
    }
}
