//! The data-type lattice (`Datatype`, `TypeFactory`).
//!
//! `Datatype` maps the source's class hierarchy onto a sum type
//! ("Polymorphic datatypes"): one [`TypeVariant`] per meta-type, with shared
//! behavior (size/alignment/display) as inherent methods on `Datatype`
//! rather than as a trait, since every variant needs all of them and there
//! is exactly one concrete representation to implement against.

pub mod factory;
pub mod warning;

use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::flags_to_struct;
use crate::space::SpaceIndex;

pub use factory::TypeFactory;
pub use warning::{TypeWarning, TypeWarningKind};

/// Stable arena index into a `TypeFactory`. Two `TypeId`s are equal iff they
/// name structurally-equal types (dedup is enforced at insertion).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(pub u32);

/// The coarse classification every `Datatype` carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaType {
    Void,
    Bool,
    Int,
    Uint,
    Float,
    Char,
    Code,
    Ptr,
    PtrRel,
    Array,
    Struct,
    Union,
    Enum,
    PartialStruct,
    PartialUnion,
    PartialEnum,
    Spacebase,
    Unknown,
}

/// A refinement of `MetaType` carrying more detail than the coarse meta
/// alone (e.g. distinguishing a pointer to a multi-field struct from any
/// other pointer). Declared most-specific-first so its derived `Ord`
/// sorts more specific sub-meta-types earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubMetaType {
    SubPtrStruct,
    SubPtr,
    SubStruct,
    SubUnion,
    SubEnum,
    SubArray,
    SubInt,
    SubUint,
    SubFloat,
    SubChar,
    SubBool,
    SubCode,
    SubPartial,
    SubSpacebase,
    SubVoid,
    SubUnknown,
}

const CORE: u32 = 1 << 0;
const VARIABLE_LENGTH: u32 = 1 << 1;
const OPAQUE_STRING: u32 = 1 << 2;
const POINTER_TO_ARRAY: u32 = 1 << 3;
const IS_PTRREL: u32 = 1 << 4;
const HAS_STRIPPED: u32 = 1 << 5;
const NEEDS_RESOLUTION: u32 = 1 << 6;
const INCOMPLETE: u32 = 1 << 7;
const CORETYPE: u32 = 1 << 8;
const FORCE_DISPLAY_FORMAT: u32 = 1 << 9;

flags_to_struct!(
    DatatypeFlags, u32,
    CORE is_core "A fundamental, architecture-defined type.",
    VARIABLE_LENGTH is_variable_length "Id is uniquified by size.",
    OPAQUE_STRING opaque_string "Printed as a string literal, not a char array.",
    POINTER_TO_ARRAY pointer_to_array "Pointer whose pointee is itself an array.",
    IS_PTRREL is_ptrrel "Pointer with a fixed byte offset into a container.",
    HAS_STRIPPED has_stripped "An ephemeral ptr-rel carries a stripped equivalent.",
    NEEDS_RESOLUTION needs_resolution "A read through this type must resolve a union field.",
    INCOMPLETE incomplete "Composite declared but not yet given fields (setFields pending).",
    CORETYPE coretype "Locked in by the architecture, never replaced by inference.",
    FORCE_DISPLAY_FORMAT force_display_format "Printer must use the recorded display format, not infer one.",
);

/// Requested number display for a typedef's underlying integer, set by
/// `getTypedef`'s `format` argument and honored only when
/// `DatatypeFlags::FORCE_DISPLAY_FORMAT` is also set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisplayFormat {
    Hex,
    Dec,
    Oct,
    Bin,
    Char,
}

#[derive(Debug, Clone)]
pub struct Field {
    pub offset: u32,
    pub name: String,
    pub type_id: TypeId,
}

#[derive(Debug, Clone)]
pub struct StructBody {
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone)]
pub struct UnionBody {
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone)]
pub struct EnumBody {
    /// Ordered (name, value) pairs; order of declaration is preserved so
    /// `assignEnumValues`'s auto-assignment pass is deterministic.
    pub members: Vec<(String, u64)>,
    pub underlying_size: u32,
}

#[derive(Debug, Clone)]
pub enum TypeVariant {
    Void,
    Unknown { bytes: u32 },
    Bool { bytes: u32 },
    Int { bytes: u32, signed: bool },
    Float { bytes: u32 },
    Char,
    Code,
    Pointer { pointee: TypeId },
    /// Ephemeral unless `name` is set at the `Datatype` level; `stripped`
    /// names the representable fallback used when the relative offset
    /// can't be printed directly.
    PointerRel { container: TypeId, offset: u64, pointee: TypeId, stripped: Option<TypeId> },
    Array { element: TypeId, len: u32 },
    Struct(StructBody),
    Union(UnionBody),
    Enum(EnumBody),
    PartialStruct { container: TypeId, offset: u32, size: u32 },
    PartialUnion { container: TypeId, offset: u32, size: u32 },
    PartialEnum { container: TypeId, offset: u32, size: u32 },
    Spacebase { space: SpaceIndex },
}

/// A member of the lattice (`Datatype`).
///
/// Invariant (enforced by `TypeFactory`, not here): structural equality
/// (`compare_dependency == Equal`) implies identity — two `Datatype`s that
/// compare equal are dedup'd to one `TypeId` at insertion.
#[derive(Debug, Clone)]
pub struct Datatype {
    pub meta: MetaType,
    pub sub_meta: SubMetaType,
    pub size: u32,
    pub alignment: u32,
    pub id: u64,
    pub name: Option<String>,
    pub typedef_target: Option<TypeId>,
    pub flags: DatatypeFlags,
    pub variant: TypeVariant,
    pub display_format: Option<DisplayFormat>,
}

impl Datatype {
    /// `size` rounded up to `alignment` ("alignSize").
    pub fn align_size(&self) -> u32 {
        if self.alignment <= 1 {
            return self.size;
        }
        self.size.div_ceil(self.alignment) * self.alignment
    }

    pub fn is_incomplete(&self) -> bool {
        self.flags.incomplete()
    }

    pub fn sub_meta_for(meta: MetaType) -> SubMetaType {
        match meta {
            MetaType::Ptr => SubMetaType::SubPtr,
            MetaType::PtrRel => SubMetaType::SubPtr,
            MetaType::Struct => SubMetaType::SubStruct,
            MetaType::Union => SubMetaType::SubUnion,
            MetaType::Enum => SubMetaType::SubEnum,
            MetaType::Array => SubMetaType::SubArray,
            MetaType::Int => SubMetaType::SubInt,
            MetaType::Uint => SubMetaType::SubUint,
            MetaType::Float => SubMetaType::SubFloat,
            MetaType::Char => SubMetaType::SubChar,
            MetaType::Bool => SubMetaType::SubBool,
            MetaType::Code => SubMetaType::SubCode,
            MetaType::PartialStruct | MetaType::PartialUnion | MetaType::PartialEnum => SubMetaType::SubPartial,
            MetaType::Spacebase => SubMetaType::SubSpacebase,
            MetaType::Void => SubMetaType::SubVoid,
            MetaType::Unknown => SubMetaType::SubUnknown,
        }
    }
}

/// Deep structural comparison: metatype, size, element chain, field list
/// ("by structure"). Requires an `arena` to resolve component
/// `TypeId`s, since `compareDependency(a, b) == Equal` must recurse into
/// already-deduplicated children rather than re-walk raw structure.
pub fn compare_dependency(a: &Datatype, b: &Datatype, arena: &[Datatype]) -> Ordering {
    compare_dependency_inner(a, b, arena)
}

fn variant_tag(d: &Datatype) -> u8 {
    match d.variant {
        TypeVariant::Void => 0,
        TypeVariant::Unknown { .. } => 1,
        TypeVariant::Bool { .. } => 2,
        TypeVariant::Int { .. } => 3,
        TypeVariant::Float { .. } => 4,
        TypeVariant::Char => 5,
        TypeVariant::Code => 6,
        TypeVariant::Pointer { .. } => 7,
        TypeVariant::PointerRel { .. } => 8,
        TypeVariant::Array { .. } => 9,
        TypeVariant::Struct(_) => 10,
        TypeVariant::Union(_) => 11,
        TypeVariant::Enum(_) => 12,
        TypeVariant::PartialStruct { .. } => 13,
        TypeVariant::PartialUnion { .. } => 14,
        TypeVariant::PartialEnum { .. } => 15,
        TypeVariant::Spacebase { .. } => 16,
    }
}

fn compare_dependency_inner(a: &Datatype, b: &Datatype, arena: &[Datatype]) -> Ordering {
    variant_tag(a)
        .cmp(&variant_tag(b))
        .then(a.size.cmp(&b.size))
        .then_with(|| match (&a.variant, &b.variant) {
            (TypeVariant::Void, TypeVariant::Void) => Ordering::Equal,
            (TypeVariant::Unknown { bytes: x }, TypeVariant::Unknown { bytes: y }) => x.cmp(y),
            (TypeVariant::Bool { bytes: x }, TypeVariant::Bool { bytes: y }) => x.cmp(y),
            (TypeVariant::Int { bytes: xb, signed: xs }, TypeVariant::Int { bytes: yb, signed: ys }) => {
                xb.cmp(yb).then(xs.cmp(ys))
            }
            (TypeVariant::Float { bytes: x }, TypeVariant::Float { bytes: y }) => x.cmp(y),
            (TypeVariant::Char, TypeVariant::Char) => Ordering::Equal,
            (TypeVariant::Code, TypeVariant::Code) => Ordering::Equal,
            (TypeVariant::Pointer { pointee: x }, TypeVariant::Pointer { pointee: y }) => {
                compare_type_id(*x, *y, arena)
            }
            (
                TypeVariant::PointerRel { container: xc, offset: xo, pointee: xp, .. },
                TypeVariant::PointerRel { container: yc, offset: yo, pointee: yp, .. },
            ) => compare_type_id(*xc, *yc, arena)
                .then(xo.cmp(yo))
                .then_with(|| compare_type_id(*xp, *yp, arena)),
            (TypeVariant::Array { element: xe, len: xl }, TypeVariant::Array { element: ye, len: yl }) => {
                xl.cmp(yl).then_with(|| compare_type_id(*xe, *ye, arena))
            }
            (TypeVariant::Struct(x), TypeVariant::Struct(y)) => compare_fields(&x.fields, &y.fields, arena),
            (TypeVariant::Union(x), TypeVariant::Union(y)) => compare_fields(&x.fields, &y.fields, arena),
            (TypeVariant::Enum(x), TypeVariant::Enum(y)) => x
                .underlying_size
                .cmp(&y.underlying_size)
                .then_with(|| x.members.cmp(&y.members)),
            (
                TypeVariant::PartialStruct { container: xc, offset: xo, size: xs },
                TypeVariant::PartialStruct { container: yc, offset: yo, size: ys },
            )
            | (
                TypeVariant::PartialUnion { container: xc, offset: xo, size: xs },
                TypeVariant::PartialUnion { container: yc, offset: yo, size: ys },
            )
            | (
                TypeVariant::PartialEnum { container: xc, offset: xo, size: xs },
                TypeVariant::PartialEnum { container: yc, offset: yo, size: ys },
            ) => compare_type_id(*xc, *yc, arena).then(xo.cmp(yo)).then(xs.cmp(ys)),
            (TypeVariant::Spacebase { space: x }, TypeVariant::Spacebase { space: y }) => x.cmp(y),
            _ => Ordering::Equal,
        })
}

fn compare_type_id(a: TypeId, b: TypeId, arena: &[Datatype]) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    compare_dependency_inner(&arena[a.0 as usize], &arena[b.0 as usize], arena)
}

fn compare_fields(a: &[Field], b: &[Field], arena: &[Datatype]) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| {
        for (fa, fb) in a.iter().zip(b.iter()) {
            let ord = fa
                .offset
                .cmp(&fb.offset)
                .then_with(|| fa.name.cmp(&fb.name))
                .then_with(|| compare_type_id(fa.type_id, fb.type_id, arena));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    })
}

/// A content hash for the structural index's hash bucket
/// ("Content-deduplicated types": a precomputed hash plus a structural
/// comparator used only on collisions). Need not be collision-free: the
/// factory always confirms equality with `compare_dependency` before
/// treating two types as the same.
pub fn structural_hash(d: &Datatype, arena: &[Datatype]) -> u64 {
    let mut hasher = DefaultHasher::new();
    variant_tag(d).hash(&mut hasher);
    d.size.hash(&mut hasher);
    hash_variant(&d.variant, arena, &mut hasher);
    hasher.finish()
}

fn hash_variant(v: &TypeVariant, arena: &[Datatype], hasher: &mut DefaultHasher) {
    match v {
        TypeVariant::Void | TypeVariant::Char | TypeVariant::Code => {}
        TypeVariant::Unknown { bytes } | TypeVariant::Bool { bytes } | TypeVariant::Float { bytes } => bytes.hash(hasher),
        TypeVariant::Int { bytes, signed } => {
            bytes.hash(hasher);
            signed.hash(hasher);
        }
        TypeVariant::Pointer { pointee } => hash_type_id(*pointee, arena, hasher),
        TypeVariant::PointerRel { container, offset, pointee, .. } => {
            hash_type_id(*container, arena, hasher);
            offset.hash(hasher);
            hash_type_id(*pointee, arena, hasher);
        }
        TypeVariant::Array { element, len } => {
            hash_type_id(*element, arena, hasher);
            len.hash(hasher);
        }
        TypeVariant::Struct(body) | TypeVariant::Union(body) => {
            for f in &body.fields {
                f.offset.hash(hasher);
                f.name.hash(hasher);
                hash_type_id(f.type_id, arena, hasher);
            }
        }
        TypeVariant::Enum(body) => {
            body.underlying_size.hash(hasher);
            body.members.hash(hasher);
        }
        TypeVariant::PartialStruct { container, offset, size }
        | TypeVariant::PartialUnion { container, offset, size }
        | TypeVariant::PartialEnum { container, offset, size } => {
            hash_type_id(*container, arena, hasher);
            offset.hash(hasher);
            size.hash(hasher);
        }
        TypeVariant::Spacebase { space } => space.0.hash(hasher),
    }
}

fn hash_type_id(id: TypeId, arena: &[Datatype], hasher: &mut DefaultHasher) {
    // Recurse through structure rather than hash the numeric id, so that
    // identical structure hashes identically even across factories.
    hash_variant(&arena[id.0 as usize].variant, arena, hasher);
    arena[id.0 as usize].size.hash(hasher);
}

/// `base_id` mixed with `size`, used to uniquify variable-length types
/// (invariant "for variable-length types, id is uniquified by
/// size").
pub fn hash_size(base_id: u64, size: u32) -> u64 {
    let mut hasher = DefaultHasher::new();
    base_id.hash(&mut hasher);
    size.hash(&mut hasher);
    hasher.finish()
}

/// The `base_id` before `hash_size` mixed in the instance's size; two
/// variable-length instances of the same named type share this.
pub fn unsized_id(name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_size_rounds_up() {
        let d = Datatype {
            meta: MetaType::Struct,
            sub_meta: SubMetaType::SubStruct,
            size: 6,
            alignment: 4,
            id: 0,
            name: None,
            typedef_target: None,
            flags: DatatypeFlags::empty(),
            variant: TypeVariant::Struct(StructBody { fields: vec![] }),
            display_format: None,
        };
        assert_eq!(d.align_size(), 8);
    }

    #[test]
    fn variable_length_ids_share_unsized_id() {
        let base = unsized_id("blob");
        let a = hash_size(base, 16);
        let b = hash_size(base, 32);
        assert_ne!(a, b);
    }
}
