//! Content-deduplicated type store (`TypeFactory`).
//!
//! Two orderings live over one arena ("Content-deduplicated
//! types"): a hash-bucketed *structural* index used for anonymous/ephemeral
//! constructors (pointers, arrays, ptr-rel, partial-*, primitives) where
//! structural equality really does mean identity, and a *by name* index
//! used for named composites/typedefs/enums, where two distinctly-named
//! types sharing a layout must NOT be merged — only a by-name redefinition
//! conflict is detected via `compare_dependency` (see DESIGN.md, Open
//! Question: "does structural dedup apply to named composites").

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;

use crate::error::PcodeError;
use crate::types::warning::{TypeWarning, TypeWarningKind};
use crate::types::{
    compare_dependency, hash_size, structural_hash, unsized_id, Datatype, DatatypeFlags, DisplayFormat, EnumBody, Field,
    MetaType, StructBody, SubMetaType, TypeId, TypeVariant, UnionBody,
};

/// One row per `MetaType` variant (`meta as usize` indexes declaration
/// order directly, since `MetaType` is fieldless).
const N_META: usize = 18;

pub struct TypeFactory {
    arena: Vec<Datatype>,
    /// hash(structure) -> candidate ids sharing that hash bucket.
    structural_index: HashMap<u64, Vec<TypeId>>,
    /// (name, id) -> the named type (composites, typedefs, enums).
    name_index: BTreeMap<(String, u64), TypeId>,
    /// `[meta as usize][size]` -> cached primitive, for `size` in `1..=8`
    /// (index 0 unused). Covers every base primitive except the three
    /// named slots below, which don't fit this shape.
    primitive_matrix: [[Option<TypeId>; 9]; N_META],
    /// Extended-precision float sizes, outside the matrix's 1..=8 columns.
    float10_cache: Option<TypeId>,
    float16_cache: Option<TypeId>,
    /// The canonical signed one-byte int, cached apart from the matrix so
    /// it can never be aliased with the `Char` row at the same size.
    int1_not_char_cache: Option<TypeId>,
    pub warnings: Vec<TypeWarning>,
    pub max_basetype_size: u32,
}

impl TypeFactory {
    pub fn new(max_basetype_size: u32) -> Self {
        Self {
            arena: Vec::new(),
            structural_index: HashMap::new(),
            name_index: BTreeMap::new(),
            primitive_matrix: [[None; 9]; N_META],
            float10_cache: None,
            float16_cache: None,
            int1_not_char_cache: None,
            warnings: Vec::new(),
            max_basetype_size,
        }
    }

    pub fn get(&self, id: TypeId) -> &Datatype {
        &self.arena[id.0 as usize]
    }

    fn get_mut(&mut self, id: TypeId) -> &mut Datatype {
        &mut self.arena[id.0 as usize]
    }

    pub fn arena(&self) -> &[Datatype] {
        &self.arena
    }

    fn alloc(&mut self, datatype: Datatype) -> TypeId {
        let id = TypeId(self.arena.len() as u32);
        self.arena.push(datatype);
        id
    }

    /// Insert `candidate` unless a structurally-equal type already exists
    /// in the structural index, in which case that existing `TypeId` is
    /// returned instead ("by structure").
    fn insert_structural(&mut self, mut candidate: Datatype) -> TypeId {
        let hash = structural_hash(&candidate, &self.arena);
        if let Some(bucket) = self.structural_index.get(&hash) {
            for &existing in bucket {
                if compare_dependency(&candidate, self.get(existing), &self.arena) == std::cmp::Ordering::Equal {
                    return existing;
                }
            }
        }
        if candidate.id == 0 {
            candidate.id = hash;
        }
        let id = self.alloc(candidate);
        self.structural_index.entry(hash).or_default().push(id);
        id
    }

    /// Returns the core primitive for `(size, meta)`, creating it on first
    /// use. Requests larger than `max_basetype_size` fall back to a byte
    /// array of unknowns (`getBase`).
    pub fn get_base(&mut self, size: u32, meta: MetaType) -> Result<TypeId> {
        if size > self.max_basetype_size {
            let byte = self.get_base(1, MetaType::Unknown)?;
            return Ok(self.get_type_array_fit(byte, size));
        }
        if let Some(id) = self.cached_primitive(size, meta) {
            return Ok(id);
        }
        let variant = match meta {
            MetaType::Void => TypeVariant::Void,
            MetaType::Unknown => TypeVariant::Unknown { bytes: size },
            MetaType::Bool => TypeVariant::Bool { bytes: size },
            MetaType::Int => TypeVariant::Int { bytes: size, signed: true },
            MetaType::Uint => TypeVariant::Int { bytes: size, signed: false },
            MetaType::Float => TypeVariant::Float { bytes: size },
            MetaType::Char => TypeVariant::Char,
            MetaType::Code => TypeVariant::Code,
            _ => return Err(PcodeError::invariant(format!("{meta:?} is not a primitive meta-type")).into()),
        };
        // `undefined`-family sizes are the one core primitive family that is
        // variable-length: its id is `hash_size(base_id, size)`
        // rather than the plain structural hash, so `undefined1`/`undefined4`
        // are related-but-distinct the same way a named variable-length
        // composite would be.
        let mut flags = DatatypeFlags(DatatypeFlags::CORE | DatatypeFlags::CORETYPE);
        let id = if meta == MetaType::Unknown {
            flags.set(DatatypeFlags(DatatypeFlags::VARIABLE_LENGTH));
            hash_size(unsized_id("undefined"), size)
        } else {
            0
        };
        let datatype = Datatype {
            meta,
            sub_meta: Datatype::sub_meta_for(meta),
            size,
            alignment: size.max(1),
            id,
            name: None,
            typedef_target: None,
            flags,
            variant,
            display_format: None,
        };
        let id = self.insert_structural(datatype);
        self.cache_primitive(size, meta, id);
        Ok(id)
    }

    /// Looks up a previously-cached primitive by `(size, meta)`: the
    /// extended-precision float slots and the not-char one-byte int are
    /// each their own field; everything else with `size` in `1..=8` goes
    /// through the matrix.
    fn cached_primitive(&self, size: u32, meta: MetaType) -> Option<TypeId> {
        match (meta, size) {
            (MetaType::Float, 10) => self.float10_cache,
            (MetaType::Float, 16) => self.float16_cache,
            (MetaType::Int, 1) => self.int1_not_char_cache,
            (_, 1..=8) => self.primitive_matrix[meta as usize][size as usize],
            _ => None,
        }
    }

    fn cache_primitive(&mut self, size: u32, meta: MetaType, id: TypeId) {
        match (meta, size) {
            (MetaType::Float, 10) => self.float10_cache = Some(id),
            (MetaType::Float, 16) => self.float16_cache = Some(id),
            (MetaType::Int, 1) => self.int1_not_char_cache = Some(id),
            (_, 1..=8) => self.primitive_matrix[meta as usize][size as usize] = Some(id),
            _ => {}
        }
    }

    /// Pointers to multi-field structs get the more specific
    /// `SUB_PTR_STRUCT` sub-meta-type (`getTypePointer`).
    pub fn get_type_pointer(&mut self, pointee: TypeId, byte_size: u32) -> TypeId {
        let sub_meta = match &self.get(pointee).variant {
            TypeVariant::Struct(body) if body.fields.len() > 1 => SubMetaType::SubPtrStruct,
            _ => SubMetaType::SubPtr,
        };
        let datatype = Datatype {
            meta: MetaType::Ptr,
            sub_meta,
            size: byte_size,
            alignment: byte_size,
            id: 0,
            name: None,
            typedef_target: None,
            flags: DatatypeFlags::empty(),
            variant: TypeVariant::Pointer { pointee },
            display_format: None,
        };
        self.insert_structural(datatype)
    }

    pub fn resize_pointer(&mut self, pointer: TypeId, new_size: u32) -> Result<TypeId> {
        let TypeVariant::Pointer { pointee } = &self.get(pointer).variant else {
            return Err(PcodeError::invariant("resizePointer on a non-pointer type").into());
        };
        let pointee = *pointee;
        Ok(self.get_type_pointer(pointee, new_size))
    }

    pub fn get_type_array(&mut self, element: TypeId, len: u32) -> TypeId {
        let elem_size = self.get(element).size;
        let datatype = Datatype {
            meta: MetaType::Array,
            sub_meta: SubMetaType::SubArray,
            size: elem_size * len,
            alignment: self.get(element).alignment,
            id: 0,
            name: None,
            typedef_target: None,
            flags: if len == 1 { DatatypeFlags(DatatypeFlags::NEEDS_RESOLUTION) } else { DatatypeFlags::empty() },
            variant: TypeVariant::Array { element, len },
            display_format: None,
        };
        self.insert_structural(datatype)
    }

    /// Builds an array of `element` that fits within `declared_bytes`,
    /// flooring to the nearest whole number of elements when the byte
    /// count isn't an exact multiple of the element size. Used wherever a
    /// type must be synthesized to cover a raw byte range whose length
    /// was only known in bytes, not in element count.
    pub fn get_type_array_fit(&mut self, element: TypeId, declared_bytes: u32) -> TypeId {
        let elem_size = self.get(element).size.max(1);
        let len = declared_bytes / elem_size;
        let actual = len * elem_size;
        let id = self.get_type_array(element, len);
        if actual != declared_bytes {
            let warning = TypeWarning { on: id, kind: TypeWarningKind::TruncationSynthesized { declared: declared_bytes, actual } };
            log::warn!("{warning}");
            self.warnings.push(warning);
        }
        id
    }

    /// Given a pointer whose pointee is itself an array, returns a pointer
    /// to the array's element type instead, marking `pointer_to_array` so
    /// the printer can still spell it `T (*)[N]` (`getTypePointerStripArray`).
    pub fn get_type_pointer_strip_array(&mut self, pointer: TypeId) -> Result<TypeId> {
        let byte_size = self.get(pointer).size;
        let TypeVariant::Pointer { pointee } = &self.get(pointer).variant else {
            return Err(PcodeError::invariant("getTypePointerStripArray on a non-pointer type").into());
        };
        let pointee = *pointee;
        let TypeVariant::Array { element, .. } = &self.get(pointee).variant else {
            return Ok(pointer);
        };
        let element = *element;
        let stripped = self.get_type_pointer(element, byte_size);
        self.get_mut(stripped).flags.set(DatatypeFlags(DatatypeFlags::POINTER_TO_ARRAY));
        Ok(stripped)
    }

    fn rounded_alignment(offset: u32, alignment: u32) -> u32 {
        if alignment <= 1 {
            offset
        } else {
            offset.div_ceil(alignment) * alignment
        }
    }

    /// Computes field offsets in declaration order, rounding each field's
    /// offset up to its own type's alignment, and the composite's overall
    /// size up to its own alignment ("assignFieldOffsets"). The fourth
    /// element is the raw tail offset before that final rounding, so a
    /// caller can tell whether rounding actually added padding.
    fn assign_field_offsets(&self, members: &[(String, TypeId)]) -> (Vec<Field>, u32, u32, u32) {
        let mut offset = 0u32;
        let mut max_align = 1u32;
        let mut fields = Vec::with_capacity(members.len());
        for (name, ty) in members {
            let t = self.get(*ty);
            let aligned = Self::rounded_alignment(offset, t.alignment.max(1));
            fields.push(Field { offset: aligned, name: name.clone(), type_id: *ty });
            offset = aligned + t.size;
            max_align = max_align.max(t.alignment.max(1));
        }
        let size = Self::rounded_alignment(offset, max_align);
        (fields, size, max_align, offset)
    }

    fn named_lookup(&self, name: &str) -> Option<TypeId> {
        self.name_index.range((name.to_string(), 0)..(name.to_string(), u64::MAX)).next().map(|(_, &id)| id)
    }

    /// Creates (or returns, if the name already denotes the identical
    /// structure) a named struct. Passing `fields = None` creates an
    /// incomplete stub for forward references, to be completed later by
    /// `set_fields` (`getTypeStruct`, `setFields`).
    pub fn get_type_struct(&mut self, name: &str, fields: Option<Vec<(String, TypeId)>>) -> Result<TypeId> {
        if let Some(existing) = self.named_lookup(name) {
            match (&self.get(existing).variant, &fields) {
                (TypeVariant::Struct(_), None) => return Ok(existing),
                (TypeVariant::Struct(_), Some(_)) if self.get(existing).is_incomplete() => {
                    let (laid_out, ..) = self.assign_field_offsets(&fields.unwrap());
                    self.set_fields(existing, laid_out)?; // raises AlignmentAdjusted itself if needed
                    return Ok(existing);
                }
                (TypeVariant::Struct(body), Some(new_fields)) => {
                    let candidate_ids: Vec<TypeId> = new_fields.iter().map(|(_, t)| *t).collect();
                    let same = body.fields.len() == candidate_ids.len()
                        && body.fields.iter().zip(&candidate_ids).all(|(f, t)| f.type_id == *t);
                    if same {
                        return Ok(existing);
                    }
                    return Err(PcodeError::invariant("struct redefined with an incompatible field list").with_type(name).into());
                }
                _ => return Err(PcodeError::invariant("name already denotes a non-struct type").with_type(name).into()),
            }
        }
        let (struct_fields, size, alignment, incomplete, rounded_from) = match fields {
            Some(members) => {
                let (f, s, a, raw) = self.assign_field_offsets(&members);
                (f, s, a, false, (s != raw).then_some(raw))
            }
            None => (Vec::new(), 0, 1, true, None),
        };
        let mut flags = DatatypeFlags::empty();
        if incomplete {
            flags.set(DatatypeFlags(DatatypeFlags::INCOMPLETE));
        }
        let datatype = Datatype {
            meta: MetaType::Struct,
            sub_meta: SubMetaType::SubStruct,
            size,
            alignment,
            id: unsized_id(name),
            name: Some(name.to_string()),
            typedef_target: None,
            flags,
            variant: TypeVariant::Struct(StructBody { fields: struct_fields }),
            display_format: None,
        };
        let id = self.alloc(datatype);
        self.name_index.insert((name.to_string(), self.get(id).id), id);
        if let Some(from) = rounded_from {
            let warning = TypeWarning { on: id, kind: TypeWarningKind::AlignmentAdjusted { from, to: size } };
            log::warn!("{warning}");
            self.warnings.push(warning);
        }
        if !incomplete {
            self.resolve_incomplete_typedefs()?;
        }
        Ok(id)
    }

    pub fn get_type_union(&mut self, name: &str, fields: Option<Vec<(String, TypeId)>>) -> Result<TypeId> {
        if let Some(existing) = self.named_lookup(name) {
            return Ok(existing);
        }
        let (union_fields, size, alignment, incomplete) = match fields {
            Some(members) => {
                let size = members.iter().map(|(_, t)| self.get(*t).size).max().unwrap_or(0);
                let alignment = members.iter().map(|(_, t)| self.get(*t).alignment.max(1)).max().unwrap_or(1);
                let fields = members
                    .into_iter()
                    .map(|(name, type_id)| Field { offset: 0, name, type_id })
                    .collect();
                (fields, size, alignment, false)
            }
            None => (Vec::new(), 0, 1, true),
        };
        let mut flags = DatatypeFlags::empty();
        if incomplete {
            flags.set(DatatypeFlags(DatatypeFlags::INCOMPLETE));
        }
        let datatype = Datatype {
            meta: MetaType::Union,
            sub_meta: SubMetaType::SubUnion,
            size,
            alignment,
            id: unsized_id(name),
            name: Some(name.to_string()),
            typedef_target: None,
            flags,
            variant: TypeVariant::Union(UnionBody { fields: union_fields }),
            display_format: None,
        };
        let id = self.alloc(datatype);
        self.name_index.insert((name.to_string(), self.get(id).id), id);
        Ok(id)
    }

    pub fn get_type_enum(&mut self, name: &str, underlying_size: u32) -> TypeId {
        if let Some(existing) = self.named_lookup(name) {
            return existing;
        }
        let datatype = Datatype {
            meta: MetaType::Enum,
            sub_meta: SubMetaType::SubEnum,
            size: underlying_size,
            alignment: underlying_size.max(1),
            id: unsized_id(name),
            name: Some(name.to_string()),
            typedef_target: None,
            flags: DatatypeFlags::empty(),
            variant: TypeVariant::Enum(EnumBody { members: Vec::new(), underlying_size }),
            display_format: None,
        };
        let id = self.alloc(datatype);
        self.name_index.insert((name.to_string(), self.get(id).id), id);
        id
    }

    /// Ephemeral (unnamed) ptr-rel types must carry a stripped equivalent
    /// (a plain pointer) for public-facing use, since a ptr-rel with no
    /// name has nothing else a caller outside this module can hold onto.
    pub fn get_type_pointer_rel(
        &mut self,
        container: TypeId,
        offset: u64,
        pointee: TypeId,
        byte_size: u32,
        name: Option<&str>,
    ) -> TypeId {
        let stripped = if name.is_none() {
            Some(self.get_type_pointer(pointee, byte_size))
        } else {
            None
        };
        let mut flags = DatatypeFlags(DatatypeFlags::IS_PTRREL);
        if stripped.is_some() {
            flags.set(DatatypeFlags(DatatypeFlags::HAS_STRIPPED));
        }
        let datatype = Datatype {
            meta: MetaType::PtrRel,
            sub_meta: SubMetaType::SubPtr,
            size: byte_size,
            alignment: byte_size,
            id: 0,
            name: name.map(String::from),
            typedef_target: None,
            flags,
            variant: TypeVariant::PointerRel { container, offset, pointee, stripped },
            display_format: None,
        };
        if name.is_some() {
            let id = self.alloc(datatype);
            self.name_index.insert((name.unwrap().to_string(), self.get(id).id), id);
            id
        } else {
            self.insert_structural(datatype)
        }
    }

    /// Legal only when `composite` is incomplete. Atomically assigns
    /// fields, clears the incomplete flag, re-indexes any pointer that
    /// cached a stale `SUB_PTR_STRUCT` sub-meta against it, and reinserts
    /// under the new name-index key (`setFields`).
    pub fn set_fields(&mut self, composite: TypeId, mut fields: Vec<Field>) -> Result<()> {
        if !self.get(composite).is_incomplete() {
            let mut err = PcodeError::invariant("setFields on a complete type");
            if let Some(name) = &self.get(composite).name {
                err = err.with_type(name.clone());
            }
            return Err(err.into());
        }

        let mut seen_offsets = std::collections::HashSet::new();
        let mut kept = Vec::with_capacity(fields.len());
        let mut last_end = 0u32;
        let mut max_align = 1u32;
        fields.sort_by_key(|f| f.offset);
        for field in fields.drain(..) {
            if self.get(field.type_id).meta == MetaType::Void {
                return Err(PcodeError::invariant("field type must be non-void").into());
            }
            if !seen_offsets.insert(field.offset) || field.offset < last_end {
                let warning =
                    TypeWarning { on: composite, kind: TypeWarningKind::OverlappingFieldDropped { dropped_offset: field.offset } };
                log::warn!("{warning}");
                self.warnings.push(warning);
                continue;
            }
            last_end = field.offset + self.get(field.type_id).size;
            max_align = max_align.max(self.get(field.type_id).alignment.max(1));
            kept.push(field);
        }
        let size = Self::rounded_alignment(last_end, max_align);
        let alignment = max_align;
        if size != last_end {
            let warning = TypeWarning { on: composite, kind: TypeWarningKind::AlignmentAdjusted { from: last_end, to: size } };
            log::warn!("{warning}");
            self.warnings.push(warning);
        }

        let name = self.get(composite).name.clone();
        if let Some(name) = &name {
            self.name_index.remove(&(name.clone(), self.get(composite).id));
        }
        {
            let datatype = self.get_mut(composite);
            match &mut datatype.variant {
                TypeVariant::Struct(body) => body.fields = kept,
                TypeVariant::Union(body) => body.fields = kept,
                _ => return Err(PcodeError::invariant("setFields on a non-composite type").into()),
            }
            datatype.size = size;
            datatype.alignment = alignment;
            datatype.flags.clear(DatatypeFlags(DatatypeFlags::INCOMPLETE));
        }
        if let Some(name) = &name {
            self.name_index.insert((name.clone(), self.get(composite).id), composite);
        }

        // Re-resolve any pointer whose cached sub-meta disagrees now that
        // the field count is known.
        for datatype in self.arena.iter_mut() {
            if let TypeVariant::Pointer { pointee } = datatype.variant {
                if pointee == composite {
                    datatype.sub_meta = SubMetaType::SubPtr;
                }
            }
        }
        let multi_field = matches!(&self.get(composite).variant, TypeVariant::Struct(b) if b.fields.len() > 1);
        if multi_field {
            for datatype in self.arena.iter_mut() {
                if let TypeVariant::Pointer { pointee } = datatype.variant {
                    if pointee == composite {
                        datatype.sub_meta = SubMetaType::SubPtrStruct;
                    }
                }
            }
        }

        self.resolve_incomplete_typedefs()?;
        Ok(())
    }

    /// Two-pass assignment: first honor explicit assignments (rejecting
    /// duplicates), then give auto-values to the rest by incrementing a
    /// running `maxval`, skipping collisions (`assignEnumValues`).
    pub fn assign_enum_values(
        &mut self,
        en: TypeId,
        names: Vec<String>,
        explicit: HashMap<String, u64>,
    ) -> Result<()> {
        let mut taken = std::collections::HashSet::new();
        let mut members = Vec::with_capacity(names.len());
        let mut needs_auto = Vec::new();
        for name in &names {
            match explicit.get(name) {
                Some(&value) if taken.insert(value) => members.push((name.clone(), value)),
                Some(&value) => {
                    let warning = TypeWarning { on: en, kind: TypeWarningKind::DuplicateEnumValue { value } };
                    log::warn!("{warning}");
                    self.warnings.push(warning);
                    needs_auto.push(name.clone());
                }
                None => needs_auto.push(name.clone()),
            }
        }
        let mut maxval: u64 = taken.iter().copied().max().map(|v| v + 1).unwrap_or(0);
        for name in needs_auto {
            while taken.contains(&maxval) {
                maxval += 1;
            }
            taken.insert(maxval);
            members.push((name, maxval));
            maxval += 1;
        }
        let TypeVariant::Enum(body) = &mut self.get_mut(en).variant else {
            return Err(PcodeError::invariant("assignEnumValues on a non-enum type").into());
        };
        body.members = members;
        Ok(())
    }

    /// Creates a named alias for `target`; fails if the name already
    /// denotes a *different* underlying type (`getTypedef`). `id`
    /// overrides the default name-derived id, for callers restoring a
    /// typedef that must keep an id assigned elsewhere (debug info,
    /// a prior session). `format` requests a specific number display and
    /// sets `FORCE_DISPLAY_FORMAT` so the printer can't override it.
    pub fn get_typedef(
        &mut self,
        target: TypeId,
        name: &str,
        id: Option<u64>,
        format: Option<DisplayFormat>,
    ) -> Result<TypeId> {
        if let Some(existing) = self.named_lookup(name) {
            if self.get(existing).typedef_target == Some(target) {
                return Ok(existing);
            }
            return Err(PcodeError::invariant("typedef already denotes a different type").with_type(name).into());
        }
        let base = self.get(target);
        let mut flags = DatatypeFlags::empty();
        if format.is_some() {
            flags.set(DatatypeFlags(DatatypeFlags::FORCE_DISPLAY_FORMAT));
        }
        let datatype = Datatype {
            meta: base.meta,
            sub_meta: base.sub_meta,
            size: base.size,
            alignment: base.alignment,
            id: id.unwrap_or_else(|| unsized_id(name)),
            name: Some(name.to_string()),
            typedef_target: Some(target),
            flags,
            variant: base.variant.clone(),
            display_format: format,
        };
        let new_id = self.alloc(datatype);
        self.name_index.insert((name.to_string(), self.get(new_id).id), new_id);
        Ok(new_id)
    }

    /// Re-installs aliases of types that have just become complete.
    /// Invoked after every `set_fields`/prototype assignment.
    pub fn resolve_incomplete_typedefs(&mut self) -> Result<()> {
        let stale: Vec<(TypeId, TypeId)> = self
            .arena
            .iter()
            .enumerate()
            .filter_map(|(i, d)| {
                let target = d.typedef_target?;
                (!self.get(target).is_incomplete() && d.size != self.get(target).size).then_some((TypeId(i as u32), target))
            })
            .collect();
        for (alias, target) in stale {
            let base = self.get(target).clone();
            let datatype = self.get_mut(alias);
            datatype.size = base.size;
            datatype.alignment = base.alignment;
            datatype.variant = base.variant;
        }
        Ok(())
    }

    /// Drills into `container` to return a type of exactly `size` bytes
    /// starting at `offset` (`getExactPiece`). Returns `None` if
    /// the range lands beyond the container, crosses a field boundary
    /// without a clean nested match, or a synthesized partial type cannot
    /// be formed.
    pub fn get_exact_piece(&mut self, container: TypeId, offset: u32, size: u32) -> Option<TypeId> {
        let data = self.get(container);
        if offset >= data.size || offset + size > data.size {
            return None;
        }
        if size == data.size && offset == 0 {
            return Some(container);
        }
        match &data.variant.clone() {
            TypeVariant::Struct(body) => {
                for field in &body.fields {
                    let field_end = field.offset + self.get(field.type_id).size;
                    if offset >= field.offset && offset + size <= field_end {
                        let inner_offset = offset - field.offset;
                        return self.get_exact_piece(field.type_id, inner_offset, size);
                    }
                }
                // Falls inside the struct but crosses a field boundary; if
                // it at least starts at a field, synthesize a partial.
                Some(self.insert_structural(Datatype {
                    meta: MetaType::PartialStruct,
                    sub_meta: SubMetaType::SubPartial,
                    size,
                    alignment: 1,
                    id: 0,
                    name: None,
                    typedef_target: None,
                    flags: DatatypeFlags::empty(),
                    variant: TypeVariant::PartialStruct { container, offset, size },
                    display_format: None,
                }))
            }
            TypeVariant::Union(_) => Some(self.insert_structural(Datatype {
                meta: MetaType::PartialUnion,
                sub_meta: SubMetaType::SubPartial,
                size,
                alignment: 1,
                id: 0,
                name: None,
                typedef_target: None,
                flags: DatatypeFlags::empty(),
                variant: TypeVariant::PartialUnion { container, offset, size },
                display_format: None,
            })),
            TypeVariant::Enum(_) if size < data.size => Some(self.insert_structural(Datatype {
                meta: MetaType::PartialEnum,
                sub_meta: SubMetaType::SubPartial,
                size,
                alignment: 1,
                id: 0,
                name: None,
                typedef_target: None,
                flags: DatatypeFlags::empty(),
                variant: TypeVariant::PartialEnum { container, offset, size },
                display_format: None,
            })),
            TypeVariant::Array { element, .. } => {
                let elem_size = self.get(*element).size;
                if elem_size == 0 {
                    return None;
                }
                if offset % elem_size == 0 && size == elem_size {
                    return Some(*element);
                }
                None
            }
            _ => None,
        }
    }

    /// Substitutes non-representable forms (e.g. size-1 `Code`) with a
    /// representable equivalent (`concretize`).
    pub fn concretize(&mut self, ty: TypeId) -> TypeId {
        let data = self.get(ty);
        if data.meta == MetaType::Code && data.size == 1 {
            return self.get_base(1, MetaType::Uint).unwrap_or(ty);
        }
        ty
    }

    /// Topological sort: for each type, recurse into its typedef target
    /// and each component before emitting the type itself (`dependentOrder`).
    pub fn dependent_order(&self) -> Vec<TypeId> {
        let mut visited = vec![false; self.arena.len()];
        let mut order = Vec::with_capacity(self.arena.len());
        for i in 0..self.arena.len() {
            self.visit_dependent(TypeId(i as u32), &mut visited, &mut order);
        }
        order
    }

    fn visit_dependent(&self, id: TypeId, visited: &mut [bool], order: &mut Vec<TypeId>) {
        if visited[id.0 as usize] {
            return;
        }
        visited[id.0 as usize] = true;
        let data = self.get(id);
        if let Some(target) = data.typedef_target {
            self.visit_dependent(target, visited, order);
        }
        match &data.variant {
            TypeVariant::Pointer { pointee } => self.visit_dependent(*pointee, visited, order),
            TypeVariant::PointerRel { container, pointee, stripped, .. } => {
                self.visit_dependent(*container, visited, order);
                self.visit_dependent(*pointee, visited, order);
                if let Some(s) = stripped {
                    self.visit_dependent(*s, visited, order);
                }
            }
            TypeVariant::Array { element, .. } => self.visit_dependent(*element, visited, order),
            TypeVariant::Struct(body) | TypeVariant::Union(body) => {
                for field in &body.fields {
                    self.visit_dependent(field.type_id, visited, order);
                }
            }
            TypeVariant::PartialStruct { container, .. }
            | TypeVariant::PartialUnion { container, .. }
            | TypeVariant::PartialEnum { container, .. } => self.visit_dependent(*container, visited, order),
            _ => {}
        }
        order.push(id);
    }

    /// Forbidden on core types; otherwise removes `id` from both indices
    /// and clears its warnings (`destroyType`).
    pub fn destroy_type(&mut self, id: TypeId) -> Result<()> {
        if self.get(id).flags.is_core() {
            let mut err = PcodeError::invariant("destroyType is forbidden on core types");
            if let Some(name) = &self.get(id).name {
                err = err.with_type(name.clone());
            }
            return Err(err.into());
        }
        if let Some(name) = self.get(id).name.clone() {
            self.name_index.remove(&(name, self.get(id).id));
        }
        let hash = structural_hash(self.get(id), &self.arena);
        if let Some(bucket) = self.structural_index.get_mut(&hash) {
            bucket.retain(|&x| x != id);
        }
        self.warnings.retain(|w| w.on != id);
        Ok(())
    }

    /// Count of `id`'s distinct dependents, not including `id` itself
    /// (`dependent_order` is self-inclusive since it also serves as a
    /// valid destruction/emission order; `num_depend` subtracts the one
    /// entry that's `id`).
    pub fn num_depend(&self, id: TypeId) -> usize {
        let mut visited = vec![false; self.arena.len()];
        let mut order = Vec::new();
        self.visit_dependent(id, &mut visited, &mut order);
        order.len().saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> TypeFactory {
        TypeFactory::new(8)
    }

    #[test]
    fn type_dedup_scenario_2() {
        let mut f = factory();
        let int32 = f.get_base(4, MetaType::Int).unwrap();
        // Forward-declare S so the pointer field can reference it.
        let s_stub = f.get_type_struct("S", None).unwrap();
        let ptr_to_s = f.get_type_pointer(s_stub, 4);
        let fields = vec![("a".to_string(), int32), ("next".to_string(), ptr_to_s)];

        let s1 = f.get_type_struct("S", Some(fields.clone())).unwrap();
        let s2 = f.get_type_struct("S", Some(fields)).unwrap();
        assert_eq!(s1, s2);
        assert_eq!(s1, s_stub); // completing a stub in place keeps its id
        assert_eq!(f.num_depend(s1), 2); // int32, ptr_to_s (S itself doesn't count)
        let TypeVariant::Struct(body) = &f.get(s1).variant else { panic!() };
        let ptr_field = body.fields[1].type_id;
        assert_eq!(f.get(ptr_field).sub_meta, SubMetaType::SubPtrStruct);
    }

    #[test]
    fn variable_length_instances_have_distinct_entries_scenario_3() {
        let mut f = factory();
        let byte = f.get_base(1, MetaType::Unknown).unwrap();
        let blob16 = f.get_type_array(byte, 16);
        let blob32 = f.get_type_array(byte, 32);
        assert_ne!(blob16, blob32);
        assert_ne!(f.get(blob16).id, f.get(blob32).id);
    }

    #[test]
    fn get_exact_piece_beyond_size_is_none() {
        let mut f = factory();
        let int32 = f.get_base(4, MetaType::Int).unwrap();
        assert!(f.get_exact_piece(int32, 4, 1).is_none());
    }

    #[test]
    fn size_one_array_needs_resolution() {
        let mut f = factory();
        let int32 = f.get_base(4, MetaType::Int).unwrap();
        let arr = f.get_type_array(int32, 1);
        assert!(f.get(arr).flags.needs_resolution());
    }

    #[test]
    fn assign_field_offsets_rounds_to_alignment() {
        let mut f = factory();
        let byte = f.get_base(1, MetaType::Uint).unwrap();
        let int32 = f.get_base(4, MetaType::Int).unwrap();
        let s = f.get_type_struct("Packed", Some(vec![("a".into(), byte), ("b".into(), int32)])).unwrap();
        let TypeVariant::Struct(body) = &f.get(s).variant else { panic!() };
        assert_eq!(body.fields[0].offset, 0);
        assert_eq!(body.fields[1].offset, 4); // rounded up to int32's alignment
        assert_eq!(f.get(s).size, 8);
    }

    #[test]
    fn set_fields_drops_overlap_and_warns() {
        let mut f = factory();
        let int32 = f.get_base(4, MetaType::Int).unwrap();
        let stub = f.get_type_struct("Weird", None).unwrap();
        // Debug-info-derived offsets can disagree with a clean layout;
        // "b" overlaps "a" and must be dropped with a warning.
        f.set_fields(
            stub,
            vec![
                Field { offset: 0, name: "a".into(), type_id: int32 },
                Field { offset: 2, name: "b".into(), type_id: int32 },
            ],
        )
        .unwrap();
        let TypeVariant::Struct(body) = &f.get(stub).variant else { panic!() };
        assert_eq!(body.fields.len(), 1);
        assert_eq!(f.warnings.len(), 1);
        assert!(!f.get(stub).is_incomplete());
    }

    #[test]
    fn duplicate_enum_values_warn_and_autoassign_skips_taken() {
        let mut f = factory();
        let en = f.get_type_enum("E", 4);
        let mut explicit = HashMap::new();
        explicit.insert("A".to_string(), 0u64);
        explicit.insert("B".to_string(), 0u64);
        f.assign_enum_values(en, vec!["A".into(), "B".into(), "C".into()], explicit).unwrap();
        assert_eq!(f.warnings.len(), 1);
        let TypeVariant::Enum(body) = &f.get(en).variant else { panic!() };
        let values: HashMap<_, _> = body.members.iter().cloned().collect();
        assert_eq!(values["A"], 0);
        assert_ne!(values["C"], 0);
    }

    #[test]
    fn dependent_order_respects_dependencies() {
        let mut f = factory();
        let int32 = f.get_base(4, MetaType::Int).unwrap();
        let ptr = f.get_type_pointer(int32, 4);
        let order = f.dependent_order();
        let pos_int = order.iter().position(|&x| x == int32).unwrap();
        let pos_ptr = order.iter().position(|&x| x == ptr).unwrap();
        assert!(pos_int < pos_ptr);
    }

    #[test]
    fn typedef_rejects_conflicting_redefinition() {
        let mut f = factory();
        let int32 = f.get_base(4, MetaType::Int).unwrap();
        let byte = f.get_base(1, MetaType::Uint).unwrap();
        f.get_typedef(int32, "word", None, None).unwrap();
        assert!(f.get_typedef(byte, "word", None, None).is_err());
    }

    #[test]
    fn typedef_with_format_sets_force_display_format() {
        let mut f = factory();
        let int32 = f.get_base(4, MetaType::Int).unwrap();
        let hex_word = f.get_typedef(int32, "HANDLE", Some(0xdead), Some(DisplayFormat::Hex)).unwrap();
        assert!(f.get(hex_word).flags.force_display_format());
        assert_eq!(f.get(hex_word).display_format, Some(DisplayFormat::Hex));
        assert_eq!(f.get(hex_word).id, 0xdead);
    }

    #[test]
    fn destroy_type_forbidden_on_core() {
        let mut f = factory();
        let int32 = f.get_base(4, MetaType::Int).unwrap();
        assert!(f.destroy_type(int32).is_err());
    }

    #[test]
    fn struct_with_tail_padding_warns_alignment_adjusted() {
        let mut f = factory();
        let byte = f.get_base(1, MetaType::Uint).unwrap();
        let int32 = f.get_base(4, MetaType::Int).unwrap();
        // int32 then a trailing byte: the byte ends at offset 5, but the
        // struct's own alignment (4, from int32) pads the size to 8.
        let s = f.get_type_struct("Tailed", Some(vec![("a".into(), int32), ("b".into(), byte)])).unwrap();
        assert_eq!(f.get(s).size, 8);
        assert_eq!(f.warnings.len(), 1);
        assert!(matches!(f.warnings[0].kind, TypeWarningKind::AlignmentAdjusted { from: 5, to: 8 }));
    }

    #[test]
    fn array_fit_truncates_and_warns_when_not_a_multiple() {
        let mut f = factory();
        let int32 = f.get_base(4, MetaType::Int).unwrap();
        let arr = f.get_type_array_fit(int32, 10); // only 2 whole int32s fit
        let TypeVariant::Array { len, .. } = &f.get(arr).variant else { panic!() };
        assert_eq!(*len, 2);
        assert_eq!(f.get(arr).size, 8);
        assert_eq!(f.warnings.len(), 1);
        assert!(matches!(
            f.warnings[0].kind,
            TypeWarningKind::TruncationSynthesized { declared: 10, actual: 8 }
        ));
    }
}
