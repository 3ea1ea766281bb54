//! Data-type-aware split. Given a `STORE`/`LOAD`/`COPY` whose
//! struct-typed operand has multiple primitive fields, break it into one op
//! per field: a `STORE` splits into one `STORE` per field, each addressed by
//! a `PTRADD`-computed field pointer and fed by a `SUBPIECE` that peels the
//! field's bytes out of the struct value; a `LOAD` splits symmetrically into
//! one `LOAD` per field, re-concatenated with `PIECE` into the original
//! value so a caller that still reads the whole struct keeps working; a
//! `COPY` of a struct value is decomposed into one `SUBPIECE` extraction per
//! field and folded back the same way, so per-field rewrites downstream have
//! individual field values to work with even when nothing but a `COPY`
//! separates them from the original value.
//!
//! A field that is itself a composite or an array is left alone — splitting
//! recurses one level only.

use anyhow::Result;

use crate::action::Rule;
use crate::error::RuleAction;
use crate::funcdata::Funcdata;
use crate::opcode::OpCode;
use crate::pcodeop::OpId;
use crate::transform::TransformManager;
use crate::types::{Field, MetaType, TypeId, TypeVariant};

/// Fields of `ty` eligible for a one-level split: more than one primitive
/// field, none of them itself a composite or an array.
fn splittable_fields(f: &Funcdata, ty: TypeId) -> Option<Vec<Field>> {
    let fields = match &f.types.get(ty).variant {
        TypeVariant::Struct(body) if body.fields.len() > 1 => body.fields.clone(),
        _ => return None,
    };
    if fields.iter().any(|fld| matches!(f.types.get(fld.type_id).meta, MetaType::Struct | MetaType::Union | MetaType::Array)) {
        return None;
    }
    Some(fields)
}

pub struct SplitDatatype;

impl Rule for SplitDatatype {
    fn name(&self) -> &str {
        "split-datatype"
    }

    fn opcodes(&self) -> &[OpCode] {
        const OPS: [OpCode; 3] = [OpCode::Store, OpCode::Load, OpCode::Copy];
        &OPS
    }

    fn apply(&self, f: &mut Funcdata, op: OpId) -> Result<RuleAction> {
        let Some(pcode) = f.op(op) else { return Ok(RuleAction::NONE) };
        match pcode.opcode {
            OpCode::Store => split_store(f, op),
            OpCode::Load => split_load(f, op),
            OpCode::Copy => split_copy(f, op),
            _ => Ok(RuleAction::NONE),
        }
    }
}

fn split_store(f: &mut Funcdata, op: OpId) -> Result<RuleAction> {
    let Some(pcode) = f.op(op) else { return Ok(RuleAction::NONE) };
    if pcode.inputs.len() != 3 {
        return Ok(RuleAction::NONE);
    }
    let (space_const, pointer, value) = (pcode.inputs[0], pcode.inputs[1], pcode.inputs[2]);
    let Some(block) = pcode.parent else { return Ok(RuleAction::NONE) };
    let Some(pos) = pcode.block_pos else { return Ok(RuleAction::NONE) };

    let Some(value_ty) = f.varnode(value).data_type else { return Ok(RuleAction::NONE) };
    let Some(fields) = splittable_fields(f, value_ty) else { return Ok(RuleAction::NONE) };

    let ptr_bits = f.varnode(pointer).size * 8;
    let mut mgr = TransformManager::new();
    let space_var = mgr.preexisting(space_const, f.varnode(space_const).size * 8);
    let pointer_var = mgr.preexisting(pointer, ptr_bits);
    let value_var = mgr.preexisting(value, f.varnode(value).size * 8);

    for (idx, field) in fields.iter().enumerate() {
        let offset_const = mgr.new_constant(ptr_bits, field.offset as u64);
        let ptradd = mgr.new_op(OpCode::PtrAdd, 2);
        mgr.op_set_input(ptradd, 0, pointer_var)?;
        mgr.op_set_input(ptradd, 1, offset_const)?;
        let field_ptr = mgr.new_unique(ptr_bits);
        mgr.op_set_output(ptradd, field_ptr)?;

        let field_bytes = f.types.get(field.type_id).size;
        let shift_const = mgr.new_constant(ptr_bits, field.offset as u64);
        let subpiece = mgr.new_op(OpCode::SubPiece, 2);
        mgr.op_set_input(subpiece, 0, value_var)?;
        mgr.op_set_input(subpiece, 1, shift_const)?;
        let field_value = mgr.new_unique(field_bytes * 8);
        mgr.op_set_output(subpiece, field_value)?;

        let store = if idx == 0 { mgr.new_op_replace(OpCode::Store, 3, op) } else { mgr.new_op(OpCode::Store, 3) };
        mgr.op_set_input(store, 0, space_var)?;
        mgr.op_set_input(store, 1, field_ptr)?;
        mgr.op_set_input(store, 2, field_value)?;
    }

    mgr.mark_terminator_reached();
    mgr.apply(f, block, pos as usize)?;
    Ok(RuleAction::made(1))
}

fn split_load(f: &mut Funcdata, op: OpId) -> Result<RuleAction> {
    let Some(pcode) = f.op(op) else { return Ok(RuleAction::NONE) };
    if pcode.inputs.len() != 2 {
        return Ok(RuleAction::NONE);
    }
    let Some(out) = pcode.output else { return Ok(RuleAction::NONE) };
    let (space_const, pointer) = (pcode.inputs[0], pcode.inputs[1]);
    let Some(block) = pcode.parent else { return Ok(RuleAction::NONE) };
    let Some(pos) = pcode.block_pos else { return Ok(RuleAction::NONE) };

    let Some(out_ty) = f.varnode(out).data_type else { return Ok(RuleAction::NONE) };
    let Some(fields) = splittable_fields(f, out_ty) else { return Ok(RuleAction::NONE) };

    let ptr_bits = f.varnode(pointer).size * 8;
    let out_bits = f.varnode(out).size * 8;
    let mut mgr = TransformManager::new();
    let space_var = mgr.preexisting(space_const, f.varnode(space_const).size * 8);
    let pointer_var = mgr.preexisting(pointer, ptr_bits);
    let out_var = mgr.preexisting(out, out_bits);

    let mut field_values = Vec::with_capacity(fields.len());
    for field in &fields {
        let offset_const = mgr.new_constant(ptr_bits, field.offset as u64);
        let ptradd = mgr.new_op(OpCode::PtrAdd, 2);
        mgr.op_set_input(ptradd, 0, pointer_var)?;
        mgr.op_set_input(ptradd, 1, offset_const)?;
        let field_ptr = mgr.new_unique(ptr_bits);
        mgr.op_set_output(ptradd, field_ptr)?;

        let field_bytes = f.types.get(field.type_id).size;
        let load = mgr.new_op(OpCode::Load, 2);
        mgr.op_set_input(load, 0, space_var)?;
        mgr.op_set_input(load, 1, field_ptr)?;
        let field_value = mgr.new_unique(field_bytes * 8);
        mgr.op_set_output(load, field_value)?;
        field_values.push((field_value, field_bytes));
    }

    fold_fields_into(&mut mgr, &field_values, op, out_var)?;
    mgr.mark_terminator_reached();
    mgr.apply(f, block, pos as usize)?;
    Ok(RuleAction::made(1))
}

fn split_copy(f: &mut Funcdata, op: OpId) -> Result<RuleAction> {
    let Some(pcode) = f.op(op) else { return Ok(RuleAction::NONE) };
    if pcode.inputs.len() != 1 {
        return Ok(RuleAction::NONE);
    }
    let Some(out) = pcode.output else { return Ok(RuleAction::NONE) };
    let src = pcode.inputs[0];
    let Some(block) = pcode.parent else { return Ok(RuleAction::NONE) };
    let Some(pos) = pcode.block_pos else { return Ok(RuleAction::NONE) };

    let Some(src_ty) = f.varnode(src).data_type else { return Ok(RuleAction::NONE) };
    let Some(fields) = splittable_fields(f, src_ty) else { return Ok(RuleAction::NONE) };

    let src_bits = f.varnode(src).size * 8;
    let out_bits = f.varnode(out).size * 8;
    let mut mgr = TransformManager::new();
    let src_var = mgr.preexisting(src, src_bits);
    let out_var = mgr.preexisting(out, out_bits);

    let mut field_values = Vec::with_capacity(fields.len());
    for field in &fields {
        let field_bytes = f.types.get(field.type_id).size;
        let shift_const = mgr.new_constant(src_bits, field.offset as u64);
        let subpiece = mgr.new_op(OpCode::SubPiece, 2);
        mgr.op_set_input(subpiece, 0, src_var)?;
        mgr.op_set_input(subpiece, 1, shift_const)?;
        let field_value = mgr.new_unique(field_bytes * 8);
        mgr.op_set_output(subpiece, field_value)?;
        field_values.push((field_value, field_bytes));
    }

    fold_fields_into(&mut mgr, &field_values, op, out_var)?;
    mgr.mark_terminator_reached();
    mgr.apply(f, block, pos as usize)?;
    Ok(RuleAction::made(1))
}

/// Folds per-field values back together low-offset-to-high with `PIECE`,
/// retiring `op` and producing `out_var` directly from the final fold —
/// the reconstruction side of a LOAD/COPY split, mirroring lane-division's
/// own low-to-high fold.
fn fold_fields_into(
    mgr: &mut TransformManager,
    field_values: &[(crate::transform::TransformVarId, u32)],
    op: OpId,
    out_var: crate::transform::TransformVarId,
) -> Result<()> {
    let (mut acc, mut acc_bytes) = field_values[0];
    let last = field_values.len() - 2;
    for (i, &(next, next_bytes)) in field_values[1..].iter().enumerate() {
        let is_last = i == last;
        let piece = if is_last { mgr.new_op_replace(OpCode::Piece, 2, op) } else { mgr.new_op(OpCode::Piece, 2) };
        mgr.op_set_input(piece, 0, next)?;
        mgr.op_set_input(piece, 1, acc)?;
        acc_bytes += next_bytes;
        let combined = if is_last { out_var } else { mgr.new_unique(acc_bytes * 8) };
        mgr.op_set_output(piece, combined)?;
        acc = combined;
    }
    Ok(())
}
