//! `pcode-tools`: small diagnostic subcommands exercising the core without
//! depending on an out-of-scope translator or console. Each subcommand
//! builds a synthetic `Funcdata`/`TypeFactory` from an in-memory op list and
//! prints bank/type-factory/rewrite state.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

use pcode_core::action::{Action, Rule};
use pcode_core::block::EdgeKind;
use pcode_core::config::ArchConfig;
use pcode_core::emulate::Emulator;
use pcode_core::funcdata::Funcdata;
use pcode_core::opcode::OpCode;
use pcode_core::rules::{ConditionalExecution, LaneDivide, SplitDatatype, SubfloatFlow, SubvarFlow};
use pcode_core::space::{Address, SpaceIndex};
use pcode_core::types::MetaType;
use pcode_core::varnode::{FlowRole, NZMask};

#[derive(Clone, Debug, Parser)]
struct Args {
    #[command(subcommand)]
    operation: Operation,
}

#[derive(Clone, Debug, Subcommand)]
enum Operation {
    /// Build a small op chain and dump the bank's live/dead listing.
    BankDemo,
    /// Intern a handful of base and composite types and dump the arena.
    TypeDemo,
    /// Run one of the rewrite rules against a matching synthetic op.
    RewriteDemo(RewriteDemoArgs),
    /// Step a tiny LOAD/LOAD/ADD/STORE sequence through the emulator.
    EmulateDemo,
}

#[derive(Clone, Debug, Parser)]
struct RewriteDemoArgs {
    #[arg(value_enum)]
    rule: RuleName,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RuleName {
    Condexec,
    Subvar,
    Splitdatatype,
    Lanedivide,
    Subfloat,
}

fn addr(off: u64) -> Address {
    Address::new(SpaceIndex(0), off)
}

fn bank_demo() -> Result<()> {
    let mut f = Funcdata::new("demo", 8);
    let b = f.blocks.create_block();

    let a = f.new_varnode(addr(0x10), 4, FlowRole::Free);
    let c = f.new_varnode(addr(0x20), 4, FlowRole::Free);
    let add = f.create_op(b, 0, addr(0x1000), 0, OpCode::IntAdd, 2)?;
    f.op_set_input(add, 0, a)?;
    f.op_set_input(add, 1, c)?;
    let sum = f.new_varnode(addr(0x30), 4, FlowRole::Free);
    f.op_set_output(add, sum)?;

    let copy = f.create_op(b, 1, addr(0x1004), 0, OpCode::Copy, 1)?;
    f.op_set_input(copy, 0, sum)?;
    let dst = f.new_varnode(addr(0x40), 4, FlowRole::Free);
    f.op_set_output(copy, dst)?;

    println!("bank: {} alive op(s)", f.bank().iter_alive().count());
    for op_id in f.bank().iter_alive() {
        let op = f.op(op_id).expect("alive op present");
        println!("  {:?} @ {:x} opcode={:?}", op_id, op.seq.address.offset, op.opcode);
    }
    f.destroy_op(copy)?;
    println!("after destroying the copy: {} alive, {} dead", f.bank().iter_alive().count(), f.bank().iter_dead().count());
    Ok(())
}

fn type_demo() -> Result<()> {
    let cfg = ArchConfig::generic(8);
    let mut types = pcode_core::types::TypeFactory::new(cfg.max_basetype_size);

    let byte = types.get_base(1, MetaType::Uint)?;
    let int32 = types.get_base(4, MetaType::Int)?;
    let again = types.get_base(4, MetaType::Int)?;
    println!("int32 interned twice dedups to the same id: {}", int32 == again);

    let pair = types.get_type_struct("Pair", Some(vec![("tag".into(), byte), ("value".into(), int32)]))?;
    let ptr = types.get_type_pointer(pair, 8);

    println!("type arena has {} entries", types.arena().len());
    println!("Pair size = {} bytes", types.get(pair).size);
    println!("pointer-to-Pair size = {} bytes", types.get(ptr).size);
    Ok(())
}

fn rewrite_demo(args: &RewriteDemoArgs) -> Result<()> {
    match args.rule {
        RuleName::Condexec => {
            let mut f = Funcdata::new("demo", 8);
            let initblock = f.blocks.create_block();
            let prea = f.blocks.create_block();
            let preb = f.blocks.create_block();
            let iblock = f.blocks.create_block();
            let posta = f.blocks.create_block();
            let postb = f.blocks.create_block();

            let x = f.new_varnode(addr(0x1000), 4, FlowRole::Free);
            let ten = f.new_varnode(addr(10), 4, FlowRole::Constant);

            let init_cmp = f.create_op(initblock, 0, addr(0x10), 0, OpCode::IntSLess, 2)?;
            f.op_set_input(init_cmp, 0, x)?;
            f.op_set_input(init_cmp, 1, ten)?;
            let cmp_out_init = f.new_varnode(addr(0x2000), 1, FlowRole::Free);
            f.op_set_output(init_cmp, cmp_out_init)?;
            let init_branch = f.create_op(initblock, 1, addr(0x14), 0, OpCode::CBranch, 2)?;
            f.op_set_input(init_branch, 0, cmp_out_init)?;
            f.blocks.add_edge(initblock, prea, EdgeKind::Taken);
            f.blocks.add_edge(initblock, preb, EdgeKind::Fallthrough);
            f.blocks.add_edge(prea, iblock, EdgeKind::Fallthrough);
            f.blocks.add_edge(preb, iblock, EdgeKind::Fallthrough);

            let i_cmp = f.create_op(iblock, 0, addr(0x100), 0, OpCode::IntSLess, 2)?;
            f.op_set_input(i_cmp, 0, x)?;
            let ten2 = f.new_varnode(addr(10), 4, FlowRole::Constant);
            f.op_set_input(i_cmp, 1, ten2)?;
            let cmp_out_i = f.new_varnode(addr(0x2004), 1, FlowRole::Free);
            f.op_set_output(i_cmp, cmp_out_i)?;
            let i_branch = f.create_op(iblock, 1, addr(0x104), 0, OpCode::CBranch, 2)?;
            f.op_set_input(i_branch, 0, cmp_out_i)?;
            f.blocks.add_edge(iblock, posta, EdgeKind::Taken);
            f.blocks.add_edge(iblock, postb, EdgeKind::Fallthrough);

            let rule = ConditionalExecution;
            let action = rule.apply(&mut f)?;
            println!("rule {} made {} change(s); iblock now has {} op(s)", rule.name(), action.count(), f.blocks.get(iblock).ops.len());
        }
        RuleName::Subvar => {
            let mut f = Funcdata::new("demo", 8);
            let b = f.blocks.create_block();
            let wide = f.new_varnode(addr(0x10), 4, FlowRole::Free);
            f.varnode_mut(wide).nonzero_mask = NZMask(1);
            let mask = f.new_varnode(addr(1), 4, FlowRole::Constant);
            let and = f.create_op(b, 0, addr(0x2000), 0, OpCode::IntAnd, 2)?;
            f.op_set_input(and, 0, wide)?;
            f.op_set_input(and, 1, mask)?;
            let out = f.new_varnode(addr(0x20), 4, FlowRole::Free);
            f.op_set_output(and, out)?;
            run_rule(&mut f, and, SubvarFlow { mask: 1 })?;
        }
        RuleName::Splitdatatype => {
            let mut f = Funcdata::new("demo", 8);
            let b = f.blocks.create_block();
            let byte = f.types.get_base(1, MetaType::Uint)?;
            let int32 = f.types.get_base(4, MetaType::Int)?;
            let ty = f.types.get_type_struct("Pair", Some(vec![("tag".into(), byte), ("value".into(), int32)]))?;
            let space = f.new_varnode(addr(0), 1, FlowRole::Constant);
            let pointer = f.new_varnode(addr(0x2000), 4, FlowRole::Free);
            let value = f.new_varnode(addr(0x10), 8, FlowRole::Free);
            f.varnode_mut(value).data_type = Some(ty);
            let store = f.create_op(b, 0, addr(0x100), 0, OpCode::Store, 3)?;
            f.op_set_input(store, 0, space)?;
            f.op_set_input(store, 1, pointer)?;
            f.op_set_input(store, 2, value)?;
            run_rule(&mut f, store, SplitDatatype)?;
        }
        RuleName::Lanedivide => {
            let mut f = Funcdata::new("demo", 8);
            let b = f.blocks.create_block();
            let a = f.new_varnode(addr(0x10), 4, FlowRole::Free);
            let c = f.new_varnode(addr(0x20), 4, FlowRole::Free);
            let op = f.create_op(b, 0, addr(0x100), 0, OpCode::IntAnd, 2)?;
            f.op_set_input(op, 0, a)?;
            f.op_set_input(op, 1, c)?;
            let out = f.new_varnode(addr(0x30), 4, FlowRole::Free);
            f.op_set_output(op, out)?;
            run_rule(&mut f, op, LaneDivide { lane_bytes: 2 })?;
        }
        RuleName::Subfloat => {
            let mut f = Funcdata::new("demo", 8);
            let b = f.blocks.create_block();
            let src_a = f.new_varnode(addr(0x10), 4, FlowRole::Free);
            let conv_a = f.create_op(b, 0, addr(0x1000), 0, OpCode::FloatFloat2Float, 1)?;
            f.op_set_input(conv_a, 0, src_a)?;
            let wide_a = f.new_varnode(addr(0x18), 8, FlowRole::Free);
            f.op_set_output(conv_a, wide_a)?;

            let src_b = f.new_varnode(addr(0x20), 4, FlowRole::Free);
            let conv_b = f.create_op(b, 1, addr(0x1004), 0, OpCode::FloatFloat2Float, 1)?;
            f.op_set_input(conv_b, 0, src_b)?;
            let wide_b = f.new_varnode(addr(0x28), 8, FlowRole::Free);
            f.op_set_output(conv_b, wide_b)?;

            let op = f.create_op(b, 2, addr(0x100), 0, OpCode::FloatAdd, 2)?;
            f.op_set_input(op, 0, wide_a)?;
            f.op_set_input(op, 1, wide_b)?;
            let out = f.new_varnode(addr(0x30), 8, FlowRole::Free);
            f.op_set_output(op, out)?;
            run_rule(&mut f, op, SubfloatFlow { target_bytes: 4 })?;
        }
    }
    Ok(())
}

fn run_rule(f: &mut Funcdata, op: pcode_core::pcodeop::OpId, rule: impl Rule) -> Result<()> {
    let action = rule.apply(f, op)?;
    println!("rule {} made {} change(s)", rule.name(), action.count());
    println!("bank now has {} alive op(s):", f.bank().iter_alive().count());
    for op_id in f.bank().iter_alive() {
        println!("  {:?}", f.op(op_id).expect("alive op present").opcode);
    }
    Ok(())
}

fn emulate_demo() -> Result<()> {
    let mut f = Funcdata::new("demo", 8);
    let ram = pcode_core::space::AddrSpace::new(SpaceIndex(0), "ram", 8, pcode_core::space::Endian::Little)?;
    let b = f.blocks.create_block();

    let space_const = f.new_varnode(addr(0), 1, FlowRole::Constant);
    let ptr_a = f.new_varnode(addr(0x10), 8, FlowRole::Constant);
    let ptr_b = f.new_varnode(addr(0x18), 8, FlowRole::Constant);
    let ptr_out = f.new_varnode(addr(0x20), 8, FlowRole::Constant);

    let load_a = f.create_op(b, 0, addr(0x1000), 0, OpCode::Load, 2)?;
    f.op_set_input(load_a, 0, space_const)?;
    f.op_set_input(load_a, 1, ptr_a)?;
    let val_a = f.new_varnode(addr(0x1000), 8, FlowRole::Free);
    f.op_set_output(load_a, val_a)?;

    let load_b = f.create_op(b, 1, addr(0x1001), 0, OpCode::Load, 2)?;
    f.op_set_input(load_b, 0, space_const)?;
    f.op_set_input(load_b, 1, ptr_b)?;
    let val_b = f.new_varnode(addr(0x1001), 8, FlowRole::Free);
    f.op_set_output(load_b, val_b)?;

    let add = f.create_op(b, 2, addr(0x1002), 0, OpCode::IntAdd, 2)?;
    f.op_set_input(add, 0, val_a)?;
    f.op_set_input(add, 1, val_b)?;
    let sum = f.new_varnode(addr(0x1002), 8, FlowRole::Free);
    f.op_set_output(add, sum)?;

    let store = f.create_op(b, 3, addr(0x1003), 0, OpCode::Store, 3)?;
    f.op_set_input(store, 0, space_const)?;
    f.op_set_input(store, 1, ptr_out)?;
    f.op_set_input(store, 2, sum)?;

    let endian = pcode_core::space::Endian::Little;
    let mut emu = Emulator::new(&mut f, vec![ram]);
    emu.memory_mut().set_bytes(addr(0x10), 8, 5, endian);
    emu.memory_mut().set_bytes(addr(0x18), 8, 7, endian);
    emu.set_current_op(load_a);

    emu.step()?;
    emu.step()?;
    emu.step()?;
    emu.step()?;

    let value = emu.memory().get_bytes(addr(0x20), 8, endian);
    println!("memory[0x20] = {value} (expected 12)");
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    match args.operation {
        Operation::BankDemo => bank_demo(),
        Operation::TypeDemo => type_demo(),
        Operation::RewriteDemo(ref rewrite_args) => rewrite_demo(rewrite_args),
        Operation::EmulateDemo => emulate_demo(),
    }
}
