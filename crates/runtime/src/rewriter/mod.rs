//! The rewriter: records guarded actions against virtual values, then
//! performs register allocation and emits a specialized fast path into an
//! IC slot.
//!
//! A rewrite has two phases. During *collecting*, dispatch code records a
//! sequence of actions (guards, loads, stores, calls) over virtual
//! variables ([`VarId`]s). Nothing is emitted yet; argument variables sit
//! in their calling-convention locations. Calling [`Rewriter::commit`]
//! switches to *emitting*: actions are replayed in order, registers are
//! allocated on demand (spilling the variable whose next use is farthest
//! away), and machine code is written into a scratch buffer that the slot
//! manager installs atomically.
//!
//! Guards must all precede the first mutation: until the last guard has
//! been emitted, argument variables keep their original locations so a
//! failing guard can fall through to the slow path with the world intact.

mod location;

pub use location::{LocMap, Location, N_SCRATCH_SLOTS};

use crate::asm::{self, Assembler, ConditionCode, Immediate, Indirect, JumpDestination, MovType, Register, XMMRegister};
use crate::asm::GenericRegister;
use crate::ics::icinfo::{
    get_ic_info, CommitOutcome, ICSlotRewrite, NextSlotJumpInfo, IC_INVALIDATION_HEADER_SIZE,
};
use crate::ics::invalidator::ICInvalidator;
use crate::objects::{dealloc_object, PyObject, REFCNT_OFFSET};
use crate::stats::StatCounter;

pub type VarId = usize;

/// Placeholder occupying reserved scratch cells in the location map.
const LOCATION_PLACEHOLDER: VarId = usize::MAX;

static IC_REWRITES: StatCounter = StatCounter::new("ic_rewrites");
static IC_REWRITES_COMMITTED: StatCounter = StatCounter::new("ic_rewrites_committed");
static IC_REWRITES_ABORTED_FAILED: StatCounter = StatCounter::new("ic_rewrites_aborted_failed");
static IC_REWRITES_ABORTED_ASSEMBLYFAIL: StatCounter =
    StatCounter::new("ic_rewrites_aborted_assemblyfail");
static IC_REWRITES_ABORTED: StatCounter = StatCounter::new("ic_rewrites_aborted");
static IC_ATTEMPTS: StatCounter = StatCounter::new("ic_attempts");
static IC_ATTEMPTS_NOPATCH: StatCounter = StatCounter::new("ic_attempts_nopatch");
static IC_ATTEMPTS_SKIPPED: StatCounter = StatCounter::new("ic_attempts_skipped");
static IC_ATTEMPTS_SKIPPED_MEGAMORPHIC: StatCounter =
    StatCounter::new("ic_attempts_skipped_megamorphic");
static IC_ATTEMPTS_STARTED: StatCounter = StatCounter::new("ic_attempts_started");

/// Registers available to the allocator. No RSP/RBP, and no callee-saves:
/// the unwinder cannot find callee-saves an IC spilled if a throwing call
/// intervenes, so they are spill destinations only.
const ALLOCATABLE_REGS: [Register; 9] = [
    asm::RAX,
    asm::RCX,
    asm::RDX,
    asm::RDI,
    asm::RSI,
    asm::R8,
    asm::R9,
    asm::R10,
    asm::R11,
];

/// Callee-saved registers usable as free spill targets.
const SPILL_TARGET_REGS: [Register; 5] = [asm::RBX, asm::R12, asm::R13, asm::R14, asm::R15];

const CALLER_SAVE_GP: [Register; 9] = ALLOCATABLE_REGS;

/// Reference-count ownership of a rewriter variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefType {
    Unknown,
    /// Holds a reference that must be given up before the fast path exits.
    Owned,
    Borrowed,
}

/// Comparison operators the rewriter can emit inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActionType {
    Normal,
    Guard,
    Mutation,
}

/// Recorded operation with its operands stored inline.
#[derive(Debug, Clone)]
enum ActionData {
    Guard { var: VarId, val: VarId, negate: bool },
    AttrGuard { var: VarId, offset: i32, val: VarId, negate: bool },
    GetAttr { result: VarId, var: VarId, offset: i32, dest: Location, mov: MovType },
    GetAttrFloat { result: VarId, var: VarId, offset: i32, dest: Location },
    GetAttrDouble { result: VarId, var: VarId, offset: i32, dest: Location },
    SetAttr { var: VarId, offset: i32, val: VarId },
    Cmp { result: VarId, v1: VarId, op: CmpOp, v2: VarId, dest: Location },
    ToBool { result: VarId, var: VarId, dest: Location },
    Add { result: VarId, a: VarId, b: i64, dest: Location },
    Call { result: VarId, has_side_effects: bool, func: usize, args: Vec<VarId>, args_xmm: Vec<VarId> },
    Allocate { result: VarId, n: usize },
    AllocateAndCopy { result: VarId, array: VarId, n_from: usize, n_alloc: usize },
    AllocateAndCopyPlus1 { result: VarId, first: VarId, rest: Option<VarId>, n_rest: usize },
    CheckAndThrowCapiException { var: VarId, exc_val: i64 },
    Incref { var: VarId },
    MoveToReturn { var: VarId },
    Trap,
}

struct Action {
    data: ActionData,
    consumed_refs: Vec<VarId>,
}

struct RewriterVar {
    is_arg: bool,
    arg_loc: Location,
    is_constant: bool,
    constant_value: u64,
    locations: Vec<Location>,
    uses: Vec<usize>,
    next_use: usize,
    reftype: RefType,
    nullable: bool,
    num_refs_consumed: u32,
    attr_guards: Vec<(i32, u64, bool)>,
    /// `(first_cell, n_cells)` of a scratch-array reservation.
    scratch_allocation: (i32, i32),
}

impl RewriterVar {
    fn new() -> RewriterVar {
        RewriterVar {
            is_arg: false,
            arg_loc: Location::Uninitialized,
            is_constant: false,
            constant_value: 0,
            locations: Vec::new(),
            uses: Vec::new(),
            next_use: 0,
            reftype: RefType::Unknown,
            nullable: false,
            num_refs_consumed: 0,
            attr_guards: Vec::new(),
            scratch_allocation: (0, 0),
        }
    }

    fn is_in_location(&self, l: Location) -> bool {
        self.locations.contains(&l)
    }

    fn is_done_using(&self) -> bool {
        self.next_use == self.uses.len()
    }

    fn has_scratch_allocation(&self) -> bool {
        self.scratch_allocation.1 > 0
    }

    fn needs_decref(&self) -> bool {
        self.reftype == RefType::Owned && self.num_refs_consumed == 0
    }
}

pub fn is_large_constant(val: i64) -> bool {
    !(i32::MIN as i64..=i32::MAX as i64).contains(&val)
}

pub struct Rewriter {
    rewrite: ICSlotRewrite,

    vars: Vec<RewriterVar>,
    consts: Vec<(u64, VarId)>,
    args: Vec<VarId>,
    live_outs: Vec<VarId>,
    live_out_regs: Vec<u8>,

    actions: Vec<Action>,
    vars_by_location: LocMap<VarId>,

    return_location: Location,

    failed: bool,
    finished: bool,
    phase_emitting: bool,
    added_changing_action: bool,
    marked_inside_ic: bool,
    done_guarding: bool,
    last_guard_action: Option<usize>,

    offset_eq_jmp_slowpath: Option<usize>,
    offset_ne_jmp_slowpath: Option<usize>,
    next_slot_jumps: Vec<NextSlotJumpInfo>,

    gc_references: Vec<*mut PyObject>,
    decref_infos: Vec<(u64, Vec<Location>)>,

    /// Owned variables that reached their last use mid-action; their
    /// decrefs are emitted at the next action boundary, where it is safe
    /// to emit a deallocator call.
    pending_decrefs: Vec<VarId>,
}

impl Rewriter {
    /// Front door used by the dispatch slow paths: find the IC for the
    /// call site's return address and open a rewrite if allowed.
    pub fn create_rewriter(
        rtn_addr: *const u8,
        num_args: usize,
        debug_name: &'static str,
    ) -> Option<Rewriter> {
        IC_ATTEMPTS.log();
        if rtn_addr.is_null() {
            IC_ATTEMPTS_NOPATCH.log();
            return None;
        }
        let ic = match get_ic_info(rtn_addr) {
            Some(ic) => ic,
            None => {
                IC_ATTEMPTS_NOPATCH.log();
                return None;
            }
        };
        let ic = unsafe { &mut *ic };
        if !ic.should_attempt() {
            IC_ATTEMPTS_SKIPPED.log();
            if ic.is_megamorphic() {
                IC_ATTEMPTS_SKIPPED_MEGAMORPHIC.log();
            }
            return None;
        }
        let rewrite = ic.start_rewrite(debug_name)?;
        IC_ATTEMPTS_STARTED.log();
        Some(Rewriter::new(rewrite, num_args, ic.live_outs.clone()))
    }

    pub fn new(rewrite: ICSlotRewrite, num_args: usize, live_out_regs: Vec<u8>) -> Rewriter {
        IC_REWRITES.log();

        let return_location = match rewrite.return_register() {
            Some(r) => Location::Register(r),
            None => Location::None,
        };

        let mut rw = Rewriter {
            rewrite,
            vars: Vec::new(),
            consts: Vec::new(),
            args: Vec::new(),
            live_outs: Vec::new(),
            live_out_regs: Vec::new(),
            actions: Vec::new(),
            vars_by_location: LocMap::new(),
            return_location,
            failed: false,
            finished: false,
            phase_emitting: false,
            added_changing_action: false,
            marked_inside_ic: false,
            done_guarding: false,
            last_guard_action: None,
            offset_eq_jmp_slowpath: None,
            offset_ne_jmp_slowpath: None,
            next_slot_jumps: Vec::new(),
            gc_references: Vec::new(),
            decref_infos: Vec::new(),
            pending_decrefs: Vec::new(),
        };

        for i in 0..num_args {
            let l = Location::for_arg(i);
            let var = rw.create_new_var();
            rw.vars[var].is_arg = true;
            rw.vars[var].arg_loc = l;
            rw.vars[var].locations.push(l);
            rw.vars_by_location.insert(l, var);
            rw.args.push(var);
        }

        // Live-ins derived from the live-out list get a variable each so
        // allocation keeps them intact across the rewrite.
        for &dwarf_regnum in &live_out_regs {
            let l: Location = GenericRegister::from_dwarf(dwarf_regnum).into();
            assert!(l != rw.return_location);

            let var = match rw.vars_by_location.get(l) {
                Some(v) => v,
                None => {
                    let v = rw.create_new_var();
                    rw.vars[v].locations.push(l);
                    rw.vars_by_location.insert(l, v);
                    v
                }
            };

            assert!(!rw.live_out_regs.contains(&dwarf_regnum));
            rw.live_outs.push(var);
            rw.live_out_regs.push(dwarf_regnum);
        }

        rw
    }

    pub fn debug_name(&self) -> &'static str {
        self.rewrite.debug_name()
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn get_return_destination(&self) -> Location {
        self.return_location
    }

    /// Rewrite effort budget: starts high, shrinks as the IC backs off or
    /// approaches megamorphic.
    pub fn aggressiveness(&self) -> i32 {
        let ic = unsafe { &*self.rewrite.ic() };
        100 - ic.percent_backedoff() as i32 - ic.percent_megamorphic() as i32
    }

    /// Register that the emitted code embeds an owned reference to `obj`.
    pub fn add_gc_reference(&mut self, obj: *mut PyObject) {
        unsafe { crate::objects::incref(obj) };
        self.gc_references.push(obj);
    }

    pub fn add_dependence_on(&mut self, invalidator: &mut ICInvalidator) {
        self.rewrite.add_dependence_on(invalidator);
    }

    // ---- Collecting-phase API ----

    fn create_new_var(&mut self) -> VarId {
        self.vars.push(RewriterVar::new());
        self.vars.len() - 1
    }

    fn create_new_constant_var(&mut self, val: u64) -> VarId {
        let var = self.create_new_var();
        self.vars[var].is_constant = true;
        self.vars[var].constant_value = val;
        var
    }

    fn add_action(&mut self, data: ActionData, uses: &[VarId], kind: ActionType) {
        debug_assert!(!self.phase_emitting);
        if self.failed {
            return;
        }
        let idx = self.actions.len();
        for &var in uses {
            self.vars[var].uses.push(idx);
        }
        match kind {
            ActionType::Mutation => self.added_changing_action = true,
            ActionType::Guard => {
                if self.added_changing_action {
                    self.failed = true;
                    return;
                }
                for i in 0..self.args.len() {
                    let arg = self.args[i];
                    self.vars[arg].uses.push(idx);
                }
                self.last_guard_action = Some(idx);
            }
            ActionType::Normal => {}
        }
        self.actions.push(Action {
            data,
            consumed_refs: Vec::new(),
        });
    }

    pub fn get_arg(&self, argnum: usize) -> VarId {
        self.args[argnum]
    }

    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    pub fn load_const(&mut self, val: i64, _dest: Location) -> VarId {
        for &(cval, cvar) in &self.consts {
            if cval == val as u64 {
                return cvar;
            }
        }
        let var = self.create_new_constant_var(val as u64);
        self.consts.push((val as u64, var));
        var
    }

    pub fn is_constant(&self, var: VarId) -> bool {
        self.vars[var].is_constant
    }

    pub fn constant_value(&self, var: VarId) -> u64 {
        debug_assert!(self.vars[var].is_constant);
        self.vars[var].constant_value
    }

    pub fn set_type(&mut self, var: VarId, reftype: RefType) -> VarId {
        self.vars[var].reftype = reftype;
        var
    }

    pub fn set_nullable(&mut self, var: VarId, nullable: bool) -> VarId {
        self.vars[var].nullable = nullable;
        var
    }

    /// The reference held by `var` was passed off by the most recent
    /// action (stored into owning memory, or given to a stealing callee).
    pub fn ref_consumed(&mut self, var: VarId) {
        if self.failed {
            return;
        }
        self.vars[var].num_refs_consumed += 1;
        if let Some(action) = self.actions.last_mut() {
            action.consumed_refs.push(var);
        }
    }

    pub fn add_guard(&mut self, var: VarId, val: u64) {
        if self.failed {
            return;
        }
        if self.vars[var].is_constant {
            assert_eq!(
                self.vars[var].constant_value, val,
                "added guard which is always false"
            );
            return;
        }
        let val_var = self.load_const(val as i64, Location::any());
        self.add_action(
            ActionData::Guard { var, val: val_var, negate: false },
            &[var, val_var],
            ActionType::Guard,
        );
    }

    pub fn add_guard_not_eq(&mut self, var: VarId, val: u64) {
        if self.failed {
            return;
        }
        let val_var = self.load_const(val as i64, Location::any());
        self.add_action(
            ActionData::Guard { var, val: val_var, negate: true },
            &[var, val_var],
            ActionType::Guard,
        );
    }

    pub fn add_attr_guard(&mut self, var: VarId, offset: i32, val: u64, negate: bool) {
        if self.failed {
            return;
        }
        // Duplicate attribute guards are common when several lookups walk
        // the same classes; emit each check once.
        if self.vars[var].attr_guards.contains(&(offset, val, negate)) {
            return;
        }
        self.vars[var].attr_guards.push((offset, val, negate));
        let val_var = self.load_const(val as i64, Location::any());
        self.add_action(
            ActionData::AttrGuard { var, offset, val: val_var, negate },
            &[var, val_var],
            ActionType::Guard,
        );
    }

    pub fn get_attr(&mut self, var: VarId, offset: i32, dest: Location, mov: MovType) -> VarId {
        let result = self.create_new_var();
        self.add_action(
            ActionData::GetAttr { result, var, offset, dest, mov },
            &[var],
            ActionType::Normal,
        );
        result
    }

    pub fn get_attr_float(&mut self, var: VarId, offset: i32, dest: Location) -> VarId {
        let result = self.create_new_var();
        self.add_action(
            ActionData::GetAttrFloat { result, var, offset, dest },
            &[var],
            ActionType::Normal,
        );
        result
    }

    pub fn get_attr_double(&mut self, var: VarId, offset: i32, dest: Location) -> VarId {
        let result = self.create_new_var();
        self.add_action(
            ActionData::GetAttrDouble { result, var, offset, dest },
            &[var],
            ActionType::Normal,
        );
        result
    }

    pub fn set_attr(&mut self, var: VarId, offset: i32, val: VarId) {
        self.add_action(
            ActionData::SetAttr { var, offset, val },
            &[var, val],
            ActionType::Mutation,
        );
    }

    pub fn cmp(&mut self, op: CmpOp, v1: VarId, v2: VarId, dest: Location) -> VarId {
        let result = self.create_new_var();
        self.add_action(
            ActionData::Cmp { result, v1, op, v2, dest },
            &[v1, v2],
            ActionType::Normal,
        );
        result
    }

    pub fn to_bool(&mut self, var: VarId, dest: Location) -> VarId {
        let result = self.create_new_var();
        self.add_action(
            ActionData::ToBool { result, var, dest },
            &[var],
            ActionType::Normal,
        );
        result
    }

    pub fn add(&mut self, a: VarId, b: i64, dest: Location) -> VarId {
        let result = self.create_new_var();
        self.add_action(ActionData::Add { result, a, b, dest }, &[a], ActionType::Normal);
        result
    }

    /// Record a call. `has_side_effects` must be true whenever the callee
    /// can run Python code or do anything user-visible if the IC bails
    /// mid-sequence; it forces mutation ordering and the `num_inside`
    /// bracket.
    pub fn call(&mut self, has_side_effects: bool, func: usize, args: &[VarId]) -> VarId {
        self.call_with_xmm(has_side_effects, func, args, &[])
    }

    pub fn call_with_xmm(
        &mut self,
        has_side_effects: bool,
        func: usize,
        args: &[VarId],
        args_xmm: &[VarId],
    ) -> VarId {
        let result = self.create_new_var();
        let mut uses = Vec::with_capacity(args.len() + args_xmm.len());
        uses.extend_from_slice(args);
        uses.extend_from_slice(args_xmm);
        let kind = if has_side_effects {
            ActionType::Mutation
        } else {
            ActionType::Normal
        };
        self.add_action(
            ActionData::Call {
                result,
                has_side_effects,
                func,
                args: args.to_vec(),
                args_xmm: args_xmm.to_vec(),
            },
            &uses,
            kind,
        );
        result
    }

    /// Reserve `n` contiguous pointer-sized scratch cells; the variable's
    /// value is the address of the first.
    pub fn allocate(&mut self, n: usize) -> VarId {
        let result = self.create_new_var();
        self.add_action(ActionData::Allocate { result, n }, &[], ActionType::Normal);
        result
    }

    pub fn allocate_and_copy(&mut self, array: VarId, n: usize) -> VarId {
        self.allocate_and_copy_uneven(array, n, n)
    }

    /// Allocate `n_alloc` cells and copy the first `n_from` from `array`.
    pub fn allocate_and_copy_uneven(&mut self, array: VarId, n_from: usize, n_alloc: usize) -> VarId {
        assert!(n_alloc >= n_from);
        let result = self.create_new_var();
        self.add_action(
            ActionData::AllocateAndCopy { result, array, n_from, n_alloc },
            &[array],
            ActionType::Normal,
        );
        result
    }

    pub fn allocate_and_copy_plus1(
        &mut self,
        first: VarId,
        rest: Option<VarId>,
        n_rest: usize,
    ) -> VarId {
        assert_eq!(rest.is_some(), n_rest > 0);
        let result = self.create_new_var();
        let mut uses = vec![first];
        if let Some(rest) = rest {
            uses.push(rest);
        }
        self.add_action(
            ActionData::AllocateAndCopyPlus1 { result, first, rest, n_rest },
            &uses,
            ActionType::Normal,
        );
        result
    }

    /// Emit `if (var == exc_val) { return NULL through the patchpoint }`.
    /// Only valid for ICs without live-outs (trampolines), where a null
    /// return with a pending error is the complete error protocol.
    pub fn check_and_throw_capi_exception(&mut self, var: VarId, exc_val: i64) {
        // Returning null through the continuation is only the complete
        // error protocol when the caller expects nothing else preserved.
        if !self.live_outs.is_empty() {
            self.failed = true;
            return;
        }
        self.add_action(
            ActionData::CheckAndThrowCapiException { var, exc_val },
            &[var],
            ActionType::Mutation,
        );
    }

    /// Record an inline refcount increment of `var`'s object.
    pub fn incref(&mut self, var: VarId) {
        self.add_action(ActionData::Incref { var }, &[var], ActionType::Mutation);
    }

    pub fn trap(&mut self) {
        self.add_action(ActionData::Trap, &[], ActionType::Normal);
    }

    // ---- Commit / abort ----

    pub fn abort(&mut self) {
        assert!(!self.finished);
        self.finished = true;
        self.rewrite.abort();
        IC_REWRITES_ABORTED.log();
        for p in self.gc_references.drain(..) {
            unsafe { crate::objects::decref(p) };
        }
    }

    /// Move `var` into the return register as the final action, then
    /// commit. The returned reference is handed to the caller, so an
    /// owned `var` is considered consumed.
    pub fn commit_returning(&mut self, var: VarId) {
        debug_assert!(self.vars[var].reftype != RefType::Unknown);
        self.add_action(ActionData::MoveToReturn { var }, &[var], ActionType::Normal);
        // Ownership of the reference transfers out of the fast path.
        self.vars[var].num_refs_consumed += 1;
        self.commit();
    }

    /// Same, for values that are not Python objects (no refcounting).
    pub fn commit_returning_non_python(&mut self, var: VarId) {
        self.add_action(ActionData::MoveToReturn { var }, &[var], ActionType::Normal);
        self.commit();
    }

    pub fn commit(&mut self) {
        assert!(!self.finished);
        self.phase_emitting = true;

        if self.failed {
            IC_REWRITES_ABORTED_FAILED.log();
            self.abort();
            return;
        }
        if self.rewrite.assembler().has_failed() {
            IC_REWRITES_ABORTED_ASSEMBLYFAIL.log();
            self.abort();
            return;
        }

        // Synthetic end-of-sequence uses: live-outs must survive to the
        // end, and constants stay rematerializable for the const loader.
        let end_idx = self.actions.len();
        for i in 0..self.live_outs.len() {
            let var = self.live_outs[i];
            self.vars[var].uses.push(end_idx);
        }
        for var in 0..self.vars.len() {
            if self.vars[var].is_constant {
                self.vars[var].uses.push(end_idx);
            }
        }

        self.assert_consistent();

        if self.last_guard_action.is_none() {
            self.on_done_guarding();
        }

        let actions = std::mem::take(&mut self.actions);
        for (i, action) in actions.iter().enumerate() {
            self.emit_action(&action.data);
            self.flush_pending_decrefs();

            if self.failed || self.rewrite.assembler().has_failed() {
                // Distinguish logical failures from out-of-space.
                if self.rewrite.assembler().has_failed() {
                    IC_REWRITES_ABORTED_ASSEMBLYFAIL.log();
                } else {
                    IC_REWRITES_ABORTED_FAILED.log();
                }
                self.abort();
                return;
            }

            self.assert_consistent();
            if Some(i) == self.last_guard_action {
                self.on_done_guarding();
            }
        }

        if self.marked_inside_ic {
            self.emit_mark_outside_ic();
            if self.failed || self.rewrite.assembler().has_failed() {
                IC_REWRITES_ABORTED_ASSEMBLYFAIL.log();
                self.abort();
                return;
            }
        }

        // All uses should be accounted for now except the synthetic ones.
        #[cfg(debug_assertions)]
        {
            for (id, var) in self.vars.iter().enumerate() {
                let num_as_live_out = self.live_outs.iter().filter(|&&lo| lo == id).count();
                debug_assert_eq!(
                    var.next_use + num_as_live_out + (var.is_constant as usize),
                    var.uses.len(),
                    "unbalanced uses for var {}",
                    id
                );
            }
            // Every consumption registered on an action must be reflected
            // in its variable's counter.
            let mut consumed_per_var = vec![0u32; self.vars.len()];
            for action in &actions {
                for &v in &action.consumed_refs {
                    consumed_per_var[v] += 1;
                }
            }
            for (id, &n) in consumed_per_var.iter().enumerate() {
                debug_assert!(self.vars[id].num_refs_consumed >= n);
            }
        }

        for var in 0..self.vars.len() {
            if self.vars[var].is_constant {
                self.bump_use(var);
            }
        }

        if self.failed {
            IC_REWRITES_ABORTED_FAILED.log();
            self.abort();
            return;
        }

        // Live-out placement: a live-out may sit in another live-out's
        // target register, so iterate, moving whichever can move, until
        // everything is in place. A conflict cycle makes no progress and
        // aborts.
        let num_live_outs = self.live_outs.len();
        let mut moved = vec![false; num_live_outs];
        let mut num_to_move = num_live_outs;
        while num_to_move > 0 {
            let start_move = num_to_move;
            for i in 0..num_live_outs {
                if moved[i] {
                    continue;
                }
                let expected: Location = GenericRegister::from_dwarf(self.live_out_regs[i]).into();
                let var = self.live_outs[i];

                if self.vars[var].is_in_location(expected) {
                    moved[i] = true;
                    num_to_move -= 1;
                    continue;
                }
                if self.vars_by_location.contains(expected) {
                    continue;
                }

                match expected {
                    Location::Register(r) => {
                        let got = self.var_get_in_reg(var, Location::Register(r), true, Location::any());
                        debug_assert!(self.failed || got == r);
                    }
                    Location::Xmm(r) => {
                        let got = self.var_get_in_xmm_reg(var, Location::Xmm(r));
                        debug_assert!(self.failed || got == r);
                    }
                    other => panic!("live-out in {:?}", other),
                }
                if self.failed {
                    IC_REWRITES_ABORTED_FAILED.log();
                    self.abort();
                    return;
                }

                for l in self.vars[var].locations.clone() {
                    if l != expected {
                        self.remove_location_from_var(var, l);
                    }
                }
                moved[i] = true;
                num_to_move -= 1;
            }
            assert!(num_to_move < start_move, "live-out shuffle is not making progress");
        }

        for i in 0..num_live_outs {
            let expected: Location = GenericRegister::from_dwarf(self.live_out_regs[i]).into();
            debug_assert!(self.vars[self.live_outs[i]].is_in_location(expected));
        }
        for i in 0..num_live_outs {
            let var = self.live_outs[i];
            self.bump_use(var);
        }

        #[cfg(debug_assertions)]
        for (_, v) in self.vars_by_location.entries() {
            debug_assert_eq!(v, LOCATION_PLACEHOLDER);
        }

        if self.rewrite.assembler().has_failed() {
            IC_REWRITES_ABORTED_ASSEMBLYFAIL.log();
            self.abort();
            return;
        }

        // Finish: jump to the continuation point and pad the slot.
        let continue_offset =
            unsafe { (*self.rewrite.ic()).continue_addr as i64 - self.rewrite.slot_start() as i64 };
        self.rewrite.assembler().comment("jump to continue");
        self.rewrite
            .assembler()
            .jmp(JumpDestination::from_start(continue_offset));
        let fastpath_size = self.rewrite.assembler().bytes_written();
        self.rewrite.assembler().fill_with_nops();

        if self.rewrite.assembler().has_failed() {
            IC_REWRITES_ABORTED_ASSEMBLYFAIL.log();
            self.abort();
            return;
        }

        let gc_references = std::mem::take(&mut self.gc_references);
        let decref_infos = std::mem::take(&mut self.decref_infos);
        let jumps = std::mem::take(&mut self.next_slot_jumps);
        let outcome = self
            .rewrite
            .commit(fastpath_size, gc_references, decref_infos, &jumps);

        self.finished = true;
        if outcome == CommitOutcome::Committed {
            IC_REWRITES_COMMITTED.log();
        }
    }

    fn on_done_guarding(&mut self) {
        self.done_guarding = true;
        for i in 0..self.args.len() {
            let arg = self.args[i];
            if self.vars[arg].is_done_using() {
                for l in self.vars[arg].locations.clone() {
                    self.vars_by_location.erase(l);
                }
                self.vars[arg].locations.clear();
            }
        }
        self.assert_consistent();
    }

    // ---- Emission ----

    fn emit_action(&mut self, data: &ActionData) {
        match *data {
            ActionData::Guard { var, val, negate } => self.emit_guard(var, val, negate),
            ActionData::AttrGuard { var, offset, val, negate } => {
                self.emit_attr_guard(var, offset, val, negate)
            }
            ActionData::GetAttr { result, var, offset, dest, mov } => {
                self.emit_getattr(result, var, offset, dest, mov)
            }
            ActionData::GetAttrFloat { result, var, offset, dest } => {
                self.emit_getattr_float(result, var, offset, dest)
            }
            ActionData::GetAttrDouble { result, var, offset, dest } => {
                self.emit_getattr_double(result, var, offset, dest)
            }
            ActionData::SetAttr { var, offset, val } => self.emit_setattr(var, offset, val),
            ActionData::Cmp { result, v1, op, v2, dest } => self.emit_cmp(result, v1, op, v2, dest),
            ActionData::ToBool { result, var, dest } => self.emit_to_bool(result, var, dest),
            ActionData::Add { result, a, b, dest } => self.emit_add(result, a, b, dest),
            ActionData::Call { result, has_side_effects, func, ref args, ref args_xmm } => {
                let args = args.clone();
                let args_xmm = args_xmm.clone();
                self.emit_call_action(result, has_side_effects, func, &args, &args_xmm)
            }
            ActionData::Allocate { result, n } => {
                self.emit_allocate(result, n);
            }
            ActionData::AllocateAndCopy { result, array, n_from, n_alloc } => {
                self.emit_allocate_and_copy(result, array, n_from, n_alloc)
            }
            ActionData::AllocateAndCopyPlus1 { result, first, rest, n_rest } => {
                self.emit_allocate_and_copy_plus1(result, first, rest, n_rest)
            }
            ActionData::CheckAndThrowCapiException { var, exc_val } => {
                self.emit_check_and_throw_capi_exception(var, exc_val)
            }
            ActionData::Incref { var } => self.emit_incref(var),
            ActionData::MoveToReturn { var } => self.emit_move_to_return(var),
            ActionData::Trap => self.rewrite.assembler().trap(),
        }
    }

    /// Jump to the slot's slow-path fall-through on `condition_eq`
    /// (equal) or its negation. Guards share the target, so once one jump
    /// with the same condition is close enough we jump to *it* instead,
    /// keeping the 2-byte encoding.
    fn emit_slowpath_jump(&mut self, condition_eq: bool) {
        let slot_size = self.rewrite.slot_size();
        let condition = if condition_eq {
            ConditionCode::Equal
        } else {
            ConditionCode::NotEqual
        };

        let written = self.rewrite.assembler().bytes_written();
        let left = self.rewrite.assembler().bytes_left();
        let last_jmp_offset = if condition_eq {
            &mut self.offset_eq_jmp_slowpath
        } else {
            &mut self.offset_ne_jmp_slowpath
        };

        match *last_jmp_offset {
            Some(last) if left >= 0x80 && written - last < 0x80 => {
                self.rewrite
                    .assembler()
                    .jmp_cond(JumpDestination::from_start(last as i64), condition);
            }
            _ => {
                *last_jmp_offset = Some(written);
                self.rewrite
                    .assembler()
                    .jmp_cond(JumpDestination::from_start(slot_size as i64), condition);
                let end = self.rewrite.assembler().bytes_written();
                self.next_slot_jumps.push((written, end, condition));
            }
        }
    }

    fn emit_guard(&mut self, var: VarId, val_constant: VarId, negate: bool) {
        self.rewrite.assembler().comment("guard");

        debug_assert!(self.vars[val_constant].is_constant);
        let val = self.vars[val_constant].constant_value;

        let var_reg = self.var_get_in_reg(var, Location::any(), false, Location::any());
        if self.failed {
            return;
        }
        if is_large_constant(val as i64) {
            let reg = self.var_get_in_reg(
                val_constant,
                Location::any(),
                true,
                Location::Register(var_reg),
            );
            if self.failed {
                return;
            }
            self.rewrite.assembler().cmp_reg_reg(var_reg, reg);
        } else {
            self.rewrite.assembler().cmp_reg_imm(var_reg, Immediate(val));
        }

        // Only movs from here to the jump: restoring can't touch flags.
        self.restore_args();
        if self.failed {
            return;
        }
        self.assert_args_in_place();
        self.emit_slowpath_jump(negate);

        self.bump_use(var);
        self.bump_use(val_constant);
        self.assert_consistent();
    }

    fn emit_attr_guard(&mut self, var: VarId, offset: i32, val_constant: VarId, negate: bool) {
        self.rewrite.assembler().comment("attr guard");

        debug_assert!(self.vars[val_constant].is_constant);
        let val = self.vars[val_constant].constant_value;

        let var_reg = self.var_get_in_reg(var, Location::any(), true, Location::any());
        if self.failed {
            return;
        }

        if is_large_constant(val as i64) {
            let reg = if val_constant == var {
                var_reg
            } else {
                let r = self.var_get_in_reg(
                    val_constant,
                    Location::any(),
                    true,
                    Location::Register(var_reg),
                );
                if self.failed {
                    return;
                }
                r
            };
            self.rewrite
                .assembler()
                .cmp_mem_reg(Indirect::new(var_reg, offset), reg);
        } else {
            self.rewrite
                .assembler()
                .cmp_mem_imm(Indirect::new(var_reg, offset), Immediate(val));
        }

        self.restore_args();
        if self.failed {
            return;
        }
        self.assert_args_in_place();
        self.emit_slowpath_jump(negate);

        self.bump_use(var);
        self.bump_use(val_constant);
        self.assert_consistent();
    }

    fn emit_getattr(&mut self, result: VarId, var: VarId, offset: i32, dest: Location, mov: MovType) {
        self.rewrite.assembler().comment("getattr");

        let ptr_reg = self.var_get_in_reg(var, Location::any(), true, Location::any());
        if self.failed {
            return;
        }

        // Fine to free the source now: the result may land in its register.
        self.bump_use(var);

        let newvar_reg = self.var_initialize_in_reg(result, dest);
        if self.failed {
            return;
        }
        self.rewrite
            .assembler()
            .mov_generic(Indirect::new(ptr_reg, offset), newvar_reg, mov);

        self.release_if_no_uses(result);
        self.assert_consistent();
    }

    fn emit_getattr_float(&mut self, result: VarId, var: VarId, offset: i32, dest: Location) {
        self.rewrite.assembler().comment("getattr float");

        let ptr_reg = self.var_get_in_reg(var, Location::any(), false, Location::any());
        if self.failed {
            return;
        }
        self.bump_use(var);

        let newvar_reg = self.var_initialize_in_xmm_reg(result, dest);
        self.rewrite
            .assembler()
            .movss_mem_xmm(Indirect::new(ptr_reg, offset), newvar_reg);
        self.rewrite.assembler().cvtss2sd(newvar_reg, newvar_reg);

        self.release_if_no_uses(result);
        self.assert_consistent();
    }

    fn emit_getattr_double(&mut self, result: VarId, var: VarId, offset: i32, dest: Location) {
        self.rewrite.assembler().comment("getattr double");

        let ptr_reg = self.var_get_in_reg(var, Location::any(), false, Location::any());
        if self.failed {
            return;
        }
        self.bump_use(var);

        let newvar_reg = self.var_initialize_in_xmm_reg(result, dest);
        self.rewrite
            .assembler()
            .movsd_mem_xmm(Indirect::new(ptr_reg, offset), newvar_reg);

        self.release_if_no_uses(result);
        self.assert_consistent();
    }

    fn emit_setattr(&mut self, var: VarId, offset: i32, val: VarId) {
        self.rewrite.assembler().comment("setattr");

        let ptr_reg = self.var_get_in_reg(var, Location::any(), false, Location::any());
        if self.failed {
            return;
        }

        let imm = self.try_get_as_immediate(val);
        match imm {
            Some(imm) => {
                self.rewrite
                    .assembler()
                    .movq_imm_mem(imm, Indirect::new(ptr_reg, offset));
            }
            None => {
                let val_reg =
                    self.var_get_in_reg(val, Location::any(), false, Location::Register(ptr_reg));
                if self.failed {
                    return;
                }
                debug_assert!(ptr_reg != val_reg);
                self.rewrite
                    .assembler()
                    .mov_reg_mem(val_reg, Indirect::new(ptr_reg, offset));
            }
        }

        self.bump_use(var);

        // A stored scratch array must outlive its tracked uses; the store
        // published the pointer somewhere the tracker cannot see.
        if self.vars[val].has_scratch_allocation() {
            self.vars[val].scratch_allocation = (0, 0);
        }
        self.bump_use(val);

        self.assert_consistent();
    }

    fn emit_cmp(&mut self, result: VarId, v1: VarId, op: CmpOp, v2: VarId, dest: Location) {
        self.rewrite.assembler().comment("cmp");

        // Pin the result register first so loading the operands can
        // neither clobber it nor be clobbered by it.
        let newvar_reg = self.alloc_reg(dest, Location::any());
        if self.failed {
            return;
        }
        self.var_initialize_in_specific_reg(result, newvar_reg);

        let v1_reg =
            self.var_get_in_reg(v1, Location::any(), false, Location::Register(newvar_reg));
        if self.failed {
            return;
        }
        let v2_reg =
            self.var_get_in_reg(v2, Location::any(), false, Location::Register(newvar_reg));
        if self.failed {
            return;
        }
        debug_assert!(v1_reg != v2_reg && v1_reg != newvar_reg && v2_reg != newvar_reg);

        // Zero the full register before the compare; setcc writes one byte.
        self.rewrite.assembler().clear_reg(newvar_reg);
        self.rewrite.assembler().cmp_reg_reg(v1_reg, v2_reg);
        match op {
            CmpOp::Eq => self.rewrite.assembler().sete(newvar_reg),
            CmpOp::NotEq => self.rewrite.assembler().setne(newvar_reg),
        }

        self.bump_use(v1);
        self.bump_use(v2);
        self.release_if_no_uses(result);
        self.assert_consistent();
    }

    fn emit_to_bool(&mut self, result: VarId, var: VarId, dest: Location) {
        self.rewrite.assembler().comment("to_bool");

        let result_reg = self.alloc_reg(dest, Location::any());
        if self.failed {
            return;
        }
        self.var_initialize_in_specific_reg(result, result_reg);

        let this_reg =
            self.var_get_in_reg(var, Location::any(), false, Location::Register(result_reg));
        if self.failed {
            return;
        }
        debug_assert!(this_reg != result_reg);

        self.rewrite.assembler().clear_reg(result_reg);
        self.rewrite.assembler().test(this_reg, this_reg);
        self.rewrite.assembler().setnz(result_reg);

        self.bump_use(var);
        self.release_if_no_uses(result);
        self.assert_consistent();
    }

    fn emit_add(&mut self, result: VarId, a: VarId, b: i64, dest: Location) {
        self.rewrite.assembler().comment("add");

        let newvar_reg = self.alloc_reg(dest, Location::any());
        if self.failed {
            return;
        }
        let a_reg = self.var_get_in_reg(a, Location::any(), true, Location::Register(newvar_reg));
        if self.failed {
            return;
        }
        debug_assert!(a_reg != newvar_reg);

        self.var_initialize_in_specific_reg(result, newvar_reg);
        self.rewrite.assembler().mov_reg_reg(a_reg, newvar_reg);
        assert!(!is_large_constant(b));
        self.rewrite.assembler().add_imm(Immediate(b as u64), newvar_reg);

        self.bump_use(a);
        self.release_if_no_uses(result);
        self.assert_consistent();
    }

    fn emit_allocate(&mut self, result: VarId, n: usize) -> Option<i32> {
        self.rewrite.assembler().comment("allocate");
        assert!(n >= 1);

        let scratch_size = self.rewrite.scratch_size();
        let mut consec = 0usize;
        let mut i = 0;
        while i < scratch_size {
            let l = Location::Scratch(i as i32);
            if !self.vars_by_location.contains(l) {
                consec += 1;
                if consec == n {
                    let first_cell = (i / 8 + 1 - n) as i32;
                    // Reserve the cells so nothing else lands in them.
                    for cell in first_cell..first_cell + n as i32 {
                        let m = Location::Scratch(cell * 8);
                        self.vars_by_location.insert(m, LOCATION_PLACEHOLDER);
                    }
                    debug_assert_eq!(self.vars[result].scratch_allocation, (0, 0));
                    self.vars[result].scratch_allocation = (first_cell, n as i32);

                    let r = self.var_initialize_in_reg(result, Location::any());
                    if self.failed {
                        return None;
                    }
                    let rsp_offset = 8 * first_cell + self.rewrite.scratch_rsp_offset();
                    self.rewrite
                        .assembler()
                        .lea(Indirect::new(asm::RSP, rsp_offset), r);

                    self.assert_consistent();
                    self.release_if_no_uses(result);
                    return Some(first_cell);
                }
            } else {
                consec = 0;
            }
            i += 8;
        }
        self.failed = true;
        None
    }

    fn emit_allocate_and_copy(&mut self, result: VarId, array: VarId, n_from: usize, n_alloc: usize) {
        self.rewrite.assembler().comment("allocate_and_copy");

        let offset = match self.emit_allocate(result, n_alloc) {
            Some(o) => o,
            None => return,
        };

        let src_ptr = self.var_get_in_reg(array, Location::any(), false, Location::any());
        if self.failed {
            return;
        }
        let tmp = self.alloc_reg(Location::any(), Location::Register(src_ptr));
        if self.failed {
            return;
        }
        debug_assert!(tmp != src_ptr);

        let rsp_base = self.rewrite.scratch_rsp_offset();
        for i in 0..n_from {
            self.rewrite
                .assembler()
                .mov_mem_reg(Indirect::new(src_ptr, (8 * i) as i32), tmp);
            self.rewrite
                .assembler()
                .mov_reg_mem(tmp, Indirect::new(asm::RSP, 8 * (offset + i as i32) + rsp_base));
        }

        self.bump_use(array);
        self.release_if_no_uses(result);
        self.assert_consistent();
    }

    fn emit_allocate_and_copy_plus1(
        &mut self,
        result: VarId,
        first: VarId,
        rest: Option<VarId>,
        n_rest: usize,
    ) {
        self.rewrite.assembler().comment("allocate_and_copy_plus1");

        let offset = match self.emit_allocate(result, n_rest + 1) {
            Some(o) => o,
            None => return,
        };

        let rsp_base = self.rewrite.scratch_rsp_offset();
        let first_reg = self.var_get_in_reg(first, Location::any(), false, Location::any());
        if self.failed {
            return;
        }
        self.rewrite
            .assembler()
            .mov_reg_mem(first_reg, Indirect::new(asm::RSP, 8 * offset + rsp_base));

        if let Some(rest) = rest {
            let src_ptr = self.var_get_in_reg(rest, Location::any(), false, Location::any());
            if self.failed {
                return;
            }
            let tmp = self.alloc_reg(Location::any(), Location::Register(src_ptr));
            if self.failed {
                return;
            }
            debug_assert!(tmp != src_ptr);

            for i in 0..n_rest {
                self.rewrite
                    .assembler()
                    .mov_mem_reg(Indirect::new(src_ptr, (8 * i) as i32), tmp);
                self.rewrite.assembler().mov_reg_mem(
                    tmp,
                    Indirect::new(asm::RSP, 8 * (offset + 1 + i as i32) + rsp_base),
                );
            }
            self.bump_use(rest);
        }

        self.bump_use(first);
        self.release_if_no_uses(result);
        self.assert_consistent();
    }

    fn emit_check_and_throw_capi_exception(&mut self, var: VarId, exc_val: i64) {
        self.rewrite.assembler().comment("check capi exception");

        let var_reg = self.var_get_in_reg(var, Location::any(), false, Location::any());
        if self.failed {
            return;
        }
        if exc_val == 0 {
            self.rewrite.assembler().test(var_reg, var_reg);
        } else {
            assert!(!is_large_constant(exc_val));
            self.rewrite
                .assembler()
                .cmp_reg_imm(var_reg, Immediate(exc_val as u64));
        }

        // On the error value: leave with a null result. The callee already
        // parked the exception; the patchpoint's continuation returns it.
        let jump = self
            .rewrite
            .assembler()
            .begin_forward_jump(ConditionCode::NotEqual);
        let continue_offset =
            unsafe { (*self.rewrite.ic()).continue_addr as i64 - self.rewrite.slot_start() as i64 };
        self.rewrite.assembler().clear_reg(asm::RAX);
        self.rewrite
            .assembler()
            .jmp(JumpDestination::from_start(continue_offset));
        self.rewrite.assembler().end_forward_jump(jump);

        self.bump_use(var);
        self.assert_consistent();
    }

    fn emit_incref(&mut self, var: VarId) {
        self.rewrite.assembler().comment("incref");
        let reg = self.var_get_in_reg(var, Location::any(), true, Location::any());
        if self.failed {
            return;
        }
        self.rewrite
            .assembler()
            .incl(Indirect::new(reg, REFCNT_OFFSET));
        self.bump_use(var);
        self.assert_consistent();
    }

    /// Inline decref at a variable's death: drop the count, and if it hit
    /// zero call the deallocator with every live caller-saved value moved
    /// somewhere safe first.
    fn emit_decref(&mut self, var: VarId) {
        self.rewrite.assembler().comment("decref at last use");

        let reg = self.var_get_in_reg(var, Location::any(), true, Location::any());
        if self.failed {
            return;
        }

        // Move everything else out of clobber range up front, so both
        // sides of the branches below see the same locations.
        self.spill_live_caller_saves_except(var);
        if self.failed {
            return;
        }

        let null_skip = if self.vars[var].nullable {
            self.rewrite.assembler().test(reg, reg);
            Some(self.rewrite.assembler().begin_forward_jump(ConditionCode::Equal))
        } else {
            None
        };

        self.rewrite.assembler().decl(Indirect::new(reg, REFCNT_OFFSET));
        let skip = self
            .rewrite
            .assembler()
            .begin_forward_jump(ConditionCode::NotEqual);

        if reg != asm::RDI {
            self.rewrite.assembler().mov_reg_reg(reg, asm::RDI);
        }
        self.rewrite
            .assembler()
            .emit_call(dealloc_object as usize, asm::R11);
        self.rewrite.assembler().end_forward_jump(skip);
        if let Some(j) = null_skip {
            self.rewrite.assembler().end_forward_jump(j);
        }
    }

    /// Make sure every caller-saved register holding a live value other
    /// than `dying` has a call-surviving location.
    fn spill_live_caller_saves_except(&mut self, dying: VarId) {
        for reg in CALLER_SAVE_GP {
            let l = Location::Register(reg);
            let var = match self.vars_by_location.get(l) {
                Some(v) if v != LOCATION_PLACEHOLDER && v != dying => v,
                _ => continue,
            };
            let has_safe_home = self.vars[var]
                .locations
                .iter()
                .any(|&loc| !loc.is_clobbered_by_call());
            if !has_safe_home {
                self.spill_register(reg, Location::any());
                if self.failed {
                    return;
                }
            } else {
                self.remove_location_from_var(var, l);
            }
        }
        for xmm in 0..XMMRegister::num_regs() as u8 {
            let l = Location::Xmm(XMMRegister(xmm));
            if let Some(v) = self.vars_by_location.get(l) {
                if v != LOCATION_PLACEHOLDER && v != dying {
                    self.spill_xmm_register(XMMRegister(xmm));
                    if self.failed {
                        return;
                    }
                }
            }
        }
    }

    fn emit_move_to_return(&mut self, var: VarId) {
        self.rewrite.assembler().comment("move to return register");
        if self.return_location != Location::None {
            self.var_get_in_reg(var, self.return_location, true, Location::any());
        }
        self.bump_use(var);
    }

    fn emit_mark_outside_ic(&mut self) {
        self.rewrite.assembler().comment("mark outside ic");
        let counter_addr = unsafe { &(*self.rewrite.picked_slot()).num_inside as *const i32 as u64 };
        if is_large_constant(counter_addr as i64) {
            let reg = self.alloc_reg(Location::any(), self.return_location);
            if self.failed {
                return;
            }
            self.rewrite
                .assembler()
                .mov_imm(Immediate(counter_addr), reg, false);
            self.rewrite.assembler().decl(Indirect::new(reg, 0));
        } else {
            self.rewrite.assembler().decl_addr(Immediate(counter_addr));
        }
    }

    fn emit_setup_call(&mut self, has_side_effects: bool, args: &[VarId], args_xmm: &[VarId], preserve: Location) {
        if has_side_effects {
            debug_assert!(self.done_guarding);

            // Keep the invalidation header writable: the return address of
            // any embedded call must be past the first patchable bytes.
            while self.rewrite.assembler().bytes_written() < IC_INVALIDATION_HEADER_SIZE {
                self.rewrite.assembler().nop();
            }

            if !self.marked_inside_ic {
                self.rewrite.assembler().comment("mark inside ic");
                let counter_addr =
                    unsafe { &(*self.rewrite.picked_slot()).num_inside as *const i32 as u64 };
                if is_large_constant(counter_addr as i64) {
                    let reg = self.alloc_reg(Location::any(), preserve);
                    if self.failed {
                        return;
                    }
                    self.rewrite
                        .assembler()
                        .mov_imm(Immediate(counter_addr), reg, false);
                    self.rewrite.assembler().incl(Indirect::new(reg, 0));
                } else {
                    self.rewrite.assembler().incl_addr(Immediate(counter_addr));
                }
                self.assert_consistent();
                self.marked_inside_ic = true;
            }
        }

        for (i, &var) in args.iter().enumerate() {
            let l = Location::for_arg(i);
            if self.vars[var].is_in_location(l) {
                continue;
            }
            let r = l.as_register();

            // Force the allocator to free the target register.
            let r2 = self.alloc_reg(l, preserve);
            if self.failed {
                return;
            }
            debug_assert_eq!(r, r2);
            debug_assert!(!self.vars_by_location.contains(l));

            match self.try_get_as_immediate(var) {
                Some(imm) => {
                    if imm.0 == 0 {
                        self.rewrite.assembler().clear_reg(r);
                    } else {
                        self.rewrite.assembler().mov_imm(imm, r, false);
                    }
                    self.add_location_to_var(var, l);
                }
                None => {
                    let r2 = self.var_get_in_reg(var, l, true, Location::any());
                    if self.failed {
                        return;
                    }
                    debug_assert_eq!(r2, r);
                }
            }
        }

        self.assert_consistent();

        for (i, &var) in args_xmm.iter().enumerate() {
            debug_assert!(self.vars[var].is_in_location(Location::Xmm(XMMRegister(i as u8))));
        }

        #[cfg(debug_assertions)]
        for (i, &var) in args.iter().enumerate() {
            debug_assert!(self.vars[var].is_in_location(Location::for_arg(i)));
        }

        // Spill anything else living only in caller-saved locations.
        for reg in CALLER_SAVE_GP {
            let check = Location::Register(reg);
            self.spill_location_for_call(check, args, preserve);
            if self.failed {
                return;
            }
        }
        for xmm in 0..XMMRegister::num_regs() as u8 {
            let check = Location::Xmm(XMMRegister(xmm));
            self.spill_location_for_call(check, args, preserve);
            if self.failed {
                return;
            }
        }

        self.assert_consistent();

        #[cfg(debug_assertions)]
        for (l, v) in self.vars_by_location.entries() {
            if v != LOCATION_PLACEHOLDER {
                debug_assert!(!l.is_clobbered_by_call(), "{:?} still live across call", l);
            }
        }
    }

    fn spill_location_for_call(&mut self, check: Location, args: &[VarId], preserve: Location) {
        let var = match self.vars_by_location.get(check) {
            Some(v) if v != LOCATION_PLACEHOLDER => v,
            _ => return,
        };

        let mut need_to_spill = !self.vars[var]
            .locations
            .iter()
            .any(|&l| !l.is_clobbered_by_call());

        if need_to_spill
            && args.contains(&var)
            && self.vars[var].is_done_using()
            && !self.vars[var].needs_decref()
        {
            // We hold the only remaining use; the call itself consumes it.
            // (Unless a decref is still owed afterwards, in which case the
            // value has to survive the call.)
            need_to_spill = false;
        }

        if need_to_spill {
            match check {
                Location::Register(r) => self.spill_register(r, preserve),
                Location::Xmm(r) => {
                    debug_assert_eq!(self.vars[var].locations.len(), 1);
                    self.spill_xmm_register(r)
                }
                _ => unreachable!(),
            }
        } else {
            self.remove_location_from_var(var, check);
        }
    }

    fn emit_call_action(
        &mut self,
        result: VarId,
        has_side_effects: bool,
        func: usize,
        args: &[VarId],
        args_xmm: &[VarId],
    ) {
        self.rewrite.assembler().comment("call");

        let r = self.alloc_reg(Location::Register(asm::R11), Location::any());
        if self.failed {
            return;
        }
        debug_assert_eq!(r, asm::R11);

        self.emit_setup_call(has_side_effects, args, args_xmm, Location::Register(asm::R11));
        if self.failed {
            return;
        }

        for &arg in args {
            self.bump_use(arg);
        }
        for &arg in args_xmm {
            self.bump_use(arg);
        }
        self.assert_consistent();

        debug_assert!(!self.vars_by_location.contains(Location::Register(asm::R11)));

        // Use the short call encoding when the target is in rel32 range of
        // where this code will actually run.
        let buf_pos = self.rewrite.assembler().bytes_written() as u64;
        let real_return_addr = self.rewrite.slot_start() as u64 + buf_pos + 5;
        let offset = func as i64 - real_return_addr as i64;
        if is_large_constant(offset) {
            self.const_load_into_reg(func as u64, asm::R11);
            self.rewrite.assembler().callq(asm::R11);
        } else {
            self.rewrite.assembler().call_rel32(offset as i32);
        }

        if !self.failed {
            debug_assert!(!self.vars_by_location.contains(Location::Register(asm::RAX)));
            self.var_initialize_in_specific_reg(result, asm::RAX);
            self.assert_consistent();
        }

        self.release_if_no_uses(result);
    }

    // ---- Use tracking ----

    fn bump_use(&mut self, var: VarId) {
        debug_assert!(self.phase_emitting);

        self.vars[var].next_use += 1;
        debug_assert!(self.vars[var].next_use <= self.vars[var].uses.len());
        if !self.vars[var].is_done_using() {
            return;
        }
        // Arguments stay pinned until guarding finishes.
        if !self.done_guarding && self.vars[var].is_arg {
            return;
        }

        if self.vars[var].needs_decref() {
            // Hold the locations; the decref is emitted once the current
            // action has finished emitting.
            if !self.pending_decrefs.contains(&var) {
                self.pending_decrefs.push(var);
            }
            return;
        }

        self.release_var(var);
    }

    fn release_if_no_uses(&mut self, var: VarId) {
        debug_assert!(self.phase_emitting);
        if self.vars[var].uses.is_empty() {
            debug_assert_eq!(self.vars[var].next_use, 0);
            if self.vars[var].needs_decref() {
                if !self.pending_decrefs.contains(&var) {
                    self.pending_decrefs.push(var);
                }
                return;
            }
            self.release_var(var);
        }
    }

    fn flush_pending_decrefs(&mut self) {
        while let Some(var) = self.pending_decrefs.pop() {
            if self.failed {
                return;
            }
            self.emit_decref(var);
            if self.failed {
                return;
            }
            self.vars[var].num_refs_consumed += 1;
            self.release_var(var);
        }
    }

    fn release_var(&mut self, var: VarId) {
        for l in self.vars[var].locations.clone() {
            self.vars_by_location.erase(l);
        }
        let (first_cell, n_cells) = self.vars[var].scratch_allocation;
        if n_cells > 0 {
            for cell in first_cell..first_cell + n_cells {
                let l = Location::Scratch(cell * 8);
                debug_assert_eq!(self.vars_by_location.get(l), Some(LOCATION_PLACEHOLDER));
                self.vars_by_location.erase(l);
            }
            self.vars[var].scratch_allocation = (0, 0);
        }
        self.vars[var].locations.clear();
    }

    // ---- Locations and register allocation ----

    fn add_location_to_var(&mut self, var: VarId, l: Location) {
        if self.failed {
            return;
        }
        debug_assert!(!self.vars[var].is_in_location(l));
        debug_assert!(matches!(
            l,
            Location::Register(_) | Location::Xmm(_) | Location::Scratch(_) | Location::Stack(_)
        ));
        self.vars[var].locations.push(l);
        self.vars_by_location.insert(l, var);

        #[cfg(debug_assertions)]
        {
            // A variable should have at most one memory-or-constant home.
            let mut count = 0;
            if self.vars[var].is_constant && !is_large_constant(self.vars[var].constant_value as i64)
            {
                count += 1;
            }
            for l in &self.vars[var].locations {
                if matches!(l, Location::Scratch(_) | Location::Stack(_)) {
                    count += 1;
                }
            }
            debug_assert!(count <= 1);
        }
    }

    fn remove_location_from_var(&mut self, var: VarId, l: Location) {
        debug_assert!(self.vars[var].is_in_location(l));
        debug_assert_eq!(self.vars_by_location.get(l), Some(var));
        self.vars_by_location.erase(l);
        let pos = self.vars[var].locations.iter().position(|&x| x == l).unwrap();
        self.vars[var].locations.remove(pos);
    }

    fn try_get_as_immediate(&self, var: VarId) -> Option<Immediate> {
        let v = &self.vars[var];
        if v.is_constant && !is_large_constant(v.constant_value as i64) {
            Some(Immediate(v.constant_value))
        } else {
            None
        }
    }

    fn alloc_scratch(&mut self) -> Option<Location> {
        debug_assert!(self.phase_emitting);
        let scratch_size = self.rewrite.scratch_size();
        let mut i = 0;
        while i < scratch_size {
            let l = Location::Scratch(i as i32);
            if !self.vars_by_location.contains(l) {
                return Some(l);
            }
            i += 8;
        }
        self.failed = true;
        None
    }

    fn indirect_for(&self, l: Location) -> Indirect {
        match l {
            Location::Scratch(off) => {
                Indirect::new(asm::RSP, self.rewrite.scratch_rsp_offset() + off)
            }
            Location::Stack(off) => {
                // Caller stack arguments live above the scratch area and
                // the patchpoint's return-address slot.
                let frame = self.rewrite.scratch_rsp_offset()
                    + self.rewrite.scratch_size() as i32
                    + 8;
                Indirect::new(asm::RSP, frame + off)
            }
            other => panic!("no memory operand for {:?}", other),
        }
    }

    fn spill_register(&mut self, reg: Register, preserve: Location) {
        debug_assert!(self.phase_emitting);

        let var = self.vars_by_location.get(Location::Register(reg)).unwrap();
        debug_assert!(var != LOCATION_PLACEHOLDER);

        // No store needed if the value lives elsewhere too, or is a
        // rematerializable constant.
        if self.vars[var].locations.len() > 1 || self.vars[var].is_constant {
            self.remove_location_from_var(var, Location::Register(reg));
            return;
        }

        // Prefer a free callee-save register; they cost nothing to keep
        // live across calls.
        for new_reg in SPILL_TARGET_REGS {
            if self.vars_by_location.contains(Location::Register(new_reg)) {
                continue;
            }
            if Location::Register(new_reg) == preserve {
                continue;
            }
            self.rewrite.assembler().mov_reg_reg(reg, new_reg);
            self.add_location_to_var(var, Location::Register(new_reg));
            self.remove_location_from_var(var, Location::Register(reg));
            return;
        }

        let scratch = match self.alloc_scratch() {
            Some(s) => s,
            None => return,
        };
        let mem = self.indirect_for(scratch);
        self.rewrite.assembler().mov_reg_mem(reg, mem);
        self.add_location_to_var(var, scratch);
        self.remove_location_from_var(var, Location::Register(reg));
    }

    fn spill_xmm_register(&mut self, reg: XMMRegister) {
        debug_assert!(self.phase_emitting);
        let var = self.vars_by_location.get(Location::Xmm(reg)).unwrap();
        debug_assert!(var != LOCATION_PLACEHOLDER);
        debug_assert_eq!(self.vars[var].locations.len(), 1);
        let scratch = match self.alloc_scratch() {
            Some(s) => s,
            None => return,
        };
        let mem = self.indirect_for(scratch);
        self.rewrite.assembler().movsd_xmm_mem(reg, mem);
        self.add_location_to_var(var, scratch);
        self.remove_location_from_var(var, Location::Xmm(reg));
    }

    fn alloc_reg(&mut self, dest: Location, other_than: Location) -> Register {
        debug_assert!(self.phase_emitting);

        match dest {
            Location::AnyReg => {
                let mut best: Option<(usize, Register)> = None;
                for reg in ALLOCATABLE_REGS {
                    if Location::Register(reg) == other_than {
                        continue;
                    }
                    match self.vars_by_location.get(Location::Register(reg)) {
                        None => return reg,
                        Some(var) => {
                            if var == LOCATION_PLACEHOLDER {
                                continue;
                            }
                            if !self.done_guarding
                                && self.vars[var].is_arg
                                && self.vars[var].arg_loc == Location::Register(reg)
                            {
                                continue;
                            }
                            // Evict the variable whose next use is
                            // farthest in the future.
                            let score = self.vars[var]
                                .uses
                                .get(self.vars[var].next_use)
                                .copied()
                                .unwrap_or(usize::MAX);
                            if best.map(|(s, _)| score > s).unwrap_or(true) {
                                best = Some((score, reg));
                            }
                        }
                    }
                }
                let (_, best_reg) = best.expect("no allocatable register");
                self.spill_register(best_reg, other_than);
                debug_assert!(self.failed || !self.vars_by_location.contains(Location::Register(best_reg)));
                best_reg
            }
            Location::Register(reg) => {
                if let Some(v) = self.vars_by_location.get(Location::Register(reg)) {
                    debug_assert!(v != LOCATION_PLACEHOLDER);
                    self.spill_register(reg, other_than);
                }
                debug_assert!(self.failed || !self.vars_by_location.contains(Location::Register(reg)));
                reg
            }
            other => panic!("cannot allocate {:?}", other),
        }
    }

    fn alloc_xmm_reg(&mut self, dest: Location) -> XMMRegister {
        debug_assert!(self.phase_emitting);
        match dest {
            Location::AnyReg => {
                for i in 0..XMMRegister::num_regs() as u8 {
                    let reg = XMMRegister(i);
                    if !self.vars_by_location.contains(Location::Xmm(reg)) {
                        return reg;
                    }
                }
                self.alloc_xmm_reg(Location::Xmm(asm::XMM1))
            }
            Location::Xmm(reg) => {
                if self.vars_by_location.contains(Location::Xmm(reg)) {
                    self.spill_xmm_register(reg);
                }
                reg
            }
            other => panic!("cannot allocate {:?}", other),
        }
    }

    /// Get `var` into a GP register, loading or copying as needed.
    fn var_get_in_reg(
        &mut self,
        var: VarId,
        dest: Location,
        allow_constant_in_reg: bool,
        other_than: Location,
    ) -> Register {
        debug_assert!(matches!(dest, Location::Register(_) | Location::AnyReg));
        #[cfg(debug_assertions)]
        if !allow_constant_in_reg {
            debug_assert!(
                !self.vars[var].is_constant
                    || is_large_constant(self.vars[var].constant_value as i64)
            );
        }

        if self.vars[var].locations.is_empty() && self.vars[var].is_constant {
            let val = self.vars[var].constant_value;
            let reg = self.alloc_reg(dest, other_than);
            if self.failed {
                return reg;
            }
            self.const_load_into_reg(val, reg);
            self.add_location_to_var(var, Location::Register(reg));
            return reg;
        }

        debug_assert!(!self.vars[var].locations.is_empty());

        // Already exactly where requested?
        if let Location::Register(r) = dest {
            if self.vars[var].is_in_location(dest) {
                return r;
            }
        }

        // In some register already?
        let existing_reg = self.vars[var].locations.iter().find_map(|&l| match l {
            Location::Register(r) => Some(r),
            _ => None,
        });
        if let Some(reg) = existing_reg {
            match dest {
                Location::Register(dest_reg) => {
                    debug_assert!(dest_reg != reg);
                    self.alloc_reg(dest, other_than);
                    if self.failed {
                        return dest_reg;
                    }
                    self.rewrite.assembler().mov_reg_reg(reg, dest_reg);
                    self.add_location_to_var(var, Location::Register(dest_reg));
                    return dest_reg;
                }
                _ => {
                    debug_assert!(Location::Register(reg) != other_than);
                    return reg;
                }
            }
        }

        // In memory: reload.
        debug_assert_eq!(self.vars[var].locations.len(), 1);
        let l = self.vars[var].locations[0];
        let reg = self.alloc_reg(dest, other_than);
        if self.failed {
            return reg;
        }
        debug_assert!(!self.vars_by_location.contains(Location::Register(reg)));
        let mem = self.indirect_for(l);
        self.rewrite.assembler().mov_mem_reg(mem, reg);
        self.add_location_to_var(var, Location::Register(reg));
        reg
    }

    fn var_get_in_xmm_reg(&mut self, var: VarId, dest: Location) -> XMMRegister {
        debug_assert!(matches!(dest, Location::Xmm(_) | Location::AnyReg));
        debug_assert!(!self.vars[var].is_constant);
        debug_assert!(!self.vars[var].locations.is_empty());

        if let Location::Xmm(r) = dest {
            if self.vars[var].is_in_location(dest) {
                return r;
            }
        }

        let existing = self.vars[var].locations.iter().find_map(|&l| match l {
            Location::Xmm(r) => Some(r),
            _ => None,
        });
        if let Some(reg) = existing {
            match dest {
                Location::Xmm(dest_reg) => {
                    debug_assert!(dest_reg != reg);
                    self.rewrite.assembler().movsd_xmm_xmm(reg, dest_reg);
                    self.add_location_to_var(var, Location::Xmm(dest_reg));
                    return dest_reg;
                }
                _ => return reg,
            }
        }

        debug_assert_eq!(self.vars[var].locations.len(), 1);
        let l = self.vars[var].locations[0];
        debug_assert!(matches!(l, Location::Scratch(_)));
        let reg = self.alloc_xmm_reg(dest);
        debug_assert!(!self.vars_by_location.contains(Location::Xmm(reg)));
        let mem = self.indirect_for(l);
        self.rewrite.assembler().movsd_mem_xmm(mem, reg);
        self.add_location_to_var(var, Location::Xmm(reg));
        reg
    }

    fn var_initialize_in_reg(&mut self, var: VarId, mut l: Location) -> Register {
        debug_assert!(self.phase_emitting);

        // Not allowed to evict an argument before guarding is done, so
        // fall back to any register in that case.
        if let Location::Register(_) = l {
            if !self.done_guarding {
                if let Some(occupant) = self.vars_by_location.get(l) {
                    if occupant != LOCATION_PLACEHOLDER && self.vars[occupant].is_arg {
                        l = Location::any();
                    }
                }
            }
        }

        let reg = self.alloc_reg(l, Location::any());
        if self.failed {
            return reg;
        }
        self.var_initialize_in_specific_reg(var, reg);
        reg
    }

    fn var_initialize_in_specific_reg(&mut self, var: VarId, reg: Register) {
        if self.failed {
            return;
        }
        let l = Location::Register(reg);
        debug_assert!(!self.vars_by_location.contains(l));
        debug_assert!(!self.vars[var].is_in_location(l));
        self.vars_by_location.insert(l, var);
        self.vars[var].locations.push(l);
    }

    fn var_initialize_in_xmm_reg(&mut self, var: VarId, l: Location) -> XMMRegister {
        debug_assert!(self.phase_emitting);
        let reg = self.alloc_xmm_reg(l);
        let l = Location::Xmm(reg);
        debug_assert!(!self.vars_by_location.contains(l));
        debug_assert!(!self.vars[var].is_in_location(l));
        self.vars_by_location.insert(l, var);
        self.vars[var].locations.push(l);
        reg
    }

    // ---- Const loader ----

    fn const_find_in_reg(&self, val: u64) -> Option<Register> {
        for &(cval, cvar) in &self.consts {
            if cval != val {
                continue;
            }
            for &l in &self.vars[cvar].locations {
                if let Location::Register(r) = l {
                    return Some(r);
                }
            }
        }
        None
    }

    /// Best-effort cheap load of a constant: reuse a register already
    /// holding it, derive large values with `lea` off a nearby constant,
    /// clear for zero, plain mov otherwise.
    fn const_load_into_reg(&mut self, val: u64, dest: Register) {
        debug_assert!(self.phase_emitting);

        if val == 0 {
            self.rewrite.assembler().clear_reg(dest);
            return;
        }

        if let Some(src) = self.const_find_in_reg(val) {
            if src != dest {
                self.rewrite.assembler().mov_reg_reg(src, dest);
            }
            return;
        }

        if is_large_constant(val as i64) {
            for regnum in 0..Register::num_regs() as u8 {
                let reg = Register(regnum);
                let var = match self.vars_by_location.get(Location::Register(reg)) {
                    Some(v) if v != LOCATION_PLACEHOLDER => v,
                    _ => continue,
                };
                if !self.vars[var].is_constant {
                    continue;
                }
                let offset = val.wrapping_sub(self.vars[var].constant_value) as i64;
                if is_large_constant(offset) {
                    continue;
                }
                self.rewrite
                    .assembler()
                    .lea(Indirect::new(reg, offset as i32), dest);
                return;
            }
        }

        self.rewrite.assembler().mov_imm(Immediate(val), dest, false);
    }

    // ---- Argument restoration around guards ----

    /// Move the original IC arguments (and register live-ins) back into
    /// their calling-convention locations so a failing guard can fall
    /// through to the slow path. Only movs; never touches flags.
    fn restore_args(&mut self) {
        debug_assert!(!self.done_guarding);

        for i in 0..self.args.len() {
            let arg = self.args[i];
            self.bump_use(arg);

            let l = Location::for_arg(i);
            if matches!(l, Location::Stack(_)) {
                continue;
            }
            let r = l.as_register();
            if !self.vars[arg].is_in_location(l) {
                self.alloc_reg(l, Location::any());
                if self.failed {
                    return;
                }
                self.var_get_in_reg(arg, l, true, Location::any());
                if self.failed {
                    return;
                }
            }
            debug_assert!(self.vars[arg].is_in_location(Location::Register(r)));
        }

        for i in 0..self.live_outs.len() {
            let gr = GenericRegister::from_dwarf(self.live_out_regs[i]);
            if let GenericRegister::Gp(r) = gr {
                let var = self.live_outs[i];
                if !self.vars[var].is_in_location(Location::Register(r)) {
                    self.alloc_reg(Location::Register(r), Location::any());
                    if self.failed {
                        return;
                    }
                    self.var_get_in_reg(var, Location::Register(r), true, Location::any());
                    if self.failed {
                        return;
                    }
                    debug_assert!(self.vars[var].is_in_location(Location::Register(r)));
                }
            }
        }
    }

    fn assert_args_in_place(&self) {
        #[cfg(debug_assertions)]
        {
            debug_assert!(!self.done_guarding);
            for i in 0..self.args.len() {
                let arg = self.args[i];
                debug_assert!(self.vars[arg].is_in_location(self.vars[arg].arg_loc));
            }
            for i in 0..self.live_outs.len() {
                let gr = GenericRegister::from_dwarf(self.live_out_regs[i]);
                debug_assert!(self.vars[self.live_outs[i]].is_in_location(gr.into()));
            }
        }
    }

    fn assert_consistent(&self) {
        #[cfg(debug_assertions)]
        {
            if self.failed {
                return;
            }
            for (id, var) in self.vars.iter().enumerate() {
                for &l in &var.locations {
                    debug_assert_eq!(
                        self.vars_by_location.get(l),
                        Some(id),
                        "var {} thinks it is in {:?}",
                        id,
                        l
                    );
                }
            }
            for (l, v) in self.vars_by_location.entries() {
                if v != LOCATION_PLACEHOLDER {
                    debug_assert!(self.vars[v].is_in_location(l));
                }
            }
            if self.phase_emitting && !self.done_guarding {
                for &arg in &self.args {
                    debug_assert!(!self.vars[arg].locations.is_empty());
                }
            }
        }
    }
}

impl Drop for Rewriter {
    fn drop(&mut self) {
        if !self.finished {
            self.abort();
        }
        debug_assert!(self.gc_references.is_empty());
    }
}
