//! Generic dispatch slow paths.
//!
//! Each entry point executes the full operation semantics while,
//! opportunistically, driving a [`Rewriter`] to record a guarded fast
//! path for the conditions it actually encountered. The `*RA` structs
//! thread the rewrite state (variable ids for the operands, where the
//! result should go) down through the lookup helpers; any helper that
//! cannot express its behavior as a rewrite simply stops threading the
//! state, and the entry point drops the rewriter, which aborts it.

pub mod args;
pub mod attr;
pub mod binop;
pub mod call;
pub mod compare;
pub mod item;
pub mod len;

use crate::rewriter::{Location, VarId};

/// How a helper's rewrite part left the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnConvention {
    /// Lookup completed and produced no value (and guarded on that).
    NoReturn,
    /// A value variable was produced.
    HasReturn,
    /// A value variable following the CAPI convention (may be null with
    /// an exception pending).
    CapiReturn,
    /// A value variable that may be null *without* an exception.
    NoexcPossible,
}

/// Rewrite state for an attribute-style lookup: one object variable in,
/// at most one value out.
pub struct GetattrRA {
    pub obj: VarId,
    pub destination: Location,
    /// The object's class identity is already guarded (constant objects).
    pub obj_shape_guarded: bool,
    pub obj_hcls_guarded: bool,
    ret: Option<(Option<VarId>, ReturnConvention)>,
    abandoned: bool,
}

impl GetattrRA {
    pub fn new(obj: VarId, destination: Location) -> GetattrRA {
        GetattrRA {
            obj,
            destination,
            obj_shape_guarded: false,
            obj_hcls_guarded: false,
            ret: None,
            abandoned: false,
        }
    }

    /// Whether the helper finished with a usable rewrite.
    pub fn is_successful(&self) -> bool {
        self.ret.is_some() && !self.abandoned
    }

    pub fn abandon(&mut self) {
        self.abandoned = true;
    }

    pub fn set_return(&mut self, var: Option<VarId>, convention: ReturnConvention) {
        debug_assert!(self.ret.is_none());
        debug_assert!(var.is_some() != (convention == ReturnConvention::NoReturn));
        self.ret = Some((var, convention));
    }

    pub fn take_return(&mut self) -> (Option<VarId>, ReturnConvention) {
        self.ret.take().expect("no return was set")
    }

    /// The produced value variable, asserting the convention.
    pub fn expect_return(&mut self, convention: ReturnConvention) -> VarId {
        let (var, conv) = self.take_return();
        debug_assert_eq!(conv, convention);
        var.expect("return convention carried no value")
    }

    pub fn assert_return_convention(&mut self, convention: ReturnConvention) {
        let (var, conv) = self.take_return();
        debug_assert_eq!(conv, convention);
        let _ = var;
    }

    pub fn clear_return(&mut self) {
        self.ret = None;
    }
}

/// Rewrite state for a call: callable plus up to three register
/// arguments and an array variable for the rest.
pub struct CallRA {
    pub obj: VarId,
    pub destination: Location,
    pub arg1: Option<VarId>,
    pub arg2: Option<VarId>,
    pub arg3: Option<VarId>,
    pub args: Option<VarId>,
    /// The argument classes are already guarded by the caller.
    pub args_guarded: bool,
    pub out_success: bool,
    pub out_rtn: Option<VarId>,
}

impl CallRA {
    pub fn new(obj: VarId, destination: Location) -> CallRA {
        CallRA {
            obj,
            destination,
            arg1: None,
            arg2: None,
            arg3: None,
            args: None,
            args_guarded: false,
            out_success: false,
            out_rtn: None,
        }
    }

    pub fn get_arg(&self, i: usize) -> VarId {
        match i {
            0 => self.arg1.unwrap(),
            1 => self.arg2.unwrap(),
            2 => self.arg3.unwrap(),
            _ => panic!("args beyond the third live in the array variable"),
        }
    }

    pub fn set_arg(&mut self, i: usize, var: VarId) {
        match i {
            0 => self.arg1 = Some(var),
            1 => self.arg2 = Some(var),
            2 => self.arg3 = Some(var),
            _ => panic!("args beyond the third live in the array variable"),
        }
    }
}

/// Rewrite state for `setattr`: object and value variables, no result.
pub struct SetattrRA {
    pub obj: VarId,
    pub attrval: VarId,
    pub out_success: bool,
}

impl SetattrRA {
    pub fn new(obj: VarId, attrval: VarId) -> SetattrRA {
        SetattrRA {
            obj,
            attrval,
            out_success: false,
        }
    }
}

/// Rewrite state for binary-shaped entry points (binop, compare,
/// getitem): two operand variables and a result.
pub struct BinaryRA {
    pub lhs: VarId,
    pub rhs: VarId,
    pub destination: Location,
    pub out_success: bool,
    pub out_rtn: Option<VarId>,
}

impl BinaryRA {
    pub fn new(lhs: VarId, rhs: VarId, destination: Location) -> BinaryRA {
        BinaryRA {
            lhs,
            rhs,
            destination,
            out_success: false,
            out_rtn: None,
        }
    }
}

/// Rewrite state for unary-shaped entry points (len, nonzero).
pub struct UnaryRA {
    pub obj: VarId,
    pub destination: Location,
    pub out_success: bool,
    pub out_rtn: Option<VarId>,
}

impl UnaryRA {
    pub fn new(obj: VarId, destination: Location) -> UnaryRA {
        UnaryRA {
            obj,
            destination,
            out_success: false,
            out_rtn: None,
        }
    }
}
