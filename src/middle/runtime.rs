//! The runtime library surface.
//!
//! These primitives are link-time collaborators: the core never sees their
//! bodies, it only registers their names and signatures in the symbol
//! table (so user programs can call them) and declares them in the emitted
//! module. Registration happens in a fixed order, which pins the storage
//! slot each primitive's mangled name carries.

use strum::{Display, EnumIter};

use crate::middle::ty::{Type, TypeContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum RuntimePrimitive {
    PrintInt,
    PrintBool,
    PrintChar,
    PrintFloat,
    PrintString,
    ReadInt,
    ReadBool,
    ReadChar,
    ReadFloat,
    ReadString,
    Abs,
    Fabs,
    Sqrt,
    Sin,
    Cos,
    Tan,
    Atan,
    Exp,
    Ln,
    Pi,
    Incr,
    Decr,
    FloatOfInt,
    IntOfFloat,
    Round,
    IntOfChar,
    CharOfInt,
    Strlen,
    Strcmp,
    Strcpy,
    Strcat,
}

impl RuntimePrimitive {
    /// The curried source-level type under which the primitive is
    /// registered in the symbol table
    pub fn source_type(self, tcx: &mut TypeContext) -> Type {
        use RuntimePrimitive::*;

        let int = tcx.int();
        let float = tcx.float();
        let unit = tcx.unit();
        let char_ty = tcx.char();
        let bool_ty = tcx.bool();
        let string = tcx.array(1, char_ty.clone());

        match self {
            PrintInt => tcx.function(int, unit),
            PrintBool => tcx.function(bool_ty, unit),
            PrintChar => tcx.function(char_ty, unit),
            PrintFloat => tcx.function(float, unit),
            PrintString => tcx.function(string, unit),
            ReadInt => tcx.function(unit, int),
            ReadBool => tcx.function(unit, bool_ty),
            ReadChar => tcx.function(unit, char_ty),
            ReadFloat => tcx.function(unit, float),
            ReadString => tcx.function(unit, string),
            Abs => tcx.function(int.clone(), int),
            Fabs | Sqrt | Sin | Cos | Tan | Atan | Exp | Ln => {
                tcx.function(float.clone(), float)
            }
            Pi => tcx.function(unit, float),
            Incr | Decr => {
                let int_ref = tcx.reference(int);
                tcx.function(int_ref, unit)
            }
            FloatOfInt => tcx.function(int, float),
            IntOfFloat | Round => tcx.function(float, int),
            IntOfChar => tcx.function(char_ty, int),
            CharOfInt => tcx.function(int, char_ty),
            Strlen => tcx.function(string, int),
            Strcmp => {
                let inner = tcx.function(string.clone(), int);
                tcx.function(string, inner)
            }
            Strcpy | Strcat => {
                let inner = tcx.function(string.clone(), unit);
                tcx.function(string, inner)
            }
        }
    }
}
