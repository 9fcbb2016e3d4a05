// Tagged runtime values.
//
// Every value a script can touch is one of the variants below. Scalars
// (null, bool, int32, float32) live inline; strings, arrays, objects and
// function references live in the owning applet's ValuePool and are held
// here as opaque handles. A handle is only meaningful inside the pool
// that issued it; each handle carries the pool's identity so that mixing
// pools trips an assertion in debug builds instead of corrupting memory.

use enumflags2::BitFlags;

use crate::heap::ValuePool;


// The result of any value-level operation.
pub type Result<T> = core::result::Result<T, Error>;


// Identity of a ValuePool, carried by every heap handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PoolId(pub(crate) u32);


// Factors out the boilerplate of the four handle types.
macro_rules! handle {
    ($name:ident) => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        pub struct $name {
            pub(crate) pool: PoolId,
            pub(crate) index: u32
        }
    }
}

handle! {StrRef}
handle! {ArrayRef}
handle! {ObjRef}
handle! {FnRef}


// All valid values.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int32(i32),
    Float32(f32),
    Str(StrRef),
    Array(ArrayRef),
    Object(ObjRef),
    Function(FnRef),
    NativeFn(u16),
}


// Exposes the discriminant for error reporting and type checks.
#[derive(BitFlags, Copy, Clone, Debug, PartialEq)]
#[repr(u16)]
pub enum TypeTag {
    Null     = 0b000000001,
    Bool     = 0b000000010,
    Int32    = 0b000000100,
    Float32  = 0b000001000,
    Str      = 0b000010000,
    Array    = 0b000100000,
    Object   = 0b001000000,
    Function = 0b010000000,
    Native   = 0b100000000,
}


pub type TypeSet = BitFlags<TypeTag>;


// Construct an Error::TypeError from a value.
pub fn expected(expect: TypeSet, got: &Value) -> Error {
    Error::TypeError { expect, got: got.get_type() }
}

// Construct an Error::TypeMismatch from a pair of values.
pub fn type_mismatch(a: &Value, b: &Value) -> Error {
    Error::TypeMismatch(a.get_type(), b.get_type())
}


// Everything that can go wrong while executing a script, plus the two
// control signals (Halt, Yield) that terminate an execution slice. The
// interpreter decides per variant whether a TRY handler may intercept it;
// see catchable().
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    // control signals, not failures
    Halt,
    Yield,

    // catchable at script level
    TypeError { expect: TypeSet, got: TypeTag },
    TypeMismatch(TypeTag, TypeTag),
    DivideByZero,
    IndexError(i32),
    FieldError(String),
    NoSuchMethod(String),
    Thrown(Value),

    // fatal
    Underflow,
    Overflow,
    Arity(u8, u8),
    IllegalOpcode(u8),
    IllegalAddr(usize),
    NoSuchFunction(u16),
    NoSuchGlobal(u16),
    NoSuchConstant(u16),
    NoSuchNative(u16),
    NotCallable(TypeTag),
    OutOfMemory,
}

impl Error {
    // Whether a TRY handler may intercept this error. Stack corruption
    // and resource exhaustion are never handed to the script.
    pub fn catchable(&self) -> bool {
        match self {
            Error::TypeError { .. }
            | Error::TypeMismatch(_, _)
            | Error::DivideByZero
            | Error::IndexError(_)
            | Error::FieldError(_)
            | Error::NoSuchMethod(_)
            | Error::Thrown(_) => true,
            _ => false
        }
    }

    // Human-readable form used for VMResult::Error and for the value
    // synthesized when a handler catches a runtime fault.
    pub fn message(&self) -> String {
        match self {
            Error::Halt => "halt".to_string(),
            Error::Yield => "yield".to_string(),
            Error::TypeError { expect, got } =>
                format!("type error: expected {:?}, got {:?}", expect, got),
            Error::TypeMismatch(a, b) =>
                format!("type mismatch: {:?} vs {:?}", a, b),
            Error::DivideByZero => "division by zero".to_string(),
            Error::IndexError(i) => format!("index out of range: {}", i),
            Error::FieldError(name) => format!("no such field: {}", name),
            Error::NoSuchMethod(name) => format!("no such method: {}", name),
            Error::Thrown(_) => "uncaught exception".to_string(),
            Error::Underflow => "stack underflow".to_string(),
            Error::Overflow => "stack overflow".to_string(),
            Error::Arity(got, want) =>
                format!("arity mismatch: {} arguments, {} expected", got, want),
            Error::IllegalOpcode(op) => format!("illegal opcode {:#04x}", op),
            Error::IllegalAddr(pc) => format!("illegal address {}", pc),
            Error::NoSuchFunction(i) => format!("no such function: {}", i),
            Error::NoSuchGlobal(i) => format!("no such global: {}", i),
            Error::NoSuchConstant(i) => format!("no such constant: {}", i),
            Error::NoSuchNative(i) => format!("no such native call: {:#06x}", i),
            Error::NotCallable(t) => format!("{:?} is not callable", t),
            Error::OutOfMemory => "out of memory".to_string(),
        }
    }
}


// Factors out the boiler plate in the numeric operator implementations.
// Each entry is a <pattern> => <expr> white-list; anything not listed is
// a runtime type mismatch.
macro_rules! operator {
    (bin $name:ident { $( $p:pat => $e:expr ),+ } ) => {
        pub fn $name (&self, other: &Value) -> Result<Value> {
            use Value::*;
            #[allow(unreachable_patterns)]
            match (self, other) {
                $($p => Ok($e)),+ ,
                (a, b) => Err(type_mismatch(a, b))
            }
        }
    };
}


impl Value {
    pub fn get_type(&self) -> TypeTag {
        match self {
            Value::Null        => TypeTag::Null,
            Value::Bool(_)     => TypeTag::Bool,
            Value::Int32(_)    => TypeTag::Int32,
            Value::Float32(_)  => TypeTag::Float32,
            Value::Str(_)      => TypeTag::Str,
            Value::Array(_)    => TypeTag::Array,
            Value::Object(_)   => TypeTag::Object,
            Value::Function(_) => TypeTag::Function,
            Value::NativeFn(_) => TypeTag::Native,
        }
    }

    pub fn is_numeric(&self) -> bool {
        match self {
            Value::Int32(_) | Value::Float32(_) => true,
            _ => false
        }
    }

    // Numeric view used by mixed-type comparison. f64 holds every i32
    // and every f32 exactly.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(v) => Some(*v as f64),
            Value::Float32(v) => Some(*v as f64),
            _ => None
        }
    }

    pub fn truthy(&self, pool: &ValuePool) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(v) => *v,
            Value::Int32(v) => *v != 0,
            Value::Float32(v) => *v != 0.0,
            Value::Str(r) => !pool.str_content(*r).is_empty(),
            Value::Array(_)
            | Value::Object(_)
            | Value::Function(_)
            | Value::NativeFn(_) => true,
        }
    }

    // Equality as scripts observe it: same discriminant compares
    // structurally, int/float compare numerically, strings compare by
    // content, everything else across types is false.
    pub fn equals(&self, other: &Value, pool: &ValuePool) -> bool {
        use Value::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int32(a), Int32(b)) => a == b,
            (Float32(a), Float32(b)) => a == b,
            (Int32(a), Float32(b)) => (*a as f64) == (*b as f64),
            (Float32(a), Int32(b)) => (*a as f64) == (*b as f64),
            (Str(a), Str(b)) =>
                a == b || pool.str_content(*a) == pool.str_content(*b),
            (Array(a), Array(b)) => a == b,
            (Object(a), Object(b)) => a == b,
            (Function(a), Function(b)) => a == b,
            (NativeFn(a), NativeFn(b)) => a == b,
            (_, _) => false
        }
    }

    // Stringification used by PRINT and template interpolation. Numbers
    // use Rust's shortest-round-trip formatting.
    pub fn stringify(&self, pool: &ValuePool) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(true) => "true".to_string(),
            Value::Bool(false) => "false".to_string(),
            Value::Int32(v) => format!("{}", v),
            Value::Float32(v) => format!("{}", v),
            Value::Str(r) => pool.str_content(*r).to_string(),
            Value::Array(r) => format!("[Array n={}]", pool.array_len(*r)),
            Value::Object(r) => format!("[Object {}]", pool.object_class(*r)),
            Value::Function(r) => {
                let (index, _) = pool.function_of(*r);
                format!("[Function #{}]", index)
            },
            Value::NativeFn(id) => format!("[NativeFn {:#06x}]", id),
        }
    }

    operator! { bin sub {
        (Int32(a),   Int32(b))   => Int32(a.wrapping_sub(*b)),
        (Int32(a),   Float32(b)) => Float32(*a as f32 - b),
        (Float32(a), Int32(b))   => Float32(a - *b as f32),
        (Float32(a), Float32(b)) => Float32(a - b)
    } }

    operator! { bin mul {
        (Int32(a),   Int32(b))   => Int32(a.wrapping_mul(*b)),
        (Int32(a),   Float32(b)) => Float32(*a as f32 * b),
        (Float32(a), Int32(b))   => Float32(a * *b as f32),
        (Float32(a), Float32(b)) => Float32(a * b)
    } }

    pub fn div(&self, other: &Value) -> Result<Value> {
        use Value::*;
        match (self, other) {
            (Int32(_), Int32(0)) => Err(Error::DivideByZero),
            (Int32(a), Int32(b)) => Ok(Int32(a.wrapping_div(*b))),
            (Int32(a), Float32(b)) => Ok(Float32(*a as f32 / b)),
            (Float32(a), Int32(b)) => Ok(Float32(a / *b as f32)),
            (Float32(a), Float32(b)) => Ok(Float32(a / b)),
            (a, b) => Err(type_mismatch(a, b))
        }
    }

    pub fn modulo(&self, other: &Value) -> Result<Value> {
        use Value::*;
        match (self, other) {
            (Int32(_), Int32(0)) => Err(Error::DivideByZero),
            (Int32(a), Int32(b)) => Ok(Int32(a.wrapping_rem(*b))),
            (Int32(a), Float32(b)) => Ok(Float32(*a as f32 % b)),
            (Float32(a), Int32(b)) => Ok(Float32(a % *b as f32)),
            (Float32(a), Float32(b)) => Ok(Float32(a % b)),
            (a, b) => Err(type_mismatch(a, b))
        }
    }

    // Int32 negation wraps, so -INT32_MIN stays INT32_MIN.
    pub fn neg(&self) -> Result<Value> {
        match self {
            Value::Int32(a) => Ok(Value::Int32(a.wrapping_neg())),
            Value::Float32(a) => Ok(Value::Float32(-a)),
            value => Err(expected(TypeTag::Int32 | TypeTag::Float32, value))
        }
    }

    // Numeric-or-string ordering; the caller resolves string contents
    // since ordering by bytes needs the pool.
    pub fn compare(&self, other: &Value, pool: &ValuePool) -> Result<std::cmp::Ordering> {
        use Value::*;
        match (self, other) {
            (Str(a), Str(b)) => {
                Ok(pool.str_content(*a).as_bytes()
                   .cmp(pool.str_content(*b).as_bytes()))
            },
            (a, b) => {
                match (a.as_f64(), b.as_f64()) {
                    (Some(x), Some(y)) => x.partial_cmp(&y)
                        .ok_or(Error::TypeMismatch(a.get_type(), b.get_type())),
                    _ => Err(type_mismatch(a, b))
                }
            }
        }
    }
}
