//! The tagged value sum shared between the VM and the runtime.

use core::fmt;

use thiserror::Error;

use crate::tensor::Tensor;

/// Accessing a value as the wrong variant.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("expected a {expected} value, got {got}")]
pub struct TypeError {
    pub expected: &'static str,
    pub got: &'static str,
}

/// A runtime value: tensor, tuple, scalar, string or none.
///
/// Values produced as op outputs are owned by their node; sharing happens
/// at the storage level (see [`crate::storage::Storage`]), so cloning a
/// tensor value aliases its buffer rather than copying it.
#[derive(Clone, Debug, Default)]
pub enum Value {
    Tensor(Tensor),
    Tuple(Vec<Value>),
    Int(i64),
    Double(f64),
    Bool(bool),
    String(String),
    #[default]
    None,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Tensor(_) => "tensor",
            Value::Tuple(_) => "tuple",
            Value::Int(_) => "int",
            Value::Double(_) => "double",
            Value::Bool(_) => "bool",
            Value::String(_) => "string",
            Value::None => "none",
        }
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, Value::Tensor(_))
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Value::Tuple(_))
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Value::Int(_))
    }

    pub fn is_double(&self) -> bool {
        matches!(self, Value::Double(_))
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Value::Bool(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    fn type_error(&self, expected: &'static str) -> TypeError {
        TypeError { expected, got: self.type_name() }
    }

    pub fn as_tensor(&self) -> Result<&Tensor, TypeError> {
        match self {
            Value::Tensor(t) => Ok(t),
            other => Err(other.type_error("tensor")),
        }
    }

    pub fn as_tensor_mut(&mut self) -> Result<&mut Tensor, TypeError> {
        match self {
            Value::Tensor(t) => Ok(t),
            other => Err(other.type_error("tensor")),
        }
    }

    pub fn as_tuple(&self) -> Result<&[Value], TypeError> {
        match self {
            Value::Tuple(vs) => Ok(vs),
            other => Err(other.type_error("tuple")),
        }
    }

    pub fn to_int(&self) -> Result<i64, TypeError> {
        match self {
            Value::Int(v) => Ok(*v),
            other => Err(other.type_error("int")),
        }
    }

    pub fn to_double(&self) -> Result<f64, TypeError> {
        match self {
            Value::Double(v) => Ok(*v),
            other => Err(other.type_error("double")),
        }
    }

    pub fn to_bool(&self) -> Result<bool, TypeError> {
        match self {
            Value::Bool(v) => Ok(*v),
            other => Err(other.type_error("bool")),
        }
    }

    pub fn as_string(&self) -> Result<&str, TypeError> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(other.type_error("string")),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Tensor(t) => {
                write!(f, "tensor<{}", t.dtype())?;
                for dim in t.shape() {
                    write!(f, "x{dim}")?;
                }
                write!(f, ">")
            }
            Value::Tuple(vs) => {
                write!(f, "(")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
            Value::Int(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::String(s) => f.write_str(s),
            Value::None => f.write_str("none"),
        }
    }
}
