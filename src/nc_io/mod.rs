//! Reading model files and writing site datasets in netCDF format.
use std::path::PathBuf;

use error_stack::ResultExt;
use netcdf::{AttributeValue, NcTypeDescriptor, types::NcVariableType};

mod reader;
mod writer;

pub use reader::NcModelFile;
pub use writer::{write_site_dataset, FILL_VALUE};

pub type NcResult<T> = error_stack::Result<T, NcIoError>;

#[derive(Debug, thiserror::Error)]
pub enum NcIoError {
    #[error("Could not open {}", .0.display())]
    Open(PathBuf),
    #[error("Could not create {}", .0.display())]
    Create(PathBuf),
    #[error("Missing required attribute '{0}'")]
    MissingAttribute(String),
    #[error("Attribute '{0}' has an unexpected type")]
    BadAttribute(String),
    #[error("Missing required variable '{0}'")]
    MissingVariable(String),
    #[error("Missing required dimension '{0}'")]
    MissingDimension(String),
    #[error("IOAPI grid type {0} is not supported (expected 1, 2, 6, or 7)")]
    UnsupportedGrid(i32),
    #[error("Could not determine the model grid")]
    Grid,
    #[error("Could not determine the model times")]
    Time,
    #[error("Error reading {0}")]
    Read(String),
    #[error("Error writing {0}")]
    Write(String),
}

impl NcIoError {
    pub fn read<S: Into<String>>(what: S) -> Self {
        Self::Read(what.into())
    }

    pub fn write<S: Into<String>>(what: S) -> Self {
        Self::Write(what.into())
    }
}

/// One byte of an NC_CHAR variable.
///
/// netCDF v0.11 does not treat `u8` as NC_CHAR, so character arrays are
/// read and written through this wrapper.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct NcChar(pub(crate) u8);

unsafe impl NcTypeDescriptor for NcChar {
    fn type_descriptor() -> NcVariableType {
        NcVariableType::Char
    }
}

/// Read a numeric global or variable attribute as an `f64`.
pub(crate) fn numeric_attr(value: Option<netcdf::Result<AttributeValue>>, name: &str) -> NcResult<f64> {
    let value = value
        .ok_or_else(|| NcIoError::MissingAttribute(name.to_string()))?
        .change_context_lazy(|| NcIoError::read(format!("attribute '{name}'")))?;
    match value {
        AttributeValue::Double(v) => Ok(v),
        AttributeValue::Float(v) => Ok(v as f64),
        AttributeValue::Int(v) => Ok(v as f64),
        AttributeValue::Short(v) => Ok(v as f64),
        AttributeValue::Longlong(v) => Ok(v as f64),
        AttributeValue::Doubles(v) if v.len() == 1 => Ok(v[0]),
        AttributeValue::Floats(v) if v.len() == 1 => Ok(v[0] as f64),
        AttributeValue::Ints(v) if v.len() == 1 => Ok(v[0] as f64),
        _ => Err(NcIoError::BadAttribute(name.to_string()).into()),
    }
}

/// Read a string attribute, or `None` if it is absent or not a string.
pub(crate) fn string_attr(value: Option<netcdf::Result<AttributeValue>>) -> Option<String> {
    match value {
        Some(Ok(AttributeValue::Str(s))) => Some(s.trim().to_string()),
        _ => None,
    }
}
