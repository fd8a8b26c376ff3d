use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::params::{Geometry, OpKind};
use crate::target::ChipId;

/// Number of dimensions in a [crate::params::TensorView].
pub const MAX_TENSOR_DIMS: usize = 5;

/// The first batch dimension of a GEMM operand. Dims 0 and 1 are the fcd and spatial dims.
pub const GEMM_DIM_B1: usize = 2;
/// The last batch dimension of a GEMM operand.
pub const GEMM_DIM_B3: usize = 4;

pub type SizeArray = [u32; MAX_TENSOR_DIMS];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, strum::EnumIter)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Fp8_143,
    Fp8_152,
    Fp16,
    Ufp16,
    Bf16,
    Fp32,
    Tf32,
}

/// One of the three operands the MME sees: two inputs and the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, strum::EnumIter)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Operand {
    A,
    B,
    C,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum UnsupportedConfiguration {
    #[error("Geometry {geometry} is not supported on {chip}")]
    Geometry { chip: ChipId, geometry: Geometry },
    #[error("{kind} operations are not supported on {chip}")]
    OpKind { chip: ChipId, kind: OpKind },
    #[error("Data type {dtype} has no common dim alignment for {kind}")]
    DataType { dtype: DataType, kind: OpKind },
    #[error("MME limit {limit} is invalid on {chip}, which has {mme_nr} MMEs")]
    MmeLimit { chip: ChipId, limit: u32, mme_nr: u32 },
}

impl DataType {
    /// The bytes required to represent a value of this DataType.
    pub fn size_in_bytes(&self) -> u8 {
        match self {
            DataType::Int8 | DataType::Fp8_143 | DataType::Fp8_152 => 1,
            DataType::Int16 | DataType::Fp16 | DataType::Ufp16 | DataType::Bf16 => 2,
            DataType::Int32 | DataType::Fp32 | DataType::Tf32 => 4,
        }
    }

    pub fn is_fp8(&self) -> bool {
        matches!(self, DataType::Fp8_143 | DataType::Fp8_152)
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::Int8 => write!(f, "i8"),
            DataType::Int16 => write!(f, "i16"),
            DataType::Int32 => write!(f, "i32"),
            DataType::Fp8_143 => write!(f, "fp8_143"),
            DataType::Fp8_152 => write!(f, "fp8_152"),
            DataType::Fp16 => write!(f, "fp16"),
            DataType::Ufp16 => write!(f, "ufp16"),
            DataType::Bf16 => write!(f, "bf16"),
            DataType::Fp32 => write!(f, "fp32"),
            DataType::Tf32 => write!(f, "tf32"),
        }
    }
}

impl Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::A => write!(f, "A"),
            Operand::B => write!(f, "B"),
            Operand::C => write!(f, "C"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_only_float8_types_are_fp8() {
        let fp8 = DataType::iter().filter(|d| d.is_fp8()).collect::<Vec<_>>();
        assert_eq!(fp8, vec![DataType::Fp8_143, DataType::Fp8_152]);
    }

    #[test]
    fn test_unsupported_configuration_message_names_value() {
        let err = UnsupportedConfiguration::Geometry {
            chip: ChipId::Gaudi3,
            geometry: Geometry::TwoWideTwoHigh,
        };
        assert_eq!(err.to_string(), "Geometry 2wx2h is not supported on gaudi3");
    }

    proptest! {
        #[test]
        fn test_fp8_types_are_one_byte(dtype in any::<DataType>()) {
            if dtype.is_fp8() {
                prop_assert_eq!(dtype.size_in_bytes(), 1);
            }
        }
    }
}
