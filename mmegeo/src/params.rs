use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::common::{DataType, Operand, SizeArray, GEMM_DIM_B1, GEMM_DIM_B3, MAX_TENSOR_DIMS};

/// The kind of operation being lowered onto the MME.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, strum::EnumIter)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum OpKind {
    /// Forward convolution.
    Fwd,
    /// Gradient of a convolution with respect to its input.
    Dedx,
    /// Gradient of a convolution with respect to its weights.
    Dedw,
    Gemm,
    BatchGemm,
    /// Native DMA copy; bypasses the EUs.
    Memcpy,
    /// Native DMA transpose; bypasses the EUs.
    Transpose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ConvKind {
    Fwd,
    Dedx,
    Dedw,
}

/// The requested shape of the MME cooperation.
///
/// The first four are the symmetric geometries of current chips. The remaining three are the
/// first-generation geometries, which no chip in this crate accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, strum::EnumIter)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Geometry {
    #[cfg_attr(feature = "clap", value(name = "4xw"))]
    Wide4x,
    #[cfg_attr(feature = "clap", value(name = "2xw"))]
    Wide2x,
    #[cfg_attr(feature = "clap", value(name = "2xh"))]
    High2x,
    #[cfg_attr(feature = "clap", value(name = "4xh"))]
    High4x,
    #[cfg_attr(feature = "clap", value(name = "4wx1h"))]
    FourWideOneHigh,
    #[cfg_attr(feature = "clap", value(name = "2wx2h"))]
    TwoWideTwoHigh,
    #[cfg_attr(feature = "clap", value(name = "1wx4h"))]
    OneWideFourHigh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum GeometryFamily {
    Wide,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct MmeStrategy {
    pub geometry: Geometry,
    /// The number of MMEs the lowering may use. Must be a power of two.
    pub mme_limit: u32,
    pub batch_concurrency: bool,
    pub cd_concurrency: bool,
    pub dual_gemm: bool,
}

/// A view of one operand tensor. Sizes and strides are in elements, innermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TensorView {
    pub dtype: DataType,
    pub sizes: SizeArray,
    pub strides: [u64; MAX_TENSOR_DIMS],
}

/// Describes a single operation to be lowered.
///
/// Operand C is always the output. For GEMMs, dim 0 of C is the fcd (n), dim 1 is the spatial
/// dim (m) and dims 2 through 4 are batch dims.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct LayerParams {
    pub kind: OpKind,
    pub a: TensorView,
    pub b: TensorView,
    pub c: TensorView,
    pub transpose_a: bool,
    pub transpose_b: bool,
    pub strategy: MmeStrategy,
}

impl OpKind {
    pub fn is_native_dma(&self) -> bool {
        matches!(self, OpKind::Memcpy | OpKind::Transpose)
    }

    pub fn is_dedw(&self) -> bool {
        *self == OpKind::Dedw
    }

    pub fn is_batch_gemm(&self) -> bool {
        *self == OpKind::BatchGemm
    }

    pub fn is_dedw_or_batch_gemm(&self) -> bool {
        self.is_dedw() || self.is_batch_gemm()
    }
}

impl From<ConvKind> for OpKind {
    fn from(kind: ConvKind) -> Self {
        match kind {
            ConvKind::Fwd => OpKind::Fwd,
            ConvKind::Dedx => OpKind::Dedx,
            ConvKind::Dedw => OpKind::Dedw,
        }
    }
}

impl Geometry {
    /// The geometries with a [GeometryFamily].
    pub const SYMMETRIC: [Geometry; 4] = [
        Geometry::Wide4x,
        Geometry::Wide2x,
        Geometry::High2x,
        Geometry::High4x,
    ];

    /// Returns the family of a current-generation geometry, or `None` for first-generation ones.
    pub fn family(&self) -> Option<GeometryFamily> {
        match self {
            Geometry::Wide4x | Geometry::Wide2x => Some(GeometryFamily::Wide),
            Geometry::High2x | Geometry::High4x => Some(GeometryFamily::High),
            Geometry::FourWideOneHigh | Geometry::TwoWideTwoHigh | Geometry::OneWideFourHigh => {
                None
            }
        }
    }
}

impl MmeStrategy {
    pub fn new(geometry: Geometry, mme_limit: u32) -> Self {
        MmeStrategy {
            geometry,
            mme_limit,
            ..Default::default()
        }
    }
}

impl Default for MmeStrategy {
    fn default() -> Self {
        MmeStrategy {
            geometry: Geometry::High2x,
            mme_limit: 1,
            batch_concurrency: true,
            cd_concurrency: true,
            dual_gemm: false,
        }
    }
}

impl TensorView {
    /// Creates a view of a dense tensor.
    pub fn dense(dtype: DataType, sizes: SizeArray) -> Self {
        let mut strides = [1u64; MAX_TENSOR_DIMS];
        for dim in 1..MAX_TENSOR_DIMS {
            strides[dim] = strides[dim - 1].saturating_mul(u64::from(sizes[dim - 1]));
        }
        TensorView {
            dtype,
            sizes,
            strides,
        }
    }

    pub fn is_first_dim_dense(&self) -> bool {
        u64::from(self.sizes[0]) == self.strides[1]
    }

    pub fn volume(&self) -> u64 {
        saturating_product(&self.sizes)
    }
}

impl LayerParams {
    pub fn new(kind: OpKind, a: TensorView, b: TensorView, c: TensorView) -> Self {
        LayerParams {
            kind,
            a,
            b,
            c,
            transpose_a: false,
            transpose_b: false,
            strategy: MmeStrategy::default(),
        }
    }

    /// A single `m x k` by `k x n` matrix multiplication.
    pub fn gemm(dtype: DataType, m: u32, n: u32, k: u32) -> Self {
        LayerParams::new(
            OpKind::Gemm,
            TensorView::dense(dtype, [k, m, 1, 1, 1]),
            TensorView::dense(dtype, [n, k, 1, 1, 1]),
            TensorView::dense(dtype, [n, m, 1, 1, 1]),
        )
    }

    /// A batched matrix multiplication. Each batch dim of the output is the larger of the
    /// corresponding input batch dims; an input batch dim of 1 is broadcast.
    pub fn batch_gemm(
        dtype: DataType,
        m: u32,
        n: u32,
        k: u32,
        batch_a: [u32; 3],
        batch_b: [u32; 3],
    ) -> Self {
        let batch_c = [0, 1, 2].map(|i| batch_a[i].max(batch_b[i]));
        LayerParams::new(
            OpKind::BatchGemm,
            TensorView::dense(dtype, [k, m, batch_a[0], batch_a[1], batch_a[2]]),
            TensorView::dense(dtype, [n, k, batch_b[0], batch_b[1], batch_b[2]]),
            TensorView::dense(dtype, [n, m, batch_c[0], batch_c[1], batch_c[2]]),
        )
    }

    /// A 2D convolution with square `size x size` images, unit stride and same padding.
    pub fn conv(
        kind: ConvKind,
        dtype: DataType,
        batch: u32,
        channels: u32,
        filters: u32,
        filter_size: u32,
        size: u32,
    ) -> Self {
        let x = TensorView::dense(dtype, [channels, size, size, 1, batch]);
        let w = TensorView::dense(dtype, [filters, channels, filter_size, filter_size, 1]);
        let y = TensorView::dense(dtype, [filters, size, size, 1, batch]);
        match kind {
            ConvKind::Fwd => LayerParams::new(OpKind::Fwd, x, w, y),
            ConvKind::Dedx => LayerParams::new(OpKind::Dedx, y, w, x),
            ConvKind::Dedw => {
                let mut params = LayerParams::new(OpKind::Dedw, x, y, w);
                params.transpose_a = true;
                params
            }
        }
    }

    pub fn memcpy(dtype: DataType, width: u32, height: u32) -> Self {
        let view = TensorView::dense(dtype, [width, height, 1, 1, 1]);
        LayerParams::new(
            OpKind::Memcpy,
            view,
            TensorView::dense(dtype, [1; MAX_TENSOR_DIMS]),
            view,
        )
    }

    /// Transposes a `width x height` tensor into a `height x width` one.
    pub fn transpose(dtype: DataType, width: u32, height: u32) -> Self {
        LayerParams::new(
            OpKind::Transpose,
            TensorView::dense(dtype, [width, height, 1, 1, 1]),
            TensorView::dense(dtype, [1; MAX_TENSOR_DIMS]),
            TensorView::dense(dtype, [height, width, 1, 1, 1]),
        )
    }

    pub fn with_strategy(mut self, strategy: MmeStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Marks GEMM inputs as transposed, swapping the first two dims of each transposed view.
    pub fn with_transposed(mut self, transpose_a: bool, transpose_b: bool) -> Self {
        if transpose_a != self.transpose_a {
            self.a = swap_inner_dims(&self.a);
        }
        if transpose_b != self.transpose_b {
            self.b = swap_inner_dims(&self.b);
        }
        self.transpose_a = transpose_a;
        self.transpose_b = transpose_b;
        self
    }

    pub fn operand(&self, operand: Operand) -> &TensorView {
        match operand {
            Operand::A => &self.a,
            Operand::B => &self.b,
            Operand::C => &self.c,
        }
    }

    pub fn fcd_size(&self) -> u64 {
        u64::from(self.c.sizes[0])
    }

    /// The output rows a single gemm covers. Convolutions flatten every output dim but the
    /// fcd into rows; the result saturates at `u64::MAX`.
    pub fn spatial_size(&self) -> u64 {
        match self.kind {
            OpKind::Fwd | OpKind::Dedx => saturating_product(&self.c.sizes[1..]),
            _ => u64::from(self.c.sizes[1]),
        }
    }

    pub fn is_transposed(&self, operand: Operand) -> bool {
        match operand {
            Operand::A => self.transpose_a || self.kind == OpKind::Transpose,
            Operand::B => self.transpose_b && !self.kind.is_native_dma(),
            Operand::C => false,
        }
    }

    pub fn is_fp8(&self) -> bool {
        self.a.dtype.is_fp8()
    }

    /// Returns `true` if `operand` is repeated for every index of output dim `dim`.
    pub fn is_operand_broadcasted(&self, operand: Operand, dim: usize) -> bool {
        if self.kind.is_dedw() && operand == Operand::B {
            return true;
        }
        self.kind.is_batch_gemm()
            && self.operand(operand).sizes[dim] == 1
            && self.c.sizes[dim] != 1
    }

    /// Returns `true` if `operand` is broadcast along every batch dim in which the output has
    /// more than one element.
    pub fn is_operand_fully_broadcasted(&self, operand: Operand) -> bool {
        if !self.kind.is_dedw_or_batch_gemm() {
            return false;
        }
        if self.kind.is_dedw() {
            return self.is_operand_broadcasted(operand, GEMM_DIM_B1);
        }
        let mut batch_dims = (GEMM_DIM_B1..=GEMM_DIM_B3)
            .filter(|&dim| self.c.sizes[dim] > 1)
            .peekable();
        batch_dims.peek().is_some()
            && batch_dims.all(|dim| self.is_operand_broadcasted(operand, dim))
    }
}

fn saturating_product(sizes: &[u32]) -> u64 {
    sizes
        .iter()
        .fold(1u64, |acc, &s| acc.saturating_mul(u64::from(s)))
}

fn swap_inner_dims(view: &TensorView) -> TensorView {
    let mut sizes = view.sizes;
    sizes.swap(0, 1);
    TensorView::dense(view.dtype, sizes)
}

impl Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Fwd => write!(f, "fwd"),
            OpKind::Dedx => write!(f, "dedx"),
            OpKind::Dedw => write!(f, "dedw"),
            OpKind::Gemm => write!(f, "gemm"),
            OpKind::BatchGemm => write!(f, "bgemm"),
            OpKind::Memcpy => write!(f, "memcpy"),
            OpKind::Transpose => write!(f, "transpose"),
        }
    }
}

impl Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Geometry::Wide4x => write!(f, "4xw"),
            Geometry::Wide2x => write!(f, "2xw"),
            Geometry::High2x => write!(f, "2xh"),
            Geometry::High4x => write!(f, "4xh"),
            Geometry::FourWideOneHigh => write!(f, "4wx1h"),
            Geometry::TwoWideTwoHigh => write!(f, "2wx2h"),
            Geometry::OneWideFourHigh => write!(f, "1wx4h"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric_geometries_are_the_ones_with_a_family() {
        use strum::IntoEnumIterator;
        let with_family = Geometry::iter()
            .filter(|g| g.family().is_some())
            .collect::<Vec<_>>();
        assert_eq!(with_family, Geometry::SYMMETRIC.to_vec());
    }

    #[test]
    fn test_dense_strides() {
        let v = TensorView::dense(DataType::Bf16, [4, 3, 2, 1, 1]);
        assert_eq!(v.strides, [1, 4, 12, 24, 24]);
        assert!(v.is_first_dim_dense());
        assert_eq!(v.volume(), 24);
    }

    #[test]
    fn test_gemm_sizes() {
        let p = LayerParams::gemm(DataType::Bf16, 64, 128, 32);
        assert_eq!(p.fcd_size(), 128);
        assert_eq!(p.spatial_size(), 64);
        assert!(!p.is_transposed(Operand::A));
    }

    #[test]
    fn test_with_transposed_swaps_inner_dims() {
        let p = LayerParams::gemm(DataType::Bf16, 64, 128, 32).with_transposed(true, false);
        assert!(p.is_transposed(Operand::A));
        assert_eq!(p.a.sizes[..2], [64, 32]);
        assert_eq!(p.b.sizes[..2], [128, 32]);
    }

    #[test]
    fn test_conv_spatial_size_spans_all_output_dims() {
        let p = LayerParams::conv(ConvKind::Fwd, DataType::Bf16, 2, 16, 32, 3, 8);
        assert_eq!(p.fcd_size(), 32);
        assert_eq!(p.spatial_size(), 8 * 8 * 2);
        let p = LayerParams::conv(ConvKind::Dedw, DataType::Bf16, 2, 16, 32, 3, 8);
        assert_eq!(p.fcd_size(), 32);
        assert_eq!(p.spatial_size(), 16);
        assert!(p.is_transposed(Operand::A));
    }

    #[test]
    fn test_conv_spatial_size_beyond_u32() {
        let p = LayerParams::conv(ConvKind::Fwd, DataType::Bf16, 512, 64, 64, 3, 4096);
        assert_eq!(p.spatial_size(), 4096 * 4096 * 512);
        let mut p = p;
        p.c = TensorView::dense(DataType::Bf16, [64, u32::MAX, u32::MAX, u32::MAX, u32::MAX]);
        assert_eq!(p.spatial_size(), u64::MAX);
        assert_eq!(p.c.volume(), u64::MAX);
    }

    #[test]
    fn test_transpose_op_always_transposes_a() {
        let p = LayerParams::transpose(DataType::Fp32, 64, 32);
        assert!(p.is_transposed(Operand::A));
        assert!(!p.is_transposed(Operand::B));
        assert_eq!(p.c.sizes[..2], [32, 64]);
    }

    #[test]
    fn test_batch_gemm_broadcast() {
        let p = LayerParams::batch_gemm(DataType::Bf16, 32, 32, 32, [4, 1, 1], [1, 1, 1]);
        assert!(p.is_operand_broadcasted(Operand::B, 2));
        assert!(!p.is_operand_broadcasted(Operand::B, 3));
        assert!(p.is_operand_fully_broadcasted(Operand::B));
        assert!(!p.is_operand_fully_broadcasted(Operand::A));

        let p = LayerParams::batch_gemm(DataType::Bf16, 32, 32, 32, [4, 2, 1], [1, 2, 1]);
        assert!(!p.is_operand_fully_broadcasted(Operand::B));
    }

    #[test]
    fn test_unbatched_output_is_never_fully_broadcast() {
        let p = LayerParams::batch_gemm(DataType::Bf16, 32, 32, 32, [1, 1, 1], [1, 1, 1]);
        assert!(!p.is_operand_fully_broadcasted(Operand::B));
        let p = LayerParams::gemm(DataType::Bf16, 32, 32, 32);
        assert!(!p.is_operand_fully_broadcasted(Operand::B));
    }

    #[test]
    fn test_dedw_b_is_fully_broadcast() {
        let p = LayerParams::conv(ConvKind::Dedw, DataType::Bf16, 1, 8, 8, 1, 8);
        assert!(p.is_operand_fully_broadcasted(Operand::B));
        assert!(!p.is_operand_fully_broadcasted(Operand::A));
    }
}
