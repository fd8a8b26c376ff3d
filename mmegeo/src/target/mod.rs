mod gaudi2;
mod gaudi3;

pub use gaudi2::{Gaudi2, Gaudi2Hal};
pub use gaudi3::{Gaudi3, Gaudi3Hal};

use crate::common::{DataType, Operand, UnsupportedConfiguration};
use crate::geoattr::GeoAttr;
use crate::params::OpKind;

use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};
use std::ops::Range;

/// Read-only topology and limit constants of one chip generation.
///
/// Implementations hold no mutable state and are shared by reference between concurrent
/// lowerings.
pub trait MmeHal: Debug + Send + Sync {
    fn chip(&self) -> ChipId;
    fn dies_nr(&self) -> u32;
    fn dcores_per_die(&self) -> u32;
    fn mme_nr(&self) -> u32;
    fn eus_per_mme(&self) -> u32;

    /// The base sizing unit, in elements, from which EU, port and accumulator sizes derive.
    fn cl_size(&self) -> u32;
    fn cache_line_bytes(&self) -> u32;
    /// The depth of a single suspension buffer, in cache lines.
    fn sb_size_in_cls(&self) -> u32;

    fn memory_region(&self, mode: TopologyMode) -> MemoryRegion;
    fn sync_object_range(&self) -> Range<u32>;
    fn monitor_range(&self) -> Range<u32>;

    fn dcores_nr(&self) -> u32 {
        self.dies_nr() * self.dcores_per_die()
    }

    /// Returns the number of elements the common dimension must be a multiple of so that the
    /// reduction tree stays valid.
    fn common_dim_alignment(
        &self,
        dtype: DataType,
        kind: OpKind,
    ) -> Result<u32, UnsupportedConfiguration> {
        match kind {
            OpKind::Memcpy => Ok(1),
            OpKind::Transpose => Ok(if dtype.is_fp8() { 2 } else { 1 }),
            _ => match dtype {
                DataType::Fp8_143 | DataType::Fp8_152 | DataType::Bf16 => Ok(8),
                DataType::Tf32 | DataType::Fp16 | DataType::Ufp16 => Ok(2),
                DataType::Fp32 => Ok(1),
                DataType::Int8 | DataType::Int16 | DataType::Int32 => {
                    Err(UnsupportedConfiguration::DataType { dtype, kind })
                }
            },
        }
    }
}

/// The per-chip part of the geometry computation.
///
/// [GeoAttr] calls these hooks in a fixed order during construction and delegates its derived
/// queries to them. The provided methods compute the queries shared by chips whose MME is a
/// single core of two engine units.
pub trait Chip: Clone + Copy + Debug + Default + Send + Sync + 'static {
    type Hal: MmeHal;

    fn chip_id() -> ChipId;

    /// Sets the base grids of an operation computed on the EUs.
    fn set_mme_grids(geo: &mut GeoAttr<'_, Self>) -> Result<(), UnsupportedConfiguration>;

    /// Sets the base grids of a native DMA operation.
    fn set_dma_grids(geo: &mut GeoAttr<'_, Self>) -> Result<(), UnsupportedConfiguration>;

    fn set_bgemm_concurrency(geo: &mut GeoAttr<'_, Self>) -> Result<(), UnsupportedConfiguration>;

    fn set_dedw_concurrency(geo: &mut GeoAttr<'_, Self>) -> Result<(), UnsupportedConfiguration>;

    fn cd_concurrency_eligible(geo: &GeoAttr<'_, Self>) -> bool;

    /// Rebuilds the port grids to split the common dim. Only called when
    /// [Chip::cd_concurrency_eligible] holds.
    fn set_cd_concurrency(geo: &mut GeoAttr<'_, Self>) -> Result<(), UnsupportedConfiguration>;

    fn cores_per_mme(geo: &GeoAttr<'_, Self>) -> u32;

    /// The number of an operand's spatial ports that feed a single EU.
    fn core_spatial_eu_port(geo: &GeoAttr<'_, Self>, operand: Operand) -> u32;

    fn do_port_advance_spatially(geo: &GeoAttr<'_, Self>, operand: Operand) -> bool;

    fn double_accums_bit(geo: &GeoAttr<'_, Self>) -> bool;

    fn bgemm_bit(geo: &GeoAttr<'_, Self>) -> bool {
        geo.a_grid().batch > 1 && geo.b_grid().batch > 1
    }

    fn non_share_a_bit(geo: &GeoAttr<'_, Self>) -> bool {
        geo.a_grid().batch > 1 && geo.b_grid().batch == 1
    }

    fn acc_height(geo: &GeoAttr<'_, Self>) -> u32 {
        geo.hal().cl_size()
    }

    fn eu_width(geo: &GeoAttr<'_, Self>) -> u32 {
        let cl = geo.hal().cl_size();
        if geo.bgemm_bit() {
            cl / 2
        } else {
            cl
        }
    }

    fn eu_height(geo: &GeoAttr<'_, Self>) -> u32 {
        let cl = geo.hal().cl_size();
        if geo.double_accums_bit() {
            cl / 2
        } else {
            cl
        }
    }

    fn mme_width(geo: &GeoAttr<'_, Self>) -> u32 {
        if geo.params().kind.is_native_dma() {
            return geo.c_grid().fcd * geo.port_size(Operand::C);
        }
        geo.eu_width() * eus_cooperation(geo)
    }

    fn mme_height(geo: &GeoAttr<'_, Self>) -> u32 {
        if geo.params().kind.is_native_dma() {
            return geo.c_grid().spatial * geo.port_size(Operand::C);
        }
        geo.eu_height() * eus_cooperation(geo)
    }

    fn port_size(geo: &GeoAttr<'_, Self>, operand: Operand) -> u32 {
        match geo.params().kind {
            OpKind::Memcpy => geo.hal().cl_size(),
            OpKind::Transpose => geo.te_height(),
            _ => match operand {
                Operand::A if geo.double_accums_bit() => geo.mme_height() * 2,
                Operand::A => geo.mme_height(),
                Operand::B | Operand::C => geo.mme_width(),
            },
        }
    }

    fn te_height(geo: &GeoAttr<'_, Self>) -> u32 {
        let cl = geo.hal().cl_size();
        let params = geo.params();
        if params.kind == OpKind::Transpose && params.a.dtype == DataType::Fp32 {
            cl / 4
        } else {
            cl / 2
        }
    }
}

/// Two EUs work on one logical tile unless each EU runs its own gemm.
fn eus_cooperation<C: Chip>(geo: &GeoAttr<'_, C>) -> u32 {
    if geo.bgemm_bit() || geo.non_share_a_bit() {
        1
    } else {
        2
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ChipId {
    Gaudi2,
    #[default]
    Gaudi3,
}

/// Whether the whole chip or a single die is exposed as one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum TopologyMode {
    FullChip,
    SingleDie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct MemoryRegion {
    pub base: u64,
    pub size: u64,
}

impl MemoryRegion {
    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    pub fn contains(&self, addr: u64) -> bool {
        (self.base..self.end()).contains(&addr)
    }
}

impl Display for ChipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChipId::Gaudi2 => write!(f, "gaudi2"),
            ChipId::Gaudi3 => write!(f, "gaudi3"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{Geometry, LayerParams, MmeStrategy};
    use proptest::prelude::*;
    use strum::IntoEnumIterator;

    fn hals() -> [Box<dyn MmeHal>; 2] {
        [Box::new(Gaudi2Hal::default()), Box::new(Gaudi3Hal::default())]
    }

    #[test]
    fn test_common_dim_alignment_table() {
        let expected = [
            (DataType::Fp8_143, 8),
            (DataType::Fp8_152, 8),
            (DataType::Bf16, 8),
            (DataType::Tf32, 2),
            (DataType::Fp16, 2),
            (DataType::Ufp16, 2),
            (DataType::Fp32, 1),
        ];
        for hal in hals() {
            for kind in [OpKind::Fwd, OpKind::Dedx, OpKind::Dedw, OpKind::Gemm, OpKind::BatchGemm]
            {
                for (dtype, alignment) in expected {
                    assert_eq!(hal.common_dim_alignment(dtype, kind), Ok(alignment));
                }
            }
        }
    }

    #[test]
    fn test_common_dim_alignment_of_native_dma() {
        for hal in hals() {
            for dtype in DataType::iter() {
                assert_eq!(hal.common_dim_alignment(dtype, OpKind::Memcpy), Ok(1));
                let expected = if dtype.is_fp8() { 2 } else { 1 };
                assert_eq!(
                    hal.common_dim_alignment(dtype, OpKind::Transpose),
                    Ok(expected)
                );
            }
        }
    }

    #[test]
    fn test_profile_constants() {
        let g2 = Gaudi2Hal::default();
        let g3 = Gaudi3Hal::default();
        assert_eq!((g2.chip(), g2.dcores_nr(), g2.mme_nr()), (ChipId::Gaudi2, 4, 2));
        assert_eq!((g3.chip(), g3.dcores_nr(), g3.mme_nr()), (ChipId::Gaudi3, 4, 8));
        for hal in hals() {
            assert_eq!(hal.eus_per_mme(), 2);
            assert_eq!(hal.cl_size(), 128);
            assert_eq!(hal.cache_line_bytes(), 128);
            assert!(hal.sb_size_in_cls() > 0);
            assert!(!hal.sync_object_range().is_empty());
            assert!(hal.monitor_range().len() <= hal.sync_object_range().len());
        }
    }

    #[test]
    fn test_synthetic_profile_limits_mmes() {
        let hal = Gaudi3Hal {
            mme_nr: 4,
            ..Gaudi3Hal::default()
        };
        let params = LayerParams::gemm(DataType::Bf16, 256, 256, 256)
            .with_strategy(MmeStrategy::new(Geometry::Wide4x, 8));
        assert!(matches!(
            GeoAttr::<Gaudi3>::new(&params, &hal),
            Err(UnsupportedConfiguration::MmeLimit { mme_nr: 4, .. })
        ));
    }

    #[test]
    fn test_memory_region_contains() {
        let r = MemoryRegion {
            base: 0x100,
            size: 0x10,
        };
        assert!(r.contains(0x100));
        assert!(r.contains(0x10f));
        assert!(!r.contains(0x110));
        assert_eq!(r.end(), 0x110);
    }

    #[test]
    fn test_single_die_region_fits_in_full_chip_region() {
        for hal in hals() {
            let full = hal.memory_region(TopologyMode::FullChip);
            let die = hal.memory_region(TopologyMode::SingleDie);
            assert!(full.contains(die.base));
            assert!(die.end() <= full.end());
        }
    }

    proptest! {
        #[test]
        fn test_integer_types_have_no_compute_alignment(
            dtype in prop::sample::select(vec![DataType::Int8, DataType::Int16, DataType::Int32]),
            kind in prop::sample::select(
                vec![OpKind::Fwd, OpKind::Dedx, OpKind::Dedw, OpKind::Gemm, OpKind::BatchGemm]
            ),
        ) {
            for hal in hals() {
                prop_assert_eq!(
                    hal.common_dim_alignment(dtype, kind),
                    Err(UnsupportedConfiguration::DataType { dtype, kind })
                );
            }
        }
    }
}
