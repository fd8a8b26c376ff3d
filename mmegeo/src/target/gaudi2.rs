use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::common::{Operand, UnsupportedConfiguration};
use crate::geoattr::GeoAttr;
use crate::grid::Grid;
use crate::params::Geometry;
use crate::target::{Chip, ChipId, MemoryRegion, MmeHal, TopologyMode};

const GAUDI2_DRAM_BASE: u64 = 0x1000_0000_0000;
const GIB: u64 = 1 << 30;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub struct Gaudi2;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Gaudi2Hal {
    pub dcores_nr: u32,
    pub mme_nr: u32,
    pub eus_per_mme: u32,
    pub cl_size: u32,
    pub cache_line_bytes: u32,
    pub sb_size_in_cls: u32,
    pub dram_base: u64,
    pub dram_size: u64,
    pub sync_objects_nr: u32,
    pub monitors_nr: u32,
}

impl Default for Gaudi2Hal {
    fn default() -> Self {
        Gaudi2Hal {
            dcores_nr: 4,
            mme_nr: 2,
            eus_per_mme: 2,
            cl_size: 128,
            cache_line_bytes: 128,
            sb_size_in_cls: 32,
            dram_base: GAUDI2_DRAM_BASE,
            dram_size: 96 * GIB,
            sync_objects_nr: 2048,
            monitors_nr: 512,
        }
    }
}

impl MmeHal for Gaudi2Hal {
    fn chip(&self) -> ChipId {
        ChipId::Gaudi2
    }

    fn dies_nr(&self) -> u32 {
        1
    }

    fn dcores_per_die(&self) -> u32 {
        self.dcores_nr
    }

    fn mme_nr(&self) -> u32 {
        self.mme_nr
    }

    fn eus_per_mme(&self) -> u32 {
        self.eus_per_mme
    }

    fn cl_size(&self) -> u32 {
        self.cl_size
    }

    fn cache_line_bytes(&self) -> u32 {
        self.cache_line_bytes
    }

    fn sb_size_in_cls(&self) -> u32 {
        self.sb_size_in_cls
    }

    fn memory_region(&self, _mode: TopologyMode) -> MemoryRegion {
        MemoryRegion {
            base: self.dram_base,
            size: self.dram_size,
        }
    }

    fn sync_object_range(&self) -> Range<u32> {
        0..self.sync_objects_nr
    }

    fn monitor_range(&self) -> Range<u32> {
        0..self.monitors_nr
    }
}

impl Chip for Gaudi2 {
    type Hal = Gaudi2Hal;

    fn chip_id() -> ChipId {
        ChipId::Gaudi2
    }

    fn set_mme_grids(geo: &mut GeoAttr<'_, Self>) -> Result<(), UnsupportedConfiguration> {
        let strategy = geo.params().strategy;
        let limit = strategy.mme_limit;
        match strategy.geometry {
            Geometry::Wide4x => {
                geo.mme_grid = Grid::new(limit, 1);
                set_wide_ports(geo);
            }
            Geometry::Wide2x => {
                geo.mme_grid = Grid::new(limit, 1);
                set_sym_ports(geo);
            }
            Geometry::High2x => {
                geo.mme_grid = Grid::new(1, limit);
                set_sym_ports(geo);
            }
            Geometry::High4x => {
                geo.mme_grid = Grid::new(1, limit);
                set_high_ports(geo);
            }
            geometry => {
                return Err(UnsupportedConfiguration::Geometry {
                    chip: ChipId::Gaudi2,
                    geometry,
                })
            }
        }
        Ok(())
    }

    fn set_dma_grids(geo: &mut GeoAttr<'_, Self>) -> Result<(), UnsupportedConfiguration> {
        Err(UnsupportedConfiguration::OpKind {
            chip: ChipId::Gaudi2,
            kind: geo.params().kind,
        })
    }

    fn set_bgemm_concurrency(geo: &mut GeoAttr<'_, Self>) -> Result<(), UnsupportedConfiguration> {
        if geo.mme_grid.fcd != 1 || geo.mme_grid.spatial != 1 {
            return Ok(());
        }
        let params = geo.params();
        let fcd = params.fcd_size();
        let sp = params.spatial_size();
        let is_fp8 = params.is_fp8();

        // Two gemms per EU. The EU cannot run two gemms on fp8 or on a B with padded rows.
        let b_port = u64::from(geo.port_size(Operand::B));
        if fcd <= b_port && sp <= b_port && !is_fp8 && params.b.is_first_dim_dense() {
            set_bgemm_4x(geo);
            return Ok(());
        }

        // A single gemm per EU. Only possible when the cores share B, since a shared A needs
        // the cores to skip the unused half of the A port.
        if geo.is_port_shared_between_cores(Operand::A)
            || !geo.is_port_shared_between_cores(Operand::B)
        {
            return Ok(());
        }
        if params.strategy.geometry == Geometry::High4x {
            if fcd <= b_port
                && sp <= u64::from(geo.eu_height())
                && (!is_fp8 || geo.is_transposed(Operand::B))
            {
                set_bgemm_2x(geo);
            }
        } else if fcd <= u64::from(geo.eu_width() / 2) && sp <= u64::from(geo.eu_height()) {
            set_bgemm_2x(geo);
        }
        Ok(())
    }

    fn set_dedw_concurrency(geo: &mut GeoAttr<'_, Self>) -> Result<(), UnsupportedConfiguration> {
        if geo.params().is_fp8() {
            return Ok(());
        }
        if geo.mme_grid.fcd != 1 || geo.mme_grid.spatial != 1 {
            return geo.set_grids();
        }

        let fcd = geo.params().fcd_size();
        let sp = geo.params().spatial_size();
        while geo.mme_fcd_ports(Operand::A) > 1 {
            let half_ports = geo.mme_fcd_ports(Operand::A) / 2;
            let half_rows = u64::from(half_ports) * u64::from(geo.port_size(Operand::A));
            if fcd > u64::from(geo.eu_width()) || sp > half_rows {
                break;
            }
            if geo.core_grid.spatial > 1 || geo.core_grid.fcd > 1 {
                // One filter per EU.
                geo.core_grid = Grid::with_batch(1, 1, 2);
            } else {
                geo.a_grid.fcd /= 2;
                geo.a_grid.batch *= 2;
            }
        }
        Ok(())
    }

    fn cd_concurrency_eligible(_geo: &GeoAttr<'_, Self>) -> bool {
        false
    }

    fn set_cd_concurrency(geo: &mut GeoAttr<'_, Self>) -> Result<(), UnsupportedConfiguration> {
        // The port grids have no common-dim axis.
        Err(UnsupportedConfiguration::OpKind {
            chip: ChipId::Gaudi2,
            kind: geo.params().kind,
        })
    }

    fn cores_per_mme(_geo: &GeoAttr<'_, Self>) -> u32 {
        2
    }

    fn core_spatial_eu_port(geo: &GeoAttr<'_, Self>, operand: Operand) -> u32 {
        if geo.params().is_fp8() && !geo.is_transposed(operand) {
            geo.core_spatial_ports(operand)
        } else {
            1
        }
    }

    fn do_port_advance_spatially(geo: &GeoAttr<'_, Self>, operand: Operand) -> bool {
        if geo.is_transposed(operand) {
            return true;
        }
        // Narrow fp8 geometries run out of port width before they run out of cores.
        let geometry = geo.params().strategy.geometry;
        geo.params().is_fp8()
            && matches!(
                (operand, geometry),
                (Operand::A, Geometry::Wide4x) | (Operand::B, Geometry::High4x)
            )
    }

    fn double_accums_bit(geo: &GeoAttr<'_, Self>) -> bool {
        // A broadcast B with several gemms per EU may need the full EU height.
        if geo.a_grid().batch > 1 && geo.c_grid().batch == 1 {
            return false;
        }
        geo.bgemm_bit()
    }

    fn bgemm_bit(geo: &GeoAttr<'_, Self>) -> bool {
        geo.c_grid().batch > 1
    }

    fn eu_width(geo: &GeoAttr<'_, Self>) -> u32 {
        let params = geo.params();
        if geo.mme_concurrency() == 1 || params.is_operand_fully_broadcasted(Operand::B) {
            return geo.c_grid().fcd * geo.hal().cl_size();
        }
        // Each core runs its own gemm, so the EU is as wide as one core's B ports.
        if geo.is_transposed(Operand::B) {
            geo.b_grid().spatial * geo.te_height()
        } else {
            geo.b_grid().fcd * geo.port_size(Operand::B)
        }
    }

    fn eu_height(geo: &GeoAttr<'_, Self>) -> u32 {
        let cl = geo.hal().cl_size();
        if geo.double_accums_bit() {
            return cl / 2;
        }
        if geo.mme_concurrency() == 1 || geo.params().is_operand_fully_broadcasted(Operand::A) {
            return geo.c_grid().spatial * cl;
        }
        if geo.is_transposed(Operand::A) {
            geo.a_grid().spatial * geo.te_height()
        } else {
            geo.a_grid().fcd * geo.port_size(Operand::A)
        }
    }

    fn mme_width(geo: &GeoAttr<'_, Self>) -> u32 {
        geo.core_grid().fcd * geo.eu_width()
    }

    fn mme_height(geo: &GeoAttr<'_, Self>) -> u32 {
        geo.core_grid().spatial * geo.eu_height()
    }

    fn port_size(geo: &GeoAttr<'_, Self>, operand: Operand) -> u32 {
        let cl = geo.hal().cl_size();
        match operand {
            // A single-byte element lets a port bring a full cache line of elements.
            Operand::A | Operand::B if geo.params().is_fp8() => cl,
            Operand::A | Operand::B => cl / 2,
            Operand::C => cl,
        }
    }

    fn te_height(geo: &GeoAttr<'_, Self>) -> u32 {
        geo.hal().cl_size() / 2
    }
}

/// Ports of the 4xw geometry: two cores side by side, each with a single A port.
fn set_wide_ports(geo: &mut GeoAttr<'_, Gaudi2>) {
    geo.a_grid = Grid::ONE;
    geo.b_grid = if geo.is_transposed(Operand::B) {
        Grid::new(1, 4)
    } else if geo.params().is_fp8() {
        Grid::new(2, 2)
    } else {
        Grid::new(4, 1)
    };
    geo.c_grid = Grid::new(2, 1);
    geo.core_grid = Grid::new(2, 1);
}

/// Ports of the 4xh geometry: two cores stacked, each with a single B port.
fn set_high_ports(geo: &mut GeoAttr<'_, Gaudi2>) {
    geo.a_grid = if geo.is_transposed(Operand::A) {
        Grid::new(1, 4)
    } else if geo.params().is_fp8() {
        Grid::new(2, 2)
    } else {
        Grid::new(4, 1)
    };
    geo.b_grid = Grid::ONE;
    geo.c_grid = Grid::new(1, 2);
    geo.core_grid = Grid::new(1, 2);
}

fn set_sym_ports(geo: &mut GeoAttr<'_, Gaudi2>) {
    let is_fp8 = geo.params().is_fp8();
    for operand in [Operand::A, Operand::B] {
        *geo.grid_mut(operand) = if geo.is_transposed(operand) || is_fp8 {
            Grid::new(1, 2)
        } else {
            Grid::new(2, 1)
        };
    }
    geo.c_grid = Grid::new(2, 1);
    geo.core_grid = Grid::new(1, 2);
}

/// Two gemms per EU, four per MME.
fn set_bgemm_4x(geo: &mut GeoAttr<'_, Gaudi2>) {
    geo.a_grid = Grid::with_batch(1, 1, 2);
    geo.b_grid = Grid::with_batch(1, 1, 2);
    geo.c_grid = Grid::with_batch(1, 1, 2);
    geo.core_grid = Grid::with_batch(1, 1, 2);
}

/// One gemm per EU, two per MME.
fn set_bgemm_2x(geo: &mut GeoAttr<'_, Gaudi2>) {
    geo.c_grid = Grid::new(1, 2);
    geo.core_grid = Grid::with_batch(1, 1, 2);
}
