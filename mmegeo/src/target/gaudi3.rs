use divrem::DivCeil;
use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::common::{Operand, UnsupportedConfiguration};
use crate::geoattr::GeoAttr;
use crate::grid::Grid;
use crate::params::{Geometry, GeometryFamily};
use crate::target::{Chip, ChipId, MemoryRegion, MmeHal, TopologyMode};

const GAUDI3_DRAM_BASE: u64 = 0x1000_0000_0000;
const GIB: u64 = 1 << 30;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub struct Gaudi3;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Gaudi3Hal {
    pub dies_nr: u32,
    pub dcores_per_die: u32,
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

impl Default for Gaudi3Hal {
    fn default() -> Self {
        Gaudi3Hal {
            dies_nr: 2,
            dcores_per_die: 2,
            mme_nr: 8,
            eus_per_mme: 2,
            cl_size: 128,
            cache_line_bytes: 128,
            sb_size_in_cls: 64,
            dram_base: GAUDI3_DRAM_BASE,
            dram_size: 128 * GIB,
            sync_objects_nr: 8192,
            monitors_nr: 2048,
        }
    }
}

impl MmeHal for Gaudi3Hal {
    fn chip(&self) -> ChipId {
        ChipId::Gaudi3
    }

    fn dies_nr(&self) -> u32 {
        self.dies_nr
    }

    fn dcores_per_die(&self) -> u32 {
        self.dcores_per_die
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

    fn memory_region(&self, mode: TopologyMode) -> MemoryRegion {
        match mode {
            TopologyMode::FullChip => MemoryRegion {
                base: self.dram_base,
                size: self.dram_size,
            },
            // Each die owns an equal, contiguous share of the HBM.
            TopologyMode::SingleDie => MemoryRegion {
                base: self.dram_base,
                size: self.dram_size / u64::from(self.dies_nr.max(1)),
            },
        }
    }

    fn sync_object_range(&self) -> Range<u32> {
        0..self.sync_objects_nr
    }

    fn monitor_range(&self) -> Range<u32> {
        0..self.monitors_nr
    }
}

impl Chip for Gaudi3 {
    type Hal = Gaudi3Hal;

    fn chip_id() -> ChipId {
        ChipId::Gaudi3
    }

    fn set_mme_grids(geo: &mut GeoAttr<'_, Self>) -> Result<(), UnsupportedConfiguration> {
        let strategy = geo.params().strategy;
        let limit = strategy.mme_limit;
        let mme_grid = match strategy.geometry {
            _ if limit == 1 && strategy.geometry.family().is_some() => Grid::ONE,
            Geometry::Wide2x => Grid::new(limit / 2, 2),
            Geometry::Wide4x => Grid::new(limit, 1),
            Geometry::High2x => Grid::new(2, limit / 2),
            Geometry::High4x => Grid::new(1, limit),
            geometry => return Err(unsupported_geometry(geometry)),
        };
        geo.mme_grid = mme_grid;
        set_base_ports(geo);
        Ok(())
    }

    fn set_dma_grids(geo: &mut GeoAttr<'_, Self>) -> Result<(), UnsupportedConfiguration> {
        let strategy = geo.params().strategy;
        let limit = strategy.mme_limit;
        let Some(family) = strategy.geometry.family() else {
            return Err(unsupported_geometry(strategy.geometry));
        };
        let transposed = geo.is_transposed(Operand::A);
        let (mme_grid, a_grid, c_grid) = match (family, transposed) {
            (GeometryFamily::Wide, false) => (Grid::new(limit, 1), Grid::new(2, 1), Grid::new(2, 1)),
            (GeometryFamily::Wide, true) => (Grid::new(limit, 1), Grid::new(1, 2), Grid::new(2, 1)),
            (GeometryFamily::High, false) => (Grid::new(1, limit), Grid::new(1, 2), Grid::new(1, 2)),
            (GeometryFamily::High, true) => (Grid::new(1, limit), Grid::new(2, 1), Grid::new(1, 2)),
        };
        geo.mme_grid = mme_grid;
        geo.a_grid = a_grid;
        geo.b_grid = Grid::default();
        geo.c_grid = c_grid;
        Ok(())
    }

    fn set_bgemm_concurrency(geo: &mut GeoAttr<'_, Self>) -> Result<(), UnsupportedConfiguration> {
        if geo.mme_grid.fcd != 1 || geo.mme_grid.spatial != 1 {
            return Ok(());
        }
        let params = geo.params();
        let fcd = params.fcd_size();
        let sp = params.spatial_size();
        let eu_width = u64::from(geo.eu_width());
        let eu_height = u64::from(geo.eu_height());

        if params.is_operand_fully_broadcasted(Operand::B) && fcd <= eu_width && sp <= eu_height {
            // B is shared by both EUs; each EU runs its own gemm on a private A.
            for operand in [Operand::A, Operand::C] {
                let grid = geo.grid_mut(operand);
                grid.spatial /= 2;
                grid.batch = 2;
            }
        } else if fcd <= eu_width / 2 && sp <= eu_height {
            for operand in [Operand::A, Operand::B, Operand::C] {
                let grid = geo.grid_mut(operand);
                grid.spatial /= 2;
                grid.batch = 2;
            }
        }
        Ok(())
    }

    fn set_dedw_concurrency(geo: &mut GeoAttr<'_, Self>) -> Result<(), UnsupportedConfiguration> {
        if geo.mme_grid.fcd != 1 || geo.mme_grid.spatial != 1 {
            return geo.set_grids();
        }
        // Splitting two filters between the EUs needs a distinct base offset per port, which the
        // ports do not have. The MME-level batch concurrency from folding is kept as is.
        Ok(())
    }

    fn cd_concurrency_eligible(geo: &GeoAttr<'_, Self>) -> bool {
        let cl = u64::from(geo.hal().cl_size());
        let params = geo.params();
        params.fcd_size() <= cl && params.spatial_size() <= cl
    }

    fn set_cd_concurrency(geo: &mut GeoAttr<'_, Self>) -> Result<(), UnsupportedConfiguration> {
        geo.a_grid = Grid::default();
        geo.b_grid = Grid::default();
        geo.c_grid = Grid::default();
        set_base_ports(geo);
        Ok(())
    }

    fn cores_per_mme(_geo: &GeoAttr<'_, Self>) -> u32 {
        1
    }

    fn core_spatial_eu_port(geo: &GeoAttr<'_, Self>, operand: Operand) -> u32 {
        (geo.grid(operand).spatial / geo.hal().eus_per_mme()).max(1)
    }

    fn do_port_advance_spatially(_geo: &GeoAttr<'_, Self>, _operand: Operand) -> bool {
        true
    }

    fn double_accums_bit(geo: &GeoAttr<'_, Self>) -> bool {
        let params = geo.params();
        if params.kind.is_native_dma() || params.strategy.dual_gemm {
            return false;
        }
        // Every interleaved port needs at least one output row.
        let interleaving = if geo.is_transposed(Operand::A) {
            Operand::A
        } else {
            Operand::C
        };
        if params.c.sizes[1] < geo.interleaved_spatial_ports_nr(interleaving) {
            return false;
        }
        let c_ports = u64::from(geo.interleaved_spatial_ports_nr(Operand::C).max(1));
        DivCeil::div_ceil(params.spatial_size(), c_ports) <= u64::from(geo.acc_height() / 2)
    }
}

fn set_base_ports(geo: &mut GeoAttr<'_, Gaudi3>) {
    geo.a_grid = Grid::new(1, 4);
    geo.b_grid = Grid::new(1, 4);
    geo.c_grid = Grid::new(1, 2);
}

fn unsupported_geometry(geometry: Geometry) -> UnsupportedConfiguration {
    UnsupportedConfiguration::Geometry {
        chip: ChipId::Gaudi3,
        geometry,
    }
}
