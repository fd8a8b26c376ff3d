use divrem::DivCeil;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::marker::PhantomData;

use crate::common::{Operand, UnsupportedConfiguration, GEMM_DIM_B1, GEMM_DIM_B3};
use crate::grid::Grid;
use crate::params::{LayerParams, OpKind};
use crate::target::{Chip, MmeHal};
use crate::utils::is_power_of_two_u32;

/// The concurrency optimization applied on top of the base grids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ConcurrencyPolicy {
    None,
    /// Independent gemms of a batch run on idle MMEs and EUs.
    Batch,
    /// Weight-gradient filters run on idle MMEs.
    Dedw,
    /// The common dim is split between cores; partial results need a later reduction.
    CommonDim,
}

/// The partition of one operation over the MMEs, cores and ports of a chip.
///
/// Construction computes the base grids through [Chip::set_mme_grids] or
/// [Chip::set_dma_grids] and then applies at most one [ConcurrencyPolicy]. A constructed
/// [GeoAttr] is never modified again; every query is a pure function of its grids, the
/// [LayerParams] and the [MmeHal].
#[derive(Debug)]
pub struct GeoAttr<'a, C: Chip> {
    params: &'a LayerParams,
    hal: &'a C::Hal,
    pub(crate) mme_grid: Grid,
    pub(crate) core_grid: Grid,
    pub(crate) a_grid: Grid,
    pub(crate) b_grid: Grid,
    pub(crate) c_grid: Grid,
    policy: ConcurrencyPolicy,
    chip: PhantomData<C>,
}

impl<'a, C: Chip> GeoAttr<'a, C> {
    pub fn new(params: &'a LayerParams, hal: &'a C::Hal) -> Result<Self, UnsupportedConfiguration> {
        let mme_limit = params.strategy.mme_limit;
        if !is_power_of_two_u32(mme_limit) || mme_limit > hal.mme_nr() {
            return Err(UnsupportedConfiguration::MmeLimit {
                chip: C::chip_id(),
                limit: mme_limit,
                mme_nr: hal.mme_nr(),
            });
        }

        let mut geo = GeoAttr {
            params,
            hal,
            mme_grid: Grid::default(),
            core_grid: Grid::ONE,
            a_grid: Grid::default(),
            b_grid: Grid::default(),
            c_grid: Grid::default(),
            policy: ConcurrencyPolicy::None,
            chip: PhantomData,
        };
        geo.set_grids()?;
        debug!(
            "Base grids for {} on {} ({}): {}",
            params.kind,
            C::chip_id(),
            params.strategy.geometry,
            geo
        );

        geo.policy = geo.apply_concurrency()?;
        debug!("Applied {:?} concurrency: {}", geo.policy, geo);
        debug_assert!(geo.grids_are_valid(), "invalid grids: {}", geo);
        Ok(geo)
    }

    /// Resets every grid and recomputes the base grids from scratch.
    pub(crate) fn set_grids(&mut self) -> Result<(), UnsupportedConfiguration> {
        self.mme_grid = Grid::default();
        self.core_grid = Grid::ONE;
        self.a_grid = Grid::default();
        self.b_grid = Grid::default();
        self.c_grid = Grid::default();
        if self.params.kind.is_native_dma() {
            C::set_dma_grids(self)
        } else {
            C::set_mme_grids(self)
        }
    }

    fn apply_concurrency(&mut self) -> Result<ConcurrencyPolicy, UnsupportedConfiguration> {
        let kind = self.params.kind;
        let strategy = self.params.strategy;
        if kind.is_native_dma() {
            return Ok(ConcurrencyPolicy::None);
        }
        if kind.is_batch_gemm() {
            if !strategy.batch_concurrency {
                return Ok(ConcurrencyPolicy::None);
            }
            self.fold_idle_mmes();
            C::set_bgemm_concurrency(self)?;
            return Ok(ConcurrencyPolicy::Batch);
        }
        if kind.is_dedw() {
            if !strategy.batch_concurrency {
                return Ok(ConcurrencyPolicy::None);
            }
            self.fold_idle_mmes();
            C::set_dedw_concurrency(self)?;
            return Ok(ConcurrencyPolicy::Dedw);
        }
        if strategy.cd_concurrency && C::cd_concurrency_eligible(self) {
            C::set_cd_concurrency(self)?;
            return Ok(ConcurrencyPolicy::CommonDim);
        }
        Ok(ConcurrencyPolicy::None)
    }

    /// Moves MMEs which would have no work along the fcd or spatial axis onto the next batch.
    fn fold_idle_mmes(&mut self) {
        let fcd = self.params.fcd_size();
        let sp = self.params.spatial_size();
        while u64::from(self.geometry_width() / 2) >= fcd && self.mme_grid.fcd > 1 {
            self.mme_grid.fcd /= 2;
            self.mme_grid.batch *= 2;
            trace!("Folded fcd MMEs into batch: {}", self.mme_grid);
        }
        while u64::from(self.geometry_height() / 2) >= sp && self.mme_grid.spatial > 1 {
            self.mme_grid.spatial /= 2;
            self.mme_grid.batch *= 2;
            trace!("Folded spatial MMEs into batch: {}", self.mme_grid);
        }
    }

    fn grids_are_valid(&self) -> bool {
        let b_valid = if self.params.kind.is_native_dma() {
            self.b_grid.is_unset()
        } else {
            self.b_grid.is_populated()
        };
        b_valid
            && [self.mme_grid, self.core_grid, self.a_grid, self.c_grid]
                .iter()
                .all(Grid::is_populated)
    }

    pub(crate) fn grid_mut(&mut self, operand: Operand) -> &mut Grid {
        match operand {
            Operand::A => &mut self.a_grid,
            Operand::B => &mut self.b_grid,
            Operand::C => &mut self.c_grid,
        }
    }

    pub fn params(&self) -> &'a LayerParams {
        self.params
    }

    pub fn hal(&self) -> &'a C::Hal {
        self.hal
    }

    pub fn policy(&self) -> ConcurrencyPolicy {
        self.policy
    }

    pub fn mme_grid(&self) -> Grid {
        self.mme_grid
    }

    pub fn core_grid(&self) -> Grid {
        self.core_grid
    }

    pub fn a_grid(&self) -> Grid {
        self.a_grid
    }

    pub fn b_grid(&self) -> Grid {
        self.b_grid
    }

    pub fn c_grid(&self) -> Grid {
        self.c_grid
    }

    pub fn grid(&self, operand: Operand) -> Grid {
        match operand {
            Operand::A => self.a_grid,
            Operand::B => self.b_grid,
            Operand::C => self.c_grid,
        }
    }

    /// The operands which take part in the operation. Native DMA has no B operand.
    pub fn operands(&self) -> &'static [Operand] {
        if self.params.kind.is_native_dma() {
            &[Operand::A, Operand::C]
        } else {
            &[Operand::A, Operand::B, Operand::C]
        }
    }

    pub fn is_transposed(&self, operand: Operand) -> bool {
        self.params.is_transposed(operand)
    }

    pub fn common_dim_alignment(&self) -> Result<u32, UnsupportedConfiguration> {
        self.hal
            .common_dim_alignment(self.params.a.dtype, self.params.kind)
    }

    pub fn bgemm_bit(&self) -> bool {
        C::bgemm_bit(self)
    }

    pub fn non_share_a_bit(&self) -> bool {
        C::non_share_a_bit(self)
    }

    pub fn double_accums_bit(&self) -> bool {
        C::double_accums_bit(self)
    }

    pub fn acc_height(&self) -> u32 {
        C::acc_height(self)
    }

    pub fn eu_width(&self) -> u32 {
        C::eu_width(self)
    }

    pub fn eu_height(&self) -> u32 {
        C::eu_height(self)
    }

    pub fn mme_width(&self) -> u32 {
        C::mme_width(self)
    }

    pub fn mme_height(&self) -> u32 {
        C::mme_height(self)
    }

    pub fn port_size(&self, operand: Operand) -> u32 {
        C::port_size(self, operand)
    }

    pub fn te_height(&self) -> u32 {
        C::te_height(self)
    }

    pub fn cores_per_mme(&self) -> u32 {
        C::cores_per_mme(self)
    }

    pub fn core_spatial_eu_port(&self, operand: Operand) -> u32 {
        C::core_spatial_eu_port(self, operand)
    }

    pub fn do_port_advance_spatially(&self, operand: Operand) -> bool {
        C::do_port_advance_spatially(self, operand)
    }

    /// The number of contiguous elements a port pushes towards the EU: its width, or the
    /// transpose engine height when the operand is transposed.
    pub fn eu_facing_port_size(&self, operand: Operand) -> u32 {
        debug_assert_ne!(operand, Operand::C, "expected an input operand");
        if self.is_transposed(operand) {
            self.te_height()
        } else {
            self.port_size(operand)
        }
    }

    pub fn geometry_width(&self) -> u32 {
        self.mme_grid.fcd * self.mme_width()
    }

    pub fn geometry_height(&self) -> u32 {
        self.mme_grid.spatial * self.mme_height()
    }

    /// The number of gemms a single core works on concurrently.
    pub fn core_concurrency(&self) -> u32 {
        // A broadcast input has a single batch port while the other input has one per gemm.
        self.a_grid.batch.max(self.b_grid.batch)
    }

    pub fn mme_concurrency(&self) -> u32 {
        self.core_concurrency() * self.core_grid.batch
    }

    pub fn geometry_concurrency(&self) -> u32 {
        self.mme_grid.batch * self.mme_concurrency()
    }

    /// The output batch dim iterated concurrently, chosen to minimize the total batch steps.
    ///
    /// Returns `None` for operations other than batch gemms.
    pub fn concurrent_dim(&self) -> Option<usize> {
        if !self.params.kind.is_batch_gemm() {
            return None;
        }
        let concurrency = self.geometry_concurrency();
        let sizes = &self.params.c.sizes;
        (GEMM_DIM_B1..=GEMM_DIM_B3).min_by_key(|&dim| {
            (GEMM_DIM_B1..=GEMM_DIM_B3)
                .map(|b| {
                    let size = u64::from(sizes[b]);
                    if b == dim {
                        DivCeil::div_ceil(size, u64::from(concurrency))
                    } else {
                        size
                    }
                })
                .fold(1u64, u64::saturating_mul)
        })
    }

    pub fn core_idx_to_grid(&self, core_idx: u32) -> Option<Grid> {
        self.core_grid.idx_to_grid(core_idx)
    }

    pub fn mme_idx_to_grid(&self, mme_idx: u32) -> Option<Grid> {
        self.mme_grid.idx_to_grid(mme_idx)
    }

    /// Translates a core's position on the core grid into the movement of an operand's ports.
    ///
    /// Output ports follow the core grid. Input ports may advance on a different axis than the
    /// core, depending on the chip and on whether the ports are shared between cores.
    pub fn core_idx_to_effective_grid(&self, operand: Operand, core_idx: u32) -> Option<Grid> {
        let mut grid = self.core_idx_to_grid(core_idx)?;
        if operand == Operand::C {
            return Some(grid);
        }
        if self.do_port_advance_spatially(operand) {
            grid.spatial += grid.fcd;
            grid.fcd = 0;
        } else {
            grid.fcd += grid.spatial;
            grid.spatial = 0;
        }
        if operand == Operand::B && self.is_port_shared_between_cores(operand) {
            if self.is_transposed(operand) {
                grid.spatial += grid.batch;
            } else {
                grid.fcd += grid.batch;
            }
            grid.batch = 0;
        }
        Some(grid)
    }

    /// The number of cores along each axis of an operand's port movement.
    pub fn effective_core_grid(&self, operand: Operand) -> Grid {
        let last_core = self.cores_per_mme().saturating_sub(1);
        let mut grid = self
            .core_idx_to_effective_grid(operand, last_core)
            .unwrap_or(Grid::with_batch(0, 0, 0));
        grid.fcd += 1;
        grid.spatial += 1;
        grid.batch += 1;
        grid
    }

    pub fn is_port_shared_between_cores(&self, operand: Operand) -> bool {
        let is_gemm = matches!(self.params.kind, OpKind::Gemm | OpKind::BatchGemm);
        if is_gemm && self.mme_concurrency() > 1 {
            return false;
        }
        let fully_broadcasted =
            || self.core_grid.batch > 1 && self.params.is_operand_fully_broadcasted(operand);
        match operand {
            Operand::A => self.core_grid.fcd > 1 || fully_broadcasted(),
            Operand::B => self.core_grid.spatial > 1 || fully_broadcasted(),
            Operand::C => false,
        }
    }

    /// Returns `true` if consecutive spatial rows of `operand` are spread over the MMEs.
    pub fn is_spatially_interleaved_across_mmes(&self, operand: Operand) -> bool {
        if self.params.kind.is_native_dma() {
            return false;
        }
        match operand {
            Operand::A => true,
            Operand::B => !self.params.transpose_b,
            Operand::C => self.params.transpose_a,
        }
    }

    /// Returns `true` if consecutive spatial rows of `operand` are spread over every port of
    /// an MME.
    pub fn is_spatially_interleaved_across_cores(&self, operand: Operand) -> bool {
        match operand {
            Operand::A | Operand::B => self.is_spatially_interleaved_inside_core(operand),
            Operand::C => self.output_rows_follow_input_ports(),
        }
    }

    /// Returns `true` if consecutive spatial rows of `operand` are spread over the ports of a
    /// single core.
    pub fn is_spatially_interleaved_inside_core(&self, operand: Operand) -> bool {
        match operand {
            Operand::A => self.params.kind != OpKind::Transpose,
            Operand::B => !self.params.transpose_b,
            // A core with a single spatial C port counts as interleaved.
            Operand::C => self.cores_per_mme() > 1 || self.output_rows_follow_input_ports(),
        }
    }

    fn output_rows_follow_input_ports(&self) -> bool {
        let kind = self.params.kind;
        (self.params.transpose_a && kind != OpKind::Transpose) || kind == OpKind::Memcpy
    }

    /// The number of MMEs along the spatial axis of `operand`.
    ///
    /// C follows the MME grid. A and B move along the common dim unless transposed, and the
    /// MME grid never splits the common dim.
    pub fn spatial_mme_nr(&self, operand: Operand) -> u32 {
        match operand {
            Operand::A if self.is_transposed(operand) => self.mme_grid.spatial,
            Operand::B if self.is_transposed(operand) => self.mme_grid.fcd,
            Operand::A | Operand::B => 1,
            Operand::C => self.mme_grid.spatial,
        }
    }

    /// The number of spatial ports of `operand` inside one MME that rows are interleaved over.
    pub fn mme_interleaved_spatial_ports_nr(&self, operand: Operand) -> u32 {
        if self.is_spatially_interleaved_across_cores(operand) {
            self.mme_spatial_ports(operand)
        } else if self.is_spatially_interleaved_inside_core(operand) {
            self.core_spatial_ports(operand)
        } else {
            1
        }
    }

    /// The number of spatial ports of `operand` on the whole chip that rows are interleaved
    /// over.
    pub fn interleaved_spatial_ports_nr(&self, operand: Operand) -> u32 {
        if self.is_spatially_interleaved_across_mmes(operand) {
            self.mme_spatial_ports(operand) * self.spatial_mme_nr(operand)
        } else {
            self.mme_interleaved_spatial_ports_nr(operand)
        }
    }

    pub fn core_fcd_ports(&self, operand: Operand) -> u32 {
        self.grid(operand).fcd
    }

    pub fn core_spatial_ports(&self, operand: Operand) -> u32 {
        self.grid(operand).spatial
    }

    pub fn core_batch_ports(&self, operand: Operand) -> u32 {
        self.grid(operand).batch
    }

    pub fn core_ports_nr(&self, operand: Operand) -> u32 {
        self.grid(operand).volume()
    }

    pub fn mme_fcd_ports(&self, operand: Operand) -> u32 {
        self.core_fcd_ports(operand) * self.effective_core_grid(operand).fcd
    }

    pub fn mme_spatial_ports(&self, operand: Operand) -> u32 {
        self.core_spatial_ports(operand) * self.effective_core_grid(operand).spatial
    }

    pub fn mme_batch_ports(&self, operand: Operand) -> u32 {
        self.core_batch_ports(operand) * self.effective_core_grid(operand).batch
    }

    pub fn mme_ports_nr(&self, operand: Operand) -> u32 {
        self.mme_fcd_ports(operand) * self.mme_spatial_ports(operand) * self.mme_batch_ports(operand)
    }

    pub fn chip_fcd_ports(&self, operand: Operand) -> u32 {
        self.mme_fcd_ports(operand) * self.mme_grid.fcd
    }

    pub fn chip_spatial_ports(&self, operand: Operand) -> u32 {
        self.mme_spatial_ports(operand) * self.mme_grid.spatial
    }

    pub fn chip_batch_ports(&self, operand: Operand) -> u32 {
        self.mme_batch_ports(operand) * self.mme_grid.batch
    }

    pub fn chip_ports_nr(&self, operand: Operand) -> u32 {
        self.chip_fcd_ports(operand)
            * self.chip_spatial_ports(operand)
            * self.chip_batch_ports(operand)
    }
}

impl<C: Chip> Display for GeoAttr<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mme {} core {} a {} b {} c {}",
            self.mme_grid, self.core_grid, self.a_grid, self.b_grid, self.c_grid
        )
    }
}

impl Display for ConcurrencyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConcurrencyPolicy::None => write!(f, "none"),
            ConcurrencyPolicy::Batch => write!(f, "batch"),
            ConcurrencyPolicy::Dedw => write!(f, "dedw"),
            ConcurrencyPolicy::CommonDim => write!(f, "cd"),
        }
    }
}
