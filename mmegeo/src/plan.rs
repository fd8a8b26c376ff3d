use serde::{Deserialize, Serialize};
use std::io;

use crate::common::Operand;
use crate::geoattr::{ConcurrencyPolicy, GeoAttr};
use crate::grid::Grid;
use crate::params::{Geometry, OpKind};
use crate::target::{Chip, ChipId};

/// A snapshot of every grid and derived size of a [GeoAttr].
///
/// Unlike a [GeoAttr], a plan owns its data and can be persisted and reloaded without the
/// descriptor or capability profile it was computed from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PartitionPlan {
    pub chip: ChipId,
    pub kind: OpKind,
    pub geometry: Geometry,
    pub mme_grid: Grid,
    pub core_grid: Grid,
    pub a_grid: Grid,
    pub b_grid: Grid,
    pub c_grid: Grid,
    pub acc_height: u32,
    pub eu_width: u32,
    pub eu_height: u32,
    pub mme_width: u32,
    pub mme_height: u32,
    pub a_port_size: u32,
    /// `None` for native DMA, which has no B operand.
    pub b_port_size: Option<u32>,
    pub c_port_size: u32,
    pub te_height: u32,
    pub bgemm_bit: bool,
    pub non_share_a_bit: bool,
    pub double_accums_bit: bool,
    pub policy: ConcurrencyPolicy,
}

impl PartitionPlan {
    pub fn save<W: io::Write>(&self, writer: W) -> Result<(), bincode::Error> {
        bincode::serialize_into(writer, self)
    }

    pub fn load<R: io::Read>(reader: R) -> Result<Self, bincode::Error> {
        bincode::deserialize_from(reader)
    }

    pub fn grid(&self, operand: Operand) -> Grid {
        match operand {
            Operand::A => self.a_grid,
            Operand::B => self.b_grid,
            Operand::C => self.c_grid,
        }
    }

    pub fn port_size(&self, operand: Operand) -> Option<u32> {
        match operand {
            Operand::A => Some(self.a_port_size),
            Operand::B => self.b_port_size,
            Operand::C => Some(self.c_port_size),
        }
    }

    /// The number of gemms the whole geometry works on concurrently.
    pub fn geometry_concurrency(&self) -> u32 {
        self.mme_grid.batch * self.a_grid.batch.max(self.b_grid.batch) * self.core_grid.batch
    }
}

impl<C: Chip> GeoAttr<'_, C> {
    pub fn plan(&self) -> PartitionPlan {
        let params = self.params();
        PartitionPlan {
            chip: C::chip_id(),
            kind: params.kind,
            geometry: params.strategy.geometry,
            mme_grid: self.mme_grid(),
            core_grid: self.core_grid(),
            a_grid: self.a_grid(),
            b_grid: self.b_grid(),
            c_grid: self.c_grid(),
            acc_height: self.acc_height(),
            eu_width: self.eu_width(),
            eu_height: self.eu_height(),
            mme_width: self.mme_width(),
            mme_height: self.mme_height(),
            a_port_size: self.port_size(Operand::A),
            b_port_size: (!params.kind.is_native_dma()).then(|| self.port_size(Operand::B)),
            c_port_size: self.port_size(Operand::C),
            te_height: self.te_height(),
            bgemm_bit: self.bgemm_bit(),
            non_share_a_bit: self.non_share_a_bit(),
            double_accums_bit: self.double_accums_bit(),
            policy: self.policy(),
        }
    }
}

impl<'a, C: Chip> From<&GeoAttr<'a, C>> for PartitionPlan {
    fn from(geo: &GeoAttr<'a, C>) -> Self {
        geo.plan()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DataType;
    use crate::params::{LayerParams, MmeStrategy};
    use crate::target::{Gaudi2, Gaudi2Hal, Gaudi3, Gaudi3Hal};

    #[test]
    fn test_plan_survives_save_and_load() {
        let hal = Gaudi3Hal::default();
        let params = LayerParams::batch_gemm(DataType::Bf16, 64, 64, 64, [4, 1, 1], [1, 1, 1])
            .with_strategy(MmeStrategy::new(Geometry::High2x, 1));
        let plan = GeoAttr::<Gaudi3>::new(&params, &hal).unwrap().plan();

        let mut buf = Vec::new();
        plan.save(&mut buf).unwrap();
        let loaded = PartitionPlan::load(buf.as_slice()).unwrap();
        assert_eq!(plan, loaded);
        assert_eq!(loaded.policy, ConcurrencyPolicy::Batch);
        assert!(loaded.non_share_a_bit);
    }

    #[test]
    fn test_load_rejects_truncated_input() {
        let hal = Gaudi2Hal::default();
        let params = LayerParams::gemm(DataType::Bf16, 512, 512, 512)
            .with_strategy(MmeStrategy::new(Geometry::High4x, 2));
        let plan = PartitionPlan::from(&GeoAttr::<Gaudi2>::new(&params, &hal).unwrap());

        let mut buf = Vec::new();
        plan.save(&mut buf).unwrap();
        buf.truncate(buf.len() / 2);
        assert!(PartitionPlan::load(buf.as_slice()).is_err());
    }

    #[test]
    fn test_dma_plan_has_no_b_port() {
        let hal = Gaudi3Hal::default();
        let params = LayerParams::memcpy(DataType::Bf16, 1024, 1024)
            .with_strategy(MmeStrategy::new(Geometry::Wide4x, 8));
        let plan = GeoAttr::<Gaudi3>::new(&params, &hal).unwrap().plan();
        assert_eq!(plan.port_size(Operand::B), None);
        assert_eq!(plan.port_size(Operand::C), Some(128));
        assert_eq!(plan.grid(Operand::B), Grid::default());
    }

    #[test]
    fn test_plan_concurrency_matches_engine() {
        let hal = Gaudi2Hal::default();
        let params = LayerParams::batch_gemm(DataType::Bf16, 64, 64, 64, [8, 1, 1], [8, 1, 1])
            .with_strategy(MmeStrategy::new(Geometry::High2x, 2));
        let geo = GeoAttr::<Gaudi2>::new(&params, &hal).unwrap();
        assert_eq!(geo.plan().geometry_concurrency(), geo.geometry_concurrency());
    }
}
