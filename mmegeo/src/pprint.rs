use crate::common::Operand;
use crate::plan::PartitionPlan;

use itertools::Itertools;
use prettytable::{self, format, row, Cell, Row};
use std::fmt;
use strum::IntoEnumIterator;

/// Pretty-print a [PartitionPlan] to stdout.
pub fn pprint(plan: &PartitionPlan) {
    plan_table(plan).printstd()
}

/// Pretty-print a [PartitionPlan] to a given [fmt::Write].
pub fn pprint_write<W: fmt::Write>(out: &mut W, plan: &PartitionPlan) -> fmt::Result {
    write!(out, "{}", plan_table(plan))
}

pub fn pprint_string(plan: &PartitionPlan) -> String {
    format!("{}", plan_table(plan))
}

/// Pretty-print one summary line per plan to stdout.
pub fn pprint_sweep(plans: &[PartitionPlan]) {
    sweep_table(plans).printstd()
}

pub fn pprint_sweep_string(plans: &[PartitionPlan]) -> String {
    format!("{}", sweep_table(plans))
}

fn plan_table(plan: &PartitionPlan) -> prettytable::Table {
    let mut table = prettytable::Table::new();
    table.set_titles(row!["", "A", "B", "C"]);

    let mut grids = row!["grid"];
    let mut ports = row!["port size"];
    for operand in Operand::iter() {
        grids.add_cell(Cell::new(&plan.grid(operand).to_string()));
        ports.add_cell(Cell::new(&optional(plan.port_size(operand))));
    }
    table.add_row(grids);
    table.add_row(ports);

    table.add_row(Row::empty());
    table.add_row(row!["chip", plan.chip]);
    table.add_row(row!["op", plan.kind]);
    table.add_row(row!["geometry", plan.geometry]);
    table.add_row(row!["policy", plan.policy]);
    table.add_row(row!["mme grid", plan.mme_grid]);
    table.add_row(row!["core grid", plan.core_grid]);
    table.add_row(row![
        "eu",
        format!("{}x{}", plan.eu_width, plan.eu_height)
    ]);
    table.add_row(row![
        "mme",
        format!("{}x{}", plan.mme_width, plan.mme_height)
    ]);
    table.add_row(row!["acc height", plan.acc_height]);
    table.add_row(row!["te height", plan.te_height]);
    table.add_row(row!["bits", control_bits(plan)]);

    table.set_format(compact_format());
    table
}

fn sweep_table(plans: &[PartitionPlan]) -> prettytable::Table {
    let mut table = prettytable::Table::new();
    table.set_titles(row![
        "Geometry", "Policy", "MME", "Core", "A", "B", "C", "MME Size", "Concurrency", "Bits"
    ]);
    for plan in plans {
        table.add_row(row![
            plan.geometry,
            plan.policy,
            plan.mme_grid,
            plan.core_grid,
            plan.a_grid,
            plan.b_grid,
            plan.c_grid,
            format!("{}x{}", plan.mme_width, plan.mme_height),
            plan.geometry_concurrency(),
            control_bits(plan)
        ]);
    }
    table.set_format(compact_format());
    table
}

fn compact_format() -> format::TableFormat {
    format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build()
}

fn control_bits(plan: &PartitionPlan) -> String {
    let bits = [
        ("bgemm", plan.bgemm_bit),
        ("non-share-a", plan.non_share_a_bit),
        ("double-acc", plan.double_accums_bit),
    ]
    .into_iter()
    .filter_map(|(name, set)| set.then_some(name))
    .join(",");
    if bits.is_empty() {
        "-".to_owned()
    } else {
        bits
    }
}

fn optional(value: Option<u32>) -> String {
    value.map_or_else(|| "-".to_owned(), |v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DataType;
    use crate::geoattr::GeoAttr;
    use crate::params::{Geometry, LayerParams, MmeStrategy};
    use crate::target::{Gaudi3, Gaudi3Hal};

    #[test]
    fn test_pprint_shows_grids_and_bits() {
        let hal = Gaudi3Hal::default();
        let params = LayerParams::batch_gemm(DataType::Bf16, 64, 64, 64, [4, 1, 1], [4, 1, 1])
            .with_strategy(MmeStrategy::new(Geometry::High2x, 1));
        let plan = GeoAttr::<Gaudi3>::new(&params, &hal).unwrap().plan();
        let out = pprint_string(&plan);
        assert!(out.contains("1x2x2"), "{out}");
        assert!(out.contains("bgemm"), "{out}");
        assert!(out.contains("batch"), "{out}");
    }

    #[test]
    fn test_pprint_marks_missing_b_port() {
        let hal = Gaudi3Hal::default();
        let params = LayerParams::memcpy(DataType::Bf16, 1024, 1024)
            .with_strategy(MmeStrategy::new(Geometry::Wide4x, 8));
        let plan = GeoAttr::<Gaudi3>::new(&params, &hal).unwrap().plan();
        let mut out = String::new();
        pprint_write(&mut out, &plan).unwrap();
        assert!(out.contains("0x0x1"), "{out}");
        assert!(out.contains("memcpy"), "{out}");
    }

    #[test]
    fn test_sweep_has_a_line_per_plan() {
        let hal = Gaudi3Hal::default();
        let plans = [Geometry::Wide4x, Geometry::High4x].map(|geometry| {
            let params = LayerParams::gemm(DataType::Bf16, 1024, 1024, 1024)
                .with_strategy(MmeStrategy::new(geometry, 8));
            GeoAttr::<Gaudi3>::new(&params, &hal).unwrap().plan()
        });
        let out = pprint_sweep_string(&plans);
        assert!(out.contains("4xw"), "{out}");
        assert!(out.contains("4xh"), "{out}");
        assert!(out.contains("8x1x1"), "{out}");
        assert!(out.contains("1x8x1"), "{out}");
    }
}
