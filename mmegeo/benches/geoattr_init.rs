use iai_callgrind::{library_benchmark, library_benchmark_group, main, LibraryBenchmarkConfig};
use std::hint::black_box;

use mmegeo::common::DataType;
use mmegeo::geoattr::GeoAttr;
use mmegeo::params::{ConvKind, Geometry, LayerParams, MmeStrategy};
use mmegeo::target::{Gaudi2, Gaudi2Hal, Gaudi3, Gaudi3Hal, MmeHal};
use mmegeo::utils::iter_powers_of_two_u32;

#[export_name = "mmegeo_bench_geoattr_init::bgemm_params"]
fn bgemm_params(size: u32, geometry: Geometry, mme_limit: u32) -> LayerParams {
    LayerParams::batch_gemm(DataType::Bf16, size, size, size, [16, 1, 1], [16, 1, 1])
        .with_strategy(MmeStrategy::new(geometry, mme_limit))
}

#[export_name = "mmegeo_bench_geoattr_init::dedw_params"]
fn dedw_params(size: u32, geometry: Geometry, mme_limit: u32) -> LayerParams {
    LayerParams::conv(ConvKind::Dedw, DataType::Bf16, 4, size, size, 3, 28)
        .with_strategy(MmeStrategy::new(geometry, mme_limit))
}

#[library_benchmark]
fn gaudi3_bgemm_init() {
    let hal = Gaudi3Hal::default();
    let params = bgemm_params(64, Geometry::Wide4x, 8);
    for _ in 0..100 {
        black_box(GeoAttr::<Gaudi3>::new(black_box(&params), &hal).map(|g| g.plan())).ok();
    }
}

#[library_benchmark]
fn gaudi3_dedw_init() {
    let hal = Gaudi3Hal::default();
    let params = dedw_params(256, Geometry::High2x, 8);
    for _ in 0..100 {
        black_box(GeoAttr::<Gaudi3>::new(black_box(&params), &hal).map(|g| g.plan())).ok();
    }
}

#[library_benchmark]
fn gaudi3_gemm_limit_sweep() {
    let hal = Gaudi3Hal::default();
    for mme_limit in iter_powers_of_two_u32(hal.mme_nr()) {
        for geometry in Geometry::SYMMETRIC {
            let params = LayerParams::gemm(DataType::Bf16, 1024, 1024, 1024)
                .with_strategy(MmeStrategy::new(geometry, mme_limit));
            black_box(GeoAttr::<Gaudi3>::new(black_box(&params), &hal).map(|g| g.plan())).ok();
        }
    }
}

#[library_benchmark]
fn gaudi2_bgemm_init() {
    let hal = Gaudi2Hal::default();
    let params = bgemm_params(64, Geometry::High2x, 2);
    for _ in 0..100 {
        black_box(GeoAttr::<Gaudi2>::new(black_box(&params), &hal).map(|g| g.plan())).ok();
    }
}

library_benchmark_group!(
    name = geoattr_init_group;
    benchmarks =
        gaudi3_bgemm_init,
        gaudi3_dedw_init,
        gaudi3_gemm_limit_sweep,
        gaudi2_bgemm_init
);

main!(
    config = LibraryBenchmarkConfig::default()
                .raw_callgrind_args([
                    "toggle-collect=mmegeo_bench_geoattr_init::bgemm_params",
                    "toggle-collect=mmegeo_bench_geoattr_init::dedw_params",
                    "--simulate-wb=no", "--simulate-hwpref=yes",
                    "--I1=32768,8,64", "--D1=32768,8,64", "--LL=8388608,16,64",
                ]);
    library_benchmark_groups = geoattr_init_group
);
