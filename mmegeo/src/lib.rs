pub mod common;
pub mod geoattr;
pub mod grid;
pub mod params;
pub mod plan;
pub mod pprint;
pub mod target;
pub mod utils;
