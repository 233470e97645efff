#![deny(dead_code)]
#![deny(unused_imports)]

pub mod analysis;
pub mod chords;
pub mod config;
pub mod crossval;
pub mod data;
pub mod dataset;
pub mod error;
pub mod estimate;
pub mod evaluate;
pub mod linalg;
pub mod normalize;
pub mod optimize;
pub mod predict;
pub mod prior;
pub mod report;
