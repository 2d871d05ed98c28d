pub mod builder;
pub mod matrix;

pub use builder::{GraphBuilder, JobGraph, JobInstance};
pub use matrix::{MatrixAxis, MatrixCoordinate};
