pub mod geometry;
pub mod pdf;
pub mod placement;
pub mod renderer;
pub mod signature;
pub mod signing;
pub mod storage;
pub mod workspace;
