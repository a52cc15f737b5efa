pub mod controller;
pub mod crd;
pub mod fixture;
pub mod util;
