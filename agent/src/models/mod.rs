pub mod device;
pub mod group;
