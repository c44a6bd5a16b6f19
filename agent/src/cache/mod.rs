pub mod fetch;
pub mod media;
pub mod naming;
