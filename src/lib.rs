pub mod cli;
pub mod colors;
pub mod config;
pub mod digest;
pub mod error;
pub mod fetch;
pub mod hooks;
pub mod installer;
pub mod integrity;
pub mod lockfile;
pub mod pkgmap;
pub mod reclaim;
pub mod store;
pub mod tree;
pub mod unpack;
#[cfg(test)]
pub mod tests;
