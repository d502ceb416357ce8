pub mod collaborators;
pub mod config;
pub mod daemon;
pub mod http_api;
pub mod redirect;
pub mod supervisor;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;
