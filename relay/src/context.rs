//! Handles shared by the chat flow, dispatch ticks, and the poll loop.

use crate::io::backend::Backends;
use crate::io::config::RelayConfig;
use crate::io::init::RelayPaths;

#[derive(Clone, Copy)]
pub struct RelayContext<'a> {
    pub paths: &'a RelayPaths,
    pub config: &'a RelayConfig,
    pub backends: &'a Backends,
}

impl<'a> RelayContext<'a> {
    pub fn new(paths: &'a RelayPaths, config: &'a RelayConfig, backends: &'a Backends) -> Self {
        Self {
            paths,
            config,
            backends,
        }
    }
}
