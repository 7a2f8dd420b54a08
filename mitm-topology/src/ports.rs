//! Per-run proxy port allocation.

use std::collections::HashSet;

use rand::Rng;

use crate::error::TopologyError;

pub const PORT_BAND_START: u16 = 20000;
pub const PORT_BAND_END: u16 = 60000;

// Draws before giving up on a crowded band.
const MAX_DRAWS: usize = 1024;

/// Issues unique ports from the ephemeral band for one run. The allocator
/// owns its issued-port set so UDP and TCP phases sharing it can never
/// collide; it is scoped to a single run, never a process-wide singleton.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    issued: HashSet<u16>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::with_band(PORT_BAND_START, PORT_BAND_END)
    }

    pub fn with_band(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            issued: HashSet::new(),
        }
    }

    pub fn allocate(&mut self) -> Result<u16, TopologyError> {
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_DRAWS {
            let port = rng.gen_range(self.start..=self.end);
            if self.issued.insert(port) {
                return Ok(port);
            }
        }
        Err(TopologyError::PortExhausted)
    }

    pub fn issued(&self) -> &HashSet<u16> {
        &self.issued
    }
}
