//! Memory/compute trade-offs threaded through every stack.
//!
//! None of these settings changes the numbers a forward pass produces.
use crate::config::GlobalsConfig;
use candle_core::{Device, Result, Tensor};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecutionMode {
    /// Write block outputs into preallocated tensors instead of collecting and stacking.
    pub inplace_safe: bool,
    /// Park large stack inputs in host memory between sub-stages.
    pub offload_inference: bool,
    /// Process attention rows this many at a time.
    pub chunk_size: Option<usize>,
    /// Key-chunked attention with a running log-sum-exp.
    pub use_lma: bool,
    /// Number of blocks run per checkpoint group. Groups only scope tracing spans; candle
    /// keeps every activation, so peak memory is unchanged.
    pub blocks_per_ckpt: Option<usize>,
}

impl ExecutionMode {
    pub fn from_globals(g: &GlobalsConfig) -> Self {
        Self {
            inplace_safe: g.inplace_safe,
            offload_inference: g.offload_inference,
            chunk_size: g.chunk_size,
            use_lma: g.use_lma,
            blocks_per_ckpt: g.blocks_per_ckpt,
        }
    }

    /// Moves `t` to the host when offloading is on.
    pub fn offload(&self, t: &Tensor) -> Result<Tensor> {
        if self.offload_inference && !t.device().is_cpu() {
            t.to_device(&Device::Cpu)
        } else {
            Ok(t.clone())
        }
    }

    /// Brings an offloaded tensor back to `device`.
    pub fn restore(&self, t: &Tensor, device: &Device) -> Result<Tensor> {
        if t.device().same_device(device) {
            Ok(t.clone())
        } else {
            t.to_device(device)
        }
    }

    /// Block index ranges, one per checkpoint group.
    ///
    /// Callers open one span per group. No activations are dropped or recomputed, so any
    /// grouping gives the same outputs as running the blocks back to back.
    pub fn block_groups(&self, no_blocks: usize) -> Vec<std::ops::Range<usize>> {
        let per = self.blocks_per_ckpt.unwrap_or(no_blocks).max(1);
        (0..no_blocks)
            .step_by(per)
            .map(|start| start..(start + per).min(no_blocks))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_groups_cover_all_blocks() {
        let mode = ExecutionMode {
            blocks_per_ckpt: Some(3),
            ..ExecutionMode::default()
        };
        assert_eq!(mode.block_groups(7), vec![0..3, 3..6, 6..7]);
        assert_eq!(ExecutionMode::default().block_groups(4), vec![0..4]);
        assert!(ExecutionMode::default().block_groups(0).is_empty());
    }
}
