//! Positional argument layout of the `ref_matmul` kernel.
//!
//! The dispatcher sets arguments at these indices and the kernel reads them
//! back from the same indices.

pub const SRC: usize = 0;
pub const WEI: usize = 1;
pub const BIA: usize = 2;
pub const DST: usize = 3;

/// Source zero-point buffer
pub const A0: usize = 4;
/// Weights zero-point buffer
pub const B0: usize = 5;
/// Destination zero-point buffer
pub const C0: usize = 6;

pub const SCALES: usize = 7;
pub const SCALE_STRIDE: usize = 8;

pub const K: usize = 9;
pub const N: usize = 10;
pub const M: usize = 11;
pub const D0: usize = 12;

pub const SRC_STRIDE_D0: usize = 13;
pub const SRC_STRIDE_M: usize = 14;
pub const SRC_STRIDE_K: usize = 15;

pub const WEI_STRIDE_D0: usize = 16;
pub const WEI_STRIDE_K: usize = 17;
pub const WEI_STRIDE_N: usize = 18;

pub const BIA_STRIDE_D0: usize = 19;
pub const BIA_STRIDE_M: usize = 20;
pub const BIA_STRIDE_N: usize = 21;

pub const DST_STRIDE_D0: usize = 22;
pub const DST_STRIDE_M: usize = 23;
pub const DST_STRIDE_N: usize = 24;

pub const ELTWISE_ALPHA: usize = 25;
pub const ELTWISE_BETA: usize = 26;
pub const ELTWISE_SCALE: usize = 27;
pub const SUM_SCALE: usize = 28;

/// Total number of kernel arguments
pub const ARG_COUNT: usize = 29;
