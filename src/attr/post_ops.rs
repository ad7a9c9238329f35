//! Post-operations fused after the matrix multiplication.

use serde::{Deserialize, Serialize};

use crate::error::ForgeResult;
use crate::invalid_args;

/// Maximum number of entries a post-op list can hold
///
/// The matmul validator accepts at most two of them; longer lists exist so
/// that the rejection is observable.
pub const POST_OPS_CAPACITY: usize = 4;

/// Elementwise algorithm kinds
///
/// Discriminants are the ids emitted as `ELTWISE_<NAME>` kernel definitions;
/// 0 is reserved for "undefined".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EltwiseAlg {
    Relu = 1,
    Tanh = 2,
    Elu = 3,
    Square = 4,
    Abs = 5,
    Sqrt = 6,
    Linear = 7,
    BoundedRelu = 8,
    SoftRelu = 9,
    Logistic = 10,
    Exp = 11,
    GeluTanh = 12,
    Swish = 13,
    Log = 14,
    Clip = 15,
}

impl EltwiseAlg {
    pub const ALL: [EltwiseAlg; 15] = [
        EltwiseAlg::Relu,
        EltwiseAlg::Tanh,
        EltwiseAlg::Elu,
        EltwiseAlg::Square,
        EltwiseAlg::Abs,
        EltwiseAlg::Sqrt,
        EltwiseAlg::Linear,
        EltwiseAlg::BoundedRelu,
        EltwiseAlg::SoftRelu,
        EltwiseAlg::Logistic,
        EltwiseAlg::Exp,
        EltwiseAlg::GeluTanh,
        EltwiseAlg::Swish,
        EltwiseAlg::Log,
        EltwiseAlg::Clip,
    ];

    /// Kernel definition id (never 0)
    pub fn id(&self) -> i64 {
        *self as i64
    }

    pub fn from_id(id: i64) -> Option<Self> {
        EltwiseAlg::ALL.into_iter().find(|alg| alg.id() == id)
    }

    /// Name used in the `ELTWISE_<NAME>` definition
    pub fn macro_name(&self) -> &'static str {
        match self {
            EltwiseAlg::Relu => "RELU",
            EltwiseAlg::Tanh => "TANH",
            EltwiseAlg::Elu => "ELU",
            EltwiseAlg::Square => "SQUARE",
            EltwiseAlg::Abs => "ABS",
            EltwiseAlg::Sqrt => "SQRT",
            EltwiseAlg::Linear => "LINEAR",
            EltwiseAlg::BoundedRelu => "BOUNDED_RELU",
            EltwiseAlg::SoftRelu => "SOFT_RELU",
            EltwiseAlg::Logistic => "LOGISTIC",
            EltwiseAlg::Exp => "EXP",
            EltwiseAlg::GeluTanh => "GELU_TANH",
            EltwiseAlg::Swish => "SWISH",
            EltwiseAlg::Log => "LOG",
            EltwiseAlg::Clip => "CLIP",
        }
    }

    /// Forward evaluation `f(x; alpha, beta)` without the post-op scale
    pub fn forward(&self, x: f32, alpha: f32, beta: f32) -> f32 {
        let logistic = |v: f32| 1.0 / (1.0 + (-v).exp());
        match self {
            EltwiseAlg::Relu => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            EltwiseAlg::Tanh => x.tanh(),
            EltwiseAlg::Elu => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x.exp_m1()
                }
            }
            EltwiseAlg::Square => x * x,
            EltwiseAlg::Abs => x.abs(),
            EltwiseAlg::Sqrt => x.sqrt(),
            EltwiseAlg::Linear => alpha * x + beta,
            EltwiseAlg::BoundedRelu => x.max(0.0).min(alpha),
            EltwiseAlg::SoftRelu => x.exp().ln_1p(),
            EltwiseAlg::Logistic => logistic(x),
            EltwiseAlg::Exp => x.exp(),
            EltwiseAlg::GeluTanh => {
                const SQRT_2_OVER_PI: f32 = 0.797_884_6;
                const FITTING_CONST: f32 = 0.044_715;
                let inner = SQRT_2_OVER_PI * x * (1.0 + FITTING_CONST * x * x);
                0.5 * x * (1.0 + inner.tanh())
            }
            EltwiseAlg::Swish => x * logistic(alpha * x),
            EltwiseAlg::Log => x.ln(),
            EltwiseAlg::Clip => x.max(alpha).min(beta),
        }
    }
}

/// Kind tag of a post-op entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOpKind {
    Sum,
    Eltwise,
}

/// One fused post-operation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PostOp {
    /// `dst = result + scale * dst_prev`
    Sum { scale: f32 },
    /// `dst = scale * alg(result; alpha, beta)`
    Eltwise {
        alg: EltwiseAlg,
        alpha: f32,
        beta: f32,
        scale: f32,
    },
}

impl PostOp {
    pub fn kind(&self) -> PostOpKind {
        match self {
            PostOp::Sum { .. } => PostOpKind::Sum,
            PostOp::Eltwise { .. } => PostOpKind::Eltwise,
        }
    }
}

/// Ordered list of post-operations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostOps {
    entries: Vec<PostOp>,
}

impl PostOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_sum(&mut self, scale: f32) -> ForgeResult<()> {
        self.push(PostOp::Sum { scale })
    }

    pub fn append_eltwise(
        &mut self,
        scale: f32,
        alg: EltwiseAlg,
        alpha: f32,
        beta: f32,
    ) -> ForgeResult<()> {
        self.push(PostOp::Eltwise {
            alg,
            alpha,
            beta,
            scale,
        })
    }

    fn push(&mut self, entry: PostOp) -> ForgeResult<()> {
        if self.entries.len() >= POST_OPS_CAPACITY {
            return Err(invalid_args!(
                "post-op list is full ({} entries)",
                POST_OPS_CAPACITY
            ));
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PostOp] {
        &self.entries
    }

    pub fn entry(&self, index: usize) -> Option<&PostOp> {
        self.entries.get(index)
    }

    /// True if an entry of `kind` sits exactly at `position`
    pub fn contain(&self, kind: PostOpKind, position: usize) -> bool {
        self.entries
            .get(position)
            .map(|entry| entry.kind() == kind)
            .unwrap_or(false)
    }

    /// Index of the first entry of `kind`
    pub fn find(&self, kind: PostOpKind) -> Option<usize> {
        self.entries.iter().position(|entry| entry.kind() == kind)
    }

    pub fn has_default_values(&self) -> bool {
        self.entries.is_empty()
    }
}
