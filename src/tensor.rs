//! Tensor representation and the MetadataEnvelope wire format (§6).
//!
//! Real accelerator tensors are out of scope for this crate (see spec §1's
//! out-of-scope list: model definition, autograd, the optimizer). What lives
//! here is the *shape of the wire contract* the Transport negotiates: a
//! dtype code table pinned at project version 1, and an owned tensor type
//! carrying exactly the attributes the protocol cares about.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Instruction tags, used only to report [`PipelineError::UnknownInstruction`](crate::error::PipelineError::UnknownInstruction).
///
/// [`Instruction`] dispatch in [`crate::pipeline::Pipeline`] is an exhaustive
/// match over a closed Rust enum, so this variant is unreachable through
/// normal use — the handler set cannot silently drift out of sync with the
/// instruction set the way a dynamic-dispatch table could. It exists so the
/// error taxonomy in spec §7 has a concrete type even though Rust's
/// exhaustiveness checking already prevents the failure mode it describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionKind {
    LoadMicrobatch,
    Forward,
    Backward,
    SendActivation,
    RecvActivation,
    SendGradient,
    RecvGradient,
    OptimizerStep,
}

/// Stable dtype -> integer code table (§6). Pinned at project version 1;
/// changing these values is a breaking change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
    I8,
    I16,
    I32,
    I64,
    Bool,
    U8,
}

impl DType {
    /// Encode to the wire's stable integer code.
    pub const fn code(self) -> i64 {
        match self {
            DType::F16 => 0,
            DType::BF16 => 1,
            DType::F32 => 2,
            DType::F64 => 3,
            DType::I8 => 4,
            DType::I16 => 5,
            DType::I32 => 6,
            DType::I64 => 7,
            DType::Bool => 8,
            DType::U8 => 9,
        }
    }

    /// Decode from the wire's stable integer code.
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => DType::F16,
            1 => DType::BF16,
            2 => DType::F32,
            3 => DType::F64,
            4 => DType::I8,
            5 => DType::I16,
            6 => DType::I32,
            7 => DType::I64,
            8 => DType::Bool,
            9 => DType::U8,
            _ => return None,
        })
    }

    /// True for floating-point dtypes; used by `load_microbatch` to decide
    /// which loaded tensors get `requires_grad` set (spec §4.3).
    pub const fn is_floating_point(self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }
}

/// An owned tensor payload as it flows through this crate.
///
/// `data` is a flat row-major buffer; this crate never interprets its
/// contents (that is the out-of-scope model/autograd engine's job), only
/// its shape/dtype/requires_grad envelope. Backed by [`Bytes`] rather than
/// `Vec<u8>` so cloning a persistent receive buffer into a microbatch's
/// `inputs` slot (spec §4.2 "Buffer reuse") is a refcount bump, not a copy —
/// the same reason the teacher's wire payloads (`protocol.rs`) are `Bytes`.
#[derive(Debug, Clone)]
pub struct OwnedTensor {
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub requires_grad: bool,
    pub data: Bytes,
}

impl OwnedTensor {
    pub fn new(shape: Vec<usize>, dtype: DType, requires_grad: bool, data: impl Into<Bytes>) -> Self {
        Self {
            shape,
            dtype,
            requires_grad,
            data: data.into(),
        }
    }

    /// Number of elements implied by `shape`.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Allocate a zeroed tensor with the given shape/dtype, used by the
    /// receiving side of metadata negotiation (spec §4.2) once it has
    /// learned the sender's layout.
    pub fn zeros_like(shape: Vec<usize>, dtype: DType, requires_grad: bool) -> Self {
        let elem_size = element_size(dtype);
        let numel: usize = shape.iter().product();
        Self {
            shape,
            dtype,
            requires_grad,
            data: Bytes::from(vec![0u8; numel * elem_size]),
        }
    }
}

const fn element_size(dtype: DType) -> usize {
    match dtype {
        DType::F16 | DType::BF16 | DType::I16 => 2,
        DType::F32 | DType::I32 => 4,
        DType::F64 | DType::I64 => 8,
        DType::I8 | DType::Bool | DType::U8 => 1,
    }
}

/// Per-tensor layout description, one entry of a [`MetadataEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorMeta {
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub requires_grad: bool,
}

impl TensorMeta {
    pub fn of(tensor: &OwnedTensor) -> Self {
        Self {
            dtype: tensor.dtype,
            shape: tensor.shape.clone(),
            requires_grad: tensor.requires_grad,
        }
    }

    pub fn matches(&self, tensor: &OwnedTensor) -> bool {
        self.dtype == tensor.dtype
            && self.shape == tensor.shape
            && self.requires_grad == tensor.requires_grad
    }
}

/// The header a stage sends once per output tuple slot (spec §3, §4.2, §6).
///
/// Wire format: a `[num_tensors]` rank-1 integer message, then per tensor
/// four rank-1 integer messages: `[ndims]`, `[dtype_code]`,
/// `[dim_0, …, dim_{ndims-1}]`, `[requires_grad ∈ {0,1}]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEnvelope {
    pub tensors: Vec<TensorMeta>,
}

impl MetadataEnvelope {
    pub fn describing(tensors: &[OwnedTensor]) -> Self {
        Self {
            tensors: tensors.iter().map(TensorMeta::of).collect(),
        }
    }

    /// Encode as the sequence of rank-1 integer messages described above.
    /// Each returned `Vec<i64>` is one wire message in order.
    pub fn to_wire_messages(&self) -> Vec<Vec<i64>> {
        let mut messages = Vec::with_capacity(1 + 4 * self.tensors.len());
        messages.push(vec![self.tensors.len() as i64]);
        for t in &self.tensors {
            messages.push(vec![t.shape.len() as i64]);
            messages.push(vec![t.dtype.code()]);
            messages.push(t.shape.iter().map(|&d| d as i64).collect());
            messages.push(vec![if t.requires_grad { 1 } else { 0 }]);
        }
        messages
    }

    /// Decode from the flattened sequence of wire messages produced by
    /// [`Self::to_wire_messages`].
    pub fn from_wire_messages(mut messages: std::collections::VecDeque<Vec<i64>>) -> Option<Self> {
        let num_tensors = *messages.pop_front()?.first()? as usize;
        let mut tensors = Vec::with_capacity(num_tensors);
        for _ in 0..num_tensors {
            let ndims = *messages.pop_front()?.first()? as usize;
            let dtype_code = *messages.pop_front()?.first()?;
            let dtype = DType::from_code(dtype_code)?;
            let dims = messages.pop_front()?;
            if dims.len() != ndims {
                return None;
            }
            let shape = dims.into_iter().map(|d| d as usize).collect();
            let requires_grad = *messages.pop_front()?.first()? != 0;
            tensors.push(TensorMeta {
                dtype,
                shape,
                requires_grad,
            });
        }
        Some(Self { tensors })
    }
}
