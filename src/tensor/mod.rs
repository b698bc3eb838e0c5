pub(crate) mod table;

use std::sync::atomic::{AtomicI64, Ordering};

use crate::{context::Context, tensor_op::util::layout::row_major_strides};

pub use table::{TensorHandle, TensorTable};

pub type TensorUid = i64;

static TENSOR_UID_COUNTER: AtomicI64 = AtomicI64::new(1);

pub(crate) fn next_uid() -> TensorUid {
    TENSOR_UID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    NotSet,
    Float,
    Double,
    Half,
    BFloat16,
    Int8,
    Uint8,
    Int32,
    Int64,
    Boolean,
}

impl DataType {
    pub fn is_set(&self) -> bool {
        *self != DataType::NotSet
    }

    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::NotSet => 0,
            DataType::Boolean | DataType::Int8 | DataType::Uint8 => 1,
            DataType::Half | DataType::BFloat16 => 2,
            DataType::Float | DataType::Int32 => 4,
            DataType::Double | DataType::Int64 => 8,
        }
    }
}

impl Default for DataType {
    fn default() -> Self {
        DataType::NotSet
    }
}

/// Where the storage behind a tensor comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorKind {
    /// Backed by a buffer the caller binds at execution time.
    External,
    /// Only connects two primitives; the backend may fuse it away.
    Virtual,
    /// Supplied by the engine itself, either as an immediate scalar or as a
    /// buffer carved out of the caller's workspace.
    PassByValue,
}

/// Descriptor of a single tensor slot in the graph.
///
/// Shapes and strides start out optional (empty) and are resolved in place by
/// the expansion pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorAttributes {
    name: String,
    uid: Option<TensorUid>,
    dims: Vec<usize>,
    strides: Vec<usize>,
    data_type: DataType,
    kind: TensorKind,
}

impl Default for TensorAttributes {
    fn default() -> Self {
        TensorAttributes {
            name: String::new(),
            uid: None,
            dims: Vec::new(),
            strides: Vec::new(),
            data_type: DataType::NotSet,
            kind: TensorKind::External,
        }
    }
}

impl TensorAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn virtual_tensor(name: impl Into<String>) -> Self {
        TensorAttributes::new()
            .with_name(name)
            .with_kind(TensorKind::Virtual)
    }

    /// A broadcast `{1, 1, 1, 1}` scalar whose value the engine fills in.
    pub(crate) fn scalar_constant(name: impl Into<String>, data_type: DataType) -> Self {
        TensorAttributes::new()
            .with_name(name)
            .with_dim(vec![1, 1, 1, 1])
            .with_stride(vec![1, 1, 1, 1])
            .with_data_type(data_type)
            .with_kind(TensorKind::PassByValue)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_uid(mut self, uid: TensorUid) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn with_dim(mut self, dims: Vec<usize>) -> Self {
        self.dims = dims;
        self
    }

    pub fn with_stride(mut self, strides: Vec<usize>) -> Self {
        self.strides = strides;
        self
    }

    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn with_kind(mut self, kind: TensorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uid(&self) -> Option<TensorUid> {
        self.uid
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn kind(&self) -> TensorKind {
        self.kind
    }

    pub fn is_virtual(&self) -> bool {
        self.kind == TensorKind::Virtual
    }

    pub fn is_pass_by_value(&self) -> bool {
        self.kind == TensorKind::PassByValue
    }

    pub fn set_dim(&mut self, dims: Vec<usize>) -> &mut Self {
        self.dims = dims;
        self
    }

    pub fn set_stride(&mut self, strides: Vec<usize>) -> &mut Self {
        self.strides = strides;
        self
    }

    pub fn set_data_type(&mut self, data_type: DataType) -> &mut Self {
        self.data_type = data_type;
        self
    }

    pub fn set_kind(&mut self, kind: TensorKind) -> &mut Self {
        self.kind = kind;
        self
    }

    pub(crate) fn assign_uid(&mut self) {
        if self.uid.is_none() {
            self.uid = Some(next_uid());
        }
    }

    pub fn volume(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.volume() * self.data_type.size_in_bytes()
    }

    pub fn has_unit_inner_stride(&self) -> bool {
        self.strides.last() == Some(&1)
    }

    /// Shape, stride and data type are all resolved.
    pub fn is_fully_specified(&self) -> bool {
        !self.dims.is_empty() && self.strides.len() == self.dims.len() && self.data_type.is_set()
    }

    /// Virtual tensors default to the intermediate type, everything else to the io type.
    pub(crate) fn fill_from_context(&mut self, context: &Context) {
        if !self.data_type.is_set() {
            self.data_type = if self.is_virtual() {
                context.intermediate_data_type()
            } else {
                context.io_data_type()
            };
        }
    }

    /// Fill a packed row-major stride when only the shape is known.
    pub(crate) fn fill_row_major_stride(&mut self) {
        if self.strides.is_empty() && !self.dims.is_empty() {
            self.strides = row_major_strides(&self.dims);
        }
    }

    /// Swap the two innermost dimensions of both shape and stride in place.
    pub(crate) fn transpose_last_two(&mut self) {
        let rank = self.dims.len();
        if rank >= 2 {
            self.dims.swap(rank - 2, rank - 1);
        }
        let rank = self.strides.len();
        if rank >= 2 {
            self.strides.swap(rank - 2, rank - 1);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fill_from_context_respects_kind() {
        let context = Context::default()
            .set_intermediate_data_type(DataType::Float)
            .set_io_data_type(DataType::Half);
        let mut virtual_tensor = TensorAttributes::virtual_tensor("s");
        virtual_tensor.fill_from_context(&context);
        assert_eq!(virtual_tensor.data_type(), DataType::Float);

        let mut external = TensorAttributes::new().with_name("o");
        external.fill_from_context(&context);
        assert_eq!(external.data_type(), DataType::Half);

        let mut explicit = TensorAttributes::virtual_tensor("idx").with_data_type(DataType::Int32);
        explicit.fill_from_context(&context);
        assert_eq!(explicit.data_type(), DataType::Int32);
    }

    #[test]
    fn transpose_swaps_inner_dimensions() {
        let mut k = TensorAttributes::new()
            .with_dim(vec![2, 4, 128, 64])
            .with_stride(vec![32768, 8192, 64, 1]);
        k.transpose_last_two();
        assert_eq!(k.dims(), &[2, 4, 64, 128]);
        assert_eq!(k.strides(), &[32768, 8192, 1, 64]);
    }

    #[test]
    fn byte_size_follows_data_type() {
        let t = TensorAttributes::new()
            .with_dim(vec![1, 8, 1, 1])
            .with_data_type(DataType::Float);
        assert_eq!(t.size_in_bytes(), 32);
        assert!(!t.is_fully_specified());
    }
}
