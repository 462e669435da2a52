//! Tensors: dtype + shape + derived strides + shared storage.

use std::sync::Arc;

use crate::device::Device;
use crate::dtype::DataType;
use crate::storage::{Storage, StorageAllocator};

/// A dimension value below zero marks a dynamic axis.
pub const DYNAMIC_DIM: i64 = -1;

/// A tensor view: element type, shape, row-major strides and a shared
/// storage blob. Cloning shares the storage.
#[derive(Clone, Debug)]
pub struct Tensor {
    dtype: DataType,
    shape: Vec<i64>,
    strides: Vec<i64>,
    storage: Option<Storage>,
}

/// Row-major contiguous strides, walking axes from last to first: each
/// stride is the running product of the later dims; once a dynamic dim is
/// seen, every earlier stride is dynamic.
fn contiguous_strides(shape: &[i64]) -> Vec<i64> {
    let mut strides = vec![0i64; shape.len()];
    let mut acc = 1i64;
    let mut dynamic = false;
    for i in (0..shape.len()).rev() {
        strides[i] = if dynamic { DYNAMIC_DIM } else { acc };
        if shape[i] < 0 {
            dynamic = true;
        } else if !dynamic {
            acc *= shape[i];
        }
    }
    strides
}

impl Tensor {
    /// A tensor with no storage yet; storage is materialized lazily at
    /// launch (or resize) time.
    pub fn new(dtype: DataType, shape: Vec<i64>) -> Tensor {
        let strides = contiguous_strides(&shape);
        Tensor { dtype, shape, strides, storage: None }
    }

    pub fn with_storage(dtype: DataType, shape: Vec<i64>, storage: Storage) -> Tensor {
        let strides = contiguous_strides(&shape);
        Tensor { dtype, shape, strides, storage: Some(storage) }
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn strides(&self) -> &[i64] {
        &self.strides
    }

    pub fn storage(&self) -> Option<&Storage> {
        self.storage.as_ref()
    }

    pub fn device(&self) -> Option<Device> {
        self.storage.as_ref().map(|s| s.device())
    }

    /// Product of all dims, or −1 while any axis is dynamic.
    pub fn numel(&self) -> i64 {
        let mut n = 1i64;
        for &dim in &self.shape {
            if dim < 0 {
                return -1;
            }
            n *= dim;
        }
        n
    }

    pub fn has_dynamic_shape(&self) -> bool {
        self.shape.iter().any(|&d| d < 0)
    }

    /// Bytes needed by a static shape; `None` while dynamic.
    pub fn size_bytes(&self) -> Option<usize> {
        let numel = self.numel();
        if numel < 0 {
            None
        } else {
            Some(numel as usize * self.dtype.size_in_bytes())
        }
    }

    pub fn data_ptr(&self) -> *mut u8 {
        match &self.storage {
            Some(s) => s.data_ptr(),
            Option::None => core::ptr::null_mut(),
        }
    }

    /// Replace the shape, recomputing strides.
    pub fn set_shape(&mut self, shape: Vec<i64>) {
        self.strides = contiguous_strides(&shape);
        self.shape = shape;
    }

    pub fn set_dtype(&mut self, dtype: DataType) {
        self.dtype = dtype;
    }

    pub fn set_storage(&mut self, storage: Storage) {
        self.storage = Some(storage);
    }

    /// Share another tensor's storage (the output-aliases-input path).
    pub fn borrow_storage_from(&mut self, other: &Tensor) {
        self.storage = other.storage.clone();
    }

    /// Make sure the storage can hold the current (static) shape, allocating
    /// or re-requesting from `allocator` as needed. Keeps the invariant
    /// `storage.size_bytes() >= numel * dtype.size` for static shapes.
    ///
    /// Returns `false` on pool exhaustion or when called on a dynamic shape.
    pub fn resize_storage(
        &mut self,
        device: Device,
        stream_id: u32,
        allocator: &Arc<dyn StorageAllocator>,
    ) -> bool {
        let Some(needed) = self.size_bytes() else {
            return false;
        };
        match &self.storage {
            Some(storage) => storage.resize(needed),
            Option::None => {
                match Storage::new_allocated(needed, device, stream_id, allocator.clone()) {
                    Some(storage) => {
                        self.storage = Some(storage);
                        true
                    }
                    Option::None => false,
                }
            }
        }
    }

    /// Copy raw bytes into the tensor's storage. The storage must already be
    /// materialized and large enough.
    pub fn update_data(&self, bytes: &[u8]) -> bool {
        let Some(storage) = &self.storage else {
            return false;
        };
        let ptr = storage.data_ptr();
        if ptr.is_null() || storage.size_bytes() < bytes.len() {
            return false;
        }
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_strides_are_row_major() {
        let t = Tensor::new(DataType::Float32, vec![2, 3, 4]);
        assert_eq!(t.strides(), &[12, 4, 1]);
        assert_eq!(t.numel(), 24);
        assert!(!t.has_dynamic_shape());
        assert_eq!(t.size_bytes(), Some(96));
    }

    #[test]
    fn dynamic_axis_poisons_earlier_strides() {
        let t = Tensor::new(DataType::Float32, vec![2, -1, 4]);
        // The dynamic axis still gets its running product from later dims;
        // everything before it is dynamic.
        assert_eq!(t.strides(), &[-1, 4, 1]);
        assert_eq!(t.numel(), -1);
        assert!(t.has_dynamic_shape());
        assert_eq!(t.size_bytes(), None);
    }

    #[test]
    fn set_shape_recomputes() {
        let mut t = Tensor::new(DataType::Int64, vec![-1]);
        assert_eq!(t.strides(), &[1]);
        t.set_shape(vec![5, 2]);
        assert_eq!(t.strides(), &[2, 1]);
        assert_eq!(t.numel(), 10);
    }

    #[test]
    fn scalar_shape() {
        let t = Tensor::new(DataType::Float64, vec![]);
        assert_eq!(t.numel(), 1);
        assert_eq!(t.size_bytes(), Some(8));
    }
}
