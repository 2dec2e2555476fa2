// Tensor — an arena-backed tensor view
//
// A Tensor never owns its elements outright: it is a (storage, offset,
// shape) view where storage is a shared, reference-counted buffer. Two
// tensors that alias (in-place execution, memory-plan packing) hold the
// same buffer handle, which keeps aliasing explicit and auditable —
// there are no raw overlapping memory views anywhere.
//
// Host storage is always f32. Half-precision tensors carry DType::F16 as
// a format tag (the memory planner packs by bytes) and convert at the
// boundary via the `half` crate.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use half::f16;

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::init::Initializer;
use crate::shape::TensorDim;

/// Shared backing buffer for one storage region.
pub type Storage = Rc<RefCell<Vec<f32>>>;

/// A named view over a shared storage region.
#[derive(Clone)]
pub struct Tensor {
    name: String,
    dim: TensorDim,
    dtype: DType,
    storage: Storage,
    offset: usize,
}

impl Tensor {
    /// Create a tensor with its own zeroed storage.
    pub fn zeros(name: impl Into<String>, dim: TensorDim, dtype: DType) -> Self {
        let len = dim.elem_count();
        Tensor {
            name: name.into(),
            dim,
            dtype,
            storage: Rc::new(RefCell::new(vec![0.0; len])),
            offset: 0,
        }
    }

    /// Create a view into an existing storage region at a given offset.
    ///
    /// Fails if the view would run past the end of the region.
    pub fn from_storage(
        name: impl Into<String>,
        dim: TensorDim,
        dtype: DType,
        storage: Storage,
        offset: usize,
    ) -> Result<Self> {
        let needed = offset + dim.elem_count();
        let available = storage.borrow().len();
        if needed > available {
            return Err(Error::msg(format!(
                "tensor view out of bounds: needs {} elements at offset {}, region has {}",
                dim.elem_count(),
                offset,
                available
            )));
        }
        Ok(Tensor {
            name: name.into(),
            dim,
            dtype,
            storage,
            offset,
        })
    }

    /// Create an alias of this tensor under a new name and shape.
    ///
    /// The alias shares this tensor's storage and offset; its element
    /// count must not exceed this tensor's.
    pub fn view_of(&self, name: impl Into<String>, dim: TensorDim) -> Result<Self> {
        if dim.elem_count() > self.dim.elem_count() {
            return Err(Error::ShapeMismatch {
                expected: self.dim.clone(),
                got: dim,
            });
        }
        Ok(Tensor {
            name: name.into(),
            dim,
            dtype: self.dtype,
            storage: Rc::clone(&self.storage),
            offset: self.offset,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dim(&self) -> &TensorDim {
        &self.dim
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn elem_count(&self) -> usize {
        self.dim.elem_count()
    }

    /// Whether the two tensors are backed by the same storage region.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Rc::ptr_eq(&self.storage, &other.storage)
    }

    /// Whether the two tensors view the exact same elements.
    pub fn aliases(&self, other: &Tensor) -> bool {
        self.shares_storage(other) && self.offset == other.offset
    }

    /// Immutable view of the elements.
    ///
    /// Panics if the region is currently mutably borrowed; the execution
    /// engine serializes node compute calls so this never happens in a
    /// well-formed pass.
    pub fn read(&self) -> Ref<'_, [f32]> {
        let len = self.elem_count();
        Ref::map(self.storage.borrow(), |v| &v[self.offset..self.offset + len])
    }

    /// Mutable view of the elements.
    pub fn write(&self) -> RefMut<'_, [f32]> {
        let len = self.elem_count();
        RefMut::map(self.storage.borrow_mut(), |v| {
            &mut v[self.offset..self.offset + len]
        })
    }

    /// Copy the elements out.
    pub fn to_vec(&self) -> Vec<f32> {
        self.read().to_vec()
    }

    /// Copy `data` in. Fails if the length does not match.
    pub fn set_data(&self, data: &[f32]) -> Result<()> {
        if data.len() != self.elem_count() {
            return Err(Error::msg(format!(
                "tensor '{}': cannot set {} elements into shape {}",
                self.name,
                data.len(),
                self.dim
            )));
        }
        self.write().copy_from_slice(data);
        Ok(())
    }

    /// Fill every element with a constant.
    pub fn fill(&self, value: f32) {
        self.write().fill(value);
    }

    /// Apply `f` to every element in place.
    pub fn map_inplace(&self, f: impl Fn(f32) -> f32) {
        for x in self.write().iter_mut() {
            *x = f(*x);
        }
    }

    /// Copy another tensor's elements into this one.
    ///
    /// A no-op when the two tensors alias (in-place execution).
    pub fn assign(&self, other: &Tensor) -> Result<()> {
        if self.aliases(other) {
            return Ok(());
        }
        if self.elem_count() != other.elem_count() {
            return Err(Error::ShapeMismatch {
                expected: self.dim.clone(),
                got: other.dim.clone(),
            });
        }
        let src = other.to_vec();
        self.write().copy_from_slice(&src);
        Ok(())
    }

    /// Apply an initializer to this tensor's elements.
    pub fn initialize(&self, init: &Initializer) {
        init.fill(&mut self.write(), &self.dim);
    }

    /// Read out as half-precision values (for F16-tagged tensors).
    pub fn to_f16_vec(&self) -> Vec<f16> {
        self.read().iter().map(|&x| f16::from_f32(x)).collect()
    }

    /// Copy half-precision data in, widening to the host representation.
    pub fn set_data_f16(&self, data: &[f16]) -> Result<()> {
        let widened: Vec<f32> = data.iter().map(|x| x.to_f32()).collect();
        self.set_data(&widened)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("name", &self.name)
            .field("dim", &self.dim)
            .field("dtype", &self.dtype)
            .field("offset", &self.offset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeros_and_fill() {
        let t = Tensor::zeros("a", TensorDim::from((2, 3)), DType::F32);
        assert_eq!(t.to_vec(), vec![0.0; 6]);
        t.fill(2.0);
        assert_eq!(t.to_vec(), vec![2.0; 6]);
    }

    #[test]
    fn test_view_shares_storage() {
        let t = Tensor::zeros("a", TensorDim::from((2, 3)), DType::F32);
        let v = t.view_of("a_view", TensorDim::from((2, 3))).unwrap();
        assert!(t.shares_storage(&v));
        assert!(t.aliases(&v));
        v.fill(1.0);
        assert_eq!(t.to_vec(), vec![1.0; 6]);
    }

    #[test]
    fn test_view_too_large_rejected() {
        let t = Tensor::zeros("a", TensorDim::from((2, 3)), DType::F32);
        assert!(t.view_of("big", TensorDim::from((4, 3))).is_err());
    }

    #[test]
    fn test_offset_views_are_disjoint() {
        let region: Storage = Rc::new(RefCell::new(vec![0.0; 10]));
        let a = Tensor::from_storage("a", TensorDim::from(4), DType::F32, Rc::clone(&region), 0)
            .unwrap();
        let b = Tensor::from_storage("b", TensorDim::from(4), DType::F32, Rc::clone(&region), 4)
            .unwrap();
        assert!(a.shares_storage(&b));
        assert!(!a.aliases(&b));
        a.fill(1.0);
        b.fill(2.0);
        assert_eq!(a.to_vec(), vec![1.0; 4]);
        assert_eq!(b.to_vec(), vec![2.0; 4]);
    }

    #[test]
    fn test_assign_aliased_is_noop() {
        let t = Tensor::zeros("a", TensorDim::from(3), DType::F32);
        let v = t.view_of("b", TensorDim::from(3)).unwrap();
        t.set_data(&[1.0, 2.0, 3.0]).unwrap();
        v.assign(&t).unwrap();
        assert_eq!(v.to_vec(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_f16_round_trip() {
        let t = Tensor::zeros("h", TensorDim::from(3), DType::F16);
        let data = [f16::from_f32(0.5), f16::from_f32(-1.0), f16::from_f32(2.0)];
        t.set_data_f16(&data).unwrap();
        assert_eq!(t.to_f16_vec(), data.to_vec());
    }
}
