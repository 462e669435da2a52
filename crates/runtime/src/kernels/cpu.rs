//! The reference CPU kernel library.
//!
//! Straightforward scalar loops over the supported element types; nothing
//! here claims performance. The library also handles the scalar-value
//! inputs a graph parameter may carry, so `g(3, 4)` runs without wrapping
//! its arguments in tensors.

use da_ir::{DataType, Node, Storage, Tensor, Value};
use da_ops::Op;

use crate::kernel::{Kernel, KernelError, KernelLib, KernelResult, LaunchStream};

pub struct CpuKernelLib;

impl KernelLib for CpuKernelLib {
    fn name(&self) -> &str {
        "cpu"
    }

    fn create_kernel(&self, node: &Node) -> Option<Box<dyn Kernel>> {
        match node.op? {
            op @ (Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Neg | Op::Relu) => {
                Some(Box::new(ElementwiseKernel { op }))
            }
            Op::MatMul => Some(Box::new(MatMulKernel)),
            Op::Unique => Some(Box::new(UniqueKernel)),
            _ => None,
        }
    }
}

fn tensor_slice<T>(tensor: &Tensor) -> KernelResult<&[T]> {
    let numel = tensor.numel();
    if numel < 0 {
        return Err(KernelError::InvalidShape("dynamic shape at launch".into()));
    }
    let ptr = tensor.data_ptr();
    if ptr.is_null() {
        return Err(KernelError::InvalidDeviceAddr("input storage not materialized".into()));
    }
    Ok(unsafe { core::slice::from_raw_parts(ptr as *const T, numel as usize) })
}

fn tensor_slice_mut<T>(tensor: &Tensor) -> KernelResult<&mut [T]> {
    let numel = tensor.numel();
    if numel < 0 {
        return Err(KernelError::InvalidShape("dynamic shape at launch".into()));
    }
    let ptr = tensor.data_ptr();
    if ptr.is_null() {
        return Err(KernelError::InvalidDeviceAddr("output storage not materialized".into()));
    }
    Ok(unsafe { core::slice::from_raw_parts_mut(ptr as *mut T, numel as usize) })
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::Int(_) | Value::Double(_) | Value::Bool(_))
}

struct ElementwiseKernel {
    op: Op,
}

impl ElementwiseKernel {
    fn is_unary(&self) -> bool {
        matches!(self.op, Op::Neg | Op::Relu)
    }

    fn scalar_binary(&self, lhs: &Value, rhs: &Value) -> KernelResult<Value> {
        match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => {
                let (a, b) = (*a, *b);
                Ok(Value::Int(match self.op {
                    Op::Add => a + b,
                    Op::Sub => a - b,
                    Op::Mul => a * b,
                    Op::Div => {
                        if b == 0 {
                            return Err(KernelError::InvalidParam("division by zero".into()));
                        }
                        a / b
                    }
                    _ => unreachable!(),
                }))
            }
            _ => {
                let a = scalar_as_double(lhs)?;
                let b = scalar_as_double(rhs)?;
                Ok(Value::Double(match self.op {
                    Op::Add => a + b,
                    Op::Sub => a - b,
                    Op::Mul => a * b,
                    Op::Div => a / b,
                    _ => unreachable!(),
                }))
            }
        }
    }

    fn scalar_unary(&self, input: &Value) -> KernelResult<Value> {
        match (self.op, input) {
            (Op::Neg, Value::Int(a)) => Ok(Value::Int(-a)),
            (Op::Neg, Value::Double(a)) => Ok(Value::Double(-a)),
            (Op::Relu, Value::Int(a)) => Ok(Value::Int((*a).max(0))),
            (Op::Relu, Value::Double(a)) => Ok(Value::Double(a.max(0.0))),
            _ => Err(KernelError::Unsupported(format!("{} on {}", self.op, input.type_name()))),
        }
    }

    fn lanes<T>(&self, inputs: &[Value], output: &Value, f: impl Fn(T, T) -> T) -> KernelResult<()>
    where
        T: Copy,
    {
        let out = tensor_slice_mut::<T>(output.as_tensor().map_err(wrap_type)?)?;
        if self.is_unary() {
            let a = tensor_slice::<T>(inputs[0].as_tensor().map_err(wrap_type)?)?;
            for (o, &x) in out.iter_mut().zip(a) {
                *o = f(x, x);
            }
        } else {
            let a = tensor_slice::<T>(inputs[0].as_tensor().map_err(wrap_type)?)?;
            let b = tensor_slice::<T>(inputs[1].as_tensor().map_err(wrap_type)?)?;
            for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
                *o = f(x, y);
            }
        }
        Ok(())
    }
}

fn scalar_as_double(value: &Value) -> KernelResult<f64> {
    match value {
        Value::Int(v) => Ok(*v as f64),
        Value::Double(v) => Ok(*v),
        other => Err(KernelError::Unsupported(format!("scalar {}", other.type_name()))),
    }
}

fn wrap_type(err: da_ir::TypeError) -> KernelError {
    KernelError::InvalidParam(err.to_string())
}

impl Kernel for ElementwiseKernel {
    fn infer_shape(&mut self, inputs: &[Value], output: &mut Value) -> KernelResult<()> {
        let arity = if self.is_unary() { 1 } else { 2 };
        if inputs.len() != arity {
            return Err(KernelError::InvalidParam(format!(
                "{} expects {arity} inputs, got {}",
                self.op,
                inputs.len()
            )));
        }
        if inputs.iter().all(is_scalar) {
            // The scalar result type mirrors the int/double promotion rule;
            // the placeholder value is overwritten at launch.
            let int = inputs.iter().all(|v| v.is_int());
            *output = if int { Value::Int(0) } else { Value::Double(0.0) };
            return Ok(());
        }
        let first = inputs[0].as_tensor().map_err(wrap_type)?;
        for input in &inputs[1..] {
            let t = input.as_tensor().map_err(wrap_type)?;
            if t.shape() != first.shape() {
                return Err(KernelError::InvalidShape(format!(
                    "{} operand shapes differ: {:?} vs {:?}",
                    self.op,
                    first.shape(),
                    t.shape()
                )));
            }
            if t.dtype() != first.dtype() {
                return Err(KernelError::Unsupported(format!(
                    "{} operand dtypes differ: {} vs {}",
                    self.op,
                    first.dtype(),
                    t.dtype()
                )));
            }
        }
        *output = Value::Tensor(Tensor::new(first.dtype(), first.shape().to_vec()));
        Ok(())
    }

    fn launch(
        &mut self,
        inputs: &[Value],
        _workspace: Option<&Storage>,
        output: &mut Value,
        _stream: &LaunchStream,
    ) -> KernelResult<()> {
        if inputs.iter().all(is_scalar) {
            *output = if self.is_unary() {
                self.scalar_unary(&inputs[0])?
            } else {
                self.scalar_binary(&inputs[0], &inputs[1])?
            };
            return Ok(());
        }
        let op = self.op;
        match inputs[0].as_tensor().map_err(wrap_type)?.dtype() {
            DataType::Float32 => self.lanes::<f32>(inputs, output, move |a, b| match op {
                Op::Add => a + b,
                Op::Sub => a - b,
                Op::Mul => a * b,
                Op::Div => a / b,
                Op::Neg => -a,
                Op::Relu => a.max(0.0),
                _ => unreachable!(),
            }),
            DataType::Float64 => self.lanes::<f64>(inputs, output, move |a, b| match op {
                Op::Add => a + b,
                Op::Sub => a - b,
                Op::Mul => a * b,
                Op::Div => a / b,
                Op::Neg => -a,
                Op::Relu => a.max(0.0),
                _ => unreachable!(),
            }),
            DataType::Int64 => self.lanes::<i64>(inputs, output, move |a, b| match op {
                Op::Add => a.wrapping_add(b),
                Op::Sub => a.wrapping_sub(b),
                Op::Mul => a.wrapping_mul(b),
                Op::Div => if b == 0 { 0 } else { a / b },
                Op::Neg => a.wrapping_neg(),
                Op::Relu => a.max(0),
                _ => unreachable!(),
            }),
            DataType::Int32 => self.lanes::<i32>(inputs, output, move |a, b| match op {
                Op::Add => a.wrapping_add(b),
                Op::Sub => a.wrapping_sub(b),
                Op::Mul => a.wrapping_mul(b),
                Op::Div => if b == 0 { 0 } else { a / b },
                Op::Neg => a.wrapping_neg(),
                Op::Relu => a.max(0),
                _ => unreachable!(),
            }),
            other => Err(KernelError::Unsupported(format!("{} on {}", self.op, other))),
        }
    }
}

struct MatMulKernel;

impl Kernel for MatMulKernel {
    fn infer_shape(&mut self, inputs: &[Value], output: &mut Value) -> KernelResult<()> {
        if inputs.len() != 2 {
            return Err(KernelError::InvalidParam(format!(
                "matmul expects 2 inputs, got {}",
                inputs.len()
            )));
        }
        let a = inputs[0].as_tensor().map_err(wrap_type)?;
        let b = inputs[1].as_tensor().map_err(wrap_type)?;
        let (ashape, bshape) = (a.shape(), b.shape());
        if ashape.len() != 2 || bshape.len() != 2 || ashape[1] != bshape[0] {
            return Err(KernelError::InvalidShape(format!(
                "matmul operands {ashape:?} x {bshape:?}"
            )));
        }
        if a.dtype() != b.dtype() {
            return Err(KernelError::Unsupported("matmul operand dtypes differ".into()));
        }
        *output = Value::Tensor(Tensor::new(a.dtype(), vec![ashape[0], bshape[1]]));
        Ok(())
    }

    fn launch(
        &mut self,
        inputs: &[Value],
        _workspace: Option<&Storage>,
        output: &mut Value,
        _stream: &LaunchStream,
    ) -> KernelResult<()> {
        let a = inputs[0].as_tensor().map_err(wrap_type)?;
        let b = inputs[1].as_tensor().map_err(wrap_type)?;
        let (m, k, n) = (a.shape()[0] as usize, a.shape()[1] as usize, b.shape()[1] as usize);
        match a.dtype() {
            DataType::Float32 => {
                matmul(tensor_slice::<f32>(a)?, tensor_slice::<f32>(b)?,
                    tensor_slice_mut::<f32>(output.as_tensor().map_err(wrap_type)?)?, m, k, n);
                Ok(())
            }
            DataType::Float64 => {
                matmul(tensor_slice::<f64>(a)?, tensor_slice::<f64>(b)?,
                    tensor_slice_mut::<f64>(output.as_tensor().map_err(wrap_type)?)?, m, k, n);
                Ok(())
            }
            other => Err(KernelError::Unsupported(format!("matmul on {other}"))),
        }
    }
}

fn matmul<T>(a: &[T], b: &[T], out: &mut [T], m: usize, k: usize, n: usize)
where
    T: Copy + Default + core::ops::Mul<Output = T> + core::ops::Add<Output = T>,
{
    for i in 0..m {
        for j in 0..n {
            let mut acc = T::default();
            for l in 0..k {
                acc = acc + a[i * k + l] * b[l * n + j];
            }
            out[i * n + j] = acc;
        }
    }
}

/// Sorted unique over a 1-D tensor. The output shape is only known once the
/// kernel has run, so `launch` synchronizes its stream and shrinks the
/// inferred worst-case shape afterwards.
struct UniqueKernel;

impl Kernel for UniqueKernel {
    fn infer_shape(&mut self, inputs: &[Value], output: &mut Value) -> KernelResult<()> {
        if inputs.len() != 1 {
            return Err(KernelError::InvalidParam(format!(
                "unique expects 1 input, got {}",
                inputs.len()
            )));
        }
        let input = inputs[0].as_tensor().map_err(wrap_type)?;
        if input.shape().len() != 1 {
            return Err(KernelError::InvalidShape(format!(
                "unique expects a 1-D input, got {:?}",
                input.shape()
            )));
        }
        // Worst case: nothing deduplicates.
        *output = Value::Tensor(Tensor::new(input.dtype(), input.shape().to_vec()));
        Ok(())
    }

    fn launch(
        &mut self,
        inputs: &[Value],
        _workspace: Option<&Storage>,
        output: &mut Value,
        stream: &LaunchStream,
    ) -> KernelResult<()> {
        let input = inputs[0].as_tensor().map_err(wrap_type)?;
        let unique_len = match input.dtype() {
            DataType::Int64 => unique_into::<i64>(input, output)?,
            DataType::Int32 => unique_into::<i32>(input, output)?,
            other => return Err(KernelError::Unsupported(format!("unique on {other}"))),
        };
        // The device must be done before the host-side shape fixup.
        stream
            .sync()
            .map_err(|e| KernelError::InvalidDeviceAddr(e.to_string()))?;
        output
            .as_tensor_mut()
            .map_err(wrap_type)?
            .set_shape(vec![unique_len as i64]);
        Ok(())
    }

    fn updates_shape_after_launch(&self) -> bool {
        true
    }
}

fn unique_into<T>(input: &Tensor, output: &Value) -> KernelResult<usize>
where
    T: Copy + Ord,
{
    let mut values: Vec<T> = tensor_slice::<T>(input)?.to_vec();
    values.sort_unstable();
    values.dedup();
    let out = tensor_slice_mut::<T>(output.as_tensor().map_err(wrap_type)?)?;
    out[..values.len()].copy_from_slice(&values);
    Ok(values.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use da_ir::Device;
    use std::sync::Arc;

    fn cpu_tensor(dtype: DataType, shape: Vec<i64>, bytes: &[u8]) -> Value {
        let alloc: Arc<dyn da_ir::StorageAllocator> =
            Arc::new(crate::pool::PoolAllocator::new(Arc::new(crate::pool::BestFitPool::new(
                crate::pool::PoolConfig {
                    reserve_bytes: 16 << 20,
                    block_unit: 2 << 20,
                    ..Default::default()
                },
            ))));
        let mut t = Tensor::new(dtype, shape);
        assert!(t.resize_storage(Device::CPU, 0, &alloc));
        assert!(t.update_data(bytes));
        Value::Tensor(t)
    }

    fn f32_tensor(shape: Vec<i64>, data: &[f32]) -> Value {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_ne_bytes()).collect();
        cpu_tensor(DataType::Float32, shape, &bytes)
    }

    fn run(op: Op, inputs: &[Value]) -> Value {
        let lib = CpuKernelLib;
        let mut g = da_ir::Graph::new("t");
        let ids: Vec<_> = inputs.iter().map(|v| g.add_value_node(v.clone())).collect();
        let node = g.add_op_node(op, &ids, Value::None).unwrap();
        let mut kernel = lib.create_kernel(g.node(node)).unwrap();

        let res = crate::res::cpu::CpuResManager::new(
            Device::CPU,
            crate::pool::PoolConfig { reserve_bytes: 16 << 20, block_unit: 2 << 20, ..Default::default() },
        );
        let mut output = Value::None;
        kernel.infer_shape(inputs, &mut output).unwrap();
        if let Value::Tensor(t) = &mut output {
            let alloc = crate::res::ResManager::storage_allocator(&res);
            assert!(t.resize_storage(Device::CPU, 0, &alloc));
        }
        let stream = LaunchStream { id: 0, res: &res };
        kernel.launch(inputs, None, &mut output, &stream).unwrap();
        output
    }

    #[test]
    fn scalar_add() {
        let out = run(Op::Add, &[Value::Int(3), Value::Int(4)]);
        assert_eq!(out.to_int().unwrap(), 7);
    }

    #[test]
    fn scalar_promotion() {
        let out = run(Op::Mul, &[Value::Int(3), Value::Double(0.5)]);
        assert_eq!(out.to_double().unwrap(), 1.5);
    }

    #[test]
    fn tensor_add_elementwise() {
        let a = f32_tensor(vec![4], &[1.0, 2.0, 3.0, 4.0]);
        let b = f32_tensor(vec![4], &[10.0, 20.0, 30.0, 40.0]);
        let out = run(Op::Add, &[a, b]);
        let t = out.as_tensor().unwrap();
        assert_eq!(t.shape(), &[4]);
        assert_eq!(tensor_slice::<f32>(t).unwrap(), &[11.0, 22.0, 33.0, 44.0]);
    }

    #[test]
    fn relu_clamps() {
        let a = f32_tensor(vec![4], &[-1.0, 2.0, -3.0, 4.0]);
        let out = run(Op::Relu, &[a]);
        assert_eq!(
            tensor_slice::<f32>(out.as_tensor().unwrap()).unwrap(),
            &[0.0, 2.0, 0.0, 4.0]
        );
    }

    #[test]
    fn matmul_2x2() {
        let a = f32_tensor(vec![2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let b = f32_tensor(vec![2, 2], &[5.0, 6.0, 7.0, 8.0]);
        let out = run(Op::MatMul, &[a, b]);
        assert_eq!(
            tensor_slice::<f32>(out.as_tensor().unwrap()).unwrap(),
            &[19.0, 22.0, 43.0, 50.0]
        );
    }

    #[test]
    fn unique_shrinks_its_shape() {
        let bytes: Vec<u8> = [3i64, 1, 3, 2, 1].iter().flat_map(|v| v.to_ne_bytes()).collect();
        let a = cpu_tensor(DataType::Int64, vec![5], &bytes);
        let out = run(Op::Unique, &[a]);
        let t = out.as_tensor().unwrap();
        assert_eq!(t.shape(), &[3]);
        assert_eq!(tensor_slice::<i64>(t).unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn mismatched_shapes_fail_inference() {
        let a = f32_tensor(vec![2], &[1.0, 2.0]);
        let b = f32_tensor(vec![3], &[1.0, 2.0, 3.0]);
        let lib = CpuKernelLib;
        let mut g = da_ir::Graph::new("t");
        let ia = g.add_value_node(a.clone());
        let ib = g.add_value_node(b.clone());
        let node = g.add_op_node(Op::Add, &[ia, ib], Value::None).unwrap();
        let mut kernel = lib.create_kernel(g.node(node)).unwrap();
        let mut out = Value::None;
        assert!(matches!(
            kernel.infer_shape(&[a, b], &mut out),
            Err(KernelError::InvalidShape(_))
        ));
    }
}
