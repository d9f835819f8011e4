//! Opaque device array handles.
//!
//! Callers convert to and from host `ndarray` values only at the executable
//! boundary; everything in between treats a `DeviceArray` as an opaque
//! capability. The reference engine backs them with host memory.

use anyhow::{bail, Result};
use ndarray::{Array2, Array3, ArrayD, Dimension};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceDtype {
    F32,
    U32,
}

#[derive(Debug, Clone)]
enum HostValue {
    F32(ArrayD<f32>),
    U32(ArrayD<u32>),
}

#[derive(Debug, Clone)]
pub struct DeviceArray {
    value: HostValue,
}

impl DeviceArray {
    pub fn from_f32<D: Dimension>(array: ndarray::Array<f32, D>) -> Self {
        Self {
            value: HostValue::F32(array.into_dyn()),
        }
    }

    pub fn from_u32<D: Dimension>(array: ndarray::Array<u32, D>) -> Self {
        Self {
            value: HostValue::U32(array.into_dyn()),
        }
    }

    pub fn dtype(&self) -> DeviceDtype {
        match &self.value {
            HostValue::F32(_) => DeviceDtype::F32,
            HostValue::U32(_) => DeviceDtype::U32,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match &self.value {
            HostValue::F32(a) => a.shape(),
            HostValue::U32(a) => a.shape(),
        }
    }

    pub fn to_host_f32(&self) -> Result<ArrayD<f32>> {
        match &self.value {
            HostValue::F32(a) => Ok(a.clone()),
            HostValue::U32(_) => bail!("device array holds u32, expected f32"),
        }
    }

    pub fn to_host_u32(&self) -> Result<ArrayD<u32>> {
        match &self.value {
            HostValue::U32(a) => Ok(a.clone()),
            HostValue::F32(_) => bail!("device array holds f32, expected u32"),
        }
    }

    pub fn to_host_f32_2d(&self) -> Result<Array2<f32>> {
        Ok(self.to_host_f32()?.into_dimensionality()?)
    }

    pub fn to_host_u32_2d(&self) -> Result<Array2<u32>> {
        Ok(self.to_host_u32()?.into_dimensionality()?)
    }

    pub fn to_host_f32_3d(&self) -> Result<Array3<f32>> {
        Ok(self.to_host_f32()?.into_dimensionality()?)
    }
}
