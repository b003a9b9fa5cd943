use super::Engine;
use crate::{
    array::DType,
    cache::HintId,
    error::{shape_error, Result},
    layout::MemoryDesc,
};
use ndarray::{linalg::general_mat_mul, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis};

/// An f32 inner product y = x W^T + b.
///
/// x is (batch, inputs), W is (outputs, inputs), all plain.
#[derive(Debug)]
pub struct InnerProductDesc {
    id: HintId,
    bias: bool,
    src: MemoryDesc,
    weights: MemoryDesc,
    dst: MemoryDesc,
}

impl InnerProductDesc {
    /// Creates a new descriptor.
    pub fn new(batch: usize, inputs: usize, outputs: usize, bias: bool) -> Self {
        Self {
            id: HintId::next(),
            bias,
            src: MemoryDesc::plain(&[batch, inputs], DType::F32),
            weights: MemoryDesc::plain(&[outputs, inputs], DType::F32),
            dst: MemoryDesc::plain(&[batch, outputs], DType::F32),
        }
    }
    /// Identifies the descriptor.
    pub fn id(&self) -> HintId {
        self.id
    }
    /// Whether there is a bias.
    pub fn bias(&self) -> bool {
        self.bias
    }
    /// The source, (batch, inputs).
    pub fn src(&self) -> &MemoryDesc {
        &self.src
    }
    /// The weights, (outputs, inputs).
    pub fn weights(&self) -> &MemoryDesc {
        &self.weights
    }
    /// The destination, (batch, outputs).
    pub fn dst(&self) -> &MemoryDesc {
        &self.dst
    }
    /// The bias, (outputs).
    pub fn bias_desc(&self) -> MemoryDesc {
        MemoryDesc::plain(&self.weights.dims()[..1], DType::F32)
    }
    fn dims(&self) -> (usize, usize, usize) {
        let (batch, inputs) = (self.src.dims()[0], self.src.dims()[1]);
        (batch, inputs, self.weights.dims()[0])
    }
}

impl Engine {
    /// Computes `y = x W^T + b`.
    pub fn inner_product_forward(
        &self,
        desc: &InnerProductDesc,
        x: &[f32],
        w: &[f32],
        b: Option<&[f32]>,
        y: &mut [f32],
    ) -> Result<()> {
        let (batch, inputs, outputs) = desc.dims();
        let x = ArrayView2::from_shape([batch, inputs], x).map_err(|e| shape_error!("{e}"))?;
        let w = ArrayView2::from_shape([outputs, inputs], w).map_err(|e| shape_error!("{e}"))?;
        let mut y =
            ArrayViewMut2::from_shape([batch, outputs], y).map_err(|e| shape_error!("{e}"))?;
        self.install(|| {
            let beta = if let Some(b) = b {
                let b = ArrayView1::from(b);
                for mut row in y.rows_mut() {
                    row.assign(&b);
                }
                1.
            } else {
                0.
            };
            general_mat_mul(1., &x, &w.t(), beta, &mut y);
        });
        Ok(())
    }
    /// Computes `gx = gy W`.
    pub fn inner_product_backward_data(
        &self,
        desc: &InnerProductDesc,
        gy: &[f32],
        w: &[f32],
        gx: &mut [f32],
    ) -> Result<()> {
        let (batch, inputs, outputs) = desc.dims();
        let gy = ArrayView2::from_shape([batch, outputs], gy).map_err(|e| shape_error!("{e}"))?;
        let w = ArrayView2::from_shape([outputs, inputs], w).map_err(|e| shape_error!("{e}"))?;
        let mut gx =
            ArrayViewMut2::from_shape([batch, inputs], gx).map_err(|e| shape_error!("{e}"))?;
        self.install(|| general_mat_mul(1., &gy, &w, 0., &mut gx));
        Ok(())
    }
    /// Computes `gW = gy^T x` and `gb` as the sum of `gy` over the batch.
    pub fn inner_product_backward_weights(
        &self,
        desc: &InnerProductDesc,
        x: &[f32],
        gy: &[f32],
        gw: &mut [f32],
        gb: Option<&mut [f32]>,
    ) -> Result<()> {
        let (batch, inputs, outputs) = desc.dims();
        let x = ArrayView2::from_shape([batch, inputs], x).map_err(|e| shape_error!("{e}"))?;
        let gy = ArrayView2::from_shape([batch, outputs], gy).map_err(|e| shape_error!("{e}"))?;
        let mut gw =
            ArrayViewMut2::from_shape([outputs, inputs], gw).map_err(|e| shape_error!("{e}"))?;
        self.install(|| {
            general_mat_mul(1., &gy.t(), &x, 0., &mut gw);
            if let Some(gb) = gb {
                ArrayViewMut1::from(gb).assign(&gy.sum_axis(Axis(0)));
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_backward() {
        let engine = Engine::get().unwrap();
        let desc = InnerProductDesc::new(2, 3, 2, true);
        let x = [1f32, 2., 3., 4., 5., 6.];
        let w = [1f32, 0., 1., 0., 1., 0.];
        let b = [1f32, -1.];
        let mut y = [0f32; 4];
        engine
            .inner_product_forward(&desc, &x, &w, Some(&b), &mut y)
            .unwrap();
        assert_eq!(y, [5., 1., 11., 4.]);
        let gy = [1f32, 1., 1., 1.];
        let mut gx = [0f32; 6];
        engine
            .inner_product_backward_data(&desc, &gy, &w, &mut gx)
            .unwrap();
        assert_eq!(gx, [1., 1., 1., 1., 1., 1.]);
        let mut gw = [0f32; 6];
        let mut gb = [0f32; 2];
        engine
            .inner_product_backward_weights(&desc, &x, &gy, &mut gw, Some(&mut gb))
            .unwrap();
        assert_eq!(gw, [5., 7., 9., 5., 7., 9.]);
        assert_eq!(gb, [2., 2.]);
    }

    #[test]
    fn wrong_len() {
        let engine = Engine::get().unwrap();
        let desc = InnerProductDesc::new(2, 3, 2, false);
        let mut y = [0f32; 4];
        assert!(engine
            .inner_product_forward(&desc, &[0.; 5], &[0.; 6], None, &mut y)
            .unwrap_err()
            .is_shape());
    }
}
