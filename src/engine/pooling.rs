use super::{load, store, Engine};
use crate::{
    array::DType,
    cache::HintId,
    error::{config_error, shape_error, state_error, Result},
    layout::{blocks, Layout, MemoryDesc, BLOCK},
};
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use wide::{f32x8, CmpGt};

/// Pooling algorithms.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, derive_more::Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PoolingAlg {
    /// Max pooling, with a workspace of argmax indices.
    Max,
    /// Average pooling, padding counts toward the divisor.
    AvgIncludePadding,
}

/// A 2d f32 pooling on [`Layout::ChannelBlocked8`] arrays.
///
/// Max pooling records the flat in-window index `i * kw + j` of the first maximum for each output
/// in an i32 workspace with the layout of the destination.
#[derive(Debug)]
pub struct PoolingDesc {
    id: HintId,
    alg: PoolingAlg,
    kernel: [usize; 2],
    stride: [usize; 2],
    pad: [usize; 2],
    src: MemoryDesc,
    dst: MemoryDesc,
    workspace: Option<MemoryDesc>,
}

impl PoolingDesc {
    /// Creates a new descriptor.
    ///
    /// **Errors**
    ///
    /// The kernel or stride is zero.
    pub fn new(
        alg: PoolingAlg,
        src: [usize; 4],
        dst: [usize; 2],
        kernel: [usize; 2],
        stride: [usize; 2],
        pad: [usize; 2],
    ) -> Result<Self> {
        if kernel.contains(&0) || stride.contains(&0) {
            return Err(config_error!(
                "kernel {kernel:?} and stride {stride:?} must be positive"
            ));
        }
        let [n, c, _, _] = src;
        let [oh, ow] = dst;
        let dst = MemoryDesc::new([n, c, oh, ow], DType::F32, Layout::ChannelBlocked8)?;
        let workspace = if alg == PoolingAlg::Max {
            Some(MemoryDesc::new(dst.dims(), DType::I32, Layout::ChannelBlocked8)?)
        } else {
            None
        };
        Ok(Self {
            id: HintId::next(),
            alg,
            kernel,
            stride,
            pad,
            src: MemoryDesc::new(src, DType::F32, Layout::ChannelBlocked8)?,
            dst,
            workspace,
        })
    }
    /// Identifies the descriptor.
    pub fn id(&self) -> HintId {
        self.id
    }
    /// The algorithm.
    pub fn alg(&self) -> PoolingAlg {
        self.alg
    }
    /// The source.
    pub fn src(&self) -> &MemoryDesc {
        &self.src
    }
    /// The destination.
    pub fn dst(&self) -> &MemoryDesc {
        &self.dst
    }
    /// The workspace, for max pooling.
    pub fn workspace(&self) -> Option<&MemoryDesc> {
        self.workspace.as_ref()
    }
    fn planes(&self) -> (usize, [usize; 2], [usize; 2]) {
        let [n, c, ih, iw] = dims4(&self.src);
        let [_, _, oh, ow] = dims4(&self.dst);
        (n * blocks(c), [ih, iw], [oh, ow])
    }
    /// Input coordinate of window position `k` for output `o` along `axis`, if not padding.
    fn input_index(&self, axis: usize, o: usize, k: usize, len: usize) -> Option<usize> {
        (o * self.stride[axis] + k)
            .checked_sub(self.pad[axis])
            .filter(|i| *i < len)
    }
}

fn dims4(desc: &MemoryDesc) -> [usize; 4] {
    let mut dims = [0; 4];
    dims.copy_from_slice(desc.dims());
    dims
}

impl Engine {
    /// Pools `x` into `y`, writing argmax indices into `workspace` for max pooling.
    ///
    /// **Errors**
    ///
    /// Max pooling without a workspace.
    pub fn pooling_forward(
        &self,
        desc: &PoolingDesc,
        x: &[f32],
        y: &mut [f32],
        workspace: Option<&mut [i32]>,
    ) -> Result<()> {
        let (planes, [ih, iw], [oh, ow]) = desc.planes();
        let (x_plane, y_plane) = (ih * iw * BLOCK, oh * ow * BLOCK);
        if x.len() != planes * x_plane || y.len() != planes * y_plane {
            return Err(shape_error!("pooling forward buffers do not match {desc:?}"));
        }
        match (desc.alg, workspace) {
            (PoolingAlg::Max, Some(workspace)) => self.install(|| {
                y.par_chunks_mut(y_plane)
                    .zip(workspace.par_chunks_mut(y_plane))
                    .zip(x.par_chunks(x_plane))
                    .for_each(|((y, workspace), x)| {
                        max_pool_plane(desc, x, [ih, iw], y, workspace, [oh, ow])
                    });
            }),
            (PoolingAlg::Max, None) => return Err(state_error!("max pooling requires a workspace")),
            (PoolingAlg::AvgIncludePadding, _) => self.install(|| {
                y.par_chunks_mut(y_plane)
                    .zip(x.par_chunks(x_plane))
                    .for_each(|(y, x)| avg_pool_plane(desc, x, [ih, iw], y, [oh, ow]));
            }),
        }
        Ok(())
    }
    /// Computes the input gradient of a pooling.
    ///
    /// Max pooling routes each output gradient to the position recorded in `workspace`. Average
    /// pooling spreads it over the window, divided by the window size.
    ///
    /// **Errors**
    ///
    /// Max pooling without a workspace.
    pub fn pooling_backward(
        &self,
        desc: &PoolingDesc,
        gy: &[f32],
        workspace: Option<&[i32]>,
        gx: &mut [f32],
    ) -> Result<()> {
        let (planes, [ih, iw], [oh, ow]) = desc.planes();
        let (x_plane, y_plane) = (ih * iw * BLOCK, oh * ow * BLOCK);
        if gx.len() != planes * x_plane || gy.len() != planes * y_plane {
            return Err(shape_error!("pooling backward buffers do not match {desc:?}"));
        }
        match (desc.alg, workspace) {
            (PoolingAlg::Max, Some(workspace)) => self.install(|| {
                gx.par_chunks_mut(x_plane)
                    .zip(gy.par_chunks(y_plane))
                    .zip(workspace.par_chunks(y_plane))
                    .for_each(|((gx, gy), workspace)| {
                        max_pool_backward_plane(desc, gy, workspace, [oh, ow], gx, [ih, iw])
                    });
            }),
            (PoolingAlg::Max, None) => return Err(state_error!("max pooling requires a workspace")),
            (PoolingAlg::AvgIncludePadding, _) => self.install(|| {
                gx.par_chunks_mut(x_plane)
                    .zip(gy.par_chunks(y_plane))
                    .for_each(|(gx, gy)| avg_pool_backward_plane(desc, gy, [oh, ow], gx, [ih, iw]));
            }),
        }
        Ok(())
    }
}

fn max_pool_plane(
    desc: &PoolingDesc,
    x: &[f32],
    [ih, iw]: [usize; 2],
    y: &mut [f32],
    workspace: &mut [i32],
    [oh, ow]: [usize; 2],
) {
    let [kh, kw] = desc.kernel;
    for hy in 0..oh {
        for wy in 0..ow {
            let mut max = f32x8::splat(f32::NEG_INFINITY);
            let mut argmax = f32x8::default();
            for i in 0..kh {
                let Some(hx) = desc.input_index(0, hy, i, ih) else {
                    continue;
                };
                for j in 0..kw {
                    let Some(wx) = desc.input_index(1, wy, j, iw) else {
                        continue;
                    };
                    let v = load(&x[(hx * iw + wx) * BLOCK..]);
                    let gt = v.cmp_gt(max);
                    max = gt.blend(v, max);
                    argmax = gt.blend(f32x8::splat((i * kw + j) as f32), argmax);
                }
            }
            let offset = (hy * ow + wy) * BLOCK;
            store(&mut y[offset..], max);
            for (w, a) in workspace[offset..offset + BLOCK]
                .iter_mut()
                .zip(argmax.to_array())
            {
                *w = a as i32;
            }
        }
    }
}

fn avg_pool_plane(
    desc: &PoolingDesc,
    x: &[f32],
    [ih, iw]: [usize; 2],
    y: &mut [f32],
    [oh, ow]: [usize; 2],
) {
    let [kh, kw] = desc.kernel;
    let scale = f32x8::splat(1. / (kh * kw) as f32);
    for hy in 0..oh {
        for wy in 0..ow {
            let mut sum = f32x8::default();
            for i in 0..kh {
                let Some(hx) = desc.input_index(0, hy, i, ih) else {
                    continue;
                };
                for j in 0..kw {
                    if let Some(wx) = desc.input_index(1, wy, j, iw) {
                        sum = sum + load(&x[(hx * iw + wx) * BLOCK..]);
                    }
                }
            }
            store(&mut y[(hy * ow + wy) * BLOCK..], sum * scale);
        }
    }
}

fn max_pool_backward_plane(
    desc: &PoolingDesc,
    gy: &[f32],
    workspace: &[i32],
    [oh, ow]: [usize; 2],
    gx: &mut [f32],
    [ih, iw]: [usize; 2],
) {
    let kw = desc.kernel[1];
    gx.fill(0.);
    for hy in 0..oh {
        for wy in 0..ow {
            let offset = (hy * ow + wy) * BLOCK;
            for lane in 0..BLOCK {
                let k = workspace[offset + lane] as usize;
                let (i, j) = (k / kw, k % kw);
                if let (Some(hx), Some(wx)) = (
                    desc.input_index(0, hy, i, ih),
                    desc.input_index(1, wy, j, iw),
                ) {
                    gx[(hx * iw + wx) * BLOCK + lane] += gy[offset + lane];
                }
            }
        }
    }
}

fn avg_pool_backward_plane(
    desc: &PoolingDesc,
    gy: &[f32],
    [oh, ow]: [usize; 2],
    gx: &mut [f32],
    [ih, iw]: [usize; 2],
) {
    let [kh, kw] = desc.kernel;
    let scale = f32x8::splat(1. / (kh * kw) as f32);
    gx.fill(0.);
    for hy in 0..oh {
        for wy in 0..ow {
            let g = load(&gy[(hy * ow + wy) * BLOCK..]) * scale;
            for i in 0..kh {
                let Some(hx) = desc.input_index(0, hy, i, ih) else {
                    continue;
                };
                for j in 0..kw {
                    if let Some(wx) = desc.input_index(1, wy, j, iw) {
                        let offset = (hx * iw + wx) * BLOCK;
                        let v = load(&gx[offset..]) + g;
                        store(&mut gx[offset..], v);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One channel, padded to a block, 4x4 -> 2x2 with a 2x2 window.
    fn blocked(plain: &[f32]) -> Vec<f32> {
        plain
            .iter()
            .flat_map(|x| {
                let mut block = [0f32; BLOCK];
                block[0] = *x;
                block
            })
            .collect()
    }

    #[test]
    fn max_forward_backward() {
        let engine = Engine::get().unwrap();
        let desc =
            PoolingDesc::new(PoolingAlg::Max, [1, 1, 4, 4], [2, 2], [2, 2], [2, 2], [0, 0])
                .unwrap();
        #[rustfmt::skip]
        let x = blocked(&[
            1., 2., 0., 0.,
            4., 3., 0., 5.,
            0., 0., 7., 7.,
            6., 0., 0., 0.,
        ]);
        let mut y = vec![0f32; 4 * BLOCK];
        let mut workspace = vec![0i32; 4 * BLOCK];
        engine
            .pooling_forward(&desc, &x, &mut y, Some(&mut workspace))
            .unwrap();
        let y0: Vec<f32> = y.chunks(BLOCK).map(|b| b[0]).collect();
        let w0: Vec<i32> = workspace.chunks(BLOCK).map(|b| b[0]).collect();
        assert_eq!(y0, [4., 5., 6., 7.]);
        assert_eq!(w0, [2, 3, 2, 0]);
        let gy = blocked(&[1., 1., 1., 1.]);
        let mut gx = vec![0f32; 16 * BLOCK];
        engine
            .pooling_backward(&desc, &gy, Some(&workspace), &mut gx)
            .unwrap();
        let gx0: Vec<f32> = gx.chunks(BLOCK).map(|b| b[0]).collect();
        #[rustfmt::skip]
        assert_eq!(gx0, [
            0., 0., 0., 0.,
            1., 0., 0., 1.,
            0., 0., 1., 0.,
            1., 0., 0., 0.,
        ]);
    }

    #[test]
    fn avg_includes_padding() {
        let engine = Engine::get().unwrap();
        let desc = PoolingDesc::new(
            PoolingAlg::AvgIncludePadding,
            [1, 1, 2, 2],
            [2, 2],
            [2, 2],
            [1, 1],
            [1, 1],
        )
        .unwrap();
        let x = blocked(&[4., 4., 4., 4.]);
        let mut y = vec![0f32; 4 * BLOCK];
        engine.pooling_forward(&desc, &x, &mut y, None).unwrap();
        let y0: Vec<f32> = y.chunks(BLOCK).map(|b| b[0]).collect();
        assert_eq!(y0, [1., 2., 2., 4.]);
    }

    #[test]
    fn max_requires_workspace() {
        let engine = Engine::get().unwrap();
        let desc =
            PoolingDesc::new(PoolingAlg::Max, [1, 1, 2, 2], [1, 1], [2, 2], [2, 2], [0, 0])
                .unwrap();
        let x = vec![0f32; 4 * BLOCK];
        let mut y = vec![0f32; BLOCK];
        assert!(engine
            .pooling_forward(&desc, &x, &mut y, None)
            .unwrap_err()
            .is_state());
    }
}
