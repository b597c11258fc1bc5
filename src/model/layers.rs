//! Building blocks shared by the architecture families

use burn::{
    module::{Module, Param, ParamId},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, Initializer, Linear, LinearConfig, PaddingConfig2d,
    },
    tensor::{activation::relu, backend::Backend, Tensor},
};

/// BatchNorm epsilon used by torchvision
pub const BN_EPS: f64 = 1e-5;

/// Convolution, square kernel, no bias
pub fn conv2d<B: Backend>(
    channels: [usize; 2],
    kernel: usize,
    stride: usize,
    padding: usize,
    device: &B::Device,
) -> Conv2d<B> {
    conv2d_grouped(channels, kernel, stride, padding, 1, device)
}

pub fn conv2d_grouped<B: Backend>(
    channels: [usize; 2],
    kernel: usize,
    stride: usize,
    padding: usize,
    groups: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new(channels, [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_groups(groups)
        .with_bias(false)
        .init(device)
}

/// Convolution with a bias term
pub fn conv2d_bias<B: Backend>(
    channels: [usize; 2],
    kernel: usize,
    stride: usize,
    padding: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new(channels, [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .init(device)
}

pub fn batch_norm<B: Backend>(channels: usize, device: &B::Device) -> BatchNorm<B> {
    BatchNormConfig::new(channels)
        .with_epsilon(BN_EPS)
        .init(device)
}

pub fn batch_norm_with<B: Backend>(
    channels: usize,
    epsilon: f64,
    momentum: f64,
    device: &B::Device,
) -> BatchNorm<B> {
    BatchNormConfig::new(channels)
        .with_epsilon(epsilon)
        .with_momentum(momentum)
        .init(device)
}

/// Fresh classification layer
pub fn linear_head<B: Backend>(in_features: usize, num_classes: usize, device: &B::Device) -> Linear<B> {
    LinearConfig::new(in_features, num_classes).init(device)
}

/// Fresh 1x1 convolutional classifier, initialised like torchvision's squeezenet head
pub fn conv_head<B: Backend>(in_channels: usize, num_classes: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, num_classes], [1, 1])
        .with_initializer(Initializer::Normal {
            mean: 0.0,
            std: 0.01,
        })
        .init(device)
}

/// Input width of an existing linear layer
pub fn linear_in_features<B: Backend>(layer: &Linear<B>) -> usize {
    layer.weight.val().dims()[0]
}

/// Input channels of an existing convolution
pub fn conv_in_channels<B: Backend>(layer: &Conv2d<B>) -> usize {
    let [_, in_per_group, _, _] = layer.weight.val().dims();
    in_per_group
}

pub fn linear_param_ids<B: Backend>(layer: &Linear<B>) -> Vec<ParamId> {
    param_ids(&layer.weight, layer.bias.as_ref())
}

pub fn conv_param_ids<B: Backend>(layer: &Conv2d<B>) -> Vec<ParamId> {
    param_ids(&layer.weight, layer.bias.as_ref())
}

fn param_ids<B: Backend, const D: usize>(
    weight: &Param<Tensor<B, D>>,
    bias: Option<&Param<Tensor<B, 1>>>,
) -> Vec<ParamId> {
    let mut ids = vec![weight.id.clone()];
    ids.extend(bias.map(|b| b.id.clone()));
    ids
}

/// `[B, C, H, W] -> [B, C * H * W]`
pub fn flatten<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 2> {
    x.flatten(1, 3)
}

pub fn relu6<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clamp(0.0, 6.0)
}

/// Pad bottom/right so that a following pooling window of `kernel`/`stride`
/// yields `ceil` instead of `floor` output sizes.
pub fn pad_for_ceil_mode<B: Backend>(
    x: Tensor<B, 4>,
    kernel: usize,
    stride: usize,
    padding: usize,
) -> Tensor<B, 4> {
    let [_, _, height, width] = x.dims();
    let extra = |size: usize| {
        let span = size + 2 * padding;
        if span < kernel {
            return 0;
        }
        let floor_out = (span - kernel) / stride + 1;
        let mut ceil_out = (span - kernel).div_ceil(stride) + 1;
        // the last window must start inside the (left-padded) input
        if (ceil_out - 1) * stride >= size + padding {
            ceil_out -= 1;
        }
        if ceil_out == floor_out {
            return 0;
        }
        (ceil_out - 1) * stride + kernel - span
    };
    let (pad_h, pad_w) = (extra(height), extra(width));
    if pad_h == 0 && pad_w == 0 {
        return x;
    }
    x.pad((0, pad_w, 0, pad_h), f32::NEG_INFINITY)
}

/// Convolution followed by batch norm, with the activation chosen at call time
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B>,
}

impl<B: Backend> ConvBn<B> {
    pub fn new(
        channels: [usize; 2],
        kernel: usize,
        stride: usize,
        groups: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            conv: conv2d_grouped(channels, kernel, stride, (kernel - 1) / 2, groups, device),
            bn: batch_norm(channels[1], device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }

    pub fn forward_relu(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        relu(self.forward(x))
    }

    pub fn forward_relu6(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        relu6(self.forward(x))
    }
}

/// Map torchvision's ImageNet-normalised input to the `[-1, 1]` scaling the
/// original Inception weights were trained with
pub fn transform_input<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let channels = x.chunk(3, 1);
    let scales = [(0.229, 0.485), (0.224, 0.456), (0.225, 0.406)];
    let parts: Vec<Tensor<B, 4>> = channels
        .into_iter()
        .zip(scales)
        .map(|(c, (std, mean))| c.mul_scalar(std / 0.5).add_scalar((mean - 0.5) / 0.5))
        .collect();
    Tensor::cat(parts, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use burn::nn::pool::MaxPool2dConfig;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_ceil_mode_padding() {
        let device = Default::default();
        // 109 -> floor 54, ceil 54 (exact); 54 -> floor 26, ceil 27
        let x = Tensor::<TestBackend, 4>::ones([1, 1, 54, 54], &device);
        let padded = pad_for_ceil_mode(x, 3, 2, 0);
        assert_eq!(padded.dims(), [1, 1, 55, 55]);

        let pool = MaxPool2dConfig::new([3, 3]).with_strides([2, 2]).init();
        let out = pool.forward(padded);
        assert_eq!(out.dims(), [1, 1, 27, 27]);
        let values: Vec<f32> = out.into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| *v == 1.0));

        let exact = Tensor::<TestBackend, 4>::ones([1, 1, 7, 7], &device);
        assert_eq!(pad_for_ceil_mode(exact, 3, 2, 0).dims(), [1, 1, 7, 7]);
    }

    #[test]
    fn test_head_helpers() {
        let device = Default::default();
        let fc = linear_head::<TestBackend>(16, 5, &device);
        assert_eq!(linear_in_features(&fc), 16);
        assert_eq!(linear_param_ids(&fc).len(), 2);

        let conv = conv_head::<TestBackend>(8, 3, &device);
        assert_eq!(conv_in_channels(&conv), 8);
        assert_eq!(conv_param_ids(&conv).len(), 2);
    }

    #[test]
    fn test_transform_input() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 1, 1], &device);
        let values: Vec<f32> = transform_input(x).into_data().to_vec().unwrap();
        assert!((values[0] - (0.485 - 0.5) / 0.5).abs() < 1e-6);
        assert!((values[2] - (0.406 - 0.5) / 0.5).abs() < 1e-6);
    }
}
