//! SqueezeNet 1.0 and 1.1
//!
//! The classifier is a 1x1 convolution followed by global average pooling,
//! so the replaced head is a `Conv2d`, not a `Linear`.

use burn::{
    module::{Module, ParamId},
    nn::{
        conv::Conv2d,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig,
    },
    tensor::{activation::relu, backend::Backend, Tensor},
};

use super::layers::{conv2d_bias, conv_head, conv_in_channels, conv_param_ids, flatten, pad_for_ceil_mode};
use super::registry::ArchitectureSpec;
use super::{Architecture, ImageClassifier};
use crate::utils::{FinetuneError, Result};

#[derive(Module, Debug)]
pub struct Fire<B: Backend> {
    pub squeeze: Conv2d<B>,
    pub expand1x1: Conv2d<B>,
    pub expand3x3: Conv2d<B>,
}

impl<B: Backend> Fire<B> {
    fn new(in_channels: usize, squeeze: usize, expand1x1: usize, expand3x3: usize, device: &B::Device) -> Self {
        Self {
            squeeze: conv2d_bias([in_channels, squeeze], 1, 1, 0, device),
            expand1x1: conv2d_bias([squeeze, expand1x1], 1, 1, 0, device),
            expand3x3: conv2d_bias([squeeze, expand3x3], 3, 1, 1, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.squeeze.forward(x));
        Tensor::cat(
            vec![
                relu(self.expand1x1.forward(x.clone())),
                relu(self.expand3x3.forward(x)),
            ],
            1,
        )
    }
}

/// Fire module settings `(in, squeeze, expand)` and the fire indices followed
/// by a max pool
struct Variant {
    stem_channels: usize,
    stem_kernel: usize,
    fires: [(usize, usize, usize); 8],
    pool_after: &'static [usize],
    /// torchvision `features` index of each fire module
    torch_indices: [usize; 8],
}

const FIRES_1_0: [(usize, usize, usize); 8] = [
    (96, 16, 64),
    (128, 16, 64),
    (128, 32, 128),
    (256, 32, 128),
    (256, 48, 192),
    (384, 48, 192),
    (384, 64, 256),
    (512, 64, 256),
];

const FIRES_1_1: [(usize, usize, usize); 8] = [
    (64, 16, 64),
    (128, 16, 64),
    (128, 32, 128),
    (256, 32, 128),
    (256, 48, 192),
    (384, 48, 192),
    (384, 64, 256),
    (512, 64, 256),
];

fn variant(version: usize) -> Variant {
    if version == 10 {
        Variant {
            stem_channels: 96,
            stem_kernel: 7,
            fires: FIRES_1_0,
            pool_after: &[2, 6],
            torch_indices: [3, 4, 5, 7, 8, 9, 10, 12],
        }
    } else {
        Variant {
            stem_channels: 64,
            stem_kernel: 3,
            fires: FIRES_1_1,
            pool_after: &[1, 3],
            torch_indices: [3, 4, 6, 7, 9, 10, 11, 12],
        }
    }
}

fn parse_version(name: &str) -> Result<usize> {
    match name {
        "squeezenet1_0" => Ok(10),
        "squeezenet1_1" => Ok(11),
        other => Err(FinetuneError::Model(format!("'{}' is not a SqueezeNet variant", other))),
    }
}

#[derive(Module, Debug)]
pub struct SqueezeNet<B: Backend> {
    pub conv1: Conv2d<B>,
    pub fires: Vec<Fire<B>>,
    pub pool: MaxPool2d,
    pub dropout: Dropout,
    pub classifier: Conv2d<B>,
    pub avgpool: AdaptiveAvgPool2d,
    version: usize,
}

impl<B: Backend> SqueezeNet<B> {
    /// `version` is 10 for 1.0 and 11 for 1.1
    pub fn new(version: usize, num_classes: usize, device: &B::Device) -> Self {
        let variant = variant(version);
        Self {
            conv1: conv2d_bias([3, variant.stem_channels], variant.stem_kernel, 2, 0, device),
            fires: variant
                .fires
                .iter()
                .map(|&(input, squeeze, expand)| Fire::new(input, squeeze, expand, expand, device))
                .collect(),
            pool: MaxPool2dConfig::new([3, 3]).with_strides([2, 2]).init(),
            dropout: DropoutConfig::new(0.5).init(),
            classifier: conv_head(512, num_classes, device),
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            version,
        }
    }

    fn ceil_pool(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.pool.forward(pad_for_ceil_mode(x, 3, 2, 0))
    }
}

impl<B: Backend> ImageClassifier<B> for SqueezeNet<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let variant = variant(self.version);
        let mut x = self.ceil_pool(relu(self.conv1.forward(images)));
        for (i, fire) in self.fires.iter().enumerate() {
            x = fire.forward(x);
            if variant.pool_after.contains(&i) {
                x = self.ceil_pool(x);
            }
        }

        let x = relu(self.classifier.forward(self.dropout.forward(x)));
        flatten(self.avgpool.forward(x))
    }

    fn num_classes(&self) -> usize {
        self.classifier.weight.val().dims()[0]
    }

    fn head_param_ids(&self) -> Vec<ParamId> {
        conv_param_ids(&self.classifier)
    }
}

impl<B: Backend> Architecture<B> for SqueezeNet<B> {
    fn build(spec: &ArchitectureSpec, num_classes: usize, _pretrained: bool, device: &B::Device) -> Result<Self> {
        Ok(Self::new(parse_version(spec.name)?, num_classes, device))
    }

    fn replace_head(mut self, num_classes: usize, device: &B::Device) -> Self {
        self.classifier = conv_head(conv_in_channels(&self.classifier), num_classes, device);
        self
    }

    fn key_remaps(spec: &ArchitectureSpec) -> Vec<(String, String)> {
        let version = parse_version(spec.name).unwrap_or(11);
        let mut remaps = vec![
            (r"^features\.0\.".to_string(), "conv1.".to_string()),
            (r"^classifier\.1\.".to_string(), "classifier.".to_string()),
        ];
        for (fire, index) in variant(version).torch_indices.iter().enumerate() {
            remaps.push((format!(r"^features\.{}\.", index), format!("fires.{}.", fire)));
        }
        remaps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_forward_both_versions() {
        let device = Default::default();
        for version in [10, 11] {
            let model = SqueezeNet::<TestBackend>::new(version, 2, &device);
            let x = Tensor::<TestBackend, 4>::zeros([2, 3, 64, 64], &device);
            assert_eq!(model.forward(x).dims(), [2, 2]);
        }
    }

    #[test]
    fn test_replace_head_keeps_backbone() {
        let device = Default::default();
        let model = SqueezeNet::<TestBackend>::new(11, 1000, &device);
        let stem_id = model.conv1.weight.id.clone();
        let model = model.replace_head(5, &device);
        assert_eq!(model.num_classes(), 5);
        assert_eq!(model.conv1.weight.id, stem_id);
    }
}
