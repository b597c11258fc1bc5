//! DenseNet 121/161/169/201

use burn::{
    config::Config,
    module::{Module, ParamId},
    nn::{
        conv::Conv2d,
        pool::{AvgPool2d, AvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, Linear, PaddingConfig2d,
    },
    tensor::{activation::relu, backend::Backend, Tensor},
};

use super::layers::{batch_norm, conv2d, linear_head, linear_in_features, linear_param_ids};
use super::registry::ArchitectureSpec;
use super::{Architecture, ImageClassifier};
use crate::utils::FinetuneError;

/// Configuration for a DenseNet
#[derive(Config, Debug)]
pub struct DenseNetConfig {
    pub num_classes: usize,

    /// Channels added by each dense layer
    pub growth_rate: usize,

    /// Dense layers per block
    pub block_config: [usize; 4],

    /// Channels after the stem convolution
    pub num_init_features: usize,

    /// Bottleneck width multiplier
    #[config(default = "4")]
    pub bn_size: usize,
}

impl DenseNetConfig {
    pub fn named(name: &str, num_classes: usize) -> crate::utils::Result<Self> {
        match name {
            "densenet121" => Ok(Self::new(num_classes, 32, [6, 12, 24, 16], 64)),
            "densenet161" => Ok(Self::new(num_classes, 48, [6, 12, 36, 24], 96)),
            "densenet169" => Ok(Self::new(num_classes, 32, [6, 12, 32, 32], 64)),
            "densenet201" => Ok(Self::new(num_classes, 32, [6, 12, 48, 32], 64)),
            other => Err(FinetuneError::Model(format!("'{}' is not a DenseNet variant", other))),
        }
    }
}

#[derive(Module, Debug)]
pub struct DenseLayer<B: Backend> {
    pub norm1: BatchNorm<B>,
    pub conv1: Conv2d<B>,
    pub norm2: BatchNorm<B>,
    pub conv2: Conv2d<B>,
}

impl<B: Backend> DenseLayer<B> {
    fn new(in_channels: usize, growth_rate: usize, bn_size: usize, device: &B::Device) -> Self {
        let inner = bn_size * growth_rate;
        Self {
            norm1: batch_norm(in_channels, device),
            conv1: conv2d([in_channels, inner], 1, 1, 0, device),
            norm2: batch_norm(inner, device),
            conv2: conv2d([inner, growth_rate], 3, 1, 1, device),
        }
    }

    /// New feature maps only; the caller concatenates
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv1.forward(relu(self.norm1.forward(x)));
        self.conv2.forward(relu(self.norm2.forward(x)))
    }
}

#[derive(Module, Debug)]
pub struct DenseBlock<B: Backend> {
    pub layers: Vec<DenseLayer<B>>,
}

impl<B: Backend> DenseBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.layers.iter().fold(x, |features, layer| {
            let new = layer.forward(features.clone());
            Tensor::cat(vec![features, new], 1)
        })
    }
}

#[derive(Module, Debug)]
pub struct Transition<B: Backend> {
    pub norm: BatchNorm<B>,
    pub conv: Conv2d<B>,
    pub pool: AvgPool2d,
}

impl<B: Backend> Transition<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.pool.forward(self.conv.forward(relu(self.norm.forward(x))))
    }
}

#[derive(Module, Debug)]
pub struct DenseNet<B: Backend> {
    pub conv0: Conv2d<B>,
    pub norm0: BatchNorm<B>,
    pub pool0: MaxPool2d,
    pub blocks: Vec<DenseBlock<B>>,
    pub transitions: Vec<Transition<B>>,
    pub norm5: BatchNorm<B>,
    pub classifier: Linear<B>,
}

impl<B: Backend> DenseNet<B> {
    pub fn new(config: &DenseNetConfig, device: &B::Device) -> Self {
        let mut channels = config.num_init_features;
        let mut blocks = Vec::new();
        let mut transitions = Vec::new();

        for (i, &num_layers) in config.block_config.iter().enumerate() {
            let layers = (0..num_layers)
                .map(|l| DenseLayer::new(channels + l * config.growth_rate, config.growth_rate, config.bn_size, device))
                .collect();
            blocks.push(DenseBlock { layers });
            channels += num_layers * config.growth_rate;

            if i + 1 != config.block_config.len() {
                transitions.push(Transition {
                    norm: batch_norm(channels, device),
                    conv: conv2d([channels, channels / 2], 1, 1, 0, device),
                    pool: AvgPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
                });
                channels /= 2;
            }
        }

        Self {
            conv0: conv2d([3, config.num_init_features], 7, 2, 3, device),
            norm0: batch_norm(config.num_init_features, device),
            pool0: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            blocks,
            transitions,
            norm5: batch_norm(channels, device),
            classifier: linear_head(channels, config.num_classes, device),
        }
    }
}

impl<B: Backend> ImageClassifier<B> for DenseNet<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = self.pool0.forward(relu(self.norm0.forward(self.conv0.forward(images))));
        for (i, block) in self.blocks.iter().enumerate() {
            x = block.forward(x);
            if let Some(transition) = self.transitions.get(i) {
                x = transition.forward(x);
            }
        }

        let x = relu(self.norm5.forward(x));
        let x = x.mean_dim(3).mean_dim(2).flatten(1, 3);
        self.classifier.forward(x)
    }

    fn num_classes(&self) -> usize {
        self.classifier.weight.val().dims()[1]
    }

    fn head_param_ids(&self) -> Vec<ParamId> {
        linear_param_ids(&self.classifier)
    }
}

impl<B: Backend> Architecture<B> for DenseNet<B> {
    fn build(spec: &ArchitectureSpec, num_classes: usize, _pretrained: bool, device: &B::Device) -> crate::utils::Result<Self> {
        Ok(Self::new(&DenseNetConfig::named(spec.name, num_classes)?, device))
    }

    fn replace_head(mut self, num_classes: usize, device: &B::Device) -> Self {
        self.classifier = linear_head(linear_in_features(&self.classifier), num_classes, device);
        self
    }

    /// The published checkpoints still use the old `norm.1` style names
    fn key_remaps(spec: &ArchitectureSpec) -> Vec<(String, String)> {
        let mut remaps = vec![(
            r"^(.*denselayer\d+\.(?:norm|relu|conv))\.([12])\.".to_string(),
            "${1}${2}.".to_string(),
        )];

        let block_config = DenseNetConfig::named(spec.name, 1)
            .map(|c| c.block_config)
            .unwrap_or_default();
        for (b, &num_layers) in block_config.iter().enumerate() {
            for l in 0..num_layers {
                remaps.push((
                    format!(r"^features\.denseblock{}\.denselayer{}\.", b + 1, l + 1),
                    format!("blocks.{}.layers.{}.", b, l),
                ));
            }
            remaps.push((
                format!(r"^features\.transition{}\.", b + 1),
                format!("transitions.{}.", b),
            ));
        }

        for name in ["conv0", "norm0", "norm5"] {
            remaps.push((format!(r"^features\.{}\.", name), format!("{}.", name)));
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
    fn test_channel_bookkeeping() {
        let device = Default::default();
        let config = DenseNetConfig::named("densenet121", 7).unwrap();
        let model = DenseNet::<TestBackend>::new(&config, &device);

        assert_eq!(model.blocks.len(), 4);
        assert_eq!(model.transitions.len(), 3);
        assert_eq!(linear_in_features(&model.classifier), 1024);
        assert_eq!(model.num_classes(), 7);
    }

    #[test]
    fn test_small_forward() {
        let device = Default::default();
        let config = DenseNetConfig::new(3, 4, [1, 1, 1, 1], 8).with_bn_size(2);
        let model = DenseNet::<TestBackend>::new(&config, &device);
        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 64, 64], &device);
        assert_eq!(model.forward(x).dims(), [1, 3]);
    }

    #[test]
    fn test_old_key_fix() {
        let remaps = <DenseNet<TestBackend> as Architecture<_>>::key_remaps(
            crate::model::registry::lookup("densenet121").unwrap(),
        );
        let key = "features.denseblock2.denselayer3.norm.1.weight";
        let mut renamed = key.to_string();
        for (from, to) in &remaps {
            renamed = regex::Regex::new(from).unwrap().replace_all(&renamed, to.as_str()).to_string();
        }
        assert_eq!(renamed, "blocks.1.layers.2.norm1.weight");
    }
}
